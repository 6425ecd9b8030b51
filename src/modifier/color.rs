// SPDX-License-Identifier: GPL-3.0-or-later
// Vignetting kernels for the color stack.
//
// The color stack operates in place on strips of pixels. Coordinates arrive
// in the normalized system; the kernel pre-scales them into the model's own
// unit (half-diagonal of the calibration sensor for PA, focal lengths for
// ACM) at construction time.

use crate::calibration::VignettingModel;
use crate::modifier::Vectorization;
use crate::pixels::{ ComponentRole, PixelScalar, unpack_roles };

#[derive(Clone, Debug)]
pub(crate) struct VignettingKernel {
    pub model: VignettingModel,
    pub terms: [f32; 3],
    /// Simulate vignetting instead of correcting it.
    pub inverse: bool,
    /// Normalized coordinates -> model units.
    pub coord_scale: f32,
    pub vectorization: Vectorization,
}

impl VignettingKernel {
    /// Brightness gain at squared model-unit radius `r2`. Correction
    /// brightens where the lens darkened; simulation is the reciprocal.
    #[inline]
    fn gain(&self, r2: f32) -> f32 {
        let [k1, k2, k3] = self.terms;
        let poly = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
        match (self.model, self.inverse) {
            (VignettingModel::Pa, false) => 1.0 / poly,
            (VignettingModel::Pa, true) => poly,
            (VignettingModel::Acm, false) => poly,
            (VignettingModel::Acm, true) => 1.0 / poly,
            (VignettingModel::None, _) => 1.0,
        }
    }

    /// Process one strip of `count` pattern instances starting at the
    /// normalized coordinate (x, y). `step` is the normalized width of one
    /// pixel; a `Next` role advances the coordinate inside a pattern, which
    /// is how Bayer rows are described.
    pub fn apply_strip<T: PixelScalar>(
        &self, x: f32, y: f32, step: f32,
        pixels: &mut [T], comp_role: u32, count: usize,
    ) {
        let mut roles = [ComponentRole::End; 8];
        let n_roles = unpack_roles(comp_role, &mut roles);
        let roles = &roles[..n_roles];
        if roles.is_empty() {
            return;
        }

        let mut x = x * self.coord_scale;
        let y = y * self.coord_scale;
        let step = step * self.coord_scale;
        let y2 = y * y;

        let simple = !roles.contains(&ComponentRole::Next);

        let mut idx = 0usize;
        if simple && self.vectorization == Vectorization::Wide4 {
            let mut remaining = count;
            while remaining >= 4 {
                let mut gains = [0.0f32; 4];
                for (l, g) in gains.iter_mut().enumerate() {
                    let xl = x + step * l as f32;
                    *g = self.gain(xl * xl + y2);
                }
                for g in gains {
                    for role in roles {
                        if idx >= pixels.len() {
                            return;
                        }
                        if *role != ComponentRole::Unknown {
                            pixels[idx] = T::from_f32(pixels[idx].to_f32() * g);
                        }
                        idx += 1;
                    }
                }
                x += step * 4.0;
                remaining -= 4;
            }
            for _ in 0..remaining {
                let g = self.gain(x * x + y2);
                for role in roles {
                    if idx >= pixels.len() {
                        return;
                    }
                    if *role != ComponentRole::Unknown {
                        pixels[idx] = T::from_f32(pixels[idx].to_f32() * g);
                    }
                    idx += 1;
                }
                x += step;
            }
            return;
        }

        for _ in 0..count {
            let mut g = self.gain(x * x + y2);
            for role in roles {
                match role {
                    ComponentRole::Next => {
                        x += step;
                        g = self.gain(x * x + y2);
                    }
                    ComponentRole::Unknown => {
                        idx += 1;
                    }
                    ComponentRole::Red | ComponentRole::Green
                    | ComponentRole::Blue | ComponentRole::Intensity => {
                        if idx >= pixels.len() {
                            return;
                        }
                        pixels[idx] = T::from_f32(pixels[idx].to_f32() * g);
                        idx += 1;
                    }
                    ComponentRole::End => { }
                }
            }
            x += step;
        }
    }
}
