// SPDX-License-Identifier: GPL-3.0-or-later
// Distortion and scale kernels for the coordinate stack.
//
// Kernels transform interleaved (x, y) pairs in the normalized coordinate
// system, in place. The forward form of a model maps corrected coordinates
// to distorted ones (it simulates the defect); the inverse form undoes it.
// The coordinate stack always maps output coordinates to source sampling
// coordinates, so correcting a lens pushes the inverse form and simulating
// pushes the forward form.

use crate::calibration::DistortionModel;
use crate::modifier::Vectorization;

const NEWTON_EPS: f32 = 1e-6;
// Newton is quadratic but near-singular at the polynomial's turning radius
const MAX_NEWTON_ITERATIONS: usize = 15;
const MAX_FIXED_POINT_ITERATIONS: usize = 8;

#[derive(Clone, Debug)]
pub(crate) struct DistortionKernel {
    pub model: DistortionModel,
    pub terms: [f32; 5],
    /// Apply the inverse of the model (the correcting direction).
    pub inverse: bool,
    /// Nominal focal length in normalized units, for the ACM focal-length
    /// unit system.
    pub focal_norm: f32,
    pub vectorization: Vectorization,
}

impl DistortionKernel {
    pub fn apply(&self, iocoord: &mut [f32]) {
        match (self.model, self.inverse) {
            (DistortionModel::Poly3, false) => self.poly3_forward(iocoord),
            (DistortionModel::Poly3, true) => self.radial_newton(iocoord),
            (DistortionModel::Poly5, false) => self.poly5_forward(iocoord),
            (DistortionModel::Poly5, true) => self.radial_newton(iocoord),
            (DistortionModel::PtLens, false) => self.ptlens_forward(iocoord),
            (DistortionModel::PtLens, true) => self.radial_newton(iocoord),
            (DistortionModel::Acm, false) => self.acm_forward(iocoord),
            (DistortionModel::Acm, true) => self.acm_inverse(iocoord),
            (DistortionModel::None, _) => { }
        }
    }

    /// `r_d = r_u * (1 - k1 + k1 * r_u^2)`
    fn poly3_forward(&self, iocoord: &mut [f32]) {
        let k1 = self.terms[0];
        let one_minus_k1 = 1.0 - k1;

        let rest = if self.vectorization == Vectorization::Wide4 {
            let mut chunks = iocoord.chunks_exact_mut(8);
            for quad in &mut chunks {
                let mut poly = [0.0f32; 4];
                for l in 0..4 {
                    let (x, y) = (quad[l * 2], quad[l * 2 + 1]);
                    poly[l] = one_minus_k1 + k1 * (x * x + y * y);
                }
                for l in 0..4 {
                    quad[l * 2] *= poly[l];
                    quad[l * 2 + 1] *= poly[l];
                }
            }
            chunks.into_remainder()
        } else {
            iocoord
        };
        for pair in rest.chunks_exact_mut(2) {
            let poly = one_minus_k1 + k1 * (pair[0] * pair[0] + pair[1] * pair[1]);
            pair[0] *= poly;
            pair[1] *= poly;
        }
    }

    /// `r_d = r_u * (1 + k1 * r_u^2 + k2 * r_u^4)`
    fn poly5_forward(&self, iocoord: &mut [f32]) {
        let (k1, k2) = (self.terms[0], self.terms[1]);

        let rest = if self.vectorization == Vectorization::Wide4 {
            let mut chunks = iocoord.chunks_exact_mut(8);
            for quad in &mut chunks {
                let mut poly = [0.0f32; 4];
                for l in 0..4 {
                    let (x, y) = (quad[l * 2], quad[l * 2 + 1]);
                    let r2 = x * x + y * y;
                    poly[l] = 1.0 + r2 * (k1 + r2 * k2);
                }
                for l in 0..4 {
                    quad[l * 2] *= poly[l];
                    quad[l * 2 + 1] *= poly[l];
                }
            }
            chunks.into_remainder()
        } else {
            iocoord
        };
        for pair in rest.chunks_exact_mut(2) {
            let r2 = pair[0] * pair[0] + pair[1] * pair[1];
            let poly = 1.0 + r2 * (k1 + r2 * k2);
            pair[0] *= poly;
            pair[1] *= poly;
        }
    }

    /// `r_d = r_u * (a * r_u^3 + b * r_u^2 + c * r_u + 1 - a - b - c)`
    fn ptlens_forward(&self, iocoord: &mut [f32]) {
        let (a, b, c) = (self.terms[0], self.terms[1], self.terms[2]);
        let d = 1.0 - a - b - c;

        let rest = if self.vectorization == Vectorization::Wide4 {
            let mut chunks = iocoord.chunks_exact_mut(8);
            for quad in &mut chunks {
                let mut poly = [0.0f32; 4];
                for l in 0..4 {
                    let (x, y) = (quad[l * 2], quad[l * 2 + 1]);
                    let r2 = x * x + y * y;
                    let r = r2.sqrt();
                    poly[l] = d + r * (c + r * (b + r * a));
                }
                for l in 0..4 {
                    quad[l * 2] *= poly[l];
                    quad[l * 2 + 1] *= poly[l];
                }
            }
            chunks.into_remainder()
        } else {
            iocoord
        };
        for pair in rest.chunks_exact_mut(2) {
            let r = (pair[0] * pair[0] + pair[1] * pair[1]).sqrt();
            let poly = d + r * (c + r * (b + r * a));
            pair[0] *= poly;
            pair[1] *= poly;
        }
    }

    /// Forward radial polynomial `r_d = r * factor(r)` and its derivative,
    /// shared by the Newton inverse of the three radial models.
    fn radial_eval(&self, r: f32) -> (f32, f32) {
        match self.model {
            DistortionModel::Poly3 => {
                let k1 = self.terms[0];
                (r * (1.0 - k1 + k1 * r * r), 1.0 - k1 + 3.0 * k1 * r * r)
            }
            DistortionModel::Poly5 => {
                let (k1, k2) = (self.terms[0], self.terms[1]);
                let r2 = r * r;
                (r * (1.0 + r2 * (k1 + r2 * k2)), 1.0 + r2 * (3.0 * k1 + 5.0 * k2 * r2))
            }
            DistortionModel::PtLens => {
                let (a, b, c) = (self.terms[0], self.terms[1], self.terms[2]);
                let d = 1.0 - a - b - c;
                (r * (d + r * (c + r * (b + r * a))), d + r * (2.0 * c + r * (3.0 * b + 4.0 * a * r)))
            }
            _ => (r, 1.0),
        }
    }

    /// Invert the radial polynomial by Newton iteration starting from the
    /// distorted radius. Non-convergence keeps the last iterate; output
    /// stays continuous, with possible small artifacts at extreme radii.
    fn radial_newton(&self, iocoord: &mut [f32]) {
        for pair in iocoord.chunks_exact_mut(2) {
            let rd = (pair[0] * pair[0] + pair[1] * pair[1]).sqrt();
            if rd == 0.0 {
                continue;
            }
            let mut ru = rd;
            for _ in 0..MAX_NEWTON_ITERATIONS {
                let (f, df) = self.radial_eval(ru);
                let delta = (f - rd) / df;
                if !delta.is_finite() {
                    break;
                }
                ru -= delta;
                if delta.abs() < NEWTON_EPS {
                    break;
                }
            }
            let ratio = ru / rd;
            pair[0] *= ratio;
            pair[1] *= ratio;
        }
    }

    /// Adobe camera model, vectorial, in focal-length units:
    /// `x_d = x (1 + k1 r^2 + k2 r^4 + k3 r^6) + 2x(k4 y + k5 x) + k5 r^2`
    /// `y_d = y (1 + k1 r^2 + k2 r^4 + k3 r^6) + 2y(k4 y + k5 x) + k4 r^2`
    fn acm_forward(&self, iocoord: &mut [f32]) {
        let [k1, k2, k3, k4, k5] = self.terms;
        let inv_f = 1.0 / self.focal_norm;

        for pair in iocoord.chunks_exact_mut(2) {
            let x = pair[0] * inv_f;
            let y = pair[1] * inv_f;
            let r2 = x * x + y * y;
            let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
            let tangential = 2.0 * (k4 * y + k5 * x);
            pair[0] = (x * radial + x * tangential + k5 * r2) * self.focal_norm;
            pair[1] = (y * radial + y * tangential + k4 * r2) * self.focal_norm;
        }
    }

    fn acm_inverse(&self, iocoord: &mut [f32]) {
        let [k1, k2, k3, k4, k5] = self.terms;
        let inv_f = 1.0 / self.focal_norm;

        if k4 == 0.0 && k5 == 0.0 {
            // Purely radial, invert with Newton like the other polynomials
            for pair in iocoord.chunks_exact_mut(2) {
                let xd = pair[0] * inv_f;
                let yd = pair[1] * inv_f;
                let rd = (xd * xd + yd * yd).sqrt();
                if rd == 0.0 {
                    continue;
                }
                let mut ru = rd;
                for _ in 0..MAX_NEWTON_ITERATIONS {
                    let r2 = ru * ru;
                    let f = ru * (1.0 + r2 * (k1 + r2 * (k2 + r2 * k3)));
                    let df = 1.0 + r2 * (3.0 * k1 + r2 * (5.0 * k2 + 7.0 * k3 * r2));
                    let delta = (f - rd) / df;
                    if !delta.is_finite() {
                        break;
                    }
                    ru -= delta;
                    if delta.abs() < NEWTON_EPS {
                        break;
                    }
                }
                let ratio = ru / rd;
                pair[0] *= ratio;
                pair[1] *= ratio;
            }
            return;
        }

        // Tangential terms present: capped fixed-point on the vector form
        for pair in iocoord.chunks_exact_mut(2) {
            let xd = pair[0] * inv_f;
            let yd = pair[1] * inv_f;
            let mut x = xd;
            let mut y = yd;
            for _ in 0..MAX_FIXED_POINT_ITERATIONS {
                let r2 = x * x + y * y;
                let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
                let tangential = 2.0 * (k4 * y + k5 * x);
                let nx = (xd - x * tangential - k5 * r2) / radial;
                let ny = (yd - y * tangential - k4 * r2) / radial;
                let delta = (nx - x).abs().max((ny - y).abs());
                x = nx;
                y = ny;
                if delta < NEWTON_EPS {
                    break;
                }
            }
            pair[0] = x * self.focal_norm;
            pair[1] = y * self.focal_norm;
        }
    }
}

/// Plain multiplicative scaling of the coordinates. For correction the
/// stored factor is the reciprocal of the user-visible scale, so scale > 1
/// zooms in.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ScaleKernel {
    pub factor: f32,
}

impl ScaleKernel {
    pub fn apply(&self, iocoord: &mut [f32]) {
        for v in iocoord.iter_mut() {
            *v *= self.factor;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel(model: DistortionModel, terms: [f32; 5], inverse: bool) -> DistortionKernel {
        DistortionKernel { model, terms, inverse, focal_norm: 1.5, vectorization: Vectorization::Scalar }
    }

    fn round_trip_max_error(model: DistortionModel, terms: [f32; 5]) -> f32 {
        let fwd = kernel(model, terms, false);
        let inv = kernel(model, terms, true);
        let mut max_err = 0.0f32;
        for i in 0..=28 {
            let r = i as f32 * 0.05;
            let mut coord = [r * 0.8, r * 0.6];
            fwd.apply(&mut coord);
            inv.apply(&mut coord);
            max_err = max_err.max((coord[0] - r * 0.8).abs()).max((coord[1] - r * 0.6).abs());
        }
        max_err
    }

    #[test]
    fn forward_then_inverse_is_identity() {
        for k1 in [-0.2f32, -0.1, 0.05, 0.2] {
            let err = round_trip_max_error(DistortionModel::Poly3, [k1, 0.0, 0.0, 0.0, 0.0]);
            assert!(err < 1e-5, "poly3 k1={k1} err={err}");

            let err = round_trip_max_error(DistortionModel::Poly5, [k1, 0.02, 0.0, 0.0, 0.0]);
            assert!(err < 1e-5, "poly5 k1={k1} err={err}");
        }
        // ACM radii are in focal-length units; k1 = -0.2 would put the
        // model's turning radius inside the test range, where no inverse
        // exists at all.
        for k1 in [-0.15f32, -0.1, 0.05, 0.2] {
            let err = round_trip_max_error(DistortionModel::Acm, [k1, 0.0, 0.0, 0.0, 0.0]);
            assert!(err < 1e-5, "acm k1={k1} err={err}");
        }
        let err = round_trip_max_error(DistortionModel::PtLens, [-0.1, 0.02, 0.01, 0.0, 0.0]);
        assert!(err < 1e-5, "ptlens err={err}");
    }

    #[test]
    fn acm_with_tangential_terms_round_trips() {
        let terms = [0.05, -0.01, 0.0, 0.003, -0.002];
        let fwd = kernel(DistortionModel::Acm, terms, false);
        let inv = kernel(DistortionModel::Acm, terms, true);
        let mut coord = [0.7, -0.4];
        fwd.apply(&mut coord);
        inv.apply(&mut coord);
        assert!((coord[0] - 0.7).abs() < 1e-4 && (coord[1] + 0.4).abs() < 1e-4, "{coord:?}");
    }

    #[test]
    fn zero_coefficients_are_identity() {
        for model in [DistortionModel::Poly3, DistortionModel::Poly5, DistortionModel::PtLens, DistortionModel::Acm] {
            for inverse in [false, true] {
                let k = kernel(model, [0.0; 5], inverse);
                let mut coord = [0.3, -0.9];
                k.apply(&mut coord);
                assert!((coord[0] - 0.3).abs() < 1e-6 && (coord[1] + 0.9).abs() < 1e-6, "{model:?} {inverse}");
            }
        }
    }

    #[test]
    fn wide4_matches_scalar() {
        let terms = [0.08, -0.02, 0.01, 0.0, 0.0];
        for model in [DistortionModel::Poly3, DistortionModel::Poly5, DistortionModel::PtLens] {
            let scalar = DistortionKernel {
                model, terms, inverse: false, focal_norm: 1.0, vectorization: Vectorization::Scalar,
            };
            let wide = DistortionKernel { vectorization: Vectorization::Wide4, ..scalar.clone() };

            let src: Vec<f32> = (0..22).map(|i| (i as f32 * 0.09) - 1.0).collect();
            let mut a = src.clone();
            let mut b = src.clone();
            scalar.apply(&mut a);
            wide.apply(&mut b);
            for (x, y) in a.iter().zip(&b) {
                assert!((x - y).abs() < 1e-6, "{model:?}: {x} != {y}");
            }
        }
    }

    #[test]
    fn center_is_a_fixed_point() {
        for inverse in [false, true] {
            let k = kernel(DistortionModel::PtLens, [-0.1, 0.0, 0.0, 0.0, 0.0], inverse);
            let mut coord = [0.0, 0.0];
            k.apply(&mut coord);
            assert_eq!(coord, [0.0, 0.0]);
        }
    }

    #[test]
    fn scale_kernel_composes_to_identity() {
        let double = ScaleKernel { factor: 1.0 / 2.0 };
        let half = ScaleKernel { factor: 1.0 / 0.5 };
        let mut coord = [0.4, -0.7];
        double.apply(&mut coord);
        half.apply(&mut coord);
        assert!((coord[0] - 0.4).abs() < 1e-6 && (coord[1] + 0.7).abs() < 1e-6);
    }

    #[test]
    fn barrel_correction_pushes_samples_outward() {
        // Correcting barrel distortion must sample the source at a larger
        // radius than the output position, which is what forces autoscale
        // above 1.
        let inv = kernel(DistortionModel::PtLens, [-0.1, 0.0, 0.0, 0.0, 0.0], true);
        let mut coord = [1.1, 0.0];
        inv.apply(&mut coord);
        assert!(coord[0] > 1.1, "corrected sample at {}", coord[0]);
    }
}
