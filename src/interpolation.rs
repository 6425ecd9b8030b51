// SPDX-License-Identifier: GPL-3.0-or-later
// Interpolation of calibration samples over focal length (spline) and over
// (focal, aperture, distance) for vignetting (inverse distance weighting)

use crate::calibration::*;
use crate::lens::Lens;
use crate::math::{ hermite_interpolate, SPLINE_MISSING };

/// The two closest samples below and the two closest above a query focal
/// length. Missing slots keep the `f32::MAX` distance sentinel.
struct SplineNeighbors<'a, T> {
    entries: [Option<&'a T>; 4],
    dist: [f32; 4],
}

impl<'a, T> SplineNeighbors<'a, T> {
    fn new() -> Self {
        Self { entries: [None; 4], dist: [-f32::MAX, -f32::MAX, f32::MAX, f32::MAX] }
    }

    /// `df` is `query_focal - sample_focal`: negative when the sample lies
    /// above the query.
    fn insert(&mut self, df: f32, value: &'a T) {
        if df < 0.0 {
            if df > self.dist[1] {
                self.dist[0] = self.dist[1];
                self.dist[1] = df;
                self.entries[0] = self.entries[1];
                self.entries[1] = Some(value);
            } else if df > self.dist[0] {
                self.dist[0] = df;
                self.entries[0] = Some(value);
            }
        } else if df < self.dist[2] {
            self.dist[3] = self.dist[2];
            self.dist[2] = df;
            self.entries[3] = self.entries[2];
            self.entries[2] = Some(value);
        } else if df < self.dist[3] {
            self.dist[3] = df;
            self.entries[3] = Some(value);
        }
    }

    /// The interpolation bracket, or the nearest single sample when only one
    /// side of the query has samples.
    fn bracket(&self) -> Bracket<'a, T> {
        match (self.entries[1], self.entries[2]) {
            (Some(below), Some(above)) => Bracket::Pair {
                outer_below: self.entries[0],
                below,
                above,
                outer_above: self.entries[3],
            },
            (Some(single), None) | (None, Some(single)) => Bracket::Single(single),
            (None, None) => Bracket::Empty,
        }
    }
}

enum Bracket<'a, T> {
    Pair { outer_below: Option<&'a T>, below: &'a T, above: &'a T, outer_above: Option<&'a T> },
    Single(&'a T),
    Empty,
}

/// Which correction family a coefficient belongs to; selects the
/// parameter-axis rescaling.
#[derive(Clone, Copy)]
enum ScaledModel {
    Distortion(DistortionModel),
    Tca(TcaModel),
    Vignetting(VignettingModel),
}

/// Rescale the parameter axis so that coefficient slopes over focal length
/// are close to linear before spline/IDW interpolation.
///
/// `values` holds focal lengths on input and the multiplicative scale
/// factors on output. Coefficients are multiplied by the factor at every
/// sample site and divided by the factor at the query focal afterwards.
fn parameter_scales(values: &mut [f32], model: ScaledModel, index: usize) {
    match model {
        ScaledModel::Distortion(m) => match m {
            // 1/f slopes, countered by the plain focal factor
            DistortionModel::Poly3 | DistortionModel::Poly5 | DistortionModel::PtLens => { }
            DistortionModel::Acm => {
                // The ACM coordinate system scales with the focal length, so
                // k_i grows with f^(2(i+1)); undo it on top of the f factor.
                let exponent = if index < 3 { 2.0 * (index as f32 + 1.0) } else { 1.0 };
                for v in values.iter_mut() {
                    *v /= v.powf(exponent);
                }
            }
            DistortionModel::None => { }
        },
        ScaledModel::Tca(m) => match m {
            TcaModel::Linear | TcaModel::Poly3 => {
                // The constant-near-1 terms stay constant over focal length.
                if index < 2 {
                    for v in values.iter_mut() { *v = 1.0; }
                }
            }
            TcaModel::Acm => {
                let exponent = if (2..8).contains(&index) { (index / 2 * 2) as f32 } else { 1.0 };
                for v in values.iter_mut() {
                    *v /= v.powf(exponent);
                }
            }
            TcaModel::None => { }
        },
        ScaledModel::Vignetting(m) => match m {
            VignettingModel::Pa => {
                for v in values.iter_mut() { *v = 1.0; }
            }
            VignettingModel::Acm => {
                let exponent = 2.0 * (index as f32 + 1.0);
                for v in values.iter_mut() { *v = 1.0 / v.powf(exponent); }
            }
            VignettingModel::None => { }
        },
    }
}

/// Interpolate one coefficient across the four-point bracket with parameter
/// rescaling applied at each sample site and undone at the query focal.
#[allow(clippy::too_many_arguments)]
fn interpolate_term(
    outer_below: Option<(f32, f32)>, below: (f32, f32), above: (f32, f32),
    outer_above: Option<(f32, f32)>, focal: f32, t: f32, model: ScaledModel, index: usize,
) -> f32 {
    let mut scales = [
        outer_below.map(|(f, _)| f).unwrap_or(f32::NAN),
        below.0,
        above.0,
        outer_above.map(|(f, _)| f).unwrap_or(f32::NAN),
        focal,
    ];
    parameter_scales(&mut scales, model, index);

    hermite_interpolate(
        outer_below.map(|(_, y)| y * scales[0]).unwrap_or(SPLINE_MISSING),
        below.1 * scales[1],
        above.1 * scales[2],
        outer_above.map(|(_, y)| y * scales[3]).unwrap_or(SPLINE_MISSING),
        t,
    ) / scales[4]
}

impl Lens {
    /// Interpolate the distortion model at the given focal length.
    ///
    /// Only samples of the first encountered model kind take part. An exact
    /// focal match is returned verbatim. Returns `None` when the lens has no
    /// usable distortion calibration.
    pub fn interpolate_distortion(&self, focal: f32) -> Option<LensCalibDistortion> {
        let mut neighbors = SplineNeighbors::new();
        let mut model = DistortionModel::None;

        for c in &self.calib_distortion {
            if c.model == DistortionModel::None {
                continue;
            }
            if model == DistortionModel::None {
                model = c.model;
            } else if model != c.model {
                continue;
            }

            let df = focal - c.focal;
            if df == 0.0 {
                return Some(*c);
            }
            neighbors.insert(df, c);
        }

        match neighbors.bracket() {
            Bracket::Pair { outer_below, below, above, outer_above } => {
                let t = (focal - below.focal) / (above.focal - below.focal);
                let mut res = LensCalibDistortion {
                    model,
                    focal,
                    real_focal: hermite_interpolate(
                        outer_below.map(|c| c.real_focal).unwrap_or(SPLINE_MISSING),
                        below.real_focal,
                        above.real_focal,
                        outer_above.map(|c| c.real_focal).unwrap_or(SPLINE_MISSING),
                        t,
                    ),
                    real_focal_measured: below.real_focal_measured && above.real_focal_measured,
                    terms: [0.0; 5],
                };
                for i in 0..res.terms.len() {
                    res.terms[i] = interpolate_term(
                        outer_below.map(|c| (c.focal, c.terms[i])),
                        (below.focal, below.terms[i]),
                        (above.focal, above.terms[i]),
                        outer_above.map(|c| (c.focal, c.terms[i])),
                        focal, t, ScaledModel::Distortion(model), i,
                    );
                }
                Some(res)
            }
            Bracket::Single(c) => Some(*c),
            Bracket::Empty => None,
        }
    }

    /// Interpolate the TCA model at the given focal length.
    pub fn interpolate_tca(&self, focal: f32) -> Option<LensCalibTca> {
        let mut neighbors = SplineNeighbors::new();
        let mut model = TcaModel::None;

        for c in &self.calib_tca {
            if c.model == TcaModel::None {
                continue;
            }
            if model == TcaModel::None {
                model = c.model;
            } else if model != c.model {
                continue;
            }

            let df = focal - c.focal;
            if df == 0.0 {
                return Some(*c);
            }
            neighbors.insert(df, c);
        }

        match neighbors.bracket() {
            Bracket::Pair { outer_below, below, above, outer_above } => {
                let t = (focal - below.focal) / (above.focal - below.focal);
                let mut res = LensCalibTca { model, focal, terms: [0.0; 12] };
                for i in 0..res.terms.len() {
                    res.terms[i] = interpolate_term(
                        outer_below.map(|c| (c.focal, c.terms[i])),
                        (below.focal, below.terms[i]),
                        (above.focal, above.terms[i]),
                        outer_above.map(|c| (c.focal, c.terms[i])),
                        focal, t, ScaledModel::Tca(model), i,
                    );
                }
                Some(res)
            }
            Bracket::Single(c) => Some(*c),
            Bracket::Empty => None,
        }
    }

    /// Interpolate the vignetting model at the given focal length, aperture
    /// and focus distance by inverse distance weighting over all samples of
    /// the first encountered model kind.
    pub fn interpolate_vignetting(
        &self, focal: f32, aperture: f32, distance: f32,
    ) -> Option<LensCalibVignetting> {
        const POWER: f32 = 3.5;

        let mut model = VignettingModel::None;
        let mut res = LensCalibVignetting {
            model, focal, aperture, distance, terms: [0.0; 3],
        };

        let mut total_weight = 0.0f32;
        let mut smallest_distance = f32::MAX;

        for c in &self.calib_vignetting {
            if c.model == VignettingModel::None {
                continue;
            }
            if model == VignettingModel::None {
                model = c.model;
                res.model = model;
            } else if model != c.model {
                continue;
            }

            let d = self.vignetting_distance(c, focal, aperture, distance);
            if d < 1e-4 {
                return Some(*c);
            }
            smallest_distance = smallest_distance.min(d);

            let weight = (1.0 / d.powf(POWER)).abs();
            for i in 0..res.terms.len() {
                let mut scale = [c.focal];
                parameter_scales(&mut scale, ScaledModel::Vignetting(model), i);
                res.terms[i] += weight * c.terms[i] * scale[0];
            }
            total_weight += weight;
        }

        if smallest_distance > 1.0 {
            return None;
        }

        if total_weight > 0.0 && smallest_distance < f32::MAX {
            for i in 0..res.terms.len() {
                let mut scale = [focal];
                parameter_scales(&mut scale, ScaledModel::Vignetting(model), i);
                res.terms[i] /= total_weight * scale[0];
            }
            Some(res)
        } else {
            None
        }
    }

    /// Distance between a vignetting sample and a query, with every axis
    /// translated to a roughly linear 0..1 scale: focal relative to the
    /// lens range, aperture and distance on reciprocal axes.
    fn vignetting_distance(
        &self, c: &LensCalibVignetting, focal: f32, aperture: f32, distance: f32,
    ) -> f32 {
        let mut f1 = focal - self.min_focal;
        let mut f2 = c.focal - self.min_focal;
        let df = self.max_focal - self.min_focal;
        if df != 0.0 {
            f1 /= df;
            f2 /= df;
        }
        let a1 = 4.0 / aperture;
        let a2 = 4.0 / c.aperture;
        let d1 = 0.1 / distance;
        let d2 = 0.1 / c.distance;

        ((f2 - f1).powi(2) + (a2 - a1).powi(2) + (d2 - d1).powi(2)).sqrt()
    }

    /// Interpolate the crop area at the given focal length.
    pub fn interpolate_crop(&self, focal: f32) -> Option<LensCalibCrop> {
        let mut neighbors = SplineNeighbors::new();
        let mut mode = CropMode::None;

        for c in &self.calib_crop {
            if c.mode == CropMode::None {
                continue;
            }
            if mode == CropMode::None {
                mode = c.mode;
            } else if mode != c.mode {
                continue;
            }

            let df = focal - c.focal;
            if df == 0.0 {
                return Some(*c);
            }
            neighbors.insert(df, c);
        }

        match neighbors.bracket() {
            Bracket::Pair { outer_below, below, above, outer_above } => {
                let t = (focal - below.focal) / (above.focal - below.focal);
                let mut res = LensCalibCrop { focal, mode, crop: [0.0; 4] };
                for i in 0..res.crop.len() {
                    res.crop[i] = hermite_interpolate(
                        outer_below.map(|c| c.crop[i]).unwrap_or(SPLINE_MISSING),
                        below.crop[i],
                        above.crop[i],
                        outer_above.map(|c| c.crop[i]).unwrap_or(SPLINE_MISSING),
                        t,
                    );
                }
                Some(res)
            }
            Bracket::Single(c) => Some(*c),
            Bracket::Empty => None,
        }
    }

    /// Interpolate the deprecated field-of-view data at the given focal
    /// length.
    pub fn interpolate_fov(&self, focal: f32) -> Option<LensCalibFov> {
        let mut neighbors = SplineNeighbors::new();
        let mut found = false;

        for c in &self.calib_fov {
            if c.field_of_view == 0.0 {
                continue;
            }
            found = true;

            let df = focal - c.focal;
            if df == 0.0 {
                return Some(*c);
            }
            neighbors.insert(df, c);
        }
        if !found {
            return None;
        }

        match neighbors.bracket() {
            Bracket::Pair { outer_below, below, above, outer_above } => {
                let t = (focal - below.focal) / (above.focal - below.focal);
                Some(LensCalibFov {
                    focal,
                    field_of_view: hermite_interpolate(
                        outer_below.map(|c| c.field_of_view).unwrap_or(SPLINE_MISSING),
                        below.field_of_view,
                        above.field_of_view,
                        outer_above.map(|c| c.field_of_view).unwrap_or(SPLINE_MISSING),
                        t,
                    ),
                })
            }
            Bracket::Single(c) => Some(*c),
            Bracket::Empty => None,
        }
    }
}
