// SPDX-License-Identifier: GPL-3.0-or-later
// Calibration sample records and the model enumerations they are tagged with

use serde::{ Deserialize, Serialize };

/// Geometric distortion models.
///
/// `r_d` is the distorted radius, `r_u` the corrected one, both in the
/// normalized coordinate system (unit = half the longest image side of the
/// calibration sensor). The ACM model instead measures everything in units
/// of the focal length.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistortionModel {
    #[default]
    None,
    /// `r_d = r_u * (1 - k1 + k1 * r_u^2)`
    Poly3,
    /// `r_d = r_u * (1 + k1 * r_u^2 + k2 * r_u^4)`
    Poly5,
    /// `r_d = r_u * (a * r_u^3 + b * r_u^2 + c * r_u + 1 - a - b - c)`
    PtLens,
    /// Adobe camera model, vectorial with tangential terms k4/k5.
    Acm,
}

/// Transversal chromatic aberration models. The green channel is always the
/// identity; the terms describe the red and blue channels separately.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TcaModel {
    #[default]
    None,
    /// `r_d = k * r_u` per channel. Terms: `[kr, kb]`.
    Linear,
    /// `r_d = r_u * (b r_u^2 + c r_u + v)` per channel.
    /// Terms: `[vr, vb, cr, cb, br, bb]`.
    Poly3,
    /// Adobe camera model for TCA.
    /// Terms interleaved: `[a0, b0, a1, b1, ..., a5, b5]`.
    Acm,
}

/// Vignetting models. PA radii use the calibration sensor's half-diagonal as
/// the unit, ACM uses focal-length units.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VignettingModel {
    #[default]
    None,
    /// Pablo D'Angelo model, generalized cos^4 law.
    Pa,
    /// Adobe's vignetting model.
    Acm,
}

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropMode {
    #[default]
    None,
    Rectangle,
    Circle,
}

/// Distortion calibration sample, measured at one focal length.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LensCalibDistortion {
    pub model: DistortionModel,
    /// Nominal focal length in mm at which this sample was measured.
    pub focal: f32,
    /// Paraxial focal length in mm. 0 means "unset"; the default is resolved
    /// on insertion into a lens (see [`LensCalibDistortion::with_default_real_focal`]).
    pub real_focal: f32,
    /// Whether `real_focal` was actually measured rather than derived.
    pub real_focal_measured: bool,
    /// Model coefficients: `[k1]`, `[k1, k2]`, `[a, b, c]` or `[k1..k5]`.
    pub terms: [f32; 5],
}

impl Default for LensCalibDistortion {
    fn default() -> Self {
        Self {
            model: DistortionModel::None,
            focal: 0.0,
            real_focal: 0.0,
            real_focal_measured: false,
            terms: [0.0; 5],
        }
    }
}

impl LensCalibDistortion {
    /// Resolve an unset `real_focal`. The default is the nominal focal
    /// length, except for the Hugin-fitted polynomial models where it is the
    /// nominal focal length multiplied by the linear term of the polynomial,
    /// because that paraxial length is what Hugin assumes in its fit.
    pub fn with_default_real_focal(mut self) -> Self {
        if self.real_focal <= 0.0 {
            self.real_focal = match self.model {
                DistortionModel::Poly3 => self.focal * (1.0 - self.terms[0]),
                DistortionModel::PtLens => {
                    self.focal * (1.0 - self.terms[0] - self.terms[1] - self.terms[2])
                }
                _ => self.focal,
            };
            self.real_focal_measured = false;
        }
        self
    }
}

/// TCA calibration sample, measured at one focal length.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LensCalibTca {
    pub model: TcaModel,
    pub focal: f32,
    /// Up to 12 coefficients, red and blue channels separate. See the
    /// [`TcaModel`] variants for the layout.
    pub terms: [f32; 12],
}

impl Default for LensCalibTca {
    fn default() -> Self {
        Self { model: TcaModel::None, focal: 0.0, terms: [0.0; 12] }
    }
}

/// Vignetting calibration sample. Unlike distortion and TCA, vignetting also
/// depends on the aperture and (weakly) the focus distance, so both are part
/// of the sample key.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LensCalibVignetting {
    pub model: VignettingModel,
    pub focal: f32,
    /// Aperture (f-number) at which this sample was measured.
    pub aperture: f32,
    /// Focus distance in meters.
    pub distance: f32,
    pub terms: [f32; 3],
}

impl Default for LensCalibVignetting {
    fn default() -> Self {
        Self { model: VignettingModel::None, focal: 0.0, aperture: 0.0, distance: 0.0, terms: [0.0; 3] }
    }
}

/// Image crop sample: the area of the frame actually covered by the lens.
///
/// Crop goes left, right, top, bottom. Left/right always refer to the long
/// side. Negative values are allowed for circular fisheyes whose image
/// circle extends beyond the frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LensCalibCrop {
    pub focal: f32,
    pub mode: CropMode,
    pub crop: [f32; 4],
}

impl Default for LensCalibCrop {
    fn default() -> Self {
        Self { focal: 0.0, mode: CropMode::None, crop: [0.0; 4] }
    }
}

/// Field-of-view sample (deprecated database entry, still honored as a
/// fallback source for the real focal length).
#[derive(Default, Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LensCalibFov {
    pub focal: f32,
    /// Field of view in degrees across the long image side.
    pub field_of_view: f32,
}

/// Description of a single model parameter, for UI and validation purposes.
#[derive(Clone, Copy, Debug)]
pub struct ModelParameter {
    pub name: &'static str,
    pub min: f32,
    pub max: f32,
    pub default: f32,
}

const fn p(name: &'static str, min: f32, max: f32, default: f32) -> ModelParameter {
    ModelParameter { name, min, max, default }
}

impl DistortionModel {
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Poly3 => "3rd order polynomial",
            Self::Poly5 => "5th order polynomial",
            Self::PtLens => "PanoTools lens model",
            Self::Acm => "Adobe camera model",
        }
    }
    pub fn parameters(self) -> &'static [ModelParameter] {
        const POLY3: &[ModelParameter] = &[p("k1", -0.2, 0.2, 0.0)];
        const POLY5: &[ModelParameter] = &[p("k1", -0.2, 0.2, 0.0), p("k2", -0.2, 0.2, 0.0)];
        const PTLENS: &[ModelParameter] =
            &[p("a", -0.5, 0.5, 0.0), p("b", -1.0, 1.0, 0.0), p("c", -1.0, 1.0, 0.0)];
        const ACM: &[ModelParameter] = &[
            p("k1", -0.2, 0.2, 0.0), p("k2", -0.2, 0.2, 0.0), p("k3", -1.0, 1.0, 0.0),
            p("k4", -1.0, 1.0, 0.0), p("k5", -1.0, 1.0, 0.0),
        ];
        match self {
            Self::None => &[],
            Self::Poly3 => POLY3,
            Self::Poly5 => POLY5,
            Self::PtLens => PTLENS,
            Self::Acm => ACM,
        }
    }
}

impl TcaModel {
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Linear => "Linear",
            Self::Poly3 => "3rd order polynomial",
            Self::Acm => "Adobe camera model",
        }
    }
    pub fn parameters(self) -> &'static [ModelParameter] {
        const LINEAR: &[ModelParameter] =
            &[p("kr", 0.99, 1.01, 1.0), p("kb", 0.99, 1.01, 1.0)];
        const POLY3: &[ModelParameter] = &[
            p("vr", 0.99, 1.01, 1.0), p("vb", 0.99, 1.01, 1.0),
            p("cr", -0.01, 0.01, 0.0), p("cb", -0.01, 0.01, 0.0),
            p("br", -0.01, 0.01, 0.0), p("bb", -0.01, 0.01, 0.0),
        ];
        const ACM: &[ModelParameter] = &[
            p("alpha0", 0.99, 1.01, 1.0), p("beta0", 0.99, 1.01, 1.0),
            p("alpha1", -0.01, 0.01, 0.0), p("beta1", -0.01, 0.01, 0.0),
            p("alpha2", -0.01, 0.01, 0.0), p("beta2", -0.01, 0.01, 0.0),
            p("alpha3", -0.01, 0.01, 0.0), p("beta3", -0.01, 0.01, 0.0),
            p("alpha4", -0.01, 0.01, 0.0), p("beta4", -0.01, 0.01, 0.0),
            p("alpha5", -0.01, 0.01, 0.0), p("beta5", -0.01, 0.01, 0.0),
        ];
        match self {
            Self::None => &[],
            Self::Linear => LINEAR,
            Self::Poly3 => POLY3,
            Self::Acm => ACM,
        }
    }
}

impl VignettingModel {
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Pa => "6th order polynomial (Pablo D'Angelo)",
            Self::Acm => "6th order polynomial (Adobe)",
        }
    }
    pub fn parameters(self) -> &'static [ModelParameter] {
        const PA: &[ModelParameter] =
            &[p("k1", -3.0, 1.0, 0.0), p("k2", -5.0, 10.0, 0.0), p("k3", -5.0, 10.0, 0.0)];
        const ACM: &[ModelParameter] =
            &[p("alpha1", -1.0, 1.0, 0.0), p("alpha2", -5.0, 10.0, 0.0), p("alpha3", -5.0, 10.0, 0.0)];
        match self {
            Self::None => &[],
            Self::Pa => PA,
            Self::Acm => ACM,
        }
    }
}

impl CropMode {
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "No crop",
            Self::Rectangle => "Rectangular crop",
            Self::Circle => "Circular crop",
        }
    }
    pub fn parameters(self) -> &'static [ModelParameter] {
        const RECT: &[ModelParameter] = &[
            p("left", -1.0, 1.0, 0.0), p("right", 0.0, 2.0, 0.0),
            p("top", -1.0, 1.0, 0.0), p("bottom", 0.0, 2.0, 0.0),
        ];
        match self {
            Self::None => &[],
            Self::Rectangle | Self::Circle => RECT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_focal_defaults_follow_the_hugin_fit() {
        let poly3 = LensCalibDistortion {
            model: DistortionModel::Poly3,
            focal: 50.0,
            terms: [0.1, 0.0, 0.0, 0.0, 0.0],
            ..Default::default()
        }.with_default_real_focal();
        assert!((poly3.real_focal - 45.0).abs() < 1e-4);
        assert!(!poly3.real_focal_measured);

        let ptlens = LensCalibDistortion {
            model: DistortionModel::PtLens,
            focal: 10.0,
            terms: [0.05, 0.01, -0.02, 0.0, 0.0],
            ..Default::default()
        }.with_default_real_focal();
        assert!((ptlens.real_focal - 10.0 * (1.0 - 0.05 - 0.01 + 0.02)).abs() < 1e-4);

        let acm = LensCalibDistortion {
            model: DistortionModel::Acm,
            focal: 35.0,
            ..Default::default()
        }.with_default_real_focal();
        assert_eq!(acm.real_focal, 35.0);
    }

    #[test]
    fn measured_real_focal_is_kept() {
        let d = LensCalibDistortion {
            model: DistortionModel::Poly3,
            focal: 10.5,
            real_focal: 10.84,
            real_focal_measured: true,
            terms: [0.1, 0.0, 0.0, 0.0, 0.0],
        }.with_default_real_focal();
        assert_eq!(d.real_focal, 10.84);
        assert!(d.real_focal_measured);
    }

    #[test]
    fn records_round_trip_through_serde() {
        let v = LensCalibVignetting {
            model: VignettingModel::Pa,
            focal: 24.0,
            aperture: 2.8,
            distance: 1000.0,
            terms: [-0.3, 0.1, -0.05],
        };
        let json = serde_json::to_string(&v).unwrap();
        let back: LensCalibVignetting = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn descriptor_tables_match_model_arity() {
        assert_eq!(DistortionModel::Poly3.parameters().len(), 1);
        assert_eq!(DistortionModel::PtLens.parameters().len(), 3);
        assert_eq!(DistortionModel::Acm.parameters().len(), 5);
        assert_eq!(TcaModel::Poly3.parameters().len(), 6);
        assert_eq!(TcaModel::Acm.parameters().len(), 12);
        assert_eq!(VignettingModel::Pa.parameters().len(), 3);
    }
}
