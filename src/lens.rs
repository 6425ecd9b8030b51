// SPDX-License-Identifier: GPL-3.0-or-later
// Mount, camera and lens records plus their validity checks

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{ Deserialize, Serialize };

use crate::calibration::*;

/// A camera mount: its name and the list of compatible mount names.
/// Mount names of fixed-lens cameras start with a lower case letter.
#[derive(Default, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mount {
    pub name: String,
    pub compat: Vec<String>,
}

impl Mount {
    pub fn add_compat(&mut self, name: &str) {
        if !name.is_empty() && !self.compat.iter().any(|c| c == name) {
            self.compat.push(name.to_string());
        }
    }

    pub fn check(&self) -> bool {
        !self.name.is_empty()
    }
}

/// A camera body. Maker and model are matched against EXIF data by the
/// (external) database search, so they must be stored exactly as EXIF
/// reports them.
#[derive(Default, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Camera {
    pub maker: String,
    pub model: String,
    /// Some cameras share one EXIF id between different models; the variant
    /// disambiguates them.
    pub variant: String,
    pub mount: String,
    pub crop_factor: f32,
}

impl Camera {
    pub fn check(&self) -> bool {
        !self.maker.is_empty() && !self.model.is_empty() && !self.mount.is_empty()
            && self.crop_factor > 0.0
    }
}

/// Lens projection.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LensType {
    #[default]
    Unknown,
    /// Straight lines remain straight; nearly all lenses are of this type.
    Rectilinear,
    /// Equidistant fisheye.
    Fisheye,
    /// Cylindrical panorama. No real lens projects like this, but it is a
    /// useful conversion target.
    Panoramic,
    Equirectangular,
    FisheyeOrthographic,
    FisheyeStereographic,
    FisheyeEquisolid,
    /// Fisheye as measured by Thoby (Nikkor 10.5).
    FisheyeThoby,
}

impl LensType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Rectilinear => "Rectilinear",
            Self::Fisheye => "Fish-Eye",
            Self::Panoramic => "Panoramic",
            Self::Equirectangular => "Equirectangular",
            Self::FisheyeOrthographic => "Fisheye, orthographic",
            Self::FisheyeStereographic => "Fisheye, stereographic",
            Self::FisheyeEquisolid => "Fisheye, equisolid",
            Self::FisheyeThoby => "Thoby-Fisheye",
        }
    }
}

/// A lens description: identification, optical limits and the calibration
/// sample lists the correction engine interpolates over.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lens {
    pub maker: String,
    pub model: String,
    /// Minimum focal length, mm.
    pub min_focal: f32,
    /// Maximum focal length, mm. Equal to `min_focal` for primes.
    pub max_focal: f32,
    /// Smallest f-number possible.
    pub min_aperture: f32,
    /// Biggest f-number possible.
    pub max_aperture: f32,
    pub mounts: Vec<String>,
    /// Horizontal shift of the distortion center, relative: -0.5..+0.5 where
    /// 1 is the maximal image dimension. Distortion and TCA share this
    /// center.
    pub center_x: f32,
    /// Vertical shift of the distortion center.
    pub center_y: f32,
    /// Crop factor of the sensor the calibration was measured on.
    pub crop_factor: f32,
    /// Aspect ratio of the calibration images, >= 1.
    pub aspect_ratio: f32,
    #[serde(rename = "type")]
    pub lens_type: LensType,
    pub calib_distortion: Vec<LensCalibDistortion>,
    pub calib_tca: Vec<LensCalibTca>,
    pub calib_vignetting: Vec<LensCalibVignetting>,
    pub calib_crop: Vec<LensCalibCrop>,
    pub calib_fov: Vec<LensCalibFov>,
}

impl Default for Lens {
    fn default() -> Self {
        Self {
            maker: String::new(),
            model: String::new(),
            min_focal: 0.0,
            max_focal: 0.0,
            min_aperture: 0.0,
            max_aperture: 0.0,
            mounts: Vec::new(),
            center_x: 0.0,
            center_y: 0.0,
            crop_factor: 0.0,
            aspect_ratio: 1.5,
            lens_type: LensType::Unknown,
            calib_distortion: Vec::new(),
            calib_tca: Vec::new(),
            calib_vignetting: Vec::new(),
            calib_crop: Vec::new(),
            calib_fov: Vec::new(),
        }
    }
}

lazy_static! {
    // "[min focal]-[max focal]mm f/[min aperture]-[max aperture]"
    static ref NAME_FOCAL_APERTURE: Regex =
        Regex::new(r"(?i)(\s+|^)([0-9]+[0-9.]*)(-[0-9]+[0-9.]*)?(mm)?\s+(f/|f|1/|1:)?([0-9.]+)(-[0-9.]+)?").unwrap();
    // "1:[min aperture]-[max aperture] [min focal]-[max focal]mm"
    static ref NAME_RATIO_FOCAL: Regex =
        Regex::new(r"(?i)\s+1:([0-9.]+)(-[0-9.]+)?\s+([0-9.]+)(-[0-9.]+)?(mm)?").unwrap();
    // "[min aperture]-[max aperture]/[min focal]-[max focal]"
    static ref NAME_APERTURE_SLASH_FOCAL: Regex =
        Regex::new(r"(?i)([0-9.]+)(-[0-9.]+)?\s*/\s*([0-9.]+)(-[0-9.]+)?").unwrap();
    // Teleconverter magnification, e.g. "1.4x"
    static ref NAME_MAGNIFICATION: Regex = Regex::new(r"(?i)[0-9](\.[0-9]+)?x").unwrap();
}

// The separator '-' is part of the match for range captures.
fn capture_float(m: Option<regex::Match>) -> Option<f32> {
    let s = m?.as_str().trim_start_matches('-');
    s.parse().ok()
}

fn parse_lens_name(model: &str) -> Option<(Option<f32>, Option<f32>, Option<f32>)> {
    // (min focal, max focal, min aperture) capture indices per pattern
    let patterns: [(&Regex, [usize; 3]); 3] = [
        (&*NAME_FOCAL_APERTURE, [2, 3, 6]),
        (&*NAME_RATIO_FOCAL, [3, 4, 1]),
        (&*NAME_APERTURE_SLASH_FOCAL, [3, 4, 1]),
    ];
    for (re, idx) in patterns {
        if let Some(caps) = re.captures(model) {
            return Some((
                capture_float(caps.get(idx[0])),
                capture_float(caps.get(idx[1])),
                capture_float(caps.get(idx[2])),
            ));
        }
    }
    None
}

impl Lens {
    pub fn add_mount(&mut self, name: &str) {
        if !name.is_empty() && !self.mounts.iter().any(|m| m == name) {
            self.mounts.push(name.to_string());
        }
    }

    /// Add a distortion calibration sample. A sample at an already present
    /// focal length replaces the earlier entry. An unset real focal length
    /// is resolved to its model-specific default here.
    pub fn add_calib_distortion(&mut self, calib: LensCalibDistortion) {
        let calib = calib.with_default_real_focal();
        match self.calib_distortion.iter().position(|c| c.focal == calib.focal) {
            Some(i) => self.calib_distortion[i] = calib,
            None => self.calib_distortion.push(calib),
        }
    }

    pub fn remove_calib_distortion(&mut self, idx: usize) -> bool {
        if idx < self.calib_distortion.len() { self.calib_distortion.remove(idx); true } else { false }
    }

    pub fn add_calib_tca(&mut self, calib: LensCalibTca) {
        match self.calib_tca.iter().position(|c| c.focal == calib.focal) {
            Some(i) => self.calib_tca[i] = calib,
            None => self.calib_tca.push(calib),
        }
    }

    pub fn remove_calib_tca(&mut self, idx: usize) -> bool {
        if idx < self.calib_tca.len() { self.calib_tca.remove(idx); true } else { false }
    }

    /// Vignetting samples are keyed on (focal, aperture, distance).
    pub fn add_calib_vignetting(&mut self, calib: LensCalibVignetting) {
        match self.calib_vignetting.iter().position(|c| {
            c.focal == calib.focal && c.aperture == calib.aperture && c.distance == calib.distance
        }) {
            Some(i) => self.calib_vignetting[i] = calib,
            None => self.calib_vignetting.push(calib),
        }
    }

    pub fn remove_calib_vignetting(&mut self, idx: usize) -> bool {
        if idx < self.calib_vignetting.len() { self.calib_vignetting.remove(idx); true } else { false }
    }

    pub fn add_calib_crop(&mut self, calib: LensCalibCrop) {
        match self.calib_crop.iter().position(|c| c.focal == calib.focal) {
            Some(i) => self.calib_crop[i] = calib,
            None => self.calib_crop.push(calib),
        }
    }

    pub fn remove_calib_crop(&mut self, idx: usize) -> bool {
        if idx < self.calib_crop.len() { self.calib_crop.remove(idx); true } else { false }
    }

    pub fn add_calib_fov(&mut self, calib: LensCalibFov) {
        match self.calib_fov.iter().position(|c| c.focal == calib.focal) {
            Some(i) => self.calib_fov[i] = calib,
            None => self.calib_fov.push(calib),
        }
    }

    pub fn remove_calib_fov(&mut self, idx: usize) -> bool {
        if idx < self.calib_fov.len() { self.calib_fov.remove(idx); true } else { false }
    }

    /// Fill missing focal and aperture ranges from the model name or, when
    /// that fails, from the calibration sample lists.
    pub fn guess_parameters(&mut self) {
        let mut min_focal = None;
        let mut max_focal = None;
        let mut min_aperture = None;
        let mut max_aperture = None;

        let name_is_converter = ["adapter", "reducer", "booster", "extender", "converter"]
            .iter().any(|w| self.model.contains(w))
            || NAME_MAGNIFICATION.is_match(&self.model);

        if (self.min_aperture == 0.0 || self.min_focal == 0.0) && !self.model.is_empty() && !name_is_converter {
            if let Some((minf, maxf, mina)) = parse_lens_name(&self.model) {
                min_focal = minf;
                max_focal = maxf;
                min_aperture = mina;
            }
        }

        if self.min_aperture == 0.0 || self.min_focal == 0.0 {
            let focals = self.calib_distortion.iter().map(|c| c.focal)
                .chain(self.calib_tca.iter().map(|c| c.focal))
                .chain(self.calib_vignetting.iter().map(|c| c.focal))
                .chain(self.calib_crop.iter().map(|c| c.focal))
                .chain(self.calib_fov.iter().map(|c| c.focal));
            match focals.minmax_by(|a, b| a.total_cmp(b)) {
                itertools::MinMaxResult::MinMax(lo, hi) => {
                    min_focal = Some(min_focal.unwrap_or(lo).min(lo));
                    max_focal = Some(max_focal.unwrap_or(hi).max(hi));
                }
                itertools::MinMaxResult::OneElement(v) => {
                    min_focal = Some(min_focal.unwrap_or(v).min(v));
                    max_focal = Some(max_focal.unwrap_or(v).max(v));
                }
                itertools::MinMaxResult::NoElements => { }
            }
            match self.calib_vignetting.iter().map(|c| c.aperture).minmax_by(|a, b| a.total_cmp(b)) {
                itertools::MinMaxResult::MinMax(lo, hi) => {
                    min_aperture = min_aperture.or(Some(lo));
                    max_aperture = Some(hi);
                }
                itertools::MinMaxResult::OneElement(v) => {
                    min_aperture = min_aperture.or(Some(v));
                    max_aperture = Some(v);
                }
                itertools::MinMaxResult::NoElements => { }
            }
        }

        if self.min_focal == 0.0 { self.min_focal = min_focal.unwrap_or(0.0); }
        if self.max_focal == 0.0 { self.max_focal = max_focal.unwrap_or(0.0); }
        if self.min_aperture == 0.0 { self.min_aperture = min_aperture.unwrap_or(0.0); }
        if self.max_aperture == 0.0 { self.max_aperture = max_aperture.unwrap_or(0.0); }

        if self.max_focal == 0.0 { self.max_focal = self.min_focal; }
    }

    /// Check the lens record, guessing derivable fields first.
    pub fn check(&mut self) -> bool {
        self.guess_parameters();

        !self.model.is_empty()
            && !self.mounts.is_empty()
            && self.crop_factor > 0.0
            && self.min_focal <= self.max_focal
            && (self.max_aperture == 0.0 || self.min_aperture <= self.max_aperture)
            && self.aspect_ratio >= 1.0
    }
}
