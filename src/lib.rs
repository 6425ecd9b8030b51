// SPDX-License-Identifier: GPL-3.0-or-later

//! Lens correction engine.
//!
//! The crate corrects (or simulates) the geometric and photometric defects
//! of photographic lenses: vignetting, transversal chromatic aberration,
//! geometric distortion, projection conversion, perspective and scaling.
//! It consumes already-parsed calibration records and emits numeric
//! transforms; resampling the pixels along the produced coordinate maps is
//! the caller's job.
//!
//! The usual flow:
//!
//! 1. Build a [`Lens`] from calibration data (normally done by an external
//!    database parser) and validate it with [`Lens::check`].
//! 2. Create a [`Modifier`] for the image geometry and initialize it with
//!    the shooting parameters and the wanted [`ModifyFlags`].
//! 3. Run the three correction passes: [`Modifier::apply_color_modification`]
//!    in place on the pixels, then [`Modifier::apply_geometry_distortion`]
//!    and [`Modifier::apply_subpixel_distortion`] (or both fused via
//!    [`Modifier::apply_subpixel_geometry_distortion`]) to obtain the
//!    coordinate maps for resampling.
//!
//! All apply calls are thread-safe over disjoint pixel regions; callers are
//! expected to tile the image and dispatch tiles to a worker pool.
//!
//! ```
//! use lenscorrect::*;
//!
//! let mut lens = Lens {
//!     model: "ACME 50mm f/1.8".into(),
//!     mounts: vec!["ACME-X".into()],
//!     crop_factor: 1.0,
//!     lens_type: LensType::Rectilinear,
//!     ..Default::default()
//! };
//! lens.add_calib_distortion(LensCalibDistortion {
//!     model: DistortionModel::Poly3,
//!     focal: 50.0,
//!     terms: [0.012, 0.0, 0.0, 0.0, 0.0],
//!     ..Default::default()
//! });
//! assert!(lens.check());
//!
//! let mut modifier = Modifier::new(&lens, 1.0, 1920, 1080).unwrap();
//! let done = modifier.initialize(
//!     &lens, PixelFormat::U8, 50.0, 2.8, 1000.0, 0.0,
//!     LensType::Rectilinear, ModifyFlags::ALL, false,
//! );
//! assert!(done.contains(ModifyFlags::DISTORTION));
//!
//! // one row of the coordinate map for the resampler
//! let mut map = vec![0.0f32; 1920 * 2];
//! assert!(modifier.apply_geometry_distortion(0.0, 540.0, 1920, 1, &mut map));
//! ```

pub mod calibration;
pub mod interpolation;
pub mod lens;
pub mod math;
pub mod modifier;
pub mod pixels;

pub use calibration::{
    CropMode, DistortionModel, LensCalibCrop, LensCalibDistortion, LensCalibFov,
    LensCalibTca, LensCalibVignetting, ModelParameter, TcaModel, VignettingModel,
};
pub use lens::{ Camera, Lens, LensType, Mount };
pub use modifier::{ Modifier, ModifyFlags, Vectorization };
pub use pixels::{ cr_1, cr_2, cr_3, cr_4, cr_6, cr_8, ComponentRole, PixelFormat, PixelScalar };

/// Errors reported when constructing a transform plan. Everything else in
/// the engine degrades instead of failing: checks return `bool`,
/// interpolation returns `Option`, apply calls return `false` when there is
/// nothing to do.
#[derive(thiserror::Error, Debug)]
pub enum LensError {
    #[error("invalid lens: {0}")]
    InvalidLens(&'static str),

    #[error("invalid image dimensions {0}x{1}")]
    InvalidDimensions(usize, usize),
}
