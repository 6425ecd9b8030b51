// SPDX-License-Identifier: GPL-3.0-or-later
// Projection conversion for the coordinate stack.
//
// Every pairwise conversion composes "target projection -> sphere" with
// "sphere -> source projection". The sphere is addressed by equirectangular
// longitude/latitude; planar coordinates are in units of the real focal
// length. Points outside a projection's valid domain are pushed far off the
// frame so the sampling stage treats them as background.

use nalgebra::Vector3;

use crate::lens::LensType;

/// Far outside any source frame in normalized units.
const OUT_OF_DOMAIN: f32 = 1.6e16;

/// Thoby fisheye constants, measured for the Nikkor 10.5.
pub(crate) const THOBY_K1: f32 = 1.47;
pub(crate) const THOBY_K2: f32 = 0.713;

#[derive(Clone, Copy, Debug)]
pub(crate) struct GeometryKernel {
    /// Projection of the source image (the lens).
    pub from: LensType,
    /// Projection of the output image.
    pub to: LensType,
    /// Real (paraxial) focal length in normalized units.
    pub focal_norm: f32,
}

impl GeometryKernel {
    pub fn apply(&self, iocoord: &mut [f32]) {
        let inv_f = 1.0 / self.focal_norm;
        for pair in iocoord.chunks_exact_mut(2) {
            let x = pair[0] * inv_f;
            let y = pair[1] * inv_f;
            match to_sphere(self.to, x, y).and_then(|(lng, lat)| from_sphere(self.from, lng, lat)) {
                Some((xs, ys)) => {
                    pair[0] = xs * self.focal_norm;
                    pair[1] = ys * self.focal_norm;
                }
                None => {
                    pair[0] = OUT_OF_DOMAIN;
                    pair[1] = OUT_OF_DOMAIN;
                }
            }
        }
    }
}

/// Angle from the optical axis for a point at planar radius `r` (focal
/// units), per projection. `None` when `r` lies outside the image domain.
fn theta_of_r(kind: LensType, r: f32) -> Option<f32> {
    match kind {
        LensType::Rectilinear | LensType::Unknown => Some(r.atan()),
        LensType::Fisheye => Some(r),
        LensType::FisheyeStereographic => Some(2.0 * (r * 0.5).atan()),
        LensType::FisheyeEquisolid => {
            if r > 2.0 { None } else { Some(2.0 * (r * 0.5).asin()) }
        }
        LensType::FisheyeOrthographic => {
            if r > 1.0 { None } else { Some(r.asin()) }
        }
        LensType::FisheyeThoby => {
            if r > THOBY_K1 { None } else { Some((r / THOBY_K1).asin() / THOBY_K2) }
        }
        // handled by the cylindrical branches, not radially
        LensType::Panoramic | LensType::Equirectangular => None,
    }
}

/// Planar radius for a ray at angle `theta` from the optical axis.
fn r_of_theta(kind: LensType, theta: f32) -> Option<f32> {
    match kind {
        LensType::Rectilinear | LensType::Unknown => {
            if theta >= std::f32::consts::FRAC_PI_2 { None } else { Some(theta.tan()) }
        }
        LensType::Fisheye => Some(theta),
        LensType::FisheyeStereographic => {
            if theta >= std::f32::consts::PI { None } else { Some(2.0 * (theta * 0.5).tan()) }
        }
        LensType::FisheyeEquisolid => Some(2.0 * (theta * 0.5).sin()),
        LensType::FisheyeOrthographic => {
            if theta > std::f32::consts::FRAC_PI_2 { None } else { Some(theta.sin()) }
        }
        LensType::FisheyeThoby => {
            if theta * THOBY_K2 > std::f32::consts::FRAC_PI_2 {
                None
            } else {
                Some(THOBY_K1 * (theta * THOBY_K2).sin())
            }
        }
        LensType::Panoramic | LensType::Equirectangular => None,
    }
}

/// Planar point (focal units) to equirectangular longitude/latitude.
fn to_sphere(kind: LensType, x: f32, y: f32) -> Option<(f32, f32)> {
    match kind {
        LensType::Panoramic => Some((x, y.atan())),
        LensType::Equirectangular => {
            if y.abs() > std::f32::consts::FRAC_PI_2 { None } else { Some((x, y)) }
        }
        _ => {
            let r = (x * x + y * y).sqrt();
            if r < 1e-9 {
                return Some((0.0, 0.0));
            }
            let theta = theta_of_r(kind, r)?;
            let (st, ct) = theta.sin_cos();
            let dir = Vector3::new(st * x / r, st * y / r, ct);
            Some((dir.x.atan2(dir.z), dir.y.clamp(-1.0, 1.0).asin()))
        }
    }
}

/// Equirectangular longitude/latitude to a planar point (focal units).
fn from_sphere(kind: LensType, lng: f32, lat: f32) -> Option<(f32, f32)> {
    match kind {
        LensType::Panoramic => {
            if lat.abs() >= std::f32::consts::FRAC_PI_2 * 0.999 {
                None
            } else {
                Some((lng, lat.tan()))
            }
        }
        LensType::Equirectangular => Some((lng, lat)),
        _ => {
            let (slat, clat) = lat.sin_cos();
            let (slng, clng) = lng.sin_cos();
            let dir = Vector3::new(clat * slng, slat, clat * clng);
            let theta = dir.z.clamp(-1.0, 1.0).acos();
            if kind == LensType::Rectilinear && dir.z <= 1e-6 {
                // behind the image plane
                return None;
            }
            let rho = (dir.x * dir.x + dir.y * dir.y).sqrt();
            if rho < 1e-9 {
                return Some((0.0, 0.0));
            }
            let r = r_of_theta(kind, theta)?;
            Some((r * dir.x / rho, r * dir.y / rho))
        }
    }
}
