// SPDX-License-Identifier: GPL-3.0-or-later
// Small numeric helpers shared by the interpolator and the modifier

/// Ordinate value marking a missing outer spline point.
pub const SPLINE_MISSING: f32 = f32::MAX;

/// Cubic Hermite interpolation between `y2` and `y3` at `t ∈ [0, 1]`.
///
/// `y1` and `y4` are the outer neighbors used to estimate the tangents by
/// central differences. Pass [`SPLINE_MISSING`] for an absent neighbor; the
/// one-sided tangent `y3 - y2` is used instead.
pub fn hermite_interpolate(y1: f32, y2: f32, y3: f32, y4: f32, t: f32) -> f32 {
    let t2 = t * t;
    let t3 = t2 * t;

    let tg2 = if y1 == SPLINE_MISSING { y3 - y2 } else { (y3 - y1) * 0.5 };
    let tg3 = if y4 == SPLINE_MISSING { y3 - y2 } else { (y4 - y2) * 0.5 };

    (2.0 * t3 - 3.0 * t2 + 1.0) * y2 +
    (t3 - 2.0 * t2 + t) * tg2 +
    (-2.0 * t3 + 3.0 * t2) * y3 +
    (t3 - t2) * tg3
}

/// Distance from `origin` (assumed inside) to the axis-aligned rectangle
/// boundary along the unit direction `dir`.
pub fn ray_to_rect_edge(origin: (f32, f32), dir: (f32, f32), min: (f32, f32), max: (f32, f32)) -> f32 {
    let mut t = f32::MAX;
    if dir.0 > 1e-9 { t = t.min((max.0 - origin.0) / dir.0); }
    if dir.0 < -1e-9 { t = t.min((min.0 - origin.0) / dir.0); }
    if dir.1 > 1e-9 { t = t.min((max.1 - origin.1) / dir.1); }
    if dir.1 < -1e-9 { t = t.min((min.1 - origin.1) / dir.1); }
    t
}
