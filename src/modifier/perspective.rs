// SPDX-License-Identifier: GPL-3.0-or-later
// Perspective rectification from user control points.
//
// The control points select the model by their count:
//   4: two vertical lines
//   6: two verticals plus one horizontal line
//   8: two verticals plus two horizontals
//   5: five points on a rotated circle; the winding encodes whether the
//      vanishing vertex lies above or below the ellipse center
//   7: the five-point ellipse plus a horizontal line for the final rotation
//
// All math happens in focal-length units where the camera matrix is the
// identity, so the rectification is a pure rotation of the viewing rays and
// the homography on image points is that same 3x3 matrix applied
// projectively.

use nalgebra::{ Matrix2, Matrix3, Rotation3, SymmetricEigen, Unit, Vector2, Vector3, Vector6 };

/// How much of the exact correction to apply: -1 leaves the image
/// unchanged, 0 is the perfect correction, +1 over-corrects by 25 %.
fn correction_strength(d: f64) -> f64 {
    let d = d.clamp(-1.0, 1.0);
    if d <= 0.0 { 1.0 + d } else { 1.0 + d / 4.0 }
}

fn homogeneous(p: Vector2<f64>) -> Vector3<f64> {
    Vector3::new(p.x, p.y, 1.0)
}

fn dehomogenize(v: Vector3<f64>) -> Option<Vector2<f64>> {
    if v.z.abs() < 1e-12 {
        None
    } else {
        Some(Vector2::new(v.x / v.z, v.y / v.z))
    }
}

/// Rotation taking the direction through a finite vanishing point to the
/// given image-plane direction, with the angle scaled by `strength`.
fn rotation_to(vanishing: Vector2<f64>, target: Vector3<f64>, strength: f64) -> Matrix3<f64> {
    let mut u = Vector3::new(vanishing.x, vanishing.y, 1.0).normalize();
    if u.dot(&target) < 0.0 {
        u = -u;
    }
    let axis = u.cross(&target);
    let angle = u.dot(&target).clamp(-1.0, 1.0).acos();
    if axis.norm() < 1e-12 || angle.abs() < 1e-12 {
        return Matrix3::identity();
    }
    Rotation3::from_axis_angle(&Unit::new_normalize(axis), angle * strength).into_inner()
}

/// Intersection of the lines through (a0, a1) and (b0, b1), or `None` when
/// they are (nearly) parallel, i.e. the vanishing point already sits at
/// infinity and no correction is needed for that axis.
fn vanishing_point(
    a0: Vector2<f64>, a1: Vector2<f64>, b0: Vector2<f64>, b1: Vector2<f64>,
) -> Option<Vector2<f64>> {
    let la = homogeneous(a0).cross(&homogeneous(a1));
    let lb = homogeneous(b0).cross(&homogeneous(b1));
    let v = la.cross(&lb);
    if v.z.abs() <= 1e-9 * v.xy().norm() {
        return None;
    }
    Some(Vector2::new(v.x / v.z, v.y / v.z))
}

/// Fit the conic through five points and return the center, the semi-axes
/// (major, minor) and the unit direction of the minor axis.
fn fit_ellipse(points: &[Vector2<f64>]) -> Option<(Vector2<f64>, f64, f64, Vector2<f64>)> {
    debug_assert!(points.len() >= 5);

    // rows [x^2, xy, y^2, x, y, 1]; the conic is the nullspace of M,
    // recovered as the eigenvector of M^T M with the smallest eigenvalue
    let mut mtm = nalgebra::Matrix6::<f64>::zeros();
    for p in &points[..5] {
        let row = Vector6::new(p.x * p.x, p.x * p.y, p.y * p.y, p.x, p.y, 1.0);
        mtm += row * row.transpose();
    }
    let eig = SymmetricEigen::new(mtm);
    let mut min_i = 0;
    for i in 1..6 {
        if eig.eigenvalues[i] < eig.eigenvalues[min_i] {
            min_i = i;
        }
    }
    let c = eig.eigenvectors.column(min_i);
    let (a, b, cc, d, e, f) = (c[0], c[1], c[2], c[3], c[4], c[5]);

    let det = 4.0 * a * cc - b * b;
    if det.abs() < 1e-12 {
        return None;
    }
    let cx = (b * e - 2.0 * cc * d) / det;
    let cy = (b * d - 2.0 * a * e) / det;
    let center = Vector2::new(cx, cy);

    // conic value at the center gives the scale of the axes
    let fc = a * cx * cx + b * cx * cy + cc * cy * cy + d * cx + e * cy + f;
    let m2 = Matrix2::new(a, b * 0.5, b * 0.5, cc);
    let eig2 = SymmetricEigen::new(m2);

    let mut axes = [0.0f64; 2];
    for i in 0..2 {
        let v = -fc / eig2.eigenvalues[i];
        if v <= 0.0 {
            return None; // not an ellipse
        }
        axes[i] = v.sqrt();
    }

    // the larger eigenvalue belongs to the shorter axis
    let (minor_i, major_i) = if eig2.eigenvalues[0].abs() > eig2.eigenvalues[1].abs() {
        (0, 1)
    } else {
        (1, 0)
    };
    let minor_dir = Vector2::new(eig2.eigenvectors[(0, minor_i)], eig2.eigenvectors[(1, minor_i)]);
    Some((center, axes[major_i], axes[minor_i], minor_dir.normalize()))
}

fn winding(points: &[Vector2<f64>]) -> f64 {
    let mut s = 0.0;
    for i in 0..points.len() {
        let p = points[i];
        let q = points[(i + 1) % points.len()];
        s += p.x * q.y - q.x * p.y;
    }
    s
}

/// Vanishing point of the circle plane's in-plane vertical direction,
/// derived from the ellipse under weak perspective: the tilt follows from
/// the axis ratio (`cos t = b/a`), the vertex lies along the minor axis at
/// `b / sqrt(a^2 - b^2)` focal lengths from the ellipse center, on the side
/// selected by the control-point winding.
fn ellipse_vanishing_point(points: &[Vector2<f64>]) -> Option<Option<Vector2<f64>>> {
    let (center, major, minor, mut dir) = fit_ellipse(points)?;
    let denom = major * major - minor * minor;
    if denom < 1e-9 * major * major {
        // circular enough: no tilt detectable, vanishing point at infinity
        return Some(None);
    }
    let dist = minor / denom.sqrt();
    if dir.y < 0.0 {
        dir = -dir;
    }
    // clockwise ordering puts the vertex above the center (negative y,
    // y grows downwards in image coordinates)
    let side = if winding(&points[..5]) < 0.0 { -1.0 } else { 1.0 };
    Some(Some(center + dir * dist * side))
}

/// Build the rectifying map (source -> corrected, focal-length units) from
/// the control points. Returns `None` when the points are unusable;
/// `Some(identity)` when no correction is necessary.
pub(crate) fn rectify_matrix(points: &[(f32, f32)], d: f32) -> Option<Matrix3<f64>> {
    let count = points.len();
    if !(4..=8).contains(&count) {
        return None;
    }
    let strength = correction_strength(d as f64);
    let mut pts: Vec<Vector2<f64>> =
        points.iter().map(|(x, y)| Vector2::new(*x as f64, *y as f64)).collect();

    // If the "vertical" control lines are more horizontal than vertical,
    // the axis interpretation swaps. For the 7-point model the horizontal
    // line decides.
    let swapped = match count {
        4 | 6 | 8 => {
            let dx = (pts[1].x - pts[0].x).abs() + (pts[3].x - pts[2].x).abs();
            let dy = (pts[1].y - pts[0].y).abs() + (pts[3].y - pts[2].y).abs();
            dx > dy
        }
        7 => {
            let dx = (pts[6].x - pts[5].x).abs();
            let dy = (pts[6].y - pts[5].y).abs();
            dy > dx
        }
        _ => false,
    };
    if swapped {
        for p in pts.iter_mut() {
            let tmp = p.x;
            p.x = p.y;
            p.y = tmp;
        }
    }

    let vertical_vp = match count {
        4 | 6 | 8 => Some(vanishing_point(pts[0], pts[1], pts[2], pts[3])),
        _ => ellipse_vanishing_point(&pts),
    }?;

    let r1 = match vertical_vp {
        Some(vp) => rotation_to(vp, Vector3::y(), strength),
        None => Matrix3::identity(),
    };

    let mut h = r1;
    match count {
        8 => {
            // send the horizontal vanishing point to infinity with a yaw
            // around the already-corrected vertical
            if let Some(vp) = vanishing_point(pts[4], pts[5], pts[6], pts[7]) {
                let w = r1 * homogeneous(vp);
                let yaw = w.z.atan2(w.x);
                h = Rotation3::from_axis_angle(&Unit::new_normalize(Vector3::y()), yaw * strength)
                    .into_inner() * h;
            }
        }
        6 | 7 => {
            // roll so the given horizontal line comes out level
            let (h0, h1) = if count == 6 { (pts[4], pts[5]) } else { (pts[5], pts[6]) };
            if let (Some(q0), Some(q1)) = (dehomogenize(r1 * homogeneous(h0)), dehomogenize(r1 * homogeneous(h1))) {
                let roll = (q1.y - q0.y).atan2(q1.x - q0.x);
                h = Rotation3::from_axis_angle(&Unit::new_normalize(Vector3::z()), -roll * strength)
                    .into_inner() * h;
            }
        }
        _ => { }
    }

    // keep the centroid of the control points in place
    let centroid = pts.iter().fold(Vector2::zeros(), |acc, p| acc + p) / count as f64;
    if let Some(moved) = dehomogenize(h * homogeneous(centroid)) {
        let mut t = Matrix3::identity();
        t[(0, 2)] = centroid.x - moved.x;
        t[(1, 2)] = centroid.y - moved.y;
        h = t * h;
    }

    if swapped {
        let p = Matrix3::new(0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        h = p * h * p;
    }
    Some(h)
}

/// Homography entry of the coordinate stack: maps output coordinates to
/// source coordinates in the normalized system.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PerspectiveKernel {
    pub matrix: Matrix3<f32>,
}

const OUT_OF_DOMAIN: f32 = 1.6e16;

impl PerspectiveKernel {
    pub fn apply(&self, iocoord: &mut [f32]) {
        let m = &self.matrix;
        for pair in iocoord.chunks_exact_mut(2) {
            let (x, y) = (pair[0], pair[1]);
            let w = m[(2, 0)] * x + m[(2, 1)] * y + m[(2, 2)];
            if w <= 1e-9 {
                pair[0] = OUT_OF_DOMAIN;
                pair[1] = OUT_OF_DOMAIN;
                continue;
            }
            pair[0] = (m[(0, 0)] * x + m[(0, 1)] * y + m[(0, 2)]) / w;
            pair[1] = (m[(1, 0)] * x + m[(1, 1)] * y + m[(1, 2)]) / w;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_identity(h: &Matrix3<f64>, tol: f64) {
        let h = h / h[(2, 2)];
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((h[(i, j)] - expected).abs() < tol, "H = {h}");
            }
        }
    }

    #[test]
    fn straight_verticals_need_no_correction() {
        let points = [(-0.2, -0.3), (-0.2, 0.3), (0.2, -0.3), (0.2, 0.3)];
        for d in [-1.0f32, -0.5, 0.0, 0.5, 1.0] {
            let h = rectify_matrix(&points, d).unwrap();
            assert_identity(&h, 1e-6);
        }
    }

    #[test]
    fn d_of_minus_one_is_identity_even_when_tilted() {
        let points = [(-0.25, -0.3), (-0.2, 0.3), (0.25, -0.3), (0.2, 0.3)];
        let h = rectify_matrix(&points, -1.0).unwrap();
        // strength 0: pure translation at most
        let h = h / h[(2, 2)];
        assert!((h[(0, 0)] - 1.0).abs() < 1e-9 && h[(2, 0)].abs() < 1e-9 && h[(2, 1)].abs() < 1e-9);
    }

    #[test]
    fn pitch_distortion_is_rectified() {
        // Project vertical wall lines through a camera pitched by 0.2 rad
        // and check the recovered map makes them vertical again.
        let tau = 0.2f64;
        let rx = Rotation3::from_axis_angle(&Unit::new_normalize(Vector3::x()), tau).into_inner();
        let project = |wx: f64, wy: f64| -> (f32, f32) {
            let p = rx * Vector3::new(wx, wy, 1.0);
            ((p.x / p.z) as f32, (p.y / p.z) as f32)
        };
        let points = [
            project(-0.2, -0.3), project(-0.2, 0.3),
            project(0.2, -0.3), project(0.2, 0.3),
        ];
        let h = rectify_matrix(&points, 0.0).unwrap();
        for line in [[points[0], points[1]], [points[2], points[3]]] {
            let q0 = dehomogenize(h * Vector3::new(line[0].0 as f64, line[0].1 as f64, 1.0)).unwrap();
            let q1 = dehomogenize(h * Vector3::new(line[1].0 as f64, line[1].1 as f64, 1.0)).unwrap();
            assert!((q0.x - q1.x).abs() < 1e-6, "line not vertical after correction: {q0:?} {q1:?}");
        }
    }

    #[test]
    fn horizontal_line_levels_the_result() {
        let tau = 0.15f64;
        let rx = Rotation3::from_axis_angle(&Unit::new_normalize(Vector3::x()), tau).into_inner();
        let project = |wx: f64, wy: f64| -> (f32, f32) {
            let p = rx * Vector3::new(wx, wy, 1.0);
            ((p.x / p.z) as f32, (p.y / p.z) as f32)
        };
        let points = [
            project(-0.2, -0.3), project(-0.2, 0.3),
            project(0.2, -0.3), project(0.2, 0.3),
            project(-0.25, 0.1), project(0.25, 0.1),
        ];
        let h = rectify_matrix(&points, 0.0).unwrap();
        let q0 = dehomogenize(h * Vector3::new(points[4].0 as f64, points[4].1 as f64, 1.0)).unwrap();
        let q1 = dehomogenize(h * Vector3::new(points[5].0 as f64, points[5].1 as f64, 1.0)).unwrap();
        assert!((q0.y - q1.y).abs() < 1e-6, "horizon not level: {q0:?} {q1:?}");
    }

    #[test]
    fn horizontal_verticals_swap_the_axes() {
        // the "verticals" run left-right: the corrected axis is x
        let points = [(-0.3, -0.2), (0.3, -0.2), (-0.3, 0.2), (0.3, 0.2)];
        let h = rectify_matrix(&points, 0.0).unwrap();
        assert_identity(&h, 1e-6);
    }

    #[test]
    fn frontal_circle_needs_no_correction() {
        let points: Vec<(f32, f32)> = (0..5)
            .map(|i| {
                let a = i as f32 * std::f32::consts::TAU / 5.0;
                (0.3 * a.cos(), 0.3 * a.sin())
            })
            .collect();
        let h = rectify_matrix(&points, 0.0).unwrap();
        assert_identity(&h, 1e-4);
    }

    #[test]
    fn tilted_circle_produces_a_vanishing_point_on_the_minor_axis() {
        // squash the circle vertically: ellipse with a = 0.3, b = 0.24
        let points: Vec<Vector2<f64>> = (0..5)
            .map(|i| {
                let a = i as f64 * std::f64::consts::TAU / 5.0;
                Vector2::new(0.3 * a.cos(), 0.24 * a.sin())
            })
            .collect();
        let vp = ellipse_vanishing_point(&points).unwrap().unwrap();
        assert!(vp.x.abs() < 1e-6, "vp should sit on the y axis: {vp:?}");
        let expected = 0.24 / (0.3f64.powi(2) - 0.24f64.powi(2)).sqrt();
        assert!((vp.y.abs() - expected).abs() < 1e-6, "{} vs {expected}", vp.y.abs());
    }

    #[test]
    fn wrong_point_counts_are_rejected() {
        assert!(rectify_matrix(&[(0.0, 0.0); 3], 0.0).is_none());
        assert!(rectify_matrix(&[(0.0, 0.0); 9], 0.0).is_none());
    }

    #[test]
    fn kernel_applies_projectively() {
        let k = PerspectiveKernel { matrix: Matrix3::new(2.0, 0.0, 0.1, 0.0, 2.0, -0.1, 0.0, 0.0, 1.0) };
        let mut coord = [0.5, 0.5];
        k.apply(&mut coord);
        assert!((coord[0] - 1.1).abs() < 1e-6 && (coord[1] - 0.9).abs() < 1e-6);
    }
}
