// SPDX-License-Identifier: GPL-3.0-or-later
// Automatic scale solver.
//
// Finds the smallest scale >= 1 such that every point of the output frame
// maps to a valid source coordinate through the coordinate stack built so
// far (the scale entry itself is added afterwards). For each sampled
// direction the solver walks outward from the distortion center to the
// radius where the transformed ray crosses the source frame boundary; the
// ratio of the frame-edge distance to that radius is the scale demanded by
// that direction.

use crate::math::ray_to_rect_edge;
use crate::modifier::CoordCallback;

const UNIFORM_ANGLES: usize = 32;
const MARCH_STEPS: usize = 16;
const BISECT_STEPS: usize = 24;

/// Frame bounds in normalized coordinates, relative to the distortion
/// center.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameBounds {
    pub min: (f32, f32),
    pub max: (f32, f32),
}

fn residual(stack: &[CoordCallback], bounds: &FrameBounds, x: f32, y: f32) -> f32 {
    let mut coord = [x, y];
    for cb in stack {
        cb.kernel.apply(&mut coord);
    }
    let (px, py) = (coord[0], coord[1]);
    if !px.is_finite() || !py.is_finite() {
        return 1.0;
    }
    (px - bounds.max.0)
        .max(bounds.min.0 - px)
        .max(py - bounds.max.1)
        .max(bounds.min.1 - py)
}

/// Scale demand along one direction, or `None` when the whole ray stays
/// inside the source frame.
fn direction_demand(stack: &[CoordCallback], bounds: &FrameBounds, dir: (f32, f32)) -> Option<f32> {
    let edge = ray_to_rect_edge((0.0, 0.0), dir, bounds.min, bounds.max);
    if !edge.is_finite() || edge <= 0.0 {
        return None;
    }

    let t_max = edge * 1.5;
    let step = t_max / MARCH_STEPS as f32;
    let mut prev_t = 0.0f32;
    let mut prev_r = residual(stack, bounds, 0.0, 0.0);
    let mut crossing = None;
    for i in 1..=MARCH_STEPS {
        let t = step * i as f32;
        let r = residual(stack, bounds, t * dir.0, t * dir.1);
        if prev_r < 0.0 && r >= 0.0 {
            crossing = Some((prev_t, t));
            break;
        }
        prev_t = t;
        prev_r = r;
    }
    let (mut lo, mut hi) = crossing?;

    for _ in 0..BISECT_STEPS {
        let mid = (lo + hi) * 0.5;
        if residual(stack, bounds, mid * dir.0, mid * dir.1) < 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let t_cross = (lo + hi) * 0.5;
    if t_cross < 1e-6 {
        return None;
    }
    Some(edge / t_cross)
}

pub(crate) fn compute(stack: &[CoordCallback], bounds: &FrameBounds) -> f32 {
    let mut required = 1.0f32;

    let corner_dirs = [
        (bounds.min.0, bounds.min.1),
        (bounds.min.0, bounds.max.1),
        (bounds.max.0, bounds.min.1),
        (bounds.max.0, bounds.max.1),
    ];
    let dirs = (0..UNIFORM_ANGLES)
        .map(|i| {
            let a = i as f32 * std::f32::consts::TAU / UNIFORM_ANGLES as f32;
            (a.cos(), a.sin())
        })
        .chain(corner_dirs.into_iter().map(|(x, y)| {
            let n = (x * x + y * y).sqrt().max(1e-9);
            (x / n, y / n)
        }));

    for dir in dirs {
        if let Some(demand) = direction_demand(stack, bounds, dir) {
            required = required.max(demand);
        }
    }

    if !required.is_finite() || required > 100.0 {
        log::warn!("autoscale did not converge (required scale {required}), leaving the image unscaled");
        return 1.0;
    }
    required
}
