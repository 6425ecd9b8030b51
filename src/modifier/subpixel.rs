// SPDX-License-Identifier: GPL-3.0-or-later
// TCA kernels for the subpixel coordinate stack.
//
// The stack operates on six floats per pixel: (xR, yR, xG, yG, xB, yB) in
// the normalized coordinate system. TCA coefficients are calibrated for the
// resampling direction, so correction applies the forward model and
// simulation its inverse. The green channel is the identity in every model.

use crate::calibration::TcaModel;

const FIXED_POINT_EPS: f32 = 1e-6;
const MAX_FIXED_POINT_ITERATIONS: usize = 8;

#[derive(Clone, Debug)]
pub(crate) struct TcaKernel {
    pub model: TcaModel,
    pub terms: [f32; 12],
    /// Apply the inverse of the model (the simulating direction).
    pub inverse: bool,
    /// Nominal focal length in normalized units, for the ACM focal-length
    /// unit system.
    pub focal_norm: f32,
}

impl TcaKernel {
    pub fn apply(&self, iocoord: &mut [f32]) {
        match (self.model, self.inverse) {
            (TcaModel::Linear, false) => self.linear(iocoord, self.terms[0], self.terms[1]),
            (TcaModel::Linear, true) => {
                self.linear(iocoord, 1.0 / self.terms[0], 1.0 / self.terms[1])
            }
            (TcaModel::Poly3, false) => self.poly3_forward(iocoord),
            (TcaModel::Poly3, true) => self.poly3_inverse(iocoord),
            (TcaModel::Acm, false) => self.acm_forward(iocoord),
            (TcaModel::Acm, true) => self.acm_inverse(iocoord),
            (TcaModel::None, _) => { }
        }
    }

    /// `r_d = k * r_u` per channel.
    fn linear(&self, iocoord: &mut [f32], kr: f32, kb: f32) {
        for px in iocoord.chunks_exact_mut(6) {
            px[0] *= kr;
            px[1] *= kr;
            px[4] *= kb;
            px[5] *= kb;
        }
    }

    /// `r_d = r_u * (b * r_u^2 + c * r_u + v)` per channel.
    /// Terms layout: `[vr, vb, cr, cb, br, bb]`.
    fn poly3_forward(&self, iocoord: &mut [f32]) {
        let [vr, vb, cr, cb, br, bb] = [
            self.terms[0], self.terms[1], self.terms[2],
            self.terms[3], self.terms[4], self.terms[5],
        ];
        for px in iocoord.chunks_exact_mut(6) {
            let r2 = px[0] * px[0] + px[1] * px[1];
            let r = r2.sqrt();
            let poly = br * r2 + cr * r + vr;
            px[0] *= poly;
            px[1] *= poly;

            let r2 = px[4] * px[4] + px[5] * px[5];
            let r = r2.sqrt();
            let poly = bb * r2 + cb * r + vb;
            px[4] *= poly;
            px[5] *= poly;
        }
    }

    fn poly3_inverse(&self, iocoord: &mut [f32]) {
        let [vr, vb, cr, cb, br, bb] = [
            self.terms[0], self.terms[1], self.terms[2],
            self.terms[3], self.terms[4], self.terms[5],
        ];
        for px in iocoord.chunks_exact_mut(6) {
            for (off, b, c, v) in [(0usize, br, cr, vr), (4, bb, cb, vb)] {
                let rd = (px[off] * px[off] + px[off + 1] * px[off + 1]).sqrt();
                if rd == 0.0 {
                    continue;
                }
                let mut ru = rd;
                for _ in 0..MAX_FIXED_POINT_ITERATIONS {
                    let next = rd / (b * ru * ru + c * ru + v);
                    let delta = (next - ru).abs();
                    ru = next;
                    if delta < FIXED_POINT_EPS {
                        break;
                    }
                }
                let ratio = ru / rd;
                px[off] *= ratio;
                px[off + 1] *= ratio;
            }
        }
    }

    /// Adobe camera model for TCA, focal-length units, terms interleaved
    /// `[a0, b0, a1, b1, ..., a5, b5]` (alphas red, betas blue).
    fn acm_forward(&self, iocoord: &mut [f32]) {
        let inv_f = 1.0 / self.focal_norm;
        for px in iocoord.chunks_exact_mut(6) {
            for (off, t0) in [(0usize, 0usize), (4, 1)] {
                let [s0, s1, s2, s3, s4, s5] = [
                    self.terms[t0], self.terms[t0 + 2], self.terms[t0 + 4],
                    self.terms[t0 + 6], self.terms[t0 + 8], self.terms[t0 + 10],
                ];
                let x = px[off] * inv_f;
                let y = px[off + 1] * inv_f;
                let r2 = x * x + y * y;
                let radial = 1.0 + r2 * (s1 + r2 * (s2 + r2 * s3));
                let tangential = 2.0 * (s4 * y + s5 * x);
                px[off] = s0 * (x * radial + x * tangential + s5 * r2) * self.focal_norm;
                px[off + 1] = s0 * (y * radial + y * tangential + s4 * r2) * self.focal_norm;
            }
        }
    }

    fn acm_inverse(&self, iocoord: &mut [f32]) {
        let inv_f = 1.0 / self.focal_norm;
        for px in iocoord.chunks_exact_mut(6) {
            for (off, t0) in [(0usize, 0usize), (4, 1)] {
                let [s0, s1, s2, s3, s4, s5] = [
                    self.terms[t0], self.terms[t0 + 2], self.terms[t0 + 4],
                    self.terms[t0 + 6], self.terms[t0 + 8], self.terms[t0 + 10],
                ];
                let xd = px[off] * inv_f / s0;
                let yd = px[off + 1] * inv_f / s0;
                let mut x = xd;
                let mut y = yd;
                for _ in 0..MAX_FIXED_POINT_ITERATIONS {
                    let r2 = x * x + y * y;
                    let radial = 1.0 + r2 * (s1 + r2 * (s2 + r2 * s3));
                    let tangential = 2.0 * (s4 * y + s5 * x);
                    let nx = (xd - x * tangential - s5 * r2) / radial;
                    let ny = (yd - y * tangential - s4 * r2) / radial;
                    let delta = (nx - x).abs().max((ny - y).abs());
                    x = nx;
                    y = ny;
                    if delta < FIXED_POINT_EPS {
                        break;
                    }
                }
                px[off] = x * self.focal_norm;
                px[off + 1] = y * self.focal_norm;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_terms(kr: f32, kb: f32) -> [f32; 12] {
        let mut t = [0.0f32; 12];
        t[0] = kr;
        t[1] = kb;
        t
    }

    fn kernel(model: TcaModel, terms: [f32; 12], inverse: bool) -> TcaKernel {
        TcaKernel { model, terms, inverse, focal_norm: 1.2 }
    }

    #[test]
    fn green_channel_is_identity() {
        let poly = {
            let mut t = [0.0f32; 12];
            t[0] = 1.001; t[1] = 0.999; t[2] = 0.002; t[3] = -0.001; t[4] = 0.0005; t[5] = 0.0;
            kernel(TcaModel::Poly3, t, false)
        };
        let acm = {
            let mut t = [0.0f32; 12];
            t[0] = 1.002; t[1] = 0.998; t[4] = 0.001; t[5] = -0.001;
            kernel(TcaModel::Acm, t, false)
        };
        for k in [kernel(TcaModel::Linear, linear_terms(1.01, 0.99), false), poly, acm] {
            let mut px = [0.5, -0.25, 0.5, -0.25, 0.5, -0.25];
            k.apply(&mut px);
            assert_eq!(px[2], 0.5);
            assert_eq!(px[3], -0.25);
        }
    }

    #[test]
    fn linear_scales_red_and_blue() {
        let k = kernel(TcaModel::Linear, linear_terms(1.01, 0.99), false);
        let mut px = [1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        k.apply(&mut px);
        assert!((px[0] - 1.01).abs() < 1e-6);
        assert!((px[4] - 0.99).abs() < 1e-6);
    }

    #[test]
    fn linear_forward_then_inverse_is_identity() {
        let fwd = kernel(TcaModel::Linear, linear_terms(1.01, 0.99), false);
        let inv = kernel(TcaModel::Linear, linear_terms(1.01, 0.99), true);
        let mut px = [0.7, -0.3, 0.7, -0.3, 0.7, -0.3];
        fwd.apply(&mut px);
        inv.apply(&mut px);
        for (i, v) in [0.7, -0.3].iter().cycle().take(6).enumerate() {
            assert!((px[i] - v).abs() < 1e-6, "{px:?}");
        }
    }

    #[test]
    fn poly3_round_trips() {
        let mut t = [0.0f32; 12];
        t[0] = 1.005; t[1] = 0.995;   // vr, vb
        t[2] = 0.003; t[3] = -0.002;  // cr, cb
        t[4] = 0.001; t[5] = 0.002;   // br, bb
        let fwd = kernel(TcaModel::Poly3, t, false);
        let inv = kernel(TcaModel::Poly3, t, true);

        let mut px = [0.9, 0.4, 0.9, 0.4, 0.9, 0.4];
        fwd.apply(&mut px);
        inv.apply(&mut px);
        assert!((px[0] - 0.9).abs() < 1e-5 && (px[1] - 0.4).abs() < 1e-5, "{px:?}");
        assert!((px[4] - 0.9).abs() < 1e-5 && (px[5] - 0.4).abs() < 1e-5, "{px:?}");
    }

    #[test]
    fn acm_round_trips() {
        let mut t = [0.0f32; 12];
        t[0] = 1.003; t[1] = 0.997;   // a0, b0
        t[2] = 0.004; t[3] = -0.003;  // a1, b1
        t[8] = 0.001; t[9] = -0.001;  // a4, b4
        let fwd = kernel(TcaModel::Acm, t, false);
        let inv = kernel(TcaModel::Acm, t, true);

        let mut px = [0.8, -0.5, 0.8, -0.5, 0.8, -0.5];
        fwd.apply(&mut px);
        inv.apply(&mut px);
        assert!((px[0] - 0.8).abs() < 1e-5 && (px[1] + 0.5).abs() < 1e-5, "{px:?}");
        assert!((px[4] - 0.8).abs() < 1e-5 && (px[5] + 0.5).abs() < 1e-5, "{px:?}");
    }
}
