// SPDX-License-Identifier: GPL-3.0-or-later
// Pixel scalar types and the component-role encoding used by the color pass

use serde::{ Deserialize, Serialize };

/// Pixel component storage formats supported by the color callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    U8,
    U16,
    U32,
    F32,
    F64,
}

/// Role of one pixel component, four bits each in the packed description.
/// "Pixel" means the set of values sharing one (x, y) coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ComponentRole {
    /// End of the role list; packing pads with zeros so it never needs to be
    /// given explicitly.
    End = 0,
    /// What follows applies to the next pixel. This makes a single packed
    /// integer describe a Bayer tile of arbitrary length, e.g.
    /// `cr_3(RED, NEXT, GREEN)` for even rows and `cr_3(GREEN, NEXT, BLUE)`
    /// for odd rows.
    Next = 1,
    /// Unknown role; the component is left untouched.
    Unknown = 2,
    /// Grayscale intensity.
    Intensity = 3,
    Red = 4,
    Green = 5,
    Blue = 6,
}

impl ComponentRole {
    fn from_nibble(v: u32) -> Self {
        match v & 15 {
            1 => Self::Next,
            2 => Self::Unknown,
            3 => Self::Intensity,
            4 => Self::Red,
            5 => Self::Green,
            6 => Self::Blue,
            _ => Self::End,
        }
    }
}

pub const fn cr_1(a: ComponentRole) -> u32 {
    a as u32
}
pub const fn cr_2(a: ComponentRole, b: ComponentRole) -> u32 {
    a as u32 | (b as u32) << 4
}
pub const fn cr_3(a: ComponentRole, b: ComponentRole, c: ComponentRole) -> u32 {
    a as u32 | (b as u32) << 4 | (c as u32) << 8
}
pub const fn cr_4(a: ComponentRole, b: ComponentRole, c: ComponentRole, d: ComponentRole) -> u32 {
    a as u32 | (b as u32) << 4 | (c as u32) << 8 | (d as u32) << 12
}
pub const fn cr_6(roles: [ComponentRole; 6]) -> u32 {
    roles[0] as u32 | (roles[1] as u32) << 4 | (roles[2] as u32) << 8
        | (roles[3] as u32) << 12 | (roles[4] as u32) << 16 | (roles[5] as u32) << 20
}
pub const fn cr_8(roles: [ComponentRole; 8]) -> u32 {
    roles[0] as u32 | (roles[1] as u32) << 4 | (roles[2] as u32) << 8
        | (roles[3] as u32) << 12 | (roles[4] as u32) << 16 | (roles[5] as u32) << 20
        | (roles[6] as u32) << 24 | (roles[7] as u32) << 28
}

/// Unpack a role description into `out`, returning the number of roles
/// before the end marker.
pub fn unpack_roles(comp_role: u32, out: &mut [ComponentRole; 8]) -> usize {
    let mut cr = comp_role;
    let mut n = 0;
    while cr != 0 && n < 8 {
        out[n] = ComponentRole::from_nibble(cr);
        cr >>= 4;
        n += 1;
    }
    n
}

/// One pixel component as stored in a caller buffer. The color pass works on
/// `f32` internally and converts back with saturation for the integer types.
pub trait PixelScalar: Copy + Send + Sync + bytemuck::Pod {
    const FORMAT: PixelFormat;

    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

impl PixelScalar for u8 {
    const FORMAT: PixelFormat = PixelFormat::U8;
    #[inline] fn to_f32(self) -> f32 { self as f32 }
    #[inline] fn from_f32(v: f32) -> Self { v.round().clamp(0.0, u8::MAX as f32) as u8 }
}
impl PixelScalar for u16 {
    const FORMAT: PixelFormat = PixelFormat::U16;
    #[inline] fn to_f32(self) -> f32 { self as f32 }
    #[inline] fn from_f32(v: f32) -> Self { v.round().clamp(0.0, u16::MAX as f32) as u16 }
}
impl PixelScalar for u32 {
    const FORMAT: PixelFormat = PixelFormat::U32;
    #[inline] fn to_f32(self) -> f32 { self as f32 }
    #[inline] fn from_f32(v: f32) -> Self {
        // u32::MAX is not representable in f32; the cast saturates
        v.round().max(0.0) as u32
    }
}
impl PixelScalar for f32 {
    const FORMAT: PixelFormat = PixelFormat::F32;
    #[inline] fn to_f32(self) -> f32 { self }
    #[inline] fn from_f32(v: f32) -> Self { v }
}
impl PixelScalar for f64 {
    const FORMAT: PixelFormat = PixelFormat::F64;
    #[inline] fn to_f32(self) -> f32 { self as f32 }
    #[inline] fn from_f32(v: f32) -> Self { v as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ComponentRole::*;

    #[test]
    fn packing_round_trips() {
        let packed = cr_4(Red, Green, Blue, Unknown);
        let mut roles = [End; 8];
        let n = unpack_roles(packed, &mut roles);
        assert_eq!(n, 4);
        assert_eq!(&roles[..4], &[Red, Green, Blue, Unknown]);
    }

    #[test]
    fn bayer_tile_description() {
        let packed = cr_3(Red, Next, Green);
        let mut roles = [End; 8];
        let n = unpack_roles(packed, &mut roles);
        assert_eq!(n, 3);
        assert_eq!(&roles[..3], &[Red, Next, Green]);
    }

    #[test]
    fn integer_conversion_saturates() {
        assert_eq!(u8::from_f32(256.0), 255);
        assert_eq!(u8::from_f32(-3.0), 0);
        assert_eq!(u16::from_f32(70000.0), u16::MAX);
        assert_eq!(u8::from_f32(127.6), 128);
    }
}
