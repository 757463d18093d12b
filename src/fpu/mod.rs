//! x87 floating-point unit state.
//!
//! The eight stack slots hold `f64` working values; an `st_i64` shadow keeps
//! the exact 64-bit integer loaded by FILD so a following FIST can store it
//! back without double-rounding (the `TAG_UINT64` hint). Extended 80-bit
//! values exist at the transfer boundary only: FLD/FSTP m80 and FSAVE/FRSTOR
//! convert on the way through.

pub mod ops;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Tag value: slot holds a valid non-zero number.
pub const TAG_VALID: u8 = 0;
/// Tag value: slot holds zero.
pub const TAG_ZERO: u8 = 1;
/// Tag value: slot holds a special (NaN/infinity/denormal) value.
pub const TAG_SPECIAL: u8 = 2;
/// Tag value: slot is empty.
pub const TAG_EMPTY: u8 = 3;
/// Hint bit: `st_i64` carries the integer originally loaded by FILD.
pub const TAG_UINT64: u8 = 1 << 2;

/// Status word condition bits.
pub const C0: u16 = 0x0100;
pub const C1: u16 = 0x0200;
pub const C2: u16 = 0x0400;
pub const C3: u16 = 0x4000;

/// Rounding control from `npxc[11:10]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Rounding {
    Nearest = 0,
    Down = 1,
    Up = 2,
    Chop = 3,
}

/// An MMX register aliased onto the FPU register storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MmxReg(pub u64);

impl MmxReg {
    #[inline]
    pub fn b(self, lane: usize) -> u8 {
        (self.0 >> (lane * 8)) as u8
    }

    #[inline]
    pub fn w(self, lane: usize) -> u16 {
        (self.0 >> (lane * 16)) as u16
    }

    #[inline]
    pub fn l(self, lane: usize) -> u32 {
        (self.0 >> (lane * 32)) as u32
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        MmxReg(u64::from_le_bytes(bytes))
    }

    pub fn from_words(words: [u16; 4]) -> Self {
        let mut v = 0u64;
        for (i, w) in words.iter().enumerate() {
            v |= u64::from(*w) << (i * 16);
        }
        MmxReg(v)
    }

    pub fn from_dwords(lo: u32, hi: u32) -> Self {
        MmxReg(u64::from(lo) | (u64::from(hi) << 32))
    }
}

/// The FPU register file and control state.
#[derive(Clone, Debug)]
pub struct Fpu {
    pub(crate) st: [f64; 8],
    pub(crate) st_i64: [u64; 8],
    pub(crate) mm: [MmxReg; 8],
    pub(crate) tag: [u8; 8],
    pub(crate) top: usize,
    /// Control word.
    pub(crate) npxc: u16,
    /// Status word (TOP is folded in on read).
    pub(crate) npxs: u16,
    pub(crate) ismmx: bool,
    // Last-instruction pointers for the environment image.
    pub(crate) pc_off: u32,
    pub(crate) pc_seg: u16,
    pub(crate) op_off: u32,
    pub(crate) op_seg: u16,
}

impl Default for Fpu {
    fn default() -> Self {
        let mut fpu = Fpu {
            st: [0.0; 8],
            st_i64: [0; 8],
            mm: [MmxReg::default(); 8],
            tag: [TAG_EMPTY; 8],
            top: 0,
            npxc: 0,
            npxs: 0,
            ismmx: false,
            pc_off: 0,
            pc_seg: 0,
            op_off: 0,
            op_seg: 0,
        };
        fpu.init();
        fpu
    }
}

impl Fpu {
    /// FNINIT semantics.
    pub(crate) fn init(&mut self) {
        self.npxc = 0x037f;
        self.npxs = 0;
        self.tag = [TAG_EMPTY; 8];
        self.top = 0;
        self.ismmx = false;
        self.pc_off = 0;
        self.pc_seg = 0;
        self.op_off = 0;
        self.op_seg = 0;
    }

    #[inline]
    pub(crate) fn st_index(&self, i: usize) -> usize {
        (self.top + i) & 7
    }

    /// Architectural tag word (two bits per physical slot).
    pub(crate) fn gettag(&self) -> u16 {
        let mut out = 0u16;
        for (i, tag) in self.tag.iter().enumerate() {
            let bits = if tag & TAG_UINT64 != 0 {
                u16::from(TAG_SPECIAL)
            } else {
                u16::from(tag & 3)
            };
            out |= bits << (i * 2);
        }
        out
    }

    pub(crate) fn settag(&mut self, word: u16) {
        for (i, tag) in self.tag.iter_mut().enumerate() {
            *tag = ((word >> (i * 2)) & 3) as u8;
        }
    }

    /// Status word with TOP folded into bits 11..13.
    pub(crate) fn status(&self) -> u16 {
        (self.npxs & !0x3800) | (((self.top as u16) & 7) << 11)
    }

    pub(crate) fn set_status(&mut self, word: u16) {
        self.npxs = word;
        self.top = usize::from((word >> 11) & 7);
    }

    pub(crate) fn rounding(&self) -> Rounding {
        Rounding::from_u16((self.npxc >> 10) & 3).unwrap_or(Rounding::Nearest)
    }

    /// Tag for a freshly stored value.
    pub(crate) fn tag_of(v: f64) -> u8 {
        if v == 0.0 {
            TAG_ZERO
        } else if v.is_nan() || v.is_infinite() {
            TAG_SPECIAL
        } else {
            TAG_VALID
        }
    }

    /// Pushes `v`, rotating TOP down with wraparound.
    pub(crate) fn push(&mut self, v: f64) {
        self.top = self.top.wrapping_sub(1) & 7;
        self.st[self.top] = v;
        self.tag[self.top] = Fpu::tag_of(v);
    }

    /// Pops ST(0), marking the slot empty.
    pub(crate) fn pop(&mut self) {
        self.tag[self.top] = TAG_EMPTY;
        self.top = (self.top + 1) & 7;
    }

    /// Entering MMX forces an all-valid tag word and TOP = 0; the MM
    /// registers alias the same storage.
    pub(crate) fn enter_mmx(&mut self) {
        if !self.ismmx {
            self.ismmx = true;
        }
        self.tag = [TAG_VALID; 8];
        self.top = 0;
    }

    /// EMMS: leave MMX with every slot empty.
    pub(crate) fn emms(&mut self) {
        self.tag = [TAG_EMPTY; 8];
        self.ismmx = false;
    }

    /// Rounds to integer honoring `npxc[11:10]`.
    pub(crate) fn round_to_i64(&self, v: f64) -> i64 {
        let r = match self.rounding() {
            Rounding::Nearest => {
                // Round-half-even.
                let floor = v.floor();
                let diff = v - floor;
                if diff > 0.5 {
                    floor + 1.0
                } else if diff < 0.5 {
                    floor
                } else if (floor as i64) & 1 == 0 {
                    floor
                } else {
                    floor + 1.0
                }
            }
            Rounding::Down => v.floor(),
            Rounding::Up => v.ceil(),
            Rounding::Chop => v.trunc(),
        };
        r as i64
    }
}

/// Converts an 80-bit extended value (mantissa, sign/exponent word) to f64.
pub(crate) fn f64_from_ext(mant: u64, exp_sign: u16) -> f64 {
    let sign = exp_sign & 0x8000 != 0;
    let exp = i32::from(exp_sign & 0x7fff);
    if exp == 0 && mant == 0 {
        return if sign { -0.0 } else { 0.0 };
    }
    if exp == 0x7fff {
        // Infinity when the fraction below the integer bit is clear.
        let v = if mant << 1 == 0 { f64::INFINITY } else { f64::NAN };
        return if sign { -v } else { v };
    }
    let v = ldexp(mant as f64, exp - 16383 - 63);
    if sign {
        -v
    } else {
        v
    }
}

/// Scales by a power of two without intermediate under/overflow.
fn ldexp(mut x: f64, mut e: i32) -> f64 {
    while e > 1000 {
        x *= 2f64.powi(1000);
        e -= 1000;
    }
    while e < -1000 {
        x *= 2f64.powi(-1000);
        e += 1000;
    }
    x * 2f64.powi(e)
}

/// Exact 80-bit encoding of a 64-bit integer: the image FILD leaves in a
/// register, with the full mantissa intact.
pub(crate) fn ext_from_i64(v: i64) -> (u64, u16) {
    let sign = if v < 0 { 0x8000u16 } else { 0 };
    let mag = v.unsigned_abs();
    if mag == 0 {
        return (0, sign);
    }
    let shift = mag.leading_zeros();
    (mag << shift, sign | (16383 + 63 - shift) as u16)
}

/// Recovers the exact 64-bit integer from an 80-bit image when the value
/// is integral and in range. Used by FRSTOR to rebuild the FILD fast-path
/// shadow from the image itself rather than from any side channel.
pub(crate) fn i64_from_ext_exact(mant: u64, exp_sign: u16) -> Option<i64> {
    let exp_field = exp_sign & 0x7fff;
    if mant == 0 && exp_field == 0 {
        return Some(0);
    }
    let exp = i32::from(exp_field) - 16383;
    if !(0..=63).contains(&exp) {
        return None;
    }
    let frac_bits = (63 - exp) as u32;
    if frac_bits > 0 && mant.trailing_zeros() < frac_bits {
        return None;
    }
    let mag = mant >> frac_bits;
    if exp_sign & 0x8000 != 0 {
        if mag > 1u64 << 63 {
            return None;
        }
        Some(mag.wrapping_neg() as i64)
    } else if mag >= 1u64 << 63 {
        None
    } else {
        Some(mag as i64)
    }
}

/// Converts an f64 to the 80-bit extended pair (mantissa, sign/exponent).
pub(crate) fn ext_from_f64(v: f64) -> (u64, u16) {
    let bits = v.to_bits();
    let sign = ((bits >> 63) as u16) << 15;
    let exp11 = ((bits >> 52) & 0x7ff) as i32;
    let frac = bits & 0x000f_ffff_ffff_ffff;
    if exp11 == 0 {
        if frac == 0 {
            return (0, sign);
        }
        // Denormal double: normalize into the extended format.
        let shift = frac.leading_zeros() as i32 - 11;
        let mant = frac << (shift + 11);
        let exp = -1022 - shift + 16383;
        return (mant, sign | exp as u16);
    }
    if exp11 == 0x7ff {
        let mant = 0x8000_0000_0000_0000 | (frac << 11);
        return (mant, sign | 0x7fff);
    }
    let mant = 0x8000_0000_0000_0000 | (frac << 11);
    let exp = exp11 - 1023 + 16383;
    (mant, sign | exp as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_wraps_top_and_tags_zero() {
        let mut fpu = Fpu::default();
        fpu.push(1.5);
        assert_eq!(fpu.top, 7);
        assert_eq!(fpu.tag[7], TAG_VALID);
        fpu.push(0.0);
        assert_eq!(fpu.top, 6);
        assert_eq!(fpu.tag[6], TAG_ZERO);
        fpu.pop();
        assert_eq!(fpu.tag[6], TAG_EMPTY);
        assert_eq!(fpu.top, 7);
    }

    #[test]
    fn extended_round_trip_is_exact() {
        for &v in &[
            0.0f64,
            -0.0,
            1.0,
            -1.0,
            3.141592653589793,
            1.5e300,
            -2.2250738585072014e-308,
            f64::INFINITY,
        ] {
            let (mant, es) = ext_from_f64(v);
            let back = f64_from_ext(mant, es);
            assert_eq!(v.to_bits(), back.to_bits(), "value {}", v);
        }
    }

    #[test]
    fn nearest_rounding_is_half_even() {
        let fpu = Fpu::default();
        assert_eq!(fpu.round_to_i64(2.5), 2);
        assert_eq!(fpu.round_to_i64(3.5), 4);
        assert_eq!(fpu.round_to_i64(-2.5), -2);
        assert_eq!(fpu.round_to_i64(2.4), 2);
    }

    #[test]
    fn i64_image_round_trips_exactly() {
        for &v in &[
            0i64,
            1,
            -1,
            42,
            i64::MAX,
            i64::MIN,
            0x1234_5678_9abc_def1u64 as i64,
            -0x0fed_cba9_8765_4321,
        ] {
            let (mant, exp_sign) = ext_from_i64(v);
            assert_eq!(i64_from_ext_exact(mant, exp_sign), Some(v), "value {}", v);
        }
    }

    #[test]
    fn non_integral_images_do_not_reconstruct() {
        let (mant, exp_sign) = ext_from_f64(2.5);
        assert_eq!(i64_from_ext_exact(mant, exp_sign), None);
        let (mant, exp_sign) = ext_from_f64(-f64::INFINITY);
        assert_eq!(i64_from_ext_exact(mant, exp_sign), None);
        let (mant, exp_sign) = ext_from_f64(1.0e300);
        assert_eq!(i64_from_ext_exact(mant, exp_sign), None);
        // Integral floats are recoverable; that only ever widens the
        // FIST fast path to the same result.
        let (mant, exp_sign) = ext_from_f64(2.0);
        assert_eq!(i64_from_ext_exact(mant, exp_sign), Some(2));
    }

    #[test]
    fn mmx_entry_resets_the_stack_view() {
        let mut fpu = Fpu::default();
        fpu.push(1.0);
        fpu.enter_mmx();
        assert_eq!(fpu.top, 0);
        assert!(fpu.tag.iter().all(|&t| t == TAG_VALID));
        fpu.emms();
        assert!(fpu.tag.iter().all(|&t| t == TAG_EMPTY));
    }
}
