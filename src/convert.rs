//! Numeric conversion at the sink boundary.
//!
//! Integer outputs clamp to `[0, 1]`, scale, and round half to even. Half
//! floats are IEEE-754 binary16 with round-to-nearest-even, via `half`.
//! Two kernel sets implement the hot loops: a scalar reference and an
//! 8-lane `wide` variant. [`Kernels::detect`] picks one once per process;
//! both produce identical output.

use std::sync::OnceLock;

use half::f16;
use half::slice::{HalfBitsSliceExt, HalfFloatSliceExt};
use wide::f32x8;

/// Lane width of the vector kernels.
pub const LANES: usize = 8;

/// Smallest alpha used as a divisor when unpremultiplying.
pub const SMALL_ALPHA: f32 = 1.0 / (1u32 << 26) as f32;

/// Quantize one sample to 8 bits.
#[inline]
pub fn f32_to_u8(v: f32) -> u8 {
    // `as` saturates and maps NaN to 0.
    (v.clamp(0.0, 1.0) * 255.0).round_ties_even() as u8
}

/// Quantize one sample to 16 bits.
#[inline]
pub fn f32_to_u16(v: f32) -> u16 {
    (v.clamp(0.0, 1.0) * 65535.0).round_ties_even() as u16
}

/// Convert to IEEE-754 binary16 bits, rounding to nearest even.
#[inline]
pub fn f32_to_f16_bits(value: f32) -> u16 {
    f16::from_f32(value).to_bits()
}

/// Divide color channels of interleaved pixels by their alpha.
///
/// `pixels` holds `num_color + 1` samples per pixel, alpha last. Alpha is
/// clamped to at least [`SMALL_ALPHA`], so zero alpha never produces NaN or
/// infinity for finite color.
pub fn unpremultiply_interleaved(pixels: &mut [f32], num_color: usize) {
    for px in pixels.chunks_exact_mut(num_color + 1) {
        let multiplier = 1.0 / px[num_color].max(SMALL_ALPHA);
        for c in &mut px[..num_color] {
            *c *= multiplier;
        }
    }
}

/// Reverse the byte order of every sample in place.
pub fn swap_u16_in_place(samples: &mut [u16]) {
    for v in samples {
        *v = v.swap_bytes();
    }
}

/// Reverse the byte order of every sample in place.
pub fn swap_f32_in_place(samples: &mut [f32]) {
    for v in bytemuck::cast_slice_mut::<f32, u32>(samples) {
        *v = v.swap_bytes();
    }
}

// ---------------------------------------------------------------------------
// Kernels
// ---------------------------------------------------------------------------

/// Which kernel implementation is in use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KernelKind {
    /// One sample at a time.
    Scalar,
    /// [`LANES`]-wide `wide::f32x8` vectors with a scalar tail.
    Lanes,
}

type QuantizeU8 = fn(&[f32], &mut [u8]);
type QuantizeU16 = fn(&[f32], &mut [u16]);

/// Function table for the conversion hot loops.
#[derive(Clone, Copy)]
pub struct Kernels {
    kind: KernelKind,
    u8: QuantizeU8,
    u16: QuantizeU16,
    f16: QuantizeU16,
}

impl core::fmt::Debug for Kernels {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernels").field("kind", &self.kind).finish()
    }
}

impl Kernels {
    /// Best kernels for this target, selected once per process.
    pub fn detect() -> Self {
        static KERNELS: OnceLock<Kernels> = OnceLock::new();
        *KERNELS.get_or_init(|| {
            let kind = select_kind();
            tracing::debug!(?kind, "selected conversion kernels");
            Self::for_kind(kind)
        })
    }

    /// Kernels of a specific kind.
    pub fn for_kind(kind: KernelKind) -> Self {
        match kind {
            KernelKind::Scalar => Self {
                kind,
                u8: quantize_u8_scalar,
                u16: quantize_u16_scalar,
                f16: demote_f16_scalar,
            },
            KernelKind::Lanes => Self {
                kind,
                u8: quantize_u8_lanes,
                u16: quantize_u16_lanes,
                f16: demote_f16_lanes,
            },
        }
    }

    /// Which implementation this table dispatches to.
    pub fn kind(&self) -> KernelKind {
        self.kind
    }

    /// Clamp, scale and round `src` into `dst` as 8-bit samples.
    #[inline]
    pub fn quantize_u8(&self, src: &[f32], dst: &mut [u8]) {
        debug_assert_eq!(src.len(), dst.len());
        (self.u8)(src, dst)
    }

    /// Clamp, scale and round `src` into `dst` as 16-bit samples.
    #[inline]
    pub fn quantize_u16(&self, src: &[f32], dst: &mut [u16]) {
        debug_assert_eq!(src.len(), dst.len());
        (self.u16)(src, dst)
    }

    /// Demote `src` into binary16 bit patterns.
    #[inline]
    pub fn demote_f16(&self, src: &[f32], dst: &mut [u16]) {
        debug_assert_eq!(src.len(), dst.len());
        (self.f16)(src, dst)
    }
}

/// `wide` lowers `f32x8` to hardware vectors on these targets and to plain
/// arrays elsewhere.
fn select_kind() -> KernelKind {
    if cfg!(any(
        target_feature = "sse2",
        target_feature = "neon",
        target_feature = "simd128"
    )) {
        KernelKind::Lanes
    } else {
        KernelKind::Scalar
    }
}

fn quantize_u8_scalar(src: &[f32], dst: &mut [u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = f32_to_u8(*s);
    }
}

fn quantize_u16_scalar(src: &[f32], dst: &mut [u16]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = f32_to_u16(*s);
    }
}

fn demote_f16_scalar(src: &[f32], dst: &mut [u16]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = f32_to_f16_bits(*s);
    }
}

/// Clamp one vector to `[0, 1]`, scale by `max` and round half to even.
#[inline]
fn scale_lanes(src: &[f32], max: f32) -> [i32; LANES] {
    let mut lanes = [0.0f32; LANES];
    lanes.copy_from_slice(src);
    let v = f32x8::new(lanes);
    // NaN lanes are zeroed before the clamp.
    let v = v.is_nan().blend(f32x8::ZERO, v);
    let v = v.max(f32x8::ZERO).min(f32x8::ONE) * f32x8::splat(max);
    v.round_int().to_array()
}

fn quantize_u8_lanes(src: &[f32], dst: &mut [u8]) {
    let mut s = src.chunks_exact(LANES);
    let mut d = dst.chunks_exact_mut(LANES);
    for (sv, dv) in (&mut s).zip(&mut d) {
        for (o, v) in dv.iter_mut().zip(scale_lanes(sv, 255.0)) {
            *o = v as u8;
        }
    }
    quantize_u8_scalar(s.remainder(), d.into_remainder());
}

fn quantize_u16_lanes(src: &[f32], dst: &mut [u16]) {
    let mut s = src.chunks_exact(LANES);
    let mut d = dst.chunks_exact_mut(LANES);
    for (sv, dv) in (&mut s).zip(&mut d) {
        for (o, v) in dv.iter_mut().zip(scale_lanes(sv, 65535.0)) {
            *o = v as u16;
        }
    }
    quantize_u16_scalar(s.remainder(), d.into_remainder());
}

fn demote_f16_lanes(src: &[f32], dst: &mut [u16]) {
    // `half` converts whole slices with F16C/NEON when the CPU has them.
    dst.reinterpret_cast_mut::<f16>().convert_from_f32_slice(src);
}
