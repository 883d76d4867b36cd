//! Output pixel format descriptors and flat-buffer addressing.
//!
//! [`PixelFormat`] describes what a sink hands to the outside world: how many
//! channels per pixel, the numeric type of each sample, and the byte order.
//! The pipeline works in planar `f32` internally; these types only matter at
//! the sink boundary.

use core::fmt;

// ---------------------------------------------------------------------------
// Descriptor enums
// ---------------------------------------------------------------------------

/// Numeric type of a single output sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ChannelType {
    /// 8-bit unsigned integer, `[0, 1]` mapped to `0..=255`.
    U8,
    /// 16-bit unsigned integer, `[0, 1]` mapped to `0..=65535`.
    U16,
    /// IEEE-754 binary16, unclamped.
    F16,
    /// IEEE-754 binary32, passed through unchanged.
    F32,
}

impl ChannelType {
    /// Byte size of a single sample.
    #[inline]
    pub const fn byte_size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 | Self::F16 => 2,
            Self::F32 => 4,
        }
    }
}

/// Channel layout (number and meaning of interleaved channels).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u8)]
pub enum ChannelLayout {
    /// Single luminance channel.
    Gray = 1,
    /// Luminance + alpha.
    GrayAlpha = 2,
    /// Red, green, blue.
    Rgb = 3,
    /// Red, green, blue, alpha.
    Rgba = 4,
}

impl ChannelLayout {
    /// Number of channels in this layout.
    #[inline]
    pub const fn channels(self) -> usize {
        self as usize
    }

    /// Number of color (non-alpha) channels: 1 for gray layouts, 3 otherwise.
    #[inline]
    pub const fn color_channels(self) -> usize {
        match self {
            Self::Gray | Self::GrayAlpha => 1,
            Self::Rgb | Self::Rgba => 3,
        }
    }

    /// Whether this layout includes an alpha channel.
    #[inline]
    pub const fn has_alpha(self) -> bool {
        matches!(self, Self::GrayAlpha | Self::Rgba)
    }
}

/// Byte order of multi-byte output samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Endianness {
    /// Whatever the host uses.
    #[default]
    Native,
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

impl Endianness {
    /// Whether samples must be byte-swapped relative to the host order.
    #[inline]
    pub const fn needs_swap(self) -> bool {
        match self {
            Self::Native => false,
            Self::Little => cfg!(target_endian = "big"),
            Self::Big => cfg!(target_endian = "little"),
        }
    }
}

// ---------------------------------------------------------------------------
// PixelFormat
// ---------------------------------------------------------------------------

/// Interleaved output format requested from a sink.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PixelFormat {
    /// Channel layout (gray, gray+alpha, RGB, RGBA).
    pub layout: ChannelLayout,
    /// Sample storage type.
    pub channel_type: ChannelType,
    /// Byte order of multi-byte samples.
    pub endianness: Endianness,
}

impl PixelFormat {
    /// Create a native-endian format.
    pub const fn new(layout: ChannelLayout, channel_type: ChannelType) -> Self {
        Self {
            layout,
            channel_type,
            endianness: Endianness::Native,
        }
    }

    /// Same format with a different byte order.
    pub const fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    // Named constants ---------------------------------------------------------

    /// 8-bit grayscale.
    pub const GRAY8: Self = Self::new(ChannelLayout::Gray, ChannelType::U8);
    /// 8-bit grayscale with alpha.
    pub const GRAYA8: Self = Self::new(ChannelLayout::GrayAlpha, ChannelType::U8);
    /// 8-bit RGB.
    pub const RGB8: Self = Self::new(ChannelLayout::Rgb, ChannelType::U8);
    /// 8-bit RGBA.
    pub const RGBA8: Self = Self::new(ChannelLayout::Rgba, ChannelType::U8);
    /// 16-bit RGB.
    pub const RGB16: Self = Self::new(ChannelLayout::Rgb, ChannelType::U16);
    /// 16-bit RGBA.
    pub const RGBA16: Self = Self::new(ChannelLayout::Rgba, ChannelType::U16);
    /// Half-float RGBA.
    pub const RGBAF16: Self = Self::new(ChannelLayout::Rgba, ChannelType::F16);
    /// f32 RGB.
    pub const RGBF32: Self = Self::new(ChannelLayout::Rgb, ChannelType::F32);
    /// f32 RGBA.
    pub const RGBAF32: Self = Self::new(ChannelLayout::Rgba, ChannelType::F32);

    // Methods -----------------------------------------------------------------

    /// Bytes per pixel.
    #[inline]
    pub const fn bytes_per_pixel(self) -> usize {
        self.channel_type.byte_size() * self.layout.channels()
    }

    /// Number of interleaved channels.
    #[inline]
    pub const fn channels(self) -> usize {
        self.layout.channels()
    }

    /// Whether this format carries an alpha channel.
    #[inline]
    pub const fn has_alpha(self) -> bool {
        self.layout.has_alpha()
    }

    /// Whether multi-byte samples are swapped relative to host order.
    ///
    /// Always false for 8-bit samples.
    #[inline]
    pub const fn swap_endianness(self) -> bool {
        self.channel_type.byte_size() > 1 && self.endianness.needs_swap()
    }
}

// ---------------------------------------------------------------------------
// BufferError
// ---------------------------------------------------------------------------

/// Errors from caller-supplied buffer validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum BufferError {
    /// Buffer is too small for the given stride and height.
    InsufficientData,
    /// Stride is smaller than `width * bytes_per_pixel`.
    StrideTooSmall,
    /// Width, height or stride is zero or causes overflow.
    InvalidDimensions,
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => {
                write!(f, "buffer is too small for the given stride and height")
            }
            Self::StrideTooSmall => write!(f, "stride is smaller than width * bytes_per_pixel"),
            Self::InvalidDimensions => write!(f, "dimensions are zero or cause overflow"),
        }
    }
}

impl std::error::Error for BufferError {}

/// Minimum bytes needed for `rows` rows of `row_bytes` each, `stride` apart.
///
/// The last row does not need trailing padding.
pub fn required_bytes(rows: usize, stride: usize, row_bytes: usize) -> Result<usize, BufferError> {
    if rows == 0 {
        return Ok(0);
    }
    let preceding = (rows - 1)
        .checked_mul(stride)
        .ok_or(BufferError::InvalidDimensions)?;
    preceding
        .checked_add(row_bytes)
        .ok_or(BufferError::InvalidDimensions)
}

/// Byte offset of pixel `x` in row `y` of an interleaved buffer.
#[inline]
pub(crate) fn pixel_offset(x: usize, y: usize, stride: usize, bytes_per_pixel: usize) -> usize {
    y * stride + x * bytes_per_pixel
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_type_byte_size() {
        assert_eq!(ChannelType::U8.byte_size(), 1);
        assert_eq!(ChannelType::U16.byte_size(), 2);
        assert_eq!(ChannelType::F16.byte_size(), 2);
        assert_eq!(ChannelType::F32.byte_size(), 4);
    }

    #[test]
    fn layout_channels() {
        assert_eq!(ChannelLayout::Gray.channels(), 1);
        assert_eq!(ChannelLayout::Rgba.channels(), 4);
        assert_eq!(ChannelLayout::GrayAlpha.color_channels(), 1);
        assert_eq!(ChannelLayout::Rgba.color_channels(), 3);
        assert!(ChannelLayout::GrayAlpha.has_alpha());
        assert!(!ChannelLayout::Rgb.has_alpha());
    }

    #[test]
    fn format_bytes_per_pixel() {
        assert_eq!(PixelFormat::GRAY8.bytes_per_pixel(), 1);
        assert_eq!(PixelFormat::RGB8.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::RGBA16.bytes_per_pixel(), 8);
        assert_eq!(PixelFormat::RGBAF16.bytes_per_pixel(), 8);
        assert_eq!(PixelFormat::RGBAF32.bytes_per_pixel(), 16);
    }

    #[test]
    fn swap_follows_host_order() {
        assert!(!PixelFormat::RGBA16.swap_endianness());
        let little = PixelFormat::RGBA16.with_endianness(Endianness::Little);
        let big = PixelFormat::RGBA16.with_endianness(Endianness::Big);
        assert_ne!(little.swap_endianness(), big.swap_endianness());
        // Single bytes never swap.
        assert!(
            !PixelFormat::RGBA8
                .with_endianness(Endianness::Big)
                .swap_endianness()
        );
        assert!(
            !PixelFormat::RGBA8
                .with_endianness(Endianness::Little)
                .swap_endianness()
        );
    }

    #[test]
    fn required_bytes_skips_last_padding() {
        assert_eq!(required_bytes(0, 100, 30), Ok(0));
        assert_eq!(required_bytes(1, 100, 30), Ok(30));
        assert_eq!(required_bytes(3, 100, 30), Ok(230));
        assert_eq!(
            required_bytes(usize::MAX, 2, 1),
            Err(BufferError::InvalidDimensions)
        );
    }

    #[test]
    fn pixel_offset_addressing() {
        assert_eq!(pixel_offset(0, 0, 8, 4), 0);
        assert_eq!(pixel_offset(1, 0, 8, 4), 4);
        assert_eq!(pixel_offset(1, 1, 8, 4), 12);
    }

    #[test]
    fn error_display() {
        assert!(
            BufferError::StrideTooSmall
                .to_string()
                .contains("stride")
        );
    }
}
