use std::sync::{Mutex, PoisonError};

use crate::buffer::{BufferError, pixel_offset, required_bytes};
use crate::channel::ChannelMode;
use crate::convert::{Kernels, LANES};
use crate::error::PipelineResult;
use crate::row::{InputRows, RowPosition};

/// Writes interleaved 8-bit RGB or RGBA into a caller-owned buffer.
///
/// Pixel `(x, y)` lands at byte `y * stride + x * bytes_per_pixel`. Samples
/// are clamped to `[0, 1]`, scaled by 255 and rounded half to even. Without
/// an alpha channel the alpha byte is always 255 and no alpha plane is read.
///
/// ```
/// use zenstage::RawBufferSink;
///
/// let mut buf = vec![0u8; 8 * 2];
/// let sink = RawBufferSink::new(&mut buf, 8, 2)
///     .unwrap()
///     .with_rgba(true);
/// assert_eq!(sink.bytes_per_pixel(), 4);
/// ```
pub struct RawBufferSink<'a> {
    rows: Vec<Mutex<&'a mut [u8]>>,
    stride: usize,
    height: usize,
    len: usize,
    rgba: bool,
    alpha_channel: Option<usize>,
    kernels: Kernels,
}

impl<'a> RawBufferSink<'a> {
    /// Target `height` rows of `buf`, `stride` bytes apart.
    ///
    /// The last row may be shorter than `stride` as long as it holds the
    /// pixels; that is checked once the frame width is known.
    ///
    /// # Errors
    ///
    /// Fails if `stride` is zero or `buf` holds fewer than `height` rows.
    pub fn new(buf: &'a mut [u8], stride: usize, height: usize) -> Result<Self, BufferError> {
        if stride == 0 {
            return Err(BufferError::StrideTooSmall);
        }
        let rows: Vec<&'a mut [u8]> = buf.chunks_mut(stride).take(height).collect();
        if rows.len() < height {
            return Err(BufferError::InsufficientData);
        }
        let len = rows.iter().map(|r| r.len()).sum();
        Ok(Self {
            rows: rows.into_iter().map(Mutex::new).collect(),
            stride,
            height,
            len,
            rgba: false,
            alpha_channel: None,
            kernels: Kernels::detect(),
        })
    }

    /// Write four bytes per pixel instead of three.
    pub fn with_rgba(mut self, rgba: bool) -> Self {
        self.rgba = rgba;
        self
    }

    /// Take alpha from channel `c` instead of writing 255.
    pub fn with_alpha_channel(mut self, c: usize) -> Self {
        self.alpha_channel = Some(c);
        self
    }

    /// Force a kernel implementation.
    pub fn with_kernels(mut self, kernels: Kernels) -> Self {
        self.kernels = kernels;
        self
    }

    /// 3 or 4.
    pub fn bytes_per_pixel(&self) -> usize {
        if self.rgba { 4 } else { 3 }
    }

    /// Rows in the target buffer.
    pub fn height(&self) -> usize {
        self.height
    }

    pub(crate) fn channel_mode(&self, c: usize) -> ChannelMode {
        if c < 3 || self.alpha_channel == Some(c) {
            ChannelMode::Input
        } else {
            ChannelMode::Ignored
        }
    }

    pub(crate) fn min_channels(&self) -> usize {
        self.alpha_channel.map_or(3, |a| (a + 1).max(3))
    }

    pub(crate) fn set_input_sizes(&mut self, sizes: &[(usize, usize)]) -> PipelineResult<()> {
        let width = sizes.first().map_or(0, |s| s.0);
        let row_bytes = width
            .checked_mul(self.bytes_per_pixel())
            .ok_or(BufferError::InvalidDimensions)?;
        if row_bytes > self.stride {
            return Err(BufferError::StrideTooSmall.into());
        }
        if required_bytes(self.height, self.stride, row_bytes)? > self.len {
            return Err(BufferError::InsufficientData.into());
        }
        Ok(())
    }

    pub(crate) fn process_row(&self, input: &InputRows<'_>, pos: RowPosition) -> PipelineResult<()> {
        debug_assert_eq!(pos.xextra, 0, "WriteToU8 does not use a border");
        let Some(row) = self.rows.get(pos.ypos) else {
            return Ok(());
        };
        let bytes = self.bytes_per_pixel();
        let start = pixel_offset(pos.xpos, 0, self.stride, bytes);
        let mut row = row.lock().unwrap_or_else(PoisonError::into_inner);
        let out = row
            .get_mut(start..start + pos.xsize * bytes)
            .ok_or(BufferError::InsufficientData)?;

        let first = input.pad();
        let color = [input.row(0), input.row(1), input.row(2)];
        let alpha = match self.alpha_channel {
            Some(c) if self.rgba => Some(input.row(c)),
            _ => None,
        };

        let mut q = [[0u8; LANES]; 4];
        for (chunk, dst) in out.chunks_mut(LANES * bytes).enumerate() {
            let x0 = first + chunk * LANES;
            let n = dst.len() / bytes;
            for (src, lane) in color.iter().zip(&mut q) {
                self.kernels.quantize_u8(&src[x0..x0 + n], &mut lane[..n]);
            }
            match alpha {
                Some(a) => self.kernels.quantize_u8(&a[x0..x0 + n], &mut q[3][..n]),
                None => q[3][..n].fill(255),
            }
            for (i, px) in dst.chunks_exact_mut(bytes).enumerate() {
                px[0] = q[0][i];
                px[1] = q[1][i];
                px[2] = q[2][i];
                if bytes == 4 {
                    px[3] = q[3][i];
                }
            }
        }
        Ok(())
    }
}

impl core::fmt::Debug for RawBufferSink<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RawBufferSink")
            .field("stride", &self.stride)
            .field("height", &self.height)
            .field("rgba", &self.rgba)
            .field("alpha_channel", &self.alpha_channel)
            .field("kernels", &self.kernels)
            .finish_non_exhaustive()
    }
}
