use std::sync::{Mutex, PoisonError};

use crate::buffer::{ChannelType, PixelFormat};
use crate::channel::ChannelMode;
use crate::convert::{Kernels, swap_f32_in_place, swap_u16_in_place, unpremultiply_interleaved};
use crate::error::{CallbackError, PipelineError, PipelineResult};
use crate::image::try_filled_vec;
use crate::orientation::Orientation;
use crate::row::{InputRows, RowPosition};

/// Largest number of pixels handed to [`PixelRun::run`] in one call.
pub const MAX_PIXELS_PER_CALL: usize = 1024;

/// A caller-supplied pixel consumer.
///
/// The sink calls [`init`](PixelCallback::init) exactly once, before any row
/// is processed, and keeps the returned [`PixelRun`] until the sink is
/// dropped. Dropping the handle is the teardown signal.
///
/// # Example implementation
///
/// ```
/// use std::sync::Mutex;
/// use zenstage::{CallbackError, PixelCallback, PixelRun};
///
/// struct Collect {
///     rows: Mutex<Vec<(usize, usize, usize)>>,
/// }
///
/// struct CollectRun<'a>(&'a Collect);
///
/// impl PixelRun for CollectRun<'_> {
///     fn run(
///         &self,
///         _thread_id: usize,
///         x: usize,
///         y: usize,
///         num_pixels: usize,
///         _pixels: &[u8],
///     ) -> Result<(), CallbackError> {
///         self.0.rows.lock().unwrap().push((x, y, num_pixels));
///         Ok(())
///     }
/// }
///
/// impl PixelCallback for Collect {
///     fn init(
///         &self,
///         _num_threads: usize,
///         _max_pixels_per_call: usize,
///     ) -> Result<Box<dyn PixelRun + '_>, CallbackError> {
///         Ok(Box::new(CollectRun(self)))
///     }
/// }
/// ```
pub trait PixelCallback: Sync {
    /// Prepare for `num_threads` workers delivering at most
    /// `max_pixels_per_call` pixels per call.
    ///
    /// # Errors
    ///
    /// An error aborts the frame before any pixel is delivered.
    fn init(
        &self,
        num_threads: usize,
        max_pixels_per_call: usize,
    ) -> Result<Box<dyn PixelRun + '_>, CallbackError>;
}

/// Per-frame state returned by [`PixelCallback::init`].
///
/// `run` is called concurrently from different workers; calls with the same
/// `thread_id` never overlap. `pixels` holds `num_pixels` interleaved pixels
/// in the sink's [`PixelFormat`], starting at output position `(x, y)` and
/// running along x.
pub trait PixelRun: Send + Sync {
    /// Receive one batch.
    ///
    /// # Errors
    ///
    /// An error aborts the frame; the sink does not retry.
    fn run(
        &self,
        thread_id: usize,
        x: usize,
        y: usize,
        num_pixels: usize,
        pixels: &[u8],
    ) -> Result<(), CallbackError>;
}

/// One worker's conversion buffers. 32-bit output is delivered straight
/// from `floats`, 16-bit from `words`, 8-bit from `bytes`.
struct Scratch {
    floats: Vec<f32>,
    words: Vec<u16>,
    bytes: Vec<u8>,
}

/// Streams pixels to a [`PixelCallback`] in batches of up to
/// [`MAX_PIXELS_PER_CALL`].
///
/// Per batch, in order: gather interleaved samples (constant 1.0 alpha if
/// the format wants alpha the frame lacks), unpremultiply, undo the
/// horizontal flip, narrow to the output type, byte-swap. Vertical flip is
/// applied to the row coordinate up front. Under transpose every pixel is a
/// separate call with x and y swapped.
pub struct PixelCallbackSink<'a> {
    callback: &'a dyn PixelCallback,
    run: Option<Box<dyn PixelRun + 'a>>,
    width: usize,
    height: usize,
    format: PixelFormat,
    alpha_channel: Option<usize>,
    unpremultiply: bool,
    orientation: Orientation,
    kernels: Kernels,
    scratch: Vec<Mutex<Scratch>>,
}

impl<'a> PixelCallbackSink<'a> {
    /// Deliver a `width` x `height` frame in `format`.
    ///
    /// Color is read from channel 0 (gray layouts) or channels 0..3.
    pub fn new(
        callback: &'a dyn PixelCallback,
        width: usize,
        height: usize,
        format: PixelFormat,
    ) -> Self {
        Self {
            callback,
            run: None,
            width,
            height,
            format,
            alpha_channel: None,
            unpremultiply: false,
            orientation: Orientation::Identity,
            kernels: Kernels::detect(),
            scratch: Vec::new(),
        }
    }

    /// Read alpha from channel `c`.
    pub fn with_alpha_channel(mut self, c: usize) -> Self {
        self.alpha_channel = Some(c);
        self
    }

    /// Divide color by alpha before conversion. Only applies when the frame
    /// has alpha and the format carries it.
    pub fn with_unpremultiply(mut self, unpremultiply: bool) -> Self {
        self.unpremultiply = unpremultiply;
        self
    }

    /// Undo the frame's stored orientation while streaming.
    pub fn with_undo_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    /// Force a kernel implementation.
    pub fn with_kernels(mut self, kernels: Kernels) -> Self {
        self.kernels = kernels;
        self
    }

    /// Output pixel format.
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    fn num_color(&self) -> usize {
        self.format.layout.color_channels()
    }

    pub(crate) fn channel_mode(&self, c: usize) -> ChannelMode {
        if c < self.num_color() || self.alpha_channel == Some(c) {
            ChannelMode::Input
        } else {
            ChannelMode::Ignored
        }
    }

    pub(crate) fn min_channels(&self) -> usize {
        let color = self.num_color();
        self.alpha_channel.map_or(color, |a| (a + 1).max(color))
    }

    pub(crate) fn prepare_for_threads(&mut self, num_threads: usize) -> PipelineResult<()> {
        // A second prepare replaces the handle; the old one is released first.
        self.run = None;
        let run = self
            .callback
            .init(num_threads, MAX_PIXELS_PER_CALL)
            .map_err(|err| {
                tracing::warn!(error = %err, "pixel callback init failed");
                PipelineError::CallbackInit(err)
            })?;
        self.run = Some(run);

        let samples = MAX_PIXELS_PER_CALL * self.format.channels();
        let word_len = match self.format.channel_type {
            ChannelType::U16 | ChannelType::F16 => samples,
            ChannelType::U8 | ChannelType::F32 => 0,
        };
        let byte_len = match self.format.channel_type {
            ChannelType::U8 => samples,
            ChannelType::U16 | ChannelType::F16 | ChannelType::F32 => 0,
        };
        self.scratch = (0..num_threads)
            .map(|_| -> PipelineResult<Mutex<Scratch>> {
                Ok(Mutex::new(Scratch {
                    floats: try_filled_vec(samples, 0.0, "callback scratch")?,
                    words: try_filled_vec(word_len, 0, "callback scratch")?,
                    bytes: try_filled_vec(byte_len, 0, "callback scratch")?,
                }))
            })
            .collect::<PipelineResult<_>>()?;
        tracing::debug!(
            num_threads,
            format = ?self.format,
            orientation = ?self.orientation,
            "pixel callback ready"
        );
        Ok(())
    }

    pub(crate) fn process_row(&self, input: &InputRows<'_>, pos: RowPosition) -> PipelineResult<()> {
        let run = self
            .run
            .as_deref()
            .ok_or(PipelineError::NotPrepared("WritePixelCB"))?;
        if pos.ypos >= self.height {
            return Ok(());
        }
        let scratch = self
            .scratch
            .get(pos.thread_id)
            .ok_or(PipelineError::NotPrepared("WritePixelCB"))?;
        let mut scratch = scratch.lock().unwrap_or_else(PoisonError::into_inner);
        let Scratch {
            floats,
            words,
            bytes,
        } = &mut *scratch;

        let num_channels = self.format.channels();
        let num_color = self.num_color();
        let want_alpha = self.format.has_alpha();
        let mut color: [&[f32]; 3] = [&[]; 3];
        for (c, row) in color.iter_mut().enumerate().take(num_color) {
            *row = input.row(c);
        }
        let alpha = self.alpha_channel.map(|c| input.row(c));
        let unpremultiply = alpha.is_some() && want_alpha && self.unpremultiply;

        let y = if self.orientation.flips_y() {
            self.height - 1 - pos.ypos
        } else {
            pos.ypos
        };
        // Frame columns to deliver: border samples only where they exist.
        let first = pos.xpos - pos.xextra.min(pos.xpos);
        let end = (pos.xpos + pos.xsize + pos.xextra).min(self.width);
        let swap = self.format.swap_endianness();

        let mut xstart = first;
        while xstart < end {
            let xlen = (end - xstart).min(MAX_PIXELS_PER_CALL);
            let len = xlen * num_channels;
            let temp = &mut floats[..len];
            let offset = input.pad() + xstart - pos.xpos;
            for (i, px) in temp.chunks_exact_mut(num_channels).enumerate() {
                for (c, row) in color.iter().enumerate().take(num_color) {
                    px[c] = row[offset + i];
                }
                if want_alpha {
                    px[num_color] = alpha.map_or(1.0, |a| a[offset + i]);
                }
            }
            if unpremultiply {
                unpremultiply_interleaved(temp, num_color);
            }
            let mut x = xstart;
            if self.orientation.flips_x() {
                for i in 0..xlen / 2 {
                    for c in 0..num_channels {
                        temp.swap(i * num_channels + c, (xlen - 1 - i) * num_channels + c);
                    }
                }
                x = self.width - xstart - xlen;
            }

            let out: &[u8] = match self.format.channel_type {
                ChannelType::F32 => {
                    if swap {
                        swap_f32_in_place(temp);
                    }
                    bytemuck::cast_slice(temp)
                }
                ChannelType::U16 | ChannelType::F16 => {
                    let words = &mut words[..len];
                    if self.format.channel_type == ChannelType::U16 {
                        self.kernels.quantize_u16(temp, words);
                    } else {
                        self.kernels.demote_f16(temp, words);
                    }
                    if swap {
                        swap_u16_in_place(words);
                    }
                    bytemuck::cast_slice(words)
                }
                ChannelType::U8 => {
                    let bytes = &mut bytes[..len];
                    self.kernels.quantize_u8(temp, bytes);
                    bytes
                }
            };
            self.deliver(run, pos.thread_id, x, y, xlen, out)?;
            xstart += xlen;
        }
        Ok(())
    }

    fn deliver(
        &self,
        run: &dyn PixelRun,
        thread_id: usize,
        x: usize,
        y: usize,
        xlen: usize,
        pixels: &[u8],
    ) -> PipelineResult<()> {
        if self.orientation.transposes() {
            // TODO: buffer 8x8 tiles so transposed output can be batched.
            let pixel_bytes = self.format.bytes_per_pixel();
            for (i, px) in pixels.chunks_exact(pixel_bytes).enumerate() {
                call(run, thread_id, y, x + i, 1, px)?;
            }
            Ok(())
        } else {
            call(run, thread_id, x, y, xlen, pixels)
        }
    }
}

fn call(
    run: &dyn PixelRun,
    thread_id: usize,
    x: usize,
    y: usize,
    num_pixels: usize,
    pixels: &[u8],
) -> PipelineResult<()> {
    run.run(thread_id, x, y, num_pixels, pixels).map_err(|source| {
        tracing::warn!(x, y, error = %source, "pixel callback aborted");
        PipelineError::Callback { x, y, source }
    })
}

impl core::fmt::Debug for PixelCallbackSink<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PixelCallbackSink")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("alpha_channel", &self.alpha_channel)
            .field("unpremultiply", &self.unpremultiply)
            .field("orientation", &self.orientation)
            .field("prepared", &self.run.is_some())
            .finish_non_exhaustive()
    }
}
