//! Terminal stages that materialize pixels.
//!
//! A sink is always the last stage of a pipeline and never forwards data.
//! Each one targets a different consumer:
//!
//! | sink | target | conversion |
//! |---|---|---|
//! | [`RawBufferSink`] | caller's interleaved byte buffer | 8-bit RGB/RGBA |
//! | [`PixelCallbackSink`] | caller's [`PixelCallback`] | u8/u16/f16/f32, byte order, orientation, unpremultiply |
//! | [`FrameBufferSink`] | an [`ImageBundle`](crate::ImageBundle) | none |
//! | [`PlanarBufferSink`] | an [`Image3F`](crate::Image3F) | none |
//!
//! # Contract
//!
//! - Setup hooks run before the first row: the driver calls
//!   `set_input_sizes` at build time and `prepare_for_threads` at the start
//!   of a run.
//! - Rows at `ypos >= height` are skipped without touching the target.
//! - Targets are partitioned by row, so workers on different rows never
//!   write overlapping memory. Each output row sits behind its own lock,
//!   which is uncontended in practice.
//! - Dropping a sink releases everything it acquired, including the
//!   callback's run handle.

mod callback;
mod frame;
mod raw;

pub use callback::{MAX_PIXELS_PER_CALL, PixelCallback, PixelCallbackSink, PixelRun};
pub use frame::{FrameBufferSink, PlanarBufferSink};
pub use raw::RawBufferSink;
