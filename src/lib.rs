//! Staged row-processing output pipeline for zen* image decoders.
//!
//! A decoder hands this crate its planar `f32` channels; a [`Pipeline`]
//! walks them row by row through a chain of [`Stage`]s and ends in a sink
//! that materializes pixels:
//!
//! - [`RawBufferSink`]: interleaved 8-bit RGB/RGBA into a caller buffer
//! - [`PixelCallbackSink`]: batches handed to a caller's [`PixelCallback`],
//!   with orientation undo, alpha handling, format and byte-order conversion
//! - [`FrameBufferSink`]: an [`ImageBundle`] with color plus extra channels
//! - [`PlanarBufferSink`]: a bare three-plane [`Image3F`]
//!
//! Stages declare per channel whether they read, rewrite or ignore it
//! ([`ChannelMode`]); the driver uses that to skip unused channels and to
//! size the horizontal border each stage sees. Work is split into square
//! groups that a [`RowRunner`] spreads over threads. Output does not depend
//! on the thread count.
//!
//! Logging goes through `tracing`; no subscriber is installed here.

#![forbid(unsafe_code)]

mod buffer;
mod channel;
mod color;
mod convert;
mod error;
mod image;
mod limits;
mod orientation;
mod pipeline;
mod row;
mod sink;
mod stage;
mod transform;

pub use buffer::{BufferError, ChannelLayout, ChannelType, Endianness, PixelFormat, required_bytes};
pub use channel::{ChannelMode, ChannelPlan, negotiate, stage_padding};
pub use color::{Cicp, ColorEncoding};
pub use convert::{
    KernelKind, Kernels, f32_to_f16_bits, f32_to_u8, f32_to_u16, swap_f32_in_place,
    swap_u16_in_place, unpremultiply_interleaved,
};
pub use error::{CallbackError, PipelineError, PipelineResult};
pub use image::{Image3F, ImageBundle, Plane, plane_row, try_alloc_plane};
pub use limits::{LimitExceeded, ResourceLimits};
pub use orientation::Orientation;
pub use pipeline::{
    DEFAULT_GROUP_DIM, Pipeline, PipelineBuilder, PipelineOptions, RayonRunner, RowRunner,
    SequentialRunner,
};
pub use row::{InputRows, OutputRows, RowPosition};
pub use sink::{
    FrameBufferSink, MAX_PIXELS_PER_CALL, PixelCallback, PixelCallbackSink, PixelRun,
    PlanarBufferSink, RawBufferSink,
};
pub use stage::Stage;
pub use transform::{PremultiplyStage, SmoothStage};

// Re-exports for callers building input planes.
pub use imgref::{Img, ImgRef, ImgVec};
