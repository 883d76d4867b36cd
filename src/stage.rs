//! The closed set of stages a pipeline can run.
//!
//! [`Stage`] is one enum covering every transform and sink; the driver talks
//! to stages only through its methods. Adding a stage means adding a variant
//! here plus its arm in each method.

use crate::channel::ChannelMode;
use crate::error::PipelineResult;
use crate::row::{InputRows, OutputRows, RowPosition};
use crate::sink::{FrameBufferSink, PixelCallbackSink, PlanarBufferSink, RawBufferSink};
use crate::transform::{PremultiplyStage, SmoothStage};

/// One step of a pipeline.
#[derive(Debug)]
#[non_exhaustive]
pub enum Stage<'a> {
    /// Multiply color by alpha.
    Premultiply(PremultiplyStage),
    /// Horizontal three-tap filter over color.
    Smooth(SmoothStage),
    /// Interleaved 8-bit buffer sink.
    RawBuffer(RawBufferSink<'a>),
    /// Streaming callback sink.
    PixelCallback(PixelCallbackSink<'a>),
    /// [`ImageBundle`](crate::ImageBundle) sink.
    FrameBuffer(FrameBufferSink<'a>),
    /// [`Image3F`](crate::Image3F) sink.
    PlanarBuffer(PlanarBufferSink<'a>),
}

impl Stage<'_> {
    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Premultiply(_) => "Premultiply",
            Self::Smooth(_) => "Smooth",
            Self::RawBuffer(_) => "WriteToU8",
            Self::PixelCallback(_) => "WritePixelCB",
            Self::FrameBuffer(_) => "WriteIB",
            Self::PlanarBuffer(_) => "WriteI3F",
        }
    }

    /// Whether this stage terminates the pipeline.
    pub fn is_sink(&self) -> bool {
        !matches!(self, Self::Premultiply(_) | Self::Smooth(_))
    }

    /// How this stage uses channel `c`. Pure for a given configuration.
    pub fn channel_mode(&self, c: usize) -> ChannelMode {
        match self {
            Self::Premultiply(s) => s.channel_mode(c),
            Self::Smooth(s) => s.channel_mode(c),
            Self::RawBuffer(s) => s.channel_mode(c),
            Self::PixelCallback(s) => s.channel_mode(c),
            Self::FrameBuffer(s) => s.channel_mode(c),
            Self::PlanarBuffer(s) => s.channel_mode(c),
        }
    }

    /// Neighboring samples read on each side of a pixel.
    pub fn border(&self) -> usize {
        match self {
            Self::Smooth(s) => s.border(),
            _ => 0,
        }
    }

    /// Fewest channels the frame must have for this stage to run.
    pub fn min_channels(&self) -> usize {
        match self {
            Self::Premultiply(s) => s.min_channels(),
            Self::RawBuffer(s) => s.min_channels(),
            Self::PixelCallback(s) => s.min_channels(),
            Self::Smooth(_) | Self::FrameBuffer(_) | Self::PlanarBuffer(_) => 3,
        }
    }

    /// Allocate per-worker state. Runs once, before any row.
    pub fn prepare_for_threads(&mut self, num_threads: usize) -> PipelineResult<()> {
        match self {
            Self::PixelCallback(s) => s.prepare_for_threads(num_threads),
            _ => Ok(()),
        }
    }

    /// Receive the final per-channel `(width, height)`. Runs once, before
    /// any row.
    pub fn set_input_sizes(&mut self, sizes: &[(usize, usize)]) -> PipelineResult<()> {
        match self {
            Self::RawBuffer(s) => s.set_input_sizes(sizes),
            Self::FrameBuffer(s) => s.set_input_sizes(sizes),
            Self::PlanarBuffer(s) => s.set_input_sizes(sizes),
            _ => Ok(()),
        }
    }

    /// Process one row window.
    ///
    /// Sinks ignore `output`; transforms write every `InOut` channel in it.
    pub fn process_row(
        &self,
        input: &InputRows<'_>,
        output: &mut OutputRows<'_>,
        pos: RowPosition,
    ) -> PipelineResult<()> {
        match self {
            Self::Premultiply(s) => s.process_row(input, output, pos),
            Self::Smooth(s) => s.process_row(input, output, pos),
            Self::RawBuffer(s) => s.process_row(input, pos),
            Self::PixelCallback(s) => s.process_row(input, pos),
            Self::FrameBuffer(s) => s.process_row(input, pos),
            Self::PlanarBuffer(s) => s.process_row(input, pos),
        }
    }
}

impl From<PremultiplyStage> for Stage<'_> {
    fn from(stage: PremultiplyStage) -> Self {
        Self::Premultiply(stage)
    }
}

impl From<SmoothStage> for Stage<'_> {
    fn from(stage: SmoothStage) -> Self {
        Self::Smooth(stage)
    }
}

impl<'a> From<RawBufferSink<'a>> for Stage<'a> {
    fn from(sink: RawBufferSink<'a>) -> Self {
        Self::RawBuffer(sink)
    }
}

impl<'a> From<PixelCallbackSink<'a>> for Stage<'a> {
    fn from(sink: PixelCallbackSink<'a>) -> Self {
        Self::PixelCallback(sink)
    }
}

impl<'a> From<FrameBufferSink<'a>> for Stage<'a> {
    fn from(sink: FrameBufferSink<'a>) -> Self {
        Self::FrameBuffer(sink)
    }
}

impl<'a> From<PlanarBufferSink<'a>> for Stage<'a> {
    fn from(sink: PlanarBufferSink<'a>) -> Self {
        Self::PlanarBuffer(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::ColorEncoding;
    use crate::image::ImageBundle;

    fn assert_sync<T: Sync>() {}

    #[test]
    fn stages_are_shareable_across_workers() {
        assert_sync::<Stage<'static>>();
    }

    #[test]
    fn names_and_roles() {
        let smooth: Stage<'_> = SmoothStage::default().into();
        assert_eq!(smooth.name(), "Smooth");
        assert!(!smooth.is_sink());
        assert_eq!(smooth.border(), 1);

        let premul: Stage<'_> = PremultiplyStage::new(4).unwrap().into();
        assert_eq!(premul.name(), "Premultiply");
        assert_eq!(premul.min_channels(), 5);
        assert_eq!(premul.border(), 0);

        let mut bundle = ImageBundle::new();
        let sink: Stage<'_> = FrameBufferSink::new(&mut bundle, ColorEncoding::srgb()).into();
        assert_eq!(sink.name(), "WriteIB");
        assert!(sink.is_sink());
        assert_eq!(sink.channel_mode(9), ChannelMode::Input);
    }

    #[test]
    fn transform_dispatch_writes_output() {
        let stage: Stage<'_> = PremultiplyStage::new(3).unwrap().into();
        let color = [0.5f32];
        let alpha = [0.5f32];
        let input = InputRows::new(
            vec![Some(&color[..]), Some(&color[..]), Some(&color[..]), Some(&alpha[..])],
            0,
        );
        let mut out = [[0.0f32; 1]; 3];
        {
            let [a, b, c] = &mut out;
            let mut output = OutputRows::new(vec![Some(&mut a[..]), Some(&mut b[..]), Some(&mut c[..])], 0);
            stage
                .process_row(&input, &mut output, RowPosition::new(0, 0, 1))
                .unwrap();
        }
        assert_eq!(out, [[0.25]; 3]);
    }

    #[test]
    fn hooks_default_to_noops() {
        let mut stage: Stage<'_> = SmoothStage::default().into();
        assert!(stage.prepare_for_threads(4).is_ok());
        assert!(stage.set_input_sizes(&[(1, 1); 3]).is_ok());
    }
}
