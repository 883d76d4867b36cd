//! Non-sink stages that rewrite channels in place.
//!
//! These sit between the decoder's planes and the sink: [`PremultiplyStage`]
//! folds alpha into color, [`SmoothStage`] runs a small horizontal filter and
//! is the stage that makes the driver load border samples.

use crate::channel::ChannelMode;
use crate::error::{PipelineError, PipelineResult};
use crate::row::{InputRows, OutputRows, RowPosition};

/// Multiplies the three color channels by an alpha channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PremultiplyStage {
    alpha_channel: usize,
}

impl PremultiplyStage {
    /// Premultiply by `alpha_channel`, which must be an extra channel (>= 3).
    pub fn new(alpha_channel: usize) -> PipelineResult<Self> {
        if alpha_channel < 3 {
            return Err(PipelineError::invalid(format!(
                "alpha channel {alpha_channel} overlaps the color channels"
            )));
        }
        Ok(Self { alpha_channel })
    }

    /// Index of the alpha channel.
    pub fn alpha_channel(&self) -> usize {
        self.alpha_channel
    }

    pub(crate) fn channel_mode(&self, c: usize) -> ChannelMode {
        if c < 3 {
            ChannelMode::InOut
        } else if c == self.alpha_channel {
            ChannelMode::Input
        } else {
            ChannelMode::Ignored
        }
    }

    pub(crate) fn min_channels(&self) -> usize {
        self.alpha_channel + 1
    }

    pub(crate) fn process_row(
        &self,
        input: &InputRows<'_>,
        output: &mut OutputRows<'_>,
        pos: RowPosition,
    ) -> PipelineResult<()> {
        let span = pos.span();
        let in_start = input.pad() - pos.xextra;
        let out_start = output.pad() - pos.xextra;
        let alpha = &input.row(self.alpha_channel)[in_start..in_start + span];
        for c in 0..3 {
            let src = &input.row(c)[in_start..in_start + span];
            let dst = &mut output.row_mut(c)[out_start..out_start + span];
            for ((d, &s), &a) in dst.iter_mut().zip(src).zip(alpha) {
                *d = s * a;
            }
        }
        Ok(())
    }
}

/// Horizontal three-tap smoothing of the color channels.
///
/// `out[x] = center * in[x] + side * (in[x - 1] + in[x + 1])`, with the
/// weights scaled to sum to one.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SmoothStage {
    center: f32,
    side: f32,
}

impl Default for SmoothStage {
    fn default() -> Self {
        Self {
            center: 0.5,
            side: 0.25,
        }
    }
}

impl SmoothStage {
    /// Filter with the given unnormalized weights.
    ///
    /// # Errors
    ///
    /// Fails if `center + 2 * side` is not a positive finite number.
    pub fn new(center: f32, side: f32) -> PipelineResult<Self> {
        let sum = center + 2.0 * side;
        if !sum.is_finite() || sum <= 0.0 {
            return Err(PipelineError::invalid(format!(
                "smoothing weights ({center}, {side}) do not have a positive sum"
            )));
        }
        Ok(Self {
            center: center / sum,
            side: side / sum,
        })
    }

    /// Normalized `(center, side)` weights.
    pub fn weights(&self) -> (f32, f32) {
        (self.center, self.side)
    }

    pub(crate) fn channel_mode(&self, c: usize) -> ChannelMode {
        if c < 3 {
            ChannelMode::InOut
        } else {
            ChannelMode::Ignored
        }
    }

    pub(crate) const fn border(&self) -> usize {
        1
    }

    pub(crate) fn process_row(
        &self,
        input: &InputRows<'_>,
        output: &mut OutputRows<'_>,
        pos: RowPosition,
    ) -> PipelineResult<()> {
        let span = pos.span();
        // Input row index 0 is pixel -(xextra + 1).
        let in_start = input.pad() - pos.xextra - self.border();
        let out_start = output.pad() - pos.xextra;
        for c in 0..3 {
            let src = &input.row(c)[in_start..in_start + span + 2];
            let dst = &mut output.row_mut(c)[out_start..out_start + span];
            for (d, w) in dst.iter_mut().zip(src.windows(3)) {
                *d = self.center * w[1] + self.side * (w[0] + w[2]);
            }
        }
        Ok(())
    }
}
