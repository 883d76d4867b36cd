//! Per-stage channel modes and the plan the driver derives from them.
//!
//! Every stage declares, for each channel index, whether it reads the
//! channel ([`ChannelMode::Input`]), rewrites it ([`ChannelMode::InOut`]) or
//! never touches it ([`ChannelMode::Ignored`]). Before any row is processed
//! the driver folds those declarations into one [`ChannelPlan`] per channel,
//! which decides what gets loaded, how much border it needs, and when it is
//! last read.

/// How a stage uses one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelMode {
    /// Read and forwarded unchanged. The stage must not modify it.
    Input,
    /// Read and rewritten; later stages see the stage's output.
    InOut,
    /// Not touched. The stage receives no row for it.
    Ignored,
}

impl ChannelMode {
    /// Whether the stage receives a row for this channel.
    #[inline]
    pub const fn is_used(self) -> bool {
        !matches!(self, Self::Ignored)
    }

    /// Whether the stage writes this channel.
    #[inline]
    pub const fn writes(self) -> bool {
        matches!(self, Self::InOut)
    }
}

/// What the driver needs to know about one channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelPlan {
    /// First stage that uses the channel, if any.
    pub first_use: Option<usize>,
    /// Last stage that uses the channel, if any.
    pub last_use: Option<usize>,
    /// Whether any stage rewrites the channel.
    pub modified: bool,
    /// Border samples to load on each side of a row.
    pub border: usize,
}

impl ChannelPlan {
    /// Whether any stage reads the channel. Unneeded channels are never
    /// loaded.
    #[inline]
    pub const fn is_needed(&self) -> bool {
        self.first_use.is_some()
    }

    /// Whether `stage` lies between the channel's first and last use. The
    /// driver loads a channel right before its first use and hands it to
    /// no stage outside this range.
    #[inline]
    pub fn is_live(&self, stage: usize) -> bool {
        matches!(
            (self.first_use, self.last_use),
            (Some(first), Some(last)) if (first..=last).contains(&stage)
        )
    }
}

/// Horizontal padding available to each stage.
///
/// Entry `i` is the border width stage `i` may read beyond `[0, xsize)`; the
/// extra entry at `borders.len()` is zero. Stage `i` is invoked with
/// `xextra = padding[i + 1]`, producing output wide enough for every later
/// stage, and reads `padding[i] = padding[i + 1] + borders[i]` input samples
/// on each side.
pub fn stage_padding(borders: &[usize]) -> Vec<usize> {
    let mut padding = vec![0; borders.len() + 1];
    for i in (0..borders.len()).rev() {
        padding[i] = padding[i + 1] + borders[i];
    }
    padding
}

/// Fold per-stage channel modes into per-channel plans.
///
/// `modes[i][c]` is stage `i`'s mode for channel `c`; `padding` comes from
/// [`stage_padding`].
pub fn negotiate(modes: &[Vec<ChannelMode>], padding: &[usize], num_channels: usize) -> Vec<ChannelPlan> {
    debug_assert_eq!(padding.len(), modes.len() + 1);
    let mut plans = vec![ChannelPlan::default(); num_channels];
    for (stage, stage_modes) in modes.iter().enumerate() {
        debug_assert_eq!(stage_modes.len(), num_channels);
        for (plan, mode) in plans.iter_mut().zip(stage_modes) {
            if !mode.is_used() {
                continue;
            }
            if plan.first_use.is_none() {
                plan.first_use = Some(stage);
                plan.border = padding[stage];
            }
            plan.last_use = Some(stage);
            plan.modified |= mode.writes();
        }
    }
    plans
}
