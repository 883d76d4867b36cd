//! The driver that runs a stage sequence over a frame.
//!
//! A frame is cut into square groups of `group_dim` pixels. Each group is
//! one unit of work: a single worker walks its rows top to bottom, loads the
//! channels the stages need (with mirrored borders at frame edges), and runs
//! every stage on each row. Workers keep their own row buffers, indexed by
//! the worker id the [`RowRunner`] hands out, so no two workers share
//! scratch memory.
//!
//! ```
//! use imgref::ImgVec;
//! use zenstage::{PipelineBuilder, RawBufferSink, SequentialRunner};
//!
//! let planes: Vec<ImgVec<f32>> = (0..3).map(|_| ImgVec::new(vec![1.0; 4], 2, 2)).collect();
//! let refs: Vec<_> = planes.iter().map(|p| p.as_ref()).collect();
//!
//! let mut out = vec![0u8; 2 * 2 * 3];
//! let sink = RawBufferSink::new(&mut out, 6, 2).unwrap();
//! PipelineBuilder::new(&[(2, 2); 3])
//!     .add_stage(sink)
//!     .build()
//!     .unwrap()
//!     .run(&refs, &SequentialRunner)
//!     .unwrap();
//! assert!(out.iter().all(|&b| b == 255));
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use imgref::ImgRef;

use crate::buffer::BufferError;
use crate::channel::{ChannelMode, ChannelPlan, negotiate, stage_padding};
use crate::error::{PipelineError, PipelineResult};
use crate::image::{plane_row, try_filled_vec};
use crate::limits::ResourceLimits;
use crate::row::{InputRows, OutputRows, RowPosition};
use crate::stage::Stage;

/// Default group edge length in pixels.
pub const DEFAULT_GROUP_DIM: usize = 256;

/// Knobs for building a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Edge length of the square groups that form one unit of work.
    pub group_dim: usize,
    /// Caps on frame size and row-buffer memory.
    pub limits: ResourceLimits,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            group_dim: DEFAULT_GROUP_DIM,
            limits: ResourceLimits::none(),
        }
    }
}

impl PipelineOptions {
    /// Set the group edge length.
    pub fn with_group_dim(mut self, group_dim: usize) -> Self {
        self.group_dim = group_dim;
        self
    }

    /// Set resource limits.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// A worker pool, seen from the driver.
///
/// `run` calls `task(task_index, thread_id)` once for every index in
/// `0..num_tasks`. `thread_id` must be below [`num_threads`](Self::num_threads)
/// and no two concurrent calls may share one. The first error stops the run
/// and is returned.
pub trait RowRunner {
    /// Number of distinct worker ids `run` may pass.
    fn num_threads(&self) -> usize;

    /// Run every task.
    fn run(
        &self,
        num_tasks: usize,
        task: &(dyn Fn(usize, usize) -> PipelineResult<()> + Sync),
    ) -> PipelineResult<()>;
}

/// Runs tasks in order on the calling thread, as worker 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct SequentialRunner;

impl RowRunner for SequentialRunner {
    fn num_threads(&self) -> usize {
        1
    }

    fn run(
        &self,
        num_tasks: usize,
        task: &(dyn Fn(usize, usize) -> PipelineResult<()> + Sync),
    ) -> PipelineResult<()> {
        (0..num_tasks).try_for_each(|i| task(i, 0))
    }
}

/// Runs tasks on a dedicated rayon pool.
///
/// Every pool thread runs one broadcast job whose index is its worker id;
/// jobs pull task indices from a shared counter until none are left. A
/// task that itself calls into rayon (`join`, `par_iter`) may let its
/// thread steal other work while it waits, but never another task, so a
/// worker id is never in use twice at once.
#[derive(Debug)]
pub struct RayonRunner {
    pool: rayon::ThreadPool,
}

impl RayonRunner {
    /// Build a pool with `num_threads` workers.
    ///
    /// # Errors
    ///
    /// Fails for zero threads or if rayon cannot spawn the pool.
    pub fn new(num_threads: usize) -> PipelineResult<Self> {
        if num_threads == 0 {
            return Err(PipelineError::pool("thread count must be >= 1"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| PipelineError::pool(format!("failed to build rayon thread pool: {e}")))?;
        Ok(Self { pool })
    }
}

impl RowRunner for RayonRunner {
    fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn run(
        &self,
        num_tasks: usize,
        task: &(dyn Fn(usize, usize) -> PipelineResult<()> + Sync),
    ) -> PipelineResult<()> {
        let next = AtomicUsize::new(0);
        let results = self.pool.broadcast(|ctx| -> PipelineResult<()> {
            let thread_id = ctx.index();
            loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                if i >= num_tasks {
                    return Ok(());
                }
                if let Err(err) = task(i, thread_id) {
                    // Drain the counter so the other workers stop.
                    next.store(num_tasks, Ordering::Relaxed);
                    return Err(err);
                }
            }
        });
        results.into_iter().collect()
    }
}

/// Collects the frame geometry and stages of a pipeline.
#[derive(Debug)]
pub struct PipelineBuilder<'a> {
    channel_sizes: Vec<(usize, usize)>,
    stages: Vec<Stage<'a>>,
    options: PipelineOptions,
}

impl<'a> PipelineBuilder<'a> {
    /// Start a pipeline over channels of the given `(width, height)`, color
    /// channels first.
    pub fn new(channel_sizes: &[(usize, usize)]) -> Self {
        Self {
            channel_sizes: channel_sizes.to_vec(),
            stages: Vec::new(),
            options: PipelineOptions::default(),
        }
    }

    /// Replace the options.
    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Append a stage. The last stage added must be the sink.
    pub fn add_stage(mut self, stage: impl Into<Stage<'a>>) -> Self {
        self.stages.push(stage.into());
        self
    }

    /// Validate the configuration, plan channel usage and size the sink.
    ///
    /// # Errors
    ///
    /// Fails if the stage sequence is malformed, channel sizes disagree, a
    /// stage needs a channel the frame lacks, a limit is exceeded, or the
    /// sink rejects the frame size.
    pub fn build(self) -> PipelineResult<Pipeline<'a>> {
        let Self {
            channel_sizes,
            mut stages,
            options,
        } = self;

        let Some((last, rest)) = stages.split_last() else {
            return Err(PipelineError::invalid("pipeline has no stages"));
        };
        if !last.is_sink() {
            return Err(PipelineError::invalid(format!(
                "last stage {} is not a sink",
                last.name()
            )));
        }
        if let Some(early) = rest.iter().find(|s| s.is_sink()) {
            return Err(PipelineError::invalid(format!(
                "sink {} must be the last stage",
                early.name()
            )));
        }
        if options.group_dim == 0 {
            return Err(PipelineError::invalid("group_dim must be >= 1"));
        }

        let Some(&(width, height)) = channel_sizes.first() else {
            return Err(PipelineError::invalid("frame has no channels"));
        };
        if width == 0 || height == 0 {
            return Err(BufferError::InvalidDimensions.into());
        }
        for (channel, &actual) in channel_sizes.iter().enumerate().skip(1) {
            if actual != (width, height) {
                return Err(PipelineError::ChannelSizeMismatch {
                    channel,
                    actual,
                    expected: (width, height),
                });
            }
        }
        options.limits.check_dimensions(
            u32::try_from(width).unwrap_or(u32::MAX),
            u32::try_from(height).unwrap_or(u32::MAX),
        )?;

        let num_channels = channel_sizes.len();
        for stage in &stages {
            let needed = stage.min_channels();
            if needed > num_channels {
                return Err(PipelineError::MissingChannel {
                    stage: stage.name(),
                    channel: needed - 1,
                    available: num_channels,
                });
            }
        }

        let modes: Vec<Vec<ChannelMode>> = stages
            .iter()
            .map(|s| (0..num_channels).map(|c| s.channel_mode(c)).collect())
            .collect();
        let borders: Vec<usize> = stages.iter().map(Stage::border).collect();
        let padding = stage_padding(&borders);
        let plans = negotiate(&modes, &padding, num_channels);

        for stage in &mut stages {
            stage.set_input_sizes(&channel_sizes)?;
        }

        tracing::debug!(
            stages = ?stages.iter().map(Stage::name).collect::<Vec<_>>(),
            width,
            height,
            num_channels,
            padding = padding[0],
            group_dim = options.group_dim,
            "pipeline built"
        );
        for (c, plan) in plans.iter().enumerate() {
            tracing::trace!(channel = c, ?plan, "channel plan");
        }

        Ok(Pipeline {
            stages,
            modes,
            plans,
            padding,
            width,
            height,
            options,
        })
    }
}

struct ChannelRows {
    cur: Vec<f32>,
    next: Vec<f32>,
}

/// One worker's row buffers, one slot per channel.
struct WorkerRows {
    channels: Vec<Option<ChannelRows>>,
}

impl WorkerRows {
    fn new(plans: &[ChannelPlan], row_len: usize) -> PipelineResult<Self> {
        let channels = plans
            .iter()
            .map(|plan| -> PipelineResult<Option<ChannelRows>> {
                if !plan.is_needed() {
                    return Ok(None);
                }
                let next_len = if plan.modified { row_len } else { 0 };
                Ok(Some(ChannelRows {
                    cur: try_filled_vec(row_len, 0.0, "pipeline row")?,
                    next: try_filled_vec(next_len, 0.0, "pipeline row")?,
                }))
            })
            .collect::<PipelineResult<_>>()?;
        Ok(Self { channels })
    }
}

/// A validated stage sequence, ready to run once.
#[derive(Debug)]
pub struct Pipeline<'a> {
    stages: Vec<Stage<'a>>,
    modes: Vec<Vec<ChannelMode>>,
    plans: Vec<ChannelPlan>,
    padding: Vec<usize>,
    width: usize,
    height: usize,
    options: PipelineOptions,
}

impl Pipeline<'_> {
    /// Frame `(width, height)`.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Number of channels the frame carries.
    pub fn num_channels(&self) -> usize {
        self.plans.len()
    }

    /// Stage names in order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }

    /// How channel `c` flows through the stages.
    pub fn channel_plan(&self, c: usize) -> Option<&ChannelPlan> {
        self.plans.get(c)
    }

    /// Estimated row-buffer memory for `num_threads` workers.
    pub fn scratch_bytes(&self, num_threads: usize) -> usize {
        let per_worker: usize = self
            .plans
            .iter()
            .filter(|p| p.is_needed())
            .map(|p| if p.modified { 2 } else { 1 })
            .sum::<usize>()
            * self.row_len()
            * size_of::<f32>();
        per_worker.saturating_mul(num_threads)
    }

    fn row_len(&self) -> usize {
        self.options.group_dim.min(self.width) + 2 * self.padding[0]
    }

    /// Push every row of `input` through the stages.
    ///
    /// `input` holds one plane per channel with the sizes given to the
    /// builder. The pipeline is consumed; its stages, including any callback
    /// handle, are released when this returns, on success or failure.
    ///
    /// # Errors
    ///
    /// Fails if `input` does not match the frame, a setup hook fails, the
    /// memory limit is exceeded, or any stage fails on a row.
    #[tracing::instrument(skip_all, fields(width = self.width, height = self.height))]
    pub fn run(mut self, input: &[ImgRef<'_, f32>], runner: &dyn RowRunner) -> PipelineResult<()> {
        if input.len() != self.num_channels() {
            return Err(PipelineError::invalid(format!(
                "expected {} input planes, got {}",
                self.num_channels(),
                input.len()
            )));
        }
        for (channel, plane) in input.iter().enumerate() {
            let actual = (plane.width(), plane.height());
            if actual != (self.width, self.height) {
                return Err(PipelineError::ChannelSizeMismatch {
                    channel,
                    actual,
                    expected: (self.width, self.height),
                });
            }
        }

        let num_threads = runner.num_threads();
        if num_threads == 0 {
            return Err(PipelineError::pool("runner reports zero threads"));
        }
        let scratch_bytes = self.scratch_bytes(num_threads);
        self.options
            .limits
            .check_memory(u64::try_from(scratch_bytes).unwrap_or(u64::MAX))?;

        for stage in &mut self.stages {
            stage.prepare_for_threads(num_threads)?;
        }
        let row_len = self.row_len();
        let workers = (0..num_threads)
            .map(|_| WorkerRows::new(&self.plans, row_len).map(Mutex::new))
            .collect::<PipelineResult<Vec<_>>>()?;

        let group_dim = self.options.group_dim;
        let groups_x = self.width.div_ceil(group_dim);
        let groups_y = self.height.div_ceil(group_dim);
        tracing::debug!(num_threads, groups_x, groups_y, scratch_bytes, "running pipeline");

        let this = &self;
        runner.run(groups_x * groups_y, &|task: usize, thread_id: usize| {
            let worker = workers.get(thread_id).ok_or_else(|| {
                PipelineError::pool(format!(
                    "worker id {thread_id} out of range for {num_threads} threads"
                ))
            })?;
            let mut rows = worker.lock().unwrap_or_else(PoisonError::into_inner);
            this.process_group(input, task % groups_x, task / groups_x, thread_id, &mut rows)
        })
    }

    fn process_group(
        &self,
        input: &[ImgRef<'_, f32>],
        gx: usize,
        gy: usize,
        thread_id: usize,
        rows: &mut WorkerRows,
    ) -> PipelineResult<()> {
        let group_dim = self.options.group_dim;
        let x0 = gx * group_dim;
        let xsize = group_dim.min(self.width - x0);
        let y0 = gy * group_dim;
        let y1 = (y0 + group_dim).min(self.height);
        tracing::trace!(gx, gy, thread_id, "group");

        let p0 = self.padding[0];
        for y in y0..y1 {
            for (i, stage) in self.stages.iter().enumerate() {
                self.load_first_used(input, rows, i, x0, xsize, y);
                let in_pad = self.padding[i];
                let xextra = self.padding[i + 1];
                let mut in_rows = Vec::with_capacity(rows.channels.len());
                let mut out_rows = Vec::with_capacity(rows.channels.len());
                let slots = rows.channels.iter_mut().zip(&self.plans);
                for ((slot, plan), &mode) in slots.zip(&self.modes[i]) {
                    match slot {
                        Some(ChannelRows { cur, next }) if plan.is_live(i) && mode.is_used() => {
                            in_rows.push(Some(&cur[p0 - in_pad..p0 + xsize + in_pad]));
                            out_rows.push(if mode.writes() {
                                Some(&mut next[p0 - xextra..p0 + xsize + xextra])
                            } else {
                                None
                            });
                        }
                        _ => {
                            in_rows.push(None);
                            out_rows.push(None);
                        }
                    }
                }
                let pos = RowPosition {
                    xextra,
                    xsize,
                    xpos: x0,
                    ypos: y,
                    thread_id,
                };
                stage.process_row(
                    &InputRows::new(in_rows, in_pad),
                    &mut OutputRows::new(out_rows, xextra),
                    pos,
                )?;
                for (slot, mode) in rows.channels.iter_mut().zip(&self.modes[i]) {
                    if let Some(ch) = slot
                        && mode.writes()
                    {
                        std::mem::swap(&mut ch.cur, &mut ch.next);
                    }
                }
            }
        }
        Ok(())
    }

    /// Fill `[x0 - border, x0 + xsize + border)` of row `y` for every channel
    /// whose first use is `stage`.
    fn load_first_used(
        &self,
        input: &[ImgRef<'_, f32>],
        rows: &mut WorkerRows,
        stage: usize,
        x0: usize,
        xsize: usize,
        y: usize,
    ) {
        let p0 = self.padding[0];
        for ((plan, slot), plane) in self.plans.iter().zip(&mut rows.channels).zip(input) {
            let Some(ch) = slot else {
                continue;
            };
            if plan.first_use != Some(stage) {
                continue;
            }
            let border = plan.border;
            let dst = &mut ch.cur[p0 - border..p0 + xsize + border];
            load_mirrored(plane_row(plane, y), x0 as isize - border as isize, dst);
        }
    }
}

/// Copy `src[start..start + dst.len()]`, reflecting indices outside `src`.
fn load_mirrored(src: &[f32], start: isize, dst: &mut [f32]) {
    let width = src.len() as isize;
    if start >= 0 && start + dst.len() as isize <= width {
        let start = start as usize;
        dst.copy_from_slice(&src[start..start + dst.len()]);
        return;
    }
    for (i, d) in dst.iter_mut().enumerate() {
        *d = src[mirror(start + i as isize, width)];
    }
}

/// Reflect `x` into `[0, width)`: -1 maps to 0, `width` to `width - 1`.
fn mirror(mut x: isize, width: isize) -> usize {
    loop {
        if x < 0 {
            x = -x - 1;
        } else if x >= width {
            x = 2 * width - 1 - x;
        } else {
            return x as usize;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PixelFormat;
    use crate::color::ColorEncoding;
    use crate::error::CallbackError;
    use crate::image::{Image3F, ImageBundle, Plane};
    use crate::sink::{
        FrameBufferSink, PixelCallback, PixelCallbackSink, PixelRun, PlanarBufferSink,
        RawBufferSink,
    };
    use crate::transform::{PremultiplyStage, SmoothStage};
    use imgref::ImgVec;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn planes(num: usize, width: usize, height: usize, f: impl Fn(usize, usize, usize) -> f32) -> Vec<Plane> {
        (0..num)
            .map(|c| {
                let buf = (0..height)
                    .flat_map(|y| (0..width).map(move |x| (c, x, y)))
                    .map(|(c, x, y)| f(c, x, y))
                    .collect();
                ImgVec::new(buf, width, height)
            })
            .collect()
    }

    fn refs(planes: &[Plane]) -> Vec<ImgRef<'_, f32>> {
        planes.iter().map(|p| p.as_ref()).collect()
    }

    /// Default smoothing of `row`; the result is one sample shorter per side.
    fn smooth_ref(row: &[f32]) -> Vec<f32> {
        let (c, s) = SmoothStage::default().weights();
        let n = row.len() - 2;
        (0..n).map(|k| c * row[k + 1] + s * (row[k] + row[k + 2])).collect()
    }

    fn mirrored(row: &[f32], border: usize) -> Vec<f32> {
        let w = row.len() as isize;
        (-(border as isize)..w + border as isize)
            .map(|x| row[mirror(x, w)])
            .collect()
    }

    #[test]
    fn mirror_reflects_edges() {
        assert_eq!(mirror(-1, 4), 0);
        assert_eq!(mirror(-2, 4), 1);
        assert_eq!(mirror(4, 4), 3);
        assert_eq!(mirror(5, 4), 2);
        assert_eq!(mirror(-3, 1), 0);
        assert_eq!(mirror(7, 2), 0);
        let mut dst = [0.0; 6];
        load_mirrored(&[1.0, 2.0, 3.0], -2, &mut dst);
        assert_eq!(dst, [2.0, 1.0, 1.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn build_rejects_malformed_pipelines() {
        let sizes = [(4, 4); 3];
        assert!(matches!(
            PipelineBuilder::new(&sizes).build(),
            Err(PipelineError::InvalidPipeline(_))
        ));
        assert!(matches!(
            PipelineBuilder::new(&sizes).add_stage(SmoothStage::default()).build(),
            Err(PipelineError::InvalidPipeline(_))
        ));

        let mut a = None;
        let mut b = None;
        assert!(matches!(
            PipelineBuilder::new(&sizes)
                .add_stage(PlanarBufferSink::new(&mut a))
                .add_stage(PlanarBufferSink::new(&mut b))
                .build(),
            Err(PipelineError::InvalidPipeline(_))
        ));

        let mut image = None;
        assert!(matches!(
            PipelineBuilder::new(&[]).add_stage(PlanarBufferSink::new(&mut image)).build(),
            Err(PipelineError::InvalidPipeline(_))
        ));
        assert!(matches!(
            PipelineBuilder::new(&[(0, 4); 3]).add_stage(PlanarBufferSink::new(&mut image)).build(),
            Err(PipelineError::Buffer(BufferError::InvalidDimensions))
        ));
        assert!(matches!(
            PipelineBuilder::new(&[(4, 4), (4, 4), (4, 3)])
                .add_stage(PlanarBufferSink::new(&mut image))
                .build(),
            Err(PipelineError::ChannelSizeMismatch { channel: 2, .. })
        ));
        assert!(matches!(
            PipelineBuilder::new(&sizes)
                .with_options(PipelineOptions::default().with_group_dim(0))
                .add_stage(PlanarBufferSink::new(&mut image))
                .build(),
            Err(PipelineError::InvalidPipeline(_))
        ));
    }

    #[test]
    fn build_checks_channels_and_limits() {
        let mut out = vec![0u8; 64];
        let sink = RawBufferSink::new(&mut out, 16, 4).unwrap().with_rgba(true).with_alpha_channel(3);
        assert!(matches!(
            PipelineBuilder::new(&[(4, 4); 3]).add_stage(sink).build(),
            Err(PipelineError::MissingChannel {
                stage: "WriteToU8",
                channel: 3,
                available: 3
            })
        ));

        let mut image = None;
        let limits = ResourceLimits::none().with_max_width(3);
        assert!(matches!(
            PipelineBuilder::new(&[(4, 4); 3])
                .with_options(PipelineOptions::default().with_limits(limits))
                .add_stage(PlanarBufferSink::new(&mut image))
                .build(),
            Err(PipelineError::Limit(_))
        ));
    }

    #[test]
    fn raw_sink_across_partial_groups() {
        let (w, h) = (5, 3);
        let input = planes(3, w, h, |c, x, y| ((c * 31 + x * 7 + y * 3) % 11) as f32 / 10.0);
        let mut out = vec![0u8; w * 3 * h];
        let sink = RawBufferSink::new(&mut out, w * 3, h).unwrap();
        let pipeline = PipelineBuilder::new(&[(w, h); 3])
            .with_options(PipelineOptions::default().with_group_dim(2))
            .add_stage(sink)
            .build()
            .unwrap();
        assert_eq!(pipeline.stage_names(), vec!["WriteToU8"]);
        pipeline.run(&refs(&input), &SequentialRunner).unwrap();

        for y in 0..h {
            for x in 0..w {
                for c in 0..3 {
                    let v = input[c].buf()[y * w + x];
                    assert_eq!(out[(y * w + x) * 3 + c], crate::convert::f32_to_u8(v));
                }
            }
        }
    }

    #[test]
    fn smooth_matches_mirrored_reference() {
        let (w, h) = (7, 3);
        let input = planes(3, w, h, |c, x, y| ((c + 1) * (x * x + y)) as f32);
        let mut image = None;
        PipelineBuilder::new(&[(w, h); 3])
            .with_options(PipelineOptions::default().with_group_dim(3))
            .add_stage(SmoothStage::default())
            .add_stage(PlanarBufferSink::new(&mut image))
            .build()
            .unwrap()
            .run(&refs(&input), &SequentialRunner)
            .unwrap();
        let image = image.unwrap();
        for c in 0..3 {
            for y in 0..h {
                let src = &input[c].buf()[y * w..(y + 1) * w];
                let expected = smooth_ref(&mirrored(src, 1));
                assert_eq!(image.row(c, y), &expected[..], "channel {c} row {y}");
            }
        }
    }

    #[test]
    fn chained_borders_use_source_mirroring() {
        let (w, h) = (9, 2);
        let input = planes(3, w, h, |_, x, y| ((x * 13 + y * 5) % 17) as f32);
        let mut image = None;
        let pipeline = PipelineBuilder::new(&[(w, h); 3])
            .with_options(PipelineOptions::default().with_group_dim(4))
            .add_stage(SmoothStage::default())
            .add_stage(SmoothStage::new(1.0, 1.0).unwrap())
            .add_stage(PlanarBufferSink::new(&mut image))
            .build()
            .unwrap();
        assert_eq!(pipeline.channel_plan(0).unwrap().border, 2);
        pipeline.run(&refs(&input), &SequentialRunner).unwrap();

        let (c2, s2) = SmoothStage::new(1.0, 1.0).unwrap().weights();
        let image = image.unwrap();
        for y in 0..h {
            let src = &input[0].buf()[y * w..(y + 1) * w];
            // The first filter runs over mirrored source samples; the second
            // reads the first filter's border output, not a mirror of it.
            let once = smooth_ref(&mirrored(src, 2));
            let twice: Vec<f32> = (0..w)
                .map(|k| c2 * once[k + 1] + s2 * (once[k] + once[k + 2]))
                .collect();
            assert_eq!(image.row(0, y), &twice[..]);
        }
    }

    #[test]
    fn thread_count_does_not_change_output() {
        let (w, h) = (37, 23);
        let input = planes(4, w, h, |c, x, y| ((c * 7 + x * 11 + y * 13) % 29) as f32 / 28.0);
        let render = |runner: &dyn RowRunner| {
            let mut bundle = ImageBundle::new();
            PipelineBuilder::new(&[(w, h); 4])
                .with_options(PipelineOptions::default().with_group_dim(8))
                .add_stage(SmoothStage::default())
                .add_stage(PremultiplyStage::new(3).unwrap())
                .add_stage(FrameBufferSink::new(&mut bundle, ColorEncoding::srgb()))
                .build()
                .unwrap()
                .run(&refs(&input), runner)
                .unwrap();
            bundle
        };
        let sequential = render(&SequentialRunner);
        let one = render(&RayonRunner::new(1).unwrap());
        let three = render(&RayonRunner::new(3).unwrap());
        assert_eq!(sequential, one);
        assert_eq!(sequential, three);
        assert_eq!(sequential.extra_channels()[0].buf(), input[3].buf());
    }

    #[derive(Default)]
    struct Collect {
        pixels: Mutex<Vec<(usize, usize, Vec<u8>)>>,
        released: AtomicUsize,
        fail_on_row: Option<usize>,
        refuse_init: bool,
    }

    struct CollectRun<'a>(&'a Collect);

    impl PixelRun for CollectRun<'_> {
        fn run(
            &self,
            _thread_id: usize,
            x: usize,
            y: usize,
            _num_pixels: usize,
            pixels: &[u8],
        ) -> Result<(), CallbackError> {
            if self.0.fail_on_row == Some(y) {
                return Err(CallbackError::new("stop"));
            }
            self.0.pixels.lock().unwrap().push((x, y, pixels.to_vec()));
            Ok(())
        }
    }

    impl Drop for CollectRun<'_> {
        fn drop(&mut self) {
            self.0.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl PixelCallback for Collect {
        fn init(&self, _: usize, _: usize) -> Result<Box<dyn PixelRun + '_>, CallbackError> {
            if self.refuse_init {
                return Err(CallbackError::new("no output device"));
            }
            Ok(Box::new(CollectRun(self)))
        }
    }

    #[test]
    fn premultiply_then_unpremultiply_restores_color() {
        let (w, h) = (6, 4);
        let input = planes(4, w, h, |c, x, y| {
            if c == 3 {
                (x + y + 1) as f32 / 10.0
            } else {
                ((c * 5 + x * 3 + y) % 9) as f32 / 8.0
            }
        });
        let collect = Collect::default();
        let sink = PixelCallbackSink::new(&collect, w, h, PixelFormat::RGBAF32)
            .with_alpha_channel(3)
            .with_unpremultiply(true);
        PipelineBuilder::new(&[(w, h); 4])
            .add_stage(PremultiplyStage::new(3).unwrap())
            .add_stage(sink)
            .build()
            .unwrap()
            .run(&refs(&input), &RayonRunner::new(2).unwrap())
            .unwrap();
        assert_eq!(collect.released.load(Ordering::SeqCst), 1);

        let calls = collect.pixels.lock().unwrap();
        assert_eq!(calls.len(), h);
        for (x0, y, bytes) in calls.iter() {
            let values: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            for (i, px) in values.chunks_exact(4).enumerate() {
                let x = x0 + i;
                for c in 0..3 {
                    let straight = input[c].buf()[y * w + x];
                    assert!((px[c] - straight).abs() < 1e-6, "({x}, {y}) channel {c}");
                }
                assert_eq!(px[3], input[3].buf()[y * w + x]);
            }
        }
    }

    #[test]
    fn channel_first_read_by_sink_is_loaded_there() {
        // Channel 4 is ignored by the premultiply stage and first read by the sink.
        let (w, h) = (5, 3);
        let input = planes(5, w, h, |c, x, y| (c * 13 + x * 3 + y) as f32 / 32.0);
        let mut bundle = ImageBundle::new();
        let pipeline = PipelineBuilder::new(&[(w, h); 5])
            .with_options(PipelineOptions::default().with_group_dim(2))
            .add_stage(PremultiplyStage::new(3).unwrap())
            .add_stage(FrameBufferSink::new(&mut bundle, ColorEncoding::default()))
            .build()
            .unwrap();
        let plan = pipeline.channel_plan(4).unwrap();
        assert_eq!((plan.first_use, plan.last_use), (Some(1), Some(1)));
        assert!(!plan.is_live(0));
        pipeline.run(&refs(&input), &SequentialRunner).unwrap();

        assert_eq!(bundle.extra_channels().len(), 2);
        assert_eq!(bundle.extra_channels()[1].buf(), input[4].buf());
        assert_eq!(bundle.extra_channels()[0].buf(), input[3].buf());
    }

    #[test]
    fn unused_channels_are_never_read() {
        let (w, h) = (4, 2);
        let mut input = planes(5, w, h, |c, x, _| (c + x) as f32 / 8.0);
        input[4] = ImgVec::new(vec![f32::NAN; w * h], w, h);
        let mut image = Some(Image3F::new(w, h).unwrap());
        let pipeline = PipelineBuilder::new(&[(w, h); 5])
            .add_stage(PlanarBufferSink::new(&mut image))
            .build()
            .unwrap();
        assert!(pipeline.channel_plan(0).unwrap().is_needed());
        assert!(!pipeline.channel_plan(3).unwrap().is_needed());
        assert!(!pipeline.channel_plan(4).unwrap().is_needed());
        pipeline.run(&refs(&input), &SequentialRunner).unwrap();
        let image = image.unwrap();
        assert!(image.planes().iter().all(|p| p.buf().iter().all(|v| v.is_finite())));
    }

    #[test]
    fn callback_failure_aborts_and_releases_handle() {
        let (w, h) = (3, 6);
        let input = planes(3, w, h, |_, _, _| 0.5);
        let collect = Collect {
            fail_on_row: Some(4),
            ..Collect::default()
        };
        let err = PipelineBuilder::new(&[(w, h); 3])
            .add_stage(PixelCallbackSink::new(&collect, w, h, PixelFormat::RGB8))
            .build()
            .unwrap()
            .run(&refs(&input), &SequentialRunner)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Callback { y: 4, .. }));
        assert_eq!(collect.released.load(Ordering::SeqCst), 1);
        let rows: Vec<usize> = collect.pixels.lock().unwrap().iter().map(|p| p.1).collect();
        assert_eq!(rows, vec![0, 1, 2, 3]);
    }

    #[test]
    fn init_failure_stops_run_before_any_row() {
        let (w, h) = (4, 4);
        let input = planes(3, w, h, |_, _, _| 0.5);
        let collect = Collect {
            refuse_init: true,
            ..Collect::default()
        };
        let err = PipelineBuilder::new(&[(w, h); 3])
            .add_stage(PixelCallbackSink::new(&collect, w, h, PixelFormat::RGB8))
            .build()
            .unwrap()
            .run(&refs(&input), &RayonRunner::new(2).unwrap())
            .unwrap_err();
        assert!(matches!(err, PipelineError::CallbackInit(_)));
        assert!(collect.pixels.lock().unwrap().is_empty());
        assert_eq!(collect.released.load(Ordering::SeqCst), 0);
    }

    /// Callback that blocks in `rayon::join` and records overlapping use of
    /// a worker id.
    struct NestedJoin {
        busy: Vec<AtomicBool>,
        calls: AtomicUsize,
    }

    struct NestedJoinRun<'a>(&'a NestedJoin);

    impl PixelRun for NestedJoinRun<'_> {
        fn run(
            &self,
            thread_id: usize,
            _x: usize,
            _y: usize,
            _num_pixels: usize,
            pixels: &[u8],
        ) -> Result<(), CallbackError> {
            if self.0.busy[thread_id].swap(true, Ordering::SeqCst) {
                return Err(CallbackError::new(format!("worker {thread_id} entered twice")));
            }
            let (len, _) = rayon::join(
                || {
                    std::thread::sleep(Duration::from_micros(200));
                    pixels.len()
                },
                || 0,
            );
            self.0.busy[thread_id].store(false, Ordering::SeqCst);
            assert_eq!(len, pixels.len());
            self.0.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl PixelCallback for NestedJoin {
        fn init(&self, _: usize, _: usize) -> Result<Box<dyn PixelRun + '_>, CallbackError> {
            Ok(Box::new(NestedJoinRun(self)))
        }
    }

    #[test]
    fn callback_may_block_inside_rayon() {
        let (w, h) = (256, 32);
        let input = planes(3, w, h, |c, x, y| ((c + x + y) % 7) as f32 / 6.0);
        let callback = NestedJoin {
            busy: (0..2).map(|_| AtomicBool::new(false)).collect(),
            calls: AtomicUsize::new(0),
        };
        PipelineBuilder::new(&[(w, h); 3])
            .with_options(PipelineOptions::default().with_group_dim(8))
            .add_stage(PixelCallbackSink::new(&callback, w, h, PixelFormat::RGBA8))
            .build()
            .unwrap()
            .run(&refs(&input), &RayonRunner::new(2).unwrap())
            .unwrap();
        // One call per row of every 8x8 group.
        assert_eq!(callback.calls.load(Ordering::SeqCst), (w / 8) * h);
    }

    #[test]
    fn rayon_runner_gives_each_task_once() {
        let runner = RayonRunner::new(3).unwrap();
        let seen: Vec<AtomicUsize> = (0..50).map(|_| AtomicUsize::new(0)).collect();
        runner
            .run(seen.len(), &|i: usize, thread_id: usize| {
                assert!(thread_id < 3);
                seen[i].fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert!(seen.iter().all(|n| n.load(Ordering::SeqCst) == 1));

        let err = runner
            .run(50, &|i: usize, _: usize| {
                if i == 7 {
                    Err(PipelineError::invalid("task 7"))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidPipeline(_)));
    }

    #[test]
    fn run_checks_input_and_memory() {
        let (w, h) = (4, 4);
        let input = planes(3, w, h, |_, _, _| 0.0);
        let mut image = None;
        let err = PipelineBuilder::new(&[(w, h); 3])
            .add_stage(PlanarBufferSink::new(&mut image))
            .build()
            .unwrap()
            .run(&refs(&input[..2]), &SequentialRunner)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidPipeline(_)));

        let small = planes(3, 3, 4, |_, _, _| 0.0);
        let err = PipelineBuilder::new(&[(w, h); 3])
            .add_stage(PlanarBufferSink::new(&mut image))
            .build()
            .unwrap()
            .run(&refs(&small), &SequentialRunner)
            .unwrap_err();
        assert!(matches!(err, PipelineError::ChannelSizeMismatch { channel: 0, .. }));

        let limits = ResourceLimits::none().with_max_memory(16);
        let pipeline = PipelineBuilder::new(&[(w, h); 3])
            .with_options(PipelineOptions::default().with_limits(limits))
            .add_stage(PlanarBufferSink::new(&mut image))
            .build()
            .unwrap();
        assert_eq!(pipeline.scratch_bytes(1), 3 * 4 * 4);
        assert!(matches!(
            pipeline.run(&refs(&input), &SequentialRunner),
            Err(PipelineError::Limit(_))
        ));
    }

    #[test]
    fn rayon_runner_rejects_zero_threads() {
        assert!(matches!(RayonRunner::new(0), Err(PipelineError::Pool(_))));
        assert_eq!(RayonRunner::new(2).unwrap().num_threads(), 2);
    }
}
