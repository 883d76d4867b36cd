//! The row window a stage sees on each invocation.
//!
//! For one image row, [`InputRows`] holds one slice per channel the stage
//! uses and [`OutputRows`] one slice per channel it rewrites. Channels the
//! stage ignores have no slice at all.
//!
//! Slices cover more than the `xsize` pixels being produced: output rows
//! span `xsize + 2 * xextra` samples, and input rows additionally carry the
//! stage's own border on both sides. Index 0 of a row is therefore pixel
//! `-pad()`, where `pad()` is `xextra` for outputs and `xextra + border` for
//! inputs. For a border-free stage both windows line up sample for sample.

/// Where a row invocation sits in the frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RowPosition {
    /// Extra samples to produce on each side of `[0, xsize)`.
    pub xextra: usize,
    /// Number of pixels in this invocation.
    pub xsize: usize,
    /// Frame x coordinate of pixel 0.
    pub xpos: usize,
    /// Frame row.
    pub ypos: usize,
    /// Worker index in `[0, num_threads)`; selects thread-local scratch.
    pub thread_id: usize,
}

impl RowPosition {
    /// Position with no border and thread 0.
    pub fn new(xpos: usize, ypos: usize, xsize: usize) -> Self {
        Self {
            xextra: 0,
            xsize,
            xpos,
            ypos,
            thread_id: 0,
        }
    }

    /// Same position on another worker.
    pub fn on_thread(mut self, thread_id: usize) -> Self {
        self.thread_id = thread_id;
        self
    }

    /// Same position with a border.
    pub fn with_xextra(mut self, xextra: usize) -> Self {
        self.xextra = xextra;
        self
    }

    /// Samples per output row: `xsize + 2 * xextra`.
    #[inline]
    pub fn span(&self) -> usize {
        self.xsize + 2 * self.xextra
    }
}

/// Read-only rows for one invocation, indexed by channel.
#[derive(Clone, Debug)]
pub struct InputRows<'a> {
    rows: Vec<Option<&'a [f32]>>,
    pad: usize,
}

impl<'a> InputRows<'a> {
    /// Wrap per-channel rows; `pad` is the offset of pixel 0 in each row.
    pub fn new(rows: Vec<Option<&'a [f32]>>, pad: usize) -> Self {
        Self { rows, pad }
    }

    /// Row for channel `c`.
    ///
    /// # Panics
    ///
    /// Panics if the channel was not delivered (its mode was `Ignored`).
    #[inline]
    pub fn row(&self, c: usize) -> &'a [f32] {
        match self.get(c) {
            Some(row) => row,
            None => panic!("channel {c} was not delivered to this stage"),
        }
    }

    /// Row for channel `c`, if delivered.
    #[inline]
    pub fn get(&self, c: usize) -> Option<&'a [f32]> {
        self.rows.get(c).copied().flatten()
    }

    /// Offset of pixel 0 within each row.
    #[inline]
    pub fn pad(&self) -> usize {
        self.pad
    }

    /// Number of channel slots, delivered or not.
    #[inline]
    pub fn num_channels(&self) -> usize {
        self.rows.len()
    }
}

/// Writable rows for one invocation, indexed by channel.
#[derive(Debug)]
pub struct OutputRows<'a> {
    rows: Vec<Option<&'a mut [f32]>>,
    pad: usize,
}

impl<'a> OutputRows<'a> {
    /// Wrap per-channel rows; `pad` is the offset of pixel 0 in each row.
    pub fn new(rows: Vec<Option<&'a mut [f32]>>, pad: usize) -> Self {
        Self { rows, pad }
    }

    /// No writable rows, for stages that only read.
    pub fn none() -> Self {
        Self {
            rows: Vec::new(),
            pad: 0,
        }
    }

    /// Writable row for channel `c`.
    ///
    /// # Panics
    ///
    /// Panics if the channel is not `InOut` for this stage.
    #[inline]
    pub fn row_mut(&mut self, c: usize) -> &mut [f32] {
        match self.rows.get_mut(c).and_then(|r| r.as_deref_mut()) {
            Some(row) => row,
            None => panic!("channel {c} is not writable by this stage"),
        }
    }

    /// Offset of pixel 0 within each row.
    #[inline]
    pub fn pad(&self) -> usize {
        self.pad
    }
}
