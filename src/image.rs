//! In-memory planar float images.
//!
//! [`Plane`] is a single `f32` channel backed by [`imgref::ImgVec`].
//! [`Image3F`] groups three color planes; [`ImageBundle`] adds extra
//! channels (alpha, depth, ...) and the color encoding. These are what the
//! frame sinks write into, and what a re-encode path feeds back into a
//! pipeline via [`ImageBundle::channel_refs`].

use imgref::{ImgRef, ImgVec};

use crate::buffer::BufferError;
use crate::color::ColorEncoding;
use crate::error::{PipelineError, PipelineResult};

/// One channel of float samples.
pub type Plane = ImgVec<f32>;

/// Allocate a zeroed plane, reporting allocation failure instead of aborting.
pub fn try_alloc_plane(width: usize, height: usize) -> PipelineResult<Plane> {
    let len = width
        .checked_mul(height)
        .filter(|&n| n > 0)
        .ok_or(BufferError::InvalidDimensions)?;
    let buf = try_filled_vec(len, 0.0f32, "image plane")?;
    Ok(ImgVec::new(buf, width, height))
}

/// `len` copies of `value`, or [`PipelineError::Allocation`].
pub(crate) fn try_filled_vec<T: Clone>(
    len: usize,
    value: T,
    what: &'static str,
) -> PipelineResult<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| PipelineError::Allocation {
            what,
            bytes: len.saturating_mul(size_of::<T>()),
        })?;
    buf.resize(len, value);
    Ok(buf)
}

/// Row `y` of a plane, `width` samples long.
#[inline]
pub fn plane_row<'p>(plane: &'p ImgRef<'_, f32>, y: usize) -> &'p [f32] {
    let start = y * plane.stride();
    &plane.buf()[start..start + plane.width()]
}

/// Three color planes of equal size.
#[derive(Clone, Debug, PartialEq)]
pub struct Image3F {
    planes: [Plane; 3],
}

impl Image3F {
    /// Allocate a zeroed image.
    pub fn new(width: usize, height: usize) -> PipelineResult<Self> {
        Ok(Self {
            planes: [
                try_alloc_plane(width, height)?,
                try_alloc_plane(width, height)?,
                try_alloc_plane(width, height)?,
            ],
        })
    }

    /// Wrap existing planes.
    ///
    /// # Errors
    ///
    /// Fails if the planes do not share dimensions.
    pub fn from_planes(planes: [Plane; 3]) -> PipelineResult<Self> {
        let expected = (planes[0].width(), planes[0].height());
        for (channel, plane) in planes.iter().enumerate().skip(1) {
            let actual = (plane.width(), plane.height());
            if actual != expected {
                return Err(PipelineError::ChannelSizeMismatch {
                    channel,
                    actual,
                    expected,
                });
            }
        }
        Ok(Self { planes })
    }

    /// Width in pixels.
    pub fn width(&self) -> usize {
        self.planes[0].width()
    }

    /// Height in pixels.
    pub fn height(&self) -> usize {
        self.planes[0].height()
    }

    /// Color plane `c` (0..3).
    pub fn plane(&self, c: usize) -> &Plane {
        &self.planes[c]
    }

    /// Mutable color plane `c` (0..3).
    pub fn plane_mut(&mut self, c: usize) -> &mut Plane {
        &mut self.planes[c]
    }

    /// All three planes.
    pub fn planes(&self) -> &[Plane; 3] {
        &self.planes
    }

    /// Row `y` of plane `c`.
    pub fn row(&self, c: usize, y: usize) -> &[f32] {
        let plane = &self.planes[c];
        let start = y * plane.stride();
        &plane.buf()[start..start + plane.width()]
    }

    pub(crate) fn planes_mut(&mut self) -> &mut [Plane; 3] {
        &mut self.planes
    }
}

/// A decoded frame: color planes, extra channels and color metadata.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageBundle {
    color: Option<Image3F>,
    extra_channels: Vec<Plane>,
    color_encoding: ColorEncoding,
}

impl ImageBundle {
    /// Empty bundle with sRGB encoding; a frame sink fills it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle holding `color` and no extra channels.
    pub fn from_color(color: Image3F, color_encoding: ColorEncoding) -> Self {
        Self {
            color: Some(color),
            extra_channels: Vec::new(),
            color_encoding,
        }
    }

    /// Color planes, once allocated.
    pub fn color(&self) -> Option<&Image3F> {
        self.color.as_ref()
    }

    /// Extra channels in channel order (channel `3 + i`).
    pub fn extra_channels(&self) -> &[Plane] {
        &self.extra_channels
    }

    /// What the color planes hold.
    pub fn color_encoding(&self) -> &ColorEncoding {
        &self.color_encoding
    }

    /// Replace the color planes and encoding; extra channels are kept.
    pub fn set_from_image(&mut self, color: Image3F, color_encoding: ColorEncoding) {
        self.color = Some(color);
        self.color_encoding = color_encoding;
    }

    /// Append an extra channel.
    ///
    /// # Errors
    ///
    /// Fails if the plane does not match the color dimensions.
    pub fn push_extra_channel(&mut self, plane: Plane) -> PipelineResult<()> {
        if let Some(color) = &self.color {
            let expected = (color.width(), color.height());
            let actual = (plane.width(), plane.height());
            if actual != expected {
                return Err(PipelineError::ChannelSizeMismatch {
                    channel: 3 + self.extra_channels.len(),
                    actual,
                    expected,
                });
            }
        }
        self.extra_channels.push(plane);
        Ok(())
    }

    /// Borrow every channel in pipeline order: color first, then extras.
    ///
    /// Empty if the color planes were never allocated.
    pub fn channel_refs(&self) -> Vec<ImgRef<'_, f32>> {
        let Some(color) = &self.color else {
            return Vec::new();
        };
        color
            .planes()
            .iter()
            .chain(&self.extra_channels)
            .map(|p| p.as_ref())
            .collect()
    }

    pub(crate) fn parts_mut(
        &mut self,
    ) -> (&mut Option<Image3F>, &mut Vec<Plane>, &mut ColorEncoding) {
        (
            &mut self.color,
            &mut self.extra_channels,
            &mut self.color_encoding,
        )
    }
}
