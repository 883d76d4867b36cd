use std::sync::{Mutex, PoisonError};

use crate::channel::ChannelMode;
use crate::color::ColorEncoding;
use crate::error::{PipelineError, PipelineResult};
use crate::image::{Image3F, ImageBundle, Plane, try_alloc_plane};
use crate::row::{InputRows, RowPosition};

type PlaneRows<'a> = Vec<Mutex<&'a mut [f32]>>;

fn split_rows(plane: &mut Plane) -> PlaneRows<'_> {
    let (width, height, stride) = (plane.width(), plane.height(), plane.stride());
    plane
        .buf_mut()
        .chunks_mut(stride)
        .take(height)
        .map(|row| Mutex::new(&mut row[..width]))
        .collect()
}

/// Copy `[xpos - xextra, xpos + xsize + xextra)`, clipped to the plane.
fn copy_row(rows: &[Mutex<&mut [f32]>], src: &[f32], src_pad: usize, pos: RowPosition) {
    let Some(row) = rows.get(pos.ypos) else {
        return;
    };
    let mut row = row.lock().unwrap_or_else(PoisonError::into_inner);
    let start = pos.xpos.saturating_sub(pos.xextra);
    let end = (pos.xpos + pos.xsize + pos.xextra).min(row.len());
    if start >= end {
        return;
    }
    let from = src_pad - (pos.xpos - start);
    row[start..end].copy_from_slice(&src[from..from + (end - start)]);
}

fn check_sizes(stage: &str, sizes: &[(usize, usize)], equal: usize) -> PipelineResult<()> {
    if sizes.len() < 3 {
        return Err(PipelineError::invalid(format!(
            "{stage} needs 3 color channels, the frame has {}",
            sizes.len()
        )));
    }
    let expected = sizes[0];
    for (channel, &actual) in sizes.iter().enumerate().take(equal).skip(1) {
        if actual != expected {
            return Err(PipelineError::ChannelSizeMismatch {
                channel,
                actual,
                expected,
            });
        }
    }
    Ok(())
}

/// Ensure `slot` holds a `width` x `height` image, keeping a matching one.
fn prepare_image(slot: &mut Option<Image3F>, width: usize, height: usize) -> PipelineResult<bool> {
    let reuse = slot
        .as_ref()
        .is_some_and(|img| img.width() == width && img.height() == height);
    if !reuse {
        *slot = Some(Image3F::new(width, height)?);
    }
    Ok(reuse)
}

/// Copies every channel into an [`ImageBundle`]: color planes first, then
/// one extra channel per remaining pipeline channel.
///
/// No conversion happens here; orientation, alpha and numeric handling
/// belong to whoever produced the channels. Existing planes are reused when
/// their dimensions already match.
pub struct FrameBufferSink<'a> {
    target: Option<&'a mut ImageBundle>,
    color_encoding: ColorEncoding,
    planes: Vec<PlaneRows<'a>>,
}

impl<'a> FrameBufferSink<'a> {
    /// Fill `bundle`, tagging it with `color_encoding`.
    pub fn new(bundle: &'a mut ImageBundle, color_encoding: ColorEncoding) -> Self {
        Self {
            target: Some(bundle),
            color_encoding,
            planes: Vec::new(),
        }
    }

    pub(crate) fn channel_mode(&self, _c: usize) -> ChannelMode {
        ChannelMode::Input
    }

    pub(crate) fn set_input_sizes(&mut self, sizes: &[(usize, usize)]) -> PipelineResult<()> {
        check_sizes("WriteIB", sizes, sizes.len())?;
        let bundle = self
            .target
            .take()
            .ok_or_else(|| PipelineError::invalid("WriteIB was already bound to its frame"))?;
        let (color, extras, encoding) = bundle.parts_mut();
        let (width, height) = sizes[0];
        let reused_color = prepare_image(color, width, height)?;

        let extra_sizes = &sizes[3..];
        let reused_extras = extras.len() == extra_sizes.len()
            && extras
                .iter()
                .zip(extra_sizes)
                .all(|(p, &(w, h))| p.width() == w && p.height() == h);
        if !reused_extras {
            extras.clear();
            for &(w, h) in extra_sizes {
                extras.push(try_alloc_plane(w, h)?);
            }
        }
        encoding.clone_from(&self.color_encoding);
        tracing::debug!(
            width,
            height,
            extra_channels = extra_sizes.len(),
            reused_color,
            reused_extras,
            "frame planes ready"
        );

        self.planes = color
            .iter_mut()
            .flat_map(|img| img.planes_mut().iter_mut())
            .chain(extras.iter_mut())
            .map(split_rows)
            .collect();
        Ok(())
    }

    pub(crate) fn process_row(&self, input: &InputRows<'_>, pos: RowPosition) -> PipelineResult<()> {
        if self.planes.is_empty() {
            return Err(PipelineError::NotPrepared("WriteIB"));
        }
        for (c, rows) in self.planes.iter().enumerate() {
            copy_row(rows, input.row(c), input.pad(), pos);
        }
        Ok(())
    }
}

impl core::fmt::Debug for FrameBufferSink<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameBufferSink")
            .field("color_encoding", &self.color_encoding)
            .field("channels", &self.planes.len())
            .finish_non_exhaustive()
    }
}

/// Copies the three color channels into a bare [`Image3F`].
pub struct PlanarBufferSink<'a> {
    target: Option<&'a mut Option<Image3F>>,
    planes: Vec<PlaneRows<'a>>,
}

impl<'a> PlanarBufferSink<'a> {
    /// Fill `image`, allocating it unless it already has the frame size.
    pub fn new(image: &'a mut Option<Image3F>) -> Self {
        Self {
            target: Some(image),
            planes: Vec::new(),
        }
    }

    pub(crate) fn channel_mode(&self, c: usize) -> ChannelMode {
        if c < 3 {
            ChannelMode::Input
        } else {
            ChannelMode::Ignored
        }
    }

    pub(crate) fn set_input_sizes(&mut self, sizes: &[(usize, usize)]) -> PipelineResult<()> {
        check_sizes("WriteI3F", sizes, 3)?;
        let slot = self
            .target
            .take()
            .ok_or_else(|| PipelineError::invalid("WriteI3F was already bound to its image"))?;
        let (width, height) = sizes[0];
        let reused = prepare_image(slot, width, height)?;
        tracing::debug!(width, height, reused, "planar image ready");
        self.planes = slot
            .iter_mut()
            .flat_map(|img| img.planes_mut().iter_mut())
            .map(split_rows)
            .collect();
        Ok(())
    }

    pub(crate) fn process_row(&self, input: &InputRows<'_>, pos: RowPosition) -> PipelineResult<()> {
        if self.planes.is_empty() {
            return Err(PipelineError::NotPrepared("WriteI3F"));
        }
        for (c, rows) in self.planes.iter().enumerate() {
            copy_row(rows, input.row(c), input.pad(), pos);
        }
        Ok(())
    }
}

impl core::fmt::Debug for PlanarBufferSink<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PlanarBufferSink")
            .field("prepared", &!self.planes.is_empty())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows<'a>(planes: &'a [Vec<f32>], pad: usize) -> InputRows<'a> {
        InputRows::new(planes.iter().map(|p| Some(&p[..])).collect(), pad)
    }

    #[test]
    fn bundle_receives_color_and_extras() {
        let mut bundle = ImageBundle::new();
        {
            let mut sink = FrameBufferSink::new(&mut bundle, ColorEncoding::linear_srgb());
            assert_eq!(sink.channel_mode(7), ChannelMode::Input);
            sink.set_input_sizes(&[(3, 2); 4]).unwrap();
            for y in 0..2 {
                let planes: Vec<Vec<f32>> = (0..4)
                    .map(|c| (0..3).map(|x| (c * 100 + y * 10 + x) as f32).collect())
                    .collect();
                sink.process_row(&rows(&planes, 0), RowPosition::new(0, y, 3))
                    .unwrap();
            }
        }
        assert!(bundle.color_encoding().is_linear());
        let color = bundle.color().unwrap();
        assert_eq!((color.width(), color.height()), (3, 2));
        assert_eq!(color.row(0, 0), &[0.0, 1.0, 2.0]);
        assert_eq!(color.row(2, 1), &[210.0, 211.0, 212.0]);
        assert_eq!(bundle.extra_channels().len(), 1);
        assert_eq!(bundle.extra_channels()[0].buf()[3..6], [310.0, 311.0, 312.0]);
    }

    #[test]
    fn bundle_reuses_matching_planes() {
        let mut bundle = ImageBundle::from_color(Image3F::new(4, 4).unwrap(), ColorEncoding::srgb());
        bundle.push_extra_channel(try_alloc_plane(4, 4).unwrap()).unwrap();
        let color_ptr = bundle.color().unwrap().plane(1).buf().as_ptr();
        let extra_ptr = bundle.extra_channels()[0].buf().as_ptr();
        {
            let mut sink = FrameBufferSink::new(&mut bundle, ColorEncoding::srgb());
            sink.set_input_sizes(&[(4, 4); 4]).unwrap();
        }
        assert_eq!(bundle.color().unwrap().plane(1).buf().as_ptr(), color_ptr);
        assert_eq!(bundle.extra_channels()[0].buf().as_ptr(), extra_ptr);

        {
            let mut sink = FrameBufferSink::new(&mut bundle, ColorEncoding::srgb());
            sink.set_input_sizes(&[(2, 3); 5]).unwrap();
        }
        let color = bundle.color().unwrap();
        assert_eq!((color.width(), color.height()), (2, 3));
        assert_eq!(bundle.extra_channels().len(), 2);
        assert!(bundle.extra_channels().iter().all(|p| p.width() == 2 && p.height() == 3));
    }

    #[test]
    fn bundle_rejects_bad_sizes() {
        let mut bundle = ImageBundle::new();
        let mut sink = FrameBufferSink::new(&mut bundle, ColorEncoding::srgb());
        assert!(matches!(
            sink.set_input_sizes(&[(2, 2); 2]),
            Err(PipelineError::InvalidPipeline(_))
        ));
        assert!(matches!(
            sink.set_input_sizes(&[(2, 2), (2, 2), (2, 2), (1, 2)]),
            Err(PipelineError::ChannelSizeMismatch {
                channel: 3,
                actual: (1, 2),
                expected: (2, 2)
            })
        ));
        let planes = vec![vec![0.0; 2]; 3];
        assert!(matches!(
            sink.process_row(&rows(&planes, 0), RowPosition::new(0, 0, 2)),
            Err(PipelineError::NotPrepared("WriteIB"))
        ));
    }

    #[test]
    fn border_samples_are_copied_and_clipped() {
        let mut image = None;
        {
            let mut sink = PlanarBufferSink::new(&mut image);
            sink.set_input_sizes(&[(5, 1); 3]).unwrap();
            // xpos = 2, xsize = 2, xextra = 1: frame columns 1..5.
            let planes = vec![vec![1.0, 2.0, 3.0, 4.0]; 3];
            sink.process_row(&rows(&planes, 1), RowPosition::new(2, 0, 2).with_xextra(1))
                .unwrap();
            // xpos = 0 with xextra = 1: the left border sample is off-frame.
            let planes = vec![vec![9.0, 5.0, 6.0]; 3];
            sink.process_row(&rows(&planes, 1), RowPosition::new(0, 0, 1).with_xextra(1))
                .unwrap();
        }
        let image = image.unwrap();
        assert_eq!(image.row(0, 0), &[5.0, 6.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn planar_ignores_extras_and_skips_rows_past_height() {
        let mut image = Some(Image3F::new(2, 2).unwrap());
        {
            let mut sink = PlanarBufferSink::new(&mut image);
            assert_eq!(sink.channel_mode(3), ChannelMode::Ignored);
            // Extra channels may differ in size; only color must agree.
            sink.set_input_sizes(&[(2, 2), (2, 2), (2, 2), (1, 1)]).unwrap();
            let planes = vec![vec![0.5; 2]; 3];
            for y in 0..4 {
                sink.process_row(&rows(&planes, 0), RowPosition::new(0, y, 2))
                    .unwrap();
            }
        }
        let image = image.unwrap();
        assert!(image.planes().iter().all(|p| p.buf().iter().all(|&v| v == 0.5)));
    }

    #[test]
    fn planar_reallocates_on_size_change() {
        let mut image = Some(Image3F::new(8, 8).unwrap());
        {
            let mut sink = PlanarBufferSink::new(&mut image);
            sink.set_input_sizes(&[(3, 1); 3]).unwrap();
        }
        let image = image.unwrap();
        assert_eq!((image.width(), image.height()), (3, 1));
    }

    #[test]
    fn strided_planes_are_respected() {
        let mut bundle = ImageBundle::new();
        let planes = [0, 1, 2].map(|_| imgref::ImgVec::new_stride(vec![7.0f32; 5], 2, 2, 3));
        bundle.set_from_image(Image3F::from_planes(planes).unwrap(), ColorEncoding::srgb());
        {
            let mut sink = FrameBufferSink::new(&mut bundle, ColorEncoding::srgb());
            sink.set_input_sizes(&[(2, 2); 3]).unwrap();
            let src = vec![vec![1.0, 2.0]; 3];
            sink.process_row(&rows(&src, 0), RowPosition::new(0, 1, 2))
                .unwrap();
        }
        let plane = bundle.color().unwrap().plane(0);
        assert_eq!(plane.buf(), &[7.0, 7.0, 7.0, 1.0, 2.0]);
    }
}
