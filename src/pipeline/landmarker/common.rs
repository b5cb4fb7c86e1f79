//! Image preprocessing shared by the palm detector and the handpose estimator.

use anyhow::{Context, Result, anyhow, ensure};
use fast_image_resize as fir;
use ndarray::Array4;
use rayon::prelude::*;

use crate::types::Frame;

pub const HANDPOSE_INPUT_SIZE: u32 = 224;
pub const PALM_INPUT_SIZE: u32 = 192;

/// How a frame was scaled and padded into a square model input.
#[derive(Clone, Debug)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub orig_w: u32,
    pub orig_h: u32,
}

fn check_frame(frame: &Frame) -> Result<()> {
    let expected = (frame.width as usize)
        .saturating_mul(frame.height as usize)
        .saturating_mul(4);
    ensure!(
        frame.width > 0 && frame.height > 0,
        "frame has no pixels ({}x{})",
        frame.width,
        frame.height
    );
    ensure!(
        frame.rgba.len() == expected,
        "frame buffer holds {} bytes, expected {expected}",
        frame.rgba.len()
    );
    Ok(())
}

/// Resizes `frame` to fit a `size`×`size` square, centres it on black and returns an NHWC
/// tensor with channels in `[0, 1]`.
pub fn letterbox_tensor(frame: &Frame, size: u32) -> Result<(Array4<f32>, Letterbox)> {
    check_frame(frame)?;

    let scale = size as f32 / frame.width.max(frame.height) as f32;
    let new_w = ((frame.width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((frame.height as f32 * scale).round() as u32).clamp(1, size);

    let src = fir::images::Image::from_vec_u8(
        frame.width,
        frame.height,
        frame.rgba.clone(),
        fir::PixelType::U8x4,
    )?;
    let mut dst = fir::images::Image::new(new_w, new_h, fir::PixelType::U8x4);
    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    fir::Resizer::new()
        .resize(&src, &mut dst, Some(&options))
        .context("frame resize failed")?;
    let resized = dst.into_vec();

    let pad_x = ((size - new_w) / 2) as usize;
    let pad_y = ((size - new_h) / 2) as usize;
    let side = size as usize;
    let row_len = new_w as usize * 4;

    // Black canvas; the alpha channel is dropped below.
    let mut canvas = vec![0u8; side * side * 4];
    for (row, src_row) in resized.chunks_exact(row_len).enumerate() {
        let offset = ((pad_y + row) * side + pad_x) * 4;
        canvas[offset..offset + row_len].copy_from_slice(src_row);
    }

    let values: Vec<f32> = canvas
        .par_chunks_exact(4)
        .flat_map_iter(|px| px[..3].iter().map(|&c| c as f32 / 255.0))
        .collect();
    let tensor = Array4::from_shape_vec((1, side, side, 3), values)
        .map_err(|err| anyhow!("failed to shape letterbox tensor: {err}"))?;

    Ok((
        tensor,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
            orig_w: frame.width,
            orig_h: frame.height,
        },
    ))
}

/// A square, rotated region of a frame, in frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RotatedCrop {
    pub center: (f32, f32),
    pub side: f32,
    /// Rotation in radians applied when sampling the frame.
    pub angle: f32,
}

impl RotatedCrop {
    /// Samples the crop into an `output_size`×`output_size` NHWC tensor using bilinear filtering.
    pub fn sample(&self, frame: &Frame, output_size: u32) -> Result<Array4<f32>> {
        check_frame(frame)?;

        let n = output_size as usize;
        let (sin, cos) = self.angle.sin_cos();
        let step = self.side / output_size as f32;
        let half = output_size as f32 / 2.0;

        let mut values = vec![0f32; n * n * 3];
        values
            .par_chunks_exact_mut(n * 3)
            .enumerate()
            .for_each(|(y, row)| {
                let dy = (y as f32 + 0.5 - half) * step;
                for (x, px) in row.chunks_exact_mut(3).enumerate() {
                    let dx = (x as f32 + 0.5 - half) * step;
                    let sx = self.center.0 + dx * cos - dy * sin;
                    let sy = self.center.1 + dx * sin + dy * cos;
                    px.copy_from_slice(&bilinear(frame, sx, sy));
                }
            });

        Array4::from_shape_vec((1, n, n, 3), values)
            .map_err(|err| anyhow!("failed to shape crop tensor: {err}"))
    }

    /// Maps a point given in crop-input pixels back to frame pixels.
    pub fn to_frame(&self, x: f32, y: f32, input_size: u32) -> (f32, f32) {
        let half = input_size as f32 / 2.0;
        let step = self.side / input_size as f32;
        let (sin, cos) = self.angle.sin_cos();
        let dx = (x - half) * step;
        let dy = (y - half) * step;
        (
            self.center.0 + dx * cos - dy * sin,
            self.center.1 + dx * sin + dy * cos,
        )
    }
}

fn bilinear(frame: &Frame, x: f32, y: f32) -> [f32; 3] {
    if !x.is_finite() || !y.is_finite() {
        return [0.0; 3];
    }

    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let texel = |tx: f32, ty: f32| -> [f32; 3] {
        if tx < 0.0 || ty < 0.0 || tx >= frame.width as f32 || ty >= frame.height as f32 {
            return [0.0; 3];
        }
        let idx = (ty as usize * frame.width as usize + tx as usize) * 4;
        [
            frame.rgba[idx] as f32 / 255.0,
            frame.rgba[idx + 1] as f32 / 255.0,
            frame.rgba[idx + 2] as f32 / 255.0,
        ]
    };

    let (c00, c10) = (texel(x0, y0), texel(x0 + 1.0, y0));
    let (c01, c11) = (texel(x0, y0 + 1.0), texel(x0 + 1.0, y0 + 1.0));
    let mut out = [0.0; 3];
    for c in 0..3 {
        let top = c00[c] + (c10[c] - c00[c]) * fx;
        let bottom = c01[c] + (c11[c] - c01[c]) * fx;
        out[c] = top + (bottom - top) * fy;
    }
    out
}
