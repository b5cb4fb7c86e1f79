use anyhow::{Result, anyhow, ensure};
use nokhwa::{Buffer, utils::FrameFormat};
use rayon::prelude::*;
use yuv::{
    YuvBiPlanarImage, YuvConversionMode, YuvPackedImage, YuvRange, YuvStandardMatrix,
    yuv_nv12_to_rgba, yuyv422_to_rgba,
};
use zune_jpeg::{
    JpegDecoder,
    zune_core::{bytestream::ZCursor, colorspace::ColorSpace, options::DecoderOptions},
};

#[derive(Debug)]
pub struct RgbaImage {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Byte layouts that only need per-pixel shuffling.
#[derive(Clone, Copy, Debug)]
enum Packed {
    Rgb,
    Bgr,
    Gray,
}

impl Packed {
    fn bytes_per_pixel(self) -> usize {
        match self {
            Packed::Rgb | Packed::Bgr => 3,
            Packed::Gray => 1,
        }
    }
}

pub fn convert_camera_buffer(buffer: &Buffer) -> Result<RgbaImage> {
    let resolution = buffer.resolution();
    let (width, height) = (resolution.width_x, resolution.height_y);
    let data = buffer.buffer();

    let (rgba, width, height) = match buffer.source_frame_format() {
        FrameFormat::NV12 => (nv12(data, width, height)?, width, height),
        FrameFormat::YUYV => (yuyv(data, width, height)?, width, height),
        FrameFormat::MJPEG => mjpeg(data)?,
        FrameFormat::RAWRGB => (packed(data, width, height, Packed::Rgb)?, width, height),
        FrameFormat::RAWBGR => (packed(data, width, height, Packed::Bgr)?, width, height),
        FrameFormat::GRAY => (packed(data, width, height, Packed::Gray)?, width, height),
    };

    Ok(RgbaImage {
        rgba,
        width,
        height,
    })
}

fn pixel_count(width: u32, height: u32) -> usize {
    width as usize * height as usize
}

fn nv12(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let luma_len = pixel_count(width, height);
    let chroma_len = luma_len / 2;
    ensure!(
        data.len() >= luma_len + chroma_len,
        "NV12 buffer holds {} bytes, need {}",
        data.len(),
        luma_len + chroma_len
    );

    let planes = YuvBiPlanarImage {
        y_plane: &data[..luma_len],
        y_stride: width,
        uv_plane: &data[luma_len..luma_len + chroma_len],
        uv_stride: width,
        width,
        height,
    };
    let mut rgba = vec![0u8; luma_len * 4];
    yuv_nv12_to_rgba(
        &planes,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
        YuvConversionMode::Balanced,
    )
    .map_err(|err| anyhow!("NV12 conversion failed: {err:?}"))?;
    Ok(rgba)
}

fn yuyv(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let needed = pixel_count(width, height) * 2;
    ensure!(
        data.len() >= needed,
        "YUYV buffer holds {} bytes, need {needed}",
        data.len()
    );

    let packed = YuvPackedImage {
        yuy: data,
        yuy_stride: width * 2,
        width,
        height,
    };
    let mut rgba = vec![0u8; pixel_count(width, height) * 4];
    yuyv422_to_rgba(
        &packed,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
    )
    .map_err(|err| anyhow!("YUYV conversion failed: {err:?}"))?;
    Ok(rgba)
}

/// MJPEG frames carry their own dimensions, which win over the negotiated resolution.
fn mjpeg(data: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGBA);
    let mut decoder = JpegDecoder::new_with_options(ZCursor::new(data), options);
    let rgba = decoder
        .decode()
        .map_err(|err| anyhow!("MJPEG decode failed: {err:?}"))?;
    let info = decoder
        .info()
        .ok_or_else(|| anyhow!("MJPEG decoder produced no image info"))?;

    let width = u32::try_from(info.width).map_err(|_| anyhow!("MJPEG width out of range"))?;
    let height = u32::try_from(info.height).map_err(|_| anyhow!("MJPEG height out of range"))?;
    ensure!(
        rgba.len() >= pixel_count(width, height) * 4,
        "MJPEG decode produced {} bytes for {width}x{height}",
        rgba.len()
    );
    Ok((rgba, width, height))
}

fn packed(data: &[u8], width: u32, height: u32, layout: Packed) -> Result<Vec<u8>> {
    let bpp = layout.bytes_per_pixel();
    let needed = pixel_count(width, height) * bpp;
    ensure!(
        data.len() >= needed,
        "{layout:?} buffer holds {} bytes, need {needed}",
        data.len()
    );

    let mut rgba = vec![255u8; pixel_count(width, height) * 4];
    rgba.par_chunks_exact_mut(4)
        .zip(data[..needed].par_chunks_exact(bpp))
        .for_each(|(dst, src)| {
            let rgb = match layout {
                Packed::Rgb => [src[0], src[1], src[2]],
                Packed::Bgr => [src[2], src[1], src[0]],
                Packed::Gray => [src[0]; 3],
            };
            dst[..3].copy_from_slice(&rgb);
        });
    Ok(rgba)
}
