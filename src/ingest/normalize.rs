#![cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]

use anyhow::Result;

use crate::PipelineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    Nv12,
    Yuyv,
}

pub(crate) fn normalize_to_rgb(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Vec<u8>> {
    match format {
        PixelFormat::Rgb24 => {
            let expected = plane_len(width, height)?
                .checked_mul(3)
                .ok_or_else(|| decode_failure("RGB frame dimensions overflow".to_string()))?;
            if pixels.len() != expected {
                return Err(decode_failure(format!(
                    "RGB frame length mismatch: expected {}, got {}",
                    expected,
                    pixels.len()
                )));
            }
            Ok(pixels.to_vec())
        }
        PixelFormat::Nv12 => nv12_to_rgb(pixels, width, height),
        PixelFormat::Yuyv => yuyv_to_rgb(pixels, width, height),
    }
}

fn decode_failure(reason: String) -> anyhow::Error {
    PipelineError::FrameDecodeFailure { reason }.into()
}

fn plane_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| decode_failure("frame dimensions overflow".to_string()))
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = plane_len(width, height)?;
    let expected = y_plane + y_plane / 2;
    if pixels.len() != expected {
        return Err(decode_failure(format!(
            "NV12 frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        )));
    }

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;
            write_rgb(&mut rgb[(j * w + i) * 3..], y, u, v);
        }
    }

    Ok(rgb)
}

/// Packed 4:2:2, two pixels per `Y0 U Y1 V` quad.
fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let count = plane_len(width, height)?;
    if width % 2 != 0 || pixels.len() != count * 2 {
        return Err(decode_failure(format!(
            "YUYV frame length mismatch: expected {} for {}x{}, got {}",
            count * 2,
            width,
            height,
            pixels.len()
        )));
    }

    let mut rgb = vec![0u8; count * 3];
    for (quad, out) in pixels.chunks_exact(4).zip(rgb.chunks_exact_mut(6)) {
        let u = quad[1] as f32 - 128.0;
        let v = quad[3] as f32 - 128.0;
        write_rgb(&mut out[..3], quad[0] as f32, u, v);
        write_rgb(&mut out[3..], quad[2] as f32, u, v);
    }
    Ok(rgb)
}

fn write_rgb(out: &mut [u8], y: f32, u: f32, v: f32) {
    let r = y + 1.402_f32 * v;
    let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
    let b = y + 1.772_f32 * u;
    out[0] = clamp_to_u8(r);
    out[1] = clamp_to_u8(g);
    out[2] = clamp_to_u8(b);
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
