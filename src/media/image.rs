//! PNG decoding and I420 (YUV 4:2:0) frame manipulation for image playback.
//!
//! Meeting SDKs take camera frames as planar I420 with even dimensions; PNG
//! input is cropped by one row/column where needed.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

fn half_ceil(x: u32) -> u32 {
    (x + 1) / 2
}

/// Cheap validity check: PNG signature plus a full decode.
pub fn is_valid_png(data: &[u8]) -> bool {
    if !data.starts_with(&PNG_SIGNATURE) {
        return false;
    }
    image::load_from_memory_with_format(data, image::ImageFormat::Png).is_ok()
}

/// An owned planar I420 frame.
#[derive(Debug, Clone)]
pub struct I420Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decode PNG bytes into an I420 frame.
///
/// 1-pixel-wide/high images are padded to 2 by edge replication; odd
/// dimensions are cropped down to even.
pub fn png_to_i420(png: &[u8]) -> Result<I420Frame> {
    let decoded = image::load_from_memory_with_format(png, image::ImageFormat::Png)
        .context("failed to decode png")?;
    let mut rgb: RgbImage = decoded.to_rgb8();

    let (mut width, mut height) = rgb.dimensions();
    if width == 0 || height == 0 {
        return Err(anyhow!("png has zero dimensions"));
    }

    if width == 1 || height == 1 {
        let new_w = width.max(2);
        let new_h = height.max(2);
        let mut padded = RgbImage::new(new_w, new_h);
        for y in 0..new_h {
            for x in 0..new_w {
                let src = *rgb.get_pixel(x.min(width - 1), y.min(height - 1));
                padded.put_pixel(x, y, src);
            }
        }
        rgb = padded;
        width = new_w;
        height = new_h;
    }

    width &= !1;
    height &= !1;

    let y_size = (width * height) as usize;
    let uv_size = (half_ceil(width) * half_ceil(height)) as usize;
    let mut data = vec![0u8; y_size + 2 * uv_size];
    let (y_plane, uv_planes) = data.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    // BT.601 full-range conversion; chroma averaged over each 2x2 block.
    for row in 0..height {
        for col in 0..width {
            let pixel = rgb.get_pixel(col, row);
            let (r, g, b) = (pixel[0] as f32, pixel[1] as f32, pixel[2] as f32);
            let y = 0.299 * r + 0.587 * g + 0.114 * b;
            y_plane[(row * width + col) as usize] = y.round().clamp(0.0, 255.0) as u8;
        }
    }
    for block_row in 0..height / 2 {
        for block_col in 0..width / 2 {
            let mut u_acc = 0.0f32;
            let mut v_acc = 0.0f32;
            for dy in 0..2 {
                for dx in 0..2 {
                    let pixel = rgb.get_pixel(block_col * 2 + dx, block_row * 2 + dy);
                    let (r, g, b) = (pixel[0] as f32, pixel[1] as f32, pixel[2] as f32);
                    u_acc += -0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0;
                    v_acc += 0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0;
                }
            }
            let idx = (block_row * half_ceil(width) + block_col) as usize;
            u_plane[idx] = (u_acc / 4.0).round().clamp(0.0, 255.0) as u8;
            v_plane[idx] = (v_acc / 4.0).round().clamp(0.0, 255.0) as u8;
        }
    }

    Ok(I420Frame {
        data,
        width,
        height,
    })
}

/// Scale an I420 frame to `new_size`, preserving aspect ratio.
///
/// When aspect ratios differ the output is letterboxed/pillarboxed against
/// black (Y=0, U=V=128).
pub fn scale_i420(frame: &I420Frame, new_width: u32, new_height: u32) -> Result<I420Frame> {
    let (orig_w, orig_h) = (frame.width, frame.height);
    if orig_w == 0 || orig_h == 0 || new_width == 0 || new_height == 0 {
        return Err(anyhow!("cannot scale to or from zero dimensions"));
    }

    let y_size = (orig_w * orig_h) as usize;
    let uv_w = half_ceil(orig_w);
    let uv_h = half_ceil(orig_h);
    let uv_size = (uv_w * uv_h) as usize;
    if frame.data.len() < y_size + 2 * uv_size {
        return Err(anyhow!(
            "i420 buffer too small: {} bytes for {}x{}",
            frame.data.len(),
            orig_w,
            orig_h
        ));
    }

    let y_src = &frame.data[..y_size];
    let u_src = &frame.data[y_size..y_size + uv_size];
    let v_src = &frame.data[y_size + uv_size..y_size + 2 * uv_size];

    let input_aspect = orig_w as f64 / orig_h as f64;
    let output_aspect = new_width as f64 / new_height as f64;

    // Scaled content size inside the output frame.
    let (scaled_w, scaled_h) = if (input_aspect - output_aspect).abs() < 1e-6 {
        (new_width, new_height)
    } else if input_aspect > output_aspect {
        (
            new_width,
            ((new_width as f64 / input_aspect).round() as u32).max(1),
        )
    } else {
        (
            ((new_height as f64 * input_aspect).round() as u32).max(1),
            new_height,
        )
    };

    let scaled_y = resize_plane(y_src, orig_w, orig_h, scaled_w, scaled_h);
    let scaled_uv_w = half_ceil(scaled_w);
    let scaled_uv_h = half_ceil(scaled_h);
    let scaled_u = resize_plane(u_src, uv_w, uv_h, scaled_uv_w, scaled_uv_h);
    let scaled_v = resize_plane(v_src, uv_w, uv_h, scaled_uv_w, scaled_uv_h);

    let out_uv_w = half_ceil(new_width);
    let out_uv_h = half_ceil(new_height);
    let mut out = vec![0u8; (new_width * new_height) as usize];
    let mut out_u = vec![128u8; (out_uv_w * out_uv_h) as usize];
    let mut out_v = vec![128u8; (out_uv_w * out_uv_h) as usize];

    let offset_x = (new_width - scaled_w) / 2;
    let offset_y = (new_height - scaled_h) / 2;
    blit_plane(&scaled_y, scaled_w, scaled_h, &mut out, new_width, offset_x, offset_y);
    blit_plane(
        &scaled_u,
        scaled_uv_w,
        scaled_uv_h,
        &mut out_u,
        out_uv_w,
        offset_x / 2,
        offset_y / 2,
    );
    blit_plane(
        &scaled_v,
        scaled_uv_w,
        scaled_uv_h,
        &mut out_v,
        out_uv_w,
        offset_x / 2,
        offset_y / 2,
    );

    out.extend_from_slice(&out_u);
    out.extend_from_slice(&out_v);
    Ok(I420Frame {
        data: out,
        width: new_width,
        height: new_height,
    })
}

/// Bilinear single-plane resize.
fn resize_plane(src: &[u8], src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Vec<u8> {
    let mut dst = vec![0u8; (dst_w * dst_h) as usize];
    if src_w == 0 || src_h == 0 {
        return dst;
    }
    let x_ratio = src_w as f64 / dst_w as f64;
    let y_ratio = src_h as f64 / dst_h as f64;
    for dy in 0..dst_h {
        let sy = dy as f64 * y_ratio;
        let y0 = sy as u32;
        let y1 = (y0 + 1).min(src_h - 1);
        let fy = sy - y0 as f64;
        for dx in 0..dst_w {
            let sx = dx as f64 * x_ratio;
            let x0 = sx as u32;
            let x1 = (x0 + 1).min(src_w - 1);
            let fx = sx - x0 as f64;

            let p00 = src[(y0 * src_w + x0) as usize] as f64;
            let p01 = src[(y0 * src_w + x1) as usize] as f64;
            let p10 = src[(y1 * src_w + x0) as usize] as f64;
            let p11 = src[(y1 * src_w + x1) as usize] as f64;

            let top = p00 + fx * (p01 - p00);
            let bottom = p10 + fx * (p11 - p10);
            dst[(dy * dst_w + dx) as usize] = (top + fy * (bottom - top)).round() as u8;
        }
    }
    dst
}

fn blit_plane(
    src: &[u8],
    src_w: u32,
    src_h: u32,
    dst: &mut [u8],
    dst_w: u32,
    offset_x: u32,
    offset_y: u32,
) {
    for row in 0..src_h {
        let dst_row = row + offset_y;
        for col in 0..src_w {
            let dst_col = col + offset_x;
            let dst_idx = (dst_row * dst_w + dst_col) as usize;
            if dst_idx < dst.len() {
                dst[dst_idx] = src[(row * src_w + col) as usize];
            }
        }
    }
}
