//! Frame scaling

use crate::error::{Error, Result};
use crate::types::{Frame, CHANNELS};

/// Keys cubic coefficient, matching common computer-vision resizers
const CUBIC_A: f32 = -0.75;

/// Bicubic-scale a frame to `dst_width`×`dst_height`
pub fn scale_frame(frame: &Frame, dst_width: u32, dst_height: u32) -> Result<Frame> {
    let data = scale_bicubic(
        &frame.data,
        frame.width,
        frame.height,
        dst_width,
        dst_height,
    )?;
    Frame::from_data(data, dst_width, dst_height)
}

fn check_input(input: &[u8], src_w: usize, src_h: usize, dst_w: u32, dst_h: u32) -> Result<()> {
    if dst_w == 0 || dst_h == 0 || src_w == 0 || src_h == 0 {
        return Err(Error::InvalidFrame(format!(
            "cannot scale {src_w}x{src_h} to {dst_w}x{dst_h}"
        )));
    }
    if input.len() < src_w * src_h * CHANNELS {
        return Err(Error::InvalidFrame("Input buffer too small".into()));
    }
    Ok(())
}

fn cubic_weight(t: f32) -> f32 {
    let t = t.abs();
    if t <= 1.0 {
        ((CUBIC_A + 2.0) * t - (CUBIC_A + 3.0)) * t * t + 1.0
    } else if t < 2.0 {
        ((CUBIC_A * t - 5.0 * CUBIC_A) * t + 8.0 * CUBIC_A) * t - 4.0 * CUBIC_A
    } else {
        0.0
    }
}

/// Source taps and weights for every destination coordinate along one axis
fn cubic_taps(src_len: usize, dst_len: usize) -> Vec<([usize; 4], [f32; 4])> {
    let scale = src_len as f32 / dst_len as f32;
    let last = src_len as isize - 1;

    (0..dst_len)
        .map(|d| {
            let center = (d as f32 + 0.5) * scale - 0.5;
            let base = center.floor();
            let frac = center - base;
            let base = base as isize;

            let mut idx = [0usize; 4];
            let mut w = [0f32; 4];
            for k in 0..4 {
                let offset = k as isize - 1;
                idx[k] = (base + offset).clamp(0, last) as usize;
                w[k] = cubic_weight(frac - offset as f32);
            }
            (idx, w)
        })
        .collect()
}

/// Separable bicubic scaling of RGB24 data
pub fn scale_bicubic(
    input: &[u8],
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
) -> Result<Vec<u8>> {
    let src_w = src_width as usize;
    let src_h = src_height as usize;
    check_input(input, src_w, src_h, dst_width, dst_height)?;

    if src_width == dst_width && src_height == dst_height {
        return Ok(input[..src_w * src_h * CHANNELS].to_vec());
    }

    let dst_w = dst_width as usize;
    let dst_h = dst_height as usize;

    // Horizontal pass: src_h rows of dst_w pixels
    let x_taps = cubic_taps(src_w, dst_w);
    let mut horizontal = vec![0f32; src_h * dst_w * CHANNELS];
    for y in 0..src_h {
        let src_row = &input[y * src_w * CHANNELS..(y + 1) * src_w * CHANNELS];
        let out_row = &mut horizontal[y * dst_w * CHANNELS..(y + 1) * dst_w * CHANNELS];
        for (x, (idx, w)) in x_taps.iter().enumerate() {
            for c in 0..CHANNELS {
                let mut acc = 0f32;
                for k in 0..4 {
                    acc += src_row[idx[k] * CHANNELS + c] as f32 * w[k];
                }
                out_row[x * CHANNELS + c] = acc;
            }
        }
    }

    // Vertical pass
    let y_taps = cubic_taps(src_h, dst_h);
    let row_len = dst_w * CHANNELS;
    let mut output = vec![0u8; dst_h * row_len];
    for (y, (idx, w)) in y_taps.iter().enumerate() {
        let out_row = &mut output[y * row_len..(y + 1) * row_len];
        for (i, out) in out_row.iter_mut().enumerate() {
            let mut acc = 0f32;
            for k in 0..4 {
                acc += horizontal[idx[k] * row_len + i] * w[k];
            }
            *out = acc.round().clamp(0.0, 255.0) as u8;
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Frame {
        let data = (0..width * height).flat_map(|_| rgb).collect();
        Frame::from_data(data, width, height).unwrap()
    }

    #[test]
    fn test_cubic_weights_partition_unity() {
        for frac in [0.0f32, 0.25, 0.5, 0.9] {
            let sum: f32 = (-1..3).map(|k| cubic_weight(frac - k as f32)).sum();
            assert!((sum - 1.0).abs() < 1e-5, "frac {frac} sums to {sum}");
        }
        assert_eq!(cubic_weight(0.0), 1.0);
        assert_eq!(cubic_weight(2.0), 0.0);
    }

    #[test]
    fn test_bicubic_preserves_solid_color() {
        let frame = solid(64, 48, [10, 128, 250]);
        let scaled = scale_frame(&frame, 20, 15).unwrap();
        assert_eq!(scaled.resolution().width, 20);
        assert!(scaled.data.chunks(3).all(|p| p == [10, 128, 250]));

        let upscaled = scale_frame(&frame, 100, 75).unwrap();
        assert!(upscaled.data.chunks(3).all(|p| p == [10, 128, 250]));
    }

    #[test]
    fn test_identity_scale_copies() {
        let frame = solid(8, 8, [1, 2, 3]);
        let out = scale_bicubic(&frame.data, 8, 8, 8, 8).unwrap();
        assert_eq!(out, frame.data);
    }

    #[test]
    fn test_rejects_short_buffer() {
        assert!(scale_bicubic(&[0; 5], 2, 1, 4, 4).is_err());
        assert!(scale_bicubic(&[0; 6], 2, 1, 0, 4).is_err());
    }
}
