//! Video processing module
//!
//! Geometric normalization of decoded frames: an aspect-preserving bicubic
//! resize so the shorter side matches the target, followed by a center crop
//! to a fixed square.

mod scale;

pub use scale::{scale_bicubic, scale_frame};

use crate::error::{Error, Result};
use crate::types::{Frame, Resolution, CHANNELS};

/// Resize dimensions that bring the shorter side to `target` while keeping aspect
pub fn resize_dimensions(src: Resolution, target: u32) -> Resolution {
    let (short, long, width_is_short) = if src.height < src.width {
        (src.height, src.width, false)
    } else {
        (src.width, src.height, true)
    };
    let ratio = short as f64 / target as f64;
    // Floor at `target` to absorb rounding error on the long side
    let scaled_long = ((long as f64 / ratio) as u32).max(target);

    if width_is_short {
        Resolution::new(target, scaled_long)
    } else {
        Resolution::new(scaled_long, target)
    }
}

/// Square crop of `size` from the center of `frame`
pub fn center_crop(frame: &Frame, size: u32) -> Result<Frame> {
    if frame.width < size || frame.height < size {
        return Err(Error::InvalidFrame(format!(
            "cannot crop {size}x{size} from {}",
            frame.resolution()
        )));
    }
    let off_y = ((frame.height - size) / 2) as usize;
    let off_x = ((frame.width - size) / 2) as usize;
    let src_row = frame.width as usize * CHANNELS;
    let dst_row = size as usize * CHANNELS;

    let mut data = Vec::with_capacity(dst_row * size as usize);
    for y in off_y..off_y + size as usize {
        let start = y * src_row + off_x * CHANNELS;
        data.extend_from_slice(&frame.data[start..start + dst_row]);
    }
    Frame::from_data(data, size, size)
}

/// Resizes and center-crops frames of one video to `size`×`size`
///
/// The resize geometry is computed from the first frame it sees and reused, since
/// every frame of a video shares the same dimensions.
#[derive(Debug, Clone)]
pub struct Normalizer {
    size: u32,
    geometry: Option<(Resolution, Resolution)>,
}

impl Normalizer {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            geometry: None,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Normalize one frame to `size`×`size`×3
    pub fn normalize(&mut self, frame: &Frame) -> Result<Frame> {
        let src = frame.resolution();
        let resized = match self.geometry {
            Some((from, to)) if from == src => to,
            _ => {
                let to = resize_dimensions(src, self.size);
                self.geometry = Some((src, to));
                to
            }
        };

        let scaled = scale_frame(frame, resized.width, resized.height)?;
        center_crop(&scaled, self.size)
    }
}

/// Normalize a single frame (pure, stateless)
pub fn normalize(frame: &Frame, target_size: u32) -> Result<Frame> {
    Normalizer::new(target_size).normalize(frame)
}
