//! Deterministic in-memory frame source

use super::{FrameSource, FrameStream};
use crate::error::{Error, Result};
use crate::types::{Frame, CHANNELS};
use std::collections::HashMap;

/// Shape of one synthetic video
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticVideo {
    pub frames: usize,
    pub width: u32,
    pub height: u32,
    /// Raise a decode error when this frame index is reached
    pub fail_at: Option<usize>,
}

impl SyntheticVideo {
    pub fn new(frames: usize, width: u32, height: u32) -> Self {
        Self {
            frames,
            width,
            height,
            fail_at: None,
        }
    }

    pub fn with_fail_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }
}

/// Generates frames for registered handles; unknown handles fail to open
#[derive(Debug, Clone, Default)]
pub struct SyntheticSource {
    videos: HashMap<String, SyntheticVideo>,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a video under `handle`
    pub fn with_video(mut self, handle: impl Into<String>, video: SyntheticVideo) -> Self {
        self.videos.insert(handle.into(), video);
        self
    }

    pub fn insert(&mut self, handle: impl Into<String>, video: SyntheticVideo) {
        self.videos.insert(handle.into(), video);
    }

    pub fn len(&self) -> usize {
        self.videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }
}

impl FrameSource for SyntheticSource {
    fn open(&self, handle: &str) -> Result<Box<dyn FrameStream>> {
        let video = self
            .videos
            .get(handle)
            .copied()
            .ok_or_else(|| Error::Open(format!("no synthetic video named {handle}")))?;
        if video.width == 0 || video.height == 0 {
            return Err(Error::Open(format!(
                "{handle} has empty geometry {}x{}",
                video.width, video.height
            )));
        }
        Ok(Box::new(SyntheticStream {
            handle: handle.to_string(),
            video,
            next: 0,
        }))
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

struct SyntheticStream {
    handle: String,
    video: SyntheticVideo,
    next: usize,
}

impl FrameStream for SyntheticStream {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.video.fail_at == Some(self.next) {
            return Err(Error::Decode(format!(
                "{} is corrupt at frame {}",
                self.handle, self.next
            )));
        }
        if self.next >= self.video.frames {
            return Ok(None);
        }

        let index = self.next;
        self.next += 1;
        Ok(Some(pattern_frame(index, self.video.width, self.video.height)))
    }
}

/// Gradient whose phase depends on the frame index
fn pattern_frame(index: usize, width: u32, height: u32) -> Frame {
    let w = width as usize;
    let h = height as usize;
    let mut data = vec![0u8; w * h * CHANNELS];
    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) * CHANNELS;
            data[idx] = ((x + index) % 256) as u8;
            data[idx + 1] = ((y + index) % 256) as u8;
            data[idx + 2] = (index % 256) as u8;
        }
    }
    Frame {
        data,
        width,
        height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(stream: &mut dyn FrameStream) -> Result<usize> {
        let mut count = 0;
        while stream.next_frame()?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    #[test]
    fn test_yields_registered_frame_count() {
        let source = SyntheticSource::new().with_video("a", SyntheticVideo::new(5, 8, 6));
        let mut stream = source.open("a").unwrap();
        assert_eq!(drain(stream.as_mut()).unwrap(), 5);
        assert!(stream.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_frames_are_deterministic() {
        let source = SyntheticSource::new().with_video("a", SyntheticVideo::new(3, 4, 4));
        let mut one = source.open("a").unwrap();
        let mut two = source.open("a").unwrap();
        for _ in 0..3 {
            assert_eq!(one.next_frame().unwrap(), two.next_frame().unwrap());
        }
        let frame = pattern_frame(2, 4, 4);
        assert_eq!(frame.pixel(1, 3), [3, 5, 2]);
    }

    #[test]
    fn test_unknown_and_failing_videos() {
        let source = SyntheticSource::new()
            .with_video("bad", SyntheticVideo::new(10, 4, 4).with_fail_at(3));
        assert!(matches!(source.open("missing"), Err(Error::Open(_))));

        let mut stream = source.open("bad").unwrap();
        let err = drain(stream.as_mut()).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert!(err.is_recoverable());
    }
}
