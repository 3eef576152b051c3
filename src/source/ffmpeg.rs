//! FFmpeg-backed frame source
//!
//! Opens anything libavformat can (local files, http/https URLs) and converts
//! the best video stream to RGB24 at its native size.

use super::{FrameSource, FrameStream};
use crate::error::{Error, Result};
use crate::types::{Frame, CHANNELS};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context as Scaler, Flags as ScalerFlags};

/// Decodes with libavcodec
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegSource;

impl FfmpegSource {
    pub fn new() -> Result<Self> {
        ffmpeg::init().map_err(|e| Error::FFmpeg(e.to_string()))?;
        Ok(Self)
    }
}

impl FrameSource for FfmpegSource {
    fn open(&self, handle: &str) -> Result<Box<dyn FrameStream>> {
        Ok(Box::new(FfmpegStream::open(handle)?))
    }

    fn name(&self) -> &str {
        "ffmpeg"
    }
}

struct FfmpegStream {
    handle: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::decoder::Video,
    scaler: Scaler,
    decoded: ffmpeg::frame::Video,
    rgb: ffmpeg::frame::Video,
    flushed: bool,
}

impl FfmpegStream {
    fn open(handle: &str) -> Result<Self> {
        let input =
            ffmpeg::format::input(&handle).map_err(|e| Error::Open(format!("{handle}: {e}")))?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| Error::Open(format!("{handle}: no video stream")))?;
        let stream_index = stream.index();

        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| Error::Open(format!("{handle}: decoder parameters: {e}")))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| Error::Open(format!("{handle}: open decoder: {e}")))?;

        let scaler = Scaler::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ScalerFlags::BILINEAR,
        )
        .map_err(|e| Error::FFmpeg(format!("Failed to create scaler: {e}")))?;

        tracing::debug!(
            handle,
            width = decoder.width(),
            height = decoder.height(),
            "opened video"
        );

        Ok(Self {
            handle: handle.to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            decoded: ffmpeg::frame::Video::empty(),
            rgb: ffmpeg::frame::Video::empty(),
            flushed: false,
        })
    }

    fn convert(&mut self) -> Result<Frame> {
        self.scaler
            .run(&self.decoded, &mut self.rgb)
            .map_err(|e| Error::Decode(format!("{}: scaling failed: {e}", self.handle)))?;

        let width = self.rgb.width();
        let height = self.rgb.height();
        let row_bytes = width as usize * CHANNELS;
        let stride = self.rgb.stride(0);
        let plane = self.rgb.data(0);

        if stride == row_bytes {
            return Frame::from_data(plane[..row_bytes * height as usize].to_vec(), width, height);
        }

        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            let line = plane.get(start..start + row_bytes).ok_or_else(|| {
                Error::Decode(format!("{}: frame row {row} out of bounds", self.handle))
            })?;
            pixels.extend_from_slice(line);
        }
        Frame::from_data(pixels, width, height)
    }
}

/// What a `receive_frame` call means for the decode loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Receive {
    Frame,
    NeedInput,
    Drained,
}

fn classify_receive(
    result: std::result::Result<(), ffmpeg::Error>,
    handle: &str,
) -> Result<Receive> {
    match result {
        Ok(()) => Ok(Receive::Frame),
        Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
            Ok(Receive::NeedInput)
        }
        Err(ffmpeg::Error::Eof) => Ok(Receive::Drained),
        Err(e) => Err(Error::Decode(format!("{handle}: {e}"))),
    }
}

impl FrameStream for FfmpegStream {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            let received = self.decoder.receive_frame(&mut self.decoded);
            match classify_receive(received, &self.handle)? {
                Receive::Frame => return self.convert().map(Some),
                Receive::Drained => return Ok(None),
                Receive::NeedInput if self.flushed => return Ok(None),
                Receive::NeedInput => {}
            }

            let next = self
                .input
                .packets()
                .next()
                .map(|(stream, packet)| (stream.index(), packet));
            match next {
                Some((index, packet)) if index == self.stream_index => {
                    self.decoder
                        .send_packet(&packet)
                        .map_err(|e| Error::Decode(format!("{}: {e}", self.handle)))?;
                }
                Some(_) => continue,
                None => {
                    self.decoder
                        .send_eof()
                        .map_err(|e| Error::Decode(format!("{}: {e}", self.handle)))?;
                    self.flushed = true;
                }
            }
        }
    }
}
