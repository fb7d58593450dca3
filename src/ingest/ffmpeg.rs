//! FFmpeg decoder backend for real media (files and network streams).
//!
//! Frames are decoded and scaled to RGB24 in-memory. Seeking back to the
//! start is supported for finite inputs; live inputs simply fail the seek
//! and surface end-of-stream, which the source layer treats as terminal.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::DecodedFrame;

pub(crate) struct FfmpegDecoder {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    fps: f64,
    flushed: bool,
}

impl FfmpegDecoder {
    pub(crate) fn open(location: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;

        let input = ffmpeg::format::input(&location)
            .with_context(|| format!("failed to open '{location}' with ffmpeg"))?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("'{location}' has no video track"))?;
        let stream_index = stream.index();

        let rate = stream.avg_frame_rate();
        let fps = if rate.denominator() != 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            0.0
        };

        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler,
            fps,
            flushed: false,
        })
    }

    pub(crate) fn read_frame(&mut self) -> Result<Option<DecodedFrame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb = ffmpeg::frame::Video::empty();

        if self.decoder.receive_frame(&mut decoded).is_ok() {
            self.scaler
                .run(&decoded, &mut rgb)
                .context("scale frame to RGB")?;
            return rgb_frame_data(&rgb).map(Some);
        }

        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            self.decoder
                .send_packet(&packet)
                .context("send packet to ffmpeg decoder")?;
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                self.scaler
                    .run(&decoded, &mut rgb)
                    .context("scale frame to RGB")?;
                return rgb_frame_data(&rgb).map(Some);
            }
        }

        if !self.flushed {
            // drain frames the decoder still holds past the last packet
            let _ = self.decoder.send_eof();
            self.flushed = true;
        }
        if self.decoder.receive_frame(&mut decoded).is_ok() {
            self.scaler
                .run(&decoded, &mut rgb)
                .context("scale frame to RGB")?;
            return rgb_frame_data(&rgb).map(Some);
        }

        Ok(None)
    }

    pub(crate) fn rewind(&mut self) -> Result<()> {
        self.input.seek(0, ..).context("seek to start of input")?;
        self.decoder.flush();
        self.flushed = false;
        Ok(())
    }

    pub(crate) fn frame_rate(&self) -> f64 {
        self.fps
    }
}

fn rgb_frame_data(frame: &ffmpeg::frame::Video) -> Result<DecodedFrame> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = width as usize * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let pixels = if stride == row_bytes {
        data.to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            let end = start + row_bytes;
            pixels.extend_from_slice(
                data.get(start..end)
                    .context("ffmpeg frame row is out of bounds")?,
            );
        }
        pixels
    };

    Ok(DecodedFrame {
        width,
        height,
        data: pixels,
    })
}
