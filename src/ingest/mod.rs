//! Frame ingestion sources.
//!
//! One [`FrameSource`] wraps one decodable media handle (local video file or
//! network stream) and produces RGB24 frames at the source's native rate.
//! The ingestion layer is responsible for:
//! - Opening the decoder up front so registration fails fast on bad media
//! - Pacing reads to the reported frame rate (default 30 fps when unreported)
//! - Looping finite sources on end-of-stream and flagging the loop boundary
//! - Treating end-of-stream or decode failure on a live source as terminal
//!
//! It MUST NOT:
//! - Buffer frames (handoff to the frame buffer is immediate)
//! - Auto-reconnect a failed live source
//!
//! `stub://` locations select the synthetic backend (tests, default builds);
//! anything else requires the `ingest-ffmpeg` feature.

mod synthetic;

#[cfg(feature = "ingest-ffmpeg")]
pub(crate) mod ffmpeg;

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::frame::Frame;
use synthetic::SyntheticDecoder;

#[cfg(feature = "ingest-ffmpeg")]
use ffmpeg::FfmpegDecoder;

/// Assumed rate when the container does not report one.
pub const DEFAULT_FPS: f64 = 30.0;

/// Wait between retries when a finite source hits end-of-stream but cannot
/// produce the first frame of the next pass yet.
const EOS_RETRY_POLL: Duration = Duration::from_millis(10);

/// File extensions accepted for file sources.
pub const ALLOWED_VIDEO_EXTENSIONS: [&str; 5] = ["mp4", "mov", "avi", "wmv", "webm"];

/// Whether a file location carries an accepted video extension.
pub fn has_allowed_extension(path: &str) -> bool {
    std::path::Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            ALLOWED_VIDEO_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// What kind of media a source wraps. Files loop forever; streams are live
/// and die on their first decode failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Stream,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::File => write!(f, "file"),
            SourceKind::Stream => write!(f, "stream"),
        }
    }
}

/// A decoded frame plus whether it is the first of a fresh playback loop.
pub struct SourceFrame {
    pub frame: Frame,
    pub loop_restarted: bool,
}

/// One RGB24 pixel buffer straight out of a decoder backend.
pub(crate) struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

enum DecodeBackend {
    Synthetic(SyntheticDecoder),
    #[cfg(feature = "ingest-ffmpeg")]
    Ffmpeg(FfmpegDecoder),
}

impl DecodeBackend {
    fn read_frame(&mut self) -> Result<Option<DecodedFrame>> {
        match self {
            DecodeBackend::Synthetic(decoder) => decoder.read_frame(),
            #[cfg(feature = "ingest-ffmpeg")]
            DecodeBackend::Ffmpeg(decoder) => decoder.read_frame(),
        }
    }

    fn rewind(&mut self) -> Result<()> {
        match self {
            DecodeBackend::Synthetic(decoder) => decoder.rewind(),
            #[cfg(feature = "ingest-ffmpeg")]
            DecodeBackend::Ffmpeg(decoder) => decoder.rewind(),
        }
    }

    fn frame_rate(&self) -> f64 {
        match self {
            DecodeBackend::Synthetic(decoder) => decoder.frame_rate(),
            #[cfg(feature = "ingest-ffmpeg")]
            DecodeBackend::Ffmpeg(decoder) => decoder.frame_rate(),
        }
    }
}

/// Pull-based frame producer over one media handle.
pub struct FrameSource {
    kind: SourceKind,
    location: String,
    backend: DecodeBackend,
    pacer: FramePacer,
    fps: f64,
    frames_read: u64,
}

impl FrameSource {
    /// Open the decoder for `location`. Fails on a bad path, an unreachable
    /// stream, or an unsupported codec; callers register the source only
    /// after this succeeds.
    pub fn open(kind: SourceKind, location: &str) -> Result<Self> {
        let location = location.trim();
        if location.is_empty() {
            bail!("source location is empty");
        }

        let backend = if location.starts_with("stub://") {
            DecodeBackend::Synthetic(
                SyntheticDecoder::parse(location)
                    .with_context(|| format!("failed to open synthetic source '{location}'"))?,
            )
        } else {
            match kind {
                SourceKind::File if location.contains("://") => {
                    bail!("file sources take local paths, not URLs");
                }
                SourceKind::Stream if !location.contains("://") => {
                    bail!("stream sources take URLs (rtsp://, http://, ...)");
                }
                _ => {}
            }
            #[cfg(feature = "ingest-ffmpeg")]
            {
                DecodeBackend::Ffmpeg(FfmpegDecoder::open(location)?)
            }
            #[cfg(not(feature = "ingest-ffmpeg"))]
            {
                bail!("decoding '{location}' requires the ingest-ffmpeg feature");
            }
        };

        let reported = backend.frame_rate();
        let fps = if reported.is_finite() && reported > 0.0 {
            reported
        } else {
            DEFAULT_FPS
        };

        log::info!("FrameSource: opened {kind} '{location}' at {fps:.1} fps");

        Ok(Self {
            kind,
            location: location.to_string(),
            backend,
            pacer: FramePacer::new(fps),
            fps,
            frames_read: 0,
        })
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Produce the next frame at the paced rate.
    ///
    /// File sources rewind on end-of-stream and keep producing; the first
    /// frame after a rewind is flagged `loop_restarted`. A live source
    /// returns an error on end-of-stream or decode failure and must not be
    /// read again.
    pub fn read_next(&mut self) -> Result<SourceFrame> {
        let mut loop_restarted = false;

        loop {
            let decoded = match self.backend.read_frame() {
                Ok(decoded) => decoded,
                // a finite source's decode failure is just an early end
                Err(err) if self.kind == SourceKind::File => {
                    log::debug!("FrameSource '{}': read failed ({err:#}), looping", self.location);
                    None
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("stream '{}' failed", self.location));
                }
            };

            match decoded {
                Some(decoded) => {
                    self.pacer.pace();
                    let frame = Frame::new(
                        self.frames_read,
                        decoded.width,
                        decoded.height,
                        decoded.data,
                    );
                    self.frames_read += 1;
                    return Ok(SourceFrame {
                        frame,
                        loop_restarted,
                    });
                }
                None if self.kind == SourceKind::File => {
                    if let Err(err) = self.backend.rewind() {
                        log::debug!(
                            "FrameSource '{}': rewind failed ({err:#}), retrying",
                            self.location
                        );
                        thread::sleep(EOS_RETRY_POLL);
                        continue;
                    }
                    loop_restarted = true;
                }
                None => bail!("stream '{}' ended", self.location),
            }
        }
    }
}

/// Spreads reads out to the target rate, sleeping only the part of the
/// inter-frame delay not already spent decoding. Never sleeps a negative
/// remainder.
struct FramePacer {
    frame_delay: Duration,
    last_frame_at: Option<Instant>,
}

impl FramePacer {
    fn new(fps: f64) -> Self {
        let fps = if fps.is_finite() && fps > 0.0 {
            fps
        } else {
            DEFAULT_FPS
        };
        Self {
            frame_delay: Duration::from_secs_f64(1.0 / fps),
            last_frame_at: None,
        }
    }

    fn pace(&mut self) {
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < self.frame_delay {
                thread::sleep(self.frame_delay - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }
}
