//! Synthetic decoder for `stub://` locations.
//!
//! Generates deterministic RGB frames without touching real media, so the
//! pipeline runs in default builds and tests. Behavior is steered through
//! query parameters:
//!
//! - `frames=N`: finite source, end-of-stream after N frames (file looping)
//! - `fps=F`: reported frame rate (default 30)
//! - `fail_after=N`: decoder error after N frames (live failure paths)
//! - `width=W` / `height=H`: frame geometry (default 320x240)

use anyhow::{bail, Context, Result};

use super::DecodedFrame;

pub(crate) struct SyntheticDecoder {
    width: u32,
    height: u32,
    fps: f64,
    frames_per_loop: Option<u64>,
    fail_after: Option<u64>,
    position: u64,
    total_reads: u64,
    scene_state: u8,
}

impl SyntheticDecoder {
    pub(crate) fn parse(location: &str) -> Result<Self> {
        let mut width = 320u32;
        let mut height = 240u32;
        let mut fps = 30.0f64;
        let mut frames_per_loop = None;
        let mut fail_after = None;

        if let Some((_, query)) = location.split_once('?') {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .with_context(|| format!("stub parameter '{pair}' is not key=value"))?;
                match key {
                    "frames" => {
                        frames_per_loop = Some(
                            value
                                .parse::<u64>()
                                .with_context(|| format!("bad frames value '{value}'"))?,
                        )
                    }
                    "fail_after" => {
                        fail_after = Some(
                            value
                                .parse::<u64>()
                                .with_context(|| format!("bad fail_after value '{value}'"))?,
                        )
                    }
                    "fps" => {
                        fps = value
                            .parse::<f64>()
                            .with_context(|| format!("bad fps value '{value}'"))?
                    }
                    "width" => {
                        width = value
                            .parse::<u32>()
                            .with_context(|| format!("bad width value '{value}'"))?
                    }
                    "height" => {
                        height = value
                            .parse::<u32>()
                            .with_context(|| format!("bad height value '{value}'"))?
                    }
                    other => bail!("unknown stub parameter '{other}'"),
                }
            }
        }

        if width == 0 || height == 0 {
            bail!("stub frame geometry must be non-zero");
        }
        if frames_per_loop == Some(0) {
            bail!("stub frames must be >= 1");
        }

        Ok(Self {
            width,
            height,
            fps,
            frames_per_loop,
            fail_after,
            position: 0,
            total_reads: 0,
            scene_state: 0,
        })
    }

    pub(crate) fn read_frame(&mut self) -> Result<Option<DecodedFrame>> {
        if let Some(limit) = self.fail_after {
            if self.total_reads >= limit {
                bail!("synthetic decoder failed after {limit} frames as scripted");
            }
        }
        if let Some(per_loop) = self.frames_per_loop {
            if self.position >= per_loop {
                return Ok(None);
            }
        }

        self.position += 1;
        self.total_reads += 1;
        if self.total_reads % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        Ok(Some(DecodedFrame {
            width: self.width,
            height: self.height,
            data: self.generate_pixels(),
        }))
    }

    pub(crate) fn rewind(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    pub(crate) fn frame_rate(&self) -> f64 {
        self.fps
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let len = self.width as usize * self.height as usize * 3;
        let mut pixels = vec![0u8; len];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.total_reads + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}
