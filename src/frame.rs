//! Bounded frame storage shared between one producer and independent cursors.
//!
//! This module is responsible for:
//! - Retaining the most recent frames of one source in a fixed-size window
//! - Answering cursor reads by absolute capture index with frame copies
//! - Clamping or fast-forwarding lagging cursors instead of failing them
//!
//! It MUST NOT:
//! - Hand out references into the ring (readers always receive copies)
//! - Block a reader on the producer (reads are answered from retained data)

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Frames retained per source before the window slides.
pub const BUFFER_CAPACITY: usize = 60;

/// How far a cursor may trail the oldest retained frame before it is
/// fast-forwarded instead of clamped.
pub const CURSOR_SLACK: u64 = 30;

/// Distance behind the newest frame a fast-forwarded cursor lands at.
pub const FAST_FORWARD_GAP: u64 = 10;

/// One decoded RGB24 frame. `index` is the absolute capture position within
/// its source and keeps increasing across playback loops.
#[derive(Clone)]
pub struct Frame {
    pub index: u64,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(index: u64, width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize * 3);
        Self {
            index,
            width,
            height,
            data,
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Outcome of a cursor read against the retained window.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A frame copy plus the cursor position for the following read.
    /// `skipped` counts frames the cursor jumped over (0 when keeping up).
    Frame {
        frame: Frame,
        next_cursor: u64,
        skipped: u64,
    },
    /// The cursor is past the newest frame; nothing new has been pushed yet.
    NotReady,
}

/// Bounded FIFO window over one source's recent frames.
///
/// Absolute indices keep increasing as old frames are evicted, so a cursor
/// position is never assumed valid; `read_at` clamps it into the window.
pub struct FrameBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_capacity(BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append a frame, evicting from the front once the window is full.
    pub fn push(&mut self, frame: Frame) {
        debug_assert!(
            self.frames.back().map_or(true, |f| frame.index > f.index),
            "frame indices must be strictly increasing"
        );
        self.frames.push_back(frame);
        while self.frames.len() > self.capacity {
            self.frames.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn oldest_index(&self) -> Option<u64> {
        self.frames.front().map(|f| f.index)
    }

    pub fn newest_index(&self) -> Option<u64> {
        self.frames.back().map(|f| f.index)
    }

    /// Copy of the newest retained frame.
    pub fn latest(&self) -> Option<Frame> {
        self.frames.back().cloned()
    }

    /// Read the frame at `cursor`, clamping the position into the retained
    /// window. A cursor more than [`CURSOR_SLACK`] behind the oldest retained
    /// frame is fast-forwarded to `newest - FAST_FORWARD_GAP` so a stalled
    /// consumer resumes near live instead of replaying backlog.
    pub fn read_at(&self, cursor: u64) -> ReadOutcome {
        let (oldest, newest) = match (self.frames.front(), self.frames.back()) {
            (Some(front), Some(back)) => (front.index, back.index),
            _ => return ReadOutcome::NotReady,
        };

        if cursor > newest {
            return ReadOutcome::NotReady;
        }

        let position = if cursor >= oldest {
            cursor
        } else if oldest - cursor <= CURSOR_SLACK {
            oldest
        } else {
            newest.saturating_sub(FAST_FORWARD_GAP).max(oldest)
        };

        let offset = (position - oldest) as usize;
        let frame = self.frames[offset].clone();
        ReadOutcome::Frame {
            frame,
            next_cursor: position + 1,
            skipped: position - cursor,
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable, lock-protected handle to a [`FrameBuffer`]. One producer pushes,
/// any number of cursors read copies; nobody holds the lock across a wait.
#[derive(Clone)]
pub struct SharedFrameBuffer {
    inner: Arc<Mutex<FrameBuffer>>,
}

impl SharedFrameBuffer {
    pub fn new() -> Self {
        Self::with_capacity(BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FrameBuffer::with_capacity(capacity))),
        }
    }

    // Buffer operations cannot panic while holding the lock, so a poisoned
    // mutex still guards consistent data and is safe to enter.
    fn locked(&self) -> std::sync::MutexGuard<'_, FrameBuffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, frame: Frame) {
        self.locked().push(frame);
    }

    pub fn read_at(&self, cursor: u64) -> ReadOutcome {
        self.locked().read_at(cursor)
    }

    pub fn latest(&self) -> Option<Frame> {
        self.locked().latest()
    }

    pub fn newest_index(&self) -> Option<u64> {
        self.locked().newest_index()
    }

    pub fn len(&self) -> usize {
        self.locked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locked().is_empty()
    }
}

impl Default for SharedFrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
