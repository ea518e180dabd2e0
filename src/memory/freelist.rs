//! Free frame stack.
//!
//! Free frames are tracked by number in a stack sized once at boot, so a
//! free frame's own bytes are never reinterpreted as list links.

use alloc::vec::Vec;

use super::FrameNumber;

/// LIFO stack of free frames. The most recently freed frame is reused first.
pub struct FreeList {
    frames: Vec<FrameNumber>,
}

impl FreeList {
    /// Create an empty list able to hold `capacity` frames without reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        FreeList {
            frames: Vec::with_capacity(capacity),
        }
    }

    /// Push a free frame.
    pub fn push(&mut self, frame: FrameNumber) {
        debug_assert!(
            self.frames.len() < self.frames.capacity(),
            "free list overflow at {}",
            frame
        );
        self.frames.push(frame);
    }

    /// Pop the most recently freed frame.
    pub fn pop(&mut self) -> Option<FrameNumber> {
        self.frames.pop()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Linear scan; diagnostics only.
    pub fn contains(&self, frame: FrameNumber) -> bool {
        self.frames.contains(&frame)
    }
}
