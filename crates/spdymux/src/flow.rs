//! Flow-control window arithmetic shared by streams and sessions.

pub(crate) const MAX_WINDOW_SIZE: i64 = i32::MAX as i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("window overflow: {size} + {delta} exceeds 2^31-1")]
pub(crate) struct WindowOverflow {
    pub(crate) size: i32,
    pub(crate) delta: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("window underflow: received {len} bytes with {size} bytes of window")]
pub(crate) struct WindowUnderflow {
    pub(crate) size: i32,
    pub(crate) len: u32,
}

/// How many bytes we may still send to the peer.
///
/// Signed: a shrinking INITIAL_WINDOW_SIZE can push it below zero while data
/// is already in flight, and later WINDOW_UPDATEs bring it back up.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SendWindow {
    size: i32,
}

impl SendWindow {
    pub(crate) fn new(initial: u32) -> Self {
        Self {
            size: initial.min(i32::MAX as u32) as i32,
        }
    }

    pub(crate) fn size(&self) -> i32 {
        self.size
    }

    /// Bytes that can be sent right now
    pub(crate) fn available(&self) -> usize {
        self.size.max(0) as usize
    }

    pub(crate) fn is_stalled(&self) -> bool {
        self.size <= 0
    }

    /// Credit from a WINDOW_UPDATE
    pub(crate) fn increase(&mut self, delta: u32) -> Result<(), WindowOverflow> {
        self.adjust(delta as i64)
    }

    /// Debit for a DATA frame we are about to write
    pub(crate) fn decrease(&mut self, len: usize) {
        debug_assert!(
            len as i64 <= self.size as i64,
            "writing {len} bytes with a send window of {}",
            self.size
        );
        self.size = (self.size as i64 - len as i64).max(i32::MIN as i64) as i32;
    }

    /// Signed correction, e.g. the delta between an old and a new
    /// INITIAL_WINDOW_SIZE. May leave the window negative.
    pub(crate) fn adjust(&mut self, delta: i64) -> Result<(), WindowOverflow> {
        let next = self.size as i64 + delta;
        if next > MAX_WINDOW_SIZE {
            return Err(WindowOverflow {
                size: self.size,
                delta,
            });
        }
        self.size = next.max(i32::MIN as i64) as i32;
        Ok(())
    }
}

/// How many bytes the peer may still send us, plus the credit we owe it.
///
/// Credit is only returned once the receiving side has consumed the data,
/// and is batched until more than half of the window is owed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecvWindow {
    size: i32,
    max_size: i32,
    unacked: i32,
}

impl RecvWindow {
    pub(crate) fn new(initial: u32) -> Self {
        let initial = initial.min(i32::MAX as u32) as i32;
        Self {
            size: initial,
            max_size: initial,
            unacked: 0,
        }
    }

    pub(crate) fn size(&self) -> i32 {
        self.size
    }

    /// Debit for a received DATA frame. Fails if the peer overran the window;
    /// the window is left untouched in that case.
    pub(crate) fn decrease(&mut self, len: u32) -> Result<(), WindowUnderflow> {
        if len as i64 > self.size as i64 {
            return Err(WindowUnderflow {
                size: self.size,
                len,
            });
        }
        self.size -= len as i32;
        Ok(())
    }

    /// Credit for consumed bytes. Returns the WINDOW_UPDATE increment to send
    /// once the owed credit crosses half of the window.
    pub(crate) fn increase(&mut self, delta: u32) -> Option<u32> {
        if delta == 0 {
            return None;
        }
        let delta = delta.min(i32::MAX as u32) as i32;
        self.size = self.size.saturating_add(delta);
        self.unacked = self.unacked.saturating_add(delta);

        if self.unacked > self.max_size / 2 {
            let update = self.unacked as u32;
            self.unacked = 0;
            Some(update)
        } else {
            None
        }
    }

    /// Grows the window to `target`, returning the increment to announce.
    pub(crate) fn grow_to(&mut self, target: u32) -> Option<u32> {
        let target = target.min(i32::MAX as u32) as i32;
        if target <= self.max_size {
            return None;
        }
        let delta = target - self.max_size;
        self.max_size = target;
        self.size = self.size.saturating_add(delta);
        Some(delta as u32)
    }
}
