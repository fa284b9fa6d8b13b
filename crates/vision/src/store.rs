//! Single-slot holder for the latest frame and detection summary.
//!
//! Every reader and writer goes through one mutex. Critical sections only
//! clone or swap reference-counted bytes and the summary; detection never runs
//! while the lock is held.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::data::{DetectionSummary, FramePacket};

#[derive(Default)]
struct StoreState {
    frame: Option<FramePacket>,
    summary: DetectionSummary,
}

#[derive(Default)]
pub struct FrameStore {
    state: Mutex<StoreState>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace frame and summary together.
    pub fn publish(&self, frame: FramePacket, summary: DetectionSummary) {
        let mut guard = self.lock();
        guard.frame = Some(frame);
        guard.summary = summary;
    }

    pub fn latest_frame(&self) -> Option<FramePacket> {
        self.lock().frame.clone()
    }

    pub fn latest_summary(&self) -> DetectionSummary {
        self.lock().summary.clone()
    }

    /// Frame and summary read under one lock acquisition.
    pub fn snapshot(&self) -> (Option<FramePacket>, DetectionSummary) {
        let guard = self.lock();
        (guard.frame.clone(), guard.summary.clone())
    }

    /// Out-of-band summary write; the frame slot is left untouched.
    pub fn replace_summary(&self, summary: DetectionSummary) {
        self.lock().summary = summary;
    }

    // A panic while holding the lock cannot leave a half-written slot: every
    // write is a plain field assignment, so recovering the guard is sound.
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
