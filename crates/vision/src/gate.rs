//! Drop-when-busy admission control in front of the detector.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Held while one frame is inside the detector. Dropping it reopens the gate.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    sequence: u64,
}

impl AdmissionPermit {
    /// 1-based index of this frame among admitted frames.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Single-permit, non-blocking gate. A frame that arrives while another is
/// being processed is rejected, never queued.
#[derive(Debug)]
pub struct IngestionGate {
    permits: Arc<Semaphore>,
    arrivals: AtomicU64,
    admitted: AtomicU64,
}

impl Default for IngestionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestionGate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
            arrivals: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
        }
    }

    /// Count the arrival and try to take the permit without waiting.
    pub fn admit(&self) -> Option<AdmissionPermit> {
        self.arrivals.fetch_add(1, Ordering::Relaxed);
        let permit = self.permits.clone().try_acquire_owned().ok()?;
        let sequence = self.admitted.fetch_add(1, Ordering::Relaxed) + 1;
        Some(AdmissionPermit {
            _permit: permit,
            sequence,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.permits.available_permits() == 0
    }

    pub fn arrivals(&self) -> u64 {
        self.arrivals.load(Ordering::Relaxed)
    }

    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.arrivals().saturating_sub(self.admitted())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;

    #[test]
    fn second_frame_is_rejected_while_first_is_in_flight() {
        let gate = IngestionGate::new();
        let first = gate.admit().expect("first frame admitted");
        assert!(gate.is_busy());
        assert!(gate.admit().is_none());
        drop(first);
        let third = gate.admit().expect("gate reopened");
        assert_eq!(third.sequence(), 2);
        assert_eq!(gate.arrivals(), 3);
        assert_eq!(gate.admitted(), 2);
        assert_eq!(gate.skipped(), 1);
    }

    #[test]
    fn racing_producers_admit_exactly_one() {
        let gate = Arc::new(IngestionGate::new());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    gate.admit()
                })
            })
            .collect();
        let permits: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(permits.len(), 1);
        assert_eq!(gate.skipped(), 7);
    }
}
