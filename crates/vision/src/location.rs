use std::sync::{Mutex, PoisonError};

use crate::data::Location;

/// Last position reported by the device.
#[derive(Default)]
pub struct LocationBook {
    last: Mutex<Option<Location>>,
}

impl LocationBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, location: Location) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(location);
    }

    pub fn last(&self) -> Option<Location> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
