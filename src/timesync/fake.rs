//! Test provider translating timestamps with a fixed clock offset.

use std::sync::{Arc, Mutex};

use super::{TimeSyncError, TimeSyncEvent, TimeSyncPrecision, TimeSyncProvider};

/// A [TimeSyncProvider] whose remote domain is the local domain shifted by a
/// constant offset, encoded as little-endian u64 bytes.
#[derive(Debug)]
pub struct FakeProvider {
    offset: u64,
    active: Mutex<bool>,
}

impl FakeProvider {
    pub fn new(offset: u64) -> Arc<Self> {
        Arc::new(Self {
            offset,
            active: Mutex::new(true),
        })
    }

    pub fn set_active(&self, active: bool) {
        *self.active.lock().unwrap() = active;
    }
}

impl TimeSyncProvider for FakeProvider {
    fn current_state(&self) -> (TimeSyncEvent, TimeSyncPrecision) {
        if *self.active.lock().unwrap() {
            (TimeSyncEvent::Active, TimeSyncPrecision::High)
        } else {
            (TimeSyncEvent::Inactive, TimeSyncPrecision::Unknown)
        }
    }

    fn to_synced_time(&self, data: &[u8]) -> Result<u64, TimeSyncError> {
        let bytes: [u8; 8] = data
            .try_into()
            .map_err(|_| TimeSyncError::Rejected(format!("bad timestamp length: {}", data.len())))?;
        Ok(u64::from_le_bytes(bytes).wrapping_add(self.offset))
    }

    fn to_time_data(&self, synced_time: u64) -> Result<Vec<u8>, TimeSyncError> {
        Ok(synced_time.wrapping_sub(self.offset).to_le_bytes().to_vec())
    }
}
