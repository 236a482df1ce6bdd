//! Alarm slot and handler seam.
//!
//! An instance holds at most one scheduled alarm. `set` replaces any
//! prior alarm; the host reads the slot to know when to invoke the
//! instance's [`AlarmHandler`]. The default handler fails with an
//! explicit not-implemented error so an instance that never wired one
//! up is detectable instead of silently ignoring its alarms.

use std::sync::Arc;

use crate::error::{CellStoreError, Result};
use crate::storage::KvStore;
use crate::types::Timestamp;

const ALARM_KEY: &str = "alarm:at";

/// KV-backed single alarm slot.
pub struct AlarmSlot {
    kv: Arc<dyn KvStore>,
}

impl std::fmt::Debug for AlarmSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmSlot").finish_non_exhaustive()
    }
}

impl AlarmSlot {
    /// Creates a slot over the instance's KV store.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Schedules an alarm, replacing any prior one.
    pub fn set(&self, at: Timestamp) -> Result<()> {
        self.kv.put(ALARM_KEY, &at.to_be_bytes())
    }

    /// The scheduled alarm time, if any.
    pub fn get(&self) -> Result<Option<Timestamp>> {
        let Some(raw) = self.kv.get(ALARM_KEY)? else {
            return Ok(None);
        };
        let bytes: [u8; 8] = raw
            .as_slice()
            .try_into()
            .map_err(|_| crate::error::StorageError::corrupted("alarm slot bytes"))?;
        Ok(Some(Timestamp::from_millis(i64::from_be_bytes(bytes))))
    }

    /// Clears the slot. Returns `false` if no alarm was set.
    pub fn delete(&self) -> Result<bool> {
        self.kv.delete(ALARM_KEY)
    }
}

/// The instance-side alarm callback.
///
/// The default implementation is a detectable placeholder; hosts that
/// schedule alarms must override it.
pub trait AlarmHandler {
    /// Invoked by the host when the scheduled time arrives.
    fn alarm(&self) -> Result<()> {
        Err(CellStoreError::not_implemented("alarm"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;

    fn slot() -> AlarmSlot {
        AlarmSlot::new(Arc::new(MemoryKv::new()))
    }

    #[test]
    fn test_set_get_roundtrip() {
        let alarm = slot();
        assert!(alarm.get().unwrap().is_none());
        alarm.set(Timestamp::from_millis(12_345)).unwrap();
        assert_eq!(alarm.get().unwrap(), Some(Timestamp::from_millis(12_345)));
    }

    #[test]
    fn test_set_replaces() {
        let alarm = slot();
        alarm.set(Timestamp::from_millis(1)).unwrap();
        alarm.set(Timestamp::from_millis(2)).unwrap();
        assert_eq!(alarm.get().unwrap(), Some(Timestamp::from_millis(2)));
    }

    #[test]
    fn test_delete() {
        let alarm = slot();
        alarm.set(Timestamp::from_millis(1)).unwrap();
        assert!(alarm.delete().unwrap());
        assert!(alarm.get().unwrap().is_none());
        assert!(!alarm.delete().unwrap());
    }

    #[test]
    fn test_default_handler_not_implemented() {
        struct Bare;
        impl AlarmHandler for Bare {}

        let err = Bare.alarm().unwrap_err();
        assert_eq!(err.to_string(), "Not implemented: alarm");
    }
}
