//! Deferred fault signalling between the notification context and the
//! control thread.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::PlantError;

/// One-way latch recording the first emergency-stop reason.
///
/// Tripped from edge callbacks, checked at the top of every control-loop
/// call. There is no reset.
#[derive(Debug, Default)]
pub struct FaultLatch {
    tripped: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl FaultLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch with `reason`. Returns true for the first trip only.
    pub fn trip(&self, reason: &str) -> bool {
        // Reason first, then the flag (Release) so readers that see the flag see the reason.
        if let Ok(mut slot) = self.reason.lock()
            && slot.is_none()
        {
            *slot = Some(reason.to_string());
        }
        !self.tripped.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().ok().and_then(|r| r.clone())
    }

    pub(crate) fn flag(&self) -> &AtomicBool {
        &self.tripped
    }

    /// `Err(EmergencyStop)` once tripped.
    pub fn check(&self) -> Result<(), PlantError> {
        if self.is_tripped() {
            return Err(PlantError::EmergencyStop(
                self.reason().unwrap_or_else(|| "unknown".to_string()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reason_wins() {
        let latch = FaultLatch::new();
        assert!(latch.check().is_ok());
        assert!(latch.trip("left switch hit"));
        assert!(!latch.trip("right switch hit"));
        assert_eq!(
            latch.check(),
            Err(PlantError::EmergencyStop("left switch hit".into()))
        );
    }
}
