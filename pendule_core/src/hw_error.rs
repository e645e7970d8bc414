//! Maps `Box<dyn Error>` from the GPIO trait boundary to typed `PlantError`.
//!
//! `pendule_traits::Gpio` returns boxed errors so backends stay independent;
//! this module converts them to our typed error enum, with an optional
//! feature-gated path for `pendule_hardware::HwError` downcasting.

use crate::error::PlantError;

/// Map a trait-boundary error to a typed `PlantError`.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> PlantError {
    #[cfg(feature = "hardware-errors")]
    {
        use pendule_hardware::HwError;
        if let Some(hw) = e.downcast_ref::<HwError>() {
            return match hw {
                HwError::UnknownPin(_) | HwError::WrongMode { .. } => {
                    PlantError::Config(hw.to_string())
                }
                other => PlantError::Hardware(other.to_string()),
            };
        }
    }

    PlantError::Hardware(e.to_string())
}

/// Wrap a GPIO failure into the crate's error report.
pub(crate) fn hw(e: Box<dyn std::error::Error + Send + Sync>) -> eyre::Report {
    eyre::Report::new(map_hw_error(e.as_ref()))
}
