//! Process-wide GPIO activation.
//!
//! At most one `ActivationToken` exists at a time. While it is alive the
//! backend is registered with a panic hook so a crashing control loop still
//! leaves every user pin floating; dropping the token does the same.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use pendule_traits::Gpio;

use crate::error::{HwError, Result};

pub use pendule_traits::MAX_USER_PIN;

static ACTIVE: AtomicBool = AtomicBool::new(false);
static REGISTERED: Mutex<Option<Arc<dyn Gpio>>> = Mutex::new(None);
static PANIC_HOOK: OnceLock<()> = OnceLock::new();

pub struct ActivationToken {
    gpio: Arc<dyn Gpio>,
}

impl ActivationToken {
    /// Activate `gpio` for this process. Fails with `HwError::TokenInUse`
    /// while another token is alive.
    pub fn acquire(gpio: Arc<dyn Gpio>) -> Result<Self> {
        if ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HwError::TokenInUse);
        }
        if let Ok(mut slot) = REGISTERED.lock() {
            *slot = Some(Arc::clone(&gpio));
        }
        install_panic_hook();
        tracing::debug!("gpio activation token acquired");
        Ok(Self { gpio })
    }

    /// Backend handle to pass to the components built under this token.
    pub fn gpio(&self) -> Arc<dyn Gpio> {
        Arc::clone(&self.gpio)
    }

    pub fn is_active() -> bool {
        ACTIVE.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ActivationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationToken").finish_non_exhaustive()
    }
}

impl Drop for ActivationToken {
    fn drop(&mut self) {
        let failures = reset_pins(self.gpio.as_ref());
        if let Ok(mut slot) = REGISTERED.lock() {
            *slot = None;
        }
        ACTIVE.store(false, Ordering::Release);
        tracing::debug!(failures, "gpio activation token released");
    }
}

/// Float every user pin. Returns the number of pins that could not be released.
pub fn reset_pins(gpio: &dyn Gpio) -> usize {
    let mut failures = 0;
    for pin in 0..=MAX_USER_PIN {
        if let Err(e) = gpio.release(pin) {
            failures += 1;
            tracing::warn!(pin, error = %e, "failed to release pin");
        }
    }
    failures
}

/// Float every pin of the backend registered by the live token, if any.
///
/// For paths that leave the process without unwinding (a forced exit on a
/// second interrupt, the panic hook). The motor pins go floating, so the
/// driver sees no duty. Returns `None` when no token is alive or the
/// registration is busy.
pub fn release_registered() -> Option<usize> {
    // try_lock: the caller may have interrupted a thread holding the slot.
    let slot = REGISTERED.try_lock().ok()?;
    let gpio = slot.as_ref()?;
    Some(reset_pins(gpio.as_ref()))
}

fn install_panic_hook() {
    PANIC_HOOK.get_or_init(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            release_registered();
            previous(info);
        }));
    });
}
