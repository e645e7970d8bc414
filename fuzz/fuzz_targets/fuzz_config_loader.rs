#![no_main]
use libfuzzer_sys::fuzz_target;

// Arbitrary TOML must parse or fail cleanly; a parsed config must validate
// or fail cleanly, and its warnings must not panic either.
fuzz_target!(|data: &str| {
    if let Ok(cfg) = pendule_config::load_toml(data) {
        if cfg.validate().is_ok() {
            let _ = cfg.warnings();
        }
    }
});
