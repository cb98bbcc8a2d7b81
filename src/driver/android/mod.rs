//! Android drivers: the bridge (adb shell) path and the on-device agent RPC
//! fast path with bridge fallback.

pub mod adb;
pub mod adb_driver;
pub mod agent;

pub use adb_driver::AdbDriver;
pub use agent::AgentDriver;

/// Read a positive float timeout from the environment, falling back (with a
/// warning) on missing or invalid values.
pub(crate) fn env_timeout_secs(name: &str, default: f64) -> f64 {
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => match raw.parse::<f64>() {
            Ok(v) if v > 0.0 => v,
            Ok(_) | Err(_) => {
                log::warn!("invalid {}={:?}, fallback to {}", name, raw, default);
                default
            }
        },
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_timeout_fallbacks() {
        std::env::remove_var("BYTEAUTOUI_TEST_TIMEOUT");
        assert_eq!(env_timeout_secs("BYTEAUTOUI_TEST_TIMEOUT", 15.0), 15.0);
        std::env::set_var("BYTEAUTOUI_TEST_TIMEOUT", "2.5");
        assert_eq!(env_timeout_secs("BYTEAUTOUI_TEST_TIMEOUT", 15.0), 2.5);
        std::env::set_var("BYTEAUTOUI_TEST_TIMEOUT", "-1");
        assert_eq!(env_timeout_secs("BYTEAUTOUI_TEST_TIMEOUT", 15.0), 15.0);
        std::env::set_var("BYTEAUTOUI_TEST_TIMEOUT", "abc");
        assert_eq!(env_timeout_secs("BYTEAUTOUI_TEST_TIMEOUT", 15.0), 15.0);
        std::env::remove_var("BYTEAUTOUI_TEST_TIMEOUT");
    }
}
