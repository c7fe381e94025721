use crate::error::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use typed_builder::TypedBuilder;
use zwh_core::prelude::*;

/// How long the driver waits for the different protocol events
#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct Timeouts {
    /// How long to wait for the controller to ACK a frame
    #[builder(default = Duration::from_millis(1000))]
    pub ack: Duration,
    /// Inter-byte timeout while receiving a frame
    #[builder(default = Duration::from_millis(150))]
    pub byte: Duration,
    /// How long to wait for the Response to a Request
    #[builder(default = Duration::from_millis(10000))]
    pub response: Duration,
    /// How long to wait for a CC report after a CC get
    #[builder(default = Duration::from_millis(1000))]
    pub report: Duration,
    /// Lifetime of issued S0 nonces
    #[builder(default = Duration::from_millis(5000))]
    pub nonce: Duration,
    /// Maximum wait for a SendData callback
    #[builder(default = Duration::from_millis(65000))]
    pub send_data_callback: Duration,
    /// How long to wait for the Serial API Started message after a reset
    #[builder(default = Duration::from_millis(5000))]
    pub serial_api_started: Duration,
    /// How long to wait for a missing Transport Service segment before
    /// requesting it
    #[builder(default = Duration::from_millis(800))]
    pub request_missing_segment: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Timeouts {
    fn validate(&self) -> Result<()> {
        check_range("timeouts.ack", self.ack, Duration::from_millis(1), None)?;
        check_range("timeouts.byte", self.byte, Duration::from_millis(1), None)?;
        check_range(
            "timeouts.response",
            self.response,
            Duration::from_millis(500),
            Some(Duration::from_millis(20000)),
        )?;
        check_range(
            "timeouts.report",
            self.report,
            Duration::from_millis(500),
            Some(Duration::from_millis(10000)),
        )?;
        check_range(
            "timeouts.nonce",
            self.nonce,
            Duration::from_millis(3000),
            Some(Duration::from_millis(20000)),
        )?;
        check_range(
            "timeouts.sendDataCallback",
            self.send_data_callback,
            Duration::from_millis(10000),
            None,
        )?;
        check_range(
            "timeouts.serialAPIStarted",
            self.serial_api_started,
            Duration::from_millis(1000),
            Some(Duration::from_millis(30000)),
        )?;
        Ok(())
    }
}

fn check_range(
    name: &str,
    value: Duration,
    min: Duration,
    max: Option<Duration>,
) -> Result<()> {
    if value < min {
        return Err(Error::InvalidOptions(format!(
            "{} must be at least {} ms",
            name,
            min.as_millis()
        )));
    }
    if let Some(max) = max {
        if value > max {
            return Err(Error::InvalidOptions(format!(
                "{} must be at most {} ms",
                name,
                max.as_millis()
            )));
        }
    }
    Ok(())
}

/// How often the driver retries the different operations
#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct Attempts {
    /// How often to try opening the serial port (1 s spacing)
    #[builder(default = 10)]
    pub open_serial_port: u8,
    /// How often the driver tries to send a controller command
    #[builder(default = 3)]
    pub controller: u8,
    /// How many times the controller should try to transmit a SendData
    #[builder(default = 3)]
    pub send_data: u8,
    /// How many attempts a node interview gets before giving up
    #[builder(default = 5)]
    pub node_interview: u8,
}

impl Default for Attempts {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Attempts {
    fn validate(&self) -> Result<()> {
        if self.open_serial_port < 1 {
            return Err(Error::InvalidOptions(
                "attempts.openSerialPort must be at least 1".into(),
            ));
        }
        if !(1..=3).contains(&self.controller) {
            return Err(Error::InvalidOptions(
                "attempts.controller must be between 1 and 3".into(),
            ));
        }
        if self.send_data < 1 {
            return Err(Error::InvalidOptions(
                "attempts.sendData must be at least 1".into(),
            ));
        }
        if !(1..=10).contains(&self.node_interview) {
            return Err(Error::InvalidOptions(
                "attempts.nodeInterview must be between 1 and 10".into(),
            ));
        }
        Ok(())
    }
}

/// The network keys for the supported security classes
#[derive(Default, Clone, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
pub struct SecurityKeys {
    pub s0_legacy: Option<Vec<u8>>,
    pub s2_unauthenticated: Option<Vec<u8>>,
    pub s2_authenticated: Option<Vec<u8>>,
    pub s2_access_control: Option<Vec<u8>>,
}

impl SecurityKeys {
    fn validate(&self) -> Result<()> {
        let keys = [
            ("S0_Legacy", &self.s0_legacy),
            ("S2_Unauthenticated", &self.s2_unauthenticated),
            ("S2_Authenticated", &self.s2_authenticated),
            ("S2_AccessControl", &self.s2_access_control),
        ];

        for (name, key) in &keys {
            if let Some(key) = key {
                if key.len() != 16 {
                    return Err(Error::InvalidOptions(format!(
                        "securityKeys.{} must be 16 bytes long",
                        name
                    )));
                }
            }
        }

        // Reusing a key for multiple classes weakens all of them
        for i in 0..keys.len() {
            for j in i + 1..keys.len() {
                if let (Some(a), Some(b)) = (keys[i].1, keys[j].1) {
                    if a == b {
                        return Err(Error::InvalidOptions(format!(
                            "securityKeys.{} and securityKeys.{} must not be identical",
                            keys[i].0, keys[j].0
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Presets for how aggressively the caches are written to disk
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum StorageThrottle {
    Slow,
    #[default]
    Normal,
    Fast,
}

impl StorageThrottle {
    pub fn window(&self) -> Duration {
        match self {
            StorageThrottle::Slow => Duration::from_millis(1000),
            StorageThrottle::Normal => Duration::from_millis(150),
            StorageThrottle::Fast => Duration::from_millis(50),
        }
    }
}

#[derive(Default, Clone, TypedBuilder)]
#[builder(field_defaults(default))]
pub struct StorageOptions {
    /// Where to put the network, value and metadata caches.
    /// When unset, nothing is persisted.
    #[builder(setter(into, strip_option))]
    pub cache_dir: Option<PathBuf>,
    pub throttle: StorageThrottle,
    /// Where to put the lock file for single-instance ownership.
    /// Defaults to the cache directory.
    #[builder(setter(into, strip_option))]
    pub lock_dir: Option<PathBuf>,
    /// Clear the caches when opening
    pub clear_on_open: bool,
}

/// The callbacks an application must provide to participate in secure
/// inclusion. Either all of them are given or none.
#[derive(Clone)]
pub struct InclusionUserCallbacks {
    pub grant_security_classes: Arc<dyn Fn(Vec<SecurityClass>) -> Vec<SecurityClass> + Send + Sync>,
    pub validate_dsk_and_enter_pin: Arc<dyn Fn(String) -> Option<String> + Send + Sync>,
    pub abort: Arc<dyn Fn() + Send + Sync>,
}

#[derive(Clone, TypedBuilder)]
pub struct DriverOptions {
    #[builder(default)]
    pub timeouts: Timeouts,
    #[builder(default)]
    pub attempts: Attempts,
    /// Soft-reset the controller on startup to get it into a known state
    #[builder(default = true)]
    pub enable_soft_reset: bool,
    #[builder(default)]
    pub security_keys: SecurityKeys,
    #[builder(default)]
    pub storage: StorageOptions,
    #[builder(default, setter(strip_option))]
    pub inclusion_user_callbacks: Option<InclusionUserCallbacks>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl DriverOptions {
    pub fn validate(&self) -> Result<()> {
        self.timeouts.validate()?;
        self.attempts.validate()?;
        self.security_keys.validate()?;
        Ok(())
    }

    /// Applies the environment variable overrides recognized by the driver
    pub fn apply_env(&mut self) {
        if std::env::var("ZWAVEJS_DISABLE_SOFT_RESET").is_ok() {
            self.enable_soft_reset = false;
        }
        if std::env::var("NO_CACHE").as_deref() == Ok("true") {
            self.storage.clear_on_open = true;
        }
        if let Ok(dir) = std::env::var("ZWAVEJS_LOCK_DIRECTORY") {
            self.storage.lock_dir = Some(dir.into());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        assert!(DriverOptions::default().validate().is_ok());
    }

    #[test]
    fn test_out_of_range_timeout_rejected() {
        let options = DriverOptions::builder()
            .timeouts(
                Timeouts::builder()
                    .response(Duration::from_millis(100))
                    .build(),
            )
            .build();
        assert!(matches!(
            options.validate(),
            Err(Error::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let options = DriverOptions::builder()
            .security_keys(
                SecurityKeys::builder()
                    .s0_legacy(vec![1u8; 16])
                    .s2_authenticated(vec![1u8; 16])
                    .build(),
            )
            .build();
        assert!(matches!(
            options.validate(),
            Err(Error::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_short_key_rejected() {
        let options = DriverOptions::builder()
            .security_keys(SecurityKeys::builder().s0_legacy(vec![1u8; 8]).build())
            .build();
        assert!(matches!(
            options.validate(),
            Err(Error::InvalidOptions(_))
        ));
    }
}
