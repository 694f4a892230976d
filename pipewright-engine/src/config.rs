//! Engine configuration
//!
//! Tunables shared by every run: channel capacity, shutdown budget, how
//! failures surface, signal handling and the metadata-injection time layout.

use std::io::IsTerminal;
use std::time::Duration;

/// Default capacity of every record channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Default time a step has to acknowledge a shutdown request
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Default layout used to render time fields during metadata injection
pub const DEFAULT_MDI_TIME_LAYOUT: &str = "%Y%m%dT%H%M%S";

/// What happens after a run fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Report the failure, then terminate the process
    Fatal,
    /// Report the failure through the status stream only
    ReportOnly,
}

impl FailureMode {
    /// Fatal when attached to an interactive terminal, report-only otherwise
    pub fn detect() -> Self {
        if std::io::stdin().is_terminal() {
            FailureMode::Fatal
        } else {
            FailureMode::ReportOnly
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "fatal" => Some(FailureMode::Fatal),
            "report" | "report-only" | "report_only" => Some(FailureMode::ReportOnly),
            _ => None,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of every record channel created by the engine
    pub channel_capacity: usize,

    /// How long a step may take to acknowledge a shutdown request
    pub shutdown_timeout: Duration,

    /// How run failures surface to the host process
    pub failure_mode: FailureMode,

    /// Whether runs listen for SIGINT/SIGTERM
    pub handle_os_signals: bool,

    /// strftime layout applied to time fields during metadata injection
    pub mdi_time_layout: String,
}

impl EngineConfig {
    /// Configuration for embedding in a long-lived service or a test:
    /// failures are reported only and OS signals are left alone
    pub fn headless() -> Self {
        Self {
            failure_mode: FailureMode::ReportOnly,
            handle_os_signals: false,
            ..Self::default()
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - PIPEWRIGHT_CHANNEL_CAPACITY (default: 1000)
    /// - PIPEWRIGHT_SHUTDOWN_TIMEOUT_SECS (default: 3)
    /// - PIPEWRIGHT_FAILURE_MODE (`fatal` | `report`, default: terminal detection)
    /// - PIPEWRIGHT_HANDLE_SIGNALS (`true` | `false`, default: true)
    /// - PIPEWRIGHT_MDI_TIME_LAYOUT (default: `%Y%m%dT%H%M%S`)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from a variable lookup; malformed values are errors
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let channel_capacity = match lookup("PIPEWRIGHT_CHANNEL_CAPACITY") {
            Some(s) => s
                .parse::<usize>()
                .map_err(|_| anyhow::anyhow!("PIPEWRIGHT_CHANNEL_CAPACITY must be a number"))?,
            None => defaults.channel_capacity,
        };

        let shutdown_timeout = match lookup("PIPEWRIGHT_SHUTDOWN_TIMEOUT_SECS") {
            Some(s) => s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                anyhow::anyhow!("PIPEWRIGHT_SHUTDOWN_TIMEOUT_SECS must be a number of seconds")
            })?,
            None => defaults.shutdown_timeout,
        };

        let failure_mode = match lookup("PIPEWRIGHT_FAILURE_MODE") {
            Some(s) => FailureMode::parse(&s)
                .ok_or_else(|| anyhow::anyhow!("Unknown PIPEWRIGHT_FAILURE_MODE '{}'", s))?,
            None => defaults.failure_mode,
        };

        let handle_os_signals = match lookup("PIPEWRIGHT_HANDLE_SIGNALS") {
            Some(s) => s
                .parse::<bool>()
                .map_err(|_| anyhow::anyhow!("PIPEWRIGHT_HANDLE_SIGNALS must be true or false"))?,
            None => defaults.handle_os_signals,
        };

        let mdi_time_layout =
            lookup("PIPEWRIGHT_MDI_TIME_LAYOUT").unwrap_or(defaults.mdi_time_layout);

        Ok(Self {
            channel_capacity,
            shutdown_timeout,
            failure_mode,
            handle_os_signals,
            mdi_time_layout,
        })
    }

    /// Sets the record channel capacity
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Sets the shutdown acknowledgement budget
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.channel_capacity == 0 {
            anyhow::bail!("channel_capacity must be greater than 0");
        }

        if self.shutdown_timeout.is_zero() {
            anyhow::bail!("shutdown_timeout must be greater than 0");
        }

        if self.mdi_time_layout.trim().is_empty() {
            anyhow::bail!("mdi_time_layout cannot be empty");
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            failure_mode: FailureMode::detect(),
            handle_os_signals: true,
            mdi_time_layout: DEFAULT_MDI_TIME_LAYOUT.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.channel_capacity, 1000);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(3));
        assert_eq!(config.mdi_time_layout, "%Y%m%dT%H%M%S");
        assert!(config.handle_os_signals);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_headless_config() {
        let config = EngineConfig::headless();
        assert_eq!(config.failure_mode, FailureMode::ReportOnly);
        assert!(!config.handle_os_signals);
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::headless();
        assert!(config.validate().is_ok());

        config.channel_capacity = 0;
        assert!(config.validate().is_err());
        config.channel_capacity = 10;

        config.shutdown_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
        config.shutdown_timeout = Duration::from_secs(1);

        config.mdi_time_layout = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_failure_mode_parse() {
        assert_eq!(FailureMode::parse("FATAL"), Some(FailureMode::Fatal));
        assert_eq!(FailureMode::parse("report"), Some(FailureMode::ReportOnly));
        assert_eq!(FailureMode::parse("maybe"), None);
    }

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: Vec<(String, String)> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| {
            vars.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        }
    }

    #[test]
    fn test_config_from_lookup() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("PIPEWRIGHT_CHANNEL_CAPACITY", "16"),
            ("PIPEWRIGHT_SHUTDOWN_TIMEOUT_SECS", "7"),
            ("PIPEWRIGHT_FAILURE_MODE", "report"),
            ("PIPEWRIGHT_HANDLE_SIGNALS", "false"),
        ]))
        .unwrap();
        assert_eq!(config.channel_capacity, 16);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(7));
        assert_eq!(config.failure_mode, FailureMode::ReportOnly);
        assert!(!config.handle_os_signals);
        assert_eq!(config.mdi_time_layout, DEFAULT_MDI_TIME_LAYOUT);
    }

    #[test]
    fn test_malformed_variables_rejected() {
        for (key, value) in [
            ("PIPEWRIGHT_CHANNEL_CAPACITY", "lots"),
            ("PIPEWRIGHT_SHUTDOWN_TIMEOUT_SECS", "3s"),
            ("PIPEWRIGHT_FAILURE_MODE", "maybe"),
            ("PIPEWRIGHT_HANDLE_SIGNALS", "yes"),
        ] {
            let err = EngineConfig::from_lookup(lookup_from(&[(key, value)])).unwrap_err();
            assert!(err.to_string().contains(key), "{key}: {err}");
        }
    }
}
