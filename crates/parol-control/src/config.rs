//! Commander configuration
//!
//! Loaded from TOML (every field optional), then overridden by environment
//! variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `PAROL6_SERVER_HOST` | `controller.host` |
//! | `PAROL6_SERVER_PORT` | `controller.port` |
//! | `PAROL6_AUTO_START` | `controller.auto_start` |
//! | `PAROL6_COM_PORT` | `controller.com_port` |
//! | `PAROL6_UI_PORT` | `ui.port` |
//! | `PAROL_WEBAPP_REQUIRE_READY` | `require_ready` |
//! | `PAROL_WEBAPP_AUTO_SIMULATOR` | `controller.simulator_fallback` |
//! | `PAROL_CONTROL_RATE_HZ` | `cadence.control_rate_hz` |
//!
//! Boolean variables accept `1`, `true`, `yes` and `on` (any case).

use crate::cadence::CadenceConfig;
use crate::error::ControlError;
use crate::poller::PollerConfig;
use crate::runner::RunnerConfig;
use parol_driver::{ChannelConfig, ControllerLaunch, SupervisorConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Controller endpoint and process management.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerSection {
    pub host: String,
    pub port: u16,
    pub auto_start: bool,
    /// Controller script launched when `auto_start` is set.
    pub script: Option<PathBuf>,
    pub interpreter: String,
    pub com_port: Option<String>,
    pub simulator_fallback: bool,
    pub query_timeout_ms: u64,
    pub retries: u32,
    pub startup_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    pub failure_threshold: u32,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5001,
            auto_start: false,
            script: None,
            interpreter: "python3".to_string(),
            com_port: None,
            simulator_fallback: true,
            query_timeout_ms: 300,
            retries: 1,
            startup_timeout_ms: 5000,
            probe_interval_ms: 200,
            shutdown_grace_ms: 5000,
            failure_threshold: 3,
        }
    }
}

/// Web surface bind address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UiSection {
    pub host: String,
    pub port: u16,
}

impl Default for UiSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CadenceSection {
    pub control_rate_hz: f64,
    pub drift_tolerance: f64,
    pub jog_duration_ms: u64,
    pub window: u32,
}

impl Default for CadenceSection {
    fn default() -> Self {
        Self {
            control_rate_hz: 50.0,
            drift_tolerance: 0.2,
            jog_duration_ms: 100,
            window: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusSection {
    pub period_ms: u64,
    pub offline_period_ms: u64,
}

impl Default for StatusSection {
    fn default() -> Self {
        Self {
            period_ms: 200,
            offline_period_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProgramsSection {
    pub dir: PathBuf,
    pub interpreter: String,
    pub args: Vec<String>,
    pub stop_grace_ms: u64,
}

impl Default for ProgramsSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./programs"),
            interpreter: "python3".to_string(),
            args: vec!["-u".to_string()],
            stop_grace_ms: 2000,
        }
    }
}

/// Full commander configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommanderConfig {
    /// Fail startup unless the controller reaches Ready.
    pub require_ready: bool,
    /// Retry period of `ensure()` while the controller is not Ready.
    pub reconnect_interval_ms: u64,
    pub controller: ControllerSection,
    pub ui: UiSection,
    pub cadence: CadenceSection,
    pub status: StatusSection,
    pub programs: ProgramsSection,
}

impl Default for CommanderConfig {
    fn default() -> Self {
        Self {
            require_ready: false,
            reconnect_interval_ms: 2000,
            controller: ControllerSection::default(),
            ui: UiSection::default(),
            cadence: CadenceSection::default(),
            status: StatusSection::default(),
            programs: ProgramsSection::default(),
        }
    }
}

impl CommanderConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ControlError> {
        toml::from_str(raw).map_err(|e| ControlError::InvalidConfig(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ControlError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ControlError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (variable name to value).
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ControlError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string());

        if let Some(v) = get("PAROL6_SERVER_HOST").filter(|v| !v.is_empty()) {
            self.controller.host = v;
        }
        if let Some(v) = get("PAROL6_SERVER_PORT") {
            self.controller.port = parse_env("PAROL6_SERVER_PORT", &v)?;
        }
        if let Some(v) = get("PAROL6_AUTO_START") {
            self.controller.auto_start = parse_bool(&v);
        }
        if let Some(v) = get("PAROL6_COM_PORT") {
            self.controller.com_port = Some(v).filter(|v| !v.is_empty());
        }
        if let Some(v) = get("PAROL6_UI_PORT") {
            self.ui.port = parse_env("PAROL6_UI_PORT", &v)?;
        }
        if let Some(v) = get("PAROL_WEBAPP_REQUIRE_READY") {
            self.require_ready = parse_bool(&v);
        }
        if let Some(v) = get("PAROL_WEBAPP_AUTO_SIMULATOR") {
            self.controller.simulator_fallback = parse_bool(&v);
        }
        if let Some(v) = get("PAROL_CONTROL_RATE_HZ") {
            self.cadence.control_rate_hz = parse_env("PAROL_CONTROL_RATE_HZ", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ControlError> {
        let invalid = |msg: &str| Err(ControlError::InvalidConfig(msg.to_string()));
        if self.controller.host.is_empty() {
            return invalid("controller.host must not be empty");
        }
        if self.controller.query_timeout_ms == 0 {
            return invalid("controller.query_timeout_ms must be > 0");
        }
        if self.controller.probe_interval_ms == 0 {
            return invalid("controller.probe_interval_ms must be > 0");
        }
        if self.controller.auto_start && self.controller.script.is_none() {
            return invalid("controller.auto_start requires controller.script");
        }
        if self.reconnect_interval_ms == 0 {
            return invalid("reconnect_interval_ms must be > 0");
        }
        if self.programs.interpreter.trim().is_empty() {
            return invalid("programs.interpreter must not be empty");
        }
        self.cadence_config().validate()?;
        self.poller_config().validate()
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            query_timeout: Duration::from_millis(self.controller.query_timeout_ms),
            retries: self.controller.retries,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let c = &self.controller;
        let launch = c
            .script
            .as_ref()
            .map(|script| ControllerLaunch::python_script(c.interpreter.clone(), script));
        SupervisorConfig {
            host: c.host.clone(),
            port: c.port,
            auto_start: c.auto_start,
            launch,
            com_port: c.com_port.clone(),
            simulator_fallback: c.simulator_fallback,
            startup_timeout: Duration::from_millis(c.startup_timeout_ms),
            probe_interval: Duration::from_millis(c.probe_interval_ms),
            shutdown_grace: Duration::from_millis(c.shutdown_grace_ms),
            failure_threshold: c.failure_threshold,
        }
    }

    pub fn cadence_config(&self) -> CadenceConfig {
        CadenceConfig {
            control_rate_hz: self.cadence.control_rate_hz,
            drift_tolerance: self.cadence.drift_tolerance,
            jog_duration: Duration::from_millis(self.cadence.jog_duration_ms),
            cadence_window: self.cadence.window,
        }
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            period: Duration::from_millis(self.status.period_ms),
            offline_period: Duration::from_millis(self.status.offline_period_ms),
            ..PollerConfig::default()
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            programs_dir: self.programs.dir.clone(),
            interpreter: self.programs.interpreter.clone(),
            interpreter_args: self.programs.args.clone(),
            stop_grace: Duration::from_millis(self.programs.stop_grace_ms),
            ..RunnerConfig::default()
        }
    }
}

/// `1`, `true`, `yes`, `on` (any case) are true; anything else is false.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ControlError> {
    value
        .parse()
        .map_err(|_| ControlError::InvalidConfig(format!("{key}: invalid value {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CommanderConfig::default();
        assert_eq!(config.controller.host, "127.0.0.1");
        assert_eq!(config.controller.port, 5001);
        assert!(!config.controller.auto_start);
        assert_eq!(config.ui.port, 8080);
        assert_eq!(config.cadence.control_rate_hz, 50.0);
        assert_eq!(config.programs.dir, PathBuf::from("./programs"));
        assert!(config.validate().is_ok());

        let supervisor = config.supervisor_config();
        assert_eq!(supervisor.failure_threshold, 3);
        assert_eq!(supervisor.shutdown_grace, Duration::from_secs(5));
        assert!(supervisor.launch.is_none());
        assert_eq!(config.runner_config().stop_grace, Duration::from_secs(2));
        assert_eq!(config.channel_config().query_timeout, Duration::from_millis(300));
    }

    #[test]
    fn test_partial_toml() {
        let config = CommanderConfig::from_toml_str(
            r#"
            require_ready = true

            [controller]
            port = 6001
            auto_start = true
            script = "/opt/parol6/controller.py"

            [cadence]
            control_rate_hz = 100.0
            "#,
        )
        .unwrap();
        assert!(config.require_ready);
        assert_eq!(config.controller.port, 6001);
        assert_eq!(config.controller.host, "127.0.0.1");
        assert_eq!(config.cadence.control_rate_hz, 100.0);
        assert_eq!(config.status.period_ms, 200);
        assert!(config.validate().is_ok());

        let launch = config.supervisor_config().launch.unwrap();
        assert_eq!(launch.program, "python3");
        assert_eq!(
            launch.working_dir.as_deref(),
            Some(Path::new("/opt/parol6"))
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = CommanderConfig::from_toml_str("[controller]\nprot = 1\n").unwrap_err();
        assert!(matches!(err, ControlError::InvalidConfig(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = CommanderConfig::default();
        config
            .apply_env_from(lookup(&[
                ("PAROL6_SERVER_HOST", "10.0.0.2"),
                ("PAROL6_SERVER_PORT", "5002"),
                ("PAROL6_AUTO_START", "YES"),
                ("PAROL6_COM_PORT", "/dev/ttyACM0"),
                ("PAROL6_UI_PORT", "9000"),
                ("PAROL_WEBAPP_REQUIRE_READY", "on"),
                ("PAROL_WEBAPP_AUTO_SIMULATOR", "0"),
                ("PAROL_CONTROL_RATE_HZ", "100"),
            ]))
            .unwrap();
        assert_eq!(config.controller.host, "10.0.0.2");
        assert_eq!(config.controller.port, 5002);
        assert!(config.controller.auto_start);
        assert_eq!(config.controller.com_port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.ui.port, 9000);
        assert!(config.require_ready);
        assert!(!config.controller.simulator_fallback);
        assert_eq!(config.cadence.control_rate_hz, 100.0);
    }

    #[test]
    fn test_env_invalid_number() {
        let mut config = CommanderConfig::default();
        let err = config
            .apply_env_from(lookup(&[("PAROL6_SERVER_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(err.to_string().contains("PAROL6_SERVER_PORT"));
    }

    #[test]
    fn test_empty_com_port_clears() {
        let mut config = CommanderConfig::default();
        config.controller.com_port = Some("COM3".into());
        config
            .apply_env_from(lookup(&[("PAROL6_COM_PORT", "")]))
            .unwrap();
        assert_eq!(config.controller.com_port, None);
    }

    #[test]
    #[serial]
    fn test_apply_process_env() {
        // SAFETY: serialized with other env-mutating tests.
        unsafe {
            std::env::set_var("PAROL6_UI_PORT", "8181");
        }
        let mut config = CommanderConfig::default();
        let result = config.apply_env();
        unsafe {
            std::env::remove_var("PAROL6_UI_PORT");
        }
        result.unwrap();
        assert_eq!(config.ui.port, 8181);
    }

    #[test]
    fn test_parse_bool() {
        for v in ["1", "true", "True", "YES", "on"] {
            assert!(parse_bool(v), "{v}");
        }
        for v in ["0", "false", "no", "off", "", "2"] {
            assert!(!parse_bool(v), "{v}");
        }
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = CommanderConfig::default();
        config.cadence.control_rate_hz = 0.0;
        assert!(config.validate().is_err());

        let mut config = CommanderConfig::default();
        config.programs.interpreter = "  ".into();
        assert!(config.validate().is_err());

        let mut config = CommanderConfig::default();
        config.controller.auto_start = true;
        assert!(config.validate().is_err());

        let mut config = CommanderConfig::default();
        config.status.period_ms = 0;
        assert!(config.validate().is_err());
    }
}
