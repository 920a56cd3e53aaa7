use crate::engine::EngineSettings;
use crate::session::SessionConfig;
use config::Config;
use serde::Deserialize;
use std::time::Duration;

/// Launch-time tunables, layered from `config`, `config_local` and the
/// environment. Everything has a default so the launcher runs without any
/// file present; the persisted device document is separate (config store).
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    core: Core,
    #[serde(default)]
    session: Session,
    #[serde(default)]
    umd: Umd,
    #[serde(default)]
    command_port: CommandPort,
}

impl AppConfig {
    pub fn load() -> Self {
        Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::File::with_name("config_local").required(false))
            .add_source(config::Environment::with_prefix("PEDESTAL").separator("__"))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            umd_bind_addr: self.umd.bind_addr.clone(),
            command_port_bind_addr: self.command_port.bind_addr.clone(),
            event_channel_size: self.core.event_channel_size,
            shutdown_grace: Duration::from_millis(self.core.shutdown_grace_ms),
            session: SessionConfig {
                poll_interval: Duration::from_millis(self.session.poll_interval_ms),
                request_timeout: Duration::from_millis(self.session.request_timeout_ms),
                command_attempts: self.session.command_attempts,
                motion_heartbeat: Duration::from_millis(self.session.motion_heartbeat_ms),
                backoff_base: Duration::from_millis(self.session.backoff_base_ms),
                backoff_cap: Duration::from_millis(self.session.backoff_cap_ms),
            },
            enable_discovery: true,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Core {
    #[serde(default = "default_event_channel_size")]
    event_channel_size: usize,
    #[serde(default = "default_shutdown_grace_ms")]
    shutdown_grace_ms: u64,
}

impl Default for Core {
    fn default() -> Self {
        Core { event_channel_size: default_event_channel_size(), shutdown_grace_ms: default_shutdown_grace_ms() }
    }
}

#[derive(Debug, Deserialize)]
pub struct Session {
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    request_timeout_ms: u64,
    #[serde(default = "default_command_attempts")]
    command_attempts: u32,
    #[serde(default = "default_motion_heartbeat_ms")]
    motion_heartbeat_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    backoff_cap_ms: u64,
}

impl Default for Session {
    fn default() -> Self {
        Session {
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            command_attempts: default_command_attempts(),
            motion_heartbeat_ms: default_motion_heartbeat_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Umd {
    #[serde(default = "default_umd_bind_addr")]
    bind_addr: String,
}

impl Default for Umd {
    fn default() -> Self {
        Umd { bind_addr: default_umd_bind_addr() }
    }
}

#[derive(Debug, Deserialize)]
pub struct CommandPort {
    #[serde(default = "default_command_port_bind_addr")]
    bind_addr: String,
}

impl Default for CommandPort {
    fn default() -> Self {
        CommandPort { bind_addr: default_command_port_bind_addr() }
    }
}

fn default_event_channel_size() -> usize {
    64
}

fn default_shutdown_grace_ms() -> u64 {
    2_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_command_attempts() -> u32 {
    3
}

fn default_motion_heartbeat_ms() -> u64 {
    100
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_umd_bind_addr() -> String {
    "0.0.0.0:60000".to_string()
}

fn default_command_port_bind_addr() -> String {
    "0.0.0.0:1234".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_the_design_points() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        let settings = config.engine_settings();

        assert_eq!(settings.session.poll_interval, Duration::from_millis(500));
        assert_eq!(settings.session.request_timeout, Duration::from_secs(5));
        assert_eq!(settings.session.command_attempts, 3);
        assert_eq!(settings.session.backoff_base, Duration::from_secs(1));
        assert_eq!(settings.session.backoff_cap, Duration::from_secs(60));
        assert_eq!(settings.shutdown_grace, Duration::from_secs(2));
        assert_eq!(settings.umd_bind_addr, "0.0.0.0:60000");
        assert_eq!(settings.command_port_bind_addr, "0.0.0.0:1234");
    }

    #[test]
    fn sections_can_be_overridden_piecemeal() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "session": { "poll_interval_ms": 250 }, "umd": { "bind_addr": "0.0.0.0:9999" } }"#)
                .unwrap();
        let settings = config.engine_settings();

        assert_eq!(settings.session.poll_interval, Duration::from_millis(250));
        // Untouched fields keep their defaults.
        assert_eq!(settings.session.request_timeout, Duration::from_secs(5));
        assert_eq!(settings.umd_bind_addr, "0.0.0.0:9999");
    }
}
