//! Session configuration.
//!
//! A [`SessionConfig`] carries everything a single session needs: identity,
//! role, transport endpoint, timers and reset policy. Configs deserialize
//! from any serde format using the kebab-case key names (`sender-comp-id`,
//! `reset-on-logon`, …) or are built programmatically with the
//! [`SessionConfigBuilder`]. Construction fails fast: a config that passed
//! [`build`] or [`validate`] never errors later for a missing field.
//!
//! [`build`]: SessionConfigBuilder::build
//! [`validate`]: SessionConfig::validate

use crate::fix::clock::{Clock, SystemClock};
use crate::fix::SessionId;
use chrono::{FixedOffset, NaiveTime};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("setting `{0}` is required")]
    Required(&'static str),
    #[error("setting `{field}` is invalid: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Which side of the TCP connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Initiator,
    Acceptor,
}

/// The protocol version carried in BeginString(8).
///
/// FIX 5.0 sessions run over the FIXT.1.1 transport and negotiate the
/// application version with DefaultApplVerID(1137) at logon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum BeginString {
    #[serde(rename = "FIX.4.2")]
    Fix42,
    #[default]
    #[serde(rename = "FIX.4.4")]
    Fix44,
    #[serde(rename = "FIXT.1.1")]
    Fixt11,
}

impl BeginString {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeginString::Fix42 => "FIX.4.2",
            BeginString::Fix44 => "FIX.4.4",
            BeginString::Fixt11 => "FIXT.1.1",
        }
    }
}

impl std::str::FromStr for BeginString {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "FIX.4.2" => Ok(BeginString::Fix42),
            "FIX.4.4" => Ok(BeginString::Fix44),
            "FIXT.1.1" => Ok(BeginString::Fixt11),
            other => Err(ConfigError::Invalid {
                field: "begin-string",
                reason: format!("unsupported BeginString `{other}`"),
            }),
        }
    }
}

fn default_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

const fn default_true() -> bool {
    true
}
const fn default_heartbeat() -> u32 {
    30
}
const fn default_reconnect_interval() -> u64 {
    5
}
const fn default_max_reconnect_attempts() -> i32 {
    -1
}
const fn default_pool_size() -> usize {
    64
}
const fn default_max_message_length() -> usize {
    4096
}
const fn default_max_tag_number() -> u32 {
    1000
}

/// Full configuration of one FIX session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SessionConfig {
    pub session_name: String,
    #[serde(default)]
    pub begin_string: BeginString,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub role: SessionRole,
    /// Remote host; required for initiators.
    #[serde(default)]
    pub host: Option<String>,
    pub port: u16,
    /// Seconds between heartbeats; 0 disables both keepalive timers.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval: u32,
    #[serde(default)]
    pub reset_on_logon: bool,
    #[serde(default)]
    pub reset_on_logout: bool,
    #[serde(default)]
    pub reset_on_disconnect: bool,
    /// Seconds between reconnect attempts for initiators.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
    /// −1 means retry forever.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: i32,
    #[serde(default, with = "time_of_day")]
    pub start_time: Option<NaiveTime>,
    #[serde(default, with = "time_of_day")]
    pub end_time: Option<NaiveTime>,
    #[serde(default, with = "time_of_day")]
    pub eod_time: Option<NaiveTime>,
    /// Fixed UTC offset for the schedule times, e.g. "-05:00"; UTC when
    /// absent.
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub reset_on_eod: bool,
    /// When false the session never touches the log store (and answers
    /// resends with a whole-range gap-fill).
    #[serde(default = "default_true")]
    pub log_messages: bool,
    #[serde(default = "default_pool_size")]
    pub message_pool_size: usize,
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    #[serde(default = "default_max_tag_number")]
    pub max_tag_number: u32,
    #[serde(default)]
    pub persistence_path: Option<PathBuf>,
    #[serde(skip, default = "default_clock")]
    pub clock: Arc<dyn Clock>,
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    pub fn session_id(&self) -> SessionId {
        SessionId::new(&self.sender_comp_id, &self.target_comp_id)
    }

    /// The UTC offset all schedule times are interpreted in.
    pub fn utc_offset(&self) -> Result<FixedOffset, ConfigError> {
        match self.time_zone.as_deref() {
            None | Some("UTC") | Some("utc") => {
                FixedOffset::east_opt(0).ok_or_else(|| ConfigError::Invalid {
                    field: "time-zone",
                    reason: "UTC offset out of range".into(),
                })
            }
            Some(offset) => offset.parse::<FixedOffset>().map_err(|e| ConfigError::Invalid {
                field: "time-zone",
                reason: format!("`{offset}` is not a fixed offset: {e}"),
            }),
        }
    }

    /// Fail-fast validation; called by the builder and after
    /// deserialization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_name.is_empty() {
            return Err(ConfigError::Required("session-name"));
        }
        if self.sender_comp_id.is_empty() {
            return Err(ConfigError::Required("sender-comp-id"));
        }
        if self.target_comp_id.is_empty() {
            return Err(ConfigError::Required("target-comp-id"));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid {
                field: "port",
                reason: "must be greater than 0".into(),
            });
        }
        if self.role == SessionRole::Initiator && self.host.is_none() {
            return Err(ConfigError::Required("host"));
        }
        if self.message_pool_size == 0 {
            return Err(ConfigError::Invalid {
                field: "message-pool-size",
                reason: "must be greater than 0".into(),
            });
        }
        if self.max_message_length < 64 {
            return Err(ConfigError::Invalid {
                field: "max-message-length",
                reason: "too small to hold any FIX frame".into(),
            });
        }
        self.utc_offset()?;
        Ok(())
    }
}

mod time_of_day {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer};

    const FORMAT: &str = "%H:%M:%S";

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| {
            NaiveTime::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

/// Builder for [`SessionConfig`].
///
/// Required: session name, sender comp id, target comp id, role, port, and
/// host for initiators. Everything else has the defaults of spec'd keys.
#[derive(Default)]
pub struct SessionConfigBuilder {
    session_name: Option<String>,
    begin_string: Option<BeginString>,
    sender_comp_id: Option<String>,
    target_comp_id: Option<String>,
    role: Option<SessionRole>,
    host: Option<String>,
    port: Option<u16>,
    heartbeat_interval: Option<u32>,
    reset_on_logon: bool,
    reset_on_logout: bool,
    reset_on_disconnect: bool,
    reconnect_interval: Option<u64>,
    max_reconnect_attempts: Option<i32>,
    start_time: Option<NaiveTime>,
    end_time: Option<NaiveTime>,
    eod_time: Option<NaiveTime>,
    time_zone: Option<String>,
    reset_on_eod: bool,
    log_messages: Option<bool>,
    message_pool_size: Option<usize>,
    max_message_length: Option<usize>,
    max_tag_number: Option<u32>,
    persistence_path: Option<PathBuf>,
    clock: Option<Arc<dyn Clock>>,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_session_name(mut self, name: &str) -> Self {
        self.session_name = Some(name.to_string());
        self
    }

    /// The `SenderCompID(49)` stamped on every outgoing message.
    pub fn with_sender_comp_id(mut self, sender_comp_id: &str) -> Self {
        self.set_sender_comp_id(sender_comp_id);
        self
    }
    pub fn set_sender_comp_id(&mut self, sender_comp_id: &str) {
        self.sender_comp_id = Some(sender_comp_id.to_string());
    }

    /// The `TargetCompID(56)` stamped on every outgoing message.
    pub fn with_target_comp_id(mut self, target_comp_id: &str) -> Self {
        self.set_target_comp_id(target_comp_id);
        self
    }
    pub fn set_target_comp_id(&mut self, target_comp_id: &str) {
        self.target_comp_id = Some(target_comp_id.to_string());
    }

    pub fn with_role(mut self, role: SessionRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_begin_string(mut self, begin_string: BeginString) -> Self {
        self.begin_string = Some(begin_string);
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Seconds between heartbeats; 0 disables the keepalive timers.
    pub fn with_heartbeat_interval(mut self, seconds: u32) -> Self {
        self.heartbeat_interval = Some(seconds);
        self
    }

    pub fn with_reset_on_logon(mut self, reset: bool) -> Self {
        self.reset_on_logon = reset;
        self
    }

    pub fn with_reset_on_logout(mut self, reset: bool) -> Self {
        self.reset_on_logout = reset;
        self
    }

    pub fn with_reset_on_disconnect(mut self, reset: bool) -> Self {
        self.reset_on_disconnect = reset;
        self
    }

    pub fn with_reconnect_interval(mut self, seconds: u64) -> Self {
        self.reconnect_interval = Some(seconds);
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: i32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    pub fn with_start_time(mut self, t: NaiveTime) -> Self {
        self.start_time = Some(t);
        self
    }

    pub fn with_end_time(mut self, t: NaiveTime) -> Self {
        self.end_time = Some(t);
        self
    }

    pub fn with_eod_time(mut self, t: NaiveTime) -> Self {
        self.eod_time = Some(t);
        self
    }

    pub fn with_time_zone(mut self, zone: &str) -> Self {
        self.time_zone = Some(zone.to_string());
        self
    }

    pub fn with_reset_on_eod(mut self, reset: bool) -> Self {
        self.reset_on_eod = reset;
        self
    }

    pub fn with_log_messages(mut self, log: bool) -> Self {
        self.log_messages = Some(log);
        self
    }

    pub fn with_message_pool_size(mut self, size: usize) -> Self {
        self.message_pool_size = Some(size);
        self
    }

    pub fn with_max_message_length(mut self, len: usize) -> Self {
        self.max_message_length = Some(len);
        self
    }

    pub fn with_max_tag_number(mut self, tag: u32) -> Self {
        self.max_tag_number = Some(tag);
        self
    }

    pub fn with_persistence_path(mut self, path: PathBuf) -> Self {
        self.persistence_path = Some(path);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let config = SessionConfig {
            session_name: self
                .session_name
                .ok_or(ConfigError::Required("session-name"))?,
            begin_string: self.begin_string.unwrap_or_default(),
            sender_comp_id: self
                .sender_comp_id
                .ok_or(ConfigError::Required("sender-comp-id"))?,
            target_comp_id: self
                .target_comp_id
                .ok_or(ConfigError::Required("target-comp-id"))?,
            role: self.role.ok_or(ConfigError::Required("role"))?,
            host: self.host,
            port: self.port.ok_or(ConfigError::Required("port"))?,
            heartbeat_interval: self.heartbeat_interval.unwrap_or_else(default_heartbeat),
            reset_on_logon: self.reset_on_logon,
            reset_on_logout: self.reset_on_logout,
            reset_on_disconnect: self.reset_on_disconnect,
            reconnect_interval: self
                .reconnect_interval
                .unwrap_or_else(default_reconnect_interval),
            max_reconnect_attempts: self
                .max_reconnect_attempts
                .unwrap_or_else(default_max_reconnect_attempts),
            start_time: self.start_time,
            end_time: self.end_time,
            eod_time: self.eod_time,
            time_zone: self.time_zone,
            reset_on_eod: self.reset_on_eod,
            log_messages: self.log_messages.unwrap_or(true),
            message_pool_size: self.message_pool_size.unwrap_or_else(default_pool_size),
            max_message_length: self
                .max_message_length
                .unwrap_or_else(default_max_message_length),
            max_tag_number: self.max_tag_number.unwrap_or_else(default_max_tag_number),
            persistence_path: self.persistence_path,
            clock: self.clock.unwrap_or_else(default_clock),
        };
        config.validate()?;
        Ok(config)
    }
}
