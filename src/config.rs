//! Client configuration file parser.
//!
//! Plain `key = value` lines, `#` comments.  Unknown keys are ignored and
//! unparseable numbers keep the compiled-in default.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use crate::credential::{RetrieverOptions, CREDENTIAL_PORT};
use crate::discovery::{DiscoveryOptions, StalledRetrieval, BEACON, DISCOVERY_PORT};
use crate::error::{Result, RoombaError};
use crate::session::{SessionOptions, MQTT_PORT};

// Default timing constants (seconds)
const DISCOVERY_TIMEOUT: u64 = 10;
const RETRIEVAL_TIMEOUT: u64 = 10;
const KEEP_ALIVE:        u64 = 30;
// rumqttc rejects keep-alive intervals below this
const MIN_KEEP_ALIVE:    u64 = 5;

/// Full client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // ── Discovery ─────────────────────────────────────────────────────────────
    /// Where the beacon is sent (subnet broadcast or a single robot).
    pub broadcast_address: IpAddr,
    pub discovery_port:    u16,
    /// Local port replies arrive on.
    pub listen_port:       u16,
    pub discovery_timeout: u64,
    /// Per-robot bound on credential retrieval; 0 disables it.
    pub retrieval_timeout: u64,
    pub stalled_retrieval: StalledRetrieval,
    pub credential_port:   u16,
    // ── Session ───────────────────────────────────────────────────────────────
    /// Robot address for the MQTT session.
    pub host:       String,
    pub mqtt_port:  u16,
    /// Robot BLID (client id and user name).
    pub blid:       String,
    pub password:   String,
    pub keep_alive: u64,
    // ── Process ───────────────────────────────────────────────────────────────
    pub log_syslog: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            discovery_port:    DISCOVERY_PORT,
            listen_port:       DISCOVERY_PORT + 1,
            discovery_timeout: DISCOVERY_TIMEOUT,
            retrieval_timeout: RETRIEVAL_TIMEOUT,
            stalled_retrieval: StalledRetrieval::Cancel,
            credential_port:   CREDENTIAL_PORT,
            host:              String::new(),
            mqtt_port:         MQTT_PORT,
            blid:              String::new(),
            password:          String::new(),
            keep_alive:        KEEP_ALIVE,
            log_syslog:        false,
        }
    }
}

impl ClientConfig {
    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            device_port: self.discovery_port,
            listen_port: self.listen_port,
            timeout:     Duration::from_secs(self.discovery_timeout),
            beacon:      BEACON.to_string(),
            retriever:   self.retriever_options(),
            stalled:     self.stalled_retrieval,
        }
    }

    pub fn retriever_options(&self) -> RetrieverOptions {
        RetrieverOptions {
            port:    self.credential_port,
            timeout: (self.retrieval_timeout > 0).then(|| Duration::from_secs(self.retrieval_timeout)),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            host:       self.host.clone(),
            port:       self.mqtt_port,
            blid:       self.blid.clone(),
            password:   self.password.clone(),
            keep_alive: Duration::from_secs(self.keep_alive),
        }
    }
}

fn parse_bool(val: &str) -> bool {
    val == "true" || val == "1" || val == "yes"
}

fn parse_stalled(val: &str) -> StalledRetrieval {
    match val.to_ascii_lowercase().as_str() {
        "abandon" => StalledRetrieval::Abandon,
        _         => StalledRetrieval::Cancel,
    }
}

/// Parse `path` as a `key = value` configuration file.
pub fn load_config(path: &Path) -> Result<ClientConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| RoombaError::Config(format!("cannot read {}: {e}", path.display())))?;
    Ok(parse_config(&content))
}

/// Parse configuration text on top of the defaults.
pub fn parse_config(content: &str) -> ClientConfig {
    let mut cfg = ClientConfig::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, val)) = line.split_once('=') else { continue };
        let key = key.trim().to_ascii_lowercase();
        let val = val.trim().to_string();
        if val.is_empty() {
            continue;
        }

        match key.as_str() {
            "broadcast_address" => cfg.broadcast_address = val.parse().unwrap_or(cfg.broadcast_address),
            "discovery_port"    => cfg.discovery_port    = val.parse().unwrap_or(DISCOVERY_PORT),
            "listen_port"       => cfg.listen_port       = val.parse().unwrap_or(DISCOVERY_PORT + 1),
            "discovery_timeout" => cfg.discovery_timeout = val.parse().unwrap_or(DISCOVERY_TIMEOUT),
            "retrieval_timeout" => cfg.retrieval_timeout = val.parse().unwrap_or(RETRIEVAL_TIMEOUT),
            "stalled_retrieval" => cfg.stalled_retrieval = parse_stalled(&val),
            "credential_port"   => cfg.credential_port   = val.parse().unwrap_or(CREDENTIAL_PORT),
            "host"              => cfg.host              = val,
            "mqtt_port"         => cfg.mqtt_port         = val.parse().unwrap_or(MQTT_PORT),
            "blid"              => cfg.blid              = val,
            "password"          => cfg.password          = val,
            "keep_alive"        => cfg.keep_alive        = val.parse().unwrap_or(KEEP_ALIVE),
            "log_syslog"        => cfg.log_syslog        = parse_bool(&val),
            _ => {} // ignore unknown keys
        }
    }

    cfg
}

/// Validate settings every command relies on.
pub fn validate_config(cfg: &ClientConfig) -> Result<()> {
    if cfg.discovery_timeout == 0 {
        return Err(RoombaError::Config("discovery_timeout must be at least 1 second".into()));
    }
    if cfg.keep_alive < MIN_KEEP_ALIVE {
        return Err(RoombaError::Config(format!(
            "keep_alive must be at least {MIN_KEEP_ALIVE} seconds"
        )));
    }
    Ok(())
}

/// Validate the fields needed to open a session.
pub fn validate_session(cfg: &ClientConfig) -> Result<()> {
    if cfg.host.is_empty() {
        return Err(RoombaError::Config("host is required".into()));
    }
    if cfg.blid.is_empty() {
        return Err(RoombaError::Config("blid is required".into()));
    }
    if cfg.password.is_empty() {
        return Err(RoombaError::Config("password is required".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_robot_ports() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.discovery_port, 5678);
        assert_eq!(cfg.listen_port, 5679);
        assert_eq!(cfg.credential_port, 8883);
        assert_eq!(cfg.mqtt_port, 8883);
        assert!(validate_config(&cfg).is_ok());
        assert!(validate_session(&cfg).is_err());
    }

    #[test]
    fn parses_keys_and_ignores_noise() {
        let cfg = parse_config(
            "# robot\n\
             host = 192.168.1.20\n\
             BLID=3115850251687850\n\
             password = :1:1486937829:gOhv3jK\n\
             broadcast_address = 192.168.1.255\n\
             discovery_timeout = 4\n\
             retrieval_timeout = 0\n\
             stalled_retrieval = abandon\n\
             keep_alive = nonsense\n\
             colour = blue\n",
        );
        assert_eq!(cfg.host, "192.168.1.20");
        assert_eq!(cfg.blid, "3115850251687850");
        assert_eq!(cfg.password, ":1:1486937829:gOhv3jK");
        assert_eq!(cfg.broadcast_address, "192.168.1.255".parse::<IpAddr>().unwrap());
        assert_eq!(cfg.keep_alive, KEEP_ALIVE);
        assert_eq!(cfg.stalled_retrieval, StalledRetrieval::Abandon);
        assert!(validate_session(&cfg).is_ok());

        let d = cfg.discovery_options();
        assert_eq!(d.timeout, Duration::from_secs(4));
        assert_eq!(d.retriever.timeout, None);
    }

    #[test]
    fn password_may_contain_equals() {
        let cfg = parse_config("password = a=b=c\n");
        assert_eq!(cfg.password, "a=b=c");
    }

    #[test]
    fn rejects_short_keep_alive() {
        let cfg = ClientConfig { keep_alive: 2, ..ClientConfig::default() };
        assert!(matches!(validate_config(&cfg), Err(RoombaError::Config(_))));
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = load_config(Path::new("/nonexistent/roomba.conf")).unwrap_err();
        assert!(matches!(err, RoombaError::Config(_)));
    }
}
