//! # Mesh Configuration
//!
//! [`MeshOptions`] is the raw option surface (camelCase keys, as accepted
//! from JSON or TOML). [`MeshConfiguration::resolve`] validates it, fills in
//! defaults, generates a secret and self-signed TLS material when none are
//! given, and produces the immutable snapshot a node runs with until the
//! next `configure`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_rustls::TlsAcceptor;

use crate::bus::{EventFilter, MATCH_ALL};
use crate::crypto::{CipherAlgorithm, TlsMaterial};
use crate::error::{MeshError, MeshResult};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 7527;
pub const DEFAULT_CONNECT_HOST: &str = "localhost";

/// Random bytes per challenge nonce.
pub const DEFAULT_CHALLENGE_SIZE: usize = 32;
pub const MIN_CHALLENGE_SIZE: usize = 8;
pub const MAX_CHALLENGE_SIZE: usize = 1024;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// What a node does with the mesh.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full bidirectional relay; the only role that may listen.
    #[default]
    Peer,
    /// Sends events, never delivers inbound events locally.
    Producer,
    /// Receives events matching its declared pattern/condition, never relays.
    Consumer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Peer => "peer",
            Role::Producer => "producer",
            Role::Consumer => "consumer",
        }
    }

    pub fn can_listen(self) -> bool {
        self == Role::Peer
    }

    /// Whether inbound events reach the local bus.
    pub fn delivers_inbound(self) -> bool {
        self != Role::Producer
    }

    /// Whether local events are relayed out over authenticated links.
    pub fn relays_outbound(self) -> bool {
        self != Role::Consumer
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "peer" => Ok(Role::Peer),
            "producer" => Ok(Role::Producer),
            "consumer" => Ok(Role::Consumer),
            other => Err(MeshError::Config(format!("unknown node role: {other}"))),
        }
    }
}

/// Raw configuration options. Every field is optional.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeshOptions {
    pub host: Option<String>,
    /// Listening port. `0` binds an ephemeral port.
    pub port: Option<u16>,
    /// Shared mesh secret. Generated when absent, which only makes sense for
    /// a node that is told its secret out of band.
    pub secret: Option<String>,
    /// PEM private key path. Requires `certificate`.
    pub key: Option<PathBuf>,
    #[serde(alias = "cert")]
    pub certificate: Option<PathBuf>,
    pub algorithm: Option<String>,
    pub keep_alive: Option<bool>,
    pub challenge_size: Option<usize>,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval: Option<u64>,
    /// Handshake deadline in milliseconds. No deadline when absent.
    pub handshake_timeout: Option<u64>,
    pub peer: bool,
    pub consumer: bool,
    pub producer: bool,
    pub pattern: Option<String>,
    #[serde(alias = "filter")]
    pub condition: Option<Value>,
}

impl MeshOptions {
    /// Read options from a TOML file.
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    fn role(&self) -> MeshResult<Role> {
        let selected = [
            (self.peer, Role::Peer),
            (self.producer, Role::Producer),
            (self.consumer, Role::Consumer),
        ]
        .into_iter()
        .filter(|(on, _)| *on)
        .map(|(_, role)| role)
        .collect::<Vec<_>>();

        match selected.as_slice() {
            [] => Ok(Role::Peer),
            [role] => Ok(*role),
            _ => Err(MeshError::Config(
                "at most one of peer, producer, consumer may be set".into(),
            )),
        }
    }
}

/// Validated configuration snapshot.
pub struct MeshConfiguration {
    pub host: String,
    pub port: u16,
    secret: String,
    tls: TlsMaterial,
    acceptor: TlsAcceptor,
    pub algorithm: CipherAlgorithm,
    pub keep_alive: bool,
    pub challenge_size: usize,
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Option<Duration>,
    pub role: Role,
    pub pattern: String,
    pub condition: Value,
}

impl MeshConfiguration {
    /// Validate `options` and derive defaults. `generate_secret` is called
    /// only when no secret is configured.
    pub fn resolve(
        options: MeshOptions,
        generate_secret: impl FnOnce() -> String,
    ) -> MeshResult<Self> {
        let role = options.role()?;

        let host = options
            .host
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = options.port.unwrap_or(DEFAULT_PORT);

        let secret = match options.secret {
            Some(secret) if secret.is_empty() => {
                return Err(MeshError::Config("secret must not be empty".into()));
            }
            Some(secret) => secret,
            None => generate_secret(),
        };

        let algorithm = match options.algorithm.as_deref() {
            Some(name) => name.parse()?,
            None => CipherAlgorithm::default(),
        };

        let challenge_size = options.challenge_size.unwrap_or(DEFAULT_CHALLENGE_SIZE);
        if !(MIN_CHALLENGE_SIZE..=MAX_CHALLENGE_SIZE).contains(&challenge_size) {
            return Err(MeshError::Config(format!(
                "challengeSize must be between {MIN_CHALLENGE_SIZE} and {MAX_CHALLENGE_SIZE}, got {challenge_size}"
            )));
        }

        let heartbeat_interval = match options.heartbeat_interval {
            Some(0) => {
                return Err(MeshError::Config("heartbeatInterval must be positive".into()));
            }
            Some(ms) => Duration::from_millis(ms),
            None => DEFAULT_HEARTBEAT_INTERVAL,
        };

        let handshake_timeout = match options.handshake_timeout {
            Some(0) | None => None,
            Some(ms) => Some(Duration::from_millis(ms)),
        };

        let pattern = options.pattern.unwrap_or_else(|| MATCH_ALL.to_string());
        let condition = options.condition.unwrap_or(Value::Null);
        // Reject a pattern/condition that could never be evaluated.
        EventFilter::new(&pattern, Some(&condition))?;

        let tls = match (&options.key, &options.certificate) {
            (Some(key), Some(cert)) => TlsMaterial::load(key, cert),
            (None, None) => TlsMaterial::self_signed(std::slice::from_ref(&host)),
            _ => {
                return Err(MeshError::Config(
                    "key and certificate must be configured together".into(),
                ));
            }
        }
        .map_err(|e| MeshError::Tls(format!("{e:#}")))?;
        let acceptor = tls.acceptor().map_err(|e| MeshError::Tls(format!("{e:#}")))?;

        Ok(Self {
            host,
            port,
            secret,
            tls,
            acceptor,
            algorithm,
            keep_alive: options.keep_alive.unwrap_or(true),
            challenge_size,
            heartbeat_interval,
            handshake_timeout,
            role,
            pattern,
            condition,
        })
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn tls(&self) -> &TlsMaterial {
        &self.tls
    }

    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }

    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Secret-free view for lifecycle events and logs.
    pub fn summary(&self) -> Value {
        json!({
            "host": self.host,
            "port": self.port,
            "algorithm": self.algorithm.name(),
            "keepAlive": self.keep_alive,
            "challengeSize": self.challenge_size,
            "heartbeatInterval": self.heartbeat_interval.as_millis() as u64,
            "node": self.role,
            "pattern": self.pattern,
            "condition": self.condition,
            "selfSigned": self.tls.is_self_signed(),
        })
    }
}

impl fmt::Debug for MeshConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshConfiguration")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secret", &"<redacted>")
            .field("tls", &self.tls)
            .field("algorithm", &self.algorithm)
            .field("keep_alive", &self.keep_alive)
            .field("challenge_size", &self.challenge_size)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("role", &self.role)
            .field("pattern", &self.pattern)
            .field("condition", &self.condition)
            .finish()
    }
}

/// Per-dial options. Unset fields fall back to the node configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    /// Require the server certificate to chain to the local certificate.
    pub reject_unauthorized: Option<bool>,
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            ..Default::default()
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn reject_unauthorized(mut self, reject: bool) -> Self {
        self.reject_unauthorized = Some(reject);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(options: MeshOptions) -> MeshResult<MeshConfiguration> {
        MeshConfiguration::resolve(options, || "generated-secret".to_string())
    }

    #[test]
    fn defaults() {
        let config = resolve(MeshOptions::default()).unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.secret(), "generated-secret");
        assert_eq!(config.algorithm, CipherAlgorithm::ChaCha20Poly1305);
        assert!(config.keep_alive);
        assert_eq!(config.challenge_size, DEFAULT_CHALLENGE_SIZE);
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(config.handshake_timeout, None);
        assert_eq!(config.role, Role::Peer);
        assert_eq!(config.pattern, MATCH_ALL);
        assert!(config.tls().is_self_signed());
    }

    #[test]
    fn explicit_secret_kept() {
        let config = resolve(MeshOptions {
            secret: Some("s3cret".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(config.secret(), "s3cret");
        assert!(!format!("{config:?}").contains("s3cret"));
        assert!(!config.summary().to_string().contains("s3cret"));
    }

    #[test]
    fn role_selectors() {
        let producer = resolve(MeshOptions { producer: true, ..Default::default() }).unwrap();
        assert_eq!(producer.role, Role::Producer);

        let consumer = resolve(MeshOptions { consumer: true, ..Default::default() }).unwrap();
        assert_eq!(consumer.role, Role::Consumer);

        let conflicting = resolve(MeshOptions {
            consumer: true,
            producer: true,
            ..Default::default()
        });
        assert!(matches!(conflicting, Err(MeshError::Config(_))));
    }

    #[test]
    fn role_capabilities() {
        assert!(Role::Peer.can_listen());
        assert!(!Role::Producer.can_listen());
        assert!(!Role::Consumer.can_listen());
        assert!(!Role::Producer.delivers_inbound());
        assert!(!Role::Consumer.relays_outbound());
        assert_eq!("Consumer".parse::<Role>().unwrap(), Role::Consumer);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(resolve(MeshOptions { algorithm: Some("aes-256-cbc".into()), ..Default::default() }).is_err());
        assert!(resolve(MeshOptions { challenge_size: Some(2), ..Default::default() }).is_err());
        assert!(resolve(MeshOptions { heartbeat_interval: Some(0), ..Default::default() }).is_err());
        assert!(resolve(MeshOptions { secret: Some(String::new()), ..Default::default() }).is_err());
        assert!(resolve(MeshOptions { pattern: Some("/(/".into()), ..Default::default() }).is_err());
    }

    #[test]
    fn key_without_certificate_rejected() {
        let result = resolve(MeshOptions {
            key: Some(PathBuf::from("key.pem")),
            ..Default::default()
        });
        assert!(matches!(result, Err(MeshError::Config(_))));
    }

    #[test]
    fn unreadable_pem_is_tls_error() {
        let result = resolve(MeshOptions {
            key: Some(PathBuf::from("/nonexistent/key.pem")),
            certificate: Some(PathBuf::from("/nonexistent/cert.pem")),
            ..Default::default()
        });
        assert!(matches!(result, Err(MeshError::Tls(_))));
    }

    #[test]
    fn camel_case_keys_and_aliases() {
        let options: MeshOptions = serde_json::from_value(serde_json::json!({
            "host": "127.0.0.1",
            "port": 7537,
            "secret": "x",
            "cert": "/tmp/cert.pem",
            "keepAlive": false,
            "challengeSize": 16,
            "heartbeatInterval": 250,
            "handshakeTimeout": 1000,
            "consumer": true,
            "pattern": "sensor:*",
            "filter": { "data.unit": "celsius" }
        }))
        .unwrap();

        assert_eq!(options.certificate, Some(PathBuf::from("/tmp/cert.pem")));
        assert_eq!(options.keep_alive, Some(false));
        assert_eq!(options.challenge_size, Some(16));
        assert_eq!(options.heartbeat_interval, Some(250));
        assert!(options.consumer);
        assert!(options.condition.is_some());
    }

    #[test]
    fn toml_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.toml");
        std::fs::write(
            &path,
            "host = \"127.0.0.1\"\nport = 7600\nsecret = \"abc\"\nproducer = true\nheartbeatInterval = 5000\n",
        )
        .unwrap();

        let options = MeshOptions::from_toml_file(&path).unwrap();
        let config = resolve(options).unwrap();
        assert_eq!(config.port, 7600);
        assert_eq!(config.role, Role::Producer);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(5000));
    }

    #[test]
    fn durations_and_bind_addr() {
        let config = resolve(MeshOptions {
            host: Some("::1".into()),
            port: Some(9000),
            handshake_timeout: Some(1500),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(config.handshake_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.bind_addr(), "[::1]:9000");
    }

    #[test]
    fn connect_options_never_serialize_secret() {
        let options = ConnectOptions::new("localhost", 1).with_secret("hidden");
        let value = serde_json::to_value(&options).unwrap();
        assert!(!value.to_string().contains("hidden"));
        assert_eq!(value["port"], 1);
    }
}
