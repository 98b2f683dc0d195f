//! Transport configuration types.

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::AuthMechanism;

/// Per-step timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Port conventionally used for implicit TLS (SMTPS).
pub const IMPLICIT_TLS_PORT: u16 = 465;

/// Port conventionally used for submission with STARTTLS.
pub const SUBMISSION_PORT: u16 = 587;

/// SMTP credentials.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Credentials {
    /// Username sent during AUTH.
    pub user: String,
    /// Password sent during AUTH.
    pub pass: String,
    /// SASL mechanism to use.
    #[cfg_attr(feature = "serde", serde(default))]
    pub mechanism: AuthMechanism,
}

impl Credentials {
    /// Creates credentials for `AUTH LOGIN`.
    #[must_use]
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            pass: pass.into(),
            mechanism: AuthMechanism::Login,
        }
    }

    /// Switches the SASL mechanism.
    #[must_use]
    pub const fn with_mechanism(mut self, mechanism: AuthMechanism) -> Self {
        self.mechanism = mechanism;
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

/// SMTP transport configuration.
///
/// Immutable once built; every call on the transport reads from the same
/// instance.
///
/// With the `serde` feature, deserialization goes through
/// [`ConfigBuilder::build`]: omitted fields take the builder defaults and
/// invalid values are rejected.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "RawConfig"))]
pub struct TransportConfig {
    /// Server hostname. Also used as the TLS server name (SNI).
    pub host: String,
    /// Server port.
    pub port: u16,
    /// TLS from the first byte (implicit TLS).
    pub secure: bool,
    /// Credentials; AUTH is skipped when absent.
    pub auth: Option<Credentials>,
    /// Timeout applied to connect, TLS handshake and each command exchange.
    pub timeout: Duration,
    /// Upgrade plaintext connections with STARTTLS.
    pub starttls: bool,
    /// Accept any server certificate, including self-signed ones.
    pub accept_invalid_certs: bool,
    /// Name announced in EHLO.
    pub client_name: String,
}

impl TransportConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(host: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(host)
    }

    /// Returns `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns true if the dialogue issues STARTTLS after the first EHLO.
    #[must_use]
    pub fn wants_starttls(&self) -> bool {
        self.starttls && !self.secure && self.port != IMPLICIT_TLS_PORT
    }
}

/// Builder for transport configuration.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    host: String,
    port: Option<u16>,
    secure: bool,
    auth: Option<Credentials>,
    timeout: Duration,
    starttls: bool,
    accept_invalid_certs: bool,
    client_name: String,
}

impl ConfigBuilder {
    /// Creates a new builder with the given hostname.
    ///
    /// Defaults: plaintext + STARTTLS on port 587, 30 s timeout, no AUTH.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            secure: false,
            auth: None,
            timeout: DEFAULT_TIMEOUT,
            starttls: true,
            accept_invalid_certs: false,
            client_name: "localhost".to_string(),
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Enables or disables implicit TLS.
    #[must_use]
    pub const fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Sets the credentials used for AUTH.
    #[must_use]
    pub fn auth(mut self, credentials: Credentials) -> Self {
        self.auth = Some(credentials);
        self
    }

    /// Sets the per-step timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the per-step timeout in milliseconds.
    #[must_use]
    pub const fn timeout_millis(self, millis: u64) -> Self {
        self.timeout(Duration::from_millis(millis))
    }

    /// Enables or disables the STARTTLS upgrade on plaintext connections.
    #[must_use]
    pub const fn starttls(mut self, starttls: bool) -> Self {
        self.starttls = starttls;
        self
    }

    /// Disables certificate verification. Only for relays with self-signed
    /// certificates on trusted networks.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Sets the name announced in EHLO.
    #[must_use]
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an empty host, port 0, a zero
    /// timeout, or an empty client name.
    pub fn build(self) -> Result<TransportConfig> {
        let port = self.port.unwrap_or(if self.secure {
            IMPLICIT_TLS_PORT
        } else {
            SUBMISSION_PORT
        });

        if self.host.trim().is_empty() {
            return Err(Error::InvalidConfig("host is empty".into()));
        }
        if port == 0 {
            return Err(Error::InvalidConfig("port must be 1-65535".into()));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "timeout must be greater than zero".into(),
            ));
        }
        if self.client_name.trim().is_empty() {
            return Err(Error::InvalidConfig("client name is empty".into()));
        }

        Ok(TransportConfig {
            host: self.host,
            port,
            secure: self.secure,
            auth: self.auth,
            timeout: self.timeout,
            starttls: self.starttls,
            accept_invalid_certs: self.accept_invalid_certs,
            client_name: self.client_name,
        })
    }
}

/// Wire form of [`TransportConfig`]; every field but `host` is optional.
#[cfg(feature = "serde")]
#[derive(serde::Deserialize)]
struct RawConfig {
    host: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    secure: bool,
    #[serde(default)]
    auth: Option<Credentials>,
    #[serde(default)]
    timeout: Option<Duration>,
    #[serde(default)]
    starttls: Option<bool>,
    #[serde(default)]
    accept_invalid_certs: bool,
    #[serde(default)]
    client_name: Option<String>,
}

#[cfg(feature = "serde")]
impl TryFrom<RawConfig> for TransportConfig {
    type Error = Error;

    fn try_from(raw: RawConfig) -> Result<Self> {
        let mut builder = ConfigBuilder::new(raw.host)
            .secure(raw.secure)
            .accept_invalid_certs(raw.accept_invalid_certs);
        if let Some(port) = raw.port {
            builder = builder.port(port);
        }
        if let Some(auth) = raw.auth {
            builder = builder.auth(auth);
        }
        if let Some(timeout) = raw.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(starttls) = raw.starttls {
            builder = builder.starttls(starttls);
        }
        if let Some(client_name) = raw.client_name {
            builder = builder.client_name(client_name);
        }
        builder.build()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::builder("smtp.example.com").build().unwrap();
        assert_eq!(config.host, "smtp.example.com");
        assert_eq!(config.port, 587);
        assert!(!config.secure);
        assert!(config.auth.is_none());
        assert_eq!(config.timeout, Duration::from_millis(30_000));
        assert_eq!(config.client_name, "localhost");
        assert!(!config.accept_invalid_certs);
        assert!(config.wants_starttls());
    }

    #[test]
    fn test_secure_defaults_to_465() {
        let config = TransportConfig::builder("smtp.example.com")
            .secure(true)
            .build()
            .unwrap();
        assert_eq!(config.port, 465);
        assert!(!config.wants_starttls());
    }

    #[test]
    fn test_plaintext_on_465_skips_starttls() {
        let config = TransportConfig::builder("smtp.example.com")
            .port(465)
            .build()
            .unwrap();
        assert!(!config.secure);
        assert!(!config.wants_starttls());
    }

    #[test]
    fn test_starttls_can_be_disabled() {
        let config = TransportConfig::builder("localhost")
            .port(2525)
            .starttls(false)
            .build()
            .unwrap();
        assert!(!config.wants_starttls());
        assert_eq!(config.address(), "localhost:2525");
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = TransportConfig::builder("smtp.example.com")
            .timeout_millis(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_empty_host_and_port_rejected() {
        assert!(TransportConfig::builder("  ").build().is_err());
        assert!(TransportConfig::builder("h").port(0).build().is_err());
        assert!(TransportConfig::builder("h").client_name("").build().is_err());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("alice", "hunter2");
        let debug = format!("{creds:?}");
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
        assert_eq!(creds.mechanism, AuthMechanism::Login);
        assert_eq!(
            creds.with_mechanism(AuthMechanism::Plain).mechanism,
            AuthMechanism::Plain
        );
    }

    #[cfg(feature = "serde")]
    mod serde_tests {
        use super::*;

        #[test]
        fn test_deserialize_applies_builder_defaults() {
            let config: TransportConfig =
                serde_json::from_str(r#"{"host": "smtp.example.com"}"#).unwrap();
            assert_eq!(config.port, 587);
            assert_eq!(config.timeout, DEFAULT_TIMEOUT);
            assert!(config.starttls);
            assert!(!config.accept_invalid_certs);
            assert_eq!(config.client_name, "localhost");
            assert!(config.auth.is_none());
        }

        #[test]
        fn test_deserialize_secure_defaults_to_465() {
            let config: TransportConfig = serde_json::from_str(
                r#"{"host": "smtp.example.com", "secure": true,
                    "auth": {"user": "alice", "pass": "secret"}}"#,
            )
            .unwrap();
            assert_eq!(config.port, 465);
            assert_eq!(config.auth.unwrap().mechanism, AuthMechanism::Login);
        }

        #[test]
        fn test_deserialize_rejects_invalid_values() {
            let zero_timeout = r#"{"host": "smtp.example.com",
                "timeout": {"secs": 0, "nanos": 0}}"#;
            let err = serde_json::from_str::<TransportConfig>(zero_timeout).unwrap_err();
            assert!(err.to_string().contains("timeout must be greater than zero"));

            assert!(serde_json::from_str::<TransportConfig>(r#"{"host": ""}"#).is_err());
            assert!(
                serde_json::from_str::<TransportConfig>(r#"{"host": "h", "port": 0}"#).is_err()
            );
        }

        #[test]
        fn test_serialized_config_round_trips() {
            let config = TransportConfig::builder("smtp.example.com")
                .port(2525)
                .timeout_millis(1_500)
                .starttls(false)
                .build()
                .unwrap();
            let json = serde_json::to_string(&config).unwrap();
            let back: TransportConfig = serde_json::from_str(&json).unwrap();
            assert_eq!(back.port, 2525);
            assert_eq!(back.timeout, Duration::from_millis(1_500));
            assert!(!back.starttls);
        }
    }
}
