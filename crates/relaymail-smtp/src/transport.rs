//! The SMTP transport client.
//!
//! Every call opens its own connection, runs the dialogue to completion or
//! first failure, and closes it again. Nothing is pooled or shared between
//! calls.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::connection::create_tls_connector;
use crate::connection::session::{self, Session};
use crate::error::Result;
use crate::message::{OutgoingMessage, generate_message_id};
use crate::types::validate_email;

/// Outcome of [`SmtpTransport::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SendResult {
    /// True if the server accepted the message.
    pub success: bool,
    /// Generated Message-ID, on success.
    pub message_id: Option<String>,
    /// Diagnostic from the first failing step, on failure.
    pub error: Option<String>,
}

impl SendResult {
    /// A successful delivery.
    #[must_use]
    pub fn sent(message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message_id: Some(message_id.into()),
            error: None,
        }
    }

    /// A failed delivery.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(error.into()),
        }
    }
}

impl From<Result<String>> for SendResult {
    fn from(result: Result<String>) -> Self {
        match result {
            Ok(message_id) => Self::sent(message_id),
            Err(e) => Self::failed(e.to_string()),
        }
    }
}

/// What a provider layer needs from a mail transport.
///
/// Implementations never fail outward: errors come back inside
/// [`SendResult`] or as `false`.
pub trait MailTransport {
    /// Sends a message.
    fn send(&self, message: &OutgoingMessage) -> impl Future<Output = SendResult> + Send;

    /// Returns true if the server can be reached and the credentials work.
    fn check_connection(&self) -> impl Future<Output = bool> + Send;

    /// Syntactic address check; no network access.
    fn validate_email(&self, address: &str) -> bool {
        validate_email(address)
    }
}

/// SMTP client speaking the wire protocol directly.
///
/// Cheap to clone; clones share the immutable configuration.
#[derive(Clone)]
pub struct SmtpTransport {
    config: Arc<TransportConfig>,
    connector: TlsConnector,
}

impl std::fmt::Debug for SmtpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SmtpTransport {
    /// Creates a transport for `config`.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        let connector = create_tls_connector(config.accept_invalid_certs);
        Self {
            config: Arc::new(config),
            connector,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Syntactic address check; no network access.
    #[must_use]
    pub fn validate_email(&self, address: &str) -> bool {
        validate_email(address)
    }

    /// Connects, greets, upgrades and authenticates, then quits.
    ///
    /// # Errors
    ///
    /// Returns the first connection, TLS, protocol or timeout error.
    pub async fn verify(&self) -> Result<()> {
        let session = Session::open(&self.config, &self.connector).await?;
        let session = session.run(session::handshake(&self.config)).await?;
        debug!(
            server = %session.server_info().hostname,
            tls = session.is_tls(),
            "handshake complete"
        );
        session.quit().await;
        Ok(())
    }

    /// Returns true if [`verify`](Self::verify) succeeds. Failures are logged.
    pub async fn check_connection(&self) -> bool {
        match self.verify().await {
            Ok(()) => {
                info!(addr = %self.config.address(), "SMTP connection verified");
                true
            }
            Err(e) => {
                warn!(addr = %self.config.address(), error = %e, "SMTP connection check failed");
                false
            }
        }
    }

    /// Sends a message and returns its Message-ID.
    ///
    /// Addresses are validated before any socket is opened.
    ///
    /// # Errors
    ///
    /// Returns a validation error, or the first connection, TLS, protocol or
    /// timeout error of the dialogue.
    pub async fn deliver(&self, message: &OutgoingMessage) -> Result<String> {
        let envelope = message.envelope()?;
        if message.is_empty_body() {
            warn!(subject = %message.subject, "message has neither text nor html body");
        }

        let message_id = generate_message_id();
        let framed = message.to_rfc5322(&message_id, &Utc::now());
        let payload = session::encode_data(&framed);

        let mut steps = session::handshake(&self.config);
        steps.extend(session::transaction(&envelope, payload));

        let session = Session::open(&self.config, &self.connector).await?;
        let session = session.run(steps).await?;
        session.quit().await;

        info!(
            message_id = %message_id,
            recipients = envelope.recipients.len(),
            "message accepted"
        );
        Ok(message_id)
    }

    /// Sends a message. Never fails outward; see [`SendResult`].
    pub async fn send(&self, message: &OutgoingMessage) -> SendResult {
        let result = self.deliver(message).await;
        if let Err(e) = &result {
            warn!(addr = %self.config.address(), error = %e, "send failed");
        }
        result.into()
    }
}

impl MailTransport for SmtpTransport {
    fn send(&self, message: &OutgoingMessage) -> impl Future<Output = SendResult> + Send {
        Self::send(self, message)
    }

    fn check_connection(&self) -> impl Future<Output = bool> + Send {
        Self::check_connection(self)
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
    clippy::similar_names,
)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_send_result_from_ok() {
        let result = SendResult::from(Ok("<id@relaymail.local>".to_string()));
        assert!(result.success);
        assert_eq!(result.message_id.as_deref(), Some("<id@relaymail.local>"));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_send_result_from_err() {
        let result = SendResult::from(Err(Error::smtp_error(550, "550 no such user")));
        assert!(!result.success);
        assert!(result.message_id.is_none());
        assert_eq!(result.error.as_deref(), Some("SMTP Error 550: 550 no such user"));
    }

    #[test]
    fn test_trait_default_validate_email() {
        let transport = SmtpTransport::new(
            TransportConfig::builder("smtp.example.com").build().unwrap(),
        );
        assert!(MailTransport::validate_email(&transport, "user@domain.com"));
        assert!(!transport.validate_email("user@"));
        assert_eq!(transport.config().port, 587);
    }
}
