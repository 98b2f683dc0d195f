//! Error types for SMTP operations.

use std::fmt;
use std::io;
use std::time::Duration;

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Message field an address was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressField {
    /// `From`.
    Sender,
    /// `To`.
    Recipient,
    /// `Cc`.
    Cc,
    /// `Bcc`.
    Bcc,
    /// `Reply-To`.
    ReplyTo,
}

impl fmt::Display for AddressField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sender => "sender",
            Self::Recipient => "recipient",
            Self::Cc => "cc",
            Self::Bcc => "bcc",
            Self::ReplyTo => "reply-to",
        })
    }
}

/// SMTP error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TCP connect failed.
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        /// `host:port` that was dialed.
        addr: String,
        /// Underlying socket error.
        source: io::Error,
    },

    /// TLS handshake failed (implicit TLS or STARTTLS).
    #[error("TLS handshake failed: {0}")]
    Tls(io::Error),

    /// Host cannot be used as a TLS server name.
    #[error("Invalid hostname: {0}")]
    InvalidHostname(String),

    /// Server closed the connection mid-dialogue.
    #[error("Connection closed by server")]
    ConnectionClosed,

    /// A dialogue step did not finish in time.
    #[error("Timed out after {}ms waiting for {step}", after.as_millis())]
    Timeout {
        /// Step that timed out.
        step: &'static str,
        /// Configured timeout.
        after: Duration,
    },

    /// Server returned an error reply (4xx or 5xx).
    #[error("SMTP Error {code}: {response}")]
    Smtp {
        /// Reply code (e.g., 550).
        code: u16,
        /// Raw reply as received.
        response: String,
    },

    /// Protocol error (malformed or unexpected reply).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid email address.
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    /// Invalid address in a message field.
    #[error("Invalid {field} email address: {address}")]
    InvalidField {
        /// Field the address came from.
        field: AddressField,
        /// Offending address.
        address: String,
    },

    /// Message has no envelope recipients.
    #[error("No recipients specified")]
    NoRecipients,

    /// Message exceeds the size advertised by the server.
    #[error("Message exceeds size limit: {size} bytes (server allows {limit})")]
    MessageTooLarge {
        /// Framed message size.
        size: usize,
        /// Advertised `SIZE` limit.
        limit: usize,
    },

    /// Configuration rejected by the builder.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Creates an SMTP error from a reply code and the raw reply.
    #[must_use]
    pub fn smtp_error(code: u16, response: impl Into<String>) -> Self {
        Self::Smtp {
            code,
            response: response.into(),
        }
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Smtp { code, .. } if *code >= 500 && *code < 600)
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Smtp { code, .. } if *code >= 400 && *code < 500)
    }

    /// Returns true if a step ran out of time.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the error was raised before any network I/O.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidAddress(_)
                | Self::InvalidField { .. }
                | Self::NoRecipients
                | Self::InvalidConfig(_)
        )
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

    #[test]
    fn smtp_error_display_embeds_raw_reply() {
        let err = Error::smtp_error(550, "550 5.1.1 No such user");
        assert_eq!(err.to_string(), "SMTP Error 550: 550 5.1.1 No such user");
        assert!(err.is_permanent());
        assert!(!err.is_transient());
    }

    #[test]
    fn transient_classification() {
        let err = Error::smtp_error(451, "451 try later");
        assert!(err.is_transient());
        assert!(!err.is_permanent());
    }

    #[test]
    fn timeout_names_step() {
        let err = Error::Timeout {
            step: "RCPT TO",
            after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "Timed out after 1500ms waiting for RCPT TO");
        assert!(err.is_timeout());
    }

    #[test]
    fn invalid_field_display() {
        let err = Error::InvalidField {
            field: AddressField::Recipient,
            address: "nobody".into(),
        };
        assert_eq!(err.to_string(), "Invalid recipient email address: nobody");
        assert!(err.is_validation());

        let err = Error::InvalidField {
            field: AddressField::Sender,
            address: "@x.org".into(),
        };
        assert_eq!(err.to_string(), "Invalid sender email address: @x.org");
    }

    #[test]
    fn network_errors_are_not_validation() {
        assert!(!Error::ConnectionClosed.is_validation());
        assert!(!Error::smtp_error(550, "550 no").is_validation());
    }
}
