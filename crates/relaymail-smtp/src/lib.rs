//! # relaymail-smtp
//!
//! A self-contained SMTP client that speaks the wire protocol directly.
//!
//! ## Features
//!
//! - **One connection per call**: `send` and `check_connection` each open,
//!   drive and close their own socket; concurrent calls never interfere
//! - **TLS support**: implicit TLS (port 465) and in-place STARTTLS upgrade
//! - **Authentication**: `AUTH LOGIN` (default) and `AUTH PLAIN`
//! - **RFC 5322 framing**: headers, Message-ID, Date, BCC kept out of headers
//! - **Per-step timeouts**: connect, TLS handshake and every command exchange
//!
//! ## Quick Start
//!
//! ```ignore
//! use relaymail_smtp::{Credentials, OutgoingMessage, SmtpTransport, TransportConfig};
//!
//! #[tokio::main]
//! async fn main() -> relaymail_smtp::Result<()> {
//!     let config = TransportConfig::builder("smtp.example.com")
//!         .port(587)
//!         .auth(Credentials::new("user@example.com", "password"))
//!         .build()?;
//!     let transport = SmtpTransport::new(config);
//!
//!     let message = OutgoingMessage::new("user@example.com", "Hello")
//!         .to("friend@example.com")
//!         .bcc("archive@example.com")
//!         .text("Hello, World!");
//!
//!     let result = transport.send(&message).await;
//!     println!("{result:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Dialogue
//!
//! ```text
//! connect ─→ greeting ─→ EHLO ─→ [STARTTLS ─→ EHLO] ─→ [AUTH]
//!         ─→ MAIL FROM ─→ RCPT TO × n ─→ DATA ─→ message ─→ QUIT
//! ```
//!
//! Any reply of 400 or above ends the call at that step.
//!
//! ## Modules
//!
//! - [`command`]: SMTP command builders
//! - [`connection`]: Streams, TLS and server capabilities
//! - [`parser`]: Response parser
//! - [`types`]: Core SMTP types (addresses, extensions, replies)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod command;
mod config;
pub mod connection;
mod error;
mod message;
pub mod parser;
mod transport;
pub mod types;

pub use config::{
    ConfigBuilder, Credentials, DEFAULT_TIMEOUT, IMPLICIT_TLS_PORT, SUBMISSION_PORT,
    TransportConfig,
};
pub use connection::ServerInfo;
pub use error::{AddressField, Error, Result};
pub use message::{Envelope, MESSAGE_ID_DOMAIN, OutgoingMessage, generate_message_id};
pub use transport::{MailTransport, SendResult, SmtpTransport};
pub use types::{Address, AuthMechanism, Extension, Reply, ReplyCode, validate_email};
