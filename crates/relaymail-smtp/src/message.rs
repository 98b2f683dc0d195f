//! Outgoing messages and RFC 5322 framing.

use std::fmt::Write;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use rand::Rng;

use crate::error::{AddressField, Error, Result};
use crate::types::Address;

/// Domain part of generated Message-IDs.
pub const MESSAGE_ID_DOMAIN: &str = "relaymail.local";

/// An email message to send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct OutgoingMessage {
    /// Sender address.
    pub from: String,
    /// Recipient addresses.
    pub to: Vec<String>,
    /// CC addresses.
    pub cc: Vec<String>,
    /// BCC addresses. Envelope only; never written to headers.
    pub bcc: Vec<String>,
    /// Reply-To address.
    pub reply_to: Option<String>,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub text: Option<String>,
    /// HTML body. Takes precedence over `text`.
    pub html: Option<String>,
}

impl OutgoingMessage {
    /// Creates a new outgoing message.
    #[must_use]
    pub fn new(from: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            subject: subject.into(),
            ..Self::default()
        }
    }

    /// Adds a recipient.
    #[must_use]
    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.to.push(recipient.into());
        self
    }

    /// Adds a CC recipient.
    #[must_use]
    pub fn cc(mut self, recipient: impl Into<String>) -> Self {
        self.cc.push(recipient.into());
        self
    }

    /// Adds a BCC recipient.
    #[must_use]
    pub fn bcc(mut self, recipient: impl Into<String>) -> Self {
        self.bcc.push(recipient.into());
        self
    }

    /// Sets the Reply-To address.
    #[must_use]
    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    /// Sets the plain text body.
    #[must_use]
    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.text = Some(body.into());
        self
    }

    /// Sets the HTML body.
    #[must_use]
    pub fn html(mut self, body: impl Into<String>) -> Self {
        self.html = Some(body.into());
        self
    }

    /// Validates every address and returns the SMTP envelope.
    ///
    /// Recipients are ordered `to`, then `cc`, then `bcc`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidField`] for the first malformed address, or
    /// [`Error::NoRecipients`] if there is nobody to deliver to.
    pub fn envelope(&self) -> Result<Envelope> {
        let from = field_address(AddressField::Sender, &self.from)?;

        if let Some(reply_to) = &self.reply_to {
            field_address(AddressField::ReplyTo, reply_to)?;
        }

        let mut recipients = Vec::with_capacity(self.to.len() + self.cc.len() + self.bcc.len());
        for (field, list) in [
            (AddressField::Recipient, &self.to),
            (AddressField::Cc, &self.cc),
            (AddressField::Bcc, &self.bcc),
        ] {
            for addr in list {
                recipients.push(field_address(field, addr)?);
            }
        }

        if recipients.is_empty() {
            return Err(Error::NoRecipients);
        }

        Ok(Envelope { from, recipients })
    }

    /// Returns true if neither body is set.
    #[must_use]
    pub const fn is_empty_body(&self) -> bool {
        self.text.is_none() && self.html.is_none()
    }

    /// Builds the RFC 5322 formatted message.
    #[must_use]
    pub fn to_rfc5322(&self, message_id: &str, date: &DateTime<Utc>) -> String {
        let mut message = String::new();

        // Headers
        let _ = write!(message, "From: {}\r\n", header_value(&self.from));

        if !self.to.is_empty() {
            let _ = write!(message, "To: {}\r\n", header_value(&self.to.join(", ")));
        }

        if !self.cc.is_empty() {
            let _ = write!(message, "Cc: {}\r\n", header_value(&self.cc.join(", ")));
        }

        if let Some(reply_to) = &self.reply_to {
            let _ = write!(message, "Reply-To: {}\r\n", header_value(reply_to));
        }

        let _ = write!(message, "Subject: {}\r\n", encode_subject(&self.subject));
        let _ = write!(message, "Date: {}\r\n", date.to_rfc2822());
        let _ = write!(message, "Message-ID: {message_id}\r\n");

        let body = if let Some(html) = &self.html {
            message.push_str("MIME-Version: 1.0\r\n");
            message.push_str("Content-Type: text/html; charset=utf-8\r\n");
            html.as_str()
        } else {
            message.push_str("Content-Type: text/plain; charset=utf-8\r\n");
            self.text.as_deref().unwrap_or_default()
        };

        // Empty line between headers and body
        message.push_str("\r\n");
        message.push_str(body);

        message
    }
}

/// Validated sender and recipients for `MAIL FROM` / `RCPT TO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Reverse path.
    pub from: Address,
    /// Forward paths, in delivery order.
    pub recipients: Vec<Address>,
}

/// Generates a Message-ID such as `<1760000000000.9f86d081884c7d65@relaymail.local>`.
///
/// Uniqueness is probabilistic: millisecond timestamp plus 64 random bits.
#[must_use]
pub fn generate_message_id() -> String {
    let token: u64 = rand::thread_rng().r#gen();
    format!(
        "<{}.{token:016x}@{MESSAGE_ID_DOMAIN}>",
        Utc::now().timestamp_millis()
    )
}

fn field_address(field: AddressField, addr: &str) -> Result<Address> {
    Address::new(addr).map_err(|_| Error::InvalidField {
        field,
        address: addr.to_string(),
    })
}

/// Folds CR and LF out of a header value.
fn header_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// RFC 2047 `B` encoding for non-ASCII subjects.
fn encode_subject(subject: &str) -> String {
    let subject = header_value(subject);
    if subject.is_ascii() {
        subject
    } else {
        format!("=?utf-8?B?{}?=", STANDARD.encode(subject.as_bytes()))
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
    use chrono::TimeZone;

    fn fixed_date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 9, 30, 0).unwrap()
    }

    fn header_block(framed: &str) -> &str {
        framed.split("\r\n\r\n").next().unwrap()
    }

    #[test]
    fn test_plain_text_framing() {
        let msg = OutgoingMessage::new("alice@example.com", "Hello")
            .to("bob@example.com")
            .text("Hi Bob");
        let framed = msg.to_rfc5322("<id@relaymail.local>", &fixed_date());
        assert_eq!(
            framed,
            "From: alice@example.com\r\n\
             To: bob@example.com\r\n\
             Subject: Hello\r\n\
             Date: Sat, 17 Oct 2026 09:30:00 +0000\r\n\
             Message-ID: <id@relaymail.local>\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             \r\n\
             Hi Bob"
        );
    }

    #[test]
    fn test_html_takes_precedence() {
        let msg = OutgoingMessage::new("alice@example.com", "Hello")
            .to("bob@example.com")
            .text("plain")
            .html("<p>rich</p>");
        let framed = msg.to_rfc5322("<id@x.y>", &fixed_date());
        assert!(framed.contains("MIME-Version: 1.0\r\nContent-Type: text/html; charset=utf-8\r\n"));
        assert!(framed.ends_with("\r\n\r\n<p>rich</p>"));
        assert!(!framed.contains("plain"));
    }

    #[test]
    fn test_header_order_with_cc_and_reply_to() {
        let msg = OutgoingMessage::new("alice@example.com", "S")
            .to("bob@example.com")
            .to("carol@example.com")
            .cc("dave@example.com")
            .reply_to("replies@example.com")
            .text("x");
        let framed = msg.to_rfc5322("<id@x.y>", &fixed_date());
        let names: Vec<&str> = header_block(&framed)
            .split("\r\n")
            .map(|line| line.split(':').next().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["From", "To", "Cc", "Reply-To", "Subject", "Date", "Message-ID", "Content-Type"]
        );
        assert!(framed.contains("To: bob@example.com, carol@example.com\r\n"));
    }

    #[test]
    fn test_bcc_never_in_headers() {
        let msg = OutgoingMessage::new("alice@example.com", "S")
            .to("bob@example.com")
            .bcc("secret@example.com")
            .text("x");
        let framed = msg.to_rfc5322("<id@x.y>", &fixed_date());
        assert!(!framed.contains("secret@example.com"));
        assert!(!framed.to_lowercase().contains("bcc"));
    }

    #[test]
    fn test_missing_body_is_empty() {
        let msg = OutgoingMessage::new("alice@example.com", "S").to("bob@example.com");
        assert!(msg.is_empty_body());
        let framed = msg.to_rfc5322("<id@x.y>", &fixed_date());
        assert!(framed.ends_with("charset=utf-8\r\n\r\n"));
    }

    #[test]
    fn test_subject_injection_is_folded() {
        let msg = OutgoingMessage::new("alice@example.com", "Hi\r\nBcc: evil@example.com")
            .to("bob@example.com");
        let framed = msg.to_rfc5322("<id@x.y>", &fixed_date());
        assert!(framed.contains("Subject: Hi  Bcc: evil@example.com\r\n"));
        assert!(!framed.contains("\r\nBcc:"));
    }

    #[test]
    fn test_non_ascii_subject_is_encoded() {
        assert_eq!(encode_subject("Grüße"), "=?utf-8?B?R3LDvMOfZQ==?=");
        assert_eq!(encode_subject("plain"), "plain");
    }

    #[test]
    fn test_envelope_order() {
        let msg = OutgoingMessage::new("alice@example.com", "S")
            .bcc("z@example.com")
            .cc("y@example.com")
            .to("x@example.com");
        let envelope = msg.envelope().unwrap();
        assert_eq!(envelope.from.as_str(), "alice@example.com");
        let rcpts: Vec<&str> = envelope.recipients.iter().map(Address::as_str).collect();
        assert_eq!(rcpts, vec!["x@example.com", "y@example.com", "z@example.com"]);
    }

    #[test]
    fn test_envelope_rejects_each_field() {
        let base = || OutgoingMessage::new("alice@example.com", "S").to("bob@example.com");

        let err = OutgoingMessage::new("alice", "S").to("bob@example.com").envelope().unwrap_err();
        assert_eq!(err.to_string(), "Invalid sender email address: alice");

        let err = base().to("nope").envelope().unwrap_err();
        assert_eq!(err.to_string(), "Invalid recipient email address: nope");

        let err = base().cc("nope@").envelope().unwrap_err();
        assert_eq!(err.to_string(), "Invalid cc email address: nope@");

        let err = base().bcc("@nope.com").envelope().unwrap_err();
        assert_eq!(err.to_string(), "Invalid bcc email address: @nope.com");

        let err = base().reply_to("x y@z.com").envelope().unwrap_err();
        assert_eq!(err.to_string(), "Invalid reply-to email address: x y@z.com");
    }

    #[test]
    fn test_envelope_requires_recipient() {
        let err = OutgoingMessage::new("alice@example.com", "S").envelope().unwrap_err();
        assert!(matches!(err, Error::NoRecipients));
    }

    #[test]
    fn test_bcc_only_is_deliverable() {
        let msg = OutgoingMessage::new("alice@example.com", "S").bcc("hidden@example.com");
        assert_eq!(msg.envelope().unwrap().recipients.len(), 1);
    }

    #[test]
    fn test_message_id_shape() {
        let id = generate_message_id();
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@relaymail.local>"));
        let token = id.trim_start_matches('<').split('@').next().unwrap();
        let (millis, random) = token.split_once('.').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(random.len(), 16);
        assert_ne!(id, generate_message_id());
    }
}
