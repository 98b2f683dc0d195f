//! One SMTP dialogue, driven as a flat list of steps.
//!
//! The plan is built up front (`handshake` + `transaction`) and executed by
//! [`Session::run`], which stops at the first failing step. Dropping a
//! [`Session`] closes its socket.

use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::ServerInfo;
use super::stream::{self, SmtpStream};
use super::tls::server_name;
use crate::command::Command;
use crate::config::{Credentials, TransportConfig};
use crate::error::{Error, Result};
use crate::message::Envelope;
use crate::parser::{is_last_reply_line, parse_reply};
use crate::types::{Address, AuthMechanism, Reply};

/// Upper bound on lines in one reply.
const MAX_REPLY_LINES: usize = 512;

/// One command/reply exchange.
pub enum Step {
    /// `EHLO <client_name>`.
    Ehlo,
    /// `STARTTLS`, followed by the in-place TLS upgrade.
    StartTls,
    /// `AUTH LOGIN`.
    AuthLogin,
    /// Base64 username answering the first LOGIN challenge.
    AuthUsername(String),
    /// Base64 password answering the second LOGIN challenge.
    AuthPassword(String),
    /// `AUTH PLAIN <initial response>`.
    AuthPlain(String),
    /// `MAIL FROM:<from>`; `size` is the framed payload length.
    MailFrom {
        /// Reverse path.
        from: Address,
        /// Payload size checked against the server's SIZE limit.
        size: usize,
    },
    /// `RCPT TO:<to>`.
    RcptTo(Address),
    /// `DATA`.
    Data,
    /// Dot-stuffed payload including the terminating `.` line.
    Message(Vec<u8>),
    /// `QUIT`.
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    /// 2xx
    Completion,
    /// 3xx
    Intermediate,
}

impl Step {
    /// Name used in logs and timeout errors.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ehlo => "EHLO",
            Self::StartTls => "STARTTLS",
            Self::AuthLogin => "AUTH LOGIN",
            Self::AuthUsername(_) => "AUTH username",
            Self::AuthPassword(_) => "AUTH password",
            Self::AuthPlain(_) => "AUTH PLAIN",
            Self::MailFrom { .. } => "MAIL FROM",
            Self::RcptTo(_) => "RCPT TO",
            Self::Data => "DATA",
            Self::Message(_) => "message body",
            Self::Quit => "QUIT",
        }
    }

    const fn expect(&self) -> Expect {
        match self {
            Self::AuthLogin | Self::AuthUsername(_) | Self::Data => Expect::Intermediate,
            _ => Expect::Completion,
        }
    }

    fn wire(&self, client_name: &str) -> Cow<'_, [u8]> {
        let command = match self {
            Self::Message(payload) => return Cow::Borrowed(payload),
            Self::Ehlo => Command::Ehlo {
                hostname: client_name.to_string(),
            },
            Self::StartTls => Command::StartTls,
            Self::AuthLogin => Command::Auth {
                mechanism: AuthMechanism::Login,
                initial_response: None,
            },
            Self::AuthUsername(line) | Self::AuthPassword(line) => {
                Command::AuthResponse(line.clone())
            }
            Self::AuthPlain(initial) => Command::Auth {
                mechanism: AuthMechanism::Plain,
                initial_response: Some(initial.clone()),
            },
            Self::MailFrom { from, .. } => Command::MailFrom { from: from.clone() },
            Self::RcptTo(to) => Command::RcptTo { to: to.clone() },
            Self::Data => Command::Data,
            Self::Quit => Command::Quit,
        };
        Cow::Owned(command.serialize())
    }
}

/// Steps up to and including authentication.
pub fn handshake(config: &TransportConfig) -> Vec<Step> {
    let mut steps = vec![Step::Ehlo];

    if config.wants_starttls() {
        steps.push(Step::StartTls);
        steps.push(Step::Ehlo);
    }

    if let Some(credentials) = &config.auth {
        steps.extend(auth(credentials));
    }

    steps
}

fn auth(credentials: &Credentials) -> Vec<Step> {
    match credentials.mechanism {
        AuthMechanism::Login => vec![
            Step::AuthLogin,
            Step::AuthUsername(STANDARD.encode(credentials.user.as_bytes())),
            Step::AuthPassword(STANDARD.encode(credentials.pass.as_bytes())),
        ],
        AuthMechanism::Plain => {
            let initial = format!("\0{}\0{}", credentials.user, credentials.pass);
            vec![Step::AuthPlain(STANDARD.encode(initial.as_bytes()))]
        }
    }
}

/// Steps from `MAIL FROM` through the end of the payload.
pub fn transaction(envelope: &Envelope, payload: Vec<u8>) -> Vec<Step> {
    let mut steps = Vec::with_capacity(envelope.recipients.len() + 3);
    steps.push(Step::MailFrom {
        from: envelope.from.clone(),
        size: payload.len(),
    });
    steps.extend(envelope.recipients.iter().cloned().map(Step::RcptTo));
    steps.push(Step::Data);
    steps.push(Step::Message(payload));
    steps
}

/// Encodes a message for the DATA phase.
///
/// Normalizes line endings to CRLF, doubles leading dots, and appends the
/// terminating `.` line.
pub fn encode_data(message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 64);

    let body = message.strip_suffix("\r\n").or_else(|| message.strip_suffix('\n'));
    for line in body.unwrap_or(message).split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with('.') {
            out.push(b'.');
        }
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b".\r\n");
    out
}

/// Races `fut` against `after`.
async fn within<T>(
    after: Duration,
    step: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| Error::Timeout { step, after })?
}

/// A live connection for one call.
pub struct Session<'a> {
    stream: SmtpStream,
    server_info: ServerInfo,
    config: &'a TransportConfig,
    connector: &'a TlsConnector,
}

impl<'a> Session<'a> {
    /// Connects (with TLS if `secure`) and reads the greeting.
    pub async fn open(config: &'a TransportConfig, connector: &'a TlsConnector) -> Result<Self> {
        let timeout = config.timeout;
        let addr = config.address();
        debug!(%addr, secure = config.secure, "connecting");

        let mut stream = within(timeout, "connect", stream::connect(&addr)).await?;
        if config.secure {
            let name = server_name(&config.host)?;
            let upgrade = stream.upgrade(connector, name);
            stream = within(timeout, "TLS handshake", upgrade).await?;
        }

        let mut session = Self {
            stream,
            server_info: ServerInfo::default(),
            config,
            connector,
        };

        let greeting = within(timeout, "greeting", session.read_reply()).await?;
        check("greeting", &greeting, Expect::Completion)?;
        session.server_info.hostname = greeting
            .message
            .first()
            .and_then(|msg| msg.split_whitespace().next())
            .unwrap_or("unknown")
            .to_string();

        Ok(session)
    }

    /// Capabilities from the most recent EHLO.
    pub const fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Returns true once the socket is TLS-wrapped.
    pub const fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    /// Executes `steps` in order, stopping at the first failure.
    pub async fn run(mut self, steps: Vec<Step>) -> Result<Self> {
        for step in steps {
            self = self.execute(step).await?;
        }
        Ok(self)
    }

    async fn execute(mut self, step: Step) -> Result<Self> {
        let name = step.name();
        let timeout = self.config.timeout;

        if let Step::MailFrom { size, .. } = &step {
            self.check_size(*size)?;
        }
        self.warn_if_unadvertised(&step);

        debug!(step = name, "sending");
        let reply = within(timeout, name, self.exchange(&step)).await?;
        debug!(step = name, code = reply.code.as_u16(), "reply");
        check(name, &reply, step.expect())?;

        match step {
            Step::Ehlo => self.server_info.update_from_ehlo(&reply),
            Step::StartTls => {
                let name = server_name(&self.config.host)?;
                let upgrade = self.stream.upgrade(self.connector, name);
                self.stream = within(timeout, "TLS handshake", upgrade).await?;
                // Pre-TLS capabilities are untrusted; the next EHLO refills them.
                self.server_info.extensions.clear();
            }
            _ => {}
        }

        Ok(self)
    }

    fn warn_if_unadvertised(&self, step: &Step) {
        let server = &self.server_info.hostname;
        match step {
            Step::StartTls if !self.server_info.supports_starttls() => {
                warn!(%server, "STARTTLS not advertised, trying anyway");
            }
            Step::AuthLogin | Step::AuthPlain(_) => {
                let mechanism = if matches!(step, Step::AuthLogin) {
                    AuthMechanism::Login
                } else {
                    AuthMechanism::Plain
                };
                if !self.server_info.auth_mechanisms().contains(&mechanism) {
                    warn!(
                        %server,
                        mechanism = mechanism.as_str(),
                        "AUTH mechanism not advertised, trying anyway"
                    );
                }
            }
            _ => {}
        }
    }

    fn check_size(&self, size: usize) -> Result<()> {
        match self.server_info.max_message_size() {
            Some(limit) if limit > 0 && size > limit => Err(Error::MessageTooLarge { size, limit }),
            _ => Ok(()),
        }
    }

    async fn exchange(&mut self, step: &Step) -> Result<Reply> {
        let data = step.wire(&self.config.client_name);
        self.stream.write_all(&data).await?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();
        loop {
            let line = self.stream.read_line().await?;
            if line.is_empty() {
                continue;
            }

            let is_last = is_last_reply_line(&line);
            lines.push(line);

            if is_last {
                break;
            }
            if lines.len() >= MAX_REPLY_LINES {
                return Err(Error::Protocol("Reply has too many lines".into()));
            }
        }

        parse_reply(&lines)
    }

    /// Sends QUIT and closes the socket.
    ///
    /// Best-effort: the outcome of the call was settled by [`Session::run`].
    pub async fn quit(mut self) {
        let timeout = self.config.timeout;
        match within(timeout, "QUIT", self.exchange(&Step::Quit)).await {
            Ok(reply) if !reply.is_error() => {
                debug!(code = reply.code.as_u16(), "QUIT acknowledged");
            }
            Ok(reply) => debug!(reply = %reply, "QUIT refused"),
            Err(e) => debug!(error = %e, "QUIT failed"),
        }
        if let Err(e) = within(timeout, "shutdown", self.stream.shutdown()).await {
            debug!(error = %e, "shutdown failed");
        }
    }
}

fn check(step: &str, reply: &Reply, expect: Expect) -> Result<()> {
    if reply.is_error() {
        return Err(Error::smtp_error(reply.code.as_u16(), reply.to_string()));
    }

    let expected = match expect {
        Expect::Completion => reply.is_success(),
        Expect::Intermediate => reply.is_intermediate(),
    };
    if !expected {
        return Err(Error::Protocol(format!("Unexpected reply to {step}: {reply}")));
    }

    Ok(())
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
    use crate::types::ReplyCode;

    fn names(steps: &[Step]) -> Vec<&'static str> {
        steps.iter().map(Step::name).collect()
    }

    fn config(port: u16) -> crate::config::ConfigBuilder {
        TransportConfig::builder("smtp.example.com").port(port)
    }

    #[test]
    fn test_handshake_starttls_on_587() {
        let cfg = config(587).build().unwrap();
        assert_eq!(names(&handshake(&cfg)), vec!["EHLO", "STARTTLS", "EHLO"]);
    }

    #[test]
    fn test_handshake_skips_starttls_on_465_and_secure() {
        let cfg = config(465).build().unwrap();
        assert_eq!(names(&handshake(&cfg)), vec!["EHLO"]);

        let cfg = config(2465).secure(true).build().unwrap();
        assert_eq!(names(&handshake(&cfg)), vec!["EHLO"]);
    }

    #[test]
    fn test_handshake_with_login() {
        let cfg = config(587)
            .auth(Credentials::new("user", "pass"))
            .build()
            .unwrap();
        let steps = handshake(&cfg);
        assert_eq!(
            names(&steps),
            vec!["EHLO", "STARTTLS", "EHLO", "AUTH LOGIN", "AUTH username", "AUTH password"]
        );
        assert_eq!(steps[4].wire("localhost").as_ref(), b"dXNlcg==\r\n");
        assert_eq!(steps[5].wire("localhost").as_ref(), b"cGFzcw==\r\n");
    }

    #[test]
    fn test_handshake_with_plain() {
        let cfg = config(465)
            .auth(Credentials::new("user", "pass").with_mechanism(AuthMechanism::Plain))
            .build()
            .unwrap();
        let steps = handshake(&cfg);
        assert_eq!(names(&steps), vec!["EHLO", "AUTH PLAIN"]);
        assert_eq!(steps[1].wire("localhost").as_ref(), b"AUTH PLAIN AHVzZXIAcGFzcw==\r\n");
    }

    #[test]
    fn test_transaction_plan() {
        let envelope = Envelope {
            from: Address::new("a@example.com").unwrap(),
            recipients: vec![
                Address::new("b@example.com").unwrap(),
                Address::new("c@example.com").unwrap(),
            ],
        };
        let steps = transaction(&envelope, b"x\r\n.\r\n".to_vec());
        assert_eq!(
            names(&steps),
            vec!["MAIL FROM", "RCPT TO", "RCPT TO", "DATA", "message body"]
        );
        assert!(matches!(steps[0], Step::MailFrom { size: 6, .. }));
        assert_eq!(steps[2].wire("localhost").as_ref(), b"RCPT TO:<c@example.com>\r\n");
        assert_eq!(steps[4].wire("localhost").as_ref(), b"x\r\n.\r\n");
    }

    #[test]
    fn test_ehlo_uses_client_name() {
        assert_eq!(Step::Ehlo.wire("relay.local").as_ref(), b"EHLO relay.local\r\n");
    }

    #[test]
    fn test_encode_data_normalizes_and_terminates() {
        assert_eq!(encode_data("a\nb\r\nc"), b"a\r\nb\r\nc\r\n.\r\n");
        assert_eq!(encode_data("a\r\n"), b"a\r\n.\r\n");
        assert_eq!(encode_data(""), b"\r\n.\r\n");
    }

    #[test]
    fn test_encode_data_dot_stuffing() {
        assert_eq!(encode_data(".\n..x\ny."), b"..\r\n...x\r\ny.\r\n.\r\n");
    }

    #[test]
    fn test_check_reply_classes() {
        let ok = Reply::new(ReplyCode::OK, vec!["ok".into()]);
        let go = Reply::new(ReplyCode::START_DATA, vec!["go".into()]);
        let no = Reply::new(ReplyCode::MAILBOX_UNAVAILABLE, vec!["no".into()]);

        assert!(check("MAIL FROM", &ok, Expect::Completion).is_ok());
        assert!(check("DATA", &go, Expect::Intermediate).is_ok());
        assert!(matches!(
            check("DATA", &ok, Expect::Intermediate),
            Err(Error::Protocol(_))
        ));

        let err = check("RCPT TO", &no, Expect::Completion).unwrap_err();
        assert_eq!(err.to_string(), "SMTP Error 550: 550 no");
        let err = check("DATA", &no, Expect::Intermediate).unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_within_times_out() {
        let err = within(Duration::from_millis(50), "greeting", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Timed out after 50ms waiting for greeting");
    }
}
