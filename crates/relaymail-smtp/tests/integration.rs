//! Integration tests for the SMTP transport.
//!
//! These tests run a scripted SMTP server on 127.0.0.1 and record every line
//! the client sends, so the dialogue can be checked step by step.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::similar_names)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_test::{assert_err, assert_ok};

use relaymail_smtp::{
    Credentials, Error, MailTransport, OutgoingMessage, SmtpTransport, TransportConfig,
};

/// Server behaviour for one test.
#[derive(Clone, Default)]
struct Script {
    /// First command starting with this prefix gets this reply instead.
    reject: Option<(&'static str, &'static str)>,
    /// Replaces the 220 greeting.
    greeting: Option<&'static str>,
    /// Advertised SIZE limit.
    size: Option<usize>,
    /// Accepts STARTTLS with this acceptor.
    starttls: Option<TlsAcceptor>,
    /// Wraps the socket in TLS before the greeting.
    implicit_tls: Option<TlsAcceptor>,
    /// Pause before every reply, greeting included.
    delay: Option<Duration>,
}

/// Everything the client sent on one connection.
#[derive(Debug, Default)]
struct Transcript {
    /// Command lines, in order.
    commands: Vec<String>,
    /// Lines received between DATA and the final dot, as sent.
    data: Vec<String>,
    /// Number of commands received before the TLS upgrade, if there was one.
    upgraded_after: Option<usize>,
}

impl Transcript {
    fn count(&self, prefix: &str) -> usize {
        self.commands.iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn headers(&self) -> Vec<&str> {
        self.data
            .iter()
            .take_while(|line| !line.is_empty())
            .map(String::as_str)
            .collect()
    }
}

enum Outcome {
    Upgrade,
    Closed,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn tls_acceptor() -> TlsAcceptor {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = CertificateDer::from(cert.serialize_der().unwrap());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Accepts `connections` clients and serves each with `script`.
async fn spawn_server(script: Script, connections: usize) -> (u16, JoinHandle<Vec<Transcript>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let mut sessions = Vec::with_capacity(connections);
        for _ in 0..connections {
            let (tcp, _) = listener.accept().await.unwrap();
            sessions.push(tokio::spawn(serve(tcp, script.clone())));
        }
        let mut transcripts = Vec::with_capacity(connections);
        for session in sessions {
            transcripts.push(session.await.unwrap());
        }
        transcripts
    });

    (port, handle)
}

async fn pause(script: &Script) {
    if let Some(delay) = script.delay {
        tokio::time::sleep(delay).await;
    }
}

async fn serve(tcp: TcpStream, script: Script) -> Transcript {
    let mut transcript = Transcript::default();
    let greeting = script.greeting.unwrap_or("220 mock.test ESMTP ready");
    pause(&script).await;

    if let Some(acceptor) = script.implicit_tls.clone() {
        let Ok(tls) = acceptor.accept(tcp).await else {
            return transcript;
        };
        let mut reader = BufReader::new(tls);
        reply(&mut reader, greeting).await;
        converse(&mut reader, &script, &mut transcript, true).await;
        return transcript;
    }

    let mut reader = BufReader::new(tcp);
    reply(&mut reader, greeting).await;
    if let Outcome::Upgrade = converse(&mut reader, &script, &mut transcript, false).await {
        transcript.upgraded_after = Some(transcript.commands.len());
        let acceptor = script.starttls.clone().unwrap();
        let Ok(tls) = acceptor.accept(reader.into_inner()).await else {
            return transcript;
        };
        let mut reader = BufReader::new(tls);
        converse(&mut reader, &script, &mut transcript, true).await;
    }
    transcript
}

async fn reply<S: AsyncRead + AsyncWrite + Unpin>(reader: &mut BufReader<S>, text: &str) {
    let stream = reader.get_mut();
    let _ = stream.write_all(format!("{text}\r\n").as_bytes()).await;
    let _ = stream.flush().await;
}

fn ehlo_reply(script: &Script, tls: bool) -> String {
    let mut lines = vec!["mock.test greets localhost".to_string()];
    if script.starttls.is_some() && !tls {
        lines.push("STARTTLS".to_string());
    }
    if let Some(size) = script.size {
        lines.push(format!("SIZE {size}"));
    }
    lines.push("AUTH LOGIN PLAIN".to_string());

    let last = lines.len() - 1;
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| format!("250{}{line}", if i == last { ' ' } else { '-' }))
        .collect::<Vec<_>>()
        .join("\r\n")
}

async fn converse<S: AsyncRead + AsyncWrite + Unpin>(
    reader: &mut BufReader<S>,
    script: &Script,
    transcript: &mut Transcript,
    tls: bool,
) -> Outcome {
    let mut in_data = false;
    let mut login_stage = 0;

    loop {
        let mut raw = String::new();
        if reader.read_line(&mut raw).await.unwrap_or(0) == 0 {
            return Outcome::Closed;
        }
        let line = raw.trim_end_matches(['\r', '\n']).to_string();

        if in_data {
            if line == "." {
                in_data = false;
                pause(script).await;
                reply(reader, "250 2.0.0 Ok: queued").await;
            } else {
                transcript.data.push(line);
            }
            continue;
        }

        transcript.commands.push(line.clone());
        pause(script).await;

        if let Some((prefix, response)) = script.reject {
            if line.starts_with(prefix) {
                reply(reader, response).await;
                continue;
            }
        }

        let upper = line.to_ascii_uppercase();
        let response = match login_stage {
            1 => {
                login_stage = 2;
                "334 UGFzc3dvcmQ6".to_string()
            }
            2 => {
                login_stage = 0;
                "235 2.7.0 Authentication successful".to_string()
            }
            _ if upper.starts_with("EHLO") => ehlo_reply(script, tls),
            _ if upper == "STARTTLS" => {
                if script.starttls.is_some() && !tls {
                    reply(reader, "220 2.0.0 Ready to start TLS").await;
                    return Outcome::Upgrade;
                }
                "454 4.7.0 TLS not available".to_string()
            }
            _ if upper == "AUTH LOGIN" => {
                login_stage = 1;
                "334 VXNlcm5hbWU6".to_string()
            }
            _ if upper.starts_with("AUTH PLAIN ") => {
                "235 2.7.0 Authentication successful".to_string()
            }
            _ if upper.starts_with("MAIL FROM:") => "250 2.1.0 Ok".to_string(),
            _ if upper.starts_with("RCPT TO:") => "250 2.1.5 Ok".to_string(),
            _ if upper == "DATA" => {
                in_data = true;
                "354 End data with <CR><LF>.<CR><LF>".to_string()
            }
            _ if upper == "QUIT" => {
                reply(reader, "221 2.0.0 Bye").await;
                return Outcome::Closed;
            }
            _ => "502 5.5.2 Error: command not recognized".to_string(),
        };
        reply(reader, &response).await;
    }
}

fn plain_config(port: u16) -> relaymail_smtp::ConfigBuilder {
    TransportConfig::builder("127.0.0.1")
        .port(port)
        .starttls(false)
        .timeout(Duration::from_secs(5))
}

fn sample_message() -> OutgoingMessage {
    OutgoingMessage::new("alice@example.com", "Quarterly report")
        .to("bob@example.com")
        .cc("carol@example.com")
        .bcc("hidden@example.com")
        .text("Hi Bob,\n.leading dot\nbye")
}

/// A port nothing listens on.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_send_full_dialogue() {
    init_tracing();
    let (port, server) = spawn_server(Script::default(), 1).await;
    let transport = SmtpTransport::new(plain_config(port).build().unwrap());

    let result = transport.send(&sample_message()).await;
    assert!(result.success, "{result:?}");
    assert!(result.error.is_none());
    let message_id = result.message_id.unwrap();

    let transcript = server.await.unwrap().remove(0);
    assert_eq!(
        transcript.commands,
        vec![
            "EHLO localhost",
            "MAIL FROM:<alice@example.com>",
            "RCPT TO:<bob@example.com>",
            "RCPT TO:<carol@example.com>",
            "RCPT TO:<hidden@example.com>",
            "DATA",
            "QUIT",
        ]
    );

    let headers = transcript.headers();
    assert_eq!(headers[0], "From: alice@example.com");
    assert_eq!(headers[1], "To: bob@example.com");
    assert_eq!(headers[2], "Cc: carol@example.com");
    assert_eq!(headers[3], "Subject: Quarterly report");
    assert!(headers[4].starts_with("Date: "));
    assert_eq!(headers[5], format!("Message-ID: {message_id}"));
    assert_eq!(headers[6], "Content-Type: text/plain; charset=utf-8");
    assert!(!transcript.data.iter().any(|l| l.contains("hidden@example.com")));

    let body: Vec<&str> = transcript.data[headers.len() + 1..]
        .iter()
        .map(String::as_str)
        .collect();
    assert_eq!(body, vec!["Hi Bob,", "..leading dot", "bye"]);
}

#[tokio::test]
async fn test_rcpt_rejection_aborts_before_data() {
    init_tracing();
    let script = Script {
        reject: Some(("RCPT TO", "550 5.1.1 <bob@example.com>: Recipient address rejected")),
        ..Script::default()
    };
    let (port, server) = spawn_server(script, 1).await;
    let transport = SmtpTransport::new(plain_config(port).build().unwrap());

    let result = transport.send(&sample_message()).await;
    assert!(!result.success);
    assert!(result.message_id.is_none());
    let error = result.error.unwrap();
    assert!(error.starts_with("SMTP Error 550: 550 5.1.1"), "{error}");

    let transcript = server.await.unwrap().remove(0);
    assert_eq!(transcript.count("RCPT TO"), 1);
    assert_eq!(transcript.count("DATA"), 0);
    assert_eq!(transcript.commands.last().unwrap(), "RCPT TO:<bob@example.com>");
    assert!(transcript.data.is_empty());
}

#[tokio::test]
async fn test_transient_mail_from_rejection() {
    let script = Script {
        reject: Some(("MAIL FROM", "451 4.3.0 Try again later")),
        ..Script::default()
    };
    let (port, server) = spawn_server(script, 1).await;
    let transport = SmtpTransport::new(plain_config(port).build().unwrap());

    let err = assert_err!(transport.deliver(&sample_message()).await);
    assert!(err.is_transient());
    assert_eq!(err.to_string(), "SMTP Error 451: 451 4.3.0 Try again later");

    let transcript = server.await.unwrap().remove(0);
    assert_eq!(transcript.count("RCPT TO"), 0);
}

#[tokio::test]
async fn test_auth_login_sends_encoded_credentials() {
    let (port, server) = spawn_server(Script::default(), 1).await;
    let config = plain_config(port)
        .auth(Credentials::new("user", "pass"))
        .build()
        .unwrap();
    let transport = SmtpTransport::new(config);

    assert!(transport.send(&sample_message()).await.success);

    let transcript = server.await.unwrap().remove(0);
    assert_eq!(
        &transcript.commands[..5],
        &["EHLO localhost", "AUTH LOGIN", "dXNlcg==", "cGFzcw==", "MAIL FROM:<alice@example.com>"]
    );
}

#[tokio::test]
async fn test_auth_failure_fails_check() {
    let script = Script {
        reject: Some(("AUTH LOGIN", "535 5.7.8 Authentication credentials invalid")),
        ..Script::default()
    };
    let (port, server) = spawn_server(script, 2).await;
    let config = plain_config(port)
        .auth(Credentials::new("user", "wrong"))
        .build()
        .unwrap();
    let transport = SmtpTransport::new(config);

    assert!(!transport.check_connection().await);
    let err = assert_err!(transport.verify().await);
    assert!(err.is_permanent());

    let transcripts = server.await.unwrap();
    assert_eq!(transcripts[0].commands, vec!["EHLO localhost", "AUTH LOGIN"]);
}

#[tokio::test]
async fn test_check_connection_quits() {
    let (port, server) = spawn_server(Script::default(), 1).await;
    let transport = SmtpTransport::new(plain_config(port).build().unwrap());

    assert!(MailTransport::check_connection(&transport).await);

    let transcript = server.await.unwrap().remove(0);
    assert_eq!(transcript.commands, vec!["EHLO localhost", "QUIT"]);
}

#[tokio::test]
async fn test_greeting_rejection() {
    let script = Script {
        greeting: Some("554 5.3.2 No service here"),
        ..Script::default()
    };
    let (port, _server) = spawn_server(script, 1).await;
    let transport = SmtpTransport::new(plain_config(port).build().unwrap());

    let err = assert_err!(transport.verify().await);
    assert_eq!(err.to_string(), "SMTP Error 554: 554 5.3.2 No service here");
}

#[tokio::test]
async fn test_starttls_upgrade_then_single_ehlo() {
    init_tracing();
    let script = Script {
        starttls: Some(tls_acceptor()),
        ..Script::default()
    };
    let (port, server) = spawn_server(script, 1).await;
    let config = TransportConfig::builder("127.0.0.1")
        .port(port)
        .accept_invalid_certs(true)
        .auth(Credentials::new("user", "pass"))
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    assert!(config.wants_starttls());
    let transport = SmtpTransport::new(config);

    let result = transport.send(&sample_message()).await;
    assert!(result.success, "{result:?}");

    let transcript = server.await.unwrap().remove(0);
    assert_eq!(transcript.count("STARTTLS"), 1);
    assert_eq!(transcript.count("EHLO"), 2);
    assert_eq!(transcript.upgraded_after, Some(2));
    assert_eq!(
        &transcript.commands[..4],
        &["EHLO localhost", "STARTTLS", "EHLO localhost", "AUTH LOGIN"]
    );
    assert_eq!(transcript.commands.last().unwrap(), "QUIT");
}

#[tokio::test]
async fn test_starttls_rejects_untrusted_certificate_by_default() {
    let script = Script {
        starttls: Some(tls_acceptor()),
        ..Script::default()
    };
    let (port, server) = spawn_server(script, 1).await;
    let config = TransportConfig::builder("127.0.0.1")
        .port(port)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let transport = SmtpTransport::new(config);

    let err = assert_err!(transport.verify().await);
    assert!(matches!(err, Error::Tls(_)), "{err}");

    let transcript = server.await.unwrap().remove(0);
    assert_eq!(transcript.commands, vec!["EHLO localhost", "STARTTLS"]);
}

#[tokio::test]
async fn test_starttls_refused_by_server() {
    let (port, server) = spawn_server(Script::default(), 1).await;
    let config = TransportConfig::builder("127.0.0.1")
        .port(port)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let transport = SmtpTransport::new(config);

    let result = transport.send(&sample_message()).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("454"));

    let transcript = server.await.unwrap().remove(0);
    assert_eq!(transcript.count("MAIL FROM"), 0);
}

#[tokio::test]
async fn test_implicit_tls() {
    let script = Script {
        implicit_tls: Some(tls_acceptor()),
        ..Script::default()
    };
    let (port, server) = spawn_server(script, 1).await;
    let config = TransportConfig::builder("127.0.0.1")
        .port(port)
        .secure(true)
        .accept_invalid_certs(true)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let transport = SmtpTransport::new(config);

    assert_ok!(transport.verify().await);

    let transcript = server.await.unwrap().remove(0);
    assert_eq!(transcript.commands, vec!["EHLO localhost", "QUIT"]);
}

#[tokio::test]
async fn test_size_limit_checked_before_mail_from() {
    let script = Script {
        size: Some(64),
        ..Script::default()
    };
    let (port, server) = spawn_server(script, 1).await;
    let transport = SmtpTransport::new(plain_config(port).build().unwrap());

    let err = assert_err!(transport.deliver(&sample_message()).await);
    assert!(matches!(err, Error::MessageTooLarge { limit: 64, .. }), "{err}");

    let transcript = server.await.unwrap().remove(0);
    assert_eq!(transcript.commands, vec!["EHLO localhost"]);
}

#[tokio::test]
async fn test_invalid_address_never_connects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let transport = SmtpTransport::new(plain_config(port).build().unwrap());

    let bad_to = OutgoingMessage::new("alice@example.com", "x").to("invalid").text("x");
    let result = transport.send(&bad_to).await;
    assert!(!result.success);
    assert_eq!(
        result.error.as_deref(),
        Some("Invalid recipient email address: invalid")
    );

    let bad_from = OutgoingMessage::new("@domain.com", "x").to("bob@example.com").text("x");
    let result = transport.send(&bad_from).await;
    assert_eq!(
        result.error.as_deref(),
        Some("Invalid sender email address: @domain.com")
    );

    let bad_bcc = OutgoingMessage::new("alice@example.com", "x")
        .to("bob@example.com")
        .bcc("user@")
        .text("x");
    assert!(transport.deliver(&bad_bcc).await.unwrap_err().is_validation());

    let pending = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(pending.is_err(), "client opened a connection");
}

#[tokio::test]
async fn test_unresponsive_server_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let silent = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(tcp);
    });

    let config = plain_config(port).timeout_millis(300).build().unwrap();
    let transport = SmtpTransport::new(config);

    let started = Instant::now();
    let result = transport.send(&sample_message()).await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!result.success);
    assert_eq!(
        result.error.as_deref(),
        Some("Timed out after 300ms waiting for greeting")
    );
    silent.abort();
}

#[tokio::test]
async fn test_timeout_applies_per_command() {
    let script = Script {
        delay: Some(Duration::from_millis(200)),
        ..Script::default()
    };
    let (port, server) = spawn_server(script, 1).await;
    let config = plain_config(port)
        .auth(Credentials::new("user", "pass"))
        .timeout_millis(300)
        .build()
        .unwrap();
    let transport = SmtpTransport::new(config);

    let started = Instant::now();
    let result = transport.send(&sample_message()).await;
    let elapsed = started.elapsed();
    assert!(result.success, "{result:?}");
    assert!(elapsed > Duration::from_millis(1_500), "took {elapsed:?}");

    let transcript = server.await.unwrap().remove(0);
    assert_eq!(transcript.commands.last().unwrap(), "QUIT");
}

#[tokio::test]
async fn test_oversized_reply_line_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let flood = tokio::spawn(async move {
        let (mut tcp, _) = listener.accept().await.unwrap();
        let _ = tcp.write_all(&[b'2'; 64 * 1024]).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let transport = SmtpTransport::new(plain_config(port).build().unwrap());
    let started = Instant::now();
    let err = assert_err!(transport.verify().await);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(err.to_string(), "Protocol error: Reply line exceeds 4096 bytes");
    flood.abort();
}

#[tokio::test]
async fn test_unreachable_host_fails_consistently() {
    let port = closed_port().await;
    let transport = SmtpTransport::new(plain_config(port).timeout_millis(1_000).build().unwrap());

    let first = transport.send(&sample_message()).await;
    let second = transport.send(&sample_message()).await;
    for result in [&first, &second] {
        assert!(!result.success);
        assert!(result.message_id.is_none());
        assert!(result.error.as_deref().unwrap().contains("127.0.0.1"));
    }
    assert_eq!(first, second);

    assert!(!transport.check_connection().await);
}

#[tokio::test]
async fn test_concurrent_sends_use_separate_connections() {
    let (port, server) = spawn_server(Script::default(), 2).await;
    let transport = SmtpTransport::new(plain_config(port).build().unwrap());

    let first = sample_message();
    let second = OutgoingMessage::new("dave@example.com", "Other")
        .to("erin@example.com")
        .html("<p>hi</p>");
    let (a, b) = tokio::join!(transport.send(&first), transport.send(&second));
    assert!(a.success && b.success);
    assert_ne!(a.message_id, b.message_id);

    let transcripts = server.await.unwrap();
    assert_eq!(transcripts.len(), 2);
    for transcript in &transcripts {
        assert_eq!(transcript.count("MAIL FROM"), 1);
        assert_eq!(transcript.commands.last().unwrap(), "QUIT");
    }
}
