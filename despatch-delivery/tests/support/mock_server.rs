//! Mock SMTP server for exercising delivery against a scripted peer.
#![allow(dead_code)]
//!
//! The server can:
//! - answer each command with a configurable reply
//! - refuse individual recipients
//! - advertise STARTTLS and carry on in plaintext after it (pair with a
//!   passthrough [`TlsUpgrade`](despatch_smtp::TlsUpgrade))
//! - delay replies or drop the connection part way through
//! - record every command it receives

use std::{
    collections::HashMap,
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::RwLock,
    time::timeout,
};

/// SMTP command received by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content between DATA and the terminating dot, as sent
    MessageContent(Vec<u8>),
    Quit,
    StartTls,
    Other(String),
}

#[derive(Debug, Clone)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
}

impl SmtpResponse {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Clone)]
struct EhloResponse {
    code: u16,
    capabilities: Vec<String>,
}

impl EhloResponse {
    fn to_bytes(&self) -> Vec<u8> {
        let mut response = String::new();
        let last = self.capabilities.len().saturating_sub(1);

        for (i, cap) in self.capabilities.iter().enumerate() {
            let separator = if i < last { '-' } else { ' ' };
            let _ = write!(&mut response, "{}{separator}{cap}\r\n", self.code);
        }

        response.into_bytes()
    }
}

#[derive(Clone)]
struct MockServerConfig {
    greeting: SmtpResponse,
    ehlo_response: EhloResponse,
    helo_response: SmtpResponse,
    mail_from_response: SmtpResponse,
    rcpt_to_response: SmtpResponse,
    rcpt_overrides: HashMap<String, SmtpResponse>,
    data_response: SmtpResponse,
    data_end_response: SmtpResponse,
    quit_response: SmtpResponse,
    starttls_response: Option<SmtpResponse>,

    response_delay: Option<Duration>,
    drop_after_commands: Option<usize>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            greeting: SmtpResponse::new(220, "mock.test ESMTP"),
            ehlo_response: EhloResponse {
                code: 250,
                capabilities: vec!["mock.test".to_string(), "SIZE 10000".to_string()],
            },
            helo_response: SmtpResponse::new(250, "mock.test"),
            mail_from_response: SmtpResponse::new(250, "OK"),
            rcpt_to_response: SmtpResponse::new(250, "OK"),
            rcpt_overrides: HashMap::new(),
            data_response: SmtpResponse::new(354, "Start mail input; end with <CRLF>.<CRLF>"),
            data_end_response: SmtpResponse::new(250, "OK: Message accepted"),
            quit_response: SmtpResponse::new(221, "Bye"),
            starttls_response: None,
            response_delay: None,
            drop_after_commands: None,
        }
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands_received: Arc<RwLock<Vec<SmtpCommand>>>,
    connections: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::new()
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// All commands received so far, across every connection
    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands_received.read().await.clone()
    }

    /// Number of connections accepted
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn handle_client<S>(
        stream: S,
        config: Arc<MockServerConfig>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut handled = 0;

        writer.write_all(&config.greeting.to_bytes()).await?;
        writer.flush().await?;

        loop {
            line.clear();

            if config.drop_after_commands.is_some_and(|limit| handled >= limit) {
                return Ok(());
            }

            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }
            handled += 1;

            let cmd_line = line.trim_end();
            tracing::debug!("Mock server received: {cmd_line}");

            let (verb, argument) = cmd_line.split_once(' ').unwrap_or((cmd_line, ""));
            let argument = argument.to_string();

            let (response, command) = match verb.to_ascii_uppercase().as_str() {
                "EHLO" => (config.ehlo_response.to_bytes(), SmtpCommand::Ehlo(argument)),
                "HELO" => (config.helo_response.to_bytes(), SmtpCommand::Helo(argument)),
                "MAIL" => (
                    config.mail_from_response.to_bytes(),
                    SmtpCommand::MailFrom(argument),
                ),
                "RCPT" => {
                    let recipient = argument
                        .trim_start_matches("TO:")
                        .trim_start_matches('<')
                        .trim_end_matches('>')
                        .to_ascii_lowercase();
                    let response = config
                        .rcpt_overrides
                        .get(&recipient)
                        .unwrap_or(&config.rcpt_to_response);
                    (response.to_bytes(), SmtpCommand::RcptTo(argument))
                }
                "DATA" => (config.data_response.to_bytes(), SmtpCommand::Data),
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    writer.write_all(&config.quit_response.to_bytes()).await?;
                    writer.flush().await?;
                    return Ok(());
                }
                "STARTTLS" => (
                    config
                        .starttls_response
                        .as_ref()
                        .map_or_else(
                            || SmtpResponse::new(502, "Command not implemented"),
                            Clone::clone,
                        )
                        .to_bytes(),
                    SmtpCommand::StartTls,
                ),
                _ => (
                    SmtpResponse::new(500, "Unknown command").to_bytes(),
                    SmtpCommand::Other(cmd_line.to_string()),
                ),
            };

            let reading_content =
                matches!(command, SmtpCommand::Data) && config.data_response.code == 354;
            commands.write().await.push(command);

            if let Some(delay) = config.response_delay {
                tokio::time::sleep(delay).await;
            }
            writer.write_all(&response).await?;
            writer.flush().await?;

            if reading_content {
                let mut content = Vec::new();
                let mut data_line = String::new();

                loop {
                    data_line.clear();
                    if reader.read_line(&mut data_line).await? == 0 {
                        return Ok(());
                    }

                    if data_line == ".\r\n" {
                        commands
                            .write()
                            .await
                            .push(SmtpCommand::MessageContent(content));
                        writer
                            .write_all(&config.data_end_response.to_bytes())
                            .await?;
                        writer.flush().await?;
                        break;
                    }

                    content.extend_from_slice(data_line.as_bytes());
                }
            }
        }
    }
}

pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
}

impl MockSmtpServerBuilder {
    fn new() -> Self {
        Self {
            config: MockServerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.greeting = SmtpResponse::new(code, message);
        self
    }

    /// Reply to EHLO with `capabilities`, the first being the server name
    #[must_use]
    pub fn with_ehlo_response(mut self, code: u16, capabilities: &[&str]) -> Self {
        self.config.ehlo_response = EhloResponse {
            code,
            capabilities: capabilities.iter().map(ToString::to_string).collect(),
        };
        self
    }

    #[must_use]
    pub fn with_helo_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.helo_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to_response = SmtpResponse::new(code, message);
        self
    }

    /// Reply to `RCPT TO:<recipient>` with this instead of the default
    #[must_use]
    pub fn with_rcpt_to_response_for(
        mut self,
        recipient: &str,
        code: u16,
        message: impl Into<String>,
    ) -> Self {
        self.config
            .rcpt_overrides
            .insert(recipient.to_ascii_lowercase(), SmtpResponse::new(code, message));
        self
    }

    #[must_use]
    pub fn with_data_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end_response = SmtpResponse::new(code, message);
        self
    }

    /// Accept STARTTLS with this reply. The session continues unencrypted.
    #[must_use]
    pub fn with_starttls_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.starttls_response = Some(SmtpResponse::new(code, message));
        self
    }

    /// Delay every reply after the greeting
    #[must_use]
    pub const fn with_response_delay(mut self, delay: Duration) -> Self {
        self.config.response_delay = Some(delay);
        self
    }

    /// Drop the connection after N commands
    #[must_use]
    pub const fn with_network_error_after_commands(mut self, count: usize) -> Self {
        self.config.drop_after_commands = Some(count);
        self
    }

    /// Bind to an ephemeral loopback port and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let server = MockSmtpServer {
            addr,
            commands_received: Arc::clone(&commands),
            connections: Arc::clone(&connections),
            shutdown: Arc::clone(&shutdown),
        };

        tokio::spawn(async move {
            while !shutdown.load(Ordering::Relaxed) {
                let Ok(Ok((stream, _peer))) =
                    timeout(Duration::from_millis(100), listener.accept()).await
                else {
                    continue;
                };

                connections.fetch_add(1, Ordering::Relaxed);
                let config = Arc::clone(&config);
                let commands = Arc::clone(&commands);

                tokio::spawn(async move {
                    if let Err(e) = MockSmtpServer::handle_client(stream, config, commands).await {
                        tracing::debug!("Mock server client error: {e}");
                    }
                });
            }
        });

        Ok(server)
    }
}
