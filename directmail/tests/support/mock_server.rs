//! Mock SMTP server for delivery scenarios
//!
//! The server can:
//! - answer every command with a configurable reply
//! - reject individual recipients, or senders by local part
//! - fail the first N message bodies temporarily, across connections
//! - answer the first N connections, or `RCPT TO` for an address, with a reply
//!   and hang up
//! - advertise STARTTLS and refuse it
//! - drop or stall the connection at a given command
//! - record every command and message body it received
#![allow(dead_code)]

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
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

/// SMTP command received by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    /// The argument after `MAIL FROM:`, brackets included
    MailFrom(String),
    /// The argument after `RCPT TO:`, brackets included
    RcptTo(String),
    Data,
    /// The message as received, dot-stuffing undone and terminator removed
    MessageContent(Vec<u8>),
    StartTls,
    Quit,
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
    ehlo_response: Option<EhloResponse>,
    helo_response: SmtpResponse,
    mail_from_response: SmtpResponse,
    rcpt_to_response: SmtpResponse,
    data_response: SmtpResponse,
    data_end_response: SmtpResponse,
    quit_response: SmtpResponse,
    starttls_response: Option<SmtpResponse>,

    /// Keyed by the bare address, e.g. `user@example.com`
    recipient_responses: HashMap<String, SmtpResponse>,
    /// Keyed by local part, e.g. `invalid`
    sender_responses: HashMap<String, SmtpResponse>,
    /// Number of message bodies answered with the response before the normal one
    transient_data_failures: Option<(usize, SmtpResponse)>,
    /// Number of connections greeted with the response and then closed
    closing_greetings: Option<(usize, SmtpResponse)>,
    /// Address whose first N `RCPT TO` commands are answered with the
    /// response, after which the connection is closed
    closing_recipient: Option<(String, usize, SmtpResponse)>,

    response_delay: Option<Duration>,
    drop_after_commands: Option<usize>,
    timeout_on_command: Option<usize>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            greeting: SmtpResponse::new(220, "Mock SMTP Server"),
            ehlo_response: Some(EhloResponse {
                code: 250,
                capabilities: vec!["localhost".to_string(), "SIZE 10000".to_string()],
            }),
            helo_response: SmtpResponse::new(250, "Hello"),
            mail_from_response: SmtpResponse::new(250, "OK"),
            rcpt_to_response: SmtpResponse::new(250, "OK"),
            data_response: SmtpResponse::new(354, "Start mail input; end with <CRLF>.<CRLF>"),
            data_end_response: SmtpResponse::new(250, "OK: Message accepted"),
            quit_response: SmtpResponse::new(221, "Bye"),
            starttls_response: None,
            recipient_responses: HashMap::new(),
            sender_responses: HashMap::new(),
            transient_data_failures: None,
            closing_greetings: None,
            closing_recipient: None,
            response_delay: None,
            drop_after_commands: None,
            timeout_on_command: None,
        }
    }
}

/// Strips `FROM:`/`TO:` and returns the bracketed path as sent.
fn path_argument(argument: &str) -> String {
    argument
        .split_once(':')
        .map_or(argument, |(_, path)| path)
        .trim()
        .to_string()
}

fn bare(path: &str) -> &str {
    path.trim_start_matches('<').trim_end_matches('>')
}

struct Shared {
    config: MockServerConfig,
    commands: RwLock<Vec<SmtpCommand>>,
    command_count: AtomicUsize,
    connections: AtomicUsize,
    bodies: AtomicUsize,
    recipients: AtomicUsize,
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
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

    /// Every command received, across all connections
    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.shared.commands.read().await.clone()
    }

    /// Every message body received, in order
    pub async fn messages(&self) -> Vec<Vec<u8>> {
        self.commands()
            .await
            .into_iter()
            .filter_map(|command| match command {
                SmtpCommand::MessageContent(content) => Some(content),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn command_count(&self) -> usize {
        self.shared.command_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn record(shared: &Shared, command: SmtpCommand) {
        shared.commands.write().await.push(command);
    }

    /// Reads the body up to `<CRLF>.<CRLF>`, undoing dot-stuffing.
    async fn read_message<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
    where
        R: AsyncBufReadExt + Unpin,
    {
        let mut content = Vec::new();
        let mut line = Vec::new();

        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                return Ok(None);
            }

            if line == b".\r\n" || line == b".\n" {
                return Ok(Some(content));
            }

            let unstuffed = if line.starts_with(b"..") { &line[1..] } else { &line[..] };
            content.extend_from_slice(unstuffed);
        }
    }

    /// `Some` when this connection should be greeted with a failure and closed.
    fn closing_greeting(config: &MockServerConfig, connection: usize) -> Option<&SmtpResponse> {
        config
            .closing_greetings
            .as_ref()
            .filter(|(count, _)| connection < *count)
            .map(|(_, response)| response)
    }

    /// `Some` when this `RCPT TO` should be answered with a failure, after which
    /// the connection is closed.
    fn closing_recipient<'c>(
        config: &'c MockServerConfig,
        shared: &Shared,
        address: &str,
    ) -> Option<&'c SmtpResponse> {
        let (target, count, response) = config.closing_recipient.as_ref()?;
        if target != address {
            return None;
        }
        let seen = shared.recipients.fetch_add(1, Ordering::SeqCst);
        (seen < *count).then_some(response)
    }

    fn data_end_response(config: &MockServerConfig, shared: &Shared) -> SmtpResponse {
        let body = shared.bodies.fetch_add(1, Ordering::SeqCst);
        match &config.transient_data_failures {
            Some((count, response)) if body < *count => response.clone(),
            _ => config.data_end_response.clone(),
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn handle_client(
        mut stream: TcpStream,
        shared: Arc<Shared>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let config = &shared.config;
        let connection = shared.connections.fetch_add(1, Ordering::SeqCst);

        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut local_command_count = 0;

        if let Some(response) = Self::closing_greeting(config, connection) {
            writer.write_all(&response.to_bytes()).await?;
            writer.flush().await?;
            return Ok(());
        }

        writer.write_all(&config.greeting.to_bytes()).await?;
        writer.flush().await?;

        loop {
            line.clear();

            if let Some(drop_after) = config.drop_after_commands
                && local_command_count >= drop_after
            {
                return Ok(());
            }

            if let Some(timeout_on) = config.timeout_on_command
                && local_command_count == timeout_on
            {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(());
            }

            let Ok(read_result) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };

            if read_result? == 0 {
                return Ok(());
            }

            local_command_count += 1;
            shared.command_count.fetch_add(1, Ordering::Relaxed);

            let cmd_line = line.trim_end().to_string();
            tracing::debug!("Mock server received: {cmd_line}");

            let (verb, argument) = cmd_line.split_once(' ').unwrap_or((cmd_line.as_str(), ""));

            let (response, command) = match verb.to_ascii_uppercase().as_str() {
                "EHLO" => (
                    config
                        .ehlo_response
                        .as_ref()
                        .map_or_else(|| config.helo_response.to_bytes(), EhloResponse::to_bytes),
                    SmtpCommand::Ehlo(argument.to_string()),
                ),
                "HELO" => (
                    config.helo_response.to_bytes(),
                    SmtpCommand::Helo(argument.to_string()),
                ),
                "MAIL" => {
                    let path = path_argument(argument);
                    let local_part = bare(&path).split('@').next().unwrap_or_default();
                    let response = config
                        .sender_responses
                        .get(local_part)
                        .unwrap_or(&config.mail_from_response);
                    (response.to_bytes(), SmtpCommand::MailFrom(path))
                }
                "RCPT" => {
                    let path = path_argument(argument);
                    if let Some(response) = Self::closing_recipient(config, &shared, bare(&path)) {
                        Self::record(&shared, SmtpCommand::RcptTo(path)).await;
                        writer.write_all(&response.to_bytes()).await?;
                        writer.flush().await?;
                        return Ok(());
                    }
                    let response = config
                        .recipient_responses
                        .get(bare(&path))
                        .unwrap_or(&config.rcpt_to_response);
                    (response.to_bytes(), SmtpCommand::RcptTo(path))
                }
                "DATA" => (config.data_response.to_bytes(), SmtpCommand::Data),
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
                "QUIT" => {
                    Self::record(&shared, SmtpCommand::Quit).await;
                    writer.write_all(&config.quit_response.to_bytes()).await?;
                    writer.flush().await?;
                    return Ok(());
                }
                _ => (
                    SmtpResponse::new(500, "Unknown command").to_bytes(),
                    SmtpCommand::Other(cmd_line.clone()),
                ),
            };

            let is_data = command == SmtpCommand::Data;
            Self::record(&shared, command).await;

            if let Some(delay) = config.response_delay {
                tokio::time::sleep(delay).await;
            }
            writer.write_all(&response).await?;
            writer.flush().await?;

            if is_data && config.data_response.code == 354 {
                let Some(content) = Self::read_message(&mut reader).await? else {
                    return Ok(());
                };
                Self::record(&shared, SmtpCommand::MessageContent(content)).await;

                let response = Self::data_end_response(config, &shared);
                writer.write_all(&response.to_bytes()).await?;
                writer.flush().await?;
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

    #[must_use]
    pub fn with_ehlo_response(mut self, code: u16, capabilities: Vec<String>) -> Self {
        self.config.ehlo_response = Some(EhloResponse { code, capabilities });
        self
    }

    /// Answer EHLO like HELO-only servers do.
    #[must_use]
    pub fn without_ehlo(mut self) -> Self {
        self.config.ehlo_response = Some(EhloResponse {
            code: 502,
            capabilities: vec!["Command not implemented".to_string()],
        });
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

    /// Answer `RCPT TO` for one address differently.
    #[must_use]
    pub fn with_recipient_response(
        mut self,
        address: &str,
        code: u16,
        message: impl Into<String>,
    ) -> Self {
        self.config
            .recipient_responses
            .insert(address.to_string(), SmtpResponse::new(code, message));
        self
    }

    /// Answer `MAIL FROM` differently for senders with this local part.
    #[must_use]
    pub fn with_sender_response(
        mut self,
        local_part: &str,
        code: u16,
        message: impl Into<String>,
    ) -> Self {
        self.config
            .sender_responses
            .insert(local_part.to_string(), SmtpResponse::new(code, message));
        self
    }

    #[must_use]
    pub fn with_data_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_response = SmtpResponse::new(code, message);
        self
    }

    /// The reply after the message body (after `<CRLF>.<CRLF>`)
    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end_response = SmtpResponse::new(code, message);
        self
    }

    /// Answer the first `count` message bodies, counted across connections,
    /// with `code` before answering normally.
    #[must_use]
    pub fn with_transient_data_failures(
        mut self,
        count: usize,
        code: u16,
        message: impl Into<String>,
    ) -> Self {
        self.config.transient_data_failures = Some((count, SmtpResponse::new(code, message)));
        self
    }

    /// Advertise STARTTLS and answer it with `code`.
    ///
    /// The mock cannot complete a handshake, so only refusals are useful.
    #[must_use]
    pub fn with_starttls_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.starttls_response = Some(SmtpResponse::new(code, message));
        if let Some(ehlo) = &mut self.config.ehlo_response {
            ehlo.capabilities.push("STARTTLS".to_string());
        }
        self
    }

    /// Greet the first `count` connections with `code` and hang up.
    #[must_use]
    pub fn with_closing_greetings(mut self, count: usize, code: u16, message: impl Into<String>) -> Self {
        self.config.closing_greetings = Some((count, SmtpResponse::new(code, message)));
        self
    }

    /// Answer the first `count` `RCPT TO` commands for `address`, counted
    /// across connections, with `code` and hang up after each.
    #[must_use]
    pub fn with_closing_recipient(
        mut self,
        address: &str,
        count: usize,
        code: u16,
        message: impl Into<String>,
    ) -> Self {
        self.config.closing_recipient =
            Some((address.to_string(), count, SmtpResponse::new(code, message)));
        self
    }

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

    /// Hang on the Nth command (0-indexed)
    #[must_use]
    pub const fn with_timeout_on_command(mut self, command_index: usize) -> Self {
        self.config.timeout_on_command = Some(command_index);
        self
    }

    /// Binds to a random local port and starts serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind to a port
    pub async fn build(self) -> Result<MockSmtpServer, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            config: self.config,
            commands: RwLock::new(Vec::new()),
            command_count: AtomicUsize::new(0),
            connections: AtomicUsize::new(0),
            bodies: AtomicUsize::new(0),
            recipients: AtomicUsize::new(0),
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        let server_shared = Arc::clone(&shared);
        let server_shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            while !server_shutdown.load(Ordering::Relaxed) {
                // Accept with a timeout so the shutdown flag is checked
                let accept_result = timeout(Duration::from_millis(100), listener.accept()).await;

                if let Ok(Ok((stream, _peer))) = accept_result {
                    let shared = Arc::clone(&server_shared);
                    tokio::spawn(async move {
                        if let Err(e) = MockSmtpServer::handle_client(stream, shared).await {
                            tracing::debug!("Mock server client error: {e}");
                        }
                    });
                }
            }
        });

        Ok(MockSmtpServer {
            addr,
            shared,
            shutdown,
        })
    }
}
