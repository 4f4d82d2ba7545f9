//! One SMTP delivery attempt for one destination group.
//!
//! The session walks the group's candidate hosts in priority order until one
//! yields a usable session (TCP connect, 2xx greeting, EHLO or HELO, TLS as
//! the policy demands), then runs a single transaction on it:
//! 1. `MAIL FROM`, whose rejection applies to every recipient
//! 2. `RCPT TO` per recipient, each classified on its own, except that a
//!    421 ends the transaction and defers everyone without a verdict
//! 3. `DATA` and the body, only if some recipient was accepted; the final
//!    reply applies to the recipients accepted in step 2
//! 4. `QUIT`, whatever happened before

use std::{fmt, future::Future, time::Duration};

use directmail_common::Address;
use directmail_smtp::{ClientError, Response, SmtpClient};
use tracing::Level;

use crate::{
    context::SendContext,
    dns::MailServer,
    error::{DeliveryError, SmtpReply},
    events::LogKind,
    outcome::RecipientOutcome,
    types::Attempt,
};

/// The server is closing the transmission channel (RFC 5321 §3.8).
const SERVICE_CLOSING: u16 = 421;

/// Marks every recipient without a verdict as pending on `error`.
fn defer_remaining(outcomes: &mut [Option<RecipientOutcome>], error: &DeliveryError) {
    for outcome in outcomes.iter_mut().filter(|outcome| outcome.is_none()) {
        *outcome = Some(RecipientOutcome::Pending(error.clone()));
    }
}

/// Outcome of TLS negotiation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsNegotiationOutcome {
    Success,
    /// Not attempted: disabled, or not offered and not required
    Skipped,
    /// Opportunistic STARTTLS failed; RFC 3207 says to reconnect in plaintext
    RetryWithoutTls,
}

#[derive(Debug, Clone, Copy)]
enum Command<'c> {
    Ehlo(&'c str),
    Helo(&'c str),
    StartTls,
    MailFrom(&'c str),
    RcptTo(&'c str),
    Data,
    Body(&'c [u8]),
    Quit,
}

impl Command<'_> {
    /// Name used in timeout errors
    const fn phase(&self) -> &'static str {
        match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
            Self::StartTls => "STARTTLS",
            Self::MailFrom(_) => "MAIL FROM",
            Self::RcptTo(_) => "RCPT TO",
            Self::Data => "DATA",
            Self::Body(_) => "message body",
            Self::Quit => "QUIT",
        }
    }
}

impl fmt::Display for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ehlo(name) => write!(f, "EHLO {name}"),
            Self::Helo(name) => write!(f, "HELO {name}"),
            Self::StartTls => f.write_str("STARTTLS"),
            Self::MailFrom(from) => write!(f, "MAIL FROM:<{from}>"),
            Self::RcptTo(to) => write!(f, "RCPT TO:<{to}>"),
            Self::Data => f.write_str("DATA"),
            Self::Body(body) => write!(f, "<{} bytes>", body.len()),
            Self::Quit => f.write_str("QUIT"),
        }
    }
}

async fn timed<T>(
    limit: Duration,
    phase: &'static str,
    operation: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, DeliveryError> {
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result.map_err(DeliveryError::from),
        Err(_) => Err(DeliveryError::Timeout { phase, limit }),
    }
}

/// The error for a non-2xx reply where a verdict was expected.
///
/// 4xx and 5xx are wrapped by `rejected`; anything else is a protocol error.
fn reply_error(
    reply: &Response,
    phase: &str,
    rejected: fn(SmtpReply) -> DeliveryError,
) -> DeliveryError {
    if reply.is_temporary_error() || reply.is_permanent_error() {
        rejected(SmtpReply::from(reply))
    } else {
        DeliveryError::Protocol(format!("Unexpected reply to {phase}: {reply}"))
    }
}

pub struct SmtpSession<'a> {
    ctx: &'a SendContext,
    domain: &'a str,
}

impl<'a> SmtpSession<'a> {
    #[must_use]
    pub const fn new(ctx: &'a SendContext, domain: &'a str) -> Self {
        Self { ctx, domain }
    }

    /// Runs one attempt for `recipients` against `servers`, most preferred
    /// first. Every recipient gets an outcome.
    #[tracing::instrument(level = "debug", skip_all, fields(send_id = %self.ctx.send_id, domain = self.domain))]
    pub async fn attempt(&self, servers: &[MailServer], recipients: &[Address]) -> Attempt {
        let port = self.ctx.config.port;
        let mut last_error = None;
        let mut deferred = None;

        for server in servers {
            let address = server.address(port);

            match self.establish(server, &address).await {
                Ok(mut client) => {
                    let tls = if client.is_tls() { " (TLS)" } else { "" };
                    self.ctx
                        .emitter
                        .info(LogKind::Connect, self.domain, format!("Connected to {address}{tls}"));

                    let outcomes = self.transact(&mut client, &address, recipients).await;
                    self.quit(&mut client, &address).await;

                    return Attempt {
                        server: Some(address),
                        outcomes: recipients.iter().cloned().zip(outcomes).collect(),
                    };
                }
                Err(error) => {
                    self.ctx.emitter.warn(
                        LogKind::Connect,
                        self.domain,
                        format!(
                            "Could not establish a session with {address} ({}): {error}",
                            error.kind()
                        ),
                    );
                    if error.is_temporary() {
                        deferred = Some(error.clone());
                    }
                    last_error = Some(error);
                }
            }
        }

        // A host that answered 4xx asked to be tried again later
        if let Some(error) = deferred {
            return Attempt::uniform(
                servers.last().map(|server| server.address(port)),
                recipients,
                &RecipientOutcome::Pending(error),
            );
        }

        let reason = match last_error {
            Some(DeliveryError::Connection(reason)) => reason,
            Some(error) => error.to_string(),
            None => "no candidate hosts".to_string(),
        };
        let error = DeliveryError::Connection(format!(
            "All {} host(s) failed, last error: {reason}",
            servers.len()
        ));

        Attempt::uniform(
            servers.last().map(|server| server.address(port)),
            recipients,
            &RecipientOutcome::Rejected(error),
        )
    }

    /// Writes `command`, reads its reply and records both in the transcript.
    async fn exchange(
        &self,
        client: &mut SmtpClient,
        address: &str,
        command: Command<'_>,
    ) -> Result<Response, DeliveryError> {
        let timeouts = &self.ctx.config.timeouts;
        let limit = match command {
            Command::Body(_) => timeouts.data(),
            Command::Quit => timeouts.quit(),
            _ => timeouts.command(),
        };

        self.ctx
            .emitter
            .command(self.domain, address, &command.to_string());

        let response = timed(limit, command.phase(), async {
            match command {
                Command::Ehlo(name) => client.ehlo(name).await,
                Command::Helo(name) => client.helo(name).await,
                Command::StartTls => client.starttls().await,
                Command::MailFrom(from) => client.mail_from(from).await,
                Command::RcptTo(to) => client.rcpt_to(to).await,
                Command::Data => client.data().await,
                Command::Body(body) => client.send_data(body).await,
                Command::Quit => client.quit().await,
            }
        })
        .await?;

        self.ctx
            .emitter
            .reply(self.domain, address, &response.to_string());
        Ok(response)
    }

    async fn connect_and_greet(
        &self,
        server: &MailServer,
        address: &str,
    ) -> Result<SmtpClient, DeliveryError> {
        let timeouts = &self.ctx.config.timeouts;
        let port = server.port.unwrap_or(self.ctx.config.port);

        self.ctx.emitter.log(
            Level::DEBUG,
            LogKind::Connect,
            Some(self.domain),
            format!("Connecting to {address}"),
        );

        let mut client = timed(
            timeouts.connect(),
            "connect",
            SmtpClient::connect(&server.host, port, server.host.clone()),
        )
        .await?
        .accept_invalid_certs(self.ctx.config.tls.accepts_invalid_certs());

        let greeting = timed(timeouts.command(), "greeting", client.read_greeting()).await?;
        self.ctx
            .emitter
            .reply(self.domain, address, &greeting.to_string());

        if greeting.is_temporary_error() {
            return Err(DeliveryError::TemporaryFailure(SmtpReply::from(&greeting)));
        }
        if !greeting.is_success() {
            return Err(DeliveryError::Connection(format!(
                "{address} refused the session: {greeting}"
            )));
        }

        Ok(client)
    }

    /// EHLO, falling back to HELO. Returns the EHLO reply when EHLO was
    /// accepted.
    async fn greet(
        &self,
        client: &mut SmtpClient,
        address: &str,
    ) -> Result<Option<Response>, DeliveryError> {
        let hostname = self.ctx.config.hostname.as_str();

        let ehlo = self.exchange(client, address, Command::Ehlo(hostname)).await?;
        if ehlo.is_success() {
            return Ok(Some(ehlo));
        }
        if ehlo.code == SERVICE_CLOSING {
            return Err(DeliveryError::TemporaryFailure(SmtpReply::from(&ehlo)));
        }

        let helo = self.exchange(client, address, Command::Helo(hostname)).await?;
        if helo.is_success() {
            return Ok(None);
        }
        if helo.is_temporary_error() {
            return Err(DeliveryError::TemporaryFailure(SmtpReply::from(&helo)));
        }

        Err(DeliveryError::Connection(format!(
            "{address} refused EHLO and HELO: {helo}"
        )))
    }

    async fn negotiate_tls(
        &self,
        client: &mut SmtpClient,
        address: &str,
        ehlo: Option<&Response>,
    ) -> Result<TlsNegotiationOutcome, DeliveryError> {
        let tls = &self.ctx.config.tls;
        if tls.is_disabled() {
            return Ok(TlsNegotiationOutcome::Skipped);
        }

        // HELO servers have no extensions
        let offered = ehlo.is_some_and(|reply| reply.has_extension("STARTTLS"));
        if !offered {
            if tls.is_required() {
                return Err(DeliveryError::Connection(format!(
                    "TLS is required but {address} does not offer STARTTLS"
                )));
            }
            return Ok(TlsNegotiationOutcome::Skipped);
        }

        let failure = match self.exchange(client, address, Command::StartTls).await {
            Ok(reply) if reply.is_success() => None,
            Ok(reply) => Some(format!("STARTTLS refused: {reply}")),
            Err(error) => Some(error.to_string()),
        };

        if let Some(failure) = failure {
            if tls.is_required() {
                return Err(DeliveryError::Connection(format!(
                    "TLS is required but negotiation with {address} failed: {failure}"
                )));
            }

            self.ctx.emitter.info(
                LogKind::Connect,
                self.domain,
                format!("STARTTLS with {address} failed ({failure}), reconnecting without TLS"),
            );
            return Ok(TlsNegotiationOutcome::RetryWithoutTls);
        }

        // RFC 3207: capabilities must be discovered again over TLS
        let ehlo = self
            .exchange(client, address, Command::Ehlo(&self.ctx.config.hostname))
            .await?;
        if !ehlo.is_success() {
            return Err(DeliveryError::Connection(format!(
                "{address} refused EHLO after STARTTLS: {ehlo}"
            )));
        }

        Ok(TlsNegotiationOutcome::Success)
    }

    /// A connected, greeted and (where possible) encrypted session.
    async fn establish(
        &self,
        server: &MailServer,
        address: &str,
    ) -> Result<SmtpClient, DeliveryError> {
        let mut client = self.connect_and_greet(server, address).await?;
        let ehlo = self.greet(&mut client, address).await?;

        match self.negotiate_tls(&mut client, address, ehlo.as_ref()).await? {
            TlsNegotiationOutcome::Success | TlsNegotiationOutcome::Skipped => Ok(client),
            TlsNegotiationOutcome::RetryWithoutTls => {
                drop(client);
                let mut client = self.connect_and_greet(server, address).await?;
                self.greet(&mut client, address).await?;
                Ok(client)
            }
        }
    }

    /// Runs the transaction. A network failure or timeout part way through
    /// rejects every recipient that has no verdict yet; a 421 defers them.
    async fn transact(
        &self,
        client: &mut SmtpClient,
        address: &str,
        recipients: &[Address],
    ) -> Vec<RecipientOutcome> {
        let mut outcomes = vec![None; recipients.len()];

        if let Err(error) = self
            .run_transaction(client, address, recipients, &mut outcomes)
            .await
        {
            self.ctx.emitter.warn(
                LogKind::Connect,
                self.domain,
                format!("Session with {address} failed ({}): {error}", error.kind()),
            );
            for outcome in outcomes.iter_mut().filter(|outcome| outcome.is_none()) {
                *outcome = Some(RecipientOutcome::Rejected(error.clone()));
            }
        }

        outcomes
            .into_iter()
            .map(|outcome| {
                outcome.unwrap_or_else(|| {
                    RecipientOutcome::Rejected(DeliveryError::Protocol(
                        "Transaction ended without a verdict".to_string(),
                    ))
                })
            })
            .collect()
    }

    async fn run_transaction(
        &self,
        client: &mut SmtpClient,
        address: &str,
        recipients: &[Address],
        outcomes: &mut [Option<RecipientOutcome>],
    ) -> Result<(), DeliveryError> {
        let reverse_path = self.ctx.envelope.reverse_path();
        let reply = self
            .exchange(client, address, Command::MailFrom(&reverse_path))
            .await?;
        if !reply.is_success() {
            let error = reply_error(&reply, "MAIL FROM", DeliveryError::SenderRejected);
            outcomes.fill(Some(RecipientOutcome::from_error(error)));
            return Ok(());
        }

        let mut accepted = Vec::with_capacity(recipients.len());
        for (index, recipient) in recipients.iter().enumerate() {
            let forward_path = recipient.to_string();
            let reply = self
                .exchange(client, address, Command::RcptTo(&forward_path))
                .await?;

            if reply.is_success() {
                accepted.push(index);
                continue;
            }

            let error = reply_error(&reply, "RCPT TO", DeliveryError::RecipientRejected);
            if reply.code == SERVICE_CLOSING {
                // Recipients accepted so far never got a message either
                defer_remaining(outcomes, &error);
                return Ok(());
            }
            outcomes[index] = Some(RecipientOutcome::from_error(error));
        }

        if accepted.is_empty() {
            return Ok(());
        }

        let body = self.ctx.source.open().await;
        if let Some(error) = &body.error {
            // Whatever was read is still sent; the server judges the message
            self.ctx.emitter.source_error(error);
        }

        let reply = self.exchange(client, address, Command::Data).await?;
        let verdict = if reply.is_intermediate() {
            let reply = self
                .exchange(client, address, Command::Body(&body.bytes))
                .await?;
            DeliveryError::from_data_reply(SmtpReply::from(&reply))
        } else if reply.is_success() {
            Some(DeliveryError::Protocol(format!(
                "Unexpected reply to DATA: {reply}"
            )))
        } else {
            DeliveryError::from_data_reply(SmtpReply::from(&reply))
        };

        let outcome = verdict.map_or(RecipientOutcome::Accepted, RecipientOutcome::from_error);
        for index in accepted {
            outcomes[index] = Some(outcome.clone());
        }

        Ok(())
    }

    async fn quit(&self, client: &mut SmtpClient, address: &str) {
        if let Err(error) = self.exchange(client, address, Command::Quit).await {
            tracing::debug!(server = address, %error, "QUIT failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(code: u16, text: &str) -> Response {
        Response::new(code, vec![text.to_string()])
    }

    #[test]
    fn test_command_display() {
        assert_eq!(Command::MailFrom("").to_string(), "MAIL FROM:<>");
        assert_eq!(
            Command::RcptTo("a@example.com").to_string(),
            "RCPT TO:<a@example.com>"
        );
        assert_eq!(Command::Body(b"hello").to_string(), "<5 bytes>");
        assert_eq!(Command::Ehlo("client.test").to_string(), "EHLO client.test");
    }

    #[test]
    fn test_reply_error_classification() {
        let temporary = reply_error(
            &response(450, "greylisted"),
            "RCPT TO",
            DeliveryError::RecipientRejected,
        );
        assert!(temporary.is_temporary());
        assert_eq!(
            temporary,
            DeliveryError::RecipientRejected(SmtpReply::new(450, "greylisted"))
        );

        let permanent = reply_error(
            &response(550, "no"),
            "MAIL FROM",
            DeliveryError::SenderRejected,
        );
        assert!(permanent.is_permanent());

        let odd = reply_error(&response(354, "what"), "RCPT TO", DeliveryError::RecipientRejected);
        assert!(matches!(odd, DeliveryError::Protocol(_)));
    }

    #[test]
    fn test_defer_remaining_keeps_verdicts() {
        let rejected = DeliveryError::RecipientRejected(SmtpReply::new(550, "unknown"));
        let closing = DeliveryError::RecipientRejected(SmtpReply::new(421, "shutting down"));
        let mut outcomes = vec![
            Some(RecipientOutcome::Rejected(rejected.clone())),
            None,
            None,
        ];

        defer_remaining(&mut outcomes, &closing);

        assert_eq!(
            outcomes,
            vec![
                Some(RecipientOutcome::Rejected(rejected)),
                Some(RecipientOutcome::Pending(closing.clone())),
                Some(RecipientOutcome::Pending(closing)),
            ]
        );
    }

    #[tokio::test]
    async fn test_timed_reports_phase() {
        let result: Result<(), DeliveryError> = timed(
            Duration::from_millis(5),
            "greeting",
            std::future::pending::<Result<(), ClientError>>(),
        )
        .await;

        assert_eq!(
            result,
            Err(DeliveryError::Timeout {
                phase: "greeting",
                limit: Duration::from_millis(5)
            })
        );
    }
}
