//! SMTP transaction execution.
//!
//! One [`SmtpTransaction`] drives one connection: greeting, EHLO (or HELO),
//! STARTTLS when offered, then MAIL/RCPT/DATA for each mail in turn. It
//! reports back the mails it did not deliver, in their original order.

use std::{future::Future, time::Duration};

use chrono::Utc;
use despatch_common::{Shutdown, internal};
use despatch_queue::{MailReference, Queue};
use despatch_smtp::{
    BoxedIo, ClientError, RedirectableStream, Response, SmtpClient, TlsUpgrade,
};

use crate::{
    config::SmtpTimeouts,
    error::{ConnectionError, MailError, ProtocolError},
    failure::FailureStore,
};

/// Collaborators shared by every connection in a sweep.
#[derive(Clone, Copy)]
pub struct Environment<'a> {
    /// Name announced in EHLO/HELO.
    pub local_domain: &'a str,
    pub queue: &'a dyn Queue,
    pub tls: &'a dyn TlsUpgrade,
    pub timeouts: &'a SmtpTimeouts,
}

/// Run `fut` under an optional deadline, giving up early on shutdown.
async fn exchange<T, F>(
    shutdown: &mut Shutdown,
    command: &'static str,
    deadline: Option<Duration>,
    fut: F,
) -> Result<T, ProtocolError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    let outcome = match deadline {
        Some(timeout) => shutdown
            .guard(tokio::time::timeout(timeout, fut))
            .await
            .map(|result| result.map_err(|_| ProtocolError::TimedOut { command, timeout })),
        None => shutdown.guard(fut).await.map(Ok),
    };

    match outcome {
        Some(result) => Ok(result??),
        None => Err(ProtocolError::Cancelled),
    }
}

fn expect(
    command: &'static str,
    response: Response,
    accept: fn(&Response) -> bool,
) -> Result<Response, ProtocolError> {
    if accept(&response) {
        Ok(response)
    } else {
        Err(ProtocolError::Rejected { command, response })
    }
}

/// Drives one connection through a batch of mail for a single server.
pub struct SmtpTransaction<'a> {
    env: Environment<'a>,
    /// Host the connection was made to; used for TLS validation.
    server_name: &'a str,
    failures: &'a mut FailureStore,
    shutdown: &'a mut Shutdown,
}

impl<'a> SmtpTransaction<'a> {
    pub const fn new(
        env: Environment<'a>,
        server_name: &'a str,
        failures: &'a mut FailureStore,
        shutdown: &'a mut Shutdown,
    ) -> Self {
        Self {
            env,
            server_name,
            failures,
            shutdown,
        }
    }

    /// Deliver as many of `mails` as possible over `stream`.
    ///
    /// Returns the mails that were not delivered, in their original order. A
    /// failure setting up the session returns every mail. A mail refused part
    /// way through its transcript is returned and the next mail is attempted
    /// on the same session, with no RSET in between. A malformed reply, an I/O
    /// error or a timeout abandons the session and returns the current mail
    /// with everything after it. `QUIT` is only sent if no mail failed;
    /// otherwise the connection is simply dropped.
    pub async fn run(mut self, stream: BoxedIo, mails: Vec<MailReference>) -> Vec<MailReference> {
        let mut client = SmtpClient::new(RedirectableStream::from(stream));

        if let Err(err) = self.negotiate(&mut client).await {
            if err.is_cancelled() {
                internal!(level = INFO, "Session with {} cancelled", self.server_name);
            } else {
                internal!(
                    level = WARN,
                    "Session with {} failed, {} mail(s) left unsent: {err}",
                    self.server_name,
                    mails.len()
                );
            }
            return mails;
        }

        let mut unsent = Vec::new();
        let mut failed = false;
        let mut remaining = mails.into_iter();

        while let Some(mail) = remaining.next() {
            if self.shutdown.is_triggered() {
                unsent.push(mail);
                unsent.extend(remaining);
                return unsent;
            }

            if !self.failures.is_ready_to_send(&mail.id, Utc::now()) {
                internal!(level = DEBUG, "Mail {} is still backing off", mail.id);
                unsent.push(mail);
                continue;
            }

            match self.send_mail(&mut client, &mail).await {
                Ok(()) => self.delivered(&mail).await,
                Err(err) if err.ends_session() => {
                    if !err.is_cancelled() {
                        internal!(
                            level = WARN,
                            "Session with {} abandoned at mail {}: {err}",
                            self.server_name,
                            mail.id
                        );
                    }
                    unsent.push(mail);
                    unsent.extend(remaining);
                    return unsent;
                }
                Err(err) => {
                    internal!(
                        level = WARN,
                        "Mail {} not delivered to {}: {err}",
                        mail.id,
                        self.server_name
                    );
                    failed = true;
                    unsent.push(mail);
                }
            }
        }

        if !failed {
            let timeout = self.env.timeouts.command();
            if let Err(err) = exchange(self.shutdown, "QUIT", timeout, client.quit()).await {
                internal!(level = DEBUG, "QUIT to {} failed: {err}", self.server_name);
            }
        }

        unsent
    }

    /// Greeting, hello and, when advertised, STARTTLS followed by a fresh hello.
    async fn negotiate(&mut self, client: &mut SmtpClient) -> Result<(), ConnectionError> {
        let timeout = self.env.timeouts.command();

        let greeting = exchange(self.shutdown, "greeting", timeout, client.read_greeting())
            .await
            .map_err(ConnectionError::Greeting)?;
        expect("greeting", greeting, Response::is_success).map_err(ConnectionError::Greeting)?;

        let (hello, extended) = self.hello(client).await?;
        if !(extended && hello.has_capability("STARTTLS")) {
            return Ok(());
        }

        let tls = self.env.tls;
        let server_name = self.server_name;
        match exchange(
            self.shutdown,
            "STARTTLS",
            timeout,
            client.starttls(server_name, tls),
        )
        .await
        {
            Ok(response) => {
                expect("STARTTLS", response, Response::is_success)
                    .map_err(ConnectionError::StartTls)?;
            }
            Err(ProtocolError::Client(
                err @ (ClientError::Tls(_) | ClientError::BufferedInput),
            )) => return Err(ConnectionError::Handshake(err)),
            Err(err) => return Err(ConnectionError::StartTls(err)),
        }

        internal!(level = DEBUG, "Upgraded connection to {server_name} to TLS");

        self.hello(client).await.map(|_| ())
    }

    /// EHLO, falling back to HELO. The flag is `true` for an EHLO session.
    async fn hello(&mut self, client: &mut SmtpClient) -> Result<(Response, bool), ConnectionError> {
        let timeout = self.env.timeouts.command();
        let local = self.env.local_domain;

        let ehlo = exchange(self.shutdown, "EHLO", timeout, client.ehlo(local))
            .await
            .map_err(ConnectionError::Hello)?;
        if ehlo.is_success() {
            return Ok((ehlo, true));
        }

        internal!(
            level = DEBUG,
            "EHLO refused by {} ({ehlo}), trying HELO",
            self.server_name
        );

        let helo = exchange(self.shutdown, "HELO", timeout, client.helo(local))
            .await
            .map_err(ConnectionError::Hello)?;
        expect("HELO", helo, Response::is_success)
            .map(|helo| (helo, false))
            .map_err(ConnectionError::Hello)
    }

    async fn send_mail(
        &mut self,
        client: &mut SmtpClient,
        mail: &MailReference,
    ) -> Result<(), MailError> {
        let command_timeout = self.env.timeouts.command();
        let open = self.env.queue.open(mail).await?;

        let response = exchange(
            self.shutdown,
            "MAIL FROM",
            command_timeout,
            client.mail_from(&open.sender),
        )
        .await?;
        expect("MAIL FROM", response, Response::is_success)?;

        for recipient in &open.recipients {
            let response = exchange(
                self.shutdown,
                "RCPT TO",
                command_timeout,
                client.rcpt_to(recipient),
            )
            .await?;
            expect("RCPT TO", response, Response::is_success)?;
        }

        let response = exchange(self.shutdown, "DATA", command_timeout, client.data()).await?;
        expect("DATA", response, Response::is_intermediate)?;

        let response = exchange(
            self.shutdown,
            "message data",
            self.env.timeouts.data(),
            client.send_data(open.body),
        )
        .await?;
        expect("message data", response, Response::is_success)?;

        Ok(())
    }

    async fn delivered(&mut self, mail: &MailReference) {
        internal!(
            level = INFO,
            "Delivered mail {} for {} to {}",
            mail.id,
            mail.domain,
            self.server_name
        );

        self.failures.remove(&mail.id);
        if let Err(err) = self.env.queue.delete(mail).await {
            internal!(
                level = ERROR,
                "Mail {} was delivered but could not be removed from the queue: {err}",
                mail.id
            );
        }
    }
}
