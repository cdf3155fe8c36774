use despatch_common::{incoming, outgoing};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter,
};

use super::{
    error::{ClientError, Result},
    response::Response,
    tls::TlsUpgrade,
};
use crate::redirect::RedirectableStream;

/// Longest reply line accepted from a server, terminator included.
pub const MAX_LINE_LENGTH: usize = 8192;

/// An SMTP client for sending commands and receiving responses.
///
/// Every command is flushed before its reply is read, so the write buffer is
/// always empty between commands.
pub struct SmtpClient {
    stream: BufReader<BufWriter<RedirectableStream>>,
    line: Vec<u8>,
}

impl SmtpClient {
    pub fn new(stream: impl Into<RedirectableStream>) -> Self {
        Self {
            stream: BufReader::new(BufWriter::new(stream.into())),
            line: Vec::with_capacity(512),
        }
    }

    /// Reads the server's opening banner.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting is malformed.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Sends a command to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        outgoing!("{command}");

        self.stream.write_all(command.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Sends a command and reads the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.send_command(command).await?;
        self.read_response().await
    }

    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}")).await
    }

    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("HELO {domain}")).await
    }

    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{from}>")).await
    }

    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Streams a message body after a `354` reply and reads the final reply.
    ///
    /// The body is sent line by line with CRLF terminators. Lines starting
    /// with `.` are dot-stuffed, and the body is closed with a lone `.` line.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the body, writing to the server, or reading
    /// the reply fails.
    pub async fn send_data<R>(&mut self, mut body: R) -> Result<Response>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut line = Vec::new();
        let mut sent = 0usize;

        loop {
            line.clear();
            if body.read_until(b'\n', &mut line).await? == 0 {
                break;
            }

            let content = strip_line_ending(&line);
            if content.first() == Some(&b'.') {
                self.stream.write_all(b".").await?;
            }
            self.stream.write_all(content).await?;
            self.stream.write_all(b"\r\n").await?;
            sent += content.len() + 2;
        }

        outgoing!("<{sent} bytes of message data>");
        self.send_command(".").await?;
        self.read_response().await
    }

    /// Sends `STARTTLS` and, if the server agrees, upgrades the connection in
    /// place using `tls`.
    ///
    /// A refusal is returned as the server's reply without touching the
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails, if the server pipelined data
    /// after its reply, or if the handshake fails. After a handshake failure
    /// the connection is unusable.
    pub async fn starttls(&mut self, server_name: &str, tls: &dyn TlsUpgrade) -> Result<Response> {
        let response = self.command("STARTTLS").await?;
        if !response.is_success() {
            return Ok(response);
        }

        if !self.stream.buffer().is_empty() {
            return Err(ClientError::BufferedInput);
        }

        let plain = self.redirect().detach();
        let secure = tls.upgrade(plain, server_name).await?;
        // What comes back is the placeholder installed by `detach`.
        let _ = self.redirect().swap(secure);

        Ok(response)
    }

    fn redirect(&mut self) -> &mut RedirectableStream {
        self.stream.get_mut().get_mut()
    }

    /// Reads a complete, possibly multi-line, reply.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the reply is malformed.
    pub async fn read_response(&mut self) -> Result<Response> {
        let mut code = None;
        let mut lines = Vec::new();

        loop {
            let raw = self.read_line().await?;
            let parsed = Response::parse_line(&raw)?;
            Response::check_code(code, parsed.code)?;
            code = Some(parsed.code);
            lines.push(parsed.message);

            if parsed.is_last {
                let response = Response::new(parsed.code, lines);
                incoming!("{response}");
                return Ok(response);
            }
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        self.line.clear();

        let limit = MAX_LINE_LENGTH as u64;
        let read = (&mut self.stream)
            .take(limit)
            .read_until(b'\n', &mut self.line)
            .await?;

        if read == 0 {
            return Err(ClientError::ConnectionClosed);
        }

        if !self.line.ends_with(b"\n") {
            return Err(if read >= MAX_LINE_LENGTH {
                ClientError::LineTooLong(MAX_LINE_LENGTH)
            } else {
                ClientError::ConnectionClosed
            });
        }

        Ok(String::from_utf8_lossy(strip_line_ending(&self.line)).into_owned())
    }
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
