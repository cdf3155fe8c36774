//! SMTP reply parsing and representation.

use std::fmt;

use super::error::{ClientError, Result};

/// A single line of an SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    /// The three digit reply code.
    pub code: u16,
    /// Whether this line terminates the reply.
    pub is_last: bool,
    /// The text following the code and separator.
    pub message: String,
}

/// A complete SMTP reply, possibly spanning several lines that share one code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// 2xx: the command was accepted.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// 3xx: the server is waiting for more input (e.g. 354 after DATA).
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    /// Whether an EHLO reply advertises `keyword`.
    ///
    /// The first line of an EHLO reply is the server's greeting, the rest are
    /// extension keywords optionally followed by parameters. Matching is case
    /// insensitive on the keyword only.
    #[must_use]
    pub fn has_capability(&self, keyword: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|token| token.eq_ignore_ascii_case(keyword))
        })
    }

    /// Parses a single reply line (without its line terminator).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Parse`] if the line does not start with a three
    /// digit code, or if the code is followed by anything other than a space
    /// or `-`.
    pub fn parse_line(line: &str) -> Result<ResponseLine> {
        let bytes = line.as_bytes();

        if bytes.len() < 3 {
            return Err(ClientError::Parse(format!(
                "Response line too short: '{line}'"
            )));
        }

        if !bytes[..3].iter().all(u8::is_ascii_digit) {
            return Err(ClientError::Parse(format!(
                "Invalid status code: '{}'",
                line.chars().take(3).collect::<String>()
            )));
        }

        let code = u16::from(bytes[0] - b'0') * 100
            + u16::from(bytes[1] - b'0') * 10
            + u16::from(bytes[2] - b'0');

        // The text after a final reply code is optional (RFC 5321 4.2), so a
        // bare code is a final line.
        let is_last = match bytes.get(3) {
            None | Some(b' ') => true,
            Some(b'-') => false,
            Some(_) => {
                return Err(ClientError::Parse(format!(
                    "Invalid separator character in '{line}'"
                )));
            }
        };

        let message = line.get(4..).unwrap_or_default().to_string();

        Ok(ResponseLine {
            code,
            is_last,
            message,
        })
    }

    /// Assemble a reply from already split lines.
    ///
    /// Returns `Ok(None)` if the final line has not been seen yet.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Parse`] if any line is malformed, or if a
    /// continuation line carries a different code than the first line.
    pub fn from_lines<'a, I>(lines: I) -> Result<Option<Self>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut code = None;
        let mut messages = Vec::new();

        for line in lines {
            let parsed = Self::parse_line(line)?;
            Self::check_code(code, parsed.code)?;
            code = Some(parsed.code);
            messages.push(parsed.message);

            if parsed.is_last {
                return Ok(Some(Self::new(parsed.code, messages)));
            }
        }

        Ok(None)
    }

    pub(crate) fn check_code(expected: Option<u16>, got: u16) -> Result<()> {
        match expected {
            Some(code) if code != got => Err(ClientError::Parse(format!(
                "Status code mismatch in multi-line response: expected {code}, got {got}"
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.lines.join(" / "))
    }
}
