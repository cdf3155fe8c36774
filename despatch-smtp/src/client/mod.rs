//! SMTP client used by the delivery engine.
//!
//! The client owns a line-buffered connection layered over a
//! [`RedirectableStream`](crate::redirect::RedirectableStream), so a STARTTLS
//! upgrade swaps the transport without rebuilding the buffers.

mod error;
mod response;
mod smtp_client;
mod tls;

pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use smtp_client::{MAX_LINE_LENGTH, SmtpClient};
pub use tls::{CertificatePolicy, RustlsUpgrade, TlsUpgrade};
