//! Client side of the SMTP wire protocol.
//!
//! [`redirect::RedirectableStream`] lets a connection be upgraded to TLS in
//! place, [`client::SmtpClient`] speaks line-oriented SMTP on top of it.

pub mod client;
pub mod redirect;

pub use client::{
    CertificatePolicy, ClientError, Response, RustlsUpgrade, SmtpClient, TlsUpgrade,
};
pub use redirect::{BoxedIo, Io, RedirectableStream};
