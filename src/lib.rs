//! JWS-signed request core for ACME v2 (RFC 8555).
//!
//! The engine owns an account key, discovers the server's resource
//! directory, manages anti-replay nonces, signs every request as a
//! flattened JWS and translates problem responses into structured
//! errors. Certificate orchestration (orders, challenges, finalize)
//! sits on top of [`AcmeClient::request`] and is out of scope here.

mod b64;
pub mod client;
mod der;
pub mod eab;
pub mod error;
pub mod key;
pub mod transport;

pub use client::{AcmeClient, ClientOptions, Mode};
pub use eab::EabCredentials;
pub use error::{Error, Problem};
pub use key::{AccountKey, Jwk};
pub use transport::{DecodedResponse, ResponseBody};
