pub const URN_BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";

/// Errors raised by the ACME request core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The account key input was not a parseable private key.
    #[error("failed to load account key: {0}")]
    KeyLoad(String),

    /// The input is a private key of a kind the engine cannot sign with.
    #[error("unsupported account key kind, expected RSA or EC P-256/P-384/P-521")]
    UnsupportedKeyKind,

    /// The signing primitive failed.
    #[error("signing failed: {0}")]
    Sign(String),

    /// The DER ECDSA signature did not have the expected structure.
    #[error("malformed ECDSA signature: {0}")]
    MalformedSignature(&'static str),

    /// The directory could not be loaded or a resource name did not
    /// resolve to a URL.
    #[error("ACME directory error: {0}")]
    Directory(String),

    /// Connection failure or local I/O while talking to the server.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-2xx status without an accompanying problem document.
    #[error("HTTP status {code} from {url}")]
    HttpStatus { code: String, url: String },

    /// An `application/problem+json` response from the server.
    #[error(transparent)]
    Protocol(#[from] Problem),

    /// The server sent a body that is not well-formed JSON.
    #[error("malformed JSON from server: {0}")]
    Json(#[from] serde_json::Error),

    /// A signed request was issued before an account key was loaded.
    #[error("no account key loaded")]
    NoKeyLoaded,

    /// A `newNonce` exchange completed without yielding a nonce.
    #[error("server response did not carry a Replay-Nonce header")]
    MissingNonce,

    /// A `newAccount` response arrived without a `Location` header.
    #[error("newAccount response did not carry a Location header")]
    MissingAccountUrl,
}

/// RFC 7807 problem document as the ACME server reports it.
///
/// Subproblems reuse the same shape; their `detail` is prefixed with
/// the quoted identifier value they apply to.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct Problem {
    /// The `urn:ietf:params:acme:error:*` URN.
    pub kind: String,
    pub detail: String,
    pub subproblems: Vec<Problem>,
}

impl Problem {
    /// True when the server rejected the anti-replay nonce.
    #[must_use]
    pub fn is_bad_nonce(&self) -> bool {
        self.kind == URN_BAD_NONCE
    }
}
