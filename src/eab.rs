use serde::Deserialize;

/// External account binding credentials issued by a CA that requires
/// pre-registration (RFC 8555 section 7.3.4).
///
/// The HMAC key is accepted in base64url or standard base64, matching
/// what CAs hand out in practice.
#[derive(Debug, Clone, Deserialize)]
pub struct EabCredentials {
    pub kid: String,
    #[serde(alias = "key")]
    pub hmac: String,
}
