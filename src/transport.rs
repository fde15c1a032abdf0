use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Problem};

pub(crate) const CONTENT_TYPE_JOSE_JSON: &str = "application/jose+json";
const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_TYPE_PROBLEM_JSON: &str = "application/problem+json";
pub(crate) const HEADER_REPLAY_NONCE: &str = "replay-nonce";
pub(crate) const HEADER_LOCATION: &str = "location";
const HEADER_CONTENT_TYPE: &str = "content-type";

/// How a single ACME exchange hits the wire.
#[derive(Debug)]
pub(crate) enum BodyMode {
    Head,
    Get,
    Post(Vec<u8>),
}

/// One fully decoded ACME response.
#[derive(Debug, Clone)]
pub struct DecodedResponse {
    /// Three-digit status code, kept as a string.
    pub code: String,
    /// Response headers with case-folded (lower-case) names.
    pub headers: HashMap<String, String>,
    pub body: ResponseBody,
}

#[derive(Debug, Clone)]
pub enum ResponseBody {
    /// Parsed `application/json` payload.
    Json(Value),
    /// Anything else, e.g. a PEM certificate chain.
    Bytes(Vec<u8>),
}

impl DecodedResponse {
    /// Parsed JSON body, if the server sent one.
    #[must_use]
    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Json(value) => Some(value),
            ResponseBody::Bytes(_) => None,
        }
    }

    /// Header lookup by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
struct ProblemDocument {
    #[serde(rename = "type")]
    kind: Option<String>,
    detail: Option<String>,
    #[serde(default)]
    subproblems: Vec<SubproblemDocument>,
}

#[derive(Debug, Deserialize)]
struct SubproblemDocument {
    #[serde(rename = "type")]
    kind: Option<String>,
    detail: Option<String>,
    identifier: Option<IdentifierDocument>,
}

#[derive(Debug, Deserialize)]
struct IdentifierDocument {
    value: Option<String>,
}

/// Decodes one HTTP exchange into the response model.
///
/// Problem documents become `Error::Protocol` regardless of status;
/// any other non-2xx status becomes `Error::HttpStatus`.
///
/// # Errors
/// `Error::Protocol`, `Error::HttpStatus`, or `Error::Json` when a
/// JSON body does not parse.
pub(crate) fn decode(
    url: &str,
    code: String,
    headers: HashMap<String, String>,
    raw: Vec<u8>,
) -> Result<DecodedResponse, Error> {
    let content_type = headers
        .get(HEADER_CONTENT_TYPE)
        .map(|value| {
            value
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
        .unwrap_or_default();

    if content_type == CONTENT_TYPE_PROBLEM_JSON {
        let document: ProblemDocument = serde_json::from_slice(&raw)?;
        return Err(Error::Protocol(problem_from_document(document)));
    }

    let body = if content_type == CONTENT_TYPE_JSON {
        ResponseBody::Json(serde_json::from_slice(&raw)?)
    } else {
        ResponseBody::Bytes(raw)
    };

    if !code.starts_with('2') {
        return Err(Error::HttpStatus {
            code,
            url: url.to_owned(),
        });
    }

    Ok(DecodedResponse {
        code,
        headers,
        body,
    })
}

fn problem_from_document(document: ProblemDocument) -> Problem {
    let subproblems = document
        .subproblems
        .into_iter()
        .map(|sub| {
            let value = sub
                .identifier
                .and_then(|identifier| identifier.value)
                .unwrap_or_default();
            Problem {
                kind: sub.kind.unwrap_or_default(),
                detail: format!("\"{value}\": {}", sub.detail.unwrap_or_default()),
                subproblems: Vec::new(),
            }
        })
        .collect();
    Problem {
        kind: document.kind.unwrap_or_default(),
        detail: document.detail.unwrap_or_default(),
        subproblems,
    }
}
