use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use ring::hmac;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::b64::{b64, decode_lenient};
use crate::eab::EabCredentials;
use crate::error::Error;
use crate::key::{AccountKey, Jwk};
use crate::transport::{
    self, BodyMode, CONTENT_TYPE_JOSE_JSON, DecodedResponse, HEADER_LOCATION,
    HEADER_REPLAY_NONCE, ResponseBody,
};

const LIVE_DIRECTORY_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";
const STAGING_DIRECTORY_URL: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
const DEFAULT_USER_AGENT: &str = concat!("acmewire/", env!("CARGO_PKG_VERSION"));

const RESOURCE_NEW_NONCE: &str = "newNonce";
const RESOURCE_NEW_ACCOUNT: &str = "newAccount";
/// Reserved directory slot for caller-supplied absolute URLs.
const RESOURCE_TMP: &str = "_tmp";

const ALG_HS256: &str = "HS256";

/// Which ACME environment the directory is loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Live,
    Staging,
}

impl Mode {
    #[must_use]
    pub fn directory_url(self) -> &'static str {
        match self {
            Mode::Live => LIVE_DIRECTORY_URL,
            Mode::Staging => STAGING_DIRECTORY_URL,
        }
    }
}

/// Tunables for the request engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Overrides the default `acmewire/<version>` User-Agent.
    pub user_agent: Option<String>,
    pub directory_fetch_attempts: u64,
    pub directory_fetch_base_delay_secs: u64,
    pub directory_fetch_max_delay_secs: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user_agent: None,
            directory_fetch_attempts: 3,
            directory_fetch_base_delay_secs: 1,
            directory_fetch_max_delay_secs: 10,
        }
    }
}

/// The JWS-signed request engine at the core of an ACME v2 client.
///
/// Owns the account key, the lazily fetched directory, the anti-replay
/// nonce slot and the account binding. One engine serializes its
/// requests through the single nonce slot; concurrent use of one
/// engine requires external mutual exclusion.
pub struct AcmeClient {
    client: Client,
    directory_url: String,
    directory: Option<Map<String, Value>>,
    key: Option<AccountKey>,
    kid: Option<String>,
    nonce: Option<String>,
    options: ClientOptions,
}

/// Protected JWS header. The key identification is a sum type: either
/// the embedded public key (first contact) or the account URL.
#[derive(Serialize)]
struct Protected<'a> {
    alg: &'a str,
    #[serde(flatten)]
    key: KeyOrKeyId<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<&'a str>,
    url: &'a str,
}

enum KeyOrKeyId<'a> {
    Key(&'a Jwk),
    KeyId(&'a str),
}

// Hand-written: the field is flattened into `Protected`, and serde can
// only flatten map-shaped values, not tagged enum variants.
impl Serialize for KeyOrKeyId<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            KeyOrKeyId::Key(jwk) => map.serialize_entry("jwk", jwk)?,
            KeyOrKeyId::KeyId(kid) => map.serialize_entry("kid", kid)?,
        }
        map.end()
    }
}

impl AcmeClient {
    /// Creates an engine for one of the built-in Let's Encrypt
    /// environments.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(mode: Mode, options: ClientOptions) -> Result<Self, Error> {
        Self::from_directory_url(mode.directory_url(), options)
    }

    /// Creates an engine against an arbitrary ACME directory URL
    /// (compatible CAs, test servers).
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_directory_url(
        directory_url: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self, Error> {
        let user_agent = options
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_owned());
        let client = Client::builder().user_agent(user_agent).build()?;
        Ok(Self {
            client,
            directory_url: directory_url.into(),
            directory: None,
            key: None,
            kid: None,
            nonce: None,
            options,
        })
    }

    /// Loads (or replaces) the account private key.
    ///
    /// Replacing the key discards the cached account URL; the next
    /// signed request re-binds against the server.
    ///
    /// # Errors
    /// Returns `Error::KeyLoad` or `Error::UnsupportedKeyKind` when
    /// the PEM does not yield an RSA or EC key.
    pub fn load_account_key(&mut self, pem: &str) -> Result<(), Error> {
        let key = AccountKey::from_pem(pem)?;
        info!(alg = key.alg(), "account key loaded");
        self.key = Some(key);
        self.kid = None;
        Ok(())
    }

    /// Returns the account URL, discovering it through `newAccount`
    /// with `onlyReturnExisting` when the binding is not yet known.
    ///
    /// # Errors
    /// Propagates any request error; `Error::MissingAccountUrl` when
    /// the server never sent a `Location`.
    pub async fn account_id(&mut self) -> Result<String, Error> {
        self.ensure_account().await?;
        self.kid.clone().ok_or(Error::MissingAccountUrl)
    }

    /// Builds the key authorization string for a challenge token.
    ///
    /// # Errors
    /// Returns `Error::NoKeyLoaded` when no account key is loaded.
    pub fn key_authorization(&self, token: &str) -> Result<String, Error> {
        let key = self.key.as_ref().ok_or(Error::NoKeyLoaded)?;
        Ok(format!("{token}.{}", key.thumbprint()))
    }

    /// Issues a signed request against a directory resource name or an
    /// absolute URL. `None` as payload sends a POST-as-GET.
    ///
    /// A `badNonce` rejection is transparently retried once: the
    /// failing response already replaced the nonce, so the retry signs
    /// the same payload under the fresh one.
    ///
    /// # Errors
    /// `Error::NoKeyLoaded` before a key is loaded; otherwise the
    /// transport, directory and protocol errors of the exchange.
    pub async fn request<T>(
        &mut self,
        resource: &str,
        payload: Option<&T>,
    ) -> Result<DecodedResponse, Error>
    where
        T: Serialize + ?Sized,
    {
        if self.key.is_none() {
            return Err(Error::NoKeyLoaded);
        }
        self.fetch_directory().await?;
        let name = if is_absolute_url(resource) {
            self.stash_url(resource)?;
            RESOURCE_TMP
        } else {
            resource
        };
        self.request_named(name, payload).await
    }

    /// Builds a nested JWS for embedding in another request's payload
    /// (key rollover). The protected header carries the public key and
    /// no nonce.
    ///
    /// # Errors
    /// `Error::NoKeyLoaded` before a key is loaded; directory errors
    /// when the resource does not resolve.
    pub async fn inner_jws<T>(&mut self, resource: &str, payload: &T) -> Result<Value, Error>
    where
        T: Serialize + ?Sized,
    {
        if self.key.is_none() {
            return Err(Error::NoKeyLoaded);
        }
        self.fetch_directory().await?;
        let name = if is_absolute_url(resource) {
            self.stash_url(resource)?;
            RESOURCE_TMP
        } else {
            resource
        };
        let url = self.resolve(name)?;
        let payload64 = b64(&serde_json::to_vec(payload)?);
        self.flattened_jws(&url, &payload64, true, None)
    }

    /// Builds the HS256 external account binding object for a
    /// `newAccount` payload.
    ///
    /// # Errors
    /// `Error::NoKeyLoaded` before a key is loaded; `Error::KeyLoad`
    /// when the HMAC key is not base64.
    pub fn external_account_binding(
        &self,
        url: &str,
        creds: &EabCredentials,
    ) -> Result<Value, Error> {
        let key = self.key.as_ref().ok_or(Error::NoKeyLoaded)?;
        let protected = json!({
            "alg": ALG_HS256,
            "kid": creds.kid,
            "url": url,
        });
        let protected64 = b64(&serde_json::to_vec(&protected)?);
        let payload64 = b64(&serde_json::to_vec(key.jwk())?);

        let hmac_key = decode_lenient(&creds.hmac)
            .map_err(|e| Error::KeyLoad(format!("invalid EAB HMAC key: {e}")))?;
        let signing_input = format!("{protected64}.{payload64}");
        let mac = hmac::sign(
            &hmac::Key::new(hmac::HMAC_SHA256, &hmac_key),
            signing_input.as_bytes(),
        );

        Ok(json!({
            "protected": protected64,
            "payload": payload64,
            "signature": b64(mac.as_ref()),
        }))
    }

    async fn request_named<T>(
        &mut self,
        name: &str,
        payload: Option<&T>,
    ) -> Result<DecodedResponse, Error>
    where
        T: Serialize + ?Sized,
    {
        if self.key.is_none() {
            return Err(Error::NoKeyLoaded);
        }
        self.fetch_directory().await?;
        let url = self.resolve(name)?;

        let payload64 = match payload {
            Some(payload) => b64(&serde_json::to_vec(payload)?),
            None => String::new(),
        };
        let use_jwk = name == RESOURCE_NEW_ACCOUNT;
        if !use_jwk {
            self.ensure_account().await?;
        }

        let mut retried = false;
        let response = loop {
            let nonce = self.take_nonce().await?;
            let jws = self.flattened_jws(&url, &payload64, use_jwk, Some(&nonce))?;
            debug!(%url, "signed POST");
            match self
                .http(&url, BodyMode::Post(serde_json::to_vec(&jws)?))
                .await
            {
                Err(Error::Protocol(problem)) if problem.is_bad_nonce() && !retried => {
                    warn!("server rejected the nonce, retrying once with the fresh one");
                    retried = true;
                }
                outcome => break outcome?,
            }
        };

        if name == RESOURCE_NEW_ACCOUNT && self.kid.is_none() {
            if let Some(location) = response.header(HEADER_LOCATION) {
                info!(account = location, "account bound");
                self.kid = Some(location.to_owned());
            }
        }
        Ok(response)
    }

    /// Discovers the account URL for `kid`-addressed requests.
    async fn ensure_account(&mut self) -> Result<(), Error> {
        if self.kid.is_some() {
            return Ok(());
        }
        debug!("account URL unknown, asking the server for the existing account");
        let payload = json!({ "onlyReturnExisting": true });
        // Boxed to break the request_named -> ensure_account cycle.
        let lookup: Pin<Box<dyn Future<Output = Result<DecodedResponse, Error>> + '_>> =
            Box::pin(self.request_named(RESOURCE_NEW_ACCOUNT, Some(&payload)));
        lookup.await?;
        if self.kid.is_none() {
            return Err(Error::MissingAccountUrl);
        }
        Ok(())
    }

    /// Returns the most recent nonce, fetching one from `newNonce`
    /// when the slot is empty. The slot is never cleared here; every
    /// response overwrites it.
    async fn take_nonce(&mut self) -> Result<String, Error> {
        if self.nonce.is_none() {
            let url = self.resolve(RESOURCE_NEW_NONCE)?;
            debug!("nonce slot empty, fetching a fresh one");
            self.http(&url, BodyMode::Head).await?;
        }
        self.nonce.clone().ok_or(Error::MissingNonce)
    }

    /// Fetches and caches the directory on first use.
    ///
    /// # Errors
    /// `Error::Directory` when the body is not a JSON object, or the
    /// last fetch error once all attempts are spent.
    async fn fetch_directory(&mut self) -> Result<(), Error> {
        if self.directory.is_some() {
            return Ok(());
        }
        info!("fetching ACME directory from {}", self.directory_url);
        let attempts = self.options.directory_fetch_attempts.max(1);
        let mut delay_secs = self.options.directory_fetch_base_delay_secs;
        let mut last_err = None;
        for attempt in 1..=attempts {
            let url = self.directory_url.clone();
            match self.load_directory(&url).await {
                Ok(()) => return Ok(()),
                Err(err) => last_err = Some(err),
            }
            if attempt < attempts {
                warn!(
                    "ACME directory fetch failed (attempt {}/{}), retrying in {}s...",
                    attempt, attempts, delay_secs
                );
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                delay_secs = delay_secs
                    .saturating_mul(2)
                    .min(self.options.directory_fetch_max_delay_secs);
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::Directory("directory fetch failed".to_owned())))
    }

    async fn load_directory(&mut self, url: &str) -> Result<(), Error> {
        let response = self.http(url, BodyMode::Get).await?;
        match response.body {
            ResponseBody::Json(Value::Object(map)) => {
                self.directory = Some(map);
                Ok(())
            }
            _ => Err(Error::Directory(
                "directory response is not a JSON object".to_owned(),
            )),
        }
    }

    fn resolve(&self, name: &str) -> Result<String, Error> {
        let directory = self
            .directory
            .as_ref()
            .ok_or_else(|| Error::Directory("directory not loaded".to_owned()))?;
        match directory.get(name) {
            Some(Value::String(url)) => Ok(url.clone()),
            Some(_) => Err(Error::Directory(format!(
                "directory entry for `{name}` is not a URL"
            ))),
            None => Err(Error::Directory(format!(
                "resource `{name}` not offered by the directory"
            ))),
        }
    }

    fn stash_url(&mut self, url: &str) -> Result<(), Error> {
        let directory = self
            .directory
            .as_mut()
            .ok_or_else(|| Error::Directory("directory not loaded".to_owned()))?;
        directory.insert(RESOURCE_TMP.to_owned(), Value::String(url.to_owned()));
        Ok(())
    }

    /// Assembles and signs the flattened JWS for one request.
    fn flattened_jws(
        &self,
        url: &str,
        payload64: &str,
        use_jwk: bool,
        nonce: Option<&str>,
    ) -> Result<Value, Error> {
        let key = self.key.as_ref().ok_or(Error::NoKeyLoaded)?;
        let header_key = if use_jwk {
            KeyOrKeyId::Key(key.jwk())
        } else {
            KeyOrKeyId::KeyId(self.kid.as_deref().ok_or(Error::MissingAccountUrl)?)
        };
        let protected = Protected {
            alg: key.alg(),
            key: header_key,
            nonce,
            url,
        };
        let protected64 = b64(&serde_json::to_vec(&protected)?);
        let signing_input = format!("{protected64}.{payload64}");
        let signature64 = b64(&key.sign(signing_input.as_bytes())?);
        Ok(json!({
            "protected": protected64,
            "payload": payload64,
            "signature": signature64,
        }))
    }

    /// Performs one HTTP exchange, folds the headers, and captures any
    /// `Replay-Nonce` into the slot before decoding.
    async fn http(&mut self, url: &str, mode: BodyMode) -> Result<DecodedResponse, Error> {
        let request = match mode {
            BodyMode::Head => self.client.head(url),
            BodyMode::Get => self.client.get(url),
            BodyMode::Post(body) => self
                .client
                .post(url)
                .header(CONTENT_TYPE, CONTENT_TYPE_JOSE_JSON)
                .body(body),
        };
        let response = request.send().await?;

        let code = response.status().as_u16().to_string();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), value.to_owned());
            }
        }
        let raw = response.bytes().await?.to_vec();

        if let Some(nonce) = headers.get(HEADER_REPLAY_NONCE) {
            self.nonce = Some(nonce.clone());
        }
        debug!(%url, %code, bytes = raw.len(), "response");
        transport::decode(url, code, headers, raw)
    }
}

fn is_absolute_url(resource: &str) -> bool {
    resource
        .get(..4)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("http"))
}
