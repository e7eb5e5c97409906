//! Cloud API request signing.
//!
//! The cloud API authenticates every HTTP request with an HMAC-SHA256
//! signature over a canonical string:
//!
//! ```text
//! api_key + token + t
//! METHOD "\n"
//! hex(sha256(body)) "\n"
//! name:value "\n"      (once per header listed in Signature-Headers)
//! "\n"
//! url_path
//! ```
//!
//! The signature is the uppercase hex digest, keyed with the API secret.
//! Signing is a pure function of the request; nothing here touches the
//! network.

use hmac::{Hmac, Mac};
use indexmap::IndexMap;
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header listing which other headers take part in the signature.
pub const SIGNATURE_HEADERS: &str = "Signature-Headers";

/// Value of the `sign_method` header.
pub const SIGN_METHOD: &str = "HMAC-SHA256";

/// Everything that goes into a request signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudRequest {
    pub api_key: String,
    pub api_secret: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Access token; absent when requesting a token.
    pub token: Option<String>,
    pub method: String,
    pub body: String,
    /// Request headers in insertion order.
    pub headers: IndexMap<String, String>,
    /// Path including the query string, used verbatim.
    pub url_path: String,
}

impl CloudRequest {
    pub fn builder() -> CloudRequestBuilder {
        CloudRequestBuilder::default()
    }

    /// The canonical string the signature is computed over.
    pub fn string_to_sign(&self) -> String {
        let mut payload = String::new();
        payload.push_str(&self.api_key);
        if let Some(token) = &self.token {
            payload.push_str(token);
        }
        payload.push_str(&self.timestamp.to_string());

        payload.push_str(&self.method);
        payload.push('\n');

        payload.push_str(&hex::encode(Sha256::digest(self.body.as_bytes())));
        payload.push('\n');

        if let Some(names) = self.headers.get(SIGNATURE_HEADERS) {
            for name in names.split(':').filter(|name| !name.is_empty()) {
                if let Some(value) = self.headers.get(name) {
                    payload.push_str(name);
                    payload.push(':');
                    payload.push_str(value);
                    payload.push('\n');
                }
            }
        }
        payload.push('\n');

        payload.push_str(&self.url_path);
        payload
    }

    /// Uppercase hex HMAC-SHA256 of [`string_to_sign`](Self::string_to_sign).
    pub fn sign(&self) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|_| ProtocolError::MissingField("api_secret"))?;
        mac.update(self.string_to_sign().as_bytes());
        let signature = hex::encode_upper(mac.finalize().into_bytes());

        tracing::trace!(
            method = %self.method,
            url_path = %self.url_path,
            has_token = self.token.is_some(),
            "signed cloud request"
        );
        Ok(signature)
    }

    /// Authentication headers for the request, in the order they are sent.
    pub fn auth_headers(&self, client_id: &str) -> Result<Vec<(&'static str, String)>> {
        let mut headers = vec![
            ("client_id", client_id.to_string()),
            ("sign", self.sign()?),
            ("t", self.timestamp.to_string()),
            ("sign_method", SIGN_METHOD.to_string()),
        ];
        if let Some(token) = &self.token {
            headers.push(("access_token", token.clone()));
        }
        Ok(headers)
    }
}

/// Signs `request`. See [`CloudRequest::sign`].
pub fn sign(request: &CloudRequest) -> Result<String> {
    request.sign()
}

/// Builder for [`CloudRequest`].
#[derive(Debug, Clone, Default)]
pub struct CloudRequestBuilder {
    api_key: String,
    api_secret: String,
    timestamp: u64,
    token: Option<String>,
    method: String,
    body: String,
    headers: IndexMap<String, String>,
    url_path: String,
}

impl CloudRequestBuilder {
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn api_secret(mut self, api_secret: impl Into<String>) -> Self {
        self.api_secret = api_secret.into();
        self
    }

    /// Request time in milliseconds since the Unix epoch.
    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn url_path(mut self, url_path: impl Into<String>) -> Self {
        self.url_path = url_path.into();
        self
    }

    pub fn build(self) -> Result<CloudRequest> {
        let required = [
            ("api_key", &self.api_key),
            ("api_secret", &self.api_secret),
            ("method", &self.method),
            ("url_path", &self.url_path),
        ];
        if let Some((name, _)) = required.iter().find(|(_, value)| value.is_empty()) {
            return Err(ProtocolError::MissingField(*name));
        }

        Ok(CloudRequest {
            api_key: self.api_key,
            api_secret: self.api_secret,
            timestamp: self.timestamp,
            token: self.token,
            method: self.method,
            body: self.body,
            headers: self.headers,
            url_path: self.url_path,
        })
    }
}
