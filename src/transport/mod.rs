pub mod interceptor;
pub mod replay;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use tracing::warn;
use url::Url;

use crate::error::SessionError;

pub const LOGOUT_PATH: &str = "/authn/logout";

/// Gateway paths that must work without a valid access credential. Requests
/// under these prefixes pass through with no rotation logic at all.
pub const ALWAYS_ALLOWED_PREFIXES: &[&str] = &[
    "/authn/forgotten-password",
    "/authn/forgotten-username",
    "/authn/login-with-expiry",
    "/authn/password-reset",
    "/authn/sso-check",
    LOGOUT_PATH,
];

/// What a caller may hand the interceptor as a request target, resolved
/// exactly once at the boundary into a canonical URL.
#[derive(Debug, Clone)]
pub enum RequestResource {
    /// Already-parsed URL.
    Url(Url),
    /// Gateway-relative path, joined onto the configured gateway base.
    Path(String),
    /// Free-form string: parsed as an absolute URL, or joined onto the
    /// gateway base when it starts with `/`.
    Raw(String),
}

impl RequestResource {
    fn resolve(&self, base: &Url) -> Result<Url, SessionError> {
        match self {
            RequestResource::Url(url) => Ok(url.clone()),
            RequestResource::Path(path) => base
                .join(path)
                .map_err(|e| unexpected(&format!("{path}: {e}"))),
            RequestResource::Raw(raw) => {
                if let Ok(url) = Url::parse(raw) {
                    return Ok(url);
                }
                if raw.starts_with('/') {
                    return base.join(raw).map_err(|e| unexpected(&format!("{raw}: {e}")));
                }
                Err(unexpected(raw))
            }
        }
    }
}

fn unexpected(detail: &str) -> SessionError {
    warn!(resource = %detail, "request resource could not be resolved to a URL");
    SessionError::UnexpectedResource(detail.to_string())
}

/// One outgoing call, owned end to end so it can be re-issued verbatim
/// after a credential rotation.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub resource: RequestResource,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Exempt from rotation handling: issued once, never replayed, its
    /// response or error returned unchanged.
    pub exempt: bool,
}

impl GatewayRequest {
    pub fn new(method: Method, resource: RequestResource) -> Self {
        Self {
            resource,
            method,
            headers: HeaderMap::new(),
            body: None,
            exempt: false,
        }
    }

    pub fn get(resource: RequestResource) -> Self {
        Self::new(Method::GET, resource)
    }

    pub fn post(resource: RequestResource) -> Self {
        Self::new(Method::POST, resource)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json<T: Serialize>(mut self, payload: &T) -> Result<Self, SessionError> {
        let body = serde_json::to_vec(payload)?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(body));
        Ok(self)
    }

    pub fn exempt(mut self) -> Self {
        self.exempt = true;
        self
    }
}

/// Routing decision for one request, derived once per call.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub url: Url,
    pub is_logout: bool,
    pub always_allowed: bool,
    /// Same-origin with the gateway and not always-allowed. Off-gateway
    /// URLs carry no session credential and get no rotation handling.
    pub protected: bool,
}

impl RequestDescriptor {
    pub fn resolve(resource: &RequestResource, base: &Url) -> Result<Self, SessionError> {
        let url = resource.resolve(base)?;
        let same_origin = url.scheme() == base.scheme()
            && url.host() == base.host()
            && url.port_or_known_default() == base.port_or_known_default();
        let path = url.path();
        let always_allowed =
            same_origin && ALWAYS_ALLOWED_PREFIXES.iter().any(|p| path.starts_with(p));
        let is_logout = same_origin && path.starts_with(LOGOUT_PATH);
        Ok(Self {
            url,
            is_logout,
            always_allowed,
            protected: same_origin && !always_allowed,
        })
    }
}

/// A fully-read gateway response. The body is buffered so it can be
/// inspected for classification and still handed back to the caller intact.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl GatewayResponse {
    pub(crate) async fn from_reqwest(response: reqwest::Response) -> Result<Self, reqwest::Error> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(Self {
            status,
            headers,
            body,
        })
    }

    /// Synthetic empty success, used when a logout call fails at the
    /// network layer but the user must still complete logout.
    pub(crate) fn empty_ok() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}
