use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::SessionError;

/// Body prefix the gateway uses when the credential itself (not the
/// caller's permissions) was the problem. The gateway answers both cases
/// with HTTP 403; an expired or missing credential arrives as `text/plain`
/// beginning with this marker, while a permission refusal arrives as a JSON
/// error envelope. Disambiguating on body content is a deliberate, fragile
/// contract with the gateway and must not be loosened.
pub const EXPIRED_CREDENTIAL_MARKER: &str = "Access credential expired";

/// Used when the gateway rejects a rotation without a parseable error body.
pub const GENERIC_ROTATION_FAILURE: &str = "could not renew the session credentials";

/// Where a failed response or error lands in the session taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Access credential expired or missing; recover by rotating.
    ExpiredAccess,
    /// Credential valid, rights insufficient; returned to the caller as-is.
    PermissionDenied,
    /// The credential exchange itself failed; session must be torn down.
    RotationFailed,
    /// The credential exchange exceeded its window; session must be torn down.
    RotationTimeout,
    /// Caller handed us something that is not a URL; treated as unprotected.
    UnexpectedResourceType,
    /// Transport failure, bubbled to the caller untouched.
    NetworkError,
}

/// Classify a gateway response. Returns `None` for anything that is not
/// this subsystem's concern (success, ordinary API errors).
pub fn classify_response(
    status: StatusCode,
    content_type: Option<&str>,
    body: &[u8],
) -> Option<FailureKind> {
    if status != StatusCode::FORBIDDEN {
        return None;
    }
    let plain = content_type
        .map(|ct| ct.starts_with("text/plain"))
        .unwrap_or(false);
    if plain && body.starts_with(EXPIRED_CREDENTIAL_MARKER.as_bytes()) {
        Some(FailureKind::ExpiredAccess)
    } else {
        Some(FailureKind::PermissionDenied)
    }
}

pub fn classify_error(err: &SessionError) -> FailureKind {
    match err {
        SessionError::Rotation(_) => FailureKind::RotationFailed,
        SessionError::RotationTimeout(_) => FailureKind::RotationTimeout,
        SessionError::UnexpectedResource(_) => FailureKind::UnexpectedResourceType,
        SessionError::Encode(_) => FailureKind::UnexpectedResourceType,
        SessionError::Network(_) => FailureKind::NetworkError,
        SessionError::Storage(_) => FailureKind::RotationFailed,
    }
}

#[derive(Debug, Deserialize, Default)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<String>,
}

/// Extract the gateway's own account of a failed rotation.
///
/// A body of `{"errors":[{"message":"x","code":"y"}]}` yields exactly
/// `x (y)`; anything unparseable yields the generic message.
pub fn rotation_failure_message(body: &[u8]) -> String {
    let envelope: ErrorEnvelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(_) => return GENERIC_ROTATION_FAILURE.to_string(),
    };
    envelope
        .errors
        .into_iter()
        .find_map(|err| match (err.message, err.code) {
            (Some(message), Some(code)) => Some(format!("{message} ({code})")),
            (Some(message), None) => Some(message),
            _ => None,
        })
        .unwrap_or_else(|| GENERIC_ROTATION_FAILURE.to_string())
}
