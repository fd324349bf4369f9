use tracing::{debug, warn};

use crate::error::SessionError;
use crate::transport::interceptor::GatewayClient;
use crate::transport::{GatewayRequest, GatewayResponse, RequestDescriptor};

/// Re-issue the original call after its blocking condition (an expired
/// access credential) has been resolved. The request is replayed verbatim;
/// exempt requests never reach this point.
pub(crate) async fn replay(
    client: &GatewayClient,
    request: &GatewayRequest,
    descriptor: &RequestDescriptor,
) -> Result<GatewayResponse, SessionError> {
    debug!(url = %descriptor.url, "replaying request after rotation");
    client.issue(request, descriptor).await.map_err(SessionError::from)
}

/// Dedicated logout path. A user must never be blocked from completing
/// logout by a transient network failure, so a failed call is swallowed and
/// replaced with a synthetic empty success. The local session record is
/// cleared either way.
pub(crate) async fn send_logout(
    client: &GatewayClient,
    request: &GatewayRequest,
    descriptor: &RequestDescriptor,
) -> Result<GatewayResponse, SessionError> {
    let outcome = client.issue(request, descriptor).await;

    if let Err(err) = client.store().clear().await {
        warn!(error = %err, "failed to clear token state on logout");
    }
    client.coordinator().mark_logged_out();

    match outcome {
        Ok(response) => Ok(response),
        Err(err) => {
            warn!(error = %err, "logout call failed, completing logout locally");
            Ok(GatewayResponse::empty_ok())
        }
    }
}
