use std::sync::Arc;

use reqwest::Client;
use tokio::sync::watch;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::security::classify::{self, FailureKind};
use crate::security::rotation::{RotationCoordinator, SessionState};
use crate::security::token_store::TokenStateStore;
use crate::transport::replay;
use crate::transport::{GatewayRequest, GatewayResponse, RequestDescriptor, RequestResource};

/// The single entry point all outgoing gateway calls pass through.
///
/// Per request it decides one of three paths: always-allowed pass-through,
/// valid-access pass-through, or rotate-then-replay. Classification and
/// recovery are invisible to callers on the happy path; only an
/// unrecoverable rotation failure escalates, as a [`SessionError`] and a
/// `LoggedOut` transition on the state channel.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    http: Client,
    base: Url,
    store: TokenStateStore,
    coordinator: Arc<RotationCoordinator>,
}

impl GatewayClient {
    /// Build the shared client. The cookie jar carries the refresh
    /// credential, so one client instance must be reused by all callers.
    pub fn new(config: &SessionConfig) -> Result<Self, SessionError> {
        let base = Url::parse(&config.gateway_url)
            .map_err(|e| SessionError::UnexpectedResource(format!("gateway_url: {e}")))?;
        let http = Client::builder()
            .cookie_store(true)
            .timeout(config.request_timeout())
            .build()?;
        let store = TokenStateStore::new(&config.session_dir, config.safety_margin);
        let coordinator = Arc::new(RotationCoordinator::new(
            http.clone(),
            config,
            store.clone(),
        )?);
        Ok(Self {
            http,
            base,
            store,
            coordinator,
        })
    }

    /// Observe the per-process credential lifecycle; the shell tears the
    /// session down when this reaches `LoggedOut`.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.coordinator.subscribe()
    }

    /// Re-arm after a fresh sign-in has repopulated the session.
    pub fn reset(&self) {
        self.coordinator.reset();
    }

    pub(crate) fn store(&self) -> &TokenStateStore {
        &self.store
    }

    pub(crate) fn coordinator(&self) -> &RotationCoordinator {
        &self.coordinator
    }

    /// Issue one gateway call with transparent credential rotation.
    pub async fn send(&self, request: GatewayRequest) -> Result<GatewayResponse, SessionError> {
        let descriptor = RequestDescriptor::resolve(&request.resource, &self.base)?;

        if descriptor.is_logout {
            return replay::send_logout(self, &request, &descriptor).await;
        }
        if descriptor.always_allowed || !descriptor.protected {
            debug!(url = %descriptor.url, "pass-through, no rotation handling");
            return self.issue(&request, &descriptor).await.map_err(Into::into);
        }
        if request.exempt {
            // Issued once; its response or error is returned unchanged.
            return self.issue(&request, &descriptor).await.map_err(Into::into);
        }

        let mut access_valid = self
            .store
            .cached()
            .await
            .map(|expiry| expiry.is_access_valid())
            .unwrap_or(false);

        if !access_valid {
            // Locally expired. Another process may have rotated already, so
            // refresh our view from shared storage before exchanging.
            access_valid = self
                .store
                .reload()
                .await?
                .map(|expiry| expiry.is_access_valid())
                .unwrap_or(false);
            if access_valid {
                debug!("another process already rotated, reusing its credentials");
            }
        }

        if !access_valid {
            self.coordinator.rotate().await?;
            return replay::replay(self, &request, &descriptor).await;
        }

        let response = self.issue(&request, &descriptor).await?;
        if is_auth_expired(&response) {
            // Missed expiry: the credential died between our validity check
            // and the gateway's, so the stored belief is refuted even though
            // it still reads as valid. Rotate and replay exactly once;
            // whatever the replay returns goes back to the caller as-is.
            debug!(url = %descriptor.url, "access credential rejected mid-flight, rotating");
            let refuted = self.store.cached().await;
            self.coordinator.rotate_rejected(refuted).await?;
            return replay::replay(self, &request, &descriptor).await;
        }
        Ok(response)
    }

    /// Convenience wrapper for the logout endpoint.
    pub async fn logout(&self) -> Result<GatewayResponse, SessionError> {
        self.send(GatewayRequest::post(RequestResource::Path(
            super::LOGOUT_PATH.to_string(),
        )))
        .await
    }

    /// Raw network issue: no rotation logic, body buffered for inspection.
    pub(crate) async fn issue(
        &self,
        request: &GatewayRequest,
        descriptor: &RequestDescriptor,
    ) -> Result<GatewayResponse, reqwest::Error> {
        let mut builder = self
            .http
            .request(request.method.clone(), descriptor.url.clone())
            .headers(request.headers.clone())
            .header("X-Request-Id", Uuid::new_v4().to_string());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        let response = builder.send().await?;
        GatewayResponse::from_reqwest(response).await
    }
}

fn is_auth_expired(response: &GatewayResponse) -> bool {
    classify::classify_response(response.status(), response.content_type(), response.bytes())
        == Some(FailureKind::ExpiredAccess)
}
