use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{RotationFailure, SessionError};
use crate::security::classify;
use crate::security::token_store::{TokenExpiry, TokenStateStore};
use crate::security::rotation_lock::RotationLock;

pub const REFRESH_PATH: &str = "/authn/refresh";
pub const TENANT_HEADER: &str = "X-Tenant-Id";

/// Per-process credential lifecycle. `LoggedOut` is terminal until a fresh
/// sign-in calls [`RotationCoordinator::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Valid,
    Rotating,
    LoggedOut,
}

/// Gateway success body for `POST /authn/refresh`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token_expiration: DateTime<Utc>,
    refresh_token_expiration: DateTime<Utc>,
}

/// Exchanges the refresh credential for a fresh access/refresh pair, with at
/// most one exchange in flight system-wide.
///
/// In-process, concurrent callers share one flight: the first caller becomes
/// the leader and everyone else awaits its broadcast outcome. Across
/// processes, the leader must also win the shared [`RotationLock`]; a leader
/// that loses it polls the lock at a fixed interval and adopts the winner's
/// result from the state store instead of rotating again.
#[derive(Debug)]
pub struct RotationCoordinator {
    http: Client,
    refresh_url: Url,
    tenant_id: String,
    store: TokenStateStore,
    lock: RotationLock,
    rotation_timeout: Duration,
    poll_interval: Duration,
    max_polls: u32,
    inflight: Mutex<Option<broadcast::Sender<Result<TokenExpiry, RotationFailure>>>>,
    state: watch::Sender<SessionState>,
}

impl RotationCoordinator {
    pub fn new(
        http: Client,
        config: &SessionConfig,
        store: TokenStateStore,
    ) -> Result<Self, SessionError> {
        let base = Url::parse(&config.gateway_url)
            .map_err(|e| SessionError::UnexpectedResource(format!("gateway_url: {e}")))?;
        let refresh_url = base
            .join(REFRESH_PATH)
            .map_err(|e| SessionError::UnexpectedResource(format!("gateway_url: {e}")))?;
        let (state, _) = watch::channel(SessionState::Valid);
        Ok(Self {
            http,
            refresh_url,
            tenant_id: config.tenant_id.clone(),
            store,
            lock: RotationLock::new(&config.session_dir, config.rotation_timeout()),
            rotation_timeout: config.rotation_timeout(),
            poll_interval: config.lock_poll_interval(),
            max_polls: config.lock_max_retries,
            inflight: Mutex::new(None),
            state,
        })
    }

    /// Observe `Valid -> Rotating -> Valid | LoggedOut` transitions. The
    /// application shell watches for `LoggedOut` to tear the session down.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Re-arm after a fresh sign-in.
    pub fn reset(&self) {
        // send_replace stores the value even with no receiver alive; a
        // shell that subscribes later must still read the true state.
        self.state.send_replace(SessionState::Valid);
    }

    pub(crate) fn mark_logged_out(&self) {
        self.state.send_replace(SessionState::LoggedOut);
    }

    /// Obtain a fresh access credential. Safe to call from any number of
    /// pending requests; only one network exchange ever results.
    pub async fn rotate(&self) -> Result<TokenExpiry, SessionError> {
        self.rotate_inner(None).await
    }

    /// Rotate after the gateway rejected a credential the store still
    /// reports as valid. `refuted` is the belief the gateway refuted; the
    /// freshness recheck will only adopt stored state that differs from it,
    /// so the exchange cannot be short-circuited by the very record the
    /// failed request just disproved.
    pub async fn rotate_rejected(
        &self,
        refuted: Option<TokenExpiry>,
    ) -> Result<TokenExpiry, SessionError> {
        self.rotate_inner(refuted).await
    }

    async fn rotate_inner(
        &self,
        refuted: Option<TokenExpiry>,
    ) -> Result<TokenExpiry, SessionError> {
        let waiter = {
            let mut slot = self.inflight.lock().await;
            let existing = slot.as_ref().map(|tx| tx.subscribe());
            if existing.is_none() {
                let (tx, _) = broadcast::channel(1);
                *slot = Some(tx);
            }
            existing
        };

        if let Some(mut rx) = waiter {
            debug!("rotation already in flight, awaiting its outcome");
            return match rx.recv().await {
                Ok(outcome) => outcome.map_err(SessionError::from),
                // Leader dropped without publishing; treat as a failed
                // rotation rather than hanging.
                Err(_) => Err(SessionError::Rotation(
                    classify::GENERIC_ROTATION_FAILURE.to_string(),
                )),
            };
        }

        self.state.send_replace(SessionState::Rotating);
        let outcome = self.lead_rotation(refuted).await;

        let tx = self.inflight.lock().await.take();
        match &outcome {
            Ok(expiry) => {
                self.state.send_replace(SessionState::Valid);
                info!(access_expires_at = %expiry.access_expires_at, "credential rotation complete");
            }
            Err(failure) => {
                self.state.send_replace(SessionState::LoggedOut);
                warn!(failure = ?failure, "credential rotation failed, session unrecoverable");
            }
        }
        if let Some(tx) = tx {
            // No receivers is fine; nobody else was waiting.
            let _ = tx.send(outcome.clone());
        }
        outcome.map_err(SessionError::from)
    }

    async fn lead_rotation(
        &self,
        refuted: Option<TokenExpiry>,
    ) -> Result<TokenExpiry, RotationFailure> {
        let claim = self
            .lock
            .try_claim()
            .map_err(|e| RotationFailure::Transport(format!("rotation lock: {e}")))?;

        match claim {
            Some(guard) => {
                // Claim-then-recheck: a rotation that finished between our
                // caller's expiry check and this claim already wrote fresh
                // state, and exchanging again would burn its refresh
                // credential. State equal to a gateway-refuted belief is not
                // fresh, no matter what its timestamps claim.
                let current = self
                    .store
                    .reload()
                    .await
                    .map_err(|e| RotationFailure::Transport(format!("token state: {e}")))?;
                if let Some(expiry) = current.filter(|e| is_fresh(e, refuted.as_ref())) {
                    guard.release();
                    debug!("credentials already fresh, skipping exchange");
                    return Ok(expiry);
                }
                let result =
                    tokio::time::timeout(self.rotation_timeout, self.call_refresh(refuted.is_some()))
                        .await;
                guard.release();
                match result {
                    Err(_elapsed) => {
                        warn!(window = ?self.rotation_timeout, "rotation call exceeded its window");
                        Err(RotationFailure::Timeout(self.rotation_timeout))
                    }
                    Ok(exchanged) => exchanged,
                }
            }
            None => self.await_other_holder(refuted).await,
        }
    }

    /// Another process won the lock. Poll until it clears, then adopt its
    /// result from the state store; the store mutation is the cross-process
    /// success signal, a still-expired (or still-refuted) store the error
    /// indicator.
    async fn await_other_holder(
        &self,
        refuted: Option<TokenExpiry>,
    ) -> Result<TokenExpiry, RotationFailure> {
        debug!("rotation lock held elsewhere, waiting for its outcome");
        for _ in 0..self.max_polls {
            sleep(self.poll_interval).await;
            let held = self
                .lock
                .is_held()
                .map_err(|e| RotationFailure::Transport(format!("rotation lock: {e}")))?;
            if held {
                continue;
            }
            let adopted = self
                .store
                .reload()
                .await
                .map_err(|e| RotationFailure::Transport(format!("token state: {e}")))?;
            return match adopted {
                Some(expiry) if is_fresh(&expiry, refuted.as_ref()) => {
                    debug!("adopted rotation result from another process");
                    Ok(expiry)
                }
                _ => Err(RotationFailure::Server(
                    classify::GENERIC_ROTATION_FAILURE.to_string(),
                )),
            };
        }
        Err(RotationFailure::Timeout(
            self.poll_interval * self.max_polls,
        ))
    }

    async fn call_refresh(&self, replace_refuted: bool) -> Result<TokenExpiry, RotationFailure> {
        debug!(url = %self.refresh_url, tenant_id = %self.tenant_id, "exchanging refresh credential");

        // Refresh credential rides on the cookie jar; no body needed.
        let response = self
            .http
            .post(self.refresh_url.clone())
            .header(TENANT_HEADER, &self.tenant_id)
            .header(CONTENT_TYPE, "application/json")
            .header("X-Request-Id", Uuid::new_v4().to_string())
            .send()
            .await
            .map_err(|e| RotationFailure::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            let message = classify::rotation_failure_message(&body);
            warn!(status = %status, message = %message, "gateway rejected credential rotation");
            return Err(RotationFailure::Server(message));
        }

        let parsed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RotationFailure::Transport(format!("refresh response: {e}")))?;

        // A grant that replaces a refuted record must win outright; the
        // usual monotonic clamp would keep the disproved timestamps.
        let written = if replace_refuted {
            self.store
                .replace(
                    parsed.access_token_expiration,
                    parsed.refresh_token_expiration,
                )
                .await
        } else {
            self.store
                .write(
                    parsed.access_token_expiration,
                    parsed.refresh_token_expiration,
                )
                .await
        };
        written.map_err(|e| RotationFailure::Transport(format!("token state: {e}")))
    }
}

/// Stored state counts as fresh only when its access credential is valid
/// and it is not the exact record the gateway just refuted.
fn is_fresh(expiry: &TokenExpiry, refuted: Option<&TokenExpiry>) -> bool {
    expiry.is_access_valid() && refuted.map_or(true, |r| expiry != r)
}
