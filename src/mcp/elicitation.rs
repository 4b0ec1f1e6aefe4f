//! Pending elicitation table
//!
//! When a server asks for user input mid-call the request is parked here
//! under a correlation id until someone answers it or the window expires.
//! Each entry is resolved at most once: answering removes it, and the expiry
//! timer removes it with an [`ScopeError::ElicitationTimeout`].

use crate::model::{ElicitationRequest, ElicitationResponse};
use crate::{Result, ScopeError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

struct PendingElicitation {
    responder: oneshot::Sender<Result<ElicitationResponse>>,
    timer: Option<AbortHandle>,
    request: Option<ElicitationRequest>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Public view of a parked elicitation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingElicitationInfo {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<ElicitationRequest>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Resolves once the elicitation is answered or expires
#[derive(Debug)]
pub struct ElicitationWaiter {
    request_id: String,
    receiver: oneshot::Receiver<Result<ElicitationResponse>>,
}

impl ElicitationWaiter {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn wait(self) -> Result<ElicitationResponse> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(ScopeError::ElicitationTimeout(format!(
                "elicitation '{}' was abandoned",
                self.request_id
            ))),
        }
    }
}

#[derive(Clone, Default)]
pub struct PendingElicitations {
    entries: Arc<DashMap<String, PendingElicitation>>,
}

impl PendingElicitations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an elicitation under `request_id`
    pub fn register<S: Into<String>>(&self, request_id: S, timeout: Duration) -> ElicitationWaiter {
        self.insert(request_id.into(), None, timeout)
    }

    /// Park an elicitation and keep the request around for listing
    pub fn register_request(&self, request: &ElicitationRequest, timeout: Duration) -> ElicitationWaiter {
        self.insert(request.request_id.clone(), Some(request.clone()), timeout)
    }

    fn insert(&self, request_id: String, request: Option<ElicitationRequest>, timeout: Duration) -> ElicitationWaiter {
        let (responder, receiver) = oneshot::channel();
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| created_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let entry = PendingElicitation {
            responder,
            timer: None,
            request,
            created_at,
            expires_at,
        };
        if let Some(previous) = self.entries.insert(request_id.clone(), entry) {
            if let Some(timer) = previous.timer {
                timer.abort();
            }
            let _ = previous.responder.send(Err(ScopeError::validation(format!(
                "elicitation '{}' was superseded",
                request_id
            ))));
        }

        // The entry is in place before the timer can fire
        let entries = self.entries.clone();
        let timer_id = request_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, pending)) = entries.remove(&timer_id) {
                tracing::info!(request_id = %timer_id, "Elicitation expired without a response");
                let _ = pending.responder.send(Err(ScopeError::ElicitationTimeout(format!(
                    "no response to elicitation '{}' within {}ms",
                    timer_id,
                    timeout.as_millis()
                ))));
            }
        })
        .abort_handle();

        match self.entries.get_mut(&request_id) {
            Some(mut entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }

        ElicitationWaiter {
            request_id,
            receiver,
        }
    }

    /// Answer a parked elicitation
    pub fn respond(&self, request_id: &str, response: ElicitationResponse) -> Result<()> {
        let pending = self.take(request_id)?;
        let _ = pending.responder.send(Ok(response));
        Ok(())
    }

    /// Fail a parked elicitation with an error
    pub fn reject(&self, request_id: &str, error: ScopeError) -> Result<()> {
        let pending = self.take(request_id)?;
        let _ = pending.responder.send(Err(error));
        Ok(())
    }

    fn take(&self, request_id: &str) -> Result<PendingElicitation> {
        let (_, pending) = self.entries.remove(request_id).ok_or_else(|| {
            ScopeError::not_found(format!("No pending elicitation with id '{}'", request_id))
        })?;
        if let Some(ref timer) = pending.timer {
            timer.abort();
        }
        Ok(pending)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of everything currently parked, oldest first
    pub fn list(&self) -> Vec<PendingElicitationInfo> {
        let mut items: Vec<_> = self
            .entries
            .iter()
            .map(|entry| PendingElicitationInfo {
                request_id: entry.key().clone(),
                request: entry.request.clone(),
                created_at: entry.created_at,
                expires_at: entry.expires_at,
            })
            .collect();
        items.sort_by_key(|item| item.created_at);
        items
    }

    /// Cancel everything still parked
    pub fn clear(&self) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.reject(&id, ScopeError::connection("elicitation cancelled"));
        }
    }
}
