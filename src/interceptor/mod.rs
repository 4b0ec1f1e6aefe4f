//! Interceptor store
//!
//! An interceptor entry maps a local id to an upstream MCP endpoint and keeps
//! a bounded log of the traffic proxied through it. Each entry has its own
//! lock; entries never contend with each other.

mod record;

pub use record::{LogPayload, ProxyLogEntry, mask_authorization};

use crate::{Result, ScopeError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

/// Sender feeding a synthetic SSE session
pub type SessionRelay = mpsc::UnboundedSender<Bytes>;

#[derive(Default)]
struct EntryState {
    logs: VecDeque<ProxyLogEntry>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<ProxyLogEntry>)>,
    session_endpoints: HashMap<String, Url>,
    session_relays: HashMap<String, SessionRelay>,
}

pub struct InterceptorEntry {
    id: String,
    target_url: Url,
    inject_headers: BTreeMap<String, String>,
    server_id: Option<String>,
    created_at: DateTime<Utc>,
    max_log_entries: usize,
    next_subscriber: AtomicU64,
    cancel: CancellationToken,
    state: Mutex<EntryState>,
}

/// Serializable view of an entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptorInfo {
    pub id: String,
    pub target_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub log_count: usize,
    pub subscriber_count: usize,
    pub session_count: usize,
}

impl InterceptorEntry {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target_url(&self) -> &Url {
        &self.target_url
    }

    /// Headers added to every forwarded request (names lowercased)
    pub fn inject_headers(&self) -> &BTreeMap<String, String> {
        &self.inject_headers
    }

    pub fn server_id(&self) -> Option<&str> {
        self.server_id.as_deref()
    }

    /// Cancelled when the entry is destroyed
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn info(&self) -> InterceptorInfo {
        let state = self.state.lock();
        InterceptorInfo {
            id: self.id.clone(),
            target_url: self.target_url.to_string(),
            server_id: self.server_id.clone(),
            created_at: self.created_at,
            log_count: state.logs.len(),
            subscriber_count: state.subscribers.len(),
            session_count: state.session_endpoints.len(),
        }
    }

    /// Store a log entry and fan it out to live subscribers
    pub fn append_log(&self, mut entry: ProxyLogEntry) {
        entry.mask();
        let mut state = self.state.lock();
        if self.is_destroyed() {
            return;
        }

        state.subscribers.retain(|(_, tx)| tx.send(entry.clone()).is_ok());
        state.logs.push_back(entry);
        while state.logs.len() > self.max_log_entries {
            state.logs.pop_front();
        }
    }

    /// Buffered history, oldest first
    pub fn logs(&self) -> Vec<ProxyLogEntry> {
        self.state.lock().logs.iter().cloned().collect()
    }

    pub fn clear_logs(&self) {
        self.state.lock().logs.clear();
    }

    /// Replay history then stream live entries
    ///
    /// History is queued and the subscriber registered under the same lock
    /// as `append_log`, so every entry is delivered exactly once and in order.
    pub fn subscribe(self: &Arc<Self>) -> LogSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber_id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        {
            let mut state = self.state.lock();
            for entry in &state.logs {
                let _ = tx.send(entry.clone());
            }
            // A destroyed entry hands back a finished subscription
            if !self.is_destroyed() {
                state.subscribers.push((subscriber_id, tx));
            }
        }

        LogSubscription {
            receiver: rx,
            entry: Arc::downgrade(self),
            subscriber_id,
        }
    }

    fn unsubscribe(&self, subscriber_id: u64) {
        self.state
            .lock()
            .subscribers
            .retain(|(id, _)| *id != subscriber_id);
    }

    pub fn set_session_endpoint<S: Into<String>>(&self, session_id: S, upstream: Url) {
        self.state
            .lock()
            .session_endpoints
            .insert(session_id.into(), upstream);
    }

    pub fn session_endpoint(&self, session_id: &str) -> Option<Url> {
        self.state.lock().session_endpoints.get(session_id).cloned()
    }

    /// Attach the synthetic SSE stream serving `session_id`
    pub fn register_session_relay<S: Into<String>>(&self, session_id: S, relay: SessionRelay) {
        self.state
            .lock()
            .session_relays
            .insert(session_id.into(), relay);
    }

    pub fn session_relay(&self, session_id: &str) -> Option<SessionRelay> {
        self.state.lock().session_relays.get(session_id).cloned()
    }

    /// Forget a session once its stream has ended
    pub fn remove_session(&self, session_id: &str) {
        let mut state = self.state.lock();
        state.session_endpoints.remove(session_id);
        state.session_relays.remove(session_id);
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        self.cancel.cancel();
        // Dropping the senders ends every subscriber stream
        state.subscribers.clear();
        state.session_relays.clear();
        state.session_endpoints.clear();
    }
}

/// Live feed of an entry's log
///
/// Dropping the subscription unregisters it.
pub struct LogSubscription {
    receiver: mpsc::UnboundedReceiver<ProxyLogEntry>,
    entry: Weak<InterceptorEntry>,
    subscriber_id: u64,
}

impl LogSubscription {
    /// Next entry; `None` once the interceptor is destroyed
    pub async fn recv(&mut self) -> Option<ProxyLogEntry> {
        self.receiver.recv().await
    }

    /// Next entry without waiting
    pub fn try_recv(&mut self) -> Option<ProxyLogEntry> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.upgrade() {
            entry.unsubscribe(self.subscriber_id);
        }
    }
}

/// All interceptor entries, keyed by id
pub struct InterceptorStore {
    entries: DashMap<String, Arc<InterceptorEntry>>,
    max_log_entries: usize,
}

impl InterceptorStore {
    pub fn new(max_log_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_log_entries: max_log_entries.max(1),
        }
    }

    /// Register a new upstream target
    pub fn create(
        &self,
        target_url: &str,
        inject_headers: Option<HashMap<String, String>>,
        server_id: Option<String>,
    ) -> Result<Arc<InterceptorEntry>> {
        let target = Url::parse(target_url.trim())
            .map_err(|e| ScopeError::validation(format!("invalid targetUrl '{}': {}", target_url, e)))?;
        if !matches!(target.scheme(), "http" | "https") {
            return Err(ScopeError::validation(format!(
                "targetUrl must be http or https, got '{}'",
                target.scheme()
            )));
        }

        let inject_headers = inject_headers
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();

        let entry = Arc::new(InterceptorEntry {
            id: Uuid::new_v4().simple().to_string(),
            target_url: target,
            inject_headers,
            server_id,
            created_at: Utc::now(),
            max_log_entries: self.max_log_entries,
            next_subscriber: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            state: Mutex::new(EntryState::default()),
        });
        self.entries.insert(entry.id.clone(), entry.clone());

        tracing::info!(
            interceptor = %entry.id,
            target = %entry.target_url,
            server = ?entry.server_id,
            "Created interceptor"
        );
        Ok(entry)
    }

    pub fn get(&self, id: &str) -> Result<Arc<InterceptorEntry>> {
        self.entries
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ScopeError::not_found(format!("Interceptor '{}' not found", id)))
    }

    pub fn info(&self, id: &str) -> Result<InterceptorInfo> {
        Ok(self.get(id)?.info())
    }

    pub fn list(&self) -> Vec<InterceptorInfo> {
        let mut infos: Vec<_> = self.entries.iter().map(|e| e.value().info()).collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear_logs(&self, id: &str) -> Result<()> {
        self.get(id)?.clear_logs();
        Ok(())
    }

    /// Remove an entry, ending its subscriptions and synthetic sessions
    pub fn destroy(&self, id: &str) -> Result<()> {
        let (_, entry) = self
            .entries
            .remove(id)
            .ok_or_else(|| ScopeError::not_found(format!("Interceptor '{}' not found", id)))?;
        entry.shutdown();
        tracing::info!(interceptor = %id, "Destroyed interceptor");
        Ok(())
    }

    /// Destroy every entry bound to a server; returns how many were removed
    pub fn destroy_by_server(&self, server_id: &str) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().server_id() == Some(server_id))
            .map(|e| e.key().clone())
            .collect();
        ids.iter().filter(|id| self.destroy(id).is_ok()).count()
    }

    pub fn append_log(&self, id: &str, entry: ProxyLogEntry) -> Result<()> {
        self.get(id)?.append_log(entry);
        Ok(())
    }

    pub fn subscribe(&self, id: &str) -> Result<LogSubscription> {
        Ok(self.get(id)?.subscribe())
    }

    pub fn set_session_endpoint(&self, id: &str, session_id: &str, upstream: Url) -> Result<()> {
        self.get(id)?.set_session_endpoint(session_id, upstream);
        Ok(())
    }

    pub fn get_session_endpoint(&self, id: &str, session_id: &str) -> Result<Option<Url>> {
        Ok(self.get(id)?.session_endpoint(session_id))
    }
}
