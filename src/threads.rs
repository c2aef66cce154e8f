//! Thread-to-target bindings
//!
//! Maps a conversation thread to a routing target (a sub-agent, model or
//! persona) so every message in that thread is routed there without explicit
//! addressing. Bindings expire after `ttl_hours` of inactivity; a background
//! sweep removes them and broadcasts an expiry event.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;

/// Source of "now" for expiry checks
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A single thread → target binding
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadBinding {
    pub thread_id: String,
    /// Sub-agent id, model name or other routing key
    pub target: String,
    /// Who created the binding
    pub creator_id: String,
    /// Enclosing context (guild, workspace, parent channel)
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub message_count: u64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ThreadBinding {
    /// Whether the binding has been idle for at least `ttl_hours`
    ///
    /// A TTL of zero or less never expires.
    #[must_use]
    pub fn is_expired_at(&self, ttl_hours: f64, now: DateTime<Utc>) -> bool {
        match ttl_delta(ttl_hours) {
            Some(ttl) => now - self.last_active >= ttl,
            None => false,
        }
    }

    /// Hours since last activity, one decimal place
    #[must_use]
    pub fn idle_hours(&self, now: DateTime<Utc>) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let hours = (now - self.last_active).num_seconds() as f64 / 3600.0;
        (hours * 10.0).round() / 10.0
    }
}

#[allow(clippy::cast_possible_truncation)]
fn ttl_delta(ttl_hours: f64) -> Option<TimeDelta> {
    if ttl_hours <= 0.0 || !ttl_hours.is_finite() {
        return None;
    }
    Some(TimeDelta::milliseconds((ttl_hours * 3_600_000.0) as i64))
}

/// Binding changes, broadcast to subscribers
#[derive(Debug, Clone)]
pub enum BindingEvent {
    Bound(ThreadBinding),
    Rebound {
        previous: ThreadBinding,
        binding: ThreadBinding,
    },
    Unbound(ThreadBinding),
    Expired(ThreadBinding),
}

/// Optional filters for listing bindings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BindingFilter {
    pub creator_id: Option<String>,
    pub parent_id: Option<String>,
}

impl BindingFilter {
    fn matches(&self, binding: &ThreadBinding) -> bool {
        self.creator_id
            .as_deref()
            .is_none_or(|c| binding.creator_id == c)
            && self
                .parent_id
                .as_deref()
                .is_none_or(|p| binding.parent_id.as_deref() == Some(p))
    }
}

/// Thread binding store
pub struct ThreadBindingStore {
    bindings: RwLock<HashMap<String, ThreadBinding>>,
    ttl_hours: RwLock<f64>,
    events: broadcast::Sender<BindingEvent>,
    clock: Clock,
}

impl ThreadBindingStore {
    /// Create a store with the given TTL (0 = never expire)
    #[must_use]
    pub fn new(ttl_hours: f64) -> Self {
        Self::with_clock(ttl_hours, Arc::new(Utc::now))
    }

    /// Create a store with a custom time source
    #[must_use]
    pub fn with_clock(ttl_hours: f64, clock: Clock) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            bindings: RwLock::new(HashMap::new()),
            ttl_hours: RwLock::new(ttl_hours.max(0.0)),
            events,
            clock,
        }
    }

    #[must_use]
    pub fn ttl_hours(&self) -> f64 {
        *self.ttl_hours.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the TTL; negative values clamp to 0 (never expire)
    pub fn set_ttl_hours(&self, ttl_hours: f64) {
        *self.ttl_hours.write().unwrap_or_else(PoisonError::into_inner) = ttl_hours.max(0.0);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BindingEvent> {
        self.events.subscribe()
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn emit(&self, event: BindingEvent) {
        let _ = self.events.send(event);
    }

    /// Bind a thread to a target, replacing any existing binding
    pub fn bind(
        &self,
        thread_id: &str,
        target: &str,
        creator_id: &str,
        parent_id: Option<&str>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> ThreadBinding {
        let now = self.now();
        let binding = ThreadBinding {
            thread_id: thread_id.to_string(),
            target: target.to_string(),
            creator_id: creator_id.to_string(),
            parent_id: parent_id.map(ToString::to_string),
            created_at: now,
            last_active: now,
            message_count: 0,
            metadata,
        };

        let previous = self
            .bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(thread_id.to_string(), binding.clone());

        match previous {
            Some(previous) => {
                tracing::info!(
                    thread_id,
                    from = %previous.target,
                    to = target,
                    "thread rebound"
                );
                self.emit(BindingEvent::Rebound {
                    previous,
                    binding: binding.clone(),
                });
            }
            None => {
                tracing::info!(thread_id, target, creator_id, "thread bound");
                self.emit(BindingEvent::Bound(binding.clone()));
            }
        }

        binding
    }

    /// Remove a binding, returning it if present
    pub fn unbind(&self, thread_id: &str) -> Option<ThreadBinding> {
        let binding = self
            .bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(thread_id)?;

        tracing::info!(
            thread_id,
            target = %binding.target,
            messages = binding.message_count,
            "thread unbound"
        );
        self.emit(BindingEvent::Unbound(binding.clone()));
        Some(binding)
    }

    /// Look up a binding without refreshing its activity
    ///
    /// Expired bindings are treated as absent even before the sweep runs.
    #[must_use]
    pub fn get_binding(&self, thread_id: &str) -> Option<ThreadBinding> {
        let ttl = self.ttl_hours();
        let now = self.now();
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(thread_id)
            .filter(|b| !b.is_expired_at(ttl, now))
            .cloned()
    }

    /// Record activity on a thread
    ///
    /// Returns false when the thread is unbound or already expired.
    pub fn touch(&self, thread_id: &str) -> bool {
        let ttl = self.ttl_hours();
        let now = self.now();
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        match bindings.get_mut(thread_id) {
            Some(binding) if !binding.is_expired_at(ttl, now) => {
                binding.last_active = now;
                binding.message_count += 1;
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn is_bound(&self, thread_id: &str) -> bool {
        self.get_binding(thread_id).is_some()
    }

    /// Number of live bindings
    #[must_use]
    pub fn count(&self) -> usize {
        self.live(&BindingFilter::default()).len()
    }

    fn live(&self, filter: &BindingFilter) -> Vec<ThreadBinding> {
        let ttl = self.ttl_hours();
        let now = self.now();
        let mut bindings: Vec<ThreadBinding> = self
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|b| !b.is_expired_at(ttl, now) && filter.matches(b))
            .cloned()
            .collect();
        bindings.sort_by(|a, b| a.thread_id.cmp(&b.thread_id));
        bindings
    }

    /// Live bindings, optionally filtered by creator or parent context
    #[must_use]
    pub fn list_bindings(&self, filter: &BindingFilter) -> Vec<ThreadBinding> {
        self.live(filter)
    }

    /// Live bindings pointing at `target`
    #[must_use]
    pub fn get_bindings_for_target(&self, target: &str) -> Vec<ThreadBinding> {
        self.live(&BindingFilter::default())
            .into_iter()
            .filter(|b| b.target == target)
            .collect()
    }

    /// Distinct targets with at least one live binding, sorted
    #[must_use]
    pub fn get_targets(&self) -> Vec<String> {
        self.live(&BindingFilter::default())
            .into_iter()
            .map(|b| b.target)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Remove every binding idle for at least the TTL
    pub fn expire_stale(&self) -> Vec<ThreadBinding> {
        self.expire_stale_at(self.now())
    }

    /// `expire_stale` against an explicit time
    pub fn expire_stale_at(&self, now: DateTime<Utc>) -> Vec<ThreadBinding> {
        let ttl = self.ttl_hours();
        if ttl <= 0.0 {
            return Vec::new();
        }

        let expired: Vec<ThreadBinding> = {
            let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
            let stale: Vec<String> = bindings
                .values()
                .filter(|b| b.is_expired_at(ttl, now))
                .map(|b| b.thread_id.clone())
                .collect();
            stale.iter().filter_map(|id| bindings.remove(id)).collect()
        };

        for binding in &expired {
            tracing::info!(
                thread_id = %binding.thread_id,
                target = %binding.target,
                idle_hours = binding.idle_hours(now),
                "thread binding expired"
            );
            self.emit(BindingEvent::Expired(binding.clone()));
        }

        expired
    }

    /// Human-readable listing of live bindings
    #[must_use]
    pub fn summary(&self) -> String {
        let bindings = self.live(&BindingFilter::default());
        if bindings.is_empty() {
            return "No active thread bindings".to_string();
        }

        let now = self.now();
        let mut out = format!("{} active binding(s):", bindings.len());
        for b in &bindings {
            let _ = write!(
                out,
                "\n  - thread {} -> {} ({} msgs, idle {}h)",
                b.thread_id,
                b.target,
                b.message_count,
                b.idle_hours(now)
            );
        }
        out
    }

    /// Run `expire_stale` every `interval` until `cancel` fires
    #[must_use]
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> SweepHandle {
        let store = Arc::clone(self);
        let token = cancel.clone();
        tracing::info!(
            ttl_hours = store.ttl_hours(),
            interval_secs = interval.as_secs(),
            "thread binding sweep started"
        );

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                let expired = store.expire_stale();
                if !expired.is_empty() {
                    tracing::info!(count = expired.len(), "expired stale thread bindings");
                }
            }
            tracing::info!("thread binding sweep stopped");
        });

        SweepHandle { cancel, handle }
    }
}

/// Owner handle for the background sweep task
pub struct SweepHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SweepHandle {
    /// Cancel the sweep and wait up to `timeout` for it to finish
    ///
    /// Returns false if the task had to be aborted.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let abort = self.handle.abort_handle();
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "thread binding sweep panicked");
                true
            }
            Err(_) => {
                tracing::warn!("thread binding sweep did not stop in time, aborting");
                abort.abort();
                false
            }
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
