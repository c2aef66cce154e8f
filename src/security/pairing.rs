//! DM pairing and allowlist security
//!
//! Access control for unsolicited direct messages:
//! - Open: accept all DMs
//! - Owner: only the configured owner may DM
//! - Pairing: unknown senders get a time-limited code an owner must approve
//! - Disabled: no DM access at all
//!
//! Approved and blocked sender ids are persisted to a small JSON document
//! (`{"allowed": [...], "blocked": [...]}`) rewritten on every mutation.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{Error, Result};

/// Pairing code alphabet, without the ambiguous 0/O and 1/I
const CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

const EVENT_CAPACITY: usize = 64;

/// Accepted pairing code lengths
const CODE_LENGTH_RANGE: std::ops::RangeInclusive<usize> = 1..=32;

/// Draws before giving up on finding a code not already pending
const MAX_CODE_ATTEMPTS: usize = 1000;

/// DM access policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    /// Accept all DMs without authentication
    Open,

    /// Only the configured owner may DM
    #[default]
    Owner,

    /// New senders must be approved via pairing code
    Pairing,

    /// DMs are rejected outright
    Disabled,
}

impl DmPolicy {
    /// Parse from string representation
    ///
    /// Unknown values fall back to `Owner`, the safe default.
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "open" | "all" => Self::Open,
            "pairing" => Self::Pairing,
            "disabled" | "none" => Self::Disabled,
            "owner" | "owner_only" => Self::Owner,
            other => {
                tracing::warn!(policy = other, "unknown DM policy, using owner");
                Self::Owner
            }
        }
    }
}

impl std::fmt::Display for DmPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Owner => write!(f, "owner"),
            Self::Pairing => write!(f, "pairing"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// A pending pairing request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingRequest {
    pub code: String,
    pub sender_id: String,
    pub sender_name: String,
    /// Channel the DM arrived on
    pub channel_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PairingRequest {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whole minutes left before expiry
    #[must_use]
    pub fn remaining_minutes(&self) -> i64 {
        (self.expires_at - Utc::now()).num_minutes().max(0)
    }
}

/// Pairing state changes, broadcast to subscribers
#[derive(Debug, Clone)]
pub enum PairingEvent {
    Requested(PairingRequest),
    Approved(PairingRequest),
    Denied(PairingRequest),
    Allowed(String),
    Revoked(String),
    Blocked(String),
    Unblocked(String),
}

/// Result of waiting on a pairing code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved(PairingRequest),
    Denied,
    /// The code expired, or was not pending to begin with
    Expired,
    /// The wait deadline passed first; the code may still be approved later
    TimedOut,
}

/// Pairing settings
#[derive(Debug, Clone)]
pub struct PairingConfig {
    pub policy: DmPolicy,
    pub owner_id: Option<String>,
    /// Allow/block list document
    pub allowlist_path: PathBuf,
    pub max_pending_per_channel: usize,
    pub code_length: usize,
    pub code_ttl: Duration,
}

impl PairingConfig {
    /// Defaults with the allowlist stored at `allowlist_path`
    #[must_use]
    pub fn new(allowlist_path: impl Into<PathBuf>) -> Self {
        Self {
            policy: DmPolicy::default(),
            owner_id: None,
            allowlist_path: allowlist_path.into(),
            max_pending_per_channel: 3,
            code_length: 8,
            code_ttl: Duration::from_secs(3600),
        }
    }
}

/// Counts for display
#[derive(Debug, Clone, Serialize)]
pub struct PairingSummary {
    pub policy: DmPolicy,
    pub allowed: usize,
    pub blocked: usize,
    pub pending: usize,
}

impl std::fmt::Display for PairingSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DM policy: {}\nAllowed users: {}\nBlocked users: {}\nPending requests: {}",
            self.policy, self.allowed, self.blocked, self.pending
        )
    }
}

/// Persisted allow/block lists
#[derive(Debug, Default, Serialize, Deserialize)]
struct AccessLists {
    #[serde(default)]
    allowed: BTreeSet<String>,
    #[serde(default)]
    blocked: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct PairingState {
    /// Pending requests by code
    pending: HashMap<String, PairingRequest>,
    lists: AccessLists,
}

impl PairingState {
    fn cleanup_expired(&mut self, now: DateTime<Utc>) {
        let before = self.pending.len();
        self.pending.retain(|_, req| !req.is_expired_at(now));
        let removed = before - self.pending.len();
        if removed > 0 {
            tracing::debug!(removed, "cleaned up expired pairing requests");
        }
    }
}

/// Manages DM pairing codes and access lists
pub struct PairingManager {
    config: PairingConfig,
    state: Mutex<PairingState>,
    events: broadcast::Sender<PairingEvent>,
}

impl PairingManager {
    /// Create a manager, loading any persisted allow/block lists
    ///
    /// A missing file starts empty; an unreadable one is logged and ignored.
    #[must_use]
    pub fn new(mut config: PairingConfig) -> Self {
        let code_length = config
            .code_length
            .clamp(*CODE_LENGTH_RANGE.start(), *CODE_LENGTH_RANGE.end());
        if code_length != config.code_length {
            tracing::warn!(
                requested = config.code_length,
                code_length,
                "pairing code length out of range, clamped"
            );
            config.code_length = code_length;
        }

        let lists = match load_lists(&config.allowlist_path) {
            Ok(lists) => lists,
            Err(e) => {
                tracing::error!(
                    path = %config.allowlist_path.display(),
                    error = %e,
                    "failed to load allowlist"
                );
                AccessLists::default()
            }
        };

        tracing::info!(
            policy = %config.policy,
            allowed = lists.allowed.len(),
            blocked = lists.blocked.len(),
            "pairing manager ready"
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            state: Mutex::new(PairingState {
                pending: HashMap::new(),
                lists,
            }),
            events,
        }
    }

    /// Get the current policy
    #[must_use]
    pub const fn policy(&self) -> DmPolicy {
        self.config.policy
    }

    #[must_use]
    pub fn owner_id(&self) -> Option<&str> {
        self.config.owner_id.as_deref()
    }

    /// Whether `sender_id` is the configured owner
    #[must_use]
    pub fn is_owner(&self, sender_id: &str) -> bool {
        self.config.owner_id.as_deref() == Some(sender_id)
    }

    /// Subscribe to pairing events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PairingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PairingEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn persist(&self, state: &PairingState) -> Result<()> {
        save_lists(&self.config.allowlist_path, &state.lists)
    }

    /// Check if a sender may DM the bot
    #[must_use]
    pub fn is_authorized(&self, sender_id: &str) -> bool {
        match self.config.policy {
            DmPolicy::Open => true,
            DmPolicy::Disabled => false,
            DmPolicy::Owner => self.is_owner(sender_id),
            DmPolicy::Pairing => {
                if self.is_owner(sender_id) {
                    return true;
                }
                let state = self.lock();
                state.lists.allowed.contains(sender_id) && !state.lists.blocked.contains(sender_id)
            }
        }
    }

    /// Create a pairing request for an unknown DM sender
    ///
    /// Returns `None` when the sender is already authorized, is blocked,
    /// already holds a live request, or the channel is at its pending limit.
    pub fn create_request(
        &self,
        sender_id: &str,
        sender_name: &str,
        channel_id: &str,
    ) -> Option<PairingRequest> {
        if self.is_authorized(sender_id) {
            return None;
        }

        let now = Utc::now();
        let request = {
            let mut state = self.lock();

            if state.lists.blocked.contains(sender_id) {
                tracing::info!(sender_id, channel_id, "blocked sender attempted pairing");
                return None;
            }

            state.cleanup_expired(now);

            if state.pending.values().any(|r| r.sender_id == sender_id) {
                return None;
            }

            let channel_pending = state
                .pending
                .values()
                .filter(|r| r.channel_id == channel_id)
                .count();
            if channel_pending >= self.config.max_pending_per_channel {
                tracing::warn!(
                    channel_id,
                    max = self.config.max_pending_per_channel,
                    "max pending pairing requests reached"
                );
                return None;
            }

            let Some(code) = (0..MAX_CODE_ATTEMPTS)
                .map(|_| generate_code(self.config.code_length))
                .find(|code| !state.pending.contains_key(code))
            else {
                tracing::warn!(
                    channel_id,
                    pending = state.pending.len(),
                    "no free pairing code available"
                );
                return None;
            };

            let ttl = TimeDelta::from_std(self.config.code_ttl).unwrap_or(TimeDelta::hours(1));
            let request = PairingRequest {
                code: code.clone(),
                sender_id: sender_id.to_string(),
                sender_name: sender_name.to_string(),
                channel_id: channel_id.to_string(),
                created_at: now,
                expires_at: now + ttl,
            };
            state.pending.insert(code, request.clone());
            request
        };

        tracing::info!(sender_id, sender_name, channel_id, "pairing request created");
        self.emit(PairingEvent::Requested(request.clone()));
        Some(request)
    }

    /// Approve a pairing code
    ///
    /// Moves the sender to the allowlist and returns the request so the
    /// sender can be notified. Unknown or expired codes return `None`.
    ///
    /// # Errors
    ///
    /// Returns error if the allowlist cannot be persisted. The approval still
    /// takes effect in memory.
    pub fn approve_code(&self, code: &str) -> Result<Option<PairingRequest>> {
        let code = code.trim().to_uppercase();
        let request = {
            let mut state = self.lock();
            let Some(request) = state.pending.remove(&code) else {
                return Ok(None);
            };
            if request.is_expired() {
                tracing::debug!(sender_id = %request.sender_id, "pairing code expired");
                return Ok(None);
            }

            state.lists.blocked.remove(&request.sender_id);
            state.lists.allowed.insert(request.sender_id.clone());
            let saved = self.persist(&state);
            self.emit(PairingEvent::Approved(request.clone()));
            saved.map(|()| request)?
        };

        tracing::info!(
            sender_id = %request.sender_id,
            sender_name = %request.sender_name,
            "pairing approved"
        );
        Ok(Some(request))
    }

    /// Discard a pending code
    pub fn deny_code(&self, code: &str) -> Option<PairingRequest> {
        let code = code.trim().to_uppercase();
        let request = self.lock().pending.remove(&code)?;
        tracing::info!(
            sender_id = %request.sender_id,
            sender_name = %request.sender_name,
            "pairing denied"
        );
        self.emit(PairingEvent::Denied(request.clone()));
        Some(request)
    }

    /// Remove a sender from the allowlist
    ///
    /// Returns whether the sender was allowed.
    ///
    /// # Errors
    ///
    /// Returns error if the allowlist cannot be persisted
    pub fn revoke(&self, sender_id: &str) -> Result<bool> {
        {
            let mut state = self.lock();
            if !state.lists.allowed.remove(sender_id) {
                return Ok(false);
            }
            self.persist(&state)?;
        }
        tracing::info!(sender_id, "access revoked");
        self.emit(PairingEvent::Revoked(sender_id.to_string()));
        Ok(true)
    }

    /// Block a sender
    ///
    /// Removes them from the allowlist and drops any pending request.
    ///
    /// # Errors
    ///
    /// Returns error if the allowlist cannot be persisted
    pub fn block(&self, sender_id: &str) -> Result<()> {
        let dropped: Vec<PairingRequest> = {
            let mut state = self.lock();
            state.lists.allowed.remove(sender_id);
            state.lists.blocked.insert(sender_id.to_string());
            let codes: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, r)| r.sender_id == sender_id)
                .map(|(code, _)| code.clone())
                .collect();
            let dropped = codes
                .iter()
                .filter_map(|code| state.pending.remove(code))
                .collect();
            self.persist(&state)?;
            dropped
        };

        tracing::info!(sender_id, "sender blocked");
        for request in dropped {
            self.emit(PairingEvent::Denied(request));
        }
        self.emit(PairingEvent::Blocked(sender_id.to_string()));
        Ok(())
    }

    /// Add a sender to the allowlist directly, clearing any block
    ///
    /// # Errors
    ///
    /// Returns error if the allowlist cannot be persisted
    pub fn allow(&self, sender_id: &str) -> Result<()> {
        {
            let mut state = self.lock();
            state.lists.blocked.remove(sender_id);
            state.lists.allowed.insert(sender_id.to_string());
            self.persist(&state)?;
        }
        tracing::info!(sender_id, "sender allowed");
        self.emit(PairingEvent::Allowed(sender_id.to_string()));
        Ok(())
    }

    /// Remove a sender from the blocklist
    ///
    /// Returns whether the sender was blocked.
    ///
    /// # Errors
    ///
    /// Returns error if the allowlist cannot be persisted
    pub fn unblock(&self, sender_id: &str) -> Result<bool> {
        {
            let mut state = self.lock();
            if !state.lists.blocked.remove(sender_id) {
                return Ok(false);
            }
            self.persist(&state)?;
        }
        tracing::info!(sender_id, "sender unblocked");
        self.emit(PairingEvent::Unblocked(sender_id.to_string()));
        Ok(true)
    }

    /// Live pending requests, oldest first
    #[must_use]
    pub fn list_pending(&self) -> Vec<PairingRequest> {
        let mut state = self.lock();
        state.cleanup_expired(Utc::now());
        let mut pending: Vec<PairingRequest> = state.pending.values().cloned().collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    /// Allowed sender ids, sorted
    #[must_use]
    pub fn list_allowed(&self) -> Vec<String> {
        self.lock().lists.allowed.iter().cloned().collect()
    }

    /// Blocked sender ids, sorted
    #[must_use]
    pub fn list_blocked(&self) -> Vec<String> {
        self.lock().lists.blocked.iter().cloned().collect()
    }

    #[must_use]
    pub fn summary(&self) -> PairingSummary {
        let pending = self.list_pending().len();
        let state = self.lock();
        PairingSummary {
            policy: self.config.policy,
            allowed: state.lists.allowed.len(),
            blocked: state.lists.blocked.len(),
            pending,
        }
    }

    /// Wait until `code` is approved, denied or expires, or `timeout` passes
    pub async fn wait_for_approval(&self, code: &str, timeout: Duration) -> ApprovalOutcome {
        let code = code.trim().to_uppercase();
        // Subscribe before reading state so no event is missed
        let mut events = self.subscribe();

        let Some(request) = self.lock().pending.get(&code).cloned() else {
            return ApprovalOutcome::Expired;
        };

        let until_expiry = (request.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let (deadline, on_deadline) = if until_expiry <= timeout {
            (until_expiry, ApprovalOutcome::Expired)
        } else {
            (timeout, ApprovalOutcome::TimedOut)
        };
        let sleep = tokio::time::sleep(deadline);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => return on_deadline,
                event = events.recv() => match event {
                    Ok(PairingEvent::Approved(req)) if req.code == code => {
                        return ApprovalOutcome::Approved(req);
                    }
                    Ok(PairingEvent::Denied(req)) if req.code == code => {
                        return ApprovalOutcome::Denied;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(outcome) = self.resolve_missed(&request) {
                            return outcome;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return ApprovalOutcome::TimedOut,
                },
            }
        }
    }

    /// Work out what happened to a request after missing events
    fn resolve_missed(&self, request: &PairingRequest) -> Option<ApprovalOutcome> {
        let state = self.lock();
        if state.pending.contains_key(&request.code) {
            return None;
        }
        if state.lists.allowed.contains(&request.sender_id) {
            Some(ApprovalOutcome::Approved(request.clone()))
        } else {
            Some(ApprovalOutcome::Denied)
        }
    }
}

/// Generate a random pairing code from the unambiguous alphabet
fn generate_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from(CHARSET[rng.gen_range(0..CHARSET.len())]))
        .collect()
}

fn load_lists(path: &Path) -> Result<AccessLists> {
    if !path.exists() {
        return Ok(AccessLists::default());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Rewrite the whole document via a temp file and rename
fn save_lists(path: &Path, lists: &AccessLists) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(lists)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(json.as_bytes())?;
    tmp.persist(path)
        .map_err(|e| Error::Pairing(format!("failed to save allowlist: {e}")))?;
    Ok(())
}
