//! Durable store for push subscriptions and notification history.
//!
//! Both collections persist as full-snapshot JSON files under the data
//! directory (`subscriptions.json`, `notifications.json`), rewritten
//! wholesale on every mutation. Writes go through a temp file and an
//! atomic rename so a crash mid-write leaves the previous snapshot
//! intact rather than a truncated file.
//!
//! Every logical operation (read current set, mutate, persist) runs
//! under one store-wide mutex so concurrent HTTP handlers cannot
//! interleave a read and a write and lose an update.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Maximum number of notifications retained in history.
pub const MAX_HISTORY: usize = 100;

const SUBS_FILE: &str = "subscriptions.json";
const HISTORY_FILE: &str = "notifications.json";

/// A browser's push subscription as delivered by `PushSubscription.toJSON()`.
///
/// Identity is the endpoint URL; re-subscribing with the same endpoint
/// replaces the stored entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subscription {
    /// Push service endpoint URL.
    pub endpoint: String,
    /// Keying material required by the push protocol.
    #[serde(default)]
    pub keys: SubscriptionKeys,
}

/// Encryption keys from the browser subscription.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubscriptionKeys {
    /// Browser's P-256 ECDH public key (base64url).
    #[serde(default)]
    pub p256dh: String,
    /// Shared auth secret (base64url).
    #[serde(default)]
    pub auth: String,
}

/// How a notification was responded to. Write-once: a notification
/// carries at most one of these, ever.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseAction {
    /// Confirm a pending prompt (`y`).
    Approve,
    /// Dismiss a pending prompt (`Escape`).
    Reject,
    /// Free-form text answer followed by `Enter`.
    Text,
}

impl ResponseAction {
    /// Parse the wire form used by the respond endpoint.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "text" => Some(Self::Text),
            _ => None,
        }
    }

    /// Lowercase wire form, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Text => "text",
        }
    }
}

/// One emitted event, as stored in history (newest first).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
    /// Opaque unique token assigned at creation.
    pub id: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub event_type: String,
    /// Target pane handle (`%<integer>`), if the event came from tmux.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmux_pane: Option<String>,
    /// Correlation tag from the emitting automation session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Creation time, seconds since the Unix epoch.
    pub timestamp: f64,
    /// Set exactly once by the respond path, then immutable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded: Option<ResponseAction>,
}

/// Caller-supplied fields for a new notification; id and timestamp are
/// assigned by the store.
#[derive(Clone, Debug, Default)]
pub struct NotificationFields {
    pub title: String,
    pub message: String,
    pub event_type: String,
    pub tmux_pane: Option<String>,
    pub session_id: Option<String>,
}

/// Result of the write-once `responded` transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The transition committed; this caller won.
    Applied,
    /// Another caller already committed this action.
    AlreadyResponded(ResponseAction),
    /// No notification with that id (expired or never existed).
    NotFound,
}

/// Single source of truth for subscriptions and notification history.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
#[derive(Debug)]
pub struct Store {
    data_dir: PathBuf,
    lock: Mutex<()>,
}

impl Store {
    /// Open (and create if needed) the store under `data_dir`.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
        Ok(Self {
            data_dir,
            lock: Mutex::new(()),
        })
    }

    /// All current subscriptions, in stored order.
    pub fn subscriptions(&self) -> Result<Vec<Subscription>> {
        let _guard = self.lock.lock().expect("store lock poisoned");
        self.read_list(SUBS_FILE)
    }

    /// Add a subscription, replacing any existing entry with the same
    /// endpoint. Idempotent under repeated identical input.
    pub fn upsert_subscription(&self, sub: Subscription) -> Result<()> {
        let _guard = self.lock.lock().expect("store lock poisoned");
        let mut subs: Vec<Subscription> = self.read_list(SUBS_FILE)?;
        subs.retain(|s| s.endpoint != sub.endpoint);
        subs.push(sub);
        self.write_list(SUBS_FILE, &subs)
    }

    /// Remove all entries matching `endpoint`. Returns whether anything
    /// was removed.
    pub fn remove_subscription(&self, endpoint: &str) -> Result<bool> {
        let _guard = self.lock.lock().expect("store lock poisoned");
        let mut subs: Vec<Subscription> = self.read_list(SUBS_FILE)?;
        let before = subs.len();
        subs.retain(|s| s.endpoint != endpoint);
        let removed = subs.len() < before;
        self.write_list(SUBS_FILE, &subs)?;
        Ok(removed)
    }

    /// Record a new notification: assigns a fresh id and timestamp,
    /// prepends to history, truncates to [`MAX_HISTORY`], persists.
    /// Returns the assigned id.
    pub fn add_notification(&self, fields: NotificationFields) -> Result<String> {
        let id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let timestamp = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let notification = Notification {
            id: id.clone(),
            title: fields.title,
            message: fields.message,
            event_type: fields.event_type,
            tmux_pane: fields.tmux_pane.filter(|p| !p.is_empty()),
            session_id: fields.session_id.filter(|s| !s.is_empty()),
            timestamp,
            responded: None,
        };

        let _guard = self.lock.lock().expect("store lock poisoned");
        let mut history: Vec<Notification> = self.read_list(HISTORY_FILE)?;
        history.insert(0, notification);
        history.truncate(MAX_HISTORY);
        self.write_list(HISTORY_FILE, &history)?;
        Ok(id)
    }

    /// Exact-match lookup by id.
    pub fn get_notification(&self, id: &str) -> Result<Option<Notification>> {
        let _guard = self.lock.lock().expect("store lock poisoned");
        let history: Vec<Notification> = self.read_list(HISTORY_FILE)?;
        Ok(history.into_iter().find(|n| n.id == id))
    }

    /// Commit the write-once `responded` transition for `id`.
    ///
    /// The check and the write happen under the store lock, so of any
    /// number of racing callers exactly one observes [`MarkOutcome::Applied`].
    pub fn mark_responded(&self, id: &str, action: ResponseAction) -> Result<MarkOutcome> {
        let _guard = self.lock.lock().expect("store lock poisoned");
        let mut history: Vec<Notification> = self.read_list(HISTORY_FILE)?;
        let Some(entry) = history.iter_mut().find(|n| n.id == id) else {
            return Ok(MarkOutcome::NotFound);
        };
        if let Some(prior) = entry.responded {
            return Ok(MarkOutcome::AlreadyResponded(prior));
        }
        entry.responded = Some(action);
        self.write_list(HISTORY_FILE, &history)?;
        Ok(MarkOutcome::Applied)
    }

    /// Most recent notifications, newest first, truncated to `limit`.
    pub fn notifications(&self, limit: usize) -> Result<Vec<Notification>> {
        let _guard = self.lock.lock().expect("store lock poisoned");
        let mut history: Vec<Notification> = self.read_list(HISTORY_FILE)?;
        history.truncate(limit);
        Ok(history)
    }

    fn read_list<T: for<'de> Deserialize<'de>>(&self, file: &str) -> Result<Vec<T>> {
        let path = self.data_dir.join(file);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Full-snapshot rewrite through a temp file + rename, so readers
    /// never observe a partially written snapshot.
    fn write_list<T: Serialize>(&self, file: &str, items: &[T]) -> Result<()> {
        let path = self.data_dir.join(file);
        let tmp = self.data_dir.join(format!("{file}.tmp"));
        let content = serde_json::to_string_pretty(items).context("failed to serialize snapshot")?;
        fs::write(&tmp, content).with_context(|| format!("failed to write {}", tmp.display()))?;
        set_private_perms(&tmp)?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_private_perms(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_private_perms(_path: &Path) -> Result<()> {
    Ok(())
}
