//! User-scoped notice records and the visibility filter that governs who
//! may list or fetch them.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

pub const MAX_KEY_BYTES: usize = 256;
pub const MAX_DATA_BYTES: usize = 4096;

/// Sentinel meaning "every identity may see this", distinct from any real uid.
pub const PUBLIC: Option<u32> = None;

#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub id: u64,
    /// `None` is the public sentinel.
    pub user_id: Option<u32>,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub key: String,
    pub data: HashMap<String, String>,
    #[serde(skip)]
    pub repeat_after: Option<Duration>,
    pub occurrences: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NoticePost {
    pub action: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
    #[serde(rename = "repeat-after", default)]
    pub repeat_after: Option<String>,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum NoticeError {
    #[error("action must be \"add\"")]
    BadAction,
    #[error("type must be \"custom\"")]
    BadType,
    #[error("key does not match the required format or exceeds {MAX_KEY_BYTES} bytes")]
    BadKey,
    #[error("repeat-after is not a valid duration")]
    BadRepeatAfter,
    #[error("data exceeds {MAX_DATA_BYTES} encoded bytes")]
    DataTooLarge,
}

/// Visibility-filter outcome for a list request.
#[derive(Clone, Copy)]
pub enum ListFilter {
    /// Own uid or public only (the non-admin default, and the admin default
    /// with no explicit filter).
    OwnAndPublic,
    /// `select=all`: every notice, admin only.
    All,
    /// `user-id=<uid>`: notices owned by that uid, or public. Admin only.
    User(u32),
}

struct Inner {
    notices: Vec<Notice>,
    next_id: u64,
}

pub struct NoticeStore {
    inner: RwLock<Inner>,
    notify: Notify,
}

impl NoticeStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                notices: Vec::new(),
                next_id: 1,
            }),
            notify: Notify::new(),
        }
    }

    /// Validate and append a notice, stamping `owner` as its uid
    /// unconditionally (the requester may not claim a different owner).
    pub fn post(&self, owner: u32, post: NoticePost) -> Result<Notice, NoticeError> {
        self.post_with_owner(Some(owner), post)
    }

    /// Validate and append a notice visible to every identity (the
    /// `public` sentinel). Not reachable from the HTTP surface — the wire
    /// endpoint always stamps the requester's own uid — this is for
    /// announcements the daemon itself originates.
    pub fn post_public(&self, post: NoticePost) -> Result<Notice, NoticeError> {
        self.post_with_owner(None, post)
    }

    fn post_with_owner(&self, owner: Option<u32>, post: NoticePost) -> Result<Notice, NoticeError> {
        if post.action != "add" {
            return Err(NoticeError::BadAction);
        }
        if post.kind != "custom" {
            return Err(NoticeError::BadType);
        }
        if !is_valid_key(&post.key) {
            return Err(NoticeError::BadKey);
        }

        let repeat_after = match post.repeat_after {
            Some(raw) => Some(parse_duration(&raw).ok_or(NoticeError::BadRepeatAfter)?),
            None => None,
        };

        let data_len: usize = post
            .data
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        if data_len > MAX_DATA_BYTES {
            return Err(NoticeError::DataTooLarge);
        }

        let notice = {
            let mut guard = self.inner.write();
            let id = guard.next_id;
            guard.next_id += 1;

            let notice = Notice {
                id,
                user_id: owner,
                kind: "custom",
                key: post.key,
                data: post.data,
                repeat_after,
                occurrences: 1,
            };
            guard.notices.push(notice.clone());
            notice
        };

        self.notify.notify_waiters();
        Ok(notice)
    }

    /// List notices visible to `requester`, applying the filter the router
    /// derived from the query string and the requester's admin status.
    ///
    /// `is_admin` here is the notice-specific sense (root uid or the
    /// daemon's own process uid), not the identity's access
    /// level — a `read`-or-higher identity may hit this endpoint at all
    /// (gated by [`crate::policy::Policy::User`]), but only root or the
    /// daemon itself may widen the filter.
    pub fn list(&self, requester_uid: u32, is_admin: bool, filter: ListFilter) -> Vec<Notice> {
        let guard = self.inner.read();

        guard
            .notices
            .iter()
            .filter(|n| matches_filter(n, requester_uid, is_admin, filter))
            .cloned()
            .collect()
    }

    /// Single-notice fetch. Returns `None` both for an unknown id and for a
    /// notice belonging to someone else when the requester is non-admin —
    /// callers must map that absence to 404, never 403, to avoid an
    /// existence leak.
    pub fn get(&self, id: u64, requester_uid: u32, is_admin: bool) -> Option<Notice> {
        let guard = self.inner.read();
        let notice = guard.notices.iter().find(|n| n.id == id)?;

        let visible = is_admin || notice.user_id == Some(requester_uid) || notice.user_id.is_none();

        visible.then(|| notice.clone())
    }

    /// Wait until `predicate` matches an existing notice, the deadline
    /// elapses, or `cancelled` resolves — whichever comes first. A deadline
    /// is not an error: callers get back whatever `list` would have returned.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        cancelled: impl std::future::Future<Output = ()>,
        predicate: impl Fn(&Notice) -> bool,
    ) -> WaitOutcome {
        let deadline = SystemTime::now() + timeout;
        tokio::pin!(cancelled);

        loop {
            {
                let guard = self.inner.read();
                if guard.notices.iter().any(&predicate) {
                    return WaitOutcome::Ready;
                }
            }

            let remaining = match deadline.duration_since(SystemTime::now()) {
                Ok(d) => d,
                Err(_) => return WaitOutcome::DeadlineElapsed,
            };

            tokio::select! {
                _ = self.notify.notified() => continue,
                _ = tokio::time::sleep(remaining) => return WaitOutcome::DeadlineElapsed,
                _ = &mut cancelled => return WaitOutcome::Cancelled,
            }
        }
    }
}

impl Default for NoticeStore {
    fn default() -> Self {
        Self::new()
    }
}

/// The same own-uid/public/admin-widened visibility rule `list` and the
/// long-poll wait predicate both need, kept in one place so a waiter can
/// never wake on (or fail to wake on) a different set of notices than a
/// plain list with the same filter would return.
pub fn matches_filter(notice: &Notice, requester_uid: u32, is_admin: bool, filter: ListFilter) -> bool {
    match filter {
        ListFilter::All if is_admin => true,
        ListFilter::User(uid) if is_admin => notice.user_id == Some(uid) || notice.user_id.is_none(),
        _ => notice.user_id == Some(requester_uid) || notice.user_id.is_none(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    DeadlineElapsed,
    Cancelled,
}

/// `^[a-z0-9](-[a-z0-9]+)*(\.[a-z0-9](-[a-z0-9]+)*)+(/[a-z0-9](-[a-z0-9]+)*)+$`,
/// hand-rolled rather than pulled in via a regex crate the rest of the stack
/// has no other use for: a reverse-domain-name segment, then one-or-more
/// dotted labels, then one-or-more slash-separated path labels.
fn is_valid_key(key: &str) -> bool {
    if key.is_empty() || key.len() > MAX_KEY_BYTES {
        return false;
    }

    fn is_label_char(c: char) -> bool {
        c.is_ascii_lowercase() || c.is_ascii_digit()
    }

    fn take_label(s: &str) -> Option<&str> {
        let mut chars = s.char_indices();
        let (_, first) = chars.next()?;
        if !is_label_char(first) {
            return None;
        }
        let mut end = first.len_utf8();
        let mut prev_was_dash = false;
        for (i, c) in chars {
            if c == '-' {
                if prev_was_dash {
                    return None;
                }
                prev_was_dash = true;
                end = i + c.len_utf8();
                continue;
            }
            if !is_label_char(c) {
                break;
            }
            prev_was_dash = false;
            end = i + c.len_utf8();
        }
        if prev_was_dash {
            return None;
        }
        Some(&s[..end])
    }

    let Some(first) = take_label(key) else { return false };
    let mut rest = &key[first.len()..];

    let mut dot_labels = 0;
    while let Some(stripped) = rest.strip_prefix('.') {
        match take_label(stripped) {
            Some(label) => {
                dot_labels += 1;
                rest = &stripped[label.len()..];
            }
            None => break,
        }
    }
    if dot_labels == 0 {
        return false;
    }

    let mut slash_labels = 0;
    while let Some(stripped) = rest.strip_prefix('/') {
        match take_label(stripped) {
            Some(label) => {
                slash_labels += 1;
                rest = &stripped[label.len()..];
            }
            None => break,
        }
    }

    slash_labels > 0 && rest.is_empty()
}

/// Parse a `timeout=` query value on `notices`/`changes/{id}/wait`. Shares
/// the same Go-style duration grammar as `repeat-after`; a failure is a 400.
pub fn parse_wait_timeout(raw: &str) -> Option<Duration> {
    parse_duration(raw)
}

/// A minimal duration parser for Go-style strings (`"500ms"`, `"1h30m"`),
/// enough for `repeat-after`. Unknown units or a non-numeric magnitude fail.
fn parse_duration(raw: &str) -> Option<Duration> {
    let mut total = Duration::ZERO;
    let mut rest = raw;

    if rest.is_empty() {
        return None;
    }

    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return None;
        }
        let magnitude: f64 = rest[..digits_end].parse().ok()?;
        rest = &rest[digits_end..];

        let (unit_len, seconds_per_unit) = if rest.starts_with("ms") {
            (2, 0.001)
        } else if rest.starts_with('s') {
            (1, 1.0)
        } else if rest.starts_with('m') {
            (1, 60.0)
        } else if rest.starts_with('h') {
            (1, 3600.0)
        } else {
            return None;
        };

        total += Duration::from_secs_f64(magnitude * seconds_per_unit);
        rest = &rest[unit_len..];
    }

    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_key_accepted() {
        assert!(is_valid_key("canonical.com/example"));
        assert!(is_valid_key("my-app.example.com/task/done"));
    }

    #[test]
    fn key_without_dot_rejected() {
        assert!(!is_valid_key("example/path"));
    }

    #[test]
    fn key_without_slash_rejected() {
        assert!(!is_valid_key("canonical.com"));
    }

    #[test]
    fn key_boundary_lengths() {
        let domain = "a.b/";
        let pad_len = MAX_KEY_BYTES - domain.len();
        let key_256 = format!("{domain}{}", "x".repeat(pad_len));
        assert_eq!(key_256.len(), MAX_KEY_BYTES);
        assert!(is_valid_key(&key_256));

        let key_257 = format!("{key_256}x");
        assert_eq!(key_257.len(), MAX_KEY_BYTES + 1);
        assert!(!is_valid_key(&key_257));
    }

    #[test]
    fn post_stamps_requester_as_owner() {
        let store = NoticeStore::new();
        let notice = store
            .post(
                1000,
                NoticePost {
                    action: "add".to_string(),
                    kind: "custom".to_string(),
                    key: "canonical.com/example".to_string(),
                    repeat_after: None,
                    data: HashMap::new(),
                },
            )
            .unwrap();
        assert_eq!(notice.user_id, Some(1000));
    }

    #[test]
    fn non_admin_never_sees_other_users_notices() {
        let store = NoticeStore::new();
        store
            .post(
                0,
                NoticePost {
                    action: "add".to_string(),
                    kind: "custom".to_string(),
                    key: "canonical.com/a".to_string(),
                    repeat_after: None,
                    data: HashMap::new(),
                },
            )
            .unwrap();
        store
            .post(
                1000,
                NoticePost {
                    action: "add".to_string(),
                    kind: "custom".to_string(),
                    key: "canonical.com/b".to_string(),
                    repeat_after: None,
                    data: HashMap::new(),
                },
            )
            .unwrap();

        let seen = store.list(1000, false, ListFilter::OwnAndPublic);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].key, "canonical.com/b");
    }

    #[test]
    fn single_notice_get_hides_other_users_notice_as_not_found() {
        let store = NoticeStore::new();
        let notice = store
            .post(
                0,
                NoticePost {
                    action: "add".to_string(),
                    kind: "custom".to_string(),
                    key: "canonical.com/a".to_string(),
                    repeat_after: None,
                    data: HashMap::new(),
                },
            )
            .unwrap();

        assert!(store.get(notice.id, 1000, false).is_none());
        assert!(store.get(notice.id, 0, false).is_some());
    }

    #[test]
    fn data_over_4096_bytes_rejected() {
        let store = NoticeStore::new();
        let mut data = HashMap::new();
        data.insert("k".to_string(), "x".repeat(4096));
        let err = store.post(
            1000,
            NoticePost {
                action: "add".to_string(),
                kind: "custom".to_string(),
                key: "canonical.com/a".to_string(),
                repeat_after: None,
                data,
            },
        );
        assert!(matches!(err, Err(NoticeError::DataTooLarge)));
    }
}
