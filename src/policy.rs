//! Access policy engine: a closed set of pure decision functions.
//!
//! Modeled as a sum type, not trait objects — the set of policies is fixed
//! and rarely grows, and an exhaustive `match` in [`decide`] means a new
//! variant is a compile error at every call site until handled.

use crate::identity::store::IdentityStore;
use crate::identity::{AccessLevel, Identity};
use crate::source::Source;

/// One of the six recognized access policies, keyed to an endpoint's read-
/// or write-access in the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Always allow. Unauthenticated endpoints (system-info, health).
    Open,
    /// Allow iff identity is present and its access level is exactly admin.
    Admin,
    /// Allow iff identity is present with access read or higher.
    User,
    /// Allow iff identity is present with access metrics, read, or admin.
    Metrics,
    /// `/v1/identities` write. Stateful: closes the enrollment window on
    /// every call, successful or not.
    IdentityWrite,
    /// `/v1/identities/enroll`. Fails with `Conflict` if already open.
    IdentityEnroll,
}

/// The outcome of a policy decision. `Conflict` only ever arises from
/// [`Policy::IdentityEnroll`] re-requested while the window is already open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    Conflict,
}

fn is_admin(identity: Option<&Identity>) -> bool {
    identity.is_some_and(|i| i.access == AccessLevel::Admin)
}

/// Evaluate `policy` against a resolved identity (or none), the classified
/// request source, and the shared identity store (read for the enrollment
/// flag, and mutated by the two stateful policies).
///
/// `credential_attempted` distinguishes "no credential material was
/// presented" from "credential material was presented but did not resolve to
/// any identity" — only the former is eligible for the `IdentityWrite`
/// bootstrap path. A request carrying an unknown Basic-auth user must not be
/// treated the same as one carrying nothing at all.
pub fn decide(policy: Policy, identity: Option<&Identity>, source: &Source, store: &IdentityStore, credential_attempted: bool) -> Decision {
    match policy {
        Policy::Open => Decision::Allow,

        Policy::Admin => {
            if is_admin(identity) {
                Decision::Allow
            } else {
                Decision::Deny
            }
        }

        Policy::User => {
            let allowed = identity.is_some_and(|i| i.access >= AccessLevel::Read);
            if allowed {
                Decision::Allow
            } else {
                Decision::Deny
            }
        }

        Policy::Metrics => {
            let allowed = identity.is_some_and(|i| i.access >= AccessLevel::Metrics);
            if allowed {
                Decision::Allow
            } else {
                Decision::Deny
            }
        }

        Policy::IdentityWrite => {
            let was_open = store.close_enrollment();
            let bootstrap = was_open && identity.is_none() && !credential_attempted && matches!(source, Source::HttpTls);

            if bootstrap || is_admin(identity) {
                Decision::Allow
            } else {
                Decision::Deny
            }
        }

        Policy::IdentityEnroll => {
            if store.enrollment_open() {
                return Decision::Conflict;
            }

            let allowed = is_admin(identity) && matches!(source, Source::UnixSocket(_));
            if allowed {
                store.open_enrollment();
                Decision::Allow
            } else {
                Decision::Deny
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn identity(name: &str, access: AccessLevel) -> Identity {
        Identity {
            name: name.to_string(),
            access,
            local: Some(1000),
            basic: None,
            cert: None,
        }
    }

    fn unix_source() -> Source {
        Source::UnixSocket(crate::source::RemoteAddr {
            pid: 1,
            uid: 1000,
            socket: PathBuf::from("/run/x.socket"),
        })
    }

    #[test]
    fn admin_policy_rejects_weaker_access() {
        let store = IdentityStore::new(None);
        let bob = identity("bob", AccessLevel::Read);
        assert_eq!(
            decide(Policy::Admin, Some(&bob), &unix_source(), &store, false),
            Decision::Deny
        );
    }

    #[test]
    fn user_policy_rejects_metrics_only_access() {
        let store = IdentityStore::new(None);
        let m = identity("m", AccessLevel::Metrics);
        assert_eq!(
            decide(Policy::User, Some(&m), &unix_source(), &store, false),
            Decision::Deny
        );
    }

    #[test]
    fn metrics_policy_accepts_admin_too() {
        let store = IdentityStore::new(None);
        let admin = identity("root", AccessLevel::Admin);
        assert_eq!(
            decide(Policy::Metrics, Some(&admin), &Source::HttpTls, &store, false),
            Decision::Allow
        );
    }

    #[test]
    fn identity_write_bootstrap_path_requires_open_tls_and_no_identity() {
        let store = IdentityStore::new(None);
        store.open_enrollment();
        assert_eq!(
            decide(Policy::IdentityWrite, None, &Source::HttpTls, &store, false),
            Decision::Allow
        );
        // the window must now be closed, even though it was the success path.
        assert!(!store.enrollment_open());
    }

    #[test]
    fn identity_write_unresolved_credential_does_not_bootstrap() {
        let store = IdentityStore::new(None);
        store.open_enrollment();
        // credentials were presented (just not ones that resolved); this
        // must not be treated as the no-credential bootstrap case.
        assert_eq!(
            decide(Policy::IdentityWrite, None, &Source::HttpTls, &store, true),
            Decision::Deny
        );
        assert!(!store.enrollment_open());
    }

    #[test]
    fn identity_write_closes_window_even_on_denial() {
        let store = IdentityStore::new(None);
        store.open_enrollment();
        // wrong source for bootstrap, no identity: must deny and still close.
        assert_eq!(
            decide(Policy::IdentityWrite, None, &unix_source(), &store, false),
            Decision::Deny
        );
        assert!(!store.enrollment_open());
    }

    #[test]
    fn identity_enroll_rejects_second_admin_while_open() {
        let store = IdentityStore::new(None);
        store.open_enrollment();
        let admin = identity("root", AccessLevel::Admin);
        assert_eq!(
            decide(Policy::IdentityEnroll, Some(&admin), &unix_source(), &store, false),
            Decision::Conflict
        );
    }

    #[test]
    fn identity_enroll_requires_unix_socket() {
        let store = IdentityStore::new(None);
        let admin = identity("root", AccessLevel::Admin);
        assert_eq!(
            decide(Policy::IdentityEnroll, Some(&admin), &Source::HttpTls, &store, false),
            Decision::Deny
        );
        assert!(!store.enrollment_open());
    }

    #[test]
    fn identity_enroll_opens_window_on_success() {
        let store = IdentityStore::new(None);
        let admin = identity("root", AccessLevel::Admin);
        assert_eq!(
            decide(Policy::IdentityEnroll, Some(&admin), &unix_source(), &store, false),
            Decision::Allow
        );
        assert!(store.enrollment_open());
    }
}
