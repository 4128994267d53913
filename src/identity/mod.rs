//! Identity records and the access-level lattice.
//!
//! An [`Identity`] is named, carries an [`AccessLevel`], and carries at
//! least one authentication binding (local uid, HTTP Basic hash, or client
//! certificate). See [`crate::identity::store`] for the mutex-guarded table
//! that holds these and resolves requests against them.

pub mod store;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordered access lattice: `untrusted < metrics < read < admin`.
///
/// The discriminant order *is* the lattice order: every policy check in
/// [`crate::policy`] is a plain `>=`/`==` comparison against this enum, which
/// is enough to express all four policies (`metrics` never
/// satisfies a `User` check because it sits below `read`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Untrusted,
    Metrics,
    Read,
    Admin,
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Untrusted => "untrusted",
            Self::Metrics => "metrics",
            Self::Read => "read",
            Self::Admin => "admin",
        };
        f.write_str(s)
    }
}

/// A binding's external wire shape, mirrored 1:1 onto [`Binding`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalBinding {
    #[serde(rename = "user-id")]
    pub user_id: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BasicBinding {
    /// Already-hashed (crypt-style) on input; masked to `"*****"` on output.
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CertBinding {
    /// A single PEM block on input; masked to `"*****"` on output.
    pub pem: String,
}

/// A stored identity: name, access level, and one-or-more bindings.
///
/// The three bindings are flattened onto `Identity` directly (`local`,
/// `basic`, `cert`) rather than collected into a `Vec<Binding>`: an identity
/// may carry any subset of the three simultaneously (at least one is
/// required), and every lookup in [`store`] is keyed by a specific channel,
/// never by iterating an identity's bindings.
#[derive(Debug)]
pub struct Identity {
    pub name: String,
    pub access: AccessLevel,
    pub local: Option<u32>,
    pub basic: Option<String>,
    pub cert: Option<Vec<u8>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("identity name must not be empty")]
    EmptyName,
    #[error("unknown access level {0:?}")]
    UnknownAccess(String),
    #[error("identity must carry at least one of local, basic, or cert")]
    NoBinding,
    #[error("basic binding must carry a non-empty hash")]
    EmptyHash,
    #[error("cert binding must be exactly one PEM block with no trailing bytes")]
    BadCertPem,
}

/// The wire representation of an identity, as accepted from or returned to a
/// client.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdentityJson {
    pub access: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<CertBinding>,
}

const MASK: &str = "*****";

impl Identity {
    /// Validate and construct an identity from its client-supplied JSON form.
    pub fn from_json(name: &str, json: IdentityJson) -> Result<Self, ValidationError> {
        if name.is_empty() {
            return Err(ValidationError::EmptyName);
        }

        let access = match json.access.as_str() {
            "untrusted" => AccessLevel::Untrusted,
            "metrics" => AccessLevel::Metrics,
            "read" => AccessLevel::Read,
            "admin" => AccessLevel::Admin,
            other => return Err(ValidationError::UnknownAccess(other.to_string())),
        };

        if json.local.is_none() && json.basic.is_none() && json.cert.is_none() {
            return Err(ValidationError::NoBinding);
        }

        let basic = match json.basic {
            Some(b) if b.password.is_empty() => return Err(ValidationError::EmptyHash),
            Some(b) => Some(b.password),
            None => None,
        };

        let cert = match json.cert {
            Some(c) => Some(parse_single_cert_der(&c.pem)?),
            None => None,
        };

        Ok(Self {
            name: name.to_string(),
            access,
            local: json.local.map(|l| l.user_id),
            basic,
            cert,
        })
    }

    /// Render to the masked external JSON shape (never leaks secret material).
    pub fn to_json(&self) -> IdentityJson {
        IdentityJson {
            access: self.access.to_string(),
            local: self.local.map(|user_id| LocalBinding { user_id }),
            basic: self.basic.as_ref().map(|_| BasicBinding {
                password: MASK.to_string(),
            }),
            cert: self.cert.as_ref().map(|_| CertBinding {
                pem: MASK.to_string(),
            }),
        }
    }

    pub fn verify_basic(&self, plaintext: &str) -> bool {
        match &self.basic {
            Some(hash) => sha_crypt::sha512_check(plaintext, hash).is_ok(),
            None => false,
        }
    }
}

/// Parse exactly one PEM block as X.509, rejecting trailing bytes, and
/// return the DER contents.
fn parse_single_cert_der(pem: &str) -> Result<Vec<u8>, ValidationError> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    let mut blocks = rustls_pemfile::certs(&mut reader);

    let first = blocks.next().ok_or(ValidationError::BadCertPem)?;
    let cert = first.map_err(|_| ValidationError::BadCertPem)?;

    if blocks.next().is_some() {
        return Err(ValidationError::BadCertPem);
    }

    x509_parser::parse_x509_certificate(&cert)
        .map_err(|_| ValidationError::BadCertPem)?;

    Ok(cert.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_level_order_matches_lattice() {
        assert!(AccessLevel::Untrusted < AccessLevel::Metrics);
        assert!(AccessLevel::Metrics < AccessLevel::Read);
        assert!(AccessLevel::Read < AccessLevel::Admin);
    }

    #[test]
    fn local_binding_accepts_max_u32_uid_and_rejects_overflow() {
        let max_uid = format!(r#"{{"user-id":{}}}"#, u32::MAX);
        let binding: LocalBinding = serde_json::from_str(&max_uid).unwrap();
        assert_eq!(binding.user_id, u32::MAX);

        let overflow = format!(r#"{{"user-id":{}}}"#, u64::from(u32::MAX) + 1);
        assert!(serde_json::from_str::<LocalBinding>(&overflow).is_err());
    }

    #[test]
    fn rejects_identity_with_no_binding() {
        let json = IdentityJson {
            access: "read".to_string(),
            local: None,
            basic: None,
            cert: None,
        };
        assert!(matches!(
            Identity::from_json("bob", json),
            Err(ValidationError::NoBinding)
        ));
    }

    #[test]
    fn masks_secret_fields_on_output() {
        let identity = Identity {
            name: "bob".to_string(),
            access: AccessLevel::Read,
            local: None,
            basic: Some("$6$salt$hash".to_string()),
            cert: None,
        };

        let json = identity.to_json();
        assert_eq!(json.basic.unwrap().password, MASK);
    }
}
