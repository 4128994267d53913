//! Request source classification and the peer remote-address wire format.
//!
//! The wire format is `pid=<int>;uid=<uint>;socket=<path>;` — an ordered,
//! semicolon-terminated key=value list, produced by the peer-credential
//! resolver and parsed back out by the classifier that turns a raw
//! remote-address string plus a TLS flag into a [`Source`].

use std::fmt;
use std::path::PathBuf;

/// The pid/uid/socket-path triple the kernel reports for a unix-socket peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr {
    pub pid: i32,
    pub uid: u32,
    pub socket: PathBuf,
}

/// Sentinels meaning "not known"; never produced by a successful kernel call.
pub const UNRESOLVED_PID: i32 = -1;
pub const UNRESOLVED_UID: u32 = u32::MAX;

impl RemoteAddr {
    pub fn is_resolved(&self) -> bool {
        self.pid != UNRESOLVED_PID && self.uid != UNRESOLVED_UID
    }

    /// Encode as `pid=<int>;uid=<uint>;socket=<path>;`.
    pub fn encode(&self) -> String {
        format!("pid={};uid={};socket={};", self.pid, self.uid, self.socket.display())
    }

    /// Parse the form produced by [`RemoteAddr::encode`]. Any deviation
    /// (missing field, unknown key, trailing garbage) is rejected.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let mut pid: Option<i32> = None;
        let mut uid: Option<u32> = None;
        let mut socket: Option<PathBuf> = None;

        for field in s.split(';') {
            if field.is_empty() {
                continue;
            }
            let (key, value) = field.split_once('=').ok_or(ParseError::Malformed)?;
            match key {
                "pid" => pid = Some(value.parse().map_err(|_| ParseError::Malformed)?),
                "uid" => uid = Some(value.parse().map_err(|_| ParseError::Malformed)?),
                "socket" => socket = Some(PathBuf::from(value)),
                _ => return Err(ParseError::Malformed),
            }
        }

        Ok(Self {
            pid: pid.ok_or(ParseError::Malformed)?,
            uid: uid.ok_or(ParseError::Malformed)?,
            socket: socket.ok_or(ParseError::Malformed)?,
        })
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed remote address")]
    Malformed,
}

/// The classified transport of a request. `Unknown` is strictly less
/// trusted than any other variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    UnixSocket(RemoteAddr),
    HttpTls,
    HttpPlain,
    Unknown,
}

impl Source {
    /// Classify a request from its raw remote-address string (as produced by
    /// the peer-credential resolver, if any) and whether it arrived over TLS.
    pub fn classify(remote_addr: Option<&str>, is_tls: bool) -> Self {
        if let Some(raw) = remote_addr {
            if let Ok(addr) = RemoteAddr::parse(raw) {
                if addr.is_resolved() && !addr.socket.as_os_str().is_empty() {
                    return Self::UnixSocket(addr);
                }
            }
        }

        if is_tls {
            Self::HttpTls
        } else if remote_addr.is_none() {
            Self::Unknown
        } else {
            Self::HttpPlain
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_parse_round_trips() {
        let addr = RemoteAddr {
            pid: 4242,
            uid: 1000,
            socket: PathBuf::from("/run/daemon.socket"),
        };
        let encoded = addr.encode();
        assert_eq!(encoded, "pid=4242;uid=1000;socket=/run/daemon.socket;");
        assert_eq!(RemoteAddr::parse(&encoded).unwrap(), addr);
    }

    #[test]
    fn parse_rejects_missing_field() {
        assert!(matches!(RemoteAddr::parse("pid=1;uid=2;"), Err(ParseError::Malformed)));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            RemoteAddr::parse("not a remote address"),
            Err(ParseError::Malformed)
        ));
    }

    #[test]
    fn sentinel_values_are_never_resolved() {
        let addr = RemoteAddr {
            pid: UNRESOLVED_PID,
            uid: UNRESOLVED_UID,
            socket: PathBuf::new(),
        };
        assert!(!addr.is_resolved());
    }

    #[test]
    fn classify_picks_unix_socket_over_tls_flag() {
        let raw = "pid=1;uid=0;socket=/run/x.socket;";
        assert_eq!(
            Source::classify(Some(raw), false),
            Source::UnixSocket(RemoteAddr::parse(raw).unwrap())
        );
    }

    #[test]
    fn classify_falls_back_to_tls_or_plain_or_unknown() {
        assert_eq!(Source::classify(None, true), Source::HttpTls);
        assert_eq!(Source::classify(Some("garbage"), false), Source::HttpPlain);
        assert_eq!(Source::classify(None, false), Source::Unknown);
    }
}
