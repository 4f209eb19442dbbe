// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Address-string parser: `[<class>+]<protocol>[://[<host>]]`.
//
// `<class>` selects a plugin by name, `<protocol>` and `<host>` are
// plugin-defined. The parse is done once at initialize/lookup time and
// the result owns its strings; the input is never retained.

use crate::error::{NaError, NaResult};

/// Parsed address triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    /// Explicit plugin class, if the string carried a `<class>+` prefix.
    pub class: Option<String>,
    /// Protocol name (never empty).
    pub protocol: String,
    /// Host part after `://`, if present and non-empty.
    pub host: Option<String>,
}

/// Parse an address string.
///
/// Missing class is permitted; `://` with an empty host is permitted.
/// Any other malformed prefix fails with [`NaError::ProtoNoSupport`].
pub fn parse(info: &str) -> NaResult<AddrInfo> {
    if info.is_empty() {
        return Err(NaError::ProtoNoSupport);
    }

    // A '+' only separates the class when it appears before any ':' or '/',
    // otherwise it belongs to the host part.
    let first_sep = info.find(|c| c == ':' || c == '/');
    let (class, rest) = match info.find('+') {
        Some(p) if first_sep.map_or(true, |s| p < s) => {
            let class = &info[..p];
            if class.is_empty() {
                return Err(NaError::ProtoNoSupport);
            }
            (Some(class.to_string()), &info[p + 1..])
        }
        _ => (None, info),
    };

    let (protocol, host) = match rest.find("://") {
        Some(i) => {
            let host = &rest[i + 3..];
            (
                &rest[..i],
                if host.is_empty() {
                    None
                } else {
                    Some(host.to_string())
                },
            )
        }
        None => (rest, None),
    };

    // A bare ':' or '/' in the protocol means the separator was malformed.
    if protocol.is_empty() || protocol.contains(':') || protocol.contains('/') {
        return Err(NaError::ProtoNoSupport);
    }

    Ok(AddrInfo {
        class,
        protocol: protocol.to_string(),
        host,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_only() {
        let a = parse("sm").unwrap();
        assert_eq!(a.class, None);
        assert_eq!(a.protocol, "sm");
        assert_eq!(a.host, None);
    }

    #[test]
    fn class_and_protocol() {
        let a = parse("sm+sm://12345/0").unwrap();
        assert_eq!(a.class.as_deref(), Some("sm"));
        assert_eq!(a.protocol, "sm");
        assert_eq!(a.host.as_deref(), Some("12345/0"));
    }

    #[test]
    fn empty_host_permitted() {
        let a = parse("sm://").unwrap();
        assert_eq!(a.protocol, "sm");
        assert_eq!(a.host, None);
    }

    #[test]
    fn host_with_plus() {
        let a = parse("tcp://node+3").unwrap();
        assert_eq!(a.class, None);
        assert_eq!(a.protocol, "tcp");
        assert_eq!(a.host.as_deref(), Some("node+3"));
    }

    #[test]
    fn malformed_separator() {
        assert!(matches!(parse("sm:/host"), Err(NaError::ProtoNoSupport)));
        assert!(matches!(parse("sm:host"), Err(NaError::ProtoNoSupport)));
        assert!(matches!(parse("+sm"), Err(NaError::ProtoNoSupport)));
        assert!(matches!(parse(""), Err(NaError::ProtoNoSupport)));
        assert!(matches!(parse("://host"), Err(NaError::ProtoNoSupport)));
    }
}
