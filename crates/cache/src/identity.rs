//! Database identity with credentials removed
//!
//! The identity string is part of every cache key, so two connections to the
//! same database must scrub to the same text regardless of the password used,
//! and the password must never reach disk.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection-string keys whose values are secrets
const SECRET_KEYS: &[&str] = &[
    "password",
    "pwd",
    "passwd",
    "pass",
    "secret",
    "token",
    "access_token",
    "sslpassword",
    "api_key",
];

/// Connection-string keys that name the user
const USER_KEYS: &[&str] = &["user", "username", "uid", "user id", "user_id"];

/// Identity of the target database, safe to hash and persist
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DbIdentity {
    identity: String,
    username: Option<String>,
}

impl DbIdentity {
    /// Use a caller-supplied identity verbatim
    #[must_use]
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            username: None,
        }
    }

    /// Derive an identity from a connection URI or key/value DSN
    ///
    /// `postgresql://bob:secret@db:5432/sales?sslmode=require&password=x`
    /// becomes `postgresql://db:5432/sales?sslmode=require` with username `bob`.
    /// `host=db user=bob password=secret dbname=sales` becomes
    /// `host=db user=bob dbname=sales` with username `bob`; a DSN keeps its
    /// user key in place. Anything else (a file path) is used as is.
    #[must_use]
    pub fn from_connection_string(conn: &str) -> Self {
        let conn = conn.trim();
        if let Some((scheme, rest)) = conn.split_once("://") {
            return scrub_uri(scheme, rest);
        }
        if conn.contains('=') {
            return scrub_dsn(conn);
        }
        Self::new(conn)
    }

    /// Attach a username recorded in entry metadata
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// The scrubbed identity string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.identity
    }

    /// Username found in the connection string, if any
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }
}

impl fmt::Display for DbIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity)
    }
}

fn is_secret(key: &str) -> bool {
    SECRET_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key.trim()))
}

fn is_user(key: &str) -> bool {
    USER_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key.trim()))
}

fn scrub_uri(scheme: &str, rest: &str) -> DbIdentity {
    // Passwords may carry unencoded `/`, so userinfo runs to the last `@`
    // before the query string. An empty authority has no userinfo.
    let query_start = rest.find(['?', '#']).unwrap_or(rest.len());
    let userinfo_end = rest[..query_start]
        .rfind('@')
        .filter(|_| !rest.starts_with('/'));
    let (mut username, located) = match userinfo_end {
        Some(at) => {
            let user = rest[..at].split(':').next().unwrap_or_default();
            ((!user.is_empty()).then(|| user.to_string()), &rest[at + 1..])
        }
        None => (None, rest),
    };
    let authority_end = located.find(['/', '?', '#']).unwrap_or(located.len());
    let (host, tail) = located.split_at(authority_end);

    let (path, query) = match tail.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (tail, None),
    };

    let mut identity = format!("{scheme}://{host}{path}");
    if let Some(query) = query {
        let (query, fragment) = match query.split_once('#') {
            Some((q, f)) => (q, Some(f)),
            None => (query, None),
        };
        let kept: Vec<&str> = query
            .split('&')
            .filter(|pair| {
                let key = pair.split('=').next().unwrap_or_default();
                if is_user(key) && username.is_none() {
                    username = pair.split_once('=').map(|(_, v)| v.to_string());
                }
                !pair.is_empty() && !is_secret(key)
            })
            .collect();
        if !kept.is_empty() {
            identity.push('?');
            identity.push_str(&kept.join("&"));
        }
        if let Some(fragment) = fragment {
            identity.push('#');
            identity.push_str(fragment);
        }
    }

    DbIdentity { identity, username }
}

fn scrub_dsn(conn: &str) -> DbIdentity {
    let separator = if conn.contains(';') { ";" } else { " " };
    let mut username = None;
    let kept: Vec<&str> = conn
        .split(separator)
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .filter(|&pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if is_user(key) && username.is_none() {
                username = Some(value.trim().to_string());
            }
            !is_secret(key)
        })
        .collect();

    DbIdentity {
        identity: kept.join(separator),
        username,
    }
}
