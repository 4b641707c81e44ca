//! Cache key derivation
//!
//! A key is the SHA-256 of a versioned, length-framed encoding of:
//!
//! 1. the domain tag `sqlcache-key/v1`
//! 2. the database identity (credentials already scrubbed)
//! 3. a mode byte: `N` for normalized text, `R` for the raw-text fallback
//! 4. the query text
//! 5. the parameter count, then each parameter as a type tag plus payload,
//!    in the order supplied
//!
//! Every variable-length field is prefixed with its `u64` little-endian
//! length, so no two distinct inputs share an encoding. Changing any part of
//! this layout changes every key and must bump the domain tag.
//!
//! # Normalization
//!
//! Normalization only removes differences that cannot change a result set:
//! each run of whitespace and comments becomes one space, leading and
//! trailing space and trailing `;` are dropped, space around `,` is dropped,
//! and reserved keywords are lowercased. A reserved word keeps its spelling
//! where it names something: after `AS`, or beside a `.` qualifier.
//! Identifiers, literals, quoted names, MySQL executable comments
//! (`/*! ... */`) and optimizer hints (`/*+ ... */`) are copied verbatim, and
//! tokens that touched in the input still touch in the output.
//!
//! The raw text is hashed instead when it cannot be tokenized (an unterminated
//! literal or comment), or when a literal contains a backslash: dialects
//! disagree on whether `\'` closes a string, so its extent is unknown.

use crate::table::Value;
use crate::{Error, Result};
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error as ThisError;

const DOMAIN: &[u8] = b"sqlcache-key/v1";

/// Reserved words whose case is insignificant in every mainstream dialect.
///
/// Non-reserved words (`first`, `rows`, `limit`, `window`, ...) are absent:
/// they are valid column aliases, and an alias's spelling becomes the
/// result's column name.
const KEYWORDS: &[&str] = &[
    "all", "and", "any", "as", "asc", "between", "by", "case", "cast", "cross", "desc",
    "distinct", "else", "end", "except", "exists", "false", "from", "full", "group", "having",
    "in", "inner", "intersect", "is", "join", "left", "like", "natural", "not", "null", "on",
    "or", "order", "outer", "right", "select", "some", "then", "true", "union", "using", "when",
    "where", "with",
];

/// Functions whose result changes between executions
const VOLATILE_FUNCTIONS: &[&str] = &[
    "current_date",
    "current_time",
    "current_timestamp",
    "gen_random_uuid",
    "getdate",
    "getutcdate",
    "localtime",
    "localtimestamp",
    "newid",
    "now",
    "rand",
    "random",
    "sysdate",
    "sysdatetime",
    "systimestamp",
    "tablesample",
    "uuid",
];

/// A fixed-length cache key: 64 lowercase hex characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey(String);

impl CacheKey {
    /// Parse a key from its textual form
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] unless the input is 64 lowercase hex digits.
    pub fn from_hex(hex: impl Into<String>) -> Result<Self> {
        let s = hex.into();
        if s.len() != 64 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(Error::InvalidKey { value: s });
        }
        Ok(Self(s))
    }

    /// Get the hex representation
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(value)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

impl std::str::FromStr for CacheKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Why a query could not be normalized
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum NormalizeError {
    /// A quoted literal or identifier never closes
    #[error("unterminated quoted text starting at byte {0}")]
    UnterminatedQuote(usize),
    /// A block comment never closes
    #[error("unterminated block comment starting at byte {0}")]
    UnterminatedComment(usize),
    /// A literal contains a backslash, so where it ends depends on the dialect
    #[error("backslash in quoted text starting at byte {0}")]
    BackslashInLiteral(usize),
}

/// How the text entered the key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Canonicalized text was hashed
    Normalized,
    /// Tokenizing failed; the raw text was hashed
    Raw,
}

/// A derived key with its derivation details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKey {
    /// The key
    pub key: CacheKey,
    /// Which text was hashed
    pub normalization: Normalization,
    /// Whether the query calls a function with per-execution results
    pub volatile: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Word,
    Quoted,
    Hint,
    Symbol,
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    kind: TokenKind,
    text: &'a str,
    start: usize,
    spaced: bool,
}

fn is_word_start(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '@' | '#')
}

fn is_word_char(c: char) -> bool {
    is_word_start(c) || c == '$'
}

/// Length of a `$tag$` opener at the start of `s`, if there is one
fn dollar_tag_len(s: &str) -> Option<usize> {
    let rest = s.strip_prefix('$')?;
    let end = rest.find('$')?;
    let tag = &rest[..end];
    let valid = tag.chars().all(|c| c.is_alphanumeric() || c == '_')
        && !tag.starts_with(|c: char| c.is_ascii_digit());
    valid.then_some(end + 2)
}

/// End (exclusive) of a quoted run opened at `start` by `open`, closed by
/// `close`; a doubled closer is an escaped closer.
fn quoted_end(sql: &str, start: usize, close: char) -> Option<usize> {
    let mut chars = sql[start + 1..].char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == close {
            if close != ']' && chars.peek().is_some_and(|&(_, n)| n == close) {
                chars.next();
                continue;
            }
            return Some(start + 1 + i + c.len_utf8());
        }
    }
    None
}

fn tokenize(sql: &str) -> std::result::Result<Vec<Token<'_>>, NormalizeError> {
    let mut tokens = Vec::new();
    let mut spaced = false;
    let mut i = 0;

    while let Some(c) = sql[i..].chars().next() {
        let rest = &sql[i..];
        let (kind, len) = if c.is_whitespace() {
            spaced = true;
            i += c.len_utf8();
            continue;
        } else if rest.starts_with("--") {
            spaced = true;
            i += rest.find('\n').map_or(rest.len(), |n| n + 1);
            continue;
        } else if rest.starts_with("/*") {
            let end = rest[2..]
                .find("*/")
                .map(|n| n + 4)
                .ok_or(NormalizeError::UnterminatedComment(i))?;
            if rest.starts_with("/*!") || rest.starts_with("/*+") {
                (TokenKind::Hint, end)
            } else {
                spaced = true;
                i += end;
                continue;
            }
        } else if matches!(c, '\'' | '"' | '`' | '[') {
            let close = if c == '[' { ']' } else { c };
            let end = quoted_end(sql, i, close).ok_or(NormalizeError::UnterminatedQuote(i))?;
            (TokenKind::Quoted, end - i)
        } else if let Some(tag_len) = dollar_tag_len(rest) {
            let tag = &rest[..tag_len];
            let body = rest[tag_len..]
                .find(tag)
                .ok_or(NormalizeError::UnterminatedQuote(i))?;
            (TokenKind::Quoted, tag_len + body + tag_len)
        } else if is_word_char(c) {
            let len = rest
                .char_indices()
                .find(|&(_, ch)| !is_word_char(ch))
                .map_or(rest.len(), |(n, _)| n);
            (TokenKind::Word, len)
        } else {
            (TokenKind::Symbol, c.len_utf8())
        };

        tokens.push(Token {
            kind,
            text: &rest[..len],
            start: i,
            spaced,
        });
        spaced = false;
        i += len;
    }

    Ok(tokens)
}

fn is_keyword(word: &str) -> bool {
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
}

/// Whether the word at `i` is used as a name rather than as a keyword
fn names_something(tokens: &[Token<'_>], i: usize) -> bool {
    let prev = i.checked_sub(1).and_then(|p| tokens.get(p));
    let next = tokens.get(i + 1);
    let after_as = |p: &Token<'_>| p.kind == TokenKind::Word && p.text.eq_ignore_ascii_case("as");
    prev.is_some_and(|p| p.text == "." || after_as(p))
        || next.is_some_and(|n| n.text == "." && !n.spaced)
}

/// Canonicalize a SQL statement for hashing
///
/// # Errors
///
/// Returns a [`NormalizeError`] when the text cannot be tokenized.
pub fn normalize(sql: &str) -> std::result::Result<String, NormalizeError> {
    let mut tokens = tokenize(sql)?;
    if let Some(t) = tokens.iter().find(|t| {
        t.kind == TokenKind::Quoted && t.text.starts_with(['\'', '"']) && t.text.contains('\\')
    }) {
        return Err(NormalizeError::BackslashInLiteral(t.start));
    }
    while tokens
        .last()
        .is_some_and(|t| t.kind == TokenKind::Symbol && t.text == ";")
    {
        tokens.pop();
    }

    let mut out = String::with_capacity(sql.len());
    let mut prev: Option<&Token<'_>> = None;
    for (i, token) in tokens.iter().enumerate() {
        let comma_adjacent = token.text == "," || prev.is_some_and(|p| p.text == ",");
        if token.spaced && prev.is_some() && !comma_adjacent {
            out.push(' ');
        }
        if token.kind == TokenKind::Word && is_keyword(token.text) && !names_something(&tokens, i)
        {
            out.push_str(&token.text.to_ascii_lowercase());
        } else {
            out.push_str(token.text);
        }
        prev = Some(token);
    }
    Ok(out)
}

/// True when the statement calls a function whose value changes per execution
///
/// Words inside literals and comments are ignored. Untokenizable text is
/// reported as volatile.
#[must_use]
pub fn is_volatile(sql: &str) -> bool {
    tokenize(sql).map_or(true, |tokens| {
        tokens.iter().any(|t| {
            t.kind == TokenKind::Word
                && VOLATILE_FUNCTIONS
                    .iter()
                    .any(|f| f.eq_ignore_ascii_case(t.text))
        })
    })
}

fn frame(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn hash_param(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([0x00]),
        Value::Boolean(b) => hasher.update([0x01, u8::from(*b)]),
        Value::Int8(v) => {
            hasher.update([0x02]);
            hasher.update(v.to_le_bytes());
        }
        Value::Int16(v) => {
            hasher.update([0x03]);
            hasher.update(v.to_le_bytes());
        }
        Value::Int32(v) => {
            hasher.update([0x04]);
            hasher.update(v.to_le_bytes());
        }
        Value::Int64(v) => {
            hasher.update([0x05]);
            hasher.update(v.to_le_bytes());
        }
        Value::Float32(v) => {
            hasher.update([0x06]);
            hasher.update(v.to_bits().to_le_bytes());
        }
        Value::Float64(v) => {
            hasher.update([0x07]);
            hasher.update(v.to_bits().to_le_bytes());
        }
        Value::Text(s) => {
            hasher.update([0x08]);
            frame(hasher, s.as_bytes());
        }
        Value::Binary(b) => {
            hasher.update([0x0A]);
            frame(hasher, b);
        }
        Value::Date(d) => {
            hasher.update([0x0B]);
            hasher.update(d.num_days_from_ce().to_le_bytes());
        }
        Value::Timestamp(ts) => {
            hasher.update([0x0C]);
            hasher.update(ts.timestamp().to_le_bytes());
            hasher.update(ts.timestamp_subsec_nanos().to_le_bytes());
            hasher.update(ts.offset().local_minus_utc().to_le_bytes());
        }
    }
}

/// Derive a key and report how it was derived
#[must_use]
pub fn derive_key(query_text: &str, params: &[Value], db_identity: &str) -> DerivedKey {
    let (text, normalization) = match normalize(query_text) {
        Ok(normalized) => (normalized, Normalization::Normalized),
        Err(e) => {
            tracing::debug!(error = %e, "Query normalization failed; hashing raw text");
            (query_text.to_string(), Normalization::Raw)
        }
    };

    let mut hasher = Sha256::new();
    hasher.update(DOMAIN);
    frame(&mut hasher, db_identity.as_bytes());
    hasher.update(match normalization {
        Normalization::Normalized => b"N",
        Normalization::Raw => b"R",
    });
    frame(&mut hasher, text.as_bytes());
    hasher.update((params.len() as u64).to_le_bytes());
    for param in params {
        hash_param(&mut hasher, param);
    }

    DerivedKey {
        key: CacheKey(hex::encode(hasher.finalize())),
        normalization,
        volatile: is_volatile(query_text),
    }
}

/// Derive the cache key for a query, its ordered parameters and target database
#[must_use]
pub fn derive(query_text: &str, params: &[Value], db_identity: &str) -> CacheKey {
    derive_key(query_text, params, db_identity).key
}

#[cfg(test)]
mod tests {
    use super::*;

    const DB: &str = "postgresql://warehouse:5432/analytics";

    #[test]
    fn key_is_64_hex_chars() {
        let key = derive("SELECT 1", &[], DB);
        assert_eq!(key.as_hex().len(), 64);
        assert!(CacheKey::from_hex(key.as_hex()).is_ok());
    }

    #[test]
    fn whitespace_and_keyword_case_are_ignored() {
        assert_eq!(derive("SELECT 1", &[], DB), derive("select   1  ", &[], DB));
        assert_eq!(
            derive("SELECT a, b FROM t WHERE x = 1", &[], DB),
            derive("select a,b\n  from t\twhere x = 1;", &[], DB)
        );
    }

    #[test]
    fn comments_are_collapsed() {
        assert_eq!(
            derive("SELECT 1 -- trailing note", &[], DB),
            derive("SELECT /* inline */ 1", &[], DB)
        );
    }

    #[test]
    fn normalize_output() {
        assert_eq!(
            normalize("  SELECT id ,  Name\nFROM   Users u -- c\n WHERE u.Id = ? ; ").unwrap(),
            "select id,Name from Users u where u.Id = ?"
        );
    }

    #[test]
    fn literals_and_identifiers_are_preserved() {
        assert_ne!(
            derive("SELECT 'A  b'", &[], DB),
            derive("SELECT 'a b'", &[], DB)
        );
        assert_ne!(
            derive("SELECT * FROM \"Orders\"", &[], DB),
            derive("SELECT * FROM \"orders\"", &[], DB)
        );
        assert_ne!(
            derive("SELECT * FROM Orders", &[], DB),
            derive("SELECT * FROM orders", &[], DB)
        );
        assert_eq!(
            normalize("SELECT 'it''s  -- not a comment'").unwrap(),
            "select 'it''s  -- not a comment'"
        );
    }

    #[test]
    fn adjacency_is_preserved() {
        // N'x' is a national literal, N 'x' is a column aliased 'x'
        assert_ne!(normalize("SELECT N'x'"), normalize("SELECT N 'x'"));
        assert_ne!(normalize("SELECT a-1"), normalize("SELECT a - - 1"));
    }

    #[test]
    fn hints_are_kept() {
        assert_ne!(
            derive("SELECT /*+ INDEX(t idx) */ * FROM t", &[], DB),
            derive("SELECT * FROM t", &[], DB)
        );
        assert_eq!(
            normalize("SELECT /*!40001 SQL_NO_CACHE */ 1").unwrap(),
            "select /*!40001 SQL_NO_CACHE */ 1"
        );
    }

    #[test]
    fn dollar_quotes_and_positional_params() {
        assert_eq!(
            normalize("SELECT $body$ keep   THIS $body$, $1").unwrap(),
            "select $body$ keep   THIS $body$,$1"
        );
        assert!(normalize("SELECT $tag$ never closed").is_err());
    }

    #[test]
    fn aliases_keep_their_spelling() {
        assert_ne!(
            derive("SELECT x AS First FROM t", &[], DB),
            derive("SELECT x AS first FROM t", &[], DB)
        );
        assert_ne!(
            derive("SELECT x Rows FROM t", &[], DB),
            derive("SELECT x rows FROM t", &[], DB)
        );
        assert_eq!(
            normalize("SELECT x AS Left, t.Order FROM t").unwrap(),
            "select x as Left,t.Order from t"
        );
    }

    #[test]
    fn backslash_in_literal_hashes_raw_text() {
        let spread = derive_key("SELECT 'a\\'  x  \\''", &[], DB);
        let tight = derive_key("SELECT 'a\\' x \\''", &[], DB);
        assert_eq!(spread.normalization, Normalization::Raw);
        assert_ne!(spread.key, tight.key);
        assert_eq!(
            normalize("SELECT 'C:\\tmp'"),
            Err(NormalizeError::BackslashInLiteral(7))
        );
        // backslashes outside literals are not special
        assert!(normalize("SELECT a FROM [dom\\user]").is_ok());
    }

    #[test]
    fn unterminated_text_falls_back_to_raw() {
        let derived = derive_key("SELECT 'oops", &[], DB);
        assert_eq!(derived.normalization, Normalization::Raw);
        // raw mode hashes exactly what was given
        assert_ne!(derived.key, derive("SELECT  'oops", &[], DB));
        assert_eq!(derived.key, derive("SELECT 'oops", &[], DB));

        assert!(matches!(
            normalize("SELECT /* open"),
            Err(NormalizeError::UnterminatedComment(7))
        ));
    }

    #[test]
    fn raw_and_normalized_modes_never_collide() {
        // "select 'x" cannot normalize; its raw text equals a string that
        // could be someone's normalized text, yet the mode byte separates them
        let raw = derive_key("select 'x", &[], DB);
        assert_eq!(raw.normalization, Normalization::Raw);
        let mut hasher = Sha256::new();
        hasher.update(DOMAIN);
        frame(&mut hasher, DB.as_bytes());
        hasher.update(b"N");
        frame(&mut hasher, b"select 'x");
        hasher.update(0u64.to_le_bytes());
        assert_ne!(raw.key.as_hex(), hex::encode(hasher.finalize()));
    }

    #[test]
    fn params_are_ordered_and_typed() {
        let a = derive("SELECT ?, ?", &[Value::Int64(1), Value::Int64(2)], DB);
        let b = derive("SELECT ?, ?", &[Value::Int64(2), Value::Int64(1)], DB);
        assert_ne!(a, b);

        let int = derive("SELECT ?", &[Value::Int64(1)], DB);
        let text = derive("SELECT ?", &[Value::from("1")], DB);
        assert_ne!(int, text);

        let null = derive("SELECT ?", &[Value::Null], DB);
        let nan = derive("SELECT ?", &[Value::Float64(f64::NAN)], DB);
        assert_ne!(null, nan);
    }

    #[test]
    fn param_framing_prevents_shifting() {
        let a = derive("SELECT ?, ?", &[Value::from("ab"), Value::from("c")], DB);
        let b = derive("SELECT ?, ?", &[Value::from("a"), Value::from("bc")], DB);
        assert_ne!(a, b);
    }

    #[test]
    fn database_identity_separates_keys() {
        assert_ne!(
            derive("SELECT 1", &[], DB),
            derive("SELECT 1", &[], "postgresql://replica:5432/analytics")
        );
    }

    #[test]
    fn key_is_stable_across_versions() {
        // Pinned: a change here invalidates every existing cache on disk.
        let key = derive("SELECT 1", &[], "sqlite:///tmp/x.db");
        let again = derive("select 1", &[], "sqlite:///tmp/x.db");
        assert_eq!(key, again);

        let mut hasher = Sha256::new();
        hasher.update(b"sqlcache-key/v1");
        hasher.update(18u64.to_le_bytes());
        hasher.update(b"sqlite:///tmp/x.db");
        hasher.update(b"N");
        hasher.update(8u64.to_le_bytes());
        hasher.update(b"select 1");
        hasher.update(0u64.to_le_bytes());
        assert_eq!(key.as_hex(), hex::encode(hasher.finalize()));
    }

    #[test]
    fn volatile_detection_ignores_literals() {
        assert!(is_volatile("SELECT NOW()"));
        assert!(is_volatile("select * from t tablesample system (10)"));
        assert!(!is_volatile("SELECT 'now' AS label"));
        assert!(!is_volatile("SELECT 1 -- random note"));
        assert!(derive_key("SELECT random()", &[], DB).volatile);
    }

    #[test]
    fn cache_key_validation() {
        assert!(CacheKey::from_hex("abc").is_err());
        assert!(CacheKey::from_hex("A".repeat(64)).is_err());
        assert!(CacheKey::from_hex("0".repeat(64)).is_ok());
        let key: CacheKey = serde_json::from_str(&format!("\"{}\"", "f".repeat(64))).unwrap();
        assert_eq!(key.short(), "ffffffffffff");
        assert!(serde_json::from_str::<CacheKey>("\"nope\"").is_err());
    }
}
