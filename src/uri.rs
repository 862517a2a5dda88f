//! # URI pattern matching
//!
//! Channels and resources are addressed through a small URI-template
//! dialect: `scheme://authority/path/segments`, where any `host` or `path`
//! segment may be the wildcard `*` (matches exactly one segment) and a
//! trailing `**` or empty segment matches any suffix of remaining segments.
//!
//! This is deliberately not a general-purpose URI parser — wildcards are not
//! valid URI syntax, so `url::Url` can't parse patterns directly. Plain
//! event/subscription URIs (`destination_uri`, `recipients`, origins) *are*
//! well-formed and are kept as [`url::Url`] elsewhere; this module only
//! handles the pattern dialect.

use percent_encoding::{percent_encode, AsciiSet, CONTROLS};
use std::fmt;

/// https://url.spec.whatwg.org/#path-percent-encode-set, narrowed to what a
/// `location` string needs to become a filesystem-safe directory name.
const LOCATION_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'\\')
    .add(b':');

/// Percent-encode an opaque `location` string so it is safe to use as a
/// single path segment (directory name, descriptor file stem).
pub fn encode_location(location: &str) -> String {
    percent_encode(location.as_bytes(), LOCATION_SET).to_string()
}

/// A parsed `scheme://authority/path` URI pattern.
///
/// Equality/hashing are based on the original pattern string, so two
/// differently-spelled-but-equivalent patterns are treated as distinct index
/// keys (matching the source's segment-by-segment comparison rather than a
/// normalized form).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UriPattern {
    raw: String,
    scheme: String,
    authority_segments: Vec<String>,
    path_segments: Vec<String>,
    /// Whether the last path segment was `**` or empty, meaning "matches any
    /// suffix of remaining segments" rather than exactly one segment.
    open_suffix: bool,
}

/// The universal resource pattern used to index subscriptions that declared
/// no `resource`, so they match every resource query.
pub const UNIVERSAL_RESOURCE_PATTERN: &str = "x://*/*";

impl UriPattern {
    /// Parse a pattern string of the form `scheme://authority/seg/seg`.
    ///
    /// Parsing never fails: any input that doesn't contain `://` is treated
    /// as a single opaque authority segment with an empty path, so callers
    /// never have to special-case malformed patterns from untrusted
    /// documents — they will simply fail to match anything useful.
    pub fn parse(pattern: &str) -> Self {
        let (scheme, rest) = match pattern.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => (String::new(), pattern),
        };

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (rest, ""),
        };

        let authority_segments = split_segments(authority, true);

        let mut open_suffix = false;
        let mut path_segments: Vec<String> = if path.is_empty() {
            Vec::new()
        } else {
            split_segments(path, false)
        };

        if let Some(last) = path_segments.last() {
            if last == "**" || last.is_empty() {
                open_suffix = true;
                path_segments.pop();
            }
        }

        Self {
            raw: pattern.to_string(),
            scheme,
            authority_segments,
            path_segments,
            open_suffix,
        }
    }

    /// The original pattern string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Scheme of this pattern, lower-cased.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Whether this pattern matches the given concrete URI.
    ///
    /// Matching is case-insensitive on scheme/authority and case-sensitive
    /// on path segments, per the contract in the component design.
    pub fn matches(&self, uri: &str) -> bool {
        let candidate = UriPattern::parse_candidate(uri);

        if self.scheme != candidate.scheme {
            return false;
        }

        if !segments_match(&self.authority_segments, &candidate.authority_segments, false) {
            return false;
        }

        segments_match(&self.path_segments, &candidate.path_segments, self.open_suffix)
    }

    /// Parse a concrete URI the same way, without suffix semantics (a
    /// concrete URI has no wildcards to interpret).
    fn parse_candidate(uri: &str) -> Self {
        let (scheme, rest) = match uri.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => (String::new(), uri),
        };
        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (rest, ""),
        };
        Self {
            raw: uri.to_string(),
            scheme,
            authority_segments: split_segments(authority, true),
            path_segments: if path.is_empty() {
                Vec::new()
            } else {
                split_segments(path, false)
            },
            open_suffix: false,
        }
    }
}

impl fmt::Display for UriPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

fn split_segments(part: &str, lowercase: bool) -> Vec<String> {
    if part.is_empty() {
        return Vec::new();
    }
    part.split('/')
        .map(|seg| if lowercase { seg.to_ascii_lowercase() } else { seg.to_string() })
        .collect()
}

/// Segment-by-segment comparison: each pattern segment must equal the
/// candidate segment or be the wildcard `*`. When `open_suffix` is set, a
/// pattern with fewer segments than the candidate still matches (the
/// trailing `**`/empty segment absorbs the rest); otherwise segment counts
/// must match exactly.
fn segments_match(pattern: &[String], candidate: &[String], open_suffix: bool) -> bool {
    if !open_suffix && pattern.len() != candidate.len() {
        return false;
    }
    if open_suffix && pattern.len() > candidate.len() {
        return false;
    }

    pattern
        .iter()
        .zip(candidate.iter())
        .all(|(p, c)| p == "*" || p == c)
}
