//! URL watch patterns
//!
//! Decides which intercepted traffic is in scope. Patterns come from the
//! `urls_to_watch` lists in configuration; a leading `!` marks an exclusion.
//! `*` wildcards are translated to `.*` at load time and anchored at both
//! ends, so matching at request time is a plain regex test.

use regex::Regex;

use super::error::{ProxyError, ProxyResult};

/// A single compiled watch pattern.
#[derive(Debug, Clone)]
pub struct WatchPattern {
    raw: String,
    exclude: bool,
    url_regex: Regex,
    host_regex: Regex,
}

impl WatchPattern {
    /// Parse a pattern spec. `!`-prefixed specs are exclusions.
    pub fn parse(spec: &str) -> ProxyResult<Self> {
        let (exclude, pattern) = match spec.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };

        if pattern.is_empty() {
            return Err(ProxyError::Configuration(
                "Empty URL watch pattern".to_string(),
            ));
        }

        let url_regex = compile_wildcard(pattern)?;
        let host_regex = compile_wildcard(host_part(pattern))?;

        Ok(Self {
            raw: pattern.to_string(),
            exclude,
            url_regex,
            host_regex,
        })
    }

    pub fn is_exclude(&self) -> bool {
        self.exclude
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    fn matches_url(&self, url: &str) -> bool {
        self.url_regex.is_match(url)
    }
}

/// Translate a `*`-wildcard pattern into an anchored regex.
///
/// Everything except `*` is matched literally.
pub(crate) fn compile_wildcard(pattern: &str) -> ProxyResult<Regex> {
    let mut translated = String::with_capacity(pattern.len() + 8);
    translated.push('^');
    for ch in pattern.chars() {
        if ch == '*' {
            translated.push_str(".*");
        } else {
            translated.push_str(&regex::escape(&ch.to_string()));
        }
    }
    translated.push('$');

    Regex::new(&translated)
        .map_err(|e| ProxyError::Configuration(format!("Invalid watch pattern '{pattern}': {e}")))
}

/// Extract the authority portion of a URL pattern: the text between the
/// scheme separator (if any) and the first following `/`, with any port
/// stripped. Used to decide which CONNECT hostnames get decrypted.
fn host_part(pattern: &str) -> &str {
    let after_scheme = match pattern.find("://") {
        Some(idx) => &pattern[idx + 3..],
        None => pattern,
    };
    let authority = after_scheme
        .split('/')
        .next()
        .unwrap_or(after_scheme);
    // Strip a trailing :port, but keep a port-position wildcard intact.
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !host.is_empty() => host,
        _ => authority,
    }
}

/// An ordered set of watch patterns with exclude-wins-first semantics.
#[derive(Debug, Clone, Default)]
pub struct WatchSet {
    patterns: Vec<WatchPattern>,
}

impl WatchSet {
    pub fn from_specs<S: AsRef<str>>(specs: &[S]) -> ProxyResult<Self> {
        let patterns = specs
            .iter()
            .map(|s| WatchPattern::parse(s.as_ref()))
            .collect::<ProxyResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether an absolute request URL is in scope.
    ///
    /// Patterns are consulted in declaration order; the first one that
    /// matches decides, and an exclusion deciding means out of scope.
    pub fn matches(&self, url: &str) -> bool {
        for pattern in &self.patterns {
            if pattern.matches_url(url) {
                return !pattern.exclude;
            }
        }
        false
    }

    /// Whether a CONNECT hostname should be TLS-terminated.
    ///
    /// Only non-exclude patterns count here: a path-level exclusion still
    /// requires decryption before it can be evaluated against full URLs.
    pub fn matches_host(&self, host: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| !p.exclude && p.host_regex.is_match(host))
    }
}
