use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Query parameters dropped on top of the `utm_*` prefix
pub const DEFAULT_TRACKING_PARAMS: &[&str] = &[
    "ref", "referrer", "session", "fbclid", "gclid", "yclid", "mc_cid", "mc_eid",
];

/// Normalized URL string; the only identity used for dedup and caching
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalUrl(String);

impl CanonicalUrl {
    /// Wrap a string that was produced by a canonicalizer earlier
    pub(crate) fn from_trusted(canonical: String) -> Self {
        Self(canonical)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Turns URLs into stable cache/dedup keys
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    tracking_params: HashSet<String>,
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self {
            tracking_params: DEFAULT_TRACKING_PARAMS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl Canonicalizer {
    /// Default tracking list extended with operator-supplied names
    pub fn with_extra_params<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut canonicalizer = Self::default();
        for param in extra {
            let param = param.as_ref().trim().to_lowercase();
            if !param.is_empty() {
                canonicalizer.tracking_params.insert(param);
            }
        }
        canonicalizer
    }

    fn is_tracking_param(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        name.starts_with("utm_") || self.tracking_params.contains(&name)
    }

    /// Canonicalize an already parsed URL.
    ///
    /// Scheme and host come out lower-cased (and default ports dropped) from
    /// the parser itself. On top of that the fragment goes away, tracking
    /// parameters are removed, the remaining ones are sorted, and one
    /// trailing slash is trimmed from any path other than `/`.
    pub fn canonicalize(&self, url: &Url) -> CanonicalUrl {
        let mut normalized = url.clone();
        normalized.set_fragment(None);

        let mut params: Vec<(String, String)> = normalized
            .query_pairs()
            .filter(|(key, _)| !self.is_tracking_param(key))
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        params.sort();

        if params.is_empty() {
            normalized.set_query(None);
        } else {
            normalized.query_pairs_mut().clear().extend_pairs(params.iter());
        }

        let path = normalized.path();
        if path.len() > 1 && path.ends_with('/') {
            let trimmed = path[..path.len() - 1].to_string();
            normalized.set_path(&trimmed);
        }

        CanonicalUrl(normalized.to_string())
    }

    /// Parse and canonicalize a raw URL string
    pub fn canonicalize_str(&self, raw: &str) -> Result<CanonicalUrl, url::ParseError> {
        Url::parse(raw).map(|url| self.canonicalize(&url))
    }
}
