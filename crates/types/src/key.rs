//! Hierarchical, interned category keys
//!
//! A `CategoryKey` names one logical measurement, e.g. `environment.wind.speed`.
//! Every key lives in a process-wide intern pool: two keys with the same
//! segments and the same (or absent) source tag are the same allocation, so
//! equality and hashing are pointer operations and a key seen once stays
//! referentially stable for the rest of the process. The pool only grows.
//!
//! A segment may be the wildcard `*`. Wildcard matching is exposed through
//! [`CategoryKey::matches`] rather than `==`, because the relation is not
//! transitive once more than one operand carries a wildcard:
//!
//! ```text
//! wind.*.speed   ~ wind.gust.*        (every position compatible)
//! wind.gust.*    ~ wind.gust.direction
//! wind.*.speed   !~ wind.gust.direction
//! ```

use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// The wildcard segment
pub const WILDCARD: &str = "*";

/// Separator between segments in the dotted text form
pub const SEPARATOR: char = '.';

/// Error produced when parsing a key from text
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("malformed key '{text}': {reason}")]
    Malformed { text: String, reason: &'static str },
}

type PoolKey = (Box<[Arc<str>]>, Option<Arc<str>>);

struct KeyInner {
    segments: Box<[Arc<str>]>,
    source: Option<Arc<str>>,
    wildcard: bool,
}

/// Process-wide intern pool. Entries are never evicted.
static POOL: Lazy<RwLock<HashMap<PoolKey, CategoryKey>>> =
    Lazy::new(|| RwLock::new(HashMap::with_capacity(512)));

/// Interned hierarchical key, optionally tagged with a source identity
#[derive(Clone)]
pub struct CategoryKey(Arc<KeyInner>);

fn is_wildcard(segment: &str) -> bool {
    segment == WILDCARD
}

fn segments_match(a: &str, b: &str) -> bool {
    a == b || is_wildcard(a) || is_wildcard(b)
}

/// Fetch the pooled key for `segments`/`source`, inserting it on first sight.
///
/// The read lock covers the common case; the insert path re-checks under the
/// write lock through `entry`, so two racing constructors get the same key.
fn intern(segments: Vec<Arc<str>>, source: Option<Arc<str>>) -> CategoryKey {
    let pool_key: PoolKey = (segments.into_boxed_slice(), source);

    {
        let pool = POOL.read().unwrap_or_else(|e| e.into_inner());
        if let Some(key) = pool.get(&pool_key) {
            return key.clone();
        }
    }

    let mut pool = POOL.write().unwrap_or_else(|e| e.into_inner());
    pool.entry(pool_key)
        .or_insert_with_key(|(segments, source)| {
            log::trace!("Interning key {} (source: {:?})", segments.join("."), source);
            CategoryKey(Arc::new(KeyInner {
                wildcard: segments.iter().any(|s| is_wildcard(s)),
                segments: segments.clone(),
                source: source.clone(),
            }))
        })
        .clone()
}

/// Number of distinct keys in the intern pool
pub fn interned_count() -> usize {
    POOL.read().unwrap_or_else(|e| e.into_inner()).len()
}

impl CategoryKey {
    /// Parse a dotted key such as `environment.temperature.dewpoint`
    pub fn parse(text: &str) -> Result<Self, KeyError> {
        let malformed = |reason| KeyError::Malformed {
            text: text.to_string(),
            reason,
        };

        if text.is_empty() {
            return Err(malformed("empty key"));
        }

        let mut segments = Vec::with_capacity(4);
        for segment in text.split(SEPARATOR) {
            if segment.is_empty() {
                return Err(malformed("empty segment"));
            }
            if segment.contains('*') && !is_wildcard(segment) {
                return Err(malformed("wildcard must be a whole segment"));
            }
            segments.push(Arc::from(segment));
        }

        Ok(intern(segments, None))
    }

    /// The empty key, prefix of every other key
    pub fn root() -> Self {
        intern(Vec::new(), None)
    }

    /// Build a key from already-split segments
    pub fn from_segments<I, S>(segments: I) -> Result<Self, KeyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = segments
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(".");
        Self::parse(&joined)
    }

    /// Path segments, outermost first
    pub fn segments(&self) -> impl ExactSizeIterator<Item = &str> + '_ {
        self.0.segments.iter().map(|s| &**s)
    }

    /// Segment at `index`
    pub fn segment(&self, index: usize) -> Option<&str> {
        self.0.segments.get(index).map(|s| &**s)
    }

    pub fn len(&self) -> usize {
        self.0.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.segments.is_empty()
    }

    /// Last segment, e.g. `dewpoint` for `environment.temperature.dewpoint`
    pub fn name(&self) -> Option<&str> {
        self.0.segments.last().map(|s| &**s)
    }

    /// Source tag, if this key names one source's contribution
    pub fn source(&self) -> Option<&str> {
        self.0.source.as_deref()
    }

    /// True when at least one segment is `*`
    pub fn is_pattern(&self) -> bool {
        self.0.wildcard
    }

    pub fn is_concrete(&self) -> bool {
        !self.0.wildcard
    }

    /// Same segments, tagged with `source`
    pub fn with_source(&self, source: &str) -> Self {
        intern(self.0.segments.to_vec(), Some(Arc::from(source)))
    }

    /// Same segments, source tag removed
    pub fn without_source(&self) -> Self {
        if self.0.source.is_none() {
            return self.clone();
        }
        intern(self.0.segments.to_vec(), None)
    }

    /// Append a (possibly dotted) child path
    pub fn child(&self, name: &str) -> Result<Self, KeyError> {
        Ok(self.join(&Self::parse(name)?))
    }

    /// Concatenate `other` onto `self`.
    ///
    /// Trailing wildcard segments of the result are dropped. The source tag is
    /// taken from `self`, falling back to `other`.
    pub fn join(&self, other: &CategoryKey) -> Self {
        let mut segments: Vec<Arc<str>> = self
            .0
            .segments
            .iter()
            .chain(other.0.segments.iter())
            .cloned()
            .collect();
        while segments.last().is_some_and(|s| is_wildcard(s)) {
            segments.pop();
        }
        let source = self.0.source.clone().or_else(|| other.0.source.clone());
        intern(segments, source)
    }

    /// Plain concatenation, wildcards kept wherever they fall
    pub fn concat(&self, other: &CategoryKey) -> Self {
        let segments = self
            .0
            .segments
            .iter()
            .chain(other.0.segments.iter())
            .cloned()
            .collect();
        let source = self.0.source.clone().or_else(|| other.0.source.clone());
        intern(segments, source)
    }

    /// Positional common prefix of two keys under wildcard.
    ///
    /// Equal segments are kept; a wildcard facing a concrete segment yields the
    /// concrete one; the first real mismatch ends the prefix.
    pub fn intersect(&self, other: &CategoryKey) -> Self {
        let mut segments = Vec::new();
        for (a, b) in self.0.segments.iter().zip(other.0.segments.iter()) {
            if a == b {
                segments.push(a.clone());
            } else if is_wildcard(a) {
                segments.push(b.clone());
            } else if is_wildcard(b) {
                segments.push(a.clone());
            } else {
                break;
            }
        }
        let source = if self.0.source == other.0.source {
            self.0.source.clone()
        } else {
            None
        };
        intern(segments, source)
    }

    /// Remainder of `self` after the leading segments it shares with `other`
    pub fn difference(&self, other: &CategoryKey) -> Self {
        let shared = self
            .0
            .segments
            .iter()
            .zip(other.0.segments.iter())
            .take_while(|(a, b)| segments_match(a, b))
            .count();
        self.suffix(shared)
    }

    /// Wildcard-aware equality: same length and every position compatible
    pub fn matches(&self, other: &CategoryKey) -> bool {
        if self == other {
            return true;
        }
        self.len() == other.len()
            && self
                .0
                .segments
                .iter()
                .zip(other.0.segments.iter())
                .all(|(a, b)| segments_match(a, b))
    }

    /// Wildcard-aware prefix test
    pub fn starts_with(&self, prefix: &CategoryKey) -> bool {
        prefix.len() <= self.len()
            && prefix
                .0
                .segments
                .iter()
                .zip(self.0.segments.iter())
                .all(|(a, b)| segments_match(a, b))
    }

    /// First `n` segments (all of them if `n` exceeds the length)
    pub fn prefix(&self, n: usize) -> Self {
        let n = n.min(self.len());
        intern(self.0.segments[..n].to_vec(), self.0.source.clone())
    }

    /// Segments from index `n` onwards
    pub fn suffix(&self, n: usize) -> Self {
        let n = n.min(self.len());
        intern(self.0.segments[n..].to_vec(), self.0.source.clone())
    }

    /// Key with the last segment removed, `None` for the root
    pub fn parent(&self) -> Option<Self> {
        if self.is_empty() {
            None
        } else {
            Some(self.prefix(self.len() - 1))
        }
    }

    /// Every non-empty prefix, shortest first, ending with `self`
    pub fn prefixes(&self) -> impl Iterator<Item = CategoryKey> + '_ {
        (1..=self.len()).map(move |n| self.prefix(n))
    }

    /// Replace the last segment
    pub fn sibling(&self, name: &str) -> Result<Self, KeyError> {
        match self.parent() {
            Some(parent) => parent.child(name),
            None => Self::parse(name),
        }
    }

    /// Dotted text form
    pub fn dotted(&self) -> String {
        self.segments().collect::<Vec<_>>().join(".")
    }
}

impl PartialEq for CategoryKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for CategoryKey {}

impl Hash for CategoryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl Ord for CategoryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        if self == other {
            return Ordering::Equal;
        }
        self.0
            .segments
            .cmp(&other.0.segments)
            .then_with(|| self.0.source.cmp(&other.0.source))
    }
}

impl PartialOrd for CategoryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CategoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dotted())
    }
}

impl fmt::Debug for CategoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source() {
            Some(source) => write!(f, "CategoryKey({}@{})", self.dotted(), source),
            None => write!(f, "CategoryKey({})", self.dotted()),
        }
    }
}

impl FromStr for CategoryKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for CategoryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.dotted())
    }
}

impl<'de> Deserialize<'de> for CategoryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> CategoryKey {
        CategoryKey::parse(s).unwrap()
    }

    #[test]
    fn test_interning_is_identity() {
        let a = key("environment.wind.speed");
        let b = key("environment.wind.speed");
        assert!(Arc::ptr_eq(&a.0, &b.0));
        assert_eq!(a, b);
        assert_ne!(a, key("environment.wind.gust"));
    }

    #[test]
    fn test_source_tag_is_part_of_identity() {
        let plain = key("environment.temperature.temperature");
        let tagged = plain.with_source("tempest");
        assert_ne!(plain, tagged);
        assert_eq!(tagged, plain.with_source("tempest"));
        assert_eq!(tagged.without_source(), plain);
        assert_eq!(tagged.source(), Some("tempest"));
    }

    #[test]
    fn test_malformed_keys() {
        for bad in ["", "a..b", ".a", "a.", "a.b*.c"] {
            assert!(
                matches!(CategoryKey::parse(bad), Err(KeyError::Malformed { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_display_round_trip() {
        for text in ["environment", "environment.wind.speed", "a.b.c.d.e"] {
            let k = key(text);
            assert_eq!(k.to_string(), text);
            assert_eq!(key(&k.to_string()), k);
        }
    }

    #[test]
    fn test_join_drops_trailing_wildcards() {
        let joined = key("environment.wind").join(&key("speed.*.*"));
        assert_eq!(joined, key("environment.wind.speed"));

        let inner = key("environment.*").join(&key("speed"));
        assert_eq!(inner, key("environment.*.speed"));

        let kept = key("environment").concat(&key("*"));
        assert_eq!(kept, key("environment.*"));
    }

    #[test]
    fn test_intersect() {
        let shared = key("environment.temperature.dewpoint")
            .intersect(&key("environment.temperature.temperature"));
        assert_eq!(shared, key("environment.temperature"));

        let wild = key("wind.*.speed").intersect(&key("wind.gust.speed"));
        assert_eq!(wild, key("wind.gust.speed"));

        assert!(key("a.b").intersect(&key("c.d")).is_empty());
    }

    #[test]
    fn test_difference() {
        let rest = key("environment.wind.speed").difference(&key("environment.wind"));
        assert_eq!(rest, key("speed"));

        let wild = key("environment.wind.gust.speed").difference(&key("environment.*"));
        assert_eq!(wild, key("gust.speed"));
    }

    #[test]
    fn test_matches_is_symmetric() {
        let pattern = key("wind.*.speed");
        let concrete = key("wind.gust.speed");
        assert!(pattern.matches(&concrete));
        assert!(concrete.matches(&pattern));
        assert!(!pattern.matches(&key("wind.gust")));
        assert!(!pattern.matches(&key("wind.gust.direction")));
    }

    #[test]
    fn test_wildcard_relation_is_not_transitive() {
        // The three keys are pairwise compatible but remain distinct objects:
        // compatibility under wildcard is not structural equality.
        let x = key("wind.*.speed");
        let y = key("wind.gust.speed");
        let z = key("wind.gust.*");
        assert!(x.matches(&y));
        assert!(y.matches(&z));
        assert_ne!(x, z);
        assert_ne!(x, y);

        // A chain through a pattern links two keys that do not match each other.
        let a = key("wind.*.speed");
        let b = key("wind.gust.*");
        let c = key("wind.gust.direction");
        assert!(a.matches(&b));
        assert!(b.matches(&c));
        assert!(!a.matches(&c));
    }

    #[test]
    fn test_prefixes_shortest_first() {
        let k = key("a.b.c");
        let prefixes: Vec<String> = k.prefixes().map(|p| p.to_string()).collect();
        assert_eq!(prefixes, vec!["a", "a.b", "a.b.c"]);
        assert_eq!(k.parent(), Some(key("a.b")));
        assert_eq!(CategoryKey::root().parent(), None);
        assert_eq!(k.name(), Some("c"));
    }

    #[test]
    fn test_starts_with_wildcard() {
        let k = key("environment.wind.speed");
        assert!(k.starts_with(&key("environment")));
        assert!(k.starts_with(&key("*.wind")));
        assert!(k.starts_with(&CategoryKey::root()));
        assert!(!k.starts_with(&key("environment.temperature")));
    }

    #[test]
    fn test_concurrent_interning_returns_one_key() {
        let keys: Vec<CategoryKey> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| key("concurrent.intern.check")))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_serde_as_string() {
        let k = key("environment.pressure.absolute");
        let json = serde_json::to_string(&k).unwrap();
        assert_eq!(json, "\"environment.pressure.absolute\"");
        let back: CategoryKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, k);
    }
}
