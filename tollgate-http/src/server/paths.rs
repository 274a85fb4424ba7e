//! Path matching for capture exclusions.

use std::collections::HashSet;

/// A set of request paths.
///
/// Entries match exactly, except entries ending in `*`, which match any path
/// starting with the text before the `*`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathSet {
    exact: HashSet<String>,
    prefixes: Vec<String>,
}

impl PathSet {
    /// Builds a set from path patterns.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        patterns.into_iter().collect()
    }

    /// Returns `true` if `path` is matched by any pattern.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.exact.contains(path) || self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Returns `true` if the set has no patterns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }

    /// Adds one pattern.
    pub fn insert(&mut self, pattern: &str) {
        match pattern.strip_suffix('*') {
            Some(prefix) => self.prefixes.push(prefix.to_owned()),
            None => {
                self.exact.insert(pattern.to_owned());
            }
        }
    }
}

impl<S: AsRef<str>> FromIterator<S> for PathSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::default();
        for pattern in iter {
            set.insert(pattern.as_ref());
        }
        set
    }
}
