//! Include/exclude filter over module paths and kinds

use serde::{Deserialize, Serialize};

/// Restricts which submodules take part in a transformation
///
/// A name pattern matches a module path when it equals the path or one of
/// its ancestors: `layer1` matches `layer1.0.conv`. An empty include set
/// includes everything. Exclusion always wins over inclusion.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleFilter {
    /// Module paths to include
    pub include_names: Vec<String>,
    /// Module paths to exclude
    pub exclude_names: Vec<String>,
    /// Module kinds to include (`linear`, `conv2d`, ...)
    pub include_kinds: Vec<String>,
    /// Module kinds to exclude
    pub exclude_kinds: Vec<String>,
}

fn name_matches(pattern: &str, path: &str) -> bool {
    pattern.is_empty()
        || pattern == path
        || path
            .strip_prefix(pattern)
            .is_some_and(|rest| rest.starts_with('.'))
}

impl ModuleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include_names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.include_names.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn exclude_names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.exclude(names);
        self
    }

    pub fn include_kinds<S: Into<String>>(mut self, kinds: impl IntoIterator<Item = S>) -> Self {
        self.include_kinds.extend(kinds.into_iter().map(Into::into));
        self
    }

    pub fn exclude_kinds<S: Into<String>>(mut self, kinds: impl IntoIterator<Item = S>) -> Self {
        self.exclude_kinds.extend(kinds.into_iter().map(Into::into));
        self
    }

    /// Merge names into the exclusion set, keeping it duplicate free
    ///
    /// Returns how many names were new.
    pub fn exclude<S: Into<String>>(&mut self, names: impl IntoIterator<Item = S>) -> usize {
        let before = self.exclude_names.len();
        for name in names {
            let name = name.into();
            if !self.exclude_names.contains(&name) {
                self.exclude_names.push(name);
            }
        }
        self.exclude_names.len() - before
    }

    pub fn is_excluded(&self, path: &str, kind: &str) -> bool {
        self.exclude_names.iter().any(|p| name_matches(p, path))
            || self.exclude_kinds.iter().any(|k| k == kind)
    }

    /// Whether a module at `path` of `kind` participates
    pub fn matches(&self, path: &str, kind: &str) -> bool {
        if self.is_excluded(path, kind) {
            return false;
        }
        let name_ok = self.include_names.is_empty()
            || self.include_names.iter().any(|p| name_matches(p, path));
        let kind_ok = self.include_kinds.is_empty() || self.include_kinds.iter().any(|k| k == kind);
        name_ok && kind_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = ModuleFilter::new();
        assert!(filter.matches("a.b", "linear"));
        assert!(filter.matches("", "sequential"));
    }

    #[test]
    fn test_ancestor_patterns() {
        let filter = ModuleFilter::new().include_names(["layer1"]);
        assert!(filter.matches("layer1", "linear"));
        assert!(filter.matches("layer1.0.conv", "conv2d"));
        assert!(!filter.matches("layer10", "linear"));
        assert!(!filter.matches("layer2", "linear"));
    }

    #[test]
    fn test_exclusion_wins() {
        let filter = ModuleFilter::new()
            .include_names(["features"])
            .exclude_names(["features.conv"]);
        assert!(!filter.matches("features.conv", "conv2d"));
        assert!(filter.matches("features.fc", "linear"));
    }

    #[test]
    fn test_kind_filters() {
        let filter = ModuleFilter::new()
            .include_kinds(["linear", "conv2d"])
            .exclude_kinds(["conv2d"]);
        assert!(filter.matches("fc", "linear"));
        assert!(!filter.matches("conv", "conv2d"));
        assert!(!filter.matches("bn", "batchnorm2d"));
    }

    #[test]
    fn test_exclude_deduplicates() {
        let mut filter = ModuleFilter::new();
        assert_eq!(filter.exclude(["a", "b", "a"]), 2);
        assert_eq!(filter.exclude(["b", "c"]), 1);
        assert_eq!(filter.exclude_names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_yaml_defaults() {
        let filter: ModuleFilter = serde_yaml::from_str("exclude_names: [head]").unwrap();
        assert!(filter.include_names.is_empty());
        assert!(!filter.matches("head.fc", "linear"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_exclude_is_monotonic(
            first in proptest::collection::vec("[a-c]{1,2}", 0..6),
            second in proptest::collection::vec("[a-c]{1,2}", 0..6),
        ) {
            let mut filter = ModuleFilter::new().exclude_names(first.clone());
            let before = filter.exclude_names.clone();
            filter.exclude(second.clone());
            let after_once = filter.exclude_names.clone();
            filter.exclude(second);

            prop_assert!(before.iter().all(|n| after_once.contains(n)));
            prop_assert_eq!(&after_once, &filter.exclude_names);
        }
    }
}
