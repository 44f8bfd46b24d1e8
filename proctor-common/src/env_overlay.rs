//! Child process environment derivation.
//!
//! The child environment is the base environment with scenario-supplied
//! overrides applied in order. Repeated names resolve to their last row.

use std::collections::BTreeMap;

/// Resolved environment handed to a child process.
pub type EnvMap = BTreeMap<String, String>;

/// Overlays override rows onto a base environment.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentBuilder {
    base: EnvMap,
    excluded_fragments: Vec<String>,
    overrides: Vec<(String, String)>,
}

impl EnvironmentBuilder {
    /// Start from an explicit base mapping.
    pub fn new(base: EnvMap) -> Self {
        Self {
            base,
            excluded_fragments: Vec::new(),
            overrides: Vec::new(),
        }
    }

    /// Start from a snapshot of the current process environment.
    ///
    /// Variables whose name or value is not valid UTF-8 are skipped.
    pub fn from_current() -> Self {
        let base = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self::new(base)
    }

    /// Drop every base variable whose name contains `fragment`.
    ///
    /// Overrides are applied afterwards and are never dropped.
    pub fn without_matching(mut self, fragment: impl Into<String>) -> Self {
        self.excluded_fragments.push(fragment.into());
        self
    }

    /// Append one override row.
    pub fn with_override(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((name.into(), value.into()));
        self
    }

    /// Append override rows in order.
    pub fn with_overrides<I, K, V>(mut self, rows: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.overrides
            .extend(rows.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Produce the child environment. Does not touch the builder's inputs.
    pub fn build(&self) -> EnvMap {
        let mut env: EnvMap = self
            .base
            .iter()
            .filter(|(name, _)| {
                !self
                    .excluded_fragments
                    .iter()
                    .any(|fragment| name.contains(fragment.as_str()))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (name, value) in &self.overrides {
            env.insert(name.clone(), value.clone());
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn base() -> EnvMap {
        [("PATH", "/usr/bin"), ("HOME", "/home/tester"), ("LANG", "C")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_overrides_replace_and_extend() {
        let env = EnvironmentBuilder::new(base())
            .with_override("LANG", "en_US.UTF-8")
            .with_override("INFERENCE_ENDPOINT", "http://localhost:8000")
            .build();

        assert_eq!(env["LANG"], "en_US.UTF-8");
        assert_eq!(env["INFERENCE_ENDPOINT"], "http://localhost:8000");
        assert_eq!(env["PATH"], "/usr/bin");
        assert_eq!(env.len(), 4);
    }

    #[test]
    fn test_last_write_wins() {
        let env = EnvironmentBuilder::new(base())
            .with_overrides([("S3_BUCKET", "first"), ("S3_BUCKET", "second")])
            .build();
        assert_eq!(env["S3_BUCKET"], "second");
    }

    #[test]
    fn test_without_matching_drops_base_only() {
        let mut base = base();
        base.insert(
            "INSIGHTS_RESULTS_AGGREGATOR__STORAGE__DB_DRIVER".to_string(),
            "postgres".to_string(),
        );
        let env = EnvironmentBuilder::new(base)
            .without_matching("INSIGHTS_RESULTS_AGGREGATOR__")
            .with_override("INSIGHTS_RESULTS_AGGREGATOR__LOGGING__DEBUG", "true")
            .build();

        assert!(!env.contains_key("INSIGHTS_RESULTS_AGGREGATOR__STORAGE__DB_DRIVER"));
        assert_eq!(env["INSIGHTS_RESULTS_AGGREGATOR__LOGGING__DEBUG"], "true");
        assert_eq!(env["HOME"], "/home/tester");
    }

    #[test]
    fn test_build_is_repeatable() {
        let builder = EnvironmentBuilder::new(base()).with_override("A", "1");
        assert_eq!(builder.build(), builder.build());
    }

    #[test]
    fn test_from_current_sees_path() {
        let env = EnvironmentBuilder::from_current().build();
        assert_eq!(env.get("PATH").cloned(), std::env::var("PATH").ok());
    }

    proptest! {
        #[test]
        fn prop_overlay_is_deterministic(
            base in proptest::collection::btree_map("[A-D]{1,2}", "[a-z]{0,4}", 0..8),
            rows in proptest::collection::vec(("[A-F]{1,2}", "[a-z]{0,4}"), 0..12),
        ) {
            let env = EnvironmentBuilder::new(base.clone())
                .with_overrides(rows.clone())
                .build();

            for (name, value) in &base {
                if !rows.iter().any(|(k, _)| k == name) {
                    prop_assert_eq!(env.get(name), Some(value));
                }
            }
            for (name, _) in &rows {
                let last = rows.iter().rev().find(|(k, _)| k == name).map(|(_, v)| v);
                prop_assert_eq!(env.get(name), last);
            }
        }
    }
}
