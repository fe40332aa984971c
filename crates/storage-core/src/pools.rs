//! Pool-map grammar used by storage class parameters.
//!
//! `backend1:pool1,pool2;backend2:pool1` decodes to
//! `{backend1: {pool1, pool2}, backend2: {pool1}}`. Whitespace around the
//! separators is ignored. Backend and pool entries are matched as anchored
//! regular expressions so `ontap-.*:aggr1` selects every matching backend.

use crate::error::{OrchestratorError, Result};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

/// Backend name -> set of pool names.
pub type PoolMap = BTreeMap<String, BTreeSet<String>>;

/// Parses the pool-map grammar.
///
/// An empty (or all-whitespace) value yields an empty map. Entries without a
/// `:` separator, with an empty backend, or with no pools are rejected.
pub fn parse_pool_map(value: &str) -> Result<PoolMap> {
    let mut pools = PoolMap::new();

    for entry in value.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (backend, pool_list) = entry.split_once(':').ok_or_else(|| {
            OrchestratorError::invalid(format!("pool entry '{entry}' is not of the form backend:pool1,pool2"))
        })?;

        let backend = backend.trim();
        if backend.is_empty() {
            return Err(OrchestratorError::invalid(format!("pool entry '{entry}' has an empty backend name")));
        }

        let names: BTreeSet<String> = pool_list
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            return Err(OrchestratorError::invalid(format!("pool entry '{entry}' lists no pools")));
        }

        for name in std::iter::once(backend).chain(names.iter().map(String::as_str)) {
            compile_anchored(name)?;
        }

        pools.entry(backend.to_string()).or_default().extend(names);
    }

    Ok(pools)
}

/// Encodes a pool map back into the grammar accepted by [`parse_pool_map`].
pub fn encode_pool_map(pools: &PoolMap) -> String {
    pools
        .iter()
        .filter(|(_, names)| !names.is_empty())
        .map(|(backend, names)| {
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            format!("{}:{}", backend, names.join(","))
        })
        .collect::<Vec<_>>()
        .join(";")
}

enum Pattern {
    Anchored(Regex),
    // Maps built by hand skip parse-time validation
    Literal(String),
}

impl Pattern {
    fn new(pattern: &str) -> Self {
        compile_anchored(pattern).map_or_else(|_| Self::Literal(pattern.to_string()), Self::Anchored)
    }

    fn is_match(&self, value: &str) -> bool {
        match self {
            Self::Anchored(re) => re.is_match(value),
            Self::Literal(literal) => literal == value,
        }
    }
}

/// A [`PoolMap`] with every pattern compiled, for matching many pools.
pub struct PoolMatcher {
    entries: Vec<(Pattern, Vec<Pattern>)>,
}

impl PoolMatcher {
    pub fn new(pools: &PoolMap) -> Self {
        let entries = pools
            .iter()
            .map(|(backend, names)| (Pattern::new(backend), names.iter().map(|n| Pattern::new(n)).collect()))
            .collect();
        Self { entries }
    }

    /// True when `(backend, pool)` is selected by any entry of the map.
    pub fn matches(&self, backend: &str, pool: &str) -> bool {
        self.entries
            .iter()
            .any(|(backend_pattern, pool_patterns)| {
                backend_pattern.is_match(backend) && pool_patterns.iter().any(|p| p.is_match(pool))
            })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn compile_anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| OrchestratorError::invalid(format!("invalid pool pattern '{pattern}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn parses_two_backends() {
        let pools = parse_pool_map("backend1:p1,p2;backend2:p1").expect("pool map should parse");
        assert_eq!(pools.len(), 2);
        assert_eq!(pools["backend1"], set(&["p1", "p2"]));
        assert_eq!(pools["backend2"], set(&["p1"]));
    }

    #[test]
    fn ignores_whitespace_around_separators() {
        let pools = parse_pool_map("  backend1 : p1 , p2 ; backend2:  p1 ;").expect("pool map should parse");
        assert_eq!(pools, parse_pool_map("backend1:p1,p2;backend2:p1").expect("pool map should parse"));
    }

    #[test]
    fn encode_then_parse_is_stable() {
        let pools = parse_pool_map("backend2:p1;backend1:p2,p1").expect("pool map should parse");
        let encoded = encode_pool_map(&pools);
        assert_eq!(encoded, "backend1:p1,p2;backend2:p1");
        assert_eq!(parse_pool_map(&encoded).expect("encoded map should parse"), pools);
    }

    #[test]
    fn empty_value_is_empty_map() {
        assert!(parse_pool_map("").expect("pool map should parse").is_empty());
        assert!(parse_pool_map(" ; ").expect("pool map should parse").is_empty());
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(parse_pool_map("backend1").is_err());
        assert!(parse_pool_map(":p1").is_err());
        assert!(parse_pool_map("backend1:").is_err());
        assert!(parse_pool_map("backend1:(").is_err());
    }

    #[test]
    fn repeated_backend_merges_pools() {
        let pools = parse_pool_map("b:p1;b:p2").expect("pool map should parse");
        assert_eq!(pools["b"], set(&["p1", "p2"]));
    }

    #[test]
    fn matches_regex_entries() {
        let matcher = PoolMatcher::new(&parse_pool_map("ontap-.*:aggr1").expect("pool map should parse"));
        assert!(matcher.matches("ontap-san", "aggr1"));
        assert!(!matcher.matches("ontap-san", "aggr10"));
        assert!(!matcher.matches("gcp", "aggr1"));
    }

    #[test]
    fn matcher_compiles_patterns_once() {
        let matcher = PoolMatcher::new(&parse_pool_map("ontap-.*:aggr[0-9]+;gcp:standard").expect("pool map should parse"));
        assert_eq!(matcher.entries.len(), 2);
        assert!(matcher.entries.iter().all(|(backend, pools)| {
            matches!(backend, Pattern::Anchored(_)) && pools.iter().all(|p| matches!(p, Pattern::Anchored(_)))
        }));
        for n in 0..100 {
            assert!(matcher.matches("ontap-nas", &format!("aggr{n}")));
        }
        assert!(matcher.matches("gcp", "standard"));
        assert!(!matcher.matches("gcp", "premium"));
    }

    #[test]
    fn hand_built_invalid_pattern_matches_literally() {
        let pools = PoolMap::from([("b(".to_string(), set(&["p1"]))]);
        let matcher = PoolMatcher::new(&pools);
        assert!(matcher.matches("b(", "p1"));
        assert!(!matcher.matches("b", "p1"));
        assert!(PoolMatcher::new(&PoolMap::new()).is_empty());
    }
}
