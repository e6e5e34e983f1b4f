// 🔎 Query Index
// Immutable snapshot over one month's enriched records. Built once, then only read.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::error::{IndexError, Result};
use crate::month::Month;
use crate::records::{Dataset, EnrichedRecord, UNRESOLVED_LABEL};

/// Maximum number of records returned by a name search
pub const SEARCH_RESULT_CAP: usize = 50;

// ============================================================================
// QUERY RESULTS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults<'a> {
    pub term: String,
    pub exact: bool,
    pub matches: Vec<&'a EnrichedRecord>,
    /// True number of matches before the cap was applied
    pub total_matches: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommissionerGroup<'a> {
    /// None groups facilities with no commissioner known
    pub commissioner_code: Option<String>,
    pub count: usize,
    pub records: Vec<&'a EnrichedRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemFilter<'a> {
    pub system: String,
    pub total: usize,
    pub groups: Vec<CommissionerGroup<'a>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemShare {
    pub system: String,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub month: Month,
    pub total_records: usize,
    /// Largest bucket first; includes the unresolved bucket when non-empty
    pub systems: Vec<SystemShare>,
}

// ============================================================================
// INDEX
// ============================================================================

#[derive(Debug)]
pub struct QueryIndex {
    month: Month,
    records: Vec<EnrichedRecord>,
    /// Upper-cased facility code -> position
    by_code: HashMap<String, usize>,
    /// Upper-cased primary system -> positions
    by_system: HashMap<String, Vec<usize>>,
    /// Lower-cased names, parallel to `records`
    name_keys: Vec<String>,
    built_at: DateTime<Utc>,
}

impl QueryIndex {
    /// Build from a dataset in one pass
    pub fn build(dataset: Dataset) -> Self {
        let Dataset { month, records, .. } = dataset;

        let mut by_code = HashMap::with_capacity(records.len());
        let mut by_system: HashMap<String, Vec<usize>> = HashMap::new();
        let mut name_keys = Vec::with_capacity(records.len());

        for (position, enriched) in records.iter().enumerate() {
            by_code.insert(enriched.facility_code().to_uppercase(), position);
            if let Some(system) = enriched.primary_system() {
                by_system.entry(system.to_uppercase()).or_default().push(position);
            }
            name_keys.push(enriched.name().to_lowercase());
        }

        QueryIndex {
            month,
            records,
            by_code,
            by_system,
            name_keys,
            built_at: Utc::now(),
        }
    }

    pub fn month(&self) -> &Month {
        &self.month
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn records(&self) -> &[EnrichedRecord] {
        &self.records
    }

    /// Case-insensitive lookup by facility code
    pub fn lookup_exact(&self, code: &str) -> Option<&EnrichedRecord> {
        self.by_code
            .get(&code.trim().to_uppercase())
            .map(|&position| &self.records[position])
    }

    /// Case-insensitive name search: substring match, or full equality when `exact`
    pub fn search_by_name(&self, term: &str, exact: bool) -> Result<SearchResults<'_>> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            return Err(IndexError::Query("search term must not be empty".to_string()));
        }

        let mut matches = Vec::new();
        let mut total_matches = 0;

        for (position, name) in self.name_keys.iter().enumerate() {
            let hit = if exact {
                *name == needle
            } else {
                name.contains(&needle)
            };

            if hit {
                total_matches += 1;
                if matches.len() < SEARCH_RESULT_CAP {
                    matches.push(&self.records[position]);
                }
            }
        }

        Ok(SearchResults {
            term: term.trim().to_string(),
            exact,
            matches,
            total_matches,
            truncated: total_matches > SEARCH_RESULT_CAP,
        })
    }

    /// Records whose primary system equals `system` (case-insensitive),
    /// grouped by commissioner code
    pub fn filter_by_system(&self, system: &str) -> Result<SystemFilter<'_>> {
        let key = system.trim().to_uppercase();
        if key.is_empty() {
            return Err(IndexError::Query("system must not be empty".to_string()));
        }

        let positions = self.by_system.get(&key).map(Vec::as_slice).unwrap_or(&[]);

        // BTreeMap orders None before Some; move the unknown group to the end below
        let mut grouped: BTreeMap<Option<&str>, Vec<&EnrichedRecord>> = BTreeMap::new();
        for &position in positions {
            let enriched = &self.records[position];
            grouped
                .entry(enriched.commissioner_code.as_deref())
                .or_default()
                .push(enriched);
        }

        let unknown = grouped.remove(&None);
        let mut groups: Vec<CommissionerGroup<'_>> = grouped
            .into_iter()
            .map(|(commissioner, records)| CommissionerGroup {
                commissioner_code: commissioner.map(str::to_string),
                count: records.len(),
                records,
            })
            .collect();

        if let Some(records) = unknown {
            groups.push(CommissionerGroup {
                commissioner_code: None,
                count: records.len(),
                records,
            });
        }

        Ok(SystemFilter {
            system: key,
            total: positions.len(),
            groups,
        })
    }

    /// Count and share of every primary system, plus the unresolved bucket
    pub fn statistics(&self) -> Statistics {
        let total = self.records.len();
        // Same key normalisation as `by_system`, so counts agree with `filter_by_system`
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut unresolved = 0;

        for enriched in &self.records {
            match enriched.primary_system() {
                Some(system) => *counts.entry(system.to_uppercase()).or_insert(0) += 1,
                None => unresolved += 1,
            }
        }

        let share = |system: String, count: usize| SystemShare {
            system,
            count,
            percentage: count as f64 / total as f64 * 100.0,
        };
        let mut systems: Vec<SystemShare> = counts
            .into_iter()
            .map(|(system, count)| share(system, count))
            .collect();
        if unresolved > 0 {
            systems.push(share(UNRESOLVED_LABEL.to_string(), unresolved));
        }

        // Largest first; ties alphabetical with unresolved last (stable sort)
        systems.sort_by(|a, b| b.count.cmp(&a.count));

        Statistics {
            month: self.month.clone(),
            total_records: total,
            systems,
        }
    }

    /// Number of unresolved facilities in the snapshot
    pub fn unresolved_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| !r.record.is_resolved())
            .count()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{CanonicalRecord, UNRESOLVED_LABEL};
    use proptest::prelude::*;

    fn enriched(code: &str, name: &str, primary: Option<&str>, commissioner: Option<&str>) -> EnrichedRecord {
        EnrichedRecord::new(
            CanonicalRecord {
                facility_code: code.to_string(),
                name: name.to_string(),
                raw_systems: primary.iter().map(|s| s.to_string()).collect(),
                primary_system: primary.map(str::to_string),
            },
            commissioner.map(str::to_string),
        )
    }

    fn index(records: Vec<EnrichedRecord>) -> QueryIndex {
        QueryIndex::build(Dataset::new("2025-01".parse().unwrap(), records))
    }

    fn sample_index() -> QueryIndex {
        index(vec![
            enriched("A81001", "DENSHAM SURGERY", Some("TPP"), Some("16C")),
            enriched("A81002", "Queens Park Medical Centre", Some("EMIS"), Some("16C")),
            enriched("A81003", "Victoria Medical Practice", Some("EMIS"), None),
            enriched("A81004", "Bluebell Surgery", Some("EMIS"), Some("15N")),
            enriched("A81005", "Springwood Surgery", None, Some("15N")),
        ])
    }

    #[test]
    fn test_lookup_exact_is_case_insensitive() {
        let idx = sample_index();

        assert_eq!(idx.lookup_exact("a81001").unwrap().name(), "DENSHAM SURGERY");
        assert_eq!(idx.lookup_exact(" A81002 ").unwrap().facility_code(), "A81002");
        assert!(idx.lookup_exact("Z99999").is_none());
    }

    #[test]
    fn test_search_substring_matches_any_case() {
        let idx = sample_index();

        let results = idx.search_by_name("SURGERY", false).unwrap();

        let codes: Vec<&str> = results.matches.iter().map(|r| r.facility_code()).collect();
        assert_eq!(codes, vec!["A81001", "A81004", "A81005"]);
        assert_eq!(results.total_matches, 3);
        assert!(!results.truncated);
    }

    #[test]
    fn test_search_exact_requires_full_name() {
        let idx = sample_index();

        let partial = idx.search_by_name("densham", true).unwrap();
        let full = idx.search_by_name("densham surgery", true).unwrap();

        assert!(partial.matches.is_empty());
        assert_eq!(full.matches.len(), 1);
    }

    #[test]
    fn test_search_caps_results() {
        let records = (0..75)
            .map(|i| enriched(&format!("B{:05}", i), &format!("Health Centre {}", i), Some("TPP"), None))
            .collect();
        let idx = index(records);

        let results = idx.search_by_name("health centre", false).unwrap();

        assert_eq!(results.matches.len(), SEARCH_RESULT_CAP);
        assert_eq!(results.total_matches, 75);
        assert!(results.truncated);
    }

    #[test]
    fn test_empty_terms_rejected() {
        let idx = sample_index();

        assert!(matches!(idx.search_by_name("   ", false), Err(IndexError::Query(_))));
        assert!(matches!(idx.filter_by_system(""), Err(IndexError::Query(_))));
    }

    #[test]
    fn test_filter_by_system_groups_by_commissioner() {
        let idx = sample_index();

        let filter = idx.filter_by_system("emis").unwrap();

        assert_eq!(filter.system, "EMIS");
        assert_eq!(filter.total, 3);
        let groups: Vec<(Option<&str>, usize)> = filter
            .groups
            .iter()
            .map(|g| (g.commissioner_code.as_deref(), g.count))
            .collect();
        assert_eq!(groups, vec![(Some("15N"), 1), (Some("16C"), 1), (None, 1)]);
    }

    #[test]
    fn test_filter_unknown_system_is_empty_not_error() {
        let idx = sample_index();

        let filter = idx.filter_by_system("VISION").unwrap();

        assert_eq!(filter.total, 0);
        assert!(filter.groups.is_empty());
    }

    #[test]
    fn test_statistics_include_unresolved_bucket() {
        let idx = sample_index();

        let stats = idx.statistics();

        assert_eq!(stats.total_records, 5);
        assert_eq!(stats.systems[0].system, "EMIS");
        assert_eq!(stats.systems[0].count, 3);
        assert!((stats.systems[0].percentage - 60.0).abs() < 1e-9);
        let labels: Vec<&str> = stats.systems.iter().map(|s| s.system.as_str()).collect();
        assert_eq!(labels, vec!["EMIS", "TPP", UNRESOLVED_LABEL]);
        assert_eq!(idx.unresolved_count(), 1);
    }

    #[test]
    fn test_statistics_buckets_match_system_filter() {
        let idx = index(vec![
            enriched("C1", "One", Some("Emis"), None),
            enriched("C2", "Two", Some("EMIS"), Some("15N")),
            enriched("C3", "Three", Some("unresolved"), None),
            enriched("C4", "Four", None, None),
        ]);

        let stats = idx.statistics();

        let buckets: Vec<(&str, usize)> = stats.systems.iter().map(|s| (s.system.as_str(), s.count)).collect();
        assert_eq!(buckets, vec![("EMIS", 2), ("UNRESOLVED", 1), (UNRESOLVED_LABEL, 1)]);
        assert_eq!(idx.filter_by_system("emis").unwrap().total, 2);
        assert_eq!(idx.filter_by_system("Unresolved").unwrap().total, 1);
    }

    #[test]
    fn test_statistics_on_empty_index() {
        let stats = index(vec![]).statistics();

        assert_eq!(stats.total_records, 0);
        assert!(stats.systems.is_empty());
    }

    proptest! {
        #[test]
        fn prop_statistics_sum_to_total(systems in proptest::collection::vec(
            proptest::option::of(prop_oneof![Just("TPP"), Just("EMIS"), Just("VISION"), Just("MEDICUS")]),
            1..200,
        )) {
            let records = systems
                .iter()
                .enumerate()
                .map(|(i, system)| enriched(&format!("P{:05}", i), "Practice", *system, None))
                .collect();
            let stats = index(records).statistics();

            let count_sum: usize = stats.systems.iter().map(|s| s.count).sum();
            let percentage_sum: f64 = stats.systems.iter().map(|s| s.percentage).sum();

            prop_assert_eq!(count_sum, stats.total_records);
            prop_assert!((percentage_sum - 100.0).abs() < 1e-9);
        }
    }
}
