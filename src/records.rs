// 🧾 Record types
// Canonical records come out of the extractor; enriched records join them with
// the commissioner code; a dataset is one month of enriched records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::month::Month;

/// Label used for facilities without a resolved primary system
pub const UNRESOLVED_LABEL: &str = "unresolved";

/// One facility as reported by one month's export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub facility_code: String,
    pub name: String,
    /// Every raw system label asserted for the facility, sorted
    pub raw_systems: BTreeSet<String>,
    /// None = unresolved (aggregator only, or nothing recorded)
    pub primary_system: Option<String>,
}

impl CanonicalRecord {
    pub fn is_resolved(&self) -> bool {
        self.primary_system.is_some()
    }

    /// Primary system, or the unresolved bucket label
    pub fn system_label(&self) -> &str {
        self.primary_system.as_deref().unwrap_or(UNRESOLVED_LABEL)
    }

    /// Raw labels joined the way the export writes them
    pub fn raw_systems_joined(&self) -> String {
        self.raw_systems
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Canonical record joined with its reconciliation entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    #[serde(flatten)]
    pub record: CanonicalRecord,
    pub commissioner_code: Option<String>,
}

impl EnrichedRecord {
    pub fn new(record: CanonicalRecord, commissioner_code: Option<String>) -> Self {
        EnrichedRecord {
            record,
            commissioner_code,
        }
    }

    pub fn facility_code(&self) -> &str {
        &self.record.facility_code
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn primary_system(&self) -> Option<&str> {
        self.record.primary_system.as_deref()
    }
}

/// All enriched records for one month
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub month: Month,
    pub records: Vec<EnrichedRecord>,
    pub created_at: DateTime<Utc>,
}

impl Dataset {
    pub fn new(month: Month, mut records: Vec<EnrichedRecord>) -> Self {
        records.sort_by(|a, b| a.record.facility_code.cmp(&b.record.facility_code));
        Dataset {
            month,
            records,
            created_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// SHA-256 over the canonical content, independent of when the dataset was built.
    /// Two runs over identical input produce the same fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for enriched in &self.records {
            let r = &enriched.record;
            hasher.update(format!(
                "{}\t{}\t{}\t{}\t{}\n",
                r.facility_code,
                r.name,
                r.raw_systems_joined(),
                r.primary_system.as_deref().unwrap_or(""),
                enriched.commissioner_code.as_deref().unwrap_or("")
            ));
        }
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(code: &str, systems: &[&str], primary: Option<&str>) -> CanonicalRecord {
        CanonicalRecord {
            facility_code: code.to_string(),
            name: format!("{} SURGERY", code),
            raw_systems: systems.iter().map(|s| s.to_string()).collect(),
            primary_system: primary.map(str::to_string),
        }
    }

    #[test]
    fn test_system_label_falls_back_to_unresolved() {
        let resolved = record("A1", &["TPP"], Some("TPP"));
        let unresolved = record("A3", &[], None);
        assert_eq!(resolved.system_label(), "TPP");
        assert_eq!(unresolved.system_label(), UNRESOLVED_LABEL);
        assert!(!unresolved.is_resolved());
    }

    #[test]
    fn test_raw_systems_joined_sorted() {
        let r = record("A2", &["TPP", "EVERGREENLIFE"], Some("TPP"));
        assert_eq!(r.raw_systems_joined(), "EVERGREENLIFE/TPP");
    }

    #[test]
    fn test_dataset_sorted_and_fingerprint_stable() {
        let month: Month = "2025-01".parse().unwrap();
        let records = vec![
            EnrichedRecord::new(record("B2", &["EMIS"], Some("EMIS")), Some("15N".into())),
            EnrichedRecord::new(record("A1", &["TPP"], Some("TPP")), None),
        ];

        let first = Dataset::new(month.clone(), records.clone());
        let second = Dataset::new(month, records.into_iter().rev().collect());

        assert_eq!(first.records[0].facility_code(), "A1");
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.fingerprint().len(), 64);
    }

    #[test]
    fn test_enriched_record_serializes_flat() {
        let enriched = EnrichedRecord::new(record("A1", &["TPP"], Some("TPP")), Some("15N".into()));
        let json = serde_json::to_value(&enriched).unwrap();
        assert_eq!(json["facility_code"], "A1");
        assert_eq!(json["primary_system"], "TPP");
        assert_eq!(json["commissioner_code"], "15N");
    }
}
