// 🏗️ Record Extractor
// Turns one month's practice-level export files into canonical per-facility records.

use csv::{ReaderBuilder, StringRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{IndexError, Result};
use crate::month::Month;
use crate::records::CanonicalRecord;

/// Labels that wrap an underlying clinical system and are never a primary system themselves
pub const AGGREGATOR_LABELS: &[&str] = &["EVERGREENLIFE"];

pub fn is_aggregator(label: &str) -> bool {
    AGGREGATOR_LABELS
        .iter()
        .any(|aggregator| aggregator.eq_ignore_ascii_case(label))
}

/// Resolve the primary system from every raw label asserted for a facility.
///
/// Aggregator labels are dropped; of what remains the lexicographically smallest
/// label wins. Nothing left means unresolved.
pub fn resolve_primary_system(raw_systems: &BTreeSet<String>) -> Option<String> {
    // BTreeSet iterates in ascending order, so the first survivor is the minimum
    raw_systems
        .iter()
        .find(|label| !is_aggregator(label))
        .cloned()
}

// ============================================================================
// EXPORT SCHEMA
// ============================================================================

/// Column layout of a monthly export, matched by header name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSchema {
    pub version: String,
    pub code_column: String,
    pub name_column: String,
    pub systems_column: String,
    pub system_delimiter: char,
}

impl ExportSchema {
    /// Practice Level Crosstab layout
    pub fn v1() -> Self {
        ExportSchema {
            version: "v1".to_string(),
            code_column: "GP_CODE".to_string(),
            name_column: "GP_NAME".to_string(),
            systems_column: "SUPPLIER".to_string(),
            system_delimiter: '/',
        }
    }

    /// Find the required columns in a header row; any absent column is fatal
    fn locate(&self, headers: &StringRecord) -> std::result::Result<ColumnPositions, String> {
        let find = |wanted: &str| {
            headers
                .iter()
                .position(|h| h.trim().trim_start_matches('\u{feff}').eq_ignore_ascii_case(wanted))
        };

        let mut missing = Vec::new();
        let code = find(&self.code_column);
        let name = find(&self.name_column);
        let systems = find(&self.systems_column);

        if code.is_none() {
            missing.push(self.code_column.as_str());
        }
        if name.is_none() {
            missing.push(self.name_column.as_str());
        }
        if systems.is_none() {
            missing.push(self.systems_column.as_str());
        }

        match (code, name, systems) {
            (Some(code), Some(name), Some(systems)) => Ok(ColumnPositions {
                code,
                name,
                systems,
            }),
            _ => Err(format!(
                "schema {} requires columns {} (found: {})",
                self.version,
                missing.join(", "),
                headers.iter().collect::<Vec<_>>().join(", ")
            )),
        }
    }

    fn split_systems<'a>(&'a self, raw: &'a str) -> impl Iterator<Item = String> + 'a {
        raw.split(self.system_delimiter)
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(str::to_string)
    }
}

impl Default for ExportSchema {
    fn default() -> Self {
        ExportSchema::v1()
    }
}

#[derive(Debug, Clone, Copy)]
struct ColumnPositions {
    code: usize,
    name: usize,
    systems: usize,
}

impl ColumnPositions {
    fn widest(&self) -> usize {
        self.code.max(self.name).max(self.systems)
    }
}

// ============================================================================
// EXTRACTION RESULT
// ============================================================================

/// A row that was rejected rather than turned into a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRow {
    pub source: String,
    pub line_number: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Extraction {
    /// One record per distinct facility code, sorted by code
    pub records: Vec<CanonicalRecord>,
    pub rows_read: usize,
    pub skipped: Vec<SkippedRow>,
}

impl Extraction {
    pub fn skipped_rows(&self) -> usize {
        self.skipped.len()
    }

    pub fn unresolved_count(&self) -> usize {
        self.records.iter().filter(|r| !r.is_resolved()).count()
    }
}

#[derive(Default)]
struct PartialFacility {
    name: String,
    raw_systems: BTreeSet<String>,
}

// ============================================================================
// EXTRACTOR
// ============================================================================

pub struct RecordExtractor {
    schema: ExportSchema,
}

impl RecordExtractor {
    pub fn new() -> Self {
        RecordExtractor {
            schema: ExportSchema::v1(),
        }
    }

    pub fn with_schema(schema: ExportSchema) -> Self {
        RecordExtractor { schema }
    }

    pub fn schema(&self) -> &ExportSchema {
        &self.schema
    }

    /// Extract records from the month's export files on disk
    pub fn extract_files(&self, month: &Month, paths: &[PathBuf]) -> Result<Extraction> {
        if paths.is_empty() {
            return Err(IndexError::parse(month, "no export files for this month"));
        }

        let mut sources = Vec::with_capacity(paths.len());
        for path in paths {
            let file = File::open(path)?;
            sources.push((display_name(path), file));
        }

        self.extract(month, sources)
    }

    /// Extract records from named CSV sources (one per regional file).
    ///
    /// Rows for the same facility across sources are merged: the raw system labels
    /// are unioned and the first non-empty name wins.
    pub fn extract<R: Read>(&self, month: &Month, sources: Vec<(String, R)>) -> Result<Extraction> {
        let mut facilities: BTreeMap<String, PartialFacility> = BTreeMap::new();
        let mut skipped = Vec::new();
        let mut rows_read = 0;

        for (source_name, reader) in sources {
            let mut csv_reader = ReaderBuilder::new()
                .has_headers(true)
                .flexible(true)
                .from_reader(reader);

            let headers = csv_reader
                .headers()
                .map_err(|e| IndexError::parse(month, format!("{}: unreadable header: {}", source_name, e)))?
                .clone();

            let columns = self
                .schema
                .locate(&headers)
                .map_err(|reason| IndexError::parse(month, format!("{}: {}", source_name, reason)))?;

            debug!(source = %source_name, ?columns, "Located export columns");

            for (index, result) in csv_reader.records().enumerate() {
                rows_read += 1;
                // +2: 1-indexed plus the header row
                let line_number = index + 2;

                let row = match result {
                    Ok(row) => row,
                    Err(e) => {
                        skipped.push(SkippedRow {
                            source: source_name.clone(),
                            line_number,
                            reason: format!("unreadable row: {}", e),
                        });
                        continue;
                    }
                };

                match self.read_row(&row, columns) {
                    Ok((code, name, systems)) => {
                        let facility = facilities.entry(code).or_default();
                        if facility.name.is_empty() && !name.is_empty() {
                            facility.name = name;
                        }
                        facility.raw_systems.extend(systems);
                    }
                    Err(reason) => skipped.push(SkippedRow {
                        source: source_name.clone(),
                        line_number,
                        reason,
                    }),
                }
            }
        }

        if facilities.is_empty() {
            return Err(IndexError::parse(
                month,
                format!("export contains no facility rows ({} rows skipped)", skipped.len()),
            ));
        }

        if !skipped.is_empty() {
            warn!(month = %month, skipped = skipped.len(), "Rejected export rows");
        }

        let records: Vec<CanonicalRecord> = facilities
            .into_iter()
            .map(|(facility_code, partial)| {
                let primary_system = resolve_primary_system(&partial.raw_systems);
                CanonicalRecord {
                    facility_code,
                    name: partial.name,
                    raw_systems: partial.raw_systems,
                    primary_system,
                }
            })
            .collect();

        let extraction = Extraction {
            records,
            rows_read,
            skipped,
        };

        info!(
            month = %month,
            facilities = extraction.records.len(),
            rows = extraction.rows_read,
            skipped = extraction.skipped_rows(),
            unresolved = extraction.unresolved_count(),
            "Extracted canonical records"
        );

        Ok(extraction)
    }

    fn read_row(
        &self,
        row: &StringRecord,
        columns: ColumnPositions,
    ) -> std::result::Result<(String, String, Vec<String>), String> {
        let code = row
            .get(columns.code)
            .map(|c| c.trim().to_uppercase())
            .unwrap_or_default();

        if code.is_empty() {
            return Err("missing facility code".to_string());
        }

        if row.len() <= columns.widest() {
            return Err(format!(
                "truncated row for {}: {} fields, expected at least {}",
                code,
                row.len(),
                columns.widest() + 1
            ));
        }

        let name = row.get(columns.name).unwrap_or("").trim().to_string();
        let systems = self
            .schema
            .split_systems(row.get(columns.systems).unwrap_or(""))
            .collect();

        Ok((code, name, systems))
    }
}

impl Default for RecordExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown.csv")
        .to_string()
}

// ============================================================================
// TESTS
// ============================================================================
