// 🗂️ Reconciliation Cache
// Append-only facility -> commissioner mapping. Codes already held are never
// sent to the directory again; only newly appearing facilities cost a lookup.

use chrono::Utc;
use csv::ReaderBuilder;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::db;
use crate::directory::DirectoryClient;
use crate::error::{IndexError, LookupFailure, Result};
use crate::orchestrator::CancelToken;

/// A lookup that failed in a way worth retrying next run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrichmentFailure {
    pub facility_code: String,
    pub failure: LookupFailure,
}

impl EnrichmentFailure {
    pub fn into_error(self) -> IndexError {
        IndexError::Enrichment {
            facility_code: self.facility_code,
            failure: self.failure,
        }
    }
}

/// Outcome of one `resolve` call
#[derive(Debug, Clone, Default, Serialize)]
pub struct Resolution {
    /// Every requested code; None = no commissioner known
    pub commissioners: BTreeMap<String, Option<String>>,
    pub cache_hits: usize,
    pub lookups: usize,
    pub newly_resolved: usize,
    pub confirmed_absent: usize,
    pub failures: Vec<EnrichmentFailure>,
}

pub struct ReconciliationCache {
    conn: Connection,
    /// code -> Some(commissioner) when resolved, None when confirmed absent
    entries: HashMap<String, Option<String>>,
    lookup_interval: Duration,
    last_lookup: Option<Instant>,
}

impl ReconciliationCache {
    /// Open the cache stored in the database at `path`, loading every entry
    pub fn open(path: &Path, lookup_interval: Duration) -> Result<Self> {
        let conn = db::open_database(path)?;
        Self::from_connection(conn, lookup_interval)
    }

    pub fn from_connection(conn: Connection, lookup_interval: Duration) -> Result<Self> {
        db::setup_database(&conn)?;

        let entries = {
            let mut stmt = conn.prepare("SELECT facility_code, commissioner_code FROM commissioner_map")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)))?
                .collect::<std::result::Result<HashMap<_, _>, _>>()?;
            rows
        };

        debug!(entries = entries.len(), "Loaded reconciliation cache");

        Ok(ReconciliationCache {
            conn,
            entries,
            lookup_interval,
            last_lookup: None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, facility_code: &str) -> bool {
        self.entries.contains_key(facility_code)
    }

    /// `None` when the code has never been recorded; `Some(None)` when it is confirmed absent
    pub fn get(&self, facility_code: &str) -> Option<Option<&str>> {
        self.entries.get(facility_code).map(|c| c.as_deref())
    }

    pub fn resolved_count(&self) -> usize {
        self.entries.values().filter(|c| c.is_some()).count()
    }

    pub fn absent_count(&self) -> usize {
        self.entries.values().filter(|c| c.is_none()).count()
    }

    /// Map every code to its commissioner, asking the directory only for codes
    /// not already cached. Lookups are sequential with at least `lookup_interval`
    /// between consecutive calls, and each answer is persisted as it arrives.
    pub fn resolve(
        &mut self,
        codes: &BTreeSet<String>,
        client: &dyn DirectoryClient,
        cancel: &CancelToken,
    ) -> Result<Resolution> {
        let mut resolution = Resolution::default();
        let mut missing = Vec::new();

        for code in codes {
            match self.entries.get(code) {
                Some(commissioner) => {
                    resolution.cache_hits += 1;
                    resolution.commissioners.insert(code.clone(), commissioner.clone());
                }
                None => missing.push(code.clone()),
            }
        }

        info!(
            requested = codes.len(),
            cached = resolution.cache_hits,
            to_lookup = missing.len(),
            "Reconciling commissioner codes"
        );

        for code in missing {
            cancel.check()?;
            self.wait_for_slot();

            let answer = client.resolve_one(&code);
            resolution.lookups += 1;

            match answer {
                Ok(Some(commissioner)) => {
                    debug!(facility_code = %code, commissioner = %commissioner, "Resolved commissioner");
                    self.record(&code, Some(&commissioner))?;
                    resolution.newly_resolved += 1;
                    resolution.commissioners.insert(code, Some(commissioner));
                }
                Ok(None) | Err(LookupFailure::NotFound) => {
                    debug!(facility_code = %code, "No commissioner known");
                    self.record(&code, None)?;
                    resolution.confirmed_absent += 1;
                    resolution.commissioners.insert(code, None);
                }
                Err(failure) => {
                    warn!(facility_code = %code, %failure, "Lookup failed, will retry next run");
                    resolution.commissioners.insert(code.clone(), None);
                    resolution.failures.push(EnrichmentFailure {
                        facility_code: code,
                        failure,
                    });
                }
            }

            if resolution.lookups % 100 == 0 {
                info!(lookups = resolution.lookups, "Reconciliation progress");
            }
        }

        info!(
            lookups = resolution.lookups,
            resolved = resolution.newly_resolved,
            absent = resolution.confirmed_absent,
            failed = resolution.failures.len(),
            "Reconciliation complete"
        );

        Ok(resolution)
    }

    /// Drop confirmed-absent entries so the next run asks the directory again.
    /// Resolved entries are never removed.
    pub fn invalidate_absent(&mut self) -> Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM commissioner_map WHERE commissioner_code IS NULL", [])?;
        self.entries.retain(|_, commissioner| commissioner.is_some());

        info!(removed, "Invalidated confirmed-absent cache entries");
        Ok(removed)
    }

    /// Import a two-column map file (`ICB Sub location,GP_ODS_CODE`)
    pub fn import_map_file(&mut self, path: &Path) -> Result<usize> {
        let file = File::open(path)?;
        self.import_map(file)
    }

    /// Import resolved entries from a two-column map. Codes already held keep
    /// their value; returns how many entries were new.
    pub fn import_map<R: Read>(&mut self, reader: R) -> Result<usize> {
        let mut csv_reader = ReaderBuilder::new().has_headers(true).from_reader(reader);
        let headers = csv_reader.headers()?.clone();

        let position = |wanted: &str| {
            headers
                .iter()
                .position(|h| h.trim().trim_start_matches('\u{feff}').eq_ignore_ascii_case(wanted))
        };
        let (commissioner_col, code_col) = match (position("ICB Sub location"), position("GP_ODS_CODE")) {
            (Some(commissioner), Some(code)) => (commissioner, code),
            _ => {
                return Err(IndexError::Query(
                    "map file must have 'ICB Sub location' and 'GP_ODS_CODE' columns".to_string(),
                ))
            }
        };

        let mut imported = 0;
        for result in csv_reader.records() {
            let row = result?;
            let code = row.get(code_col).unwrap_or("").trim().to_uppercase();
            let commissioner = row.get(commissioner_col).unwrap_or("").trim();

            if code.is_empty() || commissioner.is_empty() || commissioner.eq_ignore_ascii_case("UNKNOWN") {
                continue;
            }

            if self.record(&code, Some(commissioner))? {
                imported += 1;
            }
        }

        info!(imported, total = self.entries.len(), "Imported commissioner map");
        Ok(imported)
    }

    /// Append one entry. Returns false when the code was already held,
    /// in which case nothing is written.
    fn record(&mut self, facility_code: &str, commissioner: Option<&str>) -> Result<bool> {
        if self.entries.contains_key(facility_code) {
            return Ok(false);
        }

        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO commissioner_map (facility_code, commissioner_code, recorded_at)
             VALUES (?1, ?2, ?3)",
            params![facility_code, commissioner, Utc::now().to_rfc3339()],
        )?;

        if inserted == 1 {
            self.entries
                .insert(facility_code.to_string(), commissioner.map(str::to_string));
        }

        Ok(inserted == 1)
    }

    fn wait_for_slot(&mut self) {
        if let Some(last) = self.last_lookup {
            let elapsed = last.elapsed();
            if elapsed < self.lookup_interval {
                thread::sleep(self.lookup_interval - elapsed);
            }
        }
        self.last_lookup = Some(Instant::now());
    }
}

// ============================================================================
// TESTS
// ============================================================================
