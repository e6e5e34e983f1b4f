// 🎛️ Pipeline Orchestrator
// Owns the stores, runs download -> extract -> reconcile -> persist for one month,
// and publishes the finished index as a single atomic snapshot swap.

use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::cache::{EnrichmentFailure, ReconciliationCache};
use crate::config::Config;
use crate::db::{self, DatasetSummary};
use crate::directory::{DirectoryClient, OdsDirectoryClient};
use crate::error::{IndexError, Result};
use crate::extractor::RecordExtractor;
use crate::index::QueryIndex;
use crate::month::Month;
use crate::records::{Dataset, EnrichedRecord};
use crate::source::{self, MonthSource};

// ============================================================================
// CANCELLATION
// ============================================================================

/// Cooperative cancellation shared between a run and whoever started it.
///
/// Clones share the cancelled flag. A scoped token additionally carries the
/// run's deadline, so `check` reports either `Cancelled` or `TimedOut`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
    month: String,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Same flag, bound to one month and an optional time limit
    pub fn scoped(&self, month: &Month, timeout: Option<Duration>) -> Self {
        let deadline = match (self.deadline, timeout.map(|t| Instant::now() + t)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        CancelToken {
            cancelled: Arc::clone(&self.cancelled),
            deadline,
            month: month.to_string(),
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(IndexError::Cancelled {
                month: self.month.clone(),
            });
        }
        if self.deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            return Err(IndexError::TimedOut {
                month: self.month.clone(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// STATE + REPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    /// No snapshot has been built yet
    Unloaded,
    /// A snapshot is being built; any previous one keeps serving
    Building,
    Ready,
}

/// What one pipeline run did
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub month: Month,
    pub source: String,
    pub files: usize,
    pub rows_read: usize,
    pub records: usize,
    pub skipped_rows: usize,
    pub unresolved_systems: usize,
    pub cache_hits: usize,
    pub lookups: usize,
    pub newly_resolved: usize,
    pub confirmed_absent: usize,
    /// Lookups that failed transiently; those codes carry no commissioner this run
    pub failures: Vec<EnrichmentFailure>,
    pub fingerprint: String,
    /// Same content as the dataset previously stored for this month
    pub unchanged: bool,
    /// The active snapshot was replaced by this run's index
    pub index_swapped: bool,
    pub elapsed_ms: u64,
}

struct ActiveSlot {
    state: IndexState,
    snapshot: Option<Arc<QueryIndex>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Past-month indexes kept in memory alongside the active snapshot
const MEMOISED_MONTHS: usize = 12;

pub struct Orchestrator {
    config: Config,
    extractor: RecordExtractor,
    directory: Box<dyn DirectoryClient>,
    store: Mutex<Connection>,
    /// Held for the whole of a run: at most one run at a time
    cache: Mutex<ReconciliationCache>,
    active: RwLock<ActiveSlot>,
    build_lock: Mutex<()>,
    /// Indexes for months other than the active one, built on first query
    other_months: Mutex<HashMap<Month, Arc<QueryIndex>>>,
}

impl Orchestrator {
    /// Open the stores at `config.database_path` with the given directory client
    pub fn open(config: Config, directory: Box<dyn DirectoryClient>) -> Result<Self> {
        let store = db::open_database(&config.database_path)?;
        let cache = ReconciliationCache::open(&config.database_path, config.lookup_interval)?;

        info!(
            database = %config.database_path.display(),
            cached_codes = cache.len(),
            "Orchestrator ready"
        );

        Ok(Orchestrator {
            extractor: RecordExtractor::new(),
            directory,
            store: Mutex::new(store),
            cache: Mutex::new(cache),
            active: RwLock::new(ActiveSlot {
                state: IndexState::Unloaded,
                snapshot: None,
            }),
            build_lock: Mutex::new(()),
            other_months: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Open with the live ODS directory client
    pub fn from_config(config: Config) -> Result<Self> {
        let directory = OdsDirectoryClient::from_config(&config)?;
        Self::open(config, Box::new(directory))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index_state(&self) -> IndexState {
        self.active.read().unwrap_or_else(PoisonError::into_inner).state
    }

    fn set_state(&self, state: IndexState) {
        self.active.write().unwrap_or_else(PoisonError::into_inner).state = state;
    }

    fn active_snapshot(&self) -> Option<Arc<QueryIndex>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot
            .clone()
    }

    fn publish(&self, index: Arc<QueryIndex>) {
        let mut slot = self.active.write().unwrap_or_else(PoisonError::into_inner);
        slot.snapshot = Some(index);
        slot.state = IndexState::Ready;
    }

    // ------------------------------------------------------------------
    // Stored datasets
    // ------------------------------------------------------------------

    /// Months with a stored dataset, oldest first
    pub fn available_months(&self) -> Result<Vec<Month>> {
        db::list_months(&lock(&self.store))
    }

    pub fn dataset_summary(&self, month: &Month) -> Result<Option<DatasetSummary>> {
        db::get_dataset_summary(&lock(&self.store), month)
    }

    /// The stored dataset for `month`, or the most recent one when None
    pub fn current_dataset(&self, month: Option<&Month>) -> Result<Dataset> {
        let store = lock(&self.store);

        let target = match month {
            Some(month) => month.clone(),
            None => db::latest_month(&store)?.ok_or_else(|| IndexError::DataNotFound {
                month: None,
                available: Vec::new(),
            })?,
        };

        match db::load_dataset(&store, &target)? {
            Some(dataset) => Ok(dataset),
            None => Err(IndexError::DataNotFound {
                month: Some(target.to_string()),
                available: db::list_months(&store)?.iter().map(Month::to_string).collect(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Query snapshots
    // ------------------------------------------------------------------

    /// The active snapshot, built from the latest stored month on first use
    pub fn active_index(&self) -> Result<Arc<QueryIndex>> {
        if let Some(snapshot) = self.active_snapshot() {
            return Ok(snapshot);
        }

        let _build = lock(&self.build_lock);
        if let Some(snapshot) = self.active_snapshot() {
            return Ok(snapshot);
        }

        self.set_state(IndexState::Building);
        match self.current_dataset(None) {
            Ok(dataset) => {
                let index = Arc::new(QueryIndex::build(dataset));
                self.publish(Arc::clone(&index));
                Ok(index)
            }
            Err(e) => {
                self.set_state(IndexState::Unloaded);
                Err(e)
            }
        }
    }

    /// Snapshot for a specific month, or the active one when None
    pub fn index_for(&self, month: Option<&Month>) -> Result<Arc<QueryIndex>> {
        let month = match month {
            None => return self.active_index(),
            Some(month) => month,
        };

        if let Some(snapshot) = self.active_snapshot() {
            if snapshot.month() == month {
                return Ok(snapshot);
            }
        }
        if let Some(index) = lock(&self.other_months).get(month) {
            return Ok(Arc::clone(index));
        }

        let latest = db::latest_month(&lock(&self.store))?;
        if latest.as_ref() == Some(month) {
            return self.active_index();
        }

        // Memo builds and refresh_snapshot are serialised on build_lock
        let _build = lock(&self.build_lock);
        if let Some(index) = lock(&self.other_months).get(month) {
            return Ok(Arc::clone(index));
        }

        let index = Arc::new(QueryIndex::build(self.current_dataset(Some(month))?));
        self.memoise(Arc::clone(&index));
        Ok(index)
    }

    /// Keep at most MEMOISED_MONTHS past-month indexes, dropping the oldest month first
    fn memoise(&self, index: Arc<QueryIndex>) {
        let mut memo = lock(&self.other_months);
        if memo.len() >= MEMOISED_MONTHS && !memo.contains_key(index.month()) {
            if let Some(oldest) = memo.keys().min().cloned() {
                memo.remove(&oldest);
            }
        }
        memo.insert(index.month().clone(), index);
    }

    pub fn lookup(&self, month: Option<&Month>, facility_code: &str) -> Result<Option<EnrichedRecord>> {
        Ok(self.index_for(month)?.lookup_exact(facility_code).cloned())
    }

    // ------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------

    /// Run the whole pipeline for one month.
    ///
    /// Any failure leaves previously stored datasets and the active snapshot
    /// untouched. Directory lookups already answered stay in the cache.
    pub fn run_pipeline(&self, month: &Month, source: &MonthSource, cancel: &CancelToken) -> Result<PipelineReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline", %run_id, month = %month);
        let _enter = span.enter();

        let cancel = cancel.scoped(month, self.config.pipeline_timeout);

        let mut cache = match self.cache.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                info!("Another pipeline run is in progress, waiting");
                lock(&self.cache)
            }
        };

        info!(source = %source.location(), "Pipeline run started");
        let result = self.execute(run_id, month, source, &mut cache, &cancel);

        match &result {
            Ok(report) => info!(
                records = report.records,
                lookups = report.lookups,
                failures = report.failures.len(),
                swapped = report.index_swapped,
                elapsed_ms = report.elapsed_ms,
                "Pipeline run finished"
            ),
            Err(e) => error!(error = %e, "Pipeline run failed, previous data kept"),
        }

        result
    }

    fn execute(
        &self,
        run_id: Uuid,
        month: &Month,
        source: &MonthSource,
        cache: &mut ReconciliationCache,
        cancel: &CancelToken,
    ) -> Result<PipelineReport> {
        let started = Instant::now();
        cancel.check()?;

        let prepared = source::prepare(source, month, self.config.download_timeout)?;
        cancel.check()?;

        let extraction = self.extractor.extract_files(month, &prepared.files)?;
        let files = prepared.files.len();
        drop(prepared);
        cancel.check()?;

        let codes: BTreeSet<String> = extraction
            .records
            .iter()
            .map(|r| r.facility_code.clone())
            .collect();
        let resolution = cache.resolve(&codes, self.directory.as_ref(), cancel)?;
        cancel.check()?;

        let skipped_rows = extraction.skipped_rows();
        let unresolved_systems = extraction.unresolved_count();
        let rows_read = extraction.rows_read;

        let records: Vec<EnrichedRecord> = extraction
            .records
            .into_iter()
            .map(|record| {
                let commissioner = resolution
                    .commissioners
                    .get(&record.facility_code)
                    .cloned()
                    .flatten();
                EnrichedRecord::new(record, commissioner)
            })
            .collect();

        let dataset = Dataset::new(month.clone(), records);
        let fingerprint = dataset.fingerprint();
        let record_count = dataset.len();

        let unchanged = {
            let mut store = lock(&self.store);
            let previous = db::get_dataset_summary(&store, month)?;
            db::save_dataset(&mut store, &dataset, skipped_rows)?;
            previous.map(|p| p.fingerprint == fingerprint).unwrap_or(false)
        };

        if !resolution.failures.is_empty() {
            warn!(
                failures = resolution.failures.len(),
                "Some commissioner lookups failed; they will be retried next run"
            );
        }

        let index_swapped = self.refresh_snapshot(dataset);

        Ok(PipelineReport {
            run_id,
            month: month.clone(),
            source: source.location(),
            files,
            rows_read,
            records: record_count,
            skipped_rows,
            unresolved_systems,
            cache_hits: resolution.cache_hits,
            lookups: resolution.lookups,
            newly_resolved: resolution.newly_resolved,
            confirmed_absent: resolution.confirmed_absent,
            failures: resolution.failures,
            fingerprint,
            unchanged,
            index_swapped,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Swap in a fresh index when the stored month is at least as recent as the
    /// active one; otherwise drop any stale memoised index for that month.
    fn refresh_snapshot(&self, dataset: Dataset) -> bool {
        let _build = lock(&self.build_lock);
        lock(&self.other_months).remove(&dataset.month);

        let active_month = match self.active_snapshot() {
            Some(snapshot) => snapshot.month().clone(),
            None => return false,
        };
        if dataset.month < active_month {
            return false;
        }

        self.set_state(IndexState::Building);
        let index = Arc::new(QueryIndex::build(dataset));
        info!(month = %index.month(), records = index.len(), "Publishing new index snapshot");
        self.publish(index);
        true
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Seed the reconciliation cache from a legacy map file
    pub fn import_commissioner_map(&self, path: &Path) -> Result<usize> {
        lock(&self.cache).import_map_file(path)
    }

    /// Forget confirmed-absent codes so the next run looks them up again
    pub fn invalidate_absent(&self) -> Result<usize> {
        lock(&self.cache).invalidate_absent()
    }

    /// (resolved, confirmed absent) entry counts
    pub fn cache_counts(&self) -> (usize, usize) {
        let cache = lock(&self.cache);
        (cache.resolved_count(), cache.absent_count())
    }

    /// Write a stored month (or the latest) to CSV
    pub fn export(&self, month: Option<&Month>, path: &Path) -> Result<usize> {
        let dataset = self.current_dataset(month)?;
        let written = db::export_dataset_csv(&dataset, path)?;
        info!(month = %dataset.month, rows = written, path = %path.display(), "Exported dataset");
        Ok(written)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::ScriptedDirectory;
    use crate::error::LookupFailure;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn month(raw: &str) -> Month {
        raw.parse().unwrap()
    }

    fn orchestrator(dir: &TempDir, directory: Arc<ScriptedDirectory>) -> Orchestrator {
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            database_path: dir.path().join("gp_index.db"),
            lookup_interval: Duration::ZERO,
            ..Config::default()
        };
        Orchestrator::open(config, Box::new(directory)).unwrap()
    }

    fn write_export(dir: &TempDir, name: &str, body: &str) -> MonthSource {
        let path: PathBuf = dir.path().join(name);
        fs::write(&path, body).unwrap();
        MonthSource::Files(vec![path])
    }

    const JAN: &str = "GP_CODE,GP_NAME,SUPPLIER\nA1,ONE SURGERY,TPP\nA2,TWO SURGERY,EMIS/EVERGREENLIFE\nA3,THREE SURGERY,\n";

    #[test]
    fn test_cancel_token_reports_cancel_and_timeout() {
        let token = CancelToken::new();
        let scoped = token.scoped(&month("2025-01"), None);
        assert!(scoped.check().is_ok());

        token.cancel();
        assert!(matches!(scoped.check(), Err(IndexError::Cancelled { .. })));

        let expired = CancelToken::new().scoped(&month("2025-01"), Some(Duration::ZERO));
        assert!(matches!(expired.check(), Err(IndexError::TimedOut { .. })));
    }

    #[test]
    fn test_unloaded_without_data_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir, Arc::new(ScriptedDirectory::new(&[])));

        assert_eq!(orch.index_state(), IndexState::Unloaded);
        let err = orch.active_index().unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(orch.index_state(), IndexState::Unloaded);
    }

    #[test]
    fn test_run_then_query() {
        let dir = tempfile::tempdir().unwrap();
        let directory = Arc::new(ScriptedDirectory::new(&[("A1", Ok(Some("15N"))), ("A2", Ok(Some("99A")))]));
        let orch = orchestrator(&dir, Arc::clone(&directory));
        let source = write_export(&dir, "crosstab_Jan_25.csv", JAN);

        let report = orch.run_pipeline(&month("2025-01"), &source, &CancelToken::new()).unwrap();

        assert_eq!(report.records, 3);
        assert_eq!(report.lookups, 3);
        assert_eq!(report.unresolved_systems, 1);
        assert!(!report.index_swapped);

        let index = orch.active_index().unwrap();
        assert_eq!(orch.index_state(), IndexState::Ready);
        let a2 = index.lookup_exact("A2").unwrap();
        assert_eq!(a2.primary_system(), Some("EMIS"));
        assert_eq!(a2.commissioner_code.as_deref(), Some("99A"));
        assert_eq!(index.lookup_exact("A3").unwrap().commissioner_code, None);
    }

    #[test]
    fn test_second_run_uses_cache_and_swaps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let directory = Arc::new(ScriptedDirectory::new(&[("A1", Ok(Some("15N")))]));
        let orch = orchestrator(&dir, Arc::clone(&directory));

        let jan = write_export(&dir, "crosstab_Jan_25.csv", JAN);
        orch.run_pipeline(&month("2025-01"), &jan, &CancelToken::new()).unwrap();
        let before = orch.active_index().unwrap();
        assert_eq!(directory.call_count(), 3);

        let feb = write_export(
            &dir,
            "crosstab_Feb_25.csv",
            "GP_CODE,GP_NAME,SUPPLIER\nA1,ONE SURGERY,TPP\nA4,FOUR SURGERY,EMIS\n",
        );
        let report = orch.run_pipeline(&month("2025-02"), &feb, &CancelToken::new()).unwrap();

        assert_eq!(report.cache_hits, 1);
        assert_eq!(report.lookups, 1);
        assert_eq!(directory.call_count(), 4);
        assert!(report.index_swapped);

        let after = orch.active_index().unwrap();
        assert_eq!(after.month(), &month("2025-02"));
        assert_eq!(before.month(), &month("2025-01"));
        assert_eq!(before.len(), 3);
    }

    #[test]
    fn test_older_month_run_keeps_active_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir, Arc::new(ScriptedDirectory::new(&[])));

        let feb = write_export(&dir, "crosstab_Feb_25.csv", "GP_CODE,GP_NAME,SUPPLIER\nB1,B SURGERY,TPP\n");
        orch.run_pipeline(&month("2025-02"), &feb, &CancelToken::new()).unwrap();
        orch.active_index().unwrap();

        let jan = write_export(&dir, "crosstab_Jan_25.csv", JAN);
        let report = orch.run_pipeline(&month("2025-01"), &jan, &CancelToken::new()).unwrap();

        assert!(!report.index_swapped);
        assert_eq!(orch.active_index().unwrap().month(), &month("2025-02"));
        assert_eq!(orch.index_for(Some(&month("2025-01"))).unwrap().len(), 3);
        assert_eq!(orch.available_months().unwrap(), vec![month("2025-01"), month("2025-02")]);
    }

    #[test]
    fn test_rerun_of_older_month_replaces_its_memo() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Arc::new(orchestrator(&dir, Arc::new(ScriptedDirectory::new(&[]))));

        let feb = write_export(&dir, "crosstab_Feb_25.csv", "GP_CODE,GP_NAME,SUPPLIER\nB1,B SURGERY,TPP\n");
        orch.run_pipeline(&month("2025-02"), &feb, &CancelToken::new()).unwrap();
        let jan = write_export(&dir, "crosstab_Jan_25.csv", JAN);
        orch.run_pipeline(&month("2025-01"), &jan, &CancelToken::new()).unwrap();
        assert_eq!(orch.index_for(Some(&month("2025-01"))).unwrap().len(), 3);

        let done = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let orch = Arc::clone(&orch);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        let len = orch.index_for(Some(&month("2025-01"))).unwrap().len();
                        assert!(len == 3 || len == 2);
                    }
                })
            })
            .collect();

        let revised = write_export(
            &dir,
            "revised_Jan_25.csv",
            "GP_CODE,GP_NAME,SUPPLIER\nA1,ONE SURGERY,TPP\nA9,NINE SURGERY,EMIS\n",
        );
        let report = orch.run_pipeline(&month("2025-01"), &revised, &CancelToken::new()).unwrap();
        assert!(!report.index_swapped);

        std::thread::sleep(Duration::from_millis(20));
        done.store(true, Ordering::SeqCst);
        for reader in readers {
            reader.join().unwrap();
        }

        let january = orch.index_for(Some(&month("2025-01"))).unwrap();
        assert_eq!(january.len(), 2);
        assert_eq!(january.lookup_exact("A9").unwrap().name(), "NINE SURGERY");
        assert!(january.lookup_exact("A3").is_none());
        assert_eq!(orch.active_index().unwrap().month(), &month("2025-02"));
    }

    #[test]
    fn test_memoised_months_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir, Arc::new(ScriptedDirectory::new(&[])));

        let months: Vec<Month> = (1..=12)
            .map(|m| month(&format!("2023-{:02}", m)))
            .chain((1..=3).map(|m| month(&format!("2024-{:02}", m))))
            .collect();
        for m in &months {
            orch.memoise(Arc::new(QueryIndex::build(Dataset::new(m.clone(), Vec::new()))));
        }

        let memo = lock(&orch.other_months);
        assert_eq!(memo.len(), MEMOISED_MONTHS);
        for evicted in &months[..3] {
            assert!(!memo.contains_key(evicted), "{} should have been dropped", evicted);
        }
        assert!(memo.contains_key(&month("2024-03")));
        assert!(memo.contains_key(&month("2023-04")));
    }

    #[test]
    fn test_failed_run_leaves_previous_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir, Arc::new(ScriptedDirectory::new(&[])));
        let jan = write_export(&dir, "crosstab_Jan_25.csv", JAN);
        orch.run_pipeline(&month("2025-01"), &jan, &CancelToken::new()).unwrap();

        let broken = write_export(&dir, "broken_Jan_25.csv", "SOMETHING,ELSE\n1,2\n");
        let err = orch.run_pipeline(&month("2025-01"), &broken, &CancelToken::new()).unwrap_err();

        assert!(matches!(err, IndexError::Parse { .. }));
        assert_eq!(orch.current_dataset(Some(&month("2025-01"))).unwrap().len(), 3);
    }

    #[test]
    fn test_cancelled_run_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir, Arc::new(ScriptedDirectory::new(&[])));
        let jan = write_export(&dir, "crosstab_Jan_25.csv", JAN);

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = orch.run_pipeline(&month("2025-01"), &jan, &cancel).unwrap_err();

        assert!(matches!(err, IndexError::Cancelled { .. }));
        assert!(orch.available_months().unwrap().is_empty());
    }

    #[test]
    fn test_transient_failure_reported_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let directory = Arc::new(ScriptedDirectory::new(&[
            ("A1", Err(LookupFailure::Timeout)),
            ("A2", Ok(Some("99A"))),
        ]));
        let orch = orchestrator(&dir, Arc::clone(&directory));
        let jan = write_export(&dir, "crosstab_Jan_25.csv", JAN);

        let report = orch.run_pipeline(&month("2025-01"), &jan, &CancelToken::new()).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].facility_code, "A1");

        let again = orch.run_pipeline(&month("2025-01"), &jan, &CancelToken::new()).unwrap();
        assert_eq!(again.lookups, 1);
        assert!(again.unchanged);
    }

    #[test]
    fn test_missing_month_lists_available() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir, Arc::new(ScriptedDirectory::new(&[])));
        let jan = write_export(&dir, "crosstab_Jan_25.csv", JAN);
        orch.run_pipeline(&month("2025-01"), &jan, &CancelToken::new()).unwrap();

        match orch.current_dataset(Some(&month("2024-06"))).unwrap_err() {
            IndexError::DataNotFound { month, available } => {
                assert_eq!(month.as_deref(), Some("2024-06"));
                assert_eq!(available, vec!["2025-01".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_export_writes_csv() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir, Arc::new(ScriptedDirectory::new(&[("A1", Ok(Some("15N")))])));
        let jan = write_export(&dir, "crosstab_Jan_25.csv", JAN);
        orch.run_pipeline(&month("2025-01"), &jan, &CancelToken::new()).unwrap();

        let out = dir.path().join("out.csv");
        assert_eq!(orch.export(None, &out).unwrap(), 3);
        let written = fs::read_to_string(out).unwrap();
        assert!(written.contains("15N,A1,ONE SURGERY,TPP,TPP"));
    }
}
