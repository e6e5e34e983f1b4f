use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::info;

use crate::error::Result;
use crate::month::Month;
use crate::records::{CanonicalRecord, Dataset, EnrichedRecord};

/// Summary row for one processed month
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetSummary {
    pub month: Month,
    pub fingerprint: String,
    pub record_count: i64,
    pub skipped_rows: i64,
    pub created_at: DateTime<Utc>,
}

/// Open (creating if needed) the database file and make sure the schema exists
pub fn open_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery; in-memory databases keep "memory"
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    // ==========================================================================
    // Reconciliation cache (facility -> commissioner, append-only)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS commissioner_map (
            facility_code TEXT PRIMARY KEY,
            commissioner_code TEXT,
            recorded_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Datasets (one row per processed month)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS datasets (
            month TEXT PRIMARY KEY,
            fingerprint TEXT NOT NULL,
            record_count INTEGER NOT NULL,
            skipped_rows INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS dataset_records (
            month TEXT NOT NULL,
            facility_code TEXT NOT NULL,
            name TEXT NOT NULL,
            raw_systems TEXT NOT NULL,
            primary_system TEXT,
            commissioner_code TEXT,
            PRIMARY KEY (month, facility_code)
        )",
        [],
    )?;

    Ok(())
}

/// Replace the stored dataset for its month in a single transaction.
/// Other months are never touched.
pub fn save_dataset(conn: &mut Connection, dataset: &Dataset, skipped_rows: usize) -> Result<()> {
    let tx = conn.transaction()?;
    let month = dataset.month.as_str();

    tx.execute("DELETE FROM dataset_records WHERE month = ?1", params![month])?;

    {
        let mut stmt = tx.prepare(
            "INSERT INTO dataset_records (
                month, facility_code, name, raw_systems, primary_system, commissioner_code
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;

        for enriched in &dataset.records {
            let r = &enriched.record;
            let raw_systems = serde_json::to_string(&r.raw_systems)?;
            stmt.execute(params![
                month,
                r.facility_code,
                r.name,
                raw_systems,
                r.primary_system,
                enriched.commissioner_code,
            ])?;
        }
    }

    tx.execute(
        "INSERT INTO datasets (month, fingerprint, record_count, skipped_rows, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(month) DO UPDATE SET
            fingerprint = excluded.fingerprint,
            record_count = excluded.record_count,
            skipped_rows = excluded.skipped_rows,
            created_at = excluded.created_at",
        params![
            month,
            dataset.fingerprint(),
            dataset.records.len() as i64,
            skipped_rows as i64,
            dataset.created_at.to_rfc3339(),
        ],
    )?;

    tx.commit()?;
    Ok(())
}

pub fn load_dataset(conn: &Connection, month: &Month) -> Result<Option<Dataset>> {
    let summary = match get_dataset_summary(conn, month)? {
        Some(summary) => summary,
        None => return Ok(None),
    };

    let mut stmt = conn.prepare(
        "SELECT facility_code, name, raw_systems, primary_system, commissioner_code
         FROM dataset_records
         WHERE month = ?1
         ORDER BY facility_code",
    )?;

    let records = stmt
        .query_map(params![month.as_str()], |row| {
            let raw_json: String = row.get(2)?;
            let raw_systems: BTreeSet<String> = serde_json::from_str(&raw_json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
            })?;

            Ok(EnrichedRecord {
                record: CanonicalRecord {
                    facility_code: row.get(0)?,
                    name: row.get(1)?,
                    raw_systems,
                    primary_system: row.get(3)?,
                },
                commissioner_code: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Some(Dataset {
        month: month.clone(),
        records,
        created_at: summary.created_at,
    }))
}

pub fn get_dataset_summary(conn: &Connection, month: &Month) -> Result<Option<DatasetSummary>> {
    let summary = conn
        .query_row(
            "SELECT month, fingerprint, record_count, skipped_rows, created_at
             FROM datasets WHERE month = ?1",
            params![month.as_str()],
            row_to_summary,
        )
        .optional()?;

    Ok(summary)
}

/// All processed months, oldest first
pub fn list_months(conn: &Connection) -> Result<Vec<Month>> {
    let mut stmt = conn.prepare("SELECT month FROM datasets ORDER BY month")?;

    let months = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    // Stored months were validated on the way in; skip anything hand-edited
    Ok(months.iter().filter_map(|m| m.parse().ok()).collect())
}

pub fn latest_month(conn: &Connection) -> Result<Option<Month>> {
    Ok(list_months(conn)?.into_iter().max())
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<DatasetSummary> {
    let month: String = row.get(0)?;
    let created_at: String = row.get(4)?;

    Ok(DatasetSummary {
        month: month.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        fingerprint: row.get(1)?,
        record_count: row.get(2)?,
        skipped_rows: row.get(3)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
            })?,
    })
}

/// Write a dataset in the published CSV layout
pub fn write_dataset_csv<W: Write>(dataset: &Dataset, writer: W) -> Result<usize> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record([
        "ICB_SUB_LOCATION",
        "GP_ODS_CODE",
        "GP_NAME",
        "GP_GPAD_SYSTEMS",
        "GP_SYSTEM",
    ])?;

    for enriched in &dataset.records {
        let r = &enriched.record;
        let raw_systems = r.raw_systems_joined();
        csv_writer.write_record([
            enriched.commissioner_code.as_deref().unwrap_or(""),
            r.facility_code.as_str(),
            r.name.as_str(),
            raw_systems.as_str(),
            r.primary_system.as_deref().unwrap_or(""),
        ])?;
    }

    csv_writer.flush()?;
    Ok(dataset.records.len())
}

pub fn export_dataset_csv(dataset: &Dataset, path: &Path) -> Result<usize> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file = fs::File::create(path)?;
    let written = write_dataset_csv(dataset, file)?;
    info!(month = %dataset.month, path = %path.display(), records = written, "Exported dataset");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enriched(code: &str, systems: &[&str], primary: Option<&str>, commissioner: Option<&str>) -> EnrichedRecord {
        EnrichedRecord::new(
            CanonicalRecord {
                facility_code: code.to_string(),
                name: format!("{} MEDICAL CENTRE", code),
                raw_systems: systems.iter().map(|s| s.to_string()).collect(),
                primary_system: primary.map(str::to_string),
            },
            commissioner.map(str::to_string),
        )
    }

    fn sample(month: &str) -> Dataset {
        Dataset::new(
            month.parse().unwrap(),
            vec![
                enriched("A1", &["TPP"], Some("TPP"), Some("15N")),
                enriched("A2", &["EMIS", "EVERGREENLIFE"], Some("EMIS"), None),
                enriched("A3", &[], None, None),
            ],
        )
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let dataset = sample("2025-01");

        save_dataset(&mut conn, &dataset, 4).unwrap();
        let loaded = load_dataset(&conn, &dataset.month).unwrap().unwrap();

        assert_eq!(loaded.records, dataset.records);
        assert_eq!(loaded.fingerprint(), dataset.fingerprint());

        let summary = get_dataset_summary(&conn, &dataset.month).unwrap().unwrap();
        assert_eq!(summary.record_count, 3);
        assert_eq!(summary.skipped_rows, 4);
    }

    #[test]
    fn test_resave_replaces_only_that_month() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        save_dataset(&mut conn, &sample("2025-01"), 0).unwrap();
        save_dataset(&mut conn, &sample("2025-02"), 0).unwrap();

        let smaller = Dataset::new(
            "2025-02".parse().unwrap(),
            vec![enriched("B1", &["TPP"], Some("TPP"), None)],
        );
        save_dataset(&mut conn, &smaller, 0).unwrap();

        let feb = load_dataset(&conn, &"2025-02".parse().unwrap()).unwrap().unwrap();
        let jan = load_dataset(&conn, &"2025-01".parse().unwrap()).unwrap().unwrap();
        assert_eq!(feb.len(), 1);
        assert_eq!(jan.len(), 3);
    }

    #[test]
    fn test_months_listed_in_order() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        for month in ["2025-03", "2024-11", "2025-01"] {
            save_dataset(&mut conn, &sample(month), 0).unwrap();
        }

        let months: Vec<String> = list_months(&conn).unwrap().iter().map(|m| m.to_string()).collect();
        assert_eq!(months, vec!["2024-11", "2025-01", "2025-03"]);
        assert_eq!(latest_month(&conn).unwrap().unwrap().as_str(), "2025-03");
    }

    #[test]
    fn test_missing_month_loads_none() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        assert!(load_dataset(&conn, &"2025-01".parse().unwrap()).unwrap().is_none());
        assert!(latest_month(&conn).unwrap().is_none());
    }

    #[test]
    fn test_csv_export_layout() {
        let mut out = Vec::new();

        let written = write_dataset_csv(&sample("2025-01"), &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(written, 3);
        assert_eq!(lines[0], "ICB_SUB_LOCATION,GP_ODS_CODE,GP_NAME,GP_GPAD_SYSTEMS,GP_SYSTEM");
        assert_eq!(lines[1], "15N,A1,A1 MEDICAL CENTRE,TPP,TPP");
        assert_eq!(lines[2], ",A2,A2 MEDICAL CENTRE,EMIS/EVERGREENLIFE,EMIS");
        assert_eq!(lines[3], ",A3,A3 MEDICAL CENTRE,,");
    }
}
