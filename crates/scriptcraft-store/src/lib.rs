//! scriptcraft-store: SQLite history of script evaluations.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use scriptcraft_types::{fmt_number, Dimension, EvaluationResult, Grade};

pub const DEFAULT_PAGE_SIZE: usize = 50;

const WEAKEST_IN_SUMMARY: usize = 3;

#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// One stored evaluation, without the full result payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    pub script_name: String,
    pub script_path: Option<String>,
    pub evaluated_at: DateTime<Utc>,
    pub total_score: f64,
    pub grade: Grade,
    pub summary: String,
    pub report_files: Vec<PathBuf>,
    pub dimension_scores: Vec<DimensionScore>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionScore {
    pub dimension: Dimension,
    pub score: f64,
    pub max_score: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RecordQuery {
    pub limit: usize,
    pub offset: usize,
    /// Case-insensitive substring of the script name
    pub search: Option<String>,
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
            search: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordPage {
    pub records: Vec<HistoryRecord>,
    /// Matching records before paging
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBucket {
    pub label: &'static str,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryStatistics {
    pub total: usize,
    pub average: f64,
    pub distribution: Vec<ScoreBucket>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub total: usize,
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
}

const BUCKETS: [(&str, f64); 5] = [
    ("80-100", 80.0),
    ("60-79", 60.0),
    ("40-59", 40.0),
    ("20-39", 20.0),
    ("0-19", f64::NEG_INFINITY),
];

impl Store {
    /// Open (or create) the store at the given path, e.g. "history/scriptcraft.db".
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )
        .with_context(|| format!("failed to open history database {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("history database lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS evaluations (
                id TEXT PRIMARY KEY,
                script_name TEXT NOT NULL,
                script_path TEXT,
                evaluated_at TEXT NOT NULL,
                total_score REAL NOT NULL,
                grade TEXT NOT NULL,
                summary TEXT NOT NULL,
                report_files TEXT NOT NULL,
                result_json TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS dimension_scores (
                id INTEGER PRIMARY KEY,
                evaluation_id TEXT NOT NULL,
                dimension TEXT NOT NULL,
                score REAL NOT NULL,
                max_score REAL NOT NULL,
                error TEXT,
                FOREIGN KEY(evaluation_id) REFERENCES evaluations(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS traces (
                id INTEGER PRIMARY KEY,
                evaluation_id TEXT NOT NULL,
                dimension TEXT NOT NULL,
                model TEXT,
                started_at TEXT NOT NULL,
                duration_ms INTEGER,
                attempts INTEGER NOT NULL,
                tokens_in INTEGER,
                tokens_out INTEGER,
                error TEXT,
                FOREIGN KEY(evaluation_id) REFERENCES evaluations(id)
            )",
            [],
        )?;

        Ok(())
    }

    /// Save an evaluation and the report files written for it. Returns the record id.
    pub fn add_record(&self, result: &EvaluationResult, report_files: &[PathBuf]) -> Result<String> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let base = format!(
            "{}_{}",
            result.evaluated_at.with_timezone(&Local).format("%Y%m%d_%H%M%S"),
            result.script_name
        );
        let mut id = base.clone();
        let mut n = 2;
        while tx
            .query_row("SELECT 1 FROM evaluations WHERE id = ?1", params![id], |_| Ok(()))
            .optional()?
            .is_some()
        {
            id = format!("{}-{}", base, n);
            n += 1;
        }

        tx.execute(
            "INSERT INTO evaluations
                (id, script_name, script_path, evaluated_at, total_score, grade, summary, report_files, result_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                result.script_name,
                result.script_path.as_ref().map(|p| p.display().to_string()),
                timestamp(&result.evaluated_at),
                result.overall.total_score,
                result.overall.grade.as_str(),
                summary_text(result),
                serde_json::to_string(report_files)?,
                serde_json::to_string(result)?,
            ],
        )?;

        for d in result.dimensions.values() {
            tx.execute(
                "INSERT INTO dimension_scores (evaluation_id, dimension, score, max_score, error)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, d.dimension.key(), d.score, d.max_score, d.error],
            )?;

            for trace in &d.traces {
                tx.execute(
                    "INSERT INTO traces
                        (evaluation_id, dimension, model, started_at, duration_ms, attempts, tokens_in, tokens_out, error)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        id,
                        d.dimension.key(),
                        trace.model,
                        timestamp(&trace.start),
                        trace.duration_ms.map(|ms| ms as i64),
                        trace.attempts as i64,
                        trace.usage.map(|u| u.input_tokens as i64),
                        trace.usage.map(|u| u.output_tokens as i64),
                        trace.error,
                    ],
                )?;
            }
        }

        tx.commit()?;
        info!(id = %id, script = %result.script_name, "saved evaluation to history");
        Ok(id)
    }

    /// Records newest first.
    pub fn list_records(&self, query: &RecordQuery) -> Result<RecordPage> {
        let conn = self.conn()?;
        let search = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty());

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM evaluations
             WHERE ?1 IS NULL OR instr(lower(script_name), lower(?1)) > 0",
            params![search],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT id, script_name, script_path, evaluated_at, total_score, summary, report_files, grade
             FROM evaluations
             WHERE ?1 IS NULL OR instr(lower(script_name), lower(?1)) > 0
             ORDER BY evaluated_at DESC, rowid DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(
            params![search, query.limit as i64, query.offset as i64],
            record_from_row,
        )?;

        let mut records = Vec::new();
        for row in rows {
            let mut record = row?;
            record.dimension_scores = dimension_scores(&conn, &record.id)?;
            records.push(record);
        }

        Ok(RecordPage {
            records,
            total: total as usize,
            limit: query.limit,
            offset: query.offset,
        })
    }

    pub fn get_record(&self, id: &str) -> Result<Option<HistoryRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT id, script_name, script_path, evaluated_at, total_score, summary, report_files, grade
                 FROM evaluations WHERE id = ?1",
                params![id],
                record_from_row,
            )
            .optional()?;

        match record {
            Some(mut record) => {
                record.dimension_scores = dimension_scores(&conn, &record.id)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// The full evaluation stored with a record.
    pub fn load_result(&self, id: &str) -> Result<Option<EvaluationResult>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT result_json FROM evaluations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|j| serde_json::from_str(&j).with_context(|| format!("corrupt result for record {}", id)))
            .transpose()
    }

    /// Returns false when no such record exists.
    pub fn delete_record(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM traces WHERE evaluation_id = ?1", params![id])?;
        tx.execute("DELETE FROM dimension_scores WHERE evaluation_id = ?1", params![id])?;
        let deleted = tx.execute("DELETE FROM evaluations WHERE id = ?1", params![id])?;
        tx.commit()?;

        if deleted > 0 {
            info!(id = %id, "deleted history record");
        }
        Ok(deleted > 0)
    }

    /// Removes every record; returns how many there were.
    pub fn clear_all(&self) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM traces", [])?;
        tx.execute("DELETE FROM dimension_scores", [])?;
        let deleted = tx.execute("DELETE FROM evaluations", [])?;
        tx.commit()?;
        info!(count = deleted, "cleared history");
        Ok(deleted)
    }

    pub fn statistics(&self) -> Result<HistoryStatistics> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT total_score FROM evaluations")?;
        let scores = stmt
            .query_map([], |row| row.get::<_, f64>(0))?
            .collect::<rusqlite::Result<Vec<f64>>>()?;

        let mut distribution: Vec<ScoreBucket> = BUCKETS
            .iter()
            .map(|(label, _)| ScoreBucket { label: *label, count: 0 })
            .collect();
        for score in &scores {
            if let Some(idx) = BUCKETS.iter().position(|(_, floor)| *score >= *floor) {
                distribution[idx].count += 1;
            }
        }

        let average = if scores.is_empty() {
            0.0
        } else {
            let mean = scores.iter().sum::<f64>() / scores.len() as f64;
            (mean * 100.0).round() / 100.0
        };

        Ok(HistoryStatistics {
            total: scores.len(),
            average,
            distribution,
        })
    }

    /// Imports JSON reports from `dir`. Files that do not hold an evaluation, or
    /// that are already in the history, are skipped; unreadable files count as failed.
    pub fn import_reports<P: AsRef<Path>>(&self, dir: P) -> Result<ImportSummary> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut summary = ImportSummary {
            total: paths.len(),
            ..ImportSummary::default()
        };

        for path in paths {
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "cannot read report");
                    summary.failed += 1;
                    continue;
                }
            };
            let result: EvaluationResult = match serde_json::from_str(&text) {
                Ok(result) => result,
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "not an evaluation report");
                    summary.skipped += 1;
                    continue;
                }
            };
            if self.contains(&result)? {
                debug!(path = %path.display(), "already in history");
                summary.skipped += 1;
                continue;
            }
            self.add_record(&result, std::slice::from_ref(&path))?;
            summary.imported += 1;
        }

        info!(
            imported = summary.imported,
            skipped = summary.skipped,
            failed = summary.failed,
            "imported reports"
        );
        Ok(summary)
    }

    fn contains(&self, result: &EvaluationResult) -> Result<bool> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM evaluations WHERE script_name = ?1 AND evaluated_at = ?2",
                params![result.script_name, timestamp(&result.evaluated_at)],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let evaluated_at: String = row.get(3)?;
    let evaluated_at = DateTime::parse_from_rfc3339(&evaluated_at)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e)))?;
    let report_files: String = row.get(6)?;
    let report_files = serde_json::from_str(&report_files)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e)))?;
    let grade: String = row.get(7)?;
    let grade = grade
        .parse::<Grade>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(HistoryRecord {
        id: row.get(0)?,
        script_name: row.get(1)?,
        script_path: row.get(2)?,
        evaluated_at,
        total_score: row.get(4)?,
        grade,
        summary: row.get(5)?,
        report_files,
        dimension_scores: Vec::new(),
    })
}

fn dimension_scores(conn: &Connection, id: &str) -> Result<Vec<DimensionScore>> {
    let mut stmt = conn.prepare(
        "SELECT dimension, score, max_score, error FROM dimension_scores
         WHERE evaluation_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, f64>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, Option<String>>(3)?,
        ))
    })?;

    let mut scores = Vec::new();
    for row in rows {
        let (key, score, max_score, error) = row?;
        let dimension: Dimension = key.parse()?;
        scores.push(DimensionScore {
            dimension,
            score,
            max_score,
            error,
        });
    }
    Ok(scores)
}

/// `Total: 80.50/100 (A)` followed by the weakest scored dimensions.
pub fn summary_text(result: &EvaluationResult) -> String {
    let mut text = format!(
        "Total: {:.2}/100 ({})",
        result.overall.total_score, result.overall.grade
    );

    let mut scored: Vec<_> = result.dimensions.values().filter(|d| !d.is_failed()).collect();
    scored.sort_by(|a, b| a.percent().total_cmp(&b.percent()));
    let weakest: Vec<String> = scored
        .iter()
        .take(WEAKEST_IN_SUMMARY)
        .map(|d| format!("{} {}/{}", d.dimension_name, fmt_number(d.score), fmt_number(d.max_score)))
        .collect();
    if !weakest.is_empty() {
        text.push_str("; weakest: ");
        text.push_str(&weakest.join(", "));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use scriptcraft_types::{DimensionResult, OverallScore, TokenUsage, Trace, WeightedScore};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn result(name: &str, total: f64, at: DateTime<Utc>) -> EvaluationResult {
        let mut dimensions = BTreeMap::new();
        let mut structure = DimensionResult::new(Dimension::Structure, 82.0, 100.0);
        structure.traces.push(
            Trace::start_now()
                .model("ep-test")
                .finish(json!({"prompt_chars": 10}), "{}".to_string(), Some(TokenUsage {
                    input_tokens: 100,
                    output_tokens: 20,
                    total_tokens: 120,
                })),
        );
        dimensions.insert(Dimension::Structure, structure);
        dimensions.insert(Dimension::Dialogue, DimensionResult::new(Dimension::Dialogue, 6.0, 10.0));
        dimensions.insert(Dimension::Commercial, DimensionResult::new(Dimension::Commercial, 75.0, 100.0));
        dimensions.insert(Dimension::Characters, DimensionResult::failed(Dimension::Characters, "timeout"));

        EvaluationResult {
            script_name: name.to_string(),
            script_path: Some(PathBuf::from(format!("scripts/{}.txt", name))),
            evaluated_at: at,
            script_chars: 900,
            truncated: false,
            dimensions,
            overall: OverallScore {
                total_score: total,
                max_score: 100.0,
                grade: Grade::from_score(total),
                details: vec![WeightedScore {
                    dimension: Dimension::Structure,
                    dimension_name: "Plot structure".to_string(),
                    score: 82.0,
                    max_score: 100.0,
                    weight: 0.25,
                    weighted_score: 20.5,
                }],
            },
        }
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 8, 30, 0).unwrap()
    }

    #[test]
    fn add_get_and_load() -> Result<()> {
        let store = Store::open_in_memory()?;
        let r = result("ceo_returns", 72.5, at(1));
        let id = store.add_record(&r, &[PathBuf::from("outputs/ceo_returns.md")])?;
        assert!(id.ends_with("_ceo_returns"), "{id}");

        let record = store.get_record(&id)?.expect("record");
        assert_eq!(record.total_score, 72.5);
        assert_eq!(record.grade, Grade::B);
        assert_eq!(record.report_files, vec![PathBuf::from("outputs/ceo_returns.md")]);
        assert_eq!(record.dimension_scores.len(), 4);
        assert_eq!(record.dimension_scores[0].dimension, Dimension::Structure);
        assert!(record.summary.starts_with("Total: 72.50/100 (B)"));
        assert!(record.summary.contains("weakest: Dialogue 6/10, Commercial potential 75/100, Plot structure 82/100"));

        let loaded = store.load_result(&id)?.expect("result");
        assert_eq!(loaded.dimensions[&Dimension::Structure].traces.len(), 1);
        assert!(store.get_record("nope")?.is_none());
        assert!(store.load_result("nope")?.is_none());
        Ok(())
    }

    #[test]
    fn record_keeps_stored_grade() -> Result<()> {
        let store = Store::open_in_memory()?;
        let mut r = result("near_miss", 90.0, at(4));
        // 89.996 rounds to 90.00 but grades A
        r.overall.grade = Grade::A;
        let id = store.add_record(&r, &[])?;

        let record = store.get_record(&id)?.expect("record");
        assert_eq!(record.total_score, 90.0);
        assert_eq!(record.grade, Grade::A);
        let listed = store.list_records(&RecordQuery::default())?;
        assert_eq!(listed.records[0].grade, Grade::A);
        Ok(())
    }

    #[test]
    fn colliding_ids_get_suffixes() -> Result<()> {
        let store = Store::open_in_memory()?;
        let r = result("pilot", 60.0, at(2));
        let first = store.add_record(&r, &[])?;
        let second = store.add_record(&r, &[])?;
        let third = store.add_record(&r, &[])?;
        assert_eq!(second, format!("{}-2", first));
        assert_eq!(third, format!("{}-3", first));
        Ok(())
    }

    #[test]
    fn list_is_newest_first_with_search_and_paging() -> Result<()> {
        let store = Store::open_in_memory()?;
        store.add_record(&result("Revenge_Bride", 81.0, at(1)), &[])?;
        store.add_record(&result("ceo_returns", 64.0, at(3)), &[])?;
        store.add_record(&result("bride_swap", 45.0, at(2)), &[])?;

        let page = store.list_records(&RecordQuery::default())?;
        let names: Vec<&str> = page.records.iter().map(|r| r.script_name.as_str()).collect();
        assert_eq!(names, vec!["ceo_returns", "bride_swap", "Revenge_Bride"]);
        assert_eq!(page.total, 3);

        let page = store.list_records(&RecordQuery {
            search: Some("BRIDE".to_string()),
            ..RecordQuery::default()
        })?;
        assert_eq!(page.total, 2);
        assert_eq!(page.records.len(), 2);

        let page = store.list_records(&RecordQuery {
            limit: 1,
            offset: 1,
            search: None,
        })?;
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].script_name, "bride_swap");
        assert_eq!(page.total, 3);
        Ok(())
    }

    #[test]
    fn delete_clear_and_statistics() -> Result<()> {
        let store = Store::open_in_memory()?;
        let a = store.add_record(&result("a", 91.0, at(1)), &[])?;
        store.add_record(&result("b", 65.5, at(2)), &[])?;
        store.add_record(&result("c", 12.0, at(3)), &[])?;

        let stats = store.statistics()?;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.average, 56.17);
        let counts: Vec<usize> = stats.distribution.iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![1, 1, 0, 0, 1]);
        assert_eq!(stats.distribution[0].label, "80-100");

        assert!(store.delete_record(&a)?);
        assert!(!store.delete_record(&a)?);
        assert_eq!(store.clear_all()?, 2);
        assert_eq!(store.statistics()?.total, 0);
        assert_eq!(store.statistics()?.average, 0.0);
        Ok(())
    }

    #[test]
    fn import_skips_invalid_and_duplicates() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let r = result("imported", 70.0, at(4));
        let mut report = serde_json::to_value(&r)?;
        report["metadata"] = json!({"generator": "scriptcraft v0.1.0"});
        std::fs::write(dir.path().join("imported.json"), serde_json::to_string(&report)?)?;
        std::fs::write(dir.path().join("broken.json"), "{ not json")?;
        std::fs::write(dir.path().join("notes.md"), "# ignored")?;

        let store = Store::open_in_memory()?;
        let summary = store.import_reports(dir.path())?;
        assert_eq!(
            summary,
            ImportSummary {
                total: 2,
                imported: 1,
                skipped: 1,
                failed: 0
            }
        );

        let again = store.import_reports(dir.path())?;
        assert_eq!(again.imported, 0);
        assert_eq!(again.skipped, 2);
        assert_eq!(store.list_records(&RecordQuery::default())?.total, 1);
        Ok(())
    }

    #[test]
    fn open_creates_parent_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("history/scriptcraft.db");
        let store = Store::open(&path)?;
        store.add_record(&result("x", 50.0, at(5)), &[])?;
        drop(store);

        let reopened = Store::open(&path)?;
        assert_eq!(reopened.statistics()?.total, 1);
        Ok(())
    }
}
