//! SQLite-backed persistence for runs, checkpoints, the page cache, and
//! cross-run answers.

use super::{AnswerStore, CheckpointStore, PageCache, RunFailure, RunRecord, RunStore};
use crate::model::{Answer, Company, CrawledPage, PhaseResult, RunOutcome};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data dir: {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// In-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite lock");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                company_url TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                result TEXT,
                error TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS phases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                result TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                company_url TEXT NOT NULL,
                phase TEXT NOT NULL,
                payload BLOB NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (company_url, phase)
            );

            CREATE TABLE IF NOT EXISTS page_cache (
                company_url TEXT PRIMARY KEY,
                pages TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS answers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_url TEXT NOT NULL,
                question_id TEXT NOT NULL,
                field_key TEXT NOT NULL,
                answer TEXT NOT NULL,
                confidence REAL NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_phases_run ON phases(run_id);
            CREATE INDEX IF NOT EXISTS idx_answers_company ON answers(company_url);
            ",
        )
        .context("Failed to run migrations")?;
        Ok(())
    }
}

impl RunStore for SqliteStore {
    fn create_run(&self, company: &Company) -> Result<RunRecord> {
        let conn = self.conn.lock().expect("sqlite lock");
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO runs (id, company_url, status, created_at) VALUES (?1, ?2, 'running', ?3)",
            params![id, company.url, created_at],
        )
        .context("Failed to insert run")?;
        Ok(RunRecord {
            id,
            company_url: company.url.clone(),
            created_at,
        })
    }

    fn update_run_status(&self, run_id: &str, status: &str) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite lock");
        conn.execute(
            "UPDATE runs SET status = ?1 WHERE id = ?2",
            params![status, run_id],
        )
        .context("Failed to update run status")?;
        Ok(())
    }

    fn create_phase(&self, run_id: &str, name: &str) -> Result<i64> {
        let conn = self.conn.lock().expect("sqlite lock");
        conn.execute(
            "INSERT INTO phases (run_id, name) VALUES (?1, ?2)",
            params![run_id, name],
        )
        .context("Failed to insert phase")?;
        Ok(conn.last_insert_rowid())
    }

    fn complete_phase(&self, phase_id: i64, result: &PhaseResult) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite lock");
        let payload = serde_json::to_string(result).context("Failed to serialize phase result")?;
        conn.execute(
            "UPDATE phases SET status = ?1, result = ?2 WHERE id = ?3",
            params![result.status.as_str(), payload, phase_id],
        )
        .context("Failed to complete phase")?;
        Ok(())
    }

    fn update_run_result(&self, run_id: &str, outcome: &RunOutcome) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite lock");
        let payload = serde_json::to_string(outcome).context("Failed to serialize run result")?;
        conn.execute(
            "UPDATE runs SET status = 'complete', result = ?1 WHERE id = ?2",
            params![payload, run_id],
        )
        .context("Failed to update run result")?;
        Ok(())
    }

    fn fail_run(&self, run_id: &str, failure: &RunFailure) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite lock");
        let payload = serde_json::to_string(failure).context("Failed to serialize run failure")?;
        conn.execute(
            "UPDATE runs SET status = 'failed', error = ?1 WHERE id = ?2",
            params![payload, run_id],
        )
        .context("Failed to mark run failed")?;
        Ok(())
    }
}

impl CheckpointStore for SqliteStore {
    fn load(&self, company_url: &str, phase: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().expect("sqlite lock");
        let mut stmt = conn.prepare(
            "SELECT payload FROM checkpoints WHERE company_url = ?1 AND phase = ?2",
        )?;
        let mut rows = stmt.query(params![company_url, phase])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn save(&self, company_url: &str, phase: &str, payload: &[u8]) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite lock");
        conn.execute(
            "INSERT INTO checkpoints (company_url, phase, payload) VALUES (?1, ?2, ?3)
             ON CONFLICT (company_url, phase) DO UPDATE SET payload = excluded.payload",
            params![company_url, phase, payload],
        )
        .context("Failed to save checkpoint")?;
        Ok(())
    }

    fn delete(&self, company_url: &str) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite lock");
        conn.execute(
            "DELETE FROM checkpoints WHERE company_url = ?1",
            params![company_url],
        )
        .context("Failed to delete checkpoint")?;
        Ok(())
    }
}

impl PageCache for SqliteStore {
    fn get(&self, company_url: &str) -> Result<Option<Vec<CrawledPage>>> {
        let conn = self.conn.lock().expect("sqlite lock");
        let mut stmt =
            conn.prepare("SELECT pages, expires_at FROM page_cache WHERE company_url = ?1")?;
        let mut rows = stmt.query(params![company_url])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let pages_json: String = row.get(0)?;
        let expires_at: String = row.get(1)?;

        let expires = DateTime::parse_from_rfc3339(&expires_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        if expires <= Utc::now() {
            return Ok(None);
        }
        let pages = serde_json::from_str(&pages_json).context("Failed to parse cached pages")?;
        Ok(Some(pages))
    }

    fn set(&self, company_url: &str, pages: &[CrawledPage], ttl: Duration) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite lock");
        let pages_json = serde_json::to_string(pages).context("Failed to serialize pages")?;
        let expires_at =
            (Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()))
                .to_rfc3339();
        conn.execute(
            "INSERT INTO page_cache (company_url, pages, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (company_url) DO UPDATE SET pages = excluded.pages,
                 expires_at = excluded.expires_at",
            params![company_url, pages_json, expires_at],
        )
        .context("Failed to write page cache")?;
        Ok(())
    }
}

impl AnswerStore for SqliteStore {
    fn high_confidence_answers(
        &self,
        company_url: &str,
        min_confidence: f64,
        max_age: Option<Duration>,
    ) -> Result<Vec<Answer>> {
        let conn = self.conn.lock().expect("sqlite lock");
        let mut stmt = conn.prepare(
            "SELECT answer, created_at FROM answers
             WHERE company_url = ?1 AND confidence >= ?2
             ORDER BY created_at DESC",
        )?;
        let cutoff = max_age.map(|age| {
            Utc::now() - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero())
        });

        let mut answers = Vec::new();
        let mut seen_keys = std::collections::HashSet::new();
        let mut rows = stmt.query(params![company_url, min_confidence])?;
        while let Some(row) = rows.next()? {
            let payload: String = row.get(0)?;
            let created_at: String = row.get(1)?;
            if let Some(cutoff) = cutoff {
                let created = DateTime::parse_from_rfc3339(&created_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or(cutoff);
                if created < cutoff {
                    continue;
                }
            }
            let answer: Answer = match serde_json::from_str(&payload) {
                Ok(a) => a,
                Err(err) => {
                    tracing::warn!(%err, "skipping unparseable persisted answer");
                    continue;
                }
            };
            // Newest row per field key wins.
            if seen_keys.insert(answer.field_key.clone()) {
                answers.push(answer);
            }
        }
        Ok(answers)
    }

    fn record_answers(&self, company_url: &str, answers: &[Answer]) -> Result<()> {
        let mut conn = self.conn.lock().expect("sqlite lock");
        let tx = conn.transaction().context("Failed to start transaction")?;
        let created_at = Utc::now().to_rfc3339();
        for answer in answers {
            let payload = serde_json::to_string(answer).context("Failed to serialize answer")?;
            tx.execute(
                "INSERT INTO answers (company_url, question_id, field_key, answer, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    company_url,
                    answer.question_id,
                    answer.field_key,
                    payload,
                    answer.confidence,
                    created_at
                ],
            )?;
        }
        tx.commit().context("Failed to commit answers")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(key: &str, confidence: f64) -> Answer {
        Answer {
            question_id: "q".into(),
            field_key: key.into(),
            value: serde_json::json!("v"),
            confidence,
            tier: 1,
            source: "t1".into(),
            source_url: None,
            reasoning: None,
            data_as_of: None,
        }
    }

    #[test]
    fn run_lifecycle_round_trip() {
        let store = SqliteStore::new_in_memory().unwrap();
        let company = Company::new("https://acme.com");

        let run = store.create_run(&company).unwrap();
        assert!(!run.id.is_empty());

        let phase_id = store.create_phase(&run.id, "classify").unwrap();
        let result = PhaseResult::complete("classify");
        store.complete_phase(phase_id, &result).unwrap();

        store.update_run_status(&run.id, "running").unwrap();
        store
            .fail_run(
                &run.id,
                &RunFailure {
                    category: "permanent".into(),
                    phase: "classify".into(),
                    message: "boom".into(),
                    phase_statuses: vec![("classify".into(), "failed".into())],
                },
            )
            .unwrap();
    }

    #[test]
    fn checkpoint_save_load_delete() {
        let store = SqliteStore::new_in_memory().unwrap();
        let url = "https://acme.com";

        assert!(store.load(url, "t1_complete").unwrap().is_none());
        store.save(url, "t1_complete", b"payload-bytes").unwrap();
        assert_eq!(
            store.load(url, "t1_complete").unwrap().unwrap(),
            b"payload-bytes"
        );

        // Overwrite is an upsert
        store.save(url, "t1_complete", b"new-payload").unwrap();
        assert_eq!(
            store.load(url, "t1_complete").unwrap().unwrap(),
            b"new-payload"
        );

        store.delete(url).unwrap();
        assert!(store.load(url, "t1_complete").unwrap().is_none());
    }

    #[test]
    fn page_cache_expires() {
        let store = SqliteStore::new_in_memory().unwrap();
        let url = "https://acme.com";
        let pages = vec![CrawledPage::new("https://acme.com/", "Acme", "body")];

        store.set(url, &pages, Duration::from_secs(3600)).unwrap();
        let cached = PageCache::get(&store, url).unwrap().unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].title, "Acme");

        // Zero TTL expires immediately
        store.set(url, &pages, Duration::from_secs(0)).unwrap();
        assert!(PageCache::get(&store, url).unwrap().is_none());
    }

    #[test]
    fn answers_filter_by_confidence() {
        let store = SqliteStore::new_in_memory().unwrap();
        let url = "https://acme.com";
        store
            .record_answers(url, &[answer("industry", 0.9), answer("phone", 0.5)])
            .unwrap();

        let high = store.high_confidence_answers(url, 0.8, None).unwrap();
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].field_key, "industry");
    }

    #[test]
    fn answers_keep_newest_per_field_key() {
        let store = SqliteStore::new_in_memory().unwrap();
        let url = "https://acme.com";
        store.record_answers(url, &[answer("industry", 0.85)]).unwrap();
        let mut newer = answer("industry", 0.95);
        newer.value = serde_json::json!("newer");
        store.record_answers(url, &[newer]).unwrap();

        let answers = store.high_confidence_answers(url, 0.8, None).unwrap();
        assert_eq!(answers.len(), 1);
    }

    #[test]
    fn answers_scoped_by_company() {
        let store = SqliteStore::new_in_memory().unwrap();
        store
            .record_answers("https://acme.com", &[answer("industry", 0.9)])
            .unwrap();
        let other = store
            .high_confidence_answers("https://other.com", 0.5, None)
            .unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn file_backed_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prospect.db");
        {
            let store = SqliteStore::new(&path).unwrap();
            store.save("https://acme.com", "t1_complete", b"x").unwrap();
        }
        let store = SqliteStore::new(&path).unwrap();
        assert!(store.load("https://acme.com", "t1_complete").unwrap().is_some());
    }
}
