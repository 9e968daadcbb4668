use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use gold_core::{Expectations, Label, Scope, TriageDelta, TriageRecord};
use rusqlite::{Connection, OptionalExtension, params};

use crate::{ExpectationsStore, LogPage, StoreError};

pub struct SqliteExpectationsStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteExpectationsStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        run_migrations(&conn)?;

        tracing::debug!(path = %path.display(), "opened expectations store");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl ExpectationsStore for SqliteExpectationsStore {
    fn expectations(&self, scope: &Scope) -> Result<Expectations, StoreError> {
        let conn = self.lock()?;
        let primary = read_scope(&conn, &Scope::Primary)?;
        if scope.is_primary() {
            return Ok(primary);
        }

        let changelist = read_scope(&conn, scope)?;
        Ok(primary.overlay(&changelist))
    }

    fn add_change(
        &self,
        scope: &Scope,
        deltas: &[TriageDelta],
        author: &str,
        timestamp_ms: i64,
    ) -> Result<TriageRecord, StoreError> {
        let scope_key = scope.key();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO triage_records (scope, author, ts_ms, change_count)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![scope_key, author, timestamp_ms, deltas.len() as i64],
        )?;
        let record_id = tx.last_insert_rowid();

        {
            let mut insert_delta = tx.prepare(
                r#"
                INSERT INTO triage_deltas (
                    record_id, seq, test, digest, label_before, label_after
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )?;
            let mut upsert_label = tx.prepare(
                r#"
                INSERT INTO expectations (scope, test, digest, label)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(scope, test, digest) DO UPDATE SET
                    label = excluded.label
                "#,
            )?;

            for (seq, delta) in deltas.iter().enumerate() {
                insert_delta.execute(params![
                    record_id,
                    seq as i64,
                    delta.test,
                    delta.digest,
                    delta.label_before.as_str(),
                    delta.label_after.as_str(),
                ])?;
                upsert_label.execute(params![
                    scope_key,
                    delta.test,
                    delta.digest,
                    delta.label_after.as_str(),
                ])?;
            }
        }

        tx.commit()?;

        Ok(TriageRecord::new(
            record_id.to_string(),
            scope.clone(),
            author,
            timestamp_ms,
            deltas.to_vec(),
        ))
    }

    fn query_log(
        &self,
        scope: &Scope,
        offset: usize,
        size: usize,
        with_details: bool,
    ) -> Result<LogPage, StoreError> {
        let scope_key = scope.key();
        let conn = self.lock()?;

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM triage_records WHERE scope = ?1",
            params![scope_key],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, author, ts_ms, change_count
            FROM triage_records
            WHERE scope = ?1
            ORDER BY ts_ms DESC, id DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )?;
        let rows = stmt.query_map(params![scope_key, size as i64, offset as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        let headers = rows.collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(headers.len());
        for (id, author, timestamp_ms, change_count) in headers {
            let deltas = if with_details {
                read_deltas(&conn, id)?
            } else {
                Vec::new()
            };
            records.push(TriageRecord {
                id: id.to_string(),
                scope: scope.clone(),
                author,
                timestamp_ms,
                change_count: change_count.max(0) as usize,
                deltas,
            });
        }

        Ok(LogPage {
            records,
            total: total.max(0) as usize,
        })
    }

    fn get_record(&self, id: &str) -> Result<Option<TriageRecord>, StoreError> {
        let Ok(record_id) = id.trim().parse::<i64>() else {
            return Ok(None);
        };

        let conn = self.lock()?;
        let header = conn
            .query_row(
                r#"
                SELECT scope, author, ts_ms
                FROM triage_records
                WHERE id = ?1
                "#,
                params![record_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((scope_key, author, timestamp_ms)) = header else {
            return Ok(None);
        };

        let scope = Scope::parse_key(&scope_key)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown scope key '{scope_key}'")))?;
        let deltas = read_deltas(&conn, record_id)?;

        Ok(Some(TriageRecord::new(
            record_id.to_string(),
            scope,
            author,
            timestamp_ms,
            deltas,
        )))
    }
}

fn read_scope(conn: &Connection, scope: &Scope) -> Result<Expectations, StoreError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT test, digest, label
        FROM expectations
        WHERE scope = ?1
        "#,
    )?;
    let rows = stmt.query_map(params![scope.key()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut expectations = Expectations::new();
    for row in rows {
        let (test, digest, label) = row?;
        expectations.set(test, digest, parse_label(&label)?);
    }
    Ok(expectations)
}

fn read_deltas(conn: &Connection, record_id: i64) -> Result<Vec<TriageDelta>, StoreError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT test, digest, label_before, label_after
        FROM triage_deltas
        WHERE record_id = ?1
        ORDER BY seq ASC
        "#,
    )?;
    let rows = stmt.query_map(params![record_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut deltas = Vec::new();
    for row in rows {
        let (test, digest, before, after) = row?;
        deltas.push(TriageDelta {
            test,
            digest,
            label_before: parse_label(&before)?,
            label_after: parse_label(&after)?,
        });
    }
    Ok(deltas)
}

fn parse_label(raw: &str) -> Result<Label, StoreError> {
    raw.parse().map_err(StoreError::Corrupt)
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS expectations (
            scope TEXT NOT NULL,
            test TEXT NOT NULL,
            digest TEXT NOT NULL,
            label TEXT NOT NULL,
            PRIMARY KEY (scope, test, digest)
        );

        CREATE TABLE IF NOT EXISTS triage_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            scope TEXT NOT NULL,
            author TEXT NOT NULL,
            ts_ms INTEGER NOT NULL,
            change_count INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_triage_records_scope_ts
            ON triage_records (scope, ts_ms DESC, id DESC);

        CREATE TABLE IF NOT EXISTS triage_deltas (
            record_id INTEGER NOT NULL REFERENCES triage_records(id),
            seq INTEGER NOT NULL,
            test TEXT NOT NULL,
            digest TEXT NOT NULL,
            label_before TEXT NOT NULL,
            label_after TEXT NOT NULL,
            PRIMARY KEY (record_id, seq)
        );
        "#,
    )?;

    Ok(())
}
