//! Durable per-day and per-month counters.
//!
//! Every increment writes the day row for the event and the month row for its
//! derived monthly id inside one SQLite transaction, so the two never diverge.
//! The database runs in WAL mode and survives restarts; rows from an earlier
//! run keep accumulating under the same bucket keys.

use super::types::{TallyIncrement, TallyPeriod, TallyRow};
use crate::types::{decode_payload, encode_payload, EventId};
use chrono::NaiveDate;
use log::{debug, warn};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row, Transaction};
use std::path::{Path, PathBuf};

pub const TALLY_DB_NAME: &str = "aggregate-events.db";

/// "emer" in ASCII.
const APPLICATION_ID: i64 = 0x656d_6572;
const SCHEMA_VERSION: i64 = 1;

const UPSERT_SQL: &str = "INSERT INTO tally (date, event_id, unix_user_id, payload, counter)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT (date, event_id, unix_user_id, payload)
     DO UPDATE SET counter = tally.counter + excluded.counter";

const SELECT_COLUMNS: &str = "SELECT id, event_id, date, unix_user_id, payload, counter FROM tally";

pub struct TallyStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for TallyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TallyStore").field("path", &self.path).finish()
    }
}

impl TallyStore {
    /// Opens or creates the tally database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {}", e))?;
        }

        let conn = Connection::open(&path)
            .map_err(|e| format!("Failed to open tally database: {}", e))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| format!("Failed to enable WAL: {}", e))?;
        conn.pragma_update(None, "application_id", APPLICATION_ID)
            .map_err(|e| format!("Failed to set application id: {}", e))?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(|e| format!("Failed to set schema version: {}", e))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tally (
                id INTEGER PRIMARY KEY ASC,
                date TEXT NOT NULL,
                event_id BLOB NOT NULL CHECK (length(event_id) = 16),
                unix_user_id INT NOT NULL,
                payload BLOB NOT NULL,
                counter INT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS ix_tally_unique_fields
                ON tally (date, event_id, unix_user_id, payload);",
        )
        .map_err(|e| format!("Failed to create tally table: {}", e))?;

        Ok(TallyStore {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds `amount` to the day bucket of the event and to the month bucket
    /// of its derived monthly id.
    pub fn increment(&self, increment: &TallyIncrement) -> Result<(), String> {
        self.commit(std::slice::from_ref(increment))
    }

    /// Applies a batch of increments in a single transaction.
    ///
    /// Each increment adds to two rows: the day bucket of its event id and
    /// the month bucket of the derived monthly id. Stored sums may exceed
    /// `u32::MAX`; reads saturate.
    ///
    /// # Arguments
    /// - `increments`: Amounts to add; an empty slice is a no-op
    ///
    /// # Returns
    /// `Ok(())` once the transaction commits. On error nothing is applied.
    ///
    /// # Example
    /// ```rust,ignore
    /// store.commit(&[TallyIncrement {
    ///     event_id,
    ///     date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
    ///     unix_user_id: 1000,
    ///     payload: None,
    ///     amount: 5,
    /// }])?;
    /// assert_eq!(store.row_count()?, 2);
    /// ```
    pub fn commit(&self, increments: &[TallyIncrement]) -> Result<(), String> {
        if increments.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| format!("Failed to begin tally transaction: {}", e))?;

        for increment in increments {
            let payload = encode_payload(&increment.payload)?;
            upsert(
                &tx,
                &TallyPeriod::Day.bucket_key(increment.date),
                &increment.event_id,
                increment.unix_user_id,
                &payload,
                increment.amount,
            )?;
            upsert(
                &tx,
                &TallyPeriod::Month.bucket_key(increment.date),
                &increment.event_id.monthly(),
                increment.unix_user_id,
                &payload,
                increment.amount,
            )?;
        }

        tx.commit()
            .map_err(|e| format!("Failed to commit tally transaction: {}", e))?;
        debug!("Committed {} tally increment(s)", increments.len());
        Ok(())
    }

    /// Every row, ordered by event id then bucket.
    pub fn read_all(&self) -> Result<Vec<TallyRow>, String> {
        self.query(
            &format!(
                "{} ORDER BY event_id, date, unix_user_id, payload",
                SELECT_COLUMNS
            ),
            params![],
        )
    }

    /// Rows in the bucket of `period` containing `date`.
    pub fn read_bucket(&self, period: TallyPeriod, date: NaiveDate) -> Result<Vec<TallyRow>, String> {
        self.query(
            &format!("{} WHERE date = ?1 ORDER BY event_id, unix_user_id", SELECT_COLUMNS),
            params![period.bucket_key(date)],
        )
    }

    /// Rows of `period` whose bucket closed before the bucket containing `date`.
    pub fn rows_before(&self, period: TallyPeriod, date: NaiveDate) -> Result<Vec<TallyRow>, String> {
        self.query(
            &format!(
                "{} WHERE length(date) = length(?1) AND date < ?1 ORDER BY event_id, date",
                SELECT_COLUMNS
            ),
            params![period.bucket_key(date)],
        )
    }

    /// Subtracts the counters of previously read rows and deletes rows that
    /// reach zero. Increments that landed after the read are preserved.
    pub fn settle(&self, rows: &[TallyRow]) -> Result<(), String> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| format!("Failed to begin settle transaction: {}", e))?;
        {
            let mut update = tx
                .prepare_cached("UPDATE tally SET counter = counter - ?2 WHERE id = ?1")
                .map_err(|e| format!("Failed to prepare settle: {}", e))?;
            for row in rows {
                update
                    .execute(params![row.id, row.counter as i64])
                    .map_err(|e| format!("Failed to settle tally row {}: {}", row.id, e))?;
            }
        }
        tx.execute("DELETE FROM tally WHERE counter <= 0", [])
            .map_err(|e| format!("Failed to delete settled rows: {}", e))?;
        tx.commit()
            .map_err(|e| format!("Failed to commit settle transaction: {}", e))
    }

    pub fn clear_all(&self) -> Result<(), String> {
        self.conn
            .lock()
            .execute("DELETE FROM tally", [])
            .map(|_| ())
            .map_err(|e| format!("Failed to clear tally: {}", e))
    }

    pub fn row_count(&self) -> Result<usize, String> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM tally", [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
            .map_err(|e| format!("Failed to count tally rows: {}", e))
    }

    fn query(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<TallyRow>, String> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| format!("Failed to prepare tally query: {}", e))?;
        let raw = stmt
            .query_map(args, read_raw_row)
            .map_err(|e| format!("Failed to query tally: {}", e))?;

        let mut rows = Vec::new();
        for item in raw {
            let raw = item.map_err(|e| format!("Failed to read tally row: {}", e))?;
            match raw.into_row() {
                Ok(row) => rows.push(row),
                Err(e) => warn!("Skipping unreadable tally row: {}", e),
            }
        }
        Ok(rows)
    }
}

fn upsert(
    tx: &Transaction<'_>,
    date: &str,
    event_id: &EventId,
    unix_user_id: u32,
    payload: &[u8],
    amount: u32,
) -> Result<(), String> {
    tx.prepare_cached(UPSERT_SQL)
        .and_then(|mut stmt| {
            stmt.execute(params![
                date,
                &event_id.as_bytes()[..],
                unix_user_id,
                payload,
                amount
            ])
        })
        .map(|_| ())
        .map_err(|e| format!("Failed to upsert tally row: {}", e))
}

struct RawRow {
    id: i64,
    event_id: Vec<u8>,
    date: String,
    unix_user_id: i64,
    payload: Vec<u8>,
    counter: i64,
}

fn read_raw_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        event_id: row.get(1)?,
        date: row.get(2)?,
        unix_user_id: row.get(3)?,
        payload: row.get(4)?,
        counter: row.get(5)?,
    })
}

impl RawRow {
    fn into_row(self) -> Result<TallyRow, String> {
        Ok(TallyRow {
            id: self.id,
            event_id: EventId::from_slice(&self.event_id)?,
            bucket_key: self.date,
            unix_user_id: self.unix_user_id.clamp(0, u32::MAX as i64) as u32,
            payload: decode_payload(&self.payload)?,
            counter: self.counter.clamp(0, u32::MAX as i64) as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PayloadValue;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn event() -> EventId {
        EventId::parse_str("8dc4a85c-4d5d-4ccc-8a95-eb7e8bd8ef7b").unwrap()
    }

    fn inc(date: NaiveDate, amount: u32) -> TallyIncrement {
        TallyIncrement {
            event_id: event(),
            date,
            unix_user_id: 1000,
            payload: None,
            amount,
        }
    }

    #[test]
    fn test_increment_writes_day_and_month() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let store = TallyStore::open(tmp_dir.path().join(TALLY_DB_NAME)).unwrap();

        store.increment(&inc(day(2024, 5, 3), 7)).unwrap();
        store.increment(&inc(day(2024, 5, 3), 5)).unwrap();

        let rows = store.read_all().unwrap();
        assert_eq!(rows.len(), 2);
        let day_row = rows.iter().find(|r| r.event_id == event()).unwrap();
        let month_row = rows.iter().find(|r| r.event_id == event().monthly()).unwrap();
        assert_eq!(day_row.bucket_key, "2024-05-03");
        assert_eq!(day_row.counter, 12);
        assert_eq!(month_row.bucket_key, "2024-05");
        assert_eq!(month_row.counter, 12);
    }

    #[test]
    fn test_rows_survive_reopen() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join(TALLY_DB_NAME);
        {
            let store = TallyStore::open(&path).unwrap();
            store.increment(&inc(day(2024, 5, 3), 3)).unwrap();
        }
        let store = TallyStore::open(&path).unwrap();
        store.increment(&inc(day(2024, 5, 3), 4)).unwrap();
        let rows = store.read_bucket(TallyPeriod::Day, day(2024, 5, 3)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].counter, 7);
    }

    #[test]
    fn test_payload_distinguishes_rows() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let store = TallyStore::open(tmp_dir.path().join(TALLY_DB_NAME)).unwrap();

        let mut with_false = inc(day(2024, 5, 3), 1);
        with_false.payload = Some(PayloadValue::Bool(false));
        store
            .commit(&[inc(day(2024, 5, 3), 1), with_false])
            .unwrap();

        let rows = store.read_bucket(TallyPeriod::Day, day(2024, 5, 3)).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.payload.is_none()));
        assert!(rows
            .iter()
            .any(|r| r.payload == Some(PayloadValue::Bool(false))));
    }

    #[test]
    fn test_rows_before_and_settle() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let store = TallyStore::open(tmp_dir.path().join(TALLY_DB_NAME)).unwrap();

        store.increment(&inc(day(2024, 4, 30), 10)).unwrap();
        store.increment(&inc(day(2024, 5, 1), 2)).unwrap();

        let today = day(2024, 5, 1);
        let old_days = store.rows_before(TallyPeriod::Day, today).unwrap();
        assert_eq!(old_days.len(), 1);
        assert_eq!(old_days[0].bucket_key, "2024-04-30");

        let old_months = store.rows_before(TallyPeriod::Month, today).unwrap();
        assert_eq!(old_months.len(), 1);
        assert_eq!(old_months[0].bucket_key, "2024-04");

        // An increment landing between read and settle survives.
        store.increment(&inc(day(2024, 4, 30), 1)).unwrap();
        store.settle(&old_days).unwrap();

        let remaining = store.read_bucket(TallyPeriod::Day, day(2024, 4, 30)).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].counter, 1);

        store.settle(&old_months).unwrap();
        let month = store.read_bucket(TallyPeriod::Month, day(2024, 4, 1)).unwrap();
        assert_eq!(month[0].counter, 1);
    }

    #[test]
    fn test_counter_saturates_on_read() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let store = TallyStore::open(tmp_dir.path().join(TALLY_DB_NAME)).unwrap();

        store.increment(&inc(day(2024, 5, 3), u32::MAX)).unwrap();
        store.increment(&inc(day(2024, 5, 3), u32::MAX)).unwrap();

        let rows = store.read_all().unwrap();
        assert!(rows.iter().all(|r| r.counter == u32::MAX));
    }

    #[test]
    fn test_clear_all() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let store = TallyStore::open(tmp_dir.path().join(TALLY_DB_NAME)).unwrap();
        store.increment(&inc(day(2024, 5, 3), 1)).unwrap();
        assert_eq!(store.row_count().unwrap(), 2);
        store.clear_all().unwrap();
        assert_eq!(store.row_count().unwrap(), 0);
    }
}
