use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::ids::{DeviceId, ServiceId, ThreadId};
use crate::store::{content_hash, PayloadId, PayloadLog};

/// Payload log schema version. Bump when the schema changes.
const PAYLOAD_SCHEMA_VERSION: i64 = 1;

/// [`PayloadLog`] backed by `SQLite`.
pub struct SqlitePayloadLog {
    conn: Mutex<Connection>,
}

impl SqlitePayloadLog {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let current: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);
        if current != PAYLOAD_SCHEMA_VERSION {
            if current != 0 {
                tracing::info!(
                    old = current,
                    new = PAYLOAD_SCHEMA_VERSION,
                    "payload log schema version mismatch, recreating"
                );
                conn.execute_batch(
                    "DROP TABLE IF EXISTS pending_deliveries; DROP TABLE IF EXISTS payloads;",
                )?;
            }
            conn.execute_batch(include_str!("../../migrations/001_payload_log.sql"))?;
            conn.pragma_update(None, "user_version", PAYLOAD_SCHEMA_VERSION)?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn to_sql_u64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Backend(format!("{value} out of range")))
}

impl PayloadLog for SqlitePayloadLog {
    fn record_payload(
        &self,
        thread: &ThreadId,
        timestamp: u64,
        plaintext: &[u8],
        urgent: bool,
    ) -> Result<PayloadId, StoreError> {
        let timestamp = to_sql_u64(timestamp)?;
        let hash = content_hash(plaintext);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO payloads (thread_id, timestamp, content_hash, plaintext, urgent)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![thread.as_str(), timestamp, hash, plaintext, urgent],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM payloads WHERE thread_id = ?1 AND timestamp = ?2 AND content_hash = ?3",
            params![thread.as_str(), timestamp, hash],
            |row| row.get(0),
        )?;
        Ok(PayloadId(id))
    }

    fn record_pending_delivery(
        &self,
        payload: PayloadId,
        recipient: &ServiceId,
        devices: &[DeviceId],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for device in devices {
            tx.execute(
                "INSERT OR IGNORE INTO pending_deliveries (payload_id, recipient, device_id)
                 VALUES (?1, ?2, ?3)",
                params![payload.0, recipient.as_str(), device],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn record_successful_delivery(
        &self,
        payload: PayloadId,
        recipient: &ServiceId,
        device: DeviceId,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM pending_deliveries
             WHERE payload_id = ?1 AND recipient = ?2 AND device_id = ?3",
            params![payload.0, recipient.as_str(), device],
        )?;
        tx.execute(
            "DELETE FROM payloads WHERE id = ?1
             AND NOT EXISTS (SELECT 1 FROM pending_deliveries WHERE payload_id = ?1)",
            params![payload.0],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn payload(&self, payload: PayloadId) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT plaintext FROM payloads WHERE id = ?1",
                params![payload.0],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn pending_deliveries(
        &self,
        payload: PayloadId,
    ) -> Result<Vec<(ServiceId, DeviceId)>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT recipient, device_id FROM pending_deliveries
             WHERE payload_id = ?1 ORDER BY recipient, device_id",
        )?;
        let rows = stmt
            .query_map(params![payload.0], |row| {
                Ok((ServiceId::new(row.get::<_, String>(0)?), row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
