//! Standalone query functions for the durable queues.
//!
//! Each function takes a `&Connection` as its first parameter and is meant to
//! run inside `AsyncDatabase::call`.

use crate::{DatabaseError, DatabaseResult, DurableRecord, NewDurableRecord, QueueKind};
use rusqlite::{params, Connection, Row};
use serde_json::{Map, Value};
use tracing::debug;

// ==========================================
// Append
// ==========================================

/// Persist one record at the tail of `kind`. Returns its sequence number.
pub fn append_record(conn: &Connection, kind: QueueKind, record: &NewDurableRecord) -> DatabaseResult<i64> {
    let params_json = serde_json::to_string(&record.params)?;
    let sql = format!(
        "INSERT INTO {} (url, params, captured_at, request_type) VALUES (?1, ?2, ?3, ?4)",
        kind.table()
    );
    conn.prepare_cached(&sql)?.execute(params![
        record.url,
        params_json,
        record.captured_at,
        record.request_type,
    ])?;

    let seq = conn.last_insert_rowid();
    debug!(queue = %kind, seq, request_type = record.request_type, "Durable record appended");
    Ok(seq)
}

// ==========================================
// Read / drain
// ==========================================

/// All records in `kind`, oldest first, without removing them.
pub fn list_records(conn: &Connection, kind: QueueKind) -> DatabaseResult<Vec<DurableRecord>> {
    let sql = format!(
        "SELECT seq, url, params, captured_at, request_type FROM {} ORDER BY seq ASC",
        kind.table()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map([], raw_record)?;

    let mut records = Vec::new();
    for row in rows {
        records.push(decode_record(row?)?);
    }
    Ok(records)
}

/// Remove and return every record in `kind`, oldest first.
///
/// Runs as one transaction: the rows read are exactly the rows deleted, so a
/// record is either in this drain or left for the next one.
pub fn drain_records(conn: &Connection, kind: QueueKind) -> DatabaseResult<Vec<DurableRecord>> {
    let tx = conn.unchecked_transaction()?;
    let records = list_records(&tx, kind)?;

    if let Some(last) = records.last() {
        let sql = format!("DELETE FROM {} WHERE seq <= ?1", kind.table());
        tx.execute(&sql, params![last.seq])?;
    }
    tx.commit()?;

    debug!(queue = %kind, drained = records.len(), "Durable queue drained");
    Ok(records)
}

/// Number of records waiting in `kind`.
pub fn count_records(conn: &Connection, kind: QueueKind) -> DatabaseResult<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", kind.table());
    Ok(conn.query_row(&sql, [], |row| row.get(0))?)
}

/// Record counts per request-type code, lowest code first.
pub fn count_by_request_type(conn: &Connection, kind: QueueKind) -> DatabaseResult<Vec<(i32, i64)>> {
    let sql = format!(
        "SELECT request_type, COUNT(*) FROM {} GROUP BY request_type ORDER BY request_type",
        kind.table()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let counts = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(counts)
}

/// Delete everything in `kind`. Returns the number of rows removed.
pub fn clear_records(conn: &Connection, kind: QueueKind) -> DatabaseResult<usize> {
    let sql = format!("DELETE FROM {}", kind.table());
    let removed = conn.execute(&sql, [])?;
    debug!(queue = %kind, removed, "Durable queue cleared");
    Ok(removed)
}

// ==========================================
// Row mapping
// ==========================================

type RawRecord = (i64, String, String, i64, i32);

fn raw_record(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_record((seq, url, params_json, captured_at, request_type): RawRecord) -> DatabaseResult<DurableRecord> {
    let params: Map<String, Value> = match serde_json::from_str(&params_json)? {
        Value::Object(map) => map,
        other => {
            return Err(DatabaseError::InvalidData(format!(
                "record {seq} params is not an object: {other}"
            )))
        }
    };

    Ok(DurableRecord {
        seq,
        url,
        params,
        captured_at,
        request_type,
    })
}
