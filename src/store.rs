//! Module `store` own the persistent layout of a table.
//!
//! Three relations per table file: `_data` holds the documents, keyed
//! by `_id` and stamped with a strictly increasing `last_updated`;
//! `_index` holds the packed secondary rows `(idata, rowref)`;
//! `_indexes` is the index catalog. Everything here is row-level
//! plumbing over those relations, consumed by [crate::table].

use rusqlite::{params, Connection, OptionalExtension};

use std::{
    cmp,
    convert::TryFrom,
    sync::atomic::{AtomicI64, Ordering::SeqCst},
    time,
};

use crate::{Error, Result};

/// Watermark value meaning "fully caught up".
pub const SENTINEL_MAX: i64 = i64::MAX;

/// Catalog flag bit: index is being drained and purged.
pub const FLAG_DELETING: i64 = 0x1;

const DDL: &str = "
CREATE TABLE IF NOT EXISTS _data (
    rowid INTEGER PRIMARY KEY,
    _id TEXT UNIQUE NOT NULL,
    data TEXT NOT NULL,
    last_updated INTEGER UNIQUE NOT NULL
);
CREATE TABLE IF NOT EXISTS _index (
    rowid INTEGER PRIMARY KEY,
    idata BLOB NOT NULL,
    rowref TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS _index_idata ON _index (idata);
CREATE INDEX IF NOT EXISTS _index_irowref ON _index (rowref);
CREATE TABLE IF NOT EXISTS _indexes (
    index_id INTEGER PRIMARY KEY,
    columns TEXT UNIQUE NOT NULL,
    flags INTEGER NOT NULL,
    last_indexed INTEGER NOT NULL
);
";

/// Create the three relations and their secondary indexes, idempotent.
pub fn init_schema(conn: &Connection) -> Result<()> {
    err_at!(SQLError, conn.execute_batch(DDL))
}

/// One row of the `_indexes` catalog.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexState {
    pub index_id: i64,
    pub columns: String,
    pub flags: i64,
    pub last_indexed: i64,
}

impl IndexState {
    pub fn is_deleting(&self) -> bool {
        self.flags & FLAG_DELETING != 0
    }

    pub fn is_pending(&self) -> bool {
        !self.is_deleting() && self.last_indexed < SENTINEL_MAX
    }
}

/// Monotonic write-stamp source for `_data.last_updated`.
///
/// Stamps are `max(previous + 1, wall_clock)` where the wall clock is
/// scaled to 2^22 units per second, roughly 0.24 microsecond
/// resolution. Strictly increasing for a single writer, never wraps,
/// and leaves better than four million stamps per second of headroom.
pub struct TimeSeq {
    last: AtomicI64,
}

impl TimeSeq {
    /// `seed` should be the largest stamp already persisted, so a
    /// re-opened table keeps ascending across clock regressions.
    pub fn new(seed: i64) -> TimeSeq {
        TimeSeq {
            last: AtomicI64::new(seed),
        }
    }

    pub fn next(&self) -> Result<i64> {
        let now = err_at!(Fatal, time::SystemTime::now().duration_since(time::UNIX_EPOCH))?;
        let micros = match i64::try_from(now.as_micros()) {
            Ok(micros) => micros,
            Err(err) => return err_at!(FailConvert, msg: "epoch micros {}", err),
        };
        let base = ((micros as i128) * (1 << 22) / 1_000_000) as i64;
        loop {
            let prev = self.last.load(SeqCst);
            let next = cmp::max(prev + 1, base);
            if self.last.compare_exchange(prev, next, SeqCst, SeqCst).is_ok() {
                break Ok(next);
            }
        }
    }
}

// PRAGMA statements may or may not return rows depending on the
// statement and the sqlite version, so prepare and drain.
pub fn pragma_update(conn: &Connection, text: &str) -> Result<()> {
    let sql = format!("PRAGMA {}", text);
    let mut stmt = err_at!(SQLError, conn.prepare(&sql))?;
    let mut rows = err_at!(SQLError, stmt.query([]))?;
    while let Some(_) = err_at!(SQLError, rows.next())? {}
    Ok(())
}

pub fn pragma_read(conn: &Connection, name: &str) -> Result<i64> {
    let sql = format!("PRAGMA {}", name);
    err_at!(SQLError, conn.query_row(&sql, [], |row| row.get(0)))
}

pub fn vacuum(conn: &Connection) -> Result<()> {
    err_at!(SQLError, conn.execute_batch("VACUUM"))
}

//--- _data

pub fn insert_data(conn: &Connection, id: &str, data: &str, stamp: i64) -> Result<()> {
    let sql = "INSERT INTO _data (_id, data, last_updated) VALUES (?1, ?2, ?3)";
    err_at!(SQLError, conn.execute(sql, params![id, data, stamp]))?;
    Ok(())
}

pub fn update_data(conn: &Connection, id: &str, data: &str, stamp: i64) -> Result<usize> {
    let sql = "UPDATE _data SET data = ?2, last_updated = ?3 WHERE _id = ?1";
    err_at!(SQLError, conn.execute(sql, params![id, data, stamp]))
}

pub fn delete_data(conn: &Connection, id: &str) -> Result<usize> {
    err_at!(SQLError, conn.execute("DELETE FROM _data WHERE _id = ?1", params![id]))
}

pub fn get_data(conn: &Connection, id: &str) -> Result<Option<String>> {
    let sql = "SELECT data FROM _data WHERE _id = ?1";
    let res = conn.query_row(sql, params![id], |row| row.get(0)).optional();
    err_at!(SQLError, res)
}

pub fn max_last_updated(conn: &Connection) -> Result<Option<i64>> {
    let sql = "SELECT MAX(last_updated) FROM _data";
    err_at!(SQLError, conn.query_row(sql, [], |row| row.get(0)))
}

/// Forward scan: up to `limit` documents stamped after `cursor`,
/// ascending by stamp. Returns `(_id, data, last_updated)` triples.
pub fn data_after(conn: &Connection, cursor: i64, limit: usize) -> Result<Vec<(String, String, i64)>> {
    let sql = "SELECT _id, data, last_updated FROM _data \
               WHERE last_updated > ?1 ORDER BY last_updated LIMIT ?2";
    let mut stmt = err_at!(SQLError, conn.prepare(sql))?;
    let iter = err_at!(
        SQLError,
        stmt.query_map(params![cursor, limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
    )?;
    let mut out = vec![];
    for row in iter {
        out.push(err_at!(SQLError, row)?);
    }
    Ok(out)
}

//--- _index

pub fn insert_index_rows<R>(conn: &Connection, index_rows: &[R], rowref: &str) -> Result<()>
where
    R: AsRef<[u8]>,
{
    let sql = "INSERT INTO _index (idata, rowref) VALUES (?1, ?2)";
    let mut stmt = err_at!(SQLError, conn.prepare(sql))?;
    for row in index_rows.iter() {
        err_at!(SQLError, stmt.execute(params![row.as_ref(), rowref]))?;
    }
    Ok(())
}

/// Existing index rows for a document, as `(idata, rowid)` pairs.
pub fn index_rows_for(conn: &Connection, rowref: &str) -> Result<Vec<(Vec<u8>, i64)>> {
    let sql = "SELECT idata, rowid FROM _index WHERE rowref = ?1";
    let mut stmt = err_at!(SQLError, conn.prepare(sql))?;
    let iter = err_at!(
        SQLError,
        stmt.query_map(params![rowref], |row| Ok((row.get(0)?, row.get(1)?)))
    )?;
    let mut out = vec![];
    for row in iter {
        out.push(err_at!(SQLError, row)?);
    }
    Ok(out)
}

pub fn delete_index_rows(conn: &Connection, rowids: &[i64]) -> Result<()> {
    let sql = "DELETE FROM _index WHERE rowid = ?1";
    let mut stmt = err_at!(SQLError, conn.prepare(sql))?;
    for rowid in rowids.iter() {
        err_at!(SQLError, stmt.execute(params![rowid]))?;
    }
    Ok(())
}

pub fn delete_index_by_rowref(conn: &Connection, rowref: &str) -> Result<usize> {
    err_at!(
        SQLError,
        conn.execute("DELETE FROM _index WHERE rowref = ?1", params![rowref])
    )
}

/// Bounded range delete over `idata`, at most `limit` rows: probe the
/// row at OFFSET `limit` and pull the end of the range in to it, then
/// delete the range. Returns the number of rows deleted.
pub fn delete_index_range(conn: &Connection, start: &[u8], end: &[u8], limit: usize) -> Result<usize> {
    let sql = format!(
        "SELECT idata FROM _index WHERE idata >= ?1 AND idata < ?2 LIMIT 1 OFFSET {}",
        limit
    );
    let probe: Option<Vec<u8>> = err_at!(
        SQLError,
        conn.query_row(&sql, params![start, end], |row| row.get(0)).optional()
    )?;
    let end: &[u8] = match probe.as_ref() {
        Some(idata) => idata,
        None => end,
    };
    err_at!(
        SQLError,
        conn.execute(
            "DELETE FROM _index WHERE idata >= ?1 AND idata < ?2",
            params![start, end]
        )
    )
}

//--- _indexes

pub fn select_catalog(conn: &Connection) -> Result<Vec<IndexState>> {
    let sql = "SELECT index_id, columns, flags, last_indexed FROM _indexes ORDER BY index_id";
    let mut stmt = err_at!(SQLError, conn.prepare(sql))?;
    let iter = err_at!(
        SQLError,
        stmt.query_map([], |row| {
            Ok(IndexState {
                index_id: row.get(0)?,
                columns: row.get(1)?,
                flags: row.get(2)?,
                last_indexed: row.get(3)?,
            })
        })
    )?;
    let mut out = vec![];
    for state in iter {
        out.push(err_at!(SQLError, state)?);
    }
    Ok(out)
}

pub fn max_index_id(conn: &Connection) -> Result<Option<i64>> {
    let sql = "SELECT MAX(index_id) FROM _indexes";
    err_at!(SQLError, conn.query_row(sql, [], |row| row.get(0)))
}

pub fn insert_catalog(conn: &Connection, index_id: i64, columns: &str) -> Result<()> {
    let sql = "INSERT INTO _indexes (index_id, columns, flags, last_indexed) VALUES (?1, ?2, 0, 0)";
    err_at!(SQLError, conn.execute(sql, params![index_id, columns]))?;
    Ok(())
}

pub fn set_deleting(conn: &Connection, index_id: i64) -> Result<usize> {
    let sql = "UPDATE _indexes SET flags = flags | ?2 WHERE index_id = ?1";
    err_at!(SQLError, conn.execute(sql, params![index_id, FLAG_DELETING]))
}

pub fn purge_catalog(conn: &Connection, index_id: i64) -> Result<usize> {
    err_at!(
        SQLError,
        conn.execute("DELETE FROM _indexes WHERE index_id = ?1", params![index_id])
    )
}

/// Smallest watermark among live, not yet caught-up indexes.
pub fn min_pending_watermark(conn: &Connection) -> Result<Option<i64>> {
    let sql = "SELECT MIN(last_indexed) FROM _indexes \
               WHERE (flags & ?1) = 0 AND last_indexed < ?2";
    err_at!(
        SQLError,
        conn.query_row(sql, params![FLAG_DELETING, SENTINEL_MAX], |row| row.get(0))
    )
}

/// Move every live catalog row sitting at watermark `from` up to `to`.
pub fn advance_watermark(conn: &Connection, from: i64, to: i64) -> Result<usize> {
    let sql = "UPDATE _indexes SET last_indexed = ?2 \
               WHERE last_indexed = ?1 AND (flags & ?3) = 0";
    err_at!(SQLError, conn.execute(sql, params![from, to, FLAG_DELETING]))
}

#[cfg(test)]
#[path = "store_test.rs"]
mod store_test;
