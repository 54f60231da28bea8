//! Module `table` implement the single-table storage and indexing
//! adapter.
//!
//! A [TableAdapter] owns one SQLite file holding the `_data`, `_index`
//! and `_indexes` relations, and serves CRUD, catalog changes and
//! filtered queries over them. Secondary-index convergence is split
//! into three maintenance passes (`index_pass`, `drop_pass`,
//! `vacuum_pass`), scheduled by the table's worker between requests.
//! The adapter itself is strictly single-threaded; concurrency lives
//! with [crate::worker].

use log::{info, warn};
use rusqlite::Connection;
use uuid::Uuid;

use std::{
    cmp,
    collections::{BTreeMap, BTreeSet},
    ffi, fs, thread, time,
};

use crate::{
    config::{AutoVacuum, Config},
    pack,
    plan::{self, Filter, Limit},
    rows, store,
    store::{IndexState, TimeSeq, SENTINEL_MAX},
    value::{self, Document, Value, ID_FIELD},
    Error, Result,
};

/// Outcome of one unit of drop-drain work.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DropPass {
    /// Nothing to drain.
    Idle,
    /// Deleted this many rows of the index being drained.
    Deleted(usize),
    /// The drained index's catalog row was purged.
    Purged(i64),
}

/// Table statistics, as returned by the `info` operation.
#[derive(Clone, Debug, PartialEq)]
pub struct TableInfo {
    pub indexes: Vec<String>,
    pub indexes_add: Vec<String>,
    pub indexes_del: Vec<i64>,
    pub disk_size: u64,
    pub page_size: i64,
    pub page_count: i64,
    pub freelist_count: i64,
    pub total_size: i64,
    pub unused_size: i64,
    pub cache_size: i64,
    pub auto_vacuum: i64,
}

/// Single-table document store with secondary indexes.
pub struct TableAdapter {
    name: String,
    dbfile: ffi::OsString,
    config: Config,
    conn: Connection,
    seq: TimeSeq,
    drop_key: Option<String>,

    // catalog cache, rebuilt on every catalog mutation
    known_indexes: Vec<String>,
    indexes_to_ids: BTreeMap<String, i64>,
    ready_indexes: BTreeMap<String, i64>,
    indexes_in_progress: BTreeMap<String, i64>,
    indexes_being_removed: Vec<i64>,
}

impl TableAdapter {
    /// Open (or create) the table `name` under `config.path`.
    pub fn open(config: Config, name: &str) -> Result<TableAdapter> {
        config.validate()?;
        let dbfile = config.to_dbfile(name);
        let conn = err_at!(SQLError, Connection::open(&dbfile), "open {:?}", dbfile)?;

        store::pragma_update(&conn, &format!("page_size = {}", config.block_size))?;
        store::pragma_update(&conn, &format!("cache_size = {}", config.cache_size))?;
        let on_disk = store::pragma_read(&conn, "auto_vacuum")?;
        store::pragma_update(&conn, &format!("auto_vacuum = {}", config.autovacuum.to_pragma()))?;
        if (on_disk == 0) != (config.autovacuum == AutoVacuum::None) {
            // flipping the vacuum mode only takes effect after a full pass
            store::vacuum(&conn)?;
        }
        store::init_schema(&conn)?;

        let seed = store::max_last_updated(&conn)?.unwrap_or(0);
        let mut table = TableAdapter {
            name: name.to_string(),
            dbfile,
            config,
            conn,
            seq: TimeSeq::new(seed),
            drop_key: None,
            known_indexes: vec![],
            indexes_to_ids: BTreeMap::new(),
            ready_indexes: BTreeMap::new(),
            indexes_in_progress: BTreeMap::new(),
            indexes_being_removed: vec![],
        };
        table.refresh_indexes()?;
        info!(target: "yogatable", "opened table {:?}", table.dbfile);
        Ok(table)
    }

    fn refresh_indexes(&mut self) -> Result<()> {
        let states: Vec<IndexState> = store::select_catalog(&self.conn)?;

        self.known_indexes.clear();
        self.indexes_to_ids.clear();
        self.ready_indexes.clear();
        self.indexes_in_progress.clear();
        self.indexes_being_removed.clear();

        for state in states.into_iter() {
            if state.is_deleting() {
                self.indexes_being_removed.push(state.index_id);
            } else if state.last_indexed < SENTINEL_MAX {
                self.indexes_in_progress.insert(state.columns.clone(), state.index_id);
            } else {
                self.ready_indexes.insert(state.columns.clone(), state.index_id);
            }
            self.known_indexes.push(state.columns.clone());
            self.indexes_to_ids.insert(state.columns, state.index_id);
        }
        self.known_indexes.sort();
        Ok(())
    }

    pub fn to_name(&self) -> String {
        self.name.clone()
    }

    pub fn as_known_indexes(&self) -> &[String] {
        &self.known_indexes
    }

    pub fn as_indexes_in_progress(&self) -> &BTreeMap<String, i64> {
        &self.indexes_in_progress
    }

    pub fn as_indexes_being_removed(&self) -> &[i64] {
        &self.indexes_being_removed
    }
}

// canonical column-list handling
impl TableAdapter {
    // validate the column descriptors and render the canonical form,
    // comma-joined with a trailing comma.
    fn col_def(&self, columns: &[String]) -> Result<String> {
        if columns.is_empty() {
            return err_at!(IndexWarning, msg: "cannot create null index");
        }
        let mut cols = vec![];
        for column in columns.iter() {
            plan::validate_column(column)?;
            cols.push(column.trim_matches('+').to_string());
        }
        let bases: BTreeSet<&str> = cols.iter().map(|c| c.trim_matches('-')).collect();
        if bases.len() != cols.len() {
            return err_at!(DuplicateIndex, msg: "cannot list the same column twice in an index");
        }
        let mut out = cols.join(",");
        out.push(',');
        Ok(out)
    }
}

// document operations
impl TableAdapter {
    /// Insert a document. Assigns a time-ordered id when `_id` is
    /// absent. Index rows are generated for every caught-up live
    /// index; not-yet-caught-up indexes pick the document up by its
    /// `last_updated` stamp instead. Returns the id, the logical row
    /// count and the number of rows actually written.
    pub fn insert(&mut self, doc: Document) -> Result<(String, usize, usize)> {
        let mut res = self.insert_many(vec![doc])?;
        Ok(res.remove(0))
    }

    /// Insert a batch of documents in one transaction: all of them, or
    /// none of them.
    pub fn insert_many(&mut self, docs: Vec<Document>) -> Result<Vec<(String, usize, usize)>> {
        let mut ret = vec![];
        let mut writes = vec![];
        for mut doc in docs.into_iter() {
            let id = match doc.remove(ID_FIELD) {
                Some(Value::Str(id)) => id,
                Some(val) => return err_at!(FailConvert, msg: "_id must be text, got {:?}", val),
                None => new_id(),
            };
            let (count, index_rows) =
                rows::generate_index_rows(&doc, &self.ready_indexes, &self.config)?;
            let data = value::encode(&doc)?;
            let stamp = self.seq.next()?;
            ret.push((id.clone(), count, index_rows.len()));
            writes.push((id, data, stamp, index_rows));
        }

        let tx = err_at!(SQLError, self.conn.transaction())?;
        for (id, data, stamp, index_rows) in writes.iter() {
            store::insert_data(&tx, id, data, *stamp)?;
            store::insert_index_rows(&tx, index_rows, id)?;
        }
        err_at!(SQLError, tx.commit())?;
        Ok(ret)
    }

    /// Update a document in place; requires `_id`. Existing index rows
    /// are diffed against the regenerated set and reconciled in the
    /// same transaction as the document write.
    pub fn update(&mut self, doc: Document) -> Result<()> {
        self.update_rows(doc, false)
    }

    /// Reconcile index rows for the in-progress indexes only, without
    /// touching the document. This is the maintainer's entry point.
    pub fn update_index_only(&mut self, doc: Document) -> Result<()> {
        self.update_rows(doc, true)
    }

    fn update_rows(&mut self, mut doc: Document, index_only: bool) -> Result<()> {
        let id = match doc.remove(ID_FIELD) {
            Some(Value::Str(id)) => id,
            _ => return err_at!(InvalidOperation, msg: "update requires _id"),
        };
        let indexes = if index_only { &self.indexes_in_progress } else { &self.ready_indexes };
        let (_, new_rows) = rows::generate_index_rows(&doc, indexes, &self.config)?;
        let new_keys: BTreeSet<Vec<u8>> = new_rows.into_iter().collect();
        let (data, stamp) = if index_only {
            (None, None)
        } else {
            (Some(value::encode(&doc)?), Some(self.seq.next()?))
        };

        let tx = err_at!(SQLError, self.conn.transaction())?;
        let existing: BTreeMap<Vec<u8>, i64> = store::index_rows_for(&tx, &id)?.into_iter().collect();
        let to_add: Vec<&Vec<u8>> = new_keys.iter().filter(|k| !existing.contains_key(*k)).collect();
        if let (Some(data), Some(stamp)) = (data, stamp) {
            store::update_data(&tx, &id, &data, stamp)?;
            let to_remove: Vec<i64> = existing
                .iter()
                .filter(|(k, _)| !new_keys.contains(*k))
                .map(|(_, rowid)| *rowid)
                .collect();
            store::delete_index_rows(&tx, &to_remove)?;
        }
        store::insert_index_rows(&tx, &to_add, &id)?;
        err_at!(SQLError, tx.commit())?;
        Ok(())
    }

    /// Delete a document by id; its index rows go in the same
    /// transaction.
    pub fn delete(&mut self, id: &str) -> Result<()> {
        self.delete_many(&[id.to_string()])
    }

    /// Delete a batch of documents in one transaction.
    pub fn delete_many(&mut self, ids: &[String]) -> Result<()> {
        let tx = err_at!(SQLError, self.conn.transaction())?;
        for id in ids.iter() {
            store::delete_data(&tx, id)?;
            store::delete_index_by_rowref(&tx, id)?;
        }
        err_at!(SQLError, tx.commit())?;
        Ok(())
    }

    /// Point lookup by id, with `_id` injected back into the document.
    pub fn get(&self, id: &str) -> Result<Option<Document>> {
        match store::get_data(&self.conn, id)? {
            Some(data) => {
                let mut doc = value::decode(&data)?;
                doc.insert(ID_FIELD.to_string(), Value::Str(id.to_string()));
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    pub fn get_many(&self, ids: &[String]) -> Result<Vec<Option<Document>>> {
        let mut out = vec![];
        for id in ids.iter() {
            out.push(self.get(id)?);
        }
        Ok(out)
    }
}

// catalog operations
impl TableAdapter {
    /// Declare an index over the given column descriptors. The new
    /// index starts with a zero watermark; the maintainer builds it in
    /// the background.
    pub fn add_index(&mut self, columns: &[String]) -> Result<()> {
        let index_def = self.col_def(columns)?;
        let at = match self.known_indexes.binary_search(&index_def) {
            Ok(at) | Err(at) => at,
        };
        if let Some(existing) = self.known_indexes.get(at) {
            if existing.starts_with(&index_def) {
                return err_at!(
                    DuplicateIndex,
                    msg: "new index {:?} is a prefix of existing index {:?}", index_def, existing
                );
            }
        }

        let index_id = store::max_index_id(&self.conn)?.map_or(0, |id| id + 1);
        store::insert_catalog(&self.conn, index_id, &index_def)?;
        info!(target: "yogatable", "table {} added index {:?} as {}", self.name, index_def, index_id);
        self.refresh_indexes()
    }

    /// Flag the matching index for background draining. Unknown
    /// indexes are a no-op.
    pub fn drop_index(&mut self, columns: &[String]) -> Result<()> {
        let index_def = self.col_def(columns)?;
        match self.indexes_to_ids.get(&index_def).copied() {
            Some(index_id) => {
                store::set_deleting(&self.conn, index_id)?;
                info!(target: "yogatable", "table {} dropping index {:?}", self.name, index_def);
                self.refresh_indexes()
            }
            None => Ok(()),
        }
    }
}

// queries
impl TableAdapter {
    /// Search the table. Filters are `(column, comparison, value)`
    /// triples over a single covering index; `order` picks or reverses
    /// that index; `limit` defaults to (and is clamped at) 1000 rows.
    pub fn search(&self, filters: &[Filter], order: &[String], limit: Option<Limit>) -> Result<Vec<Document>> {
        let plan =
            plan::search_plan(&self.known_indexes, &self.indexes_to_ids, filters, order, limit)?;
        let mut stmt = err_at!(SQLError, self.conn.prepare(&plan.sql))?;
        let iter = err_at!(
            SQLError,
            stmt.query_map(rusqlite::params_from_iter(plan.args.iter()), |row| {
                let data: String = row.get(0)?;
                let id: String = row.get(1)?;
                Ok((data, id))
            })
        )?;
        let mut out = vec![];
        for row in iter {
            let (data, id) = err_at!(SQLError, row)?;
            let mut doc = value::decode(&data)?;
            doc.insert(ID_FIELD.to_string(), Value::Str(id));
            out.push(doc);
        }
        Ok(out)
    }

    /// Same plan as [TableAdapter::search], returning the distinct
    /// document count instead of the documents.
    pub fn count(&self, filters: &[Filter], order: &[String], limit: Option<Limit>) -> Result<i64> {
        let plan =
            plan::count_plan(&self.known_indexes, &self.indexes_to_ids, filters, order, limit)?;
        let res = self.conn.query_row(
            &plan.sql,
            rusqlite::params_from_iter(plan.args.iter()),
            |row| row.get(0),
        );
        err_at!(SQLError, res)
    }
}

// table-level operations
impl TableAdapter {
    pub fn ping(&self) -> String {
        "pong".to_string()
    }

    pub fn info(&self) -> Result<TableInfo> {
        let meta = err_at!(IOError, fs::metadata(&self.dbfile), "stat {:?}", self.dbfile)?;
        let page_size = store::pragma_read(&self.conn, "page_size")?;
        let page_count = store::pragma_read(&self.conn, "page_count")?;
        let freelist_count = store::pragma_read(&self.conn, "freelist_count")?;
        Ok(TableInfo {
            indexes: self.known_indexes.clone(),
            indexes_add: self.indexes_in_progress.keys().cloned().collect(),
            indexes_del: self.indexes_being_removed.clone(),
            disk_size: meta.len(),
            page_size,
            page_count,
            freelist_count,
            total_size: page_size * page_count,
            unused_size: page_size * freelist_count,
            cache_size: store::pragma_read(&self.conn, "cache_size")?,
            auto_vacuum: store::pragma_read(&self.conn, "auto_vacuum")?,
        })
    }

    /// Mint the opaque token required by [TableAdapter::destroy], a
    /// last-line guard against accidental table destruction.
    pub fn get_drop_key(&mut self) -> String {
        let key = new_id();
        self.drop_key = Some(key.clone());
        key
    }

    pub fn drop_key_matches(&self, key: &str) -> bool {
        match self.drop_key.as_ref() {
            Some(drop_key) => drop_key == key,
            None => false,
        }
    }

    /// Close the database and remove the backing file, with bounded
    /// retries. Callers check the drop key first.
    pub fn destroy(self) -> Result<()> {
        let TableAdapter { conn, dbfile, name, .. } = self;
        if let Err((_, err)) = conn.close() {
            return err_at!(SQLError, msg: "close {:?}: {}", dbfile, err);
        }
        for _ in 0..10 {
            match fs::remove_file(&dbfile) {
                Ok(()) => break,
                Err(_) => thread::sleep(time::Duration::from_millis(100)),
            }
        }
        if fs::metadata(&dbfile).is_ok() {
            warn!(target: "yogatable", "table {} file {:?} not removed", name, dbfile);
        }
        info!(target: "yogatable", "dropped table {}", name);
        Ok(())
    }
}

// maintenance passes, scheduled by the worker between requests
impl TableAdapter {
    /// One unit of forward indexing: scan up to `batch` documents past
    /// the smallest live watermark, materialize rows for every
    /// in-progress index, and advance the watermark. Returns false
    /// when there is no indexing to do.
    pub fn index_pass(&mut self, batch: usize) -> Result<bool> {
        if self.indexes_in_progress.is_empty() {
            return Ok(false);
        }
        let cursor = match store::min_pending_watermark(&self.conn)? {
            Some(cursor) => cursor,
            None => {
                self.refresh_indexes()?;
                return Ok(false);
            }
        };
        let batch_rows = store::data_after(&self.conn, cursor, batch)?;
        if batch_rows.is_empty() {
            // caught up; everything at this watermark is complete
            store::advance_watermark(&self.conn, cursor, SENTINEL_MAX)?;
            self.refresh_indexes()?;
            return Ok(true);
        }

        let indexes = self.indexes_in_progress.clone();
        let mut max_seen = cursor;
        let tx = err_at!(SQLError, self.conn.transaction())?;
        for (id, data, last_updated) in batch_rows.into_iter() {
            let doc = value::decode(&data)?;
            reconcile_in_progress(&tx, &indexes, &self.config, &doc, &id)?;
            max_seen = cmp::max(max_seen, last_updated);
        }
        store::advance_watermark(&tx, cursor, max_seen)?;
        err_at!(SQLError, tx.commit())?;
        Ok(true)
    }

    /// One unit of drop draining: range-delete up to `batch` rows of
    /// the first index flagged for deletion; once a unit deletes
    /// nothing, purge its catalog row.
    pub fn drop_pass(&mut self, batch: usize) -> Result<DropPass> {
        let index_id = match self.indexes_being_removed.first() {
            Some(index_id) => *index_id,
            None => return Ok(DropPass::Idle),
        };
        let start = pack::pack_index_id(index_id);
        let end = pack::pack_index_id(index_id + 1);
        let tx = err_at!(SQLError, self.conn.transaction())?;
        let deleted = store::delete_index_range(&tx, &start, &end, batch)?;
        err_at!(SQLError, tx.commit())?;
        if deleted == 0 {
            store::purge_catalog(&self.conn, index_id)?;
            self.refresh_indexes()?;
            info!(target: "yogatable", "table {} purged index {}", self.name, index_id);
            Ok(DropPass::Purged(index_id))
        } else {
            Ok(DropPass::Deleted(deleted))
        }
    }

    /// One unit of incremental vacuum, up to `blocks` free pages.
    /// Only runs when the engine is in incremental auto-vacuum mode
    /// and enough free pages have accumulated.
    pub fn vacuum_pass(&mut self, blocks: i64) -> Result<bool> {
        if self.config.autovacuum != AutoVacuum::Incremental {
            return Ok(false);
        }
        let freelist = store::pragma_read(&self.conn, "freelist_count")?;
        if freelist < self.config.minimum_vacuum_blocks {
            return Ok(false);
        }
        let mut vac = cmp::min(freelist, blocks);
        let rem = freelist - vac;
        if rem > 0 && rem < self.config.minimum_vacuum_blocks {
            // leave enough behind to be worth a next pass
            vac -= self.config.minimum_vacuum_blocks;
        }
        if vac <= 0 {
            return Ok(false);
        }
        store::pragma_update(&self.conn, &format!("incremental_vacuum({})", vac))?;
        Ok(true)
    }
}

// Materialize rows for the in-progress indexes for one document,
// within the caller's transaction. Additions only; the document write
// path owns removals.
fn reconcile_in_progress(
    conn: &Connection,
    indexes: &BTreeMap<String, i64>,
    config: &Config,
    doc: &Document,
    id: &str,
) -> Result<()> {
    let (_, new_rows) = rows::generate_index_rows(doc, indexes, config)?;
    let new_keys: BTreeSet<Vec<u8>> = new_rows.into_iter().collect();
    let existing: BTreeSet<Vec<u8>> =
        store::index_rows_for(conn, id)?.into_iter().map(|(k, _)| k).collect();
    let to_add: Vec<&Vec<u8>> = new_keys.difference(&existing).collect();
    store::insert_index_rows(conn, &to_add, id)
}

/// Fresh time-ordered document id.
fn new_id() -> String {
    Uuid::now_v7().to_string()
}

#[cfg(test)]
#[path = "table_test.rs"]
mod table_test;
