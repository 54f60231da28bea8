//! Module `worker` implement the per-table worker thread.
//!
//! Every table is served by exactly one long-lived worker owning the
//! [TableAdapter]; requests arrive on a channel as `(cmd, reply_tx)`
//! pairs and are processed in arrival order. When the queue drains the
//! worker runs at most one unit of idle work per turn, in phase order:
//! forward indexing, drop draining, incremental vacuum; with nothing
//! to do it blocks on the queue with a short timeout. Batch sizes
//! adapt toward the configured latency budget.
//!
//! Unsolicited notices (`indexes` snapshots, crash reports, `quit`)
//! travel on a side channel handed out at spawn; the current known
//! index list is also published into an atomically shared snapshot.

use log::{error, info};

use std::{
    cmp,
    sync::{mpsc, Arc, RwLock},
    thread, time,
};

use crate::{
    config::Config,
    plan::{Filter, Limit},
    table::{DropPass, TableAdapter, TableInfo},
    value::{self, Document},
    Error, Result,
};

/// Largest forward-indexing batch.
pub const MAX_INDEX_BATCH: usize = 100;
/// Largest drop-drain batch.
pub const MAX_DELETE_BATCH: usize = 5000;
/// Largest vacuum batch, in blocks.
pub const MAX_VACUUM_BATCH: usize = 5000;

/// Operations a table worker accepts. The ergonomic surface is the
/// typed façade on [Worker]; dispatchers route wire names through
/// [resolve_op] into these codes.
#[derive(Clone, Debug)]
pub enum Op {
    Ping,
    Info,
    Insert(Vec<Document>),
    Update(Document),
    Delete(Vec<String>),
    Get(Vec<String>),
    AddIndex(Vec<String>),
    DropIndex(Vec<String>),
    Search {
        filters: Vec<Filter>,
        order: Vec<String>,
        limit: Option<Limit>,
    },
    Count {
        filters: Vec<Filter>,
        order: Vec<String>,
        limit: Option<Limit>,
    },
    GetDropKey,
    DropTable(String),
}

impl Op {
    /// Wire name for this operation, as a dispatcher spells it.
    pub fn to_name(&self) -> &'static str {
        match self {
            Op::Ping => "ping",
            Op::Info => "info",
            Op::Insert(_) => "insert",
            Op::Update(_) => "update",
            Op::Delete(_) => "delete",
            Op::Get(_) => "get",
            Op::AddIndex(_) => "add_index",
            Op::DropIndex(_) => "drop_index",
            Op::Search { .. } => "search",
            Op::Count { .. } => "count",
            Op::GetDropKey => "get_drop_key",
            Op::DropTable(_) => "drop_table",
        }
    }
}

/// Guard for the dispatcher contract: resolve a wire operation name to
/// its canonical spelling. Underscore-prefixed names are reserved,
/// `_quit` being the only accepted sentinel (returned as `None`);
/// anything else fails with `InvalidOperation`.
pub fn resolve_op(name: &str) -> Result<Option<&'static str>> {
    match name {
        "_quit" => Ok(None),
        "ping" => Ok(Some("ping")),
        "info" => Ok(Some("info")),
        "insert" => Ok(Some("insert")),
        "update" => Ok(Some("update")),
        "delete" => Ok(Some("delete")),
        "get" => Ok(Some("get")),
        "add_index" => Ok(Some("add_index")),
        "drop_index" => Ok(Some("drop_index")),
        "search" => Ok(Some("search")),
        "count" => Ok(Some("count")),
        "get_drop_key" => Ok(Some("get_drop_key")),
        "drop_table" => Ok(Some("drop_table")),
        name => err_at!(InvalidOperation, msg: "{:?}", name),
    }
}

/// Value half of an `ok` response.
#[derive(Clone, Debug, PartialEq)]
pub enum Ret {
    None,
    Str(String),
    Bool(bool),
    Count(i64),
    Inserted(Vec<(String, usize, usize)>),
    Docs(Vec<Option<Document>>),
    Found(Vec<Document>),
    Info(TableInfo),
}

/// Response payload, mirroring the dispatcher wire shapes.
#[derive(Clone, Debug)]
pub enum Payload {
    Ok(Ret),
    Exception { name: String, args: Vec<String> },
    Indexes(Vec<String>),
    Quit,
}

impl Payload {
    fn from_result(res: Result<Ret>) -> Payload {
        match res {
            Ok(ret) => Payload::Ok(ret),
            Err(err) => Payload::Exception {
                name: err.to_name().to_string(),
                args: vec![err.to_message()],
            },
        }
    }

    /// Client side of [Payload::from_result].
    pub fn into_result(self) -> Result<Ret> {
        match self {
            Payload::Ok(ret) => Ok(ret),
            Payload::Exception { name, args } => {
                let prefix = format!("{}:{}", file!(), line!());
                Err(Error::from_name(&name, prefix, args.join("; ")))
            }
            payload => err_at!(BadResponse, msg: "unexpected payload {:?}", payload),
        }
    }

    /// Wire shape of this payload, as the dispatcher serializes it.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Payload::Ok(ret) => serde_json::json!({"response": "ok", "value": ret.to_json()}),
            Payload::Exception { name, args } => {
                serde_json::json!({"exception": name, "args": args})
            }
            Payload::Indexes(indexes) => {
                serde_json::json!({"response": "indexes", "value": indexes})
            }
            Payload::Quit => serde_json::json!({"response": "quit"}),
        }
    }
}

impl Ret {
    fn to_json(&self) -> serde_json::Value {
        match self {
            Ret::None => serde_json::Value::Null,
            Ret::Str(val) => serde_json::json!(val),
            Ret::Bool(val) => serde_json::json!(val),
            Ret::Count(val) => serde_json::json!(val),
            Ret::Inserted(vals) => serde_json::json!(vals),
            Ret::Docs(docs) => {
                let mut arr = vec![];
                for doc in docs.iter() {
                    arr.push(match doc {
                        Some(doc) => doc_to_json(doc),
                        None => serde_json::Value::Null,
                    });
                }
                serde_json::Value::Array(arr)
            }
            Ret::Found(docs) => {
                serde_json::Value::Array(docs.iter().map(doc_to_json).collect())
            }
            Ret::Info(info) => serde_json::json!({
                "indexes": info.indexes,
                "indexes_add": info.indexes_add,
                "indexes_del": info.indexes_del,
                "disk_size": info.disk_size,
                "page_size": info.page_size,
                "page_count": info.page_count,
                "freelist_count": info.freelist_count,
                "total_size": info.total_size,
                "unused_size": info.unused_size,
                "cache_size": info.cache_size,
                "auto_vacuum": info.auto_vacuum,
            }),
        }
    }
}

fn doc_to_json(doc: &Document) -> serde_json::Value {
    match value::to_json(&value::Value::Map(doc.clone())) {
        Ok(jval) => jval,
        Err(err) => serde_json::json!({"exception": err.to_name(), "args": [err.to_message()]}),
    }
}

/// Unsolicited worker-to-owner notices, carried with `(null, null)`
/// caller/sequence on the wire.
#[derive(Clone, Debug)]
pub enum Notice {
    Indexes(Vec<String>),
    Exception { name: String, args: Vec<String> },
    Quit,
}

enum Cmd {
    Op(Op),
    Quit,
}

enum Flow {
    Continue,
    Shutdown,
}

type Req = (Cmd, Option<mpsc::Sender<Payload>>);

/// Handle to a per-table worker thread.
///
/// Dropping the handle posts a quit and joins the thread; prefer
/// [Worker::close_wait] to observe the exit status.
pub struct Worker {
    name: String,
    tx: Option<mpsc::Sender<Req>>,
    handle: Option<thread::JoinHandle<Result<()>>>,
    known: Arc<RwLock<Vec<String>>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tx.send((Cmd::Quit, None)).ok();
        }
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

impl Worker {
    /// Spawn the worker for table `name`, opening (or creating) its
    /// database file under `config.path`. Returns the handle and the
    /// notice channel; the first notice is the initial index snapshot.
    pub fn spawn(config: Config, name: &str) -> (Worker, mpsc::Receiver<Notice>) {
        let (tx, rx) = mpsc::channel();
        let (ntx, nrx) = mpsc::channel();
        let known = Arc::new(RwLock::new(vec![]));
        let handle = {
            let (config, name) = (config, name.to_string());
            let known = Arc::clone(&known);
            thread::spawn(move || main_loop(config, name, rx, ntx, known))
        };
        let worker = Worker {
            name: name.to_string(),
            tx: Some(tx),
            handle: Some(handle),
            known,
        };
        (worker, nrx)
    }

    pub fn to_name(&self) -> String {
        self.name.clone()
    }

    /// Read-only snapshot of the worker's known indexes, refreshed on
    /// every catalog change. Informational only.
    pub fn known_indexes(&self) -> Vec<String> {
        match self.known.read() {
            Ok(known) => known.clone(),
            Err(_) => vec![],
        }
    }

    /// Send one operation and wait for its response payload.
    pub fn request(&self, op: Op) -> Result<Ret> {
        let tx = match self.tx.as_ref() {
            Some(tx) => tx,
            None => return err_at!(IPCFail, msg: "worker {} is closed", self.name),
        };
        let (stx, srx) = mpsc::channel();
        err_at!(IPCFail, tx.send((Cmd::Op(op), Some(stx))))?;
        let payload = err_at!(IPCFail, srx.recv())?;
        payload.into_result()
    }

    /// Post the quit sentinel without waiting.
    pub fn post_quit(&self) -> Result<()> {
        match self.tx.as_ref() {
            Some(tx) => err_at!(IPCFail, tx.send((Cmd::Quit, None))),
            None => Ok(()),
        }
    }

    /// Graceful shutdown: drain outstanding requests, quit, join.
    pub fn close_wait(mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.send((Cmd::Quit, None)).ok();
        }
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(res) => res,
                Err(err) => err_at!(ThreadFail, msg: "{:?}", err),
            },
            None => Ok(()),
        }
    }
}

// the typed façade, translating to Op codes
impl Worker {
    pub fn ping(&self) -> Result<String> {
        match self.request(Op::Ping)? {
            Ret::Str(val) => Ok(val),
            ret => err_at!(BadResponse, msg: "ping {:?}", ret),
        }
    }

    pub fn info(&self) -> Result<TableInfo> {
        match self.request(Op::Info)? {
            Ret::Info(info) => Ok(info),
            ret => err_at!(BadResponse, msg: "info {:?}", ret),
        }
    }

    pub fn insert(&self, doc: Document) -> Result<(String, usize, usize)> {
        match self.request(Op::Insert(vec![doc]))? {
            Ret::Inserted(mut vals) if vals.len() == 1 => Ok(vals.remove(0)),
            ret => err_at!(BadResponse, msg: "insert {:?}", ret),
        }
    }

    pub fn insert_many(&self, docs: Vec<Document>) -> Result<Vec<(String, usize, usize)>> {
        match self.request(Op::Insert(docs))? {
            Ret::Inserted(vals) => Ok(vals),
            ret => err_at!(BadResponse, msg: "insert {:?}", ret),
        }
    }

    pub fn update(&self, doc: Document) -> Result<()> {
        match self.request(Op::Update(doc))? {
            Ret::None => Ok(()),
            ret => err_at!(BadResponse, msg: "update {:?}", ret),
        }
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        match self.request(Op::Delete(vec![id.to_string()]))? {
            Ret::None => Ok(()),
            ret => err_at!(BadResponse, msg: "delete {:?}", ret),
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Document>> {
        match self.request(Op::Get(vec![id.to_string()]))? {
            Ret::Docs(mut docs) if docs.len() == 1 => Ok(docs.remove(0)),
            ret => err_at!(BadResponse, msg: "get {:?}", ret),
        }
    }

    pub fn add_index(&self, columns: &[&str]) -> Result<()> {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        match self.request(Op::AddIndex(columns))? {
            Ret::None => Ok(()),
            ret => err_at!(BadResponse, msg: "add_index {:?}", ret),
        }
    }

    pub fn drop_index(&self, columns: &[&str]) -> Result<()> {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        match self.request(Op::DropIndex(columns))? {
            Ret::None => Ok(()),
            ret => err_at!(BadResponse, msg: "drop_index {:?}", ret),
        }
    }

    pub fn search(&self, filters: &[Filter], order: &[&str], limit: Option<Limit>) -> Result<Vec<Document>> {
        let op = Op::Search {
            filters: filters.to_vec(),
            order: order.iter().map(|o| o.to_string()).collect(),
            limit,
        };
        match self.request(op)? {
            Ret::Found(docs) => Ok(docs),
            ret => err_at!(BadResponse, msg: "search {:?}", ret),
        }
    }

    pub fn count(&self, filters: &[Filter], order: &[&str], limit: Option<Limit>) -> Result<i64> {
        let op = Op::Count {
            filters: filters.to_vec(),
            order: order.iter().map(|o| o.to_string()).collect(),
            limit,
        };
        match self.request(op)? {
            Ret::Count(count) => Ok(count),
            ret => err_at!(BadResponse, msg: "count {:?}", ret),
        }
    }

    pub fn get_drop_key(&self) -> Result<String> {
        match self.request(Op::GetDropKey)? {
            Ret::Str(key) => Ok(key),
            ret => err_at!(BadResponse, msg: "get_drop_key {:?}", ret),
        }
    }

    pub fn drop_table(&self, key: &str) -> Result<bool> {
        match self.request(Op::DropTable(key.to_string()))? {
            Ret::Bool(dropped) => Ok(dropped),
            ret => err_at!(BadResponse, msg: "drop_table {:?}", ret),
        }
    }
}

// Idle-phase batch size, adapted toward the latency budget after each
// unit of work.
struct BatchSize {
    size: usize,
    max: usize,
}

impl BatchSize {
    fn new(max: usize) -> BatchSize {
        BatchSize { size: 1, max }
    }

    fn size(&self) -> usize {
        self.size
    }

    fn adapt(&mut self, took: time::Duration, desired: time::Duration) {
        let took = cmp::max(took, time::Duration::from_millis(1));
        let scaled = (self.size as f64) * desired.as_secs_f64() / took.as_secs_f64();
        self.size = cmp::min(self.max, cmp::max(1, scaled as usize));
    }
}

fn publish(known: &Arc<RwLock<Vec<String>>>, ntx: &mpsc::Sender<Notice>, indexes: &[String]) {
    if let Ok(mut snapshot) = known.write() {
        *snapshot = indexes.to_vec();
    }
    ntx.send(Notice::Indexes(indexes.to_vec())).ok();
}

fn main_loop(
    config: Config,
    name: String,
    rx: mpsc::Receiver<Req>,
    ntx: mpsc::Sender<Notice>,
    known: Arc<RwLock<Vec<String>>>,
) -> Result<()> {
    let mut table = match TableAdapter::open(config.clone(), &name) {
        Ok(table) => Some(table),
        Err(err) => {
            error!(target: "yogatable", "worker {} open failed: {}", name, err);
            ntx.send(Notice::Exception {
                name: "UnknownExceptionError".to_string(),
                args: vec![err.to_string()],
            })
            .ok();
            ntx.send(Notice::Quit).ok();
            return Err(err);
        }
    };
    publish(&known, &ntx, table.as_ref().unwrap().as_known_indexes());

    let desired = config.to_desired_latency();
    let idle_timeout = config.to_idle_timeout();
    let mut index_batch = BatchSize::new(MAX_INDEX_BATCH);
    let mut delete_batch = BatchSize::new(MAX_DELETE_BATCH);
    let mut vacuum_batch = BatchSize::new(MAX_VACUUM_BATCH);

    let res = 'main: loop {
        // ACTIVE: drain the request queue in arrival order.
        loop {
            match rx.try_recv() {
                Ok(req) => match handle_request(&mut table, req, &ntx, &known) {
                    Flow::Continue => (),
                    Flow::Shutdown => break 'main Ok(()),
                },
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => break 'main Ok(()),
            }
        }
        // IDLE_WORK: at most one phase per idle turn.
        match idle_work(
            &mut table,
            &mut index_batch,
            &mut delete_batch,
            &mut vacuum_batch,
            desired,
            &ntx,
            &known,
        ) {
            Ok(true) => continue,
            Ok(false) => (),
            Err(err) => break 'main Err(err),
        }
        // WAIT: block briefly for the next request.
        match rx.recv_timeout(idle_timeout) {
            Ok(req) => match handle_request(&mut table, req, &ntx, &known) {
                Flow::Continue => (),
                Flow::Shutdown => break 'main Ok(()),
            },
            Err(mpsc::RecvTimeoutError::Timeout) => (),
            Err(mpsc::RecvTimeoutError::Disconnected) => break 'main Ok(()),
        }
    };

    match res {
        Ok(()) => {
            info!(target: "yogatable", "worker {} quitting", name);
            ntx.send(Notice::Quit).ok();
            Ok(())
        }
        Err(err) => {
            // a failed idle phase takes the worker down; supervisors
            // may restart it
            error!(target: "yogatable", "worker {} crashed: {}", name, err);
            ntx.send(Notice::Exception {
                name: "UnknownExceptionError".to_string(),
                args: vec![err.to_string()],
            })
            .ok();
            ntx.send(Notice::Quit).ok();
            Err(err)
        }
    }
}

fn handle_request(
    table: &mut Option<TableAdapter>,
    (cmd, reply_tx): Req,
    ntx: &mpsc::Sender<Notice>,
    known: &Arc<RwLock<Vec<String>>>,
) -> Flow {
    let op = match cmd {
        Cmd::Op(op) => op,
        Cmd::Quit => return Flow::Shutdown,
    };
    if let Op::DropTable(key) = op {
        return drop_table(table, &key, reply_tx, ntx, known);
    }
    let adapter = match table.as_mut() {
        Some(adapter) => adapter,
        None => return Flow::Shutdown,
    };

    let broadcast = matches!(op, Op::AddIndex(_) | Op::DropIndex(_));
    let old = if broadcast { adapter.as_known_indexes().to_vec() } else { vec![] };

    let res = exec_op(adapter, op);
    if broadcast && res.is_ok() && adapter.as_known_indexes() != old.as_slice() {
        publish(known, ntx, adapter.as_known_indexes());
    }
    if let Some(reply_tx) = reply_tx {
        reply_tx.send(Payload::from_result(res)).ok();
    }
    Flow::Continue
}

fn exec_op(table: &mut TableAdapter, op: Op) -> Result<Ret> {
    match op {
        Op::Ping => Ok(Ret::Str(table.ping())),
        Op::Info => Ok(Ret::Info(table.info()?)),
        Op::Insert(docs) => Ok(Ret::Inserted(table.insert_many(docs)?)),
        Op::Update(doc) => {
            table.update(doc)?;
            Ok(Ret::None)
        }
        Op::Delete(ids) => {
            table.delete_many(&ids)?;
            Ok(Ret::None)
        }
        Op::Get(ids) => Ok(Ret::Docs(table.get_many(&ids)?)),
        Op::AddIndex(columns) => {
            table.add_index(&columns)?;
            Ok(Ret::None)
        }
        Op::DropIndex(columns) => {
            table.drop_index(&columns)?;
            Ok(Ret::None)
        }
        Op::Search { filters, order, limit } => {
            Ok(Ret::Found(table.search(&filters, &order, limit)?))
        }
        Op::Count { filters, order, limit } => {
            Ok(Ret::Count(table.count(&filters, &order, limit)?))
        }
        Op::GetDropKey => Ok(Ret::Str(table.get_drop_key())),
        Op::DropTable(_) => unreachable!("routed by handle_request"),
    }
}

fn drop_table(
    table: &mut Option<TableAdapter>,
    key: &str,
    reply_tx: Option<mpsc::Sender<Payload>>,
    ntx: &mpsc::Sender<Notice>,
    known: &Arc<RwLock<Vec<String>>>,
) -> Flow {
    let matches = table.as_ref().map_or(false, |t| t.drop_key_matches(key));
    if !matches {
        if let Some(reply_tx) = reply_tx {
            reply_tx.send(Payload::Ok(Ret::Bool(false))).ok();
        }
        return Flow::Continue;
    }
    let res = match table.take() {
        Some(adapter) => adapter.destroy().map(|_| Ret::Bool(true)),
        None => Ok(Ret::Bool(false)),
    };
    if let Some(reply_tx) = reply_tx {
        reply_tx.send(Payload::from_result(res)).ok();
    }
    publish(known, ntx, &[]);
    Flow::Shutdown
}

fn idle_work(
    table: &mut Option<TableAdapter>,
    index_batch: &mut BatchSize,
    delete_batch: &mut BatchSize,
    vacuum_batch: &mut BatchSize,
    desired: time::Duration,
    ntx: &mpsc::Sender<Notice>,
    known: &Arc<RwLock<Vec<String>>>,
) -> Result<bool> {
    let adapter = match table.as_mut() {
        Some(adapter) => adapter,
        None => return Ok(false),
    };

    // Phase 1: forward indexing.
    let start = time::Instant::now();
    if adapter.index_pass(index_batch.size())? {
        index_batch.adapt(start.elapsed(), desired);
        return Ok(true);
    }

    // Phase 2: drop draining.
    let start = time::Instant::now();
    match adapter.drop_pass(delete_batch.size())? {
        DropPass::Deleted(_) => {
            delete_batch.adapt(start.elapsed(), desired);
            return Ok(true);
        }
        DropPass::Purged(_) => {
            delete_batch.adapt(start.elapsed(), desired);
            publish(known, ntx, adapter.as_known_indexes());
            return Ok(true);
        }
        DropPass::Idle => (),
    }

    // Phase 3: incremental vacuum.
    let start = time::Instant::now();
    if adapter.vacuum_pass(vacuum_batch.size() as i64)? {
        vacuum_batch.adapt(start.elapsed(), desired);
        return Ok(true);
    }

    Ok(false)
}

#[cfg(test)]
#[path = "worker_test.rs"]
mod worker_test;
