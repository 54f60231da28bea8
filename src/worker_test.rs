use std::{fs, thread, time};

use super::*;
use crate::plan::Cmp;
use crate::value::Value;

fn setup(name: &str) -> (Worker, mpsc::Receiver<Notice>) {
    let dir = std::env::temp_dir().join("yogatable-worker-test");
    fs::create_dir_all(&dir).unwrap();
    let mut config = Config::default();
    config.set_path(dir.as_os_str()).set_latency(1, 2);
    fs::remove_file(config.to_dbfile(name)).ok();
    Worker::spawn(config, name)
}

fn doc(fields: Vec<(&str, Value)>) -> Document {
    fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn teardown(worker: Worker) {
    let key = worker.get_drop_key().unwrap();
    assert!(worker.drop_table(&key).unwrap());
    worker.close_wait().unwrap();
}

#[test]
fn test_worker_basics() {
    let (worker, notices) = setup("test_worker_basics");
    // the first notice is the initial index snapshot
    match notices.recv_timeout(time::Duration::from_secs(5)).unwrap() {
        Notice::Indexes(indexes) => assert!(indexes.is_empty()),
        notice => panic!("{:?}", notice),
    }

    assert_eq!(worker.ping().unwrap(), "pong");

    let (id, _, _) = worker.insert(doc(vec![("i", Value::Integer(7))])).unwrap();
    let got = worker.get(&id).unwrap().unwrap();
    assert_eq!(got["i"], Value::Integer(7));
    assert_eq!(worker.get("no-such-id").unwrap(), None);

    let info = worker.info().unwrap();
    assert!(info.indexes.is_empty());

    teardown(worker);
}

#[test]
fn test_worker_background_indexing() {
    let (worker, notices) = setup("test_worker_background_indexing");

    // documents first, index second: the maintainer has to do the work
    let docs: Vec<Document> = (0..100).map(|i| doc(vec![("i", Value::Integer(i))])).collect();
    worker.insert_many(docs).unwrap();
    worker.add_index(&["i"]).unwrap();

    // catalog change broadcast
    let deadline = time::Instant::now() + time::Duration::from_secs(5);
    loop {
        match notices.recv_timeout(time::Duration::from_secs(5)).unwrap() {
            Notice::Indexes(indexes) if indexes == vec!["i,".to_string()] => break,
            Notice::Indexes(_) => (),
            notice => panic!("{:?}", notice),
        }
        assert!(time::Instant::now() < deadline);
    }
    assert_eq!(worker.known_indexes(), vec!["i,".to_string()]);

    // poll until the background indexer catches up
    let filters = vec![Filter::new("i", Cmp::Ge, Value::Integer(90))];
    let deadline = time::Instant::now() + time::Duration::from_secs(30);
    loop {
        let found = worker.search(&filters, &[], None).unwrap();
        if found.len() == 10 {
            break;
        }
        assert!(time::Instant::now() < deadline, "indexer never caught up");
        thread::sleep(time::Duration::from_millis(10));
    }
    assert_eq!(worker.count(&filters, &[], None).unwrap(), 10);

    // wait for the watermark to reach caught-up before asserting
    // inline behavior
    let deadline = time::Instant::now() + time::Duration::from_secs(30);
    while !worker.info().unwrap().indexes_add.is_empty() {
        assert!(time::Instant::now() < deadline, "watermark never finalized");
        thread::sleep(time::Duration::from_millis(10));
    }

    // once caught up, inserts index inline
    worker.insert(doc(vec![("i", Value::Integer(95))])).unwrap();
    let found = worker.search(&filters, &[], None).unwrap();
    assert_eq!(found.len(), 11);

    teardown(worker);
}

#[test]
fn test_worker_drop_index_drains() {
    let (worker, notices) = setup("test_worker_drop_index_drains");
    worker.add_index(&["i"]).unwrap();
    let docs: Vec<Document> = (0..100).map(|i| doc(vec![("i", Value::Integer(i))])).collect();
    worker.insert_many(docs).unwrap();
    worker.drop_index(&["i"]).unwrap();

    // the drained index eventually vanishes from the snapshot
    let deadline = time::Instant::now() + time::Duration::from_secs(30);
    loop {
        match notices.recv_timeout(time::Duration::from_secs(30)) {
            Ok(Notice::Indexes(indexes)) if indexes.is_empty() => break,
            Ok(_) => (),
            Err(err) => panic!("{}", err),
        }
        assert!(time::Instant::now() < deadline, "drop never drained");
    }
    assert!(worker.known_indexes().is_empty());

    teardown(worker);
}

#[test]
fn test_worker_typed_errors() {
    let (worker, _notices) = setup("test_worker_typed_errors");

    match worker.add_index(&["5col"]) {
        Err(Error::BadColumnName(_, _)) => (),
        res => panic!("{:?}", res),
    }
    match worker.add_index(&[]) {
        Err(Error::IndexWarning(_, _)) => (),
        res => panic!("{:?}", res),
    }
    match worker.search(&[Filter::new("i", Cmp::Eq, Value::Integer(1))], &[], None) {
        Err(Error::TableIndex(_, _)) => (),
        res => panic!("{:?}", res),
    }
    // workers survive failed requests
    assert_eq!(worker.ping().unwrap(), "pong");

    teardown(worker);
}

#[test]
fn test_worker_drop_table() {
    let (worker, notices) = setup("test_worker_drop_table");
    while notices.try_recv().is_ok() {}

    // wrong key leaves the table alive
    assert!(!worker.drop_table("not-the-key").unwrap());
    assert_eq!(worker.ping().unwrap(), "pong");

    let key = worker.get_drop_key().unwrap();
    assert!(worker.drop_table(&key).unwrap());

    // empty snapshot, then quit
    let mut saw_empty = false;
    let mut saw_quit = false;
    while let Ok(notice) = notices.recv_timeout(time::Duration::from_secs(5)) {
        match notice {
            Notice::Indexes(indexes) if indexes.is_empty() => saw_empty = true,
            Notice::Quit => {
                saw_quit = true;
                break;
            }
            _ => (),
        }
    }
    assert!(saw_empty && saw_quit);
    worker.close_wait().unwrap();
}

#[test]
fn test_worker_quit_notice() {
    let (worker, notices) = setup("test_worker_quit_notice");
    worker.post_quit().unwrap();
    let deadline = time::Instant::now() + time::Duration::from_secs(5);
    loop {
        match notices.recv_timeout(time::Duration::from_secs(5)).unwrap() {
            Notice::Quit => break,
            _ => assert!(time::Instant::now() < deadline),
        }
    }
    worker.close_wait().unwrap();
}

#[test]
fn test_resolve_op() {
    assert_eq!(resolve_op("search").unwrap(), Some("search"));
    assert_eq!(resolve_op("insert").unwrap(), Some("insert"));
    assert_eq!(resolve_op("_quit").unwrap(), None);
    // underscore-prefixed attributes stay private
    match resolve_op("_refresh_indexes") {
        Err(Error::InvalidOperation(_, _)) => (),
        res => panic!("{:?}", res),
    }
    match resolve_op("no_such_op") {
        Err(Error::InvalidOperation(_, _)) => (),
        res => panic!("{:?}", res),
    }
}

#[test]
fn test_op_names() {
    let ops = vec![
        (Op::Ping, "ping"),
        (Op::GetDropKey, "get_drop_key"),
        (Op::Insert(vec![]), "insert"),
        (Op::Search { filters: vec![], order: vec![], limit: None }, "search"),
    ];
    for (op, name) in ops.into_iter() {
        assert_eq!(op.to_name(), name);
        assert_eq!(resolve_op(name).unwrap(), Some(name));
    }
}

#[test]
fn test_payload_wire_shapes() {
    let payload = Payload::Ok(Ret::Str("pong".to_string()));
    assert_eq!(payload.to_json(), serde_json::json!({"response": "ok", "value": "pong"}));

    let payload = Payload::Exception {
        name: "TableIndexError".to_string(),
        args: vec!["no known indexes match specified query".to_string()],
    };
    assert_eq!(
        payload.to_json(),
        serde_json::json!({
            "exception": "TableIndexError",
            "args": ["no known indexes match specified query"],
        })
    );

    let payload = Payload::Indexes(vec!["i,".to_string()]);
    assert_eq!(
        payload.to_json(),
        serde_json::json!({"response": "indexes", "value": ["i,"]})
    );
    assert_eq!(Payload::Quit.to_json(), serde_json::json!({"response": "quit"}));
}

#[test]
fn test_payload_round_trip() {
    let err = match (Payload::Exception {
        name: "MalformedFilterError".to_string(),
        args: vec!["bad filters".to_string()],
    })
    .into_result()
    {
        Err(err) => err,
        res => panic!("{:?}", res),
    };
    match err {
        Error::MalformedFilter(_, msg) => assert_eq!(msg, "bad filters"),
        err => panic!("{:?}", err),
    }

    // unknown exception names surface as a bad response code
    let err = match (Payload::Exception { name: "Surprise".to_string(), args: vec![] }).into_result() {
        Err(err) => err,
        res => panic!("{:?}", res),
    };
    match err {
        Error::BadResponse(_, _) => (),
        err => panic!("{:?}", err),
    }

    match Payload::Quit.into_result() {
        Err(Error::BadResponse(_, _)) => (),
        res => panic!("{:?}", res),
    }
}

#[test]
fn test_batch_size_adapts() {
    let mut batch = BatchSize::new(100);
    assert_eq!(batch.size(), 1);
    // fast work grows the batch toward the cap
    for _ in 0..20 {
        batch.adapt(time::Duration::from_millis(1), time::Duration::from_millis(10));
    }
    assert_eq!(batch.size(), 100);
    // slow work shrinks it back down
    batch.adapt(time::Duration::from_millis(5000), time::Duration::from_millis(10));
    assert_eq!(batch.size(), 1);
}
