use rusqlite::Connection;

use super::*;
use crate::pack;

fn memdb() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    init_schema(&conn).unwrap();
    conn
}

#[test]
fn test_schema_idempotent() {
    let conn = memdb();
    init_schema(&conn).unwrap();
    init_schema(&conn).unwrap();
}

#[test]
fn test_time_seq() {
    let seq = TimeSeq::new(0);
    let mut prev = 0;
    for _ in 0..10_000 {
        let stamp = seq.next().unwrap();
        assert!(stamp > prev, "{} {}", stamp, prev);
        prev = stamp;
    }

    // seeding keeps the sequence ascending past a stored maximum
    let seq = TimeSeq::new(i64::MAX - 10);
    assert!(seq.next().unwrap() > i64::MAX - 10);
}

#[test]
fn test_data_rows() {
    let conn = memdb();
    insert_data(&conn, "a", "{}", 10).unwrap();
    insert_data(&conn, "b", r#"{"x":1}"#, 20).unwrap();

    assert_eq!(get_data(&conn, "a").unwrap(), Some("{}".to_string()));
    assert_eq!(get_data(&conn, "z").unwrap(), None);
    assert_eq!(max_last_updated(&conn).unwrap(), Some(20));

    assert_eq!(update_data(&conn, "a", r#"{"y":2}"#, 30).unwrap(), 1);
    assert_eq!(get_data(&conn, "a").unwrap(), Some(r#"{"y":2}"#.to_string()));

    let rows = data_after(&conn, 15, 10).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], ("b".to_string(), r#"{"x":1}"#.to_string(), 20));
    assert_eq!(rows[1].0, "a".to_string());

    let rows = data_after(&conn, 15, 1).unwrap();
    assert_eq!(rows.len(), 1);

    assert_eq!(delete_data(&conn, "a").unwrap(), 1);
    assert_eq!(delete_data(&conn, "a").unwrap(), 0);
}

#[test]
fn test_index_rows() {
    let conn = memdb();
    let rows: Vec<Vec<u8>> = vec![vec![1, 2], vec![1, 3]];
    insert_index_rows(&conn, &rows, "a").unwrap();
    insert_index_rows(&conn, &[vec![1u8, 4]], "b").unwrap();

    let got = index_rows_for(&conn, "a").unwrap();
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].0, vec![1, 2]);

    delete_index_rows(&conn, &[got[0].1]).unwrap();
    assert_eq!(index_rows_for(&conn, "a").unwrap().len(), 1);

    assert_eq!(delete_index_by_rowref(&conn, "b").unwrap(), 1);
    assert_eq!(index_rows_for(&conn, "b").unwrap().len(), 0);
}

#[test]
fn test_delete_index_range_bounded() {
    let conn = memdb();
    let prefix0 = pack::pack_index_id(0);
    let prefix1 = pack::pack_index_id(1);

    for byte in 0..25u8 {
        let mut row = prefix0.clone();
        row.push(byte);
        insert_index_rows(&conn, &[row], "a").unwrap();
    }
    // a row under the next index id must survive the drain
    insert_index_rows(&conn, &[prefix1.clone()], "b").unwrap();

    let end = pack::pack_index_id(1);
    let mut total = 0;
    let mut passes = 0;
    loop {
        let deleted = delete_index_range(&conn, &prefix0, &end, 10).unwrap();
        if deleted == 0 {
            break;
        }
        assert!(deleted <= 10, "{}", deleted);
        total += deleted;
        passes += 1;
    }
    assert_eq!(total, 25);
    assert_eq!(passes, 3);
    assert_eq!(index_rows_for(&conn, "b").unwrap().len(), 1);
}

#[test]
fn test_catalog() {
    let conn = memdb();
    assert_eq!(max_index_id(&conn).unwrap(), None);
    assert_eq!(min_pending_watermark(&conn).unwrap(), None);

    insert_catalog(&conn, 0, "col1,").unwrap();
    insert_catalog(&conn, 1, "col2,col3,").unwrap();
    assert_eq!(max_index_id(&conn).unwrap(), Some(1));

    let states = select_catalog(&conn).unwrap();
    assert_eq!(states.len(), 2);
    assert_eq!(states[0].columns, "col1,");
    assert_eq!(states[0].flags, 0);
    assert_eq!(states[0].last_indexed, 0);
    assert!(states[0].is_pending());
    assert!(!states[0].is_deleting());

    assert_eq!(min_pending_watermark(&conn).unwrap(), Some(0));

    // advance only the rows sitting at the old watermark
    assert_eq!(advance_watermark(&conn, 0, 42).unwrap(), 2);
    assert_eq!(min_pending_watermark(&conn).unwrap(), Some(42));
    assert_eq!(advance_watermark(&conn, 42, SENTINEL_MAX).unwrap(), 2);
    assert_eq!(min_pending_watermark(&conn).unwrap(), None);

    let states = select_catalog(&conn).unwrap();
    assert!(states.iter().all(|s| !s.is_pending()));

    // deleting rows drop out of the pending watermark
    set_deleting(&conn, 0).unwrap();
    let states = select_catalog(&conn).unwrap();
    assert!(states[0].is_deleting());
    assert!(!states[0].is_pending());

    purge_catalog(&conn, 0).unwrap();
    assert_eq!(select_catalog(&conn).unwrap().len(), 1);
}

#[test]
fn test_pragmas() {
    let conn = memdb();
    pragma_update(&conn, "cache_size = 123").unwrap();
    assert_eq!(pragma_read(&conn, "cache_size").unwrap(), 123);
}
