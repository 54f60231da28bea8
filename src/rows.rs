//! Module `rows` expand documents into secondary-index rows.

use std::{cmp, collections::BTreeMap};

use crate::{
    config::{Config, OverCount, OverSize},
    pack,
    value::{Document, Value},
    Error, Result,
};

// Hard ceilings on the per-call policy knobs.
const ROW_COUNT_CEILING: usize = 10_000;
const ROW_LENGTH_CEILING: usize = 4096;

/// Generate the index rows for `doc` under the declared `indexes`,
/// a map of canonical column form to index-id.
///
/// Columns are evaluated against the document per descriptor: a missing
/// field produces the empty set and silences the whole index for this
/// document, list/set fields contribute one row per element (cartesian
/// with the other columns), scalars are singleton sets. Every row is
/// prefixed with the packed index-id, minus its type tag.
///
/// Returns the logical row count (cartesian sizes summed before any
/// policy is applied) and the emitted rows.
pub fn generate_index_rows(
    doc: &Document,
    indexes: &BTreeMap<String, i64>,
    config: &Config,
) -> Result<(usize, Vec<Vec<u8>>)> {
    let max_row_count = cmp::min(config.max_index_row_count, ROW_COUNT_CEILING);
    let max_row_len = cmp::min(config.max_index_row_length, ROW_LENGTH_CEILING);

    let mut cache: BTreeMap<&str, Vec<Vec<u8>>> = BTreeMap::new();
    let mut usable: Vec<Vec<Vec<Vec<u8>>>> = vec![];
    let mut logical = 0;

    'indexes: for (cols, index_id) in indexes.iter() {
        let mut index_cols: Vec<Vec<Vec<u8>>> = vec![vec![pack::pack_index_id(*index_id)]];
        for col in cols.trim_end_matches(',').split(',') {
            if !cache.contains_key(col) {
                let cname = col.trim_matches('-');
                let cased = !col.ends_with('-');
                let cneg = col.starts_with('-');
                let elems = pack_column(doc.get(cname), cased, cneg)?;
                cache.insert(col, elems);
            }
            let elems = &cache[col];
            if elems.is_empty() {
                continue 'indexes;
            }
            index_cols.push(elems.clone());
        }
        let mut count = 1;
        for col_data in index_cols.iter() {
            count *= col_data.len();
        }
        logical += count;
        usable.push(index_cols);
    }

    if logical > max_row_count && config.too_many_rows == OverCount::Fail {
        return err_at!(
            TooManyIndexRows, msg: "index row count {} exceeds maximum count {}", logical, max_row_count
        );
    }

    let mut index_rows: Vec<Vec<u8>> = vec![];
    'emit: for index_cols in usable.iter() {
        let mut odometer = vec![0; index_cols.len()];
        loop {
            if index_rows.len() == max_row_count {
                break 'emit;
            }
            let mut row = vec![];
            for (pos, elems) in index_cols.iter().enumerate() {
                row.extend_from_slice(&elems[odometer[pos]]);
            }
            let prefix_len = index_cols[0][0].len();
            let row_len = row.len() - prefix_len;
            if row_len <= max_row_len {
                index_rows.push(row);
            } else {
                match config.row_too_long {
                    OverSize::Discard => (),
                    OverSize::Truncate => {
                        row.truncate(max_row_len + prefix_len);
                        index_rows.push(row);
                    }
                    OverSize::Fail => {
                        return err_at!(
                            IndexRowTooLong,
                            msg: "index row with length {} > maximum length {}", row_len, max_row_len
                        );
                    }
                }
            }
            // rightmost column varies fastest
            let mut pos = index_cols.len();
            loop {
                if pos == 0 {
                    break;
                }
                pos -= 1;
                odometer[pos] += 1;
                if odometer[pos] < index_cols[pos].len() {
                    break;
                }
                odometer[pos] = 0;
            }
            if odometer.iter().all(|i| *i == 0) {
                break;
            }
        }
    }

    Ok((logical, index_rows))
}

// Pack one column of the document into its element set: missing fields
// are empty, lists and sets contribute per element, scalars are
// singletons.
fn pack_column(value: Option<&Value>, cased: bool, cneg: bool) -> Result<Vec<Vec<u8>>> {
    match value {
        None => Ok(vec![]),
        Some(Value::List(vals)) | Some(Value::Set(vals)) => {
            let mut elems = vec![];
            for val in vals.iter() {
                elems.push(pack::pack(val, cased, cneg)?);
            }
            Ok(elems)
        }
        Some(val) => Ok(vec![pack::pack(val, cased, cneg)?]),
    }
}

#[cfg(test)]
#[path = "rows_test.rs"]
mod rows_test;
