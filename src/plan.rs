//! Module `plan` translate filter+order queries into index scans.
//!
//! Planning picks the narrowest known index whose canonical form covers
//! the filter columns followed by the order columns (forward, or with
//! every order flipped for a reverse scan), then compiles the filter
//! into a single packed-prefix range or IN-set over `_index.idata`,
//! joined back to `_data` by document id.

use lazy_static::lazy_static;
use regex::Regex;

use std::{collections::BTreeMap, fmt, result};

use crate::{pack, value::Value, Error, Result};

lazy_static! {
    static ref COL_REGEX: Regex = Regex::new("^[-+]?[a-z_][a-z0-9_]*[-+]?$").unwrap();
}

// SQL keywords and sqlite internals, unusable as column names.
const BAD_NAMES: &[&str] = &[
    "_rowid_", "abort", "add", "after", "all", "alter", "analyze", "and", "as", "asc", "attach",
    "autoincrement", "before", "begin", "between", "by", "cascade", "case", "cast", "check",
    "collate", "column", "commit", "conflict", "constraint", "create", "cross", "current_date",
    "current_time", "current_timestamp", "database", "default", "deferrable", "deferred",
    "delete", "desc", "detach", "distinct", "drop", "each", "else", "end", "escape", "except",
    "exclusive", "exists", "explain", "fail", "for", "foreign", "from", "full", "glob", "group",
    "having", "if", "ignore", "immediate", "in", "index", "indexed", "initially", "inner",
    "insert", "instead", "intersect", "into", "is", "isnull", "join", "key", "left", "like",
    "limit", "main", "match", "natural", "not", "notnull", "null", "of", "offset", "oid", "on",
    "or", "order", "outer", "plan", "pragma", "primary", "query", "raise", "references",
    "regexp", "reindex", "release", "rename", "replace", "restrict", "right", "rollback",
    "row", "rowid", "savepoint", "select", "set", "sqlite_master", "sqlite_sequence",
    "sqlite_temp_master", "table", "temp", "temporary", "then", "to", "transaction", "trigger",
    "union", "unique", "update", "using", "vacuum", "values", "view", "virtual", "when",
    "where",
];

/// Check one column descriptor against the shape regex and the
/// reserved-word blacklist.
pub fn validate_column(col: &str) -> Result<()> {
    if !COL_REGEX.is_match(col) || BAD_NAMES.binary_search(&col).is_ok() {
        err_at!(BadColumnName, msg: "bad column name {:?}", col)
    } else {
        Ok(())
    }
}

/// Comparison operators allowed in filter triples.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Cmp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

impl fmt::Display for Cmp {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        let text = match self {
            Cmp::Eq => "=",
            Cmp::Lt => "<",
            Cmp::Le => "<=",
            Cmp::Gt => ">",
            Cmp::Ge => ">=",
            Cmp::In => "IN",
        };
        write!(f, "{}", text)
    }
}

/// One `(column, comparison, value)` filter triple. `In` comparisons
/// take their candidate set as a `List` or `Set` value.
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    pub column: String,
    pub cmp: Cmp,
    pub value: Value,
}

impl Filter {
    pub fn new<V>(column: &str, cmp: Cmp, value: V) -> Filter
    where
        V: Into<Value>,
    {
        Filter {
            column: column.to_string(),
            cmp,
            value: value.into(),
        }
    }
}

/// Limit clause for search/count: a row cap, or `(offset, cap)`. Caps
/// are clamped to `1..=1000`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Limit {
    Rows(i64),
    Offset(i64, i64),
}

/// A compiled query: SQL text plus its blob parameters, in order.
#[derive(Clone, Debug)]
pub struct Plan {
    pub sql: String,
    pub args: Vec<Vec<u8>>,
    /// Canonical form of the index chosen for the scan.
    pub index: String,
    /// Scan `idata` descending.
    pub reverse: bool,
}

/// Compile a search query. `limit` defaults to 1000 rows.
pub fn search_plan(
    known_indexes: &[String],
    indexes_to_ids: &BTreeMap<String, i64>,
    filters: &[Filter],
    order: &[String],
    limit: Option<Limit>,
) -> Result<Plan> {
    let limit = clamp_limit(limit, false)?;
    let (scan, index, reverse, args) = compile_scan(known_indexes, indexes_to_ids, filters, order, limit)?;
    let dir = if reverse { " DESC" } else { "" };
    let sql = format!(
        "SELECT _data.data, _data._id, SUB.ord FROM _data INNER JOIN ( {} ) SUB \
         ON _data._id = SUB._id ORDER BY SUB.ord{}",
        scan, dir
    );
    Ok(Plan { sql, args, index, reverse })
}

/// Compile a count query: same scan, returns the distinct-rowref count.
/// `limit` defaults to none.
pub fn count_plan(
    known_indexes: &[String],
    indexes_to_ids: &BTreeMap<String, i64>,
    filters: &[Filter],
    order: &[String],
    limit: Option<Limit>,
) -> Result<Plan> {
    let limit = clamp_limit(limit, true)?;
    let (scan, index, reverse, args) = compile_scan(known_indexes, indexes_to_ids, filters, order, limit)?;
    let sql = format!("SELECT count(_id) FROM ( {} )", scan);
    Ok(Plan { sql, args, index, reverse })
}

fn clamp_limit(limit: Option<Limit>, count: bool) -> Result<Option<(i64, i64)>> {
    match limit {
        Some(Limit::Rows(rows)) => Ok(Some((0, rows.max(1).min(1000)))),
        Some(Limit::Offset(offset, rows)) => {
            if offset < 0 {
                err_at!(MalformedFilter, msg: "bad limit clause offset {}", offset)
            } else {
                Ok(Some((offset, rows.max(1).min(1000))))
            }
        }
        None if count => Ok(None),
        None => Ok(Some((0, 1000))),
    }
}

// Packed range endpoint with its strictness.
type Endpoint = Option<(Vec<u8>, bool)>;

enum Pos {
    Empty,
    Eq(Value),
    In(Vec<Value>),
    Range {
        min: Option<(Value, bool)>,
        max: Option<(Value, bool)>,
    },
}

// Compile filters+order into the inner scan of `_index`: SQL text,
// chosen index, scan direction and blob parameters.
fn compile_scan(
    known_indexes: &[String],
    indexes_to_ids: &BTreeMap<String, i64>,
    filters: &[Filter],
    order: &[String],
    limit: Option<(i64, i64)>,
) -> Result<(String, String, bool, Vec<Vec<u8>>)> {
    let (use_index, reverse) = choose_index(known_indexes, filters, order)?;
    let index_id = match indexes_to_ids.get(&use_index) {
        Some(index_id) => *index_id,
        None => return err_at!(TableIndex, msg: "unknown index {:?}", use_index),
    };
    let index_cols: Vec<&str> = use_index.trim_end_matches(',').split(',').collect();

    let positions = parse_filters(filters)?;

    // Pack the shared prefix and the optional range/IN tail, using the
    // chosen index's per-column descriptors.
    let mut like = pack::pack_index_id(index_id);
    let mut range: Option<(Endpoint, Endpoint)> = None;
    let mut in_vals: Option<Vec<Vec<u8>>> = None;
    for (pos_i, pos) in positions.into_iter().enumerate() {
        let desc = index_cols[pos_i];
        let cased = !desc.ends_with('-');
        let cneg = desc.starts_with('-');
        match pos {
            Pos::Empty => return err_at!(MalformedFilter, msg: "bad filters"),
            Pos::Eq(value) => like.extend(pack::pack(&value, cased, cneg)?),
            Pos::In(values) => {
                let mut packed = vec![];
                for value in values.iter() {
                    packed.push(pack::pack(value, cased, cneg)?);
                }
                in_vals = Some(packed);
            }
            Pos::Range { min, max } => {
                let pmin = match min {
                    Some((value, strict)) => Some((pack::pack(&value, cased, cneg)?, strict)),
                    None => None,
                };
                let pmax = match max {
                    Some((value, strict)) => Some((pack::pack(&value, cased, cneg)?, strict)),
                    None => None,
                };
                // a descending column flips which endpoint is the low
                // end of the byte range
                range = if cneg { Some((pmax, pmin)) } else { Some((pmin, pmax)) };
            }
        }
    }

    let mut args: Vec<Vec<u8>> = vec![];
    let cond = match in_vals {
        Some(packed) => {
            let marks: Vec<String> = (1..=packed.len()).map(|i| format!("?{}", i)).collect();
            for value in packed.into_iter() {
                let mut arg = like.clone();
                arg.extend(value);
                args.push(arg);
            }
            format!("_index.idata IN ({})", marks.join(", "))
        }
        None => {
            let (min, max) = range.unwrap_or((None, None));
            let mut lo = like.clone();
            if let Some((bytes, strict)) = min {
                lo.extend(bytes);
                if strict {
                    lo = add_one(lo);
                }
            }
            args.push(lo);
            let op = match max {
                Some((bytes, strict)) => {
                    let mut hi = like.clone();
                    hi.extend(bytes);
                    args.push(hi);
                    if strict {
                        "<"
                    } else {
                        "<="
                    }
                }
                None => {
                    args.push(add_one(like));
                    "<"
                }
            };
            format!("_index.idata >= ?1 AND _index.idata {} ?2", op)
        }
    };

    // One `ord` per document: the first idata met in scan direction.
    let ord = if reverse { "MAX(_index.idata)" } else { "MIN(_index.idata)" };
    let dir = if reverse { " DESC" } else { "" };
    let mut scan = format!(
        "SELECT _index.rowref AS _id, {} AS ord FROM _index WHERE {} \
         GROUP BY _index.rowref ORDER BY ord{}",
        ord, cond, dir
    );
    if let Some((offset, rows)) = limit {
        if offset > 0 {
            scan.push_str(&format!(" LIMIT {},{}", offset, rows));
        } else {
            scan.push_str(&format!(" LIMIT {}", rows));
        }
    }

    Ok((scan, use_index, reverse, args))
}

// Find the narrowest covering index: candidates matching
// filter-prefix + order-suffix, forward first then with orders
// flipped, stable min by column count.
fn choose_index(known_indexes: &[String], filters: &[Filter], order: &[String]) -> Result<(String, bool)> {
    let filter_cols: Vec<&str> = filters.iter().map(|f| f.column.as_str()).collect();
    let order_cols: Vec<&str> = order.iter().map(|o| o.as_str()).collect();

    let mut cols = filter_cols.clone();
    cols.extend_from_slice(&order_cols);
    let forward = err_at!(Fatal, Regex::new(&filter_prefix(&cols)?))?;

    let reverse = if order.is_empty() {
        None
    } else {
        let flipped = flip_orders(&order_cols);
        let mut cols = filter_cols.clone();
        for col in flipped.iter() {
            cols.push(col);
        }
        Some(err_at!(Fatal, Regex::new(&filter_prefix(&cols)?))?)
    };

    let mut candidates: Vec<(&String, bool)> = vec![];
    for index in known_indexes.iter() {
        if forward.is_match(index) {
            candidates.push((index, false));
        }
    }
    if let Some(reverse) = reverse {
        for index in known_indexes.iter() {
            if reverse.is_match(index) {
                candidates.push((index, true));
            }
        }
    }

    let mut best: Option<(usize, &String, bool)> = None;
    for (index, rev) in candidates.into_iter() {
        let ncols = index.matches(',').count();
        match best {
            Some((n, _, _)) if n <= ncols => (),
            _ => best = Some((ncols, index, rev)),
        }
    }
    match best {
        Some((_, index, rev)) => Ok((index.clone(), rev)),
        None => err_at!(TableIndex, msg: "no known indexes match specified query"),
    }
}

// The anchored regular expression a covering index must match:
// consecutive entries on the same column collapse into one position,
// every position accepts an optional descending marker.
fn filter_prefix(cols: &[&str]) -> Result<String> {
    let mut groups: Vec<String> = vec![];
    let mut prev: Option<&str> = None;
    for col in cols.iter() {
        validate_filter_column(col)?;
        let same = match prev {
            Some(prev) => *col == prev || col.strip_prefix('-') == Some(prev),
            None => false,
        };
        if same {
            let last = groups.last_mut().unwrap();
            *last = format!("-?{}", col);
        } else {
            groups.push(format!("-?{}", col));
        }
        prev = Some(col);
    }
    let tail = if groups.is_empty() { "" } else { "," };
    Ok(format!("^{}{}", groups.join(","), tail))
}

// filter/order columns are spliced into a regular expression, so they
// must obey the column shape
fn validate_filter_column(col: &str) -> Result<()> {
    if COL_REGEX.is_match(col) {
        Ok(())
    } else {
        err_at!(MalformedFilter, msg: "bad column {:?} in filters", col)
    }
}

fn flip_orders(orders: &[&str]) -> Vec<String> {
    orders
        .iter()
        .map(|order| match order.strip_prefix('-') {
            Some(rest) => rest.to_string(),
            None => format!("-{}", order),
        })
        .collect()
}

// Fold the triples into per-position constraints, enforcing the filter
// grammar: one equality or one IN or up to one min and one max per
// column, IN never alongside ranges, equality never after either, and
// range/IN only on the final constrained position.
fn parse_filters(filters: &[Filter]) -> Result<Vec<Pos>> {
    let cols: Vec<&str> = filters.iter().map(|f| f.column.as_str()).collect();
    let npos = if cols.is_empty() { 0 } else { filter_prefix(&cols)?.matches(',').count() };

    let mut positions: Vec<Pos> = (0..npos).map(|_| Pos::Empty).collect();
    let mut in_query = false;
    let mut neq_query = false;
    let mut index: Option<usize> = None;
    let mut lc: Option<&str> = None;

    for filter in filters.iter() {
        if lc != Some(filter.column.as_str()) {
            index = Some(index.map_or(0, |i| i + 1));
        }
        lc = Some(filter.column.as_str());
        let pos = match positions.get_mut(index.unwrap()) {
            Some(pos) => pos,
            None => return err_at!(MalformedFilter, msg: "bad filters"),
        };
        match filter.cmp {
            Cmp::In => {
                if neq_query || !matches!(pos, Pos::Empty) {
                    return err_at!(MalformedFilter, msg: "bad filters");
                }
                let values = match &filter.value {
                    Value::List(vals) | Value::Set(vals) => vals.clone(),
                    _ => return err_at!(MalformedFilter, msg: "IN filter takes a sequence"),
                };
                in_query = true;
                *pos = Pos::In(values);
            }
            Cmp::Eq => {
                if neq_query || in_query || !matches!(pos, Pos::Empty) {
                    return err_at!(MalformedFilter, msg: "bad filters");
                }
                *pos = Pos::Eq(filter.value.clone());
            }
            Cmp::Lt | Cmp::Le => {
                let strict = filter.cmp == Cmp::Lt;
                if in_query || (neq_query && !matches!(pos, Pos::Range { .. })) {
                    return err_at!(MalformedFilter, msg: "bad filters");
                }
                neq_query = true;
                match pos {
                    Pos::Empty => {
                        *pos = Pos::Range { min: None, max: Some((filter.value.clone(), strict)) }
                    }
                    Pos::Range { max: max @ None, .. } => {
                        *max = Some((filter.value.clone(), strict))
                    }
                    _ => return err_at!(MalformedFilter, msg: "bad filters"),
                }
            }
            Cmp::Gt | Cmp::Ge => {
                let strict = filter.cmp == Cmp::Gt;
                if in_query || (neq_query && !matches!(pos, Pos::Range { .. })) {
                    return err_at!(MalformedFilter, msg: "bad filters");
                }
                neq_query = true;
                match pos {
                    Pos::Empty => {
                        *pos = Pos::Range { min: Some((filter.value.clone(), strict)), max: None }
                    }
                    Pos::Range { min: min @ None, .. } => {
                        *min = Some((filter.value.clone(), strict))
                    }
                    _ => return err_at!(MalformedFilter, msg: "bad filters"),
                }
            }
        }
    }

    if in_query && neq_query {
        return err_at!(MalformedFilter, msg: "bad filters");
    }
    // range and IN constraints are only usable on the last position
    let tail = positions.len().saturating_sub(1);
    for (pos_i, pos) in positions.iter().enumerate() {
        match pos {
            Pos::Empty => return err_at!(MalformedFilter, msg: "bad filters"),
            Pos::In(_) | Pos::Range { .. } if pos_i != tail => {
                return err_at!(MalformedFilter, msg: "bad filters")
            }
            _ => (),
        }
    }

    Ok(positions)
}

// Smallest byte string strictly greater than every string prefixed by
// `bytes`: drop trailing 0xff, bump the last byte.
fn add_one(mut bytes: Vec<u8>) -> Vec<u8> {
    while let Some(&b) = bytes.last() {
        if b == 0xff {
            bytes.pop();
        } else {
            break;
        }
    }
    if let Some(last) = bytes.last_mut() {
        *last += 1;
    }
    bytes
}

#[cfg(test)]
#[path = "plan_test.rs"]
mod plan_test;
