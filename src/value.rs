//! Module `value` define the document model and its JSON codec.
//!
//! Documents are free-form maps of field name to [Value]. On disk a
//! document is JSON text, extended with single-key objects for the
//! scalar types JSON cannot express: `__datetime`, `__date`, `__time`,
//! `__timedelta`, `__decimal`, `__set` and `__bytes`. The codec is
//! round-trip stable for all supported types.

use bigdecimal::BigDecimal;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde_json::{json, Number};

use std::{collections::BTreeMap, str::FromStr};

use crate::{Error, Result};

/// A document is a map of field name to value.
pub type Document = BTreeMap<String, Value>;

/// Field name carrying the document's unique identifier.
pub const ID_FIELD: &str = "_id";

/// Scalar and sequence values a document field can hold.
///
/// `Bool`, `Timedelta` and `Map` are storable but have no
/// order-preserving encoding; packing them fails with
/// `UnsupportedType`.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Decimal(BigDecimal),
    Str(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    Timedelta(Duration),
    List(Vec<Value>),
    Set(Vec<Value>),
    Map(Document),
}

impl From<i64> for Value {
    fn from(val: i64) -> Value {
        Value::Integer(val)
    }
}

impl From<f64> for Value {
    fn from(val: f64) -> Value {
        Value::Float(val)
    }
}

impl From<&str> for Value {
    fn from(val: &str) -> Value {
        Value::Str(val.to_string())
    }
}

impl From<String> for Value {
    fn from(val: String) -> Value {
        Value::Str(val)
    }
}

impl From<bool> for Value {
    fn from(val: bool) -> Value {
        Value::Bool(val)
    }
}

impl From<BigDecimal> for Value {
    fn from(val: BigDecimal) -> Value {
        Value::Decimal(val)
    }
}

impl From<Vec<Value>> for Value {
    fn from(val: Vec<Value>) -> Value {
        Value::List(val)
    }
}

impl From<NaiveDate> for Value {
    fn from(val: NaiveDate) -> Value {
        Value::Date(val)
    }
}

impl From<NaiveTime> for Value {
    fn from(val: NaiveTime) -> Value {
        Value::Time(val)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(val: NaiveDateTime) -> Value {
        Value::DateTime(val)
    }
}

/// Serialize a document to its JSON text form, as stored in the
/// `data` column.
pub fn encode(doc: &Document) -> Result<String> {
    let mut obj = serde_json::Map::new();
    for (field, value) in doc.iter() {
        obj.insert(field.clone(), to_json(value)?);
    }
    err_at!(FailConvert, serde_json::to_string(&serde_json::Value::Object(obj)))
}

/// Parse JSON text back into a document, reversing [encode].
pub fn decode(data: &str) -> Result<Document> {
    let jval: serde_json::Value = err_at!(FailConvert, serde_json::from_str(data))?;
    match from_json(jval)? {
        Value::Map(doc) => Ok(doc),
        val => err_at!(FailConvert, msg: "document must be a map, got {:?}", val),
    }
}

pub fn to_json(value: &Value) -> Result<serde_json::Value> {
    let jval = match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(val) => json!(val),
        Value::Integer(val) => json!(val),
        Value::Float(val) => match Number::from_f64(*val) {
            Some(num) => serde_json::Value::Number(num),
            None => return err_at!(UnsupportedType, msg: "non-finite float {}", val),
        },
        Value::Decimal(val) => json!({ "__decimal": val.to_string() }),
        Value::Str(val) => json!(val),
        Value::Bytes(val) => json!({ "__bytes": val }),
        Value::Date(val) => {
            json!({ "__date": [val.year(), val.month(), val.day()] })
        }
        Value::Time(val) => json!({
            "__time": [
                val.hour(), val.minute(), val.second(), val.nanosecond() / 1000
            ]
        }),
        Value::DateTime(val) => json!({
            "__datetime": [
                val.year() as i64,
                val.month() as i64,
                val.day() as i64,
                val.hour() as i64,
                val.minute() as i64,
                val.second() as i64,
                (val.nanosecond() / 1000) as i64,
            ]
        }),
        Value::Timedelta(val) => {
            let days = val.num_days();
            let rem = *val - Duration::days(days);
            let secs = rem.num_seconds();
            let micros = match (rem - Duration::seconds(secs)).num_microseconds() {
                Some(us) => us,
                None => return err_at!(FailConvert, msg: "timedelta overflow"),
            };
            json!({ "__timedelta": [days, secs, micros] })
        }
        Value::List(vals) => {
            let mut arr = vec![];
            for val in vals.iter() {
                arr.push(to_json(val)?);
            }
            serde_json::Value::Array(arr)
        }
        Value::Set(vals) => {
            let mut arr = vec![];
            for val in vals.iter() {
                arr.push(to_json(val)?);
            }
            json!({ "__set": arr })
        }
        Value::Map(doc) => {
            let mut obj = serde_json::Map::new();
            for (field, val) in doc.iter() {
                obj.insert(field.clone(), to_json(val)?);
            }
            serde_json::Value::Object(obj)
        }
    };
    Ok(jval)
}

pub fn from_json(jval: serde_json::Value) -> Result<Value> {
    let value = match jval {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(val) => Value::Bool(val),
        serde_json::Value::Number(num) => match num.as_i64() {
            Some(val) => Value::Integer(val),
            None => match num.as_f64() {
                Some(val) => Value::Float(val),
                None => return err_at!(FailConvert, msg: "bad number {}", num),
            },
        },
        serde_json::Value::String(val) => Value::Str(val),
        serde_json::Value::Array(arr) => {
            let mut vals = vec![];
            for jval in arr.into_iter() {
                vals.push(from_json(jval)?);
            }
            Value::List(vals)
        }
        serde_json::Value::Object(mut obj) => {
            // All adapted scalars are single-key objects.
            if obj.len() == 1 {
                let key = obj.keys().next().unwrap().clone();
                let adapted = matches!(
                    key.as_str(),
                    "__datetime" | "__date" | "__time" | "__timedelta" | "__decimal" | "__set"
                        | "__bytes"
                );
                if adapted {
                    let jval = obj.remove(&key).unwrap();
                    return match key.as_str() {
                        "__datetime" => from_datetime(jval),
                        "__date" => from_date(jval),
                        "__time" => from_time(jval),
                        "__timedelta" => from_timedelta(jval),
                        "__decimal" => from_decimal(jval),
                        "__set" => from_set(jval),
                        _ => from_bytes(jval),
                    };
                }
            }
            let mut doc = Document::new();
            for (field, jval) in obj.into_iter() {
                doc.insert(field, from_json(jval)?);
            }
            Value::Map(doc)
        }
    };
    Ok(value)
}

fn int_array(jval: serde_json::Value, n: usize, key: &str) -> Result<Vec<i64>> {
    let arr = match jval {
        serde_json::Value::Array(arr) if arr.len() == n => arr,
        jval => return err_at!(FailConvert, msg: "bad {} payload {:?}", key, jval),
    };
    let mut vals = vec![];
    for item in arr.into_iter() {
        match item.as_i64() {
            Some(val) => vals.push(val),
            None => return err_at!(FailConvert, msg: "bad {} payload", key),
        }
    }
    Ok(vals)
}

fn from_datetime(jval: serde_json::Value) -> Result<Value> {
    let v = int_array(jval, 7, "__datetime")?;
    let date = NaiveDate::from_ymd_opt(v[0] as i32, v[1] as u32, v[2] as u32);
    let dt = date
        .and_then(|d| d.and_hms_micro_opt(v[3] as u32, v[4] as u32, v[5] as u32, v[6] as u32));
    match dt {
        Some(dt) => Ok(Value::DateTime(dt)),
        None => err_at!(FailConvert, msg: "bad __datetime {:?}", v),
    }
}

fn from_date(jval: serde_json::Value) -> Result<Value> {
    let v = int_array(jval, 3, "__date")?;
    match NaiveDate::from_ymd_opt(v[0] as i32, v[1] as u32, v[2] as u32) {
        Some(date) => Ok(Value::Date(date)),
        None => err_at!(FailConvert, msg: "bad __date {:?}", v),
    }
}

fn from_time(jval: serde_json::Value) -> Result<Value> {
    let v = int_array(jval, 4, "__time")?;
    match NaiveTime::from_hms_micro_opt(v[0] as u32, v[1] as u32, v[2] as u32, v[3] as u32) {
        Some(time) => Ok(Value::Time(time)),
        None => err_at!(FailConvert, msg: "bad __time {:?}", v),
    }
}

fn from_timedelta(jval: serde_json::Value) -> Result<Value> {
    let v = int_array(jval, 3, "__timedelta")?;
    let dur = Duration::days(v[0]) + Duration::seconds(v[1]) + Duration::microseconds(v[2]);
    Ok(Value::Timedelta(dur))
}

fn from_decimal(jval: serde_json::Value) -> Result<Value> {
    match jval {
        serde_json::Value::String(text) => match BigDecimal::from_str(&text) {
            Ok(dec) => Ok(Value::Decimal(dec)),
            Err(err) => err_at!(FailConvert, msg: "bad __decimal {:?}: {}", text, err),
        },
        jval => err_at!(FailConvert, msg: "bad __decimal payload {:?}", jval),
    }
}

fn from_set(jval: serde_json::Value) -> Result<Value> {
    let arr = match jval {
        serde_json::Value::Array(arr) => arr,
        jval => return err_at!(FailConvert, msg: "bad __set payload {:?}", jval),
    };
    // first-occurrence order, de-duplicated.
    let mut vals: Vec<Value> = vec![];
    for item in arr.into_iter() {
        let val = from_json(item)?;
        if !vals.contains(&val) {
            vals.push(val);
        }
    }
    Ok(Value::Set(vals))
}

fn from_bytes(jval: serde_json::Value) -> Result<Value> {
    let arr = match jval {
        serde_json::Value::Array(arr) => arr,
        jval => return err_at!(FailConvert, msg: "bad __bytes payload {:?}", jval),
    };
    let mut bytes = vec![];
    for item in arr.into_iter() {
        match item.as_u64() {
            Some(byte) if byte < 256 => bytes.push(byte as u8),
            _ => return err_at!(FailConvert, msg: "bad __bytes payload"),
        }
    }
    Ok(Value::Bytes(bytes))
}

#[cfg(test)]
#[path = "value_test.rs"]
mod value_test;
