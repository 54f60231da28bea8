use bigdecimal::BigDecimal;
use chrono::{Duration, NaiveDate, NaiveTime};
use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::str::FromStr;

use super::*;

// Pack every value, sort by the packed bytes, and check the semantic
// keys come out ordered (reversed when neg).
fn verify_order<K: Clone + PartialOrd + std::fmt::Debug>(
    pairs: Vec<(K, Vec<u8>)>,
    neg: bool,
) {
    let mut pairs = pairs;
    pairs.sort_by(|a, b| a.1.cmp(&b.1));
    for window in pairs.windows(2) {
        let (ka, ea) = &window[0];
        let (kb, eb) = &window[1];
        if ea == eb {
            assert!(ka == kb, "{:?} {:?} pack equal", ka, kb);
        } else if neg {
            assert!(ka > kb, "{:?} {:?} not descending", ka, kb);
        } else {
            assert!(ka < kb, "{:?} {:?} not ascending", ka, kb);
        }
    }
}

#[test]
fn test_packing_int() {
    let seed: u64 = random();
    println!("test_packing_int {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let mut vals: Vec<i64> = (-1000..1000).collect();
    for _ in 0..1000 {
        vals.push(rng.gen_range(-(1_i64 << 30)..(1_i64 << 30)));
    }
    vals.push(i64::MIN);
    vals.push(i64::MAX);

    for neg in [false, true].iter() {
        let pairs: Vec<(i64, Vec<u8>)> = vals
            .iter()
            .map(|v| (*v, pack(&Value::Integer(*v), true, *neg).unwrap()))
            .collect();
        verify_order(pairs, *neg);
    }
}

#[test]
fn test_packing_float() {
    let seed: u64 = random();
    println!("test_packing_float {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let mut vals: Vec<f64> = vec![0.0, -0.0, 1.0, -1.0];
    for _ in 0..1000 {
        let sign = if rng.gen::<bool>() { 1.0 } else { -1.0 };
        let exp: i32 = rng.gen_range(-20..21);
        vals.push(sign * rng.gen::<f64>() * 10f64.powi(exp));
    }

    for neg in [false, true].iter() {
        let pairs: Vec<(f64, Vec<u8>)> = vals
            .iter()
            .map(|v| (*v, pack(&Value::Float(*v), true, *neg).unwrap()))
            .collect();
        let mut pairs = pairs;
        pairs.sort_by(|a, b| a.1.cmp(&b.1));
        for window in pairs.windows(2) {
            let (ka, ea) = &window[0];
            let (kb, eb) = &window[1];
            if ea == eb {
                assert!(ka == kb || (*ka == 0.0 && *kb == 0.0), "{} {}", ka, kb);
            } else if *neg {
                assert!(ka > kb, "{} {} not descending", ka, kb);
            } else {
                assert!(ka < kb, "{} {} not ascending", ka, kb);
            }
        }
    }
}

#[test]
fn test_packing_decimal() {
    let seed: u64 = random();
    println!("test_packing_decimal {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let mut vals: Vec<BigDecimal> = vec![];
    for _ in 0..1000 {
        let sign = if rng.gen::<bool>() { 1.0 } else { -1.0 };
        let exp: i32 = rng.gen_range(-20..21);
        let f = sign * rng.gen::<f64>() * 10f64.powi(exp);
        vals.push(BigDecimal::from_str(&format!("{}", f)).unwrap());
    }
    vals.push(BigDecimal::from(0));
    vals.push(BigDecimal::from(-1));
    vals.push(BigDecimal::from(1));

    for neg in [false, true].iter() {
        let pairs: Vec<(BigDecimal, Vec<u8>)> = vals
            .iter()
            .map(|v| (v.clone(), pack(&Value::Decimal(v.clone()), true, *neg).unwrap()))
            .collect();
        verify_order(pairs, *neg);
    }
}

#[test]
fn test_packing_decimal_normalized() {
    let a = pack(&Value::Decimal(BigDecimal::from_str("1.5").unwrap()), true, false).unwrap();
    let b = pack(&Value::Decimal(BigDecimal::from_str("1.50").unwrap()), true, false).unwrap();
    assert_eq!(a, b);

    // zero sits between every negative and every positive
    let zero = pack(&Value::Decimal(BigDecimal::from(0)), true, false).unwrap();
    let pos = pack(&Value::Decimal(BigDecimal::from_str("0.0001").unwrap()), true, false).unwrap();
    let min = pack(&Value::Decimal(BigDecimal::from_str("-0.0001").unwrap()), true, false).unwrap();
    assert!(min < zero && zero < pos);
}

#[test]
fn test_packing_bytes() {
    let seed: u64 = random();
    println!("test_packing_bytes {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let mut vals: Vec<Vec<u8>> = vec![vec![], vec![0], vec![0, 0, 1]];
    for _ in 0..1000 {
        let n = rng.gen_range(10..50);
        vals.push((0..n).map(|_| rng.gen::<u8>()).collect());
    }

    for neg in [false, true].iter() {
        for cs in [true, false].iter() {
            let pairs: Vec<(Vec<u8>, Vec<u8>)> = vals
                .iter()
                .map(|v| {
                    let key = if *cs { v.clone() } else { v.to_ascii_lowercase() };
                    (key, pack(&Value::Bytes(v.clone()), *cs, *neg).unwrap())
                })
                .collect();
            verify_order(pairs, *neg);
        }
    }
}

#[test]
fn test_packing_str() {
    let seed: u64 = random();
    println!("test_packing_str {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let mut vals: Vec<String> = vec!["".to_string(), "a".to_string(), "A".to_string()];
    for _ in 0..1000 {
        let n = rng.gen_range(10..50);
        let s: String = (0..n)
            .map(|_| std::char::from_u32(rng.gen_range(0..0xd7b0)).unwrap())
            .collect();
        vals.push(s);
    }

    for neg in [false, true].iter() {
        for cs in [true, false].iter() {
            let pairs: Vec<(String, Vec<u8>)> = vals
                .iter()
                .map(|v| {
                    let key = if *cs { v.clone() } else { v.to_lowercase() };
                    (key, pack(&Value::Str(v.clone()), *cs, *neg).unwrap())
                })
                .collect();
            verify_order(pairs, *neg);
        }
    }
}

#[test]
fn test_packing_datetime() {
    let seed: u64 = random();
    println!("test_packing_datetime {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let mut vals = vec![];
    for _ in 0..1000 {
        // ordinal day 1 is 0001-01-01, 3652059 is 9999-12-31
        let date = NaiveDate::from_num_days_from_ce_opt(rng.gen_range(1..3652060)).unwrap();
        let dt = date.and_hms_opt(0, 0, 0).unwrap()
            + Duration::seconds(rng.gen_range(0..86400))
            + Duration::microseconds(rng.gen_range(0..1_000_000));
        vals.push(dt);
    }

    for neg in [false, true].iter() {
        let pairs = vals
            .iter()
            .map(|v| (*v, pack(&Value::DateTime(*v), true, *neg).unwrap()))
            .collect();
        verify_order(pairs, *neg);
    }
}

#[test]
fn test_packing_date() {
    let seed: u64 = random();
    println!("test_packing_date {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let mut vals = vec![];
    for _ in 0..1000 {
        vals.push(NaiveDate::from_num_days_from_ce_opt(rng.gen_range(1..3652060)).unwrap());
    }

    for neg in [false, true].iter() {
        let pairs = vals
            .iter()
            .map(|v| (*v, pack(&Value::Date(*v), true, *neg).unwrap()))
            .collect();
        verify_order(pairs, *neg);
    }

    // a date packs like its midnight datetime
    let date = NaiveDate::from_ymd_opt(2010, 7, 4).unwrap();
    let dt = date.and_hms_opt(0, 0, 0).unwrap();
    assert_eq!(
        pack(&Value::Date(date), true, false).unwrap(),
        pack(&Value::DateTime(dt), true, false).unwrap()
    );
}

#[test]
fn test_packing_time() {
    let seed: u64 = random();
    println!("test_packing_time {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let mut vals = vec![];
    for _ in 0..1000 {
        let t = NaiveTime::from_hms_micro_opt(
            rng.gen_range(0..24),
            rng.gen_range(0..60),
            rng.gen_range(0..60),
            rng.gen_range(0..1_000_000),
        )
        .unwrap();
        vals.push(t);
    }

    for neg in [false, true].iter() {
        let pairs = vals
            .iter()
            .map(|v| (*v, pack(&Value::Time(*v), true, *neg).unwrap()))
            .collect();
        verify_order(pairs, *neg);
    }
}

#[test]
fn test_pack_sequence() {
    let vals = vec![
        Value::Integer(1),
        Value::Integer(40),
        Value::Float(1.4),
        Value::Decimal(BigDecimal::from_str("4.2").unwrap()),
        Value::Str("hello".to_string()),
        Value::Null,
    ];
    let seqa = pack(&Value::List(vals.clone()), true, false).unwrap();
    let mut seqb = vec![];
    for val in vals.iter() {
        seqb.extend(pack(val, true, false).unwrap());
    }
    assert_eq!(seqa, seqb);

    // sets pack the same way
    let seqc = pack(&Value::Set(vals), true, false).unwrap();
    assert_eq!(seqa, seqc);
}

#[test]
fn test_pack_none() {
    assert_eq!(pack(&Value::Null, true, false).unwrap(), vec![b'a']);
    assert_eq!(pack(&Value::Null, true, true).unwrap(), vec![b'z']);
    // ascending: null sorts before every other tag
    let packed = pack(&Value::Integer(0), true, false).unwrap();
    assert!(vec![b'a'] < packed);
}

#[test]
fn test_pack_unsupported() {
    match pack(&Value::Bool(true), true, false) {
        Err(Error::UnsupportedType(_, _)) => (),
        res => panic!("{:?}", res),
    }
    match pack(&Value::Timedelta(Duration::seconds(1)), true, false) {
        Err(Error::UnsupportedType(_, _)) => (),
        res => panic!("{:?}", res),
    }
    match pack(&Value::Map(crate::value::Document::new()), true, false) {
        Err(Error::UnsupportedType(_, _)) => (),
        res => panic!("{:?}", res),
    }
}

#[test]
fn test_pack_index_id() {
    // the integer encoding with its tag stripped
    let full = pack(&Value::Integer(7), true, false).unwrap();
    assert_eq!(pack_index_id(7), full[1..].to_vec());
    // ids order as integers, so drop ranges stay contiguous
    assert!(pack_index_id(1) < pack_index_id(2));
    assert!(pack_index_id(255) < pack_index_id(256));
}
