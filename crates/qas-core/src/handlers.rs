//! Readers for the files written during a fly scan.
//!
//! Pizza-box channels write whitespace-delimited text, one row per sample:
//!
//! ```text
//! encoder:        ts_s ts_ns encoder index state
//! digital input:  ts_s ts_ns encoder index di
//! analog input:   ts_s ts_ns index counts...   (counts in hex)
//! ```
//!
//! Resources reference these files with a `chunk_size`; each datum selects
//! one chunk of rows. The APB streaming box and its trigger output write
//! little-endian `i32` binary records instead.

use bytes::Buf;
use serde::Serialize;
use std::path::Path;

use crate::codec::{decode_encoder_count, parse_adc_hex};
use crate::error::{AppResult, FlyerError};

/// Seconds per tick of the APB sub-second counter.
pub const APB_TICK_SECONDS: f64 = 8.005_123_2e-9;

/// Columns per APB sample record.
pub const APB_COLUMNS: usize = 10;

/// Columns per APB trigger record.
pub const APB_TRIGGER_COLUMNS: usize = 3;

/// Decoded data columns of an APB record, in file order.
pub const APB_FIELDS: [&str; 8] = ["i0", "it", "ir", "iff", "aux1", "aux2", "aux3", "aux4"];

/// One encoder row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EncoderRow {
    /// Seconds part of the timestamp
    pub ts_s: i64,
    /// Nanoseconds part of the timestamp
    pub ts_ns: i64,
    /// Decoded encoder count
    pub encoder: i64,
    /// Sample index
    pub index: i64,
    /// Status bits
    pub state: i64,
}

/// One digital-input row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DigitalRow {
    /// Seconds part of the timestamp
    pub ts_s: i64,
    /// Nanoseconds part of the timestamp
    pub ts_ns: i64,
    /// Encoder column (raw)
    pub encoder: i64,
    /// Sample index
    pub index: i64,
    /// Digital input level
    pub di: i64,
}

/// One analog-input row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalogRow {
    /// `ts_s + 1e-9 * ts_ns`
    pub time: f64,
    /// Sample index
    pub index: i64,
    /// Decoded volts, one per ADC column
    pub volts: Vec<f64>,
}

/// One decoded APB sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApbSample {
    /// Timestamp in seconds
    pub timestamp: f64,
    /// Raw counts for each of [`APB_FIELDS`]
    pub values: [i32; 8],
}

/// One APB trigger transition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TriggerTransition {
    /// Timestamp in seconds
    pub timestamp: f64,
    /// Transition marker
    pub transition: i32,
}

fn parse_int(field: &str, line: usize) -> AppResult<i64> {
    field.parse::<i64>().map_err(|_| {
        FlyerError::Configuration(format!("line {line}: '{field}' is not an integer"))
    })
}

fn integer_rows(text: &str, columns: usize) -> AppResult<Vec<Vec<i64>>> {
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(n, line)| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < columns {
                return Err(FlyerError::Configuration(format!(
                    "line {}: expected {columns} columns, found {}",
                    n + 1,
                    fields.len()
                )));
            }
            fields[..columns]
                .iter()
                .map(|f| parse_int(f, n + 1))
                .collect()
        })
        .collect()
}

/// Parse encoder text.
pub fn parse_encoder_rows(text: &str) -> AppResult<Vec<EncoderRow>> {
    Ok(integer_rows(text, 5)?
        .into_iter()
        .map(|r| EncoderRow {
            ts_s: r[0],
            ts_ns: r[1],
            encoder: decode_encoder_count(r[2]),
            index: r[3],
            state: r[4],
        })
        .collect())
}

/// Parse digital-input text.
pub fn parse_digital_rows(text: &str) -> AppResult<Vec<DigitalRow>> {
    Ok(integer_rows(text, 5)?
        .into_iter()
        .map(|r| DigitalRow {
            ts_s: r[0],
            ts_ns: r[1],
            encoder: r[2],
            index: r[3],
            di: r[4],
        })
        .collect())
}

/// Parse analog-input text.
pub fn parse_analog_rows(text: &str) -> AppResult<Vec<AnalogRow>> {
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(n, line)| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return Err(FlyerError::Configuration(format!(
                    "line {}: analog rows need time, index and at least one sample",
                    n + 1
                )));
            }
            let ts_s = parse_int(fields[0], n + 1)?;
            let ts_ns = parse_int(fields[1], n + 1)?;
            let index = parse_int(fields[2], n + 1)?;
            let volts = fields[3..]
                .iter()
                .map(|f| {
                    parse_adc_hex(f).ok_or_else(|| {
                        FlyerError::Configuration(format!("line {}: '{f}' is not hex", n + 1))
                    })
                })
                .collect::<AppResult<Vec<f64>>>()?;
            Ok(AnalogRow {
                time: ts_s as f64 + 1e-9 * ts_ns as f64,
                index,
                volts,
            })
        })
        .collect()
}

/// Rows `[n * chunk_size, (n + 1) * chunk_size)`.
pub fn chunk<T>(rows: &[T], chunk_size: usize, chunk_num: usize) -> &[T] {
    let start = chunk_num.saturating_mul(chunk_size).min(rows.len());
    let end = start.saturating_add(chunk_size).min(rows.len());
    &rows[start..end]
}

/// Number of chunks needed for `rows` rows.
pub fn chunk_count(rows: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        0
    } else {
        rows.div_ceil(chunk_size)
    }
}

/// Count non-empty lines of a text file.
pub async fn count_rows(path: &Path) -> AppResult<usize> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(text.lines().filter(|l| !l.trim().is_empty()).count())
}

fn i32_records(mut data: &[u8], columns: usize) -> AppResult<Vec<Vec<i32>>> {
    let record = columns * 4;
    if data.len() % record != 0 {
        return Err(FlyerError::Configuration(format!(
            "binary length {} is not a multiple of {record}-byte records",
            data.len()
        )));
    }
    let mut rows = Vec::with_capacity(data.len() / record);
    while data.has_remaining() {
        rows.push((0..columns).map(|_| data.get_i32_le()).collect());
    }
    Ok(rows)
}

/// Decode an APB `.bin` file.
pub fn parse_apb_bin(data: &[u8]) -> AppResult<Vec<ApbSample>> {
    Ok(i32_records(data, APB_COLUMNS)?
        .into_iter()
        .map(|r| {
            let mut values = [0i32; 8];
            values.copy_from_slice(&r[..8]);
            ApbSample {
                timestamp: f64::from(r[8]) + f64::from(r[9]) * APB_TICK_SECONDS,
                values,
            }
        })
        .collect())
}

/// Decode an APB trigger `.bin` file.
pub fn parse_apb_trigger_bin(data: &[u8]) -> AppResult<Vec<TriggerTransition>> {
    Ok(i32_records(data, APB_TRIGGER_COLUMNS)?
        .into_iter()
        .map(|r| TriggerTransition {
            timestamp: f64::from(r[1]) + f64::from(r[2]) * APB_TICK_SECONDS,
            transition: r[0],
        })
        .collect())
}
