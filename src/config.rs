use serde::{Deserialize, Deserializer};

use std::{convert::TryFrom, ffi, fs, result, time};

use crate::{Error, Result};

/// Default value for the maintenance latency budget, in milliseconds.
/// Higher values finish indexing/unindexing/vacuuming faster, lower
/// values keep request latency down.
pub const DESIRED_LATENCY: u64 = 10;
/// Default value for the request-queue wait during the WAIT phase,
/// in milliseconds.
pub const IDLE_TIMEOUT: u64 = 25;
/// Default cap on index rows produced per document.
pub const MAX_INDEX_ROW_COUNT: usize = 100;
/// Default cap on the packed payload length of a single index row.
pub const MAX_INDEX_ROW_LENGTH: usize = 512;
/// Default number of SQLite blocks cached per table.
pub const CACHE_SIZE: i64 = 2000;
/// Default block size for newly created tables.
pub const BLOCK_SIZE: i64 = 8192;
/// Default minimum number of free blocks before an incremental vacuum
/// is worth scheduling.
pub const MINIMUM_VACUUM_BLOCKS: i64 = 100;

/// Block sizes SQLite accepts for `PRAGMA page_size`.
pub const PAGE_SIZES: [i64; 7] = [512, 1024, 2048, 4096, 8192, 16384, 32768];

/// Policy when a document expands to more index rows than
/// [Config::max_index_row_count].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverCount {
    /// Fail the whole operation.
    Fail,
    /// Keep the first rows up to the cap, silently drop the rest. Which
    /// rows are dropped is unspecified but deterministic for a fixed
    /// document.
    Discard,
}

/// Policy when a single packed row payload exceeds
/// [Config::max_index_row_length].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverSize {
    /// Fail the whole operation.
    Fail,
    /// Skip the offending row.
    Discard,
    /// Keep the leading `max_index_row_length` bytes of the payload.
    Truncate,
}

/// SQLite auto-vacuum mode, as per `PRAGMA auto_vacuum`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoVacuum {
    None,
    Full,
    Incremental,
}

impl AutoVacuum {
    pub fn to_pragma(&self) -> i64 {
        match self {
            AutoVacuum::None => 0,
            AutoVacuum::Full => 1,
            AutoVacuum::Incremental => 2,
        }
    }

    pub fn from_pragma(val: i64) -> Result<AutoVacuum> {
        match val {
            0 => Ok(AutoVacuum::None),
            1 => Ok(AutoVacuum::Full),
            2 => Ok(AutoVacuum::Incremental),
            val => err_at!(FailConvert, msg: "auto_vacuum {}", val),
        }
    }
}

/// Configuration for a table and its worker.
///
/// Construct with [Config::default] or [Config::from_file] and refine
/// using the `set_` methods.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory under which table files are created.
    ///
    /// Default: "."
    #[serde(deserialize_with = "path_field")]
    pub path: ffi::OsString,
    /// Maintenance latency budget, in milliseconds.
    ///
    /// Default: [DESIRED_LATENCY]
    pub desired_latency: u64,
    /// WAIT-phase queue timeout, in milliseconds.
    ///
    /// Default: [IDLE_TIMEOUT]
    pub idle_timeout: u64,
    /// Maximum number of index rows to produce per document. Checked
    /// against the logical (pre-policy) cartesian count.
    ///
    /// Default: [MAX_INDEX_ROW_COUNT]
    pub max_index_row_count: usize,
    /// What to do when a document expands past `max_index_row_count`.
    ///
    /// Default: [OverCount::Fail]
    pub too_many_rows: OverCount,
    /// Maximum packed payload length of one index row, excluding the
    /// index-id prefix.
    ///
    /// Default: [MAX_INDEX_ROW_LENGTH]
    pub max_index_row_length: usize,
    /// What to do when a packed row exceeds `max_index_row_length`.
    ///
    /// Default: [OverSize::Fail]
    pub row_too_long: OverSize,
    /// SQLite auto-vacuum mode. Flipping this between none and
    /// full/incremental on an existing table forces a full VACUUM on
    /// open.
    ///
    /// Default: [AutoVacuum::Full]
    pub autovacuum: AutoVacuum,
    /// SQLite cache size, in blocks.
    ///
    /// Default: [CACHE_SIZE]
    pub cache_size: i64,
    /// SQLite page size for newly created tables, one of [PAGE_SIZES].
    ///
    /// Default: [BLOCK_SIZE]
    pub block_size: i64,
    /// Minimum free-block count before the vacuum phase runs.
    ///
    /// Default: [MINIMUM_VACUUM_BLOCKS]
    pub minimum_vacuum_blocks: i64,
}

// os-strings deserialize from plain text
fn path_field<'de, D>(de: D) -> result::Result<ffi::OsString, D::Error>
where
    D: Deserializer<'de>,
{
    let path = String::deserialize(de)?;
    Ok(ffi::OsString::from(path))
}

impl Default for Config {
    fn default() -> Config {
        Config {
            path: ffi::OsString::from("."),
            desired_latency: DESIRED_LATENCY,
            idle_timeout: IDLE_TIMEOUT,
            max_index_row_count: MAX_INDEX_ROW_COUNT,
            too_many_rows: OverCount::Fail,
            max_index_row_length: MAX_INDEX_ROW_LENGTH,
            row_too_long: OverSize::Fail,
            autovacuum: AutoVacuum::Full,
            cache_size: CACHE_SIZE,
            block_size: BLOCK_SIZE,
            minimum_vacuum_blocks: MINIMUM_VACUUM_BLOCKS,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. Missing keys fall back to
    /// their defaults.
    pub fn from_file(loc: &ffi::OsStr) -> Result<Config> {
        let data = err_at!(IOError, fs::read(loc), "config {:?}", loc)?;
        let config: Config = err_at!(FailConvert, toml::from_slice(&data))?;
        config.validate()?;
        Ok(config)
    }

    /// Directory under which table files are created.
    pub fn set_path(&mut self, path: &ffi::OsStr) -> &mut Self {
        self.path = path.to_os_string();
        self
    }

    /// Configure the maintenance latency budget and the WAIT-phase
    /// timeout, both in milliseconds.
    pub fn set_latency(&mut self, desired: u64, idle_timeout: u64) -> &mut Self {
        self.desired_latency = desired;
        self.idle_timeout = idle_timeout;
        self
    }

    /// Configure index-row expansion policies.
    pub fn set_row_policy(&mut self, over_count: OverCount, over_size: OverSize) -> &mut Self {
        self.too_many_rows = over_count;
        self.row_too_long = over_size;
        self
    }

    /// Configure index-row expansion caps.
    pub fn set_row_limits(&mut self, max_count: usize, max_length: usize) -> &mut Self {
        self.max_index_row_count = max_count;
        self.max_index_row_length = max_length;
        self
    }

    /// Configure the underlying engine's vacuum behavior.
    pub fn set_vacuum(&mut self, mode: AutoVacuum, minimum_blocks: i64) -> &mut Self {
        self.autovacuum = mode;
        self.minimum_vacuum_blocks = minimum_blocks;
        self
    }

    /// Validate engine parameters. Called by [TableAdapter::open].
    ///
    /// [TableAdapter::open]: crate::table::TableAdapter::open
    pub fn validate(&self) -> Result<()> {
        if !PAGE_SIZES.contains(&self.block_size) {
            err_at!(Fatal, msg: "bad block_size {}", self.block_size)
        } else {
            Ok(())
        }
    }
}

impl Config {
    pub fn to_desired_latency(&self) -> time::Duration {
        time::Duration::from_millis(self.desired_latency)
    }

    pub fn to_idle_timeout(&self) -> time::Duration {
        time::Duration::from_millis(self.idle_timeout)
    }

    /// Compose the path to the table's database file,
    /// `<path>/<table>.sqlite`.
    pub fn to_dbfile(&self, table: &str) -> ffi::OsString {
        let loc: std::path::PathBuf = [
            self.path.clone(),
            ffi::OsString::from(format!("{}.sqlite", table)),
        ]
        .iter()
        .collect();
        loc.into_os_string()
    }
}

impl TryFrom<&[u8]> for Config {
    type Error = Error;

    fn try_from(data: &[u8]) -> Result<Config> {
        let config: Config = err_at!(FailConvert, toml::from_slice(data))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
