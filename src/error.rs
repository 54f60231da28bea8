use std::{error, fmt, result};

/// Short form to compose Error values.
///
/// Here are few possible ways,
///
/// ```ignore
/// use crate::Error;
/// err_at!(MalformedFilter, msg: "bad limit clause {:?}", limit)
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(SQLError, conn.execute(query, params))
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(IOError, fs::remove_file(&loc), "table {}", name)
/// ```
///
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err(Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err(Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err(Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

/// Type alias for Result return type, used by this package.
pub type Result<T> = result::Result<T, Error>;

/// Error variants that can be returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the
/// error location, and a message.
#[derive(Clone, PartialEq)]
pub enum Error {
    /// Column name failed the `[-+]?[a-z_][a-z0-9_]*[-+]?` shape or hit
    /// the reserved-word blacklist.
    BadColumnName(String, String),
    /// Empty column list passed to add_index.
    IndexWarning(String, String),
    /// New index duplicates, or is a prefix of, an existing index.
    DuplicateIndex(String, String),
    /// No known index covers the query's filter+order.
    TableIndex(String, String),
    /// Filter/order/limit clause does not obey the filter grammar.
    MalformedFilter(String, String),
    /// Cartesian expansion produced more rows than the configured cap.
    TooManyIndexRows(String, String),
    /// A single packed row exceeded the configured payload length.
    IndexRowTooLong(String, String),
    /// Value type has no order-preserving encoding.
    UnsupportedType(String, String),
    /// Timezone-aware date/time reached a naive-only boundary.
    NaiveRequired(String, String),
    /// Unknown or underscore-prefixed operation name.
    InvalidOperation(String, String),
    /// Response payload did not fit any known shape (client side).
    BadResponse(String, String),
    /// Worker crashed outside request handling.
    Unknown(String, String),
    Fatal(String, String),
    FailConvert(String, String),
    IOError(String, String),
    IPCFail(String, String),
    ThreadFail(String, String),
    SQLError(String, String),
}

impl Error {
    /// Wire name for this error kind, used in exception payloads.
    pub fn to_name(&self) -> &'static str {
        match self {
            Error::BadColumnName(_, _) => "BadColumnName",
            Error::IndexWarning(_, _) => "IndexWarning",
            Error::DuplicateIndex(_, _) => "DuplicateIndex",
            Error::TableIndex(_, _) => "TableIndexError",
            Error::MalformedFilter(_, _) => "MalformedFilterError",
            Error::TooManyIndexRows(_, _) => "TooManyIndexRows",
            Error::IndexRowTooLong(_, _) => "IndexRowTooLong",
            Error::UnsupportedType(_, _) => "UnsupportedType",
            Error::NaiveRequired(_, _) => "NaiveRequired",
            Error::InvalidOperation(_, _) => "InvalidOperation",
            Error::BadResponse(_, _) => "BadResponseCode",
            Error::Unknown(_, _) => "UnknownExceptionError",
            Error::Fatal(_, _) => "Fatal",
            Error::FailConvert(_, _) => "FailConvert",
            Error::IOError(_, _) => "IOError",
            Error::IPCFail(_, _) => "IPCFail",
            Error::ThreadFail(_, _) => "ThreadFail",
            Error::SQLError(_, _) => "SQLError",
        }
    }

    /// Rebuild an error from its wire name and message, the reverse of
    /// [Error::to_name]. Unrecognized names come back as `BadResponse`.
    pub fn from_name(name: &str, prefix: String, msg: String) -> Error {
        match name {
            "BadColumnName" => Error::BadColumnName(prefix, msg),
            "IndexWarning" => Error::IndexWarning(prefix, msg),
            "DuplicateIndex" => Error::DuplicateIndex(prefix, msg),
            "TableIndexError" => Error::TableIndex(prefix, msg),
            "MalformedFilterError" => Error::MalformedFilter(prefix, msg),
            "TooManyIndexRows" => Error::TooManyIndexRows(prefix, msg),
            "IndexRowTooLong" => Error::IndexRowTooLong(prefix, msg),
            "UnsupportedType" => Error::UnsupportedType(prefix, msg),
            "NaiveRequired" => Error::NaiveRequired(prefix, msg),
            "InvalidOperation" => Error::InvalidOperation(prefix, msg),
            "UnknownExceptionError" => Error::Unknown(prefix, msg),
            "Fatal" => Error::Fatal(prefix, msg),
            "FailConvert" => Error::FailConvert(prefix, msg),
            "IOError" => Error::IOError(prefix, msg),
            "IPCFail" => Error::IPCFail(prefix, msg),
            "ThreadFail" => Error::ThreadFail(prefix, msg),
            "SQLError" => Error::SQLError(prefix, msg),
            name => {
                let msg = format!("{}: {}", name, msg);
                Error::BadResponse(prefix, msg)
            }
        }
    }

    fn to_parts(&self) -> (&str, &str) {
        match self {
            Error::BadColumnName(p, m) => (p, m),
            Error::IndexWarning(p, m) => (p, m),
            Error::DuplicateIndex(p, m) => (p, m),
            Error::TableIndex(p, m) => (p, m),
            Error::MalformedFilter(p, m) => (p, m),
            Error::TooManyIndexRows(p, m) => (p, m),
            Error::IndexRowTooLong(p, m) => (p, m),
            Error::UnsupportedType(p, m) => (p, m),
            Error::NaiveRequired(p, m) => (p, m),
            Error::InvalidOperation(p, m) => (p, m),
            Error::BadResponse(p, m) => (p, m),
            Error::Unknown(p, m) => (p, m),
            Error::Fatal(p, m) => (p, m),
            Error::FailConvert(p, m) => (p, m),
            Error::IOError(p, m) => (p, m),
            Error::IPCFail(p, m) => (p, m),
            Error::ThreadFail(p, m) => (p, m),
            Error::SQLError(p, m) => (p, m),
        }
    }

    /// Message half of the error, without the location prefix.
    pub fn to_message(&self) -> String {
        self.to_parts().1.to_string()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        let (prefix, msg) = self.to_parts();
        write!(f, "{} {} {}", self.to_name(), prefix, msg)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl error::Error for Error {}
