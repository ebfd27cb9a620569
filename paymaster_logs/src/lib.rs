//{{ Paymaster }}
//Copyright (C) {{ 2021,2022,2023,2024 }}  {{ Blockstream }}

//This program is free software: you can redistribute it and/or modify
//it under the terms of the GNU Affero General Public License as published by
//the Free Software Foundation, either version 3 of the License, or
//(at your option) any later version.

//This program is distributed in the hope that it will be useful,
//but WITHOUT ANY WARRANTY; without even the implied warranty of
//MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//GNU Affero General Public License for more details.

//You should have received a copy of the GNU Affero General Public License
//along with this program.  If not, see <http://www.gnu.org/licenses/>.


//! # Paymaster Logs
//!
//! A collection of standard log codes used by the paymaster daemons
//!

// Coding conventions
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]

extern crate bitcoin;
extern crate jsonrpc;
#[macro_use] extern crate lazy_static;
extern crate serde;
#[macro_use] extern crate serde_derive;
extern crate serde_json;
extern crate time;

extern crate paymaster_common as common;

#[macro_use] pub mod log;
pub mod disburser;
pub use self::disburser::*;
pub mod io_log;
pub use self::io_log::*;
pub mod rpc;
pub use self::rpc::*;
pub mod log_codes;

use std::{fmt, io, sync, thread};

use common::BatchCtx;

/// The log ID prefix for all paymaster logs.
pub const ID_PREFIX_DISBURSER: &str = "D";

/// Structure representing global log context
pub struct GlobalContext {
    /// Handle to output writer.
    out: Box<dyn io::Write + Send>,
    /// Name of the running process
    name: &'static str,
    /// Minimum severity at which to output a log
    min_severity: Severity,
}

lazy_static! {
    static ref GLOBAL_CONTEXT: sync::Mutex<GlobalContext> = sync::Mutex::new(
        GlobalContext {
            #[cfg(not(test))]
            out: Box::new(io::sink()),
            #[cfg(test)]
            out: Box::new(io::stdout()),
            name: "-",
            min_severity: Severity::Trace,
        }
    );
}

/// Initialize the logging infrastructure
pub fn initialize(min_severity: Severity, name: &'static str, out: Box<dyn io::Write + Send>) {
    let mut lock = GLOBAL_CONTEXT.lock().unwrap();
    lock.out = out;
    lock.name = name;
    lock.min_severity = min_severity;
}

/// The format string of the log timestamps.
pub const TIME_FORMAT: &str = "%F %T.%f%z";

fn serialize_time<S: serde::Serializer>(t: &time::Tm, s: S) -> Result<S::Ok, S::Error> {
    let tmfmt = t.strftime(TIME_FORMAT).unwrap();
    s.collect_str(&tmfmt)
}

fn deserialize_time<'de, D>(d: D) -> Result<time::Tm, D::Error>
    where D: serde::Deserializer<'de>,
{
    struct TmVisitor;
    impl<'de> serde::de::Visitor<'de> for TmVisitor {
        type Value = time::Tm;
        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a timestamp")
        }
        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> where E: serde::de::Error {
            time::strptime(v, TIME_FORMAT).map_err(serde::de::Error::custom)
        }
    }
    d.deserialize_str(TmVisitor)
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Severity of the log
pub enum Severity {
    /// Trace message (may contain secret data, will not be enabled on
    /// production systems)
    Trace,
    /// Debugging information
    Debug,
    /// Standard operation information
    Info,
    /// Potential problem
    Warn,
    /// Actual problem
    Error,
    /// Serious problem for which the program should be terminated.
    /// Logging such an error will cause the program to terminate.
    Fatal,
}

impl Severity {
    /// Severity in uppercase.
    pub fn upper(self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }
}

/// A log message as generated by this crate. This can be used by the user to
/// interpret the log with zero-copy deserialization.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LogMessage<'a> {
    #[serde(serialize_with = "serialize_time", deserialize_with = "deserialize_time")]
    pub time: time::Tm,
    pub process: &'a str,
    #[serde(default)]
    pub thread: Option<&'a str>,
    pub severity: Severity,
    pub log_id: &'a str,
    pub desc: &'a str,
    pub name: &'a str,
    pub file: &'a str,
    pub line: u32,
    #[serde(borrow)]
    pub context: &'a serde_json::value::RawValue,
    #[serde(borrow)]
    pub data: &'a serde_json::value::RawValue,
}

impl<'a> LogMessage<'a> {
    /// Parse the internal data, suggested to be used with explicit type parameter.
    pub fn parse<T: serde::Deserialize<'a>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.data.get())
    }

    /// Try interpret the log as the given log type.
    pub fn try_as<T: Log + serde::Deserialize<'a>>(&self) -> Option<T> {
        if self.log_id == T::LOG_ID {
            Some(self.parse().expect(&format!("log msg {} doesn't roundtrip", T::LOG_ID)))
        } else {
            None
        }
    }

    /// Get the batch context the log was emitted under.
    pub fn batch_ctx(&self) -> Result<BatchCtx, serde_json::Error> {
        serde_json::from_str(self.context.get())
    }
}

/// Internal generic version of [LogMessage].
#[derive(Serialize)]
struct InternalLogMessage<'process, 'thread, 'desc, 'file, 'name, 'ctx, 'data, C: serde::Serialize + 'ctx, D: serde::Serialize + 'data> {
    // Make sure this struct is always compatible with [LogMessage].
    #[serde(serialize_with = "serialize_time")]
    time: time::Tm,
    process: &'process str,
    #[serde(default)]
    thread: Option<&'thread str>,
    severity: Severity,
    log_id: &'static str,
    desc: &'desc str,
    name: &'name str,
    file: &'file str,
    line: u32,
    context: &'ctx C,
    data: &'data D,
}

/// Main log structure
pub trait Log: serde::Serialize + Sized {
    /// Severity level
    const SEVERITY: Severity;

    /// Unique log ID
    const LOG_ID: &'static str;

    /// Human-readable description
    fn desc(&self) -> &str;

    fn log_inner<C>(&self, mut output_sink: &mut Box<dyn io::Write + Send>,
        process: &str, file: &str, line: u32, name: &str, context: &C)
    where
        C: serde::Serialize,
    {
        debug_assert_eq!(&Self::LOG_ID[0..1], ID_PREFIX_DISBURSER);

        serde_json::to_writer(
            &mut output_sink,
            &InternalLogMessage {
                time: time::now(),
                process: process,
                thread: thread::current().name(),
                severity: Self::SEVERITY,
                log_id: Self::LOG_ID,
                desc: self.desc(),
                name: name,
                file: file,
                line: line,
                context: context,
                data: self,
            },
        ).expect("writing log line");
        writeln!(output_sink, "").expect("writing newline");
    }

    /// Output the log line
    fn log<C: serde::Serialize>(&self, file: &str, line: u32, name: &str, ctx: &C) {
        let mut gctx = GLOBAL_CONTEXT.lock().unwrap();
        let gctx = &mut *gctx;  // coach borrowck on individual fields resulting from MutexGuard

        if Self::SEVERITY < gctx.min_severity {
            return;
        }

        // Lock both stdout and stderr to synchronize logging.
        let stdout = io::stdout();
        let _stdout_lock = stdout.lock();
        let stderr = io::stderr();
        let _stderr_lock = stderr.lock();

        let process = gctx.name;
        self.log_inner(&mut gctx.out, process, file, line, name, ctx);

        assert!(Self::SEVERITY != Severity::Fatal,
            "fatal log was not called with slog_fatal: {}", Self::LOG_ID,
        );
    }

    /// Output the log line and abort the program
    fn log_fatal<C: serde::Serialize>(&self, file: &str, line: u32, name: &str, ctx: &C) -> ! {
        {
            let mut gctx = GLOBAL_CONTEXT.lock().unwrap();

            // Lock both stdout and stderr to synchronize logging.
            let stdout = io::stdout();
            let _stdout_lock = stdout.lock();
            let stderr = io::stderr();
            let _stderr_lock = stderr.lock();

            let process = gctx.name;
            self.log_inner(&mut gctx.out, process, file, line, name, ctx);
        }

        // Include log code in panic message to aid unit testing.
        panic!("Encountered fatal log {}.", Self::LOG_ID);
    }
}


lazy_static! {
    static ref GLOBAL_BATCH_CTX: sync::Mutex<BatchCtx> = sync::Mutex::new(
        Default::default()
    );
}

/// Set the global batch context to some new value
pub fn set_batch_ctx(new_ctx: BatchCtx) {
    let mut lock = GLOBAL_BATCH_CTX.lock().unwrap();
    *lock = new_ctx;
}

pub fn get_batch_ctx() -> BatchCtx {
    *GLOBAL_BATCH_CTX.lock().unwrap()
}

fn serialize_display<S: serde::Serializer>(
    d: impl fmt::Display,
    s: S,
) -> Result<S::Ok, S::Error> {
    s.collect_str(&d)
}

/// Obtain the filename of the source file a log is coming from,
/// with the long path stripped
#[macro_export]
macro_rules! filename {
    () => (file!().rsplit("paymaster/").next().unwrap())
}

/// Create a structured log.
///
/// Usage:
/// ```rust,ignore
/// slog!(PaymentComplete, payment_id: id, txid: txid, amount_sat: amt, n_broadcasts: n);
/// ```
#[macro_export]
macro_rules! slog {
    ($struct:ident) => {{
        $crate::Log::log(&$crate::$struct { }, $crate::filename!(), line!(), stringify!($struct), &$crate::get_batch_ctx())
    }};
    ($struct:ident, $( $args:tt )*) => {{
        $crate::Log::log(&$crate::$struct {
            $( $args )*
        }, $crate::filename!(), line!(), stringify!($struct), &$crate::get_batch_ctx())
    }};
}

/// Create a fatal structured log.
///
/// Usage similar to slog!.
#[macro_export]
macro_rules! slog_fatal {
    ($struct:ident, $( $args:tt )*) => {{
        $crate::Log::log_fatal(&$crate::$struct {
            $( $args )*
        }, $crate::filename!(), line!(), stringify!($struct), &$crate::get_batch_ctx())
    }}
}

/// A legacy unstructured log message generated by code that has not converted
/// to using the new mechanism. Trace-level.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Default)]
pub struct LegacyUnconvertedLogTrace {
    /// Legacy output
    pub message: String,
}

/// A legacy unstructured log message generated by code that has not converted
/// to using the new mechanism. Debug-level.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Default)]
pub struct LegacyUnconvertedLogDebug {
    /// Legacy output
    pub message: String,
}

/// A legacy unstructured log message generated by code that has not converted
/// to using the new mechanism. Info-level.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Default)]
pub struct LegacyUnconvertedLogInfo {
    /// Legacy output
    pub message: String,
}

/// A legacy unstructured log message generated by code that has not converted
/// to using the new mechanism. Warn-level.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Default)]
pub struct LegacyUnconvertedLogWarn {
    /// Legacy output
    pub message: String,
}

/// A legacy unstructured log message generated by code that has not converted
/// to using the new mechanism. Error-level.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Default)]
pub struct LegacyUnconvertedLogError {
    /// Legacy output
    pub message: String,
}

/// A legacy unstructured log message generated by code that has not converted
/// to using the new mechanism. Fatal-level.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Default)]
pub struct LegacyUnconvertedLogFatal {
    /// Legacy output
    pub message: String,
}
