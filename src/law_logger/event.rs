// law_logger - Signed log shipping to Azure Log Analytics
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::Value;
use std::io;

/// Severity numbers stored in the `severity` column of the log table.
///
/// These follow the numbering used by most logging libraries, with larger
/// numbers being more severe.
pub mod severity {
    use tracing::Level;

    pub const DEBUG: i64 = 10;
    pub const INFO: i64 = 20;
    pub const WARNING: i64 = 30;
    pub const ERROR: i64 = 40;
    pub const CRITICAL: i64 = 50;

    /// Severity number to use for events at the given `tracing` level.
    ///
    /// There's no trace severity in the log table so trace and debug share a value.
    pub fn severity_for(level: &Level) -> i64 {
        match *level {
            Level::ERROR => ERROR,
            Level::WARN => WARNING,
            Level::INFO => INFO,
            _ => DEBUG,
        }
    }
}

/// A single row to be written to the custom log table.
///
/// Field order matters: the serialized body is signed, and both fields are always
/// written as `message` followed by `severity`.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub message: String,
    pub severity: i64,
}

impl LogEvent {
    pub fn new<S: Into<String>>(message: S, severity: i64) -> Self {
        LogEvent {
            message: message.into(),
            severity,
        }
    }

    /// Build an event from loosely typed input, such as a line of JSON read from a job.
    ///
    /// The log table creates a new column whenever a field shows up with a different
    /// type than before, so `message` must be a string and `severity` must be an integer.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let message = value.get("message");
        let severity = value.get("severity");

        match (message.and_then(Value::as_str), severity.and_then(Value::as_i64)) {
            (Some(m), Some(s)) => Ok(LogEvent::new(m, s)),
            _ => Err(format!(
                "invalid types for log message, expected message to be a string and severity to be an integer, got message: {}, severity: {}",
                type_name(message),
                type_name(severity)
            )),
        }
    }

    /// Serialize the event to the exact body that is signed and sent.
    ///
    /// Output uses `", "` and `": "` as separators and escapes everything outside of
    /// printable ASCII, so the byte length of the body is also its length in characters.
    pub fn to_body(&self) -> Result<String, serde_json::Error> {
        let mut buf = Vec::with_capacity(self.message.len() + 32);
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, SpacedAsciiFormatter);
        self.serialize(&mut ser)?;
        // Only printable ASCII and escapes are ever written
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

fn type_name(v: Option<&Value>) -> &'static str {
    match v {
        None => "missing",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(n)) if n.is_f64() => "float",
        Some(Value::Number(n)) if n.is_u64() && n.as_i64().is_none() => "integer out of range",
        Some(Value::Number(_)) => "integer",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}

struct SpacedAsciiFormatter;

impl Formatter for SpacedAsciiFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W: ?Sized + io::Write>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()> {
        for c in fragment.chars() {
            if (' '..='~').contains(&c) {
                writer.write_all(&[c as u8])?;
            } else {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }

        Ok(())
    }
}
