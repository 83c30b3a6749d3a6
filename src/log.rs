//! Structured record writer for access and fault logs.
//!
//! Records are flat JSON objects, one per line:
//!
//! ```text
//! {"level":"warn","time":"2026-01-01T00:00:00.000Z","status":404,"path":"/x",...}
//! ```
//!
//! The sink is anything implementing [`MakeWriter`]: `std::io::stdout`, a
//! file, a [`LogSink`](crate::testing::LogSink) in tests. Failures to write
//! are reported through `tracing` and otherwise ignored: logging never fails
//! a call.

use std::io::Write;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Writes JSON-lines records to a sink.
pub struct Logger {
    writer: BoxMakeWriter,
}

impl Logger {
    pub fn new<W>(sink: W) -> Self
    where
        W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
    {
        Self { writer: BoxMakeWriter::new(sink) }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout)
    }

    /// Starts a record at `level`. Nothing is written until [`Record::send`].
    pub fn record(&self, level: Level) -> Record<'_> {
        let mut fields = Map::new();
        fields.insert("level".to_owned(), Value::from(level_name(level)));
        fields.insert(
            "time".to_owned(),
            Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        Record { logger: self, fields }
    }

    fn write(&self, fields: &Map<String, Value>) {
        let mut line = match serde_json::to_vec(fields) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("dropping unencodable log record: {e}");
                return;
            }
        };
        line.push(b'\n');
        if let Err(e) = self.writer.make_writer().write_all(&line) {
            tracing::warn!("log sink write failed: {e}");
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::stdout()
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

/// One record being assembled.
#[must_use = "a record is only written by `send`"]
pub struct Record<'a> {
    logger: &'a Logger,
    fields: Map<String, Value>,
}

impl Record<'_> {
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_owned(), value.into());
        self
    }

    pub fn send(self) {
        self.logger.write(&self.fields);
    }
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LogSink;

    #[test]
    fn writes_one_json_object_per_line() {
        let sink = LogSink::default();
        let logger = Logger::new(sink.clone());

        logger.record(Level::WARN).field("status", 404).field("path", "/x").send();
        logger.record(Level::INFO).send();

        let lines = sink.records();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["level"], "warn");
        assert_eq!(lines[0]["status"], 404);
        assert_eq!(lines[0]["path"], "/x");
        assert!(lines[0]["time"].is_string());
        assert_eq!(lines[1]["level"], "info");
    }
}
