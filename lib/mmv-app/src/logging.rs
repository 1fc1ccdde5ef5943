//! Logging.

use std::fmt;

use chrono::Utc;
use serde::Deserialize;
use tracing::{field, Event, Subscriber};
use tracing_subscriber::{
    field::VisitOutput,
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt as _,
    registry::LookupSpan,
    util::SubscriberInitExt as _,
    EnvFilter, Layer,
};

use crate::GenericError;

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Log filtering directives.
///
/// Accepts anything `EnvFilter` does: a bare level (`debug`), or a comma-separated list of per-target directives
/// (`info,mmv_writer=trace`). Directives are validated when deserialized.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(try_from = "String")]
pub struct LogLevel(String);

impl LogLevel {
    /// Returns the directives as written.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn to_env_filter(&self) -> EnvFilter {
        // Directives were validated on the way in, so falling back to the default here never drops anything.
        EnvFilter::try_new(&self.0).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self("info".to_string())
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match EnvFilter::try_new(&value) {
            Ok(_) => Ok(Self(value)),
            Err(e) => Err(format!("invalid log level '{}': {}", value, e)),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct LoggingConfiguration {
    /// Log filtering directives. Defaults to `info`.
    pub log_level: LogLevel,

    /// Whether to write logs as JSON instead of the human-readable format.
    pub log_format_json: bool,
}

/// Initializes the logging subsystem for `tracing`.
///
/// Logs are written to standard output, filtered by the configured level, either as JSON or in a human-readable format
/// tagged with `app_name`.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error is returned.
pub fn initialize_logging(app_name: &str, config: &LoggingConfiguration) -> Result<(), GenericError> {
    let filter = config.log_level.to_env_filter();

    if config.log_format_json {
        let json_layer = tracing_subscriber::fmt::Layer::new()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(json_layer.with_filter(filter))
            .try_init()?;
    } else {
        let pretty_layer = tracing_subscriber::fmt::Layer::new().event_format(PipeFormatter::new(app_name));

        tracing_subscriber::registry()
            .with(pretty_layer.with_filter(filter))
            .try_init()?;
    }

    Ok(())
}

/// Formats events as `time | APP | LEVEL | (file:line) | key:value,... | message`.
struct PipeFormatter {
    app_name: String,
}

impl PipeFormatter {
    fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_uppercase().replace(['-', ' '], ""),
        }
    }
}

impl<S, N> FormatEvent<S, N> for PipeFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, _ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let metadata = event.metadata();

        write!(
            writer,
            "{} | {} | {} | ",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            self.app_name,
            metadata.level()
        )?;

        match (metadata.file(), metadata.line()) {
            (Some(file), Some(line)) => write!(writer, "({}:{})", file, line)?,
            _ => write!(writer, "(unknown:0)")?,
        }

        let mut visitor = PipeFieldVisitor::new(writer.by_ref());
        event.record(&mut visitor);
        visitor.finish()?;

        writeln!(writer)
    }
}

/// Writes structured fields as `| key:value,key2:value2`, holding the message back so it can be written last.
///
/// The first write error is kept and returned from `finish`. Everything after it is skipped.
struct PipeFieldVisitor<'writer> {
    writer: Writer<'writer>,
    fields_written: usize,
    message: String,
    result: fmt::Result,
}

impl<'writer> PipeFieldVisitor<'writer> {
    fn new(writer: Writer<'writer>) -> Self {
        Self {
            writer,
            fields_written: 0,
            message: String::new(),
            result: Ok(()),
        }
    }

    fn write_field(&mut self, field: &field::Field, f: impl FnOnce(&mut dyn fmt::Write) -> fmt::Result) {
        if self.result.is_err() {
            return;
        }

        if field.name() == "message" {
            self.result = f(&mut self.message);
            return;
        }

        let separator = if self.fields_written == 0 { " | " } else { "," };
        self.result = write!(self.writer, "{}{}:", separator, field.name()).and_then(|()| f(&mut self.writer));
        if self.result.is_ok() {
            self.fields_written += 1;
        }
    }
}

impl field::Visit for PipeFieldVisitor<'_> {
    fn record_debug(&mut self, field: &field::Field, value: &dyn fmt::Debug) {
        self.write_field(field, |w| write!(w, "{:?}", value));
    }

    fn record_str(&mut self, field: &field::Field, value: &str) {
        self.write_field(field, |w| w.write_str(value));
    }
}

impl VisitOutput<fmt::Result> for PipeFieldVisitor<'_> {
    fn finish(mut self) -> fmt::Result {
        self.result?;

        if self.message.is_empty() {
            Ok(())
        } else {
            write!(self.writer, " | {}", self.message)
        }
    }
}
