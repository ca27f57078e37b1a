//! Tracing subscriber initialization.
//!
//! Installs a layered `tracing_subscriber` registry with an env filter and
//! either JSON or compact human readable output. Both formats replace the
//! values of secret-looking span and event fields with [`REDACTED`].

use std::fmt::{self, Write as _};

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::field::RecordFields;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{LogConfig, LogFormat};

/// Written in place of a redacted field value.
pub const REDACTED: &str = "[REDACTED]";

/// Whether a span or event field name looks like it carries secret material.
pub fn is_redacted_field(name: &str) -> bool {
    const REDACTED_PATTERNS: [&str; 9] = [
        "passphrase",
        "pickle",
        "secret",
        "token",
        "ciphertext",
        "plaintext",
        "session_key",
        "private",
        "mac",
    ];

    let lowered = name.to_ascii_lowercase();
    REDACTED_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

/// `name=value` field formatter that redacts secret-looking fields.
///
/// Used for span fields in both formats and for event fields in the
/// compact format.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedactingFields;

struct TextVisitor<'w> {
    writer: Writer<'w>,
    result: fmt::Result,
    first: bool,
}

impl Visit for TextVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if self.result.is_err() {
            return;
        }
        let separator = if self.first { "" } else { " " };
        self.first = false;

        let name = field.name();
        self.result = if is_redacted_field(name) {
            write!(self.writer, "{separator}{name}={REDACTED}")
        } else if name == "message" {
            write!(self.writer, "{separator}{value:?}")
        } else {
            write!(self.writer, "{separator}{name}={value:?}")
        };
    }
}

impl<'writer> FormatFields<'writer> for RedactingFields {
    fn format_fields<R: RecordFields>(&self, writer: Writer<'writer>, fields: R) -> fmt::Result {
        let mut visitor = TextVisitor {
            writer,
            result: Ok(()),
            first: true,
        };
        fields.record(&mut visitor);
        visitor.result
    }
}

#[derive(Default)]
struct JsonVisitor(Map<String, Value>);

impl JsonVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        let value = if is_redacted_field(field.name()) {
            Value::from(REDACTED)
        } else {
            value
        };
        self.0.insert(field.name().to_owned(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::from(format!("{value:?}")));
    }
}

/// One JSON object per line, with redacted event fields.
///
/// Span fields are taken as formatted by the layer's field formatter, so
/// pair this with [`RedactingFields`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RedactingJson;

impl<S, N> FormatEvent<S, N> for RedactingJson
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'w> FormatFields<'w> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut fields = JsonVisitor::default();
        event.record(&mut fields);

        let mut line = Map::new();
        line.insert("timestamp".to_owned(), Value::from(chrono::Utc::now().to_rfc3339()));
        line.insert("level".to_owned(), Value::from(metadata.level().as_str()));
        line.insert("target".to_owned(), Value::from(metadata.target()));
        line.insert("fields".to_owned(), Value::Object(fields.0));

        if let Some(scope) = ctx.event_scope() {
            let spans: Vec<Value> = scope
                .from_root()
                .map(|span| {
                    let extensions = span.extensions();
                    let formatted = extensions
                        .get::<FormattedFields<N>>()
                        .map(|f| f.fields.clone())
                        .unwrap_or_default();
                    let mut entry = Map::new();
                    entry.insert("name".to_owned(), Value::from(span.name()));
                    entry.insert("fields".to_owned(), Value::from(formatted));
                    Value::Object(entry)
                })
                .collect();
            line.insert("spans".to_owned(), Value::Array(spans));
        }

        let encoded = serde_json::to_string(&line).map_err(|_| fmt::Error)?;
        writeln!(writer, "{encoded}")
    }
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Calling this twice is
/// harmless: the second installation fails silently.
pub fn init(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let registry = Registry::default().with(filter);
    let result = match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .fmt_fields(RedactingFields)
                    .event_format(RedactingJson),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .fmt_fields(RedactingFields),
            )
            .try_init(),
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn emit() {
        let span = tracing::info_span!("save", session_key = "span-secret", room_id = "!r:x");
        let _entered = span.enter();
        tracing::info!(passphrase = "hunter2", sync_token = 42u64, session_id = "abc", "opened store");
    }

    #[test]
    fn test_secret_field_names_are_redacted() {
        assert!(is_redacted_field("passphrase"));
        assert!(is_redacted_field("session_key"));
        assert!(is_redacted_field("Pickle"));
        assert!(is_redacted_field("ciphertext_len"));
        assert!(is_redacted_field("sync_token"));
        assert!(!is_redacted_field("room_id"));
        assert!(!is_redacted_field("session_id"));
    }

    #[test]
    fn test_json_output_hides_secret_values() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = Registry::default().with(
            tracing_subscriber::fmt::layer()
                .fmt_fields(RedactingFields)
                .event_format(RedactingJson)
                .with_writer(move || writer.clone()),
        );
        tracing::subscriber::with_default(subscriber, emit);

        let output = captured.contents();
        assert!(!output.contains("hunter2"));
        assert!(!output.contains("span-secret"));

        let line: Value = serde_json::from_str(output.lines().next().unwrap()).unwrap();
        assert_eq!(line["level"], "INFO");
        assert_eq!(line["fields"]["message"], "opened store");
        assert_eq!(line["fields"]["passphrase"], REDACTED);
        assert_eq!(line["fields"]["sync_token"], REDACTED);
        assert_eq!(line["fields"]["session_id"], "abc");
        let span_fields = line["spans"][0]["fields"].as_str().unwrap();
        assert!(span_fields.contains("session_key=[REDACTED]"));
        assert!(span_fields.contains("room_id=\"!r:x\""));
    }

    #[test]
    fn test_compact_output_hides_secret_values() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = Registry::default().with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(false)
                .fmt_fields(RedactingFields)
                .with_writer(move || writer.clone()),
        );
        tracing::subscriber::with_default(subscriber, emit);

        let output = captured.contents();
        assert!(!output.contains("hunter2"));
        assert!(!output.contains("span-secret"));
        assert!(output.contains("opened store"));
        assert!(output.contains("passphrase=[REDACTED]"));
        assert!(output.contains("session_id=\"abc\""));
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        init(&LogConfig::default());
        init(&LogConfig::default());
    }
}
