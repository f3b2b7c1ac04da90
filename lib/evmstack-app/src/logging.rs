//! Logging.

use std::{
    fmt,
    str::FromStr as _,
    sync::OnceLock,
};

use chrono::Utc;
use chrono_tz::Tz;
use tracing::{field, level_filters::LevelFilter, Event, Subscriber};
use tracing_subscriber::{
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields, FormattedFields},
    layer::SubscriberExt as _,
    registry::LookupSpan,
    util::SubscriberInitExt as _,
    EnvFilter, Layer,
};

/// Environment variable holding log filtering directives.
pub const LOG_LEVEL_ENV_VAR: &str = "EVMSTACK_LOG_LEVEL";

/// Environment variable switching output to JSON when set to `true` or `1`.
pub const LOG_FORMAT_JSON_ENV_VAR: &str = "EVMSTACK_LOG_FORMAT_JSON";

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// Filtering directives are read from `EVMSTACK_LOG_LEVEL`, falling back to `default_level` (or `INFO`) when unset.
/// When `EVMSTACK_LOG_FORMAT_JSON` is `true` or `1`, events are written as flattened JSON objects. Otherwise they use a
/// pipe-delimited layout tagged with `app_name`:
///
/// ```text
/// 2024-12-31 23:59:59 UTC | EVMSTACK | INFO | (lib/evmstack-core/src/orchestrator.rs:120) | stack[chain=telos-local]:unit[service=node] | Launching container...
/// ```
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(
    app_name: &str, default_level: Option<LevelFilter>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let is_json = std::env::var(LOG_FORMAT_JSON_ENV_VAR)
        .map(|s| s.trim().to_lowercase())
        .map(|s| s == "true" || s == "1")
        .unwrap_or(false);

    let level_filter = EnvFilter::builder()
        .with_default_directive(default_level.unwrap_or(LevelFilter::INFO).into())
        .with_env_var(LOG_LEVEL_ENV_VAR)
        .from_env_lossy();

    if is_json {
        let json_layer = tracing_subscriber::fmt::Layer::new()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true);
        tracing_subscriber::registry()
            .with(json_layer.with_filter(level_filter))
            .try_init()?;
    } else {
        let pretty_layer = tracing_subscriber::fmt::Layer::new().event_format(PipeFormatter::new(app_name));
        tracing_subscriber::registry()
            .with(pretty_layer.with_filter(level_filter))
            .try_init()?;
    }

    Ok(())
}

/// Pipe-delimited event formatter.
///
/// Each event is written as `time | APP | LEVEL | (file:line) | spans | key:value,... | message`, where the span
/// section lists the active span scope from the root, and the field and message sections are omitted when empty.
pub(crate) struct PipeFormatter {
    app_name: String,
}

impl PipeFormatter {
    pub(crate) fn new(app_name: &str) -> Self {
        // "evm-stack" and "EVM Stack" both become "EVMSTACK".
        let app_name = app_name.to_uppercase().replace(['-', ' '], "");
        Self { app_name }
    }
}

impl<S, N> FormatEvent<S, N> for PipeFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let metadata = event.metadata();

        write!(
            writer,
            "{} | {} | {} | ",
            timestamp(),
            self.app_name,
            metadata.level()
        )?;

        if let (Some(file), Some(line)) = (metadata.file(), metadata.line()) {
            write!(writer, "({}:{})", file, line)?;
        } else {
            write!(writer, "(unknown:0)")?;
        }

        if let Some(scope) = ctx.event_scope() {
            let mut first = true;
            for span in scope.from_root() {
                let separator = if first { " | " } else { ":" };
                first = false;

                write!(writer, "{}{}", separator, span.name())?;
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "[{}]", fields)?;
                    }
                }
            }
        }

        let mut fields = PipeFields::default();
        event.record(&mut fields);
        if !fields.pairs.is_empty() {
            write!(writer, " | {}", fields.pairs.join(","))?;
        }
        if !fields.message.is_empty() {
            write!(writer, " | {}", fields.message)?;
        }

        writeln!(writer)
    }
}

/// Event fields as `key:value` pairs, with the message kept apart so it is written last.
#[derive(Default)]
struct PipeFields {
    pairs: Vec<String>,
    message: String,
}

impl field::Visit for PipeFields {
    fn record_debug(&mut self, field: &field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.pairs.push(format!("{}:{:?}", field.name(), value));
        }
    }

    fn record_str(&mut self, field: &field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.pairs.push(format!("{}:{}", field.name(), value));
        }
    }
}

/// Current time in the system timezone, or UTC when the timezone cannot be determined.
fn timestamp() -> impl fmt::Display {
    static SYSTEM_TZ: OnceLock<Tz> = OnceLock::new();
    let tz = SYSTEM_TZ.get_or_init(|| {
        iana_time_zone::get_timezone()
            .ok()
            .and_then(|name| Tz::from_str(&name).ok())
            .unwrap_or(Tz::UTC)
    });

    Utc::now().with_timezone(tz).format("%Y-%m-%d %H:%M:%S %Z")
}
