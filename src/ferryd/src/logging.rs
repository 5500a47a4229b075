use std::fmt;

use ansi_term::Colour;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

use crate::config::Config;

// The code is adapted from tokio-rs/tracing/tracing-subscriber
struct FmtLevel<'a> {
    level: &'a Level,
    ansi: bool,
}

impl<'a> FmtLevel<'a> {
    fn new(level: &'a Level, ansi: bool) -> Self {
        Self { level, ansi }
    }
}

const TRACE_STR: &str = "TRACE";
const DEBUG_STR: &str = "DEBUG";
const INFO_STR: &str = " INFO";
const WARN_STR: &str = " WARN";
const ERROR_STR: &str = "ERROR";

impl<'a> fmt::Display for FmtLevel<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (text, colour) = match *self.level {
            Level::TRACE => (TRACE_STR, Colour::Purple),
            Level::DEBUG => (DEBUG_STR, Colour::Blue),
            Level::INFO => (INFO_STR, Colour::Green),
            Level::WARN => (WARN_STR, Colour::Yellow),
            Level::ERROR => (ERROR_STR, Colour::Red),
        };
        if self.ansi {
            write!(f, "{}", colour.paint(text))
        } else {
            f.pad(text)
        }
    }
}

/// One line per event, tagged with the emitting thread so progress-owner hand-offs are visible.
struct FerryFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for FerryFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        use chrono::Utc;
        let metadata = event.metadata();
        let fmt_level = FmtLevel::new(metadata.level(), self.ansi && writer.has_ansi_escapes());

        let thread = std::thread::current();
        write!(
            writer,
            "[{} {} {} {}:{}] ",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            fmt_level,
            thread.name().unwrap_or("-"),
            metadata.file().unwrap_or("<unnamed>"),
            metadata.line().unwrap_or(0),
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber. `FERRY_LOG` overrides the configured level.
pub fn init_log(config: &Config, ansi: bool) -> anyhow::Result<()> {
    use tracing_subscriber::prelude::*;

    const LOG_ENV: &str = "FERRY_LOG";

    let log_env_filter = EnvFilter::builder()
        .with_default_directive(config.log_level.parse()?)
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let log_fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(ansi)
        .event_format(FerryFormatter { ansi })
        .with_filter(log_env_filter);

    tracing_subscriber::registry().with(log_fmt_layer).try_init()?;
    tracing::info!("tracing-log initialized");
    Ok(())
}
