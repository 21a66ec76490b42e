// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::env;
use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{EnvFilter, Layer, Registry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LOG_ENV: &str = "DISPATCHD_LOG";
const LOG_FORMAT_ENV: &str = "DISPATCHD_LOG_FORMAT";
const LOG_SPAN_EVENTS_ENV: &str = "DISPATCHD_LOG_SPAN_EVENTS";
const LOG_FILE_ENV: &str = "DISPATCHD_LOG_FILE";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

pub fn init(verbose: bool) {
    let format = parse_format(env_value(LOG_FORMAT_ENV).as_deref());
    let span_events = parse_span_events(env_value(LOG_SPAN_EVENTS_ENV).as_deref());

    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(
        format,
        span_events.clone(),
        std::io::stdout,
        true,
    )];
    if let Some(path) = env_value(LOG_FILE_ENV) {
        let path = Path::new(&path);
        if let Some(file_name) = path.file_name() {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(fmt_layer(format, span_events, writer, false));
            let _ = FILE_GUARD.set(guard);
        }
    }

    Registry::default()
        .with(layers)
        .with(tracing_error::ErrorLayer::default())
        .with(build_filter(verbose))
        .init();
}

fn fmt_layer<W>(format: LogFormat, span_events: FmtSpan, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_span_events(span_events)
        .with_ansi(ansi)
        .with_writer(writer);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn build_filter(verbose: bool) -> EnvFilter {
    match env_value(LOG_ENV) {
        Some(value) => EnvFilter::new(value),
        None if verbose => EnvFilter::new("debug"),
        // sqlx logs every statement at info.
        None => EnvFilter::new("info,sqlx=warn"),
    }
}

fn parse_format(raw: Option<&str>) -> LogFormat {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("json") => LogFormat::Json,
        Some("pretty") => LogFormat::Pretty,
        _ => LogFormat::Compact,
    }
}

fn parse_span_events(raw: Option<&str>) -> FmtSpan {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("new") => FmtSpan::NEW,
        Some("enter") => FmtSpan::ENTER,
        Some("exit") => FmtSpan::EXIT,
        Some("close") => FmtSpan::CLOSE,
        Some("full") => FmtSpan::FULL,
        _ => FmtSpan::NONE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_falls_back_to_compact() {
        assert_eq!(parse_format(Some("JSON")), LogFormat::Json);
        assert_eq!(parse_format(Some("pretty")), LogFormat::Pretty);
        assert_eq!(parse_format(Some("fancy")), LogFormat::Compact);
        assert_eq!(parse_format(None), LogFormat::Compact);
    }

    #[test]
    fn span_events_parse_case_insensitively() {
        assert_eq!(parse_span_events(Some("Close")), FmtSpan::CLOSE);
        assert_eq!(parse_span_events(Some("full")), FmtSpan::FULL);
        assert_eq!(parse_span_events(None), FmtSpan::NONE);
    }
}
