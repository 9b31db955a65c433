//! Process-wide `tracing` setup for the runtime and its binaries.
//!
//! Every chat stream runs inside a `chat_stream` span carrying `stream_id`,
//! `provider` and `model`. The filter built here can raise verbosity for
//! selected providers only, through that span's `provider` field.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

/// Name of the span wrapping each stream task.
pub const STREAM_SPAN: &str = "chat_stream";

const DEFAULT_FILTER: &str = "warn,model_runtime=info,model_runtime_cli=info";
const DEFAULT_LOG_FILE: &str = "model-runtime.jsonl";

/// Where log lines go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogSink {
    /// Compact human-readable lines on stderr.
    Console,
    /// JSON lines appended to a file, with the span stack on every line.
    JsonFile(PathBuf),
}

/// Logging settings, usually read with [`LogConfig::from_env`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogConfig {
    pub enabled: bool,
    /// Base `EnvFilter` directives.
    pub filter: String,
    /// Providers whose streams log at `debug` regardless of `filter`.
    pub trace_providers: Vec<String>,
    /// Emit a line when each stream span closes, with its duration.
    pub stream_timings: bool,
    pub sink: LogSink,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            filter: DEFAULT_FILTER.to_string(),
            trace_providers: Vec::new(),
            stream_timings: false,
            sink: LogSink::Console,
        }
    }
}

impl LogConfig {
    /// Reads:
    /// - `MODEL_RUNTIME_OBSERVABILITY`: `off`/`false`/`0` disables logging.
    /// - `MODEL_RUNTIME_LOG_LEVEL`, else `RUST_LOG`: filter directives.
    /// - `MODEL_RUNTIME_TRACE_PROVIDERS`: comma-separated provider ids.
    /// - `MODEL_RUNTIME_STREAM_TIMINGS`: log stream span durations.
    /// - `MODEL_RUNTIME_JSON_LOG_PATH`: JSONL file instead of stderr.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            enabled: lookup("MODEL_RUNTIME_OBSERVABILITY")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.enabled),
            filter: lookup("MODEL_RUNTIME_LOG_LEVEL")
                .or_else(|| lookup("RUST_LOG"))
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.filter),
            trace_providers: lookup("MODEL_RUNTIME_TRACE_PROVIDERS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(ToOwned::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            stream_timings: lookup("MODEL_RUNTIME_STREAM_TIMINGS")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.stream_timings),
            sink: lookup("MODEL_RUNTIME_JSON_LOG_PATH")
                .filter(|v| !v.trim().is_empty())
                .map_or(LogSink::Console, |path| LogSink::JsonFile(PathBuf::from(path))),
        }
    }

    /// Base filter plus one span-field directive per traced provider.
    ///
    /// An unparsable base filter falls back to the default one.
    pub fn env_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::try_new(&self.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        for provider in &self.trace_providers {
            match format!("model_runtime[{STREAM_SPAN}{{provider={provider}}}]=debug").parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => eprintln!("ignoring trace provider {provider:?}: {e}"),
            }
        }
        filter
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn json_writer(path: &Path) -> tracing_appender::rolling::RollingFileAppender {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let _ = std::fs::create_dir_all(dir);
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE);
    tracing_appender::rolling::never(dir, file_name)
}

/// [`init_with`] using [`LogConfig::from_env`].
pub fn init_observability() {
    init_with(LogConfig::from_env());
}

/// Installs the global subscriber once per process; later calls are no-ops.
pub fn init_with(config: LogConfig) {
    INIT.get_or_init(|| {
        if !config.enabled {
            return;
        }
        let filter = config.env_filter();
        let span_events = if config.stream_timings {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let _ = match &config.sink {
            LogSink::Console => tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_span_events(span_events)
                        .with_writer(std::io::stderr),
                )
                .try_init(),
            LogSink::JsonFile(path) => tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(false)
                        .with_span_events(span_events)
                        .with_writer(json_writer(path)),
                )
                .try_init(),
        };
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> LogConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LogConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_log_to_console() {
        assert_eq!(config(&[]), LogConfig::default());
    }

    #[test]
    fn runtime_level_wins_over_rust_log() {
        let cfg = config(&[("RUST_LOG", "trace"), ("MODEL_RUNTIME_LOG_LEVEL", "model_runtime=debug")]);
        assert_eq!(cfg.filter, "model_runtime=debug");
        assert_eq!(config(&[("RUST_LOG", "trace")]).filter, "trace");
    }

    #[test]
    fn trace_providers_become_span_field_directives() {
        let cfg = config(&[("MODEL_RUNTIME_TRACE_PROVIDERS", " openai, ,ollama ")]);
        assert_eq!(cfg.trace_providers, vec!["openai", "ollama"]);
        let rendered = cfg.env_filter().to_string();
        assert!(rendered.contains("model_runtime[chat_stream{provider=openai}]=debug"), "{rendered}");
        assert!(rendered.contains("model_runtime[chat_stream{provider=ollama}]=debug"), "{rendered}");
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn traced_provider_logs_debug_inside_its_stream_span_only() {
        let cfg = LogConfig {
            filter: "warn".into(),
            trace_providers: vec!["openai".into()],
            ..LogConfig::default()
        };
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::registry().with(cfg.env_filter()).with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(move || writer.clone()),
        );
        tracing::subscriber::with_default(subscriber, || {
            for provider in ["openai", "ollama"] {
                let span = tracing::info_span!("chat_stream", stream_id = %"chat_1", provider = %provider);
                span.in_scope(|| tracing::debug!(from = provider, "stream started"));
            }
            tracing::debug!("outside any stream");
        });
        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("from=\"openai\""), "{output}");
        assert!(!output.contains("from=\"ollama\""), "{output}");
        assert!(!output.contains("outside any stream"), "{output}");
    }

    #[test]
    fn flags_and_sink_are_read() {
        let cfg = config(&[
            ("MODEL_RUNTIME_OBSERVABILITY", "off"),
            ("MODEL_RUNTIME_STREAM_TIMINGS", "yes"),
            ("MODEL_RUNTIME_JSON_LOG_PATH", "logs/runtime.jsonl"),
        ]);
        assert!(!cfg.enabled);
        assert!(cfg.stream_timings);
        assert_eq!(cfg.sink, LogSink::JsonFile(PathBuf::from("logs/runtime.jsonl")));
        assert!(config(&[("MODEL_RUNTIME_OBSERVABILITY", "maybe")]).enabled);
    }

    #[test]
    fn bad_filter_falls_back_to_default() {
        let cfg = LogConfig {
            filter: "model_runtime=[[".into(),
            ..LogConfig::default()
        };
        assert_eq!(cfg.env_filter().to_string(), EnvFilter::new(DEFAULT_FILTER).to_string());
    }

    #[test]
    fn init_is_idempotent() {
        init_with(LogConfig {
            enabled: false,
            ..LogConfig::default()
        });
        init_observability();
    }
}
