use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Engine,
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Cli => "cli",
        }
    }
}

/// Where process logs land and how long they are kept. The engine derives
/// this from its state directory; tests point it at a scratch dir.
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub dir: PathBuf,
    pub retention_days: u64,
    pub console: bool,
}

impl LogSettings {
    pub fn for_state_dir(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("logs"),
            retention_days: 7,
            console: true,
        }
    }

    pub fn with_retention_days(mut self, days: u64) -> Self {
        self.retention_days = days;
        self
    }

    fn file_prefix(&self, process: ProcessKind) -> String {
        format!("aard.{}.log", process.as_str())
    }
}

/// Structured mirror of a pipeline decision, emitted on the `aard.obs`
/// target alongside the journal append.
#[derive(Debug, Clone, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub workflow_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub stage: Option<&'a str>,
    pub prompt_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub reason_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => tracing::error!(
            target: "aard.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            workflow_id = event.workflow_id.unwrap_or(""),
            session_id = event.session_id.unwrap_or(""),
            stage = event.stage.unwrap_or(""),
            prompt_id = event.prompt_id.unwrap_or(""),
            status = event.status.unwrap_or(""),
            reason_code = event.reason_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        Level::WARN => tracing::warn!(
            target: "aard.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            workflow_id = event.workflow_id.unwrap_or(""),
            session_id = event.session_id.unwrap_or(""),
            stage = event.stage.unwrap_or(""),
            prompt_id = event.prompt_id.unwrap_or(""),
            status = event.status.unwrap_or(""),
            reason_code = event.reason_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        _ => tracing::info!(
            target: "aard.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            workflow_id = event.workflow_id.unwrap_or(""),
            session_id = event.session_id.unwrap_or(""),
            stage = event.stage.unwrap_or(""),
            prompt_id = event.prompt_id.unwrap_or(""),
            status = event.status.unwrap_or(""),
            reason_code = event.reason_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
    }
}

/// Bounded single-line summary for event input/output fields. Never carries
/// more than `max_len` characters of the original payload.
pub fn summarize(input: &str, max_len: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_len {
        return collapsed;
    }
    let truncated = collapsed.chars().take(max_len).collect::<String>();
    format!("{truncated}…")
}

/// Daily-rotated jsonl file logs plus an optional console layer. Expired
/// log files are removed by age before the subscriber starts writing.
pub fn init_logging(process: ProcessKind, settings: &LogSettings) -> anyhow::Result<WorkerGuard> {
    fs::create_dir_all(&settings.dir)?;
    let prefix = settings.file_prefix(process);
    let removed = expire_old_logs(&settings.dir, &prefix, settings.retention_days)?;

    let appender = tracing_appender::rolling::daily(&settings.dir, &prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if settings.console {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(true)
                    .with_ansi(true),
            )
            .try_init()
            .ok();
    } else {
        registry.try_init().ok();
    }

    tracing::info!(
        target: "aard.obs",
        process = process.as_str(),
        dir = %settings.dir.display(),
        retention_days = settings.retention_days,
        removed_logs = removed,
        "logging initialized"
    );
    Ok(guard)
}

/// Removes prefixed log files whose modification time predates the
/// retention window. Returns how many were deleted.
fn expire_old_logs(dir: &Path, prefix: &str, retention_days: u64) -> anyhow::Result<usize> {
    let Some(cutoff) =
        SystemTime::now().checked_sub(Duration::from_secs(retention_days.saturating_mul(86_400)))
    else {
        return Ok(0);
    };

    let mut removed = 0usize;
    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if modified < cutoff && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_truncates_and_collapses_whitespace() {
        let long = "word ".repeat(100);
        let summary = summarize(&long, 40);
        assert!(summary.chars().count() <= 41);
        assert!(summary.ends_with('…'));
        assert!(!summary.contains("  "));
    }

    #[test]
    fn summarize_keeps_short_input_intact() {
        assert_eq!(summarize("what is 2+2?", 80), "what is 2+2?");
    }

    #[test]
    fn settings_derive_the_logs_dir_from_the_state_dir() {
        let settings = LogSettings::for_state_dir(Path::new("/tmp/aard"));
        assert_eq!(settings.dir, PathBuf::from("/tmp/aard").join("logs"));
        assert_eq!(settings.with_retention_days(3).retention_days, 3);
    }

    #[test]
    fn expire_removes_only_aged_prefixed_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = "aard.engine.log";
        let ours = dir.path().join("aard.engine.log.2026-08-01");
        let foreign = dir.path().join("other.log.2026-08-01");
        fs::write(&ours, "{}").expect("write");
        fs::write(&foreign, "{}").expect("write");
        std::thread::sleep(Duration::from_millis(50));

        // zero retention puts the cutoff at "now": both files are aged,
        // but only the prefixed one goes
        let removed = expire_old_logs(dir.path(), prefix, 0).expect("expire");
        assert_eq!(removed, 1);
        assert!(!ours.exists());
        assert!(foreign.exists());

        // a fresh file inside the window stays
        fs::write(&ours, "{}").expect("write");
        let removed = expire_old_logs(dir.path(), prefix, 7).expect("expire");
        assert_eq!(removed, 0);
        assert!(ours.exists());
    }
}
