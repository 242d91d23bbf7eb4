use std::path::Path;
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex, RwLock};

use aard_types::{EventStatus, ExecutionEvent, Stage};

/// Subscriber-side filter. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub workflow_id: Option<String>,
    pub session_id: Option<String>,
    pub stage: Option<Stage>,
    pub status: Option<EventStatus>,
    pub component_role: Option<String>,
}

impl EventFilter {
    pub fn for_workflow(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: Some(workflow_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &ExecutionEvent) -> bool {
        if let Some(id) = &self.workflow_id {
            if &event.workflow_id != id {
                return false;
            }
        }
        if let Some(id) = &self.session_id {
            if &event.session_id != id {
                return false;
            }
        }
        if let Some(stage) = self.stage {
            if event.stage != stage {
                return false;
            }
        }
        if let Some(status) = self.status {
            if event.status != status {
                return false;
            }
        }
        if let Some(role) = &self.component_role {
            if &event.component_role != role {
                return false;
            }
        }
        true
    }
}

#[derive(Default)]
struct JournalInner {
    events: Vec<ExecutionEvent>,
    next_sequence: u64,
}

/// Append-only, process-wide event store. Events get a monotonic sequence on
/// append and are observable in that order: the durable sink (when
/// configured) is written before subscribers see the event, and the
/// in-memory trail never mutates a stored record.
#[derive(Clone)]
pub struct EventJournal {
    inner: Arc<RwLock<JournalInner>>,
    tx: broadcast::Sender<ExecutionEvent>,
    sink: Option<Arc<Mutex<File>>>,
}

impl EventJournal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self {
            inner: Arc::new(RwLock::new(JournalInner::default())),
            tx,
            sink: None,
        }
    }

    /// Journal with a durable jsonl sink under the state directory.
    pub async fn with_sink(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let mut journal = Self::new();
        journal.sink = Some(Arc::new(Mutex::new(file)));
        Ok(journal)
    }

    /// Appends the event, assigning its sequence. Returns the stored record.
    pub async fn append(&self, mut event: ExecutionEvent) -> anyhow::Result<ExecutionEvent> {
        {
            let mut inner = self.inner.write().await;
            inner.next_sequence += 1;
            event.sequence = inner.next_sequence;
            inner.events.push(event.clone());
        }

        if let Some(sink) = &self.sink {
            let line = serde_json::to_string(&event)?;
            let mut file = sink.lock().await;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await?;
        }

        tracing::debug!(
            target: "aard.journal",
            workflow_id = %event.workflow_id,
            stage = event.stage.as_str(),
            sequence = event.sequence,
            "event appended"
        );

        let _ = self.tx.send(event.clone());
        Ok(event)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }

    /// Events of one workflow in strict sequence order, optionally resuming
    /// after a known sequence.
    pub async fn by_workflow(
        &self,
        workflow_id: &str,
        after_sequence: Option<u64>,
        limit: Option<usize>,
    ) -> Vec<ExecutionEvent> {
        let inner = self.inner.read().await;
        let after = after_sequence.unwrap_or(0);
        let iter = inner
            .events
            .iter()
            .filter(|e| e.workflow_id == workflow_id && e.sequence > after)
            .cloned();
        match limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    pub async fn by_session(&self, session_id: &str) -> Vec<ExecutionEvent> {
        let inner = self.inner.read().await;
        inner
            .events
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Most recent events matching the filter, newest last.
    pub async fn recent(&self, filter: &EventFilter, limit: usize) -> Vec<ExecutionEvent> {
        let inner = self.inner.read().await;
        let matching = inner
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect::<Vec<_>>();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.events.is_empty()
    }

    /// Flushes the durable sink. Called once at shutdown.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(sink) = &self.sink {
            sink.lock().await.flush().await?;
        }
        Ok(())
    }
}

impl Default for EventJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aard_types::DecisionSource;

    fn event(workflow_id: &str, stage: Stage) -> ExecutionEvent {
        ExecutionEvent::new(
            workflow_id,
            "session-1",
            stage,
            "pipeline",
            "test",
            DecisionSource::Rule,
        )
    }

    #[tokio::test]
    async fn append_assigns_strictly_increasing_sequence() {
        let journal = EventJournal::new();
        let first = journal
            .append(event("wf-1", Stage::Interpretation))
            .await
            .expect("append");
        let second = journal
            .append(event("wf-1", Stage::Routing))
            .await
            .expect("append");
        assert!(second.sequence > first.sequence);

        let trail = journal.by_workflow("wf-1", None, None).await;
        assert_eq!(trail.len(), 2);
        assert!(trail[0].sequence < trail[1].sequence);
    }

    #[tokio::test]
    async fn by_workflow_resumes_after_sequence() {
        let journal = EventJournal::new();
        for stage in [Stage::Interpretation, Stage::Routing, Stage::Execution] {
            journal.append(event("wf-1", stage)).await.expect("append");
        }
        let trail = journal.by_workflow("wf-1", Some(1), Some(1)).await;
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].sequence, 2);
    }

    #[tokio::test]
    async fn subscriber_sees_events_in_append_order() {
        let journal = EventJournal::new();
        let mut rx = journal.subscribe();
        journal
            .append(event("wf-1", Stage::Interpretation))
            .await
            .expect("append");
        journal
            .append(event("wf-1", Stage::Reflection))
            .await
            .expect("append");

        let first = rx.recv().await.expect("recv");
        let second = rx.recv().await.expect("recv");
        assert_eq!(first.stage, Stage::Interpretation);
        assert_eq!(second.stage, Stage::Reflection);
        assert!(second.sequence > first.sequence);
    }

    #[tokio::test]
    async fn filter_narrows_by_workflow_and_status() {
        let journal = EventJournal::new();
        journal
            .append(event("wf-1", Stage::Execution))
            .await
            .expect("append");
        journal
            .append(event("wf-2", Stage::Execution).with_status(EventStatus::Error))
            .await
            .expect("append");

        let filter = EventFilter {
            status: Some(EventStatus::Error),
            ..EventFilter::default()
        };
        let recent = journal.recent(&filter, 10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].workflow_id, "wf-2");
    }

    #[tokio::test]
    async fn sink_persists_one_line_per_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("journal.jsonl");
        let journal = EventJournal::with_sink(&path).await.expect("journal");
        journal
            .append(event("wf-1", Stage::Interpretation))
            .await
            .expect("append");
        journal
            .append(event("wf-1", Stage::Execution))
            .await
            .expect("append");
        journal.shutdown().await.expect("flush");

        let raw = std::fs::read_to_string(&path).expect("read");
        let lines = raw.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        let parsed: ExecutionEvent = serde_json::from_str(lines[0]).expect("parse");
        assert_eq!(parsed.workflow_id, "wf-1");
    }
}
