use crate::run::Run;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rlm_core::{GlobalUsage, RlmError, RlmResult, UsageRecord};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunEvent
// ---------------------------------------------------------------------------

/// Kind of a [`RunEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// One step of a run, emitted before its code runs.
    Step,
    /// Output of the code a step ran. Shares the step's number.
    ExecutionResult,
    /// The run finished with a final value.
    FinalResult,
    /// The run failed.
    RunFailed,
}

/// One line of the run-hierarchy log.
///
/// Within a run, step events carry strictly increasing `step` numbers starting
/// at 0 and are followed by exactly one terminal event. A step that ran code is
/// followed by an execution-result event with the same `step`; children it
/// spawned emit between the two.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// What happened.
    pub event_type: EventType,
    /// Run that emitted the event.
    pub run_id: Uuid,
    /// Parent of the emitting run; absent for the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
    /// Depth of the emitting run.
    pub depth: u32,
    /// Step the event belongs to.
    pub step: u32,
    /// Model of the emitting run.
    pub model: String,
    /// Code executed in this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Output as shown to the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Set for recoverable errors: no code, raised errors, failed spawns.
    #[serde(default)]
    pub has_error: bool,
    /// Provider reasoning for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Usage of this step's model call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageRecord>,
    /// Process-wide usage right after this step's model call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_usage: Option<GlobalUsage>,
    /// Cohort the emitting run was started in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group_id: Option<Uuid>,
    /// When the model call began.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_started_at: Option<DateTime<Utc>>,
    /// When the model call returned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_finished_at: Option<DateTime<Utc>>,
    /// When sandbox execution began.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_started_at: Option<DateTime<Utc>>,
    /// When sandbox execution returned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_finished_at: Option<DateTime<Utc>>,
    /// Final value, on `final_result` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_result: Option<serde_json::Value>,
    /// Error text, on `run_failed` events and failed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    /// An event of `event_type` stamped with `run`'s identity and current step.
    pub fn new(event_type: EventType, run: &Run) -> Self {
        Self {
            event_type,
            run_id: run.run_id,
            parent_run_id: run.parent_run_id,
            depth: run.depth,
            step: run.step,
            model: run.model.clone(),
            code: None,
            output: None,
            has_error: false,
            reasoning: None,
            usage: None,
            global_usage: None,
            parallel_group_id: run.parallel_group_id,
            model_started_at: None,
            model_finished_at: None,
            exec_started_at: None,
            exec_finished_at: None,
            final_result: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Whether this event ends its run.
    pub fn is_terminal(&self) -> bool {
        matches!(self.event_type, EventType::FinalResult | EventType::RunFailed)
    }
}

// ---------------------------------------------------------------------------
// EventSink trait
// ---------------------------------------------------------------------------

/// Destination for run events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Appends one event.
    async fn emit(&self, event: &RunEvent) -> RlmResult<()>;
    /// Makes every emitted event durable.
    async fn flush(&self) -> RlmResult<()>;
}

// ---------------------------------------------------------------------------
// JsonlEventLog
// ---------------------------------------------------------------------------

/// Appends events as JSON lines to `<dir>/<prefix>_<timestamp>.jsonl`.
///
/// The file (and its directory) is created on the first event, so a run that
/// never emits leaves nothing behind. Each line is flushed as it is written,
/// so the file can be tailed while the tree runs.
pub struct JsonlEventLog {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl JsonlEventLog {
    /// Picks the log path; nothing touches the filesystem yet.
    pub fn new(dir: impl Into<PathBuf>, prefix: &str) -> Self {
        let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        let path = dir.into().join(format!("{prefix}_{timestamp}.jsonl"));
        Self {
            path,
            file: tokio::sync::Mutex::new(None),
        }
    }

    /// Where events are (or will be) written.
    pub fn log_path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventSink for JsonlEventLog {
    async fn emit(&self, event: &RunEvent) -> RlmResult<()> {
        let mut guard = self.file.lock().await;

        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            tracing::debug!(path = %self.path.display(), "Created event log");
            *guard = Some(file);
        }
        let Some(file) = guard.as_mut() else {
            return Err(RlmError::Orchestrator("event log file unavailable".into()));
        };

        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn flush(&self) -> RlmResult<()> {
        if let Some(file) = self.file.lock().await.as_mut() {
            file.flush().await?;
            file.sync_data().await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryEventLog
// ---------------------------------------------------------------------------

/// Keeps events in memory, in emission order.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<RunEvent>>,
}

impl MemoryEventLog {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event emitted so far.
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().clone()
    }

    /// Events of one run, in order.
    pub fn events_for(&self, run_id: Uuid) -> Vec<RunEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventLog {
    async fn emit(&self, event: &RunEvent) -> RlmResult<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn flush(&self) -> RlmResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_snake_case_type_and_skips_empty_fields() {
        let run = Run::new(None, 0, 5, "z-ai/glm-5", None);
        let event = RunEvent::new(EventType::FinalResult, &run);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "final_result");
        assert!(json.get("parent_run_id").is_none());
        assert!(json.get("code").is_none());
        assert_eq!(json["has_error"], false);
    }

    #[test]
    fn test_event_round_trips_through_json() {
        let parent = Run::new(None, 0, 5, "a", None);
        let child = Run::new(Some(parent.run_id), 1, 5, "b", Some(Uuid::new_v4()));
        let mut event = RunEvent::new(EventType::Step, &child);
        event.code = Some("print(1)".into());
        event.usage = Some(UsageRecord::new(3, 4).with_cost(0.5));

        let line = serde_json::to_string(&event).unwrap();
        let back: RunEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back, event);
        assert!(!back.is_terminal());

        let executed = RunEvent::new(EventType::ExecutionResult, &child);
        assert_eq!(
            serde_json::to_value(&executed).unwrap()["event_type"],
            "execution_result"
        );
        assert!(!executed.is_terminal());
    }

    #[tokio::test]
    async fn test_memory_log_filters_by_run() {
        let log = MemoryEventLog::new();
        let a = Run::new(None, 0, 1, "m", None);
        let b = Run::new(Some(a.run_id), 1, 1, "m", None);
        log.emit(&RunEvent::new(EventType::Step, &a)).await.unwrap();
        log.emit(&RunEvent::new(EventType::Step, &b)).await.unwrap();
        log.emit(&RunEvent::new(EventType::RunFailed, &a))
            .await
            .unwrap();

        assert_eq!(log.events().len(), 3);
        let only_a = log.events_for(a.run_id);
        assert_eq!(only_a.len(), 2);
        assert!(only_a[1].is_terminal());
    }
}
