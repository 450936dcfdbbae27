//! Ingestion progress reporting.
//!
//! Reports observable progress during the ingestion worker's run (PDF
//! extraction, web crawl, agentic workflow) so callers can render a progress
//! bar or forward events over SSE. Progress is percentage-carrying and keyed
//! by job id, unlike the connector-only discovering/ingesting split this
//! module used to report. CLI usage still defaults to stderr so stdout stays
//! parseable for scripts.

use std::io::Write;

/// A named step within the ingestion worker's pipeline for a single document
/// or crawl job, each occupying a fixed percentage window of the overall run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IngestionStep {
    Classifying,
    Extracting,
    Chunking,
    Embedding,
    Indexing,
    Crawling,
    Done,
}

impl IngestionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStep::Classifying => "classifying",
            IngestionStep::Extracting => "extracting",
            IngestionStep::Chunking => "chunking",
            IngestionStep::Embedding => "embedding",
            IngestionStep::Indexing => "indexing",
            IngestionStep::Crawling => "crawling",
            IngestionStep::Done => "done",
        }
    }
}

/// A single progress event for an ingestion job, keyed by job/document id and
/// carrying a 0-100 percentage within that job's overall run.
#[derive(Clone, Debug)]
pub struct IngestionEvent {
    pub job_id: String,
    pub step: IngestionStep,
    pub percent: u8,
    pub message: Option<String>,
}

impl IngestionEvent {
    pub fn new(job_id: impl Into<String>, step: IngestionStep, percent: u8) -> Self {
        Self {
            job_id: job_id.into(),
            step,
            percent: percent.min(100),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Reports ingestion progress. Implementations write to stderr, to an SSE
/// channel, or discard events entirely.
pub trait IngestionProgressReporter: Send + Sync {
    fn report(&self, event: IngestionEvent);
}

/// Human-friendly progress on stderr: "ingest <job>  extracting  42%".
pub struct StderrProgress;

impl IngestionProgressReporter for StderrProgress {
    fn report(&self, event: IngestionEvent) {
        let mut line = format!(
            "ingest {}  {}  {}%\n",
            event.job_id,
            event.step.as_str(),
            event.percent
        );
        if let Some(msg) = &event.message {
            line = format!(
                "ingest {}  {}  {}%  {}\n",
                event.job_id,
                event.step.as_str(),
                event.percent,
                msg
            );
        }
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IngestionProgressReporter for JsonProgress {
    fn report(&self, event: IngestionEvent) {
        let obj = serde_json::json!({
            "event": "progress",
            "job_id": event.job_id,
            "step": event.step.as_str(),
            "percent": event.percent,
            "message": event.message,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IngestionProgressReporter for NoProgress {
    fn report(&self, _event: IngestionEvent) {}
}

/// Forwards events into a bounded async channel, so an HTTP handler can
/// relay them as SSE frames while the worker runs on a background task.
pub struct ChannelProgress {
    sender: tokio::sync::mpsc::Sender<IngestionEvent>,
}

impl ChannelProgress {
    pub fn new(sender: tokio::sync::mpsc::Sender<IngestionEvent>) -> Self {
        Self { sender }
    }
}

impl IngestionProgressReporter for ChannelProgress {
    fn report(&self, event: IngestionEvent) {
        let _ = self.sender.try_send(event);
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode. Caller can pass it to the ingestion worker.
    pub fn reporter(&self) -> Box<dyn IngestionProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn event_percent_clamped() {
        let e = IngestionEvent::new("job-1", IngestionStep::Embedding, 250);
        assert_eq!(e.percent, 100);
    }
}
