//! Telemetry recorder: request-scoped spans, process-wide metrics and the
//! JSON-line export sink.
//!
//! Spans carry metadata only. Every attribute and event mapping passes
//! through a content denylist before it can reach the sink, so raw user
//! text (message, documents, prompt, answer) is structurally unable to
//! leave the process through telemetry. When no sink is configured spans
//! are still created and finished; only the export step is a no-op, which
//! keeps pipeline logic identical in both modes.

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::RotationConfig;
use crate::correlation::CorrelationId;

/// Attribute keys that must never reach the sink. Matching is by substring
/// on the lowercased key, so `user_message`, `rawText` and `prompt_preview`
/// are all dropped.
pub const ATTRIBUTE_DENYLIST: &[&str] = &[
    "content", "message", "query", "text", "prompt", "response", "raw_text",
];

pub fn is_denylisted(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    ATTRIBUTE_DENYLIST.iter().any(|deny| key.contains(deny))
}

/// Scalar span attribute value.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}
impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}
impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}
impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        AttrValue::Int(v as i64)
    }
}
impl From<usize> for AttrValue {
    fn from(v: usize) -> Self {
        AttrValue::Int(v as i64)
    }
}
impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}
impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

/// Terminal status of a span.
#[derive(Debug, Clone, PartialEq)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error(String),
}

#[derive(Debug, Serialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// A traced unit of work. One root span per request, one child span per
/// executed pipeline phase. Parent linkage is fixed at creation.
#[derive(Debug)]
pub struct Span {
    name: &'static str,
    correlation_id: String,
    parent: Option<&'static str>,
    started_at: DateTime<Utc>,
    start: Instant,
    attributes: serde_json::Map<String, serde_json::Value>,
    events: Vec<SpanEvent>,
}

impl Span {
    /// Merge attributes into the span, dropping denylisted keys.
    pub fn set_attributes<I, K>(&mut self, attrs: I)
    where
        I: IntoIterator<Item = (K, AttrValue)>,
        K: Into<String>,
    {
        for (key, value) in attrs {
            let key = key.into();
            if is_denylisted(&key) {
                tracing::debug!(attribute = %key, "dropping denylisted span attribute");
                continue;
            }
            self.attributes
                .insert(key, serde_json::to_value(value).unwrap_or(serde_json::Value::Null));
        }
    }

    /// Append a timestamped event. Denylisted attribute keys are dropped.
    pub fn add_event<I, K>(&mut self, name: &str, attrs: I)
    where
        I: IntoIterator<Item = (K, AttrValue)>,
        K: Into<String>,
    {
        let mut filtered = serde_json::Map::new();
        for (key, value) in attrs {
            let key = key.into();
            if is_denylisted(&key) {
                tracing::debug!(attribute = %key, "dropping denylisted event attribute");
                continue;
            }
            filtered.insert(key, serde_json::to_value(value).unwrap_or(serde_json::Value::Null));
        }
        self.events.push(SpanEvent {
            name: name.to_string(),
            timestamp: Utc::now(),
            attributes: filtered,
        });
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn export_record(&self, status: &SpanStatus) -> serde_json::Value {
        let (status_str, status_message) = match status {
            SpanStatus::Unset => ("unset", None),
            SpanStatus::Ok => ("ok", None),
            SpanStatus::Error(msg) => ("error", Some(msg.clone())),
        };
        serde_json::json!({
            "schemaVersion": 1,
            "span": self.name,
            "parent": self.parent,
            "correlationId": self.correlation_id,
            "startedAt": self.started_at.to_rfc3339(),
            "durationMs": self.start.elapsed().as_millis() as u64,
            "status": status_str,
            "statusMessage": status_message,
            "attributes": self.attributes,
            "events": self.events,
        })
    }
}

/// Simple size-based rotating writer used as the span export transport.
/// A single chain of numbered backups is kept; the freshest backup may be
/// gzip-compressed.
pub struct RotatingWriter {
    path: PathBuf,
    file: std::fs::File,
    max_bytes: Option<u64>,
    keep: usize,
    compress: bool,
}

impl RotatingWriter {
    pub fn open(
        path: &str,
        max_bytes: Option<u64>,
        keep: usize,
        compress: bool,
    ) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: PathBuf::from(path),
            file,
            max_bytes,
            keep,
            compress,
        })
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if let Some(limit) = self.max_bytes {
            let over = self
                .path
                .metadata()
                .map(|meta| meta.len() >= limit)
                .unwrap_or(false);
            if over {
                self.rotate_backups();
                self.compress_latest_backup();
                self.reopen_current();
            }
        }
        writeln!(self.file, "{}", line)
    }

    fn rotate_backups(&self) {
        if self.keep == 0 {
            return;
        }
        for idx in (1..=self.keep).rev() {
            let old = if idx == 1 {
                self.path.clone()
            } else {
                self.path.with_extension(format!("{}", idx - 1))
            };
            if old.exists() {
                let new = self.path.with_extension(format!("{}", idx));
                let _ = fs::rename(&old, &new);
            }
        }
    }

    fn compress_latest_backup(&self) {
        if !self.compress || self.keep == 0 {
            return;
        }
        let rotated = self.path.with_extension("1");
        if let Ok(data) = fs::read(&rotated) {
            let mut gz = GzEncoder::new(Vec::new(), Compression::default());
            if gz.write_all(&data).is_ok() {
                if let Ok(buf) = gz.finish() {
                    let _ = fs::write(rotated.with_extension("1.gz"), buf);
                    let _ = fs::remove_file(&rotated);
                }
            }
        }
    }

    fn reopen_current(&mut self) {
        if let Ok(newf) = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            self.file = newf;
        }
    }
}

/// Process-wide metric instruments. Monotonic counters plus a fixed-bucket
/// latency histogram; all mutation is atomic, safe under concurrent
/// requests.
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
    errors_auth: AtomicU64,
    errors_validation: AtomicU64,
    errors_safety_blocked: AtomicU64,
    errors_upstream: AtomicU64,
    errors_configuration: AtomicU64,
    errors_internal: AtomicU64,
    pub tokens_prompt_total: AtomicU64,
    pub tokens_completion_total: AtomicU64,
    pub tokens_total: AtomicU64,
    hist_buckets: Vec<u64>,
    hist_counts: Vec<AtomicU64>,
    hist_sum_ms: AtomicU64,
    hist_count: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        // Fixed histogram bucket upper bounds in ms.
        let buckets: Vec<u64> = vec![1, 2, 5, 10, 20, 50, 100, 200, 500, 1000, 2000, 5000, 10000];
        Self {
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            errors_auth: AtomicU64::new(0),
            errors_validation: AtomicU64::new(0),
            errors_safety_blocked: AtomicU64::new(0),
            errors_upstream: AtomicU64::new(0),
            errors_configuration: AtomicU64::new(0),
            errors_internal: AtomicU64::new(0),
            tokens_prompt_total: AtomicU64::new(0),
            tokens_completion_total: AtomicU64::new(0),
            tokens_total: AtomicU64::new(0),
            hist_counts: buckets.iter().map(|_| AtomicU64::new(0)).collect(),
            hist_buckets: buckets,
            hist_sum_ms: AtomicU64::new(0),
            hist_count: AtomicU64::new(0),
        }
    }

    pub fn inc_error(&self, kind: &str) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        let counter = match kind {
            "auth" => &self.errors_auth,
            "validation" => &self.errors_validation,
            "safety_blocked" => &self.errors_safety_blocked,
            "upstream" => &self.errors_upstream,
            "configuration" => &self.errors_configuration,
            _ => &self.errors_internal,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_count(&self, kind: &str) -> u64 {
        let counter = match kind {
            "auth" => &self.errors_auth,
            "validation" => &self.errors_validation,
            "safety_blocked" => &self.errors_safety_blocked,
            "upstream" => &self.errors_upstream,
            "configuration" => &self.errors_configuration,
            _ => &self.errors_internal,
        };
        counter.load(Ordering::Relaxed)
    }

    pub fn add_tokens(&self, prompt: u64, completion: u64, total: u64) {
        self.tokens_prompt_total.fetch_add(prompt, Ordering::Relaxed);
        self.tokens_completion_total
            .fetch_add(completion, Ordering::Relaxed);
        self.tokens_total.fetch_add(total, Ordering::Relaxed);
    }

    pub fn record_latency_ms(&self, latency_ms: u64) {
        self.hist_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.hist_count.fetch_add(1, Ordering::Relaxed);
        // find first bucket >= value
        for (idx, ub) in self.hist_buckets.iter().enumerate() {
            if latency_ms <= *ub {
                self.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    /// Prometheus text exposition for `GET /metrics`.
    pub fn render_prometheus(&self, export_lines: u64, export_errors: u64) -> String {
        use std::fmt::Write as _;
        let mut buf = String::new();
        let requests = self.requests_total.load(Ordering::Relaxed);
        let errors = self.errors_total.load(Ordering::Relaxed);
        writeln!(
            &mut buf,
            "# HELP promptgate_requests_total Total chat requests processed"
        )
        .ok();
        writeln!(&mut buf, "# TYPE promptgate_requests_total counter").ok();
        writeln!(&mut buf, "promptgate_requests_total {}", requests).ok();
        writeln!(
            &mut buf,
            "# HELP promptgate_errors_total Requests terminated by an error outcome"
        )
        .ok();
        writeln!(&mut buf, "# TYPE promptgate_errors_total counter").ok();
        writeln!(&mut buf, "promptgate_errors_total {}", errors).ok();
        for kind in [
            "auth",
            "validation",
            "safety_blocked",
            "upstream",
            "configuration",
            "internal",
        ] {
            writeln!(
                &mut buf,
                "promptgate_errors_total{{kind=\"{}\"}} {}",
                kind,
                self.error_count(kind)
            )
            .ok();
        }
        writeln!(
            &mut buf,
            "# HELP promptgate_tokens_total Token usage reported by the completion backend"
        )
        .ok();
        writeln!(&mut buf, "# TYPE promptgate_tokens_total counter").ok();
        writeln!(
            &mut buf,
            "promptgate_tokens_total{{kind=\"prompt\"}} {}",
            self.tokens_prompt_total.load(Ordering::Relaxed)
        )
        .ok();
        writeln!(
            &mut buf,
            "promptgate_tokens_total{{kind=\"completion\"}} {}",
            self.tokens_completion_total.load(Ordering::Relaxed)
        )
        .ok();
        writeln!(
            &mut buf,
            "promptgate_tokens_total{{kind=\"total\"}} {}",
            self.tokens_total.load(Ordering::Relaxed)
        )
        .ok();
        writeln!(
            &mut buf,
            "# HELP promptgate_request_latency_ms Request latency histogram milliseconds"
        )
        .ok();
        writeln!(&mut buf, "# TYPE promptgate_request_latency_ms histogram").ok();
        let mut cumulative: u64 = 0;
        for (i, ub) in self.hist_buckets.iter().enumerate() {
            cumulative += self.hist_counts[i].load(Ordering::Relaxed);
            writeln!(
                &mut buf,
                "promptgate_request_latency_ms_bucket{{le=\"{}\"}} {}",
                ub, cumulative
            )
            .ok();
        }
        let count = self.hist_count.load(Ordering::Relaxed);
        writeln!(
            &mut buf,
            "promptgate_request_latency_ms_bucket{{le=\"+Inf\"}} {}",
            count
        )
        .ok();
        writeln!(
            &mut buf,
            "promptgate_request_latency_ms_sum {}",
            self.hist_sum_ms.load(Ordering::Relaxed)
        )
        .ok();
        writeln!(&mut buf, "promptgate_request_latency_ms_count {}", count).ok();
        writeln!(
            &mut buf,
            "# HELP promptgate_span_export_lines_total Span JSON lines written to the sink\n# TYPE promptgate_span_export_lines_total counter"
        )
        .ok();
        writeln!(&mut buf, "promptgate_span_export_lines_total {}", export_lines).ok();
        writeln!(
            &mut buf,
            "# HELP promptgate_span_export_errors_total Span JSON line write failures\n# TYPE promptgate_span_export_errors_total counter"
        )
        .ok();
        writeln!(
            &mut buf,
            "promptgate_span_export_errors_total {}",
            export_errors
        )
        .ok();
        writeln!(
            &mut buf,
            "# HELP promptgate_build_info Build information\n# TYPE promptgate_build_info gauge"
        )
        .ok();
        writeln!(
            &mut buf,
            "promptgate_build_info{{version=\"{}\"}} 1",
            env!("CARGO_PKG_VERSION")
        )
        .ok();
        buf
    }
}

/// Wraps the span primitives and the export sink. Cheap to clone.
#[derive(Clone)]
pub struct Recorder {
    sink: Option<Arc<Mutex<RotatingWriter>>>,
    pub metrics: Arc<Metrics>,
    export_lines_total: Arc<AtomicU64>,
    export_errors_total: Arc<AtomicU64>,
}

impl Recorder {
    pub fn new(
        sink_path: Option<&str>,
        rotation: &RotationConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let sink = match sink_path {
            Some(path) => {
                match RotatingWriter::open(path, rotation.max_bytes, rotation.keep, rotation.compress)
                {
                    Ok(writer) => Some(Arc::new(Mutex::new(writer))),
                    Err(e) => {
                        tracing::warn!(path = %path, error = %e, "failed to open span export file; export disabled");
                        None
                    }
                }
            }
            None => {
                tracing::warn!("span export disabled: TRACE_EXPORT_FILE not set");
                None
            }
        };
        Self {
            sink,
            metrics,
            export_lines_total: Arc::new(AtomicU64::new(0)),
            export_errors_total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Recorder with no export sink. Spans still work; export is a no-op.
    pub fn noop(metrics: Arc<Metrics>) -> Self {
        Self {
            sink: None,
            metrics,
            export_lines_total: Arc::new(AtomicU64::new(0)),
            export_errors_total: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn start_span(
        &self,
        name: &'static str,
        correlation_id: &CorrelationId,
        parent: Option<&'static str>,
    ) -> Span {
        Span {
            name,
            correlation_id: correlation_id.as_str().to_string(),
            parent,
            started_at: Utc::now(),
            start: Instant::now(),
            attributes: serde_json::Map::new(),
            events: Vec::new(),
        }
    }

    pub fn end_span(&self, span: Span, status: SpanStatus) {
        let record = span.export_record(&status);
        self.export(&record);
    }

    pub fn export_lines_total(&self) -> u64 {
        self.export_lines_total.load(Ordering::Relaxed)
    }

    pub fn export_errors_total(&self) -> u64 {
        self.export_errors_total.load(Ordering::Relaxed)
    }

    fn export(&self, record: &serde_json::Value) {
        let Some(sink) = self.sink.as_ref() else {
            return;
        };
        if let Ok(mut guard) = sink.lock() {
            match guard.write_line(&record.to_string()) {
                Ok(_) => {
                    self.export_lines_total.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to write span line");
                    self.export_errors_total.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// RAII wrapper that guarantees a span is ended (and exported) on every
/// exit path, including early returns and cancellation. Callers mark the
/// outcome; drop performs the close.
pub struct SpanGuard {
    recorder: Recorder,
    span: Option<Span>,
    status: SpanStatus,
}

impl SpanGuard {
    pub fn new(recorder: &Recorder, span: Span) -> Self {
        Self {
            recorder: recorder.clone(),
            span: Some(span),
            status: SpanStatus::Unset,
        }
    }

    pub fn span(&mut self) -> &mut Span {
        self.span.as_mut().expect("span already ended")
    }

    pub fn set_status(&mut self, status: SpanStatus) {
        self.status = status;
    }

    /// End the span now with an explicit status.
    pub fn finish(mut self, status: SpanStatus) {
        if let Some(span) = self.span.take() {
            self.recorder.end_span(span, status);
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(span) = self.span.take() {
            let status = std::mem::replace(&mut self.status, SpanStatus::Unset);
            self.recorder.end_span(span, status);
        }
    }
}

/// Scoped END-phase bookkeeping: exactly one requests_total increment and
/// one latency observation per request, regardless of which phase
/// terminated the pipeline. Runs on drop, so cancellation still flushes.
pub struct RequestTimer {
    metrics: Arc<Metrics>,
    start: Instant,
}

impl RequestTimer {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            start: Instant::now(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        self.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .record_latency_ms(self.start.elapsed().as_millis() as u64);
    }
}
