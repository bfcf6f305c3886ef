//! Per-request metrics and the structured completion log line.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder, exponential_buckets,
};
use tracing::{info, warn};

use crate::error::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Generate,
    Chat,
}

impl Endpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Generate => "generate",
            Endpoint::Chat => "chat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    EngineError,
    /// The client went away before the stream finished.
    Disconnected,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::EngineError => "engine_error",
            Outcome::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub endpoint: Endpoint,
    pub stream: bool,
    pub tokens: usize,
    pub duration: Duration,
    pub outcome: Outcome,
}

/// Emits the one structured record a request produces.
pub fn log_completion(record: &CompletionRecord) {
    let duration_ms = record.duration.as_secs_f64() * 1000.0;
    let message = match record.endpoint {
        Endpoint::Generate => "generation_complete",
        Endpoint::Chat => "chat_complete",
    };
    match record.outcome {
        Outcome::EngineError => warn!(
            endpoint = record.endpoint.as_str(),
            stream = record.stream,
            tokens = record.tokens,
            duration_ms,
            outcome = record.outcome.as_str(),
            "{message}"
        ),
        _ => info!(
            endpoint = record.endpoint.as_str(),
            stream = record.stream,
            tokens = record.tokens,
            duration_ms,
            outcome = record.outcome.as_str(),
            "{message}"
        ),
    }
}

/// Process-lifetime counters, exported in prometheus text format.
pub struct MetricsRecorder {
    registry: Registry,
    tokens: IntCounterVec,
    duration: HistogramVec,
    requests: IntCounterVec,
    rejections: IntCounterVec,
    in_progress: IntGaugeVec,
    request_size: HistogramVec,
    response_size: HistogramVec,
}

impl MetricsRecorder {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let tokens = IntCounterVec::new(
            Opts::new(
                "llm_gateway_tokens_generated_total",
                "Total tokens generated",
            ),
            &["endpoint"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "llm_gateway_request_duration_seconds",
                "Time from request acceptance to completion",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["endpoint", "stream"],
        )?;
        let requests = IntCounterVec::new(
            Opts::new("llm_gateway_requests_total", "Admitted requests by outcome"),
            &["endpoint", "outcome"],
        )?;
        let rejections = IntCounterVec::new(
            Opts::new(
                "llm_gateway_rejections_total",
                "Requests refused before generation",
            ),
            &["endpoint", "reason"],
        )?;
        let in_progress = IntGaugeVec::new(
            Opts::new(
                "llm_gateway_requests_in_progress",
                "Requests currently generating or streaming",
            ),
            &["endpoint"],
        )?;
        // 64 B .. 1 MiB
        let size_buckets = exponential_buckets(64.0, 4.0, 8)?;
        let request_size = HistogramVec::new(
            HistogramOpts::new("llm_gateway_request_size_bytes", "HTTP request body size")
                .buckets(size_buckets.clone()),
            &["handler"],
        )?;
        let response_size = HistogramVec::new(
            HistogramOpts::new(
                "llm_gateway_response_size_bytes",
                "HTTP response body size, when known up front",
            )
            .buckets(size_buckets),
            &["handler"],
        )?;

        registry.register(Box::new(tokens.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(rejections.clone()))?;
        registry.register(Box::new(in_progress.clone()))?;
        registry.register(Box::new(request_size.clone()))?;
        registry.register(Box::new(response_size.clone()))?;

        Ok(Self {
            registry,
            tokens,
            duration,
            requests,
            rejections,
            in_progress,
            request_size,
            response_size,
        })
    }

    pub fn observe(&self, record: &CompletionRecord) {
        let endpoint = record.endpoint.as_str();
        self.tokens
            .with_label_values(&[endpoint])
            .inc_by(record.tokens as u64);
        self.duration
            .with_label_values(&[endpoint, if record.stream { "true" } else { "false" }])
            .observe(record.duration.as_secs_f64());
        self.requests
            .with_label_values(&[endpoint, record.outcome.as_str()])
            .inc();
    }

    pub fn reject(&self, endpoint: Endpoint, err: &ServiceError) {
        self.rejections
            .with_label_values(&[endpoint.as_str(), err.kind()])
            .inc();
    }

    /// Marks a request as in flight until the returned guard drops.
    pub fn track(&self, endpoint: Endpoint) -> InFlight {
        let gauge = self.in_progress.with_label_values(&[endpoint.as_str()]);
        gauge.inc();
        InFlight { gauge }
    }

    /// Body sizes for one HTTP exchange. Streamed responses have no size
    /// up front and pass `None`.
    pub fn observe_sizes(&self, handler: &str, request_bytes: u64, response_bytes: Option<u64>) {
        self.request_size
            .with_label_values(&[handler])
            .observe(request_bytes as f64);
        if let Some(bytes) = response_bytes {
            self.response_size
                .with_label_values(&[handler])
                .observe(bytes as f64);
        }
    }

    #[cfg(test)]
    pub(crate) fn tokens_generated(&self, endpoint: Endpoint) -> u64 {
        self.tokens.with_label_values(&[endpoint.as_str()]).get()
    }

    #[cfg(test)]
    pub(crate) fn requests(&self, endpoint: Endpoint, outcome: Outcome) -> u64 {
        self.requests
            .with_label_values(&[endpoint.as_str(), outcome.as_str()])
            .get()
    }

    #[cfg(test)]
    pub(crate) fn rejections(&self, endpoint: Endpoint, reason: &str) -> u64 {
        self.rejections
            .with_label_values(&[endpoint.as_str(), reason])
            .get()
    }

    /// Text exposition and its content type.
    pub fn render(&self) -> Result<(String, String), prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        let body = String::from_utf8(buffer)
            .map_err(|err| prometheus::Error::Msg(err.to_string()))?;
        Ok((body, encoder.format_type().to_string()))
    }
}

pub struct InFlight {
    gauge: IntGauge,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
