//! Request lifecycle: admission, generation, streaming and telemetry.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::{
    auth::AuthGate,
    config::AppConfig,
    engine::{EngineError, GenerationEngine, GenerationParams, GenerationResult},
    error::ServiceError,
    rate_limit::{Identity, RateLimiter},
    stream::{Framing, StreamEncoder, StreamEvent, segments},
    telemetry::{CompletionRecord, Endpoint, InFlight, MetricsRecorder, Outcome, log_completion},
    validation::enforce_limit,
};

/// Unsent events a stream may hold before the producer waits on the client.
const STREAM_BUFFER: usize = 16;

/// One admitted generation.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub endpoint: Endpoint,
    pub prompt: String,
    pub params: GenerationParams,
    pub accepted_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub tokens: usize,
}

pub struct Gateway {
    config: Arc<AppConfig>,
    auth: AuthGate,
    limiter: RateLimiter,
    metrics: MetricsRecorder,
    engine: Arc<dyn GenerationEngine>,
}

impl Gateway {
    pub fn new(
        config: Arc<AppConfig>,
        engine: Arc<dyn GenerationEngine>,
    ) -> Result<Self, prometheus::Error> {
        Ok(Self {
            auth: AuthGate::new(&config.api_token),
            limiter: RateLimiter::new(config.rate_limit),
            metrics: MetricsRecorder::new()?,
            engine,
            config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    pub fn is_mock(&self) -> bool {
        self.engine.is_mock()
    }

    /// Credential, then rate limit, then the length ceiling. A refused
    /// credential never touches the limiter and nothing here reaches the
    /// engine.
    pub fn admit(
        &self,
        endpoint: Endpoint,
        credential: Option<&str>,
        identity: &Identity,
        field: &'static str,
        requested: usize,
    ) -> Result<(), ServiceError> {
        let admitted = self
            .auth
            .authenticate(credential)
            .and_then(|()| self.limiter.check(identity))
            .and_then(|()| enforce_limit(field, requested, self.config.max_new_tokens_limit));

        if let Err(err) = &admitted {
            debug!(
                endpoint = endpoint.as_str(),
                %identity,
                reason = err.kind(),
                "request refused"
            );
            self.metrics.reject(endpoint, err);
        }
        admitted
    }

    /// Counts a refusal raised outside `admit` and hands the error back.
    pub fn refuse(&self, endpoint: Endpoint, err: ServiceError) -> ServiceError {
        self.metrics.reject(endpoint, &err);
        err
    }

    /// Runs the job to completion and returns the generated text.
    ///
    /// If the caller drops this future before the engine returns, the
    /// request is recorded as disconnected.
    pub async fn complete(&self, job: GenerationJob) -> Result<Completion, ServiceError> {
        let pending = self.begin(&job, false);

        match self.run_engine(job.prompt, job.params).await {
            Ok(result) => {
                let text = result.generated_segment().to_string();
                let tokens = segments(&text).count();
                pending.finish(tokens, Outcome::Ok);
                Ok(Completion { text, tokens })
            }
            Err(err) => {
                pending.finish(0, Outcome::EngineError);
                Err(err.into())
            }
        }
    }

    /// Starts the job on a producer task and returns the event stream.
    ///
    /// The engine runs once to completion, then its output is released one
    /// segment per event. Dropping the returned stream stops the producer at
    /// its next send.
    pub fn stream(
        self: &Arc<Self>,
        job: GenerationJob,
        framing: Framing,
    ) -> ReceiverStream<StreamEvent> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let gateway = Arc::clone(self);
        tokio::spawn(async move { gateway.produce(job, framing, tx).await });
        ReceiverStream::new(rx)
    }

    async fn produce(
        &self,
        job: GenerationJob,
        framing: Framing,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        let pending = self.begin(&job, true);
        let mut encoder = StreamEncoder::new(framing);

        let (tokens, outcome) = match self.run_engine(job.prompt, job.params).await {
            Ok(result) => {
                let text = result.generated_segment();
                let mut outcome = Outcome::Ok;
                for segment in segments(text) {
                    if tx.send(encoder.chunk(segment)).await.is_err() {
                        outcome = Outcome::Disconnected;
                        break;
                    }
                }
                (segments(text).count(), outcome)
            }
            Err(err) => {
                let err = ServiceError::from(err);
                let outcome = match tx.send(encoder.error(&err)).await {
                    Ok(()) => Outcome::EngineError,
                    Err(_) => Outcome::Disconnected,
                };
                (0, outcome)
            }
        };

        let done = encoder.finish();
        pending.finish(tokens, outcome);

        if outcome != Outcome::Disconnected {
            // a failed send here only means the client already left
            let _ = tx.send(done).await;
        } else {
            debug!(endpoint = job.endpoint.as_str(), "client disconnected mid-stream");
        }
    }

    fn begin(&self, job: &GenerationJob, stream: bool) -> Pending<'_> {
        Pending {
            gateway: self,
            endpoint: job.endpoint,
            stream,
            accepted_at: job.accepted_at,
            _in_flight: self.metrics.track(job.endpoint),
            recorded: false,
        }
    }

    async fn run_engine(
        &self,
        prompt: String,
        params: GenerationParams,
    ) -> Result<GenerationResult, EngineError> {
        let engine = Arc::clone(&self.engine);
        task::spawn_blocking(move || engine.generate(&prompt, &params))
            .await
            .map_err(|err| EngineError::TaskFailed(err.to_string()))?
    }

    fn record(
        &self,
        endpoint: Endpoint,
        stream: bool,
        tokens: usize,
        accepted_at: Instant,
        outcome: Outcome,
    ) {
        let record = CompletionRecord {
            endpoint,
            stream,
            tokens,
            duration: accepted_at.elapsed(),
            outcome,
        };
        self.metrics.observe(&record);
        log_completion(&record);
    }
}

/// An admitted request that has not been recorded yet. Dropped unfinished,
/// it records a disconnect.
struct Pending<'a> {
    gateway: &'a Gateway,
    endpoint: Endpoint,
    stream: bool,
    accepted_at: Instant,
    _in_flight: InFlight,
    recorded: bool,
}

impl Pending<'_> {
    fn finish(mut self, tokens: usize, outcome: Outcome) {
        self.recorded = true;
        self.gateway
            .record(self.endpoint, self.stream, tokens, self.accepted_at, outcome);
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.gateway.record(
                self.endpoint,
                self.stream,
                0,
                self.accepted_at,
                Outcome::Disconnected,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio_stream::StreamExt;

    use super::*;
    use crate::engine::{MOCK_RESPONSE, MockEngine};

    struct FailingEngine;

    impl GenerationEngine for FailingEngine {
        fn generate(
            &self,
            _prompt: &str,
            _params: &GenerationParams,
        ) -> Result<GenerationResult, EngineError> {
            Err(EngineError::Backend("out of memory".into()))
        }
    }

    /// Holds the blocking pool long enough for the caller to give up.
    struct SlowEngine;

    impl GenerationEngine for SlowEngine {
        fn generate(
            &self,
            prompt: &str,
            params: &GenerationParams,
        ) -> Result<GenerationResult, EngineError> {
            std::thread::sleep(Duration::from_millis(300));
            MockEngine::new().generate(prompt, params)
        }
    }

    #[derive(Default)]
    struct CountingEngine {
        calls: AtomicUsize,
    }

    impl GenerationEngine for CountingEngine {
        fn generate(
            &self,
            prompt: &str,
            params: &GenerationParams,
        ) -> Result<GenerationResult, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            MockEngine::new().generate(prompt, params)
        }
    }

    fn gateway_with(engine: Arc<dyn GenerationEngine>, config: AppConfig) -> Arc<Gateway> {
        Arc::new(Gateway::new(Arc::new(config), engine).unwrap())
    }

    fn job(endpoint: Endpoint, prompt: &str) -> GenerationJob {
        GenerationJob {
            endpoint,
            prompt: prompt.to_string(),
            params: GenerationParams {
                max_new_tokens: 16,
                temperature: 0.7,
            },
            accepted_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn stream_and_complete_agree_on_text() {
        let gateway = gateway_with(Arc::new(MockEngine::new()), AppConfig::default());

        let completion = gateway.complete(job(Endpoint::Generate, "Hello")).await.unwrap();
        assert_eq!(completion.text, MOCK_RESPONSE);
        assert_eq!(completion.tokens, 5);

        let events: Vec<_> = gateway
            .stream(job(Endpoint::Generate, "Hello"), Framing::Text)
            .collect()
            .await;
        let streamed: String = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Chunk(payload) => {
                    let value: serde_json::Value = serde_json::from_str(payload).unwrap();
                    value["text"].as_str().map(str::to_string)
                }
                _ => None,
            })
            .collect();
        assert_eq!(streamed, completion.text);
        assert_eq!(events.last(), Some(&StreamEvent::Done));
        assert_eq!(gateway.metrics().tokens_generated(Endpoint::Generate), 10);
    }

    #[tokio::test]
    async fn empty_output_streams_only_the_sentinel() {
        let gateway = gateway_with(Arc::new(MockEngine::with_response("")), AppConfig::default());
        let events: Vec<_> = gateway
            .stream(job(Endpoint::Generate, "Hello"), Framing::Text)
            .collect()
            .await;
        assert_eq!(events, vec![StreamEvent::Done]);
    }

    #[tokio::test]
    async fn engine_failure_mid_stream_still_terminates() {
        let gateway = gateway_with(Arc::new(FailingEngine), AppConfig::default());
        let events: Vec<_> = gateway
            .stream(job(Endpoint::Chat, "user: hi\nassistant: "), Framing::Text)
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StreamEvent::Error(body) if body.contains("out of memory")));
        assert_eq!(events[1], StreamEvent::Done);
    }

    #[tokio::test]
    async fn engine_failure_surfaces_on_complete() {
        let gateway = gateway_with(Arc::new(FailingEngine), AppConfig::default());
        let err = gateway.complete(job(Endpoint::Generate, "x")).await.unwrap_err();
        assert!(matches!(err, ServiceError::Engine(EngineError::Backend(_))));
        assert_eq!(gateway.metrics().tokens_generated(Endpoint::Generate), 0);
    }

    #[tokio::test]
    async fn refused_credentials_skip_limiter_and_engine() {
        let engine = Arc::new(CountingEngine::default());
        let config = AppConfig {
            api_token: "s3cret".into(),
            rate_limit: crate::config::RateLimitPolicy::per_minute(1),
            ..AppConfig::default()
        };
        let gateway = gateway_with(engine.clone(), config);
        let caller = Identity::new("10.1.1.1");

        for _ in 0..3 {
            let err = gateway
                .admit(Endpoint::Generate, Some("wrong"), &caller, "max_new_tokens", 8)
                .unwrap_err();
            assert!(matches!(err, ServiceError::Unauthorized));
        }
        // the single permitted request is still available
        gateway
            .admit(Endpoint::Generate, Some("s3cret"), &caller, "max_new_tokens", 8)
            .unwrap();
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        assert_eq!(gateway.metrics().rejections(Endpoint::Generate, "unauthorized"), 3);
    }

    #[tokio::test]
    async fn dropped_stream_is_recorded_once_as_disconnected() {
        // more segments than the channel holds, so the producer is parked on a send
        let long_reply = "word ".repeat(STREAM_BUFFER * 8);
        let gateway = gateway_with(
            Arc::new(MockEngine::with_response(&long_reply)),
            AppConfig::default(),
        );
        let mut events = gateway.stream(job(Endpoint::Generate, "p"), Framing::Text);
        assert!(matches!(events.next().await, Some(StreamEvent::Chunk(_))));
        drop(events);

        let metrics = gateway.metrics();
        for _ in 0..1_000 {
            if metrics.requests(Endpoint::Generate, Outcome::Disconnected) > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(metrics.requests(Endpoint::Generate, Outcome::Disconnected), 1);
        assert_eq!(metrics.requests(Endpoint::Generate, Outcome::Ok), 0);
        assert_eq!(metrics.tokens_generated(Endpoint::Generate), (STREAM_BUFFER * 8) as u64);
        let (body, _) = metrics.render().unwrap();
        assert!(body.contains("llm_gateway_requests_in_progress{endpoint=\"generate\"} 0"));
    }

    #[tokio::test]
    async fn abandoned_completion_is_recorded_as_disconnected() {
        let gateway = gateway_with(Arc::new(SlowEngine), AppConfig::default());

        let outcome = tokio::time::timeout(
            Duration::from_millis(20),
            gateway.complete(job(Endpoint::Chat, "user: hi\nassistant: ")),
        )
        .await;
        assert!(outcome.is_err());

        let metrics = gateway.metrics();
        assert_eq!(metrics.requests(Endpoint::Chat, Outcome::Disconnected), 1);
        assert_eq!(metrics.requests(Endpoint::Chat, Outcome::Ok), 0);
        let (body, _) = metrics.render().unwrap();
        assert!(body.contains("llm_gateway_requests_in_progress{endpoint=\"chat\"} 0"));
    }

    #[tokio::test]
    async fn finished_completion_is_recorded_once() {
        let gateway = gateway_with(Arc::new(MockEngine::new()), AppConfig::default());
        gateway.complete(job(Endpoint::Generate, "Hello")).await.unwrap();
        let metrics = gateway.metrics();
        assert_eq!(metrics.requests(Endpoint::Generate, Outcome::Ok), 1);
        assert_eq!(metrics.requests(Endpoint::Generate, Outcome::Disconnected), 0);
    }
}
