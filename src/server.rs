use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    Json, Router,
    body::HttpBody,
    extract::{ConnectInfo, MatchedPath, Request, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::{get, post},
};
use chrono::Utc;
use tokio_stream::StreamExt;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::error;
use uuid::Uuid;

use crate::{
    auth::bearer_token,
    engine::GenerationParams,
    error::ServiceError,
    gateway::{Gateway, GenerationJob},
    prompt::build_chat_prompt,
    protocol::{
        ChatChoice, ChatCompletion, ChatMessage, ChatRequest, GenerateRequest, GenerateResponse,
        HealthResponse, Usage,
    },
    rate_limit::Identity,
    stream::{Framing, StreamEvent, segments},
    telemetry::Endpoint,
    validation::{check_temperature, require_messages},
};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

/// Callers must serve this with connect info so the peer address is
/// available for rate limiting.
pub fn build_router(gateway: Arc<Gateway>) -> Router {
    let cors = cors_layer(&gateway.config().cors_origins);
    let state = AppState { gateway };

    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/generate", post(generate))
        .route("/v1/chat/completions", post(chat_completions))
        .route_layer(middleware::from_fn_with_state(state.clone(), record_sizes))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

async fn record_sizes(
    State(state): State<AppState>,
    path: MatchedPath,
    request: Request,
    next: Next,
) -> Response {
    let request_bytes = request.body().size_hint().exact().unwrap_or(0);
    let response = next.run(request).await;
    let response_bytes = response.body().size_hint().exact();
    state
        .gateway
        .metrics()
        .observe_sizes(path.as_str(), request_bytes, response_bytes);
    response
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model: state.gateway.config().model_id.clone(),
        mock: state.gateway.is_mock(),
    })
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.gateway.metrics().render() {
        Ok((body, content_type)) => match HeaderValue::from_str(&content_type) {
            Ok(value) => ([(header::CONTENT_TYPE, value)], body).into_response(),
            Err(err) => {
                error!(?err, "failed to build content-type header");
                (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response()
            }
        },
        Err(err) => {
            error!(?err, "failed to encode prometheus metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response()
        }
    }
}

async fn generate(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let accepted_at = Instant::now();
    let gateway = &state.gateway;
    let endpoint = Endpoint::Generate;
    let config = gateway.config();

    let Json(request) = payload.map_err(|rej| malformed(gateway, endpoint, rej))?;
    let temperature = request.temperature.unwrap_or(config.default_temperature);
    check_temperature(temperature).map_err(|err| gateway.refuse(endpoint, err))?;
    let max_new_tokens = request
        .max_new_tokens
        .unwrap_or(config.default_max_new_tokens);

    gateway.admit(
        endpoint,
        bearer_token(&headers),
        &Identity::from_addr(peer),
        "max_new_tokens",
        max_new_tokens,
    )?;

    let job = GenerationJob {
        endpoint,
        prompt: request.prompt,
        params: GenerationParams {
            max_new_tokens,
            temperature,
        },
        accepted_at,
    };

    if request.stream {
        return Ok(sse_response(gateway, job, Framing::Text));
    }

    let completion = gateway.complete(job).await?;
    Ok(Json(GenerateResponse {
        generated_text: completion.text,
    })
    .into_response())
}

async fn chat_completions(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let accepted_at = Instant::now();
    let gateway = &state.gateway;
    let endpoint = Endpoint::Chat;
    let config = gateway.config();

    let Json(request) = payload.map_err(|rej| malformed(gateway, endpoint, rej))?;
    let temperature = request.temperature.unwrap_or(config.default_temperature);
    require_messages(&request.messages)
        .and_then(|()| check_temperature(temperature))
        .map_err(|err| gateway.refuse(endpoint, err))?;
    let max_tokens = request.max_tokens.unwrap_or(config.default_max_new_tokens);

    gateway.admit(
        endpoint,
        bearer_token(&headers),
        &Identity::from_addr(peer),
        "max_tokens",
        max_tokens,
    )?;

    let model = request.model.unwrap_or_else(|| config.model_id.clone());
    let prompt = build_chat_prompt(&request.messages);
    let prompt_tokens = segments(&prompt).count();
    let id = format!("chatcmpl-{}", Uuid::new_v4());
    let created = Utc::now().timestamp();

    let job = GenerationJob {
        endpoint,
        prompt,
        params: GenerationParams {
            max_new_tokens: max_tokens,
            temperature,
        },
        accepted_at,
    };

    if request.stream {
        let framing = Framing::ChatDelta { id, created, model };
        return Ok(sse_response(gateway, job, framing));
    }

    let completion = gateway.complete(job).await?;
    Ok(Json(ChatCompletion {
        id,
        object: "chat.completion",
        created,
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: completion.text,
            },
            finish_reason: "stop",
        }],
        usage: Usage {
            prompt_tokens,
            completion_tokens: completion.tokens,
            total_tokens: prompt_tokens + completion.tokens,
        },
    })
    .into_response())
}

fn malformed(gateway: &Gateway, endpoint: Endpoint, rejection: JsonRejection) -> ServiceError {
    gateway.refuse(endpoint, ServiceError::MalformedInput(rejection.body_text()))
}

fn sse_response(gateway: &Arc<Gateway>, job: GenerationJob, framing: Framing) -> Response {
    let events = gateway
        .stream(job, framing)
        .map(|event: StreamEvent| Ok::<Event, Infallible>(event.into()));
    Sse::new(events).into_response()
}
