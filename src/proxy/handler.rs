use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::extract::{ApiPath, ApiQuery};
use crate::errors::AppError;
use crate::middleware::auth::{validate_token, AuthUser, CallMeta, TokenQuery};
use crate::models::usage::extract_usage;
use crate::proxy::azure::{self, SynthesisRequest};
use crate::proxy::metering::{MeteredCall, MeteredError};
use crate::AppState;

const SPEECH_KEY_HEADER: &str = "ocp-apim-subscription-key";
const DEFAULT_WAV_CONTENT_TYPE: &str = "audio/wav; codecs=audio/pcm; samplerate=16000";

fn header_value(value: &str) -> Result<HeaderValue, AppError> {
    HeaderValue::from_str(value)
        .map_err(|_| AppError::Internal(anyhow::anyhow!("credential contains invalid header characters")))
}

fn request_content_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
}

/// `POST /llm/chat/:deployment`: Azure OpenAI chat completion.
#[tracing::instrument(skip(state, user, query, body), fields(user_id = %user.id))]
pub async fn chat_completion(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    ApiPath(deployment): ApiPath<String>,
    ApiQuery(query): ApiQuery<TokenQuery>,
    body: Bytes,
) -> Result<Response, MeteredError> {
    let openai = state
        .config
        .azure
        .openai
        .as_ref()
        .ok_or(AppError::ServiceNotConfigured("chat completion"))?;
    azure::validate_path_segment("deployment", &deployment)?;
    let json: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid JSON body: {}", e)))?;
    azure::validate_chat_body(&json)?;

    let mut headers = HeaderMap::new();
    headers.insert("api-key", header_value(&openai.api_key)?);
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    let call = MeteredCall::begin(
        &state,
        &user,
        query.token.as_deref(),
        &format!("/llm/chat/{}", deployment),
        "/llm/chat",
        "llm_chat",
    )
    .await?;

    let url = azure::chat_completions_url(openai, &deployment);
    let result = state
        .upstream_client
        .forward(Method::POST, &url, headers, body)
        .await;
    let reply = call.settle(&state, result).await?;

    let mut meta = call.meta();
    if reply.status.is_success() {
        meta.usage = extract_usage(&reply.body);
    }
    Ok(call.finish(reply.into_response(), meta))
}

/// `POST /speech/synthesize`: text to speech; returns the audio bytes.
#[tracing::instrument(skip(state, user, query, body), fields(user_id = %user.id))]
pub async fn synthesize_speech(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    ApiQuery(query): ApiQuery<TokenQuery>,
    body: Bytes,
) -> Result<Response, MeteredError> {
    let speech = state
        .config
        .azure
        .speech
        .as_ref()
        .ok_or(AppError::ServiceNotConfigured("speech"))?;
    let req: SynthesisRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid JSON body: {}", e)))?;
    let (voice, output_format) = azure::synthesis_params(&req)?;

    let mut headers = HeaderMap::new();
    headers.insert(SPEECH_KEY_HEADER, header_value(&speech.key)?);
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/ssml+xml"),
    );
    headers.insert("x-microsoft-outputformat", header_value(&output_format)?);
    headers.insert(
        axum::http::header::USER_AGENT,
        HeaderValue::from_static("ai-api-framework"),
    );

    let call = MeteredCall::begin(
        &state,
        &user,
        query.token.as_deref(),
        "/speech/synthesize",
        "/speech/synthesize",
        "speech_synthesize",
    )
    .await?;

    let ssml = azure::build_ssml(&req.text, &voice);
    let result = state
        .upstream_client
        .forward(Method::POST, &speech.tts_url, headers, Bytes::from(ssml))
        .await;
    let reply = call.settle(&state, result).await?;
    Ok(call.finish(reply.into_response(), call.meta()))
}

#[derive(Debug, Deserialize)]
pub struct TranscribeQuery {
    pub token: Option<String>,
    pub language: Option<String>,
}

/// `POST /speech/transcribe?language=`: short WAV audio to text.
#[tracing::instrument(skip(state, user, query, headers, body), fields(user_id = %user.id))]
pub async fn transcribe_speech(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    ApiQuery(query): ApiQuery<TranscribeQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, MeteredError> {
    let speech = state
        .config
        .azure
        .speech
        .as_ref()
        .ok_or(AppError::ServiceNotConfigured("speech"))?;
    if body.is_empty() {
        return Err(AppError::BadRequest("audio body must not be empty".into()).into());
    }
    let language = query.language.as_deref().unwrap_or(azure::DEFAULT_LANGUAGE);
    let url = azure::transcription_url(speech, language)?;

    let content_type = request_content_type(&headers).unwrap_or(DEFAULT_WAV_CONTENT_TYPE);
    let mut upstream_headers = HeaderMap::new();
    upstream_headers.insert(SPEECH_KEY_HEADER, header_value(&speech.key)?);
    upstream_headers.insert(axum::http::header::CONTENT_TYPE, header_value(content_type)?);
    upstream_headers.insert(
        axum::http::header::ACCEPT,
        HeaderValue::from_static("application/json"),
    );

    let call = MeteredCall::begin(
        &state,
        &user,
        query.token.as_deref(),
        "/speech/transcribe",
        "/speech/transcribe",
        "speech_transcribe",
    )
    .await?;

    let result = state
        .upstream_client
        .forward(Method::POST, &url, upstream_headers, body)
        .await;
    let reply = call.settle(&state, result).await?;
    Ok(call.finish(reply.into_response(), call.meta()))
}

#[derive(Debug, Serialize)]
pub struct AnalyzeAccepted {
    pub result_id: String,
    pub status_url: String,
}

/// `POST /document/analyze/:model_id`: starts an asynchronous analysis.
///
/// The body is either the raw document or JSON with `urlSource` /
/// `base64Source`; it is forwarded as-is.
#[tracing::instrument(skip(state, user, query, headers, body), fields(user_id = %user.id))]
pub async fn analyze_document(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    ApiPath(model_id): ApiPath<String>,
    ApiQuery(query): ApiQuery<TokenQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, MeteredError> {
    let document = state
        .config
        .azure
        .document
        .as_ref()
        .ok_or(AppError::ServiceNotConfigured("document intelligence"))?;
    azure::validate_path_segment("model_id", &model_id)?;
    if body.is_empty() {
        return Err(AppError::BadRequest("document body must not be empty".into()).into());
    }
    let content_type = request_content_type(&headers).unwrap_or("application/octet-stream");
    if content_type.starts_with("application/json") {
        let json: Value = serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("invalid JSON body: {}", e)))?;
        if json.get("urlSource").is_none() && json.get("base64Source").is_none() {
            return Err(AppError::BadRequest(
                "JSON body must contain 'urlSource' or 'base64Source'".into(),
            )
            .into());
        }
    }

    let mut upstream_headers = HeaderMap::new();
    upstream_headers.insert(SPEECH_KEY_HEADER, header_value(&document.key)?);
    upstream_headers.insert(axum::http::header::CONTENT_TYPE, header_value(content_type)?);

    let call = MeteredCall::begin(
        &state,
        &user,
        query.token.as_deref(),
        &format!("/document/analyze/{}", model_id),
        "/document/analyze",
        "document_analyze",
    )
    .await?;

    let url = azure::analyze_url(document, &model_id);
    let result = state
        .upstream_client
        .forward(Method::POST, &url, upstream_headers, body)
        .await;
    let reply = call.settle(&state, result).await?;
    if !reply.status.is_success() {
        return Ok(call.finish(reply.into_response(), call.meta()));
    }

    let Some(result_id) = reply.header("operation-location").and_then(azure::parse_result_id) else {
        tracing::error!(status = reply.status.as_u16(), "analysis accepted without a usable Operation-Location");
        return Err(call
            .fail(&state, AppError::Upstream("missing Operation-Location header".into()))
            .await);
    };

    let status_url = format!("/api/v1/document/results/{}/{}", model_id, result_id);
    let response = (
        StatusCode::ACCEPTED,
        Json(AnalyzeAccepted {
            result_id,
            status_url,
        }),
    )
        .into_response();
    Ok(call.finish(response, call.meta()))
}

/// `GET /document/results/:model_id/:result_id`: poll an analysis. Needs a
/// valid token but is not metered.
#[tracing::instrument(skip(state, user, query), fields(user_id = %user.id))]
pub async fn document_result(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    ApiPath((model_id, result_id)): ApiPath<(String, String)>,
    ApiQuery(query): ApiQuery<TokenQuery>,
) -> Result<Response, MeteredError> {
    let document = state
        .config
        .azure
        .document
        .as_ref()
        .ok_or(AppError::ServiceNotConfigured("document intelligence"))?;
    azure::validate_path_segment("model_id", &model_id)?;
    azure::validate_path_segment("result_id", &result_id)?;
    let token = validate_token(&state, &user, query.token.as_deref()).await?;

    let mut headers = HeaderMap::new();
    headers.insert(SPEECH_KEY_HEADER, header_value(&document.key)?);

    let url = azure::analyze_result_url(document, &model_id, &result_id);
    let resp = state
        .upstream_client
        .forward(Method::GET, &url, headers, Bytes::new())
        .await?;
    let reply = crate::proxy::metering::UpstreamReply::read(resp).await?;

    let mut response = reply.into_response();
    response.extensions_mut().insert(CallMeta {
        token_id: Some(token.id),
        ..CallMeta::default()
    });
    Ok(response)
}
