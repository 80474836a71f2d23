//! Request shapes for the Azure services behind the gateway: URL builders,
//! SSML rendering, Operation-Location parsing and the Cost Management client.

use std::time::{Duration, Instant};

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config::{CostConfig, DocumentConfig, OpenAiConfig, SpeechConfig};
use crate::errors::AppError;
use crate::proxy::upstream::UpstreamClient;

pub const DEFAULT_VOICE: &str = "en-US-JennyNeural";
pub const DEFAULT_OUTPUT_FORMAT: &str = "audio-16khz-128kbitrate-mono-mp3";
pub const DEFAULT_LANGUAGE: &str = "en-US";

const COST_API_VERSION: &str = "2023-03-01";
const MAX_COST_RANGE_DAYS: i64 = 366;
/// Refresh the management token this long before Azure says it expires.
const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(60);

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._\-]{1,64}$").expect("name regex is valid"));
static LANGUAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z]{2,3}(-[A-Za-z0-9]{2,8}){0,2}$").expect("language regex is valid")
});
static VOICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z]{2,3}-[A-Za-z0-9]{2,8}(-[A-Za-z0-9]+)+$").expect("voice regex is valid")
});

/// Deployment, model and result identifiers end up in upstream URL paths.
pub fn validate_path_segment(kind: &str, value: &str) -> Result<(), AppError> {
    if NAME_RE.is_match(value) {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!("invalid {} '{}'", kind, value)))
    }
}

// -- Chat --

pub fn chat_completions_url(cfg: &OpenAiConfig, deployment: &str) -> String {
    format!(
        "{}/openai/deployments/{}/chat/completions?api-version={}",
        cfg.endpoint,
        urlencoding::encode(deployment),
        urlencoding::encode(&cfg.api_version)
    )
}

/// Chat bodies must carry a non-empty `messages` array and must not ask for
/// streaming.
pub fn validate_chat_body(body: &Value) -> Result<(), AppError> {
    let messages = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::BadRequest("'messages' must be an array".into()))?;
    if messages.is_empty() {
        return Err(AppError::BadRequest("'messages' must not be empty".into()));
    }
    if body.get("stream").and_then(Value::as_bool) == Some(true) {
        return Err(AppError::BadRequest("streaming responses are not supported".into()));
    }
    Ok(())
}

// -- Speech --

#[derive(Debug, Deserialize)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: Option<String>,
    pub output_format: Option<String>,
}

pub fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// `en-US-JennyNeural` speaks `en-US`.
pub fn voice_locale(voice: &str) -> &str {
    match voice.match_indices('-').nth(1) {
        Some((idx, _)) => &voice[..idx],
        None => voice,
    }
}

pub fn build_ssml(text: &str, voice: &str) -> String {
    format!(
        "<speak version='1.0' xml:lang='{}'><voice name='{}'>{}</voice></speak>",
        xml_escape(voice_locale(voice)),
        xml_escape(voice),
        xml_escape(text)
    )
}

/// Validated `(voice, output_format)` for a synthesis request.
pub fn synthesis_params(req: &SynthesisRequest) -> Result<(String, String), AppError> {
    if req.text.trim().is_empty() {
        return Err(AppError::BadRequest("'text' must not be empty".into()));
    }
    let voice = req.voice.clone().unwrap_or_else(|| DEFAULT_VOICE.to_string());
    if !VOICE_RE.is_match(&voice) {
        return Err(AppError::BadRequest(format!("invalid voice '{}'", voice)));
    }
    let format = req
        .output_format
        .clone()
        .unwrap_or_else(|| DEFAULT_OUTPUT_FORMAT.to_string());
    validate_path_segment("output_format", &format)?;
    Ok((voice, format))
}

pub fn transcription_url(cfg: &SpeechConfig, language: &str) -> Result<String, AppError> {
    if !LANGUAGE_RE.is_match(language) {
        return Err(AppError::BadRequest(format!("invalid language '{}'", language)));
    }
    Ok(format!(
        "{}?language={}&format=detailed",
        cfg.stt_url,
        urlencoding::encode(language)
    ))
}

// -- Document intelligence --

pub fn analyze_url(cfg: &DocumentConfig, model_id: &str) -> String {
    format!(
        "{}/documentintelligence/documentModels/{}:analyze?api-version={}",
        cfg.endpoint,
        urlencoding::encode(model_id),
        urlencoding::encode(&cfg.api_version)
    )
}

pub fn analyze_result_url(cfg: &DocumentConfig, model_id: &str, result_id: &str) -> String {
    format!(
        "{}/documentintelligence/documentModels/{}/analyzeResults/{}?api-version={}",
        cfg.endpoint,
        urlencoding::encode(model_id),
        urlencoding::encode(result_id),
        urlencoding::encode(&cfg.api_version)
    )
}

/// Pull the result id out of an `Operation-Location` header
/// (`.../analyzeResults/{id}?api-version=...`).
pub fn parse_result_id(operation_location: &str) -> Option<String> {
    let url = url::Url::parse(operation_location).ok()?;
    let mut segments = url.path_segments()?;
    segments.find(|s| *s == "analyzeResults")?;
    segments
        .next()
        .filter(|id| NAME_RE.is_match(id))
        .map(String::from)
}

// -- Cost management --

pub fn validate_cost_range(from: NaiveDate, to: NaiveDate) -> Result<(), AppError> {
    if from > to {
        return Err(AppError::BadRequest("'from' must not be after 'to'".into()));
    }
    if (to - from).num_days() > MAX_COST_RANGE_DAYS {
        return Err(AppError::BadRequest(format!(
            "date range must not exceed {} days",
            MAX_COST_RANGE_DAYS
        )));
    }
    Ok(())
}

/// Actual cost over `[from, to]`, summed per Azure service.
pub fn cost_query_body(from: NaiveDate, to: NaiveDate) -> Value {
    json!({
        "type": "ActualCost",
        "timeframe": "Custom",
        "timePeriod": {
            "from": format!("{}T00:00:00Z", from.format("%Y-%m-%d")),
            "to": format!("{}T23:59:59Z", to.format("%Y-%m-%d")),
        },
        "dataset": {
            "granularity": "None",
            "aggregation": {
                "totalCost": { "name": "Cost", "function": "Sum" }
            },
            "grouping": [
                { "type": "Dimension", "name": "ServiceName" }
            ]
        }
    })
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CostReport {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

pub fn parse_cost_response(body: &Value) -> Option<CostReport> {
    let props = body.get("properties")?;
    let columns = props
        .get("columns")?
        .as_array()?
        .iter()
        .filter_map(|c| c.get("name").and_then(Value::as_str).map(String::from))
        .collect();
    let rows = props
        .get("rows")?
        .as_array()?
        .iter()
        .filter_map(|r| r.as_array().cloned())
        .collect();
    Some(CostReport { columns, rows })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<Value>,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Client-credentials caller for the Cost Management query API. The bearer
/// token is cached until shortly before it expires.
pub struct CostManagementClient {
    cfg: CostConfig,
    token: Mutex<Option<CachedToken>>,
}

impl CostManagementClient {
    pub fn new(cfg: CostConfig) -> Self {
        Self {
            cfg,
            token: Mutex::new(None),
        }
    }

    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.cfg.login_url, self.cfg.tenant_id)
    }

    fn query_url(&self) -> String {
        format!(
            "{}/subscriptions/{}/providers/Microsoft.CostManagement/query?api-version={}",
            self.cfg.management_url, self.cfg.subscription_id, COST_API_VERSION
        )
    }

    async fn access_token(&self, http: &UpstreamClient) -> Result<String, AppError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.value.clone());
            }
        }

        let scope = format!("{}/.default", self.cfg.management_url);
        let resp = http
            .post_form(
                &self.token_url(),
                &[
                    ("grant_type", "client_credentials"),
                    ("client_id", self.cfg.client_id.as_str()),
                    ("client_secret", self.cfg.client_secret.as_str()),
                    ("scope", scope.as_str()),
                ],
            )
            .await?;

        let status = resp.status();
        if !status.is_success() {
            tracing::error!(status = %status, "azure token request rejected");
            return Err(AppError::Upstream(format!(
                "token request failed with status {}",
                status.as_u16()
            )));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("malformed token response: {}", e)))?;

        // expires_in arrives as a number or a numeric string
        let lifetime = token
            .expires_in
            .as_ref()
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .unwrap_or(3600);
        let refresh_at = Instant::now()
            + Duration::from_secs(lifetime).saturating_sub(TOKEN_EXPIRY_SKEW);

        *guard = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at,
        });
        Ok(token.access_token)
    }

    pub async fn query_costs(
        &self,
        http: &UpstreamClient,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<CostReport, AppError> {
        let token = self.access_token(http).await?;
        let mut headers = reqwest::header::HeaderMap::new();
        let bearer = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| AppError::Internal(e.into()))?;
        headers.insert(reqwest::header::AUTHORIZATION, bearer);

        let resp = http
            .post_json(&self.query_url(), headers, &cost_query_body(from, to))
            .await?;
        let status = resp.status();
        if !status.is_success() {
            if status == reqwest::StatusCode::UNAUTHORIZED {
                // force a fresh token next time
                *self.token.lock().await = None;
            }
            tracing::error!(status = %status, "cost management query rejected");
            return Err(AppError::Upstream(format!(
                "cost query failed with status {}",
                status.as_u16()
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("malformed cost response: {}", e)))?;
        parse_cost_response(&body)
            .ok_or_else(|| AppError::Upstream("cost response has no columns/rows".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai() -> OpenAiConfig {
        OpenAiConfig {
            endpoint: "https://contoso.openai.azure.com".into(),
            api_key: "k".into(),
            api_version: "2024-10-21".into(),
        }
    }

    #[test]
    fn test_chat_url() {
        assert_eq!(
            chat_completions_url(&openai(), "gpt-4o"),
            "https://contoso.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-10-21"
        );
    }

    #[test]
    fn test_chat_body_validation() {
        assert!(validate_chat_body(&json!({"messages": [{"role": "user", "content": "hi"}]})).is_ok());
        assert!(validate_chat_body(&json!({"messages": []})).is_err());
        assert!(validate_chat_body(&json!({"prompt": "hi"})).is_err());
        assert!(validate_chat_body(&json!({"messages": [{}], "stream": true})).is_err());
        assert!(validate_chat_body(&json!({"messages": [{}], "stream": false})).is_ok());
    }

    #[test]
    fn test_ssml_escapes_text_and_derives_locale() {
        let ssml = build_ssml("Fish & <chips> \"now\"", "de-DE-KatjaNeural");
        assert_eq!(
            ssml,
            "<speak version='1.0' xml:lang='de-DE'><voice name='de-DE-KatjaNeural'>Fish &amp; &lt;chips&gt; &quot;now&quot;</voice></speak>"
        );
    }

    #[test]
    fn test_synthesis_defaults_and_validation() {
        let req = SynthesisRequest { text: "hello".into(), voice: None, output_format: None };
        let (voice, format) = synthesis_params(&req).unwrap();
        assert_eq!(voice, DEFAULT_VOICE);
        assert_eq!(format, DEFAULT_OUTPUT_FORMAT);

        let empty = SynthesisRequest { text: "  ".into(), voice: None, output_format: None };
        assert!(synthesis_params(&empty).is_err());

        let injected = SynthesisRequest {
            text: "x".into(),
            voice: Some("en-US-Jenny'/><x".into()),
            output_format: None,
        };
        assert!(synthesis_params(&injected).is_err());
    }

    #[test]
    fn test_transcription_language_validated() {
        let cfg = SpeechConfig {
            key: "k".into(),
            tts_url: "https://tts".into(),
            stt_url: "https://westeurope.stt.speech.microsoft.com/stt".into(),
        };
        assert_eq!(
            transcription_url(&cfg, "en-US").unwrap(),
            "https://westeurope.stt.speech.microsoft.com/stt?language=en-US&format=detailed"
        );
        assert!(transcription_url(&cfg, "en US&x=1").is_err());
    }

    #[test]
    fn test_parse_result_id() {
        let loc = "https://contoso.cognitiveservices.azure.com/documentintelligence/documentModels/prebuilt-read/analyzeResults/3b9f0c1e-aa?api-version=2024-11-30";
        assert_eq!(parse_result_id(loc).as_deref(), Some("3b9f0c1e-aa"));
        assert_eq!(parse_result_id("https://x/documentModels/prebuilt-read"), None);
        assert_eq!(parse_result_id("not a url"), None);
    }

    #[test]
    fn test_cost_range_validation() {
        let d = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        assert!(validate_cost_range(d("2026-01-01"), d("2026-01-31")).is_ok());
        assert!(validate_cost_range(d("2026-02-01"), d("2026-01-31")).is_err());
        assert!(validate_cost_range(d("2025-01-01"), d("2026-01-03")).is_err());
    }

    #[test]
    fn test_cost_query_body_and_parse() {
        let d = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        let body = cost_query_body(d("2026-10-01"), d("2026-10-19"));
        assert_eq!(body["timePeriod"]["from"], "2026-10-01T00:00:00Z");
        assert_eq!(body["timePeriod"]["to"], "2026-10-19T23:59:59Z");
        assert_eq!(body["dataset"]["grouping"][0]["name"], "ServiceName");

        let resp = json!({
            "properties": {
                "columns": [{"name": "Cost", "type": "Number"}, {"name": "ServiceName", "type": "String"}],
                "rows": [[12.5, "Azure OpenAI"], [3.0, "Storage"]]
            }
        });
        let report = parse_cost_response(&resp).unwrap();
        assert_eq!(report.columns, vec!["Cost", "ServiceName"]);
        assert_eq!(report.rows.len(), 2);
        assert!(parse_cost_response(&json!({"error": {}})).is_none());
    }
}
