use anyhow::Context;
use chrono_tz::Tz;

/// Longest accepted token lifetime: 30 days.
pub const MAX_TOKEN_TTL_SECS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    /// Optional shared cache tier. Without it the gateway runs on the
    /// in-process tier only (single replica).
    pub redis_url: Option<String>,
    /// Lifetime of issued tokens in seconds.
    /// Set via AIAPI_TOKEN_TTL_SECS. Default: 3600, at most 30 days.
    pub token_ttl_secs: i64,
    /// Zone used to render `*_local` timestamps and to cut balance months.
    pub timezone: Tz,
    /// Per-user request limit per window. 0 = disabled.
    /// Set via AIAPI_DEFAULT_RPM env var. Default: 600.
    pub default_rate_limit: u64,
    /// Window in seconds for the default rate limit.
    /// Set via AIAPI_DEFAULT_RPM_WINDOW env var. Default: 60.
    pub default_rate_limit_window: u64,
    pub log_retention_days: i64,
    pub token_retention_days: i64,
    pub azure: AzureConfig,
}

#[derive(Debug, Clone, Default)]
pub struct AzureConfig {
    pub openai: Option<OpenAiConfig>,
    pub speech: Option<SpeechConfig>,
    pub document: Option<DocumentConfig>,
    pub cost: Option<CostConfig>,
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub api_version: String,
}

#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub key: String,
    pub tts_url: String,
    pub stt_url: String,
}

#[derive(Debug, Clone)]
pub struct DocumentConfig {
    pub endpoint: String,
    pub key: String,
    pub api_version: String,
}

#[derive(Debug, Clone)]
pub struct CostConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub subscription_id: String,
    pub login_url: String,
    pub management_url: String,
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    from_lookup(|key| std::env::var(key).ok())
}

/// Build a [`Config`] from an arbitrary key lookup (the process environment
/// in production, a map in tests).
pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let timezone_name = get("AIAPI_TIMEZONE").unwrap_or_else(|| "UTC".into());
    let timezone: Tz = timezone_name
        .parse()
        .map_err(|_| anyhow::anyhow!("AIAPI_TIMEZONE: unknown timezone '{}'", timezone_name))?;

    let token_ttl_secs = parse_or(&get, "AIAPI_TOKEN_TTL_SECS", 3600i64)?;
    if token_ttl_secs <= 0 || token_ttl_secs > MAX_TOKEN_TTL_SECS {
        anyhow::bail!(
            "AIAPI_TOKEN_TTL_SECS must be between 1 and {}, got {}",
            MAX_TOKEN_TTL_SECS,
            token_ttl_secs
        );
    }

    Ok(Config {
        port: parse_or(&get, "AIAPI_PORT", 8080u16)?,
        database_url: get("DATABASE_URL").unwrap_or_else(|| "postgres://localhost/aiapi".into()),
        db_max_connections: parse_or(&get, "AIAPI_DB_MAX_CONNECTIONS", 10u32)?,
        redis_url: get("REDIS_URL"),
        token_ttl_secs,
        timezone,
        default_rate_limit: parse_or(&get, "AIAPI_DEFAULT_RPM", 600u64)?,
        default_rate_limit_window: parse_or(&get, "AIAPI_DEFAULT_RPM_WINDOW", 60u64)?.max(1),
        log_retention_days: parse_or(&get, "AIAPI_LOG_RETENTION_DAYS", 90i64)?,
        token_retention_days: parse_or(&get, "AIAPI_TOKEN_RETENTION_DAYS", 30i64)?,
        azure: load_azure(&get)?,
    })
}

fn load_azure<G>(get: &G) -> anyhow::Result<AzureConfig>
where
    G: Fn(&str) -> Option<String>,
{
    let openai = match (get("AZURE_OPENAI_ENDPOINT"), get("AZURE_OPENAI_API_KEY")) {
        (Some(endpoint), Some(api_key)) => Some(OpenAiConfig {
            endpoint: validated_url("AZURE_OPENAI_ENDPOINT", &endpoint)?,
            api_key,
            api_version: get("AZURE_OPENAI_API_VERSION").unwrap_or_else(|| "2024-10-21".into()),
        }),
        _ => None,
    };

    let speech = match get("AZURE_SPEECH_KEY") {
        Some(key) => {
            let region = get("AZURE_SPEECH_REGION");
            let tts = get("AZURE_SPEECH_TTS_URL").or_else(|| {
                region
                    .as_ref()
                    .map(|r| format!("https://{}.tts.speech.microsoft.com/cognitiveservices/v1", r))
            });
            let stt = get("AZURE_SPEECH_STT_URL").or_else(|| {
                region.as_ref().map(|r| {
                    format!(
                        "https://{}.stt.speech.microsoft.com/speech/recognition/conversation/cognitiveservices/v1",
                        r
                    )
                })
            });
            match (tts, stt) {
                (Some(tts), Some(stt)) => Some(SpeechConfig {
                    key,
                    tts_url: validated_url("AZURE_SPEECH_TTS_URL", &tts)?,
                    stt_url: validated_url("AZURE_SPEECH_STT_URL", &stt)?,
                }),
                _ => anyhow::bail!("AZURE_SPEECH_KEY is set but neither AZURE_SPEECH_REGION nor explicit speech URLs are"),
            }
        }
        None => None,
    };

    let document = match (get("AZURE_DOCINTEL_ENDPOINT"), get("AZURE_DOCINTEL_KEY")) {
        (Some(endpoint), Some(key)) => Some(DocumentConfig {
            endpoint: validated_url("AZURE_DOCINTEL_ENDPOINT", &endpoint)?,
            key,
            api_version: get("AZURE_DOCINTEL_API_VERSION").unwrap_or_else(|| "2024-11-30".into()),
        }),
        _ => None,
    };

    let cost = match (
        get("AZURE_TENANT_ID"),
        get("AZURE_CLIENT_ID"),
        get("AZURE_CLIENT_SECRET"),
        get("AZURE_SUBSCRIPTION_ID"),
    ) {
        (Some(tenant_id), Some(client_id), Some(client_secret), Some(subscription_id)) => {
            let login = get("AZURE_LOGIN_URL")
                .unwrap_or_else(|| "https://login.microsoftonline.com".into());
            let management = get("AZURE_MANAGEMENT_URL")
                .unwrap_or_else(|| "https://management.azure.com".into());
            Some(CostConfig {
                tenant_id,
                client_id,
                client_secret,
                subscription_id,
                login_url: validated_url("AZURE_LOGIN_URL", &login)?,
                management_url: validated_url("AZURE_MANAGEMENT_URL", &management)?,
            })
        }
        _ => None,
    };

    Ok(AzureConfig {
        openai,
        speech,
        document,
        cost,
    })
}

fn parse_or<G, T>(get: &G, key: &str, default: T) -> anyhow::Result<T>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{}: invalid value '{}'", key, raw)),
        None => Ok(default),
    }
}

/// Only http(s) URLs are accepted; the trailing slash is dropped so callers can
/// append paths with `format!`.
fn validated_url(key: &str, raw: &str) -> anyhow::Result<String> {
    let url = url::Url::parse(raw).with_context(|| format!("{}: invalid URL '{}'", key, raw))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("{}: unsupported scheme '{}'", key, url.scheme());
    }
    Ok(raw.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = cfg(&[]).unwrap();
        assert_eq!(c.port, 8080);
        assert_eq!(c.token_ttl_secs, 3600);
        assert_eq!(c.timezone, chrono_tz::UTC);
        assert_eq!(c.default_rate_limit, 600);
        assert!(c.redis_url.is_none());
        assert!(c.azure.openai.is_none());
        assert!(c.azure.speech.is_none());
        assert!(c.azure.cost.is_none());
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let err = cfg(&[("AIAPI_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("AIAPI_PORT"));
    }

    #[test]
    fn test_unknown_timezone_rejected() {
        assert!(cfg(&[("AIAPI_TIMEZONE", "Mars/Olympus")]).is_err());
        let c = cfg(&[("AIAPI_TIMEZONE", "Africa/Johannesburg")]).unwrap();
        assert_eq!(c.timezone, chrono_tz::Africa::Johannesburg);
    }

    #[test]
    fn test_non_positive_ttl_rejected() {
        assert!(cfg(&[("AIAPI_TOKEN_TTL_SECS", "0")]).is_err());
    }

    #[test]
    fn test_ttl_capped_at_thirty_days() {
        let c = cfg(&[("AIAPI_TOKEN_TTL_SECS", "2592000")]).unwrap();
        assert_eq!(c.token_ttl_secs, MAX_TOKEN_TTL_SECS);

        assert!(cfg(&[("AIAPI_TOKEN_TTL_SECS", "2592001")]).is_err());
        let err = cfg(&[("AIAPI_TOKEN_TTL_SECS", "9223372036854775807")]).unwrap_err();
        assert!(err.to_string().contains("AIAPI_TOKEN_TTL_SECS"));
    }

    #[test]
    fn test_openai_requires_endpoint_and_key() {
        let c = cfg(&[("AZURE_OPENAI_ENDPOINT", "https://x.openai.azure.com/")]).unwrap();
        assert!(c.azure.openai.is_none());

        let c = cfg(&[
            ("AZURE_OPENAI_ENDPOINT", "https://x.openai.azure.com/"),
            ("AZURE_OPENAI_API_KEY", "k"),
        ])
        .unwrap();
        let openai = c.azure.openai.unwrap();
        assert_eq!(openai.endpoint, "https://x.openai.azure.com");
        assert_eq!(openai.api_version, "2024-10-21");
    }

    #[test]
    fn test_speech_urls_derived_from_region() {
        let c = cfg(&[("AZURE_SPEECH_KEY", "k"), ("AZURE_SPEECH_REGION", "westeurope")]).unwrap();
        let speech = c.azure.speech.unwrap();
        assert_eq!(
            speech.tts_url,
            "https://westeurope.tts.speech.microsoft.com/cognitiveservices/v1"
        );
        assert!(speech.stt_url.starts_with("https://westeurope.stt.speech.microsoft.com/"));
    }

    #[test]
    fn test_speech_key_without_region_fails() {
        assert!(cfg(&[("AZURE_SPEECH_KEY", "k")]).is_err());
    }

    #[test]
    fn test_bad_scheme_rejected() {
        let err = cfg(&[
            ("AZURE_DOCINTEL_ENDPOINT", "ftp://docs.example.com"),
            ("AZURE_DOCINTEL_KEY", "k"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }
}
