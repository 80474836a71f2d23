use serde_json::Value;

/// Token counts reported by a chat completion response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Pull `(prompt, completion)` token counts out of a chat completion body.
/// Non-JSON bodies and bodies without a usage block yield `None`; counts
/// that do not fit a `u32` are treated as absent.
pub fn extract_usage(body: &[u8]) -> Option<TokenUsage> {
    let json: Value = serde_json::from_slice(body).ok()?;
    let usage = json.get("usage")?;

    let count = |primary: &str, alias: &str| {
        usage
            .get(primary)
            .or_else(|| usage.get(alias))
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    };
    let prompt = count("prompt_tokens", "input_tokens");
    let completion = count("completion_tokens", "output_tokens");

    if prompt > 0 || completion > 0 {
        Some(TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
        })
    } else {
        None
    }
}
