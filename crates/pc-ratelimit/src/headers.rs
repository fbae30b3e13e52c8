use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// What a provider's response headers say about the caller's current window.
/// Headers are authoritative once parsed.
#[derive(Debug, Clone, Copy)]
pub struct ParsedLimits {
    pub rpm_limit: Option<u32>,
    pub rpm_remaining: Option<u32>,
    pub tpm_limit: Option<u64>,
    pub tpm_remaining: Option<u64>,
    pub window_reset_at: Option<DateTime<Utc>>,
}

/// Per-provider header adapter. Unknown providers fall back to `conservative_defaults`
/// and this function returns `None` rather than guessing field names.
pub fn parse_provider_headers(provider: &str, headers: &HashMap<String, String>) -> Option<ParsedLimits> {
    match provider {
        "openai" | "openrouter" | "azure" | "mistral" | "together" | "groq" => {
            parse_openai_style(headers)
        }
        "anthropic" => parse_anthropic_style(headers),
        _ => None,
    }
}

fn get_u32(headers: &HashMap<String, String>, key: &str) -> Option<u32> {
    headers.get(key).and_then(|v| v.trim().parse().ok())
}

fn get_u64(headers: &HashMap<String, String>, key: &str) -> Option<u64> {
    headers.get(key).and_then(|v| v.trim().parse().ok())
}

/// Parses a relative reset duration like "6s" or "1m30s" into a reset timestamp.
/// Parse failures are swallowed -- callers just get `None` for that field.
fn parse_relative_reset(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    let mut seconds = 0f64;
    let mut num = String::new();
    for ch in raw.chars() {
        match ch {
            '0'..='9' | '.' => num.push(ch),
            'm' => {
                seconds += num.parse::<f64>().ok()? * 60.0;
                num.clear();
            }
            's' => {
                seconds += num.parse::<f64>().ok()?;
                num.clear();
            }
            _ => return None,
        }
    }
    if !num.is_empty() {
        seconds += num.parse::<f64>().ok()?;
    }
    Some(Utc::now() + chrono::Duration::milliseconds((seconds * 1000.0) as i64))
}

fn parse_openai_style(headers: &HashMap<String, String>) -> Option<ParsedLimits> {
    let rpm_limit = get_u32(headers, "x-ratelimit-limit-requests");
    let rpm_remaining = get_u32(headers, "x-ratelimit-remaining-requests");
    let tpm_limit = get_u64(headers, "x-ratelimit-limit-tokens");
    let tpm_remaining = get_u64(headers, "x-ratelimit-remaining-tokens");
    let window_reset_at = headers
        .get("x-ratelimit-reset-requests")
        .or_else(|| headers.get("x-ratelimit-reset-tokens"))
        .and_then(|v| parse_relative_reset(v));

    if rpm_limit.is_none() && rpm_remaining.is_none() && tpm_limit.is_none() && tpm_remaining.is_none() {
        return None;
    }
    Some(ParsedLimits {
        rpm_limit,
        rpm_remaining,
        tpm_limit,
        tpm_remaining,
        window_reset_at,
    })
}

fn parse_anthropic_style(headers: &HashMap<String, String>) -> Option<ParsedLimits> {
    let rpm_limit = get_u32(headers, "anthropic-ratelimit-requests-limit");
    let rpm_remaining = get_u32(headers, "anthropic-ratelimit-requests-remaining");
    let tpm_limit = get_u64(headers, "anthropic-ratelimit-tokens-limit");
    let tpm_remaining = get_u64(headers, "anthropic-ratelimit-tokens-remaining");
    let window_reset_at = headers
        .get("anthropic-ratelimit-requests-reset")
        .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc));

    if rpm_limit.is_none() && rpm_remaining.is_none() && tpm_limit.is_none() && tpm_remaining.is_none() {
        return None;
    }
    Some(ParsedLimits {
        rpm_limit,
        rpm_remaining,
        tpm_limit,
        tpm_remaining,
        window_reset_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_openai_style_headers() {
        let mut headers = HashMap::new();
        headers.insert("x-ratelimit-limit-requests".to_string(), "60".to_string());
        headers.insert("x-ratelimit-remaining-requests".to_string(), "59".to_string());
        headers.insert("x-ratelimit-limit-tokens".to_string(), "90000".to_string());
        headers.insert("x-ratelimit-remaining-tokens".to_string(), "89500".to_string());
        headers.insert("x-ratelimit-reset-requests".to_string(), "1s".to_string());

        let parsed = parse_provider_headers("openai", &headers).unwrap();
        assert_eq!(parsed.rpm_limit, Some(60));
        assert_eq!(parsed.tpm_remaining, Some(89500));
        assert!(parsed.window_reset_at.is_some());
    }

    #[test]
    fn unknown_provider_yields_no_parsed_limits() {
        let headers = HashMap::new();
        assert!(parse_provider_headers("made-up-provider", &headers).is_none());
    }

    #[test]
    fn malformed_values_are_swallowed_not_propagated() {
        let mut headers = HashMap::new();
        headers.insert("x-ratelimit-limit-requests".to_string(), "not-a-number".to_string());
        assert!(parse_provider_headers("openai", &headers).is_none());
    }
}
