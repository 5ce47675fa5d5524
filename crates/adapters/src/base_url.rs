use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::AdapterError;

static VERSION_SUFFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/v\d+[a-z]*$").expect("invalid version suffix regex"));

/// Resolves the API root for an OpenAI-style endpoint. An empty input falls
/// back to `default`; a trailing `#` keeps the URL verbatim; otherwise `/v1`
/// is appended unless a version segment is already present.
pub fn normalize_base_url(input: &str, default: &str) -> Result<String, AdapterError> {
    let raw = if input.trim().is_empty() {
        default.trim()
    } else {
        input.trim()
    };
    if raw.is_empty() {
        return Err(AdapterError::InvalidConfig(
            "base_url must not be empty".to_string(),
        ));
    }
    if !raw.starts_with("http://") && !raw.starts_with("https://") {
        return Err(AdapterError::InvalidConfig(format!(
            "base_url must start with http:// or https://, got `{raw}`"
        )));
    }

    if let Some(verbatim) = raw.strip_suffix('#') {
        return Ok(verbatim.trim_end_matches('/').to_string());
    }

    let trimmed = raw.trim_end_matches('/');
    if VERSION_SUFFIX_RE.is_match(trimmed) || trimmed.contains("/v1/") {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{trimmed}/v1"))
    }
}

pub fn join_endpoint(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_v1_when_missing() {
        assert_eq!(
            normalize_base_url("https://example.com/", "").unwrap(),
            "https://example.com/v1"
        );
    }

    #[test]
    fn keeps_existing_version_segment() {
        assert_eq!(
            normalize_base_url("https://open.bigmodel.cn/api/paas/v4", "").unwrap(),
            "https://open.bigmodel.cn/api/paas/v4"
        );
        assert_eq!(
            normalize_base_url("", "https://generativelanguage.googleapis.com/v1beta").unwrap(),
            "https://generativelanguage.googleapis.com/v1beta"
        );
    }

    #[test]
    fn hash_suffix_means_verbatim() {
        assert_eq!(
            normalize_base_url("https://proxy.local/custom#", "").unwrap(),
            "https://proxy.local/custom"
        );
    }

    #[test]
    fn rejects_empty_and_schemeless_urls() {
        assert!(normalize_base_url(" ", "").is_err());
        assert!(normalize_base_url("api.example.com", "").is_err());
    }

    #[test]
    fn joins_endpoint_paths() {
        assert_eq!(
            join_endpoint("https://api.deepseek.com/v1/", "/chat/completions"),
            "https://api.deepseek.com/v1/chat/completions"
        );
    }
}
