use once_cell::sync::Lazy;
use regex::Regex;

static VERSION_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/v\d+$").unwrap());

/// Normalizes an OpenAI-compatible base URL: appends `/v1` unless the URL
/// already carries a version segment, and a trailing `#` pins the URL
/// exactly as given.
pub fn ensure_v1(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if trimmed.ends_with('#') {
        return trimmed.trim_end_matches('#').to_string();
    }

    if VERSION_SUFFIX_RE.is_match(trimmed) || trimmed.contains("/v1") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_v1_when_missing() {
        assert_eq!(ensure_v1("http://localhost:1234"), "http://localhost:1234/v1");
        assert_eq!(ensure_v1("https://example.com/"), "https://example.com/v1");
    }

    #[test]
    fn keeps_existing_version() {
        assert_eq!(ensure_v1("https://example.com/v1"), "https://example.com/v1");
        assert_eq!(ensure_v1("https://example.com/v2"), "https://example.com/v2");
    }

    #[test]
    fn hash_suffix_pins_the_url() {
        assert_eq!(ensure_v1("https://example.com/api#"), "https://example.com/api");
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(ensure_v1("   "), "");
    }
}
