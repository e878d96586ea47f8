use regex::Regex;
use std::sync::LazyLock;
use url::Url;

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("email pattern is valid")
});

/// Generic or platform mailboxes nobody answers.
static EXCLUDED_EMAIL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"noreply@",
        r"no-reply@",
        r"donotreply@",
        r"info@example\.",
        r"support@linktree",
        r"hello@linktree",
        r"support@shopify",
        r"admin@example",
    ]
    .iter()
    .map(|pattern| Regex::new(&format!("(?i){}", pattern)).expect("exclusion pattern is valid"))
    .collect()
});

pub struct ContactValidator;

impl ContactValidator {
    pub fn is_valid_email(email: &str) -> bool {
        let email = email.trim().to_lowercase();
        EMAIL_PATTERN.is_match(&email)
            && !EXCLUDED_EMAIL_PATTERNS
                .iter()
                .any(|pattern| pattern.is_match(&email))
    }

    /// http(s) with a host.
    pub fn is_valid_url(url: &str) -> bool {
        match Url::parse(url.trim()) {
            Ok(parsed) => {
                matches!(parsed.scheme(), "http" | "https")
                    && parsed.host_str().is_some_and(|host| !host.is_empty())
            }
            Err(_) => false,
        }
    }

    pub fn is_social_media_url(url: &str, social_domains: &[&str]) -> bool {
        let Ok(parsed) = Url::parse(&url.trim().to_lowercase()) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        let host = host.strip_prefix("www.").unwrap_or(host);
        social_domains
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)))
    }

    pub fn normalize_email(email: &str) -> Option<String> {
        let email = email.trim().to_lowercase();
        (!email.is_empty()).then_some(email)
    }

    /// Trim and add `https://` when there is no scheme.
    pub fn normalize_url(url: &str) -> Option<String> {
        let url = url.trim();
        if url.is_empty() {
            return None;
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            Some(url.to_string())
        } else {
            Some(format!("https://{}", url))
        }
    }
}
