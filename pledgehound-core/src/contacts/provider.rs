use crate::contacts::blocker::DomainBlocker;
use crate::error::ProviderError;
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_FIRECRAWL_API_URL: &str = "https://api.firecrawl.dev";
pub const MAP_SEARCH: &str = "contact";
pub const MAP_LIMIT: usize = 5;

const SCRAPE_PROMPT: &str = "Extract the contact email address exactly as it is written on this page. \
Do not correct, shorten or reformat it. Only return an email you can see on the page; never infer one \
from the domain name. Return an empty string when no email is visible. Set has_contact_form to true \
only when the page contains an HTML contact form, and give its URL in contact_form_url.";

/// What a single scraped page said about contact details.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScrapedContact {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub has_contact_form: Option<bool>,
    #[serde(default)]
    pub contact_form_url: Option<String>,
}

/// A content-extraction service that can list a site's pages and pull
/// contact details out of one page.
pub trait ExtractionProvider: Send + Sync {
    fn map_site<'a>(
        &'a self,
        api_key: &'a str,
        url: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, ProviderError>>;

    fn scrape_contact<'a>(
        &'a self,
        api_key: &'a str,
        url: &'a str,
    ) -> BoxFuture<'a, Result<ScrapedContact, ProviderError>>;
}

/// Firecrawl v2 over HTTP.
#[derive(Debug, Clone)]
pub struct FirecrawlProvider {
    client: Client,
    base_url: String,
}

impl FirecrawlProvider {
    pub fn new(base_url: &str) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ProviderError::Other(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(
        &self,
        api_key: &str,
        endpoint: &str,
        body: Value,
    ) -> Result<Value, ProviderError> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!("POST {}", url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Other(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_failure(status, &text));
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| ProviderError::Other(e.to_string()))?;
        if parsed.get("success").and_then(Value::as_bool) == Some(false) {
            let message = parsed
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("request unsuccessful")
                .to_string();
            return Err(classify_message(message));
        }
        Ok(parsed)
    }
}

fn classify_message(message: String) -> ProviderError {
    if DomainBlocker::is_not_supported_error(&message) {
        ProviderError::WebsiteNotSupported(message)
    } else if message.to_lowercase().contains("rate limit") {
        ProviderError::RateLimited
    } else {
        ProviderError::Other(message)
    }
}

pub fn classify_failure(status: StatusCode, body: &str) -> ProviderError {
    match status {
        StatusCode::PAYMENT_REQUIRED => ProviderError::PaymentRequired,
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
        _ => {
            let message = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| body.chars().take(200).collect());
            match classify_message(message) {
                ProviderError::Other(message) => {
                    ProviderError::Other(format!("HTTP {}: {}", status.as_u16(), message))
                }
                other => other,
            }
        }
    }
}

/// Map links come back either as plain strings or as `{url}` objects.
pub fn parse_map_links(response: &Value) -> Vec<String> {
    response
        .get("links")
        .and_then(Value::as_array)
        .map(|links| {
            links
                .iter()
                .filter_map(|link| match link {
                    Value::String(url) => Some(url.clone()),
                    Value::Object(obj) => {
                        obj.get("url").and_then(Value::as_str).map(str::to_string)
                    }
                    _ => None,
                })
                .filter(|url| !url.trim().is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Contact fields from a scrape response: `data.json`, then `data`, then
/// the top level.
pub fn parse_scrape_contact(response: &Value) -> ScrapedContact {
    let data = response.get("data").unwrap_or(response);
    let fields = data.get("json").filter(|v| v.is_object()).unwrap_or(data);
    serde_json::from_value(fields.clone()).unwrap_or_default()
}

pub fn scrape_request(url: &str) -> Value {
    json!({
        "url": url,
        "onlyMainContent": false,
        "formats": [{
            "type": "json",
            "schema": {
                "type": "object",
                "properties": {
                    "email": {
                        "type": "string",
                        "description": "Email address ONLY if explicitly visible on the page"
                    },
                    "has_contact_form": {
                        "type": "boolean",
                        "description": "Whether there's a contact form on the page"
                    },
                    "contact_form_url": {
                        "type": "string",
                        "description": "URL of the contact form if it exists"
                    }
                }
            },
            "prompt": SCRAPE_PROMPT
        }]
    })
}

impl ExtractionProvider for FirecrawlProvider {
    fn map_site<'a>(
        &'a self,
        api_key: &'a str,
        url: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, ProviderError>> {
        Box::pin(async move {
            let body = json!({
                "url": url,
                "search": MAP_SEARCH,
                "limit": MAP_LIMIT,
                "includeSubdomains": false,
                "sitemap": "include",
            });
            let response = self.post(api_key, "/v2/map", body).await?;
            Ok(parse_map_links(&response))
        })
    }

    fn scrape_contact<'a>(
        &'a self,
        api_key: &'a str,
        url: &'a str,
    ) -> BoxFuture<'a, Result<ScrapedContact, ProviderError>> {
        Box::pin(async move {
            let response = self.post(api_key, "/v2/scrape", scrape_request(url)).await?;
            Ok(parse_scrape_contact(&response))
        })
    }
}
