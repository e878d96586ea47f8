//! Session bootstrap: warm the cookie jar, pull the anti-forgery token and
//! install the headers the site's JSON endpoints expect.

use crate::error::{AttemptError, Result, ScanError};
use crate::executor::{Executor, get_text};
use crate::session::{Session, SiteConfig};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{debug, info};

/// Wall-clock budget for the whole listing bootstrap.
pub const DEFAULT_BOOTSTRAP_DEADLINE: Duration = Duration::from_secs(180);

/// Pull the `<meta name="csrf-token">` value out of a page.
pub fn extract_csrf_token(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(r#"meta[name="csrf-token"]"#).ok()?;
    document
        .select(&selector)
        .filter_map(|element| element.value().attr("content"))
        .map(str::trim)
        .find(|token| !token.is_empty())
        .map(str::to_string)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| ScanError::Other(format!("Invalid header value {:?}: {}", value, e)))
}

pub fn listing_headers(site: &SiteConfig, token: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(reqwest::header::REFERER, header_value(&site.listing_url())?);
    headers.insert(HeaderName::from_static("x-csrf-token"), header_value(token)?);
    headers.insert(
        reqwest::header::ACCEPT,
        HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
    );
    headers.insert(
        reqwest::header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.5"),
    );
    headers.insert(
        HeaderName::from_static("x-requested-with"),
        HeaderValue::from_static("XMLHttpRequest"),
    );
    headers.insert(HeaderName::from_static("sec-gpc"), HeaderValue::from_static("1"));
    headers.insert(reqwest::header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        reqwest::header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache"),
    );
    Ok(headers)
}

pub fn graph_headers(site: &SiteConfig, token: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(reqwest::header::REFERER, header_value(&site.discover_url())?);
    headers.insert(HeaderName::from_static("x-csrf-token"), header_value(token)?);
    headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(
        reqwest::header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    headers.insert(
        reqwest::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(reqwest::header::ORIGIN, header_value(&site.origin())?);
    Ok(headers)
}

/// GET `url` through the executor and require a token in the body.
/// A page without a token is fatal, never retried.
async fn fetch_token(
    session: &mut Session,
    executor: &Executor,
    operation: &str,
    url: String,
) -> Result<String> {
    executor
        .run(operation, session, |client| {
            let url = url.clone();
            async move {
                let html = get_text(client, url.clone()).await?;
                extract_csrf_token(&html)
                    .ok_or_else(|| AttemptError::Fatal(ScanError::TokenNotFound(url)))
            }
        })
        .await
}

/// Homepage, then listing page, then token and XHR headers.
/// Fails with `DeadlineExceeded` if the whole thing outlives `deadline`.
pub async fn bootstrap_listing(
    session: &mut Session,
    executor: &Executor,
    deadline: Duration,
) -> Result<String> {
    let bootstrap = async {
        let homepage = session.site().homepage_url();
        session.human_delay().await;
        executor
            .run("homepage", session, |client| get_text(client, homepage.clone()))
            .await?;
        debug!("Homepage loaded, cookies primed");

        let listing = session.site().listing_url();
        session.human_delay().await;
        let token = fetch_token(session, executor, "listing page", listing).await?;

        let headers = listing_headers(session.site(), &token)?;
        session.install_headers(headers)?;
        session.set_csrf_token(token.clone());
        info!("Listing session ready (token {} chars)", token.len());
        Ok(token)
    };

    tokio::time::timeout(deadline, bootstrap)
        .await
        .map_err(|_| ScanError::DeadlineExceeded {
            operation: "listing bootstrap".to_string(),
            limit: deadline,
        })?
}

/// Discover page, then token and graph headers.
pub async fn bootstrap_graph(session: &mut Session, executor: &Executor) -> Result<String> {
    let discover = session.site().discover_url();
    session.human_delay().await;
    let token = fetch_token(session, executor, "graph bootstrap", discover).await?;

    let headers = graph_headers(session.site(), &token)?;
    session.install_headers(headers)?;
    session.set_csrf_token(token.clone());
    info!("Graph session ready");
    Ok(token)
}
