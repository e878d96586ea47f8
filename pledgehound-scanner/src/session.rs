use crate::error::{Result, ScanError};
use crate::identity::{Identity, ProxyKind, Rotation, current_egress_ip};
use rand::Rng;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Proxy};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://www.kickstarter.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Browser {
    Chrome,
    Firefox,
    Edge,
    Safari,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Mac,
    Linux,
    Android,
    Ios,
}

impl FromStr for Browser {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "chrome" => Ok(Browser::Chrome),
            "firefox" => Ok(Browser::Firefox),
            "edge" => Ok(Browser::Edge),
            "safari" => Ok(Browser::Safari),
            other => Err(ScanError::Other(format!("Unknown browser: {}", other))),
        }
    }
}

impl FromStr for Platform {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "windows" => Ok(Platform::Windows),
            "mac" | "macos" | "darwin" => Ok(Platform::Mac),
            "linux" => Ok(Platform::Linux),
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            other => Err(ScanError::Other(format!("Unknown platform: {}", other))),
        }
    }
}

/// Which browser the session pretends to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrowserProfile {
    pub browser: Browser,
    pub platform: Platform,
    pub mobile: bool,
}

impl Default for BrowserProfile {
    fn default() -> Self {
        Self {
            browser: Browser::Chrome,
            platform: Platform::Windows,
            mobile: false,
        }
    }
}

impl BrowserProfile {
    pub fn user_agent(&self) -> &'static str {
        match (self.browser, self.platform, self.mobile) {
            (Browser::Chrome, Platform::Android, _) | (Browser::Chrome, _, true) => {
                "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Mobile Safari/537.36"
            }
            (Browser::Safari, _, true) | (_, Platform::Ios, _) => {
                "Mozilla/5.0 (iPhone; CPU iPhone OS 17_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.6 Mobile/15E148 Safari/604.1"
            }
            (Browser::Firefox, Platform::Android, _) | (Browser::Firefox, _, true) => {
                "Mozilla/5.0 (Android 14; Mobile; rv:133.0) Gecko/133.0 Firefox/133.0"
            }
            (Browser::Chrome, Platform::Mac, _) => {
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
            }
            (Browser::Chrome, Platform::Linux, _) => {
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
            }
            (Browser::Firefox, Platform::Mac, _) => {
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:133.0) Gecko/20100101 Firefox/133.0"
            }
            (Browser::Firefox, Platform::Linux, _) => {
                "Mozilla/5.0 (X11; Linux x86_64; rv:133.0) Gecko/20100101 Firefox/133.0"
            }
            (Browser::Firefox, _, _) => {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0"
            }
            (Browser::Safari, _, _) => {
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15"
            }
            (Browser::Edge, _, _) => {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0"
            }
            (Browser::Chrome, _, _) => {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
            }
        }
    }
}

/// Where the crowdfunding site lives. Tests point this at a mock server.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    base_url: Url,
}

impl SiteConfig {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ScanError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        Ok(Self { base_url })
    }

    fn join(&self, path: &str) -> String {
        self.base_url
            .join(path)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| format!("{}{}", self.origin(), path))
    }

    pub fn origin(&self) -> String {
        self.base_url.origin().ascii_serialization()
    }

    pub fn homepage_url(&self) -> String {
        self.join("/")
    }

    /// Human-facing listing page, also the Referer for API calls.
    pub fn listing_url(&self) -> String {
        self.join("/discover/advanced?state=upcoming&sort=newest")
    }

    /// Paginated JSON endpoint behind the listing page.
    pub fn listing_api_url(&self) -> String {
        self.join("/discover/advanced")
    }

    pub fn discover_url(&self) -> String {
        self.join("/discover")
    }

    pub fn graph_url(&self) -> String {
        self.join("/graph")
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base URL is valid"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub site: SiteConfig,
    pub profile: BrowserProfile,
    pub proxy_url: Option<String>,
    pub timeout: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            site: SiteConfig::default(),
            profile: BrowserProfile::default(),
            proxy_url: None,
            timeout: Duration::from_secs(30),
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(3000),
        }
    }
}

impl SessionConfig {
    pub fn with_site(mut self, site: SiteConfig) -> Self {
        self.site = site;
        self
    }

    pub fn with_profile(mut self, profile: BrowserProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_proxy(mut self, proxy_url: Option<String>) -> Self {
        self.proxy_url = proxy_url;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_delay(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay.max(min_delay);
        self
    }

    /// No jitter between bootstrap requests.
    pub fn without_delay(self) -> Self {
        self.with_delay(Duration::ZERO, Duration::ZERO)
    }
}

/// One browser-like HTTP client with its cookies, headers and identity.
///
/// The cookie jar outlives client rebuilds, so rotating the identity keeps
/// whatever the site has already set.
pub struct Session {
    client: Client,
    jar: Arc<Jar>,
    identity: Identity,
    config: SessionConfig,
    headers: HeaderMap,
    csrf_token: Option<String>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self> {
        let identity = Identity::new(config.proxy_url.clone());
        let jar = Arc::new(Jar::default());
        let headers = base_headers();
        let client = build_client(&config, &identity, &jar, &headers)?;

        debug!(
            "Session created (profile {:?}, proxy kind {:?})",
            config.profile,
            identity.kind()
        );

        Ok(Self {
            client,
            jar,
            identity,
            config,
            headers,
            csrf_token: None,
        })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn site(&self) -> &SiteConfig {
        &self.config.site
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn rotations(&self) -> usize {
        self.identity.rotations()
    }

    pub fn csrf_token(&self) -> Option<&str> {
        self.csrf_token.as_deref()
    }

    /// Layer `headers` over the browser defaults and rebuild the client.
    pub fn install_headers(&mut self, headers: HeaderMap) -> Result<()> {
        for (name, value) in headers.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
        self.client = build_client(&self.config, &self.identity, &self.jar, &self.headers)?;
        Ok(())
    }

    pub fn set_csrf_token(&mut self, token: String) {
        self.csrf_token = Some(token);
    }

    /// Move to a new outbound identity. The client is always rebuilt so the
    /// next request opens a fresh connection.
    pub async fn rotate_identity(&mut self) -> Result<()> {
        let rotation = self.identity.rotate();
        self.client = build_client(&self.config, &self.identity, &self.jar, &self.headers)?;

        if rotation == Rotation::Reconnect && self.identity.kind() == ProxyKind::AutoRotating {
            let ip = current_egress_ip(self.identity.proxy_url()).await;
            info!("Egress IP after rotation: {}", ip);
        }
        Ok(())
    }

    /// Sleep a random, human-looking interval.
    pub async fn human_delay(&self) {
        let min = self.config.min_delay.as_millis() as u64;
        let max = self.config.max_delay.as_millis() as u64;
        if max == 0 {
            return;
        }
        let millis = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            max
        };
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

fn base_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(
        reqwest::header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    headers.insert(
        HeaderName::from_static("upgrade-insecure-requests"),
        HeaderValue::from_static("1"),
    );
    headers
}

fn build_client(
    config: &SessionConfig,
    identity: &Identity,
    jar: &Arc<Jar>,
    headers: &HeaderMap,
) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(config.profile.user_agent())
        .default_headers(headers.clone())
        .cookie_provider(jar.clone())
        .timeout(config.timeout)
        .connect_timeout(config.timeout / 2)
        .gzip(true)
        .brotli(true)
        .redirect(reqwest::redirect::Policy::limited(5));

    if let Some(proxy_url) = identity.proxy_url() {
        let proxy = Proxy::all(proxy_url).map_err(|e| ScanError::InvalidProxy(e.to_string()))?;
        builder = builder.proxy(proxy);
    }

    Ok(builder.build()?)
}
