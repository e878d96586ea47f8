//! Outbound network identity: proxy classification, rotation and egress IP lookup.

use rand::Rng;
use reqwest::{Client, Proxy};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Providers that hand out a fresh exit IP per connection.
const AUTO_ROTATING_PROVIDERS: &[&str] = &["webshare.io"];

/// Providers that pin an exit IP to a `-session-<token>` username suffix.
const SESSION_PROVIDERS: &[&str] = &[
    "oxylabs.io",
    "brightdata.com",
    "luminati.io",
    "smartproxy.com",
    "geonode.com",
];

const SESSION_MARKER: &str = "-session-";
const SESSION_TOKEN_LEN: usize = 10;
const SESSION_TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    /// No proxy, or one we know nothing about. Rotation means a new client.
    None,
    /// Every new connection exits from a new IP.
    AutoRotating,
    /// The exit IP follows a session token embedded in the username.
    SessionParameterized,
}

/// An IP echo endpoint and the JSON field holding the address.
/// `field: None` means the body is the bare address.
#[derive(Debug, Clone)]
pub struct IpEchoService {
    pub url: String,
    pub field: Option<&'static str>,
}

pub fn default_ip_echo_services() -> Vec<IpEchoService> {
    vec![
        IpEchoService {
            url: "https://api.ipify.org?format=json".to_string(),
            field: Some("ip"),
        },
        IpEchoService {
            url: "http://ip-api.com/json/?fields=query".to_string(),
            field: Some("query"),
        },
        IpEchoService {
            url: "https://ifconfig.me/ip".to_string(),
            field: None,
        },
    ]
}

/// Lowercased host part of a proxy URL, after the credentials. `None` if
/// there are no credentials.
fn credentialed_host(proxy_url: &str) -> Option<String> {
    let rest = proxy_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(proxy_url);
    let authority = rest.split('/').next().unwrap_or(rest);
    authority
        .rsplit_once('@')
        .map(|(_, host)| host.to_ascii_lowercase())
}

pub fn is_rotating_proxy(proxy_url: &str) -> bool {
    credentialed_host(proxy_url)
        .map(|host| AUTO_ROTATING_PROVIDERS.iter().any(|p| host.contains(p)))
        .unwrap_or(false)
}

pub fn supports_session_params(proxy_url: &str) -> bool {
    credentialed_host(proxy_url)
        .map(|host| SESSION_PROVIDERS.iter().any(|p| host.contains(p)))
        .unwrap_or(false)
}

pub fn classify(proxy_url: &str) -> ProxyKind {
    if is_rotating_proxy(proxy_url) {
        ProxyKind::AutoRotating
    } else if supports_session_params(proxy_url) {
        ProxyKind::SessionParameterized
    } else {
        ProxyKind::None
    }
}

pub fn session_token() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_TOKEN_LEN)
        .map(|_| SESSION_TOKEN_CHARSET[rng.gen_range(0..SESSION_TOKEN_CHARSET.len())] as char)
        .collect()
}

/// Pin a session-provider proxy URL to a fresh session token.
///
/// An existing `-session-...` suffix on the username is replaced. The password
/// and everything outside the credentials are kept as-is. URLs for other
/// providers are returned unchanged.
pub fn rotate_proxy_session(proxy_url: &str) -> String {
    if !supports_session_params(proxy_url) {
        return proxy_url.to_string();
    }

    let (scheme, rest) = match proxy_url.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, proxy_url),
    };
    let Some((auth, host_and_path)) = rest.rsplit_once('@') else {
        return proxy_url.to_string();
    };

    let (username, password) = match auth.split_once(':') {
        Some((user, pass)) => (user, Some(pass)),
        None => (auth, None),
    };
    let base_user = username.split(SESSION_MARKER).next().unwrap_or(username);

    let mut rotated = String::with_capacity(proxy_url.len() + SESSION_TOKEN_LEN + 9);
    if let Some(scheme) = scheme {
        rotated.push_str(scheme);
        rotated.push_str("://");
    }
    rotated.push_str(base_user);
    rotated.push_str(SESSION_MARKER);
    rotated.push_str(&session_token());
    if let Some(password) = password {
        rotated.push(':');
        rotated.push_str(password);
    }
    rotated.push('@');
    rotated.push_str(host_and_path);
    rotated
}

/// What the caller has to do after an identity rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    /// Same proxy URL; open a new connection to get a new exit IP.
    Reconnect,
    /// Proxy URL now carries a new session token.
    NewSession(String),
    /// No proxy support for rotation; rebuild the client from scratch.
    Rebuild,
}

/// The proxy configuration currently in use, plus how often it was rotated.
#[derive(Debug, Clone)]
pub struct Identity {
    proxy_url: Option<String>,
    kind: ProxyKind,
    rotations: usize,
}

impl Identity {
    pub fn new(proxy_url: Option<String>) -> Self {
        let kind = proxy_url.as_deref().map(classify).unwrap_or(ProxyKind::None);
        Self {
            proxy_url,
            kind,
            rotations: 0,
        }
    }

    pub fn direct() -> Self {
        Self::new(None)
    }

    pub fn proxy_url(&self) -> Option<&str> {
        self.proxy_url.as_deref()
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    pub fn rotations(&self) -> usize {
        self.rotations
    }

    pub fn rotate(&mut self) -> Rotation {
        self.rotations += 1;
        let rotation = match (self.kind, self.proxy_url.as_deref()) {
            (ProxyKind::AutoRotating, Some(_)) => Rotation::Reconnect,
            (ProxyKind::SessionParameterized, Some(url)) => {
                let rotated = rotate_proxy_session(url);
                self.proxy_url = Some(rotated.clone());
                Rotation::NewSession(rotated)
            }
            _ => Rotation::Rebuild,
        };
        info!(
            "Rotated identity (#{}, {:?}): {}",
            self.rotations,
            self.kind,
            redact(&rotation)
        );
        rotation
    }
}

fn redact(rotation: &Rotation) -> &'static str {
    match rotation {
        Rotation::Reconnect => "reconnect",
        Rotation::NewSession(_) => "new session token",
        Rotation::Rebuild => "rebuild client",
    }
}

/// Best-effort lookup of the public IP seen through `proxy_url`.
/// Never fails; returns `"unknown"` when every echo service is unreachable.
pub async fn current_egress_ip(proxy_url: Option<&str>) -> String {
    egress_ip_from(&default_ip_echo_services(), proxy_url).await
}

pub async fn egress_ip_from(services: &[IpEchoService], proxy_url: Option<&str>) -> String {
    let mut builder = Client::builder().timeout(Duration::from_secs(5));
    if let Some(proxy_url) = proxy_url {
        match Proxy::all(proxy_url) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(e) => {
                warn!("Cannot use proxy for egress IP lookup: {}", e);
                return "unknown".to_string();
            }
        }
    }
    let Ok(client) = builder.build() else {
        return "unknown".to_string();
    };

    for service in services {
        let response = match client.get(&service.url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!("{} answered {}", service.url, response.status());
                continue;
            }
            Err(e) => {
                debug!("{} unreachable: {}", service.url, e);
                continue;
            }
        };

        let ip = match service.field {
            Some(field) => response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| body.get(field).and_then(|v| v.as_str()).map(str::to_string)),
            None => response.text().await.ok().map(|body| body.trim().to_string()),
        };

        if let Some(ip) = ip.filter(|ip| !ip.is_empty()) {
            return ip;
        }
    }

    "unknown".to_string()
}
