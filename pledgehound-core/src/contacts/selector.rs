use crate::model::Website;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

/// A stored creator joined with its outreach row.
#[derive(Debug, Clone, Default)]
pub struct CreatorRow {
    pub id: u64,
    pub name: Option<String>,
    pub slug: Option<String>,
    pub websites: Vec<Website>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub outreach: Option<Map<String, Value>>,
    pub outreach_updated_at: Option<String>,
}

/// A creator queued for contact extraction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactTarget {
    pub id: u64,
    pub name: String,
    pub slug: Option<String>,
    pub websites: Vec<Website>,
    pub primary_site: Option<String>,
    pub computed_site_hash: Option<String>,
    pub contact_attempts: u64,
}

fn parse_with_default_scheme(raw: &str) -> Option<Url> {
    if raw.contains("://") {
        Url::parse(raw).ok()
    } else {
        Url::parse(&format!("https://{}", raw)).ok()
    }
}

/// First website with a host, as `scheme://host/path` without a trailing `/`.
pub fn normalize_primary_site(websites: &[Website]) -> Option<String> {
    websites.iter().find_map(|website| {
        let raw = website.url.trim();
        if raw.is_empty() {
            return None;
        }
        let parsed = parse_with_default_scheme(raw)?;
        let host = parsed.host_str().filter(|h| !h.is_empty())?;
        let authority = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let normalized = format!("{}://{}{}", parsed.scheme(), authority, parsed.path());
        Some(normalized.trim_end_matches('/').to_string())
    })
}

/// sha256 of the lowercase host without `www.`.
pub fn compute_site_hash(url: &str) -> Option<String> {
    let parsed = parse_with_default_scheme(url.trim())?;
    let host = parsed.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    if host.is_empty() {
        return None;
    }
    Some(hex::encode(Sha256::digest(host.as_bytes())))
}

fn parse_timestamp(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(&value.replace('Z', "+00:00")).ok()
}

fn is_after(value: Option<&str>, cutoff: &DateTime<FixedOffset>) -> bool {
    value.and_then(parse_timestamp).is_some_and(|ts| ts > *cutoff)
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

/// Whether a stored creator should be sent through extraction.
pub fn needs_contact(row: &CreatorRow, last_check: Option<&DateTime<FixedOffset>>) -> bool {
    let empty = Map::new();
    let outreach = row.outreach.as_ref().unwrap_or(&empty);

    if let Some(cutoff) = last_check {
        let changed = is_after(row.created_at.as_deref(), cutoff)
            || is_after(row.updated_at.as_deref(), cutoff)
            || is_after(row.outreach_updated_at.as_deref(), cutoff);
        if !changed {
            return false;
        }
    }

    let computed_hash =
        normalize_primary_site(&row.websites).and_then(|site| compute_site_hash(&site));
    let stored_hash = outreach.get("site_hash").and_then(Value::as_str);

    let missing_contact =
        !truthy(outreach.get("email")) && !truthy(outreach.get("has_contact_form"));
    let site_changed =
        matches!((computed_hash.as_deref(), stored_hash), (Some(a), Some(b)) if a != b);
    let never_checked = !truthy(outreach.get("last_contact_check_at"));
    let not_executed = matches!(
        outreach.get("contact_status").and_then(Value::as_str),
        None | Some("not_checked")
    );
    let no_attempts = outreach
        .get("contact_attempts")
        .and_then(Value::as_u64)
        .unwrap_or(0)
        == 0;

    (missing_contact || site_changed || never_checked) && not_executed && no_attempts
}

/// Rows that need contact extraction, in store order, capped at `limit`.
pub fn select_targets(
    rows: Vec<CreatorRow>,
    last_check: Option<&str>,
    limit: Option<usize>,
) -> Vec<ContactTarget> {
    let cutoff = last_check.and_then(parse_timestamp);
    let limit = limit.unwrap_or(usize::MAX);

    let targets: Vec<ContactTarget> = rows
        .into_iter()
        .filter(|row| needs_contact(row, cutoff.as_ref()))
        .take(limit)
        .map(|row| {
            let primary_site = normalize_primary_site(&row.websites);
            let computed_site_hash = primary_site.as_deref().and_then(compute_site_hash);
            let contact_attempts = row
                .outreach
                .as_ref()
                .and_then(|o| o.get("contact_attempts"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            ContactTarget {
                id: row.id,
                name: row.name.unwrap_or_default(),
                slug: row.slug,
                websites: row.websites,
                primary_site,
                computed_site_hash,
                contact_attempts,
            }
        })
        .collect();

    debug!("Contact queue: {} creators", targets.len());
    targets
}
