// Creator export built from a run's enriched projects

use crate::model::{Project, Website};
use crate::sync::{SOCIAL_NETWORKS, categorize_website};
use chrono::DateTime;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(ExportFormat::Json),
            "csv" => Some(ExportFormat::Csv),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

/// One creator with every project of theirs seen in the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CreatorExport {
    pub creator_id: u64,
    pub creator_name: String,
    pub profile_url: String,
    pub project_names: Vec<String>,
    pub project_urls: Vec<String>,
    pub project_created: Vec<String>,
    /// Network name to the creator's links on it.
    pub social: BTreeMap<String, Vec<String>>,
    pub other_websites: Vec<String>,
}

fn format_created(seconds: Option<i64>) -> String {
    seconds
        .filter(|&s| s != 0)
        .and_then(|s| DateTime::from_timestamp(s, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default()
}

fn nested_str<'a>(object: Option<&'a Map<String, Value>>, path: &[&str]) -> Option<&'a str> {
    let (last, parents) = path.split_last()?;
    let mut current = object?;
    for key in parents {
        current = current.get(*key)?.as_object()?;
    }
    current.get(*last)?.as_str()
}

fn profile_url(project: &Project, base_url: &str) -> String {
    let creator = project.creator();
    if let Some(url) = nested_str(creator, &["urls", "web", "user"]) {
        return url.to_string();
    }
    let slug = creator
        .and_then(|c| c.get("slug"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| project.creator_id().map(|id| id.to_string()))
        .unwrap_or_default();
    format!("{}/profile/{}", base_url, slug)
}

fn project_url(project: &Project, base_url: &str) -> String {
    if let Some(url) = nested_str(Some(&project.fields), &["urls", "web", "project"]) {
        return url.to_string();
    }
    format!("{}/projects/{}", base_url, project.slug.as_deref().unwrap_or_default())
}

fn add_websites(export: &mut CreatorExport, websites: &[Website]) {
    for website in websites {
        let url = website.url.trim();
        if url.is_empty() {
            continue;
        }
        let bucket = match categorize_website(&website.domain) {
            Some(network) => export.social.entry(network.to_string()).or_default(),
            None => &mut export.other_websites,
        };
        if !bucket.iter().any(|existing| existing == url) {
            bucket.push(url.to_string());
        }
    }
}

/// Group projects by creator, sorted by creator name.
pub fn build_creator_export(projects: &[Project], base_url: &str) -> Vec<CreatorExport> {
    let base_url = base_url.trim_end_matches('/');
    let mut by_creator: BTreeMap<u64, CreatorExport> = BTreeMap::new();

    for project in projects {
        let Some(creator_id) = project.creator_id() else {
            continue;
        };
        let export = by_creator.entry(creator_id).or_insert_with(|| CreatorExport {
            creator_id,
            creator_name: project
                .creator()
                .and_then(|c| c.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            profile_url: profile_url(project, base_url),
            ..Default::default()
        });
        export.project_names.push(project.name().unwrap_or_default().to_string());
        export.project_urls.push(project_url(project, base_url));
        export.project_created.push(format_created(project.created_at()));
        add_websites(export, &project.websites());
    }

    let mut exports: Vec<CreatorExport> = by_creator.into_values().collect();
    exports.sort_by(|a, b| {
        a.creator_name
            .to_lowercase()
            .cmp(&b.creator_name.to_lowercase())
            .then(a.creator_id.cmp(&b.creator_id))
    });
    exports
}

pub fn generate_json_export(exports: &[CreatorExport]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(exports)
}

/// One row per creator. Multi-valued cells are newline separated.
pub fn generate_csv_export(exports: &[CreatorExport]) -> Result<String, csv::Error> {
    let mut wtr = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    let mut header = vec![
        "creator_id",
        "creator_name",
        "profile_url",
        "projects",
        "project_urls",
        "created",
    ];
    header.extend(SOCIAL_NETWORKS.iter().map(|network| network.name));
    header.push("other_websites");
    wtr.write_record(&header)?;

    for export in exports {
        let mut cells = vec![
            export.creator_id.to_string(),
            export.creator_name.clone(),
            export.profile_url.clone(),
            export.project_names.join("\n"),
            export.project_urls.join("\n"),
            export.project_created.join("\n"),
        ];
        for network in SOCIAL_NETWORKS {
            cells.push(
                export
                    .social
                    .get(network.name)
                    .map(|links| links.join("\n"))
                    .unwrap_or_default(),
            );
        }
        cells.push(export.other_websites.join("\n"));
        wtr.write_record(&cells)?;
    }

    let bytes = wtr.into_inner().map_err(|e| csv::Error::from(e.into_error()))?;
    String::from_utf8(bytes)
        .map_err(|e| csv::Error::from(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

pub fn save_export(content: &str, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn project(id: u64, name: &str, creator: Value, created_at: i64) -> Project {
        Project::new(id, Some(&format!("p{}", id)))
            .with_field("name", json!(name))
            .with_field("creator", creator)
            .with_field("created_at", json!(created_at))
    }

    #[test]
    fn test_groups_projects_by_creator() {
        let creator = json!({
            "id": 7, "name": "Zed Games", "slug": "zed",
            "websites": [
                {"url": "https://instagram.com/zed", "domain": "instagram.com"},
                {"url": "https://zed.games", "domain": "zed.games"}
            ]
        });
        let projects = vec![
            project(1, "First", creator.clone(), 1_700_000_000),
            project(2, "Second", creator, 0),
            project(3, "Other", json!({"id": 8, "name": "able studio"}), 1_700_000_000),
        ];

        let exports = build_creator_export(&projects, "https://www.kickstarter.com/");
        assert_eq!(exports.len(), 2);
        assert_eq!(exports[0].creator_name, "able studio");
        assert_eq!(exports[0].profile_url, "https://www.kickstarter.com/profile/8");

        let zed = &exports[1];
        assert_eq!(zed.project_names, vec!["First", "Second"]);
        assert_eq!(zed.project_urls[0], "https://www.kickstarter.com/projects/p1");
        assert_eq!(zed.project_created, vec!["2023-11-14 22:13", ""]);
        assert_eq!(
            zed.social.get("instagram"),
            Some(&vec!["https://instagram.com/zed".to_string()])
        );
        assert_eq!(zed.other_websites, vec!["https://zed.games"]);
    }

    #[test]
    fn test_projects_without_creator_are_skipped() {
        let projects = vec![Project::new(1, Some("p1"))];
        assert!(build_creator_export(&projects, "https://x").is_empty());
    }

    #[test]
    fn test_csv_quotes_multi_valued_cells() {
        let export = CreatorExport {
            creator_id: 1,
            creator_name: "Acme, Inc".to_string(),
            project_names: vec!["A".to_string(), "B".to_string()],
            ..Default::default()
        };
        let csv = generate_csv_export(&[export]).unwrap();
        let mut lines = csv.splitn(2, '\n');
        assert!(lines.next().unwrap().ends_with("bluesky,other_websites"));
        assert!(lines.next().unwrap().starts_with("1,\"Acme, Inc\",,\"A\nB\","));
    }

    #[test]
    fn test_csv_quotes_carriage_returns_and_quotes() {
        let export = CreatorExport {
            creator_id: 1,
            creator_name: "Line\rBreak".to_string(),
            profile_url: "say \"hi\"".to_string(),
            ..Default::default()
        };
        let csv = generate_csv_export(&[export]).unwrap();
        let row = csv.splitn(2, '\n').nth(1).unwrap();
        assert!(row.starts_with("1,\"Line\rBreak\",\"say \"\"hi\"\"\","));

        let mut reader = csv::ReaderBuilder::new().from_reader(csv.as_bytes());
        let record = reader.records().next().unwrap().unwrap();
        assert_eq!(&record[1], "Line\rBreak");
        assert_eq!(&record[2], "say \"hi\"");
        assert_eq!(record.len(), 6 + SOCIAL_NETWORKS.len() + 1);
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!(ExportFormat::from_str("JSON"), Some(ExportFormat::Json));
        assert_eq!(ExportFormat::from_str("xlsx"), None);
    }
}
