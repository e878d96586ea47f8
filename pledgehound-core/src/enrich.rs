use crate::model::{Project, websites_from_value};
use indicatif::{ProgressBar, ProgressStyle};
use pledgehound_scanner::error::Result as ScanResult;
use pledgehound_scanner::executor::read_json;
use pledgehound_scanner::{Executor, RetryPolicy, Session, bootstrap_graph};
use serde_json::{Value, json};
use std::ops::Range;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const GRAPH_BATCH_SIZE: usize = 100;

pub const CREATOR_QUERY: &str = "query CreatorInfo($slug: String!) {
  project(slug: $slug) {
    creator {
      websites {
        url
        domain
      }
    }
  }
}";

#[derive(Debug, Clone)]
pub struct EnrichOptions {
    pub batch_size: usize,
    /// Pause between batches, never after the last one.
    pub batch_delay: Duration,
    pub limit: Option<usize>,
    pub batch_policy: RetryPolicy,
    pub bootstrap_policy: RetryPolicy,
    pub show_progress: bool,
}

impl Default for EnrichOptions {
    fn default() -> Self {
        Self {
            batch_size: GRAPH_BATCH_SIZE,
            batch_delay: Duration::ZERO,
            limit: None,
            batch_policy: RetryPolicy::new(5, 3),
            bootstrap_policy: RetryPolicy::bootstrap(),
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichStats {
    pub enriched: usize,
    pub failed: usize,
    pub batches: usize,
    pub failed_batches: usize,
}

#[derive(Debug, Clone)]
pub struct Enrichment {
    pub projects: Vec<Project>,
    pub stats: EnrichStats,
}

/// Order-preserving index ranges of at most `batch_size` records.
pub fn partition(len: usize, batch_size: usize) -> Vec<Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..len)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(len))
        .collect()
}

/// Composite request body for a list of slugs.
pub fn build_batch_payload(slugs: &[&str]) -> Value {
    Value::Array(
        slugs
            .iter()
            .map(|slug| {
                json!({
                    "operationName": "CreatorInfo",
                    "variables": {"slug": slug},
                    "query": CREATOR_QUERY,
                })
            })
            .collect(),
    )
}

/// Apply positional graph responses to the records at `sent`.
/// Returns (enriched, failed) for the sent records.
pub fn merge_batch_response(
    batch: &mut [Project],
    sent: &[usize],
    responses: &[Value],
) -> (usize, usize) {
    let mut enriched = 0;
    let mut failed = 0;

    for (position, &index) in sent.iter().enumerate() {
        let project = &mut batch[index];
        let Some(entry) = responses.get(position) else {
            failed += 1;
            continue;
        };

        if let Some(errors) = entry.get("errors") {
            project.fields.insert("graph_errors".to_string(), errors.clone());
        }

        match entry.get("data") {
            Some(data) if !data.is_null() => {
                let websites = data
                    .pointer("/project/creator/websites")
                    .map(websites_from_value)
                    .unwrap_or_default();
                let websites = serde_json::to_value(websites).unwrap_or(Value::Array(Vec::new()));
                project.creator_mut().insert("websites".to_string(), websites);
                enriched += 1;
            }
            _ => failed += 1,
        }
    }

    (enriched, failed)
}

/// Add creator websites to each project through the batched graph endpoint.
///
/// Batches that exhaust their retries pass through untouched. Only a
/// missing graph token fails the call.
pub async fn enrich_projects(
    mut projects: Vec<Project>,
    session: &mut Session,
    options: &EnrichOptions,
) -> ScanResult<Enrichment> {
    let target = options.limit.map_or(projects.len(), |limit| limit.min(projects.len()));
    let mut stats = EnrichStats::default();

    if target == 0 {
        return Ok(Enrichment { projects, stats });
    }

    let bootstrap_executor = Executor::new(options.bootstrap_policy.clone());
    match bootstrap_graph(session, &bootstrap_executor).await {
        Ok(_) => {}
        Err(e) if e.is_exhausted() => {
            warn!("Graph bootstrap failed, skipping enrichment: {}", e);
            stats.failed = target;
            return Ok(Enrichment { projects, stats });
        }
        Err(e) => return Err(e),
    }

    let ranges = partition(target, options.batch_size);
    let total_batches = ranges.len();
    info!(
        "Enriching {} projects in {} batches of up to {}",
        target, total_batches, options.batch_size
    );

    let progress_bar = if options.show_progress {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    } else {
        None
    };

    let executor = Executor::new(options.batch_policy.clone());
    let graph_url = session.site().graph_url();

    for (batch_number, range) in ranges.into_iter().enumerate() {
        let batch_number = batch_number + 1;
        if batch_number > 1 && !options.batch_delay.is_zero() {
            tokio::time::sleep(options.batch_delay).await;
        }
        stats.batches += 1;

        let batch = &mut projects[range];
        let sent: Vec<usize> = (0..batch.len())
            .filter(|&i| batch[i].graph_slug().is_some())
            .collect();
        let skipped = batch.len() - sent.len();
        if skipped > 0 {
            debug!("Batch {}: {} projects without a slug", batch_number, skipped);
            stats.failed += skipped;
        }
        if sent.is_empty() {
            continue;
        }

        let slugs: Vec<&str> = sent.iter().filter_map(|&i| batch[i].graph_slug()).collect();
        let payload = build_batch_payload(&slugs);
        let operation = format!("graph batch {}/{}", batch_number, total_batches);

        let result: ScanResult<Vec<Value>> = executor
            .run(&operation, session, |client| {
                let request = client.post(&graph_url).json(&payload);
                async move { read_json(request.send().await?).await }
            })
            .await;

        match result {
            Ok(responses) => {
                let (enriched, failed) = merge_batch_response(batch, &sent, &responses);
                stats.enriched += enriched;
                stats.failed += failed;
            }
            Err(e) if e.is_exhausted() => {
                warn!(
                    "Batch {} failed, passing {} projects through: {}",
                    batch_number,
                    sent.len(),
                    e
                );
                stats.failed += sent.len();
                stats.failed_batches += 1;
            }
            Err(e) => return Err(e),
        }

        if let Some(pb) = &progress_bar {
            pb.set_message(format!(
                "Batch {}/{}: {} enriched, {} failed",
                batch_number, total_batches, stats.enriched, stats.failed
            ));
        }
        if batch_number % 10 == 0 || batch_number == total_batches {
            info!(
                "Enrichment progress: batch {}/{}, {} enriched, {} failed",
                batch_number, total_batches, stats.enriched, stats.failed
            );
        }
    }

    if let Some(pb) = progress_bar {
        pb.finish_and_clear();
    }

    Ok(Enrichment { projects, stats })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_covers_input_in_order() {
        for (len, size) in [(0, 100), (1, 100), (100, 100), (101, 100), (250, 7), (5, 0)] {
            let ranges = partition(len, size);
            let flattened: Vec<usize> = ranges.iter().flat_map(|r| r.clone()).collect();
            assert_eq!(flattened, (0..len).collect::<Vec<_>>(), "len={} size={}", len, size);
            assert!(ranges.iter().all(|r| r.len() <= size.max(1)));
        }
        assert_eq!(partition(250, 100).len(), 3);
    }

    #[test]
    fn test_batch_payload_shape() {
        let payload = build_batch_payload(&["a", "b"]);
        let entries = payload.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1]["operationName"], "CreatorInfo");
        assert_eq!(entries[1]["variables"]["slug"], "b");
        assert!(entries[0]["query"].as_str().unwrap().contains("websites"));
    }

    #[test]
    fn test_merge_sets_websites_and_errors() {
        let mut batch = vec![
            Project::new(1, Some("a")).with_field("creator", json!({"id": 10})),
            Project::new(2, None),
            Project::new(3, Some("c")),
        ];
        let responses = vec![
            json!({"data": {"project": {"creator": {"websites": [{"url": "https://a.com", "domain": "a.com"}]}}}}),
            json!({"errors": [{"message": "not found"}]}),
        ];

        let (enriched, failed) = merge_batch_response(&mut batch, &[0, 2], &responses);

        assert_eq!((enriched, failed), (1, 1));
        assert_eq!(batch[0].creator_id(), Some(10));
        assert_eq!(batch[0].websites()[0].domain, "a.com");
        assert!(batch[1].fields.is_empty());
        assert!(batch[2].graph_errors().is_some());
        assert!(batch[2].creator().is_none());
    }

    #[test]
    fn test_merge_null_project_gives_empty_websites() {
        let mut batch = vec![Project::new(1, Some("a"))];
        let (enriched, _) =
            merge_batch_response(&mut batch, &[0], &[json!({"data": {"project": null}})]);
        assert_eq!(enriched, 1);
        assert_eq!(batch[0].creator().unwrap()["websites"], json!([]));
    }

    #[test]
    fn test_short_response_counts_missing_as_failed() {
        let mut batch = vec![Project::new(1, Some("a")), Project::new(2, Some("b"))];
        let (enriched, failed) = merge_batch_response(&mut batch, &[0, 1], &[]);
        assert_eq!((enriched, failed), (0, 2));
    }
}
