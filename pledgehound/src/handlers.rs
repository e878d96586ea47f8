use anyhow::{Context, bail};
use clap::ArgMatches;
use colored::Colorize;
use pledgehound_core::collect::{CollectOptions, Collector, ExitReason, KnownCheck};
use pledgehound_core::contacts::{
    ContactRunOptions, ContactRunStats, FirecrawlProvider, run_contacts,
};
use pledgehound_core::data::Database;
use pledgehound_core::enrich::{EnrichOptions, EnrichStats, enrich_projects};
use pledgehound_core::error::ContactError;
use pledgehound_core::export::{
    ExportFormat, build_creator_export, generate_csv_export, generate_json_export, save_export,
};
use pledgehound_core::model::Project;
use pledgehound_core::sync::{SYNC_CHUNK_SIZE, SyncReport, SyncStats, sync_all};
use pledgehound_scanner::session::{Browser, Platform};
use pledgehound_scanner::{BrowserProfile, RetryPolicy, Session, SessionConfig, SiteConfig};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const SECONDS_PER_DAY: i64 = 86_400;

/// Crates whose request-level chatter is only interesting when debugging.
const NOISY_TARGETS: [&str; 5] = ["hyper", "hyper_util", "reqwest", "rustls", "h2"];

// Helper functions

pub fn print_banner() {
    print_divider();
    println!(
        "{} {}",
        "  PLEDGEHOUND".bright_white().bold(),
        env!("CARGO_PKG_VERSION").bright_black()
    );
    println!("{}", "  upcoming projects → creators → contacts".bright_black());
    print_divider();
}

fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

fn print_section(title: &str) {
    println!();
    println!("{} {}", "▶".bright_blue().bold(), title.bright_white().bold());
}

/// Default log directive: the requested level for our crates, with the
/// HTTP stack held at warn unless debugging.
pub fn log_directive(debug: bool) -> String {
    if debug {
        return "debug".to_string();
    }
    let mut directive = "info".to_string();
    for target in NOISY_TARGETS {
        directive.push_str(&format!(",{}=warn", target));
    }
    directive
}

/// Install the global subscriber. `RUST_LOG` overrides the default directive.
pub fn init_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_directive(debug)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(debug)
        .try_init();
}

/// Expand `~` in a user-supplied path.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

/// The proxy to use. The `PROXY_URL` environment variable wins over the
/// command line, and `--disable-proxy` wins over both. Blank values count
/// as unset.
pub fn resolve_proxy_url(
    disabled: bool,
    env_value: Option<String>,
    cli_value: Option<&str>,
) -> Option<String> {
    if disabled {
        return None;
    }
    env_value
        .filter(|value| !value.trim().is_empty())
        .or_else(|| cli_value.map(str::to_string))
        .filter(|value| !value.trim().is_empty())
}

/// Keep projects created in the last `days` days, relative to `now`
/// (unix seconds). Projects with no creation time are dropped.
pub fn filter_recent(projects: Vec<Project>, days: u64, now: i64) -> Vec<Project> {
    let cutoff = now - (days as i64).saturating_mul(SECONDS_PER_DAY);
    projects
        .into_iter()
        .filter(|project| project.created_at().unwrap_or(0) >= cutoff)
        .collect()
}

/// Seconds from the command line as a duration; negative or non-finite
/// values become zero.
pub fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

pub fn load_projects(path: &Path) -> anyhow::Result<Vec<Project>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let projects = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(projects)
}

pub fn save_projects(projects: &[Project], path: &Path) -> anyhow::Result<()> {
    let content = serde_json::to_string_pretty(projects)?;
    save_export(&content, path).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

// Configuration

/// Settings shared by `run` and `contacts`.
#[derive(Debug, Clone)]
pub struct ContactsConfig {
    pub api_url: String,
    pub options: ContactRunOptions,
}

impl ContactsConfig {
    pub fn from_matches(args: &ArgMatches, show_progress: bool) -> Self {
        let defaults = ContactRunOptions::default();
        let options = ContactRunOptions {
            workers: args
                .get_one::<usize>("contacts-workers")
                .copied()
                .unwrap_or(defaults.workers),
            batch_size: args
                .get_one::<usize>("contacts-batch-size")
                .copied()
                .unwrap_or(defaults.batch_size),
            limit: args.get_one::<usize>("limit-contacts").copied(),
            dry_run: args.get_flag("dry-run-contacts"),
            blocked_domains_cache: args.get_one::<PathBuf>("blocked-domains-cache").cloned(),
            show_progress,
            ..defaults
        };

        Self {
            api_url: args
                .get_one::<String>("firecrawl-api-url")
                .cloned()
                .unwrap_or_else(|| {
                    pledgehound_core::contacts::DEFAULT_FIRECRAWL_API_URL.to_string()
                }),
            options,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub path: PathBuf,
    pub format: ExportFormat,
}

/// Everything `run` needs, parsed once up front.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub session: SessionConfig,
    pub collect: CollectOptions,
    pub enrich: EnrichOptions,
    pub enrich_timeout: Duration,
    pub contacts: ContactsConfig,
    pub stop_on_existing: bool,
    pub days_filter: Option<u64>,
    pub debug_local: bool,
    pub projects_path: PathBuf,
    pub enriched_path: PathBuf,
    pub force_fetch: bool,
    pub skip_fetch: bool,
    pub skip_enrich: bool,
    pub skip_sync: bool,
    pub skip_contacts: bool,
    pub contacts_only: bool,
    pub export: Option<ExportConfig>,
}

impl PipelineConfig {
    /// Build the pipeline settings from `run`'s arguments. `proxy_env` is the
    /// value of `PROXY_URL`, if set.
    pub fn from_matches(
        args: &ArgMatches,
        proxy_env: Option<String>,
        show_progress: bool,
    ) -> anyhow::Result<Self> {
        let base_url = args
            .get_one::<String>("base-url")
            .map(String::as_str)
            .unwrap_or(pledgehound_scanner::session::DEFAULT_BASE_URL);
        let site = SiteConfig::new(base_url)?;

        let browser: Browser = args
            .get_one::<String>("browser")
            .map(String::as_str)
            .unwrap_or("chrome")
            .parse()?;
        let platform: Platform = args
            .get_one::<String>("platform")
            .map(String::as_str)
            .unwrap_or("windows")
            .parse()?;
        let profile = BrowserProfile {
            browser,
            platform,
            mobile: args.get_flag("mobile"),
        };

        let proxy = resolve_proxy_url(
            args.get_flag("disable-proxy"),
            proxy_env,
            args.get_one::<String>("proxy-url").map(String::as_str),
        );

        let fetch_timeout =
            Duration::from_secs(args.get_one::<u64>("fetch-timeout").copied().unwrap_or(20));
        let enrich_timeout =
            Duration::from_secs(args.get_one::<u64>("enrich-timeout").copied().unwrap_or(30));

        let session = SessionConfig::default()
            .with_site(site)
            .with_profile(profile)
            .with_proxy(proxy)
            .with_timeout(fetch_timeout);

        let collect = CollectOptions {
            max_pages: args.get_one::<usize>("max-pages").copied(),
            page_policy: RetryPolicy::new(
                args.get_one::<usize>("fetch-max-retries").copied().unwrap_or(10),
                3,
            )
            .with_retry_wait(seconds(
                args.get_one::<f64>("fetch-retry-wait").copied().unwrap_or(5.0),
            ))
            .with_call_timeout(fetch_timeout),
            show_progress,
            ..Default::default()
        };

        let enrich = EnrichOptions {
            batch_delay: seconds(args.get_one::<f64>("enrich-delay").copied().unwrap_or(0.0)),
            limit: args.get_one::<usize>("enrich-limit").copied(),
            batch_policy: RetryPolicy::new(
                args.get_one::<usize>("enrich-max-retries").copied().unwrap_or(5),
                3,
            )
            .with_retry_wait(seconds(
                args.get_one::<f64>("enrich-retry-wait").copied().unwrap_or(60.0),
            ))
            .with_call_timeout(enrich_timeout),
            show_progress,
            ..Default::default()
        };

        let export = if args.get_flag("export") && !args.get_flag("skip-export") {
            let format = args
                .get_one::<String>("export-format")
                .and_then(|f| ExportFormat::from_str(f))
                .unwrap_or(ExportFormat::Json);
            let path = args
                .get_one::<PathBuf>("export-path")
                .cloned()
                .unwrap_or_else(|| PathBuf::from("creators_export.json"));
            Some(ExportConfig { path, format })
        } else {
            None
        };

        Ok(Self {
            session,
            collect,
            enrich,
            enrich_timeout,
            contacts: ContactsConfig::from_matches(args, show_progress),
            stop_on_existing: !args.get_flag("no-stop-on-existing"),
            days_filter: args.get_one::<u64>("days-filter").copied(),
            debug_local: args.get_flag("debug-local"),
            projects_path: args
                .get_one::<PathBuf>("projects-path")
                .cloned()
                .unwrap_or_else(|| PathBuf::from("projects.json")),
            enriched_path: args
                .get_one::<PathBuf>("enriched-path")
                .cloned()
                .unwrap_or_else(|| PathBuf::from("projects_enriched.json")),
            force_fetch: args.get_flag("force-fetch"),
            skip_fetch: args.get_flag("skip-fetch"),
            skip_enrich: args.get_flag("skip-enrich"),
            skip_sync: args.get_flag("skip-sync"),
            skip_contacts: args.get_flag("skip-contacts"),
            contacts_only: args.get_flag("contacts-only"),
            export,
        })
    }
}

/// What one `run` did, stage by stage. `None` means the stage was skipped.
#[derive(Debug, Default)]
pub struct PipelineSummary {
    pub collected: usize,
    pub pages_fetched: Option<usize>,
    pub exit_reason: Option<ExitReason>,
    pub after_filter: Option<usize>,
    pub enrich: Option<EnrichStats>,
    pub sync: Option<SyncReport>,
    pub contacts: Option<ContactRunStats>,
    pub export_path: Option<PathBuf>,
}

/// Opens the store, creating it if needed.
fn open_database(args: &ArgMatches) -> anyhow::Result<Arc<Database>> {
    let path = database_path(args);
    let db = Database::new(&path)
        .with_context(|| format!("Failed to open database at {}", path.display()))?;
    Ok(Arc::new(db))
}

pub fn database_path(args: &ArgMatches) -> PathBuf {
    let raw = args
        .get_one::<String>("database")
        .map(String::as_str)
        .unwrap_or(crate::commands::DEFAULT_DATABASE_PATH);
    expand_path(raw)
}

/// Skip the rest of the listing once a page contains a project we already
/// store. Lookup failures are logged and treated as "nothing known".
fn known_in_database(db: Arc<Database>) -> KnownCheck {
    Arc::new(move |projects: &[Project]| {
        let ids: Vec<u64> = projects.iter().map(|p| p.id).collect();
        match db.existing_project_ids(&ids) {
            Ok(known) => known,
            Err(e) => {
                tracing::warn!("Could not check for existing projects: {}", e);
                HashSet::new()
            }
        }
    })
}

// Pipeline stages

async fn fetch_stage(
    config: &PipelineConfig,
    db: &Arc<Database>,
    summary: &mut PipelineSummary,
) -> anyhow::Result<Vec<Project>> {
    if config.skip_fetch {
        tracing::info!("Skipping fetch");
        return Ok(Vec::new());
    }

    if config.debug_local && config.projects_path.exists() && !config.force_fetch {
        println!(
            "{} Loading projects from {}",
            "→".blue(),
            config.projects_path.display().to_string().bright_white()
        );
        return load_projects(&config.projects_path);
    }

    let mut collector = Collector::new(config.collect.clone());
    if config.stop_on_existing {
        collector = collector.with_known_check(known_in_database(Arc::clone(db)));
    }

    let mut session = Session::new(config.session.clone())?;
    let collection = collector.collect(&mut session).await?;

    println!(
        "{} Collected {} projects from {} pages ({})",
        "✓".green().bold(),
        collection.projects.len().to_string().bright_white(),
        collection.pages_fetched,
        collection.exit_reason.as_str().bright_black()
    );
    summary.pages_fetched = Some(collection.pages_fetched);
    summary.exit_reason = Some(collection.exit_reason);

    if config.debug_local {
        save_projects(&collection.projects, &config.projects_path)?;
    }
    Ok(collection.projects)
}

async fn enrich_stage(
    config: &PipelineConfig,
    projects: Vec<Project>,
    summary: &mut PipelineSummary,
) -> anyhow::Result<Vec<Project>> {
    let session_config = config.session.clone().with_timeout(config.enrich_timeout);
    let mut session = Session::new(session_config)?;
    let enrichment = enrich_projects(projects, &mut session, &config.enrich).await?;

    let stats = &enrichment.stats;
    println!(
        "{} Enriched {} projects ({} failed, {}/{} batches failed)",
        "✓".green().bold(),
        stats.enriched.to_string().bright_white(),
        stats.failed,
        stats.failed_batches,
        stats.batches
    );
    summary.enrich = Some(stats.clone());

    if config.debug_local {
        save_projects(&enrichment.projects, &config.enriched_path)?;
    }
    Ok(enrichment.projects)
}

/// Run contact extraction against the store with the real provider.
pub async fn contact_stage(
    db: Arc<Database>,
    config: &ContactsConfig,
) -> Result<ContactRunStats, ContactError> {
    let provider = FirecrawlProvider::new(&config.api_url)?;
    run_contacts(db, Arc::new(provider), &config.options).await
}

fn export_stage(projects: &[Project], export: &ExportConfig, base_url: &str) -> anyhow::Result<()> {
    let creators = build_creator_export(projects, base_url);
    let content = match export.format {
        ExportFormat::Json => generate_json_export(&creators)?,
        ExportFormat::Csv => generate_csv_export(&creators)?,
    };
    save_export(&content, &export.path)
        .with_context(|| format!("Failed to write {}", export.path.display()))?;
    println!(
        "{} Exported {} creators to {}",
        "✓".green().bold(),
        creators.len().to_string().bright_white(),
        export.path.display().to_string().bright_white()
    );
    Ok(())
}

/// Collect, filter, enrich, save, extract contacts and export. Collection
/// and enrichment failures end the run; the later stages log and carry on.
pub async fn run_pipeline(
    config: &PipelineConfig,
    db: Arc<Database>,
) -> anyhow::Result<PipelineSummary> {
    let mut summary = PipelineSummary::default();

    print_section("Fetching projects");
    let mut projects = fetch_stage(config, &db, &mut summary).await?;
    summary.collected = projects.len();

    if let Some(days) = config.days_filter {
        projects = filter_recent(projects, days, chrono::Utc::now().timestamp());
        summary.after_filter = Some(projects.len());
        println!(
            "{} {} projects created in the last {} days",
            "→".blue(),
            projects.len().to_string().bright_white(),
            days
        );
        if projects.is_empty() {
            println!("{} No projects left after the days filter", "⚠".yellow().bold());
            return Ok(summary);
        }
    }

    if !config.skip_enrich && !projects.is_empty() {
        print_section("Enriching creators");
        projects = enrich_stage(config, projects, &mut summary).await?;
    }

    if !config.skip_sync && !projects.is_empty() {
        print_section("Saving to database");
        let report = sync_all(db.as_ref(), &projects, SYNC_CHUNK_SIZE);
        print_sync_report(&report);
        summary.sync = Some(report);
    }

    if !config.skip_contacts {
        print_section("Extracting contacts");
        match contact_stage(Arc::clone(&db), &config.contacts).await {
            Ok(stats) => {
                print_contact_stats(&stats);
                summary.contacts = Some(stats);
            }
            Err(e) => {
                tracing::error!("Contact extraction failed: {}", e);
                eprintln!("{} Contact extraction failed: {}", "✗".red().bold(), e);
            }
        }
    }

    if let Some(export) = &config.export {
        print_section("Exporting creators");
        match export_stage(&projects, export, &config.session.site.origin()) {
            Ok(()) => summary.export_path = Some(export.path.clone()),
            Err(e) => tracing::warn!("Export failed: {:#}", e),
        }
    }

    Ok(summary)
}

// Output

fn print_sync_line(label: &str, stats: &SyncStats) {
    println!(
        "  {} {:<10} {} new, {} updated, {} unchanged{}",
        "•".bright_blue(),
        label,
        stats.inserted.to_string().green(),
        stats.updated.to_string().yellow(),
        stats.unchanged.to_string().bright_black(),
        if stats.errors > 0 {
            format!(", {} errors", stats.errors).red().to_string()
        } else {
            String::new()
        }
    );
}

fn print_sync_report(report: &SyncReport) {
    print_sync_line("creators", &report.creators);
    print_sync_line("projects", &report.projects);
    print_sync_line("outreach", &report.outreach);
}

fn print_contact_stats(stats: &ContactRunStats) {
    if stats.selected == 0 {
        println!("{} No creators need contact extraction", "✓".green().bold());
        return;
    }
    println!(
        "{} Processed {} of {} creators",
        "✓".green().bold(),
        stats.processed.to_string().bright_white(),
        stats.selected
    );
    println!(
        "  {} {} completed, {} not found, {} blocked, {} errors",
        "•".bright_blue(),
        stats.completed.to_string().green(),
        stats.not_found,
        stats.blocked.to_string().yellow(),
        stats.errors.to_string().red()
    );
    println!(
        "  {} {} saved, {} failed to save, {} blocked domains known",
        "•".bright_blue(),
        stats.persisted,
        stats.persist_failures,
        stats.blocked_domains
    );
}

fn print_summary(summary: &PipelineSummary, elapsed: Duration) {
    println!();
    print_divider();
    println!("{}", "  RUN SUMMARY".bright_white().bold());
    print_divider();
    println!("  Collected:      {}", summary.collected.to_string().bright_white());
    if let Some(pages) = summary.pages_fetched {
        println!("  Pages:          {}", pages);
    }
    if let Some(reason) = summary.exit_reason {
        println!("  Stopped:        {}", reason.as_str());
    }
    if let Some(kept) = summary.after_filter {
        println!("  After filter:   {}", kept);
    }
    if let Some(enrich) = &summary.enrich {
        println!("  Enriched:       {} ({} failed)", enrich.enriched, enrich.failed);
    }
    if let Some(sync) = &summary.sync {
        println!("  Sync errors:    {}", sync.total_errors());
    }
    if let Some(contacts) = &summary.contacts {
        println!("  Contacts found: {}", contacts.completed.to_string().green());
    }
    if let Some(path) = &summary.export_path {
        println!("  Export:         {}", path.display());
    }
    println!("  Elapsed:        {:.1}s", elapsed.as_secs_f64());
    print_divider();
}

// Handlers

pub fn handle_init(args: &ArgMatches) -> anyhow::Result<()> {
    let path = database_path(args);
    let force = args.get_flag("force");

    println!("{} Target: {}", "→".blue(), path.display().to_string().bright_white());

    if Database::exists(&path) {
        if !force {
            bail!("A database already exists at {} (use --force to replace it)", path.display());
        }
        Database::drop(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
        println!("{} Removed existing database", "✓".green().bold());
    }

    Database::new(&path)
        .with_context(|| format!("Failed to create database at {}", path.display()))?;
    println!("{} Database ready", "✓".green().bold());
    Ok(())
}

pub async fn handle_run(args: &ArgMatches, quiet: bool) -> anyhow::Result<()> {
    let config = PipelineConfig::from_matches(args, std::env::var("PROXY_URL").ok(), !quiet)?;
    let db = open_database(args)?;

    if config.contacts_only {
        return handle_contacts_with(db, &config.contacts).await;
    }

    if let Some(proxy) = &config.session.proxy_url {
        tracing::info!("Using proxy ({:?})", pledgehound_scanner::classify(proxy));
    }

    let started = std::time::Instant::now();
    let summary = run_pipeline(&config, db).await?;
    print_summary(&summary, started.elapsed());
    Ok(())
}

pub async fn handle_contacts(args: &ArgMatches, quiet: bool) -> anyhow::Result<()> {
    let config = ContactsConfig::from_matches(args, !quiet);
    let db = open_database(args)?;
    handle_contacts_with(db, &config).await
}

async fn handle_contacts_with(db: Arc<Database>, config: &ContactsConfig) -> anyhow::Result<()> {
    print_section("Extracting contacts");
    let stats = contact_stage(db, config).await?;
    print_contact_stats(&stats);
    Ok(())
}

pub fn handle_accounts_add(args: &ArgMatches) -> anyhow::Result<()> {
    let db = open_database(args)?;
    let api_key = args
        .get_one::<String>("api-key")
        .context("--api-key is required")?;
    let email = args.get_one::<String>("email").map(String::as_str);

    let id = db.add_account(email, api_key)?;
    println!("{} Saved account #{}", "✓".green().bold(), id.to_string().bright_white());
    Ok(())
}

fn mask_key(api_key: &str) -> String {
    let visible: String = api_key
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("…{}", visible)
}

pub fn handle_accounts_list(args: &ArgMatches) -> anyhow::Result<()> {
    let db = open_database(args)?;
    let accounts = db.list_accounts()?;

    if accounts.is_empty() {
        println!(
            "{} No accounts. Add one with `pledgehound accounts add -k <KEY>`",
            "⚠".yellow().bold()
        );
        return Ok(());
    }

    for account in &accounts {
        let status = if account.is_active() {
            account.status.as_str().green()
        } else {
            account.status.as_str().red()
        };
        println!(
            "  {:>4}  {:<30} {:<10} {} {}",
            account.id,
            account.email.as_deref().unwrap_or("-"),
            mask_key(&account.api_key),
            status,
            account.exhausted_at.as_deref().unwrap_or("").bright_black()
        );
    }

    let active = accounts.iter().filter(|a| a.is_active()).count();
    println!();
    println!("{} {} of {} accounts active", "→".blue(), active, accounts.len());
    Ok(())
}

pub fn handle_accounts_reset(args: &ArgMatches) -> anyhow::Result<()> {
    let db = open_database(args)?;
    let reset = db.reset_accounts()?;
    println!("{} Reactivated {} accounts", "✓".green().bold(), reset.to_string().bright_white());
    Ok(())
}

pub fn handle_blocked(args: &ArgMatches) -> anyhow::Result<()> {
    let db = open_database(args)?;
    let domains = db.list_blocked_domains()?;

    if domains.is_empty() {
        println!("{} No blocked domains", "✓".green().bold());
        return Ok(());
    }
    for (domain, reason) in &domains {
        println!(
            "  {} {} {}",
            "•".yellow(),
            domain.bright_white(),
            reason.as_deref().unwrap_or("").bright_black()
        );
    }
    println!();
    println!("{} {} blocked domains", "→".blue(), domains.len());
    Ok(())
}
