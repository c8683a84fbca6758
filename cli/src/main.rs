use anyhow::{Context, Result};
use catalog_search::{
    config::Config,
    facet::{FacetKind, FacetSpec},
    query::{parse_filter, Field},
    response::ResponseSource,
    session::Session,
    Mutation, SearchClient, SearchResponse,
};
use clap::{Args, Parser, Subcommand};
use serde_json::Value as Json;
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser)]
#[command(name = "catsearch", version)]
#[command(about = "Catalog search client", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, default_value = "catsearch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compose one query and send it (or print it with --dry-run)
    Query(QueryArgs),
    /// Inspect or reset the persisted session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct QueryArgs {
    /// Free-text search
    #[arg(long)]
    search: Option<String>,

    /// Collection handle to browse
    #[arg(long)]
    collection: Option<String>,

    /// Filter expression, e.g. `price:[10 TO 20]` or `vendor:"My Vendor"`
    #[arg(long = "filter")]
    filters: Vec<String>,

    /// Facet selection as `field=value`, or `field=min..max` for range facets
    #[arg(long = "facet")]
    facets: Vec<String>,

    /// Sort order id, e.g. `price-asc`
    #[arg(long)]
    sort: Option<String>,

    #[arg(long)]
    page: Option<u32>,

    /// Results per page
    #[arg(long)]
    rows: Option<u32>,

    /// Print the composed request instead of sending it
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(Subcommand)]
enum SessionAction {
    /// Print the persisted session
    Show,
    /// Forget the session id, sticky host and recent searches
    Clear,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Load and validate the configuration
    Check,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Query(args) => run_query(&config, args).await,
        Commands::Session { action } => run_session(&config, action),
        Commands::Config {
            action: ConfigAction::Check,
        } => {
            print_config_summary(&config);
            Ok(())
        }
    }
}

async fn run_query(config: &Config, args: QueryArgs) -> Result<()> {
    let mut filters = Vec::new();
    for filter in &args.filters {
        filters.extend(parse_filter(filter).with_context(|| format!("Invalid filter '{}'", filter))?);
    }
    let mutations = query_mutations(&args, config)?;
    debug!(mutations = mutations.len(), filters = filters.len(), "Query arguments parsed");

    let client = SearchClient::from_config(config)
        .context("Failed to set up search client")?
        .with_base_filters(filters);

    if args.dry_run {
        // Keep the block open so the batch only updates state.
        let _scope = client.guard().enter();
        client.batch(mutations).await?;
        let request = client.compose()?;
        println!("{}", serde_json::to_string_pretty(&request)?);
        return Ok(());
    }

    let response = match client.batch(mutations).await? {
        Some(response) => response,
        None => client
            .refresh()
            .await?
            .context("Search finished without a response")?,
    };
    print_response(&client, &response);
    Ok(())
}

fn query_mutations(args: &QueryArgs, config: &Config) -> Result<Vec<Mutation>> {
    let mut mutations = Vec::new();
    if let Some(text) = &args.search {
        mutations.push(Mutation::Search(Some(text.clone())));
    }
    if let Some(handle) = &args.collection {
        mutations.push(Mutation::Collection(Some(handle.clone())));
    }
    if let Some(id) = &args.sort {
        let order = config
            .sort_order(id)
            .with_context(|| format!("Unknown sort order '{}'", id))?;
        mutations.push(Mutation::SortBy(Some(order.clone())));
    }
    for selection in &args.facets {
        mutations.push(facet_mutation(selection, config)?);
    }
    if let Some(rows) = args.rows {
        mutations.push(Mutation::Paginate(rows));
    }
    // Last, so filter changes above don't reset it.
    if let Some(page) = args.page {
        mutations.push(Mutation::Page(page));
    }
    Ok(mutations)
}

fn facet_mutation(selection: &str, config: &Config) -> Result<Mutation> {
    let (name, value) = selection
        .split_once('=')
        .with_context(|| format!("Facet selection '{}' must look like field=value", selection))?;
    let field: Field = name
        .trim()
        .parse()
        .with_context(|| format!("Unknown facet field '{}'", name))?;
    let spec = config
        .facets
        .iter()
        .find(|spec| spec.field() == &field)
        .with_context(|| format!("No facet configured for '{}'", field))?;

    match spec {
        FacetSpec::Option { .. } => Ok(Mutation::ToggleFacetValue {
            field,
            value: value.to_string(),
        }),
        FacetSpec::Boundary { .. } => {
            let (min, max) = value
                .split_once("..")
                .with_context(|| format!("Range for '{}' must look like min..max", field))?;
            Ok(Mutation::SelectRange {
                field,
                min: min.trim().parse().context("Invalid range minimum")?,
                max: max.trim().parse().context("Invalid range maximum")?,
            })
        }
    }
}

fn print_response(client: &SearchClient, response: &SearchResponse) {
    match &response.source {
        ResponseSource::Service { host } => println!("Source: {}", host),
        ResponseSource::Fallback => println!("Source: storefront fallback (degraded mode)"),
    }
    println!(
        "{} {} returned, {} total",
        response.entities.len(),
        response.kind,
        response.total()
    );
    if let Some(spell_check) = &response.spell_check {
        println!("Did you mean: {}", spell_check.corrected);
    }
    for entity in &response.entities {
        let title = ["title", "handle", "id"]
            .iter()
            .find_map(|key| entity.get(key))
            .map(|value| match value {
                Json::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "(untitled)".to_string());
        println!("  - {}", title);
    }

    for facet in client.facets().facets() {
        match facet.kind() {
            FacetKind::Option => {
                if facet.values().next().is_none() {
                    continue;
                }
                println!("\n{}:", facet.label());
                for value in facet.values() {
                    let marker = if value.enabled { "[x]" } else { "[ ]" };
                    let count = value
                        .count
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("  {} {} ({})", marker, value.name, count);
                }
            }
            FacetKind::Boundary => {
                if let Some((min, max)) = facet.bounds() {
                    println!("\n{}: {} .. {}", facet.label(), min, max);
                }
            }
        }
    }

    for warning in &response.warnings {
        println!("[warn] {}", warning);
    }
}

fn run_session(config: &Config, action: SessionAction) -> Result<()> {
    let session = Session::open(&config.session).context("Failed to open session store")?;
    match action {
        SessionAction::Show => {
            println!("{}", serde_json::to_string_pretty(&session.snapshot())?);
        }
        SessionAction::Clear => {
            session.clear().context("Failed to clear session")?;
            println!("[ok] Session cleared");
        }
    }
    Ok(())
}

fn print_config_summary(config: &Config) {
    println!("[ok] Configuration is valid");
    println!("Hosts: {}", config.service.hosts.join(", "));
    println!(
        "Request: {} (GET up to {} chars{})",
        config.service.path,
        config.service.max_get_length,
        if config.service.force_post { ", POST forced" } else { "" }
    );
    match &config.session.store_path {
        Some(path) => println!("Session store: {}", path.display()),
        None => println!("Session store: in-memory"),
    }
    if config.degraded_mode.enabled {
        println!(
            "Degraded mode: {} for {}s",
            config.degraded_mode.storefront_url.as_deref().unwrap_or("-"),
            config.degraded_mode.window_seconds
        );
    }
    for spec in &config.facets {
        let kind = match spec {
            FacetSpec::Option { .. } => "option",
            FacetSpec::Boundary { .. } => "boundary",
        };
        println!("Facet: {} ({})", spec.field(), kind);
    }
    for order in &config.sort_orders {
        println!("Sort: {} ({})", order.id(), order.display_name);
    }
    for rule in &config.boost_rules {
        println!("Boost rule: {} ({} clauses)", rule.name, rule.clauses.len());
    }
}
