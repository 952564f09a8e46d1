use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use trip_update_api::config::DEFAULT_HTTP_TIMEOUT_MS;
use trip_update_api::{BatchDocument, ResolverConfig, TripUpdateApi, TripUpdateConfig};
use trip_update_core::{service_date, ProvenanceId, TripKey, TripUpdateId};
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "tu")]
#[command(about = "Trip update reconciliation CLI")]
struct Cli {
    /// YAML or JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    db: Option<PathBuf>,

    /// Static schedule file used to resolve trips.
    #[arg(long, conflicts_with = "resolver_url")]
    schedule: Option<PathBuf>,

    /// Base URL of the schedule service used to resolve trips.
    #[arg(long)]
    resolver_url: Option<String>,

    #[arg(long, requires = "resolver_url")]
    resolver_token: Option<String>,

    #[arg(long, requires = "resolver_url")]
    resolver_timeout_ms: Option<u64>,

    /// Tracing filter directive; takes precedence over `RUST_LOG` and the config file.
    #[arg(long)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Reconcile one batch file into the canonical store.
    Ingest(IngestArgs),
    Trip {
        #[command(subcommand)]
        command: TripCommand,
    },
    Provenance {
        #[command(subcommand)]
        command: ProvenanceCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(long)]
    batch: PathBuf,
    /// Source name for batches that do not carry one.
    #[arg(long)]
    source: Option<String>,
}

#[derive(Debug, Subcommand)]
enum TripCommand {
    Show(TripShowArgs),
    List(TripListArgs),
}

#[derive(Debug, Args)]
struct TripShowArgs {
    #[arg(long, required_unless_present = "trip_update_id", requires = "service_date")]
    trip_id: Option<String>,
    #[arg(long, requires = "trip_id")]
    service_date: Option<String>,
    #[arg(long, conflicts_with_all = ["trip_id", "service_date"])]
    trip_update_id: Option<String>,
}

#[derive(Debug, Args)]
struct TripListArgs {
    #[arg(long)]
    service_date: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ProvenanceCommand {
    Show(ProvenanceShowArgs),
}

#[derive(Debug, Args)]
struct ProvenanceShowArgs {
    #[arg(long)]
    provenance_id: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(cli.log_filter.as_deref(), &config)?;

    let api = TripUpdateApi::new(config.database.clone());
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Ingest(args) => run_ingest(&args, &api, &config),
        Command::Trip { command } => run_trip(command, &api),
        Command::Provenance { command } => run_provenance(command, &api),
    }
}

fn load_config(cli: &Cli) -> Result<TripUpdateConfig> {
    let mut config = match &cli.config {
        Some(path) => TripUpdateConfig::load(path)?,
        None => TripUpdateConfig::default(),
    };

    if let Some(db) = &cli.db {
        config.database.clone_from(db);
    }
    if let Some(schedule) = &cli.schedule {
        config.resolver = Some(ResolverConfig::Static { schedule: schedule.clone() });
    }
    if let Some(base_url) = &cli.resolver_url {
        config.resolver = Some(ResolverConfig::Http {
            base_url: base_url.clone(),
            timeout_ms: cli.resolver_timeout_ms.unwrap_or(DEFAULT_HTTP_TIMEOUT_MS),
            token: cli.resolver_token.clone(),
        });
    }
    Ok(config)
}

fn init_tracing(flag: Option<&str>, config: &TripUpdateConfig) -> Result<()> {
    let filter = match flag {
        Some(directive) => EnvFilter::try_new(directive)
            .with_context(|| format!("invalid --log-filter directive: {directive}"))?,
        None => match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(config.log_filter()).with_context(|| {
                format!("invalid log_filter directive in config: {}", config.log_filter())
            })?,
        },
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
}

fn run_db(command: DbCommand, api: &TripUpdateApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )
        }
    }
}

fn run_ingest(args: &IngestArgs, api: &TripUpdateApi, config: &TripUpdateConfig) -> Result<()> {
    let default_source = args.source.as_deref().or(config.default_source.as_deref());
    let batch = BatchDocument::from_path(&args.batch)?.with_default_source(default_source);
    let resolver = config.build_resolver()?;

    let outcome = api.ingest(batch, resolver.as_ref())?;
    if !outcome.rejected.is_empty() {
        tracing::warn!(
            rejected = outcome.rejected.len(),
            provenance_id = %outcome.provenance.provenance_id,
            "some candidates were rejected"
        );
    }
    emit_json(serde_json::to_value(&outcome).context("failed to serialize reconcile outcome")?)
}

fn run_trip(command: TripCommand, api: &TripUpdateApi) -> Result<()> {
    match command {
        TripCommand::Show(args) => {
            let update = match (args.trip_update_id, args.trip_id, args.service_date) {
                (Some(raw), _, _) => api.trip_show_by_id(TripUpdateId(parse_ulid(&raw)?))?,
                (None, Some(trip_id), Some(raw_date)) => {
                    api.trip_show(&TripKey::new(trip_id, parse_service_date(&raw_date)?))?
                }
                _ => {
                    return Err(anyhow!(
                        "either --trip-update-id or both --trip-id and --service-date are required"
                    ));
                }
            };
            emit_json(serde_json::to_value(&update).context("failed to serialize trip update")?)
        }
        TripCommand::List(args) => {
            let service_date = args.service_date.as_deref().map(parse_service_date).transpose()?;
            let updates = api.trip_list(service_date)?;
            emit_json(serde_json::json!({
                "service_date": args.service_date,
                "trip_updates": updates
            }))
        }
    }
}

fn run_provenance(command: ProvenanceCommand, api: &TripUpdateApi) -> Result<()> {
    match command {
        ProvenanceCommand::Show(args) => {
            let record = api.provenance_show(ProvenanceId(parse_ulid(&args.provenance_id)?))?;
            emit_json(
                serde_json::to_value(&record).context("failed to serialize provenance record")?,
            )
        }
    }
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn parse_service_date(raw: &str) -> Result<time::Date> {
    service_date::parse(raw).with_context(|| format!("invalid service date (expected YYYY-MM-DD): {raw}"))
}
