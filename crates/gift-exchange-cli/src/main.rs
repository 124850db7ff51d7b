use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use gift_exchange_api::{
    compute_snapshot_id, error_kind, EventSnapshot, GenerationConfig, GiftExchangeApi,
    API_CONTRACT_VERSION,
};
use gift_exchange_core::{AssignmentError, DEFAULT_MAX_ATTEMPTS};
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "GX_LOG";

#[derive(Debug, Parser)]
#[command(name = "gx")]
#[command(about = "Gift exchange draws with safe regeneration")]
struct Cli {
    #[arg(long, global = true, default_value = "./gift_exchange.json")]
    snapshot: PathBuf,

    /// Seed for reproducible draws.
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Generate-and-validate attempts before giving up. Partial regeneration of
    /// larger groups often needs more than the default; 50 or more is reasonable
    /// past a dozen participants.
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Init(InitArgs),
    Draw,
    Analyze,
    /// Redraw every edge nobody has viewed yet. For larger groups pass a higher
    /// --max-attempts; each partial attempt can fail on a self-assignment.
    Regenerate(RegenerateArgs),
    Reveal(RevealArgs),
    Validate,
    Show,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long)]
    event: String,
    #[arg(long = "name", required = true)]
    names: Vec<String>,
    #[arg(long, default_value_t = false)]
    force: bool,
}

#[derive(Debug, Args)]
struct RegenerateArgs {
    #[arg(long)]
    expected_snapshot_id: Option<String>,
}

#[derive(Debug, Args)]
struct RevealArgs {
    /// Participant id or exact name.
    #[arg(long)]
    participant: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            object.insert(
                "api_contract_version".to_string(),
                Value::String(API_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "api_contract_version": API_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit_error(err: &anyhow::Error) {
    let violations = err
        .downcast_ref::<AssignmentError>()
        .map(AssignmentError::violations)
        .unwrap_or_default();
    let mut payload = serde_json::json!({
        "error": format!("{err:#}"),
        "error_kind": error_kind(err).unwrap_or("error"),
    });
    if !violations.is_empty() {
        payload["violations"] = serde_json::json!(violations);
    }
    if let Err(emit_err) = emit_json(payload) {
        eprintln!("gx: {err:#} (failed to render error: {emit_err})");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            emit_error(&err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let api = GiftExchangeApi::new(GenerationConfig {
        max_attempts: cli.max_attempts,
        seed: cli.seed,
    });
    let path = cli.snapshot.as_path();

    match cli.command {
        Command::Init(args) => run_init(&api, path, &args),
        Command::Draw => run_draw(&api, path),
        Command::Analyze => run_analyze(&api, path),
        Command::Regenerate(args) => run_regenerate(&api, path, &args),
        Command::Reveal(args) => run_reveal(&api, path, &args),
        Command::Validate => run_validate(&api, path),
        Command::Show => run_show(path),
    }
}

fn read_snapshot(path: &Path) -> Result<EventSnapshot> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot file {}", path.display()))?;
    let snapshot = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse snapshot file {}", path.display()))?;
    debug!(path = %path.display(), "loaded snapshot");
    Ok(snapshot)
}

fn write_snapshot(path: &Path, snapshot: &EventSnapshot) -> Result<()> {
    let body = serde_json::to_string_pretty(snapshot)?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, body)
        .with_context(|| format!("failed to write snapshot file {}", staging.display()))?;
    fs::rename(&staging, path)
        .with_context(|| format!("failed to replace snapshot file {}", path.display()))?;
    debug!(path = %path.display(), "wrote snapshot");
    Ok(())
}

fn run_init(api: &GiftExchangeApi, path: &Path, args: &InitArgs) -> Result<()> {
    if path.exists() && !args.force {
        bail!("snapshot file {} already exists; pass --force to replace it", path.display());
    }

    let snapshot = api.create_event(&args.event, &args.names)?;
    write_snapshot(path, &snapshot)?;
    emit_json(serde_json::json!({
        "event_name": snapshot.event_name,
        "participants": snapshot
            .participants
            .iter()
            .map(|participant| {
                serde_json::json!({ "id": participant.id, "name": participant.name })
            })
            .collect::<Vec<_>>(),
        "snapshot_id": compute_snapshot_id(&snapshot),
        "snapshot_path": path.display().to_string(),
    }))
}

fn run_draw(api: &GiftExchangeApi, path: &Path) -> Result<()> {
    let snapshot = read_snapshot(path)?;
    let result = api.draw(&snapshot)?;
    write_snapshot(path, &result.snapshot)?;
    emit_json(serde_json::json!({
        "attempts": result.attempts,
        "assignment_count": result.snapshot.assignments.len(),
        "snapshot_id": result.snapshot_id,
    }))
}

fn run_analyze(api: &GiftExchangeApi, path: &Path) -> Result<()> {
    let snapshot = read_snapshot(path)?;
    let report = api.analyze(&snapshot);
    emit_json(serde_json::to_value(report)?)
}

fn run_regenerate(api: &GiftExchangeApi, path: &Path, args: &RegenerateArgs) -> Result<()> {
    let snapshot = read_snapshot(path)?;
    let report = api.regenerate(&snapshot, args.expected_snapshot_id.as_deref())?;
    write_snapshot(path, &report.snapshot)?;
    emit_json(serde_json::json!({
        "mode": report.mode,
        "attempts": report.attempts,
        "notification_resets": report.notification_resets,
        "preserved_givers": report.preserved_givers,
        "previous_snapshot_id": report.previous_snapshot_id,
        "snapshot_id": report.snapshot_id,
    }))
}

fn run_reveal(api: &GiftExchangeApi, path: &Path, args: &RevealArgs) -> Result<()> {
    let snapshot = read_snapshot(path)?;
    let result = api.reveal(&snapshot, &args.participant)?;
    if result.first_view {
        write_snapshot(path, &result.snapshot)?;
    }
    emit_json(serde_json::json!({
        "giver": result.giver,
        "giver_name": result.giver_name,
        "receiver": result.receiver,
        "receiver_name": result.receiver_name,
        "first_view": result.first_view,
        "snapshot_id": result.snapshot_id,
    }))
}

fn run_validate(api: &GiftExchangeApi, path: &Path) -> Result<()> {
    let snapshot = read_snapshot(path)?;
    let outcome = api.validate(&snapshot);
    emit_json(serde_json::to_value(outcome)?)
}

fn run_show(path: &Path) -> Result<()> {
    let snapshot = read_snapshot(path)?;
    emit_json(serde_json::json!({
        "event_name": snapshot.event_name,
        "participants": snapshot.participants,
        "drawn": !snapshot.assignments.is_empty(),
        "viewed_count": snapshot.viewed_count(),
        "snapshot_id": compute_snapshot_id(&snapshot),
    }))
}
