use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use reverie_contracts::artifact::{DreamSubmission, MoonJournalEntry};
use reverie_contracts::error::WorkflowError;
use reverie_contracts::events::{new_request_id, EventLog};
use reverie_contracts::images::ImageRequest;
use reverie_contracts::ratelimit::RateLimiter;
use reverie_contracts::store::DocumentStore;
use reverie_engine::{Collaborators, DreamEngine, EngineConfig};

#[derive(Debug, Parser)]
#[command(name = "reverie", version, about = "Dream interpretation and image workflow CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Working directory for events, quota documents, and stored images.
    #[arg(long, global = true, default_value = "reverie-out")]
    out: PathBuf,
    /// Base URL under which stored images are publicly addressed.
    #[arg(long, global = true)]
    public_base: Option<String>,
    /// Use the offline dryrun collaborators instead of network services.
    #[arg(long, global = true)]
    dryrun: bool,
    /// Caller identity used for rate limiting.
    #[arg(long, global = true)]
    caller: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    Interpret(InterpretArgs),
    Image(ImageArgs),
    Tip(TipArgs),
    Patterns(PatternsArgs),
    MoonSync(MoonSyncArgs),
}

#[derive(Debug, Parser)]
struct InterpretArgs {
    #[arg(long)]
    text: String,
    #[arg(long)]
    mood: Option<String>,
    #[arg(long)]
    lang: Option<String>,
}

#[derive(Debug, Parser)]
struct ImageArgs {
    #[arg(long)]
    text: String,
    #[arg(long)]
    dream_id: String,
    #[arg(long)]
    user: String,
    #[arg(long)]
    trial: bool,
}

#[derive(Debug, Parser)]
struct TipArgs {
    #[arg(long)]
    lang: Option<String>,
}

#[derive(Debug, Parser)]
struct PatternsArgs {
    /// Repeatable; one dream text per flag.
    #[arg(long = "dream")]
    dreams: Vec<String>,
    #[arg(long)]
    lang: Option<String>,
}

#[derive(Debug, Parser)]
struct MoonSyncArgs {
    /// JSON file holding an array of journal entries.
    #[arg(long)]
    entries: PathBuf,
    #[arg(long)]
    lang: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(payload) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string())
            );
            ExitCode::SUCCESS
        }
        Err(failure) => {
            eprintln!("{}", render_error(&failure));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<Value, WorkflowError> {
    let engine = build_engine(&cli)?;
    let caller = cli.caller.as_deref();
    let payload = match cli.command {
        Command::Interpret(args) => {
            let submission = DreamSubmission {
                text: args.text,
                mood: args.mood,
                language_hint: args.lang,
            };
            to_value(engine.interpret(caller, &submission)?)?
        }
        Command::Image(args) => {
            let request = ImageRequest {
                dream_text: args.text,
                dream_id: args.dream_id,
                user_id: args.user,
                is_trial: args.trial,
            };
            to_value(engine.generate_dream_image(&request)?)?
        }
        Command::Tip(args) => to_value(engine.daily_tip(caller, args.lang.as_deref())?)?,
        Command::Patterns(args) => {
            to_value(engine.weekly_patterns(caller, &args.dreams, args.lang.as_deref())?)?
        }
        Command::MoonSync(args) => {
            let entries = load_entries(&args.entries)?;
            to_value(engine.moon_sync(caller, &entries, args.lang.as_deref())?)?
        }
    };
    Ok(payload)
}

fn build_engine(cli: &Cli) -> Result<DreamEngine> {
    let documents = DocumentStore::new(cli.out.join("documents.json"));
    let config = EngineConfig::default();
    let storage_root = cli.out.join("storage");
    let public_base = cli
        .public_base
        .clone()
        .unwrap_or_else(|| format!("file://{}", storage_root.display()));

    let collaborators = if cli.dryrun {
        Collaborators::dryrun(&storage_root, &public_base, documents.clone())
    } else {
        Collaborators::from_env(&config, &storage_root, &public_base, documents.clone())?
    };
    let limiter = RateLimiter::with_default_rules(documents);
    let events = EventLog::new(cli.out.join("events.jsonl"), new_request_id());
    DreamEngine::new(config, collaborators, limiter, events)
}

fn load_entries(path: &Path) -> Result<Vec<MoonJournalEntry>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid entries JSON in {}", path.display()))
}

fn to_value(payload: impl serde::Serialize) -> Result<Value, WorkflowError> {
    Ok(serde_json::to_value(payload).map_err(anyhow::Error::from)?)
}

fn render_error(failure: &WorkflowError) -> String {
    let mut body = json!({
        "code": failure.code(),
        "message": failure.to_string(),
    });
    if let Some(source) = std::error::Error::source(failure) {
        body["detail"] = json!(source.to_string());
    }
    json!({ "error": body }).to_string()
}
