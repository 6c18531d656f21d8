use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use verdant_contracts::events::EventWriter;
use verdant_contracts::models::{ModelRegistry, CAPABILITY_CHAT};
use verdant_contracts::plant::AnalysisResult;
use verdant_contracts::store::{FileBlobStore, ResultStore, ANALYSIS_RESULTS_KEY};
use verdant_engine::advisor::PlantAdvisor;
use verdant_engine::backend::{ContentTurn, GeminiBackend};
use verdant_engine::config::{gemini_api_key, PipelineConfig};
use verdant_engine::preprocess::ImageData;
use verdant_engine::{select_chain, Analyzer};

const EXIT_ANALYSIS_FAILED: i32 = 2;
const EXIT_QUOTA: i32 = 3;

#[derive(Debug, Parser)]
#[command(name = "verdant", version, about = "Plant identification, health and care analysis")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Identify a plant, assess its health and store care advice.
    Analyze(AnalyzeArgs),
    /// List stored analyses, oldest first.
    History(HistoryArgs),
    Remove(RemoveArgs),
    Clear(StoreArgs),
    /// Ask the plant expert questions from stdin.
    Chat(ChatArgs),
    Models,
}

#[derive(Debug, Parser)]
struct ModelArgs {
    #[arg(long)]
    primary_model: Option<String>,
    #[arg(long)]
    secondary_model: Option<String>,
}

#[derive(Debug, Parser)]
struct StoreArgs {
    /// Directory holding the result store (defaults to $VERDANT_HOME/store).
    #[arg(long)]
    store: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    /// Image file path or `data:` URL.
    #[arg(long)]
    image: String,
    #[arg(long)]
    plant_id: Option<String>,
    #[arg(long)]
    store: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    json: bool,
    #[command(flatten)]
    models: ModelArgs,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[arg(long)]
    plant_id: Option<String>,
    #[arg(long)]
    json: bool,
    #[command(flatten)]
    location: StoreArgs,
}

#[derive(Debug, Parser)]
struct RemoveArgs {
    #[arg(long)]
    id: String,
    #[command(flatten)]
    location: StoreArgs,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    events: Option<PathBuf>,
    #[command(flatten)]
    models: ModelArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("verdant error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    match cli.command {
        Command::Analyze(args) => run_analyze(&config, args),
        Command::History(args) => {
            run_history(&config, args)?;
            Ok(0)
        }
        Command::Remove(args) => run_remove(&config, args),
        Command::Clear(args) => {
            let mut store = open_store(&config, args.store.as_deref());
            let count = store.len();
            store.clear()?;
            println!("Cleared {count} stored analyses.");
            Ok(0)
        }
        Command::Chat(args) => {
            run_chat(&config, args)?;
            Ok(0)
        }
        Command::Models => {
            run_models();
            Ok(0)
        }
    }
}

fn run_analyze(config: &PipelineConfig, args: AnalyzeArgs) -> Result<i32> {
    let mut config = with_models(config, &args.models);
    if let Some(dir) = args.store.clone() {
        config.store_dir = Some(dir);
    }
    let image = load_image(&args.image)?;
    let events = open_events(&config, args.events.as_deref())?;
    let backend = gemini_backend(&config)?;
    let mut analyzer = Analyzer::from_config(&config, Box::new(backend), events)?;

    match analyzer.analyze(&image, args.plant_id.as_deref()) {
        Ok(result) => {
            for warning in analyzer.last_warnings() {
                eprintln!("warning: {warning}");
            }
            if args.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
            Ok(0)
        }
        Err(err) => {
            eprintln!("{}", err.user_message());
            eprintln!("detail: {err}");
            if err.is_quota() {
                Ok(EXIT_QUOTA)
            } else {
                Ok(EXIT_ANALYSIS_FAILED)
            }
        }
    }
}

fn run_history(config: &PipelineConfig, args: HistoryArgs) -> Result<()> {
    let store = open_store(config, args.location.store.as_deref());
    let rows: Vec<&AnalysisResult> = match args.plant_id.as_deref() {
        Some(plant_id) => store.for_plant(plant_id),
        None => store.load_all().iter().collect(),
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No stored analyses.");
        return Ok(());
    }
    for result in rows {
        println!(
            "{}  {}  {} ({}) - {}{}",
            result.captured_at,
            result.id,
            result.identification.common_name,
            result.identification.scientific_name,
            result.health_label(),
            result
                .plant_id
                .as_deref()
                .map(|plant_id| format!("  [plant {plant_id}]"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

fn run_remove(config: &PipelineConfig, args: RemoveArgs) -> Result<i32> {
    let mut store = open_store(config, args.location.store.as_deref());
    if store.remove(&args.id)? {
        println!("Removed {}.", args.id);
        Ok(0)
    } else {
        eprintln!("No stored analysis with id {}.", args.id);
        Ok(1)
    }
}

fn run_chat(config: &PipelineConfig, args: ChatArgs) -> Result<()> {
    let config = with_models(config, &args.models);
    let events = open_events(&config, args.events.as_deref())?;
    let chain = select_chain(&config, CAPABILITY_CHAT)?;
    events.emit(
        "session_started",
        json!({ "mode": "chat", "models": chain.names() })
            .as_object()
            .cloned()
            .unwrap_or_default(),
    )?;
    let advisor = PlantAdvisor::new(Box::new(gemini_backend(&config)?), chain, events);

    let stdin = io::stdin();
    let mut line = String::new();
    let mut history: Vec<ContentTurn> = Vec::new();

    println!("Plant expert chat. /reset clears the conversation, /quit exits.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                history.clear();
                println!("Conversation cleared.");
                continue;
            }
            _ => {}
        }

        match advisor.ask_expert(&history, input) {
            Ok(reply) => {
                println!("{reply}");
                history.push(ContentTurn::user_text(input));
                history.push(ContentTurn::model_text(reply));
            }
            Err(err) if err.is_quota() => {
                println!("The plant expert has reached its usage limit. Please try again later.");
            }
            Err(err) => {
                println!("Sorry, I couldn't answer that. Please try again.");
                eprintln!("detail: {err}");
            }
        }
    }
    Ok(())
}

fn run_models() {
    let registry = ModelRegistry::new(None);
    for spec in registry.list() {
        println!(
            "{:<24} {:<10} {:?}  [{}]",
            spec.name,
            spec.provider,
            spec.tier,
            spec.capabilities.join(", ")
        );
    }
}

fn with_models(config: &PipelineConfig, models: &ModelArgs) -> PipelineConfig {
    let mut config = config.clone();
    if let Some(primary) = non_empty(models.primary_model.as_deref()) {
        config.primary_model = Some(primary);
    }
    if let Some(secondary) = non_empty(models.secondary_model.as_deref()) {
        config.secondary_model = Some(secondary);
    }
    config
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn gemini_backend(config: &PipelineConfig) -> Result<GeminiBackend> {
    let Some(api_key) = gemini_api_key() else {
        bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
    };
    GeminiBackend::new(config, api_key)
}

fn open_events(config: &PipelineConfig, path: Option<&Path>) -> Result<EventWriter> {
    let events_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.events_path());
    if let Some(parent) = events_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    Ok(EventWriter::new(
        events_path,
        format!("verdant-{}", std::process::id()),
    ))
}

fn open_store(config: &PipelineConfig, dir: Option<&Path>) -> ResultStore {
    let dir = dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.store_dir());
    let blobs = FileBlobStore::new(dir).with_quota(config.store_quota_bytes);
    ResultStore::load(Box::new(blobs), ANALYSIS_RESULTS_KEY, config.max_stored_results)
}

fn load_image(raw: &str) -> Result<ImageData> {
    let trimmed = raw.trim();
    if trimmed.starts_with("data:") {
        return ImageData::from_data_url(trimmed);
    }
    ImageData::from_path(Path::new(trimmed))
}

fn print_result(result: &AnalysisResult) {
    let identification = &result.identification;
    println!(
        "{} ({}) - {:.0}% confidence",
        identification.common_name, identification.scientific_name, identification.confidence_score
    );
    println!("{}", identification.description);
    if !identification.tags.is_empty() {
        println!("Tags: {}", identification.tags.join(", "));
    }
    println!();
    println!("Health: {} - {}", result.health_label(), result.health.summary);
    for issue in &result.health.issues {
        println!(
            "  - {} [{}]: {}",
            issue.name,
            issue.severity.as_str(),
            issue.description
        );
        if let Some(solution) = issue.solution.as_deref() {
            println!("    fix: {solution}");
        }
    }
    println!();
    println!("Care: {}", result.care.summary);
    let care = &result.care;
    for (label, text) in [
        ("Watering", &care.watering),
        ("Light", &care.light),
        ("Soil", &care.soil),
        ("Temperature", &care.temperature),
        ("Humidity", &care.humidity),
        ("Tips", &care.additional_tips),
        ("Home remedies", &care.home_remedies),
        ("Cultural notes", &care.cultural_notes),
    ] {
        println!("  {label}: {text}");
    }
    println!();
    println!("Saved as {} at {}", result.id, result.captured_at);
}
