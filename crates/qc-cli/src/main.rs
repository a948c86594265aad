use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::LevelFilter;
use qc_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use qc_contracts::models::VISION;
use qc_contracts::prompt::SampleLabel;
use qc_contracts::session::{Session, DEFAULT_MAX_SAMPLES_PER_LABEL};
use qc_engine::{
    list_folder_images, pick_image, AnalysisResult, EngineConfig, InspectionEngine, SampleAdded,
    DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_MODEL,
};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(
    name = "qc-vision",
    version,
    about = "Few-shot visual quality control against a vision chat model"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Analyze(AnalyzeArgs),
    Browse(BrowseArgs),
}

#[derive(Debug, Args)]
struct EngineArgs {
    #[arg(long, default_value = ".qc-vision")]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
    #[arg(long, default_value_t = DEFAULT_MAX_SAMPLES_PER_LABEL)]
    max_samples: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_OUTPUT_TOKENS)]
    max_output_tokens: u32,
    #[arg(long, default_value_t = 60)]
    timeout_s: u64,
    #[arg(long, default_value = ".")]
    results_dir: PathBuf,
}

impl EngineArgs {
    fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::from_env();
        config.model = self.model.clone();
        config.max_samples_per_label = self.max_samples;
        config.max_output_tokens = self.max_output_tokens;
        config.timeout = Duration::from_secs(self.timeout_s.max(1));
        config.results_dir = self.results_dir.clone();
        config
    }

    fn build(&self) -> Result<InspectionEngine> {
        let events_path = self
            .events
            .clone()
            .unwrap_or_else(|| self.out.join("events.jsonl"));
        InspectionEngine::new(&self.out, events_path, self.config())
    }
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    target: PathBuf,
    #[arg(long, value_parser = parse_sample_arg)]
    good: Vec<SampleArg>,
    #[arg(long, value_parser = parse_sample_arg)]
    bad: Vec<SampleArg>,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    save: bool,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Parser)]
struct BrowseArgs {
    #[arg(long)]
    dir: PathBuf,
    #[arg(long)]
    pick: Option<String>,
    #[arg(long)]
    prompt: Option<String>,
    #[command(flatten)]
    engine: EngineArgs,
}

/// `PATH=ANNOTATION` from the command line; a bare `PATH` has no annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SampleArg {
    path: PathBuf,
    annotation: Option<String>,
}

fn parse_sample_arg(raw: &str) -> Result<SampleArg, String> {
    let (path, annotation) = match raw.split_once('=') {
        Some((path, annotation)) => (path.trim(), Some(annotation)),
        None => (raw.trim(), None),
    };
    if path.is_empty() {
        return Err(format!("missing image path in '{raw}'"));
    }
    Ok(SampleArg {
        path: PathBuf::from(path),
        annotation: annotation
            .filter(|value| !value.is_empty())
            .map(str::to_string),
    })
}

fn logger_builder(env: Env<'_>) -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(LevelFilter::Warn).parse_env(env);
    builder
}

fn main() {
    logger_builder(Env::default()).init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("qc-vision error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Analyze(args) => run_analyze(args),
        Command::Browse(args) => run_browse(args),
    }
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let engine = args.engine.build()?;
    let mut session = engine.open_session()?;
    let stdin = io::stdin();
    let mut line = String::new();
    let mut browse_dir: Option<PathBuf> = None;
    let mut browse_names: Vec<String> = Vec::new();

    println!(
        "Quality control session {} ({}). Type /help for commands.",
        session.id(),
        session.model()
    );
    println!("Instruction: {}", session.instruction());

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

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        match intent.action.as_str() {
            "noop" => {}
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
                println!("Any other text replaces the analysis instruction.");
            }
            "quit" => break,
            "set_instruction" => {
                match value_as_non_empty_string(intent.command_args.get("instruction")) {
                    Some(instruction) => {
                        session.set_instruction(instruction);
                        println!("Instruction set.");
                    }
                    None => println!("/prompt requires text"),
                }
            }
            "set_model" => {
                let Some(model) = value_as_non_empty_string(intent.command_args.get("model"))
                else {
                    println!("Model: {}", session.model());
                    continue;
                };
                match engine.select_model(&mut session, Some(model.as_str())) {
                    Ok(selection) => {
                        if let Some(reason) = selection.fallback_reason {
                            println!("{reason}");
                        }
                        println!("Model set to {}", selection.model.name);
                    }
                    Err(err) => println!("Model change failed: {err:#}"),
                }
            }
            "list_models" => {
                for spec in engine.model_selector().registry.by_capability(VISION) {
                    let marker = if spec.name == session.model() { "*" } else { " " };
                    match spec.context_window {
                        Some(window) => println!(
                            "{marker} {} ({}, {window} token context)",
                            spec.name, spec.provider
                        ),
                        None => println!("{marker} {} ({})", spec.name, spec.provider),
                    }
                }
            }
            "add_good" | "add_bad" => {
                let label = if intent.action == "add_good" {
                    SampleLabel::Good
                } else {
                    SampleLabel::Bad
                };
                let Some(path) = value_as_non_empty_string(intent.command_args.get("path")) else {
                    println!("/{label} requires an image path");
                    continue;
                };
                let annotation = intent
                    .arg_str("annotation")
                    .filter(|value| !value.is_empty())
                    .map(str::to_string);
                match engine.add_sample_file(&mut session, label, Path::new(&path), annotation) {
                    Ok(added) => println!("{}", describe_added(label, &path, &added)),
                    Err(err) => println!("Could not add {label} image: {err:#}"),
                }
            }
            "list_samples" => print_samples(&session),
            "analyze" => {
                let Some(path) = value_as_non_empty_string(intent.command_args.get("path")) else {
                    println!("/analyze requires an image path");
                    continue;
                };
                analyze_and_print(&engine, &mut session, Path::new(&path));
            }
            "browse" => {
                let Some(dir) = value_as_non_empty_string(intent.command_args.get("path")) else {
                    println!("/browse requires a folder path");
                    continue;
                };
                let dir = PathBuf::from(dir);
                match list_folder_images(&dir) {
                    Ok(names) => {
                        print_listing(&names);
                        println!("Use /pick NAME|INDEX to analyze one.");
                        browse_dir = Some(dir);
                        browse_names = names;
                    }
                    Err(err) => {
                        println!("{err}");
                        browse_dir = None;
                        browse_names.clear();
                    }
                }
            }
            "pick" => {
                let Some(dir) = browse_dir.as_deref() else {
                    println!("/pick needs a folder listing first (use /browse DIR)");
                    continue;
                };
                let selection = intent.arg_str("selection").unwrap_or_default();
                match pick_image(&browse_names, selection) {
                    Some(name) => analyze_and_print(&engine, &mut session, &dir.join(name)),
                    None => println!("No image '{selection}' in the last listing"),
                }
            }
            "save" => match engine.save_result(&mut session) {
                Ok(path) => println!("Result saved to {}", path.display()),
                Err(err) => println!("Nothing saved: {err:#}"),
            },
            "reset" => println!("{}", reset_and_report(&engine, &mut session)),
            _ => {
                let command = intent.arg_str("command").unwrap_or(input.trim());
                println!("Unknown command /{command}. Type /help for commands.");
            }
        }
    }

    let summary_path = engine.finish(&session)?;
    println!("Session summary written to {}", summary_path.display());
    Ok(())
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let engine = args.engine.build()?;
    let mut session = engine.open_session()?;
    if let Some(prompt) = args.prompt.as_deref().map(str::trim) {
        if !prompt.is_empty() {
            session.set_instruction(prompt);
        }
    }

    let labeled = args
        .good
        .iter()
        .map(|sample| (SampleLabel::Good, sample))
        .chain(args.bad.iter().map(|sample| (SampleLabel::Bad, sample)));
    for (label, sample) in labeled {
        let added = engine
            .add_sample_file(
                &mut session,
                label,
                &sample.path,
                sample.annotation.clone(),
            )
            .with_context(|| format!("failed to add {label} sample {}", sample.path.display()))?;
        eprintln!(
            "{}",
            describe_added(label, &sample.path.to_string_lossy(), &added)
        );
    }

    eprintln!("Analyzing image...");
    let result = engine.analyze_file(&mut session, &args.target)?;
    println!("{}", result.text);

    if args.save {
        let path = engine.save_result(&mut session)?;
        eprintln!("Result saved to {}", path.display());
    }
    engine.finish(&session)?;
    Ok(exit_code(&result))
}

fn run_browse(args: BrowseArgs) -> Result<i32> {
    let names = match list_folder_images(&args.dir) {
        Ok(names) => names,
        Err(err) => {
            eprintln!("{err}");
            return Ok(1);
        }
    };
    print_listing(&names);

    let Some(selection) = args.pick.as_deref() else {
        return Ok(0);
    };
    let Some(name) = pick_image(&names, selection) else {
        eprintln!("No image '{selection}' in {}", args.dir.display());
        return Ok(1);
    };

    let engine = args.engine.build()?;
    let mut session = engine.open_session()?;
    if let Some(prompt) = args.prompt.as_deref().map(str::trim) {
        if !prompt.is_empty() {
            session.set_instruction(prompt);
        }
    }
    eprintln!("Analyzing image...");
    let result = engine.analyze_file(&mut session, &args.dir.join(name))?;
    println!("{}", result.text);
    engine.finish(&session)?;
    Ok(exit_code(&result))
}

fn analyze_and_print(engine: &InspectionEngine, session: &mut Session, path: &Path) {
    println!("Analyzing image...");
    match engine.analyze_file(session, path) {
        Ok(result) => println!("{}", result.text),
        Err(err) => println!("Analysis not started: {err:#}"),
    }
}

fn reset_and_report(engine: &InspectionEngine, session: &mut Session) -> String {
    match engine.reset_session(session) {
        Ok(()) => "Samples and last result cleared.".to_string(),
        Err(err) => format!("Samples cleared, but the reset was not journaled: {err:#}"),
    }
}

fn describe_added(label: SampleLabel, path: &str, added: &SampleAdded) -> String {
    let preview = &added.preview;
    if added.grounded {
        format!(
            "Added {label} example {path} ({}x{} {})",
            preview.width, preview.height, preview.format
        )
    } else {
        format!(
            "Stored {label} image {path} ({}x{} {}) without annotation; it is not used as an example",
            preview.width, preview.height, preview.format
        )
    }
}

fn print_samples(session: &Session) {
    if session.samples().is_empty() {
        println!("No samples yet.");
        return;
    }
    for (index, sample) in session.samples().iter().enumerate() {
        let annotation = sample.grounding_annotation().unwrap_or("(no annotation)");
        println!(
            "{:>2}. [{}] {} {}",
            index + 1,
            sample.label(),
            sample.name(),
            annotation
        );
    }
    println!(
        "{} few-shot entries, max {} per label",
        session.history().len(),
        session.max_samples_per_label()
    );
}

fn print_listing(names: &[String]) {
    for (index, name) in names.iter().enumerate() {
        println!("{:>3}. {name}", index + 1);
    }
}

fn exit_code(result: &AnalysisResult) -> i32 {
    if result.is_success() {
        0
    } else {
        2
    }
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    let raw = value
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}
