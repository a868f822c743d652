use std::env;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Result};
use bulkgen_contracts::batch::BatchState;
use bulkgen_contracts::images::AspectRatio;
use bulkgen_contracts::models::ModelRegistry;
use bulkgen_contracts::prompts::{load_prompts, Prompt};
use bulkgen_engine::{archive_entry_name, BatchSpec, BulkEngine};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const DEFAULT_MODEL: &str = "imagen-4.0-generate-001";

#[derive(Debug, Parser)]
#[command(
    name = "bulkgen",
    version,
    about = "Generate images in bulk from a prompt file and bundle them into a zip"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate every prompt N times and write generated_images.zip.
    Generate(GenerateArgs),
    /// Show what a run would do without calling any provider.
    Plan(PlanArgs),
    /// List the image models this build knows about.
    Models(ModelsArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    /// Text file with one prompt per line; blank lines are ignored.
    #[arg(long)]
    prompts: PathBuf,
    /// Output directory for the archive, events.jsonl and summary.json.
    #[arg(long)]
    out: PathBuf,
    /// Images per prompt.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=10))]
    count: u32,
    /// One of 1:1, 16:9, 9:16, 4:3, 3:4.
    #[arg(long, default_value = "1:1", value_parser = parse_aspect_ratio)]
    aspect_ratio: AspectRatio,
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
    /// Google AI API key. Used for this run only and never written to disk.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct PlanArgs {
    #[arg(long)]
    prompts: PathBuf,
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=10))]
    count: u32,
    /// Print the plan as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct ModelsArgs {
    /// Only list models served by this provider (e.g. imagen, dryrun).
    #[arg(long)]
    provider: Option<String>,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("bulkgen error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Plan(args) => run_plan(args),
        Command::Models(args) => {
            run_models(args);
            Ok(0)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn parse_aspect_ratio(raw: &str) -> Result<AspectRatio, String> {
    raw.parse()
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    generate(args, non_empty_env("GOOGLE_API_KEY"))
}

fn generate(args: GenerateArgs, google_fallback: Option<String>) -> Result<i32> {
    let prompts = load_prompts(&args.prompts)?;
    if prompts.is_empty() {
        bail!("no prompts found in {}", args.prompts.display());
    }
    tracing::debug!(path = %args.prompts.display(), prompts = prompts.len(), "prompt file loaded");
    println!("{} prompts loaded.", prompts.len());

    let credential = resolve_api_key(args.api_key, google_fallback);
    let spec = BatchSpec {
        prompts,
        count_per_prompt: args.count,
        aspect_ratio: args.aspect_ratio,
        credential,
        model: args.model,
    };
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let engine = BulkEngine::new(&args.out, &events_path)?;
    tracing::info!(
        run_id = engine.run_id(),
        out_dir = %engine.out_dir().display(),
        units = spec.total_units(),
        "starting run"
    );

    let mut stdout = io::stdout();
    let outcome = engine.run(&spec, &mut |state: &BatchState| {
        let _ = writeln!(stdout, "{}", format_progress_line(state));
        let _ = stdout.flush();
    });

    match outcome {
        Ok(state) => {
            if let Some(archive) = &state.archive {
                println!(
                    "Download ZIP ({} images): {}",
                    archive.entries,
                    archive.path.display()
                );
            }
            Ok(0)
        }
        Err(aborted) => {
            println!("Error: {}", aborted.source);
            println!(
                "{} of {} images generated before the error.",
                aborted.state.results.len(),
                aborted.state.total_units
            );
            Ok(1)
        }
    }
}

fn run_plan(args: PlanArgs) -> Result<i32> {
    let prompts = load_prompts(&args.prompts)?;
    let entries = planned_entry_names(&prompts, args.count);
    if args.json {
        let payload = json!({
            "prompts": prompts,
            "count_per_prompt": args.count,
            "total_units": entries.len(),
            "entries": entries,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(0);
    }
    println!("{} prompts loaded.", prompts.len());
    for (idx, prompt) in prompts.iter().enumerate() {
        println!("  {:>3}. {}", idx + 1, prompt);
    }
    println!("Total images: {}", entries.len());
    for name in &entries {
        println!("  {name}");
    }
    Ok(0)
}

fn run_models(args: ModelsArgs) {
    for row in model_rows(&ModelRegistry::new(None), args.provider.as_deref()) {
        println!("{row}");
    }
}

fn model_rows(registry: &ModelRegistry, provider: Option<&str>) -> Vec<String> {
    let models = match provider {
        Some(provider) => registry.by_provider(provider),
        None => registry.list().cloned().collect(),
    };
    models
        .iter()
        .map(|model| format!("{:<32} {:<8} {}", model.name, model.provider, model.description))
        .collect()
}

fn planned_entry_names(prompts: &[Prompt], count: u32) -> Vec<String> {
    prompts
        .iter()
        .flat_map(|prompt| (0..count).map(move |_| prompt))
        .enumerate()
        .map(|(idx, prompt)| archive_entry_name(idx + 1, prompt.as_str()))
        .collect()
}

fn format_progress_line(state: &BatchState) -> String {
    let line = format!(
        "Generating... {} / {} Images ({:.0}%)",
        state.results.len(),
        state.total_units,
        state.progress_pct()
    );
    match state.placeholders() {
        0 => line,
        pending => format!("{line}, {pending} pending"),
    }
}

/// `--api-key` (or `GEMINI_API_KEY`) wins over `GOOGLE_API_KEY`. An empty
/// result is left for the engine to reject.
fn resolve_api_key(explicit: Option<String>, google_fallback: Option<String>) -> String {
    explicit
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or(google_fallback)
        .unwrap_or_default()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use bulkgen_contracts::batch::BatchState;
    use bulkgen_contracts::images::{AspectRatio, GeneratedImage};
    use bulkgen_contracts::models::ModelRegistry;
    use bulkgen_contracts::prompts::{parse_prompts, Prompt};
    use clap::Parser;

    use super::{
        format_progress_line, generate, model_rows, planned_entry_names, resolve_api_key,
        run_generate, Cli, Command,
    };

    #[test]
    fn generate_args_parse_with_defaults() {
        let cli = Cli::try_parse_from([
            "bulkgen",
            "generate",
            "--prompts",
            "prompts.txt",
            "--out",
            "out",
            "--api-key",
            "k",
        ])
        .unwrap();
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        assert_eq!(args.count, 1);
        assert_eq!(args.aspect_ratio, AspectRatio::Square);
        assert_eq!(args.model, "imagen-4.0-generate-001");
        assert_eq!(args.api_key.as_deref(), Some("k"));
    }

    #[test]
    fn count_outside_one_to_ten_is_rejected() {
        for count in ["0", "11"] {
            let parsed = Cli::try_parse_from([
                "bulkgen", "plan", "--prompts", "p.txt", "--count", count,
            ]);
            assert!(parsed.is_err(), "count {count} should be rejected");
        }
    }

    #[test]
    fn aspect_ratio_flag_accepts_labels_only() {
        let parsed = Cli::try_parse_from([
            "bulkgen",
            "generate",
            "--prompts",
            "p.txt",
            "--out",
            "o",
            "--aspect-ratio",
            "16:9",
        ])
        .unwrap();
        let Command::Generate(args) = parsed.command else {
            panic!("expected generate");
        };
        assert_eq!(args.aspect_ratio, AspectRatio::Landscape);

        assert!(Cli::try_parse_from([
            "bulkgen",
            "generate",
            "--prompts",
            "p.txt",
            "--out",
            "o",
            "--aspect-ratio",
            "21:9",
        ])
        .is_err());
    }

    #[test]
    fn planned_entries_match_archive_naming() {
        let prompts = parse_prompts("a red fox\na blue cat\n");
        assert_eq!(
            planned_entry_names(&prompts, 2),
            vec![
                "1_a_red_fox.jpeg",
                "2_a_red_fox.jpeg",
                "3_a_blue_cat.jpeg",
                "4_a_blue_cat.jpeg",
            ]
        );
    }

    #[test]
    fn progress_line_shows_count_and_percent() {
        let state = BatchState::new(4).with_result(GeneratedImage::new(
            Prompt::new("boat").unwrap(),
            "data:image/jpeg;base64,AA==",
        ));
        assert_eq!(
            format_progress_line(&state),
            "Generating... 1 / 4 Images (25%), 3 pending"
        );

        let done = BatchState::new(1).with_result(GeneratedImage::new(
            Prompt::new("kite").unwrap(),
            "data:image/jpeg;base64,AA==",
        ));
        assert_eq!(
            format_progress_line(&done),
            "Generating... 1 / 1 Images (100%)"
        );
    }

    #[test]
    fn models_can_be_filtered_by_provider() {
        let registry = ModelRegistry::new(None);
        let dryrun = model_rows(&registry, Some("dryrun"));
        assert_eq!(dryrun.len(), 1);
        assert!(dryrun[0].starts_with("dryrun-image-1"));

        let imagen = model_rows(&registry, Some("imagen"));
        assert_eq!(imagen.len(), 4);
        assert!(imagen.iter().all(|row| row.contains(" imagen ")));

        assert_eq!(model_rows(&registry, None).len(), 5);
        assert!(model_rows(&registry, Some("openai")).is_empty());
    }

    #[test]
    fn models_subcommand_accepts_provider_filter() {
        let cli = Cli::try_parse_from(["bulkgen", "models", "--provider", "dryrun"]).unwrap();
        let Command::Models(args) = cli.command else {
            panic!("expected models");
        };
        assert_eq!(args.provider.as_deref(), Some("dryrun"));
    }

    #[test]
    fn explicit_key_wins_over_google_fallback() {
        assert_eq!(
            resolve_api_key(Some(" gem ".to_string()), Some("goog".to_string())),
            "gem"
        );
        assert_eq!(
            resolve_api_key(Some("  ".to_string()), Some("goog".to_string())),
            "goog"
        );
        assert_eq!(resolve_api_key(None, None), "");
    }

    #[test]
    fn dryrun_generate_writes_archive() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let prompts = temp.path().join("prompts.txt");
        std::fs::write(&prompts, "lighthouse\n\nharbor at night\n")?;
        let out = temp.path().join("out");
        let cli = Cli::try_parse_from([
            "bulkgen",
            "generate",
            "--prompts",
            prompts.to_str().unwrap(),
            "--out",
            out.to_str().unwrap(),
            "--count",
            "2",
            "--model",
            "dryrun-image-1",
            "--api-key",
            "offline",
        ])?;
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        assert_eq!(run_generate(args)?, 0);
        assert!(out.join("generated_images.zip").exists());
        assert!(out.join("summary.json").exists());
        Ok(())
    }

    #[test]
    fn generate_without_key_exits_with_failure() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let prompts = temp.path().join("prompts.txt");
        std::fs::write(&prompts, "lighthouse\n")?;
        let out = temp.path().join("out");
        let cli = Cli::try_parse_from([
            "bulkgen",
            "generate",
            "--prompts",
            prompts.to_str().unwrap(),
            "--out",
            out.to_str().unwrap(),
            "--model",
            "dryrun-image-1",
        ])?;
        let Command::Generate(mut args) = cli.command else {
            panic!("expected generate");
        };
        args.api_key = Some(String::new());
        assert_eq!(generate(args, None)?, 1);
        assert!(!out.join("generated_images.zip").exists());
        Ok(())
    }
}
