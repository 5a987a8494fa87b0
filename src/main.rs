use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use dotenvy::dotenv;
use tracing::info;

mod assemble;
mod backend;
mod character;
mod cleanup;
mod config;
mod error;
mod orchestrator;
mod prompt;
mod utils;

use assemble::ReturnType;
use backend::gemini::GeminiImageClient;
use character::{CharacterSpec, GenerationRequest, Mode};
use cleanup::BackgroundCleaner;
use config::CONFIG;
use orchestrator::{BatchOutcome, GenerationOrchestrator};
use utils::logging::init_logging;

fn usage() -> &'static str {
    "Usage: standing_set_generator --character <path.json> [--mode normal|emo|fantasy] [--return-type zip|base64_list] [--out <path>]"
}

struct CliArgs {
    character_path: PathBuf,
    mode: Mode,
    return_type: ReturnType,
    out: Option<PathBuf>,
}

fn parse_cli_args(args: &[String]) -> anyhow::Result<CliArgs> {
    let mut character_path: Option<PathBuf> = None;
    let mut mode = Mode::Normal;
    let mut return_type = ReturnType::Zip;
    let mut out: Option<PathBuf> = None;

    let mut index = 1;
    while index < args.len() {
        match args[index].as_str() {
            "--character" => {
                index += 1;
                let value = args
                    .get(index)
                    .ok_or_else(|| anyhow!("Missing value for --character"))?;
                character_path = Some(PathBuf::from(value));
            }
            "--mode" => {
                index += 1;
                let value = args
                    .get(index)
                    .ok_or_else(|| anyhow!("Missing value for --mode"))?;
                mode = Mode::parse(value)
                    .ok_or_else(|| anyhow!("Unknown mode '{value}' (normal, emo, fantasy)"))?;
            }
            "--return-type" => {
                index += 1;
                let value = args
                    .get(index)
                    .ok_or_else(|| anyhow!("Missing value for --return-type"))?;
                return_type = ReturnType::parse(value)
                    .ok_or_else(|| anyhow!("Unknown return type '{value}' (zip, base64_list)"))?;
            }
            "--out" => {
                index += 1;
                let value = args
                    .get(index)
                    .ok_or_else(|| anyhow!("Missing value for --out"))?;
                out = Some(PathBuf::from(value));
            }
            other => bail!("Unknown argument '{other}'\n{}", usage()),
        }
        index += 1;
    }

    let character_path = character_path.ok_or_else(|| anyhow!("{}", usage()))?;
    Ok(CliArgs {
        character_path,
        mode,
        return_type,
        out,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let _logging_guards = init_logging();

    let args: Vec<String> = std::env::args().collect();
    let cli = parse_cli_args(&args)?;

    if CONFIG.gemini_api_key.trim().is_empty() {
        bail!("GEMINI_API_KEY is not configured");
    }

    let raw = tokio::fs::read_to_string(&cli.character_path)
        .await
        .with_context(|| {
            format!(
                "Failed to read character file {}",
                cli.character_path.display()
            )
        })?;
    let character: CharacterSpec =
        serde_json::from_str(&raw).context("Failed to parse character JSON")?;

    let request = GenerationRequest::new(character, cli.mode)?;
    info!(
        character_id = %request.character.character_id,
        mode = request.mode.name(),
        expressions = request.labels.len(),
        "loaded generation request"
    );

    let backend = Arc::new(GeminiImageClient::new(CONFIG.gemini_config()));
    let orchestrator = GenerationOrchestrator::new(
        backend,
        Arc::new(BackgroundCleaner::default()),
        CONFIG.orchestrator_settings(),
    );

    let result = orchestrator.run(request).await?;
    if result.outcome == BatchOutcome::Partial {
        let failed: Vec<&str> = result
            .variants
            .iter()
            .filter(|variant| variant.failure.is_some())
            .map(|variant| variant.label.slug)
            .collect();
        info!(?failed, "batch settled with missing slots");
    }

    match cli.return_type {
        ReturnType::Zip => {
            let bytes = assemble::build_archive(&result)?;
            let path = cli
                .out
                .unwrap_or_else(|| PathBuf::from(assemble::archive_file_name(&result.character_id)));
            tokio::fs::write(&path, &bytes)
                .await
                .with_context(|| format!("Failed to write archive {}", path.display()))?;
            info!(path = %path.display(), bytes = bytes.len(), "archive written");
        }
        ReturnType::Base64List => {
            let payload = assemble::build_image_list(&result);
            let body = serde_json::to_string_pretty(&payload)?;
            match cli.out {
                Some(path) => {
                    tokio::fs::write(&path, body)
                        .await
                        .with_context(|| format!("Failed to write payload {}", path.display()))?;
                    info!(path = %path.display(), "payload written");
                }
                None => println!("{body}"),
            }
        }
    }

    Ok(())
}
