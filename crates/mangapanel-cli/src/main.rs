use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mangapanel_contracts::events::EventWriter;
use mangapanel_contracts::settings::{PanelSettings, SettingsStore};
use mangapanel_contracts::template::JobTemplate;
use mangapanel_engine::{
    fetch_inline_image, GeminiClient, PanelOutcome, PanelWorkflow, RunOutcome,
};
use sha2::{Digest, Sha256};

const DEFAULT_SETTINGS_PATH: &str = "mangapanel.settings.json";

#[derive(Debug, Parser)]
#[command(name = "mangapanel", version, about = "Turn a chat message into a captioned manga panel via a local ComfyUI server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the full pipeline: derive parameters, render, fetch, caption.
    Generate(GenerateArgs),
    /// Caption an already-rendered image without submitting a job.
    Caption(CaptionArgs),
    /// Inspect or edit the settings file.
    Settings(SettingsArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    /// The triggering chat message.
    #[arg(long)]
    message: Option<String>,
    /// Read the message from a file, or from stdin with "-".
    #[arg(long)]
    message_file: Option<PathBuf>,
    /// Directory receiving the panel image and panel.html.
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value = DEFAULT_SETTINGS_PATH)]
    settings: PathBuf,
    /// Job template document; defaults to template_path from the settings.
    #[arg(long)]
    template: Option<PathBuf>,
    /// Append workflow events to this JSONL file.
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct CaptionArgs {
    /// Address of the rendered image.
    #[arg(long)]
    image_url: String,
    /// The triggering chat message.
    #[arg(long)]
    message: String,
    #[arg(long, default_value = DEFAULT_SETTINGS_PATH)]
    settings: PathBuf,
    /// Write the overlay markup here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct SettingsArgs {
    #[arg(long, default_value = DEFAULT_SETTINGS_PATH)]
    settings: PathBuf,
    #[command(subcommand)]
    command: SettingsCommand,
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    /// Print the effective settings as JSON.
    Show,
    /// Set one key, e.g. `set gemini_api_key AIza...` or `set fixed_seed ""`.
    Set { key: String, value: String },
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("mangapanel error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Caption(args) => run_caption(args),
        Command::Settings(args) => run_settings(args),
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let message = resolve_message(&args)?;
    let settings = SettingsStore::new(&args.settings).load();
    let template_path = resolve_template_path(&args, &settings)?;
    let template = JobTemplate::load(&template_path)?;

    let mut workflow = PanelWorkflow::new(settings);
    if let Some(events_path) = &args.events {
        let writer = EventWriter::new(events_path, workflow.workflow_id().to_string());
        workflow = workflow.with_events(writer);
    }

    let cancel = workflow.cancel_flag();
    let _ = ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst));

    let outcome = workflow
        .run(&message, &template)
        .map_err(anyhow::Error::new)
        .context("panel generation failed")?;
    let outcome = match outcome {
        RunOutcome::Completed(outcome) => outcome,
        RunOutcome::Cancelled => {
            eprintln!("generation cancelled; no panel produced");
            return Ok(130);
        }
    };

    let (image_path, page_path) = write_panel(&args.out, &outcome)?;
    for notice in &outcome.notices {
        eprintln!("notice: {notice}");
    }
    println!(
        "job {} rendered {}",
        outcome.job_id, outcome.artifact.reference.filename
    );
    println!("panel image: {}", image_path.display());
    println!("panel page: {}", page_path.display());
    Ok(0)
}

fn run_caption(args: CaptionArgs) -> Result<i32> {
    let settings = SettingsStore::new(&args.settings).load();
    let timeout = Duration::from_secs(settings.http_timeout_secs);
    let image = fetch_inline_image(&args.image_url, timeout)
        .map_err(anyhow::Error::new)
        .context("failed to fetch the image to caption")?;

    let gemini = GeminiClient::new(settings.gemini_model.clone(), timeout);
    let overlay = gemini
        .generate_caption_markup(&settings.gemini_api_key, &args.message, &image)
        .map_err(anyhow::Error::new)
        .context("captioning failed")?;

    match &args.out {
        Some(path) => {
            fs::write(path, &overlay)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("overlay markup: {}", path.display());
        }
        None => println!("{overlay}"),
    }
    Ok(0)
}

fn run_settings(args: SettingsArgs) -> Result<i32> {
    let store = SettingsStore::new(&args.settings);
    match args.command {
        SettingsCommand::Show => {
            let settings = store.load();
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        SettingsCommand::Set { key, value } => {
            store.update(&key, &value)?;
            println!("updated {key} in {}", store.path().display());
        }
    }
    Ok(0)
}

fn resolve_message(args: &GenerateArgs) -> Result<String> {
    if let Some(message) = &args.message {
        let message = message.trim();
        if message.is_empty() {
            bail!("--message is empty");
        }
        return Ok(message.to_string());
    }
    if let Some(path) = &args.message_file {
        let raw = if path == Path::new("-") {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read the message from stdin")?;
            buffer
        } else {
            fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?
        };
        let message = raw.trim();
        if message.is_empty() {
            bail!("message file is empty");
        }
        return Ok(message.to_string());
    }
    bail!("provide the chat message with --message or --message-file");
}

fn resolve_template_path(args: &GenerateArgs, settings: &PanelSettings) -> Result<PathBuf> {
    if let Some(path) = &args.template {
        return Ok(path.clone());
    }
    if let Some(path) = &settings.template_path {
        return Ok(path.clone());
    }
    bail!("no job template configured; pass --template or set template_path in the settings");
}

/// Write the artifact bytes and the composed page into the output directory.
fn write_panel(out_dir: &Path, outcome: &PanelOutcome) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let image_name = format!(
        "panel-{}.{}",
        short_digest(&outcome.artifact.bytes),
        outcome.artifact.extension()
    );
    let image_path = out_dir.join(&image_name);
    fs::write(&image_path, &outcome.artifact.bytes)
        .with_context(|| format!("failed to write {}", image_path.display()))?;

    let page_path = out_dir.join("panel.html");
    let page = compose_panel_html(&image_name, outcome.overlay.as_deref());
    fs::write(&page_path, page)
        .with_context(|| format!("failed to write {}", page_path.display()))?;

    Ok((image_path, page_path))
}

/// The panel page mirrors how a chat host composites the result: the image
/// inside a relatively positioned container, the overlay fragment layered
/// after it.
fn compose_panel_html(image_file: &str, overlay: Option<&str>) -> String {
    let mut html = String::new();
    html.push_str("<!doctype html>\n<html>\n<head><meta charset=\"utf-8\"><title>mangapanel</title></head>\n<body>\n");
    html.push_str("<div class=\"mangapanel-panel\" style=\"position: relative; display: inline-block;\">\n");
    html.push_str(&format!("<img src=\"{image_file}\" alt=\"manga panel\">\n"));
    if let Some(overlay) = overlay {
        html.push_str("<div class=\"mangapanel-bubbles\">\n");
        html.push_str(overlay);
        html.push_str("\n</div>\n");
    }
    html.push_str("</div>\n</body>\n</html>\n");
    html
}

fn short_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use mangapanel_contracts::reply::GenerationResult;
    use mangapanel_engine::{ArtifactRef, PanelArtifact};

    use super::*;

    fn outcome_with_overlay(overlay: Option<&str>) -> PanelOutcome {
        PanelOutcome {
            workflow_id: "wf-1".to_string(),
            parameters: GenerationResult {
                positive_prompt: "pose".to_string(),
                negative_prompt: "blurry".to_string(),
                noise_seed: Some(42),
                width: Some(512),
                height: Some(768),
            },
            job_id: "job-1".to_string(),
            artifact: PanelArtifact {
                reference: ArtifactRef {
                    url: "http://127.0.0.1:8188/view?filename=out.png".to_string(),
                    filename: "out.png".to_string(),
                },
                bytes: vec![7, 7, 7],
                mime_type: Some("image/png".to_string()),
                width: Some(512),
                height: Some(768),
            },
            overlay: overlay.map(str::to_string),
            notices: Vec::new(),
        }
    }

    #[test]
    fn short_digest_is_stable_and_short() {
        assert_eq!(short_digest(b"out"), short_digest(b"out"));
        assert_ne!(short_digest(b"out"), short_digest(b"other"));
        assert_eq!(short_digest(b"out").len(), 8);
    }

    #[test]
    fn panel_page_layers_overlay_over_image() {
        let overlay = "<div class='mangapanel-bubble' style='top: 10px; left: 20px;'>Hello!</div>";
        let html = compose_panel_html("panel-abcd1234.png", Some(overlay));
        assert!(html.contains("<img src=\"panel-abcd1234.png\""));
        assert!(html.contains(overlay));
        assert!(html.contains("position: relative"));
        let img_at = html.find("<img").expect("img");
        let overlay_at = html.find(overlay).expect("overlay");
        assert!(img_at < overlay_at);
    }

    #[test]
    fn panel_page_without_overlay_has_no_bubble_container() {
        let html = compose_panel_html("panel-abcd1234.png", None);
        assert!(!html.contains("mangapanel-bubbles"));
        assert!(html.contains("<img src=\"panel-abcd1234.png\""));
    }

    #[test]
    fn write_panel_places_image_and_page() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let outcome = outcome_with_overlay(Some("<div>hi</div>"));
        let (image_path, page_path) = write_panel(temp.path(), &outcome)?;

        assert_eq!(fs::read(&image_path)?, vec![7, 7, 7]);
        assert!(image_path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with("panel-"))
            .unwrap_or(false));
        let page = fs::read_to_string(&page_path)?;
        assert!(page.contains("<div>hi</div>"));
        Ok(())
    }

    #[test]
    fn message_resolution_prefers_the_flag() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let file = temp.path().join("message.txt");
        fs::write(&file, "from file\n")?;

        let mut args = GenerateArgs {
            message: Some("  from flag  ".to_string()),
            message_file: Some(file.clone()),
            out: temp.path().to_path_buf(),
            settings: PathBuf::from(DEFAULT_SETTINGS_PATH),
            template: None,
            events: None,
        };
        assert_eq!(resolve_message(&args)?, "from flag");

        args.message = None;
        assert_eq!(resolve_message(&args)?, "from file");

        args.message_file = None;
        assert!(resolve_message(&args).is_err());
        Ok(())
    }

    #[test]
    fn template_path_falls_back_to_settings() -> Result<()> {
        let args = GenerateArgs {
            message: Some("msg".to_string()),
            message_file: None,
            out: PathBuf::from("out"),
            settings: PathBuf::from(DEFAULT_SETTINGS_PATH),
            template: None,
            events: None,
        };
        let mut settings = PanelSettings::default();
        assert!(resolve_template_path(&args, &settings).is_err());

        settings.template_path = Some(PathBuf::from("costiflux.json"));
        assert_eq!(
            resolve_template_path(&args, &settings)?,
            PathBuf::from("costiflux.json")
        );

        let with_flag = GenerateArgs {
            template: Some(PathBuf::from("other.json")),
            ..args
        };
        assert_eq!(
            resolve_template_path(&with_flag, &settings)?,
            PathBuf::from("other.json")
        );
        Ok(())
    }
}
