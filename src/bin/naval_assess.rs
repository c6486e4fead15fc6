//! naval_assess - run the naval surveillance pipeline over image files.
//!
//! Prints one JSON document to stdout (an array for more than one image).
//! Images that fail are recorded as `{"image", "error"}` entries and the
//! process exits non-zero once every image has been attempted.

use anyhow::{anyhow, Result};
use clap::Parser;
use serde_json::{json, Value};
use std::io::IsTerminal;
use std::path::PathBuf;

use naval_watch::{BackendKind, ImageInput, NavalConfig, Pipeline};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "naval_assess",
    about = "Classify, caption and detect objects in naval imagery, then flag anomalies"
)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension)
    #[arg(long, env = "NAVAL_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Backend for all three stages (stub|replay|tract)
    #[arg(long, value_name = "NAME")]
    backend: Option<String>,

    /// Directory of recorded stage replies for the replay backend
    #[arg(long, value_name = "DIR")]
    replay_dir: Option<PathBuf>,

    /// Detection confidence floor in percent
    #[arg(long, value_name = "PCT")]
    min_confidence: Option<f64>,

    /// Run the stages one after another instead of concurrently
    #[arg(long)]
    sequential: bool,

    /// Write the JSON report here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,

    /// Images to assess
    #[arg(required = true, value_name = "IMAGES")]
    images: Vec<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let mode = ui::UiMode::parse(&args.ui)
        .ok_or_else(|| anyhow!("--ui must be auto, plain or pretty"))?;
    let ui = ui::Ui::new(mode, std::io::stderr().is_terminal());

    let mut config = NavalConfig::load_from(args.config.as_deref())?;
    if let Some(backend) = &args.backend {
        let kind: BackendKind = backend.parse()?;
        config.backends.classification = kind;
        config.backends.caption = kind;
        config.backends.detection = kind;
    }
    if let Some(dir) = &args.replay_dir {
        config.backends.replay_dir = dir.clone();
    }
    if let Some(floor) = args.min_confidence {
        config.min_confidence = floor;
    }
    if args.sequential {
        config.parallel_stages = false;
    }
    config.validate()?;

    let pipeline = Pipeline::from_config(&config)?;

    let mut reports = Vec::with_capacity(args.images.len());
    let failed = {
        let mut progress = ui.batch(args.images.len());
        for path in &args.images {
            let name = path.display().to_string();
            progress.start_image(&name);
            let report = assess(&pipeline, path);
            progress.finish_image(&name, report.is_ok());
            reports.push(report.unwrap_or_else(|err| json!({ "image": name, "error": err })));
        }
        progress.failed()
    };

    let document = if reports.len() == 1 {
        reports.remove(0)
    } else {
        Value::Array(reports)
    };
    let rendered = serde_json::to_string_pretty(&document)?;
    match &args.output {
        Some(path) => std::fs::write(path, format!("{rendered}\n"))
            .map_err(|e| anyhow!("failed to write {}: {}", path.display(), e))?,
        None => println!("{rendered}"),
    }

    if failed > 0 {
        return Err(anyhow!("{} of {} image(s) failed", failed, args.images.len()));
    }
    Ok(())
}

fn assess(pipeline: &Pipeline, path: &std::path::Path) -> Result<Value, String> {
    let image = ImageInput::open(path).map_err(|err| err.to_string())?;
    let result = pipeline.run(&image).map_err(|err| err.to_string())?;
    serde_json::to_value(&result).map_err(|err| err.to_string())
}
