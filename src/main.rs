use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use ocrlabel::{
    aggregate, cropper, draw, BatchSummary, Config, PipelineBuilder, RunSummary, JSON_RESULTS,
    VISUALIZATION,
};
use tracing_subscriber::{filter::LevelFilter, fmt::format::FmtSpan, EnvFilter};

const DEFAULT_CONFIG: &str = "ocrlabel.toml";

#[derive(Parser)]
#[command(name = "ocrlabel")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Detect, crop and recognize handwritten text regions for OCR training data", long_about = None)]
struct Cli {
    /// Pipeline configuration (TOML). Defaults to ./ocrlabel.toml when present
    #[arg(long, short, global = true, env = "OCRLABEL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect, crop, recognize and report one page
    Run {
        /// Page image to process
        #[arg(long)]
        image: Option<PathBuf>,

        /// ONNX detector model
        #[arg(long)]
        model: Option<PathBuf>,

        /// Recognition service credentials (JSON)
        #[arg(long, env = "OCRLABEL_CREDENTIALS")]
        credentials: Option<PathBuf>,
    },
    /// Detect and crop one page, or every page of a directory, without
    /// recognition
    Detect {
        /// Page image to process
        #[arg(long, conflicts_with = "input_dir")]
        image: Option<PathBuf>,

        /// Process every .png/.jpg/.jpeg in this directory
        #[arg(long)]
        input_dir: Option<PathBuf>,

        /// ONNX detector model
        #[arg(long)]
        model: Option<PathBuf>,
    },
    /// Recognize an existing crop directory and write reports
    Recognize {
        /// Directory holding the crops and processed_results.json
        #[arg(long)]
        crops_dir: Option<PathBuf>,

        /// Recognition service credentials (JSON)
        #[arg(long, env = "OCRLABEL_CREDENTIALS")]
        credentials: Option<PathBuf>,
    },
    /// Shade recognized regions on the page image
    Draw {
        /// Page image the results belong to
        #[arg(long)]
        image: Option<PathBuf>,

        /// json_results.json to draw. Defaults to the one in the output directory
        #[arg(long)]
        results: Option<PathBuf>,

        /// Where to write the picture
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Ok(Config::load(path)?),
        None if Path::new(DEFAULT_CONFIG).is_file() => Ok(Config::load(Path::new(DEFAULT_CONFIG))?),
        None => {
            log::info!("No {DEFAULT_CONFIG} found, using defaults");
            Ok(Config::default())
        }
    }
}

fn print_summary(summary: &RunSummary, output_dir: &Path) {
    println!("Detections:           {}", summary.detections);
    println!("Rejected boxes:       {}", summary.rejected);
    println!("Crops written:        {}", summary.crops_written);
    println!("Crop failures:        {}", summary.crop_failures);
    println!("Crops with text:      {}", summary.recognized);
    println!("Recognition failures: {}", summary.recognition_failures);
    println!("Results saved to:     {}", output_dir.display());
}

fn print_batch_summary(summary: &BatchSummary, crops_dir: &Path) {
    println!("Pages:                {}", summary.pages);
    println!("Failed pages:         {}", summary.failed_pages);
    println!("Detections:           {}", summary.detections);
    println!("Rejected boxes:       {}", summary.rejected);
    println!("Crops written:        {}", summary.crops_written);
    println!("Crop failures:        {}", summary.crop_failures);
    println!("Crops saved under:    {}", crops_dir.display());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    let start = Instant::now();

    match cli.command {
        Commands::Run {
            image,
            model,
            credentials,
        } => {
            config.paths.image = image.or(config.paths.image);
            config.paths.model = model.or(config.paths.model);
            config.paths.credentials = credentials.or(config.paths.credentials);
            let output_dir = config.paths.output_dir.clone();

            let pipeline = PipelineBuilder::new(config)
                .load_detector()
                .connect_recognizer()
                .build()?;
            let (_, summary) = pipeline.run().await?;
            print_summary(&summary, &output_dir);
        }
        Commands::Detect {
            input_dir: Some(input_dir),
            model,
            ..
        } => {
            config.paths.model = model.or(config.paths.model);
            let crops_dir = config.paths.crops_dir.clone();

            let pipeline = PipelineBuilder::new(config).load_detector().build()?;
            let summary = pipeline.detect_directory(&input_dir).await?;
            print_batch_summary(&summary, &crops_dir);
        }
        Commands::Detect { image, model, .. } => {
            config.paths.model = model.or(config.paths.model);
            let image_path = image
                .or_else(|| config.paths.image.clone())
                .context("no page image given")?;
            let page_name = image_path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "page".to_string());
            let crops_dir = config.paths.crops_dir.clone();

            let pipeline = PipelineBuilder::new(config).load_detector().build()?;
            let page = image::open(&image_path)
                .with_context(|| format!("cannot read {}", image_path.display()))?;
            let (outcome, crop_outcomes) =
                pipeline.detect_and_crop(Arc::new(page), &page_name).await?;
            let crops = cropper::exported(crop_outcomes);
            for crop in &crops {
                println!("{:>4}. {}", crop.reading_index, crop.path.display());
            }
            println!(
                "{} regions ({} rejected), {} crops written to {}",
                outcome.ordered.len(),
                outcome.rejected.len(),
                crops.len(),
                crops_dir.display()
            );
        }
        Commands::Recognize {
            crops_dir,
            credentials,
        } => {
            config.paths.credentials = credentials.or(config.paths.credentials);
            let crops_dir = crops_dir.unwrap_or_else(|| config.paths.crops_dir.clone());
            let output_dir = config.paths.output_dir.clone();

            let pipeline = PipelineBuilder::new(config).connect_recognizer().build()?;
            let (_, summary) = pipeline.recognize_directory(&crops_dir).await?;
            print_summary(&summary, &output_dir);
        }
        Commands::Draw {
            image,
            results,
            output,
        } => {
            let image_path = image
                .or_else(|| config.paths.image.clone())
                .context("no page image given")?;
            let results_path =
                results.unwrap_or_else(|| config.paths.output_dir.join(JSON_RESULTS));
            let output = output.unwrap_or_else(|| config.paths.output_dir.join(VISUALIZATION));

            let page = image::open(&image_path)
                .with_context(|| format!("cannot read {}", image_path.display()))?;
            let results = aggregate::load_results(&results_path)?;
            let font = config.font_path()?.map(draw::load_font).transpose()?;
            draw::draw_results(&page, &results, font.as_ref())
                .save(&output)
                .with_context(|| format!("cannot write {}", output.display()))?;
            println!("Visualization saved to {}", output.display());
        }
    }

    log::info!("Finished in {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}
