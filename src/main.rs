use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "htr-pipeline",
    version,
    about = "Order handwritten-page regions and lines from segmentation output"
)]
struct Cli {
    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "settings", global = true)]
    settings: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Filter, deduplicate and order text regions of a page
    Regions(StageArgs),
    /// Filter, deduplicate and order text lines of a region image
    Lines {
        #[command(flatten)]
        stage: StageArgs,

        /// Band tolerance in median line heights
        #[arg(long = "line-spacing-factor")]
        line_spacing_factor: Option<f32>,

        /// Print an empty list instead of failing when no lines survive
        #[arg(long = "lenient")]
        lenient: bool,
    },
}

#[derive(Args, Debug)]
struct StageArgs {
    /// Page or region image
    image: PathBuf,

    /// Segmentation output as JSON ({width, height, instances: [{score, polygon}]})
    #[arg(short = 'p', long = "predictions")]
    predictions: PathBuf,

    /// Minimum instance score (0-1)
    #[arg(short = 's', long = "pred-score-threshold")]
    pred_score_threshold: Option<f32>,

    /// Containment ratio at which an instance counts as absorbed (0-1)
    #[arg(short = 'c', long = "containments-threshold")]
    containments_threshold: Option<f32>,

    /// Write an overlay PNG of the kept instances
    #[arg(long = "visualize")]
    visualize: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    htr_pipeline_rust::logging::init(cli.verbose)?;

    let (command, stage, line_spacing_factor, lenient) = match cli.command {
        CliCommand::Regions(stage) => (htr_pipeline_rust::Command::Regions, stage, None, false),
        CliCommand::Lines {
            stage,
            line_spacing_factor,
            lenient,
        } => (
            htr_pipeline_rust::Command::Lines,
            stage,
            line_spacing_factor,
            lenient,
        ),
    };

    let output = htr_pipeline_rust::run(htr_pipeline_rust::Config {
        command,
        image: stage.image,
        predictions: stage.predictions,
        settings_path: cli.settings,
        pred_score_threshold: stage.pred_score_threshold,
        containments_threshold: stage.containments_threshold,
        line_spacing_factor,
        visualize: stage.visualize,
        lenient,
    })?;

    println!("{}", output);
    Ok(())
}
