#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use readerstudy::analysis::{GeeOutcome, ReaderReport, analyze_cohort, select_reader};
use readerstudy::config::AnalysisConfig;
use readerstudy::data::load_readings;
use readerstudy::dca::{self, ThresholdGrid};
use readerstudy::gee::STRATEGY_COVARIATE;

#[derive(Args)]
pub struct AnalyzeArgs {
    /// Path to the cohort TSV file with patient_id,strategy,ground_truth,prediction columns
    pub cohort: PathBuf,

    /// Path to an analysis configuration file (.toml); missing keys take defaults
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of bootstrap replicates
    #[arg(long, value_name = "N")]
    pub iterations: Option<usize>,

    /// Base seed for the bootstrap
    #[arg(long, conflicts_with = "unseeded")]
    pub seed: Option<u64>,

    /// Draw the bootstrap seed from entropy (the drawn seed is recorded in the report)
    #[arg(long)]
    pub unseeded: bool,

    /// Confidence level of the bootstrap percentile intervals
    #[arg(long)]
    pub confidence: Option<f64>,

    /// Run bootstrap replicates on a single thread
    #[arg(long)]
    pub sequential: bool,

    /// Analyse only this reader
    #[arg(long)]
    pub reader: Option<String>,

    /// Where to write the analysis report
    #[arg(long, default_value = "results.toml")]
    pub out: PathBuf,
}

#[derive(Args)]
pub struct NetBenefitArgs {
    /// True positives
    #[arg(long)]
    pub tp: u64,

    /// False positives
    #[arg(long)]
    pub fp: u64,

    /// Number of patients
    #[arg(long)]
    pub n: u64,

    /// Threshold probabilities; defaults to the configured grid
    #[arg(long = "threshold", value_name = "PT")]
    pub thresholds: Vec<f64>,
}

#[derive(Parser)]
#[command(
    name = "readerstudy",
    about = "Cluster-robust inference for multi-reader diagnostic studies",
    long_about = "Compares AI-assisted and unaided reads with a patient-clustered GEE, a \
                 patient-level bootstrap and decision-curve analysis."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full analysis on a cohort file
    #[command(about = "Analyse a reader-study cohort (outputs: results.toml)")]
    Analyze(AnalyzeArgs),
    /// Net benefit of a confusion matrix across thresholds
    #[command(about = "Compute a decision curve from confusion-matrix counts")]
    NetBenefit(NetBenefitArgs),
    #[command(about = "Display version information")]
    Version,
}

fn main() {
    env_logger::init();
    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Analyze(args)) => analyze(args),
        Some(Commands::NetBenefit(args)) => net_benefit(args),
        Some(Commands::Version) => {
            println!("readerstudy {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command().print_help().map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

pub fn analyze(args: AnalyzeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            println!("Loading configuration from: {}", path.display());
            AnalysisConfig::load(path)?
        }
        None => AnalysisConfig::default(),
    };
    if let Some(iterations) = args.iterations {
        config.bootstrap.n_iterations = iterations;
    }
    if let Some(seed) = args.seed {
        config.bootstrap.seed = Some(seed);
    }
    if args.unseeded {
        config.bootstrap.seed = None;
    }
    if let Some(confidence) = args.confidence {
        config.bootstrap.confidence_level = confidence;
    }
    if args.sequential {
        config.bootstrap.parallel = false;
    }

    println!("Loading cohort from: {}", args.cohort.display());
    let mut readings = load_readings(&args.cohort)?;
    if let Some(reader) = &args.reader {
        readings = select_reader(readings, reader)?;
    }
    println!("Loaded {} readings", readings.len());

    let report = analyze_cohort(readings, &config)?;
    for reader in &report.readers {
        print_reader_summary(reader);
    }

    report.save(&args.out)?;
    println!("\nReport saved to: {}", args.out.display());
    Ok(())
}

fn print_reader_summary(reader: &ReaderReport) {
    println!("\n=== Reader {} ===", reader.reader);
    println!(
        "{} readings from {} patients",
        reader.n_readings, reader.n_patients
    );

    let bootstrap = &reader.patient_bootstrap;
    println!(
        "\nPatient-level metrics ({} replicates, {:.0}% CI, seed {}{})",
        bootstrap.first.n_iterations,
        bootstrap.first.confidence_level * 100.0,
        bootstrap.first.seed,
        if bootstrap.first.seeded { "" } else { ", unseeded" }
    );
    println!(
        "{:<12} {:>22} {:>22} {:>24}",
        "metric", "assisted", "unaided", "delta"
    );
    for ((a, u), d) in bootstrap
        .first
        .metrics
        .iter()
        .zip(&bootstrap.second.metrics)
        .zip(&bootstrap.delta)
    {
        println!(
            "{:<12} {:.3} [{:.3}, {:.3}] {:.3} [{:.3}, {:.3}] {:+.3} [{:+.3}, {:+.3}]{}",
            a.name,
            a.estimate,
            a.ci_lower,
            a.ci_upper,
            u.estimate,
            u.ci_lower,
            u.ci_upper,
            d.summary.estimate,
            d.summary.ci_lower,
            d.summary.ci_upper,
            if d.significant { " *" } else { "" }
        );
    }

    match &reader.gee {
        GeeOutcome::Fitted(gee) => {
            if let Some(effect) = gee
                .coefficients
                .iter()
                .find(|c| c.name == STRATEGY_COVARIATE)
            {
                println!(
                    "\nGEE (exchangeable, alpha = {:.3}): OR = {:.3} [{:.3}, {:.3}], p = {:.4}",
                    gee.alpha,
                    effect.odds_ratio,
                    effect.odds_ratio_ci_lower,
                    effect.odds_ratio_ci_upper,
                    effect.p_value
                );
            }
        }
        GeeOutcome::Failed { message, .. } => {
            println!("\nGEE: model was not fitted ({message})");
        }
    }

    let curve = &reader.decision_curve;
    println!(
        "\nDecision curve: max delta net benefit {:+.4} at threshold {:.3}",
        curve.max_delta.value, curve.max_delta.threshold
    );
    match &curve.assisted_better_range {
        Some(range) => println!(
            "Assisted is better at thresholds [{:.3}, {:.3}] ({}/{} points)",
            range.lower,
            range.upper,
            range.count,
            curve.thresholds.len()
        ),
        None => println!("Assisted is not better at any threshold in the analysed range."),
    }
}

pub fn net_benefit(args: NetBenefitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let points = if args.thresholds.is_empty() {
        let grid = AnalysisConfig::default().dca.grid()?;
        dca::curve_on_grid(args.tp, args.fp, args.n, &grid)?
    } else {
        let grid = ThresholdGrid::from_values(args.thresholds.iter().copied())?;
        dca::curve_on_grid(args.tp, args.fp, args.n, &grid)?
    };

    println!("threshold\tnet_benefit");
    for point in points {
        println!("{:.4}\t{:.6}", point.threshold, point.net_benefit);
    }
    Ok(())
}
