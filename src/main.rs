use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use serde::Serialize;

use spanfill::analysis::pairs::{ModePair, PairCriteria};
use spanfill::data::loader::{load_file, save_file};
use spanfill::filler::FillReport;
use spanfill::{Analyzer, AnalyzerConfig, Field, FillConfig, Filler, TestMode};

#[derive(Parser)]
#[command(name = "spanfill")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Spectral analysis and gap filling of gridded time series")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fill the missing values of one or more fields sharing a time axis
    Fill {
        /// Input files (.json, .csv, .parquet)
        #[arg(required = true, num_args = 1.., value_name = "FILE")]
        inputs: Vec<PathBuf>,

        /// Output directory
        #[arg(short, long, default_value = ".", value_name = "DIR")]
        output: PathBuf,

        /// JSON configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Maximum number of PCA modes
        #[arg(long)]
        npca: Option<usize>,

        /// Maximum number of MSSA modes
        #[arg(long)]
        nmssa: Option<usize>,

        /// MSSA window length
        #[arg(long)]
        window: Option<usize>,

        /// Skip the MSSA stage
        #[arg(long)]
        no_mssa: bool,

        /// Regimes used to choose the number of modes
        #[arg(long, value_enum)]
        testmode: Option<TestModeArg>,

        /// Seed of the cross-validation mask
        #[arg(long)]
        seed: Option<u64>,

        /// Stop iterating after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Decompose fields and print eigenvalues and MSSA pairs as JSON
    Decompose {
        #[arg(required = true, num_args = 1.., value_name = "FILE")]
        inputs: Vec<PathBuf>,

        #[arg(long, default_value_t = 10)]
        npca: usize,

        /// Also run MSSA on the PCA coefficients with this many modes
        #[arg(long)]
        nmssa: Option<usize>,

        #[arg(long)]
        window: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TestModeArg {
    CrossValidation,
    SelfValidation,
    Normal,
}

impl From<TestModeArg> for TestMode {
    fn from(arg: TestModeArg) -> Self {
        match arg {
            TestModeArg::CrossValidation => TestMode::CrossValidation,
            TestModeArg::SelfValidation => TestMode::SelfValidation,
            TestModeArg::Normal => TestMode::Normal,
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Commands::Fill {
            inputs,
            output,
            config,
            npca,
            nmssa,
            window,
            no_mssa,
            testmode,
            seed,
            timeout,
        } => {
            let mut cfg = match config {
                Some(path) => FillConfig::from_json_file(&path)?,
                None => FillConfig::default(),
            };
            if let Some(n) = npca {
                cfg.npca = n;
            }
            if let Some(n) = nmssa {
                cfg.nmssa = n;
            }
            if window.is_some() {
                cfg.window = window;
            }
            if no_mssa {
                cfg.mssa = false;
            }
            if let Some(mode) = testmode {
                cfg.testmode = mode.into();
            }
            if let Some(seed) = seed {
                cfg.cross_validation.seed = seed;
            }
            run_fill(&inputs, &output, cfg, timeout.map(Duration::from_secs))
        }
        Commands::Decompose {
            inputs,
            npca,
            nmssa,
            window,
        } => run_decompose(&inputs, npca, nmssa, window),
    }
}

// ---------------------------------------------------------------------------
// fill
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct FillSummary<'a> {
    config: &'a FillConfig,
    stages: Vec<StageSummary>,
    report: &'a FillReport,
}

#[derive(Serialize)]
struct StageSummary {
    kind: String,
    modes: usize,
}

fn run_fill(inputs: &[PathBuf], output: &Path, cfg: FillConfig, timeout: Option<Duration>) -> Result<()> {
    let (fields, sources) = load_all(inputs)?;
    std::fs::create_dir_all(output).with_context(|| format!("creating {}", output.display()))?;

    let mut filler = Filler::new(&fields, cfg.clone()).context("setting up the filler")?;
    if let Some(t) = timeout {
        filler = filler.with_deadline(Instant::now() + t);
    }
    let outcome = filler.run().context("filling")?;

    for ((filled, filtered), source) in outcome.filled.iter().zip(&outcome.filtered).zip(&sources) {
        for (suffix, field) in [("filled", filled), ("filtered", filtered)] {
            let path = output_path(output, source, &field.name, suffix);
            save_file(&path, field).with_context(|| format!("writing {}", path.display()))?;
            info!("Wrote {}", path.display());
        }
    }

    let summary = FillSummary {
        config: &cfg,
        stages: outcome
            .stages
            .iter()
            .map(|s| StageSummary {
                kind: s.kind.to_string(),
                modes: s.modes,
            })
            .collect(),
        report: &outcome.report,
    };
    let report_path = output.join("fill-report.json");
    let text = serde_json::to_string_pretty(&summary).context("serializing report")?;
    std::fs::write(&report_path, text).with_context(|| format!("writing {}", report_path.display()))?;
    println!("Filled {} field(s); report in {}", outcome.filled.len(), report_path.display());
    Ok(())
}

/// `<dir>/<stem>[-<name>].<suffix>.<ext>`; the field name is added when a
/// file held several fields.
fn output_path(dir: &Path, source: &(PathBuf, bool), name: &str, suffix: &str) -> PathBuf {
    let (path, multi) = source;
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("field");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
    let base = if *multi { format!("{stem}-{name}") } else { stem.to_string() };
    dir.join(format!("{base}.{suffix}.{ext}"))
}

/// Fields of every input, with the file each came from and whether that
/// file held more than one.
fn load_all(inputs: &[PathBuf]) -> Result<(Vec<Field>, Vec<(PathBuf, bool)>)> {
    let mut fields = Vec::new();
    let mut sources = Vec::new();
    for path in inputs {
        let loaded = load_file(path).with_context(|| format!("loading {}", path.display()))?;
        let multi = loaded.len() > 1;
        for field in loaded {
            info!("Loaded {field}");
            sources.push((path.clone(), multi));
            fields.push(field);
        }
    }
    if fields.is_empty() {
        bail!("no field to process");
    }
    Ok((fields, sources))
}

// ---------------------------------------------------------------------------
// decompose
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ModeSummary {
    kind: String,
    eigenvalues: Vec<f64>,
    explained_variance: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pairs: Option<Vec<ModePair>>,
}

fn run_decompose(inputs: &[PathBuf], npca: usize, nmssa: Option<usize>, window: Option<usize>) -> Result<()> {
    let (fields, _) = load_all(inputs)?;
    let config = AnalyzerConfig {
        npca,
        nmssa: nmssa.unwrap_or(AnalyzerConfig::default().nmssa),
        window,
        keep_invalids: true,
        ..AnalyzerConfig::default()
    };
    let mut analyzer = Analyzer::new(&fields, config).context("packing fields")?;

    let mut summaries = Vec::new();
    let pca = analyzer.pca()?;
    summaries.push(ModeSummary {
        kind: pca.kind.to_string(),
        eigenvalues: pca.eigenvalues.to_vec(),
        explained_variance: pca.explained_variance().to_vec(),
        pairs: None,
    });
    if nmssa.is_some() {
        let mssa = analyzer.mssa(true)?;
        let mut summary = ModeSummary {
            kind: mssa.kind.to_string(),
            eigenvalues: mssa.eigenvalues.to_vec(),
            explained_variance: mssa.explained_variance().to_vec(),
            pairs: None,
        };
        summary.pairs = Some(analyzer.pairs(PairCriteria::default())?);
        summaries.push(summary);
    }
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}
