//! Raman titration analysis.
//!
//! Usage:
//!   raman-titration assemble --spectra data/ --metadata meta.csv --out combined.csv
//!   raman-titration analyze --spectra data/ --metadata meta.csv --preset 785 --out-dir results/
//!   raman-titration concentrations --volumes volumes.csv --tube-map tubes.csv --out meta.csv

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use raman_titration::analysis::{peaks, sigmoid::EquivalenceFitter};
use raman_titration::data::loader::{collect_spectrum_paths, load_metadata};
use raman_titration::data::metadata::{build_metadata, TubeMap, VolumeTable};
use raman_titration::export::{self, ExportFormat};
use raman_titration::{assemble, AnalysisConfig, AssembleOptions, Assembly, PeakPreset};

#[derive(Parser)]
#[command(name = "raman-titration")]
#[command(about = "Baseline-correct Raman spectra, track peak ratios and fit the equivalence point")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Correct and join spectra to metadata, write the tidy combined table
    Assemble {
        #[command(flatten)]
        input: InputArgs,

        /// Output CSV
        #[arg(long)]
        out: PathBuf,
    },
    /// Full pipeline: peak intensities, ratios and sigmoid fits
    Analyze {
        #[command(flatten)]
        input: InputArgs,

        /// Peak positions in cm⁻¹ (comma-separated); overrides the preset
        #[arg(long, value_delimiter = ',')]
        peaks: Vec<f64>,

        /// Peak preset for the excitation laser (532 or 785)
        #[arg(long)]
        preset: Option<PeakPreset>,

        /// Half-width of the peak window (cm⁻¹)
        #[arg(long)]
        tolerance: Option<f64>,

        /// Output format of the peak and ratio tables
        #[arg(long, value_enum, default_value_t = ExportFormat::Csv)]
        format: ExportFormat,

        /// Output directory
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Compute per-spectrum concentrations from a pipetting plan
    Concentrations {
        /// Volume table (reagent, stock concentration, unit, one column per tube)
        #[arg(long)]
        volumes: PathBuf,

        /// Spectrum name → tube map
        #[arg(long)]
        tube_map: PathBuf,

        /// Titrant reagent (detected by name when omitted)
        #[arg(long)]
        titrant: Option<String>,

        /// Output CSV
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Args)]
struct InputArgs {
    /// Spectrum files or directories of `.txt` files
    #[arg(long, num_args = 1.., required = true)]
    spectra: Vec<PathBuf>,

    /// Metadata table (.csv, .json or .parquet)
    #[arg(long)]
    metadata: PathBuf,

    /// JSON configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Baseline polynomial order
    #[arg(long)]
    poly_order: Option<usize>,

    /// Sample label to exclude (repeatable); replaces the configured list
    #[arg(long)]
    exclude: Vec<String>,

    /// Metadata column holding the titrant amount
    #[arg(long)]
    titrant_column: Option<String>,
}

impl InputArgs {
    fn config(&self) -> Result<AnalysisConfig> {
        let mut cfg = match &self.config {
            Some(path) => AnalysisConfig::from_file(path)
                .with_context(|| format!("reading config {}", path.display()))?,
            None => AnalysisConfig::default(),
        };
        if let Some(order) = self.poly_order {
            cfg.poly_order = order;
        }
        if !self.exclude.is_empty() {
            cfg.exclude_labels = self.exclude.clone();
        }
        if let Some(col) = &self.titrant_column {
            cfg.titrant_column = col.clone();
        }
        Ok(cfg)
    }

    fn assemble(&self, cfg: &AnalysisConfig) -> Result<Assembly> {
        let paths = collect_spectrum_paths(&self.spectra).context("listing spectrum files")?;
        let metadata = load_metadata(&self.metadata)
            .with_context(|| format!("reading metadata {}", self.metadata.display()))?;
        let assembly = assemble(&paths, &metadata, &AssembleOptions::from(cfg))
            .context("assembling spectra")?;
        for failure in &assembly.failures {
            warn!("skipped: {failure}");
        }
        Ok(assembly)
    }
}

fn main() -> Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Command::Assemble { input, out } => {
            let cfg = input.config()?;
            let assembly = input.assemble(&cfg)?;
            export::write_combined_csv(&assembly.table, &out)
                .with_context(|| format!("writing {}", out.display()))?;
        }
        Command::Analyze {
            input,
            peaks,
            preset,
            tolerance,
            format,
            out_dir,
        } => {
            let mut cfg = input.config()?;
            if !peaks.is_empty() {
                cfg.peaks = peaks;
            }
            if preset.is_some() {
                cfg.preset = preset;
            }
            if let Some(t) = tolerance {
                cfg.tolerance = t;
            }
            analyze(&input, &cfg, format, &out_dir)?;
        }
        Command::Concentrations {
            volumes,
            tube_map,
            titrant,
            out,
        } => {
            let volumes = VolumeTable::load(&volumes)
                .with_context(|| format!("reading volumes {}", volumes.display()))?;
            let map = TubeMap::load(&tube_map)
                .with_context(|| format!("reading tube map {}", tube_map.display()))?;
            let conc = volumes.concentrations();
            let table = build_metadata(&map, Some(&conc), titrant.as_deref())?;
            export::write_metadata_csv(&table, &out)
                .with_context(|| format!("writing {}", out.display()))?;
        }
    }
    Ok(())
}

fn analyze(input: &InputArgs, cfg: &AnalysisConfig, format: ExportFormat, out_dir: &Path) -> Result<()> {
    let positions = cfg.peak_positions();
    if positions.len() < 2 {
        warn!("{} peak(s) requested, no ratios will be computed", positions.len());
    }
    let assembly = input.assemble(cfg)?;
    let (intensities, series) = peaks::analyze(&assembly.table, &positions, cfg.tolerance);

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;
    let ext = format.extension();
    export::write_intensities(&intensities, &out_dir.join(format!("peak_intensities.{ext}")), format)?;
    export::write_ratios(&series, &out_dir.join(format!("ratios.{ext}")), format)?;

    let fits = EquivalenceFitter::new(&cfg.fit).fit_all(&series);
    export::write_fits_json(&fits, &out_dir.join("fits.json"))?;

    println!("{}", export::preview(&export::intensities_batch(&intensities)?, 20)?);
    for (ratio, res) in &fits {
        match res {
            Ok(fit) => println!(
                "{ratio}: x_eq = {:.4e} mol ± {:.2e}",
                fit.x_eq,
                fit.x_eq_uncertainty().unwrap_or(f64::NAN)
            ),
            Err(err) => println!("{ratio}: no fit ({err})"),
        }
    }
    let ok = fits.iter().filter(|(_, r)| r.is_ok()).count();
    info!("{ok}/{} ratio(s) fitted", fits.len());
    Ok(())
}
