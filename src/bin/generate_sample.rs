//! Writes a synthetic titration series: one instrument file per tube plus a
//! `metadata.csv` ready for `raman-titration analyze`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use raman_titration::analysis::sigmoid::logistic;
use raman_titration::config::PeakPreset;
use raman_titration::synthetic::{instrument_text, shift_axis, spectrum, Band, SimpleRng};

#[derive(Parser)]
#[command(name = "generate_sample")]
#[command(about = "Write a synthetic Raman titration series")]
struct Args {
    /// Output directory
    #[arg(long, default_value = "sample_data")]
    out: PathBuf,

    /// Number of titration points
    #[arg(long, default_value = "12")]
    points: usize,

    /// Largest titrant amount (mol)
    #[arg(long, default_value = "2e-9")]
    max_amount: f64,

    /// Equivalence point (mol)
    #[arg(long, default_value = "8e-10")]
    x_eq: f64,

    /// Noise standard deviation (counts)
    #[arg(long, default_value = "2.0")]
    noise: f64,

    #[arg(long, default_value = "42")]
    seed: u64,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let mut rng = SimpleRng::new(args.seed);

    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("creating {}", args.out.display()))?;

    let shift = shift_axis(200.0, 1800.0, 1601);
    let peaks = PeakPreset::Laser532.peaks();
    // The first band tracks the titration, the others stay put.
    let k = 12.0 / args.max_amount;

    let mut meta = csv::WriterBuilder::new()
        .delimiter(b';')
        .from_path(args.out.join("metadata.csv"))
        .context("creating metadata.csv")?;
    meta.write_record(["Spectrum name", "Tube", "Sample description", "n(titrant) (mol)"])?;

    let n = args.points.max(2);
    for i in 0..=n {
        // The last file is the blank cuvette, which the analysis excludes.
        let blank = i == n;
        let amount = args.max_amount * i.min(n - 1) as f64 / (n - 1) as f64;
        let ratio = logistic(amount, 0.4, 1.2, k, args.x_eq);

        let bands: Vec<Band> = peaks
            .iter()
            .enumerate()
            .map(|(j, &center)| Band {
                center,
                sigma: 4.0,
                height: match (blank, j) {
                    (true, _) => 0.0,
                    (false, 0) => 200.0 * ratio,
                    (false, _) => 200.0,
                },
            })
            .collect();
        let background = [300.0 + rng.gauss(0.0, 20.0), 150.0, -80.0];
        let sp = spectrum(&shift, &bands, background, args.noise, &mut rng);

        let name = format!("Titration_{i:02}");
        let path = args.out.join(format!("{name}.txt"));
        std::fs::write(&path, instrument_text(&sp, &name))
            .with_context(|| format!("writing {}", path.display()))?;

        let tube = if blank {
            "Cuvette BRB".to_string()
        } else {
            format!("Tube {}", i + 1)
        };
        let amount_cell = if blank { String::new() } else { amount.to_string() };
        meta.write_record([name.as_str(), tube.as_str(), tube.as_str(), amount_cell.as_str()])?;
    }
    meta.flush()?;

    println!(
        "Wrote {} spectra ({} points each) and metadata.csv to {}",
        n + 1,
        shift.len(),
        args.out.display()
    );
    Ok(())
}
