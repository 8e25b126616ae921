use std::f64::consts::PI;
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::{Array3, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use spanfill::data::loader::save_file;
use spanfill::Field;

const N_TIMES: usize = 160;
const NY: usize = 6;
const NX: usize = 8;

/// Box-Muller transform for normal distribution
fn gauss(rng: &mut ChaCha8Rng, mean: f64, std_dev: f64) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(1e-15);
    let u2: f64 = rng.gen();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
    mean + std_dev * z
}

/// Eastward travelling wave plus a standing seasonal cycle.
fn signal(t: usize, y: usize, x: usize) -> f64 {
    let (t, y, x) = (t as f64, y as f64, x as f64);
    let wave = (2.0 * PI * (t / 24.0 - x / NX as f64)).sin() * (1.0 + 0.2 * y);
    let season = 0.5 * (2.0 * PI * t / 80.0).cos() * (y / NY as f64 - 0.5);
    10.0 + wave + season
}

fn main() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    let mut values = Array3::from_shape_fn((N_TIMES, NY, NX), |(t, y, x)| signal(t, y, x));
    values.mapv_inplace(|v| v + gauss(&mut rng, 0.0, 0.05));

    // rectangular cloud over a few grid points
    for t in 60..75 {
        for y in 1..3 {
            for x in 2..5 {
                values[[t, y, x]] = f64::NAN;
            }
        }
    }
    // whole field missing for a short period
    for t in 110..114 {
        values.index_axis_mut(Axis(0), t).fill(f64::NAN);
    }
    // permanently masked point
    values.slice_mut(ndarray::s![.., NY - 1, NX - 1]).fill(f64::NAN);

    let field = Field::new("wave", values.into_dyn()).context("building sample field")?;
    for output in ["sample_data.json", "sample_data.parquet"] {
        save_file(Path::new(output), &field).with_context(|| format!("writing {output}"))?;
    }

    println!(
        "Wrote {} ({} missing values) to sample_data.json and sample_data.parquet",
        field,
        field.missing_count()
    );
    Ok(())
}
