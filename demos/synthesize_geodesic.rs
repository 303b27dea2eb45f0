//! Synthesize a geodesic between two small images under a frozen conv front end, then resume it
//! from disk.
//!
//! Run: `RUST_LOG=geodesics=debug cargo run --example synthesize_geodesic`

use burn_core::tensor::backend::Backend;
use burn_core::tensor::{Tensor, TensorData};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::EnvFilter;

use geodesics::diagnostics::deviation_curves;
use geodesics::straightness::{sample_brownian_bridge, translation_sequence};
use geodesics::{ConvFrontEnd, Geodesic, GeodesicBackend, GeodesicConfig, SynthesisConfig};

type B = GeodesicBackend;

fn main() -> geodesics::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let device = <B as Backend>::Device::default();
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let side = 16;
    let values: Vec<f32> = (0..side * side).map(|_| 0.2 + 0.6 * rng.random::<f32>()).collect();
    let image_a = Tensor::<B, 4>::from_data(TensorData::new(values, [1, 1, side, side]), &device);

    // The end point is a translated copy, so a natural video between the anchors exists.
    let n_steps = 8;
    let video = translation_sequence(image_a.clone(), n_steps)?;
    let image_b = video.clone().narrow(0, n_steps, 1);

    let model = ConvFrontEnd::<B>::new(&device, 1, 8, 5, 1)?;
    let config = GeodesicConfig::new().with_n_steps(n_steps);
    let init = sample_brownian_bridge(image_a.clone(), image_b.clone(), n_steps, 0.5, 7)?;
    let init = init.clamp(0.0, 1.0);
    let mut geo = Geodesic::new(image_a.clone(), image_b.clone(), model, &config, Some(init))?;

    let synthesis = SynthesisConfig::new()
        .with_max_iter(100)
        .with_store_progress(10);
    let outcome = geo.synthesize(&synthesis, None)?;
    println!(
        "first run: {outcome:?}, loss {:.4} -> {:.4}",
        geo.losses()[0],
        geo.losses()[geo.losses().len() - 1]
    );

    let path = std::env::temp_dir().join("geodesics_demo.mpk");
    geo.save(&path)?;

    let model = ConvFrontEnd::<B>::new(&device, 1, 8, 5, 1)?;
    let mut resumed = Geodesic::new(image_a, image_b, model, &config, None)?;
    resumed.load(&path)?;
    let outcome = resumed.synthesize(&synthesis, None)?;
    println!(
        "resumed run: {outcome:?}, {} iterations in total",
        resumed.losses().len()
    );

    let curves = deviation_curves(&resumed, Some(video))?;
    let mid = n_steps / 2;
    println!(
        "midpoint distance from the line (normalized): pixelfade {:.4}, geodesic {:.4}, video {:.4}",
        curves.pixelfade.from[mid],
        curves.geodesic.from[mid],
        curves.natural_video.map_or(f64::NAN, |c| c.from[mid]),
    );
    let jerk = resumed.calculate_jerkiness(None)?;
    println!("jerkiness per interior frame: {}", jerk);
    Ok(())
}
