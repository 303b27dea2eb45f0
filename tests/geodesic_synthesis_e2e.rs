use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::{DType, FloatDType, Tensor, TensorData};
use burn_optim::SgdConfig;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use geodesics::straightness::{make_straight_line, sample_brownian_bridge};
use geodesics::{
    AmsGrad, BurnOptimizer, ConvFrontEnd, Error, Geodesic, GeodesicBackend, GeodesicConfig,
    Identity, InteriorFrames, Result, SequenceOptimizer, SynthesisConfig, SynthesisOutcome,
    SynthesisStatus,
};

type B = GeodesicBackend;

fn device() -> <B as Backend>::Device {
    <B as Backend>::Device::default()
}

/// Smooth-ish random image in `[0.1, 0.9]`.
fn image(seed: u64, channels: usize, side: usize) -> Tensor<B, 4> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let values: Vec<f32> = (0..channels * side * side)
        .map(|_| 0.1 + 0.8 * rng.random::<f32>())
        .collect();
    Tensor::from_data(TensorData::new(values, [1, channels, side, side]), &device())
}

fn host(t: Tensor<B, 4>) -> Vec<f32> {
    t.into_data().convert::<f32>().to_vec().expect("f32 data")
}

fn conv_engine(n_steps: usize) -> Result<Geodesic<B, ConvFrontEnd<B>>> {
    let model = ConvFrontEnd::<B>::new(&device(), 1, 4, 3, 0)?;
    Geodesic::new(
        image(1, 1, 8),
        image(2, 1, 8),
        model,
        &GeodesicConfig::new().with_n_steps(n_steps),
        None,
    )
}

fn quick(max_iter: usize) -> SynthesisConfig {
    SynthesisConfig::new().with_max_iter(max_iter)
}

#[test]
fn endpoints_stay_pinned_through_synthesis() -> Result<()> {
    let mut geo = conv_engine(5)?;
    let a = host(geo.image_a());
    let b = host(geo.image_b());

    let outcome = geo.synthesize(&quick(5), None)?;
    assert_eq!(outcome, SynthesisOutcome::MaxIterReached { iterations: 5 });
    assert_eq!(geo.status(), SynthesisStatus::MaxIterReached);

    let path = geo.geodesic();
    assert_eq!(path.dims(), [6, 1, 8, 8]);
    assert_eq!(host(path.clone().narrow(0, 0, 1)), a);
    assert_eq!(host(path.narrow(0, 5, 1)), b);
    assert_eq!(host(geo.image_a()), a);
    Ok(())
}

#[test]
fn synthesis_moves_the_interior_and_records_histories() -> Result<()> {
    let mut geo = conv_engine(4)?;
    let before = host(geo.geodesic());
    geo.synthesize(&quick(10), None)?;

    assert_eq!(geo.losses().len(), 10);
    assert_eq!(geo.gradient_norm().len(), 10);
    assert_eq!(geo.pixel_change_norm().len(), 10);
    assert!(geo.losses().iter().all(|l| l.is_finite()));
    assert!(geo.pixel_change_norm().iter().all(|&c| c > 0.0));
    assert_ne!(host(geo.geodesic()), before);
    Ok(())
}

#[test]
fn resumed_synthesis_appends_to_the_histories() -> Result<()> {
    let mut geo = conv_engine(4)?;
    geo.synthesize(&quick(5), None)?;
    let first_losses = geo.losses().to_vec();
    geo.synthesize(&quick(5), None)?;

    assert_eq!(geo.losses().len(), 10);
    assert_eq!(geo.gradient_norm().len(), 10);
    assert_eq!(geo.pixel_change_norm().len(), 10);
    assert_eq!(&geo.losses()[..5], &first_losses[..]);
    Ok(())
}

#[test]
fn supplying_a_second_optimizer_is_rejected() -> Result<()> {
    let mut geo = conv_engine(3)?;
    geo.synthesize(&quick(2), None)?;

    let replacement: Box<dyn SequenceOptimizer<B>> = Box::new(AmsGrad::<B>::default());
    let err = geo.synthesize(&quick(2), Some(replacement)).unwrap_err();
    assert!(matches!(err, Error::OptimizerAlreadySet));
    assert_eq!(geo.losses().len(), 2);

    // The original optimizer is still there.
    geo.synthesize(&quick(2), None)?;
    assert_eq!(geo.losses().len(), 4);
    Ok(())
}

#[test]
fn snapshots_follow_store_progress() -> Result<()> {
    for store_progress in [1usize, 3, 4] {
        let mut geo = conv_engine(4)?;
        let config = quick(10).with_store_progress(store_progress);
        geo.synthesize(&config, None)?;

        let expected = 10usize.div_ceil(store_progress);
        assert_eq!(geo.step_energy().dim(), (expected, 4));
        assert_eq!(geo.dev_from_line().dim(), (expected, 5, 2));
        assert!(geo.step_energy().iter().all(|&e| e >= 0.0));

        // Resuming continues the global count.
        geo.synthesize(&quick(5).with_store_progress(store_progress), None)?;
        assert_eq!(geo.step_energy().dim().0, 15usize.div_ceil(store_progress));
    }
    Ok(())
}

#[test]
fn snapshots_are_off_by_default() -> Result<()> {
    let mut geo = conv_engine(3)?;
    geo.synthesize(&quick(4), None)?;
    assert_eq!(geo.step_energy().dim(), (0, 3));
    assert_eq!(geo.dev_from_line().dim(), (0, 4, 2));
    Ok(())
}

#[test]
fn a_loose_stop_criterion_stops_after_the_window() -> Result<()> {
    let mut geo = conv_engine(4)?;
    let config = quick(100)
        .with_stop_criterion(Some(1e9))
        .with_stop_iters_to_check(2);
    let outcome = geo.synthesize(&config, None)?;
    assert_eq!(outcome, SynthesisOutcome::Converged { iterations: 2 });
    assert_eq!(geo.status(), SynthesisStatus::Converged);
    assert_eq!(geo.losses().len(), 2);
    Ok(())
}

#[test]
fn identity_model_pulls_a_bridge_back_to_the_straight_line() -> Result<()> {
    let a = image(3, 1, 6);
    let b = image(4, 1, 6);
    let n_steps = 6;
    let bridge = sample_brownian_bridge(a.clone(), b.clone(), n_steps, 0.5, 9)?;
    let line = make_straight_line(a.clone(), b.clone(), n_steps)?;
    let config = GeodesicConfig::new()
        .with_n_steps(n_steps)
        .with_allowed_range((-10.0, 10.0));
    let mut geo = Geodesic::new(a, b, Identity, &config, Some(bridge))?;

    let distance = |g: &Geodesic<B, Identity>| -> f64 {
        host(g.geodesic())
            .iter()
            .zip(host(line.clone()).iter())
            .map(|(x, y)| ((x - y) as f64).powi(2))
            .sum::<f64>()
            .sqrt()
    };
    let before = distance(&geo);
    let optimizer: Box<dyn SequenceOptimizer<B>> =
        Box::new(geodesics::AmsGradConfig::new().with_learning_rate(0.01).init::<B>());
    geo.synthesize(&quick(300), Some(optimizer))?;
    let after = distance(&geo);

    assert!(after < 0.5 * before, "before {before}, after {after}");
    let losses = geo.losses();
    assert!(losses[losses.len() - 1] < losses[0]);
    Ok(())
}

#[test]
fn burn_sgd_drives_synthesis() -> Result<()> {
    let a = image(5, 1, 6);
    let b = image(6, 1, 6);
    let bridge = sample_brownian_bridge(a.clone(), b.clone(), 4, 0.5, 1)?;
    let config = GeodesicConfig::new()
        .with_n_steps(4)
        .with_allowed_range((-10.0, 10.0));
    let mut geo = Geodesic::new(a, b, Identity, &config, Some(bridge))?;

    let optimizer: Box<dyn SequenceOptimizer<B>> = Box::new(BurnOptimizer::new(
        || SgdConfig::new().init::<B, InteriorFrames<B>>(),
        0.05,
    ));
    geo.synthesize(&quick(20), Some(optimizer))?;

    let losses = geo.losses();
    assert_eq!(losses.len(), 20);
    for pair in losses.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-6, "{pair:?}");
    }
    assert!(losses[19] < losses[0]);
    Ok(())
}

#[test]
fn initial_sequence_must_fit_the_anchors() -> Result<()> {
    let a = image(1, 1, 8);
    let b = image(2, 1, 8);
    let config = GeodesicConfig::new().with_n_steps(4);
    let build = |seq: Tensor<B, 4>| {
        Geodesic::new(a.clone(), b.clone(), Identity, &config, Some(seq)).map(|_| ())
    };

    let line = make_straight_line(a.clone(), b.clone(), 4)?;
    assert!(build(line.clone()).is_ok());

    let too_long = make_straight_line(a.clone(), b.clone(), 5)?;
    let err = build(too_long).unwrap_err();
    assert!(err.to_string().contains("initial_sequence must be [n_steps+1"), "{err}");

    let other_shape = make_straight_line(image(1, 1, 6), image(2, 1, 6), 4)?;
    let err = build(other_shape).unwrap_err();
    assert!(
        err.to_string().contains("must have same number of channels, height and width"),
        "{err}"
    );

    let shifted_start = make_straight_line(image(7, 1, 8), b.clone(), 4)?;
    let err = build(shifted_start).unwrap_err();
    assert!(err.to_string().contains("First frame of initial_sequence"), "{err}");

    let shifted_stop = make_straight_line(a.clone(), image(7, 1, 8), 4)?;
    let err = build(shifted_stop).unwrap_err();
    assert!(err.to_string().contains("Last frame of initial_sequence"), "{err}");
    Ok(())
}

#[test]
fn anchors_are_validated() {
    let config = GeodesicConfig::new().with_n_steps(3);
    let bright = image(1, 1, 8).add_scalar(1.0);
    assert!(Geodesic::new(bright, image(2, 1, 8), Identity, &config, None).is_err());
    assert!(Geodesic::new(image(1, 1, 8), image(2, 1, 6), Identity, &config, None).is_err());

    let negative = GeodesicConfig::new().with_range_penalty_lambda(-1.0);
    assert!(Geodesic::new(image(1, 1, 8), image(2, 1, 8), Identity, &negative, None).is_err());
}

#[test]
fn multichannel_anchors_work() -> Result<()> {
    let model = ConvFrontEnd::<B>::new(&device(), 3, 6, 3, 4)?;
    let mut geo = Geodesic::new(
        image(1, 3, 6),
        image(2, 3, 6),
        model,
        &GeodesicConfig::new().with_n_steps(3),
        None,
    )?;
    geo.synthesize(&quick(3).with_store_progress(1), None)?;
    assert_eq!(geo.geodesic().dims(), [4, 3, 6, 6]);
    assert_eq!(geo.step_energy().dim(), (3, 3));
    Ok(())
}

#[test]
fn casting_to_f64_propagates_everywhere() -> Result<()> {
    let geo = conv_engine(4)?;
    let mut geo = geo.cast(FloatDType::F64);
    assert_eq!(geo.image_a().dtype(), DType::F64);
    assert_eq!(geo.geodesic().dtype(), DType::F64);
    assert_eq!(geo.pixelfade().dtype(), DType::F64);

    geo.synthesize(&quick(3), None)?;
    assert_eq!(geo.geodesic().dtype(), DType::F64);
    assert!(geo.losses().iter().all(|l| l.is_finite()));
    assert_eq!(geo.calculate_jerkiness(None)?.dtype(), DType::F64);
    Ok(())
}

#[test]
fn casting_after_a_run_keeps_the_optimizer_usable() -> Result<()> {
    let mut geo = conv_engine(3)?;
    geo.synthesize(&quick(2), None)?;
    let mut geo = geo.cast(FloatDType::F64);
    geo.synthesize(&quick(2), None)?;
    assert_eq!(geo.losses().len(), 4);
    Ok(())
}

#[test]
fn moving_to_the_same_device_changes_nothing() -> Result<()> {
    let mut geo = conv_engine(3)?;
    geo.synthesize(&quick(2), None)?;
    let before = host(geo.geodesic());
    let geo = geo.to_device(&device());
    assert_eq!(host(geo.geodesic()), before);
    assert_eq!(geo.geodesic().device(), device());
    Ok(())
}

#[test]
fn jerkiness_vanishes_on_the_pixelfade_under_identity() -> Result<()> {
    let geo = Geodesic::new(
        image(1, 1, 8),
        image(2, 1, 8),
        Identity,
        &GeodesicConfig::new().with_n_steps(6),
        None,
    )?;
    let jerk = geo.calculate_jerkiness(None)?;
    assert_eq!(jerk.dims(), [5]);
    let values: Vec<f32> = jerk.into_data().convert::<f32>().to_vec().expect("f32 data");
    assert!(values.iter().all(|&v| v == 0.0), "{values:?}");
    Ok(())
}

#[test]
fn functions_accept_external_sequences() -> Result<()> {
    let geo = conv_engine(4)?;
    let bridge = sample_brownian_bridge(geo.image_a(), geo.image_b(), 4, 1.0, 3)?;

    let own = geo.objective_function(None)?;
    let external = geo.objective_function(Some(bridge.clone()))?;
    assert!(own.is_finite() && external.is_finite());
    assert_ne!(own, external);

    let own_jerk: Vec<f32> = geo
        .calculate_jerkiness(None)?
        .into_data()
        .convert::<f32>()
        .to_vec()
        .expect("f32 data");
    let external_jerk: Vec<f32> = geo
        .calculate_jerkiness(Some(bridge))?
        .into_data()
        .convert::<f32>()
        .to_vec()
        .expect("f32 data");
    assert_eq!(own_jerk.len(), 3);
    assert_eq!(external_jerk.len(), 3);
    assert_ne!(own_jerk, external_jerk);
    assert!(external_jerk.iter().all(|&v| v.is_finite() && v >= 0.0));
    Ok(())
}
