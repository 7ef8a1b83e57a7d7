// tests/classical_trainers.rs - Classical, SVRG, min-max and weight-averaging trainers
use burn::optim::{AdamConfig, SgdConfig};

use meta_opt_rs::metaopt::algorithms::{
    GaussianClassGenerator, GaussianClassGeneratorConfig, MlpBackbone,
};
use meta_opt_rs::metaopt::synthetic::labeled_batches;
use meta_opt_rs::metaopt::trainers::classical::ClassicalTrainer;
use meta_opt_rs::metaopt::trainers::config::{
    ClassicalTrainerConfig, FineTuneConfig, MinMaxTrainerConfig, SvrgTrainerConfig,
    SwaTrainerConfig,
};
use meta_opt_rs::metaopt::trainers::contract::{
    FeatureClassifier, FeatureGenerator, GeneratorConditioned,
};
use meta_opt_rs::metaopt::trainers::episode::{LabeledBatch, TaskBatch};
use meta_opt_rs::metaopt::trainers::grad::{assert_same_layout, grad_norm, ParamLayout};
use meta_opt_rs::metaopt::trainers::loss_utils::{scalar, smooth_cross_entropy, ClassCompactness};
use meta_opt_rs::metaopt::trainers::measurements::MetricKey;
use meta_opt_rs::metaopt::trainers::minmax::MinMaxTrainer;
use meta_opt_rs::metaopt::trainers::sink::MemorySink;
use meta_opt_rs::metaopt::trainers::svrg::SvrgTrainer;
use meta_opt_rs::metaopt::trainers::swa::SwaTrainer;
use meta_opt_rs::metaopt::trainers::{RunMode, RunOptions};
use meta_opt_rs::test_utils::{
    backbone, episode_config, episodes, parameter_values, CountingCheckpointer, TestBackend,
    SAMPLE_SHAPE,
};

type Model = MlpBackbone<TestBackend>;
type Generator = GaussianClassGenerator<TestBackend>;

fn batches(count: usize, label_offset: i64, seed: u64) -> Vec<LabeledBatch<TestBackend>> {
    labeled_batches(count, 6, 3, label_offset, SAMPLE_SHAPE, seed, &Default::default())
}

fn classical(
    config: ClassicalTrainerConfig,
) -> ClassicalTrainer<
    TestBackend,
    Model,
    impl burn::optim::Optimizer<Model, TestBackend>,
    MemorySink,
    CountingCheckpointer,
> {
    let model = backbone::<TestBackend>(config.n_classes, &Default::default());
    ClassicalTrainer::new(
        model,
        AdamConfig::new().init::<TestBackend, Model>(),
        config,
        MemorySink::new(),
        CountingCheckpointer::new(),
    )
}

#[test]
fn test_classical_epoch_steps_and_summarises() {
    let mut trainer = classical(
        ClassicalTrainerConfig::new(3)
            .with_learning_rate(1.0e-2)
            .with_label_offset(20)
            .with_log_interval(2),
    );
    let before = parameter_values(trainer.model());

    let result = trainer
        .run(batches(4, 20, 0), RunMode::Train, RunOptions::epoch(1))
        .expect("run");

    assert_eq!(result.batches, 4);
    assert_ne!(parameter_values(trainer.model()), before);
    assert_eq!(trainer.sink().values("classical/cross_ent").len(), 2);
    assert_eq!(trainer.sink().values("classical/grad_norm/before_clip").len(), 4);
    assert!(result.epoch_metrics.contains_key("val_cross_ent"));
    assert!(result.epoch_metrics.contains_key("val_accu"));
    assert!(result.test_mean(MetricKey::Loss).is_some());
    assert!(trainer.checkpointer().modules.is_empty());
}

#[test]
fn test_classical_epochal_checkpoint() {
    let mut trainer = classical(ClassicalTrainerConfig::new(3).with_save_every_epochs(5));

    trainer
        .run(batches(2, 0, 1), RunMode::Train, RunOptions::epoch(5))
        .expect("run");

    assert_eq!(trainer.checkpointer().modules, vec![5]);
    assert_eq!(trainer.checkpointer().records, vec![(5, "optim".to_string())]);
}

#[test]
fn test_gradient_analysis_never_steps() {
    let mut trainer = classical(ClassicalTrainerConfig::new(3));
    let before = parameter_values(trainer.model());

    let result = trainer
        .run(
            batches(3, 0, 2),
            RunMode::Train,
            RunOptions::epoch(5).with_grad_analysis(true),
        )
        .expect("run");

    assert_eq!(parameter_values(trainer.model()), before);
    let report = result.gradient_moments.expect("moment report");
    assert_eq!(report.batches, 3);
    assert!(report.srm_g > 0.0);
    assert!(report.var_g >= -1e-9);
    assert!(trainer.sink().values("classical/grad_norm/before_clip").is_empty());
    assert_eq!(trainer.sink().values("grad_analysis/srm_g"), vec![(5, report.srm_g)]);
    assert!(trainer.checkpointer().modules.is_empty());
}

#[test]
fn test_gradient_analysis_measures_clipped_gradients() {
    let mut trainer = classical(ClassicalTrainerConfig::new(3).with_grad_clip(1.0e-3));
    let before = parameter_values(trainer.model());

    let result = trainer
        .run(
            batches(3, 0, 2),
            RunMode::Train,
            RunOptions::epoch(5).with_grad_analysis(true),
        )
        .expect("run");

    assert_eq!(parameter_values(trainer.model()), before);
    let report = result.gradient_moments.expect("moment report");
    assert!(report.srm_g > 0.0);
    assert!(report.srm_g <= 1.0e-6 * (1.0 + 1.0e-4));
    assert!(report.mean_g_norm <= 1.0e-3 * (1.0 + 1.0e-4));
}

#[test]
fn test_aux_weight_grows_and_is_capped() {
    let mut trainer = classical(ClassicalTrainerConfig::new(3).with_aux_gamma(0.1))
        .with_aux_objective(ClassCompactness);

    trainer
        .run(batches(2, 0, 3), RunMode::Train, RunOptions::epoch(1))
        .expect("run");
    assert!((trainer.gamma() - 0.101).abs() < 1e-12);
    assert_eq!(trainer.sink().values("classical/aux_loss").len(), 1);

    let mut capped = classical(ClassicalTrainerConfig::new(3).with_aux_gamma(0.5))
        .with_aux_objective(ClassCompactness);
    capped
        .run(batches(1, 0, 4), RunMode::Train, RunOptions::epoch(1))
        .expect("run");
    assert_eq!(capped.gamma(), 0.5);
}

#[test]
fn test_eval_leaves_gamma_and_model_alone() {
    let mut trainer = classical(ClassicalTrainerConfig::new(3).with_aux_gamma(0.2))
        .with_aux_objective(ClassCompactness);
    let before = parameter_values(trainer.model());

    let result = trainer
        .run(batches(2, 0, 5), RunMode::Eval, RunOptions::epoch(5))
        .expect("run");

    assert_eq!(trainer.gamma(), 0.2);
    assert_eq!(parameter_values(trainer.model()), before);
    assert!(result.test_mean(MetricKey::AuxLoss).is_some());
    assert!(trainer.checkpointer().modules.is_empty());
}

#[test]
fn test_fine_tune_rebases_and_concatenates() {
    let config = episode_config(2);
    let mut trainer = classical(ClassicalTrainerConfig::new(10));
    let fine_tune = FineTuneConfig::new(config.clone(), 10)
        .with_epochs(2)
        .with_log_interval(3);

    let (model, sets) = trainer.fine_tune(episodes(&config, 2, 6), &fine_tune);

    // 2 episodes x 2 tasks x 3 classes, 1 shot and 2 queries each.
    assert_eq!(sets.shots.len(), 12);
    assert_eq!(sets.queries.len(), 24);
    assert!(sets.shots.y.iter().all(|l| (0..10).contains(l)));
    assert_eq!(trainer.sink().values("fine_tune/train_loss").len(), 2);
    assert_eq!(parameter_values(&model), parameter_values(trainer.model()));

    // The first episode's first task is a valid fixed evaluation set.
    let per_task = config.n_way;
    let shots_y = sets.shots.y[..per_task].to_vec();
    let queries_y: Vec<i64> = sets.queries.y[..2 * per_task].to_vec();
    let fixed = TaskBatch::from_fixed_sets(
        sets.shots.x.clone().narrow(0, 0, per_task),
        &shots_y,
        sets.queries.x.clone().narrow(0, 0, 2 * per_task),
        &queries_y,
    );
    assert_eq!(fixed.n_way, 3);
}

#[test]
#[should_panic(expected = "LABEL ERROR")]
fn test_fine_tune_rejects_labels_outside_classes() {
    let config = episode_config(1);
    let mut trainer = classical(ClassicalTrainerConfig::new(10));
    let fine_tune = FineTuneConfig::new(config.clone(), 10).with_label_offset(5);

    let _ = trainer.fine_tune(episodes(&config, 3, 7), &fine_tune);
}

fn svrg(
    config: SvrgTrainerConfig,
) -> SvrgTrainer<
    TestBackend,
    Model,
    impl burn::optim::Optimizer<Model, TestBackend>,
    MemorySink,
    CountingCheckpointer,
> {
    let model = backbone::<TestBackend>(config.n_classes, &Default::default());
    SvrgTrainer::new(
        model,
        SgdConfig::new().init::<TestBackend, Model>(),
        config,
        MemorySink::new(),
        CountingCheckpointer::new(),
    )
}

#[test]
fn test_svrg_frozen_snapshot_has_zero_variance() {
    // Without steps the local model equals the snapshot, so every corrected
    // gradient collapses onto the global average.
    let mut trainer = svrg(SvrgTrainerConfig::new(3));
    let before = parameter_values(trainer.model());

    let result = trainer
        .run(
            batches(4, 0, 8),
            RunMode::Train,
            RunOptions::epoch(1).with_grad_analysis(true),
        )
        .expect("run");

    assert_eq!(parameter_values(trainer.model()), before);
    let report = result.gradient_moments.expect("moment report");
    assert_eq!(report.batches, 4);
    assert!(report.srm_g > 0.0);
    assert!(report.var_g.abs() <= 1e-4 * report.srm_g);
    assert!((report.mean_g_norm.powi(2) - report.srm_g).abs() <= 1e-4 * report.srm_g);
}

#[test]
fn test_svrg_global_gradient_of_one_batch_is_its_gradient() {
    let trainer = svrg(SvrgTrainerConfig::new(3));
    let reference = batches(1, 0, 9);
    let model = trainer.model().clone();

    let averaged = trainer.global_gradient(&model, reference.clone());
    let twice = trainer.global_gradient(&model, vec![reference[0].clone(), reference[0].clone()]);

    let a = grad_norm(&model, &averaged);
    let b = grad_norm(&model, &twice);
    assert!(a > 0.0);
    assert!((a - b).abs() < 1e-5 * a);
}

#[test]
#[should_panic(expected = "SVRG ERROR")]
fn test_svrg_empty_reference_panics() {
    let trainer = svrg(SvrgTrainerConfig::new(3));
    let model = trainer.model().clone();
    let _ = trainer.global_gradient(&model, Vec::new());
}

#[test]
fn test_svrg_training_epoch() {
    let mut trainer = svrg(
        SvrgTrainerConfig::new(3)
            .with_learning_rate(0.05)
            .with_save_every_epochs(2),
    );
    let before = parameter_values(trainer.model());

    let result = trainer
        .run(batches(3, 0, 10), RunMode::Train, RunOptions::epoch(2))
        .expect("run");

    assert_ne!(parameter_values(trainer.model()), before);
    assert!(result.test_mean(MetricKey::LossGlobal).is_some());
    assert!(result.epoch_metrics.contains_key("val_loss_global"));
    assert_eq!(trainer.sink().values("svrg/grad_norm").len(), 3);
    assert!(result.gradient_moments.is_some());
    assert_eq!(trainer.checkpointer().modules, vec![2]);
}

#[test]
fn test_svrg_steps_with_unclipped_corrected_gradient() {
    // One batch: the snapshot equals the live model, so the corrected
    // gradient is the plain batch gradient and plain SGD moves by `lr * g`.
    let learning_rate = 0.5;
    let mut trainer = svrg(SvrgTrainerConfig::new(3).with_learning_rate(learning_rate));
    let before = parameter_values(trainer.model());

    trainer
        .run(batches(1, 0, 15), RunMode::Train, RunOptions::epoch(1))
        .expect("run");

    let logged = trainer.sink().values("svrg/grad_norm");
    assert_eq!(logged.len(), 1);
    let norm = logged[0].1;
    assert!(norm > 0.0);

    let after = parameter_values(trainer.model());
    let moved = before
        .iter()
        .flatten()
        .zip(after.iter().flatten())
        .map(|(a, b)| ((b - a) as f64).powi(2))
        .sum::<f64>()
        .sqrt();
    assert!((moved - learning_rate * norm).abs() <= 1.0e-3 * learning_rate * norm);
}

#[test]
fn test_svrg_eval_measures_live_model_only() {
    let mut trainer = svrg(SvrgTrainerConfig::new(3));

    let result = trainer
        .run(batches(2, 0, 11), RunMode::Eval, RunOptions::epoch(5))
        .expect("run");

    assert_eq!(result.batches, 2);
    assert!(result.test_mean(MetricKey::LossGlobal).is_none());
    assert!(result.gradient_moments.is_none());
}

#[test]
#[should_panic(expected = "LAYOUT ERROR")]
fn test_independent_models_have_different_layouts() {
    let device = Default::default();
    let a = backbone::<TestBackend>(3, &device);
    let b = backbone::<TestBackend>(3, &device);

    assert_same_layout(
        &ParamLayout::of::<TestBackend, Model>(&a),
        &ParamLayout::of::<TestBackend, Model>(&b),
    );
}

fn min_max(
    config: MinMaxTrainerConfig,
) -> MinMaxTrainer<
    TestBackend,
    Model,
    Generator,
    impl burn::optim::Optimizer<Model, TestBackend>,
    impl burn::optim::Optimizer<Generator, TestBackend>,
    MemorySink,
    CountingCheckpointer,
> {
    let device = Default::default();
    let model = backbone::<TestBackend>(config.n_classes, &device);
    let generator = GaussianClassGeneratorConfig::new(config.n_classes, model.feature_dim())
        .init::<TestBackend>(&device);
    MinMaxTrainer::new(
        model,
        generator,
        AdamConfig::new().init::<TestBackend, Model>(),
        AdamConfig::new().init::<TestBackend, Generator>(),
        config,
        MemorySink::new(),
        CountingCheckpointer::new(),
    )
}

#[test]
fn test_min_max_steps_touch_only_their_own_parameters() {
    let mut trainer = min_max(
        MinMaxTrainerConfig::new(3)
            .with_learning_rate(1.0e-2)
            .with_generator_learning_rate(1.0e-2),
    );
    let source = batches(2, 0, 12);
    trainer.estimate_statistics(source.clone());
    let batch = &source[0];
    let targets = batch.y.clone();

    let model_before = parameter_values(trainer.model());
    let generator_before = parameter_values(trainer.generator());
    trainer.generator_step(batch, &targets);
    assert_eq!(parameter_values(trainer.model()), model_before);
    assert_ne!(parameter_values(trainer.generator()), generator_before);

    let generator_after = parameter_values(trainer.generator());
    trainer.model_step(batch, &targets, 1);
    assert_eq!(parameter_values(trainer.generator()), generator_after);
    assert_ne!(parameter_values(trainer.model()), model_before);
}

#[test]
fn test_min_max_statistics_follow_labels() {
    let mut trainer = min_max(MinMaxTrainerConfig::new(3).with_label_offset(40));
    trainer.estimate_statistics(batches(3, 40, 13));

    let stats = trainer.generator().stats();
    assert_eq!(stats.mean.len(), 3);
    assert!(stats.stddev.iter().flatten().all(|s| *s >= 0.0 && s.is_finite()));
}

#[test]
fn test_min_max_epoch_checkpoints_both_players() {
    let mut trainer = min_max(MinMaxTrainerConfig::new(3).with_save_every_epochs(1));

    let result = trainer
        .run(batches(3, 0, 14), RunMode::Train, RunOptions::epoch(1))
        .expect("run");

    assert_eq!(result.batches, 3);
    assert!(result.epoch_metrics.contains_key("val_generator_loss"));
    assert_eq!(trainer.checkpointer().modules, vec![1]);
    let components: Vec<&str> = trainer
        .checkpointer()
        .records
        .iter()
        .map(|(_, c)| c.as_str())
        .collect();
    assert_eq!(components, vec!["generator", "optim", "generator_optim"]);
}

#[test]
fn test_min_max_losses_are_label_smoothed() {
    let eps = 0.2;
    let source = batches(2, 0, 16);
    let mut smoothed = min_max(MinMaxTrainerConfig::new(3).with_smoothing_eps(eps));
    smoothed.estimate_statistics(source.clone());

    let result = smoothed
        .run(source.clone(), RunMode::Eval, RunOptions::epoch(1))
        .expect("run");

    let model = smoothed.model();
    let mut by_hand = Vec::new();
    let mut plain = Vec::new();
    for batch in &source {
        let class_features = smoothed.generator().generate(&batch.x.device());
        let logits = model.classify_with(model.features(batch.x.clone()), class_features);
        by_hand.push(scalar(smooth_cross_entropy(logits.clone(), &batch.y, eps)));
        plain.push(scalar(smooth_cross_entropy(logits, &batch.y, 0.0)));
    }
    let expected = by_hand.iter().sum::<f64>() / by_hand.len() as f64;
    let unsmoothed = plain.iter().sum::<f64>() / plain.len() as f64;

    let loss = result.test_mean(MetricKey::Loss).expect("loss");
    assert!((loss - expected).abs() < 1e-5);
    assert!((loss - unsmoothed).abs() > 1e-4);
}

#[test]
fn test_min_max_gradient_analysis_never_steps() {
    let mut trainer = min_max(
        MinMaxTrainerConfig::new(3)
            .with_grad_clip(1.0e-3)
            .with_save_every_epochs(1),
    );
    let source = batches(3, 0, 17);
    trainer.estimate_statistics(source.clone());
    let model_before = parameter_values(trainer.model());
    let generator_before = parameter_values(trainer.generator());

    let result = trainer
        .run(
            source,
            RunMode::Train,
            RunOptions::epoch(1).with_grad_analysis(true),
        )
        .expect("run");

    assert_eq!(parameter_values(trainer.model()), model_before);
    assert_eq!(parameter_values(trainer.generator()), generator_before);
    let report = result.gradient_moments.expect("moment report");
    assert_eq!(report.batches, 3);
    assert!(report.srm_g > 0.0);
    assert!(report.srm_g <= 1.0e-6 * (1.0 + 1.0e-4));
    assert_eq!(trainer.sink().values("grad_analysis/srm_g").len(), 1);
    assert!(trainer.sink().values("minmax/grad_norm/before_clip").is_empty());
    assert!(trainer.sink().values("minmax/generator_loss").is_empty());
    assert!(trainer.checkpointer().modules.is_empty());
    assert!(trainer.checkpointer().records.is_empty());
}

fn swa(
    config: SwaTrainerConfig,
) -> SwaTrainer<
    TestBackend,
    Model,
    impl burn::optim::Optimizer<Model, TestBackend>,
    MemorySink,
    CountingCheckpointer,
> {
    let model = backbone::<TestBackend>(config.n_classes, &Default::default());
    SwaTrainer::new(
        model,
        SgdConfig::new().init::<TestBackend, Model>(),
        config,
        MemorySink::new(),
        CountingCheckpointer::new(),
    )
}

#[test]
fn test_swa_cycles_restart_from_initial_weights() {
    let mut trainer = swa(
        SwaTrainerConfig::new(3)
            .with_learning_rate(0.05)
            .with_fine_tune_epochs(2),
    );
    let initial = parameter_values(trainer.model());
    let source = batches(2, 0, 18);

    let first = trainer
        .run(source.clone(), RunMode::Train, RunOptions::epoch(1))
        .expect("run");
    let after_first = parameter_values(trainer.model());
    trainer
        .run(source, RunMode::Train, RunOptions::epoch(2))
        .expect("run");

    assert_eq!(first.batches, 4);
    assert_ne!(after_first, initial);
    assert_eq!(parameter_values(trainer.model()), after_first);
    assert_eq!(trainer.models_averaged(), 2);
    assert_eq!(
        trainer.sink().values("swa/models_averaged"),
        vec![(1, 1.0), (2, 2.0)]
    );
}

#[test]
fn test_swa_average_is_mean_of_cycles() {
    let mut trainer = swa(
        SwaTrainerConfig::new(3)
            .with_learning_rate(0.05)
            .with_fine_tune_epochs(1)
            .with_save_every_epochs(2),
    );

    trainer
        .run(batches(2, 0, 19), RunMode::Train, RunOptions::epoch(1))
        .expect("run");
    let first = parameter_values(trainer.model());
    assert!(trainer.checkpointer().modules.is_empty());
    trainer
        .run(batches(2, 0, 20), RunMode::Train, RunOptions::epoch(2))
        .expect("run");
    let second = parameter_values(trainer.model());

    let average = parameter_values(trainer.average().expect("average"));
    for ((avg, a), b) in average.iter().flatten().zip(first.iter().flatten()).zip(second.iter().flatten()) {
        assert!((avg - (a + b) / 2.0).abs() < 1e-5);
    }
    assert_eq!(trainer.checkpointer().modules, vec![2]);
    assert_eq!(trainer.checkpointer().records, vec![(2, "optim".to_string())]);
}

#[test]
fn test_swa_eval_measures_the_average() {
    let mut trainer = swa(SwaTrainerConfig::new(3).with_learning_rate(0.05).with_smoothing_eps(0.1));
    let source = batches(2, 0, 21);
    trainer
        .run(batches(2, 0, 22), RunMode::Train, RunOptions::epoch(1))
        .expect("run");
    trainer
        .run(batches(2, 0, 23), RunMode::Train, RunOptions::epoch(2))
        .expect("run");
    let average = trainer.average().expect("average").clone();

    let result = trainer
        .run(source.clone(), RunMode::Eval, RunOptions::epoch(2))
        .expect("run");

    let by_hand = source
        .iter()
        .map(|batch| scalar(smooth_cross_entropy(average.forward(batch.x.clone()), &batch.y, 0.1)))
        .sum::<f64>()
        / source.len() as f64;
    assert_eq!(result.batches, 2);
    assert!((result.test_mean(MetricKey::Loss).expect("loss") - by_hand).abs() < 1e-5);
    assert_eq!(trainer.models_averaged(), 2);
}
