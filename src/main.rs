use burn::optim::AdamConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meta_opt_rs::metaopt::algorithms::{MlpBackboneConfig, ProtoNet};
use meta_opt_rs::metaopt::synthetic::SyntheticEpisodes;
use meta_opt_rs::metaopt::trainers::checkpoint::FileCheckpointer;
use meta_opt_rs::metaopt::trainers::config::{EpisodeConfig, MetaScheduleConfig, MetaTrainerConfig};
use meta_opt_rs::metaopt::trainers::driver::train_with_validation;
use meta_opt_rs::metaopt::trainers::sink::{FanoutSink, JsonLinesSink, TracingSink};
use meta_opt_rs::metaopt::trainers::MetaTrainer;
use meta_opt_rs::settings;

type DemoBackend = burn::backend::Autodiff<burn::backend::NdArray<f32>>;

fn main() -> meta_opt_rs::Result<()> {
    let config = settings();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .init();
    info!(save_folder = %config.output.save_folder.display(), "meta-opt starting");

    let device = Default::default();
    let shape = [1, 4, 4];
    let episode = EpisodeConfig::new(5, 1, 5, 4);
    let backbone = MlpBackboneConfig::new(shape.iter().product())
        .with_n_classes(episode.n_way)
        .init::<DemoBackend>(&device);
    let algorithm = ProtoNet::new(backbone);

    let mut sink = FanoutSink::new().with(TracingSink);
    if config.logging.jsonl_metrics {
        sink = sink.with(JsonLinesSink::create(config.output.save_folder.join("metrics.jsonl"))?);
    }
    let trainer_config = MetaTrainerConfig::new(episode.clone())
        .with_learning_rate(1.0e-2)
        .with_grad_clip(5.0)
        .with_log_interval(10)
        .with_save_interval(20)
        .with_model_type("protonet".to_string());
    let checkpointer = FileCheckpointer::new(
        &config.output.save_folder,
        trainer_config.model_type.clone(),
        config.output.step_width,
    );
    let mut trainer = MetaTrainer::new(
        algorithm,
        AdamConfig::new().init::<DemoBackend, ProtoNet<DemoBackend>>(),
        trainer_config,
        sink,
        checkpointer,
    );

    let demo = &config.demo;
    let mut train_source = SyntheticEpisodes::new(episode.clone(), 64, shape, demo.seed);
    let val_source = SyntheticEpisodes::new(episode, 64, shape, demo.seed.wrapping_add(1));
    let train = train_source.batches::<DemoBackend>(demo.train_batches, &device);
    let schedule = MetaScheduleConfig::new(demo.train_batches)
        .with_val_interval((demo.train_batches / 4).max(1))
        .with_step_milestones(vec![(2, 0.1)]);

    let rounds = train_with_validation(
        &mut trainer,
        train,
        || val_source.clone().batches::<DemoBackend>(demo.val_batches, &device),
        &schedule,
    )?;

    for round in &rounds {
        match round.val_task_acc {
            Some(ci) => println!("round {:>2} (lr {:.4}): {}", round.round, round.learning_rate, ci),
            None => println!("round {:>2} (lr {:.4}): no validation tasks", round.round, round.learning_rate),
        }
    }
    Ok(())
}
