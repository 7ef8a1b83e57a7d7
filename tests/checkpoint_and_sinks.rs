// tests/checkpoint_and_sinks.rs - File checkpoints and metric streams
use std::fs;

use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::Tensor;

use meta_opt_rs::metaopt::algorithms::MlpBackbone;
use meta_opt_rs::metaopt::trainers::checkpoint::{CheckpointSchedule, Checkpointer, FileCheckpointer};
use meta_opt_rs::metaopt::trainers::contract::FeatureClassifier;
use meta_opt_rs::metaopt::trainers::sink::{
    write_embeddings, FanoutSink, JsonLinesSink, MemorySink, MetricsSink, ScalarEvent,
};
use meta_opt_rs::test_utils::{backbone, parameter_values, TestBackend};
use meta_opt_rs::TrainerError;

type Model = MlpBackbone<TestBackend>;

#[test]
fn test_module_checkpoint_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = Default::default();
    let model = backbone::<TestBackend>(3, &device);
    let mut checkpointer = FileCheckpointer::new(dir.path().join("run"), "protonet", 4);

    let path = Checkpointer::<TestBackend>::save_module(&mut checkpointer, 3, &model).expect("save");
    assert_eq!(path, dir.path().join("run").join("protonet_0003.mpk"));
    assert!(path.exists());

    let fresh = backbone::<TestBackend>(3, &device);
    let restored: Model = checkpointer.load_module(3, fresh, &device).expect("load");

    // Half-precision storage.
    for (saved, loaded) in parameter_values(&model)
        .iter()
        .flatten()
        .zip(parameter_values(&restored).iter().flatten())
    {
        assert!((saved - loaded).abs() < 1e-2, "{} vs {}", saved, loaded);
    }
}

#[test]
fn test_optimizer_record_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = Default::default();
    let model = backbone::<TestBackend>(3, &device);
    let mut optimizer = AdamConfig::new().init::<TestBackend, Model>();

    let x = Tensor::<TestBackend, 4>::ones([2, 1, 2, 3], &device);
    let loss = model.forward(x).mean();
    let grads = GradientsParams::from_grads(loss.backward(), &model);
    let _model = optimizer.step(1.0e-3, model, grads);

    let mut checkpointer = FileCheckpointer::new(dir.path(), "classical", 4);
    let path = Checkpointer::<TestBackend>::save_record(&mut checkpointer, 5, "optim", optimizer.to_record())
        .expect("save");
    assert_eq!(path, dir.path().join("classical_optim_0005.mpk"));

    let record = checkpointer
        .load_record::<TestBackend, _>(5, "optim", &device)
        .expect("load");
    let restored = AdamConfig::new().init::<TestBackend, Model>().load_record(record);
    assert_eq!(restored.to_record().len(), optimizer.to_record().len());
}

#[test]
fn test_missing_checkpoint_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = Default::default();
    let checkpointer = FileCheckpointer::new(dir.path(), "protonet", 4);

    let outcome = checkpointer.load_module(9, backbone::<TestBackend>(3, &device), &device);

    match outcome {
        Err(TrainerError::Checkpoint { path, .. }) => {
            assert_eq!(path, dir.path().join("protonet_0009"));
        }
        other => panic!("expected a checkpoint error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_episodic_schedule_over_long_run() {
    let schedule = CheckpointSchedule::Episodic { every: 1000 };
    let writes = (1..=2500).filter(|i| schedule.should_save(*i)).count();
    assert_eq!(writes, 3);
}

#[test]
fn test_json_lines_sink_writes_one_event_per_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("metrics.jsonl");
    let mut sink = JsonLinesSink::create(&path).expect("create");

    sink.add_scalar("meta_train/test_loss_post", 1.25, 10);
    sink.add_scalar("meta_train/test_accu_post", 0.5, 10);
    sink.flush().expect("flush");

    let text = fs::read_to_string(&path).expect("read");
    let events: Vec<ScalarEvent> = text
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].name, "meta_train/test_loss_post");
    assert_eq!(events[0].value, 1.25);
    assert_eq!(events[1].step, 10);
}

#[test]
fn test_fanout_with_embeddings() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("embeddings.jsonl");
    let mut sink = FanoutSink::new()
        .with(MemorySink::new())
        .with(JsonLinesSink::create(&path).expect("create"));

    let layers = vec![
        vec![vec![0.0, 1.0], vec![1.0, 0.0]],
        vec![vec![0.5], vec![-0.5]],
    ];
    write_embeddings(&mut sink, &layers, &["0".to_string(), "1".to_string()], 3);
    assert_eq!(sink.len(), 2);
    drop(sink);

    let text = fs::read_to_string(&path).expect("read");
    assert_eq!(text.lines().count(), 2);
    assert!(text.contains("\"tag\":\"layer1\""));
}
