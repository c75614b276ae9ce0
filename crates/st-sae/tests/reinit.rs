use st_sae::{
    ConsensusTrainer, EncoderId, MemorySink, SaeEnsemble, SparseAutoencoderEnsemble,
    TrainerConfig,
};
use rand::{rngs::StdRng, SeedableRng};
use st_nn::layers::linear::orthogonal_tensor;
use st_nn::{Linear, MeanSquaredError};
use st_tensor::{Device, Tensor};

const INPUT_DIM: usize = 8;
const CODE_DIM: usize = 16;

fn batches() -> Vec<Tensor> {
    (0..3)
        .map(|i| Tensor::random_normal(64, INPUT_DIM, 0.0, 1.0, Some(300 + i)).unwrap())
        .collect()
}

// Half of the codes of a freshly initialised encoder fire on centred data, so
// a 0.5 target keeps healthy encoders far below the threshold while a fully
// dead encoder sits at sensitivity 1.
fn config() -> TrainerConfig {
    let mut config = TrainerConfig::new(1e-2);
    config.use_amp = false;
    config.ensemble_consistency_weight = 0.0;
    config.target_activation_rate = 0.5;
    config.reinit_threshold = 0.9;
    config.seed = Some(41);
    config
}

fn ensemble(kill_second: bool) -> SparseAutoencoderEnsemble {
    let mut model = SparseAutoencoderEnsemble::new(2, INPUT_DIM, CODE_DIM, Some(12)).unwrap();
    if kill_second {
        let bias = model.encoder_mut(1).unwrap().bias_mut().value_mut();
        for value in bias.data_mut() {
            *value = -1e3;
        }
    }
    model
}

#[test]
fn dead_encoder_is_reset_in_the_first_epoch() {
    let model = ensemble(true);
    let dead_weight = model.encoders()[1].weight().value().clone();
    let mut trainer =
        ConsensusTrainer::new(model, Device::Cpu, config(), None, MemorySink::new("reinit"))
            .unwrap();

    let first = trainer.train_step(&batches()[0]).unwrap();
    assert_eq!(first.reinitialized, vec![EncoderId::new(1)]);
    assert!((first.sensitivities[1] - 1.0).abs() < 1e-6);
    assert!(first.sensitivities[0] < 0.9);

    let encoder = &trainer.model().encoders()[1];
    assert_ne!(encoder.weight().value(), &dead_weight);
    // zero bias plus a single Adam step
    assert!(encoder
        .bias()
        .value()
        .data()
        .iter()
        .all(|value| value.abs() < 0.05));
    assert_eq!(trainer.optimizer(EncoderId::new(1)).unwrap().steps(), 1);

    let summary = trainer.train_epoch(&batches()[1..]).unwrap();
    assert_eq!(summary.reinitializations, 0);
    assert_eq!(
        trainer.sink().series("sae_1_reinitialized"),
        vec![1.0, 0.0, 0.0]
    );
    assert_eq!(
        trainer.sink().series("sae_0_reinitialized"),
        vec![0.0, 0.0, 0.0]
    );
}

#[test]
fn reset_encoder_is_trained_on_its_new_weights() {
    let batch = &batches()[0];
    let mut trainer =
        ConsensusTrainer::new(ensemble(true), Device::Cpu, config(), None, MemorySink::new("fresh"))
            .unwrap();
    let report = trainer.train_step(batch).unwrap();
    assert_eq!(report.reinitialized, vec![EncoderId::new(1)]);

    // the reset draws from the trainer's seeded stream
    let mut rng = StdRng::seed_from_u64(41);
    let fresh_weight = orthogonal_tensor(INPUT_DIM, CODE_DIM, &mut rng).unwrap();
    let fresh = Linear::from_parts(
        "sae_1.encoder",
        fresh_weight.clone(),
        Tensor::zeros(1, CODE_DIM).unwrap(),
    )
    .unwrap();
    let forward = SparseAutoencoderEnsemble::from_encoders(vec![fresh])
        .unwrap()
        .forward_with_encoded(batch)
        .unwrap();
    let expected = MeanSquaredError::new()
        .value(&forward.outputs[0], batch)
        .unwrap();
    assert_eq!(report.reconstruction_losses[1], expected);

    // a dead encoder reconstructs nothing, so its loss would be the batch energy
    let dead_loss = MeanSquaredError::new()
        .value(&Tensor::zeros(batch.rows(), INPUT_DIM).unwrap(), batch)
        .unwrap();
    assert_ne!(report.reconstruction_losses[1], dead_loss);
    assert_ne!(trainer.model().encoders()[1].weight().value(), &fresh_weight);
}

#[test]
fn epoch_summary_counts_the_reset() {
    let mut trainer =
        ConsensusTrainer::new(ensemble(true), Device::Cpu, config(), None, MemorySink::new("e1"))
            .unwrap();
    let summary = trainer.train(batches(), 1).unwrap();
    assert_eq!(summary.epochs[0].epoch, 1);
    assert_eq!(summary.epochs[0].reinitializations, 1);
}

#[test]
fn sibling_follows_the_same_trajectory() {
    let mut reset =
        ConsensusTrainer::new(ensemble(true), Device::Cpu, config(), None, MemorySink::new("a"))
            .unwrap();
    let mut control =
        ConsensusTrainer::new(ensemble(false), Device::Cpu, config(), None, MemorySink::new("b"))
            .unwrap();
    assert_eq!(
        reset.model().encoders()[0].weight().value(),
        control.model().encoders()[0].weight().value()
    );

    for batch in &batches() {
        reset.train_step(batch).unwrap();
        control.train_step(batch).unwrap();
    }
    let reset_sibling = &reset.model().encoders()[0];
    let control_sibling = &control.model().encoders()[0];
    assert_eq!(reset_sibling.weight().value(), control_sibling.weight().value());
    assert_eq!(reset_sibling.bias().value(), control_sibling.bias().value());
    assert_eq!(
        reset.optimizer(EncoderId::new(0)).unwrap().steps(),
        control.optimizer(EncoderId::new(0)).unwrap().steps()
    );
}
