//! Train a small grounded rule network with the epoch stream, then
//! checkpoint the learned weights.
//!
//! Four grounded instances share one weight table; the rule head is
//! `and(x, y) = sigmoid(w0·x + w1·y + b)` and the targets encode logical
//! AND. Every sample is its own grounding of the same rule, which is why
//! they all reference the same weight indices.
//!
//! Run with: cargo run --example training_loop

use groundnet::prelude::*;
use groundnet::engine::weights::CheckpointMetadata;

fn grounded_and(x: f64, y: f64) -> groundnet::Result<Sample> {
    let target = if x > 0.5 && y > 0.5 { 1.0 } else { 0.0 };
    decode(&format!(
        r#"{{
            "id": "and({x},{y})",
            "target": {target},
            "output_neuron": 2,
            "network": [
                {{ "name": "in(x)", "inputs": [], "value": {x} }},
                {{ "name": "in(y)", "inputs": [], "value": {y} }},
                {{ "name": "and(x, y)", "weighted": true, "activation": "sigmoid",
                   "inputs": [0, 1], "weights": [0, 1], "offset": 2 }}
            ]
        }}"#
    ))
}

fn main() -> groundnet::Result<()> {
    let device = best_device();

    let samples = vec![
        grounded_and(0.0, 0.0)?,
        grounded_and(0.0, 1.0)?,
        grounded_and(1.0, 0.0)?,
        grounded_and(1.0, 1.0)?,
    ];

    // Two rule weights and a bias, all trainable and pending
    // initialization in the external store.
    let records = decode_weights(
        r#"[
            { "index": 0, "name": "w_x", "dimensions": [] },
            { "index": 1, "name": "w_y", "dimensions": [] },
            { "index": 2, "name": "bias", "dimensions": [] }
        ]"#,
    )?;
    let weights = WeightTable::materialize(&records, &device)?;

    let config = LearningConfig {
        learning_rate: 0.5,
        grad_clip: 5.0,
        use_adam: true,
        batched: true,
        loss: LossKind::BinaryCrossEntropy,
    };
    let mut trainer = Trainer::new(samples, weights, config)?;

    let mut tracker = MetricsTracker::new();
    for stats in trainer.epochs(200) {
        let stats = stats?;
        tracker.record(&stats);
        if stats.epoch % 25 == 0 {
            println!(
                "epoch {:>4}: loss {:.4} ({} samples)",
                stats.epoch, stats.loss, stats.seen
            );
        }
        if tracker.has_converged(30) {
            println!("converged after {} epochs", stats.epoch);
            break;
        }
    }

    println!("best loss: {:?}", tracker.best_loss());

    let path = std::env::temp_dir().join("groundnet_and.safetensors");
    let metadata = CheckpointMetadata::new("and_rule", "v1", trainer.weights());
    trainer.weights().save_with_metadata(&path, metadata)?;
    println!("checkpoint written to {}", path.display());

    Ok(())
}
