//! Decode a grounded sample, materialize its weights, and evaluate it with
//! both strategies — with a hook watching the output neuron.
//!
//! Run with: cargo run --example forward_pass

use groundnet::prelude::*;

fn main() -> groundnet::Result<()> {
    let device = best_device();

    // One grounded instance as the grounding service would emit it:
    // out = sigmoid(w0·a + w1·b) with a scalar and a vector input.
    let sample = decode(
        r#"{
            "id": "query_0",
            "target": 1.0,
            "output_neuron": 2,
            "network": [
                { "name": "f(a)", "inputs": [], "value": 1.0 },
                { "name": "f(b)", "inputs": [], "value": [0.0, 0.0] },
                { "name": "h(a, b) head", "weighted": true, "activation": "sigmoid",
                  "inputs": [0, 1], "weights": [0, 1] }
            ]
        }"#,
    )?;

    let records = decode_weights(
        r#"[
            { "index": 0, "name": "w_scalar", "dimensions": [], "value": 1.0, "fixed": true },
            { "index": 1, "name": "w_row", "dimensions": [1, 2], "value": [[0.5, 0.5]], "fixed": true }
        ]"#,
    )?;
    let weights = WeightTable::materialize(&records, &device)?;

    let mut hooks = HookRegistry::new();
    hooks.register("head", |value| {
        println!("hook: head neuron computed {:?}", value.flatten_all()?.to_vec1::<f32>()?);
        Ok(())
    });
    let evaluator = Evaluator::with_hooks(device, hooks);

    let per_sample = evaluator.evaluate(&sample, &weights, false)?;
    let layered = evaluator.evaluate(&sample, &weights, true)?;

    println!(
        "per-sample strategy: {:.6}",
        per_sample.flatten_all()?.to_vec1::<f32>()?[0]
    );
    println!(
        "layered strategy:    {:.6}",
        layered.flatten_all()?.to_vec1::<f32>()?[0]
    );

    let strata = stratify(&sample)?;
    println!("strata: {} layers", strata.len());
    for layer in &strata.layers {
        println!(
            "  layer {}: {:?} (activation {}, weighted {}, pooling {})",
            layer.index, layer.members, layer.activation, layer.weighted, layer.pooling
        );
    }

    Ok(())
}
