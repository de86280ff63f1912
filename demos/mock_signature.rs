//! Example: running a typed signature against MockLm, without a live LLM.
//!
//! Run with: `cargo run --example mock_signature`

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use signature_pipeline::{
    callbacks::{CallbackEvent, FnCallback, Phase},
    types, ExecCtx, Field, JsonAdapter, LmConfig, MockLm, Predictor, RetryConfig, RunOptions,
    Signature, TwoStepAdapter,
};
use std::sync::Arc;

#[derive(Debug, Deserialize, JsonSchema)]
struct MovieReview {
    title: String,
    rating: f64,
    summary: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sig = Signature::builder("review")
        .instructions("Review the movie.")
        .input(Field::string("movie").desc("Movie title"))
        .output(Field::typed::<MovieReview>("review"))
        .build()?;

    // First reply is a bare array, so one output retry is spent.
    let mock = Arc::new(MockLm::texts([
        r#"[{"title": "Inception"}]"#,
        r#"```json
{"review": {"title": "Inception", "rating": 9.2, "summary": "Dreams within dreams.",},}
```"#,
    ]));

    let ctx = ExecCtx::builder(mock.clone())
        .lm_config(LmConfig::new("mock-model").with_temperature(0.0))
        .callback(Arc::new(FnCallback(|e: &CallbackEvent| -> anyhow::Result<()> {
            if matches!(e.phase, Phase::CallEnd | Phase::ParseEnd) {
                println!("  [{} attempt {}] {} {}", e.call_id, e.meta.attempt, e.phase, e.payload);
            }
            Ok(())
        })))
        .build();

    let predictor = Predictor::new(sig.clone())
        .with_adapter(Arc::new(JsonAdapter))
        .with_retry(RetryConfig::new(2));

    let inputs = types::inputs(json!({"movie": "Inception"}))?;
    let out = predictor.run(&ctx, &inputs, &RunOptions::new()).await?;
    let review: MovieReview = out.get_as("review")?;

    println!("Title:   {}", review.title);
    println!("Rating:  {}", review.rating);
    println!("Summary: {}", review.summary);
    println!("LM calls: {}", mock.call_count());

    // Same signature, two-step: free-form answer, then JSON extraction.
    let extractor = Arc::new(MockLm::fixed(
        r#"{"review": {"title": "Inception", "rating": 8.8, "summary": "Layered heist."}}"#,
    ));
    let two_step = TwoStepAdapter::new().with_extraction_lm(extractor, LmConfig::new("small-model"));
    let free_form = ExecCtx::builder(Arc::new(MockLm::fixed(
        "Inception is a layered heist film; I'd give it 8.8 out of 10.",
    )))
    .build();

    let out = predictor
        .run(&free_form, &inputs, &RunOptions::new().with_adapter(Arc::new(two_step)))
        .await?;
    let review: MovieReview = out.get_as("review")?;
    println!("Two-step rating: {}", review.rating);

    Ok(())
}
