//! # Signature Pipeline
//!
//! Typed LM calls over models that only produce text.
//!
//! A caller declares a **signature** (named, typed input and output fields,
//! optionally with JSON schemas, tool declarations and conversation history)
//! and gets validated, typed output values back. In between sits the adapter
//! pipeline: render the request, call the model, repair / validate / cast the
//! reply, retry with error feedback when the reply is unusable, and report
//! every step to lifecycle callbacks.
//!
//! Reasoning strategies, agents and prompt optimization are callers of this
//! crate, not part of it.
//!
//! ## Core Concepts
//!
//! - **[`Signature`]** / **[`Field`]**: the static contract of one call.
//! - **[`Adapter`](adapter::Adapter)**: prompt convention. [`DefaultAdapter`]
//!   (`Name: value` lines), [`ChatAdapter`] (`[[ ## field ## ]]` sections),
//!   [`JsonAdapter`] (one JSON object) and [`TwoStepAdapter`] (free-form
//!   answer, then a JSON extraction call).
//! - **[`ExecCtx`]**: the model, its config, transport backoff, default
//!   adapter, global callbacks, cancellation and timeout.
//! - **[`Predictor`]**: a signature with program-level settings; implements
//!   the object-safe [`Payload`] trait.
//! - **[`pipeline::run`]**: one invocation with per-call [`RunOptions`].
//! - **[`LanguageModel`](backend::LanguageModel)**: the only transport seam.
//!   [`MockLm`] replays scripted replies for tests.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use signature_pipeline::{
//!     types, ExecCtx, Field, JsonAdapter, MockLm, Predictor, RunOptions, Signature,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sig = Signature::builder("qa")
//!         .instructions("Answer the question.")
//!         .input(Field::string("question"))
//!         .output(Field::string("answer"))
//!         .output(Field::float("confidence").optional())
//!         .build()?;
//!
//!     let lm = Arc::new(MockLm::fixed(r#"{"answer": "4", "confidence": 0.9}"#));
//!     let ctx = ExecCtx::builder(lm).adapter(Arc::new(JsonAdapter)).build();
//!
//!     let out = Predictor::new(sig)
//!         .run(&ctx, &types::inputs(json!({"question": "2+2?"}))?, &RunOptions::new())
//!         .await?;
//!     println!("{:?} ({:?})", out.get_str("answer"), out.get_f64("confidence"));
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod backend;
pub mod callbacks;
pub mod error;
pub mod exec_ctx;
pub mod history;
pub mod output_parser;
pub mod payload;
pub mod pipeline;
pub mod predictor;
pub mod prompt;
pub mod retry;
pub mod signature;
pub mod tools;
pub mod types;

pub use adapter::{ChatAdapter, DefaultAdapter, JsonAdapter, TwoStepAdapter};
pub use backend::{BackoffConfig, LmConfig, MockLm};
pub use callbacks::{Callback, CallbackEvent, EventRecorder, FnCallback, Phase};
pub use error::{ErrorKind, PipelineError, Result};
pub use exec_ctx::{ExecCtx, ExecCtxBuilder};
pub use payload::{BoxFut, Payload};
pub use pipeline::{run, RunOptions};
pub use predictor::Predictor;
pub use retry::RetryConfig;
pub use signature::{Field, FieldKind, FieldSchema, Signature};
pub use tools::{ToolCall, ToolParameter, ToolSpec};
pub use types::{Demo, FieldValue, Inputs, Outputs};
