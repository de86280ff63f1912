//! # Output repair, validation and casting
//!
//! Turns raw LM text into typed field values without calling the model
//! again. Handles think blocks, markdown fences, JSON wrapped in prose and
//! the common near-JSON mistakes models make.
//!
//! | Stage | Entry point |
//! |-------|-------------|
//! | Preprocess | [`strip_think_tags`], [`extract::strip_code_fence`] |
//! | Repair | [`try_repair_json`] |
//! | Decode | [`decode_json_value`], [`decode_json_object`] |
//! | Validate | [`validate_schema`] |
//! | Cast | [`cast_value`] (JSON adapters), [`cast_text`] (text adapters) |

pub mod decode;
pub mod error;
pub mod extract;
pub mod repair;
pub mod validate;

pub use decode::{decode_json_object, decode_json_value, Decoded};
pub use error::{DecodeFailure, ValidationIssue};
pub use extract::{preprocess, strip_think_tags};
pub use repair::try_repair_json;
pub use validate::{cast_text, cast_value, validate_schema};

pub(crate) use error::{json_type_name, truncate};
