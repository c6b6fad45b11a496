//! HTTP front end of a replicated SQL store node.
//!
//! The binary in `main.rs` wires this router to a [`store::Store`]; the
//! library half exists so the endpoints can be exercised in tests without a
//! process.

mod error;
pub mod http;

pub use error::ApiError;
pub use http::{ApiResponse, HttpState, router};
