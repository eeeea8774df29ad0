//! The transformation engine facade.
//!
//! [`request`] turns a client request into an upstream request, [`response`]
//! turns a complete upstream body back into a client response, and the
//! stream side lives in [`crate::stream`]. Both sides write to the same
//! per-request [`trace::TransformTrace`]. [`count_tokens`] answers token
//! count requests.

pub mod count_tokens;
pub mod request;
pub mod response;
pub mod trace;
pub mod validate;

pub use request::{transform_request, RenderContext, SupplierTarget, TransformedRequest};
pub use response::{transform_response, ResponseContext};
pub use trace::{FieldAudit, TransformTrace};
