//! Egress profiles: model, registry and credential masking.

mod mask;
mod models;
mod registry;

pub use mask::*;
pub use models::*;
pub use registry::*;
