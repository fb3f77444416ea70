//! Challenge lifecycle: create, join, record in turn, and settle once both
//! scores are in.

mod locks;
mod machine;
mod service;

pub use scoring::{CorrelatorConfig, ScoringStats};
pub use service::ChallengeService;
