mod client;
mod correlator;

pub use client::{HttpScoringClient, ScoringClient, ScoringError};
pub use correlator::{
    CorrelationKey, CorrelatorConfig, ScoreSink, ScoringCorrelator, ScoringRequest, ScoringStats,
    ScoringTicket,
};
