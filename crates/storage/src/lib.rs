use std::{io, path::PathBuf};

use async_trait::async_trait;
use shared::domain::{Challenge, ChallengeId, PlayerId};
use thiserror::Error;

mod memory;
mod sqlite;

pub use memory::InMemoryChallengeRepository;
pub use sqlite::SqliteChallengeRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("challenge {0} not found")]
    NotFound(ChallengeId),
    #[error("challenge {0} already exists")]
    AlreadyExists(ChallengeId),
    #[error("stored challenge {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("failed to create parent directory '{}': {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Durable home of challenge aggregates.
///
/// Each write covers exactly one challenge and must be atomic with respect to
/// the challenge's player rows. Callers are responsible for serializing
/// read-modify-write cycles on the same challenge.
#[async_trait]
pub trait ChallengeRepository: Send + Sync {
    async fn create(&self, challenge: &Challenge) -> Result<()>;

    async fn get_by_id(&self, id: &ChallengeId) -> Result<Challenge>;

    async fn update(&self, challenge: &Challenge) -> Result<()>;

    /// All challenges, most recently created first.
    async fn list(&self) -> Result<Vec<Challenge>>;

    /// The non-completed challenge `player_id` takes part in, if any.
    async fn get_active_by_player(&self, player_id: &PlayerId) -> Result<Option<Challenge>>;

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
