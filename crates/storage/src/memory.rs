use std::collections::HashMap;

use async_trait::async_trait;
use shared::domain::{Challenge, ChallengeId, PlayerId};
use tokio::sync::RwLock;

use crate::{ChallengeRepository, RepositoryError, Result};

/// Process-local store. Snapshots go in and out by value, so no caller ever
/// holds a reference into the map.
#[derive(Default)]
pub struct InMemoryChallengeRepository {
    challenges: RwLock<HashMap<ChallengeId, Challenge>>,
}

impl InMemoryChallengeRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChallengeRepository for InMemoryChallengeRepository {
    async fn create(&self, challenge: &Challenge) -> Result<()> {
        let mut challenges = self.challenges.write().await;
        if challenges.contains_key(&challenge.id) {
            return Err(RepositoryError::AlreadyExists(challenge.id.clone()));
        }
        challenges.insert(challenge.id.clone(), challenge.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &ChallengeId) -> Result<Challenge> {
        self.challenges
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))
    }

    async fn update(&self, challenge: &Challenge) -> Result<()> {
        let mut challenges = self.challenges.write().await;
        let Some(slot) = challenges.get_mut(&challenge.id) else {
            return Err(RepositoryError::NotFound(challenge.id.clone()));
        };
        *slot = challenge.clone();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Challenge>> {
        let mut challenges: Vec<Challenge> =
            self.challenges.read().await.values().cloned().collect();
        challenges.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(challenges)
    }

    async fn get_active_by_player(&self, player_id: &PlayerId) -> Result<Option<Challenge>> {
        Ok(self
            .challenges
            .read()
            .await
            .values()
            .find(|challenge| !challenge.is_completed() && challenge.is_participant(player_id))
            .cloned())
    }
}
