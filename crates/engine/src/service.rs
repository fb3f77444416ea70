use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use scoring::{
    CorrelationKey, CorrelatorConfig, ScoreSink, ScoringClient, ScoringCorrelator, ScoringError,
    ScoringRequest, ScoringStats, ScoringTicket,
};
use shared::{
    domain::{Challenge, ChallengeId, PlayerId},
    error::ChallengeError,
    protocol::ServerEvent,
};
use storage::{ChallengeRepository, RepositoryError};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    locks::KeyedLocks,
    machine::{self, ScoreOutcome},
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Owns the challenge state and the exclusive sections around it. Scores come
/// back through [`ScoreSink`], so the correlator holds this half and never
/// the service itself.
struct ChallengeLedger {
    repo: Arc<dyn ChallengeRepository>,
    challenge_locks: KeyedLocks<ChallengeId>,
    player_locks: KeyedLocks<PlayerId>,
    events: broadcast::Sender<ServerEvent>,
}

/// Entry point for every challenge operation.
///
/// Operations on one challenge are serialized; operations on different
/// challenges run concurrently. Create and join additionally serialize on
/// the player, taken before the challenge, so the one-active-challenge rule
/// cannot be raced.
pub struct ChallengeService {
    ledger: Arc<ChallengeLedger>,
    scoring: ScoringCorrelator,
}

impl ChallengeService {
    /// Must be called inside a tokio runtime; the scoring workers are spawned
    /// here.
    pub fn new(
        repo: Arc<dyn ChallengeRepository>,
        client: Arc<dyn ScoringClient>,
        config: CorrelatorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let ledger = Arc::new(ChallengeLedger {
            repo,
            challenge_locks: KeyedLocks::new(),
            player_locks: KeyedLocks::new(),
            events,
        });
        let scoring = ScoringCorrelator::start(client, ledger.clone(), config);
        Self { ledger, scoring }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.ledger.events.subscribe()
    }

    pub async fn create_challenge(
        &self,
        creator_id: PlayerId,
        username: &str,
        song_id: &str,
        song_title: &str,
    ) -> Result<Challenge, ChallengeError> {
        require(!creator_id.is_blank(), "player id is required")?;
        require(!username.trim().is_empty(), "username is required")?;
        require(!song_id.trim().is_empty(), "song id is required")?;

        let _player = self.ledger.player_locks.lock(creator_id.clone()).await;
        if let Some(active) = self.ledger.active_challenge(&creator_id).await? {
            debug!(player_id = %creator_id, challenge_id = %active.id, "creator already busy");
            return Err(ChallengeError::PlayerBusy(creator_id));
        }

        let challenge = machine::open(
            ChallengeId::generate(),
            creator_id,
            username,
            song_id,
            song_title,
            Utc::now(),
        );
        self.ledger
            .repo
            .create(&challenge)
            .await
            .map_err(storage_error)?;

        info!(
            challenge_id = %challenge.id,
            player_id = %challenge.player1.id,
            song_id = %challenge.song_id,
            "challenge created"
        );
        self.ledger.publish(&challenge);
        Ok(challenge)
    }

    pub async fn join_challenge(
        &self,
        challenge_id: &ChallengeId,
        player_id: PlayerId,
        username: &str,
    ) -> Result<Challenge, ChallengeError> {
        require(!player_id.is_blank(), "player id is required")?;
        require(!username.trim().is_empty(), "username is required")?;

        let _player = self.ledger.player_locks.lock(player_id.clone()).await;
        let _challenge = self.ledger.challenge_locks.lock(challenge_id.clone()).await;

        // A creator trying to join their own open challenge is busy too; the
        // SelfJoin check in the transition only guards the state itself.
        if let Some(active) = self.ledger.active_challenge(&player_id).await? {
            debug!(%player_id, challenge_id = %active.id, "joiner already busy");
            return Err(ChallengeError::PlayerBusy(player_id));
        }

        let mut challenge = self.ledger.load(challenge_id).await?;
        machine::join(&mut challenge, player_id, username, Utc::now())?;
        self.ledger.save(&challenge).await?;

        info!(
            challenge_id = %challenge.id,
            player_id = ?challenge.player2.as_ref().map(|p| p.id.as_str()),
            "player joined challenge"
        );
        self.ledger.publish(&challenge);
        Ok(challenge)
    }

    /// Records the player's take and queues it for scoring. Queue capacity is
    /// claimed before anything is persisted, so a full queue leaves the
    /// challenge untouched. Saving and queueing run on their own task and
    /// finish even if the caller stops waiting.
    pub async fn submit_recording(
        &self,
        challenge_id: &ChallengeId,
        player_id: &PlayerId,
        audio_url: &str,
    ) -> Result<Challenge, ChallengeError> {
        require(!player_id.is_blank(), "player id is required")?;
        require(!audio_url.trim().is_empty(), "audio url is required")?;

        let guard = self.ledger.challenge_locks.lock(challenge_id.clone()).await;
        let mut challenge = self.ledger.load(challenge_id).await?;
        machine::record(&mut challenge, player_id, audio_url, Utc::now())?;

        let ticket = self.scoring.reserve().map_err(|err| match err {
            ScoringError::QueueFull => ChallengeError::QueueFull,
            other => ChallengeError::Upstream(other.to_string()),
        })?;
        let request = ScoringRequest {
            key: CorrelationKey::generate(),
            challenge_id: challenge.id.clone(),
            player_id: player_id.clone(),
            audio_url: audio_url.to_string(),
            song_id: challenge.song_id.clone(),
        };

        let ledger = Arc::clone(&self.ledger);
        tokio::spawn(async move {
            let _challenge = guard;
            ledger.save(&challenge).await?;
            ledger.queue_for_scoring(ticket, request);
            ledger.publish(&challenge);
            Ok::<_, ChallengeError>(challenge)
        })
        .await
        .map_err(|err| ChallengeError::Storage(format!("recording task failed: {err}")))?
    }

    pub async fn get_challenge(
        &self,
        challenge_id: &ChallengeId,
    ) -> Result<Challenge, ChallengeError> {
        self.ledger.load(challenge_id).await
    }

    pub async fn list_challenges(&self) -> Result<Vec<Challenge>, ChallengeError> {
        self.ledger.repo.list().await.map_err(storage_error)
    }

    pub async fn scoring_stats(&self) -> ScoringStats {
        self.scoring.stats().await
    }

    pub async fn health_check(&self) -> Result<(), ChallengeError> {
        self.ledger.repo.health_check().await.map_err(storage_error)
    }

    /// Stops the scoring workers. Recordings still waiting on a score stay
    /// unscored.
    pub async fn shutdown(&self) {
        self.scoring.shutdown().await;
    }
}

impl ChallengeLedger {
    async fn load(&self, challenge_id: &ChallengeId) -> Result<Challenge, ChallengeError> {
        self.repo.get_by_id(challenge_id).await.map_err(storage_error)
    }

    async fn save(&self, challenge: &Challenge) -> Result<(), ChallengeError> {
        self.repo.update(challenge).await.map_err(storage_error)
    }

    async fn active_challenge(
        &self,
        player_id: &PlayerId,
    ) -> Result<Option<Challenge>, ChallengeError> {
        self.repo
            .get_active_by_player(player_id)
            .await
            .map_err(storage_error)
    }

    /// Runs after the recording is saved. A request that cannot be queued is
    /// reported the same way as a failed scoring call.
    fn queue_for_scoring(&self, ticket: ScoringTicket, request: ScoringRequest) {
        let key = request.key;
        let challenge_id = request.challenge_id.clone();
        let player_id = request.player_id.clone();
        match ticket.dispatch(request) {
            Ok(()) => info!(%challenge_id, %player_id, %key, "recording submitted for scoring"),
            Err(err) => {
                error!(%key, %challenge_id, %player_id, %err, "recording saved but not queued");
                self.report_failure(&challenge_id, &player_id, &err);
            }
        }
    }

    fn report_failure(
        &self,
        challenge_id: &ChallengeId,
        player_id: &PlayerId,
        err: &ScoringError,
    ) {
        let _ = self.events.send(ServerEvent::ScoringFailed {
            challenge_id: challenge_id.clone(),
            player_id: player_id.clone(),
            reason: err.to_string(),
        });
    }

    fn publish(&self, challenge: &Challenge) {
        let _ = self.events.send(ServerEvent::ChallengeUpdated {
            challenge: challenge.clone(),
        });
    }

    /// Applies a score to the player's slot. Late, duplicate and orphaned
    /// scores are ignored and yield `None`.
    pub(crate) async fn ingest_score(
        &self,
        challenge_id: &ChallengeId,
        player_id: &PlayerId,
        score: f64,
    ) -> Result<Option<Challenge>, ChallengeError> {
        let _challenge = self.challenge_locks.lock(challenge_id.clone()).await;
        let mut challenge = match self.repo.get_by_id(challenge_id).await {
            Ok(challenge) => challenge,
            Err(RepositoryError::NotFound(_)) => {
                warn!(%challenge_id, %player_id, "score for unknown challenge ignored");
                return Ok(None);
            }
            Err(err) => return Err(storage_error(err)),
        };

        match machine::apply_score(&mut challenge, player_id, score, Utc::now()) {
            ScoreOutcome::UnknownPlayer => {
                warn!(%challenge_id, %player_id, "score for non-participant ignored");
                return Ok(None);
            }
            ScoreOutcome::AlreadyScored => {
                debug!(%challenge_id, %player_id, "duplicate score ignored");
                return Ok(None);
            }
            ScoreOutcome::Scored => {
                info!(%challenge_id, %player_id, score, "score recorded");
            }
            ScoreOutcome::Completed { winner } => {
                info!(
                    %challenge_id,
                    %player_id,
                    score,
                    winner = winner.as_ref().map(PlayerId::as_str).unwrap_or("tie"),
                    "challenge completed"
                );
            }
        }

        self.save(&challenge).await?;
        self.publish(&challenge);
        Ok(Some(challenge))
    }
}

#[async_trait]
impl ScoreSink for ChallengeLedger {
    async fn score_ready(&self, challenge_id: &ChallengeId, player_id: &PlayerId, score: f64) {
        if let Err(err) = self.ingest_score(challenge_id, player_id, score).await {
            error!(%challenge_id, %player_id, %err, "failed to store score");
        }
    }

    async fn score_failed(
        &self,
        _key: CorrelationKey,
        challenge_id: &ChallengeId,
        player_id: &PlayerId,
        error: &ScoringError,
    ) {
        self.report_failure(challenge_id, player_id, error);
    }
}

fn require(ok: bool, message: &str) -> Result<(), ChallengeError> {
    if ok {
        Ok(())
    } else {
        Err(ChallengeError::Validation(message.to_string()))
    }
}

fn storage_error(err: RepositoryError) -> ChallengeError {
    match err {
        RepositoryError::NotFound(id) => ChallengeError::NotFound(id),
        other => ChallengeError::Storage(other.to_string()),
    }
}

#[cfg(test)]
#[path = "tests/service_tests.rs"]
mod tests;
