use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ChallengeId, PlayerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Conflict,
    InvalidTurn,
    Capacity,
    UpstreamFailure,
    Validation,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChallengeError {
    #[error("challenge {0} not found")]
    NotFound(ChallengeId),
    #[error("player {player_id} is not part of challenge {challenge_id}")]
    UnknownPlayer {
        challenge_id: ChallengeId,
        player_id: PlayerId,
    },
    #[error("player {0} is already in an active challenge")]
    PlayerBusy(PlayerId),
    #[error("challenge {0} already has two players")]
    AlreadyFull(ChallengeId),
    #[error("cannot join your own challenge")]
    SelfJoin,
    #[error("player {0} has already recorded")]
    AlreadyRecorded(PlayerId),
    #[error("challenge {0} already completed")]
    Completed(ChallengeId),
    #[error("not {player_id}'s turn to record")]
    WrongTurn {
        player_id: PlayerId,
        current_turn: Option<PlayerId>,
    },
    #[error("scoring queue is full, retry later")]
    QueueFull,
    #[error("scoring failed: {0}")]
    Upstream(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl ChallengeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) | Self::UnknownPlayer { .. } => ErrorCode::NotFound,
            Self::PlayerBusy(_)
            | Self::AlreadyFull(_)
            | Self::SelfJoin
            | Self::AlreadyRecorded(_)
            | Self::Completed(_) => ErrorCode::Conflict,
            Self::WrongTurn { .. } => ErrorCode::InvalidTurn,
            Self::QueueFull => ErrorCode::Capacity,
            Self::Upstream(_) => ErrorCode::UpstreamFailure,
            Self::Validation(_) => ErrorCode::Validation,
            Self::Storage(_) => ErrorCode::Internal,
        }
    }
}

impl From<ChallengeError> for ApiError {
    fn from(value: ChallengeError) -> Self {
        Self::new(value.code(), value.to_string())
    }
}
