use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(ChallengeId);
id_newtype!(PlayerId);

impl ChallengeId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    Pending,
    Active,
    Completed,
}

impl ChallengeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    Waiting,
    Recording,
    Done,
}

impl PlayerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Recording => "recording",
            Self::Done => "done",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "waiting" => Some(Self::Waiting),
            "recording" => Some(Self::Recording),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: PlayerId,
    pub username: String,
    pub status: PlayerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Player {
    pub fn new(id: PlayerId, username: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            username: username.into(),
            status: PlayerStatus::Waiting,
            score: None,
            audio_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recorded but still waiting on the scoring pipeline.
    pub fn awaiting_score(&self) -> bool {
        self.status == PlayerStatus::Done && self.score.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: ChallengeId,
    pub song_id: String,
    pub song_title: String,
    pub status: ChallengeStatus,
    pub player1: Player,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player2: Option<Player>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_turn: Option<PlayerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<PlayerId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("pending challenge must have exactly one player")]
    PendingWithSecondPlayer,
    #[error("pending challenge must not have a current turn")]
    PendingWithTurn,
    #[error("{0:?} challenge is missing its second player")]
    MissingSecondPlayer(ChallengeStatus),
    #[error("both player slots hold {0}")]
    DuplicatePlayer(PlayerId),
    #[error("current turn {0} is not a participant")]
    TurnNotParticipant(PlayerId),
    #[error("completed challenge has no completion timestamp")]
    MissingCompletedAt,
    #[error("completed challenge has an unscored player")]
    CompletedUnscored,
    #[error("winner {actual:?} does not match scores (expected {expected:?})")]
    WrongWinner {
        expected: Option<PlayerId>,
        actual: Option<PlayerId>,
    },
    #[error("non-completed challenge carries completion data")]
    PrematureCompletion,
}

impl Challenge {
    pub fn new(
        id: ChallengeId,
        creator: Player,
        song_id: impl Into<String>,
        song_title: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            song_id: song_id.into(),
            song_title: song_title.into(),
            status: ChallengeStatus::Pending,
            player1: creator,
            player2: None,
            current_turn: None,
            winner_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        std::iter::once(&self.player1).chain(self.player2.iter())
    }

    pub fn player(&self, player_id: &PlayerId) -> Option<&Player> {
        self.players().find(|player| &player.id == player_id)
    }

    pub fn player_mut(&mut self, player_id: &PlayerId) -> Option<&mut Player> {
        if &self.player1.id == player_id {
            return Some(&mut self.player1);
        }
        self.player2
            .as_mut()
            .filter(|player| &player.id == player_id)
    }

    pub fn is_participant(&self, player_id: &PlayerId) -> bool {
        self.player(player_id).is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.status == ChallengeStatus::Completed
    }

    /// Both scores, once both players exist and both have been scored.
    pub fn scores(&self) -> Option<(f64, f64)> {
        let p1 = self.player1.score?;
        let p2 = self.player2.as_ref()?.score?;
        Some((p1, p2))
    }

    /// Winner by strict comparison; `None` on an exact tie or while unscored.
    pub fn leading_player(&self) -> Option<PlayerId> {
        let (p1, p2) = self.scores()?;
        let player2 = self.player2.as_ref()?;
        if p1 > p2 {
            Some(self.player1.id.clone())
        } else if p2 > p1 {
            Some(player2.id.clone())
        } else {
            None
        }
    }

    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        match self.status {
            ChallengeStatus::Pending => {
                if self.player2.is_some() {
                    return Err(InvariantViolation::PendingWithSecondPlayer);
                }
                if self.current_turn.is_some() {
                    return Err(InvariantViolation::PendingWithTurn);
                }
            }
            ChallengeStatus::Active | ChallengeStatus::Completed => {
                let Some(player2) = self.player2.as_ref() else {
                    return Err(InvariantViolation::MissingSecondPlayer(self.status));
                };
                if player2.id == self.player1.id {
                    return Err(InvariantViolation::DuplicatePlayer(player2.id.clone()));
                }
                if let Some(turn) = &self.current_turn {
                    if !self.is_participant(turn) {
                        return Err(InvariantViolation::TurnNotParticipant(turn.clone()));
                    }
                }
            }
        }

        if self.is_completed() {
            if self.completed_at.is_none() {
                return Err(InvariantViolation::MissingCompletedAt);
            }
            if self.scores().is_none() {
                return Err(InvariantViolation::CompletedUnscored);
            }
            let expected = self.leading_player();
            if expected != self.winner_id {
                return Err(InvariantViolation::WrongWinner {
                    expected,
                    actual: self.winner_id.clone(),
                });
            }
        } else if self.completed_at.is_some() || self.winner_id.is_some() {
            return Err(InvariantViolation::PrematureCompletion);
        }

        Ok(())
    }
}
