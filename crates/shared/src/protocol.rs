use serde::{Deserialize, Serialize};

use crate::domain::{Challenge, ChallengeId, PlayerId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChallengeRequest {
    pub player_id: PlayerId,
    pub username: String,
    pub song_id: String,
    pub song_title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinChallengeRequest {
    pub player_id: PlayerId,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRecordingRequest {
    pub player_id: PlayerId,
    pub audio_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    ChallengeUpdated {
        challenge: Challenge,
    },
    ScoringFailed {
        challenge_id: ChallengeId,
        player_id: PlayerId,
        reason: String,
    },
}
