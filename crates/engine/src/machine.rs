//! Pure challenge transitions. Nothing here touches storage or scoring; the
//! service wraps each call in the challenge's exclusive section.

use chrono::{DateTime, Utc};
use shared::{
    domain::{Challenge, ChallengeId, ChallengeStatus, Player, PlayerId, PlayerStatus},
    error::ChallengeError,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ScoreOutcome {
    UnknownPlayer,
    AlreadyScored,
    Scored,
    Completed { winner: Option<PlayerId> },
}

pub(crate) fn open(
    id: ChallengeId,
    creator_id: PlayerId,
    username: &str,
    song_id: &str,
    song_title: &str,
    now: DateTime<Utc>,
) -> Challenge {
    Challenge::new(
        id,
        Player::new(creator_id, username, now),
        song_id,
        song_title,
        now,
    )
}

pub(crate) fn join(
    challenge: &mut Challenge,
    player_id: PlayerId,
    username: &str,
    now: DateTime<Utc>,
) -> Result<(), ChallengeError> {
    if challenge.status != ChallengeStatus::Pending {
        return Err(ChallengeError::AlreadyFull(challenge.id.clone()));
    }
    if challenge.player1.id == player_id {
        return Err(ChallengeError::SelfJoin);
    }

    challenge.player2 = Some(Player::new(player_id, username, now));
    challenge.status = ChallengeStatus::Active;
    challenge.current_turn = Some(challenge.player1.id.clone());
    challenge.player1.status = PlayerStatus::Recording;
    challenge.player1.updated_at = now;
    challenge.updated_at = now;
    Ok(())
}

pub(crate) fn record(
    challenge: &mut Challenge,
    player_id: &PlayerId,
    audio_url: &str,
    now: DateTime<Utc>,
) -> Result<(), ChallengeError> {
    if challenge.is_completed() {
        return Err(ChallengeError::Completed(challenge.id.clone()));
    }
    if challenge.current_turn.as_ref() != Some(player_id) {
        return Err(ChallengeError::WrongTurn {
            player_id: player_id.clone(),
            current_turn: challenge.current_turn.clone(),
        });
    }

    let challenge_id = challenge.id.clone();
    let player = challenge
        .player_mut(player_id)
        .ok_or_else(|| ChallengeError::UnknownPlayer {
            challenge_id,
            player_id: player_id.clone(),
        })?;
    if player.status == PlayerStatus::Done {
        return Err(ChallengeError::AlreadyRecorded(player_id.clone()));
    }

    player.status = PlayerStatus::Done;
    player.audio_url = Some(audio_url.to_string());
    player.updated_at = now;

    if &challenge.player1.id == player_id {
        if let Some(player2) = challenge.player2.as_mut() {
            player2.status = PlayerStatus::Recording;
            player2.updated_at = now;
            challenge.current_turn = Some(player2.id.clone());
        }
    } else {
        challenge.current_turn = None;
    }
    challenge.updated_at = now;
    Ok(())
}

pub(crate) fn apply_score(
    challenge: &mut Challenge,
    player_id: &PlayerId,
    score: f64,
    now: DateTime<Utc>,
) -> ScoreOutcome {
    let Some(player) = challenge.player_mut(player_id) else {
        return ScoreOutcome::UnknownPlayer;
    };
    if player.score.is_some() {
        return ScoreOutcome::AlreadyScored;
    }

    player.score = Some(score);
    player.updated_at = now;
    challenge.updated_at = now;

    if challenge.scores().is_none() {
        return ScoreOutcome::Scored;
    }

    let winner = challenge.leading_player();
    challenge.status = ChallengeStatus::Completed;
    challenge.completed_at = Some(now);
    challenge.current_turn = None;
    challenge.winner_id = winner.clone();
    ScoreOutcome::Completed { winner }
}
