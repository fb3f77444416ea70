use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::domain::{
    Challenge, ChallengeId, ChallengeStatus, Player, PlayerId, PlayerStatus,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, SqliteConnection,
};

use crate::{ChallengeRepository, RepositoryError, Result};

const PLAYER1_SLOT: i64 = 1;
const PLAYER2_SLOT: i64 = 2;

#[derive(Clone)]
pub struct SqliteChallengeRepository {
    pool: Pool<Sqlite>,
}

impl SqliteChallengeRepository {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Shared-cache memory databases lock whole tables; one connection
        // keeps writers from tripping over each other.
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn load_players(
        conn: &mut SqliteConnection,
        challenge_id: &str,
    ) -> Result<(Option<Player>, Option<Player>)> {
        let rows = sqlx::query(
            "SELECT slot, id, username, status, score, audio_url, created_at, updated_at
             FROM players
             WHERE challenge_id = ?1
             ORDER BY slot",
        )
        .bind(challenge_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut player1 = None;
        let mut player2 = None;
        for row in rows {
            let slot: i64 = row.try_get("slot")?;
            let player = player_from_row(challenge_id, &row)?;
            match slot {
                PLAYER1_SLOT => player1 = Some(player),
                PLAYER2_SLOT => player2 = Some(player),
                other => {
                    return Err(corrupt(challenge_id, format!("unexpected player slot {other}")))
                }
            }
        }
        Ok((player1, player2))
    }

    async fn load(conn: &mut SqliteConnection, id: &str) -> Result<Option<Challenge>> {
        let row = sqlx::query(
            "SELECT id, song_id, song_title, status, current_turn, winner_id,
                    created_at, updated_at, completed_at
             FROM challenges
             WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let (player1, player2) = Self::load_players(conn, id).await?;
        let player1 = player1.ok_or_else(|| corrupt(id, "challenge has no players"))?;

        let status: String = row.try_get("status")?;
        let status = ChallengeStatus::parse(&status)
            .ok_or_else(|| corrupt(id, format!("unknown challenge status '{status}'")))?;

        Ok(Some(Challenge {
            id: ChallengeId(row.try_get("id")?),
            song_id: row.try_get("song_id")?,
            song_title: row.try_get("song_title")?,
            status,
            player1,
            player2,
            current_turn: row
                .try_get::<Option<String>, _>("current_turn")?
                .filter(|turn| !turn.is_empty())
                .map(PlayerId),
            winner_id: row
                .try_get::<Option<String>, _>("winner_id")?
                .filter(|winner| !winner.is_empty())
                .map(PlayerId),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        }))
    }
}

#[async_trait]
impl ChallengeRepository for SqliteChallengeRepository {
    async fn create(&self, challenge: &Challenge) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO challenges (
                id, song_id, song_title, status, current_turn, winner_id,
                created_at, updated_at, completed_at
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(challenge.id.as_str())
        .bind(&challenge.song_id)
        .bind(&challenge.song_title)
        .bind(challenge.status.as_str())
        .bind(challenge.current_turn.as_ref().map(PlayerId::as_str))
        .bind(challenge.winner_id.as_ref().map(PlayerId::as_str))
        .bind(challenge.created_at)
        .bind(challenge.updated_at)
        .bind(challenge.completed_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(RepositoryError::AlreadyExists(challenge.id.clone()));
            }
            Err(err) => return Err(err.into()),
        }

        upsert_player(&mut tx, &challenge.id, PLAYER1_SLOT, &challenge.player1).await?;
        if let Some(player2) = &challenge.player2 {
            upsert_player(&mut tx, &challenge.id, PLAYER2_SLOT, player2).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_by_id(&self, id: &ChallengeId) -> Result<Challenge> {
        let mut conn = self.pool.acquire().await?;
        Self::load(&mut conn, id.as_str())
            .await?
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))
    }

    async fn update(&self, challenge: &Challenge) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE challenges
             SET song_id = ?1, song_title = ?2, status = ?3, current_turn = ?4,
                 winner_id = ?5, updated_at = ?6, completed_at = ?7
             WHERE id = ?8",
        )
        .bind(&challenge.song_id)
        .bind(&challenge.song_title)
        .bind(challenge.status.as_str())
        .bind(challenge.current_turn.as_ref().map(PlayerId::as_str))
        .bind(challenge.winner_id.as_ref().map(PlayerId::as_str))
        .bind(challenge.updated_at)
        .bind(challenge.completed_at)
        .bind(challenge.id.as_str())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(challenge.id.clone()));
        }

        upsert_player(&mut tx, &challenge.id, PLAYER1_SLOT, &challenge.player1).await?;
        if let Some(player2) = &challenge.player2 {
            upsert_player(&mut tx, &challenge.id, PLAYER2_SLOT, player2).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Challenge>> {
        let mut conn = self.pool.acquire().await?;
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM challenges ORDER BY created_at DESC, rowid DESC")
                .fetch_all(&mut *conn)
                .await?;

        let mut challenges = Vec::with_capacity(ids.len());
        for id in ids {
            // A row can only vanish under external deletion; skip it rather than fail the listing.
            if let Some(challenge) = Self::load(&mut conn, &id).await? {
                challenges.push(challenge);
            }
        }
        Ok(challenges)
    }

    async fn get_active_by_player(&self, player_id: &PlayerId) -> Result<Option<Challenge>> {
        let mut conn = self.pool.acquire().await?;
        let id: Option<String> = sqlx::query_scalar(
            "SELECT c.id
             FROM challenges c
             INNER JOIN players p ON p.challenge_id = c.id
             WHERE p.id = ?1 AND c.status != ?2
             ORDER BY c.created_at DESC
             LIMIT 1",
        )
        .bind(player_id.as_str())
        .bind(ChallengeStatus::Completed.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        match id {
            Some(id) => Self::load(&mut conn, &id).await,
            None => Ok(None),
        }
    }

    async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

async fn upsert_player(
    conn: &mut SqliteConnection,
    challenge_id: &ChallengeId,
    slot: i64,
    player: &Player,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO players (
            id, challenge_id, slot, username, status, score, audio_url, created_at, updated_at
         )
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id, challenge_id) DO UPDATE SET
            username = excluded.username,
            status = excluded.status,
            score = excluded.score,
            audio_url = excluded.audio_url,
            updated_at = excluded.updated_at",
    )
    .bind(player.id.as_str())
    .bind(challenge_id.as_str())
    .bind(slot)
    .bind(&player.username)
    .bind(player.status.as_str())
    .bind(player.score)
    .bind(player.audio_url.as_deref())
    .bind(player.created_at)
    .bind(player.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn player_from_row(challenge_id: &str, row: &SqliteRow) -> Result<Player> {
    let status: String = row.try_get("status")?;
    let status = PlayerStatus::parse(&status)
        .ok_or_else(|| corrupt(challenge_id, format!("unknown player status '{status}'")))?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(Player {
        id: PlayerId(row.try_get("id")?),
        username: row.try_get("username")?,
        status,
        score: row.try_get("score")?,
        audio_url: row
            .try_get::<Option<String>, _>("audio_url")?
            .filter(|url| !url.is_empty()),
        created_at,
        updated_at,
    })
}

fn corrupt(id: &str, reason: impl Into<String>) -> RepositoryError {
    RepositoryError::Corrupt {
        id: id.to_string(),
        reason: reason.into(),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).map_err(|source| RepositoryError::CreateDir {
        path: parent.to_path_buf(),
        source,
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() || path == ":memory:" {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}
