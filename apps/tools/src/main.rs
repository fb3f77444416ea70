use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::domain::{Challenge, ChallengeId, Player};
use storage::{ChallengeRepository, SqliteChallengeRepository};

/// Inspects the challenge store of a duel server.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/duel.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// One line per challenge, newest first.
    List,
    /// Full JSON of one challenge.
    Show { id: String },
    /// Unfinished challenges with a recording that never got a score.
    Stuck,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let repo = SqliteChallengeRepository::new(&cli.database_url)
        .await
        .with_context(|| format!("failed to open challenge store '{}'", cli.database_url))?;

    match cli.command {
        Command::List => {
            for challenge in repo.list().await? {
                println!("{}", summary_line(&challenge));
            }
        }
        Command::Show { id } => {
            let challenge = repo.get_by_id(&ChallengeId::new(id)).await?;
            println!("{}", serde_json::to_string_pretty(&challenge)?);
        }
        Command::Stuck => {
            let stuck = stuck_challenges(repo.list().await?);
            if stuck.is_empty() {
                println!("no stuck challenges");
            }
            for (challenge, waiting) in stuck {
                let waiting: Vec<&str> = waiting.iter().map(|player| player.id.as_str()).collect();
                println!("{}  awaiting score: {}", summary_line(&challenge), waiting.join(", "));
            }
        }
    }

    Ok(())
}

fn summary_line(challenge: &Challenge) -> String {
    let players: Vec<String> = challenge.players().map(player_cell).collect();
    format!(
        "{}  {:<9}  {}  {}  winner={}",
        challenge.id,
        challenge.status.as_str(),
        challenge.song_title,
        players.join(" vs "),
        challenge
            .winner_id
            .as_ref()
            .map(|id| id.as_str())
            .unwrap_or("-"),
    )
}

fn player_cell(player: &Player) -> String {
    match player.score {
        Some(score) => format!("{}({}, {score:.1})", player.id, player.status.as_str()),
        None => format!("{}({})", player.id, player.status.as_str()),
    }
}

fn stuck_challenges(challenges: Vec<Challenge>) -> Vec<(Challenge, Vec<Player>)> {
    challenges
        .into_iter()
        .filter(|challenge| !challenge.is_completed())
        .filter_map(|challenge| {
            let waiting: Vec<Player> = challenge
                .players()
                .filter(|player| player.awaiting_score())
                .cloned()
                .collect();
            (!waiting.is_empty()).then_some((challenge, waiting))
        })
        .collect()
}
