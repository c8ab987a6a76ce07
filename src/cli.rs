//! `turnkeep` command-line interface.

use std::path::PathBuf;

use chrono::Utc;

use clap::{Parser, Subcommand};

use anyhow::Error;
use sqlx::{SqliteConnection, SqlitePool};

use crate::auth::jwt::generate_signing_key;
use crate::ranked::repository;

/// The command line arguments.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Configuration file path.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// The command to run. Absent runs the worker server.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Operational commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Registers this process as a worker in the fleet's shard table.
    #[command(name = "register-worker")]
    RegisterWorker(RegisterWorker),
    /// Generates a cookie-encryption or JWT-signing key and prints it.
    #[command(name = "generate-key")]
    GenerateKey(GenerateKey),
    /// Dumps the ranked leaderboard for a season as CSV.
    #[command(name = "dump-ratings")]
    DumpRatings(DumpRatings),
}

#[derive(clap::Args, Debug)]
pub struct RegisterWorker {
    pub worker_id: u32,
    pub base_url: String,
}

#[derive(clap::Args, Debug)]
pub struct GenerateKey {
    #[arg(long, default_value_t = false)]
    pub jwt: bool,
}

#[derive(clap::Args, Debug)]
pub struct DumpRatings {
    pub season_id: String,
}

/// Registers a worker.
pub async fn register_worker(
    command: &RegisterWorker,
    conn: &mut SqliteConnection,
) -> Result<(), Error> {
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO worker (worker_id, base_url, inserted_at, updated_at)
        VALUES ($1, $2, $3, $3)
        ON CONFLICT (worker_id) DO UPDATE SET base_url = excluded.base_url, updated_at = $3
        "#,
    )
    .bind(command.worker_id)
    .bind(&command.base_url)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    tracing::info!(worker_id = command.worker_id, "registered worker");

    Ok(())
}

/// Writes the season's leaderboard to stdout as CSV.
pub async fn dump_ratings(command: &DumpRatings, pool: &SqlitePool) -> Result<(), Error> {
    let ratings = repository::list_ratings(pool, &command.season_id).await?;

    println!("persistent_id,rating,deviation,volatility,updated_at");
    for rating in ratings {
        println!(
            "{},{},{},{},{}",
            rating.persistent_id.as_str(),
            rating.rating,
            rating.deviation,
            rating.volatility,
            rating.updated_at.to_rfc3339(),
        );
    }

    Ok(())
}

pub fn generate_key(command: &GenerateKey) {
    if command.jwt {
        println!("{}", generate_signing_key());
    } else {
        let key = cookie::Key::generate();
        println!("{}", base16::encode_lower(key.master()));
    }
}
