use std::{io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;

use axum::{
    Router,
    extract::{MatchedPath, Request},
    middleware::{from_fn, from_fn_with_state},
    response::Response,
};

use axum_server::Handle;

use turnkeep::{
    app::{AppError, AppState},
    archive::InMemoryArchiveSink,
    auth::human_check::{HumanCheck, NoopHumanCheck},
    auth::jwt::JwtVerifier,
    auth::roles::{DiscordRoleProvider, NoopRoleProvider, RoleProvider},
    cli::{Args, Command, dump_ratings, generate_key, register_worker},
    config::read_config,
    manager::SessionManager,
    matchmaker::{DisabledMatchmakerClient, HttpMatchmakerClient, MatchmakerClient, MatchmakingPoller},
    ranked::RankedCoordinator,
    rate_limit::{RateLimiter, enforce_rate_limit},
    worker,
};

use anyhow::Error;

use sqlx::{Connection, SqliteConnection, pool::PoolOptions};

use tokio::{main, select, signal};

use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt,
};

#[main]
async fn main() -> Result<(), Error> {
    dotenv::dotenv().ok();
    fmt::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Args::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => PathBuf::from("config.toml"),
    };

    let config = read_config(config_path)?;

    let database_url = config
        .server
        .database_url
        .clone()
        .ok_or_else(|| Error::msg("No `DATABASE_URL` set!"))?;

    if let Some(command) = cli.command.as_ref() {
        match command {
            Command::RegisterWorker(args) => {
                let mut conn = SqliteConnection::connect(&database_url).await?;
                let mut tx = conn.begin().await?;
                register_worker(args, &mut tx).await?;
                tx.commit().await?;
                conn.close().await?;
            }
            Command::GenerateKey(args) => generate_key(args),
            Command::DumpRatings(args) => {
                let pool = PoolOptions::new().connect(&database_url).await?;
                dump_ratings(args, &pool).await?;
                pool.close().await;
            }
        }

        return Ok(());
    }

    tracing::info!("establishing connection to database");
    let db = PoolOptions::new().connect(&database_url).await?;

    tracing::info!("running migrations");
    sqlx::migrate!("./migrations").run(&db).await?;

    let archive = Arc::new(InMemoryArchiveSink::new());

    let jwt = Arc::new(JwtVerifier::new(&config.auth)?);

    let roles: Arc<dyn RoleProvider> = match config.discord.as_ref() {
        Some(discord_config) => {
            let guild_id = std::env::var("DISCORD_GUILD_ID")
                .ok()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| Error::msg("DISCORD_GUILD_ID must be set when discord is configured"))?;
            let bot_token = std::env::var("DISCORD_BOT_TOKEN")
                .map_err(|_| Error::msg("DISCORD_BOT_TOKEN must be set when discord is configured"))?;
            Arc::new(DiscordRoleProvider::new(discord_config, guild_id, bot_token)?)
        }
        None => {
            tracing::warn!("no discord configuration found; role gating is disabled");
            Arc::new(NoopRoleProvider)
        }
    };

    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&archive) as Arc<dyn turnkeep::archive::ArchiveSink>,
        config.session.turn_interval.to_std()?,
    ));
    sessions.spawn_tick();

    let ranked = Arc::new(RankedCoordinator::new(
        db.clone(),
        Arc::clone(&sessions),
        config.matchmaking.clone(),
        config.mmr.clone(),
        config.sharding.worker_id,
        config.sharding.num_workers,
    ));
    ranked.restore().await?;
    ranked.spawn_tick();

    let matchmaker_client: Arc<dyn MatchmakerClient> = match config.matchmaker.base_url.as_ref() {
        Some(base_url) => Arc::new(HttpMatchmakerClient::new(base_url.clone())),
        None => {
            tracing::info!("no matchmaker base url configured; public check-in is disabled");
            Arc::new(DisabledMatchmakerClient)
        }
    };
    Arc::new(MatchmakingPoller::new(
        config.sharding.worker_id,
        config.sharding.num_workers,
        matchmaker_client,
        Arc::clone(&sessions),
        &config.matchmaker,
    ))
    .spawn();

    if config.auth.turnstile_secret.is_some() {
        tracing::warn!(
            "turnstile_secret is configured but no verifying HumanCheck implementation exists \
             (contract only); every join still passes the no-op check"
        );
    }
    let human_check: Arc<dyn HumanCheck> = Arc::new(NoopHumanCheck);

    let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    tokio::spawn({
        let rate_limiter = Arc::clone(&rate_limiter);
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                rate_limiter.sweep().await;
            }
        }
    });

    let state = AppState {
        db: db.clone(),
        worker_id: config.sharding.worker_id,
        num_workers: config.sharding.num_workers,
        sessions,
        ranked,
        jwt,
        roles,
        auth: Arc::new(config.auth.clone()),
        archive,
        rate_limiter,
        human_check,
    };

    let router = Router::new()
        .merge(worker::router(state.clone()))
        .nest("/ranked", turnkeep::ranked::routes::router())
        .with_state(state.clone())
        .layer(from_fn_with_state(state, enforce_rate_limit))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();
                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());
                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
        .layer(CompressionLayer::new())
        .layer(
            CorsLayer::new()
                .allow_methods(Any)
                .allow_origin(Any)
                .allow_headers(Any),
        )
        .layer(from_fn(log_app_errors));

    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone()));

    let addr: SocketAddr = ([0, 0, 0, 0], config.http.port).into();
    tracing::info!(worker_id = config.sharding.worker_id, "listening on {} (http)", addr);

    axum_server::bind(addr)
        .handle(handle)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    tracing::info!("shutting down");
    db.close().await;

    Ok(())
}

async fn log_app_errors(request: Request, next: axum::middleware::Next) -> Response {
    let response = next.run(request).await;
    if let Some(err) = response.extensions().get::<Arc<AppError>>() {
        tracing::error!(?err, "an unexpected error occurred inside a handler");
    }
    response
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    select! {
        _ = ctrl_c => { handle.shutdown() }
        _ = terminate => { handle.shutdown() }
    }
}
