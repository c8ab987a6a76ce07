//! Application configuration.

use std::path::Path;

use chrono::TimeDelta;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
    value::Uncased,
};

use humantime::format_duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};

use anyhow::Error;

/// Full application configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub sharding: ShardingConfig,
    pub session: SessionConfig,
    pub matchmaking: MatchmakingConfig,
    pub matchmaker: MatchmakerConfig,
    pub rate_limit: RateLimitConfig,
    pub mmr: MmrConfig,
    pub http: HttpConfig,
    pub auth: AuthConfig,
    pub discord: Option<DiscordConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            sharding: ShardingConfig::default(),
            session: SessionConfig::default(),
            matchmaking: MatchmakingConfig::default(),
            matchmaker: MatchmakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            mmr: MmrConfig::default(),
            http: HttpConfig::default(),
            auth: AuthConfig::default(),
            discord: None,
        }
    }
}

/// General server configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    /// The base url this worker is reachable at.
    pub base_url: String,
    /// The database url to connect to.
    pub database_url: Option<String>,
    /// Leftover from the teacher's cookie-session login, which this crate
    /// has no browser-facing surface for (see DESIGN.md); unread, slated
    /// for removal alongside `tower-sessions` in the trimming pass.
    pub secure_sessions: bool,
    /// Leftover from the teacher's cookie-session login; unread, slated
    /// for removal alongside `tower-sessions` in the trimming pass.
    pub encryption_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            base_url: "http://localhost:4000".into(),
            database_url: None,
            secure_sessions: true,
            encryption_key: None,
        }
    }
}

/// This worker's identity within the fleet.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ShardingConfig {
    /// This process's worker index. Every session id routed to this worker
    /// must satisfy `hash(session_id) % num_workers == worker_id`.
    pub worker_id: u32,
    /// The total number of workers in the fleet.
    pub num_workers: u32,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        ShardingConfig {
            worker_id: 0,
            num_workers: 1,
        }
    }
}

/// Timings for the per-session turn pump and liveness sweeps.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionConfig {
    /// How often the engine cuts a new turn.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub turn_interval: TimeDelta,
    /// Default lingering time in `Prestart` before `Start()`, when a
    /// session's config doesn't override it.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub default_prestart: TimeDelta,
    /// A client that hasn't sent a transport-level ping in this long is
    /// considered dead and marked disconnected.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub heartbeat_timeout: TimeDelta,
    /// A client marked disconnected for longer than this is evicted from
    /// the session entirely (the 60s simulation-liveness threshold).
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub eviction_timeout: TimeDelta,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            turn_interval: TimeDelta::milliseconds(1_000),
            default_prestart: TimeDelta::seconds(2),
            heartbeat_timeout: TimeDelta::seconds(30),
            eviction_timeout: TimeDelta::seconds(60),
        }
    }
}

/// Matchmaking queue and accept-coordinator timings.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MatchmakingConfig {
    /// How often the queue recalculates match candidates.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub recalculate_interval: TimeDelta,
    /// How long a proposed match waits for every participant to accept.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub accept_window: TimeDelta,
    /// Dodge-penalty escalator, in seconds of requeue lockout, applied in
    /// order on the 1st, 2nd, 3rd+ dodge within the lookback window.
    pub dodge_penalty_seconds: Vec<u32>,
    /// How long the poller waits between a ranked client's queue
    /// check-ins, before jitter.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub poll_interval: TimeDelta,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        MatchmakingConfig {
            recalculate_interval: TimeDelta::seconds(10),
            accept_window: TimeDelta::seconds(20),
            dodge_penalty_seconds: vec![120, 300, 600],
            poll_interval: TimeDelta::seconds(5),
        }
    }
}

/// The external matchmaker the worker checks in with for public/quickplay
/// session assignment, distinct from the ranked queue's own pairing.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MatchmakerConfig {
    /// Base URL of the external matchmaker. When unset, the check-in loop
    /// idles: there is nothing to announce capacity to.
    pub base_url: Option<String>,
    /// Roughly how often this worker checks in, before jitter.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub check_in_interval: TimeDelta,
    /// How long after an assignment the session waits before `Start()`, so
    /// clients have time to stream their WebSocket join.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub assignment_start_delay: TimeDelta,
}

impl Default for MatchmakerConfig {
    fn default() -> Self {
        MatchmakerConfig {
            base_url: None,
            check_in_interval: TimeDelta::seconds(5),
            assignment_start_delay: TimeDelta::seconds(7),
        }
    }
}

/// The outer per-IP request cap every HTTP route sits behind, independent
/// of the session-level intent stream (which is never rate-limited per
/// intent — see `SPEC_FULL.md` §4.1 failure semantics).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests a single source IP may make within one window.
    pub requests_per_window: u32,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub window: TimeDelta,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            requests_per_window: 120,
            window: TimeDelta::seconds(60),
        }
    }
}

/// Configuration for the Glicko-2 rating engine.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MmrConfig {
    pub enabled: bool,
    /// The rating period: ratings only move at period boundaries.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub period: TimeDelta,
    /// Constrains the change in volatility over time. See the [Glicko-2]
    /// paper for more.
    ///
    /// [Glicko-2]: https://www.glicko.net/glicko/glicko2.pdf
    pub tau: f64,
    pub defaults: PlayerRatingDefaults,
}

impl Default for MmrConfig {
    fn default() -> Self {
        MmrConfig {
            enabled: true,
            period: TimeDelta::seconds(86_400),
            tau: 0.5,
            defaults: PlayerRatingDefaults::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PlayerRatingDefaults {
    pub rating: f64,
    pub deviation: f64,
    pub volatility: f64,
}

impl Default for PlayerRatingDefaults {
    fn default() -> Self {
        PlayerRatingDefaults {
            rating: 1500.0,
            deviation: 350.0,
            volatility: 0.06,
        }
    }
}

/// HTTP server configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HttpConfig {
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig { port: 4000 }
    }
}

/// Bearer-JWT verification configuration for the session-control API.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    pub jwt_issuer: String,
    pub jwt_audience: String,
    /// HMAC secret used to verify inbound tokens. In production this is
    /// provisioned out-of-band by whatever issues tokens (outside this
    /// crate's scope; see `SPEC_FULL.md` Non-goals).
    pub jwt_secret: Option<String>,
    /// The header name admin-only routes (public session creation,
    /// `kick_player`) check, per §6's "admin header for public".
    pub admin_header_name: String,
    pub admin_token: Option<String>,
    /// Turnstile secret backing `HumanCheck`. Unset means the no-op
    /// implementation runs (local development, practice sessions); a real
    /// verifying implementation is out of scope (see `SPEC_FULL.md`
    /// Non-goals).
    pub turnstile_secret: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            jwt_issuer: "turnkeep".into(),
            jwt_audience: "turnkeep-worker".into(),
            jwt_secret: None,
            admin_header_name: "x-admin-token".into(),
            admin_token: None,
            turnstile_secret: None,
        }
    }
}

/// Discord OAuth2 configuration, backing the default `RoleProvider`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DiscordConfig {
    pub client_id: u64,
    pub client_secret: String,
}

/// Reads the configuration.
pub fn read_config(config_file: impl AsRef<Path>) -> Result<Config, Error> {
    Figment::from(Serialized::defaults(Config::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("TURNKEEP_"))
        .merge(Env::raw().filter_map(|k| match k.as_str() {
            "DATABASE_URL" => Some(Uncased::from("server.database_url")),
            "DISCORD_CLIENT_ID" => Some(Uncased::from("discord.client_id")),
            "DISCORD_CLIENT_SECRET" => Some(Uncased::from("discord.client_secret")),
            "ENCRYPTION_KEY" => Some(Uncased::from("server.encryption_key")),
            "JWT_SECRET" => Some(Uncased::from("auth.jwt_secret")),
            "TURNSTILE_SECRET" => Some(Uncased::from("auth.turnstile_secret")),
            "ADMIN_TOKEN" => Some(Uncased::from("auth.admin_token")),
            "ADMIN_HEADER_NAME" => Some(Uncased::from("auth.admin_header_name")),
            "MATCHMAKER_URL" => Some(Uncased::from("matchmaker.base_url")),
            "RATE_LIMIT_PER_WINDOW" => Some(Uncased::from("rate_limit.requests_per_window")),
            "WORKER_ID" => Some(Uncased::from("sharding.worker_id")),
            "NUM_WORKERS" => Some(Uncased::from("sharding.num_workers")),
            "PORT" => Some(Uncased::from("http.port")),
            _ => None,
        }))
        .extract()
        .map_err(From::from)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<TimeDelta, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    let duration = humantime::parse_duration(&text).map_err(D::Error::custom)?;

    TimeDelta::from_std(duration).map_err(D::Error::custom)
}

fn serialize_duration<S>(delta: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    format_duration(delta.to_std().expect("positive time delta"))
        .to_string()
        .serialize(serializer)
}
