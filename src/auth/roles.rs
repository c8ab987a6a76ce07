//! The `RoleProvider` collaborator: identity/privilege/cosmetic lookups are
//! an external concern (`SPEC_FULL.md` Non-goals); this defines the seam a
//! session's `required_roles` gate calls through, with a Discord-backed
//! implementation reusing the teacher's OAuth2 client construction.

use std::collections::HashSet;

use anyhow::Error;
use oauth2::{
    AuthUrl, ClientId, ClientSecret, EndpointNotSet, EndpointSet, RevocationUrl, TokenUrl,
    basic::BasicClient,
};
use twilight_http::Client as DiscordHttpClient;
use twilight_model::id::{Id, marker::UserMarker};

use crate::config::DiscordConfig;

const DISCORD_AUTHORIZATION_URL: &str = "https://discord.com/oauth2/authorize";
const DISCORD_TOKEN_URL: &str = "https://discord.com/api/oauth2/token";
const DISCORD_REVOCATION_URL: &str = "https://discord.com/api/oauth2/token/revoke";

type DiscordOauthClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointSet, EndpointSet>;

/// Resolves the set of role identifiers an external identity holds.
///
/// A session with `required_roles` set calls this once per join attempt;
/// the session engine treats the result as opaque role ids and only ever
/// checks set membership.
pub trait RoleProvider: Send + Sync {
    fn roles_for<'a>(
        &'a self,
        persistent_id: &'a str,
    ) -> futures_util::future::BoxFuture<'a, Result<HashSet<String>, Error>>;
}

/// A `RoleProvider` that grants no roles and is used when no identity
/// backend is configured (local development, practice sessions).
pub struct NoopRoleProvider;

impl RoleProvider for NoopRoleProvider {
    fn roles_for<'a>(
        &'a self,
        _persistent_id: &'a str,
    ) -> futures_util::future::BoxFuture<'a, Result<HashSet<String>, Error>> {
        Box::pin(async { Ok(HashSet::new()) })
    }
}

/// Resolves roles by looking up a Discord guild member's role list.
pub struct DiscordRoleProvider {
    http: DiscordHttpClient,
    guild_id: u64,
    #[allow(dead_code)]
    oauth_client: DiscordOauthClient,
}

impl DiscordRoleProvider {
    pub fn new(config: &DiscordConfig, guild_id: u64, bot_token: String) -> Result<Self, Error> {
        let oauth_client = BasicClient::new(ClientId::new(config.client_id.to_string()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(AuthUrl::new(DISCORD_AUTHORIZATION_URL.to_owned())?)
            .set_token_uri(TokenUrl::new(DISCORD_TOKEN_URL.to_owned())?)
            .set_revocation_url(RevocationUrl::new(DISCORD_REVOCATION_URL.to_owned())?);

        Ok(DiscordRoleProvider {
            http: DiscordHttpClient::new(bot_token),
            guild_id,
            oauth_client,
        })
    }
}

impl RoleProvider for DiscordRoleProvider {
    fn roles_for<'a>(
        &'a self,
        persistent_id: &'a str,
    ) -> futures_util::future::BoxFuture<'a, Result<HashSet<String>, Error>> {
        Box::pin(async move {
            let user_id: Id<UserMarker> = Id::new(persistent_id.parse::<u64>()?);
            let guild_id = Id::new(self.guild_id);

            let member = self
                .http
                .guild_member(guild_id, user_id)
                .await?
                .model()
                .await?;

            Ok(member.roles.into_iter().map(|r| r.to_string()).collect())
        })
    }
}
