//! Discord REST client: native Rust implementation of the v10 HTTP API,
//! scoped to one guild.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{ChannelId, ChatPlatform, GuildRole, Member, RoleId, ScheduledEventSpec, UserId};
use crate::error::PlatformError;

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Maximum message length for the create-message endpoint.
const DISCORD_MAX_MESSAGE_LENGTH: usize = 2000;

/// Page size for the list-members endpoint.
const MEMBER_PAGE_SIZE: usize = 1000;

/// Scheduled event entity type for events held somewhere other than a channel.
const ENTITY_TYPE_EXTERNAL: u8 = 3;
const PRIVACY_GUILD_ONLY: u8 = 2;

#[derive(Deserialize)]
struct RawRole {
    id: String,
    name: String,
    #[serde(default)]
    permissions: String,
}

#[derive(Deserialize)]
pub(crate) struct RawUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct RawMember {
    pub user: RawUser,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Deserialize)]
struct RawGuild {
    owner_id: String,
}

#[derive(Deserialize)]
struct RawScheduledEvent {
    id: String,
}

#[derive(Deserialize)]
struct RateLimitBody {
    retry_after: f64,
}

pub(crate) fn snowflake(value: &str) -> Result<u64, PlatformError> {
    value
        .parse()
        .map_err(|_| PlatformError::InvalidPayload(format!("bad snowflake {value:?}")))
}

impl RawMember {
    pub(crate) fn into_member(self) -> Result<Member, PlatformError> {
        let role_ids = self
            .roles
            .iter()
            .map(|r| snowflake(r))
            .collect::<Result<Vec<_>, _>>()?;
        let display_name = self
            .nick
            .or(self.user.global_name)
            .unwrap_or(self.user.username);
        Ok(Member {
            user_id: snowflake(&self.user.id)?,
            display_name,
            role_ids,
        })
    }
}

/// Discord bot client bound to one guild.
pub struct DiscordClient {
    token: SecretString,
    guild_id: u64,
    client: reqwest::Client,
    base_url: String,
    rate_limit_retries: u32,
}

impl DiscordClient {
    pub fn new(token: SecretString, guild_id: u64) -> Self {
        Self::with_base_url(token, guild_id, DISCORD_API_BASE)
    }

    pub fn with_base_url(token: SecretString, guild_id: u64, base_url: impl Into<String>) -> Self {
        Self {
            token,
            guild_id,
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            rate_limit_retries: 2,
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    /// Send a request, waiting out 429s up to the retry limit.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, PlatformError> {
        let mut attempt = 0;
        loop {
            let mut request = self
                .client
                .request(method.clone(), self.api_url(path))
                .header(
                    reqwest::header::AUTHORIZATION,
                    format!("Bot {}", self.token.expose_secret()),
                );
            if let Some(body) = body {
                request = request.json(body);
            }

            let resp = request
                .send()
                .await
                .map_err(|e| PlatformError::Http(e.to_string()))?;

            if resp.status() == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = retry_after(resp).await;
                if attempt >= self.rate_limit_retries {
                    return Err(PlatformError::RateLimited { retry_after });
                }
                attempt += 1;
                tracing::warn!(
                    path = %path,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Discord rate limit hit; waiting"
                );
                tokio::time::sleep(retry_after).await;
                continue;
            }

            if !resp.status().is_success() {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                return Err(PlatformError::Api {
                    method: method.to_string(),
                    path: path.to_string(),
                    status,
                    body,
                });
            }

            return Ok(resp);
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, PlatformError> {
        self.send(Method::GET, path, None)
            .await?
            .json()
            .await
            .map_err(|e| PlatformError::InvalidPayload(e.to_string()))
    }

    async fn send_chunk(&self, channel_id: ChannelId, content: &str) -> Result<(), PlatformError> {
        let body = serde_json::json!({
            "content": content,
            "allowed_mentions": { "parse": ["users"] },
        });
        self.send(Method::POST, &format!("/channels/{channel_id}/messages"), Some(&body))
            .await?;
        Ok(())
    }
}

async fn retry_after(resp: reqwest::Response) -> Duration {
    let header = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok());
    let seconds = match header {
        Some(s) => s,
        None => resp
            .json::<RateLimitBody>()
            .await
            .map(|b| b.retry_after)
            .unwrap_or(1.0),
    };
    if !seconds.is_finite() {
        return Duration::from_secs(1);
    }
    Duration::from_secs_f64(seconds.clamp(0.0, 60.0))
}

/// JSON body shared by create and modify scheduled-event calls.
pub fn scheduled_event_body(event: &ScheduledEventSpec) -> serde_json::Value {
    serde_json::json!({
        "name": event.name,
        "description": event.description,
        "scheduled_start_time": event.start.to_rfc3339(),
        "scheduled_end_time": event.end.to_rfc3339(),
        "privacy_level": PRIVACY_GUILD_ONLY,
        "entity_type": ENTITY_TYPE_EXTERNAL,
        "entity_metadata": { "location": event.location },
    })
}

#[async_trait]
impl ChatPlatform for DiscordClient {
    async fn guild_roles(&self) -> Result<Vec<GuildRole>, PlatformError> {
        let raw: Vec<RawRole> = self.get_json(&format!("/guilds/{}/roles", self.guild_id)).await?;
        raw.into_iter()
            .map(|r| {
                Ok(GuildRole {
                    id: snowflake(&r.id)?,
                    name: r.name,
                    permissions: r.permissions.parse().unwrap_or(0),
                })
            })
            .collect()
    }

    async fn guild_owner(&self) -> Result<UserId, PlatformError> {
        let guild: RawGuild = self.get_json(&format!("/guilds/{}", self.guild_id)).await?;
        snowflake(&guild.owner_id)
    }

    async fn member(&self, user_id: UserId) -> Result<Member, PlatformError> {
        let raw: RawMember = self
            .get_json(&format!("/guilds/{}/members/{user_id}", self.guild_id))
            .await?;
        raw.into_member()
    }

    async fn members(&self) -> Result<Vec<Member>, PlatformError> {
        let mut members = Vec::new();
        let mut after: UserId = 0;
        loop {
            let page: Vec<RawMember> = self
                .get_json(&format!(
                    "/guilds/{}/members?limit={MEMBER_PAGE_SIZE}&after={after}",
                    self.guild_id
                ))
                .await?;
            let full_page = page.len() == MEMBER_PAGE_SIZE;
            for raw in page {
                let member = raw.into_member()?;
                after = after.max(member.user_id);
                members.push(member);
            }
            if !full_page {
                break;
            }
        }
        tracing::debug!(count = members.len(), "Fetched guild members");
        Ok(members)
    }

    async fn add_role(&self, user_id: UserId, role_id: RoleId) -> Result<(), PlatformError> {
        self.send(
            Method::PUT,
            &format!("/guilds/{}/members/{user_id}/roles/{role_id}", self.guild_id),
            None,
        )
        .await?;
        Ok(())
    }

    async fn remove_role(&self, user_id: UserId, role_id: RoleId) -> Result<(), PlatformError> {
        self.send(
            Method::DELETE,
            &format!("/guilds/{}/members/{user_id}/roles/{role_id}", self.guild_id),
            None,
        )
        .await?;
        Ok(())
    }

    /// Long messages are split to fit the 2000-character limit.
    async fn send_message(
        &self,
        channel_id: ChannelId,
        content: &str,
    ) -> Result<(), PlatformError> {
        for chunk in split_message(content, DISCORD_MAX_MESSAGE_LENGTH) {
            self.send_chunk(channel_id, &chunk).await?;
        }
        Ok(())
    }

    async fn create_scheduled_event(
        &self,
        event: &ScheduledEventSpec,
    ) -> Result<String, PlatformError> {
        let created: RawScheduledEvent = self
            .send(
                Method::POST,
                &format!("/guilds/{}/scheduled-events", self.guild_id),
                Some(&scheduled_event_body(event)),
            )
            .await?
            .json()
            .await
            .map_err(|e| PlatformError::InvalidPayload(e.to_string()))?;
        Ok(created.id)
    }

    async fn update_scheduled_event(
        &self,
        event_id: &str,
        event: &ScheduledEventSpec,
    ) -> Result<(), PlatformError> {
        self.send(
            Method::PATCH,
            &format!("/guilds/{}/scheduled-events/{event_id}", self.guild_id),
            Some(&scheduled_event_body(event)),
        )
        .await?;
        Ok(())
    }

    async fn delete_scheduled_event(&self, event_id: &str) -> Result<(), PlatformError> {
        self.send(
            Method::DELETE,
            &format!("/guilds/{}/scheduled-events/{event_id}", self.guild_id),
            None,
        )
        .await?;
        Ok(())
    }
}

/// Split a message into chunks of at most `max_len` bytes, preferring
/// newline then space boundaries and never cutting inside a character.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = max_len;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .filter(|i| *i > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use mockito::Matcher;

    use super::*;

    fn client(server: &mockito::Server) -> DiscordClient {
        DiscordClient::with_base_url(SecretString::from("tok".to_string()), 42, server.url())
    }

    fn member_json(id: u64, roles: &[&str]) -> serde_json::Value {
        serde_json::json!({
            "user": { "id": id.to_string(), "username": format!("user{id}"), "global_name": null },
            "nick": null,
            "roles": roles,
        })
    }

    #[tokio::test]
    async fn roles_are_parsed_with_permissions() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/guilds/42/roles")
            .match_header("authorization", "Bot tok")
            .with_body(
                r#"[{"id":"1","name":"@everyone","permissions":"0"},
                    {"id":"7","name":"Admins","permissions":"8"}]"#,
            )
            .create_async()
            .await;

        let roles = client(&server).guild_roles().await.unwrap();
        assert_eq!(roles.len(), 2);
        assert_eq!(roles[1].id, 7);
        assert_eq!(roles[1].permissions, 8);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn member_display_name_prefers_nick() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/guilds/42/members/5")
            .with_body(
                r#"{"user":{"id":"5","username":"alice","global_name":"Alice A"},
                    "nick":"Ali","roles":["7","9"]}"#,
            )
            .create_async()
            .await;

        let member = client(&server).member(5).await.unwrap();
        assert_eq!(member.user_id, 5);
        assert_eq!(member.display_name, "Ali");
        assert_eq!(member.role_ids, vec![7, 9]);
    }

    #[tokio::test]
    async fn members_follow_pagination() {
        let mut server = mockito::Server::new_async().await;
        let first: Vec<_> = (1..=1000u64).map(|id| member_json(id, &[])).collect();
        server
            .mock("GET", "/guilds/42/members")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("limit".into(), "1000".into()),
                Matcher::UrlEncoded("after".into(), "0".into()),
            ]))
            .with_body(serde_json::Value::Array(first).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/guilds/42/members")
            .match_query(Matcher::UrlEncoded("after".into(), "1000".into()))
            .with_body(serde_json::json!([member_json(1001, &["3"])]).to_string())
            .create_async()
            .await;

        let members = client(&server).members().await.unwrap();
        assert_eq!(members.len(), 1001);
        assert_eq!(members[1000].role_ids, vec![3]);
    }

    #[tokio::test]
    async fn role_changes_hit_member_role_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let put = server
            .mock("PUT", "/guilds/42/members/5/roles/7")
            .with_status(204)
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/guilds/42/members/5/roles/8")
            .with_status(204)
            .create_async()
            .await;

        let client = client(&server);
        client.add_role(5, 7).await.unwrap();
        client.remove_role(5, 8).await.unwrap();
        put.assert_async().await;
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn api_errors_carry_status_and_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/guilds/42/members/5/roles/7")
            .with_status(403)
            .with_body(r#"{"message":"Missing Permissions","code":50013}"#)
            .create_async()
            .await;

        let err = client(&server).add_role(5, 7).await.unwrap_err();
        match err {
            PlatformError::Api { status, body, .. } => {
                assert_eq!(status, 403);
                assert!(body.contains("Missing Permissions"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_surfaces_after_retries() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/guilds/42")
            .with_status(429)
            .with_body(r#"{"message":"You are being rate limited.","retry_after":0.0,"global":false}"#)
            .expect(3)
            .create_async()
            .await;

        let err = client(&server).guild_owner().await.unwrap_err();
        assert!(matches!(err, PlatformError::RateLimited { .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn message_body_is_posted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/channels/9/messages")
            .match_body(Matcher::PartialJson(serde_json::json!({"content": "hello"})))
            .with_body(r#"{"id":"1"}"#)
            .create_async()
            .await;

        client(&server).send_message(9, "hello").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn scheduled_event_create_returns_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/guilds/42/scheduled-events")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "entity_type": 3,
                "entity_metadata": { "location": "TBA" }
            })))
            .with_body(r#"{"id":"555","name":"Worship night"}"#)
            .create_async()
            .await;

        let event = ScheduledEventSpec {
            name: "Worship night".into(),
            description: "Worship night".into(),
            location: "TBA".into(),
            start: Utc.with_ymd_and_hms(2025, 6, 6, 2, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 6, 6, 4, 0, 0).unwrap(),
        };
        let id = client(&server).create_scheduled_event(&event).await.unwrap();
        assert_eq!(id, "555");
    }

    #[tokio::test]
    async fn scheduled_event_update_patches_by_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PATCH", "/guilds/42/scheduled-events/555")
            .match_header("authorization", "Bot tok")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "name": "Worship night (moved)",
                "scheduled_start_time": "2025-06-07T02:00:00+00:00"
            })))
            .with_body(r#"{"id":"555"}"#)
            .create_async()
            .await;

        let event = ScheduledEventSpec {
            name: "Worship night (moved)".into(),
            description: "Worship night".into(),
            location: "TBA".into(),
            start: Utc.with_ymd_and_hms(2025, 6, 7, 2, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 6, 7, 4, 0, 0).unwrap(),
        };
        client(&server).update_scheduled_event("555", &event).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn scheduled_event_delete() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/guilds/42/scheduled-events/555")
            .match_header("authorization", "Bot tok")
            .with_status(204)
            .create_async()
            .await;

        client(&server).delete_scheduled_event("555").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn scheduled_event_delete_missing_is_api_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/guilds/42/scheduled-events/404")
            .with_status(404)
            .with_body(r#"{"message":"Unknown Guild Scheduled Event","code":10070}"#)
            .create_async()
            .await;

        let err = client(&server).delete_scheduled_event("404").await.unwrap_err();
        assert!(matches!(err, PlatformError::Api { status: 404, .. }));
    }

    #[test]
    fn event_body_uses_rfc3339_times() {
        let event = ScheduledEventSpec {
            name: "n".into(),
            description: "d".into(),
            location: "Room 1".into(),
            start: Utc.with_ymd_and_hms(2025, 6, 6, 2, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 6, 6, 4, 0, 0).unwrap(),
        };
        let body = scheduled_event_body(&event);
        assert_eq!(body["scheduled_start_time"], "2025-06-06T02:00:00+00:00");
        assert_eq!(body["privacy_level"], 2);
    }

    #[test]
    fn bad_snowflake_is_invalid_payload() {
        assert!(matches!(snowflake("abc"), Err(PlatformError::InvalidPayload(_))));
        assert_eq!(snowflake("1234").unwrap(), 1234);
    }

    #[test]
    fn split_message_short() {
        assert_eq!(split_message("Hello", 2000), vec!["Hello"]);
    }

    #[test]
    fn split_message_prefers_newline() {
        let msg = format!("{}\n{}", "a".repeat(1500), "b".repeat(1000));
        let chunks = split_message(&msg, 2000);
        assert_eq!(chunks, vec!["a".repeat(1500), "b".repeat(1000)]);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        let msg = "é".repeat(1500);
        let chunks = split_message(&msg, 2000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 2000);
        assert_eq!(chunks.concat(), msg);
    }
}
