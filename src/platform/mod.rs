//! Chat platform abstraction.
//!
//! Core components:
//! - `ChatPlatform`: the REST surface the bot needs from a single guild
//! - `discord`: Discord REST v10 implementation over reqwest
//! - `gateway`: Discord gateway listener feeding `GatewayEvent`s

pub mod discord;
pub mod gateway;
#[cfg(test)]
pub(crate) mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::PlatformError;

pub use discord::DiscordClient;
pub use gateway::{GatewayConfig, GatewayEvent, IncomingMessage, spawn_gateway};

pub type UserId = u64;
pub type RoleId = u64;
pub type ChannelId = u64;

/// Discord's ADMINISTRATOR permission bit.
pub const ADMINISTRATOR: u64 = 1 << 3;

/// A role defined on the guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildRole {
    pub id: RoleId,
    pub name: String,
    pub permissions: u64,
}

/// A guild member and the role IDs they hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub user_id: UserId,
    pub display_name: String,
    pub role_ids: Vec<RoleId>,
}

impl Member {
    pub fn holds(&self, role: RoleId) -> bool {
        self.role_ids.contains(&role)
    }

    /// Role IDs in a stable order, for comparing two snapshots.
    pub fn sorted_role_ids(&self) -> Vec<RoleId> {
        let mut ids = self.role_ids.clone();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Snapshot of the guild's roles, fetched once per evaluation pass.
#[derive(Debug, Clone, Default)]
pub struct RoleDirectory {
    roles: Vec<GuildRole>,
}

impl RoleDirectory {
    pub fn new(roles: Vec<GuildRole>) -> Self {
        Self { roles }
    }

    /// Exact, case-sensitive lookup by name.
    pub fn by_name(&self, name: &str) -> Option<&GuildRole> {
        self.roles.iter().find(|r| r.name == name)
    }

    pub fn name_of(&self, id: RoleId) -> Option<&str> {
        self.roles
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.name.as_str())
    }

    /// Names of the roles the member holds. Unknown IDs are skipped.
    pub fn names_for<'a>(&'a self, member: &Member) -> Vec<&'a str> {
        member
            .role_ids
            .iter()
            .filter_map(|id| self.name_of(*id))
            .collect()
    }

    pub fn is_administrator(&self, member: &Member) -> bool {
        self.roles
            .iter()
            .any(|r| member.holds(r.id) && r.permissions & ADMINISTRATOR != 0)
    }
}

/// An external guild scheduled event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledEventSpec {
    pub name: String,
    pub description: String,
    pub location: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// REST operations against the single configured guild.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn guild_roles(&self) -> Result<Vec<GuildRole>, PlatformError>;

    async fn guild_owner(&self) -> Result<UserId, PlatformError>;

    async fn member(&self, user_id: UserId) -> Result<Member, PlatformError>;

    /// Every member of the guild.
    async fn members(&self) -> Result<Vec<Member>, PlatformError>;

    async fn add_role(&self, user_id: UserId, role_id: RoleId) -> Result<(), PlatformError>;

    async fn remove_role(&self, user_id: UserId, role_id: RoleId) -> Result<(), PlatformError>;

    async fn send_message(&self, channel_id: ChannelId, content: &str)
    -> Result<(), PlatformError>;

    /// Create a scheduled event, returning its ID.
    async fn create_scheduled_event(
        &self,
        event: &ScheduledEventSpec,
    ) -> Result<String, PlatformError>;

    async fn update_scheduled_event(
        &self,
        event_id: &str,
        event: &ScheduledEventSpec,
    ) -> Result<(), PlatformError>;

    async fn delete_scheduled_event(&self, event_id: &str) -> Result<(), PlatformError>;

    /// Convenience: the role directory for one evaluation pass.
    async fn role_directory(&self) -> Result<RoleDirectory, PlatformError> {
        Ok(RoleDirectory::new(self.guild_roles().await?))
    }
}
