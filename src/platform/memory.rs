//! In-memory `ChatPlatform` used by unit tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ChannelId, ChatPlatform, GuildRole, Member, RoleId, ScheduledEventSpec, UserId};
use crate::error::PlatformError;

#[derive(Default)]
pub(crate) struct MemoryPlatform {
    pub roles: Mutex<Vec<GuildRole>>,
    pub members: Mutex<BTreeMap<UserId, Member>>,
    pub owner: UserId,
    pub messages: Mutex<Vec<(ChannelId, String)>>,
    pub events: Mutex<BTreeMap<String, ScheduledEventSpec>>,
    pub deleted_events: Mutex<Vec<String>>,
    pub role_ops: Mutex<Vec<(UserId, String)>>,
    pub failing_roles: Mutex<HashSet<RoleId>>,
    pub failing_channels: Mutex<HashSet<ChannelId>>,
}

impl MemoryPlatform {
    pub fn with_roles(names: &[&str]) -> Self {
        let roles = names
            .iter()
            .enumerate()
            .map(|(i, name)| GuildRole {
                id: 100 + i as RoleId,
                name: (*name).to_string(),
                permissions: 0,
            })
            .collect();
        Self {
            roles: Mutex::new(roles),
            ..Default::default()
        }
    }

    pub fn role_id(&self, name: &str) -> RoleId {
        self.roles
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.id)
            .unwrap_or_else(|| panic!("no role named {name}"))
    }

    pub fn add_member(&self, user_id: UserId, role_names: &[&str]) -> Member {
        let member = Member {
            user_id,
            display_name: format!("User {user_id}"),
            role_ids: role_names.iter().map(|n| self.role_id(n)).collect(),
        };
        self.members.lock().unwrap().insert(user_id, member.clone());
        member
    }

    pub fn set_roles(&self, user_id: UserId, role_names: &[&str]) {
        let ids: Vec<RoleId> = role_names.iter().map(|n| self.role_id(n)).collect();
        if let Some(m) = self.members.lock().unwrap().get_mut(&user_id) {
            m.role_ids = ids;
        }
    }

    pub fn role_names_of(&self, user_id: UserId) -> HashSet<String> {
        let roles = self.roles.lock().unwrap().clone();
        let members = self.members.lock().unwrap();
        members[&user_id]
            .role_ids
            .iter()
            .filter_map(|id| roles.iter().find(|r| r.id == *id).map(|r| r.name.clone()))
            .collect()
    }

    pub fn fail_role(&self, name: &str) {
        let id = self.role_id(name);
        self.failing_roles.lock().unwrap().insert(id);
    }

    pub fn op_count(&self) -> usize {
        self.role_ops.lock().unwrap().len()
    }

    fn check_role(&self, role_id: RoleId) -> Result<(), PlatformError> {
        if self.failing_roles.lock().unwrap().contains(&role_id) {
            return Err(PlatformError::Api {
                method: "PUT".into(),
                path: format!("/roles/{role_id}"),
                status: 403,
                body: "Missing Permissions".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChatPlatform for MemoryPlatform {
    async fn guild_roles(&self) -> Result<Vec<GuildRole>, PlatformError> {
        Ok(self.roles.lock().unwrap().clone())
    }

    async fn guild_owner(&self) -> Result<UserId, PlatformError> {
        Ok(self.owner)
    }

    async fn member(&self, user_id: UserId) -> Result<Member, PlatformError> {
        self.members
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .ok_or_else(|| PlatformError::Api {
                method: "GET".into(),
                path: format!("/members/{user_id}"),
                status: 404,
                body: "Unknown Member".into(),
            })
    }

    async fn members(&self) -> Result<Vec<Member>, PlatformError> {
        Ok(self.members.lock().unwrap().values().cloned().collect())
    }

    async fn add_role(&self, user_id: UserId, role_id: RoleId) -> Result<(), PlatformError> {
        self.check_role(role_id)?;
        let mut members = self.members.lock().unwrap();
        if let Some(m) = members.get_mut(&user_id) {
            if !m.role_ids.contains(&role_id) {
                m.role_ids.push(role_id);
            }
        }
        self.role_ops
            .lock()
            .unwrap()
            .push((user_id, format!("+{role_id}")));
        Ok(())
    }

    async fn remove_role(&self, user_id: UserId, role_id: RoleId) -> Result<(), PlatformError> {
        self.check_role(role_id)?;
        let mut members = self.members.lock().unwrap();
        if let Some(m) = members.get_mut(&user_id) {
            m.role_ids.retain(|r| *r != role_id);
        }
        self.role_ops
            .lock()
            .unwrap()
            .push((user_id, format!("-{role_id}")));
        Ok(())
    }

    async fn send_message(
        &self,
        channel_id: ChannelId,
        content: &str,
    ) -> Result<(), PlatformError> {
        if self.failing_channels.lock().unwrap().contains(&channel_id) {
            return Err(PlatformError::Http("connection reset".into()));
        }
        self.messages
            .lock()
            .unwrap()
            .push((channel_id, content.to_string()));
        Ok(())
    }

    async fn create_scheduled_event(
        &self,
        event: &ScheduledEventSpec,
    ) -> Result<String, PlatformError> {
        let mut events = self.events.lock().unwrap();
        let id = format!("evt-{}", events.len() + 1);
        events.insert(id.clone(), event.clone());
        Ok(id)
    }

    async fn update_scheduled_event(
        &self,
        event_id: &str,
        event: &ScheduledEventSpec,
    ) -> Result<(), PlatformError> {
        self.events
            .lock()
            .unwrap()
            .insert(event_id.to_string(), event.clone());
        Ok(())
    }

    async fn delete_scheduled_event(&self, event_id: &str) -> Result<(), PlatformError> {
        self.events.lock().unwrap().remove(event_id);
        self.deleted_events
            .lock()
            .unwrap()
            .push(event_id.to_string());
        Ok(())
    }
}
