//! Gateway event dispatcher.
//!
//! Each event is handled on its own task so a settle delay or a long sweep
//! never stalls the event loop. The dispatcher keeps the last role-ID list it
//! saw per member; that snapshot exists only to spot no-op updates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::commands::{Command, CommandParser};
use crate::error::{PlatformError, SweepError};
use crate::platform::{ChatPlatform, GatewayEvent, IncomingMessage, Member, RoleId, UserId};
use crate::roles::{Evaluation, MigrationConfig, RoleSync, UpdateOutcome};

pub struct Bot {
    sync: Arc<RoleSync>,
    platform: Arc<dyn ChatPlatform>,
    parser: CommandParser,
    migration: Option<MigrationConfig>,
    snapshots: Mutex<HashMap<UserId, Vec<RoleId>>>,
    startup_swept: AtomicBool,
}

impl Bot {
    pub fn new(
        sync: Arc<RoleSync>,
        platform: Arc<dyn ChatPlatform>,
        parser: CommandParser,
        migration: Option<MigrationConfig>,
    ) -> Self {
        Self {
            sync,
            platform,
            parser,
            migration,
            snapshots: Mutex::new(HashMap::new()),
            startup_swept: AtomicBool::new(false),
        }
    }

    /// Consume gateway events until the sender side closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<GatewayEvent>) {
        while let Some(event) = events.recv().await {
            let bot = Arc::clone(&self);
            tokio::spawn(async move { bot.handle(event).await });
        }
        info!("Gateway event stream closed");
    }

    pub async fn handle(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::Ready { user_id } => self.on_ready(user_id).await,
            GatewayEvent::MemberUpdate(member) => {
                self.on_member_update(&member).await;
            }
            GatewayEvent::MessageCreate(message) => self.on_message(&message).await,
        }
    }

    async fn on_ready(&self, user_id: UserId) {
        info!(bot_user = user_id, "Bot is ready");
        // READY repeats on every reconnect; only the first one sweeps.
        if self.startup_swept.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.sync.sweep().await {
            Ok(summary) => info!(
                added = summary.added,
                removed = summary.removed,
                "Startup sweep complete"
            ),
            Err(e) => error!(error = %e, "Startup sweep failed"),
        }
    }

    /// Store the new snapshot and return the previous one.
    fn remember(&self, member: &Member) -> Option<Vec<RoleId>> {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(|p| p.into_inner());
        snapshots.insert(member.user_id, member.sorted_role_ids())
    }

    pub async fn on_member_update(&self, member: &Member) -> UpdateOutcome {
        let previous = self.remember(member);
        let outcome = self.sync.on_member_update(previous.as_deref(), member).await;
        match &outcome {
            UpdateOutcome::Evaluated(eval) if eval.changed() => {
                info!(
                    member = %member.display_name,
                    added = ?eval.added,
                    removed = ?eval.removed,
                    "Roles updated after member change"
                );
            }
            UpdateOutcome::Failed(reason) => {
                warn!(member = %member.display_name, reason = %reason, "Member update not evaluated");
            }
            other => debug!(member = %member.display_name, outcome = ?other, "Member update handled"),
        }
        outcome
    }

    async fn on_message(&self, message: &IncomingMessage) {
        if message.author_is_bot {
            return;
        }
        let Some(command) = self.parser.parse(&message.content) else {
            return;
        };
        info!(
            command = command.name(),
            author = message.author_id,
            channel = message.channel_id,
            "Command received"
        );

        if command.requires_admin() {
            match self.is_admin(message.author_id).await {
                Ok(true) => {}
                Ok(false) => {
                    self.reply(message, "⛔ You need administrator permission to run this command.")
                        .await;
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Admin check failed");
                    self.reply(message, "❌ Could not verify your permissions.").await;
                    return;
                }
            }
        }

        let reply = match command {
            Command::CheckRoles { target } => {
                let user_id = target.unwrap_or(message.author_id);
                match self.sync.check_member(user_id).await {
                    Ok(eval) => check_reply(user_id, &eval),
                    Err(e) => {
                        warn!(member = user_id, error = %e, "check_roles failed");
                        format!("❌ Could not check roles for <@{user_id}>.")
                    }
                }
            }
            Command::SweepRoles => match self.sync.sweep().await {
                Ok(summary) => format!(
                    "✅ Sweep done. Added: {}, Removed: {}",
                    summary.added, summary.removed
                ),
                Err(e) => sweep_error_reply(&e),
            },
            Command::MigrateRoles => match &self.migration {
                None => "❌ No role migration is configured.".to_string(),
                Some(migration) => match self.sync.migrate(migration).await {
                    Ok(summary) => format!(
                        "✅ Migration done. Moved: {}, Failed: {}",
                        summary.moved, summary.failed
                    ),
                    Err(e) => sweep_error_reply(&e),
                },
            },
        };

        self.reply(message, &reply).await;
    }

    /// Guild owner, or holder of a role with the ADMINISTRATOR bit.
    async fn is_admin(&self, user_id: UserId) -> Result<bool, PlatformError> {
        if self.platform.guild_owner().await? == user_id {
            return Ok(true);
        }
        let directory = self.platform.role_directory().await?;
        let member = self.platform.member(user_id).await?;
        Ok(directory.is_administrator(&member))
    }

    async fn reply(&self, message: &IncomingMessage, content: &str) {
        if let Err(e) = self.platform.send_message(message.channel_id, content).await {
            error!(channel = message.channel_id, error = %e, "Failed to send command reply");
        }
    }
}

/// Reply text for `check_roles`.
pub fn check_reply(user_id: UserId, eval: &Evaluation) -> String {
    let mention = format!("<@{user_id}>");
    let mut lines = Vec::new();
    for role in &eval.added {
        lines.push(format!("✅ {mention} has been given **{role}**."));
    }
    for role in &eval.removed {
        lines.push(format!("🗑️ {mention} lost **{role}**."));
    }
    for role in &eval.failed {
        lines.push(format!("⚠️ Could not update **{role}** for {mention}."));
    }
    for role in &eval.missing {
        lines.push(format!("❌ Role **{role}** is missing on the server."));
    }
    if lines.is_empty() {
        lines.push(format!("ℹ️ No role changes for {mention}."));
    }
    lines.join("\n")
}

fn sweep_error_reply(e: &SweepError) -> String {
    match e {
        SweepError::AlreadyRunning => "⏳ A sweep is already running.".to_string(),
        SweepError::MissingRole(role) => format!("❌ Role **{role}** does not exist on the server."),
        SweepError::Platform(e) => {
            error!(error = %e, "Sweep failed");
            "❌ The sweep failed; check the logs.".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timing;
    use crate::platform::GuildRole;
    use crate::platform::memory::MemoryPlatform;
    use crate::roles::RoleRule;

    const CHANNEL: u64 = 900;
    const OWNER: u64 = 1;

    fn platform() -> Arc<MemoryPlatform> {
        let platform = MemoryPlatform {
            owner: OWNER,
            ..MemoryPlatform::with_roles(&["Role A", "Role B", "Role C", "Old", "New"])
        };
        platform.roles.lock().unwrap().push(GuildRole {
            id: 500,
            name: "Admins".into(),
            permissions: crate::platform::ADMINISTRATOR,
        });
        Arc::new(platform)
    }

    fn bot(platform: &Arc<MemoryPlatform>, migration: Option<MigrationConfig>) -> Bot {
        let timing = Timing {
            cooldown_secs: 0,
            settle_delay_ms: 0,
            sweep_delay_ms: 0,
        };
        let rules = vec![RoleRule::new("Role C", vec![vec!["Role A", "Role B"]])];
        let sync = Arc::new(RoleSync::new(platform.clone(), rules, &timing));
        Bot::new(sync, platform.clone(), CommandParser::new("!").unwrap(), migration)
    }

    fn message(author_id: UserId, content: &str) -> GatewayEvent {
        GatewayEvent::MessageCreate(IncomingMessage {
            channel_id: CHANNEL,
            author_id,
            author_is_bot: false,
            content: content.to_string(),
        })
    }

    fn replies(platform: &MemoryPlatform) -> Vec<String> {
        platform
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == CHANNEL)
            .map(|(_, m)| m.clone())
            .collect()
    }

    #[tokio::test]
    async fn check_roles_reports_added_role() {
        let platform = platform();
        platform.add_member(5, &["Role A", "Role B"]);
        let bot = bot(&platform, None);

        bot.handle(message(5, "!check_roles")).await;
        assert_eq!(replies(&platform), vec!["✅ <@5> has been given **Role C**.".to_string()]);

        bot.handle(message(5, "!check_roles")).await;
        assert_eq!(replies(&platform)[1], "ℹ️ No role changes for <@5>.");
    }

    #[tokio::test]
    async fn check_roles_on_mentioned_member() {
        let platform = platform();
        platform.add_member(5, &[]);
        platform.add_member(6, &["Role C"]);
        let bot = bot(&platform, None);

        bot.handle(message(5, "!check_roles <@6>")).await;
        assert_eq!(replies(&platform), vec!["🗑️ <@6> lost **Role C**.".to_string()]);
        assert!(platform.role_names_of(6).is_empty());
    }

    #[tokio::test]
    async fn sweep_requires_admin() {
        let platform = platform();
        platform.add_member(5, &["Role A", "Role B"]);
        let bot = bot(&platform, None);

        bot.handle(message(5, "!sweep_roles")).await;
        assert!(replies(&platform)[0].starts_with("⛔"));
        assert_eq!(platform.op_count(), 0);
    }

    #[tokio::test]
    async fn owner_can_sweep() {
        let platform = platform();
        platform.add_member(OWNER, &[]);
        platform.add_member(5, &["Role A", "Role B"]);
        platform.add_member(6, &["Role C"]);
        let bot = bot(&platform, None);

        bot.handle(message(OWNER, "!sweep_roles")).await;
        assert_eq!(replies(&platform), vec!["✅ Sweep done. Added: 1, Removed: 1".to_string()]);
    }

    #[tokio::test]
    async fn administrator_role_can_migrate() {
        let platform = platform();
        platform.add_member(7, &[]);
        platform.members.lock().unwrap().get_mut(&7).unwrap().role_ids.push(500);
        platform.add_member(8, &["Old"]);
        let migration = MigrationConfig {
            sources: vec!["Old".into()],
            target: "New".into(),
        };
        let bot = bot(&platform, Some(migration));

        bot.handle(message(7, "!migrate_roles")).await;
        assert_eq!(replies(&platform), vec!["✅ Migration done. Moved: 1, Failed: 0".to_string()]);
        assert_eq!(platform.role_names_of(8), ["New".to_string()].into());
    }

    #[tokio::test]
    async fn migrate_without_config() {
        let platform = platform();
        platform.add_member(OWNER, &[]);
        let bot = bot(&platform, None);

        bot.handle(message(OWNER, "!migrate_roles")).await;
        assert_eq!(replies(&platform), vec!["❌ No role migration is configured.".to_string()]);
    }

    #[tokio::test]
    async fn bot_authors_and_plain_text_are_ignored() {
        let platform = platform();
        platform.add_member(5, &["Role A", "Role B"]);
        let bot = bot(&platform, None);

        bot.handle(message(5, "hello")).await;
        bot.handle(GatewayEvent::MessageCreate(IncomingMessage {
            channel_id: CHANNEL,
            author_id: 5,
            author_is_bot: true,
            content: "!check_roles".into(),
        }))
        .await;
        assert!(replies(&platform).is_empty());
    }

    #[tokio::test]
    async fn repeated_snapshot_is_unchanged() {
        let platform = platform();
        let member = platform.add_member(5, &["Role A"]);
        let bot = bot(&platform, None);

        assert!(matches!(bot.on_member_update(&member).await, UpdateOutcome::Evaluated(_)));
        assert_eq!(bot.on_member_update(&member).await, UpdateOutcome::Unchanged);
    }

    #[tokio::test]
    async fn ready_sweeps_only_once() {
        let platform = platform();
        platform.add_member(5, &["Role A", "Role B"]);
        let bot = bot(&platform, None);

        bot.handle(GatewayEvent::Ready { user_id: 77 }).await;
        assert!(platform.role_names_of(5).contains("Role C"));

        platform.set_roles(5, &["Role A", "Role B"]);
        bot.handle(GatewayEvent::Ready { user_id: 77 }).await;
        assert!(!platform.role_names_of(5).contains("Role C"));
    }

    #[test]
    fn check_reply_lists_every_outcome() {
        let eval = Evaluation {
            added: vec!["T1 men".into()],
            removed: vec![],
            failed: vec!["Role C".into()],
            missing: vec!["Gone".into()],
        };
        let reply = check_reply(3, &eval);
        assert_eq!(
            reply,
            "✅ <@3> has been given **T1 men**.\n\
             ⚠️ Could not update **Role C** for <@3>.\n\
             ❌ Role **Gone** is missing on the server."
        );
    }
}
