//! Role synchronization service: per-member evaluation, debounced event
//! handling, full sweeps and one-off bulk migration.
//!
//! All mutable state (sweep flag, debounce timestamps) lives on `RoleSync`,
//! which handlers share through an `Arc`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::debounce::DebounceGuard;
use super::rules::{RoleChange, RoleRule, plan_changes};
use crate::config::Timing;
use crate::error::{PlatformError, SweepError};
use crate::platform::{ChatPlatform, Member, RoleDirectory, RoleId, UserId};

/// What one evaluation of one member did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Roles whose add/remove call was rejected by the platform.
    pub failed: Vec<String>,
    /// Grant roles that do not exist on the server.
    pub missing: Vec<String>,
}

impl Evaluation {
    /// Whether any add or remove succeeded. Failed calls alone do not count.
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Why an event-driven evaluation did or did not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Evaluated(Evaluation),
    SweepInProgress,
    Unchanged,
    CoolingDown,
    Failed(String),
}

/// Counts reported at the end of a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub scanned: usize,
    pub changed: usize,
    pub added: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Source roles folded into one target role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub sources: Vec<String>,
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    pub moved: usize,
    pub failed: usize,
}

/// Clears the sweep flag however the sweep exits.
struct SweepFlag<'a>(&'a AtomicBool);

impl Drop for SweepFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct RoleSync {
    platform: Arc<dyn ChatPlatform>,
    rules: Vec<RoleRule>,
    debounce: DebounceGuard,
    sweeping: AtomicBool,
    settle_delay: Duration,
    sweep_delay: Duration,
}

impl RoleSync {
    pub fn new(platform: Arc<dyn ChatPlatform>, rules: Vec<RoleRule>, timing: &Timing) -> Self {
        Self {
            platform,
            rules,
            debounce: DebounceGuard::new(timing.cooldown()),
            sweeping: AtomicBool::new(false),
            settle_delay: timing.settle_delay(),
            sweep_delay: timing.sweep_delay(),
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::SeqCst)
    }

    /// Evaluate every rule for one member and apply the resulting changes.
    ///
    /// Eligibility is computed from the roles held before this call. A failed
    /// add/remove is logged and the remaining rules still run.
    pub async fn evaluate_member(&self, directory: &RoleDirectory, member: &Member) -> Evaluation {
        let mut outcome = Evaluation::default();

        let (known, missing): (Vec<&RoleRule>, Vec<&RoleRule>) = self
            .rules
            .iter()
            .partition(|rule| directory.by_name(&rule.grants).is_some());

        for rule in missing {
            error!(role = %rule.grants, "Grant role does not exist on the server; skipping rule");
            outcome.missing.push(rule.grants.clone());
        }

        let changes = plan_changes(known, directory.names_for(member));

        for change in changes {
            let Some(role) = directory.by_name(change.role()) else {
                continue;
            };
            let result = match &change {
                RoleChange::Add(_) => self.platform.add_role(member.user_id, role.id).await,
                RoleChange::Remove(_) => self.platform.remove_role(member.user_id, role.id).await,
            };

            match (change, result) {
                (RoleChange::Add(name), Ok(())) => {
                    info!(member = %member.display_name, role = %name, "Added role");
                    outcome.added.push(name);
                }
                (RoleChange::Remove(name), Ok(())) => {
                    info!(member = %member.display_name, role = %name, "Removed role");
                    outcome.removed.push(name);
                }
                (change, Err(e)) => {
                    error!(
                        member = %member.display_name,
                        role = %change.role(),
                        error = %e,
                        "Failed to update role"
                    );
                    outcome.failed.push(change.role().to_string());
                }
            }
        }

        outcome
    }

    /// Fetch fresh state and evaluate one member (manual check command).
    pub async fn check_member(&self, user_id: UserId) -> Result<Evaluation, PlatformError> {
        let directory = self.platform.role_directory().await?;
        let member = self.platform.member(user_id).await?;
        Ok(self.evaluate_member(&directory, &member).await)
    }

    /// Handle a membership role-change notification.
    ///
    /// `previous` is the last role-ID snapshot observed for the member, if any.
    pub async fn on_member_update(
        &self,
        previous: Option<&[RoleId]>,
        current: &Member,
    ) -> UpdateOutcome {
        if self.is_sweeping() {
            debug!(member = %current.display_name, "Sweep in progress; ignoring role update");
            return UpdateOutcome::SweepInProgress;
        }

        if previous.is_some_and(|prev| prev == current.sorted_role_ids().as_slice()) {
            return UpdateOutcome::Unchanged;
        }

        if !self.debounce.try_acquire(current.user_id) {
            debug!(member = %current.display_name, "Member in cooldown; ignoring role update");
            return UpdateOutcome::CoolingDown;
        }

        // Let near-simultaneous role mutations land before reading state.
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }

        match self.check_member(current.user_id).await {
            Ok(evaluation) => UpdateOutcome::Evaluated(evaluation),
            Err(e) => {
                warn!(member = %current.display_name, error = %e, "Role re-evaluation failed");
                UpdateOutcome::Failed(e.to_string())
            }
        }
    }

    /// Re-apply every rule to every member of the guild.
    pub async fn sweep(&self) -> Result<SweepSummary, SweepError> {
        if self.sweeping.swap(true, Ordering::SeqCst) {
            return Err(SweepError::AlreadyRunning);
        }
        let _flag = SweepFlag(&self.sweeping);

        let started = Instant::now();
        let mut summary = SweepSummary::default();
        let result = self.sweep_into(&mut summary).await;

        info!(
            scanned = summary.scanned,
            changed = summary.changed,
            added = summary.added,
            removed = summary.removed,
            failed = summary.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Role sweep finished"
        );

        result.map(|()| summary)
    }

    async fn sweep_into(&self, summary: &mut SweepSummary) -> Result<(), SweepError> {
        let directory = self.platform.role_directory().await?;
        let members = self.platform.members().await?;
        info!(members = members.len(), rules = self.rules.len(), "Role sweep started");

        for (i, member) in members.iter().enumerate() {
            if i > 0 && !self.sweep_delay.is_zero() {
                tokio::time::sleep(self.sweep_delay).await;
            }

            let evaluation = self.evaluate_member(&directory, member).await;
            summary.scanned += 1;
            summary.added += evaluation.added.len();
            summary.removed += evaluation.removed.len();
            summary.failed += evaluation.failed.len();
            if evaluation.changed() {
                summary.changed += 1;
            }
        }
        Ok(())
    }

    /// Move every holder of a source role to the target role.
    ///
    /// Runs under the sweep flag so the role churn does not trigger
    /// per-event evaluation.
    pub async fn migrate(&self, migration: &MigrationConfig) -> Result<MigrationSummary, SweepError> {
        if self.sweeping.swap(true, Ordering::SeqCst) {
            return Err(SweepError::AlreadyRunning);
        }
        let _flag = SweepFlag(&self.sweeping);

        let directory = self.platform.role_directory().await?;
        let target = directory
            .by_name(&migration.target)
            .ok_or_else(|| SweepError::MissingRole(migration.target.clone()))?
            .id;

        let sources: Vec<RoleId> = migration
            .sources
            .iter()
            .filter_map(|name| match directory.by_name(name) {
                Some(role) => Some(role.id),
                None => {
                    warn!(role = %name, "Migration source role does not exist; skipping");
                    None
                }
            })
            .collect();

        let mut summary = MigrationSummary::default();
        if sources.is_empty() {
            warn!("No migration source roles exist; nothing to do");
            return Ok(summary);
        }

        let members = self.platform.members().await?;
        let mut first = true;
        for member in members.iter().filter(|m| sources.iter().any(|s| m.holds(*s))) {
            if !first && !self.sweep_delay.is_zero() {
                tokio::time::sleep(self.sweep_delay).await;
            }
            first = false;

            match self.migrate_member(member, target, &sources).await {
                Ok(()) => {
                    info!(member = %member.display_name, target = %migration.target, "Migrated member");
                    summary.moved += 1;
                }
                Err(e) => {
                    error!(member = %member.display_name, error = %e, "Migration failed for member");
                    summary.failed += 1;
                }
            }
        }

        info!(moved = summary.moved, failed = summary.failed, "Role migration finished");
        Ok(summary)
    }

    async fn migrate_member(
        &self,
        member: &Member,
        target: RoleId,
        sources: &[RoleId],
    ) -> Result<(), PlatformError> {
        if !member.holds(target) {
            self.platform.add_role(member.user_id, target).await?;
        }
        for source in sources.iter().filter(|s| member.holds(**s) && **s != target) {
            self.platform.remove_role(member.user_id, *source).await?;
        }
        Ok(())
    }
}
