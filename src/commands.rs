//! Prefix command parsing (`!check_roles`, `!sweep_roles`, `!migrate_roles`).

use regex::Regex;

use crate::error::ConfigError;
use crate::platform::UserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Evaluate one member: the mentioned one, else the author.
    CheckRoles { target: Option<UserId> },
    SweepRoles,
    MigrateRoles,
}

impl Command {
    pub fn requires_admin(&self) -> bool {
        matches!(self, Self::SweepRoles | Self::MigrateRoles)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CheckRoles { .. } => "check_roles",
            Self::SweepRoles => "sweep_roles",
            Self::MigrateRoles => "migrate_roles",
        }
    }
}

/// Recognizes commands written with a fixed prefix.
pub struct CommandParser {
    command: Regex,
    mention: Regex,
}

impl CommandParser {
    pub fn new(prefix: &str) -> Result<Self, ConfigError> {
        if prefix.trim().is_empty() {
            return Err(ConfigError::invalid("command_prefix", "must not be empty"));
        }
        let pattern = format!(r"(?s)^{}(\w+)(?:\s+(.*))?$", regex::escape(prefix.trim()));
        let compile = |p: &str| Regex::new(p).map_err(|e| ConfigError::ParseError(e.to_string()));
        Ok(Self {
            command: compile(&pattern)?,
            mention: compile(r"^<@!?(\d+)>$")?,
        })
    }

    /// Parse a message body. Unknown command names yield `None`.
    pub fn parse(&self, content: &str) -> Option<Command> {
        let caps = self.command.captures(content.trim())?;
        let name = caps.get(1)?.as_str();
        let args = caps.get(2).map(|m| m.as_str()).unwrap_or("");

        match name {
            "check_roles" => Some(Command::CheckRoles {
                target: args
                    .split_whitespace()
                    .next()
                    .and_then(|arg| self.mentioned_user(arg)),
            }),
            "sweep_roles" => Some(Command::SweepRoles),
            "migrate_roles" => Some(Command::MigrateRoles),
            _ => None,
        }
    }

    /// `<@123>` or `<@!123>` → 123.
    fn mentioned_user(&self, token: &str) -> Option<UserId> {
        self.mention
            .captures(token)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}
