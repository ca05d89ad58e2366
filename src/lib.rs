//! Rolekeeper: rule-driven Discord role sync plus spreadsheet notifications.

pub mod bot;
pub mod commands;
pub mod config;
pub mod error;
pub mod google;
pub mod http;
pub mod notifier;
pub mod platform;
pub mod roles;
pub mod schedule;
