#![forbid(unsafe_code)]

//! Backend of the ClickUp agent orchestrator: pulls ready tasks from ClickUp,
//! runs a coding agent per task in its own git worktree and streams the
//! agents' terminals to the dashboard.

pub mod agents;
pub mod api;
pub mod clickup;
pub mod config;
pub mod db;
pub mod error;
pub mod files;
pub mod gateway;
pub mod logs;
pub mod scheduler;
pub mod sessions;
pub mod state;
pub mod supervisor;
pub mod worktree;
