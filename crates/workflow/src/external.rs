//! Seams to the surrounding tool.
//!
//! The engine never reaches for globals; whoever embeds it constructs these
//! collaborators and injects them. Tests substitute in-memory fakes.

use std::path::Path;

use async_trait::async_trait;

/// Outcome of the project-initialization check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProbeReport {
    pub complete: bool,
    pub issues: Vec<String>,
}

/// Detects whether a workspace has been initialized as a project.
#[async_trait]
pub trait ProjectProbe: Send + Sync {
    async fn check(&self, root: &Path) -> anyhow::Result<ProbeReport>;
}

/// Tracks and switches the active epic in the surrounding tool.
#[async_trait]
pub trait EpicSelector: Send + Sync {
    async fn current(&self) -> anyhow::Result<Option<String>>;
    async fn select(&self, id: &str) -> anyhow::Result<()>;
}

/// Tracks and switches the active ticket in the surrounding tool.
#[async_trait]
pub trait TicketSelector: Send + Sync {
    async fn current(&self) -> anyhow::Result<Option<String>>;
    async fn select(&self, id: &str) -> anyhow::Result<()>;
}
