//! Context preservation across interruptions.
//!
//! The current working context (epic, ticket, notes, git placeholders) can be
//! snapshotted, pushed onto a LIFO stack when an interruption arrives, and
//! restored later. The stack persists as one JSON document through the atomic
//! store; history is capped and evicts oldest-first.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use waypoint_model::now_unix_ms;
use waypoint_store::{AtomicStore, StoreError, WriteOptions};

use crate::error::{Result, WorkflowError};
use crate::external::{EpicSelector, TicketSelector};

pub const STACK_SCHEMA_VERSION: &str = "1.0";
const HISTORY_CAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    #[default]
    Normal,
    Interruption,
    Emergency,
    Hotfix,
    Experiment,
}

impl ContextType {
    /// Types that push the previous context onto the stack.
    pub fn is_interrupting(self) -> bool {
        matches!(
            self,
            ContextType::Interruption | ContextType::Emergency | ContextType::Hotfix
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkflowContext {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub context_type: ContextType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modified_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created_at_unix_ms: u64,
    #[serde(default)]
    pub saved_at_unix_ms: u64,
    #[serde(default)]
    pub last_accessed_unix_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_context_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StackMetadata {
    #[serde(default)]
    pub total_interruptions: u64,
    #[serde(default)]
    pub current_depth: u32,
    #[serde(default)]
    pub max_depth_seen: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InterruptionStackData {
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_context: Option<WorkflowContext>,
    /// LIFO: last element is the most recently interrupted context.
    #[serde(default)]
    pub context_stack: Vec<WorkflowContext>,
    #[serde(default)]
    pub active_contexts: HashMap<String, WorkflowContext>,
    #[serde(default)]
    pub context_history: Vec<WorkflowContext>,
    #[serde(default)]
    pub metadata: StackMetadata,
}

impl InterruptionStackData {
    /// Bring a loaded document up to the current shape.
    fn normalize(mut self) -> Self {
        if self.version.is_empty() {
            self.version = STACK_SCHEMA_VERSION.to_string();
        }
        if self.context_history.len() > HISTORY_CAP {
            let excess = self.context_history.len() - HISTORY_CAP;
            self.context_history.drain(..excess);
        }
        self.metadata.current_depth = self.context_stack.len() as u32;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    pub name: String,
    pub description: Option<String>,
    pub context_type: ContextType,
    pub notes: Vec<String>,
    pub tags: Vec<String>,
    pub working_directory: Option<String>,
    pub git_branch: Option<String>,
    pub git_commit: Option<String>,
    pub modified_files: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    /// Keep the replaced current context reachable in `active_contexts`.
    pub backup_current: bool,
    /// Proceed even when epic/ticket re-selection fails.
    pub force: bool,
}

/// Persistent interruption stack bound to one stack file.
pub struct InterruptionStack {
    store: Arc<AtomicStore>,
    path: PathBuf,
    epics: Arc<dyn EpicSelector>,
    tickets: Arc<dyn TicketSelector>,
}

impl InterruptionStack {
    pub fn new(
        store: Arc<AtomicStore>,
        path: impl Into<PathBuf>,
        epics: Arc<dyn EpicSelector>,
        tickets: Arc<dyn TicketSelector>,
    ) -> Self {
        Self {
            store,
            path: path.into(),
            epics,
            tickets,
        }
    }

    /// Snapshot the current working state as a context. Interrupting types
    /// push the previous current context onto the stack.
    pub async fn save_current_context(&self, opts: SaveOptions) -> Result<WorkflowContext> {
        let mut data = self.load().await?;
        let now = now_unix_ms();

        let epic_id = self
            .epics
            .current()
            .await
            .map_err(|e| selector_failed("epic", "<current>", e))?;
        let ticket_id = self
            .tickets
            .current()
            .await
            .map_err(|e| selector_failed("ticket", "<current>", e))?;

        let mut context = WorkflowContext {
            id: format!("ctx-{}", context_nanos()),
            name: opts.name,
            description: opts.description,
            context_type: opts.context_type,
            epic_id,
            ticket_id,
            working_directory: opts.working_directory,
            git_branch: opts.git_branch,
            git_commit: opts.git_commit,
            modified_files: opts.modified_files,
            notes: opts.notes,
            tags: opts.tags,
            created_at_unix_ms: now,
            saved_at_unix_ms: now,
            last_accessed_unix_ms: now,
            parent_context_id: None,
            child_context_ids: Vec::new(),
        };

        if opts.context_type.is_interrupting() {
            if let Some(mut previous) = data.current_context.take() {
                previous.child_context_ids.push(context.id.clone());
                context.parent_context_id = Some(previous.id.clone());
                data.context_stack.push(previous);
            }
            data.metadata.total_interruptions += 1;
            data.metadata.current_depth = data.context_stack.len() as u32;
            data.metadata.max_depth_seen =
                data.metadata.max_depth_seen.max(data.metadata.current_depth);
        }

        data.active_contexts
            .insert(context.id.clone(), context.clone());
        push_history(&mut data.context_history, context.clone());
        data.current_context = Some(context.clone());
        self.persist(&data).await?;

        log::info!(
            "saved context '{}' ({}), stack depth {}",
            context.name,
            context.id,
            data.metadata.current_depth
        );
        Ok(context)
    }

    /// Restore a context by ID, searching the stack, then active contexts,
    /// then history.
    pub async fn restore_context(&self, id: &str, opts: RestoreOptions) -> Result<WorkflowContext> {
        let mut data = self.load().await?;

        let mut context = if let Some(pos) = data.context_stack.iter().position(|c| c.id == id) {
            let ctx = data.context_stack.remove(pos);
            data.metadata.current_depth = data.context_stack.len() as u32;
            ctx
        } else if let Some(ctx) = data.active_contexts.get(id) {
            ctx.clone()
        } else if let Some(ctx) = data.context_history.iter().rev().find(|c| c.id == id) {
            ctx.clone()
        } else {
            return Err(WorkflowError::ContextNotFound { id: id.to_string() });
        };

        // Re-select before committing anything; a failed selection leaves
        // the persisted stack untouched unless forced.
        if let Some(epic_id) = &context.epic_id {
            if let Err(e) = self.epics.select(epic_id).await {
                if !opts.force {
                    return Err(selector_failed("epic", epic_id, e));
                }
                log::warn!("forced restore: epic selection failed for '{epic_id}': {e}");
            }
        }
        if let Some(ticket_id) = &context.ticket_id {
            if let Err(e) = self.tickets.select(ticket_id).await {
                if !opts.force {
                    return Err(selector_failed("ticket", ticket_id, e));
                }
                log::warn!("forced restore: ticket selection failed for '{ticket_id}': {e}");
            }
        }

        if opts.backup_current {
            if let Some(replaced) = data.current_context.take() {
                data.active_contexts.insert(replaced.id.clone(), replaced);
            }
        }

        context.last_accessed_unix_ms = now_unix_ms();
        data.active_contexts
            .insert(context.id.clone(), context.clone());
        data.current_context = Some(context.clone());
        self.persist(&data).await?;

        log::info!("restored context '{}' ({})", context.name, context.id);
        Ok(context)
    }

    /// Restore the most recently interrupted context.
    pub async fn pop_context(&self, opts: RestoreOptions) -> Result<WorkflowContext> {
        let data = self.load().await?;
        let top = data
            .context_stack
            .last()
            .ok_or(WorkflowError::EmptyInterruptionStack)?;
        let id = top.id.clone();
        self.restore_context(&id, opts).await
    }

    pub async fn current(&self) -> Result<Option<WorkflowContext>> {
        Ok(self.load().await?.current_context)
    }

    pub async fn depth(&self) -> Result<u32> {
        Ok(self.load().await?.metadata.current_depth)
    }

    /// Stack contents, most recently interrupted first.
    pub async fn list(&self) -> Result<Vec<WorkflowContext>> {
        let mut stack = self.load().await?.context_stack;
        stack.reverse();
        Ok(stack)
    }

    /// Reset the stack to an empty document.
    pub async fn clear(&self) -> Result<()> {
        let data = InterruptionStackData {
            version: STACK_SCHEMA_VERSION.to_string(),
            ..Default::default()
        };
        self.persist(&data).await
    }

    async fn load(&self) -> Result<InterruptionStackData> {
        match self.store.read_json::<InterruptionStackData>(&self.path).await {
            Ok(data) => Ok(data.normalize()),
            Err(StoreError::NotFound { .. }) => Ok(InterruptionStackData {
                version: STACK_SCHEMA_VERSION.to_string(),
                ..Default::default()
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist(&self, data: &InterruptionStackData) -> Result<()> {
        let opts = WriteOptions {
            backup: false,
            ..Default::default()
        };
        self.store.write_json(&self.path, data, &opts).await?;
        Ok(())
    }
}

fn push_history(history: &mut Vec<WorkflowContext>, context: WorkflowContext) {
    history.push(context);
    if history.len() > HISTORY_CAP {
        let excess = history.len() - HISTORY_CAP;
        history.drain(..excess);
    }
}

fn context_nanos() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

fn selector_failed(selector: &'static str, id: &str, e: anyhow::Error) -> WorkflowError {
    WorkflowError::SelectorFailed {
        selector,
        id: id.to_string(),
        detail: e.to_string(),
    }
}
