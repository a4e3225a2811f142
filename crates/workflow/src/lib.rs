//! # Waypoint Workflow
//!
//! Position derivation, action gating, and context preservation over the
//! Project → Epic → Story → Task hierarchy.
//!
//! ## Flow
//!
//! ```text
//! docs/ tree
//!     │
//!     ├──> WorkflowAnalyzer
//!     │      └─> position + metrics + blockers
//!     │
//!     ├──> DependencyEnforcer
//!     │      └─> violations, overrides, transitions
//!     │
//!     ├──> CommandGenerator
//!     │      └─> ranked next commands
//!     │
//!     └──> InterruptionStack
//!            └─> save / restore / pop contexts
//! ```
//!
//! Position is derived fresh from the filesystem on every analysis; nothing
//! here caches workflow state.

mod actions;
mod analyzer;
mod commands;
mod enforcer;
mod error;
mod external;
mod interruption;

pub use actions::{ActionRegistry, Prerequisite, WorkflowAction};
pub use analyzer::{
    Blocker, BlockerKind, BlockerSeverity, CompletionMetrics, Position, WorkflowAnalysis,
    WorkflowAnalyzer,
};
pub use commands::{CommandGenerator, ContextCommand};
pub use enforcer::{
    ActionValidation, DependencyEnforcer, OverrideRisk, Violation, ViolationKind,
    ViolationSeverity,
};
pub use error::{Result, WorkflowError};
pub use external::{EpicSelector, ProbeReport, ProjectProbe, TicketSelector};
pub use interruption::{
    ContextType, InterruptionStack, InterruptionStackData, RestoreOptions, SaveOptions,
    StackMetadata, WorkflowContext, STACK_SCHEMA_VERSION,
};
