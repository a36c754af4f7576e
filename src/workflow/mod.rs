//! Workflow module
//!
//! A research record moves through source processing, outline generation,
//! section building, and export. The current phase is derived from persisted
//! entities, so a paused or failed run resumes where it left off.

mod drafter;
mod orchestrator;
mod phase;

pub use drafter::{
    DraftError, DraftedSection, Drafter, ExtractiveDrafter, OutlineNode, SectionBrief,
    SourceDigest,
};
pub use orchestrator::{
    OutlineOptions, RunOutcome, StopOutcome, WorkflowFailure, WorkflowOrchestrator,
    WorkflowStatus,
};
pub use phase::derive_phase;
