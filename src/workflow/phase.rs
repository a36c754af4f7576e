use crate::state::{SectionStatus, SourceStatus, WorkflowPhase};
use crate::storage::{SectionRecord, SourceRecord};

/// Derives the current workflow phase from persisted entities
///
/// The phase is never stored, so a resumed run always starts from the first
/// phase whose work is not finished.
pub fn derive_phase(
    sources: &[SourceRecord],
    sections: &[SectionRecord],
    has_export: bool,
) -> WorkflowPhase {
    if sources.is_empty() || sources.iter().any(|s| s.status != SourceStatus::Complete) {
        WorkflowPhase::SourceProcessing
    } else if sections.is_empty() {
        WorkflowPhase::OutlineGeneration
    } else if sections.iter().any(|s| s.status != SectionStatus::Complete) {
        WorkflowPhase::SectionBuilding
    } else if !has_export {
        WorkflowPhase::Export
    } else {
        WorkflowPhase::Done
    }
}
