/// Research record state machine and workflow phases
use std::fmt;

/// Status of a research record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResearchStatus {
    Initializing,
    Running,
    Paused,
    Failed,
    Complete,
}

/// Operations the workflow currently allows, derived from the status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowCapabilities {
    pub can_execute: bool,
    pub can_resume: bool,
    pub can_stop: bool,
}

impl ResearchStatus {
    /// Legal status transitions
    const TRANSITIONS: &'static [(ResearchStatus, ResearchStatus)] = &[
        (Self::Initializing, Self::Running),
        (Self::Running, Self::Paused),
        (Self::Running, Self::Failed),
        (Self::Running, Self::Complete),
        (Self::Paused, Self::Running),
        (Self::Failed, Self::Running),
    ];

    pub fn can_transition_to(&self, next: ResearchStatus) -> bool {
        Self::TRANSITIONS.contains(&(*self, next))
    }

    /// Computes the capability flags for this status
    ///
    /// Execute is only offered on a fresh record; resume is offered by any status
    /// with a transition back to running other than `Initializing`.
    pub fn capabilities(&self) -> WorkflowCapabilities {
        WorkflowCapabilities {
            can_execute: *self == Self::Initializing,
            can_resume: *self != Self::Initializing && self.can_transition_to(Self::Running),
            can_stop: self.can_transition_to(Self::Paused),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Complete => "complete",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "initializing" => Some(Self::Initializing),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "failed" => Some(Self::Failed),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }

    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Initializing,
            Self::Running,
            Self::Paused,
            Self::Failed,
            Self::Complete,
        ]
    }
}

impl fmt::Display for ResearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Position of a research record in the pipeline
///
/// Never stored; always derived from the persisted sources, sections, and exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkflowPhase {
    SourceProcessing,
    OutlineGeneration,
    SectionBuilding,
    Export,
    Done,
}

impl WorkflowPhase {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::SourceProcessing => "source_processing",
            Self::OutlineGeneration => "outline_generation",
            Self::SectionBuilding => "section_building",
            Self::Export => "export",
            Self::Done => "done",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "source_processing" => Some(Self::SourceProcessing),
            "outline_generation" => Some(Self::OutlineGeneration),
            "section_building" => Some(Self::SectionBuilding),
            "export" => Some(Self::Export),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
