use std::fmt;

/// Drafting status of a document section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionStatus {
    Pending,
    Drafting,
    Complete,
}

impl SectionStatus {
    pub fn can_transition_to(&self, next: SectionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Drafting)
                | (Self::Drafting, Self::Complete)
                | (Self::Drafting, Self::Pending)
        )
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Drafting => "drafting",
            Self::Complete => "complete",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "drafting" => Some(Self::Drafting),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for SectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
