//! Document sections and exports
//!
//! Sections form a tree per research record. `SectionService` queries and
//! restructures it; `ExportService` renders the finished sections.

mod export;
mod sections;
mod tree;

pub use export::{ExportFormat, ExportService};
pub use sections::SectionService;
pub use tree::SectionTree;
