//! Source lifecycle module
//!
//! Sources move `pending -> processing -> {complete, failed}`; a failed source
//! only returns to `pending` through an explicit retry. Completed sources
//! carry extracted text, discovered links, and derived keywords and facts.

pub mod extract;
mod lifecycle;

pub use lifecycle::{ProcessOutcome, SourceManager};
