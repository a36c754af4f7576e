//! Outline generation and section drafting
//!
//! The workflow talks to a `Drafter` for the two content-producing steps. The
//! built-in `ExtractiveDrafter` works purely from the processed source data:
//! outline themes come from the most common keywords and section bodies are
//! the source sentences most relevant to the section title.

use crate::sources::extract::{estimate_tokens, overlap_score, split_sentences, terms, word_count};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors raised while generating outlines or drafting sections
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DraftError {
    #[error("no source material available")]
    NoMaterial,

    #[error("drafting failed: {0}")]
    Failed(String),
}

/// Condensed view of one completed source handed to the drafter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceDigest {
    pub source_id: String,
    pub url: String,
    pub title: Option<String>,
    pub keywords: Vec<String>,
    pub facts: Vec<String>,
    pub summary: String,
    pub text: String,
}

impl SourceDigest {
    fn label(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.url)
    }
}

/// A proposed section, possibly with subsections
#[derive(Debug, Clone, PartialEq)]
pub struct OutlineNode {
    pub title: String,
    pub description: Option<String>,
    pub children: Vec<OutlineNode>,
}

impl OutlineNode {
    pub fn leaf(title: impl Into<String>, description: Option<String>) -> Self {
        Self {
            title: title.into(),
            description,
            children: Vec::new(),
        }
    }
}

/// What the drafter needs to know about the section it writes
#[derive(Debug, Clone, PartialEq)]
pub struct SectionBrief {
    pub section_id: String,
    pub topic: String,
    pub title: String,
    pub description: Option<String>,
    pub parent_title: Option<String>,
}

/// A drafted section body with its size measures
#[derive(Debug, Clone, PartialEq)]
pub struct DraftedSection {
    pub content: String,
    pub word_count: u64,
    pub token_count: u64,
}

impl DraftedSection {
    pub fn from_content(content: String) -> Self {
        Self {
            word_count: word_count(&content),
            token_count: estimate_tokens(&content),
            content,
        }
    }
}

/// Produces outlines and section drafts
#[async_trait]
pub trait Drafter: Send + Sync {
    /// Proposes `sections_count` top-level sections nested `depth` levels deep
    async fn generate_outline(
        &self,
        topic: &str,
        sources: &[SourceDigest],
        sections_count: u32,
        depth: u32,
    ) -> Result<Vec<OutlineNode>, DraftError>;

    async fn draft_section(
        &self,
        section: &SectionBrief,
        sources: &[SourceDigest],
    ) -> Result<DraftedSection, DraftError>;
}

const GENERIC_SECTIONS: &[&str] = &[
    "Background",
    "Key Findings",
    "Methods and Evidence",
    "Discussion",
    "Open Questions",
    "Conclusion",
];
const SUBSECTIONS_PER_NODE: usize = 2;
const SENTENCES_PER_SECTION: usize = 6;

/// Keyword-driven outline and sentence-selection drafting
#[derive(Debug, Clone, Default)]
pub struct ExtractiveDrafter;

impl ExtractiveDrafter {
    pub fn new() -> Self {
        Self
    }

    /// Keywords ranked by how many sources carry them, then by rank within sources
    fn ranked_themes(sources: &[SourceDigest]) -> Vec<String> {
        let mut scores: HashMap<&str, (usize, usize)> = HashMap::new();
        for source in sources {
            for (rank, keyword) in source.keywords.iter().enumerate() {
                let entry = scores.entry(keyword.as_str()).or_insert((0, 0));
                entry.0 += 1;
                entry.1 += source.keywords.len() - rank;
            }
        }

        let mut ranked: Vec<(&str, (usize, usize))> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        ranked.into_iter().map(|(k, _)| k.to_string()).collect()
    }

    /// Keywords that co-occur with `theme` in the same sources
    fn related(theme: &str, sources: &[SourceDigest], used: &HashSet<String>) -> Vec<String> {
        let related: Vec<SourceDigest> = sources
            .iter()
            .filter(|s| s.keywords.iter().any(|k| k == theme))
            .cloned()
            .collect();
        Self::ranked_themes(&related)
            .into_iter()
            .filter(|k| k != theme && !used.contains(k))
            .take(SUBSECTIONS_PER_NODE)
            .collect()
    }

    fn build_children(
        theme: &str,
        sources: &[SourceDigest],
        depth: u32,
        used: &mut HashSet<String>,
    ) -> Vec<OutlineNode> {
        if depth <= 1 {
            return Vec::new();
        }

        let mut picks = Self::related(theme, sources, used);
        if picks.is_empty() {
            picks = vec![format!("{} evidence", theme), format!("{} implications", theme)];
        }

        picks
            .into_iter()
            .map(|pick| {
                used.insert(pick.clone());
                OutlineNode {
                    title: title_case(&pick),
                    description: Some(format!("How {} relates to {}", pick, theme)),
                    children: Self::build_children(&pick, sources, depth - 1, used),
                }
            })
            .collect()
    }
}

#[async_trait]
impl Drafter for ExtractiveDrafter {
    async fn generate_outline(
        &self,
        topic: &str,
        sources: &[SourceDigest],
        sections_count: u32,
        depth: u32,
    ) -> Result<Vec<OutlineNode>, DraftError> {
        let count = sections_count.max(1) as usize;
        let mut outline = vec![OutlineNode::leaf(
            "Introduction",
            Some(format!("Scope and context of {}", topic)),
        )];

        let themes = Self::ranked_themes(sources);
        let mut used: HashSet<String> = themes.iter().take(count).cloned().collect();

        for theme in themes.iter().take(count.saturating_sub(1)) {
            outline.push(OutlineNode {
                title: title_case(theme),
                description: Some(format!("What the sources report about {}", theme)),
                children: Self::build_children(theme, sources, depth, &mut used),
            });
        }

        let mut generic = GENERIC_SECTIONS.iter();
        while outline.len() < count {
            let title = match generic.next() {
                Some(title) => title.to_string(),
                None => format!("Further Notes {}", outline.len()),
            };
            outline.push(OutlineNode::leaf(title, None));
        }
        outline.truncate(count);

        Ok(outline)
    }

    async fn draft_section(
        &self,
        section: &SectionBrief,
        sources: &[SourceDigest],
    ) -> Result<DraftedSection, DraftError> {
        if sources.is_empty() {
            return Err(DraftError::NoMaterial);
        }

        let mut query: HashSet<String> = terms(&section.title).into_iter().collect();
        if let Some(description) = &section.description {
            query.extend(terms(description));
        }
        if let Some(parent) = &section.parent_title {
            query.extend(terms(parent));
        }

        // (score, source index, sentence index) keeps selection deterministic
        let mut candidates: Vec<(usize, usize, usize, String)> = Vec::new();
        for (source_index, source) in sources.iter().enumerate() {
            for (sentence_index, sentence) in split_sentences(&source.text).into_iter().enumerate() {
                let score = overlap_score(&sentence, &query);
                if score > 0 {
                    candidates.push((score, source_index, sentence_index, sentence));
                }
            }
        }

        let mut cited: Vec<usize> = Vec::new();
        let body = if candidates.is_empty() {
            // Nothing matches the title: fall back to source summaries
            let summaries: Vec<String> = sources
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.summary.is_empty())
                .take(3)
                .map(|(i, s)| {
                    cited.push(i);
                    s.summary.clone()
                })
                .collect();
            if summaries.is_empty() {
                return Err(DraftError::NoMaterial);
            }
            summaries.join(" ")
        } else {
            candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
            let mut picked: Vec<(usize, usize, String)> = Vec::new();
            let mut seen = HashSet::new();
            for (_, source_index, sentence_index, sentence) in candidates {
                if picked.len() == SENTENCES_PER_SECTION {
                    break;
                }
                if seen.insert(sentence.to_lowercase()) {
                    picked.push((source_index, sentence_index, sentence));
                }
            }
            // Present in reading order
            picked.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
            for (source_index, _, _) in &picked {
                if !cited.contains(source_index) {
                    cited.push(*source_index);
                }
            }
            picked
                .into_iter()
                .map(|(_, _, sentence)| sentence)
                .collect::<Vec<_>>()
                .join(" ")
        };

        let citations = cited
            .iter()
            .map(|&i| format!("{} ({})", sources[i].label(), sources[i].url))
            .collect::<Vec<_>>()
            .join("; ");

        Ok(DraftedSection::from_content(format!("{}\n\nSources: {}", body, citations)))
    }
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
