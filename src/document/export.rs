//! Export generation
//!
//! Renders the completed sections of a research record into a single document
//! and stores it as an export artifact with an optional expiry.

use crate::document::tree::SectionTree;
use crate::state::SectionStatus;
use crate::storage::{lock, new_id, timestamp_now, ExportRecord, SectionRecord, SharedStorage};
use crate::{ResearchError, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Output format of an export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    Markdown,
    Html,
    Json,
    Text,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Markdown => "markdown",
            ExportFormat::Html => "html",
            ExportFormat::Json => "json",
            ExportFormat::Text => "text",
        }
    }

    /// File extension used when an export is written to disk
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Markdown => "md",
            ExportFormat::Html => "html",
            ExportFormat::Json => "json",
            ExportFormat::Text => "txt",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = ResearchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            "html" => Ok(ExportFormat::Html),
            "json" => Ok(ExportFormat::Json),
            "text" | "txt" => Ok(ExportFormat::Text),
            other => Err(ResearchError::Validation(format!(
                "unknown export format '{}' (expected markdown, html, json or text)",
                other
            ))),
        }
    }
}

/// A complete section and the complete sections nested below it
///
/// Incomplete sections are dropped and their complete descendants move up to
/// the nearest rendered ancestor.
struct RenderNode<'a> {
    section: &'a SectionRecord,
    children: Vec<RenderNode<'a>>,
}

fn render_nodes<'a>(tree: &'a SectionTree, level: Vec<&'a SectionRecord>) -> Vec<RenderNode<'a>> {
    let mut nodes = Vec::new();
    for section in level {
        let children = render_nodes(tree, tree.children_of(&section.id));
        if section.status == SectionStatus::Complete {
            nodes.push(RenderNode { section, children });
        } else {
            nodes.extend(children);
        }
    }
    nodes
}

fn paragraphs(content: &str) -> impl Iterator<Item = &str> {
    content
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
}

fn render_markdown(topic: &str, nodes: &[RenderNode]) -> String {
    fn walk(md: &mut String, nodes: &[RenderNode], depth: usize) {
        for node in nodes {
            let level = (depth + 2).min(6);
            md.push_str(&format!("{} {}\n\n", "#".repeat(level), node.section.title));
            if let Some(content) = &node.section.content {
                for paragraph in paragraphs(content) {
                    md.push_str(paragraph);
                    md.push_str("\n\n");
                }
            }
            walk(md, &node.children, depth + 1);
        }
    }

    let mut md = format!("# {}\n\n", topic);
    walk(&mut md, nodes, 0);
    md
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn render_html(topic: &str, nodes: &[RenderNode]) -> String {
    fn walk(html: &mut String, nodes: &[RenderNode], depth: usize) {
        for node in nodes {
            let level = (depth + 2).min(6);
            html.push_str(&format!(
                "<h{level}>{}</h{level}>\n",
                escape_html(&node.section.title)
            ));
            if let Some(content) = &node.section.content {
                for paragraph in paragraphs(content) {
                    html.push_str(&format!("<p>{}</p>\n", escape_html(paragraph)));
                }
            }
            walk(html, &node.children, depth + 1);
        }
    }

    let topic = escape_html(topic);
    let mut html = format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{topic}</title>\n</head>\n<body>\n<h1>{topic}</h1>\n"
    );
    walk(&mut html, nodes, 0);
    html.push_str("</body>\n</html>\n");
    html
}

fn render_json(topic: &str, nodes: &[RenderNode]) -> Result<String> {
    fn to_value(nodes: &[RenderNode]) -> Vec<Value> {
        nodes
            .iter()
            .map(|node| {
                json!({
                    "id": node.section.id,
                    "title": node.section.title,
                    "description": node.section.description,
                    "content": node.section.content,
                    "word_count": node.section.word_count,
                    "sections": to_value(&node.children),
                })
            })
            .collect()
    }

    let document = json!({
        "topic": topic,
        "sections": to_value(nodes),
    });
    Ok(serde_json::to_string_pretty(&document)?)
}

fn render_text(topic: &str, nodes: &[RenderNode]) -> String {
    fn walk(text: &mut String, nodes: &[RenderNode], prefix: &str) {
        for (i, node) in nodes.iter().enumerate() {
            let number = if prefix.is_empty() {
                format!("{}", i + 1)
            } else {
                format!("{}.{}", prefix, i + 1)
            };
            text.push_str(&format!("{}. {}\n\n", number, node.section.title));
            if let Some(content) = &node.section.content {
                for paragraph in paragraphs(content) {
                    text.push_str(paragraph);
                    text.push_str("\n\n");
                }
            }
            walk(text, &node.children, &number);
        }
    }

    let mut text = format!("{}\n{}\n\n", topic, "=".repeat(topic.chars().count()));
    walk(&mut text, nodes, "");
    text
}

/// Creates and serves export artifacts
#[derive(Clone)]
pub struct ExportService {
    storage: SharedStorage,
    ttl: Option<Duration>,
}

impl ExportService {
    /// Creates the service; exports expire `ttl` after creation when set
    pub fn new(storage: SharedStorage, ttl: Option<Duration>) -> Self {
        Self { storage, ttl }
    }

    /// Renders all complete sections of a research record in document order
    pub fn create_export(&self, research_id: &str, format: ExportFormat) -> Result<ExportRecord> {
        let mut storage = lock(&self.storage)?;
        let research = storage
            .get_research(research_id)?
            .ok_or_else(|| ResearchError::not_found("research", research_id))?;

        let tree = SectionTree::build(storage.list_sections(research_id)?);
        let nodes = render_nodes(&tree, tree.roots());
        let content = match format {
            ExportFormat::Markdown => render_markdown(&research.topic, &nodes),
            ExportFormat::Html => render_html(&research.topic, &nodes),
            ExportFormat::Json => render_json(&research.topic, &nodes)?,
            ExportFormat::Text => render_text(&research.topic, &nodes),
        };

        let created_at = timestamp_now();
        let export = ExportRecord {
            id: new_id(),
            research_id: research_id.to_string(),
            format,
            content,
            download_count: 0,
            created_at,
            expires_at: self.ttl.map(|ttl| created_at + ttl),
        };
        storage.insert_export(&export)?;

        info!(
            "Created {} export {} for research {} ({} bytes)",
            format,
            export.id,
            research_id,
            export.content.len()
        );
        Ok(export)
    }

    /// Most recent unexpired export of a format
    pub fn get_latest_by_format(
        &self,
        research_id: &str,
        format: ExportFormat,
    ) -> Result<Option<ExportRecord>> {
        let latest = lock(&self.storage)?.latest_export_by_format(research_id, format)?;
        let now = Utc::now();
        Ok(latest.filter(|export| !is_expired(export, now)))
    }

    pub fn get_export(&self, id: &str) -> Result<ExportRecord> {
        lock(&self.storage)?
            .get_export(id)?
            .ok_or_else(|| ResearchError::not_found("export", id))
    }

    /// Records a download, returning the new count
    pub fn increment_download_count(&self, id: &str) -> Result<u64> {
        lock(&self.storage)?
            .increment_download_count(id)?
            .ok_or_else(|| ResearchError::not_found("export", id))
    }

    /// Removes exports that expired before `now`
    pub fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = lock(&self.storage)?.delete_expired_exports(now)?;
        debug!("Deleted {} expired exports", removed);
        Ok(removed)
    }
}

fn is_expired(export: &ExportRecord, now: DateTime<Utc>) -> bool {
    export.expires_at.map_or(false, |expires| expires < now)
}
