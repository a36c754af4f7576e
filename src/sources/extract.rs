//! Derives processed data (keywords, facts, summary) from extracted text.
//!
//! Everything here is deterministic and purely lexical; the same text always
//! yields the same keywords and facts.

use crate::storage::{timestamp_now, ProcessedDataRecord};
use std::collections::{HashMap, HashSet};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

const MAX_KEYWORDS: usize = 12;
const MAX_FACTS: usize = 8;
const MAX_FACT_CHARS: usize = 320;
const SUMMARY_SENTENCES: usize = 2;

const STOPWORDS: &[&str] = &[
    "about", "above", "after", "again", "against", "also", "among", "because", "been", "before",
    "being", "below", "between", "both", "could", "does", "doing", "down", "during", "each",
    "from", "further", "have", "having", "here", "however", "into", "itself", "just", "like",
    "more", "most", "much", "must", "only", "other", "over", "same", "should", "some", "such",
    "than", "that", "their", "them", "then", "there", "these", "they", "this", "those",
    "through", "under", "until", "very", "were", "what", "when", "where", "which", "while",
    "with", "within", "without", "would", "your", "will", "shall", "into", "onto", "upon",
    "many", "several", "used", "using", "make", "made", "well", "even", "still", "since",
];

/// Estimated token count of a text (ceil of chars / 4)
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count();
    ((chars + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN) as u64
}

pub fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Splits text into sentences on `.`, `!`, and `?` followed by whitespace
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        let boundary = matches!(c, '.' | '!' | '?')
            && chars.peek().map_or(true, |next| next.is_whitespace());
        if boundary {
            push_sentence(&mut sentences, &current);
            current.clear();
        }
    }
    push_sentence(&mut sentences, &current);

    sentences
}

fn push_sentence(sentences: &mut Vec<String>, raw: &str) {
    let sentence = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if !sentence.is_empty() {
        sentences.push(sentence);
    }
}

/// Lowercase word tokens worth indexing (4+ letters, not a stopword)
pub fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= 4)
        .map(str::to_lowercase)
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
        .filter(|word| !word.chars().all(|c| c.is_ascii_digit()))
        .collect()
}

/// Most frequent terms, ties broken by first occurrence
pub fn keywords(text: &str, limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (position, term) in terms(text).into_iter().enumerate() {
        counts.entry(term).or_insert((0, position)).0 += 1;
    }

    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    ranked.into_iter().take(limit).map(|(term, _)| term).collect()
}

/// Number of distinct `query` terms a text contains
pub fn overlap_score(text: &str, query: &HashSet<String>) -> usize {
    terms(text)
        .into_iter()
        .collect::<HashSet<_>>()
        .intersection(query)
        .count()
}

/// Sentences that state something checkable: quantitative sentences first,
/// then sentences carrying the top keywords, in document order within each group
pub fn facts(sentences: &[String], keywords: &[String], limit: usize) -> Vec<String> {
    let key_terms: HashSet<String> = keywords.iter().take(5).cloned().collect();
    let usable = |s: &&String| {
        let words = s.split_whitespace().count();
        (5..=60).contains(&words) && s.len() <= MAX_FACT_CHARS
    };

    let quantitative = sentences
        .iter()
        .filter(usable)
        .filter(|s| s.chars().any(|c| c.is_ascii_digit()));
    let topical = sentences
        .iter()
        .filter(usable)
        .filter(|s| !s.chars().any(|c| c.is_ascii_digit()))
        .filter(|s| overlap_score(s, &key_terms) >= 2);

    let mut seen = HashSet::new();
    quantitative
        .chain(topical)
        .filter(|s| seen.insert(s.to_lowercase()))
        .take(limit)
        .cloned()
        .collect()
}

/// Builds the processed data row for a completed source
pub fn process_content(source_id: &str, research_id: &str, text: &str) -> ProcessedDataRecord {
    let sentences = split_sentences(text);
    let keywords = keywords(text, MAX_KEYWORDS);
    let facts = facts(&sentences, &keywords, MAX_FACTS);
    let summary = sentences
        .iter()
        .take(SUMMARY_SENTENCES)
        .cloned()
        .collect::<Vec<_>>()
        .join(" ");

    ProcessedDataRecord {
        source_id: source_id.to_string(),
        research_id: research_id.to_string(),
        keywords,
        facts,
        summary,
        created_at: timestamp_now(),
    }
}
