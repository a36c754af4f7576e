use crate::storage::SectionRecord;
use std::collections::{HashMap, HashSet};

/// Arena over the sections of one research record
///
/// Siblings are ordered by `order_index`, then creation time, then id.
/// Sections whose parent is missing (or that sit on a parent cycle) are
/// treated as top-level.
#[derive(Debug, Clone, Default)]
pub struct SectionTree {
    nodes: Vec<SectionRecord>,
    index: HashMap<String, usize>,
    children: Vec<Vec<usize>>,
    roots: Vec<usize>,
}

impl SectionTree {
    pub fn build(sections: Vec<SectionRecord>) -> Self {
        let index: HashMap<String, usize> = sections
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        let mut children = vec![Vec::new(); sections.len()];
        let mut roots = Vec::new();
        for (i, section) in sections.iter().enumerate() {
            match section
                .parent_section_id
                .as_ref()
                .and_then(|parent| index.get(parent))
            {
                Some(&parent) if parent != i => children[parent].push(i),
                _ => roots.push(i),
            }
        }

        let mut tree = Self {
            nodes: sections,
            index,
            children,
            roots,
        };
        tree.sort_siblings();
        tree.adopt_unreachable();
        tree
    }

    fn sort_key(&self, i: usize) -> (i64, chrono::DateTime<chrono::Utc>, &str) {
        let node = &self.nodes[i];
        (node.order_index, node.created_at, node.id.as_str())
    }

    fn sort_siblings(&mut self) {
        let mut roots = std::mem::take(&mut self.roots);
        roots.sort_by(|&a, &b| self.sort_key(a).cmp(&self.sort_key(b)));
        self.roots = roots;

        for i in 0..self.children.len() {
            let mut siblings = std::mem::take(&mut self.children[i]);
            siblings.sort_by(|&a, &b| self.sort_key(a).cmp(&self.sort_key(b)));
            self.children[i] = siblings;
        }
    }

    /// Promotes nodes only reachable through a parent cycle to roots
    fn adopt_unreachable(&mut self) {
        let mut seen = HashSet::new();
        let mut stack: Vec<usize> = self.roots.clone();
        while let Some(i) = stack.pop() {
            if seen.insert(i) {
                stack.extend(self.children[i].iter().copied());
            }
        }

        let mut orphans: Vec<usize> = (0..self.nodes.len()).filter(|i| !seen.contains(i)).collect();
        if orphans.is_empty() {
            return;
        }
        orphans.sort_by(|&a, &b| self.sort_key(a).cmp(&self.sort_key(b)));
        for orphan in orphans {
            if seen.contains(&orphan) {
                continue;
            }
            // Detach from the cycle so traversal terminates
            for siblings in self.children.iter_mut() {
                siblings.retain(|&c| c != orphan);
            }
            self.roots.push(orphan);
            let mut stack = vec![orphan];
            while let Some(i) = stack.pop() {
                if seen.insert(i) {
                    stack.extend(self.children[i].iter().copied());
                }
            }
        }

        let mut roots = std::mem::take(&mut self.roots);
        roots.sort_by(|&a, &b| self.sort_key(a).cmp(&self.sort_key(b)));
        self.roots = roots;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&SectionRecord> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn roots(&self) -> Vec<&SectionRecord> {
        self.roots.iter().map(|&i| &self.nodes[i]).collect()
    }

    pub fn children_of(&self, id: &str) -> Vec<&SectionRecord> {
        self.index
            .get(id)
            .map(|&i| self.children[i].iter().map(|&c| &self.nodes[c]).collect())
            .unwrap_or_default()
    }

    /// All sections in document order with their depth (roots are depth 0)
    pub fn pre_order(&self) -> Vec<(usize, &SectionRecord)> {
        let mut ordered = Vec::with_capacity(self.nodes.len());
        let mut visited = HashSet::new();
        let mut stack: Vec<(usize, usize)> = self.roots.iter().rev().map(|&i| (0, i)).collect();

        while let Some((depth, i)) = stack.pop() {
            if !visited.insert(i) {
                continue;
            }
            ordered.push((depth, &self.nodes[i]));
            stack.extend(self.children[i].iter().rev().map(|&c| (depth + 1, c)));
        }

        ordered
    }
}
