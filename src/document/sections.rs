use crate::document::tree::SectionTree;
use crate::storage::{lock, SectionRecord, SharedStorage};
use crate::workflow::OutlineNode;
use crate::{ResearchError, Result};
use std::collections::HashSet;
use tracing::info;

/// Queries and structural edits on the document section tree
#[derive(Clone)]
pub struct SectionService {
    storage: SharedStorage,
}

impl SectionService {
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }

    fn require_research(&self, research_id: &str) -> Result<()> {
        match lock(&self.storage)?.get_research(research_id)? {
            Some(_) => Ok(()),
            None => Err(ResearchError::not_found("research", research_id)),
        }
    }

    pub fn get_section(&self, section_id: &str) -> Result<SectionRecord> {
        lock(&self.storage)?
            .get_section(section_id)?
            .ok_or_else(|| ResearchError::not_found("section", section_id))
    }

    /// Builds the full section tree of a research record
    pub fn tree(&self, research_id: &str) -> Result<SectionTree> {
        self.require_research(research_id)?;
        let sections = lock(&self.storage)?.list_sections(research_id)?;
        Ok(SectionTree::build(sections))
    }

    pub fn get_top_level_sections(&self, research_id: &str) -> Result<Vec<SectionRecord>> {
        Ok(self.tree(research_id)?.roots().into_iter().cloned().collect())
    }

    pub fn get_subsections(&self, parent_id: &str) -> Result<Vec<SectionRecord>> {
        let parent = self.get_section(parent_id)?;
        let tree = SectionTree::build(lock(&self.storage)?.list_sections(&parent.research_id)?);
        Ok(tree.children_of(parent_id).into_iter().cloned().collect())
    }

    /// Persists an outline as `pending` sections in one transaction
    ///
    /// Siblings get `order_index` 0, 1, 2... in outline order.
    pub fn create_outline(
        &self,
        research_id: &str,
        outline: &[OutlineNode],
    ) -> Result<Vec<SectionRecord>> {
        let mut records = Vec::new();
        flatten(research_id, None, outline, &mut records);
        lock(&self.storage)?.insert_sections(&records)?;
        info!("Created {} sections for research {}", records.len(), research_id);
        Ok(records)
    }

    /// Applies new `order_index` values to a set of sibling sections
    ///
    /// All ids must exist, be distinct, and share one parent; together they
    /// must cover every sibling under that parent with distinct indices.
    /// Nothing is written unless every check passes; the update itself is
    /// one transaction.
    pub fn reorder_sections(&self, updates: &[(String, i64)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut seen = HashSet::new();
        if let Some((dup, _)) = updates.iter().find(|(id, _)| !seen.insert(id.as_str())) {
            return Err(ResearchError::Validation(format!(
                "section {} appears more than once in the reorder",
                dup
            )));
        }

        let mut indices = HashSet::new();
        if let Some((id, index)) = updates.iter().find(|(_, index)| !indices.insert(*index)) {
            return Err(ResearchError::Validation(format!(
                "order index {} of section {} is used twice",
                index, id
            )));
        }

        let mut storage = lock(&self.storage)?;
        let mut family: Option<(String, Option<String>)> = None;
        for (id, _) in updates {
            let section = storage.get_section(id)?.ok_or_else(|| {
                ResearchError::Validation(format!("section {} does not exist", id))
            })?;
            let key = (section.research_id, section.parent_section_id);
            if family.is_none() {
                family = Some(key);
            } else if family.as_ref() != Some(&key) {
                return Err(ResearchError::Validation(
                    "reordered sections must share the same parent".to_string(),
                ));
            }
        }

        if let Some((research_id, parent)) = family {
            let siblings = storage
                .list_sections(&research_id)?
                .into_iter()
                .filter(|s| s.parent_section_id == parent)
                .count();
            if siblings != updates.len() {
                return Err(ResearchError::Validation(format!(
                    "reorder names {} of {} sibling sections",
                    updates.len(),
                    siblings
                )));
            }
        }

        storage.reorder_sections(updates)?;
        Ok(())
    }
}

fn flatten(
    research_id: &str,
    parent_id: Option<&str>,
    nodes: &[OutlineNode],
    out: &mut Vec<SectionRecord>,
) {
    for (order_index, node) in nodes.iter().enumerate() {
        let record = SectionRecord::new(
            research_id,
            parent_id,
            &node.title,
            node.description.as_deref(),
            order_index as i64,
        );
        let id = record.id.clone();
        out.push(record);
        flatten(research_id, Some(id.as_str()), &node.children, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_research, test_storage};

    fn create_test_service() -> (SectionService, String) {
        let storage = test_storage();
        let research = seed_research(&storage);
        (SectionService::new(storage), research.id)
    }

    fn outline() -> Vec<OutlineNode> {
        vec![
            OutlineNode {
                title: "Intro".to_string(),
                description: None,
                children: vec![
                    OutlineNode::leaf("Scope", None),
                    OutlineNode::leaf("Terms", None),
                ],
            },
            OutlineNode::leaf("Findings", Some("What we found".to_string())),
            OutlineNode::leaf("Conclusion", None),
        ]
    }

    #[test]
    fn test_create_outline_structure() {
        let (service, research_id) = create_test_service();
        service.create_outline(&research_id, &outline()).unwrap();

        let top = service.get_top_level_sections(&research_id).unwrap();
        let titles: Vec<&str> = top.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Intro", "Findings", "Conclusion"]);
        assert_eq!(top[1].description.as_deref(), Some("What we found"));

        let children = service.get_subsections(&top[0].id).unwrap();
        let titles: Vec<&str> = children.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Scope", "Terms"]);
        assert_eq!(children[1].order_index, 1);
    }

    #[test]
    fn test_reorder_is_permutation() {
        let (service, research_id) = create_test_service();
        service.create_outline(&research_id, &outline()).unwrap();
        let top = service.get_top_level_sections(&research_id).unwrap();

        service
            .reorder_sections(&[
                (top[0].id.clone(), 2),
                (top[1].id.clone(), 0),
                (top[2].id.clone(), 1),
            ])
            .unwrap();

        let reordered = service.get_top_level_sections(&research_id).unwrap();
        let titles: Vec<&str> = reordered.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Findings", "Conclusion", "Intro"]);

        let mut before: Vec<&str> = top.iter().map(|s| s.id.as_str()).collect();
        let mut after: Vec<&str> = reordered.iter().map(|s| s.id.as_str()).collect();
        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[test]
    fn test_reorder_rejects_mixed_parents() {
        let (service, research_id) = create_test_service();
        service.create_outline(&research_id, &outline()).unwrap();
        let top = service.get_top_level_sections(&research_id).unwrap();
        let child = service.get_subsections(&top[0].id).unwrap().remove(0);

        let result = service.reorder_sections(&[(top[1].id.clone(), 0), (child.id.clone(), 1)]);
        assert!(matches!(result, Err(ResearchError::Validation(_))));

        // Nothing changed
        let unchanged = service.get_top_level_sections(&research_id).unwrap();
        assert_eq!(unchanged[1].order_index, 1);
    }

    #[test]
    fn test_reorder_rejects_unknown_and_duplicate_ids() {
        let (service, research_id) = create_test_service();
        service.create_outline(&research_id, &outline()).unwrap();
        let top = service.get_top_level_sections(&research_id).unwrap();

        assert!(matches!(
            service.reorder_sections(&[("missing".to_string(), 0)]),
            Err(ResearchError::Validation(_))
        ));
        assert!(matches!(
            service.reorder_sections(&[(top[0].id.clone(), 0), (top[0].id.clone(), 1)]),
            Err(ResearchError::Validation(_))
        ));
    }

    #[test]
    fn test_reorder_requires_full_sibling_set_and_distinct_indices() {
        let (service, research_id) = create_test_service();
        service.create_outline(&research_id, &outline()).unwrap();
        let top = service.get_top_level_sections(&research_id).unwrap();

        // Partial sibling set
        assert!(matches!(
            service.reorder_sections(&[(top[0].id.clone(), 1), (top[1].id.clone(), 0)]),
            Err(ResearchError::Validation(_))
        ));
        // Colliding indices
        assert!(matches!(
            service.reorder_sections(&[
                (top[0].id.clone(), 0),
                (top[1].id.clone(), 0),
                (top[2].id.clone(), 1),
            ]),
            Err(ResearchError::Validation(_))
        ));

        let unchanged = service.get_top_level_sections(&research_id).unwrap();
        let indices: Vec<i64> = unchanged.iter().map(|s| s.order_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        // A full set of children reorders fine
        let children = service.get_subsections(&top[0].id).unwrap();
        service
            .reorder_sections(&[(children[0].id.clone(), 1), (children[1].id.clone(), 0)])
            .unwrap();
        let titles: Vec<String> = service
            .get_subsections(&top[0].id)
            .unwrap()
            .into_iter()
            .map(|s| s.title)
            .collect();
        assert_eq!(titles, vec!["Terms", "Scope"]);
    }

    #[test]
    fn test_unknown_research_is_not_found() {
        let (service, _) = create_test_service();
        assert!(matches!(
            service.get_top_level_sections("missing"),
            Err(ResearchError::NotFound { .. })
        ));
    }
}
