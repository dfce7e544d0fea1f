use crate::error::{EngineError, EngineResult};
use crate::resource::{Resource, ResourceRegistry, RelationshipKind};
use crate::selection::SelectionSet;
use serde::Serialize;
use std::collections::BTreeMap;

/// One traversed relationship
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraversalNode {
    pub name: String,
    pub kind: RelationshipKind,
    pub target: String,
    /// 1 for the root's own relationships
    pub depth: usize,
    pub children: Vec<TraversalNode>,
    pub causes_n_plus_one: bool,
}

impl TraversalNode {
    fn count(&self) -> usize {
        1 + self.children.iter().map(TraversalNode::count).sum::<usize>()
    }
}

/// Shape of a selection relative to a resource's relationships
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAnalysis {
    pub resource: String,
    /// Deepest relationship nesting reached; 0 when nothing is traversed
    pub depth: usize,
    /// Traversed relationship names in pre-order
    pub relationships: Vec<String>,
    /// Heuristic: one query for the root plus one per relationship
    pub estimated_queries: usize,
    pub has_n_plus_one: bool,
    pub traversal_tree: Vec<TraversalNode>,
    pub relationships_by_depth: BTreeMap<usize, usize>,
    /// Diagnostic only: `2^depth + 5*relationships + 10*hasMany`
    pub complexity: u64,
}

impl QueryAnalysis {
    pub fn node_count(&self) -> usize {
        self.traversal_tree.iter().map(TraversalNode::count).sum()
    }
}

/// Walks selections against the registry
#[derive(Debug, Clone)]
pub struct QueryAnalyzer {
    registry: ResourceRegistry,
}

struct Walk {
    depth: usize,
    relationships: Vec<String>,
    by_depth: BTreeMap<usize, usize>,
    has_many: usize,
    has_n_plus_one: bool,
}

impl QueryAnalyzer {
    pub fn new(registry: ResourceRegistry) -> Self {
        Self { registry }
    }

    pub fn analyze_query(&self, resource: &str, selection: &SelectionSet) -> EngineResult<QueryAnalysis> {
        let root = self.registry.require(resource)?;
        let mut walk = Walk {
            depth: 0,
            relationships: Vec::new(),
            by_depth: BTreeMap::new(),
            has_many: 0,
            has_n_plus_one: false,
        };

        let traversal_tree = self.walk(&root, selection, 1, None, &mut walk)?;

        let relationship_count = walk.relationships.len();
        let complexity = (1u64 << walk.depth.min(63))
            .saturating_add(5 * relationship_count as u64)
            .saturating_add(10 * walk.has_many as u64);

        let analysis = QueryAnalysis {
            resource: resource.to_string(),
            depth: walk.depth,
            estimated_queries: 1 + relationship_count,
            relationships: walk.relationships,
            has_n_plus_one: walk.has_n_plus_one,
            traversal_tree,
            relationships_by_depth: walk.by_depth,
            complexity,
        };

        tracing::debug!(
            resource,
            depth = analysis.depth,
            relationships = relationship_count,
            n_plus_one = analysis.has_n_plus_one,
            "query analyzed"
        );
        Ok(analysis)
    }

    fn walk(
        &self,
        resource: &Resource,
        selection: &SelectionSet,
        depth: usize,
        parent_kind: Option<RelationshipKind>,
        walk: &mut Walk,
    ) -> EngineResult<Vec<TraversalNode>> {
        let mut nodes = Vec::new();

        for key in selection.keys() {
            let Some(relationship) = resource.relationship(key) else {
                continue;
            };
            let kind = relationship.kind();
            let causes_n_plus_one = kind == RelationshipKind::HasMany
                && (parent_kind == Some(RelationshipKind::HasMany) || depth == 1);

            walk.depth = walk.depth.max(depth);
            walk.relationships.push(key.to_string());
            *walk.by_depth.entry(depth).or_insert(0) += 1;
            if kind == RelationshipKind::HasMany {
                walk.has_many += 1;
            }
            walk.has_n_plus_one |= causes_n_plus_one;

            let target = self.registry.get(relationship.target()).ok_or_else(|| {
                EngineError::UnknownResource(relationship.target().to_string())
            })?;
            let nested = selection.nested(key).unwrap_or_default();
            let children = self.walk(&target, &nested.selection, depth + 1, Some(kind), walk)?;

            nodes.push(TraversalNode {
                name: key.to_string(),
                kind,
                target: relationship.target().to_string(),
                depth,
                children,
                causes_n_plus_one,
            });
        }

        Ok(nodes)
    }
}
