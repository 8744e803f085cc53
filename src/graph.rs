//! Dependency graph over template documents.
//!
//! Edges point from a requirement to its dependents: an edge `R -> D` means `D` statically
//! references `R` (includes it, extends it, renders it as a partial), so any change to `R`
//! requires `D` to be recompiled. The graph only ever holds one edge per ordered pair.
//!
//! Incremental updates go through [`DependencyGraph::recompute_one`], which is deliberately
//! conservative: it re-derives the requirements of the changed document but keeps the edges to
//! its previous dependents, because those dependents' own reference lists have not been
//! re-read. A dependent that dropped its reference keeps a stale edge until it is itself
//! recomputed, which costs at most one extra rebuild.

use crate::{document::DocumentId, error::PagewrightError};
use petgraph::{
    stable_graph::{NodeIndex, StableDiGraph},
    visit::{EdgeRef, IntoEdgeReferences},
    Direction,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: StableDiGraph<DocumentId, ()>,
    nodes: BTreeMap<DocumentId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the graph from scratch for a full document set.
    ///
    /// `requirements` yields the statically referenced documents of one document. A failure is
    /// logged and treated as "no requirements"; it never blocks the other documents.
    pub fn load_all<'a, I, F>(&mut self, documents: I, mut requirements: F)
    where
        I: IntoIterator<Item = &'a DocumentId>,
        F: FnMut(&DocumentId) -> Result<Vec<DocumentId>, PagewrightError>,
    {
        self.graph.clear();
        self.nodes.clear();
        for document in documents {
            for requirement in Self::requirements_or_empty(document, &mut requirements) {
                self.add_edge(&requirement, document);
            }
        }
        tracing::debug!(
            "Dependency graph loaded: {} nodes, {} edges",
            self.node_count(),
            self.edge_count()
        );
    }

    /// Re-derive `id`'s requirement edges after its own content changed.
    ///
    /// The current dependents of `id` are captured first and re-attached after the node has
    /// been dropped and its requirements re-parsed. If parsing fails the node ends up with no
    /// requirement edges but its dependent edges are still restored.
    pub fn recompute_one<F>(&mut self, id: &DocumentId, mut requirements: F)
    where
        F: FnMut(&DocumentId) -> Result<Vec<DocumentId>, PagewrightError>,
    {
        let old_dependents = self.dependents_of(id);
        self.remove(id);
        for requirement in Self::requirements_or_empty(id, &mut requirements) {
            self.add_edge(&requirement, id);
        }
        for dependent in old_dependents.iter() {
            self.add_edge(id, dependent);
        }
    }

    /// Every document transitively reachable from `id` along requirement -> dependent edges.
    ///
    /// `id` itself is only part of the result when a reference cycle leads back to it.
    pub fn affected_by(&self, id: &DocumentId) -> BTreeSet<DocumentId> {
        let mut affected = BTreeSet::new();
        let Some(&start) = self.nodes.get(id) else {
            return affected;
        };
        let mut visited = HashSet::new();
        let mut stack: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(start, Direction::Outgoing)
            .collect();
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            affected.insert(self.graph[node].clone());
            stack.extend(self.graph.neighbors_directed(node, Direction::Outgoing));
        }
        affected
    }

    /// Remove `id` and all of its edges. Returns whether the node existed.
    pub fn remove(&mut self, id: &DocumentId) -> bool {
        match self.nodes.remove(id) {
            Some(index) => {
                self.graph.remove_node(index);
                true
            }
            None => false,
        }
    }

    /// Record that `dependent` references `requirement`. Duplicate edges are collapsed.
    pub fn add_edge(&mut self, requirement: &DocumentId, dependent: &DocumentId) {
        let from = self.node(requirement);
        let to = self.node(dependent);
        self.graph.update_edge(from, to, ());
    }

    /// Documents with a direct edge from `id`, i.e. the documents that reference it.
    pub fn dependents_of(&self, id: &DocumentId) -> BTreeSet<DocumentId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Documents `id` directly references.
    pub fn requirements_of(&self, id: &DocumentId) -> BTreeSet<DocumentId> {
        self.neighbors(id, Direction::Incoming)
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.nodes.contains_key(id)
    }

    /// All `(requirement, dependent)` pairs, sorted.
    pub fn edges(&self) -> BTreeSet<(DocumentId, DocumentId)> {
        (&self.graph)
            .edge_references()
            .map(|edge| {
                (
                    self.graph[edge.source()].clone(),
                    self.graph[edge.target()].clone(),
                )
            })
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    fn node(&mut self, id: &DocumentId) -> NodeIndex {
        if let Some(&index) = self.nodes.get(id) {
            return index;
        }
        let index = self.graph.add_node(id.clone());
        self.nodes.insert(id.clone(), index);
        index
    }

    fn neighbors(&self, id: &DocumentId, direction: Direction) -> BTreeSet<DocumentId> {
        match self.nodes.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .map(|n| self.graph[n].clone())
                .collect(),
            None => BTreeSet::new(),
        }
    }

    fn requirements_or_empty<F>(id: &DocumentId, requirements: &mut F) -> Vec<DocumentId>
    where
        F: FnMut(&DocumentId) -> Result<Vec<DocumentId>, PagewrightError>,
    {
        match requirements(id) {
            Ok(found) => found
                .into_iter()
                .filter(|requirement| !requirement.as_str().is_empty())
                .collect(),
            Err(e) => {
                tracing::error!("Error analyzing {}: {}", id, e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn id(s: &str) -> DocumentId {
        DocumentId::new(s)
    }

    fn ids(items: &[&str]) -> BTreeSet<DocumentId> {
        items.iter().map(|s| id(s)).collect()
    }

    /// Requirement lookup backed by fixed `(document, requirement)` pairs.
    fn table(
        pairs: &[(&str, &str)],
    ) -> impl FnMut(&DocumentId) -> Result<Vec<DocumentId>, PagewrightError> {
        let mut map: BTreeMap<DocumentId, Vec<DocumentId>> = BTreeMap::new();
        for (doc, requirement) in pairs {
            map.entry(id(doc)).or_default().push(id(requirement));
        }
        move |doc: &DocumentId| Ok(map.get(doc).cloned().unwrap_or_default())
    }

    fn chain_graph() -> DependencyGraph {
        // base <- layout <- page, base <- sidebar <- page, page2 references nothing
        let docs = ids(&["base.html", "layout.html", "sidebar.html", "page.html", "page2.html"]);
        let mut graph = DependencyGraph::new();
        graph.load_all(
            docs.iter(),
            table(&[
                ("layout.html", "base.html"),
                ("sidebar.html", "base.html"),
                ("page.html", "layout.html"),
                ("page.html", "sidebar.html"),
            ]),
        );
        graph
    }

    #[test]
    fn test_affected_by_is_transitive_and_excludes_start() {
        let graph = chain_graph();
        assert_eq!(
            graph.affected_by(&id("base.html")),
            ids(&["layout.html", "sidebar.html", "page.html"])
        );
        assert_eq!(graph.affected_by(&id("layout.html")), ids(&["page.html"]));
        assert!(graph.affected_by(&id("page.html")).is_empty());
        assert!(graph.affected_by(&id("page2.html")).is_empty());
        assert!(graph.affected_by(&id("unknown.html")).is_empty());
    }

    #[test]
    fn test_affected_by_terminates_on_cycles() {
        let docs = ids(&["a.html", "b.html", "c.html"]);
        let mut graph = DependencyGraph::new();
        graph.load_all(
            docs.iter(),
            table(&[
                ("a.html", "c.html"),
                ("b.html", "a.html"),
                ("c.html", "b.html"),
            ]),
        );
        assert_eq!(
            graph.affected_by(&id("a.html")),
            ids(&["a.html", "b.html", "c.html"])
        );
    }

    #[test]
    fn test_no_duplicate_edges() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(&id("a.html"), &id("b.html"));
        graph.add_edge(&id("a.html"), &id("b.html"));
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_load_all_parse_failure_means_no_requirements() {
        let docs = ids(&["a.html", "b.html", "c.html"]);
        let mut graph = DependencyGraph::new();
        graph.load_all(docs.iter(), |doc: &DocumentId| {
            if doc.as_str() == "b.html" {
                Err(PagewrightError::parse_failure(doc, "unterminated tag"))
            } else if doc.as_str() == "c.html" {
                Ok(vec![id("a.html")])
            } else {
                Ok(vec![])
            }
        });
        assert!(graph.requirements_of(&id("b.html")).is_empty());
        assert_eq!(graph.affected_by(&id("a.html")), ids(&["c.html"]));
    }

    #[test]
    fn test_recompute_one_preserves_dependents() {
        let mut graph = chain_graph();
        // layout.html stops referencing base.html and starts referencing header.html
        graph.recompute_one(&id("layout.html"), table(&[("layout.html", "header.html")]));

        assert_eq!(graph.requirements_of(&id("layout.html")), ids(&["header.html"]));
        assert_eq!(graph.dependents_of(&id("layout.html")), ids(&["page.html"]));
        assert_eq!(
            graph.affected_by(&id("header.html")),
            ids(&["layout.html", "page.html"])
        );
        assert_eq!(
            graph.affected_by(&id("base.html")),
            ids(&["sidebar.html", "page.html"])
        );
    }

    #[test]
    fn test_recompute_one_is_idempotent() {
        let mut once = chain_graph();
        once.recompute_one(&id("sidebar.html"), table(&[("sidebar.html", "base.html")]));
        let mut twice = once.clone();
        twice.recompute_one(&id("sidebar.html"), table(&[("sidebar.html", "base.html")]));
        assert_eq!(once.edges(), twice.edges());
        assert_eq!(once.edges(), chain_graph().edges());
    }

    #[test]
    fn test_recompute_one_fails_open() {
        let mut graph = chain_graph();
        graph.recompute_one(&id("layout.html"), |doc: &DocumentId| {
            Err(PagewrightError::parse_failure(doc, "bad syntax"))
        });
        assert!(graph.requirements_of(&id("layout.html")).is_empty());
        assert_eq!(graph.dependents_of(&id("layout.html")), ids(&["page.html"]));
    }

    #[test]
    fn test_recompute_keeps_stale_dependent_edge_until_dependent_recomputes() {
        let mut graph = chain_graph();
        // page.html drops its reference to layout.html, but only layout.html is recomputed.
        graph.recompute_one(&id("layout.html"), table(&[("layout.html", "base.html")]));
        assert!(graph.dependents_of(&id("layout.html")).contains(&id("page.html")));

        graph.recompute_one(&id("page.html"), table(&[("page.html", "sidebar.html")]));
        assert!(!graph.dependents_of(&id("layout.html")).contains(&id("page.html")));
    }

    #[test]
    fn test_remove() {
        let mut graph = chain_graph();
        assert!(graph.remove(&id("sidebar.html")));
        assert!(!graph.remove(&id("sidebar.html")));
        assert!(!graph.contains(&id("sidebar.html")));
        assert_eq!(
            graph.affected_by(&id("base.html")),
            ids(&["layout.html", "page.html"])
        );
    }
}
