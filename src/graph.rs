//! In-memory dependency graph derived from `imports` relations.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::analysis::RelationKind;
use crate::error::Result;
use crate::repo::RelationRepository;

/// Directed file-level import graph for one project. A derived view: rebuild
/// it after indexing to pick up new edges.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// src -> set of dst (what src imports)
    forward: BTreeMap<String, BTreeSet<String>>,
    /// dst -> set of src (who imports dst)
    reverse: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Materializes the graph from all `imports` relations of `project`.
    pub fn build(relations: &RelationRepository, project: &str) -> Result<Self> {
        let mut graph = Self::default();
        for edge in relations.get_by_type(project, RelationKind::Imports)? {
            graph.add_edge(edge.src_file_path, edge.dst_file_path);
        }
        Ok(graph)
    }

    pub fn add_edge(&mut self, src: String, dst: String) {
        self.forward
            .entry(src.clone())
            .or_default()
            .insert(dst.clone());
        self.reverse.entry(dst).or_default().insert(src);
    }

    /// Direct imports of `path`.
    pub fn dependencies_of(&self, path: &str) -> Vec<String> {
        self.forward
            .get(path)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Direct importers of `path`.
    pub fn dependents_of(&self, path: &str) -> Vec<String> {
        self.reverse
            .get(path)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every file that transitively imports `path`, excluding `path` itself.
    /// BFS over reverse edges.
    pub fn transitive_dependents(&self, path: &str) -> Vec<String> {
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(path);

        while let Some(current) = queue.pop_front() {
            if let Some(importers) = self.reverse.get(current) {
                for importer in importers {
                    if importer != path && visited.insert(importer) {
                        queue.push_back(importer);
                    }
                }
            }
        }
        visited.into_iter().map(String::from).collect()
    }

    /// Union of transitive dependents over all inputs, deduplicated.
    pub fn affected_by_change(&self, paths: &[String]) -> Vec<String> {
        let mut affected: BTreeSet<String> = BTreeSet::new();
        for path in paths {
            affected.extend(self.transitive_dependents(path));
        }
        affected.into_iter().collect()
    }

    /// Three-colour DFS; a back-edge to a gray node proves a cycle.
    pub fn has_cycle(&self) -> bool {
        let mut colours: HashMap<&str, Colour> = HashMap::new();
        for node in self.forward.keys() {
            if colours.get(node.as_str()).copied().unwrap_or(Colour::White) == Colour::White
                && self.dfs_cycle(node, &mut colours)
            {
                return true;
            }
        }
        false
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a str,
        colours: &mut HashMap<&'a str, Colour>,
    ) -> bool {
        colours.insert(node, Colour::Gray);
        if let Some(next) = self.forward.get(node) {
            for dst in next {
                match colours.get(dst.as_str()).copied().unwrap_or(Colour::White) {
                    Colour::Gray => return true,
                    Colour::White => {
                        if self.dfs_cycle(dst, colours) {
                            return true;
                        }
                    }
                    Colour::Black => {}
                }
            }
        }
        colours.insert(node, Colour::Black);
        false
    }

    pub fn node_count(&self) -> usize {
        let mut nodes: BTreeSet<&str> = BTreeSet::new();
        nodes.extend(self.forward.keys().map(String::as_str));
        nodes.extend(self.reverse.keys().map(String::as_str));
        nodes.len()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Colour {
    White,
    Gray,
    Black,
}
