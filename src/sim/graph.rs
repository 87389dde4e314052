//! Spore graph: spores connected by directed, typed step edges
//!
//! An edge `parent -> child` records the signed step and control that take
//! the parent to the child. Ghost edges are previews and never count as
//! links. Every mutation bumps `generation` so derived caches can tell when
//! they are stale.

use std::collections::{BTreeMap, BTreeSet};

use glam::DVec2;
use serde::Serialize;

use super::SporeId;
use super::spore::SporeLogic;
use super::spore_tree::SporeTree;
use crate::consts::CHILD_COUNT;
use crate::error::GraphError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EdgeKind {
    Real,
    Ghost,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Edge {
    pub parent: SporeId,
    pub child: SporeId,
    /// Signed step from parent to child
    pub dt: f64,
    pub control: f64,
    pub kind: EdgeKind,
}

impl Edge {
    pub fn is_real(&self) -> bool {
        self.kind == EdgeKind::Real
    }
}

/// Ids assigned by `SporeGraph::insert_tree`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNodeIds {
    pub root: SporeId,
    pub children: [SporeId; CHILD_COUNT],
    /// In the tree's grandchild order
    pub grandchildren: Vec<SporeId>,
}

#[derive(Debug, Clone, Default)]
pub struct SporeGraph {
    spores: BTreeMap<SporeId, SporeLogic>,
    /// Keyed by (parent, child)
    edges: BTreeMap<(SporeId, SporeId), Edge>,
    /// (child, parent) for incoming lookups
    incoming: BTreeSet<(SporeId, SporeId)>,
    next_id: SporeId,
    generation: u64,
}

impl SporeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped by every successful mutation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.spores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spores.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn add_spore(&mut self, logic: SporeLogic) -> SporeId {
        let id = self.next_id;
        self.next_id += 1;
        self.spores.insert(id, logic);
        self.generation += 1;
        id
    }

    pub fn spore(&self, id: SporeId) -> Option<&SporeLogic> {
        self.spores.get(&id)
    }

    pub fn spore_mut(&mut self, id: SporeId) -> Option<&mut SporeLogic> {
        // Spore state does not affect links, so no generation bump
        self.spores.get_mut(&id)
    }

    /// Spore ids in ascending order
    pub fn spore_ids(&self) -> impl Iterator<Item = SporeId> + '_ {
        self.spores.keys().copied()
    }

    pub fn contains(&self, id: SporeId) -> bool {
        self.spores.contains_key(&id)
    }

    pub fn add_edge(
        &mut self,
        parent: SporeId,
        child: SporeId,
        dt: f64,
        control: f64,
        kind: EdgeKind,
    ) -> Result<(), GraphError> {
        self.require(parent)?;
        self.require(child)?;
        if parent == child {
            return Err(GraphError::SelfLoop(parent));
        }
        if self.edges.contains_key(&(parent, child)) {
            return Err(GraphError::DuplicateEdge { parent, child });
        }
        self.edges.insert(
            (parent, child),
            Edge {
                parent,
                child,
                dt,
                control,
                kind,
            },
        );
        self.incoming.insert((child, parent));
        self.generation += 1;
        Ok(())
    }

    pub fn remove_edge(&mut self, parent: SporeId, child: SporeId) -> Option<Edge> {
        let edge = self.edges.remove(&(parent, child))?;
        self.incoming.remove(&(child, parent));
        self.generation += 1;
        Some(edge)
    }

    /// Remove a spore together with every edge touching it
    pub fn remove_spore(&mut self, id: SporeId) -> Result<SporeLogic, GraphError> {
        let logic = self.spores.remove(&id).ok_or(GraphError::UnknownSpore(id))?;
        let outgoing: Vec<SporeId> = self.children(id).iter().map(|e| e.child).collect();
        let incoming: Vec<SporeId> = self.parents(id).iter().map(|e| e.parent).collect();
        for child in outgoing {
            self.edges.remove(&(id, child));
            self.incoming.remove(&(child, id));
        }
        for parent in incoming {
            self.edges.remove(&(parent, id));
            self.incoming.remove(&(id, parent));
        }
        self.generation += 1;
        Ok(logic)
    }

    pub fn edge(&self, parent: SporeId, child: SporeId) -> Option<&Edge> {
        self.edges.get(&(parent, child))
    }

    /// Outgoing edges, ascending by child id
    pub fn children(&self, id: SporeId) -> Vec<&Edge> {
        self.edges
            .range((id, SporeId::MIN)..=(id, SporeId::MAX))
            .map(|(_, e)| e)
            .collect()
    }

    /// Incoming edges, ascending by parent id
    pub fn parents(&self, id: SporeId) -> Vec<&Edge> {
        self.incoming
            .range((id, SporeId::MIN)..=(id, SporeId::MAX))
            .filter_map(|&(child, parent)| self.edges.get(&(parent, child)))
            .collect()
    }

    /// All edges, ordered by (parent, child)
    pub fn edges(&self) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.values()
    }

    /// Add a spore tree as real edges root -> children -> grandchildren.
    /// A merged grandchild is linked from both source parents with their own
    /// signed steps. Every new spore chases `goal` with default step `dt`.
    pub fn insert_tree(&mut self, tree: &SporeTree, goal: DVec2, dt: f64) -> Result<TreeNodeIds, GraphError> {
        let root = self.add_spore(SporeLogic::new(goal, tree.root(), dt));

        let mut children = [0; CHILD_COUNT];
        for (slot, child) in children.iter_mut().zip(tree.children()) {
            let id = self.add_spore(SporeLogic::new(goal, child.position, dt));
            self.add_edge(root, id, child.dt, child.control, EdgeKind::Real)?;
            *slot = id;
        }

        let mut grandchildren = Vec::with_capacity(tree.grandchildren().len());
        for gc in tree.grandchildren() {
            let id = self.add_spore(SporeLogic::new(goal, gc.position, dt));
            for source in gc.sources() {
                let parent = children[source.parent_idx];
                // Merged siblings share one parent edge
                if self.edge(parent, id).is_none() {
                    self.add_edge(parent, id, source.dt, source.control, EdgeKind::Real)?;
                }
            }
            grandchildren.push(id);
        }

        log::info!(
            "Inserted spore tree: root {}, {} children, {} grandchildren",
            root,
            children.len(),
            grandchildren.len()
        );
        Ok(TreeNodeIds {
            root,
            children,
            grandchildren,
        })
    }

    fn require(&self, id: SporeId) -> Result<(), GraphError> {
        if self.spores.contains_key(&id) {
            Ok(())
        } else {
            Err(GraphError::UnknownSpore(id))
        }
    }
}
