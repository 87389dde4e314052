//! Valence bookkeeping
//!
//! Every spore has 12 local growth directions ("slots"): 4 one-step children
//! `(time direction, control type)` and 8 two-step grandchildren whose second
//! control is the inverse of the first. A slot is occupied when a real link in
//! the graph already realises that direction; occupied slots carry fixed dt
//! values the optimiser must not touch.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::SporeId;
use super::graph::SporeGraph;
use crate::consts::{CHILD_COUNT, GRANDCHILD_COUNT, VALENCE_SLOT_COUNT};
use crate::error::GraphError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotType {
    Child,
    Grandchild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeDirection {
    Forward,
    Backward,
}

impl TimeDirection {
    /// `dt >= 0` is forward
    #[inline]
    pub fn from_dt(dt: f64) -> Self {
        if dt >= 0.0 {
            TimeDirection::Forward
        } else {
            TimeDirection::Backward
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeDirection::Forward => "forward",
            TimeDirection::Backward => "backward",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlType {
    Max,
    Min,
}

impl ControlType {
    /// Zero control has no type
    #[inline]
    pub fn from_control(control: f64) -> Option<Self> {
        if control > 0.0 {
            Some(ControlType::Max)
        } else if control < 0.0 {
            Some(ControlType::Min)
        } else {
            None
        }
    }

    pub fn inverse(self) -> Self {
        match self {
            ControlType::Max => ControlType::Min,
            ControlType::Min => ControlType::Max,
        }
    }

    /// +1 for max, -1 for min
    pub fn sign(self) -> f64 {
        match self {
            ControlType::Max => 1.0,
            ControlType::Min => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ControlType::Max => "max",
            ControlType::Min => "min",
        }
    }
}

/// `forward_max` for children, `forward_max_backward_min` for grandchildren
pub fn slot_name(
    time_direction: TimeDirection,
    control_type: ControlType,
    second_time_direction: Option<TimeDirection>,
) -> String {
    match second_time_direction {
        None => format!("{}_{}", time_direction.as_str(), control_type.as_str()),
        Some(second) => format!(
            "{}_{}_{}_{}",
            time_direction.as_str(),
            control_type.as_str(),
            second.as_str(),
            control_type.inverse().as_str()
        ),
    }
}

/// One local growth direction of a spore
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValenceSlot {
    pub slot_type: SlotType,
    /// First step
    pub time_direction: TimeDirection,
    pub control_type: ControlType,
    /// Second step (grandchildren only)
    pub second_time_direction: Option<TimeDirection>,
    pub occupied: bool,
    /// Total signed time to the neighbour
    pub dt_value: Option<f64>,
    /// Signed time of each hop
    pub dt_sequence: Vec<f64>,
    pub neighbor_id: Option<SporeId>,
    pub is_fixed: bool,
}

impl ValenceSlot {
    fn child(time_direction: TimeDirection, control_type: ControlType) -> Self {
        Self {
            slot_type: SlotType::Child,
            time_direction,
            control_type,
            second_time_direction: None,
            occupied: false,
            dt_value: None,
            dt_sequence: Vec::new(),
            neighbor_id: None,
            is_fixed: false,
        }
    }

    fn grandchild(first: TimeDirection, control_type: ControlType, second: TimeDirection) -> Self {
        Self {
            slot_type: SlotType::Grandchild,
            second_time_direction: Some(second),
            ..Self::child(first, control_type)
        }
    }

    /// Control of the second hop, always the inverse of the first
    pub fn second_control_type(&self) -> Option<ControlType> {
        match self.slot_type {
            SlotType::Child => None,
            SlotType::Grandchild => Some(self.control_type.inverse()),
        }
    }

    pub fn name(&self) -> String {
        slot_name(self.time_direction, self.control_type, self.second_time_direction)
    }

    fn occupy(&mut self, neighbor: SporeId, dt_sequence: Vec<f64>) {
        self.occupied = true;
        self.neighbor_id = Some(neighbor);
        self.dt_value = Some(dt_sequence.iter().sum());
        self.dt_sequence = dt_sequence;
        self.is_fixed = true;
    }
}

impl fmt::Display for ValenceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.occupied { "[x]" } else { "[ ]" };
        write!(f, "{} {}", status, self.name())?;
        if !self.dt_sequence.is_empty() {
            let hops: Vec<String> = self.dt_sequence.iter().map(|dt| format!("{:+.6}", dt)).collect();
            write!(f, ": dt=[{}]", hops.join(", "))?;
        }
        if let Some(id) = self.neighbor_id {
            write!(f, " -> {}", id)?;
        }
        if self.is_fixed {
            write!(f, " (fixed)")?;
        }
        Ok(())
    }
}

/// All 12 slots of one spore
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SporeValence {
    pub spore_id: SporeId,
    children: [ValenceSlot; CHILD_COUNT],
    grandchildren: [ValenceSlot; GRANDCHILD_COUNT],
}

impl SporeValence {
    /// Fresh valence with every slot free
    pub fn new(spore_id: SporeId) -> Self {
        use ControlType::{Max, Min};
        use TimeDirection::{Backward, Forward};
        Self {
            spore_id,
            children: [
                ValenceSlot::child(Forward, Max),
                ValenceSlot::child(Forward, Min),
                ValenceSlot::child(Backward, Max),
                ValenceSlot::child(Backward, Min),
            ],
            grandchildren: [
                ValenceSlot::grandchild(Forward, Max, Forward),
                ValenceSlot::grandchild(Forward, Max, Backward),
                ValenceSlot::grandchild(Forward, Min, Forward),
                ValenceSlot::grandchild(Forward, Min, Backward),
                ValenceSlot::grandchild(Backward, Max, Forward),
                ValenceSlot::grandchild(Backward, Max, Backward),
                ValenceSlot::grandchild(Backward, Min, Forward),
                ValenceSlot::grandchild(Backward, Min, Backward),
            ],
        }
    }

    pub fn total_slots(&self) -> usize {
        VALENCE_SLOT_COUNT
    }

    pub fn children_slots(&self) -> &[ValenceSlot; CHILD_COUNT] {
        &self.children
    }

    pub fn grandchildren_slots(&self) -> &[ValenceSlot; GRANDCHILD_COUNT] {
        &self.grandchildren
    }

    /// Children first, then grandchildren
    pub fn slots(&self) -> impl Iterator<Item = &ValenceSlot> {
        self.children.iter().chain(self.grandchildren.iter())
    }

    pub fn free_slots(&self) -> Vec<&ValenceSlot> {
        self.slots().filter(|s| !s.occupied).collect()
    }

    pub fn occupied_slots(&self) -> Vec<&ValenceSlot> {
        self.slots().filter(|s| s.occupied).collect()
    }

    /// Slot name -> dt the optimiser must keep
    pub fn fixed_dt_values(&self) -> BTreeMap<String, f64> {
        self.slots()
            .filter(|s| s.occupied && s.is_fixed)
            .filter_map(|s| s.dt_value.map(|dt| (s.name(), dt)))
            .collect()
    }

    /// Names of the slots the optimiser still has to fill
    pub fn free_slot_names(&self) -> Vec<String> {
        self.slots().filter(|s| !s.occupied).map(|s| s.name()).collect()
    }

    pub fn count_free_children(&self) -> usize {
        self.children.iter().filter(|s| !s.occupied).count()
    }

    pub fn count_free_grandchildren(&self) -> usize {
        self.grandchildren.iter().filter(|s| !s.occupied).count()
    }

    pub fn count_occupied_children(&self) -> usize {
        CHILD_COUNT - self.count_free_children()
    }

    pub fn count_occupied_grandchildren(&self) -> usize {
        GRANDCHILD_COUNT - self.count_free_grandchildren()
    }

    pub fn find_slot_by_name(&self, name: &str) -> Option<&ValenceSlot> {
        self.slots().find(|s| s.name() == name)
    }

    /// `second_time_direction` is ignored for child slots
    pub fn find_slot_by_parameters(
        &self,
        slot_type: SlotType,
        time_direction: TimeDirection,
        control_type: ControlType,
        second_time_direction: Option<TimeDirection>,
    ) -> Option<&ValenceSlot> {
        let index = self.slot_index(slot_type, time_direction, control_type, second_time_direction)?;
        Some(match slot_type {
            SlotType::Child => &self.children[index],
            SlotType::Grandchild => &self.grandchildren[index],
        })
    }

    fn find_slot_mut(
        &mut self,
        slot_type: SlotType,
        time_direction: TimeDirection,
        control_type: ControlType,
        second_time_direction: Option<TimeDirection>,
    ) -> Option<&mut ValenceSlot> {
        let index = self.slot_index(slot_type, time_direction, control_type, second_time_direction)?;
        Some(match slot_type {
            SlotType::Child => &mut self.children[index],
            SlotType::Grandchild => &mut self.grandchildren[index],
        })
    }

    fn slot_index(
        &self,
        slot_type: SlotType,
        time_direction: TimeDirection,
        control_type: ControlType,
        second_time_direction: Option<TimeDirection>,
    ) -> Option<usize> {
        match slot_type {
            SlotType::Child => self
                .children
                .iter()
                .position(|s| s.time_direction == time_direction && s.control_type == control_type),
            SlotType::Grandchild => {
                let second = second_time_direction?;
                self.grandchildren.iter().position(|s| {
                    s.time_direction == time_direction
                        && s.control_type == control_type
                        && s.second_time_direction == Some(second)
                })
            }
        }
    }

    /// Multi-line text report
    pub fn summary(&self) -> String {
        let mut out = format!("Spore {} valence\n", self.spore_id);
        out.push_str(&format!(
            "  children ({} occupied, {} free):\n",
            self.count_occupied_children(),
            self.count_free_children()
        ));
        for slot in &self.children {
            out.push_str(&format!("    {}\n", slot));
        }
        out.push_str(&format!(
            "  grandchildren ({} occupied, {} free):\n",
            self.count_occupied_grandchildren(),
            self.count_free_grandchildren()
        ));
        for slot in &self.grandchildren {
            out.push_str(&format!("    {}\n", slot));
        }
        out
    }
}

/// Aggregate occupancy over a whole graph
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphSummary {
    pub total_spores: usize,
    pub occupied_children: usize,
    pub occupied_grandchildren: usize,
    pub free_children: usize,
    pub free_grandchildren: usize,
    pub fully_occupied: Vec<SporeId>,
    pub fully_free: Vec<SporeId>,
    pub partially_occupied: Vec<SporeId>,
}

/// One step away from a spore along a real edge
#[derive(Debug, Clone, Copy)]
struct Hop {
    target: SporeId,
    dt: f64,
    control: f64,
}

/// Reads valences off a `SporeGraph`, caching them per graph generation
#[derive(Debug, Default)]
pub struct ValenceAnalyzer {
    cache: BTreeMap<SporeId, (u64, SporeValence)>,
}

impl ValenceAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Valence of `id`; reuses the cached entry while the graph is unchanged
    pub fn analyze_spore_valence(
        &mut self,
        graph: &SporeGraph,
        id: SporeId,
    ) -> Result<&SporeValence, GraphError> {
        if !graph.contains(id) {
            self.cache.remove(&id);
            return Err(GraphError::UnknownSpore(id));
        }
        let generation = graph.generation();
        let fresh = matches!(self.cache.get(&id), Some((g, _)) if *g == generation);
        if !fresh {
            self.cache.insert(id, (generation, compute_valence(graph, id)));
        }
        self.cache
            .get(&id)
            .map(|(_, v)| v)
            .ok_or(GraphError::UnknownSpore(id))
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
        log::debug!("Valence cache cleared");
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Drop the cache and analyse every spore in the graph
    pub fn update_from_graph(&mut self, graph: &SporeGraph) {
        self.clear_cache();
        let generation = graph.generation();
        for id in graph.spore_ids() {
            self.cache.insert(id, (generation, compute_valence(graph, id)));
        }
        log::info!("Valence updated for {} spores", self.cache.len());
    }

    /// Current valence of every spore, by id
    pub fn all_valences(&mut self, graph: &SporeGraph) -> BTreeMap<SporeId, SporeValence> {
        let generation = graph.generation();
        self.cache.retain(|id, _| graph.contains(*id));
        for id in graph.spore_ids() {
            let fresh = matches!(self.cache.get(&id), Some((g, _)) if *g == generation);
            if !fresh {
                self.cache.insert(id, (generation, compute_valence(graph, id)));
            }
        }
        self.cache
            .iter()
            .map(|(id, (_, v))| (*id, v.clone()))
            .collect()
    }

    pub fn graph_summary(&mut self, graph: &SporeGraph) -> GraphSummary {
        let mut summary = GraphSummary::default();
        for (id, v) in self.all_valences(graph) {
            summary.total_spores += 1;
            summary.occupied_children += v.count_occupied_children();
            summary.occupied_grandchildren += v.count_occupied_grandchildren();
            summary.free_children += v.count_free_children();
            summary.free_grandchildren += v.count_free_grandchildren();
            let occupied = v.occupied_slots().len();
            if occupied == v.total_slots() {
                summary.fully_occupied.push(id);
            } else if occupied == 0 {
                summary.fully_free.push(id);
            } else {
                summary.partially_occupied.push(id);
            }
        }
        summary
    }
}

/// Real edges around `id`, ascending by neighbour id. Outgoing edges are taken
/// as stored, incoming ones walked backwards (time negated, control kept); an
/// outgoing hop precedes an incoming one to the same neighbour.
fn direct_hops(graph: &SporeGraph, id: SporeId) -> Vec<Hop> {
    let outgoing = graph
        .children(id)
        .into_iter()
        .filter(|e| e.is_real())
        .map(|e| Hop {
            target: e.child,
            dt: e.dt,
            control: e.control,
        });
    let incoming = graph
        .parents(id)
        .into_iter()
        .filter(|e| e.is_real())
        .map(|e| Hop {
            target: e.parent,
            dt: -e.dt,
            control: e.control,
        });
    let mut hops: Vec<Hop> = outgoing.chain(incoming).collect();
    hops.sort_by_key(|h| h.target);
    hops
}

fn compute_valence(graph: &SporeGraph, id: SporeId) -> SporeValence {
    let mut valence = SporeValence::new(id);
    let first_hops = direct_hops(graph, id);

    for hop in &first_hops {
        let Some(control_type) = ControlType::from_control(hop.control) else {
            continue;
        };
        let direction = TimeDirection::from_dt(hop.dt);
        if let Some(slot) = valence.find_slot_mut(SlotType::Child, direction, control_type, None)
            && !slot.occupied
        {
            slot.occupy(hop.target, vec![hop.dt]);
        }
    }

    for first in &first_hops {
        let Some(first_type) = ControlType::from_control(first.control) else {
            continue;
        };
        for second in direct_hops(graph, first.target) {
            if second.target == id || second.target == first.target {
                continue;
            }
            if ControlType::from_control(second.control) != Some(first_type.inverse()) {
                continue;
            }
            if let Some(slot) = valence.find_slot_mut(
                SlotType::Grandchild,
                TimeDirection::from_dt(first.dt),
                first_type,
                Some(TimeDirection::from_dt(second.dt)),
            ) && !slot.occupied
            {
                slot.occupy(second.target, vec![first.dt, second.dt]);
            }
        }
    }

    log::debug!(
        "Spore {} valence: {} children, {} grandchildren occupied",
        id,
        valence.count_occupied_children(),
        valence.count_occupied_grandchildren()
    );
    valence
}
