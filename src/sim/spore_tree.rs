//! Spore tree: four children and eight grandchildren around a root
//!
//! Children take `(±u_max, ±dt)`; every child spawns two grandchildren with
//! the reversed control, one forward and one backward in time. Grandchildren
//! of different parents are later paired up so that each pair meets.

use std::collections::BTreeMap;

use glam::DVec2;
use serde::Serialize;

use super::pendulum::PendulumSystem;
use super::valence::{ControlType, SporeValence, TimeDirection, slot_name};
use crate::consts::{CHILD_COUNT, GRANDCHILD_COUNT, VALENCE_SLOT_COUNT};
use crate::error::TreeError;
use crate::phase_angle;
use crate::settings::TreeSettings;

/// Child layout: (name, control type, dt sign)
const CHILD_LAYOUT: [(&str, ControlType, f64); CHILD_COUNT] = [
    ("forw_max", ControlType::Max, 1.0),
    ("back_max", ControlType::Max, -1.0),
    ("forw_min", ControlType::Min, 1.0),
    ("back_min", ControlType::Min, -1.0),
];

/// Grandchild dt signs by local index
const GRANDCHILD_SIGNS: [f64; 2] = [1.0, -1.0];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Child {
    pub index: usize,
    pub name: &'static str,
    pub control_type: ControlType,
    pub control: f64,
    /// Signed step from the root
    pub dt: f64,
    pub position: DVec2,
}

impl Child {
    pub fn time_direction(&self) -> TimeDirection {
        TimeDirection::from_dt(self.dt)
    }

    /// Matching child valence slot name
    pub fn slot_name(&self) -> String {
        slot_name(self.time_direction(), self.control_type, None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Grandchild {
    /// Index in the original 8-grandchild layout (`parent * 2 + local`)
    pub global_idx: usize,
    pub parent_idx: usize,
    pub local_idx: usize,
    pub control: f64,
    /// Signed step from the parent
    pub dt: f64,
    pub position: DVec2,
    /// The two grandchildren this one replaced, when merged
    pub merged_from: Option<[MergeSource; 2]>,
}

impl Grandchild {
    /// Every (parent, control, signed dt) step that reaches this grandchild
    pub fn sources(&self) -> Vec<MergeSource> {
        match self.merged_from {
            Some(sources) => sources.to_vec(),
            None => vec![MergeSource {
                global_idx: self.global_idx,
                parent_idx: self.parent_idx,
                control: self.control,
                dt: self.dt,
            }],
        }
    }
}

/// One pre-merge grandchild step, signs intact
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MergeSource {
    pub global_idx: usize,
    pub parent_idx: usize,
    pub control: f64,
    pub dt: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedPair {
    pub kept: usize,
    pub removed: usize,
    pub distance: f64,
    pub position: DVec2,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeReport {
    pub merged_pairs: Vec<MergedPair>,
    pub remaining: usize,
}

impl MergeReport {
    pub fn total_merged(&self) -> usize {
        self.merged_pairs.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SporeTree {
    root: DVec2,
    children: [Child; CHILD_COUNT],
    grandchildren: Vec<Grandchild>,
    /// Positions into `grandchildren`, angle-sorted and pair-checked
    sorted: Option<Vec<usize>>,
    pairing_candidates: BTreeMap<usize, Vec<usize>>,
    merged: bool,
}

impl SporeTree {
    /// Build from explicit magnitudes; the layout fixes every sign
    pub fn new(
        pendulum: &PendulumSystem,
        root: DVec2,
        dt_children: [f64; CHILD_COUNT],
        dt_grandchildren: [f64; GRANDCHILD_COUNT],
    ) -> Result<Self, TreeError> {
        check_finite(&dt_children, 0)?;
        check_finite(&dt_grandchildren, CHILD_COUNT)?;

        let u_max = pendulum.get_control_bounds().1;
        let mut children = Vec::with_capacity(CHILD_COUNT);
        for (index, &(name, control_type, sign)) in CHILD_LAYOUT.iter().enumerate() {
            let control = control_type.sign() * u_max;
            let dt = dt_children[index].abs() * sign;
            children.push(Child {
                index,
                name,
                control_type,
                control,
                dt,
                position: pendulum.rk45_step(root, control, dt)?,
            });
        }
        let children: [Child; CHILD_COUNT] = children
            .try_into()
            .map_err(|v: Vec<Child>| TreeError::WrongLength {
                expected: CHILD_COUNT,
                found: v.len(),
            })?;

        let mut grandchildren = Vec::with_capacity(GRANDCHILD_COUNT);
        for parent in &children {
            for (local_idx, sign) in GRANDCHILD_SIGNS.iter().enumerate() {
                let global_idx = parent.index * 2 + local_idx;
                let control = -parent.control;
                let dt = dt_grandchildren[global_idx].abs() * sign;
                grandchildren.push(Grandchild {
                    global_idx,
                    parent_idx: parent.index,
                    local_idx,
                    control,
                    dt,
                    position: pendulum.rk45_step(parent.position, control, dt)?,
                    merged_from: None,
                });
            }
        }

        let mut tree = Self {
            root,
            children,
            grandchildren,
            sorted: None,
            pairing_candidates: BTreeMap::new(),
            merged: false,
        };
        tree.rebuild_candidates();
        log::debug!(
            "Spore tree at {:?}: children dt {:?}, grandchildren dt {:?}",
            root,
            tree.children.iter().map(|c| c.dt).collect::<Vec<_>>(),
            tree.grandchildren.iter().map(|g| g.dt).collect::<Vec<_>>()
        );
        Ok(tree)
    }

    /// Uniform tree: children at `dt_base`, grandchildren at `dt_base * factor`
    pub fn auto(
        pendulum: &PendulumSystem,
        root: DVec2,
        dt_base: f64,
        factor: f64,
    ) -> Result<Self, TreeError> {
        Self::new(
            pendulum,
            root,
            [dt_base; CHILD_COUNT],
            [dt_base * factor; GRANDCHILD_COUNT],
        )
    }

    pub fn from_settings(
        pendulum: &PendulumSystem,
        root: DVec2,
        settings: &TreeSettings,
    ) -> Result<Self, TreeError> {
        Self::auto(pendulum, root, settings.dt_base, settings.dt_grandchildren_factor)
    }

    /// Build from a 12-entry vector (4 children then 8 grandchildren)
    pub fn from_dt_vector(
        pendulum: &PendulumSystem,
        root: DVec2,
        dt_vector: &[f64],
    ) -> Result<Self, TreeError> {
        let (children, grandchildren) = split_dt_vector(dt_vector)?;
        Self::new(pendulum, root, children, grandchildren)
    }

    pub fn root(&self) -> DVec2 {
        self.root
    }

    pub fn children(&self) -> &[Child; CHILD_COUNT] {
        &self.children
    }

    pub fn grandchildren(&self) -> &[Grandchild] {
        &self.grandchildren
    }

    pub fn is_merged(&self) -> bool {
        self.merged
    }

    /// Grandchild global index -> global indices of grandchildren with another parent
    pub fn pairing_candidates(&self) -> &BTreeMap<usize, Vec<usize>> {
        &self.pairing_candidates
    }

    /// Valence slot name of a grandchild (first hop from its parent)
    pub fn grandchild_slot_name(&self, gc: &Grandchild) -> String {
        let parent = &self.children[gc.parent_idx];
        slot_name(
            parent.time_direction(),
            parent.control_type,
            Some(TimeDirection::from_dt(gc.dt)),
        )
    }

    /// Signed dts: 4 children then 8 grandchildren
    pub fn dt_vector(&self) -> Result<[f64; VALENCE_SLOT_COUNT], TreeError> {
        self.require_full()?;
        let mut out = [0.0; VALENCE_SLOT_COUNT];
        for (slot, child) in out.iter_mut().zip(&self.children) {
            *slot = child.dt;
        }
        for (slot, gc) in out[CHILD_COUNT..].iter_mut().zip(&self.grandchildren) {
            *slot = gc.dt;
        }
        Ok(out)
    }

    /// Replace step magnitudes (signs stay) and recompute every position
    pub fn update_positions(
        &mut self,
        pendulum: &PendulumSystem,
        dt_children: [f64; CHILD_COUNT],
        dt_grandchildren: [f64; GRANDCHILD_COUNT],
    ) -> Result<(), TreeError> {
        self.require_full()?;
        check_finite(&dt_children, 0)?;
        check_finite(&dt_grandchildren, CHILD_COUNT)?;
        for (child, dt) in self.children.iter_mut().zip(dt_children) {
            child.dt = dt.abs() * crate::time_sign(child.dt);
        }
        for (gc, dt) in self.grandchildren.iter_mut().zip(dt_grandchildren) {
            gc.dt = dt.abs() * crate::time_sign(gc.dt);
        }
        self.recompute(pendulum)
    }

    /// Take the dt of every occupied, fixed valence slot whose name matches a
    /// child or grandchild. Returns how many steps were replaced.
    pub fn apply_fixed_dt(
        &mut self,
        pendulum: &PendulumSystem,
        valence: &SporeValence,
    ) -> Result<usize, TreeError> {
        self.require_full()?;
        let mut replaced = 0;
        for child in self.children.iter_mut() {
            if let Some(slot) = valence.find_slot_by_name(&child.slot_name())
                && slot.occupied
                && slot.is_fixed
                && let Some(&dt) = slot.dt_sequence.first()
            {
                child.dt = dt;
                replaced += 1;
            }
        }
        for i in 0..self.grandchildren.len() {
            let name = self.grandchild_slot_name(&self.grandchildren[i]);
            if let Some(slot) = valence.find_slot_by_name(&name)
                && slot.occupied
                && slot.is_fixed
                && let Some(&dt) = slot.dt_sequence.get(1)
            {
                self.grandchildren[i].dt = dt;
                replaced += 1;
            }
        }
        if replaced > 0 {
            log::info!("Applied {} fixed dt values from valence", replaced);
            self.recompute(pendulum)?;
        }
        Ok(replaced)
    }

    /// Sort grandchildren by angle from the root (descending) and rotate so
    /// that consecutive pairs `(0,1) (2,3) (4,5) (6,7)` have different parents
    pub fn sort_and_pair_grandchildren(&mut self) -> Result<&[usize], TreeError> {
        self.require_full()?;
        let angles: Vec<f64> = self
            .grandchildren
            .iter()
            .map(|gc| phase_angle(self.root, gc.position))
            .collect();
        let mut order: Vec<usize> = (0..self.grandchildren.len()).collect();
        order.sort_by(|&a, &b| angles[b].total_cmp(&angles[a]));

        if let Some(first) = order
            .iter()
            .position(|&i| self.grandchildren[i].parent_idx == 0)
        {
            order.rotate_left(first);
        }
        if order.len() >= 2 && self.grandchildren[order[1]].parent_idx == 0 {
            order.rotate_right(1);
        }

        for (pair, chunk) in order.chunks_exact(2).enumerate() {
            let parent = self.grandchildren[chunk[0]].parent_idx;
            if parent == self.grandchildren[chunk[1]].parent_idx {
                return Err(TreeError::SortedPairSameParent { pair, parent });
            }
        }

        log::debug!("Sorted grandchildren: {:?}", order);
        self.sorted = Some(order);
        Ok(self.sorted.as_deref().unwrap_or(&[]))
    }

    /// Sorted order from the last successful `sort_and_pair_grandchildren`
    pub fn sorted_grandchildren(&self) -> Option<&[usize]> {
        self.sorted.as_deref()
    }

    /// Midpoints of the four sorted pairs
    pub fn mean_points(&self) -> Option<Vec<DVec2>> {
        let order = self.sorted.as_ref()?;
        Some(
            order
                .chunks_exact(2)
                .map(|c| (self.grandchildren[c[0]].position + self.grandchildren[c[1]].position) * 0.5)
                .collect(),
        )
    }

    /// Greedily merge grandchildren closer than `threshold` into their midpoint.
    /// The merged grandchild keeps the first one's step; both signed steps are
    /// kept in `merged_from`. A tree is merged at most once.
    pub fn merge_close_grandchildren(&mut self, threshold: f64) -> MergeReport {
        if self.merged {
            log::warn!("Grandchildren already merged, skipping");
            return MergeReport {
                merged_pairs: Vec::new(),
                remaining: self.grandchildren.len(),
            };
        }

        let n = self.grandchildren.len();
        let mut removed = vec![false; n];
        let mut merged_pairs = Vec::new();
        for i in 0..n {
            if removed[i] {
                continue;
            }
            for j in (i + 1)..n {
                if removed[j] {
                    continue;
                }
                let (a, b) = (&self.grandchildren[i], &self.grandchildren[j]);
                let distance = a.position.distance(b.position);
                if distance < threshold {
                    let position = (a.position + b.position) * 0.5;
                    let source = |g: &Grandchild| MergeSource {
                        global_idx: g.global_idx,
                        parent_idx: g.parent_idx,
                        control: g.control,
                        dt: g.dt,
                    };
                    let merged = Grandchild {
                        global_idx: a.global_idx,
                        parent_idx: a.parent_idx,
                        local_idx: a.local_idx,
                        control: a.control,
                        dt: a.dt,
                        position,
                        merged_from: Some([source(a), source(b)]),
                    };
                    merged_pairs.push(MergedPair {
                        kept: a.global_idx,
                        removed: b.global_idx,
                        distance,
                        position,
                    });
                    self.grandchildren[i] = merged;
                    removed[j] = true;
                    break;
                }
            }
        }

        if !merged_pairs.is_empty() {
            let mut keep = removed.iter().map(|r| !r);
            self.grandchildren.retain(|_| keep.next().unwrap_or(true));
            self.merged = true;
            self.sorted = None;
            self.rebuild_candidates();
            log::info!(
                "Merged {} grandchild pairs, {} grandchildren remain",
                merged_pairs.len(),
                self.grandchildren.len()
            );
        }

        MergeReport {
            merged_pairs,
            remaining: self.grandchildren.len(),
        }
    }

    fn recompute(&mut self, pendulum: &PendulumSystem) -> Result<(), TreeError> {
        for child in self.children.iter_mut() {
            child.position = pendulum.rk45_step(self.root, child.control, child.dt)?;
        }
        for gc in self.grandchildren.iter_mut() {
            let parent = &self.children[gc.parent_idx];
            gc.position = pendulum.rk45_step(parent.position, gc.control, gc.dt)?;
        }
        self.sorted = None;
        Ok(())
    }

    fn rebuild_candidates(&mut self) {
        self.pairing_candidates = self
            .grandchildren
            .iter()
            .map(|gc| {
                let mut others: Vec<usize> = self
                    .grandchildren
                    .iter()
                    .filter(|o| o.parent_idx != gc.parent_idx)
                    .map(|o| o.global_idx)
                    .collect();
                others.sort_unstable();
                (gc.global_idx, others)
            })
            .collect();
    }

    fn require_full(&self) -> Result<(), TreeError> {
        if self.grandchildren.len() == GRANDCHILD_COUNT {
            Ok(())
        } else {
            Err(TreeError::WrongLength {
                expected: GRANDCHILD_COUNT,
                found: self.grandchildren.len(),
            })
        }
    }
}

/// Split a 12-entry dt vector into children and grandchildren parts
pub fn split_dt_vector(
    dt_vector: &[f64],
) -> Result<([f64; CHILD_COUNT], [f64; GRANDCHILD_COUNT]), TreeError> {
    if dt_vector.len() != VALENCE_SLOT_COUNT {
        return Err(TreeError::WrongLength {
            expected: VALENCE_SLOT_COUNT,
            found: dt_vector.len(),
        });
    }
    let mut children = [0.0; CHILD_COUNT];
    let mut grandchildren = [0.0; GRANDCHILD_COUNT];
    children.copy_from_slice(&dt_vector[..CHILD_COUNT]);
    grandchildren.copy_from_slice(&dt_vector[CHILD_COUNT..]);
    Ok((children, grandchildren))
}

fn check_finite(values: &[f64], offset: usize) -> Result<(), TreeError> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(i) => Err(TreeError::NonFiniteDt {
            index: offset + i,
            value: values[i],
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::PendulumParams;

    fn pendulum() -> PendulumSystem {
        PendulumSystem::new(PendulumParams::default()).unwrap()
    }

    fn tree() -> SporeTree {
        SporeTree::auto(&pendulum(), DVec2::new(0.5, 0.0), 0.05, 0.2).unwrap()
    }

    #[test]
    fn test_children_layout() {
        let t = tree();
        let names: Vec<_> = t.children().iter().map(|c| c.name).collect();
        assert_eq!(names, ["forw_max", "back_max", "forw_min", "back_min"]);
        let controls: Vec<_> = t.children().iter().map(|c| c.control).collect();
        assert_eq!(controls, [1.0, 1.0, -1.0, -1.0]);
        let dts: Vec<_> = t.children().iter().map(|c| c.dt).collect();
        assert_eq!(dts, [0.05, -0.05, 0.05, -0.05]);
        let slots: Vec<_> = t.children().iter().map(|c| c.slot_name()).collect();
        assert_eq!(slots, ["forward_max", "backward_max", "forward_min", "backward_min"]);
    }

    #[test]
    fn test_grandchildren_reverse_control_and_alternate_time() {
        let t = tree();
        assert_eq!(t.grandchildren().len(), 8);
        for (k, gc) in t.grandchildren().iter().enumerate() {
            let parent = &t.children()[gc.parent_idx];
            assert_eq!(gc.global_idx, k);
            assert_eq!(gc.parent_idx, k / 2);
            assert_eq!(gc.control, -parent.control);
            let expected = if k % 2 == 0 { 0.01 } else { -0.01 };
            assert!((gc.dt - expected).abs() < 1e-15);
        }
        assert_eq!(t.grandchild_slot_name(&t.grandchildren()[1]), "forward_max_backward_min");
        assert_eq!(t.grandchild_slot_name(&t.grandchildren()[6]), "backward_min_forward_max");
    }

    #[test]
    fn test_pairing_candidates_exclude_siblings() {
        let t = tree();
        assert_eq!(t.pairing_candidates()[&0], vec![2, 3, 4, 5, 6, 7]);
        assert_eq!(t.pairing_candidates()[&5], vec![0, 1, 2, 3, 6, 7]);
    }

    #[test]
    fn test_sort_and_pair_invariants() {
        let mut t = tree();
        let order = t.sort_and_pair_grandchildren().unwrap().to_vec();
        let mut seen = order.clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
        for pair in order.chunks_exact(2) {
            assert_ne!(t.grandchildren()[pair[0]].parent_idx, t.grandchildren()[pair[1]].parent_idx);
        }
        let means = t.mean_points().unwrap();
        assert_eq!(means.len(), 4);
    }

    #[test]
    fn test_mean_points_need_sorting() {
        assert!(tree().mean_points().is_none());
    }

    #[test]
    fn test_dt_vector_round_trip() {
        let p = pendulum();
        let t = tree();
        let v = t.dt_vector().unwrap();
        assert_eq!(&v[..4], &[0.05, -0.05, 0.05, -0.05]);
        let rebuilt = SporeTree::from_dt_vector(&p, t.root(), &v).unwrap();
        assert_eq!(rebuilt.children(), t.children());
        assert!(matches!(
            SporeTree::from_dt_vector(&p, t.root(), &v[..11]),
            Err(TreeError::WrongLength { expected: 12, found: 11 })
        ));
    }

    #[test]
    fn test_update_positions_keeps_signs() {
        let p = pendulum();
        let mut t = tree();
        let before = t.children()[1].position;
        t.update_positions(&p, [0.1; 4], [0.02; 8]).unwrap();
        assert_eq!(t.children()[1].dt, -0.1);
        assert_eq!(t.grandchildren()[3].dt, -0.02);
        assert_ne!(t.children()[1].position, before);
        assert_eq!(t.children()[1].position, p.rk45_step(t.root(), 1.0, -0.1).unwrap());
    }

    #[test]
    fn test_non_finite_dt_rejected() {
        let mut dt = [0.01; 8];
        dt[2] = f64::INFINITY;
        assert!(matches!(
            SporeTree::new(&pendulum(), DVec2::ZERO, [0.05; 4], dt),
            Err(TreeError::NonFiniteDt { index: 6, .. })
        ));
    }

    #[test]
    fn test_merge_close_grandchildren() {
        // Zero control: parent 0's backward grandchild returns to the root,
        // as does parent 1's forward grandchild
        let p = PendulumSystem::new(PendulumParams {
            max_control: 0.0,
            ..PendulumParams::default()
        })
        .unwrap();
        let mut t = SporeTree::auto(&p, DVec2::new(0.3, 0.1), 0.05, 1.0).unwrap();
        let report = t.merge_close_grandchildren(1e-6);
        assert!(report.total_merged() >= 1);
        assert_eq!(report.remaining, 8 - report.total_merged());
        assert!(t.is_merged());
        let merged = t
            .grandchildren()
            .iter()
            .find(|g| g.merged_from.is_some())
            .unwrap();
        let sources = merged.sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(merged.dt, sources[0].dt);
        for source in &sources {
            // Each signed source step still lands on the merged point
            let parent = t.children()[source.parent_idx].position;
            let reached = p.rk45_step(parent, source.control, source.dt).unwrap();
            assert!(reached.distance(merged.position) < 1e-6);
        }
        assert!(t.dt_vector().is_err());

        let again = t.merge_close_grandchildren(1.0);
        assert_eq!(again.total_merged(), 0);
    }

    #[test]
    fn test_unmerged_grandchild_is_its_own_source() {
        let t = tree();
        let gc = &t.grandchildren()[3];
        assert_eq!(
            gc.sources(),
            vec![MergeSource {
                global_idx: 3,
                parent_idx: 1,
                control: gc.control,
                dt: gc.dt,
            }]
        );
    }

    #[test]
    fn test_merge_nothing_close() {
        let mut t = tree();
        let report = t.merge_close_grandchildren(1e-12);
        assert_eq!(report.total_merged(), 0);
        assert_eq!(report.remaining, 8);
        assert!(!t.is_merged());
    }
}
