//! Grandchild meeting search
//!
//! Two grandchildren of different parents "meet" when, stepping from their
//! parents with their own controls for suitable durations, they land on the
//! same phase point. For each cross-parent candidate pair the meeting times
//! are found by a coarse grid followed by Newton iterations on
//! `φ_i(s_i·t_i) - φ_j(s_j·t_j) = 0`; each grandchild keeps its time sign
//! `s`. A minimum-distance perfect matching then picks
//! which pairs to use.

use glam::{DMat2, DVec2};
use serde::Serialize;

use super::pendulum::PendulumSystem;
use super::spore_tree::SporeTree;
use crate::consts::{CHILD_COUNT, VALENCE_SLOT_COUNT};
use crate::error::PairingError;
use crate::settings::PairingSettings;
use crate::time_sign;

/// Largest grandchild count the bitmask matcher accepts
const MAX_MATCHING_NODES: usize = 16;
/// Backtracking halvings per Newton iteration
const NEWTON_BACKTRACK: usize = 8;

/// Where and when a grandchild pair meets
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MeetingInfo {
    /// Signed step of the first grandchild from its parent
    pub time_gc: f64,
    /// Signed step of the partner from its parent
    pub time_partner: f64,
    /// Remaining gap between the two endpoints
    pub distance: f64,
    pub meeting_point: DVec2,
}

/// Two grandchildren (global indices) paired by the matching
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GrandchildPair {
    pub index_i: usize,
    pub index_j: usize,
    pub meeting: MeetingInfo,
}

/// 12-entry dt vector after pairing
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PairedDtVector {
    pub dt_vector: [f64; VALENCE_SLOT_COUNT],
    /// False when at least one pair failed to meet and standard dts were kept
    pub applied: bool,
    pub max_distance: f64,
}

/// Fixed data of one grandchild for the search
#[derive(Debug, Clone, Copy)]
struct Mover {
    global_idx: usize,
    parent_idx: usize,
    start: DVec2,
    control: f64,
    sign: f64,
}

/// Pair every grandchild with exactly one grandchild of another parent so the
/// summed meeting distance is minimal. The tree is only read.
pub fn find_optimal_pairs(
    tree: &SporeTree,
    pendulum: &PendulumSystem,
    settings: &PairingSettings,
) -> Result<Vec<GrandchildPair>, PairingError> {
    let movers: Vec<Mover> = tree
        .grandchildren()
        .iter()
        .map(|gc| Mover {
            global_idx: gc.global_idx,
            parent_idx: gc.parent_idx,
            start: tree.children()[gc.parent_idx].position,
            control: gc.control,
            sign: time_sign(gc.dt),
        })
        .collect();
    let n = movers.len();
    if n % 2 != 0 || n > MAX_MATCHING_NODES {
        return Err(PairingError::NoMatching { grandchildren: n });
    }

    let grid = time_grid(settings);
    let mut samples = Vec::with_capacity(n);
    for m in &movers {
        let row = grid
            .iter()
            .map(|&t| pendulum.rk45_step(m.start, m.control, m.sign * t))
            .collect::<Result<Vec<_>, _>>()?;
        samples.push(row);
    }

    let mut meetings: Vec<Vec<Option<MeetingInfo>>> = vec![vec![None; n]; n];
    for i in 0..n {
        let candidates = tree
            .pairing_candidates()
            .get(&movers[i].global_idx)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        for j in (i + 1)..n {
            if !candidates.contains(&movers[j].global_idx) {
                continue;
            }
            let meeting = find_meeting(
                pendulum,
                &movers[i],
                &movers[j],
                &grid,
                &samples[i],
                &samples[j],
                settings,
            )?;
            log::debug!(
                "Meeting {} <-> {}: t=({:+.6}, {:+.6}) distance {:.3e}",
                movers[i].global_idx,
                movers[j].global_idx,
                meeting.time_gc,
                meeting.time_partner,
                meeting.distance
            );
            meetings[i][j] = Some(meeting);
        }
    }

    let parents: Vec<usize> = movers.iter().map(|m| m.parent_idx).collect();
    let matching = perfect_matching(&parents, |i, j| meetings[i][j].map(|m| m.distance))
        .ok_or(PairingError::NoMatching { grandchildren: n })?;

    let mut pairs: Vec<GrandchildPair> = Vec::with_capacity(matching.len());
    for (i, j) in matching {
        if let Some(meeting) = meetings[i][j] {
            pairs.push(GrandchildPair {
                index_i: movers[i].global_idx,
                index_j: movers[j].global_idx,
                meeting,
            });
        }
    }

    if pairs.len() != n / 2 {
        return Err(PairingError::PairCount {
            expected: n / 2,
            found: pairs.len(),
        });
    }
    log::info!(
        "Paired {} grandchildren into {} pairs, worst gap {:.3e}",
        n,
        pairs.len(),
        pairs.iter().map(|p| p.meeting.distance).fold(0.0, f64::max)
    );
    Ok(pairs)
}

/// Children dts are copied as they are. Grandchild dts become the meeting
/// times only if every pair met within `meeting_tolerance`; otherwise all of
/// them stay standard.
pub fn apply_pairs(
    tree: &SporeTree,
    pairs: &[GrandchildPair],
    settings: &PairingSettings,
) -> Result<PairedDtVector, PairingError> {
    let mut dt_vector = tree.dt_vector()?;
    let expected = tree.grandchildren().len() / 2;
    if pairs.len() != expected {
        return Err(PairingError::PairCount {
            expected,
            found: pairs.len(),
        });
    }

    let max_distance = pairs
        .iter()
        .map(|p| p.meeting.distance)
        .fold(0.0, f64::max);
    let applied = pairs
        .iter()
        .all(|p| p.meeting.distance < settings.meeting_tolerance);

    if applied {
        for pair in pairs {
            dt_vector[CHILD_COUNT + pair.index_i] = pair.meeting.time_gc;
            dt_vector[CHILD_COUNT + pair.index_j] = pair.meeting.time_partner;
        }
    } else {
        log::warn!(
            "Meeting search did not converge (worst gap {:.3e} >= {}), keeping standard grandchild dt",
            max_distance,
            settings.meeting_tolerance
        );
    }

    Ok(PairedDtVector {
        dt_vector,
        applied,
        max_distance,
    })
}

/// `find_optimal_pairs` followed by `apply_pairs`
pub fn pair_tree(
    tree: &SporeTree,
    pendulum: &PendulumSystem,
    settings: &PairingSettings,
) -> Result<(Vec<GrandchildPair>, PairedDtVector), PairingError> {
    let pairs = find_optimal_pairs(tree, pendulum, settings)?;
    let outcome = apply_pairs(tree, &pairs, settings)?;
    Ok((pairs, outcome))
}

fn time_grid(settings: &PairingSettings) -> Vec<f64> {
    let n = settings.grid_points.max(2);
    let step = (settings.max_time - settings.min_time) / (n - 1) as f64;
    (0..n).map(|k| settings.min_time + step * k as f64).collect()
}

fn find_meeting(
    pendulum: &PendulumSystem,
    a: &Mover,
    b: &Mover,
    grid: &[f64],
    samples_a: &[DVec2],
    samples_b: &[DVec2],
    settings: &PairingSettings,
) -> Result<MeetingInfo, PairingError> {
    // Coarse grid
    let mut best = (0, 0, f64::INFINITY);
    for (ka, pa) in samples_a.iter().enumerate() {
        for (kb, pb) in samples_b.iter().enumerate() {
            let d = pa.distance(*pb);
            if d < best.2 {
                best = (ka, kb, d);
            }
        }
    }
    let mut t = DVec2::new(grid[best.0], grid[best.1]);
    let mut pa = samples_a[best.0];
    let mut pb = samples_b[best.1];
    let mut residual = pa - pb;

    // Newton on the 2x2 system, clamped to the box, with backtracking
    let lo = DVec2::splat(settings.min_time);
    let hi = DVec2::splat(settings.max_time);
    for _ in 0..settings.max_iterations {
        if residual.length() < settings.residual_tolerance {
            break;
        }
        let jacobian = DMat2::from_cols(
            a.sign * pendulum.continuous_dynamics(pa, a.control),
            -b.sign * pendulum.continuous_dynamics(pb, b.control),
        );
        if jacobian.determinant().abs() < f64::EPSILON {
            break;
        }
        let step = jacobian.inverse() * -residual;

        let mut scale = 1.0;
        let mut improved = false;
        for _ in 0..NEWTON_BACKTRACK {
            let trial = (t + step * scale).clamp(lo, hi);
            let qa = pendulum.rk45_step(a.start, a.control, a.sign * trial.x)?;
            let qb = pendulum.rk45_step(b.start, b.control, b.sign * trial.y)?;
            let r = qa - qb;
            if r.length() < residual.length() {
                t = trial;
                pa = qa;
                pb = qb;
                residual = r;
                improved = true;
                break;
            }
            scale *= 0.5;
        }
        if !improved {
            break;
        }
    }

    Ok(MeetingInfo {
        time_gc: a.sign * t.x,
        time_partner: b.sign * t.y,
        distance: residual.length(),
        meeting_point: (pa + pb) * 0.5,
    })
}

/// Minimum-cost perfect matching over nodes `0..parents.len()`, pairing only
/// nodes with different parents that have a cost. Pairs come back as `(i, j)`
/// with `i < j`, ordered by `i`.
fn perfect_matching<F>(parents: &[usize], cost: F) -> Option<Vec<(usize, usize)>>
where
    F: Fn(usize, usize) -> Option<f64>,
{
    let n = parents.len();
    if n % 2 != 0 || n > MAX_MATCHING_NODES {
        return None;
    }
    let full = (1usize << n) - 1;
    let mut best = vec![f64::INFINITY; full + 1];
    let mut choice = vec![(0usize, 0usize); full + 1];
    best[0] = 0.0;

    for mask in 0..full {
        if !best[mask].is_finite() {
            continue;
        }
        // Always match the lowest free node next
        let i = (!mask).trailing_zeros() as usize;
        for j in (i + 1)..n {
            if mask & (1 << j) != 0 || parents[i] == parents[j] {
                continue;
            }
            let Some(c) = cost(i, j) else { continue };
            let next = mask | (1 << i) | (1 << j);
            let total = best[mask] + c;
            if total < best[next] {
                best[next] = total;
                choice[next] = (i, j);
            }
        }
    }

    if !best[full].is_finite() {
        return None;
    }
    let mut pairs = Vec::with_capacity(n / 2);
    let mut mask = full;
    while mask != 0 {
        let (i, j) = choice[mask];
        pairs.push((i, j));
        mask &= !((1 << i) | (1 << j));
    }
    pairs.sort_unstable();
    Some(pairs)
}
