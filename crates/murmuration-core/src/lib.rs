//! Parallel flocking core shared by the surrounding movement systems.
//!
//! One tick runs four phases over dense per-agent arrays, with a hard
//! barrier between each: hash positions into spatial cells, seed every
//! agent slot as a singleton cell, collapse co-celled agents into
//! representative aggregates with a thread-sharded merge, then steer every
//! agent from its cell's aggregate. The merge needs no locks: a cell hash
//! is pre-assigned to exactly one shard, so no two tasks ever touch the
//! same map entry or the same representative slot.

use glam::Vec3;
use murmuration_index::{CellGrid, CellHash, GridError, shard_for};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::marker::PhantomData;
use thiserror::Error;
use tracing::debug;

/// Batch granularity for the indexed parallel passes. Performance-only;
/// every pass is correct for any split.
const BATCH: usize = 4096;

/// Steering parameters, editable between ticks and snapshotted for the
/// duration of one `update` call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FlockConfig {
    /// Edge length of one spatial cell in world units.
    pub cell_radius: f32,
    /// Weight of the push away from crowded cell centroids.
    pub separation_weight: f32,
    /// Weight of the pull toward the cell's average heading.
    pub alignment_weight: f32,
    /// Weight of the pull toward the nearest target.
    pub target_weight: f32,
    /// Radius around an obstacle inside which avoidance overrides flocking.
    pub obstacle_aversion_distance: f32,
}

impl Default for FlockConfig {
    fn default() -> Self {
        Self {
            cell_radius: 1.0,
            separation_weight: 1.0,
            alignment_weight: 1.0,
            target_weight: 2.0,
            obstacle_aversion_distance: 5.0,
        }
    }
}

impl FlockConfig {
    /// Every field must be finite; range tuning is left to the caller.
    pub fn validate(&self) -> Result<(), FlockError> {
        let fields = [
            self.cell_radius,
            self.separation_weight,
            self.alignment_weight,
            self.target_weight,
            self.obstacle_aversion_distance,
        ];
        if fields.iter().all(|value| value.is_finite()) {
            Ok(())
        } else {
            Err(FlockError::InvalidConfig("parameters must be finite"))
        }
    }
}

/// Errors surfaced by the flocking update driver.
#[derive(Debug, Error)]
pub enum FlockError {
    /// Invalid numeric configuration or tick input.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The spatial grid rejected its configuration.
    #[error(transparent)]
    Grid(#[from] GridError),
    /// Nearest-target resolution indexes unconditionally into the list.
    #[error("target list must not be empty")]
    EmptyTargets,
    /// Nearest-obstacle resolution indexes unconditionally into the list.
    #[error("obstacle list must not be empty")]
    EmptyObstacles,
    /// The merge pass needs at least one shard.
    #[error("shard count must be at least one")]
    NoWorkerThreads,
    /// Position and heading columns must describe the same agents.
    #[error("column length mismatch: {positions} positions vs {headings} headings")]
    ColumnMismatch {
        /// Length of the position column.
        positions: usize,
        /// Length of the heading column.
        headings: usize,
    },
}

/// Index of and Euclidean distance to the closest point in `points`.
fn nearest(points: &[Vec3], position: Vec3) -> (usize, f32) {
    debug_assert!(!points.is_empty());
    let mut index = 0;
    let mut best = position.distance_squared(points[0]);
    for (candidate, point) in points.iter().enumerate().skip(1) {
        let distance = position.distance_squared(*point);
        if distance < best {
            best = distance;
            index = candidate;
        }
    }
    (index, best.sqrt())
}

/// New heading for one agent, blended from its cell aggregate.
///
/// Alignment and separation terms use zero-safe normalization so a term
/// that cancels exactly contributes nothing instead of poisoning the blend
/// with NaN. Inside the aversion radius the avoidance heading replaces the
/// blend outright. The result interpolates from the old heading at a rate
/// set by `delta_time` and is unit length except when every input cancels.
#[allow(clippy::too_many_arguments)]
fn steer(
    config: &FlockConfig,
    delta_time: f32,
    heading: Vec3,
    position: Vec3,
    member_count: u32,
    alignment_sum: Vec3,
    separation_sum: Vec3,
    obstacle_position: Vec3,
    obstacle_distance: f32,
    target_position: Vec3,
) -> Vec3 {
    let members = member_count as f32;
    let target_term = config.target_weight * (target_position - position).normalize_or_zero();
    let align_term =
        config.alignment_weight * (alignment_sum / members - heading).normalize_or_zero();
    let separate_term =
        config.separation_weight * (position * members - separation_sum).normalize_or_zero();
    let desired = (align_term + separate_term + target_term).normalize_or_zero();

    let away = (position - obstacle_position).normalize_or_zero();
    let avoidance = (obstacle_position + away * config.obstacle_aversion_distance) - position;
    let chosen = if obstacle_distance - config.obstacle_aversion_distance < 0.0 {
        avoidance
    } else {
        desired
    };

    (heading + delta_time * (chosen - heading)).normalize_or_zero()
}

/// Structure-of-arrays cell table, one slot per agent, rebuilt every tick.
///
/// A slot starts as its own singleton cell; the merge pass folds later
/// occurrences of a hash into the first one, leaving `representative`
/// chains of depth at most one. Nearest target/obstacle columns are only
/// meaningful for representative slots, where they are resolved exactly
/// once from the slot's pre-merge seed position. Later folds grow the
/// aggregate without recomputing them; that staleness is an accepted
/// eventual-accuracy trade-off, not an invariant violation.
#[derive(Debug, Default)]
pub struct CellTable {
    representative: Vec<u32>,
    hash: Vec<CellHash>,
    owner: Vec<u32>,
    alignment: Vec<Vec3>,
    separation: Vec<Vec3>,
    count: Vec<u32>,
    obstacle: Vec<u32>,
    obstacle_distance: Vec<f32>,
    target: Vec<u32>,
}

impl CellTable {
    fn resize(&mut self, agents: usize) {
        self.representative.resize(agents, 0);
        self.hash.resize(agents, 0);
        self.owner.resize(agents, 0);
        self.alignment.resize(agents, Vec3::ZERO);
        self.separation.resize(agents, Vec3::ZERO);
        self.count.resize(agents, 0);
        self.obstacle.resize(agents, 0);
        self.obstacle_distance.resize(agents, 0.0);
        self.target.resize(agents, 0);
    }

    /// Hash every position and pin its cell to a shard. The assignment is
    /// written once here and reused unmodified by the merge pass.
    fn assign_cells(&mut self, grid: &CellGrid, shard_count: usize, positions: &[Vec3]) {
        self.hash
            .par_iter_mut()
            .zip(self.owner.par_iter_mut())
            .zip(positions.par_iter())
            .with_min_len(BATCH)
            .for_each(|((hash, owner), position)| {
                let cell = grid.hash_position(*position);
                *hash = cell;
                *owner = shard_for(cell, shard_count) as u32;
            });
    }

    /// Seed every slot as a trivial singleton cell so the merge pass only
    /// ever grows an existing representative.
    fn seed_singletons(&mut self, positions: &[Vec3], headings: &[Vec3]) {
        self.alignment
            .par_iter_mut()
            .zip(headings.par_iter())
            .with_min_len(BATCH)
            .for_each(|(sum, heading)| *sum = *heading);
        self.separation
            .par_iter_mut()
            .zip(positions.par_iter())
            .with_min_len(BATCH)
            .for_each(|(sum, position)| *sum = *position);
        self.count
            .par_iter_mut()
            .with_min_len(BATCH)
            .for_each(|count| *count = 1);
        self.representative
            .par_iter_mut()
            .enumerate()
            .with_min_len(BATCH)
            .for_each(|(slot, representative)| *representative = slot as u32);
    }

    fn merge_view(&mut self) -> (&[CellHash], &[u32], MergeSlots<'_>) {
        let slots = MergeSlots {
            representative: self.representative.as_mut_ptr(),
            alignment: self.alignment.as_mut_ptr(),
            separation: self.separation.as_mut_ptr(),
            count: self.count.as_mut_ptr(),
            obstacle: self.obstacle.as_mut_ptr(),
            obstacle_distance: self.obstacle_distance.as_mut_ptr(),
            target: self.target.as_mut_ptr(),
            len: self.representative.len(),
            _columns: PhantomData,
        };
        (&self.hash, &self.owner, slots)
    }

    /// Number of agent slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.representative.len()
    }

    /// Whether the table holds any slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.representative.is_empty()
    }

    /// Representative slot for every agent slot; chains have depth at most one.
    #[must_use]
    pub fn representatives(&self) -> &[u32] {
        &self.representative
    }

    /// Cell hash of every agent's seed position.
    #[must_use]
    pub fn hashes(&self) -> &[CellHash] {
        &self.hash
    }

    /// Shard that owned each slot during the merge pass.
    #[must_use]
    pub fn owners(&self) -> &[u32] {
        &self.owner
    }

    /// Summed member headings, valid on representative slots.
    #[must_use]
    pub fn alignment_sums(&self) -> &[Vec3] {
        &self.alignment
    }

    /// Summed member positions, valid on representative slots.
    #[must_use]
    pub fn separation_sums(&self) -> &[Vec3] {
        &self.separation
    }

    /// Agents merged into each representative slot.
    #[must_use]
    pub fn member_counts(&self) -> &[u32] {
        &self.count
    }

    /// Nearest obstacle index, resolved once per representative slot.
    #[must_use]
    pub fn nearest_obstacles(&self) -> &[u32] {
        &self.obstacle
    }

    /// Distance to the nearest obstacle, resolved once per representative slot.
    #[must_use]
    pub fn obstacle_distances(&self) -> &[f32] {
        &self.obstacle_distance
    }

    /// Nearest target index, resolved once per representative slot.
    #[must_use]
    pub fn nearest_targets(&self) -> &[u32] {
        &self.target
    }
}

/// Raw column view through which merge tasks mutate representative slots.
struct MergeSlots<'a> {
    representative: *mut u32,
    alignment: *mut Vec3,
    separation: *mut Vec3,
    count: *mut u32,
    obstacle: *mut u32,
    obstacle_distance: *mut f32,
    target: *mut u32,
    len: usize,
    _columns: PhantomData<&'a mut ()>,
}

// SAFETY: a merge task only dereferences slots whose `owner` equals its own
// shard, and equal hash implies equal owner, so the slot sets touched by
// distinct tasks are disjoint for the lifetime of the view.
unsafe impl Sync for MergeSlots<'_> {}

impl MergeSlots<'_> {
    /// Resolve the nearest target and obstacle for a freshly inserted
    /// representative from its seed centroid.
    ///
    /// # Safety
    ///
    /// `slot` must be in bounds and owned by the calling merge task; no
    /// other task may touch it while the view is live.
    unsafe fn resolve_nearest(&self, slot: usize, targets: &[Vec3], obstacles: &[Vec3]) {
        debug_assert!(slot < self.len);
        let centroid = *self.separation.add(slot) / *self.count.add(slot) as f32;
        let (obstacle, distance) = nearest(obstacles, centroid);
        *self.obstacle.add(slot) = obstacle as u32;
        *self.obstacle_distance.add(slot) = distance;
        let (target, _) = nearest(targets, centroid);
        *self.target.add(slot) = target as u32;
    }

    /// Fold `slot` into the representative `first` found earlier by the
    /// same task.
    ///
    /// # Safety
    ///
    /// Both slots must be in bounds and owned by the calling merge task; no
    /// other task may touch them while the view is live.
    unsafe fn fold(&self, first: usize, slot: usize) {
        debug_assert!(first < self.len);
        debug_assert!(slot < self.len);
        *self.count.add(first) += 1;
        *self.alignment.add(first) += *self.alignment.add(slot);
        *self.separation.add(first) += *self.separation.add(slot);
        *self.representative.add(slot) = first as u32;
    }
}

/// One cell map per merge shard, cleared and re-reserved each tick. A map
/// is only ever written by the task that owns its shard.
#[derive(Debug, Default)]
struct ShardMaps {
    maps: Vec<HashMap<CellHash, u32>>,
}

impl ShardMaps {
    fn reset(&mut self, shard_count: usize, agents: usize) {
        self.maps.resize_with(shard_count, HashMap::new);
        let per_shard = agents / shard_count + 1;
        for map in &mut self.maps {
            map.clear();
            map.reserve(per_shard);
        }
    }

    fn unique_cells(&self) -> usize {
        self.maps.iter().map(HashMap::len).sum()
    }
}

/// Flocking tick driver owning all per-tick scratch state.
///
/// Scratch is resized to the live agent count at the start of every call,
/// so agent counts may change freely between ticks; only capacity is
/// reused across ticks, never values.
#[derive(Debug)]
pub struct FlockSim {
    shard_count: usize,
    cells: CellTable,
    maps: ShardMaps,
    targets: Vec<Vec3>,
    obstacles: Vec<Vec3>,
}

impl Default for FlockSim {
    fn default() -> Self {
        Self::new()
    }
}

impl FlockSim {
    /// Driver sized for rayon's current pool: one merge shard per worker
    /// thread plus one for the calling thread.
    #[must_use]
    pub fn new() -> Self {
        Self::sized(rayon::current_num_threads() + 1)
    }

    /// Driver with an explicit merge shard count.
    ///
    /// Results are identical for any positive count; a count of zero is a
    /// configuration error.
    pub fn with_shards(shard_count: usize) -> Result<Self, FlockError> {
        if shard_count == 0 {
            return Err(FlockError::NoWorkerThreads);
        }
        Ok(Self::sized(shard_count))
    }

    fn sized(shard_count: usize) -> Self {
        Self {
            shard_count,
            cells: CellTable::default(),
            maps: ShardMaps::default(),
            targets: Vec::new(),
            obstacles: Vec::new(),
        }
    }

    /// Number of merge shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Cell aggregates left by the most recent `update` call.
    #[must_use]
    pub fn cells(&self) -> &CellTable {
        &self.cells
    }

    /// Run one flocking tick, overwriting `headings` in place.
    ///
    /// `positions` and `headings` are parallel columns for the live agents;
    /// positions are never modified (forward integration is the movement
    /// system's job, see [`advance_positions`]). `targets` and `obstacles`
    /// must be non-empty and are snapshotted for the duration of the call.
    /// A zero agent count is a no-op success.
    pub fn update(
        &mut self,
        positions: &[Vec3],
        headings: &mut [Vec3],
        targets: &[Vec3],
        obstacles: &[Vec3],
        config: &FlockConfig,
        delta_time: f32,
    ) -> Result<(), FlockError> {
        if positions.len() != headings.len() {
            return Err(FlockError::ColumnMismatch {
                positions: positions.len(),
                headings: headings.len(),
            });
        }
        config.validate()?;
        if !delta_time.is_finite() || delta_time < 0.0 {
            return Err(FlockError::InvalidConfig(
                "delta_time must be finite and non-negative",
            ));
        }
        if targets.is_empty() {
            return Err(FlockError::EmptyTargets);
        }
        if obstacles.is_empty() {
            return Err(FlockError::EmptyObstacles);
        }
        let grid = CellGrid::new(config.cell_radius)?;

        let agents = positions.len();
        self.cells.resize(agents);
        self.maps.reset(self.shard_count, agents);
        if agents == 0 {
            return Ok(());
        }

        self.targets.clear();
        self.targets.extend_from_slice(targets);
        self.obstacles.clear();
        self.obstacles.extend_from_slice(obstacles);

        self.cells.assign_cells(&grid, self.shard_count, positions);
        self.cells.seed_singletons(positions, headings);
        self.merge();
        self.steer_all(config, delta_time, positions, headings);

        debug!(
            agents,
            cells = self.maps.unique_cells(),
            shards = self.shard_count,
            "flock tick"
        );
        Ok(())
    }

    /// Collapse co-celled slots into representatives, one task per shard.
    ///
    /// Every task scans the full slot range in ascending order and skips
    /// slots it does not own, so the first occurrence of a hash is always
    /// the lowest slot index carrying it, independent of the shard count.
    fn merge(&mut self) {
        let Self {
            cells,
            maps,
            targets,
            obstacles,
            ..
        } = self;
        let (hashes, owners, slots) = cells.merge_view();
        let targets = targets.as_slice();
        let obstacles = obstacles.as_slice();
        let slots = &slots;
        maps.maps
            .par_iter_mut()
            .enumerate()
            .for_each(|(shard, map)| {
                let shard = shard as u32;
                for slot in 0..hashes.len() {
                    if owners[slot] != shard {
                        continue;
                    }
                    match map.entry(hashes[slot]) {
                        Entry::Vacant(entry) => {
                            entry.insert(slot as u32);
                            // SAFETY: `slot` is owned by this task's shard.
                            unsafe { slots.resolve_nearest(slot, targets, obstacles) };
                        }
                        Entry::Occupied(entry) => {
                            let first = *entry.get() as usize;
                            // SAFETY: `first` carries the same hash as `slot`
                            // and therefore the same owning shard.
                            unsafe { slots.fold(first, slot) };
                        }
                    }
                }
            });
    }

    /// Steer every agent from its finalized cell aggregate. Read-only over
    /// the cell table, so any range partitioning is safe.
    fn steer_all(
        &self,
        config: &FlockConfig,
        delta_time: f32,
        positions: &[Vec3],
        headings: &mut [Vec3],
    ) {
        let cells = &self.cells;
        let targets = self.targets.as_slice();
        let obstacles = self.obstacles.as_slice();
        headings
            .par_iter_mut()
            .zip(positions.par_iter())
            .enumerate()
            .with_min_len(BATCH)
            .for_each(|(slot, (heading, position))| {
                let cell = cells.representative[slot] as usize;
                *heading = steer(
                    config,
                    delta_time,
                    *heading,
                    *position,
                    cells.count[cell],
                    cells.alignment[cell],
                    cells.separation[cell],
                    obstacles[cells.obstacle[cell] as usize],
                    cells.obstacle_distance[cell],
                    targets[cells.target[cell] as usize],
                );
            });
    }
}

/// Advance positions along headings at per-agent speeds.
///
/// This is the forward-integration step movement systems apply after a
/// tick; the flocking core itself never moves positions.
pub fn advance_positions(
    positions: &mut [Vec3],
    headings: &[Vec3],
    speeds: &[f32],
    delta_time: f32,
) {
    debug_assert_eq!(positions.len(), headings.len());
    debug_assert_eq!(positions.len(), speeds.len());
    positions
        .par_iter_mut()
        .zip(headings.par_iter())
        .zip(speeds.par_iter())
        .with_min_len(BATCH)
        .for_each(|((position, heading), speed)| {
            *position += delta_time * *speed * *heading;
        });
}
