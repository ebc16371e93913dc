//! Partitioning of the walkable surface into simply-connected regions, one of
//! three strategies: distance-field watershed, monotone row sweep, or the
//! layer-preserving sweep for stacked floors.

use std::collections::{HashMap, HashSet};

use crate::{
    heightfields::{follow_link, OpenSpan, OpenTile},
    Area,
};

use super::{get_neighbour_index, NavMeshSettings};

/// Reserved region id painted onto the tile's ``border_size`` ring so no
/// strategy claims it. Zeroed again before the contour stage.
const BORDER_REGION: u16 = u16::MAX;

/// How many growth sweeps to run per watershed level before flooding fresh
/// regions.
const GROWTH_SWEEPS_PER_LEVEL: u16 = 8;
/// Distance levels are distributed over this many rotating buckets.
const LEVEL_BUCKETS: usize = 8;

/// A span queued for region growth. ``index`` goes negative once claimed.
#[derive(Default, Clone, Copy)]
struct GrowthSeed {
    cell: u32,
    span: u32,
    index: i32,
}

/// Watershed partitioning, flooding regions from distance-field maxima inward.
///
/// Requires [calculate_distance_field](crate::heightfields::calculate_distance_field)
/// to have run on the tile.
pub fn build_regions(open_tile: &mut OpenTile, nav_mesh_settings: &NavMeshSettings) {
    let tile_side = nav_mesh_settings.get_tile_side_with_border();
    let mut regions = vec![0_u16; open_tile.span_count];
    let mut growth_distances = vec![0_u16; open_tile.span_count];
    let mut pending_claims = Vec::with_capacity(512);

    paint_border_regions(open_tile, nav_mesh_settings, &mut regions);

    let mut buckets: [Vec<GrowthSeed>; LEVEL_BUCKETS] = Default::default();
    let mut flood_stack = Vec::with_capacity(256);

    let mut next_region = 1_u16;
    let mut level = (open_tile.max_distance + 1) & !1_u16; // Rounded.
    let mut bucket = LEVEL_BUCKETS - 1;

    while level > 0 {
        level = level.saturating_sub(2);
        bucket = (bucket + 1) % LEVEL_BUCKETS;

        if bucket == 0 {
            bucket_spans_by_level(level, open_tile, &mut buckets, &regions);
        } else {
            // Carry over whatever the previous bucket failed to claim.
            let (front, back) = buckets.split_at_mut(bucket);
            let carried: Vec<GrowthSeed> = front[bucket - 1]
                .iter()
                .filter(|seed| seed.index >= 0 && regions[seed.index as usize] == 0)
                .copied()
                .collect();
            back[0].extend(carried);
        }

        grow_regions(
            tile_side,
            open_tile,
            &mut regions,
            &mut growth_distances,
            &mut buckets[bucket],
            &mut pending_claims,
            Some(GROWTH_SWEEPS_PER_LEVEL),
        );

        // Whatever still has no region at this level seeds a new one.
        for seed_index in 0..buckets[bucket].len() {
            let seed = buckets[bucket][seed_index];
            if seed.index < 0 || regions[seed.index as usize] != 0 {
                continue;
            }

            if flood_new_region(
                tile_side,
                open_tile,
                seed,
                level,
                next_region,
                &mut regions,
                &mut growth_distances,
                &mut flood_stack,
            ) {
                next_region += 1;
            }
        }
    }

    // Drain every remaining unclaimed span into its nearest region.
    let mut leftovers = Vec::new();
    for (cell_index, cell) in open_tile.cells.iter().enumerate() {
        for (span_index, span) in cell.spans.iter().enumerate() {
            if regions[span.tile_index] == 0 && open_tile.areas[span.tile_index].is_some() {
                leftovers.push(GrowthSeed {
                    cell: cell_index as u32,
                    span: span_index as u32,
                    index: span.tile_index as i32,
                });
            }
        }
    }
    grow_regions(
        tile_side,
        open_tile,
        &mut regions,
        &mut growth_distances,
        &mut leftovers,
        &mut pending_claims,
        None,
    );

    merge_and_filter_regions(
        nav_mesh_settings,
        tile_side,
        &mut regions,
        &mut next_region,
        open_tile,
    );

    write_regions_to_spans(open_tile, &regions, next_region);
}

/// Monotone partitioning: sweep rows top-to-bottom, assigning a new region id
/// whenever connectivity breaks, then adopt the previous row's region when it
/// connects to exactly one run. Produces no holes; may yield long thin regions.
pub fn build_regions_monotone(open_tile: &mut OpenTile, nav_mesh_settings: &NavMeshSettings) {
    let mut regions = vec![0; open_tile.span_count];

    paint_border_regions(open_tile, nav_mesh_settings, &mut regions);

    let mut next_region = sweep_rows_into_regions(open_tile, nav_mesh_settings, &mut regions);

    merge_and_filter_regions(
        nav_mesh_settings,
        nav_mesh_settings.get_tile_side_with_border(),
        &mut regions,
        &mut next_region,
        open_tile,
    );

    write_regions_to_spans(open_tile, &regions, next_region);
}

/// Layer partitioning: the monotone sweep, then merging of connected row runs
/// that do not overlap vertically. Overlapping floors keep distinct region
/// ids, which keeps stacked walkable surfaces apart in one tile.
pub fn build_layer_regions(open_tile: &mut OpenTile, nav_mesh_settings: &NavMeshSettings) {
    let mut regions = vec![0; open_tile.span_count];

    paint_border_regions(open_tile, nav_mesh_settings, &mut regions);

    let mut next_region = sweep_rows_into_regions(open_tile, nav_mesh_settings, &mut regions);

    merge_non_overlapping_layers(open_tile, nav_mesh_settings, &mut regions, next_region);

    merge_and_filter_regions(
        nav_mesh_settings,
        nav_mesh_settings.get_tile_side_with_border(),
        &mut regions,
        &mut next_region,
        open_tile,
    );

    write_regions_to_spans(open_tile, &regions, next_region);
}

fn write_regions_to_spans(open_tile: &mut OpenTile, regions: &[u16], region_count: u16) {
    for cell in open_tile.cells.iter_mut() {
        for span in cell.spans.iter_mut() {
            let region = regions[span.tile_index];
            span.region = if region == BORDER_REGION { 0 } else { region };
        }
    }

    open_tile.max_regions = region_count;
}

fn paint_border_regions(
    open_tile: &OpenTile,
    nav_mesh_settings: &NavMeshSettings,
    regions: &mut [u16],
) {
    let border = nav_mesh_settings.get_border_side();
    if border == 0 {
        return;
    }

    let tile_side = nav_mesh_settings.get_tile_side_with_border();
    for (i, cell) in open_tile.cells.iter().enumerate() {
        let row = i / tile_side;
        let column = i % tile_side;

        let in_border = row < border
            || column < border
            || row >= tile_side - border
            || column >= tile_side - border;
        if !in_border {
            continue;
        }

        for span in cell.spans.iter() {
            regions[span.tile_index] = BORDER_REGION;
        }
    }
}

/// Region id of the span on the far side of an edge, ``0`` when unlinked.
fn neighbour_region_id(
    tile: &OpenTile,
    tile_side: usize,
    cell_index: usize,
    span: &OpenSpan,
    direction: usize,
    regions: &[u16],
) -> u16 {
    follow_link(&tile.cells, tile_side, cell_index, span, direction)
        .map_or(0, |(_, neighbour)| regions[neighbour.tile_index])
}

fn bucket_spans_by_level(
    start_level: u16,
    open_tile: &OpenTile,
    buckets: &mut [Vec<GrowthSeed>; LEVEL_BUCKETS],
    regions: &[u16],
) {
    for bucket in buckets.iter_mut() {
        bucket.clear();
    }

    let top = (start_level >> 1) as i32;

    for (cell_index, cell) in open_tile.cells.iter().enumerate() {
        for (span_index, span) in cell.spans.iter().enumerate() {
            if open_tile.areas[span.tile_index].is_none() || regions[span.tile_index] != 0 {
                continue;
            }

            let level = (open_tile.distances[span.tile_index] >> 1) as i32;
            let slot = (top - level).max(0) as usize;
            if slot >= LEVEL_BUCKETS {
                continue;
            }

            buckets[slot].push(GrowthSeed {
                cell: cell_index as u32,
                span: span_index as u32,
                index: span.tile_index as i32,
            });
        }
    }
}

/// Grows claimed regions into unclaimed seeds, each seed adopting the
/// neighbouring region with the smallest growth distance. A ``sweep_limit`` of
/// ``None`` keeps sweeping until nothing changes.
fn grow_regions(
    tile_side: usize,
    tile: &OpenTile,
    regions: &mut [u16],
    growth_distances: &mut [u16],
    seeds: &mut [GrowthSeed],
    pending_claims: &mut Vec<(usize, u16, u16)>,
    sweep_limit: Option<u16>,
) {
    for seed in seeds
        .iter_mut()
        .filter(|seed| seed.index >= 0 && regions[seed.index as usize] != 0)
    {
        seed.index = -1;
    }

    let mut sweeps = 0;
    loop {
        let mut stalled = 0;
        pending_claims.clear();

        for seed in seeds.iter_mut() {
            if seed.index < 0 {
                stalled += 1;
                continue;
            }

            let span = &tile.cells[seed.cell as usize].spans[seed.span as usize];
            let area = tile.areas[span.tile_index];

            let mut claimed_by = 0;
            let mut claimed_distance = u16::MAX;
            for direction in 0..4 {
                let Some((_, neighbour)) =
                    follow_link(&tile.cells, tile_side, seed.cell as usize, span, direction)
                else {
                    continue;
                };
                if tile.areas[neighbour.tile_index] != area {
                    continue;
                }

                let neighbour_region = regions[neighbour.tile_index];
                if neighbour_region == 0 || neighbour_region == BORDER_REGION {
                    continue;
                }

                let candidate = growth_distances[neighbour.tile_index].saturating_add(2);
                if candidate < claimed_distance {
                    claimed_by = neighbour_region;
                    claimed_distance = candidate;
                }
            }

            if claimed_by == 0 {
                stalled += 1;
                continue;
            }

            seed.index = -1;
            pending_claims.push((span.tile_index, claimed_by, claimed_distance));
        }

        // Claims land after the sweep so every seed saw the same state.
        for (index, region, distance) in pending_claims.drain(..) {
            regions[index] = region;
            growth_distances[index] = distance;
        }

        if stalled == seeds.len() {
            break;
        }

        sweeps += 1;
        if sweep_limit.is_some_and(|limit| sweeps >= limit) {
            break;
        }
    }
}

fn region_is_foreign(region: u16, own: u16) -> bool {
    region != 0 && region != own && region != BORDER_REGION
}

/// Whether a span of a nascent region touches a different region, directly or
/// around a corner. Such spans are handed back to the growth sweeps instead.
fn touches_foreign_region(
    tile: &OpenTile,
    tile_side: usize,
    cell_index: usize,
    span: &OpenSpan,
    area: Option<Area>,
    region_id: u16,
    regions: &[u16],
) -> bool {
    for direction in 0..4 {
        let Some((axial_cell, axial)) =
            follow_link(&tile.cells, tile_side, cell_index, span, direction)
        else {
            continue;
        };
        if tile.areas[axial.tile_index] != area {
            continue;
        }
        if region_is_foreign(regions[axial.tile_index], region_id) {
            return true;
        }

        let corner_direction = (direction + 1) & 0x3;
        let Some((_, corner)) = follow_link(&tile.cells, tile_side, axial_cell, axial, corner_direction)
        else {
            continue;
        };
        if tile.areas[corner.tile_index] != area {
            continue;
        }
        if region_is_foreign(regions[corner.tile_index], region_id) {
            return true;
        }
    }

    false
}

#[allow(clippy::too_many_arguments)]
fn flood_new_region(
    tile_side: usize,
    tile: &OpenTile,
    seed: GrowthSeed,
    level: u16,
    region_id: u16,
    regions: &mut [u16],
    growth_distances: &mut [u16],
    stack: &mut Vec<GrowthSeed>,
) -> bool {
    let area = {
        let span = &tile.cells[seed.cell as usize].spans[seed.span as usize];
        tile.areas[span.tile_index]
    };

    stack.clear();
    stack.push(seed);
    regions[seed.index as usize] = region_id;
    growth_distances[seed.index as usize] = 0;

    let floor = level.saturating_sub(2);
    let mut claimed_any = false;

    while let Some(current) = stack.pop() {
        let span = &tile.cells[current.cell as usize].spans[current.span as usize];

        if touches_foreign_region(
            tile,
            tile_side,
            current.cell as usize,
            span,
            area,
            region_id,
            regions,
        ) {
            // Near another region: let the growth sweeps fight over it.
            regions[current.index as usize] = 0;
            continue;
        }

        claimed_any = true;

        for direction in 0..4 {
            let Some((neighbour_cell, neighbour)) =
                follow_link(&tile.cells, tile_side, current.cell as usize, span, direction)
            else {
                continue;
            };
            if tile.areas[neighbour.tile_index] != area {
                continue;
            }

            if tile.distances[neighbour.tile_index] >= floor
                && regions[neighbour.tile_index] == 0
            {
                regions[neighbour.tile_index] = region_id;
                growth_distances[neighbour.tile_index] = 0;
                stack.push(GrowthSeed {
                    cell: neighbour_cell as u32,
                    span: span.neighbours[direction].unwrap_or_default() as u32,
                    index: neighbour.tile_index as i32,
                });
            }
        }
    }

    claimed_any
}

/// The shared row sweep of the monotone & layer strategies. Returns one past
/// the highest region id assigned.
fn sweep_rows_into_regions(
    open_tile: &OpenTile,
    nav_mesh_settings: &NavMeshSettings,
    regions: &mut [u16],
) -> u16 {
    #[derive(Default, Clone, Copy)]
    struct SweepRun {
        /// Region id of the previous row this run connects to, if unambiguous.
        neighbour: u16,
        /// How many samples connected to ``neighbour``.
        samples: u32,
        region: u16,
    }
    const NO_NEIGHBOUR: u16 = u16::MAX;

    let tile_side = nav_mesh_settings.get_tile_side_with_border();
    let mut region_id = 1_u16;

    let mut sweeps: Vec<SweepRun> = Vec::with_capacity(tile_side);
    // Samples per previous-row region, to detect runs merging into the same one.
    let mut previous_row_samples: Vec<u32> = Vec::new();
    let mut sweep_of_span: Vec<u16> = vec![0; open_tile.span_count];

    for row in 0..tile_side {
        sweeps.clear();
        previous_row_samples.clear();
        previous_row_samples.resize(region_id as usize, 0);

        for column in 0..tile_side {
            let cell_index = column + row * tile_side;

            for span in open_tile.cells[cell_index].spans.iter() {
                if open_tile.areas[span.tile_index].is_none()
                    || regions[span.tile_index] == BORDER_REGION
                {
                    continue;
                }
                let area = open_tile.areas[span.tile_index];

                // Continue the previous column's run if connected & compatible.
                let mut sweep_index = None;
                if let Some(neighbour_span_index) = span.neighbours[0] {
                    let neighbour_span = &open_tile.cells[cell_index - 1].spans
                        [neighbour_span_index as usize];

                    if open_tile.areas[neighbour_span.tile_index] == area
                        && regions[neighbour_span.tile_index] != BORDER_REGION
                    {
                        let index = sweep_of_span[neighbour_span.tile_index];
                        if (index as usize) < sweeps.len() {
                            sweep_index = Some(index);
                        }
                    }
                }

                let sweep_index = match sweep_index {
                    Some(index) => index,
                    None => {
                        let index = sweeps.len() as u16;
                        sweeps.push(SweepRun {
                            neighbour: 0,
                            samples: 0,
                            region: 0,
                        });
                        index
                    }
                };
                sweep_of_span[span.tile_index] = sweep_index;

                // Sample the previous row.
                if let Some(neighbour_span_index) = span.neighbours[3] {
                    let neighbour_span = &open_tile.cells[cell_index - tile_side].spans
                        [neighbour_span_index as usize];
                    let neighbour_region = regions[neighbour_span.tile_index];

                    if neighbour_region != 0
                        && neighbour_region != BORDER_REGION
                        && open_tile.areas[neighbour_span.tile_index] == area
                    {
                        let sweep = &mut sweeps[sweep_index as usize];
                        if sweep.neighbour == 0 || sweep.neighbour == neighbour_region {
                            sweep.neighbour = neighbour_region;
                            sweep.samples += 1;
                            previous_row_samples[neighbour_region as usize] += 1;
                        } else {
                            sweep.neighbour = NO_NEIGHBOUR;
                        }
                    }
                }
            }
        }

        // Resolve each run: adopt the previous row's region only when that
        // region connects to this row through this run alone.
        for sweep in sweeps.iter_mut() {
            if sweep.neighbour != 0
                && sweep.neighbour != NO_NEIGHBOUR
                && previous_row_samples[sweep.neighbour as usize] == sweep.samples
            {
                sweep.region = sweep.neighbour;
            } else {
                sweep.region = region_id;
                region_id += 1;
            }
        }

        // Write the resolved ids back into the row.
        for column in 0..tile_side {
            let cell_index = column + row * tile_side;

            for span in open_tile.cells[cell_index].spans.iter() {
                if open_tile.areas[span.tile_index].is_none()
                    || regions[span.tile_index] == BORDER_REGION
                {
                    continue;
                }

                regions[span.tile_index] = sweeps[sweep_of_span[span.tile_index] as usize].region;
            }
        }
    }

    region_id
}

/// Merges 4-connected regions of the same area as long as no two members
/// occupy the same column, keeping stacked floors apart.
fn merge_non_overlapping_layers(
    open_tile: &OpenTile,
    nav_mesh_settings: &NavMeshSettings,
    regions: &mut [u16],
    region_count: u16,
) {
    let tile_side = nav_mesh_settings.get_tile_side_with_border();

    // Regions sharing a column must never merge.
    let mut overlaps: HashSet<(u16, u16)> = HashSet::new();
    for cell in open_tile.cells.iter() {
        for (i, span) in cell.spans.iter().enumerate() {
            let region = regions[span.tile_index];
            if region == 0 || region == BORDER_REGION {
                continue;
            }

            for other_span in cell.spans.iter().skip(i + 1) {
                let other_region = regions[other_span.tile_index];
                if other_region == 0 || other_region == BORDER_REGION {
                    continue;
                }

                overlaps.insert((region.min(other_region), region.max(other_region)));
            }
        }
    }

    let mut region_area: HashMap<u16, Option<Area>> = HashMap::new();
    let mut adjacencies: HashSet<(u16, u16)> = HashSet::new();
    for (cell_index, cell) in open_tile.cells.iter().enumerate() {
        for span in cell.spans.iter() {
            let region = regions[span.tile_index];
            if region == 0 || region == BORDER_REGION {
                continue;
            }
            region_area.insert(region, open_tile.areas[span.tile_index]);

            for dir in [1, 2] {
                let Some(neighbour_span_index) = span.neighbours[dir] else {
                    continue;
                };
                let neighbour_span = &open_tile.cells
                    [get_neighbour_index(tile_side, cell_index, dir)]
                .spans[neighbour_span_index as usize];
                let neighbour_region = regions[neighbour_span.tile_index];

                if neighbour_region == 0
                    || neighbour_region == BORDER_REGION
                    || neighbour_region == region
                {
                    continue;
                }

                adjacencies.insert((
                    region.min(neighbour_region),
                    region.max(neighbour_region),
                ));
            }
        }
    }

    // Union-find over region ids, refusing unions whose combined groups overlap.
    let mut parent: Vec<u16> = (0..region_count).collect();
    fn find(parent: &mut [u16], i: u16) -> u16 {
        let mut root = i;
        while parent[root as usize] != root {
            root = parent[root as usize];
        }
        let mut current = i;
        while parent[current as usize] != root {
            let next = parent[current as usize];
            parent[current as usize] = root;
            current = next;
        }
        root
    }

    let mut group_members: HashMap<u16, Vec<u16>> =
        (0..region_count).map(|i| (i, vec![i])).collect();

    let mut sorted_adjacencies: Vec<_> = adjacencies.into_iter().collect();
    sorted_adjacencies.sort_unstable();

    for (a, b) in sorted_adjacencies {
        if region_area.get(&a) != region_area.get(&b) {
            continue;
        }

        let root_a = find(&mut parent, a);
        let root_b = find(&mut parent, b);
        if root_a == root_b {
            continue;
        }

        let members_a = &group_members[&root_a];
        let members_b = &group_members[&root_b];
        let any_overlap = members_a.iter().any(|member_a| {
            members_b.iter().any(|member_b| {
                overlaps.contains(&(*member_a.min(member_b), *member_a.max(member_b)))
            })
        });
        if any_overlap {
            continue;
        }

        parent[root_b as usize] = root_a;
        let members_b = group_members.remove(&root_b).unwrap_or_default();
        group_members
            .get_mut(&root_a)
            .expect("merge target group")
            .extend(members_b);
    }

    for region in regions.iter_mut() {
        if *region != 0 && *region != BORDER_REGION {
            *region = find(&mut parent, *region);
        }
    }
}

/// Bookkeeping for one region while culling & merging. Slots are indexed by
/// the region's original id; ``id`` tracks the current (possibly renamed) one.
struct RegionInfo {
    id: u16,
    size: usize,
    area: Option<Area>,
    touches_border: bool,
    overlaps: bool,
    visited: bool,
    needs_remap: bool,
    /// Regions stacked in the same columns as this one.
    stacked_with: Vec<u16>,
    /// Bordering region ids in boundary-walk order.
    ring: Vec<u16>,
}

fn merge_and_filter_regions(
    nav_mesh_settings: &NavMeshSettings,
    tile_side: usize,
    regions: &mut [u16],
    next_region: &mut u16,
    tile: &OpenTile,
) {
    let mut infos = gather_region_info(tile, tile_side, regions, *next_region);

    cull_small_islands(nav_mesh_settings.min_region_area as usize, &mut infos);
    absorb_into_neighbours(nav_mesh_settings, &mut infos);
    *next_region = compact_region_ids(&mut infos);

    // Rewrite the span map through the rename table.
    for cell in tile.cells.iter() {
        for span in cell.spans.iter() {
            let source = regions[span.tile_index];
            if source == BORDER_REGION || source as usize >= infos.len() {
                continue;
            }

            regions[span.tile_index] = infos[source as usize].id;
        }
    }
}

fn gather_region_info(
    tile: &OpenTile,
    tile_side: usize,
    regions: &[u16],
    region_count: u16,
) -> Vec<RegionInfo> {
    let mut infos: Vec<RegionInfo> = (0..region_count)
        .map(|id| RegionInfo {
            id,
            size: 0,
            area: None,
            touches_border: false,
            overlaps: false,
            visited: false,
            needs_remap: false,
            stacked_with: Vec::with_capacity(4),
            ring: Vec::with_capacity(4),
        })
        .collect();

    for (cell_index, cell) in tile.cells.iter().enumerate() {
        for (span_index, span) in cell.spans.iter().enumerate() {
            let region = regions[span.tile_index];
            if region == 0 || region >= region_count {
                continue;
            }

            let info = &mut infos[region as usize];
            info.size += 1;

            // Track other regions stacked in this column.
            for other_span in cell.spans.iter() {
                if other_span.tile_index == span.tile_index {
                    continue;
                }

                let other_region = regions[other_span.tile_index];
                if other_region == 0 || other_region >= region_count {
                    continue;
                }

                info.overlaps |= other_region == region;
                if !info.stacked_with.contains(&other_region) {
                    info.stacked_with.push(other_region);
                }
            }

            // One boundary walk per region is enough.
            if !info.ring.is_empty() {
                continue;
            }
            info.area = tile.areas[span.tile_index];

            let start_direction = (0..4).find(|direction| {
                neighbour_region_id(tile, tile_side, cell_index, span, *direction, regions)
                    != region
            });
            if let Some(direction) = start_direction {
                let mut ring = std::mem::take(&mut infos[region as usize].ring);
                trace_region_ring(
                    tile,
                    tile_side,
                    regions,
                    cell_index,
                    span_index,
                    direction,
                    &mut ring,
                );
                infos[region as usize].ring = ring;
            }
        }
    }

    for info in infos.iter_mut() {
        info.touches_border = info.ring.contains(&BORDER_REGION);
    }

    infos
}

/// Walks a region's boundary clockwise, recording each bordering region id in
/// order.
fn trace_region_ring(
    tile: &OpenTile,
    tile_side: usize,
    regions: &[u16],
    mut cell_index: usize,
    mut span_index: usize,
    mut direction: usize,
    ring: &mut Vec<u16>,
) {
    let start = (cell_index, span_index, direction);
    let own_region = {
        let span = &tile.cells[cell_index].spans[span_index];
        regions[span.tile_index]
    };

    loop {
        let span = &tile.cells[cell_index].spans[span_index];
        let bordering = neighbour_region_id(tile, tile_side, cell_index, span, direction, regions);

        if bordering != own_region {
            // Boundary edge: note who's on the far side & turn clockwise.
            if ring.last() != Some(&bordering) {
                ring.push(bordering);
            }
            direction = (direction + 1) & 0x3;
        } else {
            // Connected edge: step through it & turn counter-clockwise.
            let Some(linked) = span.neighbours[direction] else {
                return;
            };
            cell_index = get_neighbour_index(tile_side, cell_index, direction);
            span_index = linked as usize;
            direction = (direction + 3) & 0x3;
        }

        if (cell_index, span_index, direction) == start {
            break;
        }
    }

    dedup_neighbour_ring(ring);
}

/// Collapses runs of equal ids in a circular ring.
fn dedup_neighbour_ring(ring: &mut Vec<u16>) {
    if ring.len() < 2 {
        return;
    }

    let mut deduped = Vec::with_capacity(ring.len());
    for &id in ring.iter() {
        if deduped.last() != Some(&id) {
            deduped.push(id);
        }
    }
    while deduped.len() > 1 && deduped.first() == deduped.last() {
        deduped.pop();
    }

    *ring = deduped;
}

/// Removes connected components whose combined span count falls below
/// ``min_area``, unless they spill over the tile border.
fn cull_small_islands(min_area: usize, infos: &mut [RegionInfo]) {
    let mut queue = Vec::with_capacity(32);
    let mut component = Vec::with_capacity(32);

    for root in 0..infos.len() {
        {
            let info = &mut infos[root];
            if info.id == 0 || info.size == 0 || info.visited {
                continue;
            }
            info.visited = true;
        }

        queue.clear();
        component.clear();
        queue.push(root as u16);

        let mut total_size = 0;
        let mut at_border = false;

        while let Some(id) = queue.pop() {
            component.push(id);
            total_size += infos[id as usize].size;
            at_border |= infos[id as usize].touches_border;

            let ring = infos[id as usize].ring.clone();
            for linked in ring {
                if linked as usize >= infos.len() {
                    at_border = true;
                    continue;
                }

                let info = &mut infos[linked as usize];
                if info.visited || info.id == 0 {
                    continue;
                }
                info.visited = true;
                queue.push(linked);
            }
        }

        // Regions clipped by the tile border stay; culling them would open
        // holes at tile seams.
        if total_size < min_area && !at_border {
            for id in &component {
                let info = &mut infos[*id as usize];
                info.size = 0;
                info.id = 0;
            }
        }
    }
}

/// Greedily folds small regions into their smallest compatible neighbour
/// until nothing changes.
fn absorb_into_neighbours(nav_mesh_settings: &NavMeshSettings, infos: &mut [RegionInfo]) {
    let merge_ceiling = nav_mesh_settings.max_region_area_to_merge_into as usize;

    loop {
        let mut absorbed_any = false;

        for index in 0..infos.len() {
            let target = {
                let info = &infos[index];
                if info.id == 0 || info.overlaps || info.size == 0 {
                    continue;
                }
                // Big border-spilling regions stay put.
                if info.size > merge_ceiling && info.touches_border {
                    continue;
                }

                info.ring
                    .iter()
                    .filter(|id| (**id as usize) < infos.len())
                    .map(|id| &infos[*id as usize])
                    .filter(|other| other.id != 0 && !other.overlaps)
                    .filter(|other| regions_can_merge(info, other) && regions_can_merge(other, info))
                    .min_by_key(|other| other.size)
                    .map(|other| other.id)
            };
            let Some(target) = target else {
                continue;
            };

            let old_id = infos[index].id;
            if !splice_region_rings(infos, index, target) {
                continue;
            }

            // Point everything at the survivor.
            for info in infos.iter_mut().filter(|info| info.id != 0) {
                if info.id == old_id {
                    info.id = target;
                }
                rename_in_ring(info, old_id, target);
            }

            absorbed_any = true;
        }

        if !absorbed_any {
            break;
        }
    }
}

fn regions_can_merge(a: &RegionInfo, b: &RegionInfo) -> bool {
    a.area == b.area
        // Two shared boundary runs would pinch a hole into the merged region.
        && a.ring.iter().filter(|id| **id == b.id).count() <= 1
        && !a.stacked_with.contains(&b.id)
}

/// Joins two neighbour rings along their mutual entries, dropping the shared
/// edge. ``false`` when the regions don't actually border each other.
fn splice_region_rings(infos: &mut [RegionInfo], index: usize, target_id: u16) -> bool {
    let merged_ring = {
        let a = &infos[index];
        let b = &infos[target_id as usize];

        let Some(a_pivot) = a.ring.iter().position(|id| *id == b.id) else {
            return false;
        };
        let Some(b_pivot) = b.ring.iter().position(|id| *id == a.id) else {
            return false;
        };

        let mut ring = Vec::with_capacity(a.ring.len() + b.ring.len());
        ring.extend(
            a.ring
                .iter()
                .cycle()
                .skip(a_pivot + 1)
                .take(a.ring.len() - 1)
                .copied(),
        );
        ring.extend(
            b.ring
                .iter()
                .cycle()
                .skip(b_pivot + 1)
                .take(b.ring.len() - 1)
                .copied(),
        );
        ring
    };

    let (absorbed_size, absorbed_border, absorbed_stack) = {
        let other = &mut infos[target_id as usize];
        other.ring.clear();
        (
            std::mem::take(&mut other.size),
            other.touches_border,
            std::mem::take(&mut other.stacked_with),
        )
    };

    let info = &mut infos[index];
    info.size += absorbed_size;
    info.touches_border |= absorbed_border;
    info.ring = merged_ring;
    dedup_neighbour_ring(&mut info.ring);
    for stacked in absorbed_stack {
        if !info.stacked_with.contains(&stacked) {
            info.stacked_with.push(stacked);
        }
    }

    true
}

fn rename_in_ring(info: &mut RegionInfo, old_id: u16, new_id: u16) {
    let mut renamed = false;
    for id in info.ring.iter_mut() {
        if *id == old_id {
            *id = new_id;
            renamed = true;
        }
    }
    for stacked in info.stacked_with.iter_mut() {
        if *stacked == old_id {
            *stacked = new_id;
        }
    }
    if renamed {
        dedup_neighbour_ring(&mut info.ring);
    }
}

/// Renumbers surviving regions contiguously from 1, returning one past the
/// highest id in use.
fn compact_region_ids(infos: &mut [RegionInfo]) -> u16 {
    for info in infos.iter_mut() {
        info.needs_remap = info.id != 0;
    }

    let mut compacted = 0;
    for index in 0..infos.len() {
        if !infos[index].needs_remap {
            continue;
        }
        compacted += 1;

        let from = infos[index].id;
        for info in infos[index..].iter_mut() {
            if info.id == from {
                info.id = compacted;
                info.needs_remap = false;
            }
        }
    }

    compacted
}
