//! Voxelization of triangle soups into span columns (the "solid" heightfield)
//! and the derived open heightfield the rest of the pipeline runs on.

use bevy::math::{UVec2, Vec3, Vec3A};
use smallvec::SmallVec;

use crate::{
    context::{BuildContext, DiagnosticCode},
    get_neighbour_index, Area, BuildError, NavMeshSettings, TriangleMesh,
};

#[derive(Default, Clone, Debug)]
pub(crate) struct HeightSpan {
    min: u16,
    max: u16,
    area: Option<Area>,
}

#[derive(Default, Clone)]
struct VoxelCell {
    spans: SmallVec<[HeightSpan; 2]>, // Bottom to top.
}

/// The "solid" heightfield of one tile: a grid of columns of rasterized spans.
#[derive(Default)]
pub struct VoxelizedTile {
    cells: Box<[VoxelCell]>, // len = tile_side^2. Laid out X to Y.
    tile_side: usize,
}

#[derive(Default, Clone, Debug)]
pub(crate) struct OpenCell {
    pub(crate) spans: SmallVec<[OpenSpan; 1]>,
}

// The open space above a solid span, when tall enough to stand in.
#[derive(Default, Clone, Copy, Debug)]
pub(crate) struct OpenSpan {
    pub(crate) min: u16,
    pub(crate) max: Option<u16>,
    pub(crate) neighbours: [Option<u16>; 4],
    pub(crate) tile_index: usize, // The index of this span in the whole tile.
    pub(crate) region: u16,       // Region if non-zero.
    area: Option<Area>,
}

/// The compact (open) heightfield of one tile: walkable floor spans with
/// neighbour links, area ids, and the distance field used by watershed
/// partitioning.
#[derive(Default, Debug)]
pub struct OpenTile {
    pub(crate) cells: Vec<OpenCell>, // len = tile_side^2. Laid out X to Y.
    pub(crate) distances: Box<[u16]>, // Distances used in watershed. One per span. Use tile_index to go from span to distance.
    pub(crate) areas: Box<[Option<Area>]>,
    pub(crate) max_distance: u16,
    pub(crate) span_count: usize, // Total spans in all cells.
    pub(crate) max_regions: u16,
}

/// Marks triangles as walkable by slope, assuming CCW winding & +Y up.
///
/// Triangles whose surface normal deviates from +Y by less than
/// ``max_slope_radians`` get [Area::WALKABLE]; all others get ``None``.
pub fn mark_walkable_triangles(
    positions: &[Vec3],
    indices: &[[u32; 3]],
    max_slope_radians: f32,
) -> Vec<Option<Area>> {
    indices
        .iter()
        .map(|triangle| {
            let a = Vec3A::from(positions[triangle[0] as usize]);
            let b = Vec3A::from(positions[triangle[1] as usize]);
            let c = Vec3A::from(positions[triangle[2] as usize]);

            is_triangle_traversable(a, b, c, max_slope_radians).then_some(Area::WALKABLE)
        })
        .collect()
}

fn is_triangle_traversable(a: Vec3A, b: Vec3A, c: Vec3A, max_slope_radians: f32) -> bool {
    let normal = (b - a).cross(c - a).normalize();

    normal.dot(Vec3A::Y).acos() < max_slope_radians
}

/// Conservatively rasterizes the walkable triangles of ``mesh`` into the span
/// columns of one tile. Every column whose footprint is touched by a triangle
/// receives a span covering the triangle's height over that column.
pub fn build_heightfield_tile(
    ctx: &mut BuildContext,
    tile_coord: UVec2,
    mesh: &TriangleMesh,
    areas: &[Option<Area>],
    nav_mesh_settings: &NavMeshSettings,
) -> Result<VoxelizedTile, BuildError> {
    let tile_side = nav_mesh_settings.get_tile_side_with_border();
    if tile_side == 0 {
        ctx.error(
            "rasterize",
            DiagnosticCode::ZeroSizedGrid,
            "tile grid has zero cells",
        );
        return Err(BuildError::InputDegenerate("zero-sized voxel grid"));
    }

    let mut voxel_tile = VoxelizedTile {
        cells: vec![VoxelCell::default(); tile_side.pow(2)].into_boxed_slice(),
        tile_side,
    };

    let origin_xz = nav_mesh_settings.get_tile_origin_with_border(tile_coord);
    let tile_origin = Vec3::new(origin_xz.x, nav_mesh_settings.world_bottom_bound, origin_xz.y);

    let mut degenerate_triangles = 0_u32;
    for (triangle, area) in mesh.indices.iter().zip(areas.iter()) {
        let a = Vec3A::from(mesh.positions[triangle[0] as usize] - tile_origin);
        let b = Vec3A::from(mesh.positions[triangle[1] as usize] - tile_origin);
        let c = Vec3A::from(mesh.positions[triangle[2] as usize] - tile_origin);

        if a == b || a == c || b == c {
            degenerate_triangles += 1;
            continue;
        }

        rasterize_triangle(a, b, c, *area, nav_mesh_settings, &mut voxel_tile);
    }

    if degenerate_triangles > 0 {
        ctx.warn(
            "rasterize",
            DiagnosticCode::DegenerateTriangle,
            format!("skipped {degenerate_triangles} degenerate triangles"),
        );
    }

    Ok(voxel_tile)
}

fn rasterize_triangle(
    a: Vec3A,
    b: Vec3A,
    c: Vec3A,
    area: Option<Area>,
    nav_mesh_settings: &NavMeshSettings,
    voxel_tile: &mut VoxelizedTile,
) {
    let tile_side = voxel_tile.tile_side;
    let cell_width = nav_mesh_settings.cell_width;
    let last_cell = (tile_side - 1) as i32;

    let footprint_min = (a.min(b).min(c) / cell_width).as_ivec3();
    let footprint_max = (a.max(b).max(c) / cell_width).as_ivec3();
    if footprint_max.x < 0 || footprint_max.z < 0 || footprint_min.x > last_cell || footprint_min.z > last_cell {
        return;
    }

    let triangle = [a, b, c];

    // Row-major sweep keeps the touched columns cache-adjacent.
    let first_row = footprint_min.z.max(0);
    let last_row = footprint_max.z.min(last_cell);
    for row in first_row..=last_row {
        let slab_near = row as f32 * cell_width;

        let (clipped, count) = clip_polygon(&triangle, 2, slab_near, false);
        let (row_polygon, row_count) = clip_polygon(&clipped[..count], 2, slab_near + cell_width, true);
        if row_count < 3 {
            continue;
        }

        let mut strip_min = row_polygon[0].x;
        let mut strip_max = row_polygon[0].x;
        for vertex in row_polygon[1..row_count].iter() {
            strip_min = strip_min.min(vertex.x);
            strip_max = strip_max.max(vertex.x);
        }
        let first_column = ((strip_min / cell_width) as i32).max(0);
        let last_column = ((strip_max / cell_width) as i32).min(last_cell);

        for column in first_column..=last_column {
            let column_near = column as f32 * cell_width;

            let (clipped, count) = clip_polygon(&row_polygon[..row_count], 0, column_near, false);
            let (cell_polygon, cell_count) =
                clip_polygon(&clipped[..count], 0, column_near + cell_width, true);
            if cell_count < 3 {
                continue;
            }

            let mut lowest = cell_polygon[0].y;
            let mut highest = cell_polygon[0].y;
            for vertex in cell_polygon[1..cell_count].iter() {
                lowest = lowest.min(vertex.y);
                highest = highest.max(vertex.y);
            }

            if highest < 0.0 {
                continue;
            }
            lowest = lowest.max(0.0);

            let span = HeightSpan {
                min: (lowest / nav_mesh_settings.cell_height) as u16,
                max: (highest / nav_mesh_settings.cell_height).ceil() as u16,
                area,
            };

            let cell = &mut voxel_tile.cells[column as usize + row as usize * tile_side];
            insert_span(&mut cell.spans, span, nav_mesh_settings.step_height);
        }
    }
}

/// Clips a convex polygon against the axis-aligned plane ``coordinate = limit``,
/// keeping the requested side. Vertices on the plane survive either way.
fn clip_polygon(input: &[Vec3A], axis: usize, limit: f32, keep_below: bool) -> ([Vec3A; 7], usize) {
    let mut output = [Vec3A::ZERO; 7];
    let mut count = 0;
    let sign = if keep_below { 1.0 } else { -1.0 };

    for (index, vertex) in input.iter().enumerate() {
        let previous = input[(index + input.len() - 1) % input.len()];
        let vertex_side = sign * (vertex[axis] - limit);
        let previous_side = sign * (previous[axis] - limit);

        // Emit the crossing point when the edge straddles the plane.
        if (previous_side < 0.0) != (vertex_side < 0.0) {
            let fraction = previous_side / (previous_side - vertex_side);
            output[count] = previous + (*vertex - previous) * fraction;
            count += 1;
        }
        if vertex_side <= 0.0 {
            output[count] = *vertex;
            count += 1;
        }
    }

    (output, count)
}

/// Inserts a span into a column, merging it with every span it overlaps or
/// touches. The climb-sensitive area rule: tops within ``step_height`` keep
/// the higher area id, otherwise the taller span's area survives. Thin
/// walkable caps stay; ledges a character cannot mount are lost.
fn insert_span(spans: &mut SmallVec<[HeightSpan; 2]>, mut new_span: HeightSpan, step_height: u16) {
    let mut index = 0;
    while index < spans.len() && spans[index].max < new_span.min {
        index += 1;
    }

    // Absorb the whole run of spans the new one makes contact with.
    while index < spans.len() && spans[index].min <= new_span.max {
        let existing = spans.remove(index);

        if existing.max.abs_diff(new_span.max) <= step_height {
            new_span.area = new_span.area.max(existing.area);
        } else if existing.max > new_span.max {
            new_span.area = existing.area;
        }

        new_span.min = new_span.min.min(existing.min);
        new_span.max = new_span.max.max(existing.max);
    }

    spans.insert(index, new_span);
}

/// Reclaims shallow obstacles: a non-walkable span sitting directly on a
/// walkable one with a step of at most ``walkable_climb`` becomes walkable.
pub fn filter_low_hanging_walkable_obstacles(
    voxelized_tile: &mut VoxelizedTile,
    walkable_climb: u16,
) {
    for cell in voxelized_tile.cells.iter_mut() {
        let mut previous_walkable = false;
        let mut previous_area = None;
        let mut previous_max = 0_u16;

        for span in cell.spans.iter_mut() {
            let walkable = span.area.is_some();

            if !walkable && previous_walkable && span.max.abs_diff(previous_max) <= walkable_climb {
                span.area = previous_area;
            }

            // Copy the original state so a chain of non-walkable spans isn't
            // marked walkable one after the other.
            previous_walkable = walkable;
            previous_area = span.area;
            previous_max = span.max;
        }
    }
}

const MAX_HEIGHT: i32 = u16::MAX as i32;

/// Demotes ledge spans to non-walkable: spans whose drop to some neighbour
/// exceeds ``walkable_climb``, or which stand over an uneven drop.
pub fn filter_ledge_spans(
    voxelized_tile: &mut VoxelizedTile,
    walkable_height: u16,
    walkable_climb: u16,
) {
    let tile_side = voxelized_tile.tile_side;
    let walkable_height = i32::from(walkable_height);
    let walkable_climb = i32::from(walkable_climb);

    let mut demoted = Vec::new();

    for (i, cell) in voxelized_tile.cells.iter().enumerate() {
        let row = i / tile_side;
        let column = i % tile_side;

        for (span_index, span) in cell.spans.iter().enumerate() {
            if span.area.is_none() {
                continue;
            }

            let floor = i32::from(span.max);
            let ceiling = cell
                .spans
                .get(span_index + 1)
                .map_or(MAX_HEIGHT, |next| i32::from(next.min));

            // Smallest & the span of accessible neighbour floors.
            let mut min_neighbour_drop = MAX_HEIGHT;
            let mut accessible_min = floor;
            let mut accessible_max = floor;

            let neighbour_indices = [
                (column > 0).then(|| i - 1),
                (row < tile_side - 1).then(|| i + tile_side),
                (column < tile_side - 1).then(|| i + 1),
                (row > 0).then(|| i - tile_side),
            ];

            for neighbour_index in neighbour_indices.into_iter() {
                let Some(neighbour_index) = neighbour_index else {
                    // Tile edge counts as a drop into the void.
                    min_neighbour_drop = -walkable_climb - 1;
                    continue;
                };

                let neighbour_cell = &voxelized_tile.cells[neighbour_index];

                // Gap below the neighbour's first span.
                let mut neighbour_floor = -walkable_climb - 1;
                let mut neighbour_ceiling = neighbour_cell
                    .spans
                    .first()
                    .map_or(MAX_HEIGHT, |first| i32::from(first.min));

                if ceiling.min(neighbour_ceiling) - floor.max(neighbour_floor) > walkable_height {
                    min_neighbour_drop = min_neighbour_drop.min(neighbour_floor - floor);
                }

                for (neighbour_span_index, neighbour_span) in
                    neighbour_cell.spans.iter().enumerate()
                {
                    neighbour_floor = i32::from(neighbour_span.max);
                    neighbour_ceiling = neighbour_cell
                        .spans
                        .get(neighbour_span_index + 1)
                        .map_or(MAX_HEIGHT, |next| i32::from(next.min));

                    // Only consider gaps the character fits in.
                    if ceiling.min(neighbour_ceiling) - floor.max(neighbour_floor)
                        <= walkable_height
                    {
                        continue;
                    }

                    min_neighbour_drop = min_neighbour_drop.min(neighbour_floor - floor);

                    if (neighbour_floor - floor).abs() <= walkable_climb {
                        accessible_min = accessible_min.min(neighbour_floor);
                        accessible_max = accessible_max.max(neighbour_floor);
                    }
                }
            }

            // A drop steeper than the climb, or accessible neighbours that are
            // themselves more than a climb apart, makes this span a ledge.
            if min_neighbour_drop < -walkable_climb
                || accessible_max - accessible_min > walkable_climb
            {
                demoted.push((i, span_index));
            }
        }
    }

    for (cell_index, span_index) in demoted {
        voxelized_tile.cells[cell_index].spans[span_index].area = None;
    }
}

/// Demotes walkable spans without the clearance for a standing character.
pub fn filter_walkable_low_height_spans(voxelized_tile: &mut VoxelizedTile, walkable_height: u16) {
    for cell in voxelized_tile.cells.iter_mut() {
        for i in 0..cell.spans.len() {
            let Some(next_min) = cell.spans.get(i + 1).map(|next| next.min) else {
                continue;
            };

            let span = &mut cell.spans[i];
            if next_min - span.max < walkable_height {
                span.area = None;
            }
        }
    }
}

/// Collapses the solid heightfield into open floor spans with neighbour
/// connectivity. Consumes the [VoxelizedTile].
pub fn build_open_heightfield_tile(
    voxelized_tile: VoxelizedTile,
    nav_mesh_settings: &NavMeshSettings,
) -> OpenTile {
    let mut cells = vec![OpenCell::default(); voxelized_tile.cells.len()];
    let mut areas = Vec::new();
    let mut tile_index = 0;

    // A span's open space reaches up to the next span in the column, or the
    // sky. Too-low gaps never become open spans.
    for (cell, voxel_cell) in cells.iter_mut().zip(voxelized_tile.cells.iter()) {
        for (span_index, span) in voxel_cell.spans.iter().enumerate() {
            let ceiling = voxel_cell.spans.get(span_index + 1).map(|above| above.min);
            if let Some(ceiling) = ceiling {
                if ceiling - span.max < nav_mesh_settings.walkable_height {
                    continue;
                }
            }

            cell.spans.push(OpenSpan {
                min: span.max,
                max: ceiling,
                area: span.area,
                tile_index,
                ..Default::default()
            });
            areas.push(span.area);
            tile_index += 1;
        }
    }

    let span_count = tile_index;
    let mut open_tile = OpenTile {
        cells,
        distances: vec![u16::MAX; span_count].into_boxed_slice(),
        areas: areas.into_boxed_slice(),
        max_distance: 0,
        span_count,
        max_regions: 0,
    };

    link_neighbours(&mut open_tile, nav_mesh_settings);

    open_tile
}

fn link_neighbours(open_tile: &mut OpenTile, nav_mesh_settings: &NavMeshSettings) {
    let tile_side = nav_mesh_settings.get_tile_side_with_border();

    // Resolve all links read-only first, then write them back, so we never
    // hold two cells at once.
    let mut links = vec![[None; 4]; open_tile.span_count];

    for (cell_index, cell) in open_tile.cells.iter().enumerate() {
        let row = cell_index / tile_side;
        let column = cell_index % tile_side;

        let neighbour_cells = [
            (column > 0).then(|| cell_index - 1),
            (row < tile_side - 1).then(|| cell_index + tile_side),
            (column < tile_side - 1).then(|| cell_index + 1),
            (row > 0).then(|| cell_index - tile_side),
        ];

        for span in cell.spans.iter() {
            for (direction, neighbour_cell) in neighbour_cells.iter().enumerate() {
                let Some(neighbour_cell) = neighbour_cell else {
                    continue;
                };

                let linked = open_tile.cells[*neighbour_cell]
                    .spans
                    .iter()
                    .position(|other| {
                        // Clearance between the two floors must fit the
                        // character when both are capped.
                        if let (Some(ceiling), Some(other_ceiling)) = (span.max, other.max) {
                            let headroom =
                                ceiling.min(other_ceiling).abs_diff(span.min.max(other.min));
                            if headroom < nav_mesh_settings.walkable_height {
                                return false;
                            }
                        }

                        other.min.abs_diff(span.min) < nav_mesh_settings.step_height
                    });

                links[span.tile_index][direction] = linked.map(|index| index as u16);
            }
        }
    }

    for cell in open_tile.cells.iter_mut() {
        for span in cell.spans.iter_mut() {
            span.neighbours = links[span.tile_index];
        }
    }
}

/// Follows a span's neighbour link, yielding the neighbouring cell index &
/// span.
pub(crate) fn follow_link<'a>(
    cells: &'a [OpenCell],
    tile_side: usize,
    cell_index: usize,
    span: &OpenSpan,
    direction: usize,
) -> Option<(usize, &'a OpenSpan)> {
    let span_index = span.neighbours[direction]?;
    let neighbour_cell = get_neighbour_index(tile_side, cell_index, direction);

    Some((neighbour_cell, &cells[neighbour_cell].spans[span_index as usize]))
}

/// What counts as the far side of a boundary when seeding the distance field.
enum BoundaryRule {
    /// Un-walkable or missing neighbours are boundaries.
    Walkability,
    /// Any change of area id (or a missing neighbour) is a boundary.
    AreaTransition,
}

fn seed_boundary_distances(open_tile: &mut OpenTile, tile_side: usize, rule: BoundaryRule) {
    let OpenTile {
        ref cells,
        ref mut distances,
        ref areas,
        ..
    } = *open_tile;

    for (cell_index, cell) in cells.iter().enumerate() {
        for span in cell.spans.iter() {
            if matches!(rule, BoundaryRule::Walkability) && areas[span.tile_index].is_none() {
                distances[span.tile_index] = 0;
                continue;
            }

            let mut on_boundary = false;
            for direction in 0..4 {
                match follow_link(cells, tile_side, cell_index, span, direction) {
                    Some((_, neighbour)) => {
                        let same_side = match rule {
                            BoundaryRule::Walkability => areas[neighbour.tile_index].is_some(),
                            BoundaryRule::AreaTransition => {
                                areas[neighbour.tile_index] == areas[span.tile_index]
                            }
                        };
                        if !same_side {
                            on_boundary = true;
                            break;
                        }
                    }
                    None => {
                        on_boundary = true;
                        break;
                    }
                }
            }

            distances[span.tile_index] = if on_boundary { 0 } else { u16::MAX };
        }
    }
}

/// Two relaxation sweeps over the seeded boundary markers: forward visiting
/// the west & north neighbourhood, backward the east & south one. Axial steps
/// cost 2, diagonal steps 3, so distances count double the cell count.
fn relax_distances(open_tile: &mut OpenTile, tile_side: usize) {
    let OpenTile {
        ref cells,
        ref mut distances,
        ..
    } = *open_tile;

    let mut relax = |cell_index: usize, span: &OpenSpan, pairs: [(usize, usize); 2]| {
        let mut best = distances[span.tile_index];

        for (axial, diagonal) in pairs {
            let Some((axial_cell, axial_span)) = follow_link(cells, tile_side, cell_index, span, axial)
            else {
                continue;
            };
            best = best.min(distances[axial_span.tile_index].saturating_add(2));

            if let Some((_, diagonal_span)) =
                follow_link(cells, tile_side, axial_cell, axial_span, diagonal)
            {
                best = best.min(distances[diagonal_span.tile_index].saturating_add(3));
            }
        }

        distances[span.tile_index] = best;
    };

    for (cell_index, cell) in cells.iter().enumerate() {
        for span in cell.spans.iter() {
            relax(cell_index, span, [(0, 3), (3, 2)]);
        }
    }
    for (cell_index, cell) in cells.iter().enumerate().rev() {
        for span in cell.spans.iter() {
            relax(cell_index, span, [(2, 1), (1, 0)]);
        }
    }
}

/// Marks every walkable span within ``walkable_radius`` of a boundary as
/// un-walkable, pulling the nav-mesh back from walls.
pub fn erode_walkable_area(open_tile: &mut OpenTile, nav_mesh_settings: &NavMeshSettings) {
    let tile_side = nav_mesh_settings.get_tile_side_with_border();

    seed_boundary_distances(open_tile, tile_side, BoundaryRule::Walkability);
    relax_distances(open_tile, tile_side);

    // The transform counts 2 per cell.
    let limit = nav_mesh_settings.walkable_radius * 2;
    for (area, distance) in open_tile
        .areas
        .iter_mut()
        .zip(open_tile.distances.iter())
    {
        if *distance < limit {
            *area = None;
        }
    }
}

/// Single-transform variant of [erode_walkable_area] that assigns area ids by
/// distance band, enabling per-agent-radius nav-meshes from one build.
///
/// ``thresholds`` pairs ``(area, radius in cells)`` and must be sorted
/// ascending by radius; spans closer than ``small_radius`` to a boundary
/// become un-walkable, spans within a band get that band's area id.
pub fn erode_and_mark_walkable_areas(
    open_tile: &mut OpenTile,
    nav_mesh_settings: &NavMeshSettings,
    small_radius: u16,
    thresholds: &[(Area, u16)],
) {
    let tile_side = nav_mesh_settings.get_tile_side_with_border();

    seed_boundary_distances(open_tile, tile_side, BoundaryRule::Walkability);
    relax_distances(open_tile, tile_side);

    for (area, distance) in open_tile
        .areas
        .iter_mut()
        .zip(open_tile.distances.iter())
    {
        if area.is_none() {
            continue;
        }

        if *distance < small_radius * 2 {
            *area = None;
            continue;
        }

        if let Some((band_area, _)) = thresholds
            .iter()
            .find(|(_, radius)| *distance < radius * 2)
        {
            *area = Some(*band_area);
        }
    }
}

/// Computes the distance-to-area-boundary field consumed by the watershed
/// partitioner.
pub fn calculate_distance_field(open_tile: &mut OpenTile, nav_mesh_settings: &NavMeshSettings) {
    let tile_side = nav_mesh_settings.get_tile_side_with_border();

    seed_boundary_distances(open_tile, tile_side, BoundaryRule::AreaTransition);
    relax_distances(open_tile, tile_side);

    open_tile.max_distance = open_tile.distances.iter().copied().max().unwrap_or(0);

    blur_distances(open_tile, tile_side);
}

/// 3x3 box blur over the distance field. Spans right at a boundary keep their
/// distance so the watershed seeds stay put.
fn blur_distances(open_tile: &mut OpenTile, tile_side: usize) {
    const KEEP_THRESHOLD: u16 = 2;

    let mut blurred = open_tile.distances.clone();
    let OpenTile {
        ref cells,
        ref distances,
        ..
    } = *open_tile;

    for (cell_index, cell) in cells.iter().enumerate() {
        for span in cell.spans.iter() {
            let centre = distances[span.tile_index];
            if centre <= KEEP_THRESHOLD {
                continue;
            }

            // Missing neighbours contribute the centre value.
            let mut total = centre;
            for direction in 0..4 {
                match follow_link(cells, tile_side, cell_index, span, direction) {
                    Some((axial_cell, axial_span)) => {
                        total += distances[axial_span.tile_index];

                        let corner_direction = (direction + 1) & 0x3;
                        total += match follow_link(
                            cells,
                            tile_side,
                            axial_cell,
                            axial_span,
                            corner_direction,
                        ) {
                            Some((_, corner_span)) => distances[corner_span.tile_index],
                            None => centre,
                        };
                    }
                    None => total += centre * 2,
                }
            }

            blurred[span.tile_index] = (total + 5) / 9;
        }
    }

    open_tile.distances = blurred;
}

/// 3x3 median filter over span area ids. Smooths out noisy area marking from
/// rasterization; un-walkable spans are left untouched.
pub fn median_filter_walkable_area(open_tile: &mut OpenTile, nav_mesh_settings: &NavMeshSettings) {
    let tile_side = nav_mesh_settings.get_tile_side_with_border();

    let mut filtered = open_tile.areas.clone();

    for (cell_index, cell) in open_tile.cells.iter().enumerate() {
        for span in cell.spans.iter() {
            let area = open_tile.areas[span.tile_index];
            if area.is_none() {
                continue;
            }

            let mut neighbourhood = [area; 9];

            for direction in 0..4 {
                let Some((axial_cell, axial_span)) =
                    follow_link(&open_tile.cells, tile_side, cell_index, span, direction)
                else {
                    continue;
                };
                neighbourhood[direction * 2] = open_tile.areas[axial_span.tile_index];

                let corner_direction = (direction + 1) & 0x3;
                if let Some((_, corner_span)) = follow_link(
                    &open_tile.cells,
                    tile_side,
                    axial_cell,
                    axial_span,
                    corner_direction,
                ) {
                    neighbourhood[direction * 2 + 1] = open_tile.areas[corner_span.tile_index];
                }
            }

            neighbourhood.sort_unstable();
            filtered[span.tile_index] = neighbourhood[4];
        }
    }

    open_tile.areas = filtered;

    for cell in open_tile.cells.iter_mut() {
        for span in cell.spans.iter_mut() {
            span.area = open_tile.areas[span.tile_index];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TriangleMesh;
    use std::num::{NonZeroU16, NonZeroU8};

    fn test_settings() -> NavMeshSettings {
        NavMeshSettings {
            cell_width: 0.5,
            cell_height: 0.25,
            tile_width: NonZeroU16::new(20).unwrap(),
            border_size: 0,
            world_half_extents: 10.0,
            world_bottom_bound: 0.0,
            max_traversable_slope_radians: 45.0_f32.to_radians(),
            walkable_height: 4,
            walkable_radius: 1,
            step_height: 2,
            min_region_area: 0,
            max_region_area_to_merge_into: 100,
            max_edge_length: 0,
            max_contour_simplification_error: 1.1,
            contour_tessellation: 0,
            max_vertices_per_polygon: NonZeroU8::new(6).unwrap(),
            partition_strategy: crate::PartitionStrategy::Watershed,
            detail: crate::DetailMeshSettings {
                sample_distance: 0,
                max_sample_error: 1.0,
            },
        }
    }

    fn floor_quad() -> (Vec<Vec3>, Vec<[u32; 3]>) {
        let positions = vec![
            Vec3::new(-10.0, 0.25, -10.0),
            Vec3::new(10.0, 0.25, -10.0),
            Vec3::new(10.0, 0.25, 10.0),
            Vec3::new(-10.0, 0.25, 10.0),
        ];
        let indices = vec![[0, 2, 1], [0, 3, 2]];
        (positions, indices)
    }

    #[test]
    fn slope_marking_splits_floor_and_wall() {
        let positions = vec![
            // Flat triangle.
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 1.0),
            // Vertical triangle.
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(0.0, 1.0, 1.0),
        ];
        let indices = vec![[0, 1, 2], [3, 4, 5]];

        let areas = mark_walkable_triangles(&positions, &indices, 45.0_f32.to_radians());
        assert_eq!(areas, vec![Some(Area::WALKABLE), None]);
    }

    #[test]
    fn rasterized_floor_covers_every_column() {
        let settings = test_settings();
        let (positions, indices) = floor_quad();
        let areas = mark_walkable_triangles(&positions, &indices, 45.0_f32.to_radians());

        let mut ctx = BuildContext::new();
        let mesh = TriangleMesh {
            positions: &positions,
            indices: &indices,
            areas: None,
        };
        let tile =
            build_heightfield_tile(&mut ctx, UVec2::ZERO, &mesh, &areas, &settings).unwrap();

        for cell in tile.cells.iter() {
            assert_eq!(cell.spans.len(), 1);
            assert!(cell.spans[0].area.is_some());
        }
    }

    #[test]
    fn spans_in_a_column_stay_sorted_and_disjoint() {
        let settings = test_settings();
        // Two floors stacked 5m apart plus one overlapping the lower one.
        let mut positions = Vec::new();
        let mut indices = Vec::new();
        for (base, y) in [(0, 0.25), (4, 0.3), (8, 5.0)] {
            positions.extend([
                Vec3::new(-10.0, y, -10.0),
                Vec3::new(10.0, y, -10.0),
                Vec3::new(10.0, y, 10.0),
                Vec3::new(-10.0, y, 10.0),
            ]);
            indices.extend([[base, base + 2, base + 1], [base, base + 3, base + 2]]);
        }
        let areas = vec![Some(Area::WALKABLE); indices.len()];

        let mut ctx = BuildContext::new();
        let mesh = TriangleMesh {
            positions: &positions,
            indices: &indices,
            areas: None,
        };
        let tile =
            build_heightfield_tile(&mut ctx, UVec2::ZERO, &mesh, &areas, &settings).unwrap();

        for cell in tile.cells.iter() {
            // The two low floors merged, the high floor stays separate.
            assert_eq!(cell.spans.len(), 2);
            for window in cell.spans.windows(2) {
                assert!(window[0].max < window[1].min);
            }
        }
    }

    #[test]
    fn low_hanging_obstacle_is_reclaimed() {
        let mut tile = VoxelizedTile {
            cells: vec![VoxelCell::default(); 4].into_boxed_slice(),
            tile_side: 2,
        };
        tile.cells[0].spans.push(HeightSpan {
            min: 0,
            max: 2,
            area: Some(Area::WALKABLE),
        });
        tile.cells[0].spans.push(HeightSpan {
            min: 2,
            max: 3,
            area: None,
        });

        filter_low_hanging_walkable_obstacles(&mut tile, 2);

        assert_eq!(tile.cells[0].spans[1].area, Some(Area::WALKABLE));
    }

    #[test]
    fn low_clearance_spans_are_demoted() {
        let mut tile = VoxelizedTile {
            cells: vec![VoxelCell::default(); 1].into_boxed_slice(),
            tile_side: 1,
        };
        tile.cells[0].spans.push(HeightSpan {
            min: 0,
            max: 2,
            area: Some(Area::WALKABLE),
        });
        tile.cells[0].spans.push(HeightSpan {
            min: 4,
            max: 6,
            area: Some(Area::WALKABLE),
        });

        filter_walkable_low_height_spans(&mut tile, 4);

        assert_eq!(tile.cells[0].spans[0].area, None);
        assert_eq!(tile.cells[0].spans[1].area, Some(Area::WALKABLE));
    }

    #[test]
    fn ledge_spans_are_demoted() {
        let settings = test_settings();
        let (mut positions, mut indices) = floor_quad();
        // A raised platform in the middle, 1m above the floor (4 cells > step_height).
        let base = positions.len() as u32;
        positions.extend([
            Vec3::new(-2.0, 1.25, -2.0),
            Vec3::new(2.0, 1.25, -2.0),
            Vec3::new(2.0, 1.25, 2.0),
            Vec3::new(-2.0, 1.25, 2.0),
        ]);
        indices.extend([[base, base + 2, base + 1], [base, base + 3, base + 2]]);
        let areas = vec![Some(Area::WALKABLE); indices.len()];

        let mut ctx = BuildContext::new();
        let mesh = TriangleMesh {
            positions: &positions,
            indices: &indices,
            areas: None,
        };
        let mut tile =
            build_heightfield_tile(&mut ctx, UVec2::ZERO, &mesh, &areas, &settings).unwrap();

        let walkable_platform_spans_before = tile
            .cells
            .iter()
            .flat_map(|cell| cell.spans.iter())
            .filter(|span| span.max >= 5 && span.area.is_some())
            .count();

        filter_ledge_spans(&mut tile, settings.walkable_height, settings.step_height);

        // Platform rim columns stand over a drop greater than the climb and get
        // demoted; the platform interior survives.
        let walkable_platform_spans_after = tile
            .cells
            .iter()
            .flat_map(|cell| cell.spans.iter())
            .filter(|span| span.max >= 5 && span.area.is_some())
            .count();

        assert!(walkable_platform_spans_after < walkable_platform_spans_before);
        assert!(walkable_platform_spans_after > 0);
    }

    #[test]
    fn open_tile_links_are_symmetric() {
        let settings = test_settings();
        let (positions, indices) = floor_quad();
        let areas = mark_walkable_triangles(&positions, &indices, 45.0_f32.to_radians());

        let mut ctx = BuildContext::new();
        let mesh = TriangleMesh {
            positions: &positions,
            indices: &indices,
            areas: None,
        };
        let tile =
            build_heightfield_tile(&mut ctx, UVec2::ZERO, &mesh, &areas, &settings).unwrap();
        let open_tile = build_open_heightfield_tile(tile, &settings);

        let tile_side = settings.get_tile_side_with_border();
        for (i, cell) in open_tile.cells.iter().enumerate() {
            for span in cell.spans.iter() {
                for (dir, neighbour) in span.neighbours.iter().enumerate() {
                    let Some(neighbour) = neighbour else {
                        continue;
                    };

                    let neighbour_index = get_neighbour_index(tile_side, i, dir);
                    let neighbour_span =
                        &open_tile.cells[neighbour_index].spans[*neighbour as usize];
                    let reverse_dir = (dir + 2) & 0x3;

                    assert!(neighbour_span.neighbours[reverse_dir].is_some());
                }
            }
        }
    }

    #[test]
    fn erosion_respects_walkable_radius() {
        let settings = test_settings();
        let (positions, indices) = floor_quad();
        let areas = mark_walkable_triangles(&positions, &indices, 45.0_f32.to_radians());

        let mut ctx = BuildContext::new();
        let mesh = TriangleMesh {
            positions: &positions,
            indices: &indices,
            areas: None,
        };
        let tile =
            build_heightfield_tile(&mut ctx, UVec2::ZERO, &mesh, &areas, &settings).unwrap();
        let mut open_tile = build_open_heightfield_tile(tile, &settings);
        erode_walkable_area(&mut open_tile, &settings);

        let tile_side = settings.get_tile_side_with_border();
        for (i, cell) in open_tile.cells.iter().enumerate() {
            let row = i / tile_side;
            let column = i % tile_side;
            let on_rim = row == 0 || column == 0 || row == tile_side - 1 || column == tile_side - 1;

            for span in cell.spans.iter() {
                if on_rim {
                    assert!(open_tile.areas[span.tile_index].is_none());
                }
            }
        }

        // The interior survives.
        let centre = tile_side / 2 + (tile_side / 2) * tile_side;
        assert!(open_tile.cells[centre]
            .spans
            .iter()
            .all(|span| open_tile.areas[span.tile_index].is_some()));
    }

    #[test]
    fn distance_banded_erosion_assigns_area_ids() {
        let settings = test_settings();
        let (positions, indices) = floor_quad();
        let areas = mark_walkable_triangles(&positions, &indices, 45.0_f32.to_radians());

        let mut ctx = BuildContext::new();
        let mesh = TriangleMesh {
            positions: &positions,
            indices: &indices,
            areas: None,
        };
        let tile =
            build_heightfield_tile(&mut ctx, UVec2::ZERO, &mesh, &areas, &settings).unwrap();
        let mut open_tile = build_open_heightfield_tile(tile, &settings);

        let narrow = Area(10);
        erode_and_mark_walkable_areas(&mut open_tile, &settings, 1, &[(narrow, 3)]);

        let tile_side = settings.get_tile_side_with_border();
        // One cell in from the rim is in the narrow band.
        let near_rim = 1 + tile_side;
        assert!(open_tile.cells[near_rim]
            .spans
            .iter()
            .all(|span| open_tile.areas[span.tile_index] == Some(narrow)));

        // Centre keeps its original area.
        let centre = tile_side / 2 + (tile_side / 2) * tile_side;
        assert!(open_tile.cells[centre]
            .spans
            .iter()
            .all(|span| open_tile.areas[span.tile_index] == Some(Area::WALKABLE)));
    }

    #[test]
    fn median_filter_removes_lone_area_speckle() {
        let settings = test_settings();
        let (positions, indices) = floor_quad();
        let areas = mark_walkable_triangles(&positions, &indices, 45.0_f32.to_radians());

        let mut ctx = BuildContext::new();
        let mesh = TriangleMesh {
            positions: &positions,
            indices: &indices,
            areas: None,
        };
        let tile =
            build_heightfield_tile(&mut ctx, UVec2::ZERO, &mesh, &areas, &settings).unwrap();
        let mut open_tile = build_open_heightfield_tile(tile, &settings);

        let tile_side = settings.get_tile_side_with_border();
        let centre = tile_side / 2 + (tile_side / 2) * tile_side;
        let speckle_index = open_tile.cells[centre].spans[0].tile_index;
        open_tile.areas[speckle_index] = Some(Area(7));

        median_filter_walkable_area(&mut open_tile, &settings);

        assert_eq!(open_tile.areas[speckle_index], Some(Area::WALKABLE));
    }
}
