//! Tracing & simplification of region boundaries into closed vertex rings.

use bevy::math::{IVec2, UVec4};

use crate::{
    get_neighbour_index,
    heightfields::{follow_link, OpenSpan, OpenTile},
    Area, CONTOUR_TESS_AREA_EDGES, CONTOUR_TESS_WALL_EDGES,
};

use super::math::{in_cone, intersect};
use super::{NavMeshSettings, FLAG_BORDER_VERTEX, MASK_CONTOUR_REGION};

/// The boundary of one region. Vertices are in tile-local cell coordinates
/// with the ``border_size`` margin already removed; each vertex' ``w`` packs
/// the neighbouring region id & the border-vertex flag.
#[derive(Default, Clone, Debug)]
pub struct Contour {
    /// The simplified ring the polygon mesh is built from.
    pub vertices: Vec<UVec4>,
    /// The raw stair-step ring the simplified ring was derived from.
    pub raw_vertices: Vec<UVec4>,
    pub region: u16,
    /// Unlike [OpenSpan] this can't be ``None`` as ``None`` spans are ignored when generating contours.
    pub area: Area,
}

#[derive(Default)]
pub struct ContourSet {
    pub contours: Vec<Contour>,
}

pub fn build_contours(open_tile: &OpenTile, nav_mesh_settings: &NavMeshSettings) -> ContourSet {
    let tile_side = nav_mesh_settings.get_tile_side_with_border();
    let mut contour_set = ContourSet {
        contours: Vec::with_capacity(open_tile.max_regions.max(8).into()),
    };

    let mut boundary_edges = mark_region_boundaries(open_tile, tile_side);

    let mut raw_ring = Vec::with_capacity(256);
    let mut simplified_ring = Vec::with_capacity(64);

    for (cell_index, cell) in open_tile.cells.iter().enumerate() {
        for (span_index, span) in cell.spans.iter().enumerate() {
            let edge_mask = boundary_edges[span.tile_index];
            if edge_mask == 0 || edge_mask == 0b1111 {
                // Interior spans & islands of a single span have no ring to walk.
                boundary_edges[span.tile_index] = 0;
                continue;
            }
            let Some(area) = open_tile.areas[span.tile_index] else {
                continue;
            };
            if span.region == 0 {
                continue;
            }

            raw_ring.clear();
            trace_boundary(
                open_tile,
                nav_mesh_settings,
                cell_index,
                span_index,
                &mut boundary_edges,
                &mut raw_ring,
            );

            simplified_ring.clear();
            simplify_boundary(&raw_ring, &mut simplified_ring, nav_mesh_settings);
            drop_duplicate_xz_vertices(&mut simplified_ring);

            if simplified_ring.len() >= 3 {
                contour_set.contours.push(Contour {
                    vertices: strip_border_offset(&simplified_ring, nav_mesh_settings),
                    raw_vertices: strip_border_offset(&raw_ring, nav_mesh_settings),
                    region: span.region,
                    area,
                });
            }
        }
    }

    stitch_holes_into_outlines(&mut contour_set, open_tile.max_regions);

    contour_set
}

/// For every span, a bitmask of the edges bordering a different region.
fn mark_region_boundaries(open_tile: &OpenTile, tile_side: usize) -> Vec<u8> {
    let mut masks = vec![0_u8; open_tile.span_count];

    for (cell_index, cell) in open_tile.cells.iter().enumerate() {
        for span in cell.spans.iter() {
            let mut mask = 0;

            for direction in 0..4 {
                let neighbour_region =
                    follow_link(&open_tile.cells, tile_side, cell_index, span, direction)
                        .map_or(0, |(_, neighbour)| neighbour.region);

                if neighbour_region != span.region {
                    mask |= 1 << direction;
                }
            }

            masks[span.tile_index] = mask;
        }
    }

    masks
}

/// (dx, dz) from a cell's origin to the corner vertex each direction emits.
const CORNER_OFFSET: [(usize, usize); 4] = [(0, 1), (1, 1), (1, 0), (0, 0)];

/// Walks one region boundary clockwise, consuming its edge-mask bits &
/// emitting a raw vertex per boundary edge. ``w`` carries the bordering
/// region id plus [FLAG_BORDER_VERTEX] on the tile's border ring.
fn trace_boundary(
    open_tile: &OpenTile,
    nav_mesh_settings: &NavMeshSettings,
    mut cell_index: usize,
    mut span_index: usize,
    boundary_edges: &mut [u8],
    ring: &mut Vec<UVec4>,
) {
    let tile_side = nav_mesh_settings.get_tile_side_with_border();
    let border = nav_mesh_settings.get_border_side();

    let Some(mut direction) = (0..4).find(|direction| {
        let span = &open_tile.cells[cell_index].spans[span_index];
        boundary_edges[span.tile_index] & (1 << direction) != 0
    }) else {
        return;
    };
    let start = (cell_index, span_index, direction);

    loop {
        let span = &open_tile.cells[cell_index].spans[span_index];

        if boundary_edges[span.tile_index] & (1 << direction) != 0 {
            // Boundary edge: emit its corner & turn clockwise.
            let row = cell_index / tile_side;
            let column = cell_index % tile_side;
            let (dx, dz) = CORNER_OFFSET[direction];
            let corner_x = column + dx;
            let corner_z = row + dz;
            let corner_y = corner_floor_height(open_tile, tile_side, cell_index, span, direction);

            let mut tag =
                follow_link(&open_tile.cells, tile_side, cell_index, span, direction)
                    .map_or(0, |(_, neighbour)| u32::from(neighbour.region));

            // Vertices on the border ring boundary get flagged so the mesher
            // leaves their portals to cross-tile stitching.
            if border > 0
                && (corner_x == border
                    || corner_x == tile_side - border
                    || corner_z == border
                    || corner_z == tile_side - border)
            {
                tag |= FLAG_BORDER_VERTEX;
            }

            ring.push(UVec4::new(
                corner_x as u32,
                corner_y as u32,
                corner_z as u32,
                tag,
            ));

            boundary_edges[span.tile_index] &= !(1 << direction);
            direction = (direction + 1) & 0x3;
        } else {
            // Connected edge: step through it & turn counter-clockwise.
            let Some(linked) = span.neighbours[direction] else {
                debug_assert!(false, "connected boundary edge without a link");
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
}

/// Highest floor around the corner between ``direction`` & the next direction
/// clockwise, sampled from this span & up to three spans around the corner.
fn corner_floor_height(
    open_tile: &OpenTile,
    tile_side: usize,
    cell_index: usize,
    span: &OpenSpan,
    direction: usize,
) -> u16 {
    let next_direction = (direction + 1) & 0x3;
    let mut height = span.min;

    // Probe both ways around the corner; the diagonal may only be reachable
    // through one of them.
    for (first, second) in [(direction, next_direction), (next_direction, direction)] {
        let Some((step_cell, step_span)) =
            follow_link(&open_tile.cells, tile_side, cell_index, span, first)
        else {
            continue;
        };
        height = height.max(step_span.min);

        if let Some((_, corner_span)) =
            follow_link(&open_tile.cells, tile_side, step_cell, step_span, second)
        {
            height = height.max(corner_span.min);
        }
    }

    height
}

fn simplify_boundary(raw: &[UVec4], simplified: &mut Vec<UVec4>, nav_mesh_settings: &NavMeshSettings) {
    seed_key_vertices(raw, simplified);
    insert_deviating_vertices(
        raw,
        simplified,
        nav_mesh_settings.max_contour_simplification_error,
    );
    if nav_mesh_settings.max_edge_length > 0 && nav_mesh_settings.contour_tessellation != 0 {
        split_overlong_edges(
            raw,
            simplified,
            nav_mesh_settings.max_edge_length,
            nav_mesh_settings.contour_tessellation,
        );
    }
    resolve_vertex_tags(raw, simplified);
}

/// Initial simplified ring: every corner where the bordering region changes,
/// or the two XZ extremes when the whole ring is wall.
///
/// While simplifying, a kept vertex' ``w`` holds its raw-ring index.
fn seed_key_vertices(raw: &[UVec4], simplified: &mut Vec<UVec4>) {
    let has_portals = raw
        .iter()
        .any(|vertex| vertex.w & MASK_CONTOUR_REGION != 0);

    if has_portals {
        for (index, vertex) in raw.iter().enumerate() {
            let next = raw[(index + 1) % raw.len()];
            if vertex.w & MASK_CONTOUR_REGION != next.w & MASK_CONTOUR_REGION {
                simplified.push(vertex.with_w(index as u32));
            }
        }
        return;
    }

    let mut lower_left = 0;
    let mut upper_right = 0;
    for (index, vertex) in raw.iter().enumerate() {
        if (vertex.x, vertex.z) < (raw[lower_left].x, raw[lower_left].z) {
            lower_left = index;
        }
        if (vertex.x, vertex.z) > (raw[upper_right].x, raw[upper_right].z) {
            upper_right = index;
        }
    }

    simplified.push(raw[lower_left].with_w(lower_left as u32));
    simplified.push(raw[upper_right].with_w(upper_right as u32));
}

/// Repeatedly inserts, between neighbouring kept vertices, the raw wall vertex
/// deviating most from the chord, until every deviation is within the error.
fn insert_deviating_vertices(raw: &[UVec4], simplified: &mut Vec<UVec4>, max_error: f32) {
    let raw_count = raw.len() as u32;
    let max_error_squared = max_error * max_error;

    let mut segment = 0;
    while segment < simplified.len() {
        let from = simplified[segment];
        let to = simplified[(segment + 1) % simplified.len()];

        // Scan low-XZ end first so both sides of a shared region edge pick
        // identical vertices; ties resolve to the earlier raw index.
        let (start, step, end) = if (to.x, to.z) > (from.x, from.z) {
            ((from.w + 1) % raw_count, 1, to.w)
        } else {
            ((to.w + raw_count - 1) % raw_count, raw_count - 1, from.w)
        };

        let mut best_deviation = 0.0;
        let mut best_vertex = None;

        // Portal stretches keep their region-change corners as-is.
        if raw[start as usize].w & MASK_CONTOUR_REGION == 0 {
            let chord_a = IVec2::new(from.x as i32, from.z as i32);
            let chord_b = IVec2::new(to.x as i32, to.z as i32);

            let mut cursor = start;
            while cursor != end {
                let point = IVec2::new(raw[cursor as usize].x as i32, raw[cursor as usize].z as i32);
                let deviation = squared_point_segment_distance_2d(point, chord_a, chord_b);
                if deviation > best_deviation {
                    best_deviation = deviation;
                    best_vertex = Some(cursor);
                }
                cursor = (cursor + step) % raw_count;
            }
        }

        match best_vertex {
            Some(index) if best_deviation > max_error_squared => {
                simplified.insert(segment + 1, raw[index as usize].with_w(index));
            }
            _ => segment += 1,
        }
    }
}

/// Splits kept edges longer than ``max_edge_length`` at the raw vertex in
/// their middle, for edge kinds the tessellation flags ask for.
fn split_overlong_edges(
    raw: &[UVec4],
    simplified: &mut Vec<UVec4>,
    max_edge_length: u16,
    tessellation_flags: u8,
) {
    let raw_count = raw.len();
    let limit_squared = u32::from(max_edge_length) * u32::from(max_edge_length);

    let mut segment = 0;
    while segment < simplified.len() {
        let from = simplified[segment];
        let to = simplified[(segment + 1) % simplified.len()];

        // The raw vertex after `from` tells wall edges from portal edges.
        let is_wall = raw[(from.w as usize + 1) % raw_count].w & MASK_CONTOUR_REGION == 0;
        let should_split = if is_wall {
            tessellation_flags & CONTOUR_TESS_WALL_EDGES != 0
        } else {
            tessellation_flags & CONTOUR_TESS_AREA_EDGES != 0
        };

        let mut midpoint = None;
        if should_split {
            let dx = to.x.abs_diff(from.x);
            let dz = to.z.abs_diff(from.z);

            if dx * dx + dz * dz > limit_squared {
                let raw_span = if to.w < from.w {
                    to.w as usize + raw_count - from.w as usize
                } else {
                    (to.w - from.w) as usize
                };

                if raw_span > 1 {
                    // Round towards the low-XZ end, matching the neighbour's
                    // split of a shared edge.
                    midpoint = Some(if (to.x, to.z) > (from.x, from.z) {
                        (from.w as usize + raw_span / 2) % raw_count
                    } else {
                        (from.w as usize + (raw_span + 1) / 2) % raw_count
                    });
                }
            }
        }

        match midpoint {
            Some(index) => simplified.insert(segment + 1, raw[index].with_w(index as u32)),
            None => segment += 1,
        }
    }
}

/// Swaps each kept vertex' scratch raw index for its final tag: the region
/// behind the outgoing edge plus the vertex' original border flag.
fn resolve_vertex_tags(raw: &[UVec4], simplified: &mut [UVec4]) {
    for vertex in simplified.iter_mut() {
        let edge_region = raw[(vertex.w as usize + 1) % raw.len()].w & MASK_CONTOUR_REGION;
        let border_flag = raw[vertex.w as usize].w & FLAG_BORDER_VERTEX;
        vertex.w = edge_region | border_flag;
    }
}

/// Removes vertices coinciding with their successor on the XZ-plane.
fn drop_duplicate_xz_vertices(ring: &mut Vec<UVec4>) {
    let mut index = 0;
    while index < ring.len() && ring.len() > 1 {
        let next = (index + 1) % ring.len();
        if same_column(ring[index], ring[next]) {
            ring.remove(next);
            index = index.min(ring.len().saturating_sub(1));
        } else {
            index += 1;
        }
    }
}

/// Shifts vertices out of border space so the mesh lands in ``[0, tile_width]``.
fn strip_border_offset(vertices: &[UVec4], nav_mesh_settings: &NavMeshSettings) -> Vec<UVec4> {
    let border = nav_mesh_settings.get_border_side() as u32;
    let tile_width = u32::from(nav_mesh_settings.tile_width.get());

    vertices
        .iter()
        .map(|vertex| {
            UVec4::new(
                vertex.x.saturating_sub(border).min(tile_width),
                vertex.y,
                vertex.z.saturating_sub(border).min(tile_width),
                vertex.w,
            )
        })
        .collect()
}

fn same_column(a: UVec4, b: UVec4) -> bool {
    a.x == b.x && a.z == b.z
}

/// Twice the signed XZ area of a ring; negative for hole winding.
fn signed_ring_area_doubled(ring: &[UVec4]) -> i64 {
    let mut doubled = 0_i64;
    for (index, vertex) in ring.iter().enumerate() {
        let next = ring[(index + 1) % ring.len()];
        doubled += i64::from(next.x) * i64::from(vertex.z) - i64::from(vertex.x) * i64::from(next.z);
    }
    doubled
}

/// A hole ring waiting to be spliced into its region's outline.
struct HoleContour {
    contour: Contour,
    leftmost_vertex: usize,
}

impl HoleContour {
    fn new(contour: Contour) -> Self {
        let leftmost_vertex = contour
            .vertices
            .iter()
            .enumerate()
            .min_by_key(|(_, vertex)| (vertex.x, vertex.z))
            .map_or(0, |(index, _)| index);

        Self {
            contour,
            leftmost_vertex,
        }
    }

    fn key(&self) -> (u32, u32) {
        let vertex = self.contour.vertices[self.leftmost_vertex];
        (vertex.x, vertex.z)
    }
}

/// Watershed edge cases can leave a region with hole-wound rings; splice each
/// into the region's outline through a non-crossing bridge.
fn stitch_holes_into_outlines(contour_set: &mut ContourSet, max_regions: u16) {
    let any_holes = contour_set
        .contours
        .iter()
        .any(|contour| signed_ring_area_doubled(&contour.vertices) < 0);
    if !any_holes {
        return;
    }

    let region_slots = usize::from(max_regions) + 1;
    let mut outlines: Vec<Option<Contour>> = Vec::with_capacity(region_slots);
    outlines.resize_with(region_slots, || None);
    let mut holes: Vec<Vec<HoleContour>> = Vec::with_capacity(region_slots);
    holes.resize_with(region_slots, Vec::new);

    for contour in contour_set.contours.drain(..) {
        let slot = contour.region as usize;
        if signed_ring_area_doubled(&contour.vertices) < 0 {
            holes[slot].push(HoleContour::new(contour));
        } else {
            outlines[slot] = Some(contour);
        }
    }

    for (outline, mut region_holes) in outlines.into_iter().zip(holes) {
        let Some(mut outline) = outline else {
            // A hole without an outline is degenerate output; drop it.
            continue;
        };

        if !region_holes.is_empty() {
            region_holes.sort_unstable_by_key(HoleContour::key);
            merge_holes_into(&mut outline, &region_holes);
        }

        contour_set.contours.push(outline);
    }
}

fn merge_holes_into(outline: &mut Contour, holes: &[HoleContour]) {
    for (hole_index, hole) in holes.iter().enumerate() {
        let hole_vertices = &hole.contour.vertices;
        let mut bridge = None;

        // Try every hole vertex as the bridge foot, left-most first.
        for attempt in 0..hole_vertices.len() {
            let foot_index = (hole.leftmost_vertex + attempt) % hole_vertices.len();
            let foot = hole_vertices[foot_index];

            // Visible outline vertices, closest first.
            let mut candidates: Vec<(u32, usize)> = outline
                .vertices
                .iter()
                .enumerate()
                .filter(|(outline_index, _)| in_cone(*outline_index, &outline.vertices, foot))
                .map(|(outline_index, vertex)| {
                    let dx = vertex.x.abs_diff(foot.x);
                    let dz = vertex.z.abs_diff(foot.z);
                    (dx * dx + dz * dz, outline_index)
                })
                .collect();
            candidates.sort_unstable();

            bridge = candidates.into_iter().find_map(|(_, outline_index)| {
                let anchor = outline.vertices[outline_index];

                let blocked = diagonal_crosses_ring(
                    anchor,
                    foot,
                    &outline.vertices,
                    Some(outline_index),
                ) || holes[hole_index..].iter().any(|other| {
                    diagonal_crosses_ring(anchor, foot, &other.contour.vertices, None)
                });

                (!blocked).then_some((outline_index, foot_index))
            });

            if bridge.is_some() {
                break;
            }
        }

        if let Some((outline_index, foot_index)) = bridge {
            splice_hole(outline, &hole.contour, outline_index, foot_index);
        }
    }
}

/// Whether the segment ``a -> b`` crosses any ring edge. The two edges meeting
/// ``ring_vertex`` are exempt, as are edges sharing a column with an endpoint.
fn diagonal_crosses_ring(a: UVec4, b: UVec4, ring: &[UVec4], ring_vertex: Option<usize>) -> bool {
    (0..ring.len()).any(|edge| {
        let next = (edge + 1) % ring.len();
        if ring_vertex.is_some_and(|vertex| edge == vertex || next == vertex) {
            return false;
        }

        let from = ring[edge];
        let to = ring[next];
        if same_column(a, from) || same_column(to, from) || same_column(to, a) {
            return false;
        }

        intersect(a.as_ivec4(), b.as_ivec4(), from.as_ivec4(), to.as_ivec4())
    })
}

/// Splices a hole ring into the outline, doubling the bridge vertices so the
/// ring stays closed along the cut.
fn splice_hole(outline: &mut Contour, hole: &Contour, outline_vertex: usize, hole_vertex: usize) {
    let mut spliced = Vec::with_capacity(outline.vertices.len() + hole.vertices.len() + 2);

    spliced.extend(
        outline
            .vertices
            .iter()
            .cycle()
            .skip(outline_vertex)
            .take(outline.vertices.len() + 1)
            .copied(),
    );
    spliced.extend(
        hole.vertices
            .iter()
            .cycle()
            .skip(hole_vertex)
            .take(hole.vertices.len() + 1)
            .copied(),
    );

    outline.vertices = spliced;
}

/// Squared distance from ``point`` to the segment ``a -> b`` on the XZ-plane.
pub(crate) fn squared_point_segment_distance_2d(point: IVec2, a: IVec2, b: IVec2) -> f32 {
    let chord = (b - a).as_vec2();
    let offset = (point - a).as_vec2();

    let length_squared = chord.length_squared();
    let t = if length_squared > 0.0 {
        (offset.dot(chord) / length_squared).clamp(0.0, 1.0)
    } else {
        0.0
    };

    (offset - chord * t).length_squared()
}
