//! Triangulation of contours & merging into convex polygons of up to
//! [NavMeshSettings::max_vertices_per_polygon] vertices.

use std::collections::HashMap;

use bevy::math::{IVec4, UVec3, UVec4};

use crate::{
    context::{BuildContext, DiagnosticCode},
    contour::ContourSet,
    math::{intersect, intersect_prop, left, left_on},
    Area, NULL_INDEX,
};

use super::NavMeshSettings;

/// Hard cap of vertices in a single polygon; the configured
/// ``max_vertices_per_polygon`` may be lower but never higher.
pub const MAX_VERTICES_PER_POLYGON: usize = 12;

/// Build-time polygon mesh in tile-local cell coordinates.
///
/// Each polygon is a [NULL_INDEX]-padded slot of vertex indices with parallel
/// edge-connection, region, area & flag entries.
#[derive(Default, Debug)]
pub struct PolyMesh {
    pub vertices: Vec<UVec3>,
    pub polygons: Vec<[u32; MAX_VERTICES_PER_POLYGON]>,
    /// For each polygon edge points to a polygon (if any) that shares the edge.
    pub edges: Vec<[EdgeConnection; MAX_VERTICES_PER_POLYGON]>,
    pub regions: Vec<u16>,
    pub areas: Vec<Area>,
    pub flags: Vec<u16>,
}

/// Number of vertices actually used by a polygon slot.
pub fn polygon_vertex_count(polygon: &[u32; MAX_VERTICES_PER_POLYGON]) -> usize {
    polygon
        .iter()
        .position(|index| *index == NULL_INDEX)
        .unwrap_or(MAX_VERTICES_PER_POLYGON)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum EdgeConnectionDirection {
    XNegative,
    ZPositive,
    XPositive,
    ZNegative,
}

impl EdgeConnectionDirection {
    pub fn flip(&self) -> Self {
        match self {
            EdgeConnectionDirection::XNegative => EdgeConnectionDirection::XPositive,
            EdgeConnectionDirection::ZPositive => EdgeConnectionDirection::ZNegative,
            EdgeConnectionDirection::XPositive => EdgeConnectionDirection::XNegative,
            EdgeConnectionDirection::ZNegative => EdgeConnectionDirection::ZPositive,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum EdgeConnection {
    /// Solid wall.
    None,
    /// Shared with another polygon in the same tile.
    Internal(u16),
    /// On the tile boundary, facing the neighbouring tile in a direction.
    External(EdgeConnectionDirection),
}

pub fn build_poly_mesh(
    ctx: &mut BuildContext,
    contour_set: &ContourSet,
    nav_mesh_settings: &NavMeshSettings,
) -> PolyMesh {
    let max_vertices_per_polygon = usize::from(nav_mesh_settings.max_vertices_per_polygon.get())
        .min(MAX_VERTICES_PER_POLYGON);

    let mut expected_vertices = 0;
    let mut expected_polygons = 0;
    for contour in &contour_set.contours {
        if contour.vertices.len() >= 3 {
            expected_vertices += contour.vertices.len();
            expected_polygons += contour.vertices.len() - 2;
        }
    }

    let mut poly_mesh = PolyMesh {
        vertices: Vec::with_capacity(expected_vertices),
        polygons: Vec::with_capacity(expected_polygons),
        edges: Vec::with_capacity(expected_polygons),
        regions: Vec::with_capacity(expected_polygons),
        areas: Vec::with_capacity(expected_polygons),
        flags: Vec::with_capacity(expected_polygons),
    };

    let mut vertex_columns: HashMap<(u32, u32), Vec<u32>> = HashMap::new();
    let mut ring_indices: Vec<u32> = Vec::new();
    let mut ring_triangles: Vec<u32> = Vec::new();
    let mut polygons: Vec<[u32; MAX_VERTICES_PER_POLYGON]> = Vec::new();

    for contour in &contour_set.contours {
        if contour.vertices.len() < 3 {
            continue;
        }

        ring_indices.clear();
        ring_indices.extend(0..contour.vertices.len() as u32);
        ring_triangles.clear();

        if !triangulate_ring(&contour.vertices, &mut ring_indices, &mut ring_triangles) {
            ctx.warn(
                "build poly mesh",
                DiagnosticCode::TriangulationFallback,
                format!(
                    "ear clipping failed for a contour of region {}, output may be incomplete",
                    contour.region
                ),
            );
        }

        // Map the ring into the shared, deduplicated vertex buffer.
        let shared_indices: Vec<u32> = contour
            .vertices
            .iter()
            .map(|vertex| {
                dedup_vertex(
                    vertex.truncate(),
                    &mut poly_mesh.vertices,
                    &mut vertex_columns,
                )
            })
            .collect();

        polygons.clear();
        for triangle in ring_triangles.chunks_exact(3) {
            let a = shared_indices[triangle[0] as usize];
            let b = shared_indices[triangle[1] as usize];
            let c = shared_indices[triangle[2] as usize];

            // Dedup can collapse a sliver triangle into a line.
            if a == b || b == c || c == a {
                continue;
            }

            let mut polygon = [NULL_INDEX; MAX_VERTICES_PER_POLYGON];
            polygon[..3].copy_from_slice(&[a, b, c]);
            polygons.push(polygon);
        }

        if polygons.is_empty() {
            ctx.warn(
                "build poly mesh",
                DiagnosticCode::DegeneratePolygon,
                format!("region {} produced no valid triangles", contour.region),
            );
            continue;
        }

        if max_vertices_per_polygon > 3 {
            merge_into_convex_polygons(
                &mut polygons,
                &poly_mesh.vertices,
                max_vertices_per_polygon,
            );
        }

        for polygon in polygons.iter() {
            poly_mesh.polygons.push(*polygon);
            poly_mesh.regions.push(contour.region);
            poly_mesh.areas.push(contour.area);
            poly_mesh.flags.push(1);
        }
    }

    connect_shared_edges(&poly_mesh.polygons, &mut poly_mesh.edges);
    mark_tile_boundary_portals(&mut poly_mesh, nav_mesh_settings);

    poly_mesh
}

/// Greedily merges polygon pairs along shared edges, longest shared edge
/// first, as long as the merged polygon stays convex & under the vertex cap.
fn merge_into_convex_polygons(
    polygons: &mut Vec<[u32; MAX_VERTICES_PER_POLYGON]>,
    vertices: &[UVec3],
    max_vertices_per_polygon: usize,
) {
    loop {
        let mut best_merge_value = 0;
        let mut best_pair = None;

        for i in 0..polygons.len() {
            for j in i + 1..polygons.len() {
                let Some((value, edge_i, edge_j)) = polygon_merge_value(
                    &polygons[i],
                    &polygons[j],
                    vertices,
                    max_vertices_per_polygon,
                ) else {
                    continue;
                };

                if value > best_merge_value {
                    best_merge_value = value;
                    best_pair = Some((i, j, edge_i, edge_j));
                }
            }
        }

        let Some((i, j, edge_i, edge_j)) = best_pair else {
            break;
        };

        let merged = merge_polygons(&polygons[i], &polygons[j], edge_i, edge_j);
        polygons[i] = merged;
        polygons.swap_remove(j);
    }
}

/// Checks whether two polygons can merge along a shared edge, returning the
/// merge value (squared length of the shared edge) & the edge index in each.
fn polygon_merge_value(
    polygon_a: &[u32; MAX_VERTICES_PER_POLYGON],
    polygon_b: &[u32; MAX_VERTICES_PER_POLYGON],
    vertices: &[UVec3],
    max_vertices_per_polygon: usize,
) -> Option<(u32, usize, usize)> {
    let count_a = polygon_vertex_count(polygon_a);
    let count_b = polygon_vertex_count(polygon_b);

    // If the merged polygon would be too big, do not merge.
    if count_a + count_b - 2 > max_vertices_per_polygon {
        return None;
    }

    // Check if the polygons share an edge.
    let mut shared = None;
    'outer: for i in 0..count_a {
        let a_start = polygon_a[i];
        let a_end = polygon_a[(i + 1) % count_a];

        for j in 0..count_b {
            let b_start = polygon_b[j];
            let b_end = polygon_b[(j + 1) % count_b];

            if a_start == b_end && a_end == b_start {
                shared = Some((i, j));
                break 'outer;
            }
        }
    }

    let (edge_a, edge_b) = shared?;

    // Check if the merged polygon would be convex at both joined corners.
    let as_ivec = |index: u32| -> IVec4 {
        let vertex = vertices[index as usize];
        IVec4::new(vertex.x as i32, vertex.y as i32, vertex.z as i32, 0)
    };

    let before_a = polygon_a[(edge_a + count_a - 1) % count_a];
    let corner_a = polygon_a[edge_a];
    let after_b = polygon_b[(edge_b + 2) % count_b];
    if !left_on(as_ivec(before_a), as_ivec(corner_a), as_ivec(after_b)) {
        return None;
    }

    let before_b = polygon_b[(edge_b + count_b - 1) % count_b];
    let corner_b = polygon_b[edge_b];
    let after_a = polygon_a[(edge_a + 2) % count_a];
    if !left_on(as_ivec(before_b), as_ivec(corner_b), as_ivec(after_a)) {
        return None;
    }

    let start = vertices[polygon_a[edge_a] as usize];
    let end = vertices[polygon_a[(edge_a + 1) % count_a] as usize];
    let delta_x = end.x.abs_diff(start.x);
    let delta_z = end.z.abs_diff(start.z);

    Some((delta_x * delta_x + delta_z * delta_z, edge_a, edge_b))
}

/// Joins two polygons along the shared edge, removing it.
fn merge_polygons(
    polygon_a: &[u32; MAX_VERTICES_PER_POLYGON],
    polygon_b: &[u32; MAX_VERTICES_PER_POLYGON],
    edge_a: usize,
    edge_b: usize,
) -> [u32; MAX_VERTICES_PER_POLYGON] {
    let count_a = polygon_vertex_count(polygon_a);
    let count_b = polygon_vertex_count(polygon_b);

    let mut merged = [NULL_INDEX; MAX_VERTICES_PER_POLYGON];
    let mut count = 0;

    for i in 0..count_a - 1 {
        merged[count] = polygon_a[(edge_a + 1 + i) % count_a];
        count += 1;
    }
    for i in 0..count_b - 1 {
        merged[count] = polygon_b[(edge_b + 1 + i) % count_b];
        count += 1;
    }

    merged
}

/// Wires up [EdgeConnection::Internal] on every edge two polygons share.
fn connect_shared_edges(
    polygons: &[[u32; MAX_VERTICES_PER_POLYGON]],
    edges: &mut Vec<[EdgeConnection; MAX_VERTICES_PER_POLYGON]>,
) {
    edges.clear();
    edges.resize(polygons.len(), [EdgeConnection::None; MAX_VERTICES_PER_POLYGON]);

    // A shared edge runs the opposite way around the other polygon, so it
    // shows up keyed (to, from).
    let mut open_edges: HashMap<(u32, u32), (usize, usize)> = HashMap::new();

    for (polygon_index, polygon) in polygons.iter().enumerate() {
        let count = polygon_vertex_count(polygon);

        for edge in 0..count {
            let from = polygon[edge];
            let to = polygon[(edge + 1) % count];

            if let Some((other_polygon, other_edge)) = open_edges.remove(&(to, from)) {
                edges[polygon_index][edge] = EdgeConnection::Internal(other_polygon as u16);
                edges[other_polygon][other_edge] = EdgeConnection::Internal(polygon_index as u16);
            } else {
                open_edges.insert((from, to), (polygon_index, edge));
            }
        }
    }
}

/// Turns unmatched edges lying on the tile bounds into [EdgeConnection::External]
/// portals facing the neighbouring tile.
fn mark_tile_boundary_portals(poly_mesh: &mut PolyMesh, nav_mesh_settings: &NavMeshSettings) {
    let tile_width = u32::from(nav_mesh_settings.tile_width.get());

    for (polygon, edges) in poly_mesh.polygons.iter().zip(poly_mesh.edges.iter_mut()) {
        let count = polygon_vertex_count(polygon);

        for edge in 0..count {
            if edges[edge] != EdgeConnection::None {
                continue;
            }

            let from = poly_mesh.vertices[polygon[edge] as usize];
            let to = poly_mesh.vertices[polygon[(edge + 1) % count] as usize];

            // Only edges running along the tile edge.
            let direction = if from.x == 0 && to.x == 0 {
                EdgeConnectionDirection::XNegative
            } else if from.z == tile_width && to.z == tile_width {
                EdgeConnectionDirection::ZPositive
            } else if from.x == tile_width && to.x == tile_width {
                EdgeConnectionDirection::XPositive
            } else if from.z == 0 && to.z == 0 {
                EdgeConnectionDirection::ZNegative
            } else {
                continue;
            };

            edges[edge] = EdgeConnection::External(direction);
        }
    }
}

/// Shared-buffer vertex dedup: vertices in the same XZ column within one cell
/// of height collapse into one.
fn dedup_vertex(
    vertex: UVec3,
    vertices: &mut Vec<UVec3>,
    columns: &mut HashMap<(u32, u32), Vec<u32>>,
) -> u32 {
    let column = columns.entry((vertex.x, vertex.z)).or_default();

    if let Some(existing) = column
        .iter()
        .find(|index| vertices[**index as usize].y.abs_diff(vertex.y) <= 1)
    {
        return *existing;
    }

    let index = vertices.len() as u32;
    vertices.push(vertex);
    column.push(index);
    index
}

#[derive(Clone, Copy, PartialEq)]
enum EarTolerance {
    Strict,
    /// Admits collinear corners & ignores improper touches; used when strict
    /// clipping runs out of ears on a slightly degenerate contour.
    Loose,
}

/// Ear-clips a contour ring into triangles of ring-local indices.
///
/// Returns ``false`` when not even loose predicates find an ear; whatever was
/// clipped so far stays in ``triangles``.
fn triangulate_ring(ring: &[UVec4], indices: &mut Vec<u32>, triangles: &mut Vec<u32>) -> bool {
    let mut can_clip: Vec<bool> = (0..indices.len())
        .map(|position| is_ear(position, ring, indices, EarTolerance::Strict))
        .collect();

    while indices.len() > 3 {
        // Shortest-diagonal ear first keeps slivers out of the mesh.
        let mut best = None;
        for (position, clippable) in can_clip.iter().enumerate() {
            if !*clippable {
                continue;
            }
            let length = ear_diagonal_length_squared(position, ring, indices);
            if best.is_none_or(|(best_length, _)| length < best_length) {
                best = Some((length, position));
            }
        }

        // A slightly broken contour may leave no strict ear; rescan loosely.
        let best = best.or_else(|| {
            let mut fallback = None;
            for position in 0..indices.len() {
                if !is_ear(position, ring, indices, EarTolerance::Loose) {
                    continue;
                }
                let length = ear_diagonal_length_squared(position, ring, indices);
                if fallback.is_none_or(|(best_length, _)| length < best_length) {
                    fallback = Some((length, position));
                }
            }
            fallback
        });

        let Some((_, ear)) = best else {
            return false;
        };

        let before = (ear + indices.len() - 1) % indices.len();
        let after = (ear + 1) % indices.len();
        triangles.extend([indices[before], indices[ear], indices[after]]);

        indices.remove(ear);
        can_clip.remove(ear);

        // Only the two vertices flanking the clipped ear change status.
        let remaining = indices.len();
        let before = (ear + remaining - 1) % remaining;
        let after = ear % remaining;
        can_clip[before] = is_ear(before, ring, indices, EarTolerance::Strict);
        can_clip[after] = is_ear(after, ring, indices, EarTolerance::Strict);
    }

    triangles.extend([indices[0], indices[1], indices[2]]);
    indices.clear();

    true
}

/// An ear at ``position`` is clippable when the diagonal between its two
/// neighbours stays inside the ring & crosses nothing.
fn is_ear(position: usize, ring: &[UVec4], indices: &[u32], tolerance: EarTolerance) -> bool {
    let before = (position + indices.len() - 1) % indices.len();
    let after = (position + 1) % indices.len();

    diagonal_within_cone(before, after, ring, indices, tolerance)
        && diagonal_unobstructed(before, after, ring, indices, tolerance)
}

fn ear_diagonal_length_squared(position: usize, ring: &[UVec4], indices: &[u32]) -> u32 {
    let before = ring[indices[(position + indices.len() - 1) % indices.len()] as usize];
    let after = ring[indices[(position + 1) % indices.len()] as usize];

    let delta_x = after.x.abs_diff(before.x);
    let delta_z = after.z.abs_diff(before.z);
    delta_x * delta_x + delta_z * delta_z
}

/// Whether the diagonal ``a -> b`` leaves vertex ``a`` into the ring interior.
fn diagonal_within_cone(
    a: usize,
    b: usize,
    ring: &[UVec4],
    indices: &[u32],
    tolerance: EarTolerance,
) -> bool {
    let at = |position: usize| ring[indices[position] as usize].as_ivec4();

    let origin = at(a);
    let target = at(b);
    let next = at((a + 1) % indices.len());
    let previous = at((a + indices.len() - 1) % indices.len());

    let inside = |p: IVec4, q: IVec4, r: IVec4| match tolerance {
        EarTolerance::Strict => left(p, q, r),
        EarTolerance::Loose => left_on(p, q, r),
    };

    if left_on(previous, origin, next) {
        // Convex corner: the diagonal must stay between both edges.
        inside(origin, target, previous) && inside(target, origin, next)
    } else {
        // Reflex corner: anywhere outside the inverted cone.
        !(left_on(origin, target, next) && left_on(target, origin, previous))
    }
}

/// Whether the diagonal ``a -> b`` crosses no ring edge. Edges sharing a
/// corner position with the diagonal are exempt.
fn diagonal_unobstructed(
    a: usize,
    b: usize,
    ring: &[UVec4],
    indices: &[u32],
    tolerance: EarTolerance,
) -> bool {
    let at = |position: usize| ring[indices[position] as usize];

    let diagonal_start = at(a);
    let diagonal_end = at(b);

    for edge in 0..indices.len() {
        let edge_end = (edge + 1) % indices.len();
        if edge == a || edge == b || edge_end == a || edge_end == b {
            continue;
        }

        let from = at(edge);
        let to = at(edge_end);
        if same_corner(from, diagonal_start)
            || same_corner(from, diagonal_end)
            || same_corner(to, diagonal_start)
            || same_corner(to, diagonal_end)
        {
            continue;
        }

        let crosses = match tolerance {
            EarTolerance::Strict => intersect(
                diagonal_start.as_ivec4(),
                diagonal_end.as_ivec4(),
                from.as_ivec4(),
                to.as_ivec4(),
            ),
            EarTolerance::Loose => intersect_prop(
                diagonal_start.as_ivec4(),
                diagonal_end.as_ivec4(),
                from.as_ivec4(),
                to.as_ivec4(),
            ),
        };
        if crosses {
            return false;
        }
    }

    true
}

fn same_corner(a: UVec4, b: UVec4) -> bool {
    a.x == b.x && a.z == b.z
}
