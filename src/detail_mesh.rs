//! Per-polygon "detail" triangulations capturing the height variation inside
//! each nav-mesh polygon, sampled from the open heightfield.

use bevy::math::{U16Vec2, U16Vec3, UVec3, Vec2, Vec3, Vec3Swizzles};

use crate::{
    context::{BuildContext, DiagnosticCode},
    heightfields::{follow_link, OpenTile},
    mesher::{polygon_vertex_count, PolyMesh},
    NavMeshSettings,
};

/// Vertex cap of a single polygon's detail mesh.
pub const MAX_VERTS: usize = 127;
/// Triangle cap of a single polygon's detail mesh.
pub const MAX_TRIS: usize = 255;
const MAX_VERTS_PER_EDGE: usize = 32;

/// Slice of [PolyMeshDetail]'s flat arrays belonging to one base polygon.
///
/// The first ``n`` detail vertices of a slice are the base polygon's own ``n``
/// vertices, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct DetailMeshSlice {
    pub vertex_base: u32,
    pub vertex_count: u32,
    pub triangle_base: u32,
    pub triangle_count: u32,
}

/// A detail triangle: three indices local to its slice plus hull edge flags.
/// Bit ``i`` of ``edge_flags`` marks edge ``(i, (i+1)%3)`` as lying on the
/// base polygon's hull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct DetailTriangle {
    pub vertices: [u32; 3],
    pub edge_flags: u8,
}

/// Height-detail triangulations for every polygon of a [PolyMesh], in the
/// same tile-local cell coordinates.
#[derive(Default, Debug)]
pub struct PolyMeshDetail {
    pub meshes: Vec<DetailMeshSlice>,
    pub vertices: Vec<U16Vec3>,
    pub triangles: Vec<DetailTriangle>,
}

/// Builds a height-corrected detail mesh for every polygon of ``poly_mesh``.
///
/// With [DetailMeshSettings::sample_distance](crate::DetailMeshSettings::sample_distance)
/// ``0`` each polygon degenerates to a fan triangulation with no added samples.
pub fn build_poly_mesh_detail(
    ctx: &mut BuildContext,
    poly_mesh: &PolyMesh,
    open_tile: &OpenTile,
    nav_mesh_settings: &NavMeshSettings,
) -> PolyMeshDetail {
    let mut detail = PolyMeshDetail {
        meshes: Vec::with_capacity(poly_mesh.polygons.len()),
        vertices: Vec::with_capacity(poly_mesh.vertices.len()),
        triangles: Vec::with_capacity(poly_mesh.polygons.len() * 2),
    };

    if poly_mesh.polygons.is_empty() {
        return detail;
    }

    let tile_width = nav_mesh_settings.tile_width.get();
    let mut widest_patch = U16Vec2::ZERO;

    let polygon_bounds = poly_mesh
        .polygons
        .iter()
        .map(|polygon| {
            let mut low = U16Vec2::splat(tile_width);
            let mut high = U16Vec2::ZERO;

            for i in polygon.iter().take(polygon_vertex_count(polygon)) {
                let vertex = poly_mesh.vertices[*i as usize].xz().as_u16vec2();

                low = low.min(vertex);
                high = high.max(vertex);
            }

            // One cell of margin so edge samples can see their floor.
            low = low.saturating_sub(U16Vec2::ONE);
            high = (high + U16Vec2::ONE).min(U16Vec2::splat(tile_width));

            widest_patch = widest_patch.max(high.saturating_sub(low));

            (low, high)
        })
        .collect::<Vec<_>>();

    let mut patch = HeightPatch {
        min_x: 0,
        min_z: 0,
        width: 0,
        height: 0,
        heights: vec![0u16; (widest_patch.x as usize) * (widest_patch.y as usize)],
    };

    let mut polygon = Vec::with_capacity(crate::mesher::MAX_VERTICES_PER_POLYGON);
    let mut triangles = Vec::with_capacity(512);
    let mut samples = Vec::with_capacity(512);
    let mut verts = Vec::with_capacity(256);
    let mut hull = Vec::with_capacity(MAX_VERTS);
    let mut seed_queue = Vec::with_capacity(512);

    for (polygon_index, ((polygon_slot, (low, high)), region)) in poly_mesh
        .polygons
        .iter()
        .zip(polygon_bounds.iter())
        .zip(poly_mesh.regions.iter())
        .enumerate()
    {
        polygon.clear();
        polygon.extend(
            polygon_slot
                .iter()
                .take(polygon_vertex_count(polygon_slot))
                .map(|i| poly_mesh.vertices[*i as usize].as_u16vec3()),
        );

        patch.min_x = low.x;
        patch.min_z = low.y;
        patch.width = high.x.saturating_sub(low.x);
        patch.height = high.y.saturating_sub(low.y);

        fill_height_patch(
            nav_mesh_settings,
            open_tile,
            &polygon,
            *region,
            &mut patch,
            &mut seed_queue,
        );

        build_poly_detail(
            &patch,
            &polygon,
            nav_mesh_settings.detail.sample_distance,
            nav_mesh_settings.detail.max_sample_error,
            &mut verts,
            &mut hull,
            &mut triangles,
            &mut samples,
        );

        if verts.len() > MAX_VERTS {
            ctx.warn(
                "build detail mesh",
                DiagnosticCode::DetailCapExceeded,
                format!(
                    "polygon {polygon_index} exceeded the detail vertex cap ({} > {MAX_VERTS})",
                    verts.len()
                ),
            );
            verts.truncate(MAX_VERTS);
            triangles
                .retain(|triangle| triangle.iter().all(|index| (*index as usize) < MAX_VERTS));
        }
        if triangles.len() > MAX_TRIS {
            ctx.warn(
                "build detail mesh",
                DiagnosticCode::DetailCapExceeded,
                format!(
                    "polygon {polygon_index} exceeded the detail triangle cap ({} > {MAX_TRIS})",
                    triangles.len()
                ),
            );
            triangles.truncate(MAX_TRIS);
        }

        let vertex_base = detail.vertices.len() as u32;
        let triangle_base = detail.triangles.len() as u32;

        detail.vertices.extend(verts.iter().copied());
        detail
            .triangles
            .extend(triangles.iter().map(|triangle| DetailTriangle {
                vertices: *triangle,
                edge_flags: triangle_edge_flags(triangle, &hull),
            }));

        detail.meshes.push(DetailMeshSlice {
            vertex_base,
            vertex_count: verts.len() as u32,
            triangle_base,
            triangle_count: triangles.len() as u32,
        });
    }

    detail
}

/// Flags each triangle edge that runs along the polygon hull boundary.
fn triangle_edge_flags(triangle: &[u32; 3], hull: &[usize]) -> u8 {
    let mut flags = 0;
    for i in 0..3 {
        let a = triangle[i] as usize;
        let b = triangle[(i + 1) % 3] as usize;

        let on_hull = (0..hull.len()).any(|h| {
            let next = (h + 1) % hull.len();
            (hull[h] == a && hull[next] == b) || (hull[h] == b && hull[next] == a)
        });

        if on_hull {
            flags |= 1 << i;
        }
    }
    flags
}

#[derive(Debug)]
struct HeightPatch {
    min_x: u16,
    min_z: u16,
    width: u16,
    height: u16,

    /// Best sampled floor height per cell, [UNSET_HEIGHT] where unseeded.
    heights: Vec<u16>,
}

const UNSET_HEIGHT: u16 = u16::MAX;

/// Seeds the patch with same-region floor heights, then floods the remaining
/// cells from the region boundary outward through the span links.
fn fill_height_patch(
    nav_mesh_settings: &NavMeshSettings,
    open_tile: &OpenTile,
    polygon: &[U16Vec3],
    region: u16,
    patch: &mut HeightPatch,
    seed_queue: &mut Vec<(usize, usize)>,
) {
    seed_queue.clear();

    let cell_count = patch.width as usize * patch.height as usize;
    if patch.heights.len() < cell_count {
        patch.heights.resize(cell_count, UNSET_HEIGHT);
    }
    patch.heights.fill(UNSET_HEIGHT);

    let tile_side = nav_mesh_settings.get_tile_side_with_border();
    let border = nav_mesh_settings.border_size as usize;

    // Pass 1: every cell with a same-region span gets that span's floor.
    // Spans bordering other regions queue up as flood seeds.
    let mut seeded_any = false;
    for patch_z in 0..patch.height as usize {
        for patch_x in 0..patch.width as usize {
            let cell_index = (patch_x + patch.min_x as usize + border)
                + (patch_z + patch.min_z as usize + border) * tile_side;

            let found = open_tile.cells[cell_index]
                .spans
                .iter()
                .enumerate()
                .find(|(_, span)| span.region == region);
            let Some((span_index, span)) = found else {
                continue;
            };

            patch.heights[patch_x + patch_z * patch.width as usize] = span.min;
            seeded_any = true;

            let on_region_rim = (0..4).any(|direction| {
                follow_link(&open_tile.cells, tile_side, cell_index, span, direction)
                    .is_some_and(|(_, neighbour)| neighbour.region != region)
            });
            if on_region_rim {
                seed_queue.push((cell_index, span_index));
            }
        }
    }

    if !seeded_any {
        seed_patch_from_polygon_centre(open_tile, polygon, nav_mesh_settings, seed_queue, patch);
    }

    // Pass 2: breadth-first flood into unseeded cells. The queue compacts
    // itself so long floods don't hold the whole history.
    const COMPACT_AT: usize = 256;
    let mut cursor = 0;

    while cursor < seed_queue.len() {
        let (cell_index, span_index) = seed_queue[cursor];
        cursor += 1;

        if cursor >= COMPACT_AT {
            seed_queue.drain(..COMPACT_AT);
            cursor = 0;
        }

        let span = &open_tile.cells[cell_index].spans[span_index];
        for direction in 0..4 {
            let Some((neighbour_cell, neighbour)) =
                follow_link(&open_tile.cells, tile_side, cell_index, span, direction)
            else {
                continue;
            };

            let patch_x = (neighbour_cell % tile_side) as isize
                - patch.min_x as isize
                - border as isize;
            let patch_z = (neighbour_cell / tile_side) as isize
                - patch.min_z as isize
                - border as isize;
            if patch_x < 0
                || patch_z < 0
                || patch_x >= patch.width as isize
                || patch_z >= patch.height as isize
            {
                continue;
            }

            let slot = patch_x as usize + patch_z as usize * patch.width as usize;
            if patch.heights[slot] != UNSET_HEIGHT {
                continue;
            }

            patch.heights[slot] = neighbour.min;
            let neighbour_span_index = span.neighbours[direction].unwrap_or_default() as usize;
            seed_queue.push((neighbour_cell, neighbour_span_index));
        }
    }
}

/// Fallback when a polygon covers no span of its own region: seed the flood
/// from whichever span sits closest under a polygon vertex.
fn seed_patch_from_polygon_centre(
    open_tile: &OpenTile,
    polygon: &[U16Vec3],
    nav_mesh_settings: &NavMeshSettings,
    seed_queue: &mut Vec<(usize, usize)>,
    patch: &mut HeightPatch,
) {
    const PROBE_OFFSETS: [(i16, i16); 9] = [
        (0, 0),
        (-1, -1),
        (0, -1),
        (1, -1),
        (1, 0),
        (1, 1),
        (0, 1),
        (-1, 1),
        (-1, 0),
    ];

    let tile_side = nav_mesh_settings.get_tile_side_with_border();
    let border = nav_mesh_settings.border_size;

    let mut best_seed = None;
    let mut best_height_gap = u16::MAX;

    'vertices: for vertex in polygon {
        for (offset_x, offset_z) in PROBE_OFFSETS {
            let probe_x = vertex.x.saturating_add_signed(offset_x);
            let probe_z = vertex.z.saturating_add_signed(offset_z);

            let in_patch = (patch.min_x..patch.min_x + patch.width).contains(&probe_x)
                && (patch.min_z..patch.min_z + patch.height).contains(&probe_z);
            if !in_patch {
                continue;
            }

            let cell_index =
                (probe_x + border) as usize + (probe_z + border) as usize * tile_side;
            for (span_index, span) in open_tile.cells[cell_index].spans.iter().enumerate() {
                let height_gap = vertex.y.abs_diff(span.min);
                if height_gap < best_height_gap {
                    best_seed = Some((cell_index, span_index));
                    best_height_gap = height_gap;

                    if height_gap == 0 {
                        break 'vertices;
                    }
                }
            }
        }
    }

    if let Some(seed) = best_seed {
        seed_queue.clear();
        seed_queue.push(seed);
    }
}

/// Sampled height at patch coordinates, spiralling ring by ring outward when
/// the exact cell was never seeded. Within the first ring holding data, the
/// entry closest to ``y`` wins.
fn sample_patch_height(patch: &HeightPatch, x: u32, y: u32, z: u32, search_radius: u16) -> u16 {
    let local_x = x
        .saturating_sub(patch.min_x.into())
        .min(u32::from(patch.width.saturating_sub(1)));
    let local_z = z
        .saturating_sub(patch.min_z.into())
        .min(u32::from(patch.height.saturating_sub(1)));

    let direct = patch.heights[(local_x + local_z * u32::from(patch.width)) as usize];
    if direct != UNSET_HEIGHT {
        return direct;
    }

    let mut best = UNSET_HEIGHT;
    let mut best_gap = u32::MAX;

    for ring in 1..=i32::from(search_radius) {
        for offset in -ring..=ring {
            // The four sides of the square ring; corners show up twice,
            // which only costs a repeated comparison.
            for (dx, dz) in [(offset, -ring), (offset, ring), (-ring, offset), (ring, offset)] {
                let ring_x = local_x as i32 + dx;
                let ring_z = local_z as i32 + dz;
                if ring_x < 0
                    || ring_z < 0
                    || ring_x >= i32::from(patch.width)
                    || ring_z >= i32::from(patch.height)
                {
                    continue;
                }

                let height = patch.heights[(ring_x + ring_z * i32::from(patch.width)) as usize];
                if height == UNSET_HEIGHT {
                    continue;
                }

                let gap = u32::from(height).abs_diff(y);
                if gap < best_gap {
                    best_gap = gap;
                    best = height;
                }
            }
        }

        if best != UNSET_HEIGHT {
            break;
        }
    }

    best
}

const HEIGHT_SEARCH_RADIUS: u16 = 3;

#[allow(clippy::too_many_arguments)]
fn build_poly_detail(
    patch: &HeightPatch,
    polygon: &[U16Vec3],
    sample_distance: u16,
    max_sample_error: f32,
    verts: &mut Vec<U16Vec3>,
    hull: &mut Vec<usize>,
    triangles: &mut Vec<[u32; 3]>,
    samples: &mut Vec<U16Vec3>,
) {
    verts.clear();
    verts.extend(polygon.iter().copied());
    hull.clear();
    triangles.clear();
    samples.clear();

    if sample_distance > 0 {
        tessellate_hull_edges(patch, polygon, sample_distance, max_sample_error, verts, hull);
    } else {
        hull.extend(0..polygon.len());
    }

    triangulate_hull(verts, hull, polygon.len(), triangles);

    // Thin polygons get no interior samples; the tessellated hull is enough.
    if polygon_min_extent(verts) < (sample_distance * 2) as f32 || triangles.is_empty() {
        if triangles.is_empty() {
            triangulate_hull(verts, hull, polygon.len(), triangles);
        }
        return;
    }

    if sample_distance > 0 {
        scatter_interior_samples(patch, polygon, sample_distance, samples);
        refine_by_worst_sample(max_sample_error, verts, hull, triangles, samples);
    }

    // If refinement ate the triangulation, fall back to the plain hull fan.
    if triangles.is_empty() {
        triangulate_hull(verts, hull, polygon.len(), triangles);
    }
}

/// Walks the polygon's edges, sampling heights along each & keeping the
/// samples that deviate too much. Edges are walked from their low end so a
/// shared edge tessellates identically on both sides.
fn tessellate_hull_edges(
    patch: &HeightPatch,
    polygon: &[U16Vec3],
    sample_distance: u16,
    max_sample_error: f32,
    verts: &mut Vec<U16Vec3>,
    hull: &mut Vec<usize>,
) {
    let mut edge_samples = [U16Vec3::ZERO; MAX_VERTS_PER_EDGE + 1];
    let max_error_squared = max_sample_error * max_sample_error;

    for index in 0..polygon.len() {
        let edge_start_index = (index + polygon.len() - 1) % polygon.len();
        let mut edge_start = polygon[edge_start_index];
        let mut edge_end = polygon[index];

        // Canonical low-to-high order, decided on X then Z.
        let reversed = if edge_start.x == edge_end.x {
            edge_start.z > edge_end.z
        } else {
            edge_start.x > edge_end.x
        };
        if reversed {
            std::mem::swap(&mut edge_start, &mut edge_end);
        }

        let edge_length = {
            let delta = edge_end.as_vec3() - edge_start.as_vec3();
            delta.xz().length()
        };

        let mut segments =
            (1 + (edge_length / sample_distance as f32).floor() as usize).min(MAX_VERTS_PER_EDGE - 1);
        if verts.len() + segments >= MAX_VERTS {
            segments = (MAX_VERTS - 1).saturating_sub(verts.len());
        }

        for (segment, sample) in edge_samples.iter_mut().enumerate().take(segments + 1) {
            let t = segment as f32 / segments as f32;
            let mut position = edge_start
                .as_vec3()
                .lerp(edge_end.as_vec3(), t)
                .floor()
                .as_uvec3();
            position.y = u32::from(sample_patch_height(
                patch,
                position.x,
                position.y,
                position.z,
                HEIGHT_SEARCH_RADIUS,
            ));

            *sample = position.as_u16vec3();
        }

        // Keep only samples deviating from the chord, worst first.
        let mut kept = vec![0, segments];
        let mut cursor = 0;
        while cursor < kept.len() - 1 {
            let run_start = kept[cursor];
            let run_end = kept[cursor + 1];

            let mut worst = None;
            for sample in run_start + 1..run_end {
                let deviation = squared_point_segment_distance(
                    edge_samples[sample].as_vec3(),
                    edge_samples[run_start].as_vec3(),
                    edge_samples[run_end].as_vec3(),
                );
                if worst.is_none_or(|(worst_deviation, _)| deviation > worst_deviation) {
                    worst = Some((deviation, sample));
                }
            }

            match worst {
                Some((deviation, sample)) if deviation > max_error_squared => {
                    kept.insert(cursor + 1, sample);
                }
                _ => cursor += 1,
            }
        }

        hull.push(edge_start_index);

        // Append the surviving interior samples in ring order.
        let interior = kept.len() - 1;
        if reversed {
            for &sample in kept[1..interior].iter().rev() {
                verts.push(edge_samples[sample]);
                hull.push(verts.len() - 1);
            }
        } else {
            for &sample in kept[1..interior].iter() {
                verts.push(edge_samples[sample]);
                hull.push(verts.len() - 1);
            }
        }
    }
}

/// Scatters height samples over the polygon interior on a ``sample_distance``
/// grid, skipping points hugging the outline.
fn scatter_interior_samples(
    patch: &HeightPatch,
    polygon: &[U16Vec3],
    sample_distance: u16,
    samples: &mut Vec<U16Vec3>,
) {
    let mut low = polygon[0];
    let mut high = polygon[0];
    for vertex in polygon.iter().skip(1) {
        low = low.min(*vertex);
        high = high.max(*vertex);
    }
    let mid_height = ((low.y as f32 + high.y as f32) * 0.5).floor() as u16;

    for z in (low.z..high.z).step_by(sample_distance as usize) {
        for x in (low.x..high.x).step_by(sample_distance as usize) {
            let candidate = U16Vec3::new(x, mid_height, z);

            // Stay clear of the outline by half a sample step.
            if signed_distance_to_polygon(polygon, candidate.as_vec3())
                > -(sample_distance as f32) / 2.0
            {
                continue;
            }

            let height = sample_patch_height(
                patch,
                candidate.x.into(),
                candidate.y.into(),
                candidate.z.into(),
                HEIGHT_SEARCH_RADIUS,
            );
            samples.push(candidate.with_y(height));
        }
    }

    // Guarantee at least one interior sample at the polygon's centre.
    if samples.is_empty() {
        let centre = polygon
            .iter()
            .fold(UVec3::ZERO, |sum, vertex| sum + vertex.as_uvec3())
            / polygon.len() as u32;

        let height = sample_patch_height(
            patch,
            centre.x,
            centre.y,
            centre.z,
            HEIGHT_SEARCH_RADIUS,
        );
        samples.push(centre.as_u16vec3().with_y(height));
    }
}

/// Repeatedly inserts the sample farthest (vertically) from the current
/// triangulation & re-triangulates, until every sample is within the error.
fn refine_by_worst_sample(
    max_sample_error: f32,
    verts: &mut Vec<U16Vec3>,
    hull: &[usize],
    triangles: &mut Vec<[u32; 3]>,
    samples: &mut Vec<U16Vec3>,
) {
    for _ in 0..samples.len() {
        if verts.len() >= MAX_VERTS {
            break;
        }

        let mut worst = None;
        for (index, sample) in samples.iter().enumerate() {
            // Samples outside the current mesh were purged earlier; skip any
            // that momentarily have no triangle under them.
            let Some(distance) = vertical_distance_to_mesh(sample.as_vec3(), verts, triangles)
            else {
                continue;
            };
            if worst.is_none_or(|(worst_distance, _, _)| distance > worst_distance) {
                worst = Some((distance, index, *sample));
            }
        }

        let Some((distance, index, sample)) = worst else {
            break;
        };
        if distance <= max_sample_error {
            break;
        }

        samples.swap_remove(index);
        verts.push(sample);

        triangles.clear();
        delaunay_hull(verts, hull, triangles);
    }
}

/// Fans the hull into triangles, repeatedly consuming whichever frontier end
/// yields the shorter new edge.
fn triangulate_hull(
    verts: &[U16Vec3],
    hull: &[usize],
    polygon_vertex_count: usize,
    triangles: &mut Vec<[u32; 3]>,
) {
    let hull_len = hull.len();
    let xz = |hull_position: usize| verts[hull[hull_position]].as_vec3().xz();

    // Seed at the original corner with the smallest ear perimeter; edge
    // samples make poor fan centres.
    let mut start = 0;
    let mut best_perimeter = f32::MAX;
    for position in 0..hull_len {
        if hull[position] >= polygon_vertex_count {
            continue;
        }

        let previous = xz((position + hull_len - 1) % hull_len);
        let current = xz(position);
        let next = xz((position + 1) % hull_len);
        let perimeter =
            previous.distance(current) + current.distance(next) + next.distance(previous);

        if perimeter < best_perimeter {
            best_perimeter = perimeter;
            start = position;
        }
    }

    let mut left = (start + 1) % hull_len;
    let mut right = (start + hull_len - 1) % hull_len;
    triangles.push([hull[start] as u32, hull[left] as u32, hull[right] as u32]);

    // Advance the cheaper frontier until the two ends meet.
    while (left + 1) % hull_len != right {
        let next_left = (left + 1) % hull_len;
        let next_right = (right + hull_len - 1) % hull_len;

        let advance_left_cost =
            xz(left).distance(xz(next_left)) + xz(next_left).distance(xz(right));
        let advance_right_cost =
            xz(right).distance(xz(next_right)) + xz(left).distance(xz(next_right));

        if advance_left_cost < advance_right_cost {
            triangles.push([hull[left] as u32, hull[next_left] as u32, hull[right] as u32]);
            left = next_left;
        } else {
            triangles.push([hull[left] as u32, hull[next_right] as u32, hull[right] as u32]);
            right = next_right;
        }
    }
}

/// Which face sits on a given side of a [DelaunayEdge].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FaceRef {
    /// Not yet resolved.
    Open,
    /// Resolved as hull boundary; no face on this side.
    Boundary,
    Face(u32),
}

#[derive(Clone, Copy, Debug)]
struct DelaunayEdge {
    from: u32,
    to: u32,
    /// Face on the left of ``from -> to``.
    left: FaceRef,
    /// Face on the left of ``to -> from``.
    right: FaceRef,
}

/// Edge table driving the incremental Delaunay construction.
struct DelaunayMesh {
    edges: Vec<DelaunayEdge>,
    face_count: u32,
    edge_limit: usize,
}

impl DelaunayMesh {
    fn find_edge(&self, a: u32, b: u32) -> Option<usize> {
        self.edges
            .iter()
            .position(|edge| (edge.from == a && edge.to == b) || (edge.from == b && edge.to == a))
    }

    fn add_edge(&mut self, from: u32, to: u32, left: FaceRef, right: FaceRef) {
        if self.edges.len() >= self.edge_limit {
            bevy::log::warn!(
                "detail triangulation hit its edge budget ({})",
                self.edge_limit
            );
            return;
        }

        if self.find_edge(from, to).is_none() {
            self.edges.push(DelaunayEdge {
                from,
                to,
                left,
                right,
            });
        }
    }

    /// Resolves the face on the left of the oriented edge ``from -> to``.
    fn resolve_left_face(&mut self, index: usize, from: u32, to: u32, face: FaceRef) {
        let edge = &mut self.edges[index];
        if edge.from == from && edge.to == to && edge.left == FaceRef::Open {
            edge.left = face;
        } else if edge.from == to && edge.to == from && edge.right == FaceRef::Open {
            edge.right = face;
        }
    }
}

/// Triangulates the point set bounded by ``hull`` by completing faces edge by
/// edge; faces that never receive their third corner are swept out at the end.
fn delaunay_hull(vertices: &[U16Vec3], hull: &[usize], triangles: &mut Vec<[u32; 3]>) {
    let mut mesh = DelaunayMesh {
        edges: Vec::with_capacity(vertices.len() * 4),
        face_count: 0,
        edge_limit: vertices.len() * 10,
    };

    for (index, &vertex) in hull.iter().enumerate() {
        let previous = hull[(index + hull.len() - 1) % hull.len()];
        mesh.add_edge(previous as u32, vertex as u32, FaceRef::Open, FaceRef::Open);
    }

    let mut cursor = 0;
    while cursor < mesh.edges.len() {
        if mesh.edges[cursor].left == FaceRef::Open {
            complete_facet(vertices, &mut mesh, cursor);
        }
        if mesh.edges[cursor].right == FaceRef::Open {
            complete_facet(vertices, &mut mesh, cursor);
        }
        cursor += 1;
    }

    // Assemble triangles from the per-edge face records.
    triangles.clear();
    triangles.resize(mesh.face_count as usize, [u32::MAX; 3]);

    for edge in mesh.edges.iter() {
        if let FaceRef::Face(face) = edge.right {
            register_face_edge(&mut triangles[face as usize], edge.from, edge.to);
        }
        if let FaceRef::Face(face) = edge.left {
            register_face_edge(&mut triangles[face as usize], edge.to, edge.from);
        }
    }

    // Dangling-face sweep: drop records that never closed.
    triangles.retain(|triangle| triangle.iter().all(|index| *index != u32::MAX));
}

/// Accumulates one oriented edge into a triangle record; the third corner
/// arrives with the second registered edge.
fn register_face_edge(triangle: &mut [u32; 3], from: u32, to: u32) {
    if triangle[0] == u32::MAX {
        triangle[0] = from;
        triangle[1] = to;
    } else if triangle[0] == to {
        triangle[2] = from;
    } else if triangle[1] == from {
        triangle[2] = to;
    }
}

/// Completes the open side of an edge with the best circumcircle point on
/// that side, or marks the side as hull boundary when no point remains.
fn complete_facet(vertices: &[U16Vec3], mesh: &mut DelaunayMesh, edge_index: usize) {
    const EDGE_EPSILON: f32 = 1e-5;
    // Relative slack on the circumcircle radius, against flip cascades on
    // near-collinear samples.
    const RADIUS_TOLERANCE: f32 = 1e-3;

    let (from, to) = {
        let edge = mesh.edges[edge_index];
        if edge.left == FaceRef::Open {
            (edge.from, edge.to)
        } else if edge.right == FaceRef::Open {
            (edge.to, edge.from)
        } else {
            return;
        }
    };

    let origin = vertices[from as usize].as_vec3();
    let target = vertices[to as usize].as_vec3();

    // (vertex, circumcircle centre, radius) of the best candidate so far.
    let mut best: Option<(u32, Vec2, f32)> = None;

    for (candidate, vertex) in vertices.iter().enumerate() {
        if candidate == from as usize || candidate == to as usize {
            continue;
        }

        let point = vertex.as_vec3();
        if cross_2d(origin, target, point) <= EDGE_EPSILON {
            // Not on the open side of the edge.
            continue;
        }

        match best {
            None => {
                best = circumcircle_2d(origin, target, point)
                    .map(|(centre, radius)| (candidate as u32, centre, radius));
            }
            Some((_, centre, radius)) => {
                let reach = centre.distance(point.xz());
                if reach > radius * (1.0 + RADIUS_TOLERANCE) {
                    // Clearly outside the current circumcircle.
                    continue;
                }
                if reach >= radius * (1.0 - RADIUS_TOLERANCE) {
                    // Inside the tolerance band: accept only when the new
                    // edges would not cross existing ones.
                    if edge_would_cross(vertices, &mesh.edges, from, candidate as u32)
                        || edge_would_cross(vertices, &mesh.edges, to, candidate as u32)
                    {
                        continue;
                    }
                }

                if let Some((centre, radius)) = circumcircle_2d(origin, target, point) {
                    best = Some((candidate as u32, centre, radius));
                }
            }
        }
    }

    match best {
        Some((corner, _, _)) => {
            let face = FaceRef::Face(mesh.face_count);

            mesh.resolve_left_face(edge_index, from, to, face);

            match mesh.find_edge(corner, from) {
                Some(flank) => mesh.resolve_left_face(flank, corner, from, face),
                None => mesh.add_edge(corner, from, face, FaceRef::Open),
            }
            match mesh.find_edge(to, corner) {
                Some(flank) => mesh.resolve_left_face(flank, to, corner, face),
                None => mesh.add_edge(to, corner, face, FaceRef::Open),
            }

            mesh.face_count += 1;
        }
        None => mesh.resolve_left_face(edge_index, from, to, FaceRef::Boundary),
    }
}

/// Whether a fresh edge ``a -> b`` would cross any existing, unconnected edge
/// on the XZ-plane.
fn edge_would_cross(vertices: &[U16Vec3], edges: &[DelaunayEdge], a: u32, b: u32) -> bool {
    edges.iter().any(|edge| {
        if edge.from == a || edge.from == b || edge.to == a || edge.to == b {
            return false;
        }

        segments_cross_2d(
            vertices[edge.from as usize].as_vec3(),
            vertices[edge.to as usize].as_vec3(),
            vertices[a as usize].as_vec3(),
            vertices[b as usize].as_vec3(),
        )
    })
}

fn segments_cross_2d(a: Vec3, b: Vec3, c: Vec3, d: Vec3) -> bool {
    let side_d = cross_2d(a, b, d);
    let side_c = cross_2d(a, b, c);
    if side_d * side_c >= 0.0 {
        return false;
    }

    let side_a = cross_2d(c, d, a);
    // The four signed areas of a crossing pair telescope.
    let side_b = side_a + side_c - side_d;
    side_a * side_b < 0.0
}

/// Z-component of the XZ cross product ``(q - p) x (r - p)``.
fn cross_2d(p: Vec3, q: Vec3, r: Vec3) -> f32 {
    (q.x - p.x) * (r.z - p.z) - (q.z - p.z) * (r.x - p.x)
}

/// Circumcircle of the triangle projected onto the XZ-plane, or ``None`` when
/// collinear. Computed relative to ``a`` for precision.
fn circumcircle_2d(a: Vec3, b: Vec3, c: Vec3) -> Option<(Vec2, f32)> {
    const EPSILON: f32 = 1e-6;

    let to_b = (b - a).xz();
    let to_c = (c - a).xz();

    let doubled_cross = 2.0 * (to_b.x * to_c.y - to_b.y * to_c.x);
    if doubled_cross.abs() <= EPSILON {
        return None;
    }

    let b_reach = to_b.length_squared();
    let c_reach = to_c.length_squared();
    let centre = Vec2::new(
        (to_c.y * b_reach - to_b.y * c_reach) / doubled_cross,
        (to_b.x * c_reach - to_c.x * b_reach) / doubled_cross,
    );

    Some((centre + a.xz(), centre.length()))
}

/// Squared distance from ``point`` to the segment ``a -> b``.
fn squared_point_segment_distance(point: Vec3, a: Vec3, b: Vec3) -> f32 {
    let segment = b - a;
    let reach = segment.length_squared();
    let t = if reach > 0.0 {
        ((point - a).dot(segment) / reach).clamp(0.0, 1.0)
    } else {
        0.0
    };

    (a + segment * t - point).length_squared()
}

/// Squared XZ distance from ``point`` to the segment ``a -> b``.
fn squared_point_segment_distance_2d(point: Vec3, a: Vec3, b: Vec3) -> f32 {
    let chord = (b - a).xz();
    let offset = (point - a).xz();

    let reach = chord.length_squared();
    let t = if reach > 0.0 {
        (offset.dot(chord) / reach).clamp(0.0, 1.0)
    } else {
        0.0
    };

    (chord * t - offset).length_squared()
}

/// Vertical distance from ``point`` to the triangle surface at its XZ
/// position; ``None`` outside the triangle's XZ projection.
fn vertical_distance_to_triangle(point: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    const EPSILON: f32 = 1e-4;

    let to_c = (c - a).xz();
    let to_b = (b - a).xz();
    let to_point = (point - a).xz();

    let cc = to_c.length_squared();
    let cb = to_c.dot(to_b);
    let cp = to_c.dot(to_point);
    let bb = to_b.length_squared();
    let bp = to_b.dot(to_point);

    let denominator = cc * bb - cb * cb;
    if denominator.abs() <= f32::EPSILON {
        return None;
    }

    let u = (bb * cp - cb * bp) / denominator;
    let v = (cc * bp - cb * cp) / denominator;

    (u >= -EPSILON && v >= -EPSILON && u + v <= 1.0 + EPSILON)
        .then(|| (a.y + u * (c.y - a.y) + v * (b.y - a.y) - point.y).abs())
}

/// Smallest vertical distance from ``point`` to any triangle under it.
fn vertical_distance_to_mesh(
    point: Vec3,
    verts: &[U16Vec3],
    triangles: &[[u32; 3]],
) -> Option<f32> {
    triangles
        .iter()
        .filter_map(|[a, b, c]| {
            vertical_distance_to_triangle(
                point,
                verts[*a as usize].as_vec3(),
                verts[*b as usize].as_vec3(),
                verts[*c as usize].as_vec3(),
            )
        })
        .reduce(f32::min)
}

/// Negative inside the polygon: squared XZ distance to the outline.
fn signed_distance_to_polygon(polygon: &[U16Vec3], point: Vec3) -> f32 {
    let mut inside = false;
    let mut edge_distance = f32::MAX;

    for (index, vertex) in polygon.iter().enumerate() {
        let current = vertex.as_vec3();
        let previous = polygon[(index + polygon.len() - 1) % polygon.len()].as_vec3();

        // Even-odd crossing test.
        if (current.z > point.z) != (previous.z > point.z) {
            let crossing_x = (previous.x - current.x) * (point.z - current.z)
                / (previous.z - current.z)
                + current.x;
            if point.x < crossing_x {
                inside = !inside;
            }
        }

        edge_distance =
            edge_distance.min(squared_point_segment_distance_2d(point, previous, current));
    }

    if inside {
        -edge_distance
    } else {
        edge_distance
    }
}

/// The polygon's narrowest extent: the minimum over edges of the farthest
/// vertex from that edge.
fn polygon_min_extent(vertices: &[U16Vec3]) -> f32 {
    let mut narrowest = f32::MAX;

    for edge in 0..vertices.len() {
        let edge_end = (edge + 1) % vertices.len();
        let a = vertices[edge].as_vec3();
        let b = vertices[edge_end].as_vec3();

        let farthest = vertices
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != edge && *index != edge_end)
            .map(|(_, vertex)| squared_point_segment_distance_2d(vertex.as_vec3(), a, b))
            .fold(0.0, f32::max);

        narrowest = narrowest.min(farthest);
    }

    narrowest.sqrt()
}

#[cfg(test)]
mod tests {
    use std::num::{NonZeroU16, NonZeroU8};

    use bevy::math::{UVec2, Vec3};

    use crate::{
        context::BuildContext,
        heightfields::{
            build_heightfield_tile, build_open_heightfield_tile, calculate_distance_field,
            erode_walkable_area, mark_walkable_triangles, OpenTile,
        },
        mesher::{build_poly_mesh, polygon_vertex_count, PolyMesh},
        regions::build_regions,
        DetailMeshSettings, NavMeshSettings, TriangleMesh,
    };

    use super::build_poly_mesh_detail;

    fn test_settings(sample_distance: u16) -> NavMeshSettings {
        NavMeshSettings {
            cell_width: 0.5,
            cell_height: 0.25,
            tile_width: NonZeroU16::new(24).unwrap(),
            border_size: 0,
            world_half_extents: 12.0,
            world_bottom_bound: 0.0,
            max_traversable_slope_radians: 45.0_f32.to_radians(),
            walkable_height: 4,
            walkable_radius: 1,
            step_height: 2,
            min_region_area: 4,
            max_region_area_to_merge_into: 1000,
            max_edge_length: 0,
            max_contour_simplification_error: 1.1,
            contour_tessellation: 0,
            max_vertices_per_polygon: NonZeroU8::new(6).unwrap(),
            partition_strategy: crate::PartitionStrategy::Watershed,
            detail: DetailMeshSettings {
                sample_distance,
                max_sample_error: 1.0,
            },
        }
    }

    fn floor_pipeline(settings: &NavMeshSettings) -> (OpenTile, PolyMesh) {
        let positions = vec![
            Vec3::new(-12.0, 0.25, -12.0),
            Vec3::new(12.0, 0.25, -12.0),
            Vec3::new(12.0, 0.25, 12.0),
            Vec3::new(-12.0, 0.25, 12.0),
        ];
        let indices = vec![[0, 2, 1], [0, 3, 2]];
        let areas = mark_walkable_triangles(&positions, &indices, 45.0_f32.to_radians());

        let mut ctx = BuildContext::new();
        let mesh = TriangleMesh {
            positions: &positions,
            indices: &indices,
            areas: None,
        };
        let voxelized =
            build_heightfield_tile(&mut ctx, UVec2::ZERO, &mesh, &areas, settings).unwrap();
        let mut open_tile = build_open_heightfield_tile(voxelized, settings);
        erode_walkable_area(&mut open_tile, settings);
        calculate_distance_field(&mut open_tile, settings);
        build_regions(&mut open_tile, settings);

        let contour_set = crate::contour::build_contours(&open_tile, settings);
        let poly_mesh = build_poly_mesh(&mut ctx, &contour_set, settings);

        (open_tile, poly_mesh)
    }

    #[test]
    fn every_polygon_gets_a_detail_slice() {
        let settings = test_settings(4);
        let (open_tile, poly_mesh) = floor_pipeline(&settings);

        let mut ctx = BuildContext::new();
        let detail = build_poly_mesh_detail(&mut ctx, &poly_mesh, &open_tile, &settings);

        assert_eq!(detail.meshes.len(), poly_mesh.polygons.len());

        for (slice, polygon) in detail.meshes.iter().zip(poly_mesh.polygons.iter()) {
            let polygon_vertices = polygon_vertex_count(polygon) as u32;
            assert!(slice.vertex_count >= polygon_vertices);
            assert!(slice.triangle_count >= polygon_vertices - 2);

            // The slice leads with the polygon's own vertices.
            for (i, polygon_vertex) in polygon
                .iter()
                .take(polygon_vertices as usize)
                .enumerate()
            {
                let detail_vertex = detail.vertices[(slice.vertex_base + i as u32) as usize];
                let mesh_vertex = poly_mesh.vertices[*polygon_vertex as usize];
                assert_eq!(detail_vertex.x as u32, mesh_vertex.x);
                assert_eq!(detail_vertex.z as u32, mesh_vertex.z);
            }

            // Triangle indices stay within the slice.
            for triangle in detail.triangles
                [slice.triangle_base as usize..(slice.triangle_base + slice.triangle_count) as usize]
                .iter()
            {
                for index in triangle.vertices {
                    assert!(index < slice.vertex_count);
                }
            }
        }
    }

    #[test]
    fn zero_sample_distance_degenerates_to_fan() {
        let settings = test_settings(0);
        let (open_tile, poly_mesh) = floor_pipeline(&settings);

        let mut ctx = BuildContext::new();
        let detail = build_poly_mesh_detail(&mut ctx, &poly_mesh, &open_tile, &settings);

        for (slice, polygon) in detail.meshes.iter().zip(poly_mesh.polygons.iter()) {
            let polygon_vertices = polygon_vertex_count(polygon) as u32;
            assert_eq!(slice.vertex_count, polygon_vertices);
            assert_eq!(slice.triangle_count, polygon_vertices - 2);
        }
    }

    #[test]
    fn hull_edges_are_flagged() {
        let settings = test_settings(0);
        let (open_tile, poly_mesh) = floor_pipeline(&settings);

        let mut ctx = BuildContext::new();
        let detail = build_poly_mesh_detail(&mut ctx, &poly_mesh, &open_tile, &settings);

        // In a fan triangulation every triangle has at least one hull edge.
        for triangle in &detail.triangles {
            assert_ne!(triangle.edge_flags, 0);
        }
    }

    #[test]
    fn detail_heights_track_the_floor() {
        let settings = test_settings(4);
        let (open_tile, poly_mesh) = floor_pipeline(&settings);

        let mut ctx = BuildContext::new();
        let detail = build_poly_mesh_detail(&mut ctx, &poly_mesh, &open_tile, &settings);

        // Flat floor at y = 0.25 rasterizes to cell height 1.
        for vertex in &detail.vertices {
            assert_eq!(vertex.y, 1);
        }
    }
}
