//! End-to-end tests: triangle soup in, nav-mesh out, queries across it.

use std::num::{NonZeroU16, NonZeroU8};

use bevy::math::{UVec2, Vec3, Vec3Swizzles};
use stitched_navigation::{
    build_tile,
    context::BuildContext,
    query::{
        self, find_nearest_polygon, find_path, move_along_surface, DefaultQueryFilter,
    },
    tiles::{NavMesh, NodeRef, OffMeshConnection, OffMeshDirection, TileKey},
    DetailMeshSettings, NavMeshSettings, PartitionStrategy, TriangleMesh,
};

fn solo_settings() -> NavMeshSettings {
    NavMeshSettings {
        cell_width: 0.2,
        cell_height: 0.1,
        tile_width: NonZeroU16::new(64).unwrap(),
        border_size: 0,
        world_half_extents: 6.4,
        world_bottom_bound: -0.5,
        max_traversable_slope_radians: 45.0_f32.to_radians(),
        walkable_height: 19,
        walkable_radius: 3,
        step_height: 5,
        min_region_area: 10,
        max_region_area_to_merge_into: 4000,
        max_edge_length: 0,
        max_contour_simplification_error: 1.1,
        contour_tessellation: 0,
        max_vertices_per_polygon: NonZeroU8::new(6).unwrap(),
        partition_strategy: PartitionStrategy::Watershed,
        detail: DetailMeshSettings {
            sample_distance: 0,
            max_sample_error: 1.0,
        },
    }
}

fn push_horizontal_quad(
    positions: &mut Vec<Vec3>,
    indices: &mut Vec<[u32; 3]>,
    min_x: f32,
    max_x: f32,
    min_z: f32,
    max_z: f32,
    y: f32,
) {
    let base = positions.len() as u32;
    positions.extend([
        Vec3::new(min_x, y, min_z),
        Vec3::new(max_x, y, min_z),
        Vec3::new(max_x, y, max_z),
        Vec3::new(min_x, y, max_z),
    ]);
    indices.extend([[base, base + 2, base + 1], [base, base + 3, base + 2]]);
}

fn push_vertical_quad_x(
    positions: &mut Vec<Vec3>,
    indices: &mut Vec<[u32; 3]>,
    min_x: f32,
    max_x: f32,
    z: f32,
    min_y: f32,
    max_y: f32,
) {
    let base = positions.len() as u32;
    positions.extend([
        Vec3::new(min_x, min_y, z),
        Vec3::new(max_x, min_y, z),
        Vec3::new(max_x, max_y, z),
        Vec3::new(min_x, max_y, z),
    ]);
    indices.extend([[base, base + 1, base + 2], [base, base + 2, base + 3]]);
}

fn build_solo_nav_mesh(
    positions: &[Vec3],
    indices: &[[u32; 3]],
    settings: &NavMeshSettings,
) -> NavMesh {
    let mut ctx = BuildContext::new();
    let mesh = TriangleMesh {
        positions,
        indices,
        areas: None,
    };
    let tile = build_tile(&mut ctx, UVec2::ZERO, &mesh, settings).expect("tile builds");

    let mut nav_mesh = NavMesh::new();
    nav_mesh.add_tile(TileKey::new(UVec2::ZERO), tile);
    nav_mesh
}

#[test]
fn flat_floor_produces_an_inset_polygon_and_a_straight_path() {
    let settings = solo_settings();

    let mut positions = Vec::new();
    let mut indices = Vec::new();
    push_horizontal_quad(&mut positions, &mut indices, -5.0, 5.0, -5.0, 5.0, 0.0);

    let nav_mesh = build_solo_nav_mesh(&positions, &indices, &settings);

    let tile = nav_mesh.get_tile(&TileKey::new(UVec2::ZERO)).unwrap();
    assert!(!tile.polygons.is_empty());

    // Eroded by walkable_radius = 3 cells = 0.6 m; conservative rasterization
    // may shift the boundary column by one cell.
    for vertex in &tile.vertices {
        assert!(vertex.x.abs() <= 4.65, "vertex {vertex} not inset");
        assert!(vertex.z.abs() <= 4.65, "vertex {vertex} not inset");
        assert!((vertex.y - 0.0).abs() <= 0.11);
    }
    // The mesh still covers the bulk of the floor.
    let max_x = tile
        .vertices
        .iter()
        .map(|vertex| vertex.x)
        .fold(f32::MIN, f32::max);
    assert!(max_x >= 4.0);

    let start = Vec3::new(-4.0, 0.0, -4.0);
    let end = Vec3::new(4.0, 0.0, 4.0);
    let (waypoints, partial) = find_path(
        &nav_mesh,
        start,
        end,
        Vec3::splat(1.0),
        &DefaultQueryFilter,
        None,
    )
    .unwrap();

    assert!(!partial);
    assert_eq!(waypoints.len(), 2);
    assert!(waypoints[0].position.xz().distance(start.xz()) < 0.01);
    assert!(waypoints[1].position.xz().distance(end.xz()) < 0.01);
}

#[test]
fn wall_taller_than_climb_disconnects_the_floor() {
    let settings = solo_settings();

    let mut positions = Vec::new();
    let mut indices = Vec::new();
    push_horizontal_quad(&mut positions, &mut indices, -5.0, 5.0, -5.0, 5.0, 0.0);
    // A 1 m wall across the middle; walkable climb is 0.5 m.
    push_vertical_quad_x(&mut positions, &mut indices, -5.0, 5.0, -0.1, 0.0, 1.0);
    push_vertical_quad_x(&mut positions, &mut indices, -5.0, 5.0, 0.1, 0.0, 1.0);
    push_horizontal_quad(&mut positions, &mut indices, -5.0, 5.0, -0.1, 0.1, 1.0);

    let nav_mesh = build_solo_nav_mesh(&positions, &indices, &settings);

    let start = Vec3::new(0.0, 0.0, -4.0);
    let end = Vec3::new(0.0, 0.0, 4.0);
    let (_, partial) = find_path(
        &nav_mesh,
        start,
        end,
        Vec3::splat(1.0),
        &DefaultQueryFilter,
        None,
    )
    .unwrap();

    assert!(partial, "the wall must split the floor into two islands");

    // Both sides are individually walkable.
    let filter = DefaultQueryFilter;
    assert!(find_nearest_polygon(&nav_mesh, start, Vec3::splat(1.0), &filter).is_some());
    assert!(find_nearest_polygon(&nav_mesh, end, Vec3::splat(1.0), &filter).is_some());
}

#[test]
fn shallow_ramp_is_walkable_and_path_follows_its_centreline() {
    let settings = solo_settings();

    let mut positions = Vec::new();
    let mut indices = Vec::new();
    // Lower floor, ramp rising 1 m over 2 m (~26.5 degrees), upper floor.
    push_horizontal_quad(&mut positions, &mut indices, -3.0, 3.0, -6.0, -1.0, 0.0);
    {
        let base = positions.len() as u32;
        positions.extend([
            Vec3::new(-3.0, 0.0, -1.0),
            Vec3::new(3.0, 0.0, -1.0),
            Vec3::new(3.0, 1.0, 1.0),
            Vec3::new(-3.0, 1.0, 1.0),
        ]);
        indices.extend([[base, base + 2, base + 1], [base, base + 3, base + 2]]);
    }
    push_horizontal_quad(&mut positions, &mut indices, -3.0, 3.0, 1.0, 6.0, 1.0);

    let nav_mesh = build_solo_nav_mesh(&positions, &indices, &settings);

    let start = Vec3::new(0.0, 0.0, -5.0);
    let end = Vec3::new(0.0, 1.0, 5.0);
    let (waypoints, partial) = find_path(
        &nav_mesh,
        start,
        end,
        Vec3::splat(1.5),
        &DefaultQueryFilter,
        None,
    )
    .unwrap();

    assert!(!partial, "the ramp must connect the floors");
    assert!(waypoints.len() >= 2);

    // The path runs up the centreline without straying sideways.
    for waypoint in &waypoints {
        assert!(
            waypoint.position.x.abs() < 0.5,
            "waypoint {:?} strays from the centreline",
            waypoint.position
        );
    }

    let last = waypoints.last().unwrap();
    assert!((last.position.y - 1.0).abs() < 0.2);
}

#[test]
fn off_mesh_teleporter_bridges_disconnected_floors() {
    let settings = solo_settings();

    let mut positions = Vec::new();
    let mut indices = Vec::new();
    // Two floors with a chasm between them.
    push_horizontal_quad(&mut positions, &mut indices, -5.0, -1.5, -5.0, 5.0, 0.0);
    push_horizontal_quad(&mut positions, &mut indices, 1.5, 5.0, -5.0, 5.0, 0.0);

    let mut nav_mesh = build_solo_nav_mesh(&positions, &indices, &settings);

    let connection = nav_mesh
        .add_off_mesh_connection(OffMeshConnection {
            start: Vec3::new(-2.5, 0.0, 0.0),
            end: Vec3::new(2.5, 0.0, 0.0),
            radius: 0.5,
            direction: OffMeshDirection::StartToEnd,
            area: stitched_navigation::Area::WALKABLE,
            flags: 1,
            cost: Some(0.0),
        })
        .expect("both endpoints attach");

    let start = Vec3::new(-4.0, 0.0, 0.0);
    let end = Vec3::new(4.0, 0.0, 0.0);
    let (waypoints, partial) = find_path(
        &nav_mesh,
        start,
        end,
        Vec3::splat(1.0),
        &DefaultQueryFilter,
        None,
    )
    .unwrap();

    assert!(!partial);
    assert!(
        waypoints.iter().any(|waypoint| matches!(
            waypoint.node_ref,
            NodeRef::OffMesh { connection: c, .. } if c == connection
        )),
        "the path must hop through the teleporter"
    );
}

#[test]
fn move_along_surface_stops_at_the_eroded_edge() {
    let settings = solo_settings();

    let mut positions = Vec::new();
    let mut indices = Vec::new();
    push_horizontal_quad(&mut positions, &mut indices, -5.0, 5.0, -5.0, 5.0, 0.0);

    let nav_mesh = build_solo_nav_mesh(&positions, &indices, &settings);

    let start = Vec3::new(0.0, 0.0, 0.0);
    let (start_ref, start_point) =
        find_nearest_polygon(&nav_mesh, start, Vec3::splat(1.0), &DefaultQueryFilter).unwrap();

    let target = Vec3::new(8.0, 0.0, 0.0);
    let result = move_along_surface(
        &nav_mesh,
        start_ref,
        start_point,
        target,
        &DefaultQueryFilter,
    )
    .unwrap();

    // Stopped at the mesh edge: the floor edge at x = 5 pulled back by the
    // walkable radius (0.6 m), give or take a cell.
    assert!(result.position.x <= 4.65);
    assert!(result.position.x >= 4.35);
    assert!(result.position.z.abs() < 0.11);
}

fn tiled_settings() -> NavMeshSettings {
    NavMeshSettings {
        cell_width: 0.25,
        cell_height: 0.1,
        tile_width: NonZeroU16::new(32).unwrap(),
        border_size: 3,
        world_half_extents: 12.0,
        world_bottom_bound: -0.5,
        max_traversable_slope_radians: 45.0_f32.to_radians(),
        walkable_height: 19,
        walkable_radius: 2,
        step_height: 5,
        min_region_area: 10,
        max_region_area_to_merge_into: 4000,
        max_edge_length: 0,
        max_contour_simplification_error: 1.1,
        contour_tessellation: 0,
        max_vertices_per_polygon: NonZeroU8::new(6).unwrap(),
        partition_strategy: PartitionStrategy::Watershed,
        detail: DetailMeshSettings {
            sample_distance: 0,
            max_sample_error: 1.0,
        },
    }
}

fn build_tiled_floor(nav_mesh: &mut NavMesh, settings: &NavMeshSettings) {
    let mut positions = Vec::new();
    let mut indices = Vec::new();
    push_horizontal_quad(&mut positions, &mut indices, -12.0, 12.0, -12.0, 12.0, 0.0);

    let mesh = TriangleMesh {
        positions: &positions,
        indices: &indices,
        areas: None,
    };

    for x in 0..3 {
        for z in 0..3 {
            let coord = UVec2::new(x, z);
            let mut ctx = BuildContext::for_tile(coord);
            let tile = build_tile(&mut ctx, coord, &mesh, settings).expect("tile builds");
            nav_mesh.add_tile(TileKey::new(coord), tile);
        }
    }
}

#[test]
fn tiled_floor_stitches_into_one_walkable_surface() {
    let settings = tiled_settings();
    let mut nav_mesh = NavMesh::new();
    build_tiled_floor(&mut nav_mesh, &settings);

    let start = Vec3::new(-10.0, 0.0, -10.0);
    let end = Vec3::new(10.0, 0.0, 10.0);
    let (waypoints, partial) = find_path(
        &nav_mesh,
        start,
        end,
        Vec3::splat(1.0),
        &DefaultQueryFilter,
        None,
    )
    .unwrap();

    assert!(!partial, "tiles must stitch into one surface");
    let last = waypoints.last().unwrap();
    assert!(last.position.xz().distance(end.xz()) < 0.5);
}

#[test]
fn removing_and_readding_a_tile_retires_node_refs() {
    let settings = tiled_settings();
    let mut nav_mesh = NavMesh::new();
    build_tiled_floor(&mut nav_mesh, &settings);

    // A polygon in the centre tile (1, 1), which spans [-4, 4].
    let centre = Vec3::new(0.0, 0.0, 0.0);
    let (centre_ref, _) =
        find_nearest_polygon(&nav_mesh, centre, Vec3::splat(1.0), &DefaultQueryFilter).unwrap();
    assert!(nav_mesh.is_valid_node_ref(centre_ref));

    let key = TileKey::new(UVec2::new(1, 1));
    let NodeRef::Polygon { tile: old_id, .. } = centre_ref else {
        panic!("nearest node must be a polygon");
    };
    assert_eq!(nav_mesh.get_tile(&key).unwrap().id, old_id);

    nav_mesh.remove_tile(key);
    assert!(!nav_mesh.is_valid_node_ref(centre_ref));

    // The centre of the world is now a hole.
    assert!(
        find_nearest_polygon(&nav_mesh, centre, Vec3::splat(1.0), &DefaultQueryFilter).is_none()
    );

    // Rebuild & re-add the same geometry: a fresh tile id, the old ref stays dead.
    let mut positions = Vec::new();
    let mut indices = Vec::new();
    push_horizontal_quad(&mut positions, &mut indices, -12.0, 12.0, -12.0, 12.0, 0.0);
    let mesh = TriangleMesh {
        positions: &positions,
        indices: &indices,
        areas: None,
    };
    let mut ctx = BuildContext::for_tile(key.coord);
    let tile = build_tile(&mut ctx, key.coord, &mesh, &settings).unwrap();
    let new_id = nav_mesh.add_tile(key, tile);

    assert_ne!(new_id, old_id);
    assert!(!nav_mesh.is_valid_node_ref(centre_ref));

    let (new_ref, _) =
        find_nearest_polygon(&nav_mesh, centre, Vec3::splat(1.0), &DefaultQueryFilter).unwrap();
    assert!(nav_mesh.is_valid_node_ref(new_ref));
    assert_ne!(new_ref, centre_ref);

    // And a path straight through the centre works again.
    let (waypoints, partial) = find_path(
        &nav_mesh,
        Vec3::new(0.0, 0.0, -10.0),
        Vec3::new(0.0, 0.0, 10.0),
        Vec3::splat(1.0),
        &DefaultQueryFilter,
        None,
    )
    .unwrap();
    assert!(!partial);
    assert!(!waypoints.is_empty());
}

#[test]
fn diagnostics_and_timings_are_collected() {
    let settings = solo_settings();

    let mut positions = Vec::new();
    let mut indices = Vec::new();
    push_horizontal_quad(&mut positions, &mut indices, -5.0, 5.0, -5.0, 5.0, 0.0);

    let mut ctx = BuildContext::for_tile(UVec2::ZERO);
    let mesh = TriangleMesh {
        positions: &positions,
        indices: &indices,
        areas: None,
    };
    build_tile(&mut ctx, UVec2::ZERO, &mesh, &settings).unwrap();

    assert_eq!(ctx.error_count(), 0);
    assert!(!ctx.diagnostics().is_empty());

    let timed_stages: Vec<_> = ctx.timings().iter().map(|timing| timing.name).collect();
    for stage in [
        "rasterize",
        "build regions",
        "build contours",
        "build poly mesh",
        "build tile",
    ] {
        assert!(timed_stages.contains(&stage), "missing timing for {stage}");
    }
}

#[test]
fn raycast_and_surface_movement_agree_on_clearance() {
    let settings = solo_settings();

    let mut positions = Vec::new();
    let mut indices = Vec::new();
    push_horizontal_quad(&mut positions, &mut indices, -5.0, 5.0, -5.0, 5.0, 0.0);

    let nav_mesh = build_solo_nav_mesh(&positions, &indices, &settings);

    let start = Vec3::new(-3.0, 0.0, 0.0);
    let (start_ref, start_point) =
        find_nearest_polygon(&nav_mesh, start, Vec3::splat(1.0), &DefaultQueryFilter).unwrap();

    let clear_target = Vec3::new(3.0, 0.0, 0.0);

    let hit = query::raycast(
        &nav_mesh,
        start_ref,
        start_point,
        clear_target,
        &DefaultQueryFilter,
    )
    .unwrap();
    assert_eq!(hit.t, 1.0);

    let surface_move = move_along_surface(
        &nav_mesh,
        start_ref,
        start_point,
        clear_target,
        &DefaultQueryFilter,
    )
    .unwrap();
    assert!(surface_move.position.xz().distance(clear_target.xz()) < 0.01);

    let blocked_target = Vec3::new(8.0, 0.0, 0.0);
    let hit = query::raycast(
        &nav_mesh,
        start_ref,
        start_point,
        blocked_target,
        &DefaultQueryFilter,
    )
    .unwrap();
    assert!(hit.t < 1.0);
}
