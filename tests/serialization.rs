//! Round-trip tests for the `serialize` feature: a nav-mesh survives JSON
//! unchanged, structurally & behaviourally.

use std::num::{NonZeroU16, NonZeroU8};

use bevy::math::{UVec2, Vec3};
use stitched_navigation::{
    build_tile,
    context::BuildContext,
    query::{find_nearest_polygon, find_path, DefaultQueryFilter},
    tiles::{NavMesh, OffMeshConnection, OffMeshDirection, TileKey},
    Area, DetailMeshSettings, NavMeshSettings, PartitionStrategy, TriangleMesh,
};

fn settings() -> NavMeshSettings {
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
            sample_distance: 4,
            max_sample_error: 1.0,
        },
    }
}

fn build_two_floor_nav_mesh() -> (NavMesh, u64) {
    let settings = settings();

    let mut positions = Vec::new();
    let mut indices = Vec::new();
    for (min_x, max_x) in [(-5.0_f32, -1.5_f32), (1.5, 5.0)] {
        let base = positions.len() as u32;
        positions.extend([
            Vec3::new(min_x, 0.0, -5.0),
            Vec3::new(max_x, 0.0, -5.0),
            Vec3::new(max_x, 0.0, 5.0),
            Vec3::new(min_x, 0.0, 5.0),
        ]);
        indices.extend([[base, base + 2, base + 1], [base, base + 3, base + 2]]);
    }

    let mut ctx = BuildContext::new();
    let mesh = TriangleMesh {
        positions: &positions,
        indices: &indices,
        areas: None,
    };
    let tile = build_tile(&mut ctx, UVec2::ZERO, &mesh, &settings).unwrap();

    let mut nav_mesh = NavMesh::new();
    nav_mesh.add_tile(TileKey::new(UVec2::ZERO), tile);

    let connection = nav_mesh
        .add_off_mesh_connection(OffMeshConnection {
            start: Vec3::new(-2.5, 0.0, 0.0),
            end: Vec3::new(2.5, 0.0, 0.0),
            radius: 0.5,
            direction: OffMeshDirection::Bidirectional,
            area: Area::WALKABLE,
            flags: 1,
            cost: None,
        })
        .unwrap();

    (nav_mesh, connection)
}

#[test]
fn json_round_trip_is_stable() {
    let (nav_mesh, _) = build_two_floor_nav_mesh();

    let serialized = serde_json::to_string(&nav_mesh).unwrap();
    let deserialized: NavMesh = serde_json::from_str(&serialized).unwrap();
    let serialized_again = serde_json::to_string(&deserialized).unwrap();

    assert_eq!(serialized, serialized_again);
}

#[test]
fn queries_survive_the_round_trip() {
    let (nav_mesh, connection) = build_two_floor_nav_mesh();

    let serialized = serde_json::to_string(&nav_mesh).unwrap();
    let restored: NavMesh = serde_json::from_str(&serialized).unwrap();

    let start = Vec3::new(-4.0, 0.0, 0.0);
    let end = Vec3::new(4.0, 0.0, 0.0);

    let (original_waypoints, original_partial) = find_path(
        &nav_mesh,
        start,
        end,
        Vec3::splat(1.0),
        &DefaultQueryFilter,
        None,
    )
    .unwrap();
    let (restored_waypoints, restored_partial) = find_path(
        &restored,
        start,
        end,
        Vec3::splat(1.0),
        &DefaultQueryFilter,
        None,
    )
    .unwrap();

    assert_eq!(original_partial, restored_partial);
    assert_eq!(original_waypoints, restored_waypoints);

    // NodeRefs taken before serialization stay valid after.
    let (node_ref, _) =
        find_nearest_polygon(&nav_mesh, start, Vec3::splat(1.0), &DefaultQueryFilter).unwrap();
    assert!(restored.is_valid_node_ref(node_ref));
    assert!(restored.off_mesh_connection(connection).is_some());
    assert!(restored.off_mesh_attachment(connection).is_some());
}
