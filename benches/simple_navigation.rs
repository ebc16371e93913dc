use std::num::{NonZeroU16, NonZeroU8};

use bevy::math::{UVec2, Vec3};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stitched_navigation::{
    build_tile,
    context::BuildContext,
    query::{find_path, DefaultQueryFilter},
    tiles::{NavMesh, TileKey},
    DetailMeshSettings, NavMeshSettings, PartitionStrategy, TriangleMesh,
};

fn bench_settings() -> NavMeshSettings {
    NavMeshSettings {
        cell_width: 0.25,
        cell_height: 0.1,
        tile_width: NonZeroU16::new(100).unwrap(),
        border_size: 0,
        world_half_extents: 12.5,
        world_bottom_bound: -1.0,
        max_traversable_slope_radians: (40.0_f32 - 0.1).to_radians(),
        walkable_height: 20,
        walkable_radius: 1,
        step_height: 3,
        min_region_area: 100,
        max_region_area_to_merge_into: 500,
        max_edge_length: 80,
        max_contour_simplification_error: 1.1,
        contour_tessellation: stitched_navigation::CONTOUR_TESS_WALL_EDGES,
        max_vertices_per_polygon: NonZeroU8::new(6).unwrap(),
        partition_strategy: PartitionStrategy::Watershed,
        detail: DetailMeshSettings {
            sample_distance: 0,
            max_sample_error: 1.0,
        },
    }
}

fn build_nav_mesh() -> NavMesh {
    let nav_mesh_settings = bench_settings();

    // A floor with a wide obstacle paths have to walk around.
    let positions = vec![
        Vec3::new(-10.0, 0.0, -10.0),
        Vec3::new(10.0, 0.0, -10.0),
        Vec3::new(10.0, 0.0, 10.0),
        Vec3::new(-10.0, 0.0, 10.0),
        // Obstacle block.
        Vec3::new(-4.0, 0.0, -1.0),
        Vec3::new(4.0, 0.0, -1.0),
        Vec3::new(4.0, 2.0, -1.0),
        Vec3::new(-4.0, 2.0, -1.0),
        Vec3::new(-4.0, 0.0, 1.0),
        Vec3::new(4.0, 0.0, 1.0),
        Vec3::new(4.0, 2.0, 1.0),
        Vec3::new(-4.0, 2.0, 1.0),
        Vec3::new(-4.0, 2.0, -1.0),
        Vec3::new(4.0, 2.0, -1.0),
        Vec3::new(4.0, 2.0, 1.0),
        Vec3::new(-4.0, 2.0, 1.0),
    ];
    let indices = vec![
        [0, 2, 1],
        [0, 3, 2],
        [4, 5, 6],
        [4, 6, 7],
        [8, 10, 9],
        [8, 11, 10],
        [12, 15, 14],
        [12, 14, 13],
    ];

    let mut ctx = BuildContext::new();
    let mesh = TriangleMesh {
        positions: &positions,
        indices: &indices,
        areas: None,
    };
    let tile = build_tile(&mut ctx, UVec2::ZERO, &mesh, &nav_mesh_settings).unwrap();

    let mut nav_mesh = NavMesh::new();
    nav_mesh.add_tile(TileKey::new(UVec2::ZERO), tile);
    nav_mesh
}

fn criterion_benchmark(c: &mut Criterion) {
    let nav_mesh = build_nav_mesh();

    let start = Vec3::new(-8.0, 0.0, -8.0);
    let end = Vec3::new(8.0, 0.0, 8.0);

    c.bench_function("Find Path Around Obstacle", |b| {
        b.iter(|| {
            black_box(
                find_path(
                    &nav_mesh,
                    black_box(start),
                    black_box(end),
                    Vec3::splat(2.0),
                    &DefaultQueryFilter,
                    None,
                )
                .unwrap(),
            )
        })
    });

    c.bench_function("Generate & Pathfind", |b| {
        b.iter(|| {
            let nav_mesh = build_nav_mesh();
            black_box(
                find_path(
                    &nav_mesh,
                    black_box(start),
                    black_box(end),
                    Vec3::splat(2.0),
                    &DefaultQueryFilter,
                    None,
                )
                .unwrap(),
            )
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
