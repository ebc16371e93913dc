//! Tiled nav-mesh generation & pathfinding for 3D worlds.
//!
//! Takes in a triangle soup (flat vertex & index buffers) describing your level's
//! collision geometry and voxelizes it into tiles of convex walkable polygons,
//! which can then be queried using [query::find_path].
//!
//! ## Quick-start:
//! **Nav-mesh generation:**
//! 1. Create a [NavMeshSettings] describing your agent & world, e.g. with
//!    [NavMeshSettings::from_agent_and_bounds].
//! 2. For each tile touched by your geometry, call [build_tile] with a
//!    [BuildContext](context::BuildContext) and a [TriangleMesh] view of the
//!    vertices & indices overlapping that tile (including its `border_size` margin).
//! 3. Insert the resulting tiles into a [NavMesh](tiles::NavMesh) with
//!    [NavMesh::add_tile](tiles::NavMesh::add_tile). Adjacent tiles are stitched
//!    together across their shared edges automatically.
//!
//! **Querying the nav-mesh / Pathfinding:**
//! 1. Call [query::find_path] with the [NavMesh](tiles::NavMesh), a start & end
//!    position, and a [QueryFilter](query::QueryFilter).
//!
//! The [NavMesh](tiles::NavMesh) is a plain value: one logical writer may call
//! [add_tile](tiles::NavMesh::add_tile)/[remove_tile](tiles::NavMesh::remove_tile)
//! at a time, while any number of readers may run queries concurrently when no
//! writer is active. Wrap it in a ``RwLock`` (or equivalent) to enforce this.
//!
//! ## FAQ
//!
//! > My geometry uses a different coordinate system.
//!
//! The crate assumes a right-handed coordinate system, +Y up, triangles wound
//! counter-clockwise when seen from above. Convert your geometry before building;
//! no implicit conversion is performed.
//!
//! > Do I have to mark walkable triangles myself?
//!
//! No. When [TriangleMesh::areas] is ``None`` the build marks triangles by slope
//! using [heightfields::mark_walkable_triangles]. Supply explicit areas to give
//! surfaces custom area ids (water, roads, ...) or to exclude them outright.

use std::num::{NonZeroU16, NonZeroU8};

use bevy::math::{UVec2, Vec2, Vec3};
use thiserror::Error;

use context::{BuildContext, DiagnosticCode};
use contour::build_contours;
use detail_mesh::build_poly_mesh_detail;
use heightfields::{
    build_heightfield_tile, build_open_heightfield_tile, calculate_distance_field,
    erode_walkable_area, filter_ledge_spans, filter_low_hanging_walkable_obstacles,
    filter_walkable_low_height_spans, mark_walkable_triangles,
};
use mesher::build_poly_mesh;
use regions::{build_layer_regions, build_regions, build_regions_monotone};
use tiles::{create_nav_mesh_tile_from_poly_mesh, NavMeshTile};

pub mod context;
pub mod contour;
pub mod detail_mesh;
pub mod heightfields;
mod math;
pub mod mesher;
pub mod query;
pub mod regions;
pub mod tiles;

/// Flag packed into a contour vertex' ``w`` component marking it as lying on
/// the tile border ring. Border vertices never receive a portal direction at
/// mesh build time; cross-tile portals are assigned when tiles are stitched.
const FLAG_BORDER_VERTEX: u32 = 0x10000;
const MASK_CONTOUR_REGION: u32 = 0xffff; // Masks out the above value.

/// Split long contour edges bordering un-walkable space ("walls").
pub const CONTOUR_TESS_WALL_EDGES: u8 = 0b01;
/// Split long contour edges bordering another region ("portals").
pub const CONTOUR_TESS_AREA_EDGES: u8 = 0b10;

/// Padding value for unused polygon vertex slots.
pub const NULL_INDEX: u32 = u32::MAX;

/*
*   Neighbours:
*   0: (-1, 0),
*   1: (0, 1),
*   2: (1, 0),
*   3: (0, -1)
*/

/// Area id of a walkable span or polygon.
///
/// ``0`` is reserved for un-walkable space, represented as ``Option::None``
/// throughout the build. [Area::WALKABLE] is the id assigned by the slope test.
/// When overlapping spans merge, the higher id wins.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Area(pub u8);

impl Area {
    /// Default id for triangles passing the slope test.
    pub const WALKABLE: Area = Area(63);
}

/// Which algorithm assigns region ids to walkable spans before contouring.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum PartitionStrategy {
    /// Distance-field watershed. Best polygon quality, slowest. May produce
    /// holes or overlaps in rare thin-corridor layouts.
    #[default]
    Watershed,
    /// Row sweep with column merge. No holes, may produce long thin regions.
    Monotone,
    /// Like [PartitionStrategy::Monotone] but keeps overlapping floors in
    /// distinct regions. Use for tiles with stacked walkable surfaces.
    Layers,
}

/// A view of triangle-soup collision geometry in world space.
///
/// Right-handed, +Y up, counter-clockwise winding seen from above.
#[derive(Clone, Copy)]
pub struct TriangleMesh<'a> {
    pub positions: &'a [Vec3],
    pub indices: &'a [[u32; 3]],
    /// Optional per-triangle area ids. ``None`` marks triangles by slope with
    /// [heightfields::mark_walkable_triangles]; an entry of ``None`` excludes
    /// that triangle from the walkable surface.
    pub areas: Option<&'a [Option<Area>]>,
}

/// Settings for generating height-corrected detail meshes.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct DetailMeshSettings {
    /// Distance between height samples in cells. ``0`` disables edge & interior
    /// sampling entirely, leaving a fan triangulation of each polygon.
    ///
    /// **Suggested value:** >= 2. Start high & reduce as needed.
    pub sample_distance: u16,
    /// The maximum acceptable error between the detail mesh & the sampled
    /// surface height, in cell_height(s).
    pub max_sample_error: f32,
}

impl Default for DetailMeshSettings {
    fn default() -> Self {
        Self {
            sample_distance: 4,
            max_sample_error: 1.0,
        }
    }
}

/// Settings for nav-mesh generation.
#[derive(Clone)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct NavMeshSettings {
    /// The horizontal resolution of the voxelized tile.
    ///
    /// **Suggested value**: 1/2 of character radius.
    ///
    /// Smaller values will increase tile generation times with diminishing returns in nav-mesh detail.
    pub cell_width: f32,
    /// The vertical resolution of the voxelized tile.
    ///
    /// **Suggested value**: 1/2 of cell_width.
    pub cell_height: f32,

    /// Length of a tile's side in cells. Resulting size in world units is ``tile_width * cell_width``.
    ///
    /// Higher means more to update each time something within the tile changes, smaller means more
    /// overhead from stitching tile edges & generating the tiles themselves.
    pub tile_width: NonZeroU16,
    /// Un-meshed margin of cells rasterized around the tile so that erosion & region building can
    /// see the neighbouring geometry. May be ``0`` for solo (single-tile) builds.
    ///
    /// **Suggested value**: ``walkable_radius + 1`` for tiled builds.
    pub border_size: u16,

    /// Extents of the world as measured from the world origin (0.0, 0.0) on the XZ-plane.
    ///
    /// **Suggested value**: As small as possible whilst still keeping the entire world within it.
    ///
    /// This exists because figuring out which tile we are in around the world origin would not work without it.
    pub world_half_extents: f32,
    /// Bottom extents of the world on the Y-axis. The top extents is capped by ``world_bottom_bound + cell_height * u16::MAX``.
    ///
    /// **Suggested value**: Minimum Y position of anything in the world that should be covered by the nav mesh.
    pub world_bottom_bound: f32,

    /// Maximum incline/slope traversable when navigating in radians.
    pub max_traversable_slope_radians: f32,
    /// Minimum open height for an area to be considered walkable in cell_height(s).
    ///
    /// **Suggested value**: The height of your character in cells, rounded up.
    pub walkable_height: u16,
    /// This will "pull-back" the nav-mesh from edges, meaning anywhere on the nav-mesh will be
    /// walkable for a character with a radius of ``walkable_radius * cell_width``.
    ///
    /// **Suggested value**: ``ceil(character_radius / cell_width)``
    pub walkable_radius: u16,
    /// Maximum height difference that is still considered traversable in cell_height(s). This
    /// smooths out stair steps and small ledges.
    pub step_height: u16,

    /// Minimum size of a region in cells, anything smaller than this will be removed. This is used
    /// to filter out smaller disconnected islands that may appear on surfaces like tables.
    pub min_region_area: u32,
    /// Maximum size of a region in cells we can merge other regions into.
    pub max_region_area_to_merge_into: u32,

    /// Maximum length of a contour edge before it's split, in cells. ``0`` disables splitting.
    ///
    /// **Suggested value**: Start high and reduce if there are issues.
    pub max_edge_length: u16,
    /// Maximum difference allowed for simplified contour generation on the XZ-plane in cell_width(s).
    ///
    /// **Suggested value range**: `[1.1, 1.5]`
    pub max_contour_simplification_error: f32,
    /// Which contour edges [NavMeshSettings::max_edge_length] applies to. A combination of
    /// [CONTOUR_TESS_WALL_EDGES] & [CONTOUR_TESS_AREA_EDGES].
    pub contour_tessellation: u8,

    /// Maximum vertices of a single nav-mesh polygon. Must be within ``3..=12``.
    ///
    /// **Suggested value**: 5-6. Higher values produce fewer polygons but cost more per polygon
    /// in queries.
    pub max_vertices_per_polygon: NonZeroU8,
    /// How walkable spans are grouped into regions.
    pub partition_strategy: PartitionStrategy,

    /// Height-corrects nav-mesh polygons where the polygon surface differs too much from the true
    /// surface. Sampling is controlled per [DetailMeshSettings].
    pub detail: DetailMeshSettings,
}

impl NavMeshSettings {
    /// Helper function for creating nav-mesh settings with reasonable defaults from the size of
    /// your navigation agent and bounds of your world.
    #[inline]
    pub fn from_agent_and_bounds(
        agent_radius: f32,
        agent_height: f32,
        world_half_extents: f32,
        world_bottom_bound: f32,
    ) -> Self {
        let cell_width = agent_radius / 2.0;
        let cell_height = agent_radius / 4.0;

        let walkable_height = (agent_height / cell_height).ceil() as u16;

        Self {
            cell_width,
            cell_height,
            tile_width: NonZeroU16::new(120).unwrap(),
            border_size: 3,
            world_half_extents: world_half_extents.abs(),
            world_bottom_bound,
            max_traversable_slope_radians: 50.0_f32.to_radians(),
            walkable_height,
            walkable_radius: 2,
            step_height: 3,
            min_region_area: 100,
            max_region_area_to_merge_into: 500,
            max_edge_length: 80,
            max_contour_simplification_error: 1.1,
            contour_tessellation: CONTOUR_TESS_WALL_EDGES,
            max_vertices_per_polygon: NonZeroU8::new(6).unwrap(),
            partition_strategy: PartitionStrategy::Watershed,
            detail: DetailMeshSettings::default(),
        }
    }

    /// Setter for [`NavMeshSettings::walkable_radius`]
    pub fn with_walkable_radius(mut self, walkable_radius: u16) -> Self {
        self.walkable_radius = walkable_radius;

        self
    }
    /// Setter for [`NavMeshSettings::tile_width`]
    pub fn with_tile_width(mut self, tile_width: NonZeroU16) -> Self {
        self.tile_width = tile_width;

        self
    }
    /// Setter for [`NavMeshSettings::border_size`]
    pub fn with_border_size(mut self, border_size: u16) -> Self {
        self.border_size = border_size;

        self
    }
    /// Setter for [`NavMeshSettings::max_traversable_slope_radians`]
    pub fn with_traversible_slope(mut self, traversible_slope: f32) -> Self {
        self.max_traversable_slope_radians = traversible_slope;

        self
    }
    /// Setter for [`NavMeshSettings::step_height`]
    pub fn with_step_height(mut self, step_height: u16) -> Self {
        self.step_height = step_height;

        self
    }
    /// Setter for [`NavMeshSettings::min_region_area`] & [`NavMeshSettings::max_region_area_to_merge_into`]
    pub fn with_region_area(
        mut self,
        min_region_area: u32,
        max_region_area_to_merge_into: u32,
    ) -> Self {
        self.min_region_area = min_region_area;
        self.max_region_area_to_merge_into = max_region_area_to_merge_into;

        self
    }
    /// Setter for [`NavMeshSettings::max_contour_simplification_error`]
    pub fn with_max_contour_simplification_error(
        mut self,
        max_contour_simplification_error: f32,
    ) -> Self {
        self.max_contour_simplification_error = max_contour_simplification_error;

        self
    }
    /// Setter for [`NavMeshSettings::max_edge_length`] & [`NavMeshSettings::contour_tessellation`]
    pub fn with_edge_tessellation(mut self, max_edge_length: u16, flags: u8) -> Self {
        self.max_edge_length = max_edge_length;
        self.contour_tessellation = flags;

        self
    }
    /// Setter for [`NavMeshSettings::max_vertices_per_polygon`]
    pub fn with_max_vertices_per_polygon(mut self, max_vertices_per_polygon: NonZeroU8) -> Self {
        self.max_vertices_per_polygon = max_vertices_per_polygon;

        self
    }
    /// Setter for [`NavMeshSettings::partition_strategy`]
    pub fn with_partition_strategy(mut self, partition_strategy: PartitionStrategy) -> Self {
        self.partition_strategy = partition_strategy;

        self
    }
    /// Setter for [`NavMeshSettings::detail`]
    pub fn with_detail_mesh_settings(mut self, detail: DetailMeshSettings) -> Self {
        self.detail = detail;

        self
    }

    /// Checks the settings for values the pipeline cannot build with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.cell_width.is_finite() && self.cell_width > 0.0) {
            return Err(ConfigError::InvalidCellWidth(self.cell_width));
        }
        if !(self.cell_height.is_finite() && self.cell_height > 0.0) {
            return Err(ConfigError::InvalidCellHeight(self.cell_height));
        }
        if !(self.world_half_extents.is_finite() && self.world_half_extents > 0.0) {
            return Err(ConfigError::InvalidWorldHalfExtents(self.world_half_extents));
        }
        if !self.world_bottom_bound.is_finite() {
            return Err(ConfigError::InvalidWorldBottomBound(self.world_bottom_bound));
        }
        let max_vertices = self.max_vertices_per_polygon.get();
        if !(3..=12).contains(&max_vertices) {
            return Err(ConfigError::InvalidMaxVerticesPerPolygon(max_vertices));
        }
        if !(self.max_contour_simplification_error.is_finite()
            && self.max_contour_simplification_error >= 0.0)
        {
            return Err(ConfigError::InvalidSimplificationError(
                self.max_contour_simplification_error,
            ));
        }

        Ok(())
    }

    /// Returns the length of a tile's side in world units.
    #[inline]
    pub fn get_tile_size(&self) -> f32 {
        self.cell_width * f32::from(self.tile_width.get())
    }
    #[inline]
    pub fn get_border_size(&self) -> f32 {
        f32::from(self.border_size) * self.cell_width
    }

    /// Returns the tile coordinate that contains the supplied ``world_position``.
    #[inline]
    pub fn get_tile_containing_position(&self, world_position: Vec2) -> UVec2 {
        let offset_world = world_position + self.world_half_extents;

        (offset_world / self.get_tile_size()).as_uvec2()
    }

    /// Returns the minimum bound of a tile on the XZ-plane.
    #[inline]
    pub fn get_tile_origin(&self, tile: UVec2) -> Vec2 {
        tile.as_vec2() * self.get_tile_size() - self.world_half_extents
    }

    /// Returns the origin of a tile on the XZ-plane including the border area.
    #[inline]
    pub fn get_tile_origin_with_border(&self, tile: UVec2) -> Vec2 {
        self.get_tile_origin(tile) - self.get_border_size()
    }

    #[inline]
    pub fn get_tile_side_with_border(&self) -> usize {
        usize::from(self.tile_width.get()) + usize::from(self.border_size) * 2
    }
    #[inline]
    pub fn get_border_side(&self) -> usize {
        self.border_size.into()
    }

    /// Returns the minimum & maximum bound of a tile on the XZ-plane.
    #[inline]
    pub fn get_tile_bounds(&self, tile: UVec2) -> (Vec2, Vec2) {
        let tile_size = self.get_tile_size();

        let min_bound = tile.as_vec2() * tile_size - self.world_half_extents;
        let max_bound = min_bound + tile_size;

        (min_bound, max_bound)
    }
}

/// Settings values the pipeline cannot build with.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ConfigError {
    #[error("cell_width must be positive & finite, got {0}")]
    InvalidCellWidth(f32),
    #[error("cell_height must be positive & finite, got {0}")]
    InvalidCellHeight(f32),
    #[error("world_half_extents must be positive & finite, got {0}")]
    InvalidWorldHalfExtents(f32),
    #[error("world_bottom_bound must be finite, got {0}")]
    InvalidWorldBottomBound(f32),
    #[error("max_vertices_per_polygon must be within 3..=12, got {0}")]
    InvalidMaxVerticesPerPolygon(u8),
    #[error("max_contour_simplification_error must be non-negative & finite, got {0}")]
    InvalidSimplificationError(f32),
}

/// Errors failing an entire tile build. Recoverable degeneracies are instead
/// reported through the [BuildContext].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("degenerate input geometry: {0}")]
    InputDegenerate(&'static str),
}

/// Builds a single nav-mesh tile from the supplied geometry.
///
/// ``mesh`` should contain all geometry overlapping the tile including its
/// ``border_size`` margin; triangles outside are clipped away for free. The
/// resulting tile still has to be inserted into a [NavMesh](tiles::NavMesh)
/// to be linked to its neighbours & queried.
///
/// A tile with zero polygons is a valid result, keeping the caller's tile
/// bookkeeping consistent when e.g. all geometry in the tile is too steep.
pub fn build_tile(
    ctx: &mut BuildContext,
    tile_coord: UVec2,
    mesh: &TriangleMesh,
    nav_mesh_settings: &NavMeshSettings,
) -> Result<NavMeshTile, BuildError> {
    nav_mesh_settings.validate()?;
    validate_triangle_mesh(mesh)?;

    ctx.start_timer("build tile");

    let marked_areas;
    let areas = match mesh.areas {
        Some(areas) => areas,
        None => {
            marked_areas = mark_walkable_triangles(
                mesh.positions,
                mesh.indices,
                nav_mesh_settings.max_traversable_slope_radians,
            );
            &marked_areas
        }
    };

    let mut voxelized_tile = {
        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("Build Heightfield Tile").entered();
        ctx.start_timer("rasterize");
        let tile = build_heightfield_tile(ctx, tile_coord, mesh, areas, nav_mesh_settings);
        ctx.stop_timer();
        tile?
    };

    {
        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("Filter walkable spans").entered();
        ctx.start_timer("filter spans");
        filter_low_hanging_walkable_obstacles(&mut voxelized_tile, nav_mesh_settings.step_height);
        filter_ledge_spans(
            &mut voxelized_tile,
            nav_mesh_settings.walkable_height,
            nav_mesh_settings.step_height,
        );
        filter_walkable_low_height_spans(&mut voxelized_tile, nav_mesh_settings.walkable_height);
        ctx.stop_timer();
    }

    let mut open_tile = {
        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("Build Open Heightfield Tile").entered();
        ctx.start_timer("build open heightfield");
        let tile = build_open_heightfield_tile(voxelized_tile, nav_mesh_settings);
        ctx.stop_timer();
        tile
    };

    // Remove areas that are too close to a wall.
    {
        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("Erode walkable area").entered();
        ctx.start_timer("erode walkable area");
        erode_walkable_area(&mut open_tile, nav_mesh_settings);
        ctx.stop_timer();
    }

    {
        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("Build regions").entered();
        ctx.start_timer("build regions");
        match nav_mesh_settings.partition_strategy {
            PartitionStrategy::Watershed => {
                calculate_distance_field(&mut open_tile, nav_mesh_settings);
                build_regions(&mut open_tile, nav_mesh_settings);
            }
            PartitionStrategy::Monotone => {
                build_regions_monotone(&mut open_tile, nav_mesh_settings);
            }
            PartitionStrategy::Layers => {
                build_layer_regions(&mut open_tile, nav_mesh_settings);
            }
        }
        ctx.stop_timer();
    }

    let contour_set = {
        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("Build contours").entered();
        ctx.start_timer("build contours");
        let contour_set = build_contours(&open_tile, nav_mesh_settings);
        ctx.stop_timer();
        contour_set
    };

    let poly_mesh = {
        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("Build poly mesh").entered();
        ctx.start_timer("build poly mesh");
        let poly_mesh = build_poly_mesh(ctx, &contour_set, nav_mesh_settings);
        ctx.stop_timer();
        poly_mesh
    };

    let detail_mesh = {
        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("Build detail mesh").entered();
        ctx.start_timer("build detail mesh");
        let detail_mesh = build_poly_mesh_detail(ctx, &poly_mesh, &open_tile, nav_mesh_settings);
        ctx.stop_timer();
        detail_mesh
    };

    let tile = {
        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("Create nav-mesh tile from poly mesh").entered();
        ctx.start_timer("create tile");
        let tile = create_nav_mesh_tile_from_poly_mesh(
            poly_mesh,
            detail_mesh,
            tile_coord,
            nav_mesh_settings,
        );
        ctx.stop_timer();
        tile
    };

    ctx.stop_timer();
    ctx.info(
        "build tile",
        DiagnosticCode::StageReport,
        format!("built tile with {} polygons", tile.polygons.len()),
    );

    Ok(tile)
}

fn validate_triangle_mesh(mesh: &TriangleMesh) -> Result<(), BuildError> {
    if mesh.positions.is_empty() || mesh.indices.is_empty() {
        return Err(BuildError::InputDegenerate("empty mesh"));
    }
    if mesh.positions.iter().any(|position| !position.is_finite()) {
        return Err(BuildError::InputDegenerate("non-finite vertex position"));
    }
    let vertex_count = mesh.positions.len() as u32;
    if mesh
        .indices
        .iter()
        .flatten()
        .any(|index| *index >= vertex_count)
    {
        return Err(BuildError::InputDegenerate("vertex index out of bounds"));
    }
    if let Some(areas) = mesh.areas {
        if areas.len() != mesh.indices.len() {
            return Err(BuildError::InputDegenerate(
                "area count does not match triangle count",
            ));
        }
    }

    Ok(())
}

fn get_neighbour_index(tile_size: usize, index: usize, dir: usize) -> usize {
    match dir {
        0 => index - 1,
        1 => index + tile_size,
        2 => index + 1,
        3 => index - tile_size,
        _ => panic!("Not a valid direction"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        let settings = NavMeshSettings::from_agent_and_bounds(0.5, 1.9, 250.0, -25.0);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn polygon_cap_is_enforced() {
        let settings = NavMeshSettings::from_agent_and_bounds(0.5, 1.9, 250.0, -25.0)
            .with_max_vertices_per_polygon(NonZeroU8::new(13).unwrap());
        assert_eq!(
            settings.validate(),
            Err(ConfigError::InvalidMaxVerticesPerPolygon(13))
        );
    }

    #[test]
    fn degenerate_input_fails_the_build() {
        let settings = NavMeshSettings::from_agent_and_bounds(0.5, 1.9, 10.0, -1.0);
        let mut ctx = BuildContext::new();

        let empty = TriangleMesh {
            positions: &[],
            indices: &[],
            areas: None,
        };
        assert_eq!(
            build_tile(&mut ctx, UVec2::ZERO, &empty, &settings),
            Err(BuildError::InputDegenerate("empty mesh"))
        );

        let positions = [Vec3::ZERO, Vec3::X, Vec3::new(f32::NAN, 0.0, 1.0)];
        let indices = [[0, 1, 2]];
        let nan = TriangleMesh {
            positions: &positions,
            indices: &indices,
            areas: None,
        };
        assert_eq!(
            build_tile(&mut ctx, UVec2::ZERO, &nan, &settings),
            Err(BuildError::InputDegenerate("non-finite vertex position"))
        );
    }

    #[test]
    fn tile_coordinate_round_trips_through_origin() {
        let settings = NavMeshSettings::from_agent_and_bounds(0.5, 1.9, 250.0, -25.0);

        let tile = UVec2::new(3, 5);
        let origin = settings.get_tile_origin(tile);
        assert_eq!(
            settings.get_tile_containing_position(origin + settings.get_tile_size() * 0.5),
            tile
        );
    }
}
