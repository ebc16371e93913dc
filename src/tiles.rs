//! The runtime nav-mesh: tiles of convex polygons stitched together across
//! shared edges & off-mesh connections, queried through [crate::query].

use std::collections::HashMap;

use bevy::math::{U16Vec3, UVec2, Vec2, Vec3};
use smallvec::SmallVec;
use thiserror::Error;

use crate::{
    detail_mesh::{DetailMeshSlice, DetailTriangle, PolyMeshDetail},
    mesher::{polygon_vertex_count, EdgeConnection, EdgeConnectionDirection, PolyMesh},
    query, Area, NavMeshSettings,
};

/// Spatial key of a tile: XZ grid coordinate plus a vertical layer for worlds
/// with stacked tile sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TileKey {
    pub coord: UVec2,
    pub layer: u16,
}

impl TileKey {
    pub fn new(coord: UVec2) -> Self {
        Self { coord, layer: 0 }
    }

    /// The neighbouring key in ``direction``, if it doesn't underflow the grid.
    pub fn offset(&self, direction: EdgeConnectionDirection) -> Option<TileKey> {
        let coord = match direction {
            EdgeConnectionDirection::XNegative => {
                if self.coord.x == 0 {
                    return None;
                }
                self.coord - UVec2::X
            }
            EdgeConnectionDirection::ZPositive => self.coord + UVec2::Y,
            EdgeConnectionDirection::XPositive => self.coord + UVec2::X,
            EdgeConnectionDirection::ZNegative => {
                if self.coord.y == 0 {
                    return None;
                }
                self.coord - UVec2::Y
            }
        };

        Some(TileKey {
            coord,
            layer: self.layer,
        })
    }
}

/// A directed adjacency from one polygon to another.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum Link {
    Internal {
        /// Edge index on the polygon this link belongs to.
        edge: u8,
        neighbour_polygon: u16,
    },
    External {
        edge: u8,
        neighbour_polygon: u16,
        direction: EdgeConnectionDirection,
        /// Min of the overlap interval along the edge, as a fraction in 1/255ths.
        bound_min: u8,
        /// Max of the overlap interval along the edge, as a fraction in 1/255ths.
        bound_max: u8,
    },
    OffMesh {
        connection: u64,
        /// Traversing end-to-start. Only present on bidirectional connections.
        reverse: bool,
    },
}

/// A convex polygon of a [NavMeshTile].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Polygon {
    pub indices: Vec<u32>,
    /// Static per-edge descriptor: wall, same-tile neighbour, or tile-boundary
    /// portal direction. [NavMesh::add_tile] turns these into [Link]s.
    pub neighbours: Vec<EdgeConnection>,
    pub links: SmallVec<[Link; 6]>,
    pub area: Area,
    pub flags: u16,
}

/// Node of a tile's bounding-volume tree, in quantised tile-local coordinates.
/// ``i >= 0`` is a polygon index, ``i < 0`` an escape offset for stackless
/// traversal (skip the subtree on miss).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct BvNode {
    pub min: U16Vec3,
    pub max: U16Vec3,
    pub i: i32,
}

/// Per-polygon height detail of a tile. The first ``n`` detail vertices of a
/// polygon's slice alias the polygon's own ``n`` vertices and are not stored;
/// a triangle index ``>= n`` points into [TileDetailMesh::vertices] at
/// ``vertex_base + index - n``.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TileDetailMesh {
    pub meshes: Vec<DetailMeshSlice>,
    pub vertices: Vec<Vec3>,
    pub triangles: Vec<DetailTriangle>,
}

/// One tile of the nav-mesh in world coordinates.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct NavMeshTile {
    /// Monotonically increasing id assigned by [NavMesh::add_tile]. ``0``
    /// until the tile is added. Re-adding a tile at the same key yields a new
    /// id, retiring all [NodeRef]s into the old tile.
    pub id: u64,
    pub key: TileKey,
    pub min_bound: Vec3,
    pub max_bound: Vec3,
    pub cell_width: f32,
    pub cell_height: f32,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    pub vertices: Vec<Vec3>,
    pub polygons: Vec<Polygon>,
    pub detail: TileDetailMesh,
    pub bv_tree: Vec<BvNode>,
}

/// Whether an off-mesh connection may be traversed both ways.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum OffMeshDirection {
    StartToEnd,
    Bidirectional,
}

/// An explicit link between two points of the nav-mesh: a jump, ladder,
/// teleporter & the like.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct OffMeshConnection {
    pub start: Vec3,
    pub end: Vec3,
    /// How far from each endpoint to search for a polygon to attach to.
    pub radius: f32,
    pub direction: OffMeshDirection,
    pub area: Area,
    pub flags: u16,
    /// Traversal cost. ``None`` costs the euclidean distance between the
    /// endpoints; ``Some(0.0)`` models a free teleporter.
    pub cost: Option<f32>,
}

/// Where an off-mesh connection currently hooks into the tile graph.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct OffMeshAttachment {
    pub start_tile: u64,
    pub start_polygon: u16,
    pub start_position: Vec3,
    pub end_tile: u64,
    pub end_polygon: u16,
    pub end_position: Vec3,
}

/// Stable, invalidation-aware handle to a polygon or off-mesh connection hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum NodeRef {
    Polygon { tile: u64, polygon: u16 },
    OffMesh { connection: u64, reverse: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OffMeshConnectionError {
    #[error("no polygon within radius of the start position")]
    NoPolygonAtStart,
    #[error("no polygon within radius of the end position")]
    NoPolygonAtEnd,
}

/// The complete navigation mesh: a grid of stitched tiles plus off-mesh
/// connections.
///
/// One logical writer may add & remove tiles/connections at a time; queries
/// never mutate and may run from any number of readers while no writer is
/// active. Wrap the value in a ``RwLock`` (or equivalent) to enforce this.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(from = "NavMeshData", into = "NavMeshData"))]
pub struct NavMesh {
    tiles: HashMap<TileKey, NavMeshTile>,
    tile_lookup: HashMap<u64, TileKey>,
    next_tile_id: u64,
    off_mesh_connections: HashMap<u64, OffMeshConnection>,
    attachments: HashMap<u64, OffMeshAttachment>,
    next_connection_id: u64,
}

/// Flattened, JSON-friendly form of a [NavMesh]; the tile & connection maps
/// are rebuilt from it on deserialization.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct NavMeshData {
    pub tiles: Vec<NavMeshTile>,
    pub off_mesh_connections: Vec<(u64, OffMeshConnection)>,
    pub attachments: Vec<(u64, OffMeshAttachment)>,
    pub next_tile_id: u64,
    pub next_connection_id: u64,
}

impl From<NavMeshData> for NavMesh {
    fn from(data: NavMeshData) -> Self {
        let tile_lookup = data
            .tiles
            .iter()
            .map(|tile| (tile.id, tile.key))
            .collect();
        NavMesh {
            tiles: data.tiles.into_iter().map(|tile| (tile.key, tile)).collect(),
            tile_lookup,
            next_tile_id: data.next_tile_id,
            off_mesh_connections: data.off_mesh_connections.into_iter().collect(),
            attachments: data.attachments.into_iter().collect(),
            next_connection_id: data.next_connection_id,
        }
    }
}

impl From<NavMesh> for NavMeshData {
    fn from(nav_mesh: NavMesh) -> Self {
        let mut tiles: Vec<_> = nav_mesh.tiles.into_values().collect();
        tiles.sort_by_key(|tile| tile.id);
        let mut off_mesh_connections: Vec<_> =
            nav_mesh.off_mesh_connections.into_iter().collect();
        off_mesh_connections.sort_by_key(|(id, _)| *id);
        let mut attachments: Vec<_> = nav_mesh.attachments.into_iter().collect();
        attachments.sort_by_key(|(id, _)| *id);

        NavMeshData {
            tiles,
            off_mesh_connections,
            attachments,
            next_tile_id: nav_mesh.next_tile_id,
            next_connection_id: nav_mesh.next_connection_id,
        }
    }
}

impl Default for NavMesh {
    fn default() -> Self {
        Self::new()
    }
}

impl NavMesh {
    pub fn new() -> Self {
        Self {
            tiles: HashMap::new(),
            tile_lookup: HashMap::new(),
            next_tile_id: 1,
            off_mesh_connections: HashMap::new(),
            attachments: HashMap::new(),
            next_connection_id: 1,
        }
    }

    pub fn tiles(&self) -> impl Iterator<Item = (&TileKey, &NavMeshTile)> {
        self.tiles.iter()
    }

    pub fn get_tile(&self, key: &TileKey) -> Option<&NavMeshTile> {
        self.tiles.get(key)
    }

    pub fn get_tile_by_id(&self, id: u64) -> Option<&NavMeshTile> {
        self.tile_lookup.get(&id).and_then(|key| self.tiles.get(key))
    }

    pub fn off_mesh_connection(&self, id: u64) -> Option<&OffMeshConnection> {
        self.off_mesh_connections.get(&id)
    }

    pub fn off_mesh_attachment(&self, id: u64) -> Option<&OffMeshAttachment> {
        self.attachments.get(&id)
    }

    /// Whether ``node_ref`` still refers to a live polygon or connection.
    /// Removing (or re-adding) a tile retires every ref into it.
    pub fn is_valid_node_ref(&self, node_ref: NodeRef) -> bool {
        match node_ref {
            NodeRef::Polygon { tile, polygon } => self
                .get_tile_by_id(tile)
                .is_some_and(|found| found.id == tile && (polygon as usize) < found.polygons.len()),
            NodeRef::OffMesh { connection, reverse } => {
                let Some(found) = self.off_mesh_connections.get(&connection) else {
                    return false;
                };
                if reverse && found.direction == OffMeshDirection::StartToEnd {
                    return false;
                }
                self.attachments.contains_key(&connection)
            }
        }
    }

    /// Inserts ``tile`` at ``key``, replacing any previous tile there, and
    /// links it to its neighbours. Returns the tile's assigned id.
    ///
    /// Linking is symmetric & deterministic: adding A then B produces the same
    /// link set as adding B then A.
    pub fn add_tile(&mut self, key: TileKey, mut tile: NavMeshTile) -> u64 {
        if self.tiles.contains_key(&key) {
            self.remove_tile(key);
        }

        let id = self.next_tile_id;
        self.next_tile_id += 1;

        tile.id = id;
        tile.key = key;

        // Start from a clean link state: internal links only.
        for polygon in tile.polygons.iter_mut() {
            polygon.links.clear();
            for (edge, connection) in polygon.neighbours.iter().enumerate() {
                if let EdgeConnection::Internal(neighbour_polygon) = connection {
                    polygon.links.push(Link::Internal {
                        edge: edge as u8,
                        neighbour_polygon: *neighbour_polygon,
                    });
                }
            }
        }

        self.tile_lookup.insert(id, key);
        self.tiles.insert(key, tile);

        for direction in [
            EdgeConnectionDirection::XNegative,
            EdgeConnectionDirection::ZPositive,
            EdgeConnectionDirection::XPositive,
            EdgeConnectionDirection::ZNegative,
        ] {
            let Some(neighbour_key) = key.offset(direction) else {
                continue;
            };
            if self.tiles.contains_key(&neighbour_key) {
                self.connect_external_links(key, neighbour_key, direction);
            }
        }

        // The new tile may host endpoints of detached connections.
        let detached: Vec<u64> = self
            .off_mesh_connections
            .keys()
            .filter(|id| !self.attachments.contains_key(id))
            .copied()
            .collect();
        for connection in detached {
            let _ = self.try_attach_off_mesh_connection(connection);
        }

        id
    }

    /// Removes the tile at ``key``, tearing down all links into it. Refs into
    /// the removed tile fail [NavMesh::is_valid_node_ref] from now on.
    pub fn remove_tile(&mut self, key: TileKey) -> Option<NavMeshTile> {
        let tile = self.tiles.remove(&key)?;
        self.tile_lookup.remove(&tile.id);

        // Neighbour tiles hold external links facing the removed tile.
        for direction in [
            EdgeConnectionDirection::XNegative,
            EdgeConnectionDirection::ZPositive,
            EdgeConnectionDirection::XPositive,
            EdgeConnectionDirection::ZNegative,
        ] {
            let Some(neighbour_key) = key.offset(direction) else {
                continue;
            };
            let Some(neighbour) = self.tiles.get_mut(&neighbour_key) else {
                continue;
            };

            let facing = direction.flip();
            for polygon in neighbour.polygons.iter_mut() {
                polygon.links.retain(|link| {
                    !matches!(link, Link::External { direction, .. } if *direction == facing)
                });
            }
        }

        // Detach off-mesh connections hooked into the removed tile.
        let detached: Vec<u64> = self
            .attachments
            .iter()
            .filter(|(_, attachment)| {
                attachment.start_tile == tile.id || attachment.end_tile == tile.id
            })
            .map(|(id, _)| *id)
            .collect();
        for connection in detached {
            self.detach_off_mesh_connection(connection);
        }

        Some(tile)
    }

    /// Registers an off-mesh connection & attaches its endpoints to the
    /// nearest walkable polygons within [OffMeshConnection::radius]. Both
    /// endpoints must resolve; the connection id is returned on success.
    pub fn add_off_mesh_connection(
        &mut self,
        connection: OffMeshConnection,
    ) -> Result<u64, OffMeshConnectionError> {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        self.off_mesh_connections.insert(id, connection);

        match self.try_attach_off_mesh_connection(id) {
            Ok(()) => Ok(id),
            Err(error) => {
                self.off_mesh_connections.remove(&id);
                Err(error)
            }
        }
    }

    pub fn remove_off_mesh_connection(&mut self, id: u64) -> Option<OffMeshConnection> {
        self.detach_off_mesh_connection(id);
        self.off_mesh_connections.remove(&id)
    }

    fn try_attach_off_mesh_connection(&mut self, id: u64) -> Result<(), OffMeshConnectionError> {
        let connection = self.off_mesh_connections[&id].clone();
        let half_extents = Vec3::splat(connection.radius);

        let filter = query::DefaultQueryFilter;
        let start = query::find_nearest_polygon(self, connection.start, half_extents, &filter)
            .ok_or(OffMeshConnectionError::NoPolygonAtStart)?;
        let end = query::find_nearest_polygon(self, connection.end, half_extents, &filter)
            .ok_or(OffMeshConnectionError::NoPolygonAtEnd)?;

        let (NodeRef::Polygon { tile: start_tile, polygon: start_polygon }, start_position) = start
        else {
            return Err(OffMeshConnectionError::NoPolygonAtStart);
        };
        let (NodeRef::Polygon { tile: end_tile, polygon: end_polygon }, end_position) = end else {
            return Err(OffMeshConnectionError::NoPolygonAtEnd);
        };

        self.attachments.insert(
            id,
            OffMeshAttachment {
                start_tile,
                start_polygon,
                start_position,
                end_tile,
                end_polygon,
                end_position,
            },
        );

        let start_key = self.tile_lookup[&start_tile];
        self.tiles.get_mut(&start_key).expect("attached tile").polygons
            [start_polygon as usize]
            .links
            .push(Link::OffMesh {
                connection: id,
                reverse: false,
            });

        if connection.direction == OffMeshDirection::Bidirectional {
            let end_key = self.tile_lookup[&end_tile];
            self.tiles.get_mut(&end_key).expect("attached tile").polygons[end_polygon as usize]
                .links
                .push(Link::OffMesh {
                    connection: id,
                    reverse: true,
                });
        }

        Ok(())
    }

    fn detach_off_mesh_connection(&mut self, id: u64) {
        let Some(attachment) = self.attachments.remove(&id) else {
            return;
        };

        for tile_id in [attachment.start_tile, attachment.end_tile] {
            let Some(key) = self.tile_lookup.get(&tile_id) else {
                continue;
            };
            let Some(tile) = self.tiles.get_mut(key) else {
                continue;
            };
            for polygon in tile.polygons.iter_mut() {
                polygon
                    .links
                    .retain(|link| !matches!(link, Link::OffMesh { connection, .. } if *connection == id));
            }
        }
    }

    /// Creates [Link::External]s between matching portal edges of two adjacent
    /// tiles, both ways.
    fn connect_external_links(
        &mut self,
        key: TileKey,
        neighbour_key: TileKey,
        direction: EdgeConnectionDirection,
    ) {
        let tile = &self.tiles[&key];
        let neighbour = &self.tiles[&neighbour_key];
        let walkable_climb = tile.walkable_climb.max(neighbour.walkable_climb);

        let mut tile_links: Vec<(usize, Link)> = Vec::new();
        let mut neighbour_links: Vec<(usize, Link)> = Vec::new();

        for (polygon_index, polygon) in tile.polygons.iter().enumerate() {
            for (edge, connection) in polygon.neighbours.iter().enumerate() {
                if *connection != EdgeConnection::External(direction) {
                    continue;
                }

                let edge_start = tile.vertices[polygon.indices[edge] as usize];
                let edge_end =
                    tile.vertices[polygon.indices[(edge + 1) % polygon.indices.len()] as usize];

                for (neighbour_polygon_index, neighbour_polygon) in
                    neighbour.polygons.iter().enumerate()
                {
                    for (neighbour_edge, neighbour_connection) in
                        neighbour_polygon.neighbours.iter().enumerate()
                    {
                        if *neighbour_connection != EdgeConnection::External(direction.flip()) {
                            continue;
                        }

                        let neighbour_edge_start = neighbour.vertices
                            [neighbour_polygon.indices[neighbour_edge] as usize];
                        let neighbour_edge_end = neighbour.vertices[neighbour_polygon.indices
                            [(neighbour_edge + 1) % neighbour_polygon.indices.len()]
                            as usize];

                        let Some((bounds, neighbour_bounds)) = portal_overlap(
                            edge_start,
                            edge_end,
                            neighbour_edge_start,
                            neighbour_edge_end,
                            direction,
                            walkable_climb,
                        ) else {
                            continue;
                        };

                        tile_links.push((
                            polygon_index,
                            Link::External {
                                edge: edge as u8,
                                neighbour_polygon: neighbour_polygon_index as u16,
                                direction,
                                bound_min: bounds.0,
                                bound_max: bounds.1,
                            },
                        ));
                        neighbour_links.push((
                            neighbour_polygon_index,
                            Link::External {
                                edge: neighbour_edge as u8,
                                neighbour_polygon: polygon_index as u16,
                                direction: direction.flip(),
                                bound_min: neighbour_bounds.0,
                                bound_max: neighbour_bounds.1,
                            },
                        ));
                    }
                }
            }
        }

        let tile = self.tiles.get_mut(&key).expect("tile was just read");
        for (polygon_index, link) in tile_links {
            tile.polygons[polygon_index].links.push(link);
        }
        let neighbour = self
            .tiles
            .get_mut(&neighbour_key)
            .expect("neighbour was just read");
        for (polygon_index, link) in neighbour_links {
            neighbour.polygons[polygon_index].links.push(link);
        }
    }
}

/// Computes the overlap interval of two portal edges on adjacent tiles.
/// Returns the quantised interval as fractions along each edge, or ``None``
/// when the edges don't overlap horizontally or are vertically out of reach.
fn portal_overlap(
    edge_start: Vec3,
    edge_end: Vec3,
    other_start: Vec3,
    other_end: Vec3,
    direction: EdgeConnectionDirection,
    walkable_climb: f32,
) -> Option<((u8, u8), (u8, u8))> {
    // Portal edges run along Z for X-facing portals & along X for Z-facing.
    let axis_of = |position: Vec3| match direction {
        EdgeConnectionDirection::XNegative | EdgeConnectionDirection::XPositive => position.z,
        EdgeConnectionDirection::ZNegative | EdgeConnectionDirection::ZPositive => position.x,
    };

    let edge_min = axis_of(edge_start).min(axis_of(edge_end));
    let edge_max = axis_of(edge_start).max(axis_of(edge_end));
    let other_min = axis_of(other_start).min(axis_of(other_end));
    let other_max = axis_of(other_start).max(axis_of(other_end));

    let low = edge_min.max(other_min);
    let high = edge_max.min(other_max);
    if high <= low {
        return None;
    }

    let parameter_on = |start: Vec3, end: Vec3, coordinate: f32| -> f32 {
        let extent = axis_of(end) - axis_of(start);
        if extent.abs() <= f32::EPSILON {
            return 0.0;
        }
        ((coordinate - axis_of(start)) / extent).clamp(0.0, 1.0)
    };
    let height_at = |start: Vec3, end: Vec3, coordinate: f32| -> f32 {
        start.y + (end.y - start.y) * parameter_on(start, end, coordinate)
    };

    // Reject slabs on different floors.
    for coordinate in [low, high] {
        let height_delta = (height_at(edge_start, edge_end, coordinate)
            - height_at(other_start, other_end, coordinate))
        .abs();
        if height_delta > walkable_climb {
            return None;
        }
    }

    let quantize = |t: f32| -> u8 { (t.clamp(0.0, 1.0) * 255.0).round() as u8 };

    let edge_low = parameter_on(edge_start, edge_end, low);
    let edge_high = parameter_on(edge_start, edge_end, high);
    let other_low = parameter_on(other_start, other_end, low);
    let other_high = parameter_on(other_start, other_end, high);

    Some((
        (
            quantize(edge_low.min(edge_high)),
            quantize(edge_low.max(edge_high)),
        ),
        (
            quantize(other_low.min(other_high)),
            quantize(other_low.max(other_high)),
        ),
    ))
}

impl NavMeshTile {
    /// Builds a runtime tile from caller-authored polygons ("bring your own
    /// nav-mesh"). Internal adjacency is rebuilt from shared edges & portal
    /// directions from proximity to the tile bounds; there is no height
    /// detail, so height queries interpolate the polygons themselves.
    pub fn from_polygons(
        vertices: Vec<Vec3>,
        polygons: Vec<(Vec<u32>, Area, u16)>,
        tile_bounds: (Vec2, Vec2),
        nav_mesh_settings: &NavMeshSettings,
    ) -> NavMeshTile {
        let neighbours = polygons_to_nav_mesh_tile_polys(
            &polygons.iter().map(|(indices, _, _)| indices.clone()).collect::<Vec<_>>(),
            &vertices,
            tile_bounds,
            nav_mesh_settings.cell_width * 0.5,
        );

        let polygons: Vec<Polygon> = polygons
            .into_iter()
            .zip(neighbours)
            .map(|((indices, area, flags), neighbours)| Polygon {
                indices,
                neighbours,
                links: SmallVec::new(),
                area,
                flags,
            })
            .collect();

        Self::assemble(
            vertices,
            polygons,
            TileDetailMesh::default(),
            nav_mesh_settings,
        )
    }

    pub(crate) fn assemble(
        vertices: Vec<Vec3>,
        polygons: Vec<Polygon>,
        detail: TileDetailMesh,
        nav_mesh_settings: &NavMeshSettings,
    ) -> NavMeshTile {
        let mut min_bound = Vec3::INFINITY;
        let mut max_bound = Vec3::NEG_INFINITY;
        for vertex in &vertices {
            min_bound = min_bound.min(*vertex);
            max_bound = max_bound.max(*vertex);
        }
        if vertices.is_empty() {
            min_bound = Vec3::ZERO;
            max_bound = Vec3::ZERO;
        }

        let mut tile = NavMeshTile {
            id: 0,
            key: TileKey::default(),
            min_bound,
            max_bound,
            cell_width: nav_mesh_settings.cell_width,
            cell_height: nav_mesh_settings.cell_height,
            walkable_height: f32::from(nav_mesh_settings.walkable_height)
                * nav_mesh_settings.cell_height,
            walkable_radius: f32::from(nav_mesh_settings.walkable_radius)
                * nav_mesh_settings.cell_width,
            walkable_climb: f32::from(nav_mesh_settings.step_height)
                * nav_mesh_settings.cell_height,
            vertices,
            polygons,
            detail,
            bv_tree: Vec::new(),
        };
        tile.bv_tree = build_nav_mesh_bv_tree(&tile);

        // Internal links so a tile is traversable even before insertion.
        for polygon in tile.polygons.iter_mut() {
            for (edge, connection) in polygon.neighbours.iter().enumerate() {
                if let EdgeConnection::Internal(neighbour_polygon) = connection {
                    polygon.links.push(Link::Internal {
                        edge: edge as u8,
                        neighbour_polygon: *neighbour_polygon,
                    });
                }
            }
        }

        tile
    }

    /// World-space AABB of one polygon.
    pub fn polygon_bounds(&self, polygon: &Polygon) -> (Vec3, Vec3) {
        let mut min = Vec3::INFINITY;
        let mut max = Vec3::NEG_INFINITY;
        for index in &polygon.indices {
            let vertex = self.vertices[*index as usize];
            min = min.min(vertex);
            max = max.max(vertex);
        }
        (min, max)
    }

    /// Collects polygons whose AABB overlaps ``min``..``max`` using the
    /// tile's BV-tree.
    pub fn query_polygons(&self, min: Vec3, max: Vec3) -> Vec<u16> {
        let mut result = Vec::new();

        if self.bv_tree.is_empty() {
            for (polygon_index, polygon) in self.polygons.iter().enumerate() {
                let (polygon_min, polygon_max) = self.polygon_bounds(polygon);
                if aabb_overlap(min, max, polygon_min, polygon_max) {
                    result.push(polygon_index as u16);
                }
            }
            return result;
        }

        let quantized_min = self.quantize(min.max(self.min_bound));
        let quantized_max = self.quantize(max.min(self.max_bound));
        if min.cmpgt(self.max_bound).any() || max.cmplt(self.min_bound).any() {
            return result;
        }

        let mut i = 0;
        while i < self.bv_tree.len() {
            let node = &self.bv_tree[i];
            let overlap = quantized_min.cmple(node.max).all()
                && quantized_max.cmpge(node.min).all();
            let is_leaf = node.i >= 0;

            if is_leaf && overlap {
                result.push(node.i as u16);
            }

            if overlap || is_leaf {
                i += 1;
            } else {
                i += (-node.i) as usize;
            }
        }

        result
    }

    fn quantize(&self, position: Vec3) -> U16Vec3 {
        let relative = (position - self.min_bound).max(Vec3::ZERO);
        U16Vec3::new(
            (relative.x / self.cell_width) as u16,
            (relative.y / self.cell_height) as u16,
            (relative.z / self.cell_width) as u16,
        )
    }

    /// Height of the polygon surface at ``position``, from the detail mesh
    /// when present, the polygon's own triangle fan otherwise. ``None`` when
    /// ``position`` lies outside the polygon's XZ outline.
    pub fn get_poly_height(&self, polygon_index: u16, position: Vec3) -> Option<f32> {
        let polygon = &self.polygons[polygon_index as usize];

        if let Some(slice) = self.detail.meshes.get(polygon_index as usize) {
            let vertex_count = polygon.indices.len() as u32;
            for triangle in self.detail.triangles[slice.triangle_base as usize
                ..(slice.triangle_base + slice.triangle_count) as usize]
                .iter()
            {
                let resolve = |index: u32| -> Vec3 {
                    if index < vertex_count {
                        self.vertices[polygon.indices[index as usize] as usize]
                    } else {
                        self.detail.vertices
                            [(slice.vertex_base + index - vertex_count) as usize]
                    }
                };

                let a = resolve(triangle.vertices[0]);
                let b = resolve(triangle.vertices[1]);
                let c = resolve(triangle.vertices[2]);

                if let Some(height) = triangle_height_at(position, a, b, c) {
                    return Some(height);
                }
            }
        }

        // Fan fallback over the polygon itself.
        let base = self.vertices[polygon.indices[0] as usize];
        for i in 1..polygon.indices.len() - 1 {
            let b = self.vertices[polygon.indices[i] as usize];
            let c = self.vertices[polygon.indices[i + 1] as usize];
            if let Some(height) = triangle_height_at(position, base, b, c) {
                return Some(height);
            }
        }

        None
    }

    /// The closest point to ``position`` on (or in) a polygon. Interior points
    /// keep their XZ & take the surface height; exterior points clamp to the
    /// closest boundary edge.
    pub fn get_closest_point_in_polygon(&self, polygon_index: u16, position: Vec3) -> Vec3 {
        if let Some(height) = self.get_poly_height(polygon_index, position) {
            return Vec3::new(position.x, height, position.z);
        }

        let polygon = &self.polygons[polygon_index as usize];
        let mut closest = self.vertices[polygon.indices[0] as usize];
        let mut closest_distance = f32::MAX;

        for i in 0..polygon.indices.len() {
            let a = self.vertices[polygon.indices[i] as usize];
            let b = self.vertices[polygon.indices[(i + 1) % polygon.indices.len()] as usize];

            let point = closest_point_on_segment(position, a, b);
            let distance = position.distance_squared(point);
            if distance < closest_distance {
                closest_distance = distance;
                closest = point;
            }
        }

        closest
    }

    /// The two endpoints of a link's portal on this tile, for the funnel.
    pub(crate) fn link_portal(&self, polygon: &Polygon, link: &Link) -> Option<(Vec3, Vec3)> {
        match link {
            Link::Internal { edge, .. } => {
                let a = self.vertices[polygon.indices[*edge as usize] as usize];
                let b = self.vertices
                    [polygon.indices[(*edge as usize + 1) % polygon.indices.len()] as usize];
                Some((a, b))
            }
            Link::External {
                edge,
                bound_min,
                bound_max,
                ..
            } => {
                let a = self.vertices[polygon.indices[*edge as usize] as usize];
                let b = self.vertices
                    [polygon.indices[(*edge as usize + 1) % polygon.indices.len()] as usize];

                const S: f32 = 1.0 / 255.0;
                let clamped_a = a.lerp(b, f32::from(*bound_min) * S);
                let clamped_b = a.lerp(b, f32::from(*bound_max) * S);
                Some((clamped_a, clamped_b))
            }
            Link::OffMesh { .. } => None,
        }
    }
}

fn aabb_overlap(min_a: Vec3, max_a: Vec3, min_b: Vec3, max_b: Vec3) -> bool {
    min_a.cmple(max_b).all() && min_b.cmple(max_a).all()
}

/// Vertical distance lookup: the height of triangle ``(a, b, c)`` at the XZ
/// position of ``point``, if inside the triangle.
fn triangle_height_at(point: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    let v0 = c - a;
    let v1 = b - a;
    let v2 = point - a;

    let dot00 = v0.x * v0.x + v0.z * v0.z;
    let dot01 = v0.x * v1.x + v0.z * v1.z;
    let dot02 = v0.x * v2.x + v0.z * v2.z;
    let dot11 = v1.x * v1.x + v1.z * v1.z;
    let dot12 = v1.x * v2.x + v1.z * v2.z;

    let denom = dot00 * dot11 - dot01 * dot01;
    if denom.abs() <= f32::EPSILON {
        return None;
    }

    let inv_denom = 1.0 / denom;
    let u = (dot11 * dot02 - dot01 * dot12) * inv_denom;
    let v = (dot00 * dot12 - dot01 * dot02) * inv_denom;

    const EPS: f32 = 1e-4;
    if u >= -EPS && v >= -EPS && (u + v) <= 1.0 + EPS {
        Some(a.y + u * v0.y + v * v1.y)
    } else {
        None
    }
}

pub(crate) fn closest_point_on_segment(point: Vec3, a: Vec3, b: Vec3) -> Vec3 {
    let ab = b - a;
    let length_squared = ab.length_squared();
    if length_squared <= f32::EPSILON {
        return a;
    }
    let t = ((point - a).dot(ab) / length_squared).clamp(0.0, 1.0);
    a + ab * t
}

/// Converts the build-time poly mesh & detail mesh into a runtime tile in
/// world space.
pub fn create_nav_mesh_tile_from_poly_mesh(
    poly_mesh: PolyMesh,
    detail_mesh: PolyMeshDetail,
    tile_coord: UVec2,
    nav_mesh_settings: &NavMeshSettings,
) -> NavMeshTile {
    let tile_origin = nav_mesh_settings.get_tile_origin(tile_coord);
    let to_world = |vertex: Vec3| -> Vec3 {
        Vec3::new(
            tile_origin.x + vertex.x * nav_mesh_settings.cell_width,
            nav_mesh_settings.world_bottom_bound + vertex.y * nav_mesh_settings.cell_height,
            tile_origin.y + vertex.z * nav_mesh_settings.cell_width,
        )
    };

    let vertices: Vec<Vec3> = poly_mesh
        .vertices
        .iter()
        .map(|vertex| to_world(vertex.as_vec3()))
        .collect();

    let polygons: Vec<Polygon> = poly_mesh
        .polygons
        .iter()
        .zip(poly_mesh.edges.iter())
        .zip(poly_mesh.areas.iter().zip(poly_mesh.flags.iter()))
        .map(|((polygon, edges), (area, flags))| {
            let vertex_count = polygon_vertex_count(polygon);

            Polygon {
                indices: polygon[..vertex_count].to_vec(),
                neighbours: edges[..vertex_count].to_vec(),
                links: SmallVec::new(),
                area: *area,
                flags: *flags,
            }
        })
        .collect();

    // Remap the detail mesh onto the runtime vertex scheme: the first nverts
    // detail vertices of a polygon alias the polygon's own vertices & are
    // dropped from storage. The per-polygon vertex bound is derived from the
    // polygon data itself.
    let mut detail = TileDetailMesh {
        meshes: Vec::with_capacity(detail_mesh.meshes.len()),
        vertices: Vec::new(),
        triangles: Vec::with_capacity(detail_mesh.triangles.len()),
    };
    for (slice, polygon) in detail_mesh.meshes.iter().zip(polygons.iter()) {
        let polygon_vertices = polygon.indices.len() as u32;
        let extra = slice.vertex_count.saturating_sub(polygon_vertices);

        let vertex_base = detail.vertices.len() as u32;
        detail.vertices.extend(
            detail_mesh.vertices[(slice.vertex_base + polygon_vertices) as usize
                ..(slice.vertex_base + slice.vertex_count) as usize]
                .iter()
                .map(|vertex| to_world(vertex.as_vec3())),
        );

        let triangle_base = detail.triangles.len() as u32;
        detail.triangles.extend(
            detail_mesh.triangles[slice.triangle_base as usize
                ..(slice.triangle_base + slice.triangle_count) as usize]
                .iter()
                .copied(),
        );

        detail.meshes.push(DetailMeshSlice {
            vertex_base,
            vertex_count: extra,
            triangle_base,
            triangle_count: slice.triangle_count,
        });
    }

    let mut tile = NavMeshTile::assemble(vertices, polygons, detail, nav_mesh_settings);
    tile.key = TileKey::new(tile_coord);
    tile
}

/// Rebuilds per-edge neighbour descriptors for externally-authored polygons:
/// two polygons sharing an edge become mutual [EdgeConnection::Internal]s &
/// edges running along the tile bounds become [EdgeConnection::External]s.
pub fn polygons_to_nav_mesh_tile_polys(
    polygons: &[Vec<u32>],
    vertices: &[Vec3],
    tile_bounds: (Vec2, Vec2),
    bounds_epsilon: f32,
) -> Vec<Vec<EdgeConnection>> {
    let mut neighbours: Vec<Vec<EdgeConnection>> = polygons
        .iter()
        .map(|polygon| vec![EdgeConnection::None; polygon.len()])
        .collect();

    // Shared edges: keyed on the sorted vertex pair.
    let mut edge_owners: HashMap<(u32, u32), (usize, usize)> = HashMap::new();
    for (polygon_index, polygon) in polygons.iter().enumerate() {
        for edge in 0..polygon.len() {
            let a = polygon[edge];
            let b = polygon[(edge + 1) % polygon.len()];
            let pair = (a.min(b), a.max(b));

            if let Some((other_polygon, other_edge)) = edge_owners.get(&pair) {
                neighbours[polygon_index][edge] = EdgeConnection::Internal(*other_polygon as u16);
                neighbours[*other_polygon][*other_edge] =
                    EdgeConnection::Internal(polygon_index as u16);
            } else {
                edge_owners.insert(pair, (polygon_index, edge));
            }
        }
    }

    // Border edges become portals.
    let (min_bound, max_bound) = tile_bounds;
    for (polygon_index, polygon) in polygons.iter().enumerate() {
        for edge in 0..polygon.len() {
            if neighbours[polygon_index][edge] != EdgeConnection::None {
                continue;
            }

            let a = vertices[polygon[edge] as usize];
            let b = vertices[polygon[(edge + 1) % polygon.len()] as usize];

            if (a.x - min_bound.x).abs() <= bounds_epsilon
                && (b.x - min_bound.x).abs() <= bounds_epsilon
            {
                neighbours[polygon_index][edge] =
                    EdgeConnection::External(EdgeConnectionDirection::XNegative);
            } else if (a.z - max_bound.y).abs() <= bounds_epsilon
                && (b.z - max_bound.y).abs() <= bounds_epsilon
            {
                neighbours[polygon_index][edge] =
                    EdgeConnection::External(EdgeConnectionDirection::ZPositive);
            } else if (a.x - max_bound.x).abs() <= bounds_epsilon
                && (b.x - max_bound.x).abs() <= bounds_epsilon
            {
                neighbours[polygon_index][edge] =
                    EdgeConnection::External(EdgeConnectionDirection::XPositive);
            } else if (a.z - min_bound.y).abs() <= bounds_epsilon
                && (b.z - min_bound.y).abs() <= bounds_epsilon
            {
                neighbours[polygon_index][edge] =
                    EdgeConnection::External(EdgeConnectionDirection::ZNegative);
            }
        }
    }

    neighbours
}

/// Builds the tile's AABB tree over polygon bounds in quantised tile-local
/// coordinates, split on the longest axis.
pub fn build_nav_mesh_bv_tree(tile: &NavMeshTile) -> Vec<BvNode> {
    struct BvItem {
        min: U16Vec3,
        max: U16Vec3,
        polygon: u16,
    }

    let mut items: Vec<BvItem> = tile
        .polygons
        .iter()
        .enumerate()
        .map(|(polygon_index, polygon)| {
            let (min, max) = tile.polygon_bounds(polygon);
            let relative_min = (min - tile.min_bound).max(Vec3::ZERO);
            let relative_max = (max - tile.min_bound).max(Vec3::ZERO);

            BvItem {
                min: U16Vec3::new(
                    (relative_min.x / tile.cell_width) as u16,
                    (relative_min.y / tile.cell_height) as u16,
                    (relative_min.z / tile.cell_width) as u16,
                ),
                max: U16Vec3::new(
                    (relative_max.x / tile.cell_width).ceil() as u16,
                    (relative_max.y / tile.cell_height).ceil() as u16,
                    (relative_max.z / tile.cell_width).ceil() as u16,
                ),
                polygon: polygon_index as u16,
            }
        })
        .collect();

    fn subdivide(items: &mut [BvItem], nodes: &mut Vec<BvNode>) {
        if items.is_empty() {
            return;
        }
        if items.len() == 1 {
            nodes.push(BvNode {
                min: items[0].min,
                max: items[0].max,
                i: i32::from(items[0].polygon),
            });
            return;
        }

        let mut min = items[0].min;
        let mut max = items[0].max;
        for item in items.iter().skip(1) {
            min = min.min(item.min);
            max = max.max(item.max);
        }

        let node_index = nodes.len();
        nodes.push(BvNode { min, max, i: 0 });

        let extent = max - min;
        let axis = if extent.x >= extent.z { 0 } else { 2 };
        if axis == 0 {
            items.sort_unstable_by_key(|item| item.min.x);
        } else {
            items.sort_unstable_by_key(|item| item.min.z);
        }

        let mid = items.len() / 2;
        let (left, right) = items.split_at_mut(mid);
        subdivide(left, nodes);
        subdivide(right, nodes);

        let subtree_size = nodes.len() - node_index;
        nodes[node_index].i = -(subtree_size as i32);
    }

    let mut nodes = Vec::with_capacity(items.len() * 2);
    subdivide(&mut items, &mut nodes);
    nodes
}

#[cfg(test)]
mod tests {
    use std::num::{NonZeroU16, NonZeroU8};

    use bevy::math::{UVec2, Vec2, Vec3};

    use crate::{Area, DetailMeshSettings, NavMeshSettings, PartitionStrategy};

    use super::*;

    fn test_settings() -> NavMeshSettings {
        NavMeshSettings {
            cell_width: 0.5,
            cell_height: 0.25,
            tile_width: NonZeroU16::new(20).unwrap(),
            border_size: 0,
            world_half_extents: 20.0,
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
            partition_strategy: PartitionStrategy::Watershed,
            detail: DetailMeshSettings {
                sample_distance: 0,
                max_sample_error: 1.0,
            },
        }
    }

    /// One square polygon filling the tile at ``coord``, at ``y``.
    fn square_tile(coord: UVec2, y: f32, settings: &NavMeshSettings) -> NavMeshTile {
        let (min, max) = settings.get_tile_bounds(coord);
        let vertices = vec![
            Vec3::new(min.x, y, min.y),
            Vec3::new(min.x, y, max.y),
            Vec3::new(max.x, y, max.y),
            Vec3::new(max.x, y, min.y),
        ];
        let polygons = vec![(vec![0, 1, 2, 3], Area::WALKABLE, 1)];

        NavMeshTile::from_polygons(vertices, polygons, (min, max), settings)
    }

    #[test]
    fn byo_polygons_get_portal_edges() {
        let settings = test_settings();
        let tile = square_tile(UVec2::new(4, 4), 0.0, &settings);

        let externals: Vec<_> = tile.polygons[0]
            .neighbours
            .iter()
            .filter_map(|connection| match connection {
                EdgeConnection::External(direction) => Some(*direction),
                _ => None,
            })
            .collect();

        assert_eq!(externals.len(), 4);
    }

    #[test]
    fn adding_adjacent_tiles_links_them_symmetrically() {
        let settings = test_settings();
        let mut nav_mesh = NavMesh::new();

        let left_key = TileKey::new(UVec2::new(4, 4));
        let right_key = TileKey::new(UVec2::new(5, 4));
        let left_id = nav_mesh.add_tile(left_key, square_tile(left_key.coord, 0.0, &settings));
        let right_id = nav_mesh.add_tile(right_key, square_tile(right_key.coord, 0.0, &settings));

        let left = nav_mesh.get_tile(&left_key).unwrap();
        let right = nav_mesh.get_tile(&right_key).unwrap();

        assert!(left.polygons[0].links.iter().any(|link| matches!(
            link,
            Link::External { direction: EdgeConnectionDirection::XPositive, neighbour_polygon: 0, .. }
        )));
        assert!(right.polygons[0].links.iter().any(|link| matches!(
            link,
            Link::External { direction: EdgeConnectionDirection::XNegative, neighbour_polygon: 0, .. }
        )));
        assert_ne!(left_id, right_id);
    }

    #[test]
    fn add_order_produces_identical_links() {
        let settings = test_settings();
        let a_key = TileKey::new(UVec2::new(4, 4));
        let b_key = TileKey::new(UVec2::new(5, 4));

        let mut forward = NavMesh::new();
        forward.add_tile(a_key, square_tile(a_key.coord, 0.0, &settings));
        forward.add_tile(b_key, square_tile(b_key.coord, 0.0, &settings));

        let mut backward = NavMesh::new();
        backward.add_tile(b_key, square_tile(b_key.coord, 0.0, &settings));
        backward.add_tile(a_key, square_tile(a_key.coord, 0.0, &settings));

        for key in [a_key, b_key] {
            let forward_links: Vec<_> = forward.get_tile(&key).unwrap().polygons[0]
                .links
                .iter()
                .copied()
                .collect();
            let backward_links: Vec<_> = backward.get_tile(&key).unwrap().polygons[0]
                .links
                .iter()
                .copied()
                .collect();
            assert_eq!(forward_links, backward_links);
        }
    }

    #[test]
    fn vertically_separated_tiles_do_not_link() {
        let settings = test_settings();
        let mut nav_mesh = NavMesh::new();

        let left_key = TileKey::new(UVec2::new(4, 4));
        let right_key = TileKey::new(UVec2::new(5, 4));
        nav_mesh.add_tile(left_key, square_tile(left_key.coord, 0.0, &settings));
        // 5m up, far above walkable_climb.
        nav_mesh.add_tile(right_key, square_tile(right_key.coord, 5.0, &settings));

        let left = nav_mesh.get_tile(&left_key).unwrap();
        assert!(left.polygons[0]
            .links
            .iter()
            .all(|link| !matches!(link, Link::External { .. })));
    }

    #[test]
    fn removing_a_tile_invalidates_refs_and_strips_links() {
        let settings = test_settings();
        let mut nav_mesh = NavMesh::new();

        let left_key = TileKey::new(UVec2::new(4, 4));
        let right_key = TileKey::new(UVec2::new(5, 4));
        nav_mesh.add_tile(left_key, square_tile(left_key.coord, 0.0, &settings));
        let right_id = nav_mesh.add_tile(right_key, square_tile(right_key.coord, 0.0, &settings));

        let node_ref = NodeRef::Polygon {
            tile: right_id,
            polygon: 0,
        };
        assert!(nav_mesh.is_valid_node_ref(node_ref));

        nav_mesh.remove_tile(right_key);
        assert!(!nav_mesh.is_valid_node_ref(node_ref));

        // The surviving neighbour lost its external links.
        let left = nav_mesh.get_tile(&left_key).unwrap();
        assert!(left.polygons[0]
            .links
            .iter()
            .all(|link| !matches!(link, Link::External { .. })));

        // Re-adding yields a fresh id; the old ref stays dead.
        let new_id = nav_mesh.add_tile(right_key, square_tile(right_key.coord, 0.0, &settings));
        assert_ne!(new_id, right_id);
        assert!(!nav_mesh.is_valid_node_ref(node_ref));
        assert!(nav_mesh.is_valid_node_ref(NodeRef::Polygon {
            tile: new_id,
            polygon: 0,
        }));
    }

    #[test]
    fn bv_tree_query_finds_the_containing_polygon() {
        let settings = test_settings();
        let tile = square_tile(UVec2::new(4, 4), 0.0, &settings);

        assert!(!tile.bv_tree.is_empty());

        let centre = (tile.min_bound + tile.max_bound) * 0.5;
        let hits = tile.query_polygons(centre - Vec3::splat(0.1), centre + Vec3::splat(0.1));
        assert_eq!(hits, vec![0]);

        let outside_min = tile.max_bound + Vec3::splat(10.0);
        let hits = tile.query_polygons(outside_min, outside_min + Vec3::splat(0.1));
        assert!(hits.is_empty());
    }

    #[test]
    fn off_mesh_connection_bridges_detached_tiles() {
        let settings = test_settings();
        let mut nav_mesh = NavMesh::new();

        // Two tiles with a gap between them.
        let left_key = TileKey::new(UVec2::new(2, 4));
        let right_key = TileKey::new(UVec2::new(6, 4));
        let left_id = nav_mesh.add_tile(left_key, square_tile(left_key.coord, 0.0, &settings));
        let right_id = nav_mesh.add_tile(right_key, square_tile(right_key.coord, 0.0, &settings));

        let left_centre = {
            let tile = nav_mesh.get_tile(&left_key).unwrap();
            (tile.min_bound + tile.max_bound) * 0.5
        };
        let right_centre = {
            let tile = nav_mesh.get_tile(&right_key).unwrap();
            (tile.min_bound + tile.max_bound) * 0.5
        };

        let connection = nav_mesh
            .add_off_mesh_connection(OffMeshConnection {
                start: left_centre,
                end: right_centre,
                radius: 0.5,
                direction: OffMeshDirection::StartToEnd,
                area: Area::WALKABLE,
                flags: 1,
                cost: Some(0.0),
            })
            .unwrap();

        let attachment = nav_mesh.off_mesh_attachment(connection).unwrap();
        assert_eq!(attachment.start_tile, left_id);
        assert_eq!(attachment.end_tile, right_id);

        // Start-to-end only: link on the start polygon, none on the end.
        let left = nav_mesh.get_tile(&left_key).unwrap();
        assert!(left.polygons[0]
            .links
            .iter()
            .any(|link| matches!(link, Link::OffMesh { connection: c, reverse: false } if *c == connection)));
        let right = nav_mesh.get_tile(&right_key).unwrap();
        assert!(right.polygons[0]
            .links
            .iter()
            .all(|link| !matches!(link, Link::OffMesh { .. })));

        assert!(nav_mesh.is_valid_node_ref(NodeRef::OffMesh {
            connection,
            reverse: false,
        }));
        assert!(!nav_mesh.is_valid_node_ref(NodeRef::OffMesh {
            connection,
            reverse: true,
        }));

        // Removing an endpoint tile detaches the connection.
        nav_mesh.remove_tile(right_key);
        assert!(nav_mesh.off_mesh_attachment(connection).is_none());
        assert!(!nav_mesh.is_valid_node_ref(NodeRef::OffMesh {
            connection,
            reverse: false,
        }));

        // Re-adding the tile re-attaches it.
        nav_mesh.add_tile(right_key, square_tile(right_key.coord, 0.0, &settings));
        assert!(nav_mesh.off_mesh_attachment(connection).is_some());
    }
}
