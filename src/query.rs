//! Module for querying the nav-mesh: nearest-polygon lookup, A* pathfinding,
//! straight-path funnelling, constrained surface movement, raycasts & random
//! point sampling.
//!
//! Queries never mutate the [NavMesh] and may run concurrently from any number
//! of readers while no writer is active.

use bevy::math::{Vec3, Vec3Swizzles};
use thiserror::Error;

use crate::{
    tiles::{closest_point_on_segment, Link, NavMesh, NavMeshTile, NodeRef, Polygon},
    Area,
};

const HEURISTIC_SCALE: f32 = 0.999;

/// Gate & cost protocol all traversal queries route through.
///
/// The default implementation passes every polygon and costs euclidean
/// distance; implement it to keep certain areas out of paths or to prefer
/// roads over rough terrain.
pub trait QueryFilter {
    fn pass_filter(&self, area: Area, flags: u16) -> bool {
        let _ = (area, flags);
        true
    }

    fn get_cost(&self, from: Vec3, to: Vec3) -> f32 {
        from.distance(to)
    }
}

/// Passes everything, costs distance.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultQueryFilter;

impl QueryFilter for DefaultQueryFilter {}

/// Errors returned by [find_node_path] & [find_path].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FindPathError {
    /// No polygon found near the start position, or the start ref is stale.
    #[error("no valid polygon at the start position")]
    NoValidStartNode,
    /// No polygon found near the end position, or the end ref is stale.
    #[error("no valid polygon at the end position")]
    NoValidEndNode,
}

/// Errors returned by [find_straight_path].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StringPullingError {
    #[error("the node path is empty")]
    PathEmpty,
    #[error("a node of the path no longer exists in the nav-mesh")]
    MissingNodeTile,
    #[error("no link between two consecutive path nodes")]
    NoLinkBetweenPathPoints,
    #[error("an off-mesh connection of the path is no longer attached")]
    MissingOffMeshAttachment,
}

/// Errors returned by [move_along_surface] & [raycast].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SurfaceError {
    #[error("the start ref is invalid or stale")]
    InvalidStart,
}

/// A polygon/off-mesh node path produced by [find_node_path].
#[derive(Debug, Clone, PartialEq)]
pub struct NodePath {
    pub path: Vec<NodeRef>,
    /// The end node was not reached: the path leads to the reachable node
    /// closest to the destination (node budget exhausted or disconnected).
    pub partial: bool,
}

/// A point of a straight path, tagged with the node it lies on so callers can
/// detect off-mesh hops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    pub position: Vec3,
    pub node_ref: NodeRef,
}

/// Result of [move_along_surface].
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceMove {
    pub position: Vec3,
    pub visited: Vec<NodeRef>,
}

/// Result of [raycast]. ``t`` is the parametric distance along the segment
/// reached before hitting a wall; ``1.0`` means full clearance.
#[derive(Debug, Clone, PartialEq)]
pub struct RaycastHit {
    pub t: f32,
    pub hit_edge: Option<usize>,
    pub hit_normal: Option<Vec3>,
    pub path: Vec<NodeRef>,
}

/// Finds the polygon closest to ``position`` within ``position ± half_extents``,
/// returning its ref & the closest point on it.
///
/// Stacked floors tie-break towards the vertically nearer one.
pub fn find_nearest_polygon(
    nav_mesh: &NavMesh,
    position: Vec3,
    half_extents: Vec3,
    filter: &impl QueryFilter,
) -> Option<(NodeRef, Vec3)> {
    let query_min = position - half_extents;
    let query_max = position + half_extents;

    let mut best = None;
    let mut best_score = f32::MAX;

    for (_, tile) in nav_mesh.tiles() {
        if query_min.cmpgt(tile.max_bound).any() || query_max.cmplt(tile.min_bound).any() {
            continue;
        }

        for polygon_index in tile.query_polygons(query_min, query_max) {
            let polygon = &tile.polygons[polygon_index as usize];
            if !filter.pass_filter(polygon.area, polygon.flags) {
                continue;
            }

            let closest = tile.get_closest_point_in_polygon(polygon_index, position);
            let delta = closest - position;
            // Weigh the vertical distance up so stacked floors resolve to the
            // nearer level.
            let score = delta.xz().length_squared() + (delta.y * 2.0).powi(2);

            if score < best_score {
                best_score = score;
                best = Some((
                    NodeRef::Polygon {
                        tile: tile.id,
                        polygon: polygon_index,
                    },
                    closest,
                ));
            }
        }
    }

    best
}

/// Collects the refs of all polygons overlapping the world-space box.
pub fn query_polygons(
    nav_mesh: &NavMesh,
    min: Vec3,
    max: Vec3,
    filter: &impl QueryFilter,
) -> Vec<NodeRef> {
    let mut result = Vec::new();

    for (_, tile) in nav_mesh.tiles() {
        if min.cmpgt(tile.max_bound).any() || max.cmplt(tile.min_bound).any() {
            continue;
        }

        for polygon_index in tile.query_polygons(min, max) {
            let polygon = &tile.polygons[polygon_index as usize];
            if filter.pass_filter(polygon.area, polygon.flags) {
                result.push(NodeRef::Polygon {
                    tile: tile.id,
                    polygon: polygon_index,
                });
            }
        }
    }

    result
}

/// The closest point on the referenced polygon. Idempotent for points already
/// projecting inside the polygon outline.
pub fn get_closest_point_on_poly(
    nav_mesh: &NavMesh,
    node_ref: NodeRef,
    position: Vec3,
) -> Option<Vec3> {
    let NodeRef::Polygon { tile, polygon } = node_ref else {
        return None;
    };
    let tile = nav_mesh.get_tile_by_id(tile)?;
    if polygon as usize >= tile.polygons.len() {
        return None;
    }

    Some(tile.get_closest_point_in_polygon(polygon, position))
}

/// Height of the nav-mesh surface at ``position`` on the referenced polygon,
/// from its detail mesh.
pub fn get_poly_height(nav_mesh: &NavMesh, node_ref: NodeRef, position: Vec3) -> Option<f32> {
    let NodeRef::Polygon { tile, polygon } = node_ref else {
        return None;
    };
    let tile = nav_mesh.get_tile_by_id(tile)?;
    if polygon as usize >= tile.polygons.len() {
        return None;
    }

    tile.get_poly_height(polygon, position)
}

#[derive(Default, Debug, PartialEq, Eq, Clone, Copy)]
enum NodeState {
    #[default]
    Unchecked,
    Open,
    Closed,
}

#[derive(Debug)]
struct PathNode {
    node_ref: NodeRef,
    position: Vec3,
    cost: f32,
    total_cost: f32,
    state: NodeState,
    parent: Option<usize>,
}

/// Performs A* over the node graph from ``start_ref`` to ``end_ref``.
///
/// ``node_budget`` caps expanded nodes; exhausting it returns the best partial
/// path found so far with [NodePath::partial] set, as does a disconnected
/// destination.
pub fn find_node_path(
    nav_mesh: &NavMesh,
    start_ref: NodeRef,
    end_ref: NodeRef,
    start_pos: Vec3,
    end_pos: Vec3,
    filter: &impl QueryFilter,
    node_budget: Option<u32>,
) -> Result<NodePath, FindPathError> {
    if !nav_mesh.is_valid_node_ref(start_ref) {
        return Err(FindPathError::NoValidStartNode);
    }
    if !nav_mesh.is_valid_node_ref(end_ref) {
        return Err(FindPathError::NoValidEndNode);
    }

    if start_ref == end_ref {
        return Ok(NodePath {
            path: vec![start_ref],
            partial: false,
        });
    }

    let mut nodes: Vec<PathNode> = Vec::with_capacity(30);
    let mut open_list: Vec<usize> = Vec::with_capacity(8);

    nodes.push(PathNode {
        node_ref: start_ref,
        position: start_pos,
        cost: 0.0,
        total_cost: start_pos.distance(end_pos) * HEURISTIC_SCALE,
        state: NodeState::Open,
        parent: None,
    });
    open_list.push(0);

    let mut last_best_node = 0;
    let mut last_best_node_cost = nodes[0].total_cost;
    let mut reached_end = false;

    let mut expanded = 0_u32;

    while let Some(best_node_index) = open_list.pop() {
        if node_budget.is_some_and(|budget| expanded >= budget) {
            break;
        }
        expanded += 1;

        let (best_ref, best_position, best_cost) = {
            let node = &mut nodes[best_node_index];
            node.state = NodeState::Closed;

            if node.node_ref == end_ref {
                last_best_node = best_node_index;
                reached_end = true;
                break;
            }

            (node.node_ref, node.position, node.cost)
        };

        let mut neighbours: Vec<(NodeRef, Vec3, Option<f32>)> = Vec::new();
        collect_neighbours(nav_mesh, best_ref, filter, &mut neighbours);

        for (neighbour_ref, neighbour_position, cost_override) in neighbours {
            // Don't go back to our parent.
            if nodes[best_node_index]
                .parent
                .is_some_and(|parent| nodes[parent].node_ref == neighbour_ref)
            {
                continue;
            }

            let neighbour_node_index = if let Some(index) = nodes
                .iter()
                .position(|element| element.node_ref == neighbour_ref)
            {
                index
            } else {
                nodes.push(PathNode {
                    node_ref: neighbour_ref,
                    position: neighbour_position,
                    cost: 0.0,
                    total_cost: 0.0,
                    state: NodeState::Unchecked,
                    parent: None,
                });

                nodes.len() - 1
            };

            let (old_state, total_cost) = {
                let neighbour_node = &mut nodes[neighbour_node_index];

                let traversal_cost = cost_override
                    .unwrap_or_else(|| filter.get_cost(best_position, neighbour_node.position));

                let (cost, heuristic) = if neighbour_ref == end_ref {
                    // Special case for the final node.
                    let end_cost = filter.get_cost(neighbour_node.position, end_pos);

                    (best_cost + traversal_cost + end_cost, 0.0)
                } else {
                    let heuristic =
                        neighbour_node.position.distance(end_pos) * HEURISTIC_SCALE;

                    (best_cost + traversal_cost, heuristic)
                };
                let total_cost = cost + heuristic;

                if neighbour_node.state != NodeState::Unchecked
                    && total_cost >= neighbour_node.total_cost
                {
                    continue;
                }

                let old_state = neighbour_node.state;
                neighbour_node.parent = Some(best_node_index);
                neighbour_node.state = NodeState::Open;
                neighbour_node.cost = cost;
                neighbour_node.total_cost = total_cost;

                if heuristic < last_best_node_cost {
                    last_best_node_cost = heuristic;
                    last_best_node = neighbour_node_index;
                }

                (old_state, total_cost)
            };

            if old_state == NodeState::Open {
                // Node already exists. Let's remove it.
                if let Some(existing_index) = open_list
                    .iter()
                    .position(|node| *node == neighbour_node_index)
                {
                    open_list.remove(existing_index);
                }
            }

            // We want to insert the node into the list so that the next entry has a lower total.
            if let Some(index) = open_list
                .iter()
                .position(|node_index| nodes[*node_index].total_cost < total_cost)
            {
                open_list.insert(index, neighbour_node_index);
            } else {
                // There is no entry with a lower total.
                open_list.push(neighbour_node_index);
            }
        }
    }

    let path_count = {
        let mut count = 0;
        let mut parent = Some(last_best_node);
        while let Some(parent_index) = parent {
            count += 1;
            parent = nodes[parent_index].parent;
        }

        count
    };

    let mut path = Vec::with_capacity(path_count);

    let mut parent = Some(last_best_node);
    while let Some(parent_index) = parent {
        let node = &nodes[parent_index];

        path.push(node.node_ref);

        parent = node.parent;
    }

    path.reverse();

    Ok(NodePath {
        path,
        partial: !reached_end,
    })
}

/// Gathers the traversable neighbours of a node: ``(ref, position, cost
/// override)``. Off-mesh hops carry their configured cost.
fn collect_neighbours(
    nav_mesh: &NavMesh,
    node_ref: NodeRef,
    filter: &impl QueryFilter,
    neighbours: &mut Vec<(NodeRef, Vec3, Option<f32>)>,
) {
    match node_ref {
        NodeRef::Polygon { tile, polygon } => {
            let Some(node_tile) = nav_mesh.get_tile_by_id(tile) else {
                return;
            };
            let node_polygon = &node_tile.polygons[polygon as usize];

            for link in node_polygon.links.iter() {
                match link {
                    Link::Internal {
                        neighbour_polygon, ..
                    } => {
                        let neighbour = &node_tile.polygons[*neighbour_polygon as usize];
                        if !filter.pass_filter(neighbour.area, neighbour.flags) {
                            continue;
                        }
                        let Some((a, b)) = node_tile.link_portal(node_polygon, link) else {
                            continue;
                        };

                        neighbours.push((
                            NodeRef::Polygon {
                                tile,
                                polygon: *neighbour_polygon,
                            },
                            a.lerp(b, 0.5),
                            None,
                        ));
                    }
                    Link::External {
                        neighbour_polygon,
                        direction,
                        ..
                    } => {
                        let Some(neighbour_key) = node_tile.key.offset(*direction) else {
                            continue;
                        };
                        let Some(neighbour_tile) = nav_mesh.get_tile(&neighbour_key) else {
                            continue;
                        };
                        let neighbour = &neighbour_tile.polygons[*neighbour_polygon as usize];
                        if !filter.pass_filter(neighbour.area, neighbour.flags) {
                            continue;
                        }
                        let Some((a, b)) = node_tile.link_portal(node_polygon, link) else {
                            continue;
                        };

                        neighbours.push((
                            NodeRef::Polygon {
                                tile: neighbour_tile.id,
                                polygon: *neighbour_polygon,
                            },
                            a.lerp(b, 0.5),
                            None,
                        ));
                    }
                    Link::OffMesh {
                        connection,
                        reverse,
                    } => {
                        let Some(off_mesh) = nav_mesh.off_mesh_connection(*connection) else {
                            continue;
                        };
                        if !filter.pass_filter(off_mesh.area, off_mesh.flags) {
                            continue;
                        }
                        let Some(attachment) = nav_mesh.off_mesh_attachment(*connection) else {
                            continue;
                        };

                        let entry = if *reverse {
                            attachment.end_position
                        } else {
                            attachment.start_position
                        };

                        neighbours.push((
                            NodeRef::OffMesh {
                                connection: *connection,
                                reverse: *reverse,
                            },
                            entry,
                            None,
                        ));
                    }
                }
            }
        }
        NodeRef::OffMesh {
            connection,
            reverse,
        } => {
            let Some(off_mesh) = nav_mesh.off_mesh_connection(connection) else {
                return;
            };
            let Some(attachment) = nav_mesh.off_mesh_attachment(connection) else {
                return;
            };

            let (landing_tile, landing_polygon, landing_position) = if reverse {
                (
                    attachment.start_tile,
                    attachment.start_polygon,
                    attachment.start_position,
                )
            } else {
                (
                    attachment.end_tile,
                    attachment.end_polygon,
                    attachment.end_position,
                )
            };

            let Some(tile) = nav_mesh.get_tile_by_id(landing_tile) else {
                return;
            };
            let polygon = &tile.polygons[landing_polygon as usize];
            if !filter.pass_filter(polygon.area, polygon.flags) {
                return;
            }

            let cost = off_mesh
                .cost
                .unwrap_or_else(|| off_mesh.start.distance(off_mesh.end));

            neighbours.push((
                NodeRef::Polygon {
                    tile: landing_tile,
                    polygon: landing_polygon,
                },
                landing_position,
                Some(cost),
            ));
        }
    }
}

/// Performs "string pulling" on a node path, returning a piecewise-linear
/// shortest path across the traversed portals. Off-mesh hops appear as
/// waypoints carrying their [NodeRef::OffMesh] so callers can trigger jumps,
/// teleports & the like.
pub fn find_straight_path(
    nav_mesh: &NavMesh,
    start_pos: Vec3,
    end_pos: Vec3,
    path: &[NodeRef],
) -> Result<Vec<Waypoint>, StringPullingError> {
    if path.is_empty() {
        return Err(StringPullingError::PathEmpty);
    }

    let clamp_to = |node_ref: NodeRef, position: Vec3| -> Result<Vec3, StringPullingError> {
        match node_ref {
            NodeRef::Polygon { tile, polygon } => {
                let tile = nav_mesh
                    .get_tile_by_id(tile)
                    .ok_or(StringPullingError::MissingNodeTile)?;
                Ok(tile.get_closest_point_in_polygon(polygon, position))
            }
            NodeRef::OffMesh { .. } => Ok(position),
        }
    };

    let mut waypoints = Vec::with_capacity(path.len() + 2);

    let mut segment_start_pos = clamp_to(path[0], start_pos)?;
    let mut segment_start = 0;

    for (i, node) in path.iter().enumerate() {
        let NodeRef::OffMesh {
            connection,
            reverse,
        } = node
        else {
            continue;
        };

        let attachment = nav_mesh
            .off_mesh_attachment(*connection)
            .ok_or(StringPullingError::MissingOffMeshAttachment)?;
        let (entry, exit) = if *reverse {
            (attachment.end_position, attachment.start_position)
        } else {
            (attachment.start_position, attachment.end_position)
        };

        pull_string_segment(
            nav_mesh,
            segment_start_pos,
            entry,
            &path[segment_start..i],
            *node,
            &mut waypoints,
        )?;

        segment_start_pos = exit;
        segment_start = i + 1;
    }

    let end_segment = &path[segment_start..];
    if end_segment.is_empty() {
        return Err(StringPullingError::NoLinkBetweenPathPoints);
    }
    let clamped_end = clamp_to(end_segment[end_segment.len() - 1], end_pos)?;
    pull_string_segment(
        nav_mesh,
        segment_start_pos,
        clamped_end,
        end_segment,
        end_segment[end_segment.len() - 1],
        &mut waypoints,
    )?;

    Ok(waypoints)
}

/// Simple Stupid Funnel over one off-mesh-free stretch of the path.
fn pull_string_segment(
    nav_mesh: &NavMesh,
    start_pos: Vec3,
    end_pos: Vec3,
    path: &[NodeRef],
    final_ref: NodeRef,
    waypoints: &mut Vec<Waypoint>,
) -> Result<(), StringPullingError> {
    if path.is_empty() {
        return Err(StringPullingError::PathEmpty);
    }

    let mut push = |waypoints: &mut Vec<Waypoint>, waypoint: Waypoint| {
        if waypoints
            .last()
            .is_none_or(|last: &Waypoint| last.position.distance_squared(waypoint.position) > 1e-6)
        {
            waypoints.push(waypoint);
        }
    };

    push(
        waypoints,
        Waypoint {
            position: start_pos,
            node_ref: path[0],
        },
    );

    if path.len() > 1 {
        let mut portal_apex = start_pos;
        let mut portal_left = start_pos;
        let mut portal_right = start_pos;

        let mut left_index = 0;
        let mut right_index = 0;

        let mut i = 0;
        while i < path.len() {
            let (left, right) = if let Some(next) = path.get(i + 1) {
                portal_between(nav_mesh, path[i], *next)?
            } else {
                (end_pos, end_pos)
            };

            // Right vertex.
            if triangle_area_2d(portal_apex, portal_right, right) <= 0.0 {
                if portal_apex.distance_squared(portal_right) < (1.0 / 16384.0)
                    || triangle_area_2d(portal_apex, portal_left, right) > 0.0
                {
                    portal_right = right;
                    right_index = i;
                } else {
                    portal_apex = portal_left;

                    push(
                        waypoints,
                        Waypoint {
                            position: portal_apex,
                            node_ref: path[left_index],
                        },
                    );

                    portal_left = portal_apex;
                    portal_right = portal_apex;
                    right_index = left_index;

                    i = left_index + 1;
                    continue;
                }
            }

            // Left vertex.
            if triangle_area_2d(portal_apex, portal_left, left) >= 0.0 {
                if portal_apex.distance_squared(portal_left) < (1.0 / 16384.0)
                    || triangle_area_2d(portal_apex, portal_right, left) < 0.0
                {
                    portal_left = left;
                    left_index = i;
                } else {
                    portal_apex = portal_right;

                    push(
                        waypoints,
                        Waypoint {
                            position: portal_apex,
                            node_ref: path[right_index],
                        },
                    );

                    portal_left = portal_apex;
                    portal_right = portal_apex;
                    left_index = right_index;

                    i = right_index + 1;
                    continue;
                }
            }

            i += 1;
        }
    }

    push(
        waypoints,
        Waypoint {
            position: end_pos,
            node_ref: final_ref,
        },
    );

    Ok(())
}

/// The portal (left, right) between two consecutive polygon nodes.
fn portal_between(
    nav_mesh: &NavMesh,
    current: NodeRef,
    next: NodeRef,
) -> Result<(Vec3, Vec3), StringPullingError> {
    let NodeRef::Polygon { tile, polygon } = current else {
        return Err(StringPullingError::NoLinkBetweenPathPoints);
    };
    let NodeRef::Polygon {
        tile: next_tile,
        polygon: next_polygon,
    } = next
    else {
        return Err(StringPullingError::NoLinkBetweenPathPoints);
    };

    let node_tile = nav_mesh
        .get_tile_by_id(tile)
        .ok_or(StringPullingError::MissingNodeTile)?;
    let node_polygon = &node_tile.polygons[polygon as usize];

    let link = node_polygon
        .links
        .iter()
        .find(|link| match link {
            Link::Internal {
                neighbour_polygon, ..
            } => tile == next_tile && *neighbour_polygon == next_polygon,
            Link::External {
                neighbour_polygon,
                direction,
                ..
            } => {
                *neighbour_polygon == next_polygon
                    && node_tile
                        .key
                        .offset(*direction)
                        .and_then(|key| nav_mesh.get_tile(&key))
                        .is_some_and(|neighbour| neighbour.id == next_tile)
            }
            Link::OffMesh { .. } => false,
        })
        .ok_or(StringPullingError::NoLinkBetweenPathPoints)?;

    node_tile
        .link_portal(node_polygon, link)
        .ok_or(StringPullingError::NoLinkBetweenPathPoints)
}

/// Convenience query: nearest polygons around both positions, A* node path,
/// straight path. Reports partial paths through the returned flag.
pub fn find_path(
    nav_mesh: &NavMesh,
    start_pos: Vec3,
    end_pos: Vec3,
    half_extents: Vec3,
    filter: &impl QueryFilter,
    node_budget: Option<u32>,
) -> Result<(Vec<Waypoint>, bool), FindPathError> {
    let (start_ref, start_point) = find_nearest_polygon(nav_mesh, start_pos, half_extents, filter)
        .ok_or(FindPathError::NoValidStartNode)?;
    let (end_ref, end_point) = find_nearest_polygon(nav_mesh, end_pos, half_extents, filter)
        .ok_or(FindPathError::NoValidEndNode)?;

    let node_path = find_node_path(
        nav_mesh,
        start_ref,
        end_ref,
        start_point,
        end_point,
        filter,
        node_budget,
    )?;

    // A partial path may stop on an off-mesh hop; string pulling needs a
    // polygon to land on.
    let mut path = node_path.path;
    while matches!(path.last(), Some(NodeRef::OffMesh { .. })) {
        path.pop();
    }

    let waypoints = find_straight_path(nav_mesh, start_point, end_point, &path)
        .map_err(|_| FindPathError::NoValidEndNode)?;

    Ok((waypoints, node_path.partial))
}

/// Constrained slide across the surface from ``start_pos`` towards ``end_pos``:
/// crossings into linked neighbours are followed, walls stop the move &
/// project the remainder onto the wall edge. Useful for character controllers
/// that want to snap to the nav-mesh.
pub fn move_along_surface(
    nav_mesh: &NavMesh,
    start_ref: NodeRef,
    start_pos: Vec3,
    end_pos: Vec3,
    filter: &impl QueryFilter,
) -> Result<SurfaceMove, SurfaceError> {
    let NodeRef::Polygon { tile, polygon } = start_ref else {
        return Err(SurfaceError::InvalidStart);
    };
    if !nav_mesh.is_valid_node_ref(start_ref) {
        return Err(SurfaceError::InvalidStart);
    }

    let mut current_tile = nav_mesh.get_tile_by_id(tile).ok_or(SurfaceError::InvalidStart)?;
    let mut current_polygon = polygon;
    let mut current_position = current_tile.get_closest_point_in_polygon(polygon, start_pos);
    let mut visited = vec![start_ref];

    const MAX_CROSSINGS: usize = 128;

    for _ in 0..MAX_CROSSINGS {
        let polygon = &current_tile.polygons[current_polygon as usize];
        let outline: Vec<Vec3> = polygon
            .indices
            .iter()
            .map(|index| current_tile.vertices[*index as usize])
            .collect();

        // Destination inside the current polygon: done.
        if point_inside_polygon_2d(end_pos, &outline) {
            let height = current_tile
                .get_poly_height(current_polygon, end_pos)
                .unwrap_or(end_pos.y);
            return Ok(SurfaceMove {
                position: Vec3::new(end_pos.x, height, end_pos.z),
                visited,
            });
        }

        let Some((exit_t, exit_edge)) =
            intersect_segment_polygon_exit(current_position, end_pos, &outline)
        else {
            // Segment never leaves the polygon outline; clamp & stop.
            let position =
                current_tile.get_closest_point_in_polygon(current_polygon, end_pos);
            return Ok(SurfaceMove { position, visited });
        };

        let crossing =
            current_position + (end_pos - current_position) * exit_t.clamp(0.0, 1.0);

        // A traversable link through the crossed edge continues the walk.
        let next = polygon.links.iter().find_map(|link| match link {
            Link::Internal {
                edge,
                neighbour_polygon,
            } if *edge as usize == exit_edge => {
                let neighbour = &current_tile.polygons[*neighbour_polygon as usize];
                filter
                    .pass_filter(neighbour.area, neighbour.flags)
                    .then_some((current_tile, *neighbour_polygon))
            }
            Link::External {
                edge,
                neighbour_polygon,
                direction,
                ..
            } if *edge as usize == exit_edge => {
                let neighbour_tile = current_tile
                    .key
                    .offset(*direction)
                    .and_then(|key| nav_mesh.get_tile(&key))?;
                let neighbour = &neighbour_tile.polygons[*neighbour_polygon as usize];
                filter
                    .pass_filter(neighbour.area, neighbour.flags)
                    .then_some((neighbour_tile, *neighbour_polygon))
            }
            _ => None,
        });

        match next {
            Some((next_tile, next_polygon)) => {
                current_tile = next_tile;
                current_polygon = next_polygon;
                current_position = crossing;
                visited.push(NodeRef::Polygon {
                    tile: next_tile.id,
                    polygon: next_polygon,
                });
            }
            None => {
                // Wall: project the remainder onto the wall edge.
                let a = outline[exit_edge];
                let b = outline[(exit_edge + 1) % outline.len()];
                let position = closest_point_on_segment(end_pos, a, b);
                return Ok(SurfaceMove { position, visited });
            }
        }
    }

    Ok(SurfaceMove {
        position: current_position,
        visited,
    })
}

/// Marches a segment through linked polygons. Stops at the first wall edge,
/// returning the parametric hit distance & wall normal; returns ``t = 1.0`` on
/// full clearance.
pub fn raycast(
    nav_mesh: &NavMesh,
    start_ref: NodeRef,
    start_pos: Vec3,
    end_pos: Vec3,
    filter: &impl QueryFilter,
) -> Result<RaycastHit, SurfaceError> {
    let NodeRef::Polygon { tile, polygon } = start_ref else {
        return Err(SurfaceError::InvalidStart);
    };
    if !nav_mesh.is_valid_node_ref(start_ref) {
        return Err(SurfaceError::InvalidStart);
    }

    let mut current_tile = nav_mesh.get_tile_by_id(tile).ok_or(SurfaceError::InvalidStart)?;
    let mut current_polygon = polygon;
    let mut path = vec![start_ref];

    const MAX_CROSSINGS: usize = 256;

    for _ in 0..MAX_CROSSINGS {
        let polygon = &current_tile.polygons[current_polygon as usize];
        let outline: Vec<Vec3> = polygon
            .indices
            .iter()
            .map(|index| current_tile.vertices[*index as usize])
            .collect();

        if point_inside_polygon_2d(end_pos, &outline) {
            return Ok(RaycastHit {
                t: 1.0,
                hit_edge: None,
                hit_normal: None,
                path,
            });
        }

        let Some((exit_t, exit_edge)) =
            intersect_segment_polygon_exit(start_pos, end_pos, &outline)
        else {
            return Ok(RaycastHit {
                t: 1.0,
                hit_edge: None,
                hit_normal: None,
                path,
            });
        };

        let next = polygon.links.iter().find_map(|link| match link {
            Link::Internal {
                edge,
                neighbour_polygon,
            } if *edge as usize == exit_edge => {
                let neighbour = &current_tile.polygons[*neighbour_polygon as usize];
                filter
                    .pass_filter(neighbour.area, neighbour.flags)
                    .then_some((current_tile, *neighbour_polygon))
            }
            Link::External {
                edge,
                neighbour_polygon,
                direction,
                ..
            } if *edge as usize == exit_edge => {
                let neighbour_tile = current_tile
                    .key
                    .offset(*direction)
                    .and_then(|key| nav_mesh.get_tile(&key))?;
                let neighbour = &neighbour_tile.polygons[*neighbour_polygon as usize];
                filter
                    .pass_filter(neighbour.area, neighbour.flags)
                    .then_some((neighbour_tile, *neighbour_polygon))
            }
            _ => None,
        });

        match next {
            Some((next_tile, next_polygon)) => {
                current_tile = next_tile;
                current_polygon = next_polygon;
                path.push(NodeRef::Polygon {
                    tile: next_tile.id,
                    polygon: next_polygon,
                });
            }
            None => {
                let a = outline[exit_edge];
                let b = outline[(exit_edge + 1) % outline.len()];
                let edge_direction = b - a;
                let mut normal = Vec3::new(edge_direction.z, 0.0, -edge_direction.x)
                    .normalize_or_zero();
                if normal.dot(end_pos - start_pos) > 0.0 {
                    normal = -normal;
                }

                return Ok(RaycastHit {
                    t: exit_t.clamp(0.0, 1.0),
                    hit_edge: Some(exit_edge),
                    hit_normal: Some(normal),
                    path,
                });
            }
        }
    }

    Ok(RaycastHit {
        t: 1.0,
        hit_edge: None,
        hit_normal: None,
        path,
    })
}

/// Picks a point on the nav-mesh, polygons weighted by surface area.
///
/// ``random`` must return values in ``[0, 1)``; pass a seeded generator for
/// determinism across runs.
pub fn find_random_point(
    nav_mesh: &NavMesh,
    filter: &impl QueryFilter,
    random: &mut impl FnMut() -> f32,
) -> Option<(NodeRef, Vec3)> {
    let mut candidates: Vec<(NodeRef, f32)> = Vec::new();
    let mut total_area = 0.0;

    for (_, tile) in nav_mesh.tiles() {
        for (polygon_index, polygon) in tile.polygons.iter().enumerate() {
            if !filter.pass_filter(polygon.area, polygon.flags) {
                continue;
            }

            let area = polygon_area_2d(tile, polygon);
            if area <= 0.0 {
                continue;
            }

            total_area += area;
            candidates.push((
                NodeRef::Polygon {
                    tile: tile.id,
                    polygon: polygon_index as u16,
                },
                area,
            ));
        }
    }

    if candidates.is_empty() {
        return None;
    }

    // Deterministic pick order regardless of tile map iteration.
    candidates.sort_by_key(|(node_ref, _)| match node_ref {
        NodeRef::Polygon { tile, polygon } => (*tile, *polygon),
        NodeRef::OffMesh { .. } => (u64::MAX, u16::MAX),
    });

    let mut remaining = random() * total_area;
    let mut chosen = candidates[candidates.len() - 1].0;
    for (node_ref, area) in &candidates {
        if remaining < *area {
            chosen = *node_ref;
            break;
        }
        remaining -= area;
    }

    let position = random_point_in_polygon(nav_mesh, chosen, random)?;
    Some((chosen, position))
}

/// Picks a point on the nav-mesh within ``radius`` of ``center``, restricted
/// to polygons reachable from ``center_ref``.
pub fn find_random_point_around_circle(
    nav_mesh: &NavMesh,
    center_ref: NodeRef,
    center: Vec3,
    radius: f32,
    filter: &impl QueryFilter,
    random: &mut impl FnMut() -> f32,
) -> Option<(NodeRef, Vec3)> {
    if !nav_mesh.is_valid_node_ref(center_ref) {
        return None;
    }

    // BFS outward collecting polygons that intersect the disc.
    let mut frontier = vec![center_ref];
    let mut seen = vec![center_ref];
    let mut candidates: Vec<(NodeRef, f32)> = Vec::new();
    let mut total_area = 0.0;

    while let Some(node_ref) = frontier.pop() {
        if let NodeRef::Polygon { tile, polygon } = node_ref {
            let Some(node_tile) = nav_mesh.get_tile_by_id(tile) else {
                continue;
            };
            let node_polygon = &node_tile.polygons[polygon as usize];

            let (min, max) = node_tile.polygon_bounds(node_polygon);
            let closest = center.xz().clamp(min.xz(), max.xz());
            if closest.distance_squared(center.xz()) > radius * radius {
                continue;
            }

            let area = polygon_area_2d(node_tile, node_polygon);
            if area > 0.0 {
                total_area += area;
                candidates.push((node_ref, area));
            }
        }

        let mut neighbours = Vec::new();
        collect_neighbours(nav_mesh, node_ref, filter, &mut neighbours);
        for (neighbour_ref, _, _) in neighbours {
            if !seen.contains(&neighbour_ref) {
                seen.push(neighbour_ref);
                frontier.push(neighbour_ref);
            }
        }
    }

    if candidates.is_empty() {
        return None;
    }

    candidates.sort_by_key(|(node_ref, _)| match node_ref {
        NodeRef::Polygon { tile, polygon } => (*tile, *polygon),
        NodeRef::OffMesh { .. } => (u64::MAX, u16::MAX),
    });

    let mut remaining = random() * total_area;
    let mut chosen = candidates[candidates.len() - 1].0;
    for (node_ref, area) in &candidates {
        if remaining < *area {
            chosen = *node_ref;
            break;
        }
        remaining -= area;
    }

    let mut position = random_point_in_polygon(nav_mesh, chosen, random)?;

    // Pull points outside the disc back onto its rim, staying on the polygon.
    let offset = position.xz() - center.xz();
    if offset.length_squared() > radius * radius {
        let clamped = center.xz() + offset.normalize_or_zero() * radius;
        position = get_closest_point_on_poly(
            nav_mesh,
            chosen,
            Vec3::new(clamped.x, position.y, clamped.y),
        )?;
    }

    Some((chosen, position))
}

fn random_point_in_polygon(
    nav_mesh: &NavMesh,
    node_ref: NodeRef,
    random: &mut impl FnMut() -> f32,
) -> Option<Vec3> {
    let NodeRef::Polygon { tile, polygon } = node_ref else {
        return None;
    };
    let tile = nav_mesh.get_tile_by_id(tile)?;
    let polygon_data = &tile.polygons[polygon as usize];

    // Weighted fan-triangle pick, then uniform barycentric.
    let base = tile.vertices[polygon_data.indices[0] as usize];
    let mut triangle_areas = Vec::with_capacity(polygon_data.indices.len() - 2);
    let mut total_area = 0.0;
    for i in 1..polygon_data.indices.len() - 1 {
        let b = tile.vertices[polygon_data.indices[i] as usize];
        let c = tile.vertices[polygon_data.indices[i + 1] as usize];
        let area = triangle_area_2d(base, b, c).abs() * 0.5;
        triangle_areas.push(area);
        total_area += area;
    }

    let mut remaining = random() * total_area;
    let mut triangle = polygon_data.indices.len() - 3;
    for (i, area) in triangle_areas.iter().enumerate() {
        if remaining < *area {
            triangle = i;
            break;
        }
        remaining -= area;
    }

    let b = tile.vertices[polygon_data.indices[triangle + 1] as usize];
    let c = tile.vertices[polygon_data.indices[triangle + 2] as usize];

    let r1 = random().sqrt();
    let r2 = random();
    let point = base * (1.0 - r1) + b * (r1 * (1.0 - r2)) + c * (r1 * r2);

    let height = tile.get_poly_height(polygon, point).unwrap_or(point.y);
    Some(Vec3::new(point.x, height, point.z))
}

fn polygon_area_2d(tile: &NavMeshTile, polygon: &Polygon) -> f32 {
    let base = tile.vertices[polygon.indices[0] as usize];
    let mut area = 0.0;
    for i in 1..polygon.indices.len() - 1 {
        let b = tile.vertices[polygon.indices[i] as usize];
        let c = tile.vertices[polygon.indices[i + 1] as usize];
        area += triangle_area_2d(base, b, c).abs() * 0.5;
    }
    area
}

fn triangle_area_2d(a: Vec3, b: Vec3, c: Vec3) -> f32 {
    let ab_x = b.x - a.x;
    let ab_z = b.z - a.z;

    let ac_x = c.x - a.x;
    let ac_z = c.z - a.z;

    ac_x * ab_z - ab_x * ac_z
}

/// Signed side of ``point`` relative to polygon edge ``a -> b``; interior
/// points are non-positive for every edge.
fn edge_side_2d(a: Vec3, b: Vec3, point: Vec3) -> f32 {
    (b.x - a.x) * (point.z - a.z) - (point.x - a.x) * (b.z - a.z)
}

fn point_inside_polygon_2d(point: Vec3, outline: &[Vec3]) -> bool {
    const EPS: f32 = 1e-4;
    (0..outline.len()).all(|i| {
        let a = outline[i];
        let b = outline[(i + 1) % outline.len()];
        edge_side_2d(a, b, point) <= EPS
    })
}

/// Clips the segment ``p -> q`` against a convex polygon outline, returning
/// the parametric exit distance & the exited edge.
fn intersect_segment_polygon_exit(p: Vec3, q: Vec3, outline: &[Vec3]) -> Option<(f32, usize)> {
    let mut t_exit = f32::MAX;
    let mut exit_edge = None;

    for i in 0..outline.len() {
        let a = outline[i];
        let b = outline[(i + 1) % outline.len()];

        let d0 = edge_side_2d(a, b, p);
        let d1 = edge_side_2d(a, b, q);

        // Crossing from inside to outside of this edge.
        if d0 <= 0.0 && d1 > 0.0 {
            let t = d0 / (d0 - d1);
            if t < t_exit {
                t_exit = t;
                exit_edge = Some(i);
            }
        }
    }

    exit_edge.map(|edge| (t_exit, edge))
}
