//! Polygonization: contours in, convex-polygon nav-mesh out.
//!
//! Each contour is ear-clipped into triangles on exact integer predicates, then the
//! triangles are greedily merged back into convex polygons of up to
//! [NavMeshSettings::max_vertices_per_polygon] vertices. Vertices are deduplicated
//! through a spatial hash, border vertices flagged by the contour stage are removed for
//! tile stitching, and a shared-edge table wires up polygon adjacency.

use bevy::log::warn;
use bevy::math::{IVec4, U16Vec3, Vec3};
use thiserror::Error;

use crate::{
    contour::ContourSet,
    math::{intersect, intersect_prop, left, left_on},
    NavMeshSettings, FLAG_BORDER_VERTEX, NULL_INDEX,
};

const VERTEX_BUCKET_COUNT: usize = 1 << 12; // 4 096

/// Bit 15 of a neighbour slot: the edge is a portal onto the neighbouring tile.
pub const PORTAL_FLAG: u16 = 0x8000;
const PORTAL_DIR_SHIFT: u16 = 13;

/// Encodes a portal neighbour slot: bit 15 set, direction (0..3) in bits 13-14.
#[inline]
pub fn encode_portal(dir: u8) -> u16 {
    debug_assert!(dir < 4);
    PORTAL_FLAG | ((dir as u16) << PORTAL_DIR_SHIFT)
}

/// The portal direction of a neighbour slot, if it is portal-coded.
#[inline]
pub fn portal_direction(neighbour: u16) -> Option<u8> {
    (neighbour != NULL_INDEX && neighbour & PORTAL_FLAG != 0)
        .then_some(((neighbour >> PORTAL_DIR_SHIFT) & 0x3) as u8)
}

/// The baked navigation mesh: deduplicated grid-space vertices plus a flat polygon
/// table.
///
/// Each polygon occupies `vertices_per_polygon * 2` slots in `polygons`: the first
/// `vertices_per_polygon` are vertex indices ([NULL_INDEX]-terminated when short), the
/// second are per-edge neighbour polygon indices ([NULL_INDEX] for open edges,
/// portal-coded values on tile boundaries).
#[derive(Default, Clone)]
pub struct PolyMesh {
    pub vertices: Vec<U16Vec3>,
    pub polygons: Vec<u16>,
    pub regions: Vec<u16>,
    pub flags: Vec<u16>,
    pub areas: Vec<u8>,
    pub vertices_per_polygon: usize,
    pub min_bound: Vec3,
    pub max_bound: Vec3,
    pub cell_width: f32,
    pub cell_height: f32,
    pub border_size: u16,
    pub max_edge_error: f32,
}

impl PolyMesh {
    #[inline]
    pub fn polygon_count(&self) -> usize {
        self.regions.len()
    }

    /// The polygon's vertex-index slots (padded with [NULL_INDEX]).
    #[inline]
    pub fn polygon_vertices(&self, polygon: usize) -> &[u16] {
        let base = polygon * self.vertices_per_polygon * 2;
        &self.polygons[base..base + self.vertices_per_polygon]
    }

    /// The polygon's neighbour slots, parallel to [Self::polygon_vertices].
    #[inline]
    pub fn polygon_neighbours(&self, polygon: usize) -> &[u16] {
        let base = polygon * self.vertices_per_polygon * 2 + self.vertices_per_polygon;
        &self.polygons[base..base + self.vertices_per_polygon]
    }

    #[inline]
    pub fn polygon_vertex_count(&self, polygon: usize) -> usize {
        count_polygon_vertices(self.polygon_vertices(polygon))
    }
}

/// Polygonization hit a hard limit.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MeshError {
    #[error("poly mesh holds {0} vertices, more than a 16-bit index can address")]
    TooManyVertices(usize),
}

#[inline]
fn count_polygon_vertices(polygon: &[u16]) -> usize {
    polygon
        .iter()
        .position(|vertex| *vertex == NULL_INDEX)
        .unwrap_or(polygon.len())
}

/// `c` is left of `a -> b` (or on the line), on u16 grid vertices.
#[inline]
fn uleft(a: U16Vec3, b: U16Vec3, c: U16Vec3) -> bool {
    (b.x as i32 - a.x as i32) * (c.z as i32 - a.z as i32)
        - (c.x as i32 - a.x as i32) * (b.z as i32 - a.z as i32)
        < 0
}

/// Builds the convex-polygon mesh from a contour set.
pub fn build_poly_mesh(
    contour_set: &ContourSet,
    settings: &NavMeshSettings,
) -> Result<PolyMesh, MeshError> {
    let nvp = settings.max_vertices_per_polygon as usize;

    let mut max_vertices = 0;
    let mut max_tris = 0;
    let mut max_verts_per_contour = 0;
    for contour in &contour_set.contours {
        if contour.vertices.len() < 3 {
            continue;
        }
        max_vertices += contour.vertices.len();
        max_tris += contour.vertices.len() - 2;
        max_verts_per_contour = contour.vertices.len().max(max_verts_per_contour);
    }

    let mut mesh = PolyMesh {
        vertices: Vec::with_capacity(max_vertices),
        polygons: Vec::with_capacity(max_tris * nvp * 2),
        regions: Vec::with_capacity(max_tris),
        flags: Vec::with_capacity(max_tris),
        areas: Vec::with_capacity(max_tris),
        vertices_per_polygon: nvp,
        min_bound: contour_set.min_bound,
        max_bound: contour_set.max_bound,
        cell_width: contour_set.cell_width,
        cell_height: contour_set.cell_height,
        border_size: contour_set.border_size,
        max_edge_error: contour_set.max_error,
    };

    let mut first_vertex = vec![-1i32; VERTEX_BUCKET_COUNT];
    let mut next_vertex = vec![0i32; max_vertices];
    // Vertices flagged for removal once all polygons are in.
    let mut vertex_flags = vec![false; max_vertices];

    let mut indices: Vec<u32> = Vec::with_capacity(max_verts_per_contour);
    let mut triangles: Vec<u32> = Vec::with_capacity(max_verts_per_contour * 3);
    let mut polygons: Vec<u16> = Vec::with_capacity((max_verts_per_contour + 1) * nvp);

    for contour in &contour_set.contours {
        if contour.vertices.len() < 3 {
            continue;
        }

        indices.clear();
        triangles.clear();
        indices.extend(0..contour.vertices.len() as u32);

        if !triangulate(&contour.vertices, &mut indices, &mut triangles) {
            // Bad contour; a fan at least keeps the region covered.
            warn!(
                "Triangulation failed for contour of region {}; falling back to a fan.",
                contour.region
            );
            triangles.clear();
            for i in 1..contour.vertices.len() as u32 - 1 {
                triangles.extend_from_slice(&[0, i, i + 1]);
            }
        }

        // Deduplicate vertices into the mesh, remembering each contour vertex's global
        // index.
        indices.clear();
        for vertex in contour.vertices.iter() {
            let index = add_vertex(
                U16Vec3::new(
                    vertex.x.max(0) as u16,
                    vertex.y.max(0) as u16,
                    vertex.z.max(0) as u16,
                ),
                &mut mesh.vertices,
                &mut first_vertex,
                &mut next_vertex,
            );
            if vertex.w & FLAG_BORDER_VERTEX != 0 {
                vertex_flags[index as usize] = true;
            }
            indices.push(index);
        }

        // Start with every triangle as its own polygon.
        polygons.clear();
        for triangle in triangles.chunks_exact(3) {
            let a = indices[triangle[0] as usize] as u16;
            let b = indices[triangle[1] as usize] as u16;
            let c = indices[triangle[2] as usize] as u16;
            if a != b && a != c && b != c {
                polygons.extend_from_slice(&[a, b, c]);
                polygons.extend(std::iter::repeat(NULL_INDEX).take(nvp - 3));
            }
        }
        if polygons.is_empty() {
            continue;
        }

        if nvp > 3 {
            merge_polygons(&mut polygons, nvp, &mesh.vertices);
        }

        for polygon in polygons.chunks_exact(nvp) {
            let base = mesh.polygons.len();
            mesh.polygons.extend_from_slice(polygon);
            mesh.polygons
                .extend(std::iter::repeat(NULL_INDEX).take(nvp));
            debug_assert_eq!(mesh.polygons.len(), base + nvp * 2);

            mesh.regions.push(contour.region);
            mesh.flags.push(0);
            mesh.areas.push(contour.area);
        }
    }

    if mesh.vertices.len() >= NULL_INDEX as usize {
        return Err(MeshError::TooManyVertices(mesh.vertices.len()));
    }

    // Remove vertices the contour stage flagged as border junk; they only existed to
    // keep neighbouring tiles' contours identical.
    let mut vertex = 0;
    while vertex < mesh.vertices.len() {
        if vertex_flags[vertex] && can_remove_vertex(&mesh, vertex as u16) {
            remove_vertex(&mut mesh, vertex as u16);
            // The removal compacts both arrays; re-test the slot that moved in.
            vertex_flags.remove(vertex);
        } else {
            vertex += 1;
        }
    }

    build_mesh_adjacency(&mut mesh);

    if mesh.border_size > 0 {
        mark_portal_edges(&mut mesh, contour_set);
    }

    Ok(mesh)
}

fn merge_polygons(polygons: &mut Vec<u16>, nvp: usize, vertices: &[U16Vec3]) {
    loop {
        // Find the best pair of polygons to merge: longest shared edge wins.
        let mut best_merge_value = 0i64;
        let mut best = None;

        let polygon_count = polygons.len() / nvp;
        for a in 0..polygon_count - 1 {
            for b in a + 1..polygon_count {
                let merge = polygon_merge_value(
                    &polygons[a * nvp..a * nvp + nvp],
                    &polygons[b * nvp..b * nvp + nvp],
                    vertices,
                    nvp,
                );
                if let Some((value, edge_a, edge_b)) = merge {
                    if value > best_merge_value {
                        best_merge_value = value;
                        best = Some((a, b, edge_a, edge_b));
                    }
                }
            }
        }

        let Some((a, b, edge_a, edge_b)) = best else {
            break;
        };

        let merged = merge_polygon_pair(
            &polygons[a * nvp..a * nvp + nvp],
            &polygons[b * nvp..b * nvp + nvp],
            edge_a,
            edge_b,
            nvp,
        );
        polygons[a * nvp..a * nvp + nvp].copy_from_slice(&merged);

        // Swap-remove polygon b.
        let last = polygons.len() - nvp;
        polygons.copy_within(last.., b * nvp);
        polygons.truncate(last);
    }
}

/// Squared length of the shared edge if `a` & `b` can merge into one convex polygon
/// within `nvp` vertices.
fn polygon_merge_value(
    a: &[u16],
    b: &[u16],
    vertices: &[U16Vec3],
    nvp: usize,
) -> Option<(i64, usize, usize)> {
    let count_a = count_polygon_vertices(a);
    let count_b = count_polygon_vertices(b);

    if count_a + count_b - 2 > nvp {
        return None;
    }

    // Find the shared edge.
    let mut shared = None;
    'outer: for i in 0..count_a {
        let mut va0 = a[i];
        let mut va1 = a[(i + 1) % count_a];
        if va0 > va1 {
            std::mem::swap(&mut va0, &mut va1);
        }
        for j in 0..count_b {
            let mut vb0 = b[j];
            let mut vb1 = b[(j + 1) % count_b];
            if vb0 > vb1 {
                std::mem::swap(&mut vb0, &mut vb1);
            }
            if va0 == vb0 && va1 == vb1 {
                shared = Some((i, j));
                break 'outer;
            }
        }
    }
    let (edge_a, edge_b) = shared?;

    // Both connection corners must stay convex; everything else already is because the
    // inputs are convex.
    let va = a[(edge_a + count_a - 1) % count_a];
    let vb = a[edge_a];
    let vc = b[(edge_b + 2) % count_b];
    if !uleft(
        vertices[va as usize],
        vertices[vb as usize],
        vertices[vc as usize],
    ) {
        return None;
    }

    let va = b[(edge_b + count_b - 1) % count_b];
    let vb = b[edge_b];
    let vc = a[(edge_a + 2) % count_a];
    if !uleft(
        vertices[va as usize],
        vertices[vb as usize],
        vertices[vc as usize],
    ) {
        return None;
    }

    let va = a[edge_a];
    let vb = a[(edge_a + 1) % count_a];
    let delta_x = vertices[va as usize].x as i64 - vertices[vb as usize].x as i64;
    let delta_z = vertices[va as usize].z as i64 - vertices[vb as usize].z as i64;
    Some((delta_x * delta_x + delta_z * delta_z, edge_a, edge_b))
}

/// Splices `b` into `a` across the shared edge, dropping the edge itself.
fn merge_polygon_pair(a: &[u16], b: &[u16], edge_a: usize, edge_b: usize, nvp: usize) -> Vec<u16> {
    let count_a = count_polygon_vertices(a);
    let count_b = count_polygon_vertices(b);

    let mut merged = vec![NULL_INDEX; nvp];
    let mut n = 0;
    for i in 0..count_a - 1 {
        merged[n] = a[(edge_a + 1 + i) % count_a];
        n += 1;
    }
    for i in 0..count_b - 1 {
        merged[n] = b[(edge_b + 1 + i) % count_b];
        n += 1;
    }

    merged
}

fn compute_vertex_hash(x: u64, z: u64) -> u64 {
    // Large multiplicative constants, here arbitrarily chosen primes.
    const HASH_X: u64 = 0x8da6b343;
    const HASH_Z: u64 = 0xcb1ab31f;

    let hash = x.wrapping_mul(HASH_X).wrapping_add(z.wrapping_mul(HASH_Z));
    hash & (VERTEX_BUCKET_COUNT - 1) as u64
}

fn add_vertex(
    vertex: U16Vec3,
    vertices: &mut Vec<U16Vec3>,
    first_vertex: &mut [i32],
    next_vertex: &mut [i32],
) -> u32 {
    let bucket = compute_vertex_hash(vertex.x.into(), vertex.z.into());
    let mut i = first_vertex[bucket as usize];

    while i != -1 {
        let other_vertex = vertices[i as usize];
        if other_vertex.x == vertex.x
            && other_vertex.z == vertex.z
            && other_vertex.y.abs_diff(vertex.y) <= 2
        {
            return i as u32;
        }
        i = next_vertex[i as usize];
    }

    let i = vertices.len();
    vertices.push(vertex);
    next_vertex[i] = first_vertex[bucket as usize];
    first_vertex[bucket as usize] = i as i32;
    i as u32
}

/// True when vertex `remove` can go away and its hole still be re-filled: enough edges
/// remain and at most the two boundary edges are open.
fn can_remove_vertex(mesh: &PolyMesh, remove: u16) -> bool {
    let mut touched_vertices = 0usize;
    let mut remaining_edges = 0isize;
    for polygon in 0..mesh.polygon_count() {
        let vertices = mesh.polygon_vertices(polygon);
        let count = count_polygon_vertices(vertices);

        let removed = vertices[..count]
            .iter()
            .filter(|vertex| **vertex == remove)
            .count();
        if removed > 0 {
            touched_vertices += removed;
            remaining_edges += count as isize - (removed as isize + 1);
        }
    }
    if remaining_edges <= 2 {
        // The hole could not even form a triangle.
        return false;
    }

    // Edges incident to the vertex, with their multiplicity.
    let mut edges: Vec<(u16, u32)> = Vec::with_capacity(touched_vertices * 2);
    for polygon in 0..mesh.polygon_count() {
        let vertices = mesh.polygon_vertices(polygon);
        let count = count_polygon_vertices(vertices);

        let mut k = count - 1;
        for j in 0..count {
            if vertices[j] == remove || vertices[k] == remove {
                let other = if vertices[j] == remove {
                    vertices[k]
                } else {
                    vertices[j]
                };
                if other != remove {
                    match edges.iter_mut().find(|(vertex, _)| *vertex == other) {
                        Some((_, multiplicity)) => *multiplicity += 1,
                        None => edges.push((other, 1)),
                    }
                }
            }
            k = j;
        }
    }

    let open_edges = edges
        .iter()
        .filter(|(_, multiplicity)| *multiplicity < 2)
        .count();
    open_edges <= 2
}

/// Removes a vertex: deletes the polygons touching it, stitches the surrounding edges
/// into a hole ring, re-triangulates & re-merges the ring, and splices the result back
/// into the mesh.
fn remove_vertex(mesh: &mut PolyMesh, remove: u16) {
    let nvp = mesh.vertices_per_polygon;

    // Collect the hole boundary from the doomed polygons, then drop them.
    let mut edges: Vec<[u16; 4]> = Vec::new();
    let mut polygon = 0;
    while polygon < mesh.polygon_count() {
        let vertices = mesh.polygon_vertices(polygon);
        let count = count_polygon_vertices(vertices);
        if !vertices[..count].contains(&remove) {
            polygon += 1;
            continue;
        }

        let mut k = count - 1;
        for j in 0..count {
            if vertices[j] != remove && vertices[k] != remove {
                edges.push([
                    vertices[k],
                    vertices[j],
                    mesh.regions[polygon],
                    mesh.areas[polygon] as u16,
                ]);
            }
            k = j;
        }

        // Swap-remove the polygon.
        let last = mesh.polygon_count() - 1;
        if polygon != last {
            let (head, tail) = mesh.polygons.split_at_mut(last * nvp * 2);
            head[polygon * nvp * 2..(polygon + 1) * nvp * 2].copy_from_slice(tail);
            mesh.regions[polygon] = mesh.regions[last];
            mesh.flags[polygon] = mesh.flags[last];
            mesh.areas[polygon] = mesh.areas[last];
        }
        mesh.polygons.truncate(last * nvp * 2);
        mesh.regions.truncate(last);
        mesh.flags.truncate(last);
        mesh.areas.truncate(last);
    }

    // Drop the vertex and shift every higher index down.
    mesh.vertices.remove(remove as usize);
    for slot in mesh.polygons.iter_mut() {
        if *slot != NULL_INDEX && *slot > remove {
            *slot -= 1;
        }
    }
    for edge in edges.iter_mut() {
        if edge[0] > remove {
            edge[0] -= 1;
        }
        if edge[1] > remove {
            edge[1] -= 1;
        }
    }

    if edges.is_empty() {
        return;
    }

    // Stitch the loose edges into one ring around the hole: start from one endpoint and
    // keep attaching edges to whichever end of the chain they continue.
    let mut hole = Vec::with_capacity(edges.len() + 1);
    let mut hole_regions = Vec::with_capacity(edges.len() + 1);
    let mut hole_areas = Vec::with_capacity(edges.len() + 1);

    hole.push(edges[0][0]);
    hole_regions.push(edges[0][2]);
    hole_areas.push(edges[0][3] as u8);

    while !edges.is_empty() {
        let mut matched = false;

        let mut i = 0;
        while i < edges.len() {
            let [edge_a, edge_b, region, area] = edges[i];

            let added = if hole[0] == edge_b {
                // Continues the ring start: push front.
                hole.insert(0, edge_a);
                hole_regions.insert(0, region);
                hole_areas.insert(0, area as u8);
                true
            } else if *hole.last().unwrap() == edge_a {
                // Continues the ring end: push back.
                hole.push(edge_b);
                hole_regions.push(region);
                hole_areas.push(area as u8);
                true
            } else {
                false
            };

            if added {
                edges.swap_remove(i);
                matched = true;
            } else {
                i += 1;
            }
        }

        if !matched {
            warn!("Hole around removed vertex did not close; leftover edges dropped.");
            break;
        }
    }

    // A fully interior vertex yields a closed ring whose stitching duplicates the start
    // vertex at the far end.
    if hole.len() > 1 && hole.first() == hole.last() {
        hole.pop();
        hole_regions.pop();
        hole_areas.pop();
    }

    if hole.len() < 3 {
        warn!("Hole around removed vertex has fewer than three vertices; nothing rebuilt.");
        return;
    }

    // Re-triangulate the hole ring.
    let hole_vertices: Vec<IVec4> = hole
        .iter()
        .map(|vertex| {
            let v = mesh.vertices[*vertex as usize];
            IVec4::new(v.x as i32, v.y as i32, v.z as i32, 0)
        })
        .collect();

    let mut indices: Vec<u32> = (0..hole.len() as u32).collect();
    let mut triangles = Vec::with_capacity(hole.len() * 3);
    if !triangulate(&hole_vertices, &mut indices, &mut triangles) {
        warn!("Hole triangulation around removed vertex failed; falling back to a fan.");
        triangles.clear();
        for i in 1..hole_vertices.len() as u32 - 1 {
            triangles.extend_from_slice(&[0, i, i + 1]);
        }
    }

    let mut polygons: Vec<u16> = Vec::with_capacity(triangles.len() / 3 * nvp);
    let mut polygon_regions = Vec::new();
    let mut polygon_areas = Vec::new();
    for triangle in triangles.chunks_exact(3) {
        let a = hole[triangle[0] as usize];
        let b = hole[triangle[1] as usize];
        let c = hole[triangle[2] as usize];
        if a != b && a != c && b != c {
            polygons.extend_from_slice(&[a, b, c]);
            polygons.extend(std::iter::repeat(NULL_INDEX).take(nvp - 3));
            polygon_regions.push(hole_regions[triangle[0] as usize]);
            polygon_areas.push(hole_areas[triangle[0] as usize]);
        }
    }
    if polygons.is_empty() {
        return;
    }

    if nvp > 3 {
        // Merging invalidates the per-polygon region/area pairing beyond the first
        // survivor, so merge on a parallel structure.
        merge_polygons_tracked(
            &mut polygons,
            &mut polygon_regions,
            &mut polygon_areas,
            nvp,
            &mesh.vertices,
        );
    }

    for (index, polygon) in polygons.chunks_exact(nvp).enumerate() {
        mesh.polygons.extend_from_slice(polygon);
        mesh.polygons
            .extend(std::iter::repeat(NULL_INDEX).take(nvp));
        mesh.regions.push(polygon_regions[index]);
        mesh.flags.push(0);
        mesh.areas.push(polygon_areas[index]);
    }
}

fn merge_polygons_tracked(
    polygons: &mut Vec<u16>,
    regions: &mut Vec<u16>,
    areas: &mut Vec<u8>,
    nvp: usize,
    vertices: &[U16Vec3],
) {
    loop {
        let mut best_merge_value = 0i64;
        let mut best = None;

        let polygon_count = polygons.len() / nvp;
        for a in 0..polygon_count.saturating_sub(1) {
            for b in a + 1..polygon_count {
                let merge = polygon_merge_value(
                    &polygons[a * nvp..a * nvp + nvp],
                    &polygons[b * nvp..b * nvp + nvp],
                    vertices,
                    nvp,
                );
                if let Some((value, edge_a, edge_b)) = merge {
                    if value > best_merge_value {
                        best_merge_value = value;
                        best = Some((a, b, edge_a, edge_b));
                    }
                }
            }
        }

        let Some((a, b, edge_a, edge_b)) = best else {
            break;
        };

        let merged = merge_polygon_pair(
            &polygons[a * nvp..a * nvp + nvp],
            &polygons[b * nvp..b * nvp + nvp],
            edge_a,
            edge_b,
            nvp,
        );
        polygons[a * nvp..a * nvp + nvp].copy_from_slice(&merged);

        let last = polygons.len() - nvp;
        polygons.copy_within(last.., b * nvp);
        polygons.truncate(last);
        regions.swap_remove(b);
        areas.swap_remove(b);
    }
}

#[derive(Debug)]
struct Edge {
    vertices: [u16; 2],
    edge_in_polygon: [usize; 2],
    polygon: [usize; 2],
}

/// Builds the symmetric neighbour table: every interior edge gets back-pointers on both
/// sides, boundary edges stay [NULL_INDEX].
fn build_mesh_adjacency(mesh: &mut PolyMesh) {
    let nvp = mesh.vertices_per_polygon;
    let polygon_count = mesh.polygon_count();
    let vertex_count = mesh.vertices.len();
    let max_edge_count = polygon_count * nvp;

    let mut first_edge: Vec<Option<usize>> = vec![None; vertex_count];
    let mut next_edge: Vec<Option<usize>> = vec![None; max_edge_count];
    let mut edges: Vec<Edge> = Vec::with_capacity(max_edge_count);

    // First pass records each edge at its lower vertex.
    for polygon in 0..polygon_count {
        let vertices = mesh.polygon_vertices(polygon);
        let count = count_polygon_vertices(vertices);

        for j in 0..count {
            let current = vertices[j];
            let next = vertices[(j + 1) % count];
            if current < next {
                next_edge[edges.len()] = first_edge[current as usize];
                first_edge[current as usize] = Some(edges.len());
                edges.push(Edge {
                    vertices: [current, next],
                    edge_in_polygon: [j, 0],
                    polygon: [polygon, polygon],
                });
            }
        }
    }

    // Second pass matches the reverse-direction occurrences.
    for polygon in 0..polygon_count {
        let vertices = mesh.polygon_vertices(polygon);
        let count = count_polygon_vertices(vertices);

        for j in 0..count {
            let current = vertices[j];
            let next = vertices[(j + 1) % count];
            if current > next {
                let mut edge_iter = first_edge[next as usize];
                while let Some(edge_index) = edge_iter {
                    let edge = &mut edges[edge_index];
                    if edge.vertices[1] == current && edge.polygon[0] == edge.polygon[1] {
                        edge.polygon[1] = polygon;
                        edge.edge_in_polygon[1] = j;
                        break;
                    }
                    edge_iter = next_edge[edge_index];
                }
            }
        }
    }

    for edge in edges.iter() {
        if edge.polygon[0] != edge.polygon[1] {
            let base_one = edge.polygon[0] * nvp * 2 + nvp;
            let base_two = edge.polygon[1] * nvp * 2 + nvp;
            mesh.polygons[base_one + edge.edge_in_polygon[0]] = edge.polygon[1] as u16;
            mesh.polygons[base_two + edge.edge_in_polygon[1]] = edge.polygon[0] as u16;
        }
    }
}

/// Tags open edges lying exactly on the un-bordered tile boundary with direction-coded
/// portal values so a tile stitcher can wire them to the neighbouring tile.
fn mark_portal_edges(mesh: &mut PolyMesh, contour_set: &ContourSet) {
    let nvp = mesh.vertices_per_polygon;
    let width = contour_set.width as u16;
    let height = contour_set.height as u16;

    for polygon in 0..mesh.polygon_count() {
        let count = mesh.polygon_vertex_count(polygon);

        for j in 0..count {
            let base = polygon * nvp * 2;
            if mesh.polygons[base + nvp + j] != NULL_INDEX {
                continue;
            }

            let vertex_a = mesh.vertices[mesh.polygons[base + j] as usize];
            let vertex_b = mesh.vertices[mesh.polygons[base + (j + 1) % count] as usize];

            // Only edges flush with a tile side qualify.
            let neighbour_slot = if vertex_a.x == 0 && vertex_b.x == 0 {
                Some(encode_portal(0))
            } else if vertex_a.z == height && vertex_b.z == height {
                Some(encode_portal(1))
            } else if vertex_a.x == width && vertex_b.x == width {
                Some(encode_portal(2))
            } else if vertex_a.z == 0 && vertex_b.z == 0 {
                Some(encode_portal(3))
            } else {
                None
            };

            if let Some(slot) = neighbour_slot {
                mesh.polygons[base + nvp + j] = slot;
            }
        }
    }
}

/// Predicate strictness for ear tests. [Strictness::Loose] accepts collinear
/// configurations and endpoint touches, which show up on contours with doubled splice
/// edges or collinear vertex runs.
#[derive(Clone, Copy, PartialEq)]
enum Strictness {
    Strict,
    Loose,
}

/// Ear-clipping triangulation over a contour's integer vertices. `loop_indices` enters
/// as `0..n` and is consumed; triangles come out as index triples. Returns false when
/// no ear can be clipped even with loose predicates.
fn triangulate(vertices: &[IVec4], loop_indices: &mut Vec<u32>, triangles: &mut Vec<u32>) -> bool {
    // Ear status per loop entry, maintained alongside the loop as it shrinks.
    let mut ears: Vec<bool> = (0..loop_indices.len())
        .map(|corner| is_ear(vertices, loop_indices, corner, Strictness::Strict))
        .collect();

    while loop_indices.len() > 3 {
        let clip = match shortest_ear(vertices, loop_indices, &ears) {
            Some(corner) => corner,
            None => {
                // No strict ear left; re-grade every corner with the tolerant
                // predicates before giving up.
                for (corner, ear) in ears.iter_mut().enumerate() {
                    *ear = is_ear(vertices, loop_indices, corner, Strictness::Loose);
                }
                match shortest_ear(vertices, loop_indices, &ears) {
                    Some(corner) => corner,
                    None => return false,
                }
            }
        };

        let len = loop_indices.len();
        triangles.push(loop_indices[(clip + len - 1) % len]);
        triangles.push(loop_indices[clip]);
        triangles.push(loop_indices[(clip + 1) % len]);

        loop_indices.remove(clip);
        ears.remove(clip);

        // Clipping only changes the two corners that were beside the ear.
        let len = loop_indices.len();
        let after = clip % len;
        let before = (after + len - 1) % len;
        ears[before] = is_ear(vertices, loop_indices, before, Strictness::Strict);
        ears[after] = is_ear(vertices, loop_indices, after, Strictness::Strict);
    }

    triangles.extend_from_slice(loop_indices);
    loop_indices.clear();

    true
}

/// The clippable ear whose cut diagonal is shortest; short diagonals give the roundest
/// triangles.
fn shortest_ear(vertices: &[IVec4], loop_indices: &[u32], ears: &[bool]) -> Option<usize> {
    let len = loop_indices.len();
    let mut best: Option<(usize, i64)> = None;

    for corner in ears
        .iter()
        .enumerate()
        .filter_map(|(corner, ear)| ear.then_some(corner))
    {
        let from = vertices[loop_indices[(corner + len - 1) % len] as usize];
        let to = vertices[loop_indices[(corner + 1) % len] as usize];
        let delta_x = (to.x - from.x) as i64;
        let delta_z = (to.z - from.z) as i64;
        let length = delta_x * delta_x + delta_z * delta_z;

        if best.is_none_or(|(_, shortest)| length < shortest) {
            best = Some((corner, length));
        }
    }

    best.map(|(corner, _)| corner)
}

/// Whether `corner` can be clipped: the diagonal bridging its neighbours must leave the
/// polygon interior on the correct side and cross no other loop edge.
fn is_ear(vertices: &[IVec4], loop_indices: &[u32], corner: usize, strictness: Strictness) -> bool {
    let len = loop_indices.len();
    let from = (corner + len - 1) % len;
    let to = (corner + 1) % len;

    diagonal_in_cone(vertices, loop_indices, from, to, strictness)
        && diagonal_unblocked(vertices, loop_indices, from, to, strictness)
}

/// The diagonal from loop entry `from` to loop entry `to` starts into the polygon
/// interior at `from`.
fn diagonal_in_cone(
    vertices: &[IVec4],
    loop_indices: &[u32],
    from: usize,
    to: usize,
    strictness: Strictness,
) -> bool {
    let len = loop_indices.len();
    let resolve = |entry: usize| vertices[loop_indices[entry] as usize];

    let origin = resolve(from);
    let target = resolve(to);
    let origin_prev = resolve((from + len - 1) % len);
    let origin_next = resolve((from + 1) % len);

    // The loose grade lets the diagonal graze the cone edges.
    let inside = |a, b, c| match strictness {
        Strictness::Strict => left(a, b, c),
        Strictness::Loose => left_on(a, b, c),
    };

    if left_on(origin_prev, origin, origin_next) {
        // Convex corner.
        inside(origin, target, origin_prev) && inside(target, origin, origin_next)
    } else {
        // Reflex corner.
        !(left_on(origin, target, origin_next) && left_on(target, origin, origin_prev))
    }
}

/// No non-incident loop edge blocks the diagonal between loop entries `from` and `to`.
fn diagonal_unblocked(
    vertices: &[IVec4],
    loop_indices: &[u32],
    from: usize,
    to: usize,
    strictness: Strictness,
) -> bool {
    let len = loop_indices.len();
    let resolve = |entry: usize| vertices[loop_indices[entry] as usize];
    let same_spot = |a: IVec4, b: IVec4| a.x == b.x && a.z == b.z;

    let start = resolve(from);
    let end = resolve(to);

    (0..len).all(|edge| {
        let edge_end = (edge + 1) % len;
        if edge == from || edge == to || edge_end == from || edge_end == to {
            return true;
        }

        let a = resolve(edge);
        let b = resolve(edge_end);
        // The loop revisits spliced vertices by coordinate; those edges share an
        // endpoint with the diagonal in all but index and cannot block it.
        if same_spot(start, a) || same_spot(end, a) || same_spot(start, b) || same_spot(end, b) {
            return true;
        }

        match strictness {
            Strictness::Strict => !intersect(start, end, a, b),
            Strictness::Loose => !intersect_prop(start, end, a, b),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contour::Contour;
    use crate::{NavMeshSettings, WALKABLE_AREA};

    fn settings() -> NavMeshSettings {
        let mut settings = NavMeshSettings::from_agent(0.5, 1.8, 0.4);
        settings.max_vertices_per_polygon = 6;
        settings
    }

    fn contour_set_of(contours: Vec<Contour>) -> ContourSet {
        ContourSet {
            contours,
            min_bound: Vec3::ZERO,
            max_bound: Vec3::new(16.0, 8.0, 16.0),
            cell_width: 1.0,
            cell_height: 1.0,
            width: 16,
            height: 16,
            border_size: 0,
            max_error: 1.3,
        }
    }

    /// Counter-clockwise (Y up) closed loop from xz pairs.
    fn loop_contour(region: u16, points: &[(i32, i32)]) -> Contour {
        Contour {
            vertices: points
                .iter()
                .map(|(x, z)| IVec4::new(*x, 0, *z, 0))
                .collect(),
            raw_vertices: Vec::new(),
            region,
            area: WALKABLE_AREA,
        }
    }

    #[test]
    fn triangulating_a_square_yields_two_triangles() {
        let vertices = [
            IVec4::new(0, 0, 0, 0),
            IVec4::new(0, 0, 4, 0),
            IVec4::new(4, 0, 4, 0),
            IVec4::new(4, 0, 0, 0),
        ];
        let mut indices: Vec<u32> = (0..4).collect();
        let mut triangles = Vec::new();

        assert!(triangulate(&vertices, &mut indices, &mut triangles));
        assert_eq!(triangles.len(), 6);
    }

    #[test]
    fn convex_contour_within_nvp_stays_one_polygon() {
        // A counter-clockwise hexagon; nvp = 6 fits it exactly.
        let contour = loop_contour(
            1,
            &[(2, 0), (0, 2), (0, 4), (2, 6), (4, 4), (4, 2)],
        );
        let mesh = build_poly_mesh(&contour_set_of(vec![contour]), &settings()).unwrap();

        assert_eq!(mesh.polygon_count(), 1);
        assert_eq!(mesh.polygon_vertex_count(0), 6);

        // Same cyclic order as the input contour.
        let polygon = mesh.polygon_vertices(0);
        let coords: Vec<(u16, u16)> = polygon[..6]
            .iter()
            .map(|v| {
                let vertex = mesh.vertices[*v as usize];
                (vertex.x, vertex.z)
            })
            .collect();
        let expected = [(2, 0), (0, 2), (0, 4), (2, 6), (4, 4), (4, 2)];
        let offset = expected
            .iter()
            .position(|p| *p == coords[0])
            .expect("first polygon vertex must come from the contour");
        for (i, coord) in coords.iter().enumerate() {
            assert_eq!(*coord, expected[(offset + i) % 6]);
        }
    }

    #[test]
    fn polygons_are_convex_after_merging() {
        // An L-shaped region cannot merge into one convex polygon.
        let contour = loop_contour(
            1,
            &[(0, 0), (0, 8), (4, 8), (4, 4), (8, 4), (8, 0)],
        );
        let mesh = build_poly_mesh(&contour_set_of(vec![contour]), &settings()).unwrap();

        assert!(mesh.polygon_count() >= 2);
        for polygon in 0..mesh.polygon_count() {
            let vertices = mesh.polygon_vertices(polygon);
            let count = count_polygon_vertices(vertices);
            assert!((3..=6).contains(&count));

            for i in 0..count {
                let a = mesh.vertices[vertices[i] as usize];
                let b = mesh.vertices[vertices[(i + 1) % count] as usize];
                let c = mesh.vertices[vertices[(i + 2) % count] as usize];
                let cross = (b.x as i32 - a.x as i32) * (c.z as i32 - a.z as i32)
                    - (c.x as i32 - a.x as i32) * (b.z as i32 - a.z as i32);
                assert!(cross <= 0, "non-convex corner in polygon {polygon}");
            }
        }
    }

    #[test]
    fn shared_edges_get_symmetric_neighbours() {
        // Two adjacent squares from different regions share the x = 4 edge.
        let left = loop_contour(1, &[(0, 0), (0, 4), (4, 4), (4, 0)]);
        let right = loop_contour(2, &[(4, 0), (4, 4), (8, 4), (8, 0)]);
        let mesh = build_poly_mesh(&contour_set_of(vec![left, right]), &settings()).unwrap();

        assert_eq!(mesh.polygon_count(), 2);

        let mut found = 0;
        for polygon in 0..2 {
            let neighbours = mesh.polygon_neighbours(polygon);
            for (edge, neighbour) in neighbours.iter().enumerate() {
                if *neighbour == NULL_INDEX || *neighbour & PORTAL_FLAG != 0 {
                    continue;
                }
                found += 1;
                let other = *neighbour as usize;

                // The back-pointer must exist on some edge of the other polygon.
                assert!(
                    mesh.polygon_neighbours(other)
                        .iter()
                        .any(|n| *n == polygon as u16),
                    "edge {edge} of polygon {polygon} lacks a back-pointer"
                );
            }
        }
        assert_eq!(found, 2);
    }

    #[test]
    fn vertices_are_deduplicated_across_contours() {
        let left = loop_contour(1, &[(0, 0), (0, 4), (4, 4), (4, 0)]);
        let right = loop_contour(2, &[(4, 0), (4, 4), (8, 4), (8, 0)]);
        let mesh = build_poly_mesh(&contour_set_of(vec![left, right]), &settings()).unwrap();

        // 6 unique corners, not 8.
        assert_eq!(mesh.vertices.len(), 6);
    }

    #[test]
    fn portal_edges_encode_direction_in_the_high_bits() {
        let mut contour_set = contour_set_of(vec![loop_contour(
            1,
            &[(0, 0), (0, 16), (16, 16), (16, 0)],
        )]);
        contour_set.border_size = 1;

        let mesh = build_poly_mesh(&contour_set, &settings()).unwrap();

        let mut portal_dirs = std::collections::HashSet::new();
        for polygon in 0..mesh.polygon_count() {
            for neighbour in mesh.polygon_neighbours(polygon) {
                if let Some(dir) = portal_direction(*neighbour) {
                    portal_dirs.insert(dir);
                    assert_eq!(*neighbour & PORTAL_FLAG, PORTAL_FLAG);
                    assert_eq!(*neighbour & !(PORTAL_FLAG | (0x3 << PORTAL_DIR_SHIFT)), 0);
                }
            }
        }
        // A full-tile quad touches all four sides.
        assert_eq!(portal_dirs.len(), 4);
    }

    #[test]
    fn portal_codes_round_trip() {
        for dir in 0..4u8 {
            let encoded = encode_portal(dir);
            assert_eq!(portal_direction(encoded), Some(dir));
        }
        assert_eq!(portal_direction(NULL_INDEX), None);
        assert_eq!(portal_direction(7), None);
    }

    #[test]
    fn flagged_border_vertices_are_removed() {
        // A square with an extra mid-edge vertex flagged as a border vertex.
        let mut contour = loop_contour(1, &[(0, 0), (0, 4), (2, 4), (4, 4), (4, 0)]);
        contour.vertices[2].w |= FLAG_BORDER_VERTEX;

        let mesh = build_poly_mesh(&contour_set_of(vec![contour]), &settings()).unwrap();

        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.polygon_count(), 1);
        assert_eq!(mesh.polygon_vertex_count(0), 4);
        assert!(!mesh
            .vertices
            .iter()
            .any(|vertex| vertex.x == 2 && vertex.z == 4));
    }

    #[test]
    fn degenerate_contours_are_skipped() {
        let degenerate = loop_contour(1, &[(0, 0), (4, 4)]);
        let mesh = build_poly_mesh(&contour_set_of(vec![degenerate]), &settings()).unwrap();
        assert_eq!(mesh.polygon_count(), 0);
        assert!(mesh.vertices.is_empty());
    }

    #[test]
    fn triangle_mesh_mode_skips_merging() {
        let mut settings = settings();
        settings.max_vertices_per_polygon = 3;

        let contour = loop_contour(1, &[(0, 0), (0, 4), (4, 4), (4, 0)]);
        let mesh = build_poly_mesh(&contour_set_of(vec![contour]), &settings).unwrap();

        assert_eq!(mesh.polygon_count(), 2);
        for polygon in 0..2 {
            assert_eq!(mesh.polygon_vertex_count(polygon), 3);
        }
    }
}
