//! Detail mesh: per-polygon sub-triangulations that restore the surface height lost
//! when contours were simplified and polygons merged.
//!
//! For every nav-mesh polygon a small height patch is flood-filled out of the compact
//! heightfield, the polygon's edges are tessellated and simplified against it, interior
//! samples are inserted Delaunay-style while their vertical error stays above the
//! configured threshold, and the result is appended to a shared vertex & triangle pool.

use std::time::Instant;

use bevy::log::warn;
use bevy::math::{Vec2, Vec3, Vec3Swizzles};

use crate::{
    compact::CompactHeightfield, get_neighbour_index, mesher::PolyMesh, DetailMeshSettings,
    NavMeshSettings, NULL_INDEX,
};

/// Height patch cells that no span of the polygon's region covered.
const UNSET_HEIGHT: u16 = 0xffff;
/// Hard cap on vertices per detail submesh.
const MAX_VERTS: usize = 127;
/// Hard cap on height samples along one polygon edge.
const MAX_VERTS_PER_EDGE: usize = 32;

/// Set in a triangle's 2-bit edge field when that edge lies on the base polygon hull.
pub const DETAIL_EDGE_BOUNDARY: u8 = 0x1;

/// Per-polygon triangulated height detail. `meshes` holds
/// `(vert_base, vert_count, tri_base, tri_count)` per base polygon; triangle vertex
/// indices are local to their submesh.
#[derive(Default, Clone)]
pub struct PolyMeshDetail {
    pub meshes: Vec<[u32; 4]>,
    /// World-space vertices. The first `n` vertices of each submesh are the base
    /// polygon's corners.
    pub vertices: Vec<Vec3>,
    /// `(a, b, c, edge_flags)`; the flag byte packs three 2-bit per-edge fields.
    pub triangles: Vec<[u8; 4]>,
    /// True when a deadline cut the build short; `meshes` holds the polygons finished
    /// so far.
    pub timed_out: bool,
}

/// Extracts the 2-bit edge flags of triangle edge `edge` (0..3).
#[inline]
pub fn detail_edge_flags(triangle_flags: u8, edge: usize) -> u8 {
    (triangle_flags >> (edge * 2)) & 0x3
}

#[derive(Debug)]
struct HeightPatch {
    min_x: i32,
    min_z: i32,
    width: i32,
    height: i32,
    heights: Vec<u16>,
}

impl HeightPatch {
    #[inline]
    fn height_at(&self, x: i32, z: i32) -> u16 {
        self.heights[(x + z * self.width) as usize]
    }

    #[inline]
    fn set_height(&mut self, x: i32, z: i32, height: u16) {
        self.heights[(x + z * self.width) as usize] = height;
    }
}

/// Builds the detail mesh for every polygon of `poly_mesh`, sampling true surface
/// heights from the compact heightfield.
pub fn build_poly_mesh_detail(
    settings: &NavMeshSettings,
    poly_mesh: &PolyMesh,
    compact: &CompactHeightfield,
) -> PolyMeshDetail {
    let detail_settings = settings.detail.clone().unwrap_or_default();
    let mut detail = PolyMeshDetail::default();
    if poly_mesh.polygon_count() == 0 {
        return detail;
    }

    let cell_width = poly_mesh.cell_width;
    let cell_height = poly_mesh.cell_height;
    let nvp = poly_mesh.vertices_per_polygon;
    let border = poly_mesh.border_size as i32;

    // Grid-space bounds per polygon, padded by one cell so edge samples can look
    // sideways.
    let mut max_patch_cells = 0usize;
    let polygon_bounds: Vec<(i32, i32, i32, i32)> = (0..poly_mesh.polygon_count())
        .map(|polygon| {
            let mut min_x = compact.width;
            let mut max_x = 0;
            let mut min_z = compact.height;
            let mut max_z = 0;
            for &vertex in poly_mesh.polygon_vertices(polygon) {
                if vertex == NULL_INDEX {
                    break;
                }
                let v = poly_mesh.vertices[vertex as usize];
                min_x = min_x.min(v.x as i32);
                max_x = max_x.max(v.x as i32);
                min_z = min_z.min(v.z as i32);
                max_z = max_z.max(v.z as i32);
            }
            let min_x = (min_x - 1).max(0);
            let max_x = (max_x + 1).min(compact.width - 2 * border);
            let min_z = (min_z - 1).max(0);
            let max_z = (max_z + 1).min(compact.height - 2 * border);

            max_patch_cells =
                max_patch_cells.max(((max_x - min_x) * (max_z - min_z)).max(0) as usize);
            (min_x, max_x, min_z, max_z)
        })
        .collect();

    let mut height_patch = HeightPatch {
        min_x: 0,
        min_z: 0,
        width: 0,
        height: 0,
        heights: vec![UNSET_HEIGHT; max_patch_cells],
    };

    let started = Instant::now();

    let mut verts: Vec<Vec3> = Vec::with_capacity(256);
    let mut hull: Vec<usize> = Vec::with_capacity(MAX_VERTS);
    let mut triangles: Vec<[u32; 3]> = Vec::with_capacity(512);
    let mut edges: Vec<DetailEdge> = Vec::with_capacity(256);
    let mut samples: Vec<Vec3> = Vec::with_capacity(512);
    let mut queue: Vec<(usize, usize)> = Vec::with_capacity(512);
    let mut poly: Vec<Vec3> = Vec::with_capacity(nvp);

    for polygon in 0..poly_mesh.polygon_count() {
        if let Some(deadline) = detail_settings.deadline {
            if started.elapsed() > deadline {
                warn!(
                    "Detail mesh deadline exceeded at polygon {polygon}/{}; returning partial mesh.",
                    poly_mesh.polygon_count()
                );
                detail.timed_out = true;
                break;
            }
        }

        // Base polygon corners in tile space (world units relative to min_bound).
        poly.clear();
        for &vertex in poly_mesh.polygon_vertices(polygon) {
            if vertex == NULL_INDEX {
                break;
            }
            let v = poly_mesh.vertices[vertex as usize];
            poly.push(Vec3::new(
                v.x as f32 * cell_width,
                v.y as f32 * cell_height,
                v.z as f32 * cell_width,
            ));
        }

        let (min_x, max_x, min_z, max_z) = polygon_bounds[polygon];
        height_patch.min_x = min_x;
        height_patch.min_z = min_z;
        height_patch.width = max_x - min_x;
        height_patch.height = max_z - min_z;

        extract_height_data(
            compact,
            poly_mesh.regions[polygon],
            border,
            &poly,
            &mut height_patch,
            &mut queue,
        );

        let polygon_deadline = detail_settings.polygon_deadline.map(|budget| (Instant::now(), budget));
        build_poly_detail(
            &poly,
            &detail_settings,
            cell_width,
            cell_height,
            &height_patch,
            polygon_deadline,
            &mut verts,
            &mut hull,
            &mut triangles,
            &mut edges,
            &mut samples,
        );

        let vert_base = detail.vertices.len() as u32;
        let tri_base = detail.triangles.len() as u32;

        detail
            .vertices
            .extend(verts.iter().map(|vertex| *vertex + poly_mesh.min_bound));

        for triangle in triangles.iter() {
            let [a, b, c] = *triangle;
            detail.triangles.push([
                a as u8,
                b as u8,
                c as u8,
                triangle_flags(
                    verts[a as usize],
                    verts[b as usize],
                    verts[c as usize],
                    &poly,
                ),
            ]);
        }

        detail.meshes.push([
            vert_base,
            verts.len() as u32,
            tri_base,
            triangles.len() as u32,
        ]);
    }

    detail
}

/// Flood-fills the height patch with floor heights of the polygon's region, then grows
/// outwards so every patch cell ends up with some plausible height.
fn extract_height_data(
    compact: &CompactHeightfield,
    region: u16,
    border: i32,
    poly: &[Vec3],
    height_patch: &mut HeightPatch,
    queue: &mut Vec<(usize, usize)>,
) {
    queue.clear();
    height_patch.heights.truncate(0);
    height_patch.heights.resize(
        (height_patch.width * height_patch.height).max(0) as usize,
        UNSET_HEIGHT,
    );

    let width = compact.width as usize;

    let mut empty = true;
    for z in 0..height_patch.height {
        let cell_z = z + height_patch.min_z + border;
        for x in 0..height_patch.width {
            let cell_x = x + height_patch.min_x + border;
            let cell_index = cell_x as usize + cell_z as usize * width;

            for span_index in compact.cells[cell_index].spans() {
                if compact.spans[span_index].region != region {
                    continue;
                }

                height_patch.set_height(x, z, compact.spans[span_index].y);
                empty = false;

                // Spans on the region edge seed the outward growth.
                let border_span = (0..4).any(|dir| {
                    compact
                        .connected_span_index(cell_index, span_index, dir)
                        .is_some_and(|other| compact.spans[other].region != region)
                });
                if border_span {
                    queue.push((cell_index, span_index));
                }
                break;
            }
        }
    }

    // No spans of this region under the patch (vertex removal can strand a polygon);
    // seed from whatever spans sit closest to the polygon's corners.
    if empty {
        seed_patch_with_poly_center(compact, border, poly, height_patch, queue);
    }

    // Breadth-first growth outwards from the region; keeps memory bounded by
    // retracting the consumed queue head periodically.
    const RETRACT_SIZE: usize = 256;
    let mut head = 0;

    while head < queue.len() {
        let (cell_index, span_index) = queue[head];
        head += 1;
        if head >= RETRACT_SIZE {
            queue.drain(..RETRACT_SIZE);
            head = 0;
        }

        for dir in 0..4 {
            let Some(other_index) = compact.connected_span_index(cell_index, span_index, dir)
            else {
                continue;
            };
            let other_cell_index = get_neighbour_index(width, cell_index, dir);

            let x = (other_cell_index % width) as i32 - height_patch.min_x - border;
            let z = (other_cell_index / width) as i32 - height_patch.min_z - border;
            if x < 0 || z < 0 || x >= height_patch.width || z >= height_patch.height {
                continue;
            }
            if height_patch.height_at(x, z) != UNSET_HEIGHT {
                continue;
            }

            height_patch.set_height(x, z, compact.spans[other_index].y);
            queue.push((other_cell_index, other_index));
        }
    }
}

fn seed_patch_with_poly_center(
    compact: &CompactHeightfield,
    border: i32,
    poly: &[Vec3],
    height_patch: &mut HeightPatch,
    queue: &mut Vec<(usize, usize)>,
) {
    const OFFSETS: [(i32, i32); 9] = [
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

    let width = compact.width as usize;
    let cell_width = compact.cell_width;
    let cell_height = compact.cell_height;

    let mut start = None;
    let mut best_height_distance = u16::MAX;

    for vertex in poly {
        let vertex_x = (vertex.x / cell_width) as i32;
        let vertex_y = (vertex.y / cell_height) as u16;
        let vertex_z = (vertex.z / cell_width) as i32;

        for (offset_x, offset_z) in OFFSETS {
            let x = vertex_x + offset_x;
            let z = vertex_z + offset_z;
            if x < height_patch.min_x
                || x >= height_patch.min_x + height_patch.width
                || z < height_patch.min_z
                || z >= height_patch.min_z + height_patch.height
            {
                continue;
            }

            let cell_index = (x + border) as usize + (z + border) as usize * width;
            for span_index in compact.cells[cell_index].spans() {
                let height_distance = vertex_y.abs_diff(compact.spans[span_index].y);
                if height_distance < best_height_distance {
                    start = Some((cell_index, span_index));
                    best_height_distance = height_distance;
                }
            }

            if best_height_distance == 0 {
                break;
            }
        }

        if best_height_distance == 0 {
            break;
        }
    }

    let Some((cell_index, span_index)) = start else {
        return;
    };

    // Record the seed height so the growth loop has something to extend.
    let x = (cell_index % width) as i32 - border - height_patch.min_x;
    let z = (cell_index / width) as i32 - border - height_patch.min_z;
    if x >= 0 && z >= 0 && x < height_patch.width && z < height_patch.height {
        height_patch.set_height(x, z, compact.spans[span_index].y);
    }

    queue.clear();
    queue.push((cell_index, span_index));
}

/// Builds one polygon's detail triangulation into `verts` & `triangles` (tile-space
/// coordinates).
#[allow(clippy::too_many_arguments)]
fn build_poly_detail(
    poly: &[Vec3],
    detail_settings: &DetailMeshSettings,
    cell_width: f32,
    cell_height: f32,
    height_patch: &HeightPatch,
    polygon_deadline: Option<(Instant, std::time::Duration)>,
    verts: &mut Vec<Vec3>,
    hull: &mut Vec<usize>,
    triangles: &mut Vec<[u32; 3]>,
    edges: &mut Vec<DetailEdge>,
    samples: &mut Vec<Vec3>,
) {
    let sample_distance = detail_settings.sample_distance;
    let sample_max_error = detail_settings.max_sample_error;

    verts.clear();
    verts.extend_from_slice(poly);
    hull.clear();
    triangles.clear();
    edges.clear();
    samples.clear();

    let mut edge_buffer = [Vec3::ZERO; MAX_VERTS_PER_EDGE + 1];

    let min_extent = poly_min_extent(verts);

    // Tessellate the polygon outline & pull each sample down to the sampled surface.
    if sample_distance > 0.0 {
        for i in 0..poly.len() {
            let j = (i + poly.len() - 1) % poly.len();
            let mut vertex_j = poly[j];
            let mut vertex_i = poly[i];
            let mut swapped = false;

            // Walk edges in lexicographic order so both sides of a shared edge sample
            // identically.
            if (vertex_j.x - vertex_i.x).abs() < 1e-6 {
                if vertex_j.z > vertex_i.z {
                    std::mem::swap(&mut vertex_j, &mut vertex_i);
                    swapped = true;
                }
            } else if vertex_j.x > vertex_i.x {
                std::mem::swap(&mut vertex_j, &mut vertex_i);
                swapped = true;
            }

            let delta = vertex_i - vertex_j;
            let edge_length = (delta.x * delta.x + delta.z * delta.z).sqrt();
            let mut sample_count =
                ((edge_length / sample_distance).floor() as usize + 1).min(MAX_VERTS_PER_EDGE - 1);
            if verts.len() + sample_count >= MAX_VERTS {
                sample_count = (MAX_VERTS - 1).saturating_sub(verts.len());
            }

            for k in 0..=sample_count {
                let t = k as f32 / sample_count.max(1) as f32;
                let mut position = vertex_j.lerp(vertex_i, t);
                position.y = get_height(
                    position.x,
                    position.y,
                    position.z,
                    cell_width,
                    cell_height,
                    height_patch,
                ) as f32
                    * cell_height;
                edge_buffer[k] = position;
            }

            // Simplify the sampled edge: keep only samples deviating more than the
            // error threshold.
            let mut kept = vec![0usize, sample_count];
            let mut k = 0;
            while k < kept.len() - 1 {
                let a = kept[k];
                let b = kept[k + 1];

                let mut max_deviation = 0.0f32;
                let mut max_index = None;
                for m in a + 1..b {
                    let deviation =
                        distance_sq_point_segment(edge_buffer[m], edge_buffer[a], edge_buffer[b]);
                    if deviation > max_deviation {
                        max_deviation = deviation;
                        max_index = Some(m);
                    }
                }

                if let Some(max_index) = max_index {
                    if max_deviation > sample_max_error * sample_max_error {
                        kept.insert(k + 1, max_index);
                        continue;
                    }
                }
                k += 1;
            }

            hull.push(j);

            // Interior edge samples join the hull between the corners.
            if swapped {
                for &k in kept.iter().rev().skip(1).take(kept.len() - 2) {
                    verts.push(edge_buffer[k]);
                    hull.push(verts.len() - 1);
                }
            } else {
                for &k in kept.iter().skip(1).take(kept.len() - 2) {
                    verts.push(edge_buffer[k]);
                    hull.push(verts.len() - 1);
                }
            }
        }
    } else {
        hull.extend(0..poly.len());
    }

    triangulate_hull(verts, hull, poly.len(), triangles);

    // Thin polygons get no interior samples; the hull triangulation is already as good
    // as it gets.
    if min_extent < sample_distance * 2.0 || triangles.is_empty() {
        return;
    }

    // Interior sampling: lay a grid of candidate samples over the polygon, then
    // greedily insert whichever is furthest from the current triangulation.
    if sample_distance > 0.0 {
        let mut min_bound = poly[0];
        let mut max_bound = poly[0];
        for vertex in poly.iter().skip(1) {
            min_bound = min_bound.min(*vertex);
            max_bound = max_bound.max(*vertex);
        }
        let mid_y = (min_bound.y + max_bound.y) * 0.5;

        let x0 = (min_bound.x / sample_distance).floor() as i32;
        let x1 = (max_bound.x / sample_distance).ceil() as i32;
        let z0 = (min_bound.z / sample_distance).floor() as i32;
        let z1 = (max_bound.z / sample_distance).ceil() as i32;

        for z in z0..z1 {
            for x in x0..x1 {
                let point = Vec3::new(
                    x as f32 * sample_distance,
                    mid_y,
                    z as f32 * sample_distance,
                );

                // Keep samples clear of the polygon edges; those are handled by the
                // edge tessellation.
                if distance_to_poly(poly, point) > -sample_distance / 2.0 {
                    continue;
                }

                let y = get_height(
                    point.x,
                    point.y,
                    point.z,
                    cell_width,
                    cell_height,
                    height_patch,
                ) as f32
                    * cell_height;
                samples.push(point.with_y(y));
            }
        }

        if samples.is_empty() {
            // At least sample the centre so big flat polygons still get one probe.
            let centre = poly.iter().sum::<Vec3>() / poly.len() as f32;
            let y = get_height(
                centre.x,
                centre.y,
                centre.z,
                cell_width,
                cell_height,
                height_patch,
            ) as f32
                * cell_height;
            samples.push(centre.with_y(y));
        }

        let sample_count = samples.len();
        for _ in 0..sample_count {
            if verts.len() >= MAX_VERTS {
                break;
            }
            if let Some((started, budget)) = polygon_deadline {
                if started.elapsed() > budget {
                    warn!("Per-polygon detail deadline exceeded; keeping the current triangulation.");
                    break;
                }
            }

            // Find the sample with the largest vertical error against the current mesh.
            let mut best_point = Vec3::ZERO;
            let mut best_distance = 0.0f32;
            let mut best_index = None;
            for (index, sample) in samples.iter().enumerate() {
                let Some(distance) = distance_to_triangle_mesh(*sample, verts, triangles) else {
                    continue;
                };
                if distance > best_distance {
                    best_distance = distance;
                    best_index = Some(index);
                    best_point = *sample;
                }
            }

            let Some(best_index) = best_index else {
                break;
            };
            if best_distance <= sample_max_error {
                break;
            }

            samples.swap_remove(best_index);
            verts.push(best_point);

            edges.clear();
            triangles.clear();
            delaunay_hull(verts, hull, triangles, edges);
        }
    }

    if triangles.is_empty() {
        triangulate_hull(verts, hull, poly.len(), triangles);
    }
}

/// Height lookup with a spiral fallback search for patch cells the flood fill missed.
fn get_height(
    fx: f32,
    fy: f32,
    fz: f32,
    cell_width: f32,
    cell_height: f32,
    height_patch: &HeightPatch,
) -> u16 {
    let ix = ((fx / cell_width + 0.01).floor() as i32 - height_patch.min_x)
        .clamp(0, (height_patch.width - 1).max(0));
    let iz = ((fz / cell_width + 0.01).floor() as i32 - height_patch.min_z)
        .clamp(0, (height_patch.height - 1).max(0));

    let mut height = height_patch.height_at(ix, iz);
    if height != UNSET_HEIGHT {
        return height;
    }

    // Spiral outwards from the cell until valid height data turns up.
    let radius = 2i32;
    let mut x = 1;
    let mut z = 0;
    let mut dx = 1;
    let mut dz = 0;
    let max_size = radius * 2 + 1;
    let max_iterations = max_size * max_size - 1;

    let mut next_ring_start = 8;
    let mut next_ring_iterations = 16;

    let target_y = (fy / cell_height) as u32;
    let mut best_distance = u32::MAX;
    for i in 0..max_iterations {
        let nx = ix + x;
        let nz = iz + z;

        if nx >= 0 && nz >= 0 && nx < height_patch.width && nz < height_patch.height {
            let candidate = height_patch.height_at(nx, nz);
            if candidate != UNSET_HEIGHT {
                let distance = (candidate as u32).abs_diff(target_y);
                if distance < best_distance {
                    height = candidate;
                    best_distance = distance;
                }
            }
        }

        // Entering the next ring with any hit at all ends the search.
        if i + 1 == next_ring_start {
            if height != UNSET_HEIGHT {
                break;
            }
            next_ring_start += next_ring_iterations;
            next_ring_iterations += 8;
        }

        if x == z || (x < 0 && x == -z) || (x > 0 && x == 1 - z) {
            std::mem::swap(&mut dx, &mut dz);
            dx = -dx;
        }
        x += dx;
        z += dz;
    }

    if height == UNSET_HEIGHT {
        0
    } else {
        height
    }
}

fn prev_index(i: usize, len: usize) -> usize {
    (i + len - 1) % len
}

fn next_index(i: usize, len: usize) -> usize {
    (i + 1) % len
}

/// Fans the hull into triangles starting from the ear with the shortest perimeter,
/// then advancing along whichever side adds the shorter new edge.
fn triangulate_hull(
    verts: &[Vec3],
    hull: &[usize],
    base_vertex_count: usize,
    triangles: &mut Vec<[u32; 3]>,
) {
    if hull.len() < 3 {
        return;
    }

    let ear_perimeter = |corner: usize| {
        let previous = verts[hull[prev_index(corner, hull.len())]].xz();
        let middle = verts[hull[corner]].xz();
        let next = verts[hull[next_index(corner, hull.len())]].xz();
        previous.distance(middle) + middle.distance(next) + next.distance(previous)
    };

    // Start from the cheapest ear sitting on an original corner; pure edge samples
    // never open the fan.
    let start = (0..hull.len())
        .filter(|&corner| hull[corner] < base_vertex_count)
        .map(|corner| (corner, ear_perimeter(corner)))
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(corner, _)| corner)
        .unwrap_or(0);

    let mut left = next_index(start, hull.len());
    let mut right = prev_index(start, hull.len());
    triangles.push([hull[start] as u32, hull[left] as u32, hull[right] as u32]);

    // Close in from both ends, always spending the cheaper of the two candidate edges.
    while next_index(left, hull.len()) != right {
        let advance_left = next_index(left, hull.len());
        let advance_right = prev_index(right, hull.len());

        let left_vertex = verts[hull[left]].xz();
        let right_vertex = verts[hull[right]].xz();
        let left_cost = left_vertex.distance(verts[hull[advance_left]].xz())
            + verts[hull[advance_left]].xz().distance(right_vertex);
        let right_cost = right_vertex.distance(verts[hull[advance_right]].xz())
            + left_vertex.distance(verts[hull[advance_right]].xz());

        if left_cost < right_cost {
            triangles.push([hull[left] as u32, hull[advance_left] as u32, hull[right] as u32]);
            left = advance_left;
        } else {
            triangles.push([hull[left] as u32, hull[advance_right] as u32, hull[right] as u32]);
            right = advance_right;
        }
    }
}

/// Squared distance from `point` to the segment `a-b`.
fn distance_sq_point_segment(point: Vec3, a: Vec3, b: Vec3) -> f32 {
    let ab = b - a;
    let length_sq = ab.length_squared();
    let t = if length_sq > 0.0 {
        ((point - a).dot(ab) / length_sq).clamp(0.0, 1.0)
    } else {
        0.0
    };
    a.lerp(b, t).distance_squared(point)
}

/// Squared distance from `point` to the segment `a-b`, everything on the XZ-plane.
fn distance_sq_point_segment_2d(point: Vec2, a: Vec2, b: Vec2) -> f32 {
    let ab = b - a;
    let length_sq = ab.length_squared();
    let t = if length_sq > 0.0 {
        ((point - a).dot(ab) / length_sq).clamp(0.0, 1.0)
    } else {
        0.0
    };
    a.lerp(b, t).distance_squared(point)
}

/// Signed squared distance to the polygon boundary on the XZ-plane; negative inside
/// (even-odd rule).
fn distance_to_poly(poly: &[Vec3], point: Vec3) -> f32 {
    let point = point.xz();
    let mut inside = false;
    let mut boundary_sq = f32::MAX;

    for i in 0..poly.len() {
        let current = poly[i].xz();
        let previous = poly[(i + poly.len() - 1) % poly.len()].xz();

        // Count boundary crossings of a ray running towards +x from the point.
        if (current.y > point.y) != (previous.y > point.y) {
            let crossing_x = current.x
                + (point.y - current.y) * (previous.x - current.x) / (previous.y - current.y);
            if point.x < crossing_x {
                inside = !inside;
            }
        }

        boundary_sq = boundary_sq.min(distance_sq_point_segment_2d(point, previous, current));
    }

    if inside {
        -boundary_sq
    } else {
        boundary_sq
    }
}

/// Vertical distance from `point` to the triangle covering it in XZ, if any.
fn vertical_distance_to_triangle(point: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    let to_c = (c - a).xz();
    let to_b = (b - a).xz();
    let to_point = (point - a).xz();

    // Barycentric coordinates of the XZ projection.
    let cc = to_c.length_squared();
    let bb = to_b.length_squared();
    let bc = to_c.dot(to_b);
    let pc = to_c.dot(to_point);
    let pb = to_b.dot(to_point);

    let denom = cc * bb - bc * bc;
    if denom.abs() < f32::EPSILON {
        return None;
    }
    let u = (bb * pc - bc * pb) / denom;
    let v = (cc * pb - bc * pc) / denom;

    const EPS: f32 = 1e-4;
    (u >= -EPS && v >= -EPS && u + v <= 1.0 + EPS).then(|| {
        let height = a.y + u * (c.y - a.y) + v * (b.y - a.y);
        (height - point.y).abs()
    })
}

fn distance_to_triangle_mesh(point: Vec3, verts: &[Vec3], triangles: &[[u32; 3]]) -> Option<f32> {
    triangles
        .iter()
        .filter_map(|[a, b, c]| {
            vertical_distance_to_triangle(
                point,
                verts[*a as usize],
                verts[*b as usize],
                verts[*c as usize],
            )
        })
        .min_by(|a, b| a.total_cmp(b))
}

/// Marker for a [DetailEdge] side that has no face yet.
const NO_FACE: u32 = u32::MAX;

/// One edge of the incremental triangulation, with the face on each side of
/// `from -> to`.
#[derive(Clone, Copy)]
struct DetailEdge {
    from: u32,
    to: u32,
    left: u32,
    right: u32,
}

/// The growing edge set of one polygon's Delaunay pass. Capped so degenerate input
/// cannot balloon it.
struct EdgeTable<'a> {
    edges: &'a mut Vec<DetailEdge>,
    capacity: usize,
}

impl EdgeTable<'_> {
    fn find(&self, a: u32, b: u32) -> Option<usize> {
        self.edges
            .iter()
            .position(|edge| (edge.from == a && edge.to == b) || (edge.from == b && edge.to == a))
    }

    fn add(&mut self, from: u32, to: u32, left: u32) {
        if self.edges.len() >= self.capacity {
            warn!(
                "Detail triangulation ran out of edge slots ({}/{}).",
                self.edges.len(),
                self.capacity
            );
            return;
        }
        if self.find(from, to).is_none() {
            self.edges.push(DetailEdge {
                from,
                to,
                left,
                right: NO_FACE,
            });
        }
    }

    /// Wires `face` onto whichever side of `edges[index]` the direction `from -> to`
    /// names, if that side is still open.
    fn attach(&mut self, index: usize, from: u32, to: u32, face: u32) {
        let edge = &mut self.edges[index];
        if edge.from == from && edge.to == to && edge.left == NO_FACE {
            edge.left = face;
        } else if edge.from == to && edge.to == from && edge.right == NO_FACE {
            edge.right = face;
        }
    }

    fn attach_or_add(&mut self, from: u32, to: u32, face: u32) {
        match self.find(from, to) {
            Some(index) => self.attach(index, from, to, face),
            None => self.add(from, to, face),
        }
    }

    /// Whether segment `a-b` would cross any unrelated edge already in the table.
    fn crosses_existing_edge(&self, vertices: &[Vec3], a: u32, b: u32) -> bool {
        self.edges.iter().any(|edge| {
            if edge.from == a || edge.from == b || edge.to == a || edge.to == b {
                return false;
            }
            segments_cross_2d(
                vertices[edge.from as usize],
                vertices[edge.to as usize],
                vertices[a as usize],
                vertices[b as usize],
            )
        })
    }
}

/// Incremental Delaunay triangulation of the hull + inserted interior vertices.
fn delaunay_hull(
    vertices: &[Vec3],
    hull: &[usize],
    triangles: &mut Vec<[u32; 3]>,
    edges: &mut Vec<DetailEdge>,
) {
    edges.clear();
    let mut table = EdgeTable {
        capacity: vertices.len() * 10,
        edges,
    };

    for i in 0..hull.len() {
        let j = prev_index(i, hull.len());
        table.add(hull[j] as u32, hull[i] as u32, NO_FACE);
    }

    // Every edge wants a face on each open side; edges added while completing facets
    // queue up behind the cursor and get their turn.
    let mut face_count = 0usize;
    let mut cursor = 0;
    while cursor < table.edges.len() {
        if table.edges[cursor].left == NO_FACE {
            complete_facet(vertices, &mut table, &mut face_count, cursor);
        }
        if table.edges[cursor].right == NO_FACE {
            complete_facet(vertices, &mut table, &mut face_count, cursor);
        }
        cursor += 1;
    }

    // Assemble the faces back out of the edge table.
    triangles.clear();
    triangles.resize(face_count, [u32::MAX; 3]);
    for edge in table.edges.iter() {
        if edge.right != NO_FACE {
            grow_face(&mut triangles[edge.right as usize], edge.from, edge.to);
        }
        if edge.left != NO_FACE {
            grow_face(&mut triangles[edge.left as usize], edge.to, edge.from);
        }
    }

    triangles.retain(|triangle| {
        let dangling =
            triangle[0] == u32::MAX || triangle[1] == u32::MAX || triangle[2] == u32::MAX;
        if dangling {
            warn!("Dangling face removed from detail Delaunay triangulation.");
        }
        !dangling
    });
}

/// Feeds one directed edge into a face's vertex triple.
fn grow_face(triangle: &mut [u32; 3], from: u32, to: u32) {
    if triangle[0] == u32::MAX {
        triangle[0] = from;
        triangle[1] = to;
    } else if triangle[0] == to {
        triangle[2] = from;
    } else if triangle[1] == from {
        triangle[2] = to;
    }
}

/// Grows one triangle onto the open side of `edges[edge_index]`: picks the point left
/// of the directed edge with the smallest circumcircle, then wires the two new edges
/// into the table.
fn complete_facet(
    vertices: &[Vec3],
    table: &mut EdgeTable,
    face_count: &mut usize,
    edge_index: usize,
) {
    const EPS: f32 = 1e-5;
    const TOLERANCE: f32 = 0.001;

    let edge = table.edges[edge_index];
    let (s, t) = if edge.left == NO_FACE {
        (edge.from, edge.to)
    } else if edge.right == NO_FACE {
        (edge.to, edge.from)
    } else {
        return;
    };

    let mut best: Option<(usize, Vec3, f32)> = None;
    for candidate in 0..vertices.len() {
        if candidate == s as usize || candidate == t as usize {
            continue;
        }
        if cross_2d(vertices[s as usize], vertices[t as usize], vertices[candidate]) <= EPS {
            continue;
        }

        if let Some((_, centre, radius)) = best {
            let distance = centre.xz().distance(vertices[candidate].xz());
            if distance > radius * (1.0 + TOLERANCE) {
                // Outside the current circumcircle.
                continue;
            }
            if distance >= radius * (1.0 - TOLERANCE) {
                // Inside the epsilon band; only accept when the new edges stay clean.
                if table.crosses_existing_edge(vertices, s, candidate as u32)
                    || table.crosses_existing_edge(vertices, t, candidate as u32)
                {
                    continue;
                }
            }
        }

        if let Some((centre, radius)) = circum_circle(
            vertices[s as usize],
            vertices[t as usize],
            vertices[candidate],
        ) {
            best = Some((candidate, centre, radius));
        }
    }

    // No point on this side: the edge lies on the hull.
    let Some((point, _, _)) = best else {
        return;
    };
    let point = point as u32;

    let face = *face_count as u32;
    *face_count += 1;

    table.attach(edge_index, s, t, face);
    table.attach_or_add(point, s, face);
    table.attach_or_add(t, point, face);
}

/// Circumcentre & radius of a triangle on the XZ-plane, when it has any area.
fn circum_circle(p1: Vec3, p2: Vec3, p3: Vec3) -> Option<(Vec3, f32)> {
    const EPS: f32 = 1e-6;

    // Work relative to p1 to dodge precision loss on large coordinates.
    let b = (p2 - p1).xz();
    let c = (p3 - p1).xz();

    let doubled_area = b.perp_dot(c);
    if doubled_area.abs() <= EPS {
        return None;
    }

    let centre = Vec2::new(
        c.y * b.length_squared() - b.y * c.length_squared(),
        b.x * c.length_squared() - c.x * b.length_squared(),
    ) / (2.0 * doubled_area);

    Some((p1 + Vec3::new(centre.x, 0.0, centre.y), centre.length()))
}

/// Strict proper-crossing test for two segments on the XZ-plane.
fn segments_cross_2d(a: Vec3, b: Vec3, c: Vec3, d: Vec3) -> bool {
    let a1 = cross_2d(a, b, d);
    let a2 = cross_2d(a, b, c);
    if a1 * a2 >= 0.0 {
        return false;
    }
    let a3 = cross_2d(c, d, a);
    let a4 = a3 + a2 - a1;
    a3 * a4 < 0.0
}

/// Cross product on the XZ-plane: positive when `b` is counter-clockwise of `a` around
/// `origin`.
fn cross_2d(origin: Vec3, a: Vec3, b: Vec3) -> f32 {
    (a - origin).xz().perp_dot((b - origin).xz())
}

/// Smallest height of the polygon seen as a 2-D shape: the smallest over all edges of
/// the largest vertex distance to that edge. Thin slivers get no interior sampling.
fn poly_min_extent(vertices: &[Vec3]) -> f32 {
    let clearance_of_edge = |i: usize| {
        let next = (i + 1) % vertices.len();
        vertices
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i && *j != next)
            .map(|(_, vertex)| {
                distance_sq_point_segment_2d(vertex.xz(), vertices[i].xz(), vertices[next].xz())
            })
            .fold(0.0f32, f32::max)
    };

    (0..vertices.len())
        .map(clearance_of_edge)
        .fold(f32::MAX, f32::min)
        .sqrt()
}

/// Packs the three per-edge boundary flags for one detail triangle.
fn triangle_flags(a: Vec3, b: Vec3, c: Vec3, poly: &[Vec3]) -> u8 {
    let mut flags = 0u8;
    flags |= edge_boundary_flag(a, b, poly);
    flags |= edge_boundary_flag(b, c, poly) << 2;
    flags |= edge_boundary_flag(c, a, poly) << 4;
    flags
}

/// [DETAIL_EDGE_BOUNDARY] when segment `a-b` lies on one of the polygon's hull edges.
fn edge_boundary_flag(a: Vec3, b: Vec3, poly: &[Vec3]) -> u8 {
    const THRESHOLD_SQ: f32 = 0.001 * 0.001;

    for i in 0..poly.len() {
        let j = (i + poly.len() - 1) % poly.len();
        if distance_sq_point_segment_2d(a.xz(), poly[j].xz(), poly[i].xz()) < THRESHOLD_SQ
            && distance_sq_point_segment_2d(b.xz(), poly[j].xz(), poly[i].xz()) < THRESHOLD_SQ
        {
            return DETAIL_EDGE_BOUNDARY;
        }
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compact::{build_compact_heightfield, build_distance_field};
    use crate::contour::build_contours;
    use crate::heightfields::{rasterize_triangles, Heightfield};
    use crate::mesher::build_poly_mesh;
    use crate::regions::build_regions;
    use crate::{TriangleIndices, WALKABLE_AREA};

    fn settings() -> NavMeshSettings {
        let mut settings = NavMeshSettings::from_agent(0.5, 1.8, 0.4);
        settings.cell_width = 1.0;
        settings.cell_height = 1.0;
        settings.walkable_height = 3;
        settings.step_height = 2;
        settings.min_region_area = 2;
        settings.merge_region_area = 100;
        settings.detail = Some(DetailMeshSettings {
            sample_distance: 2.0,
            max_sample_error: 0.5,
            deadline: None,
            polygon_deadline: None,
        });
        settings
    }

    fn bake(settings: &NavMeshSettings, side: f32) -> (PolyMesh, CompactHeightfield) {
        let mut heightfield =
            Heightfield::new(settings, Vec3::ZERO, Vec3::new(side, 10.0, side)).unwrap();
        let vertices = [
            Vec3::new(0.0, 2.0, 0.0),
            Vec3::new(side, 2.0, 0.0),
            Vec3::new(side, 2.0, side),
            Vec3::new(0.0, 2.0, side),
        ];
        let indices = [[0u32, 2, 1], [0, 3, 2]];
        rasterize_triangles(
            &mut heightfield,
            &vertices,
            TriangleIndices::U32(&indices),
            &[WALKABLE_AREA; 2],
            1,
        )
        .unwrap();

        let mut compact = build_compact_heightfield(settings, &heightfield);
        build_distance_field(&mut compact);
        build_regions(&mut compact, settings).unwrap();
        let contour_set = build_contours(&compact, settings);
        let poly_mesh = build_poly_mesh(&contour_set, settings).unwrap();
        (poly_mesh, compact)
    }

    #[test]
    fn every_polygon_gets_a_submesh() {
        let settings = settings();
        let (poly_mesh, compact) = bake(&settings, 8.0);

        let detail = build_poly_mesh_detail(&settings, &poly_mesh, &compact);

        assert!(!detail.timed_out);
        assert_eq!(detail.meshes.len(), poly_mesh.polygon_count());
        for [_, vert_count, _, tri_count] in detail.meshes.iter() {
            assert!(*vert_count >= 3);
            assert!(*tri_count >= 1);
        }
    }

    #[test]
    fn submesh_vertices_start_with_the_base_polygon() {
        let settings = settings();
        let (poly_mesh, compact) = bake(&settings, 8.0);

        let detail = build_poly_mesh_detail(&settings, &poly_mesh, &compact);

        for polygon in 0..poly_mesh.polygon_count() {
            let [vert_base, vert_count, _, _] = detail.meshes[polygon];
            let base_count = poly_mesh.polygon_vertex_count(polygon);
            assert!(vert_count as usize >= base_count);

            for (offset, &vertex) in poly_mesh.polygon_vertices(polygon)[..base_count]
                .iter()
                .enumerate()
            {
                let grid = poly_mesh.vertices[vertex as usize];
                let expected = poly_mesh.min_bound
                    + Vec3::new(
                        grid.x as f32 * poly_mesh.cell_width,
                        grid.y as f32 * poly_mesh.cell_height,
                        grid.z as f32 * poly_mesh.cell_width,
                    );
                let actual = detail.vertices[vert_base as usize + offset];
                assert!(
                    actual.xz().distance(expected.xz()) < 1e-3,
                    "polygon {polygon} vertex {offset}: {actual:?} vs {expected:?}"
                );
                // Heights may differ by sampling, but only within cell precision plus
                // the configured error.
                assert!((actual.y - expected.y).abs() <= poly_mesh.cell_height + 0.5);
            }
        }
    }

    #[test]
    fn triangle_indices_stay_local_and_in_range() {
        let settings = settings();
        let (poly_mesh, compact) = bake(&settings, 12.0);

        let detail = build_poly_mesh_detail(&settings, &poly_mesh, &compact);

        for [_, vert_count, tri_base, tri_count] in detail.meshes.iter() {
            for triangle in
                &detail.triangles[*tri_base as usize..(*tri_base + *tri_count) as usize]
            {
                for vertex in &triangle[..3] {
                    assert!((*vertex as u32) < *vert_count);
                }
            }
        }
    }

    #[test]
    fn flat_quad_boundary_edges_are_flagged() {
        let mut settings = settings();
        // No interior sampling: one quad, hull triangulation only.
        settings.detail = Some(DetailMeshSettings {
            sample_distance: 0.0,
            max_sample_error: 1.0,
            deadline: None,
            polygon_deadline: None,
        });
        let (poly_mesh, compact) = bake(&settings, 4.0);

        let detail = build_poly_mesh_detail(&settings, &poly_mesh, &compact);

        // Every triangle edge that lies on the quad hull carries the boundary flag;
        // the shared diagonal does not.
        let mut boundary = 0;
        let mut interior = 0;
        for [_, _, _, flags] in detail
            .triangles
            .iter()
            .map(|t| [t[0], t[1], t[2], t[3]])
        {
            for edge in 0..3 {
                if detail_edge_flags(flags, edge) & DETAIL_EDGE_BOUNDARY != 0 {
                    boundary += 1;
                } else {
                    interior += 1;
                }
            }
        }
        assert_eq!(boundary, 4);
        assert_eq!(interior, 2);
    }

    #[test]
    fn zero_deadline_returns_partial_mesh_with_flag() {
        let mut settings = settings();
        settings.detail = Some(DetailMeshSettings {
            sample_distance: 2.0,
            max_sample_error: 0.5,
            deadline: Some(std::time::Duration::ZERO),
            polygon_deadline: None,
        });
        let (poly_mesh, compact) = bake(&settings, 8.0);

        let detail = build_poly_mesh_detail(&settings, &poly_mesh, &compact);

        assert!(detail.timed_out);
        assert!(detail.meshes.len() < poly_mesh.polygon_count().max(1));
    }

    #[test]
    fn min_extent_of_a_thin_strip_is_its_width() {
        let strip = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(10.0, 0.0, 0.0),
            Vec3::new(10.0, 0.0, 1.0),
            Vec3::new(0.0, 0.0, 1.0),
        ];
        let extent = poly_min_extent(&strip);
        assert!((extent - 1.0).abs() < 1e-4);
    }

    #[test]
    fn hull_triangulation_covers_the_polygon() {
        let square = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 4.0),
            Vec3::new(4.0, 0.0, 4.0),
            Vec3::new(4.0, 0.0, 0.0),
        ];
        let hull = vec![0, 1, 2, 3];
        let mut triangles = Vec::new();
        triangulate_hull(&square, &hull, 4, &mut triangles);

        assert_eq!(triangles.len(), 2);
        let area: f32 = triangles
            .iter()
            .map(|[a, b, c]| {
                cross_2d(
                    square[*a as usize],
                    square[*b as usize],
                    square[*c as usize],
                )
                .abs()
                    / 2.0
            })
            .sum();
        assert!((area - 16.0).abs() < 1e-3);
    }
}
