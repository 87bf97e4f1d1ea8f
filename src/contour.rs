//! Contour tracing: turning region boundaries into simplified polylines.
//!
//! Every region's outer edge (and the edges of any holes punched through it) is walked
//! with the left-hand rule, producing a raw voxel-exact polyline. The raw outline is
//! then simplified with Douglas-Peucker, long outer edges are split, and hole outlines
//! are spliced into their owning region's outline so the mesher only ever sees simple
//! polygons.

use std::cmp::Ordering;

use bevy::log::warn;
use bevy::math::{IVec2, IVec4, Vec3};

use crate::{
    compact::CompactHeightfield,
    get_neighbour_index,
    math::{in_cone, intersect},
    NavMeshSettings, BORDER_REGION, FLAG_AREA_BORDER, FLAG_BORDER_VERTEX, MASK_CONTOUR_REGION,
};

const MAX_WALK_ITERATIONS: usize = 40_000;

/// The boundary polyline of one region. `vertices` is the simplified outline; each
/// vertex's `w` holds the neighbour region id plus [FLAG_BORDER_VERTEX] /
/// [FLAG_AREA_BORDER] bits. `raw_vertices` keeps the voxel-exact trace for debugging &
/// detail work.
#[derive(Default, Clone, Debug)]
pub struct Contour {
    pub vertices: Vec<IVec4>,
    pub raw_vertices: Vec<IVec4>,
    pub region: u16,
    pub area: u8,
}

/// All contours of a tile plus the grid metadata needed to interpret their coordinates.
#[derive(Default)]
pub struct ContourSet {
    pub contours: Vec<Contour>,
    pub min_bound: Vec3,
    pub max_bound: Vec3,
    pub cell_width: f32,
    pub cell_height: f32,
    pub width: i32,
    pub height: i32,
    pub border_size: u16,
    pub max_error: f32,
}

#[derive(Default, Clone)]
struct ContourHole {
    contour: Contour,
    min_x: i32,
    min_z: i32,
    left_most_vertex: usize,
}

#[derive(Default, Clone)]
struct ContourRegion {
    outline: Option<Contour>,
    holes: Vec<ContourHole>,
}

/// Traces and simplifies the boundary of every region in the compact heightfield.
pub fn build_contours(compact: &CompactHeightfield, settings: &NavMeshSettings) -> ContourSet {
    let border_size = compact.border_size as i32;
    let mut contour_set = ContourSet {
        contours: Vec::with_capacity(compact.max_region.max(8) as usize),
        min_bound: compact.min_bound,
        max_bound: compact.max_bound,
        cell_width: compact.cell_width,
        cell_height: compact.cell_height,
        width: compact.width - border_size * 2,
        height: compact.height - border_size * 2,
        border_size: compact.border_size,
        max_error: settings.max_contour_simplification_error,
    };

    // Mark boundary edges: bit per direction, set when the neighbour belongs to a
    // different region.
    let mut boundary_flags = vec![0u8; compact.span_count];
    for (cell_index, cell) in compact.cells.iter().enumerate() {
        for span_index in cell.spans() {
            let region = compact.spans[span_index].region;
            let mut connected_mask = 0u8;

            for dir in 0..4 {
                let mut other_region = 0;
                if let Some(other_index) = compact.connected_span_index(cell_index, span_index, dir)
                {
                    other_region = compact.spans[other_index].region;
                }
                if region == other_region {
                    connected_mask |= 1 << dir;
                }
            }

            // Flip so set bits mark unconnected sides.
            boundary_flags[span_index] = connected_mask ^ 0b1111;
        }
    }

    let mut raw_vertices = Vec::with_capacity(256);
    let mut simplified_vertices = Vec::with_capacity(64);

    for (cell_index, cell) in compact.cells.iter().enumerate() {
        for span_index in cell.spans() {
            if boundary_flags[span_index] == 0 || boundary_flags[span_index] == 0b1111 {
                // Interior spans and fully isolated spans never start a contour.
                boundary_flags[span_index] = 0;
                continue;
            }
            let region = compact.spans[span_index].region;
            if region == 0 || region & BORDER_REGION != 0 {
                boundary_flags[span_index] = 0;
                continue;
            }

            raw_vertices.clear();
            simplified_vertices.clear();

            walk_contour(
                compact,
                cell_index,
                span_index,
                &mut boundary_flags,
                &mut raw_vertices,
            );

            simplify_contour(
                &raw_vertices,
                &mut simplified_vertices,
                settings.max_contour_simplification_error,
                settings.max_edge_length,
            );

            remove_degenerate_segments(&mut simplified_vertices);

            if simplified_vertices.len() >= 3 {
                let mut contour = Contour {
                    vertices: simplified_vertices.clone(),
                    raw_vertices: raw_vertices.clone(),
                    region,
                    area: compact.areas[span_index],
                };

                // Shift out of the padded border frame into tile-local coordinates.
                if border_size > 0 {
                    for vertex in contour
                        .vertices
                        .iter_mut()
                        .chain(contour.raw_vertices.iter_mut())
                    {
                        vertex.x -= border_size;
                        vertex.z -= border_size;
                    }
                }

                contour_set.contours.push(contour);
            }
        }
    }

    merge_holes(&mut contour_set, compact.max_region);

    contour_set
}

/// Splices hole contours (negative winding) into their region's outline so each region
/// contributes exactly one simple polygon.
fn merge_holes(contour_set: &mut ContourSet, max_region: u16) {
    if contour_set.contours.is_empty() {
        return;
    }

    let has_holes = contour_set
        .contours
        .iter()
        .any(|contour| calc_area_of_polygon_2d(&contour.vertices) < 0);
    if !has_holes {
        return;
    }

    let mut regions = vec![ContourRegion::default(); max_region as usize + 1];
    for contour in contour_set.contours.drain(..) {
        let region = &mut regions[contour.region as usize];
        if calc_area_of_polygon_2d(&contour.vertices) < 0 {
            region.holes.push(ContourHole {
                min_x: contour.vertices[0].x,
                min_z: contour.vertices[0].z,
                left_most_vertex: 0,
                contour,
            });
        } else if region.outline.is_some() {
            warn!(
                "Region {} produced more than one outline; dropping the extra one.",
                contour.region
            );
        } else {
            region.outline = Some(contour);
        }
    }

    for region in regions.into_iter() {
        match (region.outline, region.holes.is_empty()) {
            (Some(mut outline), false) => {
                let mut holes = region.holes;
                merge_region_holes(&mut outline, &mut holes);
                contour_set.contours.push(outline);
            }
            (Some(outline), true) => contour_set.contours.push(outline),
            (None, false) => {
                warn!(
                    "Region {} has holes but no outline; holes dropped.",
                    region.holes[0].contour.region
                );
            }
            (None, true) => {}
        }
    }
}

#[derive(Default, Clone, Copy)]
struct PotentialDiagonal {
    vertex: usize,
    distance: i64,
}

fn merge_region_holes(outline: &mut Contour, holes: &mut [ContourHole]) {
    // Find each hole's left-most vertex; merging left to right keeps the spliced
    // diagonals from crossing each other.
    for hole in holes.iter_mut() {
        for (i, vertex) in hole.contour.vertices.iter().enumerate() {
            if vertex.x < hole.min_x || (vertex.x == hole.min_x && vertex.z < hole.min_z) {
                hole.min_x = vertex.x;
                hole.min_z = vertex.z;
                hole.left_most_vertex = i;
            }
        }
    }

    holes.sort_by(|a, b| match a.min_x.cmp(&b.min_x) {
        Ordering::Equal => a.min_z.cmp(&b.min_z),
        ordering => ordering,
    });

    let max_vertices = outline.vertices.len()
        + holes
            .iter()
            .fold(0, |total, hole| total + hole.contour.vertices.len());
    let mut diagonals = Vec::with_capacity(max_vertices);

    for hole_index in 0..holes.len() {
        let hole = &holes[hole_index];

        let mut connection = None;
        let mut best_vertex = hole.left_most_vertex;

        for _ in 0..hole.contour.vertices.len() {
            // Collect candidate diagonals from the hole corner to the outline, closest
            // first.
            diagonals.clear();
            let corner_vertex = hole.contour.vertices[best_vertex];
            for i in 0..outline.vertices.len() {
                if in_cone(i, &outline.vertices, corner_vertex) {
                    let delta_x = (outline.vertices[i].x - corner_vertex.x) as i64;
                    let delta_z = (outline.vertices[i].z - corner_vertex.z) as i64;
                    diagonals.push(PotentialDiagonal {
                        vertex: i,
                        distance: delta_x * delta_x + delta_z * delta_z,
                    });
                }
            }
            diagonals.sort_by(|a, b| a.distance.cmp(&b.distance));

            connection = None;
            for diagonal in diagonals.iter() {
                let vertex = outline.vertices[diagonal.vertex];
                let mut intersects = intersect_segment_contour(
                    vertex,
                    corner_vertex,
                    diagonal.vertex,
                    &outline.vertices,
                );

                // The diagonal must clear the remaining holes too.
                for other_hole in holes.iter().skip(hole_index) {
                    intersects |= intersect_segment_contour_no_vertex(
                        vertex,
                        corner_vertex,
                        &other_hole.contour.vertices,
                    );
                    if intersects {
                        break;
                    }
                }

                if !intersects {
                    connection = Some(diagonal.vertex);
                    break;
                }
            }

            if connection.is_some() {
                break;
            }

            best_vertex = (best_vertex + 1) % hole.contour.vertices.len();
        }

        let Some(connection) = connection else {
            warn!(
                "Failed to find a merge point for a hole in region {}; hole dropped.",
                outline.region
            );
            continue;
        };

        merge_contours(outline, &holes[hole_index].contour, connection, best_vertex);
    }
}

/// Splices `source` into `target` through the diagonal `(index_a, index_b)`, keeping
/// both loops plus the doubled connecting edge.
fn merge_contours(target: &mut Contour, source: &Contour, index_a: usize, index_b: usize) {
    let mut vertices = Vec::with_capacity(target.vertices.len() + source.vertices.len() + 2);

    for i in 0..=target.vertices.len() {
        vertices.push(target.vertices[(index_a + i) % target.vertices.len()]);
    }
    for i in 0..=source.vertices.len() {
        vertices.push(source.vertices[(index_b + i) % source.vertices.len()]);
    }

    target.vertices = vertices;
}

fn calc_area_of_polygon_2d(vertices: &[IVec4]) -> i32 {
    let mut area = 0;
    for i in 0..vertices.len() {
        let previous = vertices[i];
        let next = vertices[(i + 1) % vertices.len()];

        area += next.x * previous.z - previous.x * next.z;
    }

    (area + 1) / 2
}

fn intersect_segment_contour(
    point: IVec4,
    corner: IVec4,
    diagonal_vertex: usize,
    outline_vertices: &[IVec4],
) -> bool {
    for i in 0..outline_vertices.len() {
        let next = (i + 1) % outline_vertices.len();
        if i == diagonal_vertex || next == diagonal_vertex {
            continue;
        }

        let point_i = outline_vertices[i];
        let point_next = outline_vertices[next];
        if (point.x == point_i.x && point.z == point_i.z)
            || (point_next.x == point_i.x && point_next.z == point_i.z)
            || (point_next.x == point.x && point_next.z == point.z)
        {
            continue;
        }

        if intersect(point, corner, point_i, point_next) {
            return true;
        }
    }

    false
}

fn intersect_segment_contour_no_vertex(
    point: IVec4,
    corner: IVec4,
    outline_vertices: &[IVec4],
) -> bool {
    for i in 0..outline_vertices.len() {
        let next = (i + 1) % outline_vertices.len();

        let point_i = outline_vertices[i];
        let point_next = outline_vertices[next];
        if (point.x == point_i.x && point.z == point_i.z)
            || (point_next.x == point_i.x && point_next.z == point_i.z)
            || (point_next.x == point.x && point_next.z == point.z)
        {
            continue;
        }

        if intersect(point, corner, point_i, point_next) {
            return true;
        }
    }

    false
}

/// Walks a span's boundary with the left-hand rule, emitting one raw vertex per corner.
fn walk_contour(
    compact: &CompactHeightfield,
    mut cell_index: usize,
    mut span_index: usize,
    boundary_flags: &mut [u8],
    contour: &mut Vec<IVec4>,
) {
    let mut dir = 0u8;
    while boundary_flags[span_index] & (1 << dir) == 0 {
        dir += 1;
    }
    let start_direction = dir;
    let start_span = span_index;
    let width = compact.width as usize;

    let mut iter = 0;
    loop {
        iter += 1;
        if iter > MAX_WALK_ITERATIONS {
            warn!("Contour walk failed to close at span {start_span}; contour abandoned.");
            return;
        }

        let row = cell_index / width;
        let column = cell_index % width;

        if boundary_flags[span_index] & (1 << dir) != 0 {
            // Open edge: emit the corner vertex and turn clockwise.
            let (height, is_border_vertex) =
                get_corner_height(compact, cell_index, span_index, dir as usize);

            let mut region_mask = 0i32;
            if let Some(other_index) =
                compact.connected_span_index(cell_index, span_index, dir as usize)
            {
                region_mask = compact.spans[other_index].region as i32;
                if compact.areas[other_index] != compact.areas[span_index] {
                    region_mask |= FLAG_AREA_BORDER;
                }
            }
            if is_border_vertex {
                region_mask |= FLAG_BORDER_VERTEX;
            }

            let px = match dir {
                1 | 2 => column + 1,
                _ => column,
            } as i32;
            let pz = match dir {
                0 | 1 => row + 1,
                _ => row,
            } as i32;
            contour.push(IVec4::new(px, height as i32, pz, region_mask));

            boundary_flags[span_index] &= !(1 << dir);
            dir = (dir + 1) & 0x3; // Rotate clock-wise.
        } else {
            // Connected edge: step into the neighbour and turn counter clock-wise.
            let Some(other_index) =
                compact.connected_span_index(cell_index, span_index, dir as usize)
            else {
                warn!("Incorrectly flagged boundary at span {span_index}; contour abandoned.");
                return;
            };

            span_index = other_index;
            cell_index = get_neighbour_index(width, cell_index, dir as usize);
            dir = (dir + 3) & 0x3; // Rotate COUNTER clock-wise.
        }

        if start_span == span_index && start_direction == dir {
            break;
        }
    }
}

/// Height of the corner a boundary vertex sits on: the maximum floor of the up-to-four
/// spans meeting there. Also reports whether the corner is a stitchable border vertex.
fn get_corner_height(
    compact: &CompactHeightfield,
    cell_index: usize,
    span_index: usize,
    dir: usize,
) -> (u16, bool) {
    let next_dir = (dir + 1) & 0x3;
    let width = compact.width as usize;

    let span = compact.spans[span_index];
    let mut height = span.y;

    // Region & area of each span meeting at the corner, for border-vertex detection.
    let mut corner_regions = [0u32; 4];
    corner_regions[0] = span.region as u32 | (compact.areas[span_index] as u32) << 16;

    if let Some(other_index) = compact.connected_span_index(cell_index, span_index, dir) {
        let other_cell_index = get_neighbour_index(width, cell_index, dir);
        height = height.max(compact.spans[other_index].y);
        corner_regions[1] =
            compact.spans[other_index].region as u32 | (compact.areas[other_index] as u32) << 16;

        if let Some(diagonal_index) =
            compact.connected_span_index(other_cell_index, other_index, next_dir)
        {
            height = height.max(compact.spans[diagonal_index].y);
            corner_regions[2] = compact.spans[diagonal_index].region as u32
                | (compact.areas[diagonal_index] as u32) << 16;
        }
    }

    if let Some(other_index) = compact.connected_span_index(cell_index, span_index, next_dir) {
        let other_cell_index = get_neighbour_index(width, cell_index, next_dir);
        height = height.max(compact.spans[other_index].y);
        corner_regions[3] =
            compact.spans[other_index].region as u32 | (compact.areas[other_index] as u32) << 16;

        if let Some(diagonal_index) =
            compact.connected_span_index(other_cell_index, other_index, dir)
        {
            height = height.max(compact.spans[diagonal_index].y);
            corner_regions[2] = compact.spans[diagonal_index].region as u32
                | (compact.areas[diagonal_index] as u32) << 16;
        }
    }

    // The vertex is a border vertex when two same exterior cells in a row are followed
    // by two interior cells of one area and none of the corner cells is missing.
    let border_flag = BORDER_REGION as u32;
    let mut is_border_vertex = false;
    for j in 0..4 {
        let a = j;
        let b = (j + 1) & 0x3;
        let c = (j + 2) & 0x3;
        let d = (j + 3) & 0x3;

        let two_same_exteriors = corner_regions[a] & corner_regions[b] & border_flag != 0
            && corner_regions[a] == corner_regions[b];
        let two_interiors = (corner_regions[c] | corner_regions[d]) & border_flag == 0;
        let interiors_same_area = corner_regions[c] >> 16 == corner_regions[d] >> 16;
        let no_missing_cells = corner_regions[a] != 0
            && corner_regions[b] != 0
            && corner_regions[c] != 0
            && corner_regions[d] != 0;

        if two_same_exteriors && two_interiors && interiors_same_area && no_missing_cells {
            is_border_vertex = true;
            break;
        }
    }

    (height, is_border_vertex)
}

fn simplify_contour(
    points: &[IVec4],
    simplified: &mut Vec<IVec4>,
    max_error: f32,
    max_edge_length: u16,
) {
    // Seed with vertices where the bordering region or area changes; they must survive
    // simplification so neighbouring contours stay stitched.
    let has_connections = points
        .iter()
        .any(|point| point.w & MASK_CONTOUR_REGION != 0);

    if has_connections {
        for i in 0..points.len() {
            let next = (i + 1) % points.len();
            let point = points[i];
            let next_point = points[next];

            let regions_differ =
                point.w & MASK_CONTOUR_REGION != next_point.w & MASK_CONTOUR_REGION;
            let areas_differ = point.w & FLAG_AREA_BORDER != next_point.w & FLAG_AREA_BORDER;
            if regions_differ || areas_differ {
                simplified.push(IVec4::new(point.x, point.y, point.z, i as i32));
            }
        }
    }

    if simplified.is_empty() {
        // Island without neighbours: seed with the lower-left & upper-right vertices.
        let mut lower_left = points[0];
        let mut lower_left_i = 0;
        let mut upper_right = points[0];
        let mut upper_right_i = 0;

        for (i, point) in points.iter().enumerate() {
            if point.x < lower_left.x || (point.x == lower_left.x && point.z < lower_left.z) {
                lower_left = *point;
                lower_left_i = i;
            }
            if point.x > upper_right.x || (point.x == upper_right.x && point.z > upper_right.z) {
                upper_right = *point;
                upper_right_i = i;
            }
        }

        simplified.push(IVec4::new(
            lower_left.x,
            lower_left.y,
            lower_left.z,
            lower_left_i as i32,
        ));
        simplified.push(IVec4::new(
            upper_right.x,
            upper_right.y,
            upper_right.z,
            upper_right_i as i32,
        ));
    }

    // Douglas-Peucker: push in the raw vertex furthest from each simplified edge until
    // every deviation is within tolerance. Only outer edges & area borders tessellate.
    let point_count = points.len();
    let max_error_sq = max_error * max_error;
    let mut i = 0;
    while i < simplified.len() {
        let next = (i + 1) % simplified.len();

        let mut a = simplified[i];
        let mut b = simplified[next];

        // Traverse the raw segment in lexicographic order so the result is independent
        // of edge direction.
        let (mut test_i, increment, end_i) = if b.x > a.x || (b.x == a.x && b.z > a.z) {
            let increment = 1;
            (
                (a.w as usize + increment) % point_count,
                increment,
                b.w as usize,
            )
        } else {
            let increment = point_count - 1;
            std::mem::swap(&mut a, &mut b);
            (
                (b.w as usize + increment) % point_count,
                increment,
                a.w as usize,
            )
        };

        let mut max_deviation = 0.0f32;
        let mut max_index = None;

        let tessellate = points[test_i].w & MASK_CONTOUR_REGION == 0
            || points[test_i].w & FLAG_AREA_BORDER != 0;
        if tessellate {
            while test_i != end_i {
                let deviation = point_distance_from_segment(
                    IVec2::new(points[test_i].x, points[test_i].z),
                    IVec2::new(a.x, a.z),
                    IVec2::new(b.x, b.z),
                );
                if deviation > max_deviation {
                    max_deviation = deviation;
                    max_index = Some(test_i);
                }
                test_i = (test_i + increment) % point_count;
            }
        }

        match max_index {
            Some(max_index) if max_deviation > max_error_sq => {
                simplified.insert(
                    i + 1,
                    IVec4::new(
                        points[max_index].x,
                        points[max_index].y,
                        points[max_index].z,
                        max_index as i32,
                    ),
                );
            }
            _ => {
                i += 1;
            }
        }
    }

    // Split outer edges longer than max_edge_length at their midpoint. Bounded so a
    // corrupt contour cannot split forever.
    if max_edge_length > 0 {
        let max_edge_length_sq = max_edge_length as i64 * max_edge_length as i64;
        let max_splits = point_count * 2;
        let mut splits = 0;

        let mut i = 0;
        while i < simplified.len() {
            let a = simplified[i];
            let b = simplified[(i + 1) % simplified.len()];

            let next_raw = (a.w as usize + 1) % point_count;
            let should_split = points[next_raw].w & MASK_CONTOUR_REGION == 0;

            let mut split_at = None;
            if should_split {
                let delta_x = (b.x - a.x) as i64;
                let delta_z = (b.z - a.z) as i64;

                if delta_x * delta_x + delta_z * delta_z > max_edge_length_sq {
                    let raw_span = if b.w < a.w {
                        b.w as i64 + point_count as i64 - a.w as i64
                    } else {
                        b.w as i64 - a.w as i64
                    };

                    if raw_span > 1 {
                        split_at = if b.x > a.x || (b.x == a.x && b.z > a.z) {
                            Some((a.w as usize + raw_span as usize / 2) % point_count)
                        } else {
                            Some((a.w as usize + (raw_span as usize + 1) / 2) % point_count)
                        };
                    }
                }
            }

            match split_at {
                Some(split_at) => {
                    splits += 1;
                    if splits > max_splits {
                        warn!("Edge splitting exceeded {max_splits} inserts; contour left as-is.");
                        break;
                    }
                    simplified.insert(
                        i + 1,
                        IVec4::new(
                            points[split_at].x,
                            points[split_at].y,
                            points[split_at].z,
                            split_at as i32,
                        ),
                    );
                }
                None => {
                    i += 1;
                }
            }
        }
    }

    // Swap the raw-index bookkeeping in w for the final vertex flags: the neighbour
    // region ahead of the vertex plus the border-vertex bit of the vertex itself.
    for point in simplified.iter_mut() {
        let next_raw = (point.w as usize + 1) % point_count;
        let current_raw = point.w as usize;
        point.w = (points[next_raw].w & (MASK_CONTOUR_REGION | FLAG_AREA_BORDER))
            | (points[current_raw].w & FLAG_BORDER_VERTEX);
    }
}

pub(crate) fn point_distance_from_segment(point: IVec2, seg_a: IVec2, seg_b: IVec2) -> f32 {
    let segment_delta = (seg_b - seg_a).as_vec2();
    let point_delta = (point - seg_a).as_vec2();

    let d = segment_delta.x * segment_delta.x + segment_delta.y * segment_delta.y;
    let mut t = segment_delta.x * point_delta.x + segment_delta.y * point_delta.y;
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);

    let delta_x = seg_a.x as f32 + t * segment_delta.x - point.x as f32;
    let delta_y = seg_a.y as f32 + t * segment_delta.y - point.y as f32;

    delta_x * delta_x + delta_y * delta_y
}

fn remove_degenerate_segments(simplified: &mut Vec<IVec4>) {
    // Remove adjacent vertices that are equal on the xz-plane.
    let mut i = 0;
    while i < simplified.len() {
        let next = (i + 1) % simplified.len();

        let a = simplified[i];
        let b = simplified[next];

        if a.x == b.x && a.z == b.z {
            simplified.remove(next);
        } else {
            i += 1;
        }
    }
}
