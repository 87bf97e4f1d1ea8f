//! The solid heightfield: a 2.5D voxelization of the input triangle soup.
//!
//! Each grid column holds a sorted, disjoint list of [Span]s marking occupied vertical
//! intervals. Spans live in an arena owned by the [Heightfield] and are addressed by
//! 32-bit indices; freed spans go onto an index free list so insertion-time merging stays
//! allocation-free.

use std::ops::Div;

use bevy::math::{IVec3, Vec3, Vec3A};
use thiserror::Error;

use crate::{NavMeshSettings, NULL_AREA, WALKABLE_AREA};

/// Highest vertical cell coordinate a span can reach; the span min/max fields are 13
/// bits wide.
pub const SPAN_MAX_HEIGHT: u16 = (1 << 13) - 1;

pub(crate) type SpanIndex = u32;
pub(crate) const SPAN_NULL: SpanIndex = SpanIndex::MAX;

const SPAN_AREA_MASK: u32 = 0x3f;
const SPANS_PER_PAGE: usize = 2048;

/// An occupied vertical interval `[smin, smax)` in one grid column, packed into one word:
/// 13 bits `smin`, 13 bits `smax`, 6 bits area id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    data: u32,
}

impl Span {
    fn new(smin: u16, smax: u16, area: u8) -> Self {
        let mut span = Span { data: 0 };
        span.set_smin(smin);
        span.set_smax(smax);
        span.set_area(area);
        span
    }

    #[inline]
    pub fn smin(&self) -> u16 {
        (self.data & SPAN_MAX_HEIGHT as u32) as u16
    }

    #[inline]
    pub fn smax(&self) -> u16 {
        ((self.data >> 13) & SPAN_MAX_HEIGHT as u32) as u16
    }

    #[inline]
    pub fn area(&self) -> u8 {
        (self.data >> 26) as u8
    }

    #[inline]
    pub(crate) fn set_smin(&mut self, smin: u16) {
        debug_assert!(smin <= SPAN_MAX_HEIGHT);
        self.data = (self.data & !(SPAN_MAX_HEIGHT as u32)) | smin as u32;
    }

    #[inline]
    pub(crate) fn set_smax(&mut self, smax: u16) {
        debug_assert!(smax <= SPAN_MAX_HEIGHT);
        self.data = (self.data & !((SPAN_MAX_HEIGHT as u32) << 13)) | ((smax as u32) << 13);
    }

    #[inline]
    pub(crate) fn set_area(&mut self, area: u8) {
        debug_assert!(area as u32 <= SPAN_AREA_MASK);
        self.data = (self.data & !(SPAN_AREA_MASK << 26)) | ((area as u32) << 26);
    }
}

#[derive(Clone, Copy)]
pub(crate) struct SpanSlot {
    pub(crate) span: Span,
    pub(crate) next: SpanIndex,
}

/// The triangle index buffer of the input soup, in whichever width the caller stores.
#[derive(Clone, Copy)]
pub enum TriangleIndices<'a> {
    U16(&'a [[u16; 3]]),
    U32(&'a [[u32; 3]]),
}

impl TriangleIndices<'_> {
    #[inline]
    pub fn triangle_count(&self) -> usize {
        match self {
            TriangleIndices::U16(indices) => indices.len(),
            TriangleIndices::U32(indices) => indices.len(),
        }
    }

    #[inline]
    pub(crate) fn triangle(&self, index: usize) -> [u32; 3] {
        match self {
            TriangleIndices::U16(indices) => indices[index].map(u32::from),
            TriangleIndices::U32(indices) => indices[index],
        }
    }
}

/// The rasterizer rejected its input. Nothing is mutated when this is returned.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RasterizationError {
    #[error("heightfield bounds are inverted: min {min:?} exceeds max {max:?}")]
    InvalidBounds { min: Vec3, max: Vec3 },
    #[error("column ({x}, {z}) lies outside the {width}x{height} grid")]
    ColumnOutOfBounds {
        x: i32,
        z: i32,
        width: i32,
        height: i32,
    },
    #[error("span interval is inverted: smin {smin} exceeds smax {smax}")]
    InvalidSpanRange { smin: u16, smax: u16 },
    #[error("triangle {triangle} references vertex {vertex} outside the vertex buffer of length {len}")]
    VertexOutOfBounds {
        triangle: usize,
        vertex: u32,
        len: usize,
    },
    #[error("triangle area id list holds {areas} entries for {triangles} triangles")]
    AreaCountMismatch { areas: usize, triangles: usize },
}

/// Per-column span lists over a uniform XZ grid, plus the arena the spans live in.
pub struct Heightfield {
    pub width: i32,
    pub height: i32,
    pub min_bound: Vec3,
    pub max_bound: Vec3,
    pub cell_width: f32,
    pub cell_height: f32,
    /// Head span index per column, `SPAN_NULL` for empty columns. Column index is
    /// `x + z * width`.
    columns: Box<[SpanIndex]>,
    slots: Vec<SpanSlot>,
    free_head: SpanIndex,
}

impl Heightfield {
    /// Creates an empty heightfield covering `min_bound..max_bound`, sized by the
    /// settings' cell dimensions.
    pub fn new(
        settings: &NavMeshSettings,
        min_bound: Vec3,
        max_bound: Vec3,
    ) -> Result<Self, RasterizationError> {
        if min_bound.cmpgt(max_bound).any() {
            return Err(RasterizationError::InvalidBounds {
                min: min_bound,
                max: max_bound,
            });
        }

        let width = ((max_bound.x - min_bound.x) / settings.cell_width).ceil() as i32;
        let height = ((max_bound.z - min_bound.z) / settings.cell_width).ceil() as i32;

        Ok(Self {
            width,
            height,
            min_bound,
            max_bound,
            cell_width: settings.cell_width,
            cell_height: settings.cell_height,
            columns: vec![SPAN_NULL; (width * height).max(0) as usize].into_boxed_slice(),
            slots: Vec::with_capacity(SPANS_PER_PAGE),
            free_head: SPAN_NULL,
        })
    }

    #[inline]
    pub(crate) fn column_head(&self, column_index: usize) -> SpanIndex {
        self.columns[column_index]
    }

    #[inline]
    pub(crate) fn slot(&self, index: SpanIndex) -> &SpanSlot {
        &self.slots[index as usize]
    }

    /// Iterates a column's spans from bottom to top.
    pub fn spans_in_column(&self, x: i32, z: i32) -> impl Iterator<Item = Span> + '_ {
        let mut current = self.columns[(x + z * self.width) as usize];
        std::iter::from_fn(move || {
            if current == SPAN_NULL {
                return None;
            }
            let slot = &self.slots[current as usize];
            current = slot.next;
            Some(slot.span)
        })
    }

    /// Total spans currently allocated across all columns.
    pub fn span_count(&self) -> usize {
        let mut count = 0;
        for &head in self.columns.iter() {
            let mut current = head;
            while current != SPAN_NULL {
                count += 1;
                current = self.slots[current as usize].next;
            }
        }
        count
    }

    /// Spans whose area survived filtering; this is the number of spans the compact
    /// heightfield will hold.
    pub fn walkable_span_count(&self) -> usize {
        let mut count = 0;
        for &head in self.columns.iter() {
            let mut current = head;
            while current != SPAN_NULL {
                let slot = &self.slots[current as usize];
                if slot.span.area() != NULL_AREA {
                    count += 1;
                }
                current = slot.next;
            }
        }
        count
    }

    fn allocate_span(&mut self, span: Span, next: SpanIndex) -> SpanIndex {
        if self.free_head != SPAN_NULL {
            let index = self.free_head;
            self.free_head = self.slots[index as usize].next;
            self.slots[index as usize] = SpanSlot { span, next };
            return index;
        }

        // Grow the arena a page at a time so steady rasterization does not reallocate
        // per span.
        if self.slots.len() == self.slots.capacity() {
            self.slots.reserve(SPANS_PER_PAGE);
        }
        self.slots.push(SpanSlot { span, next });
        (self.slots.len() - 1) as SpanIndex
    }

    fn free_span(&mut self, index: SpanIndex) {
        self.slots[index as usize].next = self.free_head;
        self.free_head = index;
    }

    /// Inserts a span into its column, merging with every overlapping or touching span.
    ///
    /// When the merged tops are within `flag_merge_threshold` cells the higher area id
    /// wins, so a thin walkable step fused into a thicker obstacle keeps its
    /// classification.
    pub fn add_span(
        &mut self,
        x: i32,
        z: i32,
        smin: u16,
        smax: u16,
        area: u8,
        flag_merge_threshold: u16,
    ) -> Result<(), RasterizationError> {
        if x < 0 || z < 0 || x >= self.width || z >= self.height {
            return Err(RasterizationError::ColumnOutOfBounds {
                x,
                z,
                width: self.width,
                height: self.height,
            });
        }
        if smin > smax {
            return Err(RasterizationError::InvalidSpanRange { smin, smax });
        }

        let column_index = (x + z * self.width) as usize;
        let mut new_span = Span::new(smin, smax, area);

        let mut previous = SPAN_NULL;
        let mut current = self.columns[column_index];

        while current != SPAN_NULL {
            let existing = self.slots[current as usize].span;

            if existing.smin() > new_span.smax() {
                // Current is past the new span, insertion point found.
                break;
            }
            if existing.smax() < new_span.smin() {
                // Current is fully below the new span, keep walking.
                previous = current;
                current = self.slots[current as usize].next;
                continue;
            }

            // Overlap or touch: absorb the existing span.
            if existing.smin() < new_span.smin() {
                new_span.set_smin(existing.smin());
            }
            if existing.smax() > new_span.smax() {
                new_span.set_smax(existing.smax());
            }
            if new_span.smax().abs_diff(existing.smax()) <= flag_merge_threshold {
                new_span.set_area(new_span.area().max(existing.area()));
            }

            let next = self.slots[current as usize].next;
            self.free_span(current);
            if previous != SPAN_NULL {
                self.slots[previous as usize].next = next;
            } else {
                self.columns[column_index] = next;
            }
            current = next;
        }

        let inserted = self.allocate_span(new_span, current);
        if previous != SPAN_NULL {
            self.slots[previous as usize].next = inserted;
        } else {
            self.columns[column_index] = inserted;
        }

        Ok(())
    }
}

#[inline]
fn triangle_up_normal(a: Vec3A, b: Vec3A, c: Vec3A) -> f32 {
    let ab = b - a;
    let ac = c - a;
    ab.cross(ac).normalize_or_zero().y
}

/// Sets the area of every triangle whose slope is traversable to [WALKABLE_AREA].
/// Triangles already carrying a custom non-null area keep it.
pub fn mark_walkable_triangles(
    settings: &NavMeshSettings,
    vertices: &[Vec3],
    indices: TriangleIndices,
    area_ids: &mut [u8],
) {
    let threshold = settings.max_traversable_slope_radians.cos();

    for (triangle, area) in area_ids.iter_mut().enumerate() {
        let [a, b, c] = indices.triangle(triangle);
        let up = triangle_up_normal(
            Vec3A::from(vertices[a as usize]),
            Vec3A::from(vertices[b as usize]),
            Vec3A::from(vertices[c as usize]),
        );

        if up > threshold && *area == NULL_AREA {
            *area = WALKABLE_AREA;
        }
    }
}

/// Resets the area of every triangle steeper than the traversable slope to [NULL_AREA]
/// without promoting flat ones.
pub fn clear_unwalkable_triangles(
    settings: &NavMeshSettings,
    vertices: &[Vec3],
    indices: TriangleIndices,
    area_ids: &mut [u8],
) {
    let threshold = settings.max_traversable_slope_radians.cos();

    for (triangle, area) in area_ids.iter_mut().enumerate() {
        let [a, b, c] = indices.triangle(triangle);
        let up = triangle_up_normal(
            Vec3A::from(vertices[a as usize]),
            Vec3A::from(vertices[b as usize]),
            Vec3A::from(vertices[c as usize]),
        );

        if up <= threshold {
            *area = NULL_AREA;
        }
    }
}

/// Rasterizes a triangle soup into the heightfield, one span per covered cell per
/// triangle, merged on insertion.
pub fn rasterize_triangles(
    heightfield: &mut Heightfield,
    vertices: &[Vec3],
    indices: TriangleIndices,
    area_ids: &[u8],
    flag_merge_threshold: u16,
) -> Result<(), RasterizationError> {
    if area_ids.len() != indices.triangle_count() {
        return Err(RasterizationError::AreaCountMismatch {
            areas: area_ids.len(),
            triangles: indices.triangle_count(),
        });
    }

    for triangle in 0..indices.triangle_count() {
        for vertex in indices.triangle(triangle) {
            if vertex as usize >= vertices.len() {
                return Err(RasterizationError::VertexOutOfBounds {
                    triangle,
                    vertex,
                    len: vertices.len(),
                });
            }
        }
    }

    let origin = Vec3A::from(heightfield.min_bound);
    for triangle in 0..indices.triangle_count() {
        let [a, b, c] = indices.triangle(triangle);

        rasterize_triangle(
            heightfield,
            Vec3A::from(vertices[a as usize]) - origin,
            Vec3A::from(vertices[b as usize]) - origin,
            Vec3A::from(vertices[c as usize]) - origin,
            area_ids[triangle],
            flag_merge_threshold,
        )?;
    }

    Ok(())
}

/// A convex polygon mid-clip. A triangle gains at most one vertex per half-space clip
/// and a cell applies four of them, so seven slots always suffice.
#[derive(Clone, Copy)]
struct ClipPoly {
    vertices: [Vec3A; 7],
    len: usize,
}

impl ClipPoly {
    fn from_triangle(a: Vec3A, b: Vec3A, c: Vec3A) -> Self {
        let mut poly = Self {
            vertices: [Vec3A::ZERO; 7],
            len: 0,
        };
        poly.push(a);
        poly.push(b);
        poly.push(c);
        poly
    }

    #[inline]
    fn vertices(&self) -> &[Vec3A] {
        &self.vertices[..self.len]
    }

    #[inline]
    fn push(&mut self, vertex: Vec3A) {
        self.vertices[self.len] = vertex;
        self.len += 1;
    }

    /// One Sutherland-Hodgman pass against the axis-aligned plane `axis = limit`,
    /// keeping the requested half-space. Vertices exactly on the plane belong to both
    /// halves, and an edge only generates an intersection vertex when its endpoints lie
    /// strictly on opposite sides; zero-area slivers along a cell boundary thus come
    /// out with fewer than three vertices and die in the caller's area check.
    fn clipped(&self, axis: usize, limit: f32, keep_above: bool) -> Self {
        let mut kept = Self {
            vertices: [Vec3A::ZERO; 7],
            len: 0,
        };

        for i in 0..self.len {
            let current = self.vertices[i];
            let next = self.vertices[(i + 1) % self.len];
            let current_delta = current[axis] - limit;
            let next_delta = next[axis] - limit;

            let current_kept = if keep_above {
                current_delta >= 0.0
            } else {
                current_delta <= 0.0
            };
            if current_kept {
                kept.push(current);
            }
            if current_delta * next_delta < 0.0 {
                let t = current_delta / (current_delta - next_delta);
                kept.push(current + (next - current) * t);
            }
        }

        kept
    }

    /// Restricts the polygon to the slab `[min, max]` along `axis`.
    fn clipped_to_slab(&self, axis: usize, min: f32, max: f32) -> Self {
        self.clipped(axis, min, true).clipped(axis, max, false)
    }

    /// Smallest & largest coordinate along `axis`.
    fn extent(&self, axis: usize) -> (f32, f32) {
        self.vertices()
            .iter()
            .fold((f32::MAX, f32::MIN), |(min, max), vertex| {
                (min.min(vertex[axis]), max.max(vertex[axis]))
            })
    }
}

fn rasterize_triangle(
    heightfield: &mut Heightfield,
    a: Vec3A,
    b: Vec3A,
    c: Vec3A,
    area: u8,
    flag_merge_threshold: u16,
) -> Result<(), RasterizationError> {
    let cell_width = heightfield.cell_width;
    let cell_height = heightfield.cell_height;
    let grid_max = IVec3::new(heightfield.width - 1, 0, heightfield.height - 1);

    let min_bound = a.min(b).min(c).div(cell_width).floor().as_ivec3();
    let max_bound = a.max(b).max(c).div(cell_width).floor().as_ivec3();

    // Triangle completely outside the grid.
    if max_bound.x < 0 || max_bound.z < 0 || min_bound.x > grid_max.x || min_bound.z > grid_max.z {
        return Ok(());
    }

    let clamped_min = min_bound.max(IVec3::ZERO);
    let clamped_max = max_bound.min(grid_max);
    let triangle = ClipPoly::from_triangle(a, b, c);

    // X is column, Z is row; iterate Z first so column writes stay cache friendly.
    for z in clamped_min.z..=clamped_max.z {
        let row_min = z as f32 * cell_width;
        let row = triangle.clipped_to_slab(2, row_min, row_min + cell_width);
        if row.len < 3 {
            continue;
        }

        // Only columns under the row polygon's footprint need clipping.
        let (row_min_x, row_max_x) = row.extent(0);
        let column_min = ((row_min_x / cell_width).floor() as i32).max(0);
        let column_max = ((row_max_x / cell_width).floor() as i32).min(grid_max.x);

        for x in column_min..=column_max {
            let column_min_x = x as f32 * cell_width;
            let cell = row.clipped_to_slab(0, column_min_x, column_min_x + cell_width);
            if cell.len < 3 {
                continue;
            }

            // Anything below the heightfield base is clamped up; cells entirely below
            // are dropped.
            let (cell_min_height, cell_max_height) = cell.extent(1);
            if cell_max_height < 0.0 {
                continue;
            }
            let cell_min_height = cell_min_height.max(0.0);

            let smin = ((cell_min_height / cell_height).floor() as u32).min(SPAN_MAX_HEIGHT as u32)
                as u16;
            if smin >= SPAN_MAX_HEIGHT {
                continue;
            }
            let smax = ((cell_max_height / cell_height).ceil() as u32).min(SPAN_MAX_HEIGHT as u32)
                as u16;
            let smax = smax.max(smin + 1);

            heightfield.add_span(x, z, smin, smax, area, flag_merge_threshold)?;
        }
    }

    Ok(())
}

/// Promotes non-walkable spans sitting within `walkable_climb` of the walkable span
/// below them. Recovers walkability on thin curbs & step lips.
pub fn filter_low_hanging_walkable_obstacles(heightfield: &mut Heightfield, walkable_climb: u16) {
    for column in 0..heightfield.columns.len() {
        let mut previous_area = NULL_AREA;
        let mut previous_was_walkable = false;
        let mut previous_smax = 0u16;

        let mut current = heightfield.columns[column];
        while current != SPAN_NULL {
            let slot = &heightfield.slots[current as usize];
            let span = slot.span;
            let next = slot.next;
            let walkable = span.area() != NULL_AREA;

            if !walkable
                && previous_was_walkable
                && span.smax().abs_diff(previous_smax) <= walkable_climb
            {
                heightfield.slots[current as usize]
                    .span
                    .set_area(previous_area);
            }

            // Track the pre-filter walkable flag so promotion can't cascade up through
            // stacked obstacles in one pass.
            previous_was_walkable = walkable;
            previous_area = heightfield.slots[current as usize].span.area();
            previous_smax = span.smax();
            current = next;
        }
    }
}

/// Clears spans that sit on a ledge: the drop to some neighbouring column exceeds
/// `walkable_climb`, or the accessible neighbour floors disagree by more than it.
pub fn filter_ledge_spans(
    heightfield: &mut Heightfield,
    walkable_height: u16,
    walkable_climb: u16,
) {
    let width = heightfield.width;
    let height = heightfield.height;
    let walkable_height = walkable_height as i32;
    let walkable_climb = walkable_climb as i32;
    const MAX_HEIGHT: i32 = SPAN_MAX_HEIGHT as i32;

    for z in 0..height {
        for x in 0..width {
            let column = (x + z * width) as usize;

            let mut current = heightfield.columns[column];
            while current != SPAN_NULL {
                let slot = &heightfield.slots[current as usize];
                let span = slot.span;
                let next = slot.next;

                if span.area() == NULL_AREA {
                    current = next;
                    continue;
                }

                let bottom = span.smax() as i32;
                let top = if next != SPAN_NULL {
                    heightfield.slots[next as usize].span.smin() as i32
                } else {
                    MAX_HEIGHT
                };

                // Lowest & the spread of reachable neighbour floors, relative to this
                // span's walking surface.
                let mut min_neighbour_drop = MAX_HEIGHT;
                let mut accessible_min = span.smax() as i32;
                let mut accessible_max = span.smax() as i32;

                for dir in 0..4 {
                    let neighbour_x = x + crate::DIR_OFFSET_X[dir];
                    let neighbour_z = z + crate::DIR_OFFSET_Z[dir];

                    if neighbour_x < 0
                        || neighbour_z < 0
                        || neighbour_x >= width
                        || neighbour_z >= height
                    {
                        min_neighbour_drop = min_neighbour_drop.min(-walkable_climb - 1);
                        continue;
                    }

                    // The gap from the heightfield base to the first neighbour span
                    // counts as a potential drop as well.
                    let mut neighbour =
                        heightfield.columns[(neighbour_x + neighbour_z * width) as usize];
                    let mut neighbour_bottom = -walkable_climb - 1;
                    let mut neighbour_top = if neighbour != SPAN_NULL {
                        heightfield.slots[neighbour as usize].span.smin() as i32
                    } else {
                        MAX_HEIGHT
                    };
                    if top.min(neighbour_top) - bottom >= walkable_height {
                        min_neighbour_drop = min_neighbour_drop.min(neighbour_bottom - bottom);
                    }

                    while neighbour != SPAN_NULL {
                        let neighbour_slot = &heightfield.slots[neighbour as usize];
                        neighbour_bottom = neighbour_slot.span.smax() as i32;
                        neighbour_top = if neighbour_slot.next != SPAN_NULL {
                            heightfield.slots[neighbour_slot.next as usize].span.smin() as i32
                        } else {
                            MAX_HEIGHT
                        };

                        // Only gaps an agent could occupy count as traversable.
                        if top.min(neighbour_top) - bottom.max(neighbour_bottom)
                            >= walkable_height
                        {
                            min_neighbour_drop = min_neighbour_drop.min(neighbour_bottom - bottom);

                            if (neighbour_bottom - bottom).abs() <= walkable_climb {
                                accessible_min = accessible_min.min(neighbour_bottom);
                                accessible_max = accessible_max.max(neighbour_bottom);
                            }
                        }

                        neighbour = neighbour_slot.next;
                    }
                }

                if min_neighbour_drop < -walkable_climb
                    || accessible_max - accessible_min > walkable_climb
                {
                    heightfield.slots[current as usize].span.set_area(NULL_AREA);
                }

                current = next;
            }
        }
    }
}

/// Clears walkable spans with less than `walkable_height` cells of head-room below the
/// next span up.
pub fn filter_walkable_low_height_spans(heightfield: &mut Heightfield, walkable_height: u16) {
    for column in 0..heightfield.columns.len() {
        let mut current = heightfield.columns[column];
        while current != SPAN_NULL {
            let slot = &heightfield.slots[current as usize];
            let span = slot.span;
            let next = slot.next;

            if next != SPAN_NULL && span.area() != NULL_AREA {
                let gap = heightfield.slots[next as usize].span.smin() - span.smax();
                if gap < walkable_height {
                    heightfield.slots[current as usize].span.set_area(NULL_AREA);
                }
            }

            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NavMeshSettings;

    fn settings() -> NavMeshSettings {
        let mut settings = NavMeshSettings::from_agent(0.5, 1.8, 0.4);
        settings.cell_width = 1.0;
        settings.cell_height = 1.0;
        settings
    }

    fn empty_field(width: f32, height: f32) -> Heightfield {
        Heightfield::new(
            &settings(),
            Vec3::ZERO,
            Vec3::new(width, 10.0, height),
        )
        .unwrap()
    }

    fn column(heightfield: &Heightfield, x: i32, z: i32) -> Vec<(u16, u16, u8)> {
        heightfield
            .spans_in_column(x, z)
            .map(|span| (span.smin(), span.smax(), span.area()))
            .collect()
    }

    #[test]
    fn span_packing_round_trips() {
        let mut span = Span::new(0, SPAN_MAX_HEIGHT, WALKABLE_AREA);
        assert_eq!(span.smin(), 0);
        assert_eq!(span.smax(), SPAN_MAX_HEIGHT);
        assert_eq!(span.area(), WALKABLE_AREA);

        span.set_smin(123);
        span.set_smax(456);
        span.set_area(7);
        assert_eq!((span.smin(), span.smax(), span.area()), (123, 456, 7));
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        assert!(matches!(
            Heightfield::new(&settings(), Vec3::new(1.0, 0.0, 0.0), Vec3::ZERO),
            Err(RasterizationError::InvalidBounds { .. })
        ));
    }

    #[test]
    fn add_span_rejects_bad_input_without_mutation() {
        let mut heightfield = empty_field(4.0, 4.0);
        assert!(matches!(
            heightfield.add_span(4, 0, 0, 1, WALKABLE_AREA, 1),
            Err(RasterizationError::ColumnOutOfBounds { .. })
        ));
        assert!(matches!(
            heightfield.add_span(0, 0, 5, 2, WALKABLE_AREA, 1),
            Err(RasterizationError::InvalidSpanRange { smin: 5, smax: 2 })
        ));
        assert_eq!(heightfield.span_count(), 0);
    }

    #[test]
    fn overlapping_spans_merge_into_one() {
        let mut heightfield = empty_field(1.0, 1.0);
        heightfield.add_span(0, 0, 10, 20, NULL_AREA, 1).unwrap();
        heightfield.add_span(0, 0, 30, 40, NULL_AREA, 1).unwrap();
        heightfield.add_span(0, 0, 15, 35, NULL_AREA, 1).unwrap();

        assert_eq!(column(&heightfield, 0, 0), vec![(10, 40, NULL_AREA)]);
    }

    #[test]
    fn merged_span_keeps_higher_area_within_threshold() {
        let mut heightfield = empty_field(1.0, 1.0);
        heightfield.add_span(0, 0, 0, 10, NULL_AREA, 1).unwrap();
        // Top within one cell of the existing top: walkable wins.
        heightfield.add_span(0, 0, 0, 11, WALKABLE_AREA, 1).unwrap();
        assert_eq!(column(&heightfield, 0, 0), vec![(0, 11, WALKABLE_AREA)]);

        let mut heightfield = empty_field(1.0, 1.0);
        heightfield.add_span(0, 0, 0, 10, WALKABLE_AREA, 1).unwrap();
        // Far taller obstacle swallows the walkable span and the flag does not merge.
        heightfield.add_span(0, 0, 0, 20, NULL_AREA, 1).unwrap();
        assert_eq!(column(&heightfield, 0, 0), vec![(0, 20, NULL_AREA)]);
    }

    #[test]
    fn spans_stay_sorted_and_disjoint() {
        let mut heightfield = empty_field(1.0, 1.0);
        for (smin, smax) in [(40, 50), (0, 5), (20, 30), (7, 15), (3, 8)] {
            heightfield
                .add_span(0, 0, smin, smax, WALKABLE_AREA, 1)
                .unwrap();
        }

        let spans = column(&heightfield, 0, 0);
        for window in spans.windows(2) {
            assert!(window[0].1 <= window[1].0, "spans overlap: {spans:?}");
        }
        for (smin, smax, _) in spans {
            assert!(smin < smax);
        }
    }

    #[test]
    fn freed_spans_are_reused() {
        let mut heightfield = empty_field(1.0, 1.0);
        heightfield.add_span(0, 0, 0, 2, NULL_AREA, 1).unwrap();
        heightfield.add_span(0, 0, 4, 6, NULL_AREA, 1).unwrap();
        heightfield.add_span(0, 0, 8, 10, NULL_AREA, 1).unwrap();
        let allocated = heightfield.slots.len();

        // Merging three spans into one frees their slots; the following inserts reuse
        // them without growing the arena.
        heightfield.add_span(0, 0, 1, 9, NULL_AREA, 1).unwrap();
        heightfield.add_span(0, 0, 20, 22, NULL_AREA, 1).unwrap();
        heightfield.add_span(0, 0, 30, 32, NULL_AREA, 1).unwrap();
        assert_eq!(heightfield.slots.len(), allocated);
    }

    #[test]
    fn clip_poly_keeps_boundary_vertices_without_slivers() {
        // Triangle touching x = 2 only along its right edge: the kept side of a clip at
        // that line is a zero-area sliver with fewer than three vertices.
        let triangle = ClipPoly::from_triangle(
            Vec3A::new(1.0, 0.0, 1.0),
            Vec3A::new(2.0, 0.0, 2.0),
            Vec3A::new(2.0, 0.0, 1.0),
        );
        let above = triangle.clipped(0, 2.0, true);
        assert!(above.len < 3);

        // An interior slab cuts a real polygon with the expected footprint.
        let slab = triangle.clipped_to_slab(0, 1.25, 1.75);
        assert!(slab.len >= 3);
        let (min_x, max_x) = slab.extent(0);
        assert!((min_x - 1.25).abs() < 1e-6);
        assert!((max_x - 1.75).abs() < 1e-6);
    }

    #[test]
    fn rasterizing_a_flat_square_fills_every_covered_column() {
        // Two triangles forming a unit-height square over a 4x4 grid.
        let vertices = [
            Vec3::new(0.0, 5.0, 0.0),
            Vec3::new(4.0, 5.0, 0.0),
            Vec3::new(4.0, 5.0, 4.0),
            Vec3::new(0.0, 5.0, 4.0),
        ];
        let indices = [[0u32, 2, 1], [0, 3, 2]];

        let mut heightfield = empty_field(4.0, 4.0);
        rasterize_triangles(
            &mut heightfield,
            &vertices,
            TriangleIndices::U32(&indices),
            &[WALKABLE_AREA; 2],
            1,
        )
        .unwrap();

        for z in 0..4 {
            for x in 0..4 {
                assert_eq!(
                    column(&heightfield, x, z),
                    vec![(5, 6, WALKABLE_AREA)],
                    "column ({x}, {z})"
                );
            }
        }
    }

    #[test]
    fn rasterization_rejects_out_of_buffer_indices() {
        let vertices = [Vec3::ZERO, Vec3::X, Vec3::Z];
        let indices = [[0u32, 1, 3]];
        let mut heightfield = empty_field(4.0, 4.0);

        assert!(matches!(
            rasterize_triangles(
                &mut heightfield,
                &vertices,
                TriangleIndices::U32(&indices),
                &[WALKABLE_AREA],
                1,
            ),
            Err(RasterizationError::VertexOutOfBounds { vertex: 3, .. })
        ));
        assert_eq!(heightfield.span_count(), 0);
    }

    #[test]
    fn walkable_marking_follows_slope() {
        let settings = settings();
        // One flat triangle, one vertical wall.
        let vertices = [
            Vec3::ZERO,
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(0.0, 1.0, 0.0),
        ];
        let indices = [[0u32, 2, 1], [0, 1, 3]];
        let mut areas = [NULL_AREA; 2];

        mark_walkable_triangles(
            &settings,
            &vertices,
            TriangleIndices::U32(&indices),
            &mut areas,
        );
        assert_eq!(areas, [WALKABLE_AREA, NULL_AREA]);

        let mut areas = [5, 5];
        clear_unwalkable_triangles(
            &settings,
            &vertices,
            TriangleIndices::U32(&indices),
            &mut areas,
        );
        assert_eq!(areas, [5, NULL_AREA]);
    }

    #[test]
    fn low_hanging_filter_promotes_thin_steps() {
        let mut heightfield = empty_field(1.0, 1.0);
        heightfield.add_span(0, 0, 0, 4, WALKABLE_AREA, 1).unwrap();
        heightfield.add_span(0, 0, 4, 6, NULL_AREA, 1).unwrap();

        filter_low_hanging_walkable_obstacles(&mut heightfield, 2);
        assert_eq!(
            column(&heightfield, 0, 0),
            vec![(0, 4, WALKABLE_AREA), (4, 6, WALKABLE_AREA)]
        );

        // Re-running leaves the field unchanged.
        let before = column(&heightfield, 0, 0);
        filter_low_hanging_walkable_obstacles(&mut heightfield, 2);
        assert_eq!(column(&heightfield, 0, 0), before);
    }

    #[test]
    fn low_hanging_filter_ignores_tall_obstacles() {
        let mut heightfield = empty_field(1.0, 1.0);
        heightfield.add_span(0, 0, 0, 4, WALKABLE_AREA, 1).unwrap();
        heightfield.add_span(0, 0, 4, 10, NULL_AREA, 1).unwrap();

        filter_low_hanging_walkable_obstacles(&mut heightfield, 2);
        assert_eq!(
            column(&heightfield, 0, 0),
            vec![(0, 4, WALKABLE_AREA), (4, 10, NULL_AREA)]
        );
    }

    #[test]
    fn ledge_filter_clears_the_rim_of_a_drop() {
        // A 4x4 plateau at height 10 surrounded by nothing: every plateau span borders
        // the grid edge or a missing column, so the whole plateau is a ledge with
        // climb 1.
        let mut heightfield = empty_field(8.0, 8.0);
        for z in 2..6 {
            for x in 2..6 {
                heightfield
                    .add_span(x, z, 0, 10, WALKABLE_AREA, 1)
                    .unwrap();
            }
        }

        filter_ledge_spans(&mut heightfield, 3, 1);

        for z in 2..6 {
            for x in 2..6 {
                let rim = x == 2 || x == 5 || z == 2 || z == 5;
                let expected = if rim { NULL_AREA } else { WALKABLE_AREA };
                assert_eq!(
                    column(&heightfield, x, z),
                    vec![(0, 10, expected)],
                    "column ({x}, {z})"
                );
            }
        }

        // Idempotent: the surviving interior is flat.
        filter_ledge_spans(&mut heightfield, 3, 1);
        for z in 3..5 {
            for x in 3..5 {
                assert_eq!(column(&heightfield, x, z), vec![(0, 10, WALKABLE_AREA)]);
            }
        }
    }

    #[test]
    fn low_height_filter_clears_tight_gaps() {
        let mut heightfield = empty_field(1.0, 1.0);
        heightfield.add_span(0, 0, 0, 2, WALKABLE_AREA, 1).unwrap();
        heightfield.add_span(0, 0, 4, 8, NULL_AREA, 1).unwrap();

        // Two cells of head-room under a ceiling: too tight for walkable_height 3.
        filter_walkable_low_height_spans(&mut heightfield, 3);
        assert_eq!(
            column(&heightfield, 0, 0),
            vec![(0, 2, NULL_AREA), (4, 8, NULL_AREA)]
        );
    }
}
