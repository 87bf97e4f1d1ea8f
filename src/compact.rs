//! The compact heightfield: the open space above walkable surfaces, flattened into
//! cache-friendly arrays.
//!
//! Where the solid [Heightfield](crate::heightfields::Heightfield) stores occupied
//! intervals, a [CompactHeightfield] stores one entry per walkable floor with the gap
//! above it and packed links to the up-to-four neighbouring floors an agent could step
//! onto. All later pipeline stages walk these links instead of re-scanning columns.

use bevy::log::warn;
use bevy::math::Vec3;

use crate::{
    get_neighbour_index,
    heightfields::{Heightfield, SPAN_NULL},
    NavMeshSettings, DIR_OFFSET_X, DIR_OFFSET_Z, NULL_AREA,
};

/// Sentinel for an absent neighbour link; all six bits of the link field set.
pub const NOT_CONNECTED: u8 = 0x3f;

const CELL_INDEX_BITS: u32 = 24;
const CELL_COUNT_MASK: u32 = 0xff;
const CONNECTION_BITS: u32 = 6;
const CONNECTION_MASK: u32 = NOT_CONNECTED as u32;

/// A column's slice of the packed span array: 24 bits start index, 8 bits span count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactCell {
    data: u32,
}

impl CompactCell {
    fn new(index: usize, count: usize) -> Self {
        debug_assert!(index < (1 << CELL_INDEX_BITS) as usize);
        debug_assert!(count <= CELL_COUNT_MASK as usize);
        Self {
            data: index as u32 | ((count as u32) << CELL_INDEX_BITS),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        (self.data & ((1 << CELL_INDEX_BITS) - 1)) as usize
    }

    #[inline]
    pub fn count(&self) -> usize {
        (self.data >> CELL_INDEX_BITS) as usize
    }

    #[inline]
    pub fn spans(&self) -> std::ops::Range<usize> {
        self.index()..self.index() + self.count()
    }
}

/// One walkable floor: `y` is the floor height, `height` the clear space above it, and
/// the packed connection word holds a 6-bit in-cell span index per direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompactSpan {
    pub y: u16,
    pub region: u16,
    /// con: 24 bits (4 x 6), h: 8 bits.
    data: u32,
}

impl CompactSpan {
    fn new(y: u16, height: u8) -> Self {
        let mut span = Self {
            y,
            region: 0,
            // All four links start as NOT_CONNECTED.
            data: 0x00ff_ffff,
        };
        span.set_height(height);
        span
    }

    /// The in-cell index of the connected span in direction `dir`, if any.
    #[inline]
    pub fn connection(&self, dir: usize) -> Option<u8> {
        let raw = (self.data >> (dir as u32 * CONNECTION_BITS)) as u8 & NOT_CONNECTED;
        (raw != NOT_CONNECTED).then_some(raw)
    }

    #[inline]
    pub(crate) fn set_connection(&mut self, dir: usize, value: u8) {
        debug_assert!(value <= NOT_CONNECTED);
        let shift = dir as u32 * CONNECTION_BITS;
        self.data = (self.data & !(CONNECTION_MASK << shift)) | ((value as u32) << shift);
    }

    /// Clear space above the floor in cells, saturated at 255.
    #[inline]
    pub fn height(&self) -> u8 {
        (self.data >> CELL_INDEX_BITS) as u8
    }

    #[inline]
    fn set_height(&mut self, height: u8) {
        self.data = (self.data & 0x00ff_ffff) | ((height as u32) << CELL_INDEX_BITS);
    }
}

/// The open-space form of the voxelization. `cells` indexes into the parallel `spans`
/// & `areas` arrays; `dist` is filled by [build_distance_field].
pub struct CompactHeightfield {
    pub width: i32,
    pub height: i32,
    pub span_count: usize,
    pub walkable_height: u16,
    pub walkable_climb: u16,
    pub border_size: u16,
    pub max_distance: u16,
    pub max_region: u16,
    pub min_bound: Vec3,
    pub max_bound: Vec3,
    pub cell_width: f32,
    pub cell_height: f32,
    pub cells: Box<[CompactCell]>,
    pub spans: Box<[CompactSpan]>,
    pub dist: Box<[u16]>,
    pub areas: Box<[u8]>,
}

impl CompactHeightfield {
    /// Index into `spans` of the neighbour of `span_index` (at `cell_index`) in `dir`,
    /// if connected.
    #[inline]
    pub(crate) fn connected_span_index(
        &self,
        cell_index: usize,
        span_index: usize,
        dir: usize,
    ) -> Option<usize> {
        let connection = self.spans[span_index].connection(dir)?;
        let neighbour_cell = get_neighbour_index(self.width as usize, cell_index, dir);
        Some(self.cells[neighbour_cell].index() + connection as usize)
    }
}

/// Flattens the filtered heightfield into a [CompactHeightfield] and links every span to
/// its traversable neighbours.
pub fn build_compact_heightfield(
    settings: &NavMeshSettings,
    heightfield: &Heightfield,
) -> CompactHeightfield {
    let width = heightfield.width;
    let height = heightfield.height;
    let span_count = heightfield.walkable_span_count();

    let mut cells = vec![CompactCell::default(); (width * height) as usize].into_boxed_slice();
    let mut spans = Vec::with_capacity(span_count);
    let mut areas = Vec::with_capacity(span_count);

    for cell_index in 0..cells.len() {
        let start = spans.len();

        let mut current = heightfield.column_head(cell_index);
        while current != SPAN_NULL {
            let slot = heightfield.slot(current);
            let span = slot.span;
            if span.area() != NULL_AREA {
                let floor = span.smax();
                let gap = if slot.next != SPAN_NULL {
                    heightfield.slot(slot.next).span.smin() - floor
                } else {
                    u16::MAX
                };

                spans.push(CompactSpan::new(floor, gap.min(255) as u8));
                areas.push(span.area());
            }
            current = slot.next;
        }

        let count = spans.len() - start;
        if count > CELL_COUNT_MASK as usize {
            warn!("Column {cell_index} holds {count} walkable spans, exceeding the cell capacity of 255.");
        }
        cells[cell_index] = CompactCell::new(start, count.min(CELL_COUNT_MASK as usize));
    }

    let mut compact = CompactHeightfield {
        width,
        height,
        span_count,
        walkable_height: settings.walkable_height,
        walkable_climb: settings.step_height,
        border_size: settings.border_size,
        max_distance: 0,
        max_region: 0,
        min_bound: heightfield.min_bound,
        max_bound: heightfield.max_bound,
        cell_width: heightfield.cell_width,
        cell_height: heightfield.cell_height,
        cells,
        spans: spans.into_boxed_slice(),
        dist: Box::default(),
        areas: areas.into_boxed_slice(),
    };

    link_neighbours(&mut compact);

    compact
}

fn link_neighbours(compact: &mut CompactHeightfield) {
    let walkable_height = compact.walkable_height as i32;
    let walkable_climb = compact.walkable_climb as i32;

    let mut too_high_neighbours = 0usize;
    for z in 0..compact.height {
        for x in 0..compact.width {
            let cell_index = (x + z * compact.width) as usize;

            for span_index in compact.cells[cell_index].spans() {
                for dir in 0..4 {
                    let neighbour_x = x + DIR_OFFSET_X[dir];
                    let neighbour_z = z + DIR_OFFSET_Z[dir];
                    if neighbour_x < 0
                        || neighbour_z < 0
                        || neighbour_x >= compact.width
                        || neighbour_z >= compact.height
                    {
                        continue;
                    }

                    let span = compact.spans[span_index];
                    let floor = span.y as i32;
                    let ceiling = floor + span.height() as i32;

                    let neighbour_cell =
                        compact.cells[(neighbour_x + neighbour_z * compact.width) as usize];
                    for (in_cell, neighbour_index) in neighbour_cell.spans().enumerate() {
                        let neighbour = compact.spans[neighbour_index];
                        let neighbour_floor = neighbour.y as i32;
                        let neighbour_ceiling = neighbour_floor + neighbour.height() as i32;

                        // Connected when the shared gap fits the agent and the step
                        // between floors is climbable.
                        if ceiling.min(neighbour_ceiling) - floor.max(neighbour_floor)
                            >= walkable_height
                            && (neighbour_floor - floor).abs() <= walkable_climb
                        {
                            if in_cell >= NOT_CONNECTED as usize {
                                too_high_neighbours += 1;
                                break;
                            }
                            compact.spans[span_index].set_connection(dir, in_cell as u8);
                            break;
                        }
                    }
                }
            }
        }
    }

    if too_high_neighbours > 0 {
        warn!("{too_high_neighbours} neighbour links exceeded the 6-bit span index range and were dropped.");
    }
}

/// Visits the up-to-eight same-level neighbours of a span: the four cardinals, each
/// followed by the diagonal reached through it with a clockwise turn. The callback gets
/// the neighbourhood slot (0..8) and the neighbour's span index when one is connected.
fn for_each_neighbourhood_span(
    compact: &CompactHeightfield,
    cell_index: usize,
    span_index: usize,
    mut visit: impl FnMut(usize, Option<usize>),
) {
    for dir in 0..4 {
        let cardinal = compact.connected_span_index(cell_index, span_index, dir);
        visit(dir * 2, cardinal);

        // An unreachable cardinal makes its diagonal unreachable too.
        let diagonal = cardinal.and_then(|cardinal_index| {
            let cardinal_cell = get_neighbour_index(compact.width as usize, cell_index, dir);
            compact.connected_span_index(cardinal_cell, cardinal_index, (dir + 1) & 0x3)
        });
        visit(dir * 2 + 1, diagonal);
    }
}

/// Zeroes `dist` on every boundary span and leaves `u16::MAX` on the rest. A span is
/// interior only when all four cardinal links exist and `connected` approves each.
fn seed_boundary_distances(
    compact: &CompactHeightfield,
    dist: &mut [u16],
    mut connected: impl FnMut(usize, usize) -> bool,
) {
    for (cell_index, cell) in compact.cells.iter().enumerate() {
        for span_index in cell.spans() {
            let interior = (0..4).all(|dir| {
                compact
                    .connected_span_index(cell_index, span_index, dir)
                    .is_some_and(|neighbour| connected(span_index, neighbour))
            });

            dist[span_index] = if interior { u16::MAX } else { 0 };
        }
    }
}

/// The chamfer mask: per pass, the two cardinal probes and the turn that reaches each
/// probe's diagonal. Pass 0 sweeps the span array forward, pass 1 backward with the
/// mirrored directions.
const SWEEP_PROBES: [[(usize, usize); 2]; 2] = [
    [(0, 3), (3, 2)], // west + south-west, south + south-east
    [(2, 1), (1, 0)], // east + north-east, north + north-west
];

/// Two-pass chamfer relaxation over the neighbour links: +2 per cardinal step, +3 per
/// diagonal. `dist` must be seeded by [seed_boundary_distances] first.
fn propagate_distances(compact: &CompactHeightfield, dist: &mut [u16]) {
    let width = compact.width as usize;
    let cell_count = compact.cells.len();

    for (pass, probes) in SWEEP_PROBES.iter().enumerate() {
        for step in 0..cell_count {
            let cell_index = if pass == 0 {
                step
            } else {
                cell_count - 1 - step
            };

            for span_index in compact.cells[cell_index].spans() {
                let mut best = dist[span_index];

                for &(dir, turn) in probes {
                    let Some(cardinal) = compact.connected_span_index(cell_index, span_index, dir)
                    else {
                        continue;
                    };
                    best = best.min(dist[cardinal].saturating_add(2));

                    let cardinal_cell = get_neighbour_index(width, cell_index, dir);
                    if let Some(diagonal) =
                        compact.connected_span_index(cardinal_cell, cardinal, turn)
                    {
                        best = best.min(dist[diagonal].saturating_add(3));
                    }
                }

                dist[span_index] = best;
            }
        }
    }
}

/// Clears every span closer to an unwalkable cell than the agent radius, pulling the
/// nav-mesh back from walls so the agent's body never clips them.
pub fn erode_walkable_area(compact: &mut CompactHeightfield, walkable_radius: u16) {
    let mut dist = vec![0u16; compact.span_count].into_boxed_slice();

    // Unwalkable spans seed at zero themselves; walkable spans are boundary as soon as
    // one walkable cardinal neighbour is missing.
    seed_boundary_distances(compact, &mut dist, |span_index, neighbour_index| {
        compact.areas[span_index] != NULL_AREA && compact.areas[neighbour_index] != NULL_AREA
    });

    propagate_distances(compact, &mut dist);

    // Distances count 2 per cell.
    let threshold = walkable_radius * 2;
    for span_index in 0..compact.span_count {
        if dist[span_index] < threshold {
            compact.areas[span_index] = NULL_AREA;
        }
    }
}

/// Replaces each walkable span's area with the median of its own & its up-to-eight
/// same-level neighbours. Smooths out single-voxel noise; unwalkable spans are never
/// promoted.
pub fn median_filter_walkable_area(compact: &mut CompactHeightfield) {
    let mut filtered = vec![0u8; compact.span_count].into_boxed_slice();

    for (cell_index, cell) in compact.cells.iter().enumerate() {
        for span_index in cell.spans() {
            if compact.areas[span_index] == NULL_AREA {
                filtered[span_index] = NULL_AREA;
                continue;
            }

            // Slots without a walkable neighbour count as the span's own area.
            let mut neighbourhood = [compact.areas[span_index]; 9];
            for_each_neighbourhood_span(compact, cell_index, span_index, |slot, neighbour| {
                if let Some(neighbour_index) = neighbour {
                    if compact.areas[neighbour_index] != NULL_AREA {
                        neighbourhood[slot] = compact.areas[neighbour_index];
                    }
                }
            });

            neighbourhood.sort_unstable();
            filtered[span_index] = neighbourhood[4];
        }
    }

    compact.areas = filtered;
}

/// Builds the distance-to-boundary field driving watershed partitioning: two chamfer
/// passes followed by a box blur.
pub fn build_distance_field(compact: &mut CompactHeightfield) {
    let mut dist = vec![u16::MAX; compact.span_count].into_boxed_slice();

    // Area changes count as boundary, so every area patch gets its own watershed.
    seed_boundary_distances(compact, &mut dist, |span_index, neighbour_index| {
        compact.areas[neighbour_index] == compact.areas[span_index]
    });

    propagate_distances(compact, &mut dist);

    compact.max_distance = dist.iter().copied().max().unwrap_or(0);

    compact.dist = blur_distance_field(compact, &dist);
}

/// One pass of thresholded box blur over the distance field, smoothing watershed seeds.
fn blur_distance_field(compact: &CompactHeightfield, dist: &[u16]) -> Box<[u16]> {
    // Boundary-adjacent values stay crisp so region edges don't wander.
    const SKIP_THRESHOLD: u16 = 2;

    let mut blurred = vec![0u16; dist.len()].into_boxed_slice();

    for (cell_index, cell) in compact.cells.iter().enumerate() {
        for span_index in cell.spans() {
            let centre = dist[span_index];
            if centre <= SKIP_THRESHOLD {
                blurred[span_index] = centre;
                continue;
            }

            // Missing neighbours contribute the centre value, so the kernel always
            // averages nine samples.
            let mut total = centre as u32;
            for_each_neighbourhood_span(compact, cell_index, span_index, |_, neighbour| {
                total += neighbour.map_or(centre, |neighbour_index| dist[neighbour_index]) as u32;
            });

            blurred[span_index] = ((total + 5) / 9) as u16;
        }
    }

    blurred
}
