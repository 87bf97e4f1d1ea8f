//! Heightfield layers: splitting a multi-story tile into non-overlapping 2-D slabs.
//!
//! Worlds with stacked walkable surfaces (bridges, multi-floor buildings) cannot be
//! described by one height per cell. The layer builder partitions the compact
//! heightfield into monotone row-sweep regions, groups regions into layers such that no
//! two vertically overlapping regions share a layer, merges layers that are close in
//! height, and emits each layer as a flat slab with byte heights relative to its floor.

use bevy::math::Vec3;
use smallvec::SmallVec;
use thiserror::Error;

use crate::{compact::CompactHeightfield, NULL_AREA};

/// Marker for cells not covered by a layer.
pub const LAYER_UNSET_HEIGHT: u8 = 0xff;

const NO_REGION: u8 = 0xff;
const NO_LAYER: u8 = 0xff;
/// Most overlapping (stacked) regions one region can record.
const MAX_STACKED: usize = 63;

/// One 2-D slab of the tile: a projected view of the spans assigned to this layer.
pub struct HeightfieldLayer {
    pub width: i32,
    pub height: i32,
    pub min_bound: Vec3,
    pub max_bound: Vec3,
    pub cell_width: f32,
    pub cell_height: f32,
    /// Layer floor & ceiling in heightfield cell units.
    pub hmin: u16,
    pub hmax: u16,
    /// Floor height per cell relative to `hmin`, [LAYER_UNSET_HEIGHT] when empty.
    pub heights: Box<[u8]>,
    pub areas: Box<[u8]>,
    /// Low 4 bits: same-layer neighbour mask. High 4 bits: portal mask into other
    /// layers.
    pub connections: Box<[u8]>,
}

/// The set of layers of one tile, bottom-up in no particular order.
#[derive(Default)]
pub struct HeightfieldLayerSet {
    pub layers: Vec<HeightfieldLayer>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LayerError {
    #[error("monotone partitioning produced more than 255 regions")]
    OversizedRegionCount,
    #[error("a layer region overlaps more than {MAX_STACKED} other regions")]
    TooManyStackedRegions,
}

#[derive(Clone, Copy)]
struct SweepSpan {
    /// Samples connecting to the neighbour region below.
    sample_count: u16,
    id: u8,
    /// Region id of the row below, [NO_REGION] when ambiguous.
    neighbour: u8,
}

struct LayerRegion {
    layer_id: u8,
    /// Start of a merged group of regions.
    base: bool,
    ymin: u16,
    ymax: u16,
    /// Regions sharing a column with this one (vertical overlap).
    stacked: SmallVec<[u8; 8]>,
    /// Laterally connected regions.
    neighbours: SmallVec<[u8; 8]>,
}

fn add_unique(list: &mut SmallVec<[u8; 8]>, value: u8) -> bool {
    if list.contains(&value) {
        return true;
    }
    if list.len() >= MAX_STACKED {
        return false;
    }
    list.push(value);
    true
}

/// Partitions the compact heightfield into 2-D layers for multi-story tiles.
pub fn build_heightfield_layers(
    compact: &CompactHeightfield,
    walkable_height: u16,
) -> Result<HeightfieldLayerSet, LayerError> {
    let width = compact.width;
    let height = compact.height;
    let border = compact.border_size as i32;

    let mut span_regions = vec![NO_REGION; compact.span_count];

    // Partition the walkable area into monotone regions: one sweep per row, merging a
    // sweep with the row below only when the connection is unambiguous.
    let mut region_count: u16 = 0;
    let mut sweeps: Vec<SweepSpan> = Vec::with_capacity(width as usize);

    for z in border..height - border {
        let mut previous_row_count = [0u16; 256];
        let mut sweep_count = 0usize;
        sweeps.clear();

        for x in border..width - border {
            let cell_index = (x + z * width) as usize;

            for span_index in compact.cells[cell_index].spans() {
                if compact.areas[span_index] == NULL_AREA {
                    continue;
                }

                // Adopt the sweep of the span to the -x side when connected.
                let mut sweep_id = NO_REGION;
                if let Some(other_index) = compact.connected_span_index(cell_index, span_index, 0)
                {
                    if span_regions[other_index] != NO_REGION {
                        sweep_id = span_regions[other_index];
                    }
                }

                if sweep_id == NO_REGION {
                    if sweep_count >= NO_REGION as usize {
                        return Err(LayerError::OversizedRegionCount);
                    }
                    sweep_id = sweep_count as u8;
                    sweep_count += 1;
                    sweeps.push(SweepSpan {
                        sample_count: 0,
                        id: 0,
                        neighbour: NO_REGION,
                    });
                }

                // Track the region connectivity to the row below.
                if let Some(other_index) = compact.connected_span_index(cell_index, span_index, 3)
                {
                    let below_region = span_regions[other_index];
                    if below_region != NO_REGION {
                        let sweep = &mut sweeps[sweep_id as usize];
                        if sweep.sample_count == 0 {
                            sweep.neighbour = below_region;
                        }
                        if sweep.neighbour == below_region {
                            sweep.sample_count += 1;
                            previous_row_count[below_region as usize] += 1;
                        } else {
                            sweep.neighbour = NO_REGION;
                        }
                    }
                }

                span_regions[span_index] = sweep_id;
            }
        }

        // Assign final region ids to this row's sweeps.
        for sweep in sweeps.iter_mut().take(sweep_count) {
            if sweep.neighbour != NO_REGION
                && previous_row_count[sweep.neighbour as usize] == sweep.sample_count
            {
                // Exactly one continuous connection below: continue that region.
                sweep.id = sweep.neighbour;
            } else {
                if region_count == 255 {
                    return Err(LayerError::OversizedRegionCount);
                }
                sweep.id = region_count as u8;
                region_count += 1;
            }
        }

        for x in border..width - border {
            let cell_index = (x + z * width) as usize;
            for span_index in compact.cells[cell_index].spans() {
                if span_regions[span_index] != NO_REGION {
                    span_regions[span_index] = sweeps[span_regions[span_index] as usize].id;
                }
            }
        }
    }

    if region_count == 0 {
        return Ok(HeightfieldLayerSet::default());
    }

    // Analyze each region's vertical extent, lateral neighbours & vertical overlaps.
    let mut regions: Vec<LayerRegion> = (0..region_count)
        .map(|_| LayerRegion {
            layer_id: NO_LAYER,
            base: false,
            ymin: u16::MAX,
            ymax: 0,
            stacked: SmallVec::new(),
            neighbours: SmallVec::new(),
        })
        .collect();

    let mut column_regions: SmallVec<[u8; 8]> = SmallVec::new();
    for z in border..height - border {
        for x in border..width - border {
            let cell_index = (x + z * width) as usize;
            column_regions.clear();

            for span_index in compact.cells[cell_index].spans() {
                let region_id = span_regions[span_index];
                if region_id == NO_REGION {
                    continue;
                }
                let span = compact.spans[span_index];

                let region = &mut regions[region_id as usize];
                region.ymin = region.ymin.min(span.y);
                region.ymax = region.ymax.max(span.y);

                if column_regions.len() >= MAX_STACKED {
                    return Err(LayerError::TooManyStackedRegions);
                }
                column_regions.push(region_id);

                for dir in 0..4 {
                    let Some(other_index) =
                        compact.connected_span_index(cell_index, span_index, dir)
                    else {
                        continue;
                    };
                    let other_region = span_regions[other_index];
                    if other_region != NO_REGION && other_region != region_id {
                        if !add_unique(&mut regions[region_id as usize].neighbours, other_region)
                        {
                            return Err(LayerError::TooManyStackedRegions);
                        }
                    }
                }
            }

            // Every pair sharing this column overlaps vertically.
            for i in 0..column_regions.len() {
                for j in i + 1..column_regions.len() {
                    let (a, b) = (column_regions[i], column_regions[j]);
                    if a == b {
                        continue;
                    }
                    if !add_unique(&mut regions[a as usize].stacked, b)
                        || !add_unique(&mut regions[b as usize].stacked, a)
                    {
                        return Err(LayerError::TooManyStackedRegions);
                    }
                }
            }
        }
    }

    // Assign initial layer ids with a DFS over lateral connections, refusing to pull in
    // regions that overlap anything already in the layer or would stretch it past 255
    // cells of height.
    let mut layer_id: u8 = 0;
    let mut stack: Vec<u8> = Vec::with_capacity(64);

    for root_index in 0..regions.len() {
        if regions[root_index].layer_id != NO_LAYER {
            continue;
        }

        regions[root_index].layer_id = layer_id;
        regions[root_index].base = true;
        stack.clear();
        stack.push(root_index as u8);

        while let Some(region_index) = stack.pop() {
            let neighbours = regions[region_index as usize].neighbours.clone();

            for neighbour_index in neighbours {
                if regions[neighbour_index as usize].layer_id != NO_LAYER {
                    continue;
                }
                // Skip neighbours overlapping the accumulated layer.
                if regions[root_index].stacked.contains(&neighbour_index) {
                    continue;
                }
                // Skip if the combined vertical extent gets too tall for byte heights.
                let ymin = regions[root_index]
                    .ymin
                    .min(regions[neighbour_index as usize].ymin);
                let ymax = regions[root_index]
                    .ymax
                    .max(regions[neighbour_index as usize].ymax);
                if ymax - ymin >= 255 {
                    continue;
                }

                stack.push(neighbour_index);
                regions[neighbour_index as usize].layer_id = layer_id;

                let merged_stacked = regions[neighbour_index as usize].stacked.clone();
                for stacked in merged_stacked {
                    if !add_unique(&mut regions[root_index].stacked, stacked) {
                        return Err(LayerError::TooManyStackedRegions);
                    }
                }
                regions[root_index].ymin = ymin;
                regions[root_index].ymax = ymax;
            }
        }

        layer_id += 1;
    }

    // Merge layers that sit close in height and do not overlap.
    let merge_height = walkable_height * 4;
    for i in 0..regions.len() {
        if !regions[i].base {
            continue;
        }

        loop {
            let mut merge_from = None;

            for j in 0..regions.len() {
                if i == j || !regions[j].base {
                    continue;
                }
                if regions[i].layer_id == regions[j].layer_id {
                    continue;
                }
                // The slabs must be within padding distance of each other.
                if !overlap_range(
                    regions[i].ymin,
                    regions[i].ymax + merge_height,
                    regions[j].ymin,
                    regions[j].ymax + merge_height,
                ) {
                    continue;
                }
                if regions[i].ymax.max(regions[j].ymax) - regions[i].ymin.min(regions[j].ymin)
                    >= 255
                {
                    continue;
                }

                // No member of layer j may overlap layer i.
                let other_layer = regions[j].layer_id;
                let conflict = regions.iter().enumerate().any(|(k, region)| {
                    region.layer_id == other_layer && regions[i].stacked.contains(&(k as u8))
                });
                if conflict {
                    continue;
                }

                merge_from = Some(regions[j].layer_id);
                break;
            }

            let Some(old_id) = merge_from else {
                break;
            };
            let new_id = regions[i].layer_id;

            let mut merged_ymin = regions[i].ymin;
            let mut merged_ymax = regions[i].ymax;
            let mut merged_stacked: SmallVec<[u8; 8]> = SmallVec::new();
            for region in regions.iter_mut() {
                if region.layer_id != old_id {
                    continue;
                }
                region.base = false;
                region.layer_id = new_id;
                merged_ymin = merged_ymin.min(region.ymin);
                merged_ymax = merged_ymax.max(region.ymax);
                for stacked in region.stacked.clone() {
                    merged_stacked.push(stacked);
                }
            }
            regions[i].ymin = merged_ymin;
            regions[i].ymax = merged_ymax;
            for stacked in merged_stacked {
                if !add_unique(&mut regions[i].stacked, stacked) {
                    return Err(LayerError::TooManyStackedRegions);
                }
            }
        }
    }

    // Compact layer ids to 0..layer_count.
    let mut remap = [NO_LAYER; 256];
    let mut layer_count: u8 = 0;
    for region in regions.iter() {
        if region.layer_id != NO_LAYER && remap[region.layer_id as usize] == NO_LAYER {
            remap[region.layer_id as usize] = layer_count;
            layer_count += 1;
        }
    }
    for region in regions.iter_mut() {
        if region.layer_id != NO_LAYER {
            region.layer_id = remap[region.layer_id as usize];
        }
    }

    if layer_count == 0 {
        return Ok(HeightfieldLayerSet::default());
    }

    // Emit each layer as a slab.
    let layer_width = width - border * 2;
    let layer_height = height - border * 2;
    let mut layer_set = HeightfieldLayerSet {
        layers: Vec::with_capacity(layer_count as usize),
    };

    for current_layer in 0..layer_count {
        // The slab's vertical range is the union of its member regions.
        let mut hmin = u16::MAX;
        let mut hmax = 0u16;
        for region in regions.iter() {
            if region.layer_id == current_layer {
                hmin = hmin.min(region.ymin);
                hmax = hmax.max(region.ymax);
            }
        }

        let cell_count = (layer_width * layer_height) as usize;
        let border_world = border as f32 * compact.cell_width;
        let mut layer = HeightfieldLayer {
            width: layer_width,
            height: layer_height,
            min_bound: Vec3::new(
                compact.min_bound.x + border_world,
                compact.min_bound.y + hmin as f32 * compact.cell_height,
                compact.min_bound.z + border_world,
            ),
            max_bound: Vec3::new(
                compact.max_bound.x - border_world,
                compact.min_bound.y + hmax as f32 * compact.cell_height,
                compact.max_bound.z - border_world,
            ),
            cell_width: compact.cell_width,
            cell_height: compact.cell_height,
            hmin,
            hmax,
            heights: vec![LAYER_UNSET_HEIGHT; cell_count].into_boxed_slice(),
            areas: vec![NULL_AREA; cell_count].into_boxed_slice(),
            connections: vec![0; cell_count].into_boxed_slice(),
        };

        for z in 0..layer_height {
            for x in 0..layer_width {
                let cell_index = ((x + border) + (z + border) * width) as usize;
                let layer_cell = (x + z * layer_width) as usize;

                for span_index in compact.cells[cell_index].spans() {
                    let region_id = span_regions[span_index];
                    if region_id == NO_REGION
                        || regions[region_id as usize].layer_id != current_layer
                    {
                        continue;
                    }

                    let span = compact.spans[span_index];
                    layer.heights[layer_cell] = (span.y - hmin).min(255) as u8;
                    layer.areas[layer_cell] = compact.areas[span_index];

                    // Connection bits: low nibble for same-layer neighbours, high
                    // nibble portals into other layers.
                    let mut connection = 0u8;
                    let mut portal = 0u8;
                    for dir in 0..4 {
                        let Some(other_index) =
                            compact.connected_span_index(cell_index, span_index, dir)
                        else {
                            continue;
                        };
                        if compact.areas[other_index] == NULL_AREA {
                            continue;
                        }
                        let other_region = span_regions[other_index];
                        let other_layer = if other_region != NO_REGION {
                            regions[other_region as usize].layer_id
                        } else {
                            NO_LAYER
                        };

                        if other_layer == current_layer {
                            connection |= 1 << dir;
                        } else {
                            portal |= 1 << dir;
                        }
                    }
                    layer.connections[layer_cell] = (portal << 4) | connection;
                }
            }
        }

        layer_set.layers.push(layer);
    }

    Ok(layer_set)
}

#[inline]
fn overlap_range(amin: u16, amax: u16, bmin: u16, bmax: u16) -> bool {
    amin <= bmax && bmin <= amax
}
