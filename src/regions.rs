//! Watershed partitioning of the compact heightfield into regions.
//!
//! The distance field is flooded from its peaks downwards: at each water level the
//! already-claimed regions expand outwards, then fresh region ids are seeded on the
//! still-unclaimed spans of that level. A filter pass afterwards discards dust regions,
//! merges small ones into compatible neighbours and compacts ids to a dense range.

use bevy::log::warn;
use smallvec::SmallVec;
use thiserror::Error;

use crate::{
    compact::CompactHeightfield, get_neighbour_index, NavMeshSettings, BORDER_REGION, NULL_AREA,
};

const NB_STACKS: usize = 8;
const EXPAND_ITERS: u16 = 8;
/// Highest plain region id; the bit above is [BORDER_REGION].
const MAX_REGION_ID: u16 = BORDER_REGION - 1;

/// Region partitioning failed in a way the pipeline cannot recover from.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegionError {
    #[error("region id allocation exceeded {MAX_REGION_ID}")]
    OversizedRegionCount,
}

#[derive(Default, Clone, Copy)]
struct LevelStackEntry {
    cell_index: u32,
    span_index: u32,
}

/// Partitions the walkable spans into regions, writing region ids into the compact
/// heightfield's spans. Requires the distance field to be built.
pub fn build_regions(
    compact: &mut CompactHeightfield,
    settings: &NavMeshSettings,
) -> Result<(), RegionError> {
    let mut regions = vec![0u16; compact.span_count];
    let mut distances = vec![0u16; compact.span_count];

    let mut region_id = 1u16;

    // Paint the tile rim with synthetic border regions so ordinary regions stop at the
    // stitchable area.
    let border_size = compact.border_size as i32;
    if border_size > 0 {
        let width = compact.width;
        let height = compact.height;
        let border_width = border_size.min(width);
        let border_height = border_size.min(height);

        paint_rect_region(compact, &mut regions, 0, border_width, 0, height, region_id | BORDER_REGION);
        region_id += 1;
        paint_rect_region(compact, &mut regions, width - border_width, width, 0, height, region_id | BORDER_REGION);
        region_id += 1;
        paint_rect_region(compact, &mut regions, 0, width, 0, border_height, region_id | BORDER_REGION);
        region_id += 1;
        paint_rect_region(compact, &mut regions, 0, width, height - border_height, height, region_id | BORDER_REGION);
        region_id += 1;
    }

    let mut level_stacks: [Vec<LevelStackEntry>; NB_STACKS] = Default::default();
    for stack in level_stacks.iter_mut() {
        stack.reserve(256);
    }
    let mut flood_stack = Vec::with_capacity(256);

    let mut level = (compact.max_distance + 1) & !1u16;
    let mut stack_id: i32 = -1;

    while level > 0 {
        level = level.saturating_sub(2);
        stack_id = (stack_id + 1) & (NB_STACKS as i32 - 1);

        if stack_id == 0 {
            sort_cells_by_level(level, compact, &mut level_stacks, &regions);
        } else {
            // Carry unclaimed entries over from the previous level.
            let (previous, current) = {
                let (left, right) = level_stacks.split_at_mut(stack_id as usize);
                (&left[stack_id as usize - 1], &mut right[0])
            };
            for entry in previous.iter() {
                if regions[entry.span_index as usize] == 0 {
                    current.push(*entry);
                }
            }
        }

        expand_regions(
            compact,
            &mut regions,
            &mut distances,
            &mut level_stacks[stack_id as usize],
            Some(EXPAND_ITERS),
        );

        // Seed new regions on whatever this level's expansion could not reach.
        for i in 0..level_stacks[stack_id as usize].len() {
            let entry = level_stacks[stack_id as usize][i];
            if regions[entry.span_index as usize] != 0 {
                continue;
            }

            if region_id > MAX_REGION_ID {
                return Err(RegionError::OversizedRegionCount);
            }

            if flood_region(
                compact,
                entry,
                level,
                region_id,
                &mut regions,
                &mut distances,
                &mut flood_stack,
            ) {
                region_id += 1;
            }
        }
    }

    // Whatever the levelled sweep left unclaimed gets one unbounded growth pass.
    flood_stack.clear();
    for (cell_index, cell) in compact.cells.iter().enumerate() {
        for span_index in cell.spans() {
            if compact.areas[span_index] != NULL_AREA && regions[span_index] == 0 {
                flood_stack.push(LevelStackEntry {
                    cell_index: cell_index as u32,
                    span_index: span_index as u32,
                });
            }
        }
    }
    expand_regions(compact, &mut regions, &mut distances, &mut flood_stack, None);

    let max_region = merge_and_filter_regions(settings, compact, &mut regions, region_id)?;

    for (span, region) in compact.spans.iter_mut().zip(regions) {
        span.region = region;
    }
    compact.max_region = max_region;

    Ok(())
}

fn paint_rect_region(
    compact: &CompactHeightfield,
    regions: &mut [u16],
    min_x: i32,
    max_x: i32,
    min_z: i32,
    max_z: i32,
    region_id: u16,
) {
    for z in min_z..max_z {
        for x in min_x..max_x {
            let cell = compact.cells[(x + z * compact.width) as usize];
            for span_index in cell.spans() {
                if compact.areas[span_index] != NULL_AREA {
                    regions[span_index] = region_id;
                }
            }
        }
    }
}

fn sort_cells_by_level(
    start_level: u16,
    compact: &CompactHeightfield,
    stacks: &mut [Vec<LevelStackEntry>; NB_STACKS],
    regions: &[u16],
) {
    let start_level = (start_level >> 1) as i32;

    for stack in stacks.iter_mut() {
        stack.clear();
    }

    for (cell_index, cell) in compact.cells.iter().enumerate() {
        for span_index in cell.spans() {
            if compact.areas[span_index] == NULL_AREA || regions[span_index] != 0 {
                continue;
            }

            let level = (compact.dist[span_index] >> 1) as i32;
            let stack_id = (start_level - level).max(0);
            if stack_id >= NB_STACKS as i32 {
                continue;
            }

            stacks[stack_id as usize].push(LevelStackEntry {
                cell_index: cell_index as u32,
                span_index: span_index as u32,
            });
        }
    }
}

fn claim_from_neighbours(
    compact: &CompactHeightfield,
    regions: &[u16],
    distances: &[u16],
    cell_index: usize,
    span_index: usize,
) -> Option<(u16, u16)> {
    let area = compact.areas[span_index];
    let mut new_region = 0;
    let mut new_distance = u16::MAX;

    for dir in 0..4 {
        let Some(other_index) = compact.connected_span_index(cell_index, span_index, dir) else {
            continue;
        };
        if compact.areas[other_index] != area {
            continue;
        }

        let other_region = regions[other_index];
        if other_region == 0 || other_region & BORDER_REGION != 0 {
            continue;
        }
        let other_distance = distances[other_index].saturating_add(2);
        if other_distance < new_distance {
            new_region = other_region;
            new_distance = other_distance;
        }
    }

    (new_region != 0).then_some((new_region, new_distance))
}

/// Grows the already-claimed regions onto the unclaimed spans in `stack`. Claims are
/// gathered per round and applied together, so growth advances one ring at a time no
/// matter how the stack is ordered; claimed spans leave the stack between rounds.
/// `max_rounds` of `None` keeps going until nothing moves.
fn expand_regions(
    compact: &CompactHeightfield,
    regions: &mut [u16],
    distances: &mut [u16],
    stack: &mut Vec<LevelStackEntry>,
    max_rounds: Option<u16>,
) {
    stack.retain(|entry| regions[entry.span_index as usize] == 0);

    let mut claims: Vec<(usize, u16, u16)> = Vec::with_capacity(stack.len());
    let mut round = 0;
    while !stack.is_empty() {
        claims.clear();
        for entry in stack.iter() {
            if let Some((region, distance)) = claim_from_neighbours(
                compact,
                regions,
                distances,
                entry.cell_index as usize,
                entry.span_index as usize,
            ) {
                claims.push((entry.span_index as usize, region, distance));
            }
        }

        if claims.is_empty() {
            break;
        }
        for &(span_index, region, distance) in claims.iter() {
            regions[span_index] = region;
            distances[span_index] = distance;
        }
        stack.retain(|entry| regions[entry.span_index as usize] == 0);

        round += 1;
        if max_rounds.is_some_and(|max_rounds| round >= max_rounds) {
            break;
        }
    }
}

/// Claims every span reachable from `entry` whose distance reaches down to two below the
/// current water level. Gives the claim up if the flood touches another region.
fn flood_region(
    compact: &CompactHeightfield,
    entry: LevelStackEntry,
    level: u16,
    region_id: u16,
    regions: &mut [u16],
    distances: &mut [u16],
    stack: &mut Vec<LevelStackEntry>,
) -> bool {
    let area = compact.areas[entry.span_index as usize];
    let flood_level = level.saturating_sub(2);

    stack.clear();
    stack.push(entry);

    regions[entry.span_index as usize] = region_id;
    distances[entry.span_index as usize] = 0;

    let mut count = 0usize;

    while let Some(entry) = stack.pop() {
        let cell_index = entry.cell_index as usize;
        let span_index = entry.span_index as usize;

        // Give the span up if any 8-neighbour already belongs to another region.
        let mut adjacent_region = 0;
        for dir in 0..4 {
            let Some(other_index) = compact.connected_span_index(cell_index, span_index, dir)
            else {
                continue;
            };
            let other_cell_index = get_neighbour_index(compact.width as usize, cell_index, dir);

            if compact.areas[other_index] != area {
                continue;
            }
            let other_region = regions[other_index];
            if other_region & BORDER_REGION != 0 {
                continue;
            }
            if other_region != 0 && other_region != region_id {
                adjacent_region = other_region;
                break;
            }

            let next_dir = (dir + 1) & 0x3;
            if let Some(diagonal_index) =
                compact.connected_span_index(other_cell_index, other_index, next_dir)
            {
                if compact.areas[diagonal_index] != area {
                    continue;
                }
                let diagonal_region = regions[diagonal_index];
                if diagonal_region & BORDER_REGION != 0 {
                    continue;
                }
                if diagonal_region != 0 && diagonal_region != region_id {
                    adjacent_region = diagonal_region;
                    break;
                }
            }
        }

        if adjacent_region != 0 {
            regions[span_index] = 0;
            continue;
        }

        count += 1;

        for dir in 0..4 {
            let Some(other_index) = compact.connected_span_index(cell_index, span_index, dir)
            else {
                continue;
            };
            let other_cell_index = get_neighbour_index(compact.width as usize, cell_index, dir);

            if compact.areas[other_index] != area {
                continue;
            }
            if compact.dist[other_index] >= flood_level && regions[other_index] == 0 {
                regions[other_index] = region_id;
                distances[other_index] = 0;
                stack.push(LevelStackEntry {
                    cell_index: other_cell_index as u32,
                    span_index: other_index as u32,
                });
            }
        }
    }

    count > 0
}

struct Region {
    id: u16,
    span_count: usize,
    area: u8,
    remap: bool,
    visited: bool,
    overlap: bool,
    /// Neighbouring region ids in contour order; may carry [BORDER_REGION].
    connections: Vec<u16>,
    /// Region ids stacked above or below in the same columns.
    floors: SmallVec<[u16; 4]>,
}

fn merge_and_filter_regions(
    settings: &NavMeshSettings,
    compact: &CompactHeightfield,
    source_regions: &mut [u16],
    region_count: u16,
) -> Result<u16, RegionError> {
    let mut regions = Vec::with_capacity(region_count as usize);
    for id in 0..region_count {
        regions.push(Region {
            id,
            span_count: 0,
            area: NULL_AREA,
            remap: false,
            visited: false,
            overlap: false,
            connections: Vec::new(),
            floors: SmallVec::new(),
        });
    }

    // Gather span counts, floor stacks & boundary walks per region.
    for (cell_index, cell) in compact.cells.iter().enumerate() {
        for span_index in cell.spans() {
            let region_id = source_regions[span_index];
            if region_id == 0 || region_id >= region_count {
                continue;
            }

            regions[region_id as usize].span_count += 1;
            regions[region_id as usize].area = compact.areas[span_index];

            // Track overlapping regions within the column.
            for other_span_index in cell.spans() {
                if other_span_index == span_index {
                    continue;
                }
                let other_region_id = source_regions[other_span_index];
                if other_region_id == 0 || other_region_id >= region_count {
                    continue;
                }
                if other_region_id == region_id {
                    regions[region_id as usize].overlap = true;
                }
                add_unique_floor(&mut regions[region_id as usize], other_region_id);
            }

            if !regions[region_id as usize].connections.is_empty() {
                continue;
            }

            // First boundary edge found seeds the connection walk.
            let dir = (0..4)
                .find(|&dir| is_solid_edge(compact, source_regions, cell_index, span_index, dir));
            if let Some(dir) = dir {
                let mut connections = Vec::new();
                walk_region_connections(
                    compact,
                    source_regions,
                    cell_index,
                    span_index,
                    dir,
                    &mut connections,
                );
                regions[region_id as usize].connections = connections;
            }
        }
    }

    // Remove regions smaller than min_region_area, following connections so an
    // archipelago of tiny regions is measured as one.
    let mut stack: Vec<u16> = Vec::with_capacity(32);
    let mut trace: Vec<u16> = Vec::with_capacity(32);
    for i in 0..region_count {
        {
            let region = &mut regions[i as usize];
            if region.id == 0 || region.span_count == 0 || region.visited {
                continue;
            }
            region.visited = true;
        }

        let mut connects_to_border = false;
        let mut span_count = 0usize;
        stack.clear();
        trace.clear();
        stack.push(i);

        while let Some(region_index) = stack.pop() {
            trace.push(region_index);

            let connections = regions[region_index as usize].connections.clone();
            span_count += regions[region_index as usize].span_count;

            for connection in connections {
                if connection & BORDER_REGION != 0 {
                    connects_to_border = true;
                    continue;
                }
                if connection == 0 {
                    continue;
                }
                let connected = &mut regions[connection as usize];
                if connected.visited || connected.id == 0 {
                    continue;
                }
                connected.visited = true;
                stack.push(connected.id);
            }
        }

        if (span_count as u32) < settings.min_region_area && !connects_to_border {
            for region_index in trace.iter() {
                let region = &mut regions[*region_index as usize];
                region.span_count = 0;
                region.id = 0;
            }
        }
    }

    // Merge small regions into their smallest compatible neighbour until nothing moves.
    loop {
        let mut merged = false;

        for region_index in 0..regions.len() {
            {
                let region = &regions[region_index];
                if region.id == 0 || region.overlap || region.span_count == 0 {
                    continue;
                }
                let connected_to_border = region.connections.contains(&0)
                    || region
                        .connections
                        .iter()
                        .any(|connection| connection & BORDER_REGION != 0);
                if region.span_count as u32 > settings.merge_region_area && connected_to_border {
                    continue;
                }
            }

            let mut smallest_size = usize::MAX;
            let mut merge_id = None;
            {
                let region = &regions[region_index];
                for connection in &region.connections {
                    if *connection == 0 || connection & BORDER_REGION != 0 {
                        continue;
                    }
                    let other = &regions[*connection as usize];
                    if other.id == 0 || other.overlap {
                        continue;
                    }

                    if other.span_count < smallest_size
                        && can_merge_regions(region, other)
                        && can_merge_regions(other, region)
                    {
                        smallest_size = other.span_count;
                        merge_id = Some(other.id);
                    }
                }
            }

            if let Some(merge_id) = merge_id {
                let old_id = regions[region_index].id;

                if merge_region_into(&mut regions, region_index, merge_id as usize) {
                    // Fix up regions pointing at the merged-away id.
                    for region in regions.iter_mut() {
                        if region.id == 0 {
                            continue;
                        }
                        if region.id == old_id {
                            region.id = merge_id;
                        }
                        replace_region_references(region, old_id, merge_id);
                    }

                    merged = true;
                }
            }
        }

        if !merged {
            break;
        }
    }

    // Compress ids into a dense 1..=max_region range.
    for region in regions.iter_mut() {
        region.remap = region.id != 0;
    }

    let mut region_id_gen = 0u16;
    for i in 0..regions.len() {
        if !regions[i].remap {
            continue;
        }
        if region_id_gen == MAX_REGION_ID {
            return Err(RegionError::OversizedRegionCount);
        }
        region_id_gen += 1;

        let old_id = regions[i].id;
        let new_id = region_id_gen;
        for region in regions.iter_mut().skip(i) {
            if region.id == old_id {
                region.id = new_id;
                region.remap = false;
            }
        }
    }

    // Remap spans; border spans keep their flagged ids.
    for region in source_regions.iter_mut() {
        if *region & BORDER_REGION != 0 || *region == 0 {
            continue;
        }
        if *region >= region_count {
            warn!("Span carries region id {region} outside the allocated range.");
            continue;
        }
        *region = regions[*region as usize].id;
    }

    Ok(region_id_gen)
}

fn add_unique_floor(region: &mut Region, floor: u16) {
    if !region.floors.contains(&floor) {
        region.floors.push(floor);
    }
}

fn can_merge_regions(a: &Region, b: &Region) -> bool {
    if a.area != b.area {
        return false;
    }

    // A region connected to the other in more than one place would pinch itself when
    // spliced; a floor relationship means they overlap vertically.
    let connections = a
        .connections
        .iter()
        .filter(|connection| **connection == b.id)
        .count();
    connections == 1 && !a.floors.contains(&b.id) && !b.floors.contains(&a.id)
}

fn merge_region_into(regions: &mut [Region], region_index: usize, target_index: usize) -> bool {
    let merged_connections = {
        let region = &regions[region_index];
        let target = &regions[target_index];

        let Some(insert_point_target) = target
            .connections
            .iter()
            .position(|id| *id == region.id)
        else {
            return false;
        };
        let Some(insert_point_region) = region
            .connections
            .iter()
            .position(|id| *id == target.id)
        else {
            return false;
        };

        // Splice the two connection rings together at the shared edge.
        let mut merged =
            Vec::with_capacity(target.connections.len() + region.connections.len() - 2);
        let size = target.connections.len() - 1;
        for i in 0..size {
            merged.push(target.connections[(insert_point_target + 1 + i) % target.connections.len()]);
        }
        let size = region.connections.len() - 1;
        for i in 0..size {
            merged.push(region.connections[(insert_point_region + 1 + i) % region.connections.len()]);
        }

        merged
    };

    let (merged_span_count, merged_floors) = {
        let region = &mut regions[region_index];
        region.connections.clear();

        let span_count = region.span_count;
        region.span_count = 0;

        (span_count, std::mem::take(&mut region.floors))
    };

    {
        let target = &mut regions[target_index];
        target.span_count += merged_span_count;
        target.connections = merged_connections;
        remove_adjacent_duplicate_connections(target);

        for floor in merged_floors {
            add_unique_floor(target, floor);
        }
    }

    true
}

fn replace_region_references(region: &mut Region, old_id: u16, new_id: u16) {
    let mut connection_changed = false;
    for connection in region.connections.iter_mut() {
        if *connection == old_id {
            *connection = new_id;
            connection_changed = true;
        }
    }
    for floor in region.floors.iter_mut() {
        if *floor == old_id {
            *floor = new_id;
        }
    }
    if connection_changed {
        remove_adjacent_duplicate_connections(region);
    }
}

fn remove_adjacent_duplicate_connections(region: &mut Region) {
    let mut i = 0;
    while region.connections.len() > 1 && i < region.connections.len() {
        let next_index = (i + 1) % region.connections.len();
        if region.connections[i] == region.connections[next_index] {
            region.connections.remove(next_index);
        } else {
            i += 1;
        }
    }
}

fn is_solid_edge(
    compact: &CompactHeightfield,
    regions: &[u16],
    cell_index: usize,
    span_index: usize,
    dir: usize,
) -> bool {
    match compact.connected_span_index(cell_index, span_index, dir) {
        Some(other_index) => regions[other_index] != regions[span_index],
        None => true,
    }
}

/// Walks a region's boundary collecting the sequence of neighbouring region ids, one
/// entry per change.
fn walk_region_connections(
    compact: &CompactHeightfield,
    regions: &[u16],
    mut cell_index: usize,
    mut span_index: usize,
    mut dir: usize,
    connections: &mut Vec<u16>,
) {
    let start_direction = dir;
    let start_span = span_index;

    let mut current_region = 0;
    if let Some(other_index) = compact.connected_span_index(cell_index, span_index, dir) {
        current_region = regions[other_index];
    }
    connections.push(current_region);

    // The walk revisits the start span once per outgoing direction at most; the cap
    // guards against link corruption.
    let mut iter = 0;
    while iter < 40_000 {
        iter += 1;

        if is_solid_edge(compact, regions, cell_index, span_index, dir) {
            let mut region = 0;
            if let Some(other_index) = compact.connected_span_index(cell_index, span_index, dir) {
                region = regions[other_index];
            }
            if region != current_region {
                current_region = region;
                connections.push(region);
            }

            dir = (dir + 1) & 0x3; // Rotate clock-wise.
        } else {
            let Some(other_index) = compact.connected_span_index(cell_index, span_index, dir)
            else {
                return;
            };
            span_index = other_index;
            cell_index = get_neighbour_index(compact.width as usize, cell_index, dir);
            dir = (dir + 3) & 0x3; // Rotate COUNTER clock-wise.
        }

        if start_span == span_index && start_direction == dir {
            break;
        }
    }

    if iter == 40_000 {
        warn!("Region connection walk failed to close at span {start_span}; heightfield links may be corrupt.");
    }

    // Remove adjacent duplicates.
    if connections.len() > 2 {
        let mut i = 0;
        while i < connections.len() {
            let next_index = (i + 1) % connections.len();
            if connections[i] == connections[next_index] {
                connections.remove(next_index);
            } else {
                i += 1;
            }
        }
    }
}
