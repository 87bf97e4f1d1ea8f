//! Offline nav-mesh baking for 3D worlds.
//!
//! Takes in a triangle soup of world geometry plus agent parameters and bakes a compact
//! convex-polygon navigation mesh, optionally with a height-corrected detail mesh on top.
//!
//! ## Quick-start:
//! 1. Fill out a [NavMeshSettings] (or start from [NavMeshSettings::from_agent]).
//! 2. Classify your triangles with [mark_walkable_triangles], or supply your own area ids.
//! 3. Call [build_nav_mesh] with the world bounds, vertices, & indices.
//!
//! The pipeline runs in seven stages, each consuming the previous stage's output:
//! rasterization into a [Heightfield](heightfields::Heightfield), walkability filtering,
//! compaction into a [CompactHeightfield](compact::CompactHeightfield), watershed region
//! partitioning, contour tracing, polygonization into a [PolyMesh], and optionally detail
//! triangulation into a [PolyMeshDetail]. The individual stage functions are public so
//! callers can run a partial pipeline or inspect intermediate data.
//!
//! Baking a single tile is strictly single-threaded; baking many tiles in parallel is the
//! caller's job. Nothing in here is shared between bakes.

use bevy::math::Vec3;
use thiserror::Error;

use compact::{
    build_compact_heightfield, build_distance_field, erode_walkable_area,
    median_filter_walkable_area,
};
use contour::build_contours;
use heightfields::{
    filter_ledge_spans, filter_low_hanging_walkable_obstacles, filter_walkable_low_height_spans,
    rasterize_triangles, Heightfield,
};
use mesher::build_poly_mesh;
use regions::build_regions;

#[cfg(feature = "trace")]
use bevy::log::info_span;

pub mod compact;
pub mod contour;
pub mod detail_mesh;
pub mod heightfields;
pub mod layers;
mod math;
pub mod mesher;
pub mod regions;

pub use detail_mesh::{build_poly_mesh_detail, PolyMeshDetail};
pub use heightfields::{clear_unwalkable_triangles, mark_walkable_triangles, TriangleIndices};
pub use mesher::PolyMesh;

/// Area id for anything an agent cannot stand on. Spans with this area are carried through
/// the heightfield (they still block head-room) but never end up in the nav-mesh.
pub const NULL_AREA: u8 = 0;
/// Default area id assigned to walkable triangles. The highest id the 6-bit span area
/// field can hold; merging spans keeps the higher id.
pub const WALKABLE_AREA: u8 = 63;

/// High bit of a region id, marking the synthetic regions painted onto the tile border.
/// Border regions never produce contours.
pub const BORDER_REGION: u16 = 0x8000;
/// Sentinel index in the polygon table: terminates short vertex lists and marks edges
/// without a neighbour.
pub const NULL_INDEX: u16 = 0xffff;

/// Hard cap on [NavMeshSettings::max_vertices_per_polygon], matching what runtime layers
/// commonly support.
pub const MAX_VERTICES_PER_POLYGON: u8 = 6;

pub(crate) const MASK_CONTOUR_REGION: i32 = 0xffff;
pub(crate) const FLAG_BORDER_VERTEX: i32 = 0x10000;
pub(crate) const FLAG_AREA_BORDER: i32 = 0x20000;

/*
*   Neighbours:
*   0: (-1, 0),
*   1: (0, 1),
*   2: (1, 0),
*   3: (0, -1)
*/
pub(crate) const DIR_OFFSET_X: [i32; 4] = [-1, 0, 1, 0];
pub(crate) const DIR_OFFSET_Z: [i32; 4] = [0, 1, 0, -1];

pub(crate) fn get_neighbour_index(width: usize, index: usize, dir: usize) -> usize {
    match dir {
        0 => index - 1,
        1 => index + width,
        2 => index + 1,
        3 => index - width,
        _ => panic!("Not a valid direction"),
    }
}

/// Settings for generating height-corrected detail meshes.
#[derive(Clone, Debug, PartialEq)]
pub struct DetailMeshSettings {
    /// Spacing (in world units) between height samples laid onto polygon edges and
    /// interiors. Zero disables sampling entirely and the detail mesh degenerates to the
    /// base polygons.
    ///
    /// **Suggested value**: >= 0.9, commonly several cell widths. Start high & reduce as
    /// needed.
    pub sample_distance: f32,
    /// The maximum acceptable vertical error between the detail mesh & the voxelized
    /// surface, in world units.
    pub max_sample_error: f32,
    /// Optional budget for the whole detail stage. When exceeded the stage stops at a
    /// polygon boundary and returns the partial mesh with
    /// [PolyMeshDetail::timed_out] set.
    pub deadline: Option<std::time::Duration>,
    /// Optional budget for a single polygon, for when one degenerate polygon explodes in
    /// samples.
    pub polygon_deadline: Option<std::time::Duration>,
}

impl Default for DetailMeshSettings {
    fn default() -> Self {
        Self {
            sample_distance: 1.0,
            max_sample_error: 0.25,
            deadline: None,
            polygon_deadline: None,
        }
    }
}

/// Settings for nav-mesh generation.
#[derive(Clone, Debug, PartialEq)]
pub struct NavMeshSettings {
    /// The horizontal resolution of the voxel grid in world units.
    ///
    /// **Suggested value**: 1/2 of agent radius.
    pub cell_width: f32,
    /// The vertical resolution of the voxel grid in world units.
    ///
    /// **Suggested value**: 1/2 of `cell_width`.
    pub cell_height: f32,

    /// Maximum incline/slope traversable when navigating, in radians.
    pub max_traversable_slope_radians: f32,
    /// Minimum open height for an area to be considered walkable, in cell_height(s).
    ///
    /// **Suggested value**: agent height divided by `cell_height`, rounded up. Must be at
    /// least 3.
    pub walkable_height: u16,
    /// This will "pull-back" the nav-mesh from edges, meaning anywhere on the nav-mesh
    /// will be walkable for an agent with a radius of ``walkable_radius * cell_width``.
    pub walkable_radius: u16,
    /// Maximum height difference that is still considered traversable, in
    /// cell_height(s). This smooths out stair steps and small ledges.
    pub step_height: u16,

    /// Minimum size of a region in cells; anything smaller and not connected to the tile
    /// border is removed. Filters out small disconnected islands on tables and ledges.
    pub min_region_area: u32,
    /// Regions smaller than this are merged into a neighbouring region when possible.
    pub merge_region_area: u32,

    /// Maximum length of a contour edge (in cells) before it is split.
    ///
    /// A value of zero disables edge splitting.
    pub max_edge_length: u16,
    /// Maximum deviation allowed when simplifying contours on the XZ-plane, in
    /// cell_width(s).
    ///
    /// **Suggested value range**: `[1.1, 1.5]`
    pub max_contour_simplification_error: f32,

    /// Maximum vertices per nav-mesh polygon, within `[3, MAX_VERTICES_PER_POLYGON]`.
    /// 3 produces a pure triangle mesh.
    pub max_vertices_per_polygon: u8,

    /// Width of the non-navigable rim (in cells) rasterized around the tile so that
    /// erosion and region building see the geometry of neighbouring tiles. Zero for a
    /// standalone bake.
    pub border_size: u16,
    /// Side length of a tile in cells, used only to mark portal edges for tile stitching.
    /// Zero for a standalone bake.
    pub tile_size: u16,

    /// When set, build a height-corrected detail mesh on top of the polygon mesh. Helps
    /// on bumpy shapes like terrain but comes at a generation cost.
    pub detail: Option<DetailMeshSettings>,
}

/// A [NavMeshSettings] field failed validation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SettingsError {
    #[error("cell_width must be a positive number, got {0}")]
    InvalidCellWidth(f32),
    #[error("cell_height must be a positive number, got {0}")]
    InvalidCellHeight(f32),
    #[error("max_traversable_slope_radians must lie within [0, PI/2], got {0}")]
    InvalidSlope(f32),
    #[error("walkable_height must be at least 3 cells, got {0}")]
    InvalidWalkableHeight(u16),
    #[error("max_vertices_per_polygon must lie within [3, {MAX_VERTICES_PER_POLYGON}], got {0}")]
    InvalidVerticesPerPolygon(u8),
    #[error("detail sample_distance must be zero or at least 0.9, got {0}")]
    InvalidSampleDistance(f32),
}

impl NavMeshSettings {
    /// Helper for creating nav-mesh settings with reasonable defaults from the size of
    /// your navigation agent.
    #[inline]
    pub fn from_agent(agent_radius: f32, agent_height: f32, agent_max_climb: f32) -> Self {
        let cell_width = agent_radius / 2.0;
        let cell_height = cell_width / 2.0;

        Self {
            cell_width,
            cell_height,
            max_traversable_slope_radians: 45.0_f32.to_radians(),
            walkable_height: (agent_height / cell_height).ceil() as u16,
            walkable_radius: (agent_radius / cell_width).ceil() as u16,
            step_height: (agent_max_climb / cell_height).floor() as u16,
            min_region_area: 64,
            merge_region_area: 400,
            max_edge_length: 80,
            max_contour_simplification_error: 1.3,
            max_vertices_per_polygon: MAX_VERTICES_PER_POLYGON,
            border_size: 0,
            tile_size: 0,
            detail: None,
        }
    }

    /// Setter for [`NavMeshSettings::max_traversable_slope_radians`]
    pub fn with_traversable_slope(mut self, slope_radians: f32) -> Self {
        self.max_traversable_slope_radians = slope_radians;

        self
    }
    /// Setter for [`NavMeshSettings::step_height`]
    pub fn with_step_height(mut self, step_height: u16) -> Self {
        self.step_height = step_height;

        self
    }
    /// Setter for [`NavMeshSettings::min_region_area`] & [`NavMeshSettings::merge_region_area`]
    pub fn with_region_area(mut self, min_region_area: u32, merge_region_area: u32) -> Self {
        self.min_region_area = min_region_area;
        self.merge_region_area = merge_region_area;

        self
    }
    /// Setter for [`NavMeshSettings::max_edge_length`]
    pub fn with_max_edge_length(mut self, max_edge_length: u16) -> Self {
        self.max_edge_length = max_edge_length;

        self
    }
    /// Setter for [`NavMeshSettings::max_vertices_per_polygon`]
    pub fn with_max_vertices_per_polygon(mut self, max_vertices_per_polygon: u8) -> Self {
        self.max_vertices_per_polygon = max_vertices_per_polygon;

        self
    }
    /// Setter for [`NavMeshSettings::border_size`] & [`NavMeshSettings::tile_size`]
    pub fn with_tiling(mut self, tile_size: u16, border_size: u16) -> Self {
        self.tile_size = tile_size;
        self.border_size = border_size;

        self
    }
    /// Setter for [`NavMeshSettings::detail`]
    pub fn with_detail_mesh(mut self, detail: DetailMeshSettings) -> Self {
        self.detail = Some(detail);

        self
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(self.cell_width > 0.0 && self.cell_width.is_finite()) {
            return Err(SettingsError::InvalidCellWidth(self.cell_width));
        }
        if !(self.cell_height > 0.0 && self.cell_height.is_finite()) {
            return Err(SettingsError::InvalidCellHeight(self.cell_height));
        }
        if !(0.0..=std::f32::consts::FRAC_PI_2).contains(&self.max_traversable_slope_radians) {
            return Err(SettingsError::InvalidSlope(
                self.max_traversable_slope_radians,
            ));
        }
        if self.walkable_height < 3 {
            return Err(SettingsError::InvalidWalkableHeight(self.walkable_height));
        }
        if !(3..=MAX_VERTICES_PER_POLYGON).contains(&self.max_vertices_per_polygon) {
            return Err(SettingsError::InvalidVerticesPerPolygon(
                self.max_vertices_per_polygon,
            ));
        }
        if let Some(detail) = &self.detail {
            if detail.sample_distance != 0.0 && detail.sample_distance < 0.9 {
                return Err(SettingsError::InvalidSampleDistance(detail.sample_distance));
            }
        }

        Ok(())
    }
}

/// Any failure along the baking pipeline. Stages that only degrade (skipped contours,
/// triangulation fallbacks, capped loops) log a warning instead of erroring.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Rasterization(#[from] heightfields::RasterizationError),
    #[error(transparent)]
    Regions(#[from] regions::RegionError),
    #[error(transparent)]
    Mesher(#[from] mesher::MeshError),
}

/// Bakes world geometry into a nav-mesh in one call, running every pipeline stage in
/// order.
///
/// `area_ids` carries one area id per triangle; pass `None` to classify triangles by
/// slope against [NavMeshSettings::max_traversable_slope_radians] instead.
pub fn build_nav_mesh(
    settings: &NavMeshSettings,
    min_bound: Vec3,
    max_bound: Vec3,
    vertices: &[Vec3],
    indices: TriangleIndices,
    area_ids: Option<&[u8]>,
) -> Result<(PolyMesh, Option<PolyMeshDetail>), BuildError> {
    settings.validate()?;

    let marked_areas;
    let area_ids = match area_ids {
        Some(areas) => areas,
        None => {
            let mut areas = vec![NULL_AREA; indices.triangle_count()];
            mark_walkable_triangles(settings, vertices, indices, &mut areas);
            marked_areas = areas;
            &marked_areas
        }
    };

    let mut heightfield = {
        #[cfg(feature = "trace")]
        let _span = info_span!("Rasterize triangles").entered();

        let mut heightfield = Heightfield::new(settings, min_bound, max_bound)?;
        rasterize_triangles(
            &mut heightfield,
            vertices,
            indices,
            area_ids,
            settings.step_height,
        )?;
        heightfield
    };

    {
        #[cfg(feature = "trace")]
        let _span = info_span!("Filter walkable surfaces").entered();

        filter_low_hanging_walkable_obstacles(&mut heightfield, settings.step_height);
        filter_ledge_spans(
            &mut heightfield,
            settings.walkable_height,
            settings.step_height,
        );
        filter_walkable_low_height_spans(&mut heightfield, settings.walkable_height);
    }

    let mut compact = {
        #[cfg(feature = "trace")]
        let _span = info_span!("Build compact heightfield").entered();

        build_compact_heightfield(settings, &heightfield)
    };
    drop(heightfield);

    {
        #[cfg(feature = "trace")]
        let _span = info_span!("Erode walkable area").entered();

        erode_walkable_area(&mut compact, settings.walkable_radius);
        median_filter_walkable_area(&mut compact);
    }

    {
        #[cfg(feature = "trace")]
        let _span = info_span!("Build distance field").entered();

        build_distance_field(&mut compact);
    }

    {
        #[cfg(feature = "trace")]
        let _span = info_span!("Build regions").entered();

        build_regions(&mut compact, settings)?;
    }

    let contour_set = {
        #[cfg(feature = "trace")]
        let _span = info_span!("Build contours").entered();

        build_contours(&compact, settings)
    };

    let poly_mesh = {
        #[cfg(feature = "trace")]
        let _span = info_span!("Build poly mesh").entered();

        build_poly_mesh(&contour_set, settings)?
    };

    let detail_mesh = if settings.detail.is_some() {
        #[cfg(feature = "trace")]
        let _span = info_span!("Build detail mesh").entered();

        Some(build_poly_mesh_detail(settings, &poly_mesh, &compact))
    } else {
        None
    };

    Ok((poly_mesh, detail_mesh))
}
