//! End-to-end bakes of small hand-built worlds, checking the cross-stage invariants a
//! consumer of the mesh gets to rely on.

use baked_navigation::{
    build_nav_mesh,
    compact::{build_compact_heightfield, build_distance_field, erode_walkable_area},
    heightfields::{
        filter_ledge_spans, filter_low_hanging_walkable_obstacles,
        filter_walkable_low_height_spans, rasterize_triangles, Heightfield,
    },
    mesher::{portal_direction, PolyMesh},
    regions::build_regions,
    DetailMeshSettings, NavMeshSettings, TriangleIndices, NULL_INDEX, WALKABLE_AREA,
};
use bevy::math::Vec3;

fn unit_settings() -> NavMeshSettings {
    let mut settings = NavMeshSettings::from_agent(0.5, 1.8, 0.4);
    settings.cell_width = 1.0;
    settings.cell_height = 1.0;
    settings.walkable_height = 3;
    settings.step_height = 2;
    settings.walkable_radius = 0;
    settings.min_region_area = 2;
    settings.merge_region_area = 100;
    settings.max_contour_simplification_error = 1.3;
    settings.max_edge_length = 0;
    settings
}

fn quad(min_x: f32, min_z: f32, side_x: f32, side_z: f32, y: f32) -> ([Vec3; 4], [[u32; 3]; 2]) {
    (
        [
            Vec3::new(min_x, y, min_z),
            Vec3::new(min_x + side_x, y, min_z),
            Vec3::new(min_x + side_x, y, min_z + side_z),
            Vec3::new(min_x, y, min_z + side_z),
        ],
        [[0, 2, 1], [0, 3, 2]],
    )
}

fn rasterize_quad(heightfield: &mut Heightfield, vertices: &[Vec3; 4], indices: &[[u32; 3]; 2]) {
    rasterize_triangles(
        heightfield,
        vertices,
        TriangleIndices::U32(indices),
        &[WALKABLE_AREA; 2],
        1,
    )
    .unwrap();
}

/// Invariant: every polygon is convex on the XZ-plane with 3..=nvp vertices.
fn assert_polygons_convex(mesh: &PolyMesh) {
    for polygon in 0..mesh.polygon_count() {
        let vertices = mesh.polygon_vertices(polygon);
        let count = mesh.polygon_vertex_count(polygon);
        assert!(
            (3..=mesh.vertices_per_polygon).contains(&count),
            "polygon {polygon} has {count} vertices"
        );

        for i in 0..count {
            let a = mesh.vertices[vertices[i] as usize];
            let b = mesh.vertices[vertices[(i + 1) % count] as usize];
            let c = mesh.vertices[vertices[(i + 2) % count] as usize];
            let cross = (b.x as i32 - a.x as i32) * (c.z as i32 - a.z as i32)
                - (c.x as i32 - a.x as i32) * (b.z as i32 - a.z as i32);
            assert!(
                cross <= 0,
                "polygon {polygon} corner {i} is concave (cross = {cross})"
            );
        }
    }
}

/// Invariant: shared edges carry symmetric back-pointers, open edges carry NULL_INDEX
/// or a portal code. Cross-scans the whole mesh by unordered vertex pair.
fn assert_adjacency_symmetric(mesh: &PolyMesh) {
    use std::collections::HashMap;

    let mut edge_owners: HashMap<(u16, u16), Vec<(usize, usize)>> = HashMap::new();
    for polygon in 0..mesh.polygon_count() {
        let vertices = mesh.polygon_vertices(polygon);
        let count = mesh.polygon_vertex_count(polygon);
        for edge in 0..count {
            let a = vertices[edge];
            let b = vertices[(edge + 1) % count];
            let key = (a.min(b), a.max(b));
            edge_owners.entry(key).or_default().push((polygon, edge));
        }
    }

    for (key, owners) in edge_owners {
        match owners.as_slice() {
            [(polygon, edge)] => {
                let neighbour = mesh.polygon_neighbours(*polygon)[*edge];
                assert!(
                    neighbour == NULL_INDEX || portal_direction(neighbour).is_some(),
                    "boundary edge {key:?} of polygon {polygon} has neighbour {neighbour}"
                );
            }
            [(polygon_a, edge_a), (polygon_b, edge_b)] => {
                assert_eq!(
                    mesh.polygon_neighbours(*polygon_a)[*edge_a],
                    *polygon_b as u16,
                    "edge {key:?}"
                );
                assert_eq!(
                    mesh.polygon_neighbours(*polygon_b)[*edge_b],
                    *polygon_a as u16,
                    "edge {key:?}"
                );
            }
            more => panic!("edge {key:?} is shared by {} polygons", more.len()),
        }
    }
}

#[test]
fn single_triangle_bakes_to_a_triangle_footprint() {
    let settings = unit_settings();

    let vertices = [
        Vec3::new(0.0, 0.0, 0.0),
        Vec3::new(10.0, 0.0, 0.0),
        Vec3::new(0.0, 0.0, 10.0),
    ];
    let indices = [[0u32, 2, 1]];

    // Heightfield expectations first: one span per covered column.
    let mut heightfield =
        Heightfield::new(&settings, Vec3::ZERO, Vec3::new(10.0, 5.0, 10.0)).unwrap();
    rasterize_triangles(
        &mut heightfield,
        &vertices,
        TriangleIndices::U32(&indices),
        &[WALKABLE_AREA],
        settings.step_height,
    )
    .unwrap();

    let mut covered = 0;
    for z in 0..10 {
        for x in 0..10 {
            let spans: Vec<_> = heightfield.spans_in_column(x, z).collect();
            if x + z <= 9 {
                assert_eq!(spans.len(), 1, "column ({x}, {z})");
                assert_eq!(spans[0].smin(), 0);
                assert_eq!(spans[0].smax(), 1);
                assert_eq!(spans[0].area(), WALKABLE_AREA);
                covered += 1;
            } else {
                assert!(spans.is_empty(), "column ({x}, {z})");
            }
        }
    }
    assert_eq!(covered, 55);

    // Geometry stages (no rim filtering; the triangle drops into the void on every
    // side): one region, one triangular polygon at the quantized corners.
    let mut compact = build_compact_heightfield(&settings, &heightfield);
    build_distance_field(&mut compact);
    build_regions(&mut compact, &settings).unwrap();
    assert_eq!(compact.max_region, 1);

    let contour_set = baked_navigation::contour::build_contours(&compact, &settings);
    let mesh = baked_navigation::mesher::build_poly_mesh(&contour_set, &settings).unwrap();

    assert_eq!(mesh.polygon_count(), 1);
    assert_eq!(mesh.polygon_vertex_count(0), 3);
    assert_polygons_convex(&mesh);
    assert_adjacency_symmetric(&mesh);

    // The two axis-aligned corners survive exactly; the hypotenuse corner lands within
    // a cell of (10, 0) after staircase simplification.
    assert!(mesh.vertices.iter().any(|v| v.x == 0 && v.z == 0));
    assert!(mesh.vertices.iter().any(|v| v.x == 0 && v.z == 10));
    assert_eq!(mesh.vertices.iter().map(|v| v.x).max().unwrap(), 10);
}

#[test]
fn thin_step_connects_into_one_region() {
    let mut settings = unit_settings();
    settings.cell_height = 0.2;
    settings.step_height = 2;
    settings.walkable_height = 10;

    let mut heightfield =
        Heightfield::new(&settings, Vec3::ZERO, Vec3::new(10.0, 5.0, 5.0)).unwrap();
    let (low, low_indices) = quad(0.0, 0.0, 5.0, 5.0, 0.0);
    let (high, high_indices) = quad(5.0, 0.0, 5.0, 5.0, 0.3);
    rasterize_quad(&mut heightfield, &low, &low_indices);
    rasterize_quad(&mut heightfield, &high, &high_indices);

    // Both sides rasterized at their own height.
    assert_eq!(heightfield.spans_in_column(0, 0).next().unwrap().smax(), 1);
    assert_eq!(heightfield.spans_in_column(5, 0).next().unwrap().smax(), 2);

    filter_low_hanging_walkable_obstacles(&mut heightfield, settings.step_height);
    filter_ledge_spans(
        &mut heightfield,
        settings.walkable_height,
        settings.step_height,
    );
    filter_walkable_low_height_spans(&mut heightfield, settings.walkable_height);

    let mut compact = build_compact_heightfield(&settings, &heightfield);
    erode_walkable_area(&mut compact, settings.walkable_radius);
    build_distance_field(&mut compact);
    build_regions(&mut compact, &settings).unwrap();

    // One region spanning both quads: the step is within climbing range.
    assert_eq!(compact.max_region, 1);
    for span in compact.spans.iter() {
        assert_eq!(span.region, 1);
    }
}

#[test]
fn ledge_rim_is_cleared_on_the_drop_side() {
    let settings = unit_settings();

    // Full ground floor with a 4x4 plateau ten units up.
    let mut heightfield =
        Heightfield::new(&settings, Vec3::ZERO, Vec3::new(8.0, 20.0, 8.0)).unwrap();
    let (floor, floor_indices) = quad(0.0, 0.0, 8.0, 8.0, 0.0);
    let (plateau, plateau_indices) = quad(2.0, 2.0, 4.0, 4.0, 10.0);
    rasterize_quad(&mut heightfield, &floor, &floor_indices);
    rasterize_quad(&mut heightfield, &plateau, &plateau_indices);

    filter_ledge_spans(&mut heightfield, 3, 1);

    for z in 2..6 {
        for x in 2..6 {
            let spans: Vec<_> = heightfield.spans_in_column(x, z).collect();
            assert_eq!(spans.len(), 2, "column ({x}, {z})");

            let rim = x == 2 || x == 5 || z == 2 || z == 5;
            let plateau_area = spans[1].area();
            if rim {
                assert_eq!(plateau_area, 0, "rim column ({x}, {z}) kept its area");
            } else {
                assert_eq!(
                    plateau_area, WALKABLE_AREA,
                    "interior column ({x}, {z}) was cleared"
                );
            }
        }
    }
}

#[test]
fn filters_are_idempotent_on_a_step_scene() {
    let settings = unit_settings();

    let mut heightfield =
        Heightfield::new(&settings, Vec3::ZERO, Vec3::new(8.0, 20.0, 8.0)).unwrap();
    let (floor, floor_indices) = quad(0.0, 0.0, 8.0, 8.0, 0.0);
    let (step, step_indices) = quad(3.0, 3.0, 2.0, 2.0, 1.5);
    rasterize_quad(&mut heightfield, &floor, &floor_indices);
    rasterize_quad(&mut heightfield, &step, &step_indices);

    let snapshot = |heightfield: &Heightfield| -> Vec<Vec<(u16, u16, u8)>> {
        (0..8)
            .flat_map(|z| (0..8).map(move |x| (x, z)))
            .map(|(x, z)| {
                heightfield
                    .spans_in_column(x, z)
                    .map(|span| (span.smin(), span.smax(), span.area()))
                    .collect()
            })
            .collect()
    };

    filter_low_hanging_walkable_obstacles(&mut heightfield, settings.step_height);
    filter_ledge_spans(
        &mut heightfield,
        settings.walkable_height,
        settings.step_height,
    );
    filter_walkable_low_height_spans(&mut heightfield, settings.walkable_height);
    let once = snapshot(&heightfield);

    filter_low_hanging_walkable_obstacles(&mut heightfield, settings.step_height);
    filter_ledge_spans(
        &mut heightfield,
        settings.walkable_height,
        settings.step_height,
    );
    filter_walkable_low_height_spans(&mut heightfield, settings.walkable_height);
    let twice = snapshot(&heightfield);

    assert_eq!(once, twice);
}

#[test]
fn unit_square_round_trips_through_the_rasterizer() {
    let settings = unit_settings();
    let height = 5.0;

    let mut heightfield =
        Heightfield::new(&settings, Vec3::ZERO, Vec3::new(4.0, 10.0, 4.0)).unwrap();
    let (square, indices) = quad(1.0, 1.0, 1.0, 1.0, height);
    rasterize_quad(&mut heightfield, &square, &indices);

    for z in 0..4 {
        for x in 0..4 {
            let spans: Vec<_> = heightfield.spans_in_column(x, z).collect();
            if x == 1 && z == 1 {
                assert_eq!(spans.len(), 1);
                assert_eq!(spans[0].smin(), height as u16);
                assert_eq!(spans[0].smax(), height as u16 + 1);
            } else {
                assert!(spans.is_empty(), "column ({x}, {z})");
            }
        }
    }
}

#[test]
fn l_shaped_world_meets_every_mesh_invariant() {
    let settings = unit_settings();

    // Two overlapping quads forming an L.
    let mut vertices = Vec::new();
    let mut indices: Vec<[u32; 3]> = Vec::new();
    for (quad_vertices, quad_indices) in [
        quad(0.0, 0.0, 12.0, 6.0, 0.0),
        quad(0.0, 0.0, 6.0, 12.0, 0.0),
    ] {
        let base = vertices.len() as u32;
        vertices.extend(quad_vertices);
        indices.extend(
            quad_indices
                .iter()
                .map(|[a, b, c]| [a + base, b + base, c + base]),
        );
    }

    let (mesh, _) = build_nav_mesh(
        &settings,
        Vec3::ZERO,
        Vec3::new(12.0, 5.0, 12.0),
        &vertices,
        TriangleIndices::U32(&indices),
        None,
    )
    .unwrap();

    assert!(mesh.polygon_count() >= 2, "an L cannot be one convex polygon");
    assert_polygons_convex(&mesh);
    assert_adjacency_symmetric(&mesh);

    // Every polygon landed in a real region with the walkable area id.
    for polygon in 0..mesh.polygon_count() {
        assert_ne!(mesh.regions[polygon], 0);
        assert_eq!(mesh.areas[polygon], WALKABLE_AREA);
    }
}

#[test]
fn detail_mesh_spans_every_polygon_of_a_two_level_world() {
    let mut settings = unit_settings();
    settings.detail = Some(DetailMeshSettings {
        sample_distance: 2.0,
        max_sample_error: 0.5,
        deadline: None,
        polygon_deadline: None,
    });

    let mut vertices = Vec::new();
    let mut indices: Vec<[u32; 3]> = Vec::new();
    for (quad_vertices, quad_indices) in [
        quad(0.0, 0.0, 16.0, 16.0, 0.0),
        quad(4.0, 4.0, 4.0, 4.0, 1.5),
    ] {
        let base = vertices.len() as u32;
        vertices.extend(quad_vertices);
        indices.extend(
            quad_indices
                .iter()
                .map(|[a, b, c]| [a + base, b + base, c + base]),
        );
    }

    let (mesh, detail) = build_nav_mesh(
        &settings,
        Vec3::ZERO,
        Vec3::new(16.0, 8.0, 16.0),
        &vertices,
        TriangleIndices::U32(&indices),
        None,
    )
    .unwrap();

    let detail = detail.expect("detail settings were provided");
    assert!(!detail.timed_out);
    assert_eq!(detail.meshes.len(), mesh.polygon_count());

    for (polygon, [vert_base, vert_count, tri_base, tri_count]) in
        detail.meshes.iter().enumerate()
    {
        assert!(*tri_count >= 1, "polygon {polygon} has no detail triangles");

        // Triangle indices stay inside the submesh.
        for triangle in &detail.triangles[*tri_base as usize..(*tri_base + *tri_count) as usize] {
            for vertex in &triangle[..3] {
                assert!((*vertex as u32) < *vert_count);
            }
        }

        // The submesh starts with the base polygon's corners.
        let base_count = mesh.polygon_vertex_count(polygon);
        assert!(*vert_count as usize >= base_count);
        for (offset, &vertex) in mesh.polygon_vertices(polygon)[..base_count].iter().enumerate() {
            let grid = mesh.vertices[vertex as usize];
            let world = detail.vertices[*vert_base as usize + offset];
            assert!((world.x - grid.x as f32 * settings.cell_width).abs() < 1e-3);
            assert!((world.z - grid.z as f32 * settings.cell_width).abs() < 1e-3);
        }
    }
}

#[test]
fn bordered_tile_exposes_portal_edges() {
    let mut settings = unit_settings();
    settings.border_size = 2;
    settings.tile_size = 8;

    // Geometry overhangs the tile by the border on every side.
    let (vertices, indices) = quad(0.0, 0.0, 12.0, 12.0, 0.5);

    let (mesh, _) = build_nav_mesh(
        &settings,
        Vec3::ZERO,
        Vec3::new(12.0, 5.0, 12.0),
        &vertices,
        TriangleIndices::U32(&indices),
        None,
    )
    .unwrap();

    assert!(mesh.polygon_count() >= 1);
    assert_polygons_convex(&mesh);
    assert_adjacency_symmetric(&mesh);

    // The walkable interior reaches all four tile sides, so all four portal
    // directions appear.
    let mut directions = std::collections::HashSet::new();
    for polygon in 0..mesh.polygon_count() {
        for neighbour in mesh.polygon_neighbours(polygon) {
            if let Some(direction) = portal_direction(*neighbour) {
                directions.insert(direction);
            }
        }
    }
    assert_eq!(directions.len(), 4);

    // All mesh vertices are inside the un-bordered tile.
    for vertex in &mesh.vertices {
        assert!(vertex.x <= 8);
        assert!(vertex.z <= 8);
    }
}
