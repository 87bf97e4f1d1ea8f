use baked_navigation::{
    build_nav_mesh, DetailMeshSettings, NavMeshSettings, TriangleIndices,
};
use bevy::math::Vec3;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn quad(min_x: f32, min_z: f32, side_x: f32, side_z: f32, y: f32, vertices: &mut Vec<Vec3>, indices: &mut Vec<[u32; 3]>) {
    let base = vertices.len() as u32;
    vertices.extend([
        Vec3::new(min_x, y, min_z),
        Vec3::new(min_x + side_x, y, min_z),
        Vec3::new(min_x + side_x, y, min_z + side_z),
        Vec3::new(min_x, y, min_z + side_z),
    ]);
    indices.extend([[base, base + 2, base + 1], [base, base + 3, base + 2]]);
}

fn settings() -> NavMeshSettings {
    let mut settings = NavMeshSettings::from_agent(0.5, 1.8, 0.4);
    settings.cell_width = 0.25;
    settings.cell_height = 0.1;
    settings.walkable_height = 20;
    settings.walkable_radius = 1;
    settings.step_height = 3;
    settings.min_region_area = 100;
    settings.merge_region_area = 500;
    settings.max_contour_simplification_error = 1.1;
    settings.max_edge_length = 80;
    settings
}

fn generate_single_plane() {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();
    quad(0.0, 0.0, 20.0, 20.0, 0.2, &mut vertices, &mut indices);

    black_box(
        build_nav_mesh(
            &settings(),
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(20.0, 4.0, 20.0),
            &vertices,
            TriangleIndices::U32(&indices),
            None,
        )
        .unwrap(),
    );
}

fn generate_plane_with_obstacles() {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();
    quad(0.0, 0.0, 20.0, 20.0, 0.2, &mut vertices, &mut indices);
    quad(4.0, 9.0, 2.0, 2.0, 2.0, &mut vertices, &mut indices);
    quad(14.0, 4.0, 8.0, 2.0, 2.0, &mut vertices, &mut indices);
    quad(6.5, 6.5, 2.0, 2.0, 4.0, &mut vertices, &mut indices);
    quad(6.5, 11.0, 2.0, 2.0, 4.0, &mut vertices, &mut indices);

    black_box(
        build_nav_mesh(
            &settings(),
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(20.0, 8.0, 20.0),
            &vertices,
            TriangleIndices::U32(&indices),
            None,
        )
        .unwrap(),
    );
}

fn generate_plane_with_detail_mesh() {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();
    quad(0.0, 0.0, 20.0, 20.0, 0.2, &mut vertices, &mut indices);
    quad(2.0, 2.0, 6.0, 6.0, 0.5, &mut vertices, &mut indices);

    let settings = settings().with_detail_mesh(DetailMeshSettings {
        sample_distance: 1.0,
        max_sample_error: 0.1,
        deadline: None,
        polygon_deadline: None,
    });

    black_box(
        build_nav_mesh(
            &settings,
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(20.0, 4.0, 20.0),
            &vertices,
            TriangleIndices::U32(&indices),
            None,
        )
        .unwrap(),
    );
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("generate single plane", |b| b.iter(generate_single_plane));
    c.bench_function("generate plane with obstacles", |b| {
        b.iter(generate_plane_with_obstacles)
    });
    c.bench_function("generate plane with detail mesh", |b| {
        b.iter(generate_plane_with_detail_mesh)
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
