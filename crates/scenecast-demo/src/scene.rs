//! Animated demo scene: orbiting primitives plus two mesh sets sharing one
//! terrain mesh.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use scenecast_net::messages::{DrawType, ObjectAttributes};
use scenecast_net::{MeshSet, Resource, Shape, ShapeKind, SimpleMesh, SimpleShape};

const ORBIT_KINDS: [ShapeKind; 5] = [
    ShapeKind::Sphere,
    ShapeKind::Box,
    ShapeKind::Cone,
    ShapeKind::Cylinder,
    ShapeKind::Capsule,
];

const TERRAIN_MESH_ID: u32 = 1;
const TERRAIN_GRID: usize = 32;

struct Orbiter {
    shape: SimpleShape,
    radius: f32,
    speed: f32,
    phase: f32,
    height: f32,
}

/// Shapes streamed by the demo producer.
pub struct DemoScene {
    orbiters: Vec<Orbiter>,
    terrain: MeshSet,
    overlay: MeshSet,
    overlay_visible: bool,
    marker: SimpleShape,
    time: f32,
}

impl DemoScene {
    /// Build `shape_count` orbiters placed from `seed`.
    pub fn new(shape_count: u32, seed: u64) -> Self {
        let mut rng = Xoshiro256StarStar::seed_from_u64(seed);
        let orbiters = (0..shape_count)
            .map(|i| {
                let kind = ORBIT_KINDS[i as usize % ORBIT_KINDS.len()];
                let colour = rng.r#gen::<u32>() | 0xFF;
                Orbiter {
                    shape: SimpleShape::new(kind, i + 1).with_attributes(ObjectAttributes {
                        colour,
                        scale: [0.5; 3],
                        ..ObjectAttributes::default()
                    }),
                    radius: rng.gen_range(2.0..10.0),
                    speed: rng.gen_range(0.2..1.5),
                    phase: rng.gen_range(0.0..std::f32::consts::TAU),
                    height: rng.gen_range(0.5..3.0),
                }
            })
            .collect();

        let mesh = terrain_mesh();
        let next_id = shape_count + 1;
        let terrain =
            MeshSet::new(next_id).with_part(Arc::clone(&mesh), ObjectAttributes::default());
        let mut overlay = MeshSet::new(next_id + 1).with_part(
            mesh,
            ObjectAttributes {
                colour: 0x40A0_FF80,
                ..ObjectAttributes::default()
            },
        );
        overlay.set_position([0.0, 0.0, 0.05]);

        let mut scene = Self {
            orbiters,
            terrain,
            overlay,
            overlay_visible: true,
            marker: SimpleShape::new(ShapeKind::Arrow, 0),
            time: 0.0,
        };
        scene.place();
        scene
    }

    /// Shapes a newly connected client needs to see the current scene.
    pub fn persistent_shapes(&self) -> Vec<&dyn Shape> {
        let mut shapes: Vec<&dyn Shape> = self.moving_shapes().collect();
        shapes.push(&self.terrain);
        if self.overlay_visible {
            shapes.push(&self.overlay);
        }
        shapes
    }

    /// Orbiting shapes, for per-frame updates.
    pub fn moving_shapes(&self) -> impl Iterator<Item = &dyn Shape> {
        self.orbiters.iter().map(|o| &o.shape as &dyn Shape)
    }

    /// Transient marker, recreated every frame.
    pub fn marker(&self) -> &dyn Shape {
        &self.marker
    }

    pub fn overlay(&self) -> &dyn Shape {
        &self.overlay
    }

    pub fn overlay_visible(&self) -> bool {
        self.overlay_visible
    }

    /// Flip overlay visibility, returning the new state.
    pub fn toggle_overlay(&mut self) -> bool {
        self.overlay_visible = !self.overlay_visible;
        self.overlay_visible
    }

    /// Move everything forward by `dt` seconds.
    pub fn advance(&mut self, dt: f32) {
        self.time += dt;
        self.place();
    }

    fn place(&mut self) {
        let t = self.time;
        for orbiter in &mut self.orbiters {
            let angle = orbiter.phase + orbiter.speed * t;
            orbiter.shape.set_position([
                orbiter.radius * angle.cos(),
                orbiter.radius * angle.sin(),
                orbiter.height + 0.5 * (2.0 * angle).sin(),
            ]);
        }
        self.marker.set_position([3.0 * t.cos(), 3.0 * t.sin(), 4.0]);
    }
}

/// Wavy grid shared by both mesh sets.
fn terrain_mesh() -> Arc<dyn Resource> {
    let n = TERRAIN_GRID;
    let mut vertices = Vec::with_capacity(n * n);
    for y in 0..n {
        for x in 0..n {
            let (fx, fy) = (x as f32 - n as f32 / 2.0, y as f32 - n as f32 / 2.0);
            vertices.push([fx, fy, 0.3 * (fx * 0.4).sin() * (fy * 0.4).cos()]);
        }
    }
    let mut indices = Vec::with_capacity((n - 1) * (n - 1) * 6);
    for y in 0..n - 1 {
        for x in 0..n - 1 {
            let i = (y * n + x) as u32;
            let row = n as u32;
            indices.extend_from_slice(&[i, i + 1, i + row, i + 1, i + row + 1, i + row]);
        }
    }
    Arc::new(
        SimpleMesh::new(TERRAIN_MESH_ID, DrawType::Triangles)
            .with_vertices(vertices)
            .with_indices(indices),
    )
}
