//! The fixed demo scene: procedural geometry, camera, light and the
//! constant-buffer layouts shared with the shaders.

use glam::{Mat4, Quat, Vec2, Vec3, Vec4};

/// Input layout shared by every geometry pass: POSITION, NORMAL, TANGENT,
/// TEXCOORD in this order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tangent: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub const STRIDE: u32 = std::mem::size_of::<Vertex>() as u32;

    fn new(position: Vec3, normal: Vec3, tangent: Vec3, uv: Vec2) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            tangent: tangent.to_array(),
            uv: uv.to_array(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    fn push_quad(&mut self, center: Vec3, normal: Vec3, tangent: Vec3, half: Vec2) {
        let bitangent = normal.cross(tangent);
        let base = self.vertices.len() as u32;
        let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
        for (u, v) in corners {
            let p = center + tangent * (u * half.x) + bitangent * (v * half.y);
            self.vertices.push(Vertex::new(
                p,
                normal,
                tangent,
                Vec2::new((u + 1.0) * 0.5, 1.0 - (v + 1.0) * 0.5),
            ));
        }
        // Clockwise when seen from the normal side (D3D front face).
        self.indices
            .extend_from_slice(&[base, base + 2, base + 1, base, base + 3, base + 2]);
    }

    /// A square in the XZ plane facing +Y.
    pub fn plane(size: f32) -> Self {
        let mut mesh = MeshData::default();
        mesh.push_quad(Vec3::ZERO, Vec3::Y, Vec3::X, Vec2::splat(size * 0.5));
        mesh
    }

    pub fn cuboid(extent: Vec3) -> Self {
        let h = extent * 0.5;
        let mut mesh = MeshData::default();
        let faces = [
            (Vec3::X, Vec3::NEG_Z, Vec2::new(h.z, h.y), h.x),
            (Vec3::NEG_X, Vec3::Z, Vec2::new(h.z, h.y), h.x),
            (Vec3::Y, Vec3::X, Vec2::new(h.x, h.z), h.y),
            (Vec3::NEG_Y, Vec3::X, Vec2::new(h.x, h.z), h.y),
            (Vec3::Z, Vec3::X, Vec2::new(h.x, h.y), h.z),
            (Vec3::NEG_Z, Vec3::NEG_X, Vec2::new(h.x, h.y), h.z),
        ];
        for (normal, tangent, half, distance) in faces {
            mesh.push_quad(normal * distance, normal, tangent, half);
        }
        mesh
    }

    pub fn sphere(radius: f32, slices: u32, stacks: u32) -> Self {
        let mut mesh = MeshData::default();
        for stack in 0..=stacks {
            let v = stack as f32 / stacks as f32;
            let phi = v * std::f32::consts::PI;
            for slice in 0..=slices {
                let u = slice as f32 / slices as f32;
                let theta = u * std::f32::consts::TAU;
                let normal = Vec3::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin());
                let tangent = Vec3::new(-theta.sin(), 0.0, theta.cos());
                mesh.vertices
                    .push(Vertex::new(normal * radius, normal, tangent, Vec2::new(u, v)));
            }
        }
        let row = slices + 1;
        for stack in 0..stacks {
            for slice in 0..slices {
                let a = stack * row + slice;
                let b = a + row;
                mesh.indices
                    .extend_from_slice(&[a, a + 1, b, a + 1, b + 1, b]);
            }
        }
        mesh
    }
}

/// One placement of a mesh.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModelInstance {
    pub mesh: usize,
    pub transform: Mat4,
    pub color: Vec4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    W,
    A,
    S,
    D,
    Q,
    E,
    Shift,
}

/// Input gathered by the window between two frames.
#[derive(Clone, Debug, Default)]
pub struct InputState {
    pub held: Vec<Key>,
    /// Cursor movement in pixels since the last frame.
    pub mouse_delta: Vec2,
    pub cursor: Vec2,
    pub right_button: bool,
    pub left_button: bool,
    pub scroll: f32,
}

impl InputState {
    pub fn is_held(&self, key: Key) -> bool {
        self.held.contains(&key)
    }

    pub fn press(&mut self, key: Key) {
        if !self.held.contains(&key) {
            self.held.push(key);
        }
    }

    pub fn release(&mut self, key: Key) {
        self.held.retain(|k| *k != key);
    }

    /// Clears the per-frame deltas, keeping held keys and buttons.
    pub fn end_frame(&mut self) {
        self.mouse_delta = Vec2::ZERO;
        self.scroll = 0.0;
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
    pub speed: f32,
    pub sensitivity: f32,
}

impl Camera {
    pub fn new(aspect: f32) -> Self {
        Self {
            position: Vec3::new(0.0, 2.5, -9.0),
            yaw: 0.0,
            pitch: -0.1,
            fov_y: 60f32.to_radians(),
            aspect,
            near: 0.1,
            far: 100.0,
            speed: 4.0,
            sensitivity: 0.004,
        }
    }

    pub fn forward(&self) -> Vec3 {
        Quat::from_euler(glam::EulerRot::YXZ, self.yaw, self.pitch, 0.0) * Vec3::Z
    }

    pub fn right(&self) -> Vec3 {
        Vec3::Y.cross(self.forward()).normalize()
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_to_lh(self.position, self.forward(), Vec3::Y)
    }

    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_lh(self.fov_y, self.aspect, self.near, self.far)
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection() * self.view()
    }

    pub fn update(&mut self, input: &InputState, dt: f32) {
        if input.right_button {
            self.yaw += input.mouse_delta.x * self.sensitivity;
            self.pitch = (self.pitch - input.mouse_delta.y * self.sensitivity).clamp(-1.5, 1.5);
        }

        let mut direction = Vec3::ZERO;
        let axes = [
            (Key::W, self.forward()),
            (Key::S, -self.forward()),
            (Key::D, self.right()),
            (Key::A, -self.right()),
            (Key::E, Vec3::Y),
            (Key::Q, Vec3::NEG_Y),
        ];
        for (key, axis) in axes {
            if input.is_held(key) {
                direction += axis;
            }
        }
        if direction != Vec3::ZERO {
            let boost = if input.is_held(Key::Shift) { 3.0 } else { 1.0 };
            self.position += direction.normalize() * self.speed * boost * dt;
        }
    }
}

/// A directional light orbiting the scene.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Light {
    pub azimuth: f32,
    pub elevation: f32,
    pub color: Vec3,
    pub intensity: f32,
    /// Radians per second.
    pub orbit_speed: f32,
    /// Half-extent of the orthographic shadow frustum.
    pub extent: f32,
}

impl Default for Light {
    fn default() -> Self {
        Self {
            azimuth: 0.6,
            elevation: 0.9,
            color: Vec3::new(1.0, 0.95, 0.85),
            intensity: 3.0,
            orbit_speed: 0.15,
            extent: 8.0,
        }
    }
}

impl Light {
    /// Direction the light travels in.
    pub fn direction(&self) -> Vec3 {
        let towards_light = Vec3::new(
            self.elevation.cos() * self.azimuth.cos(),
            self.elevation.sin(),
            self.elevation.cos() * self.azimuth.sin(),
        );
        -towards_light
    }

    pub fn animate(&mut self, dt: f32) {
        self.azimuth = (self.azimuth + self.orbit_speed * dt).rem_euclid(std::f32::consts::TAU);
    }

    /// View-projection used for the shadow map and the RSM.
    pub fn view_projection(&self, focus: Vec3) -> Mat4 {
        let eye = focus - self.direction() * self.extent * 2.0;
        let view = Mat4::look_to_lh(eye, self.direction(), Vec3::Y);
        let e = self.extent;
        let projection = Mat4::orthographic_lh(-e, e, -e, e, 0.1, self.extent * 4.0);
        projection * view
    }
}

/// Per-frame constants, register b0 of every pass.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FrameConstants {
    pub view_projection: Mat4,
    pub inverse_view_projection: Mat4,
    pub light_view_projection: Mat4,
    pub camera_position: Vec4,
    /// w: 1 when the shadow map holds this frame's depth, 0 otherwise.
    pub light_direction: Vec4,
    pub light_color: Vec4,
    /// width, height, 1/width, 1/height
    pub screen: Vec4,
    /// x: LPV strength, y: VCT strength, z: reflection strength, w: frame number
    pub gi: Vec4,
}

/// Per-model constants, register b1.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ModelConstants {
    pub world: Mat4,
    pub color: Vec4,
}

impl ModelConstants {
    pub fn new(model: &ModelInstance) -> Self {
        Self {
            world: model.transform,
            color: model.color,
        }
    }
}

/// Everything the renderer draws.
#[derive(Clone, Debug)]
pub struct Scene {
    pub meshes: Vec<MeshData>,
    pub models: Vec<ModelInstance>,
    pub camera: Camera,
    pub light: Light,
    pub bounds: (Vec3, Vec3),
    elapsed: f32,
}

impl Scene {
    /// A Cornell-box style room with two boxes and a sphere.
    pub fn cornell_box(aspect: f32) -> Self {
        let room = 10.0;
        let meshes = vec![
            MeshData::plane(room),
            MeshData::cuboid(Vec3::new(1.0, 1.0, 1.0)),
            MeshData::sphere(1.0, 32, 16),
        ];

        let half = room * 0.5;
        let wall = |rotation: Quat, offset: Vec3| Mat4::from_rotation_translation(rotation, offset);
        let models = vec![
            ModelInstance {
                mesh: 0,
                transform: Mat4::IDENTITY,
                color: Vec4::new(0.8, 0.8, 0.8, 1.0),
            },
            ModelInstance {
                mesh: 0,
                transform: wall(Quat::from_rotation_z(-std::f32::consts::FRAC_PI_2), Vec3::new(-half, half, 0.0)),
                color: Vec4::new(0.75, 0.1, 0.1, 1.0),
            },
            ModelInstance {
                mesh: 0,
                transform: wall(Quat::from_rotation_z(std::f32::consts::FRAC_PI_2), Vec3::new(half, half, 0.0)),
                color: Vec4::new(0.1, 0.7, 0.15, 1.0),
            },
            ModelInstance {
                mesh: 0,
                transform: wall(Quat::from_rotation_x(-std::f32::consts::FRAC_PI_2), Vec3::new(0.0, half, half)),
                color: Vec4::new(0.8, 0.8, 0.8, 1.0),
            },
            ModelInstance {
                mesh: 1,
                transform: Mat4::from_scale_rotation_translation(
                    Vec3::new(2.0, 4.0, 2.0),
                    Quat::from_rotation_y(0.3),
                    Vec3::new(-1.8, 2.0, 1.5),
                ),
                color: Vec4::new(0.9, 0.9, 0.9, 1.0),
            },
            ModelInstance {
                mesh: 1,
                transform: Mat4::from_scale_rotation_translation(
                    Vec3::splat(2.0),
                    Quat::from_rotation_y(-0.4),
                    Vec3::new(2.0, 1.0, -1.0),
                ),
                color: Vec4::new(0.9, 0.9, 0.9, 1.0),
            },
            ModelInstance {
                mesh: 2,
                transform: Mat4::from_translation(Vec3::new(0.5, 1.0, -2.8)),
                color: Vec4::new(0.95, 0.8, 0.3, 1.0),
            },
        ];

        Self {
            meshes,
            models,
            camera: Camera::new(aspect),
            light: Light::default(),
            bounds: (Vec3::new(-half, 0.0, -half), Vec3::new(half, room, half)),
            elapsed: 0.0,
        }
    }

    /// Seconds of scene time.
    pub fn elapsed(&self) -> f32 {
        self.elapsed
    }

    pub fn center(&self) -> Vec3 {
        (self.bounds.0 + self.bounds.1) * 0.5
    }

    pub fn update(&mut self, input: &InputState, dt: f32) {
        self.elapsed += dt;
        self.camera.update(input, dt);
        self.light.animate(dt);
    }

    pub fn frame_constants(&self, width: u32, height: u32, frame: u64, gi: Vec3) -> FrameConstants {
        let view_projection = self.camera.view_projection();
        let (w, h) = (width.max(1) as f32, height.max(1) as f32);
        FrameConstants {
            view_projection,
            inverse_view_projection: view_projection.inverse(),
            light_view_projection: self.light.view_projection(self.center()),
            camera_position: self.camera.position.extend(1.0),
            light_direction: self.light.direction().extend(0.0),
            light_color: (self.light.color * self.light.intensity).extend(1.0),
            screen: Vec4::new(w, h, 1.0 / w, 1.0 / h),
            gi: gi.extend(frame as f32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_well_formed(mesh: &MeshData) {
        assert_eq!(mesh.indices.len() % 3, 0);
        assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertices.len()));
        for v in &mesh.vertices {
            let n = Vec3::from(v.normal);
            let t = Vec3::from(v.tangent);
            assert!((n.length() - 1.0).abs() < 1e-4, "normal {n}");
            assert!(n.dot(t).abs() < 1e-4, "tangent {t} not orthogonal to {n}");
        }
    }

    #[test]
    fn procedural_meshes_are_well_formed() {
        assert_well_formed(&MeshData::plane(4.0));
        assert_well_formed(&MeshData::cuboid(Vec3::new(1.0, 2.0, 3.0)));
        assert_well_formed(&MeshData::sphere(1.0, 12, 6));
        assert_eq!(MeshData::cuboid(Vec3::ONE).triangle_count(), 12);
    }

    #[test]
    fn quads_wind_clockwise_from_their_normal() {
        let mesh = MeshData::cuboid(Vec3::ONE);
        for tri in mesh.indices.chunks(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| Vec3::from(mesh.vertices[i as usize].position));
            let n = Vec3::from(mesh.vertices[tri[0] as usize].normal);
            // Left-handed, clockwise front faces: (b - a) x (c - a) points along -n.
            assert!((b - a).cross(c - a).dot(n) < 0.0);
        }
    }

    #[test]
    fn vertex_layout_matches_the_input_layout() {
        assert_eq!(Vertex::STRIDE, 44);
        assert_eq!(std::mem::offset_of!(Vertex, normal), 12);
        assert_eq!(std::mem::offset_of!(Vertex, tangent), 24);
        assert_eq!(std::mem::offset_of!(Vertex, uv), 36);
        assert_eq!(std::mem::size_of::<FrameConstants>() % 16, 0);
        assert_eq!(std::mem::size_of::<ModelConstants>(), 80);
    }

    #[test]
    fn camera_moves_along_its_forward_axis() {
        let mut camera = Camera::new(16.0 / 9.0);
        let start = camera.position;
        let mut input = InputState::default();
        input.press(Key::W);
        camera.update(&input, 0.5);
        let moved = camera.position - start;
        assert!((moved.length() - camera.speed * 0.5).abs() < 1e-4);
        assert!(moved.normalize().dot(camera.forward()) > 0.999);

        input.release(Key::W);
        let here = camera.position;
        camera.update(&input, 0.5);
        assert_eq!(camera.position, here);
    }

    #[test]
    fn right_drag_turns_the_camera() {
        let mut camera = Camera::new(1.0);
        let input = InputState {
            right_button: true,
            mouse_delta: Vec2::new(100.0, 10_000.0),
            ..Default::default()
        };
        camera.update(&input, 0.016);
        assert!(camera.yaw > 0.0);
        assert_eq!(camera.pitch, -1.5);
    }

    #[test]
    fn scene_center_is_inside_the_light_frustum() {
        let mut scene = Scene::cornell_box(1.0);
        for _ in 0..100 {
            scene.update(&InputState::default(), 0.5);
            let clip = scene.light.view_projection(scene.center()) * scene.center().extend(1.0);
            let ndc = clip.truncate() / clip.w;
            assert!(ndc.x.abs() <= 1.0 && ndc.y.abs() <= 1.0, "{ndc}");
            assert!((0.0..=1.0).contains(&ndc.z), "{ndc}");
        }
    }

    #[test]
    fn light_points_downwards() {
        let light = Light::default();
        assert!(light.direction().y < 0.0);
        assert!((light.direction().length() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn frame_constants_describe_the_viewport() {
        let scene = Scene::cornell_box(2.0);
        let constants = scene.frame_constants(200, 100, 7, Vec3::new(1.0, 0.0, 0.5));
        assert_eq!(constants.screen, Vec4::new(200.0, 100.0, 0.005, 0.01));
        assert_eq!(constants.gi.w, 7.0);
        let round_trip = constants.inverse_view_projection * constants.view_projection;
        assert!(round_trip.abs_diff_eq(Mat4::IDENTITY, 1e-3));
    }

    #[test]
    fn models_reference_existing_meshes() {
        let scene = Scene::cornell_box(1.0);
        assert!(scene.models.iter().all(|m| m.mesh < scene.meshes.len()));
    }
}
