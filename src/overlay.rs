use egui::{Context, Event, PointerButton, Pos2, RawInput, Rect, TextureId, Vec2, ViewportId, ViewportInfo};
use std::time::Instant;

pub use egui::TexturesDelta;

use crate::config::GiSettings;
use crate::descriptor::HeapUsage;

/// Vertex of the overlay pipeline: POSITION, TEXCOORD, COLOR.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct OverlayVertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
    pub color: [f32; 4],
}

/// Read-only numbers shown in the panel.
#[derive(Clone, Debug, Default)]
pub struct OverlayStats {
    pub frame_ms: f32,
    pub frame_number: u64,
    pub heaps: Vec<HeapUsage>,
    pub plan: String,
    pub dxr_supported: bool,
}

pub struct OverlayOutput {
    pub vertices: Vec<OverlayVertex>,
    pub textures_delta: TexturesDelta,
    /// The pointer is over a panel; camera input should be ignored.
    pub wants_pointer: bool,
}

pub struct OverlayState {
    pub ctx: Context,
    pub pixels_per_point: f32,
    pub visible: bool,
    pointer_pos: Option<Pos2>,
    events: Vec<Event>,
    start_time: Instant,
}

impl Default for OverlayState {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayState {
    pub fn new() -> Self {
        let ctx = Context::default();
        ctx.set_pixels_per_point(1.0);

        Self {
            ctx,
            pixels_per_point: 1.0,
            visible: true,
            pointer_pos: None,
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn on_mouse_move(&mut self, x: f32, y: f32) {
        self.pointer_pos = Some(Pos2::new(x, y));
        self.events.push(Event::PointerMoved(Pos2::new(x, y)));
    }

    pub fn on_mouse_button(&mut self, button: PointerButton, pressed: bool) {
        if let Some(pos) = self.pointer_pos {
            self.events.push(Event::PointerButton {
                pos,
                button,
                pressed,
                modifiers: Default::default(),
            });
        }
    }

    pub fn on_mouse_wheel(&mut self, delta_x: f32, delta_y: f32) {
        self.events.push(Event::MouseWheel {
            unit: egui::MouseWheelUnit::Point,
            delta: Vec2::new(delta_x, delta_y),
            modifiers: Default::default(),
        });
    }

    /// Runs the panel for one frame. Toggles write straight into `gi`.
    pub fn run(&mut self, gi: &mut GiSettings, stats: &OverlayStats, width: u32, height: u32) -> OverlayOutput {
        let mut input = RawInput::default();

        let mut viewport_info = ViewportInfo::default();
        viewport_info.native_pixels_per_point = Some(1.0);
        input.viewports.insert(ViewportId::ROOT, viewport_info);
        input.screen_rect = Some(Rect::from_min_size(Pos2::ZERO, Vec2::new(width as f32, height as f32)));
        input.time = Some(self.start_time.elapsed().as_secs_f64());
        input.focused = true;
        input.events = std::mem::take(&mut self.events);

        let visible = self.visible;
        let output = self.ctx.run(input, |ctx| {
            if visible {
                debug_panel(ctx, gi, stats);
            }
        });

        let primitives = self.ctx.tessellate(output.shapes, self.pixels_per_point);
        let vertices = shapes_to_vertices(&primitives, width, height, TextureId::Managed(0));

        OverlayOutput {
            vertices,
            textures_delta: output.textures_delta,
            wants_pointer: self.ctx.wants_pointer_input(),
        }
    }
}

fn debug_panel(ctx: &Context, gi: &mut GiSettings, stats: &OverlayStats) {
    egui::Window::new("GI Sandbox")
        .default_pos([10.0, 10.0])
        .resizable(false)
        .show(ctx, |ui| {
            ui.label(format!(
                "frame {}  {:.2} ms ({:.0} fps)",
                stats.frame_number,
                stats.frame_ms,
                1000.0 / stats.frame_ms.max(0.001)
            ));
            ui.separator();

            ui.heading("Techniques");
            ui.checkbox(&mut gi.shadows, "Shadow mapping");
            ui.checkbox(&mut gi.rsm, "Reflective shadow maps");
            ui.checkbox(&mut gi.lpv, "Light propagation volumes");
            if gi.lpv {
                ui.horizontal(|ui| {
                    ui.label("Propagation steps:");
                    ui.add(egui::Slider::new(&mut gi.lpv_iterations, 1..=64));
                });
                ui.checkbox(&mut gi.lpv_bundle, "Replay propagation bundle");
            }
            ui.checkbox(&mut gi.vct, "Voxel cone tracing");
            ui.add_enabled(
                stats.dxr_supported,
                egui::Checkbox::new(&mut gi.reflections, "Ray-traced reflections"),
            );
            ui.checkbox(&mut gi.async_compute, "Async compute");

            ui.separator();
            ui.heading("Frame plan");
            ui.label(stats.plan.as_str());

            ui.separator();
            ui.heading("Descriptor heaps");
            for heap in &stats.heaps {
                if let Some(kind) = heap.kind {
                    ui.label(format!("{kind:?}: {} / {}", heap.used, heap.capacity));
                }
            }

            ui.separator();
            ui.label("WASD/QE move, right drag to look, F1 hides this panel");
        });
}

fn shapes_to_vertices(
    primitives: &[egui::ClippedPrimitive],
    width: u32,
    height: u32,
    expected_texture: TextureId,
) -> Vec<OverlayVertex> {
    let mut vertices = Vec::new();

    for primitive in primitives {
        if let egui::epaint::Primitive::Mesh(mesh) = &primitive.primitive {
            if mesh.texture_id != expected_texture {
                continue;
            }

            for idx in mesh.indices.chunks_exact(3) {
                for &i in idx {
                    let v = &mesh.vertices[i as usize];

                    let x = (v.pos.x / width as f32) * 2.0 - 1.0;
                    let y = 1.0 - (v.pos.y / height as f32) * 2.0;

                    vertices.push(OverlayVertex {
                        position: [x, y],
                        uv: [v.uv.x, v.uv.y],
                        color: [
                            srgb_to_linear(v.color.r()),
                            srgb_to_linear(v.color.g()),
                            srgb_to_linear(v.color.b()),
                            v.color.a() as f32 / 255.0,
                        ],
                    });
                }
            }
        }
    }

    vertices
}

fn srgb_to_linear(c: u8) -> f32 {
    let c = c as f32 / 255.0;
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use egui::epaint::{Mesh, Primitive, Vertex, WHITE_UV};
    use egui::{ClippedPrimitive, Color32};

    #[test]
    fn srgb_endpoints_are_preserved() {
        assert_eq!(srgb_to_linear(0), 0.0);
        assert!((srgb_to_linear(255) - 1.0).abs() < 1e-6);
        assert!((srgb_to_linear(188) - 0.5).abs() < 0.01);
    }

    /// Textured meshes take raw vertices; `colored_vertex` is only for untextured ones.
    fn push_vertex(mesh: &mut Mesh, x: f32, y: f32, color: Color32) {
        mesh.vertices.push(Vertex {
            pos: Pos2::new(x, y),
            uv: WHITE_UV,
            color,
        });
    }

    #[test]
    fn mesh_vertices_are_mapped_to_ndc() {
        let mut mesh = Mesh::with_texture(TextureId::Managed(0));
        push_vertex(&mut mesh, 0.0, 0.0, Color32::WHITE);
        push_vertex(&mut mesh, 200.0, 0.0, Color32::WHITE);
        push_vertex(&mut mesh, 200.0, 100.0, Color32::WHITE);
        mesh.add_triangle(0, 1, 2);

        let mut other = Mesh::with_texture(TextureId::User(7));
        push_vertex(&mut other, 0.0, 0.0, Color32::RED);
        other.add_triangle(0, 0, 0);

        let primitives = [mesh, other].map(|m| ClippedPrimitive {
            clip_rect: Rect::EVERYTHING,
            primitive: Primitive::Mesh(m),
        });
        let vertices = shapes_to_vertices(&primitives, 200, 100, TextureId::Managed(0));

        assert_eq!(vertices.len(), 3);
        assert_eq!(vertices[0].position, [-1.0, 1.0]);
        assert_eq!(vertices[2].position, [1.0, -1.0]);
        assert_eq!(vertices[1].color, [1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn first_frame_uploads_the_font_atlas() {
        let mut overlay = OverlayState::new();
        let mut gi = GiSettings::default();
        let stats = OverlayStats {
            frame_ms: 16.0,
            plan: "Graphics: gbuffer".into(),
            ..Default::default()
        };
        let first = overlay.run(&mut gi, &stats, 1280, 720);
        assert!(!first.textures_delta.set.is_empty());
        // Auto-sized windows are laid out invisibly on their first frame.
        let second = overlay.run(&mut gi, &stats, 1280, 720);
        assert!(!second.vertices.is_empty());
        assert_eq!(gi, GiSettings::default());
    }

    #[test]
    fn hidden_overlay_draws_nothing() {
        let mut overlay = OverlayState::new();
        overlay.visible = false;
        let output = overlay.run(&mut GiSettings::default(), &OverlayStats::default(), 640, 480);
        assert!(output.vertices.is_empty());
    }
}
