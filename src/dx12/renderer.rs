//! The scene driver: owns the device, the scene on the GPU and every pass,
//! and turns one frame plan into command lists on both queues.

use std::time::Instant;

use glam::{Vec2, Vec3};
use windows::Win32::Foundation::HWND;

use super::buffer::{Buffer, UploadBatch};
use super::device::Graphics;
use super::mesh::{Mesh, Model};
use super::passes::{
    CompositePass, FrameInputs, GBufferPass, LightingPass, LpvInjectPass, LpvPropagatePass, OverlayPass,
    ReflectionsPass, RenderPass, RsmPass, ShadowPass, Targets, VctMipmapPass, VctTracePass, VctVoxelizePass,
};
use super::pipeline::ShaderCompiler;
use crate::config::{GiSettings, SandboxConfig};
use crate::error::Result;
use crate::graph::{FrameGraph, PassId, QueueKind};
use crate::overlay::{OverlayState, OverlayStats};
use crate::resource::BufferDesc;
use crate::scene::{FrameConstants, InputState, Scene};

struct Passes {
    gbuffer: GBufferPass,
    shadow: ShadowPass,
    rsm: RsmPass,
    vct_voxelize: VctVoxelizePass,
    lpv_inject: LpvInjectPass,
    vct_mipmap: VctMipmapPass,
    vct_trace: VctTracePass,
    lpv_propagate: LpvPropagatePass,
    reflections: Option<ReflectionsPass>,
    lighting: LightingPass,
    composite: CompositePass,
    overlay: OverlayPass,
}

impl Passes {
    fn get(&mut self, id: PassId) -> Option<&mut dyn RenderPass> {
        Some(match id {
            PassId::GBuffer => &mut self.gbuffer,
            PassId::Shadow => &mut self.shadow,
            PassId::Rsm => &mut self.rsm,
            PassId::VctVoxelize => &mut self.vct_voxelize,
            PassId::LpvInject => &mut self.lpv_inject,
            PassId::VctMipmap => &mut self.vct_mipmap,
            PassId::VctTrace => &mut self.vct_trace,
            PassId::LpvPropagate => &mut self.lpv_propagate,
            PassId::Reflections => return self.reflections.as_mut().map(|p| p as &mut dyn RenderPass),
            PassId::Lighting => &mut self.lighting,
            PassId::Composite => &mut self.composite,
            PassId::Overlay => &mut self.overlay,
        })
    }
}

/// Strength of each indirect term in `FrameConstants::gi`.
fn gi_weights(gi: &GiSettings) -> Vec3 {
    let weight = |enabled: bool| if enabled { 1.0 } else { 0.0 };
    Vec3::new(weight(gi.lpv), weight(gi.vct), weight(gi.reflections))
}

pub struct Renderer {
    graphics: Graphics,
    scene: Scene,
    meshes: Vec<Mesh>,
    models: Vec<Model>,
    targets: Targets,
    passes: Passes,
    /// One constant buffer per back-buffer slot.
    frame_constants: Vec<Buffer>,
    gi: GiSettings,
    overlay: OverlayState,
    wants_pointer: bool,
    plan_text: String,
    pending_resize: Option<(u32, u32)>,
    minimized: bool,
    last_frame: Instant,
    frame_ms: f32,
}

impl Renderer {
    pub fn new(hwnd: HWND, width: u32, height: u32, config: &SandboxConfig) -> Result<Self> {
        let started = Instant::now();
        let mut graphics = Graphics::new(hwnd, width, height, config)?;
        let compiler = ShaderCompiler::new(&config.shader_dir)?;
        let scene = Scene::cornell_box(width as f32 / height.max(1) as f32);

        let (meshes, models) = upload_scene(&mut graphics, &scene)?;
        let reflections = ReflectionsPass::new(&mut graphics, &compiler, &meshes, &models)?;

        let mut gi = config.gi;
        if reflections.is_none() && gi.reflections {
            log::warn!("ray-traced reflections requested but unavailable on this device");
            gi.reflections = false;
        }

        let device = graphics.device().clone();
        let slots = config.back_buffer_count as usize;
        let targets = Targets::new(&device, graphics.heaps_mut(), width, height)?;
        let passes = Passes {
            gbuffer: GBufferPass::new(&device, &compiler)?,
            shadow: ShadowPass::new(&device, &compiler)?,
            rsm: RsmPass::new(&device, &compiler)?,
            vct_voxelize: VctVoxelizePass::new(&device, &compiler)?,
            lpv_inject: LpvInjectPass::new(&device, &compiler)?,
            vct_mipmap: VctMipmapPass::new(&device, &compiler)?,
            vct_trace: VctTracePass::new(&device, &compiler)?,
            lpv_propagate: LpvPropagatePass::new(&device, &compiler)?,
            reflections,
            lighting: LightingPass::new(&device, &compiler)?,
            composite: CompositePass::new(&device, &compiler)?,
            overlay: OverlayPass::new(&device, graphics.heaps_mut(), &compiler, slots)?,
        };
        let frame_constants = (0..slots)
            .map(|_| {
                Buffer::new(
                    &device,
                    graphics.heaps_mut(),
                    BufferDesc::constants("frame constants", std::mem::size_of::<FrameConstants>() as u64),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "renderer ready in {:.0} ms: {} meshes, {} models",
            started.elapsed().as_secs_f32() * 1000.0,
            meshes.len(),
            models.len()
        );

        Ok(Self {
            graphics,
            scene,
            meshes,
            models,
            targets,
            passes,
            frame_constants,
            gi,
            overlay: OverlayState::new(),
            wants_pointer: false,
            plan_text: String::new(),
            pending_resize: None,
            minimized: width == 0 || height == 0,
            last_frame: Instant::now(),
            frame_ms: 0.0,
        })
    }

    pub fn overlay_mut(&mut self) -> &mut OverlayState {
        &mut self.overlay
    }

    /// Records the new size; the swap chain and targets are rebuilt at the
    /// start of the next frame.
    pub fn on_window_size_changed(&mut self, width: u32, height: u32) {
        self.pending_resize = Some((width, height));
    }

    fn apply_pending_resize(&mut self) -> Result<()> {
        let Some((width, height)) = self.pending_resize.take() else {
            return Ok(());
        };
        self.minimized = width == 0 || height == 0;
        if !self.graphics.resize(width, height)? {
            return Ok(());
        }
        let device = self.graphics.device().clone();
        self.targets.resize(&device, self.graphics.heaps_mut(), width, height)?;
        self.scene.camera.aspect = width as f32 / height as f32;
        Ok(())
    }

    /// Update then render one frame.
    pub fn run_frame(&mut self, input: &InputState) -> Result<()> {
        self.apply_pending_resize()?;

        let now = Instant::now();
        let dt = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;
        self.frame_ms = dt * 1000.0;

        if self.wants_pointer {
            let mut held_only = input.clone();
            held_only.mouse_delta = Vec2::ZERO;
            held_only.right_button = false;
            self.scene.update(&held_only, dt);
        } else {
            self.scene.update(input, dt);
        }

        if self.minimized {
            return Ok(());
        }
        self.render()
    }

    fn render(&mut self) -> Result<()> {
        let (width, height) = self.graphics.size();
        let dxr_supported = self.passes.reflections.is_some();

        // Heap usage reported is that of the previous frame's slot.
        let previous = self.graphics.frame();
        let stats = OverlayStats {
            frame_ms: self.frame_ms,
            frame_number: previous.number,
            heaps: self.graphics.heaps().usage(previous),
            plan: self.plan_text.clone(),
            dxr_supported,
        };
        let output = self.overlay.run(&mut self.gi, &stats, width, height);
        self.gi.reflections &= dxr_supported;
        self.wants_pointer = output.wants_pointer;
        self.passes.overlay.prepare(output);

        let plan = FrameGraph::new(&self.gi).plan()?;
        let plan_text = plan.to_string();
        if plan_text != self.plan_text {
            log::info!("frame plan: {plan_text}");
            self.plan_text = plan_text;
        }

        let frame = self.graphics.prepare()?;
        let mut constants = self
            .scene
            .frame_constants(width, height, frame.number, gi_weights(&self.gi));
        constants.light_direction.w = if self.gi.shadows { 1.0 } else { 0.0 };
        let constants_buffer = &mut self.frame_constants[frame.slot];
        constants_buffer.write(&constants)?;
        let frame_constants = constants_buffer.gpu_address();

        let inputs = FrameInputs {
            meshes: &self.meshes,
            models: &self.models,
            gi: &self.gi,
            tlas: self.passes.reflections.as_ref().map(ReflectionsPass::tlas_address),
            plan: &plan,
        };

        for segment in plan.segments() {
            match segment.queue {
                QueueKind::Compute => {
                    for &(target, state) in &segment.hand_off {
                        if let Some(texture) = self.targets.get_mut(target) {
                            texture.transition_to(&mut self.graphics.barriers, state);
                        }
                    }
                    self.graphics.submit_graphics()?;
                    if segment.wait.is_some() {
                        self.graphics.queue_wait(QueueKind::Compute)?;
                    }
                    self.graphics.begin_compute()?;
                }
                QueueKind::Graphics => {
                    if segment.wait.is_some() {
                        self.graphics.queue_wait(QueueKind::Graphics)?;
                    }
                }
            }

            for &id in &segment.passes {
                let Some(pass) = self.passes.get(id) else {
                    log::warn!("{id} is planned but has no pass object");
                    continue;
                };
                log::trace!("recording {} on {:?}", pass.id(), segment.queue);
                let mut ctx = self.graphics.pass_context(frame_constants);
                pass.record(&mut ctx, &mut self.targets, &inputs)
                    .map_err(|e| e.in_pass(id.name()))?;
            }

            if segment.queue == QueueKind::Compute {
                self.graphics.submit_compute()?;
            }
        }

        self.graphics.present()?;
        log::trace!(
            "frame {} done, {} overlay vertices",
            frame.number,
            self.passes.overlay.vertex_count()
        );
        Ok(())
    }
}

/// Uploads every mesh and creates the model constants on a one-off list.
fn upload_scene(graphics: &mut Graphics, scene: &Scene) -> Result<(Vec<Mesh>, Vec<Model>)> {
    let (meshes, models, uploads) = graphics.execute_immediately(|graphics, list| {
        let device = graphics.device().clone();
        let mut uploads = UploadBatch::default();
        let mut meshes = scene
            .meshes
            .iter()
            .map(|data| Mesh::upload(&device, &mut graphics.heaps, data, list, &mut uploads))
            .collect::<Result<Vec<_>>>()?;
        for mesh in &mut meshes {
            mesh.make_readable(&mut graphics.barriers);
        }
        let models = scene
            .models
            .iter()
            .map(|instance| Model::new(&device, &mut graphics.heaps, instance))
            .collect::<Result<Vec<_>>>()?;
        Ok((meshes, models, uploads))
    })?;
    log::debug!("scene uploaded through {} staging buffer(s)", uploads.len());
    Ok((meshes, models))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_techniques_carry_no_weight() {
        let gi = GiSettings {
            lpv: true,
            vct: false,
            reflections: true,
            ..GiSettings::default()
        };
        assert_eq!(gi_weights(&gi), Vec3::new(1.0, 0.0, 1.0));
    }
}
