use windows::Win32::Graphics::Direct3D12::*;

use super::{FrameInputs, PassContext, RenderPass, Targets, missing_view, read};
use crate::dx12::device::Graphics;
use crate::dx12::mesh::{Mesh, Model};
use crate::dx12::pipeline::ShaderCompiler;
use crate::dx12::raytracing::{D3dAccelerationBuilder, HitGroupArgs, ReflectionPipeline};
use crate::dx12::record_barriers;
use crate::error::{RenderError, Result};
use crate::graph::PassId;
use crate::raytracing::{AccelerationStructureSet, Instance, build_static_structures};
use crate::resource::ResourceState;

/// Mirror reflections traced against a TLAS that is built once at startup.
pub struct ReflectionsPass {
    pipeline: ReflectionPipeline,
    structures: AccelerationStructureSet<ID3D12Resource>,
}

impl ReflectionsPass {
    /// Builds one BLAS per mesh and a TLAS over every model, then the
    /// pipeline with one hit-group record per model. Returns `None` when the
    /// device has no DXR support.
    pub fn new(
        graphics: &mut Graphics,
        compiler: &ShaderCompiler,
        meshes: &[Mesh],
        models: &[Model],
    ) -> Result<Option<Self>> {
        let Some(device) = graphics.dxr_device().cloned() else {
            return Ok(None);
        };

        let geometries: Vec<_> = meshes.iter().map(Mesh::geometry).collect();
        let instances: Vec<Instance> = models
            .iter()
            .enumerate()
            .map(|(i, model)| Instance {
                geometry: model.mesh,
                transform: model.transform,
                hit_group: i as u32,
                mask: 0xff,
            })
            .collect();

        let structures = graphics.execute_immediately(|graphics, list| {
            graphics.barriers.flush(|barriers| {
                record_barriers(list, barriers);
                Ok(())
            })?;
            let mut builder = D3dAccelerationBuilder { device: &device, list };
            build_static_structures(&mut builder, &geometries, &instances)
        })?;

        let hit_groups = models
            .iter()
            .enumerate()
            .map(|(i, model)| {
                let mesh = meshes.get(model.mesh).ok_or(RenderError::MissingGeometry {
                    instance: i,
                    geometry: model.mesh,
                })?;
                Ok(HitGroupArgs {
                    model_constants: model.constants_address(),
                    vertices: mesh.vertex_address(),
                    indices: mesh.index_address(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let library = compiler.compile_library("reflections.hlsl")?;
        let pipeline = ReflectionPipeline::new(&device, &library, &hit_groups)?;
        Ok(Some(Self { pipeline, structures }))
    }

    pub fn tlas_address(&self) -> u64 {
        self.structures.tlas_address()
    }
}

impl RenderPass for ReflectionsPass {
    fn id(&self) -> PassId {
        PassId::Reflections
    }

    fn record(&mut self, ctx: &mut PassContext<'_>, targets: &mut Targets, _inputs: &FrameInputs<'_>) -> Result<()> {
        let state = ResourceState::NonPixelShaderResource;
        let normal = read(&mut targets.normal, ctx.barriers, state)?;
        let position = read(&mut targets.position, ctx.barriers, state)?;
        let output = &mut targets.reflections;
        output.transition_to(ctx.barriers, ResourceState::UnorderedAccess);
        let output = output.uav(0).ok_or_else(|| missing_view(output, "UAV"))?;
        ctx.flush_barriers()?;

        let table = ctx.stage(&[output, normal, position])?;
        self.pipeline.bind(ctx.list);
        unsafe {
            ctx.list
                .SetComputeRootDescriptorTable(ReflectionPipeline::OUTPUT_TABLE, table);
            ctx.list
                .SetComputeRootShaderResourceView(ReflectionPipeline::SCENE, self.tlas_address());
            ctx.list
                .SetComputeRootConstantBufferView(ReflectionPipeline::FRAME, ctx.frame_constants);
        }
        self.pipeline.dispatch(ctx.list, ctx.width, ctx.height);
        Ok(())
    }
}
