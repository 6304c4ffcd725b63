use glam::Mat4;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_R32_UINT;

use super::buffer::{Buffer, UploadBatch};
use super::heap::Heaps;
use crate::error::Result;
use crate::raytracing::TriangleGeometry;
use crate::resource::{BarrierList, BufferDesc, ResourceState};
use crate::scene::{MeshData, ModelConstants, ModelInstance, Vertex};

/// Vertex and index buffers of one mesh, also readable as structured
/// buffers from the ray-tracing hit shader.
pub struct Mesh {
    vertices: Buffer,
    indices: Buffer,
    vertex_count: u32,
    index_count: u32,
}

impl Mesh {
    pub fn upload(
        device: &ID3D12Device,
        heaps: &mut Heaps,
        data: &MeshData,
        list: &ID3D12GraphicsCommandList4,
        uploads: &mut UploadBatch,
    ) -> Result<Self> {
        let vertex_count = data.vertices.len() as u32;
        let index_count = data.indices.len() as u32;
        let vertices = Buffer::with_data(
            device,
            heaps,
            BufferDesc::structured("vertices", vertex_count, Vertex::STRIDE),
            bytemuck::cast_slice(&data.vertices),
            list,
            uploads,
        )?;
        let indices = Buffer::with_data(
            device,
            heaps,
            BufferDesc::structured("indices", index_count, 4),
            bytemuck::cast_slice(&data.indices),
            list,
            uploads,
        )?;
        Ok(Self {
            vertices,
            indices,
            vertex_count,
            index_count,
        })
    }

    /// Moves both buffers into `GenericRead`, which covers the input
    /// assembler, the acceleration-structure build and hit-shader reads.
    /// They stay there for the rest of the run.
    pub fn make_readable(&mut self, barriers: &mut BarrierList<ID3D12Resource>) {
        self.vertices.transition_to(barriers, ResourceState::GenericRead);
        self.indices.transition_to(barriers, ResourceState::GenericRead);
    }

    pub fn geometry(&self) -> TriangleGeometry {
        TriangleGeometry {
            vertex_buffer: self.vertices.gpu_address(),
            vertex_count: self.vertex_count,
            vertex_stride: Vertex::STRIDE,
            index_buffer: self.indices.gpu_address(),
            index_count: self.index_count,
        }
    }

    pub fn vertex_address(&self) -> u64 {
        self.vertices.gpu_address()
    }

    pub fn index_address(&self) -> u64 {
        self.indices.gpu_address()
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn bind(&self, list: &ID3D12GraphicsCommandList4) {
        unsafe {
            list.IASetPrimitiveTopology(windows::Win32::Graphics::Direct3D::D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            list.IASetVertexBuffers(
                0,
                Some(&[D3D12_VERTEX_BUFFER_VIEW {
                    BufferLocation: self.vertices.gpu_address(),
                    SizeInBytes: self.vertices.desc().size as u32,
                    StrideInBytes: Vertex::STRIDE,
                }]),
            );
            list.IASetIndexBuffer(Some(&D3D12_INDEX_BUFFER_VIEW {
                BufferLocation: self.indices.gpu_address(),
                SizeInBytes: self.indices.desc().size as u32,
                Format: DXGI_FORMAT_R32_UINT,
            }));
        }
    }
}

/// One placed mesh with its constants at register b1.
pub struct Model {
    pub mesh: usize,
    pub transform: Mat4,
    constants: Buffer,
}

impl Model {
    pub fn new(device: &ID3D12Device, heaps: &mut Heaps, instance: &ModelInstance) -> Result<Self> {
        let mut constants = Buffer::new(
            device,
            heaps,
            BufferDesc::constants("model constants", std::mem::size_of::<ModelConstants>() as u64),
        )?;
        constants.write(&ModelConstants::new(instance))?;
        Ok(Self {
            mesh: instance.mesh,
            transform: instance.transform,
            constants,
        })
    }

    pub fn constants_address(&self) -> u64 {
        self.constants.gpu_address()
    }
}

/// Draws every model with the currently bound pipeline. Root parameter 1
/// must be the model CBV.
pub fn draw_models(list: &ID3D12GraphicsCommandList4, meshes: &[Mesh], models: &[Model]) {
    for model in models {
        let Some(mesh) = meshes.get(model.mesh) else {
            log::warn!("model references missing mesh {}", model.mesh);
            continue;
        };
        mesh.bind(list);
        unsafe {
            list.SetGraphicsRootConstantBufferView(1, model.constants_address());
            list.DrawIndexedInstanced(mesh.index_count(), 1, 0, 0, 0);
        }
    }
}
