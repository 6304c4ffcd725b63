//! DXR: acceleration-structure builds, the reflection state object and its
//! shader binding table.

use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::core::{HSTRING, Interface, PCWSTR};

use super::buffer::{MappedResource, create_buffer_resource};
use super::pipeline::{RootParam, RootSignatureDesc, Shader, create_root_signature};
use super::{GpuResultExt, record_barriers};
use crate::error::Result;
use crate::raytracing::{
    AccelerationBackend, BuildBuffer, BuildInputs, PrebuildInfo, SHADER_IDENTIFIER_SIZE, ShaderSection,
    ShaderTableBuilder, ShaderTableLayout,
};
use crate::resource::{Barrier, BarrierKind, LazyMapping, MemoryKind, ResourceState};

const RAY_GENERATION: &str = "RayGen";
const MISS: &str = "Miss";
const CLOSEST_HIT: &str = "ClosestHit";
const HIT_GROUP: &str = "HitGroup";

/// Payload: float3 radiance plus a recursion depth.
const MAX_PAYLOAD_SIZE: u32 = 16;
const MAX_ATTRIBUTE_SIZE: u32 = 8;

/// Whether the device exposes DXR tier 1.0 or better.
pub fn raytracing_supported(device: &ID3D12Device) -> bool {
    let mut options = D3D12_FEATURE_DATA_D3D12_OPTIONS5::default();
    let checked = unsafe {
        device.CheckFeatureSupport(
            D3D12_FEATURE_D3D12_OPTIONS5,
            &mut options as *mut _ as *mut _,
            std::mem::size_of::<D3D12_FEATURE_DATA_D3D12_OPTIONS5>() as u32,
        )
    };
    checked.is_ok() && options.RaytracingTier.0 >= D3D12_RAYTRACING_TIER_1_0.0
}

/// Native build inputs. The geometry description is boxed so the pointer
/// stored in `desc` survives moves.
struct NativeInputs {
    desc: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS,
    _geometry: Option<Box<D3D12_RAYTRACING_GEOMETRY_DESC>>,
}

impl NativeInputs {
    fn new(inputs: &BuildInputs<'_>) -> Self {
        match inputs {
            BuildInputs::Triangles(triangles) => {
                let geometry = Box::new(D3D12_RAYTRACING_GEOMETRY_DESC {
                    Type: D3D12_RAYTRACING_GEOMETRY_TYPE_TRIANGLES,
                    Flags: D3D12_RAYTRACING_GEOMETRY_FLAG_OPAQUE,
                    Anonymous: D3D12_RAYTRACING_GEOMETRY_DESC_0 {
                        Triangles: D3D12_RAYTRACING_GEOMETRY_TRIANGLES_DESC {
                            Transform3x4: 0,
                            IndexFormat: DXGI_FORMAT_R32_UINT,
                            VertexFormat: DXGI_FORMAT_R32G32B32_FLOAT,
                            IndexCount: triangles.index_count,
                            VertexCount: triangles.vertex_count,
                            IndexBuffer: triangles.index_buffer,
                            VertexBuffer: D3D12_GPU_VIRTUAL_ADDRESS_AND_STRIDE {
                                StartAddress: triangles.vertex_buffer,
                                StrideInBytes: triangles.vertex_stride as u64,
                            },
                        },
                    },
                });
                let desc = D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS {
                    Type: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_TYPE_BOTTOM_LEVEL,
                    Flags: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAG_PREFER_FAST_TRACE,
                    NumDescs: 1,
                    DescsLayout: D3D12_ELEMENTS_LAYOUT_ARRAY,
                    Anonymous: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS_0 {
                        pGeometryDescs: &*geometry,
                    },
                };
                Self {
                    desc,
                    _geometry: Some(geometry),
                }
            }
            BuildInputs::Instances { descs, count } => Self {
                desc: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS {
                    Type: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_TYPE_TOP_LEVEL,
                    Flags: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAG_PREFER_FAST_TRACE,
                    NumDescs: *count,
                    DescsLayout: D3D12_ELEMENTS_LAYOUT_ARRAY,
                    Anonymous: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS_0 { InstanceDescs: *descs },
                },
                _geometry: None,
            },
        }
    }
}

/// Records acceleration-structure builds on a direct list.
pub struct D3dAccelerationBuilder<'a> {
    pub device: &'a ID3D12Device5,
    pub list: &'a ID3D12GraphicsCommandList4,
}

impl AccelerationBackend for D3dAccelerationBuilder<'_> {
    type Buffer = ID3D12Resource;

    fn prebuild_info(&self, inputs: &BuildInputs<'_>) -> Result<PrebuildInfo> {
        let native = NativeInputs::new(inputs);
        let mut info = D3D12_RAYTRACING_ACCELERATION_STRUCTURE_PREBUILD_INFO::default();
        unsafe {
            self.device
                .GetRaytracingAccelerationStructurePrebuildInfo(&native.desc, &mut info)
        };
        Ok(PrebuildInfo {
            result_size: info.ResultDataMaxSizeInBytes,
            scratch_size: info.ScratchDataSizeInBytes,
        })
    }

    fn create_buffer(&mut self, name: &str, size: u64, usage: BuildBuffer) -> Result<ID3D12Resource> {
        let (memory, flags, state) = match usage {
            BuildBuffer::Scratch => (
                MemoryKind::Default,
                D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS,
                ResourceState::UnorderedAccess,
            ),
            BuildBuffer::Result => (
                MemoryKind::Default,
                D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS,
                ResourceState::AccelerationStructure,
            ),
            BuildBuffer::InstanceUpload => (MemoryKind::Upload, D3D12_RESOURCE_FLAG_NONE, ResourceState::GenericRead),
        };
        let resource = create_buffer_resource(self.device, size, memory, flags, state)?;
        unsafe { resource.SetName(&HSTRING::from(name)) }.context("SetName")?;
        Ok(resource)
    }

    fn gpu_address(&self, buffer: &ID3D12Resource) -> u64 {
        unsafe { buffer.GetGPUVirtualAddress() }
    }

    fn write(&mut self, buffer: &ID3D12Resource, bytes: &[u8]) -> Result<()> {
        LazyMapping::new(MappedResource(buffer.clone()), bytes.len()).write_bytes(0, bytes)
    }

    fn build(&mut self, inputs: &BuildInputs<'_>, scratch: &ID3D12Resource, result: &ID3D12Resource) -> Result<()> {
        let native = NativeInputs::new(inputs);
        let desc = D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_DESC {
            DestAccelerationStructureData: unsafe { result.GetGPUVirtualAddress() },
            Inputs: native.desc,
            SourceAccelerationStructureData: 0,
            ScratchAccelerationStructureData: unsafe { scratch.GetGPUVirtualAddress() },
        };
        unsafe { self.list.BuildRaytracingAccelerationStructure(&desc, None) };
        Ok(())
    }

    fn uav_barrier(&mut self, buffer: &ID3D12Resource) {
        record_barriers(
            self.list,
            &[Barrier {
                resource: buffer.clone(),
                kind: BarrierKind::Uav,
            }],
        );
    }
}

/// Local root arguments of one hit-group record.
#[derive(Clone, Copy, Debug)]
pub struct HitGroupArgs {
    pub model_constants: u64,
    pub vertices: u64,
    pub indices: u64,
}

/// The reflection state object and its binding table.
///
/// Global root signature: a table `[u0 output, t1 normals, t2 positions]`,
/// the TLAS as root SRV t0 and the frame constants at b0. Each hit-group
/// record carries the model constants (b1) and its mesh's vertex and index
/// buffers (t0/t1 in space1).
pub struct ReflectionPipeline {
    state_object: ID3D12StateObject,
    global: ID3D12RootSignature,
    _local: ID3D12RootSignature,
    table: ID3D12Resource,
    layout: ShaderTableLayout,
}

impl ReflectionPipeline {
    pub const OUTPUT_TABLE: u32 = 0;
    pub const SCENE: u32 = 1;
    pub const FRAME: u32 = 2;

    pub fn new(device: &ID3D12Device5, library: &Shader, hit_groups: &[HitGroupArgs]) -> Result<Self> {
        use super::pipeline::Range;

        let global = create_root_signature(
            device,
            &RootSignatureDesc::new(vec![
                RootParam::Table(vec![Range::uav(0, 1), Range::srv(1, 2)]),
                RootParam::Srv { register: 0, space: 0 },
                RootParam::Cbv { register: 0, space: 0 },
            ]),
        )?;
        let local = create_root_signature(
            device,
            &RootSignatureDesc::new(vec![
                RootParam::Cbv { register: 1, space: 0 },
                RootParam::Srv { register: 0, space: 1 },
                RootParam::Srv { register: 1, space: 1 },
            ])
            .local(),
        )?;

        let state_object = create_state_object(device, library, &global, &local)?;

        let mut builder = ShaderTableBuilder::new();
        builder.add_ray_generation(RAY_GENERATION, &[]).add_miss(MISS, &[]);
        for args in hit_groups {
            builder.add_hit_group(HIT_GROUP, &[args.model_constants, args.vertices, args.indices]);
        }

        let properties: ID3D12StateObjectProperties = state_object.cast().context("cast")?;
        let identifier = |export: &str| -> Option<[u8; SHADER_IDENTIFIER_SIZE]> {
            let name = HSTRING::from(export);
            let ptr = unsafe { properties.GetShaderIdentifier(&name) };
            if ptr.is_null() {
                return None;
            }
            let mut id = [0u8; SHADER_IDENTIFIER_SIZE];
            unsafe { std::ptr::copy_nonoverlapping(ptr as *const u8, id.as_mut_ptr(), SHADER_IDENTIFIER_SIZE) };
            Some(id)
        };

        let mut bytes = vec![0u8; builder.layout().total_size() as usize];
        let layout = builder.write(&mut bytes, identifier)?;

        let table = create_buffer_resource(
            device,
            bytes.len().max(1) as u64,
            MemoryKind::Upload,
            D3D12_RESOURCE_FLAG_NONE,
            ResourceState::GenericRead,
        )?;
        LazyMapping::new(MappedResource(table.clone()), bytes.len()).write_bytes(0, &bytes)?;

        log::info!(
            "reflection shader table: {} bytes, {} hit group record(s)",
            layout.total_size(),
            layout.section(ShaderSection::HitGroup).count
        );

        Ok(Self {
            state_object,
            global,
            _local: local,
            table,
            layout,
        })
    }

    pub fn bind(&self, list: &ID3D12GraphicsCommandList4) {
        unsafe {
            list.SetComputeRootSignature(&self.global);
            list.SetPipelineState1(&self.state_object);
        }
    }

    pub fn dispatch(&self, list: &ID3D12GraphicsCommandList4, width: u32, height: u32) {
        let base = unsafe { self.table.GetGPUVirtualAddress() };
        let section = |s: ShaderSection| self.layout.section(s);
        let raygen = section(ShaderSection::RayGeneration);
        let miss = section(ShaderSection::Miss);
        let hit = section(ShaderSection::HitGroup);

        let desc = D3D12_DISPATCH_RAYS_DESC {
            RayGenerationShaderRecord: D3D12_GPU_VIRTUAL_ADDRESS_RANGE {
                StartAddress: base + raygen.offset,
                SizeInBytes: raygen.size,
            },
            MissShaderTable: D3D12_GPU_VIRTUAL_ADDRESS_RANGE_AND_STRIDE {
                StartAddress: base + miss.offset,
                SizeInBytes: miss.size,
                StrideInBytes: miss.stride,
            },
            HitGroupTable: D3D12_GPU_VIRTUAL_ADDRESS_RANGE_AND_STRIDE {
                StartAddress: base + hit.offset,
                SizeInBytes: hit.size,
                StrideInBytes: hit.stride,
            },
            CallableShaderTable: Default::default(),
            Width: width,
            Height: height,
            Depth: 1,
        };
        unsafe { list.DispatchRays(&desc) };
    }
}

fn create_state_object(
    device: &ID3D12Device5,
    library: &Shader,
    global: &ID3D12RootSignature,
    local: &ID3D12RootSignature,
) -> Result<ID3D12StateObject> {
    let names: Vec<HSTRING> = [RAY_GENERATION, MISS, CLOSEST_HIT, HIT_GROUP]
        .into_iter()
        .map(HSTRING::from)
        .collect();
    let exports: Vec<D3D12_EXPORT_DESC> = names[..3]
        .iter()
        .map(|name| D3D12_EXPORT_DESC {
            Name: PCWSTR(name.as_ptr()),
            ExportToRename: PCWSTR::null(),
            Flags: D3D12_EXPORT_FLAG_NONE,
        })
        .collect();

    let library_desc = D3D12_DXIL_LIBRARY_DESC {
        DXILLibrary: library.bytecode(),
        NumExports: exports.len() as u32,
        pExports: exports.as_ptr() as _,
    };
    let hit_group = D3D12_HIT_GROUP_DESC {
        HitGroupExport: PCWSTR(names[3].as_ptr()),
        Type: D3D12_HIT_GROUP_TYPE_TRIANGLES,
        AnyHitShaderImport: PCWSTR::null(),
        ClosestHitShaderImport: PCWSTR(names[2].as_ptr()),
        IntersectionShaderImport: PCWSTR::null(),
    };
    let shader_config = D3D12_RAYTRACING_SHADER_CONFIG {
        MaxPayloadSizeInBytes: MAX_PAYLOAD_SIZE,
        MaxAttributeSizeInBytes: MAX_ATTRIBUTE_SIZE,
    };
    let pipeline_config = D3D12_RAYTRACING_PIPELINE_CONFIG {
        MaxTraceRecursionDepth: 1,
    };
    let global_desc = D3D12_GLOBAL_ROOT_SIGNATURE {
        pGlobalRootSignature: unsafe { std::mem::transmute_copy(global) },
    };
    let local_desc = D3D12_LOCAL_ROOT_SIGNATURE {
        pLocalRootSignature: unsafe { std::mem::transmute_copy(local) },
    };

    // The association points into this vector, so it must never reallocate.
    let mut subobjects: Vec<D3D12_STATE_SUBOBJECT> = Vec::with_capacity(7);
    let push = |subobjects: &mut Vec<D3D12_STATE_SUBOBJECT>, kind, desc: *const std::ffi::c_void| {
        subobjects.push(D3D12_STATE_SUBOBJECT {
            Type: kind,
            pDesc: desc as _,
        });
        subobjects.len() - 1
    };
    push(&mut subobjects, D3D12_STATE_SUBOBJECT_TYPE_DXIL_LIBRARY, &library_desc as *const _ as _);
    push(&mut subobjects, D3D12_STATE_SUBOBJECT_TYPE_HIT_GROUP, &hit_group as *const _ as _);
    push(
        &mut subobjects,
        D3D12_STATE_SUBOBJECT_TYPE_RAYTRACING_SHADER_CONFIG,
        &shader_config as *const _ as _,
    );
    push(
        &mut subobjects,
        D3D12_STATE_SUBOBJECT_TYPE_RAYTRACING_PIPELINE_CONFIG,
        &pipeline_config as *const _ as _,
    );
    push(
        &mut subobjects,
        D3D12_STATE_SUBOBJECT_TYPE_GLOBAL_ROOT_SIGNATURE,
        &global_desc as *const _ as _,
    );
    let local_index = push(
        &mut subobjects,
        D3D12_STATE_SUBOBJECT_TYPE_LOCAL_ROOT_SIGNATURE,
        &local_desc as *const _ as _,
    );

    let associated = [PCWSTR(names[3].as_ptr())];
    let association = D3D12_SUBOBJECT_TO_EXPORTS_ASSOCIATION {
        pSubobjectToAssociate: &subobjects[local_index] as *const _,
        NumExports: associated.len() as u32,
        pExports: associated.as_ptr() as _,
    };
    push(
        &mut subobjects,
        D3D12_STATE_SUBOBJECT_TYPE_SUBOBJECT_TO_EXPORTS_ASSOCIATION,
        &association as *const _ as _,
    );

    let desc = D3D12_STATE_OBJECT_DESC {
        Type: D3D12_STATE_OBJECT_TYPE_RAYTRACING_PIPELINE,
        NumSubobjects: subobjects.len() as u32,
        pSubobjects: subobjects.as_ptr(),
    };
    unsafe { device.CreateStateObject(&desc) }.context("CreateStateObject")
}
