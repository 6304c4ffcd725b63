//! Shader compilation, root signatures and pipeline state objects.
//!
//! Every HLSL file under the shader directory is compiled with the shared
//! `common.hlsli` prepended, so register declarations for the frame and
//! model constants stay in one place.

use std::ffi::CString;
use std::mem::ManuallyDrop;
use std::path::{Path, PathBuf};

use windows::Win32::Graphics::Direct3D::Dxc::*;
use windows::Win32::Graphics::Direct3D::Fxc::*;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::core::{HSTRING, PCSTR, PCWSTR, w};

use super::{GpuResultExt, created};
use crate::error::{RenderError, Result};

const COMMON: &str = "common.hlsli";
const CP_UTF8: u32 = 65001;

/// Compiled shader bytecode.
pub enum Shader {
    Fxc(ID3DBlob),
    Dxil(IDxcBlob),
}

impl Shader {
    pub fn bytes(&self) -> &[u8] {
        unsafe {
            match self {
                Shader::Fxc(blob) => std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize()),
                Shader::Dxil(blob) => std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize()),
            }
        }
    }

    pub fn bytecode(&self) -> D3D12_SHADER_BYTECODE {
        let bytes = self.bytes();
        D3D12_SHADER_BYTECODE {
            pShaderBytecode: bytes.as_ptr() as *const _,
            BytecodeLength: bytes.len(),
        }
    }
}

/// Loads HLSL from the shader directory. Every failure is fatal.
pub struct ShaderCompiler {
    dir: PathBuf,
    common: String,
}

impl ShaderCompiler {
    pub fn new(dir: &Path) -> Result<Self> {
        let common = read_source(&dir.join(COMMON))?;
        log::info!("compiling shaders from {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            common,
        })
    }

    fn source(&self, file: &str) -> Result<String> {
        let body = read_source(&self.dir.join(file))?;
        Ok(format!("{}\n#line 1 \"{}\"\n{}", self.common, file, body))
    }

    /// Compiles one entry point with FXC (shader model 5.1).
    pub fn compile(&self, file: &str, entry: &str, target: &str) -> Result<Shader> {
        let source = self.source(file)?;
        let fail = |message: String| RenderError::ShaderCompile {
            path: self.dir.join(file).display().to_string(),
            entry: entry.to_owned(),
            message,
        };

        let name = CString::new(file).map_err(|e| fail(e.to_string()))?;
        let entry_c = CString::new(entry).map_err(|e| fail(e.to_string()))?;
        let target_c = CString::new(target).map_err(|e| fail(e.to_string()))?;
        let flags = if cfg!(debug_assertions) {
            D3DCOMPILE_DEBUG | D3DCOMPILE_SKIP_OPTIMIZATION
        } else {
            D3DCOMPILE_OPTIMIZATION_LEVEL3
        };

        let mut blob = None;
        let mut error = None;
        let result = unsafe {
            D3DCompile(
                source.as_ptr() as *const std::ffi::c_void,
                source.len(),
                PCSTR(name.as_ptr() as *const u8),
                None,
                None,
                PCSTR(entry_c.as_ptr() as *const u8),
                PCSTR(target_c.as_ptr() as *const u8),
                flags,
                0,
                &mut blob,
                Some(&mut error),
            )
        };

        if let Err(e) = result {
            let message = error
                .map(|blob: ID3DBlob| unsafe {
                    let bytes = std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize());
                    String::from_utf8_lossy(bytes).trim_end_matches('\0').to_owned()
                })
                .unwrap_or_else(|| e.message().to_string());
            return Err(fail(message));
        }
        log::debug!("compiled {file}:{entry} ({target})");
        Ok(Shader::Fxc(created(blob, "D3DCompile")?))
    }

    /// Compiles a DXR library with DXC.
    pub fn compile_library(&self, file: &str) -> Result<Shader> {
        let source = self.source(file)?;
        let fail = |message: String| RenderError::ShaderCompile {
            path: self.dir.join(file).display().to_string(),
            entry: "lib_6_3".to_owned(),
            message,
        };

        unsafe {
            let compiler: IDxcCompiler3 = DxcCreateInstance(&CLSID_DxcCompiler).context("DxcCreateInstance")?;

            let name = HSTRING::from(file);
            let mut args = vec![PCWSTR(name.as_ptr()), w!("-T"), w!("lib_6_3")];
            if cfg!(debug_assertions) {
                args.extend([w!("-Zi"), w!("-Od")]);
            } else {
                args.push(w!("-O3"));
            }

            let buffer = DxcBuffer {
                Ptr: source.as_ptr() as *const _,
                Size: source.len(),
                Encoding: CP_UTF8,
            };
            let result: IDxcResult = compiler.Compile(&buffer, Some(&args), None).context("IDxcCompiler3::Compile")?;

            let status = result.GetStatus().context("GetStatus")?;
            if status.is_err() {
                let message = result
                    .GetErrorBuffer()
                    .map(|blob| {
                        let bytes =
                            std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize());
                        String::from_utf8_lossy(bytes).into_owned()
                    })
                    .unwrap_or_else(|_| format!("{status:?}"));
                return Err(fail(message));
            }

            log::debug!("compiled library {file}");
            Ok(Shader::Dxil(result.GetResult().context("GetResult")?))
        }
    }
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| RenderError::ShaderCompile {
        path: path.display().to_string(),
        entry: String::new(),
        message: e.to_string(),
    })
}

#[derive(Clone, Copy, Debug)]
pub enum RangeKind {
    Srv,
    Uav,
    Cbv,
}

#[derive(Clone, Copy, Debug)]
pub struct Range {
    pub kind: RangeKind,
    pub base_register: u32,
    pub count: u32,
}

impl Range {
    pub fn srv(base_register: u32, count: u32) -> Self {
        Self {
            kind: RangeKind::Srv,
            base_register,
            count,
        }
    }

    pub fn uav(base_register: u32, count: u32) -> Self {
        Self {
            kind: RangeKind::Uav,
            base_register,
            count,
        }
    }
}

#[derive(Clone, Debug)]
pub enum RootParam {
    Cbv { register: u32, space: u32 },
    Srv { register: u32, space: u32 },
    Constants { register: u32, count: u32 },
    /// Ranges are laid out back to back in the bound block.
    Table(Vec<Range>),
}

#[derive(Clone, Copy, Debug)]
pub enum StaticSampler {
    Linear(u32),
    Point(u32),
    /// Less-equal comparison for shadow lookups.
    Shadow(u32),
}

#[derive(Clone, Debug, Default)]
pub struct RootSignatureDesc {
    pub params: Vec<RootParam>,
    pub samplers: Vec<StaticSampler>,
    pub input_assembler: bool,
    pub local: bool,
}

impl RootSignatureDesc {
    pub fn new(params: Vec<RootParam>) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    pub fn with_samplers(mut self, samplers: &[StaticSampler]) -> Self {
        self.samplers = samplers.to_vec();
        self
    }

    pub fn with_input_assembler(mut self) -> Self {
        self.input_assembler = true;
        self
    }

    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }
}

pub fn create_root_signature(device: &ID3D12Device, desc: &RootSignatureDesc) -> Result<ID3D12RootSignature> {
    let ranges: Vec<Vec<D3D12_DESCRIPTOR_RANGE>> = desc
        .params
        .iter()
        .map(|param| match param {
            RootParam::Table(ranges) => ranges
                .iter()
                .map(|r| D3D12_DESCRIPTOR_RANGE {
                    RangeType: match r.kind {
                        RangeKind::Srv => D3D12_DESCRIPTOR_RANGE_TYPE_SRV,
                        RangeKind::Uav => D3D12_DESCRIPTOR_RANGE_TYPE_UAV,
                        RangeKind::Cbv => D3D12_DESCRIPTOR_RANGE_TYPE_CBV,
                    },
                    NumDescriptors: r.count,
                    BaseShaderRegister: r.base_register,
                    RegisterSpace: 0,
                    OffsetInDescriptorsFromTableStart: D3D12_DESCRIPTOR_RANGE_OFFSET_APPEND,
                })
                .collect(),
            _ => Vec::new(),
        })
        .collect();

    let parameters: Vec<D3D12_ROOT_PARAMETER> = desc
        .params
        .iter()
        .zip(&ranges)
        .map(|(param, ranges)| match *param {
            RootParam::Cbv { register, space } => D3D12_ROOT_PARAMETER {
                ParameterType: D3D12_ROOT_PARAMETER_TYPE_CBV,
                Anonymous: D3D12_ROOT_PARAMETER_0 {
                    Descriptor: D3D12_ROOT_DESCRIPTOR {
                        ShaderRegister: register,
                        RegisterSpace: space,
                    },
                },
                ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
            },
            RootParam::Srv { register, space } => D3D12_ROOT_PARAMETER {
                ParameterType: D3D12_ROOT_PARAMETER_TYPE_SRV,
                Anonymous: D3D12_ROOT_PARAMETER_0 {
                    Descriptor: D3D12_ROOT_DESCRIPTOR {
                        ShaderRegister: register,
                        RegisterSpace: space,
                    },
                },
                ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
            },
            RootParam::Constants { register, count } => D3D12_ROOT_PARAMETER {
                ParameterType: D3D12_ROOT_PARAMETER_TYPE_32BIT_CONSTANTS,
                Anonymous: D3D12_ROOT_PARAMETER_0 {
                    Constants: D3D12_ROOT_CONSTANTS {
                        ShaderRegister: register,
                        RegisterSpace: 0,
                        Num32BitValues: count,
                    },
                },
                ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
            },
            RootParam::Table(_) => D3D12_ROOT_PARAMETER {
                ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
                Anonymous: D3D12_ROOT_PARAMETER_0 {
                    DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                        NumDescriptorRanges: ranges.len() as u32,
                        pDescriptorRanges: ranges.as_ptr(),
                    },
                },
                ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
            },
        })
        .collect();

    let samplers: Vec<D3D12_STATIC_SAMPLER_DESC> = desc.samplers.iter().map(|s| static_sampler(*s)).collect();

    let mut flags = D3D12_ROOT_SIGNATURE_FLAG_NONE;
    if desc.input_assembler {
        flags |= D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT;
    }
    if desc.local {
        flags |= D3D12_ROOT_SIGNATURE_FLAG_LOCAL_ROOT_SIGNATURE;
    }

    let native = D3D12_ROOT_SIGNATURE_DESC {
        NumParameters: parameters.len() as u32,
        pParameters: parameters.as_ptr(),
        NumStaticSamplers: samplers.len() as u32,
        pStaticSamplers: samplers.as_ptr(),
        Flags: flags,
    };

    unsafe {
        let mut signature = None;
        let mut error = None;
        let serialized = D3D12SerializeRootSignature(&native, D3D_ROOT_SIGNATURE_VERSION_1, &mut signature, Some(&mut error));
        if let Err(e) = serialized {
            let message = error
                .map(|blob: ID3DBlob| {
                    let bytes = std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize());
                    String::from_utf8_lossy(bytes).into_owned()
                })
                .unwrap_or_else(|| e.message().to_string());
            return Err(RenderError::Gpu {
                call: "D3D12SerializeRootSignature",
                message,
            });
        }

        let signature = created(signature, "D3D12SerializeRootSignature")?;
        device
            .CreateRootSignature(
                0,
                std::slice::from_raw_parts(signature.GetBufferPointer() as *const u8, signature.GetBufferSize()),
            )
            .context("CreateRootSignature")
    }
}

fn static_sampler(sampler: StaticSampler) -> D3D12_STATIC_SAMPLER_DESC {
    let (register, filter, comparison) = match sampler {
        StaticSampler::Linear(r) => (r, D3D12_FILTER_MIN_MAG_MIP_LINEAR, D3D12_COMPARISON_FUNC_NEVER),
        StaticSampler::Point(r) => (r, D3D12_FILTER_MIN_MAG_MIP_POINT, D3D12_COMPARISON_FUNC_NEVER),
        StaticSampler::Shadow(r) => (
            r,
            D3D12_FILTER_COMPARISON_MIN_MAG_LINEAR_MIP_POINT,
            D3D12_COMPARISON_FUNC_LESS_EQUAL,
        ),
    };
    D3D12_STATIC_SAMPLER_DESC {
        Filter: filter,
        AddressU: D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
        AddressV: D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
        AddressW: D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
        ComparisonFunc: comparison,
        BorderColor: D3D12_STATIC_BORDER_COLOR_OPAQUE_WHITE,
        MaxLOD: f32::MAX,
        ShaderRegister: register,
        RegisterSpace: 0,
        ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
        ..Default::default()
    }
}

/// Vertex formats the graphics pipelines consume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputLayout {
    /// `scene::Vertex`.
    Mesh,
    /// `overlay::OverlayVertex`.
    Overlay,
    /// Vertices generated from `SV_VertexID`.
    None,
}

impl InputLayout {
    fn elements(self) -> Vec<D3D12_INPUT_ELEMENT_DESC> {
        let element = |name: &'static [u8], format, offset| D3D12_INPUT_ELEMENT_DESC {
            SemanticName: PCSTR(name.as_ptr()),
            SemanticIndex: 0,
            Format: format,
            InputSlot: 0,
            AlignedByteOffset: offset,
            InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
            InstanceDataStepRate: 0,
        };
        match self {
            InputLayout::Mesh => vec![
                element(b"POSITION\0", DXGI_FORMAT_R32G32B32_FLOAT, 0),
                element(b"NORMAL\0", DXGI_FORMAT_R32G32B32_FLOAT, 12),
                element(b"TANGENT\0", DXGI_FORMAT_R32G32B32_FLOAT, 24),
                element(b"TEXCOORD\0", DXGI_FORMAT_R32G32_FLOAT, 36),
            ],
            InputLayout::Overlay => vec![
                element(b"POSITION\0", DXGI_FORMAT_R32G32_FLOAT, 0),
                element(b"TEXCOORD\0", DXGI_FORMAT_R32G32_FLOAT, 8),
                element(b"COLOR\0", DXGI_FORMAT_R32G32B32A32_FLOAT, 16),
            ],
            InputLayout::None => Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Blend {
    Opaque,
    Alpha,
}

pub struct GraphicsPipelineDesc<'a> {
    pub vs: &'a Shader,
    pub ps: Option<&'a Shader>,
    pub input: InputLayout,
    pub targets: &'a [DXGI_FORMAT],
    /// Depth format and whether the pass writes depth.
    pub depth: Option<(DXGI_FORMAT, bool)>,
    pub blend: Blend,
    pub cull: D3D12_CULL_MODE,
    pub depth_bias: i32,
}

impl<'a> GraphicsPipelineDesc<'a> {
    pub fn new(vs: &'a Shader, ps: Option<&'a Shader>, targets: &'a [DXGI_FORMAT]) -> Self {
        Self {
            vs,
            ps,
            input: InputLayout::None,
            targets,
            depth: None,
            blend: Blend::Opaque,
            cull: D3D12_CULL_MODE_NONE,
            depth_bias: 0,
        }
    }
}

pub fn create_graphics_pipeline(
    device: &ID3D12Device,
    root_signature: &ID3D12RootSignature,
    desc: &GraphicsPipelineDesc<'_>,
) -> Result<ID3D12PipelineState> {
    let elements = desc.input.elements();

    let target_blend = match desc.blend {
        Blend::Opaque => D3D12_RENDER_TARGET_BLEND_DESC {
            RenderTargetWriteMask: D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8,
            ..Default::default()
        },
        Blend::Alpha => D3D12_RENDER_TARGET_BLEND_DESC {
            BlendEnable: true.into(),
            SrcBlend: D3D12_BLEND_SRC_ALPHA,
            DestBlend: D3D12_BLEND_INV_SRC_ALPHA,
            BlendOp: D3D12_BLEND_OP_ADD,
            SrcBlendAlpha: D3D12_BLEND_ONE,
            DestBlendAlpha: D3D12_BLEND_INV_SRC_ALPHA,
            BlendOpAlpha: D3D12_BLEND_OP_ADD,
            RenderTargetWriteMask: D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8,
            ..Default::default()
        },
    };

    let mut rtv_formats = [DXGI_FORMAT_UNKNOWN; 8];
    rtv_formats[..desc.targets.len()].copy_from_slice(desc.targets);

    let (dsv_format, depth_stencil) = match desc.depth {
        Some((format, write)) => (
            format,
            D3D12_DEPTH_STENCIL_DESC {
                DepthEnable: true.into(),
                DepthWriteMask: if write {
                    D3D12_DEPTH_WRITE_MASK_ALL
                } else {
                    D3D12_DEPTH_WRITE_MASK_ZERO
                },
                DepthFunc: D3D12_COMPARISON_FUNC_LESS_EQUAL,
                ..Default::default()
            },
        ),
        None => (DXGI_FORMAT_UNKNOWN, D3D12_DEPTH_STENCIL_DESC::default()),
    };

    let pso_desc = D3D12_GRAPHICS_PIPELINE_STATE_DESC {
        pRootSignature: ManuallyDrop::new(Some(root_signature.clone())),
        VS: desc.vs.bytecode(),
        PS: desc.ps.map(Shader::bytecode).unwrap_or_default(),
        BlendState: D3D12_BLEND_DESC {
            RenderTarget: [target_blend; 8],
            ..Default::default()
        },
        SampleMask: u32::MAX,
        RasterizerState: D3D12_RASTERIZER_DESC {
            FillMode: D3D12_FILL_MODE_SOLID,
            CullMode: desc.cull,
            DepthBias: desc.depth_bias,
            SlopeScaledDepthBias: if desc.depth_bias != 0 { 1.5 } else { 0.0 },
            DepthClipEnable: true.into(),
            ..Default::default()
        },
        DepthStencilState: depth_stencil,
        InputLayout: D3D12_INPUT_LAYOUT_DESC {
            pInputElementDescs: elements.as_ptr(),
            NumElements: elements.len() as u32,
        },
        PrimitiveTopologyType: D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE,
        NumRenderTargets: desc.targets.len() as u32,
        RTVFormats: rtv_formats,
        DSVFormat: dsv_format,
        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
        ..Default::default()
    };

    let pso = unsafe { device.CreateGraphicsPipelineState(&pso_desc) };
    // Release the root signature reference taken for the descriptor.
    drop(ManuallyDrop::into_inner(pso_desc.pRootSignature));
    pso.context("CreateGraphicsPipelineState")
}

pub fn create_compute_pipeline(
    device: &ID3D12Device,
    root_signature: &ID3D12RootSignature,
    cs: &Shader,
) -> Result<ID3D12PipelineState> {
    let desc = D3D12_COMPUTE_PIPELINE_STATE_DESC {
        pRootSignature: ManuallyDrop::new(Some(root_signature.clone())),
        CS: cs.bytecode(),
        ..Default::default()
    };
    let pso = unsafe { device.CreateComputePipelineState(&desc) };
    drop(ManuallyDrop::into_inner(desc.pRootSignature));
    pso.context("CreateComputePipelineState")
}

/// A root signature paired with the pipeline it was built for.
pub struct Pipeline {
    pub root_signature: ID3D12RootSignature,
    pub state: ID3D12PipelineState,
}

impl Pipeline {
    pub fn compute(device: &ID3D12Device, root: &RootSignatureDesc, cs: &Shader) -> Result<Self> {
        let root_signature = create_root_signature(device, root)?;
        let state = create_compute_pipeline(device, &root_signature, cs)?;
        Ok(Self { root_signature, state })
    }

    pub fn graphics(device: &ID3D12Device, root: &RootSignatureDesc, desc: &GraphicsPipelineDesc<'_>) -> Result<Self> {
        let root_signature = create_root_signature(device, root)?;
        let state = create_graphics_pipeline(device, &root_signature, desc)?;
        Ok(Self { root_signature, state })
    }

    pub fn bind_graphics(&self, list: &ID3D12GraphicsCommandList4) {
        unsafe {
            list.SetPipelineState(&self.state);
            list.SetGraphicsRootSignature(&self.root_signature);
        }
    }

    pub fn bind_compute(&self, list: &ID3D12GraphicsCommandList4) {
        unsafe {
            list.SetPipelineState(&self.state);
            list.SetComputeRootSignature(&self.root_signature);
        }
    }
}
