//! Acceleration-structure build orchestration and shader binding table layout.
//!
//! Both are produced once at startup. The BLAS/TLAS set is never refit, so
//! instance transforms are fixed for the run.

use glam::Mat4;

use crate::error::{RenderError, Result};
use crate::resource::align_up;

pub const SHADER_IDENTIFIER_SIZE: usize = 32;
pub const SHADER_RECORD_ALIGNMENT: usize = 32;
pub const SHADER_TABLE_ALIGNMENT: usize = 64;
pub const ROOT_ARGUMENT_SIZE: usize = 8;
pub const ACCELERATION_STRUCTURE_ALIGNMENT: u64 = 256;

/// GPU instance record consumed by the TLAS build. Matches
/// `D3D12_RAYTRACING_INSTANCE_DESC` bit for bit.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceDesc {
    pub transform: [f32; 12],
    id_and_mask: u32,
    hit_group_and_flags: u32,
    pub blas: u64,
}

impl InstanceDesc {
    pub fn new(transform: &Mat4, instance_id: u32, mask: u8, hit_group_offset: u32, flags: u8, blas: u64) -> Self {
        debug_assert!(instance_id < 1 << 24);
        debug_assert!(hit_group_offset < 1 << 24);
        Self {
            transform: row_major_3x4(transform),
            id_and_mask: (instance_id & 0x00ff_ffff) | (mask as u32) << 24,
            hit_group_and_flags: (hit_group_offset & 0x00ff_ffff) | (flags as u32) << 24,
            blas,
        }
    }

    pub fn instance_id(&self) -> u32 {
        self.id_and_mask & 0x00ff_ffff
    }

    pub fn mask(&self) -> u8 {
        (self.id_and_mask >> 24) as u8
    }

    pub fn hit_group_offset(&self) -> u32 {
        self.hit_group_and_flags & 0x00ff_ffff
    }

    pub fn flags(&self) -> u8 {
        (self.hit_group_and_flags >> 24) as u8
    }
}

/// The top three rows of a column-vector transform, row by row.
fn row_major_3x4(m: &Mat4) -> [f32; 12] {
    let mut out = [0.0; 12];
    for row in 0..3 {
        let r = m.row(row);
        out[row * 4..row * 4 + 4].copy_from_slice(&r.to_array());
    }
    out
}

/// Triangle geometry of one BLAS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_buffer: u64,
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub index_buffer: u64,
    pub index_count: u32,
}

/// One placement of a BLAS in the TLAS.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Instance {
    pub geometry: usize,
    pub transform: Mat4,
    pub hit_group: u32,
    pub mask: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildInputs<'a> {
    Triangles(&'a TriangleGeometry),
    Instances { descs: u64, count: u32 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrebuildInfo {
    pub result_size: u64,
    pub scratch_size: u64,
}

/// What a buffer created for a build is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildBuffer {
    Scratch,
    Result,
    InstanceUpload,
}

/// Device operations a build needs.
pub trait AccelerationBackend {
    type Buffer;

    fn prebuild_info(&self, inputs: &BuildInputs<'_>) -> Result<PrebuildInfo>;
    fn create_buffer(&mut self, name: &str, size: u64, usage: BuildBuffer) -> Result<Self::Buffer>;
    fn gpu_address(&self, buffer: &Self::Buffer) -> u64;
    fn write(&mut self, buffer: &Self::Buffer, bytes: &[u8]) -> Result<()>;
    fn build(&mut self, inputs: &BuildInputs<'_>, scratch: &Self::Buffer, result: &Self::Buffer) -> Result<()>;
    fn uav_barrier(&mut self, buffer: &Self::Buffer);
}

pub struct AccelerationStructure<B> {
    result: B,
    // Kept alive until the build has executed; freed with the set.
    _scratch: B,
    address: u64,
    size: u64,
}

impl<B> AccelerationStructure<B> {
    pub fn buffer(&self) -> &B {
        &self.result
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Every BLAS plus the TLAS, immutable after the build.
pub struct AccelerationStructureSet<B> {
    bottom: Vec<AccelerationStructure<B>>,
    top: AccelerationStructure<B>,
    _instance_descs: B,
    instances: Vec<InstanceDesc>,
}

impl<B> AccelerationStructureSet<B> {
    pub fn bottom_levels(&self) -> &[AccelerationStructure<B>] {
        &self.bottom
    }

    pub fn top_level(&self) -> &AccelerationStructure<B> {
        &self.top
    }

    pub fn tlas_address(&self) -> u64 {
        self.top.address
    }

    pub fn instances(&self) -> &[InstanceDesc] {
        &self.instances
    }
}

fn build_one<A: AccelerationBackend>(
    backend: &mut A,
    name: &str,
    inputs: &BuildInputs<'_>,
) -> Result<AccelerationStructure<A::Buffer>> {
    let info = backend.prebuild_info(inputs)?;
    let scratch_size = align_up(info.scratch_size.max(1), ACCELERATION_STRUCTURE_ALIGNMENT);
    let result_size = align_up(info.result_size.max(1), ACCELERATION_STRUCTURE_ALIGNMENT);

    let scratch = backend.create_buffer(&format!("{name} scratch"), scratch_size, BuildBuffer::Scratch)?;
    let result = backend.create_buffer(name, result_size, BuildBuffer::Result)?;
    backend.build(inputs, &scratch, &result)?;
    backend.uav_barrier(&result);

    let address = backend.gpu_address(&result);
    Ok(AccelerationStructure {
        result,
        _scratch: scratch,
        address,
        size: result_size,
    })
}

/// Builds one BLAS per geometry, then a TLAS over `instances`.
///
/// Commands are recorded through `backend`; the caller executes them and
/// waits before the first use of the returned set.
pub fn build_static_structures<A: AccelerationBackend>(
    backend: &mut A,
    geometries: &[TriangleGeometry],
    instances: &[Instance],
) -> Result<AccelerationStructureSet<A::Buffer>> {
    let bottom = geometries
        .iter()
        .enumerate()
        .map(|(i, geometry)| build_one(backend, &format!("blas {i}"), &BuildInputs::Triangles(geometry)))
        .collect::<Result<Vec<_>>>()?;

    let descs: Vec<InstanceDesc> = instances
        .iter()
        .enumerate()
        .map(|(i, instance)| -> Result<InstanceDesc> {
            let blas = bottom
                .get(instance.geometry)
                .map(|b| b.address)
                .ok_or(RenderError::MissingGeometry {
                    instance: i,
                    geometry: instance.geometry,
                })?;
            Ok(InstanceDesc::new(
                &instance.transform,
                i as u32,
                instance.mask,
                instance.hit_group,
                0,
                blas,
            ))
        })
        .collect::<Result<_>>()?;

    let bytes: &[u8] = bytemuck::cast_slice(&descs);
    let upload = backend.create_buffer("instance descs", bytes.len().max(1) as u64, BuildBuffer::InstanceUpload)?;
    backend.write(&upload, bytes)?;

    let inputs = BuildInputs::Instances {
        descs: backend.gpu_address(&upload),
        count: descs.len() as u32,
    };
    let top = build_one(backend, "tlas", &inputs)?;

    log::info!(
        "built {} bottom-level structure(s) and a top-level structure over {} instance(s)",
        bottom.len(),
        descs.len()
    );
    Ok(AccelerationStructureSet {
        bottom,
        top,
        _instance_descs: upload,
        instances: descs,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderSection {
    RayGeneration,
    Miss,
    HitGroup,
}

impl ShaderSection {
    const ALL: [ShaderSection; 3] = [ShaderSection::RayGeneration, ShaderSection::Miss, ShaderSection::HitGroup];

    fn index(self) -> usize {
        match self {
            ShaderSection::RayGeneration => 0,
            ShaderSection::Miss => 1,
            ShaderSection::HitGroup => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ShaderRecord {
    export: String,
    args: Vec<u64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SectionLayout {
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
    pub count: u32,
}

/// Offsets and strides for `DispatchRays`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShaderTableLayout {
    sections: [SectionLayout; 3],
    total: u64,
}

impl ShaderTableLayout {
    pub fn section(&self, section: ShaderSection) -> SectionLayout {
        self.sections[section.index()]
    }

    pub fn total_size(&self) -> u64 {
        self.total
    }
}

/// Collects shader records and writes the binding table.
#[derive(Clone, Debug, Default)]
pub struct ShaderTableBuilder {
    sections: [Vec<ShaderRecord>; 3],
}

impl ShaderTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, section: ShaderSection, export: &str, args: &[u64]) -> &mut Self {
        self.sections[section.index()].push(ShaderRecord {
            export: export.to_owned(),
            args: args.to_vec(),
        });
        self
    }

    pub fn add_ray_generation(&mut self, export: &str, args: &[u64]) -> &mut Self {
        self.add(ShaderSection::RayGeneration, export, args)
    }

    pub fn add_miss(&mut self, export: &str, args: &[u64]) -> &mut Self {
        self.add(ShaderSection::Miss, export, args)
    }

    pub fn add_hit_group(&mut self, export: &str, args: &[u64]) -> &mut Self {
        self.add(ShaderSection::HitGroup, export, args)
    }

    fn entry_size(records: &[ShaderRecord]) -> u64 {
        let args = records.iter().map(|r| r.args.len()).max().unwrap_or(0);
        align_up(
            (SHADER_IDENTIFIER_SIZE + args * ROOT_ARGUMENT_SIZE) as u64,
            SHADER_RECORD_ALIGNMENT as u64,
        )
    }

    pub fn layout(&self) -> ShaderTableLayout {
        let mut layout = ShaderTableLayout::default();
        let mut offset = 0;
        for section in ShaderSection::ALL {
            let records = &self.sections[section.index()];
            let stride = Self::entry_size(records);
            let size = stride * records.len() as u64;
            layout.sections[section.index()] = SectionLayout {
                offset,
                stride,
                size,
                count: records.len() as u32,
            };
            offset = align_up(offset + size, SHADER_TABLE_ALIGNMENT as u64);
        }
        layout.total = offset;
        layout
    }

    /// Writes every record into `dest`. `identifier` resolves an export name
    /// to its shader identifier.
    pub fn write<F>(&self, dest: &mut [u8], identifier: F) -> Result<ShaderTableLayout>
    where
        F: Fn(&str) -> Option<[u8; SHADER_IDENTIFIER_SIZE]>,
    {
        let layout = self.layout();
        if (dest.len() as u64) < layout.total {
            return Err(RenderError::ShaderTableTooSmall {
                required: layout.total as usize,
                available: dest.len(),
            });
        }

        dest[..layout.total as usize].fill(0);
        for section in ShaderSection::ALL {
            let placement = layout.section(section);
            for (i, record) in self.sections[section.index()].iter().enumerate() {
                let id = identifier(&record.export)
                    .ok_or_else(|| RenderError::UnknownShaderExport(record.export.clone()))?;
                let start = (placement.offset + placement.stride * i as u64) as usize;
                dest[start..start + SHADER_IDENTIFIER_SIZE].copy_from_slice(&id);

                let args: &[u8] = bytemuck::cast_slice(&record.args);
                let args_start = start + SHADER_IDENTIFIER_SIZE;
                dest[args_start..args_start + args.len()].copy_from_slice(args);
            }
        }
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Create(String, u64, BuildBuffer),
        Write(u32, usize),
        Build { scratch: u32, result: u32, instances: Option<u32> },
        Barrier(u32),
    }

    #[derive(Default)]
    struct RecordingBackend {
        next: u32,
        calls: Vec<Call>,
        uploads: Vec<Vec<u8>>,
    }

    const BASE: u64 = 0x1_0000_0000;

    impl AccelerationBackend for RecordingBackend {
        type Buffer = u32;

        fn prebuild_info(&self, inputs: &BuildInputs<'_>) -> Result<PrebuildInfo> {
            Ok(match inputs {
                BuildInputs::Triangles(g) => PrebuildInfo {
                    result_size: g.index_count as u64 * 40 + 1,
                    scratch_size: g.index_count as u64 * 8 + 3,
                },
                BuildInputs::Instances { count, .. } => PrebuildInfo {
                    result_size: *count as u64 * 128,
                    scratch_size: 100,
                },
            })
        }

        fn create_buffer(&mut self, name: &str, size: u64, usage: BuildBuffer) -> Result<u32> {
            self.calls.push(Call::Create(name.to_owned(), size, usage));
            self.next += 1;
            Ok(self.next)
        }

        fn gpu_address(&self, buffer: &u32) -> u64 {
            BASE + *buffer as u64 * 0x10_0000
        }

        fn write(&mut self, buffer: &u32, bytes: &[u8]) -> Result<()> {
            self.calls.push(Call::Write(*buffer, bytes.len()));
            self.uploads.push(bytes.to_vec());
            Ok(())
        }

        fn build(&mut self, inputs: &BuildInputs<'_>, scratch: &u32, result: &u32) -> Result<()> {
            let instances = match inputs {
                BuildInputs::Instances { count, .. } => Some(*count),
                BuildInputs::Triangles(_) => None,
            };
            self.calls.push(Call::Build {
                scratch: *scratch,
                result: *result,
                instances,
            });
            Ok(())
        }

        fn uav_barrier(&mut self, buffer: &u32) {
            self.calls.push(Call::Barrier(*buffer));
        }
    }

    fn triangles(index_count: u32) -> TriangleGeometry {
        TriangleGeometry {
            vertex_buffer: 0xaa00,
            vertex_count: index_count,
            vertex_stride: 48,
            index_buffer: 0xbb00,
            index_count,
        }
    }

    fn scene(backend: &mut RecordingBackend) -> AccelerationStructureSet<u32> {
        let geometries = [triangles(36), triangles(6)];
        let instances = [
            Instance {
                geometry: 1,
                transform: Mat4::IDENTITY,
                hit_group: 0,
                mask: 0xff,
            },
            Instance {
                geometry: 0,
                transform: Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)),
                hit_group: 0,
                mask: 0x01,
            },
        ];
        build_static_structures(backend, &geometries, &instances).unwrap()
    }

    #[test]
    fn every_build_is_followed_by_a_uav_barrier() {
        let mut backend = RecordingBackend::default();
        scene(&mut backend);

        let builds: Vec<usize> = (0..backend.calls.len())
            .filter(|&i| matches!(backend.calls[i], Call::Build { .. }))
            .collect();
        assert_eq!(builds.len(), 3);
        for i in builds {
            let Call::Build { result, .. } = backend.calls[i] else { unreachable!() };
            assert_eq!(backend.calls[i + 1], Call::Barrier(result));
        }
    }

    #[test]
    fn bottom_levels_are_built_before_the_top_level() {
        let mut backend = RecordingBackend::default();
        scene(&mut backend);
        let instance_builds: Vec<Option<u32>> = backend
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Build { instances, .. } => Some(*instances),
                _ => None,
            })
            .collect();
        assert_eq!(instance_builds, vec![None, None, Some(2)]);
    }

    #[test]
    fn build_buffers_are_aligned() {
        let mut backend = RecordingBackend::default();
        scene(&mut backend);
        for call in &backend.calls {
            if let Call::Create(_, size, BuildBuffer::Scratch | BuildBuffer::Result) = call {
                assert_eq!(size % ACCELERATION_STRUCTURE_ALIGNMENT, 0, "{call:?}");
            }
        }
    }

    #[test]
    fn instances_reference_their_blas() {
        let mut backend = RecordingBackend::default();
        let set = scene(&mut backend);

        let uploaded: Vec<InstanceDesc> = backend.uploads[0]
            .chunks_exact(std::mem::size_of::<InstanceDesc>())
            .map(bytemuck::pod_read_unaligned)
            .collect();
        assert_eq!(uploaded.as_slice(), set.instances());
        assert_eq!(uploaded[0].blas, set.bottom_levels()[1].address());
        assert_eq!(uploaded[1].blas, set.bottom_levels()[0].address());
        assert_eq!(uploaded[1].instance_id(), 1);
        assert_eq!(uploaded[1].mask(), 0x01);
        assert_eq!(&uploaded[1].transform[..4], &[1.0, 0.0, 0.0, 1.0]);
        assert_eq!(uploaded[1].transform[7], 2.0);
        assert_eq!(uploaded[1].transform[11], 3.0);
    }

    #[test]
    fn tlas_address_is_stable_across_frames() {
        let mut backend = RecordingBackend::default();
        let set = scene(&mut backend);
        let calls = backend.calls.len();

        let first = (set.tlas_address(), set.instances().to_vec());
        let second = (set.tlas_address(), set.instances().to_vec());
        assert_eq!(first, second);
        assert_eq!(backend.calls.len(), calls);
    }

    #[test]
    fn missing_geometry_is_an_error() {
        let mut backend = RecordingBackend::default();
        let instances = [Instance {
            geometry: 3,
            transform: Mat4::IDENTITY,
            hit_group: 0,
            mask: 0xff,
        }];
        let result = build_static_structures(&mut backend, &[triangles(3)], &instances);
        assert!(matches!(
            result,
            Err(RenderError::MissingGeometry { instance: 0, geometry: 3 })
        ));
    }

    #[test]
    fn instance_desc_packs_bitfields() {
        assert_eq!(std::mem::size_of::<InstanceDesc>(), 64);
        let desc = InstanceDesc::new(&Mat4::IDENTITY, 0x12_3456, 0xab, 0x00_0007, 0x04, 42);
        assert_eq!(desc.instance_id(), 0x12_3456);
        assert_eq!(desc.mask(), 0xab);
        assert_eq!(desc.hit_group_offset(), 7);
        assert_eq!(desc.flags(), 4);
    }

    fn id_for(name: &str) -> Option<[u8; SHADER_IDENTIFIER_SIZE]> {
        let tag = match name {
            "RayGen" => 1,
            "Miss" => 2,
            "ShadowMiss" => 3,
            "HitGroup" => 4,
            _ => return None,
        };
        Some([tag; SHADER_IDENTIFIER_SIZE])
    }

    #[test]
    fn shader_table_sections_are_aligned() {
        let mut builder = ShaderTableBuilder::new();
        builder
            .add_ray_generation("RayGen", &[])
            .add_miss("Miss", &[])
            .add_miss("ShadowMiss", &[])
            .add_hit_group("HitGroup", &[0x10, 0x20, 0x30]);
        let layout = builder.layout();

        let raygen = layout.section(ShaderSection::RayGeneration);
        let miss = layout.section(ShaderSection::Miss);
        let hit = layout.section(ShaderSection::HitGroup);
        assert_eq!((raygen.offset, raygen.stride, raygen.size), (0, 32, 32));
        assert_eq!((miss.offset, miss.stride, miss.size), (64, 32, 64));
        // 32 + 3 * 8 rounds up to 64.
        assert_eq!((hit.offset, hit.stride, hit.size), (128, 64, 64));
        assert_eq!(layout.total_size(), 192);
        for section in [raygen, miss, hit] {
            assert_eq!(section.offset % SHADER_TABLE_ALIGNMENT as u64, 0);
            assert_eq!(section.stride % SHADER_RECORD_ALIGNMENT as u64, 0);
        }
    }

    #[test]
    fn shader_table_writes_identifiers_then_arguments() {
        let mut builder = ShaderTableBuilder::new();
        builder
            .add_ray_generation("RayGen", &[])
            .add_miss("Miss", &[])
            .add_hit_group("HitGroup", &[0x1122_3344_5566_7788]);
        let mut table = vec![0xffu8; 256];
        let layout = builder.write(&mut table, id_for).unwrap();

        assert!(table[..32].iter().all(|&b| b == 1));
        assert!(table[64..96].iter().all(|&b| b == 2));
        let hit = layout.section(ShaderSection::HitGroup).offset as usize;
        assert!(table[hit..hit + 32].iter().all(|&b| b == 4));
        assert_eq!(&table[hit + 32..hit + 40], &0x1122_3344_5566_7788u64.to_ne_bytes());
        // Padding between sections is zeroed.
        assert!(table[32..64].iter().all(|&b| b == 0));
    }

    #[test]
    fn shader_table_rejects_unknown_exports_and_short_buffers() {
        let mut builder = ShaderTableBuilder::new();
        builder.add_ray_generation("Nope", &[]);
        let mut table = vec![0u8; 256];
        assert!(matches!(
            builder.write(&mut table, id_for),
            Err(RenderError::UnknownShaderExport(name)) if name == "Nope"
        ));

        let mut builder = ShaderTableBuilder::new();
        builder.add_ray_generation("RayGen", &[]).add_miss("Miss", &[]);
        let mut short = vec![0u8; 64];
        assert!(matches!(
            builder.write(&mut short, id_for),
            Err(RenderError::ShaderTableTooSmall { required: 128, available: 64 })
        ));
    }
}
