//! Frame graph.
//!
//! Every pass declares its queue and the targets it reads and writes. The plan
//! groups passes into queue segments, records which segment waits on the other
//! queue, and which targets have to be moved into a compute-compatible state
//! before a compute segment starts. The compute queue cannot transition out of
//! graphics-only states such as `RenderTarget`, so the graphics queue does it
//! before the hand-off.

use std::collections::HashSet;
use std::fmt;

use crate::config::GiSettings;
use crate::error::GraphError;
use crate::resource::ResourceState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PassId {
    GBuffer,
    Shadow,
    Rsm,
    VctVoxelize,
    LpvInject,
    VctMipmap,
    VctTrace,
    LpvPropagate,
    Reflections,
    Lighting,
    Composite,
    Overlay,
}

impl PassId {
    pub const ALL: [PassId; 12] = [
        PassId::GBuffer,
        PassId::Shadow,
        PassId::Rsm,
        PassId::VctVoxelize,
        PassId::LpvInject,
        PassId::VctMipmap,
        PassId::VctTrace,
        PassId::LpvPropagate,
        PassId::Reflections,
        PassId::Lighting,
        PassId::Composite,
        PassId::Overlay,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PassId::GBuffer => "gbuffer",
            PassId::Shadow => "shadow",
            PassId::Rsm => "rsm",
            PassId::VctVoxelize => "vct voxelize",
            PassId::LpvInject => "lpv inject",
            PassId::VctMipmap => "vct mipmap",
            PassId::VctTrace => "vct trace",
            PassId::LpvPropagate => "lpv propagate",
            PassId::Reflections => "reflections",
            PassId::Lighting => "lighting",
            PassId::Composite => "composite",
            PassId::Overlay => "overlay",
        }
    }

    /// Compute passes go to the compute queue when async compute is on.
    pub fn is_compute(self) -> bool {
        matches!(self, PassId::LpvInject | PassId::VctMipmap | PassId::VctTrace)
    }

    pub fn supports_bundle(self) -> bool {
        self == PassId::LpvPropagate
    }
}

impl fmt::Display for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetId {
    GBufferAlbedo,
    GBufferNormal,
    GBufferPosition,
    Depth,
    ShadowMap,
    RsmFlux,
    RsmNormal,
    RsmPosition,
    LpvInjected,
    LpvAccumulated,
    VoxelGrid,
    VctIndirect,
    Reflections,
    Lighting,
    BackBuffer,
}

impl TargetId {
    pub fn name(self) -> &'static str {
        match self {
            TargetId::GBufferAlbedo => "gbuffer albedo",
            TargetId::GBufferNormal => "gbuffer normal",
            TargetId::GBufferPosition => "gbuffer position",
            TargetId::Depth => "depth",
            TargetId::ShadowMap => "shadow map",
            TargetId::RsmFlux => "rsm flux",
            TargetId::RsmNormal => "rsm normal",
            TargetId::RsmPosition => "rsm position",
            TargetId::LpvInjected => "lpv injected",
            TargetId::LpvAccumulated => "lpv accumulated",
            TargetId::VoxelGrid => "voxel grid",
            TargetId::VctIndirect => "vct indirect",
            TargetId::Reflections => "reflections",
            TargetId::Lighting => "lighting",
            TargetId::BackBuffer => "back buffer",
        }
    }
}

/// How a pass's commands are produced each frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recording {
    PerFrame,
    /// Replays a command sequence recorded once at startup.
    Bundle,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassDecl {
    pub id: PassId,
    pub queue: QueueKind,
    pub reads: Vec<TargetId>,
    pub writes: Vec<TargetId>,
    pub recording: Recording,
}

fn declare(id: PassId, gi: &GiSettings) -> PassDecl {
    use TargetId::*;

    let gbuffer = [GBufferAlbedo, GBufferNormal, GBufferPosition];
    let rsm = [RsmFlux, RsmNormal, RsmPosition];
    let (reads, writes): (Vec<TargetId>, Vec<TargetId>) = match id {
        PassId::GBuffer => (vec![], vec![GBufferAlbedo, GBufferNormal, GBufferPosition, Depth]),
        PassId::Shadow => (vec![], vec![ShadowMap]),
        PassId::Rsm => (vec![], rsm.to_vec()),
        PassId::VctVoxelize => (
            if gi.shadows { vec![ShadowMap] } else { vec![] },
            vec![VoxelGrid],
        ),
        PassId::LpvInject => (rsm.to_vec(), vec![LpvInjected]),
        PassId::VctMipmap => (vec![VoxelGrid], vec![VoxelGrid]),
        PassId::VctTrace => (vec![GBufferNormal, GBufferPosition, VoxelGrid], vec![VctIndirect]),
        PassId::LpvPropagate => (vec![LpvInjected], vec![LpvAccumulated]),
        PassId::Reflections => (vec![GBufferNormal, GBufferPosition], vec![Reflections]),
        PassId::Lighting => {
            let mut reads = gbuffer.to_vec();
            if gi.shadows {
                reads.push(ShadowMap);
            }
            if gi.lpv {
                reads.push(LpvAccumulated);
            }
            if gi.vct {
                reads.push(VctIndirect);
            }
            (reads, vec![Lighting])
        }
        PassId::Composite => {
            let mut reads = vec![Lighting];
            if gi.reflections {
                reads.push(Reflections);
            }
            (reads, vec![BackBuffer])
        }
        PassId::Overlay => (vec![BackBuffer], vec![BackBuffer]),
    };

    let queue = if gi.async_compute && id.is_compute() {
        QueueKind::Compute
    } else {
        QueueKind::Graphics
    };
    let recording = if gi.lpv_bundle && id.supports_bundle() {
        Recording::Bundle
    } else {
        Recording::PerFrame
    };

    PassDecl {
        id,
        queue,
        reads,
        writes,
        recording,
    }
}

/// The passes of one frame, in submission order.
#[derive(Clone, Debug)]
pub struct FrameGraph {
    passes: Vec<PassDecl>,
}

impl FrameGraph {
    pub fn new(gi: &GiSettings) -> Self {
        let passes = PassId::ALL
            .into_iter()
            .filter(|&id| match id {
                PassId::Shadow => gi.shadows,
                PassId::Rsm => gi.rsm || gi.lpv,
                PassId::LpvInject | PassId::LpvPropagate => gi.lpv,
                PassId::VctVoxelize | PassId::VctMipmap | PassId::VctTrace => gi.vct,
                PassId::Reflections => gi.reflections,
                _ => true,
            })
            .map(|id| declare(id, gi))
            .collect();
        Self { passes }
    }

    pub fn from_passes(passes: Vec<PassDecl>) -> Self {
        Self { passes }
    }

    pub fn passes(&self) -> &[PassDecl] {
        &self.passes
    }

    pub fn contains(&self, id: PassId) -> bool {
        self.passes.iter().any(|p| p.id == id)
    }

    pub fn plan(&self) -> Result<FramePlan, GraphError> {
        let mut written = HashSet::new();
        for pass in &self.passes {
            if pass.recording == Recording::Bundle && !pass.id.supports_bundle() {
                return Err(GraphError::BundleUnsupported { pass: pass.id.name() });
            }
            if let Some(target) = pass.reads.iter().find(|t| !written.contains(*t)) {
                return Err(GraphError::ReadBeforeWrite {
                    pass: pass.id.name(),
                    target: target.name(),
                });
            }
            written.extend(pass.writes.iter().copied());
        }

        let mut segments: Vec<Segment> = Vec::new();
        for pass in &self.passes {
            match segments.last_mut() {
                Some(segment) if segment.queue == pass.queue => segment.passes.push(pass.id),
                _ => segments.push(Segment {
                    queue: pass.queue,
                    passes: vec![pass.id],
                    wait: None,
                    hand_off: Vec::new(),
                }),
            }
        }

        // Which queue last wrote each target, segment by segment.
        let mut producer: Vec<(TargetId, QueueKind)> = Vec::new();
        for segment in &mut segments {
            let decls: Vec<&PassDecl> = self
                .passes
                .iter()
                .filter(|p| segment.passes.contains(&p.id))
                .collect();

            let other_queue_reads: Vec<TargetId> = decls
                .iter()
                .flat_map(|p| p.reads.iter().copied())
                .filter(|t| {
                    producer
                        .iter()
                        .rev()
                        .find(|(target, _)| target == t)
                        .is_some_and(|&(_, queue)| queue != segment.queue)
                })
                .collect();
            if !other_queue_reads.is_empty() {
                segment.wait = Some(match segment.queue {
                    QueueKind::Graphics => QueueKind::Compute,
                    QueueKind::Compute => QueueKind::Graphics,
                });
            }

            if segment.queue == QueueKind::Compute {
                let mut states: Vec<(TargetId, ResourceState)> = Vec::new();
                for decl in &decls {
                    for &target in &decl.writes {
                        if !states.iter().any(|(t, _)| *t == target) {
                            states.push((target, ResourceState::UnorderedAccess));
                        }
                    }
                }
                for &target in &other_queue_reads {
                    if !states.iter().any(|(t, _)| *t == target) {
                        states.push((target, ResourceState::NonPixelShaderResource));
                    }
                }
                // The hand-off transitions are recorded on the graphics list, so
                // compute may not start until that list has executed.
                if !states.is_empty() {
                    segment.wait = Some(QueueKind::Graphics);
                }
                segment.hand_off = states;
            }

            for decl in &decls {
                producer.extend(decl.writes.iter().map(|&t| (t, segment.queue)));
            }
        }

        Ok(FramePlan {
            segments,
            recordings: self.passes.iter().map(|p| (p.id, p.recording)).collect(),
        })
    }
}

/// A run of consecutive passes on one queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub queue: QueueKind,
    pub passes: Vec<PassId>,
    /// The queue this segment waits on before its first pass.
    pub wait: Option<QueueKind>,
    /// States the preceding graphics segment establishes before handing off.
    pub hand_off: Vec<(TargetId, ResourceState)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramePlan {
    segments: Vec<Segment>,
    recordings: Vec<(PassId, Recording)>,
}

impl FramePlan {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn uses_compute_queue(&self) -> bool {
        self.segments.iter().any(|s| s.queue == QueueKind::Compute)
    }

    pub fn recording(&self, pass: PassId) -> Option<Recording> {
        self.recordings.iter().find(|(id, _)| *id == pass).map(|&(_, r)| r)
    }

    pub fn contains(&self, pass: PassId) -> bool {
        self.recording(pass).is_some()
    }
}

impl fmt::Display for FramePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{:?}", segment.queue)?;
            if let Some(wait) = segment.wait {
                write!(f, " (waits {wait:?})")?;
            }
            f.write_str(":")?;
            for pass in &segment.passes {
                write!(f, " {pass}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(async_compute: bool) -> GiSettings {
        GiSettings {
            vct: true,
            async_compute,
            ..GiSettings::default()
        }
    }

    #[test]
    fn without_async_compute_everything_is_one_graphics_segment() {
        let plan = FrameGraph::new(&settings(false)).plan().unwrap();
        assert_eq!(plan.segments().len(), 1);
        let segment = &plan.segments()[0];
        assert_eq!(segment.queue, QueueKind::Graphics);
        assert_eq!(segment.passes.len(), PassId::ALL.len());
        assert_eq!(segment.wait, None);
        assert!(segment.hand_off.is_empty());
        assert!(!plan.uses_compute_queue());
    }

    #[test]
    fn async_compute_splits_the_frame_around_a_compute_segment() {
        let plan = FrameGraph::new(&settings(true)).plan().unwrap();
        let queues: Vec<_> = plan.segments().iter().map(|s| (s.queue, s.wait)).collect();
        assert_eq!(
            queues,
            vec![
                (QueueKind::Graphics, None),
                (QueueKind::Compute, Some(QueueKind::Graphics)),
                (QueueKind::Graphics, Some(QueueKind::Compute)),
            ]
        );
        assert_eq!(
            plan.segments()[1].passes,
            vec![PassId::LpvInject, PassId::VctMipmap, PassId::VctTrace]
        );
    }

    #[test]
    fn compute_segment_lists_its_hand_off_states() {
        let plan = FrameGraph::new(&settings(true)).plan().unwrap();
        let hand_off = &plan.segments()[1].hand_off;
        let state = |target: TargetId| hand_off.iter().find(|(t, _)| *t == target).map(|&(_, s)| s);

        assert_eq!(state(TargetId::RsmFlux), Some(ResourceState::NonPixelShaderResource));
        assert_eq!(state(TargetId::GBufferNormal), Some(ResourceState::NonPixelShaderResource));
        assert_eq!(state(TargetId::LpvInjected), Some(ResourceState::UnorderedAccess));
        // Read and written by compute: must be writable.
        assert_eq!(state(TargetId::VoxelGrid), Some(ResourceState::UnorderedAccess));
        assert_eq!(state(TargetId::Lighting), None);
    }

    #[test]
    fn compute_that_only_writes_still_waits_for_graphics() {
        let gi = GiSettings::default();
        let mut gbuffer = declare(PassId::GBuffer, &gi);
        gbuffer.writes.push(TargetId::LpvInjected);
        let mut inject = declare(PassId::LpvInject, &gi);
        inject.queue = QueueKind::Compute;
        inject.reads.clear();
        inject.writes = vec![TargetId::LpvInjected];

        let plan = FrameGraph::from_passes(vec![gbuffer, inject]).plan().unwrap();
        let compute = &plan.segments()[1];
        assert_eq!(compute.queue, QueueKind::Compute);
        assert_eq!(compute.wait, Some(QueueKind::Graphics));
        assert_eq!(
            compute.hand_off,
            vec![(TargetId::LpvInjected, ResourceState::UnorderedAccess)]
        );
    }

    #[test]
    fn independent_graphics_work_does_not_wait() {
        let gi = GiSettings {
            lpv: false,
            vct: false,
            async_compute: true,
            ..GiSettings::default()
        };
        let plan = FrameGraph::new(&gi).plan().unwrap();
        assert!(!plan.uses_compute_queue());
        assert!(plan.segments().iter().all(|s| s.wait.is_none()));
    }

    #[test]
    fn disabled_techniques_drop_their_passes() {
        let gi = GiSettings {
            shadows: false,
            rsm: false,
            lpv: false,
            vct: false,
            reflections: false,
            ..GiSettings::default()
        };
        let graph = FrameGraph::new(&gi);
        let ids: Vec<_> = graph.passes().iter().map(|p| p.id).collect();
        assert_eq!(
            ids,
            vec![PassId::GBuffer, PassId::Lighting, PassId::Composite, PassId::Overlay]
        );
        graph.plan().unwrap();
    }

    #[test]
    fn lpv_propagation_is_the_only_bundle() {
        let plan = FrameGraph::new(&settings(true)).plan().unwrap();
        assert_eq!(plan.recording(PassId::LpvPropagate), Some(Recording::Bundle));
        assert_eq!(plan.recording(PassId::Lighting), Some(Recording::PerFrame));

        let mut bad = declare(PassId::Lighting, &GiSettings::default());
        bad.reads.clear();
        bad.recording = Recording::Bundle;
        assert_eq!(
            FrameGraph::from_passes(vec![bad]).plan(),
            Err(GraphError::BundleUnsupported { pass: "lighting" })
        );
    }

    #[test]
    fn reading_an_unwritten_target_is_rejected() {
        let graph = FrameGraph::from_passes(vec![declare(PassId::Composite, &GiSettings::default())]);
        assert_eq!(
            graph.plan(),
            Err(GraphError::ReadBeforeWrite {
                pass: "composite",
                target: "lighting",
            })
        );
    }

    #[test]
    fn plan_renders_for_the_overlay() {
        let plan = FrameGraph::new(&settings(true)).plan().unwrap();
        let text = plan.to_string();
        assert!(text.starts_with("Graphics: gbuffer shadow rsm vct voxelize"));
        assert!(text.contains("Compute (waits Graphics): lpv inject"));
    }
}
