use crate::descriptor::HeapKind;

/// Errors raised by the render core.
///
/// Allocation problems carry the heap they came from so that an exhausted
/// heap is attributable from the log line alone.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("{kind:?} descriptor heap exhausted ({capacity} slots)")]
    HeapExhausted { kind: HeapKind, capacity: u32 },

    #[error(
        "{kind:?} frame heap overflow in slot {slot}: requested {requested}, {used} of {capacity} already in use"
    )]
    FrameHeapOverflow {
        kind: HeapKind,
        slot: usize,
        requested: u32,
        used: u32,
        capacity: u32,
    },

    #[error("{kind:?} frame heap for slot {slot} was not reset for frame {frame}")]
    StaleFrameHeap { kind: HeapKind, slot: usize, frame: u64 },

    #[error("{kind:?} frame heap for slot {slot} was already reset for frame {frame}")]
    FrameHeapResetTwice { kind: HeapKind, slot: usize, frame: u64 },

    #[error("{kind:?} descriptor slot {index} freed twice")]
    DoubleFree { kind: HeapKind, index: u32 },

    #[error("{kind:?} descriptor heap has no live handles left to free")]
    OverFree { kind: HeapKind },

    #[error("descriptor slot {index} does not belong to the {kind:?} heap")]
    ForeignHandle { kind: HeapKind, index: u32 },

    #[error("{kind:?} heaps cannot be shader visible")]
    NotShaderVisible { kind: HeapKind },

    #[error("GPU device lost: {reason}")]
    DeviceLost { reason: String },

    #[error("failed to compile {path} ({entry}): {message}")]
    ShaderCompile {
        path: String,
        entry: String,
        message: String,
    },

    #[error("{call} failed: {message}")]
    Gpu { call: &'static str, message: String },

    #[error("instance {instance} references missing geometry {geometry}")]
    MissingGeometry { instance: usize, geometry: usize },

    #[error("{resource} has no {view} view")]
    MissingView { resource: &'static str, view: &'static str },

    #[error("shader table references unknown export {0:?}")]
    UnknownShaderExport(String),

    #[error("shader table needs {required} bytes but the destination holds {available}")]
    ShaderTableTooSmall { required: usize, available: usize },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("{pass}: {source}")]
    Pass {
        pass: &'static str,
        #[source]
        source: Box<RenderError>,
    },
}

impl RenderError {
    /// Wraps an error with the name of the pass that was recording.
    pub fn in_pass(self, pass: &'static str) -> Self {
        RenderError::Pass {
            pass,
            source: Box::new(self),
        }
    }
}

/// Frame graph validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("{pass} reads {target} before any pass writes it")]
    ReadBeforeWrite { pass: &'static str, target: &'static str },

    #[error("{pass} cannot be recorded as a bundle")]
    BundleUnsupported { pass: &'static str },
}

pub type Result<T, E = RenderError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_view_names_the_pass_and_resource() {
        let error = RenderError::MissingView {
            resource: "voxel grid",
            view: "UAV",
        }
        .in_pass("vct voxelize");
        assert_eq!(error.to_string(), "vct voxelize: voxel grid has no UAV view");
        assert!(matches!(
            &error,
            RenderError::Pass { source, .. } if matches!(**source, RenderError::MissingView { view: "UAV", .. })
        ));
    }
}
