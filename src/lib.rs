//! A Direct3D 12 sandbox for real-time global illumination techniques.
//!
//! The platform-independent core (descriptor allocators, resource state
//! tracking, frame pacing, frame graph, acceleration-structure orchestration)
//! lives at the top level and is unit tested on every host. The D3D12 backend
//! and the renderer built on it are in [`dx12`], compiled on Windows only.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod graph;
pub mod logging;
pub mod overlay;
pub mod raytracing;
pub mod resource;
pub mod scene;

#[cfg(windows)]
pub mod dx12;

pub use config::{GiSettings, SandboxConfig};
pub use error::{RenderError, Result};
pub use frame::FrameContext;
