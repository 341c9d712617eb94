//! GPU boundary: handles, descriptors, device traits and a headless backend.

pub mod device;
pub mod headless;
pub mod types;

pub use device::{CommandRecorder, GpuDevice};
pub use headless::{HeadlessDevice, ProgramDesc, RecordedCommand, RecordingCommandBuffer};
pub use types::*;
