//! multi-cam-recorder: continuous multi-camera capture and recording.
//!
//! Each camera gets a capture thread feeding two bounded queues, one for
//! live viewing and one for a clip writer that rotates fixed-length clips
//! with JSON sidecars. A shared exposure controller keeps every camera's
//! brightness inside a target band and a disk monitor evicts the oldest
//! clips once the recording root exceeds its quota. [`Pipeline`] starts and
//! stops all of it.
//!
//! Hardware sits behind two seams: [`DeviceOpener`]/[`CameraDevice`] for
//! frames and [`ControlPort`] for camera controls. The [`mock`] module
//! implements both for tests and simulation.

pub mod camera;
pub mod capture;
pub mod clip;
pub mod config;
pub mod control;
pub mod device;
pub mod encoder;
pub mod exposure;
pub mod frame;
pub mod mock;
pub mod overlay;
pub mod retention;
pub mod shutdown;
pub mod storage;
pub mod supervisor;
pub mod traits;

pub use camera::{Camera, CameraSpec, CameraState, CameraStats};
pub use clip::{ClipMetadata, ClipRecorder, ClipWriter, RecordingSettings};
pub use control::{ControlCatalog, ControlError, ControlPort, ControlSetting};
pub use device::{V4L2Device, V4L2Opener};
pub use exposure::{ExposureController, ExposurePolicy};
pub use retention::{DiskEvictionMonitor, RetentionPolicy};
pub use supervisor::{Pipeline, PipelineConfig, PipelineError};
pub use traits::{
    CameraDevice, CameraError, CaptureStream, DeviceCapabilities, DeviceOpener, Format, FourCC,
    FrameMetadata, RawFrame,
};
