//! Display controller primitives for NVIDIA EVO/NVDisplay hardware.
//!
//! This crate provides the low-level building blocks used by the modeset
//! engine to program the display controller:
//!
//! - Push-buffer command rings with GET/PUT flow control (`dma`)
//! - Per-subdevice update-state aggregation for atomic commits (`update`)
//! - Completion notifier and semaphore parsing/waiting (`notifier`)
//! - Reference-counted scanout surface bookkeeping (`surface`)
//!
//! The display controller executes methods asynchronously; everything here
//! is written for a single-threaded caller holding one coarse driver lock.
//! Completion is observed by polling hardware-written memory, never by
//! sleeping in the kernel sense: waits spin cooperatively through
//! [`rm::HostOps::yield_now`] and degrade gracefully on timeout.

pub mod dma;
pub mod mem;
pub mod notifier;
pub mod rm;
pub mod surface;
pub mod types;
pub mod update;

pub use dma::{ChannelIo, EvoChannel};
pub use mem::DmaMemory;
pub use notifier::{NisoFormat, NotifierStatus, ParsedNotifier};
pub use rm::{HostOps, ResourceManager, RmHandle, RmStatus, SystemHost};
pub use surface::{SurfaceArena, SurfaceEvo, SurfaceHandle, SurfaceUsageClearer};
pub use types::{ChannelMask, DeviceCaps, SubDevMask};
pub use update::{SubDevMaskStack, UpdateState};

use core::fmt;

/// Maximum number of subdevices (physical GPUs) behind one device.
pub const MAX_SUBDEVICES: usize = 8;

/// Maximum number of heads per disp.
pub const MAX_HEADS: usize = 4;

/// Maximum number of layers composited by one head.
pub const MAX_LAYERS_PER_HEAD: usize = 8;

/// Maximum number of planes in a registered surface (e.g. semi-planar YUV).
pub const MAX_PLANES: usize = 3;

/// Stereo eye count.
pub const MAX_EYES: usize = 2;
pub const LEFT: usize = 0;
pub const RIGHT: usize = 1;

/// Timeouts are stretched by this factor on simulated/emulated hardware.
pub const SOFTWARE_TIMEOUT_SCALE: u32 = 100;

/// Result type for display core operations
pub type Result<T> = core::result::Result<T, Error>;

/// Display core error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Out of memory or out of handle slots
    OutOfMemory,
    /// A handle did not resolve to a live object
    InvalidHandle,
    /// A request parameter failed validation
    InvalidParameter,
    /// The operation is not supported by this device's capabilities
    NotSupported,
    /// The caller does not own the object it tried to modify
    PermissionDenied,
    /// The object still has hardware-visible references
    ObjectInUse,
    /// A resource-manager call failed
    Rm(rm::RmStatus),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::InvalidHandle => write!(f, "Invalid handle"),
            Error::InvalidParameter => write!(f, "Invalid parameter"),
            Error::NotSupported => write!(f, "Not supported"),
            Error::PermissionDenied => write!(f, "Permission denied"),
            Error::ObjectInUse => write!(f, "Object in use"),
            Error::Rm(status) => write!(f, "Resource manager call failed: {}", status),
        }
    }
}
