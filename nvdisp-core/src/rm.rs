//! Resource manager and host service seams
//!
//! The resource manager owns the register-level hardware state (on GSP
//! systems it lives in firmware on the GSP RISC-V coprocessor); this core
//! only sees it as a blocking RPC returning a status code. The host
//! services trait supplies microsecond timestamps and a cooperative yield
//! for the polling loops in `dma` and `notifier`.

use core::fmt;

/// Status code returned by resource manager calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmStatus {
    Success,
    OutOfMemory,
    InvalidObject,
    InvalidArgument,
    InvalidState,
    Timeout,
    Generic,
}

impl RmStatus {
    pub fn is_success(self) -> bool {
        self == RmStatus::Success
    }
}

impl fmt::Display for RmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RmStatus::Success => write!(f, "success"),
            RmStatus::OutOfMemory => write!(f, "out of memory"),
            RmStatus::InvalidObject => write!(f, "invalid object"),
            RmStatus::InvalidArgument => write!(f, "invalid argument"),
            RmStatus::InvalidState => write!(f, "invalid state"),
            RmStatus::Timeout => write!(f, "timeout"),
            RmStatus::Generic => write!(f, "generic failure"),
        }
    }
}

/// An opaque object handle in the resource manager's namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RmHandle(pub u32);

impl RmHandle {
    pub const NONE: RmHandle = RmHandle(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Allocator for resource manager handles.
///
/// Handles are plain integers unique within our client; the resource
/// manager only requires that we never reuse a live one.
pub struct RmHandlePool {
    next: u32,
}

impl RmHandlePool {
    pub fn new() -> Self {
        // Handle 0 is reserved as "no handle".
        Self { next: 1 }
    }

    pub fn alloc(&mut self) -> RmHandle {
        let handle = RmHandle(self.next);
        self.next += 1;
        handle
    }
}

impl Default for RmHandlePool {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters for an IMP (infrastructure validation) query: can the
/// proposed head configuration be driven within memory bandwidth limits?
#[derive(Debug, Clone, Copy, Default)]
pub struct ImpRequest {
    pub num_active_heads: u32,
    pub total_pclk_khz: u32,
    /// Whether any head applies output scaling.
    pub output_scaling: bool,
}

/// Blocking RPC interface to the resource manager.
///
/// Every method maps to one rmAlloc/rmFree/rmControl round trip. Calls
/// are synchronous; on GSP configurations the latency includes a firmware
/// message round trip, which is why callers batch hardware teardown
/// rather than issuing per-object waits.
pub trait ResourceManager: Send + Sync {
    /// Allocate a display channel object of the given hardware class.
    fn alloc_display_channel(&self, handle: RmHandle, hwclass: u32, instance: u32) -> RmStatus;

    /// Allocate a memory object of `size` bytes.
    fn alloc_memory(&self, handle: RmHandle, size: u64) -> RmStatus;

    /// Duplicate a memory object owned by another client into our
    /// namespace under `handle`.
    fn dup_memory(&self, handle: RmHandle, src: RmHandle) -> RmStatus;

    /// Free any object.
    fn free(&self, handle: RmHandle) -> RmStatus;

    /// Make framebuffer writes from the CPU visible to the display
    /// controller on one subdevice.
    fn flush_framebuffer(&self, sd: u32) -> RmStatus;

    /// Force a stalled channel to make progress by ignoring unsatisfied
    /// acquires.
    fn accelerate_channel(&self, channel: RmHandle) -> RmStatus;

    /// Validate a proposed mode configuration against IMP.
    fn validate_imp(&self, req: &ImpRequest) -> RmStatus;
}

/// Timestamps and cooperative yielding supplied by the host environment.
pub trait HostOps: Send + Sync {
    /// Monotonic microsecond counter.
    fn get_usec(&self) -> u64;

    /// Hint that the caller is in a polling loop. Not a scheduler yield;
    /// just an opportunity for interrupt work to run.
    fn yield_now(&self);
}

/// `HostOps` backed by the standard library.
pub struct SystemHost {
    start: std::time::Instant,
}

impl SystemHost {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostOps for SystemHost {
    fn get_usec(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}
