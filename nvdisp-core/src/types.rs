//! Shared display controller types
//!
//! Identifiers, masks and capability structures used across the core and
//! the modeset engine.

use bitflags::bitflags;

use crate::{MAX_HEADS, MAX_LAYERS_PER_HEAD};

/// Identifies a client connection, as assigned by the request dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientRef(pub u32);

/// Mask of subdevices (physical GPUs) a method write applies to.
///
/// Bit N selects subdevice N. Methods routed with a partial mask implement
/// asymmetric multi-GPU programming; the mask is carried in the push buffer
/// as a pseudo-method, not as per-method state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubDevMask(pub u32);

impl SubDevMask {
    /// Mask selecting a single subdevice.
    pub const fn single(sd: u32) -> Self {
        SubDevMask(1 << sd)
    }

    /// Mask selecting subdevices `0..num_subdevices`.
    pub const fn all(num_subdevices: u32) -> Self {
        SubDevMask((1u32 << num_subdevices) - 1)
    }

    pub const fn contains(self, sd: u32) -> bool {
        (self.0 >> sd) & 1 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

// Channel mask bit layout: core in bit 0, per-head base channels in bits
// 1..5, per-head overlay channels in bits 5..9, window channels in bits
// 9..41. Window-immediate channels reuse the window bit positions inside
// masks dedicated to them.
const BASE_SHIFT: u32 = 1;
const OVERLAY_SHIFT: u32 = 5;
const WINDOW_SHIFT: u32 = 9;

bitflags! {
    /// A set of display channels on one subdevice.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelMask: u64 {
        const CORE = 1;
        const _ = !0;
    }
}

impl ChannelMask {
    pub fn base(head: u32) -> Self {
        ChannelMask::from_bits_retain(1 << (BASE_SHIFT + head))
    }

    pub fn overlay(head: u32) -> Self {
        ChannelMask::from_bits_retain(1 << (OVERLAY_SHIFT + head))
    }

    pub fn window(window: u32) -> Self {
        ChannelMask::from_bits_retain(1 << (WINDOW_SHIFT + window))
    }

    pub fn has_base(self, head: u32) -> bool {
        self.intersects(Self::base(head))
    }

    pub fn has_overlay(self, head: u32) -> bool {
        self.intersects(Self::overlay(head))
    }

    pub fn has_window(self, window: u32) -> bool {
        self.intersects(Self::window(window))
    }
}

/// Width and height of a scanout frame, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// A rectangle within a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Pixel formats understood by the scanout hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceFormat {
    A8R8G8B8,
    X8R8G8B8,
    A2B10G10R10,
    R5G6B5,
    R16G16B16A16F,
}

impl SurfaceFormat {
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            SurfaceFormat::A8R8G8B8
            | SurfaceFormat::X8R8G8B8
            | SurfaceFormat::A2B10G10R10 => 4,
            SurfaceFormat::R5G6B5 => 2,
            SurfaceFormat::R16G16B16A16F => 8,
        }
    }
}

bitflags! {
    /// A set of surface formats, used in per-layer capability masks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FormatMask: u32 {
        const A8R8G8B8 = 1 << 0;
        const X8R8G8B8 = 1 << 1;
        const A2B10G10R10 = 1 << 2;
        const R5G6B5 = 1 << 3;
        const R16G16B16A16F = 1 << 4;
    }
}

impl FormatMask {
    pub fn from_format(format: SurfaceFormat) -> Self {
        match format {
            SurfaceFormat::A8R8G8B8 => FormatMask::A8R8G8B8,
            SurfaceFormat::X8R8G8B8 => FormatMask::X8R8G8B8,
            SurfaceFormat::A2B10G10R10 => FormatMask::A2B10G10R10,
            SurfaceFormat::R5G6B5 => FormatMask::R5G6B5,
            SurfaceFormat::R16G16B16A16F => FormatMask::R16G16B16A16F,
        }
    }
}

/// Memory layout of a registered surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceLayout {
    Pitch,
    BlockLinear,
}

/// Whether a surface is scanned out isochronously or only read on demand
/// (notifiers, semaphores).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoClass {
    Iso,
    Niso,
}

/// How cursor position updates reach the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorChannelKind {
    /// Direct PIO register writes, one control region per head.
    Pio,
    /// A DMA immediate channel shared by all heads.
    Dma,
}

/// Per-head capabilities.
#[derive(Debug, Clone, Copy)]
pub struct HeadCaps {
    pub usable: bool,
    pub max_pclk_khz: u32,
}

impl Default for HeadCaps {
    fn default() -> Self {
        Self {
            usable: true,
            max_pclk_khz: 600_000,
        }
    }
}

/// Per-layer capabilities, bounding what a flip may request.
#[derive(Debug, Clone, Copy)]
pub struct LayerCaps {
    pub usable: bool,
    pub formats: FormatMask,
    pub max_size: FrameSize,
    pub max_present_interval: u8,
}

impl Default for LayerCaps {
    fn default() -> Self {
        Self {
            usable: true,
            formats: FormatMask::all(),
            max_size: FrameSize::new(8192, 8192),
            max_present_interval: 8,
        }
    }
}

/// Device capabilities, resolved once when the device is constructed.
#[derive(Debug, Clone)]
pub struct DeviceCaps {
    pub num_subdevices: u32,
    pub num_heads: u32,
    /// Hardware class of the core channel; selects the method encoder.
    pub core_channel_class: u32,
    /// True on simulation/emulation platforms; stretches every timeout.
    pub software: bool,
    /// Push buffers live in framebuffer memory and must be mirrored+flushed
    /// on kickoff rather than fetched from system memory.
    pub fb_mirrored_pushbuffers: bool,
    pub cursor_kind: CursorChannelKind,
    pub max_cursor_size: u32,
    pub head_caps: [HeadCaps; MAX_HEADS],
    pub layer_caps: [LayerCaps; MAX_LAYERS_PER_HEAD],
}

impl DeviceCaps {
    /// Timeout multiplier for this device.
    pub fn timeout_scale(&self) -> u32 {
        if self.software {
            crate::SOFTWARE_TIMEOUT_SCALE
        } else {
            1
        }
    }

    /// Union of the formats any layer can scan out.
    pub fn any_layer_formats(&self) -> FormatMask {
        let mut mask = FormatMask::empty();
        for caps in &self.layer_caps {
            if caps.usable {
                mask |= caps.formats;
            }
        }
        mask
    }
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            num_subdevices: 1,
            num_heads: MAX_HEADS as u32,
            core_channel_class: 0,
            software: false,
            fb_mirrored_pushbuffers: false,
            cursor_kind: CursorChannelKind::Pio,
            max_cursor_size: 256,
            head_caps: [HeadCaps::default(); MAX_HEADS],
            layer_caps: [LayerCaps::default(); MAX_LAYERS_PER_HEAD],
        }
    }
}
