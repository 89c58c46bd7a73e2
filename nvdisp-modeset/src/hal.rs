// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Display method encoders
//!
//! The method layout of the display controller differs between the EVO
//! generations and NVDisplay. One encoder is selected at device init
//! from the core channel's hardware class and never re-dispatched per
//! call; everything above this module programs channels through the
//! [`CoreChannelHal`] trait.

use nvdisp_core::dma::EvoChannel;
use nvdisp_core::notifier::NisoFormat;
use nvdisp_core::types::FrameSize;

use crate::modeset::DisplayMode;

/// Options for an UPDATE kick into one channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateFlags {
    /// Latch this channel's state together with the core channel.
    pub interlock_with_core: bool,
    /// The channel was programmed with a flip-lock qualifying flip.
    pub flip_lock_qualifying: bool,
    /// Release the exception latch at the update.
    pub release_elv: bool,
}

/// A semaphore reference resolved for hardware consumption.
#[derive(Debug, Clone, Copy)]
pub struct HwSemaphore {
    pub ctx_dma: u32,
    pub offset_in_words: u32,
    pub value: u32,
}

/// A completion notifier reference resolved for hardware consumption.
#[derive(Debug, Clone, Copy)]
pub struct HwNotifier {
    pub ctx_dma: u32,
    pub offset_in_words: u32,
}

/// A fully resolved per-layer flip, ready to encode.
#[derive(Debug, Clone, Copy)]
pub struct HwFlipState {
    /// Context DMA of the scanout surface; 0 flips the layer to NULL.
    pub ctx_dma: u32,
    pub offset: u64,
    pub pitch: u32,
    pub size_in: FrameSize,
    pub size_out: FrameSize,
    pub min_present_interval: u8,
    pub tearing: bool,
    pub sem_acquire: Option<HwSemaphore>,
    pub sem_release: Option<HwSemaphore>,
    pub notifier: Option<HwNotifier>,
}

impl HwFlipState {
    /// A flip away from any surface.
    pub fn null() -> Self {
        Self {
            ctx_dma: 0,
            offset: 0,
            pitch: 0,
            size_in: FrameSize::default(),
            size_out: FrameSize::default(),
            min_present_interval: 1,
            tearing: false,
            sem_acquire: None,
            sem_release: None,
            notifier: None,
        }
    }
}

/// A cursor image resolved for hardware consumption.
#[derive(Debug, Clone, Copy)]
pub struct CursorImage {
    pub ctx_dma: u32,
    pub offset: u64,
    pub size: u32,
    pub hot_spot: (i16, i16),
}

/// Method encoder for one display hardware generation.
pub trait CoreChannelHal: Send + Sync {
    fn name(&self) -> &'static str;

    /// Notifier/semaphore memory format this generation writes.
    fn notifier_format(&self) -> NisoFormat;

    /// Emit UPDATE into a channel.
    fn update(&self, ch: &mut EvoChannel, flags: &UpdateFlags);

    /// Program one layer's flip into its channel.
    fn flip_layer(&self, ch: &mut EvoChannel, st: &HwFlipState);

    /// Point the core channel's completion notifier at `slot` of the
    /// device notifier aperture, or disarm it.
    fn set_notifier_control(&self, ch: &mut EvoChannel, ctx_dma: u32, slot: u32, enable: bool);

    /// Program a head's raster timings.
    fn set_raster(&self, ch: &mut EvoChannel, head: u32, mode: &DisplayMode);

    /// Move the scanout window origin within the scanned surface.
    fn set_viewport_point_in(&self, ch: &mut EvoChannel, head: u32, x: u32, y: u32);

    /// Detach a head from its raster and outputs.
    fn shutdown_head(&self, ch: &mut EvoChannel, head: u32);

    /// Attach or detach the cursor image for a head.
    fn set_cursor_image(&self, ch: &mut EvoChannel, head: u32, image: Option<&CursorImage>);

    /// Cursor position through a DMA immediate channel.
    fn cursor_position(&self, ch: &mut EvoChannel, head: u32, x: i16, y: i16);
}

/// Select the encoder for a core channel hardware class.
pub fn core_channel_hal(hwclass: u32) -> Option<Box<dyn CoreChannelHal>> {
    match hwclass {
        0x917d | 0x927d | 0x947d | 0x957d => Some(Box::new(Evo3Hal)),
        0xc37d | 0xc57d | 0xc67d | 0xc77d => Some(Box::new(NvDisplayHal)),
        _ => None,
    }
}

fn pack_size(size: FrameSize) -> u32 {
    (size.height << 16) | (size.width & 0xffff)
}

fn pack_position(x: i16, y: i16) -> u32 {
    ((y as u16 as u32) << 16) | (x as u16 as u32)
}

// =============================================================================
// EVO (pre-Volta) ENCODER
// =============================================================================

mod evo3 {
    pub const UPDATE: u32 = 0x0080;
    pub const UPDATE_INTERLOCK_WITH_CORE: u32 = 1 << 0;
    pub const UPDATE_FLIP_LOCK_QUALIFYING: u32 = 1 << 1;
    pub const UPDATE_RELEASE_ELV: u32 = 1 << 2;

    pub const SET_CONTEXT_DMA_NOTIFIER: u32 = 0x0084;
    pub const SET_NOTIFIER_CONTROL: u32 = 0x0088;
    pub const NOTIFIER_CONTROL_ENABLE: u32 = 1 << 31;

    pub const SET_PRESENT_CONTROL: u32 = 0x00a0;
    pub const PRESENT_TEARING: u32 = 1 << 0;
    pub const PRESENT_INTERVAL_SHIFT: u32 = 4;

    pub const SET_SEMAPHORE_CONTEXT_DMA: u32 = 0x00c0;
    pub const SET_SEMAPHORE_ACQUIRE: u32 = 0x00c4;
    pub const SET_SEMAPHORE_RELEASE: u32 = 0x00c8;
    pub const SET_SEMAPHORE_OFFSET: u32 = 0x00cc;

    pub const SET_CONTEXT_DMA_ISO: u32 = 0x0100;
    /// Two-dword write: offset high, then offset low at the next register.
    pub const SET_SURFACE_OFFSET_HI: u32 = 0x0104;
    pub const SET_SURFACE_PITCH: u32 = 0x010c;
    pub const SET_SIZE_IN: u32 = 0x0110;
    pub const SET_SIZE_OUT: u32 = 0x0114;

    pub const HEAD_BASE: u32 = 0x0400;
    pub const HEAD_STRIDE: u32 = 0x0400;
    pub const HEAD_SET_RASTER_SIZE: u32 = 0x0000;
    pub const HEAD_SET_PIXEL_CLOCK: u32 = 0x0004;
    pub const HEAD_SET_VIEWPORT_POINT_IN: u32 = 0x0008;
    pub const HEAD_SET_CONTROL: u32 = 0x000c;
    pub const HEAD_SET_CURSOR_CONTROL: u32 = 0x0010;
    pub const HEAD_SET_CURSOR_OFFSET: u32 = 0x0014;
    pub const HEAD_SET_CURSOR_IMAGE: u32 = 0x0018;
    pub const HEAD_SET_CURSOR_POSITION: u32 = 0x001c;
    pub const HEAD_SET_CURSOR_HOT_SPOT: u32 = 0x0020;
    pub const HEAD_ACTIVE: u32 = 1 << 0;
    pub const CURSOR_ENABLE: u32 = 1 << 31;
}

pub struct Evo3Hal;

impl Evo3Hal {
    fn head_offset(head: u32, method: u32) -> u32 {
        evo3::HEAD_BASE + head * evo3::HEAD_STRIDE + method
    }
}

impl CoreChannelHal for Evo3Hal {
    fn name(&self) -> &'static str {
        "evo3"
    }

    fn notifier_format(&self) -> NisoFormat {
        NisoFormat::FourWord
    }

    fn update(&self, ch: &mut EvoChannel, flags: &UpdateFlags) {
        let mut value = 0;
        if flags.interlock_with_core {
            value |= evo3::UPDATE_INTERLOCK_WITH_CORE;
        }
        if flags.flip_lock_qualifying {
            value |= evo3::UPDATE_FLIP_LOCK_QUALIFYING;
        }
        if flags.release_elv {
            value |= evo3::UPDATE_RELEASE_ELV;
        }
        ch.method_one(evo3::UPDATE, value);
    }

    fn flip_layer(&self, ch: &mut EvoChannel, st: &HwFlipState) {
        if let Some(notifier) = &st.notifier {
            ch.method_one(evo3::SET_CONTEXT_DMA_NOTIFIER, notifier.ctx_dma);
            ch.method_one(
                evo3::SET_NOTIFIER_CONTROL,
                evo3::NOTIFIER_CONTROL_ENABLE | notifier.offset_in_words,
            );
        } else {
            ch.method_one(evo3::SET_CONTEXT_DMA_NOTIFIER, 0);
        }

        match (&st.sem_acquire, &st.sem_release) {
            (None, None) => ch.method_one(evo3::SET_SEMAPHORE_CONTEXT_DMA, 0),
            (acq, rel) => {
                let ctx_dma = acq
                    .map(|s| s.ctx_dma)
                    .or(rel.map(|s| s.ctx_dma))
                    .unwrap_or(0);
                let offset = acq
                    .map(|s| s.offset_in_words)
                    .or(rel.map(|s| s.offset_in_words))
                    .unwrap_or(0);
                ch.method_one(evo3::SET_SEMAPHORE_CONTEXT_DMA, ctx_dma);
                ch.method_one(evo3::SET_SEMAPHORE_OFFSET, offset * 4);
                ch.method_one(evo3::SET_SEMAPHORE_ACQUIRE, acq.map(|s| s.value).unwrap_or(0));
                ch.method_one(evo3::SET_SEMAPHORE_RELEASE, rel.map(|s| s.value).unwrap_or(0));
            }
        }

        let mut present = u32::from(st.min_present_interval) << evo3::PRESENT_INTERVAL_SHIFT;
        if st.tearing {
            present |= evo3::PRESENT_TEARING;
        }
        ch.method_one(evo3::SET_PRESENT_CONTROL, present);

        ch.method_one(evo3::SET_CONTEXT_DMA_ISO, st.ctx_dma);
        if st.ctx_dma != 0 {
            ch.method(
                evo3::SET_SURFACE_OFFSET_HI,
                &[(st.offset >> 32) as u32, st.offset as u32],
            );
            ch.method_one(evo3::SET_SURFACE_PITCH, st.pitch);
            ch.method_one(evo3::SET_SIZE_IN, pack_size(st.size_in));
            ch.method_one(evo3::SET_SIZE_OUT, pack_size(st.size_out));
        }
    }

    fn set_notifier_control(&self, ch: &mut EvoChannel, ctx_dma: u32, slot: u32, enable: bool) {
        if enable {
            ch.method_one(evo3::SET_CONTEXT_DMA_NOTIFIER, ctx_dma);
            ch.method_one(
                evo3::SET_NOTIFIER_CONTROL,
                evo3::NOTIFIER_CONTROL_ENABLE | slot,
            );
        } else {
            ch.method_one(evo3::SET_NOTIFIER_CONTROL, 0);
            ch.method_one(evo3::SET_CONTEXT_DMA_NOTIFIER, 0);
        }
    }

    fn set_raster(&self, ch: &mut EvoChannel, head: u32, mode: &DisplayMode) {
        ch.method_one(
            Self::head_offset(head, evo3::HEAD_SET_RASTER_SIZE),
            pack_size(FrameSize::new(mode.h_visible, mode.v_visible)),
        );
        ch.method_one(
            Self::head_offset(head, evo3::HEAD_SET_PIXEL_CLOCK),
            mode.pixel_clock_khz,
        );
        ch.method_one(
            Self::head_offset(head, evo3::HEAD_SET_CONTROL),
            evo3::HEAD_ACTIVE,
        );
    }

    fn set_viewport_point_in(&self, ch: &mut EvoChannel, head: u32, x: u32, y: u32) {
        ch.method_one(
            Self::head_offset(head, evo3::HEAD_SET_VIEWPORT_POINT_IN),
            (y << 16) | (x & 0xffff),
        );
    }

    fn shutdown_head(&self, ch: &mut EvoChannel, head: u32) {
        ch.method_one(Self::head_offset(head, evo3::HEAD_SET_CONTROL), 0);
        ch.method_one(Self::head_offset(head, evo3::HEAD_SET_CURSOR_CONTROL), 0);
    }

    fn set_cursor_image(&self, ch: &mut EvoChannel, head: u32, image: Option<&CursorImage>) {
        match image {
            Some(image) => {
                ch.method_one(
                    Self::head_offset(head, evo3::HEAD_SET_CURSOR_CONTROL),
                    evo3::CURSOR_ENABLE | image.size,
                );
                ch.method(
                    Self::head_offset(head, evo3::HEAD_SET_CURSOR_OFFSET),
                    &[(image.offset >> 32) as u32, image.offset as u32],
                );
                ch.method_one(
                    Self::head_offset(head, evo3::HEAD_SET_CURSOR_IMAGE),
                    image.ctx_dma,
                );
                ch.method_one(
                    Self::head_offset(head, evo3::HEAD_SET_CURSOR_HOT_SPOT),
                    pack_position(image.hot_spot.0, image.hot_spot.1),
                );
            }
            None => {
                ch.method_one(Self::head_offset(head, evo3::HEAD_SET_CURSOR_CONTROL), 0);
                ch.method_one(Self::head_offset(head, evo3::HEAD_SET_CURSOR_IMAGE), 0);
            }
        }
    }

    fn cursor_position(&self, ch: &mut EvoChannel, head: u32, x: i16, y: i16) {
        ch.method_one(
            Self::head_offset(head, evo3::HEAD_SET_CURSOR_POSITION),
            pack_position(x, y),
        );
    }
}

// =============================================================================
// NVDISPLAY ENCODER
// =============================================================================

mod nvd {
    pub const UPDATE: u32 = 0x0200;
    pub const UPDATE_RELEASE_ELV: u32 = 1 << 0;
    pub const UPDATE_FLIP_LOCK_QUALIFYING: u32 = 1 << 4;
    pub const UPDATE_INTERLOCK_WITH_CORE: u32 = 1 << 8;

    pub const SET_CONTEXT_DMA_NOTIFIER: u32 = 0x0208;
    pub const SET_NOTIFIER_CONTROL: u32 = 0x020c;
    pub const NOTIFIER_CONTROL_ENABLE: u32 = 1 << 0;
    pub const NOTIFIER_OFFSET_SHIFT: u32 = 8;

    pub const SET_PRESENT_CONTROL: u32 = 0x0224;
    pub const PRESENT_TEARING: u32 = 1 << 0;
    pub const PRESENT_INTERVAL_SHIFT: u32 = 8;

    pub const SET_SEMAPHORE_CONTROL: u32 = 0x0240;
    pub const SET_SEMAPHORE_ACQUIRE: u32 = 0x0244;
    pub const SET_SEMAPHORE_RELEASE: u32 = 0x0248;
    pub const SET_CONTEXT_DMA_SEMAPHORE: u32 = 0x024c;

    pub const SET_CONTEXT_DMA_ISO: u32 = 0x0280;
    pub const SET_OFFSET_HI: u32 = 0x0284;
    pub const SET_OFFSET_LO: u32 = 0x0288;
    pub const SET_PLANAR_STORAGE: u32 = 0x028c;
    pub const SET_SIZE_IN: u32 = 0x0290;
    pub const SET_SIZE_OUT: u32 = 0x0294;

    pub const HEAD_BASE: u32 = 0x2000;
    pub const HEAD_STRIDE: u32 = 0x0800;
    pub const HEAD_SET_RASTER_SIZE: u32 = 0x0000;
    pub const HEAD_SET_PIXEL_CLOCK: u32 = 0x0008;
    pub const HEAD_SET_VIEWPORT_POINT_IN: u32 = 0x0030;
    pub const HEAD_SET_CONTROL: u32 = 0x0040;
    pub const HEAD_SET_CURSOR_CONTROL: u32 = 0x0050;
    pub const HEAD_SET_CURSOR_OFFSET: u32 = 0x0054;
    pub const HEAD_SET_CONTEXT_DMA_CURSOR: u32 = 0x005c;
    pub const HEAD_SET_CURSOR_POSITION: u32 = 0x0060;
    pub const HEAD_SET_CURSOR_HOT_SPOT: u32 = 0x0064;
    pub const HEAD_ACTIVE: u32 = 1 << 0;
    pub const CURSOR_ENABLE: u32 = 1 << 0;
    pub const CURSOR_SIZE_SHIFT: u32 = 8;
}

pub struct NvDisplayHal;

impl NvDisplayHal {
    fn head_offset(head: u32, method: u32) -> u32 {
        nvd::HEAD_BASE + head * nvd::HEAD_STRIDE + method
    }
}

impl CoreChannelHal for NvDisplayHal {
    fn name(&self) -> &'static str {
        "nvdisplay"
    }

    fn notifier_format(&self) -> NisoFormat {
        NisoFormat::FourWordNvDisplay
    }

    fn update(&self, ch: &mut EvoChannel, flags: &UpdateFlags) {
        let mut value = 0;
        if flags.interlock_with_core {
            value |= nvd::UPDATE_INTERLOCK_WITH_CORE;
        }
        if flags.flip_lock_qualifying {
            value |= nvd::UPDATE_FLIP_LOCK_QUALIFYING;
        }
        if flags.release_elv {
            value |= nvd::UPDATE_RELEASE_ELV;
        }
        ch.method_one(nvd::UPDATE, value);
    }

    fn flip_layer(&self, ch: &mut EvoChannel, st: &HwFlipState) {
        if let Some(notifier) = &st.notifier {
            ch.method_one(nvd::SET_CONTEXT_DMA_NOTIFIER, notifier.ctx_dma);
            ch.method_one(
                nvd::SET_NOTIFIER_CONTROL,
                nvd::NOTIFIER_CONTROL_ENABLE
                    | (notifier.offset_in_words << nvd::NOTIFIER_OFFSET_SHIFT),
            );
        } else {
            ch.method_one(nvd::SET_CONTEXT_DMA_NOTIFIER, 0);
        }

        match (&st.sem_acquire, &st.sem_release) {
            (None, None) => ch.method_one(nvd::SET_CONTEXT_DMA_SEMAPHORE, 0),
            (acq, rel) => {
                let ctx_dma = acq
                    .map(|s| s.ctx_dma)
                    .or(rel.map(|s| s.ctx_dma))
                    .unwrap_or(0);
                let offset = acq
                    .map(|s| s.offset_in_words)
                    .or(rel.map(|s| s.offset_in_words))
                    .unwrap_or(0);
                ch.method_one(nvd::SET_CONTEXT_DMA_SEMAPHORE, ctx_dma);
                ch.method_one(nvd::SET_SEMAPHORE_CONTROL, offset);
                ch.method_one(nvd::SET_SEMAPHORE_ACQUIRE, acq.map(|s| s.value).unwrap_or(0));
                ch.method_one(nvd::SET_SEMAPHORE_RELEASE, rel.map(|s| s.value).unwrap_or(0));
            }
        }

        let mut present = u32::from(st.min_present_interval) << nvd::PRESENT_INTERVAL_SHIFT;
        if st.tearing {
            present |= nvd::PRESENT_TEARING;
        }
        ch.method_one(nvd::SET_PRESENT_CONTROL, present);

        ch.method_one(nvd::SET_CONTEXT_DMA_ISO, st.ctx_dma);
        if st.ctx_dma != 0 {
            ch.method_one(nvd::SET_OFFSET_HI, (st.offset >> 32) as u32);
            ch.method_one(nvd::SET_OFFSET_LO, st.offset as u32);
            ch.method_one(nvd::SET_PLANAR_STORAGE, st.pitch);
            ch.method_one(nvd::SET_SIZE_IN, pack_size(st.size_in));
            ch.method_one(nvd::SET_SIZE_OUT, pack_size(st.size_out));
        }
    }

    fn set_notifier_control(&self, ch: &mut EvoChannel, ctx_dma: u32, slot: u32, enable: bool) {
        if enable {
            ch.method_one(nvd::SET_CONTEXT_DMA_NOTIFIER, ctx_dma);
            ch.method_one(
                nvd::SET_NOTIFIER_CONTROL,
                nvd::NOTIFIER_CONTROL_ENABLE | (slot << nvd::NOTIFIER_OFFSET_SHIFT),
            );
        } else {
            ch.method_one(nvd::SET_NOTIFIER_CONTROL, 0);
            ch.method_one(nvd::SET_CONTEXT_DMA_NOTIFIER, 0);
        }
    }

    fn set_raster(&self, ch: &mut EvoChannel, head: u32, mode: &DisplayMode) {
        ch.method_one(
            Self::head_offset(head, nvd::HEAD_SET_RASTER_SIZE),
            pack_size(FrameSize::new(mode.h_visible, mode.v_visible)),
        );
        ch.method_one(
            Self::head_offset(head, nvd::HEAD_SET_PIXEL_CLOCK),
            mode.pixel_clock_khz,
        );
        ch.method_one(
            Self::head_offset(head, nvd::HEAD_SET_CONTROL),
            nvd::HEAD_ACTIVE,
        );
    }

    fn set_viewport_point_in(&self, ch: &mut EvoChannel, head: u32, x: u32, y: u32) {
        ch.method_one(
            Self::head_offset(head, nvd::HEAD_SET_VIEWPORT_POINT_IN),
            (y << 16) | (x & 0xffff),
        );
    }

    fn shutdown_head(&self, ch: &mut EvoChannel, head: u32) {
        ch.method_one(Self::head_offset(head, nvd::HEAD_SET_CONTROL), 0);
        ch.method_one(Self::head_offset(head, nvd::HEAD_SET_CURSOR_CONTROL), 0);
    }

    fn set_cursor_image(&self, ch: &mut EvoChannel, head: u32, image: Option<&CursorImage>) {
        match image {
            Some(image) => {
                ch.method_one(
                    Self::head_offset(head, nvd::HEAD_SET_CURSOR_CONTROL),
                    nvd::CURSOR_ENABLE | (image.size << nvd::CURSOR_SIZE_SHIFT),
                );
                ch.method(
                    Self::head_offset(head, nvd::HEAD_SET_CURSOR_OFFSET),
                    &[(image.offset >> 32) as u32, image.offset as u32],
                );
                ch.method_one(
                    Self::head_offset(head, nvd::HEAD_SET_CONTEXT_DMA_CURSOR),
                    image.ctx_dma,
                );
                ch.method_one(
                    Self::head_offset(head, nvd::HEAD_SET_CURSOR_HOT_SPOT),
                    pack_position(image.hot_spot.0, image.hot_spot.1),
                );
            }
            None => {
                ch.method_one(Self::head_offset(head, nvd::HEAD_SET_CURSOR_CONTROL), 0);
                ch.method_one(Self::head_offset(head, nvd::HEAD_SET_CONTEXT_DMA_CURSOR), 0);
            }
        }
    }

    fn cursor_position(&self, ch: &mut EvoChannel, head: u32, x: i16, y: i16) {
        ch.method_one(
            Self::head_offset(head, nvd::HEAD_SET_CURSOR_POSITION),
            pack_position(x, y),
        );
    }
}
