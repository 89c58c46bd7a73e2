// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Display modeset engine for NVIDIA GPUs
//!
//! Orchestrates the display controller through the primitives in
//! `nvdisp-core`: validated modesets and atomic multi-channel flips,
//! console restore, headSurface compositing with swap groups, cursor
//! and vblank-semaphore satellites.
//!
//! The engine is single-threaded by design: hardware interrupts and
//! client requests are serialized by one coarse lock ([`NvDisp`] wraps
//! the context in a mutex), and everything below runs with no internal
//! locking. Hardware completion is observed by polling notifiers, never
//! by blocking on interrupts.
//!
//! There are no globals; all state lives in a [`DevEvo`] constructed
//! from an [`NvDispConfig`] and threaded by reference.

use std::sync::Arc;

use parking_lot::Mutex;

use nvdisp_core::dma::{ChannelCaps, ChannelDesc, ChannelIo, EvoChannel};
use nvdisp_core::mem::DmaMemory;
use nvdisp_core::notifier::{self, NisoFormat, NotifierWait};
use nvdisp_core::rm::{HostOps, ResourceManager, RmHandle, RmHandlePool};
use nvdisp_core::surface::{
    SurfaceArena, SurfaceHandle, SurfaceRegisterRequest, SurfaceUsageClearer,
};
use nvdisp_core::types::{ChannelMask, ClientRef, CursorChannelKind, DeviceCaps, SubDevMask};
use nvdisp_core::update::{SubDevMaskStack, UpdateState};
use nvdisp_core::{Error, Result, MAX_HEADS, MAX_LAYERS_PER_HEAD};

pub mod cursor;
pub mod flip;
pub mod hal;
pub mod headsurface;
pub mod modeset;
pub mod vblank_sem;

#[cfg(test)]
pub(crate) mod testutil;

pub use cursor::{CursorPio, CursorState};
pub use flip::{
    FlipReply, FlipRequest, FlipRequestOneHead, FlipSync, LayerFlipState, NotifierSpec,
    SemaphoreSpec,
};
pub use hal::{CoreChannelHal, HwFlipState};
pub use headsurface::{
    HsChannel, HsChannelConfig, HsRenderer, NextFrameRequestType, SwapGroup,
};
pub use modeset::{
    DisplayMode, DpyEvo, DpyId, SetModeOneHead, SetModeRequest, TileInfo, TileTopologyId,
};
pub use vblank_sem::VblankSemControl;

use crate::cursor::CursorState as Cursor;
use crate::hal::{core_channel_hal, CursorImage, UpdateFlags};
use crate::headsurface::HsDevice;

/// Window channel index carrying the DMA cursor immediate channel.
pub(crate) const CURSOR_DMA_WINDOW: u32 = 0;

/// Default per-channel push buffer size, in dwords.
pub const DEFAULT_RING_DWORDS: usize = 4096;

/// Slots in the core channel's completion notifier aperture.
const CORE_NOTIFIER_SLOTS: usize = 4;
const UPDATE_SYNC_SLOT: u32 = 0;

/// Access to the device's channel registers, supplied by the platform
/// layer that mapped the hardware (or a model of it).
pub trait DisplayIo: Send + Sync {
    /// GET/PUT register access for the channel identified by `mask`.
    fn channel_io(&self, mask: ChannelMask) -> Arc<dyn ChannelIo>;

    /// PIO cursor position registers, when the device has them.
    fn cursor_pio(&self) -> Option<Arc<dyn CursorPio>> {
        None
    }

    /// Capabilities of the channel identified by `mask`.
    fn channel_caps(&self, mask: ChannelMask) -> ChannelCaps {
        let _ = mask;
        ChannelCaps::default()
    }
}

/// Construction parameters for a display device.
pub struct NvDispConfig {
    pub caps: DeviceCaps,
    pub rm: Arc<dyn ResourceManager>,
    pub host: Arc<dyn HostOps>,
    pub io: Arc<dyn DisplayIo>,
    /// Enables headSurface compositing when present.
    pub renderer: Option<Box<dyn HsRenderer>>,
    pub ring_dwords: usize,
}

/// The device's display channels plus the method encoder driving them.
pub struct ChannelSet {
    hal: Box<dyn CoreChannelHal>,
    pub core: EvoChannel,
    pub base: Vec<EvoChannel>,
    pub overlay: Vec<EvoChannel>,
    pub cursor_dma: Option<EvoChannel>,
    sdm: SubDevMaskStack,
    num_subdevices: u32,
}

impl ChannelSet {
    /// Channel mask bit for one head's layer channel.
    pub(crate) fn layer_mask(head: u32, layer: u32) -> ChannelMask {
        if layer == 0 {
            ChannelMask::base(head)
        } else {
            ChannelMask::overlay(head)
        }
    }

    pub(crate) fn notifier_format(&self) -> NisoFormat {
        self.hal.notifier_format()
    }

    pub(crate) fn layer_channel_caps(&self, head: u32, layer: u32) -> ChannelCaps {
        if layer == 0 {
            self.base[head as usize].caps
        } else {
            self.overlay[head as usize].caps
        }
    }

    /// Run one encoder operation against a layer channel with the
    /// subdevice mask scoped to `sdm`; the previous mask is restored on
    /// every exit path.
    fn with_layer_channel<R>(
        &mut self,
        head: u32,
        layer: u32,
        sdm: SubDevMask,
        f: impl FnOnce(&dyn CoreChannelHal, &mut EvoChannel) -> R,
    ) -> R {
        let result = {
            let _scope = self.sdm.push(sdm);
            let mask = self.sdm.current();
            let ch = if layer == 0 {
                &mut self.base[head as usize]
            } else {
                &mut self.overlay[head as usize]
            };
            ch.set_subdevice_mask(mask);
            f(&*self.hal, ch)
        };
        let mask = self.sdm.current();
        let ch = if layer == 0 {
            &mut self.base[head as usize]
        } else {
            &mut self.overlay[head as usize]
        };
        ch.set_subdevice_mask(mask);
        result
    }

    fn with_core_channel<R>(
        &mut self,
        sdm: SubDevMask,
        f: impl FnOnce(&dyn CoreChannelHal, &mut EvoChannel) -> R,
    ) -> R {
        let result = {
            let _scope = self.sdm.push(sdm);
            let mask = self.sdm.current();
            self.core.set_subdevice_mask(mask);
            f(&*self.hal, &mut self.core)
        };
        self.core.set_subdevice_mask(self.sdm.current());
        result
    }

    pub(crate) fn flip_layer(&mut self, head: u32, layer: u32, sdm: SubDevMask, st: &HwFlipState) {
        self.with_layer_channel(head, layer, sdm, |hal, ch| hal.flip_layer(ch, st));
    }

    pub(crate) fn set_raster(&mut self, head: u32, mode: &DisplayMode, sdm: SubDevMask) {
        self.with_core_channel(sdm, |hal, ch| hal.set_raster(ch, head, mode));
    }

    pub(crate) fn shutdown_head(&mut self, head: u32, sdm: SubDevMask) {
        self.with_core_channel(sdm, |hal, ch| hal.shutdown_head(ch, head));
    }

    pub(crate) fn set_viewport_point_in(&mut self, head: u32, x: u32, y: u32, sdm: SubDevMask) {
        self.with_core_channel(sdm, |hal, ch| hal.set_viewport_point_in(ch, head, x, y));
    }

    pub(crate) fn set_cursor_image(
        &mut self,
        head: u32,
        image: Option<&CursorImage>,
        sdm: SubDevMask,
    ) {
        self.with_core_channel(sdm, |hal, ch| hal.set_cursor_image(ch, head, image));
    }

    pub(crate) fn cursor_position_dma(
        &mut self,
        head: u32,
        x: i16,
        y: i16,
        sdm: SubDevMask,
    ) -> Result<()> {
        if self.cursor_dma.is_none() {
            return Err(Error::NotSupported);
        }
        {
            let _scope = self.sdm.push(sdm);
            let mask = self.sdm.current();
            if let Some(ch) = self.cursor_dma.as_mut() {
                ch.set_subdevice_mask(mask);
                self.hal.cursor_position(ch, head, x, y);
            }
        }
        let mask = self.sdm.current();
        if let Some(ch) = self.cursor_dma.as_mut() {
            ch.set_subdevice_mask(mask);
        }
        Ok(())
    }

    pub(crate) fn arm_core_notifier(&mut self, ctx_dma: u32, slot: u32, enable: bool) {
        self.hal
            .set_notifier_control(&mut self.core, ctx_dma, slot, enable);
    }

    /// Emit UPDATE into every dirty channel of the batch and kick each
    /// ring. Per-channel interlock flags come from the batch's masks;
    /// the core channel is kicked whenever anything interlocks with it.
    pub(crate) fn kickoff_update(&mut self, update: &UpdateState) {
        let num_heads = self.base.len() as u32;

        for sd in 0..self.num_subdevices {
            let flags = *update.subdev(sd);
            if flags.channel_mask.is_empty() {
                continue;
            }
            let sdm = SubDevMask::single(sd);
            let mut core_needed = flags.channel_mask.contains(ChannelMask::CORE);

            for head in 0..num_heads {
                for layer in [0u32, 1] {
                    let mask = Self::layer_mask(head, layer);
                    if !flags.channel_mask.intersects(mask) {
                        continue;
                    }
                    let interlock = !flags.no_core_interlock_mask.intersects(mask);
                    core_needed |= interlock;
                    let update_flags = UpdateFlags {
                        interlock_with_core: interlock,
                        flip_lock_qualifying: flags.flip_lock_qualifying_mask.intersects(mask),
                        release_elv: true,
                    };
                    self.with_layer_channel(head, layer, sdm, |hal, ch| {
                        hal.update(ch, &update_flags);
                        ch.kickoff();
                    });
                }
            }

            if flags.channel_mask.has_window(CURSOR_DMA_WINDOW) {
                if let Some(ch) = self.cursor_dma.as_mut() {
                    let interlock = !flags
                        .no_core_interlock_mask
                        .has_window(CURSOR_DMA_WINDOW);
                    core_needed |= interlock;
                    let update_flags = UpdateFlags {
                        interlock_with_core: interlock,
                        flip_lock_qualifying: false,
                        release_elv: true,
                    };
                    ch.set_subdevice_mask(sdm);
                    self.hal.update(ch, &update_flags);
                    ch.kickoff();
                    ch.set_subdevice_mask(SubDevMask::all(self.num_subdevices));
                }
            }

            if core_needed {
                self.with_core_channel(sdm, |hal, ch| {
                    hal.update(
                        ch,
                        &UpdateFlags {
                            interlock_with_core: false,
                            flip_lock_qualifying: false,
                            release_elv: true,
                        },
                    );
                    ch.kickoff();
                });
            }
        }
    }
}

impl SurfaceUsageClearer for ChannelSet {
    /// Flip every scanout channel to NULL and drain the device, so a
    /// surface losing its last hardware reference is provably no longer
    /// being fetched before its memory goes away.
    fn clear_surface_usage(&mut self, handles: &[SurfaceHandle]) {
        log::info!(
            "flipping {} surface(s) out of the display pipeline",
            handles.len()
        );
        let all = SubDevMask::all(self.num_subdevices);
        let mut update = UpdateState::new();
        let num_heads = self.base.len() as u32;

        for head in 0..num_heads {
            for layer in [0u32, 1] {
                self.flip_layer(head, layer, all, &HwFlipState::null());
                update.mark(all, Self::layer_mask(head, layer));
            }
        }
        self.kickoff_update(&update);

        for head in 0..num_heads as usize {
            self.base[head].wait_idle();
            self.overlay[head].wait_idle();
        }
        self.core.wait_idle();
    }
}

/// Per-head display state.
#[derive(Default)]
pub struct HeadState {
    pub mode: Option<DisplayMode>,
    pub scaling: bool,
    pub dpy: Option<DpyId>,
    /// Flip state currently scanned out, per layer.
    pub layers: [LayerFlipState; MAX_LAYERS_PER_HEAD],
    pub cursor: Cursor,
}

/// Per-subdevice display state: the heads and displays scanned out by
/// one physical GPU.
pub struct DispEvo {
    pub index: u32,
    /// Subdevice driving this disp's scanout.
    pub display_owner: u32,
    pub dpys: Vec<DpyEvo>,
    pub heads: [HeadState; MAX_HEADS],
    pub hs_channels: [Option<HsChannel>; MAX_HEADS],
    /// Swap group membership per head, indexing `DevEvo::swap_groups`.
    pub swap_group: [Option<usize>; MAX_HEADS],
    pub vblank_sem_controls: Vec<VblankSemControl>,
}

impl DispEvo {
    fn new(index: u32, display_owner: u32) -> Self {
        Self {
            index,
            display_owner,
            dpys: Vec::new(),
            heads: Default::default(),
            hs_channels: core::array::from_fn(|_| None),
            swap_group: [None; MAX_HEADS],
            vblank_sem_controls: Vec::new(),
        }
    }
}

/// The device context: every piece of modeset engine state, threaded by
/// reference into each operation.
pub struct DevEvo {
    pub caps: DeviceCaps,
    pub(crate) rm: Arc<dyn ResourceManager>,
    pub(crate) host: Arc<dyn HostOps>,
    pub(crate) handles: RmHandlePool,
    pub channels: ChannelSet,
    pub surfaces: SurfaceArena,
    pub disps: Vec<DispEvo>,
    pub(crate) cursor_pio: Option<Arc<dyn CursorPio>>,
    pub(crate) core_notifier_mem: Arc<DmaMemory>,
    pub(crate) core_notifier_ctx: RmHandle,
    pub(crate) hs: Option<HsDevice>,
    pub swap_groups: Vec<SwapGroup>,
    pub(crate) next_vblank_sem_id: u32,
}

impl DevEvo {
    pub fn new(config: NvDispConfig) -> Result<Self> {
        let NvDispConfig {
            caps,
            rm,
            host,
            io,
            renderer,
            ring_dwords,
        } = config;

        let hal = core_channel_hal(caps.core_channel_class).ok_or(Error::NotSupported)?;
        log::info!(
            "display core class {:#x} driven by the {} encoder",
            caps.core_channel_class,
            hal.name()
        );

        let mut handles = RmHandlePool::new();
        let num_subdevices = caps.num_subdevices;
        let timeout_scale = caps.timeout_scale();

        let mut alloc_channel =
            |handles: &mut RmHandlePool, mask: ChannelMask, instance: u32| -> Result<EvoChannel> {
                let handle = handles.alloc();
                let status = rm.alloc_display_channel(handle, caps.core_channel_class, instance);
                if !status.is_success() {
                    return Err(Error::Rm(status));
                }
                Ok(EvoChannel::new(
                    ChannelDesc {
                        hwclass: caps.core_channel_class,
                        instance,
                        mask,
                        handle,
                        ring_dwords,
                        num_subdevices,
                        fb_mirrored: caps.fb_mirrored_pushbuffers,
                        caps: io.channel_caps(mask),
                    },
                    io.channel_io(mask),
                    rm.clone(),
                    host.clone(),
                    timeout_scale,
                ))
            };

        let core = alloc_channel(&mut handles, ChannelMask::CORE, 0)?;
        let mut base = Vec::new();
        let mut overlay = Vec::new();
        for head in 0..caps.num_heads {
            base.push(alloc_channel(&mut handles, ChannelMask::base(head), 1 + head)?);
            overlay.push(alloc_channel(
                &mut handles,
                ChannelMask::overlay(head),
                1 + MAX_HEADS as u32 + head,
            )?);
        }
        let cursor_dma = match caps.cursor_kind {
            CursorChannelKind::Dma => Some(alloc_channel(
                &mut handles,
                ChannelMask::window(CURSOR_DMA_WINDOW),
                1 + 2 * MAX_HEADS as u32,
            )?),
            CursorChannelKind::Pio => None,
        };
        let cursor_pio = match caps.cursor_kind {
            CursorChannelKind::Pio => io.cursor_pio(),
            CursorChannelKind::Dma => None,
        };

        let format = hal.notifier_format();
        let notifier_words = CORE_NOTIFIER_SLOTS * format.notifier_size_in_words();
        let core_notifier_ctx = handles.alloc();
        let status = rm.alloc_memory(core_notifier_ctx, (notifier_words * 4) as u64);
        if !status.is_success() {
            return Err(Error::Rm(status));
        }

        let hs = match renderer {
            Some(renderer) => {
                let hs_handle = handles.alloc();
                let status = rm.alloc_memory(hs_handle, 4096);
                if !status.is_success() {
                    return Err(Error::Rm(status));
                }
                Some(HsDevice::new(format, hs_handle, num_subdevices, renderer))
            }
            None => None,
        };

        let disps = (0..num_subdevices).map(|sd| DispEvo::new(sd, sd)).collect();

        Ok(Self {
            caps,
            rm,
            host,
            handles,
            channels: ChannelSet {
                hal,
                core,
                base,
                overlay,
                cursor_dma,
                sdm: SubDevMaskStack::new(SubDevMask::all(num_subdevices)),
                num_subdevices,
            },
            surfaces: SurfaceArena::new(),
            disps,
            cursor_pio,
            core_notifier_mem: DmaMemory::new(notifier_words),
            core_notifier_ctx,
            hs,
            swap_groups: Vec::new(),
            next_vblank_sem_id: 1,
        })
    }

    // === Surface entry points ===

    pub fn register_surface(
        &mut self,
        client: ClientRef,
        req: &SurfaceRegisterRequest,
    ) -> Result<SurfaceHandle> {
        self.surfaces
            .register(&*self.rm, &mut self.handles, &self.caps, client, req)
    }

    pub fn unregister_surface(&mut self, client: ClientRef, handle: SurfaceHandle) -> Result<()> {
        self.surfaces
            .unregister(client, handle, &*self.rm, &mut self.channels)
    }

    pub fn release_surface(&mut self, client: ClientRef, handle: SurfaceHandle) -> Result<()> {
        self.surfaces
            .release(client, handle, &*self.rm, &mut self.channels)
    }

    /// Tear down everything a disconnecting client left behind.
    pub fn free_client(&mut self, client: ClientRef) {
        self.surfaces
            .free_client_surfaces(client, &*self.rm, &mut self.channels);
    }

    // === Commit ===

    /// Kick the accumulated batch into every dirty channel and
    /// optionally wait for the hardware to latch it.
    ///
    /// Consumes the state, so a batch is committed exactly once. An
    /// empty batch issues no hardware writes at all.
    pub fn update_and_kickoff(&mut self, update: UpdateState, sync: bool) {
        if update.is_empty() {
            return;
        }

        let format = self.channels.notifier_format();
        if sync {
            notifier::reset_notifier(
                format,
                false,
                UPDATE_SYNC_SLOT as usize,
                &self.core_notifier_mem,
            );
            self.channels
                .arm_core_notifier(self.core_notifier_ctx.0, UPDATE_SYNC_SLOT, true);
        }

        self.channels.kickoff_update(&update);

        if sync {
            let (word, base_bit, extent_bit, begun) = notifier::status_field_spec(format, false);
            let wait = NotifierWait {
                mem: &self.core_notifier_mem,
                offset_in_words: UPDATE_SYNC_SLOT as usize * format.notifier_size_in_words()
                    + word,
                done_base_bit: base_bit,
                done_extent_bit: extent_bit,
                expected: begun,
            };
            notifier::wait_for_notifier(
                &wait,
                true,
                &*self.host,
                self.caps.timeout_scale(),
                Some(&self.channels.core),
            );
            self.channels
                .arm_core_notifier(self.core_notifier_ctx.0, UPDATE_SYNC_SLOT, false);
            self.channels.core.kickoff();
        }
    }
}

/// The device behind the single coarse driver lock. Every entry point —
/// request paths and interrupt callbacks alike — serializes here.
pub struct NvDisp {
    dev: Mutex<DevEvo>,
}

impl NvDisp {
    pub fn new(config: NvDispConfig) -> Result<Self> {
        Ok(Self {
            dev: Mutex::new(DevEvo::new(config)?),
        })
    }

    /// Run an operation against the locked device.
    pub fn with<R>(&self, f: impl FnOnce(&mut DevEvo) -> R) -> R {
        f(&mut self.dev.lock())
    }

    pub fn flip(&self, req: &FlipRequest) -> Result<FlipReply> {
        self.dev.lock().flip(req)
    }

    pub fn set_mode(&self, req: &SetModeRequest) -> Result<()> {
        self.dev.lock().set_mode(req)
    }

    pub fn register_surface(
        &self,
        client: ClientRef,
        req: &SurfaceRegisterRequest,
    ) -> Result<SurfaceHandle> {
        self.dev.lock().register_surface(client, req)
    }

    pub fn unregister_surface(&self, client: ClientRef, handle: SurfaceHandle) -> Result<()> {
        self.dev.lock().unregister_surface(client, handle)
    }

    pub fn restore_console(&self) -> bool {
        self.dev.lock().restore_console()
    }

    pub fn on_vblank(&self, disp: usize, head: u32) {
        self.dev.lock().hs_on_vblank(disp, head);
    }

    pub fn on_rg_line1(&self, disp: usize, head: u32) {
        self.dev.lock().hs_on_rg_line1(disp, head);
    }

    pub fn on_non_stall(&self) {
        self.dev.lock().hs_on_non_stall();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_device;

    #[test]
    fn test_empty_update_state_is_a_no_op() {
        let mut dev = test_device();
        dev.update_and_kickoff(UpdateState::new(), true);
        assert_eq!(dev.channels.core.put_offset(), 0);
        for head in 0..dev.caps.num_heads as usize {
            assert_eq!(dev.channels.base[head].put_offset(), 0);
        }
    }

    #[test]
    fn test_update_batch_kicks_core_once_per_subdevice() {
        let mut dev = test_device();
        let mut update = UpdateState::new();
        update.mark(SubDevMask::single(0), ChannelMask::base(0));
        update.mark(SubDevMask::single(0), ChannelMask::base(1));

        dev.update_and_kickoff(update, false);
        assert!(dev.channels.base[0].put_offset() > 0);
        assert!(dev.channels.base[1].put_offset() > 0);
        // One UPDATE method (header + data) in the core channel.
        assert_eq!(dev.channels.core.put_offset(), 8);
    }

    #[test]
    fn test_locked_device_wrapper() {
        let disp = NvDisp::new(crate::testutil::test_config()).unwrap();
        // Nothing connected yet: restore lights nothing.
        assert!(!disp.restore_console());

        disp.with(|dev| dev.disps[0].dpys = vec![crate::testutil::test_dpy(1, true)]);
        assert!(disp.restore_console());
    }

    #[test]
    fn test_clear_surface_usage_drains_all_channels() {
        let mut dev = test_device();
        dev.channels.clear_surface_usage(&[]);
        assert!(dev.channels.core.is_idle());
        for head in 0..dev.caps.num_heads as usize {
            assert!(dev.channels.base[head].is_idle());
            assert!(dev.channels.overlay[head].is_idle());
        }
    }
}
