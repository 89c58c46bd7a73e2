// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! headSurface compositing
//!
//! When a client surface cannot be scanned out directly, frames are
//! composited by the 3D engine into driver-owned headSurface buffers and
//! the display flips between those. This module owns:
//!
//! - Per-(head, layer) flip queues of client flip requests. The entry
//!   being displayed is `current`; queued entries are promoted in strict
//!   FIFO order, and `current` may only be released (its release
//!   semaphore written, its surfaces unreferenced) once its readiness
//!   condition holds.
//! - Frame pacing: double buffering with per-(head, slot) completion
//!   notifiers, so rendering never lands in the visible buffer.
//! - SwapGroup lockstep: double-height buffers "flipped" cheaply via
//!   ViewPortIn, a real flip only when the group is ready, and a
//!   rendezvous barrier that releases no head until every member's flip
//!   has latched.

use std::collections::VecDeque;
use std::sync::Arc;

use nvdisp_core::mem::DmaMemory;
use nvdisp_core::notifier::{self, NisoFormat, NotifierStatus, ParsedNotifier};
use nvdisp_core::rm::{HostOps, ResourceManager, RmHandle};
use nvdisp_core::surface::{SurfaceArena, SurfaceHandle, SurfaceUsageClearer};
use nvdisp_core::types::{ChannelMask, FrameSize, Rect, SubDevMask};
use nvdisp_core::update::UpdateState;
use nvdisp_core::{Error, Result, LEFT, MAX_EYES, MAX_HEADS, MAX_LAYERS_PER_HEAD, MAX_SUBDEVICES};

use crate::flip::{referenced_surfaces, FlipSync, LayerFlipState, SemaphoreSpec};
use crate::hal::{HwFlipState, HwNotifier};
use crate::DevEvo;

/// Buffers per headSurface head (double buffering).
pub const HS_MAX_BUFFERS: usize = 2;

/// Completion notifier ring depth per head; bounds in-flight frames so
/// rendering never overwrites a not-yet-consumed notifier.
pub const HS_NOTIFIERS_PER_HEAD: usize = 4;

/// Frame semaphore ring depth per head.
pub const HS_FRAME_SEMAPHORES_PER_HEAD: usize = 4;

pub const HS_FRAME_SEMAPHORE_NOT_DISPLAYABLE: u32 = 0;
pub const HS_FRAME_SEMAPHORE_DISPLAYABLE: u32 = 1;

/// Some hardware delivers the "same" vblank through both the ISR and a
/// bottom half; callbacks closer together than this are duplicates.
const HS_VBLANK_DEBOUNCE_USEC: u64 = 500;

/// Why a new headSurface frame is being produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextFrameRequestType {
    FirstFrame,
    Vblank,
    SwapGroupReady,
}

/// 3D-engine rendering seam used by headSurface.
pub trait HsRenderer: Send + Sync {
    /// Composite one eye of one frame into a destination buffer.
    /// Returns false if nothing was rendered for this eye.
    fn render_frame(
        &mut self,
        head: u32,
        eye: usize,
        buffer_index: usize,
        honor_clip_list: bool,
        dest_rect: Rect,
        layers: &[Option<SurfaceHandle>],
    ) -> bool;

    /// The buffer half most recently rendered for `head`, as reported
    /// by the 3D channel's offset semaphore.
    fn last_rendered_offset(&self, head: u32) -> u8;

    /// Queue a semaphore write of the render offset; observed later by
    /// the non-stall interrupt path.
    fn push_viewport_flip(&mut self, head: u32, offset: u8);
}

/// Static configuration of one headSurface head.
pub struct HsChannelConfig {
    pub frame_size: FrameSize,
    /// Buffers are double height and flipped via ViewPortIn.
    pub needed_for_swap_group: bool,
    /// RG-line-1 interrupts drive rendering instead of vblank.
    pub using_rg_intr_for_swap_groups: bool,
    pub buffers: [Option<SurfaceHandle>; HS_MAX_BUFFERS],
}

#[derive(Debug, Default)]
pub struct HsStatistics {
    pub n_previous_frame_not_done: u64,
    pub n_omitted_updates: u64,
    pub n_fullscreen_sg_frames: u64,
    pub n_non_fullscreen_sg_frames: u64,
}

/// One layer's flip queue. `current` is the entry being displayed.
#[derive(Default)]
pub struct HsFlipQueue {
    queue: VecDeque<LayerFlipState>,
    pub current: LayerFlipState,
}

impl HsFlipQueue {
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Per-head headSurface state.
pub struct HsChannel {
    pub api_head: u32,
    pub config: HsChannelConfig,
    pub flip_queue: [HsFlipQueue; MAX_LAYERS_PER_HEAD],
    /// Buffer index the next frame renders into.
    pub next_index: usize,
    /// Double-height buffer half ViewPortIn shows next.
    pub next_offset: u8,
    frame_sem_index: usize,
    last_callback_usec: u64,
    pub viewport_flip_pending: bool,
    pub swap_group_flipping: bool,
    pub last_client_flip_usec: u64,
    pub statistics: HsStatistics,
}

impl HsChannel {
    pub fn new(api_head: u32, config: HsChannelConfig) -> Self {
        Self {
            api_head,
            config,
            flip_queue: core::array::from_fn(|_| HsFlipQueue::default()),
            next_index: 0,
            next_offset: 0,
            frame_sem_index: 0,
            last_callback_usec: 0,
            viewport_flip_pending: false,
            swap_group_flipping: false,
            last_client_flip_usec: 0,
            statistics: HsStatistics::default(),
        }
    }

    /// The buffer half the previous frame was rendered into.
    pub fn previous_offset(&self) -> u8 {
        (self.next_offset + HS_MAX_BUFFERS as u8 - 1) % HS_MAX_BUFFERS as u8
    }

    /// Append a client flip to a layer's queue, then fast-forward.
    ///
    /// The entry's surfaces are referenced while it sits in the queue.
    pub(crate) fn push_flip_queue_entry(
        &mut self,
        layer: usize,
        state: LayerFlipState,
        arena: &mut SurfaceArena,
        rm: &dyn ResourceManager,
        clearer: &mut dyn SurfaceUsageClearer,
    ) {
        for handle in referenced_surfaces(&state) {
            arena.increment_refs(handle);
        }
        self.flip_queue[layer].queue.push_back(state);
        self.fast_forward_flip_queue(layer, true, true, arena, rm, clearer);
    }

    /// Promote queued entries while the displayed entry may be released.
    ///
    /// Stops at a `current` whose readiness condition is unmet: release
    /// semaphores must never be written out of order, or clients using
    /// semaphore interlocks would observe frames they haven't finished.
    /// A `current` with a nonzero minPresentInterval must be displayed
    /// for a frame before being fast-forwarded past.
    pub(crate) fn fast_forward_flip_queue(
        &mut self,
        layer: usize,
        honor_is_ready_criteria: bool,
        honor_min_present_interval: bool,
        arena: &mut SurfaceArena,
        rm: &dyn ResourceManager,
        clearer: &mut dyn SurfaceUsageClearer,
    ) {
        // Swap group clients expect every flip to reach the hardware, so
        // none may be fast-forwarded away.
        if self.config.needed_for_swap_group {
            return;
        }

        while !self.flip_queue[layer].queue.is_empty() {
            let current = &self.flip_queue[layer].current;
            if honor_is_ready_criteria && !entry_is_ready(arena, current) {
                break;
            }
            if honor_min_present_interval && current.min_present_interval != 0 {
                break;
            }
            let Some(next) = self.flip_queue[layer].queue.pop_front() else {
                break;
            };
            let old = std::mem::replace(&mut self.flip_queue[layer].current, next);
            release_entry(arena, rm, clearer, &old);
        }
    }

    /// Advance each layer's `current` before rendering a frame.
    pub(crate) fn update_flip_queue_current(
        &mut self,
        arena: &mut SurfaceArena,
        rm: &dyn ResourceManager,
        clearer: &mut dyn SurfaceUsageClearer,
    ) {
        for layer in 0..MAX_LAYERS_PER_HEAD {
            if self.config.needed_for_swap_group {
                // Every client flip must become a real hardware frame;
                // consume at most one entry per frame.
                self.promote_one_entry(layer, arena, rm, clearer);
            } else {
                self.fast_forward_flip_queue(layer, true, false, arena, rm, clearer);
            }
        }
    }

    /// Promote a single queued entry to `current`, if the displayed
    /// entry may be released.
    fn promote_one_entry(
        &mut self,
        layer: usize,
        arena: &mut SurfaceArena,
        rm: &dyn ResourceManager,
        clearer: &mut dyn SurfaceUsageClearer,
    ) {
        if self.flip_queue[layer].queue.is_empty() {
            return;
        }
        if !entry_is_ready(arena, &self.flip_queue[layer].current) {
            return;
        }
        let Some(next) = self.flip_queue[layer].queue.pop_front() else {
            return;
        };
        let old = std::mem::replace(&mut self.flip_queue[layer].current, next);
        release_entry(arena, rm, clearer, &old);
    }

    /// Release everything queued and displayed, in FIFO order.
    pub(crate) fn drain_flip_queue(
        &mut self,
        arena: &mut SurfaceArena,
        rm: &dyn ResourceManager,
        clearer: &mut dyn SurfaceUsageClearer,
    ) {
        for layer in 0..MAX_LAYERS_PER_HEAD {
            let old = std::mem::take(&mut self.flip_queue[layer].current);
            release_entry(arena, rm, clearer, &old);
            while let Some(entry) = self.flip_queue[layer].queue.pop_front() {
                release_entry(arena, rm, clearer, &entry);
            }
        }
    }

    /// Try to make every layer's queue idle. With `force`, readiness is
    /// ignored and the queues are emptied unconditionally.
    pub(crate) fn idle_flip_queue(
        &mut self,
        force: bool,
        arena: &mut SurfaceArena,
        rm: &dyn ResourceManager,
        clearer: &mut dyn SurfaceUsageClearer,
    ) -> bool {
        let honor_is_ready = !force;
        let mut idle = true;
        for layer in 0..MAX_LAYERS_PER_HEAD {
            self.fast_forward_flip_queue(layer, honor_is_ready, false, arena, rm, clearer);
            if !self.flip_queue[layer].is_empty() {
                debug_assert!(!force);
                idle = false;
            }
        }
        idle
    }
}

fn semaphore_index(spec: &SemaphoreSpec) -> usize {
    (spec.offset_in_words as usize * 4) / spec.format.semaphore_size_in_bytes() as usize
}

fn read_queue_semaphore(arena: &SurfaceArena, spec: &SemaphoreSpec) -> u32 {
    let Some(surf) = arena.get(spec.surface) else {
        return 0;
    };
    let Some(mem) = &surf.cpu_mapping else {
        log::warn!("flip queue semaphore surface has no CPU mapping");
        return 0;
    };
    notifier::read_semaphore_payload(spec.format, semaphore_index(spec), mem)
}

/// Whether a flip queue entry's readiness condition holds.
///
/// Syncpoint-synchronized entries are always ready here; their fences
/// are evaluated before the entry is queued.
pub(crate) fn entry_is_ready(arena: &SurfaceArena, state: &LayerFlipState) -> bool {
    match &state.sync {
        FlipSync::None | FlipSync::Syncpt { .. } => true,
        FlipSync::Semaphores { acquire, .. } => match acquire {
            None => true,
            Some(spec) => read_queue_semaphore(arena, spec) == spec.value,
        },
    }
}

/// Flip away from an entry: write its release semaphore so the client
/// may reuse the surfaces, then drop the queue's references.
fn release_entry(
    arena: &mut SurfaceArena,
    rm: &dyn ResourceManager,
    clearer: &mut dyn SurfaceUsageClearer,
    state: &LayerFlipState,
) {
    if let FlipSync::Semaphores {
        release: Some(spec),
        ..
    } = &state.sync
    {
        if let Some(surf) = arena.get(spec.surface) {
            if let Some(mem) = &surf.cpu_mapping {
                notifier::write_semaphore_payload(
                    spec.format,
                    semaphore_index(spec),
                    mem,
                    spec.value,
                );
            }
        }
    }
    for handle in referenced_surfaces(state) {
        arena.decrement_refs(handle, rm, clearer);
    }
}

// =============================================================================
// DEVICE-WIDE HEADSURFACE STATE
// =============================================================================

/// Device-wide headSurface state: the notifier aperture the display
/// writes frame completions into, and the renderer.
pub struct HsDevice {
    pub niso_format: NisoFormat,
    pub rm_handle: RmHandle,
    notifiers: Vec<Arc<DmaMemory>>,
    next_slot: [[u8; MAX_HEADS]; MAX_SUBDEVICES],
    pub renderer: Box<dyn HsRenderer>,
}

impl HsDevice {
    pub fn new(
        niso_format: NisoFormat,
        rm_handle: RmHandle,
        num_subdevices: u32,
        renderer: Box<dyn HsRenderer>,
    ) -> Self {
        let notifier_words = MAX_HEADS * HS_NOTIFIERS_PER_HEAD * niso_format.notifier_size_in_words();
        let sem_words = MAX_HEADS
            * HS_FRAME_SEMAPHORES_PER_HEAD
            * (niso_format.semaphore_size_in_bytes() / 4) as usize;
        Self {
            niso_format,
            rm_handle,
            notifiers: (0..num_subdevices)
                .map(|_| DmaMemory::new(notifier_words + sem_words))
                .collect(),
            next_slot: [[0; MAX_HEADS]; MAX_SUBDEVICES],
            renderer,
        }
    }

    pub fn notifier_mem(&self, sd: u32) -> &Arc<DmaMemory> {
        &self.notifiers[sd as usize]
    }

    fn notifier_slot(head: u32, slot: u8) -> usize {
        head as usize * HS_NOTIFIERS_PER_HEAD + slot as usize
    }

    /// Word offset of a head's notifier slot within the aperture.
    pub fn notifier_offset_in_words(&self, head: u32, slot: u8) -> u32 {
        (Self::notifier_slot(head, slot) * self.niso_format.notifier_size_in_words()) as u32
    }

    /// Semaphore index of a head's frame semaphore within the aperture.
    /// Frame semaphores live after the notifier slots.
    pub fn frame_semaphore_index(&self, head: u32, index: usize) -> usize {
        let notifier_words =
            MAX_HEADS * HS_NOTIFIERS_PER_HEAD * self.niso_format.notifier_size_in_words();
        let sem_words = (self.niso_format.semaphore_size_in_bytes() / 4) as usize;
        notifier_words / sem_words + head as usize * HS_FRAME_SEMAPHORES_PER_HEAD + index
    }

    /// Reset the next notifier slot for a frame about to be flipped and
    /// advance the ring. Returns the claimed slot.
    pub fn claim_notifier_slot(&mut self, sd: u32, head: u32) -> u8 {
        let slot = self.next_slot[sd as usize][head as usize];
        notifier::reset_notifier(
            self.niso_format,
            false,
            Self::notifier_slot(head, slot),
            &self.notifiers[sd as usize],
        );
        self.next_slot[sd as usize][head as usize] =
            (slot + 1) % HS_NOTIFIERS_PER_HEAD as u8;
        slot
    }

    fn parse_previous_notifier(&self, sd: u32, head: u32) -> ParsedNotifier {
        let next = self.next_slot[sd as usize][head as usize];
        let prev = (next + HS_NOTIFIERS_PER_HEAD as u8 - 1) % HS_NOTIFIERS_PER_HEAD as u8;
        notifier::parse_notifier(
            self.niso_format,
            false,
            Self::notifier_slot(head, prev),
            &self.notifiers[sd as usize],
        )
    }

    /// Whether the display latched the previously programmed flip: the
    /// notifier of the previous frame's slot reads BEGUN.
    pub fn is_previous_flip_done(&self, sd: u32, head: u32) -> bool {
        self.parse_previous_notifier(sd, head).status == NotifierStatus::Begun
    }
}

/// A set of heads whose headSurface buffer swaps happen in lockstep.
#[derive(Debug, Default)]
pub struct SwapGroup {
    /// A real buffer flip was kicked for the group and has not yet been
    /// observed complete on every member head.
    pub pending_flip: bool,
    pub fullscreen: bool,
    /// Number of times the group's waiters were released.
    pub release_count: u64,
}

// =============================================================================
// NEXT-FRAME WORK AREA
// =============================================================================

#[derive(Debug, Default)]
struct NextFrameWorkArea {
    /// Range of buffer indices to render into.
    dst_buffer_start: usize,
    dst_buffer_end: usize,
    /// Flip to the buffer at `next_index`.
    do_flip_to_next_index: bool,
    allow_flip_lock: bool,
    /// "Flip" by moving ViewPortIn to `dest_rect`.
    do_flip_to_dest_rect: bool,
    do_increment_next_index: bool,
    do_increment_next_offset: bool,
    /// Buffer indices on which the SwapGroup's exclusive clip list is
    /// honored, preserving old SwapGroup content there.
    honor_clip_list_buffer_mask: u8,
    dest_rect: Rect,
}

fn assign_next_frame_work_area(
    ch: &HsChannel,
    request: NextFrameRequestType,
) -> NextFrameWorkArea {
    let mut work = NextFrameWorkArea::default();

    if request == NextFrameRequestType::FirstFrame || request == NextFrameRequestType::Vblank {
        if request == NextFrameRequestType::FirstFrame || !ch.config.needed_for_swap_group {
            // Ordinary frame: render to the back buffer, flip to it,
            // advance to the next back buffer.
            work.dst_buffer_start = ch.next_index;
            work.dst_buffer_end = ch.next_index;
            work.do_flip_to_next_index = true;
            work.do_increment_next_index = true;
        } else {
            // SwapGroup vblank frame: render both buffers and "flip"
            // with ViewPortIn. The non-nextIndex buffer keeps the old
            // SwapGroup content via the clip list; nextIndex receives
            // the new content.
            work.dst_buffer_start = 0;
            work.dst_buffer_end = HS_MAX_BUFFERS - 1;
            work.do_flip_to_dest_rect = true;
            work.do_increment_next_offset = true;
            work.honor_clip_list_buffer_mask = !(1u8 << ch.next_index);
        }
    } else {
        // SWAP_GROUP_READY: render a real frame to nextIndex at the
        // previous offset (the half ViewPortIn is showing) and kick a
        // real flip. The flip may wait on the swap barrier
        // indefinitely, so nextIndex is not advanced here; it advances
        // when the flip is observed complete.
        debug_assert!(ch.config.needed_for_swap_group);
        work.dst_buffer_start = ch.next_index;
        work.dst_buffer_end = ch.next_index;
        work.do_flip_to_next_index = true;
        work.allow_flip_lock = true;
    }

    let dest_offset = if request == NextFrameRequestType::SwapGroupReady {
        ch.previous_offset()
    } else {
        ch.next_offset
    };
    work.dest_rect = Rect {
        x: 0,
        y: ch.config.frame_size.height * u32::from(dest_offset),
        width: ch.config.frame_size.width,
        height: ch.config.frame_size.height,
    };
    work
}

// =============================================================================
// DEVICE ENTRY POINTS
// =============================================================================

impl DevEvo {
    /// Enable headSurface compositing on a head.
    pub fn hs_enable(&mut self, disp: usize, head: u32, config: HsChannelConfig) -> Result<()> {
        if self.hs.is_none() {
            return Err(Error::NotSupported);
        }
        if disp >= self.disps.len() || head >= self.caps.num_heads {
            return Err(Error::InvalidParameter);
        }
        if self.disps[disp].hs_channels[head as usize].is_some() {
            return Err(Error::ObjectInUse);
        }
        for buffer in config.buffers.iter().flatten() {
            if self.surfaces.get(*buffer).is_none() {
                return Err(Error::InvalidHandle);
            }
        }
        // The display scans headSurface buffers out; pin them.
        for buffer in config.buffers.iter().flatten() {
            self.surfaces.increment_refs(*buffer);
        }
        self.disps[disp].hs_channels[head as usize] = Some(HsChannel::new(head, config));
        Ok(())
    }

    /// Disable headSurface on a head, draining its flip queues.
    pub fn hs_disable(&mut self, disp: usize, head: u32) {
        if disp >= self.disps.len() || head as usize >= MAX_HEADS {
            return;
        }
        let Some(mut ch) = self.disps[disp].hs_channels[head as usize].take() else {
            return;
        };
        // Let semaphore interlocks settle in order first; entries still
        // stuck after that are forcibly idled rather than leaked. Swap
        // group queues go straight to the drain (their entries are never
        // fast-forwarded).
        if !ch.config.needed_for_swap_group
            && !ch.idle_flip_queue(false, &mut self.surfaces, &*self.rm, &mut self.channels)
        {
            log::warn!(
                "headSurface flip queues on head {} not idle; forcing",
                head
            );
            ch.idle_flip_queue(true, &mut self.surfaces, &*self.rm, &mut self.channels);
        }
        ch.drain_flip_queue(&mut self.surfaces, &*self.rm, &mut self.channels);
        for buffer in ch.config.buffers.iter().flatten() {
            self.surfaces
                .decrement_refs(*buffer, &*self.rm, &mut self.channels);
        }
    }

    /// Queue a client flip on a headSurface head.
    pub fn hs_push_flip_queue_entry(
        &mut self,
        disp: usize,
        head: u32,
        layer: u32,
        state: LayerFlipState,
    ) -> Result<()> {
        if layer as usize >= MAX_LAYERS_PER_HEAD || head as usize >= MAX_HEADS {
            return Err(Error::InvalidParameter);
        }
        let DevEvo {
            disps,
            surfaces,
            rm,
            channels,
            ..
        } = self;
        let ch = disps
            .get_mut(disp)
            .and_then(|d| d.hs_channels[head as usize].as_mut())
            .ok_or(Error::InvalidParameter)?;
        ch.push_flip_queue_entry(layer as usize, state, surfaces, &**rm, channels);
        Ok(())
    }

    /// Produce the next headSurface frame: advance the flip queues,
    /// render, flip (really or via ViewPortIn), and update buffer
    /// bookkeeping.
    pub fn hs_next_frame(&mut self, disp: usize, head: u32, request: NextFrameRequestType) {
        if head as usize >= MAX_HEADS {
            return;
        }
        let DevEvo {
            disps,
            hs,
            surfaces,
            rm,
            channels,
            host,
            ..
        } = self;
        let Some(hs) = hs.as_mut() else { return };
        let Some(disp_state) = disps.get_mut(disp) else {
            return;
        };
        let sd = disp_state.display_owner;
        let sdm = SubDevMask::single(sd);
        let Some(ch) = disp_state.hs_channels[head as usize].as_mut() else {
            return;
        };

        let work = assign_next_frame_work_area(ch, request);
        ch.update_flip_queue_current(surfaces, &**rm, channels);

        for eye in 0..MAX_EYES {
            let mut layers: [Option<SurfaceHandle>; MAX_LAYERS_PER_HEAD] =
                [None; MAX_LAYERS_PER_HEAD];
            let mut surfaces_present = false;
            for layer in 0..MAX_LAYERS_PER_HEAD {
                layers[layer] = ch.flip_queue[layer].current.surfaces[eye];
                surfaces_present |= layers[layer].is_some();
            }
            // A flip must happen even with no source surface, but only
            // the left eye is worth rendering in that case.
            if !surfaces_present && eye != LEFT {
                continue;
            }
            for buffer in work.dst_buffer_start..=work.dst_buffer_end {
                let honor_clip_list = work.honor_clip_list_buffer_mask & (1 << buffer) != 0;
                hs.renderer.render_frame(
                    head,
                    eye,
                    buffer,
                    honor_clip_list,
                    work.dest_rect,
                    &layers,
                );
            }
        }

        if work.do_flip_to_next_index {
            // Mark the frame displayable before the display can latch
            // the flip.
            notifier::write_semaphore_payload(
                hs.niso_format,
                hs.frame_semaphore_index(head, ch.frame_sem_index),
                &hs.notifiers[sd as usize],
                HS_FRAME_SEMAPHORE_DISPLAYABLE,
            );

            let slot = hs.claim_notifier_slot(sd, head);
            let mut hw = HwFlipState::null();
            if let Some(buffer) = ch.config.buffers[ch.next_index] {
                if let Some(surf) = surfaces.get(buffer) {
                    hw.ctx_dma = surf.planes[0].rm_handle.0;
                    hw.offset = surf.planes[0].offset;
                    hw.pitch = surf.planes[0].pitch;
                }
            }
            hw.size_in = ch.config.frame_size;
            hw.size_out = ch.config.frame_size;
            hw.notifier = Some(HwNotifier {
                ctx_dma: hs.rm_handle.0,
                offset_in_words: hs.notifier_offset_in_words(head, slot),
            });
            channels.flip_layer(head, 0, sdm, &hw);

            let mut update = UpdateState::new();
            update.mark(sdm, ChannelMask::base(head));
            if work.allow_flip_lock {
                update.mark_flip_lock_qualifying(sdm, ChannelMask::base(head));
            }
            channels.kickoff_update(&update);

            ch.frame_sem_index = (ch.frame_sem_index + 1) % HS_FRAME_SEMAPHORES_PER_HEAD;
            if request == NextFrameRequestType::SwapGroupReady {
                ch.last_client_flip_usec = host.get_usec();
            }
        }

        if work.do_flip_to_dest_rect {
            debug_assert!(ch.config.needed_for_swap_group);
            if ch.config.using_rg_intr_for_swap_groups {
                hs.renderer.push_viewport_flip(head, ch.next_offset);
                ch.viewport_flip_pending = true;
            } else {
                channels.set_viewport_point_in(head, work.dest_rect.x, work.dest_rect.y, sdm);
                let mut update = UpdateState::new();
                update.mark(sdm, ChannelMask::CORE);
                channels.kickoff_update(&update);
            }
        }

        if work.do_increment_next_index {
            ch.next_index = (ch.next_index + 1) % HS_MAX_BUFFERS;
        }
        if work.do_increment_next_offset {
            ch.next_offset = (ch.next_offset + 1) % HS_MAX_BUFFERS as u8;
        }
    }

    /// Vblank callback for a head.
    pub fn hs_on_vblank(&mut self, disp: usize, head: u32) {
        if disp >= self.disps.len() || head as usize >= MAX_HEADS {
            return;
        }
        self.service_vblank_sem_controls(disp, head);

        if let Some(sg_index) = self.disps[disp].swap_group[head as usize] {
            self.check_swap_group_flip_done(sg_index);
        }

        let frame_done = {
            let DevEvo { disps, hs, host, .. } = self;
            let Some(hs) = hs.as_ref() else { return };
            let disp_state = &mut disps[disp];
            let sd = disp_state.display_owner;
            let Some(ch) = disp_state.hs_channels[head as usize].as_mut() else {
                return;
            };
            // RG-interrupt-driven heads render from the RG callback,
            // not from vblank.
            if ch.config.using_rg_intr_for_swap_groups {
                return;
            }
            is_previous_frame_done(&**host, hs, sd, ch)
        };

        if frame_done {
            self.hs_next_frame(disp, head, NextFrameRequestType::Vblank);
        } else if let Some(ch) = self.disps[disp].hs_channels[head as usize].as_mut() {
            ch.statistics.n_previous_frame_not_done += 1;
        }
    }

    /// RG-line-1 interrupt callback for a head.
    pub fn hs_on_rg_line1(&mut self, disp: usize, head: u32) {
        if head as usize >= MAX_HEADS {
            return;
        }
        let omit = {
            let Some(ch) = self
                .disps
                .get(disp)
                .and_then(|d| d.hs_channels[head as usize].as_ref())
            else {
                return;
            };
            if !ch.config.using_rg_intr_for_swap_groups {
                return;
            }
            // While fullscreen swap group flipping, vblank-time updates
            // of non-SwapGroup content would release client semaphores
            // before their content was displayed.
            ch.swap_group_flipping
        };

        if omit {
            if let Some(ch) = self.disps[disp].hs_channels[head as usize].as_mut() {
                ch.statistics.n_omitted_updates += 1;
            }
            return;
        }
        self.hs_next_frame(disp, head, NextFrameRequestType::Vblank);
    }

    /// Non-stall interrupt callback: complete deferred viewport flips
    /// and re-check swap group barriers.
    pub fn hs_on_non_stall(&mut self) {
        let num_disps = self.disps.len();
        for disp in 0..num_disps {
            for head in 0..MAX_HEADS {
                let DevEvo {
                    disps,
                    hs,
                    channels,
                    ..
                } = self;
                let Some(hs_dev) = hs.as_mut() else { return };
                let disp_state = &mut disps[disp];
                let sd = disp_state.display_owner;
                let Some(ch) = disp_state.hs_channels[head].as_mut() else {
                    continue;
                };
                // The viewport flip may only be issued once the offset
                // semaphore confirms the frame's rendering finished.
                if ch.viewport_flip_pending
                    && hs_dev.renderer.last_rendered_offset(ch.api_head) == ch.previous_offset()
                {
                    let y = u32::from(ch.previous_offset()) * ch.config.frame_size.height;
                    channels.set_viewport_point_in(head as u32, 0, y, SubDevMask::single(sd));
                    let mut update = UpdateState::new();
                    update.mark(SubDevMask::single(sd), ChannelMask::CORE);
                    channels.kickoff_update(&update);
                    ch.viewport_flip_pending = false;
                }
            }
        }

        for sg_index in 0..self.swap_groups.len() {
            self.check_swap_group_flip_done(sg_index);
        }
    }

    /// Create a swap group; heads join it via [`DevEvo::join_swap_group`].
    pub fn create_swap_group(&mut self) -> usize {
        self.swap_groups.push(SwapGroup::default());
        self.swap_groups.len() - 1
    }

    pub fn join_swap_group(&mut self, sg_index: usize, disp: usize, head: u32) -> Result<()> {
        if sg_index >= self.swap_groups.len() {
            return Err(Error::InvalidHandle);
        }
        let disp_state = self.disps.get_mut(disp).ok_or(Error::InvalidParameter)?;
        let slot = disp_state
            .swap_group
            .get_mut(head as usize)
            .ok_or(Error::InvalidParameter)?;
        match disp_state.hs_channels[head as usize].as_ref() {
            Some(ch) if ch.config.needed_for_swap_group => {}
            _ => return Err(Error::InvalidParameter),
        }
        *slot = Some(sg_index);
        Ok(())
    }

    /// The swap group's clients finished rendering: produce the real
    /// flip on every member head and arm the completion barrier.
    pub fn swap_group_ready(&mut self, sg_index: usize) {
        let mut members = Vec::new();
        for (disp, disp_state) in self.disps.iter().enumerate() {
            for head in 0..MAX_HEADS {
                if disp_state.swap_group[head] == Some(sg_index) {
                    members.push((disp, head as u32));
                }
            }
        }
        for (disp, head) in members {
            self.hs_next_frame(disp, head, NextFrameRequestType::SwapGroupReady);
            if let Some(ch) = self.disps[disp].hs_channels[head as usize].as_mut() {
                ch.swap_group_flipping = true;
            }
        }
        if let Some(sg) = self.swap_groups.get_mut(sg_index) {
            sg.pending_flip = true;
        }
    }

    /// Release the swap group iff every member head's previous flip has
    /// latched. This is a rendezvous barrier: if any member is still
    /// pending, no head advances.
    pub(crate) fn check_swap_group_flip_done(&mut self, sg_index: usize) {
        let pending = self
            .swap_groups
            .get(sg_index)
            .map(|sg| sg.pending_flip)
            .unwrap_or(false);
        if !pending {
            return;
        }

        {
            let Some(hs) = self.hs.as_ref() else { return };
            for disp_state in &self.disps {
                let sd = disp_state.display_owner;
                for head in 0..MAX_HEADS {
                    if disp_state.swap_group[head] != Some(sg_index) {
                        continue;
                    }
                    let Some(ch) = disp_state.hs_channels[head].as_ref() else {
                        continue;
                    };
                    debug_assert!(ch.config.needed_for_swap_group);
                    if !hs.is_previous_flip_done(sd, ch.api_head) {
                        return;
                    }
                }
            }
        }

        // Every member latched: emulate the client-visible notifiers,
        // advance every member to its next back buffer, then release.
        let DevEvo {
            disps,
            hs,
            surfaces,
            ..
        } = self;
        let Some(hs) = hs.as_ref() else { return };
        for disp_state in disps.iter_mut() {
            let sd = disp_state.display_owner;
            for head in 0..MAX_HEADS {
                if disp_state.swap_group[head] != Some(sg_index) {
                    continue;
                }
                let Some(ch) = disp_state.hs_channels[head].as_mut() else {
                    continue;
                };
                debug_assert!(hs.is_previous_flip_done(sd, ch.api_head));
                update_client_notifier(hs, surfaces, sd, ch);
                ch.next_index = (ch.next_index + 1) % HS_MAX_BUFFERS;
                ch.swap_group_flipping = false;
            }
        }

        let sg = &mut self.swap_groups[sg_index];
        sg.pending_flip = false;
        sg.release_count += 1;
    }
}

fn is_previous_frame_done(
    host: &dyn HostOps,
    hs: &HsDevice,
    sd: u32,
    ch: &mut HsChannel,
) -> bool {
    if ch.config.needed_for_swap_group {
        // There is no latch tracking for ViewPortIn updates. Rely on
        // one callback per vblank, debouncing the duplicate deliveries
        // some hardware produces from both the ISR and the bottom half.
        debug_assert!(!ch.config.using_rg_intr_for_swap_groups);
        let now = host.get_usec();
        let last = ch.last_callback_usec;
        if now > last && now - last < HS_VBLANK_DEBOUNCE_USEC {
            return false;
        }
        ch.last_callback_usec = now;
        true
    } else {
        hs.is_previous_flip_done(sd, ch.api_head)
    }
}

/// A client that requested a completion notifier while swap groups were
/// active gets it emulated from the headSurface notifier, as if its
/// notifier had been used by the hardware.
fn update_client_notifier(hs: &HsDevice, surfaces: &SurfaceArena, sd: u32, ch: &HsChannel) {
    let Some(spec) = &ch.flip_queue[0].current.completion_notifier else {
        return;
    };
    let Some(surf) = surfaces.get(spec.surface) else {
        return;
    };
    let Some(mem) = &surf.cpu_mapping else {
        return;
    };
    let parsed = hs.parse_previous_notifier(sd, ch.api_head);
    let slot = spec.offset_in_words as usize / spec.format.notifier_size_in_words();
    notifier::set_notifier_begun(spec.format, false, slot, mem, parsed.time_stamp);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flip::{FlipSync, NotifierSpec};
    use crate::testutil::{
        active_mode, register_niso_surface, register_test_surface, test_device_with_hs,
    };
    use nvdisp_core::types::ClientRef;

    fn sem_entry(surface: SurfaceHandle, value: u32) -> LayerFlipState {
        LayerFlipState {
            sync: FlipSync::Semaphores {
                acquire: Some(SemaphoreSpec {
                    surface,
                    format: NisoFormat::Legacy,
                    offset_in_words: 0,
                    value,
                }),
                release: None,
            },
            ..Default::default()
        }
    }

    fn syncpt_entry() -> LayerFlipState {
        LayerFlipState {
            sync: FlipSync::Syncpt {
                pre_id: 1,
                pre_value: 0,
                post_id: 2,
            },
            ..Default::default()
        }
    }

    fn hs_config(dev_buffers: [Option<SurfaceHandle>; HS_MAX_BUFFERS]) -> HsChannelConfig {
        HsChannelConfig {
            frame_size: FrameSize::new(640, 480),
            needed_for_swap_group: false,
            using_rg_intr_for_swap_groups: false,
            buffers: dev_buffers,
        }
    }

    #[test]
    fn test_fast_forward_stops_at_unready_semaphore() {
        let mut dev = test_device_with_hs();
        dev.disps[0].heads[0].mode = Some(active_mode());
        let client = ClientRef(1);
        let buf = register_test_surface(&mut dev, client, 640, 480);
        let (sem, sem_mem) = register_niso_surface(&mut dev, client);
        dev.hs_enable(0, 0, hs_config([Some(buf), None])).unwrap();

        // The semaphore currently reads 0x5.
        sem_mem.write(0, 0x5);

        dev.hs_push_flip_queue_entry(0, 0, 0, syncpt_entry()).unwrap();
        dev.hs_push_flip_queue_entry(0, 0, 0, syncpt_entry()).unwrap();
        dev.hs_push_flip_queue_entry(0, 0, 0, sem_entry(sem, 0x10))
            .unwrap();

        // Entries 1 and 2 were consumed; entry 3 is now current and the
        // queue is empty, awaiting its acquire value.
        let ch = dev.disps[0].hs_channels[0].as_ref().unwrap();
        assert_eq!(ch.flip_queue[0].len(), 0);
        assert!(matches!(
            ch.flip_queue[0].current.sync,
            FlipSync::Semaphores { .. }
        ));

        // A fourth entry queues behind the unready current entry.
        dev.hs_push_flip_queue_entry(0, 0, 0, syncpt_entry()).unwrap();
        let ch = dev.disps[0].hs_channels[0].as_ref().unwrap();
        assert_eq!(ch.flip_queue[0].len(), 1);

        // Satisfying the semaphore lets the queue drain in order.
        sem_mem.write(0, 0x10);
        dev.hs_push_flip_queue_entry(0, 0, 0, syncpt_entry()).unwrap();
        let ch = dev.disps[0].hs_channels[0].as_ref().unwrap();
        assert_eq!(ch.flip_queue[0].len(), 0);
    }

    #[test]
    fn test_release_writes_semaphore_and_preserves_fifo() {
        let mut dev = test_device_with_hs();
        dev.disps[0].heads[0].mode = Some(active_mode());
        let client = ClientRef(1);
        let buf = register_test_surface(&mut dev, client, 640, 480);
        let (sem, sem_mem) = register_niso_surface(&mut dev, client);
        dev.hs_enable(0, 0, hs_config([Some(buf), None])).unwrap();

        // Entry A releases value 0xa1 at word 4 when flipped away.
        let mut a = syncpt_entry();
        a.sync = FlipSync::Semaphores {
            acquire: None,
            release: Some(SemaphoreSpec {
                surface: sem,
                format: NisoFormat::Legacy,
                offset_in_words: 4,
                value: 0xa1,
            }),
        };
        dev.hs_push_flip_queue_entry(0, 0, 0, a).unwrap();
        assert_eq!(sem_mem.read(4), 0);

        // Flipping away from A (promoting B) writes A's release value.
        dev.hs_push_flip_queue_entry(0, 0, 0, syncpt_entry()).unwrap();
        assert_eq!(sem_mem.read(4), 0xa1);
    }

    #[test]
    fn test_disable_forces_stuck_queue_released() {
        let mut dev = test_device_with_hs();
        dev.disps[0].heads[0].mode = Some(active_mode());
        let client = ClientRef(1);
        let buf = register_test_surface(&mut dev, client, 640, 480);
        let (sem, sem_mem) = register_niso_surface(&mut dev, client);
        dev.hs_enable(0, 0, hs_config([Some(buf), None])).unwrap();

        // The displayed entry never becomes ready; a release-semaphore
        // entry is stuck in the queue behind it.
        dev.hs_push_flip_queue_entry(0, 0, 0, sem_entry(sem, 0x10))
            .unwrap();
        let mut stuck = syncpt_entry();
        stuck.sync = FlipSync::Semaphores {
            acquire: None,
            release: Some(SemaphoreSpec {
                surface: sem,
                format: NisoFormat::Legacy,
                offset_in_words: 8,
                value: 0xdd,
            }),
        };
        dev.hs_push_flip_queue_entry(0, 0, 0, stuck).unwrap();

        dev.hs_disable(0, 0);
        // Everything was released, including the stuck entry's release
        // semaphore; only the registration references remain.
        assert_eq!(sem_mem.read(8), 0xdd);
        assert_eq!(dev.surfaces.get(sem).unwrap().rm_ref_cnt(), 1);
        assert_eq!(dev.surfaces.get(buf).unwrap().rm_ref_cnt(), 1);
    }

    #[test]
    fn test_next_frame_flips_and_advances_next_index() {
        let mut dev = test_device_with_hs();
        dev.disps[0].heads[0].mode = Some(active_mode());
        let client = ClientRef(1);
        let buf0 = register_test_surface(&mut dev, client, 640, 480);
        let buf1 = register_test_surface(&mut dev, client, 640, 480);
        dev.hs_enable(0, 0, hs_config([Some(buf0), Some(buf1)]))
            .unwrap();

        assert_eq!(dev.disps[0].hs_channels[0].as_ref().unwrap().next_index, 0);
        dev.hs_next_frame(0, 0, NextFrameRequestType::FirstFrame);

        let ch = dev.disps[0].hs_channels[0].as_ref().unwrap();
        assert_eq!(ch.next_index, 1);
        // The base channel carried the flip.
        assert!(dev.channels.base[0].put_offset() > 0);
    }

    #[test]
    fn test_vblank_skips_frame_until_notifier_begun() {
        let mut dev = test_device_with_hs();
        dev.disps[0].heads[0].mode = Some(active_mode());
        let client = ClientRef(1);
        let buf0 = register_test_surface(&mut dev, client, 640, 480);
        let buf1 = register_test_surface(&mut dev, client, 640, 480);
        dev.hs_enable(0, 0, hs_config([Some(buf0), Some(buf1)]))
            .unwrap();

        // First frame flips to buffer 0 and resets its notifier slot.
        dev.hs_next_frame(0, 0, NextFrameRequestType::FirstFrame);

        // The flip hasn't latched: vblank must not render over the
        // still-visible buffer.
        dev.hs_on_vblank(0, 0);
        let ch = dev.disps[0].hs_channels[0].as_ref().unwrap();
        assert_eq!(ch.next_index, 1);
        assert_eq!(ch.statistics.n_previous_frame_not_done, 1);

        // Hardware reports the flip latched; the next vblank renders.
        let fmt = dev.hs.as_ref().unwrap().niso_format;
        let mem = dev.hs.as_ref().unwrap().notifier_mem(0).clone();
        notifier::set_notifier_begun(fmt, false, 0, &mem, 1234);

        dev.hs_on_vblank(0, 0);
        let ch = dev.disps[0].hs_channels[0].as_ref().unwrap();
        assert_eq!(ch.next_index, 0);
    }

    fn enable_swap_group_head(
        dev: &mut DevEvo,
        client: ClientRef,
        head: u32,
    ) -> (SurfaceHandle, SurfaceHandle) {
        let buf0 = register_test_surface(dev, client, 640, 960);
        let buf1 = register_test_surface(dev, client, 640, 960);
        dev.hs_enable(
            0,
            head,
            HsChannelConfig {
                frame_size: FrameSize::new(640, 480),
                needed_for_swap_group: true,
                using_rg_intr_for_swap_groups: false,
                buffers: [Some(buf0), Some(buf1)],
            },
        )
        .unwrap();
        (buf0, buf1)
    }

    #[test]
    fn test_swap_group_barrier_releases_all_or_none() {
        let mut dev = test_device_with_hs();
        dev.disps[0].heads[0].mode = Some(active_mode());
        dev.disps[0].heads[1].mode = Some(active_mode());
        let client = ClientRef(1);
        enable_swap_group_head(&mut dev, client, 0);
        enable_swap_group_head(&mut dev, client, 1);

        let sg = dev.create_swap_group();
        dev.join_swap_group(sg, 0, 0).unwrap();
        dev.join_swap_group(sg, 0, 1).unwrap();

        dev.swap_group_ready(sg);
        assert!(dev.swap_groups[sg].pending_flip);
        let idx_before: Vec<usize> = (0..2)
            .map(|h| dev.disps[0].hs_channels[h].as_ref().unwrap().next_index)
            .collect();

        // Only head 0's flip latched; the barrier must hold every head.
        let fmt = dev.hs.as_ref().unwrap().niso_format;
        let mem = dev.hs.as_ref().unwrap().notifier_mem(0).clone();
        notifier::set_notifier_begun(fmt, false, 0, &mem, 100);
        dev.hs_on_non_stall();
        assert!(dev.swap_groups[sg].pending_flip);
        for h in 0..2 {
            assert_eq!(
                dev.disps[0].hs_channels[h].as_ref().unwrap().next_index,
                idx_before[h]
            );
        }

        // Head 1 latches too: everyone advances, the group releases.
        notifier::set_notifier_begun(fmt, false, HS_NOTIFIERS_PER_HEAD, &mem, 101);
        dev.hs_on_non_stall();
        assert!(!dev.swap_groups[sg].pending_flip);
        assert_eq!(dev.swap_groups[sg].release_count, 1);
        for h in 0..2 {
            assert_eq!(
                dev.disps[0].hs_channels[h].as_ref().unwrap().next_index,
                (idx_before[h] + 1) % HS_MAX_BUFFERS
            );
        }
    }

    #[test]
    fn test_swap_group_ready_renders_previous_offset() {
        let mut dev = test_device_with_hs();
        dev.disps[0].heads[0].mode = Some(active_mode());
        let client = ClientRef(1);
        enable_swap_group_head(&mut dev, client, 0);
        let sg = dev.create_swap_group();
        dev.join_swap_group(sg, 0, 0).unwrap();

        // A vblank frame advances nextOffset (ViewPortIn flip) but not
        // nextIndex.
        let host_now_renders = dev.disps[0].hs_channels[0].as_ref().unwrap().next_offset;
        assert_eq!(host_now_renders, 0);
        dev.hs_on_vblank(0, 0);
        let ch = dev.disps[0].hs_channels[0].as_ref().unwrap();
        assert_eq!(ch.next_offset, 1);
        assert_eq!(ch.next_index, 0);

        // SWAP_GROUP_READY renders at the previous offset and does not
        // advance nextIndex (that happens when the flip completes).
        dev.hs_next_frame(0, 0, NextFrameRequestType::SwapGroupReady);
        let ch = dev.disps[0].hs_channels[0].as_ref().unwrap();
        assert_eq!(ch.next_index, 0);
        assert_eq!(ch.next_offset, 1);
    }

    #[test]
    fn test_vblank_debounce_rejects_duplicate_callbacks() {
        let mut dev = test_device_with_hs();
        dev.disps[0].heads[0].mode = Some(active_mode());
        let client = ClientRef(1);
        enable_swap_group_head(&mut dev, client, 0);

        // The test host advances 1 us per query; two back-to-back
        // callbacks land within the 500 us debounce window.
        let offset_before = dev.disps[0].hs_channels[0].as_ref().unwrap().next_offset;
        dev.hs_on_vblank(0, 0);
        let after_first = dev.disps[0].hs_channels[0].as_ref().unwrap().next_offset;
        assert_ne!(offset_before, after_first);

        dev.hs_on_vblank(0, 0);
        let after_second = dev.disps[0].hs_channels[0].as_ref().unwrap().next_offset;
        assert_eq!(after_first, after_second);
        assert_eq!(
            dev.disps[0].hs_channels[0]
                .as_ref()
                .unwrap()
                .statistics
                .n_previous_frame_not_done,
            1
        );
    }

    #[test]
    fn test_swap_group_release_emulates_client_notifier() {
        let mut dev = test_device_with_hs();
        dev.disps[0].heads[0].mode = Some(active_mode());
        let client = ClientRef(1);
        enable_swap_group_head(&mut dev, client, 0);
        let (notif, notif_mem) = register_niso_surface(&mut dev, client);
        let sg = dev.create_swap_group();
        dev.join_swap_group(sg, 0, 0).unwrap();

        // The client's queued flip asked for a completion notifier.
        dev.hs_push_flip_queue_entry(
            0,
            0,
            0,
            LayerFlipState {
                completion_notifier: Some(NotifierSpec {
                    surface: notif,
                    format: NisoFormat::Legacy,
                    offset_in_words: 0,
                }),
                ..Default::default()
            },
        )
        .unwrap();

        dev.swap_group_ready(sg);
        let fmt = dev.hs.as_ref().unwrap().niso_format;
        let mem = dev.hs.as_ref().unwrap().notifier_mem(0).clone();
        notifier::set_notifier_begun(fmt, false, 0, &mem, 555);
        dev.hs_on_non_stall();

        let parsed = notifier::parse_notifier(NisoFormat::Legacy, false, 0, &notif_mem);
        assert_eq!(parsed.status, NotifierStatus::Begun);
    }
}
