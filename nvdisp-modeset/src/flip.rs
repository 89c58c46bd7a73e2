// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Flip orchestration
//!
//! Builds per-head, per-layer hardware flip state from client requests,
//! validates it against the head's mode and the device's usage bounds,
//! adjusts surface reference counts, programs the layer channels, and
//! commits the whole request with one aggregated update.
//!
//! Reference count ordering is load-bearing: surfaces pinned by the new
//! flip are referenced before the displaced flip's references are
//! dropped, so a surface reused across consecutive flips never passes
//! through a transient zero count.

use nvdisp_core::notifier::{self, NisoFormat};
use nvdisp_core::surface::SurfaceHandle;
use nvdisp_core::types::{FormatMask, FrameSize, IsoClass, SubDevMask};
use nvdisp_core::update::UpdateState;
use nvdisp_core::{Error, Result, LEFT, MAX_EYES, MAX_LAYERS_PER_HEAD};

use crate::hal::{HwFlipState, HwNotifier, HwSemaphore};
use crate::{ChannelSet, DevEvo};

/// A semaphore within a registered surface.
#[derive(Debug, Clone, Copy)]
pub struct SemaphoreSpec {
    pub surface: SurfaceHandle,
    pub format: NisoFormat,
    pub offset_in_words: u32,
    pub value: u32,
}

/// A completion notifier within a registered surface.
#[derive(Debug, Clone, Copy)]
pub struct NotifierSpec {
    pub surface: SurfaceHandle,
    pub format: NisoFormat,
    pub offset_in_words: u32,
}

/// Synchronization of one layer flip.
#[derive(Debug, Clone, Default)]
pub enum FlipSync {
    #[default]
    None,
    Semaphores {
        acquire: Option<SemaphoreSpec>,
        release: Option<SemaphoreSpec>,
    },
    Syncpt {
        pre_id: u32,
        pre_value: u32,
        post_id: u32,
    },
}

/// Requested (and, once programmed, current) state of one layer.
#[derive(Debug, Clone, Default)]
pub struct LayerFlipState {
    pub surfaces: [Option<SurfaceHandle>; MAX_EYES],
    pub size_in: FrameSize,
    pub size_out: FrameSize,
    pub sync: FlipSync,
    pub completion_notifier: Option<NotifierSpec>,
    pub min_present_interval: u8,
    pub tearing: bool,
    pub allow_flip_lock: bool,
}

/// Flip request for one head.
pub struct FlipRequestOneHead {
    pub disp: usize,
    pub head: u32,
    pub layers: Vec<(u32, LayerFlipState)>,
}

/// A multi-head flip request, committed atomically.
pub struct FlipRequest {
    pub heads: Vec<FlipRequestOneHead>,
    /// Wait for the update to latch before returning.
    pub sync: bool,
}

/// Reply to a flip request.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlipReply {
    pub heads_programmed: u32,
}

/// Every surface a layer flip state keeps referenced while current.
pub(crate) fn referenced_surfaces(state: &LayerFlipState) -> Vec<SurfaceHandle> {
    let mut handles = Vec::new();
    for eye in 0..MAX_EYES {
        if let Some(handle) = state.surfaces[eye] {
            handles.push(handle);
        }
    }
    if let FlipSync::Semaphores { acquire, release } = &state.sync {
        if let Some(spec) = acquire {
            handles.push(spec.surface);
        }
        if let Some(spec) = release {
            handles.push(spec.surface);
        }
    }
    if let Some(spec) = &state.completion_notifier {
        handles.push(spec.surface);
    }
    handles
}

impl DevEvo {
    /// Build, validate and commit a flip request.
    ///
    /// Validation completes for every head before any state is touched;
    /// a rejected request leaves no partial mutation behind.
    pub fn flip(&mut self, req: &FlipRequest) -> Result<FlipReply> {
        for one in &req.heads {
            self.validate_flip_one_head(one)?;
        }

        let mut update = UpdateState::new();
        let mut reply = FlipReply::default();

        for one in &req.heads {
            let sdm = SubDevMask::single(self.disps[one.disp].display_owner);
            for (layer, state) in &one.layers {
                self.program_layer_flip(one.disp, one.head, *layer, state, sdm, &mut update);
            }
            reply.heads_programmed |= 1 << one.head;
        }

        self.update_and_kickoff(update, req.sync);
        Ok(reply)
    }

    fn validate_flip_one_head(&self, one: &FlipRequestOneHead) -> Result<()> {
        let disp = self.disps.get(one.disp).ok_or(Error::InvalidParameter)?;
        if one.head >= self.caps.num_heads {
            return Err(Error::InvalidParameter);
        }
        let head_state = &disp.heads[one.head as usize];
        let mode = head_state.mode.as_ref().ok_or(Error::InvalidParameter)?;

        for (layer, state) in &one.layers {
            if *layer as usize >= MAX_LAYERS_PER_HEAD {
                return Err(Error::InvalidParameter);
            }
            let layer_caps = &self.caps.layer_caps[*layer as usize];
            if !layer_caps.usable {
                return Err(Error::NotSupported);
            }

            for eye in 0..MAX_EYES {
                let Some(handle) = state.surfaces[eye] else {
                    continue;
                };
                let surf = self.surfaces.get(handle).ok_or(Error::InvalidHandle)?;
                if surf.iso != IsoClass::Iso {
                    return Err(Error::InvalidParameter);
                }
                if !layer_caps.formats.contains(FormatMask::from_format(surf.format)) {
                    return Err(Error::NotSupported);
                }
                // The fetch rectangle must exist within the surface.
                if state.size_in.width > surf.width_in_pixels
                    || state.size_in.height > surf.height_in_pixels
                {
                    return Err(Error::InvalidParameter);
                }
            }

            if state.surfaces[LEFT].is_some() {
                if state.size_in.width == 0 || state.size_in.height == 0 {
                    return Err(Error::InvalidParameter);
                }
                if state.size_in.width > layer_caps.max_size.width
                    || state.size_in.height > layer_caps.max_size.height
                {
                    return Err(Error::InvalidParameter);
                }
                // The output rectangle must fit the current raster.
                if state.size_out.width > mode.h_visible || state.size_out.height > mode.v_visible
                {
                    return Err(Error::InvalidParameter);
                }
            }

            if state.min_present_interval > layer_caps.max_present_interval {
                return Err(Error::InvalidParameter);
            }

            let channel_caps = self.channels.layer_channel_caps(one.head, *layer);
            if state.tearing {
                if !channel_caps.tearing_flips {
                    return Err(Error::NotSupported);
                }
                // Tearing flips scan out immediately; a nonzero present
                // interval cannot be honored.
                if state.min_present_interval != 0 {
                    return Err(Error::InvalidParameter);
                }
            }

            if let FlipSync::Semaphores { acquire, release } = &state.sync {
                for spec in [acquire, release].into_iter().flatten() {
                    self.validate_niso_access(
                        spec.surface,
                        spec.format.semaphore_size_in_bytes(),
                        spec.offset_in_words,
                    )?;
                }
            }
            if let Some(spec) = &state.completion_notifier {
                self.validate_niso_access(
                    spec.surface,
                    spec.format.notifier_size_in_words() as u32 * 4,
                    spec.offset_in_words,
                )?;
            }
        }
        Ok(())
    }

    /// A semaphore or notifier must land inside a NISO surface, aligned
    /// to its own record size.
    fn validate_niso_access(
        &self,
        handle: SurfaceHandle,
        record_bytes: u32,
        offset_in_words: u32,
    ) -> Result<()> {
        let surf = self.surfaces.get(handle).ok_or(Error::InvalidHandle)?;
        if surf.iso != IsoClass::Niso {
            return Err(Error::InvalidParameter);
        }
        let offset_bytes = u64::from(offset_in_words) * 4;
        if offset_bytes % u64::from(record_bytes) != 0 {
            return Err(Error::InvalidParameter);
        }
        let end = offset_bytes + u64::from(record_bytes);
        if end > surf.planes[0].size {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    pub(crate) fn program_layer_flip(
        &mut self,
        disp: usize,
        head: u32,
        layer: u32,
        new: &LayerFlipState,
        sdm: SubDevMask,
        update: &mut UpdateState,
    ) {
        // Pin the incoming flip's surfaces before anything is released.
        for handle in referenced_surfaces(new) {
            self.surfaces.increment_refs(handle);
        }

        // The completion notifier reports this flip, not the last one.
        if let Some(spec) = &new.completion_notifier {
            self.reset_client_notifier(spec);
        }

        let hw = self.resolve_hw_flip(new);
        self.channels.flip_layer(head, layer, sdm, &hw);

        let mask = ChannelSet::layer_mask(head, layer);
        update.mark(sdm, mask);
        if new.tearing {
            update.mark_no_core_interlock(sdm, mask);
        }
        if new.allow_flip_lock {
            update.mark_flip_lock_qualifying(sdm, mask);
        }

        // Flip away from the previous state only now that the new one
        // holds its own references.
        let old = std::mem::replace(
            &mut self.disps[disp].heads[head as usize].layers[layer as usize],
            new.clone(),
        );
        for handle in referenced_surfaces(&old) {
            self.surfaces
                .decrement_refs(handle, &*self.rm, &mut self.channels);
        }
    }

    pub(crate) fn reset_client_notifier(&self, spec: &NotifierSpec) {
        let Some(surf) = self.surfaces.get(spec.surface) else {
            return;
        };
        let Some(mem) = &surf.cpu_mapping else {
            return;
        };
        let slot = spec.offset_in_words as usize / spec.format.notifier_size_in_words();
        notifier::reset_notifier(spec.format, false, slot, mem);
    }

    pub(crate) fn resolve_hw_flip(&self, state: &LayerFlipState) -> HwFlipState {
        let mut hw = HwFlipState::null();
        hw.size_in = state.size_in;
        hw.size_out = state.size_out;
        hw.min_present_interval = state.min_present_interval;
        hw.tearing = state.tearing;

        if let Some(handle) = state.surfaces[LEFT] {
            if let Some(surf) = self.surfaces.get(handle) {
                hw.ctx_dma = surf.planes[0].rm_handle.0;
                hw.offset = surf.planes[0].offset;
                hw.pitch = surf.planes[0].pitch;
            }
        }

        if let FlipSync::Semaphores { acquire, release } = &state.sync {
            hw.sem_acquire = acquire.as_ref().and_then(|spec| self.resolve_semaphore(spec));
            hw.sem_release = release.as_ref().and_then(|spec| self.resolve_semaphore(spec));
        }

        if let Some(spec) = &state.completion_notifier {
            if let Some(surf) = self.surfaces.get(spec.surface) {
                hw.notifier = Some(HwNotifier {
                    ctx_dma: surf.planes[0].rm_handle.0,
                    offset_in_words: spec.offset_in_words,
                });
            }
        }
        hw
    }

    fn resolve_semaphore(&self, spec: &SemaphoreSpec) -> Option<HwSemaphore> {
        let surf = self.surfaces.get(spec.surface)?;
        Some(HwSemaphore {
            ctx_dma: surf.planes[0].rm_handle.0,
            offset_in_words: spec.offset_in_words,
            value: spec.value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{active_mode, register_test_surface, test_device};
    use nvdisp_core::types::ClientRef;

    fn one_layer_flip(surface: SurfaceHandle) -> FlipRequest {
        FlipRequest {
            heads: vec![FlipRequestOneHead {
                disp: 0,
                head: 0,
                layers: vec![(
                    0,
                    LayerFlipState {
                        surfaces: [Some(surface), None],
                        size_in: FrameSize::new(640, 480),
                        size_out: FrameSize::new(640, 480),
                        ..Default::default()
                    },
                )],
            }],
            sync: false,
        }
    }

    #[test]
    fn test_flip_programs_channel_and_tracks_state() {
        let mut dev = test_device();
        dev.disps[0].heads[0].mode = Some(active_mode());
        let client = ClientRef(1);
        let surface = register_test_surface(&mut dev, client, 640, 480);

        let reply = dev.flip(&one_layer_flip(surface)).unwrap();
        assert_eq!(reply.heads_programmed, 1);

        // The base channel saw methods and was kicked off; the core
        // channel carried the interlocked update.
        assert!(dev.channels.base[0].put_offset() > 0);
        assert!(dev.channels.core.put_offset() > 0);

        // The flip holds a hardware reference on top of registration.
        assert_eq!(dev.surfaces.get(surface).unwrap().rm_ref_cnt(), 2);
        assert_eq!(
            dev.disps[0].heads[0].layers[0].surfaces[LEFT],
            Some(surface)
        );
    }

    #[test]
    fn test_reflip_same_surface_never_hits_zero_refs() {
        let mut dev = test_device();
        dev.disps[0].heads[0].mode = Some(active_mode());
        let client = ClientRef(1);
        let surface = register_test_surface(&mut dev, client, 640, 480);

        dev.flip(&one_layer_flip(surface)).unwrap();

        // The owner goes away; only the flip keeps the surface alive.
        dev.unregister_surface(client, surface).unwrap();
        assert_eq!(dev.surfaces.get(surface).unwrap().rm_ref_cnt(), 1);

        // Re-flipping the same surface takes the new reference before
        // dropping the old one, so the surface survives.
        dev.flip(&one_layer_flip(surface)).unwrap();
        assert_eq!(dev.surfaces.get(surface).unwrap().rm_ref_cnt(), 1);

        // Flipping away to NULL finally frees it.
        dev.flip(&FlipRequest {
            heads: vec![FlipRequestOneHead {
                disp: 0,
                head: 0,
                layers: vec![(0, LayerFlipState::default())],
            }],
            sync: false,
        })
        .unwrap();
        assert!(dev.surfaces.get(surface).is_none());
    }

    #[test]
    fn test_flip_to_inactive_head_rejected() {
        let mut dev = test_device();
        let client = ClientRef(1);
        let surface = register_test_surface(&mut dev, client, 640, 480);

        assert_eq!(
            dev.flip(&one_layer_flip(surface)).unwrap_err(),
            Error::InvalidParameter
        );
        // Validation failed before any refcount changed.
        assert_eq!(dev.surfaces.get(surface).unwrap().rm_ref_cnt(), 1);
    }

    #[test]
    fn test_tearing_flip_requires_channel_support() {
        let mut dev = test_device();
        dev.disps[0].heads[0].mode = Some(active_mode());
        let client = ClientRef(1);
        let surface = register_test_surface(&mut dev, client, 640, 480);

        let mut req = one_layer_flip(surface);
        req.heads[0].layers[0].1.tearing = true;
        req.heads[0].layers[0].1.min_present_interval = 0;

        // Test channels report no tearing capability.
        assert_eq!(dev.flip(&req).unwrap_err(), Error::NotSupported);
    }

    #[test]
    fn test_flip_fetch_larger_than_surface_rejected() {
        let mut dev = test_device();
        dev.disps[0].heads[0].mode = Some(active_mode());
        let client = ClientRef(1);
        let surface = register_test_surface(&mut dev, client, 320, 240);

        let req = one_layer_flip(surface);
        assert_eq!(dev.flip(&req).unwrap_err(), Error::InvalidParameter);
    }
}
