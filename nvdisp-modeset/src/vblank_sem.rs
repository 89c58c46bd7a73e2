// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Vblank semaphore controls
//!
//! A client binds a CPU-mapped semaphore area to a head's vblank; every
//! vblank the driver stamps it with the vblank count, a timestamp, and
//! the last request counter it observed, letting clients pace rendering
//! against scanout without a wakeup per frame.
//!
//! Area layout, in dwords from `offset_in_words`:
//!
//! | word | contents                         | written by |
//! |------|----------------------------------|------------|
//! | 0    | request counter                  | client     |
//! | 1    | vblank count                     | driver     |
//! | 2, 3 | timestamp (lo, hi), microseconds | driver     |
//! | 4    | latched request counter          | driver     |

use nvdisp_core::surface::SurfaceHandle;
use nvdisp_core::types::IsoClass;
use nvdisp_core::{Error, Result};

use crate::DevEvo;

/// Size of one control area, in dwords.
pub const VBLANK_SEM_CONTROL_WORDS: u32 = 5;

const REQUEST_COUNTER_WORD: usize = 0;
const VBLANK_COUNT_WORD: usize = 1;
const TIMESTAMP_LO_WORD: usize = 2;
const TIMESTAMP_HI_WORD: usize = 3;
const LATCHED_REQUEST_WORD: usize = 4;

/// One vblank-bound semaphore area.
pub struct VblankSemControl {
    pub id: u32,
    pub head: u32,
    pub surface: SurfaceHandle,
    pub offset_in_words: u32,
    vblank_count: u32,
    last_latched_request: u32,
}

impl DevEvo {
    /// Bind a semaphore area to a head's vblank.
    ///
    /// The surface must be NISO with a CPU mapping (the driver writes it
    /// from the vblank callback) and stays referenced while bound.
    pub fn enable_vblank_sem_control(
        &mut self,
        disp: usize,
        head: u32,
        surface: SurfaceHandle,
        offset_in_words: u32,
    ) -> Result<u32> {
        if disp >= self.disps.len() || head >= self.caps.num_heads {
            return Err(Error::InvalidParameter);
        }
        {
            let surf = self.surfaces.get(surface).ok_or(Error::InvalidHandle)?;
            if surf.iso != IsoClass::Niso || surf.cpu_mapping.is_none() {
                return Err(Error::InvalidParameter);
            }
            let end = (u64::from(offset_in_words) + u64::from(VBLANK_SEM_CONTROL_WORDS)) * 4;
            if end > surf.planes[0].size {
                return Err(Error::InvalidParameter);
            }
        }

        self.surfaces.increment_refs(surface);
        let id = self.next_vblank_sem_id;
        self.next_vblank_sem_id += 1;
        self.disps[disp].vblank_sem_controls.push(VblankSemControl {
            id,
            head,
            surface,
            offset_in_words,
            vblank_count: 0,
            last_latched_request: 0,
        });
        Ok(id)
    }

    /// Unbind a semaphore area, stamping it one final time so no client
    /// waits on a vblank that will never be serviced.
    pub fn disable_vblank_sem_control(&mut self, disp: usize, id: u32) -> Result<()> {
        let disp_state = self.disps.get_mut(disp).ok_or(Error::InvalidParameter)?;
        let index = disp_state
            .vblank_sem_controls
            .iter()
            .position(|c| c.id == id)
            .ok_or(Error::InvalidHandle)?;

        let mut control = disp_state.vblank_sem_controls.swap_remove(index);
        let now = self.host.get_usec();
        stamp_control(&self.surfaces, &mut control, now);
        self.surfaces
            .decrement_refs(control.surface, &*self.rm, &mut self.channels);
        Ok(())
    }

    /// Stamp every control bound to `head`. Called from the vblank
    /// callback.
    pub(crate) fn service_vblank_sem_controls(&mut self, disp: usize, head: u32) {
        let DevEvo {
            disps,
            surfaces,
            host,
            ..
        } = self;
        let Some(disp_state) = disps.get_mut(disp) else {
            return;
        };
        if !disp_state.vblank_sem_controls.iter().any(|c| c.head == head) {
            return;
        }
        let now = host.get_usec();
        for control in disp_state
            .vblank_sem_controls
            .iter_mut()
            .filter(|c| c.head == head)
        {
            stamp_control(surfaces, control, now);
        }
    }

    /// Force-stamp every control on a head about to be shut down, so
    /// waiters are released before the vblank stops arriving.
    pub(crate) fn accelerate_vblank_sem_controls(&mut self, disp: usize, head: u32) {
        let DevEvo {
            disps,
            surfaces,
            host,
            ..
        } = self;
        let Some(disp_state) = disps.get_mut(disp) else {
            return;
        };
        if !disp_state.vblank_sem_controls.iter().any(|c| c.head == head) {
            return;
        }
        let now = host.get_usec();
        for control in disp_state
            .vblank_sem_controls
            .iter_mut()
            .filter(|c| c.head == head)
        {
            log::info!(
                "accelerating vblank semaphore control {} on head {}",
                control.id,
                head
            );
            stamp_control(surfaces, control, now);
        }
    }
}

fn stamp_control(
    surfaces: &nvdisp_core::surface::SurfaceArena,
    control: &mut VblankSemControl,
    now_usec: u64,
) {
    let Some(surf) = surfaces.get(control.surface) else {
        return;
    };
    let Some(mem) = &surf.cpu_mapping else {
        return;
    };
    let base = control.offset_in_words as usize;

    control.vblank_count = control.vblank_count.wrapping_add(1);
    let request = mem.read(base + REQUEST_COUNTER_WORD);
    control.last_latched_request = request;

    mem.write(base + VBLANK_COUNT_WORD, control.vblank_count);
    mem.write(base + TIMESTAMP_LO_WORD, now_usec as u32);
    mem.write(base + TIMESTAMP_HI_WORD, (now_usec >> 32) as u32);
    mem.write(base + LATCHED_REQUEST_WORD, request);
}
