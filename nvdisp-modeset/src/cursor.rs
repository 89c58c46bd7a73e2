// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Hardware cursor
//!
//! The cursor image is programmed through the core channel and latched
//! with an update; position moves go through an immediate path selected
//! at device init from the capabilities: direct PIO registers, or a DMA
//! immediate channel whose update must not interlock with the core
//! channel.

use nvdisp_core::surface::SurfaceHandle;
use nvdisp_core::types::{ChannelMask, CursorChannelKind, SubDevMask, SurfaceFormat, SurfaceLayout};
use nvdisp_core::update::UpdateState;
use nvdisp_core::{Error, Result};

use crate::hal::CursorImage;
use crate::DevEvo;

/// Direct PIO access to cursor position registers.
pub trait CursorPio: Send + Sync {
    fn set_cursor_position(&self, sd: u32, head: u32, x: i16, y: i16);
}

/// Per-head cursor state.
#[derive(Debug, Clone, Copy, Default)]
pub struct CursorState {
    pub surface: Option<SurfaceHandle>,
    pub hot_spot: (i16, i16),
    pub position: (i16, i16),
}

impl DevEvo {
    /// Attach (or with `None`, detach) a cursor image on a head.
    pub fn set_cursor_image(
        &mut self,
        disp: usize,
        head: u32,
        surface: Option<SurfaceHandle>,
        hot_spot: (i16, i16),
    ) -> Result<()> {
        if disp >= self.disps.len() || head >= self.caps.num_heads {
            return Err(Error::InvalidParameter);
        }

        let image = match surface {
            Some(handle) => {
                let surf = self.surfaces.get(handle).ok_or(Error::InvalidHandle)?;
                // Cursor surfaces are square, pitch-layout ARGB, up to
                // the hardware's maximum dimension.
                if surf.format != SurfaceFormat::A8R8G8B8
                    || surf.layout != SurfaceLayout::Pitch
                    || surf.width_in_pixels != surf.height_in_pixels
                    || surf.width_in_pixels > self.caps.max_cursor_size
                {
                    return Err(Error::InvalidParameter);
                }
                Some(CursorImage {
                    ctx_dma: surf.planes[0].rm_handle.0,
                    offset: surf.planes[0].offset,
                    size: surf.width_in_pixels,
                    hot_spot,
                })
            }
            None => None,
        };

        // Pin the new image before unpinning the old one.
        if let Some(handle) = surface {
            self.surfaces.increment_refs(handle);
        }

        let sdm = SubDevMask::single(self.disps[disp].display_owner);
        self.channels.set_cursor_image(head, image.as_ref(), sdm);
        let mut update = UpdateState::new();
        update.mark(sdm, ChannelMask::CORE);
        self.update_and_kickoff(update, false);

        let old = {
            let cursor = &mut self.disps[disp].heads[head as usize].cursor;
            let old = cursor.surface;
            cursor.surface = surface;
            cursor.hot_spot = hot_spot;
            old
        };
        if let Some(handle) = old {
            self.surfaces
                .decrement_refs(handle, &*self.rm, &mut self.channels);
        }
        Ok(())
    }

    /// Move the cursor. Position updates bypass the update-state
    /// machinery's core interlock: they must land immediately.
    pub fn move_cursor(&mut self, disp: usize, head: u32, x: i16, y: i16) -> Result<()> {
        if disp >= self.disps.len() || head >= self.caps.num_heads {
            return Err(Error::InvalidParameter);
        }
        let sd = self.disps[disp].display_owner;

        match self.caps.cursor_kind {
            CursorChannelKind::Pio => {
                let pio = self.cursor_pio.as_ref().ok_or(Error::NotSupported)?;
                pio.set_cursor_position(sd, head, x, y);
            }
            CursorChannelKind::Dma => {
                let sdm = SubDevMask::single(sd);
                self.channels.cursor_position_dma(head, x, y, sdm)?;
                let mut update = UpdateState::new();
                let mask = ChannelMask::window(crate::CURSOR_DMA_WINDOW);
                update.mark(sdm, mask);
                update.mark_no_core_interlock(sdm, mask);
                self.update_and_kickoff(update, false);
            }
        }

        self.disps[disp].heads[head as usize].cursor.position = (x, y);
        Ok(())
    }
}
