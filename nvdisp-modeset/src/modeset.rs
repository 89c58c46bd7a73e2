// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Modesets and console restore
//!
//! A modeset applies a complete per-disp head configuration: heads in
//! the request get rasters, heads left out are shut down. Every request
//! passes IMP validation before any hardware state changes.
//!
//! Console restore builds a best-effort configuration when ownership is
//! lost: light as many connected displays as possible, preferring boot
//! displays, driving complete tiled displays tile-per-head, retrying
//! without output scaling when IMP rejects a scaled configuration, and
//! shutting everything down as a last resort.

use nvdisp_core::rm::ImpRequest;
use nvdisp_core::types::{ChannelMask, SubDevMask};
use nvdisp_core::update::UpdateState;
use nvdisp_core::{Error, Result, MAX_LAYERS_PER_HEAD};

use crate::flip::{referenced_surfaces, LayerFlipState};
use crate::DevEvo;

/// A display timing the hardware can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    pub h_visible: u32,
    pub v_visible: u32,
    pub refresh_x1000: u32,
    pub pixel_clock_khz: u32,
}

/// Mode used when a display offers nothing better.
pub const SAFE_MODE: DisplayMode = DisplayMode {
    h_visible: 640,
    v_visible: 480,
    refresh_x1000: 60_000,
    pixel_clock_khz: 25_175,
};

/// Identifier of a connected display device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DpyId(pub u32);

/// Identity of a tiled display assembly, shared by all its tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileTopologyId {
    pub vendor: u32,
    pub product: u32,
    pub serial: u32,
}

/// Tiling information parsed from a display's DisplayID block.
#[derive(Debug, Clone, Copy)]
pub struct TileInfo {
    pub topology: TileTopologyId,
    pub rows: u8,
    pub cols: u8,
    /// (x, y) position of this tile within the grid.
    pub location: (u8, u8),
}

/// A display device on a disp.
#[derive(Debug, Clone)]
pub struct DpyEvo {
    pub id: DpyId,
    pub connected: bool,
    /// The display the firmware console came up on.
    pub boot: bool,
    pub tile: Option<TileInfo>,
    /// Validated modes, preferred first.
    pub modes: Vec<DisplayMode>,
}

impl DpyEvo {
    fn preferred_mode(&self) -> DisplayMode {
        self.modes.first().copied().unwrap_or(SAFE_MODE)
    }
}

/// A group of displays claiming to be tiles of one assembly.
#[derive(Debug)]
pub struct TiledGroup {
    pub topology: TileTopologyId,
    pub rows: u8,
    pub cols: u8,
    pub dpys: Vec<DpyId>,
    pub detected_tiles: u32,
    /// All tiles present, with unique in-range locations and a
    /// consistent grid. Only a complete group is driven as one display.
    pub is_detect_complete: bool,
}

/// Group connected displays into tiled assemblies by topology id.
pub fn detect_tiled_groups(dpys: &[DpyEvo]) -> Vec<TiledGroup> {
    struct Builder {
        group: TiledGroup,
        locations: Vec<(u8, u8)>,
        consistent: bool,
    }
    let mut builders: Vec<Builder> = Vec::new();

    for dpy in dpys.iter().filter(|d| d.connected) {
        let Some(tile) = &dpy.tile else { continue };

        let index = match builders
            .iter()
            .position(|b| b.group.topology == tile.topology)
        {
            Some(index) => index,
            None => {
                builders.push(Builder {
                    group: TiledGroup {
                        topology: tile.topology,
                        rows: tile.rows,
                        cols: tile.cols,
                        dpys: Vec::new(),
                        detected_tiles: 0,
                        is_detect_complete: false,
                    },
                    locations: Vec::new(),
                    consistent: true,
                });
                builders.len() - 1
            }
        };
        let builder = &mut builders[index];

        if tile.rows != builder.group.rows || tile.cols != builder.group.cols {
            builder.consistent = false;
        }
        let in_range = tile.location.0 < builder.group.cols && tile.location.1 < builder.group.rows;
        if in_range && !builder.locations.contains(&tile.location) {
            builder.locations.push(tile.location);
        }
        builder.group.dpys.push(dpy.id);
    }

    builders
        .into_iter()
        .map(|mut b| {
            let num_tiles = u32::from(b.group.rows) * u32::from(b.group.cols);
            b.group.detected_tiles = b.locations.len() as u32;
            b.group.is_detect_complete =
                b.consistent && num_tiles != 0 && b.group.detected_tiles == num_tiles;
            if !b.group.is_detect_complete {
                log::info!(
                    "tiled display {:04x}:{:04x} detection incomplete ({} of {} tiles)",
                    b.group.topology.vendor,
                    b.group.topology.product,
                    b.group.detected_tiles,
                    num_tiles
                );
            }
            b.group
        })
        .collect()
}

/// One head's requested configuration.
#[derive(Debug, Clone)]
pub struct SetModeOneHead {
    pub head: u32,
    pub dpy: DpyId,
    pub mode: DisplayMode,
    pub scaling: bool,
}

/// A complete per-disp modeset request. Active heads not listed are
/// shut down.
#[derive(Debug, Clone)]
pub struct SetModeRequest {
    pub disp: usize,
    pub heads: Vec<SetModeOneHead>,
}

impl DevEvo {
    /// Validate and apply a modeset.
    pub fn set_mode(&mut self, req: &SetModeRequest) -> Result<()> {
        {
            let disp = self.disps.get(req.disp).ok_or(Error::InvalidParameter)?;
            let mut seen_heads = 0u32;
            for one in &req.heads {
                if one.head >= self.caps.num_heads {
                    return Err(Error::InvalidParameter);
                }
                if seen_heads & (1 << one.head) != 0 {
                    return Err(Error::InvalidParameter);
                }
                seen_heads |= 1 << one.head;

                let head_caps = &self.caps.head_caps[one.head as usize];
                if !head_caps.usable {
                    return Err(Error::NotSupported);
                }
                if one.mode.h_visible == 0
                    || one.mode.v_visible == 0
                    || one.mode.pixel_clock_khz == 0
                    || one.mode.pixel_clock_khz > head_caps.max_pclk_khz
                {
                    return Err(Error::InvalidParameter);
                }
                if !disp.dpys.iter().any(|d| d.id == one.dpy && d.connected) {
                    return Err(Error::InvalidParameter);
                }
            }
        }

        let imp = ImpRequest {
            num_active_heads: req.heads.len() as u32,
            total_pclk_khz: req.heads.iter().map(|h| h.mode.pixel_clock_khz).sum(),
            output_scaling: req.heads.iter().any(|h| h.scaling),
        };
        let status = self.rm.validate_imp(&imp);
        if !status.is_success() {
            log::debug!("modeset rejected by IMP: {}", status);
            return Err(Error::Rm(status));
        }

        let sdm = SubDevMask::single(self.disps[req.disp].display_owner);
        let mut update = UpdateState::new();

        for head in 0..self.caps.num_heads {
            let head_idx = head as usize;
            match req.heads.iter().find(|one| one.head == head) {
                Some(one) => {
                    self.channels.set_raster(head, &one.mode, sdm);
                    update.mark(sdm, ChannelMask::CORE);
                    let state = &mut self.disps[req.disp].heads[head_idx];
                    state.mode = Some(one.mode);
                    state.scaling = one.scaling;
                    state.dpy = Some(one.dpy);
                }
                None => {
                    if self.disps[req.disp].heads[head_idx].mode.is_none() {
                        continue;
                    }
                    // The head is going dark: flush pending vblank
                    // semaphores and release its scanout surfaces.
                    self.accelerate_vblank_sem_controls(req.disp, head);
                    for layer in 0..MAX_LAYERS_PER_HEAD as u32 {
                        let in_use = !referenced_surfaces(
                            &self.disps[req.disp].heads[head_idx].layers[layer as usize],
                        )
                        .is_empty();
                        if in_use {
                            self.program_layer_flip(
                                req.disp,
                                head,
                                layer,
                                &LayerFlipState::default(),
                                sdm,
                                &mut update,
                            );
                        }
                    }
                    self.channels.shutdown_head(head, sdm);
                    update.mark(sdm, ChannelMask::CORE);
                    let state = &mut self.disps[req.disp].heads[head_idx];
                    state.mode = None;
                    state.scaling = false;
                    state.dpy = None;
                }
            }
        }

        self.update_and_kickoff(update, true);
        Ok(())
    }

    /// Restore a usable console configuration on every disp.
    ///
    /// Returns true if at least one head was lit.
    pub fn restore_console(&mut self) -> bool {
        log::info!("restoring console");
        let mut any_lit = false;
        for disp in 0..self.disps.len() {
            if self.restore_console_one_disp(disp) {
                any_lit = true;
            }
        }
        any_lit
    }

    fn restore_console_one_disp(&mut self, disp: usize) -> bool {
        let connected: Vec<DpyEvo> = self.disps[disp]
            .dpys
            .iter()
            .filter(|d| d.connected)
            .cloned()
            .collect();
        if connected.is_empty() {
            self.shutdown_disp_heads(disp);
            return false;
        }

        let num_heads = self.caps.num_heads as usize;
        let groups = detect_tiled_groups(&connected);
        let mut chosen: Vec<(DpyId, DisplayMode)> = Vec::new();

        if let Some(group) = groups
            .iter()
            .find(|g| g.is_detect_complete && g.dpys.len() <= num_heads)
        {
            // A complete tiled display: drive each tile on its own head
            // at its native mode.
            log::info!(
                "console restore: driving {}x{} tiled display",
                group.cols,
                group.rows
            );
            for id in &group.dpys {
                if let Some(dpy) = connected.iter().find(|d| d.id == *id) {
                    chosen.push((dpy.id, dpy.preferred_mode()));
                }
            }
        } else {
            // Clone configuration across as many displays as we have
            // heads, boot displays first.
            let mut sorted = connected.clone();
            sorted.sort_by_key(|d| !d.boot);
            for dpy in sorted.iter().take(num_heads) {
                chosen.push((dpy.id, dpy.preferred_mode()));
            }
        }

        let mut scaling = true;
        loop {
            let req = SetModeRequest {
                disp,
                heads: chosen
                    .iter()
                    .enumerate()
                    .map(|(head, (dpy, mode))| SetModeOneHead {
                        head: head as u32,
                        dpy: *dpy,
                        mode: *mode,
                        scaling,
                    })
                    .collect(),
            };

            match self.set_mode(&req) {
                Ok(()) => return true,
                Err(err) => {
                    if scaling {
                        log::info!(
                            "console restore failed with output scaling ({}); retrying without",
                            err
                        );
                        scaling = false;
                        continue;
                    }
                    if chosen.len() > 1 {
                        log::warn!(
                            "console restore failed ({}); dropping one display and retrying",
                            err
                        );
                        chosen.pop();
                        continue;
                    }
                    log::error!("console restore failed ({}); shutting down all heads", err);
                    self.shutdown_disp_heads(disp);
                    return false;
                }
            }
        }
    }

    pub(crate) fn shutdown_disp_heads(&mut self, disp: usize) {
        let req = SetModeRequest {
            disp,
            heads: Vec::new(),
        };
        if self.set_mode(&req).is_err() {
            log::error!("failed to shut down heads on disp {}", disp);
        }
    }
}
