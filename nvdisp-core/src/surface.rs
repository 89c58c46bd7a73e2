//! Scanout surface lifecycle
//!
//! Surfaces are registered GPU memory objects shared between client
//! handles and the display hardware. Each surface carries two reference
//! counts with different teardown triggers:
//!
//! - `rm_ref_cnt` counts hardware-visible uses (the registration itself,
//!   plus every flip that scans the surface out). When it reaches zero
//!   the display hardware is flipped away from the surface and drained,
//!   then the backing resource-manager objects are freed.
//! - `struct_ref_cnt` counts handle-visible uses. When it reaches zero
//!   the bookkeeping slot is freed.
//!
//! `rm_ref_cnt` always reaches zero at or before `struct_ref_cnt`; once
//! it does, the hardware-facing fields of the surface are dead and only
//! the struct count is meaningful.
//!
//! Surfaces live in an arena of slots addressed by stable integer
//! handles, so no pointer identity outlives a free.

use std::sync::Arc;

use crate::mem::DmaMemory;
use crate::rm::{ResourceManager, RmHandle, RmHandlePool};
use crate::types::{ClientRef, DeviceCaps, FormatMask, IsoClass, SurfaceFormat, SurfaceLayout};
use crate::{Error, Result, MAX_PLANES};

/// Stable handle to a registered surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(u32);

impl SurfaceHandle {
    fn from_index(index: usize) -> Self {
        SurfaceHandle(index as u32 + 1)
    }

    fn index(self) -> usize {
        self.0 as usize - 1
    }
}

/// One plane of a surface registration request.
#[derive(Debug, Clone, Copy)]
pub struct PlaneRequest {
    /// Byte offset of the plane within the backing allocation.
    pub offset: u64,
    /// Scanline pitch in bytes (gob pitch for block-linear layouts).
    pub pitch: u32,
    /// Foreign memory object to import for this plane.
    pub rm_memory: RmHandle,
    /// Size of the backing allocation, for bounds validation.
    pub alloc_size: u64,
}

/// Parameters for registering a surface.
pub struct SurfaceRegisterRequest {
    pub width_in_pixels: u32,
    pub height_in_pixels: u32,
    pub format: SurfaceFormat,
    pub layout: SurfaceLayout,
    pub iso: IsoClass,
    pub log2_gob_y: u8,
    pub num_planes: usize,
    pub planes: [PlaneRequest; MAX_PLANES],
    /// The surface will never be touched by display hardware (e.g. a
    /// semaphore-only surface); teardown skips the hardware drain.
    pub no_display_hardware_access: bool,
    /// Map the surface for CPU access, required when software polls
    /// semaphores out of it.
    pub needs_cpu_mapping: bool,
    /// Bind a GPU virtual address, required for 3D-engine sampling.
    pub needs_gpu_mapping: bool,
    /// Backing allocation, shared with whoever wrote it.
    pub mem: Arc<DmaMemory>,
}

/// A plane of a registered surface.
#[derive(Debug, Clone, Copy)]
pub struct SurfacePlane {
    pub offset: u64,
    pub pitch: u32,
    pub size: u64,
    pub rm_handle: RmHandle,
}

/// A registered surface.
pub struct SurfaceEvo {
    pub width_in_pixels: u32,
    pub height_in_pixels: u32,
    pub format: SurfaceFormat,
    pub layout: SurfaceLayout,
    pub iso: IsoClass,
    pub log2_gob_y: u8,
    pub num_planes: usize,
    pub planes: [SurfacePlane; MAX_PLANES],
    pub owner: ClientRef,
    pub no_display_hardware_access: bool,
    pub cpu_mapping: Option<Arc<DmaMemory>>,
    pub gpu_address: Option<u64>,
    rm_ref_cnt: u32,
    struct_ref_cnt: u32,
}

impl SurfaceEvo {
    pub fn rm_ref_cnt(&self) -> u32 {
        self.rm_ref_cnt
    }

    pub fn struct_ref_cnt(&self) -> u32 {
        self.struct_ref_cnt
    }
}

/// Callback used by surface teardown to flip display hardware away from
/// surfaces about to lose their backing memory and drain the channels.
pub trait SurfaceUsageClearer {
    fn clear_surface_usage(&mut self, handles: &[SurfaceHandle]);
}

const NO_PLANE: SurfacePlane = SurfacePlane {
    offset: 0,
    pitch: 0,
    size: 0,
    rm_handle: RmHandle::NONE,
};

/// Arena of registered surfaces.
pub struct SurfaceArena {
    slots: Vec<Option<SurfaceEvo>>,
    free: Vec<usize>,
    next_gpu_va: u64,
}

impl SurfaceArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            next_gpu_va: 0x1_0000_0000,
        }
    }

    pub fn get(&self, handle: SurfaceHandle) -> Option<&SurfaceEvo> {
        self.slots.get(handle.index()).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, handle: SurfaceHandle) -> Option<&mut SurfaceEvo> {
        self.slots
            .get_mut(handle.index())
            .and_then(|slot| slot.as_mut())
    }

    /// Number of live surfaces.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Validate and register a surface, importing its backing memory.
    ///
    /// Nothing is published until every step has succeeded; on failure
    /// all partial allocations are unwound in reverse order.
    pub fn register(
        &mut self,
        rm: &dyn ResourceManager,
        handles: &mut RmHandlePool,
        caps: &DeviceCaps,
        owner: ClientRef,
        req: &SurfaceRegisterRequest,
    ) -> Result<SurfaceHandle> {
        let plane_sizes = validate_register_request(caps, req)?;

        // Import (dup) each plane's foreign memory object.
        let mut planes = [NO_PLANE; MAX_PLANES];
        for plane in 0..req.num_planes {
            let preq = &req.planes[plane];
            let handle = handles.alloc();
            let status = rm.dup_memory(handle, preq.rm_memory);
            if !status.is_success() {
                log::warn!("surface plane {} import failed: {}", plane, status);
                unwind_planes(rm, &planes, plane);
                return Err(Error::Rm(status));
            }
            planes[plane] = SurfacePlane {
                offset: preq.offset,
                pitch: preq.pitch,
                size: plane_sizes[plane],
                rm_handle: handle,
            };
        }

        let gpu_address = if req.needs_gpu_mapping {
            let va = self.next_gpu_va;
            self.next_gpu_va += req.planes[0].alloc_size.max(0x1000);
            Some(va)
        } else {
            None
        };

        let cpu_mapping = if req.needs_cpu_mapping {
            Some(req.mem.clone())
        } else {
            None
        };

        let surface = SurfaceEvo {
            width_in_pixels: req.width_in_pixels,
            height_in_pixels: req.height_in_pixels,
            format: req.format,
            layout: req.layout,
            iso: req.iso,
            log2_gob_y: req.log2_gob_y,
            num_planes: req.num_planes,
            planes,
            owner,
            no_display_hardware_access: req.no_display_hardware_access,
            cpu_mapping,
            gpu_address,
            rm_ref_cnt: 1,
            struct_ref_cnt: 1,
        };

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(surface);
                index
            }
            None => {
                self.slots.push(Some(surface));
                self.slots.len() - 1
            }
        };
        Ok(SurfaceHandle::from_index(index))
    }

    /// Take a hardware-visible reference (e.g. a flip now scans the
    /// surface out). Bumps both counts.
    pub fn increment_refs(&mut self, handle: SurfaceHandle) {
        if let Some(surf) = self.get_mut(handle) {
            debug_assert!(surf.rm_ref_cnt > 0);
            surf.rm_ref_cnt += 1;
            surf.struct_ref_cnt += 1;
        }
    }

    /// Take a handle-visible reference only.
    pub fn increment_struct_ref(&mut self, handle: SurfaceHandle) {
        if let Some(surf) = self.get_mut(handle) {
            surf.struct_ref_cnt += 1;
        }
    }

    /// Drop a hardware-visible reference. When the last one goes away
    /// the hardware is drained (unless the surface never reached it) and
    /// the backing objects are freed, strictly before any struct free.
    pub fn decrement_refs(
        &mut self,
        handle: SurfaceHandle,
        rm: &dyn ResourceManager,
        clearer: &mut dyn SurfaceUsageClearer,
    ) {
        self.decrement_refs_inner(handle, rm, Some(clearer));
    }

    /// Drop a handle-visible reference.
    pub fn decrement_struct_ref(&mut self, handle: SurfaceHandle) {
        let Some(surf) = self.get_mut(handle) else {
            return;
        };
        debug_assert!(surf.struct_ref_cnt > 0);
        surf.struct_ref_cnt -= 1;
        if surf.struct_ref_cnt == 0 {
            debug_assert_eq!(surf.rm_ref_cnt, 0);
            self.free_slot(handle);
        }
    }

    fn decrement_refs_inner(
        &mut self,
        handle: SurfaceHandle,
        rm: &dyn ResourceManager,
        clearer: Option<&mut dyn SurfaceUsageClearer>,
    ) {
        let Some(surf) = self.get_mut(handle) else {
            return;
        };
        debug_assert!(surf.rm_ref_cnt > 0);
        surf.rm_ref_cnt -= 1;

        if surf.rm_ref_cnt == 0 {
            let needs_clear = !surf.no_display_hardware_access;
            if needs_clear {
                if let Some(clearer) = clearer {
                    clearer.clear_surface_usage(&[handle]);
                }
            }
            self.free_rm_resources(handle, rm);
        }
        self.decrement_struct_ref(handle);
    }

    /// Free the hardware-facing half of a surface whose rm count hit
    /// zero. The struct stays alive for remaining handle references.
    fn free_rm_resources(&mut self, handle: SurfaceHandle, rm: &dyn ResourceManager) {
        let Some(surf) = self.get_mut(handle) else {
            return;
        };
        for plane in 0..surf.num_planes {
            let rm_handle = surf.planes[plane].rm_handle;
            if !rm_handle.is_none() {
                let status = rm.free(rm_handle);
                if !status.is_success() {
                    log::error!("freeing surface plane memory failed: {}", status);
                }
            }
            surf.planes[plane] = NO_PLANE;
        }
        surf.gpu_address = None;
        surf.cpu_mapping = None;
    }

    fn free_slot(&mut self, handle: SurfaceHandle) {
        let index = handle.index();
        if let Some(slot) = self.slots.get_mut(index) {
            if slot.take().is_some() {
                self.free.push(index);
            }
        }
    }

    /// Unregister a surface. Only the registering client may do this.
    pub fn unregister(
        &mut self,
        client: ClientRef,
        handle: SurfaceHandle,
        rm: &dyn ResourceManager,
        clearer: &mut dyn SurfaceUsageClearer,
    ) -> Result<()> {
        let surf = self.get(handle).ok_or(Error::InvalidHandle)?;
        if surf.owner != client {
            return Err(Error::PermissionDenied);
        }
        self.decrement_refs(handle, rm, clearer);
        Ok(())
    }

    /// Release a reference held by a non-owning client.
    pub fn release(
        &mut self,
        client: ClientRef,
        handle: SurfaceHandle,
        rm: &dyn ResourceManager,
        clearer: &mut dyn SurfaceUsageClearer,
    ) -> Result<()> {
        let surf = self.get(handle).ok_or(Error::InvalidHandle)?;
        if surf.owner == client {
            return Err(Error::PermissionDenied);
        }
        self.decrement_refs(handle, rm, clearer);
        Ok(())
    }

    /// Tear down every surface owned by a closing client.
    ///
    /// The hardware-drain requirements of all the client's surfaces are
    /// collected up front and cleared in one batch. Draining one surface
    /// at a time would pay a full idle-wait per surface when a channel is
    /// already stuck on an unrelated semaphore.
    pub fn free_client_surfaces(
        &mut self,
        client: ClientRef,
        rm: &dyn ResourceManager,
        clearer: &mut dyn SurfaceUsageClearer,
    ) {
        let mut owned = Vec::new();
        let mut to_clear = Vec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(surf) = slot else { continue };
            if surf.owner != client {
                continue;
            }
            let handle = SurfaceHandle::from_index(index);
            owned.push(handle);
            if surf.rm_ref_cnt == 1 && !surf.no_display_hardware_access {
                to_clear.push(handle);
            }
        }

        if !to_clear.is_empty() {
            clearer.clear_surface_usage(&to_clear);
        }
        for handle in owned {
            // Hardware usage was already cleared above for the surfaces
            // that needed it.
            self.decrement_refs_inner(handle, rm, None);
        }
    }
}

impl Default for SurfaceArena {
    fn default() -> Self {
        Self::new()
    }
}

fn unwind_planes(rm: &dyn ResourceManager, planes: &[SurfacePlane; MAX_PLANES], count: usize) {
    for plane in (0..count).rev() {
        let handle = planes[plane].rm_handle;
        if !handle.is_none() {
            let status = rm.free(handle);
            if !status.is_success() {
                log::error!("unwinding surface plane {} failed: {}", plane, status);
            }
        }
    }
}

fn plane_size(req: &SurfaceRegisterRequest, plane: usize) -> Option<u64> {
    let preq = &req.planes[plane];
    let height = match req.layout {
        SurfaceLayout::Pitch => u64::from(req.height_in_pixels),
        // Block-linear planes are sized in gob rows.
        SurfaceLayout::BlockLinear => {
            let gob_height = 8u64 << req.log2_gob_y;
            u64::from(req.height_in_pixels).div_ceil(gob_height) * gob_height
        }
    };
    u64::from(preq.pitch).checked_mul(height)
}

fn validate_register_request(
    caps: &DeviceCaps,
    req: &SurfaceRegisterRequest,
) -> Result<[u64; MAX_PLANES]> {
    if req.num_planes == 0 || req.num_planes > MAX_PLANES {
        return Err(Error::InvalidParameter);
    }
    if req.width_in_pixels == 0 || req.height_in_pixels == 0 {
        return Err(Error::InvalidParameter);
    }

    // ISO surfaces must be scannable by at least one layer.
    if req.iso == IsoClass::Iso
        && !caps
            .any_layer_formats()
            .contains(FormatMask::from_format(req.format))
    {
        return Err(Error::NotSupported);
    }

    if req.needs_cpu_mapping && req.mem.is_empty() {
        return Err(Error::InvalidParameter);
    }

    let mut sizes = [0u64; MAX_PLANES];
    for plane in 0..req.num_planes {
        let preq = &req.planes[plane];
        if preq.pitch == 0 || preq.rm_memory.is_none() {
            return Err(Error::InvalidParameter);
        }

        if req.layout == SurfaceLayout::Pitch {
            // A scanline must fit within the pitch.
            let min_pitch = u64::from(req.width_in_pixels)
                .checked_mul(u64::from(req.format.bytes_per_pixel()))
                .ok_or(Error::InvalidParameter)?;
            if min_pitch > u64::from(preq.pitch) {
                return Err(Error::InvalidParameter);
            }
        }

        // The plane must fit within the backing allocation; every step
        // of the arithmetic is overflow-checked.
        let size = plane_size(req, plane).ok_or(Error::InvalidParameter)?;
        let end = preq.offset.checked_add(size).ok_or(Error::InvalidParameter)?;
        if end > preq.alloc_size {
            return Err(Error::InvalidParameter);
        }
        sizes[plane] = size;
    }
    Ok(sizes)
}
