//! Shared test fixtures: a model of the display hardware registers, a
//! resource manager stub, a virtual clock, and surface helpers.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use nvdisp_core::dma::{ChannelCaps, ChannelDesc, ChannelIo, EvoChannel};
use nvdisp_core::mem::DmaMemory;
use nvdisp_core::rm::{HostOps, ImpRequest, ResourceManager, RmHandle};
use nvdisp_core::surface::{PlaneRequest, SurfaceHandle, SurfaceRegisterRequest};
use nvdisp_core::types::{
    ChannelMask, ClientRef, CursorChannelKind, DeviceCaps, IsoClass, Rect, SurfaceFormat,
    SurfaceLayout,
};
use nvdisp_core::{MAX_HEADS, MAX_PLANES};

use crate::cursor::CursorPio;
use crate::headsurface::HsRenderer;
use crate::modeset::{DisplayMode, DpyEvo, DpyId, TileInfo, TileTopologyId};
use crate::{DevEvo, DisplayIo, NvDispConfig};

/// GET/PUT registers of one channel; the "hardware" consumes methods
/// instantly, so GET always reads back the last published PUT.
struct AutoDrainIo {
    last_put: Vec<AtomicU32>,
}

impl ChannelIo for AutoDrainIo {
    fn read_get(&self, sd: u32) -> u32 {
        self.last_put[sd as usize].load(Ordering::Relaxed)
    }

    fn write_put(&self, sd: u32, put_offset: u32) {
        self.last_put[sd as usize].store(put_offset, Ordering::Relaxed);
    }
}

struct NullCursorPio;

impl CursorPio for NullCursorPio {
    fn set_cursor_position(&self, _sd: u32, _head: u32, _x: i16, _y: i16) {}
}

pub(crate) struct TestIo {
    num_subdevices: u32,
}

impl TestIo {
    pub(crate) fn new(num_subdevices: u32) -> Arc<Self> {
        Arc::new(Self { num_subdevices })
    }
}

impl DisplayIo for TestIo {
    fn channel_io(&self, _mask: ChannelMask) -> Arc<dyn ChannelIo> {
        Arc::new(AutoDrainIo {
            last_put: (0..self.num_subdevices).map(|_| AtomicU32::new(0)).collect(),
        })
    }

    fn cursor_pio(&self) -> Option<Arc<dyn CursorPio>> {
        Some(Arc::new(NullCursorPio))
    }
}

pub(crate) struct TestRm {
    imp_fail_with_scaling: AtomicBool,
}

impl TestRm {
    pub(crate) fn new() -> Self {
        Self {
            imp_fail_with_scaling: AtomicBool::new(false),
        }
    }

    pub(crate) fn fail_imp_with_scaling(&self) {
        self.imp_fail_with_scaling.store(true, Ordering::Relaxed);
    }
}

impl ResourceManager for TestRm {
    fn alloc_display_channel(&self, _h: RmHandle, _class: u32, _instance: u32) -> nvdisp_core::RmStatus {
        nvdisp_core::RmStatus::Success
    }
    fn alloc_memory(&self, _h: RmHandle, _size: u64) -> nvdisp_core::RmStatus {
        nvdisp_core::RmStatus::Success
    }
    fn dup_memory(&self, _h: RmHandle, _src: RmHandle) -> nvdisp_core::RmStatus {
        nvdisp_core::RmStatus::Success
    }
    fn free(&self, _h: RmHandle) -> nvdisp_core::RmStatus {
        nvdisp_core::RmStatus::Success
    }
    fn flush_framebuffer(&self, _sd: u32) -> nvdisp_core::RmStatus {
        nvdisp_core::RmStatus::Success
    }
    fn accelerate_channel(&self, _c: RmHandle) -> nvdisp_core::RmStatus {
        nvdisp_core::RmStatus::Success
    }
    fn validate_imp(&self, req: &ImpRequest) -> nvdisp_core::RmStatus {
        if req.output_scaling && self.imp_fail_with_scaling.load(Ordering::Relaxed) {
            nvdisp_core::RmStatus::InvalidState
        } else {
            nvdisp_core::RmStatus::Success
        }
    }
}

/// Virtual microsecond clock advancing a fixed step per query, so
/// timeout paths run instantly.
pub(crate) struct TestHost {
    usec: AtomicU64,
    step: u64,
}

impl TestHost {
    pub(crate) fn new(step: u64) -> Self {
        Self {
            usec: AtomicU64::new(0),
            step,
        }
    }
}

impl HostOps for TestHost {
    fn get_usec(&self) -> u64 {
        self.usec.fetch_add(self.step, Ordering::Relaxed)
    }
    fn yield_now(&self) {}
}

#[derive(Default)]
pub(crate) struct TestRenderer {
    last_offset: [AtomicU32; MAX_HEADS],
}

impl HsRenderer for TestRenderer {
    fn render_frame(
        &mut self,
        _head: u32,
        _eye: usize,
        _buffer_index: usize,
        _honor_clip_list: bool,
        _dest_rect: Rect,
        _layers: &[Option<SurfaceHandle>],
    ) -> bool {
        true
    }

    fn last_rendered_offset(&self, head: u32) -> u8 {
        self.last_offset[head as usize].load(Ordering::Relaxed) as u8
    }

    fn push_viewport_flip(&mut self, head: u32, offset: u8) {
        self.last_offset[head as usize].store(u32::from(offset), Ordering::Relaxed);
    }
}

pub(crate) fn test_caps() -> DeviceCaps {
    DeviceCaps {
        num_subdevices: 1,
        num_heads: MAX_HEADS as u32,
        core_channel_class: 0xc37d,
        cursor_kind: CursorChannelKind::Pio,
        ..Default::default()
    }
}

fn build_device(step: u64, renderer: Option<Box<dyn HsRenderer>>) -> (DevEvo, Arc<TestRm>) {
    let rm = Arc::new(TestRm::new());
    let dev = DevEvo::new(NvDispConfig {
        caps: test_caps(),
        rm: rm.clone(),
        host: Arc::new(TestHost::new(step)),
        io: TestIo::new(1),
        renderer,
        ring_dwords: 1024,
    })
    .expect("test device construction");
    (dev, rm)
}

pub(crate) fn test_device() -> DevEvo {
    build_device(10_000, None).0
}

pub(crate) fn test_device_with_caps(caps: DeviceCaps) -> DevEvo {
    let rm = Arc::new(TestRm::new());
    DevEvo::new(NvDispConfig {
        caps,
        rm,
        host: Arc::new(TestHost::new(10_000)),
        io: TestIo::new(1),
        renderer: None,
        ring_dwords: 1024,
    })
    .expect("test device construction")
}

pub(crate) fn test_config() -> NvDispConfig {
    NvDispConfig {
        caps: test_caps(),
        rm: Arc::new(TestRm::new()),
        host: Arc::new(TestHost::new(10_000)),
        io: TestIo::new(1),
        renderer: None,
        ring_dwords: 1024,
    }
}

pub(crate) fn test_device_with_rm() -> (DevEvo, Arc<TestRm>) {
    build_device(10_000, None)
}

pub(crate) fn test_device_with_hs() -> DevEvo {
    build_device(1, Some(Box::new(TestRenderer::default()))).0
}

pub(crate) fn test_channel(io: &Arc<TestIo>) -> EvoChannel {
    EvoChannel::new(
        ChannelDesc {
            hwclass: 0xc37d,
            instance: 0,
            mask: ChannelMask::CORE,
            handle: RmHandle(1),
            ring_dwords: 512,
            num_subdevices: 1,
            fb_mirrored: false,
            caps: ChannelCaps::default(),
        },
        io.channel_io(ChannelMask::CORE),
        Arc::new(TestRm::new()),
        Arc::new(TestHost::new(1)),
        1,
    )
}

pub(crate) fn active_mode() -> DisplayMode {
    DisplayMode {
        h_visible: 1024,
        v_visible: 768,
        refresh_x1000: 60_000,
        pixel_clock_khz: 65_000,
    }
}

pub(crate) fn register_test_surface(
    dev: &mut DevEvo,
    client: ClientRef,
    width: u32,
    height: u32,
) -> SurfaceHandle {
    let pitch = width * 4;
    let req = SurfaceRegisterRequest {
        width_in_pixels: width,
        height_in_pixels: height,
        format: SurfaceFormat::A8R8G8B8,
        layout: SurfaceLayout::Pitch,
        iso: IsoClass::Iso,
        log2_gob_y: 0,
        num_planes: 1,
        planes: [PlaneRequest {
            offset: 0,
            pitch,
            rm_memory: RmHandle(0x8000),
            alloc_size: u64::from(pitch) * u64::from(height),
        }; MAX_PLANES],
        no_display_hardware_access: false,
        needs_cpu_mapping: false,
        needs_gpu_mapping: true,
        mem: DmaMemory::new(0),
    };
    dev.register_surface(client, &req).expect("surface registration")
}

pub(crate) fn register_cursor_surface(
    dev: &mut DevEvo,
    client: ClientRef,
    size: u32,
) -> SurfaceHandle {
    register_test_surface(dev, client, size, size)
}

/// A CPU-mapped NISO surface (for semaphores and notifiers), returned
/// together with its backing memory.
pub(crate) fn register_niso_surface(
    dev: &mut DevEvo,
    client: ClientRef,
) -> (SurfaceHandle, Arc<DmaMemory>) {
    let mem = DmaMemory::new(256);
    let req = SurfaceRegisterRequest {
        width_in_pixels: 256,
        height_in_pixels: 1,
        format: SurfaceFormat::A8R8G8B8,
        layout: SurfaceLayout::Pitch,
        iso: IsoClass::Niso,
        log2_gob_y: 0,
        num_planes: 1,
        planes: [PlaneRequest {
            offset: 0,
            pitch: 1024,
            rm_memory: RmHandle(0x8100),
            alloc_size: 1024,
        }; MAX_PLANES],
        no_display_hardware_access: true,
        needs_cpu_mapping: true,
        needs_gpu_mapping: false,
        mem: mem.clone(),
    };
    let handle = dev
        .register_surface(client, &req)
        .expect("niso surface registration");
    (handle, mem)
}

pub(crate) fn test_dpy(id: u32, boot: bool) -> DpyEvo {
    DpyEvo {
        id: DpyId(id),
        connected: true,
        boot,
        tile: None,
        modes: vec![active_mode()],
    }
}

pub(crate) fn tiled_dpy(
    id: u32,
    topology: TileTopologyId,
    rows: u8,
    cols: u8,
    location: (u8, u8),
) -> DpyEvo {
    DpyEvo {
        id: DpyId(id),
        connected: true,
        boot: false,
        tile: Some(TileInfo {
            topology,
            rows,
            cols,
            location,
        }),
        modes: vec![active_mode()],
    }
}
