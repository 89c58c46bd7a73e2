//! Push-buffer DMA engine
//!
//! Each display channel is programmed through a ring of 32-bit methods.
//! Software appends method dwords at a write cursor and publishes the
//! cursor to the hardware PUT register; the display controller consumes
//! from GET toward PUT, following a jump sentinel back to offset 0 at the
//! end of the ring.
//!
//! Wire format: opcode in bits [31:29] (0 = method, 1 = jump, 3 = set
//! subdevice mask), method dword count in bits [27:18], method register
//! offset divided by 4 in bits [15:2]. A method consists of one header
//! dword followed by `count` data dwords.
//!
//! Room for methods is guaranteed by [`EvoChannel::reserve`], which may
//! kick off pending methods, wrap the ring, and poll hardware GET until
//! space opens up. Running out of room is never fatal: display commands
//! cannot be dropped, so the engine logs and keeps waiting.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::mem::DmaMemory;
use crate::rm::{HostOps, ResourceManager, RmHandle};
use crate::types::{ChannelMask, SubDevMask};

pub const OPCODE_METHOD: u32 = 0 << 29;
/// Jump-to-offset-0 sentinel written at the logical end of the ring.
pub const OPCODE_JUMP: u32 = 1 << 29;
pub const OPCODE_SET_SUBDEVICE_MASK: u32 = 3 << 29;

const METHOD_COUNT_SHIFT: u32 = 18;
const METHOD_COUNT_MAX: u32 = 0x3ff;
const METHOD_OFFSET_FIELD: u32 = 0xfffc;
const SUBDEVICE_MASK_FIELD: u32 = 0xfff;

/// How long to wait for push-buffer room before complaining.
pub const DMA_ROOM_TIMEOUT_USEC: u64 = 2_000_000;

/// How long to wait for a channel to drain before forcing acceleration.
pub const CHANNEL_IDLE_TIMEOUT_USEC: u64 = 2_000_000;

/// Encode a method header dword.
pub fn method_header(offset: u32, count: u32) -> u32 {
    debug_assert_eq!(offset % 4, 0);
    debug_assert!(offset <= METHOD_OFFSET_FIELD);
    debug_assert!(count <= METHOD_COUNT_MAX);
    OPCODE_METHOD | (count << METHOD_COUNT_SHIFT) | (offset & METHOD_OFFSET_FIELD)
}

/// Per-subdevice GET/PUT register access for one channel.
pub trait ChannelIo: Send + Sync {
    /// Read the hardware GET offset in bytes.
    fn read_get(&self, sd: u32) -> u32;

    /// Publish a new PUT offset in bytes.
    fn write_put(&self, sd: u32, put_offset: u32);
}

/// Flip-related capabilities reported for a channel's hardware class.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelCaps {
    pub valid_timestamp_bits: u8,
    pub tearing_flips: bool,
    pub vrr_tearing_flips: bool,
    pub per_eye_stereo_flips: bool,
}

/// Construction parameters for a channel.
pub struct ChannelDesc {
    pub hwclass: u32,
    pub instance: u32,
    pub mask: ChannelMask,
    pub handle: RmHandle,
    /// Ring size in dwords, including the slot kept free for the jump.
    pub ring_dwords: usize,
    pub num_subdevices: u32,
    /// Mirror the ring into framebuffer memory on kickoff instead of
    /// letting the hardware fetch it from system memory.
    pub fb_mirrored: bool,
    pub caps: ChannelCaps,
}

struct DmaBuffer {
    buf: Vec<u32>,
    /// Write cursor, in dwords from the ring start.
    cursor: usize,
    /// Ring size in bytes; GET/PUT live in `[0, offset_max)`.
    offset_max: u32,
    /// Last published PUT, in bytes.
    put_offset: u32,
    /// Cached free-space estimate, in dwords. Never optimistic.
    fifo_free_count: u32,
    /// Mask last emitted into the ring.
    current_mask: SubDevMask,
    /// Mask requested for subsequent methods.
    pending_mask: SubDevMask,
    /// Per-subdevice framebuffer mirrors, empty for sysmem rings.
    fb_mirrors: Vec<Arc<DmaMemory>>,
}

/// A display channel: a method ring plus per-subdevice flow control.
pub struct EvoChannel {
    pub hwclass: u32,
    pub instance: u32,
    pub mask: ChannelMask,
    pub handle: RmHandle,
    pub caps: ChannelCaps,
    num_subdevices: u32,
    timeout_scale: u32,
    pb: DmaBuffer,
    io: Arc<dyn ChannelIo>,
    rm: Arc<dyn ResourceManager>,
    host: Arc<dyn HostOps>,
}

impl EvoChannel {
    pub fn new(
        desc: ChannelDesc,
        io: Arc<dyn ChannelIo>,
        rm: Arc<dyn ResourceManager>,
        host: Arc<dyn HostOps>,
        timeout_scale: u32,
    ) -> Self {
        debug_assert!(desc.ring_dwords >= 8);
        debug_assert!(desc.num_subdevices >= 1);

        let fb_mirrors = if desc.fb_mirrored {
            (0..desc.num_subdevices)
                .map(|_| DmaMemory::new(desc.ring_dwords))
                .collect()
        } else {
            Vec::new()
        };
        let all = SubDevMask::all(desc.num_subdevices);

        Self {
            hwclass: desc.hwclass,
            instance: desc.instance,
            mask: desc.mask,
            handle: desc.handle,
            caps: desc.caps,
            num_subdevices: desc.num_subdevices,
            timeout_scale,
            pb: DmaBuffer {
                buf: vec![0; desc.ring_dwords],
                cursor: 0,
                offset_max: (desc.ring_dwords * 4) as u32,
                put_offset: 0,
                fifo_free_count: desc.ring_dwords as u32 - 1,
                current_mask: all,
                pending_mask: all,
                fb_mirrors,
            },
            io,
            rm,
            host,
        }
    }

    pub fn num_subdevices(&self) -> u32 {
        self.num_subdevices
    }

    /// Current write cursor, in bytes.
    pub fn cursor_offset(&self) -> u32 {
        (self.pb.cursor * 4) as u32
    }

    /// Last published PUT, in bytes.
    pub fn put_offset(&self) -> u32 {
        self.pb.put_offset
    }

    /// Cached free-space estimate, in dwords.
    pub fn free_count(&self) -> u32 {
        self.pb.fifo_free_count
    }

    /// Raw ring contents, for completion inspection.
    pub fn dword_at(&self, index: usize) -> u32 {
        self.pb.buf[index]
    }

    /// Route subsequent methods to `mask`. The set-subdevice-mask
    /// pseudo-method is only emitted if the next method actually needs a
    /// different mask than the last one written.
    pub fn set_subdevice_mask(&mut self, mask: SubDevMask) {
        debug_assert!(!mask.is_empty());
        self.pb.pending_mask = mask;
    }

    pub fn subdevice_mask(&self) -> SubDevMask {
        self.pb.pending_mask
    }

    /// Append one method (header plus data dwords), reserving room and
    /// emitting a subdevice-mask switch first if one is pending.
    pub fn method(&mut self, offset: u32, data: &[u32]) {
        let count = data.len() as u32;
        let mask_dword = u32::from(self.pb.pending_mask != self.pb.current_mask);

        self.reserve(count + mask_dword);

        if mask_dword != 0 {
            let mask = self.pb.pending_mask;
            self.push_raw(OPCODE_SET_SUBDEVICE_MASK | (mask.0 & SUBDEVICE_MASK_FIELD));
            self.pb.current_mask = mask;
        }
        self.push_raw(method_header(offset, count));
        for &dword in data {
            self.push_raw(dword);
        }
    }

    pub fn method_one(&mut self, offset: u32, value: u32) {
        self.method(offset, &[value]);
    }

    /// Guarantee room for a method of `method_count` data dwords (plus
    /// its header). May kick off, wrap the ring, and poll hardware GET.
    pub fn reserve(&mut self, method_count: u32) {
        if self.pb.fifo_free_count > method_count {
            return;
        }
        self.make_room(method_count);
    }

    fn push_raw(&mut self, dword: u32) {
        debug_assert!(self.pb.fifo_free_count > 0);
        self.pb.buf[self.pb.cursor] = dword;
        self.pb.cursor += 1;
        self.pb.fifo_free_count -= 1;
    }

    fn make_room(&mut self, method_count: u32) {
        // Publish pending methods so the hardware can drain them while we
        // wait for room.
        self.kickoff();

        let needed = method_count + 1;
        let needed_bytes = needed * 4;
        let timeout = DMA_ROOM_TIMEOUT_USEC * u64::from(self.timeout_scale);
        let mut wait_start = self.host.get_usec();

        loop {
            let put = self.pb.put_offset;
            let tail_dwords = (self.pb.offset_max - put) / 4;

            if tail_dwords <= needed {
                // The request doesn't fit before the wrap point. The jump
                // can only be written once no subdevice is still fetching
                // from the start of the ring.
                if self.safe_to_wrap(put, needed_bytes) {
                    self.wrap();
                    continue;
                }
            } else {
                let free = self.conservative_free(put);
                if free > method_count {
                    self.pb.fifo_free_count = free;
                    return;
                }
            }

            self.host.yield_now();

            let now = self.host.get_usec();
            if now.saturating_sub(wait_start) > timeout {
                log::error!(
                    "channel {:#x}.{}: no push buffer room after {} us, still waiting",
                    self.hwclass,
                    self.instance,
                    now - wait_start
                );
                wait_start = now;
            }
        }
    }

    /// Free dwords between PUT and one subdevice's GET, wrap-corrected
    /// and always at least one dword short of catching GET.
    fn usable_free_dwords(put: u32, get: u32, offset_max: u32) -> u32 {
        if get > put {
            (get - put) / 4 - 1
        } else {
            // Free space runs to the wrap point; the final slot is kept
            // for the jump sentinel.
            (offset_max - put) / 4 - 1
        }
    }

    /// Most conservative free-space estimate across all subdevices.
    fn conservative_free(&self, put: u32) -> u32 {
        let mut free = u32::MAX;
        for sd in 0..self.num_subdevices {
            let get = self.io.read_get(sd);
            free = free.min(Self::usable_free_dwords(put, get, self.pb.offset_max));
        }
        free
    }

    fn safe_to_wrap(&self, put: u32, needed_bytes: u32) -> bool {
        for sd in 0..self.num_subdevices {
            let get = self.io.read_get(sd);
            // Wrapping overwrites [0, needed_bytes); every GET must be
            // past that region on the current lap, or exactly caught up.
            let clear = get <= put && (get == put || get >= needed_bytes + 4);
            if !clear {
                return false;
            }
        }
        true
    }

    fn wrap(&mut self) {
        debug_assert_eq!(self.cursor_offset(), self.pb.put_offset);

        let jump_at = self.pb.cursor;
        self.pb.buf[jump_at] = OPCODE_JUMP;

        fence(Ordering::SeqCst);
        self.publish_span(jump_at, jump_at + 1);
        for sd in 0..self.num_subdevices {
            self.io.write_put(sd, 0);
        }

        self.pb.cursor = 0;
        self.pb.put_offset = 0;
        self.pb.fifo_free_count = 0;
    }

    /// Publish the write cursor as the new PUT on every subdevice.
    /// No-op when nothing was written since the last kickoff.
    pub fn kickoff(&mut self) {
        let cursor = self.cursor_offset();
        if cursor == self.pb.put_offset {
            return;
        }
        debug_assert!(cursor > self.pb.put_offset);

        // Order the ring stores ahead of the PUT write.
        fence(Ordering::SeqCst);
        self.publish_span((self.pb.put_offset / 4) as usize, self.pb.cursor);

        for sd in 0..self.num_subdevices {
            self.io.write_put(sd, cursor);
        }
        self.pb.put_offset = cursor;
    }

    /// Copy a newly written span into each subdevice's framebuffer
    /// mirror and flush, for configurations where the hardware fetches
    /// the ring from framebuffer memory.
    fn publish_span(&self, start_dword: usize, end_dword: usize) {
        if self.pb.fb_mirrors.is_empty() {
            return;
        }
        let span = &self.pb.buf[start_dword..end_dword];
        for (sd, mirror) in self.pb.fb_mirrors.iter().enumerate() {
            mirror.write_span(start_dword, span);
            let status = self.rm.flush_framebuffer(sd as u32);
            if !status.is_success() {
                log::error!(
                    "channel {:#x}.{}: framebuffer flush failed on sd {}: {}",
                    self.hwclass,
                    self.instance,
                    sd,
                    status
                );
            }
        }
    }

    #[cfg(test)]
    fn fb_mirror(&self, sd: usize) -> &Arc<DmaMemory> {
        &self.pb.fb_mirrors[sd]
    }

    /// True when every subdevice has consumed everything published.
    pub fn is_idle(&self) -> bool {
        let put = self.pb.put_offset;
        self.cursor_offset() == put
            && (0..self.num_subdevices).all(|sd| self.io.read_get(sd) == put)
    }

    /// Smallest per-subdevice GET; used by notifier waits to decide
    /// whether the channel has stalled.
    pub fn min_get(&self) -> u32 {
        (0..self.num_subdevices)
            .map(|sd| self.io.read_get(sd))
            .min()
            .unwrap_or(0)
    }

    /// Kick off pending methods and wait for the hardware to drain the
    /// channel. If the channel stalls, request acceleration from the
    /// resource manager and wait again; a channel that is still stuck
    /// afterwards is reported and abandoned (degraded mode), never
    /// propagated as a failure.
    pub fn wait_idle(&mut self) -> bool {
        self.kickoff();

        let timeout = CHANNEL_IDLE_TIMEOUT_USEC * u64::from(self.timeout_scale);
        if self.poll_idle(timeout) {
            return true;
        }

        log::warn!(
            "channel {:#x}.{}: stalled, forcing acceleration",
            self.hwclass,
            self.instance
        );
        let status = self.rm.accelerate_channel(self.handle);
        if !status.is_success() {
            log::error!(
                "channel {:#x}.{}: acceleration request failed: {}",
                self.hwclass,
                self.instance,
                status
            );
        }

        if self.poll_idle(timeout) {
            return true;
        }
        log::error!(
            "channel {:#x}.{}: stuck after forced acceleration",
            self.hwclass,
            self.instance
        );
        false
    }

    fn poll_idle(&self, timeout: u64) -> bool {
        let start = self.host.get_usec();
        loop {
            if self.is_idle() {
                return true;
            }
            self.host.yield_now();
            if self.host.get_usec().saturating_sub(start) > timeout {
                return false;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::rm::{ImpRequest, RmStatus};
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};

    pub(crate) struct MockIo {
        get: Vec<AtomicU32>,
        last_put: Vec<AtomicU32>,
        /// When set, reads of GET report the channel fully drained.
        pub auto_drain: AtomicBool,
        pub put_writes: AtomicU32,
    }

    impl MockIo {
        pub fn new(num_subdevices: u32) -> Arc<Self> {
            Arc::new(Self {
                get: (0..num_subdevices).map(|_| AtomicU32::new(0)).collect(),
                last_put: (0..num_subdevices).map(|_| AtomicU32::new(0)).collect(),
                auto_drain: AtomicBool::new(true),
                put_writes: AtomicU32::new(0),
            })
        }

        pub fn set_get(&self, sd: u32, value: u32) {
            self.get[sd as usize].store(value, Ordering::Relaxed);
        }
    }

    impl ChannelIo for MockIo {
        fn read_get(&self, sd: u32) -> u32 {
            if self.auto_drain.load(Ordering::Relaxed) {
                self.last_put[sd as usize].load(Ordering::Relaxed)
            } else {
                self.get[sd as usize].load(Ordering::Relaxed)
            }
        }

        fn write_put(&self, sd: u32, put_offset: u32) {
            self.put_writes.fetch_add(1, Ordering::Relaxed);
            self.last_put[sd as usize].store(put_offset, Ordering::Relaxed);
        }
    }

    pub(crate) struct MockRm {
        pub accelerations: AtomicU32,
        pub fb_flushes: AtomicU32,
    }

    impl MockRm {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                accelerations: AtomicU32::new(0),
                fb_flushes: AtomicU32::new(0),
            })
        }
    }

    impl ResourceManager for MockRm {
        fn alloc_display_channel(&self, _handle: RmHandle, _hwclass: u32, _instance: u32) -> RmStatus {
            RmStatus::Success
        }
        fn alloc_memory(&self, _handle: RmHandle, _size: u64) -> RmStatus {
            RmStatus::Success
        }
        fn dup_memory(&self, _handle: RmHandle, _src: RmHandle) -> RmStatus {
            RmStatus::Success
        }
        fn free(&self, _handle: RmHandle) -> RmStatus {
            RmStatus::Success
        }
        fn flush_framebuffer(&self, _sd: u32) -> RmStatus {
            self.fb_flushes.fetch_add(1, Ordering::Relaxed);
            RmStatus::Success
        }
        fn accelerate_channel(&self, _channel: RmHandle) -> RmStatus {
            self.accelerations.fetch_add(1, Ordering::Relaxed);
            RmStatus::Success
        }
        fn validate_imp(&self, _req: &ImpRequest) -> RmStatus {
            RmStatus::Success
        }
    }

    /// Virtual clock advancing a fixed step per query, so timeout paths
    /// run instantly in tests.
    pub(crate) struct MockHost {
        usec: AtomicU64,
        step: u64,
    }

    impl MockHost {
        pub fn new(step: u64) -> Arc<Self> {
            Arc::new(Self {
                usec: AtomicU64::new(0),
                step,
            })
        }
    }

    impl HostOps for MockHost {
        fn get_usec(&self) -> u64 {
            self.usec.fetch_add(self.step, Ordering::Relaxed)
        }
        fn yield_now(&self) {}
    }

    fn test_channel(ring_dwords: usize, num_subdevices: u32, io: Arc<MockIo>) -> EvoChannel {
        EvoChannel::new(
            ChannelDesc {
                hwclass: 0xc37d,
                instance: 0,
                mask: ChannelMask::CORE,
                handle: RmHandle(0x100),
                ring_dwords,
                num_subdevices,
                fb_mirrored: false,
                caps: ChannelCaps::default(),
            },
            io,
            MockRm::new(),
            MockHost::new(1),
            1,
        )
    }

    #[test]
    fn test_method_header_encoding() {
        let header = method_header(0x80, 2);
        assert_eq!(header >> 29, 0);
        assert_eq!((header >> 18) & 0x3ff, 2);
        assert_eq!(header & 0xfffc, 0x80);
    }

    #[test]
    fn test_method_write_and_kickoff() {
        let io = MockIo::new(2);
        let mut ch = test_channel(64, 2, io.clone());

        ch.method(0x400, &[1, 2]);
        assert_eq!(ch.cursor_offset(), 12);
        assert_eq!(ch.put_offset(), 0);

        ch.kickoff();
        assert_eq!(ch.put_offset(), 12);
        assert_eq!(io.put_writes.load(Ordering::Relaxed), 2);
        assert_eq!(ch.dword_at(0), method_header(0x400, 2));
        assert_eq!(ch.dword_at(1), 1);
        assert_eq!(ch.dword_at(2), 2);

        // PUT unchanged: kickoff is a no-op.
        ch.kickoff();
        assert_eq!(io.put_writes.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_put_always_dword_aligned_and_in_range() {
        let io = MockIo::new(1);
        let mut ch = test_channel(32, 1, io);

        for i in 0..40 {
            ch.method(0x80, &[i, i + 1]);
            ch.kickoff();
            assert_eq!(ch.put_offset() % 4, 0);
            assert!(ch.put_offset() <= 32 * 4);
        }
    }

    #[test]
    fn test_reserve_kicks_off_and_waits_for_room() {
        let io = MockIo::new(1);
        let mut ch = test_channel(16, 1, io.clone());

        // Fill most of the ring without letting the hardware drain.
        io.auto_drain.store(false, Ordering::Relaxed);
        ch.method(0x80, &[0; 10]);
        assert_eq!(ch.free_count(), 4);

        // The next method doesn't fit; hardware drains as soon as the
        // engine re-reads GET.
        io.auto_drain.store(true, Ordering::Relaxed);
        ch.method(0x80, &[0; 10]);

        // The engine kicked off the backlog, wrapped, and wrote the new
        // method at the ring start.
        assert_eq!(ch.dword_at(11), OPCODE_JUMP);
        assert_eq!(ch.dword_at(0), method_header(0x80, 10));
        assert_eq!(ch.cursor_offset(), 44);
        assert_eq!(ch.put_offset(), 0);
        assert_eq!(ch.free_count(), 4);
    }

    #[test]
    fn test_free_count_never_optimistic() {
        // GET ahead of PUT: stop one dword short.
        assert_eq!(EvoChannel::usable_free_dwords(0, 40, 256), 9);
        // GET behind PUT: only the tail counts, minus the jump slot.
        assert_eq!(EvoChannel::usable_free_dwords(200, 100, 256), 13);
        // Drained ring: full tail minus the jump slot.
        assert_eq!(EvoChannel::usable_free_dwords(0, 0, 256), 63);
    }

    #[test]
    fn test_subdevice_mask_emitted_lazily() {
        let io = MockIo::new(2);
        let mut ch = test_channel(64, 2, io);

        // Default mask covers all subdevices; no pseudo-method needed.
        ch.method_one(0x80, 7);
        assert_eq!(ch.dword_at(0), method_header(0x80, 1));

        ch.set_subdevice_mask(SubDevMask::single(1));
        ch.method_one(0x84, 8);
        assert_eq!(ch.dword_at(2), OPCODE_SET_SUBDEVICE_MASK | 0x2);
        assert_eq!(ch.dword_at(3), method_header(0x84, 1));

        // Same mask again: no second pseudo-method.
        ch.method_one(0x88, 9);
        assert_eq!(ch.dword_at(5), method_header(0x88, 1));
    }

    #[test]
    fn test_wait_idle_accelerates_stuck_channel() {
        let io = MockIo::new(1);
        let rm = MockRm::new();
        let mut ch = EvoChannel::new(
            ChannelDesc {
                hwclass: 0x917d,
                instance: 0,
                mask: ChannelMask::CORE,
                handle: RmHandle(0x101),
                ring_dwords: 64,
                num_subdevices: 1,
                fb_mirrored: false,
                caps: ChannelCaps::default(),
            },
            io.clone(),
            rm.clone(),
            MockHost::new(10_000),
            1,
        );

        io.auto_drain.store(false, Ordering::Relaxed);
        ch.method_one(0x80, 1);

        assert!(!ch.wait_idle());
        assert_eq!(rm.accelerations.load(Ordering::Relaxed), 1);

        // Hardware finally catches up.
        io.set_get(0, ch.put_offset());
        assert!(ch.wait_idle());
    }

    #[test]
    fn test_fb_mirror_copied_and_flushed_on_kickoff() {
        let io = MockIo::new(2);
        let rm = MockRm::new();
        let mut ch = EvoChannel::new(
            ChannelDesc {
                hwclass: 0x917d,
                instance: 1,
                mask: ChannelMask::base(0),
                handle: RmHandle(0x102),
                ring_dwords: 32,
                num_subdevices: 2,
                fb_mirrored: true,
                caps: ChannelCaps::default(),
            },
            io,
            rm.clone(),
            MockHost::new(1),
            1,
        );

        ch.method(0x400, &[0xaa, 0xbb]);
        ch.kickoff();

        for sd in 0..2 {
            let mirror = ch.fb_mirror(sd);
            assert_eq!(mirror.read(0), method_header(0x400, 2));
            assert_eq!(mirror.read(1), 0xaa);
            assert_eq!(mirror.read(2), 0xbb);
        }
        assert_eq!(rm.fb_flushes.load(Ordering::Relaxed), 2);
    }
}
