//! CPU-visible DMA memory
//!
//! Notifiers, semaphores and push-buffer mirrors are dword-addressed
//! memory written by one side (CPU or display controller) and polled by
//! the other. [`DmaMemory`] models such an aperture: interior-locked so a
//! hardware model (or the real interrupt path) can write concurrently
//! with the polling reader.

use std::sync::Arc;

/// A dword-addressed memory aperture shared with the display controller.
pub struct DmaMemory {
    words: spin::Mutex<Vec<u32>>,
}

impl DmaMemory {
    /// Allocate a zeroed aperture of `len` dwords.
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            words: spin::Mutex::new(vec![0; len]),
        })
    }

    pub fn len(&self) -> usize {
        self.words.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read one dword. Out-of-range reads return 0, matching the
    /// behavior of reads through a too-small mapping window.
    pub fn read(&self, word: usize) -> u32 {
        self.words.lock().get(word).copied().unwrap_or(0)
    }

    /// Write one dword. Out-of-range writes are dropped.
    pub fn write(&self, word: usize, value: u32) {
        if let Some(slot) = self.words.lock().get_mut(word) {
            *slot = value;
        }
    }

    /// Copy a span of dwords into the aperture starting at `word`.
    pub fn write_span(&self, word: usize, data: &[u32]) {
        let mut words = self.words.lock();
        for (i, &value) in data.iter().enumerate() {
            if let Some(slot) = words.get_mut(word + i) {
                *slot = value;
            }
        }
    }

    pub fn fill(&self, value: u32) {
        for slot in self.words.lock().iter_mut() {
            *slot = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write() {
        let mem = DmaMemory::new(8);
        mem.write(3, 0xdead_beef);
        assert_eq!(mem.read(3), 0xdead_beef);
        assert_eq!(mem.read(4), 0);
    }

    #[test]
    fn test_out_of_range_access_is_benign() {
        let mem = DmaMemory::new(2);
        mem.write(7, 1);
        assert_eq!(mem.read(7), 0);
    }

    #[test]
    fn test_write_span_clips() {
        let mem = DmaMemory::new(4);
        mem.write_span(2, &[1, 2, 3]);
        assert_eq!(mem.read(2), 1);
        assert_eq!(mem.read(3), 2);
    }
}
