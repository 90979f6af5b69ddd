use std::collections::BTreeMap;

pub const PAGE_SIZE: usize = 64 * 1024;
const ALIGN: u32 = 8;

/// Emulated linear memory with a first-fit free-list allocator.
///
/// The first `ALIGN` bytes are never handed out so that address 0 stays null.
pub(crate) struct LinearHeap {
    memory: Vec<u8>,
    max_size: usize,
    live: BTreeMap<u32, u32>,
    free: BTreeMap<u32, u32>,
}

impl LinearHeap {
    pub(crate) fn new(max_size: usize) -> Self {
        let initial = PAGE_SIZE.min(max_size.max(PAGE_SIZE));
        let mut free = BTreeMap::new();
        #[allow(clippy::cast_possible_truncation)]
        free.insert(ALIGN, initial as u32 - ALIGN);
        Self {
            memory: vec![0; initial],
            max_size,
            live: BTreeMap::new(),
            free,
        }
    }

    /// Returns 0 when the request cannot be satisfied within the memory ceiling.
    pub(crate) fn malloc(&mut self, size: u32) -> u32 {
        let Some(size) = size.max(1).checked_next_multiple_of(ALIGN) else {
            return 0;
        };
        loop {
            let found = self
                .free
                .iter()
                .find(|&(_, &len)| len >= size)
                .map(|(&addr, &len)| (addr, len));
            if let Some((addr, len)) = found {
                self.free.remove(&addr);
                if len > size {
                    self.free.insert(addr + size, len - size);
                }
                self.live.insert(addr, size);
                return addr;
            }
            if !self.grow(size) {
                return 0;
            }
        }
    }

    /// Freeing null or an address that is not live is a no-op.
    pub(crate) fn free(&mut self, addr: u32) {
        if let Some(size) = self.live.remove(&addr) {
            self.release(addr, size);
        }
    }

    pub(crate) fn read(&self, addr: u32, buf: &mut [u8]) -> bool {
        match self.range(addr, buf.len()) {
            Some(range) => {
                buf.copy_from_slice(&self.memory[range]);
                true
            }
            None => false,
        }
    }

    pub(crate) fn write(&mut self, addr: u32, bytes: &[u8]) -> bool {
        match self.range(addr, bytes.len()) {
            Some(range) => {
                self.memory[range].copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Bytes from `addr` up to (not including) the next NUL.
    pub(crate) fn c_bytes(&self, addr: u32) -> Option<Vec<u8>> {
        let tail = self.memory.get(addr as usize..)?;
        let nul = tail.iter().position(|&b| b == 0)?;
        Some(tail[..nul].to_vec())
    }

    pub(crate) fn bytes(&self, addr: u32, len: usize) -> Option<Vec<u8>> {
        self.range(addr, len).map(|range| self.memory[range].to_vec())
    }

    pub(crate) fn size(&self) -> usize {
        self.memory.len()
    }

    /// Bytes currently handed out, including alignment padding.
    pub(crate) fn allocated(&self) -> usize {
        self.live.values().map(|&len| len as usize).sum()
    }

    fn range(&self, addr: u32, len: usize) -> Option<std::ops::Range<usize>> {
        let start = addr as usize;
        let end = start.checked_add(len)?;
        (end <= self.memory.len()).then_some(start..end)
    }

    fn grow(&mut self, needed: u32) -> bool {
        let current = self.memory.len();
        let pages = (needed as usize).div_ceil(PAGE_SIZE).max(1);
        let new_len = current + pages * PAGE_SIZE;
        if new_len > self.max_size || new_len > u32::MAX as usize {
            return false;
        }
        self.memory.resize(new_len, 0);
        #[allow(clippy::cast_possible_truncation)]
        self.release(current as u32, (new_len - current) as u32);
        true
    }

    fn release(&mut self, addr: u32, size: u32) {
        let mut start = addr;
        let mut len = size;
        let before = self
            .free
            .range(..addr)
            .next_back()
            .map(|(&prev, &prev_len)| (prev, prev_len));
        if let Some((prev, prev_len)) = before
            && prev + prev_len == addr
        {
            self.free.remove(&prev);
            start = prev;
            len += prev_len;
        }
        if let Some(next_len) = self.free.remove(&(addr + size)) {
            len += next_len;
        }
        self.free.insert(start, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_never_returned() {
        let mut heap = LinearHeap::new(4 * PAGE_SIZE);
        let first = heap.malloc(1);
        assert_ne!(first, 0);
        assert_eq!(first % ALIGN, 0);
    }

    #[test]
    fn freed_blocks_coalesce_and_are_reused() {
        let mut heap = LinearHeap::new(4 * PAGE_SIZE);
        let a = heap.malloc(16);
        let b = heap.malloc(16);
        let c = heap.malloc(16);
        heap.free(a);
        heap.free(b);
        assert_eq!(heap.malloc(32), a);
        heap.free(c);
        assert_eq!(heap.allocated(), 32);
    }

    #[test]
    fn grows_until_the_ceiling() {
        let mut heap = LinearHeap::new(2 * PAGE_SIZE);
        let big = heap.malloc(u32::try_from(PAGE_SIZE).unwrap());
        assert_ne!(big, 0);
        assert_eq!(heap.size(), 2 * PAGE_SIZE);
        assert_eq!(heap.malloc(u32::try_from(PAGE_SIZE).unwrap()), 0);
        heap.free(big);
        assert_eq!(heap.allocated(), 0);
    }

    #[test]
    fn out_of_bounds_access_is_refused() {
        let mut heap = LinearHeap::new(PAGE_SIZE);
        let mut buf = [0u8; 4];
        assert!(!heap.read(u32::try_from(PAGE_SIZE).unwrap() - 2, &mut buf));
        let ptr = heap.malloc(4);
        assert!(heap.write(ptr, &[1, 2, 3, 4]));
        assert!(heap.read(ptr, &mut buf));
        assert_eq!(buf, [1, 2, 3, 4]);
    }
}
