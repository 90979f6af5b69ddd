//! Typed access to the engine's linear memory.

use crate::engine::{Engine, Ptr};
use crate::error::SqlBridgeError;

const READ_CHUNK: usize = 64;

/// Allocates, encodes and decodes values in linear memory.
///
/// Everything read out of linear memory is copied into an owned buffer: the engine may
/// reuse or move a region as soon as the call that produced its address returns.
#[derive(Clone, Copy)]
pub struct MemoryBridge<'a> {
    engine: &'a dyn Engine,
}

impl<'a> MemoryBridge<'a> {
    #[must_use]
    pub fn new(engine: &'a dyn Engine) -> Self {
        Self { engine }
    }

    /// # Errors
    /// Returns [`SqlBridgeError::OutOfMemory`] when the heap is exhausted.
    pub fn allocate(&self, size: usize) -> Result<Ptr, SqlBridgeError> {
        let requested = u32::try_from(size).map_err(|_| SqlBridgeError::OutOfMemory {
            requested: size,
        })?;
        match self.engine.malloc(requested.max(1)) {
            0 => Err(SqlBridgeError::OutOfMemory { requested: size }),
            ptr => Ok(ptr),
        }
    }

    pub fn free(&self, ptr: Ptr) {
        if ptr != 0 {
            self.engine.free(ptr);
        }
    }

    /// Encode `text` as NUL-terminated UTF-8. Returns the address and the byte length
    /// including the terminator.
    ///
    /// # Errors
    /// Returns [`SqlBridgeError::OutOfMemory`] when the heap is exhausted; nothing stays
    /// allocated in that case.
    pub fn write_utf8(&self, text: &str) -> Result<(Ptr, usize), SqlBridgeError> {
        let len = text.len() + 1;
        let ptr = self.allocate(len)?;
        let mut bytes = Vec::with_capacity(len);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        if let Err(err) = self.store(ptr, &bytes) {
            self.free(ptr);
            return Err(err);
        }
        Ok((ptr, len))
    }

    /// Decode NUL-terminated UTF-8 starting at `ptr`. A null address reads as `""`;
    /// invalid sequences are replaced.
    ///
    /// # Errors
    /// Returns [`SqlBridgeError::MemoryAccess`] if no terminator is found before the end
    /// of linear memory.
    pub fn read_utf8(&self, ptr: Ptr) -> Result<String, SqlBridgeError> {
        if ptr == 0 {
            return Ok(String::new());
        }
        let bytes = self.read_c_bytes(ptr)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn read_c_bytes(&self, ptr: Ptr) -> Result<Vec<u8>, SqlBridgeError> {
        let size = self.engine.memory_size();
        let mut out = Vec::new();
        let mut cursor = ptr as usize;
        loop {
            let end = (cursor + READ_CHUNK).min(size);
            if cursor >= end {
                return Err(SqlBridgeError::MemoryAccess {
                    address: ptr,
                    len: out.len() + 1,
                });
            }
            let mut chunk = vec![0u8; end - cursor];
            #[allow(clippy::cast_possible_truncation)]
            self.load(cursor as Ptr, &mut chunk)?;
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
            cursor = end;
        }
    }

    /// Copy `bytes` verbatim, without terminator. An empty blob still gets a (1 byte)
    /// region so the address is never null.
    ///
    /// # Errors
    /// Returns [`SqlBridgeError::OutOfMemory`] when the heap is exhausted.
    pub fn write_blob(&self, bytes: &[u8]) -> Result<Ptr, SqlBridgeError> {
        let ptr = self.allocate(bytes.len())?;
        if let Err(err) = self.store(ptr, bytes) {
            self.free(ptr);
            return Err(err);
        }
        Ok(ptr)
    }

    /// # Errors
    /// Returns [`SqlBridgeError::MemoryAccess`] if the range leaves linear memory.
    pub fn read_blob(&self, ptr: Ptr, len: usize) -> Result<Vec<u8>, SqlBridgeError> {
        let mut out = vec![0u8; len];
        if len > 0 {
            self.load(ptr, &mut out)?;
        }
        Ok(out)
    }

    /// # Errors
    /// Returns [`SqlBridgeError::MemoryAccess`] if the address is out of bounds.
    pub fn read_u8(&self, ptr: Ptr) -> Result<u8, SqlBridgeError> {
        Ok(self.read_array::<1>(ptr)?[0])
    }

    /// # Errors
    /// Returns [`SqlBridgeError::MemoryAccess`] if the address is out of bounds.
    pub fn read_i32(&self, ptr: Ptr) -> Result<i32, SqlBridgeError> {
        Ok(i32::from_le_bytes(self.read_array(ptr)?))
    }

    /// # Errors
    /// Returns [`SqlBridgeError::MemoryAccess`] if the address is out of bounds.
    pub fn read_u32(&self, ptr: Ptr) -> Result<u32, SqlBridgeError> {
        Ok(u32::from_le_bytes(self.read_array(ptr)?))
    }

    /// # Errors
    /// Returns [`SqlBridgeError::MemoryAccess`] if the address is out of bounds.
    pub fn read_i64(&self, ptr: Ptr) -> Result<i64, SqlBridgeError> {
        Ok(i64::from_le_bytes(self.read_array(ptr)?))
    }

    /// # Errors
    /// Returns [`SqlBridgeError::MemoryAccess`] if the address is out of bounds.
    pub fn read_f64(&self, ptr: Ptr) -> Result<f64, SqlBridgeError> {
        Ok(f64::from_le_bytes(self.read_array(ptr)?))
    }

    /// # Errors
    /// Returns [`SqlBridgeError::MemoryAccess`] if the address is out of bounds.
    pub fn write_i32(&self, ptr: Ptr, value: i32) -> Result<(), SqlBridgeError> {
        self.store(ptr, &value.to_le_bytes())
    }

    /// # Errors
    /// Returns [`SqlBridgeError::MemoryAccess`] if the address is out of bounds.
    pub fn write_u32(&self, ptr: Ptr, value: u32) -> Result<(), SqlBridgeError> {
        self.store(ptr, &value.to_le_bytes())
    }

    /// # Errors
    /// Returns [`SqlBridgeError::MemoryAccess`] if the address is out of bounds.
    pub fn write_i64(&self, ptr: Ptr, value: i64) -> Result<(), SqlBridgeError> {
        self.store(ptr, &value.to_le_bytes())
    }

    /// # Errors
    /// Returns [`SqlBridgeError::MemoryAccess`] if the address is out of bounds.
    pub fn write_f64(&self, ptr: Ptr, value: f64) -> Result<(), SqlBridgeError> {
        self.store(ptr, &value.to_le_bytes())
    }

    /// Start a group of allocations released together when the guard drops.
    #[must_use]
    pub fn scoped(self) -> ScopedAllocations<'a> {
        ScopedAllocations {
            bridge: self,
            ptrs: Vec::new(),
        }
    }

    fn read_array<const N: usize>(&self, ptr: Ptr) -> Result<[u8; N], SqlBridgeError> {
        let mut buf = [0u8; N];
        self.load(ptr, &mut buf)?;
        Ok(buf)
    }

    fn load(&self, ptr: Ptr, buf: &mut [u8]) -> Result<(), SqlBridgeError> {
        if ptr == 0 || !self.engine.read_memory(ptr, buf) {
            return Err(SqlBridgeError::MemoryAccess {
                address: ptr,
                len: buf.len(),
            });
        }
        Ok(())
    }

    fn store(&self, ptr: Ptr, bytes: &[u8]) -> Result<(), SqlBridgeError> {
        if ptr == 0 || !self.engine.write_memory(ptr, bytes) {
            return Err(SqlBridgeError::MemoryAccess {
                address: ptr,
                len: bytes.len(),
            });
        }
        Ok(())
    }
}

/// Allocations made for one call, freed together on drop unless handed over with
/// [`ScopedAllocations::into_ptrs`].
pub struct ScopedAllocations<'a> {
    bridge: MemoryBridge<'a>,
    ptrs: Vec<Ptr>,
}

impl ScopedAllocations<'_> {
    /// # Errors
    /// Returns [`SqlBridgeError::OutOfMemory`] when the heap is exhausted.
    pub fn allocate(&mut self, size: usize) -> Result<Ptr, SqlBridgeError> {
        let ptr = self.bridge.allocate(size)?;
        self.ptrs.push(ptr);
        Ok(ptr)
    }

    /// # Errors
    /// See [`MemoryBridge::write_utf8`].
    pub fn write_utf8(&mut self, text: &str) -> Result<(Ptr, usize), SqlBridgeError> {
        let (ptr, len) = self.bridge.write_utf8(text)?;
        self.ptrs.push(ptr);
        Ok((ptr, len))
    }

    /// # Errors
    /// See [`MemoryBridge::write_blob`].
    pub fn write_blob(&mut self, bytes: &[u8]) -> Result<Ptr, SqlBridgeError> {
        let ptr = self.bridge.write_blob(bytes)?;
        self.ptrs.push(ptr);
        Ok(ptr)
    }

    #[must_use]
    pub fn bridge(&self) -> MemoryBridge<'_> {
        self.bridge
    }

    /// Release ownership of every allocation to the caller.
    #[must_use]
    pub fn into_ptrs(mut self) -> Vec<Ptr> {
        std::mem::take(&mut self.ptrs)
    }
}

impl Drop for ScopedAllocations<'_> {
    fn drop(&mut self) {
        for ptr in self.ptrs.drain(..) {
            self.bridge.free(ptr);
        }
    }
}
