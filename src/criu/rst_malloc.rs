//! On restore we need different types of memory allocation.
//!
//! Objects are kept one-by-one in a plain linear buffer per type and are
//! addressed by their offset in it, so a buffer may grow without
//! invalidating what was handed out before. Only the last object of a
//! buffer can be freed.

use crate::error::{CrError, Result};

const RST_MEM_ALIGN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum RstMemType {
    /// Objects used by any restored process, allocated in global context.
    Shared = 0,
    /// Shared objects that are later handed to the restorer.
    Shremap = 1,
    /// Objects private to the restoring process. Only available after
    /// [`RstMem::switch_to_private`].
    Private = 2,
}

const RST_MEM_TYPES: usize = 3;

/// Position of an allocated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstPos {
    pub ty: RstMemType,
    pub off: usize,
    pub len: usize,
}

#[derive(Default)]
struct RstMemTypeState {
    remapable: bool,
    enabled: bool,
    buf: Vec<u8>,
    last: usize,
}

impl RstMemTypeState {
    fn new(remapable: bool, enabled: bool) -> Self {
        Self {
            remapable,
            enabled,
            buf: Vec::new(),
            last: 0,
        }
    }
}

pub struct RstMem {
    types: [RstMemTypeState; RST_MEM_TYPES],
    switched: bool,
}

impl Default for RstMem {
    fn default() -> Self {
        Self::new()
    }
}

impl RstMem {
    pub fn new() -> Self {
        Self {
            types: [
                RstMemTypeState::new(false, true),
                RstMemTypeState::new(true, true),
                RstMemTypeState::new(true, false),
            ],
            switched: false,
        }
    }

    pub fn is_enabled(&self, ty: RstMemType) -> bool {
        self.types[ty as usize].enabled
    }

    pub fn is_remapable(&self, ty: RstMemType) -> bool {
        self.types[ty as usize].remapable
    }

    pub fn is_private(&self) -> bool {
        self.switched
    }

    /// Bytes currently used by `ty`.
    pub fn size(&self, ty: RstMemType) -> usize {
        self.types[ty as usize].buf.len()
    }

    /// Allocates `size` zeroed bytes at the end of the `ty` buffer.
    pub fn alloc(&mut self, size: usize, ty: RstMemType) -> Result<RstPos> {
        let t = &mut self.types[ty as usize];
        if !t.enabled {
            return Err(CrError::RstMem(format!("{:?} memory is not enabled", ty)));
        }

        let off = t.buf.len();
        t.buf.resize(off + size, 0);
        t.last = size;

        Ok(RstPos { ty, off, len: size })
    }

    /// Pads the `ty` buffer so the next object starts aligned.
    pub fn align(&mut self, ty: RstMemType) {
        let t = &mut self.types[ty as usize];
        let len = t.buf.len();
        let aligned = (len + RST_MEM_ALIGN - 1) & !(RST_MEM_ALIGN - 1);
        t.buf.resize(aligned, 0);
        t.last = 0;
    }

    /// Pops the most recent allocation of `ty`.
    pub fn free_last(&mut self, ty: RstMemType) {
        let t = &mut self.types[ty as usize];
        let len = t.buf.len() - t.last;
        t.buf.truncate(len);
        t.last = 0;
    }

    pub fn bytes(&self, pos: RstPos) -> &[u8] {
        &self.types[pos.ty as usize].buf[pos.off..pos.off + pos.len]
    }

    pub fn bytes_mut(&mut self, pos: RstPos) -> &mut [u8] {
        &mut self.types[pos.ty as usize].buf[pos.off..pos.off + pos.len]
    }

    /// Stops shared allocations and opens the private buffer. One way only;
    /// a second call is a no-op.
    pub fn switch_to_private(&mut self) {
        if self.switched {
            return;
        }

        log::debug!(
            "rst_mem: switching to private, {} shared bytes in use",
            self.size(RstMemType::Shared)
        );

        self.types[RstMemType::Shared as usize].enabled = false;
        self.types[RstMemType::Private as usize].enabled = true;
        self.switched = true;
    }
}
