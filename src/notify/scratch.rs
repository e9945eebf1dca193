//! Caller-buffer-or-heap arena for assembling outgoing batches.
//!
//! A resolve that has to pack a batch gets a caller-supplied scratch buffer.
//! Regions are carved out of it front to back; once it is exhausted, further
//! requests fall back to fresh heap allocations. Each handed-out region is
//! independently owned, so nothing has to be returned or released in order.

use byteorder::{ByteOrder, LittleEndian};

/// One carved-out packing region: either a window into the caller's scratch
/// buffer or a heap fallback.
#[derive(Debug)]
pub enum Region<'a> {
    Caller(&'a mut [u8]),
    Heap(Vec<u8>),
}

impl<'a> Region<'a> {
    pub fn len(&self) -> usize {
        match self {
            Region::Caller(buf) => buf.len(),
            Region::Heap(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Region::Caller(buf) => buf,
            Region::Heap(buf) => buf,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Region::Caller(buf) => buf,
            Region::Heap(buf) => buf,
        }
    }
}

/// The scratch allocator itself. Exclusively owned by the single in-flight
/// packing call and never retained across calls.
#[derive(Debug)]
pub struct Scratch<'a> {
    remaining: &'a mut [u8],
}

impl<'a> Scratch<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { remaining: buf }
    }

    /// A scratch with no caller buffer; every region comes off the heap.
    pub fn unbuffered() -> Self {
        Self { remaining: &mut [] }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }

    /// Carves `len` bytes off the front of the caller buffer, or allocates
    /// when it no longer fits.
    pub fn alloc(&mut self, len: usize) -> Region<'a> {
        if len <= self.remaining.len() {
            let taken = std::mem::take(&mut self.remaining);
            let (head, rest) = taken.split_at_mut(len);
            self.remaining = rest;
            Region::Caller(head)
        } else {
            Region::Heap(vec![0u8; len])
        }
    }

    /// Hands over whatever is left of the caller buffer. Used for the
    /// variable-length blob, whose final size is not known up front.
    pub fn take_rest(&mut self) -> Region<'a> {
        Region::Caller(std::mem::take(&mut self.remaining))
    }
}

/// Appends length-prefixed byte strings into a region, upgrading to a heap
/// allocation the moment the caller region runs out.
#[derive(Debug)]
pub struct BlobBuilder<'a> {
    region: Region<'a>,
    len: usize,
}

impl<'a> BlobBuilder<'a> {
    pub fn new(region: Region<'a>) -> Self {
        Self { region, len: 0 }
    }

    /// Bytes written so far. The backing region may be larger.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends one u32-length-prefixed byte string.
    pub fn append(&mut self, bytes: &[u8]) {
        let need = self.len + 4 + bytes.len();
        self.ensure(need);
        let out = self.region.as_mut_slice();
        LittleEndian::write_u32(&mut out[self.len..self.len + 4], bytes.len() as u32);
        out[self.len + 4..need].copy_from_slice(bytes);
        self.len = need;
    }

    fn ensure(&mut self, need: usize) {
        if need <= self.region.len() {
            return;
        }
        let grown = need.max(self.region.len() * 2).max(256);
        if let Region::Heap(buf) = &mut self.region {
            buf.resize(grown, 0);
            return;
        }
        let mut buf = vec![0u8; grown];
        buf[..self.len].copy_from_slice(&self.region.as_slice()[..self.len]);
        self.region = Region::Heap(buf);
    }

    pub fn finish(self) -> (Region<'a>, usize) {
        (self.region, self.len)
    }
}
