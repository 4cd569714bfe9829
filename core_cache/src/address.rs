//! Address decomposition shared by every cache engine.
//!
//! An address of `addr_size` bits is split, from the least significant
//! end, into an offset within a line (`off_size` bits), a line index
//! (`line_size` bits) and a tag (the remaining high bits):
//!
//! ```text
//!  addr_size-1                                   0
//! +--------------+-------------------+------------+
//! |     tag      |    line index     |   offset   |
//! +--------------+-------------------+------------+
//! ```
//!
//! A single-line cache has no line index and uses `line_size == 0`.

use std::fmt;

use crate::{
    bin::{extract, low_mask},
    config::{ConfigurationError, MAX_ADDR_SIZE},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressLayout {
    addr_size: u32,
    line_size: u32,
    off_size: u32,
}

/// every field of an address, as seen by a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedAddr {
    /// address masked down to `addr_size` bits
    pub addr: u64,
    pub tag: u64,
    pub line: usize,
    pub offset: usize,
    /// index into cache storage: `line * entries_per_line + offset`
    pub cache_index: usize,
    /// address of the first word of the line in main memory
    pub main_base: u64,
}

impl fmt::Display for DecodedAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#010x} (tag {:#x}, line {}, offset {})",
            self.addr, self.tag, self.line, self.offset
        )
    }
}

impl AddressLayout {
    pub fn new(addr_size: u32, line_size: u32, off_size: u32) -> Result<Self, ConfigurationError> {
        if addr_size == 0 || addr_size > MAX_ADDR_SIZE {
            return Err(ConfigurationError::AddrSize { addr_size });
        }
        if line_size
            .checked_add(off_size)
            .map_or(true, |used| used > addr_size)
        {
            return Err(ConfigurationError::FieldsExceedAddress {
                addr_size,
                line_size,
                off_size,
            });
        }
        Ok(Self {
            addr_size,
            line_size,
            off_size,
        })
    }
    pub fn addr_size(&self) -> u32 {
        self.addr_size
    }
    /// may be zero, in which case every tag is `0` and always compares equal.
    pub fn tag_size(&self) -> u32 {
        self.addr_size - self.line_size - self.off_size
    }
    pub fn n_lines(&self) -> usize {
        1 << self.line_size
    }
    pub fn entries_per_line(&self) -> usize {
        1 << self.off_size
    }
    /// largest address representable in `addr_size` bits.
    pub fn max_addr(&self) -> u64 {
        low_mask(self.addr_size)
    }
    /// index of the first word of `line` in cache storage.
    pub fn first_of_line(&self, line: usize) -> usize {
        line << self.off_size
    }

    pub fn decompose(&self, addr: u64) -> DecodedAddr {
        let addr = addr & self.max_addr();
        let split = self.off_size + self.line_size;
        let offset = extract(addr, 0..self.off_size) as usize;
        let line = extract(addr, self.off_size..split) as usize;
        let tag = extract(addr, split..self.addr_size);
        DecodedAddr {
            addr,
            tag,
            line,
            offset,
            cache_index: self.first_of_line(line) + offset,
            main_base: addr & !low_mask(self.off_size),
        }
    }

    /// inverse of [`Self::decompose`]. fields wider than their width are truncated.
    pub fn compose(&self, tag: u64, line: usize, offset: usize) -> u64 {
        let split = self.off_size + self.line_size;
        let tag = if self.tag_size() == 0 {
            0
        } else {
            (tag & low_mask(self.tag_size())) << split
        };
        let line = (line as u64 & low_mask(self.line_size)) << self.off_size;
        let offset = offset as u64 & low_mask(self.off_size);
        tag | line | offset
    }
}
