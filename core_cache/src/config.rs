//! Width and port configuration of the cache engines.
//!
//! Configurations are plain data (loadable from JSON) and are validated
//! once, when an engine is built from them.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{address::AddressLayout, write_back::SchedulePolicy};

/// one bit of an `i64` is reserved as the sign of the sentinel address.
pub const MAX_ADDR_SIZE: u32 = 63;

/// upper bound of `line_size + off_size`, i.e. of the cache storage in words.
pub const MAX_STORAGE_BITS: u32 = 24;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("address width must be within 1..={} bits, got {addr_size}", MAX_ADDR_SIZE)]
    AddrSize { addr_size: u32 },
    #[error("{line_size} line bits and {off_size} offset bits do not fit in a {addr_size}-bit address")]
    FieldsExceedAddress {
        addr_size: u32,
        line_size: u32,
        off_size: u32,
    },
    #[error("tag of {tag_size} bits does not fit in a {addr_size}-bit address")]
    TagExceedsAddress { tag_size: u32, addr_size: u32 },
    #[error("cache storage of 2^{bits} words exceeds the limit of 2^{}", MAX_STORAGE_BITS)]
    StorageTooLarge { bits: u32 },
    #[error("at least one port is required")]
    NoPorts,
    #[error("a line must hold at least one word")]
    EmptyLine,
    #[error("{words} words per line do not fit in {off_size} offset bits")]
    LineTooWide { words: usize, off_size: u32 },
}

/// configuration of [`crate::write_back::WriteBackCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBackConfig {
    pub addr_size: u32,
    /// bits of line index; the cache holds `2^line_size` lines
    pub line_size: u32,
    /// bits of offset; a line holds `2^off_size` words
    pub off_size: u32,
    pub n_ports: usize,
    #[serde(default)]
    pub schedule: SchedulePolicy,
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self {
            addr_size: 32,
            line_size: 3,
            off_size: 2,
            n_ports: 2,
            schedule: SchedulePolicy::default(),
        }
    }
}

impl WriteBackConfig {
    pub fn validate(&self) -> Result<AddressLayout, ConfigurationError> {
        let layout = AddressLayout::new(self.addr_size, self.line_size, self.off_size)?;
        let bits = self.line_size + self.off_size;
        if bits > MAX_STORAGE_BITS {
            return Err(ConfigurationError::StorageTooLarge { bits });
        }
        if self.n_ports == 0 {
            return Err(ConfigurationError::NoPorts);
        }
        Ok(layout)
    }
    pub fn tag_size(&self) -> u32 {
        self.addr_size
            .saturating_sub(self.line_size.saturating_add(self.off_size))
    }
    pub fn n_lines(&self) -> usize {
        1 << self.line_size
    }
    pub fn entries_per_line(&self) -> usize {
        1 << self.off_size
    }
    /// capacity of each port's request queue.
    pub fn queue_capacity(&self) -> usize {
        2 * self.n_ports
    }
    pub fn deser(file: impl std::io::Read) -> Result<Self> {
        Ok(serde_json::from_reader(file)?)
    }
}

/// configuration of [`crate::single_line::SingleLineCache`]. the number of
/// words per line is a type parameter of the cache itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleLineConfig {
    pub addr_size: u32,
    pub tag_size: u32,
}

impl SingleLineConfig {
    pub fn validate(&self, words_per_line: usize) -> Result<AddressLayout, ConfigurationError> {
        if self.addr_size == 0 || self.addr_size > MAX_ADDR_SIZE {
            return Err(ConfigurationError::AddrSize {
                addr_size: self.addr_size,
            });
        }
        if self.tag_size > self.addr_size {
            return Err(ConfigurationError::TagExceedsAddress {
                tag_size: self.tag_size,
                addr_size: self.addr_size,
            });
        }
        let off_size = self.off_size();
        if words_per_line == 0 {
            return Err(ConfigurationError::EmptyLine);
        }
        if off_size < usize::BITS && words_per_line > 1 << off_size {
            return Err(ConfigurationError::LineTooWide {
                words: words_per_line,
                off_size,
            });
        }
        AddressLayout::new(self.addr_size, 0, off_size)
    }
    pub fn off_size(&self) -> u32 {
        self.addr_size.saturating_sub(self.tag_size)
    }
    pub fn deser(file: impl std::io::Read) -> Result<Self> {
        Ok(serde_json::from_reader(file)?)
    }
}
