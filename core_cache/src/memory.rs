//! Line-granular access to caller-owned main memory.
//!
//! Main memory is any slice of words, indexed by word address. The caches
//! only ever borrow it.

use std::ops::Range;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryAccessError {
    #[error("line at {line_base:#010x} ({words} words) out of range for memory of {len} words")]
    OutOfBounds {
        line_base: u64,
        words: usize,
        len: usize,
    },
}

pub type Result<T> = std::result::Result<T, MemoryAccessError>;

/// range of word indices covered by the line starting at `line_base`.
pub fn line_span(line_base: u64, words: usize, len: usize) -> Result<Range<usize>> {
    let out_of_bounds = || MemoryAccessError::OutOfBounds {
        line_base,
        words,
        len,
    };
    let start = usize::try_from(line_base).map_err(|_| out_of_bounds())?;
    let end = start.checked_add(words).ok_or_else(out_of_bounds)?;
    if end > len {
        return Err(out_of_bounds());
    }
    Ok(start..end)
}

pub fn read_line_into<T: Copy>(main_mem: &[T], line_base: u64, dst: &mut [T]) -> Result<()> {
    let span = line_span(line_base, dst.len(), main_mem.len())?;
    dst.copy_from_slice(&main_mem[span]);
    Ok(())
}

pub fn write_line_from<T: Copy>(main_mem: &mut [T], line_base: u64, src: &[T]) -> Result<()> {
    let span = line_span(line_base, src.len(), main_mem.len())?;
    main_mem[span].copy_from_slice(src);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_span() {
        assert_eq!(Ok(4..8), line_span(4, 4, 8));
        assert_eq!(
            Err(MemoryAccessError::OutOfBounds {
                line_base: 6,
                words: 4,
                len: 8
            }),
            line_span(6, 4, 8)
        );
        assert!(line_span(u64::MAX, 1, 8).is_err());
    }
    #[test]
    fn test_read_write_line() {
        let mut mem = [0u32; 8];
        write_line_from(&mut mem, 2, &[0xDEADBEEF, 7]).unwrap();
        assert_eq!([0, 0, 0xDEADBEEF, 7, 0, 0, 0, 0], mem);

        let mut line = [0u32; 3];
        read_line_into(&mem, 1, &mut line).unwrap();
        assert_eq!([0, 0xDEADBEEF, 7], line);

        assert!(read_line_into(&mem, 6, &mut line).is_err());
        assert!(write_line_from(&mut mem, 7, &[1, 2]).is_err());
        assert_eq!(0, mem[7]);
    }
}
