//! One-line, write-through cache.
//!
//! Reads that miss are served straight from main memory and leave the cache
//! untouched. Writes always go to main memory and always install the line,
//! so the cached copy is never newer than memory.

#[cfg(feature = "stat")]
use std::cell::RefCell;

use crate::{
    address::{AddressLayout, DecodedAddr},
    config::{ConfigurationError, SingleLineConfig},
    memory,
};

#[cfg(feature = "stat")]
use crate::stat::{AddStats, Stats};

pub struct SingleLineCache<T, const N: usize> {
    layout: AddressLayout,
    valid: bool,
    tag: u64,
    line: [T; N],
    #[cfg(feature = "stat")]
    stat: RefCell<stat::SingleLineStat>,
}

impl<T: Copy + Default, const N: usize> SingleLineCache<T, N> {
    /// builds an invalidated cache.
    pub fn new(config: SingleLineConfig) -> Result<Self, ConfigurationError> {
        let layout = config.validate(N)?;
        Ok(Self {
            layout,
            valid: false,
            tag: 0,
            line: [T::default(); N],
            #[cfg(feature = "stat")]
            stat: RefCell::default(),
        })
    }

    pub fn init(&mut self) {
        self.valid = false;
    }

    pub fn get_line(&self, main_mem: &[T], addr: u64) -> memory::Result<[T; N]> {
        let addr = self.layout.decompose(addr);
        if self.hit(&addr) {
            log::trace!("read hit {addr}");
            #[cfg(feature = "stat")]
            self.stat.borrow_mut().read_hit();
            return Ok(self.line);
        }
        log::trace!("read miss {addr}");
        let mut line = [T::default(); N];
        memory::read_line_into(main_mem, addr.main_base, &mut line)?;
        #[cfg(feature = "stat")]
        self.stat.borrow_mut().read_miss();
        Ok(line)
    }

    /// writes `line` through to main memory and installs it.
    pub fn set_line(&mut self, main_mem: &mut [T], addr: u64, line: &[T; N]) -> memory::Result<()> {
        let addr = self.layout.decompose(addr);
        memory::write_line_from(main_mem, addr.main_base, line)?;
        self.line = *line;
        self.tag = addr.tag;
        self.valid = true;
        log::trace!("write {addr}");
        #[cfg(feature = "stat")]
        self.stat.borrow_mut().write();
        Ok(())
    }

    /// whether `addr` would hit, without touching anything.
    pub fn probe(&self, addr: u64) -> bool {
        self.hit(&self.layout.decompose(addr))
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn tag(&self) -> Option<u64> {
        self.valid.then_some(self.tag)
    }

    pub fn cached_line(&self) -> Option<&[T; N]> {
        self.valid.then_some(&self.line)
    }

    #[cfg(feature = "stat")]
    pub fn stat(&self) -> stat::SingleLineStat {
        *self.stat.borrow()
    }

    fn hit(&self, addr: &DecodedAddr) -> bool {
        self.valid && self.tag == addr.tag
    }
}

#[cfg(feature = "stat")]
impl<T, const N: usize> AddStats for SingleLineCache<T, N> {
    fn add_stats(&self, buf: &mut Stats) {
        buf.push(Box::new(self.stat.borrow().to_owned()));
    }
}

#[cfg(feature = "stat")]
pub mod stat {
    use std::fmt;

    use crate::stat::*;

    #[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
    pub struct SingleLineStat {
        pub read_hits: usize,
        pub read_misses: usize,
        pub writes: usize,
    }

    impl SingleLineStat {
        pub fn read_hit(&mut self) {
            self.read_hits += 1;
        }
        pub fn read_miss(&mut self) {
            self.read_misses += 1;
        }
        pub fn write(&mut self) {
            self.writes += 1;
        }
    }

    impl Stat for SingleLineStat {
        fn view(&self, _: usize) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ SingleLineStat {
        fn header(&self) -> &'static str {
            "single-line cache"
        }
        fn width(&self) -> usize {
            32
        }
    }

    impl fmt::Display for &'_ SingleLineStat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            writeln!(f, "  read hits: {:>17}", self.read_hits)?;
            writeln!(f, "  read misses: {:>15}", self.read_misses)?;
            let rate = format!("{:.2} %", hit_rate(self.read_hits, self.read_misses));
            writeln!(f, "  hit rate: {rate:>18}")?;
            write!(f, "  writes: {:>20}", self.writes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 8-bit addresses, 4 words per line
    fn cache() -> SingleLineCache<u32, 4> {
        SingleLineCache::new(SingleLineConfig {
            addr_size: 8,
            tag_size: 6,
        })
        .unwrap()
    }

    #[test]
    fn test_set_then_get() {
        let mut mem: Vec<u32> = (0..256).collect();
        let mut c = cache();
        c.set_line(&mut mem, 0x11, &[10, 11, 12, 13]).unwrap();
        assert_eq!([10, 11, 12, 13], mem[0x10..0x14]);
        assert_eq!(Some(0x11 >> 2), c.tag());
        // any offset within the line addresses the same line
        for addr in 0x10..0x14 {
            assert_eq!([10, 11, 12, 13], c.get_line(&mem, addr).unwrap());
        }
    }

    #[test]
    fn test_hit_does_not_read_memory() {
        let mut mem = vec![0u32; 64];
        let mut c = cache();
        c.set_line(&mut mem, 8, &[1, 2, 3, 4]).unwrap();
        mem[8] = 99;
        assert_eq!([1, 2, 3, 4], c.get_line(&mem, 8).unwrap());
    }

    #[test]
    fn test_read_miss_is_pure() {
        let mut mem: Vec<u32> = (0..64).collect();
        let mut c = cache();
        c.set_line(&mut mem, 4, &[7, 7, 7, 7]).unwrap();
        assert_eq!([32, 33, 34, 35], c.get_line(&mem, 32).unwrap());
        assert!(c.probe(4));
        assert!(!c.probe(32));
        assert_eq!(Some(&[7, 7, 7, 7]), c.cached_line());
        assert_eq!(Some(1), c.tag());
    }

    #[test]
    fn test_set_replaces_prior_line() {
        let mut mem = vec![0u32; 64];
        let mut c = cache();
        c.set_line(&mut mem, 0, &[1, 1, 1, 1]).unwrap();
        c.set_line(&mut mem, 20, &[2, 2, 2, 2]).unwrap();
        assert_eq!([1, 1, 1, 1], mem[0..4]);
        assert_eq!([2, 2, 2, 2], mem[20..24]);
        assert!(!c.probe(0));
        assert_eq!([1, 1, 1, 1], c.get_line(&mem, 0).unwrap());
        assert_eq!([2, 2, 2, 2], c.get_line(&mem, 21).unwrap());
    }

    #[test]
    fn test_init_invalidates() {
        let mut mem = vec![0u32; 64];
        let mut c = cache();
        assert!(!c.is_valid());
        c.set_line(&mut mem, 0, &[5, 5, 5, 5]).unwrap();
        assert!(c.is_valid());
        c.init();
        assert!(!c.is_valid());
        assert_eq!(None, c.tag());
        mem[0] = 6;
        assert_eq!([6, 5, 5, 5], c.get_line(&mem, 0).unwrap());
    }

    #[test]
    fn test_line_narrower_than_offset() {
        let mut mem = vec![0u32; 64];
        let mut c: SingleLineCache<u32, 3> = SingleLineCache::new(SingleLineConfig {
            addr_size: 8,
            tag_size: 6,
        })
        .unwrap();
        c.set_line(&mut mem, 6, &[1, 2, 3]).unwrap();
        assert_eq!([1, 2, 3, 0], mem[4..8]);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut mem = vec![0u32; 10];
        let mut c = cache();
        assert!(c.get_line(&mem, 8).is_err());
        assert!(c.set_line(&mut mem, 9, &[1, 1, 1, 1]).is_err());
        assert!(!c.is_valid());
        assert_eq!(vec![0; 10], mem);
    }

    #[test]
    fn test_rejects_wide_line() {
        let r = SingleLineCache::<u32, 8>::new(SingleLineConfig {
            addr_size: 8,
            tag_size: 6,
        });
        assert!(matches!(r, Err(ConfigurationError::LineTooWide { .. })));
    }

    #[cfg(feature = "stat")]
    #[test]
    fn test_stat() {
        let mut mem = vec![0u32; 64];
        let mut c = cache();
        c.set_line(&mut mem, 0, &[1, 1, 1, 1]).unwrap();
        c.get_line(&mem, 1).unwrap();
        c.get_line(&mem, 16).unwrap();
        c.get_line(&mem, 2).unwrap();
        assert_eq!(
            stat::SingleLineStat {
                read_hits: 2,
                read_misses: 1,
                writes: 1
            },
            c.stat()
        );
    }
}
