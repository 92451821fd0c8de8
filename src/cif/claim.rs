//! Claim arena: a monotone allocator carved from the top of guest RAM for
//! CIF-level allocations.
//!
//! Claims are tracked at page granularity against the "available" range
//! set even when the caller claims a sub-page span, because veneer
//! firmware in LE mode misbehaves with non-page-aligned advertised
//! regions. Fixed claims perform no overlap check — a documented
//! deviation from IEEE-1275 §6.3.2.4, preserved here rather
//! than "fixed" because real veneer images depend on it.

use crate::pmem::{align_down, align_up, PAGE_SIZE};
use crate::ranges::RangeSet;

/// Size of the arena carved from the top of RAM for "anywhere" claims.
const ARENA_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub enum ClaimMode {
    Anywhere,
    Fixed(u32),
}

pub struct ClaimArena {
    start: u32,
    cursor: u32,
    end: u32,
}

impl ClaimArena {
    #[must_use]
    pub fn new(ram_size: u32) -> Self {
        let start = ram_size.saturating_sub(ARENA_SIZE);
        Self {
            start,
            cursor: start,
            end: ram_size,
        }
    }

    /// Attempt a claim. Returns `None` (the CIF-level `-1` sentinel) on
    /// exhaustion or an out-of-RAM fixed target; otherwise removes the
    /// page-rounded claimed span from `available` and returns the base
    /// address.
    pub fn claim(
        &mut self,
        available: &mut RangeSet,
        mode: ClaimMode,
        align: u32,
        size: u32,
        ram_size: u32,
    ) -> Option<u32> {
        let align = align.max(1);
        let addr = match mode {
            ClaimMode::Anywhere => {
                let candidate = align_up(self.cursor, align);
                if candidate.checked_add(size)? > self.end {
                    return None;
                }
                self.cursor = candidate + size;
                candidate
            }
            ClaimMode::Fixed(addr) => {
                if addr.checked_add(size)? > ram_size {
                    return None;
                }
                addr
            }
        };

        let page_base = align_down(addr, PAGE_SIZE);
        let page_limit = align_up(addr + size, PAGE_SIZE);
        if page_limit > page_base {
            available.remove(page_base, page_limit - 1);
        }
        Some(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anywhere_claim_lands_in_top_arena_and_shrinks_available() {
        let ram_size = 32 * 1024 * 1024;
        let mut arena = ClaimArena::new(ram_size);
        let mut available = RangeSet::new();
        available.add(0, ram_size - 1);

        let addr = arena
            .claim(&mut available, ClaimMode::Anywhere, 0x1000, 0x2000, ram_size)
            .unwrap();
        assert!(addr >= ram_size - 16 * 1024 * 1024);

        let page_base = align_down(addr, PAGE_SIZE);
        let page_limit = align_up(addr + 0x2000, PAGE_SIZE);
        for r in available.iter() {
            assert!(r.limit < page_base || r.base >= page_limit);
        }
    }

    #[test]
    fn exhausted_arena_returns_none() {
        let ram_size = 1024 * 1024;
        let mut arena = ClaimArena::new(ram_size);
        let mut available = RangeSet::new();
        available.add(0, ram_size - 1);
        let result = arena.claim(&mut available, ClaimMode::Anywhere, 0x1000, ram_size * 2, ram_size);
        assert!(result.is_none());
    }

    #[test]
    fn fixed_claim_performs_no_overlap_check() {
        let ram_size = 32 * 1024 * 1024;
        let mut arena = ClaimArena::new(ram_size);
        let mut available = RangeSet::new();
        available.add(0, ram_size - 1);
        let a = arena
            .claim(&mut available, ClaimMode::Fixed(0x1000), 0x1000, 0x1000, ram_size)
            .unwrap();
        let b = arena
            .claim(&mut available, ClaimMode::Fixed(0x1000), 0x1000, 0x1000, ram_size)
            .unwrap();
        assert_eq!(a, b);
    }
}
