//! Effective-address-interval to real-address-base translation table used
//! by the firmware-mode MMU path (`SDR1 == SDR1_MAGIC_ROM_MODE`).
//!
//! Grounded on `original_source/mmu_ranges.c`. An entry maps
//! `base..=limit` (effective) to `ra + (ea - base)` (real); `flags` rides
//! along opaquely and is not interpreted by this monitor.

use crate::massert;
use crate::types::Gra;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuRange {
    pub base: u32,
    pub limit: u32,
    pub ra: u32,
    pub flags: u32,
}

impl MmuRange {
    #[must_use]
    pub fn translate(&self, ea: u32) -> Gra {
        Gra(self.ra + (ea - self.base))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MmuRangeMap {
    entries: Vec<MmuRange>,
}

impl MmuRangeMap {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    #[must_use]
    pub fn find(&self, ea: u32) -> Option<&MmuRange> {
        self.entries.iter().find(|r| ea >= r.base && ea <= r.limit)
    }

    /// Add a translated interval. An identical-subset re-add (same
    /// translation and flags as an existing, containing entry) is
    /// idempotent; any other overlap is a fatal bug, mirroring
    /// `mmu_range_add`'s `BUG_ON`s.
    pub fn add(&mut self, base: u32, limit: u32, ra: u32, flags: u32) {
        massert!(base < limit, "base (0x{base:x}) >= limit (0x{limit:x})");

        let mut insert_at = self.entries.len();
        for (i, r) in self.entries.iter().enumerate() {
            if base >= r.base && limit <= r.limit {
                let expected_ra = r.ra + (base - r.base);
                massert!(
                    expected_ra == ra && flags == r.flags,
                    "incompatible overlapping mmu range 0x{base:x}-0x{limit:x}"
                );
                return;
            }
            massert!(
                !(limit >= r.base && base <= r.limit),
                "partially overlapping mmu range 0x{base:x}-0x{limit:x}"
            );
            if r.base > limit {
                insert_at = i;
                break;
            }
        }
        self.entries.insert(
            insert_at,
            MmuRange {
                base,
                limit,
                ra,
                flags,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_translates_via_base_offset() {
        let mut m = MmuRangeMap::new();
        m.add(0xC000_0000, 0xC000_0fff, 0x0010_0000, 0);
        let e = m.find(0xC000_0010).unwrap();
        assert_eq!(e.translate(0xC000_0010), Gra(0x0010_0010));
    }

    #[test]
    fn identical_subset_readd_is_idempotent() {
        let mut m = MmuRangeMap::new();
        m.add(0xC000_0000, 0xC000_ffff, 0x0010_0000, 0);
        m.add(0xC000_0000, 0xC000_0fff, 0x0010_0000, 0);
        assert_eq!(m.entries.len(), 1);
    }

    #[test]
    #[should_panic]
    fn partial_overlap_is_fatal() {
        let mut m = MmuRangeMap::new();
        m.add(0xC000_0000, 0xC000_0fff, 0x0010_0000, 0);
        m.add(0xC000_0800, 0xC000_1800, 0x0020_0000, 0);
    }
}
