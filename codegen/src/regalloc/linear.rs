//! Pass 4: the linear scan itself.

use super::liveness::Interval;
use crate::ir::{RegClass, VReg};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Where a virtual register ends up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Loc {
    /// A physical register encoding.
    Reg(u8),
    /// A spill slot at this byte offset into the frame's spill area.
    Spill(u32),
}

/// The scan's output.
pub struct ScanResult {
    /// Final location per virtual register.
    pub locs: FxHashMap<VReg, Loc>,
    /// Total spill-area size in bytes, 16-byte aligned.
    pub spill_size: u32,
    /// Registers that were handed out at any point, per class; feeds the
    /// preserved-set computation.
    pub used_regs: Vec<(RegClass, u8)>,
}

struct ActiveEntry {
    end: u32,
    vreg: VReg,
    class: RegClass,
    enc: u8,
}

/// Allocate spill slots: 8 bytes for GPRs, at least 16 for vectors, aligned
/// to the slot size.
struct SlotAllocator {
    cursor: u32,
}

impl SlotAllocator {
    fn alloc(&mut self, class: RegClass, size: u8) -> u32 {
        let slot = match class {
            RegClass::Gpr | RegClass::Mask => 8,
            RegClass::Vec => u32::from(size).max(16),
        };
        let offset = (self.cursor + slot - 1) & !(slot - 1);
        self.cursor = offset + slot;
        offset
    }
}

/// Run linear scan over `intervals` with the given per-class free pools.
///
/// Intervals are sorted by start position; the active list is kept ordered
/// by end position. On pressure the active interval with the furthest end
/// is spilled if it outlives the incoming one, otherwise the incoming
/// interval spills.
pub fn scan(
    mut intervals: Vec<Interval>,
    mut free: FxHashMap<RegClass, VecDeque<u8>>,
) -> ScanResult {
    intervals.sort_by_key(|iv| (iv.start, iv.vreg));

    let mut locs: FxHashMap<VReg, Loc> = FxHashMap::default();
    let mut active: Vec<ActiveEntry> = Vec::new();
    let mut slots = SlotAllocator { cursor: 0 };
    let mut used_regs: Vec<(RegClass, u8)> = Vec::new();

    for interval in intervals {
        // Expire intervals that ended before this one starts.
        let mut i = 0;
        while i < active.len() {
            if active[i].end < interval.start {
                let expired = active.remove(i);
                free.get_mut(&expired.class)
                    .expect("pool for class")
                    .push_back(expired.enc);
            } else {
                i += 1;
            }
        }

        let pool = free.get_mut(&interval.class).expect("pool for class");
        if let Some(enc) = pool.pop_front() {
            log::trace!("assign {} -> enc {enc}", interval.vreg);
            if !used_regs.contains(&(interval.class, enc)) {
                used_regs.push((interval.class, enc));
            }
            locs.insert(interval.vreg, Loc::Reg(enc));
            let entry = ActiveEntry {
                end: interval.end,
                vreg: interval.vreg,
                class: interval.class,
                enc,
            };
            let at = active.partition_point(|a| a.end <= entry.end);
            active.insert(at, entry);
            continue;
        }

        // No free register: spill the furthest-ending active interval of
        // this class if it outlives the new interval, else the new one.
        let victim = active
            .iter()
            .rposition(|a| a.class == interval.class && a.end > interval.end);
        match victim {
            Some(i) => {
                let stolen = active.remove(i);
                let offset = slots.alloc(interval.class, interval.size);
                log::trace!(
                    "spill {} to +{offset}, steal enc {} for {}",
                    stolen.vreg,
                    stolen.enc,
                    interval.vreg
                );
                locs.insert(stolen.vreg, Loc::Spill(offset));
                locs.insert(interval.vreg, Loc::Reg(stolen.enc));
                let entry = ActiveEntry {
                    end: interval.end,
                    vreg: interval.vreg,
                    class: interval.class,
                    enc: stolen.enc,
                };
                let at = active.partition_point(|a| a.end <= entry.end);
                active.insert(at, entry);
            }
            None => {
                let offset = slots.alloc(interval.class, interval.size);
                log::trace!("spill {} to +{offset}", interval.vreg);
                locs.insert(interval.vreg, Loc::Spill(offset));
            }
        }
    }

    let spill_size = (slots.cursor + 15) & !15;
    ScanResult {
        locs,
        spill_size,
        used_regs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::SmallVec;

    fn interval(vreg: u32, start: u32, end: u32) -> Interval {
        Interval {
            vreg: VReg(vreg),
            class: RegClass::Gpr,
            size: 8,
            start,
            end,
            uses: SmallVec::new(),
        }
    }

    fn pools(gprs: &[u8]) -> FxHashMap<RegClass, VecDeque<u8>> {
        let mut map = FxHashMap::default();
        map.insert(RegClass::Gpr, gprs.iter().copied().collect());
        map.insert(RegClass::Vec, VecDeque::new());
        map.insert(RegClass::Mask, VecDeque::new());
        map
    }

    #[test]
    fn non_overlapping_intervals_share_registers() {
        let result = scan(
            vec![interval(0, 0, 1), interval(1, 2, 3), interval(2, 4, 5)],
            pools(&[7]),
        );
        for v in 0..3 {
            assert_eq!(result.locs[&VReg(v)], Loc::Reg(7));
        }
        assert_eq!(result.spill_size, 0);
    }

    #[test]
    fn pressure_spills_furthest_end() {
        // Two registers, three overlapping intervals; the one ending last
        // gets spilled.
        let result = scan(
            vec![interval(0, 0, 10), interval(1, 1, 4), interval(2, 2, 5)],
            pools(&[1, 2]),
        );
        assert_eq!(result.locs[&VReg(0)], Loc::Spill(0));
        assert!(matches!(result.locs[&VReg(1)], Loc::Reg(_)));
        assert!(matches!(result.locs[&VReg(2)], Loc::Reg(1)));
        assert_eq!(result.spill_size, 16);
    }

    #[test]
    fn incoming_interval_spills_when_it_ends_last() {
        let result = scan(
            vec![interval(0, 0, 3), interval(1, 0, 4), interval(2, 1, 10)],
            pools(&[1, 2]),
        );
        assert_eq!(result.locs[&VReg(2)], Loc::Spill(0));
    }

    #[test]
    fn spill_slots_are_aligned_multiples() {
        let mut ivs: Vec<Interval> = (0..5).map(|v| interval(v, 0, 20)).collect();
        ivs.push(Interval {
            vreg: VReg(5),
            class: RegClass::Vec,
            size: 16,
            start: 0,
            end: 20,
            uses: SmallVec::new(),
        });
        let result = scan(ivs, pools(&[1]));
        // Four GPR spills at 0, 8, 16, 24 and one 16-byte vector slot at 32.
        let mut spills: Vec<u32> = result
            .locs
            .values()
            .filter_map(|l| match l {
                Loc::Spill(o) => Some(*o),
                _ => None,
            })
            .collect();
        spills.sort_unstable();
        assert_eq!(spills, vec![0, 8, 16, 24, 32]);
        assert_eq!(result.spill_size, 48);
    }
}
