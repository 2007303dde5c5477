//! Pass 5: resolving the entry-argument permutation.
//!
//! Register-to-register argument moves form a directed graph in which every
//! destination is unique. Moves whose destination is not the source of any
//! pending move are emitted directly; a cycle is broken by routing one
//! source through the class's reserved scratch register.

use crate::ir::{InstNode, RegClass};
use crate::isa::IsaInfo;
use smallvec::SmallVec;

/// One register-to-register move edge.
#[derive(Clone, Copy, Debug)]
pub struct MoveEdge {
    pub class: RegClass,
    pub size: u8,
    pub dst: u8,
    pub src: u8,
}

/// Order `edges` so each destination is written after it has been read,
/// emitting through the scratch register to break cycles.
pub fn resolve_parallel_moves(
    isa: &dyn IsaInfo,
    mut edges: Vec<MoveEdge>,
) -> SmallVec<[InstNode; 8]> {
    let mut out = SmallVec::new();
    // Self-moves are complete already.
    edges.retain(|e| e.dst != e.src || e.class == RegClass::Mask);

    while !edges.is_empty() {
        let ready = edges.iter().position(|e| {
            !edges
                .iter()
                .any(|other| other.class == e.class && other.src == e.dst)
        });
        match ready {
            Some(i) => {
                let e = edges.remove(i);
                out.push(isa.gen_move(e.class, e.size, e.dst, e.src));
            }
            None => {
                // Every pending destination is also a pending source: a
                // cycle. Divert one source through scratch and retry.
                let e = edges[0];
                let scratch = isa.scratch(e.class)[0];
                log::trace!(
                    "breaking shuffle cycle through scratch enc {scratch} (class {:?})",
                    e.class
                );
                out.push(isa.gen_move(e.class, e.size, scratch, e.src));
                for edge in edges.iter_mut() {
                    if edge.class == e.class && edge.src == e.src {
                        edge.src = scratch;
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
#[cfg(feature = "x64")]
mod tests {
    use super::*;
    use crate::ir::Operand;
    use crate::isa::x64::X64;

    fn edge(dst: u8, src: u8) -> MoveEdge {
        MoveEdge {
            class: RegClass::Gpr,
            size: 8,
            dst,
            src,
        }
    }

    fn moves(edges: Vec<MoveEdge>) -> Vec<(u8, u8)> {
        resolve_parallel_moves(&X64, edges)
            .into_iter()
            .map(|inst| {
                let dst = match inst.operands[0] {
                    Operand::Phys(r) => r.enc,
                    _ => panic!("expected register destination"),
                };
                let src = match inst.operands[1] {
                    Operand::Phys(r) => r.enc,
                    _ => panic!("expected register source"),
                };
                (dst, src)
            })
            .collect()
    }

    #[test]
    fn dag_moves_emit_in_dependency_order() {
        // 1 <- 2, 2 <- 3: must write 1 before clobbering 2.
        let order = moves(vec![edge(2, 3), edge(1, 2)]);
        assert_eq!(order, vec![(1, 2), (2, 3)]);
    }

    #[test]
    fn self_moves_are_dropped() {
        assert!(moves(vec![edge(5, 5)]).is_empty());
    }

    #[test]
    fn cycles_route_through_scratch() {
        // Swap 1 and 2; scratch for x64 GPRs is r10. The first source is
        // parked in scratch, the rest of the cycle unwinds, and the parked
        // value lands last.
        let order = moves(vec![edge(1, 2), edge(2, 1)]);
        assert_eq!(order, vec![(10, 2), (2, 1), (1, 10)]);
    }

    #[test]
    fn three_cycle_resolves_with_one_scratch() {
        let order = moves(vec![edge(1, 2), edge(2, 3), edge(3, 1)]);
        assert_eq!(order, vec![(10, 2), (2, 3), (3, 1), (1, 10)]);
    }
}
