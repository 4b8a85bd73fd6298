//! Sequentialization of parallel register moves.
//!
//! Phi elimination produces, per control-flow edge, a batch of moves that must behave as if
//! every source were read before any destination is written. [`sequentialize`] orders such a
//! batch as a dependency graph: a move is ready once its destination no longer overlaps the
//! source of any pending move. When nothing is ready the remaining moves form cycles; one
//! source is copied to a temporary register above the frame, which turns its cycle into a
//! chain.

use crate::ir::RegSpec;

/// One `dst <- src` copy of a batch. Both sides have the same kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParallelMove {
    /// Destination register.
    pub dst: RegSpec,
    /// Source register.
    pub src: RegSpec,
}

/// Orders `batch` into sequential moves with the same effect.
///
/// Temporaries are taken from `temp_base` upwards. Returns the sequential moves and the
/// number of temporary registers used.
#[must_use]
pub fn sequentialize(batch: &[ParallelMove], temp_base: u32) -> (Vec<ParallelMove>, u32) {
    let mut pending: Vec<ParallelMove> = batch
        .iter()
        .filter(|m| m.dst != m.src)
        .copied()
        .collect();
    let mut out = Vec::with_capacity(pending.len() + 1);
    let mut temp_used = 0u32;
    let mut temp_next = temp_base;

    while !pending.is_empty() {
        let ready = (0..pending.len()).find(|&i| {
            pending
                .iter()
                .enumerate()
                .all(|(j, other)| i == j || !pending[i].dst.overlaps(other.src))
        });
        match ready {
            Some(i) => {
                out.push(pending.remove(i));
                if pending.iter().all(|m| m.src.reg < temp_base) {
                    temp_next = temp_base;
                }
            }
            None => {
                // Break the cycle at the first pending move whose source is about to be
                // overwritten.
                let Some(victim) = (0..pending.len()).find(|&i| {
                    pending
                        .iter()
                        .enumerate()
                        .any(|(j, other)| i != j && other.dst.overlaps(pending[i].src))
                }) else {
                    break;
                };
                let temp = RegSpec::new(temp_next, pending[victim].src.kind);
                temp_next += temp.width();
                temp_used = temp_used.max(temp_next - temp_base);
                out.push(ParallelMove {
                    dst: temp,
                    src: pending[victim].src,
                });
                pending[victim].src = temp;
            }
        }
    }
    (out, temp_used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Kind;

    fn mv(dst: u32, src: u32) -> ParallelMove {
        ParallelMove {
            dst: RegSpec::new(dst, Kind::Int),
            src: RegSpec::new(src, Kind::Int),
        }
    }

    /// Runs moves over a register file where register `i` initially holds `i`.
    fn simulate(moves: &[ParallelMove], size: usize) -> Vec<u32> {
        let mut file: Vec<u32> = (0..size as u32).collect();
        for m in moves {
            let values: Vec<u32> = (0..m.src.width())
                .map(|k| file[(m.src.reg + k) as usize])
                .collect();
            for (k, value) in values.into_iter().enumerate() {
                file[m.dst.reg as usize + k] = value;
            }
        }
        file
    }

    #[test]
    fn test_chain_is_ordered_without_temp() {
        let batch = [mv(1, 0), mv(2, 1), mv(3, 2)];
        let (moves, temps) = sequentialize(&batch, 10);
        assert_eq!(temps, 0);
        let file = simulate(&moves, 10);
        assert_eq!(&file[..4], &[0, 0, 1, 2]);
    }

    #[test]
    fn test_swap_uses_one_temp() {
        let batch = [mv(0, 1), mv(1, 0)];
        let (moves, temps) = sequentialize(&batch, 4);
        assert_eq!(temps, 1);
        assert_eq!(moves.len(), 3);
        let file = simulate(&moves, 5);
        assert_eq!(&file[..2], &[1, 0]);
    }

    #[test]
    fn test_rotation_and_fanout() {
        let batch = [mv(0, 2), mv(1, 0), mv(2, 1), mv(3, 0)];
        let (moves, _) = sequentialize(&batch, 6);
        let file = simulate(&moves, 8);
        assert_eq!(&file[..4], &[2, 0, 1, 0]);
    }

    #[test]
    fn test_wide_swap() {
        let wide = |dst, src| ParallelMove {
            dst: RegSpec::new(dst, Kind::Long),
            src: RegSpec::new(src, Kind::Long),
        };
        let (moves, temps) = sequentialize(&[wide(0, 2), wide(2, 0)], 4);
        assert_eq!(temps, 2);
        let file = simulate(&moves, 6);
        assert_eq!(&file[..4], &[2, 3, 0, 1]);
    }

    #[test]
    fn test_self_moves_vanish() {
        let (moves, temps) = sequentialize(&[mv(3, 3)], 4);
        assert!(moves.is_empty());
        assert_eq!(temps, 0);
    }
}
