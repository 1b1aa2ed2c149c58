//! Rarest-first piece selection.
//!
//! The scheduler tracks, for every piece, how many of our currently
//! connected peers have it. Peer sessions register their bitfield when they
//! connect, update individual bits as `have` messages arrive, and
//! unregister on disconnect; [`Scheduler::pick_piece`] then picks the
//! rarest piece a given peer can supply that we don't already have (or
//! have in flight), breaking ties randomly so that many peers connecting
//! around the same time don't all pile onto the same "rarest" piece.

use std::sync::Mutex;

use rand::seq::SliceRandom;

use crate::{Bitfield, PieceIndex};

struct Counts {
    /// `availability[i]` is the number of connected peers known to have
    /// piece `i`.
    availability: Vec<usize>,
}

pub(crate) struct Scheduler {
    counts: Mutex<Counts>,
}

impl Scheduler {
    pub(crate) fn new(piece_count: usize) -> Self {
        Self {
            counts: Mutex::new(Counts { availability: vec![0; piece_count] }),
        }
    }

    /// Records that a newly connected peer reported having the pieces set
    /// in `bitfield`.
    pub(crate) fn register_peer(&self, bitfield: &Bitfield) {
        let mut counts = self.counts.lock().unwrap();
        for (index, has) in bitfield.iter().enumerate() {
            if *has {
                if let Some(count) = counts.availability.get_mut(index) {
                    *count += 1;
                }
            }
        }
    }

    /// Records that a connected peer announced having a single additional
    /// piece via a `have` message.
    pub(crate) fn update_peer_have(&self, piece_index: PieceIndex) {
        let mut counts = self.counts.lock().unwrap();
        if let Some(count) = counts.availability.get_mut(piece_index) {
            *count += 1;
        }
    }

    /// Reverses the effect of [`Scheduler::register_peer`] when a peer
    /// disconnects. `bitfield` should be the peer's final bitfield, i.e.
    /// the originally registered one with every subsequent `have` folded
    /// in, so each piece the peer ever reported is decremented exactly
    /// once.
    pub(crate) fn unregister_peer(&self, bitfield: &Bitfield) {
        let mut counts = self.counts.lock().unwrap();
        for (index, has) in bitfield.iter().enumerate() {
            if *has {
                if let Some(count) = counts.availability.get_mut(index) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    /// Picks the next piece `peer_bitfield` can supply out of `missing`
    /// (pieces we don't yet have, as reported by the piece store). Per spec
    /// §4.5 points 1-2: a piece already partially reserved by some other
    /// session is preferred, so partial downloads get finished rather than
    /// abandoned for a new rarest pick; only when nothing is already in
    /// flight do we fall back to minimum-availability rarest-first, ties
    /// broken uniformly at random.
    pub(crate) fn pick_piece(
        &self,
        peer_bitfield: &Bitfield,
        missing: &[PieceIndex],
        partially_reserved: &[PieceIndex],
    ) -> Option<PieceIndex> {
        let candidates: Vec<PieceIndex> = missing
            .iter()
            .copied()
            .filter(|&index| {
                peer_bitfield.get(index).map(|b| *b).unwrap_or(false)
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let in_progress: Vec<PieceIndex> = candidates
            .iter()
            .copied()
            .filter(|index| partially_reserved.contains(index))
            .collect();
        let pool = if in_progress.is_empty() {
            candidates
        } else {
            in_progress
        };

        let counts = self.counts.lock().unwrap();
        let min_count = pool
            .iter()
            .map(|&index| {
                counts.availability.get(index).copied().unwrap_or(0)
            })
            .min()?;
        let rarest: Vec<PieceIndex> = pool
            .into_iter()
            .filter(|&index| {
                counts.availability.get(index).copied().unwrap_or(0)
                    == min_count
            })
            .collect();
        drop(counts);

        rarest.choose(&mut rand::thread_rng()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitfield(bits: &[bool]) -> Bitfield {
        let mut b = Bitfield::repeat(false, bits.len());
        for (i, v) in bits.iter().enumerate() {
            b.set(i, *v);
        }
        b
    }

    #[test]
    fn picks_the_only_candidate() {
        let scheduler = Scheduler::new(3);
        let peer_bits = bitfield(&[true, false, false]);
        scheduler.register_peer(&peer_bits);
        let picked = scheduler.pick_piece(&peer_bits, &[0, 1, 2], &[]);
        assert_eq!(picked, Some(0));
    }

    #[test]
    fn never_picks_a_piece_the_peer_lacks() {
        let scheduler = Scheduler::new(2);
        let peer_bits = bitfield(&[true, false]);
        scheduler.register_peer(&peer_bits);
        for _ in 0..20 {
            assert_eq!(
                scheduler.pick_piece(&peer_bits, &[0, 1], &[]),
                Some(0)
            );
        }
    }

    #[test]
    fn prefers_the_rarer_piece() {
        let scheduler = Scheduler::new(2);
        // Piece 0 is common (both peers have it), piece 1 is rare (only
        // one peer has it).
        scheduler.register_peer(&bitfield(&[true, true]));
        scheduler.register_peer(&bitfield(&[true, false]));

        let peer_with_both = bitfield(&[true, true]);
        let picked = scheduler.pick_piece(&peer_with_both, &[0, 1], &[]);
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn prefers_a_partially_reserved_piece_over_a_rarer_one() {
        let scheduler = Scheduler::new(2);
        // Piece 0 is common, piece 1 is rarer, so rarest-first alone would
        // pick piece 1 -- but piece 0 already has blocks in flight from
        // another session, so it should be preferred to avoid leaving it
        // half-downloaded forever.
        scheduler.register_peer(&bitfield(&[true, true]));
        scheduler.register_peer(&bitfield(&[true, false]));

        let peer_with_both = bitfield(&[true, true]);
        let picked =
            scheduler.pick_piece(&peer_with_both, &[0, 1], &[0]);
        assert_eq!(picked, Some(0));
    }

    #[test]
    fn ignores_a_partially_reserved_piece_the_peer_lacks() {
        let scheduler = Scheduler::new(2);
        scheduler.register_peer(&bitfield(&[false, true]));

        // Piece 0 is partially reserved, but this peer doesn't have it, so
        // the only real candidate is piece 1.
        let peer_bits = bitfield(&[false, true]);
        let picked = scheduler.pick_piece(&peer_bits, &[0, 1], &[0]);
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn unregister_reverses_registration() {
        let scheduler = Scheduler::new(1);
        let bits = bitfield(&[true]);
        scheduler.register_peer(&bits);
        scheduler.unregister_peer(&bits);
        assert_eq!(scheduler.counts.lock().unwrap().availability[0], 0);
    }
}
