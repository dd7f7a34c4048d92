//! Mesh topology checks.
//!
//! Deeper cycles need no search: parent numbers strictly decrease along
//! every edge (enforced before this stage), so only a parent that points
//! straight back at the candidate can close a loop.

use std::collections::HashSet;

use hexchain_core::{Hash, HexHeader};

use crate::error::TopologyError;

/// Structural checks on a candidate's parent set.
pub struct TopologyValidator;

impl TopologyValidator {
    /// Validate `candidate` against its resolved parents.
    ///
    /// `parents` holds `(slot, header)` for every parent that resolved.
    /// Checks run in order: self-reference, duplicate parents, immediate
    /// cycles, positional adjacency.
    pub fn validate(
        candidate: &HexHeader,
        candidate_hash: &Hash,
        parents: &[(usize, HexHeader)],
    ) -> Result<(), TopologyError> {
        for (slot, hash) in candidate.parents() {
            if hash == *candidate_hash {
                return Err(TopologyError::SelfReference { slot });
            }
        }

        let mut seen = HashSet::new();
        for (_, hash) in candidate.parents() {
            if !seen.insert(hash) {
                return Err(TopologyError::DuplicateParent { hash });
            }
        }

        for (_, parent) in parents {
            if parent.parents().any(|(_, gp)| gp == *candidate_hash) {
                return Err(TopologyError::Cycle {
                    parent: parent.hash(),
                });
            }
        }

        let adjacent = candidate.position.neighbors();
        for (slot, parent) in parents {
            if !adjacent.contains(&parent.position) {
                return Err(TopologyError::NonAdjacentParent {
                    slot: *slot,
                    parent: parent.position,
                    candidate: candidate.position,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexchain_core::{HexCoordinate, ValidatorId};

    fn header(number: u64, q: i64, r: i64) -> HexHeader {
        let mut h = HexHeader::genesis(100 + number, ValidatorId::default());
        h.number = number;
        h.position = HexCoordinate::new(q, r);
        h
    }

    fn with_parents(mut h: HexHeader, parents: &[&HexHeader]) -> (HexHeader, Vec<(usize, HexHeader)>) {
        let mut resolved = Vec::new();
        for (slot, p) in parents.iter().enumerate() {
            h.parent_hashes[slot] = Some(p.hash());
            resolved.push((slot, (*p).clone()));
        }
        h.neighbor_count = parents.len() as u8;
        (h, resolved)
    }

    #[test]
    fn adjacent_parents_pass() {
        let a = header(0, 0, 0);
        let b = header(1, 1, -1);
        let (c, parents) = with_parents(header(2, 1, 0), &[&a, &b]);
        TopologyValidator::validate(&c, &c.hash(), &parents).unwrap();
    }

    #[test]
    fn self_reference_wins_over_everything() {
        let a = header(0, 0, 0);
        let (mut c, parents) = with_parents(header(1, 5, 5), &[&a]);
        let fake_hash = Hash([0xee; 32]);
        c.parent_hashes[3] = Some(fake_hash);
        assert_eq!(
            TopologyValidator::validate(&c, &fake_hash, &parents),
            Err(TopologyError::SelfReference { slot: 3 })
        );
    }

    #[test]
    fn duplicate_parent() {
        let a = header(0, 0, 0);
        let (c, parents) = with_parents(header(1, 1, 0), &[&a, &a]);
        assert_eq!(
            TopologyValidator::validate(&c, &c.hash(), &parents),
            Err(TopologyError::DuplicateParent { hash: a.hash() })
        );
    }

    #[test]
    fn immediate_cycle() {
        let candidate_hash = Hash([0xcc; 32]);
        let mut parent = header(0, 0, 0);
        parent.parent_hashes[0] = Some(candidate_hash);
        let (c, parents) = with_parents(header(1, 1, 0), &[&parent]);
        assert_eq!(
            TopologyValidator::validate(&c, &candidate_hash, &parents),
            Err(TopologyError::Cycle { parent: parent.hash() })
        );
    }

    #[test]
    fn parent_two_steps_away_is_rejected() {
        let genesis = header(0, 0, 0);
        let b1 = header(1, 1, 0);
        let (b2, parents) = with_parents(header(2, 2, -1), &[&b1, &genesis]);
        assert_eq!(
            TopologyValidator::validate(&b2, &b2.hash(), &parents),
            Err(TopologyError::NonAdjacentParent {
                slot: 1,
                parent: HexCoordinate::ORIGIN,
                candidate: HexCoordinate::new(2, -1),
            })
        );
    }

    #[test]
    fn same_cell_is_not_adjacent() {
        let a = header(0, 3, 3);
        let (c, parents) = with_parents(header(1, 3, 3), &[&a]);
        assert!(matches!(
            TopologyValidator::validate(&c, &c.hash(), &parents),
            Err(TopologyError::NonAdjacentParent { .. })
        ));
    }
}
