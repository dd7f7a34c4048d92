//! Hexchain Mesh Topology
//!
//! Every block in a Hexchain ledger occupies a cell of an unbounded hexagonal
//! grid. A block may reference up to six parents, one per adjacent cell, so
//! the grid geometry is what bounds and shapes the ledger's DAG.
//!
//! # Coordinates
//!
//! Cells are addressed with cube coordinates `(q, r, s)` constrained to
//! `q + r + s = 0`. Only `q` and `r` are stored; `s` is always derived, so
//! a coordinate that violates the constraint cannot be constructed.
//!
//! # Neighbor Order
//!
//! Neighbors are enumerated in a fixed order that doubles as the parent slot
//! index of a header:
//!
//! ```text
//! slot 0  East       (+1,  0)
//! slot 1  NorthEast  (+1, -1)
//! slot 2  NorthWest  ( 0, -1)
//! slot 3  West       (-1,  0)
//! slot 4  SouthWest  (-1, +1)
//! slot 5  SouthEast  ( 0, +1)
//! ```

mod direction;
mod hex;

pub use direction::Direction;
pub use hex::{is_adjacent, HexCoordinate};

/// Number of cells adjacent to any cell (and the maximum number of parents).
pub const NEIGHBOR_SLOTS: usize = 6;

const _: () = assert!(Direction::ALL.len() == NEIGHBOR_SLOTS);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_order_matches_directions() {
        let origin = HexCoordinate::ORIGIN;
        for (slot, dir) in Direction::ALL.iter().enumerate() {
            assert_eq!(origin.neighbors()[slot], origin.neighbor(*dir));
            assert_eq!(dir.index(), slot);
        }
    }
}
