//! Cube coordinates on the hexagonal grid.
//!
//! The third axis `s = -q - r` is computed on demand, never stored. Values
//! are plain `i64`; arithmetic at magnitudes near `i64::MAX` is outside the
//! supported range.

use std::ops::{Add, Neg, Sub};

use crate::Direction;

/// A cell of the hexagonal grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HexCoordinate {
    q: i64,
    r: i64,
}

impl HexCoordinate {
    /// Origin of the grid. Genesis sits here.
    pub const ORIGIN: Self = Self { q: 0, r: 0 };

    /// Create a coordinate from its two free axes.
    pub const fn new(q: i64, r: i64) -> Self {
        Self { q, r }
    }

    /// Create a coordinate from all three axes, rejecting `q + r + s != 0`.
    pub const fn from_cube(q: i64, r: i64, s: i64) -> Option<Self> {
        if q + r + s == 0 {
            Some(Self { q, r })
        } else {
            None
        }
    }

    pub const fn q(&self) -> i64 {
        self.q
    }

    pub const fn r(&self) -> i64 {
        self.r
    }

    /// The derived third axis.
    pub const fn s(&self) -> i64 {
        -self.q - self.r
    }

    /// Grid distance: `(|dq| + |dr| + |ds|) / 2`.
    pub fn distance(&self, other: &Self) -> u64 {
        let dq = self.q - other.q;
        let dr = self.r - other.r;
        let ds = self.s() - other.s();
        (dq.unsigned_abs() + dr.unsigned_abs() + ds.unsigned_abs()) / 2
    }

    /// Distance from the origin.
    pub fn ring(&self) -> u64 {
        self.distance(&Self::ORIGIN)
    }

    /// The adjacent cell in `dir`.
    pub fn neighbor(&self, dir: Direction) -> Self {
        *self + dir.offset()
    }

    /// All six adjacent cells in slot order (E, NE, NW, W, SW, SE).
    pub fn neighbors(&self) -> [Self; 6] {
        Direction::ALL.map(|d| self.neighbor(d))
    }

    /// Direction from `self` to `other` when the two are adjacent.
    pub fn direction_to(&self, other: &Self) -> Option<Direction> {
        let delta = *other - *self;
        Direction::ALL.into_iter().find(|d| d.offset() == delta)
    }
}

/// True when `a` and `b` are exactly one step apart.
pub fn is_adjacent(a: &HexCoordinate, b: &HexCoordinate) -> bool {
    a.distance(b) == 1
}

impl Add for HexCoordinate {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self {
            q: self.q + other.q,
            r: self.r + other.r,
        }
    }
}

impl Sub for HexCoordinate {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Self {
            q: self.q - other.q,
            r: self.r - other.r,
        }
    }
}

impl Neg for HexCoordinate {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        Self {
            q: -self.q,
            r: -self.r,
        }
    }
}

impl std::fmt::Display for HexCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.q, self.r, self.s())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn coord() -> impl Strategy<Value = HexCoordinate> {
        (-1_000_000i64..1_000_000, -1_000_000i64..1_000_000)
            .prop_map(|(q, r)| HexCoordinate::new(q, r))
    }

    #[test]
    fn origin_neighbors_in_slot_order() {
        let expected = [(1, 0), (1, -1), (0, -1), (-1, 0), (-1, 1), (0, 1)]
            .map(|(q, r)| HexCoordinate::new(q, r));
        assert_eq!(HexCoordinate::ORIGIN.neighbors(), expected);
    }

    #[test]
    fn distance_examples() {
        let a = HexCoordinate::new(0, 0);
        assert_eq!(a.distance(&HexCoordinate::new(2, -1)), 2);
        assert_eq!(a.distance(&HexCoordinate::new(1, -1)), 1);
        assert_eq!(a.distance(&HexCoordinate::new(3, 3)), 6);
        assert_eq!(HexCoordinate::new(1, 1).ring(), 2);
    }

    #[test]
    fn from_cube_enforces_constraint() {
        assert_eq!(HexCoordinate::from_cube(1, -1, 0), Some(HexCoordinate::new(1, -1)));
        assert_eq!(HexCoordinate::from_cube(1, 1, 1), None);
    }

    #[test]
    fn direction_to_neighbor() {
        let c = HexCoordinate::new(4, -2);
        for dir in Direction::ALL {
            assert_eq!(c.direction_to(&c.neighbor(dir)), Some(dir));
        }
        assert_eq!(c.direction_to(&c), None);
        assert_eq!(c.direction_to(&HexCoordinate::new(6, -2)), None);
    }

    #[test]
    fn display_includes_derived_axis() {
        assert_eq!(HexCoordinate::new(2, -1).to_string(), "(2, -1, -1)");
    }

    proptest! {
        #[test]
        fn cube_constraint_holds(c in coord()) {
            prop_assert_eq!(c.q() + c.r() + c.s(), 0);
        }

        #[test]
        fn distance_is_a_metric(a in coord(), b in coord(), c in coord()) {
            prop_assert_eq!(a.distance(&b), b.distance(&a));
            prop_assert_eq!(a.distance(&a), 0);
            prop_assert!(a.distance(&c) <= a.distance(&b) + b.distance(&c));
        }

        #[test]
        fn neighbors_are_distinct_and_adjacent(c in coord()) {
            let n = c.neighbors();
            for (i, x) in n.iter().enumerate() {
                prop_assert!(is_adjacent(&c, x));
                for y in &n[i + 1..] {
                    prop_assert_ne!(x, y);
                }
            }
        }

        #[test]
        fn translation_preserves_distance(a in coord(), b in coord(), t in coord()) {
            prop_assert_eq!((a + t).distance(&(b + t)), a.distance(&b));
            prop_assert_eq!(a - b, a + (-b));
        }
    }
}
