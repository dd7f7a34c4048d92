//! The six grid directions.

use crate::HexCoordinate;

/// A direction from a cell to one of its six neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    East,
    NorthEast,
    NorthWest,
    West,
    SouthWest,
    SouthEast,
}

impl Direction {
    /// All directions in slot order.
    pub const ALL: [Direction; 6] = [
        Direction::East,
        Direction::NorthEast,
        Direction::NorthWest,
        Direction::West,
        Direction::SouthWest,
        Direction::SouthEast,
    ];

    /// Slot index of this direction (0-5).
    pub const fn index(self) -> usize {
        match self {
            Direction::East => 0,
            Direction::NorthEast => 1,
            Direction::NorthWest => 2,
            Direction::West => 3,
            Direction::SouthWest => 4,
            Direction::SouthEast => 5,
        }
    }

    /// Direction for a slot index, if in range.
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < Self::ALL.len() {
            Some(Self::ALL[index])
        } else {
            None
        }
    }

    /// Unit offset `(dq, dr)` of this direction.
    pub const fn offset(self) -> HexCoordinate {
        match self {
            Direction::East => HexCoordinate::new(1, 0),
            Direction::NorthEast => HexCoordinate::new(1, -1),
            Direction::NorthWest => HexCoordinate::new(0, -1),
            Direction::West => HexCoordinate::new(-1, 0),
            Direction::SouthWest => HexCoordinate::new(-1, 1),
            Direction::SouthEast => HexCoordinate::new(0, 1),
        }
    }

    /// The direction pointing the other way.
    pub const fn opposite(self) -> Self {
        Self::ALL[(self.index() + 3) % 6]
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Direction::East => "east",
            Direction::NorthEast => "northeast",
            Direction::NorthWest => "northwest",
            Direction::West => "west",
            Direction::SouthWest => "southwest",
            Direction::SouthEast => "southeast",
        };
        f.write_str(name)
    }
}
