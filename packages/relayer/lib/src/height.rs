//! IBC heights and packet timeout heights.

use std::{fmt, str::FromStr};

use ibc_proto::ibc::core::client::v1::Height as RawHeight;
use serde::{Deserialize, Serialize};

use crate::error::ChainError;

/// A height on a revisioned chain. Ordered by revision number, then block height.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Height {
    /// The chain revision, taken from the `-{N}` suffix of the chain id.
    pub revision_number: u64,
    /// The block height within the revision.
    pub revision_height: u64,
}

impl Height {
    /// Creates a new [`Height`].
    #[must_use]
    pub const fn new(revision_number: u64, revision_height: u64) -> Self {
        Self {
            revision_number,
            revision_height,
        }
    }

    /// Returns the height `blocks` blocks later in the same revision.
    #[must_use]
    pub const fn add_blocks(self, blocks: u64) -> Self {
        Self::new(self.revision_number, self.revision_height + blocks)
    }

    /// Returns the height one block earlier. Proofs for header `h` are queried here.
    ///
    /// # Errors
    /// Returns [`ChainError::InvalidHeight`] for the first block of a revision.
    pub fn decrement(self) -> Result<Self, ChainError> {
        self.revision_height
            .checked_sub(1)
            .filter(|h| *h > 0)
            .map(|h| Self::new(self.revision_number, h))
            .ok_or_else(|| ChainError::InvalidHeight(format!("cannot decrement {self}")))
    }

    /// Whether this is the zero height, which IBC uses to mean "unset".
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.revision_number == 0 && self.revision_height == 0
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.revision_number, self.revision_height)
    }
}

impl FromStr for Height {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ChainError::InvalidHeight(s.to_string());
        let (number, height) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self::new(
            number.parse().map_err(|_| invalid())?,
            height.parse().map_err(|_| invalid())?,
        ))
    }
}

impl From<RawHeight> for Height {
    fn from(raw: RawHeight) -> Self {
        Self::new(raw.revision_number, raw.revision_height)
    }
}

impl From<&RawHeight> for Height {
    fn from(raw: &RawHeight) -> Self {
        Self::new(raw.revision_number, raw.revision_height)
    }
}

impl From<Height> for RawHeight {
    fn from(height: Height) -> Self {
        Self {
            revision_number: height.revision_number,
            revision_height: height.revision_height,
        }
    }
}

/// The timeout height of a packet.
///
/// `Never` sorts after every concrete height, so `timeout > cutoff` reads as
/// "still valid at `cutoff`".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TimeoutHeight {
    /// The packet times out once the destination reaches this height.
    At(Height),
    /// The packet has no height based timeout.
    #[default]
    Never,
}

impl TimeoutHeight {
    /// Whether a destination at `height` can no longer receive the packet.
    #[must_use]
    pub fn has_expired(&self, height: Height) -> bool {
        match self {
            Self::At(timeout) => *timeout <= height,
            Self::Never => false,
        }
    }

    /// The concrete timeout height, if any.
    #[must_use]
    pub const fn height(&self) -> Option<Height> {
        match self {
            Self::At(height) => Some(*height),
            Self::Never => None,
        }
    }
}

impl fmt::Display for TimeoutHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::At(height) => write!(f, "{height}"),
            Self::Never => f.write_str("0-0"),
        }
    }
}

impl From<Height> for TimeoutHeight {
    fn from(height: Height) -> Self {
        if height.is_zero() {
            Self::Never
        } else {
            Self::At(height)
        }
    }
}

impl From<Option<Height>> for TimeoutHeight {
    fn from(height: Option<Height>) -> Self {
        height.map_or(Self::Never, Into::into)
    }
}

impl From<Option<RawHeight>> for TimeoutHeight {
    fn from(raw: Option<RawHeight>) -> Self {
        raw.map(Height::from).into()
    }
}

impl From<TimeoutHeight> for Option<RawHeight> {
    fn from(timeout: TimeoutHeight) -> Self {
        Some(timeout.height().unwrap_or_default().into())
    }
}

impl FromStr for TimeoutHeight {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Height>().map(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Height::new(1, 10), Height::new(1, 11))]
    #[case(Height::new(1, 999), Height::new(2, 1))]
    #[case(Height::new(0, 5), Height::new(1, 0))]
    fn heights_order_by_revision_first(#[case] lower: Height, #[case] higher: Height) {
        assert!(lower < higher);
        assert!(higher > lower);
        assert_ne!(lower, higher);
    }

    #[test]
    fn equal_heights_are_neither_greater_nor_smaller() {
        let a = Height::new(3, 7);
        let b = Height::new(3, 7);
        assert_eq!(a, b);
        assert!(!(a < b) && !(a > b));
    }

    #[test]
    fn never_is_greater_than_any_height() {
        let far = TimeoutHeight::At(Height::new(u64::MAX, u64::MAX));
        assert!(TimeoutHeight::Never > far);
        assert!(TimeoutHeight::At(Height::new(1, 20)) > TimeoutHeight::At(Height::new(1, 19)));
    }

    #[test]
    fn zero_height_means_no_timeout() {
        let raw = RawHeight {
            revision_number: 0,
            revision_height: 0,
        };
        assert_eq!(TimeoutHeight::from(Some(raw)), TimeoutHeight::Never);
        assert_eq!(TimeoutHeight::from(None::<RawHeight>), TimeoutHeight::Never);
        assert_eq!("0-0".parse::<TimeoutHeight>().unwrap(), TimeoutHeight::Never);
    }

    #[test]
    fn height_display_and_parse() {
        let height: Height = "1-1234".parse().unwrap();
        assert_eq!(height, Height::new(1, 1234));
        assert_eq!(height.to_string(), "1-1234");
        assert!("1234".parse::<Height>().is_err());
        assert!("a-1".parse::<Height>().is_err());
    }

    #[test]
    fn expiry_is_inclusive() {
        let timeout = TimeoutHeight::At(Height::new(1, 10));
        assert!(!timeout.has_expired(Height::new(1, 9)));
        assert!(timeout.has_expired(Height::new(1, 10)));
        assert!(!TimeoutHeight::Never.has_expired(Height::new(9, 9)));
    }

    #[test]
    fn decrement_stops_at_first_block() {
        assert_eq!(Height::new(1, 5).decrement().unwrap(), Height::new(1, 4));
        assert!(Height::new(1, 1).decrement().is_err());
    }
}
