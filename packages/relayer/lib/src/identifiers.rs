//! String identifiers used by IBC.

use std::{convert::Infallible, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps the given string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// The identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self::new(s))
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }
    };
}

define_id!(
    /// The chain id as reported by the Tendermint node, e.g. `osmosis-1`.
    ChainId
);
define_id!(
    /// A light client identifier, e.g. `07-tendermint-0`.
    ClientId
);
define_id!(
    /// A connection identifier, e.g. `connection-0`.
    ConnectionId
);
define_id!(
    /// A port identifier, e.g. `transfer`.
    PortId
);
define_id!(
    /// A channel identifier, e.g. `channel-0`.
    ChannelId
);

impl ChainId {
    /// The revision number encoded as a trailing `-{N}`, or 0 when there is none.
    #[must_use]
    pub fn revision_number(&self) -> u64 {
        self.0
            .rsplit_once('-')
            .and_then(|(_, suffix)| suffix.parse().ok())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("osmosis-1", 1)]
    #[case("evmos_9000-4", 4)]
    #[case("simd-testing", 0)]
    #[case("testing", 0)]
    fn revision_number_from_chain_id(#[case] chain_id: &str, #[case] revision: u64) {
        assert_eq!(ChainId::new(chain_id).revision_number(), revision);
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = ChannelId::new("channel-7");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"channel-7\"");
        assert_eq!(id.to_string(), "channel-7");
    }
}
