//! Connection and channel states and channel ordering.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The ordering of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Order {
    /// Packets may be received in any order.
    Unordered,
    /// Packets must be received in sequence order.
    Ordered,
}

impl Order {
    /// The `ibc.core.channel.v1.Order` value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        match self {
            Self::Unordered => 1,
            Self::Ordered => 2,
        }
    }

    /// Maps the protobuf enum value, `None` for `ORDER_NONE_UNSPECIFIED` or unknown values.
    #[must_use]
    pub const fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Unordered),
            2 => Some(Self::Ordered),
            _ => None,
        }
    }

    /// The name used in `packet_channel_ordering` attributes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unordered => "ORDER_UNORDERED",
            Self::Ordered => "ORDER_ORDERED",
        }
    }
}

macro_rules! handshake_state {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            /// Default state, the object does not exist.
            Uninitialized,
            /// The first handshake step was executed on this chain.
            Init,
            /// The second handshake step was executed on this chain.
            TryOpen,
            /// The handshake completed.
            Open,
            /// The object was closed.
            Closed,
        }

        impl $name {
            /// Whether the handshake completed.
            #[must_use]
            pub const fn is_open(self) -> bool {
                matches!(self, Self::Open)
            }

            /// The protobuf enum value.
            #[must_use]
            pub const fn as_i32(self) -> i32 {
                match self {
                    Self::Uninitialized => 0,
                    Self::Init => 1,
                    Self::TryOpen => 2,
                    Self::Open => 3,
                    Self::Closed => 4,
                }
            }
        }

        impl From<i32> for $name {
            fn from(value: i32) -> Self {
                match value {
                    1 => Self::Init,
                    2 => Self::TryOpen,
                    3 => Self::Open,
                    4 => Self::Closed,
                    _ => Self::Uninitialized,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    Self::Uninitialized => "UNINITIALIZED",
                    Self::Init => "INIT",
                    Self::TryOpen => "TRYOPEN",
                    Self::Open => "OPEN",
                    Self::Closed => "CLOSED",
                };
                f.write_str(name)
            }
        }
    };
}

handshake_state!(
    /// The state of a connection end.
    ConnectionState
);
handshake_state!(
    /// The state of a channel end.
    ChannelState
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_map_from_proto_values() {
        assert_eq!(ConnectionState::from(2), ConnectionState::TryOpen);
        assert_eq!(ChannelState::from(3), ChannelState::Open);
        assert!(ChannelState::from(3).is_open());
        assert_eq!(ConnectionState::from(42), ConnectionState::Uninitialized);
        assert_eq!(Order::from_i32(Order::Ordered.as_i32()), Some(Order::Ordered));
        assert_eq!(Order::from_i32(0), None);
    }
}
