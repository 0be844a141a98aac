use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a UUID-backed identifier newtype.
///
/// Each identifier is its own type so that an order id can never be passed
/// where a checkout session id is expected.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Returns true for the all-zero UUID, which is treated as "no id".
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a local order.
    OrderId
);

uuid_id!(
    /// Unique identifier for a shopper.
    UserId
);

uuid_id!(
    /// Unique identifier for a checkout session (the owner of reservations).
    CheckoutSessionId
);

uuid_id!(
    /// Unique identifier for a catalog product.
    ProductId
);

uuid_id!(
    /// Unique identifier for a stored shipping address.
    AddressId
);

uuid_id!(
    /// Unique identifier for a reservation row.
    ReservationId
);

uuid_id!(
    /// Unique identifier for a queued compensation record.
    CompensationId
);

/// Composite key of a stock unit: one product in one color and one size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockUnitKey {
    pub product_id: ProductId,
    pub color_id: i32,
    pub size_id: i32,
}

impl StockUnitKey {
    /// Creates a stock unit key.
    pub fn new(product_id: ProductId, color_id: i32, size_id: i32) -> Self {
        Self {
            product_id,
            color_id,
            size_id,
        }
    }

    /// Returns true if every component of the key is usable.
    pub fn is_well_formed(&self) -> bool {
        !self.product_id.is_nil() && self.color_id >= 0 && self.size_id >= 0
    }
}

impl std::fmt::Display for StockUnitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.product_id, self.color_id, self.size_id)
    }
}
