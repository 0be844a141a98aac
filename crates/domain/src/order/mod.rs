//! Order rows, line items and their status machines.

mod model;
mod state;
mod value_objects;

pub use model::{Order, OrderItem};
pub use state::{OrderStatus, PaymentStatus};
pub use value_objects::{Money, PaymentMethod};
