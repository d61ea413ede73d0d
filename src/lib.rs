//! In-process, single-threaded message bus.
//!
//! Every message type gets a dense index from a [`TypeRegistry`] that is
//! built once. Messages carry that index in their [`MessageTag`], so
//! [`Bus::trigger`] reaches the handler chain of a type without a lookup.

mod bus;
pub mod error;
mod handler;
pub mod message;
pub mod observable;
pub mod registry;
mod token;
mod wait;

pub use bus::{Bus, WeakBus};
pub use error::Error;
pub use handler::{handler, ErasedHandler, Handler};
pub use message::{AsAny, Message, MessageTag, MessageType};
pub use observable::{MessageStream, Observable, Subscription};
pub use registry::{TypeIndex, TypeRegistry, TypeRegistryBuilder};
pub use token::{CompositeToken, ErasedToken, HandlerToken, TypedToken};
pub use tokio_util::sync::CancellationToken;
pub use wait::MessageWait;

pub mod derive {
    pub use tagbus_derive::Message;
}
