//! An in-process message bus.
//!
//! Connections attach to a [`Bus`], exchange byte messages by connection id
//! or by well-known name, and compete for name ownership through the
//! [`NameRegistry`]: the current owner of a name can be replaced (if it
//! consents), queued behind, or handed back to an activator connection that
//! sponsors the name. Every ownership change is broadcast, in registry
//! order, on the channel returned by [`Bus::new`].

pub mod bus;
pub mod connection;
pub mod error;
pub mod list;
pub mod name;
pub mod name_registry;
pub mod policy;
pub mod pool;
pub mod tracing_subscriber;

pub use bus::Bus;
pub use connection::{Connection, ConnectionFlag, Message};
pub use error::{Error, Result};
pub use list::{ListFlag, ListSlice};
pub use name::Name;
pub use name_registry::{AcquireReply, ChangeLog, NameFlag, NameOwnerChanged, NameRegistry};
pub use policy::{AllowAll, Policy};
pub use pool::Pool;
