use std::fmt;

use crate::{connection::Connection, name::Name};

/// Decides whether a connection may own a name.
///
/// Consulted by the bus before a request reaches the registry; the registry
/// itself never evaluates policy. Implementations must not call back into
/// the bus.
pub trait Policy: fmt::Debug + Send + Sync {
    fn can_own(&self, conn: &Connection, name: &Name) -> bool;
}

/// The default policy: every connection may own every name.
#[derive(Debug, Default)]
pub struct AllowAll;

impl Policy for AllowAll {
    fn can_own(&self, _conn: &Connection, _name: &Name) -> bool {
        true
    }
}
