use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use enumflags2::BitFlags;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

use crate::{
    connection::{Connection, ConnectionFlag, Message},
    error::{Error, Result},
    list::{ListFlag, ListSlice},
    name::Name,
    name_registry::{AcquireReply, ChangeLog, NameFlag, NameOwnerChanged, NameRegistry},
    policy::{AllowAll, Policy},
    pool::Pool,
};

/// Most names one connection may own at a time.
pub const MAX_NAMES_PER_CONNECTION: usize = 256;

/// The bus: the connection index, the name registry and the request layer
/// in front of both.
///
/// The index lock is only ever taken to resolve ids or snapshot the
/// connection list and is never held while the registry lock is held.
#[derive(Debug)]
pub struct Bus {
    connections: RwLock<BTreeMap<u64, Arc<Connection>>>,
    name_registry: NameRegistry,
    next_id: AtomicU64,
    policy: Box<dyn Policy>,
    changes_tx: UnboundedSender<NameOwnerChanged>,
    /// Spans each mutating registry call and the flush of its change log,
    /// so that broadcast order cannot diverge from registry order when two
    /// requests race between registry unlock and flush. Ordered before the
    /// registry lock; delivery itself still happens with the registry lock
    /// released.
    notify_lock: Mutex<()>,
}

impl Bus {
    /// Creates a bus, returning it together with the receiving end of its
    /// ownership-change broadcast. Events arrive on the channel in registry
    /// serialization order.
    pub fn new() -> (Self, UnboundedReceiver<NameOwnerChanged>) {
        Self::with_policy(AllowAll)
    }

    pub fn with_policy(
        policy: impl Policy + 'static,
    ) -> (Self, UnboundedReceiver<NameOwnerChanged>) {
        let (changes_tx, changes_rx) = unbounded_channel();
        (
            Self {
                connections: RwLock::new(BTreeMap::new()),
                name_registry: NameRegistry::new(),
                // Id 0 encodes "no owner" in events and list records.
                next_id: AtomicU64::new(1),
                policy: Box::new(policy),
                changes_tx,
                notify_lock: Mutex::new(()),
            },
            changes_rx,
        )
    }

    /// Attaches a new ordinary connection.
    pub fn connect(&self) -> Arc<Connection> {
        self.add_connection(BitFlags::empty())
    }

    /// Attaches a new activator connection: names it acquires are sponsored
    /// by it and handed back to it when their transient owners go away.
    pub fn connect_activator(&self) -> Arc<Connection> {
        self.add_connection(ConnectionFlag::Activator.into())
    }

    fn add_connection(&self, flags: BitFlags<ConnectionFlag>) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, flags));
        self.connections.write().insert(id, conn.clone());
        debug!(id, ?flags, "accepted connection");

        conn
    }

    /// Detaches `conn`: removes it from the index and evicts it from the
    /// registry — its owned names pass to their successors or disappear,
    /// its queued waits are cancelled, its sponsorships end.
    pub fn disconnect(&self, conn: &Arc<Connection>) {
        // Close first so no new entry can be indexed for it; eviction then
        // sweeps everything that existed before this point.
        conn.close();
        self.connections.write().remove(&conn.id());

        let mut log = ChangeLog::new();
        let order = self.notify_lock.lock();
        self.name_registry.evict_owner(conn, &mut log);
        self.flush(log, order);
        debug!(id = conn.id(), "connection removed");
    }

    /// Resolves a connection id.
    pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    /// Asks for ownership of `name` on behalf of `conn`.
    pub fn acquire_name(
        &self,
        conn: &Arc<Connection>,
        name: &str,
        flags: BitFlags<NameFlag>,
    ) -> Result<AcquireReply> {
        let name = Name::try_from(name)?;
        if conn.owned_count() >= MAX_NAMES_PER_CONNECTION {
            return Err(Error::TooManyNames);
        }
        if !self.policy.can_own(conn, &name) {
            return Err(Error::PermissionDenied);
        }

        let mut log = ChangeLog::new();
        let order = self.notify_lock.lock();
        let reply = self.name_registry.acquire(conn, name, flags, &mut log);
        self.flush(log, order);

        reply
    }

    /// Gives up ownership of `name`, or cancels a queued wait for it.
    pub fn release_name(&self, conn: &Arc<Connection>, name: &str) -> Result<()> {
        let name = Name::try_from(name)?;

        let mut log = ChangeLog::new();
        let order = self.notify_lock.lock();
        let result = self.name_registry.release(&name, conn, &mut log);
        self.flush(log, order);

        result
    }

    /// Privileged variant of [`acquire_name`](Self::acquire_name) acting on
    /// behalf of the connection with id `target`.
    pub fn acquire_name_as(
        &self,
        target: u64,
        name: &str,
        flags: BitFlags<NameFlag>,
    ) -> Result<AcquireReply> {
        let conn = self.connection(target).ok_or(Error::NoConn(target))?;
        self.acquire_name(&conn, name, flags)
    }

    /// Privileged variant of [`release_name`](Self::release_name).
    pub fn release_name_as(&self, target: u64, name: &str) -> Result<()> {
        let conn = self.connection(target).ok_or(Error::NoConn(target))?;
        self.release_name(&conn, name)
    }

    /// Id of the connection currently owning `name`.
    pub fn name_owner(&self, name: &str) -> Option<u64> {
        self.name_registry.lookup(name).map(|conn| conn.id())
    }

    /// Ids of the connections queued on `name`, oldest first.
    pub fn queued_owners(&self, name: &str) -> Result<Vec<u64>> {
        self.name_registry
            .waiting_list(name)
            .ok_or_else(|| Error::NameNotFound(name.to_string()))
    }

    /// Queues a message at the connection with id `target`.
    pub fn send_to_id(&self, sender: &Arc<Connection>, target: u64, body: Vec<u8>) -> Result<()> {
        let conn = self.connection(target).ok_or(Error::NoConn(target))?;
        conn.queue_message(Message {
            sender: sender.id(),
            body,
        })
    }

    /// Queues a message at the current owner of `name`. While an activator
    /// holds the name, messages park at the activator and follow the name
    /// to whichever connection takes it over.
    pub fn send_to_name(&self, sender: &Arc<Connection>, name: &str, body: Vec<u8>) -> Result<()> {
        let owner = self
            .name_registry
            .lookup(name)
            .ok_or_else(|| Error::NameNotFound(name.to_string()))?;
        owner.queue_message(Message {
            sender: sender.id(),
            body,
        })
    }

    /// Serializes the connection/name listing selected by `flags` into
    /// `pool`, returning where it landed.
    pub fn list(&self, flags: BitFlags<ListFlag>, pool: &mut Pool) -> Result<ListSlice> {
        // Snapshot under the index lock alone; the registry lock is taken
        // only after it is released.
        let connections: Vec<_> = self.connections.read().values().cloned().collect();

        self.name_registry.list(&connections, flags, pool)
    }

    pub fn name_registry(&self) -> &NameRegistry {
        &self.name_registry
    }

    /// Broadcasts accumulated changes. Runs after the registry lock has
    /// been dropped, still inside the ordering gate taken before the
    /// registry call.
    fn flush(&self, mut log: ChangeLog, order: MutexGuard<'_, ()>) {
        for event in log.drain() {
            trace!(?event, "name owner changed");
            if self.changes_tx.send(event).is_err() {
                // Nobody holds the receiver anymore; drop the rest.
                break;
            }
        }
        drop(order);
    }
}
