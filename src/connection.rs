use std::collections::{HashSet, VecDeque};

use enumflags2::{bitflags, BitFlags};
use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    name::Name,
};

/// Capacity of a connection's inbox, in messages.
pub const MAX_QUEUED_MESSAGES: usize = 256;

/// Properties of a connection, fixed at connect time.
#[bitflags]
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionFlag {
    /// The connection sponsors names: entries it creates survive transient
    /// owners and are handed back to it on release.
    Activator = 1,
}

/// A message queued at a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Id of the sending connection.
    pub sender: u64,
    pub body: Vec<u8>,
}

/// One attached client of the bus.
///
/// The registry back-references (`state`) and the inbox have their own
/// locks. Both nest inside the registry lock; the registry never holds
/// either while reacquiring its own.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    flags: BitFlags<ConnectionFlag>,
    state: Mutex<ConnectionState>,
    inbox: Mutex<VecDeque<Message>>,
}

/// The registry's per-connection bookkeeping, guarded by the connection
/// lock. Entries hold the owning references; these sets are back-references
/// keyed by name so that teardown can splice them out in O(presence).
///
/// `closed` lives under the same lock as the sets: closing and linking are
/// thereby mutually exclusive, so a link that succeeded is guaranteed to be
/// observed by the teardown splice, and a link attempted after the splice
/// is refused.
#[derive(Debug, Default)]
struct ConnectionState {
    closed: bool,
    owned: HashSet<Name>,
    queued: HashSet<Name>,
    activating: HashSet<Name>,
}

/// Names spliced out of a dying connection, processed under the registry
/// lock afterwards.
#[derive(Debug)]
pub(crate) struct DrainedNames {
    pub(crate) owned: Vec<Name>,
    pub(crate) queued: Vec<Name>,
    pub(crate) activating: Vec<Name>,
}

impl Connection {
    pub(crate) fn new(id: u64, flags: BitFlags<ConnectionFlag>) -> Self {
        Self {
            id,
            flags,
            state: Mutex::new(ConnectionState::default()),
            inbox: Mutex::new(VecDeque::new()),
        }
    }

    /// The connection's bus-unique 64-bit id. Id 0 is never assigned; it is
    /// the "no owner" encoding in list records and events.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn flags(&self) -> BitFlags<ConnectionFlag> {
        self.flags
    }

    pub fn is_activator(&self) -> bool {
        self.flags.contains(ConnectionFlag::Activator)
    }

    /// Whether the connection has been disconnected from its bus. A closed
    /// connection can no longer acquire names. Closure shares the
    /// connection lock with the back-reference sets, so once this returns
    /// `true` no further link can succeed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
    }

    /// Number of names the connection currently owns.
    pub fn owned_count(&self) -> usize {
        self.state.lock().owned.len()
    }

    /// Snapshot of the names the connection currently owns.
    pub fn owned_names(&self) -> Vec<Name> {
        self.state.lock().owned.iter().cloned().collect()
    }

    /// Snapshot of the names the connection is queued on.
    pub fn queued_names(&self) -> Vec<Name> {
        self.state.lock().queued.iter().cloned().collect()
    }

    /// Inserts `name` into the owned set, or refuses if the connection is
    /// already past [`close`](Self::close) or the teardown splice. Checking
    /// and inserting happen under one hold of the connection lock; callers
    /// that get `false` must back out instead of indexing registry state
    /// for a connection whose eviction will never see it.
    #[must_use]
    pub(crate) fn link_owned(&self, name: &Name) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.owned.insert(name.clone());

        true
    }

    pub(crate) fn unlink_owned(&self, name: &Name) {
        self.state.lock().owned.remove(name.as_str());
    }

    /// As [`link_owned`](Self::link_owned), for the queued-waits set.
    #[must_use]
    pub(crate) fn link_queued(&self, name: &Name) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.queued.insert(name.clone());

        true
    }

    pub(crate) fn unlink_queued(&self, name: &Name) {
        self.state.lock().queued.remove(name.as_str());
    }

    /// As [`link_owned`](Self::link_owned), for the sponsored-names set.
    #[must_use]
    pub(crate) fn link_activating(&self, name: &Name) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.activating.insert(name.clone());

        true
    }

    pub(crate) fn unlink_activating(&self, name: &Name) {
        self.state.lock().activating.remove(name.as_str());
    }

    /// Splices all registry back-references out in one go, under the
    /// connection lock alone. Holding this lock while taking the registry
    /// lock would invert the lock order, so the caller processes the
    /// returned names under the registry lock afterwards, treating them as
    /// hints to be re-checked.
    ///
    /// Also marks the connection closed under the same lock hold: no link
    /// can slip in behind the splice, so the returned lists are complete.
    pub(crate) fn drain_names(&self) -> DrainedNames {
        let mut state = self.state.lock();
        state.closed = true;
        DrainedNames {
            owned: state.owned.drain().collect(),
            queued: state.queued.drain().collect(),
            activating: state.activating.drain().collect(),
        }
    }

    /// Appends a message to the inbox.
    pub(crate) fn queue_message(&self, message: Message) -> Result<()> {
        let mut inbox = self.inbox.lock();
        if inbox.len() >= MAX_QUEUED_MESSAGES {
            return Err(Error::NoMem);
        }
        inbox.push_back(message);

        Ok(())
    }

    /// Takes the oldest queued message, if any.
    pub fn pop_message(&self) -> Option<Message> {
        self.inbox.lock().pop_front()
    }

    pub fn queued_messages(&self) -> usize {
        self.inbox.lock().len()
    }

    /// Moves every queued message to `dst`, preserving order.
    ///
    /// Either all messages move or none do: if `dst` lacks the room the
    /// inboxes are left untouched and the caller aborts its operation. The
    /// two inbox locks are taken in id order, the one ordering under which
    /// concurrent migrations cannot cross.
    pub(crate) fn move_messages_to(&self, dst: &Connection) -> Result<()> {
        if self.id == dst.id {
            return Ok(());
        }

        let (mut src_inbox, mut dst_inbox) = if self.id < dst.id {
            let src = self.inbox.lock();
            let dst = dst.inbox.lock();
            (src, dst)
        } else {
            let dst = dst.inbox.lock();
            let src = self.inbox.lock();
            (src, dst)
        };

        if dst_inbox.len() + src_inbox.len() > MAX_QUEUED_MESSAGES {
            return Err(Error::NoMem);
        }
        dst_inbox.extend(src_inbox.drain(..));

        Ok(())
    }
}
