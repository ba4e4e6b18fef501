use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use enumflags2::{bitflags, BitFlags};
use parking_lot::RwLock;
use serde::Serialize;

use crate::{
    connection::Connection,
    error::{Error, Result},
    list::{self, ListFlag, ListSlice},
    name::Name,
    pool::Pool,
};

/// Flags on a name, requested at acquire time and carried by the entry.
#[bitflags]
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum NameFlag {
    /// The owner consents to losing the name to a `ReplaceExisting` request.
    AllowReplacement = 1,
    /// Take the name over now if the owner allows it.
    ReplaceExisting = 1 << 1,
    /// Join the takeover queue when the name cannot be acquired outright.
    Queueable = 1 << 2,
    /// Output only: set on waiter records and on the reply to a queued
    /// request; masked out of requests and on promotion.
    InQueue = 1 << 3,
}

/// Status of a successful acquire request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireReply {
    /// The caller is now the primary owner of the name.
    PrimaryOwner,
    /// The caller already held the name; its flags were updated.
    AlreadyOwner,
    /// The caller was appended to the name's takeover queue.
    InQueue,
}

/// One ownership change.
///
/// `old_owner: None` encodes a newly indexed name, `new_owner: None` a name
/// that went away; both set is a transfer (takeover, waiter promotion or
/// activator rebind).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NameOwnerChanged {
    pub name: Name,
    pub old_owner: Option<u64>,
    pub new_owner: Option<u64>,
    pub flags: BitFlags<NameFlag>,
}

/// Ownership changes accumulated while the registry lock is held.
///
/// Broadcasting touches other connections and allocates, so the bus drains
/// the log only after the registry lock has been dropped; the log preserves
/// emission order, which is the registry serialization order.
#[derive(Debug, Default)]
pub struct ChangeLog {
    events: Vec<NameOwnerChanged>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, event: NameOwnerChanged) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[NameOwnerChanged] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = NameOwnerChanged> + '_ {
        self.events.drain(..)
    }
}

/// A connection holding or waiting for a name, together with the flags it
/// holds or requested it with.
#[derive(Clone, Debug)]
pub(crate) struct NameOwner {
    pub(crate) conn: Arc<Connection>,
    pub(crate) flags: BitFlags<NameFlag>,
}

/// The registry record for one currently-owned name.
#[derive(Clone, Debug)]
pub(crate) struct NameEntry {
    pub(crate) owner: NameOwner,
    /// Sponsor of the name: while set, the entry outlives transient owners
    /// and is handed back on release. Cleared only when the sponsor itself
    /// goes away.
    pub(crate) activator: Option<Arc<Connection>>,
    /// FIFO takeover queue; the head is next in line.
    pub(crate) waiting_list: VecDeque<NameOwner>,
}

/// Maps each well-known name to the connection owning it.
///
/// All entry state is guarded by the one registry-wide lock. Connection
/// locks nest inside it (owner-list linkage), and the bus index lock is
/// never held together with it.
#[derive(Clone, Debug, Default)]
pub struct NameRegistry {
    names: Arc<RwLock<HashMap<Name, NameEntry>>>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `name` for `conn`, resolving contention per `flags`.
    ///
    /// Appends any resulting ownership change to `log`. The caller is
    /// responsible for the preconditions (name validity via [`Name`],
    /// owned-name quota, policy).
    pub fn acquire(
        &self,
        conn: &Arc<Connection>,
        name: Name,
        mut flags: BitFlags<NameFlag>,
        log: &mut ChangeLog,
    ) -> Result<AcquireReply> {
        flags.remove(NameFlag::InQueue);

        let mut names = self.names.write();

        // Fast-path rejection of a connection already torn down. Only
        // advisory: closing is synchronized with the back-reference sets,
        // not with this lock, so the authoritative check is each link call
        // below refusing once the connection is past its teardown splice.
        if conn.is_closed() {
            return Err(Error::NoConn(conn.id()));
        }

        match names.get_mut(&name) {
            Some(entry) => {
                if entry.owner.conn.id() == conn.id() {
                    entry.owner.flags = flags;
                    Ok(AcquireReply::AlreadyOwner)
                } else {
                    Self::resolve_conflict(&name, entry, conn, flags, log)
                }
            }
            None => {
                // The link doubles as the closed check: refusal means the
                // teardown splice already ran and would never see this
                // entry, so it must not be indexed.
                if !conn.link_owned(&name) {
                    return Err(Error::NoConn(conn.id()));
                }
                // An activator never blocks a takeover of the name it
                // sponsors, whatever it asked for.
                let flags = if conn.is_activator() {
                    NameFlag::AllowReplacement.into()
                } else {
                    flags
                };
                let activator = (conn.is_activator() && conn.link_activating(&name))
                    .then(|| conn.clone());
                log.push(NameOwnerChanged {
                    name: name.clone(),
                    old_owner: None,
                    new_owner: Some(conn.id()),
                    flags,
                });
                names.insert(
                    name,
                    NameEntry {
                        owner: NameOwner {
                            conn: conn.clone(),
                            flags,
                        },
                        activator,
                        waiting_list: VecDeque::new(),
                    },
                );

                Ok(AcquireReply::PrimaryOwner)
            }
        }
    }

    /// The takeover state machine: the entry exists and belongs to someone
    /// else.
    fn resolve_conflict(
        name: &Name,
        entry: &mut NameEntry,
        conn: &Arc<Connection>,
        flags: BitFlags<NameFlag>,
        log: &mut ChangeLog,
    ) -> Result<AcquireReply> {
        if flags.contains(NameFlag::ReplaceExisting)
            && entry.owner.flags.contains(NameFlag::AllowReplacement)
        {
            // The requester's link comes first and doubles as its closed
            // check: a refusal means its teardown splice already ran and
            // would never see this ownership.
            if !conn.link_owned(name) {
                return Err(Error::NoConn(conn.id()));
            }

            // Migration is the only other fallible step; on failure the
            // link above is the one mutation to roll back, leaving the
            // entry exactly as found.
            if entry.owner.conn.is_activator() {
                if let Err(e) = entry.owner.conn.move_messages_to(conn) {
                    conn.unlink_owned(name);
                    return Err(e);
                }
            }

            if entry.owner.flags.contains(NameFlag::Queueable) {
                // The displaced owner rejoins at the back of the queue and
                // regains the name on a later release. The link refuses if
                // it is past teardown: its eviction would never see the
                // waiter record.
                if entry.owner.conn.link_queued(name) {
                    entry.waiting_list.push_back(NameOwner {
                        conn: entry.owner.conn.clone(),
                        flags: entry.owner.flags | NameFlag::InQueue,
                    });
                }
            }

            let old_id = entry.owner.conn.id();
            entry.owner.conn.unlink_owned(name);

            // The new owner may have been waiting in the queue until now.
            if let Some(pos) = entry
                .waiting_list
                .iter()
                .position(|waiter| waiter.conn.id() == conn.id())
            {
                if let Some(waiter) = entry.waiting_list.remove(pos) {
                    waiter.conn.unlink_queued(name);
                }
            }

            entry.owner = NameOwner {
                conn: conn.clone(),
                flags,
            };
            log.push(NameOwnerChanged {
                name: name.clone(),
                old_owner: Some(old_id),
                new_owner: Some(conn.id()),
                flags,
            });

            Ok(AcquireReply::PrimaryOwner)
        } else if flags.contains(NameFlag::Queueable) {
            match entry
                .waiting_list
                .iter_mut()
                .find(|waiter| waiter.conn.id() == conn.id())
            {
                // Re-requesting while queued updates the stored flags but
                // keeps the queue position.
                Some(waiter) => waiter.flags = flags | NameFlag::InQueue,
                None => {
                    // Refused once the requester is past its teardown
                    // splice; a waiter record added now would dangle.
                    if !conn.link_queued(name) {
                        return Err(Error::NoConn(conn.id()));
                    }
                    entry.waiting_list.push_back(NameOwner {
                        conn: conn.clone(),
                        flags: flags | NameFlag::InQueue,
                    });
                }
            }

            Ok(AcquireReply::InQueue)
        } else {
            Err(Error::NameExists(name.to_string()))
        }
    }

    /// Releases `conn`'s claim on `name`: ownership if it is the owner, its
    /// waiter record if it is queued.
    ///
    /// Cancelling a queued wait emits no event; releasing ownership emits
    /// whatever the successor resolution produces.
    pub fn release(&self, name: &Name, conn: &Arc<Connection>, log: &mut ChangeLog) -> Result<()> {
        let mut names = self.names.write();
        let entry = names
            .get_mut(name.as_str())
            .ok_or_else(|| Error::NameNotFound(name.to_string()))?;

        if entry.owner.conn.id() == conn.id() {
            if Self::release_entry(name, entry, log) {
                names.remove(name.as_str());
            }
            Ok(())
        } else if let Some(pos) = entry
            .waiting_list
            .iter()
            .position(|waiter| waiter.conn.id() == conn.id())
        {
            if let Some(waiter) = entry.waiting_list.remove(pos) {
                waiter.conn.unlink_queued(name);
            }
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    /// Detaches the current owner and resolves the successor: the oldest
    /// waiter if any, else the activator, else nobody. Returns `true` when
    /// the entry must be unindexed.
    fn release_entry(name: &Name, entry: &mut NameEntry, log: &mut ChangeLog) -> bool {
        let old_id = entry.owner.conn.id();
        entry.owner.conn.unlink_owned(name);

        while let Some(mut next) = entry.waiting_list.pop_front() {
            next.conn.unlink_queued(name);
            // The link refuses for a waiter past its teardown splice; its
            // eviction may already have run, so it must not be promoted.
            if !next.conn.link_owned(name) {
                continue;
            }
            next.flags.remove(NameFlag::InQueue);
            log.push(NameOwnerChanged {
                name: name.clone(),
                old_owner: Some(old_id),
                new_owner: Some(next.conn.id()),
                flags: next.flags,
            });
            entry.owner = next;

            return false;
        }

        let handback = entry
            .activator
            .as_ref()
            .filter(|activator| activator.id() != old_id)
            .cloned();
        if let Some(activator) = handback {
            // A sponsor past its teardown splice refuses the link; fall
            // through and let the entry go away instead.
            if activator.link_owned(name) {
                let flags = BitFlags::from(NameFlag::AllowReplacement);
                log.push(NameOwnerChanged {
                    name: name.clone(),
                    old_owner: Some(old_id),
                    new_owner: Some(activator.id()),
                    flags,
                });
                entry.owner = NameOwner {
                    conn: activator,
                    flags,
                };

                return false;
            }
        }

        if let Some(activator) = entry.activator.take() {
            activator.unlink_activating(name);
        }
        log.push(NameOwnerChanged {
            name: name.clone(),
            old_owner: Some(old_id),
            new_owner: None,
            flags: entry.owner.flags,
        });

        true
    }

    /// Removes every trace of `conn` on teardown: its waiter records, its
    /// owned entries (resolving successors as on release) and any activator
    /// bindings pointing at it.
    ///
    /// The per-connection lists are spliced out under the connection lock
    /// alone, then processed here under the registry lock; taking the
    /// connection lock inside the registry lock on this path would invert
    /// the order used by owner-list linkage. The spliced names are hints:
    /// ownership may have moved in between, so each is re-checked.
    pub fn evict_owner(&self, conn: &Arc<Connection>, log: &mut ChangeLog) {
        let drained = conn.drain_names();
        let mut names = self.names.write();

        for name in &drained.queued {
            let Some(entry) = names.get_mut(name.as_str()) else {
                continue;
            };
            if let Some(pos) = entry
                .waiting_list
                .iter()
                .position(|waiter| waiter.conn.id() == conn.id())
            {
                entry.waiting_list.remove(pos);
            }
        }

        for name in &drained.owned {
            let Some(entry) = names.get_mut(name.as_str()) else {
                continue;
            };
            if entry.owner.conn.id() != conn.id() {
                continue;
            }
            if Self::release_entry(name, entry, log) {
                names.remove(name.as_str());
            }
        }

        for name in &drained.activating {
            let Some(entry) = names.get_mut(name.as_str()) else {
                continue;
            };
            if entry
                .activator
                .as_ref()
                .is_some_and(|activator| activator.id() == conn.id())
            {
                entry.activator = None;
            }
        }
    }

    /// The connection currently owning `name`.
    pub fn lookup(&self, name: &str) -> Option<Arc<Connection>> {
        self.names.read().get(name).map(|e| e.owner.conn.clone())
    }

    /// Ids of the connections queued on `name`, oldest first. `None` if the
    /// name has no entry.
    pub fn waiting_list(&self, name: &str) -> Option<Vec<u64>> {
        self.names.read().get(name).map(|e| {
            e.waiting_list
                .iter()
                .map(|waiter| waiter.conn.id())
                .collect()
        })
    }

    /// Id of the activator sponsoring `name`, if any.
    pub fn activator(&self, name: &str) -> Option<u64> {
        self.names
            .read()
            .get(name)
            .and_then(|e| e.activator.as_ref().map(|a| a.id()))
    }

    /// All currently indexed names.
    pub fn all_names(&self) -> Vec<Name> {
        self.names.read().keys().cloned().collect()
    }

    /// Serializes the name and connection listing into `pool`.
    ///
    /// `connections` is the bus's connection snapshot (the bus index lock is
    /// never held together with the registry lock, so the bus snapshots
    /// first). The registry lock is held across both the sizing and the
    /// writing pass so they agree.
    pub fn list(
        &self,
        connections: &[Arc<Connection>],
        flags: BitFlags<ListFlag>,
        pool: &mut Pool,
    ) -> Result<ListSlice> {
        let names = self.names.read();
        list::write_into(&names, connections, flags, pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: u64) -> Arc<Connection> {
        Arc::new(Connection::new(id, BitFlags::empty()))
    }

    fn acquire(
        registry: &NameRegistry,
        conn: &Arc<Connection>,
        name: &str,
        flags: BitFlags<NameFlag>,
    ) -> Result<AcquireReply> {
        let mut log = ChangeLog::new();
        registry.acquire(conn, Name::try_from(name).unwrap(), flags, &mut log)
    }

    #[test]
    fn promotion_is_fifo() {
        let registry = NameRegistry::new();
        let owner = conn(1);
        let name = Name::try_from("com.example.Service").unwrap();

        let mut log = ChangeLog::new();
        registry
            .acquire(&owner, name.clone(), NameFlag::Queueable.into(), &mut log)
            .unwrap();

        let waiters: Vec<_> = (2..=4).map(conn).collect();
        for waiter in &waiters {
            assert_eq!(
                acquire(&registry, waiter, name.as_str(), NameFlag::Queueable.into()),
                Ok(AcquireReply::InQueue)
            );
        }
        assert_eq!(registry.waiting_list(name.as_str()), Some(vec![2, 3, 4]));

        // Each release promotes the longest-queued waiter.
        let mut log = ChangeLog::new();
        registry.release(&name, &owner, &mut log).unwrap();
        assert_eq!(registry.lookup(name.as_str()).unwrap().id(), 2);
        registry.release(&name, &waiters[0], &mut log).unwrap();
        assert_eq!(registry.lookup(name.as_str()).unwrap().id(), 3);
        assert_eq!(registry.waiting_list(name.as_str()), Some(vec![4]));
    }

    #[test]
    fn queued_rerequest_updates_flags_in_place() {
        let registry = NameRegistry::new();
        let owner = conn(1);
        let first = conn(2);
        let second = conn(3);
        let name = "x.y";

        acquire(&registry, &owner, name, BitFlags::empty()).unwrap();
        acquire(&registry, &first, name, NameFlag::Queueable.into()).unwrap();
        acquire(&registry, &second, name, NameFlag::Queueable.into()).unwrap();

        // Asking again must neither duplicate the waiter nor move it back.
        assert_eq!(
            acquire(
                &registry,
                &first,
                name,
                NameFlag::Queueable | NameFlag::ReplaceExisting
            ),
            Ok(AcquireReply::InQueue)
        );
        assert_eq!(registry.waiting_list(name), Some(vec![2, 3]));
    }

    #[test]
    fn takeover_drops_the_stale_waiter_record() {
        let registry = NameRegistry::new();
        let owner = conn(1);
        let challenger = conn(2);
        let name = "x.y";

        acquire(&registry, &owner, name, NameFlag::AllowReplacement.into()).unwrap();
        acquire(&registry, &challenger, name, NameFlag::Queueable.into()).unwrap();

        assert_eq!(
            acquire(
                &registry,
                &challenger,
                name,
                NameFlag::ReplaceExisting.into()
            ),
            Ok(AcquireReply::PrimaryOwner)
        );
        assert_eq!(registry.waiting_list(name), Some(vec![]));
        assert!(challenger.queued_names().is_empty());
        assert_eq!(challenger.owned_count(), 1);
    }

    #[test]
    fn closed_connections_cannot_acquire() {
        let registry = NameRegistry::new();
        let dying = conn(1);
        dying.close();
        assert_eq!(
            acquire(&registry, &dying, "a.b", BitFlags::empty()),
            Err(Error::NoConn(1))
        );
        assert!(registry.all_names().is_empty());
    }

    #[test]
    fn rejected_acquire_leaves_the_log_untouched() {
        let registry = NameRegistry::new();
        let owner = conn(1);
        let other = conn(2);
        let name = Name::try_from("x.y").unwrap();

        let mut log = ChangeLog::new();
        registry
            .acquire(&owner, name.clone(), BitFlags::empty(), &mut log)
            .unwrap();
        assert_eq!(log.events().len(), 1);

        let mut log = ChangeLog::new();
        assert_eq!(
            registry.acquire(&other, name, BitFlags::empty(), &mut log),
            Err(Error::NameExists("x.y".to_string()))
        );
        assert!(log.is_empty());
    }
}
