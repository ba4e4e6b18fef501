use std::sync::{Arc, Barrier};

use anyhow::Result;
use enumflags2::BitFlags;
use inbus::{
    AcquireReply, Bus, Connection, Error, ListFlag, Name, NameFlag, Policy, Pool,
};
use ntest::timeout;
use rand::Rng;

#[test]
fn routes_messages_by_id_and_by_name() -> Result<()> {
    let (bus, _rx) = Bus::new();
    let c1 = bus.connect();
    let c2 = bus.connect();

    bus.send_to_id(&c1, c2.id(), b"direct".to_vec())?;
    assert_eq!(
        bus.send_to_id(&c1, 99, b"lost".to_vec()),
        Err(Error::NoConn(99))
    );

    bus.acquire_name(&c2, "com.example.Echo", BitFlags::empty())?;
    bus.send_to_name(&c1, "com.example.Echo", b"named".to_vec())?;
    assert_eq!(
        bus.send_to_name(&c1, "com.example.Mute", b"lost".to_vec()),
        Err(Error::NameNotFound("com.example.Mute".to_string()))
    );

    let first = c2.pop_message().expect("direct message");
    assert_eq!((first.sender, first.body), (c1.id(), b"direct".to_vec()));
    let second = c2.pop_message().expect("named message");
    assert_eq!((second.sender, second.body), (c1.id(), b"named".to_vec()));
    assert!(c2.pop_message().is_none());

    Ok(())
}

#[test]
fn acts_on_behalf_of_a_resolved_target() -> Result<()> {
    let (bus, _rx) = Bus::new();
    let c1 = bus.connect();

    assert_eq!(
        bus.acquire_name_as(42, "a.b", BitFlags::empty()),
        Err(Error::NoConn(42))
    );
    assert_eq!(
        bus.acquire_name_as(c1.id(), "a.b", BitFlags::empty())?,
        AcquireReply::PrimaryOwner
    );
    assert_eq!(bus.name_owner("a.b"), Some(c1.id()));

    bus.release_name_as(c1.id(), "a.b")?;
    assert_eq!(bus.name_owner("a.b"), None);
    assert_eq!(bus.release_name_as(7, "a.b"), Err(Error::NoConn(7)));

    Ok(())
}

#[derive(Debug)]
struct NoPrivateNames;

impl Policy for NoPrivateNames {
    fn can_own(&self, _conn: &Connection, name: &Name) -> bool {
        !name.as_str().starts_with("private.")
    }
}

#[test]
fn policy_refusal_is_permission_denied() -> Result<()> {
    let (bus, mut rx) = Bus::with_policy(NoPrivateNames);
    let c1 = bus.connect();

    assert_eq!(
        bus.acquire_name(&c1, "private.Area", BitFlags::empty()),
        Err(Error::PermissionDenied)
    );
    assert!(rx.try_recv().is_err());

    bus.acquire_name(&c1, "public.Area", BitFlags::empty())?;
    assert_eq!(bus.name_owner("public.Area"), Some(c1.id()));

    Ok(())
}

/// One parsed listing record.
#[derive(Debug, PartialEq)]
struct Record {
    flags: u64,
    id: u64,
    conn_flags: u64,
    name: Option<String>,
}

fn read_u64(buf: &[u8], pos: usize) -> u64 {
    u64::from_ne_bytes(buf[pos..pos + 8].try_into().unwrap())
}

fn parse_listing(buf: &[u8]) -> Vec<Record> {
    assert_eq!(read_u64(buf, 0) as usize, buf.len(), "total-size header");
    let mut records = Vec::new();
    let mut pos = 8;
    while pos < buf.len() {
        assert_eq!(pos % 8, 0, "records start on 8-byte boundaries");
        let size = read_u64(buf, pos) as usize;
        assert!(size >= 32);
        let name = (size > 32).then(|| {
            assert_eq!(buf[pos + size - 1], 0, "names are NUL-terminated");
            String::from_utf8(buf[pos + 32..pos + size - 1].to_vec()).unwrap()
        });
        records.push(Record {
            flags: read_u64(buf, pos + 8),
            id: read_u64(buf, pos + 16),
            conn_flags: read_u64(buf, pos + 24),
            name,
        });
        pos += (size + 7) & !7;
    }
    records
}

fn list(bus: &Bus, flags: BitFlags<ListFlag>) -> Vec<Record> {
    let mut pool = Pool::new(4096);
    let slice = bus.list(flags, &mut pool).unwrap();
    parse_listing(pool.slice(slice.offset, slice.size).unwrap())
}

#[test]
fn listing_filters_and_layout() -> Result<()> {
    let (bus, _rx) = Bus::new();
    let c1 = bus.connect();
    let c2 = bus.connect();
    let activator = bus.connect_activator();

    bus.acquire_name(&c1, "com.example.Foo", NameFlag::AllowReplacement.into())?;
    bus.acquire_name(&c2, "com.example.Foo", NameFlag::Queueable.into())?;
    bus.acquire_name(&activator, "com.example.Spawn", BitFlags::empty())?;

    // Unique-id records skip activators unless asked for.
    let unique = list(&bus, ListFlag::UniqueIds.into());
    assert_eq!(
        unique,
        vec![
            Record { flags: 0, id: c1.id(), conn_flags: 0, name: None },
            Record { flags: 0, id: c2.id(), conn_flags: 0, name: None },
        ]
    );
    let unique = list(&bus, ListFlag::UniqueIds | ListFlag::Activators);
    assert_eq!(unique.len(), 3);
    assert_eq!(unique[2].id, activator.id());
    assert_eq!(unique[2].conn_flags, 1);

    // Name records carry the owner and its flags; activator-held names and
    // waiters only show up when their filter bits are set.
    let names = list(&bus, ListFlag::Names.into());
    assert_eq!(
        names,
        vec![Record {
            flags: NameFlag::AllowReplacement as u64,
            id: c1.id(),
            conn_flags: 0,
            name: Some("com.example.Foo".to_string()),
        }]
    );

    let queued = list(&bus, ListFlag::Names | ListFlag::Queued);
    assert_eq!(queued.len(), 2);
    assert_eq!(
        queued[1],
        Record {
            flags: (NameFlag::Queueable | NameFlag::InQueue).bits(),
            id: c2.id(),
            conn_flags: 0,
            name: Some("com.example.Foo".to_string()),
        }
    );

    let mut with_activators = list(&bus, ListFlag::Names | ListFlag::Activators);
    with_activators.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(with_activators.len(), 2);
    assert_eq!(
        with_activators[1].name.as_deref(),
        Some("com.example.Spawn")
    );
    assert_eq!(with_activators[1].id, activator.id());
    assert_eq!(with_activators[1].conn_flags, 1);

    Ok(())
}

#[test]
fn listing_respects_pool_capacity() -> Result<()> {
    let (bus, _rx) = Bus::new();
    let c1 = bus.connect();
    bus.acquire_name(&c1, "com.example.Foo", BitFlags::empty())?;

    let mut pool = Pool::new(16);
    assert_eq!(
        bus.list(ListFlag::Names.into(), &mut pool),
        Err(Error::NoMem)
    );
    assert_eq!(pool.len(), 0);

    Ok(())
}

#[test]
#[timeout(60000)]
fn acquire_on_behalf_racing_disconnect_leaves_no_orphans() -> Result<()> {
    let (bus, _rx) = Bus::new();
    let bus = Arc::new(bus);
    let anchor = bus.connect();

    for round in 0..200 {
        let target = bus.connect();
        let owned_name = format!("race.owned{round}");
        let queued_name = format!("race.queued{round}");
        bus.acquire_name(&anchor, &queued_name, BitFlags::empty())?;

        let barrier = Arc::new(Barrier::new(2));
        let acquirer = {
            let bus = bus.clone();
            let barrier = barrier.clone();
            let owned_name = owned_name.clone();
            let queued_name = queued_name.clone();
            let id = target.id();
            std::thread::spawn(move || {
                barrier.wait();
                // Either call may lose the race and come back with
                // `NoConn`; what it must never do is index state the
                // target's eviction cannot see.
                let _ = bus.acquire_name_as(id, &owned_name, BitFlags::empty());
                let _ = bus.acquire_name_as(id, &queued_name, NameFlag::Queueable.into());
            })
        };
        let killer = {
            let bus = bus.clone();
            let barrier = barrier.clone();
            let target = target.clone();
            std::thread::spawn(move || {
                barrier.wait();
                bus.disconnect(&target);
            })
        };
        acquirer.join().unwrap();
        killer.join().unwrap();

        // Whichever side won each race, nothing may still point at the
        // closed connection.
        assert_eq!(bus.name_owner(&owned_name), None);
        assert_eq!(bus.name_owner(&queued_name), Some(anchor.id()));
        assert_eq!(bus.queued_owners(&queued_name)?, Vec::<u64>::new());
        assert!(target.owned_names().is_empty());
        assert!(target.queued_names().is_empty());

        bus.release_name(&anchor, &queued_name)?;
    }

    Ok(())
}

#[test]
#[timeout(60000)]
fn concurrent_churn_keeps_accounting_consistent() {
    let (bus, _rx) = Bus::new();
    let bus = Arc::new(bus);
    let names: Vec<String> = (0..8).map(|i| format!("stress.n{i}")).collect();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let bus = bus.clone();
            let names = names.clone();
            std::thread::spawn(move || {
                let conn = bus.connect();
                let mut rng = rand::rng();
                for _ in 0..2000 {
                    let name = names[rng.random_range(0..names.len())].as_str();
                    match rng.random_range(0..4) {
                        0 => {
                            let _ = bus.acquire_name(
                                &conn,
                                name,
                                NameFlag::AllowReplacement | NameFlag::Queueable,
                            );
                        }
                        1 => {
                            let _ = bus.acquire_name(
                                &conn,
                                name,
                                NameFlag::ReplaceExisting | NameFlag::Queueable,
                            );
                        }
                        2 => {
                            let _ = bus.acquire_name(&conn, name, NameFlag::ReplaceExisting.into());
                        }
                        _ => {
                            let _ = bus.release_name(&conn, name);
                        }
                    }
                }
                bus.disconnect(&conn);
                conn
            })
        })
        .collect();

    let conns: Vec<Arc<Connection>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Every thread disconnected, so nothing may survive anywhere.
    assert!(bus.name_registry().all_names().is_empty());
    for conn in conns {
        assert_eq!(conn.owned_count(), 0);
        assert!(conn.owned_names().is_empty());
        assert!(conn.queued_names().is_empty());
    }
}
