//! Serialization of the name/connection listing.
//!
//! The layout is a compatibility surface: a u64 total-size header followed
//! by records of four u64s (`record_size`, `flags`, `id`, `conn_flags`) and
//! an optional NUL-terminated name. `record_size` excludes the trailing
//! alignment pad; records are placed at 8-byte strides. Fields are
//! native-endian, this being an in-process contract.

use std::{collections::HashMap, sync::Arc};

use enumflags2::{bitflags, BitFlags};

use crate::{
    connection::Connection,
    error::Result,
    name::Name,
    name_registry::NameEntry,
    pool::{align8, Pool},
};

/// Filters for the listing.
#[bitflags]
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListFlag {
    /// One fixed-size record per attached connection.
    UniqueIds = 1,
    /// One record per owned name.
    Names = 1 << 1,
    /// Include activator connections and activator-held names.
    Activators = 1 << 2,
    /// One record per queued waiter, with the in-queue bit set.
    Queued = 1 << 3,
}

/// Where a listing landed in the caller's pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListSlice {
    pub offset: usize,
    pub size: usize,
}

const HEADER_SIZE: usize = 8;
const RECORD_HEADER_SIZE: usize = 4 * 8;

struct Record<'a> {
    flags: u64,
    id: u64,
    conn_flags: u64,
    name: Option<&'a str>,
}

impl Record<'_> {
    fn size(&self) -> usize {
        RECORD_HEADER_SIZE + self.name.map(|name| name.len() + 1).unwrap_or(0)
    }

    fn write(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&(self.size() as u64).to_ne_bytes());
        buf[8..16].copy_from_slice(&self.flags.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.id.to_ne_bytes());
        buf[24..32].copy_from_slice(&self.conn_flags.to_ne_bytes());
        if let Some(name) = self.name {
            let end = RECORD_HEADER_SIZE + name.len();
            buf[RECORD_HEADER_SIZE..end].copy_from_slice(name.as_bytes());
            buf[end] = 0;
        }
    }
}

/// Enumerates the selected records in a fixed order: connections first (in
/// the order of the bus snapshot), then per entry the owner record followed
/// by its waiters, oldest first. Both serialization passes run this, so
/// sizes and content agree as long as the registry lock stays held.
fn for_each_record<'a>(
    names: &'a HashMap<Name, NameEntry>,
    connections: &'a [Arc<Connection>],
    flags: BitFlags<ListFlag>,
    mut f: impl FnMut(Record<'a>),
) {
    if flags.contains(ListFlag::UniqueIds) {
        for conn in connections {
            if conn.is_activator() && !flags.contains(ListFlag::Activators) {
                continue;
            }
            f(Record {
                flags: 0,
                id: conn.id(),
                conn_flags: conn.flags().bits(),
                name: None,
            });
        }
    }

    if !flags.contains(ListFlag::Names) {
        return;
    }
    for (name, entry) in names {
        if !entry.owner.conn.is_activator() || flags.contains(ListFlag::Activators) {
            f(Record {
                flags: entry.owner.flags.bits(),
                id: entry.owner.conn.id(),
                conn_flags: entry.owner.conn.flags().bits(),
                name: Some(name.as_str()),
            });
        }
        if flags.contains(ListFlag::Queued) {
            for waiter in &entry.waiting_list {
                f(Record {
                    flags: waiter.flags.bits(),
                    id: waiter.conn.id(),
                    conn_flags: waiter.conn.flags().bits(),
                    name: Some(name.as_str()),
                });
            }
        }
    }
}

pub(crate) fn write_into(
    names: &HashMap<Name, NameEntry>,
    connections: &[Arc<Connection>],
    flags: BitFlags<ListFlag>,
    pool: &mut Pool,
) -> Result<ListSlice> {
    let mut size = HEADER_SIZE;
    for_each_record(names, connections, flags, |record| {
        size += align8(record.size());
    });

    let offset = pool.alloc(size)?;
    let buf = pool.slice_mut(offset, size);
    buf[0..8].copy_from_slice(&(size as u64).to_ne_bytes());

    let mut pos = HEADER_SIZE;
    for_each_record(names, connections, flags, |record| {
        let record_size = record.size();
        record.write(&mut buf[pos..pos + record_size]);
        pos += align8(record_size);
    });
    debug_assert_eq!(pos, size);

    Ok(ListSlice { offset, size })
}
