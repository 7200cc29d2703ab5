// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Helper state: the single instance plus handle tables for every
//! VM sub-resource. One coarse reader-writer lock guards table
//! membership only; the held objects carry their own synchronization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use cc_proto::IpcError;
use cc_vfs::Node;
use tokio::sync::Mutex as AsyncMutex;

use crate::backend::{BoxedRead, BoxedWrite, CommandSpec, VmCommand, VmConn, VmListener};
use crate::instance::{Instance, SnapshotRecord};

/// A command handle's lifecycle.
pub enum CmdState {
    /// Spec still mutable via `CmdSetEnv`/`CmdSetDir`.
    Configured(CommandSpec),
    Running(Box<dyn VmCommand>),
    Done(i32),
    Closed,
}

pub struct CmdEntry {
    pub state: AsyncMutex<CmdState>,
}

pub struct FileEntry {
    pub path: String,
    pub node: Node,
}

pub struct ListenerEntry {
    pub listener: Box<dyn VmListener>,
}

pub struct ConnEntry {
    pub conn: AsyncMutex<Box<dyn VmConn>>,
}

pub struct PipeReaderEntry {
    pub reader: AsyncMutex<BoxedRead>,
}

pub struct PipeWriterEntry {
    pub writer: AsyncMutex<BoxedWrite>,
}

#[derive(Default)]
struct Tables {
    instance: Option<Arc<Instance>>,
    cmds: HashMap<u64, Arc<CmdEntry>>,
    files: HashMap<u64, Arc<FileEntry>>,
    listeners: HashMap<u64, Arc<ListenerEntry>>,
    conns: HashMap<u64, Arc<ConnEntry>>,
    pipe_readers: HashMap<u64, Arc<PipeReaderEntry>>,
    pipe_writers: HashMap<u64, Arc<PipeWriterEntry>>,
    snapshots: HashMap<u64, Arc<SnapshotRecord>>,
}

pub struct HelperState {
    tables: RwLock<Tables>,
    /// Monotonic, never reused. 0 is the null handle.
    next_handle: Mutex<u64>,
}

impl Default for HelperState {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! table_accessors {
    ($get:ident, $insert:ident, $remove:ident, $field:ident, $ty:ty) => {
        pub fn $get(&self, handle: u64) -> Result<Arc<$ty>, IpcError> {
            self.tables
                .read()
                .unwrap()
                .$field
                .get(&handle)
                .cloned()
                .ok_or_else(|| IpcError::invalid_handle(handle))
        }

        pub fn $insert(&self, entry: Arc<$ty>) -> u64 {
            let handle = self.alloc_handle();
            self.tables.write().unwrap().$field.insert(handle, entry);
            handle
        }

        pub fn $remove(&self, handle: u64) -> Result<Arc<$ty>, IpcError> {
            self.tables
                .write()
                .unwrap()
                .$field
                .remove(&handle)
                .ok_or_else(|| IpcError::invalid_handle(handle))
        }
    };
}

impl HelperState {
    pub fn new() -> Self {
        HelperState {
            tables: RwLock::new(Tables::default()),
            next_handle: Mutex::new(1),
        }
    }

    fn alloc_handle(&self) -> u64 {
        let mut next = self.next_handle.lock().unwrap();
        let handle = *next;
        *next += 1;
        handle
    }

    pub fn instance(&self) -> Result<Arc<Instance>, IpcError> {
        self.tables.read().unwrap().instance.clone().ok_or_else(|| {
            IpcError::new(cc_proto::ErrorCode::NotRunning, "no instance in this helper")
        })
    }

    /// At most one instance per helper process.
    pub fn set_instance(&self, instance: Arc<Instance>) -> Result<(), IpcError> {
        let mut tables = self.tables.write().unwrap();
        if tables.instance.is_some() {
            return Err(IpcError::new(
                cc_proto::ErrorCode::InvalidArgument,
                "instance already exists",
            ));
        }
        tables.instance = Some(instance);
        Ok(())
    }

    pub fn take_instance(&self) -> Option<Arc<Instance>> {
        self.tables.write().unwrap().instance.take()
    }

    table_accessors!(cmd, insert_cmd, remove_cmd, cmds, CmdEntry);
    table_accessors!(file, insert_file, remove_file, files, FileEntry);
    table_accessors!(listener, insert_listener, remove_listener, listeners, ListenerEntry);
    table_accessors!(conn, insert_conn, remove_conn, conns, ConnEntry);
    table_accessors!(
        pipe_reader,
        insert_pipe_reader,
        remove_pipe_reader,
        pipe_readers,
        PipeReaderEntry
    );
    table_accessors!(
        pipe_writer,
        insert_pipe_writer,
        remove_pipe_writer,
        pipe_writers,
        PipeWriterEntry
    );
    table_accessors!(snapshot, insert_snapshot, remove_snapshot, snapshots, SnapshotRecord);

    /// Drain every table for the shutdown path: conns first, then
    /// listeners, files, snapshots, finally the instance.
    pub fn drain_for_close(
        &self,
    ) -> (
        Vec<Arc<ConnEntry>>,
        Vec<Arc<ListenerEntry>>,
        Vec<Arc<FileEntry>>,
        Vec<Arc<SnapshotRecord>>,
        Option<Arc<Instance>>,
    ) {
        let mut tables = self.tables.write().unwrap();
        (
            tables.conns.drain().map(|(_, v)| v).collect(),
            tables.listeners.drain().map(|(_, v)| v).collect(),
            tables.files.drain().map(|(_, v)| v).collect(),
            tables.snapshots.drain().map(|(_, v)| v).collect(),
            tables.instance.take(),
        )
    }
}
