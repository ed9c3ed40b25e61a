//! Remote file access for the file engine.
//!
//! Connections are never opened by the engine directly: they are borrowed
//! from a [`TransferConnectionPool`] that is passed into every call, probed
//! before reuse and replaced once older than the configured TTL.

pub mod ftp;
pub mod local;
pub mod sftp;

use crate::config::{Protocol, TransferConfig};
use crate::utils::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

/// Directory listing entry, normalised across protocols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

/// One open connection to the source of the file tree.
pub trait RemoteConnection: Send {
    fn protocol(&self) -> Protocol;

    /// Cheap liveness probe.
    fn is_alive(&mut self) -> bool;

    /// List a directory, without `.` and `..`.
    fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>>;

    fn file_size(&mut self, path: &str) -> Result<u64>;

    /// Stream `remote` into `local` in `chunk_size` pieces; returns bytes written.
    fn download(&mut self, remote: &str, local: &Path, chunk_size: usize) -> Result<u64>;

    /// Verify that the connection can reach its root.
    fn test(&mut self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(EngineError::Transfer(format!("{} connection is not alive", self.protocol())))
        }
    }

    fn close(&mut self) {}
}

/// Opens connections for the pool.
pub trait Connector: Send + Sync {
    fn connect(&self, config: &TransferConfig) -> Result<Box<dyn RemoteConnection>>;
}

/// Connector dispatching on [`TransferConfig::protocol`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

impl Connector for DefaultConnector {
    fn connect(&self, config: &TransferConfig) -> Result<Box<dyn RemoteConnection>> {
        match config.protocol {
            Protocol::Local => Ok(Box::new(local::LocalConnection::new())),
            Protocol::Ftp => Ok(Box::new(ftp::FtpConnection::connect(config)?)),
            Protocol::Sftp => Ok(Box::new(sftp::SftpConnection::connect(config)?)),
        }
    }
}

/// Join a remote base path and a `/`-separated relative path.
pub fn remote_join(base: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        return base.to_string();
    }
    if base.is_empty() {
        return relative.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), relative)
}

/// Copy `reader` into a freshly created `local` file in `chunk_size` pieces.
pub(crate) fn stream_to_file(reader: &mut dyn Read, local: &Path, chunk_size: usize) -> Result<u64> {
    let mut file = std::fs::File::create(local)?;
    let mut buffer = vec![0u8; chunk_size.max(4096)];
    let mut total = 0u64;
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])?;
        total += read as u64;
    }
    file.flush()?;
    Ok(total)
}

/// A connection checked out of the pool.
pub struct PooledConnection {
    conn: Box<dyn RemoteConnection>,
    protocol: Protocol,
    created: Instant,
    id: u64,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }
}

impl Deref for PooledConnection {
    type Target = dyn RemoteConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub stale_replaced: u64,
    pub dead_replaced: u64,
    pub discarded: u64,
}

pub struct TransferConnectionPool {
    connector: Arc<dyn Connector>,
    idle: HashMap<Protocol, Vec<PooledConnection>>,
    checked_out: HashMap<Protocol, usize>,
    max_per_protocol: usize,
    ttl: Duration,
    stats: PoolStats,
    next_id: u64,
}

impl TransferConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: &TransferConfig) -> Self {
        Self {
            connector,
            idle: HashMap::new(),
            checked_out: HashMap::new(),
            max_per_protocol: config.pool_size.max(1),
            ttl: config.connection_ttl(),
            stats: PoolStats::default(),
            next_id: 0,
        }
    }

    /// Borrow a live connection, replacing stale or dead idle ones.
    pub fn get(&mut self, config: &TransferConfig) -> Result<PooledConnection> {
        let protocol = config.protocol;
        while let Some(mut pooled) = self.idle.get_mut(&protocol).and_then(Vec::pop) {
            if pooled.age() >= self.ttl {
                debug!(conn = pooled.id, %protocol, "replacing stale connection");
                pooled.conn.close();
                self.stats.stale_replaced += 1;
                continue;
            }
            if !pooled.conn.is_alive() {
                debug!(conn = pooled.id, %protocol, "replacing dead connection");
                pooled.conn.close();
                self.stats.dead_replaced += 1;
                continue;
            }
            self.stats.reused += 1;
            *self.checked_out.entry(protocol).or_default() += 1;
            return Ok(pooled);
        }

        let in_use = self.checked_out.get(&protocol).copied().unwrap_or(0);
        if in_use >= self.max_per_protocol {
            return Err(EngineError::Transfer(format!(
                "{protocol} pool exhausted ({in_use} of {} in use)",
                self.max_per_protocol
            )));
        }

        let conn = self.connector.connect(config)?;
        self.next_id += 1;
        self.stats.created += 1;
        *self.checked_out.entry(protocol).or_default() += 1;
        debug!(conn = self.next_id, %protocol, "opened transfer connection");
        Ok(PooledConnection {
            conn,
            protocol,
            created: Instant::now(),
            id: self.next_id,
        })
    }

    /// Return a healthy connection to the pool.
    pub fn release(&mut self, mut pooled: PooledConnection) {
        self.check_in(pooled.protocol);
        let idle = self.idle.entry(pooled.protocol).or_default();
        if idle.len() < self.max_per_protocol {
            idle.push(pooled);
        } else {
            pooled.conn.close();
        }
    }

    /// Drop a connection that failed mid-operation.
    pub fn discard(&mut self, mut pooled: PooledConnection) {
        self.check_in(pooled.protocol);
        pooled.conn.close();
        self.stats.discarded += 1;
    }

    fn check_in(&mut self, protocol: Protocol) {
        if let Some(count) = self.checked_out.get_mut(&protocol) {
            *count = count.saturating_sub(1);
        }
    }

    /// Close every idle connection; used on completion and as memory relief.
    pub fn close_all(&mut self) {
        let mut closed = 0;
        for (_, conns) in self.idle.drain() {
            for mut pooled in conns {
                pooled.conn.close();
                closed += 1;
            }
        }
        info!(
            closed,
            created = self.stats.created,
            reused = self.stats.reused,
            stale_replaced = self.stats.stale_replaced,
            dead_replaced = self.stats.dead_replaced,
            discarded = self.stats.discarded,
            "transfer pool closed"
        );
    }

    pub fn idle_count(&self) -> usize {
        self.idle.values().map(Vec::len).sum()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}
