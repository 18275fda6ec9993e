//! Bounded SQLite connection pool.
//!
//! Connections are handed out LIFO so the most recently used ("hot") connection is
//! reused first and cold ones sink to the bottom of the idle stack, where
//! [`ConnectionPool::reap_idle`] closes them. At most `max_connections` are open at
//! once; [`ConnectionPool::acquire`] waits on a condition variable up to
//! `acquire_timeout` before failing with [`MemoryError::PoolExhausted`].

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rusqlite::Connection;
use serde::Serialize;

use crate::error::{MemoryError, MemoryResult};

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub acquire_timeout: Duration,
    /// Idle connections older than this are closed on the next release.
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl From<&crate::config::StorageConfig> for PoolSettings {
    fn from(config: &crate::config::StorageConfig) -> Self {
        Self {
            max_connections: config.pool_max_connections.max(1),
            acquire_timeout: config.acquire_timeout(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub max_connections: usize,
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
    pub closed: bool,
}

struct IdleConnection {
    id: u64,
    conn: Connection,
    since: Instant,
}

struct PoolState {
    idle: Vec<IdleConnection>,
    /// Idle plus leased plus connections currently being opened.
    open: usize,
    closed: bool,
}

struct PoolShared {
    path: PathBuf,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    available: Condvar,
    write_gate: Mutex<()>,
    next_id: AtomicU64,
    /// Bumped after every write, once its transaction has finished.
    generation: AtomicU64,
}

/// Cloneable handle to one database's connection pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Open a pool for the database at `path`, creating the parent directory.
    ///
    /// One connection is opened eagerly so a bad path fails here rather than on the
    /// first query.
    pub fn open(path: impl AsRef<Path>, settings: PoolSettings) -> MemoryResult<Self> {
        let path = path.as_ref().to_path_buf();
        if settings.max_connections == 0 {
            return Err(MemoryError::validation(
                "pool max_connections must be at least 1",
            ));
        }
        super::ensure_parent_dir(&path)?;
        let first = super::open_connection(&path)?;

        let shared = Arc::new(PoolShared {
            path,
            settings,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                open: 1,
                closed: false,
            }),
            available: Condvar::new(),
            write_gate: Mutex::new(()),
            next_id: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        });
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        shared.state.lock().idle.push(IdleConnection {
            id,
            conn: first,
            since: Instant::now(),
        });

        tracing::debug!(
            path = %shared.path.display(),
            max_connections = shared.settings.max_connections,
            "connection pool opened"
        );
        Ok(Self { shared })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    /// Lease a connection, waiting up to the configured acquire timeout.
    pub fn acquire(&self) -> MemoryResult<PooledConnection> {
        self.acquire_timeout(self.shared.settings.acquire_timeout)
    }

    /// Lease a connection, waiting at most `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> MemoryResult<PooledConnection> {
        let started = Instant::now();
        let deadline = started + timeout;
        let max = self.shared.settings.max_connections;

        let mut state = self.shared.state.lock();
        loop {
            if state.closed {
                return Err(MemoryError::PoolClosed);
            }
            if let Some(idle) = state.idle.pop() {
                return Ok(self.lease(idle.id, idle.conn));
            }
            if state.open < max {
                // Reserve the slot, then open outside the lock.
                state.open += 1;
                drop(state);
                return match super::open_connection(&self.shared.path) {
                    Ok(conn) => {
                        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
                        Ok(self.lease(id, conn))
                    }
                    Err(e) => {
                        self.shared.state.lock().open -= 1;
                        self.shared.available.notify_one();
                        Err(e)
                    }
                };
            }

            let timed_out = self
                .shared
                .available
                .wait_until(&mut state, deadline)
                .timed_out();
            if timed_out && !state.closed && state.idle.is_empty() && state.open >= max {
                let waited_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(
                    path = %self.shared.path.display(),
                    max_connections = max,
                    waited_ms,
                    "connection pool exhausted"
                );
                return Err(MemoryError::PoolExhausted {
                    max_connections: max,
                    waited_ms,
                });
            }
        }
    }

    /// Return a leased connection. Equivalent to dropping the lease.
    pub fn release(&self, lease: PooledConnection) {
        drop(lease);
    }

    /// Run `f` with a leased connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> MemoryResult<T>) -> MemoryResult<T> {
        let lease = self.acquire()?;
        f(&lease)
    }

    /// Run `f` with a leased connection while holding this database's write gate.
    ///
    /// Only one writer per database runs at a time; readers are never gated. The write
    /// generation is bumped when `f` returns, whether or not it succeeded.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> MemoryResult<T>,
    ) -> MemoryResult<T> {
        let timeout = self.shared.settings.acquire_timeout;
        let started = Instant::now();
        let _gate = self.shared.write_gate.try_lock_for(timeout).ok_or_else(|| {
            let waited_ms = started.elapsed().as_millis() as u64;
            tracing::warn!(path = %self.shared.path.display(), waited_ms, "write gate wait timed out");
            MemoryError::PoolExhausted {
                max_connections: self.shared.settings.max_connections,
                waited_ms,
            }
        })?;
        let remaining = timeout.saturating_sub(started.elapsed());
        let mut lease = self.acquire_timeout(remaining)?;
        let outcome = f(&mut lease);
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        outcome
    }

    /// Number of writes run through this pool. Anything read before a change in this
    /// value may be stale.
    pub fn write_generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Close idle connections that have sat unused longer than `idle_timeout`.
    ///
    /// Returns how many were closed. Also runs after every release.
    pub fn reap_idle(&self) -> usize {
        self.shared.reap_idle()
    }

    /// Close every idle connection and refuse further leases.
    ///
    /// Leases still held elsewhere stay usable until released, at which point their
    /// connection is closed instead of returning to the pool.
    pub fn close_all(&self) {
        let drained: Vec<IdleConnection> = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.open -= drained.len();
            drained
        };
        let count = drained.len();
        for idle in drained {
            close_quietly(idle.id, idle.conn);
        }
        self.shared.available.notify_all();
        tracing::info!(path = %self.shared.path.display(), closed = count, "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            max_connections: self.shared.settings.max_connections,
            open: state.open,
            idle: state.idle.len(),
            in_use: state.open - state.idle.len(),
            closed: state.closed,
        }
    }

    fn lease(&self, id: u64, conn: Connection) -> PooledConnection {
        PooledConnection {
            id,
            conn: Some(conn),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("path", &self.shared.path)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolShared {
    fn release(&self, id: u64, conn: Connection) {
        let mut state = self.state.lock();
        if state.closed {
            state.open -= 1;
            drop(state);
            close_quietly(id, conn);
            return;
        }
        state.idle.push(IdleConnection {
            id,
            conn,
            since: Instant::now(),
        });
        drop(state);
        self.available.notify_one();
        self.reap_idle();
    }

    fn reap_idle(&self) -> usize {
        let idle_timeout = self.settings.idle_timeout;
        let reaped: Vec<IdleConnection> = {
            let mut state = self.state.lock();
            // LIFO stack: the coldest connections sit at the front.
            let cold = state
                .idle
                .iter()
                .take_while(|c| c.since.elapsed() > idle_timeout)
                .count();
            let reaped: Vec<_> = state.idle.drain(..cold).collect();
            state.open -= reaped.len();
            reaped
        };
        let count = reaped.len();
        for idle in reaped {
            close_quietly(idle.id, idle.conn);
        }
        if count > 0 {
            self.available.notify_all();
            tracing::debug!(path = %self.path.display(), count, "reaped idle connections");
        }
        count
    }
}

fn close_quietly(id: u64, conn: Connection) {
    if let Err((_, e)) = conn.close() {
        tracing::warn!(connection = id, error = %e, "failed to close connection cleanly");
    }
}

/// A leased connection. Returns itself to the pool on drop.
pub struct PooledConnection {
    id: u64,
    conn: Option<Connection>,
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// Pool-unique identifier of the underlying connection.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.release(self.id, conn);
        }
    }
}
