//! Per-client statistics keyed by peer IP

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::handler::Access;

#[derive(Debug, Clone)]
struct ClientRecord {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    reads: u64,
    writes: u64,
    exceptions: u64,
    active_connections: u32,
}

/// Serializable view of one client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientSnapshot {
    pub ip: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub reads: u64,
    pub writes: u64,
    pub exceptions: u64,
    pub active_connections: u32,
}

/// Concurrent client table, survives server restarts
#[derive(Debug, Default)]
pub struct ClientStats {
    clients: DashMap<IpAddr, ClientRecord>,
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected(&self, ip: IpAddr) {
        let now = Utc::now();
        let mut record = self.clients.entry(ip).or_insert_with(|| ClientRecord {
            first_seen: now,
            last_seen: now,
            reads: 0,
            writes: 0,
            exceptions: 0,
            active_connections: 0,
        });
        record.active_connections += 1;
        record.last_seen = now;
    }

    pub fn disconnected(&self, ip: IpAddr) {
        if let Some(mut record) = self.clients.get_mut(&ip) {
            record.active_connections = record.active_connections.saturating_sub(1);
        }
    }

    /// Count a connection as open until the returned guard drops, including
    /// when its task is aborted
    pub fn track(self: &Arc<Self>, ip: IpAddr) -> ConnectionGuard {
        self.connected(ip);
        ConnectionGuard {
            stats: Arc::clone(self),
            ip,
        }
    }

    pub fn record(&self, ip: IpAddr, access: Access) {
        if let Some(mut record) = self.clients.get_mut(&ip) {
            record.last_seen = Utc::now();
            match access {
                Access::Read => record.reads += 1,
                Access::Write => record.writes += 1,
                Access::Rejected(_) => record.exceptions += 1,
            }
        }
    }

    /// Total open connections across all clients
    pub fn active_connections(&self) -> u32 {
        self.clients.iter().map(|r| r.active_connections).sum()
    }

    /// All clients, ordered by IP
    pub fn snapshot(&self) -> Vec<ClientSnapshot> {
        let mut out: Vec<ClientSnapshot> = self
            .clients
            .iter()
            .map(|entry| {
                let r = entry.value();
                ClientSnapshot {
                    ip: entry.key().to_string(),
                    first_seen: r.first_seen,
                    last_seen: r.last_seen,
                    reads: r.reads,
                    writes: r.writes,
                    exceptions: r.exceptions,
                    active_connections: r.active_connections,
                }
            })
            .collect();
        out.sort_by(|a, b| a.ip.cmp(&b.ip));
        out
    }
}

/// Open connection slot, released on drop
#[derive(Debug)]
pub struct ConnectionGuard {
    stats: Arc<ClientStats>,
    ip: IpAddr,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.disconnected(self.ip);
    }
}
