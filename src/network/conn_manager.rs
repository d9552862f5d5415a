// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::buffer::WriterPool;
use crate::network::{Connection, ConnectionHandler, Transport};
use crate::service::ServerConfig;
use crate::{AppError, AppResult};

/// Registry of live connections.
///
/// Ids grow monotonically and are never handed out twice, so an id is
/// unique while its connection is live and a stale reference can never
/// alias a newer connection.
pub struct ConnectionManager {
    connections: DashMap<u64, Arc<Connection>>,
    // registered plus reserved slots, bounded by max_connections
    live: AtomicUsize,
    next_id: AtomicU64,
    config: Arc<ServerConfig>,
    pool: Arc<WriterPool>,
    handler: Arc<dyn ConnectionHandler>,
}

impl ConnectionManager {
    pub fn new(
        config: Arc<ServerConfig>,
        pool: Arc<WriterPool>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Arc<Self> {
        Arc::new(ConnectionManager {
            connections: DashMap::new(),
            live: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            config,
            pool,
            handler,
        })
    }

    /// Wraps an accepted transport into a registered, running connection.
    ///
    /// The connect hook fires after registration and before the loops
    /// start, so it always precedes the disconnect hook. On error the
    /// transport is dropped, which closes it.
    pub fn allocate<T: Transport>(
        self: &Arc<Self>,
        stream: T,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> AppResult<Arc<Connection>> {
        let max_connections = self.config.network.max_connections;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (max_connections == 0 || live < max_connections).then_some(live + 1)
            })
            .map_err(|_| AppError::TooManyConnections(max_connections))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (conn, io) = Connection::new(
            id,
            stream,
            local_addr,
            remote_addr,
            self.config.clone(),
            self.pool.clone(),
            self.handler.clone(),
            Arc::downgrade(self),
        );
        self.connections.insert(id, conn.clone());
        debug!("connection {} from {} opened", id, remote_addr);

        self.handler.on_connect(&conn);
        conn.start(io);
        Ok(conn)
    }

    /// Deregisters `conn`. Only removes the entry if it still holds this
    /// very connection.
    pub fn recycle(&self, conn: &Arc<Connection>) {
        if self
            .connections
            .remove_if(&conn.id(), |_, live| Arc::ptr_eq(live, conn))
            .is_some()
        {
            self.live.fetch_sub(1, Ordering::AcqRel);
            trace!("connection {} recycled", conn.id());
        }
    }

    pub fn get(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn pool(&self) -> &Arc<WriterPool> {
        &self.pool
    }

    /// Closes every live connection and waits for each close to finish.
    pub async fn close_all(&self, force: bool) {
        let connections: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        debug!("closing {} connections", connections.len());

        let tasks: Vec<_> = connections
            .into_iter()
            .map(|conn| {
                tokio::spawn(async move {
                    if let Err(e) = conn.close(force).await {
                        trace!("connection {} close skipped: {}", conn.id(), e);
                    }
                })
            })
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use rstest::{fixture, rstest};
    use tokio::io::DuplexStream;

    use crate::network::{ConnState, NoopHandler};
    use crate::service::setup_local_tracing;

    use super::*;

    #[fixture]
    fn config() -> ServerConfig {
        let _ = setup_local_tracing();
        let mut config = ServerConfig::default();
        config.heartbeat.interval_ms = 0;
        config
    }

    fn manager(config: ServerConfig) -> Arc<ConnectionManager> {
        ConnectionManager::new(
            Arc::new(config),
            Arc::new(WriterPool::default()),
            Arc::new(NoopHandler),
        )
    }

    fn accept(conn_mgr: &Arc<ConnectionManager>) -> (AppResult<Arc<Connection>>, DuplexStream) {
        let (server_side, client_side) = tokio::io::duplex(4096);
        let local: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        (conn_mgr.allocate(server_side, local, remote), client_side)
    }

    #[rstest]
    #[tokio::test]
    async fn test_ids_are_unique_and_never_reused(config: ServerConfig) {
        let conn_mgr = manager(config);
        let (first, _c1) = accept(&conn_mgr);
        let (second, _c2) = accept(&conn_mgr);
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_ne!(first.id(), second.id());
        assert_eq!(conn_mgr.len(), 2);

        first.close(true).await.unwrap();
        assert_eq!(conn_mgr.len(), 1);
        assert!(conn_mgr.get(first.id()).is_none());

        let (third, _c3) = accept(&conn_mgr);
        let third = third.unwrap();
        assert!(third.id() > second.id());
    }

    #[rstest]
    #[tokio::test]
    async fn test_max_connections(mut config: ServerConfig) {
        config.network.max_connections = 1;
        let conn_mgr = manager(config);

        let (first, _c1) = accept(&conn_mgr);
        let first = first.unwrap();
        let (rejected, _c2) = accept(&conn_mgr);
        assert!(matches!(rejected, Err(AppError::TooManyConnections(1))));
        assert_eq!(conn_mgr.len(), 1);

        first.close(true).await.unwrap();
        let (accepted, _c3) = accept(&conn_mgr);
        assert!(accepted.is_ok());
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_max_connections_under_concurrent_allocation(mut config: ServerConfig) {
        config.network.max_connections = 3;
        let conn_mgr = manager(config);

        let attempts: Vec<_> = (0..32)
            .map(|_| {
                let conn_mgr = conn_mgr.clone();
                tokio::spawn(async move {
                    let (result, client) = accept(&conn_mgr);
                    (result.is_ok(), client)
                })
            })
            .collect();

        let mut accepted = 0;
        let mut clients = Vec::new();
        for attempt in attempts {
            let (ok, client) = attempt.await.unwrap();
            if ok {
                accepted += 1;
            }
            clients.push(client);
        }
        assert_eq!(accepted, 3);
        assert_eq!(conn_mgr.len(), 3);
    }

    #[rstest]
    #[tokio::test]
    async fn test_recycle_ignores_foreign_connection(config: ServerConfig) {
        let conn_mgr = manager(config.clone());
        let other_mgr = manager(config);
        let (conn, _c1) = accept(&conn_mgr);
        let (foreign, _c2) = accept(&other_mgr);
        let (conn, foreign) = (conn.unwrap(), foreign.unwrap());
        // both managers start numbering at 1
        assert_eq!(conn.id(), foreign.id());

        conn_mgr.recycle(&foreign);
        assert!(Arc::ptr_eq(&conn_mgr.get(conn.id()).unwrap(), &conn));

        conn_mgr.recycle(&conn);
        assert!(conn_mgr.is_empty());
        conn_mgr.recycle(&conn);
        assert!(conn_mgr.is_empty());
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    #[tokio::test]
    async fn test_close_all(config: ServerConfig, #[case] force: bool) {
        let conn_mgr = manager(config);
        let mut clients = Vec::new();
        let mut conns = Vec::new();
        for _ in 0..4 {
            let (conn, client) = accept(&conn_mgr);
            let conn = conn.unwrap();
            conn.push("bye").await.unwrap();
            conns.push(conn);
            clients.push(client);
        }

        conn_mgr.close_all(force).await;
        assert!(conn_mgr.is_empty());
        for conn in conns {
            assert_eq!(conn.state(), ConnState::Closed);
        }
    }
}
