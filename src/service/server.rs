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
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::buffer::WriterPool;
use crate::network::{ConnectionHandler, ConnectionManager};
use crate::{AppError, AppResult};

use super::{ServerConfig, Shutdown};

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// TCP front of the connection manager.
pub struct Server {
    config: Arc<ServerConfig>,
    conn_mgr: Arc<ConnectionManager>,
    notify_shutdown: broadcast::Sender<()>,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Builds a server with a writer pool sized from the config.
    pub fn new(config: ServerConfig, handler: Arc<dyn ConnectionHandler>) -> Self {
        let pool = Arc::new(WriterPool::from_config(&config.writer_pool));
        Self::with_pool(config, pool, handler)
    }

    /// Builds a server sharing an existing writer pool.
    pub fn with_pool(
        config: ServerConfig,
        pool: Arc<WriterPool>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        let config = Arc::new(config);
        let (notify_shutdown, _) = broadcast::channel(1);
        Server {
            conn_mgr: ConnectionManager::new(config.clone(), pool, handler),
            config,
            notify_shutdown,
            accept_task: parking_lot::Mutex::new(None),
        }
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.conn_mgr
    }

    /// Binds the configured address and starts accepting connections.
    ///
    /// Returns the bound address, which differs from the configured one
    /// when port 0 was requested.
    pub async fn start(&self) -> AppResult<SocketAddr> {
        let listen_address = self.config.listen_address();
        let listener = TcpListener::bind(&listen_address).await.map_err(|err| {
            let error_msg = format!(
                "Failed to bind server to address: {} - Error: {}",
                listen_address, err
            );
            error!(error_msg);
            AppError::DetailedIoError(error_msg)
        })?;
        let local_addr = listener.local_addr()?;
        info!("tcp server binding to {} for listening", local_addr);

        let acceptor = Acceptor {
            listener,
            conn_mgr: self.conn_mgr.clone(),
            shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
        };
        let handle = tokio::spawn(acceptor.run());
        if let Some(previous) = self.accept_task.lock().replace(handle) {
            previous.abort();
        }
        Ok(local_addr)
    }

    /// Stops accepting and gracefully closes every live connection.
    pub async fn stop(&self) -> AppResult<()> {
        let _ = self.notify_shutdown.send(());
        let accept_task = self.accept_task.lock().take();
        if let Some(accept_task) = accept_task {
            accept_task
                .await
                .map_err(|e| AppError::IllegalStateError(format!("accept loop failed: {}", e)))?;
        }

        self.conn_mgr.close_all(false).await;
        info!("tcp server stopped");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}

struct Acceptor {
    listener: TcpListener,
    conn_mgr: Arc<ConnectionManager>,
    shutdown: Shutdown,
}

impl Acceptor {
    async fn run(mut self) {
        loop {
            let (socket, remote_addr) = tokio::select! {
                accepted = Acceptor::accept(&self.listener) => accepted,
                _ = self.shutdown.recv() => {
                    debug!("accept loop exit after recv shutdown signal");
                    return;
                }
            };

            if let Err(e) = socket.set_nodelay(true) {
                warn!("set nodelay for {} failed: {}", remote_addr, e);
            }
            let local_addr = match socket.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("connection from {} lost before setup: {}", remote_addr, e);
                    continue;
                }
            };

            if let Err(err) = self.conn_mgr.allocate(socket, local_addr, remote_addr) {
                error!("connection allocate error: {}", err);
            }
        }
    }

    /// Accepts the next socket, backing off on errors such as fd exhaustion.
    async fn accept(listener: &TcpListener) -> (TcpStream, SocketAddr) {
        let mut backoff = MIN_ACCEPT_BACKOFF;
        loop {
            match listener.accept().await {
                Ok(accepted) => return accepted,
                Err(err) => {
                    let err = AppError::Accept(err.to_string());
                    warn!("{}; retrying in {:?}", err, backoff);
                }
            }

            time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
        }
    }
}
