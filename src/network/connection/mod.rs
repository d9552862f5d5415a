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

//! A single client connection.
//!
//! Every connection runs two tasks for its whole life:
//! - the reader loop decodes frames, tracks liveness and feeds the receive hook
//! - the writer loop drains the push queue and owns the heartbeat ticker
//!
//! Lifecycle:
//!
//! ```text
//! Opened --close(false)--> Hanged --drained--> Closed
//!    \________________close(true)_____________/
//! ```
//!
//! The lifecycle field and the socket write handle are guarded together by
//! `inner`: shared for send/push/address queries, exclusive for transitions.
//! The state is only ever stored while `inner` is held exclusively, so a
//! check made under the shared side stays true until the guard is dropped.
//!
//! A forced close first raises `write_abort` without any lock. Every socket
//! write selects on it, so a write stuck on a peer that stopped reading
//! gives up its locks and the close can proceed.

use std::fmt;
use std::io::{self, ErrorKind, IoSlice};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::buffer::{NocopyBuffer, WriterPool};
use crate::network::frame::{encode_frame, FrameReader};
use crate::network::{ConnectionHandler, ConnectionManager};
use crate::service::{ServerConfig, Shutdown};
use crate::{AppError, AppResult};

mod reader;
mod writer;


/// Anything a connection can run on: a `TcpStream` in production, an
/// in-memory duplex stream in tests.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<Mutex<BoxWriter>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Opened = 0,
    /// graceful close in progress, queued frames are being drained
    Hanged = 1,
    Closed = 2,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            0 => ConnState::Opened,
            1 => ConnState::Hanged,
            _ => ConnState::Closed,
        }
    }
}

#[derive(Debug)]
enum WriteRequest {
    Data(NocopyBuffer),
    /// last request of a graceful close
    Stop,
}

struct ConnInner {
    writer: Option<SharedWriter>,
    queue: Option<mpsc::Sender<WriteRequest>>,
    drain_rx: Option<oneshot::Receiver<()>>,
}

/// Resources moved into the two loops when they start.
pub(crate) struct ConnectionIo {
    frames: FrameReader<BoxReader>,
    writer: SharedWriter,
    queue_rx: mpsc::Receiver<WriteRequest>,
    drain_tx: oneshot::Sender<()>,
    closing: Shutdown,
}

pub struct Connection {
    id: u64,
    uid: AtomicI64,
    state: AtomicU8,
    inner: RwLock<ConnInner>,
    notify_close: broadcast::Sender<()>,
    // latched true by the first forced close attempt
    write_abort: watch::Sender<bool>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    created_at: Instant,
    // millis since created_at, refreshed by the reader loop only
    last_heartbeat_ms: AtomicU64,
    config: Arc<ServerConfig>,
    pool: Arc<WriterPool>,
    handler: Arc<dyn ConnectionHandler>,
    conn_mgr: Weak<ConnectionManager>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    join_gate: Mutex<()>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<T: Transport>(
        id: u64,
        stream: T,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        config: Arc<ServerConfig>,
        pool: Arc<WriterPool>,
        handler: Arc<dyn ConnectionHandler>,
        conn_mgr: Weak<ConnectionManager>,
    ) -> (Arc<Connection>, ConnectionIo) {
        let (read_half, write_half) = tokio::io::split(stream);
        let frames = FrameReader::new(
            Box::new(read_half) as BoxReader,
            config.network.read_buffer_size,
            config.network.max_frame_size,
        );
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(write_half) as BoxWriter));
        let (queue_tx, queue_rx) = mpsc::channel(config.connection.write_queue_capacity.max(1));
        let (drain_tx, drain_rx) = oneshot::channel();
        let (notify_close, _) = broadcast::channel(1);
        let (write_abort, _) = watch::channel(false);
        let closing = Shutdown::new(notify_close.subscribe());

        let conn = Arc::new(Connection {
            id,
            uid: AtomicI64::new(0),
            state: AtomicU8::new(ConnState::Opened as u8),
            inner: RwLock::new(ConnInner {
                writer: Some(writer.clone()),
                queue: Some(queue_tx),
                drain_rx: Some(drain_rx),
            }),
            notify_close,
            write_abort,
            local_addr,
            remote_addr,
            created_at: Instant::now(),
            last_heartbeat_ms: AtomicU64::new(0),
            config,
            pool,
            handler,
            conn_mgr,
            tasks: parking_lot::Mutex::new(Vec::with_capacity(2)),
            join_gate: Mutex::new(()),
        });
        let io = ConnectionIo {
            frames,
            writer,
            queue_rx,
            drain_tx,
            closing,
        };
        (conn, io)
    }

    /// Spawns the reader and writer loops.
    pub(crate) fn start(self: &Arc<Self>, io: ConnectionIo) {
        let ConnectionIo {
            frames,
            writer,
            queue_rx,
            drain_tx,
            closing,
        } = io;
        let read_task = tokio::spawn(self.clone().read_loop(frames, writer.clone(), closing));
        let write_task = tokio::spawn(self.clone().write_loop(queue_rx, drain_tx, writer));
        self.tasks.lock().extend([read_task, write_task]);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Bound user id, 0 when unbound.
    pub fn uid(&self) -> i64 {
        self.uid.load(Ordering::Acquire)
    }

    pub fn bind(&self, uid: i64) {
        self.uid.store(uid, Ordering::Release);
    }

    pub fn unbind(&self) {
        self.uid.store(0, Ordering::Release);
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn check_state(&self) -> AppResult<()> {
        match self.state() {
            ConnState::Opened => Ok(()),
            ConnState::Hanged => Err(AppError::ConnectionHanged),
            ConnState::Closed => Err(AppError::ConnectionClosed),
        }
    }

    /// Writes a frame straight to the socket.
    ///
    /// Bypasses the push queue, so it may interleave with pushed frames.
    pub async fn send(&self, payload: impl Into<Bytes>) -> AppResult<()> {
        let frame = encode_frame(&self.pool, payload.into())?;

        let inner = self.inner.read().await;
        self.check_state()?;
        let writer = inner.writer.as_ref().ok_or(AppError::ConnectionClosed)?;
        self.write_frame(writer, &frame).await?;
        Ok(())
    }

    /// Queues a frame for the writer loop. Pushed frames reach the socket
    /// in submission order.
    pub async fn push(&self, payload: impl Into<Bytes>) -> AppResult<()> {
        let frame = encode_frame(&self.pool, payload.into())?;

        let inner = self.inner.read().await;
        self.check_state()?;
        let queue = inner.queue.as_ref().ok_or(AppError::ConnectionClosed)?;
        // the writer loop dropped its receiver, it is on its way to a forced close
        queue
            .send(WriteRequest::Data(frame))
            .await
            .map_err(|_| AppError::ConnectionClosed)
    }

    /// Closes the connection.
    ///
    /// A graceful close waits for every pushed frame to be written first; a
    /// forced close drops them. Only the first caller performs the close,
    /// later callers get `ConnectionHanged` or `ConnectionClosed`.
    pub async fn close(self: &Arc<Self>, force: bool) -> AppResult<()> {
        if force {
            self.force_close().await
        } else {
            self.graceful_close().await
        }
    }

    async fn graceful_close(self: &Arc<Self>) -> AppResult<()> {
        let drain_rx = {
            let mut inner = self.inner.write().await;
            self.check_state()?;
            self.set_state(ConnState::Hanged);
            if let Some(queue) = inner.queue.as_ref() {
                if queue.send(WriteRequest::Stop).await.is_err() {
                    trace!("connection {} writer loop already gone", self.id);
                }
            }
            inner.drain_rx.take()
        };

        if let Some(drain_rx) = drain_rx {
            // a dropped sender means the writer loop quit before the stop request
            if drain_rx.await.is_err() {
                debug!("connection {} closed without a full drain", self.id);
            }
        }

        let writer = {
            let mut inner = self.inner.write().await;
            self.set_state(ConnState::Closed);
            inner.queue.take();
            let _ = self.notify_close.send(());
            inner.writer.take()
        };
        self.finish_close(writer).await
    }

    async fn force_close(self: &Arc<Self>) -> AppResult<()> {
        // a send or the writer loop may be blocked on the socket while
        // holding `inner` shared
        self.write_abort.send_replace(true);

        let writer = {
            let mut inner = self.inner.write().await;
            self.check_state()?;
            self.set_state(ConnState::Closed);
            inner.queue.take();
            inner.drain_rx.take();
            let _ = self.notify_close.send(());
            inner.writer.take()
        };
        self.finish_close(writer).await
    }

    /// Shuts the socket down, deregisters and fires the disconnect hook.
    ///
    /// Runs outside `inner`; the state is already Closed at this point.
    /// Frames are flushed as they are written, so shutting down only
    /// half-closes the socket and never waits on the peer.
    async fn finish_close(self: &Arc<Self>, writer: Option<SharedWriter>) -> AppResult<()> {
        let result = match writer {
            Some(writer) => writer.lock().await.shutdown().await.map_err(AppError::from),
            None => Ok(()),
        };
        if let Err(e) = &result {
            debug!("connection {} socket shutdown error: {}", self.id, e);
        }

        if let Some(conn_mgr) = self.conn_mgr.upgrade() {
            conn_mgr.recycle(self);
        }
        debug!("connection {} closed", self.id);
        self.handler.on_disconnect(self);

        result
    }

    pub async fn local_addr(&self) -> AppResult<SocketAddr> {
        let _inner = self.inner.read().await;
        self.check_state()?;
        Ok(self.local_addr)
    }

    pub async fn remote_addr(&self) -> AppResult<SocketAddr> {
        let _inner = self.inner.read().await;
        self.check_state()?;
        Ok(self.remote_addr)
    }

    pub async fn local_ip(&self) -> AppResult<IpAddr> {
        self.local_addr().await.map(|addr| addr.ip())
    }

    pub async fn remote_ip(&self) -> AppResult<IpAddr> {
        self.remote_addr().await.map(|addr| addr.ip())
    }

    /// Waits until both loops have exited.
    ///
    /// Concurrent callers queue behind the first one and all return once
    /// the loops are gone. Must not be awaited from a hook: the hooks run
    /// on those loops.
    pub async fn join(&self) {
        let _gate = self.join_gate.lock().await;
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!("connection {} task failed: {}", self.id, e);
            }
        }
    }

    /// Writes one frame, giving up as soon as a forced close starts.
    async fn write_frame(&self, writer: &SharedWriter, frame: &NocopyBuffer) -> io::Result<()> {
        let mut aborted = self.write_abort.subscribe();
        tokio::select! {
            result = write_chunks(writer, frame) => result,
            _ = aborted.wait_for(|aborted| *aborted) => Err(io::Error::new(
                ErrorKind::ConnectionAborted,
                "connection force closed while writing",
            )),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    fn refresh_heartbeat(&self) {
        self.last_heartbeat_ms
            .store(self.elapsed_ms(), Ordering::Release);
    }

    fn heartbeat_expired(&self) -> bool {
        let silence = self
            .elapsed_ms()
            .saturating_sub(self.last_heartbeat_ms.load(Ordering::Acquire));
        silence > 2 * self.config.heartbeat.interval_ms
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("uid", &self.uid())
            .field("state", &self.state())
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!("connection {} dropped", self.id);
    }
}

/// Hands the frame's chunks to the socket as they are, with vectored
/// writes, and flushes.
async fn write_chunks(writer: &SharedWriter, frame: &NocopyBuffer) -> io::Result<()> {
    let mut chunks: Vec<&[u8]> = frame.chunks().collect();
    let mut writer = writer.lock().await;

    let mut first = 0;
    while first < chunks.len() {
        let mut written = {
            let slices: Vec<IoSlice<'_>> =
                chunks[first..].iter().map(|c| IoSlice::new(c)).collect();
            writer.write_vectored(&slices).await?
        };
        if written == 0 {
            return Err(ErrorKind::WriteZero.into());
        }
        while first < chunks.len() && written >= chunks[first].len() {
            written -= chunks[first].len();
            first += 1;
        }
        if written > 0 {
            let rest = chunks[first];
            chunks[first] = &rest[written..];
        }
    }
    writer.flush().await
}
