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

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, trace};

use crate::network::frame::encode_heartbeat;
use crate::service::{HeartbeatConfig, HeartbeatMechanism};
use crate::AppError;

use super::{ConnState, Connection, SharedWriter, WriteRequest};

enum WriterExit {
    Stopped,
    HeartbeatTimeout,
}

fn heartbeat_ticker(heartbeat: &HeartbeatConfig) -> Option<Interval> {
    if !heartbeat.enabled() {
        return None;
    }
    let period = heartbeat.interval();
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl Connection {
    /// Writer loop, the only consumer of the push queue.
    ///
    /// `writer` is the socket handle captured when the connection started
    /// and is used for the loop's whole life. The loop never closes the
    /// socket itself: a stop request only acknowledges the drain, closing
    /// belongs to the close path.
    ///
    /// Liveness is judged on the timestamp the reader refreshes. A ticked
    /// heartbeat written here does not count as activity, the peer still
    /// has to send something within two intervals.
    pub(super) async fn write_loop(
        self: Arc<Self>,
        mut queue_rx: mpsc::Receiver<WriteRequest>,
        drain_tx: oneshot::Sender<()>,
        writer: SharedWriter,
    ) {
        let heartbeat = &self.config.heartbeat;
        let mut ticker = heartbeat_ticker(heartbeat);
        let mut drain_tx = Some(drain_tx);

        let exit = loop {
            tokio::select! {
                request = queue_rx.recv() => match request {
                    Some(WriteRequest::Data(frame)) => {
                        if self.state() == ConnState::Closed {
                            break WriterExit::Stopped;
                        }
                        if let Err(e) = self.write_frame(&writer, &frame).await {
                            error!("write data message error: {}", e);
                        }
                    }
                    Some(WriteRequest::Stop) => {
                        if let Some(drain_tx) = drain_tx.take() {
                            let _ = drain_tx.send(());
                        }
                        break WriterExit::Stopped;
                    }
                    None => break WriterExit::Stopped,
                },
                _ = next_tick(&mut ticker) => {
                    if self.heartbeat_expired() {
                        break WriterExit::HeartbeatTimeout;
                    }
                    if heartbeat.mechanism == HeartbeatMechanism::Ticked {
                        if self.state() == ConnState::Closed {
                            break WriterExit::Stopped;
                        }
                        let frame = encode_heartbeat(&self.pool, heartbeat.with_server_time);
                        if let Err(e) = self.write_frame(&writer, &frame).await {
                            error!("write heartbeat message error: {}", e);
                        }
                    }
                }
            }
        };

        // wakes pushers blocked on a full queue before force_close takes
        // the exclusive lock
        drop(queue_rx);

        if let WriterExit::HeartbeatTimeout = exit {
            debug!(
                "connection {}: {}",
                self.id,
                AppError::HeartbeatTimeout(2 * heartbeat.interval_ms)
            );
            let _ = self.force_close().await;
        }
        trace!("connection {} writer loop exit", self.id);
    }
}
