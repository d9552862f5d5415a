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

use tracing::{debug, error, trace};

use crate::network::frame::{encode_heartbeat, FrameReader};
use crate::service::{HeartbeatMechanism, Shutdown};

use super::{BoxReader, ConnState, Connection, SharedWriter};

impl Connection {
    /// Reader loop, one per connection.
    ///
    /// A decode error has no caller to report to, so it ends in a forced
    /// close. While the connection is Hanged inbound frames are discarded
    /// but the socket keeps being read until the writer finished draining.
    pub(super) async fn read_loop(
        self: Arc<Self>,
        mut frames: FrameReader<BoxReader>,
        writer: SharedWriter,
        mut closing: Shutdown,
    ) {
        let heartbeat = &self.config.heartbeat;
        loop {
            let result = tokio::select! {
                biased;
                _ = closing.recv() => break,
                result = frames.read_frame() => result,
            };

            let frame = match result {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("connection {} closed by peer", self.id);
                    let _ = self.force_close().await;
                    break;
                }
                Err(e) => {
                    debug!("connection {} read frame error: {}", self.id, e);
                    let _ = self.force_close().await;
                    break;
                }
            };

            if heartbeat.enabled() {
                self.refresh_heartbeat();
            }

            match self.state() {
                ConnState::Hanged => continue,
                ConnState::Closed => break,
                ConnState::Opened => {}
            }

            if frame.is_heartbeat {
                if heartbeat.mechanism == HeartbeatMechanism::Responsive {
                    let ack = encode_heartbeat(&self.pool, heartbeat.with_server_time);
                    if let Err(e) = self.write_frame(&writer, &ack).await {
                        error!("write heartbeat message error: {}", e);
                    }
                }
                continue;
            }

            if frame.payload.is_empty() {
                continue;
            }

            self.handler.on_receive(&self, frame.payload);
        }
        trace!("connection {} reader loop exit", self.id);
    }
}
