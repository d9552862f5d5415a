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

use bytes::Bytes;

use super::Connection;

/// Lifecycle hooks of a connection.
///
/// Hooks run synchronously on the connection's own tasks: `on_receive` on
/// the reader loop, `on_disconnect` on whichever task finished the close.
/// Long work belongs on a task spawned by the implementation, a slow hook
/// stalls that connection's ingestion.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called once, after registration and before the loops start.
    ///
    /// The writer loop is not running yet: pushes queue up and a graceful
    /// close cannot drain until this hook has returned. Both are fine from a
    /// spawned task, but blocking on them inside the hook deadlocks.
    fn on_connect(&self, _conn: &Arc<Connection>) {}

    /// Called once, after either close path completed.
    fn on_disconnect(&self, _conn: &Arc<Connection>) {}

    /// Called for every non-empty data frame.
    fn on_receive(&self, _conn: &Arc<Connection>, _payload: Bytes) {}
}

/// Handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ConnectionHandler for NoopHandler {}
