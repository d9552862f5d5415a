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

//! Network Module Implementation
//!
//! Connection handling for persistent client sessions.
//!
//! # Components
//!
//! - `Connection`: one socket, its state machine and its reader/writer loops
//! - `ConnectionManager`: registry of live connections, id allocation and
//!   connect/disconnect dispatch
//! - `ConnectionHandler`: lifecycle hooks implemented by the application
//! - `frame`: length-prefixed data and heartbeat frames
//!
//! # Features
//!
//! - Graceful close that drains pushed frames, forced close on I/O error
//! - Heartbeat liveness checking (ticked or responsive)
//! - Outbound frames assembled without copying the payload

pub use conn_manager::ConnectionManager;
pub use connection::{ConnState, Connection, Transport};
pub use frame::{encode_frame, encode_heartbeat, Frame, FrameReader};
pub use handler::{ConnectionHandler, NoopHandler};

mod conn_manager;
mod connection;
pub mod frame;
mod handler;
