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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// connection state errors
    #[error("connection is hanged")]
    ConnectionHanged,

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("heartbeat timeout after {0} ms")]
    HeartbeatTimeout(u64),

    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Accept error = {0}")]
    Accept(String),

    #[error("too many connections, limit: {0}")]
    TooManyConnections(usize),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// protocol errors
    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("frame of length {0} is too large")]
    FrameTooLarge(usize),

    /// marker error
    #[error("incomplete frame")]
    Incomplete,
}

impl AppError {
    /// Whether this error comes from a state guard rather than from I/O.
    pub fn is_state_error(&self) -> bool {
        matches!(self, AppError::ConnectionHanged | AppError::ConnectionClosed)
    }
}
