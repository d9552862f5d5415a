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

//! Wire framing.
//!
//! ```text
//! +----------------+----------+------------------+
//! | length: u32 BE | flags:u8 | body             |
//! +----------------+----------+------------------+
//!                  |<------- length bytes ------>|
//! ```
//!
//! `flags & 0x80` marks a heartbeat. A heartbeat body is either empty or
//! an `i64` BE server time in milliseconds.

use std::io::{self, ErrorKind};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::buffer::{NocopyBuffer, Whence, WriterPool};
use crate::{AppError, AppResult};

pub const LENGTH_FIELD_SIZE: usize = 4;
pub const FLAGS_SIZE: usize = 1;
pub const HEARTBEAT_FLAG: u8 = 0x80;
const SERVER_TIME_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub is_heartbeat: bool,
    pub payload: Bytes,
}

impl Frame {
    /// Validates the length field and returns the size of the whole frame
    /// once it is fully buffered.
    pub fn check(buffer: &mut BytesMut, max_frame_size: usize) -> AppResult<usize> {
        if buffer.remaining() < LENGTH_FIELD_SIZE {
            return Err(AppError::Incomplete);
        }
        let mut length_field = &buffer[..LENGTH_FIELD_SIZE];
        let body_size = length_field.get_u32() as usize;
        if body_size < FLAGS_SIZE {
            return Err(AppError::MalformedProtocol(format!(
                "frame length {} is shorter than its header",
                body_size
            )));
        }
        if body_size > max_frame_size {
            return Err(AppError::FrameTooLarge(body_size));
        }
        let frame_size = LENGTH_FIELD_SIZE + body_size;
        if buffer.remaining() < frame_size {
            buffer.reserve(frame_size - buffer.remaining());
            return Err(AppError::Incomplete);
        }
        Ok(frame_size)
    }

    pub fn parse(buffer: &mut BytesMut, max_frame_size: usize) -> AppResult<Option<Frame>> {
        match Frame::check(buffer, max_frame_size) {
            Ok(frame_size) => {
                let mut frame = buffer.split_to(frame_size);
                frame.advance(LENGTH_FIELD_SIZE);
                let flags = frame.get_u8();
                Ok(Some(Frame {
                    is_heartbeat: flags & HEARTBEAT_FLAG != 0,
                    payload: frame.freeze(),
                }))
            }
            Err(AppError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Server time carried by a heartbeat, if any.
    pub fn server_time(&self) -> Option<i64> {
        if self.is_heartbeat && self.payload.len() == SERVER_TIME_SIZE {
            let mut body = &self.payload[..];
            Some(body.get_i64())
        } else {
            None
        }
    }
}

/// Builds a data frame: the header comes from the pool, the payload is
/// mounted as is.
pub fn encode_frame(pool: &Arc<WriterPool>, payload: Bytes) -> AppResult<NocopyBuffer> {
    let body_size = FLAGS_SIZE + payload.len();
    let length = u32::try_from(body_size).map_err(|_| AppError::FrameTooLarge(body_size))?;

    let mut buffer = NocopyBuffer::new(pool.clone());
    let header = buffer.allocate(LENGTH_FIELD_SIZE + FLAGS_SIZE, Whence::Head);
    header.put_u32(length);
    header.put_u8(0);
    if !payload.is_empty() {
        buffer.mount(payload, Whence::Tail);
    }
    Ok(buffer)
}

pub fn encode_heartbeat(pool: &Arc<WriterPool>, with_server_time: bool) -> NocopyBuffer {
    let body_size = if with_server_time {
        FLAGS_SIZE + SERVER_TIME_SIZE
    } else {
        FLAGS_SIZE
    };

    let mut buffer = NocopyBuffer::new(pool.clone());
    let writer = buffer.allocate(LENGTH_FIELD_SIZE + body_size, Whence::Tail);
    writer.put_u32(body_size as u32);
    writer.put_u8(HEARTBEAT_FLAG);
    if with_server_time {
        writer.put_i64(chrono::Utc::now().timestamp_millis());
    }
    buffer
}

/// Decodes frames from the read side of a transport.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, buffer_size: usize, max_frame_size: usize) -> Self {
        FrameReader {
            reader,
            buffer: BytesMut::with_capacity(buffer_size),
            max_frame_size,
        }
    }

    /// Reads the next frame.
    ///
    /// Returns `None` when the peer closed the stream between frames and an
    /// error when it closed in the middle of one. Cancel safe: partially
    /// read bytes stay in the internal buffer.
    pub async fn read_frame(&mut self) -> AppResult<Option<Frame>> {
        loop {
            if let Some(frame) = Frame::parse(&mut self.buffer, self.max_frame_size)? {
                return Ok(Some(frame));
            }
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(
                        io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer")
                            .into(),
                    )
                };
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}
