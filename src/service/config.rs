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

extern crate config as _;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

pub const DEFAULT_POOL_BUCKETS: [usize; 9] = [32, 64, 128, 256, 512, 1024, 2048, 4096, 10240];

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    /// 0 means unlimited
    pub max_connections: usize,
    /// upper bound of the length field of an inbound frame
    pub max_frame_size: usize,
    pub read_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: 3553,
            max_connections: 0,
            max_frame_size: 4 * 1024 * 1024,
            read_buffer_size: 4 * 1024,
        }
    }
}

/// How liveness pings flow on a connection.
#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatMechanism {
    /// server writes a heartbeat on every tick
    Ticked,
    /// server answers every heartbeat the client sends
    #[default]
    Responsive,
    /// no liveness checking whatever the interval
    Disabled,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// 0 disables liveness checking
    pub interval_ms: u64,
    pub mechanism: HeartbeatMechanism,
    pub with_server_time: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            interval_ms: 10 * 1000,
            mechanism: HeartbeatMechanism::Responsive,
            with_server_time: false,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn enabled(&self) -> bool {
        self.interval_ms > 0 && self.mechanism != HeartbeatMechanism::Disabled
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConnectionConfig {
    pub write_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            write_queue_capacity: 4096,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WriterPoolConfig {
    pub buckets: Vec<usize>,
    pub max_idle_per_bucket: usize,
}

impl Default for WriterPoolConfig {
    fn default() -> Self {
        WriterPoolConfig {
            buckets: DEFAULT_POOL_BUCKETS.to_vec(),
            max_idle_per_bucket: 1024,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub heartbeat: HeartbeatConfig,
    pub connection: ConnectionConfig,
    pub writer_pool: WriterPoolConfig,
}

impl ServerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.connection.write_queue_capacity == 0 {
            return Err(AppError::InvalidValue(
                "connection.write_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.network.max_frame_size == 0 {
            return Err(AppError::InvalidValue(
                "network.max_frame_size must be greater than 0".to_string(),
            ));
        }
        if self.writer_pool.buckets.contains(&0) {
            return Err(AppError::InvalidValue(
                "writer_pool.buckets must not contain 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.ip, self.network.port)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_load_partial_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conf.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(
            br#"
[network]
ip = "127.0.0.1"
port = 7000

[heartbeat]
interval_ms = 5000
mechanism = "ticked"
with_server_time = true

[writer_pool]
buckets = [16, 32]
"#,
        )
        .unwrap();

        let config = ServerConfig::set_up_config(&path).unwrap();
        assert_eq!(config.listen_address(), "127.0.0.1:7000");
        assert_eq!(config.heartbeat.interval(), Duration::from_secs(5));
        assert_eq!(config.heartbeat.mechanism, HeartbeatMechanism::Ticked);
        assert!(config.heartbeat.with_server_time);
        assert_eq!(config.writer_pool.buckets, vec![16, 32]);
        // untouched sections keep their defaults
        assert_eq!(config.connection.write_queue_capacity, 4096);
        assert_eq!(config.network.max_frame_size, 4 * 1024 * 1024);
    }

    #[test]
    fn test_reject_zero_queue_capacity() {
        let mut config = ServerConfig::default();
        config.connection.write_queue_capacity = 0;
        assert!(matches!(config.validate(), Err(AppError::InvalidValue(_))));
    }

    #[test]
    fn test_heartbeat_enabled() {
        let mut heartbeat = HeartbeatConfig::default();
        assert!(heartbeat.enabled());
        heartbeat.mechanism = HeartbeatMechanism::Disabled;
        assert!(!heartbeat.enabled());
        heartbeat.mechanism = HeartbeatMechanism::Ticked;
        heartbeat.interval_ms = 0;
        assert!(!heartbeat.enabled());
    }

    #[test]
    fn test_missing_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("absent.toml");
        assert!(matches!(
            ServerConfig::set_up_config(&path),
            Err(AppError::ConfigFileError(_))
        ));
    }
}
