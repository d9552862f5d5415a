use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use tether::network::frame::{FrameReader, HEARTBEAT_FLAG};
use tether::service::HeartbeatMechanism;
use tether::{setup_local_tracing, Connection, ConnectionHandler, Server, ServerConfig};

struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn on_receive(&self, conn: &Arc<Connection>, payload: Bytes) {
        let conn = conn.clone();
        tokio::spawn(async move {
            let _ = conn.push(payload).await;
        });
    }
}

fn test_config() -> ServerConfig {
    let _ = setup_local_tracing();
    let mut config = ServerConfig::default();
    config.network.ip = "127.0.0.1".to_string();
    config.network.port = 0;
    config.heartbeat.mechanism = HeartbeatMechanism::Responsive;
    config
}

fn frame(flags: u8, payload: &[u8]) -> Bytes {
    let mut raw = BytesMut::new();
    raw.put_u32((payload.len() + 1) as u32);
    raw.put_u8(flags);
    raw.put_slice(payload);
    raw.freeze()
}

async fn wait_for_len(server: &Server, len: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.connection_manager().len() != len {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection count not reached in time");
}

#[tokio::test]
async fn test_echo_over_tcp() {
    let server = Server::new(test_config(), Arc::new(EchoHandler));
    let addr = server.start().await.unwrap();

    let stream = TcpStream::connect(addr).await.unwrap();
    let (rd, mut wr) = stream.into_split();
    let mut frames = FrameReader::new(rd, 1024, 1024 * 1024);

    wr.write_all(&frame(0, b"hello")).await.unwrap();
    wr.write_all(&frame(HEARTBEAT_FLAG, b"")).await.unwrap();
    wr.write_all(&frame(0, b"world")).await.unwrap();

    // the heartbeat ack is written by the reader loop, the echoes by the
    // writer loop, so only the relative order of the echoes is fixed
    let mut echoes = Vec::new();
    let mut acks = 0;
    while echoes.len() < 2 || acks < 1 {
        let frame = frames.read_frame().await.unwrap().unwrap();
        if frame.is_heartbeat {
            acks += 1;
        } else {
            echoes.push(frame.payload);
        }
    }
    assert_eq!(
        echoes,
        vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")]
    );

    server.stop().await.unwrap();
    assert!(server.connection_manager().is_empty());
    assert_eq!(frames.read_frame().await.unwrap(), None);
}

#[tokio::test]
async fn test_client_disconnect_is_recycled() {
    let server = Server::new(test_config(), Arc::new(EchoHandler));
    let addr = server.start().await.unwrap();

    let clients: Vec<TcpStream> = connect_clients(addr, 3).await;
    wait_for_len(&server, 3).await;

    drop(clients);
    wait_for_len(&server, 0).await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_refuses_new_connections() {
    let server = Server::new(test_config(), Arc::new(EchoHandler));
    let addr = server.start().await.unwrap();
    server.stop().await.unwrap();

    // the listener is gone once the accept loop exits
    match TcpStream::connect(addr).await {
        Err(_) => {}
        Ok(mut stream) => {
            let mut buf = [0u8; 1];
            let read = stream.read(&mut buf).await;
            assert!(matches!(read, Ok(0) | Err(_)));
        }
    }
    assert!(server.connection_manager().is_empty());
}

async fn connect_clients(addr: std::net::SocketAddr, count: usize) -> Vec<TcpStream> {
    let mut clients = Vec::with_capacity(count);
    for _ in 0..count {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }
    clients
}
