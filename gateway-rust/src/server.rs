//! server.rs — TCP listener and per-session tasks.
//!
//! One listener, one task per accepted connection. A session task owns its
//! socket, scanner and gate; frames are handled in receive order with the
//! response written before the next read. Any single session's failure
//! tears down only that session — the accept loop survives everything short
//! of shutdown.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::bus::BusSink;
use crate::config::GatewayConfig;
use crate::handler::{self, FrameOutcome, SessionError};
use crate::session::Session;

const READ_CHUNK: usize = 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

pub async fn run(
    cfg: Arc<GatewayConfig>,
    bus: Arc<dyn BusSink>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let addr = format!("{}:{}", cfg.jt808_host, cfg.jt808_port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!("📡 JT808 listener bound on {addr}");
    serve(listener, cfg, bus, shutdown).await;
    Ok(())
}

/// Accept loop on an already-bound listener.
async fn serve(
    listener: TcpListener,
    cfg: Arc<GatewayConfig>,
    bus: Arc<dyn BusSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "new connection");
                    let cfg = cfg.clone();
                    let bus = bus.clone();
                    let shutdown = shutdown.clone();
                    sessions.spawn(async move {
                        handle_connection(stream, peer, cfg, bus, shutdown).await;
                    });
                }
                Err(e) => {
                    // transient accept failures (fd exhaustion and friends)
                    // back off briefly and keep serving
                    warn!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            // reap finished session tasks so the set does not grow unbounded
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    drop(listener);
    if !sessions.is_empty() {
        info!(active = sessions.len(), "shutting down, draining sessions");
        let drain = async {
            while sessions.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("grace window expired, aborting remaining sessions");
            sessions.abort_all();
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    cfg: Arc<GatewayConfig>,
    bus: Arc<dyn BusSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut session = Session::new(peer, &cfg);
    let (mut reader, mut writer) = stream.into_split();
    let mut chunk = [0u8; READ_CHUNK];

    let outcome: Result<(), SessionError> = 'conn: loop {
        tokio::select! {
            _ = shutdown.changed() => break 'conn Ok(()),
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break 'conn Ok(()),
                Ok(n) => {
                    if let Err(e) = session.scanner.extend(&chunk[..n]) {
                        break 'conn Err(e.into());
                    }
                    while let Some(raw) = session.scanner.next_frame() {
                        match handler::handle_frame(
                            &mut session,
                            &raw,
                            &cfg,
                            bus.as_ref(),
                            &mut writer,
                        )
                        .await
                        {
                            Ok(FrameOutcome::Continue) => {}
                            Ok(FrameOutcome::Close) => break 'conn Ok(()),
                            Err(e) => break 'conn Err(e),
                        }
                    }
                }
                Err(e) => break 'conn Err(SessionError::Read(e)),
            },
        }
    };

    match outcome {
        Ok(()) => info!(%peer, device = session.device_label(), "session closed"),
        Err(e) => warn!(%peer, device = session.device_label(), "session torn down: {e}"),
    }
    handler::emit_offline(&mut session, &cfg, bus.as_ref());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::RecordingBus;
    use jt808_proto::body::{result_code, Registration, RegistrationResponse};
    use jt808_proto::{msg_id, DeviceId, Frame, FrameScanner};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start_server(bus: Arc<RecordingBus>) -> (std::net::SocketAddr, watch::Sender<bool>) {
        let cfg = Arc::new(GatewayConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(serve(listener, cfg, bus as Arc<dyn BusSink>, rx));
        (addr, tx)
    }

    async fn read_one_frame(stream: &mut TcpStream) -> Frame {
        let mut scanner = FrameScanner::new();
        let mut chunk = [0u8; 256];
        loop {
            if let Some(raw) = scanner.next_frame() {
                return Frame::decode(&raw).unwrap();
            }
            let n = stream.read(&mut chunk).await.unwrap();
            assert_ne!(n, 0, "server closed before responding");
            scanner.extend(&chunk[..n]).unwrap();
        }
    }

    #[tokio::test]
    async fn registration_over_tcp_then_offline_on_disconnect() {
        let bus = Arc::new(RecordingBus::new());
        let (addr, shutdown) = start_server(bus.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let body = Registration {
            province_id: 11,
            city_id: 101,
            manufacturer_id: "PTRKR".into(),
            terminal_model: "PT-100".into(),
            terminal_id: "PT00001".into(),
            plate_color: 0,
            license_plate: String::new(),
        }
        .encode();
        let wire = Frame::new(
            msg_id::TERMINAL_REGISTRATION,
            DeviceId::from_digits("123456789012"),
            0x0007,
            body,
        )
        .encode();
        stream.write_all(&wire).await.unwrap();

        let response = read_one_frame(&mut stream).await;
        assert_eq!(response.msg_id, msg_id::REGISTRATION_RESPONSE);
        let resp = RegistrationResponse::parse(&response.body).unwrap();
        assert_eq!(resp.ack_serial, 0x0007);
        assert_eq!(resp.result, result_code::SUCCESS);
        assert_eq!(resp.auth_code.as_deref(), Some("123456"));

        // dropping the socket must surface an offline status
        drop(stream);
        let mut offline_seen = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let published = bus.published.lock().unwrap();
            if published
                .iter()
                .any(|m| m.topic.ends_with("/status") && m.payload["status"] == "offline")
            {
                offline_seen = true;
                break;
            }
        }
        assert!(offline_seen, "offline status never published");
        assert!(bus
            .topics()
            .contains(&"pettracker/123456789012/registration".to_string()));

        let _ = shutdown.send(true);
    }
}
