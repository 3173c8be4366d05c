//! client.rs — terminal-side protocol client.
//!
//! Owns the TCP connection to the gateway and drives the handshake:
//! registration (with a bounded wait for the auth code), then
//! authentication (with a bounded wait for the ack). Both waits degrade
//! gracefully — a silent or sloppy platform gets the default auth code or a
//! forced-authenticated state rather than a stuck simulator. After the
//! handshake the client splits into a sender and a response reader so the
//! emit loops never block on inbound traffic.

use std::time::Duration;

use bytes::Bytes;
use jt808_proto::body::{
    result_code, AuthRequest, BatchLocation, GeneralResponse, LocationReport, Registration,
    RegistrationResponse,
};
use jt808_proto::{msg_id, DeviceId, Frame, FrameScanner};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const REGISTRATION_WAIT: Duration = Duration::from_secs(30);
pub const AUTH_WAIT: Duration = Duration::from_secs(10);
const DEFAULT_AUTH_CODE: &str = "123456";
const READ_CHUNK: usize = 1024;

pub struct DeviceClient {
    stream: TcpStream,
    scanner: FrameScanner,
    device_id: DeviceId,
    serial_no: u16,
    auth_code: Option<String>,
    pub authenticated: bool,
}

impl DeviceClient {
    pub async fn connect(addr: &str, device_id: DeviceId) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        info!(%addr, device = %device_id, "connected to platform");
        Ok(Self {
            stream,
            scanner: FrameScanner::new(),
            device_id,
            serial_no: 0,
            auth_code: None,
            authenticated: false,
        })
    }

    fn next_serial(&mut self) -> u16 {
        self.serial_no = self.serial_no.wrapping_add(1);
        self.serial_no
    }

    async fn send(&mut self, msg_id: u16, body: Bytes) -> std::io::Result<u16> {
        let serial = self.next_serial();
        let frame = Frame::new(msg_id, self.device_id.clone(), serial, body);
        self.stream.write_all(&frame.encode()).await?;
        Ok(serial)
    }

    /// Next decodable frame from the platform; `None` on EOF. Undecodable
    /// frames are dropped and the read continues.
    async fn read_frame(&mut self) -> std::io::Result<Option<Frame>> {
        loop {
            while let Some(raw) = self.scanner.next_frame() {
                match Frame::decode(&raw) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => warn!("dropping undecodable frame from platform: {e}"),
                }
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            if let Err(e) = self.scanner.extend(&chunk[..n]) {
                return Err(std::io::Error::other(e));
            }
        }
    }

    /// Send registration and wait (bounded) for the auth code. A missing or
    /// rejected response falls back to the default code so a live
    /// connection is never abandoned over a handshake detail.
    pub async fn register(&mut self, registration: &Registration) -> std::io::Result<()> {
        self.send(msg_id::TERMINAL_REGISTRATION, registration.encode())
            .await?;
        debug!("registration sent, waiting for response");

        match timeout(REGISTRATION_WAIT, self.wait_registration_response()).await {
            Ok(Ok(Some(code))) => {
                info!(auth_code = %code, "registration accepted");
                self.auth_code = Some(code);
            }
            Ok(Ok(None)) => {
                warn!("registration response carried no usable auth code, using default");
                self.auth_code = Some(DEFAULT_AUTH_CODE.into());
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(
                    "no registration response within {REGISTRATION_WAIT:?}, using default auth code"
                );
                self.auth_code = Some(DEFAULT_AUTH_CODE.into());
            }
        }
        Ok(())
    }

    async fn wait_registration_response(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let Some(frame) = self.read_frame().await? else {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            };
            if frame.msg_id != msg_id::REGISTRATION_RESPONSE {
                debug!(
                    msg_id = format_args!("{:#06x}", frame.msg_id),
                    "ignoring frame while waiting for registration response"
                );
                continue;
            }
            return match RegistrationResponse::parse(&frame.body) {
                Ok(resp) if resp.result == result_code::SUCCESS => Ok(resp.auth_code),
                Ok(resp) => {
                    warn!(result = resp.result, "registration rejected by platform");
                    Ok(None)
                }
                Err(e) => {
                    warn!("unparseable registration response: {e}");
                    Ok(None)
                }
            };
        }
    }

    /// Authenticate with the stored (or default) code; assume success if
    /// the ack never arrives.
    pub async fn authenticate(&mut self) -> std::io::Result<()> {
        let auth_code = self
            .auth_code
            .clone()
            .unwrap_or_else(|| DEFAULT_AUTH_CODE.into());
        self.send(msg_id::TERMINAL_AUTH, AuthRequest { auth_code }.encode())
            .await?;
        debug!("authentication sent, waiting for ack");

        match timeout(AUTH_WAIT, self.wait_general_response(msg_id::TERMINAL_AUTH)).await {
            Ok(Ok(result)) => {
                if result == result_code::SUCCESS {
                    info!("authenticated");
                } else {
                    warn!(result, "authentication answered non-success, proceeding anyway");
                }
                self.authenticated = true;
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!("no authentication ack within {AUTH_WAIT:?}, assuming authenticated");
                self.authenticated = true;
            }
        }
        Ok(())
    }

    async fn wait_general_response(&mut self, ack_msg_id: u16) -> std::io::Result<u8> {
        loop {
            let Some(frame) = self.read_frame().await? else {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            };
            if frame.msg_id != msg_id::PLATFORM_GENERAL_RESPONSE {
                continue;
            }
            match GeneralResponse::parse(&frame.body) {
                Ok(resp) if resp.ack_msg_id == ack_msg_id => return Ok(resp.result),
                Ok(resp) => debug!(
                    ack = format_args!("{:#06x}", resp.ack_msg_id),
                    "general response for a different message"
                ),
                Err(e) => warn!("unparseable general response: {e}"),
            }
        }
    }

    /// Split into the steady-state halves: a sender for the emit loops and
    /// a reader that drains platform acks.
    pub fn split(self) -> (ResponseReader, FrameSender) {
        let (read_half, write_half) = self.stream.into_split();
        (
            ResponseReader {
                reader: read_half,
                scanner: self.scanner,
            },
            FrameSender {
                writer: write_half,
                device_id: self.device_id,
                serial_no: self.serial_no,
            },
        )
    }
}

// ── Steady-state halves ───────────────────────────────────────────────────────

pub struct FrameSender {
    writer: OwnedWriteHalf,
    device_id: DeviceId,
    serial_no: u16,
}

impl FrameSender {
    fn next_serial(&mut self) -> u16 {
        self.serial_no = self.serial_no.wrapping_add(1);
        self.serial_no
    }

    async fn send(&mut self, msg_id: u16, body: Bytes) -> std::io::Result<()> {
        let serial = self.next_serial();
        let frame = Frame::new(msg_id, self.device_id.clone(), serial, body);
        self.writer.write_all(&frame.encode()).await
    }

    pub async fn send_heartbeat(&mut self) -> std::io::Result<()> {
        self.send(msg_id::TERMINAL_HEARTBEAT, Bytes::new()).await
    }

    pub async fn send_location(&mut self, report: &LocationReport) -> std::io::Result<()> {
        self.send(msg_id::LOCATION_REPORT, report.encode()).await
    }

    pub async fn send_batch(&mut self, batch: &BatchLocation) -> std::io::Result<()> {
        self.send(msg_id::BATCH_LOCATION_UPLOAD, batch.encode())
            .await
    }

    pub async fn send_logout(&mut self) -> std::io::Result<()> {
        self.send(msg_id::TERMINAL_LOGOUT, Bytes::new()).await
    }
}

/// Drains and logs platform responses until the socket closes. Runs as its
/// own task so sends never contend with reads.
pub struct ResponseReader {
    reader: OwnedReadHalf,
    scanner: FrameScanner,
}

impl ResponseReader {
    pub async fn run(mut self) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            while let Some(raw) = self.scanner.next_frame() {
                match Frame::decode(&raw) {
                    Ok(frame) if frame.msg_id == msg_id::PLATFORM_GENERAL_RESPONSE => {
                        match GeneralResponse::parse(&frame.body) {
                            Ok(resp) => debug!(
                                ack = format_args!("{:#06x}", resp.ack_msg_id),
                                result = resp.result,
                                "platform ack"
                            ),
                            Err(e) => warn!("unparseable general response: {e}"),
                        }
                    }
                    Ok(frame) => debug!(
                        msg_id = format_args!("{:#06x}", frame.msg_id),
                        "unexpected platform frame"
                    ),
                    Err(e) => warn!("dropping undecodable frame from platform: {e}"),
                }
            }
            match self.reader.read(&mut chunk).await {
                Ok(0) => {
                    info!("platform closed the connection");
                    return;
                }
                Ok(n) => {
                    if self.scanner.extend(&chunk[..n]).is_err() {
                        warn!("platform flooded the read buffer, dropping connection");
                        return;
                    }
                }
                Err(e) => {
                    warn!("read error: {e}");
                    return;
                }
            }
        }
    }
}
