//! handler.rs — frame dispatch.
//!
//! One decoded frame in, one response frame out, zero or more gate-filtered
//! bus events on the side. Frames are independent: a bad body earns a
//! "malformed" general response and the loop moves on; only write failures
//! (or timeouts) kill the session.

use std::time::{Duration, Instant};

use jt808_proto::body::{
    result_code, AuthRequest, BatchLocation, GeneralResponse, LocationReport, Registration,
    RegistrationResponse,
};
use jt808_proto::{msg_id, DeviceId, Frame};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bus::BusSink;
use crate::config::GatewayConfig;
use crate::gate::DeviceStatus;
use crate::payload;
use crate::session::Session;

/// Responses must land within this or the session is torn down.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that end a session. Everything else is recovered per frame.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("read failed: {0}")]
    Read(std::io::Error),

    #[error("response write failed: {0}")]
    Write(std::io::Error),

    #[error("response write timed out")]
    WriteTimeout,

    #[error(transparent)]
    Oversize(#[from] jt808_proto::ScanError),
}

#[derive(Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    /// Logout: the response has been flushed, close the socket.
    Close,
}

pub async fn handle_frame<W>(
    session: &mut Session,
    raw: &[u8],
    cfg: &GatewayConfig,
    bus: &dyn BusSink,
    writer: &mut W,
) -> Result<FrameOutcome, SessionError>
where
    W: AsyncWrite + Unpin,
{
    let frame = match Frame::decode(raw) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(
                peer = %session.peer_addr,
                device = session.device_label(),
                "dropping undecodable frame: {e}"
            );
            return Ok(FrameOutcome::Continue);
        }
    };

    session.identify(&frame.device_id);
    let device = frame.device_id.clone();
    let now = Instant::now();

    match frame.msg_id {
        msg_id::TERMINAL_HEARTBEAT => {
            debug!(device = %device, "heartbeat");
            respond_general(session, writer, &frame, result_code::SUCCESS).await?;
            if session.gate.allow_heartbeat(now) {
                publish(
                    bus,
                    payload::topic(&cfg.bus_topic_prefix, &device, "heartbeat"),
                    payload::heartbeat(&device),
                );
            }
            emit_status(session, cfg, bus, &device, DeviceStatus::Online, now);
            Ok(FrameOutcome::Continue)
        }

        msg_id::TERMINAL_LOGOUT => {
            info!(device = %device, "logout");
            respond_general(session, writer, &frame, result_code::SUCCESS).await?;
            publish(
                bus,
                payload::topic(&cfg.bus_topic_prefix, &device, "logout"),
                payload::logout(&device),
            );
            emit_status(session, cfg, bus, &device, DeviceStatus::Offline, now);
            Ok(FrameOutcome::Close)
        }

        msg_id::TERMINAL_REGISTRATION => {
            match Registration::parse(&frame.body) {
                Ok(reg) => {
                    info!(device = %device, model = %reg.terminal_model, "registration");
                    let body = RegistrationResponse {
                        ack_serial: frame.serial_no,
                        result: result_code::SUCCESS,
                        auth_code: Some(cfg.registration_auth_code().to_string()),
                    }
                    .encode();
                    let response = Frame::new(
                        msg_id::REGISTRATION_RESPONSE,
                        device.clone(),
                        session.next_serial(),
                        body,
                    );
                    write_frame(writer, &response).await?;
                    if session.gate.allow_registration(now) {
                        publish(
                            bus,
                            payload::topic(&cfg.bus_topic_prefix, &device, "registration"),
                            payload::registration(&device, &reg),
                        );
                    }
                    emit_status(session, cfg, bus, &device, DeviceStatus::Online, now);
                }
                Err(e) => {
                    warn!(device = %device, "bad registration body: {e}");
                    respond_general(session, writer, &frame, result_code::MALFORMED).await?;
                }
            }
            Ok(FrameOutcome::Continue)
        }

        msg_id::TERMINAL_AUTH => {
            match AuthRequest::parse(&frame.body) {
                Ok(auth) => {
                    info!(device = %device, "authentication");
                    respond_general(session, writer, &frame, result_code::SUCCESS).await?;
                    if session.gate.allow_auth(&auth.auth_code) {
                        publish(
                            bus,
                            payload::topic(&cfg.bus_topic_prefix, &device, "authentication"),
                            payload::authentication(&device, &auth.auth_code),
                        );
                    }
                    emit_status(session, cfg, bus, &device, DeviceStatus::Online, now);
                }
                Err(e) => {
                    warn!(device = %device, "bad authentication body: {e}");
                    respond_general(session, writer, &frame, result_code::MALFORMED).await?;
                }
            }
            Ok(FrameOutcome::Continue)
        }

        msg_id::LOCATION_REPORT => {
            match LocationReport::parse(&frame.body) {
                Ok(report) => {
                    respond_general(session, writer, &frame, result_code::SUCCESS).await?;
                    let decision = session.gate.check_location(
                        report.latitude(),
                        report.longitude(),
                        report.speed_kmh(),
                        now,
                    );
                    if decision.release {
                        debug!(
                            device = %device,
                            activity = decision.activity.label(),
                            "publishing location"
                        );
                        publish(
                            bus,
                            payload::location_topic(&cfg.bus_location_topic_template, &device),
                            payload::location(&device, &report, cfg.output.optimize_payload),
                        );
                        publish(
                            bus,
                            payload::tracking_topic(&cfg.bus_topic_prefix),
                            payload::tracking(&device, &report),
                        );
                    } else {
                        debug!(
                            device = %device,
                            elapsed_secs = decision.elapsed.as_secs(),
                            distance_m = decision.distance_m,
                            "location suppressed by gate"
                        );
                    }
                    emit_status(session, cfg, bus, &device, DeviceStatus::Online, now);
                }
                Err(e) => {
                    warn!(device = %device, "bad location body: {e}");
                    respond_general(session, writer, &frame, result_code::MALFORMED).await?;
                }
            }
            Ok(FrameOutcome::Continue)
        }

        msg_id::BATCH_LOCATION_UPLOAD => {
            match BatchLocation::parse(&frame.body) {
                Ok(batch) => {
                    info!(device = %device, count = batch.items.len(), "batch location upload");
                    respond_general(session, writer, &frame, result_code::SUCCESS).await?;
                    publish(
                        bus,
                        payload::topic(&cfg.bus_topic_prefix, &device, "batch_location"),
                        payload::batch_location(&device, &batch),
                    );
                    emit_status(session, cfg, bus, &device, DeviceStatus::Online, now);
                }
                Err(e) => {
                    warn!(device = %device, "bad batch location body: {e}");
                    respond_general(session, writer, &frame, result_code::MALFORMED).await?;
                }
            }
            Ok(FrameOutcome::Continue)
        }

        other => {
            info!(device = %device, msg_id = format_args!("{other:#06x}"), "unsupported message");
            respond_general(session, writer, &frame, result_code::UNSUPPORTED).await?;
            Ok(FrameOutcome::Continue)
        }
    }
}

/// Publish the device's connectivity status, gate permitting.
fn emit_status(
    session: &mut Session,
    cfg: &GatewayConfig,
    bus: &dyn BusSink,
    device: &DeviceId,
    status: DeviceStatus,
    now: Instant,
) {
    if session.gate.allow_status(status, now) {
        publish(
            bus,
            payload::topic(&cfg.bus_topic_prefix, device, "status"),
            payload::status(device, status),
        );
    }
}

/// Teardown hook: mark an identified session offline.
pub fn emit_offline(session: &mut Session, cfg: &GatewayConfig, bus: &dyn BusSink) {
    if let Some(device) = session.device_id().cloned() {
        emit_status(session, cfg, bus, &device, DeviceStatus::Offline, Instant::now());
    }
}

async fn respond_general<W>(
    session: &mut Session,
    writer: &mut W,
    request: &Frame,
    result: u8,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    let body = GeneralResponse {
        ack_serial: request.serial_no,
        ack_msg_id: request.msg_id,
        result,
    }
    .encode();
    let response = Frame::new(
        msg_id::PLATFORM_GENERAL_RESPONSE,
        request.device_id.clone(),
        session.next_serial(),
        body,
    );
    write_frame(writer, &response).await
}

async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    let wire = frame.encode();
    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(&wire).await?;
        writer.flush().await
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(SessionError::Write(e)),
        Err(_) => Err(SessionError::WriteTimeout),
    }
}

fn publish(bus: &dyn BusSink, topic: String, payload: serde_json::Value) {
    if !bus.is_connected() {
        warn!(%topic, "bus not connected, dropping publish");
        return;
    }
    if let Err(e) = bus.publish(&topic, payload, 1) {
        warn!(%topic, "publish failed: {e}");
    }
}
