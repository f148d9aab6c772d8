//! TCP front door: the live map port and the sensor port.
//!
//! Both speak length-delimited frames. Map viewers send
//! `[op u8][utf8 "lat:lng"]` (op 1 subscribes to the containing cell, op 0
//! unsubscribes) and receive 13-byte occupancy deltas. Sensors send JSON
//! reports and receive JSON replies plus server-initiated reservation notices.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, EngineError};
use crate::grid::Cell;
use crate::limits::MAX_FRAME_LEN;
use crate::model::{PhysicalAddress, Sensor, now_ms};
use crate::notify::{GridHub, SensorHub, SensorMessage};
use crate::observability as obs;

const OP_UNSUBSCRIBE: u8 = 0;
const OP_SUBSCRIBE: u8 = 1;
const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Map,
    Sensor,
}

impl Port {
    pub fn label(&self) -> &'static str {
        match self {
            Port::Map => "map",
            Port::Sensor => "sensor",
        }
    }
}

/// What a connection handler needs from the process.
#[derive(Clone)]
pub struct Gateway {
    engine: Arc<Engine>,
    grid_hub: Arc<GridHub>,
    sensor_hub: Arc<SensorHub>,
}

impl Gateway {
    pub fn new(engine: Arc<Engine>, grid_hub: Arc<GridHub>, sensor_hub: Arc<SensorHub>) -> Self {
        Self {
            engine,
            grid_hub,
            sensor_hub,
        }
    }

    /// Accept on `listener` until `shutdown` flips to true. Connections past
    /// the semaphore's permits are dropped on accept.
    pub async fn serve(
        self,
        listener: TcpListener,
        port: Port,
        semaphore: Arc<Semaphore>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let label = port.label();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (socket, peer) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("{label} accept error: {e}");
                            continue;
                        }
                    };

                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("connection limit reached, rejecting {peer} on {label}");
                            metrics::counter!(obs::CONNECTIONS_REJECTED_TOTAL, "port" => label).increment(1);
                            drop(socket);
                            continue;
                        }
                    };

                    debug!("{label} connection from {peer}");
                    metrics::counter!(obs::CONNECTIONS_TOTAL, "port" => label).increment(1);
                    metrics::gauge!(obs::CONNECTIONS_ACTIVE, "port" => label).increment(1.0);
                    let gateway = self.clone();

                    tokio::spawn(async move {
                        let _permit = permit;
                        let result = match port {
                            Port::Map => gateway.map_connection(socket).await,
                            Port::Sensor => gateway.sensor_connection(socket).await,
                        };
                        if let Err(e) = result {
                            debug!("{label} connection from {peer} ended: {e}");
                        }
                        metrics::gauge!(obs::CONNECTIONS_ACTIVE, "port" => label).decrement(1.0);
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("{label} listener stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn map_connection(&self, socket: TcpStream) -> io::Result<()> {
        let mut framed = Framed::new(socket, codec());
        let (tx, mut rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);
        let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();

        let result = loop {
            tokio::select! {
                frame = framed.next() => match frame {
                    Some(Ok(frame)) => match parse_map_frame(&frame) {
                        Some((OP_SUBSCRIBE, cell)) => {
                            let id = cell.id();
                            if !subscriptions.contains_key(&id) {
                                let forward = forward_deltas(self.grid_hub.subscribe(&cell), tx.clone());
                                subscriptions.insert(id, tokio::spawn(forward));
                            }
                        }
                        Some((_, cell)) => {
                            if let Some(task) = subscriptions.remove(&cell.id()) {
                                task.abort();
                            }
                        }
                        None => debug!("ignoring malformed map frame ({} bytes)", frame.len()),
                    },
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                },
                Some(delta) = rx.recv() => {
                    if let Err(e) = framed.send(delta).await {
                        break Err(e);
                    }
                }
            }
        };

        for (_, task) in subscriptions {
            task.abort();
        }
        result
    }

    async fn sensor_connection(&self, socket: TcpStream) -> io::Result<()> {
        let mut framed = Framed::new(socket, codec());
        let (tx, mut rx) = mpsc::channel::<SensorMessage>(OUTBOUND_QUEUE);
        let mut bound: Option<PhysicalAddress> = None;

        let result = loop {
            tokio::select! {
                frame = framed.next() => match frame {
                    Some(Ok(frame)) => {
                        let report: SensorReport = match serde_json::from_slice(&frame) {
                            Ok(report) => report,
                            Err(e) => {
                                warn!("closing sensor connection on unreadable frame: {e}");
                                break Ok(());
                            }
                        };
                        let reply = match self.handle_report(report, &tx, &mut bound).await {
                            Ok(()) => json!({ "ok": true }),
                            Err(e) => json!({
                                "ok": false,
                                "error": e.kind().as_str(),
                                "reason": e.to_string(),
                            }),
                        };
                        if let Err(e) = framed.send(Bytes::from(reply.to_string())).await {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                },
                Some(message) = rx.recv() => {
                    let body = match serde_json::to_vec(&message) {
                        Ok(body) => body,
                        Err(e) => {
                            error!("sensor message encode failed: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = framed.send(Bytes::from(body)).await {
                        break Err(e);
                    }
                }
            }
        };

        if let Some(address) = bound {
            self.sensor_hub.unbind(address, &tx);
            info!(%address, "sensor disconnected");
        }
        result
    }

    async fn handle_report(
        &self,
        report: SensorReport,
        tx: &mpsc::Sender<SensorMessage>,
        bound: &mut Option<PhysicalAddress>,
    ) -> Result<(), EngineError> {
        let sensor = self.authorize(&report).await?;
        if bound.is_none() {
            self.sensor_hub.bind(sensor.address, tx.clone());
            *bound = Some(sensor.address);
            info!(address = %sensor.address, space = %sensor.space, "sensor connected");
        }

        if report.parked {
            let vehicle = report
                .vehicle_id
                .as_deref()
                .ok_or_else(|| EngineError::InvalidInput("parked report without vehicle_id".into()))?;
            self.engine.sensor_reports_arrival(vehicle, sensor.id, now_ms()).await?;
        } else {
            self.engine.sensor_reports_departure(sensor.id, now_ms()).await?;
        }
        Ok(())
    }

    async fn authorize(&self, report: &SensorReport) -> Result<Sensor, EngineError> {
        let result = self
            .engine
            .authorize_sensor(report.physical_address, &report.secret)
            .await;
        if let Err(e) = &result {
            warn!(address = %report.physical_address, "sensor authorization failed: {e}");
            metrics::counter!(obs::SENSOR_AUTH_FAILURES_TOTAL).increment(1);
        }
        result
    }
}

#[derive(Debug, Deserialize)]
struct SensorReport {
    physical_address: PhysicalAddress,
    secret: String,
    parked: bool,
    #[serde(default)]
    vehicle_id: Option<String>,
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// `(op, cell)` for a well-formed map frame.
fn parse_map_frame(frame: &[u8]) -> Option<(u8, Cell)> {
    let (&op, point) = frame.split_first()?;
    if op != OP_SUBSCRIBE && op != OP_UNSUBSCRIBE {
        return None;
    }
    let point = std::str::from_utf8(point).ok()?;
    Some((op, Cell::parse_point(point)?))
}

async fn forward_deltas(mut deltas: broadcast::Receiver<Bytes>, tx: mpsc::Sender<Bytes>) {
    loop {
        match deltas.recv().await {
            Ok(delta) => {
                if tx.send(delta).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("map viewer lagged, skipped {n} deltas");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
