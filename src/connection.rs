//! Serial transport and board-identity bookkeeping.
//!
//! All blocking serial I/O happens on one dedicated worker thread: the
//! async tick loop sends a `WorkerRequest` carrying a `oneshot` reply channel over a
//! `std::sync::mpsc` channel, then `.await`s the reply. This keeps every
//! board's operations serialised on its own worker call (nothing else
//! touches the port handles) without blocking the tokio runtime thread.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use regex::Regex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::GardenError;
use crate::models::SlaveId;
use crate::protocol::Message;

pub const DEFAULT_SERIAL_GLOB: &str = "/dev/ttyACM[0-9]+";

enum WorkerRequest {
    Establish {
        port: String,
        reply: oneshot::Sender<Result<String, GardenError>>,
    },
    Probe {
        port: String,
        reply: oneshot::Sender<Result<String, GardenError>>,
    },
    Terminate {
        port: String,
        reply: oneshot::Sender<()>,
    },
    ReadSensor {
        port: String,
        pin_type: String,
        pin: i32,
        driver: String,
        measurement_type: String,
        reply: oneshot::Sender<Result<f64, GardenError>>,
    },
    SetRelay {
        port: String,
        pin: i32,
        state: i32,
        reply: oneshot::Sender<Result<bool, GardenError>>,
    },
    Shutdown,
}

/// Handle to the serial worker thread; cheap to clone, all state lives on
/// the worker side.
#[derive(Clone)]
pub struct SerialWorkerHandle {
    tx: mpsc::Sender<WorkerRequest>,
}

impl SerialWorkerHandle {
    pub fn spawn(baud: u32, read_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("garden-serial".into())
            .spawn(move || SerialWorker::new(rx, baud, read_timeout).run())
            .expect("failed to spawn serial worker thread");
        Self { tx }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WorkerRequest,
    ) -> Result<T, GardenError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| GardenError::FatalHostFault("serial worker thread is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| GardenError::FatalHostFault("serial worker thread dropped reply".into()))
    }

    pub async fn establish(&self, port: &str) -> Result<String, GardenError> {
        self.call(|reply| WorkerRequest::Establish {
            port: port.to_string(),
            reply,
        })
        .await?
    }

    pub async fn probe(&self, port: &str) -> Result<String, GardenError> {
        self.call(|reply| WorkerRequest::Probe {
            port: port.to_string(),
            reply,
        })
        .await?
    }

    pub async fn terminate(&self, port: &str) {
        let _ = self
            .call::<()>(|reply| WorkerRequest::Terminate {
                port: port.to_string(),
                reply,
            })
            .await;
    }

    pub async fn read_sensor(
        &self,
        port: &str,
        pin_type: &str,
        pin: i32,
        driver: &str,
        measurement_type: &str,
    ) -> Result<f64, GardenError> {
        self.call(|reply| WorkerRequest::ReadSensor {
            port: port.to_string(),
            pin_type: pin_type.to_string(),
            pin,
            driver: driver.to_string(),
            measurement_type: measurement_type.to_string(),
            reply,
        })
        .await?
    }

    pub async fn set_relay(&self, port: &str, pin: i32, state: i32) -> Result<bool, GardenError> {
        self.call(|reply| WorkerRequest::SetRelay {
            port: port.to_string(),
            pin,
            state,
            reply,
        })
        .await?
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(WorkerRequest::Shutdown);
    }
}

struct OpenPort {
    path: String,
    port: Box<dyn serialport::SerialPort>,
    leftover: Vec<u8>,
}

impl OpenPort {
    /// Read one line (terminated by `\n`), bounded by `timeout`, discarding
    /// any carried-over partial data from a prior read.
    fn read_line(&mut self, timeout: Duration) -> Result<String, GardenError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut buf = [0u8; 256];

        loop {
            if let Some(pos) = self.leftover.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.leftover.drain(..=pos).collect();
                return Ok(String::from_utf8_lossy(&line).trim_end().to_string());
            }

            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(GardenError::TransientSerialFault {
                    port: self.path.clone(),
                    reason: "read timed out".into(),
                });
            }
            let _ = self.port.set_timeout(remaining.min(Duration::from_millis(200)));

            match self.port.read(&mut buf) {
                Ok(0) => {
                    return Err(GardenError::TransientSerialFault {
                        port: self.path.clone(),
                        reason: "port closed".into(),
                    })
                }
                Ok(n) => self.leftover.extend_from_slice(&buf[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    continue
                }
                Err(e) => {
                    return Err(GardenError::TransientSerialFault {
                        port: self.path.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    fn drain_stale(&mut self) {
        self.leftover.clear();
        let _ = self.port.set_timeout(Duration::from_millis(10));
        let mut buf = [0u8; 256];
        loop {
            match self.port.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    fn send_and_receive(&mut self, msg: &Message, timeout: Duration) -> Result<Message, GardenError> {
        self.drain_stale();
        let wire = msg.encode();
        self.port
            .write_all(wire.as_bytes())
            .map_err(|e| GardenError::TransientSerialFault {
                port: self.path.clone(),
                reason: e.to_string(),
            })?;
        let line = self.read_line(timeout)?;
        Message::parse(&line).map_err(|e| GardenError::TransientSerialFault {
            port: self.path.clone(),
            reason: e.to_string(),
        })
    }
}

struct SerialWorker {
    rx: mpsc::Receiver<WorkerRequest>,
    ports: HashMap<String, OpenPort>,
    baud: u32,
    read_timeout: Duration,
}

impl SerialWorker {
    fn new(rx: mpsc::Receiver<WorkerRequest>, baud: u32, read_timeout: Duration) -> Self {
        Self {
            rx,
            ports: HashMap::new(),
            baud,
            read_timeout,
        }
    }

    fn open(&mut self, path: &str) -> Result<(), GardenError> {
        let port = serialport::new(path, self.baud)
            .timeout(self.read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .open()
            .map_err(|e| GardenError::TransientSerialFault {
                port: path.to_string(),
                reason: e.to_string(),
            })?;
        self.ports.insert(
            path.to_string(),
            OpenPort {
                path: path.to_string(),
                port,
                leftover: Vec::new(),
            },
        );
        Ok(())
    }

    fn run(mut self) {
        while let Ok(req) = self.rx.recv() {
            match req {
                WorkerRequest::Establish { port, reply } => {
                    let result = self.handle_establish(&port);
                    let _ = reply.send(result);
                }
                WorkerRequest::Probe { port, reply } => {
                    let result = self.handle_probe(&port);
                    let _ = reply.send(result);
                }
                WorkerRequest::Terminate { port, reply } => {
                    self.ports.remove(&port);
                    let _ = reply.send(());
                }
                WorkerRequest::ReadSensor {
                    port,
                    pin_type,
                    pin,
                    driver,
                    measurement_type,
                    reply,
                } => {
                    let result =
                        self.handle_read_sensor(&port, &pin_type, pin, &driver, &measurement_type);
                    let _ = reply.send(result);
                }
                WorkerRequest::SetRelay {
                    port,
                    pin,
                    state,
                    reply,
                } => {
                    let result = self.handle_set_relay(&port, pin, state);
                    let _ = reply.send(result);
                }
                WorkerRequest::Shutdown => {
                    debug!("serial worker shutting down");
                    break;
                }
            }
        }
    }

    fn handle_establish(&mut self, path: &str) -> Result<String, GardenError> {
        if !self.ports.contains_key(path) {
            self.open(path)?;
        }
        self.handle_probe(path)
    }

    fn handle_probe(&mut self, path: &str) -> Result<String, GardenError> {
        let open = self
            .ports
            .get_mut(path)
            .ok_or_else(|| GardenError::TransientSerialFault {
                port: path.to_string(),
                reason: "port not open".into(),
            })?;

        match open.send_and_receive(&Message::Uuid, self.read_timeout) {
            Ok(Message::UuidResponse { uuid }) => {
                if uuid.len() != 36 {
                    self.ports.remove(path);
                    Err(GardenError::TransientSerialFault {
                        port: path.to_string(),
                        reason: format!("malformed uuid response: {uuid:?}"),
                    })
                } else {
                    Ok(uuid)
                }
            }
            Ok(other) => {
                self.ports.remove(path);
                Err(GardenError::TransientSerialFault {
                    port: path.to_string(),
                    reason: format!("unexpected response to uuid probe: {other:?}"),
                })
            }
            Err(e) => {
                self.ports.remove(path);
                Err(e)
            }
        }
    }

    fn handle_read_sensor(
        &mut self,
        path: &str,
        pin_type: &str,
        pin: i32,
        driver: &str,
        measurement_type: &str,
    ) -> Result<f64, GardenError> {
        let open = self
            .ports
            .get_mut(path)
            .ok_or_else(|| GardenError::TransientSerialFault {
                port: path.to_string(),
                reason: "port not open".into(),
            })?;

        let req = Message::Sensor {
            pin_type: pin_type.to_string(),
            pin,
            driver: driver.to_string(),
            measurement_type: measurement_type.to_string(),
        };
        match open.send_and_receive(&req, self.read_timeout) {
            Ok(Message::SensorResponse { status, value }) if status == 1 => Ok(value),
            Ok(Message::SensorResponse { .. }) => Err(GardenError::TransientSerialFault {
                port: path.to_string(),
                reason: "sensor reported failure status".into(),
            }),
            Ok(Message::Error { message }) => {
                warn!(port = path, message, "board reported error on sensor read");
                Err(GardenError::TransientSerialFault {
                    port: path.to_string(),
                    reason: message,
                })
            }
            Ok(other) => Err(GardenError::TransientSerialFault {
                port: path.to_string(),
                reason: format!("unexpected response to sensor read: {other:?}"),
            }),
            Err(e) => Err(e),
        }
    }

    fn handle_set_relay(&mut self, path: &str, pin: i32, state: i32) -> Result<bool, GardenError> {
        let open = self
            .ports
            .get_mut(path)
            .ok_or_else(|| GardenError::TransientSerialFault {
                port: path.to_string(),
                reason: "port not open".into(),
            })?;

        let req = Message::Relay { pin, state };
        match open.send_and_receive(&req, self.read_timeout) {
            Ok(Message::RelayResponse { state, .. }) => Ok(state != 0),
            Ok(other) => Err(GardenError::TransientSerialFault {
                port: path.to_string(),
                reason: format!("unexpected response to relay set: {other:?}"),
            }),
            Err(e) => Err(e),
        }
    }
}

/// Compile the configured device glob (default `/dev/ttyACM[0-9]+`) into
/// a regex anchored at both ends.
fn compile_port_pattern(glob: &str) -> Result<Regex, GardenError> {
    let anchored = format!("^{glob}$");
    Regex::new(&anchored)
        .map_err(|e| GardenError::ConfigurationFault(format!("invalid serial glob {glob:?}: {e}")))
}

/// Enumerate serial devices matching `pattern`.
pub fn discover_ports(pattern: &Regex) -> Result<Vec<String>, GardenError> {
    let ports = serialport::available_ports()
        .map_err(|e| GardenError::FatalHostFault(format!("cannot enumerate ports: {e}")))?;

    Ok(ports
        .into_iter()
        .map(|p| p.port_name)
        .filter(|name| pattern.is_match(name))
        .collect())
}

/// Maintains the bijection between attached serial ports and identified
/// slave identities.
pub struct ConnectionManager {
    worker: SerialWorkerHandle,
    port_pattern: Regex,
    port_to_uuid: HashMap<String, SlaveId>,
    uuid_to_port: HashMap<SlaveId, String>,
}

impl ConnectionManager {
    pub fn new(worker: SerialWorkerHandle, serial_glob: &str) -> Result<Self, GardenError> {
        Ok(Self {
            worker,
            port_pattern: compile_port_pattern(serial_glob)?,
            port_to_uuid: HashMap::new(),
            uuid_to_port: HashMap::new(),
        })
    }

    pub fn online_slave_uuids(&self) -> Vec<SlaveId> {
        self.uuid_to_port.keys().cloned().collect()
    }

    pub fn port_for(&self, slave_uuid: &SlaveId) -> Option<&str> {
        self.uuid_to_port.get(slave_uuid).map(|s| s.as_str())
    }

    /// Validate and record a board's reported identity. Only the 36-
    /// character length is checked (spec §4.2's Establish step), not
    /// RFC-4122 well-formedness — the worker's own probe already enforces
    /// the length, so failure here would only indicate a worker/manager
    /// disagreement.
    async fn establish(&mut self, port: &str) {
        match self.worker.establish(port).await {
            Ok(uuid_str) => match SlaveId::new(uuid_str.clone()) {
                Ok(slave_id) => {
                    debug!(port, uuid = %slave_id, "established slave session");
                    self.port_to_uuid.insert(port.to_string(), slave_id.clone());
                    self.uuid_to_port.insert(slave_id, port.to_string());
                }
                Err(_) => {
                    warn!(port, uuid = uuid_str, "uuid_response not 36 characters");
                }
            },
            Err(e) => {
                debug!(port, error = %e, "failed to establish session");
            }
        }
    }

    async fn terminate(&mut self, port: &str) {
        self.worker.terminate(port).await;
        if let Some(uuid) = self.port_to_uuid.remove(port) {
            self.uuid_to_port.remove(&uuid);
        }
    }

    /// One discovery pass: enumerate candidate ports and establish, verify,
    /// or re-establish sessions.
    pub async fn make_connections(&mut self) -> Result<(), GardenError> {
        let discovered = discover_ports(&self.port_pattern)?;

        let known_ports: Vec<String> = self.port_to_uuid.keys().cloned().collect();
        for port in known_ports {
            if !discovered.contains(&port) {
                self.terminate(&port).await;
            }
        }

        for port in discovered {
            match self.port_to_uuid.get(&port).cloned() {
                None => self.establish(&port).await,
                Some(recorded_id) => {
                    if !self.uuid_to_port.contains_key(&recorded_id) {
                        self.terminate(&port).await;
                        continue;
                    }
                    match self.worker.probe(&port).await {
                        Ok(uuid_str) if uuid_str == recorded_id.as_str() => {}
                        Ok(mismatched) => {
                            let fault = GardenError::BoardIdentityMismatch {
                                port: port.clone(),
                                expected: recorded_id.to_string(),
                                actual: mismatched,
                            };
                            warn!(%fault, "terminating and re-establishing session");
                            self.terminate(&port).await;
                            self.establish(&port).await;
                        }
                        Err(_) => {
                            self.terminate(&port).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn read_sensor(
        &self,
        slave_uuid: &SlaveId,
        pin_type: &str,
        pin: i32,
        driver: &str,
        measurement_type: &str,
    ) -> Option<f64> {
        let port = self.port_for(slave_uuid)?.to_string();
        self.worker
            .read_sensor(&port, pin_type, pin, driver, measurement_type)
            .await
            .ok()
    }

    pub async fn set_relay(&self, slave_uuid: &SlaveId, pin: i32, state: bool) -> Option<bool> {
        let port = self.port_for(slave_uuid)?.to_string();
        self.worker
            .set_relay(&port, pin, if state { 1 } else { 0 })
            .await
            .ok()
    }

    /// Close every open session. Idempotent.
    pub async fn terminate_all(&mut self) {
        let ports: Vec<String> = self.port_to_uuid.keys().cloned().collect();
        for port in ports {
            self.terminate(&port).await;
        }
    }

    /// Stop the dedicated serial worker thread. Call once, after
    /// `terminate_all`, as the last step of process shutdown.
    pub fn shutdown_worker(&self) {
        self.worker.shutdown();
    }
}
