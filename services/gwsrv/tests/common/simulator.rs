//! In-process Modbus TCP gateway simulator
//!
//! Answers FC01-06/15/16 for any unit id over real loopback sockets. Each
//! request is handled in its own task, so slow units do not block others and
//! overlapping requests for one unit can be observed.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use ems_modbus::{exception_pdu, Adu, ExceptionCode, MbapFramer, Request, Response};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::FramedRead;
use tracing::debug;

/// Input register value served for `unit` at `address`
///
/// Wraps for high unit ids so every unit in 1..=247 can be served.
pub fn input_value(unit: u8, address: u16) -> u16 {
    u16::from(unit).wrapping_mul(1000).wrapping_add(address)
}

/// Holding register value served until something is written
pub fn holding_default(unit: u8, address: u16) -> u16 {
    u16::from(unit).wrapping_mul(100).wrapping_add(address)
}

/// Simulator state and fault switches
#[derive(Default)]
pub struct SimState {
    pub holding: HashMap<(u8, u16), u16>,
    pub coils: HashMap<(u8, u16), bool>,
    /// Units that never answer
    pub silent_units: HashSet<u8>,
    /// Units that answer every request with this exception
    pub exceptions: HashMap<u8, ExceptionCode>,
    /// Delay before each reply
    pub delay: Duration,
    /// Send a frame with this transaction id before every reply
    pub unsolicited_tid: Option<u16>,
    /// Send a copy of the reply from the wrong unit id before the real one
    pub wrong_unit_first: bool,
    /// Send a frame with an impossible length field instead of the next reply
    pub corrupt_next: bool,
    /// Requests received per unit
    pub received: HashMap<u8, usize>,
    in_progress: HashMap<u8, usize>,
    /// Highest number of simultaneous requests seen per unit
    pub max_in_progress: HashMap<u8, usize>,
}

impl SimState {
    fn answer(&mut self, unit: u8, request: &Request) -> Result<Response, ExceptionCode> {
        if let Some(&exception) = self.exceptions.get(&unit) {
            return Err(exception);
        }

        let span = |address: u16, quantity: u16| {
            (0..quantity).map(move |i| address.wrapping_add(i))
        };
        let response = match request {
            Request::ReadHoldingRegisters { address, quantity } => Response::HoldingRegisters(
                span(*address, *quantity)
                    .map(|a| {
                        self.holding
                            .get(&(unit, a))
                            .copied()
                            .unwrap_or_else(|| holding_default(unit, a))
                    })
                    .collect(),
            ),
            Request::ReadInputRegisters { address, quantity } => Response::InputRegisters(
                span(*address, *quantity)
                    .map(|a| input_value(unit, a))
                    .collect(),
            ),
            Request::ReadCoils { address, quantity } => Response::Coils(
                span(*address, *quantity)
                    .map(|a| self.coils.get(&(unit, a)).copied().unwrap_or(a % 2 == 0))
                    .collect(),
            ),
            Request::ReadDiscreteInputs { address, quantity } => Response::DiscreteInputs(
                span(*address, *quantity).map(|a| a % 3 == 0).collect(),
            ),
            Request::WriteSingleCoil { address, value } => {
                self.coils.insert((unit, *address), *value);
                Response::WriteSingleCoil {
                    address: *address,
                    value: *value,
                }
            },
            Request::WriteSingleRegister { address, value } => {
                self.holding.insert((unit, *address), *value);
                Response::WriteSingleRegister {
                    address: *address,
                    value: *value,
                }
            },
            Request::WriteMultipleCoils { address, values } => {
                for (a, v) in span(*address, values.len() as u16).zip(values) {
                    self.coils.insert((unit, a), *v);
                }
                Response::WriteMultipleCoils {
                    address: *address,
                    quantity: values.len() as u16,
                }
            },
            Request::WriteMultipleRegisters { address, values } => {
                for (a, v) in span(*address, values.len() as u16).zip(values) {
                    self.holding.insert((unit, a), *v);
                }
                Response::WriteMultipleRegisters {
                    address: *address,
                    quantity: values.len() as u16,
                }
            },
        };
        Ok(response)
    }

    /// Frames to send back for one request frame
    fn respond(&mut self, frame: &[u8]) -> Vec<Bytes> {
        let Ok(adu) = Adu::decode(frame) else {
            return Vec::new();
        };
        let unit = adu.unit_id;
        *self.received.entry(unit).or_default() += 1;

        if self.silent_units.contains(&unit) {
            return Vec::new();
        }
        if std::mem::take(&mut self.corrupt_next) {
            // Length 0 can never be valid
            return vec![Bytes::from_static(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01])];
        }

        let fc = adu.pdu.function_code().unwrap_or(0);
        let pdu = match Request::from_pdu(&adu.pdu) {
            Ok(request) => match self.answer(unit, &request) {
                Ok(response) => response.to_pdu(),
                Err(exception) => exception_pdu(fc, exception),
            },
            Err(_) => exception_pdu(fc, ExceptionCode::IllegalFunction),
        };
        let Ok(pdu) = pdu else {
            return Vec::new();
        };

        let mut frames = Vec::new();
        if let Some(tid) = self.unsolicited_tid {
            frames.push(Adu::new(tid, unit, pdu.clone()).to_bytes());
        }
        if self.wrong_unit_first {
            frames.push(Adu::new(adu.transaction_id, unit.wrapping_add(1), pdu.clone()).to_bytes());
        }
        frames.push(Adu::new(adu.transaction_id, unit, pdu).to_bytes());
        frames
    }
}

struct Shared {
    state: Mutex<SimState>,
    kill: watch::Sender<u64>,
}

/// Handle to a running simulator
#[derive(Clone)]
pub struct ModbusSimulator {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl ModbusSimulator {
    /// Listen on an ephemeral loopback port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (kill, _) = watch::channel(0u64);
        let shared = Arc::new(Shared {
            state: Mutex::new(SimState::default()),
            kill,
        });

        let accept_shared = shared.clone();
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                debug!("Simulator: connection from {}", peer);
                tokio::spawn(serve(stream, accept_shared.clone()));
            }
        });

        Self { addr, shared }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Mutate the simulator state
    pub fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let mut state = self.shared.state.lock().unwrap();
        f(&mut state)
    }

    /// Close every open connection; new connections are still accepted
    pub fn drop_connections(&self) {
        self.shared.kill.send_modify(|generation| *generation += 1);
    }

    pub fn received(&self, unit: u8) -> usize {
        self.with_state(|s| s.received.get(&unit).copied().unwrap_or(0))
    }

    /// Requests for `unit` received but not yet answered
    pub fn in_progress(&self, unit: u8) -> usize {
        self.with_state(|s| s.in_progress.get(&unit).copied().unwrap_or(0))
    }

    pub fn max_in_progress(&self, unit: u8) -> usize {
        self.with_state(|s| s.max_in_progress.get(&unit).copied().unwrap_or(0))
    }
}

async fn serve(stream: TcpStream, shared: Arc<Shared>) {
    let (read, write) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(write));
    let mut frames = FramedRead::new(read, MbapFramer);
    let mut kill = shared.kill.subscribe();

    loop {
        tokio::select! {
            _ = kill.changed() => break,
            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    tokio::spawn(handle_request(frame, writer.clone(), shared.clone()));
                },
                _ => break,
            },
        }
    }

    let _ = writer.lock().await.shutdown().await;
}

async fn handle_request(frame: Bytes, writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>, shared: Arc<Shared>) {
    let unit = frame.get(6).copied().unwrap_or(0);
    let delay = {
        let mut state = shared.state.lock().unwrap();
        let busy = state.in_progress.entry(unit).or_default();
        *busy += 1;
        let busy = *busy;
        let max = state.max_in_progress.entry(unit).or_default();
        *max = (*max).max(busy);
        state.delay
    };

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let replies = {
        let mut state = shared.state.lock().unwrap();
        if let Some(busy) = state.in_progress.get_mut(&unit) {
            *busy = busy.saturating_sub(1);
        }
        state.respond(&frame)
    };

    let mut writer = writer.lock().await;
    for reply in replies {
        if writer.write_all(&reply).await.is_err() {
            return;
        }
    }
}
