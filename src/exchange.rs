// Exchange Module - Central signalling server: registry, call setup, relays

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::config::ServerConfig;
use crate::protocol::{Decoder, Message, TerminateCode};
use crate::relay::Relay;

/// Pause per idle loop iteration in `run`.
const IDLE_TICK: Duration = Duration::from_millis(5);

struct Connection {
    stream: TcpStream,
    decoder: Decoder,
    peer: SocketAddr,
}

/// One registered phone.
struct ClientEntry {
    number: u16,
    conn: usize,
}

/// One call, pending or ongoing. Owning the relay here ties the relay
/// lifetime to the record: removing the record stops the forwarder.
struct CallRecord {
    created: Instant,
    caller: u16,
    callee: u16,
    port: u16,
    relay: Relay,
}

impl CallRecord {
    fn involves(&self, number: u16) -> bool {
        self.caller == number || self.callee == number
    }
}

/// Allocates relay UDP ports from the configured range and frees them when
/// calls end.
struct PortAllocator {
    min: u16,
    max: u16,
    in_use: Vec<u16>,
}

impl PortAllocator {
    fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            in_use: Vec::new(),
        }
    }

    /// Free ports in the range, lowest first.
    fn candidates(&self) -> Vec<u16> {
        (self.min..=self.max)
            .filter(|port| !self.in_use.contains(port))
            .collect()
    }

    fn claim(&mut self, port: u16) {
        self.in_use.push(port);
    }

    fn release(&mut self, port: u16) {
        self.in_use.retain(|&held| held != port);
    }
}

/// The exchange.
///
/// A single-threaded accept/read loop over non-blocking sockets. Connection
/// handling is stateless beyond the per-connection decode buffer: message ids
/// identify intent, phone numbers identify clients, and call state lives in
/// the pending/ongoing sets. Messages from one connection are processed in
/// wire order; ordering across connections is not defined.
pub struct Exchange {
    listener: TcpListener,
    connections: Vec<Option<Connection>>,
    clients: Vec<ClientEntry>,
    pending: Vec<CallRecord>,
    ongoing: Vec<CallRecord>,
    ports: PortAllocator,
}

impl Exchange {
    pub fn bind(config: &ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.server_port))
            .with_context(|| format!("failed to bind signalling port {}", config.server_port))?;
        listener
            .set_nonblocking(true)
            .context("failed to make signalling socket non-blocking")?;
        info!(
            "exchange listening on tcp port {}, relay ports {}-{}",
            listener.local_addr().map(|a| a.port()).unwrap_or(0),
            config.audio_port_min,
            config.audio_port_max
        );
        Ok(Self {
            listener,
            connections: Vec::new(),
            clients: Vec::new(),
            pending: Vec::new(),
            ongoing: Vec::new(),
            ports: PortAllocator::new(config.audio_port_min, config.audio_port_max),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("signalling socket has no local address")
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn ongoing_count(&self) -> usize {
        self.ongoing.len()
    }

    /// Serve forever.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.poll();
            std::thread::sleep(IDLE_TICK);
        }
    }

    /// One service tick: accept new connections, read every live connection,
    /// dispatch the decoded messages.
    pub fn poll(&mut self) {
        self.accept_new();

        for index in 0..self.connections.len() {
            let mut messages = Vec::new();
            let mut closed = false;

            if let Some(conn) = self.connections[index].as_mut() {
                let mut buf = [0u8; 1024];
                match conn.stream.read(&mut buf) {
                    Ok(0) => closed = true,
                    Ok(n) => {
                        conn.decoder.feed(&buf[..n]);
                        while let Some(msg) = conn.decoder.next() {
                            messages.push(msg);
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        warn!("connection {} read failed: {err}", index);
                        closed = true;
                    }
                }
            }

            if closed {
                self.disconnect(index);
                continue;
            }
            for msg in messages {
                self.handle(index, msg);
            }
        }
    }

    fn accept_new(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        warn!("dropping connection from {peer}: {err}");
                        continue;
                    }
                    info!("accepted a connection from {peer}");
                    let conn = Connection {
                        stream,
                        decoder: Decoder::new(),
                        peer,
                    };
                    match self.connections.iter_mut().position(|slot| slot.is_none()) {
                        Some(free) => self.connections[free] = Some(conn),
                        None => self.connections.push(Some(conn)),
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("failed to accept connection: {err}");
                    break;
                }
            }
        }
    }

    fn handle(&mut self, conn: usize, msg: Message) {
        match msg {
            Message::HandshakeRequest { phone_number } => self.handle_handshake(conn, phone_number),
            Message::CallRequest { from, to } => self.handle_call_request(conn, from, to),
            Message::IncomingResponse { from } => self.handle_incoming_response(from),
            Message::ClientTerminateCall { code, phone_number } => {
                info!("client {phone_number} terminated its call: {code:?}");
                if !self.terminate_call(phone_number, true) {
                    warn!("terminate from {phone_number} matched no call");
                }
            }
            other => warn!("unexpected message on connection {conn}: {other:?}"),
        }
    }

    fn handle_handshake(&mut self, conn: usize, requested: u16) {
        let allocated = self.allocate_phone_number(requested);
        match self.clients.iter_mut().find(|entry| entry.conn == conn) {
            Some(entry) => entry.number = allocated,
            None => self.clients.push(ClientEntry {
                number: allocated,
                conn,
            }),
        }
        info!("handshake successful with number {allocated}");
        self.send(conn, &Message::HandshakeResponse {
            phone_number: allocated,
        });
    }

    fn handle_call_request(&mut self, conn: usize, from: u16, to: u16) {
        let Some(caller_conn) = self.client_conn(from) else {
            debug!("call request from unregistered number {from}");
            return;
        };
        let Some(callee_conn) = self.client_conn(to) else {
            debug!("call request to unregistered number {to}");
            return;
        };

        // A number may appear in at most one call.
        let busy = [from, to].iter().any(|&n| {
            self.pending.iter().any(|c| c.involves(n))
                || self.ongoing.iter().any(|c| c.involves(n))
        });
        if busy {
            warn!("call request {from} -> {to} while a party is already in a call");
            self.send(conn, &Message::TerminateCall {
                code: TerminateCode::ServerError,
            });
            return;
        }

        let Some((port, relay)) = self.spawn_relay() else {
            warn!("no relay port available for call {from} -> {to}");
            self.send(conn, &Message::TerminateCall {
                code: TerminateCode::ServerError,
            });
            return;
        };

        info!("call {from} -> {to} pending on relay port {port}");
        self.pending.push(CallRecord {
            created: Instant::now(),
            caller: from,
            callee: to,
            port,
            relay,
        });

        self.send(caller_conn, &Message::CallResponse { udp_port: port });
        self.send(callee_conn, &Message::IncomingCall {
            from,
            udp_port: port,
        });
    }

    fn handle_incoming_response(&mut self, from: u16) {
        match self.pending.iter().position(|call| call.caller == from) {
            Some(index) => {
                let record = self.pending.swap_remove(index);
                info!(
                    "call {} -> {} accepted, audio on relay port {}",
                    record.caller, record.callee, record.port
                );
                self.ongoing.push(record);
            }
            None => warn!("incoming response for unknown caller {from}"),
        }
    }

    /// Tear down the call `number` participates in: notify the other party,
    /// stop the relay, release its port, drop the record.
    fn terminate_call(&mut self, number: u16, notify_peer: bool) -> bool {
        let record = match self
            .ongoing
            .iter()
            .position(|call| call.involves(number))
        {
            Some(index) => self.ongoing.swap_remove(index),
            None => match self.pending.iter().position(|call| call.involves(number)) {
                Some(index) => self.pending.swap_remove(index),
                None => return false,
            },
        };

        let other = if record.caller == number {
            record.callee
        } else {
            record.caller
        };
        info!(
            "terminating call {} -> {} after {:?}",
            record.caller,
            record.callee,
            record.created.elapsed()
        );

        if notify_peer {
            match self.client_conn(other) {
                Some(conn) => self.send(conn, &Message::TerminateCall {
                    code: TerminateCode::CallPutdown,
                }),
                None => warn!("peer {other} is no longer connected"),
            }
        }

        let mut record = record;
        record.relay.shutdown();
        self.ports.release(record.port);
        true
    }

    fn disconnect(&mut self, conn: usize) {
        if let Some(connection) = self.connections[conn].take() {
            info!("connection from {} closed", connection.peer);
        }
        if let Some(pos) = self.clients.iter().position(|entry| entry.conn == conn) {
            let number = self.clients.swap_remove(pos).number;
            info!("client {number} deregistered");
            if self.terminate_call(number, true) {
                info!("client {number} disconnected mid-call");
            }
        }
    }

    /// Grant the requested number when free, otherwise one past the highest
    /// currently held.
    fn allocate_phone_number(&self, requested: u16) -> u16 {
        let taken = self.clients.iter().any(|entry| entry.number == requested);
        if !taken {
            return requested;
        }
        let largest = self
            .clients
            .iter()
            .map(|entry| entry.number)
            .max()
            .unwrap_or(0);
        largest + 1
    }

    /// Bind a relay on the first free port in the range that accepts it.
    fn spawn_relay(&mut self) -> Option<(u16, Relay)> {
        for port in self.ports.candidates() {
            match Relay::spawn(port) {
                Ok(relay) => {
                    self.ports.claim(port);
                    return Some((port, relay));
                }
                Err(err) => warn!("relay port {port} unavailable: {err:#}"),
            }
        }
        None
    }

    fn client_conn(&self, number: u16) -> Option<usize> {
        self.clients
            .iter()
            .find(|entry| entry.number == number)
            .map(|entry| entry.conn)
    }

    fn send(&mut self, conn: usize, msg: &Message) {
        let Some(Some(connection)) = self.connections.get_mut(conn) else {
            warn!("cannot send {msg:?}: connection {conn} is gone");
            return;
        };
        if let Err(err) = connection.stream.write_all(&msg.encode()) {
            warn!("send to {} failed: {err}", connection.peer);
        }
    }
}
