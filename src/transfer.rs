// Transfer Module - Moves audio bytes between the ring buffers and the relay socket

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::ring::{Consumer, Producer};

/// Upper bound on bytes moved per direction per loop iteration.
const TRANSFER_CHUNK: usize = 10_000;

/// Pause between iterations that moved no data, to bound the spin.
const IDLE_BACKOFF: Duration = Duration::from_micros(500);

/// Where a call's audio goes: the relay endpoint the exchange allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub relay_addr: IpAddr,
    pub udp_port: u16,
}

impl SessionDescriptor {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.relay_addr, self.udp_port)
    }
}

/// Start gate shared between the control side and the transfer thread.
///
/// The session descriptor is published under the same mutex as the `started`
/// flag, so the transfer thread observing `started` also observes a valid
/// descriptor.
struct Gate {
    started: bool,
    shutdown: bool,
    session: Option<SessionDescriptor>,
}

/// The data-plane worker.
///
/// A dedicated thread drains the capture buffer to the relay and fills the
/// playback buffer from it for the duration of a session, and parks on the
/// start gate between sessions. It touches no signalling state; start, stop
/// and teardown all arrive through the gate.
pub struct TransferEngine {
    gate: Arc<(Mutex<Gate>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl TransferEngine {
    /// Spawn the transfer thread. It owns the network-facing halves of both
    /// ring buffers and waits for `start`.
    pub fn spawn(capture: Consumer, playback: Producer) -> Self {
        let gate = Arc::new((
            Mutex::new(Gate {
                started: false,
                shutdown: false,
                session: None,
            }),
            Condvar::new(),
        ));
        let thread_gate = Arc::clone(&gate);
        let handle = std::thread::Builder::new()
            .name("transfer".into())
            .spawn(move || transfer_main(thread_gate, capture, playback))
            .expect("failed to spawn transfer thread");
        Self {
            gate,
            handle: Some(handle),
        }
    }

    /// Publish the session descriptor and release the transfer thread.
    pub fn start(&self, session: SessionDescriptor) {
        let (lock, cvar) = &*self.gate;
        if let Ok(mut gate) = lock.lock() {
            gate.session = Some(session);
            gate.started = true;
            cvar.notify_all();
        }
    }

    /// Drop the transfer thread out of its relay loop at the next iteration
    /// boundary and back onto the gate.
    pub fn stop(&self) {
        let (lock, cvar) = &*self.gate;
        if let Ok(mut gate) = lock.lock() {
            gate.started = false;
            gate.session = None;
            cvar.notify_all();
        }
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.gate;
        if let Ok(mut gate) = lock.lock() {
            gate.started = false;
            gate.shutdown = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn transfer_main(
    gate: Arc<(Mutex<Gate>, Condvar)>,
    mut capture: Consumer,
    mut playback: Producer,
) {
    loop {
        let Some(session) = wait_for_start(&gate) else {
            return;
        };

        let socket = match open_session_socket(&session) {
            Ok(socket) => socket,
            Err(err) => {
                warn!("transfer engine could not open session socket: {err:#}");
                abort_session(&gate);
                continue;
            }
        };

        info!("transfer session started with relay {}", session.socket_addr());
        if let Err(err) = relay_loop(&gate, &socket, &mut capture, &mut playback) {
            warn!("transfer session aborted: {err:#}");
            abort_session(&gate);
        }
        info!("transfer session ended");
        // Socket drops here; the thread returns to the gate.
    }
}

/// Block until `started` or `shutdown`. Returns the published session, or
/// None on shutdown.
fn wait_for_start(gate: &(Mutex<Gate>, Condvar)) -> Option<SessionDescriptor> {
    let (lock, cvar) = gate;
    let mut state = lock.lock().ok()?;
    loop {
        if state.shutdown {
            return None;
        }
        if state.started {
            if let Some(session) = state.session {
                return Some(session);
            }
        }
        state = cvar.wait(state).ok()?;
    }
}

fn is_started(gate: &(Mutex<Gate>, Condvar)) -> bool {
    gate.0.lock().map(|state| state.started).unwrap_or(false)
}

/// Clear `started` after a socket failure so the thread does not immediately
/// re-enter the broken session.
fn abort_session(gate: &(Mutex<Gate>, Condvar)) {
    if let Ok(mut state) = gate.0.lock() {
        state.started = false;
        state.session = None;
    }
}

fn open_session_socket(session: &SessionDescriptor) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).context("failed to bind audio socket")?;
    socket
        .set_nonblocking(true)
        .context("failed to make audio socket non-blocking")?;
    socket
        .connect(session.socket_addr())
        .with_context(|| format!("failed to connect audio socket to {}", session.socket_addr()))?;
    Ok(socket)
}

/// One session: shuttle bytes until `started` is cleared.
///
/// Both directions are non-blocking and loss-tolerant: a full playback buffer
/// leaves datagrams in the kernel queue, an empty capture buffer sends
/// nothing, and `WouldBlock` simply means this tick moved no data.
fn relay_loop(
    gate: &(Mutex<Gate>, Condvar),
    socket: &UdpSocket,
    capture: &mut Consumer,
    playback: &mut Producer,
) -> Result<()> {
    while is_started(gate) {
        let mut moved = false;

        // Network -> playback buffer.
        let received = {
            let region = playback.acquire_write(TRANSFER_CHUNK);
            if region.is_empty() {
                None
            } else {
                Some(socket.recv(region))
            }
        };
        match received {
            Some(Ok(n)) => {
                playback.commit_write(n);
                moved = n > 0;
            }
            // ConnectionRefused surfaces a prior send to a not-yet-open
            // relay port; both are retried next tick.
            Some(Err(err)) if transient(&err) => {
                playback.commit_write(0);
            }
            Some(Err(err)) => {
                playback.commit_write(0);
                return Err(err).context("audio socket receive failed");
            }
            None => {}
        }

        // Capture buffer -> network.
        let sent = {
            let region = capture.acquire_read(TRANSFER_CHUNK);
            if region.is_empty() {
                None
            } else {
                Some(socket.send(region))
            }
        };
        match sent {
            Some(Ok(n)) => {
                capture.commit_read(n);
                moved = moved || n > 0;
            }
            Some(Err(err)) if transient(&err) => {
                capture.commit_read(0);
            }
            Some(Err(err)) => {
                capture.commit_read(0);
                return Err(err).context("audio socket send failed");
            }
            None => {}
        }

        if !moved {
            std::thread::sleep(IDLE_BACKOFF);
        }
    }
    Ok(())
}

fn transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::ConnectionRefused
    )
}
