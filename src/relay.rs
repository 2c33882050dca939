// Relay Module - Per-call UDP forwarder between two audio endpoints

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};

/// Audio datagrams never exceed this size.
pub const MAX_DATAGRAM: usize = 4_096;

/// Poll cadence for the shutdown flag while blocked in recv.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// One running relay worker.
///
/// Owns a UDP socket bound to the call's allocated port and a thread that
/// forwards datagrams between the two endpoints that attach to it. The relay
/// never inspects payloads. Shutdown is cooperative: the exchange sets the
/// flag and joins the thread.
pub struct Relay {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Relay {
    /// Bind the relay port (0 picks an ephemeral port) and start forwarding.
    pub fn spawn(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .with_context(|| format!("failed to bind relay port {port}"))?;
        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .context("failed to set relay read timeout")?;
        let local_addr = socket.local_addr().context("relay has no local address")?;

        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(format!("relay-{}", local_addr.port()))
            .spawn(move || relay_main(socket, worker_stop))
            .context("failed to spawn relay thread")?;

        info!("relay listening on udp port {}", local_addr.port());
        Ok(Self {
            local_addr,
            stop,
            handle: Some(handle),
        })
    }

    /// The port actually bound (meaningful when spawned with port 0).
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Tell the worker to exit and wait for it.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        info!("relay on udp port {} stopped", self.local_addr.port());
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn relay_main(socket: UdpSocket, stop: Arc<AtomicBool>) {
    let mut buf = [0u8; MAX_DATAGRAM];
    let mut peers: [Option<SocketAddr>; 2] = [None, None];

    while !stop.load(Ordering::Relaxed) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => {
                warn!("relay socket failed: {err}");
                break;
            }
        };

        if !peers.contains(&Some(src)) {
            match peers.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => *slot = Some(src),
                // Both endpoints known; anyone else is dropped.
                None => continue,
            }
        }

        let other = peers
            .iter()
            .flatten()
            .find(|peer| **peer != src)
            .copied();
        if let Some(peer) = other {
            if let Err(err) = socket.send_to(&buf[..len], peer) {
                warn!("relay forward to {peer} failed: {err}");
            }
        }
    }
}
