// End-to-end scenarios: exchange, state machines, relay and transfer engines
// wired together over loopback sockets.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

use intercom::call::{Action, CallControl, CallState, UserInput};
use intercom::config::ServerConfig;
use intercom::exchange::Exchange;
use intercom::protocol::{Decoder, Message, TerminateCode};
use intercom::relay::Relay;
use intercom::ring::{Consumer, Producer, RingBuffer};
use intercom::transfer::{SessionDescriptor, TransferEngine};

// Relay port ranges here are disjoint from the ones the unit tests use, so
// concurrently running test binaries never contend.

fn test_exchange(port_min: u16, port_max: u16) -> Exchange {
    Exchange::bind(&ServerConfig {
        server_port: 0,
        audio_port_min: port_min,
        audio_port_max: port_max,
    })
    .unwrap()
}

fn pump(exchange: &mut Exchange) {
    for _ in 0..20 {
        exchange.poll();
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// A client: real TCP stream + decoder + call-control machine.
struct Phone {
    stream: TcpStream,
    decoder: Decoder,
    control: CallControl,
}

impl Phone {
    fn connect(exchange: &Exchange, preferred: u16) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], exchange.local_addr().unwrap().port()));
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        Self {
            stream,
            decoder: Decoder::new(),
            control: CallControl::new(preferred, IpAddr::V4(Ipv4Addr::LOCALHOST)),
        }
    }

    fn register(&mut self, exchange: &mut Exchange) {
        let request = self.control.handshake_request().encode();
        self.stream.write_all(&request).unwrap();
        pump(exchange);
        let response = self.expect_message();
        self.control.on_message(response);
        assert_eq!(self.control.state(), CallState::WaitForCall);
    }

    fn expect_message(&mut self) -> Message {
        if let Some(msg) = self.decoder.next() {
            return msg;
        }
        let mut buf = [0u8; 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => panic!("exchange closed the connection"),
                Ok(n) => {
                    self.decoder.feed(&buf[..n]);
                    if let Some(msg) = self.decoder.next() {
                        return msg;
                    }
                }
                Err(err) => panic!("no message from exchange: {err}"),
            }
        }
    }

    /// Feed a user event into the machine and perform its Send actions.
    fn input(&mut self, input: UserInput) -> Vec<Action> {
        let actions = self.control.on_input(input);
        self.perform(&actions);
        actions
    }

    /// Feed the next wire message into the machine and perform Send actions.
    fn process_next(&mut self) -> Vec<Action> {
        let msg = self.expect_message();
        let actions = self.control.on_message(msg);
        self.perform(&actions);
        actions
    }

    fn perform(&mut self, actions: &[Action]) {
        for action in actions {
            if let Action::Send(msg) = action {
                self.stream.write_all(&msg.encode()).unwrap();
            }
        }
    }
}

fn started_session(actions: &[Action]) -> SessionDescriptor {
    actions
        .iter()
        .find_map(|action| match action {
            Action::StartAudio(session) => Some(*session),
            _ => None,
        })
        .expect("no StartAudio action")
}

// ===== Scenario A/B: handshake =====

#[test]
fn scenario_handshake_accept() {
    let mut exchange = test_exchange(19200, 19209);
    let mut phone = Phone::connect(&exchange, 5);
    phone.register(&mut exchange);
    assert_eq!(phone.control.phone_number(), 5);
    assert_eq!(exchange.client_count(), 1);
}

#[test]
fn scenario_handshake_collision_assigns_next_free() {
    let mut exchange = test_exchange(19210, 19219);
    let mut alice = Phone::connect(&exchange, 5);
    alice.register(&mut exchange);
    let mut bob = Phone::connect(&exchange, 5);
    bob.register(&mut exchange);
    assert_eq!(alice.control.phone_number(), 5);
    assert_eq!(bob.control.phone_number(), 6);
}

// ===== Scenario C: call round trip =====

/// Set up an accepted call between two phones; returns them plus the relay
/// port both were told to use.
fn establish_call(exchange: &mut Exchange) -> (Phone, Phone, u16) {
    let mut alice = Phone::connect(exchange, 5);
    alice.register(exchange);
    let mut bob = Phone::connect(exchange, 6);
    bob.register(exchange);

    alice.input(UserInput::Dial(6));
    assert_eq!(alice.control.state(), CallState::ExternalCall { to: 6 });
    pump(exchange);

    let alice_actions = alice.process_next();
    assert_eq!(alice.control.state(), CallState::InCall { peer: 6 });
    let session = started_session(&alice_actions);

    bob.process_next();
    assert_eq!(
        bob.control.state(),
        CallState::Ring {
            from: 5,
            udp_port: session.udp_port
        }
    );

    let bob_actions = bob.input(UserInput::Accept);
    assert_eq!(bob.control.state(), CallState::InCall { peer: 5 });
    assert_eq!(started_session(&bob_actions).udp_port, session.udp_port);
    pump(exchange);

    (alice, bob, session.udp_port)
}

#[test]
fn scenario_call_round_trip() {
    let mut exchange = test_exchange(19220, 19229);
    let (_alice, _bob, port) = establish_call(&mut exchange);

    assert_eq!(exchange.pending_count(), 0);
    assert_eq!(exchange.ongoing_count(), 1);
    assert!((19220..=19229).contains(&port));

    // The relay child owns the advertised port.
    assert!(UdpSocket::bind(("0.0.0.0", port)).is_err());
}

// ===== Scenario D: bidirectional relay =====

#[test]
fn scenario_bidirectional_relay() {
    let mut exchange = test_exchange(19230, 19239);
    let (_alice, _bob, port) = establish_call(&mut exchange);
    let relay_addr = SocketAddr::from(([127, 0, 0, 1], port));

    let endpoint = || {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        socket.connect(relay_addr).unwrap();
        socket
    };
    let a = endpoint();
    let b = endpoint();

    // Both endpoints announce themselves with a 200-byte datagram.
    a.send(&[0x11u8; 200]).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    b.send(&[0x22u8; 200]).unwrap();

    let mut buf = [0u8; 4096];
    let n = a.recv(&mut buf).expect("b's announce should reach a");
    assert_eq!(&buf[..n], &[0x22u8; 200]);

    // Steady state forwards each direction to the other learnt address.
    a.send(b"pcm from a").unwrap();
    let n = b.recv(&mut buf).expect("a -> b failed");
    assert_eq!(&buf[..n], b"pcm from a");

    b.send(b"pcm from b").unwrap();
    let n = a.recv(&mut buf).expect("b -> a failed");
    assert_eq!(&buf[..n], b"pcm from b");

    // A third party is ignored once both peers are known.
    let mallory = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
    mallory
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    mallory.send_to(b"spoof", relay_addr).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    a.send(b"still flowing").unwrap();
    let n = b.recv(&mut buf).expect("relay stopped forwarding");
    assert_eq!(&buf[..n], b"still flowing");
    assert!(mallory.recv_from(&mut buf).is_err());
}

// ===== Scenario E: hang-up =====

#[test]
fn scenario_hang_up() {
    let mut exchange = test_exchange(19240, 19249);
    let (mut alice, mut bob, port) = establish_call(&mut exchange);

    let actions = alice.input(UserInput::HangUp);
    assert!(actions.contains(&Action::StopAudio));
    assert_eq!(alice.control.state(), CallState::WaitForCall);
    pump(&mut exchange);

    let bob_actions = bob.process_next();
    assert_eq!(bob.control.state(), CallState::WaitForCall);
    assert!(bob_actions.contains(&Action::StopAudio));
    assert_eq!(bob.control.last_terminate(), Some(TerminateCode::CallPutdown));

    assert_eq!(exchange.ongoing_count(), 0);
    assert_eq!(exchange.pending_count(), 0);

    // The relay is gone and its port is free again.
    std::thread::sleep(Duration::from_millis(100));
    assert!(UdpSocket::bind(("0.0.0.0", port)).is_ok());
}

#[test]
fn scenario_reject_before_accept() {
    let mut exchange = test_exchange(19250, 19259);
    let mut alice = Phone::connect(&exchange, 5);
    alice.register(&mut exchange);
    let mut bob = Phone::connect(&exchange, 6);
    bob.register(&mut exchange);

    alice.input(UserInput::Dial(6));
    pump(&mut exchange);
    alice.process_next();
    bob.process_next();

    bob.input(UserInput::Reject);
    assert_eq!(bob.control.state(), CallState::WaitForCall);
    pump(&mut exchange);

    // The caller is told the call is over and returns to idle.
    let actions = alice.process_next();
    assert_eq!(alice.control.state(), CallState::WaitForCall);
    assert!(actions.contains(&Action::StopAudio));
    assert_eq!(exchange.pending_count(), 0);
    assert_eq!(exchange.ongoing_count(), 0);
}

// ===== Scenario F: audio path through transfer engines =====

fn push_bytes(producer: &mut Producer, mut data: &[u8]) {
    while !data.is_empty() {
        let n = {
            let region = producer.acquire_write(data.len());
            assert!(!region.is_empty());
            let n = region.len();
            region.copy_from_slice(&data[..n]);
            n
        };
        producer.commit_write(n);
        data = &data[n..];
    }
}

fn drain_bytes(consumer: &mut Consumer, want: usize, timeout: Duration) -> Vec<u8> {
    let deadline = std::time::Instant::now() + timeout;
    let mut out = Vec::new();
    while out.len() < want && std::time::Instant::now() < deadline {
        let n = {
            let region = consumer.acquire_read(want - out.len());
            out.extend_from_slice(region);
            region.len()
        };
        consumer.commit_read(n);
        if n == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    out
}

#[test]
fn audio_flows_between_two_transfer_engines_via_relay() {
    let relay = Relay::spawn(0).unwrap();
    let session = SessionDescriptor {
        relay_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        udp_port: relay.port(),
    };

    let (mut a_capture, a_capture_cons) = RingBuffer::shared(8192).unwrap();
    let (a_playback_prod, mut a_playback) = RingBuffer::shared(8192).unwrap();
    let (mut b_capture, b_capture_cons) = RingBuffer::shared(8192).unwrap();
    let (b_playback_prod, mut b_playback) = RingBuffer::shared(8192).unwrap();

    let engine_a = TransferEngine::spawn(a_capture_cons, a_playback_prod);
    let engine_b = TransferEngine::spawn(b_capture_cons, b_playback_prod);
    engine_a.start(session);
    engine_b.start(session);

    // First datagrams teach the relay both endpoint addresses.
    push_bytes(&mut a_capture, b"a-probe");
    std::thread::sleep(Duration::from_millis(50));
    push_bytes(&mut b_capture, b"b-probe");
    std::thread::sleep(Duration::from_millis(50));

    // A's probe predates the relay knowing B, so B starts clean from here.
    let a_pcm: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
    push_bytes(&mut a_capture, &a_pcm);
    let heard_by_b = drain_bytes(&mut b_playback, a_pcm.len(), Duration::from_secs(2));
    assert_eq!(heard_by_b, a_pcm);

    // Reverse direction: B's probe already reached A, skip past it.
    let b_probe_echo = drain_bytes(&mut a_playback, 7, Duration::from_secs(2));
    assert_eq!(b_probe_echo, b"b-probe");

    let b_pcm: Vec<u8> = (0..600u32).map(|i| ((i * 7) % 239) as u8).collect();
    push_bytes(&mut b_capture, &b_pcm);
    let heard_by_a = drain_bytes(&mut a_playback, b_pcm.len(), Duration::from_secs(2));
    assert_eq!(heard_by_a, b_pcm);

    engine_a.stop();
    engine_b.stop();
}
