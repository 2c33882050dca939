// Call Module - Client call-control state machine

use std::net::IpAddr;

use log::{info, warn};

use crate::protocol::{Message, TerminateCode};
use crate::transfer::SessionDescriptor;

/// The client's call-control states.
///
/// `Handshake` is the initial state; there is no terminal state, the machine
/// runs until the process is torn down externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Registering with the exchange.
    Handshake,
    /// Registered, idle, listening for a dial or an incoming call.
    WaitForCall,
    /// Dialled out, waiting for the exchange to answer.
    ExternalCall { to: u16 },
    /// Ringing on an incoming call.
    Ring { from: u16, udp_port: u16 },
    /// In an active call with audio flowing.
    InCall { peer: u16 },
}

/// Local user events fed into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserInput {
    Dial(u16),
    Accept,
    Reject,
    HangUp,
}

/// Side effects the control loop must carry out after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(Message),
    StartAudio(SessionDescriptor),
    StopAudio,
}

/// The call-control state machine.
///
/// Pure with respect to I/O: wire messages and user input go in, actions come
/// out, and the control loop owns the sockets and the audio backend. Messages
/// that make no sense in the current state are logged and ignored, leaving
/// the state unchanged.
pub struct CallControl {
    state: CallState,
    phone_number: u16,
    relay_addr: IpAddr,
    last_terminate: Option<TerminateCode>,
}

impl CallControl {
    /// `relay_addr` is the exchange host; relay ports announced over the wire
    /// are combined with it to form session descriptors.
    pub fn new(preferred_number: u16, relay_addr: IpAddr) -> Self {
        Self {
            state: CallState::Handshake,
            phone_number: preferred_number,
            relay_addr,
            last_terminate: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// The number this client is registered under (the preferred number until
    /// the exchange confirms or overrides it).
    pub fn phone_number(&self) -> u16 {
        self.phone_number
    }

    /// Code carried by the most recent terminate affecting this client.
    pub fn last_terminate(&self) -> Option<TerminateCode> {
        self.last_terminate
    }

    /// The registration message for the handshake.
    pub fn handshake_request(&self) -> Message {
        Message::HandshakeRequest {
            phone_number: self.phone_number,
        }
    }

    fn session(&self, udp_port: u16) -> SessionDescriptor {
        SessionDescriptor {
            relay_addr: self.relay_addr,
            udp_port,
        }
    }

    /// Feed a decoded message from the signalling socket.
    pub fn on_message(&mut self, msg: Message) -> Vec<Action> {
        match (self.state, msg) {
            (CallState::Handshake, Message::HandshakeResponse { phone_number }) => {
                // The exchange may assign a different number than requested.
                if phone_number != self.phone_number {
                    info!(
                        "requested number {} was taken, assigned {}",
                        self.phone_number, phone_number
                    );
                }
                self.phone_number = phone_number;
                self.state = CallState::WaitForCall;
                vec![]
            }
            (CallState::WaitForCall, Message::IncomingCall { from, udp_port }) => {
                info!("incoming call from {from}");
                self.state = CallState::Ring { from, udp_port };
                vec![]
            }
            (CallState::ExternalCall { to }, Message::CallResponse { udp_port }) => {
                info!("call to {to} answered, audio on relay port {udp_port}");
                self.state = CallState::InCall { peer: to };
                vec![Action::StartAudio(self.session(udp_port))]
            }
            (CallState::ExternalCall { to }, Message::TerminateCall { code }) => {
                info!("call to {to} refused: {code:?}");
                self.last_terminate = Some(code);
                self.state = CallState::WaitForCall;
                vec![]
            }
            (CallState::InCall { peer }, Message::TerminateCall { code }) => {
                info!("call with {peer} ended by peer: {code:?}");
                self.last_terminate = Some(code);
                self.state = CallState::WaitForCall;
                vec![Action::StopAudio]
            }
            (state, msg) => {
                warn!("ignoring unexpected message {msg:?} in state {state:?}");
                vec![]
            }
        }
    }

    /// Feed a local user event.
    pub fn on_input(&mut self, input: UserInput) -> Vec<Action> {
        match (self.state, input) {
            (CallState::WaitForCall, UserInput::Dial(number)) => {
                info!("dialling {number}");
                self.state = CallState::ExternalCall { to: number };
                vec![Action::Send(Message::CallRequest {
                    from: self.phone_number,
                    to: number,
                })]
            }
            (CallState::Ring { from, udp_port }, UserInput::Accept) => {
                info!("accepting call from {from}");
                self.state = CallState::InCall { peer: from };
                vec![
                    Action::Send(Message::IncomingResponse { from }),
                    Action::StartAudio(self.session(udp_port)),
                ]
            }
            (CallState::Ring { from, .. }, UserInput::Reject) => {
                info!("rejecting call from {from}");
                self.state = CallState::WaitForCall;
                vec![Action::Send(Message::ClientTerminateCall {
                    code: TerminateCode::CallPutdown,
                    phone_number: self.phone_number,
                })]
            }
            (CallState::InCall { peer }, UserInput::HangUp) => {
                info!("hanging up call with {peer}");
                self.state = CallState::WaitForCall;
                vec![
                    Action::StopAudio,
                    Action::Send(Message::ClientTerminateCall {
                        code: TerminateCode::CallPutdown,
                        phone_number: self.phone_number,
                    }),
                ]
            }
            (state, input) => {
                warn!("ignoring input {input:?} in state {state:?}");
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn machine() -> CallControl {
        CallControl::new(5, IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    fn registered() -> CallControl {
        let mut control = machine();
        control.on_message(Message::HandshakeResponse { phone_number: 5 });
        control
    }

    // ===== Handshake Tests =====

    #[test]
    fn test_handshake_request_carries_preferred_number() {
        let control = machine();
        assert_eq!(control.state(), CallState::Handshake);
        assert_eq!(
            control.handshake_request(),
            Message::HandshakeRequest { phone_number: 5 }
        );
    }

    #[test]
    fn test_handshake_accept_keeps_number() {
        let mut control = machine();
        let actions = control.on_message(Message::HandshakeResponse { phone_number: 5 });
        assert!(actions.is_empty());
        assert_eq!(control.state(), CallState::WaitForCall);
        assert_eq!(control.phone_number(), 5);
    }

    #[test]
    fn test_handshake_collision_adopts_assigned_number() {
        let mut control = machine();
        control.on_message(Message::HandshakeResponse { phone_number: 6 });
        assert_eq!(control.state(), CallState::WaitForCall);
        assert_eq!(control.phone_number(), 6);
    }

    // ===== Outgoing Call Tests =====

    #[test]
    fn test_dial_sends_call_request() {
        let mut control = registered();
        let actions = control.on_input(UserInput::Dial(6));
        assert_eq!(control.state(), CallState::ExternalCall { to: 6 });
        assert_eq!(
            actions,
            vec![Action::Send(Message::CallRequest { from: 5, to: 6 })]
        );
    }

    #[test]
    fn test_call_response_starts_audio_towards_relay() {
        let mut control = registered();
        control.on_input(UserInput::Dial(6));
        let actions = control.on_message(Message::CallResponse { udp_port: 9090 });
        assert_eq!(control.state(), CallState::InCall { peer: 6 });
        assert_eq!(
            actions,
            vec![Action::StartAudio(SessionDescriptor {
                relay_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                udp_port: 9090,
            })]
        );
    }

    #[test]
    fn test_refused_call_returns_to_idle_with_code() {
        let mut control = registered();
        control.on_input(UserInput::Dial(6));
        let actions = control.on_message(Message::TerminateCall {
            code: TerminateCode::ServerError,
        });
        assert!(actions.is_empty());
        assert_eq!(control.state(), CallState::WaitForCall);
        assert_eq!(control.last_terminate(), Some(TerminateCode::ServerError));
    }

    // ===== Incoming Call Tests =====

    #[test]
    fn test_incoming_call_rings_and_records_fields() {
        let mut control = registered();
        let actions = control.on_message(Message::IncomingCall {
            from: 7,
            udp_port: 9191,
        });
        assert!(actions.is_empty());
        assert_eq!(
            control.state(),
            CallState::Ring {
                from: 7,
                udp_port: 9191
            }
        );
    }

    #[test]
    fn test_accept_answers_and_starts_audio() {
        let mut control = registered();
        control.on_message(Message::IncomingCall {
            from: 7,
            udp_port: 9191,
        });
        let actions = control.on_input(UserInput::Accept);
        assert_eq!(control.state(), CallState::InCall { peer: 7 });
        assert_eq!(
            actions,
            vec![
                Action::Send(Message::IncomingResponse { from: 7 }),
                Action::StartAudio(SessionDescriptor {
                    relay_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    udp_port: 9191,
                }),
            ]
        );
    }

    #[test]
    fn test_reject_sends_putdown() {
        let mut control = registered();
        control.on_message(Message::IncomingCall {
            from: 7,
            udp_port: 9191,
        });
        let actions = control.on_input(UserInput::Reject);
        assert_eq!(control.state(), CallState::WaitForCall);
        assert_eq!(
            actions,
            vec![Action::Send(Message::ClientTerminateCall {
                code: TerminateCode::CallPutdown,
                phone_number: 5,
            })]
        );
    }

    // ===== Active Call Tests =====

    fn in_call() -> CallControl {
        let mut control = registered();
        control.on_input(UserInput::Dial(6));
        control.on_message(Message::CallResponse { udp_port: 9090 });
        control
    }

    #[test]
    fn test_hang_up_stops_audio_once_then_notifies() {
        let mut control = in_call();
        let actions = control.on_input(UserInput::HangUp);
        assert_eq!(control.state(), CallState::WaitForCall);
        let stops = actions
            .iter()
            .filter(|action| **action == Action::StopAudio)
            .count();
        assert_eq!(stops, 1, "audio must stop exactly once");
        assert_eq!(
            actions,
            vec![
                Action::StopAudio,
                Action::Send(Message::ClientTerminateCall {
                    code: TerminateCode::CallPutdown,
                    phone_number: 5,
                }),
            ]
        );

        // A duplicate hang-up is ignored and stops nothing further.
        assert!(control.on_input(UserInput::HangUp).is_empty());
    }

    #[test]
    fn test_peer_termination_stops_audio() {
        let mut control = in_call();
        let actions = control.on_message(Message::TerminateCall {
            code: TerminateCode::CallPutdown,
        });
        assert_eq!(control.state(), CallState::WaitForCall);
        assert_eq!(actions, vec![Action::StopAudio]);
        assert_eq!(control.last_terminate(), Some(TerminateCode::CallPutdown));
    }

    // ===== Robustness Tests =====

    #[test]
    fn test_unexpected_messages_leave_state_unchanged() {
        let mut control = registered();
        assert!(
            control
                .on_message(Message::CallResponse { udp_port: 9090 })
                .is_empty()
        );
        assert!(
            control
                .on_message(Message::HandshakeResponse { phone_number: 9 })
                .is_empty()
        );
        assert_eq!(control.state(), CallState::WaitForCall);
        assert_eq!(control.phone_number(), 5);
    }

    #[test]
    fn test_dial_while_ringing_is_ignored() {
        let mut control = registered();
        control.on_message(Message::IncomingCall {
            from: 7,
            udp_port: 9191,
        });
        assert!(control.on_input(UserInput::Dial(8)).is_empty());
        assert_eq!(
            control.state(),
            CallState::Ring {
                from: 7,
                udp_port: 9191
            }
        );
    }

    #[test]
    fn test_full_call_cycle_returns_to_idle() {
        let mut control = registered();
        for _ in 0..3 {
            control.on_input(UserInput::Dial(6));
            control.on_message(Message::CallResponse { udp_port: 9090 });
            control.on_input(UserInput::HangUp);
            assert_eq!(control.state(), CallState::WaitForCall);
        }
    }
}
