// Protocol Module - Framed signalling messages between clients and the exchange

use byteorder::{BigEndian, ByteOrder};

/// Start byte of every framed message.
pub const FRAME_START: u8 = 0xAA;
/// Magic carried by both handshake messages.
pub const HANDSHAKE_MAGIC: [u8; 4] = *b"bro\0";

/// Wrapper header: start byte, payload length, message id.
const HEADER_LEN: usize = 3;

const MSG_HANDSHAKE_REQUEST: u8 = 1;
const MSG_HANDSHAKE_RESPONSE: u8 = 2;
const MSG_CALL_REQUEST: u8 = 10;
const MSG_CALL_RESPONSE: u8 = 11;
const MSG_INCOMING_CALL: u8 = 12;
const MSG_INCOMING_RESPONSE: u8 = 13;
const MSG_TERMINATE_CALL: u8 = 20;
const MSG_CLIENT_TERMINATE_CALL: u8 = 21;

/// Reason carried by the two terminate messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TerminateCode {
    CallPutdown = 1,
    ServerError = 2,
}

impl TerminateCode {
    fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::CallPutdown),
            2 => Some(Self::ServerError),
            _ => None,
        }
    }
}

/// Every message exchanged over the TCP signalling channel.
///
/// All multi-byte integers are big-endian on the wire. Phone numbers identify
/// clients; the exchange keeps no per-connection protocol state beyond the
/// decode buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// Client asks to register, proposing a preferred phone number.
    HandshakeRequest { phone_number: u16 },
    /// Exchange confirms registration with the allocated phone number.
    HandshakeResponse { phone_number: u16 },
    /// Client dials another number.
    CallRequest { from: u16, to: u16 },
    /// Exchange tells the caller which relay UDP port carries the audio.
    CallResponse { udp_port: u16 },
    /// Exchange announces a call to the callee.
    IncomingCall { from: u16, udp_port: u16 },
    /// Callee accepts the call from `from`.
    IncomingResponse { from: u16 },
    /// Exchange ends a call on a client.
    TerminateCall { code: TerminateCode },
    /// Client ends a call it participates in.
    ClientTerminateCall { code: TerminateCode, phone_number: u16 },
}

impl Message {
    pub fn id(&self) -> u8 {
        match self {
            Message::HandshakeRequest { .. } => MSG_HANDSHAKE_REQUEST,
            Message::HandshakeResponse { .. } => MSG_HANDSHAKE_RESPONSE,
            Message::CallRequest { .. } => MSG_CALL_REQUEST,
            Message::CallResponse { .. } => MSG_CALL_RESPONSE,
            Message::IncomingCall { .. } => MSG_INCOMING_CALL,
            Message::IncomingResponse { .. } => MSG_INCOMING_RESPONSE,
            Message::TerminateCall { .. } => MSG_TERMINATE_CALL,
            Message::ClientTerminateCall { .. } => MSG_CLIENT_TERMINATE_CALL,
        }
    }

    /// Frame this message as wrapper + payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::HandshakeRequest { phone_number }
            | Message::HandshakeResponse { phone_number } => {
                let mut payload = [0u8; 6];
                BigEndian::write_u16(&mut payload[0..2], *phone_number);
                payload[2..6].copy_from_slice(&HANDSHAKE_MAGIC);
                frame(self.id(), &payload)
            }
            Message::CallRequest { from, to } => {
                let mut payload = [0u8; 4];
                BigEndian::write_u16(&mut payload[0..2], *from);
                BigEndian::write_u16(&mut payload[2..4], *to);
                frame(self.id(), &payload)
            }
            Message::CallResponse { udp_port } => {
                let mut payload = [0u8; 2];
                BigEndian::write_u16(&mut payload, *udp_port);
                frame(self.id(), &payload)
            }
            Message::IncomingCall { from, udp_port } => {
                let mut payload = [0u8; 4];
                BigEndian::write_u16(&mut payload[0..2], *from);
                BigEndian::write_u16(&mut payload[2..4], *udp_port);
                frame(self.id(), &payload)
            }
            Message::IncomingResponse { from } => {
                let mut payload = [0u8; 2];
                BigEndian::write_u16(&mut payload, *from);
                frame(self.id(), &payload)
            }
            Message::TerminateCall { code } => frame(self.id(), &[*code as u8]),
            Message::ClientTerminateCall { code, phone_number } => {
                let mut payload = [0u8; 3];
                payload[0] = *code as u8;
                BigEndian::write_u16(&mut payload[1..3], *phone_number);
                frame(self.id(), &payload)
            }
        }
    }
}

fn frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(FRAME_START);
    out.push(payload.len() as u8);
    out.push(id);
    out.extend_from_slice(payload);
    out
}

/// Payload length each message id declares, or None for an unknown id.
fn expected_len(id: u8) -> Option<usize> {
    match id {
        MSG_HANDSHAKE_REQUEST | MSG_HANDSHAKE_RESPONSE => Some(6),
        MSG_CALL_REQUEST | MSG_INCOMING_CALL => Some(4),
        MSG_CALL_RESPONSE | MSG_INCOMING_RESPONSE => Some(2),
        MSG_TERMINATE_CALL => Some(1),
        MSG_CLIENT_TERMINATE_CALL => Some(3),
        _ => None,
    }
}

fn parse_payload(id: u8, payload: &[u8]) -> Option<Message> {
    match id {
        MSG_HANDSHAKE_REQUEST | MSG_HANDSHAKE_RESPONSE => {
            if payload[2..6] != HANDSHAKE_MAGIC {
                return None;
            }
            let phone_number = BigEndian::read_u16(&payload[0..2]);
            Some(if id == MSG_HANDSHAKE_REQUEST {
                Message::HandshakeRequest { phone_number }
            } else {
                Message::HandshakeResponse { phone_number }
            })
        }
        MSG_CALL_REQUEST => Some(Message::CallRequest {
            from: BigEndian::read_u16(&payload[0..2]),
            to: BigEndian::read_u16(&payload[2..4]),
        }),
        MSG_CALL_RESPONSE => Some(Message::CallResponse {
            udp_port: BigEndian::read_u16(payload),
        }),
        MSG_INCOMING_CALL => Some(Message::IncomingCall {
            from: BigEndian::read_u16(&payload[0..2]),
            udp_port: BigEndian::read_u16(&payload[2..4]),
        }),
        MSG_INCOMING_RESPONSE => Some(Message::IncomingResponse {
            from: BigEndian::read_u16(payload),
        }),
        MSG_TERMINATE_CALL => Some(Message::TerminateCall {
            code: TerminateCode::from_wire(payload[0])?,
        }),
        MSG_CLIENT_TERMINATE_CALL => Some(Message::ClientTerminateCall {
            code: TerminateCode::from_wire(payload[0])?,
            phone_number: BigEndian::read_u16(&payload[1..3]),
        }),
        _ => None,
    }
}

/// Incremental frame decoder over a byte stream.
///
/// Feed raw socket reads in with `feed`, then drain messages with `next`.
/// Resynchronisation follows the wrapper rules: a byte that is not a valid
/// start, an id/length mismatch, or a bad payload consumes exactly one byte
/// before rescanning, and an incomplete trailing frame is preserved for the
/// next feed.
#[derive(Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes to the decode buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode the next complete message, if any.
    pub fn next(&mut self) -> Option<Message> {
        let mut ind = 0;
        while self.buf.len() - ind >= HEADER_LEN {
            if self.buf[ind] != FRAME_START {
                ind += 1;
                continue;
            }

            let length = self.buf[ind + 1] as usize;
            let id = self.buf[ind + 2];
            match expected_len(id) {
                Some(expected) if expected == length => {
                    if self.buf.len() - ind - HEADER_LEN < length {
                        // Frame is still in flight; keep the prefix intact.
                        break;
                    }
                    let start = ind + HEADER_LEN;
                    match parse_payload(id, &self.buf[start..start + length]) {
                        Some(msg) => {
                            self.buf.drain(..start + length);
                            return Some(msg);
                        }
                        None => {
                            log::warn!("dropping malformed payload for message id {id:#x}");
                            ind += 1;
                        }
                    }
                }
                _ => {
                    log::debug!("resyncing past invalid frame header (id {id:#x})");
                    ind += 1;
                }
            }
        }
        self.buf.drain(..ind);
        None
    }
}
