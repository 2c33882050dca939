// Intercom - voice intercom over TCP signalling and relayed UDP audio
//
// Clients register with a central exchange under short phone numbers, dial
// one another, and exchange raw 48 kHz mono PCM through a per-call UDP relay.
// The data plane runs over lock-free SPSC ring buffers between the sound
// device callbacks and the transfer engine; the control plane is a polled
// state machine over a framed TCP protocol.

pub mod audio;
pub mod backend;
pub mod call;
pub mod config;
pub mod dial;
pub mod exchange;
pub mod protocol;
pub mod relay;
pub mod ring;
pub mod transfer;
