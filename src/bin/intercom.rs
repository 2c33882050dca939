// Intercom client - registers with the exchange, drives calls from the keyboard

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use log::info;

use intercom::backend::AudioBackend;
use intercom::call::{Action, CallControl, CallState, UserInput};
use intercom::config::ClientConfig;
use intercom::dial::KeypadBuffer;
use intercom::protocol::{Decoder, Message};

#[derive(Debug, Parser)]
#[command(name = "intercom", about = "Voice intercom client")]
struct Args {
    /// Path to the client configuration file
    #[arg(short = 'f', long = "config")]
    config: PathBuf,

    /// Use the system default audio devices instead of prompting
    #[arg(short = 'd', long = "defaults")]
    use_defaults: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match ClientConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            eprintln!("usage: intercom -f <config-file> [-d]");
            std::process::exit(2);
        }
    };
    if args.use_defaults {
        config.use_audio_defaults = true;
    }

    run(config)
}

fn run(config: ClientConfig) -> Result<()> {
    let server_addr = resolve_server(&config)?;
    info!("connecting to exchange at {server_addr}");
    let mut stream = TcpStream::connect(server_addr)
        .with_context(|| format!("failed to connect to exchange at {server_addr}"))?;
    stream.set_nodelay(true).ok();

    let mut control = CallControl::new(config.phone_number, server_addr.ip());
    let mut decoder = Decoder::new();

    // The handshake is the only blocking exchange on the signalling socket.
    stream
        .write_all(&control.handshake_request().encode())
        .context("failed to send handshake request")?;
    let response = read_handshake(&mut stream, &mut decoder)?;
    control.on_message(response);
    if control.state() != CallState::WaitForCall {
        bail!("exchange rejected the handshake");
    }
    println!("registered with phone number {}", control.phone_number());

    // Device selection may prompt on stdin, so the backend comes up before
    // the terminal goes raw.
    let mut backend = AudioBackend::init(config.use_audio_defaults)?;

    stream
        .set_nonblocking(true)
        .context("failed to make signalling socket non-blocking")?;

    terminal::enable_raw_mode().context("failed to enable raw terminal mode")?;
    let result = control_loop(&mut stream, &mut decoder, &mut control, &mut backend);
    terminal::disable_raw_mode().ok();
    result
}

fn resolve_server(config: &ClientConfig) -> Result<SocketAddr> {
    (config.server_hostname.as_str(), config.server_port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve host '{}'", config.server_hostname))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| anyhow!("no IPv4 address for host '{}'", config.server_hostname))
}

/// Blocking read until the handshake response decodes.
fn read_handshake(stream: &mut TcpStream, decoder: &mut Decoder) -> Result<Message> {
    let mut buf = [0u8; 256];
    loop {
        if let Some(msg) = decoder.next() {
            return Ok(msg);
        }
        let n = stream.read(&mut buf).context("handshake read failed")?;
        if n == 0 {
            bail!("exchange closed the connection during handshake");
        }
        decoder.feed(&buf[..n]);
    }
}

/// Tick loop: poll the signalling socket, poll the keyboard, run the actions
/// the state machine emits.
fn control_loop(
    stream: &mut TcpStream,
    decoder: &mut Decoder,
    control: &mut CallControl,
    backend: &mut AudioBackend,
) -> Result<()> {
    let mut keypad = KeypadBuffer::new();
    announce(control.state());

    loop {
        let mut buf = [0u8; 1024];
        match stream.read(&mut buf) {
            Ok(0) => bail!("exchange closed the control connection"),
            Ok(n) => {
                decoder.feed(&buf[..n]);
                while let Some(msg) = decoder.next() {
                    let before = control.state();
                    let actions = control.on_message(msg);
                    run_actions(actions, stream, backend)?;
                    if control.state() != before {
                        announce(control.state());
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err).context("signalling socket read failed"),
        }

        if !event::poll(Duration::from_millis(50)).context("keyboard poll failed")? {
            continue;
        }
        let Event::Key(key) = event::read().context("keyboard read failed")? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        let input = match key.code {
            KeyCode::Char('q') | KeyCode::Esc => {
                return quit(stream, control, backend);
            }
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return quit(stream, control, backend);
            }
            KeyCode::Char(c) if c.is_ascii_digit() => {
                keypad.push_digit(c);
                print!("{c}");
                std::io::stdout().flush().ok();
                None
            }
            KeyCode::Enter => match keypad.take() {
                Some(number) => Some(UserInput::Dial(number)),
                None => {
                    print!("\r\ninvalid number\r\n");
                    None
                }
            },
            KeyCode::Backspace => {
                keypad.clear();
                print!("\r\ncleared\r\n");
                None
            }
            KeyCode::Char('a') => Some(UserInput::Accept),
            KeyCode::Char('r') => Some(UserInput::Reject),
            KeyCode::Char('h') => Some(UserInput::HangUp),
            _ => None,
        };

        if let Some(input) = input {
            let before = control.state();
            let actions = control.on_input(input);
            run_actions(actions, stream, backend)?;
            if control.state() != before {
                announce(control.state());
            }
        }
    }
}

/// Leave any active call cleanly before exiting.
fn quit(
    stream: &mut TcpStream,
    control: &mut CallControl,
    backend: &mut AudioBackend,
) -> Result<()> {
    if matches!(control.state(), CallState::InCall { .. }) {
        let actions = control.on_input(UserInput::HangUp);
        run_actions(actions, stream, backend)?;
    }
    print!("\r\nbye\r\n");
    Ok(())
}

fn run_actions(
    actions: Vec<Action>,
    stream: &mut TcpStream,
    backend: &mut AudioBackend,
) -> Result<()> {
    for action in actions {
        match action {
            Action::Send(msg) => send_message(stream, &msg)?,
            Action::StartAudio(session) => backend.start(session)?,
            Action::StopAudio => backend.stop()?,
        }
    }
    Ok(())
}

/// Write a frame to the non-blocking signalling socket, absorbing transient
/// short writes.
fn send_message(stream: &mut TcpStream, msg: &Message) -> Result<()> {
    let bytes = msg.encode();
    let mut written = 0;
    while written < bytes.len() {
        match stream.write(&bytes[written..]) {
            Ok(n) => written += n,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) => return Err(err).context("failed to send signalling message"),
        }
    }
    Ok(())
}

fn announce(state: CallState) {
    match state {
        CallState::Handshake => {}
        CallState::WaitForCall => {
            print!("\r\nready: type a number and press enter to dial\r\n");
        }
        CallState::ExternalCall { to } => print!("\r\ncalling {to}...\r\n"),
        CallState::Ring { from, .. } => {
            print!("\r\nincoming call from {from}: [a]ccept or [r]eject\r\n");
        }
        CallState::InCall { peer } => print!("\r\nin call with {peer}: [h] hangs up\r\n"),
    }
    std::io::stdout().flush().ok();
}
