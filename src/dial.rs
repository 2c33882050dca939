// Dial Module - Local dial input: desktop keypad buffer and rotary pulse decoding

use thiserror::Error;

/// Debounce window: the pin level must hold this long to count.
const DEBOUNCE_US: u64 = 1_000;
/// Quiescent-low time after which the dialled pulses are committed.
const COMMIT_US: u64 = 1_000_000;
/// Poll cadence while watching the pin.
const POLL_US: u64 = 100;
/// Grace period for a pin found high at rest.
const REST_RETRY_US: u64 = 200_000;
const REST_RETRIES: u32 = 10;

/// Accumulates typed digits into a number to dial (desktop variant).
#[derive(Debug, Default)]
pub struct KeypadBuffer {
    digits: String,
}

impl KeypadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a digit key. Non-digits and overlong input are ignored.
    pub fn push_digit(&mut self, key: char) {
        if key.is_ascii_digit() && self.digits.len() < 5 {
            self.digits.push(key);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.digits
    }

    pub fn clear(&mut self) {
        self.digits.clear();
    }

    /// Commit the buffered digits as a phone number, clearing the buffer.
    /// Returns None for an empty buffer or a value outside 1..=65535.
    pub fn take(&mut self) -> Option<u16> {
        let number = self.digits.parse::<u16>().ok().filter(|&n| n > 0);
        self.digits.clear();
        number
    }
}

/// Level source for the rotary dial contact. The GPIO driver behind it is a
/// platform concern; the state machine below only needs the level.
pub trait DialPin {
    fn is_high(&mut self) -> bool;
}

/// Time source for the debouncer, injectable so the pulse logic is testable
/// without real time.
pub trait DialClock {
    fn now_micros(&mut self) -> u64;
    fn sleep_micros(&mut self, us: u64);
}

/// Wall-clock implementation used on the device.
pub struct MonotonicClock {
    origin: std::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl DialClock for MonotonicClock {
    fn now_micros(&mut self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn sleep_micros(&mut self, us: u64) {
        std::thread::sleep(std::time::Duration::from_micros(us));
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DialError {
    #[error("dial pin stuck high; it must rest at ground")]
    PinStuckHigh,
}

/// Decode one rotary-dialled number.
///
/// The contact rests low and pulses high once per digit step. Levels must be
/// stable for 1 ms before they count; each debounced return to low is one
/// pulse. One second of quiescent low commits `pulses - 1` (the rest level
/// itself registers as the first pulse). A pin found high at entry is retried
/// for up to 10 x 200 ms before failing.
pub fn read_dialed_number(
    pin: &mut dyn DialPin,
    clock: &mut dyn DialClock,
) -> Result<u16, DialError> {
    // Wait for the contact to settle at its rest level.
    let mut attempts = 0;
    while pin.is_high() {
        log::warn!("dial pin expected low at rest, found high");
        if attempts >= REST_RETRIES {
            return Err(DialError::PinStuckHigh);
        }
        attempts += 1;
        clock.sleep_micros(REST_RETRY_US);
    }

    let mut pulses: u16 = 0;
    let mut pin_state = false;
    let mut debounced = true; // forces the settled rest-low to register
    let mut last_change = clock.now_micros();

    loop {
        let now = clock.now_micros();
        let level = pin.is_high();

        if level != pin_state {
            pin_state = level;
            last_change = now;
        }

        if now - last_change > DEBOUNCE_US && debounced != pin_state {
            debounced = pin_state;
            if !debounced {
                pulses += 1;
            }
        }

        // Commit once the dial has been back at rest for a full second.
        // pulses == 1 is just the rest level with nothing dialled; keep
        // waiting in that case.
        if !debounced && pulses > 1 && now - last_change > COMMIT_US {
            return Ok(pulses - 1);
        }

        clock.sleep_micros(POLL_US);
    }
}
