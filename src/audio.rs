// Audio Module - Duplex sound device wiring between cpal and the ring buffers

use std::io::Write as _;

use anyhow::{Context, Result, anyhow};
use biquad::{Biquad, Coefficients, DirectForm2Transposed, Q_BUTTERWORTH_F32, ToHertz, Type};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{error, info, warn};

use crate::ring::{Consumer, Producer};

/// All audio in the system is signed-16 mono PCM at this rate.
pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u16 = 1;
/// Bytes per frame (one i16 sample).
pub const FRAME_SIZE: usize = 2;

/// Each ring buffer holds two seconds of audio.
const RING_SECONDS: usize = 2;
pub const AUDIO_RING_BYTES: usize = SAMPLE_RATE as usize * RING_SECONDS * FRAME_SIZE;

/// Centre of the voice band-pass applied to playback audio.
const VOICE_BAND_CENTRE_HZ: f32 = 1_500.0;

/// Build the constant-0-dB-peak-gain band-pass used on the playback path
/// (centre 1500 Hz, Q = 0.707).
pub fn voice_band_filter() -> Result<DirectForm2Transposed<f32>> {
    let coefficients = Coefficients::<f32>::from_params(
        Type::BandPass,
        (SAMPLE_RATE as f32).hz(),
        VOICE_BAND_CENTRE_HZ.hz(),
        Q_BUTTERWORTH_F32,
    )
    .map_err(|err| anyhow!("failed to derive band-pass coefficients: {err:?}"))?;
    Ok(DirectForm2Transposed::<f32>::new(coefficients))
}

/// The duplex sound device.
///
/// Owns one cpal stream per direction; the driver's worker thread invokes the
/// data callbacks at the device cadence. The playback callback drains the
/// playback ring buffer and the capture callback fills the capture ring
/// buffer; the adapter borrows both halves for the device lifetime and never
/// owns the buffers themselves.
pub struct AudioDevice {
    output: cpal::Stream,
    input: cpal::Stream,
    running: bool,
}

impl AudioDevice {
    /// Enumerate devices, apply the user's selection, and open both streams
    /// (initially paused).
    pub fn new(playback: Consumer, capture: Producer, use_defaults: bool) -> Result<Self> {
        let host = cpal::default_host();

        let output_device = select_device(
            "playback",
            host.output_devices()
                .context("failed to enumerate playback devices")?
                .collect(),
            host.default_output_device(),
            use_defaults,
        )?;
        let input_device = select_device(
            "capture",
            host.input_devices()
                .context("failed to enumerate capture devices")?
                .collect(),
            host.default_input_device(),
            use_defaults,
        )?;

        let config = cpal::StreamConfig {
            channels: CHANNELS,
            sample_rate: cpal::SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        let output = build_output_stream(&output_device, &config, playback)?;
        let input = build_input_stream(&input_device, &config, capture)?;

        // Some hosts start streams on creation; hold them until start().
        if let Err(err) = output.pause() {
            warn!("could not pause playback stream after open: {err}");
        }
        if let Err(err) = input.pause() {
            warn!("could not pause capture stream after open: {err}");
        }

        Ok(Self {
            output,
            input,
            running: false,
        })
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.output
            .play()
            .context("failed to start playback stream")?;
        self.input.play().context("failed to start capture stream")?;
        self.running = true;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.input.pause().context("failed to stop capture stream")?;
        self.output
            .pause()
            .context("failed to stop playback stream")?;
        self.running = false;
        Ok(())
    }
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut playback: Consumer,
) -> Result<cpal::Stream> {
    let mut filter = voice_band_filter()?;
    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                fill_output(&mut playback, &mut filter, data);
            },
            |err| error!("playback stream error: {err}"),
            None,
        )
        .context("failed to open playback stream")?;
    Ok(stream)
}

fn build_input_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut capture: Producer,
) -> Result<cpal::Stream> {
    let stream = device
        .build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                store_input(&mut capture, data);
            },
            |err| error!("capture stream error: {err}"),
            None,
        )
        .context("failed to open capture stream")?;
    Ok(stream)
}

/// Playback half of the device callback.
///
/// Copies whatever the playback buffer can supply into `out`, runs the
/// band-pass over the samples actually retrieved, and leaves the remainder
/// silent (implicit underrun handling). Returns the bytes committed.
fn fill_output(
    playback: &mut Consumer,
    filter: &mut DirectForm2Transposed<f32>,
    out: &mut [i16],
) -> usize {
    // PCM is little-endian in the buffers and on the wire, matching the
    // native sample layout on every target cpal supports here, so the output
    // block is filled through a raw byte view the same way the transfer path
    // produced the data.
    let out_bytes = unsafe {
        std::slice::from_raw_parts_mut(out.as_mut_ptr() as *mut u8, out.len() * FRAME_SIZE)
    };
    let want = out_bytes.len();
    let mut got = 0;
    while got < want {
        let n = {
            let region = playback.acquire_read(want - got);
            if region.is_empty() {
                break;
            }
            out_bytes[got..got + region.len()].copy_from_slice(region);
            region.len()
        };
        playback.commit_read(n);
        got += n;
    }
    out_bytes[got..].fill(0);

    // The filter covers the bytes acquired, not the count requested.
    let frames = got.div_ceil(FRAME_SIZE);
    for sample in &mut out[..frames] {
        let filtered = filter.run(f32::from(*sample));
        *sample = filtered.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
    }
    got
}

/// Capture half of the device callback.
///
/// Copies captured samples into the capture buffer; when the buffer has no
/// space left the rest of the block is dropped (implicit overrun handling).
/// Returns the bytes committed.
fn store_input(capture: &mut Producer, input: &[i16]) -> usize {
    let in_bytes = unsafe {
        std::slice::from_raw_parts(input.as_ptr() as *const u8, input.len() * FRAME_SIZE)
    };
    let mut stored = 0;
    while stored < in_bytes.len() {
        let n = {
            let region = capture.acquire_write(in_bytes.len() - stored);
            if region.is_empty() {
                break;
            }
            let n = region.len();
            region.copy_from_slice(&in_bytes[stored..stored + n]);
            n
        };
        capture.commit_write(n);
        stored += n;
    }
    stored
}

/// Resolve one direction's device.
///
/// With `use_defaults` set the host default is chosen outright; otherwise the
/// available devices are listed and the user picks one by index, re-prompted
/// until the selection is valid.
fn select_device(
    kind: &str,
    devices: Vec<cpal::Device>,
    default_device: Option<cpal::Device>,
    use_defaults: bool,
) -> Result<cpal::Device> {
    if devices.is_empty() {
        return Err(anyhow!("no {kind} devices available"));
    }

    let default_name = default_device.and_then(|device| device.name().ok());

    if use_defaults {
        for device in devices {
            if device.name().ok() == default_name {
                info!(
                    "{kind} device selected: {}",
                    default_name.as_deref().unwrap_or("unknown")
                );
                return Ok(device);
            }
        }
        return Err(anyhow!("no default {kind} device available"));
    }

    println!("Available {kind} devices:");
    for (index, device) in devices.iter().enumerate() {
        let name = device.name().unwrap_or_else(|_| "<unnamed>".into());
        let marker = if Some(&name) == default_name.as_ref() {
            " (default)"
        } else {
            ""
        };
        println!("[{index}]: {name}{marker}");
    }

    let selection = prompt_selection(kind, devices.len())?;
    let device = devices
        .into_iter()
        .nth(selection)
        .ok_or_else(|| anyhow!("device selection out of range"))?;
    info!(
        "{kind} device selected: {}",
        device.name().unwrap_or_else(|_| "<unnamed>".into())
    );
    Ok(device)
}

fn prompt_selection(kind: &str, count: usize) -> Result<usize> {
    let stdin = std::io::stdin();
    loop {
        print!("Select {kind} device : ");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        if stdin
            .read_line(&mut line)
            .context("failed to read device selection")?
            == 0
        {
            return Err(anyhow!("end of input while selecting {kind} device"));
        }
        match line.trim().parse::<usize>() {
            Ok(index) if index < count => return Ok(index),
            _ => warn!("invalid device selection"),
        }
    }
}
