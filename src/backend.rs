// Backend Module - Composes ring buffers, sound device and transfer engine

use anyhow::{Context, Result};
use log::info;

use crate::audio::{AUDIO_RING_BYTES, AudioDevice};
use crate::ring::RingBuffer;
use crate::transfer::{SessionDescriptor, TransferEngine};

/// The client's audio plane.
///
/// `init` wires the shared ring buffers between the device adapter (capture
/// producer + playback consumer) and the transfer engine (capture consumer +
/// playback producer). Audio flows only while a session is started; start and
/// stop are idempotent.
pub struct AudioBackend {
    // Field order is teardown order: transfer engine first (joins its
    // thread), then the device; the ring buffers die with their last handle.
    transfer: TransferEngine,
    device: AudioDevice,
    started: bool,
}

impl AudioBackend {
    pub fn init(use_audio_defaults: bool) -> Result<Self> {
        info!("initialising ring buffers");
        let (capture_prod, capture_cons) =
            RingBuffer::shared(AUDIO_RING_BYTES).context("capture ring buffer")?;
        let (playback_prod, playback_cons) =
            RingBuffer::shared(AUDIO_RING_BYTES).context("playback ring buffer")?;

        info!("initialising audio device");
        let device = AudioDevice::new(playback_cons, capture_prod, use_audio_defaults)?;

        info!("initialising transfer engine");
        let transfer = TransferEngine::spawn(capture_cons, playback_prod);

        Ok(Self {
            transfer,
            device,
            started: false,
        })
    }

    /// Start the device and release the transfer engine towards the relay.
    pub fn start(&mut self, session: SessionDescriptor) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.device.start()?;
        self.transfer.start(session);
        self.started = true;
        Ok(())
    }

    /// Stop the session; the transfer engine drops back to its gate at the
    /// next iteration boundary.
    pub fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        self.transfer.stop();
        self.device.stop()?;
        self.started = false;
        Ok(())
    }
}
