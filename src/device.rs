//! Double-buffered frame pipeline feeding an Adalight device

use std::io::Write;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::color::{ColorRgb, ColorRgbExt};

pub mod protocol;

mod transport;
pub use transport::{connect, Transport};

#[cfg(test)]
pub(crate) use transport::testing;

/// Maximum number of LEDs the protocol can address
pub const MAX_LEDS: usize = 1024;

/// Upper bound on the writer waiting for a new frame
const WRITER_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("led count {count} exceeds the maximum of 1024")]
    LimitExceeded { count: usize },
    #[error("led index {index} out of range (led count: {count})")]
    OutOfRange { index: i64, count: usize },
    #[error("the device is already open")]
    AlreadyOpen,
    #[error("the frame writer panicked")]
    WriterPanicked,
    #[error("device not supported: {0}")]
    NotSupported(&'static str),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serial")]
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

#[derive(Default)]
struct Frames {
    /// Frame being painted by scripts
    back: Vec<ColorRgb>,
    /// Latest published frame
    front: Vec<ColorRgb>,
    dirty: bool,
    closing: bool,
}

#[derive(Default)]
struct Shared {
    frames: Mutex<Frames>,
    wake: Condvar,
}

/// LED strip frame buffers and the writer streaming them to the device.
///
/// Scripts paint into the back buffer and [DeviceChannel::publish] it. A dedicated writer thread
/// encodes the most recently published frame and writes it to the transport. Frames published
/// faster than the transport can take them are coalesced, only the latest one is sent.
#[derive(Default)]
pub struct DeviceChannel {
    shared: Arc<Shared>,
    writer: Mutex<Option<JoinHandle<Transport>>>,
}

impl DeviceChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start streaming published frames to `transport`
    pub fn open(&self, transport: Transport) -> Result<(), DeviceError> {
        let mut writer = self.writer.lock();
        if writer.is_some() {
            return Err(DeviceError::AlreadyOpen);
        }

        self.shared.frames.lock().closing = false;

        let shared = self.shared.clone();
        *writer = Some(
            std::thread::Builder::new()
                .name("adalight-writer".to_owned())
                .spawn(move || write_frames(shared, transport))?,
        );

        Ok(())
    }

    /// Turn all LEDs off, wait for that frame to be written and close the transport
    pub fn close(&self) -> Result<(), DeviceError> {
        let writer = self.writer.lock().take();

        {
            let mut frames = self.shared.frames.lock();
            frames.back.fill(ColorRgb::off());
            Self::publish_frames(&mut frames);
            frames.closing = writer.is_some();
        }
        self.shared.wake.notify_one();

        if let Some(writer) = writer {
            let transport = writer.join().map_err(|_| DeviceError::WriterPanicked)?;
            drop(transport);

            self.shared.frames.lock().closing = false;
            debug!("device closed");
        }

        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.writer.lock().is_some()
    }

    pub fn led_count(&self) -> usize {
        self.shared.frames.lock().back.len()
    }

    /// Resize the back buffer. Contents are reset to off only when the count changes.
    pub fn set_led_count(&self, count: usize) -> Result<(), DeviceError> {
        if count > MAX_LEDS {
            return Err(DeviceError::LimitExceeded { count });
        }

        let mut frames = self.shared.frames.lock();
        if frames.back.len() != count {
            frames.back = vec![ColorRgb::off(); count];
        }

        Ok(())
    }

    pub fn set_pixel(&self, index: usize, color: ColorRgb) -> Result<(), DeviceError> {
        let mut frames = self.shared.frames.lock();
        let count = frames.back.len();

        match frames.back.get_mut(index) {
            Some(pixel) => {
                *pixel = color;
                Ok(())
            }
            None => Err(DeviceError::OutOfRange {
                index: index as i64,
                count,
            }),
        }
    }

    pub fn set_all(&self, color: ColorRgb) {
        self.shared.frames.lock().back.fill(color);
    }

    /// Make the back buffer the next frame to be written
    pub fn publish(&self) {
        Self::publish_frames(&mut self.shared.frames.lock());
        self.shared.wake.notify_one();
    }

    /// Copy of the latest published frame
    pub fn current_frame(&self) -> Vec<ColorRgb> {
        self.shared.frames.lock().front.clone()
    }

    fn publish_frames(frames: &mut Frames) {
        let Frames { back, front, .. } = frames;

        if front.len() != back.len() {
            *front = back.clone();
        } else {
            front.copy_from_slice(back);
        }

        frames.dirty = true;
    }
}

impl Drop for DeviceChannel {
    fn drop(&mut self) {
        if self.writer.get_mut().is_some() {
            if let Err(error) = self.close() {
                error!(error = %error, "closing device failed");
            }
        }
    }
}

fn write_frames(shared: Arc<Shared>, mut transport: Transport) -> Transport {
    let span = info_span!("writer");
    let _enter = span.enter();

    let mut buffer = BytesMut::new();

    loop {
        let (ready, closing) = {
            let mut frames = shared.frames.lock();
            if !frames.dirty && !frames.closing {
                shared.wake.wait_for(&mut frames, WRITER_TIMEOUT);
            }

            let ready = std::mem::take(&mut frames.dirty);
            if ready {
                buffer.clear();
                protocol::encode(&frames.front, &mut buffer);
            }

            (ready, frames.closing)
        };

        if ready {
            trace!(len = buffer.len(), "writing frame");

            if let Err(error) = transport
                .write_all(&buffer)
                .and_then(|_| transport.flush())
            {
                warn!(error = %error, "writing frame failed");
            }
        }

        if closing {
            break;
        }
    }

    transport
}
