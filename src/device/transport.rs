use std::io::Write;
use std::net::TcpStream;

use super::DeviceError;
use crate::models;

/// Byte sink frames are written to
pub type Transport = Box<dyn Write + Send>;

#[cfg(feature = "serial")]
fn open_serial(config: &models::Serial) -> Result<Transport, DeviceError> {
    let port = serialport::new(&config.path, config.baud_rate)
        .timeout(std::time::Duration::from_secs(1))
        .open()?;

    Ok(Box::new(port))
}

#[cfg(not(feature = "serial"))]
fn open_serial(_config: &models::Serial) -> Result<Transport, DeviceError> {
    Err(DeviceError::NotSupported("serial"))
}

fn open_tcp(config: &models::Tcp) -> Result<Transport, DeviceError> {
    let stream = TcpStream::connect((config.host.as_str(), config.port))?;
    stream.set_nodelay(true)?;
    Ok(Box::new(stream))
}

fn open_file(config: &models::File) -> Result<Transport, DeviceError> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.path)?;

    Ok(Box::new(file))
}

/// Open the transport described by `config`
pub fn connect(config: &models::Transport) -> Result<Transport, DeviceError> {
    let transport = match config {
        models::Transport::Serial(serial) => open_serial(serial)?,
        models::Transport::Tcp(tcp) => open_tcp(tcp)?,
        models::Transport::File(file) => open_file(file)?,
    };

    let kind: &'static str = config.into();
    info!(kind = %kind, "transport opened");
    Ok(transport)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{self, Write};
    use std::sync::Arc;

    use parking_lot::Mutex;

    /// In-memory transport capturing the written byte stream
    #[derive(Debug, Default, Clone)]
    pub struct SharedBuffer {
        bytes: Arc<Mutex<Vec<u8>>>,
        flushes: Arc<Mutex<usize>>,
    }

    impl SharedBuffer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn bytes(&self) -> Vec<u8> {
            self.bytes.lock().clone()
        }

        pub fn flushes(&self) -> usize {
            *self.flushes.lock()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.bytes.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            *self.flushes.lock() += 1;
            Ok(())
        }
    }

    /// Transport holding its first write until released
    pub struct Gated {
        inner: SharedBuffer,
        entered: crossbeam_channel::Sender<()>,
        release: crossbeam_channel::Receiver<()>,
        held: bool,
    }

    impl Gated {
        /// Returns the transport, a receiver signaled once the first write is held, and the
        /// sender releasing it
        pub fn new(
            inner: SharedBuffer,
        ) -> (
            Self,
            crossbeam_channel::Receiver<()>,
            crossbeam_channel::Sender<()>,
        ) {
            let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
            let (release_tx, release_rx) = crossbeam_channel::bounded(1);

            (
                Self {
                    inner,
                    entered: entered_tx,
                    release: release_rx,
                    held: false,
                },
                entered_rx,
                release_tx,
            )
        }
    }

    impl Write for Gated {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if !self.held {
                self.held = true;
                self.entered.send(()).ok();
                self.release.recv().ok();
            }

            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    /// Transport failing every write
    pub struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
