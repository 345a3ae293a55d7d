use crossbeam_channel::Sender;
use log::{debug, warn};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::LogicError;
use crate::protocol::Command;
use crate::session::{LinkEvent, LinkId, SessionEvent};

const READ_CHUNK: usize = 4096;

/// Link to the Logic application's control endpoint.
///
/// Opening is asynchronous: the outcome and all inbound data arrive on the
/// session's event channel tagged with the `LinkId` passed to [`open`].
///
/// [`open`]: Transport::open
pub trait Transport: Send {
    fn open(
        &mut self,
        host: &str,
        port: u16,
        link: LinkId,
        events: Sender<SessionEvent>,
    ) -> Result<(), LogicError>;

    /// Close the link if open. Calling it again is harmless.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Write one framed command; fails with `NotConnected` when closed.
    fn send(&mut self, command: &Command) -> Result<(), LogicError>;
}

/// Socket options for [`TcpTransport`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    /// Unbounded when `None`
    pub connect_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

/// Link the transport currently stands for and its stream once connected.
///
/// A connect thread only installs its stream while `current` still names its
/// link; `close` and a newer `open` both replace `current`.
#[derive(Debug, Default)]
struct LinkSlot {
    current: Option<LinkId>,
    stream: Option<TcpStream>,
}

impl LinkSlot {
    fn is_current(&self, link: LinkId) -> bool {
        self.current == Some(link)
    }
}

/// [`Transport`] over a plain TCP socket with a background reader thread.
#[derive(Debug, Default)]
pub struct TcpTransport {
    config: ConnectionConfig,
    slot: Arc<Mutex<LinkSlot>>,
}

impl TcpTransport {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            slot: Arc::new(Mutex::new(LinkSlot::default())),
        }
    }

    fn connect(config: &ConnectionConfig, addr: SocketAddr) -> std::io::Result<TcpStream> {
        let stream = match config.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
            None => TcpStream::connect(addr)?,
        };
        stream.set_write_timeout(config.write_timeout)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn read_loop(mut reader: TcpStream, link: LinkId, events: &Sender<SessionEvent>) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                    let event = SessionEvent::Link {
                        id: link,
                        event: LinkEvent::Data(data),
                    };
                    if events.send(event).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Link {link} read ended: {e}");
                    break;
                }
            }
        }
        let _ = events.send(SessionEvent::Link {
            id: link,
            event: LinkEvent::Down,
        });
    }
}

impl Transport for TcpTransport {
    fn open(
        &mut self,
        host: &str,
        port: u16,
        link: LinkId,
        events: Sender<SessionEvent>,
    ) -> Result<(), LogicError> {
        self.close();

        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|_| LogicError::InvalidAddress(format!("{host}:{port}")))?;

        self.slot.lock().current = Some(link);
        let config = self.config.clone();
        let slot = Arc::clone(&self.slot);

        thread::Builder::new()
            .name(format!("logic-link-{link}"))
            .spawn(move || {
                debug!("Connecting to Logic at {addr}");
                let stream = match Self::connect(&config, addr) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let mut guard = slot.lock();
                        if !guard.is_current(link) {
                            return;
                        }
                        guard.current = None;
                        drop(guard);
                        warn!("Failed to connect to {addr}: {e}");
                        let _ = events.send(SessionEvent::Link {
                            id: link,
                            event: LinkEvent::Failed(e.to_string()),
                        });
                        return;
                    }
                };
                let reader = match stream.try_clone() {
                    Ok(reader) => reader,
                    Err(e) => {
                        let _ = events.send(SessionEvent::Link {
                            id: link,
                            event: LinkEvent::Failed(e.to_string()),
                        });
                        return;
                    }
                };

                {
                    let mut guard = slot.lock();
                    if !guard.is_current(link) {
                        debug!("Link {link} superseded while connecting");
                        let _ = stream.shutdown(Shutdown::Both);
                        return;
                    }
                    guard.stream = Some(stream);
                }
                if events
                    .send(SessionEvent::Link {
                        id: link,
                        event: LinkEvent::Up,
                    })
                    .is_err()
                {
                    return;
                }

                Self::read_loop(reader, link, &events);

                let mut guard = slot.lock();
                if guard.is_current(link) {
                    guard.current = None;
                    guard.stream = None;
                }
            })
            .map_err(|source| LogicError::Io {
                source,
                context: "Spawning link thread".to_string(),
            })?;

        Ok(())
    }

    fn close(&mut self) {
        let mut slot = self.slot.lock();
        if let Some(link) = slot.current.take() {
            debug!("Closing link {link}");
        }
        if let Some(stream) = slot.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn is_open(&self) -> bool {
        self.slot.lock().stream.is_some()
    }

    fn send(&mut self, command: &Command) -> Result<(), LogicError> {
        let mut slot = self.slot.lock();
        let stream = slot.stream.as_mut().ok_or(LogicError::NotConnected)?;
        stream
            .write_all(&command.frame())
            .and_then(|_| stream.flush())
            .map_err(|source| LogicError::Io {
                source,
                context: format!("Writing command '{command}'"),
            })
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
