//! Serial lines bound to an engine
//!
//! `SerialLink` owns one port per line. Writes go through the `Transport`
//! impl; each line also gets a reader thread, with its own receive buffer,
//! that hands incoming bytes to the engine.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use super::engine::{Engine, Transport};
use super::{ProtocolError, READ_CHUNK_SIZE};

/// Serial ports acting as the engine's lines
pub struct SerialLink {
    ports: Vec<Mutex<Box<dyn SerialPort>>>,
    running: Arc<AtomicBool>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl SerialLink {
    /// Wrap opened ports; port `n` becomes line `n`
    pub fn new(ports: Vec<Box<dyn SerialPort>>) -> Arc<Self> {
        Arc::new(Self {
            ports: ports.into_iter().map(Mutex::new).collect(),
            running: Arc::new(AtomicBool::new(false)),
            readers: Mutex::new(Vec::new()),
        })
    }

    /// Number of ports, one per line
    pub fn line_count(&self) -> usize {
        self.ports.len()
    }

    /// Reader threads have been started and not stopped
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn a reader thread per line feeding `engine`
    ///
    /// Every port is cloned before any thread starts. On failure nothing is
    /// left running.
    pub fn start(&self, engine: Arc<Engine>) -> Result<(), ProtocolError> {
        if engine.line_count() != self.ports.len() {
            return Err(ProtocolError::InvalidConfig(format!(
                "engine has {} lines but {} ports are open",
                engine.line_count(),
                self.ports.len()
            )));
        }
        if self.is_running() {
            return Ok(());
        }

        let ports = self
            .ports
            .iter()
            .enumerate()
            .map(|(line, port)| {
                port.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .try_clone()
                    .map_err(|e| {
                        ProtocolError::SerialError(format!("line {}: {}", line, e))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        for (line, reader) in ports.into_iter().enumerate() {
            let engine = engine.clone();
            let running = self.running.clone();
            let spawned = thread::Builder::new()
                .name(format!("fclink-rx-{}", line))
                .spawn(move || read_loop(line, reader, engine, running));
            match spawned {
                Ok(handle) => readers.push(handle),
                Err(e) => {
                    drop(readers);
                    self.stop();
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Stop and join the reader threads
    ///
    /// Readers hold the engine, which holds this link as its transport, so
    /// the threads run until this is called.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handles: Vec<_> = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("Reader thread panicked");
            }
        }
    }
}

impl Transport for SerialLink {
    fn transmit(&self, line: usize, frame: &[u8]) {
        let Some(port) = self.ports.get(line) else {
            warn!(line, "Transmit on unknown line");
            return;
        };
        let mut port = port.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = port.write_all(frame).and_then(|_| port.flush()) {
            warn!(line, error = %e, bytes = frame.len(), "Serial write failed");
        }
    }
}

fn read_loop(
    line: usize,
    mut port: Box<dyn SerialPort>,
    engine: Arc<Engine>,
    running: Arc<AtomicBool>,
) {
    debug!(line, "Reader started");
    let mut buf = [0u8; READ_CHUNK_SIZE];
    while running.load(Ordering::SeqCst) {
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if let Err(e) = engine.deliver_bytes(line, &buf[..n]) {
                    warn!(line, error = %e, "Receive path error");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                engine.on_read_error(line, &e.to_string());
                break;
            }
        }
    }
    debug!(line, "Reader exiting");
}
