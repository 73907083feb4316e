//! Ownership of the exclusive accelerator.
//!
//! The device is acquired at most once per process. A failed acquisition is
//! remembered and handed back to every later caller until the process restarts,
//! retrying against a busy exclusive resource would hide a competing owner.

use std::{
    any::Any,
    fs::{File, OpenOptions},
    io,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use log::{error, info};
use nix::{
    errno::Errno,
    fcntl::{FlockArg, flock},
};
use serde::Serialize;

use crate::error::{BrokerError, Result};

/// When the worker tries to acquire the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirePolicy {
    /// As soon as the worker starts.
    Eager,
    /// On the first request that needs to load a model.
    Lazy,
}

/// A live handle to the accelerator, handed to handlers while loading models.
pub struct Device {
    label: String,
    // Dropping the lease gives the hardware back.
    _lease: Box<dyn Any + Send>,
}

impl Device {
    /// Creates a new `Device`.
    ///
    /// # Arguments
    /// * `label` - Human readable identification, reported by `status`.
    /// * `lease` - Whatever keeps the device held, released when the device is dropped.
    pub fn new(label: impl Into<String>, lease: impl Any + Send) -> Self {
        Self {
            label: label.into(),
            _lease: Box::new(lease),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Opens the accelerator.
pub trait DeviceProvider: Send {
    fn acquire(&mut self) -> io::Result<Device>;
}

/// Opens a device node and holds a non-blocking exclusive `flock` on it.
pub struct ExclusiveNode {
    path: PathBuf,
}

impl ExclusiveNode {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl DeviceProvider for ExclusiveNode {
    fn acquire(&mut self) -> io::Result<Device> {
        let path = self.path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| io::Error::new(e.kind(), format!("cannot open {path}: {e}")))?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(Device::new(path, file)),
            Err(Errno::EWOULDBLOCK) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("{path} is held by another process"),
            )),
            Err(e) => Err(io::Error::new(
                io::Error::from(e).kind(),
                format!("cannot lock {path}: {e}"),
            )),
        }
    }
}

enum State {
    Pending(Box<dyn DeviceProvider>),
    Ready(Device),
    Unavailable(String),
    Released,
}

/// Device availability as reported by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    /// False once acquisition failed or the device was released.
    pub available: bool,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Holder of the single device handle, owned by the worker.
pub struct DeviceOwner {
    state: State,
}

impl DeviceOwner {
    pub fn new(provider: impl DeviceProvider + 'static) -> Self {
        Self {
            state: State::Pending(Box::new(provider)),
        }
    }

    /// Returns the device, acquiring it on the first call.
    ///
    /// # Errors
    /// `DeviceUnavailable` if this or any earlier acquisition failed, or if the
    /// device was already released.
    pub fn acquire(&mut self) -> Result<&Device> {
        if let State::Pending(provider) = &mut self.state {
            self.state = match provider.acquire() {
                Ok(device) => {
                    info!("acquired device {}", device.label());
                    State::Ready(device)
                }
                Err(e) => {
                    error!("device acquisition failed, refusing model requests until restart: {e}");
                    State::Unavailable(e.to_string())
                }
            };
        }

        match &self.state {
            State::Ready(device) => Ok(device),
            State::Unavailable(msg) => Err(BrokerError::DeviceUnavailable(msg.clone())),
            State::Released => Err(BrokerError::DeviceUnavailable(
                "device already released".into(),
            )),
            State::Pending(_) => Err(BrokerError::DeviceUnavailable("device not acquired".into())),
        }
    }

    /// Gives the device back. Only the first call has an effect.
    pub fn release(&mut self) {
        match std::mem::replace(&mut self.state, State::Released) {
            State::Ready(device) => {
                let label = device.label().to_string();
                drop(device);
                info!("released device {label}");
            }
            State::Unavailable(msg) => self.state = State::Unavailable(msg),
            State::Pending(_) | State::Released => {}
        }
    }

    pub fn status(&self) -> DeviceStatus {
        match &self.state {
            State::Pending(_) => DeviceStatus {
                available: true,
                state: "pending",
                label: None,
                error: None,
            },
            State::Ready(device) => DeviceStatus {
                available: true,
                state: "ready",
                label: Some(device.label().to_string()),
                error: None,
            },
            State::Unavailable(msg) => DeviceStatus {
                available: false,
                state: "unavailable",
                label: None,
                error: Some(msg.clone()),
            },
            State::Released => DeviceStatus {
                available: false,
                state: "released",
                label: None,
                error: None,
            },
        }
    }
}
