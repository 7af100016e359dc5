//! Readiness reactor for many compartment monitors.
//!
//! ## Example
//!
//! ```ignore
//! use compartd_seccomp::{Event, Supervisor};
//!
//! let mut supervisor = Supervisor::new()?;
//! supervisor.register(Box::new(monitor))?;
//!
//! let mut events = Vec::new();
//! while !supervisor.is_empty() {
//!     supervisor.poll(&mut events, None)?;
//!     for event in events.drain(..) {
//!         if let Event::Closed { id } = event {
//!             println!("{id} finished");
//!         }
//!     }
//! }
//! ```
//!
//! Monitors are independent: a monitor whose channel closes is removed and
//! reported, the rest keep running.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events as MioEvents, Interest, Poll, Token};
use thiserror::Error;

use crate::compartment::CompartmentId;
use crate::error::MonitorError;
use crate::monitor::Dispatch;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{0} is already registered")]
    Duplicate(CompartmentId),

    #[error("{0} is not registered")]
    Unknown(CompartmentId),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Events emitted by the [`Supervisor`].
#[derive(Debug)]
pub enum Event {
    /// Notifications were fetched and answered.
    Handled { id: CompartmentId, count: usize },
    /// The notification channel closed; the monitor was removed.
    Closed { id: CompartmentId },
    /// A watched process exited. Its pidfd is handed back for reaping.
    Exited { id: CompartmentId, pidfd: OwnedFd },
}

// Token encoding: [compartment_id][type: 1 bit]
const TOKEN_TYPE_BITS: usize = 1;
const TOKEN_TYPE_MASK: usize = 0b1;
const TOKEN_TYPE_NOTIFY: usize = 0;
const TOKEN_TYPE_PIDFD: usize = 1;

fn encode_token(id: CompartmentId, token_type: usize) -> Token {
    Token((id.0 << TOKEN_TYPE_BITS) | token_type)
}

fn decode_token(token: Token) -> (CompartmentId, usize) {
    let raw = token.0;
    (CompartmentId(raw >> TOKEN_TYPE_BITS), raw & TOKEN_TYPE_MASK)
}

struct Entry {
    monitor: Box<dyn Dispatch>,
    pidfd: Option<OwnedFd>,
}

pub struct Supervisor {
    poll: Poll,
    entries: HashMap<CompartmentId, Entry>,
    mio_events: MioEvents,
}

impl Supervisor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            entries: HashMap::new(),
            mio_events: MioEvents::with_capacity(64),
        })
    }

    /// Start watching a monitor's channel.
    pub fn register(&mut self, monitor: Box<dyn Dispatch>) -> Result<CompartmentId, SupervisorError> {
        let id = monitor.compartment_id();
        if self.entries.contains_key(&id) {
            return Err(SupervisorError::Duplicate(id));
        }

        self.poll.registry().register(
            &mut SourceFd(&monitor.as_raw_fd()),
            encode_token(id, TOKEN_TYPE_NOTIFY),
            Interest::READABLE,
        )?;
        self.entries.insert(
            id,
            Entry {
                monitor,
                pidfd: None,
            },
        );

        tracing::debug!(compartment = %id, "monitor registered");
        Ok(id)
    }

    /// Report [`Event::Exited`] when the process behind `pidfd` exits.
    pub fn watch_exit(&mut self, id: CompartmentId, pidfd: OwnedFd) -> Result<(), SupervisorError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(SupervisorError::Unknown(id))?;
        self.poll.registry().register(
            &mut SourceFd(&pidfd.as_raw_fd()),
            encode_token(id, TOKEN_TYPE_PIDFD),
            Interest::READABLE,
        )?;
        if let Some(old) = entry.pidfd.replace(pidfd) {
            self.poll
                .registry()
                .deregister(&mut SourceFd(&old.as_raw_fd()))
                .ok();
        }
        Ok(())
    }

    /// Stop watching a monitor and hand it back.
    pub fn deregister(&mut self, id: CompartmentId) -> Option<Box<dyn Dispatch>> {
        let entry = self.entries.remove(&id)?;
        // Deregister before the caller can drop (and close) the fds
        self.poll
            .registry()
            .deregister(&mut SourceFd(&entry.monitor.as_raw_fd()))
            .ok();
        if let Some(pidfd) = &entry.pidfd {
            self.poll
                .registry()
                .deregister(&mut SourceFd(&pidfd.as_raw_fd()))
                .ok();
        }
        tracing::debug!(compartment = %id, "monitor deregistered");
        Some(entry.monitor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: CompartmentId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Poll for events. Blocks until something is ready or `timeout` expires.
    pub fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        if self.entries.is_empty() {
            return Ok(());
        }

        match self.poll.poll(&mut self.mio_events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let mut ready: Vec<CompartmentId> = Vec::new();
        let mut closed: Vec<CompartmentId> = Vec::new();
        let mut exited: Vec<CompartmentId> = Vec::new();

        for mio_event in &self.mio_events {
            let (id, token_type) = decode_token(mio_event.token());
            if !self.entries.contains_key(&id) {
                continue;
            }
            match token_type {
                TOKEN_TYPE_NOTIFY => {
                    if mio_event.is_readable() {
                        ready.push(id);
                    }
                    if mio_event.is_read_closed() || mio_event.is_error() {
                        closed.push(id);
                    }
                }
                TOKEN_TYPE_PIDFD => exited.push(id),
                _ => {}
            }
        }

        for id in ready {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            match entry.monitor.dispatch() {
                Ok(0) => {}
                Ok(count) => events.push(Event::Handled { id, count }),
                Err(MonitorError::ChannelClosed(errno)) => {
                    tracing::info!(compartment = %id, error = %errno, "notification channel closed");
                    closed.push(id);
                }
                Err(e) => {
                    tracing::warn!(compartment = %id, error = %e, "dispatch failed");
                }
            }
        }

        for id in exited {
            let Some(pidfd) = self.entries.get_mut(&id).and_then(|e| e.pidfd.take()) else {
                continue;
            };
            self.poll
                .registry()
                .deregister(&mut SourceFd(&pidfd.as_raw_fd()))
                .ok();
            events.push(Event::Exited { id, pidfd });
        }

        for id in closed {
            if self.deregister(id).is_some() {
                events.push(Event::Closed { id });
            }
        }

        Ok(())
    }
}
