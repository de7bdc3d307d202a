//! Port lifecycle state machine
//!
//! Every port starts Closed. Open assigns its id and moves it to Stopped,
//! Start/Stop toggle between Stopped and Started, and Close returns it to
//! Closed. The id used to open an index is remembered for the whole session;
//! reopening that index with another id is refused.

use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Scheduler-assigned port identifier
pub type PortId = u32;

/// Port lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortState {
    #[default]
    Closed,
    Stopped,
    Started,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Closed => write!(f, "Closed"),
            PortState::Stopped => write!(f, "Stopped"),
            PortState::Started => write!(f, "Started"),
        }
    }
}

/// Side of the module a port sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => write!(f, "input"),
            PortDirection::Output => write!(f, "output"),
        }
    }
}

/// Lifecycle violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("{direction} port index {index} out of range (max {max})")]
    IndexOutOfRange {
        direction: PortDirection,
        index: usize,
        max: usize,
    },

    #[error("{direction} port {index} is already open")]
    AlreadyOpen { direction: PortDirection, index: usize },

    #[error("{direction} port {index} is closed")]
    NotOpen { direction: PortDirection, index: usize },

    #[error(
        "{direction} port {index} was negotiated with id {previous}, cannot reopen with id {requested}"
    )]
    IdRemapped {
        direction: PortDirection,
        index: usize,
        previous: PortId,
        requested: PortId,
    },

    #[error("{direction} port id {id} is already bound to index {bound_index}")]
    IdInUse {
        direction: PortDirection,
        id: PortId,
        bound_index: usize,
    },
}

/// Connected port on the other side of the module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerLink {
    pub index: usize,
    pub id: PortId,
}

/// One port plus engine-specific state `T`
#[derive(Debug, Default)]
pub struct Port<T> {
    index: usize,
    id: Option<PortId>,
    state: PortState,
    peer: Option<PeerLink>,
    pub ext: T,
}

impl<T> Port<T> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Id while open
    pub fn id(&self) -> Option<PortId> {
        self.id
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state != PortState::Closed
    }

    pub fn is_started(&self) -> bool {
        self.state == PortState::Started
    }

    pub fn peer(&self) -> Option<PeerLink> {
        self.peer
    }
}

/// Result of closing a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed {
    pub id: PortId,
    pub was_started: bool,
}

/// All ports of one direction
#[derive(Debug)]
pub struct PortTable<T> {
    direction: PortDirection,
    ports: Vec<Port<T>>,
    negotiated: Vec<Option<PortId>>,
}

impl<T: Default> PortTable<T> {
    pub fn new(direction: PortDirection, max_ports: usize) -> Self {
        Self {
            direction,
            ports: (0..max_ports)
                .map(|index| Port {
                    index,
                    ..Port::default()
                })
                .collect(),
            negotiated: vec![None; max_ports],
        }
    }

    /// Bind `id` to `index` and move the port to Stopped
    pub fn open(&mut self, index: usize, id: PortId) -> Result<(), PortError> {
        self.check_index(index)?;

        if self.ports[index].is_open() {
            return Err(PortError::AlreadyOpen {
                direction: self.direction,
                index,
            });
        }

        if let Some(previous) = self.negotiated[index] {
            if previous != id {
                return Err(PortError::IdRemapped {
                    direction: self.direction,
                    index,
                    previous,
                    requested: id,
                });
            }
        }

        if let Some(bound_index) = self
            .negotiated
            .iter()
            .enumerate()
            .position(|(i, n)| i != index && *n == Some(id))
        {
            return Err(PortError::IdInUse {
                direction: self.direction,
                id,
                bound_index,
            });
        }

        self.negotiated[index] = Some(id);
        let port = &mut self.ports[index];
        port.id = Some(id);
        port.state = PortState::Stopped;
        debug!("{} port {} opened with id {}", self.direction, index, id);
        Ok(())
    }

    /// Move an open port to Started; returns the previous state
    pub fn start(&mut self, index: usize) -> Result<PortState, PortError> {
        self.check_index(index)?;
        let port = &mut self.ports[index];
        if !port.is_open() {
            return Err(PortError::NotOpen {
                direction: self.direction,
                index,
            });
        }
        let previous = port.state;
        port.state = PortState::Started;
        Ok(previous)
    }

    /// Move a Started port to Stopped; a no-op for Stopped or Closed ports
    pub fn stop(&mut self, index: usize) -> Result<PortState, PortError> {
        self.check_index(index)?;
        let port = &mut self.ports[index];
        let previous = port.state;
        if previous == PortState::Started {
            port.state = PortState::Stopped;
        }
        Ok(previous)
    }

    /// Return a port to Closed and reset its engine state
    pub fn close(&mut self, index: usize) -> Result<Closed, PortError> {
        self.check_index(index)?;
        let direction = self.direction;
        let port = &mut self.ports[index];
        let Some(id) = port.id.take() else {
            return Err(PortError::NotOpen { direction, index });
        };

        let was_started = port.is_started();
        port.state = PortState::Closed;
        port.peer = None;
        port.ext = T::default();
        debug!("{} port {} (id {}) closed", direction, index, id);
        Ok(Closed { id, was_started })
    }

    fn check_index(&self, index: usize) -> Result<(), PortError> {
        if index >= self.ports.len() {
            return Err(PortError::IndexOutOfRange {
                direction: self.direction,
                index,
                max: self.ports.len(),
            });
        }
        Ok(())
    }
}

impl<T> PortTable<T> {
    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    pub fn max_ports(&self) -> usize {
        self.ports.len()
    }

    pub fn get(&self, index: usize) -> Option<&Port<T>> {
        self.ports.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Port<T>> {
        self.ports.get_mut(index)
    }

    pub fn state(&self, index: usize) -> PortState {
        self.ports.get(index).map_or(PortState::Closed, |p| p.state)
    }

    /// Index of the open port carrying `id`
    pub fn index_of(&self, id: PortId) -> Option<usize> {
        self.ports.iter().position(|p| p.id == Some(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Port<T>> {
        self.ports.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Port<T>> {
        self.ports.iter_mut()
    }

    pub fn num_open(&self) -> usize {
        self.ports.iter().filter(|p| p.is_open()).count()
    }

    pub fn num_started(&self) -> usize {
        self.ports.iter().filter(|p| p.is_started()).count()
    }

    /// Force a port's state without lifecycle checks.
    ///
    /// Engines use this for data-driven transitions (a stopped input that
    /// receives data, an input stopped by end-of-stream). Closed ports are
    /// never touched.
    pub fn set_state(&mut self, index: usize, state: PortState) {
        if let Some(port) = self.ports.get_mut(index) {
            if port.is_open() && state != PortState::Closed {
                port.state = state;
            }
        }
    }

    pub fn set_peer(&mut self, index: usize, peer: Option<PeerLink>) {
        if let Some(port) = self.ports.get_mut(index) {
            port.peer = peer;
        }
    }
}
