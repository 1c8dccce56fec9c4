//! # Revolute Module Netstack
//!
//! This is the firmware logic for one *revolute module*: a node in a
//! tree-shaped daisy chain of position-controlled servo joints, joined by a
//! single half-duplex serial bus. A fixed *master* node sits at the root of
//! the tree and owns all bus traffic; every other node is a module with up
//! to four downstream ports (A through D) into which further children may be
//! plugged at runtime.
//!
//! ## Entities
//!
//! There are two roles on the bus:
//!
//! 1. The master, which initiates discovery, assigns logical IDs, and
//!    addresses individual modules for ping and reset operations. Only its
//!    wire behavior matters here; its implementation lives elsewhere.
//! 2. The module (this crate), which answers the master, forwards traffic
//!    toward its children, and keeps the servo inside its own joint coupled
//!    to its assigned ID.
//!
//! ## Message framing
//!
//! Module-to-module messages are fixed-layout frames:
//!
//! ```text
//! 0xF8 0xF8 | SRC | DST | TYPE | PARAM | 0x55 0x55
//! ```
//!
//! The start and end bytes appear twice each, which survives a corrupted
//! byte at either edge and gives peer modules a window to finish their own
//! receiver setup. There is no length field and no checksum; a frame that
//! does not open with two consecutive start bytes is dropped and the reader
//! keeps listening. See [`frame`] for the codec and type codes.
//!
//! ## One UART, six jobs
//!
//! The microcontroller driving a module has a single UART which must be
//! re-pointed at different physical pins depending on what the module is
//! doing: idle listening for the master, transmitting a response, listening
//! on one specific child port, probing all four child ports for a hello, or
//! talking to the attached servo. Each of those is a [`port::Role`], and
//! [`port::PortController`] owns the only path between them: pins are driven
//! high and detached, receiver buffers are drained, the old peripheral
//! layout is unloaded and the new one loaded before any byte moves again.
//! A module about to transmit additionally sits out one settlement delay so
//! its peers can finish their own role switch; that delay is the bus's only
//! collision-avoidance mechanism.
//!
//! ## Discovery
//!
//! Modules boot with the default ID (251) and unconfigured. The master
//! floods HELLO frames down the tree; an unconfigured module answers with
//! its own hello, gets an ID assignment (1..=250) in return, acknowledges
//! it, and from then on forwards discovery and ping traffic toward whichever
//! child port it has heard a downstream hello on. Addressing is ordered:
//! a destination greater than our own ID is always somewhere below us in
//! the tree. A CLEAR_CONFIG aimed at us or anywhere upstream of us undoes
//! the assignment, because downstream IDs are only meaningful relative to
//! the upstream ordering. See [`module::Module`] for the decision table.
//!
//! ## The servo
//!
//! Each module carries a vendor smart servo on a secondary bus, speaking the
//! vendor's checksummed binary protocol. At boot the module refuses to do
//! anything else until it has found the servo's factory ID by broadcast ping
//! and verified the servo's status-return level; after an ID assignment it
//! rewrites the servo's EEPROM so the servo answers on the module's own
//! logical ID. See [`servo`].
//!
//! ## Hardware seam
//!
//! All hardware access goes through the [`Hal`] trait: peripheral
//! load/unload per role, lane-tagged byte receive, path-tagged frame
//! transmit, and the small GPIO surface (configured LED, servo-ID indicator,
//! bus attach). `revolute-sim` implements it over in-memory lanes for the
//! scenario tests; a hardware port implements it over the real
//! reconfiguration primitives.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(async_fn_in_trait)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod frame;
pub mod module;
pub mod port;
pub mod servo;

pub use crate::module::Module;

use crate::port::{ChildPort, Role};

/// The master node's ID, and the destination of every module response.
pub const MASTER_ID: u8 = 0;

/// Destination meaning "all nodes". A broadcast is never acknowledged.
pub const BROADCAST_ID: u8 = 254;

/// The ID every module boots with, before the master has configured it.
pub const DEFAULT_ID: u8 = 251;

/// The highest ID the master may assign. Valid assignments are
/// `1..=MAX_ASSIGNED_ID`; `251` is the default, `0` the master, `254`
/// broadcast, and `253`/`255` are reserved.
pub const MAX_ASSIGNED_ID: u8 = 250;

/// First byte of a module frame, sent twice.
pub const START_BYTE: u8 = 248;

/// Last byte of a module frame, sent twice.
pub const END_BYTE: u8 = 85;

/// An error type for the [`Hal`] trait
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum Error<E> {
    /// Some error with the underlying serial hardware
    Serial(E),
}

impl<E> From<E> for Error<E> {
    fn from(value: E) -> Self {
        Self::Serial(value)
    }
}

/// Which receiver produced a byte.
///
/// The hello-listen role runs four receivers at once, and the routing layer
/// needs to know which downstream port a start byte arrived on; every
/// received byte is therefore tagged with its lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Lane {
    /// The parent-facing pin. Also the servo lane while the
    /// [`Role::ServoInit`] role is loaded.
    Upstream,
    /// One of the four downstream ports.
    Child(ChildPort),
}

/// A received byte together with the lane it arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct RxByte {
    /// The receiver that produced the byte.
    pub lane: Lane,
    /// The byte itself.
    pub byte: u8,
}

/// Which transmitter group(s) a frame is driven onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum TxPath {
    /// Both TX groups, so the parent hears the reply regardless of which
    /// port it owns.
    AllPorts,
    /// The servo group only. Implementations must detach the child ports
    /// from the bus for the duration of the send, so downstream modules do
    /// not observe servo traffic.
    Servo,
}

/// How much of the shared bus this module is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum BusAttach {
    /// Only the parent-facing pin. The state of an unconfigured module.
    UpstreamOnly,
    /// All five pins, so children can be heard and spoken to.
    AllPorts,
}

/// The hardware surface a module runs on.
///
/// One implementor drives the real dynamically-reconfigured UART and GPIO;
/// the simulator in `revolute-sim` drives in-memory lanes. The port
/// controller is the only caller of the role-plumbing methods, and it
/// guarantees they are called in the quiesce → unload → load order.
pub trait Hal {
    /// The error type of the underlying serial hardware
    type SerError;

    /// Drive the shared-bus pins high and detach them from the global bus,
    /// and drain every receive buffer. Called before any peripheral is torn
    /// down, so no spurious start bits are seen during reconfiguration and
    /// no stale bytes survive a role change.
    fn quiesce(&mut self);

    /// Tear down the peripheral set belonging to `role`.
    fn unload(&mut self, role: Role);

    /// Tear down every known peripheral set. Only called once, on the
    /// cold-start path where no role has ever been loaded.
    fn unload_all(&mut self);

    /// Install the peripheral configuration for `role` and start its
    /// receiver(s) or transmitter(s), no parity.
    fn load(&mut self, role: Role);

    /// Attach the given pin set to the global bus.
    fn attach_bus(&mut self, attach: BusAttach);

    /// Drive the configured-indicator LED.
    fn set_configured_led(&mut self, on: bool);

    /// Show `id` on the servo-ID indicator pins. Only IDs `1..=6` have a
    /// pattern; anything else must leave the indicator in its previous
    /// state. Diagnostic only.
    fn show_servo_id(&mut self, id: u8);

    /// Receive the next byte from whichever receiver(s) the loaded role
    /// runs, tagged with its lane.
    ///
    /// This future MUST be cancellation safe: every bounded listen wraps it
    /// in a timeout, and a cancelled receive must not lose the receiver.
    async fn recv_byte(&mut self) -> Result<RxByte, Error<Self::SerError>>;

    /// Send `data` on the given path.
    ///
    /// The future MUST not return until the hardware reports transmit
    /// complete on every driven group, e.g. all data is "flushed".
    async fn send_frame(&mut self, path: TxPath, data: &[u8])
        -> Result<(), Error<Self::SerError>>;
}
