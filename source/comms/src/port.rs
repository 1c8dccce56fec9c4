//! Port-role controller
//!
//! The module's single UART plays six mutually exclusive roles, each backed
//! by its own peripheral layout. [`PortController`] owns the only legal path
//! between them: quiesce the shared pins, unload the old layout, load the
//! new one, settle if we are about to transmit, then publish the new role
//! and re-attach the bus. No two receive roles are ever live at once, and
//! no byte moves while no role is loaded.

use embassy_time::{Duration, Timer};

use crate::{BusAttach, Error, Hal, RxByte, TxPath};

/// How long a module about to transmit sits silent first, so every peer has
/// finished its own role switch. This is the bus's only collision-avoidance
/// mechanism.
pub const SETTLE_DELAY: Duration = Duration::from_millis(1);

/// How long the hello-listen role probes the four child ports for a
/// downstream start byte.
pub const HELLO_LISTEN_TIMEOUT: Duration = Duration::from_millis(10);

/// How long a child-reply role waits for the addressed subtree to finish
/// its answer. Covers a whole downstream chain settling and replying.
pub const CHILD_REPLY_TIMEOUT: Duration = Duration::from_millis(50);

/// How long the servo-init role waits for the servo's status frame. The
/// servo's factory return delay is 500 microseconds.
pub const SERVO_REPLY_TIMEOUT: Duration = Duration::from_millis(10);

/// One of the four downstream ports a child may be plugged into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum ChildPort {
    /// Downstream port A.
    A,
    /// Downstream port B.
    B,
    /// Downstream port C.
    C,
    /// Downstream port D.
    D,
}

impl ChildPort {
    /// All four ports, in probe order.
    pub const ALL: [ChildPort; 4] = [ChildPort::A, ChildPort::B, ChildPort::C, ChildPort::D];

    /// The port letter as it travels in a hello parameter slot.
    pub const fn letter(self) -> u8 {
        match self {
            ChildPort::A => b'A',
            ChildPort::B => b'B',
            ChildPort::C => b'C',
            ChildPort::D => b'D',
        }
    }
}

impl TryFrom<u8> for ChildPort {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            b'A' => Ok(ChildPort::A),
            b'B' => Ok(ChildPort::B),
            b'C' => Ok(ChildPort::C),
            b'D' => Ok(ChildPort::D),
            _ => Err(()),
        }
    }
}

/// The six UART roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Role {
    /// Idle listen on the upstream pin for master frames.
    Wait,
    /// Both TX groups loaded, about to transmit.
    MyResponse,
    /// Listen for a reply on one specific child port.
    ChildReply(ChildPort),
    /// Probe all four child ports for a downstream hello.
    HelloListen,
    /// Await the attached servo's status frame.
    ServoInit,
}

/// Owner of the UART role and the only writer of the current-role state.
pub struct PortController<H: Hal> {
    hal: H,
    state: Option<Role>,
}

impl<H: Hal> PortController<H> {
    /// Wrap a hardware surface. No role is loaded until the first
    /// [`switch_to`](Self::switch_to); the first switch takes the
    /// cold-start path and blindly unloads every known layout.
    pub fn new(hal: H) -> Self {
        Self { hal, state: None }
    }

    /// The currently loaded role, if any.
    pub fn role(&self) -> Option<Role> {
        self.state
    }

    /// Hand the hal over the fence for direct byte IO.
    pub(crate) fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    /// Move the UART to `role`.
    ///
    /// Quiesce, unload the old layout (all layouts on the cold-start path),
    /// load the new one, and sit out one [`SETTLE_DELAY`] when entering
    /// [`Role::MyResponse`] so peers can finish their own handover before
    /// any byte is emitted. Finally publish the role and re-attach the bus:
    /// all five pins plus the indicators when the module is configured,
    /// the upstream pin alone otherwise.
    pub async fn switch_to(&mut self, role: Role, configured: bool, servo_id: u8) {
        self.hal.quiesce();

        match self.state.take() {
            Some(old) => self.hal.unload(old),
            None => self.hal.unload_all(),
        }

        self.hal.load(role);

        if role == Role::MyResponse {
            Timer::after(SETTLE_DELAY).await;
        }

        self.state = Some(role);

        if configured {
            self.hal.attach_bus(BusAttach::AllPorts);
            self.hal.set_configured_led(true);
            self.hal.show_servo_id(servo_id);
        } else {
            self.hal.attach_bus(BusAttach::UpstreamOnly);
            self.hal.set_configured_led(false);
        }
    }

    /// Receive one lane-tagged byte in the current role.
    pub(crate) async fn recv_byte(&mut self) -> Result<RxByte, Error<H::SerError>> {
        self.hal.recv_byte().await
    }

    /// Send a frame and wait for transmit complete on every driven group.
    pub(crate) async fn send_frame(
        &mut self,
        path: TxPath,
        data: &[u8],
    ) -> Result<(), Error<H::SerError>> {
        self.hal.send_frame(path, data).await
    }
}
