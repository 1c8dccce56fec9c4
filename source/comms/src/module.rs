//! Discovery and routing state machine
//!
//! The top-level loop of the module: read one frame in the wait role,
//! decide what it means for us, act. Deciding is a pure function over the
//! frame and our three routing scalars (ID, configured, known child), so it
//! can be tested row by row; acting is where the role switches and
//! transmissions happen.

use core::convert::Infallible;

use embassy_time::with_timeout;

use crate::frame::{read_frame, Frame, FrameKind};
use crate::port::{ChildPort, PortController, Role, CHILD_REPLY_TIMEOUT, HELLO_LISTEN_TIMEOUT};
use crate::servo::SERVO_ID_UNKNOWN;
use crate::{
    Error, Hal, Lane, TxPath, BROADCAST_ID, DEFAULT_ID, END_BYTE, MASTER_ID, MAX_ASSIGNED_ID,
    START_BYTE,
};

/// What a received frame asks of this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    /// Announce ourselves to the master.
    SayHello,
    /// Probe the child ports for a downstream hello; forward our own hello
    /// if one is heard.
    ProbeChildren,
    /// Listen on the known child port for the addressed subtree's reply.
    ListenChild,
    /// Answer a ping addressed to us.
    PingReply,
    /// Take the carried ID as our own and acknowledge.
    AcceptAssignment(u8),
    /// Acknowledge a directly-addressed clear, then clear.
    AckAndClear,
    /// Clear without acknowledging (broadcast or upstream reset).
    Clear,
    /// Not ours, not routable: drop it.
    Ignore,
}

/// The decision table, evaluated in order.
///
/// Destination ordering does the routing: a destination above our own ID is
/// below us in the tree and handled by listening toward the child; a
/// destination at or below our ID that clears configuration clears ours
/// too, because downstream IDs were assigned relative to the upstream
/// ordering.
pub(crate) fn route(frame: &Frame, id: u8, configured: bool, has_child: bool) -> Action {
    match frame.kind {
        FrameKind::Hello => {
            if !configured {
                Action::SayHello
            } else if !has_child {
                Action::ProbeChildren
            } else {
                Action::ListenChild
            }
        }
        FrameKind::Ping => {
            if frame.dst == id {
                Action::PingReply
            } else if frame.dst > id {
                Action::ListenChild
            } else {
                Action::Ignore
            }
        }
        FrameKind::IdAssign => {
            if frame.dst == id {
                if frame.param >= 1 && frame.param <= MAX_ASSIGNED_ID {
                    Action::AcceptAssignment(frame.param)
                } else {
                    Action::Ignore
                }
            } else if frame.dst > id {
                Action::ListenChild
            } else {
                Action::Ignore
            }
        }
        FrameKind::ClearConfig => {
            if frame.dst == id {
                Action::AckAndClear
            } else if frame.dst == BROADCAST_ID || frame.dst < id {
                Action::Clear
            } else {
                Action::Ignore
            }
        }
        // Response types only travel upward; hearing one is not for us.
        FrameKind::IdAssignOk | FrameKind::ConfigCleared => Action::Ignore,
    }
}

/// One revolute module.
///
/// Owns the port controller and the module's five scalars. Everything runs
/// on the caller's single task; the only concurrency is the hardware
/// timers behind the timeouts.
pub struct Module<H: Hal> {
    pub(crate) port: PortController<H>,
    pub(crate) id: u8,
    pub(crate) configured: bool,
    pub(crate) child: Option<ChildPort>,
    pub(crate) servo_id: u8,
}

impl<H: Hal> Module<H> {
    /// A factory-fresh module: default ID, unconfigured, no child, servo
    /// unknown.
    pub fn new(hal: H) -> Self {
        Self {
            port: PortController::new(hal),
            id: DEFAULT_ID,
            configured: false,
            child: None,
            servo_id: SERVO_ID_UNKNOWN,
        }
    }

    /// This module's logical ID.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Whether the master has acknowledged this module with an assignment.
    pub fn configured(&self) -> bool {
        self.configured
    }

    /// The port a downstream hello has been heard on, if any.
    pub fn child(&self) -> Option<ChildPort> {
        self.child
    }

    /// The attached servo's ID, or [`SERVO_ID_UNKNOWN`].
    pub fn servo_id(&self) -> u8 {
        self.servo_id
    }

    /// Run the module forever.
    ///
    /// Couples to the servo first (the module refuses to function without
    /// one), then loops interpreting master frames in the wait role. Only
    /// returns if the hardware surface reports a serial error.
    pub async fn run(&mut self) -> Result<Infallible, Error<H::SerError>> {
        self.find_servo().await?;
        self.enter(Role::Wait).await;

        loop {
            let frame = read_frame(self.port.hal_mut()).await?;
            self.take_action(frame).await?;
        }
    }

    pub(crate) async fn enter(&mut self, role: Role) {
        self.port
            .switch_to(role, self.configured, self.servo_id)
            .await;
    }

    async fn take_action(&mut self, frame: Frame) -> Result<(), Error<H::SerError>> {
        match route(&frame, self.id, self.configured, self.child.is_some()) {
            Action::SayHello => self.say_hello().await,
            Action::ProbeChildren => {
                if self.child_listen().await? {
                    self.say_hello().await?;
                }
                Ok(())
            }
            Action::ListenChild => {
                self.child_response().await?;
                Ok(())
            }
            Action::PingReply => self.respond(FrameKind::Ping, 0).await,
            Action::AcceptAssignment(new_id) => {
                self.id = new_id;
                self.configured = true;
                rev_info!("assigned id {=u8}", new_id);
                self.respond(FrameKind::IdAssignOk, 0).await?;
                if self.id != self.servo_id {
                    self.match_servo_id().await?;
                }
                Ok(())
            }
            Action::AckAndClear => {
                self.respond(FrameKind::ConfigCleared, 0).await?;
                self.clear();
                Ok(())
            }
            Action::Clear => {
                self.clear();
                Ok(())
            }
            Action::Ignore => Ok(()),
        }
    }

    /// Announce ourselves to the master. The parameter carries the child
    /// port letter when we are forwarding a downstream hello, zero when the
    /// hello is our own.
    async fn say_hello(&mut self) -> Result<(), Error<H::SerError>> {
        let param = self.child.map(ChildPort::letter).unwrap_or(0);
        self.respond(FrameKind::Hello, param).await
    }

    /// Emit one response frame on both TX groups, then return to wait.
    async fn respond(&mut self, kind: FrameKind, param: u8) -> Result<(), Error<H::SerError>> {
        let frame = Frame {
            src: self.id,
            dst: MASTER_ID,
            kind,
            param,
        };
        self.enter(Role::MyResponse).await;
        self.port.send_frame(TxPath::AllPorts, &frame.encode()).await?;
        self.enter(Role::Wait).await;
        Ok(())
    }

    /// Probe all four child ports for a downstream hello.
    ///
    /// Returns whether a child was heard; the detecting port is recorded so
    /// later traffic for the subtree can be routed there.
    async fn child_listen(&mut self) -> Result<bool, Error<H::SerError>> {
        self.enter(Role::HelloListen).await;
        let heard = with_timeout(HELLO_LISTEN_TIMEOUT, self.hear_hello()).await;
        let result = match heard {
            Ok(Ok(port)) => {
                rev_info!("child heard on port {=u8}", port.letter());
                self.child = Some(port);
                true
            }
            Ok(Err(e)) => return Err(e),
            Err(_timeout) => false,
        };
        self.enter(Role::Wait).await;
        Ok(result)
    }

    async fn hear_hello(&mut self) -> Result<ChildPort, Error<H::SerError>> {
        loop {
            let rx = self.port.recv_byte().await?;
            if rx.byte != START_BYTE {
                continue;
            }
            if let Lane::Child(port) = rx.lane {
                return Ok(port);
            }
        }
    }

    /// Wait for the known child's subtree to finish its reply.
    ///
    /// Only reports that the child responded. The child's transmission
    /// propagates to the master on the shared analog bus by itself during
    /// the settlement period; nothing is relayed here. A port without a
    /// shared bus must relay the frame instead.
    async fn child_response(&mut self) -> Result<bool, Error<H::SerError>> {
        let Some(port) = self.child else {
            return Ok(false);
        };
        self.enter(Role::ChildReply(port)).await;
        let seen = with_timeout(CHILD_REPLY_TIMEOUT, self.hear_end(port)).await;
        let responded = match seen {
            Ok(Ok(())) => true,
            Ok(Err(e)) => return Err(e),
            Err(_timeout) => false,
        };
        self.enter(Role::Wait).await;
        Ok(responded)
    }

    async fn hear_end(&mut self, port: ChildPort) -> Result<(), Error<H::SerError>> {
        loop {
            let rx = self.port.recv_byte().await?;
            if rx.byte == END_BYTE && rx.lane == Lane::Child(port) {
                return Ok(());
            }
        }
    }

    /// Drop the configuration: default ID, unconfigured, no child, LED off.
    /// The servo keeps its rewritten ID; only the next assignment touches
    /// it again.
    fn clear(&mut self) {
        rev_info!("configuration cleared");
        self.id = DEFAULT_ID;
        self.configured = false;
        self.child = None;
        self.port.hal_mut().set_configured_led(false);
    }
}
