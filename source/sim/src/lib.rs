//! Host-side simulation of the revolute module's hardware surface.
//!
//! Implements [`Hal`] over in-memory byte lanes so the module state machine
//! can be driven end to end on a development machine: one upstream lane
//! (master and servo traffic), four child-port lanes, and an outbound
//! record channel carrying everything the module transmits. A small servo
//! model answers servo-path traffic the way the vendor hardware would,
//! including EEPROM ID rewrites.
//!
//! The receive path mirrors the real firmware's discipline: which lanes are
//! polled depends entirely on the loaded role, the child ports are probed
//! in order during hello-listen, and a quiesce drains every inbound lane.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Timer};

use revolute_comms::port::{ChildPort, Role};
use revolute_comms::servo::{checksum, ID_ADDRESS, SERVO_START, STATUS_RET_ADDRESS};
use revolute_comms::{BusAttach, Error, Hal, Lane, RxByte, TxPath, BROADCAST_ID};

type ByteLane = &'static Channel<CriticalSectionRawMutex, u8, 256>;
type TxLane = &'static Channel<CriticalSectionRawMutex, TxRecord, 32>;

/// How often the simulated receivers poll their lanes.
const POLL_TICK: Duration = Duration::from_micros(50);

/// One transmission the module made, as recorded for the test script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    /// Which transmitter group(s) were driven.
    pub path: TxPath,
    /// The raw bytes, start/end framing included.
    pub bytes: Vec<u8>,
}

/// The externally observable pin state of the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Panel {
    /// The peripheral layout currently loaded, if any.
    pub loaded: Option<Role>,
    /// The configured-indicator LED.
    pub led: bool,
    /// What the servo-ID indicator shows. Only IDs 1..=6 have a pattern;
    /// anything else leaves the previous value.
    pub servo_display: Option<u8>,
    /// Which pins are attached to the global bus.
    pub attach: BusAttach,
}

/// A model of the attached vendor servo.
///
/// Applies WRITEs to its "EEPROM" and produces protocol-correct status
/// frames. Pings are always answered; READs only from status-return level
/// 1 up; WRITEs are acknowledged only at level 2 and never for broadcasts.
#[derive(Debug, Clone)]
pub struct SimServo {
    /// The servo's current ID.
    pub id: u8,
    /// The servo's status-return level.
    pub status_return: u8,
    /// The error byte stamped on every reply.
    pub error: u8,
}

impl SimServo {
    /// A healthy servo with the given ID and status-return level.
    pub fn new(id: u8, status_return: u8) -> Self {
        Self {
            id,
            status_return,
            error: 0,
        }
    }

    /// Decode one command and produce the reply the hardware would.
    fn handle(&mut self, bytes: &[u8]) -> Option<Vec<u8>> {
        if bytes.len() < 6 || bytes[0] != SERVO_START || bytes[1] != SERVO_START {
            return None;
        }
        let id = bytes[2];
        let instr = bytes[4];
        if id != self.id && id != BROADCAST_ID {
            return None;
        }
        match instr {
            // PING: answered at every status-return level.
            1 => Some(self.status(None)),
            // READ: one byte out of the control table.
            2 if bytes.len() >= 8 => {
                let value = match bytes[5] {
                    ID_ADDRESS => self.id,
                    STATUS_RET_ADDRESS => self.status_return,
                    _ => 0,
                };
                (self.status_return >= 1).then(|| self.status(Some(value)))
            }
            // WRITE: applied to the EEPROM; acked only at level 2, and
            // never for a broadcast.
            3 if bytes.len() >= 8 => {
                let value = bytes[6];
                match bytes[5] {
                    ID_ADDRESS => self.id = value,
                    STATUS_RET_ADDRESS => self.status_return = value,
                    _ => {}
                }
                (self.status_return >= 2 && id != BROADCAST_ID).then(|| self.status(None))
            }
            // RESET: back to factory defaults.
            6 => {
                self.id = 1;
                self.status_return = 2;
                None
            }
            _ => None,
        }
    }

    fn status(&self, value: Option<u8>) -> Vec<u8> {
        match value {
            None => {
                let c = checksum(self.id, 2, self.error, 0, 0);
                vec![SERVO_START, SERVO_START, self.id, 2, self.error, c]
            }
            Some(v) => {
                let c = checksum(self.id, 3, self.error, v, 0);
                vec![SERVO_START, SERVO_START, self.id, 3, self.error, v, c]
            }
        }
    }
}

/// The module-side half of the rig: a [`Hal`] over the in-memory lanes.
pub struct SimHal {
    upstream: ByteLane,
    children: [ByteLane; 4],
    tx: TxLane,
    loaded: Option<Role>,
    panel: Arc<Mutex<Panel>>,
    servo: Arc<Mutex<SimServo>>,
    pending_servo_reply: Option<Vec<u8>>,
}

impl SimHal {
    fn child_lane(&self, port: ChildPort) -> ByteLane {
        self.children[port as usize]
    }

    fn set_loaded(&mut self, loaded: Option<Role>) {
        self.loaded = loaded;
        self.panel.lock().unwrap().loaded = loaded;
    }
}

impl Hal for SimHal {
    type SerError = Infallible;

    fn quiesce(&mut self) {
        while self.upstream.try_receive().is_ok() {}
        for lane in self.children {
            while lane.try_receive().is_ok() {}
        }
    }

    fn unload(&mut self, _role: Role) {
        self.set_loaded(None);
    }

    fn unload_all(&mut self) {
        self.set_loaded(None);
    }

    fn load(&mut self, role: Role) {
        self.set_loaded(Some(role));
        // The vendor return delay lands after the module has entered the
        // listen role; deliver any pending servo reply now.
        if role == Role::ServoInit {
            if let Some(bytes) = self.pending_servo_reply.take() {
                for b in bytes {
                    let _ = self.upstream.try_send(b);
                }
            }
        }
    }

    fn attach_bus(&mut self, attach: BusAttach) {
        self.panel.lock().unwrap().attach = attach;
    }

    fn set_configured_led(&mut self, on: bool) {
        self.panel.lock().unwrap().led = on;
    }

    fn show_servo_id(&mut self, id: u8) {
        if (1..=6).contains(&id) {
            self.panel.lock().unwrap().servo_display = Some(id);
        }
    }

    async fn recv_byte(&mut self) -> Result<RxByte, Error<Infallible>> {
        loop {
            match self.loaded {
                Some(Role::Wait) | Some(Role::ServoInit) => {
                    if let Ok(byte) = self.upstream.try_receive() {
                        return Ok(RxByte {
                            lane: Lane::Upstream,
                            byte,
                        });
                    }
                }
                Some(Role::HelloListen) => {
                    for port in ChildPort::ALL {
                        if let Ok(byte) = self.child_lane(port).try_receive() {
                            return Ok(RxByte {
                                lane: Lane::Child(port),
                                byte,
                            });
                        }
                    }
                }
                Some(Role::ChildReply(port)) => {
                    if let Ok(byte) = self.child_lane(port).try_receive() {
                        return Ok(RxByte {
                            lane: Lane::Child(port),
                            byte,
                        });
                    }
                }
                // No receiver runs in these states.
                Some(Role::MyResponse) | None => {}
            }
            Timer::after(POLL_TICK).await;
        }
    }

    async fn send_frame(&mut self, path: TxPath, data: &[u8]) -> Result<(), Error<Infallible>> {
        if path == TxPath::Servo {
            let reply = self.servo.lock().unwrap().handle(data);
            if let Some(bytes) = reply {
                self.pending_servo_reply = Some(bytes);
            }
        }
        self.tx
            .send(TxRecord {
                path,
                bytes: data.to_vec(),
            })
            .await;
        Ok(())
    }
}

/// The script-side half of the rig: injects master and child traffic,
/// observes the module's transmissions and pins.
pub struct Master {
    upstream: ByteLane,
    children: [ByteLane; 4],
    tx: TxLane,
    panel: Arc<Mutex<Panel>>,
    servo: Arc<Mutex<SimServo>>,
}

impl Master {
    /// Put raw bytes on the upstream lane, as the master would.
    pub fn send(&self, bytes: &[u8]) {
        for &b in bytes {
            self.upstream.try_send(b).expect("upstream lane full");
        }
    }

    /// Put raw bytes on one child-port lane, as a downstream module would.
    pub fn child_says(&self, port: ChildPort, bytes: &[u8]) {
        for &b in bytes {
            self.children[port as usize]
                .try_send(b)
                .expect("child lane full");
        }
    }

    /// Wait for the module's next transmission.
    pub async fn reply(&self) -> TxRecord {
        self.tx.receive().await
    }

    /// The module's next transmission, if one has already happened.
    pub fn try_reply(&self) -> Option<TxRecord> {
        self.tx.try_receive().ok()
    }

    /// Snapshot of the module's pin state.
    pub fn panel(&self) -> Panel {
        *self.panel.lock().unwrap()
    }

    /// Snapshot of the servo model.
    pub fn servo(&self) -> SimServo {
        self.servo.lock().unwrap().clone()
    }

    /// Wait until the panel satisfies `cond`.
    pub async fn until(&self, cond: impl Fn(&Panel) -> bool) {
        loop {
            if cond(&self.panel()) {
                return;
            }
            Timer::after(POLL_TICK).await;
        }
    }

    /// Wait until the given role is the loaded one.
    pub async fn until_role(&self, role: Role) {
        self.until(|p| p.loaded == Some(role)).await;
    }

    /// Wait until the module is back in the wait role.
    pub async fn until_waiting(&self) {
        self.until_role(Role::Wait).await;
    }
}

/// Build a connected [`SimHal`]/[`Master`] pair around one servo model.
pub fn rig(servo: SimServo) -> (SimHal, Master) {
    fn byte_lane() -> ByteLane {
        Box::leak(Box::new(Channel::new()))
    }

    let upstream = byte_lane();
    let children = [byte_lane(), byte_lane(), byte_lane(), byte_lane()];
    let tx: TxLane = Box::leak(Box::new(Channel::new()));
    let panel = Arc::new(Mutex::new(Panel {
        loaded: None,
        led: false,
        servo_display: None,
        attach: BusAttach::UpstreamOnly,
    }));
    let servo = Arc::new(Mutex::new(servo));

    (
        SimHal {
            upstream,
            children,
            tx,
            loaded: None,
            panel: Arc::clone(&panel),
            servo: Arc::clone(&servo),
            pending_servo_reply: None,
        },
        Master {
            upstream,
            children,
            tx,
            panel,
            servo,
        },
    )
}
