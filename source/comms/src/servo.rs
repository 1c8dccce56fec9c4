//! Servo coupling
//!
//! Each module carries one vendor smart servo on a secondary bus. The
//! vendor protocol is a checksummed binary format:
//!
//! ```text
//! 0xFF 0xFF | ID | LEN | INSTR | [ADDR] | [VAL] | CHECKSUM
//! ```
//!
//! with `CHECKSUM = 255 - ((ID + LEN + INSTR + ADDR + VAL) % 256)`. PING
//! and RESET carry no address or value and are six bytes; READ and WRITE
//! are eight.
//!
//! The coupling procedure runs before anything else at boot: discover the
//! servo's factory ID by broadcast ping, then verify its status-return
//! level. After the master assigns the module an ID, the servo's EEPROM is
//! rewritten so the servo answers on the module's logical ID. All three
//! procedures retry without an outer bound; a module without a working
//! servo does not take part in the bus.

use embassy_time::with_timeout;
use heapless::Vec;

use crate::module::Module;
use crate::port::{Role, SERVO_REPLY_TIMEOUT};
use crate::{Error, Hal, TxPath, BROADCAST_ID};

/// Start byte of a servo frame, sent twice.
pub const SERVO_START: u8 = 255;

/// Sentinel meaning "no servo discovered yet".
pub const SERVO_ID_UNKNOWN: u8 = 255;

/// The highest ID the vendor servo can hold.
pub const SERVO_ID_MAX: u8 = 253;

/// EEPROM address of the servo's ID.
pub const ID_ADDRESS: u8 = 3;

/// EEPROM address of the servo's status-return level.
pub const STATUS_RET_ADDRESS: u8 = 16;

/// How many times one coupling round talks to the servo before falling
/// back to the outer loop.
pub const SERVO_COMM_ATTEMPTS: usize = 10;

/// How chatty the servo is about command status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[repr(u8)]
pub enum StatusReturnLevel {
    /// Reply to PING only.
    Never = 0,
    /// Reply to READ only.
    ReadOnly = 1,
    /// Reply to every command.
    All = 2,
}

/// The status-return level every servo is pinned to. [`StatusReturnLevel::ReadOnly`]
/// keeps the secondary bus quiet during WRITEs while still answering the
/// coupling READs.
pub const STATUS_RET_LEVEL: StatusReturnLevel = StatusReturnLevel::ReadOnly;

/// Servo instruction codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[repr(u8)]
pub enum ServoInstruction {
    /// Probe for a servo; a broadcast ping finds the one attached servo.
    Ping = 1,
    /// Read from the control table.
    Read = 2,
    /// Write to the control table.
    Write = 3,
    /// Reset the servo's EEPROM to factory defaults.
    Reset = 6,
}

impl ServoInstruction {
    /// The vendor length field for this instruction.
    pub const fn length(self) -> u8 {
        match self {
            ServoInstruction::Ping | ServoInstruction::Reset => 2,
            ServoInstruction::Read | ServoInstruction::Write => 4,
        }
    }
}

/// The vendor checksum: ones' complement of the byte sum of everything
/// between the start bytes and the checksum itself.
pub fn checksum(id: u8, len: u8, instr: u8, addr: u8, value: u8) -> u8 {
    let total = id as u16 + len as u16 + instr as u16 + addr as u16 + value as u16;
    (255 - (total % 256)) as u8
}

/// One command bound for the servo bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct ServoCommand {
    /// Servo ID, or [`BROADCAST_ID`].
    pub id: u8,
    /// What the servo should do.
    pub instruction: ServoInstruction,
    /// Control-table address; zero for PING and RESET.
    pub addr: u8,
    /// Value to write, or byte count to read; zero for PING and RESET.
    pub value: u8,
}

impl ServoCommand {
    /// A ping, usually broadcast.
    pub fn ping(id: u8) -> Self {
        Self {
            id,
            instruction: ServoInstruction::Ping,
            addr: 0,
            value: 0,
        }
    }

    /// Read `count` bytes starting at `addr`.
    pub fn read(id: u8, addr: u8, count: u8) -> Self {
        Self {
            id,
            instruction: ServoInstruction::Read,
            addr,
            value: count,
        }
    }

    /// Write `value` at `addr`.
    pub fn write(id: u8, addr: u8, value: u8) -> Self {
        Self {
            id,
            instruction: ServoInstruction::Write,
            addr,
            value,
        }
    }

    /// A factory reset. Only used by the optional recovery path.
    pub fn reset(id: u8) -> Self {
        Self {
            id,
            instruction: ServoInstruction::Reset,
            addr: 0,
            value: 0,
        }
    }

    /// Lay the command out on the wire.
    pub fn encode(&self) -> Vec<u8, 8> {
        let len = self.instruction.length();
        let instr = self.instruction as u8;
        let sum = checksum(self.id, len, instr, self.addr, self.value);

        let mut out = Vec::new();
        // Capacity is sized for the longest command; these cannot fail.
        let _ = out.extend_from_slice(&[SERVO_START, SERVO_START, self.id, len, instr]);
        if len == 4 {
            let _ = out.extend_from_slice(&[self.addr, self.value]);
        }
        let _ = out.push(sum);
        out
    }
}

/// A status frame heard from the servo, trailing checksum not validated.
///
/// The reader consumes exactly four bytes after the start sequence. For
/// replies that carry no parameter (a ping status) the fourth byte is the
/// frame's checksum; it lands in `param` and is ignored by every caller
/// that looks at ping replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct ServoStatus {
    /// The replying servo's ID.
    pub src: u8,
    /// The vendor length field.
    pub len: u8,
    /// The servo's error byte; non-zero replies are treated as silence.
    pub error: u8,
    /// The first returned byte, where the reply carries one.
    pub param: u8,
}

/// Read the next servo status frame from the current receive lane.
///
/// Same scanning discipline as the module-frame reader: two consecutive
/// start bytes commit the reader to four payload bytes. Never returns on a
/// quiet bus; callers wrap this in the servo reply timeout.
pub(crate) async fn read_status<H: Hal>(hal: &mut H) -> Result<ServoStatus, Error<H::SerError>> {
    loop {
        if hal.recv_byte().await?.byte != SERVO_START {
            continue;
        }
        if hal.recv_byte().await?.byte != SERVO_START {
            continue;
        }
        let mut payload = [0u8; 4];
        for slot in payload.iter_mut() {
            *slot = hal.recv_byte().await?.byte;
        }
        return Ok(ServoStatus {
            src: payload[0],
            len: payload[1],
            error: payload[2],
            param: payload[3],
        });
    }
}

impl<H: Hal> Module<H> {
    /// Couple to the attached servo. Runs at boot, before the module takes
    /// any part in the bus, and blocks until both phases succeed.
    ///
    /// Phase A broadcasts pings until some servo with a valid ID answers.
    /// Phase B reads the servo's status-return level until it matches
    /// [`STATUS_RET_LEVEL`]. Both phases retry forever; the per-round
    /// attempt budget only paces the optional recovery actions.
    pub(crate) async fn find_servo(&mut self) -> Result<(), Error<H::SerError>> {
        #[cfg(feature = "servo-recovery")]
        let mut reset_sent = false;

        while self.servo_id == SERVO_ID_UNKNOWN {
            for _ in 0..SERVO_COMM_ATTEMPTS {
                self.servo_instruction(ServoCommand::ping(BROADCAST_ID)).await?;
                if let Some(status) = self.await_status().await? {
                    if status.src <= SERVO_ID_MAX {
                        rev_info!("servo found with id {=u8}", status.src);
                        self.servo_id = status.src;
                        break;
                    }
                }
            }

            #[cfg(feature = "servo-recovery")]
            if self.servo_id == SERVO_ID_UNKNOWN && !reset_sent {
                // One reset per power cycle, to widen the servo's response
                // window back to the factory default delay.
                reset_sent = true;
                self.servo_instruction(ServoCommand::reset(BROADCAST_ID)).await?;
            }
        }

        let desired = STATUS_RET_LEVEL as u8;
        let mut level = None;
        while level != Some(desired) {
            for _ in 0..SERVO_COMM_ATTEMPTS {
                self.servo_instruction(ServoCommand::read(self.servo_id, STATUS_RET_ADDRESS, 1))
                    .await?;
                if let Some(status) = self.await_status().await? {
                    if status.param == desired {
                        level = Some(status.param);
                        break;
                    }
                }
            }

            #[cfg(feature = "servo-recovery")]
            if level != Some(desired) {
                self.servo_instruction(ServoCommand::write(
                    self.servo_id,
                    STATUS_RET_ADDRESS,
                    desired,
                ))
                .await?;
            }
        }

        Ok(())
    }

    /// Rewrite the servo's EEPROM ID to match our assigned ID, then confirm
    /// by broadcast ping until the servo answers on the new ID. Invoked
    /// after every accepted assignment whose ID differs from the servo's.
    pub(crate) async fn match_servo_id(&mut self) -> Result<(), Error<H::SerError>> {
        while self.id != self.servo_id {
            self.servo_instruction(ServoCommand::write(self.servo_id, ID_ADDRESS, self.id))
                .await?;

            for _ in 0..SERVO_COMM_ATTEMPTS {
                self.servo_instruction(ServoCommand::ping(BROADCAST_ID)).await?;
                if let Some(status) = self.await_status().await? {
                    if status.src == self.id {
                        rev_info!("servo re-identified as {=u8}", self.id);
                        self.servo_id = self.id;
                        break;
                    }
                }
            }
        }
        self.enter(Role::Wait).await;
        Ok(())
    }

    /// Emit one command on the servo path, then move to the servo-init role
    /// to hear the reply. The children are off the bus for the duration of
    /// the send, so the subtree never sees servo traffic.
    async fn servo_instruction(&mut self, cmd: ServoCommand) -> Result<(), Error<H::SerError>> {
        self.enter(Role::MyResponse).await;
        let bytes = cmd.encode();
        self.port.send_frame(TxPath::Servo, &bytes).await?;
        self.enter(Role::ServoInit).await;
        Ok(())
    }

    /// One bounded listen for a healthy status frame. `None` on timeout;
    /// error-flagged replies do not end the listen early.
    async fn await_status(&mut self) -> Result<Option<ServoStatus>, Error<H::SerError>> {
        match with_timeout(SERVO_REPLY_TIMEOUT, self.healthy_status()).await {
            Ok(Ok(status)) => Ok(Some(status)),
            Ok(Err(e)) => Err(e),
            Err(_timeout) => Ok(None),
        }
    }

    async fn healthy_status(&mut self) -> Result<ServoStatus, Error<H::SerError>> {
        loop {
            let status = read_status(self.port.hal_mut()).await?;
            if status.error == 0 {
                return Ok(status);
            }
            rev_warn!("servo error status {=u8}", status.error);
        }
    }
}
