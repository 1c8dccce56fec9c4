//! End-to-end bus scenarios: a scripted master (and the odd scripted
//! child) drives a real `Module` over the simulated bus and asserts on the
//! exact bytes the module puts on the wire.

use std::future::Future;
use std::pin::pin;

use embassy_time::{with_timeout, Duration};
use futures::executor::block_on;
use futures::future::{select, Either};

use revolute_comms::frame::{Frame, FrameKind};
use revolute_comms::port::{ChildPort, Role};
use revolute_comms::servo::checksum;
use revolute_comms::{BusAttach, Module, TxPath, BROADCAST_ID, DEFAULT_ID, MASTER_ID};
use revolute_sim::{rig, Master, SimHal, SimServo};

const DEADLINE: Duration = Duration::from_secs(5);

/// Race the module's run loop against a test script; the script must win.
/// Returns the module so its final state can be inspected.
fn run_scenario<F, Fut>(servo: SimServo, script: F) -> Module<SimHal>
where
    F: FnOnce(Master) -> Fut,
    Fut: Future<Output = ()>,
{
    let (hal, master) = rig(servo);
    let mut module = Module::new(hal);
    block_on(async {
        let run = pin!(module.run());
        let script = pin!(with_timeout(DEADLINE, script(master)));
        match select(run, script).await {
            Either::Left((res, _)) => panic!("module stopped early: {res:?}"),
            Either::Right((outcome, _)) => outcome.expect("scenario deadline elapsed"),
        }
    });
    module
}

fn master_frame(kind: FrameKind, dst: u8, param: u8) -> [u8; 8] {
    Frame {
        src: MASTER_ID,
        dst,
        kind,
        param,
    }
    .encode()
}

/// Consume the boot-time servo coupling traffic: the phase A broadcast
/// ping and the phase B status-return read.
async fn boot(master: &Master) {
    assert_eq!(master.reply().await.path, TxPath::Servo);
    assert_eq!(master.reply().await.path, TxPath::Servo);
    master.until_waiting().await;
}

/// Walk a freshly booted module to a configured state with the given ID.
/// Assumes the servo's ID differs, so the assignment drags the servo along
/// (EEPROM write plus confirming ping).
async fn configure(master: &Master, id: u8) {
    boot(master).await;
    master.send(&master_frame(FrameKind::IdAssign, DEFAULT_ID, id));
    let ok = master.reply().await;
    assert_eq!(ok.path, TxPath::AllPorts);
    assert_eq!(ok.bytes[4], u8::from(FrameKind::IdAssignOk));
    assert_eq!(master.reply().await.path, TxPath::Servo);
    assert_eq!(master.reply().await.path, TxPath::Servo);
    master.until_waiting().await;
}

#[test]
fn boot_couples_to_the_servo() {
    let module = run_scenario(SimServo::new(7, 1), |master| async move {
        let ping = master.reply().await;
        assert_eq!(ping.path, TxPath::Servo);
        assert_eq!(ping.bytes, vec![255, 255, 254, 2, 1, checksum(254, 2, 1, 0, 0)]);

        let read = master.reply().await;
        assert_eq!(read.path, TxPath::Servo);
        assert_eq!(read.bytes, vec![255, 255, 7, 4, 2, 16, 1, checksum(7, 4, 2, 16, 1)]);

        master.until_waiting().await;
        let panel = master.panel();
        assert_eq!(panel.loaded, Some(Role::Wait));
        assert!(!panel.led);
        assert_eq!(panel.attach, BusAttach::UpstreamOnly);
    });
    assert_eq!(module.servo_id(), 7);
    assert!(!module.configured());
}

#[test]
fn fresh_slave_answers_hello() {
    let module = run_scenario(SimServo::new(1, 1), |master| async move {
        boot(&master).await;

        master.send(&master_frame(FrameKind::Hello, BROADCAST_ID, 0));
        let reply = master.reply().await;
        assert_eq!(reply.path, TxPath::AllPorts);
        assert_eq!(
            reply.bytes,
            vec![0xF8, 0xF8, 0xFB, 0x00, 0xC8, 0x00, 0x55, 0x55]
        );
        master.until_waiting().await;
    });
    assert_eq!(module.id(), DEFAULT_ID);
    assert!(!module.configured());
}

#[test]
fn assignment_is_accepted_and_acknowledged() {
    let module = run_scenario(SimServo::new(1, 1), |master| async move {
        boot(&master).await;

        master.send(&master_frame(FrameKind::IdAssign, DEFAULT_ID, 5));
        let ok = master.reply().await;
        assert_eq!(ok.path, TxPath::AllPorts);
        assert_eq!(ok.bytes, vec![0xF8, 0xF8, 0x05, 0x00, 0xCA, 0x00, 0x55, 0x55]);

        // The assignment drags the servo along.
        assert_eq!(master.reply().await.path, TxPath::Servo);
        assert_eq!(master.reply().await.path, TxPath::Servo);
        master.until_waiting().await;

        let panel = master.panel();
        assert!(panel.led);
        assert_eq!(panel.attach, BusAttach::AllPorts);
        assert_eq!(panel.servo_display, Some(5));
        assert_eq!(master.servo().id, 5);
    });
    assert_eq!(module.id(), 5);
    assert!(module.configured());
    assert_eq!(module.servo_id(), 5);
}

#[test]
fn ping_to_self_is_answered() {
    let module = run_scenario(SimServo::new(1, 1), |master| async move {
        configure(&master, 5).await;

        master.send(&master_frame(FrameKind::Ping, 5, 0));
        let reply = master.reply().await;
        assert_eq!(reply.path, TxPath::AllPorts);
        assert_eq!(
            reply.bytes,
            vec![0xF8, 0xF8, 0x05, 0x00, 0xCB, 0x00, 0x55, 0x55]
        );
        master.until_waiting().await;
    });
    assert_eq!(module.id(), 5);
}

#[test]
fn hello_with_quiet_ports_forwards_nothing() {
    let module = run_scenario(SimServo::new(1, 1), |master| async move {
        configure(&master, 5).await;

        master.send(&master_frame(FrameKind::Hello, BROADCAST_ID, 0));
        master.until_role(Role::HelloListen).await;
        master.until_waiting().await;
        assert!(master.try_reply().is_none());
    });
    assert_eq!(module.child(), None);
}

#[test]
fn downstream_hello_is_adopted_and_forwarded() {
    let module = run_scenario(SimServo::new(1, 1), |master| async move {
        configure(&master, 5).await;

        master.send(&master_frame(FrameKind::Hello, BROADCAST_ID, 0));
        master.until_role(Role::HelloListen).await;
        master.child_says(ChildPort::A, &[0xF8]);

        let forwarded = master.reply().await;
        assert_eq!(forwarded.path, TxPath::AllPorts);
        assert_eq!(
            forwarded.bytes,
            vec![0xF8, 0xF8, 0x05, 0x00, 0xC8, 0x41, 0x55, 0x55]
        );
        master.until_waiting().await;
    });
    assert_eq!(module.child(), Some(ChildPort::A));
}

#[test]
fn ping_for_the_subtree_listens_without_transmitting() {
    let module = run_scenario(SimServo::new(1, 1), |master| async move {
        configure(&master, 5).await;

        // Adopt a child on port A first.
        master.send(&master_frame(FrameKind::Hello, BROADCAST_ID, 0));
        master.until_role(Role::HelloListen).await;
        master.child_says(ChildPort::A, &[0xF8]);
        let _forwarded = master.reply().await;
        master.until_waiting().await;

        // Ping something below us: we listen toward the child, we do not
        // speak. The child's own reply propagates on the shared bus.
        master.send(&master_frame(FrameKind::Ping, 7, 0));
        master.until_role(Role::ChildReply(ChildPort::A)).await;
        assert!(master.try_reply().is_none());
        master.child_says(ChildPort::A, &[0x55]);
        master.until_waiting().await;
        assert!(master.try_reply().is_none());
    });
    assert_eq!(module.id(), 5);
    assert_eq!(module.child(), Some(ChildPort::A));
}

#[test]
fn broadcast_clear_is_silent_and_resets() {
    let module = run_scenario(SimServo::new(1, 1), |master| async move {
        configure(&master, 5).await;

        master.send(&master_frame(FrameKind::ClearConfig, BROADCAST_ID, 0));
        master.until(|p| !p.led).await;
        assert!(master.try_reply().is_none());
        // The servo keeps the rewritten ID.
        assert_eq!(master.servo().id, 5);
    });
    assert_eq!(module.id(), DEFAULT_ID);
    assert!(!module.configured());
    assert_eq!(module.child(), None);
    assert_eq!(module.servo_id(), 5);
}

#[test]
fn directed_clear_is_acknowledged_first() {
    let module = run_scenario(SimServo::new(1, 1), |master| async move {
        configure(&master, 5).await;

        master.send(&master_frame(FrameKind::ClearConfig, 5, 0));
        let ack = master.reply().await;
        assert_eq!(ack.path, TxPath::AllPorts);
        assert_eq!(
            ack.bytes,
            vec![0xF8, 0xF8, 0x05, 0x00, 0xCD, 0x00, 0x55, 0x55]
        );
        master.until(|p| !p.led).await;
    });
    assert_eq!(module.id(), DEFAULT_ID);
    assert!(!module.configured());
}

#[test]
fn servo_re_id_rewrites_the_eeprom() {
    let module = run_scenario(SimServo::new(1, 1), |master| async move {
        boot(&master).await;

        master.send(&master_frame(FrameKind::IdAssign, DEFAULT_ID, 3));
        let _ok = master.reply().await;

        let write = master.reply().await;
        assert_eq!(write.path, TxPath::Servo);
        assert_eq!(write.bytes, vec![255, 255, 1, 4, 3, 3, 3, 241]);

        let ping = master.reply().await;
        assert_eq!(ping.path, TxPath::Servo);
        assert_eq!(ping.bytes, vec![255, 255, 254, 2, 1, checksum(254, 2, 1, 0, 0)]);

        master.until_waiting().await;
        assert_eq!(master.servo().id, 3);
    });
    assert_eq!(module.servo_id(), 3);
    assert_eq!(module.id(), 3);
}

#[test]
fn reader_recovers_from_a_lone_start_byte() {
    let module = run_scenario(SimServo::new(1, 1), |master| async move {
        configure(&master, 5).await;

        // A start byte followed by junk is discarded without desyncing the
        // reader; the ping behind it still gets through.
        master.send(&[0xF8, 0x12]);
        master.send(&master_frame(FrameKind::Ping, 5, 0));
        let reply = master.reply().await;
        assert_eq!(
            reply.bytes,
            vec![0xF8, 0xF8, 0x05, 0x00, 0xCB, 0x00, 0x55, 0x55]
        );
        master.until_waiting().await;
    });
    assert_eq!(module.id(), 5);
}
