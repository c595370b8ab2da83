//! Link recovery: reconnect, calibration wait, intent replay and timeout.

use std::time::Duration;

use tokio::time::Instant;
use wheel_link::mock::{MockOpener, MockRequest, MockWheel, MockWheelConfig};
use wheel_link::protocol::OP_POSITION;
use wheel_link::{
    CommandError, FwState, LinkConfig, LinkHealth, PollResult, Proto, QueuedCommand,
    RecoveryState, Session, SessionEvent,
};

async fn connect(wheel: &MockWheel) -> Session<MockOpener> {
    Session::connect(wheel.opener(), LinkConfig::default())
        .await
        .unwrap()
}

async fn poll_until(
    session: &mut Session<MockOpener>,
    max_polls: usize,
    done: impl Fn(&PollResult) -> bool,
) -> (PollResult, Vec<SessionEvent>) {
    let mut events = Vec::new();
    for _ in 0..max_polls {
        let result = session.poll().await;
        events.extend(result.events.iter().cloned());
        if done(&result) {
            return (result, events);
        }
        tokio::time::sleep(result.next_delay).await;
    }
    panic!("condition not reached after {} polls", max_polls);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_waits_for_calibration_and_adopts_new_slot_count() {
    let wheel = MockWheel::new(MockWheelConfig::only(Proto::Framed, 5));
    let mut session = connect(&wheel).await;

    wheel.set_responsive(false);
    for _ in 0..3 {
        session.poll().await;
    }
    assert_eq!(session.recovery_state(), RecoveryState::InProgress);

    // Controller rebooted with a different wheel fitted
    wheel.set_responsive(true);
    wheel.swap_wheel(6);
    wheel.start_calibration();

    let reconnected = session.poll().await;
    assert_eq!(reconnected.recovery, RecoveryState::WaitCalibration);
    assert_eq!(reconnected.state, FwState::Calibrating);
    assert_eq!(reconnected.health, LinkHealth::Recovering);

    let (result, events) = poll_until(&mut session, 10, |r| r.recovery == RecoveryState::None).await;
    assert_eq!(result.state, FwState::Idle);
    assert_eq!(result.total_slots, 6);
    assert!(events.contains(&SessionEvent::SlotCountChanged { old: 5, new: 6 }));
    assert!(events.contains(&SessionEvent::RecoveryComplete));
    assert_eq!(session.filter_names().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_move_is_replayed_after_replug() {
    let wheel = MockWheel::new(MockWheelConfig::only(Proto::Framed, 5));
    let mut session = connect(&wheel).await;

    session.request_slot(4).await.unwrap();
    wheel.unplug();

    let failed = session.poll().await;
    assert_eq!(failed.recovery, RecoveryState::InProgress);
    assert_eq!(failed.events, vec![SessionEvent::RecoveryStarted]);
    assert_eq!(session.scheduler().queued(), vec![QueuedCommand::MoveToSlot(4)]);

    wheel.replug();
    wheel.clear_requests();

    let (_, events) = poll_until(&mut session, 20, |r| r.recovery == RecoveryState::None).await;
    assert!(events.contains(&SessionEvent::RecoveryComplete));
    assert!(wheel.requests().contains(&MockRequest::Framed {
        cmd: OP_POSITION,
        value: 3
    }));

    let (result, events) = poll_until(&mut session, 10, |r| r.state == FwState::Idle).await;
    assert_eq!(result.current_slot, 4);
    assert_eq!(events, vec![SessionEvent::MoveComplete { slot: 4 }]);
}

#[tokio::test(start_paused = true)]
async fn test_queued_moves_collapse_to_latest_on_failure() {
    let wheel = MockWheel::new(MockWheelConfig::only(Proto::Framed, 5));
    let mut session = connect(&wheel).await;

    // Let the first move finish so nothing is pending when the link drops
    session.request_slot(2).await.unwrap();
    poll_until(&mut session, 10, |r| r.state == FwState::Idle).await;

    session.request_slot(0).await.unwrap();
    session.request_slot(3).await.unwrap();
    session.request_slot(5).await.unwrap();
    assert_eq!(
        session.scheduler().queued(),
        vec![QueuedCommand::MoveToSlot(3), QueuedCommand::MoveToSlot(5)]
    );

    wheel.unplug();
    session.poll().await;
    assert_eq!(session.scheduler().queued(), vec![QueuedCommand::MoveToSlot(5)]);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_gives_up_after_timeout() {
    let wheel = MockWheel::new(MockWheelConfig::only(Proto::Framed, 5));
    let mut session = connect(&wheel).await;

    wheel.unplug();
    let first = session.poll().await;
    assert_eq!(first.recovery, RecoveryState::InProgress);
    let started = Instant::now();

    let (result, events) = poll_until(&mut session, 200, |r| r.health == LinkHealth::Failed).await;
    assert_eq!(started.elapsed(), Duration::from_secs(60));
    assert_eq!(result.recovery, RecoveryState::None);
    assert_eq!(result.state, FwState::Unknown);
    assert!(events.contains(&SessionEvent::RecoveryFailed));
    assert!(session.is_failed());

    let rejected = session.request_slot(2).await;
    assert!(matches!(rejected, Err(CommandError::DeviceFailed)));

    // No further I/O once failed
    wheel.replug();
    let opens = wheel.open_count();
    let again = session.poll().await;
    assert_eq!(again.health, LinkHealth::Failed);
    assert_eq!(wheel.open_count(), opens);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_survives_link_loss_while_waiting_for_calibration() {
    let wheel = MockWheel::new(MockWheelConfig::only(Proto::Framed, 5));
    let mut session = connect(&wheel).await;

    wheel.unplug();
    session.poll().await;
    wheel.replug();

    let reconnected = session.poll().await;
    assert_eq!(reconnected.recovery, RecoveryState::WaitCalibration);

    // Cable pulled again mid-calibration
    wheel.unplug();
    let lost = session.poll().await;
    assert_eq!(lost.recovery, RecoveryState::InProgress);

    wheel.replug();
    let (result, events) = poll_until(&mut session, 20, |r| r.recovery == RecoveryState::None).await;
    assert_eq!(result.health, LinkHealth::Ok);
    assert!(events.contains(&SessionEvent::RecoveryComplete));
    assert_eq!(wheel.open_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_renegotiation_may_change_protocol() {
    let wheel = MockWheel::new(MockWheelConfig::only(Proto::Framed, 5));
    let mut session = connect(&wheel).await;

    wheel.unplug();
    session.poll().await;

    // Firmware reflashed with a text-only build
    wheel.set_protocols(false, false, true);
    wheel.replug();

    let (result, _) = poll_until(&mut session, 20, |r| r.recovery == RecoveryState::None).await;
    assert_eq!(result.health, LinkHealth::Ok);
    assert_eq!(session.info().proto, Proto::Text);
}
