//! Protocol negotiation against simulated firmware.
//!
//! All tests run on paused time; probe timeouts elapse instantly.

use std::time::Duration;

use tokio::time::Instant;
use wheel_link::mock::{MockRequest, MockWheel, MockWheelConfig};
use wheel_link::protocol::{OP_POSITION, OP_SLOTS};
use wheel_link::{ConnectError, FwState, LinkConfig, Proto, Session, SessionEvent};

#[tokio::test(start_paused = true)]
async fn test_framed_preferred_when_all_answer() {
    let wheel = MockWheel::new(MockWheelConfig::default());
    let session = Session::connect(wheel.opener(), LinkConfig::default())
        .await
        .unwrap();

    let info = session.info();
    assert_eq!(info.proto, Proto::Framed);
    assert_eq!(info.total_slots, 5);
    assert_eq!(info.current_slot, 1);

    // Only the framed probe was needed
    assert_eq!(
        wheel.requests()[0],
        MockRequest::Framed {
            cmd: OP_SLOTS,
            value: 0
        }
    );
    assert!(!wheel
        .requests()
        .iter()
        .any(|r| matches!(r, MockRequest::Legacy { .. } | MockRequest::Text(_))));
}

#[tokio::test(start_paused = true)]
async fn test_legacy_only_firmware() {
    let wheel = MockWheel::new(MockWheelConfig::only(Proto::Legacy, 6));
    let mut session = Session::connect(wheel.opener(), LinkConfig::default())
        .await
        .unwrap();

    assert_eq!(session.info().proto, Proto::Legacy);
    assert_eq!(session.info().total_slots, 6);
    assert_eq!(
        wheel.requests()[0],
        MockRequest::Legacy {
            cmd: OP_SLOTS,
            value: 0
        }
    );

    wheel.clear_requests();
    session.request_slot(2).await.unwrap();
    assert_eq!(
        wheel.requests(),
        vec![MockRequest::Legacy {
            cmd: OP_POSITION,
            value: 1
        }]
    );

    // Legacy has no state opcode; 0xFF from a position read means moving
    let moving = session.poll().await;
    assert_eq!(moving.state, FwState::Moving);
    let idle = session.poll().await;
    assert_eq!(idle.state, FwState::Idle);
    assert_eq!(idle.current_slot, 2);
    assert_eq!(idle.events, vec![SessionEvent::MoveComplete { slot: 2 }]);
}

#[tokio::test(start_paused = true)]
async fn test_text_only_firmware() {
    let wheel = MockWheel::new(MockWheelConfig::only(Proto::Text, 4));
    let start = Instant::now();
    let mut session = Session::connect(wheel.opener(), LinkConfig::default())
        .await
        .unwrap();

    assert_eq!(session.info().proto, Proto::Text);
    assert_eq!(session.info().total_slots, 4);
    assert_eq!(wheel.requests()[0], MockRequest::Text("SLOTS".to_string()));

    // Both binary probes had to time out first
    assert!(start.elapsed() >= Duration::from_secs(6));

    wheel.clear_requests();
    session.request_slot(4).await.unwrap();
    assert_eq!(wheel.requests(), vec![MockRequest::Text("POS 3".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn test_no_protocol_answers() {
    let config = MockWheelConfig {
        framed: false,
        legacy: false,
        text: false,
        ..Default::default()
    };
    let wheel = MockWheel::new(config);

    let result = Session::connect(wheel.opener(), LinkConfig::default()).await;
    assert!(matches!(result, Err(ConnectError::Negotiation)));
    assert!(wheel.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unplugged_port_fails_to_open() {
    let wheel = MockWheel::new(MockWheelConfig::default());
    wheel.unplug();

    let result = Session::connect(wheel.opener(), LinkConfig::default()).await;
    assert!(matches!(result, Err(ConnectError::Open(_))));
}

#[tokio::test(start_paused = true)]
async fn test_framed_resyncs_through_debug_noise() {
    let wheel = MockWheel::new(MockWheelConfig::only(Proto::Framed, 5));
    // Debug text, including a stray magic byte with an illegal length
    wheel.set_noise(b"boot ok\r\n\xA5\x30 temp=31C\r\n");

    let mut session = Session::connect(wheel.opener(), LinkConfig::default())
        .await
        .unwrap();
    assert_eq!(session.info().proto, Proto::Framed);
    assert_eq!(session.info().total_slots, 5);

    session.request_slot(5).await.unwrap();
    session.poll().await;
    let idle = session.poll().await;
    assert_eq!(idle.state, FwState::Idle);
    assert_eq!(idle.last_known_slot, 5);
}

#[tokio::test(start_paused = true)]
async fn test_connect_completes_on_chattering_line() {
    let wheel = MockWheel::new(MockWheelConfig::only(Proto::Framed, 5));
    // The line never goes quiet, so the initial drain must give up on its own
    wheel.set_chatter(b"dbg\r\n");

    let mut session = tokio::time::timeout(
        Duration::from_secs(30),
        Session::connect(wheel.opener(), LinkConfig::default()),
    )
    .await
    .expect("connect stalled on a chattering line")
    .unwrap();
    assert_eq!(session.info().proto, Proto::Framed);
    assert_eq!(session.info().total_slots, 5);

    session.request_slot(2).await.unwrap();
    session.poll().await;
    let idle = session.poll().await;
    assert_eq!(idle.state, FwState::Idle);
    assert_eq!(idle.last_known_slot, 2);
}

#[tokio::test(start_paused = true)]
async fn test_upgrade_to_framed_after_interval() {
    let wheel = MockWheel::new(MockWheelConfig::only(Proto::Legacy, 5));
    let mut session = Session::connect(wheel.opener(), LinkConfig::default())
        .await
        .unwrap();
    let connected = Instant::now();
    assert_eq!(session.info().proto, Proto::Legacy);

    // Firmware finishes its boot housekeeping and starts answering framed
    wheel.set_protocols(true, true, false);

    let mut upgraded = None;
    for _ in 0..2000 {
        let result = session.poll().await;
        if result.events.iter().any(|e| matches!(e, SessionEvent::ProtocolUpgraded { .. })) {
            upgraded = Some(result);
            break;
        }
        tokio::time::sleep(result.next_delay).await;
    }

    let result = upgraded.expect("no upgrade within the poll budget");
    assert!(result.events.contains(&SessionEvent::ProtocolUpgraded {
        from: Proto::Legacy,
        to: Proto::Framed
    }));
    assert_eq!(session.info().proto, Proto::Framed);

    let elapsed = connected.elapsed();
    assert!(elapsed >= Duration::from_secs(300), "upgraded after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(301), "upgraded after {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_upgrade_keeps_fallback() {
    let wheel = MockWheel::new(MockWheelConfig::only(Proto::Text, 5));
    let mut session = Session::connect(wheel.opener(), LinkConfig::default())
        .await
        .unwrap();

    let stop = Instant::now() + Duration::from_secs(400);
    while Instant::now() < stop {
        let result = session.poll().await;
        assert!(result.events.is_empty(), "unexpected events {:?}", result.events);
        tokio::time::sleep(result.next_delay).await;
    }

    assert_eq!(session.info().proto, Proto::Text);
    assert_eq!(session.device_state().fw_state, FwState::Idle);
}
