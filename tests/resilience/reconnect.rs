use std::sync::{Arc, Mutex};
use std::time::Duration;

use resilient_amqp::mock::MockBroker;
use resilient_amqp::{Connection, ConnectionConfig, ConnectionState, ReconnectPolicy};

use super::{gaps, init_tracing, secs, settle};

#[tokio::test(start_paused = true)]
async fn failed_dials_back_off_exponentially_up_to_cap() {
    init_tracing();
    let broker = MockBroker::new();
    broker.fail_dials(6);

    let connection = Connection::dial(broker.connector());
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(broker.dial_count(), 7);
    assert_eq!(gaps(&broker.dial_times()), secs(&[1, 2, 4, 8, 10, 10]));
    assert!(connection.is_connected());
    connection.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn successful_connect_resets_backoff() {
    let broker = MockBroker::new();
    broker.fail_dials(3);
    let connection = Connection::dial(broker.connector());

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(connection.is_connected());
    assert_eq!(connection.attempts(), 0);

    // the redial after a lost session is immediate; the next failure streak
    // starts again from the first delay
    broker.fail_dials(2);
    assert!(broker.sever());
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(
        gaps(&broker.dial_times()),
        secs(&[1, 2, 4, 13, 1, 2])
    );
    assert!(connection.is_connected());
    connection.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn attempts_count_consecutive_failures() {
    let broker = MockBroker::new();
    broker.fail_dials(3);
    let connection = Connection::dial(broker.connector());
    settle().await;

    assert_eq!(connection.state(), ConnectionState::Connecting);
    assert_eq!(connection.attempts(), 1);

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(connection.attempts(), 3);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(connection.attempts(), 0);
    assert_eq!(connection.state(), ConnectionState::Connected);
    connection.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn fixed_policy_drives_delays() {
    let broker = MockBroker::new();
    broker.fail_dials(3);
    let config = ConnectionConfig::builder()
        .policy(ReconnectPolicy::fixed(Duration::from_millis(250)))
        .build();

    let connection = Connection::dial_with_config(broker.connector(), config);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(
        gaps(&broker.dial_times()),
        vec![Duration::from_millis(250); 3]
    );
    connection.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn lifecycle_callbacks_fire_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (failed, connected, lost, bound) = (log.clone(), log.clone(), log.clone(), log.clone());
    let config = ConnectionConfig::builder()
        .name("orders")
        .on_connect_failed(move |attempt, delay, _| {
            failed
                .lock()
                .unwrap()
                .push(format!("failed #{attempt} retry in {}s", delay.as_secs()));
        })
        .on_connected(move |channels| {
            connected
                .lock()
                .unwrap()
                .push(format!("connected with {channels} channels"));
        })
        .on_disconnected(move |error| {
            lost.lock()
                .unwrap()
                .push(format!("lost, error: {}", error.is_some()));
        })
        .on_channel_bound(move |id, replayed| {
            bound
                .lock()
                .unwrap()
                .push(format!("channel {id} replayed {replayed}"));
        })
        .build();

    let broker = MockBroker::new();
    broker.fail_dials(2);
    let connection = Connection::dial_with_config(broker.connector(), config);
    let channel = connection.channel().await;
    channel
        .declare_exchange(resilient_amqp::ExchangeDeclareSpec::new("orders"))
        .await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    broker.sever();
    settle().await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "failed #1 retry in 1s",
            "failed #2 retry in 2s",
            "connected with 1 channels",
            "channel 0 replayed 1",
            "lost, error: true",
            "connected with 1 channels",
            "channel 0 replayed 1",
        ]
    );
    connection.close().await.unwrap();
}
