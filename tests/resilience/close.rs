use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use resilient_amqp::mock::{Call, MockBroker};
use resilient_amqp::transport::{Connector, Session};
use resilient_amqp::{
    BrokerError, Connection, ConnectionConfig, ConnectionEvent, ConnectionState, Error,
    FnListener, PublishFlags, Publishing, QueueDeclareSpec,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::settle;

/// A broker that accepts the TCP connection and never answers.
struct SilentBroker {
    dials: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for SilentBroker {
    async fn connect(&self) -> Result<Arc<dyn Session>, BrokerError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn close_twice_is_harmless() {
    let broker = MockBroker::new();
    let connection = Connection::dial_blocking(broker.connector()).await.unwrap();
    let channel = connection.channel().await;

    connection.close().await.unwrap();
    connection.close().await.unwrap();

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(!channel.is_bound());
    assert!(matches!(
        channel
            .publish("", "q", PublishFlags::default(), Publishing::new("x"))
            .await,
        Err(Error::NotConnected)
    ));
    let closes = broker
        .calls()
        .iter()
        .filter(|call| **call == Call::CloseSession)
        .count();
    assert_eq!(closes, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_closes_both_return() {
    let broker = MockBroker::new();
    let connection = Connection::dial_blocking(broker.connector()).await.unwrap();
    let other = connection.clone();

    let (a, b) = tokio::join!(connection.close(), other.close());

    assert!(a.is_ok());
    assert!(b.is_ok());
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn close_during_backoff_returns_without_waiting() {
    let broker = MockBroker::new();
    broker.fail_dials(100);
    let connection = Connection::dial(broker.connector());
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(broker.dial_count(), 3);

    let start = Instant::now();
    connection.close().await.unwrap();

    assert_eq!(start.elapsed(), Duration::ZERO);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(broker.dial_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn close_interrupts_a_hanging_dial() {
    let dials = Arc::new(AtomicUsize::new(0));
    let connection = Connection::dial(SilentBroker {
        dials: Arc::clone(&dials),
    });
    settle().await;
    assert_eq!(dials.load(Ordering::SeqCst), 1);

    let start = Instant::now();
    connection.close().await.unwrap();

    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn closed_event_is_emitted_once() {
    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);
    let config = ConnectionConfig::builder()
        .event_listener(FnListener::new(move |event: &ConnectionEvent| {
            if matches!(event, ConnectionEvent::Closed { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }))
        .build();
    let broker = MockBroker::new();
    let connection = Connection::dial_blocking_with_config(broker.connector(), config)
        .await
        .unwrap();

    connection.close().await.unwrap();
    connection.close().await.unwrap();

    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn closed_connection_ignores_session_loss() {
    let broker = MockBroker::new();
    let connection = Connection::dial_blocking(broker.connector()).await.unwrap();
    connection.close().await.unwrap();

    assert!(!broker.sever());
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(broker.dial_count(), 1);
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn close_during_rebind_closes_the_new_session() {
    let broker = MockBroker::new();
    let connection = Connection::dial_blocking(broker.connector()).await.unwrap();
    let channel = connection.channel().await;

    // the first declare fills the sink, so the replay after a reconnect blocks
    let (results, _queues) = mpsc::channel(1);
    channel
        .declare_queue(QueueDeclareSpec {
            result_sink: Some(results),
            ..QueueDeclareSpec::new("work")
        })
        .await;

    broker.sever();
    settle().await;
    assert_eq!(broker.dial_count(), 2);
    assert_eq!(broker.open_sessions(), 1);
    assert!(!channel.is_bound());

    connection.close().await.unwrap();

    assert_eq!(broker.open_sessions(), 0);
    assert!(!channel.is_bound());
    assert_eq!(connection.state(), ConnectionState::Closed);
}
