use resilient_amqp::mock::MockBroker;
use resilient_amqp::{Connection, Error};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use super::settle;

#[tokio::test(start_paused = true)]
async fn dial_failure_reaches_every_sink_in_registration_order() {
    let broker = MockBroker::new();
    broker.fail_dials(1);
    let connection = Connection::dial(broker.connector());

    // the first sink starts full, so later sinks can only be served after it
    let (first, mut first_rx) = mpsc::channel(1);
    first.try_send(Error::NotConnected).unwrap();
    let (second, mut second_rx) = mpsc::channel(1);
    let (third, mut third_rx) = mpsc::channel(1);
    connection.notify_error(first).await;
    connection.notify_error(second).await;
    connection.notify_error(third).await;
    settle().await;

    assert!(matches!(second_rx.try_recv(), Err(TryRecvError::Empty)));
    assert!(matches!(third_rx.try_recv(), Err(TryRecvError::Empty)));

    assert!(matches!(first_rx.recv().await, Some(Error::NotConnected)));
    let a = first_rx.recv().await.unwrap();
    let b = second_rx.recv().await.unwrap();
    let c = third_rx.recv().await.unwrap();

    assert!(matches!(a, Error::DialFailure(_)));
    assert_eq!(a.broker_error(), b.broker_error());
    assert_eq!(b.broker_error(), c.broker_error());
    assert_eq!(a.to_string(), c.to_string());
    connection.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn session_loss_is_reported_as_transport_closed() {
    let broker = MockBroker::new();
    let connection = Connection::dial_blocking(broker.connector()).await.unwrap();
    let (sink, mut errors) = mpsc::channel(1);
    let returned = connection.notify_error(sink).await;

    broker.sever();
    let err = errors.recv().await.unwrap();

    assert!(err.is_transport());
    assert!(matches!(err, Error::TransportClosed(ref e) if e.code() == Some(320)));
    assert!(!returned.is_closed());
    connection.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dropped_sink_does_not_block_the_others() {
    let broker = MockBroker::new();
    broker.fail_dials(2);
    let connection = Connection::dial(broker.connector());
    let (gone, gone_rx) = mpsc::channel(1);
    let (live, mut live_rx) = mpsc::channel(4);
    connection.notify_error(gone).await;
    connection.notify_error(live).await;
    drop(gone_rx);

    tokio::time::sleep(std::time::Duration::from_secs(5)).await;

    assert!(matches!(live_rx.recv().await, Some(Error::DialFailure(_))));
    assert!(matches!(live_rx.recv().await, Some(Error::DialFailure(_))));
    settle().await;
    assert!(connection.is_connected());
    connection.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn clean_broker_close_reconnects_without_reporting() {
    let broker = MockBroker::new();
    let connection = Connection::dial_blocking(broker.connector()).await.unwrap();
    let channel = connection.channel().await;
    let (sink, mut errors) = mpsc::channel(1);
    connection.notify_error(sink).await;

    assert!(broker.hang_up());
    settle().await;

    assert!(matches!(errors.try_recv(), Err(TryRecvError::Empty)));
    assert!(connection.is_connected());
    assert!(channel.is_bound());
    assert_eq!(broker.dial_count(), 2);
    connection.close().await.unwrap();
}
