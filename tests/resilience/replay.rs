use std::time::Duration;

use resilient_amqp::mock::{Call, MockBroker};
use resilient_amqp::{
    Connection, ConsumeSpec, Delivery, ExchangeDeclareSpec, QueueBindSpec, QueueDeclareSpec,
};
use tokio::sync::mpsc;

use super::{init_tracing, settle};

fn topology() -> Vec<Call> {
    vec![
        Call::ExchangeDeclare("orders".into()),
        Call::ExchangeDeclare("audit".into()),
        Call::QueueDeclare("billing".into()),
        Call::QueueBind {
            queue: "billing".into(),
            exchange: "orders".into(),
            routing_key: "order.*".into(),
        },
        Call::Consume {
            queue: "billing".into(),
            consumer: String::new(),
        },
    ]
}

#[tokio::test(start_paused = true)]
async fn declarations_before_first_connect_run_once_in_dependency_order() {
    init_tracing();
    let broker = MockBroker::new();
    broker.fail_dials(2);
    let connection = Connection::dial(broker.connector());
    let channel = connection.channel().await;
    let (deliveries, _inbox) = mpsc::channel(8);

    // issued out of dependency order on purpose
    channel
        .consume(ConsumeSpec::new("billing", deliveries))
        .await;
    channel
        .bind_queue(QueueBindSpec::new("billing", "order.*", "orders"))
        .await;
    channel.declare_queue(QueueDeclareSpec::new("billing")).await;
    channel
        .declare_exchange(ExchangeDeclareSpec::new("orders"))
        .await;
    channel
        .declare_exchange(ExchangeDeclareSpec::new("audit"))
        .await;
    assert!(broker.declarations().is_empty());

    // dials at 0s and 1s fail, 3s succeeds
    tokio::time::sleep(Duration::from_secs(3)).await;
    settle().await;

    assert!(channel.is_bound());
    assert_eq!(broker.declarations(), topology());
    connection.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_replays_every_spec_again_once() {
    let broker = MockBroker::new();
    let connection = Connection::dial_blocking(broker.connector()).await.unwrap();
    let channel = connection.channel().await;
    let (deliveries, _inbox) = mpsc::channel(8);

    channel
        .declare_exchange(ExchangeDeclareSpec::new("orders"))
        .await;
    channel
        .declare_exchange(ExchangeDeclareSpec::new("audit"))
        .await;
    channel.declare_queue(QueueDeclareSpec::new("billing")).await;
    channel
        .bind_queue(QueueBindSpec::new("billing", "order.*", "orders"))
        .await;
    channel
        .consume(ConsumeSpec::new("billing", deliveries))
        .await;
    assert_eq!(broker.declarations(), topology());
    assert_eq!(channel.spec_count().await, 5);

    assert!(broker.sever());
    settle().await;

    let mut expected = topology();
    expected.extend(topology());
    assert!(channel.is_bound());
    assert_eq!(broker.declarations(), expected);
    assert_eq!(channel.spec_count().await, 5);
    connection.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn consumer_sink_keeps_receiving_across_reconnects() {
    let broker = MockBroker::new();
    let connection = Connection::dial_blocking(broker.connector()).await.unwrap();
    let channel = connection.channel().await;
    let (deliveries, mut inbox) = mpsc::channel(8);
    channel
        .consume(ConsumeSpec::new("billing", deliveries))
        .await;

    assert!(broker.deliver("billing", Delivery::default()));
    assert!(inbox.recv().await.is_some());

    assert!(broker.sever());
    settle().await;
    assert_eq!(broker.consumer_count("billing"), 1);

    let delivery = Delivery {
        body: b"after reconnect".to_vec(),
        ..Delivery::default()
    };
    assert!(broker.deliver("billing", delivery));
    assert_eq!(inbox.recv().await.unwrap().body, b"after reconnect");
    connection.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn all_channels_rebind_together() {
    let broker = MockBroker::new();
    let connection = Connection::dial_blocking(broker.connector()).await.unwrap();
    let first = connection.channel().await;
    let second = connection.channel().await;
    first
        .declare_exchange(ExchangeDeclareSpec::new("orders"))
        .await;
    second.declare_queue(QueueDeclareSpec::new("billing")).await;

    broker.fail_dials(1);
    assert!(broker.sever());
    settle().await;

    assert!(!first.is_bound());
    assert!(!second.is_bound());

    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;

    assert!(first.is_bound());
    assert!(second.is_bound());
    assert_eq!(
        broker.declarations()[2..],
        [
            Call::ExchangeDeclare("orders".into()),
            Call::QueueDeclare("billing".into()),
        ]
    );
    connection.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn queue_result_sink_sees_every_declare() {
    let broker = MockBroker::new();
    let connection = Connection::dial_blocking(broker.connector()).await.unwrap();
    let channel = connection.channel().await;
    let (results, mut queues) = mpsc::channel(4);

    channel
        .declare_queue(QueueDeclareSpec {
            result_sink: Some(results),
            ..QueueDeclareSpec::new("")
        })
        .await;
    let first = queues.recv().await.unwrap();

    assert!(broker.sever());
    settle().await;
    let second = queues.recv().await.unwrap();

    assert!(first.name.starts_with("amq.gen-"));
    assert!(second.name.starts_with("amq.gen-"));
    assert_ne!(first.name, second.name);
    connection.close().await.unwrap();
}
