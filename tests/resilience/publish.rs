use resilient_amqp::mock::{Call, MockBroker};
use resilient_amqp::{
    BrokerError, ChannelContext, Confirmation, Connection, Error, Properties, PublishFlags, Publishing,
};
use serde::Serialize;

use super::settle;

async fn publish_one(channel: &ChannelContext) {
    channel
        .publish("", "q", PublishFlags::default(), Publishing::new("x"))
        .await
        .unwrap();
}

#[derive(Serialize)]
struct OrderCreated {
    id: u64,
    sku: &'static str,
}

#[tokio::test(start_paused = true)]
async fn publish_before_first_connect_is_not_connected() {
    let broker = MockBroker::new();
    broker.fail_dials(1);
    let connection = Connection::dial(broker.connector());
    let channel = connection.channel().await;
    settle().await;

    let err = channel
        .publish("orders", "order.created", PublishFlags::default(), Publishing::new("{}"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NotConnected));
    assert!(!broker
        .calls()
        .iter()
        .any(|call| matches!(call, Call::Publish { .. })));
    connection.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn publish_while_disconnected_fails_fast_then_recovers() {
    let broker = MockBroker::new();
    let connection = Connection::dial_blocking(broker.connector()).await.unwrap();
    let channel = connection.channel().await;
    let message = || Publishing::new("ping");

    channel
        .publish("", "health", PublishFlags::default(), message())
        .await
        .unwrap();

    broker.fail_dials(1);
    broker.sever();
    settle().await;
    assert!(matches!(
        channel
            .publish("", "health", PublishFlags::default(), message())
            .await,
        Err(Error::NotConnected)
    ));

    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    settle().await;
    channel
        .publish("", "health", PublishFlags::default(), message())
        .await
        .unwrap();

    // nothing was queued while disconnected
    assert_eq!(broker.published().len(), 2);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn broker_rejection_is_publish_failure() {
    let broker = MockBroker::new();
    let connection = Connection::dial_blocking(broker.connector()).await.unwrap();
    let channel = connection.channel().await;
    broker.fail_publishes(Some(BrokerError::with_code(403, "ACCESS_REFUSED")));

    let err = channel
        .publish("orders", "k", PublishFlags::default(), Publishing::new("x"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PublishFailure(ref e) if e.code() == Some(403)));
    connection.close().await.unwrap();
}

#[tokio::test]
async fn publish_json_keeps_caller_properties() {
    let broker = MockBroker::new();
    let connection = Connection::dial_blocking(broker.connector()).await.unwrap();
    let channel = connection.channel().await;

    channel
        .publish_json_with_properties(
            "orders",
            "order.created",
            PublishFlags {
                mandatory: true,
                ..PublishFlags::default()
            },
            &OrderCreated { id: 7, sku: "A-1" },
            Properties {
                message_id: Some("m-7".into()),
                delivery_mode: Some(2),
                content_type: Some("text/plain".into()),
                ..Properties::default()
            },
        )
        .await
        .unwrap();

    let published = &broker.published()[0];
    assert!(published.flags.mandatory);
    assert_eq!(published.routing_key, "order.created");
    let properties = &published.message.properties;
    assert_eq!(properties.content_type.as_deref(), Some("application/json"));
    assert_eq!(properties.message_id.as_deref(), Some("m-7"));
    assert_eq!(properties.delivery_mode, Some(2));
    let body: serde_json::Value = serde_json::from_slice(&published.message.body).unwrap();
    assert_eq!(body, serde_json::json!({ "id": 7, "sku": "A-1" }));
    connection.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn confirms_flow_into_one_receiver_across_reconnects() {
    let broker = MockBroker::new();
    let connection = Connection::dial_blocking(broker.connector()).await.unwrap();
    let channel = connection.channel_with_confirm(false).await;
    let mut confirms = channel.register_confirm_subscription().await;

    publish_one(&channel).await;
    publish_one(&channel).await;
    assert_eq!(
        confirms.recv().await,
        Some(Confirmation {
            delivery_tag: 1,
            ack: true
        })
    );
    assert_eq!(confirms.recv().await.unwrap().delivery_tag, 2);

    broker.sever();
    settle().await;
    publish_one(&channel).await;

    // a fresh underlying channel numbers its confirms from 1 again
    assert_eq!(confirms.recv().await.unwrap().delivery_tag, 1);
    let selects = broker
        .calls()
        .into_iter()
        .filter(|call| *call == Call::ConfirmSelect)
        .count();
    assert_eq!(selects, 2);
    connection.close().await.unwrap();
}
