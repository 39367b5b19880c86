
use gridpool::comm::{CommConnection, Message};
use test_harness::TestExchange;

/// Worker binds its own queue; master publishes to it directly.
#[tokio::test]
async fn point_to_point_delivery() {
    let exchange = TestExchange::spawn(18500).await;
    let mut worker = CommConnection::connect(&exchange.endpoint(), "w1")
        .await
        .unwrap();
    let mut master = exchange.master_conn().await;

    master.send("w1", &Message::StatusCheck).await.unwrap();

    let (origin, msg) = worker.recv().await.unwrap().expect("message queued");
    assert_eq!(origin, "master");
    assert_eq!(msg, Message::StatusCheck);

    // Queue drained: popping acknowledged the delivery.
    assert!(worker.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn replies_route_back_to_master() {
    let exchange = TestExchange::spawn(18502).await;
    let mut worker = CommConnection::connect(&exchange.endpoint(), "w1")
        .await
        .unwrap();
    let mut master = exchange.master_conn().await;

    worker.send("master", &Message::MountDone).await.unwrap();

    let (origin, msg) = master.recv().await.unwrap().expect("message queued");
    assert_eq!(origin, "w1");
    assert_eq!(msg, Message::MountDone);
}

/// Publishing to a routing key nobody bound drops the envelope.
#[tokio::test]
async fn unbound_routing_key_drops_message() {
    let exchange = TestExchange::spawn(18504).await;
    let mut master = exchange.master_conn().await;

    master.send("w9", &Message::Reboot).await.unwrap();

    // Binding afterwards must not resurrect the dropped envelope.
    let mut late_worker = CommConnection::connect(&exchange.endpoint(), "w9")
        .await
        .unwrap();
    assert!(late_worker.recv().await.unwrap().is_none());
}

/// Messages from a single sender arrive in publish order.
#[tokio::test]
async fn per_sender_ordering_is_preserved() {
    let exchange = TestExchange::spawn(18506).await;
    let mut worker = CommConnection::connect(&exchange.endpoint(), "w1")
        .await
        .unwrap();
    let mut master = exchange.master_conn().await;

    let sequence = vec![
        Message::MasterPubkey("k1".to_string()),
        Message::StatusCheck,
        Message::StartSlurmd {
            alias: "w1".to_string(),
        },
    ];
    for msg in &sequence {
        master.send("w1", msg).await.unwrap();
    }

    for expected in &sequence {
        let (_, msg) = worker.recv().await.unwrap().expect("message queued");
        assert_eq!(&msg, expected);
    }
}

/// A malformed wire body is logged and skipped; the next envelope still
/// comes through.
#[tokio::test]
async fn malformed_envelope_is_dropped_not_fatal() {
    use gridpool::proto::comm_exchange_client::CommExchangeClient;
    use gridpool::proto::{Envelope, PublishRequest};

    let exchange = TestExchange::spawn(18510).await;
    let mut worker = CommConnection::connect(&exchange.endpoint(), "w1")
        .await
        .unwrap();
    let mut master = exchange.master_conn().await;

    let mut raw = CommExchangeClient::connect(exchange.endpoint())
        .await
        .unwrap();
    raw.publish(PublishRequest {
        envelope: Some(Envelope {
            routing_key: "w1".to_string(),
            reply_to: "master".to_string(),
            body: "FROBNICATE | junk".to_string(),
        }),
    })
    .await
    .unwrap();
    master.send("w1", &Message::StatusCheck).await.unwrap();

    let (_, msg) = worker.recv().await.unwrap().expect("valid message follows");
    assert_eq!(msg, Message::StatusCheck);
}

#[tokio::test]
async fn empty_queue_polls_none() {
    let exchange = TestExchange::spawn(18508).await;
    let mut worker = CommConnection::connect(&exchange.endpoint(), "w1")
        .await
        .unwrap();
    assert!(worker.recv().await.unwrap().is_none());
}
