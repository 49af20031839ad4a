mod fixtures;

use courier_broker::memory::InMemoryBroker;
use courier_broker::{Connector, MessageProperties};
use courier_event_bus::BusError;
use fixtures::{Flaky, OrderCreated, bus_on, eventually, settle, test_config};

#[tokio::test]
async fn failing_handler_walks_every_tier_then_dead_letters() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let (bus, metrics) = bus_on(&broker, test_config());
    let handler = Flaky::always_failing();
    bus.subscribe::<OrderCreated, _>(handler.clone()).await?;

    let id = bus.publish(OrderCreated::new(1)).await?;

    assert!(eventually(|| broker.ready_count("queue.OrderCreated.dlq") == Some(1)).await);
    assert_eq!(handler.calls(), 1 + 3);

    let dead = broker.peek("queue.OrderCreated.dlq");
    let headers = &dead[0].properties.headers;
    assert_eq!(headers.get_int("x-retry-count"), Some(3));
    assert_eq!(headers.get_str("x-first-death-reason"), Some("rejected"));
    assert_eq!(headers.get_str("x-original-queue"), Some(""));
    assert_eq!(dead[0].properties.message_id, Some(id.to_string()));
    assert_eq!(dead[0].properties.kind.as_deref(), Some("OrderCreated"));

    let counters = metrics.snapshot("OrderCreated");
    assert_eq!(counters.failed, 4);
    assert_eq!(counters.retried, 3);
    assert_eq!(counters.consumed, 0);
    assert!(eventually(|| broker.unacked_count() == 0).await);
    bus.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn handler_recovering_within_the_tiers_is_not_dead_lettered() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let (bus, metrics) = bus_on(&broker, test_config());
    let handler = Flaky::failing(2);
    bus.subscribe::<OrderCreated, _>(handler.clone()).await?;

    bus.publish(OrderCreated::new(2)).await?;

    assert!(eventually(|| metrics.snapshot("OrderCreated").consumed == 1).await);
    assert_eq!(handler.calls(), 3);
    assert_eq!(metrics.snapshot("OrderCreated").retried, 2);
    settle().await;
    assert_eq!(broker.ready_count("queue.OrderCreated.dlq"), Some(0));
    bus.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn disabled_retry_dead_letters_on_first_failure() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let mut config = test_config();
    config.retry.enabled = false;
    let (bus, _) = bus_on(&broker, config);
    let handler = Flaky::always_failing();
    bus.subscribe::<OrderCreated, _>(handler.clone()).await?;

    bus.publish(OrderCreated::new(3)).await?;

    assert!(eventually(|| broker.ready_count("queue.OrderCreated.dlq") == Some(1)).await);
    assert_eq!(handler.calls(), 1);
    let dead = broker.peek("queue.OrderCreated.dlq");
    assert!(dead[0].properties.headers.get("x-retry-count").is_none());
    bus.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn undecodable_body_goes_straight_to_the_dead_letter_queue() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let (bus, _) = bus_on(&broker, test_config());
    let handler = Flaky::failing(0);
    bus.subscribe::<OrderCreated, _>(handler.clone()).await?;

    let raw = broker.connect().await?.create_channel().await?;
    let properties = MessageProperties {
        kind: Some("OrderCreated".into()),
        message_id: Some("garbage-1".into()),
        ..MessageProperties::default()
    };
    raw.basic_publish("exchange.OrderCreated", "", true, properties, b"{not json".to_vec()).await?;

    assert!(eventually(|| broker.ready_count("queue.OrderCreated.dlq") == Some(1)).await);
    assert_eq!(handler.calls(), 0);
    bus.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn fanout_retry_is_deduplicated_on_queues_that_already_succeeded() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let (bus, metrics) = bus_on(&broker, test_config());
    let healthy = Flaky::failing(0);
    let flaky = Flaky::failing(1);
    bus.subscribe_with::<OrderCreated, _>(
        healthy.clone(),
        courier_event_bus::SubscribeOptions::new().queue("queue.OrderCreated.Healthy.default"),
    )
    .await?;
    bus.subscribe_with::<OrderCreated, _>(
        flaky.clone(),
        courier_event_bus::SubscribeOptions::new().queue("queue.OrderCreated.Flaky.default"),
    )
    .await?;

    bus.publish(OrderCreated::new(4)).await?;

    assert!(eventually(|| flaky.calls() == 2).await);
    assert!(eventually(|| metrics.snapshot("OrderCreated").duplicates == 1).await);
    assert_eq!(healthy.calls(), 1);
    bus.shutdown().await;
    Ok(())
}
