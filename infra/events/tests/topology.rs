mod fixtures;

use courier_broker::memory::InMemoryBroker;
use courier_broker::{Connector, ExchangeKind, FieldValue, QueueOptions};
use courier_event_bus::BusError;
use courier_event_bus::config::{ConnectSettings, PrefetchSettings, RetrySettings};
use courier_event_bus::connection::ConnectionManager;
use courier_event_bus::topology::ChannelManager;
use fixtures::{OrderCreated, OrderShipped, Recorder, bus_on, eventually, test_config};
use std::sync::Arc;

fn manager(broker: &InMemoryBroker, retry: RetrySettings) -> Arc<ChannelManager> {
    let connections = ConnectionManager::new(Arc::new(broker.clone()), ConnectSettings::default());
    ChannelManager::new(connections, PrefetchSettings::default(), retry)
}

#[tokio::test]
async fn declares_dead_letter_and_retry_tiers() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let channels = manager(&broker, RetrySettings::default());

    channels.ensure_exchange("OrderCreated", ExchangeKind::Fanout).await?;

    assert_eq!(broker.exchange_kind("exchange.OrderCreated"), Some(ExchangeKind::Fanout));
    assert_eq!(broker.exchange_kind("exchange.OrderCreated.dlx"), Some(ExchangeKind::Fanout));
    assert_eq!(
        broker.bindings("exchange.OrderCreated.dlx"),
        vec![("queue.OrderCreated.dlq".to_owned(), String::new())]
    );

    for (tier, ttl) in [(1, 1_000_i64), (2, 2_000), (3, 4_000)] {
        let queue = format!("queue.OrderCreated.retry-{tier}");
        let options = broker.queue_options(&queue).expect("retry queue");
        assert!(options.durable);
        assert_eq!(options.arguments.get_int("x-message-ttl"), Some(ttl));
        assert_eq!(options.arguments.get_str("x-dead-letter-exchange"), Some("exchange.OrderCreated"));
        assert_eq!(
            broker.bindings(&format!("exchange.OrderCreated.retry-{tier}")),
            vec![(queue, String::new())]
        );
    }
    assert!(!broker.has_queue("queue.OrderCreated.retry-4"));

    let record = channels.topology("OrderCreated").expect("memoised");
    assert_eq!(record.kind, ExchangeKind::Fanout);
    assert_eq!(record.exchanges.len(), 5);
    assert_eq!(record.exchanges[0], "exchange.OrderCreated");
    Ok(())
}

#[tokio::test]
async fn concurrent_declarations_hit_the_broker_once() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let channels = manager(&broker, RetrySettings::default());

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let channels = Arc::clone(&channels);
        tasks.push(tokio::spawn(async move {
            channels.ensure_exchange("OrderCreated", ExchangeKind::Topic).await
        }));
    }
    for task in tasks {
        task.await.expect("task")?;
    }

    let after_first = broker.stats();
    assert_eq!(after_first.exchange_declares, 1 + 3 + 1);
    assert_eq!(after_first.queue_declares, 1 + 3);

    channels.ensure_exchange("OrderCreated", ExchangeKind::Topic).await?;
    assert_eq!(broker.stats(), after_first, "repeat declaration must not reach the broker");
    assert_eq!(after_first.channels_opened, 1);
    Ok(())
}

#[tokio::test]
async fn conflicting_kind_on_broker_is_recreated() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let foreign = broker.connect().await?.create_channel().await?;
    foreign.exchange_declare("exchange.OrderCreated", ExchangeKind::Topic).await?;

    let channels = manager(&broker, RetrySettings::default());
    channels.ensure_exchange("OrderCreated", ExchangeKind::Fanout).await?;

    assert_eq!(broker.exchange_kind("exchange.OrderCreated"), Some(ExchangeKind::Fanout));
    assert_eq!(broker.stats().exchange_deletes, 1);
    assert_eq!(channels.exchange_kind("OrderCreated"), Some(ExchangeKind::Fanout));
    assert!(channels.channel().await?.is_open());
    Ok(())
}

#[tokio::test]
async fn later_kind_wins_in_process() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let channels = manager(&broker, RetrySettings::default());

    channels.ensure_exchange("OrderCreated", ExchangeKind::Fanout).await?;
    let declares = broker.stats().queue_declares;
    channels.ensure_exchange("OrderCreated", ExchangeKind::Direct).await?;

    assert_eq!(channels.exchange_kind("OrderCreated"), Some(ExchangeKind::Direct));
    assert_eq!(broker.exchange_kind("exchange.OrderCreated"), Some(ExchangeKind::Direct));
    assert_eq!(broker.stats().queue_declares, declares, "only the primary exchange is redone");
    Ok(())
}

#[tokio::test]
async fn disabled_retry_declares_no_tiers() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let channels = manager(&broker, RetrySettings { enabled: false, ..RetrySettings::default() });

    channels.ensure_exchange("OrderCreated", ExchangeKind::Fanout).await?;

    assert!(broker.has_queue("queue.OrderCreated.dlq"));
    assert!(broker.exchange_kind("exchange.OrderCreated.retry-1").is_none());
    assert_eq!(channels.topology("OrderCreated").map(|r| r.exchanges.len()), Some(2));
    Ok(())
}

#[tokio::test]
async fn existing_retry_queue_with_other_ttl_is_kept() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let foreign = broker.connect().await?.create_channel().await?;
    let old = QueueOptions::durable()
        .argument("x-message-ttl", 5_000_i64)
        .argument("x-dead-letter-exchange", "exchange.OrderCreated");
    foreign.queue_declare("queue.OrderCreated.retry-1", old).await?;

    let channels = manager(&broker, RetrySettings::default());
    channels.ensure_exchange("OrderCreated", ExchangeKind::Fanout).await?;

    let options = broker.queue_options("queue.OrderCreated.retry-1").expect("queue");
    assert_eq!(options.arguments.get("x-message-ttl"), Some(&FieldValue::Int(5_000)));
    assert_eq!(broker.exchange_kind("exchange.OrderCreated"), Some(ExchangeKind::Fanout));
    assert_eq!(
        broker.bindings("exchange.OrderCreated.retry-1"),
        vec![("queue.OrderCreated.retry-1".to_owned(), String::new())]
    );
    Ok(())
}

#[tokio::test]
async fn queue_helpers_reopen_the_channel_after_a_failure() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let channels = manager(&broker, RetrySettings::default());

    channels.declare_queue("work", QueueOptions::durable()).await?;
    let err = channels.bind_queue("work", "exchange.Missing", "").await.unwrap_err();
    assert!(matches!(err, BusError::Broker { .. }));

    channels.declare_exchange("exchange.Custom", ExchangeKind::Direct).await?;
    channels.bind_queue("work", "exchange.Custom", "key").await?;
    assert_eq!(broker.bindings("exchange.Custom"), vec![("work".to_owned(), "key".to_owned())]);

    channels.delete_queue("work").await?;
    assert!(!broker.has_queue("work"));
    assert_eq!(broker.stats().channels_opened, 2);
    Ok(())
}

#[tokio::test]
async fn close_releases_channel_and_connection() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let channels = manager(&broker, RetrySettings::default());
    channels.channel().await?;
    assert_eq!(broker.open_connections(), 1);

    channels.close().await;
    assert_eq!(broker.open_connections(), 0);
    assert!(matches!(channels.channel().await, Err(BusError::ShutDown { .. })));
    Ok(())
}

#[tokio::test]
async fn kind_conflict_heal_keeps_other_consumers_running() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let (bus, _) = bus_on(&broker, test_config());
    let (recorder, _seen) = Recorder::<OrderCreated>::new();
    let queue = bus.subscribe::<OrderCreated, _>(recorder.clone()).await?;

    let foreign = broker.connect().await?.create_channel().await?;
    foreign.exchange_declare("exchange.orders.shipped", ExchangeKind::Topic).await?;
    let (shipped, _shipped_seen) = Recorder::<OrderShipped>::new();
    bus.subscribe::<OrderShipped, _>(shipped).await?;
    assert_eq!(broker.exchange_kind("exchange.orders.shipped"), Some(ExchangeKind::Fanout));

    bus.publish(OrderCreated::new(1)).await?;
    assert!(eventually(|| recorder.calls() == 1).await);
    assert_eq!(broker.consumer_count(&queue), 1);
    assert_eq!(broker.ready_count(&queue), Some(0));
    bus.shutdown().await;
    Ok(())
}
