mod fixtures;

use courier_broker::memory::InMemoryBroker;
use courier_broker::{Connector, MessageProperties};
use courier_event_bus::{BusError, EventMeta, RequestMeta, ResponseMeta};
use fixtures::{PriceDesk, PriceQuery, PriceQuote, bus_on, eventually, test_config};
use std::time::Duration;

fn query(sku: &str) -> PriceQuery {
    PriceQuery { meta: EventMeta::new(), request: RequestMeta::default(), sku: sku.to_owned() }
}

#[tokio::test]
async fn request_receives_the_correlated_reply() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let (bus, _) = bus_on(&broker, test_config());
    bus.subscribe::<PriceQuery, _>(PriceDesk { bus: bus.clone() }).await?;

    let quote: PriceQuote = bus.request(query("sku-1")).await?;

    assert_eq!(quote.sku, "sku-1");
    assert_eq!(quote.cents, 1999);
    assert!(quote.response.correlation_id.is_some());
    assert!(bus.registry().handlers_for_event("PriceQuote").is_none());
    bus.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn caller_supplied_correlation_id_names_the_reply_queue() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let (bus, _) = bus_on(&broker, test_config());
    bus.subscribe::<PriceQuery, _>(PriceDesk { bus: bus.clone() }).await?;

    let mut request = query("sku-2");
    request.request.correlation_id = Some("cid-42".to_owned());
    let quote: PriceQuote = bus.request(request).await?;

    assert_eq!(quote.response.correlation_id.as_deref(), Some("cid-42"));
    assert!(eventually(|| !broker.has_queue("reply.cid-42")).await);
    bus.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unanswered_request_times_out_and_cleans_up() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let (bus, _) = bus_on(&broker, test_config());

    let mut request = query("sku-3");
    request.request.correlation_id = Some("cid-silent".to_owned());
    let err = bus
        .request_with_timeout::<_, PriceQuote>(request, Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(matches!(err, BusError::RequestTimeout { .. }));
    assert!(err.to_string().contains("cid-silent"));
    assert!(!broker.has_queue("reply.cid-silent"));
    assert_eq!(broker.consumer_count("reply.cid-silent"), 0);
    bus.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn stray_reply_without_waiter_is_dropped() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let (bus, _) = bus_on(&broker, test_config());

    let orphan = PriceQuery {
        meta: EventMeta::new(),
        request: RequestMeta {
            correlation_id: Some("nobody".to_owned()),
            reply_to: Some("reply.nobody".to_owned()),
        },
        sku: "sku-4".to_owned(),
    };
    let quote = PriceQuote {
        meta: EventMeta::new(),
        response: ResponseMeta::default(),
        sku: "sku-4".to_owned(),
        cents: 1,
    };
    bus.reply(&orphan, quote).await?;
    assert_eq!(broker.stats().returned, 1);
    bus.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn reply_needs_a_reply_address() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let (bus, _) = bus_on(&broker, test_config());
    let quote = PriceQuote {
        meta: EventMeta::new(),
        response: ResponseMeta::default(),
        sku: "sku-5".to_owned(),
        cents: 1,
    };

    let err = bus.reply(&query("sku-5"), quote).await.unwrap_err();
    assert!(matches!(err, BusError::Internal { .. }));
    bus.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn undecodable_reply_fails_the_request() -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let (bus, _) = bus_on(&broker, test_config());

    let mut request = query("sku-6");
    request.request.correlation_id = Some("cid-garbled".to_owned());
    let waiting = tokio::spawn({
        let bus = bus.clone();
        async move { bus.request::<PriceQuery, PriceQuote>(request).await }
    });
    assert!(
        eventually(|| bus.pending_requests() == 1 && broker.consumer_count("reply.cid-garbled") == 1)
            .await
    );

    let raw = broker.connect().await?.create_channel().await?;
    let properties = MessageProperties {
        kind: Some("PriceQuote".into()),
        correlation_id: Some("cid-garbled".into()),
        ..MessageProperties::default()
    };
    raw.basic_publish("", "reply.cid-garbled", true, properties, b"{\"sku\":".to_vec()).await?;

    let err = waiting.await.expect("request task").unwrap_err();
    assert!(matches!(err, BusError::Deserialization { .. }));
    assert_eq!(bus.pending_requests(), 0);
    assert!(!broker.has_queue("reply.cid-garbled"));
    assert!(eventually(|| broker.unacked_count() == 0).await);
    bus.shutdown().await;
    Ok(())
}
