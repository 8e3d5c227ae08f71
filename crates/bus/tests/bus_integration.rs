//! End-to-end tests of the message bus over the in-memory transport and stores.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bus::{
    Bus, BusConfig, BusExt, CallbackOutcome, Delivery, DispatchError, HandlerChain, HandlerError,
    Handles, InMemoryTransport, MessageBus, RetryPolicy, Transport,
};
use chrono::{Duration, Utc};
use common::Endpoint;
use messaging::{Envelope, Message, TransportMessage};
use persistence::{InMemorySagaStore, InMemoryTimeoutStore, SagaStore, TimeoutStore};
use saga::loyalty::{self, CustomerMadePreferred, OrderAccepted, PreferredStatusExpired};
use saga::{SagaDefinition, State};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn local() -> Endpoint {
    Endpoint::new("memory://local")
}

fn error_endpoint() -> Endpoint {
    Endpoint::new("memory://error")
}

fn envelope<M: Message>(message: &M) -> Envelope {
    Envelope::new(TransportMessage::from_message(message).unwrap())
}

#[derive(Default)]
struct OrderLog {
    amounts: Mutex<Vec<u64>>,
}

#[async_trait]
impl Handles<OrderAccepted> for OrderLog {
    async fn handle(&self, order: OrderAccepted, _bus: &dyn Bus) -> Result<(), HandlerError> {
        self.amounts.lock().unwrap().push(order.amount);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    n: u32,
}

impl Message for Ping {
    fn message_type() -> &'static str {
        "Ping"
    }
}

#[derive(Debug, thiserror::Error)]
#[error("ping handler is broken")]
struct Broken;

struct FailingPingHandler;

#[async_trait]
impl Handles<Ping> for FailingPingHandler {
    async fn handle(&self, _: Ping, _: &dyn Bus) -> Result<(), HandlerError> {
        Err(Box::new(Broken))
    }
}

#[derive(Default)]
struct AuditTrail {
    entries: Mutex<Vec<String>>,
}

struct AuditingPingHandler;

#[async_trait]
impl Handles<Ping> for AuditingPingHandler {
    async fn handle(&self, ping: Ping, bus: &dyn Bus) -> Result<(), HandlerError> {
        let trail = bus.find::<AuditTrail>().ok_or("no audit trail registered")?;
        trail.entries.lock().unwrap().push(format!("ping {}", ping.n));
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GetQuote {
    product: String,
}

impl Message for GetQuote {
    fn message_type() -> &'static str {
        "GetQuote"
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Quote {
    product: String,
    price: u64,
}

impl Message for Quote {
    fn message_type() -> &'static str {
        "Quote"
    }
}

struct QuoteService;

#[async_trait]
impl Handles<GetQuote> for QuoteService {
    async fn handle(&self, request: GetQuote, bus: &dyn Bus) -> Result<(), HandlerError> {
        bus.reply(&Quote {
            product: request.product,
            price: 42,
        })
        .await?;
        Ok(())
    }
}

struct TestHarness {
    bus: MessageBus,
    transport: InMemoryTransport,
    sagas: InMemorySagaStore,
    timeouts: InMemoryTimeoutStore,
}

impl TestHarness {
    async fn loyalty() -> Self {
        let transport = InMemoryTransport::new();
        let sagas = InMemorySagaStore::new();
        let timeouts = InMemoryTimeoutStore::new();
        let bus = MessageBus::builder(BusConfig::default())
            .transport(Arc::new(transport.clone()))
            .saga_store(Arc::new(sagas.clone()))
            .timeout_store(Arc::new(timeouts.clone()))
            .saga(loyalty::definition().unwrap())
            .build()
            .await
            .unwrap();
        Self {
            bus,
            transport,
            sagas,
            timeouts,
        }
    }
}

#[tokio::test]
async fn test_two_orders_make_customer_preferred_once() {
    let h = TestHarness::loyalty().await;
    let observer = Endpoint::new("memory://marketing");
    h.transport
        .subscribe(CustomerMadePreferred::message_type(), &observer)
        .await
        .unwrap();
    let customer = Uuid::new_v4();

    let first = h
        .bus
        .dispatch(&mut envelope(&OrderAccepted {
            customer_id: customer,
            amount: 3000,
        }))
        .await
        .unwrap();
    assert!(first.saga_outcomes[0].started);
    assert!(h.transport.drain(&observer).await.is_empty());
    assert_eq!(h.timeouts.entry_count().await, 0);

    h.bus
        .dispatch(&mut envelope(&OrderAccepted {
            customer_id: customer,
            amount: 3000,
        }))
        .await
        .unwrap();

    let published = h.transport.drain(&observer).await;
    assert_eq!(published.len(), 1);
    let preferred: CustomerMadePreferred = published[0].message.decode().unwrap();
    assert_eq!(preferred.customer_id, customer);
    assert_eq!(preferred.running_total, 6000);

    let timeouts = h.timeouts.find_all(&local()).await.unwrap();
    assert_eq!(timeouts.len(), 1);
    assert_eq!(timeouts[0].payload().message_type(), "PreferredStatusExpired");
    assert_eq!(timeouts[0].delay(), Duration::days(365));
    assert!(timeouts[0].at() > Utc::now() + Duration::days(364));
    let requestor = timeouts[0].requestor().unwrap();
    assert_eq!(requestor.saga_type, loyalty::SAGA_TYPE);
    assert_eq!(requestor.saga_id, first.saga_outcomes[0].saga_id);
}

#[tokio::test]
async fn test_expiry_for_unknown_customer_is_correlation_fault() {
    let h = TestHarness::loyalty().await;

    let result = h
        .bus
        .dispatch(&mut envelope(&PreferredStatusExpired {
            customer_id: Uuid::new_v4(),
        }))
        .await;

    match result {
        Err(DispatchError::CorrelationFault {
            message_type,
            saga_type,
            ..
        }) => {
            assert_eq!(message_type, "PreferredStatusExpired");
            assert_eq!(saga_type, loyalty::SAGA_TYPE);
        }
        other => panic!("expected correlation fault, got {other:?}"),
    }
    assert_eq!(h.sagas.record_count().await, 0);
}

#[tokio::test]
async fn test_delivered_timeout_continues_the_saga() {
    let h = TestHarness::loyalty().await;
    let customer = Uuid::new_v4();
    let report = h
        .bus
        .dispatch(&mut envelope(&OrderAccepted {
            customer_id: customer,
            amount: 6000,
        }))
        .await
        .unwrap();
    let saga_id = report.saga_outcomes[0].saga_id;
    let due_at = h.timeouts.find_all(&local()).await.unwrap()[0].at();

    let delivered = h.bus.timeout_poller().poll_once(due_at).await.unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(h.timeouts.entry_count().await, 0);

    let mut redelivered = h.transport.drain(&local()).await;
    assert_eq!(redelivered.len(), 1);
    h.bus.dispatch(&mut redelivered[0]).await.unwrap();

    let record = h.sagas.find_all(loyalty::SAGA_TYPE).await.unwrap();
    assert_eq!(record[0].id, saga_id);
    assert_eq!(record[0].data["preferred"], false);
}

#[tokio::test]
async fn test_handlers_and_sagas_share_a_message_in_order() {
    let log = Arc::new(OrderLog::default());
    let bus = MessageBus::builder(BusConfig::default())
        .consumes::<OrderAccepted, _>(log.clone())
        .saga(loyalty::definition().unwrap())
        .build()
        .await
        .unwrap();

    let mut order = envelope(&OrderAccepted {
        customer_id: Uuid::new_v4(),
        amount: 10,
    });
    let report = bus.dispatch(&mut order).await.unwrap();

    assert_eq!(
        report.consumers,
        vec![std::any::type_name::<OrderLog>(), loyalty::SAGA_TYPE]
    );
    assert_eq!(*log.amounts.lock().unwrap(), vec![10]);
    let stages: Vec<_> = order.headers.stages.iter().map(|s| s.consumer.as_str()).collect();
    assert_eq!(stages, report.consumers);
    assert_eq!(order.headers.stages[0].message_types, vec!["OrderAccepted"]);
}

#[tokio::test]
async fn test_handler_chain_overrides_registration_order() {
    let log = Arc::new(OrderLog::default());
    let bus = MessageBus::builder(BusConfig::default())
        .consumes::<OrderAccepted, _>(log)
        .saga(loyalty::definition().unwrap())
        .chain(
            HandlerChain::for_message::<OrderAccepted>()
                .followed_by_saga(loyalty::SAGA_TYPE)
                .followed_by::<OrderLog>(),
        )
        .build()
        .await
        .unwrap();

    let report = bus
        .dispatch(&mut envelope(&OrderAccepted {
            customer_id: Uuid::new_v4(),
            amount: 10,
        }))
        .await
        .unwrap();

    assert_eq!(
        report.consumers,
        vec![loyalty::SAGA_TYPE, std::any::type_name::<OrderLog>()]
    );
}

#[tokio::test]
async fn test_handler_failure_is_wrapped_with_consumer_and_cause() {
    let bus = MessageBus::builder(BusConfig::default())
        .consumes::<Ping, _>(Arc::new(FailingPingHandler))
        .build()
        .await
        .unwrap();

    let mut ping = envelope(&Ping { n: 1 });
    let error = bus.dispatch(&mut ping).await.unwrap_err();

    match &error {
        DispatchError::ConsumerFailed {
            message_type,
            consumer,
            source,
        } => {
            assert_eq!(message_type, "Ping");
            assert!(consumer.ends_with("FailingPingHandler"));
            assert_eq!(source.to_string(), "ping handler is broken");
        }
        other => panic!("expected consumer failure, got {other:?}"),
    }
    assert_eq!(
        ping.current_stage().map(|stage| stage.consumer.as_str()),
        error.consumer()
    );
}

#[tokio::test]
async fn test_handler_finds_registered_collaborator() {
    let trail = Arc::new(AuditTrail::default());
    let bus = MessageBus::builder(BusConfig::default())
        .collaborator(trail.clone())
        .consumes::<Ping, _>(Arc::new(AuditingPingHandler))
        .build()
        .await
        .unwrap();

    bus.dispatch(&mut envelope(&Ping { n: 7 })).await.unwrap();

    assert_eq!(*trail.entries.lock().unwrap(), vec!["ping 7"]);
}

#[tokio::test]
async fn test_unconsumed_message_is_forwarded_to_error_endpoint() {
    let transport = InMemoryTransport::new();
    let bus = MessageBus::builder(BusConfig::default())
        .transport(Arc::new(transport.clone()))
        .build()
        .await
        .unwrap();

    let report = bus.dispatch(&mut envelope(&Ping { n: 1 })).await.unwrap();

    assert!(!report.was_consumed());
    let forwarded = transport.drain(&error_endpoint()).await;
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].message.message_type(), "Ping");
}

async fn client_and_server(transport: &InMemoryTransport) -> (MessageBus, MessageBus) {
    let client = MessageBus::builder(BusConfig::default())
        .transport(Arc::new(transport.clone()))
        .route::<GetQuote>("memory://quotes")
        .build()
        .await
        .unwrap();
    let server = MessageBus::builder(BusConfig::default().with_endpoint("memory://quotes"))
        .transport(Arc::new(transport.clone()))
        .consumes::<GetQuote, _>(Arc::new(QuoteService))
        .build()
        .await
        .unwrap();
    (client, server)
}

#[tokio::test]
async fn test_reply_completes_callback_without_routing_fault() {
    let transport = InMemoryTransport::new();
    let (client, server) = client_and_server(&transport).await;

    let callback = client
        .send(&GetQuote {
            product: "lamp".to_string(),
        })
        .await
        .unwrap()
        .expect::<Quote>();

    for mut request in transport.drain(&Endpoint::new("memory://quotes")).await {
        server.dispatch(&mut request).await.unwrap();
    }
    for mut reply in transport.drain(&local()).await {
        let report = client.dispatch(&mut reply).await.unwrap();
        assert_eq!(report.callback, Some(callback.id()));
    }

    let outcome = callback.into_reply().await.unwrap();
    let quote: Quote = outcome.reply().unwrap().decode().unwrap();
    assert_eq!(
        quote,
        Quote {
            product: "lamp".to_string(),
            price: 42
        }
    );
    assert!(transport.drain(&error_endpoint()).await.is_empty());
}

#[tokio::test]
async fn test_registered_action_runs_on_reply() {
    let transport = InMemoryTransport::new();
    let (client, server) = client_and_server(&transport).await;
    let prices = Arc::new(Mutex::new(Vec::new()));
    let seen = prices.clone();

    client
        .send(&GetQuote {
            product: "desk".to_string(),
        })
        .await
        .unwrap()
        .register(move |outcome| {
            if let Some(Ok(quote)) = outcome.reply().map(|m| m.decode::<Quote>()) {
                seen.lock().unwrap().push(quote.price);
            }
        });

    for mut request in transport.drain(&Endpoint::new("memory://quotes")).await {
        server.dispatch(&mut request).await.unwrap();
    }
    for mut reply in transport.drain(&local()).await {
        client.dispatch(&mut reply).await.unwrap();
        client.dispatch(&mut reply).await.unwrap();
    }

    assert_eq!(*prices.lock().unwrap(), vec![42]);
}

#[tokio::test]
async fn test_callback_expires_when_no_reply_arrives() {
    let transport = InMemoryTransport::new();
    let (client, _server) = client_and_server(&transport).await;

    let callback = client
        .send(&GetQuote {
            product: "chair".to_string(),
        })
        .await
        .unwrap()
        .expire_after(Duration::seconds(30))
        .await
        .unwrap();

    let delivered = client
        .timeout_poller()
        .poll_once(Utc::now() + Duration::seconds(31))
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    for mut expiry in transport.drain(&local()).await {
        let report = client.dispatch(&mut expiry).await.unwrap();
        assert_eq!(report.expired, Some(callback.id()));
    }
    assert_eq!(callback.into_reply().await.unwrap(), CallbackOutcome::TimedOut);
}

#[tokio::test]
async fn test_transient_consumer_can_be_unregistered() {
    let transport = InMemoryTransport::new();
    let bus = MessageBus::builder(BusConfig::default())
        .transport(Arc::new(transport.clone()))
        .build()
        .await
        .unwrap();
    let log = Arc::new(OrderLog::default());

    bus.register_transient::<OrderAccepted, _>(log.clone())
        .await
        .unwrap();
    bus.publish(&OrderAccepted {
        customer_id: Uuid::new_v4(),
        amount: 5,
    })
    .await
    .unwrap();
    for mut order in transport.drain(&local()).await {
        bus.dispatch(&mut order).await.unwrap();
    }
    assert_eq!(*log.amounts.lock().unwrap(), vec![5]);

    assert_eq!(bus.unregister(&log), 1);
    let report = bus
        .dispatch(&mut envelope(&OrderAccepted {
            customer_id: Uuid::new_v4(),
            amount: 6,
        }))
        .await
        .unwrap();
    assert!(report.consumers.is_empty());
    assert_eq!(log.amounts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_envelope_is_retried_then_forwarded() {
    let transport = InMemoryTransport::new();
    let bus = MessageBus::builder(BusConfig {
        max_retries: 1,
        ..BusConfig::default()
    })
    .transport(Arc::new(transport.clone()))
    .consumes::<Ping, _>(Arc::new(FailingPingHandler))
    .build()
    .await
    .unwrap();
    let retry = RetryPolicy::new(bus.config().max_retries);

    let first = bus::worker::process(&bus, retry, envelope(&Ping { n: 1 })).await;
    assert_eq!(first, Delivery::Retried);

    let requeued = transport.drain(&local()).await.remove(0);
    assert_eq!(requeued.headers.retries, 1);
    let second = bus::worker::process(&bus, retry, requeued).await;
    assert_eq!(second, Delivery::Faulted);

    let failed = transport.drain(&error_endpoint()).await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].headers.retries, 2);
    assert_eq!(failed[0].footer.errors.len(), 2);
    assert!(failed[0].footer.errors[0].message.contains("ping handler is broken"));
}

#[tokio::test]
async fn test_worker_pool_dispatches_until_shutdown() {
    let transport = InMemoryTransport::new();
    let log = Arc::new(OrderLog::default());
    let bus = MessageBus::builder(BusConfig {
        workers: 2,
        ..BusConfig::default()
    })
    .transport(Arc::new(transport.clone()))
    .consumes::<OrderAccepted, _>(log.clone())
    .build()
    .await
    .unwrap();
    let workers = bus.start_workers().await;
    assert_eq!(workers.len(), 2);

    for amount in [1, 2, 3] {
        bus.publish(&OrderAccepted {
            customer_id: Uuid::new_v4(),
            amount,
        })
        .await
        .unwrap();
    }

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while log.amounts.lock().unwrap().len() < 3 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    workers.shutdown().await;

    let mut amounts = log.amounts.lock().unwrap().clone();
    amounts.sort();
    assert_eq!(amounts, vec![1, 2, 3]);
}

const START: State = State::from_static("Start");
const AWAITING_PICKUP: State = State::from_static("AwaitingPickup");

#[derive(Debug, Serialize, Deserialize)]
struct StockCounted {
    sku: Uuid,
}

impl Message for StockCounted {
    fn message_type() -> &'static str {
        "StockCounted"
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ReorderStock {
    sku: Uuid,
}

impl Message for ReorderStock {
    fn message_type() -> &'static str {
        "ReorderStock"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Stocktake {
    sku: Uuid,
    counts: u32,
}

fn stocktake() -> SagaDefinition<Stocktake> {
    SagaDefinition::<Stocktake>::builder("Stocktake", START)
        .started_by::<StockCounted>()
        .shared_key("sku")
        .when::<StockCounted>(&START)
        .then_do(|data, counted| {
            data.sku = counted.sku;
            data.counts += 1;
        })
        .send(|data, _| ReorderStock { sku: data.sku })
        .build()
        .unwrap()
}

async fn stocktake_bus(
    transport: &InMemoryTransport,
    sagas: &InMemorySagaStore,
    warehouse: Option<&str>,
) -> MessageBus {
    let mut builder = MessageBus::builder(BusConfig::default())
        .transport(Arc::new(transport.clone()))
        .saga_store(Arc::new(sagas.clone()))
        .saga(stocktake());
    if let Some(endpoint) = warehouse {
        builder = builder.route::<ReorderStock>(endpoint);
    }
    builder.build().await.unwrap()
}

#[tokio::test]
async fn test_failed_saga_action_is_not_applied_twice_on_redelivery() {
    let transport = InMemoryTransport::new();
    let sagas = InMemorySagaStore::new();
    let unrouted = stocktake_bus(&transport, &sagas, None).await;
    let sku = Uuid::new_v4();
    let mut counted = envelope(&StockCounted { sku });

    for _ in 0..2 {
        let error = unrouted.dispatch(&mut counted).await.unwrap_err();
        match &error {
            DispatchError::ConsumerFailed {
                message_type,
                consumer,
                source,
            } => {
                assert_eq!(message_type, "StockCounted");
                assert_eq!(consumer, "Stocktake");
                assert_eq!(source.to_string(), "No route configured for ReorderStock");
            }
            other => panic!("expected consumer failure, got {other:?}"),
        }
        assert_eq!(error.consumer(), Some("Stocktake"));

        let records = sagas.find_all("Stocktake").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data["counts"], 1);
        assert!(records[0].owes_actions_for(counted.id));
    }

    let routed = stocktake_bus(&transport, &sagas, Some("memory://warehouse")).await;
    let report = routed.dispatch(&mut counted).await.unwrap();
    assert!(report.saga_outcomes[0].replayed);

    let records = sagas.find_all("Stocktake").await.unwrap();
    assert_eq!(records[0].data["counts"], 1);
    assert!(records[0].outbox.is_none());
    let reorders = transport.drain(&Endpoint::new("memory://warehouse")).await;
    assert_eq!(reorders.len(), 1);
    let reorder: ReorderStock = reorders[0].message.decode().unwrap();
    assert_eq!(reorder.sku, sku);
}

#[derive(Debug, Serialize, Deserialize)]
struct ShipOrder {
    order_id: Uuid,
}

impl Message for ShipOrder {
    fn message_type() -> &'static str {
        "ShipOrder"
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ShipmentBooked {
    order_id: Uuid,
}

impl Message for ShipmentBooked {
    fn message_type() -> &'static str {
        "ShipmentBooked"
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BookCourier {
    order_id: Uuid,
}

impl Message for BookCourier {
    fn message_type() -> &'static str {
        "BookCourier"
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PickupOverdue {
    order_id: Uuid,
}

impl Message for PickupOverdue {
    fn message_type() -> &'static str {
        "PickupOverdue"
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OrderPickedUp {
    order_id: Uuid,
}

impl Message for OrderPickedUp {
    fn message_type() -> &'static str {
        "OrderPickedUp"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Shipment {
    order_id: Uuid,
}

fn shipping() -> SagaDefinition<Shipment> {
    SagaDefinition::<Shipment>::builder("Shipping", START)
        .started_by::<ShipOrder>()
        .shared_key("order_id")
        .when::<ShipOrder>(&START)
        .then_do(|data, order| data.order_id = order.order_id)
        .reply(|data, _| ShipmentBooked {
            order_id: data.order_id,
        })
        .send_to("memory://couriers", |data, _| BookCourier {
            order_id: data.order_id,
        })
        .delay(Duration::hours(48), |data, _| PickupOverdue {
            order_id: data.order_id,
        })
        .transition_to(&AWAITING_PICKUP)
        .when::<OrderPickedUp>(&AWAITING_PICKUP)
        .complete()
        .build()
        .unwrap()
}

async fn shipping_harness() -> TestHarness {
    let transport = InMemoryTransport::new();
    let sagas = InMemorySagaStore::new();
    let timeouts = InMemoryTimeoutStore::new();
    let bus = MessageBus::builder(BusConfig::default())
        .transport(Arc::new(transport.clone()))
        .saga_store(Arc::new(sagas.clone()))
        .timeout_store(Arc::new(timeouts.clone()))
        .saga(shipping())
        .build()
        .await
        .unwrap();
    TestHarness {
        bus,
        transport,
        sagas,
        timeouts,
    }
}

#[tokio::test]
async fn test_saga_replies_to_sender_and_sends_to_explicit_endpoint() {
    let h = shipping_harness().await;
    let shop = Endpoint::new("memory://shop");
    let couriers = Endpoint::new("memory://couriers");
    let order_id = Uuid::new_v4();
    let mut request = envelope(&ShipOrder { order_id }).with_reply_to(shop.clone());

    let report = h.bus.dispatch(&mut request).await.unwrap();
    assert!(report.saga_outcomes[0].started);

    let replies = h.transport.drain(&shop).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].headers.in_reply_to, Some(request.id));
    let booked: ShipmentBooked = replies[0].message.decode().unwrap();
    assert_eq!(booked.order_id, order_id);

    let bookings = h.transport.drain(&couriers).await;
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].headers.destination, Some(couriers));
    assert!(bookings[0].message.is::<BookCourier>());

    let records = h.sagas.find_all("Shipping").await.unwrap();
    assert_eq!(records[0].state, AWAITING_PICKUP.name());
}

#[tokio::test]
async fn test_completed_saga_cancels_its_timeouts_and_is_removed() {
    let h = shipping_harness().await;
    let order_id = Uuid::new_v4();
    let mut request = envelope(&ShipOrder { order_id }).with_reply_to(Endpoint::new("memory://shop"));
    let started = h.bus.dispatch(&mut request).await.unwrap();
    let saga_id = started.saga_outcomes[0].saga_id;

    let timeouts = h.timeouts.find_all(&local()).await.unwrap();
    assert_eq!(timeouts.len(), 1);
    assert_eq!(timeouts[0].requestor().unwrap().saga_id, saga_id);
    assert!(timeouts[0].payload().is::<PickupOverdue>());

    let report = h
        .bus
        .dispatch(&mut envelope(&OrderPickedUp { order_id }))
        .await
        .unwrap();

    let outcome = &report.saga_outcomes[0];
    assert_eq!(outcome.saga_id, saga_id);
    assert!(outcome.completed);
    assert_eq!(h.timeouts.entry_count().await, 0);
    assert_eq!(h.sagas.record_count().await, 0);
}
