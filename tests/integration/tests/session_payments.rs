//! Integration test: paid session from first invoice to on-chain settlement.
//!
//! Drives a provider `PaymentEngine` against a consumer `InvoicePayer` over an
//! in-process peer, then settles what the session earned.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use tollgate_core::config::PaymentsConfig;
use tollgate_core::{Event, InvoiceStore, PromiseStore, Topic};
use tollgate_crypto::KeyPair;
use tollgate_integration_tests::{spawn_consumer, Provider, CHAIN};
use tollgate_payments::{
    CountingMeter, EngineConfig, InvoicePayer, PaymentError, PaymentMessage, Price, WirePeer,
};

const MINUTE_TARIFF: Price = Price { per_minute: 100, per_gib: 0 };

fn per_minute(price: u128) -> EngineConfig {
    EngineConfig {
        price: Price { per_minute: price, per_gib: 0 },
        max_unpaid: 1_000,
        ..EngineConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_metered_session_then_blocking_settle() {
    let provider = Provider::new(PaymentsConfig::default());
    let consumer = KeyPair::from_seed(&[7; 32]);
    let payer = InvoicePayer::new(
        KeyPair::from_seed(&[7; 32]),
        provider.payer_config(1_000, MINUTE_TARIFF),
    );

    let (engine, invoices) = provider.engine(
        per_minute(100),
        provider.session(&consumer),
        Arc::new(CountingMeter::new()),
    );
    let (promise_tx, promise_rx) = mpsc::channel(16);
    let (stop_tx, stop_rx) = watch::channel(false);

    let consumer_task = spawn_consumer(payer, invoices, promise_tx);
    let session = tokio::spawn(engine.run(promise_rx, stop_rx));

    tokio::time::sleep(Duration::from_secs(5 * 60 + 30)).await;
    stop_tx.send(true).unwrap();

    let summary = session.await.unwrap().expect("session should end cleanly");
    assert_eq!(summary.invoices_issued, 5);
    assert_eq!(summary.accrued, 500);
    assert_eq!(summary.paid, 500);
    assert_eq!(consumer_task.await.unwrap(), 5);

    assert_eq!(provider.store.promised_total(&provider.key).unwrap(), 500);

    let entry = provider
        .service
        .settle(CHAIN, provider.identity, provider.key.hermes_id, true)
        .await
        .unwrap()
        .expect("blocking settle returns the entry");
    assert_eq!(entry.amount, 500);
    assert_eq!(entry.provider_id, provider.identity);
    assert_eq!(provider.history.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_silent_consumer_tears_session_down() {
    let provider = Provider::new(PaymentsConfig::default());
    let consumer = KeyPair::from_seed(&[7; 32]);
    let mut payer = InvoicePayer::new(
        KeyPair::from_seed(&[7; 32]),
        provider.payer_config(1_000, MINUTE_TARIFF),
    );
    let session_info = provider.session(&consumer);
    let session_id = session_info.session_id.clone();

    let (engine, mut invoices) =
        provider.engine(per_minute(100), session_info, Arc::new(CountingMeter::new()));
    let (promise_tx, promise_rx) = mpsc::channel(16);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let mut ended = provider.bus.subscribe(&[Topic::SessionEnded]);

    // Pays the first invoice, then stops answering while keeping the line open.
    let quiet_consumer = tokio::spawn(async move {
        let first = invoices.recv().await.unwrap();
        promise_tx.send(payer.pay(&first).unwrap()).await.unwrap();
        let mut ignored = 0;
        while invoices.recv().await.is_some() {
            ignored += 1;
        }
        drop(promise_tx);
        ignored
    });

    let err = engine.run(promise_rx, stop_rx).await.unwrap_err();
    assert!(matches!(err, PaymentError::PromiseTimeout { missed: 3 }));
    assert_eq!(quiet_consumer.await.unwrap(), 3);

    assert!(provider.store.get_invoice(&session_id).unwrap().is_none());
    assert_eq!(provider.store.promised_total(&provider.key).unwrap(), 100);
    match ended.recv().await {
        Some(Event::SessionEnded(ev)) => {
            assert_eq!(ev.session_id, session_id);
            assert_eq!(ev.key, provider.key);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_promise_signed_by_stranger_is_fatal() {
    let provider = Provider::new(PaymentsConfig::default());
    let consumer = KeyPair::from_seed(&[7; 32]);
    let impostor = InvoicePayer::new(
        KeyPair::from_seed(&[8; 32]),
        provider.payer_config(1_000, MINUTE_TARIFF),
    );

    let (engine, invoices) = provider.engine(
        per_minute(100),
        provider.session(&consumer),
        Arc::new(CountingMeter::new()),
    );
    let (promise_tx, promise_rx) = mpsc::channel(16);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let _consumer = spawn_consumer(impostor, invoices, promise_tx);

    let err = engine.run(promise_rx, stop_rx).await.unwrap_err();
    assert!(matches!(err, PaymentError::InvalidPromise(_)));
    assert_eq!(provider.store.promised_total(&provider.key).unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_data_usage_is_billed() {
    let provider = Provider::new(PaymentsConfig::default());
    let consumer = KeyPair::from_seed(&[7; 32]);
    let tariff = Price { per_minute: 0, per_gib: 1 << 30 };
    let meter = Arc::new(CountingMeter::new());
    let payer = InvoicePayer::new(
        KeyPair::from_seed(&[7; 32]),
        provider.payer_config(10_000, tariff),
    )
    .with_meter(meter.clone());
    let config = EngineConfig {
        price: tariff,
        max_unpaid: 10_000,
        ..EngineConfig::default()
    };

    let (engine, invoices) = provider.engine(config, provider.session(&consumer), meter.clone());
    let (promise_tx, promise_rx) = mpsc::channel(16);
    let (stop_tx, stop_rx) = watch::channel(false);
    let _consumer = spawn_consumer(payer, invoices, promise_tx);
    let session = tokio::spawn(engine.run(promise_rx, stop_rx));

    meter.add(1_500);
    tokio::time::sleep(Duration::from_secs(90)).await;
    meter.add(2_500);
    tokio::time::sleep(Duration::from_secs(60)).await;
    stop_tx.send(true).unwrap();

    let summary = session.await.unwrap().unwrap();
    assert_eq!(summary.accrued, 4_000);
    assert_eq!(summary.paid, 4_000);
    assert_eq!(summary.invoices_issued, 2);
}

#[tokio::test(start_paused = true)]
async fn test_session_over_encoded_wire() {
    let provider = Provider::new(PaymentsConfig::default());
    let consumer = KeyPair::from_seed(&[7; 32]);
    let mut payer = InvoicePayer::new(
        KeyPair::from_seed(&[7; 32]),
        provider.payer_config(1_000, MINUTE_TARIFF),
    );

    let (peer, mut wire) = WirePeer::channel(16);
    let engine = provider.engine_with_peer(
        per_minute(100),
        provider.session(&consumer),
        Arc::new(peer),
        Arc::new(CountingMeter::new()),
    );
    let (promise_tx, promise_rx) = mpsc::channel(16);
    let (stop_tx, stop_rx) = watch::channel(false);

    let relay = tokio::spawn(async move {
        while let Some(bytes) = wire.recv().await {
            let reply = payer.answer(&bytes).unwrap();
            match PaymentMessage::decode(&reply).unwrap() {
                PaymentMessage::Promise(promise) => promise_tx.send(promise).await.unwrap(),
                other => panic!("unexpected reply: {:?}", other),
            }
        }
    });
    let session = tokio::spawn(engine.run(promise_rx, stop_rx));

    tokio::time::sleep(Duration::from_secs(2 * 60 + 30)).await;
    stop_tx.send(true).unwrap();

    let summary = session.await.unwrap().unwrap();
    assert_eq!(summary.paid, 200);
    assert_eq!(summary.invoices_issued, 2);
    relay.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_consumer_refuses_overcharging_provider() {
    let provider = Provider::new(PaymentsConfig::default());
    let consumer = KeyPair::from_seed(&[7; 32]);
    let agreed = Price { per_minute: 50, per_gib: 0 };
    let payer = InvoicePayer::new(
        KeyPair::from_seed(&[7; 32]),
        provider.payer_config(1_000, agreed),
    );

    let (engine, invoices) = provider.engine(
        per_minute(100),
        provider.session(&consumer),
        Arc::new(CountingMeter::new()),
    );
    let (promise_tx, promise_rx) = mpsc::channel(16);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let consumer_task = spawn_consumer(payer, invoices, promise_tx);

    let err = engine.run(promise_rx, stop_rx).await.unwrap_err();
    assert!(matches!(err, PaymentError::PromiseTimeout { .. }));
    assert_eq!(consumer_task.await.unwrap(), 0);
    assert_eq!(provider.store.promised_total(&provider.key).unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_consumer_refuses_tariff_above_its_bounds() {
    let provider = Provider::new(PaymentsConfig {
        consumer_price_per_minute_upper_bound: 99,
        ..PaymentsConfig::default()
    });
    let consumer = KeyPair::from_seed(&[7; 32]);
    let payer = InvoicePayer::new(
        KeyPair::from_seed(&[7; 32]),
        provider.payer_config(1_000, MINUTE_TARIFF),
    );

    let (engine, invoices) = provider.engine(
        per_minute(100),
        provider.session(&consumer),
        Arc::new(CountingMeter::new()),
    );
    let (promise_tx, promise_rx) = mpsc::channel(16);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let consumer_task = spawn_consumer(payer, invoices, promise_tx);

    let err = engine.run(promise_rx, stop_rx).await.unwrap_err();
    assert!(matches!(err, PaymentError::PromiseTimeout { .. }));
    assert_eq!(consumer_task.await.unwrap(), 0);
}

async fn paid_session(provider: &Provider, minutes: u64) -> u128 {
    let consumer = KeyPair::from_seed(&[7; 32]);
    let payer = InvoicePayer::new(
        KeyPair::from_seed(&[7; 32]),
        provider.payer_config(1_000, MINUTE_TARIFF),
    );
    let (engine, invoices) = provider.engine(
        per_minute(100),
        provider.session(&consumer),
        Arc::new(CountingMeter::new()),
    );
    let (promise_tx, promise_rx) = mpsc::channel(16);
    let (stop_tx, stop_rx) = watch::channel(false);
    let _consumer = spawn_consumer(payer, invoices, promise_tx);
    let session = tokio::spawn(engine.run(promise_rx, stop_rx));

    tokio::time::sleep(Duration::from_secs(minutes * 60 + 30)).await;
    stop_tx.send(true).unwrap();
    session.await.unwrap().unwrap().paid
}

#[tokio::test(start_paused = true)]
async fn test_sequential_sessions_accumulate_on_one_channel() {
    let provider = Provider::new(PaymentsConfig::default());

    assert_eq!(paid_session(&provider, 3).await, 300);
    assert_eq!(paid_session(&provider, 2).await, 200);
    assert_eq!(provider.store.promised_total(&provider.key).unwrap(), 500);

    let channel = provider.repository.force_refresh(&provider.key).await.unwrap();
    assert_eq!(channel.promises.len(), 2);
    assert_eq!(channel.promised(), 500);

    let entry = provider
        .service
        .settle(CHAIN, provider.identity, provider.key.hermes_id, true)
        .await
        .unwrap()
        .expect("blocking settle returns the entry");
    assert_eq!(entry.amount, 500);
    assert_eq!(provider.history.len(), 1);
    assert_eq!(provider.repository.cached(&provider.key).unwrap().unsettled(), 0);
}
