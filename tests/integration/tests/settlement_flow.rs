//! Integration test: promises reaching the channel repository, threshold and
//! forced settlement, beneficiary changes, registration, and the history
//! listing, all against the in-memory chain.

use chrono::{Duration as DateDuration, Utc};
use std::time::Duration;

use tollgate_core::config::PaymentsConfig;
use tollgate_core::events::PromiseReceived;
use tollgate_core::types::{Address, Amount, ChannelKey, Identity, Promise, RegistrationStatus, H256};
use tollgate_core::{BeneficiaryChangeState, Event, SettlementState, Topic};
use tollgate_integration_tests::{Provider, CHAIN};
use tollgate_settlement::adapters::ConfirmationMode;
use tollgate_settlement::{PageRequest, SettlementError, SettlementHistoryFilter};

fn promise(provider: &Provider, amount: Amount) -> Promise {
    Promise::new(CHAIN, provider.channel_id, amount, 0, H256([amount as u8; 32]))
}

async fn accept(provider: &Provider, key: ChannelKey, amount: Amount) {
    provider
        .repository
        .handle_promise_received(&PromiseReceived {
            key,
            agreement_id: 1,
            promise: promise(provider, amount),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_threshold_decides_automatic_settlement() {
    let provider = Provider::new(PaymentsConfig::default());
    provider.chain.set_channel_balance(CHAIN, provider.channel_id, 1_000);

    // 50 of 1050 is below the 10% threshold
    accept(&provider, provider.key, 50).await;
    assert!(provider.settler.maybe_settle(provider.key).await.unwrap().is_none());
    assert_eq!(provider.chain.settle_calls(), 0);

    // 150 of 1150 is above it
    accept(&provider, provider.key, 150).await;
    let entry = provider.settler.maybe_settle(provider.key).await.unwrap().unwrap();
    assert_eq!(entry.amount, 150);

    let channel = provider.repository.cached(&provider.key).unwrap();
    assert_eq!(channel.unsettled(), 0);
    assert_eq!(channel.settled, 150);
}

#[tokio::test(start_paused = true)]
async fn test_promise_events_drive_background_settlement() {
    let provider = Provider::new(PaymentsConfig::default());
    provider.chain.set_channel_balance(CHAIN, provider.channel_id, 1_000);
    let mut completed = provider.bus.subscribe(&[Topic::SettlementCompleted]);
    let tasks = provider.spawn_background();

    for amount in [50, 150] {
        provider.bus.publish(Event::PromiseReceived(PromiseReceived {
            key: provider.key,
            agreement_id: 1,
            promise: promise(&provider, amount),
        }));
    }

    match completed.recv().await {
        Some(Event::SettlementCompleted(ev)) => {
            assert_eq!(ev.key, provider.key);
            assert_eq!(ev.settled_total, 150);
            assert_eq!(ev.entry.amount, 150);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(provider.history.len(), 1);

    provider.shutdown.send(true).unwrap();
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_blocking_settle_gives_up_after_two_minutes() {
    let provider = Provider::new(PaymentsConfig::default());
    provider.chain.set_settlement_mode(ConfirmationMode::Never);
    accept(&provider, provider.key, 500).await;

    let started = tokio::time::Instant::now();
    let err = provider
        .service
        .settle(CHAIN, provider.identity, provider.key.hermes_id, true)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::SettlementTimeout(d) if d == Duration::from_secs(120)));
    assert!(started.elapsed() >= Duration::from_secs(120));

    // the slot is released and the attempt recorded
    assert_eq!(provider.settler.state(&provider.key), SettlementState::Idle);
    let outcome = provider.settler.last_outcome(&provider.key).unwrap();
    assert_eq!(outcome.state, SettlementState::TimedOut);
    assert!(provider.history.is_empty());

    provider.chain.set_settlement_mode(ConfirmationMode::Immediate);
    let entry = provider
        .service
        .settle(CHAIN, provider.identity, provider.key.hermes_id, true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.amount, 500);
}

#[tokio::test]
async fn test_underfunded_hermes_is_surfaced() {
    let provider = Provider::new(PaymentsConfig::default());
    provider.chain.set_hermes_funds(CHAIN, provider.key.hermes_id, 100);
    accept(&provider, provider.key, 500).await;

    let err = provider
        .service
        .settle(CHAIN, provider.identity, provider.key.hermes_id, true)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::InsufficientBalance { available: 100, required: 500 }));
    assert!(provider.history.is_empty());
}

#[tokio::test]
async fn test_beneficiary_change_settles_and_switches_payout() {
    let provider = Provider::new(PaymentsConfig::default());
    let payout = Address([0x99; 20]);
    accept(&provider, provider.key, 300).await;

    let status = provider
        .service
        .settle_with_beneficiary(CHAIN, provider.identity, payout, provider.key.hermes_id)
        .await
        .unwrap();
    assert_eq!(status.state, BeneficiaryChangeState::Completed);
    assert_eq!(provider.service.beneficiary(CHAIN, provider.identity).await.unwrap(), payout);
    assert_eq!(
        provider.service.beneficiary_change_status(&provider.identity).map(|s| s.state),
        Some(BeneficiaryChangeState::Completed)
    );

    let page = provider
        .service
        .list_settlement_history(&SettlementHistoryFilter::default(), PageRequest::default());
    assert_eq!(page.total_items, 1);
    assert_eq!(page.items[0].amount, 300);
}

#[tokio::test]
async fn test_registration_through_service() {
    let provider = Provider::new(PaymentsConfig::default());
    provider
        .service
        .register_identity(CHAIN, provider.identity, provider.identity.address(), 0, None)
        .await
        .unwrap();
    provider
        .service
        .register_identity(CHAIN, provider.identity, provider.identity.address(), 0, None)
        .await
        .unwrap();

    let status = provider
        .addresses
        .registration_status(CHAIN, provider.identity)
        .await
        .unwrap();
    assert_eq!(status, RegistrationStatus::Registered);
    assert_eq!(provider.chain.register_calls(), 1);
}

#[tokio::test]
async fn test_history_listing_filters_and_pages() {
    let provider = Provider::new(PaymentsConfig::default());
    let other = Identity::from_address(Address([0x52; 20]));
    let other_key = ChannelKey::new(CHAIN, other, provider.key.hermes_id);

    accept(&provider, provider.key, 200).await;
    accept(&provider, other_key, 300).await;
    for identity in [provider.identity, other] {
        provider
            .service
            .settle(CHAIN, identity, provider.key.hermes_id, true)
            .await
            .unwrap()
            .unwrap();
    }

    let all = SettlementHistoryFilter::default();
    assert_eq!(provider.service.list_settlement_history(&all, PageRequest::default()).total_items, 2);

    let mine = SettlementHistoryFilter::default().with_provider(provider.identity);
    let page = provider.service.list_settlement_history(&mine, PageRequest::default());
    assert_eq!(page.total_items, 1);
    assert_eq!(page.items[0].amount, 200);

    let by_hermes = SettlementHistoryFilter::default().with_hermes(provider.key.hermes_id);
    assert_eq!(
        provider.service.list_settlement_history(&by_hermes, PageRequest::default()).total_items,
        2
    );
    let wrong_hermes = SettlementHistoryFilter::default().with_hermes(Address([0xee; 20]));
    assert_eq!(
        provider.service.list_settlement_history(&wrong_hermes, PageRequest::default()).total_items,
        0
    );

    let today = Utc::now().date_naive();
    let todays = SettlementHistoryFilter::from_dates(Some(today), Some(today));
    assert_eq!(provider.service.list_settlement_history(&todays, PageRequest::default()).total_items, 2);
    let yesterday = today - DateDuration::days(1);
    let before = SettlementHistoryFilter::from_dates(None, Some(yesterday));
    assert_eq!(provider.service.list_settlement_history(&before, PageRequest::default()).total_items, 0);

    let first = provider.service.list_settlement_history(&all, PageRequest::new(1, 1));
    let second = provider.service.list_settlement_history(&all, PageRequest::new(2, 1));
    assert_eq!(first.total_pages, 2);
    assert_eq!(first.items.len(), 1);
    assert_eq!(second.items.len(), 1);
    assert_ne!(first.items[0].tx_hash, second.items[0].tx_hash);
}
