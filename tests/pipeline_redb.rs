use rust_decimal_macros::dec;
use std::sync::Arc;

use arbiter_signal_rs::context::{EngineContext, SequentialIdProvider, SimulatedTimeProvider};
use arbiter_signal_rs::decision::Decision;
use arbiter_signal_rs::directory::ExchangeDirectory;
use arbiter_signal_rs::model::{DecimalValue, OrderInstruction, Side, SignalMeta, TradeSignal};
use arbiter_signal_rs::outcome::{AckAction, ProcessStatus};
use arbiter_signal_rs::persistence::balance_store::{BalanceSnapshot, BalanceStore, RedbBalanceStore};
use arbiter_signal_rs::persistence::event_log::{EventLog, RedbEventLog, SignalEventType};
use arbiter_signal_rs::persistence::redb_store::RedbStore;
use arbiter_signal_rs::persistence::reference::{
    Currency, Exchange, ExchangeAccount, ExchangeStatus, Pair, RedbReferenceStore, ReferenceStore,
};
use arbiter_signal_rs::persistence::signal_store::{RedbSignalStore, SignalStore};
use arbiter_signal_rs::pipeline::SignalPipeline;
use arbiter_signal_rs::plan::BucketKey;
use arbiter_signal_rs::reservation::BalanceReservation;
use arbiter_signal_rs::validators::integrity::OrdersIntegrity;
use arbiter_signal_rs::validators::market::MarketRules;

const NOW_MS: i64 = 1_700_000_000_000;

fn leg(exchange: &str, side: Side, qty: &str, price: &str) -> OrderInstruction {
    OrderInstruction {
        exchange_name: Some(exchange.to_string()),
        pair_name: Some("BTC-USDT".to_string()),
        side: Some(side),
        price: Some(DecimalValue::from_text(price)),
        base_amount: Some(DecimalValue::from_text(qty)),
        quote_amount: None,
        time_in_force: None,
    }
}

fn signal(external_id: &str) -> TradeSignal {
    TradeSignal {
        meta: Some(SignalMeta {
            signal_id: Some(external_id.to_string()),
            created_at: Some(chrono::TimeZone::timestamp_millis_opt(&chrono::Utc, NOW_MS).unwrap()),
            ttl_ms: Some(5_000),
            pair: Some("BTC-USDT".to_string()),
            ..Default::default()
        }),
        orders: vec![
            leg("alphax", Side::Buy, "2", "10"),
            leg("betax", Side::Sell, "2", "10"),
        ],
        source: Some("integration".to_string()),
        ..Default::default()
    }
}

#[test]
fn full_pipeline_against_embedded_store() {
    let db_path = format!("/tmp/arbiter_pipeline_test_{}.redb", uuid::Uuid::new_v4());
    let store = Arc::new(RedbStore::new(&db_path).expect("open store"));

    let time = Arc::new(SimulatedTimeProvider::new(NOW_MS));
    let engine = EngineContext {
        time: time.clone(),
        id: Arc::new(SequentialIdProvider::new()),
    };

    let signals = Arc::new(RedbSignalStore::new(store.clone()));
    let balances = Arc::new(RedbBalanceStore::new(store.clone()));
    let events = Arc::new(RedbEventLog::new(store.clone(), time.clone()));
    let reference = Arc::new(RedbReferenceStore::new(store.clone()));

    for (id, code) in [(1, "BTC"), (2, "USDT")] {
        reference
            .upsert_currency(&Currency {
                id,
                code: code.to_string(),
            })
            .unwrap();
    }
    for (id, name) in [(1, "alphax"), (2, "betax")] {
        reference
            .upsert_exchange(&Exchange {
                id,
                name: name.to_string(),
                status: ExchangeStatus::Active,
            })
            .unwrap();
    }
    reference
        .upsert_account(&ExchangeAccount {
            id: 11,
            exchange_id: 1,
            label: "main".to_string(),
            is_primary: true,
        })
        .unwrap();
    reference
        .upsert_account(&ExchangeAccount {
            id: 21,
            exchange_id: 2,
            label: "main".to_string(),
            is_primary: true,
        })
        .unwrap();
    reference
        .upsert_pair(&Pair {
            id: 1,
            symbol: "BTC-USDT".to_string(),
            base_currency_id: 1,
            quote_currency_id: 2,
        })
        .unwrap();

    balances
        .upsert(BalanceSnapshot {
            account_id: 11,
            currency_id: 2,
            available: dec!(100),
            reserved: dec!(0),
        })
        .unwrap();
    balances
        .upsert(BalanceSnapshot {
            account_id: 21,
            currency_id: 1,
            available: dec!(10),
            reserved: dec!(0),
        })
        .unwrap();

    let directory = Arc::new(ExchangeDirectory::new(reference));
    let pipeline = SignalPipeline::new(
        engine,
        signals.clone(),
        events.clone(),
        OrdersIntegrity::new(directory.clone()),
        MarketRules::new(directory),
        BalanceReservation::new(balances.clone()),
        Decision::new(signals.clone(), events.clone()),
    );

    // First delivery: accepted, funds reserved.
    let first = pipeline.process(signal("it-sig-1"));
    assert_eq!(first.status, ProcessStatus::Accepted);
    assert_eq!(first.ack_action, AckAction::Ack);
    let id = first.signal_id.expect("signal id");

    let usdt = balances.balance(BucketKey::new(11, 2)).unwrap().unwrap();
    assert_eq!(usdt.available, dec!(80));
    assert_eq!(usdt.reserved, dec!(20));

    // Redelivery: same id, no second debit.
    let second = pipeline.process(signal("it-sig-1"));
    assert_eq!(second.signal_id, Some(id));
    let usdt = balances.balance(BucketKey::new(11, 2)).unwrap().unwrap();
    assert_eq!(usdt.available, dec!(80));
    assert_eq!(usdt.reserved, dec!(20));

    // The ledger carries the whole story for the signal.
    let types: Vec<SignalEventType> = events
        .events_for(id)
        .unwrap()
        .iter()
        .map(|e| e.event_type)
        .collect();
    assert!(types.contains(&SignalEventType::Received));
    assert!(types.contains(&SignalEventType::BalanceOk));
    assert!(types.contains(&SignalEventType::Accepted));

    // Signal and resolved legs survive a reopen of the database.
    drop(pipeline);
    let found = signals.find_by_external_id("it-sig-1").unwrap().unwrap();
    assert_eq!(found.id, id);
    let legs = signals.legs_for(id).unwrap();
    assert_eq!(legs.len(), 2);
    assert_eq!(legs[0].required_spend, dec!(20));
    assert_eq!(legs[1].required_spend, dec!(2));

    let _ = std::fs::remove_file(&db_path);
}
