#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    use crate::context::{EngineContext, SequentialIdProvider, SimulatedTimeProvider};
    use crate::decision::Decision;
    use crate::directory::ExchangeDirectory;
    use crate::model::{DecimalValue, OrderInstruction, Side, SignalMeta, SignalStatus, TradeSignal};
    use crate::outcome::{AckAction, ProcessStatus, RejectCode};
    use crate::persistence::balance_store::{
        BalanceSnapshot, BalanceStore, BucketReservation, RedbBalanceStore, ReserveOutcome,
    };
    use crate::persistence::event_log::{EventLog, SignalEventType};
    use crate::persistence::memory::{
        InjectedFailure, MemoryBalanceStore, MemoryEventLog, MemoryReferenceStore,
        MemorySignalStore,
    };
    use crate::persistence::redb_store::RedbStore;
    use crate::persistence::reference::{
        Currency, Exchange, ExchangeAccount, ExchangeStatus, Pair, PairRule, ReferenceStore,
    };
    use crate::persistence::signal_store::{SignalStore, StoredSignal};
    use crate::pipeline::SignalPipeline;
    use crate::plan::BucketKey;
    use crate::reservation::{BalanceReservation, RESERVE_REASON};
    use crate::validators::integrity::OrdersIntegrity;
    use crate::validators::market::MarketRules;

    const NOW_MS: i64 = 1_700_000_000_000;

    struct Harness {
        pipeline: SignalPipeline,
        signals: Arc<MemorySignalStore>,
        balances: Arc<MemoryBalanceStore>,
        events: Arc<MemoryEventLog>,
        time: Arc<SimulatedTimeProvider>,
    }

    fn seed_reference(reference: &MemoryReferenceStore) {
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
    }

    fn harness() -> Harness {
        let time = Arc::new(SimulatedTimeProvider::new(NOW_MS));
        let engine = EngineContext {
            time: time.clone(),
            id: Arc::new(SequentialIdProvider::new()),
        };

        let reference = Arc::new(MemoryReferenceStore::new());
        seed_reference(&reference);
        let directory = Arc::new(ExchangeDirectory::new(reference));

        let signals = Arc::new(MemorySignalStore::new());
        let balances = Arc::new(MemoryBalanceStore::new());
        let events = Arc::new(MemoryEventLog::new(time.clone()));

        let pipeline = SignalPipeline::new(
            engine,
            signals.clone(),
            events.clone(),
            OrdersIntegrity::new(directory.clone()),
            MarketRules::new(directory),
            BalanceReservation::new(balances.clone()),
            Decision::new(signals.clone(), events.clone()),
        );

        Harness {
            pipeline,
            signals,
            balances,
            events,
            time,
        }
    }

    fn fund(harness: &Harness, account_id: u64, currency_id: u64, available: Decimal) {
        harness
            .balances
            .upsert(BalanceSnapshot {
                account_id,
                currency_id,
                available,
                reserved: dec!(0),
            })
            .unwrap();
    }

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

    /// BUY 2 BTC-USDT @ 10 on alphax, SELL 2 BTC-USDT @ 10 on betax.
    fn two_leg_signal(external_id: &str) -> TradeSignal {
        TradeSignal {
            meta: Some(SignalMeta {
                signal_id: Some(external_id.to_string()),
                created_at: Some(chrono::Utc.timestamp_millis_opt(NOW_MS).unwrap()),
                ttl_ms: Some(5_000),
                pair: Some("BTC-USDT".to_string()),
                ..Default::default()
            }),
            orders: vec![
                leg("alphax", Side::Buy, "2", "10"),
                leg("betax", Side::Sell, "2", "10"),
            ],
            source: Some("tests".to_string()),
            ..Default::default()
        }
    }

    fn event_types(harness: &Harness, signal_id: uuid::Uuid) -> Vec<SignalEventType> {
        harness
            .events
            .events_for(signal_id)
            .unwrap()
            .iter()
            .map(|e| e.event_type)
            .collect()
    }

    // --- Happy path ---

    #[test]
    fn accepted_signal_reserves_funds_and_records_events() {
        let h = harness();
        fund(&h, 11, 2, dec!(100)); // USDT for the BUY leg
        fund(&h, 21, 1, dec!(10)); // BTC for the SELL leg

        let result = h.pipeline.process(two_leg_signal("sig-accept"));
        assert_eq!(result.status, ProcessStatus::Accepted);
        assert_eq!(result.ack_action, AckAction::Ack);
        let id = result.signal_id.expect("signal id");

        // Buy leg spends 20 USDT, sell leg spends 2 BTC.
        let usdt = h.balances.balance(BucketKey::new(11, 2)).unwrap().unwrap();
        assert_eq!(usdt.available, dec!(80));
        assert_eq!(usdt.reserved, dec!(20));
        let btc = h.balances.balance(BucketKey::new(21, 1)).unwrap().unwrap();
        assert_eq!(btc.available, dec!(8));
        assert_eq!(btc.reserved, dec!(2));

        assert_eq!(
            event_types(&h, id),
            vec![
                SignalEventType::Received,
                SignalEventType::IntegrityOk,
                SignalEventType::FreshnessOk,
                SignalEventType::BalanceOk,
                SignalEventType::MarketOk,
                SignalEventType::Accepted,
            ]
        );

        // Legs persisted with resolved identifiers.
        let legs = h.signals.legs_for(id).unwrap();
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].exchange_account_id, 11);
        assert_eq!(legs[1].exchange_account_id, 21);

        // Status untouched by acceptance; execution owns the next transition.
        let row = h.signals.get(id).unwrap().unwrap();
        assert_eq!(row.status, SignalStatus::Received);
    }

    // --- Idempotency ---

    #[test]
    fn redelivery_yields_same_id_and_single_debit() {
        let h = harness();
        fund(&h, 11, 2, dec!(100));
        fund(&h, 21, 1, dec!(10));

        let first = h.pipeline.process(two_leg_signal("sig-dup"));
        let second = h.pipeline.process(two_leg_signal("sig-dup"));

        assert_eq!(first.status, ProcessStatus::Accepted);
        assert_eq!(second.status, ProcessStatus::Accepted);
        assert_eq!(first.signal_id, second.signal_id);

        // Exactly one debit despite two full pipeline runs.
        let usdt = h.balances.balance(BucketKey::new(11, 2)).unwrap().unwrap();
        assert_eq!(usdt.available, dec!(80));
        assert_eq!(usdt.reserved, dec!(20));
        let btc = h.balances.balance(BucketKey::new(21, 1)).unwrap().unwrap();
        assert_eq!(btc.available, dec!(8));
        assert_eq!(btc.reserved, dec!(2));

        // One RECEIVED event; the redelivery is not a new signal.
        let received = event_types(&h, first.signal_id.unwrap())
            .iter()
            .filter(|t| **t == SignalEventType::Received)
            .count();
        assert_eq!(received, 1);
    }

    // --- All-or-nothing reservation ---

    #[test]
    fn empty_bucket_rejects_without_touching_funded_bucket() {
        let h = harness();
        fund(&h, 11, 2, dec!(100)); // BUY bucket funded
        fund(&h, 21, 1, dec!(0)); // SELL bucket empty

        let result = h.pipeline.process(two_leg_signal("sig-insufficient"));
        assert_eq!(result.status, ProcessStatus::Rejected);
        assert_eq!(result.ack_action, AckAction::Ack);
        assert_eq!(result.rejections[0].code, RejectCode::InsufficientFunds);

        // The funded bucket is untouched: no partial reservation leaks.
        let usdt = h.balances.balance(BucketKey::new(11, 2)).unwrap().unwrap();
        assert_eq!(usdt.available, dec!(100));
        assert_eq!(usdt.reserved, dec!(0));

        let id = result.signal_id.unwrap();
        let row = h.signals.get(id).unwrap().unwrap();
        assert_eq!(row.status, SignalStatus::Rejected);
        assert!(event_types(&h, id).contains(&SignalEventType::BalanceFailed));
    }

    #[test]
    fn partial_bucket_failure_rolls_back_prior_buckets() {
        let h = harness();
        fund(&h, 11, 2, dec!(50));
        fund(&h, 21, 1, dec!(10));

        // Drive the store directly: first bucket clears, second does not.
        let outcome = h
            .balances
            .try_reserve(
                uuid::Uuid::new_v4(),
                RESERVE_REASON,
                &[
                    BucketReservation {
                        key: BucketKey::new(11, 2),
                        amount: dec!(30),
                    },
                    BucketReservation {
                        key: BucketKey::new(21, 1),
                        amount: dec!(999),
                    },
                ],
                NOW_MS + 5_000,
            )
            .unwrap();
        assert!(!outcome.is_reserved());

        let usdt = h.balances.balance(BucketKey::new(11, 2)).unwrap().unwrap();
        assert_eq!(usdt.available, dec!(50));
        assert_eq!(usdt.reserved, dec!(0));
    }

    // --- Proportional sizing ---

    #[test]
    fn short_funds_scale_the_whole_signal() {
        let h = harness();
        fund(&h, 11, 2, dec!(15)); // required 20 -> alpha 0.75
        fund(&h, 21, 1, dec!(10));

        let result = h.pipeline.process(two_leg_signal("sig-scale"));
        assert_eq!(result.status, ProcessStatus::Accepted);
        assert_eq!(
            result.meta.get("alpha").and_then(|v| v.as_str()),
            Some("0.75")
        );
        assert_eq!(
            result.meta.get("scaled").and_then(|v| v.as_bool()),
            Some(true)
        );

        // Sized spend reserved: 1.5 * 10 = 15 USDT, 1.5 BTC.
        let usdt = h.balances.balance(BucketKey::new(11, 2)).unwrap().unwrap();
        assert_eq!(usdt.available, dec!(0));
        assert_eq!(usdt.reserved, dec!(15));
        let btc = h.balances.balance(BucketKey::new(21, 1)).unwrap().unwrap();
        assert_eq!(btc.available, dec!(8.5));
        assert_eq!(btc.reserved, dec!(1.5));
    }

    // --- Short-circuiting ---

    #[test]
    fn integrity_failure_skips_freshness_and_balance() {
        let h = harness();
        fund(&h, 11, 2, dec!(100));

        let mut signal = two_leg_signal("sig-badref");
        signal.orders[1].exchange_name = Some("ghost".to_string());

        let result = h.pipeline.process(signal);
        assert_eq!(result.status, ProcessStatus::Rejected);
        assert_eq!(result.rejections[0].code, RejectCode::ReferenceNotFound);
        assert_eq!(result.rejections[0].leg_index, Some(1));

        // Balance store never consulted once integrity failed.
        assert_eq!(h.balances.find_available_calls(), 0);
        assert_eq!(h.balances.try_reserve_calls(), 0);

        let types = event_types(&h, result.signal_id.unwrap());
        assert!(types.contains(&SignalEventType::IntegrityFailed));
        assert!(!types.contains(&SignalEventType::FreshnessOk));
        assert!(!types.contains(&SignalEventType::FreshnessFailed));
    }

    #[test]
    fn stale_signal_never_reaches_balance() {
        let h = harness();
        fund(&h, 11, 2, dec!(100));
        fund(&h, 21, 1, dec!(10));

        // created 10s ago, ttl 5s
        h.time.set_time(NOW_MS + 10_000);
        let result = h.pipeline.process(two_leg_signal("sig-stale"));

        assert_eq!(result.status, ProcessStatus::Rejected);
        assert_eq!(result.ack_action, AckAction::Ack);
        assert_eq!(result.rejections[0].code, RejectCode::Stale);
        assert_eq!(h.balances.find_available_calls(), 0);

        let usdt = h.balances.balance(BucketKey::new(11, 2)).unwrap().unwrap();
        assert_eq!(usdt.available, dec!(100));
    }

    #[test]
    fn wrong_leg_count_is_invalid_input() {
        let h = harness();
        let mut signal = two_leg_signal("sig-onelegged");
        signal.orders.truncate(1);

        let result = h.pipeline.process(signal);
        assert_eq!(result.status, ProcessStatus::Rejected);
        assert_eq!(result.rejections[0].code, RejectCode::InvalidInput);
    }

    // --- Persist-phase error branches ---

    #[test]
    fn persist_reference_failure_is_acked_rejection() {
        let h = harness();
        h.signals
            .fail_next_save(InjectedFailure::Reference("unknown exchange".to_string()));

        let result = h.pipeline.process(two_leg_signal("sig-ref"));
        assert_eq!(result.status, ProcessStatus::Rejected);
        assert_eq!(result.ack_action, AckAction::Ack);
        assert_eq!(result.rejections[0].code, RejectCode::ReferenceNotFound);
        assert!(result.signal_id.is_none());
    }

    #[test]
    fn persist_outage_is_unacked_retry() {
        let h = harness();
        h.signals
            .fail_next_save(InjectedFailure::Unavailable("store down".to_string()));

        let result = h.pipeline.process(two_leg_signal("sig-outage"));
        assert_eq!(result.status, ProcessStatus::Retry);
        assert_eq!(result.ack_action, AckAction::NoAck);
        assert_eq!(result.rejections[0].code, RejectCode::InternalError);
    }

    #[test]
    fn legs_persist_outage_is_unacked_retry() {
        let h = harness();
        fund(&h, 11, 2, dec!(100));
        fund(&h, 21, 1, dec!(10));
        h.signals
            .fail_next_save_legs(InjectedFailure::Unavailable("store down".to_string()));

        let result = h.pipeline.process(two_leg_signal("sig-legs-outage"));
        assert_eq!(result.status, ProcessStatus::Retry);
        assert_eq!(result.ack_action, AckAction::NoAck);
        // Nothing was reserved before the fault.
        assert_eq!(h.balances.try_reserve_calls(), 0);
    }

    // --- Market rules ---

    #[test]
    fn min_notional_rejects_after_sizing() {
        let h = harness();
        fund(&h, 11, 2, dec!(100));
        fund(&h, 21, 1, dec!(10));

        let reference = Arc::new(MemoryReferenceStore::new());
        seed_reference(&reference);
        reference
            .upsert_pair_rule(&PairRule {
                exchange_id: 1,
                pair_id: 1,
                tick_size: None,
                step_size: None,
                min_notional: Some(dec!(1000)),
                max_order_size: None,
            })
            .unwrap();
        let directory = Arc::new(ExchangeDirectory::new(reference));
        let pipeline = SignalPipeline::new(
            EngineContext {
                time: h.time.clone(),
                id: Arc::new(SequentialIdProvider::new()),
            },
            h.signals.clone(),
            h.events.clone(),
            OrdersIntegrity::new(directory.clone()),
            MarketRules::new(directory),
            BalanceReservation::new(h.balances.clone()),
            Decision::new(h.signals.clone(), h.events.clone()),
        );

        let result = pipeline.process(two_leg_signal("sig-min-notional"));
        assert_eq!(result.status, ProcessStatus::Rejected);
        assert_eq!(result.rejections[0].code, RejectCode::MinNotional);
        assert!(event_types(&h, result.signal_id.unwrap())
            .contains(&SignalEventType::MarketFailed));
    }

    // --- Redb-backed stores ---

    fn tmp_store() -> Arc<RedbStore> {
        let path = format!("/tmp/arbiter_signal_test_{}.redb", uuid::Uuid::new_v4());
        Arc::new(RedbStore::new(&path).expect("create redb store"))
    }

    #[test]
    fn redb_signal_save_is_idempotent_by_external_id() {
        use crate::persistence::signal_store::RedbSignalStore;

        let store = RedbSignalStore::new(tmp_store());
        let row = StoredSignal {
            id: uuid::Uuid::new_v4(),
            external_id: Some("ext-1".to_string()),
            ttl_ms: Some(5_000),
            status: SignalStatus::Received,
            source: None,
            constraints: None,
            expected_pnl: None,
            producer_created_at: None,
        };
        let first = store.save(&row).unwrap();
        assert!(!first.deduplicated);

        let replay = StoredSignal {
            id: uuid::Uuid::new_v4(),
            ..row.clone()
        };
        let second = store.save(&replay).unwrap();
        assert!(second.deduplicated);
        assert_eq!(first.id, second.id);

        let found = store.find_by_external_id("ext-1").unwrap().unwrap();
        assert_eq!(found.id, first.id);
    }

    #[test]
    fn redb_reserve_is_all_or_nothing_and_idempotent() {
        let store = RedbBalanceStore::new(tmp_store());
        store
            .upsert(BalanceSnapshot {
                account_id: 11,
                currency_id: 2,
                available: dec!(50),
                reserved: dec!(0),
            })
            .unwrap();
        store
            .upsert(BalanceSnapshot {
                account_id: 21,
                currency_id: 1,
                available: dec!(1),
                reserved: dec!(0),
            })
            .unwrap();
        let signal_id = uuid::Uuid::new_v4();

        // Second bucket cannot clear: nothing must be held afterwards.
        let outcome = store
            .try_reserve(
                signal_id,
                RESERVE_REASON,
                &[
                    BucketReservation {
                        key: BucketKey::new(11, 2),
                        amount: dec!(30),
                    },
                    BucketReservation {
                        key: BucketKey::new(21, 1),
                        amount: dec!(5),
                    },
                ],
                NOW_MS,
            )
            .unwrap();
        assert!(matches!(outcome, ReserveOutcome::Insufficient { .. }));
        let usdt = store.balance(BucketKey::new(11, 2)).unwrap().unwrap();
        assert_eq!(usdt.available, dec!(50));
        assert_eq!(usdt.reserved, dec!(0));
        assert!(store
            .lock_for(BucketKey::new(11, 2), RESERVE_REASON, signal_id)
            .unwrap()
            .is_none());

        // Feasible set reserves once; the retry is a no-op.
        let reservations = [
            BucketReservation {
                key: BucketKey::new(11, 2),
                amount: dec!(30),
            },
            BucketReservation {
                key: BucketKey::new(21, 1),
                amount: dec!(1),
            },
        ];
        let first = store
            .try_reserve(signal_id, RESERVE_REASON, &reservations, NOW_MS)
            .unwrap();
        assert!(first.is_reserved());
        let second = store
            .try_reserve(signal_id, RESERVE_REASON, &reservations, NOW_MS)
            .unwrap();
        assert!(second.is_reserved());

        let usdt = store.balance(BucketKey::new(11, 2)).unwrap().unwrap();
        assert_eq!(usdt.available, dec!(20));
        assert_eq!(usdt.reserved, dec!(30));
        let lock = store
            .lock_for(BucketKey::new(11, 2), RESERVE_REASON, signal_id)
            .unwrap()
            .expect("lock row");
        assert_eq!(lock.amount, dec!(30));
    }
}
