//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Stock bounds: 0 <= remaining <= initial after any operation sequence
//! - Additivity: remaining == initial - Σ(live extractions)
//! - Conservation: live children never claim more than their parent
//! - Monotonicity: statuses only follow the lot state graph

mod common;

use common::*;
use lot_ledger::machine::LotUpdate;
use lot_ledger::{DeliveryType, Error, ErrorCode, LotId, LotStatus, OutcomeParams, Party};
use proptest::prelude::*;
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
enum StockOp {
    Extract(Decimal),
    Delete(usize),
    Reject(usize),
    Resize(usize, Decimal),
}

/// Amounts with up to three decimals
fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..600_000i64).prop_map(|millis| Decimal::new(millis, 3))
}

fn stock_op_strategy() -> impl Strategy<Value = StockOp> {
    prop_oneof![
        4 => amount_strategy().prop_map(StockOp::Extract),
        1 => (0usize..32).prop_map(StockOp::Delete),
        1 => (0usize..32).prop_map(StockOp::Reject),
        2 => ((0usize..32), amount_strategy()).prop_map(|(i, a)| StockOp::Resize(i, a)),
    ]
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Submit,
    Accept(DeliveryType),
    Freeze(DeliveryType),
    Reject,
    Delete,
}

fn action_strategy() -> impl Strategy<Value = Action> {
    let outcome = prop_oneof![
        Just(DeliveryType::Rfc),
        Just(DeliveryType::Blending),
        Just(DeliveryType::Stock),
        Just(DeliveryType::Trading),
    ];
    prop_oneof![
        Just(Action::Submit),
        outcome.clone().prop_map(Action::Accept),
        outcome.prop_map(Action::Freeze),
        Just(Action::Reject),
        Just(Action::Delete),
    ]
}

fn actor_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("PRODUCER"), Just("OPERATOR"), Just("TRADER")]
}

/// Extracted lot tracked by the model
struct Extraction {
    id: LotId,
    amount: Decimal,
    draft: bool,
}

fn expect_code(result: lot_ledger::Result<impl std::fmt::Debug>, code: ErrorCode) -> Result<(), TestCaseError> {
    match result {
        Err(e) => prop_assert_eq!(e.code(), code),
        Ok(v) => prop_assert!(false, "expected {}, got {:?}", code, v),
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: any sequence of extractions, deletions, rejections and
    /// resizes keeps the position in bounds and equal to the model
    #[test]
    fn prop_stock_stays_additive(ops in prop::collection::vec(stock_op_strategy(), 1..24)) {
        let t = open();
        let (_, position) = stocked(&t, 1000);
        let operator = eid("OPERATOR");
        let initial = position.initial_amount;
        let mut remaining = initial;
        let mut extractions: Vec<Extraction> = Vec::new();

        for op in ops {
            match op {
                StockOp::Extract(amount) => match t.extract(position.id, amount, &operator) {
                    Ok(lot) => {
                        prop_assert!(amount <= remaining);
                        remaining -= amount;
                        extractions.push(Extraction { id: lot.id, amount, draft: true });
                    }
                    Err(Error::InsufficientStock { requested, remaining: left, .. }) => {
                        prop_assert!(amount > remaining);
                        prop_assert_eq!(requested, amount);
                        prop_assert_eq!(left, remaining);
                    }
                    Err(e) => prop_assert!(false, "unexpected error: {}", e),
                },
                StockOp::Delete(i) if !extractions.is_empty() => {
                    let idx = i % extractions.len();
                    let target = &mut extractions[idx];
                    let result = t.delete(target.id, &operator);
                    if target.draft {
                        prop_assert!(result.is_ok());
                        remaining += target.amount;
                        target.draft = false;
                    } else {
                        expect_code(result, ErrorCode::InvalidStatus)?;
                    }
                }
                StockOp::Reject(i) if !extractions.is_empty() => {
                    let idx = i % extractions.len();
                    let target = &mut extractions[idx];
                    if target.draft {
                        t.machine()
                            .update_draft(
                                target.id,
                                &operator,
                                LotUpdate {
                                    client: Some(Some(Party::known("BLENDER"))),
                                    ..Default::default()
                                },
                            )
                            .unwrap();
                        t.submit(target.id, &operator).unwrap();
                        t.reject(target.id, &eid("BLENDER"), "refused").unwrap();
                        remaining += target.amount;
                        target.draft = false;
                    } else {
                        expect_code(t.reject(target.id, &eid("BLENDER"), "again"), ErrorCode::InvalidStatus)?;
                    }
                }
                StockOp::Resize(i, amount) if !extractions.is_empty() => {
                    let idx = i % extractions.len();
                    let target = &mut extractions[idx];
                    let result = t.machine().update_draft(
                        target.id,
                        &operator,
                        LotUpdate { amount: Some(amount), ..Default::default() },
                    );
                    let delta = amount - target.amount;
                    if !target.draft {
                        expect_code(result, ErrorCode::InvalidStatus)?;
                    } else if delta > remaining {
                        expect_code(result, ErrorCode::InsufficientStock)?;
                    } else {
                        prop_assert!(result.is_ok());
                        remaining -= delta;
                        target.amount = amount;
                    }
                }
                _ => {}
            }

            let stored = t.position(position.id).unwrap();
            prop_assert!(stored.is_within_bounds());
            prop_assert_eq!(stored.remaining_amount, remaining);
            prop_assert_eq!(
                stored.remaining_amount,
                initial - t.lineage().live_extracted_amount(position.id).unwrap()
            );
        }

        prop_assert!(t.reconcile().unwrap().is_clean());
    }

    /// Property: forwarding chains carry the root amount unchanged and
    /// a rejected leg releases its claim on the parent
    #[test]
    fn prop_forward_chain_conserves_volume(
        amount in 1i64..10_000_000i64,
        hops in 1usize..6,
        reject_last in any::<bool>(),
    ) {
        let t = open();
        let amount = Decimal::new(amount, 3);
        let entities = ["TRADER", "BLENDER", "REFINER", "OPERATOR"];

        let mut new = lot_ledger::NewLot::new(
            PERIOD,
            amount,
            lot_ledger::types::BiofuelCode::new("ETH"),
            Party::known("PRODUCER"),
        );
        new.client = Some(Party::known(entities[0]));
        let root = t.machine().create_draft(&eid("PRODUCER"), new).unwrap();
        t.submit(root.id, &eid("PRODUCER")).unwrap();

        let mut current = root.id;
        for hop in 0..hops {
            let client = entities[hop % entities.len()];
            let downstream = entities[(hop + 1) % entities.len()];
            let transition = t
                .accept(
                    current,
                    &eid(client),
                    DeliveryType::Trading,
                    OutcomeParams::downstream(Party::known(downstream)),
                )
                .unwrap();
            let child = &transition.children[0];
            prop_assert_eq!(child.amount, amount);
            prop_assert_eq!(t.lineage().live_children_amount(current).unwrap(), amount);
            current = child.id;
        }

        let last_client = entities[hops % entities.len()];
        let parent = t.lot(current).unwrap().parent_lot().unwrap();
        if reject_last {
            t.reject(current, &eid(last_client), "not ours").unwrap();
            prop_assert_eq!(t.lineage().live_children_amount(parent).unwrap(), Decimal::ZERO);
        } else {
            t.accept(current, &eid(last_client), DeliveryType::Rfc, OutcomeParams::none()).unwrap();
            prop_assert_eq!(t.lineage().live_children_amount(parent).unwrap(), amount);
        }

        prop_assert_eq!(t.lineage().descendants(root.id).unwrap().len(), hops);
        prop_assert_eq!(t.lineage().root(current).unwrap().id, root.id);
        prop_assert!(t.reconcile().unwrap().is_clean());
    }

    /// Property: whatever is attempted by whoever, a lot only moves along
    /// the state graph and never leaves a terminal status
    #[test]
    fn prop_status_is_monotonic(
        attempts in prop::collection::vec((action_strategy(), actor_strategy()), 1..16)
    ) {
        let t = open();
        let lot = draft(
            &t,
            "PRODUCER",
            Party::known("PRODUCER"),
            Some(Party::known("OPERATOR")),
            500,
        );
        let mut status = lot.status;
        let mut moves = 0usize;

        for (action, actor) in attempts {
            let acting = eid(actor);
            let params = OutcomeParams {
                downstream: Some(Party::known("BLENDER")),
                depot: Some(lot_ledger::types::DepotId::new("DEP-1")),
            };
            let result = match action {
                Action::Submit => t.submit(lot.id, &acting),
                Action::Accept(outcome) => t.accept(lot.id, &acting, outcome, params),
                Action::Freeze(outcome) => t.freeze(lot.id, &acting, outcome, params),
                Action::Reject => t.reject(lot.id, &acting, "no"),
                Action::Delete => t.delete(lot.id, &acting),
            };

            let stored = t.lot(lot.id).unwrap().status;
            match result {
                Ok(transition) => {
                    prop_assert!(status.can_transition_to(transition.lot.status));
                    prop_assert_eq!(transition.lot.status, stored);
                    moves += 1;
                }
                Err(e) => {
                    prop_assert!(matches!(
                        e.code(),
                        ErrorCode::InvalidStatus | ErrorCode::Forbidden
                    ), "unexpected error: {}", e);
                    prop_assert_eq!(stored, status);
                }
            }
            if status.is_terminal() {
                prop_assert_eq!(stored, status);
            }
            status = stored;
        }

        prop_assert!(moves <= 2);
        prop_assert_eq!(t.events().history(lot.id).unwrap().len(), moves + 1);
        prop_assert!(status != LotStatus::Draft || moves == 0);
        t.events().verify_chain(lot.id).unwrap();
    }
}
