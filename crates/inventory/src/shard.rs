//! Per-shard stock aggregation.
//!
//! A shard is plain data owned by exactly one worker. Every operation is
//! split into a pure `decide_*` step, which reads the shard and returns the
//! changes plus any messages to emit, and [`LedgerShard::apply`], which
//! commits those changes. The worker publishes before it applies, so a
//! failed publish leaves the shard untouched and the input can be retried.

use std::collections::HashMap;

use common::{
    CheckRequest, CheckResult, InventoryAdjustment, Message, OrderNumber, ProductCreated, Sku,
};
use event_bus::Offset;
use serde::{Deserialize, Serialize};

use crate::changelog::{LedgerChange, LedgerRecord, ReservationState};

/// The outcome of deciding one input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    pub changes: Vec<LedgerChange>,
    pub outputs: Vec<Message>,
}

impl Decision {
    fn from_changes(changes: Vec<LedgerChange>) -> Self {
        Self {
            changes,
            outputs: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.changes.is_empty() && self.outputs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Reservation {
    sku: Sku,
    state: ReservationState,
}

type ReservationKey = (OrderNumber, u32);

/// Authoritative stock for the SKUs of one partition.
///
/// Also tracks, per input topic, the offset after the last input whose
/// changes were applied, so an input is never applied twice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(into = "ShardState", from = "ShardState")]
pub struct LedgerShard {
    stock: HashMap<Sku, i64>,
    reservations: HashMap<ReservationKey, Reservation>,
    applied: HashMap<String, Offset>,
}

/// Serialized form of a shard, used by snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShardState {
    stock: Vec<(Sku, i64)>,
    reservations: Vec<ReservationEntry>,
    applied: Vec<(String, Offset)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReservationEntry {
    order_number: OrderNumber,
    line: u32,
    sku: Sku,
    state: ReservationState,
}

impl From<LedgerShard> for ShardState {
    fn from(shard: LedgerShard) -> Self {
        Self {
            stock: shard.stock.into_iter().collect(),
            reservations: shard
                .reservations
                .into_iter()
                .map(|((order_number, line), r)| ReservationEntry {
                    order_number,
                    line,
                    sku: r.sku,
                    state: r.state,
                })
                .collect(),
            applied: shard.applied.into_iter().collect(),
        }
    }
}

impl From<ShardState> for LedgerShard {
    fn from(state: ShardState) -> Self {
        Self {
            stock: state.stock.into_iter().collect(),
            reservations: state
                .reservations
                .into_iter()
                .map(|entry| {
                    (
                        (entry.order_number, entry.line),
                        Reservation {
                            sku: entry.sku,
                            state: entry.state,
                        },
                    )
                })
                .collect(),
            applied: state.applied.into_iter().collect(),
        }
    }
}

impl LedgerShard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stock, or `None` if the SKU was never initialized.
    pub fn stock(&self, sku: &Sku) -> Option<i64> {
        self.stock.get(sku).copied()
    }

    /// All stock levels held by this shard.
    pub fn stock_levels(&self) -> impl Iterator<Item = (&Sku, i64)> {
        self.stock.iter().map(|(sku, qty)| (sku, *qty))
    }

    pub fn sku_count(&self) -> usize {
        self.stock.len()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// True if the input at `offset` of `topic` was already applied.
    pub fn is_applied(&self, topic: &str, offset: Offset) -> bool {
        self.applied
            .get(topic)
            .is_some_and(|next| offset < *next)
    }

    /// Per input topic, the offset after the last applied input.
    pub fn applied_positions(&self) -> impl Iterator<Item = (&str, Offset)> {
        self.applied
            .iter()
            .map(|(topic, offset)| (topic.as_str(), *offset))
    }

    /// Records that the input at `offset` of `topic` has been applied.
    pub fn mark_applied(&mut self, topic: &str, offset: Offset) {
        let next = offset.next();
        match self.applied.get_mut(topic) {
            Some(position) => *position = (*position).max(next),
            None => {
                self.applied.insert(topic.to_string(), next);
            }
        }
    }

    /// Applies a changelog record and the input position it covers.
    pub fn apply_record(&mut self, record: LedgerRecord) {
        self.mark_applied(&record.source_topic, record.source_offset);
        self.apply_all(record.changes);
    }

    /// The quantity still held for an order line.
    pub fn held(&self, order_number: &OrderNumber, line: u32) -> Option<u32> {
        match self.reservations.get(&(order_number.clone(), line)) {
            Some(Reservation {
                state: ReservationState::Held { quantity },
                ..
            }) => Some(*quantity),
            _ => None,
        }
    }

    /// Routes a bus message to the matching decision, or `None` if the
    /// ledger does not consume it.
    pub fn decide(&self, message: &Message) -> Option<Decision> {
        match message {
            Message::ProductCreated(event) => Some(self.decide_initialize(event)),
            Message::CheckRequested(request) => Some(self.decide_reserve(request)),
            Message::InventoryAdjusted(adjustment) => Some(self.decide_adjust(adjustment)),
            _ => None,
        }
    }

    /// Sets stock for a new SKU. Negative quantities are clamped to zero;
    /// a SKU that already exists is left alone.
    pub fn decide_initialize(&self, event: &ProductCreated) -> Decision {
        if let Some(current) = self.stock(&event.sku) {
            tracing::warn!(
                sku = %event.sku,
                current,
                requested = event.initial_quantity,
                "duplicate stock initialization ignored"
            );
            return Decision::default();
        }

        Decision::from_changes(vec![LedgerChange::Stock {
            sku: event.sku.clone(),
            quantity: event.initial_quantity.max(0),
        }])
    }

    /// Takes `quantity` out of stock if there is enough of it.
    ///
    /// A redelivered request is answered from the recorded decision for its
    /// order line and never touches stock twice.
    pub fn decide_reserve(&self, request: &CheckRequest) -> Decision {
        let key = (request.order_number.clone(), request.line);
        if let Some(existing) = self.reservations.get(&key) {
            tracing::debug!(
                order_number = %request.order_number,
                line = request.line,
                sku = %existing.sku,
                state = ?existing.state,
                "check request already decided"
            );
            let result = match &existing.state {
                ReservationState::Held { .. } | ReservationState::Released { .. } => {
                    CheckResult::reserved(request)
                }
                ReservationState::Rejected { reason } => CheckResult::shortage(request, reason),
                ReservationState::Cancelled => {
                    CheckResult::shortage(request, "reservation cancelled")
                }
            };
            return Decision {
                changes: Vec::new(),
                outputs: vec![Message::CheckCompleted(result)],
            };
        }

        let current = self.stock(&request.sku).unwrap_or(0);
        let requested = i64::from(request.quantity);

        if current < requested {
            let reason = format!(
                "insufficient stock for {} (need {}, have {})",
                request.sku, request.quantity, current
            );
            tracing::warn!(order_number = %request.order_number, %reason, "inventory check failed");
            metrics::counter!("inventory_reservations_total", "outcome" => "shortage")
                .increment(1);
            return Decision {
                changes: vec![LedgerChange::Reservation {
                    order_number: request.order_number.clone(),
                    line: request.line,
                    sku: request.sku.clone(),
                    state: ReservationState::Rejected {
                        reason: reason.clone(),
                    },
                }],
                outputs: vec![Message::CheckCompleted(CheckResult::shortage(
                    request, reason,
                ))],
            };
        }

        let remaining = current - requested;
        tracing::info!(
            order_number = %request.order_number,
            sku = %request.sku,
            from = current,
            to = remaining,
            "stock reserved"
        );
        metrics::counter!("inventory_reservations_total", "outcome" => "reserved")
            .increment(1);

        Decision {
            changes: vec![
                LedgerChange::Stock {
                    sku: request.sku.clone(),
                    quantity: remaining,
                },
                LedgerChange::Reservation {
                    order_number: request.order_number.clone(),
                    line: request.line,
                    sku: request.sku.clone(),
                    state: ReservationState::Held {
                        quantity: request.quantity,
                    },
                },
            ],
            outputs: vec![Message::CheckCompleted(CheckResult::reserved(request))],
        }
    }

    /// Applies an adjustment.
    ///
    /// Compensations release the recorded reservation of their order line at
    /// most once. Manual adjustments apply their signed delta, saturating and
    /// never dropping below zero.
    pub fn decide_adjust(&self, adjustment: &InventoryAdjustment) -> Decision {
        let current = self.stock(&adjustment.sku).unwrap_or(0);

        let Some((order_number, line)) = adjustment.reservation() else {
            let quantity = current.saturating_add(adjustment.delta).max(0);
            tracing::info!(
                sku = %adjustment.sku,
                delta = adjustment.delta,
                from = current,
                to = quantity,
                reason = %adjustment.reason,
                "stock adjusted"
            );
            return Decision::from_changes(vec![LedgerChange::Stock {
                sku: adjustment.sku.clone(),
                quantity,
            }]);
        };

        let reservation_change = |state| LedgerChange::Reservation {
            order_number: order_number.clone(),
            line,
            sku: adjustment.sku.clone(),
            state,
        };

        match self.reservations.get(&(order_number.clone(), line)) {
            Some(Reservation {
                state: ReservationState::Held { quantity },
                ..
            }) => {
                let credited = current.saturating_add(i64::from(*quantity));
                tracing::info!(
                    %order_number,
                    line,
                    sku = %adjustment.sku,
                    quantity,
                    reason = %adjustment.reason,
                    "reservation released"
                );
                Decision::from_changes(vec![
                    LedgerChange::Stock {
                        sku: adjustment.sku.clone(),
                        quantity: credited,
                    },
                    reservation_change(ReservationState::Released {
                        quantity: *quantity,
                    }),
                ])
            }
            Some(existing) => {
                tracing::debug!(
                    %order_number,
                    line,
                    state = ?existing.state,
                    "nothing held for compensation"
                );
                Decision::default()
            }
            None => {
                tracing::info!(
                    %order_number,
                    line,
                    "compensation arrived before check, cancelling line"
                );
                Decision::from_changes(vec![reservation_change(ReservationState::Cancelled)])
            }
        }
    }

    /// Commits one change.
    pub fn apply(&mut self, change: LedgerChange) {
        match change {
            LedgerChange::Stock { sku, quantity } => {
                metrics::gauge!("inventory_stock_level", "sku" => sku.to_string())
                    .set(quantity as f64);
                self.stock.insert(sku, quantity.max(0));
            }
            LedgerChange::Reservation {
                order_number,
                line,
                sku,
                state,
            } => {
                self.reservations
                    .insert((order_number, line), Reservation { sku, state });
            }
        }
    }

    pub fn apply_all(&mut self, changes: impl IntoIterator<Item = LedgerChange>) {
        for change in changes {
            self.apply(change);
        }
    }

    /// Initializes a SKU in place. Returns false if it already existed.
    pub fn initialize(&mut self, sku: impl Into<Sku>, initial_quantity: i64) -> bool {
        let decision = self.decide_initialize(&ProductCreated {
            sku: sku.into(),
            initial_quantity,
        });
        let created = !decision.changes.is_empty();
        self.apply_all(decision.changes);
        created
    }

    /// Checks and reserves in place, returning the result to emit.
    pub fn check_and_reserve(&mut self, request: &CheckRequest) -> CheckResult {
        let decision = self.decide_reserve(request);
        self.apply_all(decision.changes);
        match decision.outputs.into_iter().next() {
            Some(Message::CheckCompleted(result)) => result,
            _ => CheckResult::shortage(request, "no decision"),
        }
    }

    /// Adds stock back without any order reference.
    pub fn credit(&mut self, sku: impl Into<Sku>, quantity: u32) {
        let decision =
            self.decide_adjust(&InventoryAdjustment::manual(sku, i64::from(quantity), "credit"));
        self.apply_all(decision.changes);
    }
}
