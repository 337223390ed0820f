use std::hint::black_box;

use common::{CheckRequest, InventoryAdjustment, LineItem, Message, OrderNumber, Sku};
use criterion::{Criterion, criterion_group, criterion_main};
use event_bus::{EventBus, EventBusExt, InMemoryEventBus, Offset, TopicSpec};
use inventory::{LedgerChange, LedgerShard};

fn request(order: u32, sku: &str, quantity: u32) -> CheckRequest {
    CheckRequest {
        order_number: OrderNumber::new(format!("ORD-{order:06}")),
        line: 0,
        sku: Sku::from(sku),
        quantity,
    }
}

fn bench_check_and_reserve(c: &mut Criterion) {
    c.bench_function("ledger/check_and_reserve", |b| {
        b.iter(|| {
            let mut shard = LedgerShard::new();
            shard.initialize("SKU-BENCH", 1_000);
            for order in 0..100 {
                black_box(shard.check_and_reserve(&request(order, "SKU-BENCH", 5)));
            }
        });
    });
}

fn bench_compensate(c: &mut Criterion) {
    c.bench_function("ledger/reserve_then_compensate", |b| {
        b.iter(|| {
            let mut shard = LedgerShard::new();
            shard.initialize("SKU-BENCH", 1_000);
            let item = LineItem::new("SKU-BENCH", 5);
            for order in 0..100 {
                let request = request(order, "SKU-BENCH", 5);
                shard.check_and_reserve(&request);
                let compensation = InventoryAdjustment::compensation(
                    request.order_number,
                    0,
                    &item,
                    "compensation",
                );
                let decision = shard.decide_adjust(&compensation);
                shard.apply_all(decision.changes);
            }
        });
    });
}

fn bench_replay_changelog(c: &mut Criterion) {
    let changes: Vec<LedgerChange> = (0..1_000)
        .map(|i| LedgerChange::Stock {
            sku: Sku::new(format!("SKU-{:03}", i % 50)),
            quantity: i64::from(i),
        })
        .collect();

    c.bench_function("ledger/replay_1000_changes", |b| {
        b.iter(|| {
            let mut shard = LedgerShard::new();
            shard.apply_all(changes.iter().cloned());
            black_box(shard.sku_count());
        });
    });
}

fn bench_bus_publish_and_read(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("ledger/bus_publish_read_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let bus = InMemoryEventBus::new(TopicSpec::all(1));
                for order in 0..100 {
                    let message = Message::CheckRequested(request(order, "SKU-BENCH", 1));
                    bus.send(&message).await.unwrap();
                }
                let batch = bus
                    .read(
                        common::channels::INVENTORY_CHECK_REQUEST,
                        0,
                        Offset::zero(),
                        100,
                    )
                    .await
                    .unwrap();
                black_box(batch);
            });
        });
    });
}

criterion_group!(
    benches,
    bench_check_and_reserve,
    bench_compensate,
    bench_replay_changelog,
    bench_bus_publish_and_read,
);
criterion_main!(benches);
