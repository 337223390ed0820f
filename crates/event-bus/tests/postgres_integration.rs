//! PostgreSQL integration tests for the event bus.
//!
//! ```bash
//! cargo test -p event-bus --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use event_bus::{EventBus, Offset, PostgresEventBus, TopicSpec};
use serde_json::json;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let pool = PgPool::connect(&connection_string).await.unwrap();
            PostgresEventBus::run_migrations(&pool).await.unwrap();
            pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_pool() -> PgPool {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE bus_messages, bus_partitions, bus_consumer_offsets")
        .execute(&pool)
        .await
        .unwrap();

    pool
}

fn topics() -> Vec<TopicSpec> {
    vec![TopicSpec::new("orders", 4), TopicSpec::new("single", 1)]
}

#[tokio::test]
async fn test_publish_and_read_in_order() {
    let bus = PostgresEventBus::connect(get_test_pool().await, topics())
        .await
        .unwrap();

    for i in 0..5 {
        let delivery = bus.publish("single", "k", json!(i)).await.unwrap();
        assert_eq!(delivery.offset, Offset::new(i));
    }

    let read = bus.read("single", 0, Offset::new(1), 3).await.unwrap();
    let payloads: Vec<_> = read.iter().map(|e| e.payload.clone()).collect();
    assert_eq!(payloads, vec![json!(1), json!(2), json!(3)]);
    assert_eq!(read[0].key, "k");
    assert_eq!(bus.end_offset("single", 0).await.unwrap(), Offset::new(5));
}

#[tokio::test]
async fn test_same_key_shares_a_partition() {
    let bus = PostgresEventBus::connect(get_test_pool().await, topics())
        .await
        .unwrap();

    let first = bus.publish("orders", "O1", json!(1)).await.unwrap();
    let second = bus.publish("orders", "O1", json!(2)).await.unwrap();

    assert_eq!(first.partition, second.partition);
    assert_eq!(second.offset, first.offset.next());
    assert!(bus.publish("nope", "k", json!(null)).await.is_err());
    assert!(bus.read("orders", 9, Offset::zero(), 1).await.is_err());
}

#[tokio::test]
async fn test_commits_are_per_group_and_monotonic() {
    let bus = PostgresEventBus::connect(get_test_pool().await, topics())
        .await
        .unwrap();

    assert_eq!(bus.committed("g1", "single", 0).await.unwrap(), Offset::zero());
    bus.commit("g1", "single", 0, Offset::new(5)).await.unwrap();
    bus.commit("g1", "single", 0, Offset::new(2)).await.unwrap();

    assert_eq!(bus.committed("g1", "single", 0).await.unwrap(), Offset::new(5));
    assert_eq!(bus.committed("g2", "single", 0).await.unwrap(), Offset::zero());
}

#[tokio::test]
async fn test_log_survives_reconnect() {
    let pool = get_test_pool().await;
    let bus = PostgresEventBus::connect(pool.clone(), topics())
        .await
        .unwrap();
    bus.publish("single", "k", json!("before")).await.unwrap();
    bus.commit("g1", "single", 0, Offset::new(1)).await.unwrap();
    drop(bus);

    let bus = PostgresEventBus::connect(pool, topics()).await.unwrap();
    let delivery = bus.publish("single", "k", json!("after")).await.unwrap();

    assert_eq!(delivery.offset, Offset::new(1));
    assert_eq!(bus.committed("g1", "single", 0).await.unwrap(), Offset::new(1));
    assert_eq!(bus.read("single", 0, Offset::zero(), 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_publishes_wake_other_instances() {
    let pool = get_test_pool().await;
    let producer = PostgresEventBus::connect(pool.clone(), topics())
        .await
        .unwrap();
    let consumer = PostgresEventBus::connect(pool, topics()).await.unwrap();

    let mut changes = consumer.changes();
    // The listener ticks once when it has subscribed.
    tokio::time::timeout(Duration::from_secs(5), changes.changed())
        .await
        .unwrap()
        .unwrap();
    changes.borrow_and_update();

    producer.publish("single", "k", json!(1)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), changes.changed())
        .await
        .unwrap()
        .unwrap();
}
