//! Sharded ledger runtime.
//!
//! One worker task per partition owns the [`LedgerShard`] for every SKU that
//! hashes to that partition. Because check requests, adjustments, and
//! product creations are all keyed by SKU, every mutation of a SKU runs on
//! its single owner and no locking is needed. Reads go through the owner's
//! mailbox instead of touching the shard from outside.

use std::sync::Arc;

use common::{InventoryAdjustment, Message, ProductCreated, Sku, channels};
use event_bus::{
    Delivery, DeliveryOutcome, Envelope, EventBus, EventBusExt, HandlerError, Offset,
    PartitionCursor, RetryPolicy, co_partitioned,
};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::changelog::LedgerRecord;
use crate::error::{LedgerError, Result};
use crate::shard::LedgerShard;
use crate::snapshot::{LedgerSnapshot, LedgerSnapshotStore};

/// Consumer group of the ledger workers.
pub const LEDGER_GROUP: &str = "inventory-ledger";

const BATCH_SIZE: usize = 64;
const RESTORE_BATCH_SIZE: usize = 256;

/// Runtime settings for the ledger.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub group: String,
    pub retry: RetryPolicy,
    pub mailbox_capacity: usize,
    /// Changelog records between snapshots; `0` never snapshots.
    pub snapshot_every: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            group: LEDGER_GROUP.to_string(),
            retry: RetryPolicy::default(),
            mailbox_capacity: 64,
            snapshot_every: 1000,
        }
    }
}

enum ShardQuery {
    Stock {
        sku: Sku,
        reply: oneshot::Sender<Option<i64>>,
    },
    Levels {
        reply: oneshot::Sender<Vec<(Sku, i64)>>,
    },
}

/// Handle to the running ledger.
pub struct InventoryLedger<B> {
    bus: B,
    partitions: u32,
    mailboxes: Vec<mpsc::Sender<ShardQuery>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<B> InventoryLedger<B>
where
    B: EventBus + Clone + 'static,
{
    /// Restores every shard from the changelog and starts its worker.
    ///
    /// Returns once all shards are restored, so queries issued afterwards
    /// see at least the state recorded before the restart.
    pub async fn start(
        bus: B,
        config: LedgerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        Self::launch(bus, config, None, shutdown).await
    }

    /// Like [`InventoryLedger::start`], but restores from and periodically
    /// writes shard snapshots, so restore replays only the changelog tail.
    pub async fn start_with_snapshots(
        bus: B,
        config: LedgerConfig,
        snapshots: Arc<dyn LedgerSnapshotStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        Self::launch(bus, config, Some(snapshots), shutdown).await
    }

    #[tracing::instrument(skip_all, fields(group = %config.group))]
    async fn launch(
        bus: B,
        config: LedgerConfig,
        snapshots: Option<Arc<dyn LedgerSnapshotStore>>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let mut topics = channels::LEDGER_INPUTS.to_vec();
        topics.push(channels::INVENTORY_CHANGELOG);
        let partitions = co_partitioned(&bus, &topics)?;

        let mut mailboxes = Vec::with_capacity(partitions as usize);
        let mut workers = Vec::with_capacity(partitions as usize);
        for partition in 0..partitions {
            let worker =
                ShardWorker::restore(bus.clone(), &config, snapshots.clone(), partition).await?;
            let (sender, receiver) = mpsc::channel(config.mailbox_capacity.max(1));
            workers.push(tokio::spawn(worker.run(receiver, shutdown.clone())));
            mailboxes.push(sender);
        }

        tracing::info!(partitions, "inventory ledger started");
        Ok(Self {
            bus,
            partitions,
            mailboxes,
            workers: Mutex::new(workers),
        })
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Requests initial stock for a SKU. Duplicate requests are ignored by the owner.
    pub async fn initialize(&self, sku: impl Into<Sku>, initial_quantity: i64) -> Result<Delivery> {
        let message = Message::ProductCreated(ProductCreated {
            sku: sku.into(),
            initial_quantity,
        });
        Ok(self.bus.send(&message).await?)
    }

    /// Requests a stock adjustment.
    pub async fn adjust(&self, adjustment: InventoryAdjustment) -> Result<Delivery> {
        Ok(self
            .bus
            .send(&Message::InventoryAdjusted(adjustment))
            .await?)
    }

    /// Reads the current stock of a SKU from its owning shard.
    pub async fn stock(&self, sku: &Sku) -> Result<Option<i64>> {
        let partition = event_bus::partition_for(sku.as_str(), self.partitions);
        let (reply, answer) = oneshot::channel();
        self.ask(
            partition,
            ShardQuery::Stock {
                sku: sku.clone(),
                reply,
            },
        )
        .await?;
        answer
            .await
            .map_err(|_| LedgerError::ShardUnavailable(partition))
    }

    /// Reads every stock level, sorted by SKU.
    pub async fn stock_levels(&self) -> Result<Vec<(Sku, i64)>> {
        let mut levels = Vec::new();
        for partition in 0..self.partitions {
            let (reply, answer) = oneshot::channel();
            self.ask(partition, ShardQuery::Levels { reply }).await?;
            let mut shard_levels = answer
                .await
                .map_err(|_| LedgerError::ShardUnavailable(partition))?;
            levels.append(&mut shard_levels);
        }
        levels.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(levels)
    }

    /// Waits for every shard worker to exit.
    pub async fn join(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "ledger worker panicked");
            }
        }
    }

    async fn ask(&self, partition: u32, query: ShardQuery) -> Result<()> {
        self.mailboxes
            .get(partition as usize)
            .ok_or(LedgerError::ShardUnavailable(partition))?
            .send(query)
            .await
            .map_err(|_| LedgerError::ShardUnavailable(partition))
    }
}

struct ShardWorker<B> {
    bus: B,
    partition: u32,
    shard: LedgerShard,
    cursor: PartitionCursor<B>,
    retry: RetryPolicy,
    snapshots: Option<Arc<dyn LedgerSnapshotStore>>,
    snapshot_every: u64,
    since_snapshot: u64,
}

impl<B> ShardWorker<B>
where
    B: EventBus + Clone + 'static,
{
    /// Rebuilds the shard from its latest snapshot plus the changelog
    /// records after it, and positions the input cursor past everything
    /// the shard already covers.
    async fn restore(
        bus: B,
        config: &LedgerConfig,
        snapshots: Option<Arc<dyn LedgerSnapshotStore>>,
        partition: u32,
    ) -> Result<Self> {
        let end = bus
            .end_offset(channels::INVENTORY_CHANGELOG, partition)
            .await?;

        let snapshot = match &snapshots {
            Some(store) => store.load(partition).await?,
            None => None,
        };
        let (mut shard, start) = match snapshot {
            Some(snapshot) if snapshot.changelog_offset <= end => {
                let start = snapshot.changelog_offset;
                (snapshot.into_shard()?, start)
            }
            Some(snapshot) => {
                tracing::warn!(
                    partition,
                    snapshot = %snapshot.changelog_offset,
                    %end,
                    "snapshot is ahead of the changelog, ignoring it"
                );
                (LedgerShard::new(), Offset::zero())
            }
            None => (LedgerShard::new(), Offset::zero()),
        };

        let mut offset = start;
        while offset < end {
            let batch = bus
                .read(
                    channels::INVENTORY_CHANGELOG,
                    partition,
                    offset,
                    RESTORE_BATCH_SIZE,
                )
                .await?;
            if batch.is_empty() {
                break;
            }
            for envelope in batch {
                offset = envelope.offset.next();
                let record: LedgerRecord = envelope.decode()?;
                shard.apply_record(record);
            }
        }

        let mut cursor = PartitionCursor::open(
            bus.clone(),
            config.group.clone(),
            &channels::LEDGER_INPUTS,
            partition,
        )
        .await?;
        for (topic, position) in shard.applied_positions() {
            cursor.fast_forward(topic, position);
        }

        tracing::info!(
            partition,
            skus = shard.sku_count(),
            from = %start,
            records = %offset,
            "ledger shard restored"
        );

        Ok(Self {
            bus,
            partition,
            shard,
            cursor,
            retry: config.retry.clone(),
            snapshots,
            snapshot_every: config.snapshot_every,
            since_snapshot: offset.as_u64() - start.as_u64(),
        })
    }

    #[tracing::instrument(skip_all, fields(partition = self.partition))]
    async fn run(
        mut self,
        mut mailbox: mpsc::Receiver<ShardQuery>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut changes = self.bus.changes();
        let mut mailbox_open = true;

        while !*shutdown.borrow() {
            changes.borrow_and_update();
            self.drain(&mut mailbox);

            let batch = match self.cursor.poll(BATCH_SIZE).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(error = %e, "ledger poll failed");
                    tokio::time::sleep(self.retry.max_delay).await;
                    continue;
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    query = mailbox.recv(), if mailbox_open => match query {
                        Some(query) => self.answer(query),
                        None => mailbox_open = false,
                    },
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    stopped = shutdown.changed() => {
                        if stopped.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            for envelope in &batch {
                if *shutdown.borrow() {
                    break;
                }
                let outcome = self.process_with_retry(envelope).await;
                if !outcome.should_commit() {
                    tokio::time::sleep(self.retry.max_delay).await;
                    break;
                }
                if let Err(e) = self.cursor.commit(envelope).await {
                    tracing::warn!(error = %e, offset = %envelope.offset, "ledger commit failed");
                    break;
                }
                self.drain(&mut mailbox);
            }
        }

        tracing::debug!("ledger shard stopped");
    }

    fn drain(&self, mailbox: &mut mpsc::Receiver<ShardQuery>) {
        while let Ok(query) = mailbox.try_recv() {
            self.answer(query);
        }
    }

    fn answer(&self, query: ShardQuery) {
        // A dropped receiver just means the caller gave up waiting.
        match query {
            ShardQuery::Stock { sku, reply } => {
                let _ = reply.send(self.shard.stock(&sku));
            }
            ShardQuery::Levels { reply } => {
                let levels = self
                    .shard
                    .stock_levels()
                    .map(|(sku, qty)| (sku.clone(), qty))
                    .collect();
                let _ = reply.send(levels);
            }
        }
    }

    async fn process_with_retry(&mut self, envelope: &Envelope) -> DeliveryOutcome {
        let mut attempt = 1;
        loop {
            match self.process(envelope).await {
                Ok(()) => return DeliveryOutcome::Processed,
                Err(HandlerError::Permanent(reason)) => {
                    tracing::error!(
                        topic = %envelope.topic,
                        offset = %envelope.offset,
                        %reason,
                        "ledger input cannot be processed, skipping"
                    );
                    return DeliveryOutcome::Skipped;
                }
                Err(HandlerError::Transient(reason)) if attempt < self.retry.max_attempts => {
                    tracing::warn!(
                        topic = %envelope.topic,
                        offset = %envelope.offset,
                        attempt,
                        %reason,
                        "ledger publish failed, retrying"
                    );
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(HandlerError::Transient(reason)) => {
                    tracing::error!(
                        topic = %envelope.topic,
                        offset = %envelope.offset,
                        %reason,
                        "ledger retries exhausted, input left uncommitted"
                    );
                    return DeliveryOutcome::Exhausted;
                }
            }
        }
    }

    /// Decides, publishes results then the changelog record, and only then
    /// applies the changes to the shard. Inputs the shard already applied
    /// are skipped.
    async fn process(&mut self, envelope: &Envelope) -> std::result::Result<(), HandlerError> {
        if self.shard.is_applied(&envelope.topic, envelope.offset) {
            tracing::debug!(topic = %envelope.topic, offset = %envelope.offset, "input already applied");
            return Ok(());
        }

        let message: Message = envelope.decode()?;
        let Some(decision) = self.shard.decide(&message) else {
            tracing::warn!(kind = message.kind(), topic = %envelope.topic, "unexpected ledger input");
            return Ok(());
        };

        for output in &decision.outputs {
            self.bus.send(output).await?;
        }

        if decision.changes.is_empty() {
            self.shard.mark_applied(&envelope.topic, envelope.offset);
            return Ok(());
        }

        let record = LedgerRecord {
            source_topic: envelope.topic.clone(),
            source_offset: envelope.offset,
            changes: decision.changes,
        };
        let delivery = self
            .bus
            .publish(
                channels::INVENTORY_CHANGELOG,
                &envelope.key,
                serde_json::to_value(&record)?,
            )
            .await?;
        self.shard.apply_record(record);

        self.since_snapshot += 1;
        self.maybe_snapshot(delivery.offset.next()).await;
        Ok(())
    }

    /// Writes a snapshot once enough records accumulated since the last one.
    /// A failed write is logged and retried after the next record.
    async fn maybe_snapshot(&mut self, changelog_offset: Offset) {
        let Some(store) = &self.snapshots else {
            return;
        };
        if self.snapshot_every == 0 || self.since_snapshot < self.snapshot_every {
            return;
        }

        let saved = match LedgerSnapshot::from_shard(self.partition, changelog_offset, &self.shard) {
            Ok(snapshot) => store.save(&snapshot).await,
            Err(e) => Err(e.into()),
        };
        match saved {
            Ok(()) => {
                self.since_snapshot = 0;
                metrics::counter!("inventory_snapshots_total").increment(1);
                tracing::debug!(
                    partition = self.partition,
                    %changelog_offset,
                    "ledger snapshot written"
                );
            }
            Err(e) => {
                tracing::warn!(partition = self.partition, error = %e, "ledger snapshot failed");
            }
        }
    }
}
