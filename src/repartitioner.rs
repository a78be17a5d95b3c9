//! Range-sharding of the resource id keyspace across cooperating processes
//!
//! Every process is started with a partition number. Processes announce
//! their number on a shared pub/sub channel and listen for everybody
//! else's; the highest live number is the partition count. Each process
//! then owns the `partition_number`-th of `num_partitions` equal slices of
//! the keyspace.
//!
//! ## Keyspace
//!
//! Boundaries are computed over the leading 32 bits of the id and rendered
//! as `%08x-0000-0000-0000-000000000000`. The last partition's upper bound
//! is `ffffffff-ffff-ffff-ffff-ffffffffffff`, inclusive, so rounding never
//! leaves a gap.
//!
//! ## Convergence
//!
//! A new process assumes it is the last partition, so its range extends to
//! the top of the keyspace. Hearing about a higher number shrinks the range
//! at once; a higher peer going quiet for `stale_after` grows it back after
//! the next recheck. During those windows a resource may briefly be checked
//! by two processes or by none.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::bus::PubSub;
use crate::error::MonitorError;

/// Number of distinct boundary prefixes (the leading 32 bits of an id)
const KEYSPACE_PREFIXES: u64 = 1 << 32;

/// A contiguous slice of the id keyspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdRange {
    lower: Uuid,
    upper: Uuid,
    upper_inclusive: bool,
}

impl IdRange {
    /// The whole keyspace
    pub fn full() -> Self {
        Self::for_partition(1, 1)
    }

    /// Range of the 1-based `partition_number` out of `num_partitions`
    ///
    /// `partition_number` must be within `1..=num_partitions`.
    pub fn for_partition(partition_number: u32, num_partitions: u32) -> Self {
        debug_assert!(partition_number >= 1 && partition_number <= num_partitions);

        let k = u64::from(partition_number);
        let n = u64::from(num_partitions);
        let lower = partition_boundary(k - 1, n);

        if partition_number == num_partitions {
            Self {
                lower,
                upper: Uuid::from_u128(u128::MAX),
                upper_inclusive: true,
            }
        } else {
            Self {
                lower,
                upper: partition_boundary(k, n),
                upper_inclusive: false,
            }
        }
    }

    pub fn lower(&self) -> Uuid {
        self.lower
    }

    pub fn upper(&self) -> Uuid {
        self.upper
    }

    pub fn is_upper_inclusive(&self) -> bool {
        self.upper_inclusive
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        if *id < self.lower {
            return false;
        }
        if self.upper_inclusive {
            *id <= self.upper
        } else {
            *id < self.upper
        }
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dots = if self.upper_inclusive { ".." } else { "..." };
        write!(f, "{}{}{}", self.lower, dots, self.upper)
    }
}

/// `k * partition_size` with `partition_size = 2^32 / n`, floored exactly
fn partition_boundary(k: u64, n: u64) -> Uuid {
    let prefix = k * KEYSPACE_PREFIXES / n;
    Uuid::from_u128(u128::from(prefix) << 96)
}

/// Repartitioner settings
#[derive(Debug, Clone)]
pub struct RepartitionerConfig {
    /// This process's 1-based partition number
    pub partition_number: u32,

    /// Channel to announce on and listen to
    pub channel: String,

    /// Upper bound on a single wait for a message, so shutdown is noticed
    pub listen_timeout: Duration,

    /// How often to re-announce and prune stale peers
    pub recheck_interval: Duration,

    /// Peers not heard from for this long are forgotten
    pub stale_after: Duration,

    /// Highest partition number accepted from peers
    pub max_partition: u32,
}

impl RepartitionerConfig {
    pub fn new(partition_number: u32) -> Self {
        Self {
            partition_number,
            channel: String::from("monitor"),
            listen_timeout: Duration::from_secs(1),
            recheck_interval: Duration::from_secs(18),
            stale_after: Duration::from_secs(40),
            max_partition: 8,
        }
    }
}

/// Keeps this process's share of the keyspace current
///
/// Partition state is written only by the task running [`listen`]; the
/// scheduler reads it through [`id_range`] and [`take_repartitioned`].
///
/// [`listen`]: Repartitioner::listen
/// [`id_range`]: Repartitioner::id_range
/// [`take_repartitioned`]: Repartitioner::take_repartitioned
pub struct Repartitioner {
    config: RepartitionerConfig,
    bus: Arc<dyn PubSub>,
    payload: String,
    num_partitions: AtomicU32,
    id_range: RwLock<IdRange>,
    repartitioned: AtomicBool,
    shutdown: AtomicBool,
}

impl Repartitioner {
    pub fn new(config: RepartitionerConfig, bus: Arc<dyn PubSub>) -> Result<Self, MonitorError> {
        let partition = config.partition_number;
        if partition == 0 || partition > config.max_partition {
            return Err(MonitorError::InvalidPartition {
                partition,
                max_partition: config.max_partition,
            });
        }

        let repartitioner = Self {
            payload: partition.to_string(),
            num_partitions: AtomicU32::new(partition),
            id_range: RwLock::new(IdRange::for_partition(partition, partition)),
            repartitioned: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            config,
            bus,
        };
        repartitioner.repartition(partition);
        Ok(repartitioner)
    }

    pub fn partition_number(&self) -> u32 {
        self.config.partition_number
    }

    pub fn num_partitions(&self) -> u32 {
        self.num_partitions.load(Ordering::Acquire)
    }

    /// The slice of the keyspace this process currently owns
    pub fn id_range(&self) -> IdRange {
        *self.id_range.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the range changed since the last call, clearing the flag
    pub fn take_repartitioned(&self) -> bool {
        self.repartitioned.swap(false, Ordering::AcqRel)
    }

    /// Make [`listen`](Repartitioner::listen) return; idempotent
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Announce this process's partition number; safe from any task
    pub async fn notify(&self) -> Result<(), MonitorError> {
        self.bus
            .notify(&self.config.channel, &self.payload)
            .await
            .map_err(MonitorError::Bus)
    }

    /// Track peers until [`shutdown`](Repartitioner::shutdown)
    ///
    /// Subscribes, announces itself, then adopts higher peer numbers as they
    /// arrive. Every `recheck_interval` it re-announces, forgets peers older
    /// than `stale_after`, and shrinks the partition count down to the
    /// highest peer still alive.
    #[instrument(skip(self), fields(channel = %self.config.channel, partition = self.config.partition_number))]
    pub async fn listen(&self) -> Result<(), MonitorError> {
        let mut subscription = self
            .bus
            .subscribe(&self.config.channel)
            .await
            .map_err(MonitorError::Bus)?;
        self.notify().await?;
        debug!("listening for peer partitions");

        let mut peers: HashMap<u32, Instant> = HashMap::new();
        let mut recheck_at = Instant::now() + self.first_recheck_delay();

        while !self.is_shutting_down() {
            match tokio::time::timeout(self.config.listen_timeout, subscription.next_message())
                .await
            {
                Ok(Ok(Some(payload))) => {
                    if self.is_shutting_down() {
                        break;
                    }
                    self.record_peer(&payload, &mut peers);
                }
                Ok(Ok(None)) => {
                    if self.is_shutting_down() {
                        break;
                    }
                    return Err(MonitorError::Bus(anyhow::anyhow!(
                        "subscription to {} closed",
                        self.config.channel
                    )));
                }
                Ok(Err(e)) => return Err(MonitorError::Bus(e)),
                Err(_) => trace!("no partition message within listen timeout"),
            }

            let now = Instant::now();
            if now > recheck_at {
                recheck_at = now + self.config.recheck_interval;
                self.recheck(now, &mut peers).await;
            }
        }

        debug!("partition listener stopped");
        Ok(())
    }

    fn record_peer(&self, payload: &str, peers: &mut HashMap<u32, Instant>) {
        let Some(number) = self.parse_payload(payload) else {
            warn!(
                notify_payload = payload,
                "invalid {} repartition notification", self.config.channel
            );
            return;
        };

        if number > self.num_partitions() {
            self.repartition(number);
        }
        peers.insert(number, Instant::now());
    }

    async fn recheck(&self, now: Instant, peers: &mut HashMap<u32, Instant>) {
        if let Err(e) = self.notify().await {
            warn!("failed to announce partition: {e}");
        }

        let stale_before = now.checked_sub(self.config.stale_after);
        if let Some(stale_before) = stale_before {
            peers.retain(|_, seen| *seen >= stale_before);
        }

        if let Some(&highest) = peers.keys().max() {
            let highest = highest.max(self.config.partition_number);
            if highest < self.num_partitions() {
                self.repartition(highest);
            }
        }
    }

    fn parse_payload(&self, payload: &str) -> Option<u32> {
        payload
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|n| (1..=self.config.max_partition).contains(n))
    }

    /// Recompute the range for `num_partitions` and flag the scheduler
    fn repartition(&self, num_partitions: u32) {
        let num_partitions = num_partitions.max(self.config.partition_number);
        let range = IdRange::for_partition(self.config.partition_number, num_partitions);

        self.num_partitions.store(num_partitions, Ordering::Release);
        *self.id_range.write().unwrap_or_else(PoisonError::into_inner) = range;
        self.repartitioned.store(true, Ordering::Release);

        info!(
            partition_number = self.config.partition_number,
            num_partitions,
            range = %range,
            "{} repartitioning", self.config.channel
        );
    }

    /// Recheck deadline with up to a second of negative jitter
    fn first_recheck_delay(&self) -> Duration {
        let jitter = self
            .config
            .recheck_interval
            .min(Duration::from_secs(1))
            .mul_f64(rand::random::<f64>());
        self.config.recheck_interval.saturating_sub(jitter)
    }
}
