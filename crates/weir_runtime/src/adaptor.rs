//! Adaptor: a bounded multi-lane ring buffer between two groups of threads.
//!
//! The buffer has `lcm(producers, consumers)` lanes. Producer `p` visits the
//! lanes `p, p + P, p + 2P, ...` and consumer `c` the lanes `c, c + C, ...`,
//! so every lane has exactly one producer and one consumer and frames keep
//! their order on each producer/consumer pairing.
//!
//! [`Adaptor`] is the owning handle: it allocates, resizes and resets the
//! slots. [`Pusher`] and [`Puller`] are the per-thread replica handles.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::debug;
use weir_core::{CoreError, CoreResult, SocketBuffer};

/// Largest accepted lane count
pub const MAX_LANES: usize = 1000;

/// How a blocked pusher or puller waits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitingMode {
    /// Busy-spin on the lane indices
    Active,
    /// Sleep on a condition variable
    #[default]
    Passive,
}

/// Adaptor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptorConfig {
    /// Slots per lane
    pub buffer_size: usize,
    /// Waiting strategy
    pub waiting: WaitingMode,
    /// Swap buffers instead of copying bytes
    pub zero_copy: bool,
    /// Expected producer handles
    pub n_producers: usize,
    /// Expected consumer handles
    pub n_consumers: usize,
}

impl Default for AdaptorConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1,
            waiting: WaitingMode::Passive,
            zero_copy: false,
            n_producers: 1,
            n_consumers: 1,
        }
    }
}

impl AdaptorConfig {
    /// Set the slots per lane
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the waiting strategy
    #[must_use]
    pub fn with_waiting(mut self, waiting: WaitingMode) -> Self {
        self.waiting = waiting;
        self
    }

    /// Enable or disable zero-copy transfers
    #[must_use]
    pub fn with_zero_copy(mut self, zero_copy: bool) -> Self {
        self.zero_copy = zero_copy;
        self
    }

    /// Set the producer and consumer counts
    #[must_use]
    pub fn with_replicas(mut self, n_producers: usize, n_consumers: usize) -> Self {
        self.n_producers = n_producers;
        self.n_consumers = n_consumers;
        self
    }
}

/// Types able to exchange buffer ownership instead of copying bytes
pub trait ZeroCopyRebind {
    /// Whether transfers swap buffers
    fn supports_zero_copy_rebind(&self) -> bool;
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Least common multiple of two positive counts
#[must_use]
pub fn lcm(a: usize, b: usize) -> usize {
    if a == 0 || b == 0 {
        return 0;
    }
    a / gcd(a, b) * b
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Lane {
    /// Slots consumed so far
    first: AtomicU64,
    /// Slots produced so far
    last: AtomicU64,
    /// Free slots
    free: AtomicUsize,
    mutex: Mutex<()>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl Lane {
    fn new(buffer_size: usize) -> Self {
        Self {
            first: AtomicU64::new(0),
            last: AtomicU64::new(0),
            free: AtomicUsize::new(buffer_size),
            mutex: Mutex::new(()),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    fn occupancy(&self) -> u64 {
        let last = self.last.load(Ordering::Acquire);
        let first = self.first.load(Ordering::Acquire);
        last.saturating_sub(first)
    }

    fn wake_all(&self) {
        let _guard = lock(&self.mutex);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}

/// `[lane][socket][slot]`
type Slots = Vec<Vec<Vec<Mutex<Vec<u8>>>>>;

struct Layout {
    frame_bytes: Vec<usize>,
    n_frames: usize,
}

impl Layout {
    fn stream_bytes(&self, stream: usize) -> usize {
        self.frame_bytes[stream] * self.n_frames
    }
}

struct Shared {
    config: AdaptorConfig,
    n_lanes: usize,
    lanes: Vec<Lane>,
    layout: RwLock<Layout>,
    slots: RwLock<Option<Slots>>,
    cancelled: AtomicBool,
    epoch: AtomicU64,
    pushers: Mutex<Vec<bool>>,
    pullers: Mutex<Vec<bool>>,
}

impl Shared {
    fn lane(&self, index: usize) -> &Lane {
        &self.lanes[index % self.n_lanes]
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        for lane in &self.lanes {
            lane.wake_all();
        }
    }

    fn is_empty(&self) -> bool {
        self.lanes.iter().all(|l| l.occupancy() == 0)
    }

    /// Block until `ready` holds on `lane`, or fail when cancelled while not ready
    fn wait_until(&self, lane: &Lane, ready: impl Fn(&Lane) -> bool, on_full: bool) -> CoreResult<()> {
        if ready(lane) {
            return Ok(());
        }
        match self.config.waiting {
            WaitingMode::Active => loop {
                if ready(lane) {
                    return Ok(());
                }
                if self.is_cancelled() {
                    return Err(CoreError::Cancelled);
                }
                std::hint::spin_loop();
                std::thread::yield_now();
            },
            WaitingMode::Passive => {
                let condvar = if on_full { &lane.not_full } else { &lane.not_empty };
                let mut guard = lock(&lane.mutex);
                while !ready(lane) {
                    if self.is_cancelled() {
                        return Err(CoreError::Cancelled);
                    }
                    guard = condvar.wait(guard).unwrap_or_else(PoisonError::into_inner);
                }
                Ok(())
            }
        }
    }

    fn wait_drained(&self) {
        for lane in &self.lanes {
            match self.config.waiting {
                WaitingMode::Active => {
                    while lane.occupancy() > 0 && !self.is_cancelled() {
                        std::hint::spin_loop();
                        std::thread::yield_now();
                    }
                }
                WaitingMode::Passive => {
                    let mut guard = lock(&lane.mutex);
                    while lane.occupancy() > 0 && !self.is_cancelled() {
                        guard = lane
                            .not_full
                            .wait(guard)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
        }
    }

    fn register(&self, registry: &Mutex<Vec<bool>>, role: &str) -> CoreResult<usize> {
        let mut taken = lock(registry);
        match taken.iter().position(|t| !t) {
            Some(id) => {
                taken[id] = true;
                Ok(id)
            }
            None => Err(CoreError::config(
                role,
                format!("more than the {} expected {role}s registered", taken.len()),
            )),
        }
    }

    fn registered(registry: &Mutex<Vec<bool>>) -> usize {
        lock(registry).iter().filter(|t| **t).count()
    }

    /// Move bytes between a socket buffer and a slot
    fn transfer(&self, lane: usize, slot: usize, streams: &[&SocketBuffer], into_slot: bool) -> CoreResult<()> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let slots = slots
            .as_ref()
            .ok_or_else(|| CoreError::invariant("adaptor buffers are not allocated"))?;
        let lane_slots = &slots[lane];
        if streams.len() != lane_slots.len() {
            return Err(CoreError::invariant(format!(
                "adaptor carries {} streams, got {}",
                lane_slots.len(),
                streams.len()
            )));
        }
        for (stream, buffer) in streams.iter().enumerate() {
            let mut stored = lock(&lane_slots[stream][slot]);
            let mut bytes = buffer.lock();
            if stored.len() != bytes.len() {
                return Err(CoreError::invariant(format!(
                    "stream {stream} holds {} bytes, socket holds {}",
                    stored.len(),
                    bytes.len()
                )));
            }
            if self.config.zero_copy {
                std::mem::swap(&mut *stored, &mut *bytes);
            } else if into_slot {
                stored.copy_from_slice(&bytes);
            } else {
                bytes.copy_from_slice(&stored);
            }
        }
        Ok(())
    }
}

/// Owning adaptor handle
pub struct Adaptor {
    shared: Arc<Shared>,
}

impl Adaptor {
    /// Create an adaptor carrying one stream per entry of `frame_bytes`
    ///
    /// # Errors
    ///
    /// Configuration errors for a zero buffer size, no stream, no
    /// producer/consumer, or more than [`MAX_LANES`] lanes.
    pub fn new(config: AdaptorConfig, frame_bytes: Vec<usize>, n_frames: usize) -> CoreResult<Self> {
        if config.buffer_size == 0 {
            return Err(CoreError::config("buffer_size", "must be greater than zero"));
        }
        if frame_bytes.is_empty() {
            return Err(CoreError::config("streams", "an adaptor needs at least one stream"));
        }
        if config.n_producers == 0 || config.n_consumers == 0 {
            return Err(CoreError::config(
                "replicas",
                "an adaptor needs at least one producer and one consumer",
            ));
        }
        if n_frames == 0 {
            return Err(CoreError::config("n_frames", "must be greater than zero"));
        }
        let n_lanes = lcm(config.n_producers, config.n_consumers);
        if n_lanes > MAX_LANES {
            return Err(CoreError::config(
                "replicas",
                format!(
                    "lcm({}, {}) = {n_lanes} lanes exceeds {MAX_LANES}",
                    config.n_producers, config.n_consumers
                ),
            ));
        }

        debug!(
            n_lanes,
            buffer_size = config.buffer_size,
            streams = frame_bytes.len(),
            "adaptor created"
        );
        let shared = Shared {
            n_lanes,
            lanes: (0..n_lanes).map(|_| Lane::new(config.buffer_size)).collect(),
            layout: RwLock::new(Layout {
                frame_bytes,
                n_frames,
            }),
            slots: RwLock::new(None),
            cancelled: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            pushers: Mutex::new(vec![false; config.n_producers]),
            pullers: Mutex::new(vec![false; config.n_consumers]),
            config,
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &AdaptorConfig {
        &self.shared.config
    }

    /// Number of lanes
    #[must_use]
    pub fn n_lanes(&self) -> usize {
        self.shared.n_lanes
    }

    /// Number of streams
    #[must_use]
    pub fn n_streams(&self) -> usize {
        self.shared
            .layout
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .frame_bytes
            .len()
    }

    /// Register a producer handle
    pub fn add_pusher(&self) -> CoreResult<Pusher> {
        Pusher::register(&self.shared)
    }

    /// Register a consumer handle
    pub fn add_puller(&self) -> CoreResult<Puller> {
        Puller::register(&self.shared)
    }

    /// Clonable cancel/drain handle
    #[must_use]
    pub fn signal(&self) -> AdaptorSignal {
        AdaptorSignal {
            shared: self.shared.clone(),
        }
    }

    /// Whether the slots are allocated
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.shared
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Allocate every `[lane][stream][slot]` buffer
    ///
    /// # Errors
    ///
    /// Invariant errors when already allocated or when the registered
    /// handles do not match the expected producer/consumer counts.
    pub fn alloc_buffers(&self) -> CoreResult<()> {
        let config = &self.shared.config;
        let pushers = Shared::registered(&self.shared.pushers);
        let pullers = Shared::registered(&self.shared.pullers);
        if pushers != config.n_producers || pullers != config.n_consumers {
            return Err(CoreError::invariant(format!(
                "adaptor expects {} pushers and {} pullers, {pushers} and {pullers} registered",
                config.n_producers, config.n_consumers
            )));
        }
        let mut slots = self.shared.slots.write().unwrap_or_else(PoisonError::into_inner);
        if slots.is_some() {
            return Err(CoreError::invariant("adaptor buffers already allocated"));
        }
        let layout = self.shared.layout.read().unwrap_or_else(PoisonError::into_inner);
        *slots = Some(
            (0..self.shared.n_lanes)
                .map(|_| {
                    (0..layout.frame_bytes.len())
                        .map(|stream| {
                            (0..config.buffer_size)
                                .map(|_| Mutex::new(vec![0; layout.stream_bytes(stream)]))
                                .collect()
                        })
                        .collect()
                })
                .collect(),
        );
        debug!(n_lanes = self.shared.n_lanes, "adaptor buffers allocated");
        Ok(())
    }

    /// Release the slots; false when nothing was allocated
    pub fn dealloc_buffers(&self) -> bool {
        self.shared
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    /// Empty every lane and clear the cancellation flag
    pub fn reset(&self) {
        for lane in &self.shared.lanes {
            let _guard = lock(&lane.mutex);
            lane.first.store(0, Ordering::Release);
            lane.last.store(0, Ordering::Release);
            lane.free.store(self.shared.config.buffer_size, Ordering::Release);
        }
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        self.shared.cancelled.store(false, Ordering::Release);
    }

    /// Wake every waiter and make blocked waits fail with `Cancelled`
    pub fn cancel_waiting(&self) {
        self.shared.cancel();
    }

    /// Whether waits are cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Resize every slot to carry `n_frames` frames
    pub fn set_n_frames(&mut self, n_frames: usize) -> CoreResult<()> {
        if n_frames == 0 {
            return Err(CoreError::config("n_frames", "must be greater than zero"));
        }
        let mut layout = self.shared.layout.write().unwrap_or_else(PoisonError::into_inner);
        layout.n_frames = n_frames;
        let mut slots = self.shared.slots.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slots) = slots.as_mut() {
            for lane in slots.iter_mut() {
                for (stream, stream_slots) in lane.iter_mut().enumerate() {
                    let bytes = layout.stream_bytes(stream);
                    for slot in stream_slots.iter_mut() {
                        slot.get_mut()
                            .unwrap_or_else(PoisonError::into_inner)
                            .resize(bytes, 0);
                    }
                }
            }
        }
        Ok(())
    }

    /// Filled slots of one lane
    #[must_use]
    pub fn lane_occupancy(&self, lane: usize) -> usize {
        self.shared.lane(lane).occupancy() as usize
    }

    /// Filled slots across all lanes
    #[must_use]
    pub fn occupancy(&self) -> usize {
        self.shared.lanes.iter().map(|l| l.occupancy() as usize).sum()
    }

    /// Free slots across all lanes
    #[must_use]
    pub fn n_free_slots(&self) -> usize {
        self.shared
            .lanes
            .iter()
            .map(|l| l.free.load(Ordering::Acquire))
            .sum()
    }

    /// Whether every lane is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    /// Block until every lane is empty or waits are cancelled
    pub fn wait_drained(&self) {
        self.shared.wait_drained();
    }
}

impl ZeroCopyRebind for Adaptor {
    fn supports_zero_copy_rebind(&self) -> bool {
        self.shared.config.zero_copy
    }
}

impl std::fmt::Debug for Adaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adaptor")
            .field("config", &self.shared.config)
            .field("n_lanes", &self.shared.n_lanes)
            .field("occupancy", &self.occupancy())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Clonable handle to cancel an adaptor or wait for it to drain
#[derive(Clone)]
pub struct AdaptorSignal {
    shared: Arc<Shared>,
}

impl AdaptorSignal {
    /// Wake every waiter and make blocked waits fail
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Whether waits are cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Whether every lane is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    /// Block until every lane is empty or waits are cancelled
    pub fn wait_drained(&self) {
        self.shared.wait_drained();
    }
}

impl std::fmt::Debug for AdaptorSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptorSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Producer handle
pub struct Pusher {
    shared: Arc<Shared>,
    id: usize,
    lane: usize,
    epoch: u64,
}

impl Pusher {
    fn register(shared: &Arc<Shared>) -> CoreResult<Self> {
        let id = shared.register(&shared.pushers, "pusher")?;
        Ok(Self {
            shared: shared.clone(),
            id,
            lane: id,
            epoch: shared.epoch.load(Ordering::Acquire),
        })
    }

    /// Register another producer on the same adaptor
    pub fn sibling(&self) -> CoreResult<Self> {
        Self::register(&self.shared)
    }

    /// Producer id
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Lane the next push goes to
    #[must_use]
    pub const fn lane(&self) -> usize {
        self.lane
    }

    fn sync_epoch(&mut self) {
        let epoch = self.shared.epoch.load(Ordering::Acquire);
        if epoch != self.epoch {
            self.epoch = epoch;
            self.lane = self.id;
        }
    }

    /// Block until the current lane has a free slot
    pub fn wait_push(&mut self) -> CoreResult<()> {
        self.sync_epoch();
        let size = self.shared.config.buffer_size as u64;
        let lane = self.shared.lane(self.lane);
        self.shared.wait_until(lane, |l| l.occupancy() < size, true)
    }

    /// Store one frame of every stream and move to the next lane
    ///
    /// # Errors
    ///
    /// `Cancelled` when the lane is full and waits are cancelled.
    pub fn push(&mut self, streams: &[&SocketBuffer]) -> CoreResult<()> {
        self.wait_push()?;
        let shared = &self.shared;
        let lane = shared.lane(self.lane);
        let slot = (lane.last.load(Ordering::Acquire) % shared.config.buffer_size as u64) as usize;
        shared.transfer(self.lane, slot, streams, true)?;

        lane.last.fetch_add(1, Ordering::AcqRel);
        lane.free.fetch_sub(1, Ordering::AcqRel);
        if shared.config.waiting == WaitingMode::Passive {
            let _guard = lock(&lane.mutex);
            lane.not_empty.notify_all();
        }
        self.lane = (self.lane + shared.config.n_producers) % shared.n_lanes;
        Ok(())
    }
}

impl Drop for Pusher {
    fn drop(&mut self) {
        if let Some(taken) = lock(&self.shared.pushers).get_mut(self.id) {
            *taken = false;
        }
    }
}

impl std::fmt::Debug for Pusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pusher")
            .field("id", &self.id)
            .field("lane", &self.lane)
            .finish()
    }
}

/// Consumer handle
pub struct Puller {
    shared: Arc<Shared>,
    id: usize,
    lane: usize,
    epoch: u64,
}

impl Puller {
    fn register(shared: &Arc<Shared>) -> CoreResult<Self> {
        let id = shared.register(&shared.pullers, "puller")?;
        Ok(Self {
            shared: shared.clone(),
            id,
            lane: id,
            epoch: shared.epoch.load(Ordering::Acquire),
        })
    }

    /// Register another consumer on the same adaptor
    pub fn sibling(&self) -> CoreResult<Self> {
        Self::register(&self.shared)
    }

    /// Consumer id
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Lane the next pull comes from
    #[must_use]
    pub const fn lane(&self) -> usize {
        self.lane
    }

    fn sync_epoch(&mut self) {
        let epoch = self.shared.epoch.load(Ordering::Acquire);
        if epoch != self.epoch {
            self.epoch = epoch;
            self.lane = self.id;
        }
    }

    /// Block until the current lane has a filled slot
    pub fn wait_pull(&mut self) -> CoreResult<()> {
        self.sync_epoch();
        let lane = self.shared.lane(self.lane);
        self.shared.wait_until(lane, |l| l.occupancy() > 0, false)
    }

    /// Load one frame of every stream and move to the next lane
    ///
    /// # Errors
    ///
    /// `Cancelled` when the lane is empty and waits are cancelled.
    pub fn pull(&mut self, streams: &[&SocketBuffer]) -> CoreResult<()> {
        self.wait_pull()?;
        let shared = &self.shared;
        let lane = shared.lane(self.lane);
        let slot = (lane.first.load(Ordering::Acquire) % shared.config.buffer_size as u64) as usize;
        shared.transfer(self.lane, slot, streams, false)?;

        lane.first.fetch_add(1, Ordering::AcqRel);
        lane.free.fetch_add(1, Ordering::AcqRel);
        if shared.config.waiting == WaitingMode::Passive {
            let _guard = lock(&lane.mutex);
            lane.not_full.notify_all();
        }
        self.lane = (self.lane + shared.config.n_consumers) % shared.n_lanes;
        Ok(())
    }
}

impl Drop for Puller {
    fn drop(&mut self) {
        if let Some(taken) = lock(&self.shared.pullers).get_mut(self.id) {
            *taken = false;
        }
    }
}

impl std::fmt::Debug for Puller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Puller")
            .field("id", &self.id)
            .field("lane", &self.lane)
            .finish()
    }
}
