//! Dual timed loop driving a world
//!
//! The simulation loop steps entities at a fixed nominal rate, the flush loop
//! diffs entity state into update batches and hands every pending queue to its
//! transport. Both loops live in one task that owns the world, so ticks never
//! interleave. Inbound transport events are drained before every tick.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::metrics::{Metrics, TickTimings};
use crate::net::inbound::{InboundBuffer, InboundEvent, InboundSender};
use crate::world::server::{FlushReport, World};

/// Elapsed time expressed in nominal frames
pub fn normalized_dt(elapsed: Duration, period: Duration) -> f64 {
    let period = period.as_secs_f64();
    if period <= 0.0 {
        return 1.0;
    }
    elapsed.as_secs_f64() / period
}

/// Nominal-rate clock shared by the server loops and the client mirror
#[derive(Debug, Clone)]
pub struct TickClock {
    period: Duration,
    last: Option<Instant>,
}

impl TickClock {
    pub fn new(period: Duration) -> Self {
        Self { period, last: None }
    }

    /// Clock ticking `rate` times per second
    pub fn from_rate(rate: u32) -> Self {
        Self::new(Duration::from_secs_f64(1.0 / f64::from(rate.max(1))))
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Advance the clock to `now` and return the normalized delta
    ///
    /// The first tick has no predecessor and reports exactly one frame.
    pub fn tick(&mut self, now: Instant) -> f64 {
        let dt = match self.last {
            Some(prev) => normalized_dt(now.saturating_duration_since(prev), self.period),
            None => 1.0,
        };
        self.last = Some(now);
        dt
    }

    /// Deadline of the next tick, or `None` when this tick overran its period
    pub fn next_deadline(&self, started: Instant, finished: Instant) -> Option<Instant> {
        let processing = finished.saturating_duration_since(started);
        if processing >= self.period {
            None
        } else {
            Some(finished + self.period.saturating_sub(processing))
        }
    }
}

/// Owns the world and runs its simulation and flush loops
pub struct Scheduler {
    world: World,
    inbound: InboundBuffer,
    metrics: Arc<Metrics>,
    simulation: TickClock,
    flush: TickClock,
}

impl Scheduler {
    pub fn new(world: World, config: &SyncConfig, metrics: Arc<Metrics>) -> Self {
        Self::with_periods(
            world,
            config.simulation_period(),
            config.flush_period(),
            metrics,
        )
    }

    pub fn with_periods(
        world: World,
        simulation_period: Duration,
        flush_period: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            world,
            inbound: InboundBuffer::new(),
            metrics,
            simulation: TickClock::new(simulation_period),
            flush: TickClock::new(flush_period),
        }
    }

    /// Sender handle for transport tasks
    pub fn inbound_sender(&self) -> InboundSender {
        self.inbound.sender()
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// Apply every pending transport event to the world
    pub fn drain_inbound(&mut self) -> usize {
        let events = self.inbound.drain();
        let count = events.len();

        for event in events {
            match event {
                InboundEvent::Frame { id, bytes } => {
                    self.metrics.record_inbound(bytes.len());
                    let dispatched = self.world.receive(id, &bytes);
                    self.metrics
                        .messages_received
                        .fetch_add(dispatched as u64, Ordering::Relaxed);
                }
                other => self.world.handle_event(other),
            }
        }

        self.metrics
            .decode_failures
            .store(self.world.decode_failures(), Ordering::Relaxed);
        count
    }

    /// One simulation tick at `now`; returns the dt it ran with
    pub fn simulation_tick(&mut self, now: Instant) -> f64 {
        self.drain_inbound();
        let dt = self.simulation.tick(now);
        self.world.simulate(dt);
        self.publish_gauges();
        dt
    }

    /// One flush tick
    pub fn flush_tick(&mut self) -> FlushReport {
        self.drain_inbound();
        self.flush.tick(Instant::now());
        let report = self.world.flush();
        self.metrics
            .record_flush(report.frames, report.messages, report.bytes);
        self.publish_gauges();
        report
    }

    fn publish_gauges(&self) {
        self.metrics
            .rooms
            .store(self.world.room_count() as u64, Ordering::Relaxed);
        self.metrics
            .entities
            .store(self.world.entity_count() as u64, Ordering::Relaxed);
        self.metrics
            .connections_active
            .store(self.world.connection_count() as u64, Ordering::Relaxed);
    }

    /// Run both loops until `shutdown` resolves, then hand the world back
    pub async fn run_until<F>(mut self, shutdown: F) -> World
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        info!(
            "Scheduler started: simulation every {:?}, flush every {:?}",
            self.simulation.period(),
            self.flush.period()
        );

        let start = Instant::now();
        let mut next_simulation = start;
        let mut next_flush = start + self.flush.period();

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                _ = sleep_until(next_simulation) => {
                    let started = Instant::now();
                    self.simulation_tick(started);
                    let finished = Instant::now();
                    next_simulation = rearm(&self.simulation, &self.metrics.simulation, started, finished).await;
                }

                _ = sleep_until(next_flush) => {
                    let started = Instant::now();
                    let report = self.flush_tick();
                    let finished = Instant::now();
                    if report.frames > 0 {
                        debug!("Flushed {} frames ({} bytes)", report.frames, report.bytes);
                    }
                    next_flush = rearm(&self.flush, &self.metrics.flush, started, finished).await;
                }
            }
        }

        info!("Scheduler stopped");
        self.world
    }

    /// Run both loops forever
    pub async fn run(self) {
        self.run_until(std::future::pending::<()>()).await;
    }
}

/// Record a tick and compute when the loop fires next
///
/// An overrunning loop yields once and runs again immediately.
async fn rearm(clock: &TickClock, timings: &TickTimings, started: Instant, finished: Instant) -> Instant {
    timings.record(finished.saturating_duration_since(started));

    match clock.next_deadline(started, finished) {
        Some(deadline) => deadline,
        None => {
            timings.record_overrun();
            tokio::task::yield_now().await;
            Instant::now()
        }
    }
}
