//! Cancellable, bounded-duration polling.
//!
//! A [`Poller`] runs a probe on a fixed cadence until a termination predicate
//! holds or a hard deadline passes. Every result is handed to a sink under a
//! generation gate:
//!
//! - [`Poller::stop`] bumps the generation while holding the gate, so once it
//!   returns no sink call can start, and one already running has finished;
//! - the polling task checks its own generation against the gate before every
//!   delivery, so a response that arrives after `stop` is discarded.
//!
//! The sink runs while the gate is held. It must not call back into the same
//! poller (`stop` or drop), or it will deadlock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Shortest cadence a poller will run at.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Cadence and hard limit for one polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_duration: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5_000),
            max_duration: Duration::from_secs(30 * 60),
        }
    }
}

impl PollSettings {
    /// `interval` is raised to at least [`MIN_INTERVAL`].
    pub fn new(interval: Duration, max_duration: Duration) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            max_duration,
        }
    }

    pub fn from_config(config: &mkopo_core::Config) -> Self {
        Self::new(config.poll_interval(), config.max_poll_duration())
    }
}

/// What a poller delivers to its sink.
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent<T> {
    /// A non-terminal observation; polling continues.
    Observed { tick: u32, value: T },
    /// The termination predicate held; polling has stopped.
    Finished { tick: u32, value: T },
    /// The deadline passed first; polling has stopped.
    TimedOut { ticks: u32, elapsed: Duration },
}

struct Gate {
    generation: u64,
}

/// Handle to a running polling loop.
pub struct Poller {
    gate: Arc<Mutex<Gate>>,
    generation: u64,
    task: JoinHandle<()>,
}

impl Poller {
    /// Start polling.
    ///
    /// - `probe(tick)` fetches one observation; `None` means the tick failed
    ///   and is simply retried on the next interval.
    /// - `done` decides whether an observation is terminal.
    /// - `sink` receives every event, under the generation gate.
    ///
    /// The first probe runs one `interval` after start. An interval below
    /// [`MIN_INTERVAL`] runs at [`MIN_INTERVAL`].
    pub fn spawn<T, P, D, S>(settings: PollSettings, mut probe: P, done: D, mut sink: S) -> Self
    where
        T: Send + 'static,
        P: FnMut(u32) -> BoxFuture<'static, Option<T>> + Send + 'static,
        D: Fn(&T) -> bool + Send + 'static,
        S: FnMut(PollEvent<T>) + Send + 'static,
    {
        let gate = Arc::new(Mutex::new(Gate { generation: 0 }));
        let generation = 0;
        let task_gate = Arc::clone(&gate);

        let task = tokio::spawn(async move {
            let start = Instant::now();
            let deadline = start + settings.max_duration;
            let interval = settings.interval.max(MIN_INTERVAL);
            let mut ticker = tokio::time::interval_at(start + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks: u32 = 0;

            let deliver = |sink: &mut S, event: PollEvent<T>| -> bool {
                let gate = task_gate.lock().unwrap_or_else(|p| p.into_inner());
                if gate.generation != generation {
                    return false;
                }
                sink(event);
                true
            };

            loop {
                tokio::select! {
                    biased;
                    _ = tokio::time::sleep_until(deadline) => {
                        let event = PollEvent::TimedOut { ticks, elapsed: start.elapsed() };
                        deliver(&mut sink, event);
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                ticks += 1;
                let observed = tokio::select! {
                    biased;
                    _ = tokio::time::sleep_until(deadline) => {
                        let event = PollEvent::TimedOut { ticks, elapsed: start.elapsed() };
                        deliver(&mut sink, event);
                        return;
                    }
                    value = probe(ticks) => value,
                };

                let Some(value) = observed else {
                    debug!(tick = ticks, "poll tick produced nothing, retrying next interval");
                    continue;
                };

                let finished = done(&value);
                let event = if finished {
                    PollEvent::Finished { tick: ticks, value }
                } else {
                    PollEvent::Observed { tick: ticks, value }
                };
                if !deliver(&mut sink, event) || finished {
                    return;
                }
            }
        });

        Self {
            gate,
            generation,
            task,
        }
    }

    /// Stop polling. After this returns the sink is never called again.
    pub fn stop(&self) {
        {
            let mut gate = self.gate.lock().unwrap_or_else(|p| p.into_inner());
            if gate.generation == self.generation {
                gate.generation += 1;
            }
        }
        self.task.abort();
    }

    /// The loop has exited, by completion, timeout or stop.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn is_stopped(&self) -> bool {
        let gate = self.gate.lock().unwrap_or_else(|p| p.into_inner());
        gate.generation != self.generation
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.task.abort();
    }
}
