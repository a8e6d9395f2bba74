//! Spreads concurrency changes evenly over a ramp window.
use async_channel::Sender;
use dbworkload_core::{ControlMessage, WorkerSpec};
use std::time::Duration;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// Issues spawn and kill directives to procs in round-robin order.
///
/// A single cursor is shared by both directions: spawning advances it, killing walks it back,
/// so a ramp-down removes workers from the procs that grew last.
pub(crate) struct RampScheduler {
    mailboxes: Vec<Sender<ControlMessage>>,
    cursor: i64,
    next_worker_id: usize,
    iterations: Option<u64>,
    concurrency: usize,
}

impl RampScheduler {
    pub fn new(
        mailboxes: Vec<Sender<ControlMessage>>,
        iterations: Option<u64>,
        concurrency: usize,
    ) -> Self {
        Self {
            mailboxes,
            cursor: -1,
            next_worker_id: 0,
            iterations,
            concurrency,
        }
    }

    /// Workers spawned so far.
    #[cfg(test)]
    pub fn spawned(&self) -> usize {
        self.next_worker_id
    }

    fn next_forward(&mut self) -> usize {
        self.cursor += 1;
        self.cursor.rem_euclid(self.mailboxes.len() as i64) as usize
    }

    fn next_backward(&mut self) -> usize {
        let idx = self.cursor.rem_euclid(self.mailboxes.len() as i64) as usize;
        self.cursor -= 1;
        idx
    }

    /// Move from `from` to `to` workers, one directive every `window / |to - from|`.
    pub async fn ramp(mut self, from: usize, to: usize, window: Duration) -> Self {
        if from == to || self.mailboxes.is_empty() {
            return self;
        }

        let delta = from.abs_diff(to);
        let interval = window.div_f64(delta as f64);
        debug!(
            "Ramping from {from} to {to} workers, one every {}",
            humantime::format_duration(interval)
        );

        for _ in 0..delta {
            let (idx, msg) = if to > from {
                let idx = self.next_forward();
                let spec = WorkerSpec {
                    id: self.next_worker_id,
                    iterations: self.iterations,
                    concurrency: self.concurrency,
                };
                self.next_worker_id += 1;
                (idx, ControlMessage::SpawnWorker(spec))
            } else {
                (self.next_backward(), ControlMessage::KillOneWorker)
            };

            trace!("Sending {msg:?} to PROC-{idx}");
            if self.mailboxes[idx].send(msg).await.is_err() {
                warn!("PROC-{idx} mailbox closed");
            }
            tokio::time::sleep(interval).await;
        }

        self
    }
}
