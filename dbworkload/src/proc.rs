//! Execution procs: one OS thread with its own single-threaded runtime, hosting a dynamic set of
//! worker tasks.
use crate::error::RunError;
use crate::worker::{run_worker, Shared};
use crate::workload::{Backend, Workload};
use async_channel::{Receiver, Sender};
use dbworkload_core::{ControlMessage, Event, WorkerFailure};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::task::JoinSet;
#[allow(unused)]
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Capacity of each proc's control mailbox.
pub(crate) const MAILBOX_CAPACITY: usize = 1024;

pub(crate) struct ProcHandle {
    pub id: usize,
    pub mailbox: Sender<ControlMessage>,
    thread: JoinHandle<()>,
}

impl ProcHandle {
    /// Blocks until the proc thread exits.
    pub fn join(self) {
        if self.thread.join().is_err() {
            error!("PROC-{} panicked", self.id);
        }
    }
}

#[cfg(test)]
impl ProcHandle {
    /// A proc with no workers whose mailbox is whatever the caller hands in.
    pub fn detached(id: usize, mailbox: Sender<ControlMessage>) -> Self {
        Self {
            id,
            mailbox,
            thread: std::thread::spawn(|| {}),
        }
    }
}

pub(crate) fn spawn_proc<B, W>(id: usize, shared: Arc<Shared<B, W>>) -> Result<ProcHandle, RunError>
where
    B: Backend,
    W: Workload<B::Conn>,
{
    let (tx, rx) = async_channel::bounded(MAILBOX_CAPACITY);
    let span = info_span!("proc", id);

    let thread = std::thread::Builder::new()
        .name(format!("proc-{id}"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let failure = WorkerFailure::new(None, "RuntimeError", e.to_string());
                    let _ = shared.events.send_blocking(Event::Fatal(failure));
                    return;
                }
            };
            runtime.block_on(run_proc(id, shared, rx).instrument(span));
        })
        .map_err(RunError::ProcSpawn)?;

    Ok(ProcHandle {
        id,
        mailbox: tx,
        thread,
    })
}

async fn run_proc<B, W>(id: usize, shared: Arc<Shared<B, W>>, mailbox: Receiver<ControlMessage>)
where
    B: Backend,
    W: Workload<B::Conn>,
{
    debug!("PROC-{id} started");

    let (kill_tx, kill_rx) = async_channel::unbounded::<()>();
    let mut workers = JoinSet::new();

    loop {
        tokio::select! {
            msg = mailbox.recv() => match msg {
                Ok(ControlMessage::SpawnWorker(spec)) => {
                    workers.spawn(run_worker(shared.clone(), spec, kill_rx.clone()));
                }
                Ok(ControlMessage::KillOneWorker) => {
                    if workers.is_empty() {
                        warn!("PROC-{id} has no worker left to kill");
                    } else {
                        // Unbounded, cannot be full. Closed only if every receiver is gone.
                        let _ = kill_tx.try_send(());
                    }
                }
                Ok(ControlMessage::Terminate) | Err(_) => break,
            },
            Some(res) = workers.join_next(), if !workers.is_empty() => {
                report_panic(&shared.events, res).await;
            }
        }
    }

    debug!("PROC-{id} terminating...");
    for _ in 0..workers.len() {
        let _ = kill_tx.try_send(());
    }
    while let Some(res) = workers.join_next().await {
        report_panic(&shared.events, res).await;
    }

    if shared.events.send(Event::ProcReturned { proc_id: id }).await.is_err() {
        trace!("Inbound queue closed");
    }
    debug!("PROC-{id} terminated");
}

async fn report_panic(events: &Sender<Event>, res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        error!("Worker task failed: {e}");
        let failure = WorkerFailure::new(None, "Panic", e.to_string());
        let _ = events.send(Event::Fatal(failure)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use dbworkload_core::WorkerSpec;

    fn spec(id: usize) -> WorkerSpec {
        WorkerSpec {
            id,
            iterations: None,
            concurrency: 2,
        }
    }

    #[tracing_test::traced_test]
    #[test]
    #[ntest::timeout(10_000)]
    fn terminate_joins_every_worker() {
        let (shared, events, counters) = shared(StubBackend::default(), Script::default());
        let proc = spawn_proc(0, shared).unwrap();

        proc.mailbox
            .send_blocking(ControlMessage::SpawnWorker(spec(0)))
            .unwrap();
        proc.mailbox
            .send_blocking(ControlMessage::SpawnWorker(spec(1)))
            .unwrap();
        while counters.cycles() < 10 {
            std::thread::yield_now();
        }
        proc.mailbox.send_blocking(ControlMessage::Terminate).unwrap();
        proc.join();

        let mut inits = 0;
        let mut killed = 0;
        let mut last_stats = 0;
        let mut returned = false;
        while let Ok(event) = events.try_recv() {
            match event {
                Event::Init { .. } => inits += 1,
                Event::GotKilled { .. } => killed += 1,
                Event::Stats(report) if report.last => last_stats += 1,
                Event::ProcReturned { proc_id: 0 } => {
                    // Every worker reports before the proc does.
                    assert_eq!(last_stats, 2);
                    returned = true;
                }
                _ => {}
            }
        }
        assert_eq!((inits, killed, last_stats), (2, 2, 2));
        assert!(returned);
    }

    #[tracing_test::traced_test]
    #[test]
    #[ntest::timeout(10_000)]
    fn kill_one_stops_a_single_worker() {
        let (shared, events, counters) = shared(StubBackend::default(), Script::default());
        let proc = spawn_proc(3, shared).unwrap();

        for id in 0..3 {
            proc.mailbox
                .send_blocking(ControlMessage::SpawnWorker(spec(id)))
                .unwrap();
        }
        proc.mailbox
            .send_blocking(ControlMessage::KillOneWorker)
            .unwrap();

        let mut killed = 0;
        while killed == 0 {
            if let Ok(Event::GotKilled { .. }) = events.recv_blocking() {
                killed += 1;
            }
        }
        let cycles = counters.cycles();
        while counters.cycles() < cycles + 10 {
            std::thread::yield_now();
        }

        proc.mailbox.send_blocking(ControlMessage::Terminate).unwrap();
        proc.join();

        let killed_at_shutdown = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, Event::GotKilled { .. }))
            .count();
        assert_eq!(killed_at_shutdown, 2);
    }
}
