use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};

pub type JobId = u64;
type JobFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Entry {
    id: JobId,
    job: JobFn,
    every: Option<Duration>,
    next_run: Instant,
}

enum Command {
    Add(Entry),
    Trigger(JobId),
    Cancel(JobId),
    Shutdown(oneshot::Sender<()>),
}

/// Cooperative scheduler (C6). Every job — periodic, one-shot, or manually
/// triggered — runs sequentially on a single background worker task, so no
/// two jobs ever mutate shared state concurrently. A slow job delays the
/// next tick of every other job; job bodies are expected to be short, or to
/// spawn their own fire-and-forget work when overlap is acceptable.
pub struct Scheduler {
    tx: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::run(rx));

        Arc::new(Scheduler {
            tx,
            next_id: AtomicU64::new(1),
            worker: Mutex::new(Some(worker)),
        })
    }

    async fn run(mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut entries: Vec<Entry> = Vec::new();

        loop {
            let sleep_dur = entries
                .iter()
                .map(|e| e.next_run.saturating_duration_since(Instant::now()))
                .min()
                .unwrap_or(Duration::from_secs(3600));

            tokio::select! {
                _ = tokio::time::sleep(sleep_dur) => {
                    let now = Instant::now();
                    let due: Vec<usize> = entries
                        .iter()
                        .enumerate()
                        .filter(|(_, e)| e.next_run <= now)
                        .map(|(i, _)| i)
                        .collect();

                    let mut to_remove = Vec::new();
                    for idx in due {
                        (entries[idx].job)().await;
                        match entries[idx].every {
                            Some(period) => entries[idx].next_run = Instant::now() + period,
                            None => to_remove.push(entries[idx].id),
                        }
                    }
                    entries.retain(|e| !to_remove.contains(&e.id));
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(Command::Add(entry)) => entries.push(entry),
                        Some(Command::Trigger(id)) => {
                            let mut remove = false;
                            if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
                                (entry.job)().await;
                                match entry.every {
                                    Some(period) => entry.next_run = Instant::now() + period,
                                    None => remove = true,
                                }
                            }
                            if remove {
                                entries.retain(|e| e.id != id);
                            }
                        }
                        Some(Command::Cancel(id)) => entries.retain(|e| e.id != id),
                        Some(Command::Shutdown(done)) => {
                            let _ = done.send(());
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Register a periodic job, first firing after `delay`, then every
    /// `every`.
    pub fn schedule(&self, job: JobFn, every: Duration, delay: Duration) -> JobId {
        self.add(job, Some(every), delay)
    }

    /// Register a job that fires once after `delay`.
    pub fn schedule_once(&self, job: JobFn, delay: Duration) -> JobId {
        self.add(job, None, delay)
    }

    fn add(&self, job: JobFn, every: Option<Duration>, delay: Duration) -> JobId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = Entry {
            id,
            job,
            every,
            next_run: Instant::now() + delay,
        };
        let _ = self.tx.send(Command::Add(entry));
        id
    }

    /// Run `id` as soon as possible, outside its normal schedule.
    pub fn trigger(&self, id: JobId) {
        let _ = self.tx.send(Command::Trigger(id));
    }

    pub fn cancel(&self, id: JobId) {
        let _ = self.tx.send(Command::Cancel(id));
    }

    /// Wait for the in-flight job (if any) to finish, then stop the worker.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AOrdering};

    fn counting_job(counter: Arc<AtomicUsize>) -> JobFn {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, AOrdering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn one_shot_job_runs_once_after_delay() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_once(counting_job(counter.clone()), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(AOrdering::SeqCst), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn periodic_job_runs_more_than_once() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(
            counting_job(counter.clone()),
            Duration::from_millis(20),
            Duration::from_millis(5),
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(counter.load(AOrdering::SeqCst) >= 2);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn trigger_runs_job_immediately() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = scheduler.schedule(
            counting_job(counter.clone()),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.trigger(id);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(AOrdering::SeqCst), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_prevents_future_runs() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = scheduler.schedule(
            counting_job(counter.clone()),
            Duration::from_millis(20),
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(5)).await;
        scheduler.cancel(id);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(AOrdering::SeqCst), 0);
        scheduler.shutdown().await;
    }
}
