//! Per-device sequential lanes.
//!
//! Every decoded reading, from the bus or the synchronous API, goes through
//! one bounded channel into the dispatcher, which routes it to a lane keyed
//! by device id. A lane is the dispatcher's record of one device: its queued
//! readings, whether one is being processed, and its anomaly window. At most
//! one reading per device is in flight, so different devices run
//! concurrently and the same device never does.
//!
//! The dispatcher never waits on a lane. A slow device only grows its own
//! queue; readings for other devices keep flowing. A lane is dropped once
//! its queue is empty and it holds no window, which is always the case for
//! ids that never resolved to a registered device.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::errors::{Error, Result};
use crate::metrics::{ACTIVE_LANES, CHANNEL_FULL_TOTAL, LANE_BACKLOG_TOTAL};
use crate::model::{ProcessOutcome, ReadingEvent};
use crate::processor::Processor;
use crate::rules::AnomalyWindow;

#[derive(Debug)]
pub enum Job {
    /// Fire-and-forget reading from the bus.
    Bus(ReadingEvent),
    /// Reading from the synchronous ingress; the outcome is sent back.
    Direct {
        event: ReadingEvent,
        reply: oneshot::Sender<Result<ProcessOutcome>>,
    },
}

impl Job {
    fn device_id(&self) -> &str {
        match self {
            Job::Bus(event) => &event.device_id,
            Job::Direct { event, .. } => &event.device_id,
        }
    }
}

/// Cloneable sending side of the dispatcher channel.
#[derive(Debug, Clone)]
pub struct IngressHandle {
    tx: mpsc::Sender<Job>,
}

impl IngressHandle {
    pub fn new(tx: mpsc::Sender<Job>) -> Self {
        Self { tx }
    }

    /// Queues a bus reading. Tries a non-blocking send first and only waits
    /// for room when the channel is full.
    pub async fn forward(&self, event: ReadingEvent) -> Result<()> {
        match self.tx.try_send(Job::Bus(event)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job)) => {
                CHANNEL_FULL_TOTAL.inc();
                debug!("Ingress channel full, waiting for capacity");
                self.tx.send(job).await.map_err(|_| Error::ChannelSend)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("Ingress channel closed, cannot forward reading");
                Err(Error::ChannelSend)
            }
        }
    }

    /// Runs a reading through its device lane and waits for the outcome.
    pub async fn submit(&self, event: ReadingEvent) -> Result<ProcessOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(Job::Direct { event, reply })
            .await
            .map_err(|_| Error::ChannelSend)?;
        outcome.await.map_err(|_| Error::ChannelSend)?
    }
}

/// Creates the dispatcher channel.
pub fn channel(capacity: usize) -> (IngressHandle, mpsc::Receiver<Job>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (IngressHandle::new(tx), rx)
}

#[derive(Default)]
struct Lane {
    queue: VecDeque<Job>,
    window: Option<AnomalyWindow>,
    busy: bool,
}

/// What a processing task hands back to the dispatcher.
struct Finished {
    device_id: String,
    window: Option<AnomalyWindow>,
}

struct Lanes {
    processor: Arc<Processor>,
    capacity: usize,
    lanes: HashMap<String, Lane>,
    running: JoinSet<Finished>,
}

impl Lanes {
    fn new(processor: Arc<Processor>, capacity: usize) -> Self {
        Self {
            processor,
            capacity: capacity.max(1),
            lanes: HashMap::new(),
            running: JoinSet::new(),
        }
    }

    fn route(&mut self, job: Job) {
        let device_id = job.device_id().to_string();
        let lane = self.lanes.entry(device_id.clone()).or_insert_with(|| {
            ACTIVE_LANES.inc();
            Lane::default()
        });

        if !lane.busy {
            lane.busy = true;
            let window = lane.window.take();
            self.running
                .spawn(run_job(self.processor.clone(), device_id, job, window));
            return;
        }

        lane.queue.push_back(job);
        if lane.queue.len() > self.capacity {
            LANE_BACKLOG_TOTAL.inc();
            if lane.queue.len() == self.capacity + 1 {
                warn!(
                    "Lane for {} is {} readings behind",
                    device_id,
                    lane.queue.len()
                );
            }
        }
    }

    fn finish(&mut self, done: Finished) {
        let Finished { device_id, window } = done;
        let Some(lane) = self.lanes.get_mut(&device_id) else {
            return;
        };

        match lane.queue.pop_front() {
            Some(job) => {
                self.running
                    .spawn(run_job(self.processor.clone(), device_id, job, window));
            }
            None if window.is_some() => {
                lane.window = window;
                lane.busy = false;
            }
            None => {
                self.lanes.remove(&device_id);
                ACTIVE_LANES.dec();
                debug!("Lane for {} closed", device_id);
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.running.is_empty()
    }

    fn len(&self) -> usize {
        self.lanes.len()
    }
}

/// Routes jobs to lanes until every `IngressHandle` is dropped, then lets
/// each lane drain its queue before returning.
pub async fn run_dispatcher(
    mut rx: mpsc::Receiver<Job>,
    processor: Arc<Processor>,
    lane_capacity: usize,
) {
    info!("Starting dispatcher with lane_capacity={}", lane_capacity);

    let mut lanes = Lanes::new(processor, lane_capacity);
    let mut open = true;

    loop {
        tokio::select! {
            job = rx.recv(), if open => match job {
                Some(job) => lanes.route(job),
                None => {
                    info!("Ingress closed, draining {} lanes", lanes.len());
                    open = false;
                }
            },
            Some(finished) = lanes.running.join_next(), if !lanes.is_idle() => match finished {
                Ok(done) => lanes.finish(done),
                Err(e) => error!("Lane task failed: {}", e),
            },
            else => break,
        }
    }

    ACTIVE_LANES.sub(lanes.len() as f64);
    info!("Dispatcher stopped");
}

/// Processes one reading. A panic is contained here so the lane can move
/// on; the window is discarded and reseeded from the store next time.
async fn run_job(
    processor: Arc<Processor>,
    device_id: String,
    job: Job,
    mut window: Option<AnomalyWindow>,
) -> Finished {
    let handled = AssertUnwindSafe(handle_job(&processor, &device_id, job, &mut window))
        .catch_unwind()
        .await;

    if handled.is_err() {
        error!("Processing for {} panicked, resetting its lane", device_id);
        window = None;
    }

    Finished { device_id, window }
}

async fn handle_job(
    processor: &Processor,
    device_id: &str,
    job: Job,
    window: &mut Option<AnomalyWindow>,
) {
    match job {
        Job::Bus(event) => {
            if let Err(e) = processor.handle(event, window).await {
                report_failure(device_id, &e);
            }
        }
        Job::Direct { event, reply } => {
            let outcome = processor.handle(event, window).await;
            if let Err(e) = &outcome {
                report_failure(device_id, e);
            }
            let _ = reply.send(outcome);
        }
    }
}

fn report_failure(device_id: &str, err: &Error) {
    match err {
        Error::UnknownDevice(_) => warn!("Unknown sensor {}, reading dropped", device_id),
        // Store failures are logged where they happen.
        e if e.is_persistence() => debug!("Reading from {} aborted: {}", device_id, e),
        e => error!("Error processing reading from {}: {}", device_id, e),
    }
}
