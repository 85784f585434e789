//! The reactor: one poller instance driving all of its checks from a single
//! task.
//!
//! Every cycle timer tick closes the previous cycle (values, availability,
//! requeue) and then pulls and dispatches the next batch. Checks run as
//! futures in one `FuturesUnordered`, so only their I/O waits overlap and
//! all bookkeeping happens on the reactor between polls.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tokio::time::{Duration, Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentRequest, Connector, TcpConnector, TlsRegistry, run_agent_check};
use crate::availability::{AvailabilityConfig, AvailabilityUpdate, InterfaceHealthMap};
use crate::codec::CheckValue;
use crate::collaborators::{Collaborators, ItemState, ValuePipeline, ValueRecord};
use crate::config::PollerSettings;
use crate::error::{CheckError, PollerError, ResultCode};
use crate::http::{HttpEngine, HttpTransport, ReqwestTransport};
use crate::item::{CheckKind, ItemDescriptor, ItemId};
use crate::ledger::{BatchLedger, CycleCounters, StatusReport};
use crate::task::{Completion, TaskFuture, TaskItem};

/// Stop signals for a running poller
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    /// Stop pulling new items, let in-flight checks finish, flush once more
    pub drain: CancellationToken,
    /// Stop at once, abandoning in-flight checks without reporting them
    pub abort: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct Poller {
    settings: PollerSettings,
    availability_config: AvailabilityConfig,
    collaborators: Collaborators,
    connector: Arc<dyn Connector>,
    tls: TlsRegistry,
    http: HttpEngine,
    tasks: FuturesUnordered<TaskFuture>,
    in_flight: HashMap<ItemId, ItemDescriptor>,
    backlog: VecDeque<ItemDescriptor>,
    finished: Vec<ItemDescriptor>,
    health: InterfaceHealthMap,
    ledger: BatchLedger,
    counters: CycleCounters,
    next_report: Instant,
    status: watch::Sender<StatusReport>,
}

impl Poller {
    pub fn new(
        settings: PollerSettings,
        availability_config: AvailabilityConfig,
        collaborators: Collaborators,
        connector: Arc<dyn Connector>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let http = HttpEngine::new(transport, settings.max_http_transfers);
        let next_report = Instant::now() + settings.stat_interval();
        let (status, _) = watch::channel(StatusReport::default());

        Self {
            settings,
            availability_config,
            collaborators,
            connector,
            tls: TlsRegistry::new(),
            http,
            tasks: FuturesUnordered::new(),
            in_flight: HashMap::new(),
            backlog: VecDeque::new(),
            finished: Vec::new(),
            health: InterfaceHealthMap::new(),
            ledger: BatchLedger::new(),
            counters: CycleCounters::default(),
            next_report,
            status,
        }
    }

    /// Poller talking to real sockets and HTTP servers
    pub fn with_default_transports(
        settings: PollerSettings,
        availability_config: AvailabilityConfig,
        collaborators: Collaborators,
    ) -> Self {
        let connector = Arc::new(TcpConnector::new(settings.source_ip));
        let transport = Arc::new(ReqwestTransport::new(settings.timeout(), settings.source_ip));
        Self::new(settings, availability_config, collaborators, connector, transport)
    }

    /// Periodic status reports, updated every status interval
    pub fn status(&self) -> watch::Receiver<StatusReport> {
        self.status.subscribe()
    }

    /// Run until shut down
    pub async fn run(mut self, shutdown: Shutdown) {
        let poller_type = self.settings.poller_type;
        info!(%poller_type, timeout = ?self.settings.timeout(), "poller started");

        let timer = sleep_until(Instant::now());
        tokio::pin!(timer);
        let mut draining = false;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.abort.cancelled() => {
                    let abandoned = self.tasks.len();
                    self.http.abandon_all();
                    warn!(%poller_type, abandoned, "poller aborted");
                    return;
                }

                _ = shutdown.drain.cancelled(), if !draining => {
                    draining = true;
                    info!(%poller_type, in_flight = self.tasks.len(), "draining poller");
                    self.interrupt_backlog();
                }

                Some(completion) = self.tasks.next(), if !self.tasks.is_empty() => {
                    self.finish(completion).await;
                }

                _ = &mut timer => {
                    let delay = self.tick(!draining).await;
                    timer.as_mut().reset(Instant::now() + delay);
                }
            }

            if draining && self.tasks.is_empty() {
                self.end_cycle().await;
                self.report_status(Instant::now());
                info!(%poller_type, "poller stopped");
                return;
            }
        }
    }

    /// Close the current cycle and start the next one; returns the delay
    /// until the following tick
    async fn tick(&mut self, dispatch: bool) -> Duration {
        let started = Instant::now();

        let next_check = self.end_cycle().await;
        if dispatch {
            self.start_cycle().await;
        }

        self.counters.busy += started.elapsed();
        let now = Instant::now();
        if now >= self.next_report {
            self.report_status(now);
        }

        match next_check {
            Some(next_check) if next_check <= unix_now() => {
                debug!(next_check, "items already due, re-arming the cycle timer");
                Duration::ZERO
            }
            _ => self.settings.cycle_interval(),
        }
    }

    async fn start_cycle(&mut self) {
        let items = if self.backlog.is_empty() {
            let pulled = self
                .collaborators
                .scheduler
                .pull_due_items(self.settings.poller_type, self.settings.timeout(), self.tasks.len())
                .await;

            match pulled {
                Ok(mut items) => {
                    if items.len() > self.settings.max_batch {
                        let surplus = items.split_off(self.settings.max_batch);
                        debug!(surplus = surplus.len(), "batch over the limit, keeping the rest for the next cycle");
                        self.backlog.extend(surplus);
                    }
                    items
                }
                Err(e) => {
                    warn!(error = %e, "cannot pull due items");
                    return;
                }
            }
        } else {
            let take = self.backlog.len().min(self.settings.max_batch);
            self.backlog.drain(..take).collect()
        };

        self.counters.queued += items.len() as u64;

        // Dispatch first, then fail fast, so failures never wait for the next tick
        let mut failed = Vec::new();
        for item in items {
            if let Err((task, error)) = self.dispatch(&item) {
                failed.push((item, task, error));
            } else {
                self.in_flight.insert(item.item_id, item);
            }
        }

        for (item, task, error) in failed {
            debug!(
                item_id = task.item_id,
                host = %task.host_name,
                key = %task.key_orig,
                error = %error,
                "check failed before dispatch"
            );
            let ts = unix_now();
            self.ledger.push(task.item_id, ts, error.code);
            submit(self.collaborators.values.as_ref(), &task, Err(error), ts).await;
            self.counters.processed += 1;
            self.finished.push(item);
        }
    }

    fn dispatch(&mut self, item: &ItemDescriptor) -> Result<(), (TaskItem, CheckError)> {
        let task = TaskItem::from(item);
        let deadline = Instant::now() + self.settings.timeout();

        let future: Result<TaskFuture, CheckError> = match &item.check {
            CheckKind::Agent(check) => {
                self.tls.session(&item.host.tls, &item.interface.addr).map(|session| {
                    let request = AgentRequest {
                        addr: item.interface.addr.clone(),
                        port: item.interface.port,
                        key: check.key.clone(),
                        value_type: item.value_type,
                        session,
                    };
                    let connector = self.connector.clone();
                    let task = task.clone();

                    async move {
                        let result = run_agent_check(connector, request, deadline).await;
                        Completion::Agent { task, result }
                    }
                    .boxed()
                })
            }
            CheckKind::Http(check) => {
                self.http.submit(&task, check, deadline).map(|future| future.map(Completion::Http).boxed())
            }
        };

        match future {
            Ok(future) => {
                self.tasks.push(future);
                Ok(())
            }
            Err(error) => Err((task, error)),
        }
    }

    async fn finish(&mut self, completion: Completion) {
        let (task, result) = match completion {
            Completion::Agent { task, result } => (task, result),
            Completion::Http(completion) => match self.http.complete(completion) {
                Some(finished) => finished,
                None => return,
            },
        };

        let code = match &result {
            Ok(_) => ResultCode::Success,
            Err(error) => error.code,
        };

        match &result {
            Ok(value) => debug!(
                item_id = task.item_id,
                host = %task.host_name,
                key = %task.key_orig,
                %value,
                "check succeeded"
            ),
            Err(error) => debug!(
                item_id = task.item_id,
                host = %task.host_name,
                interface_id = task.interface.id,
                key = %task.key_orig,
                code = %error.code,
                error = %error,
                "check failed"
            ),
        }

        let error_text = result.as_ref().err().map(|error| error.message.as_str());
        self.health.observe(&task.interface, &task.host_name, task.item_id, &task.key_orig, code, error_text);

        let ts = unix_now();
        self.ledger.push(task.item_id, ts, code);
        self.counters.processed += 1;

        if let Some(item) = self.in_flight.remove(&task.item_id) {
            self.finished.push(item);
        }

        submit(self.collaborators.values.as_ref(), &task, result, ts).await;
    }

    /// Account for backlog items that will never be dispatched
    fn interrupt_backlog(&mut self) {
        let now = unix_now();
        for item in self.backlog.drain(..) {
            self.ledger.push(item.item_id, now, ResultCode::SignalInterrupted);
            self.finished.push(item);
        }
    }

    /// Flush values and availability, then requeue the cycle's items
    ///
    /// Returns the earliest next check time the scheduler reported.
    async fn end_cycle(&mut self) -> Option<i64> {
        if let Err(e) = self.collaborators.values.flush().await {
            warn!(error = %e, "cannot flush values");
        }

        if let Err(e) = self.flush_availability().await {
            warn!(error = %e, "cannot send availability update");
        }

        if !self.finished.is_empty() {
            let items = std::mem::take(&mut self.finished);
            if let Err(e) = self.collaborators.scheduler.release_items(items).await {
                warn!(error = %e, "cannot release items");
            }
        }

        if self.ledger.is_empty() {
            return None;
        }

        let batch = self.ledger.take();
        match self.collaborators.scheduler.requeue(&batch, self.settings.poller_type).await {
            Ok(next_check) => next_check,
            Err(e) => {
                warn!(error = %e, items = batch.len(), "cannot requeue items, retrying next cycle");
                self.ledger.restore(batch);
                None
            }
        }
    }

    async fn flush_availability(&mut self) -> Result<(), PollerError> {
        let instructions = self.health.flush(unix_now(), &self.availability_config);
        if instructions.is_empty() {
            return Ok(());
        }

        debug!(instructions = instructions.len(), "sending availability update");
        let payload = AvailabilityUpdate { instructions }.encode()?;
        self.collaborators.availability.send_availability_update(payload).await
    }

    fn report_status(&mut self, now: Instant) {
        let report = self.counters.report();
        info!(poller_type = %self.settings.poller_type, "{report}");
        self.status.send_replace(report);
        self.next_report = now + self.settings.stat_interval();
    }
}

/// Hand one finished item to the value pipeline, stamped with its ledger clock
async fn submit(values: &dyn ValuePipeline, task: &TaskItem, result: Result<CheckValue, CheckError>, ts: i64) {
    let (value, state, error) = match result {
        Ok(value) => (Some(value), ItemState::Normal, None),
        Err(error) => (None, ItemState::NotSupported, Some(error.message)),
    };

    let record = ValueRecord {
        item_id: task.item_id,
        host_id: task.host_id,
        value_type: task.value_type,
        flags: task.flags,
        value,
        ts,
        state,
        error,
    };

    if let Err(e) = values.submit_value(record).await {
        warn!(item_id = task.item_id, error = %e, "cannot submit value");
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
