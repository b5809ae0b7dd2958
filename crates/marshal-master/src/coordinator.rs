//! The master actor.
//!
//! [`Master`] processes one request at a time, in arrival order. After every
//! request, phase completion or timer wake-up it ticks the scheduler and
//! republishes the topics that changed, so diffs always leave in the order
//! the mutations were applied and a snapshot taken between two requests is
//! never torn.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use marshal_db::{Change, FlatFileDb};
use marshal_scheduler::{Activation, Phase, RunId, RunSpec, Scheduler};
use marshal_sync::{
    HistoryBuffer, HistoryEntry, Publisher, SessionId, StateStore, Subscription, Topic,
};

use crate::{Database, MasterConfig, MasterError, PhaseExecutor};

/// Channel buffer size for the master.
const MASTER_CHANNEL_SIZE: usize = 100;

type Reply<T> = oneshot::Sender<Result<T, MasterError>>;

/// Requests the master serves.
pub enum MasterOp {
    /// Queue a run.
    Submit { spec: RunSpec, response: Reply<RunId> },
    /// Pause a run.
    Pause { id: RunId, response: Reply<()> },
    /// Resume a paused run.
    Resume { id: RunId, response: Reply<()> },
    /// Delete a run.
    Delete { id: RunId, response: Reply<()> },
    /// Remove a periodic template.
    CancelPeriodic { id: String, response: Reply<()> },
    /// Read a key.
    DbRequest {
        db: Database,
        key: String,
        response: Reply<Value>,
    },
    /// Write a key.
    DbSet {
        db: Database,
        key: String,
        value: Value,
        response: Reply<()>,
    },
    /// Remove a key.
    DbDelete {
        db: Database,
        key: String,
        response: Reply<Value>,
    },
    /// Open a session on a topic.
    Subscribe {
        topic: Topic,
        response: oneshot::Sender<Subscription>,
    },
    /// Close a session.
    Unsubscribe {
        topic: Topic,
        session: SessionId,
        response: oneshot::Sender<bool>,
    },
    /// Stop the master.
    Shutdown,
}

/// Report from an executor task.
#[derive(Debug)]
struct PhaseDone {
    id: RunId,
    phase: Phase,
    outcome: Result<(), String>,
}

/// The single coordination context.
pub struct Master {
    scheduler: Scheduler,
    store: StateStore,
    publisher: Publisher,
    devices: FlatFileDb,
    parameters: FlatFileDb,
    history: Arc<Mutex<HistoryBuffer>>,
    executor: PhaseExecutor,
    max_sleep: Duration,
    /// Topics whose published value may differ from the store.
    dirty: HashSet<Topic>,
    op_rx: mpsc::Receiver<MasterOp>,
    done_tx: mpsc::UnboundedSender<PhaseDone>,
    done_rx: mpsc::UnboundedReceiver<PhaseDone>,
}

impl Master {
    /// Create a master over already opened stores.
    ///
    /// Returns the master and a handle for sending requests.
    pub fn new(
        config: &MasterConfig,
        devices: FlatFileDb,
        mut parameters: FlatFileDb,
        executor: PhaseExecutor,
    ) -> (Self, MasterHandle) {
        let history = Arc::new(Mutex::new(HistoryBuffer::new(config.history_capacity)));
        let sink = Arc::clone(&history);
        parameters.on_change(move |change: &Change| {
            if let Change::Set { key, value } = change {
                lock(&sink).push(HistoryEntry::now(key.clone(), value.clone()));
            }
        });

        let (op_tx, op_rx) = mpsc::channel(MASTER_CHANNEL_SIZE);
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let mut master = Self {
            scheduler: Scheduler::new(),
            store: StateStore::new(),
            publisher: Publisher::new(),
            devices,
            parameters,
            history,
            executor,
            max_sleep: config.max_sleep,
            dirty: Topic::ALL.into_iter().collect(),
            op_rx,
            done_tx,
            done_rx,
        };
        master.sync_topics();
        (master, MasterHandle { op_tx })
    }

    /// Open both stores from the configured paths and create a master.
    pub fn open(
        config: &MasterConfig,
        executor: PhaseExecutor,
    ) -> Result<(Self, MasterHandle), MasterError> {
        let devices = FlatFileDb::open(&config.device_db)?;
        let parameters = FlatFileDb::open(&config.parameter_db)?;
        info!(
            devices = devices.data().len(),
            parameters = parameters.data().len(),
            "stores opened"
        );
        Ok(Self::new(config, devices, parameters, executor))
    }

    /// Run the master event loop.
    ///
    /// This processes requests until a Shutdown message is received or all
    /// handles are dropped.
    pub async fn run(mut self) {
        info!("master started");
        let mut now = Utc::now();
        self.step(now);

        loop {
            // Same instant the last tick saw, so no deadline slips between them
            let sleep_for = self.sleep_duration(now);
            tokio::select! {
                op = self.op_rx.recv() => match op {
                    Some(MasterOp::Shutdown) | None => {
                        debug!("master received shutdown");
                        break;
                    }
                    Some(op) => self.handle(op),
                },
                Some(done) = self.done_rx.recv() => self.phase_done(done),
                _ = tokio::time::sleep(sleep_for) => trace!("master woke up"),
            }
            now = Utc::now();
            self.step(now);
        }

        info!("master stopped");
    }

    /// Spawn the master as a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn handle(&mut self, op: MasterOp) {
        let now = Utc::now();
        match op {
            MasterOp::Submit { spec, response } => {
                let result = self.scheduler.submit(spec, now).map_err(Into::into);
                let _ = response.send(result);
            }
            MasterOp::Pause { id, response } => {
                let _ = response.send(self.scheduler.pause(id).map_err(Into::into));
            }
            MasterOp::Resume { id, response } => {
                let _ = response.send(self.scheduler.resume(id).map_err(Into::into));
            }
            MasterOp::Delete { id, response } => {
                let _ = response.send(self.scheduler.delete(id).map_err(Into::into));
            }
            MasterOp::CancelPeriodic { id, response } => {
                let result = self.scheduler.cancel_periodic(&id).map(|_| ());
                let _ = response.send(result.map_err(Into::into));
            }
            MasterOp::DbRequest { db, key, response } => {
                let result = self.db(db).request(&key).cloned();
                let _ = response.send(result.map_err(Into::into));
            }
            MasterOp::DbSet {
                db,
                key,
                value,
                response,
            } => {
                trace!(db = %db, key = %key, "processing db set");
                let result = self.db_mut(db).set(&key, value);
                if result.is_ok() {
                    self.dirty.insert(db.topic());
                    if db == Database::Parameters {
                        self.dirty.insert(Topic::ParametersHistory);
                    }
                }
                let _ = response.send(result.map_err(Into::into));
            }
            MasterOp::DbDelete { db, key, response } => {
                trace!(db = %db, key = %key, "processing db delete");
                let result = self.db_mut(db).delete(&key);
                if result.is_ok() {
                    self.dirty.insert(db.topic());
                }
                let _ = response.send(result.map_err(Into::into));
            }
            MasterOp::Subscribe { topic, response } => {
                let subscription = self.publisher.subscribe(&self.store, topic);
                if let Err(subscription) = response.send(subscription) {
                    self.publisher.unsubscribe(topic, subscription.session);
                }
            }
            MasterOp::Unsubscribe {
                topic,
                session,
                response,
            } => {
                let _ = response.send(self.publisher.unsubscribe(topic, session));
            }
            MasterOp::Shutdown => {}
        }
    }

    fn phase_done(&mut self, done: PhaseDone) {
        trace!(run_id = done.id, phase = %done.phase, ok = done.outcome.is_ok(), "phase done");
        if let Some(next) = self.scheduler.phase_finished(done.id, done.phase, done.outcome) {
            self.launch(next);
        }
    }

    /// Tick the scheduler, start what became runnable and publish the result.
    fn step(&mut self, now: DateTime<Utc>) {
        for activation in self.scheduler.tick(now) {
            self.launch(activation);
        }

        let changes = self.scheduler.take_changes();
        if changes.queue {
            self.dirty.insert(Topic::Queue);
        }
        if changes.periodic {
            self.dirty.insert(Topic::Periodic);
        }
        self.sync_topics();
    }

    fn launch(&self, activation: Activation) {
        let id = activation.run.id;
        let phase = activation.phase;
        debug!(run_id = id, %phase, "launching phase");

        let task = (self.executor)(activation);
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let outcome = task.await;
            if done_tx.send(PhaseDone { id, phase, outcome }).is_err() {
                warn!(run_id = id, %phase, "master gone, phase result dropped");
            }
        });
    }

    /// Republish every dirty topic.
    fn sync_topics(&mut self) {
        for topic in Topic::ALL {
            if !self.dirty.remove(&topic) {
                continue;
            }
            let value = match topic {
                Topic::Queue => self.scheduler.queue_value(),
                Topic::Periodic => self.scheduler.periodic_value(),
                Topic::Devices => self.devices.to_value(),
                Topic::Parameters => self.parameters.to_value(),
                Topic::ParametersHistory => lock(&self.history).to_value(),
            };
            self.publish(topic, value);
        }
    }

    fn publish(&mut self, topic: Topic, value: Value) {
        let diffs = self.store.update(topic, value);
        if !diffs.is_empty() {
            trace!(
                topic = %topic,
                count = diffs.len(),
                version = self.store.version(topic),
                "publishing diffs"
            );
            self.publisher.publish(topic, &diffs);
        }
    }

    fn sleep_duration(&mut self, now: DateTime<Utc>) -> Duration {
        self.scheduler
            .next_wakeup(now)
            // Already overdue: wake at once
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
            .map_or(self.max_sleep, |until| until.min(self.max_sleep))
    }

    fn db(&self, db: Database) -> &FlatFileDb {
        match db {
            Database::Devices => &self.devices,
            Database::Parameters => &self.parameters,
        }
    }

    fn db_mut(&mut self, db: Database) -> &mut FlatFileDb {
        match db {
            Database::Devices => &mut self.devices,
            Database::Parameters => &mut self.parameters,
        }
    }
}

fn lock(history: &Mutex<HistoryBuffer>) -> MutexGuard<'_, HistoryBuffer> {
    history.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle for sending requests to the [`Master`].
///
/// This is cheaply cloneable and can be shared across tasks.
#[derive(Clone)]
pub struct MasterHandle {
    op_tx: mpsc::Sender<MasterOp>,
}

impl MasterHandle {
    /// Queue a run and return its id.
    pub async fn submit(&self, spec: RunSpec) -> Result<RunId, MasterError> {
        self.request(|response| MasterOp::Submit { spec, response })
            .await?
    }

    pub async fn pause(&self, id: RunId) -> Result<(), MasterError> {
        self.request(|response| MasterOp::Pause { id, response })
            .await?
    }

    pub async fn resume(&self, id: RunId) -> Result<(), MasterError> {
        self.request(|response| MasterOp::Resume { id, response })
            .await?
    }

    pub async fn delete(&self, id: RunId) -> Result<(), MasterError> {
        self.request(|response| MasterOp::Delete { id, response })
            .await?
    }

    /// Remove a periodic template by id.
    pub async fn cancel_periodic(&self, id: &str) -> Result<(), MasterError> {
        let id = id.to_string();
        self.request(|response| MasterOp::CancelPeriodic { id, response })
            .await?
    }

    pub async fn db_request(&self, db: Database, key: &str) -> Result<Value, MasterError> {
        let key = key.to_string();
        self.request(|response| MasterOp::DbRequest { db, key, response })
            .await?
    }

    pub async fn db_set(&self, db: Database, key: &str, value: Value) -> Result<(), MasterError> {
        let key = key.to_string();
        self.request(|response| MasterOp::DbSet {
            db,
            key,
            value,
            response,
        })
        .await?
    }

    /// Remove a key and return its last value.
    pub async fn db_delete(&self, db: Database, key: &str) -> Result<Value, MasterError> {
        let key = key.to_string();
        self.request(|response| MasterOp::DbDelete { db, key, response })
            .await?
    }

    /// Open a session: a snapshot of `topic` plus the diffs that follow it.
    pub async fn subscribe(&self, topic: Topic) -> Result<Subscription, MasterError> {
        self.request(|response| MasterOp::Subscribe { topic, response })
            .await
    }

    /// Close a session. Dropping the subscription's receiver has the same
    /// effect, detected on the next delivery.
    pub async fn unsubscribe(&self, topic: Topic, session: SessionId) -> Result<bool, MasterError> {
        self.request(|response| MasterOp::Unsubscribe {
            topic,
            session,
            response,
        })
        .await
    }

    /// Shutdown the master.
    ///
    /// After calling this, no more requests are served.
    pub async fn shutdown(&self) {
        if let Err(e) = self.op_tx.send(MasterOp::Shutdown).await {
            warn!(error = %e, "failed to send shutdown to master");
        }
    }

    async fn request<T>(
        &self,
        op: impl FnOnce(oneshot::Sender<T>) -> MasterOp,
    ) -> Result<T, MasterError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.op_tx
            .send(op(response_tx))
            .await
            .map_err(|_| MasterError::ChannelClosed)?;
        response_rx.await.map_err(|_| MasterError::ResponseDropped)
    }
}
