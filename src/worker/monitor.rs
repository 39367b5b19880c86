use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::comm::{CommConnection, Message, MASTER_KEY};
use crate::config::BootConfig;
use crate::worker::pss::{PostStartHook, StartOutcome};
use crate::worker::{WorkerManager, WorkerState};
use std::sync::Arc;

/// The worker's always-on supervision loop.
///
/// Owns the exchange connection and the [`WorkerState`] control variable;
/// every state mutation happens on this task, so no locking is needed. Each
/// iteration reconnects if necessary, drains queued inbound messages in
/// receipt order, and emits a NODE_STATUS heartbeat. Transport errors
/// downgrade the loop to "disconnected" and the next tick retries; only an
/// explicit shutdown request ends the loop.
///
/// Scheduler and mount commands are awaited inline on the dispatch path. A
/// hung external command therefore delays subsequent dispatch until it
/// returns; this is a known, accepted limitation.
pub struct Supervisor {
    config: BootConfig,
    manager: WorkerManager,
    worker_id: String,
    state: WorkerState,
    last_transition: DateTime<Utc>,
    conn: Option<CommConnection>,
    shutdown: CancellationToken,
    hook: Arc<PostStartHook>,
    hook_task: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(
        config: BootConfig,
        manager: WorkerManager,
        hook: Arc<PostStartHook>,
        shutdown: CancellationToken,
    ) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| manager.instance_id().to_string());
        Self {
            config,
            manager,
            worker_id,
            state: WorkerState::Waking,
            last_transition: Utc::now(),
            conn: None,
            shutdown,
            hook,
            hook_task: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until the shutdown token is cancelled. Cancellation wakes the
    /// loop's sleep early, so shutdown does not wait out the full interval.
    pub async fn run(mut self) {
        tracing::info!(worker_id = %self.worker_id, "Worker supervisor starting");
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            self.iterate().await;
        }
        self.finish().await;
    }

    async fn iterate(&mut self) {
        if self.conn.is_none() {
            self.try_connect().await;
        }
        if self.conn.is_some() && self.state == WorkerState::Waking {
            self.send_alive().await;
            self.set_state(WorkerState::Starting);
        }
        self.drain().await;
        self.poll_hook();
        if self.conn.is_some() {
            self.send_status().await;
        }
    }

    async fn try_connect(&mut self) {
        let endpoint = format!(
            "http://{}:{}",
            self.manager.master_ip(),
            self.config.exchange_port
        );
        // Jitter so a fleet of rebooting workers does not stampede the master.
        let jitter = rand::thread_rng().gen_range(0..250);
        tokio::time::sleep(Duration::from_millis(jitter)).await;
        match CommConnection::connect(&endpoint, &self.worker_id).await {
            Ok(conn) => {
                tracing::info!(endpoint = %endpoint, "Connected to exchange");
                self.conn = Some(conn);
            }
            Err(e) => {
                tracing::debug!(endpoint = %endpoint, error = %e, "Exchange not reachable yet");
            }
        }
    }

    /// Pop and dispatch every queued inbound message, in receipt order.
    async fn drain(&mut self) {
        loop {
            let polled = match self.conn.as_mut() {
                Some(conn) => conn.recv().await,
                None => return,
            };
            match polled {
                Ok(Some((origin, msg))) => self.dispatch(&origin, msg).await,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "Trouble receiving; will reconnect");
                    self.conn = None;
                    return;
                }
            }
        }
    }

    /// Handle one inbound control message. Unknown tags never reach this
    /// point; they are dropped at the decode boundary.
    pub async fn dispatch(&mut self, origin: &str, msg: Message) {
        tracing::debug!(from = origin, tag = msg.tag(), state = %self.state, "Dispatching");
        match msg {
            Message::MasterPubkey(key) => self.handle_master_pubkey(key).await,
            Message::StartSlurmd { alias } => self.handle_start_slurmd(alias).await,
            Message::StartSge => self.handle_start_sge().await,
            Message::Mount(specs) => self.handle_mount(specs).await,
            Message::StatusCheck => self.send_status().await,
            Message::AliveRequest => self.send_alive().await,
            Message::Restart { master_ip } => self.handle_restart(master_ip).await,
            Message::Reboot => {
                tracing::info!("Received reboot command");
                self.manager.reboot().await;
            }
            Message::SyncEtcHosts => {
                if let Err(e) = self.manager.sync_etc_hosts().await {
                    tracing::warn!(error = %e, "/etc/hosts sync failed");
                }
            }
            Message::AddBucketFs { bucket, roles } => {
                if let Err(e) = self.manager.add_bucket_fs(&bucket, &roles).await {
                    tracing::warn!(bucket = %bucket, error = %e, "Bucket filesystem add failed");
                }
            }
            other => {
                // Worker-originated tags have no meaning on this side.
                tracing::debug!(tag = other.tag(), "Ignoring unexpected message");
            }
        }
    }

    async fn handle_master_pubkey(&mut self, key: String) {
        if self.state != WorkerState::Starting {
            tracing::debug!(state = %self.state, "Ignoring MASTER_PUBKEY outside startup");
            return;
        }
        tracing::info!("Got master public key; saving as authorized credential");
        if let Err(e) = self.manager.save_authorized_key(&key).await {
            tracing::error!(error = %e, "Cannot persist master key");
        }
        match self.manager.collect_host_cert().await {
            Some(cert) => self.send(Message::WorkerHostCert(cert)).await,
            None => tracing::error!("Host certificate unavailable; not replying"),
        }
        self.set_state(WorkerState::AwaitingSchedulerBootstrap);
    }

    async fn handle_start_slurmd(&mut self, alias: String) {
        if self.state != WorkerState::AwaitingSchedulerBootstrap {
            tracing::debug!(state = %self.state, "Ignoring START_SLURMD outside bootstrap stage");
            return;
        }
        tracing::info!(alias = %alias, "Got START_SLURMD");
        match self.manager.start_slurmd(&alias).await {
            Ok(()) => self.bootstrap_succeeded().await,
            Err(e) => {
                tracing::error!(error = %e, "Starting slurmd did not go smoothly");
                self.set_state(WorkerState::Error);
            }
        }
    }

    async fn handle_start_sge(&mut self) {
        if self.state != WorkerState::AwaitingSchedulerBootstrap {
            tracing::debug!(state = %self.state, "Ignoring START_SGE outside bootstrap stage");
            return;
        }
        match self.manager.start_sge().await {
            Ok(()) => self.bootstrap_succeeded().await,
            Err(e) => {
                tracing::error!(error = %e, "Setting up SGE did not go smoothly");
                self.set_state(WorkerState::Error);
            }
        }
    }

    /// Common tail of a successful scheduler bootstrap: announce readiness
    /// and enter `Ready`. The post-start hook is picked up by `poll_hook` on
    /// this same iteration.
    async fn bootstrap_succeeded(&mut self) {
        tracing::info!(
            instance_id = %self.manager.instance_id(),
            "Done configuring, sending NODE_READY"
        );
        self.send(Message::NodeReady {
            instance_id: self.manager.instance_id().to_string(),
            num_cpus: self.manager.num_cpus(),
        })
        .await;
        self.set_state(WorkerState::Ready);
    }

    async fn handle_mount(&mut self, specs: Vec<crate::mounts::MountSpec>) {
        if self.state == WorkerState::ShuttingDown {
            return;
        }
        if let Err(e) = self.manager.apply_mounts(specs).await {
            // Recorded per-label; the worker keeps going.
            tracing::warn!(error = %e, "Mount reconciliation incomplete");
        }
        // Unblock the master's handshake sequencing while still configuring.
        if self.state != WorkerState::Ready {
            self.send(Message::MountDone).await;
        }
    }

    /// RESTART is a resync, not a lifecycle step: adopt the new master
    /// address, redo the mounts against it and re-announce. State unchanged.
    async fn handle_restart(&mut self, master_ip: String) {
        tracing::info!(master_ip = %master_ip, "Master requested resync");
        self.config.master_ip = master_ip.clone();
        self.manager.set_master_ip(master_ip);
        self.manager.unmount_all().await;
        if let Err(e) = self.manager.apply_mounts(Vec::new()).await {
            tracing::warn!(error = %e, "Remount after master change incomplete");
        }
        self.send_alive().await;
    }

    fn poll_hook(&mut self) {
        if let Some(task) = &self.hook_task {
            if task.is_finished() {
                tracing::debug!("Post-start hook task finished");
                self.hook_task = None;
            }
            return;
        }
        if self.state == WorkerState::Ready && self.hook.is_active() && !self.hook.has_run() {
            let siblings = self.manager.service_health();
            match self.hook.clone().try_start(&siblings) {
                StartOutcome::Started(handle) => {
                    tracing::info!("Post-start hook started");
                    self.hook_task = Some(handle);
                }
                StartOutcome::NotYetReady => {}
            }
        }
    }

    async fn send_alive(&mut self) {
        let msg = Message::Alive(self.manager.alive_info());
        self.send(msg).await;
    }

    async fn send_status(&mut self) {
        let report = self.manager.status_report(self.state).await;
        self.send(Message::NodeStatus(report)).await;
    }

    async fn send(&mut self, msg: Message) {
        let Some(conn) = self.conn.as_mut() else {
            tracing::debug!(tag = msg.tag(), "Not connected; dropping outbound message");
            return;
        };
        if let Err(e) = conn.send(MASTER_KEY, &msg).await {
            tracing::warn!(tag = msg.tag(), error = %e, "Send failed; will reconnect");
            self.conn = None;
        }
    }

    fn set_state(&mut self, next: WorkerState) {
        if next == self.state {
            return;
        }
        let dwelled = Utc::now() - self.last_transition;
        tracing::info!(
            from = %self.state,
            to = %next,
            dwelled_secs = dwelled.num_seconds(),
            "Worker state changed"
        );
        self.state = next;
        self.last_transition = Utc::now();
    }

    async fn finish(&mut self) {
        self.set_state(WorkerState::ShuttingDown);
        self.send(Message::NodeShuttingDown {
            state: self.state,
            instance_id: self.manager.instance_id().to_string(),
        })
        .await;
        self.manager.unmount_all().await;
        tracing::info!("Worker supervisor stopped");
    }
}
