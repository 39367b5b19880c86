
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use gridpool::comm::Message;
use gridpool::mounts::{MountSpec, ProbeStatus};
use gridpool::runner::CommandOutput;
use gridpool::storage::DirStore;
use gridpool::worker::{PostStartHook, Supervisor, WorkerManager, WorkerState};
use test_harness::{recv_until, test_config, test_instance, ScriptedRunner, TestExchange};

struct TestWorker {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl TestWorker {
    async fn shutdown(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

async fn spawn_worker(
    port: u16,
    tmp: &std::path::Path,
    runner: Arc<ScriptedRunner>,
) -> TestWorker {
    let config = test_config(port, tmp);
    let manager = WorkerManager::new(config.clone(), test_instance(), runner.clone());
    let store = Arc::new(DirStore::new(config.paths.bucket_store.clone()));
    let hook = PostStartHook::new(&config, store, runner);
    let token = CancellationToken::new();
    let supervisor = Supervisor::new(config, manager, hook, token.clone());
    let handle = tokio::spawn(supervisor.run());
    TestWorker { token, handle }
}

fn script_worker_host(runner: &ScriptedRunner) {
    runner.respond(
        "ssh-keyscan",
        CommandOutput::ok("w1.internal ssh-rsa AAAACERT"),
    );
    // slurmd pid-file probe reports a live daemon.
    runner.respond("head -n 1", CommandOutput::ok("4242"));
    runner.respond("ps -o pid=", CommandOutput::ok("4242"));
}

/// The full boot handshake: ALIVE -> MASTER_PUBKEY -> host cert -> MOUNT ->
/// START_SLURMD -> NODE_READY, with the final STATUS_CHECK reporting `Ready`.
#[tokio::test]
async fn worker_boots_to_ready_over_the_wire() {
    let tmp = tempfile::tempdir().unwrap();
    let exchange = TestExchange::spawn(18520).await;
    let runner = ScriptedRunner::new();
    script_worker_host(&runner);
    let worker = spawn_worker(18520, tmp.path(), runner.clone()).await;
    let mut master = exchange.master_conn().await;

    let alive = recv_until(&mut master, |m| matches!(m, Message::Alive(_))).await;
    match alive {
        Message::Alive(info) => {
            assert_eq!(info.private_ip, "10.0.0.7");
            assert_eq!(info.num_cpus, 4);
        }
        other => panic!("expected ALIVE, got {}", other),
    }

    master
        .send("w1", &Message::MasterPubkey("ssh-rsa MASTERKEY".to_string()))
        .await
        .unwrap();
    let cert = recv_until(&mut master, |m| matches!(m, Message::WorkerHostCert(_))).await;
    assert_eq!(
        cert,
        Message::WorkerHostCert("w1.internal ssh-rsa AAAACERT".to_string())
    );

    // The master's key was persisted as an authorized credential.
    let saved =
        std::fs::read_to_string(tmp.path().join("ssh/authorized_keys")).unwrap();
    assert!(saved.contains("ssh-rsa MASTERKEY"));

    master
        .send(
            "w1",
            &Message::Mount(vec![MountSpec::nfs("data", "/mnt/data", "10.0.0.1")]),
        )
        .await
        .unwrap();
    recv_until(&mut master, |m| matches!(m, Message::MountDone)).await;

    master
        .send(
            "w1",
            &Message::StartSlurmd {
                alias: "w1".to_string(),
            },
        )
        .await
        .unwrap();
    let ready = recv_until(&mut master, |m| matches!(m, Message::NodeReady { .. })).await;
    assert_eq!(
        ready,
        Message::NodeReady {
            instance_id: "i-0abc123".to_string(),
            num_cpus: 4,
        }
    );

    master.send("w1", &Message::StatusCheck).await.unwrap();
    let status = recv_until(&mut master, |m| {
        matches!(m, Message::NodeStatus(r) if r.state == WorkerState::Ready)
    })
    .await;
    match status {
        Message::NodeStatus(report) => {
            assert_eq!(report.nfs_data, ProbeStatus::Ok);
            assert_eq!(report.cert, ProbeStatus::Ok);
            assert_eq!(report.slurmd, ProbeStatus::Ok);
        }
        other => panic!("expected NODE_STATUS, got {}", other),
    }

    // slurmd was started exactly once, under the cluster-wide lock.
    assert_eq!(runner.count_containing("/usr/sbin/slurmd"), 1);
    assert_eq!(runner.count_containing("flock"), 1);

    worker.token.cancel();
    recv_until(&mut master, |m| {
        matches!(
            m,
            Message::NodeShuttingDown {
                state: WorkerState::ShuttingDown,
                ..
            }
        )
    })
    .await;
    let _ = worker.handle.await;
}

/// MOUNT in `Ready` refreshes the mount statuses without a MOUNT_DONE reply
/// and without leaving `Ready`.
#[tokio::test]
async fn mount_in_ready_updates_status_silently() {
    let tmp = tempfile::tempdir().unwrap();
    let exchange = TestExchange::spawn(18522).await;
    let runner = ScriptedRunner::new();
    script_worker_host(&runner);
    let worker = spawn_worker(18522, tmp.path(), runner.clone()).await;
    let mut master = exchange.master_conn().await;

    recv_until(&mut master, |m| matches!(m, Message::Alive(_))).await;
    master
        .send("w1", &Message::MasterPubkey("k".to_string()))
        .await
        .unwrap();
    master
        .send(
            "w1",
            &Message::StartSlurmd {
                alias: "w1".to_string(),
            },
        )
        .await
        .unwrap();
    recv_until(&mut master, |m| matches!(m, Message::NodeReady { .. })).await;

    master
        .send(
            "w1",
            &Message::Mount(vec![MountSpec::nfs("data", "/mnt/data", "10.0.0.1")]),
        )
        .await
        .unwrap();

    // Collect everything until the status reflects the new mount; a
    // MOUNT_DONE reply would be a handshake-sequencing bug in Ready.
    let mut saw_mount_done = false;
    let status = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some((_, msg)) = master.recv().await.unwrap() {
                match msg {
                    Message::MountDone => saw_mount_done = true,
                    Message::NodeStatus(r)
                        if r.nfs_data == ProbeStatus::Ok && r.state == WorkerState::Ready =>
                    {
                        return r;
                    }
                    _ => {}
                }
            } else {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    })
    .await
    .expect("status never reflected the mount");

    assert!(!saw_mount_done, "MOUNT in Ready must not reply MOUNT_DONE");
    assert_eq!(status.state, WorkerState::Ready);
    worker.shutdown().await;
}

/// MOUNT never advances the lifecycle, and a repeated MASTER_PUBKEY outside
/// `Starting` is ignored.
#[tokio::test]
async fn only_pubkey_and_bootstrap_advance_the_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();
    let exchange = TestExchange::spawn(18524).await;
    let runner = ScriptedRunner::new();
    script_worker_host(&runner);
    let worker = spawn_worker(18524, tmp.path(), runner.clone()).await;
    let mut master = exchange.master_conn().await;

    recv_until(&mut master, |m| matches!(m, Message::Alive(_))).await;

    // MOUNT while still Starting: acknowledged, but no state change.
    master
        .send(
            "w1",
            &Message::Mount(vec![MountSpec::nfs("data", "/mnt/data", "10.0.0.1")]),
        )
        .await
        .unwrap();
    recv_until(&mut master, |m| matches!(m, Message::MountDone)).await;
    master.send("w1", &Message::StatusCheck).await.unwrap();
    recv_until(&mut master, |m| {
        matches!(m, Message::NodeStatus(r) if r.state == WorkerState::Starting)
    })
    .await;

    master
        .send("w1", &Message::MasterPubkey("k1".to_string()))
        .await
        .unwrap();
    recv_until(&mut master, |m| matches!(m, Message::WorkerHostCert(_))).await;

    // Second key outside Starting is ignored: no second cert scan.
    master
        .send("w1", &Message::MasterPubkey("k2".to_string()))
        .await
        .unwrap();
    master.send("w1", &Message::StatusCheck).await.unwrap();
    recv_until(&mut master, |m| {
        matches!(m, Message::NodeStatus(r) if r.state == WorkerState::AwaitingSchedulerBootstrap)
    })
    .await;
    assert_eq!(runner.count_containing("ssh-keyscan"), 1);

    worker.shutdown().await;
}

/// A failed scheduler bootstrap parks the worker in soft `Error`: it keeps
/// answering STATUS_CHECK and MOUNT rather than going dark.
#[tokio::test]
async fn bootstrap_failure_is_a_soft_error() {
    let tmp = tempfile::tempdir().unwrap();
    let exchange = TestExchange::spawn(18526).await;
    let runner = ScriptedRunner::new();
    runner.respond("ssh-keyscan", CommandOutput::ok("w1 ssh-rsa CERT"));
    runner.fail_when("/usr/sbin/slurmd");
    let worker = spawn_worker(18526, tmp.path(), runner.clone()).await;
    let mut master = exchange.master_conn().await;

    recv_until(&mut master, |m| matches!(m, Message::Alive(_))).await;
    master
        .send("w1", &Message::MasterPubkey("k".to_string()))
        .await
        .unwrap();
    recv_until(&mut master, |m| matches!(m, Message::WorkerHostCert(_))).await;
    master
        .send(
            "w1",
            &Message::StartSlurmd {
                alias: "w1".to_string(),
            },
        )
        .await
        .unwrap();

    recv_until(&mut master, |m| {
        matches!(m, Message::NodeStatus(r) if r.state == WorkerState::Error)
    })
    .await;

    // Still serving housekeeping traffic.
    master
        .send(
            "w1",
            &Message::Mount(vec![MountSpec::nfs("data", "/mnt/data", "10.0.0.1")]),
        )
        .await
        .unwrap();
    recv_until(&mut master, |m| matches!(m, Message::MountDone)).await;

    worker.shutdown().await;
}

/// RESTART is a resync: new master address, remount, re-announce ALIVE, no
/// lifecycle change.
#[tokio::test]
async fn restart_resyncs_without_changing_state() {
    let tmp = tempfile::tempdir().unwrap();
    let exchange = TestExchange::spawn(18528).await;
    let runner = ScriptedRunner::new();
    script_worker_host(&runner);
    let worker = spawn_worker(18528, tmp.path(), runner.clone()).await;
    let mut master = exchange.master_conn().await;

    recv_until(&mut master, |m| matches!(m, Message::Alive(_))).await;
    master
        .send("w1", &Message::MasterPubkey("k".to_string()))
        .await
        .unwrap();
    master
        .send(
            "w1",
            &Message::StartSlurmd {
                alias: "w1".to_string(),
            },
        )
        .await
        .unwrap();
    recv_until(&mut master, |m| matches!(m, Message::NodeReady { .. })).await;

    master
        .send(
            "w1",
            &Message::Restart {
                master_ip: "127.0.0.1".to_string(),
            },
        )
        .await
        .unwrap();

    recv_until(&mut master, |m| matches!(m, Message::Alive(_))).await;
    master.send("w1", &Message::StatusCheck).await.unwrap();
    recv_until(&mut master, |m| {
        matches!(m, Message::NodeStatus(r) if r.state == WorkerState::Ready)
    })
    .await;

    worker.shutdown().await;
}

/// ALIVE_REQUEST re-announces; REBOOT fires the OS reboot command.
#[tokio::test]
async fn housekeeping_messages_are_served_in_any_state() {
    let tmp = tempfile::tempdir().unwrap();
    let exchange = TestExchange::spawn(18530).await;
    let runner = ScriptedRunner::new();
    script_worker_host(&runner);
    let worker = spawn_worker(18530, tmp.path(), runner.clone()).await;
    let mut master = exchange.master_conn().await;

    recv_until(&mut master, |m| matches!(m, Message::Alive(_))).await;

    master.send("w1", &Message::AliveRequest).await.unwrap();
    recv_until(&mut master, |m| matches!(m, Message::Alive(_))).await;

    master.send("w1", &Message::Reboot).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while runner.count_containing("telinit 6") == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("reboot command never issued");

    worker.shutdown().await;
}
