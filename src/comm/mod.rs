//! Master/worker control messages and the exchange transport.
//!
//! The wire payload is a `" | "`-delimited string whose first token is the
//! message tag. Decoding into the closed [`Message`] enum happens at the
//! transport boundary so the dispatcher can match exhaustively; an
//! unrecognized tag surfaces as a [`ProtocolError`] which the supervisor logs
//! and drops.

pub mod client;
pub mod exchange;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::InstanceInfo;
use crate::mounts::{MountSpec, ProbeStatus};
use crate::worker::WorkerState;

pub use client::CommConnection;
pub use exchange::ExchangeServer;

/// Field separator of the wire format.
pub const SEP: &str = " | ";

/// Routing key owned by the master's queue.
pub const MASTER_KEY: &str = "master";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown message tag `{0}`")]
    UnknownTag(String),

    #[error("`{tag}` message is missing the `{field}` field")]
    MissingField { tag: &'static str, field: &'static str },

    #[error("`{tag}` message has an invalid `{field}` field: {value}")]
    InvalidField {
        tag: &'static str,
        field: &'static str,
        value: String,
    },

    #[error("invalid MOUNT payload: {0}")]
    BadMountPayload(#[from] serde_json::Error),
}

/// Network and identity facts a worker announces on boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliveInfo {
    pub private_ip: String,
    pub public_ip: String,
    pub zone: String,
    pub instance_type: String,
    pub image_id: String,
    pub hostname: String,
    pub num_cpus: u32,
    pub total_memory_kb: u64,
    pub os_hostname: String,
}

impl From<&InstanceInfo> for AliveInfo {
    fn from(info: &InstanceInfo) -> Self {
        Self {
            private_ip: info.private_ip.clone(),
            public_ip: info.public_ip.clone(),
            zone: info.zone.clone(),
            instance_type: info.instance_type.clone(),
            image_id: info.image_id.clone(),
            hostname: info.hostname.clone(),
            num_cpus: info.num_cpus,
            total_memory_kb: info.total_memory_kb,
            os_hostname: info.os_hostname.clone(),
        }
    }
}

/// Periodic worker status snapshot carried by NODE_STATUS.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub nfs_data: ProbeStatus,
    pub nfs_tools: ProbeStatus,
    pub nfs_indices: ProbeStatus,
    pub nfs_sge: ProbeStatus,
    pub cert: ProbeStatus,
    pub sge_daemon: ProbeStatus,
    /// 1/5/15-minute load averages, eg "0.00 0.02 0.39".
    pub load: String,
    pub state: WorkerState,
    pub nfs_tfs: ProbeStatus,
    pub slurmd: ProbeStatus,
}

/// JSON payload of the MOUNT message.
#[derive(Debug, Serialize, Deserialize)]
struct MountPayload {
    mount_points: Vec<MountSpec>,
}

/// The closed set of control messages exchanged between master and workers.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Alive(AliveInfo),
    AliveRequest,
    MasterPubkey(String),
    WorkerHostCert(String),
    StartSge,
    StartSlurmd { alias: String },
    Mount(Vec<MountSpec>),
    MountDone,
    NodeReady { instance_id: String, num_cpus: u32 },
    NodeStatus(StatusReport),
    NodeShuttingDown { state: WorkerState, instance_id: String },
    Restart { master_ip: String },
    Reboot,
    StatusCheck,
    SyncEtcHosts,
    AddBucketFs { bucket: String, roles: Vec<String> },
}

impl Message {
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Alive(_) => "ALIVE",
            Message::AliveRequest => "ALIVE_REQUEST",
            Message::MasterPubkey(_) => "MASTER_PUBKEY",
            Message::WorkerHostCert(_) => "WORKER_H_CERT",
            Message::StartSge => "START_SGE",
            Message::StartSlurmd { .. } => "START_SLURMD",
            Message::Mount(_) => "MOUNT",
            Message::MountDone => "MOUNT_DONE",
            Message::NodeReady { .. } => "NODE_READY",
            Message::NodeStatus(_) => "NODE_STATUS",
            Message::NodeShuttingDown { .. } => "NODE_SHUTTING_DOWN",
            Message::Restart { .. } => "RESTART",
            Message::Reboot => "REBOOT",
            Message::StatusCheck => "STATUS_CHECK",
            Message::SyncEtcHosts => "SYNC_ETC_HOSTS",
            Message::AddBucketFs { .. } => "ADDS3FS",
        }
    }

    /// Encode to the delimited wire string.
    pub fn to_wire(&self) -> String {
        match self {
            Message::Alive(a) => join(&[
                "ALIVE",
                &a.private_ip,
                &a.public_ip,
                &a.zone,
                &a.instance_type,
                &a.image_id,
                &a.hostname,
                &a.num_cpus.to_string(),
                &a.total_memory_kb.to_string(),
                &a.os_hostname,
            ]),
            Message::AliveRequest => "ALIVE_REQUEST".to_string(),
            Message::MasterPubkey(key) => join(&["MASTER_PUBKEY", key]),
            Message::WorkerHostCert(cert) => join(&["WORKER_H_CERT", cert]),
            Message::StartSge => "START_SGE".to_string(),
            Message::StartSlurmd { alias } => join(&["START_SLURMD", alias]),
            Message::Mount(specs) => {
                let payload = MountPayload {
                    mount_points: specs.clone(),
                };
                // Serializing plain structs to JSON cannot fail.
                let json = serde_json::to_string(&payload).expect("mount payload serializes");
                join(&["MOUNT", &json])
            }
            Message::MountDone => "MOUNT_DONE".to_string(),
            Message::NodeReady {
                instance_id,
                num_cpus,
            } => join(&["NODE_READY", instance_id, &num_cpus.to_string()]),
            Message::NodeStatus(s) => join(&[
                "NODE_STATUS",
                s.nfs_data.as_wire(),
                s.nfs_tools.as_wire(),
                s.nfs_indices.as_wire(),
                s.nfs_sge.as_wire(),
                s.cert.as_wire(),
                s.sge_daemon.as_wire(),
                &s.load,
                &s.state.to_string(),
                s.nfs_tfs.as_wire(),
                s.slurmd.as_wire(),
            ]),
            Message::NodeShuttingDown { state, instance_id } => {
                join(&["NODE_SHUTTING_DOWN", &state.to_string(), instance_id])
            }
            Message::Restart { master_ip } => join(&["RESTART", master_ip]),
            Message::Reboot => "REBOOT".to_string(),
            Message::StatusCheck => "STATUS_CHECK".to_string(),
            Message::SyncEtcHosts => "SYNC_ETC_HOSTS".to_string(),
            Message::AddBucketFs { bucket, roles } => {
                join(&["ADDS3FS", bucket, &roles.join(",")])
            }
        }
    }

    /// Decode a wire string. Fields beyond those a tag defines are ignored.
    pub fn from_wire(wire: &str) -> Result<Self, ProtocolError> {
        let mut parts = wire.split(SEP).map(str::trim);
        let tag = parts.next().unwrap_or_default();
        let fields: Vec<&str> = parts.collect();

        match tag {
            "ALIVE" => {
                let f = require(&fields, 9, "ALIVE", "os_hostname")?;
                Ok(Message::Alive(AliveInfo {
                    private_ip: f[0].to_string(),
                    public_ip: f[1].to_string(),
                    zone: f[2].to_string(),
                    instance_type: f[3].to_string(),
                    image_id: f[4].to_string(),
                    hostname: f[5].to_string(),
                    num_cpus: parse_num(f[6], "ALIVE", "cpu_count")?,
                    total_memory_kb: parse_num(f[7], "ALIVE", "total_memory")?,
                    os_hostname: f[8].to_string(),
                }))
            }
            "ALIVE_REQUEST" => Ok(Message::AliveRequest),
            "MASTER_PUBKEY" => {
                let f = require(&fields, 1, "MASTER_PUBKEY", "public_key")?;
                Ok(Message::MasterPubkey(f[0].to_string()))
            }
            "WORKER_H_CERT" => {
                let f = require(&fields, 1, "WORKER_H_CERT", "host_cert")?;
                Ok(Message::WorkerHostCert(f[0].to_string()))
            }
            "START_SGE" => Ok(Message::StartSge),
            "START_SLURMD" => {
                let f = require(&fields, 1, "START_SLURMD", "alias")?;
                Ok(Message::StartSlurmd {
                    alias: f[0].to_string(),
                })
            }
            "MOUNT" => {
                let f = require(&fields, 1, "MOUNT", "payload")?;
                let payload: MountPayload = serde_json::from_str(f[0])?;
                Ok(Message::Mount(payload.mount_points))
            }
            "MOUNT_DONE" => Ok(Message::MountDone),
            "NODE_READY" => {
                let f = require(&fields, 2, "NODE_READY", "cpu_count")?;
                Ok(Message::NodeReady {
                    instance_id: f[0].to_string(),
                    num_cpus: parse_num(f[1], "NODE_READY", "cpu_count")?,
                })
            }
            "NODE_STATUS" => {
                let f = require(&fields, 10, "NODE_STATUS", "slurmd_status")?;
                Ok(Message::NodeStatus(StatusReport {
                    nfs_data: parse_probe(f[0], "data_mount")?,
                    nfs_tools: parse_probe(f[1], "tools_mount")?,
                    nfs_indices: parse_probe(f[2], "indices_mount")?,
                    nfs_sge: parse_probe(f[3], "sge_mount")?,
                    cert: parse_probe(f[4], "cert_status")?,
                    sge_daemon: parse_probe(f[5], "daemon_status")?,
                    load: f[6].to_string(),
                    state: parse_state(f[7], "NODE_STATUS")?,
                    nfs_tfs: parse_probe(f[8], "transient_fs_mount")?,
                    slurmd: parse_probe(f[9], "slurmd_status")?,
                }))
            }
            "NODE_SHUTTING_DOWN" => {
                let f = require(&fields, 2, "NODE_SHUTTING_DOWN", "instance_id")?;
                Ok(Message::NodeShuttingDown {
                    state: parse_state(f[0], "NODE_SHUTTING_DOWN")?,
                    instance_id: f[1].to_string(),
                })
            }
            "RESTART" => {
                let f = require(&fields, 1, "RESTART", "master_ip")?;
                Ok(Message::Restart {
                    master_ip: f[0].to_string(),
                })
            }
            "REBOOT" => Ok(Message::Reboot),
            "STATUS_CHECK" => Ok(Message::StatusCheck),
            "SYNC_ETC_HOSTS" => Ok(Message::SyncEtcHosts),
            "ADDS3FS" => {
                let f = require(&fields, 2, "ADDS3FS", "roles")?;
                Ok(Message::AddBucketFs {
                    bucket: f[0].to_string(),
                    roles: f[1]
                        .split(',')
                        .filter(|r| !r.is_empty())
                        .map(str::to_string)
                        .collect(),
                })
            }
            other => Err(ProtocolError::UnknownTag(other.to_string())),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

fn join(fields: &[&str]) -> String {
    fields.join(SEP)
}

fn require<'a>(
    fields: &'a [&'a str],
    n: usize,
    tag: &'static str,
    last: &'static str,
) -> Result<&'a [&'a str], ProtocolError> {
    if fields.len() < n {
        Err(ProtocolError::MissingField { tag, field: last })
    } else {
        Ok(&fields[..n])
    }
}

fn parse_num<T: std::str::FromStr>(
    value: &str,
    tag: &'static str,
    field: &'static str,
) -> Result<T, ProtocolError> {
    value.parse().map_err(|_| ProtocolError::InvalidField {
        tag,
        field,
        value: value.to_string(),
    })
}

fn parse_probe(value: &str, field: &'static str) -> Result<ProbeStatus, ProtocolError> {
    ProbeStatus::from_wire(value).ok_or_else(|| ProtocolError::InvalidField {
        tag: "NODE_STATUS",
        field,
        value: value.to_string(),
    })
}

fn parse_state(value: &str, tag: &'static str) -> Result<WorkerState, ProtocolError> {
    value.parse().map_err(|_| ProtocolError::InvalidField {
        tag,
        field: "worker_state",
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounts::FsType;

    fn round_trip(msg: Message) {
        let wire = msg.to_wire();
        let decoded = Message::from_wire(&wire).unwrap();
        assert_eq!(decoded, msg, "wire was: {}", wire);
    }

    #[test]
    fn alive_round_trip() {
        round_trip(Message::Alive(AliveInfo {
            private_ip: "10.0.0.7".into(),
            public_ip: "54.1.2.3".into(),
            zone: "us-east-1a".into(),
            instance_type: "m5.large".into(),
            image_id: "ami-0abc".into(),
            hostname: "ip-10-0-0-7".into(),
            num_cpus: 8,
            total_memory_kb: 16_384_000,
            os_hostname: "ip-10-0-0-7".into(),
        }));
    }

    #[test]
    fn mount_carries_spec_list_as_json() {
        let specs = vec![
            MountSpec::nfs("data", "/mnt/data", "10.0.0.1"),
            MountSpec {
                label: "scratch".into(),
                local_path: "/mnt/scratch".into(),
                fs_type: FsType::Bind,
                server: "/export/scratch".into(),
                options: Some("ro".into()),
            },
        ];
        let msg = Message::Mount(specs.clone());
        let wire = msg.to_wire();
        assert!(wire.starts_with("MOUNT | {"));
        assert_eq!(Message::from_wire(&wire).unwrap(), Message::Mount(specs));
    }

    #[test]
    fn node_status_round_trip() {
        round_trip(Message::NodeStatus(StatusReport {
            nfs_data: ProbeStatus::Ok,
            nfs_tools: ProbeStatus::Ok,
            nfs_indices: ProbeStatus::Untried,
            nfs_sge: ProbeStatus::Ok,
            cert: ProbeStatus::Ok,
            sge_daemon: ProbeStatus::Untried,
            load: "0.00 0.02 0.39".into(),
            state: WorkerState::Ready,
            nfs_tfs: ProbeStatus::Failed,
            slurmd: ProbeStatus::Ok,
        }));
    }

    #[test]
    fn simple_tags_round_trip() {
        round_trip(Message::AliveRequest);
        round_trip(Message::StartSge);
        round_trip(Message::MountDone);
        round_trip(Message::Reboot);
        round_trip(Message::StatusCheck);
        round_trip(Message::SyncEtcHosts);
        round_trip(Message::MasterPubkey("ssh-rsa AAAA...".into()));
        round_trip(Message::WorkerHostCert("host-cert".into()));
        round_trip(Message::StartSlurmd { alias: "w1".into() });
        round_trip(Message::NodeReady {
            instance_id: "i-0123".into(),
            num_cpus: 4,
        });
        round_trip(Message::NodeShuttingDown {
            state: WorkerState::ShuttingDown,
            instance_id: "i-0123".into(),
        });
        round_trip(Message::Restart {
            master_ip: "10.0.0.2".into(),
        });
        round_trip(Message::AddBucketFs {
            bucket: "cluster-bucket".into(),
            roles: vec!["data".into(), "tools".into()],
        });
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let err = Message::from_wire("FROBNICATE | x").unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTag(t) if t == "FROBNICATE"));
    }

    #[test]
    fn missing_field_is_an_error() {
        assert!(matches!(
            Message::from_wire("START_SLURMD").unwrap_err(),
            ProtocolError::MissingField { tag: "START_SLURMD", .. }
        ));
        assert!(matches!(
            Message::from_wire("NODE_READY | i-0123").unwrap_err(),
            ProtocolError::MissingField { tag: "NODE_READY", .. }
        ));
    }

    #[test]
    fn invalid_numeric_field_is_an_error() {
        assert!(matches!(
            Message::from_wire("NODE_READY | i-0123 | lots").unwrap_err(),
            ProtocolError::InvalidField { field: "cpu_count", .. }
        ));
    }
}
