pub mod comm;
pub mod config;
pub mod error;
pub mod jobmanager;
pub mod mounts;
pub mod runner;
pub mod shutdown;
pub mod storage;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("comm");
}
