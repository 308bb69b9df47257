//! Caller-facing gRPC surface and the background session-reaper (§4.8).

pub mod gc;
pub mod service;

pub mod proto {
    tonic::include_proto!("agentland.sandbox.v1");
}
