// ABOUTME: Backend handles: thin per-runtime client wrappers.
// ABOUTME: Docker wraps the bollard client; Containerd wraps a gRPC channel plus namespace.

pub mod containerd;
pub mod docker;

pub use containerd::Containerd;
pub use docker::Docker;
