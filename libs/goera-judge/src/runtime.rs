/// Sandbox Runtime - capability interface over the container engine
///
/// The per-test-case state machine in `engine.rs` only talks to this trait,
/// so it can be driven by Docker in production and by an in-process fake in
/// tests. Implementations report infrastructure problems as errors; they
/// never decide verdicts.
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::io::AsyncWrite;

/// One demultiplexed piece of container output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Host file exposed inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to create one sandbox container
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub user: String,
    pub working_dir: String,
    pub mounts: Vec<BindMount>,
    pub network_disabled: bool,
    pub security_opts: Vec<String>,
    /// Memory ceiling in bytes; swap is pinned to the same value
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
}

/// Attached streams of a created (not yet started) container
pub struct SandboxIo {
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
    pub output: BoxStream<'static, Result<OutputChunk>>,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Build `image` from a single Dockerfile
    async fn build_image(&self, image: &str, dockerfile: &str) -> Result<()>;

    /// Create a container and return its id
    async fn create(&self, spec: &SandboxSpec) -> Result<String>;

    async fn attach(&self, id: &str) -> Result<SandboxIo>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Resolve with the exit code once the container leaves the running state
    async fn wait(&self, id: &str) -> Result<i64>;

    /// Stop with a grace period; stopping an already stopped or missing
    /// container is not an error
    async fn stop(&self, id: &str, grace: Duration) -> Result<()>;

    /// Force-remove; removing a missing container is not an error
    async fn remove(&self, id: &str) -> Result<()>;
}
