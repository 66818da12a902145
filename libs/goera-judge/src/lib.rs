//! Goera sandbox runner: compiles a submission on the host and judges every
//! test case inside its own throwaway, resource-limited container.

pub mod config;
pub mod docker;
pub mod engine;
pub mod evaluator;
pub mod runner;
pub mod runtime;
pub mod toolchain;


pub use config::JudgeConfig;
pub use docker::DockerRuntime;
pub use engine::SandboxEngine;
pub use runner::{Judge, JudgeReport};
pub use runtime::SandboxRuntime;
pub use toolchain::{HostToolchain, Toolchain};
