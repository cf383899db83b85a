//! Local task execution for Sluice.
//!
//! Runs short tasks in throwaway containers on the server's own docker
//! daemon, bounded by a watchdog timeout.

pub mod docker;
pub mod executor;
pub mod plugins;
pub mod runner;

pub use docker::{BollardRuntime, ContainerSpec, DockerRuntime, qualify_image};
pub use executor::LocalTaskExecutor;
pub use plugins::{DirPluginResolver, PluginManifest, PluginResolver, ResolvedPlugin};
pub use runner::{ExecutorConfig, OutputLine, OutputStream};
