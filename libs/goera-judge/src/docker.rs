// Docker-backed sandbox runtime using Bollard
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use futures_util::stream::StreamExt;
use hyper::body::Bytes;
use tracing::{debug, info, warn};

use crate::runtime::{OutputChunk, SandboxIo, SandboxRuntime, SandboxSpec};

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon (socket or `DOCKER_HOST`)
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    /// Round-trip to the daemon; used as a boot-time reachability check
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .context("Docker daemon is not reachable")?;
        Ok(())
    }
}

/// 404 (gone) and 304 (already in the requested state) are not failures for cleanup calls
fn is_benign(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError { status_code, .. }
            if *status_code == 404 || *status_code == 304
    )
}

/// In-memory build context holding just the Dockerfile
fn dockerfile_context(dockerfile: &str) -> Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header
        .set_path("Dockerfile")
        .context("Failed to set Dockerfile path in build context")?;
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default(),
    );
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append(&header, dockerfile.as_bytes())
        .context("Failed to write Dockerfile into build context")?;
    builder
        .into_inner()
        .context("Failed to finish build context archive")
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => {
                debug!(image, "Image cache hit");
                Ok(true)
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to inspect image '{}'", image)),
        }
    }

    async fn build_image(&self, image: &str, dockerfile: &str) -> Result<()> {
        warn!(image, "Image cache miss, building from embedded Dockerfile");

        let context = dockerfile_context(dockerfile)?;
        let options = BuildImageOptions {
            dockerfile: "Dockerfile",
            t: image,
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(Bytes::from(context)));

        while let Some(item) = stream.next().await {
            let info = item.context("Failed to build Docker image")?;
            if let Some(error) = info.error {
                bail!("Docker build failed: {}", error);
            }
            if let Some(line) = info.stream.as_deref().map(str::trim_end) {
                if !line.is_empty() {
                    debug!(image, "{}", line);
                }
            }
        }

        info!(image, "Image built successfully");
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<String> {
        let mounts = spec
            .mounts
            .iter()
            .map(|m| Mount {
                source: Some(m.source.to_string_lossy().into_owned()),
                target: Some(m.target.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            user: Some(spec.user.clone()),
            working_dir: Some(spec.working_dir.clone()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            network_disabled: Some(spec.network_disabled),
            host_config: Some(HostConfig {
                mounts: Some(mounts),
                network_mode: spec.network_disabled.then(|| "none".to_string()),
                security_opt: Some(spec.security_opts.clone()),
                memory: spec.memory_bytes,
                memory_swap: spec.memory_bytes,
                nano_cpus: spec.nano_cpus,
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(options), config)
            .await
            .context("Failed to create Docker container")?;

        Ok(container.id)
    }

    async fn attach(&self, id: &str) -> Result<SandboxIo> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };

        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(id, Some(options))
            .await
            .context("Failed to attach to Docker container")?;

        let output = output
            .filter_map(|item| async move {
                match item {
                    Ok(LogOutput::StdOut { message }) => Some(Ok(OutputChunk::Stdout(message.to_vec()))),
                    Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::Stderr(message.to_vec()))),
                    Ok(_) => None,
                    Err(e) => Some(Err(anyhow!(e).context("Error reading container output"))),
                }
            })
            .boxed();

        Ok(SandboxIo { input, output })
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Bollard surfaces non-zero exits as an error carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e).context("Error waiting for Docker container"),
            None => bail!("Wait stream ended without an exit status"),
        }
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_benign(&e) => Ok(()),
            Err(e) => Err(e).context("Failed to stop Docker container"),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_benign(&e) => Ok(()),
            Err(e) => Err(e).context("Failed to remove Docker container"),
        }
    }
}
