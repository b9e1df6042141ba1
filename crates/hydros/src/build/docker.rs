//! Image builds through a docker-compatible CLI.

use std::process::Command;
use std::time::Duration;

use super::{BuildRequest, ImageBuilder};
use crate::config::BuilderConfig;
use crate::error::{HydrosError, Result};
use crate::process::{describe, run_with_timeout};

const INSPECT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct DockerCliBuilder {
    command: String,
    timeout: Duration,
}

impl DockerCliBuilder {
    pub fn new(config: &BuilderConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    fn run(&self, args: &[&str], timeout: Duration) -> Result<()> {
        let mut cmd = Command::new(&self.command);
        cmd.args(args);
        let output = run_with_timeout(&cmd, None, timeout)?;
        if output.success() {
            Ok(())
        } else {
            Err(HydrosError::ImageBuild(format!(
                "{}: {}",
                describe(&cmd),
                output.stderr.trim()
            )))
        }
    }
}

impl ImageBuilder for DockerCliBuilder {
    fn exists(&self, reference: &str) -> Result<bool> {
        let mut cmd = Command::new(&self.command);
        cmd.args(["manifest", "inspect", reference]);
        let output = run_with_timeout(&cmd, None, INSPECT_TIMEOUT)?;
        Ok(output.success())
    }

    fn build(&self, request: &BuildRequest) -> Result<()> {
        let references = request.references();
        let mut args: Vec<String> = vec!["build".to_string()];
        for reference in &references {
            args.push("-t".to_string());
            args.push(reference.clone());
        }
        if let Some(dockerfile) = &request.dockerfile {
            args.push("-f".to_string());
            args.push(dockerfile.to_string_lossy().into_owned());
        }
        args.push(request.context.to_string_lossy().into_owned());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        log::info!("Building {}", request.image);
        self.run(&args, self.timeout)?;

        for reference in &references {
            self.run(&["push", reference], self.timeout)?;
        }
        Ok(())
    }
}
