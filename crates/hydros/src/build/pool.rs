//! Bounded fan-out of image builds.

use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info};

use super::{BuildRequest, ImageBuilder};
use crate::error::{HydrosError, Result};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildReport {
    /// Images already present at the commit tag.
    pub present: Vec<String>,
    /// Images built and pushed by this call.
    pub built: Vec<String>,
}

/// Builds every request whose first tag is missing from the registry.
///
/// Up to `parallelism` builds run at once. Results are only inspected after
/// every build has finished; all failures are reported together.
pub fn build_missing(
    builder: &dyn ImageBuilder,
    requests: Vec<BuildRequest>,
    parallelism: usize,
) -> Result<BuildReport> {
    let mut report = BuildReport::default();
    let mut missing = Vec::new();

    for request in requests {
        builder.ensure_repository(&request.image)?;
        let Some(reference) = request.references().into_iter().next() else {
            continue;
        };
        if builder.exists(&reference)? {
            debug!("{} already exists", reference);
            report.present.push(reference);
        } else {
            missing.push(request);
        }
    }

    if missing.is_empty() {
        return Ok(report);
    }

    let worker_count = parallelism.max(1).min(missing.len());
    info!("Building {} image(s) with {} worker(s)", missing.len(), worker_count);

    let (job_tx, job_rx) = bounded::<BuildRequest>(missing.len());
    let (result_tx, result_rx) = bounded::<(String, Result<()>)>(missing.len());
    for request in missing {
        // Capacity equals the job count, so this never blocks.
        let _ = job_tx.send(request);
    }
    drop(job_tx);

    thread::scope(|scope| {
        for worker_id in 0..worker_count {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            scope.spawn(move || run_worker(worker_id, builder, jobs, results));
        }
    });
    drop(result_tx);

    let mut failures = Vec::new();
    for (image, result) in result_rx.iter() {
        match result {
            Ok(()) => report.built.push(image),
            Err(e) => failures.push(format!("{}: {}", image, e)),
        }
    }

    if failures.is_empty() {
        report.built.sort();
        Ok(report)
    } else {
        failures.sort();
        Err(HydrosError::ImageBuild(failures.join("; ")))
    }
}

fn run_worker(
    worker_id: usize,
    builder: &dyn ImageBuilder,
    jobs: Receiver<BuildRequest>,
    results: Sender<(String, Result<()>)>,
) {
    debug!("Build worker {} started", worker_id);
    for request in jobs.iter() {
        let result = builder.build(&request);
        if results.send((request.image.clone(), result)).is_err() {
            break;
        }
    }
    debug!("Build worker {} stopped", worker_id);
}
