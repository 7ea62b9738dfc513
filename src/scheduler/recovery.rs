use std::path::Path;

use crate::error::Result;
use crate::scheduler::job::{is_marker_name, JobId, JobRecord, JobStatus};

/// What a startup scan of the job root found.
#[derive(Debug, Default)]
pub struct Recovered {
    /// Jobs with a readable marker, sorted by id.
    pub jobs: Vec<JobRecord>,
    /// First id not used by any directory under the root.
    pub next_id: JobId,
    /// Numeric directories that had no usable marker.
    pub skipped: usize,
}

/// Scan `root` for `{id}/request_{id}_*_info.json` markers.
///
/// Every directory named by an integer reserves its id, marker or not, so new
/// jobs never collide with leftovers. Unreadable or malformed markers are
/// logged and their directory skipped.
pub async fn scan_job_root(root: &Path) -> Result<Recovered> {
    let mut recovered = Recovered::default();
    let mut entries = tokio::fs::read_dir(root).await?;

    while let Some(entry) = entries.next_entry().await? {
        let Some(id) = entry
            .file_name()
            .to_str()
            .and_then(parse_job_dir_name)
        else {
            continue;
        };
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        recovered.next_id = recovered.next_id.max(id.saturating_add(1));

        match load_marker(&entry.path(), id).await {
            Some(job) => recovered.jobs.push(job),
            None => recovered.skipped += 1,
        }
    }

    recovered.jobs.sort_by_key(|job| job.id);
    tracing::info!(
        root = %root.display(),
        recovered = recovered.jobs.len(),
        skipped = recovered.skipped,
        next_id = recovered.next_id,
        "Job root scanned"
    );
    Ok(recovered)
}

/// Job directories are named by the plain decimal id, so `007` or `+7` are not jobs.
fn parse_job_dir_name(name: &str) -> Option<JobId> {
    name.parse::<JobId>()
        .ok()
        .filter(|id| id.to_string() == name)
}

async fn load_marker(dir: &Path, id: JobId) -> Option<JobRecord> {
    let marker = match find_marker(dir, id).await {
        Ok(Some(path)) => path,
        Ok(None) => {
            tracing::debug!(job_id = id, dir = %dir.display(), "No marker, skipping directory");
            return None;
        }
        Err(e) => {
            tracing::warn!(job_id = id, dir = %dir.display(), error = %e, "Failed to list job directory");
            return None;
        }
    };

    let mut job = match JobRecord::read_marker(&marker).await {
        Ok(job) => job,
        Err(e) => {
            tracing::warn!(
                job_id = id,
                marker = %marker.display(),
                error = %e,
                "Malformed marker, skipping directory"
            );
            return None;
        }
    };

    if job.id != id {
        tracing::warn!(
            job_id = id,
            marker_id = job.id,
            "Marker id does not match its directory, skipping"
        );
        return None;
    }
    if job.status != JobStatus::Completed {
        tracing::warn!(job_id = id, status = %job.status, "Job was interrupted before completing");
    }

    // The root may have moved since the marker was written.
    job.work_dir = dir.to_path_buf();
    job.status = JobStatus::Completed;
    Some(job)
}

async fn find_marker(dir: &Path, id: JobId) -> std::io::Result<Option<std::path::PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| is_marker_name(name, id))
        {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}
