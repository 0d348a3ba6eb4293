// ABOUTME: Read-only fleet snapshot of containers this library owns.
// ABOUTME: containerd only; the daemon backend reports a zero-valued result.

use chrono::{DateTime, Utc};
use containerd_client::services::v1::{GetRequest, ListContainersRequest};
use containerd_client::types::v1::Status as TaskStatus;

use crate::backend::Containerd;
use crate::error::{Error, Result};
use crate::factory::Client;

const OWNER_FILTER: &str = r#"labels."wk/owner"==chains"#;
const DEADLINE_LABEL: &str = "chains/deadline";

/// Counts of owned containers bucketed by task state, plus deadline and
/// error tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub running: u64,
    pub created: u64,
    pub stopped: u64,
    pub paused: u64,
    pub pausing: u64,
    pub unknown: u64,
    pub deadline_exceeded: u64,
    pub errors: u64,
}

/// Snapshot the containers this library owns on the given runtime.
pub async fn get_stats(client: impl Into<Client>) -> Result<Stats> {
    match client.into() {
        Client::Docker(_) => Ok(Stats::default()),
        Client::Containerd(containerd) => containerd_stats(&containerd).await,
    }
}

async fn containerd_stats(client: &Containerd) -> Result<Stats> {
    let request = client
        .request(ListContainersRequest {
            filters: vec![OWNER_FILTER.to_string()],
        })
        .map_err(|e| Error::Stats(e.to_string()))?;

    let containers = client
        .containers()
        .list(request)
        .await
        .map_err(|e| Error::Stats(e.to_string()))?
        .into_inner()
        .containers;

    let mut stats = Stats::default();
    let now = Utc::now();

    for container in containers {
        if let Some(deadline) = container.labels.get(DEADLINE_LABEL) {
            note_deadline(&mut stats, deadline, now);
        }

        let request = match client.request(GetRequest {
            container_id: container.id.clone(),
            exec_id: String::new(),
        }) {
            Ok(request) => request,
            Err(_) => {
                stats.errors += 1;
                continue;
            }
        };

        match client.tasks().get(request).await {
            Ok(response) => {
                let status = response
                    .into_inner()
                    .process
                    .map(|p| p.status)
                    .unwrap_or_default();
                note_status(&mut stats, status);
            }
            Err(_) => stats.errors += 1,
        }
    }

    Ok(stats)
}

fn note_deadline(stats: &mut Stats, label: &str, now: DateTime<Utc>) {
    match DateTime::parse_from_rfc3339(label) {
        Ok(deadline) if deadline.with_timezone(&Utc) < now => stats.deadline_exceeded += 1,
        Ok(_) => {}
        Err(_) => stats.errors += 1,
    }
}

fn note_status(stats: &mut Stats, status: i32) {
    match TaskStatus::try_from(status) {
        Ok(TaskStatus::Running) => stats.running += 1,
        Ok(TaskStatus::Created) => stats.created += 1,
        Ok(TaskStatus::Stopped) => stats.stopped += 1,
        Ok(TaskStatus::Paused) => stats.paused += 1,
        Ok(TaskStatus::Pausing) => stats.pausing += 1,
        Ok(TaskStatus::Unknown) | Err(_) => stats.unknown += 1,
    }
}
