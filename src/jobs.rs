//! Job inference: Jobs have no event stream of their own, so they are derived
//! from the pods that carry a job label or a Job owner reference.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::models::k8s::{InferredJob, JobStatus, PodRecord, JOB_KIND};

const JOB_NAME_LABELS: [&str; 2] = ["job-name", "job"];

/// Name of the Job a pod belongs to, if any.
///
/// The `job-name` label wins over `job`, and both win over an owner
/// reference of kind `Job`. Empty values do not count.
pub fn job_name(pod: &PodRecord) -> Option<&str> {
    JOB_NAME_LABELS
        .iter()
        .filter_map(|label| pod.labels.get(*label))
        .map(String::as_str)
        .find(|name| !name.is_empty())
        .or_else(|| {
            pod.owner_references
                .iter()
                .find(|owner| owner.kind == JOB_KIND && !owner.name.is_empty())
                .map(|owner| owner.name.as_str())
        })
}

/// Derives Jobs from a set of pods.
///
/// Pure and order-independent: the same pods in any order produce the same
/// Jobs. The result is sorted newest first; Jobs without a creation time come
/// last.
pub fn infer(pods: &[PodRecord]) -> Vec<InferredJob> {
    let mut groups: BTreeMap<(&str, &str), Vec<&PodRecord>> = BTreeMap::new();
    for pod in pods {
        if let Some(job) = job_name(pod) {
            groups
                .entry((pod.namespace.as_str(), job))
                .or_default()
                .push(pod);
        }
    }

    let mut jobs: Vec<InferredJob> = groups
        .into_iter()
        .map(|((namespace, name), mut members)| {
            members.sort_by(|a, b| seen_order(a, b));
            let representative = members[0];
            InferredJob {
                name: name.to_string(),
                namespace: namespace.to_string(),
                status: aggregate_status(&members),
                representative_image: representative.image.clone(),
                created_at: representative.creation_timestamp,
                pod_count: members.len(),
            }
        })
        .collect();

    jobs.sort_by(|a, b| {
        match (a.created_at, b.created_at) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| a.namespace.cmp(&b.namespace))
        .then_with(|| a.name.cmp(&b.name))
    });
    jobs
}

/// Earliest-seen first: creation time, then store arrival, then name.
fn seen_order(a: &PodRecord, b: &PodRecord) -> Ordering {
    match (a.creation_timestamp, b.creation_timestamp) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then(a.first_seen.cmp(&b.first_seen))
    .then_with(|| a.name.cmp(&b.name))
}

/// `members` is non-empty and in [`seen_order`].
fn aggregate_status(members: &[&PodRecord]) -> JobStatus {
    if members
        .iter()
        .all(|p| matches!(p.status.as_str(), "Succeeded" | "Completed"))
    {
        JobStatus::Completed
    } else if any_status(members, &["Failed", "Error"]) {
        JobStatus::Failed
    } else if any_status(members, &["Running", "ContainerCreating"]) {
        JobStatus::Running
    } else {
        JobStatus::Other(members[0].status.clone())
    }
}

fn any_status(members: &[&PodRecord], statuses: &[&str]) -> bool {
    members
        .iter()
        .any(|p| statuses.iter().any(|s| *s == p.status))
}
