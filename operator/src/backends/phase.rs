//! Phase determination shared by every backend.
//!
//! A single job maps to a phase on its own. When a load test owns several jobs each job is
//! evaluated and the worst phase wins: Errored, then Running, then Starting, then Finished.
use k8s_openapi::api::batch::v1::{Job, JobStatus};

use crate::loadtest::{LoadTestPhase, LoadTestPodsStatus};

/// Phase of a load test owning a single job.
pub fn phase_from_job(status: &JobStatus) -> LoadTestPhase {
    let active = status.active.unwrap_or_default();
    let succeeded = status.succeeded.unwrap_or_default();
    let failed = status.failed.unwrap_or_default();

    if failed > 0 {
        LoadTestPhase::Errored
    } else if active > 0 {
        LoadTestPhase::Running
    } else if succeeded == 0 {
        LoadTestPhase::Starting
    } else {
        LoadTestPhase::Finished
    }
}

fn precedence(phase: LoadTestPhase) -> u8 {
    match phase {
        LoadTestPhase::Errored => 4,
        LoadTestPhase::Running => 3,
        LoadTestPhase::Starting => 2,
        LoadTestPhase::Creating => 1,
        LoadTestPhase::Finished => 0,
    }
}

/// Combine the phases of several jobs, the worst phase wins.
///
/// Returns None when there is nothing to combine.
pub fn combine(phases: impl IntoIterator<Item = LoadTestPhase>) -> Option<LoadTestPhase> {
    phases.into_iter().max_by_key(|phase| precedence(*phase))
}

/// Phase of a load test owning several jobs.
///
/// Jobs not created yet leave the load test in Creating.
pub fn phase_from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> LoadTestPhase {
    combine(jobs.into_iter().map(|job| phase_from_job(&job_status(job))))
        .unwrap_or(LoadTestPhase::Creating)
}

/// Job whose status best describes a set of jobs.
///
/// The first failed job, else the first active job, else the first job.
pub fn representative_job(jobs: &[Job]) -> Option<&Job> {
    jobs.iter()
        .find(|job| job_status(job).failed.unwrap_or_default() > 0)
        .or_else(|| {
            jobs.iter()
                .find(|job| job_status(job).active.unwrap_or_default() > 0)
        })
        .or_else(|| jobs.first())
}

/// Status of a job, defaulted when the job controller has not reported one yet.
pub fn job_status(job: &Job) -> JobStatus {
    job.status.clone().unwrap_or_default()
}

/// Pod counts derived from the active pods of the given jobs.
pub fn pods_from_jobs<'a>(
    jobs: impl IntoIterator<Item = &'a Job>,
    desired: i32,
) -> LoadTestPodsStatus {
    LoadTestPodsStatus {
        current: jobs
            .into_iter()
            .filter_map(|job| job.status.as_ref().and_then(|s| s.active))
            .sum(),
        desired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(active: i32, succeeded: i32, failed: i32) -> Job {
        Job {
            status: Some(JobStatus {
                active: Some(active),
                succeeded: Some(succeeded),
                failed: Some(failed),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn single_job_phases() {
        let phase = |a, s, f| phase_from_job(&job_status(&job(a, s, f)));
        assert_eq!(phase(0, 0, 0), LoadTestPhase::Starting);
        assert_eq!(phase(1, 0, 0), LoadTestPhase::Running);
        assert_eq!(phase(0, 1, 0), LoadTestPhase::Finished);
        assert_eq!(phase(1, 0, 1), LoadTestPhase::Errored);
        assert_eq!(phase(0, 1, 1), LoadTestPhase::Errored);
        assert_eq!(
            phase_from_job(&JobStatus::default()),
            LoadTestPhase::Starting
        );
    }

    #[test]
    fn progressing_job_never_goes_backwards() {
        let progression = [job(0, 0, 0), job(1, 0, 0), job(2, 0, 0), job(0, 1, 0)];
        let phases: Vec<_> = progression
            .iter()
            .map(|j| phase_from_job(&job_status(j)))
            .collect();
        assert_eq!(
            phases,
            vec![
                LoadTestPhase::Starting,
                LoadTestPhase::Running,
                LoadTestPhase::Running,
                LoadTestPhase::Finished
            ]
        );
    }

    #[test]
    fn finished_master_with_running_workers_is_running() {
        let master = job(0, 1, 0);
        let worker = job(2, 0, 0);
        assert_eq!(phase_from_jobs([&master, &worker]), LoadTestPhase::Running);
    }

    #[test]
    fn finished_master_with_starting_workers_is_starting() {
        let master = job(0, 1, 0);
        let worker = job(0, 0, 0);
        assert_eq!(phase_from_jobs([&master, &worker]), LoadTestPhase::Starting);
    }

    #[test]
    fn any_failed_job_is_errored() {
        let jobs = [job(0, 1, 0), job(3, 0, 0), job(0, 0, 1)];
        assert_eq!(phase_from_jobs(&jobs), LoadTestPhase::Errored);
    }

    #[test]
    fn all_jobs_must_finish() {
        let jobs = [job(0, 1, 0), job(0, 1, 0)];
        assert_eq!(phase_from_jobs(&jobs), LoadTestPhase::Finished);
        assert_eq!(phase_from_jobs(&[] as &[Job]), LoadTestPhase::Creating);
    }

    #[test]
    fn representative_prefers_failed_then_active() {
        let jobs = vec![job(0, 1, 0), job(1, 0, 0), job(0, 0, 1)];
        assert_eq!(representative_job(&jobs), Some(&jobs[2]));
        let jobs = vec![job(0, 1, 0), job(1, 0, 0)];
        assert_eq!(representative_job(&jobs), Some(&jobs[1]));
        let jobs = vec![job(0, 1, 0), job(0, 0, 0)];
        assert_eq!(representative_job(&jobs), Some(&jobs[0]));
        assert_eq!(representative_job(&[]), None);
    }

    #[test]
    fn pods_count_active_job_pods() {
        let jobs = [job(2, 0, 0), job(1, 0, 0), job(0, 1, 0)];
        assert_eq!(
            pods_from_jobs(&jobs, 4),
            LoadTestPodsStatus {
                current: 3,
                desired: 4
            }
        );
    }
}
