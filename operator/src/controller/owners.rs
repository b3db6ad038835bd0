//! Resolve the load test owning a job or pod, so changes to owned resources trigger a reconcile.
//!
//! Load tests are cluster scoped while the resources they own live in the load test namespace,
//! the keys produced here never carry a namespace.
use k8s_openapi::{
    api::{batch::v1::Job, core::v1::Pod},
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{
    runtime::reflector::{ObjectRef, Store},
    Resource, ResourceExt,
};
use tracing::trace;

use crate::loadtest::LoadTest;

/// Key of a load test in the controller.
pub type Key = ObjectRef<LoadTest>;

/// Controller owner of the given kind.
fn controller_owner<K: Resource<DynamicType = ()>>(
    owners: &[OwnerReference],
) -> Option<&OwnerReference> {
    owners.iter().find(|owner| {
        owner.controller == Some(true)
            && owner.kind == K::kind(&())
            && owner.api_version == K::api_version(&())
    })
}

/// Load test controlling a job.
pub fn owner_of_job(job: &Job) -> Option<Key> {
    let owner = controller_owner::<LoadTest>(job.owner_references())?;
    trace!(job = %job.name_any(), load_test = %owner.name, "job changed");
    Some(ObjectRef::new(&owner.name))
}

/// Load test controlling a pod, directly or through a job found in the job cache.
pub fn owner_of_pod(jobs: &Store<Job>, pod: &Pod) -> Option<Key> {
    let owners = pod.owner_references();
    if let Some(owner) = controller_owner::<LoadTest>(owners) {
        return Some(ObjectRef::new(&owner.name));
    }
    let job_owner = controller_owner::<Job>(owners)?;
    let job_ref = ObjectRef::<Job>::new(&job_owner.name).within(&pod.namespace()?);
    let job = jobs.get(&job_ref)?;
    trace!(pod = %pod.name_any(), job = %job.name_any(), "pod changed");
    owner_of_job(&job)
}
