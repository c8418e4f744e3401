//! Job plans
//!
//! Turns a `JobPlan` into jobs wired to each other, a handler, a cache and
//! shared container images.

use kiln_core::dto::plan::{JobPlan, PlannedImage, PlannedJob};
use kiln_core::{KilnError, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::cache::JobCache;
use crate::container::{ContainerImage, Provisioning};
use crate::handler::JobHandler;
use crate::job::Job;

/// Collaborators shared by every job of a plan
#[derive(Clone)]
pub struct PlanContext {
    pub handler: Arc<dyn JobHandler>,
    pub cache: Option<Arc<dyn JobCache>>,
    pub provisioning: Provisioning,
}

/// Builds the jobs of `plan`, dependencies first
///
/// Jobs naming the same image share one `ContainerImage`, so it is prepared
/// once.
///
/// # Errors
/// `KilnError::Plan` for duplicate names, unknown dependencies and cycles;
/// `KilnError::InvalidReference` for malformed image references.
pub fn build_jobs(plan: &JobPlan, context: &PlanContext) -> Result<Vec<Arc<Job>>> {
    let order = dependency_order(plan)?;
    let mut images: HashMap<PlannedImage, Arc<ContainerImage>> = HashMap::new();
    let mut built: HashMap<&str, Arc<Job>> = HashMap::new();
    let mut jobs = Vec::with_capacity(order.len());

    for index in order {
        let planned = &plan.jobs[index];
        let mut builder = Job::builder(planned.name.clone(), Arc::clone(&context.handler))
            .command(planned.command.clone());

        for (name, value) in &planned.inputs {
            builder = builder.input(name.clone(), value.clone());
        }
        for binding in &planned.dependencies {
            // dependency_order guarantees the dependency was built already
            let upstream = built.get(binding.job.as_str()).ok_or_else(|| {
                KilnError::Plan(format!(
                    "job '{}' was not built before '{}'",
                    binding.job, planned.name
                ))
            })?;
            builder = builder.depends_on(binding.input.clone(), upstream);
        }
        if let Some(planned_image) = &planned.image {
            let image = match images.get(planned_image) {
                Some(image) => Arc::clone(image),
                None => {
                    let image = Arc::new(image_for(planned_image, &context.provisioning)?);
                    images.insert(planned_image.clone(), Arc::clone(&image));
                    image
                }
            };
            builder = builder.image(image);
        }
        if planned.cache {
            if let Some(cache) = &context.cache {
                builder = builder.cache(Arc::clone(cache));
            }
        }
        for path in &planned.required_files {
            builder = builder.required_file(path.clone());
        }

        let job = builder.build();
        built.insert(planned.name.as_str(), Arc::clone(&job));
        jobs.push(job);
    }

    Ok(jobs)
}

fn image_for(image: &PlannedImage, provisioning: &Provisioning) -> Result<ContainerImage> {
    match image {
        PlannedImage::Local { reference, tag } => {
            ContainerImage::local(reference, tag.as_deref(), provisioning.clone())
        }
        PlannedImage::Remote { reference, tag } => {
            ContainerImage::remote(reference, tag.as_deref(), provisioning.clone())
        }
    }
}

/// Orders plan indices so every job follows its dependencies
///
/// Among jobs that are free to go, plan order is kept.
fn dependency_order(plan: &JobPlan) -> Result<Vec<usize>> {
    let mut index_of: HashMap<&str, usize> = HashMap::new();
    for (index, job) in plan.jobs.iter().enumerate() {
        if index_of.insert(job.name.as_str(), index).is_some() {
            return Err(KilnError::Plan(format!("duplicate job name '{}'", job.name)));
        }
    }

    let mut remaining: Vec<usize> = vec![0; plan.jobs.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); plan.jobs.len()];
    for (index, job) in plan.jobs.iter().enumerate() {
        let upstream = upstream_jobs(job);
        for name in &upstream {
            let Some(&dependency) = index_of.get(name) else {
                return Err(KilnError::Plan(format!(
                    "job '{}' depends on unknown job '{}'",
                    job.name, name
                )));
            };
            dependents[dependency].push(index);
        }
        remaining[index] = upstream.len();
    }

    let mut ready: VecDeque<usize> = (0..plan.jobs.len())
        .filter(|&i| remaining[i] == 0)
        .collect();
    let mut order = Vec::with_capacity(plan.jobs.len());
    while let Some(index) = ready.pop_front() {
        order.push(index);
        for &dependent in &dependents[index] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.push_back(dependent);
            }
        }
    }

    if order.len() != plan.jobs.len() {
        let stuck: Vec<&str> = (0..plan.jobs.len())
            .filter(|&i| remaining[i] > 0)
            .map(|i| plan.jobs[i].name.as_str())
            .collect();
        return Err(KilnError::Plan(format!(
            "dependency cycle between jobs: {}",
            stuck.join(", ")
        )));
    }

    Ok(order)
}

/// Distinct upstream job names, in binding order
fn upstream_jobs(job: &PlannedJob) -> Vec<&str> {
    let mut seen = HashSet::new();
    job.dependencies
        .iter()
        .map(|binding| binding.job.as_str())
        .filter(|name| seen.insert(*name))
        .collect()
}
