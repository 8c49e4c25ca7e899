use crate::BackgroundJob;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;

type RunTaskFn<Context> = fn(Context, Value) -> BoxFuture<'static, anyhow::Result<()>>;

/// Maps job type names to their deserialize-and-run functions.
pub(crate) struct JobRegistry<Context> {
    job_types: HashMap<String, RunTaskFn<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            job_types: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            job_types: self.job_types.clone(),
        }
    }
}

impl<Context: Clone + Send + 'static> JobRegistry<Context> {
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        self.job_types
            .insert(J::JOB_NAME.to_string(), run_task::<J>);
    }

    pub(crate) fn job_types(&self) -> Vec<String> {
        self.job_types.keys().cloned().collect()
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<&RunTaskFn<Context>> {
        self.job_types.get(job_type)
    }
}

fn run_task<J: BackgroundJob>(
    ctx: J::Context,
    payload: Value,
) -> BoxFuture<'static, anyhow::Result<()>> {
    Box::pin(async move {
        let job: J = serde_json::from_value(payload)?;
        job.run(ctx).await
    })
}
