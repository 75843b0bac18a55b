use crate::fit::{FitFactory, FitFunction, FitParams};
use crate::outcome::{FailureReason, Outcome};
use crate::series::SliceProvider;
use crate::work_unit::WorkKey;
use crate::VifitError;
use rayon::prelude::*;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Everything a worker reads while fitting. Shared read-only across the pool.
#[derive(Clone, Copy)]
pub struct BatchContext<'a> {
    pub provider: &'a dyn SliceProvider,
    pub params: &'a FitParams,
}

/// Bounded rayon pool for one wave of batches. Dropped and rebuilt between waves so
/// per-thread allocations do not accumulate over a multi-day run.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    workers: usize,
    wave: usize,
}

impl WorkerPool {
    pub fn build(workers: usize, wave: usize) -> Result<Self, VifitError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(move |i| format!("vifit-w{}-{}", wave, i))
            .build()
            .map_err(|e| VifitError::Dispatch(format!("failed to build pool for wave {}: {}", wave, e)))?;
        tracing::debug!("[pool] built wave {} with {} workers", wave, workers);
        Ok(Self { pool, workers, wave })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn wave(&self) -> usize {
        self.wave
    }

    /// Fit every key of `batch` across the pool. Outcomes come back in batch order.
    /// A unit that panics becomes a failure; a panic anywhere else in the backend is a
    /// `Dispatch` error and the caller falls back to `run_sequential`.
    pub fn run_batch<F: FitFactory>(
        &self,
        factory: &F,
        ctx: &BatchContext<'_>,
        batch: &[WorkKey],
    ) -> Result<Vec<(WorkKey, Outcome)>, VifitError> {
        let dispatched = panic::catch_unwind(AssertUnwindSafe(|| {
            self.pool.install(|| {
                batch
                    .par_iter()
                    .map_init(
                        || factory.make_fitter(),
                        |fitter, key| (*key, execute_unit(fitter, factory, ctx, key)),
                    )
                    .collect::<Vec<_>>()
            })
        }));

        dispatched.map_err(|payload| {
            VifitError::Dispatch(format!(
                "wave {} batch of {} panicked outside a unit: {}",
                self.wave,
                batch.len(),
                panic_message(payload.as_ref())
            ))
        })
    }
}

/// Fit a batch on the calling thread with a single fit context.
pub fn run_sequential<F: FitFactory>(
    factory: &F,
    ctx: &BatchContext<'_>,
    batch: &[WorkKey],
) -> Result<Vec<(WorkKey, Outcome)>, VifitError> {
    let mut fitter = panic::catch_unwind(AssertUnwindSafe(|| factory.make_fitter())).map_err(|payload| {
        VifitError::Dispatch(format!(
            "fit context could not be built: {}",
            panic_message(payload.as_ref())
        ))
    })?;

    Ok(batch
        .iter()
        .map(|key| (*key, execute_unit(&mut fitter, factory, ctx, key)))
        .collect())
}

fn execute_unit<F: FitFactory>(
    fitter: &mut F::Fitter,
    factory: &F,
    ctx: &BatchContext<'_>,
    key: &WorkKey,
) -> Outcome {
    let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
        let slice = ctx.provider.slice(key).unwrap_or_default();
        fitter.fit(key, &slice, ctx.params)
    }));

    match attempt {
        Ok(outcome) => outcome.validated(key),
        Err(payload) => {
            tracing::warn!("[pool] fit for {} panicked: {}", key, panic_message(payload.as_ref()));
            // The context may be half-updated; never reuse it.
            match panic::catch_unwind(AssertUnwindSafe(|| factory.make_fitter())) {
                Ok(fresh) => *fitter = fresh,
                Err(_) => tracing::warn!("[pool] could not rebuild fit context after panic on {}", key),
            }
            Outcome::Failure(FailureReason::NumericalError)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
