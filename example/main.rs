use std::sync::{Arc, Mutex};
use std::time::Duration;

use clusterflow::errors;
use clusterflow::retry::{self, Outcome};
use clusterflow::{
    BoxError, ErrorContext, ExecutionState, FeatureGates, FlowConfig, FlowError, Graph, Sequence,
    Task, TaskFn, task_ids,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Status object owned by the caller. Tasks only touch their own fields.
#[derive(Debug, Default)]
struct ClusterStatus {
    dns_record_removed: bool,
    infrastructure_removed: bool,
    last_progress: (usize, usize),
}

#[derive(Debug)]
struct Preflight {
    namespace_exists: bool,
    kubeconfig_loaded: bool,
}

async fn preflight(error_context: &ErrorContext, namespace_exists: bool) -> Result<(), BoxError> {
    let mut state = Preflight {
        namespace_exists,
        kubeconfig_loaded: false,
    };

    Sequence::new(error_context)
        .on_new_error_id(|id| info!(error_id = %id, "preflight step started failing"))
        .on_resolved_error_id(|id| info!(error_id = %id, "preflight step recovered"))
        .step("Retrieve the cluster namespace", |s: &mut Preflight| {
            Box::pin(async move {
                if !s.namespace_exists {
                    // Nothing left to delete.
                    return Err(errors::cancel());
                }
                Ok(())
            })
        })
        .step("Load the host kubeconfig", |s: &mut Preflight| {
            Box::pin(async move {
                s.kubeconfig_loaded = true;
                Ok(())
            })
        })
        .step("Verify the host connection", |s: &mut Preflight| {
            Box::pin(async move {
                if !s.kubeconfig_loaded {
                    return Err(errors::severe("host kubeconfig missing"));
                }
                Ok(())
            })
        })
        .run(&mut state)
        .await
}

fn sleep_step(millis: u64) -> TaskFn {
    TaskFn::new(move |ctx: CancellationToken| async move {
        tokio::select! {
            _ = ctx.cancelled() => Err(errors::cancel()),
            _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(()),
        }
    })
}

/// Fails twice with a transient error before succeeding.
fn flaky_infrastructure_destroy(status: Arc<Mutex<ClusterStatus>>) -> TaskFn {
    let attempts = Arc::new(Mutex::new(0u32));
    TaskFn::new(move |_ctx| {
        let attempts = attempts.clone();
        let status = status.clone();
        async move {
            let attempt = {
                let mut attempts = attempts.lock().map_err(|e| e.to_string())?;
                *attempts += 1;
                *attempts
            };
            if attempt < 3 {
                return Err(errors::minor(format!(
                    "infrastructure still terminating (attempt {attempt})"
                )));
            }
            status.lock().map_err(|e| e.to_string())?.infrastructure_removed = true;
            Ok(())
        }
    })
}

fn build_delete_flow(
    config: &FlowConfig,
    gates: &FeatureGates,
    status: Arc<Mutex<ClusterStatus>>,
) -> Result<clusterflow::Flow, clusterflow::CompileError> {
    let interval = config.retry_interval();
    let mut g = Graph::new("managed cluster deletion");

    let wake_up_control_plane = g.add(Task::new("Wake up control plane", sleep_step(10)));
    let delete_logging_stack = g.add(
        Task::new("Delete logging stack", sleep_step(5))
            .do_if(gates.is_enabled("Logging"))
            .depends_on(wake_up_control_plane),
    );
    let delete_autoscaler = g.add(
        Task::new("Delete vertical pod autoscaler", sleep_step(5))
            .do_if(gates.is_enabled("HVPA"))
            .depends_on(wake_up_control_plane),
    );
    let delete_workers = g.add(
        Task::new("Delete worker pools", sleep_step(30))
            .retry_until_timeout(interval, config.retry_timeout())
            .depends_on(wake_up_control_plane),
    );

    let cleanup_sync_point = task_ids![delete_logging_stack, delete_autoscaler, delete_workers];

    let wait_for_workers = g.add(
        Task::from_fn("Wait until worker pools are gone", move |ctx| async move {
            retry::until_timeout(&ctx, interval, Duration::from_secs(1), |_ctx| async {
                Outcome::Done
            })
            .await
            .map_err(|e| e.into_error())
        })
        .depends_on(&cleanup_sync_point),
    );
    let destroy_infrastructure = g.add(
        Task::new("Destroy infrastructure", flaky_infrastructure_destroy(status.clone()))
            .retry_until_timeout(interval, config.retry_timeout())
            .depends_on(wait_for_workers),
    );

    let dns_status = status.clone();
    let destroy_dns = g.add(
        Task::from_fn("Destroy DNS record", move |_ctx| {
            let status = dns_status.clone();
            async move {
                status.lock().map_err(|e| e.to_string())?.dns_record_removed = true;
                Ok(())
            }
        })
        .timeout(Duration::from_secs(1))
        .depends_on(cleanup_sync_point),
    );

    g.add(
        Task::new("Delete control plane", sleep_step(10))
            .depends_on(task_ids![destroy_infrastructure, destroy_dns]),
    );

    g.compile()
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = FlowConfig::from_json(
        r#"{
            "maxConcurrency": 4,
            "retryIntervalMs": 20,
            "retryTimeoutMs": 2000,
            "featureGates": {"Logging": true, "HVPA": false}
        }"#,
    )?;

    let error_context = Arc::new(ErrorContext::new("managed cluster deletion"));

    // A cluster whose namespace is already gone short-circuits cleanly.
    if let Err(err) = preflight(&error_context, false).await {
        if errors::was_canceled(&*err) {
            info!("namespace already gone, nothing to delete");
        } else {
            return Err(err);
        }
    }

    preflight(&error_context, true).await?;

    let status = Arc::new(Mutex::new(ClusterStatus::default()));
    let flow = build_delete_flow(&config, &config.feature_gates, status.clone())?;
    println!("{}", flow.render());

    let progress_status = status.clone();
    let ctx = CancellationToken::new();
    let opts = config
        .run_options(ctx.clone())
        .with_error_context(error_context.clone())
        .with_progress_reporter(move |done, total| {
            if let Ok(mut status) = progress_status.lock() {
                status.last_progress = (done, total);
            }
        })
        .with_error_cleaner(|id| info!(error_id = %id, "clearing error of earlier attempt"));

    let report = flow.execute(opts).await;
    let states: Vec<(&str, ExecutionState)> = report
        .states()
        .map(|(id, state)| (flow.task_name(id).unwrap_or("?"), state))
        .collect();
    println!("{}", serde_json::to_string_pretty(&states)?);
    println!("{}", serde_json::to_string(&report.stats())?);

    match report.into_result() {
        Ok(()) => info!("managed cluster deleted"),
        Err(FlowError::Canceled { .. }) => {
            info!("deletion canceled, will resume on next reconciliation")
        }
        Err(err) => return Err(err.into()),
    }

    let status = status.lock().map_err(|e| e.to_string())?;
    println!(
        "dns record removed: {}, infrastructure removed: {}, progress: {}/{}",
        status.dns_record_removed,
        status.infrastructure_removed,
        status.last_progress.0,
        status.last_progress.1
    );
    Ok(())
}
