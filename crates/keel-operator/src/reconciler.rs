//! Ingress reconciler
//!
//! Watches `networking.k8s.io/v1` Ingress objects of the configured class and
//! asks [`Services`] for a sync whenever one changes. Only the leader runs it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, error, info};

use keel_common::{Configuration, ExecutionContext, Result};
use keel_runtime::{Manager, Registrable, Runnable};

use crate::services::Services;

/// Watcher timeout (seconds), kept below the client read timeout (30s) so the
/// API server closes idle watches first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Delay before retrying a failed reconcile
const REQUEUE_AFTER: Duration = Duration::from_secs(5);

/// Annotation predating `spec.ingressClassName`
const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Reconcile failures
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The sync worker has stopped
    #[error("services stopped, cannot sync {ingress}")]
    ServicesStopped {
        /// `namespace/name` of the Ingress
        ingress: String,
    },
}

/// Leader-gated Ingress controller
pub struct IngressReconciler {
    client: Client,
    config: Arc<Configuration>,
    services: Arc<Services>,
}

impl IngressReconciler {
    /// Create a reconciler feeding `services`
    pub fn new(client: Client, config: Arc<Configuration>, services: Arc<Services>) -> Self {
        Self {
            client,
            config,
            services,
        }
    }
}

#[async_trait]
impl Registrable for IngressReconciler {
    fn name(&self) -> &str {
        "controller"
    }

    fn label(&self) -> &str {
        "ingress reconciler"
    }

    async fn setup_with(&self, ctx: &ExecutionContext, manager: &mut Manager) -> Result<()> {
        let api: Api<Ingress> = match &self.config.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        ctx.logger().in_scope(|| {
            info!(
                ingress_class = %self.config.ingress_class,
                namespace = self.config.watch_namespace.as_deref().unwrap_or("*"),
                "Ingress controller registered"
            )
        });

        manager.add(Box::new(IngressController {
            api,
            state: Arc::new(ReconcileState {
                ingress_class: self.config.ingress_class.clone(),
                services: self.services.clone(),
            }),
        }))
    }
}

/// Shared state handed to every reconcile call
struct ReconcileState {
    ingress_class: String,
    services: Arc<Services>,
}

struct IngressController {
    api: Api<Ingress>,
    state: Arc<ReconcileState>,
}

#[async_trait]
impl Runnable for IngressController {
    fn name(&self) -> &str {
        "ingress-controller"
    }

    async fn start(self: Box<Self>, ctx: ExecutionContext) -> Result<()> {
        let IngressController { api, state } = *self;
        info!("Starting Ingress controller");

        let controller = Controller::new(api, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .run(reconcile, error_policy, state)
            .for_each(|result| {
                match result {
                    Ok((object, action)) => {
                        debug!(ingress = %object, ?action, "Ingress reconciliation completed")
                    }
                    Err(e) => error!(error = ?e, "Ingress reconciliation error"),
                }
                std::future::ready(())
            });

        tokio::select! {
            _ = ctx.cancelled() => {
                info!("Ingress controller stopped");
                Ok(())
            }
            _ = controller => Err(keel_common::Error::runnable(
                "ingress-controller",
                "controller stream ended",
            )),
        }
    }
}

/// Whether `ingress` belongs to `class`
///
/// Ingresses without any class are claimed as well.
fn matches_class(ingress: &Ingress, class: &str) -> bool {
    let from_spec = ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.ingress_class_name.as_deref());
    let from_annotation = ingress
        .annotations()
        .get(INGRESS_CLASS_ANNOTATION)
        .map(String::as_str);

    match from_spec.or(from_annotation) {
        Some(found) => found == class,
        None => true,
    }
}

async fn reconcile(
    ingress: Arc<Ingress>,
    state: Arc<ReconcileState>,
) -> std::result::Result<Action, ReconcileError> {
    let key = format!(
        "{}/{}",
        ingress.namespace().unwrap_or_default(),
        ingress.name_any()
    );

    if !matches_class(&ingress, &state.ingress_class) {
        debug!(ingress = %key, "Ignoring Ingress of another class");
        return Ok(Action::await_change());
    }

    if !state.services.request_sync() {
        return Err(ReconcileError::ServicesStopped { ingress: key });
    }
    debug!(ingress = %key, "Sync requested");
    Ok(Action::await_change())
}

fn error_policy(ingress: Arc<Ingress>, error: &ReconcileError, _state: Arc<ReconcileState>) -> Action {
    error!(
        ?error,
        ingress = %ingress.name_any(),
        "reconciliation failed"
    );
    Action::requeue(REQUEUE_AFTER)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ingress(value: serde_json::Value) -> Ingress {
        serde_json::from_value(value).unwrap()
    }

    fn config() -> Configuration {
        let args = keel_common::LaunchArgs {
            kubeconfig: None,
            kube_context: None,
            election: false,
            election_id: "keel-ingress-leader".to_string(),
            election_namespace: None,
            lease_duration: 15,
            renew_deadline: 10,
            retry_period: 2,
            health_probe_bind_address: "0".to_string(),
            metrics_bind_address: "0".to_string(),
            graceful_shutdown_timeout: 5,
            ingress_class: "haproxy".to_string(),
            watch_namespace: Some("web".to_string()),
        };
        let cluster = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        args.into_configuration(cluster).unwrap()
    }

    fn state(config: &Configuration) -> Arc<ReconcileState> {
        Arc::new(ReconcileState {
            ingress_class: config.ingress_class.clone(),
            services: Arc::new(Services::new(config)),
        })
    }

    #[test]
    fn class_from_spec_takes_precedence() {
        let ing = ingress(json!({
            "metadata": {
                "name": "web",
                "annotations": { "kubernetes.io/ingress.class": "haproxy" }
            },
            "spec": { "ingressClassName": "nginx" }
        }));
        assert!(!matches_class(&ing, "haproxy"));
        assert!(matches_class(&ing, "nginx"));
    }

    #[test]
    fn class_from_annotation() {
        let ing = ingress(json!({
            "metadata": {
                "name": "web",
                "annotations": { "kubernetes.io/ingress.class": "haproxy" }
            }
        }));
        assert!(matches_class(&ing, "haproxy"));
    }

    #[test]
    fn unclassed_ingress_is_claimed() {
        let ing = ingress(json!({ "metadata": { "name": "web" } }));
        assert!(matches_class(&ing, "haproxy"));
    }

    /// Register `services`, let its worker drain pending requests, stop it
    async fn syncs_after_draining(config: &Configuration, services: &Services) -> u64 {
        let client = Client::try_from(config.cluster.clone()).unwrap();
        let mut mgr = Manager::with_client(
            &ExecutionContext::new("test"),
            client,
            keel_runtime::ManagerOptions::from_config(config),
        )
        .await
        .unwrap();
        services
            .setup_with(&ExecutionContext::new("test"), &mut mgr)
            .await
            .unwrap();

        let ctx = ExecutionContext::new("test");
        let run = tokio::spawn(mgr.start(ctx.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.cancel();
        run.await.unwrap().unwrap();
        services.sync_count()
    }

    #[tokio::test]
    async fn reconcile_requests_sync() {
        let config = config();
        let state = state(&config);
        let ing = ingress(json!({
            "metadata": { "name": "web", "namespace": "default" },
            "spec": { "ingressClassName": "haproxy" }
        }));

        let action = reconcile(Arc::new(ing.clone()), state.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        // A second change before the worker runs folds into the queued sync.
        reconcile(Arc::new(ing), state.clone()).await.unwrap();

        assert_eq!(syncs_after_draining(&config, &state.services).await, 1);
    }

    #[tokio::test]
    async fn foreign_class_does_not_request_sync() {
        let config = config();
        let state = state(&config);
        let ing = ingress(json!({
            "metadata": { "name": "web", "namespace": "default" },
            "spec": { "ingressClassName": "nginx" }
        }));

        let action = reconcile(Arc::new(ing), state.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());

        assert_eq!(syncs_after_draining(&config, &state.services).await, 0);
    }

    #[tokio::test]
    async fn reconcile_fails_once_services_stopped() {
        let config = config();
        let services = Arc::new(Services::new(&config));
        let client = Client::try_from(config.cluster.clone()).unwrap();
        let mut mgr = Manager::with_client(
            &ExecutionContext::new("test"),
            client,
            keel_runtime::ManagerOptions::from_config(&config),
        )
        .await
        .unwrap();
        services
            .setup_with(&ExecutionContext::new("test"), &mut mgr)
            .await
            .unwrap();
        // Dropping the manager drops the sync worker and closes the channel.
        drop(mgr);

        let state = Arc::new(ReconcileState {
            ingress_class: config.ingress_class.clone(),
            services,
        });
        let ing = ingress(json!({ "metadata": { "name": "web", "namespace": "default" } }));
        let err = reconcile(Arc::new(ing), state).await.unwrap_err();
        assert_eq!(err.to_string(), "services stopped, cannot sync default/web");
    }

    #[tokio::test]
    async fn setup_registers_leader_gated_runnable() {
        let config = Arc::new(config());
        let services = Arc::new(Services::new(&config));
        let client = Client::try_from(config.cluster.clone()).unwrap();
        let mut mgr = Manager::with_client(
            &ExecutionContext::new("test"),
            client.clone(),
            keel_runtime::ManagerOptions::from_config(&config),
        )
        .await
        .unwrap();

        let reconciler = IngressReconciler::new(client, config, services);
        assert_eq!(reconciler.name(), "controller");
        assert_eq!(reconciler.label(), "ingress reconciler");
        reconciler
            .setup_with(&ExecutionContext::new("test"), &mut mgr)
            .await
            .unwrap();
        assert_eq!(mgr.runnables(), vec!["ingress-controller"]);
    }
}
