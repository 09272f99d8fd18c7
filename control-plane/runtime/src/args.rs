use crate::{
    admission::Admission,
    controllers::{
        agents::agent_selector,
        endpoints::{self, EndpointsConfig, EndpointsReconciler},
        peering::{self, PeeringReconciler},
        terminating_gateway::{self, TerminatingGatewayReconciler},
        AgentDirectory, AgentPods, ControllerMetrics, KubeApi, KubeClient, SharedAgent,
    },
    core::{
        iptables::IptablesConfigBuilder, metrics::MetricsConfig, MeshNamespaces, NamespaceFilter,
    },
    k8s::{
        Api, Client, Endpoints, PeeringAcceptor, Pod, ResourceExt, TerminatingGatewayService,
    },
    lease::WriteLease,
    mesh::{HttpMeshClient, MeshClient, MeshConfig},
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::{
    controller::{self, Action, Controller},
    reflector::ObjectRef,
    watcher::{self, watcher},
    WatchStreamExt,
};
use prometheus_client::registry::Registry;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, info_span, warn, Instrument};

const FIELD_MANAGER: &str = "consul-k8s-control-plane";

const ERROR_REQUEUE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[clap(
    name = "consul-k8s-control-plane",
    about = "Keeps the Consul catalog in step with Kubernetes"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "consul_k8s=info,warn",
        env = "CONSUL_K8S_CONTROL_PLANE_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the pod mutating webhook.
    #[clap(long)]
    admission_controller_disabled: bool,

    #[clap(flatten)]
    controllers: ControllerArgs,
}

/// Settings shared by the controllers and the webhook.
#[derive(Clone, Debug, clap::Args)]
struct ControllerArgs {
    /// Address of the Consul servers (or the shared agent).
    #[clap(long, default_value = "localhost", env = "CONSUL_HTTP_ADDR")]
    consul_address: String,

    #[clap(long, default_value = "http")]
    consul_scheme: String,

    #[clap(long, default_value = "8500")]
    consul_port: u16,

    #[clap(long, env = "CONSUL_HTTP_TOKEN", hide_env_values = true)]
    consul_token: Option<String>,

    /// Upper bound on every Consul API call.
    #[clap(long, default_value = "5s", value_parser = humantime::parse_duration)]
    consul_api_timeout: Duration,

    #[clap(long, default_value = "")]
    partition: String,

    #[clap(long)]
    enable_partitions: bool,

    #[clap(long, default_value = "consul")]
    release_name: String,

    #[clap(long, default_value = "default")]
    release_namespace: String,

    /// Kubernetes namespaces to reconcile. `*` allows all.
    #[clap(long = "allow-k8s-namespace", default_value = "*")]
    allow_k8s_namespaces: Vec<String>,

    /// Kubernetes namespaces never to reconcile. Takes precedence over the allow list.
    #[clap(long = "deny-k8s-namespace")]
    deny_k8s_namespaces: Vec<String>,

    #[clap(long)]
    enable_namespaces: bool,

    #[clap(long, default_value = "default")]
    destination_namespace: String,

    #[clap(long)]
    enable_namespace_mirroring: bool,

    #[clap(long, default_value = "")]
    mirroring_prefix: String,

    #[clap(long)]
    enable_transparent_proxy: bool,

    #[clap(long)]
    transparent_proxy_overwrite_probes: bool,

    #[clap(long)]
    enable_consul_dns: bool,

    /// Prefix of the release's resource names, from which the DNS service's env variable is
    /// derived.
    #[clap(long, default_value = "consul")]
    resource_prefix: String,

    /// Tokens minted by this auth method are deleted along with their service instances.
    #[clap(long)]
    acl_auth_method: Option<String>,

    #[clap(long)]
    enable_acls: bool,

    #[clap(long)]
    enable_metrics: bool,

    #[clap(long)]
    default_enable_metrics_merging: bool,

    #[clap(long, default_value = "20100")]
    default_merged_metrics_port: String,

    #[clap(long, default_value = "20200")]
    default_prometheus_scrape_port: String,

    #[clap(long, default_value = "/metrics")]
    default_prometheus_scrape_path: String,

    /// Writes registrations to the agent on each pod's node rather than to `consul-address`.
    #[clap(long)]
    per_node_agents: bool,

    #[clap(long, default_value = "consul-connect-injector")]
    controller_deployment_name: String,

    /// Runs the controllers without contending for the write Lease.
    #[clap(long)]
    lease_disabled: bool,

    #[clap(long, default_value = "10m", value_parser = humantime::parse_duration)]
    resync_period: Duration,
}

/// The pieces every controller is built from.
struct Shared {
    kube: Arc<dyn KubeApi>,
    mesh: Arc<dyn MeshClient>,
    agents: Arc<dyn AgentDirectory>,
    metrics: ControllerMetrics,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            controllers: args,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let mut prom = <Registry>::default();
        let metrics = ControllerMetrics::register(prom.sub_registry_with_prefix("controller"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let client = runtime.client();
        let shared = args.shared(&client, metrics)?;

        let claimed = if args.lease_disabled {
            None
        } else {
            let hostname =
                std::env::var("HOSTNAME").context("failed to read HOSTNAME environment variable")?;
            let lease = WriteLease::contend(
                &runtime,
                &args.release_namespace,
                &args.controller_deployment_name,
                hostname,
            )
            .await?;
            Some(lease.acquired())
        };

        // Controllers only start writing once the Lease is held.
        let controllers = args.controllers(client.clone(), shared);
        tokio::spawn(
            async move {
                if let Some(claimed) = claimed {
                    if let Err(error) = claimed.await {
                        warn!(%error, "Lease manager stopped before the Lease was acquired");
                        return;
                    }
                    info!("Acquired the write Lease");
                }
                controllers.await;
            }
            .instrument(info_span!("controllers")),
        );

        let builder = args.iptables_builder();
        let runtime = runtime.spawn_server(move || Admission::new(client, builder));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

// === impl ControllerArgs ===

impl ControllerArgs {
    fn mesh_config(&self) -> MeshConfig {
        MeshConfig {
            scheme: self.consul_scheme.clone(),
            port: self.consul_port,
            token: self.consul_token.clone(),
            partition: if self.enable_partitions {
                self.partition.clone()
            } else {
                String::new()
            },
            timeout: self.consul_api_timeout,
        }
    }

    fn metrics_config(&self) -> MetricsConfig {
        MetricsConfig {
            default_enable_metrics: self.enable_metrics,
            default_enable_metrics_merging: self.default_enable_metrics_merging,
            default_merged_metrics_port: self.default_merged_metrics_port.clone(),
            default_prometheus_scrape_port: self.default_prometheus_scrape_port.clone(),
            default_prometheus_scrape_path: self.default_prometheus_scrape_path.clone(),
        }
    }

    fn iptables_builder(&self) -> IptablesConfigBuilder {
        IptablesConfigBuilder {
            metrics: self.metrics_config(),
            enable_transparent_proxy: self.enable_transparent_proxy,
            overwrite_probes: self.transparent_proxy_overwrite_probes,
            enable_consul_dns: self.enable_consul_dns,
            resource_prefix: self.resource_prefix.clone(),
        }
    }

    fn endpoints_config(&self) -> EndpointsConfig {
        EndpointsConfig {
            namespaces: NamespaceFilter {
                allow: self.allow_k8s_namespaces.iter().cloned().collect(),
                deny: self.deny_k8s_namespaces.iter().cloned().collect(),
            },
            mesh_namespaces: MeshNamespaces::from_flags(
                self.enable_namespaces,
                self.destination_namespace.clone(),
                self.enable_namespace_mirroring,
                self.mirroring_prefix.clone(),
            ),
            enable_partitions: self.enable_partitions,
            auth_method: self.acl_auth_method.clone().filter(|m| !m.is_empty()),
            enable_transparent_proxy: self.enable_transparent_proxy,
            overwrite_probes: self.transparent_proxy_overwrite_probes,
            metrics: self.metrics_config(),
            resync: self.resync_period,
            error_requeue: ERROR_REQUEUE,
        }
    }

    fn shared(&self, client: &Client, metrics: ControllerMetrics) -> Result<Shared> {
        let kube: Arc<dyn KubeApi> = Arc::new(KubeClient::new(client.clone(), FIELD_MANAGER));
        let config = self.mesh_config();
        let http = HttpMeshClient::http_client()?;
        let mesh: Arc<dyn MeshClient> = Arc::new(
            HttpMeshClient::new(&config, http.clone(), &self.consul_address)
                .context("invalid Consul address")?,
        );
        let agents: Arc<dyn AgentDirectory> = if self.per_node_agents {
            Arc::new(AgentPods::new(
                kube.clone(),
                &self.release_name,
                self.release_namespace.clone(),
                config,
                http,
            ))
        } else {
            Arc::new(SharedAgent::new(mesh.clone()))
        };
        Ok(Shared {
            kube,
            mesh,
            agents,
            metrics,
        })
    }

    /// Builds every controller. Nothing runs until the returned future is polled.
    fn controllers(
        &self,
        client: Client,
        shared: Shared,
    ) -> impl Future<Output = ()> + Send + 'static {
        let Shared {
            kube,
            mesh,
            agents,
            metrics,
        } = shared;

        let endpoints = Arc::new(EndpointsReconciler::new(
            kube.clone(),
            agents,
            self.endpoints_config(),
            metrics.clone(),
        ));
        let endpoints_api = Api::<Endpoints>::all(client.clone());
        let controller = Controller::new(endpoints_api.clone(), watcher::Config::default());
        let controller = if self.per_node_agents {
            // An agent changing state re-enqueues every Endpoints with an address on its node.
            let store = controller.store();
            controller.watches(
                Api::<Pod>::namespaced(client.clone(), &self.release_namespace),
                watcher::Config::default().labels(&agent_selector(&self.release_name)),
                move |agent| {
                    let state = store.state();
                    endpoints::endpoints_on_agent_node(&agent, state.iter().map(|ep| &**ep))
                        .into_iter()
                        .map(|(ns, name)| ObjectRef::new(&name).within(&ns))
                        .collect::<Vec<_>>()
                },
            )
        } else {
            controller
        };
        let endpoints_controller = controller
            .shutdown_on_signal()
            .run(endpoints::reconcile, endpoints::error_policy, endpoints.clone())
            .for_each(log_reconciled)
            .instrument(info_span!("endpoints"));
        let endpoints_deletes = deregister_deleted(endpoints_api, endpoints)
            .instrument(info_span!("endpoints_deletes"));

        let peering = Arc::new(PeeringReconciler::new(
            kube.clone(),
            mesh.clone(),
            metrics.clone(),
            self.resync_period,
            ERROR_REQUEUE,
        ));
        let peering_controller = Controller::new(
            Api::<PeeringAcceptor>::all(client.clone()),
            watcher::Config::default(),
        )
        .shutdown_on_signal()
        .run(peering::reconcile, peering::error_policy, peering)
        .for_each(log_reconciled)
        .instrument(info_span!("peeringacceptors"));

        let tgw = Arc::new(TerminatingGatewayReconciler::new(
            kube,
            mesh,
            self.enable_acls,
            metrics,
            self.resync_period,
            ERROR_REQUEUE,
        ));
        let tgw_controller = Controller::new(
            Api::<TerminatingGatewayService>::all(client),
            watcher::Config::default(),
        )
        .shutdown_on_signal()
        .run(
            terminating_gateway::reconcile,
            terminating_gateway::error_policy,
            tgw,
        )
        .for_each(log_reconciled)
        .instrument(info_span!("terminatinggatewayservices"));

        async move {
            tokio::join!(
                endpoints_controller,
                endpoints_deletes,
                peering_controller,
                tgw_controller
            );
        }
    }
}

async fn log_reconciled<K, E>(
    res: std::result::Result<(ObjectRef<K>, Action), controller::Error<E, watcher::Error>>,
) where
    K: kube::Resource,
    E: std::error::Error + 'static,
{
    match res {
        Ok((obj, _)) => debug!(namespace = ?obj.namespace, name = %obj.name, "Reconciled"),
        Err(error) => debug!(%error, "Reconcile failed"),
    }
}

/// Reconciles deleted Endpoints, which a controller never sees.
///
/// Each deletion is retried on its own task until the instances are gone.
async fn deregister_deleted(api: Api<Endpoints>, reconciler: Arc<EndpointsReconciler>) {
    let events = watcher(api, watcher::Config::default()).default_backoff();
    let mut events = std::pin::pin!(events);
    while let Some(event) = events.next().await {
        match event {
            Ok(watcher::Event::Delete(endpoints)) => {
                let namespace = endpoints.namespace().unwrap_or_default();
                let name = endpoints.name_any();
                let reconciler = reconciler.clone();
                tokio::spawn(
                    async move { reconciler.reconcile_deleted(&namespace, &name).await }
                        .in_current_span(),
                );
            }
            Ok(_) => {}
            Err(error) => warn!(%error, "Endpoints watch failed"),
        }
    }
}
