use super::*;
use crate::{
    agents::{Agent, SharedAgent},
    fake::{agent_pod, endpoints, injected_pod, FakeKube, FakeMesh},
};
use consul_k8s_core::catalog::{AclServiceIdentity, AclToken, AgentService};
use consul_k8s_k8s_api::{
    api::core::v1::{NamespaceSpec, ServicePort},
    Namespace, ObjectMeta, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use maplit::btreemap;
use pretty_assertions::assert_eq;

struct Fixture {
    kube: Arc<FakeKube>,
    mesh: Arc<FakeMesh>,
    reconciler: EndpointsReconciler,
}

fn fixture(config: EndpointsConfig) -> Fixture {
    let kube = Arc::new(FakeKube::default());
    let mesh = Arc::new(FakeMesh::default());
    let reconciler = EndpointsReconciler::new(
        kube.clone(),
        Arc::new(SharedAgent::new(mesh.clone())),
        config,
        ControllerMetrics::default(),
    );
    Fixture {
        kube,
        mesh,
        reconciler,
    }
}

fn config() -> EndpointsConfig {
    EndpointsConfig {
        namespaces: NamespaceFilter::allow_all(),
        ..Default::default()
    }
}

fn managed_instance(id: &str, service: &str, pod: &str, address: &str) -> AgentService {
    AgentService {
        id: id.to_string(),
        service: service.to_string(),
        address: address.to_string(),
        meta: Some(btreemap! {
            META_KEY_POD_NAME.to_string() => pod.to_string(),
            META_KEY_KUBE_SERVICE_NAME.to_string() => "web".to_string(),
            META_KEY_KUBE_NS.to_string() => "ns1".to_string(),
            META_KEY_MANAGED_BY.to_string() => MANAGED_BY_ENDPOINTS_CONTROLLER.to_string(),
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn registers_new_pod() {
    let Fixture {
        kube,
        mesh,
        reconciler,
    } = fixture(config());
    kube.add_pod("ns1", injected_pod("web-abc", "10.0.0.5", btreemap! {}));
    kube.add_endpoints(endpoints("ns1", "web", &[("web-abc", "10.0.0.5")], &[]));

    reconciler.reconcile_key("ns1", "web").await.unwrap();

    assert_eq!(
        mesh.calls(),
        vec![
            "register_service web-abc-web",
            "register_service web-abc-web-sidecar-proxy",
            "checks",
            "register_check ns1/web-abc-web/kubernetes-health-check",
            "update_ttl ns1/web-abc-web/kubernetes-health-check passing",
            "services",
        ]
    );

    let services = mesh.services_snapshot();
    let service = &services["web-abc-web"];
    assert_eq!(service.service, "web");
    assert_eq!(service.address, "10.0.0.5");
    assert_eq!(
        service.meta.as_ref().unwrap()[META_KEY_POD_NAME],
        "web-abc".to_string()
    );

    let proxy = &services["web-abc-web-sidecar-proxy"];
    assert_eq!(proxy.kind, KIND_CONNECT_PROXY);
    assert_eq!(proxy.service, "web-sidecar-proxy");
    assert_eq!(proxy.port, 20000);
    let config = proxy.proxy.as_ref().unwrap();
    assert_eq!(config.destination_service_id, "web-abc-web");
    assert_eq!(config.local_service_port, 0);

    let check = mesh.check("ns1/web-abc-web/kubernetes-health-check").unwrap();
    assert_eq!(check.status, HEALTH_PASSING);
    assert_eq!(check.output, HEALTH_PASSING_OUTPUT);
}

#[tokio::test]
async fn second_pass_writes_no_checks() {
    let Fixture {
        kube,
        mesh,
        reconciler,
    } = fixture(config());
    kube.add_pod("ns1", injected_pod("web-abc", "10.0.0.5", btreemap! {}));
    kube.add_endpoints(endpoints("ns1", "web", &[("web-abc", "10.0.0.5")], &[]));

    reconciler.reconcile_key("ns1", "web").await.unwrap();
    let before = mesh.services_snapshot();
    mesh.clear_calls();
    reconciler.reconcile_key("ns1", "web").await.unwrap();

    let calls = mesh.calls();
    assert!(
        !calls
            .iter()
            .any(|c| c.starts_with("register_check") || c.starts_with("update_ttl")),
        "{calls:?}"
    );
    assert_eq!(mesh.services_snapshot(), before);
}

#[tokio::test]
async fn not_ready_address_is_critical() {
    let Fixture {
        kube,
        mesh,
        reconciler,
    } = fixture(config());
    kube.add_pod("ns1", injected_pod("web-abc", "10.0.0.5", btreemap! {}));
    kube.add_endpoints(endpoints("ns1", "web", &[], &[("web-abc", "10.0.0.5")]));

    reconciler.reconcile_key("ns1", "web").await.unwrap();
    let check = mesh.check("ns1/web-abc-web/kubernetes-health-check").unwrap();
    assert_eq!(check.status, HEALTH_CRITICAL);
    assert_eq!(check.output, "Pod \"ns1/web-abc\" is not ready");

    // Becoming ready flips the existing check without re-registering it.
    kube.add_endpoints(endpoints("ns1", "web", &[("web-abc", "10.0.0.5")], &[]));
    mesh.clear_calls();
    reconciler.reconcile_key("ns1", "web").await.unwrap();
    let calls = mesh.calls();
    assert!(calls.contains(&"update_ttl ns1/web-abc-web/kubernetes-health-check passing".to_string()));
    assert!(!calls.iter().any(|c| c.starts_with("register_check")));
}

#[tokio::test]
async fn deregisters_removed_addresses_and_their_tokens() {
    let Fixture {
        kube,
        mesh,
        reconciler,
    } = fixture(EndpointsConfig {
        auth_method: Some("k8s-auth".to_string()),
        ..config()
    });
    kube.add_pod("ns1", injected_pod("web-abc", "10.0.0.5", btreemap! {}));
    kube.add_endpoints(endpoints("ns1", "web", &[("web-abc", "10.0.0.5")], &[]));
    mesh.add_service(managed_instance("web-old-web", "web", "web-old", "10.0.0.9"));
    mesh.add_service(managed_instance(
        "web-old-web-sidecar-proxy",
        "web-sidecar-proxy",
        "web-old",
        "10.0.0.9",
    ));
    mesh.add_token(AclToken {
        accessor_id: "tok-old".to_string(),
        description: r#"token created via login: {"pod":"ns1/web-old"}"#.to_string(),
        auth_method: "k8s-auth".to_string(),
        service_identities: Some(vec![AclServiceIdentity {
            service_name: "web".to_string(),
        }]),
    });
    mesh.add_token(AclToken {
        accessor_id: "tok-live".to_string(),
        description: r#"token created via login: {"pod":"ns1/web-abc"}"#.to_string(),
        auth_method: "k8s-auth".to_string(),
        service_identities: Some(vec![AclServiceIdentity {
            service_name: "web".to_string(),
        }]),
    });

    reconciler.reconcile_key("ns1", "web").await.unwrap();

    let ids = mesh.services_snapshot().into_keys().collect::<Vec<_>>();
    assert_eq!(ids, vec!["web-abc-web", "web-abc-web-sidecar-proxy"]);
    let tokens = mesh
        .tokens_snapshot()
        .into_iter()
        .map(|t| t.accessor_id)
        .collect::<Vec<_>>();
    assert_eq!(tokens, vec!["tok-live"]);
}

#[tokio::test]
async fn deleted_endpoints_deregister_everything() {
    let Fixture {
        mesh, reconciler, ..
    } = fixture(config());
    mesh.add_service(managed_instance("web-abc-web", "web", "web-abc", "10.0.0.5"));
    mesh.add_service(managed_instance("web-def-web", "web", "web-def", "10.0.0.6"));

    reconciler.reconcile_key("ns1", "web").await.unwrap();
    assert!(mesh.services_snapshot().is_empty());
}

#[tokio::test]
async fn ignore_label_deregisters_everything() {
    let Fixture {
        kube,
        mesh,
        reconciler,
    } = fixture(config());
    kube.add_pod("ns1", injected_pod("web-abc", "10.0.0.5", btreemap! {}));
    let mut ep = endpoints("ns1", "web", &[("web-abc", "10.0.0.5")], &[]);
    ep.metadata.labels = Some(btreemap! {
        annotations::SERVICE_IGNORE.to_string() => "true".to_string(),
    });
    kube.add_endpoints(ep);
    mesh.add_service(managed_instance("web-abc-web", "web", "web-abc", "10.0.0.5"));

    reconciler.reconcile_key("ns1", "web").await.unwrap();
    assert!(mesh.services_snapshot().is_empty());
    assert!(!mesh.calls().iter().any(|c| c.starts_with("register")));
}

#[tokio::test]
async fn ignored_namespaces_make_no_calls() {
    let Fixture {
        kube,
        mesh,
        reconciler,
    } = fixture(config());
    kube.add_pod("kube-system", injected_pod("dns", "10.0.0.2", btreemap! {}));
    kube.add_endpoints(endpoints("kube-system", "dns", &[("dns", "10.0.0.2")], &[]));

    reconciler.reconcile_key("kube-system", "dns").await.unwrap();
    assert!(mesh.calls().is_empty());
}

#[tokio::test]
async fn skips_pods_naming_another_service() {
    let Fixture {
        kube,
        mesh,
        reconciler,
    } = fixture(config());
    kube.add_pod(
        "ns1",
        injected_pod(
            "web-abc",
            "10.0.0.5",
            btreemap! { annotations::KUBERNETES_SERVICE.to_string() => "web-admin".to_string() },
        ),
    );
    kube.add_endpoints(endpoints("ns1", "web", &[("web-abc", "10.0.0.5")], &[]));
    mesh.add_service(managed_instance("web-abc-web", "web", "web-abc", "10.0.0.5"));

    reconciler.reconcile_key("ns1", "web").await.unwrap();
    assert!(mesh.services_snapshot().is_empty());
}

#[tokio::test]
async fn unmanaged_pods_only_get_health_checks() {
    let Fixture {
        kube,
        mesh,
        reconciler,
    } = fixture(config());
    let mut pod = injected_pod("legacy", "10.0.0.7", btreemap! {});
    pod.metadata.labels = None;
    kube.add_pod("ns1", pod);
    kube.add_endpoints(endpoints("ns1", "web", &[("legacy", "10.0.0.7")], &[]));

    reconciler.reconcile_key("ns1", "web").await.unwrap();
    let calls = mesh.calls();
    assert!(!calls.iter().any(|c| c.starts_with("register_service")));
    assert!(calls.contains(&"register_check ns1/legacy-web/kubernetes-health-check".to_string()));
}

#[tokio::test]
async fn multi_port_pod() {
    let Fixture {
        kube,
        mesh,
        reconciler,
    } = fixture(config());
    kube.add_pod(
        "ns1",
        injected_pod(
            "web-abc",
            "10.0.0.5",
            btreemap! {
                annotations::SERVICE.to_string() => "web,web-admin".to_string(),
                annotations::SERVICE_PORT.to_string() => "8080,9090".to_string(),
                annotations::UPSTREAMS.to_string() => "db:1234".to_string(),
            },
        ),
    );
    kube.add_endpoints(endpoints("ns1", "web", &[("web-abc", "10.0.0.5")], &[]));
    kube.add_endpoints(endpoints("ns1", "web-admin", &[("web-abc", "10.0.0.5")], &[]));

    reconciler.reconcile_key("ns1", "web").await.unwrap();
    reconciler.reconcile_key("ns1", "web-admin").await.unwrap();

    let services = mesh.services_snapshot();
    assert_eq!(services["web-abc-web"].port, 8080);
    assert_eq!(services["web-abc-web-admin"].port, 9090);

    let web = services["web-abc-web-sidecar-proxy"].proxy.clone().unwrap();
    assert_eq!(web.upstreams.len(), 1);
    assert_eq!(web.upstreams[0].destination_name, "db");
    assert_eq!(web.local_service_port, 8080);
    assert_eq!(services["web-abc-web-sidecar-proxy"].port, 20000);

    let admin = services["web-abc-web-admin-sidecar-proxy"].proxy.clone().unwrap();
    assert!(admin.upstreams.is_empty());
    assert_eq!(services["web-abc-web-admin-sidecar-proxy"].port, 20001);
}

#[tokio::test]
async fn transparent_proxy_from_namespace_label() {
    let Fixture {
        kube,
        mesh,
        reconciler,
    } = fixture(config());
    kube.add_namespace(Namespace {
        metadata: ObjectMeta {
            name: Some("ns1".to_string()),
            labels: Some(btreemap! {
                annotations::TRANSPARENT_PROXY.to_string() => "true".to_string(),
            }),
            ..Default::default()
        },
        spec: Some(NamespaceSpec::default()),
        status: None,
    });
    kube.add_service(consul_k8s_k8s_api::Service {
        metadata: ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some("ns1".to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("10.96.0.10".to_string()),
            ports: Some(vec![ServicePort {
                port: 80,
                target_port: Some(IntOrString::Int(8080)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    });
    kube.add_pod(
        "ns1",
        injected_pod(
            "web-abc",
            "10.0.0.5",
            btreemap! { annotations::SERVICE_PORT.to_string() => "8080".to_string() },
        ),
    );
    kube.add_endpoints(endpoints("ns1", "web", &[("web-abc", "10.0.0.5")], &[]));

    reconciler.reconcile_key("ns1", "web").await.unwrap();

    let services = mesh.services_snapshot();
    let expected = btreemap! {
        VIRTUAL_TAGGED_ADDRESS.to_string() => ServiceAddress {
            address: "10.96.0.10".to_string(),
            port: 80,
        },
    };
    assert_eq!(services["web-abc-web"].tagged_addresses, Some(expected.clone()));
    let proxy = &services["web-abc-web-sidecar-proxy"];
    assert_eq!(proxy.tagged_addresses, Some(expected));
    assert_eq!(proxy.proxy.as_ref().unwrap().mode, PROXY_MODE_TRANSPARENT);
}

#[tokio::test]
async fn datacenter_upstream_requires_proxy_defaults() {
    let Fixture {
        kube,
        mesh,
        reconciler,
    } = fixture(config());
    kube.add_pod(
        "ns1",
        injected_pod(
            "web-abc",
            "10.0.0.5",
            btreemap! { annotations::UPSTREAMS.to_string() => "db:1234:dc2".to_string() },
        ),
    );
    kube.add_endpoints(endpoints("ns1", "web", &[("web-abc", "10.0.0.5")], &[]));

    let err = reconciler.reconcile_key("ns1", "web").await.unwrap_err();
    assert!(err.to_string().contains("no ProxyDefaults"), "{err}");
    assert!(!mesh
        .calls()
        .iter()
        .any(|c| c.starts_with("register_service")));

    mesh.set_proxy_defaults("local");
    reconciler.reconcile_key("ns1", "web").await.unwrap();
    let proxy = mesh.services_snapshot()["web-abc-web-sidecar-proxy"].clone();
    assert_eq!(proxy.proxy.unwrap().upstreams[0].datacenter, "dc2");
}

#[tokio::test]
async fn missing_pod_is_reported_and_others_proceed() {
    let Fixture {
        kube,
        mesh,
        reconciler,
    } = fixture(config());
    kube.add_pod("ns1", injected_pod("web-abc", "10.0.0.5", btreemap! {}));
    kube.add_endpoints(endpoints(
        "ns1",
        "web",
        &[("web-gone", "10.0.0.4"), ("web-abc", "10.0.0.5")],
        &[],
    ));

    let err = reconciler.reconcile_key("ns1", "web").await.unwrap_err();
    assert!(err.to_string().contains("ns1/web-gone"), "{err}");
    assert!(mesh.services_snapshot().contains_key("web-abc-web"));
}

#[tokio::test]
async fn redirect_config_is_refined_from_registered_proxy() {
    let Fixture {
        kube,
        mesh,
        reconciler,
    } = fixture(config());
    let admitted = IptablesConfig {
        proxy_uid: "5995".to_string(),
        proxy_inbound_port: 19000,
        proxy_outbound_port: 15001,
        exclude_uids: vec!["5996".to_string()],
        ..Default::default()
    };
    kube.add_pod(
        "ns1",
        injected_pod(
            "web-abc",
            "10.0.0.5",
            btreemap! {
                REDIRECT_TRAFFIC_CONFIG.to_string() => admitted.to_json().unwrap(),
            },
        ),
    );
    kube.add_endpoints(endpoints("ns1", "web", &[("web-abc", "10.0.0.5")], &[]));

    reconciler.reconcile_key("ns1", "web").await.unwrap();

    assert!(mesh
        .calls()
        .contains(&"service web-abc-web-sidecar-proxy".to_string()));
    let pod = kube.pod_value("ns1", "web-abc").unwrap();
    let raw = pod_annotation(&pod, REDIRECT_TRAFFIC_CONFIG).unwrap();
    assert_eq!(
        IptablesConfig::from_json(raw).unwrap(),
        IptablesConfig {
            proxy_inbound_port: 20000,
            ..admitted
        }
    );

    reconciler.reconcile_key("ns1", "web").await.unwrap();
    let patches = kube
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("set_pod_annotation"))
        .count();
    assert_eq!(patches, 1);
}

#[tokio::test]
async fn unreadable_pod_keeps_its_instance() {
    let Fixture {
        kube,
        mesh,
        reconciler,
    } = fixture(config());
    kube.add_pod("ns1", injected_pod("web-a", "10.0.0.5", btreemap! {}));
    kube.add_pod("ns1", injected_pod("web-b", "10.0.0.6", btreemap! {}));
    kube.fail_pod("ns1", "web-b");
    kube.add_endpoints(endpoints(
        "ns1",
        "web",
        &[("web-a", "10.0.0.5"), ("web-b", "10.0.0.6")],
        &[],
    ));
    mesh.add_service(managed_instance("web-b-web", "web", "web-b", "10.0.0.6"));

    let err = reconciler.reconcile_key("ns1", "web").await.unwrap_err();
    assert!(matches!(err, Error::Kube(_)), "{err}");
    let services = mesh.services_snapshot();
    assert!(services.contains_key("web-a-web"));
    assert!(services.contains_key("web-b-web"));
    assert!(!mesh
        .calls()
        .contains(&"deregister_service web-b-web".to_string()));
}

#[tokio::test]
async fn missing_pod_keeps_its_instance() {
    let Fixture {
        kube,
        mesh,
        reconciler,
    } = fixture(config());
    kube.add_endpoints(endpoints("ns1", "web", &[("web-gone", "10.0.0.4")], &[]));
    mesh.add_service(managed_instance("web-gone-web", "web", "web-gone", "10.0.0.4"));

    reconciler.reconcile_key("ns1", "web").await.unwrap_err();
    assert!(mesh.services_snapshot().contains_key("web-gone-web"));
}

#[tokio::test]
async fn failed_deregistration_does_not_stop_the_pass() {
    let Fixture {
        kube,
        mesh,
        reconciler,
    } = fixture(config());
    kube.add_endpoints(endpoints("ns1", "web", &[], &[]));
    mesh.add_service(managed_instance("web-a-web", "web", "web-a", "10.0.0.7"));
    mesh.add_service(managed_instance("web-b-web", "web", "web-b", "10.0.0.8"));
    mesh.add_service(managed_instance("web-c-web", "web", "web-c", "10.0.0.9"));
    mesh.fail_call("deregister_service web-b-web");

    reconciler.reconcile_key("ns1", "web").await.unwrap_err();
    let ids = mesh.services_snapshot().into_keys().collect::<Vec<_>>();
    assert_eq!(ids, vec!["web-b-web"]);
}

#[tokio::test]
async fn tokens_are_listed_once_per_pass() {
    let Fixture {
        kube,
        mesh,
        reconciler,
    } = fixture(EndpointsConfig {
        auth_method: Some("k8s-auth".to_string()),
        ..config()
    });
    kube.add_endpoints(endpoints("ns1", "web", &[], &[]));
    for pod in ["web-a", "web-b"] {
        mesh.add_service(managed_instance(
            &format!("{pod}-web"),
            "web",
            pod,
            if pod == "web-a" { "10.0.0.7" } else { "10.0.0.8" },
        ));
        mesh.add_token(AclToken {
            accessor_id: format!("tok-{pod}"),
            description: format!(r#"token created via login: {{"pod":"ns1/{pod}"}}"#),
            auth_method: "k8s-auth".to_string(),
            service_identities: Some(vec![AclServiceIdentity {
                service_name: "web".to_string(),
            }]),
        });
    }

    reconciler.reconcile_key("ns1", "web").await.unwrap();

    let calls = mesh.calls();
    assert_eq!(calls.iter().filter(|c| *c == "tokens").count(), 1);
    assert!(calls.contains(&"delete_token tok-web-a".to_string()));
    assert!(calls.contains(&"delete_token tok-web-b".to_string()));
    assert!(mesh.tokens_snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn deleted_endpoints_are_retried_until_deregistered() {
    let Fixture {
        mesh, reconciler, ..
    } = fixture(EndpointsConfig {
        error_requeue: Duration::from_secs(1),
        ..config()
    });
    mesh.add_service(managed_instance("web-old-web", "web", "web-old", "10.0.0.9"));
    mesh.fail_call("deregister_service web-old-web");

    let recover = async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        mesh.recover();
    };
    tokio::join!(reconciler.reconcile_deleted("ns1", "web"), recover);

    // Attempts at 0s and 1s fail; the one at 3s succeeds.
    let attempts = mesh
        .calls()
        .into_iter()
        .filter(|c| c == "deregister_service web-old-web")
        .count();
    assert_eq!(attempts, 3);
    assert!(mesh.services_snapshot().is_empty());
    assert_eq!(reconciler.passes.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn passes_over_one_key_do_not_overlap() {
    let Fixture {
        kube,
        mesh,
        reconciler,
    } = fixture(config());
    kube.add_pod("ns1", injected_pod("web-abc", "10.0.0.5", btreemap! {}));
    kube.add_endpoints(endpoints("ns1", "web", &[("web-abc", "10.0.0.5")], &[]));

    let key = ("ns1".to_string(), "web".to_string());
    let lock = reconciler.passes.acquire(&key);
    let held = lock.clone().lock_owned().await;

    let blocked = tokio::time::timeout(
        Duration::from_secs(5),
        reconciler.reconcile_key("ns1", "web"),
    )
    .await;
    assert!(blocked.is_err(), "pass ran while another held the key");
    assert!(mesh.calls().is_empty());

    reconciler.reconcile_key("ns1", "other").await.unwrap();

    drop(held);
    reconciler.passes.release(&key, lock);
    reconciler.reconcile_key("ns1", "web").await.unwrap();
    assert!(mesh.services_snapshot().contains_key("web-abc-web"));
    assert_eq!(reconciler.passes.len(), 0);
}

struct StaticAgents(Vec<Agent>);

#[async_trait::async_trait]
impl AgentDirectory for StaticAgents {
    async fn agent_for(&self, _: &str) -> Result<Arc<dyn MeshClient>> {
        Ok(self.0[0].client.clone())
    }

    async fn ready_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn agent_failures_are_isolated() {
    let kube = Arc::new(FakeKube::default());
    let healthy = Arc::new(FakeMesh::default());
    let broken = Arc::new(FakeMesh::default());
    broken.fail("services");
    healthy.add_service(managed_instance("web-abc-web", "web", "web-abc", "10.0.0.5"));
    let agents = StaticAgents(vec![
        Agent {
            name: "consul-client-broken".to_string(),
            client: broken,
        },
        Agent {
            name: "consul-client-healthy".to_string(),
            client: healthy.clone(),
        },
    ]);
    let reconciler = EndpointsReconciler::new(
        kube,
        Arc::new(agents),
        config(),
        ControllerMetrics::default(),
    );

    let err = reconciler.reconcile_key("ns1", "web").await.unwrap_err();
    assert!(
        matches!(&err, Error::Agent { agent, .. } if agent == "consul-client-broken"),
        "{err}"
    );
    assert!(healthy.services_snapshot().is_empty());
}

#[test]
fn agent_node_mapping() {
    let on_node = endpoints("ns1", "web", &[("web-abc", "10.0.0.5")], &[]);
    let mut elsewhere = endpoints("ns1", "db", &[("db-abc", "10.0.0.8")], &[]);
    for subset in elsewhere.subsets.iter_mut().flatten() {
        for address in subset.addresses.iter_mut().flatten() {
            address.node_name = Some("node-b".to_string());
        }
    }
    let all = [on_node, elsewhere];

    let ready = agent_pod("consul-client-a", "node-a", "10.1.0.1", true);
    assert_eq!(
        endpoints_on_agent_node(&ready, &all),
        vec![("ns1".to_string(), "web".to_string())]
    );

    let not_ready = agent_pod("consul-client-a", "node-a", "10.1.0.1", false);
    assert!(endpoints_on_agent_node(&not_ready, &all).is_empty());
}

#[test]
fn instance_filter_quotes_values() {
    assert_eq!(
        instances_filter("web", "ns1"),
        r#"Meta["k8s-service-name"] == "web" and Meta["k8s-namespace"] == "ns1" and Meta["managed-by"] == "consul-k8s-endpoints-controller""#
    );
}
