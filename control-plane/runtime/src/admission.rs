use crate::{
    core::{
        annotations::{self, REDIRECT_TRAFFIC_CONFIG, TPROXY_STATUS, TPROXY_STATUS_ENABLED},
        iptables::IptablesConfigBuilder,
    },
    k8s::{Api, Client, Namespace, Pod},
};
use anyhow::{Context, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::DynamicObject;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// The path the mutating webhook is registered under.
pub const MUTATE_PODS_PATH: &str = "/mutate-pods";

/// Annotates transparent-proxied pods with their traffic redirection config.
#[derive(Clone)]
pub struct Admission {
    client: Option<Client>,
    builder: Arc<IptablesConfigBuilder>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<Pod>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<Pod>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != MUTATE_PODS_PATH {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req).await
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new(client: Client, builder: IptablesConfigBuilder) -> Self {
        Self {
            client: Some(client),
            builder: Arc::new(builder),
        }
    }

    async fn admit(self, req: AdmissionRequest) -> AdmissionResponse {
        let Some(pod) = req.object.as_ref() else {
            return AdmissionResponse::from(&req);
        };
        let namespace = self.namespace(req.namespace.as_deref()).await;

        let patch = match redirect_patch(&self.builder, pod, namespace.as_ref(), |name| {
            std::env::var(name).ok()
        }) {
            Ok(Some(patch)) => patch,
            Ok(None) => return AdmissionResponse::from(&req),
            Err(error) => {
                // Fail open.
                warn!(%error, "Failed to build traffic redirection config");
                let mut rsp = AdmissionResponse::from(&req);
                rsp.warnings = Some(vec![format!(
                    "{REDIRECT_TRAFFIC_CONFIG} not set: {error:#}"
                )]);
                return rsp;
            }
        };

        info!(
            namespace = req.namespace.as_deref().unwrap_or_default(),
            name = %req.name,
            "Annotating pod with traffic redirection config"
        );
        match AdmissionResponse::from(&req).with_patch(patch) {
            Ok(rsp) => rsp,
            Err(error) => {
                warn!(%error, "Failed to serialize patch");
                AdmissionResponse::from(&req)
            }
        }
    }

    async fn namespace(&self, name: Option<&str>) -> Option<Namespace> {
        let (client, name) = (self.client.as_ref()?, name?);
        match Api::<Namespace>::all(client.clone()).get_opt(name).await {
            Ok(ns) => ns,
            Err(error) => {
                warn!(%error, namespace = %name, "Failed to get namespace; using pod annotations only");
                None
            }
        }
    }
}

/// The patch adding the redirect annotation, and marking the pod for the CNI plugin, or `None`
/// when the pod needs no redirection or already carries it.
fn redirect_patch(
    builder: &IptablesConfigBuilder,
    pod: &Pod,
    namespace: Option<&Namespace>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Option<json_patch::Patch>> {
    if !annotations::has_been_injected(pod)
        || annotations::pod_annotation(pod, REDIRECT_TRAFFIC_CONFIG).is_some()
    {
        return Ok(None);
    }
    if !annotations::transparent_proxy_enabled(pod, namespace, builder.enable_transparent_proxy)? {
        return Ok(None);
    }

    let config = builder
        .build(pod, namespace, env)?
        .to_json()
        .context("failed to encode traffic redirection config")?;

    let status = annotations::pod_annotation(pod, TPROXY_STATUS)
        .is_none()
        .then_some(TPROXY_STATUS_ENABLED);
    // Injected pods always carry annotations, so each key is added individually.
    let ops = std::iter::once((REDIRECT_TRAFFIC_CONFIG, config))
        .chain(status.map(|s| (TPROXY_STATUS, s.to_string())))
        .map(|(key, value)| {
            json!({
                "op": "add",
                "path": format!("/metadata/annotations/{}", escape_pointer(key)),
                "value": value,
            })
        })
        .collect();
    let patch = serde_json::from_value(serde_json::Value::Array(ops))?;
    Ok(Some(patch))
}

/// Escapes a JSON pointer reference token.
fn escape_pointer(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}
