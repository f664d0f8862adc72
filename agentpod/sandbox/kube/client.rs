//! HTTP client for the Kubernetes API server.
//!
//! Talks plain REST over reqwest for object CRUD and hands exec off to the
//! websocket channel in [`super::exec`]. All failures are mapped through
//! `BackendError::from_response` before leaving this module.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::sandbox::backend::{BackendExecOutput, BackendExecStream, PodBackend};
use crate::sandbox::error::BackendError;
use crate::sandbox::types::KubeConfig;

use super::exec;
use super::models::*;

/// REST client for the Kubernetes API.
#[derive(Debug, Clone)]
pub struct KubeClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl KubeClient {
    pub fn new(config: &KubeConfig) -> Result<Self, BackendError> {
        let base_url = config.api_url.trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| BackendError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url,
            token: config.token.clone().filter(|t| !t.is_empty()),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(super) fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let rb = self.client.request(method, self.url(path));
        match &self.token {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }

    async fn send(&self, rb: reqwest::RequestBuilder) -> Result<reqwest::Response, BackendError> {
        let resp = rb.send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::from_response(status, &body));
        }
        Ok(resp)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        let resp = self.send(self.request(reqwest::Method::GET, path)).await?;
        resp.json::<T>()
            .await
            .map_err(|e| BackendError::Decode(format!("GET {path}: {e}")))
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, BackendError> {
        let resp = self
            .send(self.request(reqwest::Method::POST, path).json(body))
            .await?;
        resp.json::<T>()
            .await
            .map_err(|e| BackendError::Decode(format!("POST {path}: {e}")))
    }

    async fn post_discard<B: Serialize>(&self, path: &str, body: &B) -> Result<(), BackendError> {
        self.send(self.request(reqwest::Method::POST, path).json(body))
            .await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), BackendError> {
        self.send(self.request(reqwest::Method::DELETE, path)).await?;
        Ok(())
    }
}

fn pods_path(namespace: &str) -> String {
    format!("/api/v1/namespaces/{namespace}/pods")
}

#[async_trait]
impl PodBackend for KubeClient {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, BackendError> {
        tracing::debug!(
            namespace = %namespace,
            pod = %pod.metadata.name_or_empty(),
            "creating pod"
        );
        self.post_json(&pods_path(namespace), pod).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, BackendError> {
        self.get_json(&format!("{}/{name}", pods_path(namespace)))
            .await
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, BackendError> {
        let rb = self
            .request(reqwest::Method::GET, &pods_path(namespace))
            .query(&[("labelSelector", label_selector)]);
        let resp = self.send(rb).await?;
        let list = resp
            .json::<ObjectList<Pod>>()
            .await
            .map_err(|e| BackendError::Decode(format!("pod list: {e}")))?;
        Ok(list.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), BackendError> {
        tracing::debug!(namespace = %namespace, pod = %name, "deleting pod");
        self.delete(&format!("{}/{name}", pods_path(namespace)))
            .await
    }

    async fn patch_pod_metadata(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Pod, BackendError> {
        let body = serde_json::json!({
            "metadata": { "labels": labels, "annotations": annotations }
        });
        let rb = self
            .request(
                reqwest::Method::PATCH,
                &format!("{}/{name}", pods_path(namespace)),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
            .body(body.to_string());
        let resp = self.send(rb).await?;
        resp.json::<Pod>()
            .await
            .map_err(|e| BackendError::Decode(format!("patched pod: {e}")))
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
    ) -> Result<BackendExecOutput, BackendError> {
        exec::run_to_completion(self, namespace, pod, container, argv).await
    }

    async fn exec_stream(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
    ) -> Result<BackendExecStream, BackendError> {
        exec::start_stream(self, namespace, pod, container, argv).await
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace, BackendError> {
        self.get_json(&format!("/api/v1/namespaces/{name}")).await
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, BackendError> {
        self.post_json("/api/v1/namespaces", namespace).await
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<(), BackendError> {
        self.post_discard(
            &format!("/api/v1/namespaces/{namespace}/persistentvolumeclaims"),
            pvc,
        )
        .await
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), BackendError> {
        self.delete(&format!(
            "/api/v1/namespaces/{namespace}/persistentvolumeclaims/{name}"
        ))
        .await
    }

    async fn create_network_policy(
        &self,
        namespace: &str,
        policy: &NetworkPolicy,
    ) -> Result<(), BackendError> {
        self.post_discard(
            &format!("/apis/networking.k8s.io/v1/namespaces/{namespace}/networkpolicies"),
            policy,
        )
        .await
    }

    async fn delete_network_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), BackendError> {
        self.delete(&format!(
            "/apis/networking.k8s.io/v1/namespaces/{namespace}/networkpolicies/{name}"
        ))
        .await
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<(), BackendError> {
        self.post_discard(
            &format!("/api/v1/namespaces/{namespace}/serviceaccounts"),
            account,
        )
        .await
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), BackendError> {
        self.post_discard(
            &format!("/apis/rbac.authorization.k8s.io/v1/namespaces/{namespace}/roles"),
            role,
        )
        .await
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), BackendError> {
        self.post_discard(
            &format!("/apis/rbac.authorization.k8s.io/v1/namespaces/{namespace}/rolebindings"),
            binding,
        )
        .await
    }

    async fn server_version(&self) -> Result<VersionInfo, BackendError> {
        self.get_json("/version").await
    }

    async fn api_group_available(&self, group_version: &str) -> Result<bool, BackendError> {
        let path = if group_version == "v1" {
            "/api/v1".to_string()
        } else {
            format!("/apis/{group_version}")
        };
        match self.send(self.request(reqwest::Method::GET, &path)).await {
            Ok(_) => Ok(true),
            Err(BackendError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn pod_metrics(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodMetrics>, BackendError> {
        let path = format!("/apis/metrics.k8s.io/v1beta1/namespaces/{namespace}/pods/{name}");
        match self.get_json::<PodMetrics>(&path).await {
            Ok(m) => Ok(Some(m)),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> KubeClient {
        KubeClient::new(&KubeConfig {
            api_url: url.into(),
            token: Some("tok".into()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn client_trims_trailing_slash() {
        let c = client("https://10.0.0.1:6443/");
        assert_eq!(c.base_url(), "https://10.0.0.1:6443");
        assert_eq!(c.url("/version"), "https://10.0.0.1:6443/version");
    }

    #[test]
    fn empty_token_is_treated_as_none() {
        let c = KubeClient::new(&KubeConfig {
            token: Some(String::new()),
            ..Default::default()
        })
        .unwrap();
        assert!(c.token().is_none());
    }

    #[test]
    fn pods_path_format() {
        assert_eq!(pods_path("sbx"), "/api/v1/namespaces/sbx/pods");
    }

    #[tokio::test]
    async fn unreachable_server_maps_to_backend_error() {
        // Port 9 (discard) on localhost is essentially never listening.
        let c = client("http://127.0.0.1:9");
        let err = c.server_version().await.unwrap_err();
        assert!(matches!(
            err,
            BackendError::Unavailable(_) | BackendError::Transport(_)
        ));
    }
}
