//! In-memory `PodBackend` for tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::backend::{BackendExecOutput, BackendExecStream, PodBackend, RemoteTerminator};
use super::error::BackendError;
use super::kube::models::*;

type Key = (String, String);
type ExecHandler = Box<dyn Fn(&[String]) -> Result<BackendExecOutput, BackendError> + Send + Sync>;
type PodHook = Box<dyn Fn(&mut Pod) + Send + Sync>;

/// Pod phase a freshly created pod reports on its first read.
#[derive(Clone)]
pub struct CreatedPodState {
    pub phase: String,
    pub ready: bool,
}

#[derive(Default)]
struct State {
    pods: BTreeMap<Key, Pod>,
    namespaces: BTreeSet<String>,
    pvcs: BTreeSet<Key>,
    policies: BTreeMap<Key, NetworkPolicy>,
    service_accounts: BTreeSet<Key>,
    roles: BTreeSet<Key>,
    role_bindings: BTreeSet<Key>,
    metrics: BTreeMap<Key, PodMetrics>,
    failures: BTreeMap<&'static str, BackendError>,
    exec_calls: Vec<Vec<String>>,
    stream_calls: Vec<Vec<String>>,
    deleted_pods: Vec<String>,
    label_patches: Vec<(String, BTreeMap<String, String>)>,
    created_pods: usize,
    get_pod_calls: usize,
}

/// Scripted output for `exec_stream`.
#[derive(Clone, Default)]
pub struct StreamScript {
    pub stdout: Vec<Vec<u8>>,
    pub stderr: Vec<Vec<u8>>,
    /// `None` keeps the process "running" until terminated.
    pub status: Option<ExecStatus>,
}

pub struct MockBackend {
    state: StdMutex<State>,
    on_create: StdMutex<CreatedPodState>,
    get_pod_hook: StdMutex<Option<PodHook>>,
    exec_handler: StdMutex<Option<ExecHandler>>,
    stream_script: StdMutex<StreamScript>,
    pub terminations: Arc<AtomicUsize>,
    terminate_failure: Arc<StdMutex<Option<BackendError>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(State::default()),
            on_create: StdMutex::new(CreatedPodState {
                phase: "Running".into(),
                ready: true,
            }),
            get_pod_hook: StdMutex::new(None),
            exec_handler: StdMutex::new(None),
            stream_script: StdMutex::new(StreamScript::default()),
            terminations: Arc::new(AtomicUsize::new(0)),
            terminate_failure: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn insert_pod(&self, namespace: &str, pod: Pod) {
        let name = pod.metadata.name_or_empty().to_string();
        self.state
            .lock()
            .unwrap()
            .pods
            .insert((namespace.to_string(), name), pod);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state
            .lock()
            .unwrap()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .pods
            .keys()
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn insert_namespace(&self, name: &str) {
        self.state.lock().unwrap().namespaces.insert(name.to_string());
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state.lock().unwrap().namespaces.contains(name)
    }

    pub fn set_metrics(&self, namespace: &str, pod: &str, metrics: PodMetrics) {
        self.state
            .lock()
            .unwrap()
            .metrics
            .insert((namespace.to_string(), pod.to_string()), metrics);
    }

    /// Make every call of `op` (the trait method name) fail with `err`.
    pub fn fail(&self, op: &'static str, err: BackendError) {
        self.state.lock().unwrap().failures.insert(op, err);
    }

    /// Make streaming-exec termination fail (or succeed again with `None`).
    pub fn fail_terminate(&self, err: Option<BackendError>) {
        *self.terminate_failure.lock().unwrap() = err;
    }

    pub fn clear_failure(&self, op: &'static str) {
        self.state.lock().unwrap().failures.remove(op);
    }

    pub fn created_pods_start_as(&self, phase: &str, ready: bool) {
        *self.on_create.lock().unwrap() = CreatedPodState {
            phase: phase.to_string(),
            ready,
        };
    }

    pub fn on_get_pod(&self, hook: impl Fn(&mut Pod) + Send + Sync + 'static) {
        *self.get_pod_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn on_exec(
        &self,
        handler: impl Fn(&[String]) -> Result<BackendExecOutput, BackendError> + Send + Sync + 'static,
    ) {
        *self.exec_handler.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn script_stream(&self, script: StreamScript) {
        *self.stream_script.lock().unwrap() = script;
    }

    pub fn get_pod_calls(&self) -> usize {
        self.state.lock().unwrap().get_pod_calls
    }

    pub fn created_pods(&self) -> usize {
        self.state.lock().unwrap().created_pods
    }

    pub fn exec_calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().exec_calls.clone()
    }

    pub fn stream_calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().stream_calls.clone()
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_pods.clone()
    }

    pub fn label_patches(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.state.lock().unwrap().label_patches.clone()
    }

    pub fn policy(&self, namespace: &str, name: &str) -> Option<NetworkPolicy> {
        self.state
            .lock()
            .unwrap()
            .policies
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn policy_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .policies
            .keys()
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn pvc_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .pvcs
            .iter()
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn rbac_counts(&self) -> (usize, usize, usize) {
        let s = self.state.lock().unwrap();
        (s.service_accounts.len(), s.roles.len(), s.role_bindings.len())
    }

    fn check(&self, op: &'static str) -> Result<(), BackendError> {
        match self.state.lock().unwrap().failures.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn insert_unique(set: &mut BTreeSet<Key>, namespace: &str, name: &str) -> Result<(), BackendError> {
        if !set.insert((namespace.to_string(), name.to_string())) {
            return Err(BackendError::Conflict(format!("{name} already exists")));
        }
        Ok(())
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PodBackend for MockBackend {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, BackendError> {
        self.check("create_pod")?;
        let name = pod.metadata.name_or_empty().to_string();
        let initial = self.on_create.lock().unwrap().clone();
        let mut stored = pod.clone();
        stored.metadata.uid = Some(format!("uid-{name}"));
        stored.metadata.creation_timestamp = Some(chrono::Utc::now());
        stored.status = Some(status(&initial.phase, initial.ready));

        let mut s = self.state.lock().unwrap();
        let key = (namespace.to_string(), name.clone());
        if s.pods.contains_key(&key) {
            return Err(BackendError::Conflict(format!("pods \"{name}\" already exists")));
        }
        s.pods.insert(key, stored.clone());
        s.created_pods += 1;
        Ok(stored)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, BackendError> {
        self.state.lock().unwrap().get_pod_calls += 1;
        self.check("get_pod")?;
        let hook = self.get_pod_hook.lock().unwrap();
        let mut s = self.state.lock().unwrap();
        match s.pods.get_mut(&(namespace.to_string(), name.to_string())) {
            Some(pod) => {
                if let Some(hook) = hook.as_ref() {
                    hook(pod);
                }
                Ok(pod.clone())
            }
            None => Err(BackendError::NotFound(format!("pods \"{name}\" not found"))),
        }
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, BackendError> {
        self.check("list_pods")?;
        let wanted: Vec<(&str, &str)> = label_selector
            .split(',')
            .filter_map(|kv| kv.split_once('='))
            .collect();
        let s = self.state.lock().unwrap();
        Ok(s.pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, p)| p)
            .filter(|p| wanted.iter().all(|(k, v)| p.label(k) == Some(*v)))
            .cloned()
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), BackendError> {
        self.check("delete_pod")?;
        let mut s = self.state.lock().unwrap();
        s.deleted_pods.push(name.to_string());
        match s.pods.remove(&(namespace.to_string(), name.to_string())) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(format!("pods \"{name}\" not found"))),
        }
    }

    async fn patch_pod_metadata(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Pod, BackendError> {
        self.check("patch_pod_metadata")?;
        let mut s = self.state.lock().unwrap();
        s.label_patches.push((name.to_string(), labels.clone()));
        let pod = s
            .pods
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| BackendError::NotFound(format!("pods \"{name}\" not found")))?;
        for (k, v) in labels {
            pod.metadata.labels.insert(k.clone(), v.clone());
        }
        for (k, v) in annotations {
            pod.metadata.annotations.insert(k.clone(), v.clone());
        }
        Ok(pod.clone())
    }

    async fn exec(
        &self,
        _namespace: &str,
        _pod: &str,
        _container: &str,
        argv: &[String],
    ) -> Result<BackendExecOutput, BackendError> {
        self.state.lock().unwrap().exec_calls.push(argv.to_vec());
        self.check("exec")?;
        match self.exec_handler.lock().unwrap().as_ref() {
            Some(handler) => handler(argv),
            None => Ok(BackendExecOutput {
                status: Some(ExecStatus::success()),
                ..Default::default()
            }),
        }
    }

    async fn exec_stream(
        &self,
        _namespace: &str,
        _pod: &str,
        _container: &str,
        argv: &[String],
    ) -> Result<BackendExecStream, BackendError> {
        self.state.lock().unwrap().stream_calls.push(argv.to_vec());
        self.check("exec_stream")?;
        let script = self.stream_script.lock().unwrap().clone();

        let (stdout_tx, stdout_rx) = mpsc::channel(16);
        let (stderr_tx, stderr_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = oneshot::channel();
        for chunk in script.stdout {
            let _ = stdout_tx.try_send(chunk);
        }
        for chunk in script.stderr {
            let _ = stderr_tx.try_send(chunk);
        }
        let held = match script.status {
            Some(st) => {
                let _ = status_tx.send(st);
                None
            }
            None => Some(status_tx),
        };

        Ok(BackendExecStream {
            stdout: stdout_rx,
            stderr: stderr_rx,
            status: status_rx,
            terminator: Box::new(MockTerminator {
                calls: self.terminations.clone(),
                failure: self.terminate_failure.clone(),
                held: StdMutex::new(held.map(|tx| (tx, stdout_tx, stderr_tx))),
            }),
        })
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace, BackendError> {
        self.check("get_namespace")?;
        if self.state.lock().unwrap().namespaces.contains(name) {
            Ok(Namespace {
                metadata: ObjectMeta::named(name),
                ..Default::default()
            })
        } else {
            Err(BackendError::NotFound(format!("namespaces \"{name}\" not found")))
        }
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, BackendError> {
        self.check("create_namespace")?;
        let name = namespace.metadata.name_or_empty().to_string();
        if !self.state.lock().unwrap().namespaces.insert(name.clone()) {
            return Err(BackendError::Conflict(format!("namespaces \"{name}\" already exists")));
        }
        Ok(namespace.clone())
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<(), BackendError> {
        self.check("create_pvc")?;
        let mut s = self.state.lock().unwrap();
        Self::insert_unique(&mut s.pvcs, namespace, pvc.metadata.name_or_empty())
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), BackendError> {
        self.check("delete_pvc")?;
        if self
            .state
            .lock()
            .unwrap()
            .pvcs
            .remove(&(namespace.to_string(), name.to_string()))
        {
            Ok(())
        } else {
            Err(BackendError::NotFound(name.to_string()))
        }
    }

    async fn create_network_policy(
        &self,
        namespace: &str,
        policy: &NetworkPolicy,
    ) -> Result<(), BackendError> {
        self.check("create_network_policy")?;
        let name = policy.metadata.name_or_empty().to_string();
        let mut s = self.state.lock().unwrap();
        let key = (namespace.to_string(), name.clone());
        if s.policies.contains_key(&key) {
            return Err(BackendError::Conflict(format!("{name} already exists")));
        }
        s.policies.insert(key, policy.clone());
        Ok(())
    }

    async fn delete_network_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), BackendError> {
        self.check("delete_network_policy")?;
        match self
            .state
            .lock()
            .unwrap()
            .policies
            .remove(&(namespace.to_string(), name.to_string()))
        {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(name.to_string())),
        }
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<(), BackendError> {
        self.check("create_service_account")?;
        let mut s = self.state.lock().unwrap();
        Self::insert_unique(&mut s.service_accounts, namespace, account.metadata.name_or_empty())
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), BackendError> {
        self.check("create_role")?;
        let mut s = self.state.lock().unwrap();
        Self::insert_unique(&mut s.roles, namespace, role.metadata.name_or_empty())
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), BackendError> {
        self.check("create_role_binding")?;
        let mut s = self.state.lock().unwrap();
        Self::insert_unique(&mut s.role_bindings, namespace, binding.metadata.name_or_empty())
    }

    async fn server_version(&self) -> Result<VersionInfo, BackendError> {
        self.check("server_version")?;
        Ok(VersionInfo {
            major: "1".into(),
            minor: "31".into(),
            git_version: "v1.31.0".into(),
        })
    }

    async fn api_group_available(&self, _group_version: &str) -> Result<bool, BackendError> {
        self.check("api_group_available")?;
        Ok(true)
    }

    async fn pod_metrics(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodMetrics>, BackendError> {
        self.check("pod_metrics")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .metrics
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

type HeldStream = (
    oneshot::Sender<ExecStatus>,
    mpsc::Sender<Vec<u8>>,
    mpsc::Sender<Vec<u8>>,
);

/// Dropping the held senders is what "connection closed" looks like.
struct MockTerminator {
    calls: Arc<AtomicUsize>,
    failure: Arc<StdMutex<Option<BackendError>>>,
    held: StdMutex<Option<HeldStream>>,
}

#[async_trait]
impl RemoteTerminator for MockTerminator {
    async fn terminate(&self) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        self.held.lock().unwrap().take();
        Ok(())
    }
}

// ── Pod fixtures ────────────────────────────────────────────────────

pub fn status(phase: &str, ready: bool) -> PodStatus {
    PodStatus {
        phase: Some(phase.to_string()),
        start_time: Some(chrono::Utc::now()),
        container_statuses: vec![ContainerStatus {
            name: "agent".into(),
            ready,
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn pod_with_status(name: &str, phase: &str, ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta::named(name),
        status: Some(status(phase, ready)),
        ..Default::default()
    }
}

pub fn waiting_status(name: &str, reason: &str) -> Pod {
    let mut pod = pod_with_status(name, "Pending", false);
    if let Some(st) = pod.status.as_mut() {
        st.container_statuses[0].state = Some(ContainerState {
            waiting: Some(ContainerStateDetail {
                reason: Some(reason.to_string()),
                message: None,
            }),
            terminated: None,
        });
    }
    pod
}

/// Exec output with the given stdout and exit code.
pub fn exec_output(stdout: &str, exit_code: i32) -> BackendExecOutput {
    BackendExecOutput {
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
        exit_code: None,
        status: Some(ExecStatus::exit_code(exit_code)),
    }
}
