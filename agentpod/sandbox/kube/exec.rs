//! Pod exec over the API server's websocket channel protocol.
//!
//! Protocol (`v4.channel.k8s.io`):
//!   - Every binary frame starts with a one-byte channel id.
//!   - 1 = stdout, 2 = stderr, 3 = status (a JSON `Status` object sent once
//!     when the process exits).
//!   - The server closes the socket after the status frame.
//!
//! Closing the socket from our side tears the exec session down, which is
//! how a streaming exec is terminated.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::sandbox::backend::{BackendExecOutput, BackendExecStream, RemoteTerminator};
use crate::sandbox::error::BackendError;

use super::client::KubeClient;
use super::models::ExecStatus;

const CHANNEL_STDOUT: u8 = 1;
const CHANNEL_STDERR: u8 = 2;
const CHANNEL_STATUS: u8 = 3;

const EXEC_SUBPROTOCOL: &str = "v4.channel.k8s.io";
const STREAM_BUFFER: usize = 64;

type ExecSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Build the `wss://…/exec?…` URL for a command.
pub(super) fn exec_url(
    base_url: &str,
    namespace: &str,
    pod: &str,
    container: &str,
    argv: &[String],
) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    };

    let mut url = format!(
        "{ws_base}/api/v1/namespaces/{namespace}/pods/{pod}/exec?container={}&stdout=true&stderr=true",
        utf8_percent_encode(container, NON_ALPHANUMERIC)
    );
    for arg in argv {
        url.push_str("&command=");
        url.push_str(&utf8_percent_encode(arg, NON_ALPHANUMERIC).to_string());
    }
    url
}

/// Split a frame into (channel, payload).
pub(super) fn parse_frame(data: &[u8]) -> Option<(u8, &[u8])> {
    data.split_first().map(|(ch, rest)| (*ch, rest))
}

fn parse_status(payload: &[u8]) -> ExecStatus {
    serde_json::from_slice(payload).unwrap_or_else(|_| ExecStatus {
        status: Some("Failure".into()),
        message: Some(String::from_utf8_lossy(payload).into_owned()),
        ..Default::default()
    })
}

async fn connect(
    client: &KubeClient,
    namespace: &str,
    pod: &str,
    container: &str,
    argv: &[String],
) -> Result<ExecSocket, BackendError> {
    let url = exec_url(client.base_url(), namespace, pod, container, argv);
    let mut request = url
        .into_client_request()
        .map_err(|e| BackendError::Invalid(format!("bad exec URL: {e}")))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(EXEC_SUBPROTOCOL));
    if let Some(token) = client.token() {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| BackendError::Invalid(format!("bad bearer token: {e}")))?;
        request.headers_mut().insert("Authorization", value);
    }

    let (ws, _resp) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(map_ws_error)?;
    Ok(ws)
}

fn map_ws_error(e: tokio_tungstenite::tungstenite::Error) -> BackendError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match e {
        WsError::Http(resp) => {
            let status = resp.status().as_u16();
            let body = resp
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            BackendError::from_response(status, &body)
        }
        WsError::Io(e) => BackendError::Unavailable(format!("exec connect: {e}")),
        other => BackendError::Transport(format!("exec websocket: {other}")),
    }
}

/// Run a command and collect all of its output.
pub(super) async fn run_to_completion(
    client: &KubeClient,
    namespace: &str,
    pod: &str,
    container: &str,
    argv: &[String],
) -> Result<BackendExecOutput, BackendError> {
    let mut ws = connect(client, namespace, pod, container, argv).await?;
    let mut out = BackendExecOutput::default();

    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Binary(data)) => match parse_frame(&data) {
                Some((CHANNEL_STDOUT, payload)) => out.stdout.extend_from_slice(payload),
                Some((CHANNEL_STDERR, payload)) => out.stderr.extend_from_slice(payload),
                Some((CHANNEL_STATUS, payload)) => out.status = Some(parse_status(payload)),
                _ => {}
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                // The server may drop the TCP stream right after the status
                // frame; once we have a status the output is complete.
                if out.status.is_some() {
                    break;
                }
                return Err(BackendError::Transport(format!("exec stream: {e}")));
            }
        }
    }

    if out.status.is_none() {
        return Err(BackendError::Transport(
            "exec stream closed before the status frame".into(),
        ));
    }
    Ok(out)
}

/// Start a command and forward its output through channels.
pub(super) async fn start_stream(
    client: &KubeClient,
    namespace: &str,
    pod: &str,
    container: &str,
    argv: &[String],
) -> Result<BackendExecStream, BackendError> {
    let mut ws = connect(client, namespace, pod, container, argv).await?;

    let (stdout_tx, stdout_rx) = mpsc::channel(STREAM_BUFFER);
    let (stderr_tx, stderr_rx) = mpsc::channel(STREAM_BUFFER);
    let (status_tx, status_rx) = oneshot::channel();
    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
    let pod_name = pod.to_string();

    tokio::spawn(async move {
        let mut status_tx = Some(status_tx);
        loop {
            tokio::select! {
                Ok(()) = &mut kill_rx => {
                    tracing::debug!(pod = %pod_name, "closing exec stream on request");
                    let _ = ws.send(Message::Close(None)).await;
                    break;
                }
                msg = ws.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        forward_frame(&data, &stdout_tx, &stderr_tx, &mut status_tx, &pod_name);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        if status_tx.is_some() {
                            tracing::warn!(pod = %pod_name, error = %e, "exec stream dropped");
                        }
                        break;
                    }
                },
            }
        }
    });

    Ok(BackendExecStream {
        stdout: stdout_rx,
        stderr: stderr_rx,
        status: status_rx,
        terminator: Box::new(SocketTerminator {
            kill_tx: Mutex::new(Some(kill_tx)),
        }),
    })
}

/// Route one frame to its channel. Never waits on a reader: output that
/// does not fit in the buffer is dropped so the status frame behind it is
/// always read.
fn forward_frame(
    data: &[u8],
    stdout_tx: &mpsc::Sender<Vec<u8>>,
    stderr_tx: &mpsc::Sender<Vec<u8>>,
    status_tx: &mut Option<oneshot::Sender<ExecStatus>>,
    pod: &str,
) {
    let (tx, payload) = match parse_frame(data) {
        Some((CHANNEL_STDOUT, payload)) => (stdout_tx, payload),
        Some((CHANNEL_STDERR, payload)) => (stderr_tx, payload),
        Some((CHANNEL_STATUS, payload)) => {
            if let Some(tx) = status_tx.take() {
                let _ = tx.send(parse_status(payload));
            }
            return;
        }
        _ => return,
    };
    if let Err(mpsc::error::TrySendError::Full(chunk)) = tx.try_send(payload.to_vec()) {
        tracing::debug!(pod = %pod, bytes = chunk.len(), "exec output buffer full, dropping chunk");
    }
}

struct SocketTerminator {
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl RemoteTerminator for SocketTerminator {
    async fn terminate(&self) -> Result<(), BackendError> {
        if let Some(tx) = self.kill_tx.lock().await.take() {
            // The reader task may already be gone; that is fine.
            let _ = tx.send(());
        }
        Ok(())
    }
}
