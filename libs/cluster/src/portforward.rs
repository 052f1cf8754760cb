//! Supervised port-forward from the workstation to the traffic-manager pod.
//!
//! The forward is restarted whenever it breaks. A watch on the pod's name
//! cancels the current attempt the moment the pod is deleted so the
//! restart picks a fresh pod instead of timing out against a gone one.

use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, anyhow};
use backoff::{ExponentialBackoffBuilder, backoff::Backoff as _};
use futures::{StreamExt as _, TryStreamExt as _};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, runtime::watcher};
use tokio::{net::TcpListener, sync::oneshot};
use tokio_util::sync::CancellationToken;

use crate::TrafficManager;

/// How long the first forward may take to come up.
pub const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to probe for the local port to become free.
pub const PORT_FREE_TIMEOUT: Duration = Duration::from_secs(120);

/// Waits until nothing listens on `127.0.0.1:port` any more.
pub async fn wait_port_free(port: u16, deadline: Duration) -> Result<()> {
    let start = Instant::now();

    loop {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                drop(listener);
                return Ok(());
            }
            Err(_) if start.elapsed() < deadline => {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("port {port} did not become free"));
            }
        }
    }
}

/// Starts the supervised forward and returns once the first one is ready.
///
/// Supervision continues in the background until `token` is cancelled.
pub async fn start(
    client: kube::Client,
    namespace: &str,
    port: u16,
    token: CancellationToken,
) -> Result<()> {
    let (ready_tx, ready_rx) = oneshot::channel();

    tokio::spawn(supervise(
        client,
        namespace.to_owned(),
        port,
        token,
        ready_tx,
    ));

    match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(anyhow!("port forward supervisor died")),
        Err(_) => Err(anyhow!("port forward timeout")),
    }
}

async fn supervise(
    client: kube::Client,
    namespace: String,
    port: u16,
    token: CancellationToken,
    ready: oneshot::Sender<Result<()>>,
) {
    let manager = TrafficManager::new(client.clone(), &namespace);
    let pods: Api<Pod> = Api::namespaced(client, &namespace);
    let mut ready = Some(ready);

    while !token.is_cancelled() {
        let pod_name = match find_running_pod(&manager).await {
            Ok(name) => name,
            Err(e) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(e));
                    return;
                }

                tracing::error!("No running traffic manager pod: {e:#}");
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        let attempt = token.child_token();
        tokio::spawn(cancel_on_delete(
            pods.clone(),
            pod_name.clone(),
            attempt.clone(),
        ));

        let result = forward(&pods, &pod_name, port, &attempt, &mut ready).await;
        attempt.cancel();

        let Err(e) = result else {
            continue; // Normal exit, the caller cancelled or the pod went away.
        };

        if let Some(tx) = ready.take() {
            let _ = tx.send(Err(e));
            return;
        }

        // "address already in use" deserves a longer pause, somebody else
        // owns the port and releasing it takes human time.
        let message = format!("{e:#}");
        if message.contains("address already in use") || message.contains("address in use") {
            tracing::error!("port {port} already in use, needs to release it manually");
            tokio::time::sleep(Duration::from_secs(5)).await;
        } else {
            tracing::error!("port-forward occurs error: {message}, retrying");
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

/// Picks the running traffic-manager pod, with exponential backoff while
/// it is still starting up.
async fn find_running_pod(manager: &TrafficManager) -> Result<String> {
    let mut policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_multiplier(2.0)
        .with_max_elapsed_time(Some(Duration::from_secs(60)))
        .build();

    loop {
        match manager.running_pods().await {
            Ok(pods) => {
                let name = pods[0]
                    .metadata
                    .name
                    .clone()
                    .context("running pod has no name")?;

                return Ok(name);
            }
            Err(e) => match policy.next_backoff() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Err(e),
            },
        }
    }
}

/// Cancels `attempt` as soon as the named pod is deleted.
async fn cancel_on_delete(pods: Api<Pod>, name: String, attempt: CancellationToken) {
    let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
    let mut stream = watcher(pods, config).boxed();

    loop {
        let event = tokio::select! {
            _ = attempt.cancelled() => return,
            event = stream.try_next() => event,
        };

        match event {
            Ok(Some(watcher::Event::Delete(_))) => {
                tracing::info!(pod = %name, "Traffic manager pod deleted, restarting port-forward");
                attempt.cancel();
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => {
                tracing::debug!("Pod watch failed: {e}, backing off");
                tokio::select! {
                    _ = attempt.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                }
            }
        }
    }
}

/// One port-forward: a local listener whose connections are piped into the
/// pod, each over its own API-server tunnel.
async fn forward(
    pods: &Api<Pod>,
    pod_name: &str,
    port: u16,
    attempt: &CancellationToken,
    ready: &mut Option<oneshot::Sender<Result<()>>>,
) -> Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("unable to listen on any of the requested ports: {port}"))?;

    // Probe once so readiness means an actual tunnel, not just a listener.
    pods.portforward(pod_name, &[port])
        .await
        .context("Failed to establish port-forward")?;

    if let Some(tx) = ready.take() {
        let _ = tx.send(Ok(()));
    }
    tracing::info!(pod = %pod_name, %port, "Port-forward ready");

    loop {
        let (mut local, _) = tokio::select! {
            _ = attempt.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted.context("Failed to accept connection")?,
        };

        let pods = pods.clone();
        let pod_name = pod_name.to_owned();
        let attempt = attempt.clone();
        tokio::spawn(async move {
            let result = async {
                let mut pf = pods
                    .portforward(&pod_name, &[port])
                    .await
                    .context("Failed to establish port-forward")?;
                let mut upstream = pf
                    .take_stream(port)
                    .context("Port-forward has no stream for the port")?;

                tokio::select! {
                    _ = attempt.cancelled() => {}
                    _ = tokio::io::copy_bidirectional(&mut local, &mut upstream) => {}
                }

                anyhow::Ok(())
            }
            .await;

            if let Err(e) = result {
                tracing::debug!("Port-forward stream failed: {e:#}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_port_free_returns_once_the_port_is_released() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        wait_port_free(port, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn wait_port_free_times_out_while_occupied() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = wait_port_free(port, Duration::from_millis(1200)).await;
        assert!(result.is_err());
    }
}
