use std::{future::Future, time::Duration};

use anyhow::Result;
use backoff::{ExponentialBackoffBuilder, backoff::Backoff as _};

/// Runs `f` under exponential backoff for as long as it fails with an
/// apiserver conflict. Anything else fails immediately.
pub(crate) async fn on_conflict<T, Fut>(mut f: impl FnMut() -> Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let mut policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(10))
        .with_max_elapsed_time(Some(Duration::from_secs(15)))
        .build();

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if is_conflict(&e) => match policy.next_backoff() {
                Some(delay) => {
                    tracing::debug!("Conflict on lease record, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

fn is_conflict(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<kube::Error>(),
        Some(kube::Error::Api(api)) if api.code == 409 && api.reason == "Conflict"
    )
}
