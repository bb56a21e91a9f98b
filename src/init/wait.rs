// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tower::BoxError;
use tracing::error;

pub type TaskSet = JoinSet<Result<(), BoxError>>;

/// Wait for the first task of `tasks` to end. An empty set never completes,
/// so it can sit in a `select!` next to sets that do have tasks.
pub async fn wait_for_any_task(tasks: &mut TaskSet) -> Result<(), BoxError> {
    match tasks.join_next().await {
        None => std::future::pending().await,
        Some(res) => res?,
    }
}

pub async fn wait_for_tasks_with_timeout(
    tasks: &mut TaskSet,
    timeout: Duration,
) -> Result<(), BoxError> {
    wait_for_tasks_with_deadline(tasks, Instant::now() + timeout).await
}

/// Wait for every task; the last task error wins.
pub async fn wait_for_tasks_with_deadline(
    tasks: &mut TaskSet,
    stop_at: Instant,
) -> Result<(), BoxError> {
    let mut result = Ok(());
    loop {
        match timeout_at(stop_at, tasks.join_next()).await {
            Err(_) => {
                tasks.abort_all();
                result = Err("timed out waiting for tasks to complete".into());
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(Ok(())))) => {}
            Ok(Some(Ok(Err(e)))) => result = Err(e),
            Ok(Some(Err(e))) => error!(error = %e, "Failed to join task"),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_error_is_returned() {
        let mut tasks = TaskSet::new();
        tasks.spawn(async { Err::<(), BoxError>("boom".into()) });
        let err = wait_for_any_task(&mut tasks).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let mut tasks = TaskSet::new();
        tasks.spawn(async { Ok(()) });
        assert!(
            wait_for_tasks_with_timeout(&mut tasks, Duration::from_secs(1))
                .await
                .is_ok()
        );

        tasks.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        assert!(
            wait_for_tasks_with_timeout(&mut tasks, Duration::from_secs(1))
                .await
                .is_err()
        );
    }
}
