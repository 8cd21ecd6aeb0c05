//! WorkerPool running real child processes through ProcessDriver
//!
//! Uses `sh` as the jailed worker, so these only run on unix.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use awap_jail::{JailConfig, ProcessDriver};
use awap_pool::{JobError, PoolConfig, WorkerPool, WorkerStatus};

/// Grades every submission with its length, crashes on "boom"
const GRADER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"type":"Ping"'*) echo '{"type":"Pong","payload":{"timestamp":0}}' ;;
    *'"type":"Shutdown"'*) exit 0 ;;
    *'"submission":"boom"'*) exit 1 ;;
    *'"type":"Execute"'*)
      id=$(printf '%s' "$line" | sed 's/.*"request_id":"\([^"]*\)".*/\1/')
      printf '{"type":"Result","payload":{"request_id":"%s","output":{"feedback":"looks good"}}}\n' "$id" ;;
  esac
done
"#;

fn grader_pool(capacity: usize) -> (Arc<ProcessDriver>, WorkerPool) {
    let config = JailConfig::new("sh", vec!["-c".into(), GRADER.into()])
        .with_ping_timeout(Duration::from_secs(2))
        .with_shutdown_grace(Duration::from_secs(1));
    let driver = Arc::new(ProcessDriver::new(config));
    let pool = WorkerPool::spawn(driver.clone(), PoolConfig::new(capacity)).unwrap();
    (driver, pool)
}

#[test_log::test(tokio::test)]
async fn test_pool_grades_with_processes() {
    let (driver, pool) = grader_pool(2);
    pool.fill_to_capacity().await.unwrap();
    assert_eq!(driver.process_count(), 2);

    let tickets = submit_all(&pool, 5).await;
    for ticket in tickets {
        let output = ticket.wait().await.unwrap();
        assert_eq!(output["feedback"], "looks good");
    }

    let report = pool.health_check().await.unwrap();
    assert_eq!(report.unhealthy().count(), 0);
    assert_eq!(report.worker_count, 2);

    pool.shutdown().await.unwrap();
    assert_eq!(driver.process_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_crashed_process_is_replaced() {
    let (driver, pool) = grader_pool(1);
    let first = pool.start_worker().await.unwrap();

    let err = pool
        .execute(json!({"submission": "boom"}))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Driver(e) if e.is_worker_fatal()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let workers = pool.list_workers().await.unwrap();
        if workers.len() == 1 && workers[0].id != first && workers[0].status == WorkerStatus::Ready
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no replacement");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let output = pool.execute(json!({"submission": "ok"})).await.unwrap();
    assert_eq!(output["feedback"], "looks good");

    pool.shutdown().await.unwrap();
    assert_eq!(driver.process_count(), 0);
}

async fn submit_all(pool: &WorkerPool, n: usize) -> Vec<awap_pool::JobTicket> {
    let mut tickets = Vec::with_capacity(n);
    for i in 0..n {
        tickets.push(
            pool.submit(json!({ "submission": format!("answer {i}") }))
                .await
                .unwrap(),
        );
    }
    tickets
}
