// Batch grading loop
//
// One JSON job per input line, one JSON outcome per output line. Outcomes are
// written as jobs finish, which is not necessarily input order.

use anyhow::{Context, Result};
use awap_pool::{JobError, JobResult, WorkerPool};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// One line of input
#[derive(Debug, Deserialize)]
pub struct JobRequest {
    /// Caller-chosen id echoed in the outcome; defaults to `line-<n>`
    #[serde(default)]
    pub job_id: Option<String>,
    pub payload: Value,
}

/// Terminal state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
}

/// One line of output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn from_result(job_id: String, result: std::result::Result<JobResult, JobError>) -> Self {
        match result {
            Ok(output) => Self {
                job_id,
                status: JobStatus::Completed,
                output: Some(output),
                error: None,
            },
            Err(e) => Self::failed(job_id, e.to_string()),
        }
    }

    pub fn failed(job_id: String, error: String) -> Self {
        Self {
            job_id,
            status: JobStatus::Failed,
            output: None,
            error: Some(error),
        }
    }
}

/// Counts of finished jobs
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub completed: usize,
    pub failed: usize,
}

impl BatchSummary {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome.status {
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}

/// Parse one input line into a job
pub fn parse_job(line: &str, line_no: usize) -> std::result::Result<(String, Value), JobOutcome> {
    let fallback_id = format!("line-{line_no}");
    match serde_json::from_str::<JobRequest>(line) {
        Ok(request) => Ok((request.job_id.unwrap_or(fallback_id), request.payload)),
        Err(e) => Err(JobOutcome::failed(fallback_id, format!("invalid job: {e}"))),
    }
}

/// Feed every job from `input` to the pool and write outcomes to `output`
///
/// Returns once input is exhausted and every submitted job has finished.
pub async fn run_batch<R, W>(pool: &WorkerPool, input: R, mut output: W) -> Result<BatchSummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut pending = JoinSet::new();
    let mut summary = BatchSummary::default();
    let mut line_no = 0usize;
    let mut input_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => {
                let Some(line) = line.context("Failed to read job input")? else {
                    debug!(jobs = line_no, "Job input exhausted");
                    input_open = false;
                    continue;
                };
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }

                match parse_job(&line, line_no) {
                    Ok((job_id, payload)) => {
                        let ticket = pool
                            .submit(payload)
                            .await
                            .context("Worker pool stopped accepting jobs")?;
                        debug!(%job_id, pool_job_id = %ticket.id(), "Job submitted");
                        pending.spawn(async move {
                            let result = ticket.wait().await;
                            JobOutcome::from_result(job_id, result)
                        });
                    }
                    Err(outcome) => {
                        warn!(line = line_no, error = ?outcome.error, "Skipping malformed job");
                        write_outcome(&mut output, &outcome, &mut summary).await?;
                    }
                }
            }
            Some(joined) = pending.join_next() => {
                let outcome = joined.context("Job task failed")?;
                write_outcome(&mut output, &outcome, &mut summary).await?;
            }
            else => break,
        }
    }

    output.flush().await.context("Failed to flush output")?;
    info!(
        completed = summary.completed,
        failed = summary.failed,
        "Batch finished"
    );
    Ok(summary)
}

async fn write_outcome<W>(
    output: &mut W,
    outcome: &JobOutcome,
    summary: &mut BatchSummary,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    summary.record(outcome);
    if outcome.status == JobStatus::Failed {
        warn!(job_id = %outcome.job_id, error = ?outcome.error, "Job failed");
    }

    let mut line = serde_json::to_string(outcome).context("Failed to encode outcome")?;
    line.push('\n');
    output
        .write_all(line.as_bytes())
        .await
        .context("Failed to write outcome")?;
    output.flush().await.context("Failed to flush output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use awap_pool::{InMemoryDriver, PoolConfig};
    use serde_json::json;

    #[test]
    fn test_parse_job() {
        let (id, payload) =
            parse_job(r#"{"job_id": "sub-42", "payload": {"code": "x = 1"}}"#, 1).unwrap();
        assert_eq!(id, "sub-42");
        assert_eq!(payload["code"], "x = 1");

        let (id, _) = parse_job(r#"{"payload": {}}"#, 7).unwrap();
        assert_eq!(id, "line-7");

        let outcome = parse_job("not json", 3).unwrap_err();
        assert_eq!(outcome.job_id, "line-3");
        assert_eq!(outcome.status, JobStatus::Failed);
    }

    #[test]
    fn test_outcome_wire_format() {
        let done = JobOutcome::from_result("a".into(), Ok(json!({"grade": "B"})));
        assert_eq!(
            serde_json::to_value(&done).unwrap(),
            json!({"job_id": "a", "status": "completed", "output": {"grade": "B"}})
        );

        let failed = JobOutcome::from_result("b".into(), Err(JobError::Cancelled));
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({"job_id": "b", "status": "failed", "error": "job was cancelled"})
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_run_batch() {
        let driver = Arc::new(InMemoryDriver::new());
        let pool = WorkerPool::spawn(driver, PoolConfig::new(2)).unwrap();
        pool.fill_to_capacity().await.unwrap();

        let input = concat!(
            r#"{"job_id": "one", "payload": {"n": 1}}"#,
            "\n\n",
            r#"{"job_id": "two", "payload": {"fail": "no rubric"}}"#,
            "\n",
            "garbage\n",
            r#"{"payload": {"n": 3}}"#,
            "\n",
        );
        let mut output = Vec::new();
        let summary = run_batch(&pool, input.as_bytes(), &mut output)
            .await
            .unwrap();

        assert_eq!(
            summary,
            BatchSummary {
                completed: 2,
                failed: 2
            }
        );

        let mut outcomes: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        outcomes.sort_by_key(|o| o["job_id"].as_str().unwrap_or_default().to_string());

        let ids: Vec<_> = outcomes.iter().map(|o| o["job_id"].clone()).collect();
        assert_eq!(ids, vec![json!("line-4"), json!("line-5"), json!("one"), json!("two")]);
        assert_eq!(outcomes[0]["status"], "failed");
        assert_eq!(outcomes[1]["output"]["input"]["n"], 3);
        assert_eq!(outcomes[3]["status"], "failed");

        pool.shutdown().await.unwrap();
    }
}
