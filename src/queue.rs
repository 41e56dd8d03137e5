use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::error::ScanError;
use crate::models::ScanJob;

/// Work queue of scan jobs with at-least-once delivery.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Wait up to `timeout` for the next job.
    async fn pop(&self, timeout: Duration) -> Result<Option<ScanJob>, ScanError>;

    async fn push(&self, job: &ScanJob) -> Result<(), ScanError>;

    async fn pending_jobs(&self) -> Result<u64, ScanError>;
}

/// Redis list consumed with `BRPOP` and fed with `LPUSH`. The connection
/// manager reconnects after a dropped socket, so a failed poll is retried on
/// a fresh connection.
pub struct RedisQueue {
    conn: ConnectionManager,
    key: String,
}

impl RedisQueue {
    pub async fn connect(url: &str, key: &str) -> Result<Self, ScanError> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(queue = key, "connected to job queue");
        Ok(Self {
            conn,
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn pop(&self, timeout: Duration) -> Result<Option<ScanJob>, ScanError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&self.key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        match popped {
            Some((_, payload)) => Ok(Some(decode_job(&payload)?)),
            None => Ok(None),
        }
    }

    async fn push(&self, job: &ScanJob) -> Result<(), ScanError> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.key)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pending_jobs(&self) -> Result<u64, ScanError> {
        let mut conn = self.conn.clone();
        let len: u64 = redis::cmd("LLEN")
            .arg(&self.key)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }
}

pub fn decode_job(payload: &str) -> Result<ScanJob, ScanError> {
    let job: ScanJob = serde_json::from_str(payload)?;
    if job.file_path.trim().is_empty() {
        return Err(ScanError::Queue(format!("job {} has no file_path", job.id)));
    }
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::TcpListener;

    async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<String>> {
        let mut line = String::new();
        reader.read_line(&mut line).await.ok()?;
        let count: usize = line.trim().strip_prefix('*')?.parse().ok()?;

        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            line.clear();
            reader.read_line(&mut line).await.ok()?;
            line.clear();
            reader.read_line(&mut line).await.ok()?;
            parts.push(line.trim_end().to_string());
        }
        Some(parts)
    }

    fn bulk(value: &str) -> String {
        format!("${}\r\n{value}\r\n", value.len())
    }

    /// Minimal RESP server: the first connection is dropped as soon as it
    /// issues BRPOP, later connections are served one job.
    async fn flaky_redis(connections: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let nth = connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut reader = BufReader::new(read);
                    while let Some(command) = read_command(&mut reader).await {
                        let name = command.first().map(|c| c.to_ascii_uppercase());
                        let reply = match name.as_deref() {
                            Some("PING") => "+PONG\r\n".to_string(),
                            Some("BRPOP") if nth == 0 => return,
                            Some("BRPOP") => format!(
                                "*2\r\n{}{}",
                                bulk("scan_jobs"),
                                bulk(r#"{"id":"j-9","file_path":"/media/after.srt"}"#)
                            ),
                            _ => "+OK\r\n".to_string(),
                        };
                        if write.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        format!("redis://{addr}")
    }

    #[tokio::test]
    async fn poll_recovers_after_connection_drop() {
        let connections = Arc::new(AtomicUsize::new(0));
        let url = flaky_redis(connections.clone()).await;
        let queue = RedisQueue::connect(&url, "scan_jobs").await.unwrap();

        let mut recovered = None;
        for _ in 0..20 {
            match queue.pop(Duration::from_secs(1)).await {
                Ok(job) => {
                    recovered = job;
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }

        let job = recovered.expect("queue never recovered after the connection dropped");
        assert_eq!(job.file_path, "/media/after.srt");
        assert!(connections.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn decodes_full_payload() {
        let job = decode_job(
            r#"{"id":"j-1","file_path":"/media/a.mkv","file_type":"mkv","priority":2,"created_at":"2026-01-05T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(job.file_type.as_deref(), Some("mkv"));
        assert_eq!(job.priority, 2);
        assert!(job.created_at.is_some());
    }

    #[test]
    fn rejects_bad_payloads() {
        assert!(matches!(decode_job("not json"), Err(ScanError::Payload(_))));
        assert!(matches!(
            decode_job(r#"{"id":"j-2","file_path":"  "}"#),
            Err(ScanError::Queue(_))
        ));
    }
}
