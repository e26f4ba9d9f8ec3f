//! Background worker for access logs and notice delivery
//!
//! A bounded queue with a single consumer. Producers never wait: when the
//! queue is full the job is dropped with a warning.

use bytes::Bytes;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use errors::HeraldResult;

use crate::broker::{Broker, MESSAGE_QUEUE};

/// One `sys_log` row
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub username: Option<String>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: i64,
    pub ip: String,
    pub create_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeTarget {
    All,
    Users(Vec<String>),
}

/// Payload pushed to clients for a published notice
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoticeMessage {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub publisher: String,
    pub publish_time: i64,
}

#[derive(Debug, Clone)]
pub struct NoticeDelivery {
    pub notice: NoticeMessage,
    pub target: NoticeTarget,
}

#[derive(Debug, Clone)]
pub enum Job {
    AccessLog(AccessLogEntry),
    DeliverNotice(NoticeDelivery),
}

impl Job {
    fn kind(&self) -> &'static str {
        match self {
            Self::AccessLog(_) => "access-log",
            Self::DeliverNotice(_) => "deliver-notice",
        }
    }
}

/// Producer side, cheap to clone
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<Job>,
}

impl WorkerHandle {
    /// Enqueue without waiting; false if the job was dropped
    pub fn submit(&self, job: Job) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                warn!(job = job.kind(), "Worker queue full, job dropped");
                false
            },
            Err(TrySendError::Closed(job)) => {
                warn!(job = job.kind(), "Worker stopped, job dropped");
                false
            },
        }
    }
}

/// Consumer side, handed to [`BackgroundWorker::spawn`]
pub struct BackgroundWorker {
    rx: mpsc::Receiver<Job>,
}

impl BackgroundWorker {
    pub fn channel(capacity: usize) -> (WorkerHandle, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (WorkerHandle { tx }, Self { rx })
    }

    /// Consume jobs until `shutdown` fires or every handle is dropped
    pub fn spawn(
        mut self,
        pool: SqlitePool,
        broker: Arc<Broker>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Background worker started");
            loop {
                let job = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    job = self.rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                let kind = job.kind();
                if let Err(e) = process(&pool, &broker, job).await {
                    warn!(job = kind, "Background job failed: {}", e);
                }
            }
            info!("Background worker stopped");
        })
    }
}

async fn process(pool: &SqlitePool, broker: &Broker, job: Job) -> HeraldResult<()> {
    match job {
        Job::AccessLog(entry) => write_access_log(pool, &entry).await,
        Job::DeliverNotice(delivery) => deliver_notice(broker, delivery).await,
    }
}

async fn write_access_log(pool: &SqlitePool, entry: &AccessLogEntry) -> HeraldResult<()> {
    sqlx::query(
        "INSERT INTO sys_log (username, method, path, status, duration_ms, ip, create_time) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.username.as_deref())
    .bind(&entry.method)
    .bind(&entry.path)
    .bind(i64::from(entry.status))
    .bind(entry.duration_ms)
    .bind(&entry.ip)
    .bind(entry.create_time)
    .execute(pool)
    .await?;
    Ok(())
}

async fn deliver_notice(broker: &Broker, delivery: NoticeDelivery) -> HeraldResult<()> {
    let body = Bytes::from(serde_json::to_vec(&delivery.notice)?);
    let delivered = match &delivery.target {
        NoticeTarget::All => broker.broadcast_notice(body).await,
        NoticeTarget::Users(users) => {
            let mut delivered = 0;
            for user in users {
                delivered += broker
                    .send_to_user_destination(user, MESSAGE_QUEUE, body.clone())
                    .await;
            }
            delivered
        },
    };
    debug!(notice_id = delivery.notice.id, delivered, "Notice delivered");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn log_job(path: &str) -> Job {
        Job::AccessLog(AccessLogEntry {
            username: None,
            method: "GET".into(),
            path: path.into(),
            status: 200,
            duration_ms: 1,
            ip: "127.0.0.1".into(),
            create_time: 0,
        })
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let (handle, _worker) = BackgroundWorker::channel(2);
        assert!(handle.submit(log_job("/a")));
        assert!(handle.submit(log_job("/b")));
        assert!(!handle.submit(log_job("/c")));
    }

    #[tokio::test]
    async fn test_closed_queue_drops() {
        let (handle, worker) = BackgroundWorker::channel(2);
        drop(worker);
        assert!(!handle.submit(log_job("/a")));
    }
}
