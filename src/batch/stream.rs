//! 批量任务进度的 SSE 推送
//!
//! 先推一次 `snapshot`，之后每秒推一次（与上次逐字节相同则跳过），
//! 任务结束时推送 `type` 为终态名的最终快照并关闭。

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::task::BatchTask;

/// 推送间隔
pub const PROGRESS_TICK: Duration = Duration::from_secs(1);

fn render(task: &BatchTask, kind: &str) -> String {
    let mut snapshot = task.snapshot();
    snapshot.kind = Some(kind.to_string());
    serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string())
}

/// 进度载荷流；客户端断开后后台协程随之退出
pub fn progress_payloads(task: Arc<BatchTask>) -> ReceiverStream<String> {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let mut last = render(&task, "snapshot");
        if tx.send(last.clone()).await.is_err() {
            return;
        }
        let mut ticker = tokio::time::interval(PROGRESS_TICK);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = task.wait_done() => {
                    let status = task.status();
                    let _ = tx.send(render(&task, status.as_str())).await;
                    return;
                }
                _ = ticker.tick() => {
                    let payload = render(&task, "snapshot");
                    if payload == last {
                        continue;
                    }
                    if tx.send(payload.clone()).await.is_err() {
                        return;
                    }
                    last = payload;
                }
                () = tx.closed() => return,
            }
        }
    });
    ReceiverStream::new(rx)
}

/// 包装成 axum 的 SSE 响应
pub fn progress_sse(
    task: Arc<BatchTask>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = progress_payloads(task).map(|payload| Ok(Event::default().data(payload)));
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::task::{BatchSnapshot, TaskStatus};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn parse(raw: &str) -> BatchSnapshot {
        serde_json::from_str(raw).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_skips_unchanged_and_ends_with_terminal() {
        let task = Arc::new(BatchTask::new(2, CancellationToken::new()));
        let mut stream = progress_payloads(task.clone());

        let first = parse(&stream.next().await.unwrap());
        assert_eq!(first.kind.as_deref(), Some("snapshot"));
        assert_eq!(first.processed, 0);

        // 两个 tick 内没有变化，不会推送
        tokio::time::sleep(Duration::from_millis(2500)).await;
        task.record("a", true, json!(true));
        let second = parse(&stream.next().await.unwrap());
        assert_eq!(second.processed, 1);

        task.record("b", false, json!(false));
        task.finish(TaskStatus::Done, None);
        let mut last = None;
        while let Some(raw) = stream.next().await {
            last = Some(parse(&raw));
        }
        let last = last.unwrap();
        assert_eq!(last.kind.as_deref(), Some("done"));
        assert_eq!(last.summary.done, 2);
    }

    #[tokio::test]
    async fn test_finished_task_closes_immediately() {
        let task = Arc::new(BatchTask::new(0, CancellationToken::new()));
        task.finish(TaskStatus::Cancelled, None);
        let payloads: Vec<String> = progress_payloads(task).collect().await;
        assert_eq!(payloads.len(), 2);
        assert_eq!(parse(&payloads[1]).kind.as_deref(), Some("cancelled"));
    }
}
