use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

use crate::core::HoldingError;
use crate::event::SpanEvent;
use crate::index::HoldingIndex;

const DEFAULT_CHANNEL_SIZE: usize = 1024;

/// 一次 `SpanStream::run` 的结果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    /// 读到的非空行
    pub lines: u64,
    /// 行格式错误
    pub malformed: u64,
    /// 写入索引成功
    pub accepted: u64,
    /// 索引拒绝（校验失败 / 已关闭）
    pub rejected: u64,
}

/// 行协议入口：读者任务解析，经有界 channel 交给索引写入方（背压而非丢弃）。
pub struct SpanStream {
    index: Arc<HoldingIndex>,
    channel_size: usize,
}

impl SpanStream {
    pub fn new(index: Arc<HoldingIndex>) -> Self {
        Self {
            index,
            channel_size: DEFAULT_CHANNEL_SIZE,
        }
    }

    pub fn with_channel_size(mut self, size: usize) -> Self {
        self.channel_size = size.max(1);
        self
    }

    /// 读到 EOF（或索引关闭）为止
    pub async fn run<R>(self, reader: R) -> anyhow::Result<StreamSummary>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<SpanEvent>(self.channel_size);

        let reader_task = tokio::spawn(async move {
            let mut lines = reader.lines();
            let (mut seen, mut malformed) = (0u64, 0u64);
            while let Some(line) = lines.next_line().await? {
                let trimmed = line.trim_end();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                seen += 1;
                match line.parse::<SpanEvent>() {
                    Ok(ev) => {
                        if tx.send(ev).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        malformed += 1;
                        tracing::warn!("malformed span line {:?}: {}", line, e);
                    }
                }
            }
            Ok::<_, std::io::Error>((seen, malformed))
        });

        let tag = self.index.tag();
        let mut summary = StreamSummary::default();
        while let Some(ev) = rx.recv().await {
            match self.index.insert_span(
                ev.channel.as_str(),
                ev.kind.as_str(),
                ev.time,
                ev.duration_ms,
            ) {
                Ok(_) => summary.accepted += 1,
                Err(HoldingError::Closed) => {
                    summary.rejected += 1;
                    tracing::info!("[{}] index closed, stopping span stream", tag);
                    break;
                }
                Err(e) => {
                    summary.rejected += 1;
                    tracing::warn!("[{}] span {} rejected: {}", tag, ev, e);
                }
            }
        }
        drop(rx);

        let (lines, malformed) = reader_task.await??;
        summary.lines = lines;
        summary.malformed = malformed;
        tracing::info!(
            "[{}] span stream done: {} lines, {} accepted, {} rejected, {} malformed",
            tag,
            summary.lines,
            summary.accepted,
            summary.rejected,
            summary.malformed
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::HoldingStore;
    use crate::storage::MemoryGateway;
    use std::io::Cursor;

    fn index() -> (Arc<MemoryGateway>, Arc<HoldingIndex>) {
        let gw = Arc::new(MemoryGateway::new("holdings"));
        let idx = Arc::new(HoldingIndex::new(HoldingStore::new(gw.clone())));
        (gw, idx)
    }

    #[tokio::test]
    async fn feeds_index_from_lines() {
        let (gw, idx) = index();
        let input = "\
# comment
USAAA  BHZ00|AA|1700006415000|10000
USAAA  BHZ00|AA|1700006425000|10000

USBBB  BHZ00|AA|1700006415000|500
garbage line
USAAA  BHZ00|AA|1700006425000|-5
";
        let summary = SpanStream::new(idx.clone())
            .with_channel_size(2)
            .run(Cursor::new(input.as_bytes().to_vec()))
            .await
            .unwrap();

        assert_eq!(
            summary,
            StreamSummary {
                lines: 5,
                malformed: 1,
                accepted: 3,
                rejected: 1,
            }
        );
        assert_eq!(idx.size(), 2);
        assert!(idx.contains_fully(Some("USAAA  BHZ00"), 1_700_006_415_000, 20_000));
        assert_eq!(gw.rows("holdings").len(), 2);
    }

    #[tokio::test]
    async fn stops_when_index_closes() {
        let (_gw, idx) = index();
        idx.close();
        let input = "USAAA  BHZ00|AA|1700006415000|10000\nUSAAA  BHZ00|AA|1700006425000|10000\n";
        let summary = SpanStream::new(idx)
            .run(Cursor::new(input.as_bytes().to_vec()))
            .await
            .unwrap();
        assert_eq!(summary.accepted, 0);
        assert_eq!(summary.rejected, 1);
    }
}
