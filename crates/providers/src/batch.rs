//! Delta batching shared by every adapter.
//!
//! Deltas accumulate in a buffer that flushes when it reaches
//! `delta_buffer_limit` items or when `delta_time_ms` elapses,
//! whichever comes first. A flush tick that finds the receiver not
//! ready leaves the buffer intact and retries on the next tick. On
//! provider completion the ticker stops, the buffer drains, and a
//! terminal `{done}` batch is sent with a short bounded wait before
//! the channel closes.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use chorus_domain::config::AdapterConfig;
use chorus_domain::stream::{DeltaBatch, ResponseDelta, SelectedModel};
use chorus_domain::{Error, Result};

use crate::traits::{BoxStream, ProviderEvent};

/// How long the terminal batch send may block before the adapter
/// gives up and closes anyway.
const TERMINAL_SEND_WAIT: Duration = Duration::from_secs(2);

/// Accumulates deltas and hands out per-request monotonic indices.
pub struct DeltaBatcher {
    buf: Vec<ResponseDelta>,
    limit: usize,
    next_index: u64,
}

impl DeltaBatcher {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit: limit.max(1),
            next_index: 1,
        }
    }

    /// The next delta index. Monotonic, starting at 1.
    pub fn next_index(&mut self) -> u64 {
        let idx = self.next_index;
        self.next_index += 1;
        idx
    }

    /// Append a delta. Returns the full buffer when the item limit is
    /// reached.
    pub fn push(&mut self, delta: ResponseDelta) -> Option<DeltaBatch> {
        self.buf.push(delta);
        if self.buf.len() >= self.limit {
            Some(std::mem::take(&mut self.buf))
        } else {
            None
        }
    }

    /// Drain whatever has accumulated.
    pub fn take(&mut self) -> Option<DeltaBatch> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }

    /// Put a batch back at the front after a failed try-send.
    pub fn restore(&mut self, mut batch: DeltaBatch) {
        batch.append(&mut self.buf);
        self.buf = batch;
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Run the emission contract over a normalized provider event stream.
///
/// This is the single place the batching/tick/terminal rules live;
/// adapters reduce their wire formats to [`ProviderEvent`]s and call
/// this. Returns the provider error, if the stream ended with one
/// (the same error is also delivered in-stream as an `{error}` delta).
pub(crate) async fn pump_deltas(
    cancel: CancellationToken,
    cfg: &AdapterConfig,
    model: &SelectedModel,
    mut events: BoxStream<'_, Result<ProviderEvent>>,
    out: mpsc::Sender<DeltaBatch>,
) -> Result<()> {
    let mut batcher = DeltaBatcher::new(cfg.delta_buffer_limit);
    let mut ticker = tokio::time::interval(Duration::from_millis(cfg.delta_time_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; skip it so
    // the first flush window is a full delta_time_ms.
    ticker.tick().await;

    let mut stream_error: Option<String> = None;
    let mut cancelled = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            _ = ticker.tick() => {
                if let Some(batch) = batcher.take() {
                    if let Err(TrySendError::Full(batch)) = out.try_send(batch) {
                        // Receiver not ready; keep accumulating and
                        // retry on the next tick.
                        batcher.restore(batch);
                    }
                }
            }
            ev = events.next() => match ev {
                Some(Ok(ProviderEvent::Text(text))) => {
                    let idx = batcher.next_index();
                    if let Some(batch) = batcher.push(ResponseDelta::text(idx, text)) {
                        if !send_guarded(&cancel, &out, batch).await {
                            cancelled = true;
                            break;
                        }
                    }
                }
                Some(Ok(ProviderEvent::ToolCalls(calls))) => {
                    let idx = batcher.next_index();
                    if let Some(batch) = batcher.push(ResponseDelta::tool_calls(idx, calls)) {
                        if !send_guarded(&cancel, &out, batch).await {
                            cancelled = true;
                            break;
                        }
                    }
                }
                Some(Ok(ProviderEvent::Done)) | None => break,
                Some(Err(e)) => {
                    stream_error = Some(e.to_string());
                    break;
                }
            }
        }
    }

    // Ticker stops here (dropped); what follows is the final drain.
    drop(ticker);

    if cancelled {
        // Close promptly: best-effort flush, no blocking waits.
        if let Some(batch) = batcher.take() {
            let _ = out.try_send(batch);
        }
        tracing::debug!(model = %model, "adapter stream cancelled");
        return Ok(());
    }

    let mut terminal = batcher.take().unwrap_or_default();
    match &stream_error {
        Some(message) => {
            let idx = batcher.next_index();
            terminal.push(ResponseDelta::error(idx, message.clone()));
        }
        None => {
            let idx = batcher.next_index();
            terminal.push(ResponseDelta::done(idx));
        }
    }

    // Bounded wait for the terminal batch, then give up; the channel
    // closes when the sender drops either way.
    if tokio::time::timeout(TERMINAL_SEND_WAIT, out.send(terminal))
        .await
        .is_err()
    {
        tracing::warn!(model = %model, "terminal delta batch not accepted in time");
    }

    match stream_error {
        Some(message) => Err(Error::Provider {
            model: model.canonical(),
            message,
        }),
        None => Ok(()),
    }
}

/// Send a batch, bailing out if the caller cancels or the receiver is
/// gone. Returns false when the send did not complete.
async fn send_guarded(
    cancel: &CancellationToken,
    out: &mpsc::Sender<DeltaBatch>,
    batch: DeltaBatch,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = out.send(batch) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_monotonic_from_one() {
        let mut b = DeltaBatcher::new(24);
        assert_eq!(b.next_index(), 1);
        assert_eq!(b.next_index(), 2);
        assert_eq!(b.next_index(), 3);
    }

    #[test]
    fn push_flushes_at_limit() {
        let mut b = DeltaBatcher::new(3);
        assert!(b.push(ResponseDelta::text(1, "a")).is_none());
        assert!(b.push(ResponseDelta::text(2, "b")).is_none());
        let batch = b.push(ResponseDelta::text(3, "c")).unwrap();
        assert_eq!(batch.len(), 3);
        assert!(b.is_empty());
    }

    #[test]
    fn restore_preserves_order() {
        let mut b = DeltaBatcher::new(10);
        b.push(ResponseDelta::text(3, "c"));
        b.restore(vec![ResponseDelta::text(1, "a"), ResponseDelta::text(2, "b")]);
        let batch = b.take().unwrap();
        let indices: Vec<u64> = batch.iter().map(|d| d.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn take_on_empty_is_none() {
        let mut b = DeltaBatcher::new(4);
        assert!(b.take().is_none());
    }

    // ── pump_deltas contract ───────────────────────────────────────

    fn scripted_stream(
        script: Vec<(u64, Vec<&'static str>)>,
    ) -> BoxStream<'static, Result<ProviderEvent>> {
        Box::pin(async_stream::stream! {
            for (delay_ms, texts) in script {
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                for t in texts {
                    yield Ok(ProviderEvent::Text(t.to_string()));
                }
            }
        })
    }

    fn test_cfg(limit: usize, time_ms: u64) -> AdapterConfig {
        AdapterConfig {
            delta_buffer_limit: limit,
            delta_time_ms: time_ms,
        }
    }

    fn model() -> SelectedModel {
        SelectedModel::new("fake", "v1")
    }

    #[tokio::test(start_paused = true)]
    async fn streamed_text_reassembles_with_monotonic_indices() {
        // 20 deltas in 4 bursts, buffer limit 24 → every flush is
        // time-driven.
        let words = vec!["Hel", "lo,", " wor", "ld", "."];
        let script: Vec<(u64, Vec<&'static str>)> =
            (0..4).map(|i| (if i == 0 { 0 } else { 200 }, words.clone())).collect();
        let (tx, mut rx) = mpsc::channel(32);
        let cfg = test_cfg(24, 150);

        let pump = tokio::spawn({
            let cancel = CancellationToken::new();
            async move {
                pump_deltas(cancel, &cfg, &model(), scripted_stream(script), tx).await
            }
        });

        let mut batches = Vec::new();
        while let Some(batch) = rx.recv().await {
            batches.push(batch);
        }
        pump.await.unwrap().unwrap();

        assert!(batches.len() > 1, "time-based flushes should split batches");

        let all: Vec<&ResponseDelta> = batches.iter().flatten().collect();
        let text: String = all.iter().filter_map(|d| d.msg.as_deref()).collect();
        assert_eq!(text, "Hello, world.".repeat(4));

        // Strictly increasing indices across all batches.
        let indices: Vec<u64> = all.iter().map(|d| d.index).collect();
        assert!(indices.windows(2).all(|w| w[0] < w[1]));

        // Exactly one terminal done, as the last delta.
        assert!(all.last().unwrap().done);
        assert_eq!(all.iter().filter(|d| d.done).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_closes_channel_promptly() {
        let pending: BoxStream<'static, Result<ProviderEvent>> =
            Box::pin(async_stream::stream! {
                yield Ok(ProviderEvent::Text("partial".into()));
                futures_util::future::pending::<()>().await;
            });
        let (tx, mut rx) = mpsc::channel(4);
        let cfg = test_cfg(24, 150);
        let cancel = CancellationToken::new();

        let pump = tokio::spawn({
            let cancel = cancel.clone();
            async move { pump_deltas(cancel, &cfg, &model(), pending, tx).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = tokio::time::Instant::now();
        cancel.cancel();

        // Drain until close; must happen well inside 200ms.
        while rx.recv().await.is_some() {}
        assert!(started.elapsed() < Duration::from_millis(200));
        pump.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stream_error_is_delivered_in_stream_then_closed() {
        let failing: BoxStream<'static, Result<ProviderEvent>> =
            Box::pin(async_stream::stream! {
                yield Ok(ProviderEvent::Text("before".into()));
                yield Err(Error::Http("connection reset".into()));
            });
        let (tx, mut rx) = mpsc::channel(4);
        let cfg = test_cfg(24, 150);

        let result = pump_deltas(CancellationToken::new(), &cfg, &model(), failing, tx).await;
        assert!(result.is_err());

        let mut all = Vec::new();
        while let Some(batch) = rx.recv().await {
            all.extend(batch);
        }
        let last = all.last().unwrap();
        assert!(last.error.as_deref().unwrap().contains("connection reset"));
        assert!(!last.done);
    }

    #[tokio::test(start_paused = true)]
    async fn missed_tick_accumulates_and_retries() {
        // Channel capacity 1 with a slow receiver: the second flush
        // tick finds the channel full and keeps the deltas.
        let script = vec![(0, vec!["a"]), (200, vec!["b"]), (200, vec!["c"])];
        let (tx, mut rx) = mpsc::channel(1);
        let cfg = test_cfg(24, 150);

        let pump = tokio::spawn({
            let cancel = CancellationToken::new();
            async move {
                pump_deltas(cancel, &cfg, &model(), scripted_stream(script), tx).await
            }
        });

        // Let several ticks pass before draining anything.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let first = rx.recv().await.unwrap();
        let texts: Vec<_> = first.iter().filter_map(|d| d.msg.as_deref()).collect();
        assert_eq!(texts, vec!["a"]);

        // Everything held back arrives together, in order.
        let second = rx.recv().await.unwrap();
        let texts: Vec<_> = second.iter().filter_map(|d| d.msg.as_deref()).collect();
        assert_eq!(texts, vec!["b", "c"]);
        assert!(second.last().unwrap().done);

        assert!(rx.recv().await.is_none());
        pump.await.unwrap().unwrap();
    }
}
