//! Output held back until the renderer is ready

use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot};

use super::TerminalEvent;

/// Sink installed by `mark_ready`
pub type EventSink = mpsc::UnboundedSender<TerminalEvent>;

/// Forward `events` to the sink delivered on `ready`. Everything that
/// arrives first is queued and flushed in order before anything newer.
pub(super) async fn pump(
    mut events: mpsc::UnboundedReceiver<TerminalEvent>,
    mut ready: oneshot::Receiver<EventSink>,
) {
    let mut pending = VecDeque::new();

    let sink = loop {
        tokio::select! {
            biased;
            sink = &mut ready => match sink {
                Ok(sink) => break sink,
                // Handle dropped without ever becoming ready
                Err(_) => return,
            },
            event = events.recv() => match event {
                Some(event) => pending.push_back(event),
                None => match ready.await {
                    Ok(sink) => {
                        flush(&sink, &mut pending);
                        return;
                    }
                    Err(_) => return,
                },
            },
        }
    };

    if !flush(&sink, &mut pending) {
        return;
    }
    while let Some(event) = events.recv().await {
        if sink.send(event).is_err() {
            break;
        }
    }
}

fn flush(sink: &EventSink, pending: &mut VecDeque<TerminalEvent>) -> bool {
    if !pending.is_empty() {
        tracing::debug!("Flushing {} buffered terminal event(s)", pending.len());
    }
    while let Some(event) = pending.pop_front() {
        if sink.send(event).is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(s: &str) -> TerminalEvent {
        TerminalEvent::Output(s.to_string())
    }

    #[tokio::test]
    async fn test_buffers_until_ready_then_preserves_order() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(pump(events_rx, ready_rx));

        events_tx.send(output("a")).unwrap();
        events_tx.send(output("b")).unwrap();
        tokio::task::yield_now().await;

        let (sink, mut received) = mpsc::unbounded_channel();
        ready_tx.send(sink).unwrap();
        events_tx.send(output("c")).unwrap();
        drop(events_tx);
        task.await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = received.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen, vec![output("a"), output("b"), output("c")]);
    }

    #[tokio::test]
    async fn test_flushes_when_source_ends_before_ready() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(pump(events_rx, ready_rx));

        events_tx.send(output("bye")).unwrap();
        events_tx
            .send(TerminalEvent::Exit {
                exit_code: Some(0),
                signal: None,
            })
            .unwrap();
        drop(events_tx);
        tokio::task::yield_now().await;

        let (sink, mut received) = mpsc::unbounded_channel();
        ready_tx.send(sink).unwrap();
        task.await.unwrap();

        assert_eq!(received.recv().await, Some(output("bye")));
        assert!(matches!(
            received.recv().await,
            Some(TerminalEvent::Exit { exit_code: Some(0), .. })
        ));
        assert_eq!(received.recv().await, None);
    }

    #[tokio::test]
    async fn test_never_ready_ends_quietly() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel::<EventSink>();
        let task = tokio::spawn(pump(events_rx, ready_rx));
        events_tx.send(output("lost")).unwrap();
        drop(ready_tx);
        task.await.unwrap();
    }
}
