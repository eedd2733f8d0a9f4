//! Invocation stream wrapper.

use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use agent_relay_core::{AgentMessage, AgentStream};
use futures::{Stream, StreamExt};

type AbandonHook = Box<dyn FnOnce() + Send>;

/// Message stream of one invocation.
///
/// Ends right after the first terminal message. If it is dropped before
/// reaching the end, the abandon hook runs once.
pub struct InvocationStream {
    inner: AgentStream,
    finished: bool,
    on_abandon: Option<AbandonHook>,
}

impl InvocationStream {
    #[must_use]
    pub fn new(inner: AgentStream) -> Self {
        Self {
            inner,
            finished: false,
            on_abandon: None,
        }
    }

    #[must_use]
    pub fn on_abandon(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_abandon = Some(Box::new(hook));
        self
    }

    fn finish(&mut self) {
        self.finished = true;
        self.on_abandon = None;
    }
}

impl fmt::Debug for InvocationStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationStream")
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Stream for InvocationStream {
    type Item = AgentMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(message)) => {
                if message.is_terminal() {
                    this.finish();
                }
                Poll::Ready(Some(message))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for InvocationStream {
    fn drop(&mut self) {
        if let Some(hook) = self.on_abandon.take() {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use futures::stream;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&count);
        (count, move || {
            hook_count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn stops_after_terminal_message() {
        let inner = stream::iter([
            AgentMessage::status("a"),
            AgentMessage::error("bad"),
            AgentMessage::status("late"),
        ])
        .boxed();
        let mut stream = task::spawn(InvocationStream::new(inner));

        assert_ready_eq!(stream.poll_next(), Some(AgentMessage::status("a")));
        assert_ready_eq!(stream.poll_next(), Some(AgentMessage::error("bad")));
        assert_ready_eq!(stream.poll_next(), None);
    }

    #[test]
    fn dropping_midway_runs_hook_once() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (count, hook) = counter();
        let mut stream = task::spawn(
            InvocationStream::new(UnboundedReceiverStream::new(rx).boxed()).on_abandon(hook),
        );

        tx.send(AgentMessage::status("working")).unwrap();
        assert_ready_eq!(stream.poll_next(), Some(AgentMessage::status("working")));
        assert_pending!(stream.poll_next());

        drop(stream);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finished_streams_skip_hook() {
        let (count, hook) = counter();
        let inner = stream::iter([AgentMessage::Done]).boxed();
        let mut stream = task::spawn(InvocationStream::new(inner).on_abandon(hook));

        assert_ready_eq!(stream.poll_next(), Some(AgentMessage::Done));
        drop(stream);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let (count, hook) = counter();
        let mut stream =
            task::spawn(InvocationStream::new(stream::empty().boxed()).on_abandon(hook));
        assert_ready_eq!(stream.poll_next(), None);
        drop(stream);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
