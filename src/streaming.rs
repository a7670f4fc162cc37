use futures::{Future, Stream};
use pin_project::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{sleep, Sleep};

/// Item of an [`IdleWatchdog`] stream.
#[derive(Debug, PartialEq)]
pub enum Watched<T> {
    Item(T),
    /// Nothing arrived for the configured inactivity period.
    Idle,
}

/// Passes items through and reports `Idle` whenever the inner stream stays
/// silent for `timeout`. The timer restarts after every item and every
/// `Idle`, so a stream that stays silent keeps reporting.
#[pin_project]
pub struct IdleWatchdog<S>
where
    S: Stream,
{
    #[pin]
    inner: S,
    timeout: Option<Duration>,
    #[pin]
    timer: Option<Sleep>,
}

impl<S> IdleWatchdog<S>
where
    S: Stream,
{
    /// With `timeout` set to `None` the watchdog never fires.
    pub fn new(inner: S, timeout: Option<Duration>) -> Self {
        Self {
            inner,
            timeout,
            timer: None,
        }
    }
}

impl<S> Stream for IdleWatchdog<S>
where
    S: Stream,
{
    type Item = Watched<S::Item>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(item)) => {
                if let Some(timeout) = *this.timeout {
                    this.timer.set(Some(sleep(timeout)));
                }
                return Poll::Ready(Some(Watched::Item(item)));
            }
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => {}
        }

        let Some(timeout) = *this.timeout else {
            return Poll::Pending;
        };

        if this.timer.is_none() {
            this.timer.set(Some(sleep(timeout)));
        }

        if let Some(timer) = this.timer.as_mut().as_pin_mut() {
            if timer.poll(cx).is_ready() {
                this.timer.set(Some(sleep(timeout)));
                // Register the fresh timer with the waker before reporting.
                if let Some(timer) = this.timer.as_mut().as_pin_mut() {
                    let _ = timer.poll(cx);
                }
                return Poll::Ready(Some(Watched::Idle));
            }
        }

        Poll::Pending
    }
}
