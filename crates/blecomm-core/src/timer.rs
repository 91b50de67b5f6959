//! Single-shot cancellable timers.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A single-shot timer that posts `event` on `tx` when it expires.
///
/// Cancelling (or dropping) the alarm before expiry suppresses the event;
/// cancelling after it fired is a no-op, so a fired-and-cancelled timer
/// never double-acts.
#[derive(Debug)]
pub(crate) struct Alarm {
    handle: JoinHandle<()>,
}

impl Alarm {
    pub fn schedule<E: Send + 'static>(
        after: Duration,
        tx: mpsc::UnboundedSender<E>,
        event: E,
    ) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(event);
        });
        Self { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_after_duration() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _alarm = Alarm::schedule(Duration::from_millis(10), tx, 7u32);
        let fired = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("alarm did not fire");
        assert_eq!(fired, Some(7));
    }

    #[tokio::test]
    async fn cancel_suppresses_the_event() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u32>();
        let alarm = Alarm::schedule(Duration::from_millis(20), tx, 1);
        alarm.cancel();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn drop_suppresses_the_event() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u32>();
        drop(Alarm::schedule(Duration::from_millis(20), tx, 1));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_after_fire_is_a_noop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let alarm = Alarm::schedule(Duration::from_millis(5), tx, 3u32);
        tokio::time::sleep(Duration::from_millis(40)).await;
        alarm.cancel();
        assert_eq!(rx.try_recv().ok(), Some(3));
        assert!(rx.try_recv().is_err());
    }
}
