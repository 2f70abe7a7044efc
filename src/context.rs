//! Deadlines and cancellation for suspending operations.
//!
//! Every operation that may wait on the network takes an [`OpContext`].
//! When the deadline passes the operation fails with [`NetError::Timeout`];
//! when the paired [`Canceller`] fires it fails with [`NetError::Canceled`].
//! Contexts are cheap to clone and clones share the same cancellation signal.

use std::future::Future;

use tokio::sync::watch;
use tokio::time::{Duration, Instant};

use crate::error::{NetError, Result};

#[derive(Clone, Debug)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: watch::Receiver<bool>,
}

/// Cancels every context derived from the one it was created with.
#[derive(Debug)]
pub struct Canceller {
    tx: watch::Sender<bool>,
}

impl Canceller {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl OpContext {
    /// A context with no deadline that can never be canceled.
    pub fn background() -> Self {
        let (_tx, cancel) = watch::channel(false);
        Self {
            deadline: None,
            cancel,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        let mut ctx = Self::background();
        ctx.deadline = Some(deadline);
        ctx
    }

    /// A context without deadline plus the handle that cancels it.
    pub fn cancellable() -> (Self, Canceller) {
        let (tx, cancel) = watch::channel(false);
        (
            Self {
                deadline: None,
                cancel,
            },
            Canceller { tx },
        )
    }

    /// Derive a context that expires at the earlier of the parent deadline
    /// and `now + timeout`, sharing the parent's cancellation.
    pub fn child_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` means unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Clamp `limit` to the remaining time of this context.
    pub fn bounded(&self, limit: Duration) -> Duration {
        match self.remaining() {
            Some(left) => left.min(limit),
            None => limit,
        }
    }

    pub fn is_canceled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Fail fast if the context is already canceled or expired.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            return Err(NetError::Canceled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(NetError::Timeout);
            }
        }
        Ok(())
    }

    /// Resolves once the context is canceled. Never resolves for contexts
    /// whose canceller has been dropped without firing.
    pub async fn canceled(&self) {
        let mut rx = self.cancel.clone();
        let sender_gone = rx.wait_for(|canceled| *canceled).await.is_err();
        if sender_gone {
            std::future::pending::<()>().await;
        }
    }

    /// Resolves when the deadline passes. Never resolves without a deadline.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Drive `fut` until it completes, the deadline passes or the context
    /// is canceled, whichever happens first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.canceled() => Err(NetError::Canceled),
            _ = self.expired() => Err(NetError::Timeout),
            res = fut => res,
        }
    }

    /// Sleep for `duration`, returning early with an error if the context ends.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_runs_to_completion() {
        let ctx = OpContext::background();
        let value = ctx.run(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(ctx.remaining().is_none());
    }

    #[tokio::test]
    async fn deadline_yields_timeout() {
        let ctx = OpContext::with_timeout(Duration::from_millis(20));
        let res: Result<()> = ctx
            .run(async {
                std::future::pending::<()>().await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(NetError::Timeout)));
    }

    #[tokio::test]
    async fn expired_context_fails_fast() {
        let ctx = OpContext::with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(matches!(ctx.check(), Err(NetError::Timeout)));
    }

    #[tokio::test]
    async fn cancel_yields_canceled() {
        let (ctx, canceller) = OpContext::cancellable();
        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move {
                ctx.run(async {
                    std::future::pending::<()>().await;
                    Ok(())
                })
                .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
        let res = task.await.unwrap();
        assert!(matches!(res, Err(NetError::Canceled)));
        assert!(ctx.is_canceled());
    }

    #[tokio::test]
    async fn dropped_canceller_never_cancels() {
        let (ctx, canceller) = OpContext::cancellable();
        drop(canceller);
        let ctx = ctx.child_timeout(Duration::from_millis(20));
        let res = ctx.sleep(Duration::from_secs(5)).await;
        assert!(matches!(res, Err(NetError::Timeout)));
    }

    #[tokio::test]
    async fn child_keeps_earlier_parent_deadline() {
        let parent = OpContext::with_timeout(Duration::from_millis(50));
        let child = parent.child_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        let child = parent.child_timeout(Duration::from_millis(1));
        assert!(child.deadline() < parent.deadline());
    }
}
