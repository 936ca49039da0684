use super::Snapshot;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::Context as TaskContext;
use std::task::Poll;

pin_project! {
    /// A future that runs every poll inside a captured [`Snapshot`].
    ///
    /// Executors may poll a future on any worker thread. Attaching the
    /// snapshot for the duration of each poll keeps recursion depth,
    /// configuration overrides and caller metadata attached to the logical
    /// call instead of to whichever thread happens to run it.
    #[derive(Clone, Debug)]
    pub struct WithScope<T> {
        #[pin]
        inner: T,
        snapshot: Snapshot,
    }
}

impl<T: Future> Future for WithScope<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = this.snapshot.attach().ok();

        this.inner.poll(task_cx)
    }
}

/// Extension trait carrying the scoped context across `.await` points.
pub trait ScopeFutureExt: Sized {
    /// Runs this future inside `snapshot`.
    fn in_scope(self, snapshot: Snapshot) -> WithScope<Self> {
        WithScope {
            inner: self,
            snapshot,
        }
    }

    /// Runs this future inside a snapshot of the calling thread's current
    /// scope.
    ///
    /// # Examples
    ///
    /// ```
    /// use httpwatch::scope::{self, ScopeFutureExt};
    ///
    /// # futures_executor::block_on(async {
    /// let task = scope::without_patches(|| {
    ///     async { scope::patches_disabled() }.in_current_scope()
    /// })
    /// .unwrap();
    ///
    /// // The scope has exited, but the future still observes it.
    /// assert!(!scope::patches_disabled());
    /// assert!(task.await);
    /// # });
    /// ```
    fn in_current_scope(self) -> WithScope<Self> {
        let snapshot = super::snapshot_all().unwrap_or_default();
        self.in_scope(snapshot)
    }
}

impl<T: Future> ScopeFutureExt for T {}
