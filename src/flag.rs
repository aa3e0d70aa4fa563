//! A flag that can be raised to wake a task.

use std::{
	pin::Pin,
	sync::{
		atomic::{AtomicBool, Ordering::Relaxed},
		Arc,
	},
};

use futures::{
	future::Future,
	task::{AtomicWaker, Context, Poll},
};

#[derive(Debug)]
struct Inner {
	waker: AtomicWaker,
	set: AtomicBool,
}

/// A raisable flag, readable without blocking and awaitable as a future.
///
/// The reaper raises one of these per child; the state machine reads its
/// `done` flag synchronously while reload timers and the stdin forwarder
/// await theirs. `lower` exists because `done` is reused across task
/// generations; per-child flags are raised once and dropped.
#[derive(Clone, Debug)]
pub struct Flag(Arc<Inner>);

impl Default for Flag {
	fn default() -> Self {
		Self::new(false)
	}
}

impl Flag {
	pub fn new(value: bool) -> Self {
		Self(Arc::new(Inner {
			waker: AtomicWaker::new(),
			set: AtomicBool::new(value),
		}))
	}

	pub fn raised(&self) -> bool {
		self.0.set.load(Relaxed)
	}

	pub fn raise(&self) {
		self.0.set.store(true, Relaxed);
		self.0.waker.wake();
	}

	pub fn lower(&self) {
		self.0.set.store(false, Relaxed);
	}
}

impl Future for Flag {
	type Output = ();

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
		// quick check to avoid registration if already done.
		if self.0.set.load(Relaxed) {
			return Poll::Ready(());
		}

		self.0.waker.register(cx.waker());

		// Need to check condition **after** `register` to avoid a race
		// condition that would result in lost notifications.
		if self.0.set.load(Relaxed) {
			Poll::Ready(())
		} else {
			Poll::Pending
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::time::timeout;

	use super::Flag;

	#[tokio::test]
	async fn raise_wakes_waiter() {
		let flag = Flag::default();
		assert!(!flag.raised());

		let waiter = flag.clone();
		let handle = tokio::spawn(waiter);

		flag.raise();
		assert!(flag.raised());
		timeout(Duration::from_secs(1), handle)
			.await
			.expect("waiter should wake")
			.unwrap();
	}

	#[tokio::test]
	async fn already_raised_resolves_immediately() {
		let flag = Flag::new(true);
		timeout(Duration::from_millis(100), flag.clone())
			.await
			.expect("should not block");
	}

	#[test]
	fn lower_resets() {
		let flag = Flag::new(true);
		flag.lower();
		assert!(!flag.raised());
	}
}
