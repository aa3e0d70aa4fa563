//! The request gate held closed while the task is restarting.

use std::sync::Arc;

use tokio::sync::watch;

/// A counter used as a barrier for inbound proxy requests.
///
/// The state machine closes the gate when a reload begins and opens it once
/// the replacement child has been launched; HTTP handlers park in
/// [`wait_open`](Gate::wait_open) in between, so clients queue instead of
/// hitting a dead backend.
#[derive(Clone, Debug)]
pub struct Gate {
	level: Arc<watch::Sender<usize>>,
}

impl Default for Gate {
	fn default() -> Self {
		let (tx, _) = watch::channel(0);
		Self { level: Arc::new(tx) }
	}
}

impl Gate {
	pub fn new() -> Self {
		Self::default()
	}

	/// Raise the barrier by one.
	pub fn close(&self) {
		self.level.send_modify(|level| *level += 1);
	}

	/// Lower the barrier by one. Saturates at zero: the very first task
	/// launch has no preceding reload to pair with.
	pub fn open(&self) {
		self.level.send_modify(|level| *level = level.saturating_sub(1));
	}

	pub fn is_closed(&self) -> bool {
		*self.level.borrow() > 0
	}

	/// Wait until no reload holds the gate closed.
	pub async fn wait_open(&self) {
		let mut level = self.level.subscribe();
		// The sender lives in self, so this cannot fail.
		level.wait_for(|level| *level == 0).await.ok();
	}
}
