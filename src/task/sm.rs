//! The task state machine.
//!
//! One instance lives for the whole program. The coordinator drives it by
//! calling [`execute`](StateMachine::execute) in a loop until it stops
//! asking to be rerun, then blocks; wake-ups arrive on the reprocess
//! channel from reapers and reload timers.
//!
//! The states, as a tuple of (task, reload request, done):
//!
//! | state   | task | reload request | done  |
//! |---------|------|----------------|-------|
//! | idle    | none | unset          | false |
//! | running | some | unset          | false |
//! | closing | some | set            | false |
//! | reaping | some | set            | true  |

use std::{
	sync::Arc,
	time::{Duration, Instant},
};

use tokio::{sync::mpsc, time::sleep};
use tracing::{info, trace};

use crate::{config::Config, error::CriticalError, flag::Flag, gate::Gate};

use super::{child::Task, stdin::StdinBroker};

/// Cadence of wake-ups while a reload waits for the old task to die.
const RELOAD_TICK: Duration = Duration::from_millis(100);

pub(crate) struct StateMachine {
	config: Arc<Config>,
	gate: Gate,
	stdin: StdinBroker,

	task: Option<Task>,

	/// When a reload was requested; set exactly while a reload is pending.
	reload_request: Option<Instant>,

	/// Raised by the reaper when the current task ends; lowered on clear.
	done: Flag,

	reprocess: mpsc::Sender<()>,
}

impl StateMachine {
	/// Returns the state machine and the wake-up channel the coordinator
	/// must select on.
	pub(crate) fn new(
		config: Arc<Config>,
		gate: Gate,
		stdin: StdinBroker,
	) -> (Self, mpsc::Receiver<()>) {
		let (reprocess, reprocess_rx) = mpsc::channel(1);
		(
			Self {
				config,
				gate,
				stdin,
				task: None,
				reload_request: None,
				done: Flag::default(),
				reprocess,
			},
			reprocess_rx,
		)
	}

	pub(crate) fn running(&self) -> bool {
		self.task.is_some() && !self.done.raised()
	}

	/// Whether a reload has been requested and not yet completed.
	pub(crate) fn pending_close(&self) -> bool {
		self.reload_request.is_some()
	}

	fn past_change(&self) -> bool {
		self.reload_request
			.is_some_and(|at| at.elapsed() >= self.config.change_timeout)
	}

	fn past_kill(&self) -> bool {
		self.reload_request.is_some_and(|at| {
			at.elapsed() >= self.config.change_timeout + self.config.kill_timeout
		})
	}

	/// Runs one step and says whether it must be rerun before blocking.
	pub(crate) async fn execute(&mut self) -> Result<bool, CriticalError> {
		if self.task.is_none() {
			self.start_task().await?;
			return Ok(false);
		}

		if self.pending_close() && self.past_change() && self.done.raised() {
			self.clear();
			return Ok(true);
		}

		if self.pending_close() && !self.done.raised() {
			self.close_task().await;
		}

		Ok(false)
	}

	async fn start_task(&mut self) -> Result<(), CriticalError> {
		let task = Task::spawn(
			&self.config,
			&self.stdin,
			self.done.clone(),
			self.reprocess.clone(),
		)
		.await?;
		self.task = Some(task);

		// The new backend is on its way up: queued requests can go through
		// to the connector's retry loop now.
		self.gate.open();
		Ok(())
	}

	async fn close_task(&mut self) {
		if !self.past_change() {
			return;
		}

		let Some(task) = &self.task else { return };
		if !self.past_kill() {
			task.interrupt().await;
		} else {
			task.kill().await;
		}
	}

	/// Resets the slot once a task has completed running.
	fn clear(&mut self) {
		trace!("task slot cleared");
		self.task = None;
		self.done.lower();
		self.reload_request = None;
	}

	/// Requests a reload of the task.
	///
	/// At most one reload may be pending; the coordinator checks
	/// [`pending_close`](Self::pending_close) first, so a second request is
	/// a bug and comes back as an error.
	///
	/// The debounce is anchored here, on the first change: later changes
	/// while the reload is pending do not move it.
	pub(crate) fn reload(&mut self) -> Result<(), CriticalError> {
		if self.pending_close() {
			return Err(CriticalError::ReloadWhilePending);
		}

		self.reload_request = Some(Instant::now());
		self.gate.close();

		let reprocess = self.reprocess.clone();
		if !self.running() {
			info!("change detected, starting task (task is no longer running)");
			let change_timeout = self.config.change_timeout;
			tokio::spawn(async move {
				sleep(change_timeout).await;
				reprocess.try_send(()).ok();
			});
			return Ok(());
		}

		info!("change detected, restarting task");
		let Some(task) = &self.task else { return Ok(()) };
		let mut ended = task.reload_ended.clone();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = &mut ended => break,
					_ = sleep(RELOAD_TICK) => {
						reprocess.try_send(()).ok();
					}
				}
			}
		});

		Ok(())
	}

	/// Supervisor shutdown: interrupt the task, and kill it if it has not
	/// gone away within the kill timeout.
	pub(crate) async fn close(&mut self, reprocess: &mut mpsc::Receiver<()>) {
		if !self.running() {
			return;
		}

		let Some(task) = &self.task else { return };
		task.interrupt().await;

		let mut ended = task.reload_ended.clone();
		tokio::select! {
			_ = reprocess.recv() => {}
			_ = &mut ended => {}
			_ = sleep(self.config.kill_timeout) => {
				task.kill().await;
				// Make sure the kill lands before the supervisor exits.
				let mut killed = task.reload_ended.clone();
				tokio::time::timeout(Duration::from_secs(1), &mut killed).await.ok();
			}
		}
	}
}
