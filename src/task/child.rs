//! The child process handle.
//!
//! The action runs in its own process group so that interrupts and kills
//! reach the whole tree it spawns. The reaper task owns the group child:
//! it waits on the process, applies interventions sent by the state
//! machine, and broadcasts the exit in a fixed order (exited, done,
//! reprocess, reload ended).

use std::process::Stdio;

use command_group::{AsyncCommandGroup, AsyncGroupChild};
#[cfg(unix)]
use command_group::{Signal, UnixChildExt};
use tokio::{process::Command, sync::mpsc};
use tracing::{debug, info, trace, warn};

use crate::{config::Config, error::CriticalError, flag::Flag};

use super::stdin::StdinBroker;

#[derive(Clone, Copy, Debug)]
enum Intervention {
	Interrupt,
	Kill,
}

/// A running task and the handles to stop it.
#[derive(Debug)]
pub(crate) struct Task {
	/// The process-group id recorded at launch.
	pub(crate) id: u32,

	intervene: mpsc::Sender<Intervention>,

	/// Raised once the exit has been fully announced (after the done flag
	/// and the reprocess wake-up).
	pub(crate) reload_ended: Flag,
}

impl Task {
	/// Launches the action and the reaper for it.
	pub(crate) async fn spawn(
		config: &Config,
		stdin: &StdinBroker,
		done: Flag,
		reprocess: mpsc::Sender<()>,
	) -> Result<Self, CriticalError> {
		info!("starting task");
		debug!(action = ?config.action, dir = ?config.base_dir, "launching action");

		let mut command = Command::new(&config.action[0]);
		command
			.args(&config.action[1..])
			.current_dir(&config.base_dir)
			.stdin(Stdio::piped())
			.stdout(config.stdout.open()?)
			.stderr(config.stderr.open()?);

		let mut child = command.group_spawn().map_err(CriticalError::Spawn)?;
		let Some(id) = child.id() else {
			// Without a group id the task cannot be stopped later; better
			// to fail the launch than to leak it.
			child.kill().await.ok();
			return Err(CriticalError::TaskDeadOnArrival);
		};
		debug!(pgid=%id, "task spawned in its own process group");

		// Raised the moment the child exits; the stdin forwarder keys off
		// it to hand the rendezvous back for the next task.
		let exited = Flag::default();
		if let Some(pipe) = child.inner().stdin.take() {
			stdin.attach(pipe, exited.clone());
		}

		let reload_ended = Flag::default();
		let (intervene, interventions) = mpsc::channel(4);
		tokio::spawn(reap(
			child,
			interventions,
			exited,
			done,
			reprocess,
			reload_ended.clone(),
		));

		Ok(Self { id, intervene, reload_ended })
	}

	/// Sends the equivalent of a Ctrl-C to the whole group.
	pub(crate) async fn interrupt(&self) {
		trace!(pgid=%self.id, "requesting interrupt");
		if self.intervene.send(Intervention::Interrupt).await.is_err() {
			trace!("task already reaped");
		}
	}

	/// Forcibly terminates the whole group.
	pub(crate) async fn kill(&self) {
		debug!(pgid=%self.id, "requesting kill");
		if self.intervene.send(Intervention::Kill).await.is_err() {
			trace!("task already reaped");
		}
	}
}

async fn reap(
	mut child: AsyncGroupChild,
	mut interventions: mpsc::Receiver<Intervention>,
	exited: Flag,
	done: Flag,
	reprocess: mpsc::Sender<()>,
	reload_ended: Flag,
) {
	loop {
		tokio::select! {
			status = child.wait() => {
				match status {
					Ok(status) => debug!(?status, "task exited"),
					Err(err) => warn!(%err, "error waiting on task"),
				}
				break;
			}
			Some(intervention) = interventions.recv() => match intervention {
				Intervention::Interrupt => {
					trace!("interrupting task group");
					if let Err(err) = interrupt_group(&mut child) {
						// Not fatal: escalation will kill it instead.
						warn!(%err, "failed to stop task");
					}
				}
				Intervention::Kill => {
					debug!("killing task group");
					if let Err(err) = child.kill().await {
						warn!(%err, "failed to kill task");
					}
				}
			},
		}
	}

	exited.raise();
	done.raise();
	reprocess.send(()).await.ok();
	reload_ended.raise();
}

#[cfg(unix)]
fn interrupt_group(child: &mut AsyncGroupChild) -> std::io::Result<()> {
	child.signal(Signal::SIGINT)
}

#[cfg(windows)]
fn interrupt_group(child: &mut AsyncGroupChild) -> std::io::Result<()> {
	use winapi::um::wincon::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};

	let Some(pgid) = child.id() else {
		return Ok(());
	};

	if unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pgid) } == 0 {
		Err(std::io::Error::last_os_error())
	} else {
		Ok(())
	}
}
