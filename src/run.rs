//! The coordinator: one select loop tying every event source together.

use std::sync::Arc;

use miette::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::{
	args::Args,
	config::Config,
	error::CriticalError,
	gate::Gate,
	proxy::{self, BackendFlag},
	task::{StateMachine, StdinBroker},
	watch,
};

/// Runs autobld until a fatal error or a shutdown signal.
pub async fn run() -> Result<()> {
	let args = Args::parse_or_exit();
	init_logging(&args);

	let config = Arc::new(Config::load(&args)?);
	debug!(version = %env!("CARGO_PKG_VERSION"), "configured");

	// errors carries every fatal condition; events carries raw filesystem
	// notifications for classification here.
	let (errors_tx, mut errors) = mpsc::channel::<CriticalError>(64);
	let (events_tx, mut events) = mpsc::channel::<notify::Event>(1024);

	let watchman = watch::setup(&config, events_tx, errors_tx.clone())?;
	debug!(watched = watchman.map().len(), "change detection ready");

	let backend = BackendFlag::default();
	let gate = Gate::new();
	for proxy_config in &config.proxies {
		proxy::start(proxy_config.clone(), backend.clone(), gate.clone(), errors_tx.clone());
	}

	let mut signals = shutdown_signals()?;
	let stdin = StdinBroker::new();
	let (mut sm, mut reprocess) = StateMachine::new(config.clone(), gate, stdin);

	let result = event_loop(
		&watchman,
		&backend,
		&mut sm,
		&mut reprocess,
		&mut errors,
		&mut events,
		&mut signals,
	)
	.await;

	// Whatever took the loop down, the task must not outlive the
	// supervisor.
	sm.close(&mut reprocess).await;
	result.map_err(Into::into)
}

async fn event_loop(
	watchman: &watch::Watchman,
	backend: &BackendFlag,
	sm: &mut StateMachine,
	reprocess: &mut mpsc::Receiver<()>,
	errors: &mut mpsc::Receiver<CriticalError>,
	events: &mut mpsc::Receiver<notify::Event>,
	signals: &mut mpsc::Receiver<()>,
) -> Result<(), CriticalError> {
	loop {
		// Any change in the task state should make the proxies try
		// reconnecting; they drop this again on a successful dial.
		backend.mark_needs_probe();

		// Drive the state machine until it settles.
		while sm.execute().await? {}

		tokio::select! {
			Some(err) = errors.recv() => {
				return Err(err);
			}
			Some(()) = signals.recv() => {
				info!("shutting down");
				return Ok(());
			}
			Some(event) = events.recv() => {
				let matched = event.paths.iter().any(|path| watchman.map().is_match(path));
				if matched && !sm.pending_close() {
					sm.reload()?;
				}
			}
			Some(()) = reprocess.recv() => {
				trace!("reprocess wake-up");
			}
		}
	}
}

/// `RUST_LOG` takes precedence; otherwise the `-v`/`-q` flags pick the
/// filter.
fn init_logging(args: &Args) {
	if std::env::var("RUST_LOG").is_ok() {
		tracing_subscriber::fmt::try_init().ok();
		return;
	}

	let filter = if args.quiet {
		"autobld=error"
	} else {
		match args.verbose {
			0 => "autobld=info",
			1 => "autobld=debug",
			_ => "autobld=trace",
		}
	};

	tracing_subscriber::fmt().with_env_filter(filter).try_init().ok();
}

/// A channel that receives a unit for every shutdown request from the OS.
#[cfg(unix)]
fn shutdown_signals() -> Result<mpsc::Receiver<()>, CriticalError> {
	use tokio::signal::unix::{signal, SignalKind};

	let mut interrupt = signal(SignalKind::interrupt()).map_err(|err| {
		CriticalError::IoError { about: "setting SIGINT listener", err }
	})?;
	let mut terminate = signal(SignalKind::terminate()).map_err(|err| {
		CriticalError::IoError { about: "setting SIGTERM listener", err }
	})?;

	let (tx, rx) = mpsc::channel(4);
	tokio::spawn(async move {
		loop {
			let sig = tokio::select! {
				_ = interrupt.recv() => "SIGINT",
				_ = terminate.recv() => "SIGTERM",
			};
			debug!(%sig, "received shutdown signal");
			if tx.send(()).await.is_err() {
				break;
			}
		}
	});

	Ok(rx)
}

#[cfg(windows)]
fn shutdown_signals() -> Result<mpsc::Receiver<()>, CriticalError> {
	use tokio::signal::windows::{ctrl_break, ctrl_c};

	let mut interrupt = ctrl_c().map_err(|err| {
		CriticalError::IoError { about: "setting Ctrl-C listener", err }
	})?;
	let mut terminate = ctrl_break().map_err(|err| {
		CriticalError::IoError { about: "setting Ctrl-Break listener", err }
	})?;

	let (tx, rx) = mpsc::channel(4);
	tokio::spawn(async move {
		loop {
			let sig = tokio::select! {
				_ = interrupt.recv() => "Ctrl-C",
				_ = terminate.recv() => "Ctrl-Break",
			};
			debug!(%sig, "received shutdown notification");
			if tx.send(()).await.is_err() {
				break;
			}
		}
	});

	Ok(rx)
}
