//! Error types for the supervisor.
//!
//! Everything here is fatal: errors travel on a single channel to the
//! coordinator, which reports them and exits. Per-request proxy failures and
//! child-stop failures are logged where they happen and never reach this type.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::proxy::ProxySpecError;

/// Errors which are not recoverable and stop autobld.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum CriticalError {
	/// No action was given, on the command line or in the config file.
	#[error("no action specified, please specify an action")]
	#[diagnostic(code(autobld::config::missing_action))]
	MissingAction,

	/// A `--proxy` spec or a `proxy:` entry could not be parsed.
	#[error(transparent)]
	#[diagnostic(transparent)]
	ProxySpec(#[from] ProxySpecError),

	/// The config file could not be read.
	#[error("cannot read config file {path:?}: {err}")]
	#[diagnostic(code(autobld::config::read))]
	ConfigRead {
		/// Path given with `--config`.
		path: PathBuf,

		/// The underlying error.
		#[source]
		err: std::io::Error,
	},

	/// The config file could not be parsed.
	#[error("failed to parse config {path:?}: {err}")]
	#[diagnostic(code(autobld::config::parse))]
	ConfigParse {
		/// Path given with `--config`.
		path: PathBuf,

		/// The underlying error.
		#[source]
		err: serde_yaml::Error,
	},

	/// The filesystem watcher could not be created or a directory could not
	/// be registered with it.
	#[error("filesystem watcher: {err}")]
	#[diagnostic(code(autobld::watch::create), help("{help}"))]
	FsWatcher {
		/// Guidance for the operator, mostly about descriptor limits.
		help: String,

		/// The underlying notify error.
		#[source]
		err: notify::Error,
	},

	/// The watcher reported an error at runtime.
	#[error("watcher error: {0}")]
	#[diagnostic(code(autobld::watch::runtime))]
	Watcher(#[source] notify::Error),

	/// Walking a watched directory tree failed during setup.
	#[error("walk directories failed: {0}")]
	#[diagnostic(code(autobld::watch::walk))]
	DirWalk(#[from] walkdir::Error),

	/// The action could not be launched.
	#[error("error starting command: {0}")]
	#[diagnostic(code(autobld::task::spawn))]
	Spawn(#[source] std::io::Error),

	/// The child started but its process group id could not be obtained.
	#[error("task was dead on arrival")]
	#[diagnostic(code(autobld::task::dead_on_arrival))]
	TaskDeadOnArrival,

	/// A stdout/stderr redirect file could not be created.
	#[error("cannot open output file {path:?}: {err}")]
	#[diagnostic(code(autobld::task::output_file))]
	OutputFile {
		/// The sink path from `--outFile` / `--errFile`.
		path: PathBuf,

		/// The underlying error.
		#[source]
		err: std::io::Error,
	},

	/// A proxy listener could not bind its port.
	#[error("proxy cannot listen on port {port}: {err}")]
	#[diagnostic(code(autobld::proxy::listen))]
	ProxyListen {
		/// The configured listen port.
		port: u16,

		/// The underlying error.
		#[source]
		err: std::io::Error,
	},

	/// A proxy accept loop broke.
	#[error("proxy on port {port} stopped accepting: {err}")]
	#[diagnostic(code(autobld::proxy::accept))]
	ProxyAccept {
		/// The configured listen port.
		port: u16,

		/// The underlying error.
		#[source]
		err: std::io::Error,
	},

	/// Generic I/O error, with some context.
	#[error("io({about}): {err}")]
	#[diagnostic(code(autobld::io_error))]
	IoError {
		/// What it was about.
		about: &'static str,

		/// The I/O error which occurred.
		#[source]
		err: std::io::Error,
	},

	/// A reload was requested while one was already pending.
	///
	/// The coordinator checks `pending_close()` before calling `reload()`, so
	/// seeing this is a **bug** and should be reported.
	#[error("internal: reload requested while already waiting for a close")]
	#[diagnostic(code(autobld::task::reload_pending))]
	ReloadWhilePending,
}
