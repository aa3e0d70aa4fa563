//! Change detection: directory registration and event classification.
//!
//! Every directory under a matcher's roots is registered individually with
//! the OS notification source, and a frozen map from directory to matcher
//! decides which events warrant a reload. Directories created after startup
//! are not picked up; the map does not change at runtime.

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
};

use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::{
	config::{Config, Matcher},
	error::CriticalError,
};

/// A matcher with its basename globs compiled.
#[derive(Debug)]
struct CompiledMatcher {
	/// None means the matcher had no patterns and matches everything.
	globs: Option<GlobSet>,
}

impl CompiledMatcher {
	fn compile(matcher: &Matcher) -> Self {
		if matcher.patterns.is_empty() {
			return Self { globs: None };
		}

		let mut builder = GlobSetBuilder::new();
		for pattern in &matcher.patterns {
			match Glob::new(pattern) {
				Ok(glob) => {
					builder.add(glob);
				}
				// A malformed pattern never matches, and never aborts.
				Err(err) => warn!(%pattern, %err, "ignoring malformed pattern"),
			}
		}

		let globs = builder.build().unwrap_or_else(|err| {
			warn!(%err, "pattern set failed to compile, matching nothing");
			GlobSet::empty()
		});

		Self { globs: Some(globs) }
	}

	fn matches(&self, file_name: &Path) -> bool {
		match &self.globs {
			None => true,
			Some(globs) => globs.is_match(file_name),
		}
	}
}

/// The frozen directory-to-matcher mapping built at startup.
#[derive(Debug)]
pub struct WatchMap {
	dirs: HashMap<PathBuf, usize>,
	matchers: Vec<CompiledMatcher>,
}

impl WatchMap {
	/// Whether an event on the given path should cause a reload.
	///
	/// The decision is purely a function of the map and the path: the
	/// parent directory must be watched, and the file name must clear the
	/// directory's matcher.
	pub fn is_match(&self, path: &Path) -> bool {
		let (Some(dir), Some(file_name)) = (path.parent(), path.file_name()) else {
			return false;
		};

		let matcher = self
			.dirs
			.get(dir)
			.or_else(|| dunce::canonicalize(dir).ok().and_then(|dir| self.dirs.get(&dir)))
			.map(|&index| &self.matchers[index]);

		match matcher {
			None => {
				trace!(?path, "event in unwatched directory");
				false
			}
			Some(matcher) => matcher.matches(Path::new(file_name)),
		}
	}

	/// Whether a directory was registered at setup. Mostly for tests and
	/// debugging; `is_match` is the interesting query.
	pub fn is_watched_dir(&self, dir: &Path) -> bool {
		self.dirs.contains_key(dir)
			|| dunce::canonicalize(dir).map_or(false, |dir| self.dirs.contains_key(&dir))
	}

	pub fn len(&self) -> usize {
		self.dirs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.dirs.is_empty()
	}
}

/// The live watcher. Dropping it stops event delivery.
pub struct Watchman {
	// Held for its side effects; events arrive on the channel given to
	// `setup`.
	_watcher: RecommendedWatcher,
	map: WatchMap,
}

impl Watchman {
	pub fn map(&self) -> &WatchMap {
		&self.map
	}
}

/// Registers every watched directory and returns the live watcher.
///
/// Raw notify events are forwarded on `events`; watcher runtime errors are
/// fatal and go to `errors`.
pub fn setup(
	config: &Config,
	events: mpsc::Sender<notify::Event>,
	errors: mpsc::Sender<CriticalError>,
) -> Result<Watchman, CriticalError> {
	let mut watcher = RecommendedWatcher::new(
		move |result: Result<notify::Event, notify::Error>| match result {
			Ok(event) => {
				trace!(?event, "filesystem event");
				if events.try_send(event).is_err() {
					trace!("dropping filesystem event, channel full or closed");
				}
			}
			Err(err) => {
				errors.try_send(CriticalError::Watcher(err)).ok();
			}
		},
		notify::Config::default(),
	)
	.map_err(wrap_watcher_err)?;

	let mut dirs = HashMap::new();
	let mut matchers = Vec::with_capacity(config.matchers.len());

	for matcher in &config.matchers {
		let index = matchers.len();
		matchers.push(CompiledMatcher::compile(matcher));

		let roots: Vec<PathBuf> = if matcher.dirs.is_empty() {
			vec![config.base_dir.clone()]
		} else {
			matcher.dirs.iter().map(|dir| config.base_dir.join(dir)).collect()
		};

		for root in roots {
			register_tree(&root, matcher, index, &mut watcher, &mut dirs)?;
		}
	}

	trace!(watched = dirs.len(), "registered watch directories");
	Ok(Watchman { _watcher: watcher, map: WatchMap { dirs, matchers } })
}

fn register_tree(
	root: &Path,
	matcher: &Matcher,
	index: usize,
	watcher: &mut RecommendedWatcher,
	dirs: &mut HashMap<PathBuf, usize>,
) -> Result<(), CriticalError> {
	let walk = walkdir::WalkDir::new(root).into_iter().filter_entry(|entry| {
		!(entry.file_type().is_dir()
			&& matcher.exclude_dirs.contains(&*entry.file_name().to_string_lossy()))
	});

	for entry in walk {
		let entry = entry?;
		if !entry.file_type().is_dir() {
			continue;
		}

		let dir = dunce::canonicalize(entry.path())
			.unwrap_or_else(|_| entry.path().to_path_buf());
		watcher
			.watch(&dir, RecursiveMode::NonRecursive)
			.map_err(wrap_watcher_err)?;
		trace!(?dir, "watching directory");
		dirs.insert(dir, index);
	}

	Ok(())
}

/// Annotates descriptor-exhaustion failures with how to raise the limit.
fn wrap_watcher_err(err: notify::Error) -> CriticalError {
	let help = match &err.kind {
		notify::ErrorKind::MaxFilesWatch => {
			Some("you will want to increase your inotify.max_user_watches, see inotify(7)")
		}
		notify::ErrorKind::Io(ioerr) if ioerr.raw_os_error() == Some(24) => {
			Some("too many open files; raise the descriptor limit with ulimit -n or pam_limits(8)")
		}
		notify::ErrorKind::Io(ioerr) if ioerr.raw_os_error() == Some(28) => {
			Some("you will want to increase your inotify.max_user_watches, see inotify(7)")
		}
		_ => None,
	};

	match help {
		Some(help) => CriticalError::FsWatcher { help: help.into(), err },
		None => CriticalError::Watcher(err),
	}
}
