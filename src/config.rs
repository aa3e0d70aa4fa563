//! Configuration model, built from flags or a YAML file.

use std::{
	collections::BTreeSet,
	env,
	path::{Path, PathBuf},
	process::Stdio,
	time::Duration,
};

use serde::Deserialize;
use tracing::debug;

use crate::{args::Args, error::CriticalError, proxy::ProxyConfig};

const DEFAULT_EXCLUDE_DIRS: [&str; 2] = [".git", ".hg"];
const DEFAULT_CHANGE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(1);

/// Where a task output stream goes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Sink {
	/// Inherit the supervisor's own stream.
	#[default]
	Inherit,

	/// Write to a file, truncated every time the task starts.
	File(PathBuf),
}

impl Sink {
	fn from_path(path: Option<PathBuf>) -> Self {
		path.map_or(Self::Inherit, Self::File)
	}

	/// Opens the sink for a fresh task launch.
	pub(crate) fn open(&self) -> Result<Stdio, CriticalError> {
		match self {
			Self::Inherit => Ok(Stdio::inherit()),
			Self::File(path) => std::fs::File::create(path)
				.map(Stdio::from)
				.map_err(|err| CriticalError::OutputFile { path: path.clone(), err }),
		}
	}
}

/// A rule binding a set of directories to filename globs and exclusions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Matcher {
	/// Shell-style globs checked against the file name of a change. Empty
	/// means everything matches.
	pub patterns: Vec<String>,

	/// Subpaths of the base directory to watch recursively. Empty means the
	/// base directory itself.
	pub dirs: Vec<PathBuf>,

	/// Directory names pruned from the watch, subtrees included.
	pub exclude_dirs: BTreeSet<String>,
}

/// The normalized configuration; immutable after startup.
#[derive(Debug, Default)]
pub struct Config {
	/// Root of watching and the task's working directory. Absolute.
	pub base_dir: PathBuf,

	/// What to watch; never empty.
	pub matchers: Vec<Matcher>,

	/// Ports to listen on and forward.
	pub proxies: Vec<ProxyConfig>,

	/// The command to run to compile + restart the server.
	pub action: Vec<String>,

	pub stdout: Sink,
	pub stderr: Sink,

	/// Debounce between the first change and reloading the task.
	pub change_timeout: Duration,

	/// Grace after an interrupt before the task is killed.
	pub kill_timeout: Duration,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawConfig {
	base_dir: PathBuf,
	matchers: Vec<RawMatcher>,
	proxy: Vec<ProxyConfig>,
	action: Vec<String>,
	out_file: Option<PathBuf>,
	err_file: Option<PathBuf>,
	#[serde(with = "humantime_serde")]
	change_timeout: Option<Duration>,
	#[serde(with = "humantime_serde")]
	kill_timeout: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawMatcher {
	patterns: Vec<String>,
	dirs: Vec<PathBuf>,
	exclude_dirs: Vec<String>,
}

impl Config {
	/// Builds the configuration from either the config file or the flags.
	pub fn load(args: &Args) -> Result<Self, CriticalError> {
		match &args.config {
			Some(path) => Self::from_file(path),
			None => Self::from_args(args),
		}
	}

	fn from_args(args: &Args) -> Result<Self, CriticalError> {
		let base_dir = match &args.base_dir {
			Some(dir) => dir.clone(),
			None => env::current_dir().map_err(|err| CriticalError::IoError {
				about: "determining working directory",
				err,
			})?,
		};

		// The default exclusions apply on top of whatever was passed.
		let mut exclude_dirs = split_csv(&args.exclude_dirs);
		exclude_dirs.extend(DEFAULT_EXCLUDE_DIRS.iter().map(ToString::to_string));

		let raw = RawConfig {
			base_dir,
			matchers: vec![RawMatcher {
				patterns: split_csv(&args.patterns),
				dirs: Vec::new(),
				exclude_dirs,
			}],
			proxy: args.proxies.clone(),
			action: args.action.clone(),
			out_file: args.out_file.clone(),
			err_file: args.err_file.clone(),
			change_timeout: args.change_timeout.map(Into::into),
			kill_timeout: args.kill_timeout.map(Into::into),
		};

		raw.normalize()
	}

	fn from_file(path: &Path) -> Result<Self, CriticalError> {
		let bytes = std::fs::read_to_string(path)
			.map_err(|err| CriticalError::ConfigRead { path: path.into(), err })?;
		let mut raw: RawConfig = serde_yaml::from_str(&bytes)
			.map_err(|err| CriticalError::ConfigParse { path: path.into(), err })?;

		// A relative baseDir is relative to the config file's location.
		if raw.base_dir.is_relative() {
			let config_dir = path.parent().unwrap_or_else(|| Path::new("."));
			raw.base_dir = config_dir.join(&raw.base_dir);
		}

		raw.normalize()
	}
}

impl RawConfig {
	fn normalize(self) -> Result<Config, CriticalError> {
		if self.action.is_empty() {
			return Err(CriticalError::MissingAction);
		}

		let base_dir = dunce::canonicalize(&self.base_dir).map_err(|err| {
			CriticalError::IoError { about: "resolving base directory", err }
		})?;

		// Default matcher listens for everything under the base directory.
		let raw_matchers = if self.matchers.is_empty() {
			vec![RawMatcher { patterns: vec!["*".into()], ..Default::default() }]
		} else {
			self.matchers
		};

		let matchers = raw_matchers
			.into_iter()
			.map(|m| {
				let exclude_dirs: BTreeSet<String> = if m.exclude_dirs.is_empty() {
					DEFAULT_EXCLUDE_DIRS.iter().map(ToString::to_string).collect()
				} else {
					split_csv(&m.exclude_dirs).into_iter().collect()
				};

				Matcher { patterns: m.patterns, dirs: m.dirs, exclude_dirs }
			})
			.collect();

		for proxy in &self.proxy {
			proxy.validate()?;
		}

		let config = Config {
			base_dir,
			matchers,
			proxies: self.proxy,
			action: self.action,
			stdout: Sink::from_path(self.out_file),
			stderr: Sink::from_path(self.err_file),
			change_timeout: self.change_timeout.unwrap_or(DEFAULT_CHANGE_TIMEOUT),
			kill_timeout: self.kill_timeout.unwrap_or(DEFAULT_KILL_TIMEOUT),
		};

		debug!(?config, "initializing with config");
		Ok(config)
	}
}

/// Splits repeatable flag values that may also be comma-separated lists,
/// e.g. `-m '*.py' -m '*.c'` or `-m '*.py,*.c'`.
fn split_csv(values: &[String]) -> Vec<String> {
	values
		.iter()
		.flat_map(|value| value.split(','))
		.filter(|part| !part.is_empty())
		.map(ToString::to_string)
		.collect()
}

#[cfg(test)]
mod tests {
	use std::{fs, time::Duration};

	use clap::Parser;

	use crate::{args::Args, error::CriticalError};

	use super::{split_csv, Config, Sink};

	fn args(argv: &[&str]) -> Args {
		Args::try_parse_from(argv).expect("args should parse")
	}

	#[test]
	fn splits_repeated_and_comma_separated_values() {
		assert_eq!(
			split_csv(&["*.py,*.c".into(), "*.go".into()]),
			vec!["*.py", "*.c", "*.go"]
		);
		assert_eq!(split_csv(&[]), Vec::<String>::new());
	}

	#[test]
	fn missing_action_is_an_error() {
		let err = Config::load(&args(&["autobld"])).unwrap_err();
		assert!(matches!(err, CriticalError::MissingAction));
	}

	#[test]
	fn flags_build_a_single_matcher_with_default_excludes() {
		let config =
			Config::load(&args(&["autobld", "-m", "*.go,*.tmpl", "-x", "vendor", "--", "make"]))
				.unwrap();

		assert_eq!(config.matchers.len(), 1);
		let matcher = &config.matchers[0];
		assert_eq!(matcher.patterns, vec!["*.go", "*.tmpl"]);
		assert!(matcher.exclude_dirs.contains("vendor"));
		assert!(matcher.exclude_dirs.contains(".git"));
		assert!(matcher.exclude_dirs.contains(".hg"));
		assert_eq!(config.change_timeout, Duration::from_secs(1));
		assert_eq!(config.kill_timeout, Duration::from_secs(1));
		assert_eq!(config.stdout, Sink::Inherit);
	}

	#[test]
	fn timeouts_come_from_flags() {
		let config = Config::load(&args(&[
			"autobld",
			"--changeTimeout",
			"200ms",
			"--killTimeout",
			"2s",
			"--",
			"make",
		]))
		.unwrap();

		assert_eq!(config.change_timeout, Duration::from_millis(200));
		assert_eq!(config.kill_timeout, Duration::from_secs(2));
	}

	#[test]
	fn yaml_config_parses_and_resolves_base_dir() {
		let dir = tempfile::tempdir().unwrap();
		fs::create_dir(dir.path().join("src")).unwrap();
		let config_path = dir.path().join("autobld.yaml");
		fs::write(
			&config_path,
			concat!(
				"baseDir: .\n",
				"action: [go, run, ./cmd/server]\n",
				"changeTimeout: 500ms\n",
				"outFile: out.log\n",
				"matchers:\n",
				"  - patterns: ['*.go']\n",
				"    dirs: [src]\n",
				"proxy:\n",
				"  - port: 8081\n",
				"    forwardTo: 9001\n",
				"    type: http\n",
				"    httpPath: api\n",
			),
		)
		.unwrap();

		let config = Config::from_file(&config_path).unwrap();
		assert_eq!(config.base_dir, dunce::canonicalize(dir.path()).unwrap());
		assert_eq!(config.action, vec!["go", "run", "./cmd/server"]);
		assert_eq!(config.change_timeout, Duration::from_millis(500));
		assert_eq!(config.kill_timeout, Duration::from_secs(1));
		assert_eq!(config.stdout, Sink::File("out.log".into()));

		let matcher = &config.matchers[0];
		assert_eq!(matcher.dirs, vec![std::path::PathBuf::from("src")]);
		assert!(matcher.exclude_dirs.contains(".git"));

		let proxy = &config.proxies[0];
		assert_eq!((proxy.port, proxy.forward_to), (8081, 9001));
		assert_eq!(proxy.http_path, "api");
	}

	#[test]
	fn yaml_http_path_on_tcp_proxy_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let config_path = dir.path().join("autobld.yaml");
		fs::write(
			&config_path,
			concat!(
				"action: [make]\n",
				"proxy:\n",
				"  - port: 8080\n",
				"    forwardTo: 9000\n",
				"    httpPath: api\n",
			),
		)
		.unwrap();

		assert!(matches!(
			Config::from_file(&config_path),
			Err(CriticalError::ProxySpec(_))
		));
	}

	#[test]
	fn empty_matcher_list_gets_wildcard_default() {
		let config = Config::load(&args(&["autobld", "--", "make"])).unwrap();
		assert_eq!(config.matchers.len(), 1);
		assert_eq!(config.matchers[0].patterns, vec!["*"]);
	}
}
