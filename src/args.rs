//! Command-line interface.

use std::path::PathBuf;

use clap::{error::ErrorKind, ArgAction, Parser, ValueHint};

use crate::proxy::ProxyConfig;

/// Exit code used when help was requested and printed.
const EXIT_HELP: i32 = 64;

/// Watches a source tree, restarts a command on change, and proxies its
/// ports across restarts.
#[derive(Debug, Clone, Parser)]
#[command(name = "autobld", version, after_help = "Example:\n\n  autobld -m '*.go' -p http:8080:9000 -- go run ./cmd/server")]
pub struct Args {
	/// Verbose logging
	///
	/// Use twice for trace-level detail. Setting $RUST_LOG also works, and
	/// takes precedence.
	#[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
	pub verbose: u8,

	/// Turns off all logging except errors
	#[arg(short = 'q', long = "quiet")]
	pub quiet: bool,

	/// Config file path
	///
	/// When set, every other configuration flag is ignored; the YAML file is
	/// the whole configuration.
	#[arg(
		short = 'c',
		long = "config",
		value_name = "PATH",
		value_hint = ValueHint::FilePath,
	)]
	pub config: Option<PathBuf>,

	/// File patterns to match
	///
	/// Shell-style globs checked against the file name of each change. May be
	/// repeated, or given as a comma-separated list.
	#[arg(
		short = 'm',
		long = "match",
		value_name = "PATTERN",
		default_value = "*",
	)]
	pub patterns: Vec<String>,

	/// Directory names to exclude
	///
	/// Directories whose name matches are pruned from watching entirely. May
	/// be repeated, or given as a comma-separated list; the defaults are
	/// always excluded.
	#[arg(
		short = 'x',
		long = "excludeDir",
		value_name = "NAME",
		default_value = ".git,.hg",
	)]
	pub exclude_dirs: Vec<String>,

	/// Directory to run commands in
	///
	/// Also the root of watching. Defaults to the current directory.
	#[arg(
		short = 'd',
		long = "dir",
		value_name = "PATH",
		value_hint = ValueHint::DirPath,
	)]
	pub base_dir: Option<PathBuf>,

	/// Proxy ports, specified as [proto:]listenPort:forwardPort[/httpPath]
	///
	/// proto is tcp (default) or http; httpPath is only valid with http.
	/// May be repeated.
	#[arg(short = 'p', long = "proxy", value_name = "SPEC")]
	pub proxies: Vec<ProxyConfig>,

	/// File to redirect the task's stdout to
	///
	/// The file is truncated every time the task starts.
	#[arg(short = 'o', long = "outFile", value_name = "PATH", value_hint = ValueHint::FilePath)]
	pub out_file: Option<PathBuf>,

	/// File to redirect the task's stderr to
	///
	/// The file is truncated every time the task starts.
	#[arg(long = "errFile", value_name = "PATH", value_hint = ValueHint::FilePath)]
	pub err_file: Option<PathBuf>,

	/// Time to wait after a change is detected before reloading the task
	#[arg(long = "changeTimeout", value_name = "DURATION")]
	pub change_timeout: Option<humantime::Duration>,

	/// Time to wait after an interrupt before killing the task
	#[arg(long = "killTimeout", value_name = "DURATION")]
	pub kill_timeout: Option<humantime::Duration>,

	/// Action and arguments to run
	#[arg(last = true, value_name = "ACTION")]
	pub action: Vec<String>,
}

impl Args {
	/// Parses the command line, exiting with 64 if help was printed and 1
	/// on a usage error.
	pub fn parse_or_exit() -> Self {
		match Self::try_parse() {
			Ok(args) => args,
			Err(err) => {
				let code = match err.kind() {
					ErrorKind::DisplayHelp => EXIT_HELP,
					ErrorKind::DisplayVersion => 0,
					_ => 1,
				};
				err.print().ok();
				std::process::exit(code);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use clap::Parser;

	use super::Args;

	fn parse(argv: &[&str]) -> Args {
		Args::try_parse_from(argv).expect("args should parse")
	}

	#[test]
	fn action_follows_double_dash() {
		let args = parse(&["autobld", "--", "go", "run", "."]);
		assert_eq!(args.action, vec!["go", "run", "."]);
	}

	#[test]
	fn flags_in_action_position_are_not_parsed() {
		let args = parse(&["autobld", "--", "cargo", "run", "--", "--port", "9000"]);
		assert_eq!(args.action[0], "cargo");
		assert!(args.action.contains(&"--port".to_string()));
	}

	#[test]
	fn pattern_defaults_are_replaced_by_user_values() {
		let args = parse(&["autobld", "--", "make"]);
		assert_eq!(args.patterns, vec!["*"]);

		let args = parse(&["autobld", "-m", "*.go", "-m", "*.tmpl", "--", "make"]);
		assert_eq!(args.patterns, vec!["*.go", "*.tmpl"]);
	}

	#[test]
	fn proxy_specs_parse_inline() {
		let args = parse(&["autobld", "-p", "8080:9000", "-p", "http:8081:9001/api", "--", "make"]);
		assert_eq!(args.proxies.len(), 2);
		assert_eq!(args.proxies[1].http_path, "api");
	}

	#[test]
	fn bad_proxy_spec_is_a_usage_error() {
		assert!(Args::try_parse_from(["autobld", "-p", "nope", "--", "make"]).is_err());
	}

	#[test]
	fn verbosity_counts() {
		assert_eq!(parse(&["autobld", "--", "make"]).verbose, 0);
		assert_eq!(parse(&["autobld", "-v", "-v", "--", "make"]).verbose, 2);
	}

	#[test]
	fn durations_parse_human_style() {
		let args = parse(&["autobld", "--changeTimeout", "250ms", "--", "make"]);
		assert_eq!(
			std::time::Duration::from(args.change_timeout.unwrap()),
			std::time::Duration::from_millis(250)
		);
	}
}
