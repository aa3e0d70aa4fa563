//! Port proxies that hold client traffic across task restarts.
//!
//! Each configured port gets its own listener: TCP proxies pass bytes
//! through, HTTP proxies reverse-proxy requests. Both share a connector that
//! retries the backend dial, and a process-wide [`BackendFlag`] the
//! coordinator raises on every task transition so the next request probes
//! the backend aggressively instead of failing fast.

use std::{
	fmt,
	io,
	num::ParseIntError,
	str::FromStr,
	sync::{Arc, RwLock},
	time::Duration,
};

use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;
use tokio::{
	net::TcpStream,
	sync::mpsc,
	time::{sleep, timeout},
};
use tracing::{debug, trace};

use crate::{error::CriticalError, gate::Gate};

pub mod http;
pub mod tcp;

/// Time allowed for a single backend dial, and the pause between attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Attempts when the backend is believed up.
const PASSIVE_ATTEMPTS: u32 = 10;

/// Attempts while the backend is (re)starting; ~60s at [`RETRY_INTERVAL`].
const ACTIVE_ATTEMPTS: u32 = 300;

/// The kind of proxy to run on a listen port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Kind {
	/// Raw TCP passthrough. The default when a spec names no protocol.
	#[default]
	Tcp,

	/// HTTP reverse proxy, optionally rooted at a path on the target.
	Http,
}

impl FromStr for Kind {
	type Err = ProxySpecError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"" | "tcp" => Ok(Self::Tcp),
			"http" => Ok(Self::Http),
			_ => Err(ProxySpecError::Protocol { proto: s.into() }),
		}
	}
}

impl fmt::Display for Kind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Tcp => f.write_str("tcp"),
			Self::Http => f.write_str("http"),
		}
	}
}

impl<'de> Deserialize<'de> for Kind {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

/// The configuration to forward a single port.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
	/// The port the supervisor listens on.
	pub port: u16,

	/// The port requests are proxied to.
	#[serde(rename = "forwardTo")]
	pub forward_to: u16,

	/// The kind of proxy to use.
	#[serde(rename = "type", default)]
	pub kind: Kind,

	/// The path on the target server to use as the base (HTTP only).
	#[serde(rename = "httpPath", default)]
	pub http_path: String,
}

impl ProxyConfig {
	/// A target path only makes sense for an HTTP proxy.
	pub fn validate(&self) -> Result<(), ProxySpecError> {
		if !self.http_path.is_empty() && self.kind != Kind::Http {
			return Err(ProxySpecError::PathOnTcp { spec: self.to_string() });
		}

		Ok(())
	}
}

impl FromStr for ProxyConfig {
	type Err = ProxySpecError;

	/// Parses a `[proto:]listenPort:forwardPort[/httpPath]` spec.
	fn from_str(spec: &str) -> Result<Self, Self::Err> {
		let parts: Vec<&str> = spec.split(':').collect();
		let (kind, ports) = match parts.len() {
			2 => (Kind::default(), &parts[..]),
			3 => (parts[0].parse()?, &parts[1..]),
			_ => return Err(ProxySpecError::Format { spec: spec.into() }),
		};

		let port = ports[0]
			.parse()
			.map_err(|err| ProxySpecError::Port { spec: spec.into(), err })?;

		let (forward, http_path) = match ports[1].split_once('/') {
			Some((forward, path)) => {
				if kind != Kind::Http {
					return Err(ProxySpecError::PathOnTcp { spec: spec.into() });
				}
				(forward, path.to_string())
			}
			None => (ports[1], String::new()),
		};

		let forward_to = forward
			.parse()
			.map_err(|err| ProxySpecError::Port { spec: spec.into(), err })?;

		Ok(Self { port, forward_to, kind, http_path })
	}
}

impl fmt::Display for ProxyConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}:{}", self.kind, self.port, self.forward_to)?;
		if !self.http_path.is_empty() {
			write!(f, "/{}", self.http_path)?;
		}

		Ok(())
	}
}

/// Errors from parsing or validating a proxy spec.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ProxySpecError {
	#[error("proxy port is not in format [proto:]listen:forward[/path], got {spec:?}")]
	#[diagnostic(code(autobld::proxy::spec))]
	Format { spec: String },

	#[error("unknown proxy protocol {proto:?}, expected tcp or http")]
	#[diagnostic(code(autobld::proxy::protocol))]
	Protocol { proto: String },

	#[error("invalid port in proxy spec {spec:?}: {err}")]
	#[diagnostic(code(autobld::proxy::port))]
	Port {
		spec: String,

		#[source]
		err: ParseIntError,
	},

	#[error("only HTTP proxies can have a target path: {spec:?}")]
	#[diagnostic(code(autobld::proxy::path_on_tcp))]
	PathOnTcp { spec: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BackendState {
	/// A task transition happened; the backend may be down or not yet bound.
	NeedsProbe,

	/// A with-retry dial succeeded since the last transition.
	Verified,
}

/// Process-wide view of whether the backend needs an aggressive reconnect.
///
/// The coordinator marks this needs-probe at the top of every loop
/// iteration; a successful retrying dial marks it verified. Stale reads only
/// cost extra dial attempts, so a plain reader-biased lock is enough.
#[derive(Clone, Debug)]
pub struct BackendFlag(Arc<RwLock<BackendState>>);

impl Default for BackendFlag {
	fn default() -> Self {
		Self(Arc::new(RwLock::new(BackendState::NeedsProbe)))
	}
}

impl BackendFlag {
	pub fn needs_probe(&self) -> bool {
		let state = self.0.read().unwrap_or_else(|err| err.into_inner());
		*state == BackendState::NeedsProbe
	}

	pub fn mark_needs_probe(&self) {
		let mut state = self.0.write().unwrap_or_else(|err| err.into_inner());
		*state = BackendState::NeedsProbe;
	}

	pub fn mark_verified(&self) {
		let mut state = self.0.write().unwrap_or_else(|err| err.into_inner());
		*state = BackendState::Verified;
	}
}

/// Starts the listener task for a proxy config.
pub(crate) fn start(
	config: ProxyConfig,
	backend: BackendFlag,
	gate: Gate,
	errors: mpsc::Sender<CriticalError>,
) {
	debug!(spec=%config, "starting proxy");
	match config.kind {
		Kind::Tcp => {
			tokio::spawn(tcp::serve(config, backend, errors));
		}
		Kind::Http => {
			tokio::spawn(http::serve(config, backend, gate, errors));
		}
	}
}

/// Dials the backend port, retrying on a fixed cadence.
///
/// Without retry this gives the backend ~2s to answer; with retry, ~60s,
/// which covers a slow rebuild. A success under retry marks the flag
/// verified so later requests skip the probe.
pub(crate) async fn connect_port(
	forward_to: u16,
	with_retry: bool,
	backend: &BackendFlag,
) -> io::Result<TcpStream> {
	let attempts = if with_retry { ACTIVE_ATTEMPTS } else { PASSIVE_ATTEMPTS };

	let mut last_err = None;
	for attempt in 0..attempts {
		match timeout(RETRY_INTERVAL, TcpStream::connect(("localhost", forward_to))).await {
			Ok(Ok(conn)) => {
				trace!(port=%forward_to, %attempt, "backend dial succeeded");
				if with_retry {
					backend.mark_verified();
				}
				return Ok(conn);
			}
			Ok(Err(err)) => last_err = Some(err),
			Err(_) => {
				last_err = Some(io::Error::new(
					io::ErrorKind::TimedOut,
					"connection attempt timed out",
				));
			}
		}

		sleep(RETRY_INTERVAL).await;
	}

	let err = last_err
		.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no connection attempts made"));
	debug!(port=%forward_to, %err, "backend dial exhausted retries");
	Err(err)
}
