//! HTTP reverse proxy with request gating.
//!
//! Requests wait on the reload gate before anything else, so a client that
//! arrives mid-restart queues until the new backend is up instead of seeing
//! a transport error.

use std::{convert::Infallible, sync::Arc};

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::{
	body::{Bytes, Incoming},
	header::{self, HeaderMap},
	server::conn::http1,
	service::service_fn,
	Request, Response, StatusCode, Uri,
};
use hyper_util::{
	client::legacy::{connect::HttpConnector, Client},
	rt::{TokioExecutor, TokioIo},
};
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{debug, trace};

use crate::{error::CriticalError, gate::Gate};

use super::{connect_port, BackendFlag, ProxyConfig};

struct HttpProxy {
	forward_to: u16,
	base_path: String,
	backend: BackendFlag,
	gate: Gate,
	client: Client<HttpConnector, Incoming>,
}

pub(super) async fn serve(
	config: ProxyConfig,
	backend: BackendFlag,
	gate: Gate,
	errors: mpsc::Sender<CriticalError>,
) {
	let listener = match TcpListener::bind(("0.0.0.0", config.port)).await {
		Ok(listener) => listener,
		Err(err) => {
			errors
				.send(CriticalError::ProxyListen { port: config.port, err })
				.await
				.ok();
			return;
		}
	};

	listen(listener, config, backend, gate, errors).await;
}

/// Accept loop, separated from the bind so tests can inject a listener.
pub(crate) async fn listen(
	listener: TcpListener,
	config: ProxyConfig,
	backend: BackendFlag,
	gate: Gate,
	errors: mpsc::Sender<CriticalError>,
) {
	let proxy = Arc::new(HttpProxy {
		forward_to: config.forward_to,
		base_path: format!("/{}", config.http_path),
		backend,
		gate,
		client: Client::builder(TokioExecutor::new()).build_http(),
	});

	loop {
		match listener.accept().await {
			Ok((stream, peer)) => {
				trace!(%peer, port=%config.port, "accepted http client");
				let proxy = proxy.clone();
				tokio::spawn(async move {
					let service = service_fn(move |req| {
						let proxy = proxy.clone();
						async move { proxy.handle(req).await }
					});
					if let Err(err) =
						http1::Builder::new().serve_connection(TokioIo::new(stream), service).await
					{
						debug!(%err, "http connection ended with error");
					}
				});
			}
			Err(err) => {
				errors
					.send(CriticalError::ProxyAccept { port: config.port, err })
					.await
					.ok();
				return;
			}
		}
	}
}

impl HttpProxy {
	async fn handle(
		&self,
		req: Request<Incoming>,
	) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
		// Block here while a reload is in flight.
		self.gate.wait_open().await;

		if self.backend.needs_probe() {
			if let Err(err) = connect_port(self.forward_to, true, &self.backend).await {
				// Deliberately a 200 with the error in the body; scripted
				// clients parse this shape.
				return Ok(text_response(
					StatusCode::OK,
					format!("Error connecting to underlying server: {err}"),
				));
			}
		}

		let (mut parts, body) = req.into_parts();
		parts.uri = match target_uri(&self.base_path, self.forward_to, &parts.uri) {
			Ok(uri) => uri,
			Err(err) => {
				return Ok(text_response(
					StatusCode::BAD_GATEWAY,
					format!("Error proxying request: {err}"),
				));
			}
		};
		strip_hop_headers(&mut parts.headers);

		match self.client.request(Request::from_parts(parts, body)).await {
			Ok(resp) => Ok(resp.map(BodyExt::boxed)),
			Err(err) => Ok(text_response(
				StatusCode::BAD_GATEWAY,
				format!("Error proxying request: {err}"),
			)),
		}
	}
}

/// Rewrites a request URI to point at the backend, rooted at the base path.
fn target_uri(base_path: &str, forward_to: u16, uri: &Uri) -> Result<Uri, ::http::Error> {
	let path = single_joining_slash(base_path, uri.path());
	let path_and_query = match uri.query() {
		Some(query) => format!("{path}?{query}"),
		None => path,
	};

	Uri::builder()
		.scheme("http")
		.authority(format!("localhost:{forward_to}"))
		.path_and_query(path_and_query)
		.build()
}

fn single_joining_slash(a: &str, b: &str) -> String {
	match (a.ends_with('/'), b.starts_with('/')) {
		(true, true) => format!("{a}{}", &b[1..]),
		(false, false) => format!("{a}/{b}"),
		_ => format!("{a}{b}"),
	}
}

/// Connection-level headers must not be forwarded.
fn strip_hop_headers(headers: &mut HeaderMap) {
	for name in [
		header::CONNECTION,
		header::HeaderName::from_static("keep-alive"),
		header::HeaderName::from_static("proxy-connection"),
		header::TE,
		header::TRAILER,
		header::TRANSFER_ENCODING,
		header::UPGRADE,
	] {
		headers.remove(name);
	}
}

fn text_response(status: StatusCode, message: String) -> Response<BoxBody<Bytes, hyper::Error>> {
	Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Full::new(Bytes::from(message)).map_err(|never| match never {}).boxed())
		.expect("static response parts are valid")
}

#[cfg(test)]
mod tests {
	use std::{convert::Infallible, time::Duration};

	use http_body_util::{BodyExt, Full};
	use hyper::{
		body::{Bytes, Incoming},
		server::conn::http1,
		service::service_fn,
		Request, Response, StatusCode, Uri,
	};
	use hyper_util::{
		client::legacy::Client,
		rt::{TokioExecutor, TokioIo},
	};
	use tokio::{net::TcpListener, sync::mpsc, time::timeout};

	use crate::{
		gate::Gate,
		proxy::{BackendFlag, Kind, ProxyConfig},
	};

	use super::{single_joining_slash, target_uri};

	#[test]
	fn joins_paths_with_a_single_slash() {
		assert_eq!(single_joining_slash("/", "/foo"), "/foo");
		assert_eq!(single_joining_slash("/api", "/foo"), "/api/foo");
		assert_eq!(single_joining_slash("/api/", "/foo"), "/api/foo");
		assert_eq!(single_joining_slash("/api", "foo"), "/api/foo");
	}

	#[test]
	fn rewrites_uri_to_backend() {
		let uri: Uri = "/foo?q=1".parse().unwrap();
		let target = target_uri("/api", 9001, &uri).unwrap();
		assert_eq!(target.to_string(), "http://localhost:9001/api/foo?q=1");

		let root: Uri = "/".parse().unwrap();
		let target = target_uri("/", 9001, &root).unwrap();
		assert_eq!(target.to_string(), "http://localhost:9001/");
	}

	/// Minimal backend echoing the request path in its body.
	async fn hello_backend() -> u16 {
		let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
		let port = listener.local_addr().unwrap().port();
		tokio::spawn(async move {
			while let Ok((stream, _)) = listener.accept().await {
				tokio::spawn(async move {
					let service = service_fn(|req: Request<Incoming>| async move {
						Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(format!(
							"hello {}",
							req.uri().path()
						)))))
					});
					http1::Builder::new()
						.serve_connection(TokioIo::new(stream), service)
						.await
						.ok();
				});
			}
		});
		port
	}

	async fn start_proxy(backend_port: u16, gate: Gate) -> u16 {
		let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
		let port = listener.local_addr().unwrap().port();
		let config = ProxyConfig {
			port,
			forward_to: backend_port,
			kind: Kind::Http,
			http_path: String::new(),
		};
		let (errors, _errors_rx) = mpsc::channel(4);
		tokio::spawn(super::listen(listener, config, BackendFlag::default(), gate, errors));
		port
	}

	async fn get(port: u16, path: &str) -> (StatusCode, String) {
		let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
		let uri: Uri = format!("http://127.0.0.1:{port}{path}").parse().unwrap();
		let req = Request::builder().uri(uri).body(Full::new(Bytes::new())).unwrap();
		let resp = client.request(req).await.unwrap();
		let status = resp.status();
		let body = resp.into_body().collect().await.unwrap().to_bytes();
		(status, String::from_utf8_lossy(&body).into_owned())
	}

	#[tokio::test]
	async fn forwards_requests_to_backend() {
		let backend_port = hello_backend().await;
		let proxy_port = start_proxy(backend_port, Gate::new()).await;

		let (status, body) = get(proxy_port, "/greet").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body, "hello /greet");
	}

	#[tokio::test]
	async fn closed_gate_queues_requests_until_open() {
		let backend_port = hello_backend().await;
		let gate = Gate::new();
		gate.close();
		let proxy_port = start_proxy(backend_port, gate.clone()).await;

		let request = tokio::spawn(async move { get(proxy_port, "/queued").await });

		// The request must still be parked behind the gate.
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert!(!request.is_finished());

		gate.open();
		let (status, body) = timeout(Duration::from_secs(5), request)
			.await
			.expect("request should complete once the gate opens")
			.unwrap();
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body, "hello /queued");
	}
}
