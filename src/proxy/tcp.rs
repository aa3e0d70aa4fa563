//! Raw TCP passthrough proxy.

use tokio::{
	io::copy,
	net::{TcpListener, TcpStream},
	sync::mpsc,
};
use tracing::{debug, error, trace};

use crate::error::CriticalError;

use super::{connect_port, BackendFlag, ProxyConfig};

pub(super) async fn serve(
	config: ProxyConfig,
	backend: BackendFlag,
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

	listen(listener, config, backend, errors).await;
}

/// Accept loop, separated from the bind so tests can inject a listener.
pub(crate) async fn listen(
	listener: TcpListener,
	config: ProxyConfig,
	backend: BackendFlag,
	errors: mpsc::Sender<CriticalError>,
) {
	loop {
		match listener.accept().await {
			Ok((client, peer)) => {
				trace!(%peer, port=%config.port, "accepted client");
				let backend = backend.clone();
				let forward_to = config.forward_to;
				tokio::spawn(handle(client, forward_to, backend));
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

async fn handle(client: TcpStream, forward_to: u16, backend: BackendFlag) {
	let conn = match connect_port(forward_to, backend.needs_probe(), &backend).await {
		Ok(conn) => conn,
		Err(err) => {
			// Per-request failure: the client is dropped, the supervisor
			// keeps running.
			error!(port=%forward_to, %err, "dropping client, cannot reach backend");
			return;
		}
	};

	let (mut client_read, mut client_write) = client.into_split();
	let (mut conn_read, mut conn_write) = conn.into_split();

	// Pump both directions and finish with whichever side finishes first;
	// dropping the halves closes both sockets.
	tokio::select! {
		res = copy(&mut client_read, &mut conn_write) => {
			trace!(?res, "client to backend finished");
		}
		res = copy(&mut conn_read, &mut client_write) => {
			trace!(?res, "backend to client finished");
		}
	}

	debug!(port=%forward_to, "client handler done");
}

#[cfg(test)]
mod tests {
	use tokio::{
		io::{AsyncReadExt, AsyncWriteExt},
		net::TcpListener,
		sync::mpsc,
	};

	use crate::proxy::{BackendFlag, Kind, ProxyConfig};

	/// One-connection echo server standing in for the user's backend.
	async fn echo_backend() -> u16 {
		let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
		let port = listener.local_addr().unwrap().port();
		tokio::spawn(async move {
			while let Ok((mut stream, _)) = listener.accept().await {
				tokio::spawn(async move {
					let (mut read, mut write) = stream.split();
					let _ = tokio::io::copy(&mut read, &mut write).await;
				});
			}
		});
		port
	}

	#[tokio::test]
	async fn passes_bytes_both_ways() {
		let backend_port = echo_backend().await;

		let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
		let proxy_addr = listener.local_addr().unwrap();
		let config = ProxyConfig {
			port: proxy_addr.port(),
			forward_to: backend_port,
			kind: Kind::Tcp,
			http_path: String::new(),
		};

		let (errors, _errors_rx) = mpsc::channel(4);
		tokio::spawn(super::listen(listener, config, BackendFlag::default(), errors));

		let mut client = tokio::net::TcpStream::connect(proxy_addr).await.unwrap();
		client.write_all(b"hello\n").await.unwrap();

		let mut buf = [0u8; 6];
		client.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"hello\n");

		// A second client gets its own tunnel.
		let mut client2 = tokio::net::TcpStream::connect(proxy_addr).await.unwrap();
		client2.write_all(b"world\n").await.unwrap();
		client2.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"world\n");
	}
}
