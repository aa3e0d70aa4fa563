//! Forwards the supervisor's stdin to the live task.
//!
//! Handing the task our stdin directly loses data on reload: a read
//! completes against the dead child's pipe and the bytes are gone. Instead
//! a single background reader pulls chunks into a rendezvous channel, and
//! a per-task forwarder writes them on, stopping when the task exits.
//! Chunks read while no task is alive wait in the channel for the next one.

use std::{io::Read, sync::Arc};

use tokio::{
	io::{AsyncWrite, AsyncWriteExt},
	process::ChildStdin,
	sync::{mpsc, Mutex},
};
use tracing::trace;

use crate::flag::Flag;

const CHUNK_SIZE: usize = 4096;

/// Hands chunks of the supervisor's stdin to one task at a time.
#[derive(Clone, Debug)]
pub(crate) struct StdinBroker {
	chunks: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
}

impl StdinBroker {
	/// Starts the background stdin reader.
	///
	/// The reader is a plain thread: a read against a terminal can block
	/// forever, and must not keep the runtime from shutting down.
	pub(crate) fn new() -> Self {
		let (tx, rx) = mpsc::channel(1);
		std::thread::spawn(move || read_stdin(&tx));
		Self { chunks: Arc::new(Mutex::new(rx)) }
	}

	/// A broker with no reader behind it, for machinery tests.
	#[cfg(test)]
	pub(crate) fn closed() -> Self {
		let (_, rx) = mpsc::channel(1);
		Self { chunks: Arc::new(Mutex::new(rx)) }
	}

	/// Starts forwarding chunks into a freshly spawned task's stdin pipe.
	///
	/// The forwarder closes the pipe when the task exits or stdin hits EOF.
	pub(crate) fn attach(&self, pipe: ChildStdin, exited: Flag) {
		tokio::spawn(forward(self.chunks.clone(), pipe, exited));
	}
}

fn read_stdin(chunks: &mpsc::Sender<Vec<u8>>) {
	let mut input = std::io::stdin();
	let mut buf = vec![0u8; CHUNK_SIZE];
	loop {
		match input.read(&mut buf) {
			// An empty chunk tells the current forwarder stdin is gone.
			Ok(0) | Err(_) => {
				chunks.blocking_send(Vec::new()).ok();
				return;
			}
			Ok(n) => {
				if chunks.blocking_send(buf[..n].to_vec()).is_err() {
					return;
				}
			}
		}
	}
}

async fn forward<W>(chunks: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>, mut pipe: W, exited: Flag)
where
	W: AsyncWrite + Unpin,
{
	// Holding the lock for the task's lifetime is the hand-off: the next
	// task's forwarder takes over once this one returns.
	let mut chunks = chunks.lock().await;
	let mut exited = exited;
	loop {
		tokio::select! {
			chunk = chunks.recv() => match chunk {
				Some(chunk) if !chunk.is_empty() => {
					if pipe.write_all(&chunk).await.is_err() {
						trace!("task stdin pipe closed");
						return;
					}
				}
				// EOF sentinel, or the reader is gone: close the pipe.
				_ => return,
			},
			_ = &mut exited => {
				trace!("task exited, releasing stdin");
				return;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{sync::Arc, time::Duration};

	use tokio::{
		io::{duplex, AsyncReadExt},
		sync::{mpsc, Mutex},
		time::timeout,
	};

	use crate::flag::Flag;

	use super::forward;

	#[tokio::test]
	async fn writes_chunks_to_the_pipe() {
		let (tx, rx) = mpsc::channel(1);
		let chunks = Arc::new(Mutex::new(rx));
		let (pipe, mut other_end) = duplex(64);

		let handle = tokio::spawn(forward(chunks, pipe, Flag::default()));

		tx.send(b"hello".to_vec()).await.unwrap();
		let mut buf = [0u8; 5];
		other_end.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"hello");

		// The EOF sentinel closes the pipe and ends the forwarder.
		tx.send(Vec::new()).await.unwrap();
		timeout(Duration::from_secs(1), handle)
			.await
			.expect("forwarder should stop on EOF")
			.unwrap();
		assert_eq!(other_end.read(&mut buf).await.unwrap(), 0);
	}

	#[tokio::test]
	async fn task_exit_releases_stdin_to_the_next_task() {
		let (tx, rx) = mpsc::channel(1);
		let chunks = Arc::new(Mutex::new(rx));

		let (pipe, mut first_end) = duplex(64);
		let exited = Flag::default();
		let first = tokio::spawn(forward(chunks.clone(), pipe, exited.clone()));

		tx.send(b"one".to_vec()).await.unwrap();
		let mut buf = [0u8; 3];
		first_end.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"one");

		// First task dies; its forwarder must let go of the channel.
		exited.raise();
		timeout(Duration::from_secs(1), first)
			.await
			.expect("forwarder should stop on task exit")
			.unwrap();

		// A chunk sent in between waits for the next forwarder.
		tx.send(b"two".to_vec()).await.unwrap();

		let (pipe, mut second_end) = duplex(64);
		tokio::spawn(forward(chunks, pipe, Flag::default()));
		second_end.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"two");
	}
}
