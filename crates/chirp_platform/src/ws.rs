#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use futures_util::{Sink, SinkExt as _, Stream, StreamExt as _};
use tungstenite::Message;
use tungstenite::protocol::CloseFrame;
use tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

pub type WsError = tungstenite::Error;

/// Anything that speaks websocket frames. Real sockets and in-memory test
/// sockets both qualify.
pub trait WsStream: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin {}

impl<T> WsStream for T where T: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin {}

pub type BoxWs = Box<dyn WsStream>;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens a websocket for a URL. Injected through transport configs so
/// tests can swap the network for in-memory channels.
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<BoxWs>> + Send + Sync>;

pub fn default_connector() -> WsConnector {
	Arc::new(|url: Url| {
		Box::pin(async move {
			let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
				.await
				.with_context(|| format!("connect_async to {url}"))?;
			Ok(Box::new(ws) as BoxWs)
		})
	})
}

/// Send a close frame and drain until the peer finishes the handshake or
/// `wait` elapses.
pub async fn close_socket(ws: &mut BoxWs, code: CloseCode, reason: &'static str, wait: Duration) {
	let frame = CloseFrame {
		code,
		reason: reason.into(),
	};
	if let Err(e) = ws.send(Message::Close(Some(frame))).await {
		tracing::debug!(error = %e, "close frame not sent");
		return;
	}

	let drained = tokio::time::timeout(wait, async {
		while let Some(frame) = ws.next().await {
			if frame.is_err() {
				break;
			}
		}
	})
	.await;

	if drained.is_err() {
		tracing::debug!("peer did not finish close handshake in time");
	}
}

#[cfg(test)]
pub(crate) mod testing {
	//! In-memory sockets for driving transports from tests.

	use std::pin::Pin;
	use std::sync::Arc;
	use std::task::{Context, Poll};

	use futures_util::{Sink, Stream};
	use parking_lot::Mutex;
	use tokio::sync::mpsc;
	use tokio::time::Instant;
	use tungstenite::Message;
	use tungstenite::protocol::CloseFrame;
	use url::Url;

	use super::{BoxWs, WsConnector, WsError};

	pub(crate) struct MockWs {
		inbound: mpsc::UnboundedReceiver<Result<Message, WsError>>,
		outbound: mpsc::UnboundedSender<Message>,
	}

	impl Stream for MockWs {
		type Item = Result<Message, WsError>;

		fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
			self.inbound.poll_recv(cx)
		}
	}

	impl Sink<Message> for MockWs {
		type Error = WsError;

		fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
			Poll::Ready(Ok(()))
		}

		fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
			self.outbound.send(item).map_err(|_| WsError::ConnectionClosed)
		}

		fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
			Poll::Ready(Ok(()))
		}

		fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
			Poll::Ready(Ok(()))
		}
	}

	/// Server side of a [`MockWs`].
	pub(crate) struct MockPeer {
		pub url: Url,
		pub opened_at: Instant,
		to_client: Option<mpsc::UnboundedSender<Result<Message, WsError>>>,
		from_client: mpsc::UnboundedReceiver<Message>,
	}

	impl MockPeer {
		pub(crate) fn send_text(&self, text: &str) {
			if let Some(tx) = &self.to_client {
				let _ = tx.send(Ok(Message::Text(text.to_string().into())));
			}
		}

		pub(crate) fn send(&self, msg: Message) {
			if let Some(tx) = &self.to_client {
				let _ = tx.send(Ok(msg));
			}
		}

		/// Close with a frame, like a well-behaved server.
		pub(crate) fn close_with(&mut self, frame: CloseFrame) {
			self.send(Message::Close(Some(frame)));
			self.to_client = None;
		}

		/// Vanish without a close frame.
		pub(crate) fn drop_connection(&mut self) {
			self.to_client = None;
		}

		pub(crate) async fn next_message(&mut self) -> Option<Message> {
			self.from_client.recv().await
		}

		pub(crate) async fn next_text(&mut self) -> Option<String> {
			loop {
				match self.from_client.recv().await? {
					Message::Text(t) => return Some(t.to_string()),
					Message::Close(_) => return None,
					_ => continue,
				}
			}
		}

		pub(crate) fn try_next(&mut self) -> Option<Message> {
			self.from_client.try_recv().ok()
		}
	}

	pub(crate) fn pair(url: Url) -> (BoxWs, MockPeer) {
		let (to_client, inbound) = mpsc::unbounded_channel();
		let (outbound, from_client) = mpsc::unbounded_channel();
		let ws = MockWs { inbound, outbound };
		let peer = MockPeer {
			url,
			opened_at: Instant::now(),
			to_client: Some(to_client),
			from_client,
		};
		(Box::new(ws), peer)
	}

	/// Connector that hands every new server side to the test.
	pub(crate) fn mock_connector() -> (WsConnector, mpsc::UnboundedReceiver<MockPeer>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let connector: WsConnector = Arc::new(move |url: Url| {
			let tx = tx.clone();
			Box::pin(async move {
				let (ws, peer) = pair(url);
				tx.send(peer).map_err(|_| anyhow::anyhow!("test dropped the peer receiver"))?;
				Ok(ws)
			})
		});
		(connector, rx)
	}

	/// Connector that always fails and records when it was called.
	pub(crate) fn failing_connector() -> (WsConnector, Arc<Mutex<Vec<Instant>>>) {
		let calls = Arc::new(Mutex::new(Vec::new()));
		let seen = calls.clone();
		let connector: WsConnector = Arc::new(move |_url: Url| {
			let seen = seen.clone();
			Box::pin(async move {
				seen.lock().push(Instant::now());
				Err(anyhow::anyhow!("connection refused"))
			})
		});
		(connector, calls)
	}
}
