#![forbid(unsafe_code)]

//! Kind-keyed fan-out of transport events to any number of listeners.
//!
//! Transports own a [`Dispatcher`] and call [`Dispatcher::emit`] from their
//! single event loop. Consumers register either for one kind or for every
//! kind and get back a [`Listener`] they can await on. Delivery order per
//! listener follows emission order.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Receiving end handed to a registered listener.
#[derive(Debug)]
pub struct Listener<E> {
	id: ListenerId,
	rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Listener<E> {
	pub fn id(&self) -> ListenerId {
		self.id
	}

	pub async fn recv(&mut self) -> Option<E> {
		self.rx.recv().await
	}

	pub fn try_recv(&mut self) -> Option<E> {
		self.rx.try_recv().ok()
	}
}

struct Slot<E> {
	id: ListenerId,
	tx: mpsc::UnboundedSender<E>,
}

struct Registry<K, E> {
	by_kind: HashMap<K, Vec<Slot<E>>>,
	wildcard: Vec<Slot<E>>,
}

pub struct Dispatcher<K, E> {
	next_id: AtomicU64,
	registry: Mutex<Registry<K, E>>,
}

impl<K, E> Default for Dispatcher<K, E>
where
	K: Eq + Hash + Clone,
	E: Clone,
{
	fn default() -> Self {
		Self::new()
	}
}

impl<K, E> Dispatcher<K, E>
where
	K: Eq + Hash + Clone,
	E: Clone,
{
	pub fn new() -> Self {
		Self {
			next_id: AtomicU64::new(1),
			registry: Mutex::new(Registry {
				by_kind: HashMap::new(),
				wildcard: Vec::new(),
			}),
		}
	}

	fn slot(&self) -> (Slot<E>, Listener<E>) {
		let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
		let (tx, rx) = mpsc::unbounded_channel();
		(Slot { id, tx }, Listener { id, rx })
	}

	/// Register for a single event kind.
	pub fn listen(&self, kind: K) -> Listener<E> {
		let (slot, listener) = self.slot();
		self.registry.lock().by_kind.entry(kind).or_default().push(slot);
		listener
	}

	/// Register for every event kind.
	pub fn listen_all(&self) -> Listener<E> {
		let (slot, listener) = self.slot();
		self.registry.lock().wildcard.push(slot);
		listener
	}

	/// Returns false when the id was not registered.
	pub fn unlisten(&self, id: ListenerId) -> bool {
		let mut reg = self.registry.lock();
		let before = reg.wildcard.len();
		reg.wildcard.retain(|s| s.id != id);
		let mut removed = reg.wildcard.len() != before;

		for slots in reg.by_kind.values_mut() {
			let before = slots.len();
			slots.retain(|s| s.id != id);
			removed |= slots.len() != before;
		}
		reg.by_kind.retain(|_, slots| !slots.is_empty());
		removed
	}

	/// Deliver `event` to listeners of `kind` and to wildcard listeners.
	///
	/// Listeners whose receiver was dropped are pruned. Returns how many
	/// listeners received the event.
	pub fn emit(&self, kind: &K, event: E) -> usize {
		let mut reg = self.registry.lock();
		let mut delivered = 0;

		if let Some(slots) = reg.by_kind.get_mut(kind) {
			slots.retain(|s| {
				let ok = s.tx.send(event.clone()).is_ok();
				delivered += usize::from(ok);
				ok
			});
			if slots.is_empty() {
				reg.by_kind.remove(kind);
			}
		}

		reg.wildcard.retain(|s| {
			let ok = s.tx.send(event.clone()).is_ok();
			delivered += usize::from(ok);
			ok
		});

		delivered
	}

	pub fn listener_count(&self, kind: &K) -> usize {
		let reg = self.registry.lock();
		reg.by_kind.get(kind).map_or(0, Vec::len) + reg.wildcard.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	enum Kind {
		A,
		B,
	}

	#[test]
	fn emits_to_matching_kind_and_wildcard_only() {
		let d: Dispatcher<Kind, u32> = Dispatcher::new();
		let mut a = d.listen(Kind::A);
		let mut b = d.listen(Kind::B);
		let mut all = d.listen_all();

		assert_eq!(d.emit(&Kind::A, 7), 2);

		assert_eq!(a.try_recv(), Some(7));
		assert_eq!(b.try_recv(), None);
		assert_eq!(all.try_recv(), Some(7));
	}

	#[test]
	fn unlisten_stops_delivery() {
		let d: Dispatcher<Kind, u32> = Dispatcher::new();
		let mut a = d.listen(Kind::A);
		assert!(d.unlisten(a.id()));
		assert!(!d.unlisten(a.id()));

		assert_eq!(d.emit(&Kind::A, 1), 0);
		assert_eq!(a.try_recv(), None);
	}

	#[test]
	fn dropped_listeners_are_pruned() {
		let d: Dispatcher<Kind, u32> = Dispatcher::new();
		let a = d.listen(Kind::A);
		let _keep = d.listen(Kind::A);
		drop(a);

		assert_eq!(d.emit(&Kind::A, 1), 1);
		assert_eq!(d.listener_count(&Kind::A), 1);
	}

	#[tokio::test]
	async fn preserves_emission_order_per_listener() {
		let d: Dispatcher<Kind, u32> = Dispatcher::new();
		let mut all = d.listen_all();
		for i in 0..5 {
			d.emit(if i % 2 == 0 { &Kind::A } else { &Kind::B }, i);
		}
		for i in 0..5 {
			assert_eq!(all.recv().await, Some(i));
		}
	}
}
