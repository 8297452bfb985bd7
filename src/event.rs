use std::sync::{Arc, Mutex};

pub type SubscriberId = u64;

struct Subscribers<T: ?Sized> {
    last_id: SubscriberId,
    list: Vec<(SubscriberId, Arc<dyn Fn(&T) + Send + Sync>)>,
}

/// A list of callbacks fired together. Callbacks run outside the subscriber lock, so they may
/// subscribe or unsubscribe.
pub struct MulticastEvent<T: ?Sized> {
    subscribers: Mutex<Subscribers<T>>,
}

impl<T: ?Sized> Default for MulticastEvent<T> {
    fn default() -> Self {
        MulticastEvent {
            subscribers: Mutex::new(Subscribers {
                last_id: 0,
                list: vec![],
            }),
        }
    }
}

impl<T: ?Sized> MulticastEvent<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriberId {
        let mut subs = self.subscribers.lock().unwrap();
        subs.last_id += 1;
        let id = subs.last_id;
        subs.list.push((id, Arc::new(callback)));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subs = self.subscribers.lock().unwrap();
        let before = subs.list.len();
        subs.list.retain(|(sub, _)| *sub != id);
        subs.list.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().list.len()
    }

    pub fn fire(&self, arg: &T) {
        let callbacks: Vec<_> = self
            .subscribers
            .lock()
            .unwrap()
            .list
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb(arg);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn subscribe_fire_unsubscribe() {
        let event = MulticastEvent::<u32>::new();
        let sum = Arc::new(AtomicU32::new(0));
        let a = {
            let sum = sum.clone();
            event.subscribe(move |v| {
                sum.fetch_add(*v, Ordering::SeqCst);
            })
        };
        let _b = {
            let sum = sum.clone();
            event.subscribe(move |v| {
                sum.fetch_add(*v * 10, Ordering::SeqCst);
            })
        };
        event.fire(&2);
        assert_eq!(sum.load(Ordering::SeqCst), 22);

        assert!(event.unsubscribe(a));
        assert!(!event.unsubscribe(a));
        event.fire(&1);
        assert_eq!(sum.load(Ordering::SeqCst), 32);
        assert_eq!(event.subscriber_count(), 1);
    }
}
