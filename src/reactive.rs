//! Reactive primitives shared by hosts, bindings and controllers.
//!
//! A [`Publisher`] fans a value out to its subscribers. A [`Property`] is a
//! value cell with a change publisher. Subscribers are snapshotted before each
//! notification, so a callback may subscribe or unsubscribe while it runs.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

type Callback<T> = Rc<dyn Fn(&T)>;

struct Subscribers<T> {
    next_id: Cell<u64>,
    list: RefCell<Vec<(u64, Callback<T>)>>,
}

impl<T> Subscribers<T> {
    fn remove(&self, id: u64) {
        self.list.borrow_mut().retain(|(sub_id, _)| *sub_id != id);
    }
}

/// Handle returned by every `subscribe`. Dropping it keeps the subscription.
pub struct Subscription {
    cancel: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Subscription {
            cancel: RefCell::new(Some(Box::new(cancel))),
        }
    }

    /// A subscription with nothing to cancel.
    pub fn noop() -> Self {
        Subscription {
            cancel: RefCell::new(None),
        }
    }

    /// Idempotent.
    pub fn unsubscribe(&self) {
        let cancel = self.cancel.borrow_mut().take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.borrow().is_some()
    }
}

/// Subscriptions that are torn down together, e.g. everything created for
/// one rendered region. Clones share the same set.
#[derive(Clone, Default)]
pub struct SubscriptionSet {
    items: Rc<RefCell<Vec<Subscription>>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, subscription: Subscription) {
        self.items.borrow_mut().push(subscription);
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel and forget every subscription. Callbacks run with no borrow held.
    pub fn unsubscribe_all(&self) {
        let drained: Vec<Subscription> = self.items.borrow_mut().drain(..).collect();
        for subscription in drained {
            subscription.unsubscribe();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PUBLISHER
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Publisher<T> {
    inner: Rc<Subscribers<T>>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Publisher {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Publisher<T> {
    pub fn new() -> Self {
        Publisher {
            inner: Rc::new(Subscribers {
                next_id: Cell::new(0),
                list: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> Subscription {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        self.inner.list.borrow_mut().push((id, Rc::new(callback)));

        let weak: Weak<Subscribers<T>> = Rc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(subscribers) = weak.upgrade() {
                subscribers.remove(id);
            }
        })
    }

    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self
            .inner
            .list
            .borrow()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in snapshot {
            callback(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.list.borrow().len()
    }

    pub fn ptr_eq(&self, other: &Publisher<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("subscribers", &self.inner.list.borrow().len())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROPERTY
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Property<T> {
    value: Rc<RefCell<T>>,
    on_change: Publisher<T>,
}

impl<T> Clone for Property<T> {
    fn clone(&self) -> Self {
        Property {
            value: self.value.clone(),
            on_change: self.on_change.clone(),
        }
    }
}

impl<T: Clone + PartialEq + 'static> Property<T> {
    pub fn new(initial: T) -> Self {
        Property {
            value: Rc::new(RefCell::new(initial)),
            on_change: Publisher::new(),
        }
    }

    pub fn get(&self) -> T {
        self.value.borrow().clone()
    }

    /// Store `value` and notify when it differs from the current one.
    pub fn set_value(&self, value: T) {
        {
            let mut current = self.value.borrow_mut();
            if *current == value {
                return;
            }
            *current = value.clone();
        }
        self.on_change.emit(&value);
    }

    pub fn on_change(&self) -> &Publisher<T> {
        &self.on_change
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> Subscription {
        self.on_change.subscribe(callback)
    }

    pub fn ptr_eq(&self, other: &Property<T>) -> bool {
        Rc::ptr_eq(&self.value, &other.value)
    }
}

impl<T: fmt::Debug> fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Property").field(&*self.value.borrow()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_notifies_on_change_only() {
        let prop = Property::new(1);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let _sub = prop.subscribe(move |v| sink.borrow_mut().push(*v));

        prop.set_value(2);
        prop.set_value(2);
        prop.set_value(3);
        assert_eq!(*seen.borrow(), vec![2, 3]);
        assert_eq!(prop.get(), 3);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let publisher: Publisher<u8> = Publisher::new();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let sub = publisher.subscribe(move |_| c.set(c.get() + 1));

        publisher.emit(&0);
        sub.unsubscribe();
        sub.unsubscribe();
        publisher.emit(&0);
        assert_eq!(count.get(), 1);
        assert_eq!(publisher.subscriber_count(), 0);
        assert!(!sub.is_active());
    }

    #[test]
    fn test_subscription_set_tears_down_everything() {
        let prop = Property::new(0);
        let count = Rc::new(Cell::new(0));
        let set = SubscriptionSet::new();
        for _ in 0..3 {
            let c = count.clone();
            set.push(prop.subscribe(move |_| c.set(c.get() + 1)));
        }
        prop.set_value(1);
        assert_eq!(count.get(), 3);

        set.unsubscribe_all();
        prop.set_value(2);
        assert_eq!(count.get(), 3);
        assert!(set.is_empty());
    }

    #[test]
    fn test_callback_may_subscribe_during_emit() {
        let publisher: Publisher<u8> = Publisher::new();
        let inner = publisher.clone();
        let late = Rc::new(RefCell::new(Vec::new()));
        let _sub = publisher.subscribe(move |_| {
            late.borrow_mut().push(inner.subscribe(|_| {}));
        });
        publisher.emit(&1);
        assert_eq!(publisher.subscriber_count(), 2);
    }
}
