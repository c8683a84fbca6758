//! Observable containers the rest of the client coordinates through.
//!
//! A [`ReactiveField`] holds one value; a [`ReactiveList`] holds an ordered
//! collection. Both notify listeners synchronously, in registration order,
//! from a snapshot of the listener list taken before the first call, so a
//! listener that registers or removes listeners never changes who is called
//! for the notification already under way.

use std::cell::RefCell;
use std::rc::Rc;

/// Handle returned by every `listen*` call, used to remove that listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listeners<A: ?Sized> {
    entries: Vec<(ListenerId, Rc<dyn Fn(&A)>)>,
}

impl<A: ?Sized> Listeners<A> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn push(&mut self, id: ListenerId, listener: Rc<dyn Fn(&A)>) {
        self.entries.push((id, listener));
    }

    fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    fn snapshot(&self) -> Vec<Rc<dyn Fn(&A)>> {
        self.entries.iter().map(|(_, l)| l.clone()).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

type Preset<T> = Rc<dyn Fn(T) -> T>;

struct FieldInner<T> {
    value: T,
    preset: Option<Preset<T>>,
    listeners: Listeners<T>,
    next_id: u64,
}

/// A single observable value.
///
/// `set` runs the optional preset transform, stores the result and then calls
/// every listener exactly once with the stored value. Listeners may freely
/// read or set this or any other field; no borrow is held while they run.
pub struct ReactiveField<T> {
    inner: RefCell<FieldInner<T>>,
}

impl<T: Clone + 'static> ReactiveField<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RefCell::new(FieldInner {
                value,
                preset: None,
                listeners: Listeners::new(),
                next_id: 0,
            }),
        }
    }

    /// Install a normalisation step applied to every subsequent `set`.
    pub fn set_preset(&self, preset: impl Fn(T) -> T + 'static) {
        self.inner.borrow_mut().preset = Some(Rc::new(preset));
    }

    pub fn get(&self) -> T {
        self.inner.borrow().value.clone()
    }

    /// Borrow the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.borrow().value)
    }

    pub fn set(&self, value: T) {
        let preset = self.inner.borrow().preset.clone();
        let value = match preset {
            Some(preset) => preset(value),
            None => value,
        };
        let listeners = {
            let mut inner = self.inner.borrow_mut();
            inner.value = value.clone();
            inner.listeners.snapshot()
        };
        for listener in listeners {
            listener(&value);
        }
    }

    pub fn listen(&self, listener: impl Fn(&T) + 'static) -> ListenerId {
        self.register(Rc::new(listener))
    }

    /// Register and immediately call the listener once with the current value.
    pub fn listen_and_replay(&self, listener: impl Fn(&T) + 'static) -> ListenerId {
        let listener: Rc<dyn Fn(&T)> = Rc::new(listener);
        let id = self.register(listener.clone());
        let current = self.get();
        listener(&current);
        id
    }

    fn register(&self, listener: Rc<dyn Fn(&T)>) -> ListenerId {
        let mut inner = self.inner.borrow_mut();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner.listeners.push(id, listener);
        id
    }

    /// Returns false when the listener was already gone.
    pub fn unlisten(&self, id: ListenerId) -> bool {
        self.inner.borrow_mut().listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.borrow().listeners.len()
    }
}

impl<T: Clone + Default + 'static> Default for ReactiveField<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ReactiveField<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ReactiveField")
            .field("value", &inner.value)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

struct ListInner<T> {
    items: Vec<T>,
    on_add: Listeners<T>,
    on_remove: Listeners<T>,
    on_change: Listeners<[T]>,
    next_id: u64,
}

impl<T> ListInner<T> {
    fn next_id(&mut self) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        id
    }
}

/// An observable ordered collection.
///
/// Item listeners see each element added or removed; change listeners see the
/// whole list after every mutation. A bulk `set_all` fans out to item
/// listeners (removals first, then additions) before one change notification.
pub struct ReactiveList<T> {
    inner: RefCell<ListInner<T>>,
}

impl<T: Clone + PartialEq + 'static> ReactiveList<T> {
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(ListInner {
                items: Vec::new(),
                on_add: Listeners::new(),
                on_remove: Listeners::new(),
                on_change: Listeners::new(),
                next_id: 0,
            }),
        }
    }

    pub fn items(&self) -> Vec<T> {
        self.inner.borrow().items.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().items.is_empty()
    }

    pub fn contains(&self, item: &T) -> bool {
        self.inner.borrow().items.contains(item)
    }

    pub fn add(&self, item: T) {
        let (added, changed, items) = {
            let mut inner = self.inner.borrow_mut();
            inner.items.push(item.clone());
            (
                inner.on_add.snapshot(),
                inner.on_change.snapshot(),
                inner.items.clone(),
            )
        };
        for listener in added {
            listener(&item);
        }
        for listener in changed {
            listener(&items);
        }
    }

    /// Remove the first element equal to `item`. Returns false if none matched.
    pub fn remove(&self, item: &T) -> bool {
        let (removed_item, removed, changed, items) = {
            let mut inner = self.inner.borrow_mut();
            let Some(index) = inner.items.iter().position(|i| i == item) else {
                return false;
            };
            let removed_item = inner.items.remove(index);
            (
                removed_item,
                inner.on_remove.snapshot(),
                inner.on_change.snapshot(),
                inner.items.clone(),
            )
        };
        for listener in removed {
            listener(&removed_item);
        }
        for listener in changed {
            listener(&items);
        }
        true
    }

    pub fn set_all(&self, items: Vec<T>) {
        let (old, added, removed, changed) = {
            let mut inner = self.inner.borrow_mut();
            let old = std::mem::replace(&mut inner.items, items.clone());
            (
                old,
                inner.on_add.snapshot(),
                inner.on_remove.snapshot(),
                inner.on_change.snapshot(),
            )
        };
        for item in &old {
            for listener in &removed {
                listener(item);
            }
        }
        for item in &items {
            for listener in &added {
                listener(item);
            }
        }
        for listener in changed {
            listener(&items);
        }
    }

    pub fn clear(&self) {
        self.set_all(Vec::new());
    }

    pub fn listen_add(&self, listener: impl Fn(&T) + 'static) -> ListenerId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id();
        inner.on_add.push(id, Rc::new(listener));
        id
    }

    pub fn listen_remove(&self, listener: impl Fn(&T) + 'static) -> ListenerId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id();
        inner.on_remove.push(id, Rc::new(listener));
        id
    }

    pub fn listen(&self, listener: impl Fn(&[T]) + 'static) -> ListenerId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id();
        inner.on_change.push(id, Rc::new(listener));
        id
    }

    pub fn unlisten(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.borrow_mut();
        inner.on_add.remove(id) || inner.on_remove.remove(id) || inner.on_change.remove(id)
    }
}

impl<T: Clone + PartialEq + 'static> Default for ReactiveList<T> {
    fn default() -> Self {
        Self::new()
    }
}
