use core::any::Any;
use std::rc::Rc;

use crate::message::Message;

/// Compile-time typed callback. Identity is the `Rc` allocation, so keep a
/// clone around to unsubscribe it later.
pub type Handler<T> = Rc<dyn Fn(&T)>;

/// Callback registered through a runtime type handle.
pub type ErasedHandler = Rc<dyn Fn(&dyn Message)>;

/// Wraps a closure into a [`Handler`].
#[inline]
pub fn handler<T: Message, F: Fn(&T) + 'static>(f: F) -> Handler<T> {
    Rc::new(f)
}

#[inline]
pub(crate) fn handler_addr<T: ?Sized>(h: &Rc<T>) -> *const () {
    Rc::as_ptr(h) as *const ()
}

pub(crate) enum Entry<T> {
    Typed(Handler<T>),
    Erased(ErasedHandler),
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        match self {
            Entry::Typed(h) => Entry::Typed(h.clone()),
            Entry::Erased(h) => Entry::Erased(h.clone()),
        }
    }
}

impl<T: Message> Entry<T> {
    #[inline]
    pub(crate) fn call(&self, msg: &T) {
        match self {
            Entry::Typed(h) => h(msg),
            Entry::Erased(h) => h(msg as &dyn Message),
        }
    }

    #[inline]
    fn addr(&self) -> *const () {
        match self {
            Entry::Typed(h) => handler_addr(h),
            Entry::Erased(h) => handler_addr(h),
        }
    }
}

/// Ordered handlers of one message type.
///
/// Entries live in an immutable shared slice that is swapped on every
/// change, so a trigger iterates its own snapshot while handlers mutate
/// the chain.
pub(crate) struct HandlerChain<T> {
    entries: Rc<[Entry<T>]>,
}

impl<T: Message> HandlerChain<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Rc::from(Vec::<Entry<T>>::new()),
        }
    }

    pub(crate) fn new_abstract() -> Box<dyn AbstractChain> {
        Box::new(Self::new())
    }

    #[inline]
    pub(crate) fn snapshot(&self) -> Rc<[Entry<T>]> {
        self.entries.clone()
    }

    pub(crate) fn push(&mut self, entry: Entry<T>) {
        let mut entries = Vec::with_capacity(self.entries.len() + 1);
        entries.extend(self.entries.iter().cloned());
        entries.push(entry);

        self.entries = entries.into();
    }
}

/// Type-erased view of a [`HandlerChain`], one per occupied slot.
pub(crate) trait AbstractChain {
    fn as_any_ref(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn push_erased(&mut self, handler: ErasedHandler);

    /// Removes the last entry with the given identity.
    fn remove(&mut self, addr: *const ()) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Message> AbstractChain for HandlerChain<T> {
    fn as_any_ref(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn push_erased(&mut self, handler: ErasedHandler) {
        self.push(Entry::Erased(handler))
    }

    fn remove(&mut self, addr: *const ()) -> bool {
        let Some(pos) = self.entries.iter().rposition(|e| e.addr() == addr) else {
            return false;
        };

        let mut entries = Vec::with_capacity(self.entries.len() - 1);
        entries.extend(self.entries[..pos].iter().cloned());
        entries.extend(self.entries[pos + 1..].iter().cloned());

        self.entries = entries.into();
        true
    }

    #[inline]
    fn len(&self) -> usize {
        self.entries.len()
    }
}
