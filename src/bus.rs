use core::any::{Any, TypeId};
use core::fmt;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::handler::{handler_addr, AbstractChain, Entry, ErasedHandler, Handler, HandlerChain};
use crate::message::{Message, MessageTag, MessageType};
use crate::observable::{Observable, Subscription};
use crate::registry::{TypeIndex, TypeRegistry};
use crate::token::HandlerToken;
use crate::wait::{MessageWait, WaitRegistry};

pub(crate) struct BusInner {
    registry: Arc<TypeRegistry>,
    slots: RefCell<Vec<Option<Box<dyn AbstractChain>>>>,
    waits: Rc<WaitRegistry>,
}

impl BusInner {
    fn new(registry: Arc<TypeRegistry>) -> Self {
        let len = registry.len();

        Self {
            slots: RefCell::new((0..len).map(|_| None).collect()),
            waits: Rc::new(WaitRegistry::new(len)),
            registry,
        }
    }

    #[inline]
    fn index_of<T: ?Sized + 'static>(&self) -> Result<TypeIndex, Error> {
        self.registry
            .index_of(TypeId::of::<T>())
            .ok_or_else(|| Error::UnknownMessageType(MessageType::of::<T>()))
    }

    #[inline]
    fn message_type(&self, index: TypeIndex) -> Option<MessageType> {
        self.registry.message_type(index)
    }

    fn push<T: Message>(&self, index: TypeIndex, entry: Entry<T>) -> Result<(), Error> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots
            .get_mut(index.get())
            .ok_or_else(|| Error::UnknownMessageType(MessageType::of::<T>()))?;

        let chain = slot.get_or_insert_with(HandlerChain::<T>::new_abstract);
        match chain.as_any_mut().downcast_mut::<HandlerChain<T>>() {
            Some(chain) => {
                chain.push(entry);
                Ok(())
            }
            None => Err(self.mismatch::<T>(index)),
        }
    }

    fn mismatch<T: Message>(&self, index: TypeIndex) -> Error {
        let actual = MessageType::of::<T>();
        Error::MessageTagMismatch(self.message_type(index).unwrap_or(actual), actual)
    }

    fn push_erased(
        &self,
        index: TypeIndex,
        ty: MessageType,
        handler: ErasedHandler,
    ) -> Result<(), Error> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots
            .get_mut(index.get())
            .ok_or(Error::UnknownMessageType(ty))?;

        if slot.is_none() {
            *slot = self.registry.new_chain(index);
        }

        match slot {
            Some(chain) => {
                chain.push_erased(handler);
                Ok(())
            }
            None => Err(Error::UnknownMessageType(ty)),
        }
    }

    fn remove(&self, index: TypeIndex, addr: *const ()) -> bool {
        let mut slots = self.slots.borrow_mut();
        let Some(slot) = slots.get_mut(index.get()) else {
            return false;
        };

        let removed = match slot {
            Some(chain) => chain.remove(addr),
            None => false,
        };

        if slot.as_ref().map(|c| c.is_empty()).unwrap_or(false) {
            *slot = None;
        }

        removed
    }

    fn remove_token(&self, token: &HandlerToken) {
        token.visit(&mut |index, ty, addr| {
            if self.remove(index, addr) {
                log::trace!("unsubscribed token handler of {}", ty);
            }
        });
    }

    /// Current chain of `index`, to be invoked after the borrow is released.
    #[inline]
    fn snapshot<T: Message>(&self, index: TypeIndex) -> Result<Option<Rc<[Entry<T>]>>, Error> {
        let slots = self.slots.borrow();
        match slots.get(index.get()).and_then(Option::as_deref) {
            Some(chain) => match chain.as_any_ref().downcast_ref::<HandlerChain<T>>() {
                Some(chain) => Ok(Some(chain.snapshot())),
                None => Err(self.mismatch::<T>(index)),
            },
            None => Ok(None),
        }
    }

    fn handler_count(&self, index: TypeIndex) -> usize {
        self.slots
            .borrow()
            .get(index.get())
            .and_then(Option::as_deref)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

/// Synchronous message bus.
///
/// The bus is a cheap handle: clones share the same handler table and
/// pending waits, which lets handlers capture it and subscribe,
/// unsubscribe or trigger while a trigger is running. It is bound to the
/// thread that created it.
///
/// A handler that owns a `Bus` clone keeps the bus alive for as long as
/// it stays subscribed, so the bus is never dropped and its pending waits
/// never close. Handlers that outlive their owner should capture a
/// [`WeakBus`] from [`Bus::downgrade`] instead.
#[derive(Clone)]
pub struct Bus {
    inner: Rc<BusInner>,
}

/// Non-owning handle to a [`Bus`].
#[derive(Clone)]
pub struct WeakBus {
    inner: Weak<BusInner>,
}

impl WeakBus {
    /// The bus, unless every [`Bus`] handle was dropped.
    #[inline]
    pub fn upgrade(&self) -> Option<Bus> {
        self.inner.upgrade().map(|inner| Bus { inner })
    }
}

impl fmt::Debug for WeakBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakBus")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl Bus {
    /// Allocates the handler table and the pending waits for every type in
    /// `registry`. Both keep that size for the lifetime of the bus.
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        log::debug!(
            "new bus over registry {} ({} message types)",
            registry.id(),
            registry.len()
        );

        Self {
            inner: Rc::new(BusInner::new(registry)),
        }
    }

    #[inline]
    pub fn downgrade(&self) -> WeakBus {
        WeakBus {
            inner: Rc::downgrade(&self.inner),
        }
    }

    #[inline]
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.inner.registry
    }

    #[inline]
    pub fn tag<M: Message>(&self) -> Result<MessageTag, Error> {
        self.inner.registry.tag::<M>()
    }

    /// Appends `handler` to the chain of `T`.
    ///
    /// Keep a clone of `handler` to remove it with [`Bus::unsubscribe`].
    /// The same handler can be subscribed several times, it then runs once
    /// per subscription.
    pub fn subscribe<T: Message>(&self, handler: Handler<T>) -> Result<(), Error> {
        let index = self.inner.index_of::<T>()?;
        self.inner.push(index, Entry::Typed(handler))?;

        log::trace!("subscribed handler to {}", MessageType::of::<T>());
        Ok(())
    }

    /// Like [`Bus::subscribe`], but returns a token for removal instead of
    /// relying on handler identity.
    pub fn subscribe_token<T, F>(&self, handler: F) -> Result<HandlerToken, Error>
    where
        T: Message,
        F: Fn(&T) + 'static,
    {
        let index = self.inner.index_of::<T>()?;
        let handler: Handler<T> = Rc::new(handler);
        self.inner.push(index, Entry::Typed(handler.clone()))?;

        log::trace!("subscribed token handler to {}", MessageType::of::<T>());
        Ok(HandlerToken::typed(MessageType::of::<T>(), index, handler))
    }

    /// Subscribes through a runtime type handle.
    ///
    /// The handler shares the slot with the typed handlers of the same
    /// type and runs in subscription order among them.
    pub fn subscribe_dyn<F>(&self, ty: MessageType, handler: F) -> Result<HandlerToken, Error>
    where
        F: Fn(&dyn Message) + 'static,
    {
        let index = self
            .inner
            .registry
            .index_of_type(&ty)
            .ok_or(Error::UnknownMessageType(ty))?;

        let ty = self.inner.message_type(index).unwrap_or(ty);
        let handler: ErasedHandler = Rc::new(handler);
        self.inner.push_erased(index, ty, handler.clone())?;

        log::trace!("subscribed erased handler to {}", ty);
        Ok(HandlerToken::erased(ty, index, handler))
    }

    /// Subscribes `handler` to every type registered as a subtype of `P`
    /// at the time of the call; types registered as `P` themselves are
    /// included. One [`Bus::unsubscribe_token`] removes all of them.
    pub fn subscribe_children<P, F>(&self, handler: F) -> Result<HandlerToken, Error>
    where
        P: ?Sized + 'static,
        F: Fn(&P) + 'static,
    {
        let subtypes = self
            .inner
            .registry
            .subtype_casters::<P>()
            .ok_or_else(|| Error::UnknownMessageType(MessageType::of::<P>()))?;

        let handler = Rc::new(handler);
        let mut children = Vec::with_capacity(subtypes.len());

        for sub in subtypes {
            let cast = sub.cast;
            let handler = handler.clone();
            let erased: ErasedHandler = Rc::new(move |msg: &dyn Message| {
                if let Some(msg) = cast(msg) {
                    handler(msg)
                }
            });

            let ty = self
                .inner
                .message_type(sub.index)
                .ok_or_else(|| Error::UnknownMessageType(MessageType::of::<P>()))?;

            self.inner.push_erased(sub.index, ty, erased.clone())?;
            children.push(HandlerToken::erased(ty, sub.index, erased));
        }

        log::trace!(
            "subscribed handler to {} subtypes of {}",
            children.len(),
            MessageType::of::<P>()
        );

        Ok(HandlerToken::composite(children))
    }

    /// Removes the most recent subscription of `handler` for `T`. Removing
    /// a handler that is not subscribed does nothing.
    pub fn unsubscribe<T: Message>(&self, handler: &Handler<T>) -> Result<(), Error> {
        let index = self.inner.index_of::<T>()?;
        if self.inner.remove(index, handler_addr(handler)) {
            log::trace!("unsubscribed handler from {}", MessageType::of::<T>());
        }

        Ok(())
    }

    /// Removes everything `token` subscribed. Stale tokens are ignored.
    pub fn unsubscribe_token(&self, token: &HandlerToken) {
        self.inner.remove_token(token)
    }

    /// Runs every handler of the message type in subscription order, then
    /// resolves the pending wait for that type, if any. A wait started by
    /// one of those handlers is resolved by this message too.
    ///
    /// Handlers subscribed or removed while this runs take effect from the
    /// next trigger on. A panicking handler unwinds to the caller; the rest
    /// of the chain and the waiters are skipped for this message.
    pub fn trigger<T: Message>(&self, msg: T) -> Result<(), Error> {
        let index = self.inner.registry.check_tag::<T>(msg.tag())?;
        if let Some(chain) = self.inner.snapshot::<T>(index)? {
            for entry in chain.iter() {
                entry.call(&msg);
            }
        }

        if let Some(wait) = self.inner.waits.peek(index) {
            let value: Rc<dyn Any> = Rc::new(msg);
            self.inner.waits.complete(index, &wait, value);
        }

        Ok(())
    }

    /// Waits for the next triggered message of type `T`.
    ///
    /// The wait is registered right away, not on first poll.
    pub fn get_message<T: Message>(&self) -> MessageWait<T> {
        self.wait_for(None)
    }

    /// Same as [`Bus::get_message`], resolving to [`Error::Cancelled`] once
    /// `cancel` fires before a matching trigger.
    pub fn get_message_cancellable<T: Message>(
        &self,
        cancel: CancellationToken,
    ) -> MessageWait<T> {
        self.wait_for(Some(cancel))
    }

    fn wait_for<T: Message>(&self, cancel: Option<CancellationToken>) -> MessageWait<T> {
        match self.inner.index_of::<T>() {
            Ok(index) => MessageWait::new(&self.inner.waits, index, cancel),
            Err(err) => MessageWait::failed(err),
        }
    }

    /// Subscribes `handler` until the returned guard is dropped.
    pub fn subscribe_scoped<T, F>(&self, handler: F) -> Result<Subscription, Error>
    where
        T: Message,
        F: Fn(&T) + 'static,
    {
        let token = self.subscribe_token::<T, F>(handler)?;
        Ok(Subscription::new(self.downgrade(), token))
    }

    pub fn observe<T: Message>(&self) -> Result<Observable<T>, Error> {
        self.inner.index_of::<T>()?;
        Ok(Observable::new(self.clone()))
    }

    pub fn handler_count<T: Message>(&self) -> Result<usize, Error> {
        let index = self.inner.index_of::<T>()?;
        Ok(self.inner.handler_count(index))
    }

    pub fn is_waiting<T: Message>(&self) -> Result<bool, Error> {
        let index = self.inner.index_of::<T>()?;
        Ok(self.inner.waits.is_waiting(index))
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.inner.slots.borrow();
        f.debug_struct("Bus")
            .field("registry", &self.inner.registry.id())
            .field("types", &slots.len())
            .field("subscribed", &slots.iter().filter(|s| s.is_some()).count())
            .finish()
    }
}
