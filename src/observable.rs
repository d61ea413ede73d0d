//! Reactive style access to the bus.
//!
//! Everything here goes through the regular subscribe and unsubscribe
//! calls of [`Bus`]; no dispatch state lives in this module.

use core::fmt;
use core::marker::PhantomData;
use core::pin::Pin;
use core::task::{Context, Poll};
use futures::channel::mpsc;
use futures::{Stream, StreamExt};

use crate::bus::{Bus, WeakBus};
use crate::error::Error;
use crate::message::Message;
use crate::token::HandlerToken;

/// Keeps a subscription alive; unsubscribes when dropped.
#[must_use = "the handler is unsubscribed as soon as the subscription is dropped"]
pub struct Subscription {
    bus: WeakBus,
    token: Option<HandlerToken>,
}

impl Subscription {
    pub(crate) fn new(bus: WeakBus, token: HandlerToken) -> Self {
        Self {
            bus,
            token: Some(token),
        }
    }

    #[inline]
    pub fn token(&self) -> Option<&HandlerToken> {
        self.token.as_ref()
    }

    /// Unsubscribes now instead of on drop.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keeps the handler subscribed for good and hands back its token.
    pub fn detach(mut self) -> Option<HandlerToken> {
        self.token.take()
    }

    fn release(&mut self) {
        if let (Some(token), Some(bus)) = (self.token.take(), self.bus.upgrade()) {
            bus.unsubscribe_token(&token);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("token", &self.token)
            .finish()
    }
}

/// Observable view of one message type; any number of subscribers.
pub struct Observable<T> {
    bus: Bus,
    _m: PhantomData<fn(&T)>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            _m: PhantomData,
        }
    }
}

impl<T: Message> Observable<T> {
    pub(crate) fn new(bus: Bus) -> Self {
        Self {
            bus,
            _m: PhantomData,
        }
    }

    pub fn subscribe<F: Fn(&T) + 'static>(&self, handler: F) -> Result<Subscription, Error> {
        self.bus.subscribe_scoped::<T, F>(handler)
    }

    /// Owned copies of every message triggered after this call.
    pub fn stream(&self) -> Result<MessageStream<T>, Error>
    where
        T: Clone,
    {
        let (tx, rx) = mpsc::unbounded();
        let subscription = self.subscribe(move |msg: &T| {
            if tx.unbounded_send(msg.clone()).is_err() {
                log::trace!("message stream receiver is gone");
            }
        })?;

        Ok(MessageStream {
            rx,
            _subscription: subscription,
        })
    }
}

/// Stream of messages of one type; unsubscribes when dropped.
pub struct MessageStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
    _subscription: Subscription,
}

impl<T> Stream for MessageStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}
