use core::any::Any;
use core::future::Future;
use core::marker::PhantomData;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use smallvec::SmallVec;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::Error;
use crate::message::{Message, MessageType};
use crate::registry::TypeIndex;

enum Outcome {
    Resolved(Rc<dyn Any>),
    Closed,
}

enum WaiterSlot {
    Idle,
    Parked(Waker),
    Cancelled,
    Gone,
}

struct Waiter {
    slot: WaiterSlot,
    cancel: Option<CancellationToken>,
}

impl Waiter {
    #[inline]
    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, CancellationToken::is_cancelled)
    }

    #[inline]
    fn is_live(&self) -> bool {
        !matches!(self.slot, WaiterSlot::Cancelled | WaiterSlot::Gone) && !self.is_cancelled()
    }
}

struct WaitState {
    outcome: Option<Outcome>,
    waiters: SmallVec<[Waiter; 2]>,
    attached: usize,
}

/// One outstanding "next message of this type" request, shared by every
/// waiter that joined it before it was resolved.
pub(crate) struct PendingWait {
    ty: MessageType,
    state: RefCell<WaitState>,
}

impl PendingWait {
    fn new(ty: MessageType) -> Self {
        Self {
            ty,
            state: RefCell::new(WaitState {
                outcome: None,
                waiters: SmallVec::new(),
                attached: 0,
            }),
        }
    }

    fn attach(&self, cancel: Option<CancellationToken>) -> usize {
        let mut state = self.state.borrow_mut();
        state.waiters.push(Waiter {
            slot: WaiterSlot::Idle,
            cancel,
        });
        state.attached += 1;
        state.waiters.len() - 1
    }

    /// Whether some waiter is still attached and not cancelled.
    fn is_live(&self) -> bool {
        self.state.borrow().waiters.iter().any(Waiter::is_live)
    }

    /// Returns `true` when the last waiter left a wait that is still
    /// unresolved.
    fn detach(&self, waiter: usize) -> bool {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        if let Some(w) = state.waiters.get_mut(waiter) {
            match w.slot {
                WaiterSlot::Gone => (),
                WaiterSlot::Cancelled => w.slot = WaiterSlot::Gone,
                _ => {
                    w.slot = WaiterSlot::Gone;
                    state.attached -= 1;
                }
            }
        }

        state.attached == 0 && state.outcome.is_none()
    }

    /// First outcome wins, later attempts are ignored. Waiters whose token
    /// fired before this call keep their cancellation.
    fn finish(&self, outcome: Outcome) -> bool {
        let wakers: SmallVec<[Waker; 2]> = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            if state.outcome.is_some() {
                return false;
            }

            state.outcome = Some(outcome);

            let mut wakers = SmallVec::new();
            for w in state.waiters.iter_mut() {
                if matches!(w.slot, WaiterSlot::Cancelled | WaiterSlot::Gone) {
                    continue;
                }

                let cancelled = w.is_cancelled();
                let next = if cancelled {
                    state.attached -= 1;
                    WaiterSlot::Cancelled
                } else {
                    WaiterSlot::Idle
                };

                if let WaiterSlot::Parked(waker) = core::mem::replace(&mut w.slot, next) {
                    wakers.push(waker);
                }
            }

            wakers
        };

        for waker in wakers {
            waker.wake();
        }

        true
    }

    fn poll_outcome(
        &self,
        waiter: usize,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Rc<dyn Any>, Error>> {
        let mut state = self.state.borrow_mut();
        if let Some(Waiter {
            slot: WaiterSlot::Cancelled,
            ..
        }) = state.waiters.get(waiter)
        {
            return Poll::Ready(Err(Error::Cancelled));
        }

        match &state.outcome {
            Some(Outcome::Resolved(value)) => return Poll::Ready(Ok(value.clone())),
            Some(Outcome::Closed) => return Poll::Ready(Err(Error::BusClosed)),
            None => (),
        }

        if let Some(w) = state.waiters.get_mut(waiter) {
            let park = match &w.slot {
                WaiterSlot::Parked(old) => !old.will_wake(cx.waker()),
                WaiterSlot::Idle => true,
                WaiterSlot::Cancelled | WaiterSlot::Gone => false,
            };

            if park {
                w.slot = WaiterSlot::Parked(cx.waker().clone());
            }
        }

        Poll::Pending
    }
}

/// Per-bus table of pending waits, at most one per message type.
pub(crate) struct WaitRegistry {
    slots: RefCell<Vec<Option<Rc<PendingWait>>>>,
}

impl WaitRegistry {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            slots: RefCell::new((0..len).map(|_| None).collect()),
        }
    }

    /// Joins the pending wait of `index`, creating it when absent.
    fn join(
        &self,
        index: TypeIndex,
        ty: MessageType,
        cancel: Option<CancellationToken>,
    ) -> Option<(Rc<PendingWait>, usize)> {
        let wait = {
            let mut slots = self.slots.borrow_mut();
            let slot = slots.get_mut(index.get())?;
            slot.get_or_insert_with(|| {
                log::debug!("new pending wait for {}", ty);
                Rc::new(PendingWait::new(ty))
            })
            .clone()
        };

        let waiter = wait.attach(cancel);
        Some((wait, waiter))
    }

    /// Pending wait of `index` that still has a waiter to deliver to. A
    /// wait left only with cancelled waiters is dropped from its slot.
    pub(crate) fn peek(&self, index: TypeIndex) -> Option<Rc<PendingWait>> {
        let wait = self.slots.borrow().get(index.get()).and_then(Clone::clone)?;
        if wait.is_live() {
            return Some(wait);
        }

        log::debug!("pending wait for {} dropped, every waiter cancelled", wait.ty);
        self.forget(index, &wait);
        None
    }

    #[inline]
    pub(crate) fn is_waiting(&self, index: TypeIndex) -> bool {
        match self.slots.borrow().get(index.get()) {
            Some(Some(wait)) => wait.is_live(),
            _ => false,
        }
    }

    /// Removes `wait` from its slot unless the slot already moved on to a
    /// newer wait.
    fn forget(&self, index: TypeIndex, wait: &Rc<PendingWait>) {
        let mut slots = self.slots.borrow_mut();
        if let Some(slot) = slots.get_mut(index.get()) {
            if slot.as_ref().map(|w| Rc::ptr_eq(w, wait)).unwrap_or(false) {
                *slot = None;
            }
        }
    }

    pub(crate) fn complete(&self, index: TypeIndex, wait: &Rc<PendingWait>, value: Rc<dyn Any>) {
        self.forget(index, wait);
        if wait.finish(Outcome::Resolved(value)) {
            log::debug!("pending wait for {} resolved", wait.ty);
        }
    }
}

impl Drop for WaitRegistry {
    fn drop(&mut self) {
        for wait in self.slots.get_mut().drain(..).flatten() {
            log::debug!("pending wait for {} closed with the bus", wait.ty);
            wait.finish(Outcome::Closed);
        }
    }
}

enum WaitInner {
    Failed(Error),
    Waiting {
        registry: Weak<WaitRegistry>,
        index: TypeIndex,
        wait: Rc<PendingWait>,
        waiter: usize,
        cancel: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    },
    Done,
}

/// Future returned by [`Bus::get_message`](crate::Bus::get_message).
///
/// Resolves with the next triggered message of type `T`. Waiters that are
/// pending at the same time share the same message instance. Cancelling or
/// dropping one waiter leaves the others untouched.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct MessageWait<T> {
    inner: WaitInner,
    _m: PhantomData<fn() -> T>,
}

impl<T: Message> MessageWait<T> {
    pub(crate) fn new(
        registry: &Rc<WaitRegistry>,
        index: TypeIndex,
        cancel: Option<CancellationToken>,
    ) -> Self {
        let inner = match registry.join(index, MessageType::of::<T>(), cancel.clone()) {
            Some((wait, waiter)) => WaitInner::Waiting {
                registry: Rc::downgrade(registry),
                index,
                wait,
                waiter,
                cancel: cancel.map(|c| Box::pin(c.cancelled_owned())),
            },
            None => WaitInner::Failed(Error::UnknownMessageType(MessageType::of::<T>())),
        };

        Self {
            inner,
            _m: PhantomData,
        }
    }

    pub(crate) fn failed(err: Error) -> Self {
        Self {
            inner: WaitInner::Failed(err),
            _m: PhantomData,
        }
    }
}

impl<T> MessageWait<T> {
    fn detach(&mut self) {
        if let WaitInner::Waiting {
            registry,
            index,
            wait,
            waiter,
            ..
        } = &self.inner
        {
            if wait.detach(*waiter) {
                if let Some(registry) = registry.upgrade() {
                    registry.forget(*index, wait);
                }
            }
        }

        self.inner = WaitInner::Done;
    }
}

impl<T: Message> Future for MessageWait<T> {
    type Output = Result<Rc<T>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let outcome = match &mut this.inner {
            WaitInner::Failed(err) => Poll::Ready(Err(err.clone())),
            WaitInner::Done => panic!("MessageWait polled after completion"),
            WaitInner::Waiting {
                wait,
                waiter,
                cancel,
                ..
            } => match wait.poll_outcome(*waiter, cx) {
                Poll::Ready(res) => {
                    let ty = wait.ty;
                    Poll::Ready(res.and_then(|value| {
                        value
                            .downcast::<T>()
                            .map_err(|_| Error::MessageTagMismatch(ty, MessageType::of::<T>()))
                    }))
                }

                Poll::Pending => {
                    let cancelled = cancel
                        .as_mut()
                        .map(|c| c.as_mut().poll(cx).is_ready())
                        .unwrap_or(false);

                    if cancelled {
                        log::debug!("wait for {} cancelled", wait.ty);
                        Poll::Ready(Err(Error::Cancelled))
                    } else {
                        Poll::Pending
                    }
                }
            },
        };

        match &outcome {
            Poll::Ready(Err(Error::Cancelled)) => this.detach(),
            Poll::Ready(_) => this.inner = WaitInner::Done,
            Poll::Pending => (),
        }

        outcome
    }
}

impl<T> Drop for MessageWait<T> {
    fn drop(&mut self) {
        self.detach();
    }
}
