use core::fmt;
use std::rc::Rc;

use crate::handler::{handler_addr, ErasedHandler, Handler};
use crate::message::{Message, MessageType};
use crate::registry::TypeIndex;

trait RelayHandler {
    fn relay(&self, msg: &dyn Message) -> bool;
    fn addr(&self) -> *const ();
}

struct TypedRelay<T>(Handler<T>);

impl<T: Message> RelayHandler for TypedRelay<T> {
    fn relay(&self, msg: &dyn Message) -> bool {
        match msg.downcast_ref::<T>() {
            Some(msg) => {
                (self.0)(msg);
                true
            }
            None => false,
        }
    }

    #[inline]
    fn addr(&self) -> *const () {
        handler_addr(&self.0)
    }
}

#[derive(Clone)]
pub struct TypedToken {
    ty: MessageType,
    index: TypeIndex,
    handler: Rc<dyn RelayHandler>,
}

#[derive(Clone)]
pub struct ErasedToken {
    ty: MessageType,
    index: TypeIndex,
    handler: ErasedHandler,
}

#[derive(Clone)]
pub struct CompositeToken {
    children: Rc<[HandlerToken]>,
}

/// Handle returned by the token based subscribe calls; pass it back to
/// [`Bus::unsubscribe_token`](crate::Bus::unsubscribe_token).
///
/// A token keeps the exact callback instance that was put into the handler
/// slot, so removal never hits another subscription, and using a token
/// after it was unsubscribed does nothing.
#[derive(Clone)]
pub enum HandlerToken {
    Typed(TypedToken),
    Erased(ErasedToken),
    Composite(CompositeToken),
}

impl HandlerToken {
    pub(crate) fn typed<T: Message>(ty: MessageType, index: TypeIndex, handler: Handler<T>) -> Self {
        HandlerToken::Typed(TypedToken {
            ty,
            index,
            handler: Rc::new(TypedRelay(handler)),
        })
    }

    pub(crate) fn erased(ty: MessageType, index: TypeIndex, handler: ErasedHandler) -> Self {
        HandlerToken::Erased(ErasedToken { ty, index, handler })
    }

    pub(crate) fn composite(children: Vec<HandlerToken>) -> Self {
        HandlerToken::Composite(CompositeToken {
            children: children.into(),
        })
    }

    /// Calls the wrapped handler directly, bypassing the bus.
    ///
    /// Returns `false` when the message is not of a type this token was
    /// subscribed for.
    pub fn trigger(&self, msg: &dyn Message) -> bool {
        match self {
            HandlerToken::Typed(t) => t.handler.relay(msg),
            HandlerToken::Erased(t) => {
                if msg.message_type_id() != t.ty.id() {
                    return false;
                }

                (t.handler)(msg);
                true
            }
            HandlerToken::Composite(t) => t
                .children
                .iter()
                .find(|c| c.covers(msg))
                .map(|c| c.trigger(msg))
                .unwrap_or(false),
        }
    }

    pub fn message_types(&self) -> Vec<MessageType> {
        let mut out = Vec::new();
        self.visit(&mut |_, ty, _| out.push(ty));
        out
    }

    #[inline]
    pub fn is_composite(&self) -> bool {
        matches!(self, HandlerToken::Composite(_))
    }

    fn covers(&self, msg: &dyn Message) -> bool {
        let tid = msg.message_type_id();
        match self {
            HandlerToken::Typed(t) => t.ty.id() == tid,
            HandlerToken::Erased(t) => t.ty.id() == tid,
            HandlerToken::Composite(t) => t.children.iter().any(|c| c.covers(msg)),
        }
    }

    /// Walks every `(slot, callback identity)` pair held by the token.
    pub(crate) fn visit<F: FnMut(TypeIndex, MessageType, *const ())>(&self, f: &mut F) {
        match self {
            HandlerToken::Typed(t) => f(t.index, t.ty, t.handler.addr()),
            HandlerToken::Erased(t) => f(t.index, t.ty, handler_addr(&t.handler)),
            HandlerToken::Composite(t) => {
                for child in t.children.iter() {
                    child.visit(f);
                }
            }
        }
    }
}

impl fmt::Debug for HandlerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerToken::Typed(t) => write!(f, "HandlerToken::Typed({} at {})", t.ty, t.index),
            HandlerToken::Erased(t) => write!(f, "HandlerToken::Erased({} at {})", t.ty, t.index),
            HandlerToken::Composite(t) => f
                .debug_tuple("HandlerToken::Composite")
                .field(&t.children)
                .finish(),
        }
    }
}
