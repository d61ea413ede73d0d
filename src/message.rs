use core::any::{Any, TypeId};
use core::fmt;
use core::hash::{Hash, Hasher};

use crate::error::Error;
use crate::registry::{TypeIndex, TypeRegistry};

/// Runtime handle of a message type.
#[derive(Clone, Copy)]
pub struct MessageType {
    id: TypeId,
    name: &'static str,
}

impl MessageType {
    #[inline]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: core::any::type_name::<T>(),
        }
    }

    #[inline]
    pub fn id(&self) -> TypeId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MessageType {}

impl Hash for MessageType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageType({})", self.name)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Index of a message type inside one particular registry.
///
/// The tag is fixed when the message is built, so the bus reaches the
/// handler slot without any lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageTag {
    registry: u64,
    index: TypeIndex,
}

impl MessageTag {
    #[inline]
    pub(crate) fn new(registry: u64, index: TypeIndex) -> Self {
        Self { registry, index }
    }

    /// Fails with [`Error::UnknownMessageType`] when `M` was never registered.
    #[inline]
    pub fn of<M: Message>(registry: &TypeRegistry) -> Result<Self, Error> {
        registry.tag::<M>()
    }

    #[inline]
    pub fn index(&self) -> TypeIndex {
        self.index
    }

    #[inline]
    pub(crate) fn registry_id(&self) -> u64 {
        self.registry
    }
}

pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    #[inline]
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub trait Message: AsAny + fmt::Debug + 'static {
    fn tag(&self) -> MessageTag;
}

impl dyn Message {
    #[inline]
    pub fn is<T: Message>(&self) -> bool {
        self.as_any().is::<T>()
    }

    #[inline]
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    #[inline]
    pub fn message_type_id(&self) -> TypeId {
        self.as_any().type_id()
    }
}
