use core::any::{Any, TypeId};
use core::fmt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;
use crate::handler::{AbstractChain, HandlerChain};
use crate::message::{Message, MessageTag, MessageType};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Dense, zero-based index of a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeIndex(usize);

impl TypeIndex {
    #[inline]
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for TypeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) type Caster<P> = for<'a> fn(&'a dyn Message) -> Option<&'a P>;

pub(crate) struct Subtype<P: ?Sized> {
    pub(crate) index: TypeIndex,
    pub(crate) cast: Caster<P>,
}

impl<P: ?Sized> Clone for Subtype<P> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            cast: self.cast,
        }
    }
}

fn cast_self<M: Message>(msg: &dyn Message) -> Option<&M> {
    msg.downcast_ref::<M>()
}

fn cast_subtype<P: ?Sized + 'static, M: Message + AsRef<P>>(msg: &dyn Message) -> Option<&P> {
    msg.downcast_ref::<M>().map(|m| <M as AsRef<P>>::as_ref(m))
}

struct Subtypes {
    indices: Vec<TypeIndex>,
    // Vec<Subtype<P>> for the parent type this entry is keyed by
    casters: Box<dyn Any + Send + Sync>,
}

struct TypeEntry {
    ty: MessageType,
    new_chain: fn() -> Box<dyn AbstractChain>,
}

#[derive(Default)]
pub struct TypeRegistryBuilder {
    entries: Vec<TypeEntry>,
    indices: HashMap<TypeId, TypeIndex>,
    subtypes: HashMap<TypeId, Subtypes>,
}

impl TypeRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `M`. Registering a type twice keeps its first index.
    pub fn register<M: Message>(mut self) -> Self {
        self.insert::<M>();
        self
    }

    /// Registers `M` and records it as a subtype of `P`.
    ///
    /// `P` can be another message, a plain struct or a trait object; `M`
    /// is viewed as `P` through its `AsRef<P>` implementation.
    pub fn register_subtype<P, M>(mut self) -> Self
    where
        P: ?Sized + 'static,
        M: Message + AsRef<P>,
    {
        let index = self.insert::<M>();
        if TypeId::of::<P>() != TypeId::of::<M>() {
            self.add_subtype::<P>(index, cast_subtype::<P, M>);
        }

        self
    }

    pub fn build(self) -> TypeRegistry {
        let id = NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "type registry {} built with {} message types",
            id,
            self.entries.len()
        );

        TypeRegistry {
            id,
            entries: self.entries,
            indices: self.indices,
            subtypes: self.subtypes,
        }
    }

    fn insert<M: Message>(&mut self) -> TypeIndex {
        let tid = TypeId::of::<M>();
        if let Some(index) = self.indices.get(&tid) {
            return *index;
        }

        let index = TypeIndex(self.entries.len());
        let ty = MessageType::of::<M>();
        log::trace!("register message type {} as {}", ty, index);

        self.entries.push(TypeEntry {
            ty,
            new_chain: HandlerChain::<M>::new_abstract,
        });
        self.indices.insert(tid, index);
        self.add_subtype::<M>(index, cast_self::<M>);

        index
    }

    fn add_subtype<P: ?Sized + 'static>(&mut self, index: TypeIndex, cast: Caster<P>) {
        let entry = self
            .subtypes
            .entry(TypeId::of::<P>())
            .or_insert_with(|| Subtypes {
                indices: Vec::new(),
                casters: Box::new(Vec::<Subtype<P>>::new()),
            });

        if entry.indices.contains(&index) {
            return;
        }

        if let Some(casters) = entry.casters.downcast_mut::<Vec<Subtype<P>>>() {
            casters.push(Subtype { index, cast });
            entry.indices.push(index);
        }
    }
}

/// Closed mapping from message type to a dense index, frozen once built.
pub struct TypeRegistry {
    id: u64,
    entries: Vec<TypeEntry>,
    indices: HashMap<TypeId, TypeIndex>,
    subtypes: HashMap<TypeId, Subtypes>,
}

impl TypeRegistry {
    #[inline]
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::new()
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of registered message types.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn index_of(&self, tid: TypeId) -> Option<TypeIndex> {
        self.indices.get(&tid).copied()
    }

    #[inline]
    pub fn index_of_type(&self, ty: &MessageType) -> Option<TypeIndex> {
        self.index_of(ty.id())
    }

    #[inline]
    pub fn message_type(&self, index: TypeIndex) -> Option<MessageType> {
        self.entries.get(index.get()).map(|e| e.ty)
    }

    pub fn types(&self) -> impl Iterator<Item = (TypeIndex, MessageType)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (TypeIndex(i), e.ty))
    }

    /// Types registered as subtypes of `parent`, in registration order.
    /// A registered message type is listed as its own first subtype.
    pub fn subtypes_of(&self, parent: TypeId) -> &[TypeIndex] {
        self.subtypes
            .get(&parent)
            .map(|s| s.indices.as_slice())
            .unwrap_or(&[])
    }

    pub fn tag<M: Message>(&self) -> Result<MessageTag, Error> {
        self.index_of(TypeId::of::<M>())
            .map(|index| MessageTag::new(self.id, index))
            .ok_or_else(|| Error::UnknownMessageType(MessageType::of::<M>()))
    }

    pub(crate) fn subtype_casters<P: ?Sized + 'static>(&self) -> Option<&[Subtype<P>]> {
        self.subtypes
            .get(&TypeId::of::<P>())?
            .casters
            .downcast_ref::<Vec<Subtype<P>>>()
            .map(Vec::as_slice)
    }

    #[inline]
    pub(crate) fn new_chain(&self, index: TypeIndex) -> Option<Box<dyn AbstractChain>> {
        self.entries.get(index.get()).map(|e| (e.new_chain)())
    }

    /// Checks that `tag` was issued by this registry for the type `T`.
    #[inline]
    pub(crate) fn check_tag<T: Message>(&self, tag: MessageTag) -> Result<TypeIndex, Error> {
        if tag.registry_id() != self.id {
            return Err(Error::UnknownMessageType(MessageType::of::<T>()));
        }

        let index = tag.index();
        match self.entries.get(index.get()) {
            Some(entry) if entry.ty.id() == TypeId::of::<T>() => Ok(index),
            Some(entry) => Err(Error::MessageTagMismatch(entry.ty, MessageType::of::<T>())),
            None => Err(Error::UnknownMessageType(MessageType::of::<T>())),
        }
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("id", &self.id)
            .field("types", &self.entries.iter().map(|e| e.ty).collect::<Vec<_>>())
            .finish()
    }
}
