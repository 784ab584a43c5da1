//! Backend registry: maps persisted [`TypeTag`]s to serialization handlers
//! and factories.
//!
//! Generic code (chunk loading, persistence) goes through the registry so it
//! never has to name a concrete backend. The process-wide registry from
//! [`HandlerRegistry::global`] is populated once with every built-in backend
//! and is read-only afterwards.

use std::marker::PhantomData;
use std::sync::LazyLock;

use rustc_hash::FxHashMap;

use crate::array::{BlockArray, TypeTag};
use crate::dense::DenseArray;
use crate::error::BlockDataError;
use crate::extent::Extent;
use crate::sparse::SparseArray;
use crate::width::{Bits4, Bits8, Bits16, ElementWidth};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Converts one concrete backend to and from its persisted payload.
pub trait SerializationHandler: Send + Sync {
    /// The tag this handler reads and writes.
    fn tag(&self) -> TypeTag;

    /// Returns `true` if payloads stored under `tag` belong to this handler.
    fn can_handle(&self, tag: TypeTag) -> bool {
        tag == self.tag()
    }

    /// Creates an empty array, or one decoded from `raw` when present.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDataError::PayloadLength`] if `raw` does not match the
    /// layout of this backend at `extent`. No partial array is returned.
    fn create_array(
        &self,
        extent: Extent,
        raw: Option<&[u8]>,
    ) -> Result<Box<dyn BlockArray>, BlockDataError>;

    /// Encodes `array` into its payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDataError::HandlerMismatch`] if `array` is not the
    /// backend this handler serves.
    fn serialize(&self, array: &dyn BlockArray) -> Result<Vec<u8>, BlockDataError> {
        if array.type_tag() != self.tag() {
            return Err(BlockDataError::HandlerMismatch {
                expected: self.tag(),
                actual: array.type_tag(),
            });
        }
        let mut bytes = Vec::with_capacity(array.encoded_len());
        array.write_payload(&mut bytes);
        Ok(bytes)
    }
}

/// Produces fresh instances of one concrete backend without naming it.
pub trait ArrayFactory: Send + Sync {
    fn tag(&self) -> TypeTag;

    /// A new array at `extent` holding the backend's default element.
    fn create(&self, extent: Extent) -> Box<dyn BlockArray>;

    /// A handler for the arrays this factory creates.
    fn create_handler(&self) -> Box<dyn SerializationHandler>;
}

// ---------------------------------------------------------------------------
// Built-in backends
// ---------------------------------------------------------------------------

/// Handler for [`DenseArray<W>`]: the payload is the packed buffer.
#[derive(Debug)]
pub struct DenseHandler<W>(PhantomData<W>);

/// Factory for zero-filled [`DenseArray<W>`].
#[derive(Debug)]
pub struct DenseFactory<W>(PhantomData<W>);

/// Handler for [`SparseArray<W>`]: the payload is the column mask encoding.
#[derive(Debug)]
pub struct SparseHandler<W>(PhantomData<W>);

/// Factory for [`SparseArray<W>`] with every column uniformly zero.
#[derive(Debug)]
pub struct SparseFactory<W>(PhantomData<W>);

macro_rules! impl_default {
    ($($name:ident),*) => {
        $(
            impl<W> Default for $name<W> {
                fn default() -> Self {
                    Self(PhantomData)
                }
            }
        )*
    };
}

impl_default!(DenseHandler, DenseFactory, SparseHandler, SparseFactory);

impl<W: ElementWidth> SerializationHandler for DenseHandler<W> {
    fn tag(&self) -> TypeTag {
        W::DENSE_TAG
    }

    fn create_array(
        &self,
        extent: Extent,
        raw: Option<&[u8]>,
    ) -> Result<Box<dyn BlockArray>, BlockDataError> {
        Ok(match raw {
            Some(bytes) => Box::new(DenseArray::<W>::from_bytes(extent, bytes)?),
            None => Box::new(DenseArray::<W>::new(extent)),
        })
    }
}

impl<W: ElementWidth> ArrayFactory for DenseFactory<W> {
    fn tag(&self) -> TypeTag {
        W::DENSE_TAG
    }

    fn create(&self, extent: Extent) -> Box<dyn BlockArray> {
        Box::new(DenseArray::<W>::new(extent))
    }

    fn create_handler(&self) -> Box<dyn SerializationHandler> {
        Box::new(DenseHandler::<W>::default())
    }
}

impl<W: ElementWidth> SerializationHandler for SparseHandler<W> {
    fn tag(&self) -> TypeTag {
        W::SPARSE_TAG
    }

    fn create_array(
        &self,
        extent: Extent,
        raw: Option<&[u8]>,
    ) -> Result<Box<dyn BlockArray>, BlockDataError> {
        Ok(match raw {
            Some(bytes) => Box::new(SparseArray::<W>::from_bytes(extent, bytes)?),
            None => Box::new(SparseArray::<W>::filled(extent, 0)),
        })
    }
}

impl<W: ElementWidth> ArrayFactory for SparseFactory<W> {
    fn tag(&self) -> TypeTag {
        W::SPARSE_TAG
    }

    fn create(&self, extent: Extent) -> Box<dyn BlockArray> {
        Box::new(SparseArray::<W>::filled(extent, 0))
    }

    fn create_handler(&self) -> Box<dyn SerializationHandler> {
        Box::new(SparseHandler::<W>::default())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A backend's persisted form: tag, extent and payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedArray {
    pub tag: TypeTag,
    pub extent: Extent,
    pub bytes: Vec<u8>,
}

struct Registration {
    factory: Box<dyn ArrayFactory>,
    handler: Box<dyn SerializationHandler>,
}

/// Maps [`TypeTag`] → factory and handler.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: FxHashMap<TypeTag, Registration>,
}

static GLOBAL: LazyLock<HandlerRegistry> = LazyLock::new(HandlerRegistry::with_defaults);

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every built-in backend.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(DenseFactory::<Bits4>::default()));
        registry.register(Box::new(DenseFactory::<Bits8>::default()));
        registry.register(Box::new(DenseFactory::<Bits16>::default()));
        registry.register(Box::new(SparseFactory::<Bits4>::default()));
        registry.register(Box::new(SparseFactory::<Bits8>::default()));
        registry.register(Box::new(SparseFactory::<Bits16>::default()));
        tracing::debug!(backends = registry.len(), "block data registry populated");
        registry
    }

    /// The process-wide registry, populated with the built-in backends on
    /// first use.
    pub fn global() -> &'static HandlerRegistry {
        &GLOBAL
    }

    /// Registers `factory` and the handler it creates under the factory's
    /// tag, replacing any earlier registration for that tag.
    pub fn register(&mut self, factory: Box<dyn ArrayFactory>) {
        let tag = factory.tag();
        let handler = factory.create_handler();
        debug_assert!(handler.can_handle(tag), "factory and handler disagree on {tag:?}");
        if self
            .entries
            .insert(tag, Registration { factory, handler })
            .is_some()
        {
            tracing::warn!(?tag, "replaced block data backend registration");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, tag: TypeTag) -> bool {
        self.entries.contains_key(&tag)
    }

    /// Returns the handler registered for `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDataError::MissingHandler`] if nothing is registered.
    pub fn handler(&self, tag: TypeTag) -> Result<&dyn SerializationHandler, BlockDataError> {
        self.entries
            .get(&tag)
            .map(|entry| entry.handler.as_ref())
            .ok_or(BlockDataError::MissingHandler(tag))
    }

    /// Returns the factory registered for `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDataError::MissingHandler`] if nothing is registered.
    pub fn factory(&self, tag: TypeTag) -> Result<&dyn ArrayFactory, BlockDataError> {
        self.entries
            .get(&tag)
            .map(|entry| entry.factory.as_ref())
            .ok_or(BlockDataError::MissingHandler(tag))
    }

    /// Returns the factory of the dense backend `bits` wide.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDataError::UnsupportedBitWidth`] for widths with no
    /// dense backend, or [`BlockDataError::MissingHandler`] if it is not
    /// registered.
    pub fn dense_factory(&self, bits: u8) -> Result<&dyn ArrayFactory, BlockDataError> {
        let tag = TypeTag::dense_for_bits(bits).ok_or(BlockDataError::UnsupportedBitWidth(bits))?;
        self.factory(tag)
    }

    /// Creates an empty array of the backend named by `tag`.
    pub fn create_empty(
        &self,
        tag: TypeTag,
        extent: Extent,
    ) -> Result<Box<dyn BlockArray>, BlockDataError> {
        Ok(self.factory(tag)?.create(extent))
    }

    /// Encodes `array` with the handler for its tag.
    pub fn serialize(&self, array: &dyn BlockArray) -> Result<SerializedArray, BlockDataError> {
        let tag = array.type_tag();
        let bytes = self.handler(tag)?.serialize(array)?;
        Ok(SerializedArray {
            tag,
            extent: array.extent(),
            bytes,
        })
    }

    /// Decodes a payload stored under the raw tag byte `raw_tag`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDataError::UnknownTypeTag`] if `raw_tag` names no
    /// backend, [`BlockDataError::MissingHandler`] if the backend is not
    /// registered, or [`BlockDataError::PayloadLength`] if `bytes` does not
    /// fit the backend's layout at `extent`.
    pub fn deserialize(
        &self,
        raw_tag: u8,
        extent: Extent,
        bytes: &[u8],
    ) -> Result<Box<dyn BlockArray>, BlockDataError> {
        let result = TypeTag::from_u8(raw_tag)
            .ok_or(BlockDataError::UnknownTypeTag(raw_tag))
            .and_then(|tag| self.handler(tag))
            .and_then(|handler| handler.create_array(extent, Some(bytes)));
        if let Err(err) = &result {
            tracing::warn!(raw_tag, ?extent, len = bytes.len(), "block data decode failed: {err}");
        }
        result
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.entries.keys().copied().collect();
        tags.sort_by_key(|tag| tag.as_u8());
        f.debug_struct("HandlerRegistry").field("tags", &tags).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
