//! Type handlers.
//!
//! A type handler knows how to write one runtime type as a fixed-size binary value. Handlers are stateless, and are
//! shared behind a [`TypeHandlerRef`], which erases the concrete value type so that handlers for different types can
//! live side by side in the same catalog.

use std::{
    any::{type_name, Any, TypeId},
    fmt,
    marker::PhantomData,
    sync::Arc,
};

use crate::collections::FastHashMap;

mod defaults;
pub use self::defaults::{F32Handler, F64Handler, I32Handler, I64Handler, StringHandler, U32Handler, U64Handler};

/// Length, in bytes, of the value slot used by string metrics.
pub const STRING_VALUE_LENGTH: usize = 256;

/// Largest value, in bytes, that a type handler may produce.
pub const MAX_VALUE_LENGTH: usize = STRING_VALUE_LENGTH;

/// Semantic type of an exported value.
///
/// The discriminant is the type code written to the backing file.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u32)]
pub enum MetricType {
    /// Signed 32-bit integer.
    I32 = 0,

    /// Unsigned 32-bit integer.
    U32 = 1,

    /// Signed 64-bit integer.
    I64 = 2,

    /// Unsigned 64-bit integer.
    U64 = 3,

    /// 32-bit float.
    F32 = 4,

    /// 64-bit float.
    F64 = 5,

    /// NUL-terminated string in a fixed-size slot.
    String = 6,
}

impl MetricType {
    /// Returns the type code written to the backing file.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Returns the metric type for the given type code, if known.
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::I32,
            1 => Self::U32,
            2 => Self::I64,
            3 => Self::U64,
            4 => Self::F32,
            5 => Self::F64,
            6 => Self::String,
            _ => return None,
        })
    }

    /// Returns the number of bytes a value of this type occupies.
    pub const fn data_length(self) -> usize {
        match self {
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
            Self::String => STRING_VALUE_LENGTH,
        }
    }
}

/// A decoded value, as read back from a backing file.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricValue {
    /// Signed 32-bit integer.
    I32(i32),

    /// Unsigned 32-bit integer.
    U32(u32),

    /// Signed 64-bit integer.
    I64(i64),

    /// Unsigned 64-bit integer.
    U64(u64),

    /// 32-bit float.
    F32(f32),

    /// 64-bit float.
    F64(f64),

    /// String.
    String(String),
}

impl MetricValue {
    /// Decodes a value of the given type from the start of `src`.
    ///
    /// Returns `None` if `src` is shorter than the type's data length, or if a string value is not valid UTF-8.
    pub fn decode(metric_type: MetricType, src: &[u8]) -> Option<Self> {
        let src = src.get(..metric_type.data_length())?;
        Some(match metric_type {
            MetricType::I32 => Self::I32(i32::from_ne_bytes(src.try_into().ok()?)),
            MetricType::U32 => Self::U32(u32::from_ne_bytes(src.try_into().ok()?)),
            MetricType::I64 => Self::I64(i64::from_ne_bytes(src.try_into().ok()?)),
            MetricType::U64 => Self::U64(u64::from_ne_bytes(src.try_into().ok()?)),
            MetricType::F32 => Self::F32(f32::from_ne_bytes(src.try_into().ok()?)),
            MetricType::F64 => Self::F64(f64::from_ne_bytes(src.try_into().ok()?)),
            MetricType::String => {
                let end = src.iter().position(|b| *b == 0).unwrap_or(src.len());
                Self::String(std::str::from_utf8(&src[..end]).ok()?.to_string())
            }
        })
    }

    /// Returns the metric type of this value.
    pub const fn metric_type(&self) -> MetricType {
        match self {
            Self::I32(_) => MetricType::I32,
            Self::U32(_) => MetricType::U32,
            Self::I64(_) => MetricType::I64,
            Self::U64(_) => MetricType::U64,
            Self::F32(_) => MetricType::F32,
            Self::F64(_) => MetricType::F64,
            Self::String(_) => MetricType::String,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I32(v) => write!(f, "{}", v),
            Self::U32(v) => write!(f, "{}", v),
            Self::I64(v) => write!(f, "{}", v),
            Self::U64(v) => write!(f, "{}", v),
            Self::F32(v) => write!(f, "{}", v),
            Self::F64(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "\"{}\"", v),
        }
    }
}

/// Encoder for the fixed binary representation of values of type `T`.
pub trait TypeHandler<T>: Send + Sync + 'static {
    /// Returns the semantic type written by this handler.
    fn metric_type(&self) -> MetricType;

    /// Returns the number of bytes written by [`put_bytes`][Self::put_bytes].
    ///
    /// Must not exceed [`MAX_VALUE_LENGTH`].
    fn data_length(&self) -> usize {
        self.metric_type().data_length()
    }

    /// Writes `value` into `dst`.
    ///
    /// `dst` is always exactly [`data_length`][Self::data_length] bytes long, and every byte of it should be written.
    fn put_bytes(&self, value: &T, dst: &mut [u8]);
}

trait ErasedTypeHandler: Send + Sync {
    fn value_type(&self) -> TypeId;
    fn value_type_name(&self) -> &'static str;
    fn metric_type(&self) -> MetricType;
    fn data_length(&self) -> usize;
    fn put_any(&self, value: &dyn Any, dst: &mut [u8]) -> bool;
}

struct Typed<T, H> {
    handler: H,
    _value: PhantomData<fn(&T)>,
}

impl<T, H> ErasedTypeHandler for Typed<T, H>
where
    T: Any,
    H: TypeHandler<T>,
{
    fn value_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn value_type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn metric_type(&self) -> MetricType {
        self.handler.metric_type()
    }

    fn data_length(&self) -> usize {
        self.handler.data_length()
    }

    fn put_any(&self, value: &dyn Any, dst: &mut [u8]) -> bool {
        match value.downcast_ref::<T>() {
            Some(value) => {
                self.handler.put_bytes(value, dst);
                true
            }
            None => false,
        }
    }
}

/// A shared, type-erased type handler.
///
/// Two references are equal only when they point at the same handler, so cloning a reference is how the same handler
/// gets used for every instance of a metric.
#[derive(Clone)]
pub struct TypeHandlerRef {
    inner: Arc<dyn ErasedTypeHandler>,
}

impl TypeHandlerRef {
    /// Wraps a handler for values of type `T`.
    pub fn new<T, H>(handler: H) -> Self
    where
        T: Any,
        H: TypeHandler<T>,
    {
        Self {
            inner: Arc::new(Typed {
                handler,
                _value: PhantomData,
            }),
        }
    }

    /// Returns the type ID of the values this handler encodes.
    pub fn value_type(&self) -> TypeId {
        self.inner.value_type()
    }

    /// Returns the name of the type of the values this handler encodes.
    pub fn value_type_name(&self) -> &'static str {
        self.inner.value_type_name()
    }

    /// Returns `true` if this handler encodes values of type `T`.
    pub fn handles<T: Any>(&self) -> bool {
        self.value_type() == TypeId::of::<T>()
    }

    /// Returns the semantic type written by this handler.
    pub fn metric_type(&self) -> MetricType {
        self.inner.metric_type()
    }

    /// Returns the number of bytes written by this handler.
    pub fn data_length(&self) -> usize {
        self.inner.data_length()
    }

    /// Encodes `value` into `dst`.
    ///
    /// Returns `false`, leaving `dst` untouched, if `value` is not of the type this handler encodes.
    pub fn put_any(&self, value: &dyn Any, dst: &mut [u8]) -> bool {
        self.inner.put_any(value, dst)
    }

    /// Returns `true` if both references point at the same handler.
    pub fn same_handler(&self, other: &TypeHandlerRef) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.inner), Arc::as_ptr(&other.inner))
    }
}

impl PartialEq for TypeHandlerRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_handler(other)
    }
}

impl Eq for TypeHandlerRef {}

impl fmt::Debug for TypeHandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeHandlerRef")
            .field("value_type", &self.value_type_name())
            .field("metric_type", &self.metric_type())
            .field("data_length", &self.data_length())
            .finish()
    }
}

/// Registry of type handlers, keyed by the runtime type they encode.
#[derive(Clone, Debug)]
pub struct TypeHandlers {
    handlers: FastHashMap<TypeId, TypeHandlerRef>,
}

impl TypeHandlers {
    /// Creates an empty registry.
    pub fn empty() -> Self {
        Self {
            handlers: FastHashMap::default(),
        }
    }

    /// Installs a handler, replacing any existing handler for the same type.
    ///
    /// Returns the replaced handler, if any.
    pub fn register(&mut self, handler: TypeHandlerRef) -> Option<TypeHandlerRef> {
        self.handlers.insert(handler.value_type(), handler)
    }

    /// Returns the handler for values of type `T`, if one is registered.
    pub fn get<T: Any>(&self) -> Option<&TypeHandlerRef> {
        self.handlers.get(&TypeId::of::<T>())
    }

    /// Returns the number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for TypeHandlers {
    /// Creates a registry populated with the default handlers.
    fn default() -> Self {
        let mut handlers = Self::empty();
        defaults::register_defaults(&mut handlers);
        handlers
    }
}
