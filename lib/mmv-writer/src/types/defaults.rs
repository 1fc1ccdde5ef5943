use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};

use super::{MetricType, TypeHandler, TypeHandlerRef, TypeHandlers};

/// Writes signed integers of 32 bits or fewer as [`MetricType::I32`].
#[derive(Clone, Copy, Debug, Default)]
pub struct I32Handler;

/// Writes unsigned integers of 32 bits or fewer, and booleans, as [`MetricType::U32`].
#[derive(Clone, Copy, Debug, Default)]
pub struct U32Handler;

/// Writes signed 64-bit integers as [`MetricType::I64`].
#[derive(Clone, Copy, Debug, Default)]
pub struct I64Handler;

/// Writes unsigned 64-bit integers as [`MetricType::U64`].
#[derive(Clone, Copy, Debug, Default)]
pub struct U64Handler;

/// Writes 32-bit floats as [`MetricType::F32`].
#[derive(Clone, Copy, Debug, Default)]
pub struct F32Handler;

/// Writes 64-bit floats as [`MetricType::F64`].
#[derive(Clone, Copy, Debug, Default)]
pub struct F64Handler;

/// Writes strings as [`MetricType::String`].
///
/// Strings longer than the slot (minus its NUL terminator) are truncated at the last character boundary that fits.
#[derive(Clone, Copy, Debug, Default)]
pub struct StringHandler;

macro_rules! impl_handler {
    ($handler:ty, $metric_type:expr, $wire:ty => $($value:ty: |$v:ident| $convert:expr),+ $(,)?) => {
        $(
            impl TypeHandler<$value> for $handler {
                fn metric_type(&self) -> MetricType {
                    $metric_type
                }

                fn put_bytes(&self, $v: &$value, dst: &mut [u8]) {
                    let wire: $wire = $convert;
                    dst.copy_from_slice(&wire.to_ne_bytes());
                }
            }
        )+
    };
}

impl_handler!(I32Handler, MetricType::I32, i32 =>
    i8: |v| i32::from(*v),
    i16: |v| i32::from(*v),
    i32: |v| *v,
    AtomicI32: |v| v.load(Ordering::Relaxed),
);

impl_handler!(U32Handler, MetricType::U32, u32 =>
    u8: |v| u32::from(*v),
    u16: |v| u32::from(*v),
    u32: |v| *v,
    bool: |v| u32::from(*v),
    AtomicU32: |v| v.load(Ordering::Relaxed),
    AtomicBool: |v| u32::from(v.load(Ordering::Relaxed)),
);

impl_handler!(I64Handler, MetricType::I64, i64 =>
    i64: |v| *v,
    AtomicI64: |v| v.load(Ordering::Relaxed),
);

impl_handler!(U64Handler, MetricType::U64, u64 =>
    u64: |v| *v,
    AtomicU64: |v| v.load(Ordering::Relaxed),
);

impl_handler!(F32Handler, MetricType::F32, f32 => f32: |v| *v);
impl_handler!(F64Handler, MetricType::F64, f64 => f64: |v| *v);

fn put_str(value: &str, dst: &mut [u8]) {
    let limit = dst.len().saturating_sub(1);
    let mut end = value.len().min(limit);
    while !value.is_char_boundary(end) {
        end -= 1;
    }

    dst[..end].copy_from_slice(&value.as_bytes()[..end]);
    dst[end..].fill(0);
}

impl TypeHandler<String> for StringHandler {
    fn metric_type(&self) -> MetricType {
        MetricType::String
    }

    fn put_bytes(&self, value: &String, dst: &mut [u8]) {
        put_str(value, dst);
    }
}

impl TypeHandler<&'static str> for StringHandler {
    fn metric_type(&self) -> MetricType {
        MetricType::String
    }

    fn put_bytes(&self, value: &&'static str, dst: &mut [u8]) {
        put_str(value, dst);
    }
}

pub(super) fn register_defaults(handlers: &mut TypeHandlers) {
    handlers.register(TypeHandlerRef::new::<i8, _>(I32Handler));
    handlers.register(TypeHandlerRef::new::<i16, _>(I32Handler));
    handlers.register(TypeHandlerRef::new::<i32, _>(I32Handler));
    handlers.register(TypeHandlerRef::new::<AtomicI32, _>(I32Handler));

    handlers.register(TypeHandlerRef::new::<u8, _>(U32Handler));
    handlers.register(TypeHandlerRef::new::<u16, _>(U32Handler));
    handlers.register(TypeHandlerRef::new::<u32, _>(U32Handler));
    handlers.register(TypeHandlerRef::new::<bool, _>(U32Handler));
    handlers.register(TypeHandlerRef::new::<AtomicU32, _>(U32Handler));
    handlers.register(TypeHandlerRef::new::<AtomicBool, _>(U32Handler));

    handlers.register(TypeHandlerRef::new::<i64, _>(I64Handler));
    handlers.register(TypeHandlerRef::new::<AtomicI64, _>(I64Handler));

    handlers.register(TypeHandlerRef::new::<u64, _>(U64Handler));
    handlers.register(TypeHandlerRef::new::<AtomicU64, _>(U64Handler));

    handlers.register(TypeHandlerRef::new::<f32, _>(F32Handler));
    handlers.register(TypeHandlerRef::new::<f64, _>(F64Handler));

    handlers.register(TypeHandlerRef::new::<String, _>(StringHandler));
    handlers.register(TypeHandlerRef::new::<&'static str, _>(StringHandler));
}
