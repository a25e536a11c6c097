//! Process-wide type-to-codec registry: `Serialize`/`Deserialize`/`SizedRead`/`SizedWrite`
//! traits plus a registry keyed by `std::any::TypeId`, so the reflective dispatch path can look
//! serializers and deserializers up by runtime type identity rather than a call-site-known type.

use crate::error::{FrameError, RegistrationError};
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::io;
use std::sync::RwLock;

/// Augmented `io::Write` aware of remaining free capacity in the destination. Every `Serialize`
/// impl must check this before writing.
pub trait SizedWrite: io::Write {
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` aware of remaining data in the source. Every deserializer must consult
/// this before reading; insufficient data is a failure that does not advance the reader.
pub trait SizedRead: io::Read {
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl SizedWrite for io::Cursor<Vec<u8>> {
    #[inline]
    fn free_capacity(&self) -> usize {
        usize::MAX - self.position() as usize
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl<'a> SizedRead for io::Cursor<&'a Vec<u8>> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

/// Types that can be written into a message payload.
pub trait Serialize {
    fn serialize(&self, stream: &mut dyn SizedWrite) -> Result<(), FrameError>;
}

/// Types that can be read back out of a message payload.
pub trait Deserialize: Sized {
    fn deserialize(stream: &mut dyn SizedRead) -> Result<Self, FrameError>;
}

macro_rules! impl_primitive_codec {
    ($ty:ty, $size:expr, $write_fn:ident, $read_fn:ident) => {
        impl Serialize for $ty {
            #[inline]
            fn serialize(&self, stream: &mut dyn SizedWrite) -> Result<(), FrameError> {
                if stream.free_capacity() < $size {
                    return Err(FrameError::SizeOverflow);
                }
                stream.$write_fn::<LE>(*self)?;
                Ok(())
            }
        }

        impl Deserialize for $ty {
            #[inline]
            fn deserialize(stream: &mut dyn SizedRead) -> Result<Self, FrameError> {
                if stream.remaining_data() < $size {
                    return Err(FrameError::Incomplete);
                }
                Ok(stream.$read_fn::<LE>()?)
            }
        }
    };
}

impl Serialize for u8 {
    #[inline]
    fn serialize(&self, stream: &mut dyn SizedWrite) -> Result<(), FrameError> {
        if stream.free_capacity() < 1 {
            return Err(FrameError::SizeOverflow);
        }
        stream.write_u8(*self)?;
        Ok(())
    }
}

impl Deserialize for u8 {
    #[inline]
    fn deserialize(stream: &mut dyn SizedRead) -> Result<Self, FrameError> {
        if stream.remaining_data() < 1 {
            return Err(FrameError::Incomplete);
        }
        Ok(stream.read_u8()?)
    }
}

impl Serialize for i8 {
    #[inline]
    fn serialize(&self, stream: &mut dyn SizedWrite) -> Result<(), FrameError> {
        if stream.free_capacity() < 1 {
            return Err(FrameError::SizeOverflow);
        }
        stream.write_i8(*self)?;
        Ok(())
    }
}

impl Deserialize for i8 {
    #[inline]
    fn deserialize(stream: &mut dyn SizedRead) -> Result<Self, FrameError> {
        if stream.remaining_data() < 1 {
            return Err(FrameError::Incomplete);
        }
        Ok(stream.read_i8()?)
    }
}

impl_primitive_codec!(u16, 2, write_u16, read_u16);
impl_primitive_codec!(i16, 2, write_i16, read_i16);
impl_primitive_codec!(u32, 4, write_u32, read_u32);
impl_primitive_codec!(i32, 4, write_i32, read_i32);
impl_primitive_codec!(u64, 8, write_u64, read_u64);
impl_primitive_codec!(i64, 8, write_i64, read_i64);
impl_primitive_codec!(f32, 4, write_f32, read_f32);
impl_primitive_codec!(f64, 8, write_f64, read_f64);

/// A 64-bit tick count, encoded as a signed integer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Timestamp(pub i64);

impl Serialize for Timestamp {
    #[inline]
    fn serialize(&self, stream: &mut dyn SizedWrite) -> Result<(), FrameError> {
        self.0.serialize(stream)
    }
}

impl Deserialize for Timestamp {
    #[inline]
    fn deserialize(stream: &mut dyn SizedRead) -> Result<Self, FrameError> {
        Ok(Timestamp(i64::deserialize(stream)?))
    }
}

/// Length-prefixed UTF-8 string. Length = -1 denotes null, 0 denotes empty.
/// `None` round-trips to the null encoding; `Some(String)` round-trips to the length+bytes form.
impl Serialize for Option<String> {
    fn serialize(&self, stream: &mut dyn SizedWrite) -> Result<(), FrameError> {
        match self {
            None => (-1i32).serialize(stream),
            Some(s) => {
                let bytes = s.as_bytes();
                if bytes.len() > i32::MAX as usize {
                    return Err(FrameError::SizeOverflow);
                }
                (bytes.len() as i32).serialize(stream)?;
                if stream.free_capacity() < bytes.len() {
                    return Err(FrameError::SizeOverflow);
                }
                stream.write_all(bytes)?;
                Ok(())
            }
        }
    }
}

impl Deserialize for Option<String> {
    fn deserialize(stream: &mut dyn SizedRead) -> Result<Self, FrameError> {
        let len = i32::deserialize(stream)?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(FrameError::InvalidStringLength(len));
        }
        let len = len as usize;
        if stream.remaining_data() < len {
            return Err(FrameError::Incomplete);
        }
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf)?;
        String::from_utf8(buf).map(Some).map_err(|_| FrameError::InvalidStringLength(-2))
    }
}

/// 2-component float vector.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Serialize for Vec2 {
    fn serialize(&self, stream: &mut dyn SizedWrite) -> Result<(), FrameError> {
        self.x.serialize(stream)?;
        self.y.serialize(stream)
    }
}

impl Deserialize for Vec2 {
    fn deserialize(stream: &mut dyn SizedRead) -> Result<Self, FrameError> {
        Ok(Vec2 {
            x: f32::deserialize(stream)?,
            y: f32::deserialize(stream)?,
        })
    }
}

/// 3-component float vector.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Serialize for Vec3 {
    fn serialize(&self, stream: &mut dyn SizedWrite) -> Result<(), FrameError> {
        self.x.serialize(stream)?;
        self.y.serialize(stream)?;
        self.z.serialize(stream)
    }
}

impl Deserialize for Vec3 {
    fn deserialize(stream: &mut dyn SizedRead) -> Result<Self, FrameError> {
        Ok(Vec3 {
            x: f32::deserialize(stream)?,
            y: f32::deserialize(stream)?,
            z: f32::deserialize(stream)?,
        })
    }
}

type BoxedSerializer = Box<dyn Fn(&dyn Any, &mut dyn SizedWrite) -> Result<(), FrameError> + Send + Sync>;
type BoxedDeserializer = Box<dyn Fn(&mut dyn SizedRead) -> Result<Box<dyn Any>, FrameError> + Send + Sync>;

/// Process-wide mapping from a type identifier to a serializer and a deserializer.
/// Re-registration for the same type replaces the prior entry. Lookup failure at registration
/// time for a reflective handler is a `RegistrationError`; lookup failure at runtime (which
/// should not happen once registration succeeded) is treated as a fatal configuration error.
pub struct CodecRegistry {
    serializers: RwLock<HashMap<TypeId, BoxedSerializer>>,
    deserializers: RwLock<HashMap<TypeId, BoxedDeserializer>>,
}

impl CodecRegistry {
    pub fn new() -> CodecRegistry {
        CodecRegistry {
            serializers: RwLock::new(HashMap::new()),
            deserializers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `T`'s `Serialize`/`Deserialize` impls under its `TypeId`.
    pub fn register<T>(&self)
    where
        T: Serialize + Deserialize + Any + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<T>();

        self.serializers.write().unwrap().insert(
            type_id,
            Box::new(|value: &dyn Any, stream: &mut dyn SizedWrite| {
                value
                    .downcast_ref::<T>()
                    .expect("type mismatch in serializer registry")
                    .serialize(stream)
            }),
        );

        self.deserializers.write().unwrap().insert(
            type_id,
            Box::new(|stream: &mut dyn SizedRead| -> Result<Box<dyn Any>, FrameError> {
                Ok(Box::new(T::deserialize(stream)?))
            }),
        );
    }

    /// Whether a deserializer is registered for `T`. Checked eagerly at reflective-handler
    /// registration time so missing codecs fail the registration, not the message.
    pub fn has<T: Any + 'static>(&self) -> bool {
        self.deserializers.read().unwrap().contains_key(&TypeId::of::<T>())
    }

    pub fn require<T: Any + 'static>(&self) -> Result<(), RegistrationError> {
        if self.has::<T>() {
            Ok(())
        } else {
            Err(RegistrationError::MissingCodec {
                type_name: std::any::type_name::<T>(),
            })
        }
    }

    /// Serializes `value` using the registered codec for `T`. Panics if none was registered —
    /// by the time this is reachable, registration-time validation must already have failed.
    pub fn serialize<T: Any + Send + Sync + 'static>(
        &self,
        value: &T,
        stream: &mut dyn SizedWrite,
    ) -> Result<(), FrameError> {
        let serializers = self.serializers.read().unwrap();
        let serializer = serializers
            .get(&TypeId::of::<T>())
            .unwrap_or_else(|| panic!("missing codec for {}", std::any::type_name::<T>()));
        serializer(value, stream)
    }

    /// Deserializes a `T` from `stream` using the registered codec.
    pub fn deserialize<T: Any + 'static>(&self, stream: &mut dyn SizedRead) -> Result<T, FrameError> {
        let deserializers = self.deserializers.read().unwrap();
        let deserializer = deserializers
            .get(&TypeId::of::<T>())
            .unwrap_or_else(|| panic!("missing codec for {}", std::any::type_name::<T>()));
        let boxed = deserializer(stream)?;
        Ok(*boxed
            .downcast::<T>()
            .expect("type mismatch in deserializer registry"))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A tuple of reflectively-decodable parameters. Implemented for tuples up to 8
/// elements, each of which must have a registered codec; `check_codecs` is what a reflective
/// handler's registration calls eagerly so a missing codec fails the registration rather than
/// silently dropping every matching message at dispatch time.
pub trait ArgsCodec: Sized {
    fn check_codecs(registry: &CodecRegistry) -> Result<(), RegistrationError>;
    fn decode(stream: &mut dyn SizedRead, registry: &CodecRegistry) -> Result<Self, FrameError>;
}

impl ArgsCodec for () {
    fn check_codecs(_registry: &CodecRegistry) -> Result<(), RegistrationError> {
        Ok(())
    }

    fn decode(_stream: &mut dyn SizedRead, _registry: &CodecRegistry) -> Result<Self, FrameError> {
        Ok(())
    }
}

macro_rules! impl_args_codec_tuple {
    ($($T:ident),+) => {
        impl<$($T: Any + 'static),+> ArgsCodec for ($($T,)+) {
            fn check_codecs(registry: &CodecRegistry) -> Result<(), RegistrationError> {
                $(registry.require::<$T>()?;)+
                Ok(())
            }

            fn decode(stream: &mut dyn SizedRead, registry: &CodecRegistry) -> Result<Self, FrameError> {
                Ok(($(registry.deserialize::<$T>(stream)?,)+))
            }
        }
    };
}

impl_args_codec_tuple!(A);
impl_args_codec_tuple!(A, B);
impl_args_codec_tuple!(A, B, C);
impl_args_codec_tuple!(A, B, C, D);
impl_args_codec_tuple!(A, B, C, D, E);
impl_args_codec_tuple!(A, B, C, D, E, F);
impl_args_codec_tuple!(A, B, C, D, E, F, G);
impl_args_codec_tuple!(A, B, C, D, E, F, G, H);

/// Populates the pre-registered primitive codecs: byte, 16/32/64-bit signed and
/// unsigned integers, 32/64-bit float, timestamp, length-prefixed string, 2/3-component vector.
pub fn install_defaults(registry: &CodecRegistry) {
    registry.register::<u8>();
    registry.register::<i8>();
    registry.register::<u16>();
    registry.register::<i16>();
    registry.register::<u32>();
    registry.register::<i32>();
    registry.register::<u64>();
    registry.register::<i64>();
    registry.register::<f32>();
    registry.register::<f64>();
    registry.register::<Timestamp>();
    registry.register::<Option<String>>();
    registry.register::<Vec2>();
    registry.register::<Vec3>();
}
