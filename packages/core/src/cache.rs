use paste::paste;
use serde::{Deserialize, Serialize};

/// Defines the possible values that can be stored in the value and metadata caches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum CacheValue {
    Bool(bool),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Float(f32),
    String(String),
    Buffer(Vec<u8>),
}

pub trait Cache<TKey> {
    fn read(&self, key: &TKey) -> Option<CacheValue>;
    fn write(&mut self, key: &TKey, value: CacheValue);
    fn write_many(&mut self, values: impl Iterator<Item = (TKey, CacheValue)>);
    fn delete(&mut self, key: &TKey);
}

pub trait CacheExt<TKey> {
    fn read_bool(&self, key: &TKey) -> Option<bool>;
    fn read_u8(&self, key: &TKey) -> Option<u8>;
    fn read_u16(&self, key: &TKey) -> Option<u16>;
    fn read_u32(&self, key: &TKey) -> Option<u32>;
    fn read_i8(&self, key: &TKey) -> Option<i8>;
    fn read_i16(&self, key: &TKey) -> Option<i16>;
    fn read_i32(&self, key: &TKey) -> Option<i32>;
    fn read_f32(&self, key: &TKey) -> Option<f32>;
    fn read_string(&self, key: &TKey) -> Option<String>;
    fn read_buffer(&self, key: &TKey) -> Option<Vec<u8>>;

    fn write_bool(&mut self, key: &TKey, value: bool);
    fn write_u8(&mut self, key: &TKey, value: u8);
    fn write_u16(&mut self, key: &TKey, value: u16);
    fn write_u32(&mut self, key: &TKey, value: u32);
    fn write_i8(&mut self, key: &TKey, value: i8);
    fn write_i16(&mut self, key: &TKey, value: i16);
    fn write_i32(&mut self, key: &TKey, value: i32);
    fn write_f32(&mut self, key: &TKey, value: f32);
    fn write_string(&mut self, key: &TKey, value: String);
    fn write_buffer(&mut self, key: &TKey, value: Vec<u8>);
}

macro_rules! impl_cache_read_write {
    ($name:ident, $ty:ty, $variant:ident) => {
        paste! {
            fn [<read_ $name>](&self, key: &TKey) -> Option<$ty> {
                match self.read(key) {
                    Some(CacheValue::$variant(value)) => Some(value),
                    _ => None,
                }
            }

            fn [<write_ $name>](&mut self, key: &TKey, value: $ty) {
                self.write(key, CacheValue::$variant(value));
            }
        }
    };
}

impl<TKey, T> CacheExt<TKey> for T
where
    T: Cache<TKey>,
{
    impl_cache_read_write!(bool, bool, Bool);
    impl_cache_read_write!(u8, u8, UInt8);
    impl_cache_read_write!(u16, u16, UInt16);
    impl_cache_read_write!(u32, u32, UInt32);
    impl_cache_read_write!(i8, i8, Int8);
    impl_cache_read_write!(i16, i16, Int16);
    impl_cache_read_write!(i32, i32, Int32);
    impl_cache_read_write!(f32, f32, Float);
    impl_cache_read_write!(string, String, String);
    impl_cache_read_write!(buffer, Vec<u8>, Buffer);
}
