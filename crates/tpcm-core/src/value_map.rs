//! Typed property dictionaries.
//!
//! A [`ValueMap`] maps string keys to tagged [`Variant`] values. It carries
//! connection parameters, protocol properties and channel request
//! properties. Accessors never panic: a missing key, a value of the wrong
//! type, or an integer that does not fit the requested width all read as
//! `None` (or the type's default for the `*_or_default` forms).

use std::collections::BTreeMap;

use crate::object_path::{ObjectPath, is_valid_object_path};

/// A tagged value.
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Double(f64),
    String(String),
    ObjectPath(ObjectPath),
    Bytes(Vec<u8>),
    StringList(Vec<String>),
    ObjectPathList(Vec<ObjectPath>),
    /// A boxed value whose type is only known at run time.
    Variant(Box<Variant>),
    Map(ValueMap),
    /// Homogeneous array of compound values.
    Array(Vec<Variant>),
    /// Fixed-arity tuple.
    Struct(Vec<Variant>),
}

impl Variant {
    /// The D-Bus type signature of this value.
    pub fn signature(&self) -> String {
        match self {
            Self::Bool(_) => "b".into(),
            Self::Byte(_) => "y".into(),
            Self::Int16(_) => "n".into(),
            Self::UInt16(_) => "q".into(),
            Self::Int32(_) => "i".into(),
            Self::UInt32(_) => "u".into(),
            Self::Int64(_) => "x".into(),
            Self::UInt64(_) => "t".into(),
            Self::Double(_) => "d".into(),
            Self::String(_) => "s".into(),
            Self::ObjectPath(_) => "o".into(),
            Self::Bytes(_) => "ay".into(),
            Self::StringList(_) => "as".into(),
            Self::ObjectPathList(_) => "ao".into(),
            Self::Variant(_) => "v".into(),
            Self::Map(_) => "a{sv}".into(),
            Self::Array(items) => match items.first() {
                Some(first) => format!("a{}", first.signature()),
                None => "av".into(),
            },
            Self::Struct(fields) => {
                let inner: String = fields.iter().map(Variant::signature).collect();
                format!("({inner})")
            }
        }
    }

    /// Looks through any number of `Variant` boxes.
    pub fn unboxed(&self) -> &Variant {
        let mut value = self;
        while let Self::Variant(inner) = value {
            value = inner;
        }
        value
    }

    /// Wraps `self` in a `Variant` box.
    pub fn boxed(self) -> Variant {
        Self::Variant(Box::new(self))
    }

    fn as_integer(&self) -> Option<i128> {
        match *self.unboxed() {
            Self::Byte(v) => Some(v.into()),
            Self::Int16(v) => Some(v.into()),
            Self::Int32(v) => Some(v.into()),
            Self::Int64(v) => Some(v.into()),
            Self::UInt16(v) => Some(v.into()),
            Self::UInt32(v) => Some(v.into()),
            Self::UInt64(v) => Some(v.into()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self.unboxed() {
            Self::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_integer().and_then(|v| u32::try_from(v).ok())
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.as_integer().and_then(|v| i32::try_from(v).ok())
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_integer().and_then(|v| u64::try_from(v).ok())
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_integer().and_then(|v| i64::try_from(v).ok())
    }

    /// Doubles, plus integers that convert exactly.
    pub fn as_f64(&self) -> Option<f64> {
        match self.unboxed() {
            Self::Double(d) => Some(*d),
            other => other
                .as_integer()
                .and_then(|v| i64::try_from(v).ok())
                .filter(|v| v.unsigned_abs() < (1 << 53))
                .map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.unboxed() {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Object paths, and strings holding a syntactically valid path.
    pub fn as_object_path(&self) -> Option<ObjectPath> {
        match self.unboxed() {
            Self::ObjectPath(p) => Some(p.clone()),
            Self::String(s) if is_valid_object_path(s) => ObjectPath::new(s.as_str()).ok(),
            _ => None,
        }
    }

    pub fn as_string_list(&self) -> Option<&[String]> {
        match self.unboxed() {
            Self::StringList(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_object_path_list(&self) -> Option<&[ObjectPath]> {
        match self.unboxed() {
            Self::ObjectPathList(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self.unboxed() {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self.unboxed() {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Variant]> {
        match self.unboxed() {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&[Variant]> {
        match self.unboxed() {
            Self::Struct(fields) => Some(fields),
            _ => None,
        }
    }
}

macro_rules! variant_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Variant {
                fn from(v: $ty) -> Self {
                    Self::$variant(v.into())
                }
            }
        )*
    };
}

variant_from! {
    bool => Bool,
    u8 => Byte,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f64 => Double,
    String => String,
    &str => String,
    ObjectPath => ObjectPath,
    Vec<u8> => Bytes,
    Vec<String> => StringList,
    Vec<ObjectPath> => ObjectPathList,
    ValueMap => Map,
}

/// A string-keyed map of variants whose accessors never panic.
///
/// Keys iterate in sorted order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueMap {
    entries: BTreeMap<String, Variant>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Variant>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts or replaces a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Variant>) -> Option<Variant> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Variant> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Variant> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Variant)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)?.as_bool()
    }

    /// Reads any integer that fits in a `u32`.
    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key)?.as_u32()
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key)?.as_i32()
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key)?.as_u64()
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key)?.as_i64()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_f64()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Reads an object path, validating its syntax.
    pub fn get_object_path(&self, key: &str) -> Option<ObjectPath> {
        self.get(key)?.as_object_path()
    }

    pub fn get_string_list(&self, key: &str) -> Option<&[String]> {
        self.get(key)?.as_string_list()
    }

    pub fn get_object_path_list(&self, key: &str) -> Option<&[ObjectPath]> {
        self.get(key)?.as_object_path_list()
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        self.get(key)?.as_bytes()
    }

    pub fn get_map(&self, key: &str) -> Option<&ValueMap> {
        self.get(key)?.as_map()
    }

    pub fn get_bool_or_default(&self, key: &str) -> bool {
        self.get_bool(key).unwrap_or_default()
    }

    pub fn get_u32_or_default(&self, key: &str) -> u32 {
        self.get_u32(key).unwrap_or_default()
    }

    pub fn get_i32_or_default(&self, key: &str) -> i32 {
        self.get_i32(key).unwrap_or_default()
    }

    pub fn get_u64_or_default(&self, key: &str) -> u64 {
        self.get_u64(key).unwrap_or_default()
    }

    pub fn get_i64_or_default(&self, key: &str) -> i64 {
        self.get_i64(key).unwrap_or_default()
    }

    pub fn get_str_or_default(&self, key: &str) -> &str {
        self.get_str(key).unwrap_or_default()
    }
}

impl<K: Into<String>, V: Into<Variant>> FromIterator<(K, V)> for ValueMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl IntoIterator for ValueMap {
    type Item = (String, Variant);
    type IntoIter = std::collections::btree_map::IntoIter<String, Variant>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
