//! A single field of a recipe and the typed handles bound to it
//!
//! A [`RecipeToken`] knows its name, its catalog type and where its bytes
//! live inside a data package. The value itself lives in the owning recipe's
//! register arena and is addressed through a [`Slot`].

use std::fmt;
use std::marker::PhantomData;

use crate::catalog::{catalog, DataType, Direction, Value, DOF};
use crate::wire;
use crate::{Result, RtdeError};

/// Rust types that can back an RTDE field
pub trait Register: Copy + Default + Send + 'static {
    /// True if a field of `data_type` may be bound to this type
    fn accepts(data_type: DataType) -> bool;

    fn from_value(value: Value) -> Option<Self>;

    fn to_value(self) -> Value;
}

macro_rules! register {
    ($ty:ty, $variant:ident, $($dt:ident)|+) => {
        impl Register for $ty {
            fn accepts(data_type: DataType) -> bool {
                matches!(data_type, $(DataType::$dt)|+)
            }

            fn from_value(value: Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn to_value(self) -> Value {
                Value::$variant(self)
            }
        }
    };
}

register!(bool, Bool, Bool);
register!(u8, U8, Uint8 | String);
register!(u32, U32, Uint32);
register!(u64, U64, Uint64);
register!(i32, I32, Int32);
register!(f64, F64, Double);
register!([f64; 3], Vector3d, Vector3d);
register!([f64; DOF], Vector6d, Vector6d);
register!([i32; DOF], Vector6Int32, Vector6Int32);
register!([u32; DOF], Vector6Uint32, Vector6Uint32);

/// Typed handle to one register of a recipe.
///
/// Only valid for the recipe that handed it out; other recipes reject it.
pub struct Slot<T> {
    pub(crate) index: usize,
    pub(crate) owner: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Slot<T> {
    pub(crate) fn new(index: usize, owner: u64) -> Self {
        Self { index, owner, _marker: PhantomData }
    }

    /// Position of the field within its recipe
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Slot<T> {}

impl<T> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("index", &self.index)
            .field("owner", &self.owner)
            .finish()
    }
}

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.owner == other.owner
    }
}

impl<T> Eq for Slot<T> {}

/// Characters the controller may leave around a type name in a setup reply
fn is_padding(c: char) -> bool {
    c.is_ascii_whitespace() || c == '\x0b' || c == '\x03' || c == '\0'
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecipeToken {
    name: String,
    data_type: DataType,
    offset: usize,
    direction: Direction,
}

impl RecipeToken {
    /// Resolve `name` in the catalog for `direction`.
    ///
    /// An unknown name is not an error here; the token becomes `NotFound`
    /// with zero width and can never be confirmed.
    pub fn new(name: &str, direction: Direction, offset: usize) -> Self {
        Self {
            name: name.to_string(),
            data_type: catalog(direction).lookup(name),
            offset,
            direction,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Byte offset of the field within the data package payload
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn width(&self) -> usize {
        self.data_type.width()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_resolved(&self) -> bool {
        !self.data_type.is_sentinel()
    }

    /// Write `value` into its place in `payload`
    pub fn store(&self, value: &Value, payload: &mut [u8]) -> Result<()> {
        if self.direction != Direction::Input {
            return Err(RtdeError::Precondition(format!(
                "{} is an output field and cannot be stored",
                self.name
            )));
        }
        let end = self.offset + self.width();
        let dst = payload.get_mut(self.offset..end).ok_or_else(|| {
            RtdeError::Precondition(format!("Payload too small to store {}", self.name))
        })?;
        wire::encode_value(self.data_type, value, dst)
    }

    /// Decode this field out of `payload`
    pub fn parse(&self, payload: &[u8]) -> Result<Value> {
        if self.direction != Direction::Output {
            return Err(RtdeError::Precondition(format!(
                "{} is an input field and cannot be parsed",
                self.name
            )));
        }
        let end = self.offset + self.width();
        let src = payload.get(self.offset..end).ok_or_else(|| {
            RtdeError::MalformedFrame(format!("Payload too short for {}", self.name))
        })?;
        wire::decode_value(self.data_type, src)
    }

    /// True if the controller's type name for this field is exactly the
    /// type this token resolved to. The sentinels never confirm.
    pub fn confirm_type(&self, response_type: &str) -> bool {
        if self.data_type.is_sentinel() {
            return false;
        }
        let remote = DataType::from_wire_name(response_type.trim_matches(is_padding));
        !remote.is_sentinel() && remote == self.data_type
    }
}
