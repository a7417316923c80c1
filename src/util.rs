use crate::errors::{Error, Result};
use num_traits::FromPrimitive;

pub(crate) trait FromModemInt
where
    Self: Sized,
{
    fn from_integer(i: u32) -> Result<Self>;
}
impl<T> FromModemInt for T
where
    T: FromPrimitive,
{
    fn from_integer(i: u32) -> Result<T> {
        T::from_u32(i).ok_or_else(|| Error::Protocol(format!("value out of range: {}", i)))
    }
}

/// Parses one decimal field out of a response row.
pub(crate) fn int_field(fields: &[String], i: usize, what: &str) -> Result<u32> {
    fields
        .get(i)
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("missing or non-numeric {} field", what)))
}
