//! Host values to wire values and back.
//!
//! The wire format is [`WasmValue`], a closed union of the four numeric
//! value types. Encoding goes through [`IntoWasmValue`] / [`CallArgs`],
//! decoding through [`FromWasmValue`] / [`CallResults`]. Decoding never
//! converts: the tag must match the requested type exactly.

use std::fmt;

use wasmtime::{Val, ValType};

use wasm_sandbox_common::RuntimeError;

/// Wire value category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl ValueKind {
    /// Category of a Wasmtime value type. Reference and vector types have none.
    pub fn of(ty: &ValType) -> Option<Self> {
        match ty {
            ValType::I32 => Some(Self::I32),
            ValType::I64 => Some(Self::I64),
            ValType::F32 => Some(Self::F32),
            ValType::F64 => Some(Self::F64),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::I32 => write!(f, "i32"),
            ValueKind::I64 => write!(f, "i64"),
            ValueKind::F32 => write!(f, "f32"),
            ValueKind::F64 => write!(f, "f64"),
        }
    }
}

/// A value crossing the host/guest boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WasmValue {
    /// 32-bit integer (also guest pointers).
    I32(i32),
    /// 64-bit integer.
    I64(i64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
}

impl WasmValue {
    /// The value's category.
    pub fn kind(&self) -> ValueKind {
        match self {
            WasmValue::I32(_) => ValueKind::I32,
            WasmValue::I64(_) => ValueKind::I64,
            WasmValue::F32(_) => ValueKind::F32,
            WasmValue::F64(_) => ValueKind::F64,
        }
    }
}

impl From<WasmValue> for Val {
    fn from(value: WasmValue) -> Self {
        match value {
            WasmValue::I32(v) => Val::I32(v),
            WasmValue::I64(v) => Val::I64(v),
            WasmValue::F32(v) => Val::F32(v.to_bits()),
            WasmValue::F64(v) => Val::F64(v.to_bits()),
        }
    }
}

impl TryFrom<&Val> for WasmValue {
    type Error = RuntimeError;

    fn try_from(value: &Val) -> Result<Self, Self::Error> {
        match value {
            Val::I32(v) => Ok(WasmValue::I32(*v)),
            Val::I64(v) => Ok(WasmValue::I64(*v)),
            Val::F32(bits) => Ok(WasmValue::F32(f32::from_bits(*bits))),
            Val::F64(bits) => Ok(WasmValue::F64(f64::from_bits(*bits))),
            other => Err(RuntimeError::type_mismatch(
                "numeric value",
                format!("{other:?}"),
            )),
        }
    }
}

/// Encode a host value for the guest.
pub trait IntoWasmValue {
    /// The wire value. Unsigned integers keep their bit pattern.
    fn into_wasm_value(self) -> WasmValue;
}

/// Decode a guest value into a host type.
pub trait FromWasmValue: Sized {
    /// The only wire category this type decodes from.
    const KIND: ValueKind;

    /// Decode `value`.
    ///
    /// # Errors
    ///
    /// Returns `TypeMismatch` if the tag is not [`Self::KIND`].
    fn from_wasm_value(value: WasmValue) -> Result<Self, RuntimeError>;
}

macro_rules! impl_scalar {
    ($($ty:ty => $variant:ident as $wire:ty),* $(,)?) => {
        $(
            impl IntoWasmValue for $ty {
                #[allow(clippy::cast_possible_wrap, clippy::unnecessary_cast)]
                fn into_wasm_value(self) -> WasmValue {
                    WasmValue::$variant(self as $wire)
                }
            }

            impl FromWasmValue for $ty {
                const KIND: ValueKind = ValueKind::$variant;

                #[allow(clippy::cast_sign_loss, clippy::unnecessary_cast)]
                fn from_wasm_value(value: WasmValue) -> Result<Self, RuntimeError> {
                    match value {
                        WasmValue::$variant(v) => Ok(v as $ty),
                        other => Err(RuntimeError::type_mismatch(
                            Self::KIND.to_string(),
                            other.kind().to_string(),
                        )),
                    }
                }
            }
        )*
    };
}

impl_scalar! {
    i32 => I32 as i32,
    u32 => I32 as i32,
    i64 => I64 as i64,
    u64 => I64 as i64,
    f32 => F32 as f32,
    f64 => F64 as f64,
}

/// An argument list, encoded left to right.
pub trait CallArgs {
    /// Number of arguments.
    const ARITY: usize;

    /// Encode every argument.
    fn encode(self) -> Vec<WasmValue>;
}

/// A result list, decoded left to right.
pub trait CallResults: Sized {
    /// Number of results.
    const ARITY: usize;

    /// Wire category of each result, left to right.
    fn kinds() -> Vec<ValueKind>;

    /// Decode exactly [`Self::ARITY`] values.
    ///
    /// # Errors
    ///
    /// Returns `TypeMismatch` on a count or tag mismatch.
    fn decode(values: &[WasmValue]) -> Result<Self, RuntimeError>;
}

macro_rules! impl_call_tuples {
    ($($arity:literal => ($($name:ident),*);)*) => {
        $(
            impl<$($name: IntoWasmValue),*> CallArgs for ($($name,)*) {
                const ARITY: usize = $arity;

                #[allow(non_snake_case)]
                fn encode(self) -> Vec<WasmValue> {
                    let ($($name,)*) = self;
                    vec![$($name.into_wasm_value()),*]
                }
            }

            impl<$($name: FromWasmValue),*> CallResults for ($($name,)*) {
                const ARITY: usize = $arity;

                fn kinds() -> Vec<ValueKind> {
                    vec![$($name::KIND),*]
                }

                #[allow(unused_mut, unused_variables, unused_assignments)]
                fn decode(values: &[WasmValue]) -> Result<Self, RuntimeError> {
                    let arity = <Self as CallResults>::ARITY;
                    if values.len() != arity {
                        return Err(RuntimeError::type_mismatch(
                            format!("{arity} results"),
                            format!("{} results", values.len()),
                        ));
                    }
                    let mut index = 0;
                    Ok(($({
                        let value = $name::from_wasm_value(values[index])?;
                        index += 1;
                        value
                    },)*))
                }
            }
        )*
    };
}

impl_call_tuples! {
    0 => ();
    1 => (A1);
    2 => (A1, A2);
    3 => (A1, A2, A3);
    4 => (A1, A2, A3, A4);
    5 => (A1, A2, A3, A4, A5);
    6 => (A1, A2, A3, A4, A5, A6);
    7 => (A1, A2, A3, A4, A5, A6, A7);
    8 => (A1, A2, A3, A4, A5, A6, A7, A8);
}
