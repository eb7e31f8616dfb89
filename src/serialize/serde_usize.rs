//! Raw addresses in reports. They go out as `"0x..."` strings, which is what
//! people grep for; plain integers are accepted on the way back in.

use std::{fmt, marker::PhantomData};

use serde::{de::Visitor, Deserializer, Serializer};

pub trait AsUsize: Copy {
    fn as_usize(self) -> usize;
}

pub trait FromUsize: Copy {
    fn from_usize(value: usize) -> Self;
}

impl<T> AsUsize for *const T {
    fn as_usize(self) -> usize {
        self as usize
    }
}

impl<T> FromUsize for *const T {
    fn from_usize(value: usize) -> Self {
        value as Self
    }
}

pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Copy + AsUsize,
{
    serializer.collect_str(&format_args!("{:#x}", (*value).as_usize()))
}

pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromUsize,
{
    struct V<Ptr>(PhantomData<Ptr>);

    impl<'de, Ptr> Visitor<'de> for V<Ptr>
    where
        Ptr: FromUsize,
    {
        type Value = Ptr;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an address, as an integer or a 0x-prefixed hex string")
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            usize::try_from(v)
                .map(Ptr::from_usize)
                .map_err(|_| E::custom(format!("address {v:#x} does not fit in a usize")))
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            let digits = v
                .strip_prefix("0x")
                .ok_or_else(|| E::custom(format!("address {v:?} is missing its 0x prefix")))?;
            usize::from_str_radix(digits, 16)
                .map(Ptr::from_usize)
                .map_err(|e| E::custom(format!("address {v:?}: {e}")))
        }
    }

    deserializer.deserialize_any(V::<T>(PhantomData))
}
