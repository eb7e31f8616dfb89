#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub mod assert;
pub mod hint;
pub mod num;
