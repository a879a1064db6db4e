//! A collection of utilities for Rust projects.

#![doc = include_str!("../README.md")]
#![deny(
    clippy::nursery,
    clippy::pedantic,
    warnings,
    missing_docs,
    unused_crate_dependencies
)]

pub mod serde;

/// Ensure that a condition is true, otherwise return an error.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err.into());
        }
    };
}

#[cfg(test)]
mod tests {
    fn check(value: u8) -> Result<u8, String> {
        ensure!(value < 10, format!("{value} is too large"));
        Ok(value)
    }

    #[test]
    fn ensure_returns_error_when_condition_fails() {
        assert_eq!(check(3), Ok(3));
        assert_eq!(check(12), Err("12 is too large".to_string()));
    }
}
