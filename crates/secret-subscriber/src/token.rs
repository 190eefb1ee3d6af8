// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Redacting wrapper for bearer tokens and identity tokens.
//!
//! Tokens pass through `tracing` fields and `Debug` output of the structs that
//! hold them. [`Sensitive`] keeps them out of both and zeroes the memory when
//! the value is dropped.
//!
//! ```
//! use secret_subscriber::Sensitive;
//!
//! let token = Sensitive::new("eyJhbGciOi".to_string());
//! assert_eq!(format!("{token}"), "[REDACTED]");
//! assert_eq!(token.expose(), "eyJhbGciOi");
//! ```

use std::fmt;

use zeroize::Zeroize;

/// Placeholder printed instead of a sensitive value.
pub const REDACTED: &str = "[REDACTED]";

/// A value that must never appear in logs.
///
/// There is no `Deref`; reading the value requires an explicit
/// [`Sensitive::expose`] call.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct Sensitive<T: Zeroize> {
	inner: T,
}

/// Sensitive string, the only instantiation this crate needs.
pub type SensitiveString = Sensitive<String>;

impl<T: Zeroize> Sensitive<T> {
	pub fn new(inner: T) -> Self {
		Self { inner }
	}

	/// Access the wrapped value.
	pub fn expose(&self) -> &T {
		&self.inner
	}
}

impl<T: Zeroize + Clone> Clone for Sensitive<T> {
	fn clone(&self) -> Self {
		Self::new(self.inner.clone())
	}
}

impl<T: Zeroize> fmt::Debug for Sensitive<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("Sensitive").field(&REDACTED).finish()
	}
}

impl<T: Zeroize> fmt::Display for Sensitive<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(REDACTED)
	}
}

impl<T: Zeroize + PartialEq> PartialEq for Sensitive<T> {
	fn eq(&self, other: &Self) -> bool {
		self.inner == other.inner
	}
}

impl<T: Zeroize + Eq> Eq for Sensitive<T> {}

impl From<String> for SensitiveString {
	fn from(value: String) -> Self {
		Self::new(value)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn debug_and_display_are_redacted() {
		let token = Sensitive::new("st.abc.def".to_string());
		assert_eq!(format!("{token}"), REDACTED);
		assert_eq!(format!("{token:?}"), "Sensitive(\"[REDACTED]\")");
	}

	#[test]
	fn optional_token_debug_is_redacted() {
		let token: Option<SensitiveString> = Some("st.abc.def".to_string().into());
		let debug = format!("{token:?}");
		assert!(!debug.contains("st.abc.def"));
	}

	#[test]
	fn clone_keeps_value() {
		let token = Sensitive::new("value".to_string());
		assert_eq!(token.clone(), token);
		assert_eq!(token.clone().expose(), "value");
	}

	proptest! {
		#[test]
		fn formatted_output_never_contains_value(inner in "[a-zA-Z0-9._-]{4,64}") {
			prop_assume!(!REDACTED.contains(inner.as_str()));
			prop_assume!(!"Sensitive".contains(inner.as_str()));

			let token = Sensitive::new(inner.clone());
			let displayed = format!("{token}");
			let debugged = format!("{token:?}");
			prop_assert!(!displayed.contains(&inner));
			prop_assert!(!debugged.contains(&inner));
		}
	}
}
