//! Remote hostname used to partition every piece of rate, circuit, and cache state.

// std
use std::{borrow::Borrow, ops::Deref};
// self
use crate::_prelude::*;

const DOMAIN_MAX_LEN: usize = 253;

/// Error returned when a domain cannot be derived or validated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ThisError)]
pub enum DomainError {
	/// The URL carried no host component.
	#[error("URL `{url}` has no host.")]
	MissingHost {
		/// Offending URL.
		url: String,
	},
	/// The domain was empty.
	#[error("Domain cannot be empty.")]
	Empty,
	/// The domain contains whitespace or a wildcard character.
	#[error("Domain contains a forbidden character: {domain}.")]
	ForbiddenCharacter {
		/// Offending domain.
		domain: String,
	},
	/// The domain exceeds the DNS length limit.
	#[error("Domain exceeds {max} characters.")]
	TooLong {
		/// Maximum number of characters allowed.
		max: usize,
	},
}

/// Lower-cased remote hostname.
///
/// Domains are never created explicitly by callers of the guard; they are derived from the
/// request URL through [`Domain::from_url`]. The value is embedded verbatim in store keys, so
/// wildcard characters are rejected to keep prefix deletes scoped to a single domain.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Domain(String);
impl Domain {
	/// Creates a domain after validation; the value is lower-cased.
	pub fn new(value: impl AsRef<str>) -> Result<Self, DomainError> {
		let view = value.as_ref().trim();

		validate_view(view)?;

		Ok(Self(view.to_ascii_lowercase()))
	}

	/// Derives the domain from the host component of `url`.
	pub fn from_url(url: &Url) -> Result<Self, DomainError> {
		let host = url.host_str().ok_or_else(|| DomainError::MissingHost { url: url.to_string() })?;

		Self::new(host)
	}

	/// Returns the domain as a string slice.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}
impl Deref for Domain {
	type Target = str;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}
impl AsRef<str> for Domain {
	fn as_ref(&self) -> &str {
		&self.0
	}
}
impl Borrow<str> for Domain {
	fn borrow(&self) -> &str {
		&self.0
	}
}
impl From<Domain> for String {
	fn from(value: Domain) -> Self {
		value.0
	}
}
impl TryFrom<String> for Domain {
	type Error = DomainError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}
impl TryFrom<&Url> for Domain {
	type Error = DomainError;

	fn try_from(value: &Url) -> Result<Self, Self::Error> {
		Self::from_url(value)
	}
}
impl FromStr for Domain {
	type Err = DomainError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::new(s)
	}
}
impl Debug for Domain {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		write!(f, "Domain({})", self.0)
	}
}
impl Display for Domain {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(&self.0)
	}
}

fn validate_view(view: &str) -> Result<(), DomainError> {
	if view.is_empty() {
		return Err(DomainError::Empty);
	}
	if view.chars().count() > DOMAIN_MAX_LEN {
		return Err(DomainError::TooLong { max: DOMAIN_MAX_LEN });
	}
	if view.chars().any(|c| c.is_whitespace() || c == '*' || c == '?') {
		return Err(DomainError::ForbiddenCharacter { domain: view.to_owned() });
	}

	Ok(())
}
