use std::fmt::{Display, Formatter};
use std::{env, fmt};

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(serde::Serialize, Clone, Debug, Default)]
pub struct BuildInfo {
	pub version: String,
	pub rust_version: String,
	pub target: String,
}

impl BuildInfo {
	pub fn new() -> Self {
		BuildInfo {
			version: BUILD_VERSION.to_string(),
			rust_version: option_env!("CARGO_PKG_RUST_VERSION")
				.unwrap_or("unknown")
				.to_string(),
			target: env::consts::ARCH.to_string(),
		}
	}
}

impl Display for BuildInfo {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"version.BuildInfo{{Version:\"{}\", RustVersion:\"{}\", Target:\"{}\"}}",
			self.version, self.rust_version, self.target
		)
	}
}
