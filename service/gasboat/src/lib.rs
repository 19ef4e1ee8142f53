pub mod digest_tracker;
pub mod election;
pub mod env;
pub mod health;
pub mod reactor;
pub mod reconciler;
pub mod reporter;
pub mod supervisor;
pub mod upgrade;

#[cfg(test)]
pub mod testutil;

/// The version baked into health payloads and startup banners.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
