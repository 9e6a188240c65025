//! pwapack: packages a PWA as a signed Android APK.
//!
//! An HTTP service that resolves a site's web app manifest into packaging
//! defaults, validates a build request, and drives an external toolchain
//! (TWA generator, keytool, Gradle, apksigner) to produce a signed APK,
//! streaming progress to the client over SSE.

pub mod config;
pub mod errors;
pub mod fetch;
pub mod jobs;
pub mod manifest;
pub mod options;
pub mod pipeline;
pub mod server;
pub mod ssrf;
pub mod token;
