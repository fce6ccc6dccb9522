// Because of the nature of this crate, there are lots of times we cast aliased types to `u64`
// Often, on 64-bit platforms, it's already that, so Clippy gets upset at the u64-to-u64
// conversion.
#![allow(clippy::useless_conversion)]

pub mod context;
pub mod error;
pub mod file_opener;
pub mod fixup;
pub mod gc;
pub mod image;
pub mod init;
pub mod loader;
pub mod macho;
pub mod mapper;
pub mod notify;
pub mod path_resolver;
pub mod platform;
pub mod shared_cache;
