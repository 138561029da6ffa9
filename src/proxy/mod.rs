//! Object serving: path mapping, MIME classification, playlist rewriting,
//! and the streaming fetch pipeline.

pub mod fetch;
pub mod mime;
pub mod path;
pub mod playlist;

pub use fetch::FetchPipeline;
pub use path::{parse_object_path, ObjectPath};
pub use playlist::{rewrite_playlist, RewriteContext};
