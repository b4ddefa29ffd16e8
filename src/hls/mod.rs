pub mod rewriter;

pub use rewriter::{ManifestLine, ProxyEndpoint, RewriteContext, rewrite};
