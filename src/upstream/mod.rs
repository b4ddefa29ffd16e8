//! Everything that talks to, or pretends to be a browser for, the origin.

pub mod cookie;
pub mod fetcher;
pub mod headers;

pub use fetcher::{ManifestResponse, OriginFetcher, OriginHeaders, SegmentResponse};
pub use headers::{FetchMode, InboundHeaders, OutboundHeaders, SpoofIdentity};
