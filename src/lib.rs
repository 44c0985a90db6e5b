//! Subversion client core.
//!
//! Two halves share this crate:
//!
//! - **Remote access.** [`RaSvnClient`] opens [`RaSvnSession`]s over the
//!   `svn://` protocol (plain TCP, a caller-supplied stream, or an
//!   `svn+ssh://` tunnel), and [`http::HttpConnection`] speaks HTTP/WebDAV.
//!   Both negotiate credentials through an [`auth::AuthManager`].
//! - **Text.** [`sequence`] splits sources into lines and diffs them with a
//!   bounded anchor search; [`merge`] builds a three-way merge on top;
//!   [`delta`] applies svndiff streams.
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use svn_core::auth::AuthManager;
//! use svn_core::{RaSvnClient, SvnUrl};
//!
//! fn main() -> svn_core::Result<()> {
//!     let rt = tokio::runtime::Builder::new_current_thread()
//!         .enable_all()
//!         .build()?;
//!
//!     rt.block_on(async {
//!         let url = SvnUrl::parse("svn://example.com/repo")?;
//!         let client = RaSvnClient::new(url)
//!             .with_auth_manager(AuthManager::with_credentials("alice", "secret"))
//!             .with_read_timeout(Duration::from_secs(30));
//!
//!         // A session reuses one connection and caches server info.
//!         let mut session = client.open_session().await?;
//!         let latest = session.get_latest_rev().await?;
//!         println!("{latest}");
//!         Ok(())
//!     })
//! }
//! ```
//!
//! ## Features
//!
//! - `serde`: enables `Serialize`/`Deserialize` for public data types.
//! - `ssh`: enables `ssh::RusshSessionFactory` for `svn+ssh://` URLs.
//!
//! ## Protocol notes
//!
//! - `ra_svn` authentication mechanisms: `EXTERNAL`, `ANONYMOUS`, `PLAIN`
//!   and `CRAM-MD5`.
//! - HTTP authentication schemes: `Basic` and `Digest` (MD5, `qop=auth`).
//! - TLS is not built in; supply it through [`transport::Connector`].
//!
//! ## Low-level access
//!
//! For raw wire items and the tuple template grammar, see [`raw`].

#![deny(unsafe_code)]

pub mod auth;
pub mod cancel;
mod client;
pub mod delta;
mod error;
pub mod http;
pub mod merge;
mod path;
mod rasvn;
pub mod sequence;
pub mod ssh;
pub mod transport;
mod types;
mod url;

pub use client::{RaSvnClient, RaSvnSession};
pub use error::{ServerError, ServerErrorItem, SvnError};
/// Convenience alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, SvnError>;
pub use merge::{MergeMarkers, MergeStatus};
/// Low-level wire-protocol types and helpers.
pub mod raw {
    pub use crate::rasvn::template::{marshal, unmarshal};
    pub use crate::rasvn::{Slot, SvnItem, Template};
}
pub use sequence::{BlockKind, DiffBlock, DiffOptions, LineDiff};
pub use transport::ConnectionState;
pub use types::{Capability, GetFileResult, NodeKind, PropertyList, RepositoryInfo, ServerInfo};
pub use url::{Scheme, SvnUrl};
