//! The `svn://` wire protocol.
//!
//! Items are S-expression-like tokens: words, numbers, length-prefixed
//! strings, booleans and parenthesized lists. Commands are
//! `( command ( params... ) )`; responses are `( success ( ... ) )` or
//! `( failure ( error... ) )`. [`template`] binds tuples to typed slots.

pub(crate) mod conn;
mod item;
pub(crate) mod parse;
mod reader;
pub mod template;

pub use item::SvnItem;
pub use template::{Slot, Template};
