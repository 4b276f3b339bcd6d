//! The wire protocol family.
//!
//! Three layers, each depending only on the one below:
//!
//! * [`wire`]: the fixed-layout frame for a single (key, record) pair and
//!   the batch helpers built on it.
//! * [`header`]: the batch, reduced and fragment headers. All three carry
//!   their magic at the same byte offset so a receiver can disambiguate any
//!   frame by peeking seven bytes.
//! * [`fragment`]: splitting an oversized frame into bounded fragments and
//!   reassembling them in any arrival order.

pub mod fragment;
pub mod header;
pub mod wire;
