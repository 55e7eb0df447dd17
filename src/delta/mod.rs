//! Binary delta windows
//!
//! The wire format is svndiff: a `"SVN"` magic plus version byte, then a
//! sequence of windows. Each window pairs a view into some source text with
//! an instruction stream producing a run of target text. Submodules cover
//! the in-memory model and application ([`window`]), the wire codec
//! ([`svndiff`]), window composition ([`compose`]) and the window producer
//! used by deltification ([`diff`]).

pub mod compose;
pub mod diff;
pub mod svndiff;
pub mod window;

pub use compose::{compose_windows, ComposeCtx};
pub use diff::DeltaStream;
pub use svndiff::{SvndiffEmitter, SVNDIFF_MAGIC, SVNDIFF_VERSION};
pub use window::{apply_window, Op, OpKind, Window};

/// Bytes of target text covered by one delta window.
///
/// Source and target are windowed in lockstep at this size, so the windows
/// of every representation in a delta chain line up at identical offsets.
pub const WINDOW_SIZE: usize = 102_400;
