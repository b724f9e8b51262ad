//! Frame Codec
//!
//! The transport's view of the wire. Requests arrive as nested frames,
//! responses and events leave as frames. The command layer works on decoded
//! [`Frame`] values only.
//!
//! ## Modules
//!
//! - `types`: the [`Frame`] enum and its serialization
//! - `parser`: incremental decoder for incoming bytes
//!
//! ## Example
//!
//! ```
//! use flashgate::protocol::{parse_frame, Frame};
//!
//! let data = b"*3\r\n+INIT\r\n:1\r\n:1\r\n";
//! let (frame, consumed) = parse_frame(data).unwrap().unwrap();
//! assert_eq!(consumed, data.len());
//! assert_eq!(frame.as_array().unwrap()[0], Frame::simple("INIT"));
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_frame, FrameError, FrameParser, FrameResult};
pub use types::Frame;
