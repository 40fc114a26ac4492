//! Prefixed line echo protocol.
//!
//! Every newline-terminated line a client sends is written straight back on
//! the same connection with the configured prefix and a single space in front
//! of it:
//!
//! ```text
//! Request:  hello\n
//! Response: LOG: hello\n
//! ```
//!
//! Bytes are passed through unmodified, so lines need not be valid UTF-8 and
//! a trailing `\r` is echoed like any other byte. There is no maximum line
//! length. Data left over when the client closes without a final `\n` is
//! discarded without a response.

pub mod handler;
pub mod parser;

pub use handler::handle_connection;
