//! PostgreSQL wire protocol primitives: framed reading/writing and the
//! startup-message parser/rewriter.

pub mod reader;
pub mod startup;
pub mod writer;

pub use reader::{read_typed, read_untyped, Reader};
pub use writer::{write_error_response, Writer};
