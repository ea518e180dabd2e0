//! x86_64 architecture glue.
//!
//! The IDT stub reads CR2 and the error code, then hands both to
//! [`fault::handle_page_fault`].

pub mod fault;
