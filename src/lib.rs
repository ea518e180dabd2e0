//! ParyantaOS physical memory: frame allocation and copy-on-write.
//!
//! Provides:
//! - A reference-counted physical frame allocator behind one spinlock
//! - x86_64 address spaces whose duplication shares frames copy-on-write
//! - The write-fault resolver that un-shares those frames lazily
//!
//! The kernel image owns boot, interrupt tables and the log sink; it
//! calls [`memory::init`] once and routes page faults to
//! [`arch::fault::handle_page_fault`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod memory;
