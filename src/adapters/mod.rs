//! Concrete implementations of the collaborator ports.

pub mod memory;
