//! Hierarchical state machines built with `statig`.

pub mod boot_sm;
