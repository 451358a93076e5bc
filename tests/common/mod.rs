// Shared across every integration test binary; not every binary uses every helper.
#![allow(dead_code)]

pub(crate) mod channel;

pub(crate) mod harness;

pub(crate) mod logging;

pub(crate) mod mem_store;
