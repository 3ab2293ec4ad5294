//! Silicon model for the FPGA-hosted deep-learning accelerator (DLA) IP.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of what the IP exposes to the host: CSR offsets and bit
//! fields, the identity ROM, external-memory word sizes, the debug network
//! protocol constants, and the stream-controller mailbox layout.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`csr`] | Per-instance CSR window: offsets, interrupt and descriptor-diagnostic bits |
//! | [`rom`] | Identity ROM layout (architecture hash, build version, architecture name) |
//! | [`layout`] | External-memory word sizes and descriptor-queue geometry |
//! | [`debug_net`] | Debug-network request encoding and retry budget |
//! | [`mailbox`] | Stream-controller mailbox framing, message types, status codes |
//! | [`board`] | Per-board platform constants (instance count, DDR size, clocks) |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod board;
pub mod csr;
pub mod debug_net;
pub mod layout;
pub mod mailbox;
pub mod rom;
