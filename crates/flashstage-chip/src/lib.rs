//! Silicon model for the QUADSPI flash controller and its serial NOR device.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the parts the staging pipeline talks to: the controller
//! register map, the NOR device command set, the memory map, and the fixed
//! asset layout written into flash.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | QUADSPI register offsets and bit fields (CR, DCR, SR, FCR, DLR, CCR, AR, DR) |
//! | [`nor`] | IS25LP128F opcodes, per-protocol dummy cycles, geometry |
//! | [`memmap`] | Memory-mapped window placement and size |
//! | [`layout`] | Asset header format and default flash offsets |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod layout;
pub mod memmap;
pub mod nor;
pub mod regs;
