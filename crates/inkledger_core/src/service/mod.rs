//! Command surface of the ledger core.
//!
//! # Responsibility
//! - Accept typed task, category and document commands.
//! - Keep callers decoupled from event store and projection details.

pub mod command_bus;

pub use command_bus::{
    CommandBus, CommandBusOptions, CommandError, CommandReceipt, CommandResult,
};
