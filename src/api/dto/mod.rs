//! Data Transfer Objects for REST request/response serialization.
//!
//! Amounts are integers in the smallest currency unit.

pub mod admin_dto;
pub mod common_dto;
pub mod dispute_dto;
pub mod marketplace_dto;
pub mod wallet_dto;

pub use admin_dto::*;
pub use common_dto::*;
pub use dispute_dto::*;
pub use marketplace_dto::*;
pub use wallet_dto::*;
