//! # IO Module
//!
//! Conversions between domain types and the serializable DTOs in `shared`.

pub mod mappers;

pub use mappers::TickMapper;
