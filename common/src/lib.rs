#![allow(clippy::match_like_matches_macro)]
#![allow(clippy::module_inception)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]

pub mod api;
pub mod approval;
pub mod chain;
pub mod config;
pub mod fund;
pub mod rebalance;
pub mod risk;
pub mod serde_utils;
pub mod time;
