//! Utility functions shared by the pipeline stages.
//!
//! ## Block Parameter Parsing (`block_param`)
//! - Tags (`latest`, `safe`, ...), decimal and hex numbers, EIP-1898 hash selectors
//! - Quantity formatting in node style (`0x` without leading zeros)
//!
//! ## Streaming JSON Rewrites (`json_rewrite`)
//! - Transaction-array reduction for `eth_getBlockByNumber(N, false)`
//! - Member removal for `newHeads` notifications
//! - Array splitting/joining and member listing over borrowed raw slices

pub mod block_param;
pub mod json_rewrite;

pub use block_param::{
    hex_from_value, parse_hex, to_hex, BlockId, BlockRef, BlockTag, ParseError as BlockParseError,
};
pub use json_rewrite::{array_items, join_array, members, reduce_transactions, remove_member};
