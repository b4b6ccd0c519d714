//! Shared utility functions for styleforge.

pub mod json_extraction;

pub use json_extraction::{
    extract_code_block, extract_json_from_response, find_matching_brace, parse_json_reply,
    try_extract_json_object, JsonExtractionError,
};
