//! JSON bridge for VM values
//!
//! Plain data crosses in both directions: null, booleans, numbers, strings
//! and tables. A table whose keys are exactly `1..=n` becomes an array, any
//! other table an object with stringified keys. Functions, threads and user
//! data have no JSON form.

mod deserializer;
mod serializer;

pub use deserializer::{from_json, from_json_str};
pub use serializer::{to_json, to_json_string};
