pub mod codec;
pub mod json;

pub use codec::{decrypt, encrypt};
pub use json::{gzip_compress, gzip_decompress, tag_bigint, tag_map, untag_bigint, untag_map};
