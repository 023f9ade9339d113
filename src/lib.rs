pub mod buffer;
pub mod codec;
pub mod error;
pub mod index;
pub mod map;

pub use buffer::{SegmentedBuffer, DEFAULT_REGION_SIZE, MIN_FILE_SIZE};
pub use codec::{BytesDecode, BytesEncode, Plain, Raw, Utf8};
pub use error::{Error, Result};
pub use index::IndexStore;
pub use map::{DiskMap, Options, StringMap, StringU64Map};
