//! Per-chunk block data storage: fixed-extent 3D arrays holding one small
//! integer per voxel, with pluggable element widths, lock-free conditional
//! updates, online deflation into compact backends, and a tag-driven
//! serialization registry.

pub mod array;
pub mod codec;
pub mod deflate;
pub mod dense;
pub mod error;
pub mod extent;
pub mod handler;
pub mod packed;
pub mod rle;
pub mod slot;
pub mod sparse;
pub mod width;

pub use array::{BlockArray, TypeTag, contents_equal, deflate_array};
pub use codec::{BlobError, decode_blob, decode_blob_with, encode_blob};
pub use deflate::{ColumnDeflator, DeflatePolicy, Deflator, RawLayout};
pub use dense::{DenseArray, DenseArray4Bit, DenseArray8Bit, DenseArray16Bit, dense_copy};
pub use error::BlockDataError;
pub use extent::{Extent, MAX_VOLUME};
pub use handler::{
    ArrayFactory, DenseFactory, DenseHandler, HandlerRegistry, SerializationHandler,
    SerializedArray, SparseFactory, SparseHandler,
};
pub use rle::RleError;
pub use slot::BlockDataSlot;
pub use sparse::{SparseArray, SparseArray4Bit, SparseArray8Bit, SparseArray16Bit};
pub use width::{Bits4, Bits8, Bits16, ElementWidth, fits_bits, narrowest_bits};
