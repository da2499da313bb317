pub mod cipher;
pub mod codec;
pub mod error;
pub mod gzip;
pub mod stream;

pub use cipher::CipherCodec;
pub use codec::{Chain, Codec, Flush, Identity, CODEC_BUFSZ};
pub use error::{CodecError, StreamError};
pub use gzip::GzipCodec;
pub use stream::{Stream, TlsSession};
