pub mod decoder;
pub mod encoder;
pub mod error;
pub mod format;
pub mod model;
pub mod primitives;

pub use crate::decoder::parallel::ParallelDecoder;
pub use crate::decoder::selective::SelectiveDecoder;
pub use crate::decoder::{decode, Decoder};
pub use crate::encoder::parallel::ParallelEncoder;
pub use crate::encoder::{Encoder, EncoderConfig};
pub use crate::error::{ChaosError, Result};
pub use crate::format::Dictionary;
pub use crate::model::{Custom, List, Object, Value, ValueType};
