use crate::encoding::{DecodeError, Decoder, Encoder};

/// The lowest precision an asset may register with.
pub const MIN_PRECISION: u8 = 0;
/// The highest precision an asset may register with (whole fixed64 scale).
pub const MAX_PRECISION: u8 = 8;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Asset {
    pub name: String,
    pub precision: u8,
}

impl Asset {
    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_var_str(&self.name);
        encoder.write_u8(self.precision);
    }

    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let name = decoder.read_var_str()?;
        let precision = decoder.read_u8()?;
        Ok(Self { name, precision })
    }
}
