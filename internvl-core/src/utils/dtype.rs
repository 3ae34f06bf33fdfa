use candle_core::DType;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum DTypeConversionError {
    #[error("`{0}` is not a supported Candle data type.")]
    Unsupported(String),
}

/// Parse either a torch-style name (`bfloat16`) or a short name (`bf16`).
pub fn parse_dtype(dtype: &str) -> Result<DType, DTypeConversionError> {
    Ok(match dtype {
        "float32" | "float" | "f32" => DType::F32,
        "float16" | "half" | "f16" => DType::F16,
        "bfloat16" | "bf16" => DType::BF16,
        other => return Err(DTypeConversionError::Unsupported(other.to_string())),
    })
}
