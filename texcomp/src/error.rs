use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("input length {actual} is not a multiple of the {expected_multiple} byte block size")]
    InvalidDataLength {
        expected_multiple: usize,
        actual: usize,
    },
}
