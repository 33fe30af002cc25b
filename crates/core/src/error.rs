use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("truncation suffix is {suffix_len} characters, longer than the {limit} limit of {max}")]
    SuffixTooLong {
        suffix_len: usize,
        limit: &'static str,
        max: usize,
    },
}
